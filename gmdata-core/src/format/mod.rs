//! The `data.win` container: chunk directory, offset resolution and the entity models.

pub mod chains;
pub mod chunks;
pub mod container;
pub mod directory;
pub mod resolver;

pub use container::{Chunk, ChunkBody, Container, LoadOptions, Loaded, Serialized};
pub use directory::Tag;
