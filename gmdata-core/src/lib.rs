//! This crate implements the core of gmdata: a lossless codec for GameMaker `data.win`
//! containers and the bytecode analysis built on top of it.
//!
//! This mostly includes the chunk directory, the entity graph with its offset resolver, the
//! instruction decoder and encoder, the disassembler and the control-flow graph builder.

#![allow(clippy::uninlined_format_args)]

pub mod analysis;
pub mod bytecode;
pub mod cursor;
pub mod error;
pub mod format;

pub use error::{Error, Result, Warning, WarningKind, Warnings};
pub use format::{Chunk, ChunkBody, Container, LoadOptions, Loaded, Serialized, Tag};
