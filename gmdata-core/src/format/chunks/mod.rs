//! Entity models of the chunks that are decoded rather than carried as bytes.

pub mod code;
pub mod func;
pub mod strg;
pub mod vari;

pub use code::{Bytecode, Code, CodeBody, CodeEntry};
pub use func::{CodeLocals, Function, Functions, LocalVar};
pub use strg::{GmString, Strings};
pub use vari::{Variable, Variables};
