pub mod cfg;
pub mod decode;
pub mod disasm;
pub mod encode;
pub mod instruction;
pub mod opcode;

pub use cfg::{Block, Cfg};
pub use instruction::{BranchTarget, CodeView, Instruction, InstructionKind, PushValue};
pub use opcode::{ComparisonKind, DataType, InstanceType, Opcode};
