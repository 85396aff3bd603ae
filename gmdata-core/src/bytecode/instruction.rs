use crate::format::chunks::func::Function;
use crate::format::chunks::strg::GmString;
use crate::format::chunks::vari::Variable;
use crate::format::resolver::Reference;

use super::opcode::{ComparisonKind, DataType, InstanceType, InstructionClass, Opcode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchTarget {
    /// Signed distance in 4-byte words from the branch instruction itself.
    Offset(i32),
    /// The `popenv` that leaves a `with` block early. It has no control-flow successor of its own.
    PopEnvExit,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PushValue {
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float(f32),
    Double(f64),
    Bool(bool),
    String(Reference<GmString>),
    Variable {
        instance: InstanceType,
        variable: Reference<Variable>,
    },
    /// Operand word of an unrecognised type nibble.
    Raw(u32),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InstructionKind {
    /// `extra` is the low half-word (dup size, callv argc); zero for the rest.
    SingleType { ty: DataType, extra: u16 },
    DoubleType { ty1: DataType, ty2: DataType },
    Comparison {
        ty1: DataType,
        ty2: DataType,
        cmp: ComparisonKind,
    },
    Branch(BranchTarget),
    /// A pop without a destination is the stack-swap form (`pop.e.v`); `instance` then holds the
    /// raw swap operand.
    Pop {
        ty1: DataType,
        ty2: DataType,
        instance: InstanceType,
        destination: Option<Reference<Variable>>,
    },
    Push { ty: DataType, value: PushValue },
    Call {
        ty: DataType,
        argc: u16,
        function: Reference<Function>,
    },
    Break {
        ty: DataType,
        selector: i16,
        argument: Option<i32>,
    },
}

impl InstructionKind {
    pub fn class(&self) -> InstructionClass {
        match self {
            InstructionKind::SingleType { .. } => InstructionClass::SingleType,
            InstructionKind::DoubleType { .. } => InstructionClass::DoubleType,
            InstructionKind::Comparison { .. } => InstructionClass::Comparison,
            InstructionKind::Branch(_) => InstructionClass::Branch,
            InstructionKind::Pop { .. } => InstructionClass::Pop,
            InstructionKind::Push { .. } => InstructionClass::Push,
            InstructionKind::Call { .. } => InstructionClass::Call,
            InstructionKind::Break { .. } => InstructionClass::Break,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Instruction {
    /// Byte offset from the start of the bytecode blob that holds the instruction.
    pub address: u32,
    pub opcode: Opcode,
    pub kind: InstructionKind,
}

impl Instruction {
    pub fn new(address: u32, opcode: Opcode, kind: InstructionKind) -> Self {
        Self {
            address,
            opcode,
            kind,
        }
    }

    /// Encoded size in bytes, always a multiple of four.
    pub fn size(&self) -> u32 {
        let extra_words = match &self.kind {
            InstructionKind::Push { ty, .. } => ty.push_words(),
            InstructionKind::Pop { destination, .. } => destination.is_some() as u32,
            InstructionKind::Call { .. } => 1,
            InstructionKind::Break { argument, .. } => argument.is_some() as u32,
            _ => 0,
        };
        4 * (1 + extra_words)
    }

    #[inline]
    pub fn next_address(&self) -> u32 {
        self.address + self.size()
    }

    /// Absolute (blob-relative) jump target, `None` for non-branches and the magic `popenv`.
    pub fn branch_target(&self) -> Option<i64> {
        match self.kind {
            InstructionKind::Branch(BranchTarget::Offset(words)) => {
                Some(self.address as i64 + 4 * words as i64)
            }
            _ => None,
        }
    }

    pub fn variable(&self) -> Option<&Reference<Variable>> {
        match &self.kind {
            InstructionKind::Pop {
                destination: Some(v),
                ..
            } => Some(v),
            InstructionKind::Push {
                value: PushValue::Variable { variable, .. },
                ..
            } => Some(variable),
            _ => None,
        }
    }

    pub fn variable_mut(&mut self) -> Option<&mut Reference<Variable>> {
        match &mut self.kind {
            InstructionKind::Pop {
                destination: Some(v),
                ..
            } => Some(v),
            InstructionKind::Push {
                value: PushValue::Variable { variable, .. },
                ..
            } => Some(variable),
            _ => None,
        }
    }

    pub fn function(&self) -> Option<&Reference<Function>> {
        match &self.kind {
            InstructionKind::Call { function, .. } => Some(function),
            _ => None,
        }
    }

    pub fn function_mut(&mut self) -> Option<&mut Reference<Function>> {
        match &mut self.kind {
            InstructionKind::Call { function, .. } => Some(function),
            _ => None,
        }
    }
}

/// The instructions of one code entry, addressed relative to the entry's own start.
///
/// Child entries share their parent's blob; `base` is where the entry begins inside it.
#[derive(Debug, Clone, Copy)]
pub struct CodeView<'a> {
    pub instructions: &'a [Instruction],
    pub base: u32,
    pub length: u32,
}

impl<'a> CodeView<'a> {
    pub fn new(instructions: &'a [Instruction], base: u32, length: u32) -> Self {
        Self {
            instructions,
            base,
            length,
        }
    }

    /// A view over a whole stand-alone instruction list.
    pub fn whole(instructions: &'a [Instruction]) -> Self {
        let length = instructions.last().map(|i| i.next_address()).unwrap_or(0);
        Self::new(instructions, 0, length)
    }

    #[inline]
    pub fn relative(&self, inst: &Instruction) -> u32 {
        inst.address - self.base
    }

    /// Entry-relative jump target.
    pub fn target_of(&self, inst: &Instruction) -> Option<i64> {
        inst.branch_target().map(|t| t - self.base as i64)
    }
}
