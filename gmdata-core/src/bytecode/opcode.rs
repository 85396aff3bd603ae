use std::fmt;

use strum::{Display, EnumIter, FromRepr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, FromRepr)]
#[strum(serialize_all = "lowercase")]
#[repr(u8)]
pub enum Opcode {
    Conv = 0x07,
    Mul = 0x08,
    Div = 0x09,
    Rem = 0x0A,
    Mod = 0x0B,
    Add = 0x0C,
    Sub = 0x0D,
    And = 0x0E,
    Or = 0x0F,
    Xor = 0x10,
    Neg = 0x11,
    Not = 0x12,
    Shl = 0x13,
    Shr = 0x14,
    Cmp = 0x15,
    Pop = 0x45,
    PushI = 0x84,
    Dup = 0x86,
    CallV = 0x99,
    Ret = 0x9C,
    Exit = 0x9D,
    Popz = 0x9E,
    B = 0xB6,
    Bt = 0xB7,
    Bf = 0xB8,
    PushEnv = 0xBA,
    PopEnv = 0xBB,
    Push = 0xC0,
    PushLoc = 0xC1,
    PushGlb = 0xC2,
    PushBltn = 0xC3,
    Call = 0xD9,
    Break = 0xFF,
}

/// Operand layout family shared by a group of opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstructionClass {
    SingleType,
    DoubleType,
    Comparison,
    Branch,
    Pop,
    Push,
    Call,
    Break,
}

impl Opcode {
    pub fn class(self) -> InstructionClass {
        use Opcode::*;
        match self {
            Neg | Not | Dup | Ret | Exit | Popz | CallV => InstructionClass::SingleType,
            Conv | Mul | Div | Rem | Mod | Add | Sub | And | Or | Xor | Shl | Shr => {
                InstructionClass::DoubleType
            }
            Cmp => InstructionClass::Comparison,
            B | Bt | Bf | PushEnv | PopEnv => InstructionClass::Branch,
            Pop => InstructionClass::Pop,
            Push | PushLoc | PushGlb | PushBltn | PushI => InstructionClass::Push,
            Call => InstructionClass::Call,
            Break => InstructionClass::Break,
        }
    }
}

/// Operand type nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Double,
    Float,
    Int32,
    Int64,
    Bool,
    Variable,
    String,
    Int16,
    Raw(u8),
}

impl DataType {
    pub fn from_nibble(n: u8) -> Self {
        match n & 0xF {
            0 => DataType::Double,
            1 => DataType::Float,
            2 => DataType::Int32,
            3 => DataType::Int64,
            4 => DataType::Bool,
            5 => DataType::Variable,
            6 => DataType::String,
            0xF => DataType::Int16,
            other => DataType::Raw(other),
        }
    }

    pub fn nibble(self) -> u8 {
        match self {
            DataType::Double => 0,
            DataType::Float => 1,
            DataType::Int32 => 2,
            DataType::Int64 => 3,
            DataType::Bool => 4,
            DataType::Variable => 5,
            DataType::String => 6,
            DataType::Int16 => 0xF,
            DataType::Raw(n) => n & 0xF,
        }
    }

    /// Extra operand words a push of this type carries after the instruction word.
    pub fn push_words(self) -> u32 {
        match self {
            DataType::Double | DataType::Int64 => 2,
            DataType::Int16 => 0,
            _ => 1,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Double => f.write_str("d"),
            DataType::Float => f.write_str("f"),
            DataType::Int32 => f.write_str("i"),
            DataType::Int64 => f.write_str("l"),
            DataType::Bool => f.write_str("b"),
            DataType::Variable => f.write_str("v"),
            DataType::String => f.write_str("s"),
            DataType::Int16 => f.write_str("e"),
            DataType::Raw(n) => write!(f, "t{n:x}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromRepr)]
#[strum(serialize_all = "UPPERCASE")]
#[repr(u8)]
pub enum ComparisonKind {
    Lt = 1,
    Lte = 2,
    Eq = 3,
    Neq = 4,
    Gte = 5,
    Gt = 6,
}

/// Instance qualifier of a variable access. Non-negative values are object indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceType(pub i16);

impl InstanceType {
    pub const SELF: InstanceType = InstanceType(-1);
    pub const OTHER: InstanceType = InstanceType(-2);
    pub const ALL: InstanceType = InstanceType(-3);
    pub const NOONE: InstanceType = InstanceType(-4);
    pub const GLOBAL: InstanceType = InstanceType(-5);
    pub const BUILTIN: InstanceType = InstanceType(-6);
    pub const LOCAL: InstanceType = InstanceType(-7);
    pub const STACKTOP: InstanceType = InstanceType(-9);
    pub const ARG: InstanceType = InstanceType(-15);
    pub const STATIC: InstanceType = InstanceType(-16);

    pub fn name(self) -> Option<&'static str> {
        Some(match self.0 {
            -1 => "self",
            -2 => "other",
            -3 => "all",
            -4 => "noone",
            -5 => "global",
            -6 => "builtin",
            -7 => "local",
            -9 => "stacktop",
            -15 => "arg",
            -16 => "static",
            _ => return None,
        })
    }
}

impl fmt::Display for InstanceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "{}", self.0),
        }
    }
}

const BREAK_NAMES: &[(i16, &str)] = &[
    (-1, "chkindex"),
    (-2, "pushaf"),
    (-3, "popaf"),
    (-4, "pushac"),
    (-5, "setowner"),
    (-6, "isstaticok"),
    (-7, "setstatic"),
    (-8, "savearef"),
    (-9, "restorearef"),
    (-10, "chknullish"),
    (-11, "pushref"),
];

/// Name of an extended (`break`-encoded) operation.
pub fn break_name(selector: i16) -> Option<&'static str> {
    BREAK_NAMES
        .iter()
        .find(|(s, _)| *s == selector)
        .map(|(_, name)| *name)
}
