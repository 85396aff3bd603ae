use crate::cursor::Cursor;
use crate::error::{Error, Result};
use crate::format::resolver::{RefKind, Reference};

use super::instruction::{BranchTarget, Instruction, InstructionKind, PushValue};
use super::opcode::{ComparisonKind, DataType, InstanceType, InstructionClass, Opcode};

/// Branch field value of the `popenv` that exits a `with` block.
pub const POPENV_EXIT_MAGIC: u32 = 0xF0_0000;

/// Mask of the next-occurrence field inside a variable or function operand word.
pub const CHAIN_MASK: u32 = 0x07FF_FFFF;

fn sign_extend_23(v: u32) -> i32 {
    ((v << 9) as i32) >> 9
}

fn chain_ref<T>(word: u32) -> Reference<T> {
    Reference::unresolved(word & CHAIN_MASK, RefKind::from_bits((word >> 24) as u8))
}

/// Decode the instruction at the cursor. `origin` is the cursor position of the blob start.
///
/// Variable and function operands come back unresolved, holding their raw next-occurrence
/// field. String operands hold the raw string-table index.
pub fn decode_one(c: &mut Cursor, origin: usize) -> Result<Instruction> {
    let address = (c.position() - origin) as u32;
    let word = c
        .read_u32()
        .map_err(|_| Error::corrupt(address, "truncated instruction word"))?;

    let op_byte = (word >> 24) as u8;
    let opcode = Opcode::from_repr(op_byte)
        .ok_or_else(|| Error::corrupt(address, format!("unknown opcode {op_byte:#04x}")))?;
    let ty1 = DataType::from_nibble((word >> 16) as u8);
    let ty2_bits = (word >> 20) & 0xF;
    let ty2 = DataType::from_nibble(ty2_bits as u8);
    let value16 = word as u16;

    let require = |ok: bool, what: &str| -> Result<()> {
        if ok {
            Ok(())
        } else {
            Err(Error::corrupt(
                address,
                format!("{opcode} with non-zero {what} ({word:#010x})"),
            ))
        }
    };
    let operand = |c: &mut Cursor| -> Result<u32> {
        c.read_u32()
            .map_err(|_| Error::corrupt(address, format!("{opcode} operand runs past the blob")))
    };

    let kind = match opcode.class() {
        InstructionClass::SingleType => {
            require(ty2_bits == 0, "second type")?;
            InstructionKind::SingleType {
                ty: ty1,
                extra: value16,
            }
        }
        InstructionClass::DoubleType => {
            require(value16 == 0, "operand")?;
            InstructionKind::DoubleType { ty1, ty2 }
        }
        InstructionClass::Comparison => {
            require(value16 & 0xFF == 0, "low operand byte")?;
            let raw = (value16 >> 8) as u8;
            let cmp = ComparisonKind::from_repr(raw).ok_or_else(|| {
                Error::corrupt(address, format!("unknown comparison kind {raw}"))
            })?;
            InstructionKind::Comparison { ty1, ty2, cmp }
        }
        InstructionClass::Branch => {
            let field = word & 0xFF_FFFF;
            if field == POPENV_EXIT_MAGIC && opcode == Opcode::PopEnv {
                InstructionKind::Branch(BranchTarget::PopEnvExit)
            } else {
                require(field & 0x80_0000 == 0, "branch bit 23")?;
                InstructionKind::Branch(BranchTarget::Offset(sign_extend_23(field)))
            }
        }
        InstructionClass::Pop => {
            let instance = InstanceType(value16 as i16);
            let destination = if ty1 == DataType::Int16 {
                None
            } else {
                Some(chain_ref(operand(c)?))
            };
            InstructionKind::Pop {
                ty1,
                ty2,
                instance,
                destination,
            }
        }
        InstructionClass::Push => {
            require(ty2_bits == 0, "second type")?;
            let value = match ty1 {
                DataType::Int16 => PushValue::Int16(value16 as i16),
                DataType::Variable => PushValue::Variable {
                    instance: InstanceType(value16 as i16),
                    variable: chain_ref(operand(c)?),
                },
                _ => {
                    require(value16 == 0, "operand")?;
                    match ty1 {
                        DataType::Int32 => PushValue::Int32(operand(c)? as i32),
                        DataType::Float => PushValue::Float(f32::from_bits(operand(c)?)),
                        DataType::Bool => match operand(c)? {
                            0 => PushValue::Bool(false),
                            1 => PushValue::Bool(true),
                            other => {
                                return Err(Error::corrupt(
                                    address,
                                    format!("boolean operand {other:#x}"),
                                ))
                            }
                        },
                        DataType::String => {
                            PushValue::String(Reference::unresolved(operand(c)?, RefKind::Normal))
                        }
                        DataType::Int64 => {
                            let lo = operand(c)? as u64;
                            let hi = operand(c)? as u64;
                            PushValue::Int64((hi << 32 | lo) as i64)
                        }
                        DataType::Double => {
                            let lo = operand(c)? as u64;
                            let hi = operand(c)? as u64;
                            PushValue::Double(f64::from_bits(hi << 32 | lo))
                        }
                        _ => PushValue::Raw(operand(c)?),
                    }
                }
            };
            InstructionKind::Push { ty: ty1, value }
        }
        InstructionClass::Call => {
            require(ty2_bits == 0, "second type")?;
            InstructionKind::Call {
                ty: ty1,
                argc: value16,
                function: chain_ref(operand(c)?),
            }
        }
        InstructionClass::Break => {
            require(ty2_bits == 0, "second type")?;
            let argument = if ty1 == DataType::Int32 {
                Some(operand(c)? as i32)
            } else {
                None
            };
            InstructionKind::Break {
                ty: ty1,
                selector: value16 as i16,
                argument,
            }
        }
    };

    Ok(Instruction::new(address, opcode, kind))
}

/// Decode a whole bytecode blob.
pub fn decode_blob(bytes: &[u8]) -> Result<Vec<Instruction>> {
    if bytes.len() % 4 != 0 {
        return Err(Error::corrupt(
            (bytes.len() & !3) as u32,
            format!("blob length {:#x} is not word aligned", bytes.len()),
        ));
    }
    let mut c = Cursor::new(bytes);
    let mut out = Vec::with_capacity(bytes.len() / 8);
    while c.remaining() > 0 {
        out.push(decode_one(&mut c, 0)?);
    }
    Ok(out)
}
