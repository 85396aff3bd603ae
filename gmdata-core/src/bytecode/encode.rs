use crate::cursor::Writer;
use crate::error::{Error, Result};
use crate::format::chunks::func::Function;
use crate::format::chunks::vari::Variable;
use crate::format::resolver::{Id, RefKind, Reference, Target};

use super::decode::{CHAIN_MASK, POPENV_EXIT_MAGIC};
use super::instruction::{BranchTarget, Instruction, InstructionKind, PushValue};
use super::opcode::{DataType, Opcode};

const BRANCH_MIN: i32 = -(1 << 22);
const BRANCH_MAX: i32 = (1 << 22) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChainTarget {
    Variable(Id<Variable>),
    Function(Id<Function>),
}

/// A resolved variable or function operand whose next-occurrence field is filled in once every
/// blob has been written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainSlot {
    pub instruction_at: usize,
    pub operand_at: usize,
    pub target: ChainTarget,
    pub kind: RefKind,
}

fn word(opcode: Opcode, ty2: u8, ty1: DataType, value16: u16) -> u32 {
    (opcode as u32) << 24 | (ty2 as u32 & 0xF) << 20 | (ty1.nibble() as u32) << 16 | value16 as u32
}

fn push_matches(ty: DataType, value: &PushValue) -> bool {
    matches!(
        (ty, value),
        (DataType::Int16, PushValue::Int16(_))
            | (DataType::Int32, PushValue::Int32(_))
            | (DataType::Int64, PushValue::Int64(_))
            | (DataType::Float, PushValue::Float(_))
            | (DataType::Double, PushValue::Double(_))
            | (DataType::Bool, PushValue::Bool(_))
            | (DataType::String, PushValue::String(_))
            | (DataType::Variable, PushValue::Variable { .. })
            | (DataType::Raw(_), PushValue::Raw(_))
    )
}

struct Encoder<'a> {
    w: &'a mut Writer,
    chains: &'a mut Vec<ChainSlot>,
    start: usize,
    inst: &'a Instruction,
}

impl Encoder<'_> {
    fn fail(&self, reason: impl Into<String>) -> Error {
        Error::unencodable(self.inst.address, reason)
    }

    fn chain<T>(&mut self, r: &Reference<T>, target: impl FnOnce(Id<T>) -> ChainTarget) -> Result<()> {
        let kind = (r.kind.bits() as u32) << 24;
        match r.target {
            Target::Unresolved(raw) => {
                if raw & !CHAIN_MASK != 0 {
                    return Err(self.fail(format!("raw reference field {raw:#x} exceeds 27 bits")));
                }
                self.w.write_u32(raw | kind);
            }
            Target::Resolved(id) => {
                self.chains.push(ChainSlot {
                    instruction_at: self.start,
                    operand_at: self.w.position(),
                    target: target(id),
                    kind: r.kind,
                });
                self.w.write_u32(kind);
            }
        }
        Ok(())
    }

    fn run(&mut self) -> Result<()> {
        let inst = self.inst;
        let opcode = inst.opcode;
        if opcode.class() != inst.kind.class() {
            return Err(self.fail(format!(
                "{opcode} is a {:?} opcode but carries {:?} operands",
                opcode.class(),
                inst.kind.class()
            )));
        }

        match &inst.kind {
            InstructionKind::SingleType { ty, extra } => {
                self.w.write_u32(word(opcode, 0, *ty, *extra));
            }
            InstructionKind::DoubleType { ty1, ty2 } => {
                self.w.write_u32(word(opcode, ty2.nibble(), *ty1, 0));
            }
            InstructionKind::Comparison { ty1, ty2, cmp } => {
                self.w.write_u32(word(opcode, ty2.nibble(), *ty1, (*cmp as u16) << 8));
            }
            InstructionKind::Branch(target) => {
                let field = match *target {
                    BranchTarget::PopEnvExit if opcode == Opcode::PopEnv => POPENV_EXIT_MAGIC,
                    BranchTarget::PopEnvExit => {
                        return Err(self.fail(format!("{opcode} cannot carry the popenv exit marker")))
                    }
                    BranchTarget::Offset(words) if (BRANCH_MIN..=BRANCH_MAX).contains(&words) => {
                        words as u32 & 0x7F_FFFF
                    }
                    BranchTarget::Offset(words) => {
                        return Err(self.fail(format!("branch offset {words} does not fit 23 bits")))
                    }
                };
                self.w.write_u32((opcode as u32) << 24 | field);
            }
            InstructionKind::Pop {
                ty1,
                ty2,
                instance,
                destination,
            } => {
                match (destination, *ty1 == DataType::Int16) {
                    (None, false) => return Err(self.fail("pop without a destination variable")),
                    (Some(_), true) => return Err(self.fail("swap-form pop cannot name a variable")),
                    _ => {}
                }
                self.w.write_u32(word(opcode, ty2.nibble(), *ty1, instance.0 as u16));
                if let Some(dest) = destination {
                    self.chain(dest, ChainTarget::Variable)?;
                }
            }
            InstructionKind::Push { ty, value } => {
                if !push_matches(*ty, value) {
                    return Err(self.fail(format!("push.{ty} carries {value:?}")));
                }
                let value16 = match value {
                    PushValue::Int16(v) => *v as u16,
                    PushValue::Variable { instance, .. } => instance.0 as u16,
                    _ => 0,
                };
                self.w.write_u32(word(opcode, 0, *ty, value16));
                match value {
                    PushValue::Int16(_) => {}
                    PushValue::Int32(v) => self.w.write_i32(*v),
                    PushValue::Int64(v) => self.w.write_i64(*v),
                    PushValue::Float(v) => self.w.write_f32(*v),
                    PushValue::Double(v) => self.w.write_f64(*v),
                    PushValue::Bool(v) => self.w.write_u32(*v as u32),
                    PushValue::Raw(v) => self.w.write_u32(*v),
                    PushValue::String(s) => match s.target {
                        Target::Resolved(id) => self.w.write_u32(id.index() as u32),
                        Target::Unresolved(raw) => self.w.write_u32(raw),
                    },
                    PushValue::Variable { variable, .. } => {
                        self.chain(variable, ChainTarget::Variable)?
                    }
                }
            }
            InstructionKind::Call { ty, argc, function } => {
                self.w.write_u32(word(opcode, 0, *ty, *argc));
                self.chain(function, ChainTarget::Function)?;
            }
            InstructionKind::Break {
                ty,
                selector,
                argument,
            } => {
                if argument.is_some() != (*ty == DataType::Int32) {
                    return Err(self.fail(format!(
                        "break.{ty} argument presence must match an i type tag"
                    )));
                }
                self.w.write_u32(word(opcode, 0, *ty, *selector as u16));
                if let Some(arg) = argument {
                    self.w.write_i32(*arg);
                }
            }
        }
        Ok(())
    }
}

/// Append one instruction. Resolved chain operands are written as placeholders and recorded in
/// `chains`.
pub fn encode_one(inst: &Instruction, w: &mut Writer, chains: &mut Vec<ChainSlot>) -> Result<()> {
    let start = w.position();
    let result = Encoder {
        w: &mut *w,
        chains: &mut *chains,
        start,
        inst,
    }
    .run();
    if result.is_err() {
        // keep the writer at an instruction boundary
        w.truncate(start);
        chains.retain(|slot| slot.instruction_at != start);
    }
    result
}

/// Encode a stand-alone instruction list.
pub fn encode_blob(insts: &[Instruction]) -> Result<(Vec<u8>, Vec<ChainSlot>)> {
    let mut w = Writer::new();
    let mut chains = Vec::new();
    for inst in insts {
        encode_one(inst, &mut w, &mut chains)?;
    }
    Ok((w.into_inner(), chains))
}

pub fn encode(inst: &Instruction) -> Result<Vec<u8>> {
    encode_blob(std::slice::from_ref(inst)).map(|(bytes, _)| bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::decode::decode_blob;
    use crate::bytecode::opcode::{ComparisonKind, InstanceType, InstructionClass};
    use strum::IntoEnumIterator;

    fn round_trip(inst: Instruction) {
        let bytes = encode(&inst).unwrap();
        assert_eq!(bytes.len() as u32, inst.size());
        let back = decode_blob(&bytes).unwrap();
        assert_eq!(back, vec![inst]);
    }

    #[test]
    fn one_of_each_class_round_trips() {
        let var = Reference::unresolved(0x40, RefKind::Instance);
        let func = Reference::unresolved(0x7FF_FFFF, RefKind::Array);
        for (opcode, kind) in [
            (Opcode::Dup, InstructionKind::SingleType { ty: DataType::Variable, extra: 0x0801 }),
            (Opcode::Conv, InstructionKind::DoubleType { ty1: DataType::Int32, ty2: DataType::Variable }),
            (
                Opcode::Cmp,
                InstructionKind::Comparison {
                    ty1: DataType::Variable,
                    ty2: DataType::Variable,
                    cmp: ComparisonKind::Gte,
                },
            ),
            (Opcode::Bt, InstructionKind::Branch(BranchTarget::Offset(BRANCH_MIN))),
            (Opcode::B, InstructionKind::Branch(BranchTarget::Offset(BRANCH_MAX))),
            (Opcode::PopEnv, InstructionKind::Branch(BranchTarget::PopEnvExit)),
            (
                Opcode::Pop,
                InstructionKind::Pop {
                    ty1: DataType::Variable,
                    ty2: DataType::Int32,
                    instance: InstanceType::GLOBAL,
                    destination: Some(var),
                },
            ),
            (Opcode::PushI, InstructionKind::Push { ty: DataType::Int16, value: PushValue::Int16(i16::MIN) }),
            (Opcode::Push, InstructionKind::Push { ty: DataType::Int64, value: PushValue::Int64(i64::MIN) }),
            (Opcode::Push, InstructionKind::Push { ty: DataType::Double, value: PushValue::Double(-0.25) }),
            (
                Opcode::PushGlb,
                InstructionKind::Push {
                    ty: DataType::Variable,
                    value: PushValue::Variable { instance: InstanceType(3), variable: var },
                },
            ),
            (Opcode::Call, InstructionKind::Call { ty: DataType::Int32, argc: 2, function: func }),
            (Opcode::Break, InstructionKind::Break { ty: DataType::Int32, selector: -11, argument: Some(-7) }),
            (Opcode::Break, InstructionKind::Break { ty: DataType::Int16, selector: -1, argument: None }),
        ] {
            round_trip(Instruction::new(0, opcode, kind));
        }
    }

    fn all_types() -> impl Iterator<Item = DataType> {
        (0..16u8).map(DataType::from_nibble)
    }

    fn references<T>() -> Vec<Reference<T>> {
        [
            RefKind::Array,
            RefKind::StackTop,
            RefKind::Normal,
            RefKind::Instance,
            RefKind::MultiPush,
            RefKind::MultiPushPop,
            RefKind::Other(0x20),
        ]
        .into_iter()
        .flat_map(|kind| [0, 4, CHAIN_MASK].map(|raw| Reference::unresolved(raw, kind)))
        .collect()
    }

    const INSTANCES: [InstanceType; 7] = [
        InstanceType::SELF,
        InstanceType::GLOBAL,
        InstanceType::STACKTOP,
        InstanceType::ARG,
        InstanceType::STATIC,
        InstanceType(0),
        InstanceType(i16::MAX),
    ];

    fn push_values() -> Vec<(DataType, PushValue)> {
        let mut out = Vec::new();
        for v in [i16::MIN, -1, 0, i16::MAX] {
            out.push((DataType::Int16, PushValue::Int16(v)));
        }
        for v in [i32::MIN, 0, i32::MAX] {
            out.push((DataType::Int32, PushValue::Int32(v)));
        }
        for v in [i64::MIN, 0x1_0000_0000, i64::MAX] {
            out.push((DataType::Int64, PushValue::Int64(v)));
        }
        for v in [0.0, -1.5, f32::MAX, f32::MIN_POSITIVE] {
            out.push((DataType::Float, PushValue::Float(v)));
        }
        for v in [0.0, -0.25, f64::MAX, f64::MIN_POSITIVE] {
            out.push((DataType::Double, PushValue::Double(v)));
        }
        for v in [false, true] {
            out.push((DataType::Bool, PushValue::Bool(v)));
        }
        for raw in [0, 17, u32::MAX] {
            out.push((DataType::String, PushValue::String(Reference::unresolved(raw, RefKind::Normal))));
        }
        for instance in INSTANCES {
            for variable in references() {
                out.push((DataType::Variable, PushValue::Variable { instance, variable }));
            }
        }
        for n in 7..=14u8 {
            out.push((DataType::Raw(n), PushValue::Raw(0xDEAD_BEEF)));
        }
        out
    }

    /// Every well-formed operand combination for `opcode`, boundary values included.
    fn corpus(opcode: Opcode) -> Vec<InstructionKind> {
        let mut out = Vec::new();
        match opcode.class() {
            InstructionClass::SingleType => {
                for ty in all_types() {
                    for extra in [0, 1, 0x0801, u16::MAX] {
                        out.push(InstructionKind::SingleType { ty, extra });
                    }
                }
            }
            InstructionClass::DoubleType => {
                for ty1 in all_types() {
                    for ty2 in all_types() {
                        out.push(InstructionKind::DoubleType { ty1, ty2 });
                    }
                }
            }
            InstructionClass::Comparison => {
                for ty1 in all_types() {
                    for ty2 in all_types() {
                        for raw in 1..=6 {
                            if let Some(cmp) = ComparisonKind::from_repr(raw) {
                                out.push(InstructionKind::Comparison { ty1, ty2, cmp });
                            }
                        }
                    }
                }
            }
            InstructionClass::Branch => {
                for words in [0, 1, -1, BRANCH_MIN, BRANCH_MAX] {
                    out.push(InstructionKind::Branch(BranchTarget::Offset(words)));
                }
                if opcode == Opcode::PopEnv {
                    out.push(InstructionKind::Branch(BranchTarget::PopEnvExit));
                }
            }
            InstructionClass::Pop => {
                for ty1 in all_types() {
                    for ty2 in all_types() {
                        for instance in INSTANCES {
                            if ty1 == DataType::Int16 {
                                out.push(InstructionKind::Pop { ty1, ty2, instance, destination: None });
                            } else {
                                for r in [Reference::unresolved(0, RefKind::Normal), Reference::unresolved(CHAIN_MASK, RefKind::Array)] {
                                    out.push(InstructionKind::Pop { ty1, ty2, instance, destination: Some(r) });
                                }
                            }
                        }
                    }
                }
            }
            InstructionClass::Push => {
                for (ty, value) in push_values() {
                    out.push(InstructionKind::Push { ty, value });
                }
            }
            InstructionClass::Call => {
                for ty in all_types() {
                    for argc in [0, 1, u16::MAX] {
                        for function in references() {
                            out.push(InstructionKind::Call { ty, argc, function });
                        }
                    }
                }
            }
            InstructionClass::Break => {
                for ty in all_types() {
                    for selector in [i16::MIN, -11, -1, 0, i16::MAX] {
                        if ty == DataType::Int32 {
                            for arg in [i32::MIN, 0, i32::MAX] {
                                out.push(InstructionKind::Break { ty, selector, argument: Some(arg) });
                            }
                        } else {
                            out.push(InstructionKind::Break { ty, selector, argument: None });
                        }
                    }
                }
            }
        }
        out
    }

    #[test]
    fn every_opcode_and_type_tag_round_trips() {
        let mut total = 0;
        for opcode in Opcode::iter() {
            let kinds = corpus(opcode);
            assert!(!kinds.is_empty(), "no operands generated for {opcode}");
            for kind in kinds {
                round_trip(Instruction::new(0, opcode, kind));
                total += 1;
            }
        }
        assert!(total > 10_000, "only {total} instructions generated");
    }

    #[test]
    fn sequences_keep_their_addresses() {
        let mut insts = Vec::new();
        let mut at = 0;
        for opcode in Opcode::iter() {
            let inst = Instruction::new(at, opcode, corpus(opcode).swap_remove(0));
            at += inst.size();
            insts.push(inst);
        }
        let (bytes, chains) = encode_blob(&insts).unwrap();
        assert!(chains.is_empty());
        assert_eq!(bytes.len() as u32, at);
        assert_eq!(decode_blob(&bytes).unwrap(), insts);
    }

    #[test]
    fn class_mismatch_is_unencodable() {
        let inst = Instruction::new(
            8,
            Opcode::Call,
            InstructionKind::Push { ty: DataType::Int16, value: PushValue::Int16(1) },
        );
        assert!(matches!(encode(&inst), Err(Error::UnencodableInstruction { address: 8, .. })));
    }

    #[test]
    fn out_of_range_fields_are_unencodable() {
        let far = Instruction::new(0, Opcode::B, InstructionKind::Branch(BranchTarget::Offset(BRANCH_MAX + 1)));
        assert!(encode(&far).is_err());
        let magic_b = Instruction::new(0, Opcode::B, InstructionKind::Branch(BranchTarget::PopEnvExit));
        assert!(encode(&magic_b).is_err());
        let wrong_tag = Instruction::new(
            0,
            Opcode::Push,
            InstructionKind::Push { ty: DataType::Double, value: PushValue::Int32(1) },
        );
        assert!(encode(&wrong_tag).is_err());
        let wide = Instruction::new(
            0,
            Opcode::Call,
            InstructionKind::Call {
                ty: DataType::Int32,
                argc: 0,
                function: Reference::unresolved(0x0800_0000, RefKind::Normal),
            },
        );
        assert!(encode(&wide).is_err());
    }

    #[test]
    fn failed_encode_leaves_writer_at_boundary() {
        let mut w = Writer::new();
        let mut chains = Vec::new();
        let ok = Instruction::new(0, Opcode::Ret, InstructionKind::SingleType { ty: DataType::Variable, extra: 0 });
        let bad = Instruction::new(4, Opcode::Pop, InstructionKind::Pop {
            ty1: DataType::Variable,
            ty2: DataType::Variable,
            instance: InstanceType::SELF,
            destination: None,
        });
        encode_one(&ok, &mut w, &mut chains).unwrap();
        assert!(encode_one(&bad, &mut w, &mut chains).is_err());
        assert_eq!(w.position(), 4);
    }

    #[test]
    fn resolved_operands_become_chain_slots() {
        let mut w = Writer::new();
        w.write_u32(0xFFFF_FFFF);
        let mut chains = Vec::new();
        let inst = Instruction::new(
            0,
            Opcode::Push,
            InstructionKind::Push {
                ty: DataType::Variable,
                value: PushValue::Variable {
                    instance: InstanceType::SELF,
                    variable: Reference::with_kind(Id::new(3), RefKind::StackTop),
                },
            },
        );
        encode_one(&inst, &mut w, &mut chains).unwrap();
        assert_eq!(
            chains,
            vec![ChainSlot {
                instruction_at: 4,
                operand_at: 8,
                target: ChainTarget::Variable(Id::new(3)),
                kind: RefKind::StackTop,
            }]
        );
        assert_eq!(w.read_u32_at(8), Some(0x8000_0000));
    }
}
