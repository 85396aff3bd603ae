//! Occurrence chains linking variable and function operands to their table entries.
//!
//! An operand does not name its target. VARI and FUNC records point at the first occurrence,
//! each occurrence holds the distance to the next one, and the last holds the target's name
//! index. Reading walks the chains and resolves every operand on the way; writing rebuilds them
//! from the operands the encoder emitted.

use std::collections::{BTreeMap, HashSet};

use crate::bytecode::decode::CHAIN_MASK;
use crate::bytecode::encode::{ChainSlot, ChainTarget};
use crate::bytecode::instruction::Instruction;
use crate::cursor::Writer;
use crate::error::{Error, Result, WarningKind, Warnings};
use crate::format::chunks::code::{Code, InstructionSlots};
use crate::format::chunks::func::Functions;
use crate::format::chunks::strg::GmString;
use crate::format::chunks::vari::Variables;
use crate::format::resolver::{Assignments, Entity, Id, Reference, Resolver, Target, TableId};

/// From this version on, `first_address` points at the operand word instead of the instruction.
pub const OPERAND_ADDRESS_VERSION: u8 = 17;

fn first_address_bias(version: u8) -> i64 {
    if version >= OPERAND_ADDRESS_VERSION {
        4
    } else {
        0
    }
}

struct Walk<'a> {
    code: &'a mut Code,
    slots: &'a InstructionSlots,
    resolver: &'a Resolver,
    bias: i64,
}

impl Walk<'_> {
    /// Resolve the `occurrences` operands starting at `first_address` to `id`. Nothing is
    /// changed unless the whole chain is intact. Returns the terminal value.
    fn run<T: Entity>(
        &mut self,
        id: Id<T>,
        occurrences: u32,
        first_address: i32,
        read: fn(&Instruction) -> Option<&Reference<T>>,
        write: fn(&mut Instruction) -> Option<&mut Reference<T>>,
        warnings: &mut Warnings,
    ) -> Option<u32> {
        if occurrences == 0 {
            return None;
        }
        let what = format!("{:?} #{}", T::TABLE, id.index());
        let mut at = first_address as i64 - self.bias;
        let mut visited = Vec::with_capacity(occurrences as usize);
        let mut seen = HashSet::new();
        let mut terminal = None;

        for n in 0..occurrences {
            let slot = u32::try_from(at)
                .ok()
                .and_then(|a| self.resolver.index_in(TableId::Instructions, a))
                .and_then(|s| self.slots.get(s));
            let Some((root, index)) = slot else {
                warnings.warn(
                    WarningKind::DanglingReference,
                    format!("{what}: occurrence {n} at {at:#x} is not an instruction"),
                );
                return None;
            };
            let reference = self
                .code
                .get(root)
                .and_then(|e| e.bytecode())
                .and_then(|b| b.instructions())
                .and_then(|insts| insts.get(index))
                .and_then(read);
            let next = match reference.map(|r| r.target) {
                Some(Target::Unresolved(next)) if seen.insert(at) => next,
                Some(Target::Unresolved(_)) | Some(Target::Resolved(_)) => {
                    warnings.warn(
                        WarningKind::DanglingReference,
                        format!("{what}: occurrence {n} at {at:#x} already belongs to a chain"),
                    );
                    return None;
                }
                None => {
                    warnings.warn(
                        WarningKind::DanglingReference,
                        format!("{what}: instruction at {at:#x} has no matching operand"),
                    );
                    return None;
                }
            };
            log::trace!("{what}: occurrence {n} at {at:#x}, next {next:#x}");
            visited.push((root, index));
            if n + 1 == occurrences {
                terminal = Some(next);
            } else {
                at += next as i64;
            }
        }

        for (root, index) in visited {
            if let Some(r) = self.code.instruction_mut(root, index).and_then(write) {
                r.target = Target::Resolved(id);
            }
        }
        terminal
    }
}

/// Resolve every operand reachable from the VARI and FUNC records.
pub fn resolve_chains(
    code: &mut Code,
    slots: &InstructionSlots,
    variables: &mut Variables,
    functions: &mut Functions,
    resolver: &Resolver,
    version: u8,
    warnings: &mut Warnings,
) {
    let mut walk = Walk {
        code,
        slots,
        resolver,
        bias: first_address_bias(version),
    };
    for (id, var) in variables.items.iter_mut() {
        var.chain_terminal = walk.run(
            id,
            var.occurrences,
            var.first_address,
            Instruction::variable,
            Instruction::variable_mut,
            warnings,
        );
    }
    for (id, func) in functions.items.iter_mut() {
        func.chain_terminal = walk.run(
            id,
            func.occurrences,
            func.first_address,
            Instruction::function,
            Instruction::function_mut,
            warnings,
        );
    }
}

fn terminal_of(
    name: &Reference<GmString>,
    stored: Option<u32>,
    what: &dyn std::fmt::Display,
    warnings: &mut Warnings,
) -> u32 {
    match (name.id(), stored) {
        (Some(id), _) => id.index() as u32,
        (None, Some(raw)) => raw,
        (None, None) => {
            warnings.warn(
                WarningKind::DanglingReference,
                format!("{what}: name does not resolve, chain ends in 0"),
            );
            0
        }
    }
}

struct Record {
    at: u32,
    occurrences_field: usize,
    first_address_field: usize,
}

/// Fill in the operand words recorded in `chains` and the occurrence fields of the VARI and
/// FUNC records. Runs after `Fixups::apply`, once every record has its final offset.
pub fn patch_chains(
    w: &mut Writer,
    chains: &[ChainSlot],
    assignments: &Assignments,
    variables: Option<&Variables>,
    functions: Option<&Functions>,
    version: u8,
    warnings: &mut Warnings,
) -> Result<()> {
    let mut by_target: BTreeMap<ChainTarget, Vec<&ChainSlot>> = BTreeMap::new();
    for slot in chains {
        by_target.entry(slot.target).or_default().push(slot);
    }

    let missing = |target: ChainTarget| {
        Error::InvariantViolation(format!("{target:?} is referenced by code but was never written"))
    };

    let mut targets = Vec::new();
    if let Some(vars) = variables {
        for (id, var) in vars.items.iter() {
            let target = ChainTarget::Variable(id);
            let record = assignments.offset_of(id).map(|at| Record {
                at,
                occurrences_field: 12,
                first_address_field: 16,
            });
            targets.push((target, record, var.occurrences, &var.name, var.chain_terminal));
        }
    }
    if let Some(funcs) = functions {
        for (id, func) in funcs.items.iter() {
            let target = ChainTarget::Function(id);
            let record = assignments.offset_of(id).map(|at| Record {
                at,
                occurrences_field: 4,
                first_address_field: 8,
            });
            targets.push((target, record, func.occurrences, &func.name, func.chain_terminal));
        }
    }

    for (target, record, stored_occurrences, name, stored_terminal) in targets {
        let Some(record) = record else {
            if by_target.contains_key(&target) {
                return Err(missing(target));
            }
            continue;
        };
        let slots = by_target.remove(&target).unwrap_or_default();
        let (occurrences, first_address) = match slots.first() {
            Some(first) => (
                slots.len() as u32,
                first.instruction_at as i64 + first_address_bias(version),
            ),
            // nothing to rebuild; a record that never had occurrences keeps its stored address
            None if stored_occurrences == 0 => continue,
            None => (0, -1),
        };

        let terminal = if slots.is_empty() {
            0
        } else {
            terminal_of(name, stored_terminal, &format_args!("{target:?}"), warnings)
        };
        for (slot, next) in slots.iter().zip(slots.iter().skip(1).map(Some).chain([None])) {
            let value = match next {
                Some(next) => next
                    .instruction_at
                    .checked_sub(slot.instruction_at)
                    .ok_or_else(|| {
                        Error::InvariantViolation(format!(
                            "{target:?} occurrences at {:#x} and {:#x} are out of order",
                            slot.instruction_at, next.instruction_at
                        ))
                    })? as u32,
                None => terminal,
            };
            if value & !CHAIN_MASK != 0 {
                return Err(Error::unencodable(
                    slot.instruction_at as u32,
                    format!("{target:?} occurrence link {value:#x} exceeds 27 bits"),
                ));
            }
            w.patch_u32(slot.operand_at, value | (slot.kind.bits() as u32) << 24)?;
        }

        let at = record.at as usize;
        w.patch_u32(at + record.occurrences_field, occurrences)?;
        w.patch_i32(at + record.first_address_field, first_address as i32)?;
    }

    if let Some((&target, _)) = by_target.iter().next() {
        return Err(missing(target));
    }
    Ok(())
}
