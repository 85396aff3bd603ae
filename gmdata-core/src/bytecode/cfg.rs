use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;

use itertools::Itertools;

use crate::error::{Error, Result};

use super::instruction::{CodeView, Instruction};
use super::opcode::Opcode;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub start: u32,
    /// Exclusive.
    pub end: u32,
    /// Indices into the view's instruction slice.
    pub instructions: Range<usize>,
    pub last_opcode: Option<Opcode>,
    pub predecessors: Vec<u32>,
    pub successors: Vec<u32>,
}

impl Block {
    fn empty(start: u32, end: u32) -> Self {
        Self {
            start,
            end,
            instructions: 0..0,
            last_opcode: None,
            predecessors: Vec::new(),
            successors: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }
}

/// Basic blocks of one code entry keyed by their entry-relative start address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cfg {
    pub blocks: BTreeMap<u32, Block>,
    pub length: u32,
}

impl Cfg {
    pub fn block(&self, start: u32) -> Option<&Block> {
        self.blocks.get(&start)
    }

    /// Block whose half-open interval contains `address`.
    pub fn block_containing(&self, address: u32) -> Option<&Block> {
        self.blocks
            .range(..=address)
            .next_back()
            .map(|(_, b)| b)
            .filter(|b| address < b.end)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn edges(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.blocks
            .values()
            .flat_map(|b| b.successors.iter().map(move |&s| (b.start, s)))
    }
}

fn is_boundary(view: &CodeView, target: i64) -> bool {
    if target == view.length as i64 {
        return true;
    }
    let Ok(target) = u32::try_from(target) else {
        return false;
    };
    view.instructions
        .binary_search_by_key(&target, |i| view.relative(i))
        .is_ok()
}

fn collect_leaders(view: &CodeView, strict: bool) -> Result<BTreeSet<u32>> {
    let mut leaders = BTreeSet::new();
    if !view.instructions.is_empty() {
        leaders.insert(0);
    }
    for inst in view.instructions {
        let next = view.relative(inst) + inst.size();
        let contributes_next = matches!(
            inst.opcode,
            Opcode::B | Opcode::Bt | Opcode::Bf | Opcode::PushEnv | Opcode::Ret | Opcode::Exit
        );
        if contributes_next {
            leaders.insert(next);
        }
        if let Some(target) = view.target_of(inst) {
            if is_boundary(view, target) {
                leaders.insert(target as u32);
            } else if strict {
                return Err(Error::InvariantViolation(format!(
                    "{} at {:#x} jumps to {target:#x}, which is not an instruction boundary",
                    inst.opcode,
                    view.relative(inst)
                )));
            }
        }
    }
    Ok(leaders)
}

/// Sorted block-start addresses of `view`. Targets that do not land on an instruction are left
/// out.
pub fn block_starts(view: &CodeView) -> Vec<u32> {
    collect_leaders(view, false)
        .map(|set| set.into_iter().filter(|&a| a <= view.length).collect())
        .unwrap_or_default()
}

fn successors(view: &CodeView, block: &Block, last: &Instruction) -> Vec<u32> {
    let target = view.target_of(last).map(|t| t as u32);
    match last.opcode {
        Opcode::B => target.into_iter().collect(),
        Opcode::Bt | Opcode::Bf | Opcode::PushEnv => target.into_iter().chain([block.end]).collect(),
        // the magic exit variant has no target and so no edge
        Opcode::PopEnv => target.into_iter().collect(),
        _ => vec![block.end],
    }
}

pub fn build(view: &CodeView) -> Result<Cfg> {
    let length = view.length;
    let mut bounds: Vec<u32> = collect_leaders(view, true)?.into_iter().collect();
    if let Some(&last) = bounds.last() {
        if last > length {
            return Err(Error::InvariantViolation(format!(
                "block start {last:#x} lies past the entry length {length:#x}"
            )));
        }
    }
    bounds.extend([length, length]);

    let mut blocks: BTreeMap<u32, Block> = BTreeMap::new();
    for (start, end) in bounds.into_iter().tuple_windows() {
        blocks.insert(start, Block::empty(start, end));
    }

    let starts: Vec<u32> = blocks.keys().copied().collect();
    let mut cursor = starts.iter().copied().peekable();
    let mut current = cursor.next();
    for (index, inst) in view.instructions.iter().enumerate() {
        let address = view.relative(inst);
        while let Some(&next) = cursor.peek() {
            if next > address {
                break;
            }
            current = cursor.next();
        }
        let block = current
            .and_then(|start| blocks.get_mut(&start))
            .filter(|b| address < b.end)
            .ok_or_else(|| {
                Error::InvariantViolation(format!("instruction at {address:#x} is outside every block"))
            })?;
        if block.instructions.is_empty() {
            block.instructions = index..index + 1;
        } else {
            block.instructions.end = index + 1;
        }
        block.last_opcode = Some(inst.opcode);
    }

    for start in starts {
        let block = &blocks[&start];
        if block.is_empty() {
            continue;
        }
        let last = &view.instructions[block.instructions.end - 1];
        for target in successors(view, block, last) {
            if !blocks.contains_key(&target) {
                return Err(Error::InvariantViolation(format!(
                    "{} at {:#x} leads to {target:#x}, which starts no block",
                    last.opcode,
                    view.relative(last)
                )));
            }
            if let Some(b) = blocks.get_mut(&start) {
                b.successors.push(target);
            }
            if let Some(b) = blocks.get_mut(&target) {
                b.predecessors.push(start);
            }
        }
    }

    log::trace!("built {} blocks over {length:#x} bytes", blocks.len());
    Ok(Cfg { blocks, length })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::instruction::{BranchTarget, InstructionKind, PushValue};
    use crate::bytecode::opcode::{ComparisonKind, DataType, InstanceType};
    use crate::format::resolver::{RefKind, Reference};

    fn at(address: u32, opcode: Opcode, kind: InstructionKind) -> Instruction {
        Instruction::new(address, opcode, kind)
    }

    fn branch(address: u32, opcode: Opcode, words: i32) -> Instruction {
        at(address, opcode, InstructionKind::Branch(BranchTarget::Offset(words)))
    }

    fn simple(address: u32, opcode: Opcode) -> Instruction {
        at(address, opcode, InstructionKind::SingleType { ty: DataType::Variable, extra: 0 })
    }

    fn pushi(address: u32, v: i16) -> Instruction {
        at(address, Opcode::PushI, InstructionKind::Push { ty: DataType::Int16, value: PushValue::Int16(v) })
    }

    fn assert_well_formed(cfg: &Cfg, view: &CodeView) {
        // every instruction sits in exactly one block
        let covered: usize = cfg.blocks.values().map(|b| b.instructions.len()).sum();
        assert_eq!(covered, view.instructions.len());
        for b in cfg.blocks.values() {
            for i in b.instructions.clone() {
                let a = view.relative(&view.instructions[i]);
                assert!(b.start <= a && a < b.end);
            }
        }
        // predecessor and successor lists mirror each other
        for (from, to) in cfg.edges() {
            let fwd = cfg.blocks[&from].successors.iter().filter(|&&s| s == to).count();
            let back = cfg.blocks[&to].predecessors.iter().filter(|&&p| p == from).count();
            assert_eq!(fwd, back, "edge {from:#x} -> {to:#x}");
        }
    }

    #[test]
    fn conditional_exit_to_the_end() {
        let insts = vec![
            at(0, Opcode::Push, InstructionKind::Push {
                ty: DataType::Variable,
                value: PushValue::Variable {
                    instance: InstanceType::SELF,
                    variable: Reference::unresolved(0, RefKind::Normal),
                },
            }),
            pushi(8, 5),
            at(12, Opcode::Cmp, InstructionKind::Comparison {
                ty1: DataType::Int16,
                ty2: DataType::Variable,
                cmp: ComparisonKind::Lt,
            }),
            branch(16, Opcode::Bf, 1),
        ];
        let view = CodeView::whole(&insts);
        assert_eq!(view.length, 20);
        let cfg = build(&view).unwrap();

        assert_eq!(cfg.len(), 2);
        let body = cfg.block(0).unwrap();
        assert_eq!((body.start, body.end), (0, 20));
        assert_eq!(body.instructions, 0..4);
        assert_eq!(body.last_opcode, Some(Opcode::Bf));
        assert_eq!(body.successors, vec![20, 20]);
        let end = cfg.block(20).unwrap();
        assert!(end.is_empty());
        assert_eq!(end.predecessors, vec![0, 0]);
        assert_well_formed(&cfg, &view);
    }

    #[test]
    fn loop_with_conditional_back_edge() {
        // 0: pushi 1 | 4: bf +4 -> 20 | 8: pushi 2 | 12: ret | 16: b -4 -> 0 | 20: exit
        let insts = vec![
            pushi(0, 1),
            branch(4, Opcode::Bf, 4),
            pushi(8, 2),
            simple(12, Opcode::Ret),
            branch(16, Opcode::B, -4),
            simple(20, Opcode::Exit),
        ];
        let view = CodeView::whole(&insts);
        let cfg = build(&view).unwrap();

        assert_eq!(cfg.blocks.keys().copied().collect::<Vec<_>>(), vec![0, 8, 16, 20, 24]);
        assert_eq!(cfg.block(0).unwrap().successors, vec![20, 8]);
        // ret falls through to the next block like any other non-branch
        assert_eq!(cfg.block(8).unwrap().successors, vec![16]);
        assert_eq!(cfg.block(16).unwrap().predecessors, vec![8]);
        assert_eq!(cfg.block(16).unwrap().successors, vec![0]);
        assert_eq!(cfg.block(20).unwrap().successors, vec![24]);
        assert_eq!(cfg.block(0).unwrap().predecessors, vec![16]);
        assert_eq!(cfg.block_containing(12).map(|b| b.start), Some(8));
        assert_well_formed(&cfg, &view);
    }

    #[test]
    fn ret_in_the_middle_keeps_its_successor_reachable() {
        let insts = vec![simple(0, Opcode::Ret), pushi(4, 1), simple(8, Opcode::Ret)];
        let view = CodeView::whole(&insts);
        let cfg = build(&view).unwrap();

        assert_eq!(cfg.blocks.keys().copied().collect::<Vec<_>>(), vec![0, 4, 12]);
        assert_eq!(cfg.block(0).unwrap().successors, vec![4]);
        assert_eq!(cfg.block(4).unwrap().predecessors, vec![0]);
        assert_eq!(cfg.block(4).unwrap().successors, vec![12]);
        assert_well_formed(&cfg, &view);
    }

    #[test]
    fn magic_popenv_has_no_edge() {
        // 0: pushi 1 | 4: pushenv +3 -> 16 | 8: pushi 2 | 12: popenv [magic] | 16: popenv -2 -> 8 | 20: exit
        let insts = vec![
            pushi(0, 1),
            branch(4, Opcode::PushEnv, 3),
            pushi(8, 2),
            at(12, Opcode::PopEnv, InstructionKind::Branch(BranchTarget::PopEnvExit)),
            branch(16, Opcode::PopEnv, -2),
            simple(20, Opcode::Exit),
        ];
        let view = CodeView::whole(&insts);
        let cfg = build(&view).unwrap();

        assert_eq!(cfg.blocks.keys().copied().collect::<Vec<_>>(), vec![0, 8, 16, 24]);
        let magic = cfg.block(8).unwrap();
        assert_eq!(magic.last_opcode, Some(Opcode::PopEnv));
        assert!(magic.successors.is_empty());
        assert_eq!(magic.predecessors, vec![0]);
        assert_eq!(cfg.block(0).unwrap().successors, vec![16, 8]);
        assert_eq!(cfg.block(16).unwrap().successors, vec![24]);
        assert_well_formed(&cfg, &view);
    }

    #[test]
    fn popenv_contributes_only_its_target() {
        let insts = vec![
            pushi(0, 1),
            at(4, Opcode::PopEnv, InstructionKind::Branch(BranchTarget::PopEnvExit)),
            pushi(8, 2),
            simple(12, Opcode::Ret),
        ];
        let view = CodeView::whole(&insts);
        assert_eq!(block_starts(&view), vec![0, 16]);
        let cfg = build(&view).unwrap();
        assert_eq!(cfg.blocks.keys().copied().collect::<Vec<_>>(), vec![0, 16]);
        assert_eq!(cfg.block(0).unwrap().successors, vec![16]);

        // 0: pushenv +2 -> 8 | 4: pushi | 8: popenv -1 -> 4
        let insts = vec![branch(0, Opcode::PushEnv, 2), pushi(4, 3), branch(8, Opcode::PopEnv, -1)];
        let view = CodeView::whole(&insts);
        let cfg = build(&view).unwrap();
        assert_eq!(cfg.blocks.keys().copied().collect::<Vec<_>>(), vec![0, 4, 8, 12]);
        assert_eq!(cfg.block(8).unwrap().successors, vec![4]);
        assert_eq!(cfg.block(4).unwrap().predecessors, vec![0, 8]);
        assert!(cfg.block(12).unwrap().predecessors.is_empty());
        assert_well_formed(&cfg, &view);
    }

    #[test]
    fn empty_entry_has_only_the_terminal_block() {
        let view = CodeView::whole(&[]);
        let cfg = build(&view).unwrap();
        assert_eq!(cfg.len(), 1);
        assert!(cfg.block(0).unwrap().is_empty());
    }

    #[test]
    fn branch_into_an_operand_is_an_invariant_violation() {
        // the b lands on the second word of the push.i
        let insts = vec![
            at(0, Opcode::Push, InstructionKind::Push { ty: DataType::Int32, value: PushValue::Int32(9) }),
            branch(8, Opcode::B, -1),
        ];
        let view = CodeView::whole(&insts);
        assert!(matches!(build(&view), Err(Error::InvariantViolation(_))));
        assert_eq!(block_starts(&view), vec![0, 12]);
    }

    #[test]
    fn child_views_are_entry_relative() {
        let insts = vec![simple(0, Opcode::Ret), pushi(4, 7), branch(8, Opcode::B, -1), simple(12, Opcode::Exit)];
        let view = CodeView::new(&insts[1..], 4, 12);
        let cfg = build(&view).unwrap();
        assert_eq!(cfg.blocks.keys().copied().collect::<Vec<_>>(), vec![0, 8, 12]);
        assert_eq!(cfg.block(0).unwrap().successors, vec![0]);
        assert_well_formed(&cfg, &view);
    }
}
