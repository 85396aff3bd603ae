//! Text projection of decoded bytecode.
//!
//! One line per instruction, `<mnemonic>.<types> <operand>`, with `:[N]` lines in front of every
//! block start and a closing `:[end]`. The output depends only on the instructions and the
//! names handed in through [`Symbols`].

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::format::chunks::func::Function;
use crate::format::chunks::strg::GmString;
use crate::format::chunks::vari::Variable;
use crate::format::resolver::{RefKind, Reference, Target};

use super::cfg::block_starts;
use super::instruction::{BranchTarget, CodeView, Instruction, InstructionKind, PushValue};
use super::opcode::{break_name, InstanceType, Opcode};

/// Name lookups the disassembler needs from the surrounding container.
pub trait Symbols {
    fn string(&self, reference: &Reference<GmString>) -> Option<Cow<'_, str>>;
    fn variable_name(&self, reference: &Reference<Variable>) -> Option<Cow<'_, str>>;
    fn function_name(&self, reference: &Reference<Function>) -> Option<Cow<'_, str>>;
}

/// Renders every reference by its raw value.
pub struct NoSymbols;

impl Symbols for NoSymbols {
    fn string(&self, _: &Reference<GmString>) -> Option<Cow<'_, str>> {
        None
    }

    fn variable_name(&self, _: &Reference<Variable>) -> Option<Cow<'_, str>> {
        None
    }

    fn function_name(&self, _: &Reference<Function>) -> Option<Cow<'_, str>> {
        None
    }
}

pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    for ch in s.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' | '\r' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0C}' => out.push_str("\\f"),
            '\u{0B}' => out.push_str("\\v"),
            '\u{07}' => out.push_str("\\a"),
            c => out.push(c),
        }
    }
    out
}

fn raw_target<T>(r: &Reference<T>) -> String {
    match r.target {
        Target::Resolved(id) => format!("#{}", id.index()),
        Target::Unresolved(raw) => format!("?{raw:#x}"),
    }
}

fn variable(symbols: &dyn Symbols, instance: InstanceType, r: &Reference<Variable>) -> String {
    let name = symbols
        .variable_name(r)
        .unwrap_or_else(|| Cow::Owned(format!("var{}", raw_target(r))));
    if r.kind == RefKind::Normal {
        format!("{instance}.{name}")
    } else {
        format!("({}){instance}.{name}", r.kind)
    }
}

struct Labels {
    index: BTreeMap<u32, usize>,
    length: u32,
}

impl Labels {
    fn new(view: &CodeView) -> Self {
        let index = block_starts(view)
            .into_iter()
            .enumerate()
            .map(|(i, a)| (a, i))
            .collect();
        Self {
            index,
            length: view.length,
        }
    }

    fn target(&self, target: i64) -> String {
        if target == self.length as i64 {
            return "[end]".to_string();
        }
        match u32::try_from(target).ok().and_then(|t| self.index.get(&t)) {
            Some(i) => format!("[{i}]"),
            None => format!("[?{target}]"),
        }
    }
}

fn format_with(view: &CodeView, labels: &Labels, inst: &Instruction, symbols: &dyn Symbols) -> String {
    let op = inst.opcode;
    match &inst.kind {
        InstructionKind::SingleType { ty, extra } => match op {
            Opcode::Dup => {
                let (size, swap) = (extra & 0xFF, extra >> 8);
                if swap == 0 {
                    format!("{op}.{ty} {size}")
                } else {
                    format!("{op}.{ty} {size} {swap}")
                }
            }
            Opcode::CallV => format!("{op}.{ty} {extra}"),
            _ if *extra != 0 => format!("{op}.{ty} {extra}"),
            _ => format!("{op}.{ty}"),
        },
        InstructionKind::DoubleType { ty1, ty2 } => format!("{op}.{ty1}.{ty2}"),
        InstructionKind::Comparison { ty1, ty2, cmp } => format!("{op}.{ty1}.{ty2} {cmp}"),
        InstructionKind::Branch(BranchTarget::PopEnvExit) => format!("{op} [magic]"),
        InstructionKind::Branch(BranchTarget::Offset(_)) => {
            let target = view.target_of(inst).unwrap_or_default();
            format!("{op} {}", labels.target(target))
        }
        InstructionKind::Pop {
            ty1,
            ty2,
            instance,
            destination,
        } => match destination {
            Some(dest) => format!("{op}.{ty1}.{ty2} {}", variable(symbols, *instance, dest)),
            None => format!("{op}.{ty1}.{ty2} {}", instance.0),
        },
        InstructionKind::Push { ty, value } => {
            let operand = match value {
                PushValue::Int16(v) => v.to_string(),
                PushValue::Int32(v) => v.to_string(),
                PushValue::Int64(v) => v.to_string(),
                PushValue::Float(v) => format!("{v:?}"),
                PushValue::Double(v) => format!("{v:?}"),
                PushValue::Bool(v) => v.to_string(),
                PushValue::Raw(v) => format!("{v:#x}"),
                PushValue::String(s) => match symbols.string(s) {
                    Some(text) => format!("\"{}\"", escape(&text)),
                    None => format!("string{}", raw_target(s)),
                },
                PushValue::Variable { instance, variable: v } => variable(symbols, *instance, v),
            };
            format!("{op}.{ty} {operand}")
        }
        InstructionKind::Call { ty, argc, function } => {
            let name = symbols
                .function_name(function)
                .unwrap_or_else(|| Cow::Owned(format!("func{}", raw_target(function))));
            format!("{op}.{ty} {name}(argc={argc})")
        }
        InstructionKind::Break {
            ty,
            selector,
            argument,
        } => {
            let mut text = match break_name(*selector) {
                Some(name) => format!("{name}.{ty}"),
                None => format!("{op}.{ty} {selector}"),
            };
            if let Some(arg) = argument {
                let _ = write!(text, " {arg}");
            }
            text
        }
    }
}

/// Render a single instruction, with branch labels relative to `view`.
pub fn format_instruction(view: &CodeView, inst: &Instruction, symbols: &dyn Symbols) -> String {
    format_with(view, &Labels::new(view), inst, symbols)
}

pub fn disassemble(view: &CodeView, symbols: &dyn Symbols) -> String {
    let labels = Labels::new(view);
    let mut out = String::new();
    for inst in view.instructions {
        let address = view.relative(inst);
        if let Some(i) = labels.index.get(&address) {
            let _ = writeln!(out, ":[{i}]");
        }
        out.push_str(&format_with(view, &labels, inst, symbols));
        out.push('\n');
    }
    out.push_str(":[end]\n");
    out
}
