use binrw::{BinRead, BinWrite};

use crate::cursor::{Cursor, Writer};
use crate::error::{Result, WarningKind, Warnings};
use crate::format::directory::ChunkSpan;
use crate::format::resolver::{
    Assignments, Entity, Fixups, Id, RefKind, Reference, Resolver, Table, TableId,
};

use super::strg::GmString;

pub const FUNCTION_RECORD_SIZE: u32 = 12;

#[derive(BinRead, BinWrite, Debug, Clone, Copy, PartialEq, Eq)]
#[brw(little)]
struct FunctionRecord {
    name: u32,
    occurrences: u32,
    first_address: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: Reference<GmString>,
    pub occurrences: u32,
    pub first_address: i32,
    pub chain_terminal: Option<u32>,
}

impl Entity for Function {
    const TABLE: TableId = TableId::Functions;
}

impl Function {
    pub fn new(name: Id<GmString>) -> Self {
        Self {
            name: Reference::to(name),
            occurrences: 0,
            first_address: -1,
            chain_terminal: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocalVar {
    pub index: u32,
    pub name: Reference<GmString>,
}

/// Local variable names of one code entry.
#[derive(Debug, Clone, PartialEq)]
pub struct CodeLocals {
    pub name: Reference<GmString>,
    pub locals: Vec<LocalVar>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Functions {
    pub items: Table<Function>,
    /// `None` when the chunk ends right after the function records.
    pub code_locals: Option<Vec<CodeLocals>>,
}

fn name_ref(raw: u32) -> Reference<GmString> {
    Reference::unresolved(raw, RefKind::Normal)
}

impl Functions {
    pub fn get(&self, id: Id<Function>) -> Option<&Function> {
        self.items.get(id)
    }

    pub fn find_locals(&self, name: Id<GmString>) -> Option<&CodeLocals> {
        self.code_locals
            .as_deref()?
            .iter()
            .find(|l| l.name.id() == Some(name))
    }

    pub fn parse(
        form: &[u8],
        span: &ChunkSpan,
        resolver: &mut Resolver,
        warnings: &mut Warnings,
    ) -> Result<(Self, usize)> {
        let mut c = Cursor::fenced(form, span.data_offset, span.data_end())?;
        let count = c.read_u32()?;
        let base = c.position();
        let mut items = Table::new();
        for _ in 0..count {
            let record: FunctionRecord = c.read_record()?;
            items.push(Function {
                name: name_ref(record.name),
                occurrences: record.occurrences,
                first_address: record.first_address,
                chain_terminal: None,
            });
        }
        resolver.register_fixed(TableId::Functions, base as u32, FUNCTION_RECORD_SIZE, count);

        let code_locals = if c.remaining() >= 4 {
            let mut out = Vec::new();
            let count = c.read_u32()?;
            for i in 0..count {
                let at = c.position();
                let parsed = (|| -> Result<CodeLocals> {
                    let local_count = c.read_u32()?;
                    let name = name_ref(c.read_u32()?);
                    let locals = (0..local_count)
                        .map(|_| {
                            Ok(LocalVar {
                                index: c.read_u32()?,
                                name: name_ref(c.read_u32()?),
                            })
                        })
                        .collect::<Result<Vec<_>>>()?;
                    Ok(CodeLocals { name, locals })
                })();
                match parsed {
                    Ok(l) => out.push(l),
                    Err(e) => {
                        warnings.warn(
                            WarningKind::TruncatedSection,
                            format!("code locals {i}/{count} at {at:#x}: {e}"),
                        );
                        // the partial list cannot be written back
                        return Err(e);
                    }
                }
            }
            Some(out)
        } else {
            None
        };

        log::debug!(
            "FUNC: {} functions, {} code-locals lists",
            items.len(),
            code_locals.as_ref().map_or(0, Vec::len)
        );
        Ok((Self { items, code_locals }, c.position()))
    }

    pub fn resolve_names(&mut self, resolver: &Resolver, warnings: &mut Warnings) {
        for (id, f) in self.items.iter_mut() {
            resolver.resolve(&mut f.name, warnings, &format_args!("function {} name", id.index()));
        }
        for locals in self.code_locals.iter_mut().flatten() {
            resolver.resolve(&mut locals.name, warnings, &"code locals name");
            for local in &mut locals.locals {
                resolver.resolve(&mut local.name, warnings, &format_args!("local {}", local.index));
            }
        }
    }

    pub fn write(&self, w: &mut Writer, fixups: &mut Fixups, assignments: &mut Assignments) -> Result<()> {
        w.write_u32(self.items.len() as u32);
        for (id, f) in self.items.iter() {
            assignments.assign(id, w.position());
            fixups.write_offset(w, &f.name, 0);
            w.write_u32(f.occurrences);
            w.write_i32(f.first_address);
        }
        if let Some(code_locals) = &self.code_locals {
            w.write_u32(code_locals.len() as u32);
            for entry in code_locals {
                w.write_u32(entry.locals.len() as u32);
                fixups.write_offset(w, &entry.name, 0);
                for local in &entry.locals {
                    w.write_u32(local.index);
                    fixups.write_offset(w, &local.name, 0);
                }
            }
        }
        Ok(())
    }
}
