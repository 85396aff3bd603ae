use binrw::{BinRead, BinWrite};

use crate::cursor::{Cursor, Writer};
use crate::error::{Result, Warnings};
use crate::format::directory::ChunkSpan;
use crate::format::resolver::{
    Assignments, Entity, Fixups, Id, RefKind, Reference, Resolver, Table, TableId,
};

use super::strg::GmString;

pub const VARIABLE_RECORD_SIZE: u32 = 20;

#[derive(BinRead, BinWrite, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[brw(little)]
pub struct VariHeader {
    pub instance_var_count: u32,
    pub instance_var_count_max: u32,
    pub max_local_var_count: u32,
}

#[derive(BinRead, BinWrite, Debug, Clone, Copy, PartialEq, Eq)]
#[brw(little)]
struct VariableRecord {
    name: u32,
    instance_type: i32,
    var_id: i32,
    occurrences: u32,
    first_address: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub name: Reference<GmString>,
    pub instance_type: i32,
    pub var_id: i32,
    /// Occurrence count and first occurrence as read. The writer recomputes both from the
    /// operands it emits.
    pub occurrences: u32,
    pub first_address: i32,
    /// Value found in the last occurrence's operand, used when `name` does not resolve.
    pub chain_terminal: Option<u32>,
}

impl Entity for Variable {
    const TABLE: TableId = TableId::Variables;
}

impl Variable {
    pub fn new(name: Id<GmString>, instance_type: i32, var_id: i32) -> Self {
        Self {
            name: Reference::to(name),
            instance_type,
            var_id,
            occurrences: 0,
            first_address: -1,
            chain_terminal: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Variables {
    pub header: VariHeader,
    pub items: Table<Variable>,
}

impl Variables {
    pub fn get(&self, id: Id<Variable>) -> Option<&Variable> {
        self.items.get(id)
    }

    pub fn parse(form: &[u8], span: &ChunkSpan, resolver: &mut Resolver) -> Result<(Self, usize)> {
        let mut c = Cursor::fenced(form, span.data_offset, span.data_end())?;
        let header: VariHeader = c.read_record()?;

        let base = c.position();
        let count = c.remaining() / VARIABLE_RECORD_SIZE as usize;
        let mut items = Table::new();
        for _ in 0..count {
            let record: VariableRecord = c.read_record()?;
            items.push(Variable {
                name: Reference::unresolved(record.name, RefKind::Normal),
                instance_type: record.instance_type,
                var_id: record.var_id,
                occurrences: record.occurrences,
                first_address: record.first_address,
                chain_terminal: None,
            });
        }

        resolver.register_fixed(TableId::Variables, base as u32, VARIABLE_RECORD_SIZE, count as u32);
        log::debug!("VARI: {count} variables");
        Ok((Self { header, items }, c.position()))
    }

    pub fn resolve_names(&mut self, resolver: &Resolver, warnings: &mut Warnings) {
        for (id, var) in self.items.iter_mut() {
            resolver.resolve(&mut var.name, warnings, &format_args!("variable {} name", id.index()));
        }
    }

    pub fn write(&self, w: &mut Writer, fixups: &mut Fixups, assignments: &mut Assignments) -> Result<()> {
        w.write_record(&self.header)?;
        for (id, var) in self.items.iter() {
            assignments.assign(id, w.position());
            fixups.write_offset(w, &var.name, 0);
            w.write_i32(var.instance_type);
            w.write_i32(var.var_id);
            w.write_u32(var.occurrences);
            w.write_i32(var.first_address);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::directory::Tag;

    #[test]
    fn fixed_records_follow_the_header() {
        let mut form = vec![0u8; 8];
        for v in [2u32, 2, 1] {
            form.extend_from_slice(&v.to_le_bytes());
        }
        for (name, id) in [(0x40u32, 0i32), (0x50, 1)] {
            form.extend_from_slice(&name.to_le_bytes());
            form.extend_from_slice(&(-1i32).to_le_bytes());
            form.extend_from_slice(&id.to_le_bytes());
            form.extend_from_slice(&0u32.to_le_bytes());
            form.extend_from_slice(&(-1i32).to_le_bytes());
        }
        let span = ChunkSpan {
            tag: Tag::VARI,
            header_offset: 0,
            data_offset: 8,
            length: form.len() - 8,
        };
        let mut resolver = Resolver::new();
        let (vars, end) = Variables::parse(&form, &span, &mut resolver).unwrap();
        assert_eq!(end, form.len());
        assert_eq!(vars.header.max_local_var_count, 1);
        assert_eq!(vars.items.len(), 2);
        assert_eq!(vars.get(Id::new(1)).unwrap().var_id, 1);
        assert_eq!(resolver.index_in(TableId::Variables, 20 + 20), Some(1));

        let mut w = Writer::new();
        w.write_bytes(&[0u8; 8]);
        let mut fixups = Fixups::new();
        let mut assignments = Assignments::default();
        vars.write(&mut w, &mut fixups, &mut assignments).unwrap();
        fixups.apply(&assignments, &mut w).unwrap();
        assert_eq!(w.as_slice(), &form[..]);
        assert_eq!(assignments.offset_of(Id::<Variable>::new(0)), Some(20));
    }
}
