use std::collections::HashMap;

use binrw::{BinRead, BinWrite};

use crate::bytecode::decode::decode_blob;
use crate::bytecode::encode::{encode_one, ChainSlot};
use crate::bytecode::instruction::{CodeView, Instruction};
use crate::cursor::{Cursor, Writer};
use crate::error::{Error, Result, WarningKind, Warnings};
use crate::format::directory::ChunkSpan;
use crate::format::resolver::{
    Assignments, Entity, Fixups, Id, RefKind, Reference, Resolver, Table, TableId,
};

use super::strg::GmString;

#[derive(BinRead, BinWrite, Debug, Clone, Copy, PartialEq, Eq)]
#[brw(little)]
struct CodeRecord {
    name: u32,
    length: u32,
    locals_count: u16,
    args_count: u16,
    /// Relative to the address of this field.
    blob_rel: i32,
    offset_in_blob: u32,
}

/// Distance from the start of a code record to its `blob_rel` field.
const BLOB_REL_FIELD: i64 = 12;

#[derive(Debug, Clone, PartialEq)]
pub enum Bytecode {
    Decoded(Vec<Instruction>),
    /// A blob that failed to decode, carried verbatim.
    Raw { bytes: Vec<u8>, reason: String },
}

impl Bytecode {
    pub fn len(&self) -> u32 {
        match self {
            Bytecode::Decoded(insts) => insts.last().map_or(0, |i| i.next_address()),
            Bytecode::Raw { bytes, .. } => bytes.len() as u32,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn instructions(&self) -> Option<&[Instruction]> {
        match self {
            Bytecode::Decoded(insts) => Some(insts),
            Bytecode::Raw { .. } => None,
        }
    }

    pub fn instructions_mut(&mut self) -> Option<&mut Vec<Instruction>> {
        match self {
            Bytecode::Decoded(insts) => Some(insts),
            Bytecode::Raw { .. } => None,
        }
    }

    /// Recompute every address from the instruction sizes, after instructions were inserted or
    /// removed. Branch offsets are not touched.
    pub fn relayout(&mut self) {
        if let Bytecode::Decoded(insts) = self {
            let mut at = 0;
            for inst in insts {
                inst.address = at;
                at += inst.size();
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CodeBody {
    /// Owns a bytecode blob.
    Root(Bytecode),
    /// A function compiled into its parent's blob, starting `offset` bytes in.
    Child { parent: Id<CodeEntry>, offset: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CodeEntry {
    pub name: Reference<GmString>,
    /// Declared length. For roots the writer derives it from the body instead.
    pub length: u32,
    pub locals_count: u16,
    pub args_count: u16,
    pub body: CodeBody,
}

impl Entity for CodeEntry {
    const TABLE: TableId = TableId::Code;
}

impl CodeEntry {
    pub fn is_root(&self) -> bool {
        matches!(self.body, CodeBody::Root(_))
    }

    pub fn bytecode(&self) -> Option<&Bytecode> {
        match &self.body {
            CodeBody::Root(b) => Some(b),
            CodeBody::Child { .. } => None,
        }
    }
}

/// Where each decoded instruction lives, indexed by the resolver's instruction region.
#[derive(Debug, Clone, Default)]
pub struct InstructionSlots {
    slots: Vec<(Id<CodeEntry>, usize)>,
}

impl InstructionSlots {
    pub fn get(&self, slot: u32) -> Option<(Id<CodeEntry>, usize)> {
        self.slots.get(slot as usize).copied()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Code {
    pub entries: Table<CodeEntry>,
}

impl Code {
    pub fn get(&self, id: Id<CodeEntry>) -> Option<&CodeEntry> {
        self.entries.get(id)
    }

    pub fn push_root(
        &mut self,
        name: Id<GmString>,
        locals_count: u16,
        args_count: u16,
        instructions: Vec<Instruction>,
    ) -> Id<CodeEntry> {
        let body = Bytecode::Decoded(instructions);
        self.entries.push(CodeEntry {
            name: Reference::to(name),
            length: body.len(),
            locals_count,
            args_count,
            body: CodeBody::Root(body),
        })
    }

    pub fn push_child(
        &mut self,
        name: Id<GmString>,
        parent: Id<CodeEntry>,
        offset: u32,
        args_count: u16,
    ) -> Result<Id<CodeEntry>> {
        let length = match self.entries.get(parent).map(|p| &p.body) {
            Some(CodeBody::Root(b)) => b.len(),
            _ => {
                return Err(Error::InvariantViolation(format!(
                    "code entry #{} is not a root",
                    parent.index()
                )))
            }
        };
        Ok(self.entries.push(CodeEntry {
            name: Reference::to(name),
            length,
            locals_count: 0,
            args_count,
            body: CodeBody::Child { parent, offset },
        }))
    }

    /// Child entries of `parent` with their offsets, in table order.
    pub fn children(&self, parent: Id<CodeEntry>) -> impl Iterator<Item = (Id<CodeEntry>, u32)> + '_ {
        self.entries.iter().filter_map(move |(id, e)| match e.body {
            CodeBody::Child { parent: p, offset } if p == parent => Some((id, offset)),
            _ => None,
        })
    }

    pub fn instruction_mut(&mut self, root: Id<CodeEntry>, index: usize) -> Option<&mut Instruction> {
        match &mut self.entries.get_mut(root)?.body {
            CodeBody::Root(Bytecode::Decoded(insts)) => insts.get_mut(index),
            _ => None,
        }
    }

    /// Entry-relative view of an entry's instructions. A child spans from its offset to the next
    /// sibling (or the end of the blob); a root spans its whole blob.
    pub fn view(&self, id: Id<CodeEntry>) -> Result<CodeView<'_>> {
        let entry = self
            .entries
            .get(id)
            .ok_or_else(|| Error::InvariantViolation(format!("no code entry #{}", id.index())))?;
        let (root, offset) = match entry.body {
            CodeBody::Root(_) => (id, None),
            CodeBody::Child { parent, offset } => (parent, Some(offset)),
        };
        let body = self.entries.get(root).and_then(CodeEntry::bytecode).ok_or_else(|| {
            Error::InvariantViolation(format!(
                "code entry #{} has parent #{}, which owns no bytecode",
                id.index(),
                root.index()
            ))
        })?;
        let insts = match body {
            Bytecode::Decoded(insts) => insts.as_slice(),
            Bytecode::Raw { reason, .. } => return Err(Error::corrupt(0, reason.clone())),
        };

        let Some(offset) = offset else {
            return Ok(CodeView::new(insts, 0, body.len()));
        };
        let end = self
            .children(root)
            .map(|(_, o)| o)
            .filter(|&o| o > offset)
            .min()
            .unwrap_or(body.len())
            .max(offset);
        let lo = insts.partition_point(|i| i.address < offset);
        let hi = insts.partition_point(|i| i.address < end);
        Ok(CodeView::new(&insts[lo..hi], offset, end - offset))
    }

    /// Returns the table, the instruction slots registered with `resolver`, and the end of the
    /// last record.
    pub fn parse(
        form: &[u8],
        span: &ChunkSpan,
        resolver: &mut Resolver,
        warnings: &mut Warnings,
    ) -> Result<(Self, InstructionSlots, usize)> {
        let mut c = Cursor::fenced(form, span.data_offset, span.data_end())?;
        let pointers = c.read_pointer_list()?;
        let mut content_end = c.position();

        let mut records = Vec::with_capacity(pointers.len());
        for (index, &ptr) in pointers.iter().enumerate() {
            let ptr = ptr as usize;
            if ptr < span.data_offset {
                return Err(Error::malformed(ptr, format!("code entry {index} points outside CODE")));
            }
            c.seek(ptr)?;
            let record: CodeRecord = c.read_record()?;
            content_end = content_end.max(c.position());
            let blob = ptr as i64 + BLOB_REL_FIELD + record.blob_rel as i64;
            let blob_end = blob + record.length as i64;
            if blob < span.data_offset as i64 || blob_end > span.data_end() as i64 {
                return Err(Error::malformed(
                    ptr,
                    format!("code entry {index} blob {blob:#x}..{blob_end:#x} lies outside CODE"),
                ));
            }
            records.push((record, blob as usize));
        }

        // the first offset-0 entry of each blob owns it
        let mut roots: HashMap<usize, Id<CodeEntry>> = HashMap::new();
        for (index, (record, blob)) in records.iter().enumerate() {
            if record.offset_in_blob == 0 {
                roots.entry(*blob).or_insert(Id::new(index));
            }
        }

        let mut entries = Table::new();
        let mut slots = InstructionSlots::default();
        let mut instruction_offsets = Vec::new();
        for (index, (record, blob)) in records.into_iter().enumerate() {
            let id = Id::new(index);
            let body = match roots.get(&blob) {
                Some(&root) if root == id => {
                    let bytes = &form[blob..blob + record.length as usize];
                    content_end = content_end.max(blob + bytes.len());
                    let body = match decode_blob(bytes) {
                        Ok(insts) => {
                            for (i, inst) in insts.iter().enumerate() {
                                instruction_offsets
                                    .push(((blob as u32) + inst.address, slots.slots.len() as u32));
                                slots.slots.push((id, i));
                            }
                            Bytecode::Decoded(insts)
                        }
                        Err(e) => {
                            warnings.warn(
                                WarningKind::CorruptBytecode,
                                format!("code entry {index} kept as raw bytes: {e}"),
                            );
                            Bytecode::Raw {
                                bytes: bytes.to_vec(),
                                reason: e.to_string(),
                            }
                        }
                    };
                    CodeBody::Root(body)
                }
                Some(&parent) => CodeBody::Child {
                    parent,
                    offset: record.offset_in_blob,
                },
                None => {
                    return Err(Error::malformed(
                        blob,
                        format!("code entry {index} shares a blob that no entry owns"),
                    ))
                }
            };
            entries.push(CodeEntry {
                name: Reference::unresolved(record.name, RefKind::Normal),
                length: record.length,
                locals_count: record.locals_count,
                args_count: record.args_count,
                body,
            });
        }

        resolver.register_sparse(TableId::Instructions, instruction_offsets);
        log::debug!(
            "CODE: {} entries, {} instructions",
            entries.len(),
            slots.len()
        );
        Ok((Self { entries }, slots, content_end))
    }

    pub fn resolve_names(&mut self, resolver: &Resolver, warnings: &mut Warnings) {
        for (id, entry) in self.entries.iter_mut() {
            resolver.resolve(&mut entry.name, warnings, &format_args!("code entry {} name", id.index()));
        }
    }

    /// Pointer list, root blobs in table order, then the records.
    pub fn write(
        &self,
        w: &mut Writer,
        fixups: &mut Fixups,
        assignments: &mut Assignments,
        chains: &mut Vec<ChainSlot>,
    ) -> Result<()> {
        w.write_u32(self.entries.len() as u32);
        for (id, _) in self.entries.iter() {
            fixups.write_placeholder(w, TableId::Code, id.index() as u32, 0);
        }

        let mut blobs: HashMap<Id<CodeEntry>, (usize, u32)> = HashMap::new();
        for (id, entry) in self.entries.iter() {
            let CodeBody::Root(body) = &entry.body else {
                continue;
            };
            let at = w.position();
            match body {
                Bytecode::Decoded(insts) => {
                    for inst in insts {
                        encode_one(inst, w, chains)?;
                    }
                }
                Bytecode::Raw { bytes, .. } => w.write_bytes(bytes),
            }
            blobs.insert(id, (at, (w.position() - at) as u32));
        }

        for (id, entry) in self.entries.iter() {
            let record_at = w.position();
            assignments.assign(id, record_at);
            let (blob, length, offset) = match entry.body {
                CodeBody::Root(_) => {
                    let (blob, length) = blobs[&id];
                    (blob, length, 0)
                }
                CodeBody::Child { parent, offset } => {
                    let &(blob, _) = blobs.get(&parent).ok_or_else(|| {
                        Error::InvariantViolation(format!(
                            "code entry #{} has parent #{}, which owns no bytecode",
                            id.index(),
                            parent.index()
                        ))
                    })?;
                    (blob, entry.length, offset)
                }
            };
            fixups.write_offset(w, &entry.name, 0);
            w.write_u32(length);
            w.write_u16(entry.locals_count);
            w.write_u16(entry.args_count);
            w.write_i32((blob as i64 - (record_at as i64 + BLOB_REL_FIELD)) as i32);
            w.write_u32(offset);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::instruction::InstructionKind;
    use crate::bytecode::opcode::{DataType, Opcode};
    use crate::format::directory::Tag;

    fn words(ws: &[u32]) -> Vec<u8> {
        ws.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    // 0x08 CODE payload: 2 pointers, one 12-byte blob, a root and a child record
    fn sample() -> Vec<u8> {
        let root_rec = 0x08 + 12 + 12;
        let child_rec = root_rec + 24;
        let rel = |rec: u32| (0x14i64 - (rec as i64 + 12)) as i32 as u32;
        words(&[
            0, 0, // header stand-in
            2, root_rec, child_rec,
            // blob: pushi.e 1 | b +1 | ret.v (child starts at 8)
            0x840F_0001, 0xB600_0001, 0x9C05_0000,
            0x100, 12, 0, 0, rel(root_rec), 0,
            0x104, 12, 0, 1, rel(child_rec), 8,
        ])
    }

    fn span(form: &[u8]) -> ChunkSpan {
        ChunkSpan {
            tag: Tag::CODE,
            header_offset: 0,
            data_offset: 8,
            length: form.len() - 8,
        }
    }

    #[test]
    fn children_share_the_parent_blob() {
        let form = sample();
        let mut resolver = Resolver::new();
        let mut warnings = Warnings::default();
        let (code, slots, end) = Code::parse(&form, &span(&form), &mut resolver, &mut warnings).unwrap();
        assert!(warnings.is_empty());
        assert_eq!(end, form.len());
        assert_eq!(slots.len(), 3);
        assert_eq!(resolver.index_in(TableId::Instructions, 0x14 + 8), Some(2));

        let child = Id::new(1);
        assert_eq!(
            code.get(child).unwrap().body,
            CodeBody::Child { parent: Id::new(0), offset: 8 }
        );
        let view = code.view(child).unwrap();
        assert_eq!(view.base, 8);
        assert_eq!(view.length, 4);
        assert_eq!(view.instructions.len(), 1);
        assert_eq!(view.instructions[0].opcode, Opcode::Ret);

        let root = code.view(Id::new(0)).unwrap();
        assert_eq!((root.base, root.length, root.instructions.len()), (0, 12, 3));
    }

    #[test]
    fn writes_blobs_before_records() {
        let form = sample();
        let (code, _, _) =
            Code::parse(&form, &span(&form), &mut Resolver::new(), &mut Warnings::default()).unwrap();
        let mut w = Writer::new();
        w.write_bytes(&[0u8; 8]);
        let mut fixups = Fixups::new();
        let mut assignments = Assignments::default();
        let mut chains = Vec::new();
        code.write(&mut w, &mut fixups, &mut assignments, &mut chains).unwrap();
        fixups.apply(&assignments, &mut w).unwrap();
        assert!(chains.is_empty());
        assert_eq!(w.as_slice(), &form[..]);
    }

    #[test]
    fn undecodable_blob_is_kept_raw() {
        let mut form = sample();
        // opcode 0x01 does not exist
        form[0x14 + 3] = 0x01;
        let mut warnings = Warnings::default();
        let (code, slots, _) =
            Code::parse(&form, &span(&form), &mut Resolver::new(), &mut warnings).unwrap();
        assert_eq!(warnings.count(WarningKind::CorruptBytecode), 1);
        assert!(slots.is_empty());
        assert!(matches!(code.get(Id::new(0)).unwrap().bytecode(), Some(Bytecode::Raw { .. })));
        assert!(matches!(code.view(Id::new(1)), Err(Error::CorruptBytecode { .. })));
    }

    #[test]
    fn relayout_renumbers_addresses() {
        let ret = Instruction::new(0, Opcode::Ret, InstructionKind::SingleType { ty: DataType::Variable, extra: 0 });
        let mut body = Bytecode::Decoded(vec![ret, ret, ret]);
        body.relayout();
        let addresses: Vec<u32> = body.instructions().unwrap().iter().map(|i| i.address).collect();
        assert_eq!(addresses, vec![0, 4, 8]);
        assert_eq!(body.len(), 12);
    }
}
