use std::borrow::Cow;

use crate::cursor::{Cursor, Writer};
use crate::error::{Result, WarningKind, Warnings};
use crate::format::directory::ChunkSpan;
use crate::format::resolver::{Assignments, Entity, Fixups, Id, Resolver, Table, TableId};

/// Length-prefixed, NUL-terminated string record. The bytes are kept verbatim; text access is
/// a lossy UTF-8 view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GmString {
    pub bytes: Vec<u8>,
}

impl Entity for GmString {
    const TABLE: TableId = TableId::Strings;
}

impl GmString {
    pub fn new(text: &str) -> Self {
        Self {
            bytes: text.as_bytes().to_vec(),
        }
    }

    pub fn text(&self) -> Cow<'_, str> {
        encoding_rs::UTF_8.decode_without_bom_handling(&self.bytes).0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Strings {
    pub items: Table<GmString>,
    /// Alignment of every record start.
    pub record_align: u32,
}

impl Default for Strings {
    fn default() -> Self {
        Self {
            items: Table::new(),
            record_align: 4,
        }
    }
}

impl Strings {
    pub fn get(&self, id: Id<GmString>) -> Option<&GmString> {
        self.items.get(id)
    }

    pub fn find(&self, text: &str) -> Option<Id<GmString>> {
        self.items
            .iter()
            .find(|(_, s)| s.bytes == text.as_bytes())
            .map(|(id, _)| id)
    }

    /// Id of `text`, appending it when absent.
    pub fn intern(&mut self, text: &str) -> Id<GmString> {
        match self.find(text) {
            Some(id) => id,
            None => self.items.push(GmString::new(text)),
        }
    }

    /// Returns the table and the end of the last record.
    pub fn parse(
        form: &[u8],
        span: &ChunkSpan,
        resolver: &mut Resolver,
        warnings: &mut Warnings,
    ) -> Result<(Self, usize)> {
        let mut c = Cursor::fenced(form, span.data_offset, span.data_end())?;
        let pointers = c.read_pointer_list()?;
        let mut content_end = c.position();

        let mut items = Table::new();
        let mut offsets = Vec::with_capacity(pointers.len());
        let mut aligned = true;
        for (index, &ptr) in pointers.iter().enumerate() {
            let ptr = ptr as usize;
            if ptr < span.data_offset {
                return Err(crate::error::Error::malformed(
                    ptr,
                    format!("string {index} points outside STRG"),
                ));
            }
            c.seek(ptr)?;
            let len = c.read_u32()? as usize;
            let bytes = c.read_bytes(len)?.to_vec();
            if c.read_u8()? != 0 {
                warnings.warn(
                    WarningKind::TruncatedSection,
                    format!("string {index} at {ptr:#x} is not NUL terminated"),
                );
            }
            if std::str::from_utf8(&bytes).is_err() {
                warnings.warn(
                    WarningKind::Encoding,
                    format!("string {index} at {ptr:#x} is not valid UTF-8"),
                );
            }
            aligned &= ptr % 4 == 0;
            content_end = content_end.max(c.position());
            offsets.push((ptr as u32 + 4, index as u32));
            items.push(GmString { bytes });
        }

        resolver.register_sparse(TableId::Strings, offsets);
        log::debug!("STRG: {} strings", items.len());
        Ok((
            Self {
                items,
                record_align: if aligned { 4 } else { 1 },
            },
            content_end,
        ))
    }

    pub fn write(&self, w: &mut Writer, fixups: &mut Fixups, assignments: &mut Assignments) -> Result<()> {
        w.write_u32(self.items.len() as u32);
        for (id, _) in self.items.iter() {
            fixups.write_placeholder(w, TableId::Strings, id.index() as u32, -4);
        }
        for (id, s) in self.items.iter() {
            w.align(self.record_align, 0);
            assignments.assign(id, w.position() + 4);
            w.write_u32(s.bytes.len() as u32);
            w.write_bytes(&s.bytes);
            w.write_u8(0);
        }
        Ok(())
    }
}
