use std::collections::HashSet;
use std::fmt;

use binrw::{BinRead, BinWrite};

use crate::cursor::Cursor;
use crate::error::{Error, Result};

/// Four-character chunk identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(pub [u8; 4]);

impl Tag {
    pub const FORM: Tag = Tag(*b"FORM");
    pub const GEN8: Tag = Tag(*b"GEN8");
    pub const STRG: Tag = Tag(*b"STRG");
    pub const CODE: Tag = Tag(*b"CODE");
    pub const VARI: Tag = Tag(*b"VARI");
    pub const FUNC: Tag = Tag(*b"FUNC");

    pub const fn new(raw: &[u8; 4]) -> Self {
        Tag(*raw)
    }

    pub fn is_well_formed(&self) -> bool {
        self.0.iter().all(|b| b.is_ascii_alphanumeric())
    }

    /// Tags a GameMaker runner writes that this crate carries as opaque payloads.
    pub fn is_known(&self) -> bool {
        KNOWN_TAGS.contains(&&self.0)
    }
}

const KNOWN_TAGS: &[&[u8; 4]] = &[
    b"GEN8", b"OPTN", b"LANG", b"EXTN", b"SOND", b"AGRP", b"SPRT", b"BGND", b"PATH", b"SCPT",
    b"GLOB", b"SHDR", b"FONT", b"TMLN", b"OBJT", b"ROOM", b"DAFL", b"EMBI", b"TPAG", b"TGIN",
    b"ACRV", b"SEQN", b"TAGS", b"FEAT", b"FEDS", b"PSEM", b"PSYS", b"TXTR", b"AUDO", b"UILR",
    b"STRG", b"CODE", b"VARI", b"FUNC",
];

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in &self.0 {
            if b.is_ascii_graphic() {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{b:02x}")?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tag({self})")
    }
}

#[derive(BinRead, BinWrite, Debug, Clone, Copy, PartialEq, Eq)]
#[brw(little)]
pub struct ChunkHeader {
    pub tag: [u8; 4],
    pub length: u32,
}

pub const CHUNK_HEADER_SIZE: usize = 8;

/// Where one chunk sits inside the FORM buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpan {
    pub tag: Tag,
    pub header_offset: usize,
    pub data_offset: usize,
    pub length: usize,
}

impl ChunkSpan {
    #[inline]
    pub fn data_end(&self) -> usize {
        self.data_offset + self.length
    }

    pub fn payload<'a>(&self, form: &'a [u8]) -> &'a [u8] {
        &form[self.data_offset..self.data_end()]
    }
}

/// Layer one of the container: the sequence of `(tag, length, payload)` records inside `FORM`.
#[derive(Debug, Clone, Default)]
pub struct ChunkDirectory {
    pub form_size: u32,
    pub spans: Vec<ChunkSpan>,
}

impl ChunkDirectory {
    /// Walk the chunk records of a buffer that starts with the `FORM` magic.
    ///
    /// Bytes past the declared FORM size are not inspected.
    pub fn parse(form: &[u8]) -> Result<Self> {
        let mut c = Cursor::new(form);
        let header: ChunkHeader = c
            .read_record()
            .map_err(|_| Error::malformed(0, "input too short for a FORM header"))?;
        if Tag(header.tag) != Tag::FORM {
            return Err(Error::malformed(
                0,
                format!("bad magic {}, expected FORM", Tag(header.tag)),
            ));
        }

        let end = CHUNK_HEADER_SIZE + header.length as usize;
        if end > form.len() {
            return Err(Error::malformed(
                4,
                format!(
                    "FORM declares {:#x} bytes but only {:#x} follow",
                    header.length,
                    form.len() - CHUNK_HEADER_SIZE
                ),
            ));
        }

        let mut c = Cursor::fenced(form, CHUNK_HEADER_SIZE, end)?;
        let mut spans = Vec::new();
        let mut seen = HashSet::new();
        while c.remaining() > 0 {
            let header_offset = c.position();
            let header: ChunkHeader = c.read_record().map_err(|_| {
                Error::malformed(header_offset, "truncated chunk header")
            })?;
            let tag = Tag(header.tag);
            if !tag.is_well_formed() {
                return Err(Error::malformed(header_offset, format!("invalid chunk tag {tag}")));
            }
            if !seen.insert(tag) {
                return Err(Error::malformed(header_offset, format!("duplicate chunk {tag}")));
            }
            let data_offset = c.position();
            let length = header.length as usize;
            if length > c.remaining() {
                return Err(Error::malformed(
                    header_offset + 4,
                    format!(
                        "chunk {tag} declares {length:#x} bytes but only {:#x} remain",
                        c.remaining()
                    ),
                ));
            }
            c.skip(length)?;
            log::debug!("chunk {tag} at {data_offset:#x}, {length:#x} bytes");
            spans.push(ChunkSpan {
                tag,
                header_offset,
                data_offset,
                length,
            });
        }

        Ok(Self {
            form_size: header.length,
            spans,
        })
    }

    pub fn get(&self, tag: Tag) -> Option<&ChunkSpan> {
        self.spans.iter().find(|s| s.tag == tag)
    }

    pub fn tags(&self) -> impl Iterator<Item = Tag> + '_ {
        self.spans.iter().map(|s| s.tag)
    }
}

/// Locate the `FORM` envelope inside `bytes`.
///
/// Returns `(start, end)` of the envelope. Windows builds embed the data file inside the runner
/// executable, so an `MZ` image is scanned for a plausible envelope whose first chunk is GEN8.
pub fn locate_form(bytes: &[u8]) -> Result<(usize, usize)> {
    let envelope_at = |start: usize| -> Option<usize> {
        let size = bytes.get(start + 4..start + 8)?;
        let size = u32::from_le_bytes([size[0], size[1], size[2], size[3]]) as usize;
        let end = start.checked_add(CHUNK_HEADER_SIZE)?.checked_add(size)?;
        (end <= bytes.len()).then_some(end)
    };

    if bytes.starts_with(b"FORM") {
        let end = envelope_at(0).ok_or_else(|| {
            Error::malformed(4, "FORM size runs past the end of input")
        })?;
        return Ok((0, end));
    }

    if bytes.starts_with(b"MZ") {
        let mut from = 0;
        while let Some(hit) = find(&bytes[from..], b"FORM") {
            let start = from + hit;
            if bytes.get(start + 8..start + 12) == Some(&b"GEN8"[..]) {
                if let Some(end) = envelope_at(start) {
                    return Ok((start, end));
                }
            }
            from = start + 1;
        }
        return Err(Error::malformed(0, "executable contains no FORM envelope"));
    }

    let magic = bytes.get(..4).map(|m| String::from_utf8_lossy(m).into_owned());
    Err(Error::malformed(
        0,
        format!("bad magic {:?}, expected FORM", magic.unwrap_or_default()),
    ))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
