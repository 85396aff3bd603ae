//! The `FORM` container as a graph of chunks, and the two directions of the codec.
//!
//! Loading happens in two phases. Every modelled chunk is parsed first and registers its tables
//! with a shared [`Resolver`]; only then are names, string operands and occurrence chains
//! resolved, since STRG usually comes after the chunks that point into it. Writing lays every
//! chunk out with placeholders, patches lengths, applies the pointer fixups and finally rebuilds
//! the occurrence chains.
//!
//! Unless [`LoadOptions::verify_round_trip`] is off, a freshly built graph is serialized and
//! compared against its input chunk by chunk. A modelled chunk that does not reproduce is demoted
//! to opaque bytes (CODE, VARI and FUNC together) and the load starts over.

use std::borrow::Cow;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use bytes::Bytes;

use crate::bytecode::disasm::Symbols;
use crate::bytecode::instruction::{InstructionKind, PushValue};
use crate::cursor::Writer;
use crate::error::{Error, Result, WarningKind, Warnings};
use crate::format::chains::{patch_chains, resolve_chains};
use crate::format::chunks::code::{Bytecode, Code, CodeBody, CodeEntry, InstructionSlots};
use crate::format::chunks::func::{Function, Functions};
use crate::format::chunks::strg::{GmString, Strings};
use crate::format::chunks::vari::{Variable, Variables};
use crate::format::directory::{locate_form, ChunkDirectory, ChunkHeader, ChunkSpan, Tag, CHUNK_HEADER_SIZE};
use crate::format::resolver::{Assignments, Fixups, Id, Reference, Resolver, Target};

/// Oldest bytecode version whose CODE, VARI and FUNC layout is modelled.
pub const MIN_BYTECODE_VERSION: u8 = 15;

const PADDING_ALIGNMENTS: [u32; 8] = [1, 2, 4, 8, 16, 32, 64, 128];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOptions {
    /// Serialize the loaded graph and demote chunks that do not reproduce their input.
    pub verify_round_trip: bool,
    /// Warnings kept per load; further ones are only counted.
    pub warning_limit: usize,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            verify_round_trip: true,
            warning_limit: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChunkBody {
    Opaque(Bytes),
    Strings(Strings),
    Code(Code),
    Variables(Variables),
    Functions(Functions),
}

impl ChunkBody {
    pub fn is_opaque(&self) -> bool {
        matches!(self, ChunkBody::Opaque(_))
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            ChunkBody::Opaque(_) => "opaque",
            ChunkBody::Strings(_) => "strings",
            ChunkBody::Code(_) => "code",
            ChunkBody::Variables(_) => "variables",
            ChunkBody::Functions(_) => "functions",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub tag: Tag,
    pub body: ChunkBody,
    /// Absolute alignment the zero padding after a modelled body rounds up to.
    pub align: u32,
}

impl Chunk {
    pub fn new(tag: Tag, body: ChunkBody) -> Self {
        Self { tag, body, align: 1 }
    }

    pub fn opaque(tag: Tag, payload: impl Into<Bytes>) -> Self {
        Self::new(tag, ChunkBody::Opaque(payload.into()))
    }
}

/// Chunks that are modelled or demoted as a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Group {
    Strings,
    /// CODE, VARI and FUNC, which point into each other through occurrence chains.
    Program,
}

fn group_of(tag: Tag) -> Option<Group> {
    match tag {
        Tag::STRG => Some(Group::Strings),
        Tag::CODE | Tag::VARI | Tag::FUNC => Some(Group::Program),
        _ => None,
    }
}

fn align_up(at: usize, align: u32) -> usize {
    let align = align as usize;
    at.div_ceil(align) * align
}

/// Smallest alignment that explains the zeros between `content_end` and `end`.
fn detect_alignment(form: &[u8], content_end: usize, end: usize) -> Option<u32> {
    let padding = form.get(content_end..end)?;
    if padding.iter().any(|&b| b != 0) {
        return None;
    }
    PADDING_ALIGNMENTS
        .into_iter()
        .find(|&a| align_up(content_end, a) == end)
}

#[derive(Debug)]
pub struct Loaded {
    pub container: Container,
    pub warnings: Warnings,
}

#[derive(Debug)]
pub struct Serialized {
    pub bytes: Vec<u8>,
    pub warnings: Warnings,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Container {
    /// Bytes before `FORM`, e.g. the runner executable.
    pub prefix: Vec<u8>,
    /// Bytes after the declared FORM size.
    pub trailer: Vec<u8>,
    chunks: Vec<Chunk>,
    source_len: usize,
}

impl Container {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(bytes: &[u8]) -> Result<Loaded> {
        Self::parse_with(bytes, &LoadOptions::default())
    }

    pub fn parse_with(bytes: &[u8], options: &LoadOptions) -> Result<Loaded> {
        let (start, end) = locate_form(bytes)?;
        let form = &bytes[start..end];
        let dir = ChunkDirectory::parse(form)?;
        log::debug!("FORM at {start:#x}, {} chunks", dir.spans.len());

        let mut demoted: Vec<(Group, String)> = Vec::new();
        let demote = |demoted: &mut Vec<(Group, String)>, group: Group, reason: String| {
            if demoted.iter().any(|(g, _)| *g == group) {
                return Err(Error::InvariantViolation(format!(
                    "{group:?} chunks still do not reproduce after demotion: {reason}"
                )));
            }
            log::info!("demoting {group:?} chunks: {reason}");
            demoted.push((group, reason));
            Ok(())
        };

        loop {
            let mut warnings = Warnings::with_limit(options.warning_limit);
            for (group, reason) in &demoted {
                warnings.warn(
                    WarningKind::Demoted,
                    format!("{group:?} chunks kept as raw bytes: {reason}"),
                );
            }
            let skip: HashSet<Group> = demoted.iter().map(|(g, _)| *g).collect();

            let mut container = match build(form, &dir, &skip, &mut warnings) {
                Ok(container) => container,
                Err((group, error)) => {
                    demote(&mut demoted, group, error.to_string())?;
                    continue;
                }
            };
            container.prefix = bytes[..start].to_vec();
            container.trailer = bytes[end..].to_vec();
            container.source_len = bytes.len();

            if !options.verify_round_trip {
                return Ok(Loaded {
                    container,
                    warnings,
                });
            }
            match container.first_mismatch(form, &dir) {
                Ok(None) => {
                    return Ok(Loaded {
                        container,
                        warnings,
                    })
                }
                Ok(Some((group, tag))) => {
                    demote(&mut demoted, group, format!("{tag} does not reproduce its input"))?
                }
                Err(e) => {
                    let group = container.modelled_groups().into_iter().next().ok_or(e)?;
                    demote(&mut demoted, group, "graph does not serialize".to_string())?
                }
            }
        }
    }

    /// Serialize the graph in memory, FORM envelope plus the preserved prefix and trailer.
    pub fn serialize(&self) -> Result<Serialized> {
        let mut warnings = Warnings::default();
        let form = self.write_form(&mut warnings)?;
        let mut bytes = Vec::with_capacity(self.prefix.len() + form.len() + self.trailer.len());
        bytes.extend_from_slice(&self.prefix);
        bytes.extend(form);
        bytes.extend_from_slice(&self.trailer);
        Ok(Serialized { bytes, warnings })
    }

    /// Serialize to a sibling staging file and move it over `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<Warnings> {
        let path = path.as_ref();
        let Serialized { bytes, warnings } = self.serialize()?;
        let mut staging = path.as_os_str().to_owned();
        staging.push(".tmp");
        let staging = PathBuf::from(staging);
        std::fs::write(&staging, &bytes)?;
        if let Err(e) = std::fs::rename(&staging, path) {
            let _ = std::fs::remove_file(&staging);
            return Err(e.into());
        }
        log::info!("wrote {} bytes to {}", bytes.len(), path.display());
        Ok(warnings)
    }

    /// Size of the input this container was parsed from.
    pub fn source_len(&self) -> usize {
        self.source_len
    }

    /// Bytecode version from GEN8.
    pub fn bytecode_version(&self) -> Option<u8> {
        match &self.chunk(Tag::GEN8)?.body {
            ChunkBody::Opaque(payload) => payload.get(1).copied(),
            _ => None,
        }
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn chunk(&self, tag: Tag) -> Option<&Chunk> {
        self.chunks.iter().find(|c| c.tag == tag)
    }

    pub fn chunk_mut(&mut self, tag: Tag) -> Option<&mut Chunk> {
        self.chunks.iter_mut().find(|c| c.tag == tag)
    }

    /// Append a chunk after the existing ones.
    pub fn push_chunk(&mut self, chunk: Chunk) -> Result<()> {
        if !chunk.tag.is_well_formed() || self.chunk(chunk.tag).is_some() {
            return Err(Error::InvariantViolation(format!(
                "cannot add chunk {}: tag is malformed or already present",
                chunk.tag
            )));
        }
        self.chunks.push(chunk);
        Ok(())
    }

    pub fn remove_chunk(&mut self, tag: Tag) -> Option<Chunk> {
        let index = self.chunks.iter().position(|c| c.tag == tag)?;
        Some(self.chunks.remove(index))
    }

    pub fn strings(&self) -> Option<&Strings> {
        self.chunks.iter().find_map(|c| match &c.body {
            ChunkBody::Strings(s) => Some(s),
            _ => None,
        })
    }

    pub fn strings_mut(&mut self) -> Option<&mut Strings> {
        self.chunks.iter_mut().find_map(|c| match &mut c.body {
            ChunkBody::Strings(s) => Some(s),
            _ => None,
        })
    }

    pub fn code(&self) -> Option<&Code> {
        self.chunks.iter().find_map(|c| match &c.body {
            ChunkBody::Code(code) => Some(code),
            _ => None,
        })
    }

    pub fn code_mut(&mut self) -> Option<&mut Code> {
        self.chunks.iter_mut().find_map(|c| match &mut c.body {
            ChunkBody::Code(code) => Some(code),
            _ => None,
        })
    }

    pub fn variables(&self) -> Option<&Variables> {
        self.chunks.iter().find_map(|c| match &c.body {
            ChunkBody::Variables(v) => Some(v),
            _ => None,
        })
    }

    pub fn variables_mut(&mut self) -> Option<&mut Variables> {
        self.chunks.iter_mut().find_map(|c| match &mut c.body {
            ChunkBody::Variables(v) => Some(v),
            _ => None,
        })
    }

    pub fn functions(&self) -> Option<&Functions> {
        self.chunks.iter().find_map(|c| match &c.body {
            ChunkBody::Functions(f) => Some(f),
            _ => None,
        })
    }

    pub fn functions_mut(&mut self) -> Option<&mut Functions> {
        self.chunks.iter_mut().find_map(|c| match &mut c.body {
            ChunkBody::Functions(f) => Some(f),
            _ => None,
        })
    }

    pub fn text(&self, reference: &Reference<GmString>) -> Option<Cow<'_, str>> {
        Some(self.strings()?.get(reference.id()?)?.text())
    }

    pub fn entry_name(&self, id: Id<CodeEntry>) -> Option<Cow<'_, str>> {
        self.text(&self.code()?.get(id)?.name)
    }

    fn modelled_groups(&self) -> Vec<Group> {
        let mut groups: Vec<Group> = self
            .chunks
            .iter()
            .filter(|c| !c.body.is_opaque())
            .filter_map(|c| group_of(c.tag))
            .collect();
        // demote the program first, it is the likelier culprit
        groups.sort_by_key(|g| *g != Group::Program);
        groups.dedup();
        groups
    }

    /// Resolve names, string operands and occurrence chains once every table is registered.
    fn resolve(
        &mut self,
        resolver: &Resolver,
        slots: &InstructionSlots,
        version: u8,
        warnings: &mut Warnings,
    ) {
        let mut strings_len = None;
        let mut code = None;
        let mut variables = None;
        let mut functions = None;
        for chunk in &mut self.chunks {
            match &mut chunk.body {
                ChunkBody::Strings(s) => strings_len = Some(s.items.len()),
                ChunkBody::Code(c) => code = Some(c),
                ChunkBody::Variables(v) => variables = Some(v),
                ChunkBody::Functions(f) => functions = Some(f),
                ChunkBody::Opaque(_) => {}
            }
        }

        if let Some(v) = variables.as_deref_mut() {
            v.resolve_names(resolver, warnings);
        }
        if let Some(f) = functions.as_deref_mut() {
            f.resolve_names(resolver, warnings);
        }
        let Some(code) = code else {
            return;
        };
        code.resolve_names(resolver, warnings);
        if let (Some(v), Some(f)) = (variables, functions) {
            resolve_chains(code, slots, v, f, resolver, version, warnings);
        }

        let Some(strings_len) = strings_len else {
            return;
        };
        for (id, entry) in code.entries.iter_mut() {
            let CodeBody::Root(Bytecode::Decoded(insts)) = &mut entry.body else {
                continue;
            };
            for inst in insts {
                let InstructionKind::Push {
                    value: PushValue::String(s),
                    ..
                } = &mut inst.kind
                else {
                    continue;
                };
                let Target::Unresolved(index) = s.target else {
                    continue;
                };
                if (index as usize) < strings_len {
                    s.target = Target::Resolved(Id::new(index as usize));
                } else {
                    warnings.warn(
                        WarningKind::DanglingReference,
                        format!(
                            "code entry {} at {:#x}: string index {index} is out of range",
                            id.index(),
                            inst.address
                        ),
                    );
                }
            }
        }
    }

    fn write_form(&self, warnings: &mut Warnings) -> Result<Vec<u8>> {
        let mut w = Writer::new();
        w.write_record(&ChunkHeader {
            tag: Tag::FORM.0,
            length: 0,
        })?;

        let mut fixups = Fixups::new();
        let mut assignments = Assignments::default();
        let mut chains = Vec::new();
        for chunk in &self.chunks {
            let header_at = w.position();
            w.write_record(&ChunkHeader {
                tag: chunk.tag.0,
                length: 0,
            })?;
            let data_at = w.position();
            match &chunk.body {
                ChunkBody::Opaque(payload) => w.write_bytes(payload),
                ChunkBody::Strings(s) => s.write(&mut w, &mut fixups, &mut assignments)?,
                ChunkBody::Code(c) => c.write(&mut w, &mut fixups, &mut assignments, &mut chains)?,
                ChunkBody::Variables(v) => v.write(&mut w, &mut fixups, &mut assignments)?,
                ChunkBody::Functions(f) => f.write(&mut w, &mut fixups, &mut assignments)?,
            }
            if !chunk.body.is_opaque() {
                w.align(chunk.align, 0);
            }
            w.patch_u32(header_at + 4, (w.position() - data_at) as u32)?;
        }
        w.patch_u32(4, (w.position() - CHUNK_HEADER_SIZE) as u32)?;

        log::debug!(
            "laid out {} chunks, {} pointer fixups, {} chain operands",
            self.chunks.len(),
            fixups.len(),
            chains.len()
        );
        fixups.apply(&assignments, &mut w)?;
        patch_chains(
            &mut w,
            &chains,
            &assignments,
            self.variables(),
            self.functions(),
            self.bytecode_version().unwrap_or(0),
            warnings,
        )?;
        Ok(w.into_inner())
    }

    /// First modelled chunk whose serialized payload differs from the input.
    fn first_mismatch(&self, form: &[u8], dir: &ChunkDirectory) -> Result<Option<(Group, Tag)>> {
        let out = self.write_form(&mut Warnings::with_limit(0))?;
        let out_dir = ChunkDirectory::parse(&out)?;
        if out_dir.spans.len() != dir.spans.len() {
            return Err(Error::InvariantViolation(format!(
                "wrote {} chunks, read {}",
                out_dir.spans.len(),
                dir.spans.len()
            )));
        }
        for ((input, output), chunk) in dir.spans.iter().zip(&out_dir.spans).zip(&self.chunks) {
            if input.payload(form) == output.payload(&out) {
                continue;
            }
            return match group_of(input.tag) {
                Some(group) if !chunk.body.is_opaque() => Ok(Some((group, input.tag))),
                _ => Err(Error::InvariantViolation(format!(
                    "opaque chunk {} changed on write",
                    input.tag
                ))),
            };
        }
        Ok(None)
    }
}

fn modelled_body(
    form: &[u8],
    span: &ChunkSpan,
    resolver: &mut Resolver,
    slots: &mut InstructionSlots,
    warnings: &mut Warnings,
) -> Result<(ChunkBody, usize)> {
    Ok(match span.tag {
        Tag::STRG => {
            let (s, end) = Strings::parse(form, span, resolver, warnings)?;
            (ChunkBody::Strings(s), end)
        }
        Tag::CODE => {
            let (c, parsed_slots, end) = Code::parse(form, span, resolver, warnings)?;
            *slots = parsed_slots;
            (ChunkBody::Code(c), end)
        }
        Tag::VARI => {
            let (v, end) = Variables::parse(form, span, resolver)?;
            (ChunkBody::Variables(v), end)
        }
        Tag::FUNC => {
            let (f, end) = Functions::parse(form, span, resolver, warnings)?;
            (ChunkBody::Functions(f), end)
        }
        tag => return Err(Error::InvariantViolation(format!("{tag} has no model"))),
    })
}

/// Build a graph from a parsed directory, skipping the `demoted` groups. A failure names the
/// group whose chunk could not be modelled.
fn build(
    form: &[u8],
    dir: &ChunkDirectory,
    demoted: &HashSet<Group>,
    warnings: &mut Warnings,
) -> std::result::Result<Container, (Group, Error)> {
    let version = dir
        .get(Tag::GEN8)
        .and_then(|s| s.payload(form).get(1).copied());
    let code_len = dir.get(Tag::CODE).map_or(0, |s| s.length);
    let program_complete = [Tag::CODE, Tag::VARI, Tag::FUNC]
        .into_iter()
        .all(|t| dir.get(t).is_some_and(|s| s.length > 0));
    let version_ok = version.is_some_and(|v| v >= MIN_BYTECODE_VERSION);
    let model_program = program_complete && version_ok && !demoted.contains(&Group::Program);
    if code_len > 0 && !demoted.contains(&Group::Program) {
        if !version_ok {
            warnings.warn(
                WarningKind::UnsupportedVersion,
                format!(
                    "bytecode version {} is not supported, CODE, VARI and FUNC kept as raw bytes",
                    version.map_or("unknown".to_string(), |v| v.to_string())
                ),
            );
        } else if !program_complete {
            warnings.warn(
                WarningKind::TruncatedSection,
                "CODE without VARI and FUNC, kept as raw bytes",
            );
        }
    }

    let mut resolver = Resolver::new();
    let mut slots = InstructionSlots::default();
    let mut chunks = Vec::with_capacity(dir.spans.len());
    for span in &dir.spans {
        let group = group_of(span.tag).filter(|g| match g {
            Group::Strings => !demoted.contains(g),
            Group::Program => model_program,
        });
        let chunk = match group {
            Some(group) => {
                let (body, content_end) =
                    modelled_body(form, span, &mut resolver, &mut slots, warnings)
                        .map_err(|e| (group, e))?;
                let align = detect_alignment(form, content_end, span.data_end()).ok_or_else(|| {
                    (
                        group,
                        Error::malformed(
                            content_end,
                            format!("{} ends in padding that is not zero-filled alignment", span.tag),
                        ),
                    )
                })?;
                Chunk {
                    tag: span.tag,
                    body,
                    align,
                }
            }
            None => {
                if !span.tag.is_known() {
                    warnings.warn(
                        WarningKind::UnknownChunkType,
                        format!(
                            "unknown chunk {} ({} bytes) kept as raw bytes",
                            span.tag, span.length
                        ),
                    );
                }
                Chunk::opaque(span.tag, Bytes::copy_from_slice(span.payload(form)))
            }
        };
        chunks.push(chunk);
    }

    let mut container = Container {
        chunks,
        ..Container::default()
    };
    container.resolve(&resolver, &slots, version.unwrap_or(0), warnings);
    Ok(container)
}

impl Symbols for Container {
    fn string(&self, reference: &Reference<GmString>) -> Option<Cow<'_, str>> {
        self.text(reference)
    }

    fn variable_name(&self, reference: &Reference<Variable>) -> Option<Cow<'_, str>> {
        let var = self.variables()?.get(reference.id()?)?;
        self.text(&var.name)
    }

    fn function_name(&self, reference: &Reference<Function>) -> Option<Cow<'_, str>> {
        let func = self.functions()?.get(reference.id()?)?;
        self.text(&func.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn form(chunks: &[(&[u8; 4], &[u8])]) -> Vec<u8> {
        let mut body = Vec::new();
        for (tag, payload) in chunks {
            body.extend_from_slice(*tag);
            body.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            body.extend_from_slice(payload);
        }
        let mut out = b"FORM".to_vec();
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend(body);
        out
    }

    #[test]
    fn padding_alignment_is_the_smallest_fit() {
        let buf = [0u8; 64];
        assert_eq!(detect_alignment(&buf, 20, 20), Some(1));
        assert_eq!(detect_alignment(&buf, 20, 24), Some(8));
        assert_eq!(detect_alignment(&buf, 17, 32), Some(16));
        assert_eq!(detect_alignment(&buf, 17, 19), None);
        let mut dirty = buf;
        dirty[21] = 1;
        assert_eq!(detect_alignment(&dirty, 20, 24), None);
    }

    #[test]
    fn opaque_chunks_and_envelope_round_trip() {
        let mut bytes = b"MZ-runner-".to_vec();
        bytes.extend(form(&[(b"GEN8", &[0, 16, 0, 0][..]), (b"ZZZZ", &[7u8; 10][..])]));
        bytes.extend_from_slice(b"tail");

        let Loaded {
            container,
            warnings,
        } = Container::parse(&bytes).unwrap();
        // `MZ` scanning needs GEN8 right after FORM, which holds here
        assert_eq!(container.prefix, b"MZ-runner-");
        assert_eq!(container.trailer, b"tail");
        assert_eq!(container.bytecode_version(), Some(16));
        assert_eq!(warnings.count(WarningKind::UnknownChunkType), 1);
        assert_eq!(warnings.len(), 1);
        assert_eq!(container.serialize().unwrap().bytes, bytes);
    }

    #[test]
    fn old_bytecode_keeps_program_opaque() {
        let bytes = form(&[
            (b"GEN8", &[0, 14, 0, 0][..]),
            (b"CODE", &[0, 0, 0, 0][..]),
            (b"VARI", &[0; 12][..]),
            (b"FUNC", &[0; 4][..]),
        ]);
        let loaded = Container::parse(&bytes).unwrap();
        assert_eq!(loaded.warnings.count(WarningKind::UnsupportedVersion), 1);
        assert!(loaded.container.code().is_none());
        assert!(loaded.container.chunk(Tag::CODE).unwrap().body.is_opaque());
    }

    #[test]
    fn push_chunk_rejects_duplicates() {
        let mut c = Container::new();
        c.push_chunk(Chunk::opaque(Tag::GEN8, vec![0u8, 17])).unwrap();
        assert!(c.push_chunk(Chunk::opaque(Tag::GEN8, Vec::<u8>::new())).is_err());
        assert!(c.push_chunk(Chunk::opaque(Tag(*b"a b!"), Vec::<u8>::new())).is_err());
        assert_eq!(c.remove_chunk(Tag::GEN8).map(|c| c.tag), Some(Tag::GEN8));
        assert!(c.chunks().is_empty());
    }
}
