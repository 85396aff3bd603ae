//! Entity arenas and the offset <-> entity mapping used on both sides of the codec.
//!
//! Entities never point at each other directly. A [`Reference`] names a table and an index into
//! it, and only turns into a file offset when the writer has laid every table out.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use crate::cursor::Writer;
use crate::error::{Error, Result, WarningKind, Warnings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TableId {
    Strings,
    Code,
    Instructions,
    Variables,
    Functions,
}

/// An entity type stored in one of the container's tables.
pub trait Entity {
    const TABLE: TableId;
}

pub struct Id<T> {
    index: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Id<T> {
    pub fn new(index: usize) -> Self {
        Self {
            index: index as u32,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn index(self) -> usize {
        self.index as usize
    }
}

impl<T> Clone for Id<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Id<T> {}

impl<T> PartialEq for Id<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<T> Eq for Id<T> {}

impl<T> PartialOrd for Id<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Id<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.index.cmp(&other.index)
    }
}

impl<T> Hash for Id<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state)
    }
}

impl<T> fmt::Debug for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.index)
    }
}

/// Dense arena of one entity type. Ids are positions and stay stable while the table only grows.
#[derive(Debug, Clone, PartialEq)]
pub struct Table<T> {
    items: Vec<T>,
}

impl<T> Default for Table<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<T> Table<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: T) -> Id<T> {
        self.items.push(item);
        Id::new(self.items.len() - 1)
    }

    pub fn get(&self, id: Id<T>) -> Option<&T> {
        self.items.get(id.index())
    }

    pub fn get_mut(&mut self, id: Id<T>) -> Option<&mut T> {
        self.items.get_mut(id.index())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, id: Id<T>) -> bool {
        id.index() < self.items.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Id<T>, &T)> {
        self.items.iter().enumerate().map(|(i, t)| (Id::new(i), t))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Id<T>, &mut T)> {
        self.items.iter_mut().enumerate().map(|(i, t)| (Id::new(i), t))
    }

    pub fn values(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }
}

impl<T> FromIterator<T> for Table<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self {
            items: iter.into_iter().collect(),
        }
    }
}

/// Addressing mode tag carried by variable and function operand words (`(word >> 24) & 0xF8`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefKind {
    Array,
    StackTop,
    Normal,
    Instance,
    MultiPush,
    MultiPushPop,
    Other(u8),
}

impl RefKind {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0xF8 {
            0x00 => RefKind::Array,
            0x80 => RefKind::StackTop,
            0xA0 => RefKind::Normal,
            0xE0 => RefKind::Instance,
            0x10 => RefKind::MultiPush,
            0x90 => RefKind::MultiPushPop,
            other => RefKind::Other(other),
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            RefKind::Array => 0x00,
            RefKind::StackTop => 0x80,
            RefKind::Normal => 0xA0,
            RefKind::Instance => 0xE0,
            RefKind::MultiPush => 0x10,
            RefKind::MultiPushPop => 0x90,
            RefKind::Other(b) => b & 0xF8,
        }
    }
}

impl fmt::Display for RefKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefKind::Array => f.write_str("array"),
            RefKind::StackTop => f.write_str("stacktop"),
            RefKind::Normal => f.write_str("normal"),
            RefKind::Instance => f.write_str("instance"),
            RefKind::MultiPush => f.write_str("multipush"),
            RefKind::MultiPushPop => f.write_str("multipushpop"),
            RefKind::Other(b) => write!(f, "kind{b:#04x}"),
        }
    }
}

pub enum Target<T> {
    Resolved(Id<T>),
    /// The raw on-disk value, kept so that an unresolvable field is written back unchanged.
    Unresolved(u32),
}

impl<T> Clone for Target<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Target<T> {}

impl<T> PartialEq for Target<T> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Target::Resolved(a), Target::Resolved(b)) => a == b,
            (Target::Unresolved(a), Target::Unresolved(b)) => a == b,
            _ => false,
        }
    }
}

impl<T> Eq for Target<T> {}

impl<T> fmt::Debug for Target<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Resolved(id) => write!(f, "{id:?}"),
            Target::Unresolved(raw) => write!(f, "raw({raw:#x})"),
        }
    }
}

pub struct Reference<T> {
    pub target: Target<T>,
    pub kind: RefKind,
}

impl<T> Reference<T> {
    pub fn to(id: Id<T>) -> Self {
        Self {
            target: Target::Resolved(id),
            kind: RefKind::Normal,
        }
    }

    pub fn with_kind(id: Id<T>, kind: RefKind) -> Self {
        Self {
            target: Target::Resolved(id),
            kind,
        }
    }

    pub fn unresolved(raw: u32, kind: RefKind) -> Self {
        Self {
            target: Target::Unresolved(raw),
            kind,
        }
    }

    pub fn id(&self) -> Option<Id<T>> {
        match self.target {
            Target::Resolved(id) => Some(id),
            Target::Unresolved(_) => None,
        }
    }
}

impl<T> Clone for Reference<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Reference<T> {}

impl<T> PartialEq for Reference<T> {
    fn eq(&self, other: &Self) -> bool {
        self.target == other.target && self.kind == other.kind
    }
}

impl<T> Eq for Reference<T> {}

impl<T> fmt::Debug for Reference<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.kind == RefKind::Normal {
            write!(f, "{:?}", self.target)
        } else {
            write!(f, "({}){:?}", self.kind, self.target)
        }
    }
}

#[derive(Debug, Clone)]
enum Stride {
    Fixed { stride: u32, count: u32 },
    Sparse(BTreeMap<u32, u32>),
}

#[derive(Debug, Clone)]
struct Region {
    table: TableId,
    base: u32,
    end: u32,
    stride: Stride,
}

impl Region {
    fn lookup(&self, offset: u32) -> Option<u32> {
        if offset < self.base || offset >= self.end {
            return None;
        }
        match &self.stride {
            Stride::Fixed { stride, count } => {
                let rel = offset - self.base;
                (rel % stride == 0 && rel / stride < *count).then_some(rel / stride)
            }
            Stride::Sparse(map) => map.get(&offset).copied(),
        }
    }
}

/// Read-side map from absolute file offsets to the table element living there.
#[derive(Debug, Clone, Default)]
pub struct Resolver {
    regions: Vec<Region>,
}

impl Resolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// A table of `count` records of `stride` bytes starting at `base`.
    pub fn register_fixed(&mut self, table: TableId, base: u32, stride: u32, count: u32) {
        if stride == 0 || count == 0 {
            return;
        }
        self.regions.push(Region {
            table,
            base,
            end: base.saturating_add(stride.saturating_mul(count)),
            stride: Stride::Fixed { stride, count },
        });
    }

    /// A table of variable-size elements, given as `(offset, index)` pairs.
    pub fn register_sparse(&mut self, table: TableId, offsets: impl IntoIterator<Item = (u32, u32)>) {
        let map: BTreeMap<u32, u32> = offsets.into_iter().collect();
        let (Some((&base, _)), Some((&last, _))) = (map.first_key_value(), map.last_key_value())
        else {
            return;
        };
        self.regions.push(Region {
            table,
            base,
            end: last.saturating_add(1),
            stride: Stride::Sparse(map),
        });
    }

    pub fn locate(&self, offset: u32) -> Option<(TableId, u32)> {
        self.regions
            .iter()
            .find_map(|r| r.lookup(offset).map(|i| (r.table, i)))
    }

    /// Index of the element of `table` at `offset`.
    pub fn index_in(&self, table: TableId, offset: u32) -> Option<u32> {
        self.regions
            .iter()
            .filter(|r| r.table == table)
            .find_map(|r| r.lookup(offset))
    }

    /// Turn an on-disk offset held by `reference` into an entity id.
    ///
    /// Unresolvable offsets stay raw and raise a `DanglingReference` warning naming `what`.
    pub fn resolve<T: Entity>(
        &self,
        reference: &mut Reference<T>,
        warnings: &mut Warnings,
        what: &dyn fmt::Display,
    ) -> bool {
        let Target::Unresolved(raw) = reference.target else {
            return true;
        };
        match self.index_in(T::TABLE, raw) {
            Some(index) => {
                reference.target = Target::Resolved(Id::new(index as usize));
                true
            }
            None => {
                warnings.warn(
                    WarningKind::DanglingReference,
                    format!("{what}: offset {raw:#x} does not point into the {:?} table", T::TABLE),
                );
                false
            }
        }
    }
}

/// Write-side record of where every laid-out entity landed.
#[derive(Debug, Clone, Default)]
pub struct Assignments {
    offsets: HashMap<(TableId, u32), u32>,
}

impl Assignments {
    pub fn assign<T: Entity>(&mut self, id: Id<T>, offset: usize) {
        self.offsets.insert((T::TABLE, id.index), offset as u32);
    }

    pub fn offset_of<T: Entity>(&self, id: Id<T>) -> Option<u32> {
        self.offsets.get(&(T::TABLE, id.index)).copied()
    }

    fn lookup(&self, table: TableId, index: u32) -> Option<u32> {
        self.offsets.get(&(table, index)).copied()
    }
}

#[derive(Debug, Clone, Copy)]
struct Fixup {
    at: usize,
    table: TableId,
    index: u32,
    adjust: i32,
}

/// Pointer fields written before their targets were laid out.
#[derive(Debug, Default)]
pub struct Fixups {
    pending: Vec<Fixup>,
}

impl Fixups {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write the absolute-offset field for `reference`.
    ///
    /// Unresolved references are written back as their raw value; resolved ones get a placeholder
    /// that [`Fixups::apply`] patches to `offset_of(target) + adjust`.
    pub fn write_offset<T: Entity>(&mut self, w: &mut Writer, reference: &Reference<T>, adjust: i32) {
        match reference.target {
            Target::Unresolved(raw) => w.write_u32(raw),
            Target::Resolved(id) => self.write_placeholder(w, T::TABLE, id.index as u32, adjust),
        }
    }

    pub fn write_placeholder(&mut self, w: &mut Writer, table: TableId, index: u32, adjust: i32) {
        self.pending.push(Fixup {
            at: w.position(),
            table,
            index,
            adjust,
        });
        w.write_u32(0);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn apply(self, assignments: &Assignments, w: &mut Writer) -> Result<()> {
        for fixup in self.pending {
            let offset = assignments.lookup(fixup.table, fixup.index).ok_or_else(|| {
                Error::InvariantViolation(format!(
                    "{:?} #{} referenced at {:#x} was never laid out",
                    fixup.table, fixup.index, fixup.at
                ))
            })?;
            w.patch_u32(fixup.at, offset.wrapping_add_signed(fixup.adjust))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Thing;
    impl Entity for Thing {
        const TABLE: TableId = TableId::Variables;
    }

    #[test]
    fn fixed_regions_map_offsets_to_indices() {
        let mut r = Resolver::new();
        r.register_fixed(TableId::Variables, 0x100, 20, 3);
        assert_eq!(r.locate(0x100), Some((TableId::Variables, 0)));
        assert_eq!(r.locate(0x100 + 40), Some((TableId::Variables, 2)));
        assert_eq!(r.locate(0x100 + 60), None);
        assert_eq!(r.locate(0x104), None);
    }

    #[test]
    fn dangling_references_stay_raw_and_warn() {
        let mut r = Resolver::new();
        r.register_sparse(TableId::Variables, [(0x40, 0), (0x58, 1)]);
        let mut warnings = Warnings::default();

        let mut good: Reference<Thing> = Reference::unresolved(0x58, RefKind::Normal);
        assert!(r.resolve(&mut good, &mut warnings, &"good"));
        assert_eq!(good.id(), Some(Id::new(1)));

        let mut bad: Reference<Thing> = Reference::unresolved(0x44, RefKind::Normal);
        assert!(!r.resolve(&mut bad, &mut warnings, &"bad"));
        assert_eq!(bad.target, Target::Unresolved(0x44));
        assert_eq!(warnings.count(WarningKind::DanglingReference), 1);
    }

    #[test]
    fn fixups_patch_after_layout() {
        let mut w = Writer::new();
        let mut fixups = Fixups::new();
        let mut table: Table<Thing> = Table::new();
        let id = table.push(Thing);

        fixups.write_offset(&mut w, &Reference::to(id), 4);
        fixups.write_offset::<Thing>(&mut w, &Reference::unresolved(0x77, RefKind::Normal), 4);

        let mut assignments = Assignments::default();
        assignments.assign(id, 0x30);
        fixups.apply(&assignments, &mut w).unwrap();
        assert_eq!(w.read_u32_at(0), Some(0x34));
        assert_eq!(w.read_u32_at(4), Some(0x77));
    }

    #[test]
    fn missing_assignment_is_an_invariant_violation() {
        let mut w = Writer::new();
        let mut fixups = Fixups::new();
        fixups.write_placeholder(&mut w, TableId::Strings, 9, 0);
        assert!(matches!(
            fixups.apply(&Assignments::default(), &mut w),
            Err(Error::InvariantViolation(_))
        ));
    }

    #[test]
    fn ref_kind_bits_survive() {
        for bits in [0x00u8, 0x80, 0xA0, 0xE0, 0x10, 0x90, 0x48] {
            assert_eq!(RefKind::from_bits(bits).bits(), bits);
        }
    }
}
