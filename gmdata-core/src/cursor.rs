//! Little-endian byte cursor and growable writer.
//!
//! Positions are absolute within the buffer handed to [`Cursor::new`]; a cursor can be fenced to a
//! sub-range (one chunk payload) so a read that would cross the fence fails instead of silently
//! consuming the next chunk.

use std::io;

use binrw::meta::{ReadEndian, WriteEndian};
use binrw::{BinRead, BinWrite};

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
    end: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            end: data.len(),
        }
    }

    /// A cursor positioned at `start` that refuses to read at or past `end`.
    pub fn fenced(data: &'a [u8], start: usize, end: usize) -> Result<Self> {
        if start > end || end > data.len() {
            return Err(Error::malformed(
                start,
                format!("range {start:#x}..{end:#x} exceeds buffer of {:#x} bytes", data.len()),
            ));
        }
        Ok(Self {
            data,
            pos: start,
            end,
        })
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    #[inline]
    pub fn end(&self) -> usize {
        self.end
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.end.saturating_sub(self.pos)
    }

    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.end {
            return Err(Error::UnexpectedEof {
                offset: pos,
                need: 0,
                have: 0,
            });
        }
        self.pos = pos;
        Ok(())
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.ensure(n)?;
        self.pos += n;
        Ok(())
    }

    #[inline]
    fn ensure(&self, need: usize) -> Result<()> {
        if self.remaining() < need {
            return Err(Error::UnexpectedEof {
                offset: self.pos,
                need,
                have: self.remaining(),
            });
        }
        Ok(())
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.ensure(n)?;
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(i16::from_le_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.read_array()?))
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.read_array()?))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.read_array()?))
    }

    pub fn peek_u32(&self) -> Result<u32> {
        self.clone().read_u32()
    }

    /// Decode a fixed-layout record declared with `binrw`.
    pub fn read_record<T>(&mut self) -> Result<T>
    where
        T: BinRead + ReadEndian,
        for<'b> T::Args<'b>: Default,
    {
        let mut io = io::Cursor::new(&self.data[self.pos..self.end]);
        let value = T::read_args(&mut io, Default::default()).map_err(|e| {
            if e.is_eof() {
                Error::UnexpectedEof {
                    offset: self.pos,
                    need: std::mem::size_of::<T>(),
                    have: self.remaining(),
                }
            } else {
                Error::Record(e)
            }
        })?;
        self.pos += io.position() as usize;
        Ok(value)
    }

    /// Count-prefixed list of absolute u32 pointers.
    pub fn read_pointer_list(&mut self) -> Result<Vec<u32>> {
        let count = self.read_u32()? as usize;
        self.ensure(count.saturating_mul(4))?;
        (0..count).map(|_| self.read_u32()).collect()
    }
}

#[derive(Debug, Default, Clone)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.buf.len()
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_i16(&mut self, v: i16) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_i64(&mut self, v: i64) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_f32(&mut self, v: f32) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_f64(&mut self, v: f64) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_record<T>(&mut self, value: &T) -> Result<()>
    where
        T: BinWrite + WriteEndian,
        for<'b> T::Args<'b>: Default,
    {
        let start = self.buf.len() as u64;
        let mut io = io::Cursor::new(&mut self.buf);
        io.set_position(start);
        value.write_args(&mut io, Default::default())?;
        Ok(())
    }

    pub fn truncate(&mut self, len: usize) {
        self.buf.truncate(len);
    }

    pub fn patch_u32(&mut self, at: usize, v: u32) -> Result<()> {
        match self.buf.get_mut(at..at + 4) {
            Some(slot) => {
                slot.copy_from_slice(&v.to_le_bytes());
                Ok(())
            }
            None => Err(Error::InvariantViolation(format!(
                "patch at {at:#x} outside written data ({:#x} bytes)",
                self.buf.len()
            ))),
        }
    }

    pub fn patch_i32(&mut self, at: usize, v: i32) -> Result<()> {
        self.patch_u32(at, v as u32)
    }

    pub fn read_u32_at(&self, at: usize) -> Option<u32> {
        let slot = self.buf.get(at..at + 4)?;
        Some(u32::from_le_bytes([slot[0], slot[1], slot[2], slot[3]]))
    }

    /// Zero-fill until `position() + origin` is a multiple of `align`.
    pub fn align(&mut self, align: u32, origin: usize) {
        let align = align.max(1) as usize;
        while (self.buf.len() + origin) % align != 0 {
            self.buf.push(0);
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}
