//! A small but complete data.win image, assembled by hand.
//!
//! One script, `gml_Script_main`, reads and writes the self variable `x`, pushes the string
//! `"hello"` and calls `show_message` on one branch:
//!
//! ```text
//!  0  push.v self.x            (x occurrence 1)
//!  8  pushi.e 5
//! 12  cmp.e.v LT
//! 16  bf +6 words -> 40
//! 20  push.s "hello"
//! 28  call.i show_message(argc=1)
//! 36  popz.v
//! 40  pop.v.v self.x           (x occurrence 2)
//! 48  exit.i
//! ```
#![allow(dead_code)]

pub const STRINGS: [&str; 4] = ["x", "show_message", "gml_Script_main", "hello"];
pub const PROGRAM_LEN: u32 = 52;

const NORMAL: u32 = 0xA000_0000;

pub struct Image {
    pub bytes: Vec<u8>,
    /// Absolute offset of the first instruction.
    pub blob: usize,
}

struct Builder {
    out: Vec<u8>,
    /// (position, string index) pairs patched once STRG is laid out.
    names: Vec<(usize, usize)>,
}

impl Builder {
    fn u32(&mut self, v: u32) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    fn u16(&mut self, v: u16) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    fn name(&mut self, string: usize) {
        self.names.push((self.out.len(), string));
        self.u32(0);
    }

    fn patch(&mut self, at: usize, v: u32) {
        self.out[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }

    fn begin(&mut self, tag: &[u8; 4]) -> usize {
        self.out.extend_from_slice(tag);
        let at = self.out.len();
        self.u32(0);
        at
    }

    fn end(&mut self, length_at: usize) {
        let len = self.out.len() - length_at - 4;
        self.patch(length_at, len as u32);
    }
}

pub fn program(version: u8) -> Image {
    let bias = if version >= 17 { 4 } else { 0 };
    let mut b = Builder {
        out: Vec::new(),
        names: Vec::new(),
    };
    b.out.extend_from_slice(b"FORM");
    b.u32(0);

    let gen8 = b.begin(b"GEN8");
    b.out.extend_from_slice(&[0, version, 0, 0]);
    b.end(gen8);

    let code = b.begin(b"CODE");
    b.u32(1);
    let record_ptr = b.out.len();
    b.u32(0);
    let blob = b.out.len();
    let words: [u32; 13] = [
        0xC005_FFFF,
        0, // x chain
        0x840F_0005,
        0x155F_0100,
        0xB800_0006,
        0xC006_0000,
        3,
        0xD902_0001,
        0, // show_message chain
        0x9E05_0000,
        0x4555_FFFF,
        0, // x chain
        0x9D02_0000,
    ];
    for w in words {
        b.u32(w);
    }
    assert_eq!(b.out.len() - blob, PROGRAM_LEN as usize);
    let record = b.out.len();
    b.patch(record_ptr, record as u32);
    b.name(2);
    b.u32(PROGRAM_LEN);
    b.u16(1);
    b.u16(0);
    b.u32((blob as i64 - (record as i64 + 12)) as i32 as u32);
    b.u32(0);
    b.end(code);

    // x: first at 0, next at 40, terminal is its name
    b.patch(blob + 4, NORMAL | 40);
    b.patch(blob + 44, NORMAL);
    b.patch(blob + 32, NORMAL | 1);

    let vari = b.begin(b"VARI");
    b.u32(1);
    b.u32(1);
    b.u32(1);
    b.name(0);
    b.u32(0xFFFF_FFFF);
    b.u32(0);
    b.u32(2);
    b.u32((blob + bias) as u32);
    b.end(vari);

    let func = b.begin(b"FUNC");
    b.u32(1);
    b.name(1);
    b.u32(1);
    b.u32((blob + 28 + bias) as u32);
    b.u32(1);
    b.u32(1);
    b.name(2);
    b.u32(0);
    b.name(0);
    b.end(func);

    let strg = b.begin(b"STRG");
    b.u32(STRINGS.len() as u32);
    let pointers = b.out.len();
    for _ in STRINGS {
        b.u32(0);
    }
    let mut chars = Vec::new();
    for (i, s) in STRINGS.iter().enumerate() {
        while b.out.len() % 4 != 0 {
            b.out.push(0);
        }
        let at = b.out.len();
        b.patch(pointers + 4 * i, at as u32);
        chars.push(at + 4);
        b.u32(s.len() as u32);
        b.out.extend_from_slice(s.as_bytes());
        b.out.push(0);
    }
    while b.out.len() % 8 != 0 {
        b.out.push(0);
    }
    b.end(strg);

    for (at, string) in std::mem::take(&mut b.names) {
        b.patch(at, chars[string] as u32);
    }
    let form_len = b.out.len() - 8;
    b.patch(4, form_len as u32);
    Image { bytes: b.out, blob }
}

/// A FORM holding `chunks` as opaque payloads.
pub fn form(chunks: &[(&[u8; 4], &[u8])]) -> Vec<u8> {
    let mut out = b"FORM".to_vec();
    out.extend_from_slice(&[0; 4]);
    for (tag, payload) in chunks {
        out.extend_from_slice(*tag);
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(payload);
    }
    let len = (out.len() - 8) as u32;
    out[4..8].copy_from_slice(&len.to_le_bytes());
    out
}
