use std::fmt;

use log::Level;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("malformed container at offset {offset:#x}: {reason}")]
    MalformedContainer { offset: usize, reason: String },

    #[error("unexpected end of data at offset {offset:#x} (need {need} bytes, have {have})")]
    UnexpectedEof {
        offset: usize,
        need: usize,
        have: usize,
    },

    #[error("corrupt bytecode at {address:#x}: {reason}")]
    CorruptBytecode { address: u32, reason: String },

    #[error("cannot encode instruction at {address:#x}: {reason}")]
    UnencodableInstruction { address: u32, reason: String },

    #[error("control-flow invariant violated: {0}")]
    InvariantViolation(String),

    #[error("record codec error: {0}")]
    Record(#[from] binrw::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn malformed(offset: usize, reason: impl Into<String>) -> Self {
        Error::MalformedContainer {
            offset,
            reason: reason.into(),
        }
    }

    pub fn corrupt(address: u32, reason: impl Into<String>) -> Self {
        Error::CorruptBytecode {
            address,
            reason: reason.into(),
        }
    }

    pub fn unencodable(address: u32, reason: impl Into<String>) -> Self {
        Error::UnencodableInstruction {
            address,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WarningKind {
    DanglingReference,
    UnknownChunkType,
    TruncatedSection,
    UnsupportedVersion,
    CorruptBytecode,
    /// A modelled chunk did not reproduce its input and is now carried as opaque bytes.
    Demoted,
    Encoding,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    pub level: Level,
    pub kind: WarningKind,
    pub message: String,
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {:?}: {}", self.level, self.kind, self.message)
    }
}

/// Bounded warning sink threaded through a load or a store.
///
/// Once `limit` records have been collected further warnings are only counted.
#[derive(Debug, Clone)]
pub struct Warnings {
    items: Vec<Warning>,
    limit: usize,
    dropped: usize,
}

impl Default for Warnings {
    fn default() -> Self {
        Self::with_limit(1024)
    }
}

impl Warnings {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            items: Vec::new(),
            limit,
            dropped: 0,
        }
    }

    pub fn push(&mut self, level: Level, kind: WarningKind, message: impl Into<String>) {
        let message = message.into();
        log::log!(level, "{:?}: {}", kind, message);
        if self.items.len() < self.limit {
            self.items.push(Warning {
                level,
                kind,
                message,
            });
        } else {
            self.dropped += 1;
        }
    }

    pub fn warn(&mut self, kind: WarningKind, message: impl Into<String>) {
        self.push(Level::Warn, kind, message)
    }

    pub fn extend(&mut self, other: Warnings) {
        self.dropped += other.dropped;
        for w in other.items {
            if self.items.len() < self.limit {
                self.items.push(w);
            } else {
                self.dropped += 1;
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Warning> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.dropped == 0
    }

    /// Number of warnings that were counted but not stored.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn count(&self, kind: WarningKind) -> usize {
        self.items.iter().filter(|w| w.kind == kind).count()
    }

    pub fn into_vec(self) -> Vec<Warning> {
        self.items
    }
}
