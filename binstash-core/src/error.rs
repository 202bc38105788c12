use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Where in the store a failure was observed. Every field is optional;
/// decode paths fill in what they know.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Location {
    /// 3-hex-char shard prefix.
    pub shard: Option<String>,
    /// Pack file sequence number inside the shard.
    pub pack_file: Option<u32>,
    /// Byte offset inside the pack file or package buffer.
    pub offset: Option<u64>,
    /// BPKG section id.
    pub section: Option<u8>,
}

impl Location {
    pub fn at_offset(offset: u64) -> Self {
        Self {
            offset: Some(offset),
            ..Self::default()
        }
    }

    pub fn in_section(section: u8) -> Self {
        Self {
            section: Some(section),
            ..Self::default()
        }
    }

    pub fn in_shard(prefix: &str) -> Self {
        Self {
            shard: Some(prefix.to_string()),
            ..Self::default()
        }
    }

    pub fn pack_file(mut self, file_no: u32) -> Self {
        self.pack_file = Some(file_no);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn section(mut self, id: u8) -> Self {
        self.section = Some(id);
        self
    }

    fn is_empty(&self) -> bool {
        self.shard.is_none()
            && self.pack_file.is_none()
            && self.offset.is_none()
            && self.section.is_none()
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return Ok(());
        }
        let mut sep = " (";
        if let Some(shard) = &self.shard {
            write!(f, "{sep}shard {shard}")?;
            sep = ", ";
        }
        if let Some(no) = self.pack_file {
            write!(f, "{sep}pack {no}")?;
            sep = ", ";
        }
        if let Some(off) = self.offset {
            write!(f, "{sep}offset {off}")?;
            sep = ", ";
        }
        if let Some(id) = self.section {
            write!(f, "{sep}section 0x{id:02x}")?;
        }
        write!(f, ")")
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed bytes: bad magic, unknown section, truncated header,
    /// varint too long, length mismatch after decompression.
    #[error("invalid format: {reason}{at}")]
    InvalidFormat { reason: String, at: Location },

    /// Bytes parsed but failed verification: checksum mismatch, index entry
    /// pointing at missing pack bytes.
    #[error("corruption: {reason}{at}")]
    Corruption { reason: String, at: Location },

    #[error("not found: {0}")]
    NotFound(String),

    /// Index/pack skew at write time. A clean duplicate write is not an
    /// error; it returns success with zero bytes written.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    pub fn format(reason: impl Into<String>) -> Self {
        Error::InvalidFormat {
            reason: reason.into(),
            at: Location::default(),
        }
    }

    pub fn format_at(reason: impl Into<String>, at: Location) -> Self {
        Error::InvalidFormat {
            reason: reason.into(),
            at,
        }
    }

    pub fn corruption(reason: impl Into<String>) -> Self {
        Error::Corruption {
            reason: reason.into(),
            at: Location::default(),
        }
    }

    pub fn corruption_at(reason: impl Into<String>, at: Location) -> Self {
        Error::Corruption {
            reason: reason.into(),
            at,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption { .. })
    }
}
