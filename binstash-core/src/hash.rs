use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

pub const HASH_LEN: usize = 32;

/// 32-byte content hash. Ordering is lexicographic on the raw bytes; the
/// textual form is lowercase 64-char hex.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash32([u8; HASH_LEN]);

impl Hash32 {
    pub const fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    /// Blake3 of `data`, the canonical content hash everywhere in the store.
    pub fn of(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| Error::format(format!("invalid hex: {e}")))?;
        if bytes.len() != HASH_LEN {
            return Err(Error::format(format!(
                "expected {HASH_LEN} bytes ({} hex chars), got {}",
                HASH_LEN * 2,
                bytes.len()
            )));
        }
        let mut out = [0u8; HASH_LEN];
        out.copy_from_slice(&bytes);
        Ok(Self(out))
    }

    /// First 2 hex chars: the shard directory key.
    pub fn prefix2(&self) -> String {
        format!("{:02x}", self.0[0])
    }

    /// First 3 hex chars: the shard key (4096 shards).
    pub fn prefix3(&self) -> String {
        format!("{:02x}{:x}", self.0[0], self.0[1] >> 4)
    }

    /// Numeric value of the first 3 hex chars, in `0..4096`.
    pub fn shard_index(&self) -> usize {
        ((self.0[0] as usize) << 4) | ((self.0[1] >> 4) as usize)
    }
}

impl fmt::Display for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

impl FromStr for Hash32 {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl AsRef<[u8]> for Hash32 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let h = Hash32::of(b"release");
        let parsed = Hash32::from_hex(&h.to_hex()).unwrap();
        assert_eq!(h, parsed);
        assert_eq!(h.to_hex().len(), 64);
        assert!(h.to_hex().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn rejects_bad_hex() {
        assert!(Hash32::from_hex("zz").is_err());
        assert!(Hash32::from_hex("ab").is_err());
    }

    #[test]
    fn ordering_is_lexicographic() {
        let mut a = [0u8; HASH_LEN];
        let mut b = [0u8; HASH_LEN];
        a[0] = 1;
        b[0] = 2;
        assert!(Hash32::from_bytes(a) < Hash32::from_bytes(b));
        b[0] = 1;
        b[31] = 1;
        assert!(Hash32::from_bytes(a) < Hash32::from_bytes(b));
    }

    #[test]
    fn shard_prefixes() {
        let mut bytes = [0u8; HASH_LEN];
        bytes[0] = 0x1a;
        bytes[1] = 0x2f;
        let h = Hash32::from_bytes(bytes);
        assert_eq!(h.prefix2(), "1a");
        assert_eq!(h.prefix3(), "1a2");
        assert_eq!(h.shard_index(), 0x1a2);
    }
}
