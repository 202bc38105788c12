//! File-definitions: the content-addressed byte form of one file's ordered
//! chunk list, stored in the FileDefs shards (v2 packages reference files
//! by hash only and leave the chunk walk to these).
//!
//! Wire form: `uvarint chunk_count`, transpose-compressed checksum list,
//! two width bytes `(bits_offset, bits_length)`, then the bit-packed
//! `(offset, length)` pairs, LSB-first.

use crate::chunking::fastcdc::ChunkMapEntry;
use crate::error::{Error, Result};
use crate::hash::Hash32;
use crate::util::bitio::{BitReader, BitWriter};
use crate::util::transpose;
use crate::util::varint::{put_uvarint, take_uvarint};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileDefinition {
    pub chunks: Vec<ChunkMapEntry>,
}

fn bits_for(max: u64) -> u32 {
    64 - max.leading_zeros()
}

impl FileDefinition {
    pub fn new(chunks: Vec<ChunkMapEntry>) -> Self {
        Self { chunks }
    }

    /// Reconstructed file size.
    pub fn total_len(&self) -> u64 {
        self.chunks.iter().map(|c| c.length).sum()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        put_uvarint(&mut out, self.chunks.len() as u64);
        let checksums: Vec<Hash32> = self.chunks.iter().map(|c| c.checksum).collect();
        transpose::encode_hash_list(&checksums, &mut out);
        if self.chunks.is_empty() {
            out.extend_from_slice(&[0, 0]);
            return out;
        }
        let bits_offset = bits_for(self.chunks.iter().map(|c| c.offset).max().unwrap_or(0));
        let bits_length = bits_for(self.chunks.iter().map(|c| c.length).max().unwrap_or(0));
        out.push(bits_offset as u8);
        out.push(bits_length as u8);
        let mut w = BitWriter::new();
        for c in &self.chunks {
            w.write_bits(c.offset, bits_offset);
            w.write_bits(c.length, bits_length);
        }
        out.extend_from_slice(&w.finish());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut cur = bytes;
        let count = take_uvarint(&mut cur)? as usize;
        let checksums = transpose::decode_hash_list(&mut cur)?;
        if checksums.len() != count {
            return Err(Error::format(format!(
                "file definition count {count} disagrees with checksum list of {}",
                checksums.len()
            )));
        }
        if cur.len() < 2 {
            return Err(Error::format("truncated file-definition widths"));
        }
        let bits_offset = u32::from(cur[0]);
        let bits_length = u32::from(cur[1]);
        cur = &cur[2..];
        if bits_offset > 64 || bits_length > 64 {
            return Err(Error::format(format!(
                "file-definition widths out of range: ({bits_offset}, {bits_length})"
            )));
        }
        let total_bits = (count as u64)
            .checked_mul(u64::from(bits_offset + bits_length))
            .ok_or_else(|| Error::format("file-definition block size overflow"))?;
        let nbytes = total_bits.div_ceil(8) as usize;
        if cur.len() < nbytes {
            return Err(Error::format("truncated file-definition span block"));
        }
        let mut r = BitReader::new(&cur[..nbytes]);
        let mut chunks = Vec::with_capacity(count);
        for checksum in checksums {
            chunks.push(ChunkMapEntry {
                checksum,
                offset: r.read_bits(bits_offset)?,
                length: r.read_bits(bits_length)?,
            });
        }
        cur = &cur[nbytes..];
        if !cur.is_empty() {
            return Err(Error::format(format!(
                "{} trailing bytes after file definition",
                cur.len()
            )));
        }
        Ok(Self { chunks })
    }

    /// Blake3 of the serialized form; the content address in the FileDefs
    /// shards.
    pub fn content_hash(&self) -> Hash32 {
        Hash32::of(&self.to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(n: u64) -> FileDefinition {
        let mut offset = 0;
        let chunks = (0..n)
            .map(|i| {
                let length = 2048 + (i * 37) % 4096;
                let entry = ChunkMapEntry {
                    checksum: Hash32::of(&i.to_le_bytes()),
                    offset,
                    length,
                };
                offset += length;
                entry
            })
            .collect();
        FileDefinition::new(chunks)
    }

    #[test]
    fn round_trip() {
        for n in [0u64, 1, 2, 33] {
            let def = sample(n);
            let bytes = def.to_bytes();
            let back = FileDefinition::from_bytes(&bytes).unwrap();
            assert_eq!(back, def);
        }
    }

    #[test]
    fn content_hash_is_stable_and_content_sensitive() {
        let a = sample(5);
        let mut b = sample(5);
        assert_eq!(a.content_hash(), b.content_hash());
        b.chunks[2].length += 1;
        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn zero_byte_file_definition() {
        let def = FileDefinition::new(vec![ChunkMapEntry {
            checksum: Hash32::of(&[]),
            offset: 0,
            length: 0,
        }]);
        let back = FileDefinition::from_bytes(&def.to_bytes()).unwrap();
        assert_eq!(back, def);
        assert_eq!(back.total_len(), 0);
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        let mut bytes = sample(3).to_bytes();
        bytes.push(0x00);
        assert!(FileDefinition::from_bytes(&bytes).is_err());
    }

    #[test]
    fn truncation_is_rejected() {
        let bytes = sample(3).to_bytes();
        assert!(FileDefinition::from_bytes(&bytes[..bytes.len() - 1]).is_err());
    }
}
