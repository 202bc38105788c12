//! BPKG section framing: `u8 id`, `u8 flags` (reserved, 0), `uvarint
//! payload_size`, then the payload, optionally zstd-compressed when the
//! file header's compression flag is set.

use crate::error::{Error, Location, Result};
use crate::util::varint::{put_uvarint, take_uvarint};

pub struct SectionWriter {
    out: Vec<u8>,
    compress: bool,
    level: i32,
}

impl SectionWriter {
    /// `out` already carries the file header.
    pub fn new(out: Vec<u8>, compress: bool, level: i32) -> Self {
        Self {
            out,
            compress,
            level,
        }
    }

    pub fn section(&mut self, id: u8, payload: &[u8]) -> Result<()> {
        self.out.push(id);
        self.out.push(0);
        if self.compress {
            let stored = zstd::stream::encode_all(payload, self.level)?;
            put_uvarint(&mut self.out, stored.len() as u64);
            self.out.extend_from_slice(&stored);
        } else {
            put_uvarint(&mut self.out, payload.len() as u64);
            self.out.extend_from_slice(payload);
        }
        Ok(())
    }

    pub fn finish(self) -> Vec<u8> {
        self.out
    }
}

pub struct SectionReader<'a> {
    buf: &'a [u8],
    compressed: bool,
    /// Offset of the next section inside the whole package buffer.
    offset: u64,
}

impl<'a> SectionReader<'a> {
    pub fn new(buf: &'a [u8], compressed: bool, base_offset: u64) -> Self {
        Self {
            buf,
            compressed,
            offset: base_offset,
        }
    }

    /// The next `(id, payload)` pair, decompressed, or `None` at EOF.
    pub fn next_section(&mut self) -> Result<Option<(u8, Vec<u8>)>> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        let at = Location::at_offset(self.offset);
        if self.buf.len() < 2 {
            return Err(Error::format_at("truncated section header", at));
        }
        let id = self.buf[0];
        let mut cur = &self.buf[2..];
        let size = take_uvarint(&mut cur)? as usize;
        if cur.len() < size {
            return Err(Error::format_at(
                format!("truncated section payload: have {}, need {size}", cur.len()),
                at.section(id),
            ));
        }
        let stored = &cur[..size];
        let consumed = (self.buf.len() - cur.len()) + size;
        self.buf = &cur[size..];
        self.offset += consumed as u64;
        let payload = if self.compressed {
            // The slice bounds the decoder to exactly `size` input bytes.
            zstd::stream::decode_all(stored).map_err(|e| {
                Error::format_at(format!("section decompression failed: {e}"), at.section(id))
            })?
        } else {
            stored.to_vec()
        };
        Ok(Some((id, payload)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(compress: bool) {
        let mut w = SectionWriter::new(vec![0xde, 0xad], compress, 3);
        w.section(0x01, b"first payload").unwrap();
        w.section(0x02, &vec![7u8; 10_000]).unwrap();
        w.section(0x03, b"").unwrap();
        let bytes = w.finish();
        assert_eq!(&bytes[..2], &[0xde, 0xad]);

        let mut r = SectionReader::new(&bytes[2..], compress, 2);
        let (id, payload) = r.next_section().unwrap().unwrap();
        assert_eq!((id, payload.as_slice()), (0x01, b"first payload".as_slice()));
        let (id, payload) = r.next_section().unwrap().unwrap();
        assert_eq!(id, 0x02);
        assert_eq!(payload, vec![7u8; 10_000]);
        let (id, payload) = r.next_section().unwrap().unwrap();
        assert_eq!(id, 0x03);
        assert!(payload.is_empty());
        assert!(r.next_section().unwrap().is_none());
    }

    #[test]
    fn sections_round_trip_raw() {
        round_trip(false);
    }

    #[test]
    fn sections_round_trip_compressed() {
        round_trip(true);
    }

    #[test]
    fn truncated_payload_carries_section_id() {
        let mut w = SectionWriter::new(Vec::new(), false, 3);
        w.section(0x05, b"some payload bytes").unwrap();
        let bytes = w.finish();
        let mut r = SectionReader::new(&bytes[..bytes.len() - 4], false, 0);
        let err = r.next_section().unwrap_err();
        assert!(err.to_string().contains("section 0x05"), "{err}");
    }
}
