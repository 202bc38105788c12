//! Framed zstd pack entries.
//!
//! Layout per entry, little-endian: `u32 magic`, `u8 version`,
//! `u32 uncompressed_length`, `u32 compressed_length`,
//! `u64 xxh3(compressed)`, then the compressed bytes.

use std::io::{Read, Write};

use xxhash_rust::xxh3::xxh3_64;

use crate::error::{Error, Location, Result};

pub const PACK_MAGIC: u32 = 0x4253_5042;
/// Accepted in read mode only; written by pre-release stores.
pub const PACK_MAGIC_LEGACY: u32 = 0x4253_4342;
pub const PACK_VERSION: u8 = 1;
pub const HEADER_LEN: usize = 21;

pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHeader {
    pub uncompressed_len: u32,
    pub compressed_len: u32,
    pub xxh3: u64,
}

impl EntryHeader {
    pub fn total_len(&self) -> u64 {
        HEADER_LEN as u64 + u64::from(self.compressed_len)
    }
}

/// Compress `payload` and frame it as one entry. The caller appends the
/// returned bytes in a single write so a torn entry never spans an index
/// update.
pub fn encode_entry(payload: &[u8], level: i32) -> Result<Vec<u8>> {
    if payload.len() > u32::MAX as usize {
        return Err(Error::Unsupported(format!(
            "pack entry payload of {} bytes exceeds u32 framing",
            payload.len()
        )));
    }
    let compressed = zstd::stream::encode_all(payload, level)?;
    let digest = xxh3_64(&compressed);
    let mut out = Vec::with_capacity(HEADER_LEN + compressed.len());
    out.extend_from_slice(&PACK_MAGIC.to_le_bytes());
    out.push(PACK_VERSION);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
    out.extend_from_slice(&digest.to_le_bytes());
    out.extend_from_slice(&compressed);
    Ok(out)
}

pub fn write_entry(w: &mut impl Write, payload: &[u8], level: i32) -> Result<u64> {
    let bytes = encode_entry(payload, level)?;
    w.write_all(&bytes)?;
    Ok(bytes.len() as u64)
}

fn fill(r: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut read = 0;
    while read < buf.len() {
        let n = r.read(&mut buf[read..])?;
        if n == 0 {
            break;
        }
        read += n;
    }
    Ok(read)
}

/// Parse one entry header. `Ok(None)` means a clean EOF at an entry
/// boundary. `salvage` skips the magic/version check (legacy payload
/// recovery); checksums are still enforced by the body read.
pub fn read_header(r: &mut impl Read, salvage: bool, at: &Location) -> Result<Option<EntryHeader>> {
    let mut header = [0u8; HEADER_LEN];
    let n = fill(r, &mut header)?;
    if n == 0 {
        return Ok(None);
    }
    if n < HEADER_LEN {
        return Err(Error::format_at(
            format!("truncated entry header: {n} of {HEADER_LEN} bytes"),
            at.clone(),
        ));
    }
    let magic = u32::from_le_bytes(header[0..4].try_into().expect("4 bytes"));
    let version = header[4];
    if !salvage {
        if magic != PACK_MAGIC && magic != PACK_MAGIC_LEGACY {
            return Err(Error::format_at(
                format!("bad pack entry magic 0x{magic:08x}"),
                at.clone(),
            ));
        }
        if version != PACK_VERSION {
            return Err(Error::Unsupported(format!(
                "pack entry version {version}"
            )));
        }
    }
    Ok(Some(EntryHeader {
        uncompressed_len: u32::from_le_bytes(header[5..9].try_into().expect("4 bytes")),
        compressed_len: u32::from_le_bytes(header[9..13].try_into().expect("4 bytes")),
        xxh3: u64::from_le_bytes(header[13..21].try_into().expect("8 bytes")),
    }))
}

/// Pull exactly `compressed_len` body bytes off the stream.
fn read_compressed(r: &mut impl Read, header: &EntryHeader, at: &Location) -> Result<Vec<u8>> {
    let mut compressed = vec![0u8; header.compressed_len as usize];
    let n = fill(r, &mut compressed)?;
    if n < compressed.len() {
        return Err(Error::format_at(
            format!("truncated entry body: {n} of {} bytes", compressed.len()),
            at.clone(),
        ));
    }
    Ok(compressed)
}

/// Verify and decompress a fully-read body.
fn verify_body(compressed: &[u8], header: &EntryHeader, at: &Location) -> Result<Vec<u8>> {
    if xxh3_64(compressed) != header.xxh3 {
        return Err(Error::corruption_at("entry xxh3 mismatch", at.clone()));
    }
    let payload = zstd::stream::decode_all(compressed)
        .map_err(|e| Error::corruption_at(format!("zstd decode failed: {e}"), at.clone()))?;
    if payload.len() != header.uncompressed_len as usize {
        return Err(Error::format_at(
            format!(
                "decompressed length mismatch: got {}, header says {}",
                payload.len(),
                header.uncompressed_len
            ),
            at.clone(),
        ));
    }
    Ok(payload)
}

/// Read and verify the body belonging to `header`.
pub fn read_body(r: &mut impl Read, header: &EntryHeader, at: &Location) -> Result<Vec<u8>> {
    let compressed = read_compressed(r, header, at)?;
    verify_body(&compressed, header, at)
}

/// Read one entry from the current stream position.
pub fn read_entry(r: &mut impl Read, salvage: bool, at: Location) -> Result<Vec<u8>> {
    let header = read_header(r, salvage, &at)?
        .ok_or_else(|| Error::format_at("entry missing at offset", at.clone()))?;
    read_body(r, &header, &at)
}

/// Walk every entry in a pack stream, yielding `(offset, total_len,
/// payload)`. After an error item the iterator continues if the stream is
/// still positioned at a knowable entry boundary (payload-level failures),
/// and ends after framing-level failures (torn or unreadable headers).
pub struct Entries<R: Read> {
    r: R,
    offset: u64,
    salvage: bool,
    base: Location,
    fatal: bool,
}

impl<R: Read> Entries<R> {
    pub fn new(r: R, salvage: bool, base: Location) -> Self {
        Self {
            r,
            offset: 0,
            salvage,
            base,
            fatal: false,
        }
    }
}

impl<R: Read> Iterator for Entries<R> {
    type Item = Result<(u64, u64, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.fatal {
            return None;
        }
        let at = self.base.clone().offset(self.offset);
        let header = match read_header(&mut self.r, self.salvage, &at) {
            Ok(None) => return None,
            Ok(Some(h)) => h,
            Err(e) => {
                self.fatal = true;
                return Some(Err(e));
            }
        };
        let offset = self.offset;
        let total = header.total_len();
        let compressed = match read_compressed(&mut self.r, &header, &at) {
            Ok(c) => c,
            Err(e) => {
                self.fatal = true;
                return Some(Err(e));
            }
        };
        // Body consumed in full either way; the next header stays reachable
        // even when verification fails.
        self.offset += total;
        Some(verify_body(&compressed, &header, &at).map(|payload| (offset, total, payload)))
    }
}
