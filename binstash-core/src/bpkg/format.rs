//! BPKG file header, version dispatch, and the scalar codecs shared by
//! both wire versions.

use std::collections::BTreeMap;

use crate::bpkg::model::{FORMAT_V1, FORMAT_V2, PackageStats, ReleasePackage};
use crate::bpkg::strtab::{self, StringTable, TokenSeq};
use crate::bpkg::{v1, v2};
use crate::error::{Error, Location, Result};
use crate::util::varint::{put_ivarint, put_uvarint, take_ivarint, take_uvarint};

pub const PKG_MAGIC: [u8; 4] = *b"BPKG";
pub const FLAG_COMPRESSED: u8 = 0b0000_0001;
/// Bytes of magic + version + flags before the first section.
pub const HEADER_LEN: usize = 6;

#[derive(Debug, Clone, Copy)]
pub struct SerializeOptions {
    pub enable_compression: bool,
    pub compression_level: i32,
}

impl Default for SerializeOptions {
    fn default() -> Self {
        Self {
            enable_compression: true,
            compression_level: 3,
        }
    }
}

pub fn serialize(pkg: &ReleasePackage, opts: &SerializeOptions) -> Result<Vec<u8>> {
    match pkg.version {
        FORMAT_V1 => v1::write(pkg, opts),
        FORMAT_V2 => v2::write(pkg, opts),
        v => Err(Error::Unsupported(format!("release package version {v}"))),
    }
}

pub fn deserialize(bytes: &[u8]) -> Result<ReleasePackage> {
    if bytes.len() < HEADER_LEN {
        return Err(Error::format("truncated package header"));
    }
    if bytes[0..4] != PKG_MAGIC {
        return Err(Error::format(format!(
            "bad package magic {:02x?}",
            &bytes[0..4]
        )));
    }
    let version = bytes[4];
    let compressed = bytes[5] & FLAG_COMPRESSED != 0;
    let body = &bytes[HEADER_LEN..];
    match version {
        FORMAT_V1 => v1::read(body, compressed),
        FORMAT_V2 => v2::read(body, compressed),
        v => Err(Error::Unsupported(format!("release package version {v}"))),
    }
}

impl ReleasePackage {
    pub fn serialize(&self, opts: &SerializeOptions) -> Result<Vec<u8>> {
        serialize(self, opts)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        deserialize(bytes)
    }
}

pub(crate) fn header(version: u8, opts: &SerializeOptions) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN);
    out.extend_from_slice(&PKG_MAGIC);
    out.push(version);
    out.push(if opts.enable_compression {
        FLAG_COMPRESSED
    } else {
        0
    });
    out
}

pub(crate) fn put_string(out: &mut Vec<u8>, s: &str) {
    put_uvarint(out, s.len() as u64);
    out.extend_from_slice(s.as_bytes());
}

pub(crate) fn take_string(buf: &mut &[u8]) -> Result<String> {
    let len = take_uvarint(buf)? as usize;
    if buf.len() < len {
        return Err(Error::format("truncated string"));
    }
    let s = std::str::from_utf8(&buf[..len])
        .map_err(|e| Error::format(format!("invalid utf-8: {e}")))?
        .to_string();
    *buf = &buf[len..];
    Ok(s)
}

pub(crate) fn encode_metadata(pkg: &ReleasePackage) -> Vec<u8> {
    let mut out = Vec::new();
    put_uvarint(&mut out, u64::from(pkg.version));
    put_string(&mut out, &pkg.release_id);
    put_string(&mut out, &pkg.repo_id);
    put_string(&mut out, &pkg.notes);
    put_ivarint(&mut out, pkg.created_at);
    out
}

pub(crate) fn decode_metadata(bytes: &[u8], pkg: &mut ReleasePackage, section: u8) -> Result<()> {
    let at = Location::in_section(section);
    let mut cur = bytes;
    let version = take_uvarint(&mut cur)?;
    if version != u64::from(pkg.version) {
        return Err(Error::format_at(
            format!(
                "metadata version {version} disagrees with header version {}",
                pkg.version
            ),
            at,
        ));
    }
    pkg.release_id = take_string(&mut cur)?;
    pkg.repo_id = take_string(&mut cur)?;
    pkg.notes = take_string(&mut cur)?;
    pkg.created_at = take_ivarint(&mut cur)?;
    expect_drained(cur, section)
}

pub(crate) fn encode_stats(stats: &PackageStats) -> Vec<u8> {
    let mut out = Vec::new();
    put_uvarint(&mut out, stats.component_count);
    put_uvarint(&mut out, stats.file_count);
    put_uvarint(&mut out, stats.chunk_count);
    put_uvarint(&mut out, stats.raw_size);
    put_uvarint(&mut out, stats.deduped_size);
    out
}

pub(crate) fn decode_stats(bytes: &[u8], section: u8) -> Result<PackageStats> {
    let mut cur = bytes;
    let stats = PackageStats {
        component_count: take_uvarint(&mut cur)?,
        file_count: take_uvarint(&mut cur)?,
        chunk_count: take_uvarint(&mut cur)?,
        raw_size: take_uvarint(&mut cur)?,
        deduped_size: take_uvarint(&mut cur)?,
    };
    expect_drained(cur, section)?;
    Ok(stats)
}

/// Key/value pairs as token-sequence pairs, in key order.
pub(crate) fn encode_props(pairs: &[(TokenSeq, TokenSeq)]) -> Vec<u8> {
    let mut out = Vec::new();
    put_uvarint(&mut out, pairs.len() as u64);
    for (key, value) in pairs {
        strtab::write_token_seq(&mut out, key);
        strtab::write_token_seq(&mut out, value);
    }
    out
}

pub(crate) fn decode_props(
    bytes: &[u8],
    table: &StringTable,
    section: u8,
) -> Result<BTreeMap<String, String>> {
    let mut cur = bytes;
    let count = take_uvarint(&mut cur)?;
    let mut props = BTreeMap::new();
    for _ in 0..count {
        let key = strtab::read_token_seq(&mut cur)?;
        let value = strtab::read_token_seq(&mut cur)?;
        props.insert(
            strtab::detokenize(table, &key)?,
            strtab::detokenize(table, &value)?,
        );
    }
    expect_drained(cur, section)?;
    Ok(props)
}

/// A decoded section must be consumed in full.
pub(crate) fn expect_drained(cur: &[u8], section: u8) -> Result<()> {
    if cur.is_empty() {
        Ok(())
    } else {
        Err(Error::format_at(
            format!("{} trailing bytes in section", cur.len()),
            Location::in_section(section),
        ))
    }
}
