use crate::error::{Error, Result};
use crate::hash::{HASH_LEN, Hash32};
use crate::util::varint::{put_uvarint, take_uvarint};

/// Column-major rewrite of an ordered checksum list: all first bytes, then
/// all second bytes, and so on. Lossless and order-preserving; the layout
/// exists only to raise compressibility under the outer zstd framing.
///
/// Wire form: `uvarint count`, `uvarint width`, then `count * width` bytes
/// of transposed columns.
pub fn encode_hash_list(hashes: &[Hash32], out: &mut Vec<u8>) {
    put_uvarint(out, hashes.len() as u64);
    put_uvarint(out, HASH_LEN as u64);
    out.reserve(hashes.len() * HASH_LEN);
    for col in 0..HASH_LEN {
        for h in hashes {
            out.push(h.as_bytes()[col]);
        }
    }
}

pub fn decode_hash_list(buf: &mut &[u8]) -> Result<Vec<Hash32>> {
    let count = take_uvarint(buf)? as usize;
    let width = take_uvarint(buf)? as usize;
    if width != HASH_LEN {
        return Err(Error::format(format!(
            "unexpected checksum width {width}, expected {HASH_LEN}"
        )));
    }
    let need = count
        .checked_mul(width)
        .ok_or_else(|| Error::format("checksum block size overflow"))?;
    if buf.len() < need {
        return Err(Error::format(format!(
            "truncated checksum block: have {}, need {need}",
            buf.len()
        )));
    }
    let block = &buf[..need];
    let mut rows = vec![[0u8; HASH_LEN]; count];
    for col in 0..HASH_LEN {
        let column = &block[col * count..(col + 1) * count];
        for (row, &b) in rows.iter_mut().zip(column) {
            row[col] = b;
        }
    }
    *buf = &buf[need..];
    Ok(rows.into_iter().map(Hash32::from_bytes).collect())
}
