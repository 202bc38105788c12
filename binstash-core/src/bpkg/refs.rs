//! Bit-packed DeltaChunkRef lists and the content ids used to dedup
//! identical lists across files inside one package.

use xxhash_rust::xxh3::xxh3_64;

use crate::bpkg::model::DeltaChunkRef;
use crate::error::{Error, Result};
use crate::util::bitio::{BitReader, BitWriter};
use crate::util::varint::{put_uvarint, take_uvarint, uvarint_len};

/// `ceil(log2(max + 1))`: bits needed to hold any value up to `max`.
fn bits_for(max: u64) -> u32 {
    64 - max.leading_zeros()
}

/// Wire form: `uvarint count`, 3 width bytes `(bits_delta, bits_offset,
/// bits_length)` (all 0 for an empty list), then the concatenated triples
/// at those widths, LSB-first.
pub fn write_ref_list(out: &mut Vec<u8>, refs: &[DeltaChunkRef]) {
    put_uvarint(out, refs.len() as u64);
    if refs.is_empty() {
        out.extend_from_slice(&[0, 0, 0]);
        return;
    }
    let bits_delta = bits_for(refs.iter().map(|r| u64::from(r.delta_index)).max().unwrap_or(0));
    let bits_offset = bits_for(refs.iter().map(|r| r.offset).max().unwrap_or(0));
    let bits_length = bits_for(refs.iter().map(|r| r.length).max().unwrap_or(0));
    out.push(bits_delta as u8);
    out.push(bits_offset as u8);
    out.push(bits_length as u8);
    let mut w = BitWriter::new();
    for r in refs {
        w.write_bits(u64::from(r.delta_index), bits_delta);
        w.write_bits(r.offset, bits_offset);
        w.write_bits(r.length, bits_length);
    }
    out.extend_from_slice(&w.finish());
}

pub fn read_ref_list(buf: &mut &[u8]) -> Result<Vec<DeltaChunkRef>> {
    let count = take_uvarint(buf)? as usize;
    if buf.len() < 3 {
        return Err(Error::format("truncated chunk-ref widths"));
    }
    let bits_delta = u32::from(buf[0]);
    let bits_offset = u32::from(buf[1]);
    let bits_length = u32::from(buf[2]);
    *buf = &buf[3..];
    if bits_delta > 32 || bits_offset > 64 || bits_length > 64 {
        return Err(Error::format(format!(
            "chunk-ref widths out of range: ({bits_delta}, {bits_offset}, {bits_length})"
        )));
    }
    let per_ref = u64::from(bits_delta + bits_offset + bits_length);
    let total_bits = (count as u64)
        .checked_mul(per_ref)
        .ok_or_else(|| Error::format("chunk-ref block size overflow"))?;
    let nbytes = total_bits.div_ceil(8) as usize;
    if buf.len() < nbytes {
        return Err(Error::format(format!(
            "truncated chunk-ref block: have {}, need {nbytes}",
            buf.len()
        )));
    }
    let mut r = BitReader::new(&buf[..nbytes]);
    let mut refs = Vec::with_capacity(count.min(1 + nbytes * 8));
    for _ in 0..count {
        refs.push(DeltaChunkRef {
            delta_index: r.read_bits(bits_delta)? as u32,
            offset: r.read_bits(bits_offset)?,
            length: r.read_bits(bits_length)?,
        });
    }
    *buf = &buf[nbytes..];
    Ok(refs)
}

/// Serialized size of a ref list, used when weighing dedup emission.
pub fn encoded_len(refs: &[DeltaChunkRef]) -> usize {
    if refs.is_empty() {
        return uvarint_len(0) + 3;
    }
    let bits_delta = bits_for(refs.iter().map(|r| u64::from(r.delta_index)).max().unwrap_or(0));
    let bits_offset = bits_for(refs.iter().map(|r| r.offset).max().unwrap_or(0));
    let bits_length = bits_for(refs.iter().map(|r| r.length).max().unwrap_or(0));
    let total_bits = refs.len() as u64 * u64::from(bits_delta + bits_offset + bits_length);
    uvarint_len(refs.len() as u64) + 3 + total_bits.div_ceil(8) as usize
}

/// XxHash3 over the 24-byte little-endian serializations of the triples
/// (`delta_index` widened to u64).
pub fn content_id(refs: &[DeltaChunkRef]) -> u64 {
    let mut buf = Vec::with_capacity(refs.len() * 24);
    for r in refs {
        buf.extend_from_slice(&u64::from(r.delta_index).to_le_bytes());
        buf.extend_from_slice(&r.offset.to_le_bytes());
        buf.extend_from_slice(&r.length.to_le_bytes());
    }
    xxh3_64(&buf)
}

/// Dedup emission rule: sharing pays when the shared block plus per-file
/// index references beat repeating the list inline in every file.
pub fn dedup_pays(refs: &[DeltaChunkRef], ref_count: usize) -> bool {
    let inline = encoded_len(refs);
    let shared = inline + (1 + uvarint_len(ref_count as u64 - 1)) * ref_count;
    shared < (inline + 1) * ref_count
}
