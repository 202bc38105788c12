//! BPKG v2: full 32-byte file hashes referenced through a frequency-ordered
//! hash table, LCP-compressed file names, and no chunk data in the package
//! (file-definitions live in the object store).

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use crate::bpkg::format::{self, SerializeOptions};
use crate::bpkg::model::{Component, FORMAT_V2, FileHash, ReleaseFile, ReleasePackage};
use crate::bpkg::section::{SectionReader, SectionWriter};
use crate::bpkg::strtab::{self, Separator, StringTable, TokenSeq};
use crate::error::{Error, Location, Result};
use crate::hash::Hash32;
use crate::util::transpose;
use crate::util::varint::{put_uvarint, take_uvarint, take_uvarint32};

pub const SEC_METADATA: u8 = 0x01;
pub const SEC_FILE_HASHES: u8 = 0x02;
pub const SEC_STRING_TABLE: u8 = 0x03;
pub const SEC_PROPERTIES: u8 = 0x04;
pub const SEC_COMPONENTS: u8 = 0x05;
pub const SEC_STATS: u8 = 0x06;

struct FilePrep {
    seq: TokenSeq,
    hash: Hash32,
}

fn seq_cmp(a: &TokenSeq, b: &TokenSeq) -> Ordering {
    let key = |&(id, sep): &(u32, Separator)| (id, sep.code());
    a.tokens
        .iter()
        .map(key)
        .cmp(b.tokens.iter().map(key))
}

/// Common prefix over `(id, separator)` pairs; the separator participates
/// in the match.
fn common_prefix(a: &TokenSeq, b: &TokenSeq) -> usize {
    a.tokens
        .iter()
        .zip(&b.tokens)
        .take_while(|(x, y)| x == y)
        .count()
}

pub fn write(pkg: &ReleasePackage, opts: &SerializeOptions) -> Result<Vec<u8>> {
    let mut table = StringTable::new();
    let mut comps: Vec<(TokenSeq, Vec<FilePrep>)> = Vec::with_capacity(pkg.components.len());
    for comp in &pkg.components {
        let name = strtab::tokenize(&mut table, &comp.name);
        let files = comp
            .files
            .iter()
            .map(|f| {
                let FileHash::Full(hash) = f.hash else {
                    return Err(Error::format(format!(
                        "v2 package requires 32-byte file hashes, file {}",
                        f.name
                    )));
                };
                Ok(FilePrep {
                    seq: strtab::tokenize(&mut table, &f.name),
                    hash,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        comps.push((name, files));
    }
    let mut prop_seqs: Vec<(TokenSeq, TokenSeq)> = pkg
        .custom_properties
        .iter()
        .map(|(k, v)| {
            (
                strtab::tokenize(&mut table, k),
                strtab::tokenize(&mut table, v),
            )
        })
        .collect();

    let perm = table.sort();
    for (name, files) in &mut comps {
        name.remap(&perm);
        for f in files.iter_mut() {
            f.seq.remap(&perm);
        }
    }
    for (k, v) in &mut prop_seqs {
        k.remap(&perm);
        v.remap(&perm);
    }

    let unique_hashes = crate::bpkg::model::unique_file_hashes(pkg);
    let hash_index: HashMap<Hash32, usize> = unique_hashes
        .iter()
        .enumerate()
        .map(|(i, &h)| (h, i))
        .collect();

    // Adjacent-LCP file order: lexicographic over post-sort token
    // sequences groups shared prefixes next to each other.
    for (_, files) in &mut comps {
        files.sort_by(|a, b| seq_cmp(&a.seq, &b.seq));
    }

    let mut w = SectionWriter::new(
        format::header(FORMAT_V2, opts),
        opts.enable_compression,
        opts.compression_level,
    );
    w.section(SEC_METADATA, &format::encode_metadata(pkg))?;

    let mut sec = Vec::new();
    transpose::encode_hash_list(&unique_hashes, &mut sec);
    w.section(SEC_FILE_HASHES, &sec)?;

    // Two-pass string table: all byte lengths, then all raw bytes.
    let mut sec = Vec::new();
    put_uvarint(&mut sec, table.len() as u64);
    for entry in table.entries() {
        put_uvarint(&mut sec, entry.len() as u64);
    }
    for entry in table.entries() {
        sec.extend_from_slice(entry.as_bytes());
    }
    w.section(SEC_STRING_TABLE, &sec)?;

    w.section(SEC_PROPERTIES, &format::encode_props(&prop_seqs))?;

    let mut sec = Vec::new();
    put_uvarint(&mut sec, comps.len() as u64);
    for (name_seq, files) in &comps {
        strtab::write_token_seq(&mut sec, name_seq);
        put_uvarint(&mut sec, files.len() as u64);
        for (i, f) in files.iter().enumerate() {
            let lcp = if i == 0 {
                0
            } else {
                common_prefix(&files[i - 1].seq, &f.seq)
            };
            let tail = &f.seq.tokens[lcp..];
            put_uvarint(&mut sec, lcp as u64);
            put_uvarint(&mut sec, tail.len() as u64);
            for &(id, _) in tail {
                put_uvarint(&mut sec, u64::from(id));
            }
            let packed = strtab::pack_separators(tail);
            put_uvarint(&mut sec, packed.len() as u64);
            sec.extend_from_slice(&packed);
            put_uvarint(&mut sec, hash_index[&f.hash] as u64);
        }
    }
    w.section(SEC_COMPONENTS, &sec)?;

    w.section(SEC_STATS, &format::encode_stats(&pkg.stats))?;
    Ok(w.finish())
}

fn collect_sections(body: &[u8], compressed: bool) -> Result<BTreeMap<u8, Vec<u8>>> {
    let mut reader = SectionReader::new(body, compressed, format::HEADER_LEN as u64);
    let mut sections = BTreeMap::new();
    while let Some((id, payload)) = reader.next_section()? {
        if !(SEC_METADATA..=SEC_STATS).contains(&id) {
            return Err(Error::format_at(
                format!("unknown v2 section id 0x{id:02x}"),
                Location::in_section(id),
            ));
        }
        sections.insert(id, payload);
    }
    Ok(sections)
}

fn require(sections: &BTreeMap<u8, Vec<u8>>, id: u8) -> Result<&[u8]> {
    sections
        .get(&id)
        .map(Vec::as_slice)
        .ok_or_else(|| Error::format_at("section missing", Location::in_section(id)))
}

pub fn read(body: &[u8], compressed: bool) -> Result<ReleasePackage> {
    let sections = collect_sections(body, compressed)?;
    let mut pkg = ReleasePackage::new(FORMAT_V2, "", "");
    format::decode_metadata(require(&sections, SEC_METADATA)?, &mut pkg, SEC_METADATA)?;

    let mut cur = require(&sections, SEC_FILE_HASHES)?;
    let file_hashes = transpose::decode_hash_list(&mut cur)?;
    format::expect_drained(cur, SEC_FILE_HASHES)?;

    let mut cur = require(&sections, SEC_STRING_TABLE)?;
    let count = take_uvarint(&mut cur)? as usize;
    let mut lengths = Vec::with_capacity(count.min(cur.len()));
    for _ in 0..count {
        lengths.push(take_uvarint(&mut cur)? as usize);
    }
    let mut entries = Vec::with_capacity(count);
    for len in lengths {
        if cur.len() < len {
            return Err(Error::format_at(
                "truncated string-table bytes",
                Location::in_section(SEC_STRING_TABLE),
            ));
        }
        let s = std::str::from_utf8(&cur[..len])
            .map_err(|e| Error::format(format!("invalid utf-8: {e}")))?;
        entries.push(s.to_string());
        cur = &cur[len..];
    }
    format::expect_drained(cur, SEC_STRING_TABLE)?;
    let table = StringTable::from_entries(entries);

    pkg.custom_properties =
        format::decode_props(require(&sections, SEC_PROPERTIES)?, &table, SEC_PROPERTIES)?;

    let mut cur = require(&sections, SEC_COMPONENTS)?;
    let at = Location::in_section(SEC_COMPONENTS);
    let comp_count = take_uvarint(&mut cur)? as usize;
    for _ in 0..comp_count {
        let name_seq = strtab::read_token_seq(&mut cur)?;
        let name = strtab::detokenize(&table, &name_seq)?;
        let file_count = take_uvarint(&mut cur)? as usize;
        let mut files = Vec::with_capacity(file_count);
        let mut prev: Vec<(u32, Separator)> = Vec::new();
        for i in 0..file_count {
            let lcp = take_uvarint(&mut cur)? as usize;
            if i == 0 && lcp != 0 {
                return Err(Error::format_at(
                    "nonzero lcp at component start",
                    at.clone(),
                ));
            }
            if lcp > prev.len() {
                return Err(Error::format_at(
                    format!("lcp {lcp} exceeds previous sequence of {}", prev.len()),
                    at.clone(),
                ));
            }
            let tail_count = take_uvarint(&mut cur)? as usize;
            let mut ids = Vec::with_capacity(tail_count.min(cur.len()));
            for _ in 0..tail_count {
                ids.push(take_uvarint32(&mut cur)?);
            }
            let packed_len = take_uvarint(&mut cur)? as usize;
            if packed_len != tail_count.div_ceil(2) {
                return Err(Error::format_at(
                    format!(
                        "separator stream of {packed_len} bytes for {tail_count} tokens"
                    ),
                    at.clone(),
                ));
            }
            if cur.len() < packed_len {
                return Err(Error::format_at("separator stream too short", at.clone()));
            }
            let seps = strtab::unpack_separators(&cur[..packed_len], tail_count)?;
            cur = &cur[packed_len..];
            let hash_idx = take_uvarint(&mut cur)? as usize;
            let hash = *file_hashes.get(hash_idx).ok_or_else(|| {
                Error::format_at(
                    format!("file-hash index {hash_idx} out of range"),
                    at.clone(),
                )
            })?;

            let mut tokens: Vec<(u32, Separator)> = prev[..lcp].to_vec();
            tokens.extend(ids.into_iter().zip(seps));
            let seq = TokenSeq { tokens };
            files.push(ReleaseFile {
                name: strtab::detokenize(&table, &seq)?,
                hash: FileHash::Full(hash),
                chunks: Vec::new(),
            });
            prev = seq.tokens;
        }
        pkg.components.push(Component { name, files });
    }
    format::expect_drained(cur, SEC_COMPONENTS)?;

    pkg.stats = format::decode_stats(require(&sections, SEC_STATS)?, SEC_STATS)?;
    pkg.string_table = table.into_entries();
    Ok(pkg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_package() -> ReleasePackage {
        let mut pkg = ReleasePackage::new(FORMAT_V2, "2.0.0-rc.1", "acme/widget");
        pkg.notes = "release candidate".into();
        pkg.created_at = 1_720_000_000;
        pkg.custom_properties
            .insert("build.ci".into(), "true".into());
        let file = |name: &str, seed: &[u8]| ReleaseFile {
            name: name.into(),
            hash: FileHash::Full(Hash32::of(seed)),
            chunks: Vec::new(),
        };
        pkg.components = vec![
            Component {
                name: "src".into(),
                files: vec![
                    file("src/main.rs", b"main"),
                    file("src/lib.rs", b"lib"),
                    file("src/tests/lib.rs", b"lib"),
                ],
            },
            Component {
                name: "assets".into(),
                files: vec![
                    file("logo.png", b"logo"),
                    file("logo.svg", b"logo-svg"),
                    file("themes/dark.css", b"dark"),
                ],
            },
        ];
        pkg.stats.raw_size = 123_456;
        pkg.stats.deduped_size = 100_000;
        pkg.stats.chunk_count = 40;
        pkg.recompute_stats();
        pkg
    }

    fn assert_same_content(a: &ReleasePackage, b: &ReleasePackage) {
        assert_eq!(a.release_id, b.release_id);
        assert_eq!(a.repo_id, b.repo_id);
        assert_eq!(a.notes, b.notes);
        assert_eq!(a.created_at, b.created_at);
        assert_eq!(a.custom_properties, b.custom_properties);
        assert_eq!(a.components.len(), b.components.len());
        for (ca, cb) in a.components.iter().zip(&b.components) {
            assert_eq!(ca.name, cb.name);
            let mut fa = ca.files.clone();
            let mut fb = cb.files.clone();
            fa.sort_by(|x, y| x.name.cmp(&y.name));
            fb.sort_by(|x, y| x.name.cmp(&y.name));
            assert_eq!(fa, fb);
        }
    }

    #[test]
    fn round_trip_preserves_content_modulo_file_order() {
        let pkg = sample_package();
        let bytes = write(&pkg, &SerializeOptions::default()).unwrap();
        let back = format::deserialize(&bytes).unwrap();
        assert_same_content(&pkg, &back);
        assert_eq!(back.stats, pkg.stats);
        assert!(back.chunks.is_empty());
        // The decoded table mirrors the sorted wire table.
        let mut sorted = back.string_table.clone();
        sorted.sort();
        assert_eq!(back.string_table, sorted);
    }

    #[test]
    fn reserialization_is_byte_identical() {
        let pkg = sample_package();
        for opts in [
            SerializeOptions::default(),
            SerializeOptions {
                enable_compression: false,
                compression_level: 0,
            },
        ] {
            let first = write(&pkg, &opts).unwrap();
            let decoded = format::deserialize(&first).unwrap();
            let second = write(&decoded, &opts).unwrap();
            assert_eq!(first, second);
        }
    }

    #[test]
    fn duplicate_file_hashes_share_a_table_slot() {
        let pkg = sample_package();
        let opts = SerializeOptions {
            enable_compression: false,
            compression_level: 0,
        };
        let bytes = write(&pkg, &opts).unwrap();
        let back = format::deserialize(&bytes).unwrap();
        // Both lib.rs copies carry the same hash; the most frequent hash
        // sits first in the table, so dedup must survive the round trip.
        let hashes: Vec<_> = back
            .components
            .iter()
            .flat_map(|c| c.files.iter())
            .filter(|f| f.hash == FileHash::Full(Hash32::of(b"lib")))
            .collect();
        assert_eq!(hashes.len(), 2);
    }

    #[test]
    fn lcp_order_groups_shared_prefixes() {
        let pkg = sample_package();
        let bytes = write(&pkg, &SerializeOptions::default()).unwrap();
        let back = format::deserialize(&bytes).unwrap();
        let names: Vec<&str> = back.components[0]
            .files
            .iter()
            .map(|f| f.name.as_str())
            .collect();
        // src/... files sorted by token sequence: lib before main before
        // tests (post-sort id order is lexicographic on the substrings).
        assert_eq!(names.len(), 3);
        assert!(names.contains(&"src/lib.rs"));
        assert!(names.contains(&"src/main.rs"));
        assert!(names.contains(&"src/tests/lib.rs"));
    }

    #[test]
    fn short_hash_in_v2_is_an_error() {
        let mut pkg = sample_package();
        pkg.components[0].files[0].hash = FileHash::Short(7);
        assert!(write(&pkg, &SerializeOptions::default()).is_err());
    }

    #[test]
    fn component_with_zero_files_survives() {
        let mut pkg = sample_package();
        pkg.components.push(Component {
            name: "empty".into(),
            files: Vec::new(),
        });
        pkg.recompute_stats();
        let bytes = write(&pkg, &SerializeOptions::default()).unwrap();
        let back = format::deserialize(&bytes).unwrap();
        assert_eq!(back.components[2].name, "empty");
        assert!(back.components[2].files.is_empty());
    }

    #[test]
    fn corrupt_lcp_is_rejected() {
        let pkg = sample_package();
        let opts = SerializeOptions {
            enable_compression: false,
            compression_level: 0,
        };
        let bytes = write(&pkg, &opts).unwrap();
        // Find the components section and bump the first file's lcp.
        // Layout after the 6-byte header: sections in id order as written.
        let mut cur = &bytes[format::HEADER_LEN..];
        let mut patched = bytes.clone();
        loop {
            let id = cur[0];
            let mut rest = &cur[2..];
            let size = crate::util::varint::take_uvarint(&mut rest).unwrap() as usize;
            if id == SEC_COMPONENTS {
                let header_len = cur.len() - rest.len();
                let section_start = bytes.len() - cur.len() + header_len;
                // payload: comp_count, name seq (count, ids, seps),
                // file_count, then the first lcp varint.
                let mut p = &bytes[section_start..section_start + size];
                let before = p.len();
                take_uvarint(&mut p).unwrap(); // comp count
                let _ = strtab::read_token_seq(&mut p).unwrap(); // comp name
                take_uvarint(&mut p).unwrap(); // file count
                let lcp_at = section_start + (before - p.len());
                patched[lcp_at] = 9; // nonzero lcp for the first file
                break;
            }
            cur = &rest[size..];
        }
        let err = format::deserialize(&patched).unwrap_err();
        assert!(matches!(err, Error::InvalidFormat { .. }), "{err}");
    }
}
