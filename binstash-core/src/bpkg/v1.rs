//! BPKG v1: self-contained packages carrying the global chunk table,
//! 8-byte file fingerprints, per-file chunk-ref lists, and a content-id
//! table that dedups identical ref lists across files.

use std::collections::{BTreeMap, HashMap};

use crate::bpkg::format::{self, SerializeOptions};
use crate::bpkg::model::{
    ChunkInfo, Component, DeltaChunkRef, FORMAT_V1, FileHash, ReleaseFile, ReleasePackage,
};
use crate::bpkg::refs;
use crate::bpkg::section::{SectionReader, SectionWriter};
use crate::bpkg::strtab::{self, StringTable, TokenSeq};
use crate::error::{Error, Location, Result};
use crate::util::transpose;
use crate::util::varint::{put_uvarint, take_uvarint};

pub const SEC_METADATA: u8 = 0x01;
pub const SEC_CHUNK_TABLE: u8 = 0x02;
pub const SEC_STRING_TABLE: u8 = 0x03;
pub const SEC_PROPERTIES: u8 = 0x04;
pub const SEC_CONTENT_IDS: u8 = 0x05;
pub const SEC_COMPONENTS: u8 = 0x06;
pub const SEC_STATS: u8 = 0x07;

/// Per-file chunk-location discriminators inside the components section.
const CHUNKS_INLINE: u8 = 0x00;
const CHUNKS_BY_CONTENT_ID: u8 = 0x01;

pub fn write(pkg: &ReleasePackage, opts: &SerializeOptions) -> Result<Vec<u8>> {
    let mut table = StringTable::new();
    let mut comp_seqs: Vec<(TokenSeq, Vec<TokenSeq>)> = pkg
        .components
        .iter()
        .map(|comp| {
            let name = strtab::tokenize(&mut table, &comp.name);
            let files = comp
                .files
                .iter()
                .map(|f| strtab::tokenize(&mut table, &f.name))
                .collect();
            (name, files)
        })
        .collect();
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

    // Post-sort ids are what goes on the wire.
    let perm = table.sort();
    for (name, files) in &mut comp_seqs {
        name.remap(&perm);
        for f in files {
            f.remap(&perm);
        }
    }
    for (k, v) in &mut prop_seqs {
        k.remap(&perm);
        v.remap(&perm);
    }

    // Group identical ref lists; a group is dedup-emitted only when the
    // shared block beats repeating the list inline. BTreeMap keys give the
    // content-id emission order.
    let mut groups: BTreeMap<u64, (&Vec<DeltaChunkRef>, usize)> = BTreeMap::new();
    for comp in &pkg.components {
        for file in &comp.files {
            let cid = refs::content_id(&file.chunks);
            groups
                .entry(cid)
                .and_modify(|(_, n)| *n += 1)
                .or_insert((&file.chunks, 1));
        }
    }
    let dedup_lists: Vec<(u64, &Vec<DeltaChunkRef>)> = groups
        .iter()
        .filter(|(_, (list, n))| refs::dedup_pays(list, *n))
        .map(|(&cid, &(list, _))| (cid, list))
        .collect();
    let dedup_index: HashMap<u64, usize> = dedup_lists
        .iter()
        .enumerate()
        .map(|(i, &(cid, _))| (cid, i))
        .collect();

    let mut w = SectionWriter::new(
        format::header(FORMAT_V1, opts),
        opts.enable_compression,
        opts.compression_level,
    );
    w.section(SEC_METADATA, &format::encode_metadata(pkg))?;

    let checksums: Vec<_> = pkg.chunks.iter().map(|c| c.checksum).collect();
    let mut sec = Vec::new();
    transpose::encode_hash_list(&checksums, &mut sec);
    w.section(SEC_CHUNK_TABLE, &sec)?;

    let mut sec = Vec::new();
    put_uvarint(&mut sec, table.len() as u64);
    for entry in table.entries() {
        format::put_string(&mut sec, entry);
    }
    w.section(SEC_STRING_TABLE, &sec)?;

    w.section(SEC_PROPERTIES, &format::encode_props(&prop_seqs))?;

    let mut sec = Vec::new();
    put_uvarint(&mut sec, dedup_lists.len() as u64);
    for (_, list) in &dedup_lists {
        refs::write_ref_list(&mut sec, list);
    }
    w.section(SEC_CONTENT_IDS, &sec)?;

    let mut sec = Vec::new();
    put_uvarint(&mut sec, pkg.components.len() as u64);
    for (comp, (name_seq, file_seqs)) in pkg.components.iter().zip(&comp_seqs) {
        strtab::write_token_seq(&mut sec, name_seq);
        put_uvarint(&mut sec, comp.files.len() as u64);
        for (file, file_seq) in comp.files.iter().zip(file_seqs) {
            strtab::write_token_seq(&mut sec, file_seq);
            let FileHash::Short(fingerprint) = file.hash else {
                return Err(Error::format(format!(
                    "v1 package requires 8-byte file fingerprints, file {}",
                    file.name
                )));
            };
            sec.extend_from_slice(&fingerprint.to_le_bytes());
            match dedup_index.get(&refs::content_id(&file.chunks)) {
                Some(&idx) => {
                    sec.push(CHUNKS_BY_CONTENT_ID);
                    put_uvarint(&mut sec, idx as u64);
                }
                None => {
                    sec.push(CHUNKS_INLINE);
                    refs::write_ref_list(&mut sec, &file.chunks);
                }
            }
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
                format!("unknown v1 section id 0x{id:02x}"),
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
    let mut pkg = ReleasePackage::new(FORMAT_V1, "", "");
    format::decode_metadata(require(&sections, SEC_METADATA)?, &mut pkg, SEC_METADATA)?;

    let mut cur = require(&sections, SEC_CHUNK_TABLE)?;
    pkg.chunks = transpose::decode_hash_list(&mut cur)?
        .into_iter()
        .map(|checksum| ChunkInfo { checksum })
        .collect();
    format::expect_drained(cur, SEC_CHUNK_TABLE)?;

    let mut cur = require(&sections, SEC_STRING_TABLE)?;
    let count = take_uvarint(&mut cur)? as usize;
    let mut entries = Vec::with_capacity(count.min(cur.len()));
    for _ in 0..count {
        entries.push(format::take_string(&mut cur)?);
    }
    format::expect_drained(cur, SEC_STRING_TABLE)?;
    let table = StringTable::from_entries(entries);

    pkg.custom_properties =
        format::decode_props(require(&sections, SEC_PROPERTIES)?, &table, SEC_PROPERTIES)?;

    let mut cur = require(&sections, SEC_CONTENT_IDS)?;
    let list_count = take_uvarint(&mut cur)? as usize;
    let mut dedup_lists = Vec::with_capacity(list_count);
    for _ in 0..list_count {
        dedup_lists.push(refs::read_ref_list(&mut cur)?);
    }
    format::expect_drained(cur, SEC_CONTENT_IDS)?;

    let mut cur = require(&sections, SEC_COMPONENTS)?;
    let comp_count = take_uvarint(&mut cur)? as usize;
    let at = Location::in_section(SEC_COMPONENTS);
    for _ in 0..comp_count {
        let name_seq = strtab::read_token_seq(&mut cur)?;
        let name = strtab::detokenize(&table, &name_seq)?;
        let file_count = take_uvarint(&mut cur)? as usize;
        let mut files = Vec::with_capacity(file_count);
        for _ in 0..file_count {
            let file_seq = strtab::read_token_seq(&mut cur)?;
            let file_name = strtab::detokenize(&table, &file_seq)?;
            if cur.len() < 9 {
                return Err(Error::format_at("truncated file entry", at.clone()));
            }
            let fingerprint = u64::from_le_bytes(cur[..8].try_into().expect("8 bytes"));
            let discriminator = cur[8];
            cur = &cur[9..];
            let chunks = match discriminator {
                CHUNKS_INLINE => refs::read_ref_list(&mut cur)?,
                CHUNKS_BY_CONTENT_ID => {
                    let idx = take_uvarint(&mut cur)? as usize;
                    dedup_lists
                        .get(idx)
                        .cloned()
                        .ok_or_else(|| {
                            Error::format_at(
                                format!("content-id index {idx} out of range"),
                                at.clone(),
                            )
                        })?
                }
                d => {
                    return Err(Error::format_at(
                        format!("unknown chunk-location discriminator 0x{d:02x}"),
                        at.clone(),
                    ));
                }
            };
            files.push(ReleaseFile {
                name: file_name,
                hash: FileHash::Short(fingerprint),
                chunks,
            });
        }
        pkg.components.push(Component { name, files });
    }
    format::expect_drained(cur, SEC_COMPONENTS)?;

    // Every ref must resolve inside the chunk table.
    let table_len = pkg.chunks.len() as u32;
    for comp in &pkg.components {
        for file in &comp.files {
            for index in crate::bpkg::model::delta_decode_indices(&file.chunks) {
                if index >= table_len {
                    return Err(Error::format_at(
                        format!(
                            "chunk index {index} out of range for table of {table_len} in {}",
                            file.name
                        ),
                        at.clone(),
                    ));
                }
            }
        }
    }

    pkg.stats = format::decode_stats(require(&sections, SEC_STATS)?, SEC_STATS)?;
    pkg.string_table = table.into_entries();
    Ok(pkg)
}
