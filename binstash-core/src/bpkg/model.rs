//! The in-memory release-package model shared by both BPKG wire versions.

use std::collections::{BTreeMap, HashMap};

use crate::bpkg::strtab::{self, StringTable};
use crate::hash::Hash32;

pub const FORMAT_V1: u8 = 1;
pub const FORMAT_V2: u8 = 2;

/// One row of the v1 global chunk table. The row's index inside the table
/// is its identity everywhere else in the package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkInfo {
    pub checksum: Hash32,
}

/// A chunk reference relative to the previous chunk of the same file.
/// `delta_index` is `current - previous` over global chunk-table indices in
/// wrapping u32 arithmetic; the first chunk of a file carries its absolute
/// index. `offset` and `length` give the physical span inside the
/// reconstructed file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeltaChunkRef {
    pub delta_index: u32,
    pub offset: u64,
    pub length: u64,
}

/// Turn absolute chunk-table indices (with spans) into delta refs.
pub fn delta_encode_refs(entries: &[(u32, u64, u64)]) -> Vec<DeltaChunkRef> {
    let mut prev = 0u32;
    let mut out = Vec::with_capacity(entries.len());
    for (i, &(index, offset, length)) in entries.iter().enumerate() {
        let delta_index = if i == 0 {
            index
        } else {
            index.wrapping_sub(prev)
        };
        out.push(DeltaChunkRef {
            delta_index,
            offset,
            length,
        });
        prev = index;
    }
    out
}

/// Invert `delta_encode_refs`: recover the absolute chunk-table index
/// sequence.
pub fn delta_decode_indices(refs: &[DeltaChunkRef]) -> Vec<u32> {
    let mut prev = 0u32;
    refs.iter()
        .enumerate()
        .map(|(i, r)| {
            let index = if i == 0 {
                r.delta_index
            } else {
                prev.wrapping_add(r.delta_index)
            };
            prev = index;
            index
        })
        .collect()
}

/// v1 carries an 8-byte fingerprint per file; v2 a full content hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileHash {
    Short(u64),
    Full(Hash32),
}

impl FileHash {
    pub fn hex(&self) -> String {
        match self {
            FileHash::Short(v) => hex::encode(v.to_le_bytes()),
            FileHash::Full(h) => h.to_hex(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseFile {
    pub name: String,
    pub hash: FileHash,
    /// Chunk refs into the package chunk table (v1). Empty in v2, where
    /// the pack-stored file-definition holds the chunk list.
    pub chunks: Vec<DeltaChunkRef>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Component {
    pub name: String,
    pub files: Vec<ReleaseFile>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PackageStats {
    pub component_count: u64,
    pub file_count: u64,
    pub chunk_count: u64,
    pub raw_size: u64,
    pub deduped_size: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReleasePackage {
    /// BPKG format version, 1 or 2.
    pub version: u8,
    pub release_id: String,
    pub repo_id: String,
    pub notes: String,
    /// Unix seconds.
    pub created_at: i64,
    pub custom_properties: BTreeMap<String, String>,
    /// Global chunk table, v1 only; empty in v2.
    pub chunks: Vec<ChunkInfo>,
    /// Interned token substrings. Rebuilt (and sorted) by the serializer;
    /// kept on the model so a decoded package mirrors its wire form.
    pub string_table: Vec<String>,
    pub components: Vec<Component>,
    pub stats: PackageStats,
}

impl ReleasePackage {
    pub fn new(version: u8, release_id: &str, repo_id: &str) -> Self {
        Self {
            version,
            release_id: release_id.to_string(),
            repo_id: repo_id.to_string(),
            notes: String::new(),
            created_at: 0,
            custom_properties: BTreeMap::new(),
            chunks: Vec::new(),
            string_table: Vec::new(),
            components: Vec::new(),
            stats: PackageStats::default(),
        }
    }

    pub fn file_count(&self) -> u64 {
        self.components.iter().map(|c| c.files.len() as u64).sum()
    }

    /// Re-tokenize every component name, file name, and property pair,
    /// then sort: the canonical table for the current content.
    pub fn rebuild_string_table(&mut self) {
        let mut table = StringTable::new();
        for comp in &self.components {
            strtab::tokenize(&mut table, &comp.name);
            for file in &comp.files {
                strtab::tokenize(&mut table, &file.name);
            }
        }
        for (key, value) in &self.custom_properties {
            strtab::tokenize(&mut table, key);
            strtab::tokenize(&mut table, value);
        }
        table.sort();
        self.string_table = table.into_entries();
    }

    /// Refresh `stats` from the component tree. Counts always come from
    /// the tree; raw and deduped sizes are recomputed from the chunk refs
    /// when present (v1) and left producer-supplied otherwise (v2 elides
    /// spans from the package).
    pub fn recompute_stats(&mut self) {
        self.stats.component_count = self.components.len() as u64;
        self.stats.file_count = self.file_count();
        if self.version == FORMAT_V1 {
            self.stats.chunk_count = self.chunks.len() as u64;
            let mut raw = 0u64;
            let mut first_use: HashMap<u32, u64> = HashMap::new();
            for comp in &self.components {
                for file in &comp.files {
                    let indices = delta_decode_indices(&file.chunks);
                    for (r, index) in file.chunks.iter().zip(indices) {
                        raw += r.length;
                        first_use.entry(index).or_insert(r.length);
                    }
                }
            }
            self.stats.raw_size = raw;
            self.stats.deduped_size = first_use.values().sum();
        }
    }
}

/// The ordered unique file-hash list of a v2 package: frequency
/// descending, ties broken by hash bytes ascending. Files reference a
/// hash by its index in this list on the wire.
pub fn unique_file_hashes(pkg: &ReleasePackage) -> Vec<Hash32> {
    let mut freq: HashMap<Hash32, u64> = HashMap::new();
    for comp in &pkg.components {
        for file in &comp.files {
            if let FileHash::Full(h) = file.hash {
                *freq.entry(h).or_insert(0) += 1;
            }
        }
    }
    let mut unique: Vec<Hash32> = freq.keys().copied().collect();
    unique.sort_by(|a, b| freq[b].cmp(&freq[a]).then(a.cmp(b)));
    unique
}
