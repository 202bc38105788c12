//! The patch record: a flat, owned description of how to turn a parent
//! release package into a child. No references back into either package.

use crate::bpkg::model::{
    ChunkInfo, Component, DeltaChunkRef, FileHash, PackageStats, ReleaseFile,
};
use crate::hash::Hash32;
use crate::patch::script::EditScript;

/// Set delta over the interned string tables; ids are indices within the
/// respective side's table. Informational on apply, which rebuilds the
/// table from the patched content.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StringTableDelta {
    pub adds: Vec<(u32, String)>,
    pub removes: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PropChange {
    Add { key: String, value: String },
    Remove { key: String },
    Modify { key: String, value: String },
}

/// A kept file whose hash or chunk list changed between the two sides.
#[derive(Debug, Clone, PartialEq)]
pub struct FileModify {
    pub name: String,
    pub hash: FileHash,
    /// Replacement chunk list; `None` when the package version keeps chunk
    /// lists outside the package (v2).
    pub chunks: Option<Vec<DeltaChunkRef>>,
}

/// Edit script over one component's files plus the kept-file modifies.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentFilePatch {
    pub component: String,
    pub files: EditScript<ReleaseFile>,
    pub modifies: Vec<FileModify>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContentIdChange {
    pub content_id: u64,
    pub refs: Vec<DeltaChunkRef>,
}

/// v1 content-id table delta, keyed by content id.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContentIdDelta {
    pub adds: Vec<ContentIdChange>,
    pub removes: Vec<u64>,
    pub modifies: Vec<ContentIdChange>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReleasePackagePatch {
    /// Metadata headers copied from the child.
    pub version: u8,
    pub release_id: String,
    pub repo_id: String,
    pub notes: String,
    pub created_at: i64,
    pub stats: PackageStats,

    pub string_delta: StringTableDelta,
    /// v1: LCS script over the global chunk table.
    pub chunk_script: Option<EditScript<ChunkInfo>>,
    /// v2: LCS script over the ordered unique file-hash list.
    pub file_hash_script: Option<EditScript<Hash32>>,
    /// v1 only.
    pub content_id_delta: Option<ContentIdDelta>,
    /// Inserts carry whole components (name plus full file payloads).
    pub component_script: EditScript<Component>,
    /// One per component present on both sides.
    pub component_file_patches: Vec<ComponentFilePatch>,
    pub property_changes: Vec<PropChange>,
}
