//! Release orchestration over the core engine: ingest a directory tree
//! into the store, materialize a stored release back onto disk, and
//! compute the chunk set a delta download has to ship.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use time::OffsetDateTime;
use tracing::debug;
use walkdir::WalkDir;
use xxhash_rust::xxh3::Xxh3;

use crate::bpkg::filedef::FileDefinition;
use crate::bpkg::format::{self, SerializeOptions};
use crate::bpkg::model::{
    ChunkInfo, Component, FORMAT_V1, FORMAT_V2, FileHash, ReleaseFile, ReleasePackage,
    delta_decode_indices, delta_encode_refs,
};
use crate::cancel::CancelToken;
use crate::chunking::fastcdc::{ChunkMapEntry, Chunker, StreamingChunker};
use crate::error::{Error, Result};
use crate::hash::Hash32;
use crate::store::ObjectStore;

#[derive(Debug, Clone, Default)]
pub struct ReleaseMeta {
    pub release_id: String,
    pub repo_id: String,
    pub notes: String,
    /// Unix seconds; now when unset.
    pub created_at: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct IngestOptions {
    /// BPKG format version to produce.
    pub version: u8,
    pub serialize: SerializeOptions,
    pub cancel: CancelToken,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            version: FORMAT_V2,
            serialize: SerializeOptions::default(),
            cancel: CancelToken::new(),
        }
    }
}

struct FilePlan {
    component: usize,
    name: String,
    chunks: Vec<ChunkMapEntry>,
    /// xxh3 of the file content, the v1 fingerprint.
    fingerprint: u64,
}

fn relative_name(path: &Path, root: &Path) -> Result<String> {
    let rel = path
        .strip_prefix(root)
        .map_err(|_| Error::format(format!("{} escapes its component root", path.display())))?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

/// Chunk one file, storing every chunk, and return its plan.
fn plan_file(
    store: &ObjectStore,
    chunker: &Chunker,
    component: usize,
    name: String,
    path: &Path,
    cancel: &CancelToken,
) -> Result<FilePlan> {
    let mut src = File::open(path)?;
    let params = chunker.params();
    let mut streaming = StreamingChunker::new(params);
    let mut buf = Vec::with_capacity(params.avg);
    let mut chunks = Vec::new();
    let mut fingerprint = Xxh3::new();
    let mut offset = 0u64;
    loop {
        cancel.bail_if_cancelled()?;
        let n = streaming.next_chunk(&mut src, &mut buf)?;
        if n == 0 {
            break;
        }
        let data = &buf[..n];
        fingerprint.update(data);
        let checksum = Hash32::of(data);
        store.put_chunk(checksum, data)?;
        chunks.push(ChunkMapEntry {
            checksum,
            offset,
            length: n as u64,
        });
        offset += n as u64;
    }
    if chunks.is_empty() {
        // Zero-byte file: one chunk of length 0.
        let checksum = Hash32::of(&[]);
        store.put_chunk(checksum, &[])?;
        chunks.push(ChunkMapEntry {
            checksum,
            offset: 0,
            length: 0,
        });
    }
    Ok(FilePlan {
        component,
        name,
        chunks,
        fingerprint: fingerprint.digest(),
    })
}

/// Ingest the named component directories as one release: chunk every file
/// in parallel, dedupe chunks into the store, store file-definitions (v2),
/// serialize the package, and store it under its content hash.
pub fn ingest_release(
    store: &ObjectStore,
    chunker: &Chunker,
    components: &[(&str, &Path)],
    meta: &ReleaseMeta,
    opts: &IngestOptions,
) -> Result<(ReleasePackage, Hash32)> {
    let mut work: Vec<(usize, String, PathBuf)> = Vec::new();
    for (index, (_, root)) in components.iter().enumerate() {
        let mut files: Vec<PathBuf> = Vec::new();
        for entry in WalkDir::new(root).follow_links(false) {
            let entry = entry.map_err(|e| Error::Io(e.into()))?;
            if entry.file_type().is_file() {
                files.push(entry.path().to_path_buf());
            }
        }
        files.sort();
        for path in files {
            let name = relative_name(&path, root)?;
            work.push((index, name, path));
        }
    }

    let plans: Vec<FilePlan> = work
        .par_iter()
        .map(|(index, name, path)| {
            plan_file(store, chunker, *index, name.clone(), path, &opts.cancel)
        })
        .collect::<Result<Vec<_>>>()?;

    let mut pkg = ReleasePackage::new(opts.version, &meta.release_id, &meta.repo_id);
    pkg.notes = meta.notes.clone();
    pkg.created_at = meta
        .created_at
        .unwrap_or_else(|| OffsetDateTime::now_utc().unix_timestamp());
    pkg.components = components
        .iter()
        .map(|(name, _)| Component {
            name: name.to_string(),
            files: Vec::new(),
        })
        .collect();

    let mut raw_size = 0u64;
    let mut deduped_size = 0u64;
    let mut seen: HashSet<Hash32> = HashSet::new();
    for plan in &plans {
        for c in &plan.chunks {
            raw_size += c.length;
            if seen.insert(c.checksum) {
                deduped_size += c.length;
            }
        }
    }

    match opts.version {
        FORMAT_V1 => {
            // Global chunk table in first-appearance order; files carry
            // delta refs into it.
            let mut table: Vec<ChunkInfo> = Vec::new();
            let mut table_index: std::collections::HashMap<Hash32, u32> =
                std::collections::HashMap::new();
            for plan in &plans {
                let spans: Vec<(u32, u64, u64)> = plan
                    .chunks
                    .iter()
                    .map(|c| {
                        let index = *table_index.entry(c.checksum).or_insert_with(|| {
                            table.push(ChunkInfo {
                                checksum: c.checksum,
                            });
                            (table.len() - 1) as u32
                        });
                        (index, c.offset, c.length)
                    })
                    .collect();
                pkg.components[plan.component].files.push(ReleaseFile {
                    name: plan.name.clone(),
                    hash: FileHash::Short(plan.fingerprint),
                    chunks: delta_encode_refs(&spans),
                });
            }
            pkg.chunks = table;
        }
        FORMAT_V2 => {
            for plan in &plans {
                let def = FileDefinition::new(plan.chunks.clone());
                let bytes = def.to_bytes();
                let hash = Hash32::of(&bytes);
                store.put_file_def(hash, &bytes)?;
                pkg.components[plan.component].files.push(ReleaseFile {
                    name: plan.name.clone(),
                    hash: FileHash::Full(hash),
                    chunks: Vec::new(),
                });
            }
            pkg.stats.chunk_count = seen.len() as u64;
        }
        v => return Err(Error::Unsupported(format!("release package version {v}"))),
    }

    pkg.stats.raw_size = raw_size;
    pkg.stats.deduped_size = deduped_size;
    pkg.rebuild_string_table();
    pkg.recompute_stats();

    let bytes = format::serialize(&pkg, &opts.serialize)?;
    let hash = store.put_release(&bytes)?;
    debug!(release = %hash, files = plans.len(), raw = raw_size, "release ingested");
    Ok((pkg, hash))
}

fn safe_join(root: &Path, rel: &str) -> Result<PathBuf> {
    let p = Path::new(rel);
    if p.is_absolute() || rel.split(['/', '\\']).any(|part| part == "..") {
        return Err(Error::format(format!("unsafe path: {rel}")));
    }
    Ok(root.join(p))
}

fn write_chunk(out: &mut File, entry: &ChunkMapEntry, data: &[u8]) -> Result<()> {
    if data.len() as u64 != entry.length {
        return Err(Error::corruption(format!(
            "chunk {} is {} bytes, expected {}",
            entry.checksum,
            data.len(),
            entry.length
        )));
    }
    if Hash32::of(data) != entry.checksum {
        return Err(Error::corruption(format!(
            "chunk {} content does not match its checksum",
            entry.checksum
        )));
    }
    out.write_all(data)?;
    Ok(())
}

/// Materialize a release package under `dest`, one directory per
/// component, walking every file's chunk refs through the store.
pub fn emit_release(
    store: &ObjectStore,
    pkg: &ReleasePackage,
    dest: &Path,
    cancel: &CancelToken,
) -> Result<()> {
    for comp in &pkg.components {
        let comp_dir = safe_join(dest, &comp.name)?;
        fs::create_dir_all(&comp_dir)?;
        for file in &comp.files {
            cancel.bail_if_cancelled()?;
            let out_path = safe_join(&comp_dir, &file.name)?;
            if let Some(parent) = out_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut out = File::create(&out_path)?;
            let def = file_definition(store, pkg, file)?;
            let mut written = 0u64;
            for entry in &def.chunks {
                cancel.bail_if_cancelled()?;
                if entry.offset != written {
                    return Err(Error::format(format!(
                        "chunk span out of order in {}: offset {} after {written} bytes",
                        file.name, entry.offset
                    )));
                }
                let data = store.get_chunk(&entry.checksum)?;
                write_chunk(&mut out, entry, &data)?;
                written += entry.length;
            }
            if written != def.total_len() {
                return Err(Error::corruption(format!(
                    "{} reconstructed to {written} bytes, expected {}",
                    file.name,
                    def.total_len()
                )));
            }
        }
    }
    Ok(())
}

/// The ordered chunk list of one release file, resolved per the package
/// version: v1 packages carry refs into their chunk table, v2 files point
/// at a pack-stored file-definition.
fn file_definition(
    store: &ObjectStore,
    pkg: &ReleasePackage,
    file: &ReleaseFile,
) -> Result<FileDefinition> {
    match (pkg.version, file.hash) {
        (FORMAT_V1, _) => {
            let indices = delta_decode_indices(&file.chunks);
            let mut chunks = Vec::with_capacity(file.chunks.len());
            for (r, index) in file.chunks.iter().zip(indices) {
                let info = pkg.chunks.get(index as usize).ok_or_else(|| {
                    Error::format(format!(
                        "chunk index {index} out of range in {}",
                        file.name
                    ))
                })?;
                chunks.push(ChunkMapEntry {
                    checksum: info.checksum,
                    offset: r.offset,
                    length: r.length,
                });
            }
            Ok(FileDefinition::new(chunks))
        }
        (FORMAT_V2, FileHash::Full(hash)) => {
            FileDefinition::from_bytes(&store.get_file_def(&hash)?)
        }
        (FORMAT_V2, FileHash::Short(_)) => Err(Error::format(format!(
            "v2 file {} carries an 8-byte fingerprint",
            file.name
        ))),
        (v, _) => Err(Error::Unsupported(format!("release package version {v}"))),
    }
}

/// Chunk hashes referenced by `child` but not by `parent`, in first-use
/// order, deduplicated: the set a delta download has to ship.
pub fn missing_chunks(
    store: &ObjectStore,
    parent: &ReleasePackage,
    child: &ReleasePackage,
) -> Result<Vec<Hash32>> {
    let mut parent_set: HashSet<Hash32> = HashSet::new();
    for comp in &parent.components {
        for file in &comp.files {
            for entry in file_definition(store, parent, file)?.chunks {
                parent_set.insert(entry.checksum);
            }
        }
    }
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for comp in &child.components {
        for file in &comp.files {
            for entry in file_definition(store, child, file)?.chunks {
                if !parent_set.contains(&entry.checksum) && seen.insert(entry.checksum) {
                    out.push(entry.checksum);
                }
            }
        }
    }
    Ok(out)
}
