//! Content-addressed object store: 4096 chunk shards, 4096 file-definition
//! shards, and a flat release-package directory, all under one root.
//!
//! ```text
//! <root>/Chunks/<xx>/index<xxx>.idx
//! <root>/Chunks/<xx>/chunks<xxx>-<n>.pack
//! <root>/FileDefs/<xx>/index<xxx>.idx
//! <root>/FileDefs/<xx>/fileDefs<xxx>-<n>.pack
//! <root>/Releases/<xxx>/<hex64>.rdef
//! ```
//!
//! The shard directory is built at construction and never mutated; all
//! shared mutable state lives inside the shards.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use tracing::debug;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::hash::Hash32;
use crate::pack::shard::PackShard;

pub const SHARD_COUNT: usize = 4096;

const CHUNKS_DIR: &str = "Chunks";
const FILE_DEFS_DIR: &str = "FileDefs";
const RELEASES_DIR: &str = "Releases";

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StoreStats {
    pub chunk_count: u64,
    pub chunk_bytes: u64,
    pub file_def_count: u64,
    pub file_def_bytes: u64,
    pub release_count: u64,
    /// Sum of uncompressed entry lengths; only filled by an accurate pass.
    pub uncompressed_bytes: Option<u64>,
}

impl StoreStats {
    pub fn stored_bytes(&self) -> u64 {
        self.chunk_bytes + self.file_def_bytes
    }

    pub fn compression_ratio(&self) -> Option<f64> {
        let uncompressed = self.uncompressed_bytes?;
        if self.stored_bytes() == 0 {
            return None;
        }
        Some(uncompressed as f64 / self.stored_bytes() as f64)
    }
}

pub struct ObjectStore {
    root: PathBuf,
    chunks: Vec<PackShard>,
    file_defs: Vec<PackShard>,
}

impl ObjectStore {
    /// Open (or create) a store rooted at `root`, loading every shard's
    /// index file.
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root.join(CHUNKS_DIR))?;
        fs::create_dir_all(root.join(FILE_DEFS_DIR))?;
        fs::create_dir_all(root.join(RELEASES_DIR))?;
        let chunks = open_shards(root, CHUNKS_DIR, "chunks")?;
        let file_defs = open_shards(root, FILE_DEFS_DIR, "fileDefs")?;
        Ok(Self {
            root: root.to_path_buf(),
            chunks,
            file_defs,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn chunk_shard(&self, hash: &Hash32) -> &PackShard {
        &self.chunks[hash.shard_index()]
    }

    fn file_def_shard(&self, hash: &Hash32) -> &PackShard {
        &self.file_defs[hash.shard_index()]
    }

    /// Returns the framed bytes written, 0 when the chunk was already
    /// present.
    pub fn put_chunk(&self, hash: Hash32, payload: &[u8]) -> Result<u64> {
        self.chunk_shard(&hash).put(hash, payload)
    }

    pub fn get_chunk(&self, hash: &Hash32) -> Result<Vec<u8>> {
        self.chunk_shard(hash).get(hash)
    }

    pub fn has_chunk(&self, hash: &Hash32) -> bool {
        self.chunk_shard(hash).contains(hash)
    }

    pub fn put_file_def(&self, hash: Hash32, bytes: &[u8]) -> Result<u64> {
        self.file_def_shard(&hash).put(hash, bytes)
    }

    pub fn get_file_def(&self, hash: &Hash32) -> Result<Vec<u8>> {
        self.file_def_shard(hash).get(hash)
    }

    pub fn has_file_def(&self, hash: &Hash32) -> bool {
        self.file_def_shard(hash).contains(hash)
    }

    fn release_path(&self, hash: &Hash32) -> PathBuf {
        self.root
            .join(RELEASES_DIR)
            .join(hash.prefix3())
            .join(format!("{}.rdef", hash.to_hex()))
    }

    /// Store serialized release-package bytes under their Blake3 hash.
    /// Immutable once written; a rewrite lands under a new hash.
    pub fn put_release(&self, bytes: &[u8]) -> Result<Hash32> {
        let hash = Hash32::of(bytes);
        let path = self.release_path(&hash);
        let dir = path.parent().expect("release path has a parent");
        fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(bytes)?;
        tmp.as_file_mut().flush()?;
        tmp.persist(&path).map_err(|e| Error::Io(e.error))?;
        Ok(hash)
    }

    pub fn get_release(&self, hash: &Hash32) -> Result<Vec<u8>> {
        match fs::read(self.release_path(hash)) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("release {}", hash.to_hex())))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn release_exists(&self, hash: &Hash32) -> bool {
        self.release_path(hash).exists()
    }

    pub fn delete_release(&self, hash: &Hash32) -> Result<()> {
        match fs::remove_file(self.release_path(hash)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("release {}", hash.to_hex())))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Every stored release hash, ascending.
    pub fn list_releases(&self) -> Result<Vec<Hash32>> {
        let mut out = Vec::new();
        for dir in fs::read_dir(self.root.join(RELEASES_DIR))? {
            let dir = dir?;
            if !dir.file_type()?.is_dir() {
                continue;
            }
            for file in fs::read_dir(dir.path())? {
                let file = file?;
                let name = file.file_name();
                let Some(name) = name.to_str() else { continue };
                if let Some(hexpart) = name.strip_suffix(".rdef")
                    && let Ok(hash) = Hash32::from_hex(hexpart)
                {
                    out.push(hash);
                }
            }
        }
        out.sort_unstable();
        Ok(out)
    }

    /// Rebuild every shard index from the pack files. Shards proceed in
    /// parallel; work within one shard stays serialized.
    pub fn rebuild(&self, cancel: &CancelToken) -> Result<()> {
        self.chunks
            .par_iter()
            .chain(self.file_defs.par_iter())
            .try_for_each(|shard| shard.rebuild_index(cancel))?;
        debug!(root = %self.root.display(), "storage rebuilt");
        Ok(())
    }

    /// Aggregate counts and byte totals. `accurate` additionally peeks at
    /// every indexed entry header to recover uncompressed sizes.
    pub fn stats(&self, accurate: bool) -> Result<StoreStats> {
        let mut stats = StoreStats {
            chunk_count: self.chunks.iter().map(|s| s.len() as u64).sum(),
            chunk_bytes: self.chunks.iter().map(|s| s.stored_bytes()).sum(),
            file_def_count: self.file_defs.iter().map(|s| s.len() as u64).sum(),
            file_def_bytes: self.file_defs.iter().map(|s| s.stored_bytes()).sum(),
            release_count: self.list_releases()?.len() as u64,
            uncompressed_bytes: None,
        };
        if accurate {
            let total = self
                .chunks
                .par_iter()
                .chain(self.file_defs.par_iter())
                .map(|s| s.uncompressed_bytes())
                .try_reduce(|| 0u64, |a, b| Ok(a + b))?;
            stats.uncompressed_bytes = Some(total);
        }
        Ok(stats)
    }
}

fn open_shards(root: &Path, sub: &str, stem: &str) -> Result<Vec<PackShard>> {
    (0..SHARD_COUNT)
        .into_par_iter()
        .map(|i| {
            let prefix = format!("{i:03x}");
            let dir = root.join(sub).join(&prefix[..2]);
            PackShard::open(&dir, &prefix, stem)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_land_in_their_shard_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ObjectStore::open(tmp.path()).unwrap();
        let payload = b"shard me".to_vec();
        let hash = Hash32::of(&payload);
        assert!(store.put_chunk(hash, &payload).unwrap() > 0);
        assert!(store.has_chunk(&hash));
        assert_eq!(store.get_chunk(&hash).unwrap(), payload);

        let pack = tmp
            .path()
            .join(CHUNKS_DIR)
            .join(hash.prefix2())
            .join(format!("chunks{}-0.pack", hash.prefix3()));
        assert!(pack.exists(), "missing {}", pack.display());
    }

    #[test]
    fn file_defs_are_separate_from_chunks() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ObjectStore::open(tmp.path()).unwrap();
        let bytes = b"filedef bytes".to_vec();
        let hash = Hash32::of(&bytes);
        store.put_file_def(hash, &bytes).unwrap();
        assert!(store.has_file_def(&hash));
        assert!(!store.has_chunk(&hash));
        assert_eq!(store.get_file_def(&hash).unwrap(), bytes);
    }

    #[test]
    fn release_lifecycle() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ObjectStore::open(tmp.path()).unwrap();
        let bytes = b"release package bytes".to_vec();
        let hash = store.put_release(&bytes).unwrap();
        assert_eq!(hash, Hash32::of(&bytes));
        assert!(store.release_exists(&hash));
        assert_eq!(store.get_release(&hash).unwrap(), bytes);
        assert_eq!(store.list_releases().unwrap(), vec![hash]);

        store.delete_release(&hash).unwrap();
        assert!(!store.release_exists(&hash));
        assert!(store.get_release(&hash).unwrap_err().is_not_found());
        assert!(store.delete_release(&hash).unwrap_err().is_not_found());
    }

    #[test]
    fn stats_and_rebuild_cover_all_shards() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ObjectStore::open(tmp.path()).unwrap();
        let payloads: Vec<Vec<u8>> = (0u32..32)
            .map(|i| Hash32::of(&i.to_le_bytes()).as_bytes().repeat(4))
            .collect();
        for p in &payloads {
            store.put_chunk(Hash32::of(p), p).unwrap();
        }
        store.put_file_def(Hash32::of(b"fd"), b"fd-bytes").unwrap();
        store.put_release(b"rel").unwrap();

        let stats = store.stats(true).unwrap();
        assert_eq!(stats.chunk_count, 32);
        assert_eq!(stats.file_def_count, 1);
        assert_eq!(stats.release_count, 1);
        assert!(stats.stored_bytes() > 0);
        let uncompressed = stats.uncompressed_bytes.unwrap();
        assert_eq!(
            uncompressed,
            payloads.iter().map(|p| p.len() as u64).sum::<u64>() + 8
        );
        assert!(stats.compression_ratio().is_some());

        store.rebuild(&CancelToken::new()).unwrap();
        let after = store.stats(false).unwrap();
        assert_eq!(after.chunk_count, 32);
        assert_eq!(after.file_def_count, 1);
        for p in &payloads {
            assert_eq!(store.get_chunk(&Hash32::of(p)).unwrap(), *p);
        }
    }
}
