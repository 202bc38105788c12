//! One shard of the chunk store: an append-only index file, a rolling
//! sequence of append-only pack files, and an in-memory hash map over both.
//!
//! Locking: writers serialize on `pack_lock` for pack-file selection,
//! append, and map insert; the index-file append runs under `index_lock`.
//! Readers take `pack_lock` for the open+seek+read of a pack entry. The
//! invariant is that an index entry is appended only after its pack bytes
//! are durable.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::error::{Error, Location, Result};
use crate::hash::Hash32;
use crate::pack::entry::{self, DEFAULT_COMPRESSION_LEVEL, Entries};
use crate::util::varint::{put_uvarint, take_uvarint};

/// Pack files roll to the next sequence number when a write would push
/// them past this size.
pub const PACK_FILE_CAP: u64 = 4 << 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackLocation {
    pub file_no: u32,
    pub offset: u64,
    pub length: u64,
}

struct Cursor {
    file_no: u32,
}

pub struct PackShard {
    dir: PathBuf,
    /// 3-hex-char shard key; part of every file name in `dir`.
    prefix: String,
    /// Pack file stem, `chunks` or `fileDefs`.
    stem: String,
    cap: u64,
    index: RwLock<HashMap<Hash32, PackLocation>>,
    pack_lock: Mutex<Cursor>,
    index_lock: Mutex<()>,
}

impl PackShard {
    pub fn open(dir: &Path, prefix: &str, stem: &str) -> Result<Self> {
        Self::with_cap(dir, prefix, stem, PACK_FILE_CAP)
    }

    /// `cap` override exists so the roll-over path is testable without
    /// writing 4 GiB.
    pub fn with_cap(dir: &Path, prefix: &str, stem: &str, cap: u64) -> Result<Self> {
        let shard = Self {
            dir: dir.to_path_buf(),
            prefix: prefix.to_string(),
            stem: stem.to_string(),
            cap,
            index: RwLock::new(HashMap::new()),
            pack_lock: Mutex::new(Cursor { file_no: 0 }),
            index_lock: Mutex::new(()),
        };
        let mut map = HashMap::new();
        let index_path = shard.index_path();
        if index_path.exists() {
            let bytes = fs::read(&index_path)?;
            decode_index(&bytes, &shard.prefix, &mut map);
        }
        let max_on_disk = shard.pack_file_numbers()?.into_iter().max();
        let max_indexed = map.values().map(|l| l.file_no).max();
        shard.pack_lock.lock().unwrap().file_no =
            max_on_disk.into_iter().chain(max_indexed).max().unwrap_or(0);
        *shard.index.write().unwrap() = map;
        Ok(shard)
    }

    fn index_path(&self) -> PathBuf {
        self.dir.join(format!("index{}.idx", self.prefix))
    }

    fn pack_path(&self, file_no: u32) -> PathBuf {
        self.dir.join(format!("{}{}-{}.pack", self.stem, self.prefix, file_no))
    }

    /// Sequence numbers of the pack files present on disk, ascending.
    fn pack_file_numbers(&self) -> Result<Vec<u32>> {
        let mut numbers = Vec::new();
        let read = match fs::read_dir(&self.dir) {
            Ok(read) => read,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(numbers),
            Err(e) => return Err(e.into()),
        };
        let head = format!("{}{}-", self.stem, self.prefix);
        for entry in read {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(rest) = name.strip_prefix(&head)
                && let Some(no) = rest.strip_suffix(".pack")
                && let Ok(no) = no.parse::<u32>()
            {
                numbers.push(no);
            }
        }
        numbers.sort_unstable();
        Ok(numbers)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn contains(&self, hash: &Hash32) -> bool {
        self.index.read().unwrap().contains_key(hash)
    }

    /// Unique hashes indexed.
    pub fn len(&self) -> usize {
        self.index.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total framed bytes referenced by the index.
    pub fn stored_bytes(&self) -> u64 {
        self.index.read().unwrap().values().map(|l| l.length).sum()
    }

    /// Sum of uncompressed entry lengths, recovered by peeking at every
    /// indexed entry's header.
    pub fn uncompressed_bytes(&self) -> Result<u64> {
        let locations: Vec<PackLocation> =
            self.index.read().unwrap().values().copied().collect();
        let _guard = self.pack_lock.lock().unwrap();
        let mut by_file: HashMap<u32, Vec<PackLocation>> = HashMap::new();
        for loc in locations {
            by_file.entry(loc.file_no).or_default().push(loc);
        }
        let mut total = 0u64;
        for (file_no, locs) in by_file {
            let mut f = File::open(self.pack_path(file_no))?;
            for loc in locs {
                f.seek(SeekFrom::Start(loc.offset))?;
                let at = self.location(file_no, loc.offset);
                let header = entry::read_header(&mut f, false, &at)?
                    .ok_or_else(|| Error::format_at("entry missing at offset", at))?;
                total += u64::from(header.uncompressed_len);
            }
        }
        Ok(total)
    }

    fn location(&self, file_no: u32, offset: u64) -> Location {
        Location::in_shard(&self.prefix).pack_file(file_no).offset(offset)
    }

    /// Store `payload` under `hash`. Returns the framed byte count, or 0
    /// when the hash was already present (idempotent dedupe).
    pub fn put(&self, hash: Hash32, payload: &[u8]) -> Result<u64> {
        // Fast path: read-only containment check without the pack lock.
        if self.contains(&hash) {
            return Ok(0);
        }
        let mut cursor = self.pack_lock.lock().unwrap();
        // Re-check under the lock to serialize racing writers.
        if self.contains(&hash) {
            return Ok(0);
        }
        let bytes = entry::encode_entry(payload, DEFAULT_COMPRESSION_LEVEL)?;
        fs::create_dir_all(&self.dir)?;

        let mut file_no = cursor.file_no;
        let (offset, written) = loop {
            let mut f = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.pack_path(file_no))?;
            let offset = f.metadata()?.len();
            if offset > 0 && offset + bytes.len() as u64 > self.cap {
                file_no += 1;
                continue;
            }
            f.write_all(&bytes)?;
            f.flush()?;
            break (offset, bytes.len() as u64);
        };
        cursor.file_no = file_no;
        let loc = PackLocation {
            file_no,
            offset,
            length: written,
        };
        self.index.write().unwrap().insert(hash, loc);
        {
            let _guard = self.index_lock.lock().unwrap();
            self.append_index_record(&hash, &loc)?;
        }
        Ok(written)
    }

    fn append_index_record(&self, hash: &Hash32, loc: &PackLocation) -> Result<()> {
        let mut record = Vec::with_capacity(32 + 15);
        record.extend_from_slice(hash.as_bytes());
        put_uvarint(&mut record, u64::from(loc.file_no));
        put_uvarint(&mut record, loc.offset);
        put_uvarint(&mut record, loc.length);
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.index_path())?;
        f.write_all(&record)?;
        f.flush()?;
        Ok(())
    }

    /// Fetch the payload stored under `hash`.
    pub fn get(&self, hash: &Hash32) -> Result<Vec<u8>> {
        let _guard = self.pack_lock.lock().unwrap();
        let loc = self
            .index
            .read()
            .unwrap()
            .get(hash)
            .copied()
            .ok_or_else(|| Error::NotFound(hash.to_hex()))?;
        let path = self.pack_path(loc.file_no);
        let mut f = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!(
                    "pack file {} missing for {}",
                    path.display(),
                    hash.to_hex()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        f.seek(SeekFrom::Start(loc.offset))?;
        entry::read_entry(&mut f, false, self.location(loc.file_no, loc.offset))
    }

    /// Rebuild the index file and in-memory map from the pack files alone.
    /// Duplicate payloads are dropped; a torn or unreadable entry ends that
    /// pack file and the rebuild moves on to the next one.
    pub fn rebuild_index(&self, cancel: &CancelToken) -> Result<()> {
        let _cursor = self.pack_lock.lock().unwrap();
        let _iguard = self.index_lock.lock().unwrap();
        fs::create_dir_all(&self.dir)?;
        let mut index_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(self.index_path())?;
        self.index.write().unwrap().clear();

        let mut map = HashMap::new();
        for file_no in self.pack_file_numbers()? {
            cancel.bail_if_cancelled()?;
            let f = File::open(self.pack_path(file_no))?;
            let base = Location::in_shard(&self.prefix).pack_file(file_no);
            for item in Entries::new(f, false, base) {
                let (offset, total, payload) = match item {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(shard = %self.prefix, pack = file_no, error = %e,
                              "stopping rebuild of this pack file");
                        break;
                    }
                };
                let hash = Hash32::of(&payload);
                if map.contains_key(&hash) {
                    continue;
                }
                let loc = PackLocation {
                    file_no,
                    offset,
                    length: total,
                };
                let mut record = Vec::with_capacity(32 + 15);
                record.extend_from_slice(hash.as_bytes());
                put_uvarint(&mut record, u64::from(loc.file_no));
                put_uvarint(&mut record, loc.offset);
                put_uvarint(&mut record, loc.length);
                index_file.write_all(&record)?;
                map.insert(hash, loc);
            }
        }
        index_file.flush()?;
        debug!(shard = %self.prefix, entries = map.len(), "index rebuilt");
        *self.index.write().unwrap() = map;
        Ok(())
    }

    /// Rewrite every pack file through the current entry codec via a temp
    /// twin and atomic replace, then rebuild the index (offsets move).
    /// `salvage` recovers entries behind legacy headers and skips entries
    /// that fail verification instead of aborting.
    pub fn rebuild_packs(&self, salvage: bool, cancel: &CancelToken) -> Result<()> {
        {
            let _cursor = self.pack_lock.lock().unwrap();
            for file_no in self.pack_file_numbers()? {
                cancel.bail_if_cancelled()?;
                let path = self.pack_path(file_no);
                let src = File::open(&path)?;
                let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
                let base = Location::in_shard(&self.prefix).pack_file(file_no);
                for item in Entries::new(src, salvage, base) {
                    match item {
                        Ok((_, _, payload)) => {
                            entry::write_entry(
                                tmp.as_file_mut(),
                                &payload,
                                DEFAULT_COMPRESSION_LEVEL,
                            )?;
                        }
                        Err(e) if salvage => {
                            warn!(shard = %self.prefix, pack = file_no, error = %e,
                                  "skipping unrecoverable entry");
                        }
                        Err(e) => return Err(e),
                    }
                }
                tmp.as_file_mut().flush()?;
                tmp.persist(&path)
                    .map_err(|e| Error::Io(e.error))?;
            }
        }
        self.rebuild_index(cancel)
    }
}

fn decode_index(bytes: &[u8], prefix: &str, map: &mut HashMap<Hash32, PackLocation>) {
    let mut cur = bytes;
    while !cur.is_empty() {
        if cur.len() < 32 {
            warn!(shard = %prefix, "torn index record at tail, ignoring");
            break;
        }
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&cur[..32]);
        cur = &cur[32..];
        let (file_no, offset, length) = match (
            take_uvarint(&mut cur),
            take_uvarint(&mut cur),
            take_uvarint(&mut cur),
        ) {
            (Ok(f), Ok(o), Ok(l)) => (f as u32, o, l),
            _ => {
                warn!(shard = %prefix, "torn index record at tail, ignoring");
                break;
            }
        };
        // First write wins; the entry is written once per unique hash.
        map.entry(Hash32::from_bytes(hash)).or_insert(PackLocation {
            file_no,
            offset,
            length,
        });
    }
}
