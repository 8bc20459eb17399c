//! # Snapshot files
//!
//! The vector index and the id mapping are persisted as two files derived from the
//! record store path, always written and read as one unit:
//!
//! ```text
//! memories.db            record store (SQLite)
//! memories.vector_index  VectorIndex snapshot
//! memories.id_mapping    IdMapping snapshot
//! ```
//!
//! ## File layout
//! Each file is a bincode-encoded [`Header`] followed by the bincode-encoded payload.
//! The header carries:
//! - `count`: number of entries in the payload,
//! - `checksum`: BLAKE3 of the payload bytes,
//! - `pair`: BLAKE3 of the *vector* payload, written into both headers so the two
//!   files of one checkpoint can be matched against each other.
//!
//! ## Write protocol
//! Both files are staged as temporaries in the target directory and fsynced before
//! either one is renamed into place. A crash between the two renames leaves files whose
//! `pair` tags differ, which [`load`] reports as [`MemoryError::SnapshotCorrupt`].
//!
//! ## Identity and locking
//! The `pair` tag doubles as the [`SnapshotTag`] of a checkpoint: a process remembers
//! the tag it loaded, and [`current_tag`] tells it whether another process has saved
//! since. Readers and writers that need a stable view hold the advisory [`lock`] on
//! `memories.snapshot_lock` around the read-compare-write sequence.

use bincode::config;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use std::ffi::OsString;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::error::{MemoryError, Result};
use crate::id_mapping::IdMapping;
use crate::vector_store::VectorIndex;

const MAGIC: [u8; 4] = *b"PMEM";
const FORMAT_VERSION: u32 = 1;
// Upper bound on an encoded `Header` with varint integers.
const HEADER_READ_LIMIT: u64 = 256;

/// Identifies one saved checkpoint; equal tags mean identical vector payloads.
pub type SnapshotTag = [u8; 32];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum SnapshotKind {
    Vectors,
    Mapping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Header {
    magic: [u8; 4],
    format: u32,
    kind: SnapshotKind,
    count: u64,
    pair: [u8; 32],
    checksum: [u8; 32],
    payload_len: u64,
}

/// Locations of the two snapshot files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotPaths {
    pub vectors: PathBuf,
    pub mapping: PathBuf,
    pub lock: PathBuf,
}

impl SnapshotPaths {
    /// Derive both paths from the record store path by swapping its extension.
    pub fn from_db_path(db_path: &Path) -> Self {
        Self {
            vectors: db_path.with_extension("vector_index"),
            mapping: db_path.with_extension("id_mapping"),
            lock: db_path.with_extension("snapshot_lock"),
        }
    }

    fn any_exists(&self) -> bool {
        self.vectors.exists() || self.mapping.exists()
    }
}

/// A loaded snapshot pair and the tag it was saved under.
#[derive(Debug)]
pub struct Snapshot {
    pub index: VectorIndex,
    pub mapping: IdMapping,
    pub tag: SnapshotTag,
}

/// Exclusive advisory lock on the snapshot pair, released on drop.
#[derive(Debug)]
pub struct SnapshotLock {
    _file: fs::File,
}

/// Block until this handle holds the snapshot lock for `paths`.
///
/// The lock is advisory and only excludes other callers of this function, in this
/// process or another one.
pub fn lock(paths: &SnapshotPaths) -> Result<SnapshotLock> {
    fs::create_dir_all(parent_dir(&paths.lock))?;
    let file = fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&paths.lock)?;
    file.lock()?;
    Ok(SnapshotLock { _file: file })
}

fn encode_file(kind: SnapshotKind, count: usize, pair: [u8; 32], payload: &[u8]) -> Result<Vec<u8>> {
    let header = Header {
        magic: MAGIC,
        format: FORMAT_VERSION,
        kind,
        count: count as u64,
        pair,
        checksum: *blake3::hash(payload).as_bytes(),
        payload_len: payload.len() as u64,
    };
    let mut bytes = bincode::serde::encode_to_vec(&header, config::standard())?;
    bytes.extend_from_slice(payload);
    Ok(bytes)
}

fn corrupt_in(path: &Path, why: String) -> MemoryError {
    MemoryError::SnapshotCorrupt(format!("{}: {why}", path.display()))
}

fn decode_header(path: &Path, bytes: &[u8], kind: SnapshotKind) -> Result<(Header, usize)> {
    let corrupt = |why: String| corrupt_in(path, why);

    let (header, used): (Header, usize) =
        bincode::serde::decode_from_slice(bytes, config::standard())
            .map_err(|e| corrupt(format!("unreadable header ({e})")))?;

    if header.magic != MAGIC {
        return Err(corrupt("not a snapshot file".into()));
    }
    if header.format != FORMAT_VERSION {
        return Err(corrupt(format!("unsupported format version {}", header.format)));
    }
    if header.kind != kind {
        return Err(corrupt(format!("expected {kind:?} snapshot, found {:?}", header.kind)));
    }
    Ok((header, used))
}

fn read_file<T: DeserializeOwned>(path: &Path, kind: SnapshotKind) -> Result<(Header, T)> {
    let bytes = fs::read(path)?;
    let corrupt = |why: String| corrupt_in(path, why);
    let (header, used) = decode_header(path, &bytes, kind)?;

    let payload = &bytes[used..];
    if payload.len() as u64 != header.payload_len {
        return Err(corrupt(format!(
            "truncated payload ({} of {} bytes)",
            payload.len(),
            header.payload_len
        )));
    }
    if blake3::hash(payload).as_bytes() != &header.checksum {
        return Err(corrupt("checksum mismatch".into()));
    }

    let (value, _): (T, usize) = bincode::serde::decode_from_slice(payload, config::standard())
        .map_err(|e| corrupt(format!("undecodable payload ({e})")))?;
    Ok((header, value))
}

fn stage(dir: &Path, bytes: &[u8]) -> Result<NamedTempFile> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    Ok(tmp)
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    fs::File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

/// Write `index` and `mapping` as one snapshot pair and return its tag.
///
/// The caller must hold whatever lock keeps the two structures consistent for the
/// duration of the call, and the [`lock`] if other processes share the files.
///
/// # Errors
/// - [`MemoryError::MappingOutOfOrder`] if the two structures disagree on their count;
///   nothing is written in that case.
/// - [`MemoryError::Io`] / [`MemoryError::SnapshotEncode`] on write failures. Files that
///   were already in place are left untouched unless both renames succeeded.
pub fn save(paths: &SnapshotPaths, index: &VectorIndex, mapping: &IdMapping) -> Result<SnapshotTag> {
    if index.count() != mapping.len() {
        return Err(MemoryError::MappingOutOfOrder {
            expected: index.count(),
            actual: mapping.len(),
        });
    }

    let vector_payload = bincode::serde::encode_to_vec(index, config::standard())?;
    let mapping_payload = bincode::serde::encode_to_vec(mapping, config::standard())?;
    let pair = *blake3::hash(&vector_payload).as_bytes();

    let vector_file = encode_file(SnapshotKind::Vectors, index.count(), pair, &vector_payload)?;
    let mapping_file = encode_file(SnapshotKind::Mapping, mapping.len(), pair, &mapping_payload)?;

    let vectors_dir = parent_dir(&paths.vectors);
    let mapping_dir = parent_dir(&paths.mapping);
    fs::create_dir_all(vectors_dir)?;
    fs::create_dir_all(mapping_dir)?;

    let staged_vectors = stage(vectors_dir, &vector_file)?;
    let staged_mapping = stage(mapping_dir, &mapping_file)?;

    staged_vectors
        .persist(&paths.vectors)
        .map_err(|e| MemoryError::Io(e.error))?;
    staged_mapping
        .persist(&paths.mapping)
        .map_err(|e| MemoryError::Io(e.error))?;

    sync_dir(vectors_dir)?;
    if mapping_dir != vectors_dir {
        sync_dir(mapping_dir)?;
    }

    info!(
        "Saved snapshot with {} vectors to {}",
        index.count(),
        paths.vectors.display()
    );
    Ok(pair)
}

/// Load a snapshot pair.
///
/// Returns `Ok(None)` when neither file exists (fresh install).
///
/// # Errors
/// [`MemoryError::SnapshotCorrupt`] when only one file exists, or either file fails its
/// header, checksum, pair or count checks. Nothing is repaired or truncated here.
pub fn load(paths: &SnapshotPaths) -> Result<Option<Snapshot>> {
    match (paths.vectors.exists(), paths.mapping.exists()) {
        (false, false) => {
            debug!("No snapshot at {}", paths.vectors.display());
            return Ok(None);
        }
        (true, false) => {
            return Err(MemoryError::SnapshotCorrupt(format!(
                "{} exists but {} is missing",
                paths.vectors.display(),
                paths.mapping.display()
            )));
        }
        (false, true) => {
            return Err(MemoryError::SnapshotCorrupt(format!(
                "{} exists but {} is missing",
                paths.mapping.display(),
                paths.vectors.display()
            )));
        }
        (true, true) => {}
    }

    let (vector_header, index): (Header, VectorIndex) =
        read_file(&paths.vectors, SnapshotKind::Vectors)?;
    let (mapping_header, mapping): (Header, IdMapping) =
        read_file(&paths.mapping, SnapshotKind::Mapping)?;

    if vector_header.count != mapping_header.count {
        return Err(MemoryError::SnapshotCorrupt(format!(
            "vector index holds {} entries but id mapping holds {}",
            vector_header.count, mapping_header.count
        )));
    }
    if vector_header.pair != mapping_header.pair {
        return Err(MemoryError::SnapshotCorrupt(
            "vector index and id mapping come from different checkpoints".into(),
        ));
    }

    index.check_integrity()?;
    if index.count() as u64 != vector_header.count || mapping.len() as u64 != mapping_header.count
    {
        return Err(MemoryError::SnapshotCorrupt(
            "snapshot payload disagrees with its header count".into(),
        ));
    }

    info!(
        "Loaded snapshot with {} vectors from {}",
        index.count(),
        paths.vectors.display()
    );
    Ok(Some(Snapshot {
        index,
        mapping,
        tag: vector_header.pair,
    }))
}

/// Tag of the snapshot currently on disk, read from the vector file header alone.
///
/// Returns `Ok(None)` when there is no vector file. The payload is not verified here;
/// [`load`] does that.
pub fn current_tag(paths: &SnapshotPaths) -> Result<Option<SnapshotTag>> {
    let file = match fs::File::open(&paths.vectors) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut bytes = Vec::new();
    file.take(HEADER_READ_LIMIT).read_to_end(&mut bytes)?;
    let (header, _) = decode_header(&paths.vectors, &bytes, SnapshotKind::Vectors)?;
    Ok(Some(header.pair))
}

fn corrupt_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".corrupt");
    let first = PathBuf::from(&name);
    if !first.exists() {
        return first;
    }
    (1u32..)
        .map(|n| {
            let mut numbered = name.clone();
            numbered.push(format!(".{n}"));
            PathBuf::from(numbered)
        })
        .find(|candidate| !candidate.exists())
        .unwrap_or(first)
}

/// Move an unusable snapshot pair aside to `<file>.corrupt` so a fresh one can be
/// written without destroying the evidence. Earlier quarantined files are kept; later
/// ones get `.corrupt.1`, `.corrupt.2`, and so on.
pub fn quarantine(paths: &SnapshotPaths) -> Result<()> {
    if !paths.any_exists() {
        return Ok(());
    }
    for path in [&paths.vectors, &paths.mapping] {
        if path.exists() {
            let target = corrupt_path(path);
            fs::rename(path, &target)?;
            warn!("Moved {} to {}", path.display(), target.display());
        }
    }
    Ok(())
}
