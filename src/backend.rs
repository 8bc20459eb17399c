//! # MemoryBackend
//!
//! The coordinator callers talk to. It owns the [`RecordStore`] and the
//! [`VectorIndex`] + [`IdMapping`] pair, sequences writes across them, and merges their
//! answers for semantic search.
//!
//! ## Write path
//! 1. Validate the embedding length.
//! 2. Insert the record (durable on return).
//! 3. Under the index lock: append the vector, map its position to the record id.
//!
//! The record is written first, so a crash between steps 2 and 3 leaves a record that
//! similarity search cannot find but owner/session queries still see. The opposite (a
//! vector pointing at no record) is never produced by this path.
//!
//! ## Search path
//! 1. Under the index lock: nearest `search_overfetch × top_k` positions, resolved to
//!    record ids.
//! 2. Without the lock: fetch those records for the calling owner and keep them in
//!    ascending distance order, dropping other owners' records and deleted ones.
//! 3. If fewer than `top_k` survive and the pass did not cover the whole index, double
//!    the candidate count and repeat.
//!
//! ## Locking
//! One [`Mutex`] guards the index pair. It is never held across a record store call and
//! never taken recursively. Record store concurrency is left to SQLite (WAL mode).
//!
//! ## Persistence
//! The index pair is loaded from its snapshot at [`MemoryBackend::open`] and written by
//! [`MemoryBackend::checkpoint`] / [`MemoryBackend::close`]. The record store is never
//! used to rebuild the index implicitly.
//!
//! Several processes may share one database. Each backend remembers the tag of the
//! snapshot it last loaded or saved. A checkpoint holds the snapshot file lock; if the
//! tag on disk has moved on, the vectors this backend appended since its own base are
//! replayed on top of the newer snapshot before it is written, so no process erases
//! another's checkpoint. A checkpoint with nothing new to write leaves the files alone.
//!
//! ## Quick Example
//! ```no_run
//! use powermem::backend::MemoryBackend;
//! use powermem::config::BackendConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = MemoryBackend::open(BackendConfig::new("powermem.db").with_dimension(3))?;
//! backend.store_memory("u1", "s1", "the sky is clear", &[1.0, 0.0, 0.0], None)?;
//! for hit in backend.search_memory("u1", &[1.0, 0.1, 0.0], 5)? {
//!     println!("{} ({:.3})", hit.text, hit.similarity);
//! }
//! backend.close()?;
//! # Ok(()) }
//! ```

use std::collections::HashMap;
use std::fs;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::config::{BackendConfig, SnapshotRecovery};
use crate::error::{MemoryError, Result};
use crate::id_mapping::IdMapping;
use crate::models::{BackendStats, MemoryRecord, RecordId, SearchHit};
use crate::record_store::RecordStore;
use crate::snapshot::{self, SnapshotPaths, SnapshotTag};
use crate::vector_store::VectorIndex;

/// The two co-versioned structures behind the index lock.
#[derive(Debug)]
struct IndexState {
    vectors: VectorIndex,
    ids: IdMapping,
    // Snapshot these entries were loaded from or last saved as.
    base: Option<SnapshotTag>,
    // Entries `0..saved` are in `base`; the rest exist only in memory.
    saved: usize,
}

impl IndexState {
    fn empty(dimension: usize) -> Result<Self> {
        Ok(Self {
            vectors: VectorIndex::new(dimension)?,
            ids: IdMapping::new(),
            base: None,
            saved: 0,
        })
    }

    fn from_snapshot(snapshot: snapshot::Snapshot, dimension: usize) -> Result<Self> {
        if snapshot.index.dimension() != dimension {
            return Err(MemoryError::DimensionMismatch {
                expected: dimension,
                actual: snapshot.index.dimension(),
            });
        }
        let saved = snapshot.index.count();
        Ok(Self {
            vectors: snapshot.index,
            ids: snapshot.mapping,
            base: Some(snapshot.tag),
            saved,
        })
    }

    fn unsaved(&self) -> usize {
        self.vectors.count() - self.saved
    }

    /// Replace `self` with `onto` plus every entry appended since `self.saved`.
    fn rebase(&mut self, onto: IndexState) -> Result<usize> {
        let mut merged = onto;
        for position in self.saved..self.vectors.count() {
            let (Some(vector), Some(record_id)) =
                (self.vectors.get(position), self.ids.get(position))
            else {
                return Err(MemoryError::MappingOutOfOrder {
                    expected: self.vectors.count(),
                    actual: self.ids.len(),
                });
            };
            merged.append(vector, record_id)?;
        }
        let replayed = self.unsaved();
        *self = merged;
        Ok(replayed)
    }

    /// Append a vector and its mapping entry, or neither.
    fn append(&mut self, embedding: &[f32], record_id: RecordId) -> Result<usize> {
        let position = self.vectors.count();
        if self.ids.len() != position {
            return Err(MemoryError::MappingOutOfOrder {
                expected: position,
                actual: self.ids.len(),
            });
        }
        self.vectors.add(embedding)?;
        self.ids.put(position, record_id)?;
        Ok(position)
    }
}

/// Dual-store memory backend.
///
/// Construct one per process with [`MemoryBackend::open`], share it by reference (it is
/// `Sync`), and tear it down with [`MemoryBackend::close`].
#[derive(Debug)]
pub struct MemoryBackend {
    config: BackendConfig,
    records: RecordStore,
    paths: SnapshotPaths,
    index: Mutex<IndexState>,
}

impl MemoryBackend {
    /// Open the record store and load the index snapshot.
    ///
    /// # Behavior
    /// - No snapshot files: the index starts empty.
    /// - Valid snapshot pair: loaded as is.
    /// - Unusable pair: with [`SnapshotRecovery::Fail`] the error is returned; with
    ///   [`SnapshotRecovery::StartEmpty`] the files are moved aside, a warning is logged
    ///   and the index starts empty.
    ///
    /// # Errors
    /// - [`MemoryError::InvalidConfig`] for a config that fails validation.
    /// - [`MemoryError::StorageFault`] if the record store cannot be opened.
    /// - [`MemoryError::SnapshotCorrupt`] per the recovery policy above.
    /// - [`MemoryError::DimensionMismatch`] if the snapshot was written for another
    ///   dimension.
    pub fn open(config: BackendConfig) -> Result<Self> {
        config.validate()?;
        if let Some(dir) = config.db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }

        let records = RecordStore::open(&config.db_path, config.busy_timeout())?;
        let paths = config.snapshot_paths();
        let state = {
            let _guard = snapshot::lock(&paths)?;
            Self::load_index(&config, &paths)?
        };

        info!(
            "Memory backend open at {} ({} vectors, dimension {})",
            config.db_path.display(),
            state.vectors.count(),
            state.vectors.dimension()
        );

        Ok(Self {
            config,
            records,
            paths,
            index: Mutex::new(state),
        })
    }

    fn load_index(config: &BackendConfig, paths: &SnapshotPaths) -> Result<IndexState> {
        match snapshot::load(paths) {
            Ok(Some(loaded)) => IndexState::from_snapshot(loaded, config.dimension),
            Ok(None) => {
                info!("No snapshot found, starting with an empty vector index");
                IndexState::empty(config.dimension)
            }
            Err(MemoryError::SnapshotCorrupt(reason))
                if config.snapshot_recovery == SnapshotRecovery::StartEmpty =>
            {
                warn!(
                    "Snapshot unusable ({}); quarantining it and starting with an empty vector index",
                    reason
                );
                snapshot::quarantine(paths)?;
                IndexState::empty(config.dimension)
            }
            Err(err) => {
                error!("Refusing to open memory backend: {}", err);
                Err(err)
            }
        }
    }

    fn lock_index(&self) -> Result<MutexGuard<'_, IndexState>> {
        self.index.lock().map_err(|_| MemoryError::LockPoisoned)
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.config.dimension {
            return Err(MemoryError::DimensionMismatch {
                expected: self.config.dimension,
                actual: vector.len(),
            });
        }
        Ok(())
    }

    /// Active configuration.
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Embedding length every call must use.
    pub fn dimension(&self) -> usize {
        self.config.dimension
    }

    /// Store one memory and make it searchable.
    ///
    /// # Parameters
    /// - `owner_id`, `session_id`: non-empty opaque identifiers.
    /// - `text`: memory content.
    /// - `embedding`: vector of exactly [`MemoryBackend::dimension`] values.
    /// - `metadata`: optional opaque blob stored with the record.
    ///
    /// # Returns
    /// The new record id.
    ///
    /// # Errors
    /// - [`MemoryError::EmptyIdentifier`] / [`MemoryError::DimensionMismatch`]: nothing was
    ///   written.
    /// - [`MemoryError::StorageFault`]: the record insert failed; nothing was written.
    /// - [`MemoryError::LockPoisoned`]: the record exists but has no vector.
    pub fn store_memory(
        &self,
        owner_id: &str,
        session_id: &str,
        text: &str,
        embedding: &[f32],
        metadata: Option<&[u8]>,
    ) -> Result<RecordId> {
        if owner_id.is_empty() {
            return Err(MemoryError::EmptyIdentifier("owner_id"));
        }
        if session_id.is_empty() {
            return Err(MemoryError::EmptyIdentifier("session_id"));
        }
        self.check_dimension(embedding)?;

        let record_id = self
            .records
            .insert(owner_id, session_id, text, embedding.len(), metadata)?;

        let position = {
            let mut state = self.lock_index().inspect_err(|_| {
                error!("Record {} stored without a vector: index lock poisoned", record_id)
            })?;
            state.append(embedding, record_id)?
        };

        debug!("Stored record {} at index position {}", record_id, position);
        Ok(record_id)
    }

    /// Semantic search over `owner_id`'s memories.
    ///
    /// Results are ordered nearest first and hold at most `top_k` entries. Fewer (possibly
    /// zero) are returned only when fewer of the owner's records have vectors; running
    /// out of matches is not an error.
    ///
    /// # Errors
    /// - [`MemoryError::DimensionMismatch`] if `query_embedding` has the wrong length.
    /// - [`MemoryError::StorageFault`] if the record lookup fails.
    pub fn search_memory(
        &self,
        owner_id: &str,
        query_embedding: &[f32],
        top_k: usize,
    ) -> Result<Vec<SearchHit>> {
        self.check_dimension(query_embedding)?;
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let mut fetch = top_k.saturating_mul(self.config.search_overfetch);
        let mut resolved: HashMap<RecordId, Option<MemoryRecord>> = HashMap::new();

        loop {
            let (candidates, covered_all) = {
                let state = self.lock_index()?;
                let total = state.vectors.count();
                let k = fetch.min(total);
                let candidates: Vec<(Option<RecordId>, f32)> = state
                    .vectors
                    .search(query_embedding, k)?
                    .into_iter()
                    .map(|n| (state.ids.get(n.position), n.distance))
                    .collect();
                (candidates, k == total)
            };

            let unresolved: Vec<RecordId> = candidates
                .iter()
                .filter_map(|(id, _)| *id)
                .filter(|id| !resolved.contains_key(id))
                .collect();
            let mut found = self.records.fetch_many(&unresolved, owner_id)?;
            for id in unresolved {
                let record = found.remove(&id);
                resolved.insert(id, record);
            }

            let hits: Vec<SearchHit> = candidates
                .iter()
                .filter_map(|&(id, distance)| {
                    let record = resolved.get(&id?)?.as_ref()?;
                    Some(SearchHit {
                        record_id: record.id,
                        text: record.text.clone(),
                        session_id: record.session_id.clone(),
                        similarity: SearchHit::similarity_from_distance(distance),
                    })
                })
                .take(top_k)
                .collect();

            debug!(
                "Search for {}: {} candidates, {} hits",
                owner_id,
                candidates.len(),
                hits.len()
            );

            if hits.len() >= top_k || covered_all {
                return Ok(hits);
            }
            fetch = fetch.saturating_mul(2);
        }
    }

    /// Delete every record in `session_id`; returns how many were removed.
    ///
    /// Only the record store is touched. The session's vectors stay in the index and are
    /// filtered out of search results because their records no longer resolve.
    pub fn delete_session(&self, session_id: &str) -> Result<usize> {
        self.records.delete_by_session(session_id)
    }

    /// Owner's record counters plus the global index size.
    pub fn stats(&self, owner_id: &str) -> Result<BackendStats> {
        let records = self.records.stats(owner_id)?;
        let index_size = self.index_size()?;
        Ok(BackendStats {
            record_count: records.record_count,
            distinct_session_count: records.distinct_session_count,
            index_size: index_size as u64,
        })
    }

    /// Number of vectors in the index, including orphaned ones.
    pub fn index_size(&self) -> Result<usize> {
        Ok(self.lock_index()?.vectors.count())
    }

    /// Record id mapped to index `position`.
    pub fn record_at(&self, position: usize) -> Result<Option<RecordId>> {
        Ok(self.lock_index()?.ids.get(position))
    }

    /// One of `owner_id`'s records by id.
    pub fn get_memory(&self, owner_id: &str, record_id: RecordId) -> Result<Option<MemoryRecord>> {
        self.records.fetch(record_id, owner_id)
    }

    /// `owner_id`'s most recent records, newest first.
    pub fn list_memories(&self, owner_id: &str, limit: usize) -> Result<Vec<MemoryRecord>> {
        self.records.list(owner_id, limit)
    }

    /// Write the index pair to its snapshot files.
    ///
    /// If another backend saved since this one loaded, its snapshot is read back and this
    /// backend's unsaved vectors are appended after it, so both survive. Nothing is
    /// written when the files on disk already hold this backend's index.
    ///
    /// # Errors
    /// - [`MemoryError::SnapshotCorrupt`] / [`MemoryError::DimensionMismatch`] if the
    ///   newer snapshot on disk cannot be merged; the files are left as they are.
    /// - [`MemoryError::Io`] / [`MemoryError::SnapshotEncode`] on write failures.
    pub fn checkpoint(&self) -> Result<()> {
        let _guard = snapshot::lock(&self.paths)?;
        let mut state = self.lock_index()?;
        let on_disk = snapshot::current_tag(&self.paths)?;

        if on_disk != state.base {
            match snapshot::load(&self.paths)? {
                Some(newer) => {
                    let onto = IndexState::from_snapshot(newer, self.config.dimension)?;
                    let replayed = state.rebase(onto)?;
                    warn!(
                        "Snapshot at {} changed since it was loaded; appended {} unsaved vectors to its {} entries",
                        self.paths.vectors.display(),
                        replayed,
                        state.vectors.count() - replayed
                    );
                }
                None => warn!(
                    "Snapshot at {} disappeared since it was loaded; writing the full index",
                    self.paths.vectors.display()
                ),
            }
        } else if on_disk.is_some() && state.unsaved() == 0 {
            debug!("Snapshot at {} already current", self.paths.vectors.display());
            return Ok(());
        }

        let tag = snapshot::save(&self.paths, &state.vectors, &state.ids)?;
        state.base = Some(tag);
        state.saved = state.vectors.count();
        Ok(())
    }

    /// Checkpoint and release the backend.
    ///
    /// Dropping a backend without calling this leaves the snapshot files untouched.
    pub fn close(self) -> Result<()> {
        self.checkpoint()?;
        info!("Memory backend at {} closed", self.config.db_path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    const DIM: usize = 4;

    fn config_in(dir: &Path) -> BackendConfig {
        BackendConfig::new(dir.join("powermem.db")).with_dimension(DIM)
    }

    fn open_in(dir: &TempDir) -> MemoryBackend {
        MemoryBackend::open(config_in(dir.path())).unwrap()
    }

    fn v(values: [f32; DIM]) -> Vec<f32> {
        values.to_vec()
    }

    #[test]
    fn scenario_a_nearest_records_first() {
        let dir = TempDir::new().unwrap();
        let backend = open_in(&dir);
        let first = backend
            .store_memory("u1", "s1", "first", &v([1.0, 0.0, 0.0, 0.0]), None)
            .unwrap();
        backend
            .store_memory("u1", "s1", "second", &v([0.0, 1.0, 0.0, 0.0]), None)
            .unwrap();
        let third = backend
            .store_memory("u1", "s1", "third", &v([1.0, 1.0, 0.0, 0.0]), None)
            .unwrap();

        let hits = backend
            .search_memory("u1", &v([1.0, 0.0, 0.0, 0.0]), 2)
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].record_id, first);
        assert_eq!(hits[0].text, "first");
        assert_eq!(hits[0].session_id, "s1");
        assert_eq!(hits[0].similarity, 1.0);
        assert_eq!(hits[1].record_id, third);
        assert_eq!(hits[1].similarity, 0.5);
    }

    #[test]
    fn scenario_b_other_owner_sees_nothing() {
        let dir = TempDir::new().unwrap();
        let backend = open_in(&dir);
        let e = v([0.3, 0.1, 0.9, 0.2]);
        backend.store_memory("u1", "s1", "mine", &e, None).unwrap();

        assert!(backend.search_memory("u2", &e, 5).unwrap().is_empty());
    }

    #[test]
    fn scenario_c_delete_session_leaves_vectors() {
        let dir = TempDir::new().unwrap();
        let backend = open_in(&dir);
        backend
            .store_memory("owner", "s1", "a", &v([1.0, 0.0, 0.0, 0.0]), None)
            .unwrap();
        backend
            .store_memory("owner", "s1", "b", &v([0.0, 1.0, 0.0, 0.0]), None)
            .unwrap();
        backend
            .store_memory("owner", "s2", "c", &v([0.0, 0.0, 1.0, 0.0]), None)
            .unwrap();

        let before = backend.stats("owner").unwrap();
        assert_eq!(before.record_count, 3);
        assert_eq!(before.distinct_session_count, 2);
        assert_eq!(before.index_size, 3);

        assert_eq!(backend.delete_session("s1").unwrap(), 2);

        let after = backend.stats("owner").unwrap();
        assert_eq!(after.record_count, before.record_count - 2);
        assert_eq!(after.distinct_session_count, 1);
        assert_eq!(after.index_size, 3);

        let hits = backend
            .search_memory("owner", &v([1.0, 0.0, 0.0, 0.0]), 3)
            .unwrap();
        let texts: Vec<&str> = hits.iter().map(|h| h.text.as_str()).collect();
        assert_eq!(texts, vec!["c"]);
    }

    #[test]
    fn delete_unknown_session_is_zero() {
        let dir = TempDir::new().unwrap();
        let backend = open_in(&dir);
        assert_eq!(backend.delete_session("nope").unwrap(), 0);
    }

    #[test]
    fn results_are_ordered_by_distance() {
        let dir = TempDir::new().unwrap();
        let backend = open_in(&dir);
        for i in 0..30 {
            let x = i as f32;
            backend
                .store_memory("u1", "s1", &format!("m{i}"), &v([x, -x, x * 0.5, 1.0]), None)
                .unwrap();
        }
        let hits = backend
            .search_memory("u1", &v([12.3, -12.0, 6.0, 1.0]), 10)
            .unwrap();
        assert_eq!(hits.len(), 10);
        assert!(hits.windows(2).all(|w| w[0].similarity >= w[1].similarity));
        assert_eq!(hits[0].text, "m12");
    }

    #[test]
    fn positions_are_append_only() {
        let dir = TempDir::new().unwrap();
        let backend = open_in(&dir);
        let mut ids = Vec::new();
        for i in 0..3 {
            ids.push(
                backend
                    .store_memory("u1", "early", &format!("e{i}"), &v([i as f32, 0.0, 0.0, 0.0]), None)
                    .unwrap(),
            );
        }
        backend.delete_session("early").unwrap();
        for i in 0..2 {
            ids.push(
                backend
                    .store_memory("u1", "late", &format!("l{i}"), &v([0.0, i as f32, 0.0, 0.0]), None)
                    .unwrap(),
            );
        }

        assert_eq!(backend.index_size().unwrap(), 5);
        for (position, id) in ids.iter().enumerate() {
            assert_eq!(backend.record_at(position).unwrap(), Some(*id));
        }
        assert_eq!(backend.record_at(5).unwrap(), None);
    }

    #[test]
    fn wrong_dimension_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let backend = open_in(&dir);
        backend
            .store_memory("u1", "s1", "ok", &v([1.0, 0.0, 0.0, 0.0]), None)
            .unwrap();

        let err = backend
            .store_memory("u1", "s1", "bad", &[1.0, 0.0], None)
            .unwrap_err();
        assert!(matches!(
            err,
            MemoryError::DimensionMismatch {
                expected: DIM,
                actual: 2
            }
        ));

        let stats = backend.stats("u1").unwrap();
        assert_eq!(stats.record_count, 1);
        assert_eq!(stats.index_size, 1);

        assert!(matches!(
            backend.search_memory("u1", &[0.0; DIM + 1], 1),
            Err(MemoryError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn empty_identifiers_are_rejected() {
        let dir = TempDir::new().unwrap();
        let backend = open_in(&dir);
        let e = v([0.0; DIM]);
        assert!(matches!(
            backend.store_memory("", "s1", "t", &e, None),
            Err(MemoryError::EmptyIdentifier("owner_id"))
        ));
        assert!(matches!(
            backend.store_memory("u1", "", "t", &e, None),
            Err(MemoryError::EmptyIdentifier("session_id"))
        ));
        assert_eq!(backend.index_size().unwrap(), 0);
    }

    #[test]
    fn top_k_bounds_results() {
        let dir = TempDir::new().unwrap();
        let backend = open_in(&dir);
        for i in 0..5 {
            backend
                .store_memory("u1", "s1", &format!("m{i}"), &v([i as f32, 0.0, 0.0, 0.0]), None)
                .unwrap();
        }
        let q = v([0.0; DIM]);
        assert_eq!(backend.search_memory("u1", &q, 3).unwrap().len(), 3);
        assert_eq!(backend.search_memory("u1", &q, 50).unwrap().len(), 5);
        assert!(backend.search_memory("u1", &q, 0).unwrap().is_empty());
    }

    #[test]
    fn crowded_index_still_fills_top_k() {
        let dir = TempDir::new().unwrap();
        let backend = open_in(&dir);
        // Twenty of u2's vectors sit closer to the query than any of u1's.
        for i in 0..20 {
            backend
                .store_memory("u2", "s2", &format!("near{i}"), &v([0.0, 0.0, 0.0, i as f32 * 0.01]), None)
                .unwrap();
        }
        for i in 0..3 {
            backend
                .store_memory("u1", "s1", &format!("far{i}"), &v([10.0 + i as f32, 0.0, 0.0, 0.0]), None)
                .unwrap();
        }

        let hits = backend.search_memory("u1", &v([0.0; DIM]), 2).unwrap();
        let texts: Vec<&str> = hits.iter().map(|h| h.text.as_str()).collect();
        assert_eq!(texts, vec!["far0", "far1"]);
    }

    #[test]
    fn empty_index_search_is_empty() {
        let dir = TempDir::new().unwrap();
        let backend = open_in(&dir);
        assert!(backend.search_memory("u1", &v([0.0; DIM]), 5).unwrap().is_empty());
    }

    #[test]
    fn close_then_reopen_restores_index() {
        let dir = TempDir::new().unwrap();
        let query = v([0.9, 0.1, 0.0, 0.0]);
        let (ids, expected) = {
            let backend = open_in(&dir);
            let a = backend
                .store_memory("u1", "s1", "a", &v([1.0, 0.0, 0.0, 0.0]), Some(b"meta"))
                .unwrap();
            let b = backend
                .store_memory("u1", "s1", "b", &v([0.0, 1.0, 0.0, 0.0]), None)
                .unwrap();
            let hits = backend.search_memory("u1", &query, 2).unwrap();
            backend.close().unwrap();
            (vec![a, b], hits)
        };

        let backend = open_in(&dir);
        assert_eq!(backend.index_size().unwrap(), 2);
        assert_eq!(backend.record_at(0).unwrap(), Some(ids[0]));
        assert_eq!(backend.record_at(1).unwrap(), Some(ids[1]));
        assert_eq!(backend.search_memory("u1", &query, 2).unwrap(), expected);
        let a = backend.get_memory("u1", ids[0]).unwrap().unwrap();
        assert_eq!(a.metadata.as_deref(), Some(&b"meta"[..]));
    }

    #[test]
    fn records_without_checkpoint_are_not_searchable_after_restart() {
        let dir = TempDir::new().unwrap();
        let id = {
            let backend = open_in(&dir);
            backend
                .store_memory("u1", "s1", "unsaved", &v([1.0, 0.0, 0.0, 0.0]), None)
                .unwrap()
        };

        let backend = open_in(&dir);
        assert_eq!(backend.index_size().unwrap(), 0);
        assert!(backend.get_memory("u1", id).unwrap().is_some());
        assert!(backend
            .search_memory("u1", &v([1.0, 0.0, 0.0, 0.0]), 1)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn corrupt_snapshot_fails_by_default() {
        let dir = TempDir::new().unwrap();
        let config = config_in(dir.path());
        let paths = config.snapshot_paths();
        fs::write(&paths.vectors, b"junk").unwrap();

        let err = MemoryBackend::open(config).unwrap_err();
        assert!(matches!(err, MemoryError::SnapshotCorrupt(_)));
        assert!(paths.vectors.exists());
    }

    #[test]
    fn corrupt_snapshot_can_start_empty() {
        let dir = TempDir::new().unwrap();
        let id = {
            let backend = open_in(&dir);
            let id = backend
                .store_memory("u1", "s1", "kept", &v([1.0, 0.0, 0.0, 0.0]), None)
                .unwrap();
            backend.close().unwrap();
            id
        };
        let config = config_in(dir.path()).with_snapshot_recovery(SnapshotRecovery::StartEmpty);
        let paths = config.snapshot_paths();
        fs::remove_file(&paths.mapping).unwrap();

        let backend = MemoryBackend::open(config).unwrap();
        assert_eq!(backend.index_size().unwrap(), 0);
        assert!(!paths.vectors.exists());
        assert!(dir.path().join("powermem.vector_index.corrupt").exists());
        assert!(backend.get_memory("u1", id).unwrap().is_some());
    }

    #[test]
    fn snapshot_for_other_dimension_is_rejected() {
        let dir = TempDir::new().unwrap();
        open_in(&dir).close().unwrap();

        let config = config_in(dir.path()).with_dimension(DIM + 1);
        assert!(matches!(
            MemoryBackend::open(config),
            Err(MemoryError::DimensionMismatch {
                expected: 5,
                actual: 4
            })
        ));
    }

    #[test]
    fn stale_reader_does_not_erase_a_newer_checkpoint() {
        let dir = TempDir::new().unwrap();
        let e = v([0.5, 0.5, 0.0, 0.0]);
        let reader = open_in(&dir);

        let writer = open_in(&dir);
        let id = writer.store_memory("u1", "s1", "late", &e, None).unwrap();
        writer.close().unwrap();

        assert_eq!(reader.stats("u1").unwrap().record_count, 1);
        reader.close().unwrap();

        let backend = open_in(&dir);
        assert_eq!(backend.index_size().unwrap(), 1);
        let hits = backend.search_memory("u1", &e, 1).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record_id, id);
    }

    #[test]
    fn concurrent_backends_merge_their_checkpoints() {
        let dir = TempDir::new().unwrap();
        let first = open_in(&dir);
        let second = open_in(&dir);

        let a = first
            .store_memory("u1", "s1", "from first", &v([1.0, 0.0, 0.0, 0.0]), None)
            .unwrap();
        let b = second
            .store_memory("u1", "s2", "from second", &v([0.0, 1.0, 0.0, 0.0]), None)
            .unwrap();
        first.close().unwrap();
        second.checkpoint().unwrap();
        assert_eq!(second.index_size().unwrap(), 2);
        let c = second
            .store_memory("u1", "s2", "after merge", &v([0.0, 0.0, 1.0, 0.0]), None)
            .unwrap();
        second.close().unwrap();

        let backend = open_in(&dir);
        assert_eq!(backend.index_size().unwrap(), 3);
        let mut mapped: Vec<RecordId> = (0..3)
            .map(|p| backend.record_at(p).unwrap().unwrap())
            .collect();
        mapped.sort();
        assert_eq!(mapped, vec![a, b, c]);
        let hits = backend.search_memory("u1", &v([0.0, 1.0, 0.0, 0.0]), 1).unwrap();
        assert_eq!(hits[0].record_id, b);
    }

    #[test]
    fn clean_checkpoint_leaves_files_alone() {
        let dir = TempDir::new().unwrap();
        let backend = open_in(&dir);
        backend
            .store_memory("u1", "s1", "a", &v([1.0, 0.0, 0.0, 0.0]), None)
            .unwrap();
        backend.checkpoint().unwrap();

        let paths = config_in(dir.path()).snapshot_paths();
        let saved = fs::read(&paths.vectors).unwrap();
        fs::write(&paths.mapping, b"replaced").unwrap();
        // The tag in the vector file still matches, so nothing is rewritten.
        backend.checkpoint().unwrap();
        assert_eq!(fs::read(&paths.vectors).unwrap(), saved);
        assert_eq!(fs::read(&paths.mapping).unwrap(), b"replaced");
    }

    #[test]
    fn checkpoint_after_snapshot_removal_keeps_every_vector() {
        let dir = TempDir::new().unwrap();
        let backend = open_in(&dir);
        backend
            .store_memory("u1", "s1", "a", &v([1.0, 0.0, 0.0, 0.0]), None)
            .unwrap();
        backend.checkpoint().unwrap();
        let paths = config_in(dir.path()).snapshot_paths();
        fs::remove_file(&paths.vectors).unwrap();
        fs::remove_file(&paths.mapping).unwrap();

        backend
            .store_memory("u1", "s1", "b", &v([0.0, 1.0, 0.0, 0.0]), None)
            .unwrap();
        backend.close().unwrap();
        assert_eq!(open_in(&dir).index_size().unwrap(), 2);
    }

    #[test]
    fn dropped_backend_writes_no_snapshot() {
        let dir = TempDir::new().unwrap();
        let backend = open_in(&dir);
        backend
            .store_memory("u1", "s1", "a", &v([1.0, 0.0, 0.0, 0.0]), None)
            .unwrap();
        drop(backend);
        let paths = config_in(dir.path()).snapshot_paths();
        assert!(!paths.vectors.exists());
        assert!(!paths.mapping.exists());
    }

    #[test]
    fn search_resolves_candidates_across_many_fetch_chunks() {
        let dir = TempDir::new().unwrap();
        let mut backend = open_in(&dir);
        backend.records = backend.records.clone().with_fetch_chunk(3);
        for i in 0..40 {
            backend
                .store_memory("crowd", "s", &format!("c{i}"), &v([0.0, 0.0, 0.0, i as f32 * 0.01]), None)
                .unwrap();
        }
        let mine = backend
            .store_memory("u1", "s1", "mine", &v([9.0, 0.0, 0.0, 0.0]), None)
            .unwrap();

        let hits = backend.search_memory("u1", &v([0.0; DIM]), 5).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record_id, mine);
    }

    #[test]
    fn list_memories_is_newest_first() {
        let dir = TempDir::new().unwrap();
        let backend = open_in(&dir);
        backend.store_memory("u1", "s1", "old", &v([0.0; DIM]), None).unwrap();
        backend.store_memory("u1", "s1", "new", &v([0.0; DIM]), None).unwrap();
        let texts: Vec<String> = backend
            .list_memories("u1", 10)
            .unwrap()
            .into_iter()
            .map(|r| r.text)
            .collect();
        assert_eq!(texts, vec!["new", "old"]);
    }

    #[test]
    fn concurrent_writers_and_readers_keep_mapping_dense() {
        let dir = TempDir::new().unwrap();
        let backend = open_in(&dir);
        let threads = 4;
        let per_thread = 25;

        std::thread::scope(|scope| {
            for t in 0..threads {
                let backend = &backend;
                scope.spawn(move || {
                    let owner = format!("owner{t}");
                    for i in 0..per_thread {
                        let e = v([t as f32, i as f32, 0.0, 1.0]);
                        backend
                            .store_memory(&owner, "s", &format!("{t}-{i}"), &e, None)
                            .unwrap();
                        let hits = backend.search_memory(&owner, &e, 3).unwrap();
                        assert!(!hits.is_empty());
                        assert!(hits.len() <= 3);
                    }
                });
            }
        });

        let total = threads * per_thread;
        assert_eq!(backend.index_size().unwrap(), total);
        let mut seen = std::collections::HashSet::new();
        for position in 0..total {
            let id = backend.record_at(position).unwrap().expect("dense mapping");
            assert!(seen.insert(id));
        }
        for t in 0..threads {
            let stats = backend.stats(&format!("owner{t}")).unwrap();
            assert_eq!(stats.record_count, per_thread as u64);
        }
    }
}
