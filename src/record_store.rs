//! # Record store
//!
//! Durable table of memories, backed by SQLite through Diesel. This is the source of
//! truth for record content and existence; the vector index only ever points into it.
//!
//! ## Connection model
//! A fresh [`SqliteConnection`] is opened per operation, the same way the CLI's other
//! database helpers work. The database runs in WAL mode, so one writer can commit while
//! other connections keep reading. There is no lock at this layer: concurrent callers
//! are arbitrated by SQLite itself, with a busy timeout so a second writer waits instead
//! of failing immediately.
//!
//! ## Durability
//! Every insert and delete is an autocommit statement with `synchronous = FULL`, so it is
//! on disk when the call returns.

use chrono::Utc;
use diesel::connection::SimpleConnection;
use diesel::dsl::count_distinct;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{MemoryError, Result};
use crate::models::{MemoryRecord, NewMemory, RecordId, RecordStats};
use crate::schema::memories;

const CREATE_MEMORIES: &str = "
    CREATE TABLE IF NOT EXISTS memories (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        owner_id TEXT NOT NULL,
        session_id TEXT NOT NULL,
        text TEXT NOT NULL,
        embedding_dim INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        metadata BLOB
    );
    CREATE INDEX IF NOT EXISTS idx_memories_owner_id ON memories(owner_id);
    CREATE INDEX IF NOT EXISTS idx_memories_session_id ON memories(session_id);
";

/// Ids bound per `IN (...)` query in [`RecordStore::fetch_many`], well below SQLite's
/// 32766 host-parameter limit.
pub const FETCH_CHUNK: usize = 10_000;

/// Handle to the `memories` table in one SQLite file.
///
/// Cheap to clone; it only holds the path and connection settings.
#[derive(Debug, Clone)]
pub struct RecordStore {
    path: PathBuf,
    busy_timeout: Duration,
    fetch_chunk: usize,
}

impl RecordStore {
    /// Open (or create) the store at `path`, switch it to WAL mode and ensure the schema.
    ///
    /// # Errors
    /// [`MemoryError::StorageFault`] if the file cannot be opened or the schema cannot be
    /// created.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        let store = Self {
            path: path.to_path_buf(),
            busy_timeout,
            fetch_chunk: FETCH_CHUNK,
        };

        let mut conn = store.connect()?;
        conn.batch_execute("PRAGMA journal_mode = WAL;")?;
        conn.batch_execute(CREATE_MEMORIES)?;

        info!("Record store ready at {}", path.display());
        Ok(store)
    }

    #[cfg(test)]
    pub(crate) fn with_fetch_chunk(mut self, fetch_chunk: usize) -> Self {
        self.fetch_chunk = fetch_chunk.max(1);
        self
    }

    /// Path of the SQLite file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> Result<SqliteConnection> {
        let url = self.path.to_string_lossy();
        let mut conn = SqliteConnection::establish(&url)?;
        conn.batch_execute(&format!(
            "PRAGMA busy_timeout = {}; PRAGMA synchronous = FULL;",
            self.busy_timeout.as_millis()
        ))?;
        Ok(conn)
    }

    /// Append a record and return its id.
    ///
    /// Ids come from SQLite `AUTOINCREMENT`, so each one is strictly greater than every
    /// id handed out before, including ids of deleted rows.
    pub fn insert(
        &self,
        owner_id: &str,
        session_id: &str,
        text: &str,
        embedding_dim: usize,
        metadata: Option<&[u8]>,
    ) -> Result<RecordId> {
        let embedding_dim = i32::try_from(embedding_dim).map_err(|_| {
            MemoryError::InvalidConfig(format!("embedding dimension {embedding_dim} too large"))
        })?;
        let new_memory = NewMemory {
            owner_id,
            session_id,
            text,
            embedding_dim,
            created_at_raw: Utc::now().to_rfc3339(),
            metadata: metadata.map(<[u8]>::to_vec),
        };

        let mut conn = self.connect()?;
        let id = diesel::insert_into(memories::table)
            .values(&new_memory)
            .returning(memories::id)
            .get_result::<RecordId>(&mut conn)?;

        debug!("Inserted record {} for owner {}", id, owner_id);
        Ok(id)
    }

    /// Fetch a record by id, scoped to `owner_id`.
    ///
    /// A record owned by someone else is indistinguishable from a missing one.
    pub fn fetch(&self, record_id: RecordId, owner_id: &str) -> Result<Option<MemoryRecord>> {
        let mut conn = self.connect()?;
        let record = memories::table
            .filter(memories::id.eq(record_id))
            .filter(memories::owner_id.eq(owner_id))
            .select(MemoryRecord::as_select())
            .first(&mut conn)
            .optional()?;
        Ok(record)
    }

    /// Fetch every record in `record_ids` that belongs to `owner_id`, over one connection.
    ///
    /// Any number of ids is accepted; they are queried [`FETCH_CHUNK`] at a time.
    pub fn fetch_many(
        &self,
        record_ids: &[RecordId],
        owner_id: &str,
    ) -> Result<HashMap<RecordId, MemoryRecord>> {
        let mut found = HashMap::new();
        if record_ids.is_empty() {
            return Ok(found);
        }

        let mut conn = self.connect()?;
        for chunk in record_ids.chunks(self.fetch_chunk) {
            let rows = memories::table
                .filter(memories::id.eq_any(chunk.to_vec()))
                .filter(memories::owner_id.eq(owner_id))
                .select(MemoryRecord::as_select())
                .load(&mut conn)?;
            found.extend(rows.into_iter().map(|r| (r.id, r)));
        }
        Ok(found)
    }

    /// Most recent records for `owner_id`, newest first.
    pub fn list(&self, owner_id: &str, limit: usize) -> Result<Vec<MemoryRecord>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut conn = self.connect()?;
        let rows = memories::table
            .filter(memories::owner_id.eq(owner_id))
            .order(memories::id.desc())
            .limit(limit)
            .select(MemoryRecord::as_select())
            .load(&mut conn)?;
        Ok(rows)
    }

    /// Delete every record in `session_id` and return how many were removed.
    ///
    /// Vectors already appended for those records stay in the vector index. Search
    /// drops them later because their ids no longer resolve here.
    pub fn delete_by_session(&self, session_id: &str) -> Result<usize> {
        let mut conn = self.connect()?;
        let deleted = diesel::delete(memories::table.filter(memories::session_id.eq(session_id)))
            .execute(&mut conn)?;
        info!("Deleted {} records for session {}", deleted, session_id);
        Ok(deleted)
    }

    /// Record and distinct-session counts for `owner_id`.
    pub fn stats(&self, owner_id: &str) -> Result<RecordStats> {
        let mut conn = self.connect()?;
        let record_count: i64 = memories::table
            .filter(memories::owner_id.eq(owner_id))
            .count()
            .get_result(&mut conn)?;
        let distinct_session_count: i64 = memories::table
            .filter(memories::owner_id.eq(owner_id))
            .select(count_distinct(memories::session_id))
            .get_result(&mut conn)?;

        Ok(RecordStats {
            record_count: record_count.max(0) as u64,
            distinct_session_count: distinct_session_count.max(0) as u64,
        })
    }
}
