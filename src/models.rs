//! # Data model
//!
//! Rows of the `memories` table (see [`crate::schema`]) and the small value types the
//! backend hands back to callers.
//!
//! - [`MemoryRecord`]: one persisted memory, read back through Diesel.
//! - [`NewMemory`]: the insertable form; `id` is assigned by SQLite.
//! - [`RecordStats`] / [`BackendStats`]: per-owner counters.
//! - [`SearchHit`]: one semantic recall result.
//!
//! Records are never updated in place. The only way a row leaves the table is a
//! session-scoped bulk delete.
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

/// Identifier assigned by the record store. Strictly increasing, never reused.
pub type RecordId = i64;

/// A persisted memory row.
///
/// ### Table
/// - `memories`
///
/// ### Notes
/// - `embedding_dim` is informational; it always equals the vector index dimension at
///   the time of insert.
/// - `created_at` is stored as RFC 3339 text; use [`MemoryRecord::created_at`] to parse it.
/// - `metadata` is an opaque blob owned by the caller.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone, PartialEq, Serialize)]
#[diesel(table_name = crate::schema::memories)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct MemoryRecord {
    /// Auto-increment primary key.
    pub id: RecordId,
    /// Tenant the record belongs to.
    pub owner_id: String,
    /// Session grouping used for bulk deletion.
    pub session_id: String,
    /// Memory text.
    pub text: String,
    /// Length of the embedding stored alongside this record.
    pub embedding_dim: i32,
    /// Insert timestamp (RFC 3339).
    #[diesel(column_name = created_at)]
    #[serde(rename = "created_at")]
    pub created_at_raw: String,
    /// Caller-supplied blob.
    pub metadata: Option<Vec<u8>>,
}

impl MemoryRecord {
    /// Parsed insert timestamp.
    ///
    /// Returns `None` if the stored text is not valid RFC 3339, which only happens for
    /// rows written by something other than this crate.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.created_at_raw)
            .ok()
            .map(|ts| ts.with_timezone(&Utc))
    }
}

/// Insertable form of [`MemoryRecord`].
#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::memories)]
pub struct NewMemory<'a> {
    pub owner_id: &'a str,
    pub session_id: &'a str,
    pub text: &'a str,
    pub embedding_dim: i32,
    #[diesel(column_name = created_at)]
    pub created_at_raw: String,
    pub metadata: Option<Vec<u8>>,
}

/// Record counters for one owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordStats {
    pub record_count: u64,
    pub distinct_session_count: u64,
}

/// [`RecordStats`] merged with the global vector index size.
///
/// `index_size` is not per-owner: the index has no owner partitioning, and it still
/// counts vectors whose records were deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendStats {
    pub record_count: u64,
    pub distinct_session_count: u64,
    pub index_size: u64,
}

/// One result of a semantic search.
///
/// `similarity` is `1 / (1 + squared_distance)`: strictly decreasing with distance, but
/// not a calibrated probability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub record_id: RecordId,
    pub text: String,
    pub session_id: String,
    pub similarity: f32,
}

impl SearchHit {
    /// Map a squared Euclidean distance to the similarity score.
    #[inline]
    pub fn similarity_from_distance(distance: f32) -> f32 {
        1.0 / (1.0 + distance)
    }
}
