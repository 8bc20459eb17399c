//! Position → record id mapping that sits next to the [`VectorIndex`](crate::vector_store::VectorIndex).
//!
//! Positions are dense and assigned in insertion order, so the mapping is a plain
//! `Vec<RecordId>` indexed by position. It is only ever saved and loaded together with
//! the vector index (see [`crate::snapshot`]).

use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, Result};
use crate::models::RecordId;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMapping {
    record_ids: Vec<RecordId>,
}

impl IdMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.record_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.record_ids.is_empty()
    }

    /// Record `position → record_id`.
    ///
    /// `position` must be the next free slot; anything else would leave a gap or
    /// overwrite an existing entry.
    pub fn put(&mut self, position: usize, record_id: RecordId) -> Result<()> {
        if position != self.record_ids.len() {
            return Err(MemoryError::MappingOutOfOrder {
                expected: self.record_ids.len(),
                actual: position,
            });
        }
        self.record_ids.push(record_id);
        Ok(())
    }

    pub fn get(&self, position: usize) -> Option<RecordId> {
        self.record_ids.get(position).copied()
    }

    /// `(position, record_id)` pairs in position order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, RecordId)> + '_ {
        self.record_ids.iter().copied().enumerate()
    }
}
