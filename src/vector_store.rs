//! # VectorIndex
//!
//! In-memory, append-only collection of fixed-dimension `f32` vectors with exact
//! nearest-neighbour search.
//!
//! ## Responsibilities
//! - **Append**: every vector gets the next dense position (`0, 1, 2, …`). Positions are
//!   never reordered, reused or removed.
//! - **Search**: brute-force scan by squared Euclidean distance, nearest first. The scan is
//!   spread over the rayon thread pool.
//! - **Persistence**: the struct is `serde`-serializable; [`crate::snapshot`] wraps it in a
//!   checksummed envelope and writes it atomically.
//!
//! ## Storage layout
//! Vectors live in a single row-major `Vec<f32>`: vector `p` occupies
//! `data[p * dimension .. (p + 1) * dimension]`.
//!
//! ## Quick Example
//! ```
//! use powermem::vector_store::VectorIndex;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut index = VectorIndex::new(2)?;
//! index.add(&[0.0, 0.0])?;
//! index.add(&[3.0, 4.0])?;
//! let hits = index.search(&[3.0, 3.0], 1)?;
//! assert_eq!(hits[0].position, 1);
//! assert_eq!(hits[0].distance, 1.0);
//! # Ok(()) }
//! ```

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::error::{MemoryError, Result};

/// One search result: the index position and its squared Euclidean distance to the query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub position: usize,
    pub distance: f32,
}

/// Flat exact-search vector index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorIndex {
    /// Length of every vector in the index.
    dimension: usize,
    /// Row-major vector storage.
    data: Vec<f32>,
}

impl VectorIndex {
    /// Create an empty index for vectors of length `dimension`.
    ///
    /// # Errors
    /// [`MemoryError::InvalidConfig`] if `dimension` is zero.
    pub fn new(dimension: usize) -> Result<Self> {
        if dimension == 0 {
            return Err(MemoryError::InvalidConfig(
                "vector dimension must be positive".into(),
            ));
        }
        Ok(Self {
            dimension,
            data: Vec::new(),
        })
    }

    /// Fixed vector length.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Number of vectors ever added.
    pub fn count(&self) -> usize {
        self.data.len() / self.dimension
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Reject a deserialized index whose fields cannot have come from [`VectorIndex::add`].
    pub(crate) fn check_integrity(&self) -> Result<()> {
        if self.dimension == 0 || self.data.len() % self.dimension != 0 {
            return Err(MemoryError::SnapshotCorrupt(format!(
                "vector data of length {} does not fit dimension {}",
                self.data.len(),
                self.dimension
            )));
        }
        Ok(())
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(MemoryError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        Ok(())
    }

    /// Append `vector` and return its position (the count before the call).
    ///
    /// # Errors
    /// [`MemoryError::DimensionMismatch`] if `vector.len() != dimension`; the index is left
    /// untouched.
    pub fn add(&mut self, vector: &[f32]) -> Result<usize> {
        self.check_dimension(vector)?;
        let position = self.count();
        self.data.extend_from_slice(vector);
        Ok(position)
    }

    /// Vector stored at `position`, if any.
    pub fn get(&self, position: usize) -> Option<&[f32]> {
        let start = position.checked_mul(self.dimension)?;
        let end = start.checked_add(self.dimension)?;
        self.data.get(start..end)
    }

    /// Up to `k` nearest vectors to `query`, ascending by squared Euclidean distance.
    ///
    /// Equal distances are ordered by position. An empty index or `k == 0` yields an
    /// empty result, never an error.
    ///
    /// # Errors
    /// [`MemoryError::DimensionMismatch`] if `query.len() != dimension`.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        self.check_dimension(query)?;
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }

        let mut scored: Vec<Neighbor> = self
            .data
            .par_chunks_exact(self.dimension)
            .enumerate()
            .map(|(position, vector)| Neighbor {
                position,
                distance: squared_euclidean(query, vector),
            })
            .collect();

        let by_distance = |a: &Neighbor, b: &Neighbor| -> Ordering {
            a.distance
                .total_cmp(&b.distance)
                .then(a.position.cmp(&b.position))
        };

        if k < scored.len() {
            scored.select_nth_unstable_by(k - 1, by_distance);
            scored.truncate(k);
        }
        scored.sort_unstable_by(by_distance);
        Ok(scored)
    }
}

/// Squared Euclidean distance `Σ (a[i] - b[i])²` between two equal-length vectors.
pub fn squared_euclidean(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}
