//! Index implementations.
//!
//! Three index families share the dataset/graph/threading foundation:
//!
//! - [`vamana`]: a directed graph index searched by greedy traversal,
//!   with a static builder and a dynamic insert/delete variant.
//! - [`ivf`]: an inverted-file index over a k-means clustering, searched
//!   by probing the nearest cells.
//! - [`flat`]: exhaustive scan, kept as the reference and reranker.

use thiserror::Error;

pub mod flat;
pub mod ivf;
pub mod vamana;

/// Batched search results: row `i` holds the ids and scores of the `k`
/// nearest neighbors of query `i`, nearest first.
///
/// Rows shorter than `k` (fewer reachable vectors than requested) are
/// padded with [`QueryResult::SENTINEL_ID`].
#[derive(Debug, Clone)]
pub struct QueryResult {
    ids: Vec<u32>,
    distances: Vec<f32>,
    num_queries: usize,
    k: usize,
}

impl QueryResult {
    /// Id filling unused result slots.
    pub const SENTINEL_ID: u32 = u32::MAX;

    /// Allocates a result block for `num_queries` rows of `k` entries.
    #[must_use]
    pub fn new(num_queries: usize, k: usize) -> Self {
        Self {
            ids: vec![Self::SENTINEL_ID; num_queries * k],
            distances: vec![f32::NAN; num_queries * k],
            num_queries,
            k,
        }
    }

    /// Number of query rows.
    #[must_use]
    pub fn num_queries(&self) -> usize {
        self.num_queries
    }

    /// Entries per row.
    #[must_use]
    pub fn k(&self) -> usize {
        self.k
    }

    /// The ids for query `i`, nearest first.
    #[must_use]
    pub fn ids_row(&self, i: usize) -> &[u32] {
        &self.ids[i * self.k..(i + 1) * self.k]
    }

    /// The scores for query `i`, nearest first.
    #[must_use]
    pub fn distances_row(&self, i: usize) -> &[f32] {
        &self.distances[i * self.k..(i + 1) * self.k]
    }

    /// The full id matrix, row-major.
    #[must_use]
    pub fn ids(&self) -> &[u32] {
        &self.ids
    }

    /// The full score matrix, row-major.
    #[must_use]
    pub fn distances(&self) -> &[f32] {
        &self.distances
    }

    pub(crate) fn parts_mut(&mut self) -> (&mut [u32], &mut [f32]) {
        (&mut self.ids, &mut self.distances)
    }
}

/// Errors raised by index operations.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Insert of an external id that is already present.
    #[error("external id {0} already exists")]
    DuplicateId(u32),

    /// Operation on an external id that is absent or deleted.
    #[error("external id {0} does not exist")]
    UnknownId(u32),

    /// Operation requiring a non-empty index.
    #[error("operation requires a non-empty index")]
    EmptyIndex,

    /// Query batch whose width does not match the index.
    #[error("query dimensionality {actual} does not match index dimensionality {expected}")]
    QueryDimensionMismatch {
        /// Dimensions the index holds.
        expected: usize,
        /// Dimensions the caller supplied.
        actual: usize,
    },
}
