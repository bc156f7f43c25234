//! Directed graph containers with bounded out-degree.
//!
//! Adjacency lists are packed into dataset rows with the length stored
//! inline: row `v` is `[len, n0, n1, ..]` with `len <= max_degree` and the
//! neighbors sorted ascending, which makes membership tests a binary
//! search. The row width is `max_degree + 1`.
//!
//! Two variants parallel the dataset variants: [`SimpleGraph`] is one
//! contiguous allocation sized at construction, [`BlockedGraph`] grows by
//! appending blocks and supports `resize`.
//!
//! Invariants for every vertex `v`: neighbors are distinct ids in
//! `[0, num_nodes)`, ascending, without `v` itself, and at most
//! `max_degree` of them.

use crate::data::{BlockedDataset, DataError, SimpleDataset, VectorData};
use thiserror::Error;

/// Errors raised by graph construction.
#[derive(Debug, Error)]
pub enum GraphError {
    /// A vertex id outside `[0, num_nodes)`.
    #[error("vertex {vertex} out of bounds for graph of {num_nodes} nodes")]
    VertexOutOfBounds {
        /// The offending vertex.
        vertex: u32,
        /// Number of nodes in the graph.
        num_nodes: usize,
    },

    /// Graph storage could not be allocated or resized.
    #[error(transparent)]
    Data(#[from] DataError),
}

/// Read access to a bounded-degree adjacency structure.
pub trait GraphView: Send + Sync {
    /// Number of vertices.
    fn num_nodes(&self) -> usize;

    /// The enforced out-degree bound.
    fn max_degree(&self) -> usize;

    /// The sorted adjacency list of vertex `v`.
    fn neighbors(&self, v: u32) -> &[u32];

    /// Out-degree of vertex `v`.
    #[inline]
    fn degree(&self, v: u32) -> usize {
        self.neighbors(v).len()
    }

    /// Whether an edge `src -> dst` exists. Logarithmic in the degree.
    #[inline]
    fn has_edge(&self, src: u32, dst: u32) -> bool {
        self.neighbors(src).binary_search(&dst).is_ok()
    }

    /// Hints the adjacency list of `v` into cache.
    fn prefetch(&self, v: u32);
}

/// Adjacency storage over any dataset of `u32` rows.
///
/// Not used directly; see [`SimpleGraph`] and [`BlockedGraph`].
pub struct AdjacencyBase<D> {
    rows: D,
    max_degree: u32,
}

/// Contiguous graph: one allocation, size fixed at construction.
pub type SimpleGraph = AdjacencyBase<SimpleDataset<u32>>;

/// Block-allocated graph supporting `resize` and append.
pub type BlockedGraph = AdjacencyBase<BlockedDataset<u32>>;

impl<D: VectorData<u32>> AdjacencyBase<D> {
    /// Removes all outgoing edges of `v` in O(1).
    pub fn clear_node(&mut self, v: u32) {
        self.rows.get_mut(v as usize)[0] = 0;
    }

    /// Replaces the adjacency list of `v`.
    ///
    /// Takes at most `max_degree` entries from the front of `new_neighbors`
    /// (excess is dropped), then sorts the stored list to restore the
    /// ascending invariant. Entries must be distinct, in bounds, and must
    /// not include `v` itself.
    pub fn replace_node(&mut self, v: u32, new_neighbors: &[u32]) {
        let keep = new_neighbors.len().min(self.max_degree as usize);
        let row = self.rows.get_mut(v as usize);
        row[1..=keep].copy_from_slice(&new_neighbors[..keep]);
        row[1..=keep].sort_unstable();
        row[0] = keep as u32;
        debug_assert!(row[1..=keep].windows(2).all(|w| w[0] < w[1]));
        debug_assert!(!row[1..=keep].contains(&v));
    }

    /// Adds an edge `src -> dst`, keeping the list sorted.
    ///
    /// Leaves the list unchanged (and reports the current degree) when
    /// `src == dst`, the edge already exists, or the list is full.
    /// Returns the out-degree of `src` after the call.
    pub fn add_edge(&mut self, src: u32, dst: u32) -> usize {
        if src == dst {
            return self.degree_of(src);
        }
        let max_degree = self.max_degree as usize;
        let row = self.rows.get_mut(src as usize);
        let len = row[0] as usize;
        let position = match row[1..=len].binary_search(&dst) {
            Ok(_) => return len,
            Err(pos) => pos,
        };
        if len == max_degree {
            return len;
        }
        row.copy_within(1 + position..1 + len, 2 + position);
        row[1 + position] = dst;
        row[0] = (len + 1) as u32;
        len + 1
    }

    #[inline]
    fn degree_of(&self, v: u32) -> usize {
        self.rows.get(v as usize)[0] as usize
    }

    /// The packed row storage (`[len, n0, n1, ..]` per vertex), for
    /// serialization.
    #[must_use]
    pub fn rows(&self) -> &D {
        &self.rows
    }

    /// Checks that `v` addresses a vertex.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::VertexOutOfBounds`] otherwise.
    pub fn check_vertex(&self, v: u32) -> Result<(), GraphError> {
        if (v as usize) < self.rows.size() {
            Ok(())
        } else {
            Err(GraphError::VertexOutOfBounds {
                vertex: v,
                num_nodes: self.rows.size(),
            })
        }
    }
}

impl<D: VectorData<u32>> GraphView for AdjacencyBase<D> {
    fn num_nodes(&self) -> usize {
        self.rows.size()
    }

    fn max_degree(&self) -> usize {
        self.max_degree as usize
    }

    #[inline]
    fn neighbors(&self, v: u32) -> &[u32] {
        let row = self.rows.get(v as usize);
        let len = row[0] as usize;
        &row[1..1 + len]
    }

    #[inline]
    fn prefetch(&self, v: u32) {
        self.rows.prefetch(v as usize);
    }
}

impl SimpleGraph {
    /// Creates an edgeless graph of `num_nodes` vertices.
    #[must_use]
    pub fn new(num_nodes: usize, max_degree: usize) -> Self {
        Self {
            // Zero-initialized rows encode empty adjacency lists.
            rows: SimpleDataset::new(num_nodes, max_degree + 1),
            max_degree: max_degree as u32,
        }
    }

    /// Reinterprets a dataset of packed rows as a graph.
    ///
    /// The row width must be `max_degree + 1`; used by the load path.
    #[must_use]
    pub fn from_dataset(rows: SimpleDataset<u32>) -> Self {
        let max_degree = (rows.dimensions() - 1) as u32;
        Self { rows, max_degree }
    }

    /// The packed row storage, for serialization.
    #[must_use]
    pub fn as_dataset(&self) -> &SimpleDataset<u32> {
        &self.rows
    }
}

impl BlockedGraph {
    /// Creates an edgeless resizable graph of `num_nodes` vertices.
    ///
    /// # Errors
    ///
    /// Propagates allocation failures.
    pub fn new(num_nodes: usize, max_degree: usize) -> Result<Self, GraphError> {
        Ok(Self {
            rows: BlockedDataset::new(num_nodes, max_degree + 1)?,
            max_degree: max_degree as u32,
        })
    }

    /// Creates a resizable graph with an explicit block byte target.
    ///
    /// # Errors
    ///
    /// Propagates allocation failures.
    pub fn with_blocksize(
        num_nodes: usize,
        max_degree: usize,
        blocksize_bytes: usize,
    ) -> Result<Self, GraphError> {
        Ok(Self {
            rows: BlockedDataset::with_blocksize(num_nodes, max_degree + 1, blocksize_bytes)?,
            max_degree: max_degree as u32,
        })
    }

    /// Grows or shrinks the vertex set to `new_size`.
    ///
    /// New vertices start with empty adjacency lists; callers shrinking
    /// the graph are responsible for removing edges into dropped vertices
    /// beforehand.
    ///
    /// # Errors
    ///
    /// Propagates allocation failures while growing.
    pub fn resize(&mut self, new_size: usize) -> Result<(), GraphError> {
        let old_size = self.rows.size();
        self.rows.resize(new_size)?;
        // Freshly exposed rows may hold stale bytes from an earlier shrink.
        for v in old_size..new_size {
            self.rows.get_mut(v)[0] = 0;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_graph() {
        let g = SimpleGraph::new(10, 4);
        assert_eq!(g.num_nodes(), 10);
        assert_eq!(g.max_degree(), 4);
        for v in 0..10 {
            assert!(g.neighbors(v).is_empty());
        }
    }

    #[test]
    fn test_add_edge_sorted_no_duplicates() {
        let mut g = SimpleGraph::new(8, 4);
        assert_eq!(g.add_edge(0, 5), 1);
        assert_eq!(g.add_edge(0, 2), 2);
        assert_eq!(g.add_edge(0, 7), 3);
        assert_eq!(g.neighbors(0), &[2, 5, 7]);

        // Duplicate and self edges are rejected.
        assert_eq!(g.add_edge(0, 5), 3);
        assert_eq!(g.add_edge(0, 0), 3);
        assert_eq!(g.neighbors(0), &[2, 5, 7]);

        // Fill to max degree, then reject.
        assert_eq!(g.add_edge(0, 1), 4);
        assert_eq!(g.add_edge(0, 3), 4);
        assert_eq!(g.neighbors(0), &[1, 2, 5, 7]);
        assert!(g.has_edge(0, 5));
        assert!(!g.has_edge(0, 3));
    }

    #[test]
    fn test_replace_node_sorts_and_clamps() {
        let mut g = SimpleGraph::new(16, 3);
        g.replace_node(4, &[9, 1, 7, 3]);
        // Only the first three survive the clamp, then they are sorted.
        assert_eq!(g.neighbors(4), &[1, 7, 9]);

        g.clear_node(4);
        assert!(g.neighbors(4).is_empty());
    }

    #[test]
    fn test_blocked_graph_resize() {
        let mut g = BlockedGraph::with_blocksize(4, 3, 256).unwrap();
        g.add_edge(0, 3);
        g.resize(100).unwrap();
        assert_eq!(g.num_nodes(), 100);
        assert_eq!(g.neighbors(0), &[3]);
        assert!(g.neighbors(99).is_empty());
        g.add_edge(99, 0);
        assert_eq!(g.neighbors(99), &[0]);

        g.resize(50).unwrap();
        assert_eq!(g.num_nodes(), 50);
        assert_eq!(g.neighbors(0), &[3]);
    }

    #[test]
    fn test_dataset_roundtrip() {
        let mut g = SimpleGraph::new(3, 2);
        g.replace_node(0, &[2, 1]);
        g.replace_node(2, &[0]);
        let restored = SimpleGraph::from_dataset(g.as_dataset().copy());
        assert_eq!(restored.max_degree(), 2);
        assert_eq!(restored.neighbors(0), &[1, 2]);
        assert_eq!(restored.neighbors(1), &[] as &[u32]);
        assert_eq!(restored.neighbors(2), &[0]);
    }
}
