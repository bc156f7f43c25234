//! # vespr
//!
//! High-performance approximate nearest-neighbor search over dense vector
//! collections: given `N` vectors in `R^d` and a query, return the `K`
//! closest in sub-linear time with a tunable recall/throughput trade-off.
//!
//! Two index families share one foundation:
//!
//! - **Vamana** ([`VamanaIndex`], [`DynamicVamanaIndex`]): a directed
//!   bounded-degree graph built by greedy search plus robust pruning,
//!   searched by best-first traversal. The dynamic variant adds
//!   incremental insert, two-phase delete, consolidation, and compaction
//!   on block-allocated storage.
//! - **IVF** ([`IvfIndex`]): an inverted file over a mini-batch k-means
//!   clustering (optionally hierarchical), searched by probing the
//!   nearest cells, with optional scalar-quantized scans and
//!   full-precision reranking.
//!
//! The shared foundation: contiguous and blocked datasets over
//! type-erased storage (heap, huge pages, memory-mapped files), packed
//! adjacency graphs, bounded sorted search buffers with a direct-mapped
//! visited filter, a fixed worker pool with static/dynamic partitioning
//! and panic recovery, distance functors with a per-query preprocessing
//! hook, scalar quantization, and a versioned save/load protocol with
//! content-addressed binary artifacts.
//!
//! ## Example
//!
//! ```rust
//! use vespr::{DistanceTag, SimpleDataset, VamanaBuildParameters, VamanaIndex, L2};
//!
//! // 64 vectors of 4 dimensions.
//! let rows: Vec<Vec<f32>> = (0..64).map(|i| vec![i as f32; 4]).collect();
//! let data = SimpleDataset::from_rows(&rows).expect("well-formed rows");
//!
//! let params = VamanaBuildParameters {
//!     graph_max_degree: 8,
//!     window_size: 16,
//!     max_candidate_pool_size: 24,
//!     prune_to: 8,
//!     ..VamanaBuildParameters::default()
//! };
//! let mut index =
//!     VamanaIndex::build(data, L2::new(), DistanceTag::L2, params, 2).expect("build");
//!
//! let result = index.search(&[7.0, 7.0, 7.0, 7.0], 3).expect("search");
//! assert_eq!(result.ids_row(0)[0], 7);
//! ```

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::missing_panics_doc)]

/// Dense vector datasets and file loaders.
pub mod data;

/// Element types and runtime type tags.
pub mod datatype;

/// Distance metrics.
pub mod distance;

/// Unified error handling.
pub mod error;

/// Bounded-degree adjacency containers.
pub mod graph;

/// Index implementations.
pub mod index;

/// Mini-batch k-means training.
pub mod kmeans;

/// Index orchestration and the uniform search API.
pub mod manager;

/// Index-distance pairs.
pub mod neighbor;

/// Scalar quantization.
pub mod quantization;

/// Save tables and binary artifacts.
pub mod saveload;

/// Type-erased owning storage backends.
pub mod storage;

/// Worker pool and partitioning.
pub mod threads;

pub use data::{io::read_svs, io::read_vecs, BlockedDataset, SimpleDataset, VectorData};
pub use datatype::{DataType, Element};
pub use distance::{Cosine, DistanceTag, InnerProduct, L2};
pub use error::{Result, VesprError};
pub use index::flat::FlatIndex;
pub use index::ivf::{Clustering, IvfBuildParameters, IvfIndex, IvfSearchParameters};
pub use index::vamana::{
    DynamicVamanaIndex, PruneStrategy, VamanaBuildParameters, VamanaIndex,
    VamanaSearchParameters,
};
pub use index::QueryResult;
pub use manager::{DynamicVamana, Ivf, SearchInterface, Vamana};
pub use quantization::{ScalarQuantizer, SqDataset};
pub use threads::ThreadPool;

/// The crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
