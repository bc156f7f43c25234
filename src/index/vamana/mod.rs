//! Vamana graph index.
//!
//! A directed bounded-degree graph whose out-neighbors are chosen by
//! robust pruning over greedy-search candidate pools; searching walks the
//! graph best-first from a fixed entry point (the medoid by default).
//! Recall versus throughput is tuned by the search window size `L`, build
//! quality by `(alpha, graph_max_degree, window_size)`.
//!
//! This module holds the static (build-once, search-many) index;
//! [`dynamic`] adds insert/delete/consolidate/compact on blocked storage.

use crate::data::{SimpleDataset, VectorData};
use crate::datatype::{DataType, Element};
use crate::distance::{DistanceTag, Metric};
use crate::error::{Result, VesprError};
use crate::graph::{GraphView, SimpleGraph};
use crate::index::{IndexError, QueryResult};
use crate::saveload::{
    load_dataset, save_dataset, BinaryArtifact, SaveContext, SaveTable, Version,
};
use crate::threads::{DisjointWriter, Partition, ThreadPool};
use serde::{Deserialize, Serialize};

pub mod build;
pub mod dynamic;
pub mod dynamic_buffer;
pub mod filter;
pub mod greedy;
pub mod prune;
pub mod search_buffer;

pub use dynamic::DynamicVamanaIndex;
pub use dynamic_buffer::MutableBuffer;
pub use filter::VisitedFilter;
pub use prune::PruneStrategy;
pub use search_buffer::SearchBuffer;

const INDEX_SCHEMA: &str = "vamana_index";
const CONFIG_SCHEMA: &str = "vamana_config";
const GRAPH_SCHEMA: &str = "graph";
const DATA_SCHEMA: &str = "dense_dataset";
const SAVE_VERSION: Version = Version::new(0, 0, 1);

/// Largest sample used for entry-point selection.
const MEDOID_SAMPLE_CAP: usize = 64 * 1024;

/// How the builder picks its entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EntryPointStrategy {
    /// The vector nearest the sample mean.
    #[default]
    Medoid,
    /// Vertex 0, for reproducing externally built graphs.
    VertexZero,
}

/// Construction parameters for a Vamana graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VamanaBuildParameters {
    /// Prune relaxation; 1.0 keeps only closest-dominating edges.
    pub alpha: f32,
    /// Maximum out-degree `R` of the final graph.
    pub graph_max_degree: usize,
    /// Greedy-search window `L` used during construction.
    pub window_size: usize,
    /// Cap on candidate pools fed into pruning.
    pub max_candidate_pool_size: usize,
    /// Degree target when re-pruning overflowed vertices.
    pub prune_to: usize,
    /// Pruning schedule; `None` resolves from the metric.
    #[serde(default)]
    pub prune_strategy: Option<PruneStrategy>,
    /// Entry-point selection.
    #[serde(default)]
    pub entry_point: EntryPointStrategy,
    /// Seed for the build permutation.
    #[serde(default)]
    pub seed: u64,
}

impl Default for VamanaBuildParameters {
    fn default() -> Self {
        Self {
            alpha: 1.2,
            graph_max_degree: 32,
            window_size: 64,
            max_candidate_pool_size: 80,
            prune_to: 32,
            prune_strategy: None,
            entry_point: EntryPointStrategy::Medoid,
            seed: 0xc0ff_ee,
        }
    }
}

impl VamanaBuildParameters {
    fn validate(&self) -> Result<()> {
        if self.alpha < 1.0 {
            return Err(VesprError::Config(format!(
                "alpha must be >= 1.0, got {}",
                self.alpha
            )));
        }
        if self.graph_max_degree == 0 || self.window_size == 0 {
            return Err(VesprError::Config(
                "graph_max_degree and window_size must be positive".into(),
            ));
        }
        if self.prune_to > self.graph_max_degree {
            return Err(VesprError::Config(format!(
                "prune_to ({}) exceeds graph_max_degree ({})",
                self.prune_to, self.graph_max_degree
            )));
        }
        Ok(())
    }

    /// The pruning schedule, resolved against the metric when not set
    /// explicitly.
    #[must_use]
    pub fn resolve_strategy(&self, tag: DistanceTag) -> PruneStrategy {
        self.prune_strategy
            .unwrap_or_else(|| PruneStrategy::default_for(tag))
    }
}

/// Runtime search parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VamanaSearchParameters {
    /// Greedy-search window `L`; higher means better recall, lower
    /// throughput.
    pub search_window_size: usize,
    /// Slots (log2) of the per-thread approximate visited filter; `None`
    /// disables it.
    pub visited_filter_bits: Option<u32>,
    /// Enable the buffer's exact visited set alongside the filter.
    pub buffer_visited_set: bool,
}

impl Default for VamanaSearchParameters {
    fn default() -> Self {
        Self {
            search_window_size: 64,
            visited_filter_bits: Some(VisitedFilter::DEFAULT_BITS),
            buffer_visited_set: false,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct RootBody {
    eltype: DataType,
    dims: u64,
    num_vectors: u64,
}

#[derive(Serialize, Deserialize)]
struct ConfigBody {
    distance: DistanceTag,
    entry_point: u32,
    build_params: VamanaBuildParameters,
    search_params: VamanaSearchParameters,
}

#[derive(Serialize, Deserialize)]
struct GraphBody {
    artifact: BinaryArtifact,
    max_degree: u64,
    num_vertices: u64,
}

#[derive(Serialize, Deserialize)]
struct DataBody {
    artifact: BinaryArtifact,
}

/// Static Vamana index: dataset + graph + entry point.
pub struct VamanaIndex<T: Element, M: Metric<T>> {
    data: SimpleDataset<T>,
    graph: SimpleGraph,
    metric: M,
    distance: DistanceTag,
    entry_point: u32,
    build_params: VamanaBuildParameters,
    search_params: VamanaSearchParameters,
    pool: ThreadPool,
}

impl<T: Element, M: Metric<T>> std::fmt::Debug for VamanaIndex<T, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VamanaIndex")
            .field("distance", &self.distance)
            .field("entry_point", &self.entry_point)
            .field("build_params", &self.build_params)
            .field("search_params", &self.search_params)
            .finish_non_exhaustive()
    }
}

impl<T: Element, M: Metric<T>> VamanaIndex<T, M> {
    /// Builds an index over `data`.
    ///
    /// # Errors
    ///
    /// Returns configuration errors for invalid parameters or an empty
    /// dataset, and propagates worker panics.
    pub fn build(
        data: SimpleDataset<T>,
        metric: M,
        distance: DistanceTag,
        params: VamanaBuildParameters,
        num_threads: usize,
    ) -> Result<Self> {
        params.validate()?;
        if data.is_empty() {
            return Err(IndexError::EmptyIndex.into());
        }

        let mut pool = ThreadPool::new(num_threads)?;
        let entry_point = match params.entry_point {
            EntryPointStrategy::VertexZero => 0,
            EntryPointStrategy::Medoid => find_medoid(&data, &mut pool)?,
        };

        let mut graph = SimpleGraph::new(data.size(), params.graph_max_degree);
        let strategy = params.resolve_strategy(distance);
        let builder = build::VamanaBuilder::new(&data, &metric, &params, strategy);
        builder.construct(&mut graph, entry_point, params.seed, &mut pool)?;

        let search_params = VamanaSearchParameters {
            search_window_size: params.window_size,
            ..VamanaSearchParameters::default()
        };
        Ok(Self {
            data,
            graph,
            metric,
            distance,
            entry_point,
            build_params: params,
            search_params,
            pool,
        })
    }

    /// Number of indexed vectors.
    #[must_use]
    pub fn size(&self) -> usize {
        self.data.size()
    }

    /// Vector dimensionality.
    #[must_use]
    pub fn dimensions(&self) -> usize {
        self.data.dimensions()
    }

    /// The distance tag this index was built with.
    #[must_use]
    pub fn distance(&self) -> DistanceTag {
        self.distance
    }

    /// The entry vertex used by every search.
    #[must_use]
    pub fn entry_point(&self) -> u32 {
        self.entry_point
    }

    /// The underlying graph (read-only).
    #[must_use]
    pub fn graph(&self) -> &SimpleGraph {
        &self.graph
    }

    /// The underlying dataset (read-only).
    #[must_use]
    pub fn data(&self) -> &SimpleDataset<T> {
        &self.data
    }

    /// Worker count used for batch searches.
    #[must_use]
    pub fn get_num_threads(&self) -> usize {
        self.pool.size()
    }

    /// Changes the worker count.
    ///
    /// # Errors
    ///
    /// Propagates thread-spawn failures.
    pub fn set_num_threads(&mut self, num_threads: usize) -> Result<()> {
        self.pool.resize(num_threads)?;
        Ok(())
    }

    /// The search window size `L`.
    #[must_use]
    pub fn search_window_size(&self) -> usize {
        self.search_params.search_window_size
    }

    /// Sets the search window size `L`.
    pub fn set_search_window_size(&mut self, window: usize) {
        self.search_params.search_window_size = window.max(1);
    }

    /// Runtime search parameters, mutable (visited filter/set knobs).
    pub fn search_parameters_mut(&mut self) -> &mut VamanaSearchParameters {
        &mut self.search_params
    }

    /// Searches for the `k` nearest neighbors of each query row.
    ///
    /// `queries` is row-major `num_queries x dimensions`.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::QueryDimensionMismatch`] for misshapen input
    /// and propagates worker panics.
    pub fn search(&mut self, queries: &[f32], k: usize) -> Result<QueryResult> {
        let dims = self.data.dimensions();
        if dims == 0 || queries.len() % dims != 0 {
            return Err(IndexError::QueryDimensionMismatch {
                expected: dims,
                actual: queries.len(),
            }
            .into());
        }
        let num_queries = queries.len() / dims;
        let mut result = QueryResult::new(num_queries, k);
        if k == 0 {
            return Ok(result);
        }
        let window = self.search_params.search_window_size.max(k);
        let entry_points = [self.entry_point];

        let graph = &self.graph;
        let data = &self.data;
        let metric_proto = &self.metric;
        let search_params = &self.search_params;

        {
            let (ids, distances) = result.parts_mut();
            let ids_writer = DisjointWriter::new(ids);
            let dist_writer = DisjointWriter::new(distances);

            self.pool
                .parallel_for(Partition::fixed(num_queries), |range, _| {
                    let mut metric = metric_proto.clone();
                    let mut buffer = SearchBuffer::<M::Order>::with_visited_set(
                        window,
                        search_params.buffer_visited_set,
                    );
                    let mut filter = search_params.visited_filter_bits.map(VisitedFilter::new);

                    for q in range {
                        metric.fix_argument(&queries[q * dims..(q + 1) * dims]);
                        greedy::greedy_search(
                            graph,
                            data,
                            &metric,
                            &mut buffer,
                            &entry_points,
                            filter.as_mut(),
                            |_| false,
                        );
                        buffer.sort();
                        for (slot, neighbor) in buffer.top_k(k).into_iter().enumerate() {
                            // SAFETY: query rows are disjoint across
                            // workers.
                            unsafe {
                                ids_writer.write(q * k + slot, neighbor.id);
                                dist_writer.write(q * k + slot, neighbor.distance);
                            }
                        }
                    }
                })?;
        }
        Ok(result)
    }

    /// Saves the index as a directory: `config/`, `graph/`, and `data/`
    /// subdirectories, each with its own save table, plus a root table.
    ///
    /// # Errors
    ///
    /// Propagates serialization and filesystem failures.
    pub fn save(&self, dir: &std::path::Path) -> Result<()> {
        let ctx = SaveContext::new(dir)?;

        let root = RootBody {
            eltype: T::DATA_TYPE,
            dims: self.dimensions() as u64,
            num_vectors: self.size() as u64,
        };
        SaveTable::new(INDEX_SCHEMA, SAVE_VERSION, &root)?.write(ctx.dir())?;

        let config_ctx = ctx.subdir("config")?;
        let config = ConfigBody {
            distance: self.distance,
            entry_point: self.entry_point,
            build_params: self.build_params.clone(),
            search_params: self.search_params.clone(),
        };
        SaveTable::new(CONFIG_SCHEMA, SAVE_VERSION, &config)?.write(config_ctx.dir())?;

        let graph_ctx = ctx.subdir("graph")?;
        let graph_body = GraphBody {
            artifact: save_dataset(&graph_ctx, "graph", self.graph.as_dataset())?,
            max_degree: self.graph.max_degree() as u64,
            num_vertices: self.graph.num_nodes() as u64,
        };
        SaveTable::new(GRAPH_SCHEMA, SAVE_VERSION, &graph_body)?.write(graph_ctx.dir())?;

        let data_ctx = ctx.subdir("data")?;
        let data_body = DataBody {
            artifact: save_dataset(&data_ctx, "data", &self.data)?,
        };
        SaveTable::new(DATA_SCHEMA, SAVE_VERSION, &data_body)?.write(data_ctx.dir())?;

        Ok(())
    }

    /// Loads an index saved by [`VamanaIndex::save`].
    ///
    /// `metric` must correspond to the saved distance tag; element type
    /// and artifact integrity are verified.
    ///
    /// # Errors
    ///
    /// Returns schema/version/type mismatches and checksum failures from
    /// the save protocol.
    pub fn load(
        dir: &std::path::Path,
        metric: M,
        expected_distance: DistanceTag,
        num_threads: usize,
    ) -> Result<Self> {
        let root: RootBody =
            SaveTable::read(dir)?.load_object(INDEX_SCHEMA, SAVE_VERSION)?;
        if root.eltype != T::DATA_TYPE {
            return Err(crate::saveload::SerializationError::TypeMismatch {
                expected: T::DATA_TYPE,
                found: root.eltype,
            }
            .into());
        }

        let config_dir = dir.join("config");
        let config: ConfigBody =
            SaveTable::read(&config_dir)?.load_object(CONFIG_SCHEMA, SAVE_VERSION)?;
        if config.distance != expected_distance {
            return Err(VesprError::Config(format!(
                "index was saved with distance {}, loader expected {}",
                config.distance, expected_distance
            )));
        }

        let graph_dir = dir.join("graph");
        let graph_body: GraphBody =
            SaveTable::read(&graph_dir)?.load_object(GRAPH_SCHEMA, SAVE_VERSION)?;
        let graph_rows = load_dataset::<u32>(&graph_dir, &graph_body.artifact)?;
        let graph = SimpleGraph::from_dataset(graph_rows);

        let data_dir = dir.join("data");
        let data_body: DataBody =
            SaveTable::read(&data_dir)?.load_object(DATA_SCHEMA, SAVE_VERSION)?;
        let data = load_dataset::<T>(&data_dir, &data_body.artifact)?;

        if data.size() as u64 != root.num_vectors || data.dimensions() as u64 != root.dims {
            return Err(VesprError::Config(
                "root table shape disagrees with data artifact".into(),
            ));
        }

        Ok(Self {
            data,
            graph,
            metric,
            distance: config.distance,
            entry_point: config.entry_point,
            build_params: config.build_params,
            search_params: config.search_params,
            pool: ThreadPool::new(num_threads)?,
        })
    }
}

/// Picks the entry vertex: the row nearest the sample mean under L2.
pub(crate) fn find_medoid<T: Element, D: VectorData<T>>(
    data: &D,
    pool: &mut ThreadPool,
) -> Result<u32> {
    let sample = data.size().min(MEDOID_SAMPLE_CAP);
    let dims = data.dimensions();

    let mut mean = vec![0.0f64; dims];
    for i in 0..sample {
        for (j, x) in data.get(i).iter().enumerate() {
            mean[j] += f64::from(x.to_f32());
        }
    }
    let inv = 1.0 / sample as f64;
    let mean: Vec<f32> = mean.iter().map(|m| (m * inv) as f32).collect();

    let nthreads = pool.size();
    let mut best: Vec<(f32, u32)> = vec![(f32::INFINITY, 0); nthreads];
    {
        let writer = DisjointWriter::new(&mut best);
        pool.parallel_for(Partition::fixed(sample), |range, tid| {
            let mut local = (f32::INFINITY, 0u32);
            for i in range {
                let mut distance = 0.0f32;
                for (j, x) in data.get(i).iter().enumerate() {
                    let d = x.to_f32() - mean[j];
                    distance += d * d;
                }
                if distance < local.0 || (distance == local.0 && (i as u32) < local.1) {
                    local = (distance, i as u32);
                }
            }
            // SAFETY: one slot per worker.
            unsafe { writer.write(tid, local) };
        })?;
    }
    let mut winner = (f32::INFINITY, 0u32);
    for &(distance, id) in &best {
        if distance < winner.0 || (distance == winner.0 && id < winner.1) {
            winner = (distance, id);
        }
    }
    Ok(winner.1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::L2;

    fn grid_dataset(n: usize) -> SimpleDataset<f32> {
        // Points on a line, shuffled ids not needed: i -> [i, i].
        let rows: Vec<Vec<f32>> = (0..n).map(|i| vec![i as f32, i as f32]).collect();
        SimpleDataset::from_rows(&rows).unwrap()
    }

    #[test]
    fn test_medoid_of_line() {
        let mut pool = ThreadPool::new(2).unwrap();
        let data = grid_dataset(101);
        // The mean of 0..=100 is 50; point 50 is the medoid.
        assert_eq!(find_medoid(&data, &mut pool).unwrap(), 50);
    }

    #[test]
    fn test_build_and_self_search_small() {
        let data = grid_dataset(64);
        let params = VamanaBuildParameters {
            graph_max_degree: 8,
            window_size: 16,
            max_candidate_pool_size: 24,
            prune_to: 8,
            ..VamanaBuildParameters::default()
        };
        let mut index =
            VamanaIndex::build(data, L2::new(), DistanceTag::L2, params, 2).unwrap();
        assert_eq!(index.size(), 64);

        // Every vertex must find itself.
        for i in 0..64usize {
            let q = [i as f32, i as f32];
            let result = index.search(&q, 1).unwrap();
            assert_eq!(result.ids_row(0)[0], i as u32, "self-search failed for {i}");
            assert_eq!(result.distances_row(0)[0], 0.0);
        }
    }

    #[test]
    fn test_graph_invariants_after_build() {
        let data = grid_dataset(128);
        let params = VamanaBuildParameters {
            graph_max_degree: 6,
            window_size: 12,
            max_candidate_pool_size: 20,
            prune_to: 6,
            ..VamanaBuildParameters::default()
        };
        let index = VamanaIndex::build(data, L2::new(), DistanceTag::L2, params, 3).unwrap();
        let graph = index.graph();
        for v in 0..graph.num_nodes() as u32 {
            let neighbors = graph.neighbors(v);
            assert!(neighbors.len() <= 6);
            assert!(neighbors.windows(2).all(|w| w[0] < w[1]), "unsorted at {v}");
            assert!(!neighbors.contains(&v), "self loop at {v}");
            assert!(neighbors.iter().all(|&u| (u as usize) < graph.num_nodes()));
        }
    }

    #[test]
    fn test_invalid_parameters_rejected() {
        let data = grid_dataset(8);
        let params = VamanaBuildParameters {
            alpha: 0.5,
            ..VamanaBuildParameters::default()
        };
        assert!(matches!(
            VamanaIndex::build(data, L2::new(), DistanceTag::L2, params, 1),
            Err(VesprError::Config(_))
        ));
    }

    #[test]
    fn test_search_window_accessors() {
        let data = grid_dataset(32);
        let params = VamanaBuildParameters {
            graph_max_degree: 4,
            window_size: 8,
            max_candidate_pool_size: 12,
            prune_to: 4,
            ..VamanaBuildParameters::default()
        };
        let mut index =
            VamanaIndex::build(data, L2::new(), DistanceTag::L2, params, 1).unwrap();
        assert_eq!(index.search_window_size(), 8);
        index.set_search_window_size(40);
        assert_eq!(index.search_window_size(), 40);
    }
}
