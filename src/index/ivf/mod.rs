//! Inverted-file (IVF) index.
//!
//! Vectors are partitioned into cells by k-means; a search scores each
//! query against every centroid with one dense matrix product, probes the
//! `n_probes` nearest cells, and scans only their members. With quantized
//! cell storage, the scan runs in the compressed domain and the top
//! `ceil(k_reorder * k)` candidates are reranked at full precision.
//!
//! Cluster storage comes in two layouts: *dense* copies each cell's
//! vectors into a contiguous per-cell dataset (cache-friendly scans, used
//! by default), *sparse* keeps the original dataset and a local-to-global
//! id table per cell (no duplication).

use crate::data::{SimpleDataset, VectorData};
use crate::datatype::{DataType, Element};
use crate::distance::{norm_square, DistanceTag, Metric};
use crate::error::{Result, VesprError};
use crate::index::vamana::SearchBuffer;
use crate::index::{IndexError, QueryResult};
use crate::kmeans::{self, KMeansConfig};
use crate::quantization::ScalarQuantizer;
use crate::saveload::{
    load_dataset, save_dataset, BinaryArtifact, BundleReader, BundleWriter, SaveContext,
    SaveTable, Version,
};
use crate::threads::{DisjointWriter, Partition, ThreadPool};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

const INDEX_SCHEMA: &str = "ivf_index";
const SAVE_VERSION: Version = Version::new(0, 0, 1);

const CLUSTERS_ARCHIVE: &str = "clusters_archive.bin";
const IDS_FILE: &str = "ids.bin";
const SIZES_FILE: &str = "cluster_sizes.bin";
const OFFSETS_FILE: &str = "ids_offsets.bin";

/// How cell members are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClusterLayout {
    /// Contiguous per-cell datasets.
    #[default]
    Dense,
    /// One shared dataset plus per-cell local-to-global id tables.
    Sparse,
}

/// Training and layout parameters for an IVF index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IvfBuildParameters {
    /// Target number of cells.
    pub num_centroids: usize,
    /// Rows per k-means minibatch.
    pub minibatch_size: usize,
    /// k-means iterations.
    pub num_iterations: usize,
    /// Train hierarchically (level-1 cells, then within each cell).
    pub is_hierarchical: bool,
    /// Fraction of the dataset sampled for training.
    pub training_fraction: f32,
    /// Level-1 cell count for hierarchical training; 0 selects the
    /// `sqrt(num_centroids)` heuristic.
    pub hierarchical_level1_clusters: usize,
    /// RNG seed.
    pub seed: u64,
    /// Cell storage layout.
    #[serde(default)]
    pub layout: ClusterLayout,
    /// Store scalar-quantized codes for the scan phase.
    #[serde(default)]
    pub quantize: bool,
}

impl Default for IvfBuildParameters {
    fn default() -> Self {
        Self {
            num_centroids: 1000,
            minibatch_size: 10_000,
            num_iterations: 10,
            is_hierarchical: true,
            training_fraction: 0.1,
            hierarchical_level1_clusters: 0,
            seed: 0xc0ff_ee,
            layout: ClusterLayout::Dense,
            quantize: false,
        }
    }
}

/// Runtime search parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IvfSearchParameters {
    /// Number of nearest cells scanned per query.
    pub n_probes: usize,
    /// Rerank expansion: the scan keeps `ceil(k_reorder * k)` candidates;
    /// values above 1.0 enable full-precision reranking of quantized
    /// scans. Must be at least 1.0.
    pub k_reorder: f32,
}

impl Default for IvfSearchParameters {
    fn default() -> Self {
        Self {
            n_probes: 1,
            k_reorder: 1.0,
        }
    }
}

/// Size statistics of a clustering.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusteringStats {
    /// Smallest cell.
    pub min_size: usize,
    /// Largest cell.
    pub max_size: usize,
    /// Number of empty cells.
    pub empty_clusters: usize,
    /// Number of cells.
    pub num_clusters: usize,
    /// Total members across cells.
    pub num_leaves: usize,
    /// Mean cell size.
    pub mean_size: f64,
    /// Standard deviation of cell sizes.
    pub std_size: f64,
}

/// Centroids plus the id lists assigned to them.
///
/// Invariant: the assignment lists partition `[0, N)`; every source id
/// appears in exactly one list.
pub struct Clustering {
    /// Cell centroids.
    pub centroids: SimpleDataset<f32>,
    /// Member ids per cell.
    pub assignments: Vec<Vec<u32>>,
}

impl Clustering {
    /// Computes size statistics over the assignment lists.
    #[must_use]
    pub fn statistics(&self) -> ClusteringStats {
        let num_clusters = self.assignments.len();
        let mut min_size = usize::MAX;
        let mut max_size = 0;
        let mut num_leaves = 0;
        let mut empty_clusters = 0;
        for cell in &self.assignments {
            min_size = min_size.min(cell.len());
            max_size = max_size.max(cell.len());
            num_leaves += cell.len();
            if cell.is_empty() {
                empty_clusters += 1;
            }
        }
        let mean_size = num_leaves as f64 / num_clusters.max(1) as f64;
        let mut accum = 0.0;
        for cell in &self.assignments {
            let x = cell.len() as f64 - mean_size;
            accum += x * x;
        }
        ClusteringStats {
            min_size: if num_clusters == 0 { 0 } else { min_size },
            max_size,
            empty_clusters,
            num_clusters,
            num_leaves,
            mean_size,
            std_size: (accum / num_clusters.max(1) as f64).sqrt(),
        }
    }

    /// Trains a clustering over `data` and assigns every vector.
    ///
    /// # Errors
    ///
    /// Returns configuration errors for undersized training sets;
    /// propagates worker panics.
    pub fn train<T: Element, D: VectorData<T>>(
        params: &IvfBuildParameters,
        data: &D,
        distance: DistanceTag,
        pool: &mut ThreadPool,
    ) -> Result<Self> {
        if params.num_centroids == 0 {
            return Err(VesprError::Config("num_centroids must be positive".into()));
        }
        let mut rng = <ChaCha8Rng as rand::SeedableRng>::seed_from_u64(params.seed);
        let trainset = kmeans::make_training_set(
            data,
            params.training_fraction,
            params.num_centroids,
            &mut rng,
            pool,
        )?;

        let config = KMeansConfig {
            clusters: params.num_centroids,
            minibatch_size: params.minibatch_size,
            iterations: params.num_iterations,
            metric: distance,
            seed: params.seed,
        };
        let centroids = if params.is_hierarchical {
            let level1 = if params.hierarchical_level1_clusters == 0 {
                (params.num_centroids as f64).sqrt().ceil() as usize
            } else {
                params.hierarchical_level1_clusters
            };
            kmeans::train_hierarchical(&config, level1, &trainset, pool)?
        } else {
            kmeans::train(&config, &trainset, pool)?
        };

        // Assign the full dataset in converted minibatches.
        let assignments = assign_all(data, &centroids, distance, params.minibatch_size, pool)?;
        let mut cells: Vec<Vec<u32>> = vec![Vec::new(); centroids.size()];
        for (i, &cell) in assignments.iter().enumerate() {
            cells[cell as usize].push(i as u32);
        }

        Ok(Self {
            centroids,
            assignments: cells,
        })
    }
}

/// Assigns every row of a generic dataset to its nearest centroid,
/// converting to f32 one minibatch at a time.
fn assign_all<T: Element, D: VectorData<T>>(
    data: &D,
    centroids: &SimpleDataset<f32>,
    distance: DistanceTag,
    minibatch_size: usize,
    pool: &mut ThreadPool,
) -> Result<Vec<u32>> {
    let n = data.size();
    let dims = data.dimensions();
    let batchsize = minibatch_size.max(1).min(n.max(1));
    let mut batch = SimpleDataset::<f32>::new(batchsize, dims);
    let mut assignments = Vec::with_capacity(n);

    let mut start = 0;
    while start < n {
        let stop = (start + batchsize).min(n);
        {
            let writer = DisjointWriter::new(batch.as_flat_mut());
            pool.parallel_for(Partition::fixed(stop - start), |range, _| {
                for i in range {
                    for (j, x) in data.get(start + i).iter().enumerate() {
                        // SAFETY: batch row `i` belongs to one worker.
                        unsafe { writer.write(i * dims + j, x.to_f32()) };
                    }
                }
            })?;
        }
        // The batch buffer may be longer than the final chunk; narrow it.
        let chunk = if stop - start == batchsize {
            kmeans::assign(&batch, centroids, distance, batchsize, pool)?
        } else {
            let narrowed = narrow(&batch, stop - start);
            kmeans::assign(&narrowed, centroids, distance, batchsize, pool)?
        };
        assignments.extend(chunk);
        start = stop;
    }
    Ok(assignments)
}

fn narrow(data: &SimpleDataset<f32>, rows: usize) -> SimpleDataset<f32> {
    let dims = data.dimensions();
    let mut out = SimpleDataset::<f32>::new(rows, dims);
    out.as_flat_mut()
        .copy_from_slice(&data.as_flat()[..rows * dims]);
    out
}

enum ClusterStorage<T: Element> {
    Dense(Vec<SimpleDataset<T>>),
    Sparse(SimpleDataset<T>),
}

impl<T: Element> ClusterStorage<T> {
    /// The full-precision row of cell member `local` in `cell`.
    #[inline]
    fn row<'a>(&'a self, cell: usize, local: usize, ids: &[Vec<u32>]) -> &'a [T] {
        match self {
            ClusterStorage::Dense(cells) => cells[cell].get(local),
            ClusterStorage::Sparse(data) => data.get(ids[cell][local] as usize),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct RootBody {
    eltype: DataType,
    dims: u64,
    num_vectors: u64,
    num_clusters: u64,
    distance: DistanceTag,
    build_params: IvfBuildParameters,
    search_params: IvfSearchParameters,
    centroids: BinaryArtifact,
    quantizer: Option<ScalarQuantizer>,
    archive_checksum: u32,
    ids_checksum: u32,
}

/// IVF index: centroids, per-cell members, optional quantized codes.
pub struct IvfIndex<T: Element, M: Metric<T>> {
    centroids: SimpleDataset<f32>,
    centroid_norms: Vec<f32>,
    ids: Vec<Vec<u32>>,
    storage: ClusterStorage<T>,
    codes: Option<(ScalarQuantizer, Vec<SimpleDataset<i8>>)>,
    metric: M,
    distance: DistanceTag,
    build_params: IvfBuildParameters,
    search_params: IvfSearchParameters,
    num_vectors: usize,
    pool: ThreadPool,
}

impl<T: Element, M: Metric<T>> IvfIndex<T, M> {
    /// Trains a clustering over `data` and builds the index.
    ///
    /// # Errors
    ///
    /// Returns configuration errors (empty dataset, undersized training
    /// set) and propagates worker panics.
    pub fn build(
        data: SimpleDataset<T>,
        metric: M,
        distance: DistanceTag,
        params: IvfBuildParameters,
        num_threads: usize,
    ) -> Result<Self> {
        if data.is_empty() || data.dimensions() == 0 {
            return Err(IndexError::EmptyIndex.into());
        }
        let mut pool = ThreadPool::new(num_threads)?;
        let clustering = Clustering::train(&params, &data, distance, &mut pool)?;
        Self::from_clustering(data, clustering, metric, distance, params, pool)
    }

    /// Assembles the index from a pre-computed clustering.
    ///
    /// # Errors
    ///
    /// Propagates worker panics from quantizer training.
    pub fn from_clustering(
        data: SimpleDataset<T>,
        clustering: Clustering,
        metric: M,
        distance: DistanceTag,
        params: IvfBuildParameters,
        mut pool: ThreadPool,
    ) -> Result<Self> {
        let Clustering {
            centroids,
            assignments: ids,
        } = clustering;
        let dims = data.dimensions();
        let num_vectors = data.size();

        let codes = if params.quantize {
            let quantizer = ScalarQuantizer::train(&data, &mut pool)?;
            let mut per_cell = Vec::with_capacity(ids.len());
            for cell in &ids {
                let mut cell_codes = SimpleDataset::<i8>::new(cell.len(), dims);
                for (local, &global) in cell.iter().enumerate() {
                    let row = data.get(global as usize);
                    for (j, x) in row.iter().enumerate() {
                        cell_codes.get_mut(local)[j] = quantizer.encode(x.to_f32());
                    }
                }
                per_cell.push(cell_codes);
            }
            Some((quantizer, per_cell))
        } else {
            None
        };

        let storage = match params.layout {
            ClusterLayout::Sparse => ClusterStorage::Sparse(data),
            ClusterLayout::Dense => {
                let mut cells = Vec::with_capacity(ids.len());
                for cell in &ids {
                    let mut cell_data = SimpleDataset::<T>::new(cell.len(), dims);
                    for (local, &global) in cell.iter().enumerate() {
                        cell_data.set(local, data.get(global as usize));
                    }
                    cells.push(cell_data);
                }
                ClusterStorage::Dense(cells)
            }
        };

        let centroid_norms = centroids
            .as_flat()
            .chunks(dims)
            .map(norm_square)
            .collect();

        Ok(Self {
            centroids,
            centroid_norms,
            ids,
            storage,
            codes,
            metric,
            distance,
            build_params: params,
            search_params: IvfSearchParameters::default(),
            num_vectors,
            pool,
        })
    }

    /// Number of indexed vectors.
    #[must_use]
    pub fn size(&self) -> usize {
        self.num_vectors
    }

    /// Vector dimensionality.
    #[must_use]
    pub fn dimensions(&self) -> usize {
        self.centroids.dimensions()
    }

    /// Number of cells.
    #[must_use]
    pub fn num_clusters(&self) -> usize {
        self.ids.len()
    }

    /// The distance tag this index was built with.
    #[must_use]
    pub fn distance(&self) -> DistanceTag {
        self.distance
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

    /// Number of cells probed per query.
    #[must_use]
    pub fn n_probes(&self) -> usize {
        self.search_params.n_probes
    }

    /// Sets the probe count.
    pub fn set_n_probes(&mut self, n_probes: usize) {
        self.search_params.n_probes = n_probes.max(1);
    }

    /// The rerank expansion factor.
    #[must_use]
    pub fn k_reorder(&self) -> f32 {
        self.search_params.k_reorder
    }

    /// Sets the rerank expansion factor (clamped to at least 1.0).
    pub fn set_k_reorder(&mut self, k_reorder: f32) {
        self.search_params.k_reorder = k_reorder.max(1.0);
    }

    /// Searches for the `k` nearest neighbors of each query row.
    ///
    /// # Errors
    ///
    /// Returns a dimension error for misshapen input; propagates worker
    /// panics.
    pub fn search(&mut self, queries: &[f32], k: usize) -> Result<QueryResult> {
        let dims = self.dimensions();
        if dims == 0 || queries.len() % dims != 0 {
            return Err(IndexError::QueryDimensionMismatch {
                expected: dims,
                actual: queries.len(),
            }
            .into());
        }
        let num_queries = queries.len() / dims;
        let num_cells = self.num_clusters();
        let mut result = QueryResult::new(num_queries, k);
        if num_queries == 0 || k == 0 {
            return Ok(result);
        }

        // Phase 1: (queries x centroids) dot products, centroid-striped
        // across workers.
        let mut scores = vec![0.0f32; num_queries * num_cells];
        {
            let writer = DisjointWriter::new(&mut scores);
            let centroids = &self.centroids;
            self.pool.parallel_for(Partition::fixed(num_cells), |strip, _| {
                let width = strip.len();
                let mut local = vec![0.0f32; num_queries * width];
                kmeans::matmul(
                    queries,
                    &centroids.as_flat()[strip.start * dims..strip.end * dims],
                    &mut local,
                    num_queries,
                    width,
                    dims,
                );
                for q in 0..num_queries {
                    for (offset, c) in strip.clone().enumerate() {
                        // SAFETY: centroid strips are disjoint across
                        // workers.
                        unsafe { writer.write(q * num_cells + c, local[q * width + offset]) };
                    }
                }
            })?;
        }

        // Phase 2: per query, pick probes, scan their members, rerank.
        let is_l2 = matches!(self.distance, DistanceTag::L2);
        let n_probes = self.search_params.n_probes.max(1).min(num_cells);
        let reorder_k = ((self.search_params.k_reorder.max(1.0)) * k as f32).ceil() as usize;

        let centroid_norms = &self.centroid_norms;
        let ids = &self.ids;
        let storage = &self.storage;
        let codes = &self.codes;
        let metric_proto = &self.metric;
        let scores_ref = &scores;
        let distance_tag = self.distance;

        {
            let (out_ids, out_distances) = result.parts_mut();
            let ids_writer = DisjointWriter::new(out_ids);
            let dist_writer = DisjointWriter::new(out_distances);

            self.pool
                .parallel_for(Partition::fixed(num_queries), |range, _| {
                    let mut metric = metric_proto.clone();
                    let mut compressed = codes
                        .as_ref()
                        .map(|(quantizer, _)| CompressedScan::new(*quantizer, distance_tag));
                    let mut probe_buffer = SearchBuffer::<M::Order>::new(n_probes);
                    let mut scan_buffer = SearchBuffer::<M::Order>::new(reorder_k.max(k));
                    let mut rerank_buffer = SearchBuffer::<M::Order>::new(k);
                    let mut locator: HashMap<u32, (u32, u32)> = HashMap::new();

                    for q in range {
                        let query = &queries[q * dims..(q + 1) * dims];
                        metric.fix_argument(query);
                        if let Some(scan) = compressed.as_mut() {
                            scan.fix(query);
                        }

                        // Probe selection from the score row.
                        probe_buffer.clear();
                        let row = &scores_ref[q * num_cells..(q + 1) * num_cells];
                        let query_norm = if is_l2 { norm_square(query) } else { 0.0 };
                        for (c, &dot) in row.iter().enumerate() {
                            let score = if is_l2 {
                                query_norm + centroid_norms[c] - 2.0 * dot
                            } else {
                                dot
                            };
                            probe_buffer.insert(c as u32, score);
                        }
                        probe_buffer.sort();

                        // Cell scans.
                        scan_buffer.clear();
                        locator.clear();
                        for p in 0..probe_buffer.size() {
                            let cell = probe_buffer.get(p).id as usize;
                            for local in 0..ids[cell].len() {
                                let global = ids[cell][local];
                                let distance = match (codes, compressed.as_ref()) {
                                    (Some((_, cell_codes)), Some(scan)) => {
                                        scan.compute(cell_codes[cell].get(local))
                                    }
                                    _ => metric
                                        .compute(storage.row(cell, local, ids)),
                                };
                                let pos = scan_buffer.insert(global, distance);
                                if pos < scan_buffer.capacity() {
                                    locator.insert(global, (cell as u32, local as u32));
                                }
                            }
                        }
                        scan_buffer.sort();

                        // Rerank quantized scans at full precision.
                        let final_neighbors = if codes.is_some() && reorder_k > k {
                            rerank_buffer.clear();
                            for slot in 0..scan_buffer.size() {
                                let candidate = scan_buffer.get(slot);
                                let Some(&(cell, local)) = locator.get(&candidate.id) else {
                                    continue;
                                };
                                let exact = metric.compute(storage.row(
                                    cell as usize,
                                    local as usize,
                                    ids,
                                ));
                                rerank_buffer.insert(candidate.id, exact);
                            }
                            rerank_buffer.sort();
                            rerank_buffer.top_k(k)
                        } else {
                            scan_buffer.top_k(k)
                        };

                        for (slot, neighbor) in final_neighbors.into_iter().enumerate() {
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

    /// Saves the index: centroid artifact, member archive, id and offset
    /// tables, and the root save table.
    ///
    /// # Errors
    ///
    /// Propagates serialization and filesystem failures.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let ctx = SaveContext::new(dir)?;
        let dims = self.dimensions();

        let centroids = save_dataset(&ctx, "centroids", &self.centroids)?;

        // Member vectors, one bundle entry per cell.
        let mut archive = BundleWriter::create(&dir.join(CLUSTERS_ARCHIVE))?;
        for (cell, members) in self.ids.iter().enumerate() {
            let mut bytes: Vec<u8> =
                Vec::with_capacity(members.len() * dims * std::mem::size_of::<T>());
            for local in 0..members.len() {
                bytes.extend_from_slice(bytemuck::cast_slice(self.storage.row(
                    cell,
                    local,
                    &self.ids,
                )));
            }
            archive.append(&format!("cluster_{cell}"), &bytes)?;
        }
        archive.finish()?;
        let archive_checksum = crate::data::io::checksum_file(&dir.join(CLUSTERS_ARCHIVE))?;

        // Flattened ids plus the offset tables addressing them.
        let mut ids_bytes: Vec<u8> = Vec::new();
        let mut sizes_bytes: Vec<u8> = Vec::new();
        let mut offsets_bytes: Vec<u8> = Vec::new();
        let mut offset = 0u64;
        for members in &self.ids {
            offsets_bytes.extend_from_slice(&offset.to_le_bytes());
            sizes_bytes.extend_from_slice(&(members.len() as u64).to_le_bytes());
            for &id in members {
                ids_bytes.extend_from_slice(&id.to_le_bytes());
            }
            offset += members.len() as u64;
        }
        std::fs::write(dir.join(IDS_FILE), &ids_bytes)?;
        std::fs::write(dir.join(SIZES_FILE), &sizes_bytes)?;
        std::fs::write(dir.join(OFFSETS_FILE), &offsets_bytes)?;
        let ids_checksum = crate::data::io::checksum_file(&dir.join(IDS_FILE))?;

        let root = RootBody {
            eltype: T::DATA_TYPE,
            dims: dims as u64,
            num_vectors: self.num_vectors as u64,
            num_clusters: self.num_clusters() as u64,
            distance: self.distance,
            build_params: self.build_params.clone(),
            search_params: self.search_params,
            centroids,
            quantizer: self.codes.as_ref().map(|(quantizer, _)| *quantizer),
            archive_checksum,
            ids_checksum,
        };
        SaveTable::new(INDEX_SCHEMA, SAVE_VERSION, &root)?.write(ctx.dir())?;
        Ok(())
    }

    /// Loads an index saved by [`IvfIndex::save`]. The loaded index uses
    /// the dense cell layout.
    ///
    /// # Errors
    ///
    /// Returns schema/version/type mismatches and checksum failures from
    /// the save protocol.
    pub fn load(
        dir: &Path,
        metric: M,
        expected_distance: DistanceTag,
        num_threads: usize,
    ) -> Result<Self> {
        let root: RootBody = SaveTable::read(dir)?.load_object(INDEX_SCHEMA, SAVE_VERSION)?;
        if root.eltype != T::DATA_TYPE {
            return Err(crate::saveload::SerializationError::TypeMismatch {
                expected: T::DATA_TYPE,
                found: root.eltype,
            }
            .into());
        }
        if root.distance != expected_distance {
            return Err(VesprError::Config(format!(
                "index was saved with distance {}, loader expected {}",
                root.distance, expected_distance
            )));
        }
        let dims = root.dims as usize;
        let num_clusters = root.num_clusters as usize;

        let found = crate::data::io::checksum_file(&dir.join(CLUSTERS_ARCHIVE))?;
        if found != root.archive_checksum {
            return Err(crate::saveload::SerializationError::ChecksumMismatch {
                file: CLUSTERS_ARCHIVE.into(),
                expected: root.archive_checksum,
                found,
            }
            .into());
        }
        let found = crate::data::io::checksum_file(&dir.join(IDS_FILE))?;
        if found != root.ids_checksum {
            return Err(crate::saveload::SerializationError::ChecksumMismatch {
                file: IDS_FILE.into(),
                expected: root.ids_checksum,
                found,
            }
            .into());
        }

        let centroids = load_dataset::<f32>(dir, &root.centroids)?;

        // Offset tables first, then the flat id file split by them.
        let sizes_bytes = std::fs::read(dir.join(SIZES_FILE))?;
        let sizes: Vec<u64> = sizes_bytes
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap_or([0; 8])))
            .collect();
        if sizes.len() != num_clusters {
            return Err(VesprError::Config(
                "cluster size table disagrees with root table".into(),
            ));
        }
        let ids_bytes = std::fs::read(dir.join(IDS_FILE))?;
        let flat_ids: Vec<u32> = ids_bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap_or([0; 4])))
            .collect();
        let mut ids: Vec<Vec<u32>> = Vec::with_capacity(num_clusters);
        let mut cursor = 0usize;
        for &size in &sizes {
            let stop = cursor + size as usize;
            ids.push(flat_ids[cursor..stop].to_vec());
            cursor = stop;
        }

        // Member vectors from the archive, in cell order.
        let mut reader = BundleReader::open(&dir.join(CLUSTERS_ARCHIVE))?;
        let mut cells: Vec<SimpleDataset<T>> = Vec::with_capacity(num_clusters);
        while let Some((_, bytes)) = reader.next_entry()? {
            // pod_collect copies, so the byte buffer's alignment is
            // irrelevant.
            let elements: Vec<T> = bytemuck::pod_collect_to_vec(&bytes);
            cells.push(SimpleDataset::from_vec(elements, dims.max(1))?);
        }
        if cells.len() != num_clusters {
            return Err(VesprError::Config(
                "cluster archive disagrees with root table".into(),
            ));
        }

        let codes = match root.quantizer {
            Some(quantizer) => {
                let mut per_cell = Vec::with_capacity(num_clusters);
                for cell_data in &cells {
                    let mut cell_codes =
                        SimpleDataset::<i8>::new(cell_data.size(), dims);
                    for local in 0..cell_data.size() {
                        for (j, x) in cell_data.get(local).iter().enumerate() {
                            cell_codes.get_mut(local)[j] = quantizer.encode(x.to_f32());
                        }
                    }
                    per_cell.push(cell_codes);
                }
                Some((quantizer, per_cell))
            }
            None => None,
        };

        let centroid_norms = centroids
            .as_flat()
            .chunks(dims)
            .map(norm_square)
            .collect();

        Ok(Self {
            centroids,
            centroid_norms,
            ids,
            storage: ClusterStorage::Dense(cells),
            codes,
            metric,
            distance: root.distance,
            build_params: root.build_params,
            search_params: root.search_params,
            num_vectors: root.num_vectors as usize,
            pool: ThreadPool::new(num_threads)?,
        })
    }
}

/// Compressed-domain scan state: one of the three quantized distance
/// functors, selected by tag and fixed per query.
enum CompressedScan {
    L2(crate::quantization::CompressedL2),
    Ip(crate::quantization::CompressedInnerProduct),
    Cosine(crate::quantization::CompressedCosine),
}

impl CompressedScan {
    fn new(quantizer: ScalarQuantizer, tag: DistanceTag) -> Self {
        match tag {
            DistanceTag::L2 => {
                CompressedScan::L2(crate::quantization::CompressedL2::new(quantizer))
            }
            DistanceTag::InnerProduct => {
                CompressedScan::Ip(crate::quantization::CompressedInnerProduct::new(quantizer))
            }
            DistanceTag::Cosine => {
                CompressedScan::Cosine(crate::quantization::CompressedCosine::new(quantizer))
            }
        }
    }

    fn fix(&mut self, query: &[f32]) {
        match self {
            CompressedScan::L2(f) => Metric::<i8>::fix_argument(f, query),
            CompressedScan::Ip(f) => Metric::<i8>::fix_argument(f, query),
            CompressedScan::Cosine(f) => Metric::<i8>::fix_argument(f, query),
        }
    }

    fn compute(&self, codes: &[i8]) -> f32 {
        match self {
            CompressedScan::L2(f) => Metric::<i8>::compute(f, codes),
            CompressedScan::Ip(f) => Metric::<i8>::compute(f, codes),
            CompressedScan::Cosine(f) => Metric::<i8>::compute(f, codes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::L2;
    use rand::Rng;

    fn blob_dataset(n_per_blob: usize) -> SimpleDataset<f32> {
        let centers = [[0.0f32, 0.0], [20.0, 0.0], [0.0, 20.0], [20.0, 20.0]];
        let mut rng = <ChaCha8Rng as rand::SeedableRng>::seed_from_u64(99);
        let mut rows = Vec::new();
        for center in centers {
            for _ in 0..n_per_blob {
                rows.push(vec![
                    center[0] + rng.gen::<f32>(),
                    center[1] + rng.gen::<f32>(),
                ]);
            }
        }
        SimpleDataset::from_rows(&rows).unwrap()
    }

    fn small_params(num_centroids: usize) -> IvfBuildParameters {
        IvfBuildParameters {
            num_centroids,
            minibatch_size: 64,
            num_iterations: 6,
            is_hierarchical: false,
            training_fraction: 1.0,
            hierarchical_level1_clusters: 0,
            ..IvfBuildParameters::default()
        }
    }

    #[test]
    fn test_clustering_partitions_dataset() {
        let mut pool = ThreadPool::new(2).unwrap();
        let data = blob_dataset(25);
        let clustering =
            Clustering::train(&small_params(4), &data, DistanceTag::L2, &mut pool).unwrap();

        // Every source id appears in exactly one assignment list.
        let mut seen = vec![0u32; data.size()];
        for cell in &clustering.assignments {
            for &id in cell {
                seen[id as usize] += 1;
            }
        }
        assert!(seen.iter().all(|&c| c == 1));

        let stats = clustering.statistics();
        assert_eq!(stats.num_clusters, 4);
        assert_eq!(stats.num_leaves, data.size());
        assert_eq!(stats.empty_clusters, 0);
    }

    #[test]
    fn test_search_finds_blob_members() {
        let data = blob_dataset(25);
        let mut index = IvfIndex::build(
            data,
            L2::new(),
            DistanceTag::L2,
            small_params(4),
            2,
        )
        .unwrap();
        index.set_n_probes(1);

        // A query at a blob center must return members of that blob:
        // ids 50..75 belong to the (0, 20) blob.
        let result = index.search(&[0.5, 20.5], 5).unwrap();
        for &id in result.ids_row(0) {
            assert!((50..75).contains(&id), "unexpected id {id}");
        }
    }

    #[test]
    fn test_more_probes_reach_more_cells() {
        let data = blob_dataset(25);
        let mut index = IvfIndex::build(
            data,
            L2::new(),
            DistanceTag::L2,
            small_params(4),
            2,
        )
        .unwrap();

        // A query between blobs with k larger than one cell: one probe
        // cannot fill k, all probes can.
        index.set_n_probes(1);
        let one = index.search(&[10.0, 10.0], 40).unwrap();
        let filled_one = one.ids_row(0)
            .iter()
            .filter(|&&id| id != QueryResult::SENTINEL_ID)
            .count();
        assert!(filled_one <= 30, "single probe returned {filled_one}");

        index.set_n_probes(4);
        let all = index.search(&[10.0, 10.0], 40).unwrap();
        let filled_all = all.ids_row(0)
            .iter()
            .filter(|&&id| id != QueryResult::SENTINEL_ID)
            .count();
        assert_eq!(filled_all, 40);
    }

    #[test]
    fn test_sparse_layout_matches_dense() {
        let data = blob_dataset(20);
        let mut dense = IvfIndex::build(
            data.copy(),
            L2::new(),
            DistanceTag::L2,
            small_params(4),
            1,
        )
        .unwrap();
        let mut sparse_params = small_params(4);
        sparse_params.layout = ClusterLayout::Sparse;
        let mut sparse =
            IvfIndex::build(data, L2::new(), DistanceTag::L2, sparse_params, 1).unwrap();

        dense.set_n_probes(4);
        sparse.set_n_probes(4);
        let q = [20.3, 0.4];
        let a = dense.search(&q, 7).unwrap();
        let b = sparse.search(&q, 7).unwrap();
        assert_eq!(a.ids_row(0), b.ids_row(0));
    }

    #[test]
    fn test_quantized_scan_with_rerank() {
        let data = blob_dataset(25);
        let mut exact = IvfIndex::build(
            data.copy(),
            L2::new(),
            DistanceTag::L2,
            small_params(4),
            2,
        )
        .unwrap();
        let mut q_params = small_params(4);
        q_params.quantize = true;
        let mut quantized =
            IvfIndex::build(data, L2::new(), DistanceTag::L2, q_params, 2).unwrap();

        exact.set_n_probes(4);
        quantized.set_n_probes(4);
        quantized.set_k_reorder(3.0);

        let q = [0.5, 0.5];
        let truth = exact.search(&q, 5).unwrap();
        let approx = quantized.search(&q, 5).unwrap();
        // With reranking at full precision, the top-5 must agree.
        assert_eq!(truth.ids_row(0), approx.ids_row(0));
    }

    #[test]
    fn test_k_reorder_clamped() {
        let data = blob_dataset(10);
        let mut index = IvfIndex::build(
            data,
            L2::new(),
            DistanceTag::L2,
            small_params(2),
            1,
        )
        .unwrap();
        index.set_k_reorder(0.25);
        assert_eq!(index.k_reorder(), 1.0);
    }
}
