//! Dynamic Vamana: insert, delete, consolidate, compact.
//!
//! The dynamic index pairs a blocked dataset with a blocked graph so both
//! grow by appending blocks, and keeps a bidirectional map between
//! caller-visible external ids and internal slots.
//!
//! Deletion is two-phase. `delete` only tombstones the slot: searches keep
//! traversing it (preserving graph connectivity, and with it recall) but
//! never return it. `consolidate` then relinks every live vertex that
//! points at a tombstone and releases the slots for reuse; `compact`
//! renumbers the live slots into a contiguous prefix and shrinks both
//! containers.
//!
//! All mutating operations take `&mut self`; the borrow checker enforces
//! the single-writer/no-concurrent-reader discipline the algorithms
//! assume.

use super::build::search_and_prune;
use super::dynamic_buffer::MutableBuffer;
use super::filter::VisitedFilter;
use super::greedy::greedy_search;
use super::prune::{robust_prune, PruneScratch, PruneStrategy};
use super::{VamanaBuildParameters, VamanaSearchParameters};
use crate::data::{BlockedDataset, SimpleDataset, VectorData};
use crate::datatype::{widen_into, DataType, Element};
use crate::distance::{DistanceTag, Metric};
use crate::error::{Result, VesprError};
use crate::graph::{BlockedGraph, GraphView};
use crate::index::{IndexError, QueryResult};
use crate::neighbor::Neighbor;
use crate::saveload::{
    load_dataset, save_dataset, BinaryArtifact, SaveContext, SaveTable, Version,
};
use crate::threads::{DisjointWriter, Partition, SharedMut, ThreadPool};
use bitvec::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const INDEX_SCHEMA: &str = "dynamic_vamana_index";
const CONFIG_SCHEMA: &str = "dynamic_vamana_config";
const GRAPH_SCHEMA: &str = "graph";
const DATA_SCHEMA: &str = "dense_dataset";
const SAVE_VERSION: Version = Version::new(0, 0, 1);

/// Rows moved per batch during compaction.
const COMPACT_BATCHSIZE: usize = 1024;

/// Default block byte target for incremental indexes. Much smaller than
/// the dataset container's 1 GiB default: a dynamic index starts empty
/// and grows one block at a time, so the first insert must not commit
/// gigabytes. [`DynamicVamanaIndex::with_blocksize`] overrides this.
pub const DYNAMIC_BLOCKSIZE_BYTES: usize = 1 << 22;

/// Slot states persisted in the id-map artifact.
const SLOT_FREE: u32 = u32::MAX;
const SLOT_DELETED: u32 = u32::MAX - 1;

/// Bidirectional map between external ids and internal slots, with
/// tombstones and a free list.
#[derive(Debug, Default)]
pub struct IdTranslator {
    external_to_internal: HashMap<u32, u32>,
    internal_to_external: Vec<Option<u32>>,
    deleted: BitVec,
    free_slots: Vec<u32>,
}

impl IdTranslator {
    /// An empty translator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (mapped, non-deleted) ids.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.external_to_internal.len()
    }

    /// Number of slots, live or not.
    #[must_use]
    pub fn total_slots(&self) -> usize {
        self.internal_to_external.len()
    }

    /// Whether `external` is currently mapped.
    #[must_use]
    pub fn contains(&self, external: u32) -> bool {
        self.external_to_internal.contains_key(&external)
    }

    /// The slot for `external`, if mapped.
    #[must_use]
    pub fn to_internal(&self, external: u32) -> Option<u32> {
        self.external_to_internal.get(&external).copied()
    }

    /// The external id stored in `slot`, if live.
    #[must_use]
    pub fn to_external(&self, slot: u32) -> Option<u32> {
        self.internal_to_external
            .get(slot as usize)
            .copied()
            .flatten()
    }

    /// Whether `slot` carries a tombstone.
    #[must_use]
    pub fn is_deleted(&self, slot: u32) -> bool {
        self.deleted
            .get(slot as usize)
            .map(|b| *b)
            .unwrap_or(false)
    }

    /// Maps `external` to a slot, reusing the free list or appending.
    /// Returns `(slot, grew)`.
    fn assign(&mut self, external: u32) -> (u32, bool) {
        debug_assert!(!self.contains(external));
        if let Some(slot) = self.free_slots.pop() {
            self.internal_to_external[slot as usize] = Some(external);
            self.deleted.set(slot as usize, false);
            self.external_to_internal.insert(external, slot);
            (slot, false)
        } else {
            let slot = self.internal_to_external.len() as u32;
            self.internal_to_external.push(Some(external));
            self.deleted.push(false);
            self.external_to_internal.insert(external, slot);
            (slot, true)
        }
    }

    /// Tombstones `external`'s slot and unmaps it.
    fn delete(&mut self, external: u32) -> std::result::Result<u32, IndexError> {
        let slot = self
            .external_to_internal
            .remove(&external)
            .ok_or(IndexError::UnknownId(external))?;
        self.internal_to_external[slot as usize] = None;
        self.deleted.set(slot as usize, true);
        Ok(slot)
    }

    /// Returns a tombstoned slot to the free list.
    fn release(&mut self, slot: u32) {
        debug_assert!(self.is_deleted(slot));
        self.deleted.set(slot as usize, false);
        self.free_slots.push(slot);
    }

    /// The tombstoned slots, ascending.
    fn tombstones(&self) -> Vec<u32> {
        self.deleted.iter_ones().map(|s| s as u32).collect()
    }

    /// Live slots in ascending order.
    fn live_slots(&self) -> Vec<u32> {
        (0..self.total_slots() as u32)
            .filter(|&s| self.internal_to_external[s as usize].is_some())
            .collect()
    }
}

#[derive(Serialize, Deserialize)]
struct RootBody {
    eltype: DataType,
    dims: u64,
    num_slots: u64,
    num_live: u64,
}

#[derive(Serialize, Deserialize)]
struct ConfigBody {
    distance: DistanceTag,
    entry_point: u32,
    build_params: VamanaBuildParameters,
    search_params: VamanaSearchParameters,
    id_map: BinaryArtifact,
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

/// Vamana index supporting incremental insert and two-phase delete.
pub struct DynamicVamanaIndex<T: Element, M: Metric<T>> {
    data: BlockedDataset<T>,
    graph: BlockedGraph,
    translator: IdTranslator,
    metric: M,
    distance: DistanceTag,
    entry_point: u32,
    build_params: VamanaBuildParameters,
    search_params: VamanaSearchParameters,
    pool: ThreadPool,
}

impl<T: Element, M: Metric<T>> DynamicVamanaIndex<T, M> {
    /// Creates an empty dynamic index for `dimensions`-wide vectors.
    ///
    /// # Errors
    ///
    /// Returns configuration errors for invalid parameters.
    pub fn new(
        dimensions: usize,
        metric: M,
        distance: DistanceTag,
        params: VamanaBuildParameters,
        num_threads: usize,
    ) -> Result<Self> {
        Self::with_blocksize(
            dimensions,
            metric,
            distance,
            params,
            DYNAMIC_BLOCKSIZE_BYTES,
            num_threads,
        )
    }

    /// Creates an empty dynamic index with an explicit block byte target
    /// for the backing dataset and graph.
    ///
    /// # Errors
    ///
    /// Returns configuration errors for invalid parameters.
    pub fn with_blocksize(
        dimensions: usize,
        metric: M,
        distance: DistanceTag,
        params: VamanaBuildParameters,
        blocksize_bytes: usize,
        num_threads: usize,
    ) -> Result<Self> {
        if dimensions == 0 {
            return Err(VesprError::Config("dimensionality must be positive".into()));
        }
        let search_params = VamanaSearchParameters {
            search_window_size: params.window_size,
            ..VamanaSearchParameters::default()
        };
        Ok(Self {
            data: BlockedDataset::with_blocksize(0, dimensions, blocksize_bytes)?,
            graph: BlockedGraph::with_blocksize(0, params.graph_max_degree, blocksize_bytes)?,
            translator: IdTranslator::new(),
            metric,
            distance,
            entry_point: 0,
            build_params: params,
            search_params,
            pool: ThreadPool::new(num_threads)?,
        })
    }

    /// Live vector count.
    #[must_use]
    pub fn size(&self) -> usize {
        self.translator.live_count()
    }

    /// Vector dimensionality.
    #[must_use]
    pub fn dimensions(&self) -> usize {
        self.data.dimensions()
    }

    /// Slots currently allocated, live or not.
    #[must_use]
    pub fn capacity_slots(&self) -> usize {
        self.translator.total_slots()
    }

    /// Whether `external` is present and live.
    #[must_use]
    pub fn contains(&self, external: u32) -> bool {
        self.translator.contains(external)
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

    /// The underlying graph (read-only).
    #[must_use]
    pub fn graph(&self) -> &BlockedGraph {
        &self.graph
    }

    fn resolved_strategy(&self) -> PruneStrategy {
        self.build_params.resolve_strategy(self.distance)
    }

    /// Inserts `vector` under `external`.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::DuplicateId`] if `external` is live and a
    /// dimension error for misshapen input. On error the index is
    /// unchanged.
    pub fn insert(&mut self, external: u32, vector: &[T]) -> Result<()> {
        if vector.len() != self.data.dimensions() {
            return Err(IndexError::QueryDimensionMismatch {
                expected: self.data.dimensions(),
                actual: vector.len(),
            }
            .into());
        }
        if self.translator.contains(external) {
            return Err(IndexError::DuplicateId(external).into());
        }

        let (slot, grew) = self.translator.assign(external);
        if grew {
            self.data.resize(slot as usize + 1)?;
            self.graph.resize(slot as usize + 1)?;
        }
        self.data.set(slot as usize, vector);
        self.graph.clear_node(slot);

        // First live vector: nothing to link against.
        if self.translator.live_count() == 1 {
            self.entry_point = slot;
            return Ok(());
        }

        let strategy = self.resolved_strategy();
        let mut metric = self.metric.clone();
        let mut buffer = MutableBuffer::<M::Order>::new(self.build_params.window_size);
        let mut filter = VisitedFilter::new(
            self.search_params
                .visited_filter_bits
                .unwrap_or(VisitedFilter::DEFAULT_BITS),
        );
        let mut scratch = PruneScratch::default();
        let mut pruned = Vec::new();
        let translator = &self.translator;

        search_and_prune(
            &self.graph,
            &self.data,
            &mut metric,
            &self.build_params,
            strategy,
            slot,
            &[self.entry_point],
            &mut buffer,
            &mut filter,
            |s| translator.is_deleted(s),
            &mut scratch,
            &mut pruned,
        );
        self.graph.replace_node(slot, &pruned);

        // Back edges, re-pruning any vertex pushed past its bound.
        let mut query = Vec::new();
        let mut candidates: Vec<Neighbor> = Vec::new();
        for &target in &pruned {
            let degree = self.graph.add_edge(target, slot);
            if degree < self.build_params.graph_max_degree
                || self.graph.has_edge(target, slot)
            {
                continue;
            }
            // Full and the new edge did not fit: rebuild the target's
            // list from its neighbors plus the new vertex.
            widen_into(self.data.get(target as usize), &mut query);
            metric.fix_argument(&query);
            candidates.clear();
            for &n in self.graph.neighbors(target) {
                candidates.push(Neighbor::new(
                    n,
                    metric.compute(self.data.get(n as usize)),
                ));
            }
            candidates.push(Neighbor::new(
                slot,
                metric.compute(self.data.get(slot as usize)),
            ));
            crate::neighbor::sort_neighbors::<M::Order>(&mut candidates);
            let mut replacement = Vec::new();
            robust_prune(
                strategy,
                self.build_params.alpha,
                self.build_params.prune_to,
                &self.data,
                &mut metric,
                target,
                &candidates,
                &mut scratch,
                &mut replacement,
            );
            self.graph.replace_node(target, &replacement);
        }

        Ok(())
    }

    /// Tombstones `external`. The vector stays in the graph for routing
    /// until [`DynamicVamanaIndex::consolidate`] runs.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::UnknownId`] if `external` is not live.
    pub fn delete(&mut self, external: u32) -> Result<()> {
        self.translator.delete(external)?;
        Ok(())
    }

    /// Relinks live vertices around tombstoned slots and returns those
    /// slots to the free list. Afterwards no live adjacency list
    /// references a deleted slot.
    ///
    /// # Errors
    ///
    /// Propagates worker panics.
    pub fn consolidate(&mut self) -> Result<()> {
        let tombstones = self.translator.tombstones();
        if tombstones.is_empty() {
            return Ok(());
        }

        let strategy = self.resolved_strategy();
        let total = self.translator.total_slots();
        let nthreads = self.pool.size();
        let updates: Vec<std::sync::Mutex<Vec<(u32, Vec<u32>)>>> =
            (0..nthreads).map(|_| std::sync::Mutex::new(Vec::new())).collect();

        {
            let graph = &self.graph;
            let data = &self.data;
            let translator = &self.translator;
            let params = &self.build_params;
            let metric_proto = &self.metric;

            self.pool.parallel_for(Partition::fixed(total), |range, tid| {
                let mut metric = metric_proto.clone();
                let mut query = Vec::new();
                let mut scratch = PruneScratch::default();
                let mut candidates: Vec<Neighbor> = Vec::new();
                let mut staged: Vec<(u32, Vec<u32>)> = Vec::new();

                for slot in range {
                    let vertex = slot as u32;
                    if translator.to_external(vertex).is_none() {
                        continue;
                    }
                    let has_deleted_neighbor = graph
                        .neighbors(vertex)
                        .iter()
                        .any(|&n| translator.is_deleted(n));
                    if !has_deleted_neighbor {
                        continue;
                    }

                    widen_into(data.get(vertex as usize), &mut query);
                    metric.fix_argument(&query);

                    // Pool: live neighbors, then live candidates reached
                    // through deleted neighbors, extended one more hop
                    // through deleted vertices while short.
                    candidates.clear();
                    let mut seen: Vec<u32> = vec![vertex];
                    let mut frontier: Vec<u32> = Vec::new();
                    for &n in graph.neighbors(vertex) {
                        if translator.is_deleted(n) {
                            frontier.push(n);
                        } else if !seen.contains(&n) {
                            seen.push(n);
                            candidates
                                .push(Neighbor::new(n, metric.compute(data.get(n as usize))));
                        }
                    }
                    for _hop in 0..2 {
                        if candidates.len() >= params.prune_to {
                            break;
                        }
                        let mut next_frontier = Vec::new();
                        for &d in &frontier {
                            for &n in graph.neighbors(d) {
                                if seen.contains(&n) {
                                    continue;
                                }
                                if translator.is_deleted(n) {
                                    next_frontier.push(n);
                                } else {
                                    seen.push(n);
                                    candidates.push(Neighbor::new(
                                        n,
                                        metric.compute(data.get(n as usize)),
                                    ));
                                }
                            }
                        }
                        frontier = next_frontier;
                        if frontier.is_empty() {
                            break;
                        }
                    }

                    crate::neighbor::sort_neighbors::<M::Order>(&mut candidates);
                    candidates.truncate(params.max_candidate_pool_size);

                    let mut pruned = Vec::new();
                    robust_prune(
                        strategy,
                        params.alpha,
                        params.prune_to,
                        data,
                        &mut metric,
                        vertex,
                        &candidates,
                        &mut scratch,
                        &mut pruned,
                    );
                    staged.push((vertex, pruned));
                }

                let mut slot = updates[tid].lock().expect("update slot poisoned");
                slot.extend(staged);
            })?;
        }

        for thread_updates in updates {
            let thread_updates = thread_updates.into_inner().expect("update slot poisoned");
            for (vertex, list) in thread_updates {
                self.graph.replace_node(vertex, &list);
            }
        }

        for slot in tombstones {
            self.graph.clear_node(slot);
            self.translator.release(slot);
        }

        // A tombstoned entry point no longer exists; re-anchor on a live
        // vertex.
        if self.translator.to_external(self.entry_point).is_none() {
            if let Some(new_entry) = self.pick_live_entry() {
                self.entry_point = new_entry;
            }
        }
        Ok(())
    }

    /// Renumbers live slots into `[0, live_count)`, rewrites adjacency
    /// lists, moves dataset rows through a bounded batch buffer, and
    /// shrinks both containers.
    ///
    /// # Errors
    ///
    /// Propagates worker panics and allocation failures.
    pub fn compact(&mut self) -> Result<()> {
        let live = self.translator.live_slots();
        let old_total = self.translator.total_slots();
        if live.len() == old_total {
            return Ok(());
        }

        let mut old_to_new = vec![u32::MAX; old_total];
        for (new_id, &old_id) in live.iter().enumerate() {
            old_to_new[old_id as usize] = new_id as u32;
        }

        // Adjacency rewrite. Live slots ascend, so every destination row
        // index is <= its source and in-place forward processing never
        // clobbers unread rows.
        let mut remapped: Vec<u32> = Vec::new();
        for (new_id, &old_id) in live.iter().enumerate() {
            remapped.clear();
            for &n in self.graph.neighbors(old_id) {
                let mapped = old_to_new[n as usize];
                if mapped != u32::MAX {
                    remapped.push(mapped);
                }
            }
            self.graph.clear_node(new_id as u32);
            self.graph.replace_node(new_id as u32, &remapped);
        }

        // Dataset rows move through a reusable batch buffer: gather the
        // batch in parallel, then scatter it to the new positions.
        let dims = self.data.dimensions();
        let mut buffer = SimpleDataset::<T>::new(COMPACT_BATCHSIZE.min(live.len()), dims);
        let mut start = 0;
        while start < live.len() {
            let stop = (start + COMPACT_BATCHSIZE).min(live.len());
            let batch = &live[start..stop];
            {
                let data = &self.data;
                let gather = DisjointWriter::new(buffer.as_flat_mut());
                self.pool.parallel_for(Partition::fixed(batch.len()), |range, _| {
                    for i in range {
                        let row = data.get(batch[i] as usize);
                        for (j, x) in row.iter().enumerate() {
                            // SAFETY: buffer row `i` belongs to one worker.
                            unsafe { gather.write(i * dims + j, *x) };
                        }
                    }
                })?;
            }
            {
                let buffer_ref = &buffer;
                let shared = SharedMut::new(&mut self.data);
                self.pool.parallel_for(Partition::fixed(stop - start), |range, _| {
                    for i in range {
                        // SAFETY: destination rows `start + i` are distinct
                        // across workers.
                        let data = unsafe { shared.get_mut() };
                        data.set(start + i, buffer_ref.get(i));
                    }
                })?;
            }
            start = stop;
        }

        self.entry_point = old_to_new[self.entry_point as usize];
        if self.entry_point == u32::MAX {
            self.entry_point = 0;
        }

        self.data.resize(live.len())?;
        self.graph.resize(live.len())?;

        // Rebuild the translator with the new contiguous slots.
        let mut translator = IdTranslator::new();
        for &old_id in &live {
            let external = self
                .translator
                .to_external(old_id)
                .ok_or(IndexError::EmptyIndex)?;
            translator.assign(external);
        }
        self.translator = translator;
        Ok(())
    }

    /// Searches for the `k` nearest live vectors of each query row,
    /// returning external ids.
    ///
    /// # Errors
    ///
    /// Returns a dimension error for misshapen input; propagates worker
    /// panics.
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
        if k == 0 || self.translator.live_count() == 0 {
            return Ok(result);
        }
        let window = self.search_params.search_window_size.max(k);
        let entry_points = [self.entry_point];

        let graph = &self.graph;
        let data = &self.data;
        let translator = &self.translator;
        let metric_proto = &self.metric;
        let filter_bits = self.search_params.visited_filter_bits;

        {
            let (ids, distances) = result.parts_mut();
            let ids_writer = DisjointWriter::new(ids);
            let dist_writer = DisjointWriter::new(distances);

            self.pool
                .parallel_for(Partition::fixed(num_queries), |range, _| {
                    let mut metric = metric_proto.clone();
                    let mut buffer = MutableBuffer::<M::Order>::new(window);
                    let mut filter = filter_bits.map(VisitedFilter::new);

                    for q in range {
                        metric.fix_argument(&queries[q * dims..(q + 1) * dims]);
                        greedy_search(
                            graph,
                            data,
                            &metric,
                            &mut buffer,
                            &entry_points,
                            filter.as_mut(),
                            |s| translator.is_deleted(s),
                        );
                        buffer.sort();
                        for (slot, neighbor) in buffer.top_k(k).into_iter().enumerate() {
                            let Some(external) = translator.to_external(neighbor.id) else {
                                continue;
                            };
                            // SAFETY: query rows are disjoint across
                            // workers.
                            unsafe {
                                ids_writer.write(q * k + slot, external);
                                dist_writer.write(q * k + slot, neighbor.distance);
                            }
                        }
                    }
                })?;
        }
        Ok(result)
    }

    /// Picks a live entry vertex: the live row nearest the mean of a
    /// sample of live rows.
    fn pick_live_entry(&self) -> Option<u32> {
        let live = self.translator.live_slots();
        if live.is_empty() {
            return None;
        }
        let dims = self.data.dimensions();
        let sample: &[u32] = &live[..live.len().min(64 * 1024)];
        let mut mean = vec![0.0f64; dims];
        for &slot in sample {
            for (j, x) in self.data.get(slot as usize).iter().enumerate() {
                mean[j] += f64::from(x.to_f32());
            }
        }
        let inv = 1.0 / sample.len() as f64;
        let mean: Vec<f32> = mean.iter().map(|m| (m * inv) as f32).collect();

        let mut best = (f32::INFINITY, live[0]);
        for &slot in sample {
            let mut distance = 0.0f32;
            for (j, x) in self.data.get(slot as usize).iter().enumerate() {
                let d = x.to_f32() - mean[j];
                distance += d * d;
            }
            if distance < best.0 {
                best = (distance, slot);
            }
        }
        Some(best.1)
    }

    /// Saves the index: `config/` (including the id map), `graph/`, and
    /// `data/` subdirectories plus a root table.
    ///
    /// # Errors
    ///
    /// Propagates serialization and filesystem failures.
    pub fn save(&self, dir: &std::path::Path) -> Result<()> {
        let ctx = SaveContext::new(dir)?;

        let root = RootBody {
            eltype: T::DATA_TYPE,
            dims: self.dimensions() as u64,
            num_slots: self.translator.total_slots() as u64,
            num_live: self.translator.live_count() as u64,
        };
        SaveTable::new(INDEX_SCHEMA, SAVE_VERSION, &root)?.write(ctx.dir())?;

        // Id map: one u32 per slot; live slots carry their external id,
        // the rest a status sentinel.
        let total = self.translator.total_slots();
        let mut id_rows = SimpleDataset::<u32>::new(total, 1);
        for slot in 0..total as u32 {
            let value = match self.translator.to_external(slot) {
                Some(external) => external,
                None if self.translator.is_deleted(slot) => SLOT_DELETED,
                None => SLOT_FREE,
            };
            id_rows.set(slot as usize, &[value]);
        }

        let config_ctx = ctx.subdir("config")?;
        let config = ConfigBody {
            distance: self.distance,
            entry_point: self.entry_point,
            build_params: self.build_params.clone(),
            search_params: self.search_params.clone(),
            id_map: save_dataset(&config_ctx, "id_map", &id_rows)?,
        };
        SaveTable::new(CONFIG_SCHEMA, SAVE_VERSION, &config)?.write(config_ctx.dir())?;

        let graph_ctx = ctx.subdir("graph")?;
        let graph_body = GraphBody {
            artifact: save_dataset(&graph_ctx, "graph", self.graph.rows())?,
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

    /// Loads an index saved by [`DynamicVamanaIndex::save`].
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
        let root: RootBody = SaveTable::read(dir)?.load_object(INDEX_SCHEMA, SAVE_VERSION)?;
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

        let id_rows = load_dataset::<u32>(&config_dir, &config.id_map)?;
        let mut translator = IdTranslator::new();
        let total = id_rows.size();
        translator.internal_to_external = vec![None; total];
        translator.deleted = bitvec![0; total];
        for slot in 0..total {
            match id_rows.get(slot)[0] {
                SLOT_FREE => translator.free_slots.push(slot as u32),
                SLOT_DELETED => translator.deleted.set(slot, true),
                external => {
                    translator.internal_to_external[slot] = Some(external);
                    translator.external_to_internal.insert(external, slot as u32);
                }
            }
        }

        let graph_dir = dir.join("graph");
        let graph_body: GraphBody =
            SaveTable::read(&graph_dir)?.load_object(GRAPH_SCHEMA, SAVE_VERSION)?;
        let packed = load_dataset::<u32>(&graph_dir, &graph_body.artifact)?;
        let max_degree = packed.dimensions() - 1;
        let mut graph =
            BlockedGraph::with_blocksize(packed.size(), max_degree, DYNAMIC_BLOCKSIZE_BYTES)?;
        for v in 0..packed.size() {
            let row = packed.get(v);
            let len = row[0] as usize;
            graph.replace_node(v as u32, &row[1..1 + len]);
        }

        let data_dir = dir.join("data");
        let data_body: DataBody =
            SaveTable::read(&data_dir)?.load_object(DATA_SCHEMA, SAVE_VERSION)?;
        let flat = load_dataset::<T>(&data_dir, &data_body.artifact)?;
        let mut data = BlockedDataset::<T>::with_blocksize(
            flat.size(),
            flat.dimensions(),
            DYNAMIC_BLOCKSIZE_BYTES,
        )?;
        for i in 0..flat.size() {
            data.set(i, flat.get(i));
        }

        Ok(Self {
            data,
            graph,
            translator,
            metric,
            distance: config.distance,
            entry_point: config.entry_point,
            build_params: config.build_params,
            search_params: config.search_params,
            pool: ThreadPool::new(num_threads)?,
        })
    }
}
