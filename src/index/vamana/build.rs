//! Parallel Vamana graph construction.
//!
//! The build loops over the vertices in a seeded random permutation,
//! chunked into batches. Each batch runs four phases:
//!
//! 1. **Generate** (parallel): greedy-search from the entry point to
//!    gather a candidate pool per vertex, union it with the vertex's
//!    current neighbors, sort, truncate, robust-prune, and stage the new
//!    adjacency list in a per-thread update vector.
//! 2. **Apply**: install every staged list.
//! 3. **Reverse edges** (parallel): for every staged edge `v -> u`, add
//!    `u -> v` under `u`'s spin lock; when `u` is already at max degree,
//!    record the overflow in the worker's private map and raise `u`'s
//!    atomic overflow flag.
//! 4. **Re-prune** (parallel, dynamic partition): rebuild the pool of
//!    every flagged vertex from its current neighbors plus all recorded
//!    overflow edges, prune to `prune_to`, and clear the flag.
//!
//! Graph sharing follows two disciplines: phase 3 mutates a vertex only
//! under its lock, phase 4 visits each flagged vertex exactly once.

use super::dynamic_buffer::MutableBuffer;
use super::filter::VisitedFilter;
use super::greedy::greedy_search;
use super::prune::{robust_prune, PruneScratch, PruneStrategy};
use super::search_buffer::SearchBuffer;
use super::VamanaBuildParameters;
use crate::data::VectorData;
use crate::datatype::{widen_into, Element};
use crate::distance::{Metric, NeighborOrder};
use crate::error::Result;
use crate::graph::{GraphView, SimpleGraph};
use crate::neighbor::{sort_neighbors, Neighbor};
use crate::threads::{Partition, SharedMut, SpinLock, ThreadPool};
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Grain size for the overflow re-prune phase. Large enough that workers
/// rarely contend on the partition counter, small enough to balance the
/// skewed distribution of flagged vertices.
const PRUNE_GRAINSIZE: usize = 1000;

type UpdateList = Vec<(u32, Vec<u32>)>;

pub(crate) struct VamanaBuilder<'a, T, D, M>
where
    T: Element,
    D: VectorData<T>,
    M: Metric<T>,
{
    data: &'a D,
    metric: &'a M,
    params: &'a VamanaBuildParameters,
    strategy: PruneStrategy,
    locks: Vec<SpinLock>,
    overflow_flags: Vec<AtomicBool>,
    _marker: std::marker::PhantomData<T>,
}

impl<'a, T, D, M> VamanaBuilder<'a, T, D, M>
where
    T: Element,
    D: VectorData<T>,
    M: Metric<T>,
{
    pub(crate) fn new(
        data: &'a D,
        metric: &'a M,
        params: &'a VamanaBuildParameters,
        strategy: PruneStrategy,
    ) -> Self {
        let n = data.size();
        Self {
            data,
            metric,
            params,
            strategy,
            locks: (0..n).map(|_| SpinLock::new()).collect(),
            overflow_flags: (0..n).map(|_| AtomicBool::new(false)).collect(),
            _marker: std::marker::PhantomData,
        }
    }

    /// Runs the full construction pass over `graph`.
    pub(crate) fn construct(
        &self,
        graph: &mut SimpleGraph,
        entry_point: u32,
        seed: u64,
        pool: &mut ThreadPool,
    ) -> Result<()> {
        let n = self.data.size();
        debug_assert_eq!(graph.num_nodes(), n);

        let mut permutation: Vec<u32> = (0..n as u32).collect();
        let mut rng = <ChaCha8Rng as rand::SeedableRng>::seed_from_u64(seed);
        permutation.shuffle(&mut rng);

        let num_batches = 40usize.max(n.div_ceil(64 * 64));
        let batchsize = n.div_ceil(num_batches);
        log::debug!("vamana build: {n} vertices, {num_batches} batches of {batchsize}");

        for batch in permutation.chunks(batchsize.max(1)) {
            let updates = self.generate_neighbors(graph, batch, entry_point, pool)?;
            for thread_updates in &updates {
                for (vertex, list) in thread_updates {
                    graph.replace_node(*vertex, list);
                }
            }
            self.add_reverse_edges(graph, &updates, pool)?;
        }
        Ok(())
    }

    /// Phase 1: candidate generation and pruning, staged per thread.
    fn generate_neighbors(
        &self,
        graph: &SimpleGraph,
        batch: &[u32],
        entry_point: u32,
        pool: &mut ThreadPool,
    ) -> Result<Vec<UpdateList>> {
        let nthreads = pool.size();
        let updates: Vec<Mutex<UpdateList>> =
            (0..nthreads).map(|_| Mutex::new(Vec::new())).collect();
        let entry_points = [entry_point];

        pool.parallel_for(Partition::fixed(batch.len()), |range, tid| {
            let mut metric = self.metric.clone();
            let mut buffer = SearchBuffer::<M::Order>::new(self.params.window_size);
            let mut filter = VisitedFilter::new(VisitedFilter::DEFAULT_BITS);
            let mut candidates: Vec<Neighbor> = Vec::new();
            let mut query = Vec::new();
            let mut scratch = PruneScratch::default();
            let mut staged: UpdateList = Vec::with_capacity(range.len());

            for i in range {
                let vertex = batch[i];
                widen_into(self.data.get(vertex as usize), &mut query);
                metric.fix_argument(&query);

                greedy_search(
                    graph,
                    self.data,
                    &metric,
                    &mut buffer,
                    &entry_points,
                    Some(&mut filter),
                    |_| false,
                );

                // Pool = search results, capped, unioned with the current
                // adjacency list.
                candidates.clear();
                let upper = buffer.size().min(self.params.max_candidate_pool_size);
                for slot in 0..upper {
                    candidates.push(buffer.get(slot));
                }
                for &existing in graph.neighbors(vertex) {
                    if existing != vertex && !candidates.iter().any(|c| c.id == existing) {
                        let distance = metric.compute(self.data.get(existing as usize));
                        candidates.push(Neighbor::new(existing, distance));
                    }
                }
                sort_neighbors::<M::Order>(&mut candidates);
                candidates.truncate(self.params.max_candidate_pool_size);

                let mut pruned = Vec::new();
                robust_prune(
                    self.strategy,
                    self.params.alpha,
                    self.params.graph_max_degree,
                    self.data,
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

        Ok(updates
            .into_iter()
            .map(|m| m.into_inner().expect("update slot poisoned"))
            .collect())
    }

    /// Phases 3 and 4: back edges under per-vertex locks, then overflow
    /// re-pruning.
    fn add_reverse_edges(
        &self,
        graph: &mut SimpleGraph,
        updates: &[UpdateList],
        pool: &mut ThreadPool,
    ) -> Result<()> {
        let nthreads = pool.size();
        let overflow_maps: Vec<Mutex<HashMap<u32, Vec<u32>>>> =
            (0..nthreads).map(|_| Mutex::new(HashMap::new())).collect();
        let max_degree = self.params.graph_max_degree;
        let shared = SharedMut::new(graph);

        pool.run(|tid| {
            let Some(thread_updates) = updates.get(tid) else {
                return;
            };
            let mut overflow = overflow_maps[tid].lock().expect("overflow map poisoned");
            for (vertex, list) in thread_updates {
                for &target in list {
                    let _guard = self.locks[target as usize].lock();
                    // SAFETY: `target`'s row is only mutated under
                    // `target`'s lock, which we hold.
                    let graph = unsafe { shared.get_mut() };
                    if graph.degree(target) < max_degree {
                        graph.add_edge(target, *vertex);
                    } else {
                        // Relaxed suffices: all writers store `true` and
                        // readers run after the pool joins.
                        self.overflow_flags[target as usize].store(true, Ordering::Relaxed);
                        overflow.entry(target).or_default().push(*vertex);
                    }
                }
            }
        })?;

        self.prune_overflowed(graph, &overflow_maps, pool)
    }

    fn prune_overflowed(
        &self,
        graph: &mut SimpleGraph,
        overflow_maps: &[Mutex<HashMap<u32, Vec<u32>>>],
        pool: &mut ThreadPool,
    ) -> Result<()> {
        let n = self.data.size();
        let shared = SharedMut::new(graph);

        pool.parallel_for(Partition::dynamic(n, PRUNE_GRAINSIZE), |range, _| {
            let mut metric = self.metric.clone();
            let mut buffer = SearchBuffer::<M::Order>::new(self.params.max_candidate_pool_size);
            let mut query = Vec::new();
            let mut scratch = PruneScratch::default();
            let mut pruned = Vec::new();
            let mut candidates: Vec<Neighbor> = Vec::new();

            for vertex in range {
                if !self.overflow_flags[vertex].load(Ordering::Relaxed) {
                    continue;
                }
                let vertex = vertex as u32;

                widen_into(self.data.get(vertex as usize), &mut query);
                metric.fix_argument(&query);

                buffer.clear();
                // SAFETY: each flagged vertex is visited by exactly one
                // worker; its row is not touched elsewhere in this phase.
                let graph_ref = unsafe { shared.get_mut() };
                for &neighbor in graph_ref.neighbors(vertex) {
                    let distance = metric.compute(self.data.get(neighbor as usize));
                    buffer.insert(neighbor, distance);
                }
                for map in overflow_maps {
                    let map = map.lock().expect("overflow map poisoned");
                    if let Some(extras) = map.get(&vertex) {
                        for &extra in extras {
                            let distance = metric.compute(self.data.get(extra as usize));
                            buffer.insert(extra, distance);
                        }
                    }
                }

                candidates.clear();
                for slot in 0..buffer.size() {
                    candidates.push(buffer.get(slot));
                }
                robust_prune(
                    self.strategy,
                    self.params.alpha,
                    self.params.prune_to,
                    self.data,
                    &mut metric,
                    vertex,
                    &candidates,
                    &mut scratch,
                    &mut pruned,
                );
                graph_ref.replace_node(vertex, &pruned);
                self.overflow_flags[vertex as usize].store(false, Ordering::Relaxed);
            }
        })
        .map_err(Into::into)
    }
}

/// Greedy search + robust prune for a single new vertex of the dynamic
/// index; shared by insert and consolidate, which both rebuild one
/// adjacency list at a time.
#[allow(clippy::too_many_arguments)]
pub(crate) fn search_and_prune<T, D, M, G>(
    graph: &G,
    data: &D,
    metric: &mut M,
    params: &VamanaBuildParameters,
    strategy: PruneStrategy,
    vertex: u32,
    entry_points: &[u32],
    buffer: &mut MutableBuffer<M::Order>,
    filter: &mut VisitedFilter,
    deleted: impl Fn(u32) -> bool,
    scratch: &mut PruneScratch,
    result: &mut Vec<u32>,
) where
    T: Element,
    D: VectorData<T>,
    M: Metric<T>,
    G: GraphView,
{
    let mut query = Vec::new();
    widen_into(data.get(vertex as usize), &mut query);
    metric.fix_argument(&query);

    buffer.change_target(params.window_size);
    greedy_search(
        graph,
        data,
        metric,
        buffer,
        entry_points,
        Some(filter),
        &deleted,
    );
    buffer.sort();

    let mut candidates: Vec<Neighbor> = Vec::new();
    for slot in 0..buffer.size() {
        let entry = buffer.get(slot);
        if entry.flags.skipped() || entry.id() == vertex {
            continue;
        }
        candidates.push(entry.neighbor);
        if candidates.len() == params.max_candidate_pool_size {
            break;
        }
    }

    robust_prune(
        strategy,
        params.alpha,
        params.graph_max_degree,
        data,
        metric,
        vertex,
        &candidates,
        scratch,
        result,
    );
}
