//! Greedy best-first graph traversal.
//!
//! One traversal serves both index flavors: the static path uses
//! [`SearchBuffer`](super::search_buffer::SearchBuffer) and a `skip`
//! predicate that never fires; the dynamic path uses
//! [`MutableBuffer`](super::dynamic_buffer::MutableBuffer) with soft-deleted
//! slots flagged skipped. The [`TraversalBuffer`] trait is the small seam
//! between them.

use super::dynamic_buffer::MutableBuffer;
use super::filter::VisitedFilter;
use super::search_buffer::SearchBuffer;
use crate::data::VectorData;
use crate::datatype::Element;
use crate::distance::{Metric, NeighborOrder};
use crate::graph::GraphView;
use crate::neighbor::Neighbor;

/// The buffer operations greedy traversal needs.
pub(crate) trait TraversalBuffer {
    /// Prepare for a new query.
    fn reset(&mut self);
    /// All entries expanded?
    fn finished(&self) -> bool;
    /// Pop (mark) the best unexpanded entry.
    fn advance(&mut self) -> Neighbor;
    /// Offer a scored candidate.
    fn offer(&mut self, id: u32, distance: f32, skipped: bool);
    /// Did the buffer's own visited set already expand `id`?
    fn expanded(&self, id: u32) -> bool;
}

impl<O: NeighborOrder> TraversalBuffer for SearchBuffer<O> {
    fn reset(&mut self) {
        self.clear();
    }

    fn finished(&self) -> bool {
        self.done()
    }

    fn advance(&mut self) -> Neighbor {
        self.next()
    }

    fn offer(&mut self, id: u32, distance: f32, _skipped: bool) {
        self.insert(id, distance);
    }

    fn expanded(&self, id: u32) -> bool {
        self.visited(id)
    }
}

impl<O: NeighborOrder> TraversalBuffer for MutableBuffer<O> {
    fn reset(&mut self) {
        self.clear();
    }

    fn finished(&self) -> bool {
        self.done()
    }

    fn advance(&mut self) -> Neighbor {
        self.next()
    }

    fn offer(&mut self, id: u32, distance: f32, skipped: bool) {
        self.insert(id, distance, skipped);
    }

    fn expanded(&self, _id: u32) -> bool {
        false
    }
}

/// Runs greedy search from `entry_points`, filling `buffer`.
///
/// The metric must already have its query fixed. `filter` is the
/// per-thread approximate visited set (reset here); `skip` flags ids that
/// are traversed but excluded from results.
pub(crate) fn greedy_search<T, D, M, B, F>(
    graph: &impl GraphView,
    data: &D,
    metric: &M,
    buffer: &mut B,
    entry_points: &[u32],
    mut filter: Option<&mut VisitedFilter>,
    skip: F,
) where
    T: Element,
    D: VectorData<T>,
    M: Metric<T>,
    B: TraversalBuffer,
    F: Fn(u32) -> bool,
{
    buffer.reset();
    if let Some(f) = filter.as_mut() {
        f.reset();
    }

    for &entry in entry_points {
        let distance = metric.compute(data.get(entry as usize));
        buffer.offer(entry, distance, skip(entry));
        if let Some(f) = filter.as_mut() {
            f.emplace(entry);
        }
    }

    while !buffer.finished() {
        let current = buffer.advance();
        graph.prefetch(current.id);
        for &neighbor in graph.neighbors(current.id) {
            if let Some(f) = filter.as_mut() {
                if f.contains(neighbor) {
                    continue;
                }
            }
            if buffer.expanded(neighbor) {
                continue;
            }
            data.prefetch(neighbor as usize);
            let distance = metric.compute(data.get(neighbor as usize));
            if let Some(f) = filter.as_mut() {
                f.emplace(neighbor);
            }
            buffer.offer(neighbor, distance, skip(neighbor));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::SimpleDataset;
    use crate::distance::{MinDistance, L2};
    use crate::graph::SimpleGraph;

    /// A 1-D line of points 0..8 chained left to right; greedy search from
    /// vertex 0 must walk to the query's nearest point.
    fn line_fixture() -> (SimpleGraph, SimpleDataset<f32>) {
        let n = 8;
        let mut data = SimpleDataset::<f32>::new(n, 1);
        let mut graph = SimpleGraph::new(n, 2);
        for i in 0..n {
            data.set(i, &[i as f32]);
            if i > 0 {
                graph.add_edge(i as u32, (i - 1) as u32);
            }
            if i + 1 < n {
                graph.add_edge(i as u32, (i + 1) as u32);
            }
        }
        (graph, data)
    }

    #[test]
    fn test_walks_chain_to_nearest() {
        let (graph, data) = line_fixture();
        let mut metric = L2::new();
        Metric::<f32>::fix_argument(&mut metric, &[6.2]);
        let mut buffer = SearchBuffer::<MinDistance>::new(3);
        let mut filter = VisitedFilter::new(4);
        greedy_search(
            &graph,
            &data,
            &metric,
            &mut buffer,
            &[0],
            Some(&mut filter),
            |_| false,
        );
        buffer.sort();
        assert_eq!(buffer.get(0).id, 6);
        assert_eq!(buffer.get(1).id, 7);
        assert_eq!(buffer.get(2).id, 5);
    }

    #[test]
    fn test_skip_predicate_marks_but_traverses() {
        let (graph, data) = line_fixture();
        let mut metric = L2::new();
        Metric::<f32>::fix_argument(&mut metric, &[6.2]);
        let mut buffer = MutableBuffer::<MinDistance>::new(3);
        // Delete the nearest vertex; it must still be traversed (so the
        // walk can pass through it) but not returned.
        greedy_search(
            &graph,
            &data,
            &metric,
            &mut buffer,
            &[0],
            None,
            |id| id == 6,
        );
        buffer.sort();
        let ids: Vec<u32> = buffer.top_k(3).iter().map(|n| n.id).collect();
        assert!(!ids.contains(&6));
        assert!(ids.contains(&7));
        assert!(ids.contains(&5));
    }

    #[test]
    fn test_without_filter_uses_buffer_visited_set() {
        let (graph, data) = line_fixture();
        let mut metric = L2::new();
        Metric::<f32>::fix_argument(&mut metric, &[3.0]);
        let mut buffer = SearchBuffer::<MinDistance>::with_visited_set(4, true);
        greedy_search(&graph, &data, &metric, &mut buffer, &[0], None, |_| false);
        buffer.sort();
        assert_eq!(buffer.get(0).id, 3);
    }
}
