//! Bounded sorted buffer for static greedy search.
//!
//! The buffer holds up to `capacity` neighbors ordered by the metric's
//! comparator and tracks a `best_unvisited` cursor so that retrieving the
//! next expansion candidate is O(1) amortized. Inserting binary-searches
//! for the position, rejects duplicates among equal-distance runs, shifts,
//! and truncates to capacity.
//!
//! An optional internal visited set (exact, hash-based) can be enabled in
//! addition to the external approximate filter; the default leaves it off
//! and relies on the filter alone.

use crate::distance::NeighborOrder;
use crate::neighbor::{FlaggedNeighbor, Neighbor, Visited};
use std::collections::HashSet;
use std::marker::PhantomData;

/// Search buffer for read-only traversal. `O` fixes the comparator.
#[derive(Debug, Clone)]
pub struct SearchBuffer<O: NeighborOrder> {
    entries: Vec<FlaggedNeighbor<Visited>>,
    size: usize,
    capacity: usize,
    best_unvisited: usize,
    visited_set: Option<HashSet<u32>>,
    _order: PhantomData<O>,
}

impl<O: NeighborOrder> SearchBuffer<O> {
    /// Creates a buffer returning up to `capacity` neighbors.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self::with_visited_set(capacity, false)
    }

    /// Creates a buffer, optionally with the internal exact visited set.
    #[must_use]
    pub fn with_visited_set(capacity: usize, enable_visited: bool) -> Self {
        Self {
            // One slack slot lets insertion shift before truncation.
            entries: vec![FlaggedNeighbor::new(u32::MAX, O::WORST); capacity + 1],
            size: 0,
            capacity,
            best_unvisited: 0,
            visited_set: enable_visited.then(HashSet::new),
            _order: PhantomData,
        }
    }

    /// Changes the target capacity, keeping the buffer cleared.
    pub fn change_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
        self.entries
            .resize(capacity + 1, FlaggedNeighbor::new(u32::MAX, O::WORST));
        self.clear();
    }

    /// Prepares the buffer for a new search.
    pub fn clear(&mut self) {
        self.size = 0;
        self.best_unvisited = 0;
        if let Some(set) = &mut self.visited_set {
            set.clear();
        }
    }

    /// Current number of valid entries.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Maximum number of entries.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether the buffer holds `capacity` entries.
    #[must_use]
    pub fn full(&self) -> bool {
        self.size == self.capacity
    }

    /// Whether every entry has been visited.
    #[must_use]
    pub fn done(&self) -> bool {
        self.best_unvisited == self.size
    }

    /// The entry at position `i`.
    #[must_use]
    pub fn get(&self, i: usize) -> Neighbor {
        self.entries[i].neighbor
    }

    /// The furthest valid entry.
    #[must_use]
    pub fn back(&self) -> Neighbor {
        self.entries[self.size - 1].neighbor
    }

    /// Marks and returns the best unvisited entry.
    ///
    /// Precondition: `!done()`.
    pub fn next(&mut self) -> Neighbor {
        let node = {
            let entry = &mut self.entries[self.best_unvisited];
            entry.flags.set_visited();
            entry.neighbor
        };
        // Advance the cursor past anything already expanded.
        loop {
            self.best_unvisited += 1;
            if self.best_unvisited == self.size || !self.entries[self.best_unvisited].flags.visited()
            {
                break;
            }
        }
        if let Some(set) = &mut self.visited_set {
            set.insert(node.id);
        }
        node
    }

    /// Whether the internal visited set is active.
    #[must_use]
    pub fn visited_set_enabled(&self) -> bool {
        self.visited_set.is_some()
    }

    /// Whether `id` was expanded, per the internal set. Always `false`
    /// when the set is disabled.
    #[must_use]
    pub fn visited(&self, id: u32) -> bool {
        self.visited_set
            .as_ref()
            .is_some_and(|set| set.contains(&id))
    }

    /// Returns `true` if a neighbor at `distance` cannot change the
    /// buffer.
    #[inline]
    #[must_use]
    pub fn can_skip(&self, distance: f32) -> bool {
        self.full() && O::closer(self.back().distance, distance)
    }

    /// Inserts a neighbor, keeping order and capacity. Returns the
    /// insertion position, or `size() + 1` when rejected as a duplicate.
    pub fn insert(&mut self, id: u32, distance: f32) -> usize {
        if self.can_skip(distance) {
            return self.size;
        }

        // Lower bound: first position whose entry is not closer than the
        // incoming distance.
        let mut lo = 0usize;
        let mut hi = self.size;
        while lo < hi {
            let mid = (lo + hi) / 2;
            if O::closer(self.entries[mid].distance(), distance) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        let pos = lo;

        // Duplicate ids sit inside the run of equal distances ending at
        // `pos`; scan it before committing.
        let mut back = pos;
        while back > 0 {
            back -= 1;
            let candidate = &self.entries[back];
            if O::closer(candidate.distance(), distance) {
                break;
            }
            if candidate.id() == id {
                return self.size + 1;
            }
        }

        // Shift right through the slack slot, then truncate.
        self.entries.copy_within(pos..self.size, pos + 1);
        self.entries[pos] = FlaggedNeighbor::new(id, distance);
        self.size = (self.size + 1).min(self.capacity);
        self.best_unvisited = self.best_unvisited.min(pos);
        pos
    }

    /// Restores full sorted order (entries are kept ordered by
    /// construction; this is the explicit re-sort used before reading out
    /// results).
    pub fn sort(&mut self) {
        let size = self.size;
        self.entries[..size].sort_unstable_by(|a, b| {
            O::total_cmp(a.distance(), a.id(), b.distance(), b.id())
        });
    }

    /// Copies the best `k` entries out as plain neighbors.
    #[must_use]
    pub fn top_k(&self, k: usize) -> Vec<Neighbor> {
        self.entries[..self.size.min(k)]
            .iter()
            .map(|e| e.neighbor)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::{MaxSimilarity, MinDistance};

    #[test]
    fn test_insert_order_and_capacity() {
        let mut buffer = SearchBuffer::<MinDistance>::new(5);
        for (id, d) in [(1u32, 10.0f32), (2, 50.0), (3, 20.0), (4, 100.0)] {
            buffer.insert(id, d);
        }
        buffer.insert(5, 1000.0);
        assert_eq!(buffer.size(), 5);
        // (5, 1000) is in the last slot until a closer neighbor evicts it.
        let ids: Vec<u32> = (0..buffer.size()).map(|i| buffer.get(i).id).collect();
        assert_eq!(ids, vec![1, 3, 2, 4, 5]);

        buffer.insert(6, 60.0);
        assert_eq!(buffer.size(), 5);
        let ids: Vec<u32> = (0..buffer.size()).map(|i| buffer.get(i).id).collect();
        assert_eq!(ids, vec![1, 3, 2, 6, 4]);

        // Full and worse than the worst: rejected outright.
        assert!(buffer.can_skip(200.0));
        buffer.insert(7, 200.0);
        assert_eq!(buffer.size(), 5);
        let ids: Vec<u32> = (0..buffer.size()).map(|i| buffer.get(i).id).collect();
        assert_eq!(ids, vec![1, 3, 2, 6, 4]);
    }

    #[test]
    fn test_spec_scenario_partial_fill() {
        // Capacity 5, four inserts then a far one: the far neighbor is
        // admitted while capacity remains.
        let mut buffer = SearchBuffer::<MinDistance>::new(5);
        for (id, d) in [(1u32, 10.0f32), (2, 50.0), (3, 20.0), (4, 100.0)] {
            buffer.insert(id, d);
        }
        assert_eq!(buffer.size(), 4);
        let ordered: Vec<(u32, f32)> = (0..4)
            .map(|i| (buffer.get(i).id, buffer.get(i).distance))
            .collect();
        assert_eq!(
            ordered,
            vec![(1, 10.0), (3, 20.0), (2, 50.0), (4, 100.0)]
        );
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut buffer = SearchBuffer::<MinDistance>::new(4);
        buffer.insert(9, 5.0);
        buffer.insert(2, 5.0);
        let rejected = buffer.insert(9, 5.0);
        assert_eq!(rejected, buffer.size() + 1);
        assert_eq!(buffer.size(), 2);
    }

    #[test]
    fn test_next_visits_in_order() {
        let mut buffer = SearchBuffer::<MinDistance>::new(4);
        buffer.insert(1, 3.0);
        buffer.insert(2, 1.0);
        buffer.insert(3, 2.0);

        assert!(!buffer.done());
        assert_eq!(buffer.next().id, 2);
        assert_eq!(buffer.next().id, 3);

        // A closer insert rewinds the cursor.
        buffer.insert(4, 0.5);
        assert_eq!(buffer.next().id, 4);
        assert_eq!(buffer.next().id, 1);
        assert!(buffer.done());
    }

    #[test]
    fn test_similarity_ordering() {
        let mut buffer = SearchBuffer::<MaxSimilarity>::new(3);
        buffer.insert(1, 0.1);
        buffer.insert(2, 0.9);
        buffer.insert(3, 0.5);
        let ids: Vec<u32> = (0..3).map(|i| buffer.get(i).id).collect();
        assert_eq!(ids, vec![2, 3, 1]);
        assert!(buffer.can_skip(0.05));
        assert!(!buffer.can_skip(0.6));
    }

    #[test]
    fn test_visited_set_knob() {
        let mut buffer = SearchBuffer::<MinDistance>::with_visited_set(4, true);
        assert!(buffer.visited_set_enabled());
        buffer.insert(5, 1.0);
        assert!(!buffer.visited(5));
        buffer.next();
        assert!(buffer.visited(5));

        let plain = SearchBuffer::<MinDistance>::new(4);
        assert!(!plain.visited_set_enabled());
    }
}
