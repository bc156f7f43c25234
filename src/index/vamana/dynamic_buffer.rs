//! Search buffer for the dynamic index.
//!
//! Differs from the static buffer in one way: entries carry a `skipped`
//! flag for soft-deleted slots. Skipped entries still participate in
//! traversal, since deleting a vertex must not disconnect the graph around
//! it, but they do not count toward the result target and are dropped before
//! results are read out.
//!
//! The buffer is "full" when the number of *valid* (non-skipped) entries
//! reaches the target; trailing entries are trimmed opportunistically
//! whenever the valid count allows it, which bounds the memory growth from
//! long runs of deleted candidates.

use crate::distance::NeighborOrder;
use crate::neighbor::{FlaggedNeighbor, Neighbor, SkipVisit};
use std::marker::PhantomData;

/// Skip-aware search buffer. `O` fixes the comparator.
#[derive(Debug, Clone)]
pub struct MutableBuffer<O: NeighborOrder> {
    entries: Vec<FlaggedNeighbor<SkipVisit>>,
    target_valid: usize,
    best_unvisited: usize,
    valid: usize,
    _order: PhantomData<O>,
}

impl<O: NeighborOrder> MutableBuffer<O> {
    /// Creates a buffer targeting `target_valid` live results.
    #[must_use]
    pub fn new(target_valid: usize) -> Self {
        Self {
            entries: Vec::with_capacity(target_valid + 1),
            target_valid,
            best_unvisited: 0,
            valid: 0,
            _order: PhantomData,
        }
    }

    /// Changes the target number of live results, clearing the buffer.
    pub fn change_target(&mut self, target_valid: usize) {
        self.target_valid = target_valid;
        self.clear();
    }

    /// Prepares the buffer for a new search.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.best_unvisited = 0;
        self.valid = 0;
    }

    /// Total entries, skipped included.
    #[must_use]
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    /// Number of non-skipped entries.
    #[must_use]
    pub fn valid(&self) -> usize {
        self.valid
    }

    /// The live-result target.
    #[must_use]
    pub fn target(&self) -> usize {
        self.target_valid
    }

    /// Whether the valid count has reached the target.
    #[must_use]
    pub fn full(&self) -> bool {
        self.valid == self.target_valid
    }

    /// Whether every entry has been visited.
    #[must_use]
    pub fn done(&self) -> bool {
        self.best_unvisited == self.size()
    }

    /// The entry at position `i` (including skipped entries).
    #[must_use]
    pub fn get(&self, i: usize) -> &FlaggedNeighbor<SkipVisit> {
        &self.entries[i]
    }

    fn back(&self) -> &FlaggedNeighbor<SkipVisit> {
        &self.entries[self.entries.len() - 1]
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
        loop {
            self.best_unvisited += 1;
            if self.best_unvisited == self.entries.len()
                || !self.entries[self.best_unvisited].flags.visited()
            {
                break;
            }
        }
        node
    }

    /// How many more valid entries exist than required (negative while
    /// under-full).
    fn slack(&self) -> i64 {
        self.valid as i64 - self.target_valid as i64
    }

    /// Returns `true` if a neighbor at `distance` cannot change the
    /// buffer.
    #[inline]
    #[must_use]
    pub fn can_skip(&self, distance: f32) -> bool {
        self.full()
            && !self.entries.is_empty()
            && O::closer(self.back().distance(), distance)
    }

    /// Inserts a neighbor; `skipped` marks soft-deleted ids. Returns the
    /// insertion position, or `size() + 1` for rejected duplicates.
    pub fn insert(&mut self, id: u32, distance: f32, skipped: bool) -> usize {
        if self.can_skip(distance) {
            return self.size();
        }

        let mut lo = 0usize;
        let mut hi = self.entries.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if O::closer(self.entries[mid].distance(), distance) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        let pos = lo;

        let mut back = pos;
        while back > 0 {
            back -= 1;
            let candidate = &self.entries[back];
            if O::closer(candidate.distance(), distance) {
                break;
            }
            if candidate.id() == id {
                return self.size() + 1;
            }
        }

        let mut entry = FlaggedNeighbor::<SkipVisit>::new(id, distance);
        entry.flags = SkipVisit::skipped_if(skipped);
        self.valid += usize::from(!skipped);
        self.entries.insert(pos, entry);
        self.best_unvisited = self.best_unvisited.min(pos);

        // Trim the tail while doing so cannot drop the valid count below
        // the target. The entry just inserted is never trimmed: if it is
        // valid it is needed, and a skipped insert implies the buffer was
        // not yet full.
        if self.slack() >= 0 {
            while !self.entries.is_empty() {
                let last_skipped = self.back().flags.skipped();
                if last_skipped || self.slack() > 0 {
                    self.entries.pop();
                    self.valid -= usize::from(!last_skipped);
                } else {
                    break;
                }
            }
        }
        pos
    }

    /// Restores full sorted order.
    pub fn sort(&mut self) {
        self.entries
            .sort_unstable_by(|a, b| O::total_cmp(a.distance(), a.id(), b.distance(), b.id()));
    }

    /// Drops every skipped entry.
    pub fn cleanup(&mut self) {
        self.entries.retain(|e| !e.flags.skipped());
        self.valid = self.entries.len();
        self.best_unvisited = self.best_unvisited.min(self.entries.len());
    }

    /// Copies the best `k` valid entries out as plain neighbors.
    #[must_use]
    pub fn top_k(&self, k: usize) -> Vec<Neighbor> {
        self.entries
            .iter()
            .filter(|e| !e.flags.skipped())
            .take(k)
            .map(|e| e.neighbor)
            .collect()
    }
}
