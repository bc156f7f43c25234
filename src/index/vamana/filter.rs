//! Direct-mapped visited filter.
//!
//! A small fixed-size cache that answers "have I already scored this id?".
//! Being direct-mapped it yields false negatives under slot collisions
//! (a forgotten id merely costs a redundant distance computation) but it
//! never claims an id was seen when it was not, so search can use it as a
//! prune hint without affecting correctness.
//!
//! The slot is the low `n` bits of the id. With `n >= 16` the slot plus a
//! 16-bit tag of the high bits reconstruct the id exactly; below that the
//! full id is stored. All-ones is the empty sentinel.

/// A direct-mapped approximate set of `u32` ids with `2^n` slots.
#[derive(Debug, Clone)]
pub struct VisitedFilter {
    tags: Tags,
    mask: u32,
}

#[derive(Debug, Clone)]
enum Tags {
    /// `n >= 16`: upper 16 bits of each id.
    Narrow(Vec<u16>),
    /// `n < 16`: full ids.
    Full(Vec<u32>),
}

impl VisitedFilter {
    /// Default index width: `2^16` slots, 128 KiB per thread.
    pub const DEFAULT_BITS: u32 = 16;

    /// Creates a filter with `2^bits` slots, all empty.
    ///
    /// # Panics
    ///
    /// Panics if `bits` is 0 or exceeds 28 (a 256M-slot filter is a
    /// misconfiguration, not a request).
    #[must_use]
    pub fn new(bits: u32) -> Self {
        assert!(bits >= 1 && bits <= 28, "filter bits out of range: {bits}");
        let capacity = 1usize << bits;
        let tags = if bits >= 16 {
            Tags::Narrow(vec![u16::MAX; capacity])
        } else {
            Tags::Full(vec![u32::MAX; capacity])
        };
        Self {
            tags,
            mask: (capacity - 1) as u32,
        }
    }

    /// The number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.mask as usize + 1
    }

    /// Empties the filter.
    pub fn reset(&mut self) {
        match &mut self.tags {
            Tags::Narrow(tags) => tags.fill(u16::MAX),
            Tags::Full(tags) => tags.fill(u32::MAX),
        }
    }

    #[inline]
    fn slot(&self, id: u32) -> usize {
        (id & self.mask) as usize
    }

    /// Returns `true` if `id` is present.
    ///
    /// May spuriously return `false` after a colliding insert; never
    /// returns `true` for an id that was not inserted.
    #[inline]
    #[must_use]
    pub fn contains(&self, id: u32) -> bool {
        match &self.tags {
            Tags::Narrow(tags) => tags[self.slot(id)] == (id >> 16) as u16,
            Tags::Full(tags) => tags[self.slot(id)] == id,
        }
    }

    /// Inserts `id`, overwriting whatever occupied its slot. Returns
    /// whether the slot already matched `id`.
    #[inline]
    pub fn emplace(&mut self, id: u32) -> bool {
        let slot = self.slot(id);
        match &mut self.tags {
            Tags::Narrow(tags) => {
                let tag = (id >> 16) as u16;
                let present = tags[slot] == tag;
                tags[slot] = tag;
                present
            }
            Tags::Full(tags) => {
                let present = tags[slot] == id;
                tags[slot] = id;
                present
            }
        }
    }

    /// Hints the slot for `id` into cache.
    #[inline]
    pub fn prefetch(&self, id: u32) {
        #[cfg(target_arch = "x86_64")]
        {
            let slot = self.slot(id);
            // SAFETY: `slot` is masked in bounds; prefetch has no memory
            // effects beyond the cache.
            unsafe {
                match &self.tags {
                    Tags::Narrow(tags) => std::arch::x86_64::_mm_prefetch(
                        tags.as_ptr().add(slot).cast::<i8>(),
                        std::arch::x86_64::_MM_HINT_T0,
                    ),
                    Tags::Full(tags) => std::arch::x86_64::_mm_prefetch(
                        tags.as_ptr().add(slot).cast::<i8>(),
                        std::arch::x86_64::_MM_HINT_T0,
                    ),
                }
            }
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            let _ = id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_filter_collisions() {
        // bits = 4: ids 0, 1, 16, 17 hash to slots 0, 1, 0, 1.
        let mut filter = VisitedFilter::new(4);
        assert_eq!(filter.capacity(), 16);
        for id in [0u32, 1, 16, 17] {
            assert!(!filter.emplace(id));
        }
        // 16 and 17 overwrote 0 and 1.
        assert!(filter.contains(16));
        assert!(filter.contains(17));
        assert!(!filter.contains(0));
        assert!(!filter.contains(1));
        // Never inserted, collides with slot 0: must be absent.
        assert!(!filter.contains(32));
    }

    #[test]
    fn test_emplace_reports_existing() {
        let mut filter = VisitedFilter::new(8);
        assert!(!filter.emplace(42));
        assert!(filter.emplace(42));
        assert!(filter.contains(42));
    }

    #[test]
    fn test_wide_filter_tags() {
        let mut filter = VisitedFilter::new(16);
        assert_eq!(filter.capacity(), 1 << 16);
        let a = 0x0001_0005u32; // slot 5, tag 1
        let b = 0x0002_0005u32; // slot 5, tag 2
        filter.emplace(a);
        assert!(filter.contains(a));
        assert!(!filter.contains(b));
        filter.emplace(b);
        assert!(filter.contains(b));
        assert!(!filter.contains(a));
    }

    #[test]
    fn test_reset() {
        let mut filter = VisitedFilter::new(6);
        filter.emplace(7);
        filter.reset();
        assert!(!filter.contains(7));
    }

    #[test]
    fn test_no_content_false_positives() {
        let mut filter = VisitedFilter::new(10);
        for id in (0..4096u32).step_by(7) {
            filter.emplace(id);
        }
        // An id never inserted must not be reported, regardless of
        // collisions.
        for id in (1..4096u32).step_by(7) {
            assert!(!filter.contains(id), "{id}");
        }
    }
}
