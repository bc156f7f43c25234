//! Property tests for the order-sensitive containers.

use proptest::prelude::*;
use vespr::distance::MinDistance;
use vespr::index::vamana::{MutableBuffer, SearchBuffer, VisitedFilter};
use vespr::threads::balance;

proptest! {
    /// After any insert sequence the buffer is sorted, within capacity,
    /// and free of duplicate ids.
    #[test]
    fn search_buffer_invariants(
        capacity in 1usize..32,
        inserts in prop::collection::vec((0u32..64, 0u32..1000), 0..200),
    ) {
        let mut buffer = SearchBuffer::<MinDistance>::new(capacity);
        for (id, distance) in inserts {
            buffer.insert(id, distance as f32);
        }

        prop_assert!(buffer.size() <= capacity);
        let entries: Vec<(u32, f32)> = (0..buffer.size())
            .map(|i| (buffer.get(i).id, buffer.get(i).distance))
            .collect();
        for pair in entries.windows(2) {
            prop_assert!(pair[0].1 <= pair[1].1, "unsorted: {entries:?}");
        }
        let mut ids: Vec<u32> = entries.iter().map(|e| e.0).collect();
        ids.sort_unstable();
        ids.dedup();
        prop_assert_eq!(ids.len(), buffer.size(), "duplicate ids");
    }

    /// The buffer keeps the globally closest ids seen so far.
    #[test]
    fn search_buffer_keeps_best(
        capacity in 1usize..16,
        distances in prop::collection::vec(0u32..10_000, 1..100),
    ) {
        let mut buffer = SearchBuffer::<MinDistance>::new(capacity);
        for (id, distance) in distances.iter().enumerate() {
            buffer.insert(id as u32, *distance as f32);
        }
        let mut expected: Vec<u32> = distances.clone();
        expected.sort_unstable();
        expected.truncate(capacity);
        let kept: Vec<u32> = (0..buffer.size()).map(|i| buffer.get(i).distance as u32).collect();
        prop_assert_eq!(kept, expected);
    }

    /// Skipped entries never count toward fullness and never appear in
    /// results.
    #[test]
    fn mutable_buffer_valid_counting(
        target in 1usize..16,
        inserts in prop::collection::vec((0u32..64, 0u32..1000, any::<bool>()), 0..150),
    ) {
        let mut buffer = MutableBuffer::<MinDistance>::new(target);
        for (id, distance, skipped) in inserts {
            buffer.insert(id, distance as f32, skipped);
        }
        prop_assert!(buffer.valid() <= target);
        let results = buffer.top_k(target);
        prop_assert_eq!(results.len(), buffer.valid().min(target));
    }

    /// Static partitioning covers [0, n) with disjoint near-equal ranges.
    #[test]
    fn balance_partitions_exactly(n in 0usize..10_000, p in 1usize..32) {
        let mut total = 0usize;
        let mut previous_end = 0usize;
        let mut lengths = Vec::new();
        for tid in 0..p {
            let range = balance(n, p, tid);
            prop_assert_eq!(range.start, previous_end);
            previous_end = range.end;
            total += range.len();
            lengths.push(range.len());
        }
        prop_assert_eq!(previous_end, n);
        prop_assert_eq!(total, n);
        let max = lengths.iter().max().copied().unwrap_or(0);
        let min = lengths.iter().min().copied().unwrap_or(0);
        prop_assert!(max - min <= 1);
    }

    /// The filter never reports an id that was not inserted.
    #[test]
    fn visited_filter_no_false_positives(
        bits in 2u32..12,
        inserted in prop::collection::vec(0u32..100_000, 0..500),
        probes in prop::collection::vec(0u32..100_000, 0..200),
    ) {
        let mut filter = VisitedFilter::new(bits);
        let mut truth = std::collections::HashSet::new();
        for id in inserted {
            filter.emplace(id);
            truth.insert(id);
        }
        for probe in probes {
            if filter.contains(probe) {
                prop_assert!(truth.contains(&probe), "false positive for {probe}");
            }
        }
    }
}
