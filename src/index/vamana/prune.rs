//! Robust neighbor pruning (MRNG rule with the Vamana α extension).
//!
//! Given a candidate pool sorted by distance to a vertex, accept the
//! closest unpruned candidate, then discard every remaining candidate that
//! is α-times closer to the accepted one than to the vertex. The result is
//! a diverse adjacency list of bounded size.
//!
//! Two strategies wrap this pass:
//!
//! - [`PruneStrategy::Progressive`] (L2 default) runs a single pass with
//!   the configured α.
//! - [`PruneStrategy::Iterative`] (inner-product/cosine default) retries
//!   with progressively relaxed α values when a pass leaves the result
//!   short, then tops the list up in distance order.
//!
//! Defaults per metric follow [`PruneStrategy::default_for`]; anything
//! other than the built-in metrics requires an explicit choice.

use crate::data::VectorData;
use crate::datatype::{widen_into, Element};
use crate::distance::{DistanceTag, Metric, NeighborOrder};
use crate::neighbor::Neighbor;
use serde::{Deserialize, Serialize};

/// The pruning schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PruneStrategy {
    /// One pass with the configured α.
    Progressive,
    /// Passes at α, (1+α)/2, then 1.0, stopping once the result is full.
    Iterative,
}

impl PruneStrategy {
    /// The default strategy for a built-in metric: L2 prunes
    /// progressively, the similarity metrics iteratively.
    #[must_use]
    pub fn default_for(tag: DistanceTag) -> Self {
        match tag {
            DistanceTag::L2 => PruneStrategy::Progressive,
            DistanceTag::InnerProduct | DistanceTag::Cosine => PruneStrategy::Iterative,
        }
    }
}

/// Scratch buffers reused across prune calls on one thread.
#[derive(Debug, Default)]
pub(crate) struct PruneScratch {
    pruned: Vec<bool>,
    query: Vec<f32>,
}

/// Prunes `pool` (sorted by distance to `node`) down to at most
/// `max_result` diverse neighbors, appended to `result`.
pub(crate) fn robust_prune<T, D, M>(
    strategy: PruneStrategy,
    alpha: f32,
    max_result: usize,
    data: &D,
    metric: &mut M,
    node: u32,
    pool: &[Neighbor],
    scratch: &mut PruneScratch,
    result: &mut Vec<u32>,
) where
    T: Element,
    D: VectorData<T>,
    M: Metric<T>,
{
    result.clear();
    if pool.is_empty() || max_result == 0 {
        return;
    }
    result.reserve(max_result);

    match strategy {
        PruneStrategy::Progressive => {
            prune_pass(alpha, max_result, data, metric, node, pool, scratch, result);
        }
        PruneStrategy::Iterative => {
            let schedule = [alpha, 1.0 + (alpha - 1.0) / 2.0, 1.0];
            for a in schedule {
                result.clear();
                prune_pass(a, max_result, data, metric, node, pool, scratch, result);
                if result.len() == max_result {
                    return;
                }
            }
            // Still short: top up with the nearest leftovers.
            for candidate in pool {
                if result.len() == max_result {
                    break;
                }
                if candidate.id != node && !result.contains(&candidate.id) {
                    result.push(candidate.id);
                }
            }
        }
    }
}

/// One α pass. Already-accepted ids in `result` are kept and skipped.
#[allow(clippy::too_many_arguments)]
fn prune_pass<T, D, M>(
    alpha: f32,
    max_result: usize,
    data: &D,
    metric: &mut M,
    node: u32,
    pool: &[Neighbor],
    scratch: &mut PruneScratch,
    result: &mut Vec<u32>,
) where
    T: Element,
    D: VectorData<T>,
    M: Metric<T>,
{
    scratch.pruned.clear();
    scratch.pruned.resize(pool.len(), false);

    let mut start = 0;
    while result.len() < max_result && start < pool.len() {
        let candidate = pool[start];
        if scratch.pruned[start]
            || candidate.id == node
            || result.contains(&candidate.id)
        {
            start += 1;
            continue;
        }
        scratch.pruned[start] = true;

        // Fetch and fix the accepted candidate only once we know it
        // survives.
        widen_into(data.get(candidate.id as usize), &mut scratch.query);
        metric.fix_argument(&scratch.query);
        result.push(candidate.id);

        for t in (start + 1)..pool.len() {
            if scratch.pruned[t] {
                continue;
            }
            let other = pool[t];
            let between = metric.compute(data.get(other.id as usize));
            if M::Order::closer(alpha * between, other.distance) {
                scratch.pruned[t] = true;
            }
        }
        start += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::SimpleDataset;
    use crate::distance::{InnerProduct, L2};
    use crate::neighbor::sort_neighbors;

    /// Points on a line at 0, 1, 2, 10. From vertex 0, candidate 1 covers
    /// everything further out under α = 1.2.
    #[test]
    fn test_l2_prune_drops_covered_candidate() {
        let data =
            SimpleDataset::from_rows(&[vec![0.0f32], vec![1.0], vec![2.0], vec![10.0]]).unwrap();
        let mut metric = L2::new();
        let mut pool = vec![
            Neighbor::new(1, 1.0),
            Neighbor::new(2, 4.0),
            Neighbor::new(3, 100.0),
        ];
        sort_neighbors::<crate::distance::MinDistance>(&mut pool);

        let mut scratch = PruneScratch::default();
        let mut result = Vec::new();
        robust_prune(
            PruneStrategy::Progressive,
            1.2,
            3,
            &data,
            &mut metric,
            0,
            &pool,
            &mut scratch,
            &mut result,
        );
        // d(1,2) = 1; α·1 = 1.2 < d(0,2) = 4 -> 2 pruned.
        // d(1,3) = 81; α·81 > d(0,3) = 100? 97.2 < 100 -> 3 pruned too.
        // With everything covered by 1, only {1} survives.
        assert_eq!(result, vec![1]);
    }

    #[test]
    fn test_prune_respects_max_result() {
        // Vertex 0 at the origin, candidates 1..=6 on a hexagon with
        // slightly increasing radii. Neighboring candidates sit about as
        // far from each other as from the center, so under α = 1.2 nothing
        // covers anything and only the cap limits the result.
        let mut rows = vec![vec![0.0f32, 0.0]];
        for k in 0..6 {
            let radius = 1.0 + 0.01 * k as f32;
            let angle = (60.0 * k as f32).to_radians();
            rows.push(vec![radius * angle.cos(), radius * angle.sin()]);
        }
        let data = SimpleDataset::from_rows(&rows).unwrap();
        let mut metric = L2::new();
        let mut pool: Vec<Neighbor> = (1..=6u32)
            .map(|i| {
                let mut probe = L2::new();
                Metric::<f32>::fix_argument(&mut probe, &[0.0, 0.0]);
                Neighbor::new(i, probe.compute(data.get(i as usize)))
            })
            .collect();
        sort_neighbors::<crate::distance::MinDistance>(&mut pool);

        let mut scratch = PruneScratch::default();
        let mut result = Vec::new();
        robust_prune(
            PruneStrategy::Progressive,
            1.2,
            4,
            &data,
            &mut metric,
            0,
            &pool,
            &mut scratch,
            &mut result,
        );
        assert_eq!(result, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_self_excluded() {
        let data = SimpleDataset::from_rows(&[vec![0.0f32], vec![1.0]]).unwrap();
        let mut metric = L2::new();
        let pool = vec![Neighbor::new(0, 0.0), Neighbor::new(1, 1.0)];
        let mut scratch = PruneScratch::default();
        let mut result = Vec::new();
        robust_prune(
            PruneStrategy::Progressive,
            1.2,
            2,
            &data,
            &mut metric,
            0,
            &pool,
            &mut scratch,
            &mut result,
        );
        assert_eq!(result, vec![1]);
    }

    #[test]
    fn test_iterative_tops_up() {
        // Clustered points where a strict α pass over-prunes; the
        // iterative strategy must still return max_result neighbors.
        let data = SimpleDataset::from_rows(&[
            vec![1.0f32, 0.0],
            vec![0.9, 0.1],
            vec![0.8, 0.2],
            vec![0.7, 0.3],
        ])
        .unwrap();
        let mut metric = InnerProduct::new();
        let mut pool: Vec<Neighbor> = Vec::new();
        {
            let mut probe = InnerProduct::new();
            let mut q = Vec::new();
            widen_into(data.get(0), &mut q);
            Metric::<f32>::fix_argument(&mut probe, &q);
            for id in 1..4u32 {
                pool.push(Neighbor::new(id, probe.compute(data.get(id as usize))));
            }
        }
        sort_neighbors::<crate::distance::MaxSimilarity>(&mut pool);

        let mut scratch = PruneScratch::default();
        let mut result = Vec::new();
        robust_prune(
            PruneStrategy::Iterative,
            1.5,
            3,
            &data,
            &mut metric,
            0,
            &pool,
            &mut scratch,
            &mut result,
        );
        assert_eq!(result.len(), 3);
    }

    #[test]
    fn test_default_strategies() {
        assert_eq!(
            PruneStrategy::default_for(DistanceTag::L2),
            PruneStrategy::Progressive
        );
        assert_eq!(
            PruneStrategy::default_for(DistanceTag::InnerProduct),
            PruneStrategy::Iterative
        );
        assert_eq!(
            PruneStrategy::default_for(DistanceTag::Cosine),
            PruneStrategy::Iterative
        );
    }
}
