//! Distance metrics.
//!
//! A metric is a stateful functor: [`Metric::fix_argument`] is called once
//! per query to hoist per-query state (normalization, pre-scaled values),
//! after which [`Metric::compute`] evaluates the fixed query against stored
//! vectors. Search and build code never look past this interface, so
//! alternative kernels (quantized-domain adapters, specialized widths) slot
//! in without touching the traversal logic.
//!
//! Whether "closer" means a smaller or a larger value is a property of the
//! metric, captured by its [`NeighborOrder`] type: L2 minimizes, inner
//! product and cosine similarity maximize.

use crate::datatype::Element;
use serde::{Deserialize, Serialize};

/// Ordering semantics for a metric: decides which of two scores is closer.
pub trait NeighborOrder: Copy + Clone + Default + Send + Sync + 'static {
    /// The worst representable score; identity element for "closest-of"
    /// reductions and the fill value for unused result slots.
    const WORST: f32;

    /// Returns `true` if score `a` is strictly closer than score `b`.
    fn closer(a: f32, b: f32) -> bool;

    /// Total order on `(score, id)` pairs: by score under `closer`, ties
    /// broken on ascending id for determinism.
    #[inline]
    fn total_cmp(a: f32, a_id: u32, b: f32, b_id: u32) -> std::cmp::Ordering {
        if Self::closer(a, b) {
            std::cmp::Ordering::Less
        } else if Self::closer(b, a) {
            std::cmp::Ordering::Greater
        } else {
            a_id.cmp(&b_id)
        }
    }
}

/// Smaller scores are closer (true distances, e.g. L2).
#[derive(Debug, Clone, Copy, Default)]
pub struct MinDistance;

impl NeighborOrder for MinDistance {
    const WORST: f32 = f32::INFINITY;

    #[inline]
    fn closer(a: f32, b: f32) -> bool {
        a < b
    }
}

/// Larger scores are closer (similarities, e.g. inner product).
#[derive(Debug, Clone, Copy, Default)]
pub struct MaxSimilarity;

impl NeighborOrder for MaxSimilarity {
    const WORST: f32 = f32::NEG_INFINITY;

    #[inline]
    fn closer(a: f32, b: f32) -> bool {
        a > b
    }
}

/// A distance functor over stored vectors of element type `T`.
///
/// Queries are always full precision; implementations that need the query
/// in another domain transform it in [`Metric::fix_argument`].
pub trait Metric<T: Element>: Clone + Send + Sync + 'static {
    /// The comparator deciding which scores are closer.
    type Order: NeighborOrder;

    /// Hoist per-query state. Must be called before [`Metric::compute`].
    fn fix_argument(&mut self, query: &[f32]);

    /// Score of the fixed query against `v`.
    fn compute(&self, v: &[T]) -> f32;
}

/// Runtime tag naming a built-in metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceTag {
    /// Squared Euclidean distance, minimized.
    L2,
    /// Inner product, maximized.
    InnerProduct,
    /// Cosine similarity, maximized. The query is normalized once per
    /// search; stored vectors are normalized on the fly.
    Cosine,
}

impl std::fmt::Display for DistanceTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DistanceTag::L2 => f.write_str("l2"),
            DistanceTag::InnerProduct => f.write_str("inner_product"),
            DistanceTag::Cosine => f.write_str("cosine"),
        }
    }
}

/// Squared Euclidean distance.
#[derive(Debug, Clone, Default)]
pub struct L2 {
    query: Vec<f32>,
}

impl L2 {
    /// Creates an L2 functor with no fixed query.
    #[must_use]
    pub fn new() -> Self {
        Self { query: Vec::new() }
    }
}

impl<T: Element> Metric<T> for L2 {
    type Order = MinDistance;

    #[inline]
    fn fix_argument(&mut self, query: &[f32]) {
        self.query.clear();
        self.query.extend_from_slice(query);
    }

    #[inline]
    fn compute(&self, v: &[T]) -> f32 {
        debug_assert_eq!(self.query.len(), v.len());
        let mut sum = 0.0f32;
        for (q, x) in self.query.iter().zip(v.iter()) {
            let d = q - x.to_f32();
            sum += d * d;
        }
        sum
    }
}

/// Inner product similarity.
#[derive(Debug, Clone, Default)]
pub struct InnerProduct {
    query: Vec<f32>,
}

impl InnerProduct {
    /// Creates an inner-product functor with no fixed query.
    #[must_use]
    pub fn new() -> Self {
        Self { query: Vec::new() }
    }
}

impl<T: Element> Metric<T> for InnerProduct {
    type Order = MaxSimilarity;

    #[inline]
    fn fix_argument(&mut self, query: &[f32]) {
        self.query.clear();
        self.query.extend_from_slice(query);
    }

    #[inline]
    fn compute(&self, v: &[T]) -> f32 {
        debug_assert_eq!(self.query.len(), v.len());
        let mut sum = 0.0f32;
        for (q, x) in self.query.iter().zip(v.iter()) {
            sum += q * x.to_f32();
        }
        sum
    }
}

/// Cosine similarity.
///
/// `fix_argument` normalizes the query; `compute` divides by the stored
/// vector's norm, so stored vectors need not be normalized ahead of time.
#[derive(Debug, Clone, Default)]
pub struct Cosine {
    query: Vec<f32>,
}

impl Cosine {
    /// Creates a cosine functor with no fixed query.
    #[must_use]
    pub fn new() -> Self {
        Self { query: Vec::new() }
    }
}

impl<T: Element> Metric<T> for Cosine {
    type Order = MaxSimilarity;

    #[inline]
    fn fix_argument(&mut self, query: &[f32]) {
        self.query.clear();
        self.query.extend_from_slice(query);
        let norm = norm(&self.query);
        if norm > 0.0 {
            let inv = 1.0 / norm;
            for q in &mut self.query {
                *q *= inv;
            }
        }
    }

    #[inline]
    fn compute(&self, v: &[T]) -> f32 {
        debug_assert_eq!(self.query.len(), v.len());
        let mut dot = 0.0f32;
        let mut vnorm = 0.0f32;
        for (q, x) in self.query.iter().zip(v.iter()) {
            let x = x.to_f32();
            dot += q * x;
            vnorm += x * x;
        }
        if vnorm > 0.0 {
            dot / vnorm.sqrt()
        } else {
            0.0
        }
    }
}

/// Euclidean norm of a vector.
#[inline]
#[must_use]
pub fn norm(v: &[f32]) -> f32 {
    norm_square(v).sqrt()
}

/// Squared Euclidean norm of a vector.
#[inline]
#[must_use]
pub fn norm_square(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum()
}

/// Dot product of two equal-length vectors.
#[inline]
#[must_use]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use half::f16;

    #[test]
    fn test_l2_basic() {
        let mut m = L2::new();
        Metric::<f32>::fix_argument(&mut m, &[0.0, 0.0, 0.0]);
        assert_eq!(Metric::<f32>::compute(&m, &[3.0, 4.0, 0.0]), 25.0);
    }

    #[test]
    fn test_l2_over_f16() {
        let mut m = L2::new();
        Metric::<f16>::fix_argument(&mut m, &[1.0, 2.0]);
        let row = [f16::from_f32(1.0), f16::from_f32(2.0)];
        assert_eq!(m.compute(&row), 0.0);
    }

    #[test]
    fn test_inner_product_ordering() {
        // Larger dot product must compare as closer.
        assert!(MaxSimilarity::closer(5.0, 1.0));
        assert!(!MaxSimilarity::closer(1.0, 5.0));
        assert!(MinDistance::closer(1.0, 5.0));
    }

    #[test]
    fn test_cosine_normalizes_query() {
        let mut m = Cosine::new();
        Metric::<f32>::fix_argument(&mut m, &[10.0, 0.0]);
        // Same direction, different magnitude: similarity 1.
        let sim = Metric::<f32>::compute(&m, &[3.0, 0.0]);
        assert!((sim - 1.0).abs() < 1e-6);
        // Orthogonal: similarity 0.
        let sim = Metric::<f32>::compute(&m, &[0.0, 7.0]);
        assert!(sim.abs() < 1e-6);
    }

    #[test]
    fn test_tie_break_on_id() {
        let ord = MinDistance::total_cmp(1.0, 7, 1.0, 3);
        assert_eq!(ord, std::cmp::Ordering::Greater);
    }
}
