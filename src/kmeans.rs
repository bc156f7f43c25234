//! Mini-batch k-means with empty-cluster splitting.
//!
//! Training proceeds in iterations over a (usually subsampled) training
//! set. Each minibatch is assigned to its nearest centroid through one
//! dense (batch × centroid) score matrix; centroids are then pulled toward
//! the mean of their assigned points with a damped update, empty centroids
//! are repaired by splitting a populated donor, and for inner-product
//! metrics the centroids are renormalized.
//!
//! The hierarchical variant first trains a small level-1 clustering, then
//! trains the remaining centroids independently inside each level-1 cell
//! and flattens the result; this keeps the per-step centroid count (and
//! with it the score-matrix width) small for large cluster budgets.

use crate::data::{SimpleDataset, VectorData};
use crate::distance::{norm_square, DistanceTag};
use crate::error::{Result, VesprError};
use crate::threads::{DisjointWriter, Partition, ThreadPool};
use rand::distributions::{Distribution, Uniform};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Perturbation applied when splitting an empty centroid.
pub const SPLIT_EPSILON: f32 = 1.0 / 1024.0;

/// Parameters for one k-means training run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KMeansConfig {
    /// Target number of centroids.
    pub clusters: usize,
    /// Rows per minibatch.
    pub minibatch_size: usize,
    /// Training iterations over the training set.
    pub iterations: usize,
    /// Metric driving assignment; inner-product and cosine renormalize
    /// centroids after every iteration.
    pub metric: DistanceTag,
    /// RNG seed for initialization and splitting.
    pub seed: u64,
}

impl KMeansConfig {
    fn is_similarity(&self) -> bool {
        !matches!(self.metric, DistanceTag::L2)
    }
}

/// `out[i][j] = dot(a[i], b[j])` for row-major `a` (m×k) and `b` (n×k).
///
/// `out` must hold `m * n` elements. The second operand is walked
/// row-by-row so both inputs stream sequentially.
pub fn matmul(a: &[f32], b: &[f32], out: &mut [f32], m: usize, n: usize, k: usize) {
    debug_assert_eq!(a.len(), m * k);
    debug_assert_eq!(b.len(), n * k);
    debug_assert_eq!(out.len(), m * n);
    for i in 0..m {
        let row = &a[i * k..(i + 1) * k];
        let out_row = &mut out[i * n..(i + 1) * n];
        for (j, out_val) in out_row.iter_mut().enumerate() {
            let centroid = &b[j * k..(j + 1) * k];
            let mut acc = 0.0f32;
            for (x, y) in row.iter().zip(centroid.iter()) {
                acc += x * y;
            }
            *out_val = acc;
        }
    }
}

/// Draws `count` distinct indices from `[0, range)`.
fn sample_unique(rng: &mut ChaCha8Rng, range: usize, count: usize) -> Vec<usize> {
    debug_assert!(count <= range);
    if count == 0 {
        return Vec::new();
    }
    let dist = Uniform::new(0, range);
    let mut seen = HashSet::with_capacity(count);
    let mut out = Vec::with_capacity(count);
    while out.len() < count {
        let j = dist.sample(rng);
        if seen.insert(j) {
            out.push(j);
        }
    }
    out
}

/// Copies a uniform sample of `fraction * data.size()` rows (at least
/// `min_rows`) into an f32 training set.
///
/// # Errors
///
/// Propagates worker panics.
pub fn make_training_set<T: crate::datatype::Element, D: VectorData<T>>(
    data: &D,
    fraction: f32,
    min_rows: usize,
    rng: &mut ChaCha8Rng,
    pool: &mut ThreadPool,
) -> Result<SimpleDataset<f32>> {
    let total = data.size();
    let count = (((total as f64) * f64::from(fraction)) as usize)
        .max(min_rows)
        .min(total);
    let ids = sample_unique(rng, total, count);
    let dims = data.dimensions();
    let mut trainset = SimpleDataset::<f32>::new(count, dims);
    {
        let writer = DisjointWriter::new(trainset.as_flat_mut());
        pool.parallel_for(Partition::fixed(count), |range, _| {
            for i in range {
                let row = data.get(ids[i]);
                for (j, x) in row.iter().enumerate() {
                    // SAFETY: row `i` belongs to exactly one worker.
                    unsafe { writer.write(i * dims + j, x.to_f32()) };
                }
            }
        })?;
    }
    Ok(trainset)
}

fn row_norms(data: &SimpleDataset<f32>, pool: &mut ThreadPool) -> Result<Vec<f32>> {
    let mut norms = vec![0.0f32; data.size()];
    {
        let writer = DisjointWriter::new(&mut norms);
        pool.parallel_for(Partition::fixed(data.size()), |range, _| {
            for i in range {
                // SAFETY: index `i` belongs to exactly one worker.
                unsafe { writer.write(i, norm_square(data.get(i))) };
            }
        })?;
    }
    Ok(norms)
}

fn normalize_rows(centroids: &mut SimpleDataset<f32>, pool: &mut ThreadPool) -> Result<()> {
    let dims = centroids.dimensions();
    let size = centroids.size();
    let writer = DisjointWriter::new(centroids.as_flat_mut());
    pool.parallel_for(Partition::fixed(size), |range, _| {
        for i in range {
            // SAFETY: each centroid row belongs to exactly one worker.
            let mut sum = 0.0f32;
            for j in 0..dims {
                let x = unsafe { writer.read(i * dims + j) };
                sum += x * x;
            }
            if sum > 0.0 {
                let inv = 1.0 / sum.sqrt();
                for j in 0..dims {
                    let x = unsafe { writer.read(i * dims + j) };
                    unsafe { writer.write(i * dims + j, x * inv) };
                }
            }
        }
    })?;
    Ok(())
}

/// Assigns every row of `data` to its nearest centroid.
///
/// Distances go through one (batch × centroid) score matrix per minibatch:
/// a dot-product `matmul` plus, for L2, the `‖x‖² + ‖c‖² − 2·x·c`
/// completion using precomputed norms.
///
/// # Errors
///
/// Propagates worker panics.
pub fn assign(
    data: &SimpleDataset<f32>,
    centroids: &SimpleDataset<f32>,
    metric: DistanceTag,
    minibatch_size: usize,
    pool: &mut ThreadPool,
) -> Result<Vec<u32>> {
    let n = data.size();
    let c = centroids.size();
    let dims = data.dimensions();
    if centroids.dimensions() != dims {
        return Err(VesprError::Config(format!(
            "centroid dims {} do not match data dims {}",
            centroids.dimensions(),
            dims
        )));
    }
    let is_similarity = !matches!(metric, DistanceTag::L2);
    let data_norms = if is_similarity {
        Vec::new()
    } else {
        row_norms(data, pool)?
    };
    let centroid_norms = if is_similarity {
        Vec::new()
    } else {
        row_norms(centroids, pool)?
    };

    let batchsize = minibatch_size.max(1);
    let mut assignments = vec![0u32; n];

    let mut start = 0;
    while start < n {
        let stop = (start + batchsize).min(n);
        let batch = stop - start;
        {
            let assign_writer = DisjointWriter::new(&mut assignments[start..stop]);
            pool.parallel_for(Partition::fixed(batch), |range, _| {
                let rows = range.len();
                let mut scores = vec![0.0f32; rows * c];
                matmul(
                    &data.as_flat()[(start + range.start) * dims..(start + range.end) * dims],
                    centroids.as_flat(),
                    &mut scores,
                    rows,
                    c,
                    dims,
                );
                for (r, i) in range.enumerate() {
                    let row_scores = &scores[r * c..(r + 1) * c];
                    let mut best = 0usize;
                    let mut best_score = f32::NEG_INFINITY;
                    for (j, &s) in row_scores.iter().enumerate() {
                        let score = if is_similarity {
                            s
                        } else {
                            // Negated L2 so "larger is better" holds on
                            // both paths.
                            -(data_norms[start + i] + centroid_norms[j] - 2.0 * s)
                        };
                        if score > best_score {
                            best_score = score;
                            best = j;
                        }
                    }
                    // SAFETY: each batch row belongs to one worker.
                    unsafe { assign_writer.write(i, best as u32) };
                }
            })?;
        }
        start = stop;
    }
    Ok(assignments)
}

/// Trains `config.clusters` centroids over `trainset`.
///
/// # Errors
///
/// Returns a configuration error when the training set is smaller than
/// the cluster budget; propagates worker panics.
pub fn train(
    config: &KMeansConfig,
    trainset: &SimpleDataset<f32>,
    pool: &mut ThreadPool,
) -> Result<SimpleDataset<f32>> {
    let n = trainset.size();
    let dims = trainset.dimensions();
    if config.clusters == 0 || config.clusters > n {
        return Err(VesprError::Config(format!(
            "cannot train {} clusters from {} training rows",
            config.clusters, n
        )));
    }

    let mut rng = <ChaCha8Rng as rand::SeedableRng>::seed_from_u64(config.seed);

    // Initialize centroids by sampling the training set without
    // replacement.
    let mut centroids = SimpleDataset::<f32>::new(config.clusters, dims);
    for (i, id) in sample_unique(&mut rng, n, config.clusters).into_iter().enumerate() {
        centroids.set(i, trainset.get(id));
    }
    if config.is_similarity() {
        normalize_rows(&mut centroids, pool)?;
    }

    for _ in 0..config.iterations {
        let assignments = assign(
            trainset,
            &centroids,
            config.metric,
            config.minibatch_size,
            pool,
        )?;

        // Damped mean update: each worker owns a centroid range and scans
        // all assignments, so no accumulator is shared.
        let mut counts = vec![0usize; config.clusters];
        let nthreads = pool.size();
        {
            let centroid_writer = DisjointWriter::new(centroids.as_flat_mut());
            let count_writer = DisjointWriter::new(&mut counts);
            pool.parallel_for(Partition::fixed(nthreads), |_, tid| {
                let my_centroids = crate::threads::balance(config.clusters, nthreads, tid);
                if my_centroids.is_empty() {
                    return;
                }
                let mut sums = vec![0.0f32; my_centroids.len() * dims];
                let mut local_counts = vec![0usize; my_centroids.len()];
                for (i, &a) in assignments.iter().enumerate() {
                    let a = a as usize;
                    if my_centroids.contains(&a) {
                        let offset = (a - my_centroids.start) * dims;
                        for (j, &x) in trainset.get(i).iter().enumerate() {
                            sums[offset + j] += x;
                        }
                        local_counts[a - my_centroids.start] += 1;
                    }
                }
                for (slot, centroid) in my_centroids.clone().enumerate() {
                    // SAFETY: centroid ranges are disjoint across workers.
                    unsafe { count_writer.write(centroid, local_counts[slot]) };
                    if local_counts[slot] == 0 {
                        continue;
                    }
                    let inv = 1.0 / (local_counts[slot] as f32 + 1.0);
                    for j in 0..dims {
                        let old = unsafe { centroid_writer.read(centroid * dims + j) };
                        unsafe {
                            centroid_writer
                                .write(centroid * dims + j, (old + sums[slot * dims + j]) * inv);
                        }
                    }
                }
            })?;
        }

        split_empty_centroids(&mut centroids, &mut counts, n, &mut rng);

        if config.is_similarity() {
            normalize_rows(&mut centroids, pool)?;
        }
    }

    Ok(centroids)
}

/// Repairs empty centroids by duplicating a populated donor and nudging
/// the pair apart by ±ε in alternating dimensions.
fn split_empty_centroids(
    centroids: &mut SimpleDataset<f32>,
    counts: &mut [usize],
    num_data: usize,
    rng: &mut ChaCha8Rng,
) {
    let num_centroids = centroids.size();
    let dims = centroids.dimensions();
    for i in 0..num_centroids {
        if counts[i] != 0 {
            continue;
        }
        // Pick a donor with probability proportional to its population.
        let mut j = 0usize;
        loop {
            if counts[j] != 0 {
                let p = counts[j] as f32 / num_data as f32;
                if rng.gen::<f32>() < p {
                    break;
                }
            }
            j = (j + 1) % num_centroids;
        }

        let donor: Vec<f32> = centroids.get(j).to_vec();
        centroids.set(i, &donor);
        for k in 0..dims {
            let (up, down) = if k % 2 == 0 {
                (1.0 + SPLIT_EPSILON, 1.0 - SPLIT_EPSILON)
            } else {
                (1.0 - SPLIT_EPSILON, 1.0 + SPLIT_EPSILON)
            };
            centroids.get_mut(i)[k] *= up;
            centroids.get_mut(j)[k] *= down;
        }
        counts[i] = counts[j] / 2;
        counts[j] -= counts[i];
    }
}

/// Trains hierarchically: `level1` coarse centroids first, then
/// `clusters / level1` centroids within each coarse cell, flattened.
///
/// # Errors
///
/// Propagates configuration errors and worker panics.
pub fn train_hierarchical(
    config: &KMeansConfig,
    level1: usize,
    trainset: &SimpleDataset<f32>,
    pool: &mut ThreadPool,
) -> Result<SimpleDataset<f32>> {
    let level1 = level1.max(1).min(config.clusters);
    let per_cell = config.clusters.div_ceil(level1);
    let dims = trainset.dimensions();

    let coarse_config = KMeansConfig {
        clusters: level1,
        ..config.clone()
    };
    let coarse = train(&coarse_config, trainset, pool)?;
    let assignments = assign(
        trainset,
        &coarse,
        config.metric,
        config.minibatch_size,
        pool,
    )?;

    let mut cells: Vec<Vec<u32>> = vec![Vec::new(); level1];
    for (i, &a) in assignments.iter().enumerate() {
        cells[a as usize].push(i as u32);
    }

    let mut flat: Vec<f32> = Vec::with_capacity(config.clusters * dims);
    for (cell_id, cell) in cells.iter().enumerate() {
        if cell.is_empty() {
            continue;
        }
        // A cell smaller than its budget contributes its rows directly.
        let budget = per_cell.min(cell.len());
        if budget == cell.len() {
            for &row in cell {
                flat.extend_from_slice(trainset.get(row as usize));
            }
            continue;
        }
        let mut cell_data = SimpleDataset::<f32>::new(cell.len(), dims);
        for (i, &row) in cell.iter().enumerate() {
            cell_data.set(i, trainset.get(row as usize));
        }
        let cell_config = KMeansConfig {
            clusters: budget,
            seed: config.seed.wrapping_add(cell_id as u64 + 1),
            ..config.clone()
        };
        let cell_centroids = train(&cell_config, &cell_data, pool)?;
        flat.extend_from_slice(cell_centroids.as_flat());
    }

    Ok(SimpleDataset::from_vec(flat, dims)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_blob_dataset() -> SimpleDataset<f32> {
        // Two well-separated blobs of 50 points each.
        let mut rows = Vec::new();
        let mut rng = <ChaCha8Rng as rand::SeedableRng>::seed_from_u64(7);
        for _ in 0..50 {
            rows.push(vec![10.0 + rng.gen::<f32>(), 10.0 + rng.gen::<f32>()]);
        }
        for _ in 0..50 {
            rows.push(vec![-10.0 + rng.gen::<f32>(), -10.0 + rng.gen::<f32>()]);
        }
        SimpleDataset::from_rows(&rows).unwrap()
    }

    #[test]
    fn test_matmul_small() {
        // a = [[1,2],[3,4]], b = [[5,6],[7,8]] (as rows): out = a * b^T
        let a = [1.0, 2.0, 3.0, 4.0];
        let b = [5.0, 6.0, 7.0, 8.0];
        let mut out = [0.0f32; 4];
        matmul(&a, &b, &mut out, 2, 2, 2);
        assert_eq!(out, [17.0, 23.0, 39.0, 53.0]);
    }

    #[test]
    fn test_two_cluster_separation() {
        let mut pool = ThreadPool::new(2).unwrap();
        let data = two_blob_dataset();
        let config = KMeansConfig {
            clusters: 2,
            minibatch_size: 32,
            iterations: 8,
            metric: DistanceTag::L2,
            seed: 42,
        };
        let centroids = train(&config, &data, &mut pool).unwrap();
        let assignments = assign(&data, &centroids, DistanceTag::L2, 32, &mut pool).unwrap();

        // Every point in a blob must land in the same cluster, and the two
        // blobs in different ones.
        let first = assignments[0];
        assert!(assignments[..50].iter().all(|&a| a == first));
        let second = assignments[50];
        assert!(assignments[50..].iter().all(|&a| a == second));
        assert_ne!(first, second);
    }

    #[test]
    fn test_assignments_partition_dataset() {
        let mut pool = ThreadPool::new(3).unwrap();
        let data = two_blob_dataset();
        let config = KMeansConfig {
            clusters: 5,
            minibatch_size: 16,
            iterations: 4,
            metric: DistanceTag::L2,
            seed: 3,
        };
        let centroids = train(&config, &data, &mut pool).unwrap();
        let assignments = assign(&data, &centroids, DistanceTag::L2, 16, &mut pool).unwrap();
        assert_eq!(assignments.len(), data.size());
        assert!(assignments.iter().all(|&a| (a as usize) < 5));
    }

    #[test]
    fn test_split_repairs_empty_centroids() {
        let mut centroids = SimpleDataset::<f32>::new(3, 2);
        centroids.set(0, &[1.0, 1.0]);
        centroids.set(1, &[0.0, 0.0]);
        centroids.set(2, &[0.0, 0.0]);
        let mut counts = vec![100, 0, 0];
        let mut rng = <ChaCha8Rng as rand::SeedableRng>::seed_from_u64(1);
        split_empty_centroids(&mut centroids, &mut counts, 100, &mut rng);
        assert!(counts.iter().all(|&c| c > 0));
        // The donor and the copy are perturbed apart.
        assert_ne!(centroids.get(0), centroids.get(1));
    }

    #[test]
    fn test_cluster_budget_validation() {
        let mut pool = ThreadPool::new(1).unwrap();
        let data = two_blob_dataset();
        let config = KMeansConfig {
            clusters: 1000,
            minibatch_size: 16,
            iterations: 1,
            metric: DistanceTag::L2,
            seed: 0,
        };
        assert!(matches!(
            train(&config, &data, &mut pool),
            Err(VesprError::Config(_))
        ));
    }

    #[test]
    fn test_hierarchical_centroid_count() {
        let mut pool = ThreadPool::new(2).unwrap();
        let data = two_blob_dataset();
        let config = KMeansConfig {
            clusters: 8,
            minibatch_size: 32,
            iterations: 3,
            metric: DistanceTag::L2,
            seed: 11,
        };
        let centroids = train_hierarchical(&config, 2, &data, &mut pool).unwrap();
        assert!(centroids.size() >= 2 && centroids.size() <= 8);
        assert_eq!(centroids.dimensions(), 2);
    }

    #[test]
    fn test_inner_product_centroids_normalized() {
        let mut pool = ThreadPool::new(2).unwrap();
        let data = two_blob_dataset();
        let config = KMeansConfig {
            clusters: 2,
            minibatch_size: 32,
            iterations: 4,
            metric: DistanceTag::InnerProduct,
            seed: 5,
        };
        let centroids = train(&config, &data, &mut pool).unwrap();
        for i in 0..centroids.size() {
            let n = norm_square(centroids.get(i)).sqrt();
            assert!((n - 1.0).abs() < 1e-4, "centroid {i} norm {n}");
        }
    }
}
