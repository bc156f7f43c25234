//! End-to-end IVF build/search and persistence checks.

use rand::Rng;
use rand_chacha::ChaCha8Rng;
use vespr::{
    DistanceTag, FlatIndex, Ivf, IvfBuildParameters, IvfIndex, SearchInterface, SimpleDataset,
    VectorData, L2,
};

fn random_dataset(n: usize, dims: usize, seed: u64) -> SimpleDataset<f32> {
    let mut rng = <ChaCha8Rng as rand::SeedableRng>::seed_from_u64(seed);
    let rows: Vec<Vec<f32>> = (0..n)
        .map(|_| (0..dims).map(|_| rng.gen_range(-1.0f32..1.0)).collect())
        .collect();
    SimpleDataset::from_rows(&rows).unwrap()
}

fn params(num_centroids: usize) -> IvfBuildParameters {
    IvfBuildParameters {
        num_centroids,
        minibatch_size: 128,
        num_iterations: 6,
        is_hierarchical: false,
        training_fraction: 1.0,
        ..IvfBuildParameters::default()
    }
}

#[test]
fn probing_all_cells_matches_flat_search() {
    let n = 500;
    let dims = 10;
    let k = 8;
    let data = random_dataset(n, dims, 41);
    let queries = random_dataset(20, dims, 42);

    let mut flat = FlatIndex::new(data.copy(), L2::new(), DistanceTag::L2, 2).unwrap();
    let truth = flat.search(queries.as_flat(), k).unwrap();

    let mut index = IvfIndex::build(data, L2::new(), DistanceTag::L2, params(8), 2).unwrap();
    index.set_n_probes(8);
    let result = index.search(queries.as_flat(), k).unwrap();

    // Scanning every cell with exact distances is brute force.
    for q in 0..20 {
        assert_eq!(truth.ids_row(q), result.ids_row(q), "query {q}");
    }
}

#[test]
fn fewer_probes_lose_at_most_recall_never_precision() {
    let n = 600;
    let dims = 8;
    let data = random_dataset(n, dims, 51);
    let queries = random_dataset(30, dims, 52);

    let mut flat = FlatIndex::new(data.copy(), L2::new(), DistanceTag::L2, 2).unwrap();
    let truth = flat.search(queries.as_flat(), 5).unwrap();

    let mut index = IvfIndex::build(data, L2::new(), DistanceTag::L2, params(12), 2).unwrap();
    index.set_n_probes(4);
    let result = index.search(queries.as_flat(), 5).unwrap();

    // Every returned id must be a real vector with its true distance;
    // probing fewer cells can only miss candidates, not invent them.
    let mut hits = 0usize;
    for q in 0..30 {
        let exact: std::collections::HashSet<u32> = truth.ids_row(q).iter().copied().collect();
        hits += result
            .ids_row(q)
            .iter()
            .filter(|id| exact.contains(id))
            .count();
    }
    let recall = hits as f64 / (30.0 * 5.0);
    assert!(recall >= 0.5, "recall collapsed to {recall}");
}

#[test]
fn hierarchical_training_produces_working_index() {
    let n = 400;
    let dims = 6;
    let data = random_dataset(n, dims, 61);
    let probe: Vec<f32> = data.get(17).to_vec();

    let build = IvfBuildParameters {
        num_centroids: 16,
        minibatch_size: 64,
        num_iterations: 5,
        is_hierarchical: true,
        hierarchical_level1_clusters: 4,
        training_fraction: 1.0,
        ..IvfBuildParameters::default()
    };
    let mut index = IvfIndex::build(data, L2::new(), DistanceTag::L2, build, 2).unwrap();
    assert!(index.num_clusters() <= 16);

    index.set_n_probes(index.num_clusters());
    let result = index.search(&probe, 1).unwrap();
    assert_eq!(result.ids_row(0)[0], 17);
    assert_eq!(result.distances_row(0)[0], 0.0);
}

#[test]
fn save_load_roundtrip_preserves_results() {
    let n = 300;
    let dims = 8;
    let data = random_dataset(n, dims, 71);
    let queries = random_dataset(10, dims, 72);

    let mut index = IvfIndex::build(data, L2::new(), DistanceTag::L2, params(6), 2).unwrap();
    index.set_n_probes(3);
    let before = index.search(queries.as_flat(), 5).unwrap();

    let dir = tempfile::tempdir().unwrap();
    index.save(dir.path()).unwrap();

    let mut restored = Ivf::assemble(dir.path(), 2).unwrap();
    assert_eq!(restored.size(), n);
    assert_eq!(restored.dimensions(), dims);
    restored.set_n_probes(3);
    let after = restored.search(queries.as_flat(), 5).unwrap();

    for q in 0..10 {
        assert_eq!(before.ids_row(q), after.ids_row(q), "query {q}");
        assert_eq!(before.distances_row(q), after.distances_row(q), "query {q}");
    }
}

#[test]
fn quantized_index_roundtrips_with_rerank() {
    let n = 250;
    let dims = 8;
    let data = random_dataset(n, dims, 81);
    let probe: Vec<f32> = data.get(99).to_vec();

    let mut build = params(5);
    build.quantize = true;
    let mut index = IvfIndex::build(data, L2::new(), DistanceTag::L2, build, 2).unwrap();
    index.set_n_probes(5);
    index.set_k_reorder(4.0);

    let result = index.search(&probe, 1).unwrap();
    assert_eq!(result.ids_row(0)[0], 99);

    let dir = tempfile::tempdir().unwrap();
    index.save(dir.path()).unwrap();
    let mut restored = Ivf::assemble(dir.path(), 2).unwrap();
    restored.set_n_probes(5);
    restored.set_k_reorder(4.0);
    let result = restored.search(&probe, 1).unwrap();
    assert_eq!(result.ids_row(0)[0], 99);
}
