//! End-to-end build/search checks for the static Vamana index.

use rand::Rng;
use rand_chacha::ChaCha8Rng;
use vespr::{
    DistanceTag, FlatIndex, InnerProduct, QueryResult, SearchInterface, SimpleDataset, Vamana,
    VamanaBuildParameters, VamanaIndex, VectorData, L2,
};

fn random_dataset(n: usize, dims: usize, seed: u64) -> SimpleDataset<f32> {
    let mut rng = <ChaCha8Rng as rand::SeedableRng>::seed_from_u64(seed);
    let rows: Vec<Vec<f32>> = (0..n)
        .map(|_| (0..dims).map(|_| rng.gen_range(-1.0f32..1.0)).collect())
        .collect();
    SimpleDataset::from_rows(&rows).unwrap()
}

fn default_build() -> VamanaBuildParameters {
    VamanaBuildParameters {
        alpha: 1.2,
        graph_max_degree: 32,
        window_size: 64,
        max_candidate_pool_size: 80,
        prune_to: 32,
        ..VamanaBuildParameters::default()
    }
}

#[test]
fn every_vertex_finds_itself() {
    let n = 1000;
    let dims = 32;
    let data = random_dataset(n, dims, 7);
    let queries: Vec<f32> = data.as_flat().to_vec();

    let mut index =
        VamanaIndex::build(data, L2::new(), DistanceTag::L2, default_build(), 4).unwrap();

    let result = index.search(&queries, 1).unwrap();
    for v in 0..n {
        assert_eq!(result.ids_row(v)[0], v as u32, "self-search failed for {v}");
        assert_eq!(result.distances_row(v)[0], 0.0);
    }
}

#[test]
fn recall_against_flat_reference() {
    let n = 800;
    let dims = 16;
    let k = 10;
    let data = random_dataset(n, dims, 21);
    let queries = random_dataset(40, dims, 22);

    let mut flat = FlatIndex::new(data.copy(), L2::new(), DistanceTag::L2, 2).unwrap();
    let truth = flat.search(queries.as_flat(), k).unwrap();

    let mut index =
        VamanaIndex::build(data, L2::new(), DistanceTag::L2, default_build(), 2).unwrap();
    index.set_search_window_size(96);
    let approx = index.search(queries.as_flat(), k).unwrap();

    let mut hits = 0usize;
    for q in 0..40 {
        let exact: std::collections::HashSet<u32> = truth.ids_row(q).iter().copied().collect();
        hits += approx
            .ids_row(q)
            .iter()
            .filter(|id| exact.contains(id))
            .count();
    }
    let recall = hits as f64 / (40 * k) as f64;
    assert!(recall >= 0.9, "recall@{k} = {recall}");
}

#[test]
fn window_size_trades_recall() {
    let n = 500;
    let dims = 12;
    let data = random_dataset(n, dims, 3);
    let queries = random_dataset(25, dims, 4);

    let mut flat = FlatIndex::new(data.copy(), L2::new(), DistanceTag::L2, 2).unwrap();
    let truth = flat.search(queries.as_flat(), 5).unwrap();

    let mut index =
        VamanaIndex::build(data, L2::new(), DistanceTag::L2, default_build(), 2).unwrap();

    let recall_at = |index: &mut VamanaIndex<f32, L2>, window: usize| {
        index.set_search_window_size(window);
        let approx = index.search(queries.as_flat(), 5).unwrap();
        let mut hits = 0usize;
        for q in 0..25 {
            let exact: std::collections::HashSet<u32> =
                truth.ids_row(q).iter().copied().collect();
            hits += approx
                .ids_row(q)
                .iter()
                .filter(|id| exact.contains(id))
                .count();
        }
        hits
    };

    let wide = recall_at(&mut index, 128);
    let narrow = recall_at(&mut index, 5);
    assert!(
        wide >= narrow,
        "larger window must not lose recall: {wide} < {narrow}"
    );
}

#[test]
fn inner_product_returns_largest_dots() {
    let n = 300;
    let dims = 8;
    let data = random_dataset(n, dims, 11);

    let mut flat = FlatIndex::new(
        data.copy(),
        InnerProduct::new(),
        DistanceTag::InnerProduct,
        2,
    )
    .unwrap();
    let queries = random_dataset(10, dims, 12);
    let truth = flat.search(queries.as_flat(), 3).unwrap();

    let params = VamanaBuildParameters {
        alpha: 1.2,
        graph_max_degree: 32,
        window_size: 64,
        max_candidate_pool_size: 80,
        prune_to: 32,
        ..VamanaBuildParameters::default()
    };
    let mut index = VamanaIndex::build(
        data,
        InnerProduct::new(),
        DistanceTag::InnerProduct,
        params,
        2,
    )
    .unwrap();
    index.set_search_window_size(128);
    let approx = index.search(queries.as_flat(), 3).unwrap();

    // The best match under a similarity metric is found almost always;
    // require it for a clear majority of queries.
    let mut top1_hits = 0;
    for q in 0..10 {
        if approx.ids_row(q)[0] == truth.ids_row(q)[0] {
            top1_hits += 1;
        }
    }
    assert!(top1_hits >= 7, "top-1 agreement {top1_hits}/10");
}

#[test]
fn manager_wraps_typed_index() {
    let data = random_dataset(200, 8, 31);
    let queries: Vec<f32> = data.get(42).to_vec();
    let index = VamanaIndex::build(
        data,
        L2::new(),
        DistanceTag::L2,
        VamanaBuildParameters {
            graph_max_degree: 16,
            window_size: 32,
            max_candidate_pool_size: 48,
            prune_to: 16,
            ..VamanaBuildParameters::default()
        },
        2,
    )
    .unwrap();

    let mut manager = Vamana::from_index(index);
    assert_eq!(manager.size(), 200);
    assert_eq!(manager.dimensions(), 8);
    assert_eq!(manager.get_num_threads(), 2);
    manager.set_num_threads(3).unwrap();
    assert_eq!(manager.get_num_threads(), 3);

    let result = manager.search(&queries, 1).unwrap();
    assert_eq!(result.ids_row(0)[0], 42);
    assert_ne!(result.ids_row(0)[0], QueryResult::SENTINEL_ID);
}
