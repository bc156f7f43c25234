//! Insert/delete/consolidate/compact lifecycle of the dynamic index.

use rand::Rng;
use rand_chacha::ChaCha8Rng;
use vespr::graph::GraphView;
use vespr::{
    DistanceTag, DynamicVamana, DynamicVamanaIndex, SearchInterface, VamanaBuildParameters, L2,
};

fn params() -> VamanaBuildParameters {
    VamanaBuildParameters {
        graph_max_degree: 16,
        window_size: 32,
        max_candidate_pool_size: 48,
        prune_to: 16,
        ..VamanaBuildParameters::default()
    }
}

fn random_rows(n: usize, dims: usize, seed: u64) -> Vec<Vec<f32>> {
    let mut rng = <ChaCha8Rng as rand::SeedableRng>::seed_from_u64(seed);
    (0..n)
        .map(|_| (0..dims).map(|_| rng.gen_range(-1.0f32..1.0)).collect())
        .collect()
}

#[test]
fn inserted_vectors_are_found() {
    let rows = random_rows(100, 8, 5);
    let mut index =
        DynamicVamanaIndex::new(8, L2::new(), DistanceTag::L2, params(), 2).unwrap();
    for (i, row) in rows.iter().enumerate() {
        index.insert(i as u32, row).unwrap();
    }
    assert_eq!(index.size(), 100);

    for probe in [0usize, 33, 99] {
        let result = index.search(&rows[probe], 1).unwrap();
        assert_eq!(result.ids_row(0)[0], probe as u32);
        assert_eq!(result.distances_row(0)[0], 0.0);
    }
}

#[test]
fn deleted_ids_never_returned_and_recall_survives_consolidation() {
    let dims = 8;
    let rows = random_rows(100, dims, 9);
    let mut index =
        DynamicVamanaIndex::new(dims, L2::new(), DistanceTag::L2, params(), 2).unwrap();
    for (i, row) in rows.iter().enumerate() {
        index.insert(i as u32, row).unwrap();
    }
    for id in 0..50u32 {
        index.delete(id).unwrap();
    }

    // Soft-deleted: still traversed, never returned.
    let result = index.search(&rows[0], 10).unwrap();
    let returned: Vec<u32> = result.ids_row(0).to_vec();
    assert_eq!(returned.iter().filter(|&&id| id < 50).count(), 0);
    assert_eq!(
        returned
            .iter()
            .filter(|&&id| id != vespr::QueryResult::SENTINEL_ID)
            .count(),
        10,
        "ten live results expected"
    );

    index.consolidate().unwrap();
    index.compact().unwrap();
    assert_eq!(index.size(), 50);

    // Behaviour preserved after consolidate + compact.
    let result = index.search(&rows[0], 10).unwrap();
    for &id in result.ids_row(0) {
        assert!((50..100).contains(&id), "unexpected id {id}");
    }

    // No adjacency list may mention a slot beyond the compacted range.
    let graph = index.graph();
    for v in 0..graph.num_nodes() as u32 {
        for &n in graph.neighbors(v) {
            assert!((n as usize) < graph.num_nodes());
            assert_ne!(n, v);
        }
        let list = graph.neighbors(v);
        assert!(list.windows(2).all(|w| w[0] < w[1]));
    }

    // Deleted externals can be reinserted after compaction.
    index.insert(7, &rows[7]).unwrap();
    let result = index.search(&rows[7], 1).unwrap();
    assert_eq!(result.ids_row(0)[0], 7);
}

#[test]
fn delete_then_reinsert_same_id() {
    let rows = random_rows(20, 4, 13);
    let mut index =
        DynamicVamanaIndex::new(4, L2::new(), DistanceTag::L2, params(), 1).unwrap();
    for (i, row) in rows.iter().enumerate() {
        index.insert(i as u32, row).unwrap();
    }
    index.delete(5).unwrap();
    assert!(!index.contains(5));

    // The same external id is free for reuse immediately.
    index.insert(5, &rows[5]).unwrap();
    assert!(index.contains(5));
    let result = index.search(&rows[5], 1).unwrap();
    assert_eq!(result.ids_row(0)[0], 5);
}

#[test]
fn save_load_roundtrip_preserves_results() {
    let dims = 6;
    let rows = random_rows(60, dims, 17);
    let mut index =
        DynamicVamanaIndex::new(dims, L2::new(), DistanceTag::L2, params(), 2).unwrap();
    for (i, row) in rows.iter().enumerate() {
        index.insert(i as u32, row).unwrap();
    }
    for id in 10..20u32 {
        index.delete(id).unwrap();
    }

    let queries: Vec<f32> = rows[3].clone();
    let before = index.search(&queries, 5).unwrap();

    let dir = tempfile::tempdir().unwrap();
    index.save(dir.path()).unwrap();

    let mut restored = DynamicVamana::assemble(dir.path(), 2).unwrap();
    assert_eq!(restored.size(), 50);
    assert_eq!(restored.dimensions(), dims);
    assert!(!restored.contains(15));
    assert!(restored.contains(3));

    let after = restored.search(&queries, 5).unwrap();
    assert_eq!(before.ids_row(0), after.ids_row(0));
    assert_eq!(before.distances_row(0), after.distances_row(0));

    // The restored index keeps mutating correctly.
    restored.insert(200, &rows[0]).unwrap();
    assert!(restored.contains(200));
    restored.delete(200).unwrap();
    assert!(!restored.contains(200));
}
