//! End-to-end behaviour of the HNSW index through the `VectorIndex` surface:
//! result ordering, tombstones, allow-lists, recall against brute force,
//! batch inserts, range queries, update policies and compression.

use nori_hnsw::{HnswConfig, HnswError, HnswIndex, UpdatePolicy};
use nori_observe::{HnswEvt, HnswKind, RecordingMeter, VizEvent};
use nori_quant::{CompressionConfig, PQConfig, SQConfig};
use nori_vector::{DistanceFunction, Item, VectorError, VectorIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn random_vectors(n: usize, dims: usize, seed: u64) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| (0..dims).map(|_| rng.gen::<f32>()).collect())
        .collect()
}

fn config(dims: usize, distance: DistanceFunction) -> HnswConfig {
    HnswConfig {
        seed: Some(42),
        lock_shards: 32,
        ..HnswConfig::new(dims, distance)
    }
}

fn build(config: HnswConfig, vectors: &[Vec<f32>]) -> HnswIndex {
    let index = HnswIndex::in_memory(config).unwrap();
    for (i, v) in vectors.iter().enumerate() {
        index.add(i as u64, v).unwrap();
    }
    index
}

fn brute_force(
    vectors: &[Vec<f32>],
    query: &[f32],
    k: usize,
    distance: DistanceFunction,
    skip: &HashSet<u64>,
) -> Vec<u64> {
    let mut all: Vec<Item> = vectors
        .iter()
        .enumerate()
        .filter(|(i, _)| !skip.contains(&(*i as u64)))
        .map(|(i, v)| Item::new(i as u64, distance.distance(query, v)))
        .collect();
    all.sort_by(Item::cmp_closest_first);
    all.into_iter().take(k).map(|i| i.id).collect()
}

fn recall(found: &[u64], truth: &[u64]) -> f64 {
    let truth: HashSet<&u64> = truth.iter().collect();
    found.iter().filter(|id| truth.contains(id)).count() as f64 / truth.len() as f64
}

// ============================================================================
// Concrete scenarios
// ============================================================================

#[test]
fn test_small_l2_scenario_with_delete() {
    let index = HnswIndex::in_memory(config(2, DistanceFunction::Euclidean)).unwrap();
    index.add(1, &[0.0, 0.0]).unwrap();
    index.add(2, &[1.0, 0.0]).unwrap();
    index.add(3, &[0.0, 1.0]).unwrap();
    index.add(4, &[5.0, 5.0]).unwrap();

    let results = index.search_by_vector(&[0.0, 0.0], 2, None).unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].id, 1);
    assert_eq!(results[0].distance, 0.0);
    assert!(results[1].id == 2 || results[1].id == 3);
    assert_eq!(results[1].distance, 1.0);

    let all = index.search_by_vector(&[0.0, 0.0], 4, None).unwrap();
    assert_eq!(all[3].id, 4);
    assert!((all[3].distance - 50f32.sqrt()).abs() < 1e-5);

    index.delete(&[1]).unwrap();
    let results = index.search_by_vector(&[0.0, 0.0], 2, None).unwrap();
    let ids: BTreeSet<u64> = results.iter().map(|m| m.id).collect();
    assert_eq!(ids, BTreeSet::from([2, 3]));
}

#[test]
fn test_add_batch_dimension_mismatch_leaves_graph_unchanged() {
    let index = HnswIndex::in_memory(config(3, DistanceFunction::Euclidean)).unwrap();
    index.add(100, &[1.0, 1.0, 1.0]).unwrap();

    let cancel = CancellationToken::new();
    let result = index.add_batch(
        &cancel,
        &[1, 2, 3],
        &[vec![0.0, 0.0, 0.0], vec![1.0, 2.0], vec![3.0, 3.0, 3.0]],
    );

    assert!(matches!(
        result,
        Err(HnswError::Vector(VectorError::DimensionMismatch {
            expected: 3,
            actual: 2
        }))
    ));
    assert_eq!(index.already_indexed(), 1);
    assert!(!index.contains_node(1));
    assert!(!index.contains_node(3));
}

#[test]
fn test_add_batch_inserts_everything() {
    let vectors = random_vectors(200, 8, 1);
    let ids: Vec<u64> = (1000..1200).collect();
    let index = HnswIndex::in_memory(config(8, DistanceFunction::Euclidean)).unwrap();

    index
        .add_batch(&CancellationToken::new(), &ids, &vectors)
        .unwrap();
    assert_eq!(index.already_indexed(), 200);

    let results = index.search_by_vector(&vectors[17], 1, None).unwrap();
    assert_eq!(results[0].id, 1017);
}

#[test]
fn test_add_batch_length_mismatch() {
    let index = HnswIndex::in_memory(config(2, DistanceFunction::Euclidean)).unwrap();
    let result = index.add_batch(&CancellationToken::new(), &[1, 2], &[vec![0.0, 0.0]]);
    assert!(result.is_err());
    assert_eq!(index.already_indexed(), 0);
}

// ============================================================================
// Testable properties
// ============================================================================

#[test]
fn test_results_sorted_ascending() {
    let vectors = random_vectors(500, 16, 2);
    for distance in [
        DistanceFunction::Euclidean,
        DistanceFunction::Cosine,
        DistanceFunction::InnerProduct,
    ] {
        let index = build(config(16, distance), &vectors);
        for query in random_vectors(10, 16, 3) {
            let results = index.search_by_vector(&query, 20, None).unwrap();
            assert_eq!(results.len(), 20);
            for pair in results.windows(2) {
                assert!(pair[0].distance <= pair[1].distance, "{:?}", distance);
            }
        }
    }
}

#[test]
fn test_tombstoned_ids_never_returned() {
    let vectors = random_vectors(400, 8, 4);
    let index = build(config(8, DistanceFunction::Euclidean), &vectors);

    let deleted: HashSet<u64> = (0..400).filter(|i| i % 4 == 0).collect();
    index.delete(&deleted.iter().copied().collect::<Vec<_>>()).unwrap();

    for query in random_vectors(20, 8, 5) {
        let results = index.search_by_vector(&query, 10, None).unwrap();
        assert_eq!(results.len(), 10);
        assert!(results.iter().all(|m| !deleted.contains(&m.id)));
    }

    // a deleted id's own vector still finds live neighbours
    let results = index.search_by_vector(&vectors[8], 5, None).unwrap();
    assert!(results.iter().all(|m| m.id != 8));
}

#[test]
fn test_allow_list_containment_graph_and_flat() {
    let vectors = random_vectors(600, 8, 6);
    let allow: HashSet<u64> = (0..600).filter(|i| i % 5 == 1).collect();

    for cutoff in [0, 10_000] {
        let index = build(
            HnswConfig {
                flat_search_cutoff: cutoff,
                ..config(8, DistanceFunction::Euclidean)
            },
            &vectors,
        );
        for query in random_vectors(10, 8, 7) {
            let results = index.search_by_vector(&query, 10, Some(&allow)).unwrap();
            assert!(!results.is_empty());
            assert!(results.iter().all(|m| allow.contains(&m.id)));
        }
    }
}

#[test]
fn test_empty_allow_list_returns_nothing() {
    let vectors = random_vectors(50, 4, 8);
    let index = build(config(4, DistanceFunction::Euclidean), &vectors);
    let allow: HashSet<u64> = HashSet::new();
    let results = index.search_by_vector(&vectors[0], 5, Some(&allow)).unwrap();
    assert!(results.is_empty());
}

#[test]
fn test_flat_fallback_matches_brute_force_exactly() {
    let vectors = random_vectors(300, 12, 9);
    let index = build(config(12, DistanceFunction::Euclidean), &vectors);
    let allow: BTreeSet<u64> = (0..300).collect();

    for query in random_vectors(10, 12, 10) {
        let results = index.search_by_vector(&query, 10, Some(&allow)).unwrap();
        let found: Vec<u64> = results.iter().map(|m| m.id).collect();
        let truth = brute_force(
            &vectors,
            &query,
            10,
            DistanceFunction::Euclidean,
            &HashSet::new(),
        );
        assert_eq!(found, truth);
    }
}

#[test]
fn test_graph_search_exact_when_ef_covers_dataset() {
    let vectors = random_vectors(150, 6, 11);
    let index = build(
        HnswConfig {
            ef_search: Some(150),
            ..config(6, DistanceFunction::Euclidean)
        },
        &vectors,
    );

    for query in random_vectors(10, 6, 12) {
        let results = index.search_by_vector(&query, 5, None).unwrap();
        let found: Vec<u64> = results.iter().map(|m| m.id).collect();
        let truth = brute_force(
            &vectors,
            &query,
            5,
            DistanceFunction::Euclidean,
            &HashSet::new(),
        );
        assert_eq!(found, truth);
    }
}

#[test]
fn test_recall_does_not_drop_as_ef_grows() {
    let vectors = random_vectors(1000, 16, 13);
    let queries = random_vectors(30, 16, 14);
    let none = HashSet::new();
    let truths: Vec<Vec<u64>> = queries
        .iter()
        .map(|q| brute_force(&vectors, q, 10, DistanceFunction::Euclidean, &none))
        .collect();

    let mut recalls = Vec::new();
    for ef in [10, 40, 160, 640] {
        let index = build(
            HnswConfig {
                m: 8,
                m_max0: 16,
                ef_construction: 100,
                ef_search: Some(ef),
                ..config(16, DistanceFunction::Euclidean)
            },
            &vectors,
        );
        let total: f64 = queries
            .iter()
            .zip(&truths)
            .map(|(q, truth)| {
                let found: Vec<u64> = index
                    .search_by_vector(q, 10, None)
                    .unwrap()
                    .iter()
                    .map(|m| m.id)
                    .collect();
                recall(&found, truth)
            })
            .sum();
        recalls.push(total / queries.len() as f64);
    }

    for pair in recalls.windows(2) {
        assert!(pair[1] + 1e-9 >= pair[0], "recall fell: {:?}", recalls);
    }
    assert!(recalls[3] >= 0.95, "recall at ef=640: {:?}", recalls);
}

// ============================================================================
// Range search
// ============================================================================

#[test]
fn test_range_search_returns_everything_inside_radius() {
    // points on a line, one unit apart
    let vectors: Vec<Vec<f32>> = (0..300).map(|i| vec![i as f32, 0.0]).collect();
    let index = build(config(2, DistanceFunction::Euclidean), &vectors);

    let results = index
        .search_by_vector_distance(&[150.0, 0.0], 120.5, None, None)
        .unwrap();
    assert_eq!(results.len(), 241);
    assert!(results.iter().all(|m| m.distance <= 120.5));
    for pair in results.windows(2) {
        assert!(pair[0].distance <= pair[1].distance);
    }

    let capped = index
        .search_by_vector_distance(&[150.0, 0.0], 120.5, Some(7), None)
        .unwrap();
    assert_eq!(capped.len(), 7);
    assert_eq!(capped[0].id, 150);

    let none = index
        .search_by_vector_distance(&[150.5, 10.0], 1.0, None, None)
        .unwrap();
    assert!(none.is_empty());
}

// ============================================================================
// Updates
// ============================================================================

#[test]
fn test_reinsert_updates_vector() {
    for policy in [UpdatePolicy::Repair, UpdatePolicy::ReplaceVectorOnly] {
        let vectors: Vec<Vec<f32>> = (0..50).map(|i| vec![i as f32, 0.0]).collect();
        let index = build(
            HnswConfig {
                update_policy: policy,
                ..config(2, DistanceFunction::Euclidean)
            },
            &vectors,
        );

        index.add(10, &[100.0, 0.0]).unwrap();
        assert_eq!(index.already_indexed(), 50);

        let results = index.search_by_vector(&[100.0, 0.0], 1, None).unwrap();
        assert_eq!(results[0].id, 10, "{:?}", policy);
        assert_eq!(results[0].distance, 0.0);
    }
}

#[test]
fn test_reinsert_clears_tombstone() {
    let vectors: Vec<Vec<f32>> = (0..30).map(|i| vec![i as f32, 1.0]).collect();
    let index = build(config(2, DistanceFunction::Euclidean), &vectors);

    index.delete(&[7]).unwrap();
    assert!(index.is_tombstoned(7));
    index.add(7, &[7.0, 1.0]).unwrap();
    assert!(!index.is_tombstoned(7));

    let results = index.search_by_vector(&[7.0, 1.0], 1, None).unwrap();
    assert_eq!(results[0].id, 7);
}

#[test]
fn test_cleanup_then_search() {
    let vectors = random_vectors(300, 8, 15);
    let index = build(config(8, DistanceFunction::Euclidean), &vectors);

    let deleted: HashSet<u64> = (0..300).filter(|i| i % 2 == 0).collect();
    index.delete(&deleted.iter().copied().collect::<Vec<_>>()).unwrap();
    assert_eq!(index.cleanup_tombstones().unwrap(), 150);
    assert_eq!(index.already_indexed(), 150);

    for query in random_vectors(10, 8, 16) {
        let results = index.search_by_vector(&query, 10, None).unwrap();
        let found: Vec<u64> = results.iter().map(|m| m.id).collect();
        let truth = brute_force(&vectors, &query, 10, DistanceFunction::Euclidean, &deleted);
        assert!(recall(&found, &truth) >= 0.8, "{:?} vs {:?}", found, truth);
    }
}

// ============================================================================
// Compression
// ============================================================================

fn check_compressed_search(compression: CompressionConfig, distance: DistanceFunction) {
    let vectors = random_vectors(400, 16, 17);
    let index = build(
        HnswConfig {
            compression,
            rescore_limit: 100,
            ..config(16, distance)
        },
        &vectors,
    );
    assert!(index.compressed());

    let none = HashSet::new();
    let mut total = 0.0;
    let queries = random_vectors(10, 16, 18);
    for query in &queries {
        let results = index.search_by_vector(query, 10, None).unwrap();
        assert_eq!(results.len(), 10);
        for pair in results.windows(2) {
            assert!(pair[0].distance <= pair[1].distance);
        }
        let found: Vec<u64> = results.iter().map(|m| m.id).collect();
        total += recall(&found, &brute_force(&vectors, query, 10, distance, &none));
    }
    assert!(total / queries.len() as f64 >= 0.7);

    // rescored distances are exact
    let results = index.search_by_vector(&vectors[3], 1, None).unwrap();
    assert_eq!(results[0].id, 3);
    assert!(results[0].distance.abs() < 1e-5 || distance == DistanceFunction::InnerProduct);
}

#[test]
fn test_scalar_quantized_search_with_rescore() {
    check_compressed_search(
        CompressionConfig::Scalar(SQConfig {
            training_limit: 200,
        }),
        DistanceFunction::Euclidean,
    );
    check_compressed_search(
        CompressionConfig::Scalar(SQConfig {
            training_limit: 200,
        }),
        DistanceFunction::Cosine,
    );
}

#[test]
fn test_product_quantized_search_with_rescore() {
    check_compressed_search(
        CompressionConfig::Product(PQConfig {
            num_subspaces: 4,
            bits_per_code: 6,
            kmeans_iterations: 10,
            training_sample_size: 1000,
            training_limit: 200,
        }),
        DistanceFunction::Euclidean,
    );
}

#[test]
fn test_manual_compress_disabled() {
    let index = HnswIndex::in_memory(config(2, DistanceFunction::Euclidean)).unwrap();
    index.add(1, &[0.0, 1.0]).unwrap();
    assert!(matches!(index.compress(), Err(HnswError::Config(_))));
}

// ============================================================================
// Config
// ============================================================================

#[test]
fn test_config_from_yaml_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hnsw.yaml");
    std::fs::write(
        &path,
        "dimensions: 4\ndistance: cosine\nm: 12\nm_max0: 24\nflat_search_cutoff: 100\n\
         compression:\n  type: scalar\n  training_limit: 500\n",
    )
    .unwrap();

    let config = HnswConfig::from_yaml_file(&path).unwrap();
    assert_eq!(config.dimensions, 4);
    assert_eq!(config.distance, DistanceFunction::Cosine);
    assert_eq!(config.m, 12);
    assert_eq!(config.compression.training_limit(), Some(500));

    let index = HnswIndex::in_memory(config).unwrap();
    index.add(1, &[1.0, 0.0, 0.0, 0.0]).unwrap();
    assert_eq!(index.already_indexed(), 1);
}

#[test]
fn test_metrics_and_events_are_reported() {
    let meter = RecordingMeter::new();
    let index = HnswIndex::in_memory(config(4, DistanceFunction::Euclidean))
        .unwrap()
        .with_meter(Arc::new(meter.clone()), "docs");
    let vectors = random_vectors(100, 4, 30);
    for (i, v) in vectors.iter().enumerate() {
        index.add(i as u64, v).unwrap();
    }
    assert_eq!(meter.counter_value("hnsw_inserts_total"), 100);
    assert_eq!(meter.gauge_value("hnsw_nodes"), Some(100));

    let allow: HashSet<u64> = (0..20).collect();
    index.search_by_vector(&vectors[0], 5, Some(&allow)).unwrap();
    index.search_by_vector(&vectors[0], 5, None).unwrap();
    assert_eq!(meter.counter_value("hnsw_searches_total"), 2);
    assert_eq!(meter.counter_value("hnsw_flat_searches_total"), 1);
    assert_eq!(meter.sample_count("hnsw_search_ms"), 2);

    index.delete(&(0..10).collect::<Vec<_>>()).unwrap();
    assert_eq!(meter.counter_value("hnsw_deletes_total"), 10);
    assert_eq!(meter.gauge_value("hnsw_tombstones"), Some(10));

    index.cleanup_tombstones().unwrap();
    assert_eq!(meter.counter_value("hnsw_tombstones_cleaned_total"), 10);
    assert_eq!(meter.gauge_value("hnsw_tombstones"), Some(0));
    assert_eq!(meter.gauge_value("hnsw_nodes"), Some(90));

    let events = meter.events();
    assert!(events.contains(&VizEvent::Hnsw(HnswEvt {
        index: "docs",
        kind: HnswKind::FlatSearch { candidates: 20 },
    })));
    assert!(events.contains(&VizEvent::Hnsw(HnswEvt {
        index: "docs",
        kind: HnswKind::CleanupStart { tombstones: 10 },
    })));
    assert!(events.iter().any(|e| matches!(
        e,
        VizEvent::Hnsw(HnswEvt {
            kind: HnswKind::CleanupFinish { reclaimed: 10, .. },
            ..
        })
    )));
}
