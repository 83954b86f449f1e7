//! Property-based tests for fedlab
//!
//! - Mathematical invariants of parameter and metric aggregation
//! - Export-contract detection on compiled modules
//! - Checkpoint round ordering on disk
//! - Run with ProptestConfig::with_cases(100) (16 for disk-backed cases)

use fedlab::checkpoint::CheckpointStore;
use fedlab::engine::{aggregate_median, aggregate_weighted};
use fedlab::loader::{Category, DeclaredNames};
use fedlab::metrics::{metric_f64, weighted_average, weighted_loss, Metrics, Scalar};
use fedlab::tensor::{StateDict, Tensor};
use proptest::prelude::*;

// ============================================================================
// Property Test Generators (Strategies)
// ============================================================================

/// Client updates: `(num_examples, values)` with a shared vector length
fn arb_updates(max_clients: usize) -> impl Strategy<Value = Vec<(usize, Vec<f32>)>> {
    (1..=8usize).prop_flat_map(move |len| {
        proptest::collection::vec(
            (1..500usize, proptest::collection::vec(-100.0f32..100.0, len)),
            1..=max_clients,
        )
    })
}

/// Client-reported accuracies with sample counts
fn arb_metric_results() -> impl Strategy<Value = Vec<(usize, f64)>> {
    proptest::collection::vec((1..1000usize, 0.0f64..1.0), 1..10)
}

fn tensors(values: &[f32]) -> Vec<Tensor> {
    vec![Tensor::new(vec![values.len()], values.to_vec()).unwrap()]
}

fn column_bounds(updates: &[(usize, Vec<f32>)], j: usize) -> (f32, f32) {
    updates.iter().map(|(_, v)| v[j]).fold(
        (f32::INFINITY, f32::NEG_INFINITY),
        |(lo, hi), x| (lo.min(x), hi.max(x)),
    )
}

const EXPORT_CANDIDATES: [&str; 6] =
    ["get_model", "Net", "Model", "helper", "load_data", "get_strategy"];

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    // ========================================================================
    // Aggregation Properties
    // ========================================================================

    /// Property: weighted parameter mean stays within each coordinate's range
    #[test]
    fn prop_weighted_mean_is_bounded(updates in arb_updates(6)) {
        let params: Vec<Vec<Tensor>> = updates.iter().map(|(_, v)| tensors(v)).collect();
        let refs: Vec<(usize, &[Tensor])> = updates
            .iter()
            .zip(&params)
            .map(|((n, _), p)| (*n, p.as_slice()))
            .collect();
        let averaged = aggregate_weighted(&refs).unwrap().unwrap();

        for (j, value) in averaged[0].data().iter().enumerate() {
            let (lo, hi) = column_bounds(&updates, j);
            prop_assert!(*value >= lo - 1e-3 && *value <= hi + 1e-3,
                "coordinate {} = {} outside [{}, {}]", j, value, lo, hi);
        }
    }

    /// Property: identical updates average to themselves, whatever the weights
    #[test]
    fn prop_weighted_mean_of_identical_updates(
        values in proptest::collection::vec(-10.0f32..10.0, 1..8),
        weights in proptest::collection::vec(1..100usize, 1..6)
    ) {
        let params = tensors(&values);
        let refs: Vec<(usize, &[Tensor])> = weights.iter().map(|n| (*n, params.as_slice())).collect();
        let averaged = aggregate_weighted(&refs).unwrap().unwrap();
        for (a, b) in averaged[0].data().iter().zip(&values) {
            prop_assert!((a - b).abs() < 1e-4);
        }
    }

    /// Property: coordinate-wise median stays within each coordinate's range
    #[test]
    fn prop_median_is_bounded(updates in arb_updates(7)) {
        let params: Vec<Vec<Tensor>> = updates.iter().map(|(_, v)| tensors(v)).collect();
        let refs: Vec<&[Tensor]> = params.iter().map(Vec::as_slice).collect();
        let median = aggregate_median(&refs).unwrap();

        for (j, value) in median[0].data().iter().enumerate() {
            let (lo, hi) = column_bounds(&updates, j);
            prop_assert!(*value >= lo && *value <= hi);
        }
    }

    /// Property: with an odd number of clients the median is one of the inputs
    #[test]
    fn prop_odd_median_is_an_input(
        updates in arb_updates(7).prop_filter("odd count", |u| u.len() % 2 == 1)
    ) {
        let params: Vec<Vec<Tensor>> = updates.iter().map(|(_, v)| tensors(v)).collect();
        let refs: Vec<&[Tensor]> = params.iter().map(Vec::as_slice).collect();
        let median = aggregate_median(&refs).unwrap();

        for (j, value) in median[0].data().iter().enumerate() {
            prop_assert!(updates.iter().any(|(_, v)| v[j] == *value));
        }
    }

    /// Property: weighted metric mean is bounded by client values
    #[test]
    fn prop_weighted_average_is_bounded(results in arb_metric_results()) {
        let reports: Vec<(usize, Metrics)> = results
            .iter()
            .map(|(n, acc)| {
                let mut metrics = Metrics::new();
                metrics.insert("accuracy".to_string(), Scalar::Float(*acc));
                metrics.insert("note".to_string(), Scalar::from("ignored"));
                (*n, metrics)
            })
            .collect();
        let merged = weighted_average(&reports);
        let value = metric_f64(&merged, "accuracy").unwrap();

        let lo = results.iter().map(|(_, a)| *a).fold(f64::INFINITY, f64::min);
        let hi = results.iter().map(|(_, a)| *a).fold(f64::NEG_INFINITY, f64::max);
        prop_assert!(value >= lo - 1e-9 && value <= hi + 1e-9);
        prop_assert!(!merged.contains_key("note"));
    }

    /// Property: weighted loss agrees with weighted metric mean
    #[test]
    fn prop_weighted_loss_matches_average(results in arb_metric_results()) {
        let loss = weighted_loss(&results).unwrap();
        let reports: Vec<(usize, Metrics)> = results
            .iter()
            .map(|(n, l)| (*n, std::iter::once(("loss".to_string(), Scalar::Float(*l))).collect()))
            .collect();
        let mean = metric_f64(&weighted_average(&reports), "loss").unwrap();
        prop_assert!((loss - mean).abs() < 1e-9);
    }

    // ========================================================================
    // Export Contract Properties
    // ========================================================================

    /// Property: a model module validates iff it declares one of its exports
    #[test]
    fn prop_model_contract_matches_declared_functions(
        names in proptest::sample::subsequence(EXPORT_CANDIDATES.to_vec(), 0..=EXPORT_CANDIDATES.len())
    ) {
        let source: String = names.iter().map(|n| format!("fn {n}() {{ 1 }}\n")).collect();
        let ast = rhai::Engine::new().compile(&source).unwrap();
        let declared = DeclaredNames::from_ast(&ast);

        let expected = names.iter().any(|n| matches!(*n, "get_model" | "Net" | "Model"));
        prop_assert_eq!(declared.satisfies(Category::Model), expected);
        prop_assert_eq!(
            declared.satisfies(Category::Strategy),
            names.contains(&"get_strategy")
        );
        prop_assert_eq!(declared.functions.len(), names.len());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    // ========================================================================
    // Checkpoint Properties
    // ========================================================================

    /// Property: listed rounds are ascending numerically, not lexically
    #[test]
    fn prop_checkpoint_rounds_sorted(
        rounds in proptest::collection::btree_set(1..500u32, 1..12)
    ) {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), 1);
        let mut state = StateDict::new();
        state.insert("w", Tensor::zeros(vec![1]));
        for round in rounds.iter().rev() {
            store.save(*round, &state, &Metrics::new(), None).unwrap();
        }

        let listed = store.list().unwrap();
        let expected: Vec<u32> = rounds.iter().copied().collect();
        prop_assert_eq!(&listed, &expected);
        let latest = store.load_latest().unwrap().unwrap();
        prop_assert_eq!(Some(&latest.round), rounds.iter().next_back());
    }
}
