//! Experiment store contract tests
//!
//! The same scenarios run against the in-memory and the SQLite backend so
//! both honor the `ConfigStore` contract identically.

use fedlab::experiment::{
    CheckpointRecord, ClientMetric, ConfigStore, ExperimentRecord, ExperimentStatus, MemoryStore,
    RoundMetrics, SqliteStore,
};
use fedlab::metrics::{Metrics, Scalar};

fn record(id: i64) -> ExperimentRecord {
    ExperimentRecord::builder(id, "contract")
        .num_clients(6)
        .num_rounds(4)
        .client_fraction(0.5)
        .learning_rate(0.02)
        .local_epochs(2)
        .model_path("uploads/model.rhai")
        .config_path("uploads/config.yaml")
        .build()
}

fn client(id: usize) -> ClientMetric {
    let mut metrics = Metrics::new();
    metrics.insert("train_accuracy".to_string(), Scalar::Float(0.5));
    ClientMetric {
        client_id: id,
        num_examples: 10 * (id + 1),
        metrics,
    }
}

fn memory() -> MemoryStore {
    let mut store = MemoryStore::new();
    store.add_experiment(record(1));
    store.connect().unwrap();
    store
}

fn sqlite() -> SqliteStore {
    let mut store = SqliteStore::new(":memory:");
    store.connect().unwrap();
    store.insert_experiment(&record(1)).unwrap();
    store
}

// ============================================================================
// Shared scenarios
// ============================================================================

fn check_load_config(store: &impl ConfigStore) {
    let loaded = store.load_config(1).unwrap();
    assert_eq!(loaded.num_clients(), 6);
    assert_eq!(loaded.num_rounds(), 4);
    assert!((loaded.client_fraction() - 0.5).abs() < f64::EPSILON);
    assert_eq!(loaded.local_epochs(), 2);
    assert_eq!(loaded.model_path(), Some("uploads/model.rhai"));
    assert_eq!(loaded.algorithm_path(), None);
    assert_eq!(loaded.status(), ExperimentStatus::Pending);

    let err = store.load_config(99).unwrap_err();
    assert_eq!(err.kind(), "NotFoundError");
    assert_eq!(err.status_message(), "NotFoundError: Experiment 99 not found");
}

fn check_failed_transition(store: &mut impl ConfigStore) {
    store
        .update_status(1, ExperimentStatus::Running, None)
        .unwrap();
    store
        .update_status(1, ExperimentStatus::Failed, Some("TrainingError: diverged"))
        .unwrap();
    let loaded = store.load_config(1).unwrap();
    assert_eq!(loaded.status(), ExperimentStatus::Failed);
    assert_eq!(loaded.error_message(), Some("TrainingError: diverged"));
    assert!(loaded.started_at().is_some());
    assert!(loaded.completed_at().is_some());
}

fn check_results_and_logs(store: &mut impl ConfigStore) {
    store.save_final_results(1, 0.91, 0.27).unwrap();
    store.save_logs(1, "round 1 done\nround 2 done\n").unwrap();
    store.save_logs(1, "replaced\n").unwrap();
    let loaded = store.load_config(1).unwrap();
    assert_eq!(loaded.final_accuracy(), Some(0.91));
    assert_eq!(loaded.final_loss(), Some(0.27));
    assert_eq!(loaded.logs(), Some("replaced\n"));
    assert!(store.save_final_results(2, 0.0, 0.0).is_err());
}

fn round_row(round: u32) -> RoundMetrics {
    RoundMetrics::builder(round)
        .train(Some(1.0 / f64::from(round)), Some(0.5))
        .eval(Some(0.8), None)
        .client_metrics(vec![client(0), client(3)])
        .build()
}

fn check_close(store: &mut impl ConfigStore) {
    store.close().unwrap();
    store.close().unwrap();
    assert_eq!(store.load_config(1).unwrap_err().kind(), "ConnectionError");
}

// ============================================================================
// In-memory backend
// ============================================================================

#[test]
fn test_memory_store_contract() {
    let mut store = memory();
    check_load_config(&store);
    check_failed_transition(&mut store);
    check_results_and_logs(&mut store);
    check_close(&mut store);
}

#[test]
fn test_memory_store_metrics_and_checkpoints() {
    let mut store = memory();
    for round in [2, 1, 3] {
        store.save_round_metrics(1, &round_row(round)).unwrap();
        store
            .record_checkpoint(
                1,
                &CheckpointRecord::new(
                    round,
                    format!("checkpoints-data/exp_1/round_{round}.ckpt"),
                    Some(0.5),
                    None,
                ),
            )
            .unwrap();
    }

    let rows = store.round_metrics(1);
    assert_eq!(rows.iter().map(RoundMetrics::round).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert_eq!(rows[0].client_metrics()[1].num_examples, 40);
    assert_eq!(rows[0].eval_accuracy(), None);

    let pointers = store.checkpoint_records(1);
    assert_eq!(pointers.len(), 3);
    assert_eq!(pointers[0].round(), 1);
    assert_eq!(pointers[0].loss(), None);
}

// ============================================================================
// SQLite backend
// ============================================================================

#[test]
fn test_sqlite_store_contract() {
    let mut store = sqlite();
    check_load_config(&store);
    check_failed_transition(&mut store);
    check_results_and_logs(&mut store);
    check_close(&mut store);
}

#[test]
fn test_sqlite_metrics_and_checkpoints() {
    let mut store = sqlite();
    for round in 1..=3 {
        store.save_round_metrics(1, &round_row(round)).unwrap();
    }
    store
        .record_checkpoint(
            1,
            &CheckpointRecord::new(3, "checkpoints-data/exp_1/round_3.ckpt", Some(0.6), Some(0.4)),
        )
        .unwrap();

    let rows = store.round_metrics(1).unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[2].round(), 3);
    assert_eq!(rows[1].train_loss(), Some(0.5));
    assert_eq!(rows[1].client_metrics(), round_row(2).client_metrics());

    let pointers = store.checkpoint_records(1).unwrap();
    assert_eq!(pointers.len(), 1);
    assert_eq!(pointers[0].accuracy(), Some(0.6));
    assert_eq!(pointers[0].loss(), Some(0.4));
}

#[test]
fn test_sqlite_survives_reconnect() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fl.db").to_string_lossy().to_string();

    let mut store = SqliteStore::new(path.clone());
    store.connect().unwrap();
    store.insert_experiment(&record(1)).unwrap();
    store.save_round_metrics(1, &round_row(1)).unwrap();
    store.close().unwrap();

    let mut reopened = SqliteStore::new(path);
    reopened.connect().unwrap();
    assert_eq!(reopened.load_config(1).unwrap().name(), "contract");
    assert_eq!(reopened.round_metrics(1).unwrap().len(), 1);
}

#[test]
fn test_sqlite_duplicate_experiment_is_error() {
    let store = sqlite();
    let err = store.insert_experiment(&record(1)).unwrap_err();
    assert_eq!(err.kind(), "SqliteError");
}
