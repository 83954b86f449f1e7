//! End-to-end runs of the round orchestrator
//!
//! Each test seeds an experiment row, runs it against a temporary project
//! root and inspects what the run persisted: status, round metrics,
//! checkpoint files and pointer rows, final results and the run log.

use std::path::Path;

use fedlab::experiment::{
    ConfigStore, ExperimentRecord, ExperimentStatus, MemoryStore, SqliteStore,
};
use fedlab::metrics::Scalar;
use fedlab::orchestrator::{Device, Phase, RoundOrchestrator, SystemResources};
use fedlab::settings::RunnerSettings;

// ============================================================================
// Helpers
// ============================================================================

fn write_upload(root: &Path, rel: &str, body: &str) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, body).unwrap();
}

fn settings(root: &Path) -> RunnerSettings {
    let mut settings = RunnerSettings::new("unused.db", root);
    settings.workers = Some(2);
    settings
}

fn base_record(id: i64) -> fedlab::experiment::ExperimentRecordBuilder {
    ExperimentRecord::builder(id, "e2e")
        .num_clients(4)
        .num_rounds(3)
        .client_fraction(0.5)
        .learning_rate(0.05)
        .local_epochs(1)
}

fn run_in_memory(
    root: &Path,
    record: ExperimentRecord,
) -> (fedlab::Result<fedlab::orchestrator::RunSummary>, MemoryStore, Phase) {
    let mut store = MemoryStore::new();
    store.add_experiment(record);
    let mut orchestrator = RoundOrchestrator::new(1, store, settings(root))
        .unwrap()
        .with_resources(SystemResources::cpu_only(2));
    let outcome = orchestrator.run();
    let phase = orchestrator.phase();
    (outcome, orchestrator.into_store(), phase)
}

// ============================================================================
// Default components
// ============================================================================

#[test]
fn test_default_run_completes_and_persists_every_round() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = MemoryStore::new();
    store.add_experiment(base_record(1).build());

    let mut orchestrator = RoundOrchestrator::new(1, store, settings(dir.path()))
        .unwrap()
        .with_resources(SystemResources::cpu_only(2));
    let summary = orchestrator.run().unwrap();

    assert_eq!(orchestrator.phase(), Phase::Completed);
    assert_eq!(summary.device, Device::Cpu);
    assert_eq!(summary.rounds.len(), 3);
    assert!(summary.final_accuracy.is_some());
    assert!(summary.final_loss.is_some());
    assert_eq!(orchestrator.checkpoints().list().unwrap(), vec![1, 2, 3]);
    assert!(orchestrator.logs().contains("starting simulation"));

    let store = orchestrator.into_store();
    assert!(!store.is_connected());

    let rows = store.round_metrics(1);
    let rounds: Vec<u32> = rows.iter().map(|r| r.round()).collect();
    assert_eq!(rounds, vec![1, 2, 3]);
    for row in &rows {
        assert!(row.train_loss().is_some());
        assert!(row.eval_loss().is_some());
        assert_eq!(row.client_metrics().len(), 2);
    }

    let pointers = store.checkpoint_records(1);
    assert_eq!(pointers.len(), 3);
    assert_eq!(pointers[2].file_path(), "checkpoints-data/exp_1/round_3.ckpt");

    let experiment = store.experiment(1).unwrap();
    assert_eq!(experiment.status(), ExperimentStatus::Completed);
    assert!(experiment.started_at().is_some());
    assert!(experiment.completed_at().is_some());
    assert_eq!(experiment.final_accuracy(), summary.final_accuracy);
    assert!(experiment.logs().unwrap().contains("experiment completed"));
}

#[test]
fn test_latest_checkpoint_matches_last_round() {
    let dir = tempfile::tempdir().unwrap();
    let (outcome, _store, _) = run_in_memory(dir.path(), base_record(1).num_rounds(2).build());
    outcome.unwrap();

    let checkpoints = fedlab::checkpoint::CheckpointStore::new(dir.path(), 1);
    let latest = checkpoints.load_latest().unwrap().unwrap();
    assert_eq!(latest.round, 2);
    assert_eq!(latest.model_state.len(), 4);
    assert!(latest.metrics.contains_key("train_loss"));
}

#[test]
fn test_sqlite_store_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("fl.db");
    let db = db.to_string_lossy().to_string();

    let mut seed = SqliteStore::new(db.clone());
    seed.connect().unwrap();
    seed.insert_experiment(&base_record(5).num_rounds(2).build())
        .unwrap();
    seed.close().unwrap();

    let mut orchestrator = RoundOrchestrator::new(5, SqliteStore::new(db.clone()), settings(dir.path()))
        .unwrap()
        .with_resources(SystemResources::cpu_only(2));
    orchestrator.run().unwrap();

    let mut reader = SqliteStore::new(db);
    reader.connect().unwrap();
    let experiment = reader.experiment(5).unwrap().unwrap();
    assert_eq!(experiment.status(), ExperimentStatus::Completed);
    assert!(experiment.final_loss().is_some());
    assert!(experiment.logs().unwrap().contains("starting simulation"));
    assert_eq!(reader.round_metrics(5).unwrap().len(), 2);

    let pointers = reader.checkpoint_records(5).unwrap();
    assert_eq!(pointers.len(), 2);
    assert_eq!(pointers[0].file_path(), "checkpoints-data/exp_5/round_1.ckpt");
}

// ============================================================================
// Fault injection
// ============================================================================

#[test]
fn test_missing_algorithm_file_fails_run() {
    let dir = tempfile::tempdir().unwrap();
    let record = base_record(1).algorithm_path("algos/missing.rhai").build();
    let (outcome, store, phase) = run_in_memory(dir.path(), record);

    let err = outcome.unwrap_err();
    assert_eq!(err.kind(), "ModuleResolutionError");
    assert_eq!(phase, Phase::Failed);

    let experiment = store.experiment(1).unwrap();
    assert_eq!(experiment.status(), ExperimentStatus::Failed);
    let message = experiment.error_message().unwrap();
    assert!(message.starts_with("ModuleResolutionError: "));
    assert!(message.contains("algos/missing.rhai"));
    assert!(store.round_metrics(1).is_empty());
    assert!(experiment.logs().unwrap().contains("experiment failed"));
}

#[test]
fn test_model_without_exports_fails_run() {
    let dir = tempfile::tempdir().unwrap();
    write_upload(dir.path(), "uploads/model.rhai", "fn helper() { 1 }");
    let record = base_record(1).model_path("uploads/model.rhai").build();
    let (outcome, store, _) = run_in_memory(dir.path(), record);

    let err = outcome.unwrap_err();
    assert_eq!(err.kind(), "ModuleResolutionError");
    let message = err.to_string();
    for name in ["Model", "Net", "get_model"] {
        assert!(message.contains(name), "{message} should list {name}");
    }
    assert!(message.ends_with("Please check your file and upload again."));
    assert_eq!(store.experiment(1).unwrap().status(), ExperimentStatus::Failed);
}

#[test]
fn test_model_syntax_error_fails_run() {
    let dir = tempfile::tempdir().unwrap();
    write_upload(dir.path(), "uploads/model.rhai", "fn get_model() {\n    #{ hidden: [8] \n");
    let record = base_record(1).model_path("uploads/model.rhai").build();
    let (outcome, _store, _) = run_in_memory(dir.path(), record);
    assert_eq!(outcome.unwrap_err().kind(), "ModuleResolutionError");
}

// ============================================================================
// Uploaded modules
// ============================================================================

#[test]
fn test_uploaded_model_strategy_and_config() {
    let dir = tempfile::tempdir().unwrap();
    write_upload(
        dir.path(),
        "uploads/model.rhai",
        "fn get_model() { #{ hidden: [8] } }",
    );
    write_upload(
        dir.path(),
        "uploads/strategy.rhai",
        "fn get_strategy() { #{ name: \"fedmedian\" } }",
    );
    write_upload(
        dir.path(),
        "uploads/config.json",
        r#"{"optimizer": "adam", "batch_size": 16, "tags": ["ignored"]}"#,
    );
    let record = base_record(1)
        .num_rounds(2)
        .model_path("uploads/model.rhai")
        .algorithm_path("uploads/strategy.rhai")
        .config_path("uploads/config.json")
        .build();
    let (outcome, store, _) = run_in_memory(dir.path(), record);

    let summary = outcome.unwrap();
    assert_eq!(summary.config.get("optimizer"), Some(&Scalar::from("adam")));
    assert_eq!(summary.config.get("batch_size"), Some(&Scalar::Int(16)));
    assert!(!summary.config.contains_key("tags"));
    assert_eq!(store.round_metrics(1).len(), 2);

    let logs = store.experiment(1).unwrap().logs().unwrap().to_string();
    assert!(logs.contains("using uploaded model"));
    assert!(logs.contains("FedMedian"));
    assert!(dir.path().join(".module_cache/user_model.rhai").is_file());
    assert!(dir.path().join(".module_cache/user_algorithm.rhai").is_file());
}

#[test]
fn test_failing_strategy_factory_falls_back_to_fedavg() {
    let dir = tempfile::tempdir().unwrap();
    write_upload(
        dir.path(),
        "uploads/strategy.rhai",
        "fn get_strategy() { throw \"no strategy today\"; }",
    );
    let record = base_record(1)
        .num_rounds(1)
        .algorithm_path("uploads/strategy.rhai")
        .build();
    let (outcome, store, phase) = run_in_memory(dir.path(), record);

    outcome.unwrap();
    assert_eq!(phase, Phase::Completed);
    let logs = store.experiment(1).unwrap().logs().unwrap().to_string();
    assert!(logs.contains("falling back to FedAvg"));
}

#[test]
fn test_uploaded_dataset_script() {
    let dir = tempfile::tempdir().unwrap();
    write_upload(
        dir.path(),
        "uploads/data.rhai",
        r"
fn load_data(pid, n) {
    let train = [];
    let test = [];
    for i in 0..40 {
        let c = i % 4;
        let x = [];
        for j in 0..16 { x.push(0.0); }
        x[c] = 3.0;
        x[c + 4] = 1.0;
        if i < 32 {
            train.push(#{ x: x, y: c });
        } else {
            test.push(#{ x: x, y: c });
        }
    }
    #{ train: train, test: test, batch_size: 8 }
}",
    );
    let record = base_record(1)
        .num_rounds(2)
        .dataset_path("uploads/data.rhai")
        .build();
    let (outcome, store, _) = run_in_memory(dir.path(), record);

    let summary = outcome.unwrap();
    assert_eq!(summary.rounds.len(), 2);
    for row in store.round_metrics(1) {
        for client in row.client_metrics() {
            assert_eq!(client.num_examples, 32);
        }
    }
}

#[test]
fn test_rhai_config_overrides_defaults() {
    let dir = tempfile::tempdir().unwrap();
    write_upload(
        dir.path(),
        "uploads/config.rhai",
        "const CONFIG = #{ momentum: 0.5, seed: 7 };",
    );
    let record = base_record(1)
        .num_rounds(1)
        .config_path("uploads/config.rhai")
        .build();
    let (outcome, _store, _) = run_in_memory(dir.path(), record);

    let summary = outcome.unwrap();
    assert_eq!(summary.config.get("momentum"), Some(&Scalar::Float(0.5)));
    assert_eq!(summary.config.get("seed"), Some(&Scalar::Int(7)));
    assert_eq!(summary.config.get("optimizer"), Some(&Scalar::from("sgd")));
}

#[test]
fn test_unreadable_config_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    write_upload(dir.path(), "uploads/config.json", "{ not json");
    let record = base_record(1)
        .num_rounds(1)
        .config_path("uploads/config.json")
        .build();
    let (outcome, _store, _) = run_in_memory(dir.path(), record);
    let summary = outcome.unwrap();
    assert_eq!(summary.config.get("batch_size"), Some(&Scalar::Int(32)));
}

#[test]
fn test_unknown_checkpoint_codec_fails_run() {
    let dir = tempfile::tempdir().unwrap();
    write_upload(dir.path(), "uploads/config.json", r#"{ "checkpoint_codec": "brotli" }"#);
    let record = base_record(1)
        .num_rounds(1)
        .config_path("uploads/config.json")
        .build();
    let (outcome, store, phase) = run_in_memory(dir.path(), record);

    assert_eq!(outcome.unwrap_err().kind(), "ConfigurationError");
    assert_eq!(phase, Phase::Failed);
    let message = store.experiment(1).unwrap().error_message().unwrap().to_string();
    assert!(message.starts_with("ConfigurationError: "));
    assert!(message.contains("brotli"));
}

#[cfg(feature = "compression")]
#[test]
fn test_checkpoint_codec_from_config() {
    let dir = tempfile::tempdir().unwrap();
    write_upload(dir.path(), "uploads/config.json", r#"{ "checkpoint_codec": "zstd" }"#);
    let record = base_record(1)
        .num_rounds(1)
        .config_path("uploads/config.json")
        .build();
    let (outcome, _store, _) = run_in_memory(dir.path(), record);
    outcome.unwrap();

    let bytes = std::fs::read(dir.path().join("checkpoints-data/exp_1/round_1.ckpt")).unwrap();
    assert_eq!(&bytes[..4], b"FLCK");
    assert_eq!(bytes[4], 2);
    let reader = fedlab::checkpoint::CheckpointStore::new(dir.path(), 1);
    assert_eq!(reader.load_latest().unwrap().unwrap().round, 1);
}
