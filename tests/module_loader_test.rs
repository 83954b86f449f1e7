//! Module loader integration tests
//!
//! Validation happens on the syntax tree, so a file that fails validation
//! never runs. Extraction follows fixed per-category lookup rules.

use std::path::Path;

use fedlab::loader::{Category, Component, LoadError, ModuleLoader, ValidationError};
use fedlab::nn::Model;

fn project(files: &[(&str, &str)]) -> (tempfile::TempDir, ModuleLoader) {
    let dir = tempfile::tempdir().unwrap();
    for (rel, body) in files {
        let path = dir.path().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, body).unwrap();
    }
    let loader = ModuleLoader::new(dir.path()).unwrap();
    (dir, loader)
}

fn cached_file(root: &Path, category: Category) -> std::path::PathBuf {
    root.join(".module_cache")
        .join(format!("{}.rhai", category.module_name()))
}

// ============================================================================
// Validation
// ============================================================================

#[test]
fn test_invalid_module_is_never_executed() {
    // The loop would exhaust the operation budget if it ran.
    let (dir, loader) = project(&[("m.rhai", "let i = 0;\nloop { i += 1; }\nfn helper() { 1 }")]);
    match loader.try_load_module("m.rhai", Category::Model) {
        Err(LoadError::Invalid(ValidationError::MissingExports { expected })) => {
            assert_eq!(expected, vec!["Model", "Net", "get_model"]);
        }
        other => panic!("expected missing exports, got {other:?}"),
    }
    assert!(!cached_file(dir.path(), Category::Model).exists());
    assert!(loader.cached(Category::Model).is_none());
}

#[test]
fn test_each_category_accepts_its_exports() {
    let (_dir, loader) = project(&[
        ("model.rhai", "fn Model() { #{ hidden: [4] } }"),
        ("data.rhai", "fn load_data(pid, n) { #{ train: [], test: [] } }"),
        ("algo.rhai", "fn get_strategy() { #{} }"),
        ("config.rhai", "let config = #{ seed: 1 };"),
    ]);
    assert!(loader.validate_structure("model.rhai", Category::Model).is_ok());
    assert!(loader.validate_structure("data.rhai", Category::Dataset).is_ok());
    assert!(loader.validate_structure("algo.rhai", Category::Strategy).is_ok());
    assert!(loader.validate_structure("config.rhai", Category::Config).is_ok());

    assert!(matches!(
        loader.validate_structure("model.rhai", Category::Dataset),
        Err(ValidationError::MissingExports { .. })
    ));
}

#[test]
fn test_computed_exports_validate_and_extract() {
    let (_dir, loader) = project(&[
        (
            "config.rhai",
            "let lr = 0.01;\nlet config = #{ learning_rate: lr * 2.0, seed: 40 + 2 };",
        ),
        ("net.rhai", "fn hidden() { [8] }\nconst Net = #{ hidden: hidden() };"),
        ("let_net.rhai", "let width = 4;\nlet Net = #{ hidden: [width * 2] };"),
    ]);
    assert!(loader.validate_structure("config.rhai", Category::Config).is_ok());
    assert!(loader.validate_structure("net.rhai", Category::Model).is_ok());
    assert!(loader.validate_structure("let_net.rhai", Category::Model).is_ok());

    let Component::Config(config) = loader.resolve("config.rhai", Category::Config) else {
        panic!("config always resolves");
    };
    assert_eq!(config.get("learning_rate").and_then(serde_json::Value::as_f64), Some(0.02));
    assert_eq!(config.get("seed").and_then(serde_json::Value::as_i64), Some(42));

    for file in ["net.rhai", "let_net.rhai"] {
        let Component::Model(factory) = loader.resolve(file, Category::Model) else {
            panic!("{file} should resolve to a model");
        };
        assert_eq!(factory.origin(), "Net");
        assert!(factory.build().is_ok());
    }
}

#[test]
fn test_unreadable_file() {
    let (_dir, loader) = project(&[]);
    assert!(matches!(
        loader.validate_structure("absent.rhai", Category::Model),
        Err(ValidationError::Unreadable(_))
    ));
}

#[test]
fn test_syntax_error_message_names_line() {
    let (_dir, loader) = project(&[("m.rhai", "fn get_model() {\n  #{ hidden: [4] }\n}\n\nlet = 3;\n")]);
    let err = loader.validate_structure("m.rhai", Category::Model).unwrap_err();
    assert!(matches!(err, ValidationError::Syntax { line: Some(5), .. }));
    assert!(err.to_string().starts_with("Syntax error in uploaded file (line 5)"));
}

// ============================================================================
// Loading and the registry
// ============================================================================

#[test]
fn test_empty_path_rejected() {
    let (_dir, loader) = project(&[]);
    assert!(matches!(
        loader.try_load_module("", Category::Dataset),
        Err(LoadError::EmptyPath)
    ));
}

#[test]
fn test_reload_replaces_cached_module() {
    let (dir, loader) = project(&[
        ("a.rhai", "fn get_model() { #{ hidden: [4] } }"),
        ("b.rhai", "fn get_model() { #{ hidden: [6, 6] } }"),
    ]);
    loader.load_module("a.rhai", Category::Model).unwrap();
    loader.load_module("b.rhai", Category::Model).unwrap();

    let module = loader.cached(Category::Model).unwrap();
    assert!(module.source_path().ends_with("b.rhai"));
    let cached = std::fs::read_to_string(cached_file(dir.path(), Category::Model)).unwrap();
    assert!(cached.contains("[6, 6]"));

    let factory = ModuleLoader::extract_model(&module).unwrap();
    assert_eq!(factory.spec().unwrap().hidden, vec![6, 6]);
}

#[test]
fn test_absolute_paths_are_kept() {
    let (dir, loader) = project(&[("nested/m.rhai", "const Net = #{ hidden: [3] };")]);
    let absolute = dir.path().join("nested/m.rhai");
    let module = loader.load_module(&absolute, Category::Model).unwrap();
    assert_eq!(module.source_path(), absolute.as_path());
}

// ============================================================================
// Resolution
// ============================================================================

#[test]
fn test_resolved_model_is_deterministic() {
    let (_dir, loader) = project(&[("m.rhai", "fn get_model() { #{ hidden: [8], seed: 3 } }")]);
    let Component::Model(factory) = loader.resolve("m.rhai", Category::Model) else {
        panic!("expected a model");
    };
    let first = factory.build().unwrap();
    let second = factory.build().unwrap();
    assert_eq!(first.state_dict(), second.state_dict());
}

#[test]
fn test_model_factory_error_surfaces_on_build() {
    let (_dir, loader) = project(&[("m.rhai", "fn get_model() { throw \"no gpu\"; }")]);
    let Component::Model(factory) = loader.resolve("m.rhai", Category::Model) else {
        panic!("factory errors only show when called");
    };
    let err = factory.build().err().unwrap();
    assert_eq!(err.kind(), "ModuleExecutionError");
    assert!(err.to_string().contains("no gpu"));
}

#[test]
fn test_dataset_partition_out_of_range_is_error() {
    let (_dir, loader) = project(&[(
        "d.rhai",
        r#"
fn load_data(pid, n) {
    if pid >= n { throw "partition out of range"; }
    #{ train: [#{ x: [0.0, 1.0], y: 1 }], test: [#{ x: [1.0, 0.0], y: 0 }] }
}"#,
    )]);
    let Component::Dataset(dataset) = loader.resolve("d.rhai", Category::Dataset) else {
        panic!("expected a dataset");
    };
    let (train, _) = dataset.load(0, 2).unwrap();
    assert_eq!(train.len(), 1);
    assert!(dataset.load(2, 2).is_err());
}

#[test]
fn test_resolve_reports_expected_exports() {
    let (_dir, loader) = project(&[("m.rhai", "let spec = 1;\nfn build() { 1 }")]);
    let component = loader.resolve("m.rhai", Category::Model);
    assert!(component.invalid_reason().unwrap().contains("get_model"));
}

#[test]
fn test_config_resolution_never_fails() {
    let (_dir, loader) = project(&[("c.rhai", "fn get_config() { throw \"broken\"; }")]);
    let Component::Config(config) = loader.resolve("c.rhai", Category::Config) else {
        panic!("config always resolves");
    };
    assert!(config.is_empty());
    let Component::Config(config) = loader.resolve("missing.yaml", Category::Config) else {
        panic!("config always resolves");
    };
    assert!(config.is_empty());
}
