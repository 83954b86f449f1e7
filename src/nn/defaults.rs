//! Built-in model, dataset and configuration used when no upload is configured

use super::data::{synthetic_partition, DataLoader, SyntheticSpec};
use super::model::{Mlp, Model, ModelSpec};
use crate::metrics::{ConfigRecord, Scalar};
use crate::Result;

/// Default batch size.
pub const BATCH_SIZE: i64 = 32;
/// Default client learning rate.
pub const LEARNING_RATE: f64 = 0.01;
/// Default SGD momentum.
pub const MOMENTUM: f64 = 0.9;

/// Fresh default classifier (16 → 32 → 4).
///
/// # Errors
///
/// Never fails for the built-in spec; the signature matches user factories.
pub fn get_model() -> Result<Box<dyn Model>> {
    Ok(Box::new(Mlp::new(&ModelSpec::default())?))
}

/// Synthetic partition `partition_id` of `num_partitions`.
///
/// # Errors
///
/// Returns an error if `partition_id` is out of range.
pub fn load_data(partition_id: usize, num_partitions: usize) -> Result<(DataLoader, DataLoader)> {
    synthetic_partition(partition_id, num_partitions, &SyntheticSpec::default())
}

/// Configuration every run starts from; user config keys override it.
#[must_use]
pub fn default_config() -> ConfigRecord {
    [
        ("batch_size", Scalar::Int(BATCH_SIZE)),
        ("learning_rate", Scalar::Float(LEARNING_RATE)),
        ("local_epochs", Scalar::Int(1)),
        ("optimizer", Scalar::from("sgd")),
        ("momentum", Scalar::Float(MOMENTUM)),
        ("num_classes", Scalar::Int(4)),
        ("client_fraction", Scalar::Float(0.5)),
        ("min_fit_clients", Scalar::Int(2)),
        ("min_evaluate_clients", Scalar::Int(2)),
        ("seed", Scalar::Int(42)),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_model_matches_default_data() {
        let model = get_model().unwrap();
        let (train, _) = load_data(0, 2).unwrap();
        let batch = train.batches().next().unwrap();
        assert!(model.evaluate(batch).is_ok());
    }

    #[test]
    fn test_default_config_keys() {
        let config = default_config();
        assert_eq!(config.get("optimizer"), Some(&Scalar::from("sgd")));
        assert_eq!(config.get("batch_size").and_then(Scalar::as_i64), Some(32));
    }
}
