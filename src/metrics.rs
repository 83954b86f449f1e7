//! Scalar metric maps and sample-count-weighted aggregation

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A metric or config value exchanged with clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    /// Boolean flag
    Bool(bool),
    /// Integer
    Int(i64),
    /// Floating point
    Float(f64),
    /// Free text
    Str(String),
}

impl Scalar {
    /// Numeric view; booleans and strings are not numbers here.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub const fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Bool(_) | Self::Str(_) => None,
        }
    }

    /// Integer view; floats are truncated.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Float(v) => Some(*v as i64),
            Self::Bool(_) | Self::Str(_) => None,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v:.4}"),
            Self::Str(v) => f.write_str(v),
        }
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u32> for Scalar {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

/// Metrics reported by clients or produced by aggregation.
pub type Metrics = BTreeMap<String, Scalar>;

/// Per-round instructions sent to clients alongside parameters.
pub type ConfigRecord = BTreeMap<String, Scalar>;

/// Read a numeric metric.
#[must_use]
pub fn metric_f64(metrics: &Metrics, key: &str) -> Option<f64> {
    metrics.get(key).and_then(Scalar::as_f64)
}

/// Sample-count-weighted mean of every numeric key.
///
/// Each client contributes `value * num_examples / total_examples`. Keys
/// missing from some clients are averaged over the clients that report
/// them with the global weights, matching the engine's reference
/// aggregation. An empty input or a zero total yields an empty map.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn weighted_average(results: &[(usize, Metrics)]) -> Metrics {
    let total: usize = results.iter().map(|(n, _)| n).sum();
    if total == 0 {
        return Metrics::new();
    }

    let mut sums: BTreeMap<String, f64> = BTreeMap::new();
    for (num_examples, metrics) in results {
        let weight = *num_examples as f64 / total as f64;
        for (key, value) in metrics {
            if let Some(v) = value.as_f64() {
                *sums.entry(key.clone()).or_insert(0.0) += v * weight;
            }
        }
    }

    sums.into_iter()
        .map(|(key, value)| (key, Scalar::Float(value)))
        .collect()
}

/// Sample-count-weighted mean of client losses; `None` for zero samples.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn weighted_loss(results: &[(usize, f64)]) -> Option<f64> {
    let total: usize = results.iter().map(|(n, _)| n).sum();
    if total == 0 {
        return None;
    }
    Some(
        results
            .iter()
            .map(|(n, loss)| *n as f64 * loss)
            .sum::<f64>()
            / total as f64,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(pairs: &[(&str, Scalar)]) -> Metrics {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_weighted_average_example() {
        let results = vec![
            (10, metrics(&[("acc", Scalar::Float(0.5))])),
            (30, metrics(&[("acc", Scalar::Float(0.9))])),
        ];
        let agg = weighted_average(&results);
        assert!((metric_f64(&agg, "acc").unwrap() - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_weighted_average_empty() {
        assert!(weighted_average(&[]).is_empty());
    }

    #[test]
    fn test_weighted_average_zero_samples() {
        let results = vec![(0, metrics(&[("acc", Scalar::Float(0.5))]))];
        assert!(weighted_average(&results).is_empty());
    }

    #[test]
    fn test_non_numeric_values_skipped() {
        let results = vec![(
            5,
            metrics(&[("name", Scalar::from("a")), ("flag", Scalar::Bool(true)), ("n", Scalar::Int(2))]),
        )];
        let agg = weighted_average(&results);
        assert_eq!(agg.len(), 1);
        assert!((metric_f64(&agg, "n").unwrap() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_weighted_loss() {
        assert!(weighted_loss(&[]).is_none());
        let loss = weighted_loss(&[(1, 1.0), (3, 2.0)]).unwrap();
        assert!((loss - 1.75).abs() < 1e-12);
    }

    #[test]
    fn test_scalar_untagged_json() {
        let m = metrics(&[("lr", Scalar::Float(0.5)), ("round", Scalar::Int(3))]);
        let json = serde_json::to_string(&m).unwrap();
        assert_eq!(json, r#"{"lr":0.5,"round":3}"#);
        let back: Metrics = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
    }
}
