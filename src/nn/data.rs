//! Samples, batching, and the synthetic default dataset

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// One labelled example.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Feature vector.
    pub x: Vec<f32>,
    /// Class index.
    pub y: usize,
}

/// Batches over an owned sample list.
#[derive(Debug, Clone)]
pub struct DataLoader {
    samples: Vec<Sample>,
    batch_size: usize,
    shuffle: bool,
    seed: u64,
}

impl DataLoader {
    /// Create a loader; a zero batch size is treated as 1.
    #[must_use]
    pub fn new(samples: Vec<Sample>, batch_size: usize) -> Self {
        Self {
            samples,
            batch_size: batch_size.max(1),
            shuffle: false,
            seed: 0,
        }
    }

    /// Reshuffle at the start of every epoch with `seed`.
    #[must_use]
    pub const fn shuffled(mut self, seed: u64) -> Self {
        self.shuffle = true;
        self.seed = seed;
        self
    }

    /// Number of samples (the client's aggregation weight).
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True for an empty partition.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Batch size.
    #[must_use]
    pub const fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Batches per pass, counting a trailing partial batch.
    #[must_use]
    pub fn num_batches(&self) -> usize {
        self.samples.len().div_ceil(self.batch_size)
    }

    /// Batches in current order.
    pub fn batches(&self) -> std::slice::Chunks<'_, Sample> {
        self.samples.chunks(self.batch_size)
    }

    /// Batches for training epoch `epoch`, reshuffled first when enabled.
    pub fn epoch(&mut self, epoch: u32) -> std::slice::Chunks<'_, Sample> {
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(u64::from(epoch)));
            self.samples.shuffle(&mut rng);
        }
        self.samples.chunks(self.batch_size)
    }
}

/// Parameters of the synthetic Gaussian-blob dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticSpec {
    /// Features per sample.
    pub num_features: usize,
    /// Number of classes (blobs).
    pub num_classes: usize,
    /// Samples generated per partition before the split.
    pub samples_per_partition: usize,
    /// Fraction kept for training.
    pub train_fraction: f64,
    /// Standard deviation around each class center.
    pub noise: f32,
    /// Batch size of both loaders.
    pub batch_size: usize,
    /// Seed shared by every partition.
    pub seed: u64,
}

impl Default for SyntheticSpec {
    fn default() -> Self {
        Self {
            num_features: 16,
            num_classes: 4,
            samples_per_partition: 160,
            train_fraction: 0.8,
            noise: 1.0,
            batch_size: 32,
            seed: 42,
        }
    }
}

/// Train and test loaders for one IID partition of the synthetic dataset.
///
/// Class centers depend only on `spec.seed`, so every partition samples
/// the same distribution. Each partition draws its own points from a
/// generator seeded by the partition id.
///
/// # Errors
///
/// Returns [`Error::Training`] if `partition_id >= num_partitions` or
/// `spec` has no features or classes.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn synthetic_partition(
    partition_id: usize,
    num_partitions: usize,
    spec: &SyntheticSpec,
) -> Result<(DataLoader, DataLoader)> {
    if partition_id >= num_partitions {
        return Err(Error::Training(format!(
            "partition {partition_id} out of range for {num_partitions} partitions"
        )));
    }
    if spec.num_features == 0 || spec.num_classes == 0 {
        return Err(Error::Training("synthetic dataset needs features and classes".to_string()));
    }

    let mut center_rng = StdRng::seed_from_u64(spec.seed);
    let centers: Vec<Vec<f32>> = (0..spec.num_classes)
        .map(|_| {
            (0..spec.num_features)
                .map(|_| center_rng.gen_range(-3.0..3.0))
                .collect()
        })
        .collect();

    let mut rng = StdRng::seed_from_u64(spec.seed.wrapping_add(1 + partition_id as u64));
    let mut samples: Vec<Sample> = (0..spec.samples_per_partition)
        .map(|i| {
            let y = i % spec.num_classes;
            let x = centers[y]
                .iter()
                .map(|c| c + spec.noise * gaussian(&mut rng))
                .collect();
            Sample { x, y }
        })
        .collect();
    samples.shuffle(&mut rng);

    let split = ((samples.len() as f64) * spec.train_fraction).round() as usize;
    let test = samples.split_off(split.min(samples.len()));
    let train = DataLoader::new(samples, spec.batch_size)
        .shuffled(spec.seed.wrapping_add(partition_id as u64));
    Ok((train, DataLoader::new(test, spec.batch_size)))
}

/// Standard normal draw (Box-Muller).
fn gaussian(rng: &mut StdRng) -> f32 {
    let u1: f32 = rng.gen_range(f32::EPSILON..1.0);
    let u2: f32 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (std::f32::consts::TAU * u2).cos()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_sizes() {
        let (train, test) = synthetic_partition(0, 4, &SyntheticSpec::default()).unwrap();
        assert_eq!(train.len(), 128);
        assert_eq!(test.len(), 32);
        assert_eq!(train.num_batches(), 4);
        assert!(train.batches().all(|b| b.iter().all(|s| s.x.len() == 16 && s.y < 4)));
    }

    #[test]
    fn test_partitions_deterministic_and_distinct() {
        let spec = SyntheticSpec::default();
        let (a, _) = synthetic_partition(1, 4, &spec).unwrap();
        let (b, _) = synthetic_partition(1, 4, &spec).unwrap();
        let (c, _) = synthetic_partition(2, 4, &spec).unwrap();
        let first = |l: &DataLoader| l.batches().next().map(<[Sample]>::to_vec);
        assert_eq!(first(&a), first(&b));
        assert_ne!(first(&a), first(&c));
    }

    #[test]
    fn test_partition_out_of_range() {
        assert!(synthetic_partition(4, 4, &SyntheticSpec::default()).is_err());
    }

    #[test]
    fn test_epoch_shuffle_keeps_samples() {
        let samples: Vec<Sample> = (0..10).map(|i| Sample { x: vec![0.0], y: i }).collect();
        let mut loader = DataLoader::new(samples, 3).shuffled(5);
        let mut seen: Vec<usize> = loader.epoch(1).flatten().map(|s| s.y).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
        assert_eq!(loader.num_batches(), 4);
    }

    #[test]
    fn test_zero_batch_size_clamped() {
        let loader = DataLoader::new(vec![], 0);
        assert_eq!(loader.batch_size(), 1);
        assert!(loader.is_empty());
        assert_eq!(loader.num_batches(), 0);
    }
}
