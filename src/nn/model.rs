//! Multilayer perceptron with softmax cross-entropy

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::data::Sample;
use super::optim::Optimizer;
use crate::tensor::{StateDict, Tensor};
use crate::{Error, Result};

/// Loss and accuracy counters over one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BatchStats {
    /// Mean cross-entropy over the batch.
    pub loss: f64,
    /// Correct argmax predictions.
    pub correct: usize,
    /// Samples in the batch.
    pub count: usize,
}

/// A trainable classifier the client adapter can drive.
pub trait Model: Send {
    /// Named parameters in a stable insertion order.
    fn state_dict(&self) -> StateDict;

    /// Replace every parameter. Names and shapes must match exactly.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ParameterMismatch`] on any missing, extra or
    /// misshapen entry.
    fn load_state_dict(&mut self, state: &StateDict) -> Result<()>;

    /// Mutable parameters in `state_dict` order.
    fn parameters_mut(&mut self) -> Vec<&mut Tensor>;

    /// Batch statistics and gradients (in `state_dict` order).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Training`] for empty batches, wrong feature counts
    /// or out-of-range labels.
    fn backward(&self, batch: &[Sample]) -> Result<(BatchStats, Vec<Tensor>)>;

    /// Batch statistics without gradients.
    ///
    /// # Errors
    ///
    /// Same as [`Model::backward`].
    fn evaluate(&self, batch: &[Sample]) -> Result<BatchStats>;

    /// One optimizer step on `batch`.
    ///
    /// # Errors
    ///
    /// Propagates errors from [`Model::backward`] and the optimizer.
    fn train_step(&mut self, batch: &[Sample], optimizer: &mut dyn Optimizer) -> Result<BatchStats> {
        let (stats, grads) = self.backward(batch)?;
        optimizer.step(&mut self.parameters_mut(), &grads)?;
        Ok(stats)
    }
}

/// Architecture of the built-in classifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSpec {
    /// Features per sample.
    pub input_dim: usize,
    /// Hidden layer widths.
    pub hidden: Vec<usize>,
    /// Output classes.
    pub num_classes: usize,
    /// Initialization seed.
    pub seed: u64,
}

impl Default for ModelSpec {
    fn default() -> Self {
        Self {
            input_dim: 16,
            hidden: vec![32],
            num_classes: 4,
            seed: 42,
        }
    }
}

impl ModelSpec {
    /// Check that every dimension is non-zero.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Training`] naming the zero dimension.
    pub fn validate(&self) -> Result<()> {
        if self.input_dim == 0 {
            return Err(Error::Training("input_dim must be positive".to_string()));
        }
        if self.num_classes == 0 {
            return Err(Error::Training("num_classes must be positive".to_string()));
        }
        if let Some(idx) = self.hidden.iter().position(|&w| w == 0) {
            return Err(Error::Training(format!("hidden layer {idx} has zero width")));
        }
        Ok(())
    }

    fn layer_dims(&self) -> Vec<(usize, usize)> {
        let mut dims = Vec::with_capacity(self.hidden.len() + 1);
        let mut fan_in = self.input_dim;
        for &width in self.hidden.iter().chain(std::iter::once(&self.num_classes)) {
            dims.push((fan_in, width));
            fan_in = width;
        }
        dims
    }
}

#[derive(Debug, Clone)]
struct Linear {
    weight: Tensor,
    bias: Tensor,
    fan_in: usize,
    fan_out: usize,
}

impl Linear {
    #[allow(clippy::cast_precision_loss)]
    fn init(fan_in: usize, fan_out: usize, rng: &mut StdRng) -> Self {
        let bound = 1.0 / (fan_in as f32).sqrt();
        let weight = (0..fan_in * fan_out)
            .map(|_| rng.gen_range(-bound..bound))
            .collect();
        let bias = (0..fan_out).map(|_| rng.gen_range(-bound..bound)).collect();
        Self {
            weight: Tensor::from_parts(vec![fan_out, fan_in], weight),
            bias: Tensor::from_parts(vec![fan_out], bias),
            fan_in,
            fan_out,
        }
    }

    fn forward(&self, input: &[f32]) -> Vec<f32> {
        let w = self.weight.data();
        self.bias
            .data()
            .iter()
            .enumerate()
            .map(|(o, b)| {
                let row = &w[o * self.fan_in..(o + 1) * self.fan_in];
                b + row.iter().zip(input).map(|(wi, xi)| wi * xi).sum::<f32>()
            })
            .collect()
    }
}

/// Fully connected ReLU network.
///
/// Parameter names are `fc{i}.weight` (`[out, in]`) and `fc{i}.bias`
/// (`[out]`), layer by layer.
#[derive(Debug, Clone)]
pub struct Mlp {
    spec: ModelSpec,
    layers: Vec<Linear>,
}

impl Mlp {
    /// Build and seed-initialize a network.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Training`] if `spec` has a zero dimension.
    pub fn new(spec: &ModelSpec) -> Result<Self> {
        spec.validate()?;
        let mut rng = StdRng::seed_from_u64(spec.seed);
        let layers = spec
            .layer_dims()
            .into_iter()
            .map(|(fan_in, fan_out)| Linear::init(fan_in, fan_out, &mut rng))
            .collect();
        Ok(Self {
            spec: spec.clone(),
            layers,
        })
    }

    /// Architecture this network was built from.
    #[must_use]
    pub const fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    fn check_sample(&self, sample: &Sample) -> Result<()> {
        if sample.x.len() != self.spec.input_dim {
            return Err(Error::Training(format!(
                "sample has {} features, model expects {}",
                sample.x.len(),
                self.spec.input_dim
            )));
        }
        if sample.y >= self.spec.num_classes {
            return Err(Error::Training(format!(
                "label {} out of range for {} classes",
                sample.y, self.spec.num_classes
            )));
        }
        Ok(())
    }

    /// Pre-activations of every layer (the last one are the logits).
    fn forward_all(&self, x: &[f32]) -> Vec<Vec<f32>> {
        let mut outputs: Vec<Vec<f32>> = Vec::with_capacity(self.layers.len());
        for (i, layer) in self.layers.iter().enumerate() {
            let z = match outputs.last() {
                None => layer.forward(x),
                Some(prev) => layer.forward(&relu(prev)),
            };
            debug_assert_eq!(z.len(), layer.fan_out, "layer {i} width");
            outputs.push(z);
        }
        outputs
    }

    fn sample_stats(logits: &[f32], label: usize) -> (f64, bool, Vec<f32>) {
        let probs = softmax(logits);
        let loss = -f64::from(probs[label].max(f32::MIN_POSITIVE)).ln();
        let predicted = argmax(logits);
        (loss, predicted == label, probs)
    }
}

impl Model for Mlp {
    fn state_dict(&self) -> StateDict {
        let mut dict = StateDict::new();
        for (i, layer) in self.layers.iter().enumerate() {
            dict.insert(format!("fc{i}.weight"), layer.weight.clone());
            dict.insert(format!("fc{i}.bias"), layer.bias.clone());
        }
        dict
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
        let current = self.state_dict();
        let params = crate::tensor::state_dict_to_parameters(&current, state)?;
        for (slot, tensor) in self.parameters_mut().into_iter().zip(params) {
            *slot = tensor;
        }
        Ok(())
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        self.layers
            .iter_mut()
            .flat_map(|layer| [&mut layer.weight, &mut layer.bias])
            .collect()
    }

    #[allow(clippy::cast_precision_loss)]
    fn backward(&self, batch: &[Sample]) -> Result<(BatchStats, Vec<Tensor>)> {
        if batch.is_empty() {
            return Err(Error::Training("empty batch".to_string()));
        }

        let mut grads: Vec<Tensor> = self
            .layers
            .iter()
            .flat_map(|layer| [layer.weight.zeros_like(), layer.bias.zeros_like()])
            .collect();
        let mut stats = BatchStats::default();

        for sample in batch {
            self.check_sample(sample)?;
            let pre = self.forward_all(&sample.x);
            let Some(logits) = pre.last() else {
                return Err(Error::Training("model has no layers".to_string()));
            };
            let (loss, correct, probs) = Self::sample_stats(logits, sample.y);
            stats.loss += loss;
            stats.correct += usize::from(correct);
            stats.count += 1;

            // dL/dz for the output layer
            let mut delta: Vec<f32> = probs;
            delta[sample.y] -= 1.0;

            for l in (0..self.layers.len()).rev() {
                let layer = &self.layers[l];
                let input = if l == 0 { sample.x.clone() } else { relu(&pre[l - 1]) };

                let (gw, rest) = grads[2 * l..].split_at_mut(1);
                let gw = gw[0].data_mut();
                let gb = rest[0].data_mut();
                for (o, d) in delta.iter().enumerate() {
                    gb[o] += d;
                    let row = &mut gw[o * layer.fan_in..(o + 1) * layer.fan_in];
                    for (g, x) in row.iter_mut().zip(&input) {
                        *g += d * x;
                    }
                }

                if l > 0 {
                    let w = layer.weight.data();
                    delta = (0..layer.fan_in)
                        .map(|i| {
                            if pre[l - 1][i] <= 0.0 {
                                return 0.0;
                            }
                            delta
                                .iter()
                                .enumerate()
                                .map(|(o, d)| d * w[o * layer.fan_in + i])
                                .sum()
                        })
                        .collect();
                }
            }
        }

        let scale = 1.0 / batch.len() as f32;
        for grad in &mut grads {
            grad.data_mut().iter_mut().for_each(|g| *g *= scale);
        }
        stats.loss /= batch.len() as f64;
        Ok((stats, grads))
    }

    #[allow(clippy::cast_precision_loss)]
    fn evaluate(&self, batch: &[Sample]) -> Result<BatchStats> {
        if batch.is_empty() {
            return Err(Error::Training("empty batch".to_string()));
        }
        let mut stats = BatchStats::default();
        for sample in batch {
            self.check_sample(sample)?;
            let pre = self.forward_all(&sample.x);
            let Some(logits) = pre.last() else {
                return Err(Error::Training("model has no layers".to_string()));
            };
            let (loss, correct, _) = Self::sample_stats(logits, sample.y);
            stats.loss += loss;
            stats.correct += usize::from(correct);
            stats.count += 1;
        }
        stats.loss /= batch.len() as f64;
        Ok(stats)
    }
}

fn relu(values: &[f32]) -> Vec<f32> {
    values.iter().map(|v| v.max(0.0)).collect()
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(bi, bv), (i, &v)| {
            if v > bv {
                (i, v)
            } else {
                (bi, bv)
            }
        })
        .0
}
