//! First-order optimizers

use std::str::FromStr;

use crate::tensor::Tensor;
use crate::{Error, Result};

/// Updates parameters in place from gradients of the same order and shape.
pub trait Optimizer: Send {
    /// Apply one update.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ParameterMismatch`] if `params` and `grads` differ
    /// in count or shape.
    fn step(&mut self, params: &mut [&mut Tensor], grads: &[Tensor]) -> Result<()>;
}

fn check_pairs(params: &[&mut Tensor], grads: &[Tensor]) -> Result<()> {
    if params.len() != grads.len() {
        return Err(Error::ParameterMismatch(format!(
            "{} parameters but {} gradients",
            params.len(),
            grads.len()
        )));
    }
    for (i, (p, g)) in params.iter().zip(grads).enumerate() {
        if p.shape() != g.shape() {
            return Err(Error::ParameterMismatch(format!(
                "gradient {i} has shape {:?}, parameter has {:?}",
                g.shape(),
                p.shape()
            )));
        }
    }
    Ok(())
}

/// Optimizer selected by the `optimizer` config key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptimizerKind {
    /// Stochastic gradient descent with momentum
    #[default]
    Sgd,
    /// Adam
    Adam,
}

impl OptimizerKind {
    /// Config name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Sgd => "sgd",
            Self::Adam => "adam",
        }
    }

    /// Instantiate with learning rate `lr`; `momentum` only applies to SGD.
    #[must_use]
    pub fn build(self, lr: f32, momentum: f32) -> Box<dyn Optimizer> {
        match self {
            Self::Sgd => Box::new(Sgd::new(lr, momentum)),
            Self::Adam => Box::new(Adam::new(lr)),
        }
    }
}

impl FromStr for OptimizerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sgd" => Ok(Self::Sgd),
            "adam" => Ok(Self::Adam),
            other => Err(Error::Training(format!("unknown optimizer '{other}'"))),
        }
    }
}

/// SGD with classical momentum.
#[derive(Debug, Clone)]
pub struct Sgd {
    lr: f32,
    momentum: f32,
    velocity: Vec<Tensor>,
}

impl Sgd {
    /// Create an optimizer. `momentum` 0.0 gives plain SGD.
    #[must_use]
    pub const fn new(lr: f32, momentum: f32) -> Self {
        Self {
            lr,
            momentum,
            velocity: Vec::new(),
        }
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, params: &mut [&mut Tensor], grads: &[Tensor]) -> Result<()> {
        check_pairs(params, grads)?;
        if self.velocity.len() != grads.len() {
            self.velocity = grads.iter().map(Tensor::zeros_like).collect();
        }
        for ((param, grad), vel) in params.iter_mut().zip(grads).zip(&mut self.velocity) {
            for ((p, g), v) in param
                .data_mut()
                .iter_mut()
                .zip(grad.data())
                .zip(vel.data_mut())
            {
                *v = self.momentum * *v + g;
                *p -= self.lr * *v;
            }
        }
        Ok(())
    }
}

/// Adam with the usual defaults (0.9, 0.999, 1e-8).
#[derive(Debug, Clone)]
pub struct Adam {
    lr: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    t: i32,
    m: Vec<Tensor>,
    v: Vec<Tensor>,
}

impl Adam {
    /// Create an optimizer with learning rate `lr`.
    #[must_use]
    pub const fn new(lr: f32) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            t: 0,
            m: Vec::new(),
            v: Vec::new(),
        }
    }
}

impl Optimizer for Adam {
    fn step(&mut self, params: &mut [&mut Tensor], grads: &[Tensor]) -> Result<()> {
        check_pairs(params, grads)?;
        if self.m.len() != grads.len() {
            self.m = grads.iter().map(Tensor::zeros_like).collect();
            self.v = grads.iter().map(Tensor::zeros_like).collect();
            self.t = 0;
        }
        self.t = self.t.saturating_add(1);
        let bc1 = 1.0 - self.beta1.powi(self.t);
        let bc2 = 1.0 - self.beta2.powi(self.t);

        for (i, (param, grad)) in params.iter_mut().zip(grads).enumerate() {
            let m = self.m[i].data_mut();
            let v = self.v[i].data_mut();
            for (j, (p, g)) in param.data_mut().iter_mut().zip(grad.data()).enumerate() {
                m[j] = self.beta1 * m[j] + (1.0 - self.beta1) * g;
                v[j] = self.beta2 * v[j] + (1.0 - self.beta2) * g * g;
                let m_hat = m[j] / bc1;
                let v_hat = v[j] / bc2;
                *p -= self.lr * m_hat / (v_hat.sqrt() + self.eps);
            }
        }
        Ok(())
    }
}
