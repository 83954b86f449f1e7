//! Built-in model runtime
//!
//! A small CPU classifier stack: an [`Mlp`] trained with softmax
//! cross-entropy, SGD/Adam optimizers, batching [`DataLoader`]s and a
//! deterministic synthetic dataset. User model and dataset modules
//! describe instances of these types; [`defaults`] provides the ones used
//! when nothing is uploaded.

mod data;
pub mod defaults;
mod model;
mod optim;

pub use data::{synthetic_partition, DataLoader, Sample, SyntheticSpec};
pub use model::{BatchStats, Mlp, Model, ModelSpec};
pub use optim::{Adam, Optimizer, OptimizerKind, Sgd};
