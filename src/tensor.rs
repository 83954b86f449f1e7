//! Dense parameter tensors and named state dictionaries
//!
//! The engine moves model weights around as [`Parameters`], an ordered
//! list of tensors with no names attached. Checkpoints store a
//! [`StateDict`], which pairs each tensor with its parameter name. The two
//! conversions below are order-dependent: tensors are zipped against the
//! model's current parameter names in insertion order, and any count or
//! shape disagreement is an error.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Ordered model weights as exchanged between clients and strategies.
pub type Parameters = Vec<Tensor>;

/// Row-major `f32` tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    /// Create a tensor, checking that `data` fills `shape` exactly.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ParameterMismatch`] if the element count differs
    /// from the product of the dimensions.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(Error::ParameterMismatch(format!(
                "shape {shape:?} needs {expected} values, got {}",
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    /// Unchecked constructor for callers that size `data` from `shape`.
    pub(crate) fn from_parts(shape: Vec<usize>, data: Vec<f32>) -> Self {
        debug_assert_eq!(shape.iter().product::<usize>(), data.len());
        Self { shape, data }
    }

    /// Tensor of zeros.
    #[must_use]
    pub fn zeros(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            data: vec![0.0; len],
        }
    }

    /// Tensor of zeros with the same shape as `self`.
    #[must_use]
    pub fn zeros_like(&self) -> Self {
        Self::zeros(self.shape.clone())
    }

    /// Dimensions.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Flat row-major values.
    #[must_use]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Mutable flat values.
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True for zero-element tensors.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Named parameters in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDict {
    entries: Vec<(String, Tensor)>,
}

impl StateDict {
    /// Create an empty state dict.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a named tensor, replacing an existing entry in place.
    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        let name = name.into();
        if let Some(slot) = self.entries.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = tensor;
        } else {
            self.entries.push((name, tensor));
        }
    }

    /// Look up a tensor by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, t)| t)
    }

    /// Parameter names in insertion order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    /// Iterate `(name, tensor)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.entries.iter().map(|(n, t)| (n.as_str(), t))
    }

    /// Number of named tensors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the dict holds no tensors.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop the names, keeping the tensor order.
    #[must_use]
    pub fn to_parameters(&self) -> Parameters {
        self.entries.iter().map(|(_, t)| t.clone()).collect()
    }
}

impl FromIterator<(String, Tensor)> for StateDict {
    fn from_iter<I: IntoIterator<Item = (String, Tensor)>>(iter: I) -> Self {
        let mut dict = Self::new();
        for (name, tensor) in iter {
            dict.insert(name, tensor);
        }
        dict
    }
}

/// Name an ordered parameter list after `template`'s entries.
///
/// # Errors
///
/// Returns [`Error::ParameterMismatch`] when the counts differ or any
/// tensor's shape differs from the template tensor of the same position.
pub fn parameters_to_state_dict(template: &StateDict, parameters: &[Tensor]) -> Result<StateDict> {
    if template.len() != parameters.len() {
        return Err(Error::ParameterMismatch(format!(
            "model has {} parameter tensors, received {}",
            template.len(),
            parameters.len()
        )));
    }

    template
        .iter()
        .zip(parameters)
        .map(|((name, expected), tensor)| {
            if expected.shape() != tensor.shape() {
                return Err(Error::ParameterMismatch(format!(
                    "'{name}' expects shape {:?}, received {:?}",
                    expected.shape(),
                    tensor.shape()
                )));
            }
            Ok((name.to_string(), tensor.clone()))
        })
        .collect()
}

/// Flatten a state dict into parameters ordered like `template`.
///
/// # Errors
///
/// Returns [`Error::ParameterMismatch`] if a template name is missing from
/// `state`, the dicts hold a different number of entries, or a shape differs.
pub fn state_dict_to_parameters(template: &StateDict, state: &StateDict) -> Result<Parameters> {
    if template.len() != state.len() {
        return Err(Error::ParameterMismatch(format!(
            "model has {} named parameters, state holds {}",
            template.len(),
            state.len()
        )));
    }

    template
        .iter()
        .map(|(name, expected)| {
            let tensor = state
                .get(name)
                .ok_or_else(|| Error::ParameterMismatch(format!("missing parameter '{name}'")))?;
            if tensor.shape() != expected.shape() {
                return Err(Error::ParameterMismatch(format!(
                    "'{name}' expects shape {:?}, found {:?}",
                    expected.shape(),
                    tensor.shape()
                )));
            }
            Ok(tensor.clone())
        })
        .collect()
}
