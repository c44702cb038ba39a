use std::{fmt, io, path::PathBuf};

use layerdrive_utils::HexError;
use thiserror::Error;

use crate::layer::TensorDims;

/// Which operand of a convolution a buffer plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferRole {
    Input,
    Weights,
    Bias,
    Output,
}

impl fmt::Display for BufferRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BufferRole::Input => "input",
            BufferRole::Weights => "weight",
            BufferRole::Bias => "bias",
            BufferRole::Output => "output",
        })
    }
}

/// Failures raised while describing, loading or running convolution layers.
///
/// None of these are retried; each aborts the operation that raised it.
#[derive(Debug, Error)]
pub enum ConvError {
    /// Layer shape arithmetic is impossible (zero stride, kernel larger than input, ...).
    #[error("invalid layer shape: {0}")]
    InvalidShape(String),
    /// Two chained tensors disagree on their dims.
    #[error("shape mismatch at {boundary}: produces {produced}, expects {expected}")]
    ShapeMismatch {
        boundary: String,
        produced: TensorDims,
        expected: TensorDims,
    },
    /// A buffer handed to the dispatcher has the wrong element count.
    #[error("{role} buffer holds {actual} values, expected {expected}")]
    BufferLength {
        role: BufferRole,
        expected: usize,
        actual: usize,
    },
    /// The compute backend rejected or failed the work.
    #[error("{backend} dispatch failed: {reason}")]
    Dispatch {
        backend: &'static str,
        reason: String,
    },
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to decode {}: {source}", .path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: HexError,
    },
    /// Any of the above, raised while running a specific pipeline layer.
    #[error("layer {index} ({label}) failed: {source}")]
    Layer {
        index: usize,
        label: String,
        #[source]
        source: Box<ConvError>,
    },
}

impl ConvError {
    pub(crate) fn dispatch(backend: &'static str, reason: impl Into<String>) -> Self {
        Self::Dispatch {
            backend,
            reason: reason.into(),
        }
    }

    pub(crate) fn in_layer(self, index: usize, label: &str) -> Self {
        Self::Layer {
            index,
            label: label.to_string(),
            source: Box::new(self),
        }
    }

    /// The innermost error, looking through [`ConvError::Layer`] wrappers.
    pub fn root(&self) -> &ConvError {
        match self {
            ConvError::Layer { source, .. } => source.root(),
            other => other,
        }
    }

    /// Index of the pipeline layer that failed, when known.
    pub fn layer_index(&self) -> Option<usize> {
        match self {
            ConvError::Layer { index, .. } => Some(*index),
            _ => None,
        }
    }
}

/// Ensure a buffer holds exactly `expected` values.
pub(crate) fn check_len(role: BufferRole, expected: usize, actual: usize) -> Result<(), ConvError> {
    if expected == actual {
        Ok(())
    } else {
        Err(ConvError::BufferLength {
            role,
            expected,
            actual,
        })
    }
}
