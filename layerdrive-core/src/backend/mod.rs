//! Compute backends that execute a single convolution invocation.
//!
//! A backend owns its buffer type (host vectors, GPU storage buffers, ...) and knows how to move
//! `f32` data in and out of it. All layer work reaches a backend as a [`ConvInvocation`]: an
//! immutable descriptor that bundles the layer spec, the four buffer handles and the scalar
//! kernel parameters, validated once at construction.

pub mod cpu;

use std::fmt;

use bytemuck::{Pod, Zeroable};

use crate::{
    error::{BufferRole, ConvError, check_len},
    layer::ConvLayerSpec,
};

pub use cpu::{CpuBackend, HostBuffer};

/// Backend-owned block of `f32` values with a known element count.
pub trait DeviceBuffer {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A place convolution invocations can run.
pub trait ConvBackend: Send + Sync + fmt::Debug {
    type Buffer: DeviceBuffer + Send;

    /// Short identifier used in logs and reports.
    fn name(&self) -> &'static str;

    /// Copy host values into a new backend buffer.
    fn upload(&self, data: &[f32], label: &str) -> Result<Self::Buffer, ConvError>;

    /// Allocate a buffer for `len` values whose contents are unspecified.
    fn allocate(&self, len: usize, label: &str) -> Result<Self::Buffer, ConvError>;

    /// Copy a buffer back to the host. Blocks until all prior work writing it has finished.
    fn download(&self, buffer: &Self::Buffer) -> Result<Vec<f32>, ConvError>;

    /// Execute one convolution and block until its output is fully written.
    fn dispatch(&self, invocation: ConvInvocation<'_, Self::Buffer>) -> Result<(), ConvError>;
}

/// Scalar kernel arguments in their positional order.
///
/// The layout is shared verbatim with the WGSL uniform block; `out_channels` and the padding
/// word follow the positional list.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct KernelParams {
    pub in_channels: u32,
    pub in_h: u32,
    pub in_w: u32,
    pub kernel_h: u32,
    pub kernel_w: u32,
    pub out_h: u32,
    pub out_w: u32,
    pub apply_activation: u32,
    pub stride_h: u32,
    pub stride_w: u32,
    pub out_channels: u32,
    pub _pad: u32,
}

impl From<&ConvLayerSpec> for KernelParams {
    fn from(spec: &ConvLayerSpec) -> Self {
        Self {
            in_channels: spec.in_channels(),
            in_h: spec.in_h(),
            in_w: spec.in_w(),
            kernel_h: spec.kernel_h(),
            kernel_w: spec.kernel_w(),
            out_h: spec.out_h(),
            out_w: spec.out_w(),
            apply_activation: u32::from(spec.apply_activation()),
            stride_h: spec.stride_h(),
            stride_w: spec.stride_w(),
            out_channels: spec.out_channels(),
            _pad: 0,
        }
    }
}

/// Everything one convolution call needs, checked and frozen.
///
/// The output is borrowed mutably and the operands shared, so the output is never one of the
/// input handles. Buffer types that share storage between handles would defeat this; neither
/// `HostBuffer` clones nor `GpuTensor` (which is not `Clone`) do.
pub struct ConvInvocation<'a, B> {
    spec: ConvLayerSpec,
    params: KernelParams,
    input: &'a B,
    weights: &'a B,
    bias: &'a B,
    output: &'a mut B,
}

impl<'a, B: DeviceBuffer> ConvInvocation<'a, B> {
    /// Bundle the operands of `spec`, rejecting buffers of the wrong length.
    pub fn new(
        spec: &ConvLayerSpec,
        input: &'a B,
        weights: &'a B,
        bias: &'a B,
        output: &'a mut B,
    ) -> Result<Self, ConvError> {
        check_len(BufferRole::Input, spec.input_len(), input.len())?;
        check_len(BufferRole::Weights, spec.weight_len(), weights.len())?;
        check_len(BufferRole::Bias, spec.bias_len(), bias.len())?;
        check_len(BufferRole::Output, spec.output_len(), output.len())?;
        Ok(Self {
            spec: *spec,
            params: KernelParams::from(spec),
            input,
            weights,
            bias,
            output,
        })
    }
}

impl<'a, B> ConvInvocation<'a, B> {
    pub fn spec(&self) -> &ConvLayerSpec {
        &self.spec
    }

    pub fn params(&self) -> &KernelParams {
        &self.params
    }

    pub fn input(&self) -> &B {
        self.input
    }

    pub fn weights(&self) -> &B {
        self.weights
    }

    pub fn bias(&self) -> &B {
        self.bias
    }

    /// Split into the read-only operands and the output slot.
    pub fn into_parts(self) -> (ConvOperands<'a, B>, &'a mut B) {
        (
            ConvOperands {
                params: self.params,
                input: self.input,
                weights: self.weights,
                bias: self.bias,
            },
            self.output,
        )
    }
}

/// Read-only half of a [`ConvInvocation`].
pub struct ConvOperands<'a, B> {
    pub params: KernelParams,
    pub input: &'a B,
    pub weights: &'a B,
    pub bias: &'a B,
}

impl<B> fmt::Debug for ConvInvocation<'_, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConvInvocation")
            .field("spec", &self.spec)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_keep_positional_order() {
        let spec = ConvLayerSpec::new(2, 1, 24, 24, 5, 5, 5, 5, true).unwrap();
        let params = KernelParams::from(&spec);
        let words: &[u32] = bytemuck::cast_slice(std::slice::from_ref(&params));
        assert_eq!(words, &[2, 24, 24, 5, 5, 4, 4, 1, 5, 5, 1, 0]);
        assert_eq!(std::mem::size_of::<KernelParams>() % 16, 0);
    }

    #[test]
    fn invocation_rejects_wrong_lengths() {
        let spec = ConvLayerSpec::new(1, 2, 3, 3, 2, 2, 1, 1, false).unwrap();
        let input = HostBuffer::from(vec![0.0; 9]);
        let weights = HostBuffer::from(vec![0.0; 8]);
        let short_bias = HostBuffer::from(vec![0.0; 1]);
        let mut output = HostBuffer::from(vec![0.0; 8]);

        let err = ConvInvocation::new(&spec, &input, &weights, &short_bias, &mut output)
            .unwrap_err();
        assert!(matches!(
            err,
            ConvError::BufferLength {
                role: BufferRole::Bias,
                expected: 2,
                actual: 1
            }
        ));

        let bias = HostBuffer::from(vec![0.0; 2]);
        let mut small_output = HostBuffer::from(vec![0.0; 7]);
        let err =
            ConvInvocation::new(&spec, &input, &weights, &bias, &mut small_output).unwrap_err();
        assert!(matches!(
            err,
            ConvError::BufferLength {
                role: BufferRole::Output,
                ..
            }
        ));

        let invocation = ConvInvocation::new(&spec, &input, &weights, &bias, &mut output).unwrap();
        assert_eq!(invocation.params().out_channels, 2);
        assert_eq!(invocation.spec().output_len(), 8);
    }
}
