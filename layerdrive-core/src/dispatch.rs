//! Single-layer convolution dispatch.

use log::Level;

use layerdrive_utils::timing_guard;

use crate::{
    backend::{ConvBackend, ConvInvocation},
    error::{BufferRole, ConvError, check_len},
    layer::ConvLayerSpec,
};

/// Issues one convolution per call on a backend.
///
/// Holds nothing but the backend handle, so independent layers may be dispatched repeatedly or
/// from several threads.
#[derive(Debug)]
pub struct ConvDispatcher<'b, B: ConvBackend> {
    backend: &'b B,
}

impl<B: ConvBackend> Clone for ConvDispatcher<'_, B> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<B: ConvBackend> Copy for ConvDispatcher<'_, B> {}

impl<'b, B: ConvBackend> ConvDispatcher<'b, B> {
    pub fn new(backend: &'b B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &'b B {
        self.backend
    }

    /// Write `spec` applied to `input`, `weights` and `bias` into `output`.
    ///
    /// Buffer lengths are checked before anything reaches the backend. On error `output` holds
    /// no meaningful values.
    pub fn run(
        &self,
        spec: &ConvLayerSpec,
        input: &B::Buffer,
        weights: &B::Buffer,
        bias: &B::Buffer,
        output: &mut B::Buffer,
    ) -> Result<(), ConvError> {
        let invocation = ConvInvocation::new(spec, input, weights, bias, output)?;
        let _guard = timing_guard(format!("{} conv {spec}", self.backend.name()), Level::Debug);
        self.backend.dispatch(invocation)
    }

    /// Host-to-host convenience: upload operands, run, read the output back.
    pub fn run_host(
        &self,
        spec: &ConvLayerSpec,
        input: &[f32],
        weights: &[f32],
        bias: &[f32],
    ) -> Result<Vec<f32>, ConvError> {
        check_len(BufferRole::Input, spec.input_len(), input.len())?;
        check_len(BufferRole::Weights, spec.weight_len(), weights.len())?;
        check_len(BufferRole::Bias, spec.bias_len(), bias.len())?;

        let input = self.backend.upload(input, "conv_input")?;
        let weights = self.backend.upload(weights, "conv_weights")?;
        let bias = self.backend.upload(bias, "conv_bias")?;
        let mut output = self.backend.allocate(spec.output_len(), "conv_output")?;
        self.run(spec, &input, &weights, &bias, &mut output)?;
        self.backend.download(&output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{CpuBackend, HostBuffer};

    #[test]
    fn identity_then_relu_is_idempotent() {
        let cpu = CpuBackend::new();
        let dispatcher = ConvDispatcher::new(&cpu);
        let spec = ConvLayerSpec::new(1, 1, 2, 3, 1, 1, 1, 1, true).unwrap();
        let data = vec![0.0, 0.25, 1.0, 7.5, 1e6, 3.0];

        let once = dispatcher.run_host(&spec, &data, &[1.0], &[0.0]).unwrap();
        let twice = dispatcher.run_host(&spec, &once, &[1.0], &[0.0]).unwrap();
        assert_eq!(once, data);
        assert_eq!(twice, once);
    }

    #[test]
    fn relu_applied_twice_matches_once_on_mixed_layer() {
        let cpu = CpuBackend::new();
        let dispatcher = ConvDispatcher::new(&cpu);
        let first = ConvLayerSpec::new(1, 1, 3, 3, 2, 2, 1, 1, true).unwrap();
        let input = [1.0, -2.0, 3.0, -4.0, 5.0, -6.0, 7.0, -8.0, 9.0];
        let once = dispatcher
            .run_host(&first, &input, &[1.0, 0.5, -0.5, 1.0], &[0.25])
            .unwrap();
        assert!(once.iter().all(|v| *v >= 0.0));

        let identity = ConvLayerSpec::new(1, 1, 2, 2, 1, 1, 1, 1, true).unwrap();
        let again = dispatcher.run_host(&identity, &once, &[1.0], &[0.0]).unwrap();
        assert_eq!(again, once);
    }

    #[test]
    fn wrong_lengths_never_reach_the_backend() {
        let cpu = CpuBackend::new();
        let dispatcher = ConvDispatcher::new(&cpu);
        let spec = ConvLayerSpec::new(2, 1, 3, 3, 3, 3, 1, 1, false).unwrap();

        let err = dispatcher
            .run_host(&spec, &[0.0; 9], &[0.0; 18], &[0.0])
            .unwrap_err();
        assert!(matches!(
            err,
            ConvError::BufferLength {
                role: BufferRole::Input,
                expected: 18,
                actual: 9
            }
        ));

        let input = HostBuffer::from(vec![0.0; 18]);
        let weights = HostBuffer::from(vec![0.0; 17]);
        let bias = HostBuffer::from(vec![0.0]);
        let mut output = HostBuffer::from(vec![-1.0]);
        let err = dispatcher
            .run(&spec, &input, &weights, &bias, &mut output)
            .unwrap_err();
        assert!(matches!(
            err,
            ConvError::BufferLength {
                role: BufferRole::Weights,
                ..
            }
        ));
        assert_eq!(output.as_slice(), &[-1.0]);
    }
}
