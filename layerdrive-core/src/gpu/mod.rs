//! `wgpu` convolution backend.

mod conv;
mod tensor;

pub use tensor::GpuTensor;

use std::sync::Arc;

use layerdrive_utils::gpu::{GpuBufferPool, GpuContext};

use crate::{
    backend::{ConvBackend, ConvInvocation},
    error::ConvError,
};
use conv::ConvPipeline;

/// Runs convolutions as compute shader dispatches on one GPU context.
#[derive(Debug)]
pub struct WgpuBackend {
    context: Arc<GpuContext>,
    pool: Arc<GpuBufferPool>,
    conv: ConvPipeline,
}

impl WgpuBackend {
    /// Compile the convolution kernel on `context`.
    ///
    /// `max_memory` caps the bytes held by the device buffer pool.
    pub fn new(context: Arc<GpuContext>, max_memory: Option<u64>) -> Result<Self, ConvError> {
        let conv = ConvPipeline::new(context.device())?;
        let pool = Arc::new(GpuBufferPool::new(context.clone(), max_memory));
        Ok(Self {
            context,
            pool,
            conv,
        })
    }

    pub fn context(&self) -> &Arc<GpuContext> {
        &self.context
    }

    pub fn pool(&self) -> &Arc<GpuBufferPool> {
        &self.pool
    }

    fn ensure_same_context(&self, tensor: &GpuTensor) -> Result<(), ConvError> {
        if Arc::ptr_eq(tensor.context(), &self.context) {
            Ok(())
        } else {
            Err(ConvError::dispatch(
                "wgpu",
                "tensor belongs to a different GPU context",
            ))
        }
    }
}

impl ConvBackend for WgpuBackend {
    type Buffer = GpuTensor;

    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn upload(&self, data: &[f32], label: &str) -> Result<GpuTensor, ConvError> {
        GpuTensor::from_slice(self.context.clone(), self.pool.clone(), data, label)
    }

    fn allocate(&self, len: usize, label: &str) -> Result<GpuTensor, ConvError> {
        GpuTensor::uninitialized(self.context.clone(), self.pool.clone(), len, label)
    }

    fn download(&self, buffer: &GpuTensor) -> Result<Vec<f32>, ConvError> {
        self.ensure_same_context(buffer)?;
        buffer.to_vec()
    }

    fn dispatch(&self, invocation: ConvInvocation<'_, GpuTensor>) -> Result<(), ConvError> {
        for tensor in [invocation.input(), invocation.weights(), invocation.bias()] {
            self.ensure_same_context(tensor)?;
        }
        self.conv.execute(&self.context, invocation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{CpuBackend, DeviceBuffer},
        dispatch::ConvDispatcher,
        layer::ConvLayerSpec,
    };
    use layerdrive_utils::gpu::{GpuAvailability, GpuContextOptions};

    fn gpu_backend() -> Option<WgpuBackend> {
        match GpuContext::init_with_fallback(&GpuContextOptions::default()) {
            GpuAvailability::Available(ctx) => {
                Some(WgpuBackend::new(ctx, None).expect("compile convolution kernel"))
            }
            other => {
                eprintln!("Skipping wgpu backend test: {other:?}");
                None
            }
        }
    }

    fn pseudo_random(len: usize, seed: u32) -> Vec<f32> {
        let mut state = seed.wrapping_mul(747_796_405).wrapping_add(2_891_336_453);
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                (state >> 8) as f32 / (1u32 << 24) as f32 - 0.5
            })
            .collect()
    }

    fn assert_matches_cpu(spec: ConvLayerSpec) {
        let Some(gpu) = gpu_backend() else {
            return;
        };
        let input = pseudo_random(spec.input_len(), 1);
        let weights = pseudo_random(spec.weight_len(), 2);
        let bias = pseudo_random(spec.bias_len(), 3);

        let cpu = CpuBackend::new();
        let expected = ConvDispatcher::new(&cpu)
            .run_host(&spec, &input, &weights, &bias)
            .expect("cpu conv");
        let actual = ConvDispatcher::new(&gpu)
            .run_host(&spec, &input, &weights, &bias)
            .expect("gpu conv");

        assert_eq!(actual.len(), expected.len());
        let max_diff = actual
            .iter()
            .zip(&expected)
            .map(|(a, e)| (a - e).abs())
            .fold(0.0f32, f32::max);
        assert!(max_diff < 1e-3, "{spec}: max diff {max_diff}");
    }

    #[test]
    fn matches_cpu_on_unit_stride_relu() {
        assert_matches_cpu(ConvLayerSpec::new(3, 5, 17, 13, 3, 3, 1, 1, true).unwrap());
    }

    #[test]
    fn matches_cpu_on_strided_rectangular_kernel() {
        assert_matches_cpu(ConvLayerSpec::new(2, 1, 24, 24, 5, 5, 5, 5, true).unwrap());
        assert_matches_cpu(ConvLayerSpec::new(4, 3, 11, 19, 2, 4, 3, 2, false).unwrap());
    }

    #[test]
    fn matches_cpu_on_full_window_layer() {
        assert_matches_cpu(ConvLayerSpec::new(8, 10, 12, 12, 12, 12, 1, 1, false).unwrap());
    }

    #[test]
    fn ones_kernel_on_gpu() {
        let Some(gpu) = gpu_backend() else {
            return;
        };
        let spec = ConvLayerSpec::new(1, 1, 4, 4, 3, 3, 1, 1, true).unwrap();
        let dispatcher = ConvDispatcher::new(&gpu);
        let plain = dispatcher
            .run_host(&spec, &[1.0; 16], &[1.0; 9], &[0.0])
            .expect("conv");
        assert_eq!(plain, vec![9.0; 4]);
        let clamped = dispatcher
            .run_host(&spec, &[1.0; 16], &[1.0; 9], &[-9.0])
            .expect("conv");
        assert_eq!(clamped, vec![0.0; 4]);
    }

    #[test]
    fn outputs_stay_on_device_between_dispatches() {
        let Some(gpu) = gpu_backend() else {
            return;
        };
        let spec = ConvLayerSpec::new(1, 1, 3, 3, 1, 1, 1, 1, true).unwrap();
        let input = gpu.upload(&[1.0, -2.0, 3.0, -4.0, 5.0, -6.0, 7.0, -8.0, 9.0], "in").unwrap();
        let weights = gpu.upload(&[2.0], "w").unwrap();
        let bias = gpu.upload(&[0.0], "b").unwrap();
        let mut hidden = gpu.allocate(spec.output_len(), "hidden").unwrap();
        let mut output = gpu.allocate(spec.output_len(), "out").unwrap();

        let dispatcher = ConvDispatcher::new(&gpu);
        dispatcher
            .run(&spec, &input, &weights, &bias, &mut hidden)
            .unwrap();
        dispatcher
            .run(&spec, &hidden, &weights, &bias, &mut output)
            .unwrap();
        assert_eq!(output.len(), 9);
        assert_eq!(
            gpu.download(&output).unwrap(),
            vec![4.0, 0.0, 12.0, 0.0, 20.0, 0.0, 28.0, 0.0, 36.0]
        );
    }

    #[test]
    fn foreign_tensors_are_rejected() {
        let (Some(first), Some(second)) = (gpu_backend(), gpu_backend()) else {
            return;
        };
        let foreign = second.upload(&[1.0], "foreign").unwrap();
        assert!(matches!(
            first.download(&foreign),
            Err(ConvError::Dispatch { .. })
        ));
    }
}
