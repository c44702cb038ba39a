//! Explicit ownership of whichever compute backend a run uses.

use log::{info, warn};

use layerdrive_utils::{
    BackendPreference, GpuAvailability, GpuContext, GpuContextOptions, HarnessSettings,
};

use crate::{
    backend::CpuBackend,
    error::ConvError,
    gpu::WgpuBackend,
    pipeline::{LayerPipeline, PipelineTrace},
};

/// How to pick and size the backend.
#[derive(Debug, Clone, Default)]
pub struct ComputeOptions {
    pub backend: BackendPreference,
    pub gpu: GpuContextOptions,
    /// Dedicated CPU worker count; `None` shares the global rayon pool.
    pub cpu_threads: Option<usize>,
    /// Ceiling for pooled device buffers, in bytes.
    pub max_device_memory: Option<u64>,
}

impl From<&HarnessSettings> for ComputeOptions {
    fn from(settings: &HarnessSettings) -> Self {
        Self {
            backend: settings.compute.backend,
            gpu: (&settings.gpu).into(),
            cpu_threads: settings.compute.cpu_threads,
            max_device_memory: settings.compute.max_device_memory_bytes(),
        }
    }
}

/// The backend a run executes on.
///
/// Dropping the context releases the device, its compiled kernel and every pooled buffer.
#[derive(Debug)]
pub enum ComputeContext {
    Gpu(WgpuBackend),
    Cpu(CpuBackend),
}

impl ComputeContext {
    /// Initialize the backend `options` ask for.
    ///
    /// `Gpu` fails when no device can be created; `Auto` falls back to the CPU with a warning.
    pub fn acquire(options: &ComputeOptions) -> Result<Self, ConvError> {
        match options.backend {
            BackendPreference::Cpu => Self::cpu(options),
            BackendPreference::Gpu => match GpuContext::init_with_fallback(&options.gpu) {
                GpuAvailability::Available(context) => {
                    Self::gpu(WgpuBackend::new(context, options.max_device_memory)?)
                }
                other => Err(ConvError::Dispatch {
                    backend: "wgpu",
                    reason: other
                        .reason()
                        .unwrap_or_else(|| "no GPU available".to_string()),
                }),
            },
            BackendPreference::Auto => match GpuContext::init_with_fallback(&options.gpu) {
                GpuAvailability::Available(context) => {
                    match WgpuBackend::new(context, options.max_device_memory) {
                        Ok(backend) => Self::gpu(backend),
                        Err(err) => {
                            warn!(target: "layerdrive::gpu", "GPU fallback to CPU: {err}");
                            Self::cpu(options)
                        }
                    }
                }
                GpuAvailability::Disabled { reason } => {
                    info!(target: "layerdrive::gpu", "GPU disabled: {reason}");
                    Self::cpu(options)
                }
                GpuAvailability::Unavailable { error } => {
                    warn!(target: "layerdrive::gpu", "GPU fallback to CPU: {error}");
                    Self::cpu(options)
                }
            },
        }
    }

    fn gpu(backend: WgpuBackend) -> Result<Self, ConvError> {
        info!(
            target: "layerdrive::gpu",
            "GPU ready: {}",
            backend.context().describe()
        );
        Ok(Self::Gpu(backend))
    }

    fn cpu(options: &ComputeOptions) -> Result<Self, ConvError> {
        let backend = match options.cpu_threads {
            Some(threads) => CpuBackend::with_threads(threads)?,
            None => CpuBackend::new(),
        };
        info!(
            target: "layerdrive::pipeline",
            "CPU backend ready with {} threads",
            backend.threads()
        );
        Ok(Self::Cpu(backend))
    }

    pub fn is_gpu(&self) -> bool {
        matches!(self, Self::Gpu(_))
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            Self::Gpu(_) => "wgpu",
            Self::Cpu(_) => "cpu",
        }
    }

    /// Human readable device summary.
    pub fn describe(&self) -> String {
        match self {
            Self::Gpu(backend) => format!("wgpu on {}", backend.context().describe()),
            Self::Cpu(backend) => format!("cpu with {} threads", backend.threads()),
        }
    }

    /// Run `pipeline` once, returning the final output.
    pub fn run(&self, pipeline: &LayerPipeline, input: &[f32]) -> Result<Vec<f32>, ConvError> {
        match self {
            Self::Gpu(backend) => pipeline.run(backend, input),
            Self::Cpu(backend) => pipeline.run(backend, input),
        }
    }

    /// Run `pipeline` once, keeping every layer's output.
    pub fn run_traced(
        &self,
        pipeline: &LayerPipeline,
        input: &[f32],
    ) -> Result<PipelineTrace, ConvError> {
        match self {
            Self::Gpu(backend) => pipeline.run_traced(backend, input),
            Self::Cpu(backend) => pipeline.run_traced(backend, input),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{layer::ConvLayerSpec, pipeline::PipelineLayer};

    fn ones_pipeline() -> LayerPipeline {
        let spec = ConvLayerSpec::new(1, 1, 4, 4, 3, 3, 1, 1, false).unwrap();
        LayerPipeline::new(vec![
            PipelineLayer::new("conv1", spec, vec![1.0; 9], vec![0.0]).unwrap(),
        ])
        .unwrap()
    }

    #[test]
    fn cpu_preference_never_touches_the_gpu() {
        let options = ComputeOptions {
            backend: BackendPreference::Cpu,
            cpu_threads: Some(2),
            ..ComputeOptions::default()
        };
        let context = ComputeContext::acquire(&options).unwrap();
        assert!(!context.is_gpu());
        assert_eq!(context.backend_name(), "cpu");
        assert_eq!(context.describe(), "cpu with 2 threads");
        assert_eq!(context.run(&ones_pipeline(), &[1.0; 16]).unwrap(), vec![9.0; 4]);
    }

    #[test]
    fn auto_falls_back_when_gpu_is_disabled() {
        let options = ComputeOptions {
            backend: BackendPreference::Auto,
            gpu: GpuContextOptions::disabled(),
            ..ComputeOptions::default()
        };
        let context = ComputeContext::acquire(&options).unwrap();
        assert_eq!(context.backend_name(), "cpu");
        let trace = context.run_traced(&ones_pipeline(), &[1.0; 16]).unwrap();
        assert_eq!(trace.output(), &[9.0; 4]);
    }

    #[test]
    fn required_gpu_fails_when_disabled() {
        let options = ComputeOptions {
            backend: BackendPreference::Gpu,
            gpu: GpuContextOptions::disabled(),
            ..ComputeOptions::default()
        };
        let err = ComputeContext::acquire(&options).unwrap_err();
        assert!(matches!(err, ConvError::Dispatch { backend: "wgpu", .. }));
    }

    #[test]
    fn options_follow_harness_settings() {
        let mut settings = HarnessSettings::default();
        settings.compute.backend = BackendPreference::Cpu;
        settings.compute.cpu_threads = Some(3);
        settings.compute.max_device_memory_mb = Some(2);
        settings.gpu.enabled = false;

        let options = ComputeOptions::from(&settings);
        assert_eq!(options.backend, BackendPreference::Cpu);
        assert_eq!(options.cpu_threads, Some(3));
        assert_eq!(options.max_device_memory, Some(2 * 1024 * 1024));
        assert!(!options.gpu.enabled);
    }
}
