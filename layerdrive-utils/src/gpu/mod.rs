//! `wgpu` device setup.
//!
//! [`GpuContext`] owns the instance, adapter, device and queue for as long as it lives; the
//! convolution backend shares it through an `Arc` and everything is released when the last
//! handle drops. [`GpuContext::init_with_fallback`] reports why no GPU is available instead of
//! failing, so callers can switch to the CPU path.

pub mod buffer_pool;

pub use buffer_pool::{BufferPoolError, GpuBufferPool};

use std::{env, sync::Arc};

use log::{debug, info, warn};
use pollster::block_on;
use thiserror::Error;
use wgpu::{
    Adapter, AdapterInfo, Backends, Device, DeviceDescriptor, ExperimentalFeatures, Features,
    Instance, InstanceDescriptor, InstanceFlags, Limits, MemoryHints, PowerPreference, Queue,
    RequestAdapterError, RequestAdapterOptions, RequestDeviceError, Trace,
};

/// Setting this variable to anything but `0`/`false` disables GPU initialization when the
/// environment is respected.
pub const DISABLE_GPU_ENV: &str = "LAYERDRIVE_DISABLE_GPU";

/// Options for creating a [`GpuContext`].
#[derive(Clone, Debug)]
pub struct GpuContextOptions {
    /// Whether GPU support is enabled.
    pub enabled: bool,
    /// Let `WGPU_*` variables and [`DISABLE_GPU_ENV`] override these options.
    pub respect_env: bool,
    pub backends: Backends,
    pub flags: InstanceFlags,
    pub power_preference: PowerPreference,
    pub force_fallback_adapter: bool,
    /// Limits requested from the device; `None` takes whatever the adapter offers.
    pub required_limits: Option<Limits>,
    pub label: Option<String>,
}

impl Default for GpuContextOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            respect_env: true,
            backends: Backends::PRIMARY,
            flags: InstanceFlags::from_build_config(),
            power_preference: PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            required_limits: None,
            label: Some("layerdrive compute device".to_string()),
        }
    }
}

impl GpuContextOptions {
    /// Options that never touch the GPU.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    fn disabled_by_env(&self) -> bool {
        self.respect_env
            && env::var(DISABLE_GPU_ENV)
                .map(|value| !matches!(value.trim(), "" | "0" | "false"))
                .unwrap_or(false)
    }
}

/// Outcome of [`GpuContext::init_with_fallback`].
#[derive(Debug)]
pub enum GpuAvailability {
    Available(Arc<GpuContext>),
    /// Turned off by configuration or environment.
    Disabled { reason: String },
    /// Initialization was attempted and failed.
    Unavailable { error: GpuInitError },
}

impl GpuAvailability {
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available(_))
    }

    pub fn context(&self) -> Option<&Arc<GpuContext>> {
        match self {
            Self::Available(ctx) => Some(ctx),
            _ => None,
        }
    }

    /// Short human readable reason when no context is available.
    pub fn reason(&self) -> Option<String> {
        match self {
            Self::Available(_) => None,
            Self::Disabled { reason } => Some(reason.clone()),
            Self::Unavailable { error } => Some(error.to_string()),
        }
    }
}

/// Adapter, device and queue bundle.
#[derive(Debug)]
pub struct GpuContext {
    _instance: Instance,
    _adapter: Adapter,
    device: Device,
    queue: Queue,
    info: AdapterInfo,
    limits: Limits,
}

impl GpuContext {
    /// Create a context, failing when no suitable adapter or device exists.
    pub fn initialize(options: &GpuContextOptions) -> Result<Self, GpuInitError> {
        if !options.enabled {
            return Err(GpuInitError::Disabled);
        }
        if options.disabled_by_env() {
            return Err(GpuInitError::DisabledByEnv);
        }

        let mut instance_desc = if options.respect_env {
            InstanceDescriptor::from_env_or_default()
        } else {
            InstanceDescriptor::default()
        };
        let backends = if options.respect_env {
            options.backends.with_env()
        } else {
            options.backends
        };
        instance_desc.backends = backends;
        instance_desc.flags = if options.respect_env {
            options.flags.with_env()
        } else {
            options.flags
        };

        let instance = Instance::new(&instance_desc);
        let adapter = block_on(instance.request_adapter(&RequestAdapterOptions {
            power_preference: options.power_preference,
            force_fallback_adapter: options.force_fallback_adapter,
            compatible_surface: None,
        }))
        .map_err(|source| GpuInitError::Adapter { backends, source })?;

        let info = adapter.get_info();
        let limits = options
            .required_limits
            .clone()
            .unwrap_or_else(|| adapter.limits());
        debug!(
            target: "layerdrive::gpu",
            "requesting device on '{}' with max storage binding {} bytes",
            info.name, limits.max_storage_buffer_binding_size
        );

        let device_desc = DeviceDescriptor {
            label: options.label.as_deref(),
            required_features: Features::empty(),
            required_limits: limits.clone(),
            experimental_features: ExperimentalFeatures::default(),
            memory_hints: MemoryHints::Performance,
            trace: Trace::default(),
        };
        let (device, queue) = block_on(adapter.request_device(&device_desc))?;

        info!(
            target: "layerdrive::gpu",
            "Using GPU adapter '{}' ({:?}/{:?})",
            info.name, info.backend, info.device_type
        );

        Ok(Self {
            _instance: instance,
            _adapter: adapter,
            device,
            queue,
            info,
            limits,
        })
    }

    /// Try to create a context, reporting the reason when the CPU path should be used instead.
    pub fn init_with_fallback(options: &GpuContextOptions) -> GpuAvailability {
        match Self::initialize(options) {
            Ok(ctx) => GpuAvailability::Available(Arc::new(ctx)),
            Err(err @ (GpuInitError::Disabled | GpuInitError::DisabledByEnv)) => {
                GpuAvailability::Disabled {
                    reason: err.to_string(),
                }
            }
            Err(err) => {
                warn!(target: "layerdrive::gpu", "GPU initialization failed: {err}");
                GpuAvailability::Unavailable { error: err }
            }
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub fn adapter_info(&self) -> &AdapterInfo {
        &self.info
    }

    /// Limits negotiated for the device.
    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// One-line adapter description for logs and reports.
    pub fn describe(&self) -> String {
        format!(
            "{} ({:?}, driver {})",
            self.info.name,
            self.info.backend,
            if self.info.driver.is_empty() {
                "n/a"
            } else {
                self.info.driver.as_str()
            }
        )
    }
}

/// Reasons a GPU context could not be created.
#[derive(Debug, Error)]
pub enum GpuInitError {
    #[error("GPU adapter request failed for {backends:?}: {source}")]
    Adapter {
        backends: Backends,
        #[source]
        source: RequestAdapterError,
    },
    #[error("GPU device creation failed: {0}")]
    Device(#[from] RequestDeviceError),
    #[error("GPU acceleration disabled by configuration")]
    Disabled,
    #[error("GPU acceleration disabled by LAYERDRIVE_DISABLE_GPU")]
    DisabledByEnv,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_options_skip_gpu_setup() {
        let availability = GpuContext::init_with_fallback(&GpuContextOptions::disabled());
        assert!(!availability.is_available());
        assert!(availability.context().is_none());
        match availability {
            GpuAvailability::Disabled { reason } => {
                assert!(reason.contains("configuration"));
            }
            other => panic!("expected GPU to be disabled, got {other:?}"),
        }
    }

    #[test]
    fn ignored_environment_never_disables() {
        let options = GpuContextOptions {
            respect_env: false,
            ..GpuContextOptions::default()
        };
        assert!(!options.disabled_by_env());
    }
}
