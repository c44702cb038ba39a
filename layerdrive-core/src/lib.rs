//! Host-side convolution layer driver.
//!
//! This crate describes valid-mode 2-D convolution layers, dispatches them one at a time to a
//! CPU or `wgpu` backend, chains them into shape-checked pipelines and compares the results
//! with reference tensors.

/// Compute backends and the per-call invocation descriptor.
pub mod backend;
/// Reference comparison reports.
pub mod compare;
/// Backend selection and ownership.
pub mod context;
/// Single-layer dispatch.
pub mod dispatch;
pub mod error;
/// GPU backend.
pub mod gpu;
/// Layer shape arithmetic.
pub mod layer;
/// Network loading from hex tensor files.
pub mod network;
/// Chained layer execution.
pub mod pipeline;
/// Named network layouts.
pub mod presets;

pub use backend::{ConvBackend, ConvInvocation, CpuBackend, DeviceBuffer, HostBuffer, KernelParams};
pub use compare::{ComparisonConfig, ComparisonReport, ElementComparison, compare};
pub use context::{ComputeContext, ComputeOptions};
pub use dispatch::ConvDispatcher;
pub use error::{BufferRole, ConvError};
pub use gpu::{GpuTensor, WgpuBackend};
pub use layer::{ConvLayerSpec, TensorDims, WorkSize};
pub use network::{LoadedNetwork, Reference, WorkSummary, load_network, load_tensor, plan_layers};
pub use pipeline::{BoundPipeline, LayerPipeline, LayerTrace, PipelineLayer, PipelineTrace};
pub use presets::{NetworkPreset, preset_by_name, standard_presets};

/// Returns the crate version for diagnostics.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
