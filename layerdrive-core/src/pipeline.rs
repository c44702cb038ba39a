//! Feed-forward chains of convolution layers.
//!
//! A [`LayerPipeline`] is validated when it is built: every layer's output dims must equal the
//! next layer's input dims, so a shape problem surfaces before any work is dispatched. Running
//! it uploads the immutable weights once ([`LayerPipeline::bind`]), then walks the layers in
//! order. Each layer writes a fresh intermediate buffer that becomes the next layer's input; the
//! previous intermediate is dropped as soon as it has been consumed.

use std::{
    fmt,
    time::{Duration, Instant},
};

use log::{Level, debug, info};
use serde::Serialize;

use layerdrive_utils::timing_guard;

use crate::{
    backend::ConvBackend,
    dispatch::ConvDispatcher,
    error::{BufferRole, ConvError, check_len},
    layer::{ConvLayerSpec, TensorDims, WorkSize},
};

/// One layer's spec with its weights and bias.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineLayer {
    label: String,
    spec: ConvLayerSpec,
    weights: Vec<f32>,
    bias: Vec<f32>,
}

impl PipelineLayer {
    /// Pair a spec with its parameters, checking their lengths.
    pub fn new(
        label: impl Into<String>,
        spec: ConvLayerSpec,
        weights: Vec<f32>,
        bias: Vec<f32>,
    ) -> Result<Self, ConvError> {
        check_len(BufferRole::Weights, spec.weight_len(), weights.len())?;
        check_len(BufferRole::Bias, spec.bias_len(), bias.len())?;
        Ok(Self {
            label: label.into(),
            spec,
            weights,
            bias,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn spec(&self) -> &ConvLayerSpec {
        &self.spec
    }

    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    pub fn bias(&self) -> &[f32] {
        &self.bias
    }
}

/// Shape-checked sequence of convolution layers.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerPipeline {
    layers: Vec<PipelineLayer>,
}

impl LayerPipeline {
    /// Validate that consecutive layers connect.
    pub fn new(layers: Vec<PipelineLayer>) -> Result<Self, ConvError> {
        if layers.is_empty() {
            return Err(ConvError::InvalidShape(
                "a pipeline needs at least one layer".to_string(),
            ));
        }
        for (index, pair) in layers.windows(2).enumerate() {
            let (upstream, downstream) = (&pair[0], &pair[1]);
            if !upstream.spec.feeds(&downstream.spec) {
                return Err(ConvError::ShapeMismatch {
                    boundary: format!(
                        "layer {index} ({}) -> layer {} ({})",
                        upstream.label,
                        index + 1,
                        downstream.label
                    ),
                    produced: upstream.spec.output_dims(),
                    expected: downstream.spec.input_dims(),
                });
            }
        }
        Ok(Self { layers })
    }

    /// Assemble a pipeline from parallel lists and run it once on `backend`.
    ///
    /// Shapes are checked before the first dispatch; no output is returned if any layer fails.
    pub fn build<B: ConvBackend>(
        backend: &B,
        specs: &[ConvLayerSpec],
        weights: Vec<Vec<f32>>,
        biases: Vec<Vec<f32>>,
        input: &[f32],
    ) -> Result<Vec<f32>, ConvError> {
        if weights.len() != specs.len() || biases.len() != specs.len() {
            return Err(ConvError::InvalidShape(format!(
                "{} layer specs but {} weight tensors and {} bias vectors",
                specs.len(),
                weights.len(),
                biases.len()
            )));
        }
        let layers = specs
            .iter()
            .zip(weights.into_iter().zip(biases))
            .enumerate()
            .map(|(index, (spec, (weights, bias)))| {
                let label = format!("layer{index}");
                PipelineLayer::new(label.as_str(), *spec, weights, bias)
                    .map_err(|err| err.in_layer(index, &label))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(layers)?.run(backend, input)
    }

    pub fn layers(&self) -> &[PipelineLayer] {
        &self.layers
    }

    pub fn input_dims(&self) -> TensorDims {
        self.layers[0].spec.input_dims()
    }

    pub fn output_dims(&self) -> TensorDims {
        self.layers[self.layers.len() - 1].spec.output_dims()
    }

    /// Per-layer dispatch grids, in order.
    pub fn work_sizes(&self) -> impl Iterator<Item = (&str, WorkSize)> + '_ {
        self.layers
            .iter()
            .map(|layer| (layer.label.as_str(), layer.spec.work_size()))
    }

    /// Sum of output elements computed across all layers.
    pub fn total_work_items(&self) -> u64 {
        self.work_sizes().map(|(_, work)| work.items()).sum()
    }

    /// Upload every layer's weights and bias to `backend`.
    pub fn bind<'p, B: ConvBackend>(
        &'p self,
        backend: &'p B,
    ) -> Result<BoundPipeline<'p, B>, ConvError> {
        let params = self
            .layers
            .iter()
            .enumerate()
            .map(|(index, layer)| {
                let weights = backend.upload(&layer.weights, &format!("{}_weights", layer.label));
                let bias = backend.upload(&layer.bias, &format!("{}_bias", layer.label));
                weights
                    .and_then(|weights| bias.map(|bias| (weights, bias)))
                    .map_err(|err| err.in_layer(index, &layer.label))
            })
            .collect::<Result<Vec<_>, _>>()?;
        debug!(
            target: "layerdrive::pipeline",
            "bound {} layers to {} backend",
            self.layers.len(),
            backend.name()
        );
        Ok(BoundPipeline {
            pipeline: self,
            backend,
            params,
        })
    }

    /// Run once and return the final output.
    pub fn run<B: ConvBackend>(&self, backend: &B, input: &[f32]) -> Result<Vec<f32>, ConvError> {
        self.bind(backend)?.run(input)
    }

    /// Run once, keeping every layer's output.
    pub fn run_traced<B: ConvBackend>(
        &self,
        backend: &B,
        input: &[f32],
    ) -> Result<PipelineTrace, ConvError> {
        self.bind(backend)?.run_traced(input)
    }
}

/// A pipeline whose parameters already live on a backend.
pub struct BoundPipeline<'p, B: ConvBackend> {
    pipeline: &'p LayerPipeline,
    backend: &'p B,
    params: Vec<(B::Buffer, B::Buffer)>,
}

impl<B: ConvBackend> fmt::Debug for BoundPipeline<'_, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundPipeline")
            .field("backend", &self.backend.name())
            .field("layers", &self.params.len())
            .finish()
    }
}

impl<'p, B: ConvBackend> BoundPipeline<'p, B> {
    /// Run the layers on `input` and return the final output.
    pub fn run(&self, input: &[f32]) -> Result<Vec<f32>, ConvError> {
        let output = self.execute(input, |_, _, _| Ok(()))?;
        let last = self.pipeline.layers.len() - 1;
        self.backend
            .download(&output)
            .map_err(|err| err.in_layer(last, &self.pipeline.layers[last].label))
    }

    /// Run the layers on `input`, reading every layer's output back to the host.
    pub fn run_traced(&self, input: &[f32]) -> Result<PipelineTrace, ConvError> {
        let started = Instant::now();
        let mut layers = Vec::with_capacity(self.pipeline.layers.len());
        self.execute(input, |index, output, elapsed| {
            let layer = &self.pipeline.layers[index];
            layers.push(LayerTrace {
                index,
                label: layer.label.clone(),
                spec: layer.spec,
                work_items: layer.spec.work_size().items(),
                elapsed,
                output: self.backend.download(output)?,
            });
            Ok(())
        })?;
        Ok(PipelineTrace {
            backend: self.backend.name(),
            layers,
            elapsed: started.elapsed(),
        })
    }

    fn execute<F>(&self, input: &[f32], mut observe: F) -> Result<B::Buffer, ConvError>
    where
        F: FnMut(usize, &B::Buffer, Duration) -> Result<(), ConvError>,
    {
        let layers = &self.pipeline.layers;
        let first = &layers[0];
        check_len(BufferRole::Input, first.spec.input_len(), input.len())
            .map_err(|err| err.in_layer(0, &first.label))?;

        let _run = timing_guard(
            format!("{} pipeline ({} layers)", self.backend.name(), layers.len()),
            Level::Info,
        );
        let dispatcher = ConvDispatcher::new(self.backend);
        let mut current = self
            .backend
            .upload(input, "pipeline_input")
            .map_err(|err| err.in_layer(0, &first.label))?;

        for (index, (layer, (weights, bias))) in layers.iter().zip(&self.params).enumerate() {
            let started = Instant::now();
            let next = self
                .backend
                .allocate(layer.spec.output_len(), &format!("{}_output", layer.label))
                .and_then(|mut next| {
                    dispatcher
                        .run(&layer.spec, &current, weights, bias, &mut next)
                        .map(|_| next)
                })
                .map_err(|err| err.in_layer(index, &layer.label))?;
            let elapsed = started.elapsed();
            info!(
                target: "layerdrive::pipeline",
                "{} [{}] {} work items in {elapsed:.2?}",
                layer.label,
                layer.spec,
                layer.spec.work_size().items()
            );
            observe(index, &next, elapsed).map_err(|err| err.in_layer(index, &layer.label))?;
            // Releases the consumed intermediate.
            current = next;
        }
        Ok(current)
    }
}

/// Host copy of one layer's output plus timing.
#[derive(Debug, Clone, Serialize)]
pub struct LayerTrace {
    pub index: usize,
    pub label: String,
    pub spec: ConvLayerSpec,
    pub work_items: u64,
    pub elapsed: Duration,
    #[serde(skip)]
    pub output: Vec<f32>,
}

/// Every layer output of one traced run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineTrace {
    pub backend: &'static str,
    pub layers: Vec<LayerTrace>,
    pub elapsed: Duration,
}

impl PipelineTrace {
    /// Output of the last layer.
    pub fn output(&self) -> &[f32] {
        self.layers
            .last()
            .map(|layer| layer.output.as_slice())
            .unwrap_or_default()
    }

    pub fn total_work_items(&self) -> u64 {
        self.layers.iter().map(|layer| layer.work_items).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ConvInvocation, CpuBackend, HostBuffer};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// CPU backend that counts dispatches and can be told to fail one of them.
    #[derive(Debug, Default)]
    struct ProbeBackend {
        inner: CpuBackend,
        dispatches: AtomicUsize,
        fail_at: Option<usize>,
    }

    impl ConvBackend for ProbeBackend {
        type Buffer = HostBuffer;

        fn name(&self) -> &'static str {
            "probe"
        }

        fn upload(&self, data: &[f32], label: &str) -> Result<HostBuffer, ConvError> {
            self.inner.upload(data, label)
        }

        fn allocate(&self, len: usize, label: &str) -> Result<HostBuffer, ConvError> {
            self.inner.allocate(len, label)
        }

        fn download(&self, buffer: &HostBuffer) -> Result<Vec<f32>, ConvError> {
            self.inner.download(buffer)
        }

        fn dispatch(&self, invocation: ConvInvocation<'_, HostBuffer>) -> Result<(), ConvError> {
            let call = self.dispatches.fetch_add(1, Ordering::SeqCst);
            if self.fail_at == Some(call) {
                return Err(ConvError::dispatch("probe", "injected failure"));
            }
            self.inner.dispatch(invocation)
        }
    }

    fn ones_then_split() -> (Vec<ConvLayerSpec>, Vec<Vec<f32>>, Vec<Vec<f32>>) {
        let first = ConvLayerSpec::new(1, 1, 4, 4, 3, 3, 1, 1, true).unwrap();
        let second = ConvLayerSpec::new(1, 2, 2, 2, 2, 2, 1, 1, false).unwrap();
        let weights = vec![vec![1.0; 9], [vec![1.0; 4], vec![-1.0; 4]].concat()];
        let biases = vec![vec![0.0], vec![0.0, 1.0]];
        (vec![first, second], weights, biases)
    }

    #[test]
    fn two_layer_chain_produces_expected_values() {
        let (specs, weights, biases) = ones_then_split();
        let output =
            LayerPipeline::build(&CpuBackend::new(), &specs, weights, biases, &[1.0; 16]).unwrap();
        assert_eq!(output, vec![36.0, -35.0]);
    }

    #[test]
    fn mismatched_channels_fail_before_any_dispatch() {
        let probe = ProbeBackend::default();
        let first = ConvLayerSpec::new(1, 2, 4, 4, 3, 3, 1, 1, true).unwrap();
        let second = ConvLayerSpec::new(3, 1, 2, 2, 2, 2, 1, 1, false).unwrap();
        let err = LayerPipeline::build(
            &probe,
            &[first, second],
            vec![vec![0.0; 18], vec![0.0; 12]],
            vec![vec![0.0; 2], vec![0.0]],
            &[1.0; 16],
        )
        .unwrap_err();

        match err {
            ConvError::ShapeMismatch {
                produced, expected, ..
            } => {
                assert_eq!(produced, TensorDims::new(2, 2, 2));
                assert_eq!(expected, TensorDims::new(3, 2, 2));
            }
            other => panic!("expected shape mismatch, got {other}"),
        }
        assert_eq!(probe.dispatches.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn mismatched_spatial_dims_are_rejected() {
        let first = ConvLayerSpec::new(1, 1, 6, 6, 3, 3, 1, 1, true).unwrap();
        let second = ConvLayerSpec::new(1, 1, 5, 5, 2, 2, 1, 1, false).unwrap();
        let layers = vec![
            PipelineLayer::new("a", first, vec![0.0; 9], vec![0.0]).unwrap(),
            PipelineLayer::new("b", second, vec![0.0; 4], vec![0.0]).unwrap(),
        ];
        let err = LayerPipeline::new(layers).unwrap_err();
        assert!(err.to_string().contains("layer 0 (a) -> layer 1 (b)"));
    }

    #[test]
    fn failing_layer_aborts_the_run() {
        let probe = ProbeBackend {
            fail_at: Some(1),
            ..ProbeBackend::default()
        };
        let (specs, weights, biases) = ones_then_split();
        let err = LayerPipeline::build(&probe, &specs, weights, biases, &[1.0; 16]).unwrap_err();
        assert_eq!(err.layer_index(), Some(1));
        assert!(matches!(err.root(), ConvError::Dispatch { backend: "probe", .. }));
        assert_eq!(probe.dispatches.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn wrong_parameter_lengths_name_the_layer() {
        let (specs, mut weights, biases) = ones_then_split();
        weights[1].pop();
        let err =
            LayerPipeline::build(&CpuBackend::new(), &specs, weights, biases, &[1.0; 16]).unwrap_err();
        assert_eq!(err.layer_index(), Some(1));
        assert!(matches!(
            err.root(),
            ConvError::BufferLength {
                role: BufferRole::Weights,
                ..
            }
        ));

        let (specs, weights, _) = ones_then_split();
        let err = LayerPipeline::build(&CpuBackend::new(), &specs, weights, vec![vec![0.0]], &[])
            .unwrap_err();
        assert!(matches!(err, ConvError::InvalidShape(_)));
    }

    #[test]
    fn input_length_is_checked_before_upload() {
        let (specs, weights, biases) = ones_then_split();
        let probe = ProbeBackend::default();
        let err = LayerPipeline::build(&probe, &specs, weights, biases, &[1.0; 15]).unwrap_err();
        assert_eq!(err.layer_index(), Some(0));
        assert!(matches!(
            err.root(),
            ConvError::BufferLength {
                role: BufferRole::Input,
                expected: 16,
                actual: 15
            }
        ));
        assert_eq!(probe.dispatches.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn empty_pipeline_is_invalid() {
        assert!(matches!(
            LayerPipeline::new(Vec::new()),
            Err(ConvError::InvalidShape(_))
        ));
    }

    #[test]
    fn traced_run_keeps_every_layer() {
        let (specs, weights, biases) = ones_then_split();
        let layers = specs
            .iter()
            .zip(weights.into_iter().zip(biases))
            .enumerate()
            .map(|(i, (spec, (w, b)))| PipelineLayer::new(format!("conv{}", i + 1), *spec, w, b))
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        let pipeline = LayerPipeline::new(layers).unwrap();
        assert_eq!(pipeline.input_dims(), TensorDims::new(1, 4, 4));
        assert_eq!(pipeline.output_dims(), TensorDims::new(2, 1, 1));
        assert_eq!(pipeline.total_work_items(), 4 + 2);

        let trace = pipeline.run_traced(&CpuBackend::new(), &[1.0; 16]).unwrap();
        assert_eq!(trace.backend, "cpu");
        assert_eq!(trace.layers.len(), 2);
        assert_eq!(trace.layers[0].label, "conv1");
        assert_eq!(trace.layers[0].output, vec![9.0; 4]);
        assert_eq!(trace.output(), &[36.0, -35.0]);
        assert_eq!(trace.total_work_items(), 6);
    }

    #[test]
    fn bound_pipeline_runs_many_inputs() {
        let (specs, weights, biases) = ones_then_split();
        let layers = specs
            .iter()
            .zip(weights.into_iter().zip(biases))
            .map(|(spec, (w, b))| PipelineLayer::new("layer", *spec, w, b))
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        let pipeline = LayerPipeline::new(layers).unwrap();
        let probe = ProbeBackend::default();
        let bound = pipeline.bind(&probe).unwrap();

        assert_eq!(bound.run(&[1.0; 16]).unwrap(), vec![36.0, -35.0]);
        // All zeros: first layer clamps to 0, second layer yields its bias.
        assert_eq!(bound.run(&[0.0; 16]).unwrap(), vec![0.0, 1.0]);
        assert_eq!(probe.dispatches.load(Ordering::SeqCst), 4);
    }
}
