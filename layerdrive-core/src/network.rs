//! Turning a network description plus hex tensor files into a runnable pipeline.

use std::{
    fs,
    path::{Path, PathBuf},
};

use log::{debug, info};
use serde::Serialize;

use layerdrive_utils::{NetworkSettings, decode_tensor};

use crate::{
    error::{BufferRole, ConvError, check_len},
    layer::{ConvLayerSpec, TensorDims},
    pipeline::{LayerPipeline, PipelineLayer},
};

/// Derive every layer's spec by chaining dims from the network input.
pub fn plan_layers(network: &NetworkSettings) -> Result<Vec<ConvLayerSpec>, ConvError> {
    let mut dims = TensorDims::new(
        network.input.channels,
        network.input.height,
        network.input.width,
    );
    network
        .layers
        .iter()
        .enumerate()
        .map(|(index, layer)| {
            let spec = ConvLayerSpec::new(
                dims.channels,
                layer.out_channels,
                dims.height,
                dims.width,
                layer.kernel[0],
                layer.kernel[1],
                layer.stride[0],
                layer.stride[1],
                layer.relu,
            )
            .map_err(|err| err.in_layer(index, &layer.name))?;
            dims = spec.output_dims();
            Ok(spec)
        })
        .collect()
}

/// Read and decode one hex tensor file.
pub fn load_tensor(path: &Path) -> Result<Vec<f32>, ConvError> {
    let text = fs::read_to_string(path).map_err(|source| ConvError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    decode_tensor(&text).map_err(|source| ConvError::Decode {
        path: path.to_path_buf(),
        source,
    })
}

/// Per-layer dispatch size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayerWork {
    pub label: String,
    pub output: TensorDims,
    pub work_items: u64,
}

/// Dispatch sizes of a whole network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkSummary {
    pub layers: Vec<LayerWork>,
    pub total: u64,
}

impl WorkSummary {
    pub fn of(pipeline: &LayerPipeline) -> Self {
        let layers: Vec<LayerWork> = pipeline
            .layers()
            .iter()
            .map(|layer| LayerWork {
                label: layer.label().to_string(),
                output: layer.spec().output_dims(),
                work_items: layer.spec().work_size().items(),
            })
            .collect();
        let total = layers.iter().map(|layer| layer.work_items).sum();
        Self { layers, total }
    }
}

/// Expected output of one pipeline stage.
#[derive(Debug, Clone, PartialEq)]
pub struct Reference {
    pub path: PathBuf,
    pub values: Vec<f32>,
}

/// Everything needed to run and check a network.
#[derive(Debug, Clone)]
pub struct LoadedNetwork {
    pub name: String,
    pub pipeline: LayerPipeline,
    pub input: Vec<f32>,
    /// One slot per layer; `None` when the layer has no reference file.
    pub layer_references: Vec<Option<Reference>>,
    pub final_reference: Option<Reference>,
}

impl LoadedNetwork {
    pub fn work_summary(&self) -> WorkSummary {
        WorkSummary::of(&self.pipeline)
    }
}

/// Load input, parameters and references listed in `network` from `data_dir`.
///
/// Every file is read before the pipeline is assembled, so a missing or malformed file fails the
/// load without any compute work.
pub fn load_network(network: &NetworkSettings, data_dir: &Path) -> Result<LoadedNetwork, ConvError> {
    let specs = plan_layers(network)?;
    info!(
        target: "layerdrive::pipeline",
        "loading network '{}' ({} layers) from {}",
        network.name,
        specs.len(),
        data_dir.display()
    );

    let input = load_tensor(&data_dir.join(&network.input.file))?;

    let mut layers = Vec::with_capacity(specs.len());
    let mut layer_references = Vec::with_capacity(specs.len());
    for (index, (settings, spec)) in network.layers.iter().zip(&specs).enumerate() {
        let weights = load_tensor(&data_dir.join(&settings.weights))?;
        let bias = load_tensor(&data_dir.join(&settings.bias))?;
        debug!(
            target: "layerdrive::pipeline",
            "{}: {} weights, {} biases",
            settings.name,
            weights.len(),
            bias.len()
        );
        layers.push(
            PipelineLayer::new(settings.name.as_str(), *spec, weights, bias)
                .map_err(|err| err.in_layer(index, &settings.name))?,
        );
        layer_references.push(load_reference(data_dir, settings.reference.as_deref())?);
    }

    let pipeline = LayerPipeline::new(layers)?;
    check_len(BufferRole::Input, pipeline.input_dims().len(), input.len())?;
    let final_reference = load_reference(data_dir, network.reference.as_deref())?;

    Ok(LoadedNetwork {
        name: network.name.clone(),
        pipeline,
        input,
        layer_references,
        final_reference,
    })
}

fn load_reference(data_dir: &Path, file: Option<&str>) -> Result<Option<Reference>, ConvError> {
    file.map(|file| {
        let path = data_dir.join(file);
        load_tensor(&path).map(|values| Reference { path, values })
    })
    .transpose()
}
