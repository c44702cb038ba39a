//! Named network layouts.
//!
//! Each preset expands into a full [`NetworkSettings`] reading the conventional file names
//! (`test_input.txt`, `<layer>_weight.txt`, `<layer>_bias.txt`, ...) from the data directory.

use layerdrive_utils::{LayerSettings, NetworkSettings, config::InputSettings};

/// A named network layout.
#[derive(Debug, Clone, Copy)]
pub struct NetworkPreset {
    /// Name used for CLI selection.
    pub name: &'static str,
    /// Short description for listings.
    pub description: &'static str,
    build: fn() -> NetworkSettings,
}

impl NetworkPreset {
    const fn new(
        name: &'static str,
        description: &'static str,
        build: fn() -> NetworkSettings,
    ) -> Self {
        Self {
            name,
            description,
            build,
        }
    }

    /// Expand into a network description.
    pub fn network(&self) -> NetworkSettings {
        (self.build)()
    }
}

static PRESETS: [NetworkPreset; 3] = [
    NetworkPreset::new(
        "mnist",
        "1x28x28 -> 16@5x5 relu -> 32@5x5 relu -> 10@20x20, final output reference",
        mnist,
    ),
    NetworkPreset::new(
        "mnist_small",
        "1x28x28 -> 2@5x5 relu -> 1@5x5 stride 5 relu -> 10@4x4, per-layer references",
        mnist_small,
    ),
    NetworkPreset::new(
        "mnist_tiny",
        "1x28x28 -> 1@5x5 stride 5 relu -> 1@2x2 relu -> 10@4x4, per-layer references",
        mnist_tiny,
    ),
];

pub fn standard_presets() -> &'static [NetworkPreset] {
    &PRESETS
}

/// Find a preset by name, ignoring case and punctuation.
pub fn preset_by_name(name: &str) -> Option<NetworkPreset> {
    let lookup_key = normalize_name(name);
    standard_presets()
        .iter()
        .find(|preset| normalize_name(preset.name) == lookup_key)
        .copied()
}

fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

fn mnist() -> NetworkSettings {
    NetworkSettings::default()
}

fn mnist_small() -> NetworkSettings {
    NetworkSettings {
        name: "mnist_small".to_string(),
        input: InputSettings::default(),
        layers: vec![
            LayerSettings::conv("conv1", 2, [5, 5], [1, 1], true).with_layer_reference(),
            LayerSettings::conv("conv2", 1, [5, 5], [5, 5], true).with_layer_reference(),
            LayerSettings::conv("conv3", 10, [4, 4], [1, 1], false).with_layer_reference(),
        ],
        reference: None,
    }
}

fn mnist_tiny() -> NetworkSettings {
    NetworkSettings {
        name: "mnist_tiny".to_string(),
        input: InputSettings::default(),
        layers: vec![
            LayerSettings::conv("conv1", 1, [5, 5], [5, 5], true).with_layer_reference(),
            LayerSettings::conv("conv2", 1, [2, 2], [1, 1], true).with_layer_reference(),
            LayerSettings::conv("conv3", 10, [4, 4], [1, 1], false).with_layer_reference(),
        ],
        reference: None,
    }
}
