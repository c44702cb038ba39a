//! Harness configuration shared by the CLI and tests.
//!
//! Everything here serializes to JSON. Each section carries `#[serde(default)]` so a config file
//! only needs the keys it wants to change.

use crate::gpu::GpuContextOptions;

use anyhow::{Context, Result};
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::{
    env, fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
};

/// Shape and source file of the network input tensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputSettings {
    pub channels: u32,
    pub height: u32,
    pub width: u32,
    /// Hex tensor file, relative to the data directory.
    pub file: String,
}

impl Default for InputSettings {
    fn default() -> Self {
        Self {
            channels: 1,
            height: 28,
            width: 28,
            file: "test_input.txt".to_string(),
        }
    }
}

/// One convolution layer of the network description.
///
/// Input shape is not stored; it is inherited from the previous layer (or the network input).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerSettings {
    pub name: String,
    pub out_channels: u32,
    /// Kernel extent as `[height, width]`.
    pub kernel: [u32; 2],
    /// Stride as `[vertical, horizontal]`.
    pub stride: [u32; 2],
    /// Apply ReLU to the layer output.
    pub relu: bool,
    pub weights: String,
    pub bias: String,
    /// Optional expected output of this layer.
    pub reference: Option<String>,
}

impl Default for LayerSettings {
    fn default() -> Self {
        Self {
            name: "conv".to_string(),
            out_channels: 1,
            kernel: [1, 1],
            stride: [1, 1],
            relu: false,
            weights: "conv_weight.txt".to_string(),
            bias: "conv_bias.txt".to_string(),
            reference: None,
        }
    }
}

impl LayerSettings {
    /// Layer named `name` reading `<name>_weight.txt` / `<name>_bias.txt`.
    pub fn conv(name: &str, out_channels: u32, kernel: [u32; 2], stride: [u32; 2], relu: bool) -> Self {
        Self {
            name: name.to_string(),
            out_channels,
            kernel,
            stride,
            relu,
            weights: format!("{name}_weight.txt"),
            bias: format!("{name}_bias.txt"),
            reference: None,
        }
    }

    /// Attach `<name>_out.txt` as the expected output of this layer.
    pub fn with_layer_reference(mut self) -> Self {
        self.reference = Some(format!("{}_out.txt", self.name));
        self
    }
}

/// Full network description: input tensor, ordered layers and the final reference output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    pub name: String,
    pub input: InputSettings,
    pub layers: Vec<LayerSettings>,
    /// Expected output of the last layer.
    pub reference: Option<String>,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            name: "mnist".to_string(),
            input: InputSettings::default(),
            layers: vec![
                LayerSettings::conv("conv1", 16, [5, 5], [1, 1], true),
                LayerSettings::conv("conv2", 32, [5, 5], [1, 1], true),
                LayerSettings::conv("conv3", 10, [20, 20], [1, 1], false),
            ],
            reference: Some("test_output.txt".to_string()),
        }
    }
}

/// Reference comparison policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComparisonSettings {
    /// Relative error, in percent, above which an element counts as a mismatch.
    pub threshold_pct: f64,
    /// Number of leading elements printed in the comparison table.
    pub preview_rows: usize,
}

impl Default for ComparisonSettings {
    fn default() -> Self {
        Self {
            threshold_pct: 0.01,
            preview_rows: 10,
        }
    }
}

/// Which compute backend runs the convolutions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendPreference {
    /// Use the GPU when one initializes, otherwise the CPU.
    #[default]
    Auto,
    /// Require a GPU.
    Gpu,
    /// Always run on the CPU.
    Cpu,
}

impl fmt::Display for BackendPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendPreference::Auto => "auto",
            BackendPreference::Gpu => "gpu",
            BackendPreference::Cpu => "cpu",
        })
    }
}

impl FromStr for BackendPreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "gpu" | "wgpu" => Ok(Self::Gpu),
            "cpu" => Ok(Self::Cpu),
            other => Err(format!("unknown backend '{other}' (expected auto, gpu or cpu)")),
        }
    }
}

/// Compute backend preferences.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputeSettings {
    pub backend: BackendPreference,
    /// Size of a dedicated CPU thread pool; `None` uses the global rayon pool.
    pub cpu_threads: Option<usize>,
    /// Ceiling for pooled device buffers, in MiB.
    pub max_device_memory_mb: Option<u64>,
}

impl ComputeSettings {
    /// Device memory ceiling in bytes.
    pub fn max_device_memory_bytes(&self) -> Option<u64> {
        self.max_device_memory_mb
            .map(|mb| mb.saturating_mul(1024 * 1024))
    }
}

/// GPU initialization preferences.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuSettings {
    /// Whether a GPU may be initialized at all.
    pub enabled: bool,
    /// Honour `WGPU_*` and `LAYERDRIVE_*_GPU` environment overrides.
    pub respect_env: bool,
}

impl Default for GpuSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            respect_env: true,
        }
    }
}

impl From<&GpuSettings> for GpuContextOptions {
    fn from(settings: &GpuSettings) -> Self {
        GpuContextOptions {
            enabled: settings.enabled,
            respect_env: settings.respect_env,
            ..Default::default()
        }
    }
}

/// Timing telemetry preferences.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    pub enabled: bool,
    /// One of off, error, warn, info, debug, trace.
    pub level: String,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            level: "debug".to_string(),
        }
    }
}

impl TelemetrySettings {
    /// Parse `level`, defaulting to `Debug` for unknown strings.
    pub fn level_filter(&self) -> LevelFilter {
        self.level.trim().parse().unwrap_or(LevelFilter::Debug)
    }
}

/// Top-level harness settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessSettings {
    /// Directory holding the hex tensor files. Relative paths resolve against the working
    /// directory.
    pub data_dir: Option<String>,
    pub network: NetworkSettings,
    pub comparison: ComparisonSettings,
    pub compute: ComputeSettings,
    pub gpu: GpuSettings,
    pub telemetry: TelemetrySettings,
}

impl Default for HarnessSettings {
    fn default() -> Self {
        Self {
            data_dir: Some("data_gen".to_string()),
            network: NetworkSettings::default(),
            comparison: ComparisonSettings::default(),
            compute: ComputeSettings::default(),
            gpu: GpuSettings::default(),
            telemetry: TelemetrySettings::default(),
        }
    }
}

impl HarnessSettings {
    /// Read settings from a JSON file.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse settings JSON at {}", path.display()))
    }

    /// Write settings as pretty-printed JSON, replacing any existing file.
    pub fn save_to_path<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let payload =
            serde_json::to_string_pretty(self).context("failed to serialize settings JSON")?;
        fs::write(path, payload)
            .with_context(|| format!("failed to write settings file {}", path.display()))
    }

    /// Data directory resolved against `base` when relative.
    pub fn resolve_data_dir(&self, base: &Path) -> PathBuf {
        match self.data_dir.as_deref() {
            Some(dir) if Path::new(dir).is_absolute() => PathBuf::from(dir),
            Some(dir) => base.join(dir),
            None => base.to_path_buf(),
        }
    }
}

/// Default location of the settings file (`config/layerdrive.json` in the working directory).
pub fn default_settings_path() -> PathBuf {
    env::current_dir()
        .map(|dir| dir.join("config/layerdrive.json"))
        .unwrap_or_else(|_| PathBuf::from("config/layerdrive.json"))
}
