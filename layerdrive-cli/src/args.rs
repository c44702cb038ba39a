//! Command-line argument definitions for layerdrive.

use clap::{ArgAction, Parser, ValueEnum};
use layerdrive_utils::BackendPreference;
use std::path::PathBuf;

/// Run a hex-encoded convolution network layer by layer and check it against reference outputs.
#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct RunArgs {
    /// Optional settings JSON. Defaults to `config/layerdrive.json` when present, otherwise
    /// built-in parameters.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Named network layout (mnist, mnist_small, mnist_tiny). Replaces the configured network.
    #[arg(long)]
    pub preset: Option<String>,

    /// Directory holding the input, weight, bias and reference tensors.
    #[arg(long, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// Compute backend to run the layers on.
    #[arg(long, value_enum)]
    pub backend: Option<BackendArg>,

    /// Disable GPU initialization entirely.
    #[arg(long = "no-gpu", action = ArgAction::SetTrue, conflicts_with = "backend")]
    pub no_gpu: bool,

    /// Control whether `LAYERDRIVE_DISABLE_GPU` and `WGPU_*` env vars influence GPU setup.
    #[arg(long = "gpu-env", value_enum)]
    pub gpu_env: Option<GpuEnvMode>,

    /// Size of a dedicated CPU worker pool.
    #[arg(long)]
    pub threads: Option<usize>,

    /// Relative error threshold in percent (default 0.01).
    #[arg(long)]
    pub threshold: Option<f64>,

    /// Number of leading elements shown per comparison table.
    #[arg(long)]
    pub preview: Option<usize>,

    /// Write the run report to a JSON file.
    #[arg(long)]
    pub json: Option<PathBuf>,

    /// Write every layer output as a hex tensor file into this directory.
    #[arg(long, value_name = "DIR")]
    pub dump_dir: Option<PathBuf>,

    /// Exit with an error when any comparison fails.
    #[arg(long, action = ArgAction::SetTrue)]
    pub strict: bool,

    /// Enable telemetry timing logs (defaults to settings file).
    #[arg(long, action = ArgAction::SetTrue)]
    pub telemetry: bool,

    /// Override telemetry logging level (error, warn, info, debug, trace).
    #[arg(long, value_name = "LEVEL")]
    pub telemetry_level: Option<String>,

    /// Print the available network presets and exit.
    #[arg(long, action = ArgAction::SetTrue)]
    pub list_presets: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum BackendArg {
    /// GPU when one initializes, otherwise CPU.
    Auto,
    /// Require a GPU.
    Gpu,
    /// CPU only.
    Cpu,
}

impl From<BackendArg> for BackendPreference {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Auto => BackendPreference::Auto,
            BackendArg::Gpu => BackendPreference::Gpu,
            BackendArg::Cpu => BackendPreference::Cpu,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum GpuEnvMode {
    /// Respect environment overrides such as `WGPU_BACKEND`.
    Auto,
    /// Ignore environment overrides and rely solely on CLI/config.
    Ignore,
}

impl GpuEnvMode {
    pub fn respects_env(self) -> bool {
        matches!(self, GpuEnvMode::Auto)
    }
}
