//! Shared plumbing for the layerdrive crates.

/// Harness configuration loading and persistence.
pub mod config;
/// Test fixture lookup.
pub mod fixtures;
/// `wgpu` context setup and device buffer pooling.
pub mod gpu;
/// Hex text encoding of `f32` tensors.
pub mod hex;
/// Optional timing instrumentation.
pub mod telemetry;

use std::path::{Path, PathBuf};

use anyhow::Result;
use log::LevelFilter;

pub use config::{BackendPreference, HarnessSettings, LayerSettings, NetworkSettings};
pub use fixtures::{fixture_path, fixtures_dir, load_fixture_settings, load_fixture_tensor};
pub use gpu::{GpuAvailability, GpuBufferPool, GpuContext, GpuContextOptions, GpuInitError};
pub use hex::{HexError, decode_tensor, decode_token, encode_tensor, encode_value};
pub use telemetry::{
    TELEMETRY_TARGET, TimingGuard, configure as configure_telemetry, telemetry_allows,
    telemetry_enabled, telemetry_level, timing_guard,
};

/// Install the `env_logger` backend once.
///
/// `RUST_LOG` takes precedence; otherwise `default_filter` applies. Telemetry records are always
/// let through the logger so [`telemetry::configure`] alone decides whether they appear.
pub fn init_logging(default_filter: LevelFilter) -> Result<()> {
    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_filter.as_str()),
    );
    builder.filter_module(TELEMETRY_TARGET, LevelFilter::Trace);
    // A second call (tests, embedding) keeps the first logger.
    let _ = builder.try_init();
    Ok(())
}

/// Check that `path` exists and return its canonical form.
pub fn normalize_path<P: AsRef<Path>>(path: P) -> Result<PathBuf> {
    let path = path.as_ref();
    anyhow::ensure!(path.exists(), "path does not exist: {}", path.display());
    Ok(path.canonicalize()?)
}
