//! Telemetry setup and compute backend acquisition for the CLI.

use anyhow::{Context, Result};
use layerdrive_core::{ComputeContext, ComputeOptions};
use layerdrive_utils::{BackendPreference, HarnessSettings, configure_telemetry};
use log::{debug, info};

/// Apply the telemetry section of `settings` to the global timing switch.
pub fn init_telemetry(settings: &HarnessSettings) {
    let level = settings.telemetry.level_filter();
    configure_telemetry(settings.telemetry.enabled, level);
    if settings.telemetry.enabled {
        debug!("Telemetry enabled at {level}");
    }
}

/// Initialize the backend the settings ask for and log what was selected.
pub fn acquire_compute(settings: &HarnessSettings) -> Result<ComputeContext> {
    let options = ComputeOptions::from(settings);
    let requested = options.backend;
    let context = ComputeContext::acquire(&options)
        .with_context(|| format!("failed to initialize the '{requested}' compute backend"))?;

    if requested == BackendPreference::Auto && !context.is_gpu() {
        info!("Running on CPU (no usable GPU)");
    }
    info!("Compute backend: {}", context.describe());
    Ok(context)
}
