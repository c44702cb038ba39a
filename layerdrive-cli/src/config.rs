//! Configuration loading and CLI override logic.

use std::{
    env,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use layerdrive_core::preset_by_name;
use layerdrive_utils::{
    BackendPreference, HarnessSettings, config::default_settings_path, normalize_path,
};
use log::info;

use crate::args::RunArgs;

/// Settings plus the directory relative data paths resolve against.
#[derive(Debug)]
pub struct LoadedSettings {
    pub settings: HarnessSettings,
    pub base_dir: PathBuf,
}

impl LoadedSettings {
    pub fn data_dir(&self) -> PathBuf {
        self.settings.resolve_data_dir(&self.base_dir)
    }
}

/// Load settings from a file, the default location, or built-in defaults.
///
/// Relative data directories in an explicit `--config` file resolve against that file's folder;
/// everything else resolves against the working directory.
pub fn load_settings(config_path: Option<&PathBuf>) -> Result<LoadedSettings> {
    let cwd = env::current_dir().context("failed to read the working directory")?;
    if let Some(path) = config_path {
        let resolved = normalize_path(path)?;
        let settings = HarnessSettings::load_from_path(&resolved)?;
        info!("Loaded settings from {}", resolved.display());
        Ok(LoadedSettings {
            settings,
            base_dir: parent_or(&resolved, cwd),
        })
    } else {
        let default_path = default_settings_path();
        if default_path.exists() {
            let settings = HarnessSettings::load_from_path(&default_path).with_context(|| {
                format!(
                    "failed to load default settings from {}",
                    default_path.display()
                )
            })?;
            info!("Loaded settings from {}", default_path.display());
            Ok(LoadedSettings {
                settings,
                base_dir: cwd,
            })
        } else {
            Ok(LoadedSettings {
                settings: HarnessSettings::default(),
                base_dir: cwd,
            })
        }
    }
}

fn parent_or(path: &Path, fallback: PathBuf) -> PathBuf {
    path.parent()
        .map(Path::to_path_buf)
        .unwrap_or(fallback)
}

/// Apply command-line arguments on top of loaded or default settings.
pub fn apply_cli_overrides(settings: &mut HarnessSettings, args: &RunArgs) -> Result<()> {
    if let Some(name) = args.preset.as_ref() {
        let preset = preset_by_name(name).with_context(|| {
            format!("unknown preset '{name}' (run with --list-presets to see the options)")
        })?;
        settings.network = preset.network();
    }
    if let Some(dir) = args.data_dir.as_ref() {
        let dir = if dir.is_absolute() {
            dir.clone()
        } else {
            env::current_dir()
                .context("failed to read the working directory")?
                .join(dir)
        };
        settings.data_dir = Some(dir.display().to_string());
    }

    if let Some(backend) = args.backend {
        settings.compute.backend = backend.into();
    }
    if args.no_gpu {
        settings.gpu.enabled = false;
        settings.compute.backend = BackendPreference::Cpu;
    }
    if let Some(mode) = args.gpu_env {
        settings.gpu.respect_env = mode.respects_env();
    }
    if let Some(threads) = args.threads {
        settings.compute.cpu_threads = Some(threads.max(1));
    }

    if let Some(threshold) = args.threshold {
        anyhow::ensure!(
            threshold.is_finite() && threshold >= 0.0,
            "--threshold must be a non-negative percentage, got {threshold}"
        );
        settings.comparison.threshold_pct = threshold;
    }
    if let Some(rows) = args.preview {
        settings.comparison.preview_rows = rows;
    }

    if args.telemetry {
        settings.telemetry.enabled = true;
    }
    if let Some(level) = args.telemetry_level.as_ref() {
        let normalized = level.trim();
        if !normalized.is_empty() {
            let lower = normalized.to_ascii_lowercase();
            settings.telemetry.level = lower.clone();
            if lower == "off" {
                settings.telemetry.enabled = false;
            }
        }
    }
    Ok(())
}
