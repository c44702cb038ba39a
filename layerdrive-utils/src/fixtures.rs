use anyhow::{Context, Result};
use std::{
    env, fs,
    path::{Path, PathBuf},
};

use crate::{config::HarnessSettings, hex::decode_tensor};

const FIXTURE_ENV: &str = "LAYERDRIVE_FIXTURE_ROOT";

/// Locate the `fixtures` directory.
///
/// `LAYERDRIVE_FIXTURE_ROOT` wins when set; otherwise the ancestors of this crate's manifest
/// directory are searched for a `fixtures` folder.
pub fn fixtures_dir() -> Result<PathBuf> {
    if let Ok(value) = env::var(FIXTURE_ENV) {
        return Ok(PathBuf::from(value));
    }

    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    manifest_dir
        .ancestors()
        .map(|ancestor| ancestor.join("fixtures"))
        .find(|candidate| candidate.is_dir())
        .with_context(|| {
            format!(
                "fixtures directory not found starting from {}",
                manifest_dir.display()
            )
        })
}

/// Full path of an existing file or directory under the fixtures root.
pub fn fixture_path<P: AsRef<Path>>(relative: P) -> Result<PathBuf> {
    let relative = relative.as_ref();
    let root = fixtures_dir()?;
    let full = root.join(relative);
    anyhow::ensure!(
        full.exists(),
        "fixture {} does not exist under {}",
        relative.display(),
        root.display()
    );
    Ok(full)
}

/// Decode a hex tensor fixture.
pub fn load_fixture_tensor<P: AsRef<Path>>(relative: P) -> Result<Vec<f32>> {
    let path = fixture_path(relative)?;
    let text = fs::read_to_string(&path)
        .with_context(|| format!("failed to read fixture {}", path.display()))?;
    decode_tensor(&text).with_context(|| format!("failed to decode fixture {}", path.display()))
}

/// Load a fixture harness config and point its data directory at the config's folder.
pub fn load_fixture_settings<P: AsRef<Path>>(relative: P) -> Result<HarnessSettings> {
    let path = fixture_path(relative)?;
    let mut settings = HarnessSettings::load_from_path(&path)?;
    if let Some(parent) = path.parent() {
        settings.data_dir = Some(parent.display().to_string());
    }
    Ok(settings)
}
