//! Console, JSON and hex dump output of a run.

use std::{
    fs::{self, File},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use layerdrive_core::{
    ComparisonConfig, ComparisonReport, LayerTrace, LoadedNetwork, PipelineTrace, WorkSummary,
    compare,
};
use layerdrive_utils::encode_tensor;
use log::{info, warn};
use serde::Serialize;

/// Everything a run produced, in the shape written by `--json`.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub version: &'static str,
    pub network: String,
    pub backend: &'static str,
    pub device: String,
    pub work: WorkSummary,
    pub layers: Vec<LayerTrace>,
    pub comparisons: Vec<ComparisonReport>,
    pub passed: bool,
}

impl RunReport {
    pub fn new(
        network: &LoadedNetwork,
        device: String,
        trace: PipelineTrace,
        config: &ComparisonConfig,
    ) -> Self {
        let comparisons = compare_with_references(network, &trace, config);
        let passed = comparisons.iter().all(ComparisonReport::passed);
        Self {
            version: layerdrive_core::version(),
            network: network.name.clone(),
            backend: trace.backend,
            device,
            work: network.work_summary(),
            layers: trace.layers,
            comparisons,
            passed,
        }
    }

    pub fn failed_comparisons(&self) -> usize {
        self.comparisons
            .iter()
            .filter(|report| !report.passed())
            .count()
    }
}

/// Compare every layer that has a reference, then the final output.
pub fn compare_with_references(
    network: &LoadedNetwork,
    trace: &PipelineTrace,
    config: &ComparisonConfig,
) -> Vec<ComparisonReport> {
    let mut reports: Vec<ComparisonReport> = trace
        .layers
        .iter()
        .zip(&network.layer_references)
        .filter_map(|(layer, reference)| {
            reference
                .as_ref()
                .map(|reference| compare(&layer.label, &layer.output, &reference.values, config))
        })
        .collect();
    if let Some(reference) = network.final_reference.as_ref() {
        reports.push(compare("output", trace.output(), &reference.values, config));
    }
    if reports.is_empty() {
        warn!("Network '{}' has no reference tensors; nothing to compare", network.name);
    }
    reports
}

pub fn print_work_summary(summary: &WorkSummary) {
    println!("Work items per layer:");
    for layer in &summary.layers {
        println!(
            "  {:<12} {:>12}  -> {}",
            layer.label, layer.work_items, layer.output
        );
    }
    println!("  {:<12} {:>12}", "total", summary.total);
}

pub fn print_run(report: &RunReport) {
    for layer in &report.layers {
        println!(
            "{} [{}] finished in {:.2?}",
            layer.label, layer.spec, layer.elapsed
        );
    }
    for comparison in &report.comparisons {
        println!();
        println!("{comparison}");
    }
    println!();
    println!(
        "{}: {} of {} comparisons passed on {}",
        if report.passed { "PASS" } else { "FAIL" },
        report.comparisons.len() - report.failed_comparisons(),
        report.comparisons.len(),
        report.device
    );
}

pub fn write_json(path: &Path, report: &RunReport) -> Result<()> {
    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create directory {}", dir.display()))?;
    }
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    serde_json::to_writer_pretty(file, report)
        .with_context(|| format!("failed to write run report to {}", path.display()))?;
    info!("Wrote run report to {}", path.display());
    Ok(())
}

/// Write `<label>_out.txt` for every layer.
pub fn dump_layers(dir: &Path, layers: &[LayerTrace]) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create dump directory {}", dir.display()))?;
    layers
        .iter()
        .map(|layer| {
            let path = dir.join(format!("{}_out.txt", layer.label));
            fs::write(&path, encode_tensor(&layer.output))
                .with_context(|| format!("failed to write {}", path.display()))?;
            Ok(path)
        })
        .collect()
}
