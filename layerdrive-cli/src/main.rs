mod args;
mod config;
mod report;
mod runtime;

use anyhow::{Context, Result};
use clap::Parser;
use layerdrive_core::{ComparisonConfig, load_network, standard_presets};
use layerdrive_utils::init_logging;
use log::info;

use crate::{
    args::RunArgs,
    config::{apply_cli_overrides, load_settings},
    report::{RunReport, dump_layers, print_run, print_work_summary, write_json},
    runtime::{acquire_compute, init_telemetry},
};

fn main() -> Result<()> {
    init_logging(log::LevelFilter::Info)?;
    let args = RunArgs::parse();

    if args.list_presets {
        for preset in standard_presets() {
            println!("{:<12} {}", preset.name, preset.description);
        }
        return Ok(());
    }

    let mut loaded = load_settings(args.config.as_ref())?;
    apply_cli_overrides(&mut loaded.settings, &args)?;
    let settings = &loaded.settings;
    init_telemetry(settings);

    let data_dir = loaded.data_dir();
    let network = load_network(&settings.network, &data_dir).with_context(|| {
        format!(
            "failed to load network '{}' from {}",
            settings.network.name,
            data_dir.display()
        )
    })?;
    print_work_summary(&network.work_summary());

    let compute = acquire_compute(settings)?;
    let trace = compute
        .run_traced(&network.pipeline, &network.input)
        .with_context(|| format!("network '{}' failed", network.name))?;
    info!(
        "Ran {} layers ({} work items) in {:.2?}",
        trace.layers.len(),
        trace.total_work_items(),
        trace.elapsed
    );

    let comparison = ComparisonConfig::from(&settings.comparison);
    let report = RunReport::new(&network, compute.describe(), trace, &comparison);
    print_run(&report);

    if let Some(dir) = args.dump_dir.as_ref() {
        let written = dump_layers(dir, &report.layers)?;
        info!("Wrote {} layer dumps to {}", written.len(), dir.display());
    }
    if let Some(path) = args.json.as_ref() {
        write_json(path, &report)?;
    }

    if args.strict && !report.passed {
        anyhow::bail!(
            "{} of {} comparisons exceeded {}%",
            report.failed_comparisons(),
            report.comparisons.len(),
            comparison.threshold_pct
        );
    }
    Ok(())
}
