use std::env;
use std::path::Path;

use anyhow::Result;
use env_logger::Builder;
use log::{LevelFilter, info};

use crate::config::Config;
use crate::report::{ParamReport, nanmean, nanstd};

mod config;
mod report;
mod simulation;

/// Batch experiment driver: sweep the configured node densities, run the
/// repetitions for each, aggregate, and persist one report per density.
fn main() -> Result<()> {
    // Logging setup
    Builder::new()
        .filter_level(LevelFilter::Info)
        .filter(Some("lora_mesh_sim"), LevelFilter::Info)
        .parse_default_env()
        .init();

    let config = match env::args().nth(1) {
        Some(path) => Config::load(Path::new(&path))?,
        None => {
            info!("no config file given, using built-in defaults");
            let config = Config::default();
            config.validate()?;
            config
        }
    };

    let sweep: Vec<usize> = if config.nodes.is_empty() {
        config.node_counts.clone()
    } else {
        vec![config.nodes.len()]
    };
    let out_dir = report::sweep_directory(&config.output_dir);
    info!("writing reports to {}", out_dir.display());

    for (index, &nr_nodes) in sweep.iter().enumerate() {
        info!(
            "start of {} out of {}, value {}",
            index + 1,
            sweep.len(),
            nr_nodes
        );
        let mut param_report = ParamReport::new(&config, nr_nodes, config.repetitions);
        for repetition in 0..config.repetitions {
            let stats = simulation::run_repetition(&config, nr_nodes, repetition as u64)?;
            param_report.record(&stats);
        }

        info!(
            "collision rate average: {:.2} (std {:.2})",
            nanmean(&param_report.collision_rate),
            nanstd(&param_report.collision_rate)
        );
        info!(
            "reachability average: {:.2} (std {:.2})",
            nanmean(&param_report.reachability),
            nanstd(&param_report.reachability)
        );
        info!(
            "usefulness average: {:.2} (std {:.2})",
            nanmean(&param_report.usefulness),
            nanstd(&param_report.usefulness)
        );
        info!(
            "delay average: {:.2} ms (std {:.2})",
            nanmean(&param_report.mean_delay_ms),
            nanstd(&param_report.mean_delay_ms)
        );
        info!(
            "tx air utilization average: {:.2} ms (std {:.2})",
            nanmean(&param_report.mean_tx_air_util_ms),
            nanstd(&param_report.mean_tx_air_util_ms)
        );

        let path = report::save_report(&out_dir, &param_report)?;
        info!("saved {}", path.display());
    }
    Ok(())
}
