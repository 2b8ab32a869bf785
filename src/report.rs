//! Per-run metrics, NaN-safe aggregation across repetitions, and JSON
//! result persistence.
//!
//! A repetition with nothing to measure (no sensed packets, no messages)
//! yields NaN for the affected metric; NaN entries are excluded from the
//! aggregate mean/deviation and serialize to `null` in the report files.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use serde::Serialize;

use crate::config::Config;
use crate::simulation::types::RunStats;

/// Headline metrics of one repetition, all in percent or milliseconds.
pub(crate) struct RunMetrics {
    pub(crate) collision_rate: f64,
    pub(crate) reachability: f64,
    pub(crate) usefulness: f64,
    pub(crate) mean_delay_ms: f64,
    pub(crate) mean_tx_air_ms: f64,
}

pub(crate) fn run_metrics(stats: &RunStats) -> RunMetrics {
    let collision_rate = if stats.nr_sensed > 0 {
        stats.nr_collisions as f64 / stats.nr_sensed as f64 * 100.0
    } else {
        f64::NAN
    };
    // Every message could at best be delivered to every other node once.
    let reachability = if stats.nr_messages > 0 && stats.nr_nodes > 1 {
        stats.nr_useful as f64 / (stats.nr_messages as f64 * (stats.nr_nodes - 1) as f64) * 100.0
    } else {
        f64::NAN
    };
    // Share of received packets that delivered a message to a new node.
    let usefulness = if stats.nr_received > 0 {
        stats.nr_useful as f64 / stats.nr_received as f64 * 100.0
    } else {
        f64::NAN
    };
    let mean_delay_ms = nanmean(&stats.delays_ms);
    let mean_tx_air_ms = if stats.nr_nodes > 0 {
        stats.tx_air_ms_per_node.iter().sum::<f64>() / stats.nr_nodes as f64
    } else {
        f64::NAN
    };
    RunMetrics {
        collision_rate,
        reachability,
        usefulness,
        mean_delay_ms,
        mean_tx_air_ms,
    }
}

/// Mean over the non-NaN entries; NaN when none remain.
pub(crate) fn nanmean(values: &[f64]) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for &value in values {
        if !value.is_nan() {
            sum += value;
            count += 1;
        }
    }
    if count == 0 { f64::NAN } else { sum / count as f64 }
}

/// Population standard deviation over the non-NaN entries.
pub(crate) fn nanstd(values: &[f64]) -> f64 {
    let mean = nanmean(values);
    if mean.is_nan() {
        return f64::NAN;
    }
    let mut sum = 0.0;
    let mut count = 0usize;
    for &value in values {
        if !value.is_nan() {
            sum += (value - mean) * (value - mean);
            count += 1;
        }
    }
    (sum / count as f64).sqrt()
}

/// Everything persisted for one swept parameter value: the per-repetition
/// metric vectors plus an echo of the configuration that produced them.
#[derive(Serialize)]
pub(crate) struct ParamReport {
    pub(crate) nr_nodes: usize,
    pub(crate) collision_rate: Vec<f64>,
    pub(crate) reachability: Vec<f64>,
    pub(crate) usefulness: Vec<f64>,
    pub(crate) mean_delay_ms: Vec<f64>,
    pub(crate) mean_tx_air_util_ms: Vec<f64>,
    pub(crate) nr_messages: Vec<u32>,
    pub(crate) interference_level: f64,
    pub(crate) collision_due_to_interference: bool,
    pub(crate) area_width_m: f32,
    pub(crate) area_height_m: f32,
    pub(crate) min_distance_m: f32,
    pub(crate) sim_time_ms: u64,
    pub(crate) period_ms: f64,
    pub(crate) packet_length: usize,
}

impl ParamReport {
    pub(crate) fn new(config: &Config, nr_nodes: usize, repetitions: usize) -> Self {
        ParamReport {
            nr_nodes,
            collision_rate: Vec::with_capacity(repetitions),
            reachability: Vec::with_capacity(repetitions),
            usefulness: Vec::with_capacity(repetitions),
            mean_delay_ms: Vec::with_capacity(repetitions),
            mean_tx_air_util_ms: Vec::with_capacity(repetitions),
            nr_messages: Vec::with_capacity(repetitions),
            interference_level: config.interference_level,
            collision_due_to_interference: config.collision_due_to_interference,
            area_width_m: config.area_width_m,
            area_height_m: config.area_height_m,
            min_distance_m: config.min_distance_m,
            sim_time_ms: config.sim_time_ms,
            period_ms: config.period_ms,
            packet_length: config.packet_length,
        }
    }

    pub(crate) fn record(&mut self, stats: &RunStats) {
        let metrics = run_metrics(stats);
        self.collision_rate.push(metrics.collision_rate);
        self.reachability.push(metrics.reachability);
        self.usefulness.push(metrics.usefulness);
        self.mean_delay_ms.push(metrics.mean_delay_ms);
        self.mean_tx_air_util_ms.push(metrics.mean_tx_air_ms);
        self.nr_messages.push(stats.nr_messages);
    }
}

/// Timestamped directory under the configured output root, one per sweep.
pub(crate) fn sweep_directory(base: &str) -> PathBuf {
    Path::new(base).join(format!("sweep-{}", Local::now().format("%Y%m%d-%H%M%S")))
}

/// Write one parameter value's report as pretty JSON, creating the sweep
/// directory on first use.
pub(crate) fn save_report(dir: &Path, report: &ParamReport) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create output directory {}", dir.display()))?;
    let path = dir.join(format!("report_{:03}nodes.json", report.nr_nodes));
    let json = serde_json::to_string_pretty(report).context("failed to serialize report")?;
    fs::write(&path, json).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}
