//! Batch configuration: TOML loading, defaults, and fail-fast validation.

use std::path::Path;

use anyhow::{Context, Result, bail, ensure};
use serde::Deserialize;

use crate::simulation::signal_calculations::{LoraParameters, PathLossParameters};

/// Full experiment configuration. Every field has a default, so a config
/// file only needs to name what it changes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub(crate) struct Config {
    /// Node densities to sweep, one batch of repetitions each.
    pub(crate) node_counts: Vec<usize>,
    /// Independent repetitions per density; repetition index seeds the RNG.
    pub(crate) repetitions: usize,
    /// Virtual-clock horizon of one repetition.
    pub(crate) sim_time_ms: u64,
    /// Mean message inter-arrival time per node.
    pub(crate) period_ms: f64,
    /// Application payload size of generated messages, in bytes.
    pub(crate) packet_length: usize,
    /// Payload size of explicit ACK packets, in bytes.
    pub(crate) ack_length: usize,
    pub(crate) hop_limit: u32,
    pub(crate) max_retransmission: u32,
    /// Unicast mode sends each message to a random other node; otherwise
    /// everything is broadcast.
    pub(crate) unicast: bool,
    /// Default router role for every node (shorter backoff window).
    pub(crate) router: bool,
    pub(crate) area_width_m: f32,
    pub(crate) area_height_m: f32,
    pub(crate) min_distance_m: f32,
    pub(crate) antenna_height_m: f32,
    pub(crate) antenna_gain_dbi: f32,
    pub(crate) tx_power_dbm: f32,
    /// Probability that the channel is sensed busy from external
    /// interference.
    pub(crate) interference_level: f64,
    /// Whether external interference can also destroy receptions.
    pub(crate) collision_due_to_interference: bool,
    pub(crate) output_dir: String,
    pub(crate) lora: LoraParameters,
    pub(crate) path_loss: PathLossParameters,
    /// Explicit node layout. When non-empty it replaces random placement
    /// and the density sweep runs at exactly this set.
    pub(crate) nodes: Vec<NodeSpec>,
}

/// One explicitly placed node. Unset fields inherit the global defaults.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct NodeSpec {
    pub(crate) x: f32,
    pub(crate) y: f32,
    #[serde(default)]
    pub(crate) z: Option<f32>,
    #[serde(default)]
    pub(crate) is_router: Option<bool>,
    #[serde(default)]
    pub(crate) is_repeater: Option<bool>,
    #[serde(default)]
    pub(crate) hop_limit: Option<u32>,
    #[serde(default)]
    pub(crate) antenna_gain_dbi: Option<f32>,
    #[serde(default)]
    pub(crate) tx_power_dbm: Option<f32>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            node_counts: vec![3, 4, 5, 6, 7, 8, 9, 10, 12, 15, 20, 25],
            repetitions: 100,
            sim_time_ms: 3_600_000,
            period_ms: 100_000.0,
            packet_length: 40,
            ack_length: 12,
            hop_limit: 3,
            max_retransmission: 3,
            unicast: false,
            router: false,
            area_width_m: 4_000.0,
            area_height_m: 4_000.0,
            min_distance_m: 50.0,
            antenna_height_m: 2.0,
            antenna_gain_dbi: 0.0,
            tx_power_dbm: 14.0,
            interference_level: 0.0,
            collision_due_to_interference: false,
            output_dir: "results".to_owned(),
            lora: LoraParameters::default(),
            path_loss: PathLossParameters::default(),
            nodes: Vec::new(),
        }
    }
}

impl Config {
    pub(crate) fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject infeasible configurations before any run starts.
    pub(crate) fn validate(&self) -> Result<()> {
        ensure!(self.repetitions >= 1, "repetitions must be at least 1");
        ensure!(self.sim_time_ms > 0, "sim_time_ms must be positive");
        ensure!(
            self.period_ms > 0.0 && self.period_ms.is_finite(),
            "period_ms must be positive"
        );
        ensure!(self.packet_length > 0, "packet_length must be positive");
        ensure!(self.ack_length > 0, "ack_length must be positive");
        ensure!(
            self.area_width_m > 0.0 && self.area_height_m > 0.0,
            "simulation area must have positive extent"
        );
        ensure!(self.min_distance_m >= 0.0, "min_distance_m must not be negative");
        ensure!(
            (0.0..1.0).contains(&self.interference_level),
            "interference_level must be in [0, 1)"
        );
        ensure!(
            (5..=12).contains(&self.lora.spreading_factor),
            "spreading_factor must be between 5 and 12"
        );
        ensure!(self.lora.bandwidth > 0, "bandwidth must be positive");
        ensure!(
            (1..=4).contains(&self.lora.coding_rate),
            "coding_rate must be between 1 (4/5) and 4 (4/8)"
        );
        ensure!(
            self.path_loss.path_loss_exponent > 0.0,
            "path_loss_exponent must be positive"
        );
        ensure!(
            self.path_loss.shadowing_sigma >= 0.0,
            "shadowing_sigma must not be negative"
        );

        if self.nodes.is_empty() {
            ensure!(
                !self.node_counts.is_empty(),
                "node_counts must not be empty without an explicit node list"
            );
            for &count in &self.node_counts {
                let minimum = if self.unicast { 2 } else { 1 };
                ensure!(
                    count >= minimum,
                    "node count {count} is too small (unicast needs a destination)"
                );
                // Disc-packing bound: nodes spaced min_distance apart own
                // disjoint discs of radius min_distance/2 inside a slightly
                // grown area. More nodes than fit can never be placed.
                let disc = std::f32::consts::PI * (self.min_distance_m / 2.0).powi(2);
                let capacity = (self.area_width_m + self.min_distance_m)
                    * (self.area_height_m + self.min_distance_m);
                if disc * count as f32 > capacity {
                    bail!(
                        "node count {count} cannot fit a {} m x {} m area at {} m spacing",
                        self.area_width_m,
                        self.area_height_m,
                        self.min_distance_m
                    );
                }
            }
        } else if self.unicast {
            ensure!(
                self.nodes.len() >= 2,
                "unicast mode needs at least two explicitly placed nodes"
            );
        }
        Ok(())
    }
}
