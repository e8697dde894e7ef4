//! Run settings
//!
//! Everything the orchestrator needs to build a world and a scheduler.
//! Values are validated here, before any core object is constructed.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sim::FlockParams;

/// How ticks are executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Whole tick on the orchestrator thread
    Seq,
    /// Persistent worker pool
    #[default]
    Pool,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Seq => "seq",
            RunMode::Pool => "pool",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "seq" | "sequential" => Ok(RunMode::Seq),
            "pool" | "threads" | "pthread" => Ok(RunMode::Pool),
            _ => Err(ConfigError::UnknownMode(s.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("world must be larger than 10x10, got {width}x{height}")]
    WorldTooSmall { width: u32, height: u32 },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("{field} must be a finite non-negative number, got {value}")]
    Invalid { field: &'static str, value: f64 },
    #[error("{lower} weight ({lower_value}) must be below {higher} weight ({higher_value})")]
    WeightOrder {
        lower: &'static str,
        lower_value: f32,
        higher: &'static str,
        higher_value: f32,
    },
    #[error("separation radius {separation} must not exceed neighbor radius {neighbor}")]
    Radii { separation: f32, neighbor: f32 },
    #[error("unknown run mode '{0}' (expected seq or pool)")]
    UnknownMode(String),
    #[error("failed to read config file {}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed config file {}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Simulation run settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    // === World ===
    pub width: u32,
    pub height: u32,
    pub agent_count: usize,
    /// Seed for initial agent placement
    pub seed: u64,

    // === Scheduling ===
    pub mode: RunMode,
    pub thread_count: usize,
    /// Mark detached agents in a first phase, then flock
    pub two_phase: bool,

    // === Timing ===
    pub steps_per_second: u32,
    /// Wall-clock run length; 0 runs until `max_ticks` (or forever)
    pub run_seconds: f64,
    pub max_ticks: Option<u64>,
    /// Pace ticks against the wall clock; off runs them back to back
    pub realtime: bool,
    /// Seconds between progress log lines
    pub report_interval: f64,

    pub flock: FlockParams,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            width: 80,
            height: 25,
            agent_count: 200,
            seed: 0x5eed,

            mode: RunMode::Pool,
            thread_count: 4,
            two_phase: false,

            steps_per_second: 30,
            run_seconds: 10.0,
            max_ticks: None,
            realtime: true,
            report_interval: 1.0,

            flock: FlockParams::default(),
        }
    }
}

impl Settings {
    /// Fixed timestep (seconds)
    pub fn tick_dt(&self) -> f64 {
        1.0 / self.steps_per_second as f64
    }

    /// Read settings from a JSON file; missing fields take defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let settings = serde_json::from_str(&json).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        log::info!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    /// Reject values the core must never be built with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.width <= 10 || self.height <= 10 {
            return Err(ConfigError::WorldTooSmall {
                width: self.width,
                height: self.height,
            });
        }
        if self.agent_count == 0 {
            return Err(ConfigError::Zero("agent count"));
        }
        if self.thread_count == 0 {
            return Err(ConfigError::Zero("thread count"));
        }
        if self.steps_per_second == 0 {
            return Err(ConfigError::Zero("steps per second"));
        }
        if self.max_ticks == Some(0) {
            return Err(ConfigError::Zero("max ticks"));
        }
        non_negative("run seconds", self.run_seconds)?;
        non_negative("report interval", self.report_interval)?;
        self.validate_flock()
    }

    fn validate_flock(&self) -> Result<(), ConfigError> {
        let f = &self.flock;
        for (field, value) in [
            ("neighbor radius", f.neighbor_radius),
            ("separation radius", f.separation_radius),
            ("max speed", f.max_speed),
            ("max force", f.max_force),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::Invalid {
                    field,
                    value: value as f64,
                });
            }
        }
        if f.separation_radius > f.neighbor_radius {
            return Err(ConfigError::Radii {
                separation: f.separation_radius,
                neighbor: f.neighbor_radius,
            });
        }
        for (field, value) in [
            ("player avoid radius", f.player_avoid_radius),
            ("wall margin", f.wall_margin),
            ("detach spread factor", f.detach_spread_factor),
            ("min detach radius", f.min_detach_radius),
            ("regroup weight", f.regroup_weight),
        ] {
            non_negative(field, value as f64)?;
        }
        if !(0.0..=1.0).contains(&f.bounce_damping) {
            return Err(ConfigError::Invalid {
                field: "bounce damping",
                value: f.bounce_damping as f64,
            });
        }

        let weights = f.weights();
        for (field, value) in weights {
            non_negative(field, value as f64)?;
        }
        for pair in weights.windows(2) {
            let ((lower, lower_value), (higher, higher_value)) = (pair[0], pair[1]);
            if lower_value >= higher_value {
                return Err(ConfigError::WeightOrder {
                    lower,
                    lower_value,
                    higher,
                    higher_value,
                });
            }
        }
        Ok(())
    }
}

fn non_negative(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::Invalid { field, value })
    }
}
