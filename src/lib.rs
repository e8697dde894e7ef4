//! Flock Pool - boids flocking on a persistent worker pool
//!
//! Core modules:
//! - `sim`: World state, double buffer and the per-agent flocking kernel
//! - `pool`: Persistent worker threads, partitioning and the phase barrier
//! - `settings`: Run configuration and validation
//! - `runner`: Fixed-timestep orchestrator driving the core

pub mod pool;
pub mod runner;
pub mod settings;
pub mod sim;

pub use pool::{PartitionJob, PoolError, WorkerPool};
pub use settings::{ConfigError, RunMode, Settings};
pub use sim::{Agent, FlockParams, InputState, Player, World, WorldError};

use glam::Vec2;

/// Simulation constants
pub mod consts {
    /// Vectors shorter than this normalize to zero
    pub const NORMALIZE_EPSILON: f32 = 1e-6;
    /// Squared distance below which two points count as coincident
    pub const COINCIDENT_DIST_SQ: f32 = 1e-6;

    /// Default player movement speed (units/s)
    pub const PLAYER_SPEED: f32 = 25.0;

    /// Initial agent speed and its +/- jitter
    pub const SPAWN_SPEED: f32 = 14.0;
    pub const SPAWN_SPEED_JITTER: f32 = 4.0;
    /// Heading jitter added per axis before normalizing
    pub const SPAWN_HEADING_JITTER: f32 = 0.25;

    /// Longest frame the orchestrator will catch up on (seconds)
    pub const MAX_FRAME_DT: f64 = 0.05;
    /// Maximum substeps per frame to prevent spiral of death
    pub const MAX_SUBSTEPS: u32 = 8;
}

/// Normalize `v`, returning zero for near-zero vectors instead of NaN
#[inline]
pub fn safe_normalize(v: Vec2) -> Vec2 {
    let len = v.length();
    if len < consts::NORMALIZE_EPSILON {
        Vec2::ZERO
    } else {
        v / len
    }
}

/// Clamp the length of `v` to at most `max_len`
#[inline]
pub fn limit(v: Vec2, max_len: f32) -> Vec2 {
    let len_sq = v.length_squared();
    if len_sq <= max_len * max_len {
        v
    } else {
        v * (max_len / len_sq.sqrt())
    }
}

/// Reynolds steering: desired velocity along `target` at `max_speed`,
/// minus the current velocity, capped at `max_force`.
///
/// A target that normalizes to zero desires standing still, so the result
/// brakes against `velocity`.
#[inline]
pub fn steer_towards(target: Vec2, velocity: Vec2, max_speed: f32, max_force: f32) -> Vec2 {
    limit(safe_normalize(target) * max_speed - velocity, max_force)
}

/// Clamp a point into `[0, width-1] x [0, height-1]`
#[inline]
pub fn clamp_to_bounds(p: Vec2, width: u32, height: u32) -> Vec2 {
    let max = bounds_max(width, height);
    p.clamp(Vec2::ZERO, max)
}

/// Largest valid coordinate on each axis
#[inline]
pub fn bounds_max(width: u32, height: u32) -> Vec2 {
    Vec2::new(width.saturating_sub(1) as f32, height.saturating_sub(1) as f32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_zero_is_zero() {
        assert_eq!(safe_normalize(Vec2::ZERO), Vec2::ZERO);
        let tiny = safe_normalize(Vec2::new(1e-9, -1e-9));
        assert_eq!(tiny, Vec2::ZERO);
        assert!(!tiny.x.is_nan() && !tiny.y.is_nan());
    }

    #[test]
    fn test_normalize_unit_length() {
        let n = safe_normalize(Vec2::new(3.0, 4.0));
        assert!((n.length() - 1.0).abs() < 1e-6);
        assert!((n.x - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_limit() {
        let v = limit(Vec2::new(30.0, 40.0), 5.0);
        assert!((v.length() - 5.0).abs() < 1e-5);
        // Shorter vectors pass through untouched
        assert_eq!(limit(Vec2::new(1.0, 1.0), 5.0), Vec2::new(1.0, 1.0));
    }

    #[test]
    fn test_steer_towards_caps_force() {
        let steer = steer_towards(Vec2::new(-1.0, 0.0), Vec2::new(30.0, 0.0), 30.0, 25.0);
        assert!((steer.length() - 25.0).abs() < 1e-4);
        assert!(steer.x < 0.0);
    }

    #[test]
    fn test_steer_towards_zero_target_brakes() {
        assert_eq!(steer_towards(Vec2::ZERO, Vec2::new(5.0, 5.0), 30.0, 25.0), Vec2::new(-5.0, -5.0));
        let fast = steer_towards(Vec2::new(1e-9, 0.0), Vec2::new(40.0, 0.0), 30.0, 25.0);
        assert!((fast - Vec2::new(-25.0, 0.0)).length() < 1e-4);
    }

    #[test]
    fn test_clamp_to_bounds() {
        let p = clamp_to_bounds(Vec2::new(-3.0, 120.0), 80, 25);
        assert_eq!(p, Vec2::new(0.0, 24.0));
    }
}
