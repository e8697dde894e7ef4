//! Fixed-timestep orchestrator
//!
//! Owns the world and the scheduler, feeds player input once per tick and
//! keeps the tick timing statistics. Only this thread ever calls `step`,
//! applies input or swaps buffers.

use std::thread;
use std::time::{Duration, Instant};

use glam::Vec2;
use serde::Serialize;
use thiserror::Error;

use crate::consts::{MAX_FRAME_DT, MAX_SUBSTEPS};
use crate::pool::{PoolError, WorkerPool};
use crate::settings::{ConfigError, RunMode, Settings};
use crate::sim::{DetachPlan, InputState, World, WorldError, step_sequential};

/// Waypoint counts as reached inside this distance
const ARRIVE_RADIUS: f32 = 1.5;
/// Axis offsets smaller than this produce no key press
const DEAD_ZONE: f32 = 0.5;
/// Pause between polls of the wall clock in realtime mode
const IDLE_SLEEP: Duration = Duration::from_millis(1);

#[derive(Debug, Error)]
pub enum RunError {
    #[error("invalid settings")]
    Config(#[from] ConfigError),
    #[error("failed to build world")]
    World(#[from] WorldError),
    #[error("worker pool failed")]
    Pool(#[from] PoolError),
}

/// Executes one tick, either inline or on the worker pool
pub enum Stepper {
    Sequential { two_phase: bool },
    Pool(WorkerPool),
}

impl Stepper {
    pub fn from_settings(settings: &Settings) -> Result<Self, PoolError> {
        Ok(match settings.mode {
            RunMode::Seq => Stepper::Sequential {
                two_phase: settings.two_phase,
            },
            RunMode::Pool => Stepper::Pool(WorkerPool::new(settings.thread_count)?.with_two_phase(settings.two_phase)),
        })
    }

    pub fn mode(&self) -> RunMode {
        match self {
            Stepper::Sequential { .. } => RunMode::Seq,
            Stepper::Pool(_) => RunMode::Pool,
        }
    }

    /// Worker threads in use (1 for inline stepping)
    pub fn thread_count(&self) -> usize {
        match self {
            Stepper::Sequential { .. } => 1,
            Stepper::Pool(pool) => pool.thread_count(),
        }
    }

    pub fn two_phase(&self) -> bool {
        match self {
            Stepper::Sequential { two_phase } => *two_phase,
            Stepper::Pool(pool) => pool.two_phase(),
        }
    }

    pub fn step(&mut self, world: &mut World, dt: f64) -> Result<(), PoolError> {
        match self {
            Stepper::Sequential { two_phase } => {
                step_sequential(world, dt, *two_phase);
                Ok(())
            }
            Stepper::Pool(pool) => pool.step(world, dt),
        }
    }

    pub fn shutdown(self) {
        if let Stepper::Pool(pool) = self {
            pool.shutdown();
        }
    }
}

/// Scripted stand-in for keyboard input: walks the player around a
/// rectangle inset from the world edges.
#[derive(Debug, Clone)]
pub struct Autopilot {
    waypoints: [Vec2; 4],
    next: usize,
}

impl Autopilot {
    pub fn new(width: u32, height: u32) -> Self {
        let (w, h) = (width as f32, height as f32);
        let (x0, x1) = (w * 0.25, w * 0.75);
        let (y0, y1) = (h * 0.25, h * 0.75);
        Self {
            waypoints: [
                Vec2::new(x0, y0),
                Vec2::new(x1, y0),
                Vec2::new(x1, y1),
                Vec2::new(x0, y1),
            ],
            next: 0,
        }
    }

    pub fn target(&self) -> Vec2 {
        self.waypoints[self.next]
    }

    /// Keys to press this tick for a player standing at `player`
    pub fn input(&mut self, player: Vec2) -> InputState {
        if player.distance_squared(self.target()) < ARRIVE_RADIUS * ARRIVE_RADIUS {
            self.next = (self.next + 1) % self.waypoints.len();
        }
        let delta = self.target() - player;
        InputState {
            up: delta.y < -DEAD_ZONE,
            down: delta.y > DEAD_ZONE,
            left: delta.x < -DEAD_ZONE,
            right: delta.x > DEAD_ZONE,
        }
    }
}

/// Tick count with running average and worst tick time
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TickStats {
    pub ticks: u64,
    pub avg_ms: f64,
    pub max_ms: f64,
}

impl TickStats {
    pub fn record(&mut self, ms: f64) {
        self.ticks += 1;
        self.avg_ms += (ms - self.avg_ms) / self.ticks as f64;
        self.max_ms = self.max_ms.max(ms);
    }
}

/// Final report of a run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub mode: RunMode,
    pub threads: usize,
    pub two_phase: bool,
    pub agents: usize,
    pub stats: TickStats,
    pub elapsed_secs: f64,
    pub player: Vec2,
    pub centroid: Vec2,
    /// Agents beyond the detach threshold at the end of the run
    pub detached: usize,
}

pub struct Runner {
    settings: Settings,
    world: World,
    stepper: Stepper,
    autopilot: Autopilot,
    stats: TickStats,
}

impl Runner {
    /// Validate `settings`, seed the world and start the scheduler
    pub fn new(settings: Settings) -> Result<Self, RunError> {
        settings.validate()?;
        let world = World::new(settings.width, settings.height, settings.agent_count, settings.seed)?
            .with_params(settings.flock.clone());
        let stepper = Stepper::from_settings(&settings)?;
        log::info!(
            "{} agents in {}x{}, mode {} ({} threads, two-phase {}), {} steps/s",
            settings.agent_count,
            settings.width,
            settings.height,
            stepper.mode(),
            stepper.thread_count(),
            stepper.two_phase(),
            settings.steps_per_second,
        );
        Ok(Self {
            autopilot: Autopilot::new(settings.width, settings.height),
            settings,
            world,
            stepper,
            stats: TickStats::default(),
        })
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn stats(&self) -> TickStats {
        self.stats
    }

    /// Apply input and advance one fixed step; returns the tick time in ms
    pub fn tick(&mut self) -> Result<f64, RunError> {
        let dt = self.settings.tick_dt();
        let input = self.autopilot.input(self.world.player.position);
        self.world.apply_player_input(&input, dt);

        let start = Instant::now();
        self.stepper.step(&mut self.world, dt)?;
        let ms = start.elapsed().as_secs_f64() * 1000.0;
        self.stats.record(ms);
        Ok(ms)
    }

    /// Run until the time or tick limit, then stop the scheduler
    pub fn run(mut self) -> Result<RunSummary, RunError> {
        let dt = self.settings.tick_dt();
        let start = Instant::now();
        let mut last = start;
        let mut accumulator = 0.0;
        let mut next_report = self.settings.report_interval;

        while !self.finished(start) {
            if self.settings.realtime {
                let now = Instant::now();
                accumulator += (now - last).as_secs_f64().min(MAX_FRAME_DT);
                last = now;

                let mut substeps = 0;
                while accumulator >= dt && substeps < MAX_SUBSTEPS && !self.finished(start) {
                    self.tick()?;
                    accumulator -= dt;
                    substeps += 1;
                }
                thread::sleep(IDLE_SLEEP);
            } else {
                self.tick()?;
            }

            let elapsed = start.elapsed().as_secs_f64();
            if self.settings.report_interval > 0.0 && elapsed >= next_report {
                next_report = elapsed + self.settings.report_interval;
                log::info!(
                    "tick {}: avg {:.3} ms, max {:.3} ms, player ({:.1}, {:.1})",
                    self.stats.ticks,
                    self.stats.avg_ms,
                    self.stats.max_ms,
                    self.world.player.position.x,
                    self.world.player.position.y,
                );
            }
        }

        let summary = self.summary(start.elapsed().as_secs_f64());
        self.stepper.shutdown();
        log::info!(
            "Finished {} ticks in {:.2} s (avg {:.3} ms/tick)",
            summary.stats.ticks,
            summary.elapsed_secs,
            summary.stats.avg_ms
        );
        Ok(summary)
    }

    fn finished(&self, start: Instant) -> bool {
        if self.settings.max_ticks.is_some_and(|max| self.stats.ticks >= max) {
            return true;
        }
        self.settings.run_seconds > 0.0 && start.elapsed().as_secs_f64() >= self.settings.run_seconds
    }

    /// Snapshot of the current run state
    pub fn summary(&self, elapsed_secs: f64) -> RunSummary {
        let plan = DetachPlan::for_world(&self.world);
        let detached = self
            .world
            .agents()
            .iter()
            .filter(|a| a.position.distance_squared(plan.centroid) > plan.threshold_sq)
            .count();
        RunSummary {
            mode: self.stepper.mode(),
            threads: self.stepper.thread_count(),
            two_phase: self.stepper.two_phase(),
            agents: self.world.agent_count(),
            stats: self.stats,
            elapsed_secs,
            player: self.world.player.position,
            centroid: plan.centroid,
            detached,
        }
    }
}
