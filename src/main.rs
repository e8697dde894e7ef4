//! Flock Pool entry point
//!
//! Parses the command line, layers it over an optional JSON config and
//! hands the result to the runner.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use flock_pool::runner::{RunSummary, Runner};
use flock_pool::{RunMode, Settings};

#[derive(Debug, Parser)]
#[command(name = "flock-pool", version, about = "Boids flocking on a persistent worker pool")]
struct Cli {
    /// JSON settings file; flags below override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Tick execution: seq or pool
    #[arg(long)]
    mode: Option<RunMode>,

    /// Worker threads in pool mode
    #[arg(long)]
    threads: Option<usize>,

    /// Number of agents
    #[arg(long)]
    boids: Option<usize>,

    #[arg(long)]
    width: Option<u32>,

    #[arg(long)]
    height: Option<u32>,

    #[arg(long)]
    steps_per_second: Option<u32>,

    /// Wall-clock run length (0 = until --ticks)
    #[arg(long)]
    seconds: Option<f64>,

    /// Stop after this many ticks
    #[arg(long)]
    ticks: Option<u64>,

    #[arg(long)]
    seed: Option<u64>,

    /// Mark detached agents before flocking
    #[arg(long)]
    two_phase: bool,

    /// Run ticks back to back instead of pacing them
    #[arg(long)]
    fast: bool,

    /// Print the run summary as JSON
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn settings(&self) -> Result<Settings> {
        let mut settings = match &self.config {
            Some(path) => Settings::load(path).context("loading settings")?,
            None => Settings::default(),
        };

        if let Some(mode) = self.mode {
            settings.mode = mode;
        }
        if let Some(threads) = self.threads {
            settings.thread_count = threads;
        }
        if let Some(boids) = self.boids {
            settings.agent_count = boids;
        }
        if let Some(width) = self.width {
            settings.width = width;
        }
        if let Some(height) = self.height {
            settings.height = height;
        }
        if let Some(steps) = self.steps_per_second {
            settings.steps_per_second = steps;
        }
        if let Some(seconds) = self.seconds {
            settings.run_seconds = seconds;
        }
        if let Some(ticks) = self.ticks {
            settings.max_ticks = Some(ticks);
            // A tick budget alone means a headless benchmark run
            if self.seconds.is_none() {
                settings.run_seconds = 0.0;
            }
        }
        if let Some(seed) = self.seed {
            settings.seed = seed;
        }
        settings.two_phase |= self.two_phase;
        if self.fast {
            settings.realtime = false;
        }
        Ok(settings)
    }
}

fn print_summary(summary: &RunSummary) {
    println!(
        "{} agents, mode {} ({} threads{})",
        summary.agents,
        summary.mode,
        summary.threads,
        if summary.two_phase { ", two-phase" } else { "" }
    );
    println!(
        "ticks: {}  avg: {:.3} ms  max: {:.3} ms  elapsed: {:.2} s",
        summary.stats.ticks, summary.stats.avg_ms, summary.stats.max_ms, summary.elapsed_secs
    );
    println!(
        "player: ({:.2}, {:.2})  centroid: ({:.2}, {:.2})  detached: {}",
        summary.player.x, summary.player.y, summary.centroid.x, summary.centroid.y, summary.detached
    );
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let settings = cli.settings()?;

    log::info!("Flock Pool starting (seed {})", settings.seed);
    let runner = Runner::new(settings).context("starting simulation")?;
    let summary = runner.run().context("simulation run failed")?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }
    Ok(())
}
