//! Fixed timestep flock tick
//!
//! Two drivers over the same kernel: `step_sequential` runs a whole tick on
//! the calling thread, `FlockJob` is the partitioned form handed to the
//! worker pool.

use std::ops::Range;
use std::sync::Arc;

use glam::Vec2;

use super::buffer::{AgentBuffer, DetachFlags};
use super::flock::{DetachView, FlockParams, Snapshot, mark_detached, step_range};
use super::state::{Agent, Player, World};
use crate::pool::PartitionJob;

/// Centroid and threshold computed once per two-phase tick, before dispatch
#[derive(Debug, Clone, Copy)]
pub struct DetachPlan {
    pub centroid: Vec2,
    pub threshold_sq: f32,
}

impl DetachPlan {
    pub fn for_world(world: &World) -> Self {
        let centroid = world.centroid();
        Self {
            centroid,
            threshold_sq: world.detach_threshold_sq(centroid),
        }
    }
}

/// Advance `world` by `dt` on the calling thread, then swap buffers
pub fn step_sequential(world: &mut World, dt: f64, two_phase: bool) {
    let plan = two_phase.then(|| DetachPlan::for_world(world));
    let (width, height) = (world.width(), world.height());
    let player = world.player;
    let params = world.params().clone();
    let flags = world.detach_flags();

    let (read, write) = world.split_buffers_mut();
    if let Some(plan) = plan {
        mark_detached(read, plan.centroid, plan.threshold_sq, &flags, 0..read.len());
    }
    let snap = Snapshot {
        agents: read,
        player: &player,
        width,
        height,
        params: &params,
        detach: plan.map(|plan| DetachView {
            centroid: plan.centroid,
            flags: &flags,
        }),
    };
    step_range(&snap, 0..read.len(), write, dt);

    world.swap_buffers();
}

/// One tick of flock work, partitioned across pool workers.
///
/// Holds shared handles to the world's buffers for the duration of the
/// tick. Never leaves the crate: its `run` relies on the pool handing out
/// disjoint ranges.
pub(crate) struct FlockJob {
    read: Arc<AgentBuffer>,
    write: Arc<AgentBuffer>,
    player: Player,
    width: u32,
    height: u32,
    params: FlockParams,
    dt: f64,
    detach: Option<(DetachPlan, Arc<DetachFlags>)>,
}

impl FlockJob {
    pub(crate) fn new(world: &World, dt: f64, two_phase: bool) -> Self {
        let (read, write) = world.tick_buffers();
        assert!(!Arc::ptr_eq(&read, &write), "active and next buffers must be distinct");
        assert_eq!(read.len(), write.len(), "agent buffers must have equal length");
        Self {
            read,
            write,
            player: world.player,
            width: world.width(),
            height: world.height(),
            params: world.params().clone(),
            dt,
            detach: two_phase.then(|| (DetachPlan::for_world(world), world.detach_flags())),
        }
    }

    fn agents(&self) -> &[Agent] {
        // SAFETY: the read buffer is the world's active buffer, which no
        // one writes while a tick is in flight.
        unsafe { self.read.as_slice() }
    }
}

impl PartitionJob for FlockJob {
    fn len(&self) -> usize {
        self.read.len()
    }

    fn two_phase(&self) -> bool {
        self.detach.is_some()
    }

    fn prepare(&self, range: Range<usize>) {
        if let Some((plan, flags)) = &self.detach {
            mark_detached(self.agents(), plan.centroid, plan.threshold_sq, flags, range);
        }
    }

    fn run(&self, range: Range<usize>) {
        let snap = Snapshot {
            agents: self.agents(),
            player: &self.player,
            width: self.width,
            height: self.height,
            params: &self.params,
            detach: self.detach.as_ref().map(|(plan, flags)| DetachView {
                centroid: plan.centroid,
                flags: flags.as_ref(),
            }),
        };
        // SAFETY: each worker receives a distinct partition of 0..len, so
        // no two live views of the write buffer overlap, and nothing reads
        // the write buffer until the tick completes.
        let out = unsafe { self.write.range_mut(range.clone()) };
        step_range(&snap, range, out, self.dt);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(x: f32, y: f32, vx: f32, vy: f32) -> Agent {
        Agent {
            position: Vec2::new(x, y),
            velocity: Vec2::new(vx, vy),
        }
    }

    #[test]
    fn test_sequential_step_swaps_and_advances() {
        let agents = vec![agent(30.0, 30.0, 10.0, 0.0)];
        let player = Player {
            position: Vec2::new(5.0, 55.0),
            speed: 25.0,
        };
        let mut world = World::from_agents(60, 60, agents, player);
        step_sequential(&mut world, 0.1, false);
        assert!((world.agents()[0].position.x - 31.0).abs() < 1e-5);
        step_sequential(&mut world, 0.1, false);
        assert!((world.agents()[0].position.x - 32.0).abs() < 1e-5);
    }

    #[test]
    fn test_job_partitions_compose_to_sequential_result() {
        let mut pooled = World::new(90, 40, 120, 3).unwrap();
        let mut sequential = World::new(90, 40, 120, 3).unwrap();

        let job = FlockJob::new(&pooled, 1.0 / 30.0, true);
        // Run phases in worker order the way the pool would
        let parts = [0..37, 37..80, 80..120];
        for part in &parts {
            job.prepare(part.clone());
        }
        for part in &parts {
            job.run(part.clone());
        }
        drop(job);
        pooled.swap_buffers();

        step_sequential(&mut sequential, 1.0 / 30.0, true);
        assert_eq!(pooled.agents(), sequential.agents());
        assert_eq!(pooled.detached().count(), sequential.detached().count());
    }
}
