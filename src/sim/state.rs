//! World state and core simulation types
//!
//! The world owns two agent buffers. During a tick one is read by every
//! worker and the other is filled in disjoint partitions; afterwards the
//! roles swap by flipping an index.

use std::collections::TryReserveError;
use std::sync::Arc;

use glam::Vec2;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::buffer::{AgentBuffer, DetachFlags};
use super::flock::FlockParams;
use crate::consts::*;
use crate::{bounds_max, clamp_to_bounds, safe_normalize};

/// A single flocking agent
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub position: Vec2,
    pub velocity: Vec2,
}

/// The player-controlled disturbance the flock avoids
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Player {
    pub position: Vec2,
    /// Movement speed (units/s)
    pub speed: f32,
}

impl Player {
    /// Player at the integer center of a `width` x `height` world
    pub fn centered(width: u32, height: u32) -> Self {
        Self {
            position: Vec2::new((width / 2) as f32, (height / 2) as f32),
            speed: PLAYER_SPEED,
        }
    }
}

/// Requested movement directions for one tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InputState {
    pub up: bool,
    pub down: bool,
    pub left: bool,
    pub right: bool,
}

impl InputState {
    /// Raw (unnormalized) direction, y grows downward
    pub fn direction(&self) -> Vec2 {
        let mut d = Vec2::ZERO;
        if self.up {
            d.y -= 1.0;
        }
        if self.down {
            d.y += 1.0;
        }
        if self.left {
            d.x -= 1.0;
        }
        if self.right {
            d.x += 1.0;
        }
        d
    }
}

#[derive(Debug, Error)]
pub enum WorldError {
    #[error("failed to allocate {count} agents for the {which} buffer")]
    Allocation {
        count: usize,
        which: &'static str,
        #[source]
        source: TryReserveError,
    },
}

/// Complete simulation state
pub struct World {
    width: u32,
    height: u32,
    buffers: [Arc<AgentBuffer>; 2],
    /// Index of the readable buffer in `buffers`
    active: usize,
    detached: Arc<DetachFlags>,
    params: FlockParams,
    pub player: Player,
}

impl World {
    /// Allocate both buffers and seed `agent_count` agents in jittered
    /// clusters, reproducibly for a given `seed`.
    pub fn new(width: u32, height: u32, agent_count: usize, seed: u64) -> Result<Self, WorldError> {
        let mut rng = Pcg32::seed_from_u64(seed);
        let mut agents = Vec::new();
        agents
            .try_reserve_exact(agent_count)
            .map_err(|source| WorldError::Allocation {
                count: agent_count,
                which: "seed",
                source,
            })?;

        let max = bounds_max(width, height);
        let group_count = if agent_count >= 300 { 6 } else { 5 };
        let groups: Vec<(Vec2, Vec2)> = (0..group_count)
            .map(|_| {
                let center = Vec2::new(
                    rng.random_range(0.15 * max.x..=0.85 * max.x),
                    rng.random_range(0.15 * max.y..=0.85 * max.y),
                );
                let angle = rng.random_range(0.0..std::f32::consts::TAU);
                (center, Vec2::new(angle.cos(), angle.sin()))
            })
            .collect();

        let spread = Vec2::new(width as f32 * 0.08, height as f32 * 0.12);
        for i in 0..agent_count {
            let (center, heading) = groups[i % group_count];
            let offset = Vec2::new(signed(&mut rng), signed(&mut rng)) * spread;
            let position = clamp_to_bounds(center + offset, width, height);

            let speed = SPAWN_SPEED + signed(&mut rng) * SPAWN_SPEED_JITTER;
            let jitter = Vec2::new(signed(&mut rng), signed(&mut rng)) * SPAWN_HEADING_JITTER;
            let velocity = safe_normalize(heading + jitter) * speed;

            agents.push(Agent { position, velocity });
        }

        Self::try_from_agents(width, height, &agents, Player::centered(width, height))
    }

    /// Build a world from explicit agents (player placement is the caller's)
    pub fn from_agents(width: u32, height: u32, agents: Vec<Agent>, player: Player) -> Self {
        let next = AgentBuffer::from_agents(agents.clone());
        let detached = DetachFlags::new(agents.len());
        let active = AgentBuffer::from_agents(agents);
        Self::assemble(width, height, active, next, detached, player)
    }

    fn try_from_agents(
        width: u32,
        height: u32,
        agents: &[Agent],
        player: Player,
    ) -> Result<Self, WorldError> {
        let alloc_err = |which: &'static str, source| WorldError::Allocation {
            count: agents.len(),
            which,
            source,
        };
        let active = AgentBuffer::try_from_slice(agents).map_err(|e| alloc_err("active", e))?;
        let next = AgentBuffer::try_from_slice(agents).map_err(|e| alloc_err("next", e))?;
        let detached = DetachFlags::try_new(agents.len()).map_err(|e| alloc_err("detach flag", e))?;
        Ok(Self::assemble(width, height, active, next, detached, player))
    }

    fn assemble(
        width: u32,
        height: u32,
        active: AgentBuffer,
        next: AgentBuffer,
        detached: DetachFlags,
        player: Player,
    ) -> Self {
        assert_eq!(active.len(), next.len(), "agent buffers must have equal length");
        assert_eq!(active.len(), detached.len(), "one detach flag per agent");
        Self {
            width,
            height,
            buffers: [Arc::new(active), Arc::new(next)],
            active: 0,
            detached: Arc::new(detached),
            params: FlockParams::default(),
            player,
        }
    }

    /// Replace the flocking parameters
    pub fn with_params(mut self, params: FlockParams) -> Self {
        self.params = params;
        self
    }

    #[inline]
    pub fn params(&self) -> &FlockParams {
        &self.params
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    pub fn agent_count(&self) -> usize {
        self.buffers[self.active].len()
    }

    /// Current (readable) agents
    pub fn agents(&self) -> &[Agent] {
        // SAFETY: the active buffer is never written. Workers only write the
        // inactive buffer, and it becomes active via `swap_buffers(&mut self)`
        // once every worker has finished, so no write outlives this borrow.
        unsafe { self.buffers[self.active].as_slice() }
    }

    /// Detached markers from the most recent two-phase tick
    pub fn detached(&self) -> &DetachFlags {
        &self.detached
    }

    /// Move the player along the requested direction, clamped to the world
    pub fn apply_player_input(&mut self, input: &InputState, dt: f64) {
        let d = input.direction();
        if d != Vec2::ZERO {
            let step = safe_normalize(d) * (self.player.speed * dt as f32);
            self.player.position = clamp_to_bounds(self.player.position + step, self.width, self.height);
        }
    }

    /// Exchange the active and next buffers (index flip, no copy)
    pub fn swap_buffers(&mut self) {
        self.active ^= 1;
    }

    /// Mean agent position, or the world center for an empty flock
    pub fn centroid(&self) -> Vec2 {
        let agents = self.agents();
        if agents.is_empty() {
            return bounds_max(self.width, self.height) * 0.5;
        }
        let sum: Vec2 = agents.iter().map(|a| a.position).sum();
        sum / agents.len() as f32
    }

    /// Squared distance from `centroid` beyond which an agent is detached
    pub fn detach_threshold_sq(&self, centroid: Vec2) -> f32 {
        let params = &self.params;
        let agents = self.agents();
        let min_sq = params.min_detach_radius * params.min_detach_radius;
        if agents.is_empty() {
            return min_sq;
        }
        let mean_sq = agents
            .iter()
            .map(|a| a.position.distance_squared(centroid))
            .sum::<f32>()
            / agents.len() as f32;
        (mean_sq * params.detach_spread_factor * params.detach_spread_factor).max(min_sq)
    }

    /// Shared handles to (read, write) buffers for a pooled tick
    pub(crate) fn tick_buffers(&self) -> (Arc<AgentBuffer>, Arc<AgentBuffer>) {
        (
            Arc::clone(&self.buffers[self.active]),
            Arc::clone(&self.buffers[self.active ^ 1]),
        )
    }

    pub(crate) fn detach_flags(&self) -> Arc<DetachFlags> {
        Arc::clone(&self.detached)
    }

    /// (read, write) views for a tick run on the calling thread
    pub(crate) fn split_buffers_mut(&mut self) -> (&[Agent], &mut [Agent]) {
        let [a, b] = &mut self.buffers;
        let (read, write) = if self.active == 0 { (a, b) } else { (b, a) };
        let write = Arc::get_mut(write).expect("next buffer still shared with a worker");
        // SAFETY: `read` is the active buffer, which nothing writes.
        (unsafe { read.as_slice() }, write.as_mut_slice())
    }
}

#[inline]
fn signed(rng: &mut Pcg32) -> f32 {
    rng.random_range(-1.0..=1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_world_seeding_in_bounds() {
        let world = World::new(80, 25, 200, 7).unwrap();
        assert_eq!(world.agent_count(), 200);
        for a in world.agents() {
            assert!(a.position.x >= 0.0 && a.position.x <= 79.0);
            assert!(a.position.y >= 0.0 && a.position.y <= 24.0);
            let speed = a.velocity.length();
            assert!(speed <= SPAWN_SPEED + SPAWN_SPEED_JITTER + 1e-3);
        }
        assert_eq!(world.player.position, Vec2::new(40.0, 12.0));
    }

    #[test]
    fn test_oversized_world_reports_allocation_failure() {
        let err = World::new(80, 25, usize::MAX, 1).err().unwrap();
        assert!(matches!(err, WorldError::Allocation { count: usize::MAX, .. }));
    }

    #[test]
    fn test_world_seed_is_reproducible() {
        let a = World::new(120, 40, 50, 42).unwrap();
        let b = World::new(120, 40, 50, 42).unwrap();
        assert_eq!(a.agents(), b.agents());
    }

    #[test]
    fn test_player_input_moves_and_clamps() {
        let mut world = World::new(20, 20, 1, 1).unwrap();
        let right = InputState {
            right: true,
            ..Default::default()
        };
        world.apply_player_input(&right, 0.1);
        assert!((world.player.position.x - 12.5).abs() < 1e-5);

        // Diagonal moves at the same speed as straight moves
        let diag = InputState {
            up: true,
            left: true,
            ..Default::default()
        };
        let before = world.player.position;
        world.apply_player_input(&diag, 0.1);
        assert!(((world.player.position - before).length() - 2.5).abs() < 1e-4);

        for _ in 0..100 {
            world.apply_player_input(&right, 1.0);
        }
        assert_eq!(world.player.position.x, 19.0);
    }

    #[test]
    fn test_opposite_inputs_cancel() {
        let mut world = World::new(20, 20, 1, 1).unwrap();
        let before = world.player.position;
        let input = InputState {
            left: true,
            right: true,
            ..Default::default()
        };
        world.apply_player_input(&input, 1.0);
        assert_eq!(world.player.position, before);
    }

    #[test]
    fn test_swap_buffers_flips_roles() {
        let agents = vec![Agent::default(); 3];
        let mut world = World::from_agents(30, 30, agents, Player::centered(30, 30));
        {
            let (_, write) = world.split_buffers_mut();
            write[1].position = Vec2::new(5.0, 6.0);
        }
        assert_eq!(world.agents()[1].position, Vec2::ZERO);
        world.swap_buffers();
        assert_eq!(world.agents()[1].position, Vec2::new(5.0, 6.0));
        world.swap_buffers();
        assert_eq!(world.agents()[1].position, Vec2::ZERO);
    }

    #[test]
    fn test_centroid_and_detach_threshold() {
        let agents = vec![
            Agent {
                position: Vec2::new(10.0, 10.0),
                velocity: Vec2::ZERO,
            },
            Agent {
                position: Vec2::new(20.0, 10.0),
                velocity: Vec2::ZERO,
            },
        ];
        let world = World::from_agents(40, 40, agents, Player::centered(40, 40));
        let c = world.centroid();
        assert_eq!(c, Vec2::new(15.0, 10.0));

        // Mean squared distance 25, spread factor 2 -> 100, above the 8^2 floor
        let t = world.detach_threshold_sq(c);
        assert!((t - 100.0).abs() < 1e-4);
    }
}
