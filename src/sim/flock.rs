//! Per-agent flocking kernel
//!
//! `step_one` is a pure function of a read-only [`Snapshot`]: it never
//! writes shared state, so any partition of agent indices can be evaluated
//! on any thread and produce bit-identical results.

use std::ops::Range;

use glam::Vec2;
use serde::{Deserialize, Serialize};

use super::buffer::DetachFlags;
use super::state::{Agent, Player};
use crate::consts::COINCIDENT_DIST_SQ;
use crate::{bounds_max, limit, steer_towards};

/// Tunable flocking parameters.
///
/// Behavior weights must keep the priority order
/// cohesion < alignment < separation < walls < player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlockParams {
    pub neighbor_radius: f32,
    pub separation_radius: f32,
    pub max_speed: f32,
    pub max_force: f32,

    pub cohesion_weight: f32,
    pub alignment_weight: f32,
    pub separation_weight: f32,
    pub wall_weight: f32,
    pub player_weight: f32,

    pub player_avoid_radius: f32,
    pub wall_margin: f32,
    /// Fraction of velocity kept (and reversed) on hitting a boundary
    pub bounce_damping: f32,

    // === Two-phase ticks ===
    /// Detach threshold as a multiple of the flock's RMS spread
    pub detach_spread_factor: f32,
    /// Lower bound on the detach distance
    pub min_detach_radius: f32,
    /// Weight of the pull back toward the centroid for detached agents
    pub regroup_weight: f32,
}

impl Default for FlockParams {
    fn default() -> Self {
        Self {
            neighbor_radius: 5.8,
            separation_radius: 2.2,
            max_speed: 30.0,
            max_force: 25.0,

            cohesion_weight: 0.45,
            alignment_weight: 0.85,
            separation_weight: 1.45,
            wall_weight: 1.50,
            player_weight: 1.80,

            player_avoid_radius: 10.0,
            wall_margin: 4.0,
            bounce_damping: 0.6,

            detach_spread_factor: 2.0,
            min_detach_radius: 8.0,
            regroup_weight: 0.65,
        }
    }
}

impl FlockParams {
    /// Behavior weights in required priority order
    pub fn weights(&self) -> [(&'static str, f32); 5] {
        [
            ("cohesion", self.cohesion_weight),
            ("alignment", self.alignment_weight),
            ("separation", self.separation_weight),
            ("walls", self.wall_weight),
            ("player", self.player_weight),
        ]
    }
}

/// Tick-wide detach data, read-only during phase two
#[derive(Clone, Copy)]
pub struct DetachView<'a> {
    pub centroid: Vec2,
    pub flags: &'a DetachFlags,
}

/// Read-only world view the kernel evaluates against
#[derive(Clone, Copy)]
pub struct Snapshot<'a> {
    pub agents: &'a [Agent],
    pub player: &'a Player,
    pub width: u32,
    pub height: u32,
    pub params: &'a FlockParams,
    pub detach: Option<DetachView<'a>>,
}

impl Snapshot<'_> {
    #[inline]
    fn is_detached(&self, index: usize) -> bool {
        self.detach.is_some_and(|d| d.flags.get(index))
    }
}

/// Sum of all weighted steering forces acting on agent `i`
pub fn steering_acceleration(snap: &Snapshot<'_>, i: usize) -> Vec2 {
    let p = snap.params;
    let me = snap.agents[i];
    let self_detached = snap.is_detached(i);

    let neighbor_r2 = p.neighbor_radius * p.neighbor_radius;
    let separation_r2 = p.separation_radius * p.separation_radius;

    let mut sum_pos = Vec2::ZERO;
    let mut sum_vel = Vec2::ZERO;
    let mut sum_sep = Vec2::ZERO;
    let mut neighbors = 0u32;
    let mut flockmates = 0u32;

    for (j, other) in snap.agents.iter().enumerate() {
        if j == i {
            continue;
        }
        let diff = other.position - me.position;
        let d2 = diff.length_squared();
        if d2 >= neighbor_r2 {
            continue;
        }
        neighbors += 1;
        // Detached neighbors only push, they don't lead
        if !snap.is_detached(j) {
            flockmates += 1;
            sum_pos += other.position;
            sum_vel += other.velocity;
        }
        if d2 < separation_r2 && d2 > COINCIDENT_DIST_SQ {
            let dist = d2.sqrt();
            sum_sep -= diff / dist / dist;
        }
    }

    let steer = |target: Vec2| steer_towards(target, me.velocity, p.max_speed, p.max_force);
    let mut accel = Vec2::ZERO;

    if neighbors > 0 {
        if flockmates > 0 && !self_detached {
            let center = sum_pos / flockmates as f32;
            let avg_vel = sum_vel / flockmates as f32;
            accel += steer(center - me.position) * p.cohesion_weight;
            accel += steer(avg_vel) * p.alignment_weight;
        }
        accel += steer(sum_sep) * p.separation_weight;
    }

    if self_detached {
        if let Some(detach) = snap.detach {
            accel += steer(detach.centroid - me.position) * p.regroup_weight;
        }
    }

    let away = me.position - snap.player.position;
    let dp2 = away.length_squared();
    if dp2 < p.player_avoid_radius * p.player_avoid_radius && dp2 > COINCIDENT_DIST_SQ {
        accel += steer(away) * p.player_weight;
    }

    let max = bounds_max(snap.width, snap.height);
    let mut wall_dir = Vec2::ZERO;
    if me.position.x < p.wall_margin {
        wall_dir.x = 1.0;
    } else if me.position.x > max.x - p.wall_margin {
        wall_dir.x = -1.0;
    }
    if me.position.y < p.wall_margin {
        wall_dir.y = 1.0;
    } else if me.position.y > max.y - p.wall_margin {
        wall_dir.y = -1.0;
    }
    if wall_dir != Vec2::ZERO {
        accel += steer(wall_dir) * p.wall_weight;
    }

    accel
}

/// Next state of agent `i` after `dt` seconds
pub fn step_one(snap: &Snapshot<'_>, i: usize, dt: f64) -> Agent {
    let p = snap.params;
    let dt = dt as f32;
    let mut next = snap.agents[i];

    let accel = steering_acceleration(snap, i);
    next.velocity = limit(next.velocity + accel * dt, p.max_speed);
    next.position += next.velocity * dt;

    // Inelastic bounce keeps agents inside even when steering was too weak
    let max = bounds_max(snap.width, snap.height);
    if next.position.x < 0.0 {
        next.position.x = 0.0;
        next.velocity.x *= -p.bounce_damping;
    }
    if next.position.y < 0.0 {
        next.position.y = 0.0;
        next.velocity.y *= -p.bounce_damping;
    }
    if next.position.x > max.x {
        next.position.x = max.x;
        next.velocity.x *= -p.bounce_damping;
    }
    if next.position.y > max.y {
        next.position.y = max.y;
        next.velocity.y *= -p.bounce_damping;
    }

    next
}

/// Evaluate `range` into `out` (`out[k]` receives agent `range.start + k`)
pub fn step_range(snap: &Snapshot<'_>, range: Range<usize>, out: &mut [Agent], dt: f64) {
    debug_assert_eq!(range.len(), out.len());
    for (slot, i) in out.iter_mut().zip(range) {
        *slot = step_one(snap, i, dt);
    }
}

/// Phase one of a two-phase tick: flag agents in `range` farther than
/// `threshold_sq` from `centroid`
pub fn mark_detached(
    agents: &[Agent],
    centroid: Vec2,
    threshold_sq: f32,
    flags: &DetachFlags,
    range: Range<usize>,
) {
    for i in range {
        flags.set(i, agents[i].position.distance_squared(centroid) > threshold_sq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn agent(x: f32, y: f32, vx: f32, vy: f32) -> Agent {
        Agent {
            position: Vec2::new(x, y),
            velocity: Vec2::new(vx, vy),
        }
    }

    fn snapshot<'a>(agents: &'a [Agent], player: &'a Player, params: &'a FlockParams) -> Snapshot<'a> {
        Snapshot {
            agents,
            player,
            width: 60,
            height: 60,
            params,
            detach: None,
        }
    }

    fn far_player() -> Player {
        Player {
            position: Vec2::new(55.0, 55.0),
            speed: 25.0,
        }
    }

    #[test]
    fn test_default_weights_keep_priority_order() {
        let weights = FlockParams::default().weights();
        assert!(weights.windows(2).all(|w| w[0].1 < w[1].1));
    }

    #[test]
    fn test_isolated_agent_feels_no_flock_forces() {
        let agents = [agent(30.0, 30.0, 10.0, 0.0)];
        let player = far_player();
        let params = FlockParams::default();
        let snap = snapshot(&agents, &player, &params);
        assert_eq!(steering_acceleration(&snap, 0), Vec2::ZERO);

        let next = step_one(&snap, 0, 0.1);
        assert_eq!(next.velocity, Vec2::new(10.0, 0.0));
        assert!((next.position.x - 31.0).abs() < 1e-5);
    }

    #[test]
    fn test_separation_pushes_close_neighbors_apart() {
        // 1 unit apart: inside separation radius
        let agents = [agent(30.0, 30.0, 0.0, 0.0), agent(31.0, 30.0, 0.0, 0.0)];
        let player = far_player();
        let params = FlockParams {
            cohesion_weight: 0.0,
            ..FlockParams::default()
        };
        let snap = snapshot(&agents, &player, &params);
        assert!(steering_acceleration(&snap, 0).x < 0.0);
        assert!(steering_acceleration(&snap, 1).x > 0.0);
    }

    #[test]
    fn test_neighbors_outside_separation_radius_brake_on_separation() {
        // 4 apart: inside the neighbor radius, outside the separation radius
        let agents = [agent(30.0, 30.0, 10.0, 0.0), agent(34.0, 30.0, 10.0, 0.0)];
        let player = far_player();
        let params = FlockParams::default();
        let snap = snapshot(&agents, &player, &params);

        // cohesion (30-10)*0.45 + alignment (30-10)*0.85 + separation (-10)*1.45
        let accel = steering_acceleration(&snap, 0);
        assert!((accel - Vec2::new(11.5, 0.0)).length() < 1e-4, "accel = {accel}");
    }

    #[test]
    fn test_coincident_agents_stay_finite() {
        let agents = [agent(30.0, 30.0, 0.0, 0.0), agent(30.0, 30.0, 0.0, 0.0)];
        let player = Player {
            position: Vec2::new(30.0, 30.0),
            speed: 25.0,
        };
        let params = FlockParams::default();
        let snap = snapshot(&agents, &player, &params);
        let next = step_one(&snap, 0, 1.0 / 30.0);
        assert!(next.position.is_finite());
        assert!(next.velocity.is_finite());
    }

    #[test]
    fn test_player_avoidance_points_away() {
        let agents = [agent(33.0, 30.0, 0.0, 0.0)];
        let player = Player {
            position: Vec2::new(30.0, 30.0),
            speed: 25.0,
        };
        let params = FlockParams::default();
        let snap = snapshot(&agents, &player, &params);
        let accel = steering_acceleration(&snap, 0);
        assert!(accel.dot(agents[0].position - player.position) > 0.0);
    }

    #[test]
    fn test_player_avoidance_dominates_cohesion() {
        // Neighbor pulls toward the player, player pushes away
        let agents = [agent(34.0, 30.0, 0.0, 0.0), agent(31.0, 30.0, 0.0, 0.0)];
        let player = Player {
            position: Vec2::new(30.0, 30.0),
            speed: 25.0,
        };
        let params = FlockParams::default();
        let snap = snapshot(&agents, &player, &params);
        assert!(steering_acceleration(&snap, 0).x > 0.0);
    }

    #[test]
    fn test_wall_avoidance_points_inside() {
        let agents = [agent(1.0, 58.0, 0.0, 0.0)];
        let player = far_player();
        let params = FlockParams::default();
        let snap = snapshot(&agents, &player, &params);
        let accel = steering_acceleration(&snap, 0);
        assert!(accel.x > 0.0);
        assert!(accel.y < 0.0);
    }

    #[test]
    fn test_bounce_reverses_and_damps() {
        let agents = [agent(0.5, 30.0, -30.0, 0.0)];
        let player = far_player();
        let params = FlockParams {
            wall_weight: 0.0,
            ..FlockParams::default()
        };
        let snap = snapshot(&agents, &player, &params);
        let next = step_one(&snap, 0, 0.1);
        assert_eq!(next.position.x, 0.0);
        assert!((next.velocity.x - 18.0).abs() < 1e-4);
    }

    #[test]
    fn test_detached_agent_regroups_and_neighbors_ignore_it() {
        let agents = [
            agent(10.0, 10.0, 0.0, 0.0),
            agent(13.0, 10.0, 0.0, 5.0),
            agent(40.0, 40.0, 0.0, 0.0),
        ];
        let player = far_player();
        let params = FlockParams::default();
        let flags = DetachFlags::new(3);
        flags.set(1, true);
        let centroid = Vec2::new(40.0, 40.0);
        let snap = Snapshot {
            detach: Some(DetachView {
                centroid,
                flags: &flags,
            }),
            ..snapshot(&agents, &player, &params)
        };

        // Agent 0 only sees a detached neighbor: no cohesion/alignment pull
        assert_eq!(steering_acceleration(&snap, 0), Vec2::ZERO);
        // Agent 1 is detached: pulled toward the centroid
        let pull = steering_acceleration(&snap, 1);
        assert!(pull.dot(centroid - agents[1].position) > 0.0);
    }

    #[test]
    fn test_mark_detached_range() {
        let agents = [
            agent(0.0, 0.0, 0.0, 0.0),
            agent(10.0, 0.0, 0.0, 0.0),
            agent(1.0, 0.0, 0.0, 0.0),
        ];
        let flags = DetachFlags::new(3);
        mark_detached(&agents, Vec2::ZERO, 4.0, &flags, 1..3);
        assert!(!flags.get(0));
        assert!(flags.get(1));
        assert!(!flags.get(2));
    }

    fn arb_agent() -> impl Strategy<Value = Agent> {
        (0.0f32..39.0, 0.0f32..29.0, -60.0f32..60.0, -60.0f32..60.0)
            .prop_map(|(x, y, vx, vy)| agent(x, y, vx, vy))
    }

    proptest! {
        #[test]
        fn prop_step_stays_contained_and_capped(
            agents in prop::collection::vec(arb_agent(), 1..24),
            px in 0.0f32..39.0,
            py in 0.0f32..29.0,
            dt in 0.001f64..0.2,
        ) {
            let player = Player { position: Vec2::new(px, py), speed: 25.0 };
            let params = FlockParams::default();
            let snap = Snapshot {
                agents: &agents,
                player: &player,
                width: 40,
                height: 30,
                params: &params,
                detach: None,
            };
            for i in 0..agents.len() {
                let next = step_one(&snap, i, dt);
                prop_assert!(next.position.x >= 0.0 && next.position.x <= 39.0);
                prop_assert!(next.position.y >= 0.0 && next.position.y <= 29.0);
                prop_assert!(next.velocity.length() <= params.max_speed + 1e-3);
            }
        }
    }
}
