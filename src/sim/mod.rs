//! Flock simulation module
//!
//! Everything a tick reads or writes lives here:
//! - Double-buffered agent storage swapped by index
//! - A pure per-agent kernel evaluated against a read-only snapshot
//! - Fixed timestep only; dt is always supplied by the caller
//! - No threads, rendering or platform dependencies (see `pool`)

pub mod buffer;
pub mod flock;
pub mod state;
pub mod tick;

pub use buffer::{AgentBuffer, DetachFlags};
pub use flock::{DetachView, FlockParams, Snapshot, mark_detached, steering_acceleration, step_one, step_range};
pub use state::{Agent, InputState, Player, World, WorldError};
pub use tick::{DetachPlan, step_sequential};
pub(crate) use tick::FlockJob;
