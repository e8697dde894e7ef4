//! Reusable generation-counted rendezvous between pool workers
//!
//! Each arrival bumps a counter; the last arrival resets it and advances the
//! generation. Waiters loop on "generation unchanged" instead of trusting a
//! single wakeup, so a late or spuriously woken thread never blocks on a
//! stale round.

use parking_lot::{Condvar, Mutex};

#[derive(Debug)]
struct BarrierState {
    arrived: usize,
    generation: u64,
    broken: bool,
}

/// How a thread left the barrier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierWait {
    /// Last to arrive; released everyone else
    Leader,
    /// Released by the leader
    Follower,
    /// The barrier was broken; peers may not have finished the phase
    Broken,
}

impl BarrierWait {
    pub fn is_broken(self) -> bool {
        self == BarrierWait::Broken
    }
}

#[derive(Debug)]
pub struct PhaseBarrier {
    parties: usize,
    state: Mutex<BarrierState>,
    cv: Condvar,
}

impl PhaseBarrier {
    pub fn new(parties: usize) -> Self {
        assert!(parties > 0, "barrier needs at least one party");
        Self {
            parties,
            state: Mutex::new(BarrierState {
                arrived: 0,
                generation: 0,
                broken: false,
            }),
            cv: Condvar::new(),
        }
    }

    /// Block until all parties have arrived for the current generation
    pub fn wait(&self) -> BarrierWait {
        let mut st = self.state.lock();
        if st.broken {
            return BarrierWait::Broken;
        }
        let round = st.generation;
        st.arrived += 1;
        if st.arrived == self.parties {
            st.arrived = 0;
            st.generation = st.generation.wrapping_add(1);
            self.cv.notify_all();
            return BarrierWait::Leader;
        }
        while st.generation == round && !st.broken {
            self.cv.wait(&mut st);
        }
        if st.generation == round {
            BarrierWait::Broken
        } else {
            BarrierWait::Follower
        }
    }

    /// Release every waiter now and make future waits return immediately
    pub fn break_barrier(&self) {
        let mut st = self.state.lock();
        st.broken = true;
        st.arrived = 0;
        self.cv.notify_all();
    }

    pub fn is_broken(&self) -> bool {
        self.state.lock().broken
    }

    /// Rounds completed so far
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }
}
