//! Agent storage shared between the orchestrator and pool workers
//!
//! A tick reads one buffer while workers fill disjoint ranges of the other.
//! `AgentBuffer` is the only place that hands out those concurrent views;
//! callers uphold the access rules documented on each method.

use std::cell::UnsafeCell;
use std::collections::TryReserveError;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};

use super::state::Agent;

/// Fixed-length agent array that can be read by many threads and written
/// in disjoint ranges during a tick.
pub struct AgentBuffer {
    slots: Box<[UnsafeCell<Agent>]>,
}

// SAFETY: concurrent access only goes through `as_slice` / `range_mut`,
// whose contracts forbid overlapping writes and reads of slots being written.
unsafe impl Sync for AgentBuffer {}

impl AgentBuffer {
    pub fn from_agents(agents: Vec<Agent>) -> Self {
        Self {
            slots: agents.into_iter().map(UnsafeCell::new).collect(),
        }
    }

    /// Copy `agents` into a new buffer, reporting allocation failure
    /// instead of aborting.
    pub fn try_from_slice(agents: &[Agent]) -> Result<Self, TryReserveError> {
        let mut slots = Vec::new();
        slots.try_reserve_exact(agents.len())?;
        slots.extend(agents.iter().copied().map(UnsafeCell::new));
        Ok(Self {
            slots: slots.into_boxed_slice(),
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Shared view of every slot.
    ///
    /// # Safety
    /// No thread may write any slot while the returned slice is alive.
    #[inline]
    pub unsafe fn as_slice(&self) -> &[Agent] {
        // UnsafeCell<Agent> has the same layout as Agent.
        unsafe { std::slice::from_raw_parts(self.slots.as_ptr().cast::<Agent>(), self.slots.len()) }
    }

    /// Exclusive view of `range`.
    ///
    /// # Safety
    /// `range` must not overlap any other live view (shared or exclusive)
    /// of this buffer for the lifetime of the returned slice.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn range_mut(&self, range: Range<usize>) -> &mut [Agent] {
        assert!(range.start <= range.end && range.end <= self.slots.len());
        unsafe {
            let base = UnsafeCell::raw_get(self.slots.as_ptr().add(range.start));
            std::slice::from_raw_parts_mut(base, range.end - range.start)
        }
    }

    /// Exclusive view of every slot; safe because `&mut self` proves no
    /// other view exists.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [Agent] {
        // SAFETY: unique borrow of the buffer.
        unsafe { self.range_mut(0..self.slots.len()) }
    }
}

/// Per-agent "detached from the flock" markers written in phase one of a
/// two-phase tick and read by every worker in phase two.
pub struct DetachFlags {
    flags: Box<[AtomicBool]>,
}

impl DetachFlags {
    pub fn new(len: usize) -> Self {
        Self {
            flags: (0..len).map(|_| AtomicBool::new(false)).collect(),
        }
    }

    /// Like `new`, reporting allocation failure instead of aborting
    pub fn try_new(len: usize) -> Result<Self, TryReserveError> {
        let mut flags = Vec::new();
        flags.try_reserve_exact(len)?;
        flags.extend((0..len).map(|_| AtomicBool::new(false)));
        Ok(Self {
            flags: flags.into_boxed_slice(),
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.flags.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    /// Relaxed: the barrier between phases provides the ordering.
    #[inline]
    pub fn set(&self, index: usize, detached: bool) {
        self.flags[index].store(detached, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self, index: usize) -> bool {
        self.flags[index].load(Ordering::Relaxed)
    }

    pub fn count(&self) -> usize {
        self.flags.iter().filter(|f| f.load(Ordering::Relaxed)).count()
    }
}
