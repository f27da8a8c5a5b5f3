//! Spin-loop detection.
//!
//! Unbounded spin-wait loops (`while (!flag) {}`) would make exploration
//! diverge: every iteration appends another read event observing the same
//! value. The detector counts read responses per `(thread, code location)`;
//! once the same code location has produced [`SPIN_BOUND`] consecutive
//! reads of the same memory location returning the same value, the engine
//! signals a cooperative switch so a writer can run. This bounds spinning
//! without affecting which executions are reachable.

use std::collections::HashMap;

use crate::label::CodeLocation;
use crate::location::MemoryLocation;
use crate::value::ValueId;
use crate::vv::ThreadId;

/// Identical-read threshold that triggers a switch signal.
pub const SPIN_BOUND: usize = 5;

#[derive(Debug, Default)]
struct SpinState {
    /// Consecutive reads of one (location, value) pair at this code location.
    streak: usize,
    last: Option<(MemoryLocation, ValueId)>,
}

/// Counts per-`(thread, code location)` read repetitions.
#[derive(Debug, Default)]
pub struct LoopDetector {
    states: HashMap<(ThreadId, CodeLocation), SpinState>,
    bound: usize,
}

impl LoopDetector {
    pub fn new() -> Self {
        Self::with_bound(SPIN_BOUND)
    }

    pub fn with_bound(bound: usize) -> Self {
        Self {
            states: HashMap::new(),
            bound,
        }
    }

    /// Record a read response. Returns true when the spin bound is hit and
    /// the engine should signal a switch.
    pub fn record_read(
        &mut self,
        thread: ThreadId,
        code_location: &CodeLocation,
        location: &MemoryLocation,
        value: ValueId,
    ) -> bool {
        let state = self
            .states
            .entry((thread, code_location.clone()))
            .or_default();
        let same = matches!(&state.last, Some((l, v)) if l == location && *v == value);
        if same {
            state.streak += 1;
        } else {
            state.last = Some((location.clone(), value));
            state.streak = 1;
        }
        state.streak >= self.bound
    }

    /// The (location, value) pair a thread has been re-reading at this code
    /// location, once the streak reached the bound. Used to stop offering
    /// same-value alternatives to a spinning read.
    pub fn hot_streak(
        &self,
        thread: ThreadId,
        code_location: &CodeLocation,
    ) -> Option<(MemoryLocation, ValueId)> {
        let state = self.states.get(&(thread, code_location.clone()))?;
        if state.streak >= self.bound {
            state.last.clone()
        } else {
            None
        }
    }

    /// Forget everything; called when a new exploration starts.
    pub fn reset(&mut self) {
        self.states.clear();
    }
}
