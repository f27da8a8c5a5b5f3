//! Replay of a stored execution order.
//!
//! Each exploration begins by replaying the target execution: a
//! precomputed total order over its events (id order, which is consistent
//! with causality) is consulted on every append. If the next entry belongs
//! to the calling thread, the stored event is handed back verbatim;
//! otherwise the engine signals a strategy switch so the scheduler can put
//! the right thread in the driver's seat.
//!
//! Replay is a list the engine consults per append, never a re-run with a
//! recorder. Divergence between what the program does and what the list
//! says is an internal invariant violation.

use crate::event::EventId;
use crate::vv::ThreadId;

#[derive(Debug, Default)]
pub struct Replayer {
    order: Vec<EventId>,
    pos: usize,
}

impl Replayer {
    /// A replayer over the given execution order.
    pub fn new(order: Vec<EventId>) -> Self {
        Self { order, pos: 0 }
    }

    /// An exhausted replayer (first exploration has nothing to replay).
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn in_progress(&self) -> bool {
        self.pos < self.order.len()
    }

    /// The next event to replay, if any.
    pub fn peek(&self) -> Option<EventId> {
        self.order.get(self.pos).copied()
    }

    pub fn advance(&mut self) -> Option<EventId> {
        let next = self.peek()?;
        self.pos += 1;
        Some(next)
    }

    /// True if any unreplayed event belongs to `thread`. Used to decide
    /// whether a thread must keep waiting its turn or may run ahead with
    /// fresh events.
    pub fn has_remaining_for(&self, thread: ThreadId, thread_of: impl Fn(EventId) -> ThreadId) -> bool {
        self.order[self.pos..]
            .iter()
            .any(|&e| thread_of(e) == thread)
    }

    pub fn remaining(&self) -> usize {
        self.order.len() - self.pos
    }
}
