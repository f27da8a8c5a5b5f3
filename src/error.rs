//! Failures and the pluggable consistency checker.
//!
//! Every error kind that aborts an exploration is a [`Failure`]. The
//! driver records the failing schedule and moves on to the next
//! backtracking point unless configured fail-fast. Causality violations
//! are *not* failures: event creation returns `None` and the alternative
//! simply does not exist. Internal invariant violations (replay
//! divergence, protocol misuse) are bugs and panic.

use std::time::Duration;

use thiserror::Error;

use crate::event::EventArena;
use crate::execution::Execution;
use crate::vv::ThreadId;

/// A memory-model or synchronization-algebra violation detected in the
/// current execution.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("inconsistent execution: {reason}")]
pub struct Inconsistency {
    pub reason: String,
}

impl Inconsistency {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Inspects the current execution and reports an inconsistency, if any.
/// Plugged into the engine; a non-null result is a hard failure for the
/// current schedule.
pub trait ConsistencyChecker {
    fn check(&self, arena: &EventArena, execution: &Execution) -> Option<Inconsistency>;
}

/// A failure that aborts the current exploration.
#[derive(Debug, Error)]
pub enum Failure {
    #[error(transparent)]
    Inconsistency(#[from] Inconsistency),

    #[error("unexpected exception in actor {actor}: {message}")]
    UnexpectedException { actor: usize, message: String },

    #[error("timed out after {elapsed:?}")]
    Timeout { elapsed: Duration },

    #[error("deadlock: threads {blocked_threads:?} are blocked with no unblocking response")]
    Deadlock { blocked_threads: Vec<ThreadId> },

    #[error("incorrect result: {message}")]
    IncorrectResult { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_messages() {
        let f = Failure::Deadlock {
            blocked_threads: vec![1, 2],
        };
        assert!(f.to_string().contains("deadlock"));

        let f = Failure::UnexpectedException {
            actor: 3,
            message: "boom".into(),
        };
        assert!(f.to_string().contains("actor 3"));

        let f = Failure::from(Inconsistency::new("read from overwritten write"));
        assert!(f.to_string().contains("overwritten"));
    }
}
