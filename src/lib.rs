//! Event-structure bounded model checker for shared-memory concurrent
//! programs.
//!
//! Given a test harness that runs a fixed set of threads over shared
//! memory, the engine systematically explores executions under a relaxed
//! memory model and reports any that violate user-supplied correctness
//! properties (invariants, absence of deadlocks, unexpected failures).
//!
//! The exploration is driven by an event structure: every intercepted
//! action becomes an immutable event, blocking actions split into
//! request/response pairs joined by a synchronization algebra, and each
//! alternative synchronization becomes a backtracking point for a DFS over
//! executions. See [`engine::EventStructureEngine`] for the core and
//! [`harness::explore`] for the high-level checking API.

pub mod engine;
pub mod error;
pub mod event;
pub mod execution;
pub mod executor;
pub mod frontier;
pub mod harness;
pub mod label;
pub mod location;
pub mod replay;
pub mod spin;
pub mod value;
pub mod vv;

pub use engine::{BacktrackingPoint, EngineAction, EngineContext, EventStructureEngine};
pub use error::{ConsistencyChecker, Failure, Inconsistency};
pub use event::{Event, EventArena, EventId};
pub use execution::Execution;
pub use executor::{FixedActiveThreadsExecutor, Task};
pub use frontier::Frontier;
pub use harness::{explore, CheckConfig, ExplorationResult, FinalState, Op, Operand, Program};
pub use label::{synchronize, ActorId, CodeLocation, EventLabel, SwitchReason, SyncType};
pub use location::{MemoryLocation, MemoryStore, StoreError};
pub use replay::Replayer;
pub use spin::{LoopDetector, SPIN_BOUND};
pub use value::{
    ObjectId, ObjectRef, ObjectRegistry, PrimitiveValue, ValueId, INVALID_OBJECT_ID,
    NULL_OBJECT_ID, STATIC_OBJECT_ID,
};
pub use vv::{ThreadId, VersionVec};
