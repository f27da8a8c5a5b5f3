//! Event labels and the synchronization algebra.
//!
//! A label is the typed payload of an event: the kind of action plus its
//! operands. Blocking and interacting actions are split into two phases,
//! a *request* recording the intent and a *response* synthesized by
//! synchronizing the request with a *send* from another thread (e.g. a
//! write responds to a read request). One-shot actions have no phase.
//!
//! The synchronization algebra is a single partial binary operator on
//! labels, totally determined by the label kinds: [`synchronize`] pattern
//! matches both operands and returns the response label when the pair is
//! defined. Join is the only barrier synchronization: finish labels fold
//! into the join request one by one until its thread set empties.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::location::MemoryLocation;
use crate::value::{ObjectId, ValueId};
use crate::vv::ThreadId;

/// Actor index within a thread's scenario.
pub type ActorId = usize;

/// Source token of an intercepted operation.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CodeLocation {
    pub file: Arc<str>,
    pub class: Arc<str>,
    pub method: Arc<str>,
    pub line: u32,
}

impl CodeLocation {
    pub fn new(file: &str, class: &str, method: &str, line: u32) -> Self {
        Self {
            file: Arc::from(file),
            class: Arc::from(class),
            method: Arc::from(method),
            line,
        }
    }
}

impl std::fmt::Display for CodeLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}({}:{})", self.class, self.method, self.file, self.line)
    }
}

/// How a label participates in synchronization.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncType {
    /// Never synchronizes.
    None,
    /// One send and one request produce the response.
    Binary,
    /// Multiple sends fold into one response (thread join).
    Barrier,
}

/// Reasons the engine asks the scheduler for a thread switch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwitchReason {
    /// Replay discipline: another thread must run first.
    StrategySwitch,
    /// A spin loop hit the bound; give the writers a chance.
    SpinBound,
}

/// The typed payload of one event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventLabel {
    /// Root of the event structure. Implicitly writes the initial value of
    /// every memory location (supplied by the engine's memory initializer).
    Initialization {
        init_thread: ThreadId,
        main_thread: ThreadId,
    },

    ObjectAllocation {
        object: ObjectId,
        class: Arc<str>,
    },

    ReadRequest {
        location: MemoryLocation,
        exclusive: bool,
        code_location: CodeLocation,
    },
    ReadResponse {
        location: MemoryLocation,
        value: ValueId,
        exclusive: bool,
        code_location: CodeLocation,
    },
    Write {
        location: MemoryLocation,
        value: ValueId,
        exclusive: bool,
        code_location: CodeLocation,
    },

    LockRequest {
        mutex: ObjectId,
        reentry: bool,
        depth: u32,
        synthetic: bool,
    },
    LockResponse {
        mutex: ObjectId,
        reentry: bool,
        depth: u32,
        synthetic: bool,
    },
    Unlock {
        mutex: ObjectId,
        reentry: bool,
        depth: u32,
        synthetic: bool,
    },

    WaitRequest {
        mutex: ObjectId,
    },
    WaitResponse {
        mutex: ObjectId,
    },
    Notify {
        mutex: ObjectId,
        broadcast: bool,
    },

    ParkRequest {
        thread: ThreadId,
    },
    ParkResponse {
        thread: ThreadId,
    },
    /// Unpark of the given (parked or about-to-park) thread.
    Unpark {
        target: ThreadId,
    },

    ThreadStartRequest {
        thread: ThreadId,
    },
    ThreadStartResponse {
        thread: ThreadId,
    },
    ThreadFinish {
        thread: ThreadId,
    },
    ThreadFork {
        threads: BTreeSet<ThreadId>,
    },
    /// `threads` is the set still awaited; it shrinks as finish labels fold in.
    ThreadJoinRequest {
        threads: BTreeSet<ThreadId>,
    },
    ThreadJoinResponse,

    SuspendRequest {
        thread: ThreadId,
        actor: ActorId,
        prompt_cancellation: bool,
    },
    SuspendResponse {
        thread: ThreadId,
        actor: ActorId,
        cancelled: bool,
    },
    /// Resumption of a suspended (thread, actor) pair, performed by another
    /// thread.
    CoroutineResume {
        thread: ThreadId,
        actor: ActorId,
    },

    ActorStart {
        thread: ThreadId,
        actor: ActorId,
    },
    ActorEnd {
        thread: ThreadId,
        actor: ActorId,
    },

    Random {
        value: u64,
    },
}

impl EventLabel {
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            EventLabel::ReadRequest { .. }
                | EventLabel::LockRequest { .. }
                | EventLabel::WaitRequest { .. }
                | EventLabel::ParkRequest { .. }
                | EventLabel::ThreadStartRequest { .. }
                | EventLabel::ThreadJoinRequest { .. }
                | EventLabel::SuspendRequest { .. }
        )
    }

    pub fn is_response(&self) -> bool {
        matches!(
            self,
            EventLabel::ReadResponse { .. }
                | EventLabel::LockResponse { .. }
                | EventLabel::WaitResponse { .. }
                | EventLabel::ParkResponse { .. }
                | EventLabel::ThreadStartResponse { .. }
                | EventLabel::ThreadJoinResponse
                | EventLabel::SuspendResponse { .. }
        )
    }

    pub fn is_send(&self) -> bool {
        matches!(
            self,
            EventLabel::Initialization { .. }
                | EventLabel::ObjectAllocation { .. }
                | EventLabel::Write { .. }
                | EventLabel::Unlock { .. }
                | EventLabel::Notify { .. }
                | EventLabel::Unpark { .. }
                | EventLabel::ThreadFinish { .. }
                | EventLabel::ThreadFork { .. }
                | EventLabel::CoroutineResume { .. }
        )
    }

    /// Requests whose response may be unavailable until another thread acts.
    /// A read request is not blocking: initialization always supplies a value.
    pub fn is_blocking(&self) -> bool {
        matches!(
            self,
            EventLabel::LockRequest { .. }
                | EventLabel::WaitRequest { .. }
                | EventLabel::ParkRequest { .. }
                | EventLabel::ThreadStartRequest { .. }
                | EventLabel::ThreadJoinRequest { .. }
                | EventLabel::SuspendRequest { .. }
        )
    }

    pub fn sync_type(&self) -> SyncType {
        match self {
            EventLabel::ThreadFinish { .. }
            | EventLabel::ThreadJoinRequest { .. }
            | EventLabel::ThreadJoinResponse => SyncType::Barrier,
            _ if self.is_send() || self.is_request() || self.is_response() => SyncType::Binary,
            _ => SyncType::None,
        }
    }

    /// The memory location this label touches, if any.
    pub fn location(&self) -> Option<&MemoryLocation> {
        match self {
            EventLabel::ReadRequest { location, .. }
            | EventLabel::ReadResponse { location, .. }
            | EventLabel::Write { location, .. } => Some(location),
            _ => None,
        }
    }

    /// The mutex this label operates on, if any.
    pub fn mutex(&self) -> Option<ObjectId> {
        match self {
            EventLabel::LockRequest { mutex, .. }
            | EventLabel::LockResponse { mutex, .. }
            | EventLabel::Unlock { mutex, .. }
            | EventLabel::WaitRequest { mutex }
            | EventLabel::WaitResponse { mutex }
            | EventLabel::Notify { mutex, .. } => Some(*mutex),
            _ => None,
        }
    }

    /// The value a read response observed or a write stores.
    pub fn value(&self) -> Option<ValueId> {
        match self {
            EventLabel::ReadResponse { value, .. } | EventLabel::Write { value, .. } => {
                Some(*value)
            }
            _ => None,
        }
    }

    pub fn code_location(&self) -> Option<&CodeLocation> {
        match self {
            EventLabel::ReadRequest { code_location, .. }
            | EventLabel::ReadResponse { code_location, .. }
            | EventLabel::Write { code_location, .. } => Some(code_location),
            _ => None,
        }
    }

    /// True if `response` is the response phase of this request label.
    pub fn responds_to(&self, response: &EventLabel) -> bool {
        match (self, response) {
            (
                EventLabel::ReadRequest { location: l1, .. },
                EventLabel::ReadResponse { location: l2, .. },
            ) => l1 == l2,
            (
                EventLabel::LockRequest { mutex: m1, .. },
                EventLabel::LockResponse { mutex: m2, .. },
            ) => m1 == m2,
            (EventLabel::WaitRequest { mutex: m1 }, EventLabel::WaitResponse { mutex: m2 }) => {
                m1 == m2
            }
            (EventLabel::ParkRequest { thread: t1 }, EventLabel::ParkResponse { thread: t2 }) => {
                t1 == t2
            }
            (
                EventLabel::ThreadStartRequest { thread: t1 },
                EventLabel::ThreadStartResponse { thread: t2 },
            ) => t1 == t2,
            (EventLabel::ThreadJoinRequest { .. }, EventLabel::ThreadJoinResponse) => true,
            (
                EventLabel::SuspendRequest {
                    thread: t1,
                    actor: a1,
                    ..
                },
                EventLabel::SuspendResponse {
                    thread: t2,
                    actor: a2,
                    ..
                },
            ) => t1 == t2 && a1 == a2,
            _ => false,
        }
    }
}

/// The synchronization algebra: `send ⊕ request`.
///
/// Returns the response label when the pair is defined, `None` otherwise.
/// For the join barrier the result may itself still be a request (the
/// awaited set shrank but is not yet empty); the engine folds further
/// finish labels into it and only emits a response once the set empties.
///
/// `Initialization` acts as the first write of every location; the engine
/// substitutes the initializer value when it builds the read response, so
/// the algebra itself only decides that the pair is defined (see
/// `EventStructureEngine::response_label_for`). A prompt-cancellable
/// suspend request synchronizes with the root to model cancellation.
pub fn synchronize(send: &EventLabel, request: &EventLabel) -> Option<EventLabel> {
    use EventLabel::*;
    match (send, request) {
        (
            Write {
                location: wl,
                value,
                ..
            },
            ReadRequest {
                location: rl,
                exclusive,
                code_location,
            },
        ) if wl == rl => Some(ReadResponse {
            location: rl.clone(),
            value: *value,
            exclusive: *exclusive,
            code_location: code_location.clone(),
        }),

        // Reentrant phases stay out of the algebra: a reentrant unlock does
        // not release the mutex, and a reentrant request synchronizes with
        // the mutex's allocation event instead.
        (
            Unlock {
                mutex: m1,
                reentry: false,
                ..
            },
            LockRequest {
                mutex: m2,
                reentry: false,
                depth,
                synthetic,
            },
        ) if m1 == m2 => Some(LockResponse {
            mutex: *m2,
            reentry: false,
            depth: *depth,
            synthetic: *synthetic,
        }),

        (Notify { mutex: m1, .. }, WaitRequest { mutex: m2 }) if m1 == m2 => {
            Some(WaitResponse { mutex: *m2 })
        }

        (Unpark { target }, ParkRequest { thread }) if target == thread => {
            Some(ParkResponse { thread: *thread })
        }

        (ThreadFinish { thread }, ThreadJoinRequest { threads }) if threads.contains(thread) => {
            let mut rest = threads.clone();
            rest.remove(thread);
            if rest.is_empty() {
                Some(ThreadJoinResponse)
            } else {
                Some(ThreadJoinRequest { threads: rest })
            }
        }

        (ThreadFork { threads }, ThreadStartRequest { thread }) if threads.contains(thread) => {
            Some(ThreadStartResponse { thread: *thread })
        }

        (
            CoroutineResume {
                thread: t1,
                actor: a1,
            },
            SuspendRequest {
                thread: t2,
                actor: a2,
                ..
            },
        ) if t1 == t2 && a1 == a2 => Some(SuspendResponse {
            thread: *t2,
            actor: *a2,
            cancelled: false,
        }),

        (
            Initialization { .. },
            SuspendRequest {
                thread,
                actor,
                prompt_cancellation: true,
            },
        ) => Some(SuspendResponse {
            thread: *thread,
            actor: *actor,
            cancelled: true,
        }),

        _ => None,
    }
}
