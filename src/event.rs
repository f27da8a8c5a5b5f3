//! Atomic thread events and the event arena.
//!
//! An event is one observable action of a thread, recorded as an immutable
//! node: its label, its thread-local parent, the cross-thread dependencies
//! it synchronized with, and a precomputed causality clock. Events are
//! totally ordered by a monotonically increasing id and never mutated.
//!
//! Parent and dependency links are stored as ids and resolved through the
//! [`EventArena`] (a flat `Vec` keyed by id), so the event structure is a
//! DAG without owned graph nodes and cycles are impossible by construction:
//! every link points strictly downward in id order.

use smallvec::SmallVec;

use crate::label::EventLabel;
use crate::vv::{ThreadId, VersionVec};

/// Globally unique event identifier; also the index into the arena.
pub type EventId = usize;

/// One immutable node of the event structure.
#[derive(Clone, Debug)]
pub struct Event {
    pub id: EventId,
    pub thread: ThreadId,
    /// Index of this event in its thread's sequence.
    pub position: usize,
    pub label: EventLabel,
    /// Thread-local predecessor; absent only for the root.
    pub parent: Option<EventId>,
    /// Events this one synchronized with (e.g. the write a read reads from).
    pub dependencies: SmallVec<[EventId; 2]>,
    /// Allocation event of the accessed object, if tracked.
    pub allocation: Option<EventId>,
    /// For read responses, the write supplying the value.
    pub source: Option<EventId>,
    /// Pointwise maximum of parent and dependency clocks, with this event's
    /// own slot set.
    pub clock: VersionVec,
}

/// Flat storage of all events created during a run, keyed by id.
#[derive(Default)]
pub struct EventArena {
    events: Vec<Event>,
}

impl EventArena {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn get(&self, id: EventId) -> &Event {
        &self.events[id]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }

    /// Create an event with a fresh id. Computes the causality clock from
    /// the parent and dependencies.
    pub fn push(
        &mut self,
        thread: ThreadId,
        label: EventLabel,
        parent: Option<EventId>,
        dependencies: SmallVec<[EventId; 2]>,
        allocation: Option<EventId>,
        source: Option<EventId>,
    ) -> EventId {
        let id = self.events.len();
        let position = match parent {
            Some(p) => {
                let parent_event = &self.events[p];
                debug_assert_eq!(parent_event.thread, thread, "parent on another thread");
                parent_event.position + 1
            }
            None => 0,
        };
        debug_assert!(
            parent.iter().chain(dependencies.iter()).all(|&d| d < id),
            "links must point to earlier events"
        );

        let mut clock = VersionVec::new();
        if let Some(p) = parent {
            clock.join(&self.events[p].clock);
        }
        for &d in &dependencies {
            clock.join(&self.events[d].clock);
        }
        clock.observe(thread, position);

        self.events.push(Event {
            id,
            thread,
            position,
            label,
            parent,
            dependencies,
            allocation,
            source,
            clock,
        });
        id
    }

    /// Discard every event with id >= `len`. Used on backtracking.
    pub fn truncate(&mut self, len: usize) {
        self.events.truncate(len);
    }

    /// True if `a` is in the causal past of `b` (strictly).
    pub fn causally_precedes(&self, a: EventId, b: EventId) -> bool {
        if a == b {
            return false;
        }
        let ea = &self.events[a];
        self.events[b].clock.covers(ea.thread, ea.position)
    }

    /// True if `a` equals `b` or precedes it causally.
    pub fn causally_precedes_or_equal(&self, a: EventId, b: EventId) -> bool {
        a == b || self.causally_precedes(a, b)
    }

    /// Walk `from`'s parent chain down to the event at `position` on the
    /// same thread. Returns `None` if `position` exceeds `from`'s position.
    pub fn thread_ancestor(&self, from: EventId, position: usize) -> Option<EventId> {
        let mut current = from;
        loop {
            let e = &self.events[current];
            if e.position == position {
                return Some(current);
            }
            if e.position < position {
                return None;
            }
            current = e.parent?;
        }
    }

    /// The parent chain of `from`, root-most first, including `from`.
    pub fn thread_prefix(&self, from: EventId) -> Vec<EventId> {
        let mut chain = Vec::with_capacity(self.events[from].position + 1);
        let mut current = Some(from);
        while let Some(id) = current {
            chain.push(id);
            current = self.events[id].parent;
        }
        chain.reverse();
        chain
    }
}
