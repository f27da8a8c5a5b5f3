//! The current execution: per-thread event sequences plus a memory-access
//! index.
//!
//! An execution is the subset of the event structure chosen for the run in
//! progress: for every thread a contiguous prefix of its events, closed
//! under dependencies. The memory-access index keeps, per location, the
//! ordered lists of read requests and writes, a cached last write, and
//! race-freedom flags that let the synchronization search shortcut the
//! common single-threaded-location case.
//!
//! The execution is append-only within one exploration; backtracking resets
//! it wholesale to a stored frontier and re-indexes the surviving events.

use std::collections::HashMap;

use crate::event::{EventArena, EventId};
use crate::frontier::Frontier;
use crate::label::EventLabel;
use crate::location::MemoryLocation;
use crate::vv::{ThreadId, VersionVec};

/// Per-location access lists and race caches.
#[derive(Clone, Debug, Default)]
pub struct LocationAccesses {
    read_requests: Vec<EventId>,
    writes: Vec<EventId>,
    last_write: Option<EventId>,
    accessor: Option<ThreadId>,
    multi_accessor: bool,
    writer: Option<ThreadId>,
    multi_writer: bool,
    reader_seen: bool,
}

impl LocationAccesses {
    fn record_read_request(&mut self, event: EventId, thread: ThreadId) {
        self.read_requests.push(event);
        self.reader_seen = true;
        self.track_accessor(thread);
    }

    fn record_write(&mut self, event: EventId, thread: ThreadId) {
        self.writes.push(event);
        self.last_write = Some(event);
        match self.writer {
            None => self.writer = Some(thread),
            Some(w) if w != thread => self.multi_writer = true,
            Some(_) => {}
        }
        self.track_accessor(thread);
    }

    fn track_accessor(&mut self, thread: ThreadId) {
        match self.accessor {
            None => self.accessor = Some(thread),
            Some(a) if a != thread => self.multi_accessor = true,
            Some(_) => {}
        }
    }
}

/// Per-thread ordered event sequences with the access index.
#[derive(Default)]
pub struct Execution {
    threads: Vec<Vec<EventId>>,
    index: HashMap<MemoryLocation, LocationAccesses>,
}

impl Execution {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event at its thread's current end. The event's position
    /// must be exactly the next slot (thread contiguity).
    pub fn append(&mut self, arena: &EventArena, event: EventId) {
        let e = arena.get(event);
        if e.thread >= self.threads.len() {
            self.threads.resize_with(e.thread + 1, Vec::new);
        }
        let seq = &mut self.threads[e.thread];
        assert_eq!(
            seq.len(),
            e.position,
            "event {} appended out of position on thread {}",
            event,
            e.thread
        );
        seq.push(event);
        self.index_event(arena, event);
    }

    fn index_event(&mut self, arena: &EventArena, event: EventId) {
        let e = arena.get(event);
        match &e.label {
            EventLabel::ReadRequest { location, .. } => {
                self.index
                    .entry(location.clone())
                    .or_default()
                    .record_read_request(event, e.thread);
            }
            EventLabel::Write { location, .. } => {
                self.index
                    .entry(location.clone())
                    .or_default()
                    .record_write(event, e.thread);
            }
            _ => {}
        }
    }

    pub fn thread_events(&self, thread: ThreadId) -> &[EventId] {
        self.threads.get(thread).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn event_at(&self, thread: ThreadId, position: usize) -> Option<EventId> {
        self.threads.get(thread)?.get(position).copied()
    }

    pub fn last_of(&self, thread: ThreadId) -> Option<EventId> {
        self.threads.get(thread)?.last().copied()
    }

    pub fn num_threads(&self) -> usize {
        self.threads.len()
    }

    pub fn len(&self) -> usize {
        self.threads.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if the event occupies its recorded slot in this execution.
    pub fn contains(&self, arena: &EventArena, event: EventId) -> bool {
        let e = arena.get(event);
        self.event_at(e.thread, e.position) == Some(event)
    }

    /// All events of the execution in id order (consistent with causality).
    pub fn events_in_order(&self) -> Vec<EventId> {
        let mut all: Vec<EventId> = self.threads.iter().flatten().copied().collect();
        all.sort_unstable();
        all
    }

    /// The response of a blocking request, if present. The execution
    /// invariant guarantees at most one.
    pub fn response_of(&self, arena: &EventArena, request: EventId) -> Option<EventId> {
        let req = arena.get(request);
        let next = self.event_at(req.thread, req.position + 1)?;
        let label = &arena.get(next).label;
        (req.label.responds_to(label)).then_some(next)
    }

    /// Current frontier: each thread's last event.
    pub fn frontier(&self, arena: &EventArena) -> Frontier {
        let mut f = Frontier::new();
        for seq in &self.threads {
            if let Some(&last) = seq.last() {
                f.update(arena, last);
            }
        }
        f
    }

    /// The frontier of the per-thread prefixes a clock describes.
    pub fn calculate_frontier(&self, clock: &VersionVec) -> Frontier {
        let mut f = Frontier::new();
        for (thread, seq) in self.threads.iter().enumerate() {
            let count = clock.get(thread) as usize;
            if count > 0 {
                if let Some(&event) = seq.get(count - 1) {
                    f.set(thread, Some(event));
                }
            }
        }
        f
    }

    /// Reset to the prefix described by `frontier`, discarding everything
    /// after it and rebuilding the access index from the survivors.
    pub fn reset_to_frontier(&mut self, arena: &EventArena, frontier: &Frontier) {
        self.threads.clear();
        self.index.clear();
        let mut events: Vec<EventId> = frontier
            .events()
            .into_iter()
            .flat_map(|e| arena.thread_prefix(e))
            .collect();
        events.sort_unstable();
        for event in events {
            self.append(arena, event);
        }
    }

    // ------------------------------------------------------------------
    // Memory-access index queries
    // ------------------------------------------------------------------

    pub fn read_requests(&self, location: &MemoryLocation) -> &[EventId] {
        self.index
            .get(location)
            .map(|a| a.read_requests.as_slice())
            .unwrap_or(&[])
    }

    pub fn writes(&self, location: &MemoryLocation) -> &[EventId] {
        self.index
            .get(location)
            .map(|a| a.writes.as_slice())
            .unwrap_or(&[])
    }

    pub fn last_write(&self, location: &MemoryLocation) -> Option<EventId> {
        self.index.get(location).and_then(|a| a.last_write)
    }

    /// At most one accessing thread so far: reads see the unique last write.
    pub fn is_race_free(&self, location: &MemoryLocation) -> bool {
        self.index
            .get(location)
            .map(|a| !a.multi_accessor)
            .unwrap_or(true)
    }

    /// No reader and at most one writer thread: a new write has nothing to
    /// synchronize with.
    pub fn is_read_write_race_free(&self, location: &MemoryLocation) -> bool {
        self.index
            .get(location)
            .map(|a| !a.reader_seen && !a.multi_writer)
            .unwrap_or(true)
    }
}
