//! Execution frontiers.
//!
//! A frontier maps each thread to its last included event in some
//! execution (or nothing, if the thread has no events). Frontiers are the
//! unit of rollback: a backtracking point stores the frontier to restore,
//! and cutting a frontier at a set of events removes those events and all
//! their causal successors from every thread.

use crate::event::{EventArena, EventId};
use crate::vv::{ThreadId, VersionVec};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Frontier {
    last: Vec<Option<EventId>>,
}

impl Frontier {
    pub fn new() -> Self {
        Self { last: Vec::new() }
    }

    pub fn get(&self, thread: ThreadId) -> Option<EventId> {
        self.last.get(thread).copied().flatten()
    }

    pub fn set(&mut self, thread: ThreadId, event: Option<EventId>) {
        if thread >= self.last.len() {
            self.last.resize(thread + 1, None);
        }
        self.last[thread] = event;
    }

    /// Advance the frontier of `event`'s thread to `event` if it extends
    /// the current entry.
    pub fn update(&mut self, arena: &EventArena, event: EventId) {
        let e = arena.get(event);
        match self.get(e.thread) {
            Some(cur) if arena.get(cur).position >= e.position => {}
            _ => self.set(e.thread, Some(event)),
        }
    }

    /// Thread ids with a frontier entry.
    pub fn threads(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.last
            .iter()
            .enumerate()
            .filter_map(|(t, e)| e.map(|_| t))
    }

    /// The frontier events themselves.
    pub fn events(&self) -> Vec<EventId> {
        self.last.iter().filter_map(|e| *e).collect()
    }

    /// True if `event` is in the per-thread prefix this frontier describes.
    pub fn contains(&self, arena: &EventArena, event: EventId) -> bool {
        let e = arena.get(event);
        match self.get(e.thread) {
            Some(entry) => arena.thread_ancestor(entry, e.position) == Some(event),
            None => false,
        }
    }

    pub fn contains_all(&self, arena: &EventArena, events: &[EventId]) -> bool {
        events.iter().all(|&e| self.contains(arena, e))
    }

    /// Remove `cut_events` and every causal successor of any of them from
    /// all threads, walking each entry back along its parent chain.
    pub fn cut(&mut self, arena: &EventArena, cut_events: &[EventId]) {
        if cut_events.is_empty() {
            return;
        }
        for slot in self.last.iter_mut() {
            let mut current = *slot;
            while let Some(id) = current {
                let tainted = cut_events
                    .iter()
                    .any(|&c| arena.causally_precedes_or_equal(c, id));
                if !tainted {
                    break;
                }
                current = arena.get(id).parent;
            }
            *slot = current;
        }
    }

    /// Walk one thread's entry back until its position drops below
    /// `position`. Removes the slot at `position` and everything after it.
    pub fn cut_thread_at(&mut self, arena: &EventArena, thread: ThreadId, position: usize) {
        let mut current = self.get(thread);
        while let Some(id) = current {
            if arena.get(id).position < position {
                break;
            }
            current = arena.get(id).parent;
        }
        self.set(thread, current);
    }

    /// Point-wise later-of merge. Entries of the same thread are assumed to
    /// lie on one parent chain, so the higher position wins.
    pub fn merge(&mut self, arena: &EventArena, other: &Frontier) {
        for thread in other.threads() {
            let theirs = other.get(thread).expect("thread came from iterator");
            match self.get(thread) {
                Some(ours) if arena.get(ours).position >= arena.get(theirs).position => {}
                _ => self.set(thread, Some(theirs)),
            }
        }
    }

    /// Frontier entries that are blocking requests (no response can follow
    /// a frontier entry by definition).
    pub fn dangling_requests(&self, arena: &EventArena) -> Vec<EventId> {
        let mut requests: Vec<EventId> = self
            .last
            .iter()
            .filter_map(|e| *e)
            .filter(|&e| {
                let label = &arena.get(e).label;
                label.is_request() && label.is_blocking()
            })
            .collect();
        requests.sort_unstable();
        requests
    }

    /// The clock covering exactly the per-thread prefixes of this frontier.
    pub fn clock(&self, arena: &EventArena) -> VersionVec {
        let mut clock = VersionVec::new();
        for event in self.events() {
            let e = arena.get(event);
            clock.observe(e.thread, e.position);
        }
        clock
    }
}
