//! The event-structure exploration engine.
//!
//! The engine incrementally builds an event structure: a partial order of
//! thread-local actions plus the synchronizations between them. Appending a
//! send event searches the current execution for requests it can
//! synchronize with; every response produced this way becomes a
//! *backtracking point*, a deferred alternative with enough state to
//! resume exploration from that choice. The backtracking stack is ordered
//! by event id, so newer alternatives are explored first and the whole
//! exploration is a DFS over alternative synchronizations.
//!
//! Each exploration starts with a replay phase: the target execution's
//! events are handed back verbatim in a stored total order, and the engine
//! signals a strategy switch whenever the wrong thread calls in. Events
//! appended after the replay ends are genuinely new and trigger the
//! synchronization search.
//!
//! All mutable state is owned by the engine and driven through the
//! interception entry points (`on_shared_read`, `on_lock_acquire`, ...).
//! Outward dependencies (the switch advisor, the inconsistency reporter,
//! the memory initializer) are injected through [`EngineContext`]; there
//! are no process-global singletons.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use smallvec::{smallvec, SmallVec};
use tracing::{debug, trace};

use crate::error::{ConsistencyChecker, Inconsistency};
use crate::event::{Event, EventArena, EventId};
use crate::execution::Execution;
use crate::frontier::Frontier;
use crate::label::{synchronize, ActorId, CodeLocation, EventLabel, SwitchReason, SyncType};
use crate::location::MemoryLocation;
use crate::replay::Replayer;
use crate::spin::LoopDetector;
use crate::value::{ObjectId, ObjectRef, ObjectRegistry, ValueId};
use crate::vv::{ThreadId, VersionVec};

/// Outward callbacks, injected at construction. `Send` so the engine can
/// sit behind the schedule lock the worker pool's threads contend on.
pub struct EngineContext {
    /// Advises the strategy that `thread` should yield for `reason`.
    pub switch: Box<dyn FnMut(ThreadId, SwitchReason) + Send>,
    /// Receives every inconsistency the checker reports.
    pub report_inconsistency: Box<dyn FnMut(&Inconsistency) + Send>,
    /// Supplies the initial value of a location never written.
    pub memory_initializer: Box<dyn Fn(&MemoryLocation) -> ValueId + Send>,
}

impl Default for EngineContext {
    fn default() -> Self {
        Self {
            switch: Box::new(|_, _| {}),
            report_inconsistency: Box::new(|_| {}),
            memory_initializer: Box::new(|_| ValueId::Null),
        }
    }
}

impl EngineContext {
    pub fn with_memory_initializer(
        mut self,
        init: impl Fn(&MemoryLocation) -> ValueId + Send + 'static,
    ) -> Self {
        self.memory_initializer = Box::new(init);
        self
    }

    pub fn with_switch_callback(
        mut self,
        switch: impl FnMut(ThreadId, SwitchReason) + Send + 'static,
    ) -> Self {
        self.switch = Box::new(switch);
        self
    }
}

/// What an interception entry point asks the caller to do.
#[derive(Debug, PartialEq, Eq)]
pub enum EngineAction<T> {
    /// The operation completed with this result.
    Ready(T),
    /// The operation did not happen; run another thread, then retry.
    Switch(SwitchReason),
    /// The operation is a dangling request; deschedule the thread until the
    /// engine reports it unblocked.
    Blocked,
}

/// A deferred alternative response, with enough state to resume
/// exploration from that choice.
pub struct BacktrackingPoint {
    pub event: EventId,
    frontier: Frontier,
    pinned: Frontier,
    blocked_requests: Vec<EventId>,
    visited: bool,
}

/// Result of appending an event under the replay discipline.
enum Appended {
    Replayed(EventId),
    Fresh(EventId),
    Switch,
}

/// Outcome of driving the response step of a request.
enum ResponseOutcome {
    Appended(EventId),
    /// Replay will supply the response once its dependencies are played.
    NoResponseYet,
    /// The request is dangling; the thread must be descheduled.
    Blocked,
}

pub struct EventStructureEngine {
    arena: EventArena,
    execution: Execution,
    /// Frontier of the current execution.
    frontier: Frontier,
    /// Frontier of the replayed prefix.
    played_frontier: Frontier,
    /// Events committed to the current subtree; excluded from
    /// re-synchronization.
    pinned: Frontier,
    /// DFS stack, ordered by event id.
    backtracking: Vec<BacktrackingPoint>,
    /// Blocked dangling requests, each with its chosen unblocking response
    /// once one exists.
    dangling: BTreeMap<EventId, Option<EventId>>,
    replayer: Replayer,
    detector: LoopDetector,
    /// Sends appended by run-ahead threads while replay is in progress;
    /// their synchronization search runs when replay ends.
    deferred: Vec<EventId>,
    registry: ObjectRegistry,
    checker: Option<Box<dyn ConsistencyChecker + Send>>,
    ctx: EngineContext,
    root: EventId,
    /// Reentrancy depth per (thread, mutex).
    lock_depth: HashMap<(ThreadId, ObjectId), u32>,
    /// Pending advisory switch (spin bound), consumed by the scheduler.
    requested_switch: Option<(ThreadId, SwitchReason)>,
    points_created: usize,
    points_visited: usize,
}

impl EventStructureEngine {
    pub fn new(main_thread: ThreadId, ctx: EngineContext) -> Self {
        let mut arena = EventArena::new();
        let root = arena.push(
            main_thread,
            EventLabel::Initialization {
                init_thread: main_thread,
                main_thread,
            },
            None,
            smallvec![],
            None,
            None,
        );
        let mut execution = Execution::new();
        execution.append(&arena, root);
        let frontier = execution.frontier(&arena);
        Self {
            arena,
            execution,
            played_frontier: frontier.clone(),
            frontier,
            pinned: Frontier::new(),
            backtracking: Vec::new(),
            dangling: BTreeMap::new(),
            replayer: Replayer::empty(),
            detector: LoopDetector::new(),
            deferred: Vec::new(),
            registry: ObjectRegistry::new(),
            checker: None,
            ctx,
            root,
            lock_depth: HashMap::new(),
            requested_switch: None,
            points_created: 0,
            points_visited: 0,
        }
    }

    pub fn set_checker(&mut self, checker: Box<dyn ConsistencyChecker + Send>) {
        self.checker = Some(checker);
    }

    /// Lower the spin bound (useful in tests; the default is
    /// [`crate::spin::SPIN_BOUND`]).
    pub fn set_spin_bound(&mut self, bound: usize) {
        self.detector = LoopDetector::with_bound(bound);
    }

    pub fn root(&self) -> EventId {
        self.root
    }

    pub fn execution(&self) -> &Execution {
        &self.execution
    }

    pub fn arena(&self) -> &EventArena {
        &self.arena
    }

    /// Register an object created before the test started. It keeps its id
    /// across explorations and allocates from the root event.
    pub fn register_external_object(&mut self, value: ObjectRef) -> ObjectId {
        self.registry.register_external(value, self.root)
    }

    pub fn backtracking_points_created(&self) -> usize {
        self.points_created
    }

    pub fn backtracking_points_visited(&self) -> usize {
        self.points_visited
    }

    pub fn unvisited_points(&self) -> usize {
        self.backtracking.iter().filter(|p| !p.visited).count()
    }

    // ==================================================================
    // Public exploration contract
    // ==================================================================

    /// Pop the newest unvisited backtracking point, reset the execution to
    /// its stored frontier, restore its pinned events and blocked requests,
    /// and mark it visited. Returns false when no unvisited point remains.
    pub fn start_next_exploration(&mut self) -> bool {
        loop {
            let Some(point) = self.backtracking.pop() else {
                return false;
            };
            if point.visited {
                continue;
            }
            debug!(event = point.event, "backtracking to alternative");
            self.reset_to(point);
            return true;
        }
    }

    fn reset_to(&mut self, point: BacktrackingPoint) {
        self.points_visited += 1;
        self.arena.truncate(point.event + 1);
        self.frontier = point.frontier;
        self.pinned = point.pinned;
        self.execution.reset_to_frontier(&self.arena, &self.frontier);
        self.execution.append(&self.arena, point.event);
        self.frontier.update(&self.arena, point.event);

        self.dangling = point
            .blocked_requests
            .iter()
            .filter(|&&r| r < self.arena.len() && self.execution.contains(&self.arena, r))
            .map(|&r| (r, None))
            .collect();
        // The chosen event may itself answer one of the blocked requests.
        let chosen = self.arena.get(point.event);
        if chosen.label.is_response() {
            if let Some(parent) = chosen.parent {
                self.dangling.remove(&parent);
            }
        }

        // Live objects are per-run; replay re-registers them under their
        // original ids.
        self.registry.retain(|e| e.external);
        self.deferred.clear();
    }

    /// Reset the played frontier to the root and prime the replayer with
    /// the current execution's order.
    pub fn initialize_exploration(&mut self) {
        self.played_frontier = Frontier::new();
        self.played_frontier.update(&self.arena, self.root);
        self.replayer = Replayer::new(self.execution.events_in_order());
        let first = self.replayer.advance();
        debug_assert_eq!(first, Some(self.root), "the root replays first");
        self.detector.reset();
        self.requested_switch = None;
        self.lock_depth.clear();
        self.deferred.clear();
    }

    /// Truncate the execution to the replayed prefix. Responses of blocked
    /// frontier requests whose dependencies were all replayed are kept, so
    /// uniqueness checks keep seeing them.
    pub fn abort_exploration(&mut self) {
        let played = self.played_frontier.clone();
        // Gather, before truncation, the responses of blocking requests at
        // the played frontier.
        let mut kept: Vec<EventId> = Vec::new();
        for request in played.dangling_requests(&self.arena) {
            if let Some(response) = self.execution.response_of(&self.arena, request) {
                let deps_played = self
                    .arena
                    .get(response)
                    .dependencies
                    .iter()
                    .all(|&d| played.contains(&self.arena, d));
                if deps_played {
                    kept.push(response);
                }
            }
        }
        self.execution.reset_to_frontier(&self.arena, &played);
        self.frontier = played;
        for response in kept {
            self.execution.append(&self.arena, response);
            self.frontier.update(&self.arena, response);
        }
        self.replayer = Replayer::empty();
        self.deferred.clear();
    }

    /// Run the plugged-in consistency checker over the current execution.
    pub fn check_consistency(&mut self) -> Option<Inconsistency> {
        let inconsistency = self
            .checker
            .as_ref()
            .and_then(|c| c.check(&self.arena, &self.execution));
        if let Some(ref inc) = inconsistency {
            (self.ctx.report_inconsistency)(inc);
        }
        inconsistency
    }

    // ==================================================================
    // Scheduling support
    // ==================================================================

    /// The thread the replayer expects next, if replay is in progress.
    pub fn replay_next_thread(&self) -> Option<ThreadId> {
        self.replayer.peek().map(|e| self.arena.get(e).thread)
    }

    /// Consume a pending advisory switch (spin bound).
    pub fn take_requested_switch(&mut self) -> Option<(ThreadId, SwitchReason)> {
        self.requested_switch.take()
    }

    /// True if the thread sits on a dangling blocking request with no
    /// recorded unblocking response and no replay events left for it.
    pub fn blocked_awaiting(&self, thread: ThreadId) -> bool {
        let Some(last) = self.frontier.get(thread) else {
            return false;
        };
        let label = &self.arena.get(last).label;
        if !(label.is_request() && label.is_blocking()) {
            return false;
        }
        let arena = &self.arena;
        if self.replayer.has_remaining_for(thread, |e| arena.get(e).thread) {
            return false;
        }
        !matches!(self.dangling.get(&last), Some(Some(_)))
    }

    /// True if a previously blocked thread has an unblocking response
    /// recorded and can be rescheduled.
    pub fn is_unblocked(&self, thread: ThreadId) -> bool {
        match self.frontier.get(thread) {
            Some(last) => matches!(self.dangling.get(&last), Some(Some(_))),
            None => false,
        }
    }

    // ==================================================================
    // Event creation
    // ==================================================================

    /// Events of the current execution this prospective event conflicts
    /// with: the occupant of its (thread, position) slot, plus the
    /// label-specific mutual-exclusion conflicts.
    fn conflicts_for(
        &self,
        thread: ThreadId,
        parent: Option<EventId>,
        label: &EventLabel,
        dependencies: &[EventId],
    ) -> Vec<EventId> {
        let position = parent.map(|p| self.arena.get(p).position + 1).unwrap_or(0);
        let mut conflicts = Vec::new();
        if let Some(existing) = self.execution.event_at(thread, position) {
            conflicts.push(existing);
        }
        match label {
            // Mutual exclusion: each unlock (or allocation) token admits
            // one lock response. Reentrant responses consume no token.
            EventLabel::LockResponse { reentry: false, .. } => {
                if let Some(&source) = dependencies.first() {
                    for &other in &self.execution.events_in_order() {
                        let e = self.arena.get(other);
                        if matches!(
                            e.label,
                            EventLabel::LockResponse { reentry: false, .. }
                        ) && e.dependencies.contains(&source)
                        {
                            conflicts.push(other);
                        }
                    }
                }
            }
            // A non-broadcast notify wakes one waiter per execution.
            EventLabel::WaitResponse { .. } => {
                if let Some(&source) = dependencies.first() {
                    let broadcast = matches!(
                        self.arena.get(source).label,
                        EventLabel::Notify {
                            broadcast: true,
                            ..
                        }
                    );
                    if !broadcast {
                        for &other in &self.execution.events_in_order() {
                            let e = self.arena.get(other);
                            if matches!(e.label, EventLabel::WaitResponse { .. })
                                && e.dependencies.contains(&source)
                            {
                                conflicts.push(other);
                            }
                        }
                    }
                }
            }
            _ => {}
        }
        conflicts.sort_unstable();
        conflicts.dedup();
        conflicts
    }

    /// Create an event. Returns `None` on a causality violation: the
    /// prospective event has a conflict in the causal past of its parent or
    /// a dependency, so it is impossible in this execution.
    fn create_event(
        &mut self,
        thread: ThreadId,
        label: EventLabel,
        parent: Option<EventId>,
        dependencies: SmallVec<[EventId; 2]>,
        visit: bool,
    ) -> Option<EventId> {
        let conflicts = self.conflicts_for(thread, parent, &label, &dependencies);
        for &conflict in &conflicts {
            let impossible = parent
                .iter()
                .chain(dependencies.iter())
                .any(|&link| self.arena.causally_precedes_or_equal(conflict, link));
            if impossible {
                trace!(?label, conflict, "causality violation, alternative dropped");
                return None;
            }
        }

        let allocation = label
            .location()
            .and_then(|loc| self.registry.allocation_of(loc.object_id()));
        let source = matches!(label, EventLabel::ReadResponse { .. })
            .then(|| dependencies.first().copied())
            .flatten();
        let id = self
            .arena
            .push(thread, label, parent, dependencies, allocation, source);
        trace!(id, thread, "event created");

        if !visit {
            let point = self.make_backtracking_point(id, &conflicts);
            self.points_created += 1;
            self.backtracking.push(point);
        }
        Some(id)
    }

    fn make_backtracking_point(&self, event: EventId, conflicts: &[EventId]) -> BacktrackingPoint {
        let e = self.arena.get(event);

        // Frontier to restore: the current one minus the conflicts, with
        // recorded unblocking responses of still-blocked requests kept (so
        // at-most-one-response checks survive the reset), cut back to the
        // parent on the event's own thread.
        let mut frontier = self.frontier.clone();
        for (&request, &response) in self.dangling.iter() {
            if let Some(response) = response {
                if frontier.get(self.arena.get(response).thread) == Some(request) {
                    frontier.update(&self.arena, response);
                }
            }
        }
        frontier.cut(&self.arena, conflicts);
        frontier.set(e.thread, e.parent);

        // Pinned set: the old one merged with the event's causal-past
        // frontier, cut at the conflicts, the dangling requests, and the
        // event itself.
        let mut pinned = self.pinned.clone();
        let mut past_clock = VersionVec::new();
        if let Some(p) = e.parent {
            past_clock.join(&self.arena.get(p).clock);
        }
        for &d in &e.dependencies {
            past_clock.join(&self.arena.get(d).clock);
        }
        pinned.merge(&self.arena, &self.execution.calculate_frontier(&past_clock));
        pinned.cut(&self.arena, conflicts);
        let dangling_requests: Vec<EventId> = self.dangling.keys().copied().collect();
        pinned.cut(&self.arena, &dangling_requests);
        pinned.cut_thread_at(&self.arena, e.thread, e.position);

        BacktrackingPoint {
            event,
            frontier,
            pinned,
            blocked_requests: dangling_requests,
            visited: false,
        }
    }

    fn mark_point_visited(&mut self, event: EventId) {
        for point in self.backtracking.iter_mut().rev() {
            if point.event == event {
                if !point.visited {
                    point.visited = true;
                    self.points_visited += 1;
                }
                return;
            }
        }
        unreachable!("event {event} has no backtracking point");
    }

    fn append_to_execution(&mut self, event: EventId) {
        self.execution.append(&self.arena, event);
        self.frontier.update(&self.arena, event);
    }

    // ==================================================================
    // Appending under the replay discipline
    // ==================================================================

    fn add(&mut self, thread: ThreadId, label: EventLabel, deps: SmallVec<[EventId; 2]>) -> Appended {
        if self.replayer.in_progress() {
            let next = self.replayer.peek().expect("in_progress implies peek");
            if self.arena.get(next).thread == thread {
                assert!(
                    labels_correspond(&self.arena.get(next).label, &label),
                    "replay divergence on thread {thread}: program performed {label:?} \
                     but the stored order holds {:?}",
                    self.arena.get(next).label
                );
                self.replayer.advance();
                self.played_frontier.update(&self.arena, next);
                trace!(event = next, thread, "replayed");
                self.flush_deferred_if_replay_done();
                return Appended::Replayed(next);
            }
            let arena = &self.arena;
            if self.replayer.has_remaining_for(thread, |e| arena.get(e).thread) {
                // This thread's own events are still queued; it must wait
                // its turn in the stored order.
                (self.ctx.switch)(thread, SwitchReason::StrategySwitch);
                return Appended::Switch;
            }
            // The thread ran past its replayed prefix: append fresh and
            // defer the synchronization search until replay ends.
            let id = self.add_fresh(thread, label, deps);
            if self.arena.get(id).label.is_send() {
                self.deferred.push(id);
            }
            return Appended::Fresh(id);
        }

        let id = self.add_fresh(thread, label, deps);
        if self.arena.get(id).label.is_send() {
            self.add_synchronized_events(id);
        }
        Appended::Fresh(id)
    }

    fn add_fresh(&mut self, thread: ThreadId, label: EventLabel, deps: SmallVec<[EventId; 2]>) -> EventId {
        let parent = self.frontier.get(thread);
        let id = self
            .create_event(thread, label, parent, deps, true)
            .expect("an append at the frontier has no conflicts");
        self.append_to_execution(id);
        id
    }

    fn flush_deferred_if_replay_done(&mut self) {
        if self.replayer.in_progress() {
            return;
        }
        let deferred = std::mem::take(&mut self.deferred);
        for event in deferred {
            self.add_synchronized_events(event);
        }
    }

    // ==================================================================
    // Synchronization search
    // ==================================================================

    /// Enumerate candidate partners for `event`, synchronize with each, and
    /// record every produced response as a non-visited backtracking point.
    /// Returns the created responses in partner order.
    fn add_synchronized_events(&mut self, event: EventId) -> Vec<EventId> {
        let e = self.arena.get(event).clone();
        if e.label.sync_type() == SyncType::None {
            return Vec::new();
        }

        if matches!(e.label, EventLabel::ThreadJoinRequest { .. }) {
            return self.add_join_response(event).into_iter().collect();
        }
        if matches!(e.label, EventLabel::ThreadFinish { .. }) {
            return self.add_finish_synchronizations(&e);
        }

        let mut created = Vec::new();
        if e.label.is_send() {
            let partners = self.send_candidates(&e);
            for request in partners {
                if let Some(id) = self.try_synchronize(request, event) {
                    created.push(id);
                }
            }
            self.record_unblocks(&created);
        } else if e.label.is_request() {
            let partners = self.request_candidates(&e);
            for send in partners {
                if let Some(id) = self.try_synchronize(event, send) {
                    created.push(id);
                }
            }
        }
        created
    }

    /// Synchronize one (request, send) pair; on success the response event
    /// is created as a non-visited backtracking point.
    fn try_synchronize(&mut self, request: EventId, send: EventId) -> Option<EventId> {
        let label = self.response_label_for(send, request)?;
        let req_thread = self.arena.get(request).thread;
        let id = self.create_event(req_thread, label, Some(request), smallvec![send], false)?;
        debug!(response = id, request, send, "synchronization");
        Some(id)
    }

    /// The response label for a (send, request) pair, or `None` when the
    /// pair is undefined. The root initialization and allocation events act
    /// as the first write of the locations (and the unlocked state of the
    /// mutexes) they initialize; their read values come from the injected
    /// memory initializer.
    fn response_label_for(&self, send: EventId, request: EventId) -> Option<EventLabel> {
        let send_label = &self.arena.get(send).label;
        let request_label = &self.arena.get(request).label;

        if let EventLabel::ReadRequest {
            location,
            exclusive,
            code_location,
        } = request_label
        {
            if self.is_initial_write_of(send, location.object_id()) {
                return Some(EventLabel::ReadResponse {
                    location: location.clone(),
                    value: (self.ctx.memory_initializer)(location),
                    exclusive: *exclusive,
                    code_location: code_location.clone(),
                });
            }
        }
        if let EventLabel::LockRequest {
            mutex,
            reentry,
            depth,
            synthetic,
        } = request_label
        {
            if self.registry.allocation_of(*mutex) == Some(send) {
                return Some(EventLabel::LockResponse {
                    mutex: *mutex,
                    reentry: *reentry,
                    depth: *depth,
                    synthetic: *synthetic,
                });
            }
        }
        synchronize(send_label, request_label)
    }

    /// True if `send` supplies the initial value of locations owned by
    /// `object`: the root covers everything not otherwise allocated, an
    /// allocation event covers its object.
    fn is_initial_write_of(&self, send: EventId, object: ObjectId) -> bool {
        match self.registry.allocation_of(object) {
            Some(allocation) => allocation == send,
            None => send == self.root,
        }
    }

    /// Candidate requests for a send trigger, with the generic filters
    /// applied: causal predecessors of the send are dropped (a response for
    /// them would close a cycle), and pinned events may not
    /// re-synchronize unless they are blocked dangling requests.
    fn send_candidates(&self, e: &Event) -> Vec<EventId> {
        let candidates: Vec<EventId> = match &e.label {
            EventLabel::Write { location, .. } => {
                if self.execution.is_read_write_race_free(location) {
                    Vec::new()
                } else {
                    self.execution.read_requests(location).to_vec()
                }
            }
            // A reentrant unlock does not release the mutex.
            EventLabel::Unlock { reentry: true, .. } => Vec::new(),
            EventLabel::ObjectAllocation { .. } | EventLabel::Initialization { .. } => Vec::new(),
            _ => self
                .execution
                .events_in_order()
                .into_iter()
                .filter(|&c| {
                    let label = &self.arena.get(c).label;
                    label.is_request() && synchronize(&e.label, label).is_some()
                })
                .collect(),
        };
        self.filter_candidates(e, candidates, true)
    }

    /// Candidate sends for a request trigger. Read requests get the
    /// memory-model filters; reentrant lock requests synchronize with the
    /// mutex's allocation event only.
    fn request_candidates(&self, e: &Event) -> Vec<EventId> {
        let candidates: Vec<EventId> = match &e.label {
            EventLabel::ReadRequest { location, .. } => self.read_candidates(e, location),
            EventLabel::LockRequest {
                mutex,
                reentry: true,
                ..
            } => self.registry.allocation_of(*mutex).into_iter().collect(),
            EventLabel::LockRequest { mutex, .. } => {
                let mut sends: Vec<EventId> = self
                    .execution
                    .events_in_order()
                    .into_iter()
                    .filter(|&c| {
                        matches!(
                            self.arena.get(c).label,
                            EventLabel::Unlock {
                                mutex: m,
                                reentry: false,
                                ..
                            } if m == *mutex
                        )
                    })
                    .collect();
                sends.extend(self.registry.allocation_of(*mutex));
                sends
            }
            EventLabel::SuspendRequest {
                prompt_cancellation,
                ..
            } => {
                let mut sends: Vec<EventId> = self
                    .execution
                    .events_in_order()
                    .into_iter()
                    .filter(|&c| synchronize(&self.arena.get(c).label, &e.label).is_some())
                    .collect();
                // Cancellation synchronizes with the root; the root is a
                // send, so the generic scan already found it when prompt
                // cancellation is on.
                debug_assert!(
                    !*prompt_cancellation || sends.contains(&self.root),
                    "prompt-cancellable suspend always has the root candidate"
                );
                sends
            }
            _ => self
                .execution
                .events_in_order()
                .into_iter()
                .filter(|&c| {
                    let label = &self.arena.get(c).label;
                    label.is_send() && synchronize(label, &e.label).is_some()
                })
                .collect(),
        };
        self.filter_candidates(e, candidates, false)
    }

    /// Memory-model candidate set for a read request: every write to the
    /// location plus the initializing event, minus overwritten writes
    /// (covered by a later write already in the read's causal past) and
    /// stale writes (causal predecessors of an earlier read-from of this
    /// thread).
    fn read_candidates(&self, e: &Event, location: &MemoryLocation) -> Vec<EventId> {
        let initial = self
            .registry
            .allocation_of(location.object_id())
            .unwrap_or(self.root);

        if self.execution.is_race_free(location) {
            return vec![self.execution.last_write(location).unwrap_or(initial)];
        }

        let mut writes = self.execution.writes(location).to_vec();
        writes.push(initial);

        // Coherence: a write overwritten within the read's causal past is
        // not readable.
        let all = writes.clone();
        writes.retain(|&w| {
            !all.iter().any(|&w2| {
                w2 != w
                    && self.arena.causally_precedes(w, w2)
                    && self.arena.causally_precedes(w2, e.id)
            })
        });

        // Per-thread coherence: reading causally before an earlier
        // read-from of the same thread would reorder that thread's reads.
        for &earlier in self.execution.thread_events(e.thread) {
            let ev = self.arena.get(earlier);
            if let EventLabel::ReadResponse { location: rl, .. } = &ev.label {
                if rl == location {
                    if let Some(read_from) = ev.source {
                        writes.retain(|&w| {
                            w == read_from || !self.arena.causally_precedes(w, read_from)
                        });
                    }
                }
            }
        }

        // Spin cut: once a thread has re-read the same value past the spin
        // bound, a further same-value alternative is stuttering-equivalent
        // to the shorter execution and is not offered. The read must still
        // progress, so the last write stays when nothing else remains.
        if let Some(code_location) = e.label.code_location() {
            if let Some((hot_location, hot_value)) = self.detector.hot_streak(e.thread, code_location)
            {
                if hot_location == *location {
                    let fresh: Vec<EventId> = writes
                        .iter()
                        .copied()
                        .filter(|&w| self.write_value(w, location) != hot_value)
                        .collect();
                    if !fresh.is_empty() {
                        return fresh;
                    }
                    if let Some(&last) = writes.last() {
                        return vec![last];
                    }
                }
            }
        }
        writes
    }

    /// The value a write-like candidate supplies to a read: the label's
    /// value for real writes, the initializer for the root and allocation
    /// events.
    fn write_value(&self, write: EventId, location: &MemoryLocation) -> ValueId {
        self.arena
            .get(write)
            .label
            .value()
            .unwrap_or_else(|| (self.ctx.memory_initializer)(location))
    }

    fn filter_candidates(
        &self,
        e: &Event,
        mut candidates: Vec<EventId>,
        drop_causal_predecessors: bool,
    ) -> Vec<EventId> {
        candidates.retain(|&c| {
            if drop_causal_predecessors && self.arena.causally_precedes(c, e.id) {
                return false;
            }
            if self.pinned.contains(&self.arena, c) && !self.dangling.contains_key(&c) {
                return false;
            }
            true
        });
        // Partner order determines response creation order; sorting keeps
        // the exploration deterministic.
        candidates.sort_unstable();
        candidates.dedup();
        candidates
    }

    /// Barrier synchronization for a join request: fold every finish of an
    /// awaited thread into the request. Emits one response only when the
    /// awaited set empties; a partial fold stays blocking and emits nothing.
    fn add_join_response(&mut self, request: EventId) -> Option<EventId> {
        let e = self.arena.get(request).clone();
        let EventLabel::ThreadJoinRequest { threads } = &e.label else {
            unreachable!("join barrier called for a non-join label");
        };
        let finishes: Vec<EventId> = self
            .execution
            .events_in_order()
            .into_iter()
            .filter(|&c| {
                matches!(
                    self.arena.get(c).label,
                    EventLabel::ThreadFinish { thread } if threads.contains(&thread)
                )
            })
            .collect();
        let finishes = self.filter_candidates(&e, finishes, false);

        let mut label = e.label.clone();
        let mut deps: SmallVec<[EventId; 2]> = smallvec![];
        for &finish in &finishes {
            if let Some(next) = synchronize(&self.arena.get(finish).label, &label) {
                label = next;
                deps.push(finish);
            }
        }
        if !matches!(label, EventLabel::ThreadJoinResponse) {
            return None;
        }
        let id = self.create_event(e.thread, label, Some(request), deps, false)?;
        debug!(response = id, request, "join barrier completed");
        Some(id)
    }

    /// A finish may complete join barriers that were waiting on it.
    fn add_finish_synchronizations(&mut self, e: &Event) -> Vec<EventId> {
        let EventLabel::ThreadFinish { thread } = e.label else {
            unreachable!("finish synchronization called for a non-finish label");
        };
        let joins: Vec<EventId> = self
            .execution
            .events_in_order()
            .into_iter()
            .filter(|&c| {
                matches!(
                    &self.arena.get(c).label,
                    EventLabel::ThreadJoinRequest { threads } if threads.contains(&thread)
                )
            })
            .collect();
        let joins = self.filter_candidates(e, joins, true);

        let mut created = Vec::new();
        for join in joins {
            if self.execution.response_of(&self.arena, join).is_some() {
                continue;
            }
            if let Some(id) = self.add_join_response(join) {
                created.push(id);
            }
        }
        self.record_unblocks(&created);
        created
    }

    /// A new response may be the first for a blocked dangling request: mark
    /// the request unblocked by recording the response, and mark the point
    /// visited, since the current execution has just chosen it. A response
    /// that conflicts with the current execution (or with a response
    /// recorded in this same round over the same exclusive source) is left
    /// as an unvisited alternative instead.
    fn record_unblocks(&mut self, created: &[EventId]) {
        let mut recorded_this_round: Vec<EventId> = Vec::new();
        for &response in created {
            let request = self
                .arena
                .get(response)
                .parent
                .expect("a response always has its request as parent");
            if self.dangling.get(&request) != Some(&None) {
                continue;
            }
            if !self.appendable(response) {
                continue;
            }
            if let Some(source) = self.exclusive_source(response) {
                let clash = recorded_this_round
                    .iter()
                    .any(|&r| self.exclusive_source(r) == Some(source));
                if clash {
                    continue;
                }
            }
            self.dangling.insert(request, Some(response));
            self.mark_point_visited(response);
            recorded_this_round.push(response);
            debug!(request, response, "dangling request unblocked");
        }
    }

    /// True if the response can join the current execution right now: its
    /// slot is free and no exclusivity conflict is present.
    fn appendable(&self, response: EventId) -> bool {
        let e = self.arena.get(response);
        self.conflicts_for(e.thread, e.parent, &e.label, &e.dependencies)
            .is_empty()
    }

    /// The consumed token of an exclusive response: the unlock a lock
    /// response reads from, or the non-broadcast notify a wait response was
    /// woken by.
    fn exclusive_source(&self, response: EventId) -> Option<EventId> {
        let e = self.arena.get(response);
        match e.label {
            EventLabel::LockResponse { reentry: false, .. } => e.dependencies.first().copied(),
            EventLabel::WaitResponse { .. } => {
                let source = *e.dependencies.first()?;
                let broadcast = matches!(
                    self.arena.get(source).label,
                    EventLabel::Notify {
                        broadcast: true,
                        ..
                    }
                );
                (!broadcast).then_some(source)
            }
            _ => None,
        }
    }

    // ==================================================================
    // The request/response protocol
    // ==================================================================

    /// Drive the response step for a pending request: consult the replayer
    /// first, then a recorded unblocking response, then the
    /// synchronization search.
    fn add_response(&mut self, request: EventId) -> ResponseOutcome {
        let request_thread = self.arena.get(request).thread;

        if self.replayer.in_progress() {
            let next = self.replayer.peek().expect("in_progress implies peek");
            let next_event = self.arena.get(next);
            if next_event.thread == request_thread {
                debug_assert_eq!(
                    next_event.parent,
                    Some(request),
                    "replay divergence: the stored order does not continue with this request's response"
                );
                let deps_played = next_event
                    .dependencies
                    .clone()
                    .iter()
                    .all(|&d| self.played_frontier.contains(&self.arena, d));
                if !deps_played {
                    // Not all of the response's dependencies were replayed
                    // yet; other threads must progress first.
                    return ResponseOutcome::NoResponseYet;
                }
                self.replayer.advance();
                self.played_frontier.update(&self.arena, next);
                trace!(event = next, "replayed response");
                self.flush_deferred_if_replay_done();
                return ResponseOutcome::Appended(next);
            }
            return ResponseOutcome::NoResponseYet;
        }

        let recorded = self.dangling.get(&request).copied();
        match recorded {
            Some(Some(response)) => {
                // The recorded response may have become impossible if
                // another thread consumed the same exclusive source since;
                // fall back to blocked and wait for the next send.
                if !self.appendable(response) {
                    self.dangling.insert(request, None);
                    return ResponseOutcome::Blocked;
                }
                self.dangling.remove(&request);
                self.append_to_execution(response);
                return ResponseOutcome::Appended(response);
            }
            Some(None) => return ResponseOutcome::Blocked,
            None => {}
        }

        let responses = self.add_synchronized_events(request);
        // Responses conflicting with the current execution (a consumed
        // unlock, an already-woken waiter) are alternatives for the DFS,
        // not choices for this execution.
        let appendable: Vec<EventId> = responses
            .iter()
            .copied()
            .filter(|&r| self.appendable(r))
            .collect();
        if appendable.is_empty() {
            if self.arena.get(request).label.is_blocking() {
                self.dangling.insert(request, None);
                debug!(request, "request is dangling");
                return ResponseOutcome::Blocked;
            }
            unreachable!("a non-blocking request always synchronizes (the root initializes memory)");
        }
        // The last produced response is the newest backtracking point; take
        // it for the current execution and leave the others for the DFS.
        let chosen = *appendable.last().expect("non-empty");
        self.mark_point_visited(chosen);
        self.append_to_execution(chosen);
        self.dangling.remove(&request);
        ResponseOutcome::Appended(chosen)
    }

    /// The thread's last event as the program sees it: replay exposes only
    /// the played prefix, not the whole restored execution.
    fn last_event_of(&self, thread: ThreadId) -> Option<EventId> {
        if self.replayer.in_progress() {
            self.played_frontier.get(thread)
        } else {
            self.frontier.get(thread)
        }
    }

    /// The thread's last event, if it is a matching request still awaiting
    /// its response (a retried operation resumes here instead of re-adding
    /// the request).
    fn pending_request(
        &self,
        thread: ThreadId,
        matches: impl Fn(&EventLabel) -> bool,
    ) -> Option<EventId> {
        let last = self.last_event_of(thread)?;
        let label = &self.arena.get(last).label;
        (label.is_request() && matches(label)).then_some(last)
    }

    fn request_then_response(
        &mut self,
        thread: ThreadId,
        label: EventLabel,
        already_pending: impl Fn(&EventLabel) -> bool,
    ) -> Result<EventId, EngineAction<()>> {
        let request = match self.pending_request(thread, already_pending) {
            Some(r) => r,
            None => match self.add(thread, label, smallvec![]) {
                Appended::Switch => return Err(EngineAction::Switch(SwitchReason::StrategySwitch)),
                Appended::Replayed(id) | Appended::Fresh(id) => id,
            },
        };
        match self.add_response(request) {
            ResponseOutcome::Appended(response) => Ok(response),
            ResponseOutcome::NoResponseYet => {
                (self.ctx.switch)(thread, SwitchReason::StrategySwitch);
                Err(EngineAction::Switch(SwitchReason::StrategySwitch))
            }
            ResponseOutcome::Blocked => Err(EngineAction::Blocked),
        }
    }

    // ==================================================================
    // Interception entry points
    // ==================================================================

    pub fn on_shared_read(
        &mut self,
        thread: ThreadId,
        location: MemoryLocation,
        exclusive: bool,
        code_location: CodeLocation,
    ) -> EngineAction<ValueId> {
        let label = EventLabel::ReadRequest {
            location: location.clone(),
            exclusive,
            code_location: code_location.clone(),
        };
        let matcher = |l: &EventLabel| {
            matches!(l, EventLabel::ReadRequest { location: rl, .. } if *rl == location)
        };
        match self.request_then_response(thread, label, matcher) {
            Ok(response) => {
                let value = self
                    .arena
                    .get(response)
                    .label
                    .value()
                    .expect("a read response carries its value");
                if self
                    .detector
                    .record_read(thread, &code_location, &location, value)
                {
                    (self.ctx.switch)(thread, SwitchReason::SpinBound);
                    self.requested_switch = Some((thread, SwitchReason::SpinBound));
                    debug!(thread, %location, "spin bound hit");
                }
                EngineAction::Ready(value)
            }
            Err(EngineAction::Switch(reason)) => EngineAction::Switch(reason),
            Err(EngineAction::Blocked) => {
                unreachable!("read requests never block: initialization supplies a value")
            }
            Err(EngineAction::Ready(())) => unreachable!(),
        }
    }

    pub fn on_shared_write(
        &mut self,
        thread: ThreadId,
        location: MemoryLocation,
        value: ValueId,
        exclusive: bool,
        code_location: CodeLocation,
    ) -> EngineAction<()> {
        let label = EventLabel::Write {
            location,
            value,
            exclusive,
            code_location,
        };
        match self.add(thread, label, smallvec![]) {
            Appended::Switch => EngineAction::Switch(SwitchReason::StrategySwitch),
            Appended::Replayed(_) | Appended::Fresh(_) => EngineAction::Ready(()),
        }
    }

    pub fn on_allocation(
        &mut self,
        thread: ThreadId,
        value: ObjectRef,
        class: &str,
    ) -> EngineAction<ObjectId> {
        if self.replayer.in_progress() {
            let next = self.replayer.peek().expect("in_progress implies peek");
            let next_event = self.arena.get(next);
            if next_event.thread == thread {
                let EventLabel::ObjectAllocation { object, .. } = next_event.label else {
                    panic!(
                        "replay divergence on thread {thread}: program allocated but the \
                         stored order holds {:?}",
                        next_event.label
                    );
                };
                self.replayer.advance();
                self.played_frontier.update(&self.arena, next);
                self.registry.register_replayed(object, value, next);
                self.flush_deferred_if_replay_done();
                return EngineAction::Ready(object);
            }
            let arena = &self.arena;
            if self.replayer.has_remaining_for(thread, |e| arena.get(e).thread) {
                (self.ctx.switch)(thread, SwitchReason::StrategySwitch);
                return EngineAction::Switch(SwitchReason::StrategySwitch);
            }
        }
        let object = self.registry.register_allocation(value, self.root);
        let label = EventLabel::ObjectAllocation {
            object,
            class: Arc::from(class),
        };
        let id = self.add_fresh(thread, label, smallvec![]);
        self.registry.set_allocation(object, id);
        EngineAction::Ready(object)
    }

    pub fn on_lock_acquire(&mut self, thread: ThreadId, mutex: ObjectId) -> EngineAction<()> {
        let depth = *self.lock_depth.get(&(thread, mutex)).unwrap_or(&0);
        let label = EventLabel::LockRequest {
            mutex,
            reentry: depth > 0,
            depth: depth + 1,
            synthetic: false,
        };
        let matcher = |l: &EventLabel| {
            matches!(l, EventLabel::LockRequest { mutex: m, synthetic: false, .. } if *m == mutex)
        };
        match self.request_then_response(thread, label, matcher) {
            Ok(_) => {
                *self.lock_depth.entry((thread, mutex)).or_insert(0) += 1;
                EngineAction::Ready(())
            }
            Err(action) => action,
        }
    }

    pub fn on_lock_release(&mut self, thread: ThreadId, mutex: ObjectId) -> EngineAction<()> {
        let depth = *self.lock_depth.get(&(thread, mutex)).unwrap_or(&0);
        assert!(depth > 0, "unlock of a mutex thread {thread} does not hold");
        let label = EventLabel::Unlock {
            mutex,
            reentry: depth > 1,
            depth,
            synthetic: false,
        };
        match self.add(thread, label, smallvec![]) {
            Appended::Switch => EngineAction::Switch(SwitchReason::StrategySwitch),
            Appended::Replayed(_) | Appended::Fresh(_) => {
                *self.lock_depth.get_mut(&(thread, mutex)).expect("held") -= 1;
                EngineAction::Ready(())
            }
        }
    }

    /// Wait on a monitor: a synthetic unlock releases the mutex, the wait
    /// request synchronizes with a notify, and a synthetic lock reacquires
    /// the mutex before returning. Re-entered after switches, resuming at
    /// the step the frontier shows.
    pub fn on_wait(&mut self, thread: ThreadId, mutex: ObjectId) -> EngineAction<()> {
        // Reacquire step: a synthetic lock request is pending or the wait
        // response is the last event.
        let last_label = self
            .last_event_of(thread)
            .map(|e| self.arena.get(e).label.clone());
        let reacquiring = matches!(
            &last_label,
            Some(EventLabel::LockRequest { mutex: m, synthetic: true, .. }) if *m == mutex
        ) || matches!(
            &last_label,
            Some(EventLabel::WaitResponse { mutex: m }) if *m == mutex
        );
        if reacquiring {
            return self.wait_reacquire(thread, mutex);
        }

        // Release step, unless already past it.
        let released = matches!(
            &last_label,
            Some(EventLabel::Unlock { mutex: m, synthetic: true, .. }) if *m == mutex
        ) || matches!(
            &last_label,
            Some(EventLabel::WaitRequest { mutex: m }) if *m == mutex
        );
        if !released {
            let depth = *self.lock_depth.get(&(thread, mutex)).unwrap_or(&0);
            assert!(depth > 0, "wait on a mutex thread {thread} does not hold");
            let label = EventLabel::Unlock {
                mutex,
                reentry: false,
                depth,
                synthetic: true,
            };
            match self.add(thread, label, smallvec![]) {
                Appended::Switch => return EngineAction::Switch(SwitchReason::StrategySwitch),
                _ => {
                    self.lock_depth.insert((thread, mutex), 0);
                }
            }
        }

        let label = EventLabel::WaitRequest { mutex };
        let matcher =
            |l: &EventLabel| matches!(l, EventLabel::WaitRequest { mutex: m } if *m == mutex);
        match self.request_then_response(thread, label, matcher) {
            Ok(_) => self.wait_reacquire(thread, mutex),
            Err(action) => action,
        }
    }

    fn wait_reacquire(&mut self, thread: ThreadId, mutex: ObjectId) -> EngineAction<()> {
        // The synthetic unlock recorded the depth to restore. Look only at
        // the prefix the program has reached, not past the replay position.
        let reached = self
            .last_event_of(thread)
            .map(|e| self.arena.get(e).position + 1)
            .unwrap_or(0);
        let depth = self.execution.thread_events(thread)[..reached]
            .iter()
            .rev()
            .find_map(|&e| match &self.arena.get(e).label {
                EventLabel::Unlock {
                    mutex: m,
                    synthetic: true,
                    depth,
                    ..
                } if *m == mutex => Some(*depth),
                _ => None,
            })
            .unwrap_or(1);
        let label = EventLabel::LockRequest {
            mutex,
            reentry: false,
            depth,
            synthetic: true,
        };
        let matcher = |l: &EventLabel| {
            matches!(l, EventLabel::LockRequest { mutex: m, synthetic: true, .. } if *m == mutex)
        };
        match self.request_then_response(thread, label, matcher) {
            Ok(_) => {
                self.lock_depth.insert((thread, mutex), depth);
                EngineAction::Ready(())
            }
            Err(action) => action,
        }
    }

    pub fn on_notify(
        &mut self,
        thread: ThreadId,
        mutex: ObjectId,
        broadcast: bool,
    ) -> EngineAction<()> {
        let label = EventLabel::Notify { mutex, broadcast };
        match self.add(thread, label, smallvec![]) {
            Appended::Switch => EngineAction::Switch(SwitchReason::StrategySwitch),
            _ => EngineAction::Ready(()),
        }
    }

    pub fn on_park(&mut self, thread: ThreadId) -> EngineAction<()> {
        let label = EventLabel::ParkRequest { thread };
        let matcher = |l: &EventLabel| matches!(l, EventLabel::ParkRequest { .. });
        match self.request_then_response(thread, label, matcher) {
            Ok(_) => EngineAction::Ready(()),
            Err(action) => action,
        }
    }

    pub fn on_unpark(&mut self, thread: ThreadId, target: ThreadId) -> EngineAction<()> {
        let label = EventLabel::Unpark { target };
        match self.add(thread, label, smallvec![]) {
            Appended::Switch => EngineAction::Switch(SwitchReason::StrategySwitch),
            _ => EngineAction::Ready(()),
        }
    }

    pub fn on_thread_fork(
        &mut self,
        thread: ThreadId,
        threads: BTreeSet<ThreadId>,
    ) -> EngineAction<()> {
        let label = EventLabel::ThreadFork { threads };
        match self.add(thread, label, smallvec![]) {
            Appended::Switch => EngineAction::Switch(SwitchReason::StrategySwitch),
            _ => EngineAction::Ready(()),
        }
    }

    /// First event of a forked thread; synchronizes with the fork.
    pub fn on_thread_start(&mut self, thread: ThreadId) -> EngineAction<()> {
        let label = EventLabel::ThreadStartRequest { thread };
        let matcher = |l: &EventLabel| matches!(l, EventLabel::ThreadStartRequest { .. });
        match self.request_then_response(thread, label, matcher) {
            Ok(_) => EngineAction::Ready(()),
            Err(action) => action,
        }
    }

    pub fn on_thread_finish(&mut self, thread: ThreadId) -> EngineAction<()> {
        let label = EventLabel::ThreadFinish { thread };
        match self.add(thread, label, smallvec![]) {
            Appended::Switch => EngineAction::Switch(SwitchReason::StrategySwitch),
            _ => EngineAction::Ready(()),
        }
    }

    pub fn on_thread_join(
        &mut self,
        thread: ThreadId,
        threads: BTreeSet<ThreadId>,
    ) -> EngineAction<()> {
        let label = EventLabel::ThreadJoinRequest {
            threads: threads.clone(),
        };
        let matcher = |l: &EventLabel| matches!(l, EventLabel::ThreadJoinRequest { .. });
        match self.request_then_response(thread, label, matcher) {
            Ok(_) => EngineAction::Ready(()),
            Err(action) => action,
        }
    }

    /// Cooperative suspension of (thread, actor). With prompt cancellation
    /// the request also synchronizes with the root, modelling cancellation;
    /// returns whether the suspension was cancelled.
    pub fn on_coroutine_suspend(
        &mut self,
        thread: ThreadId,
        actor: ActorId,
        prompt_cancellation: bool,
    ) -> EngineAction<bool> {
        let label = EventLabel::SuspendRequest {
            thread,
            actor,
            prompt_cancellation,
        };
        let matcher = |l: &EventLabel| {
            matches!(l, EventLabel::SuspendRequest { actor: a, .. } if *a == actor)
        };
        match self.request_then_response(thread, label, matcher) {
            Ok(response) => {
                let EventLabel::SuspendResponse { cancelled, .. } = self.arena.get(response).label
                else {
                    unreachable!("suspend request answered by a non-suspend response");
                };
                EngineAction::Ready(cancelled)
            }
            Err(EngineAction::Switch(reason)) => EngineAction::Switch(reason),
            Err(EngineAction::Blocked) => EngineAction::Blocked,
            Err(EngineAction::Ready(())) => unreachable!(),
        }
    }

    pub fn on_coroutine_resume(
        &mut self,
        thread: ThreadId,
        target: ThreadId,
        actor: ActorId,
    ) -> EngineAction<()> {
        let label = EventLabel::CoroutineResume {
            thread: target,
            actor,
        };
        match self.add(thread, label, smallvec![]) {
            Appended::Switch => EngineAction::Switch(SwitchReason::StrategySwitch),
            _ => EngineAction::Ready(()),
        }
    }

    /// Record a drawn random value; replay returns the recorded one so the
    /// program stays deterministic.
    pub fn on_random(
        &mut self,
        thread: ThreadId,
        draw: impl FnOnce() -> u64,
    ) -> EngineAction<u64> {
        if self.replayer.in_progress() {
            let next = self.replayer.peek().expect("in_progress implies peek");
            let next_event = self.arena.get(next);
            if next_event.thread == thread {
                let EventLabel::Random { value } = next_event.label else {
                    panic!(
                        "replay divergence on thread {thread}: program drew a random value \
                         but the stored order holds {:?}",
                        next_event.label
                    );
                };
                self.replayer.advance();
                self.played_frontier.update(&self.arena, next);
                self.flush_deferred_if_replay_done();
                return EngineAction::Ready(value);
            }
            let arena = &self.arena;
            if self.replayer.has_remaining_for(thread, |e| arena.get(e).thread) {
                (self.ctx.switch)(thread, SwitchReason::StrategySwitch);
                return EngineAction::Switch(SwitchReason::StrategySwitch);
            }
        }
        let value = draw();
        self.add_fresh(thread, EventLabel::Random { value }, smallvec![]);
        EngineAction::Ready(value)
    }

    pub fn on_actor_start(&mut self, thread: ThreadId, actor: ActorId) -> EngineAction<()> {
        match self.add(thread, EventLabel::ActorStart { thread, actor }, smallvec![]) {
            Appended::Switch => EngineAction::Switch(SwitchReason::StrategySwitch),
            _ => EngineAction::Ready(()),
        }
    }

    pub fn on_actor_end(&mut self, thread: ThreadId, actor: ActorId) -> EngineAction<()> {
        match self.add(thread, EventLabel::ActorEnd { thread, actor }, smallvec![]) {
            Appended::Switch => EngineAction::Switch(SwitchReason::StrategySwitch),
            _ => EngineAction::Ready(()),
        }
    }
}

/// Replay verification: the stored event and the label the program rebuilt
/// must describe the same action on the same resource. Values are allowed
/// to differ only in width-preserving re-derivation, so they are not
/// compared here.
fn labels_correspond(stored: &EventLabel, fresh: &EventLabel) -> bool {
    std::mem::discriminant(stored) == std::mem::discriminant(fresh)
        && stored.location() == fresh.location()
        && stored.mutex() == fresh.mutex()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cl(line: u32) -> CodeLocation {
        CodeLocation::new("t.rs", "T", "m", line)
    }

    fn loc(name: &str) -> MemoryLocation {
        MemoryLocation::static_field("T", name)
    }

    fn zero_engine() -> EventStructureEngine {
        let ctx = EngineContext::default().with_memory_initializer(|_| ValueId::int(0));
        let mut engine = EventStructureEngine::new(0, ctx);
        engine.initialize_exploration();
        engine
    }

    fn read(engine: &mut EventStructureEngine, thread: ThreadId, name: &str) -> ValueId {
        match engine.on_shared_read(thread, loc(name), false, cl(1)) {
            EngineAction::Ready(v) => v,
            other => panic!("read did not complete: {other:?}"),
        }
    }

    fn write(engine: &mut EventStructureEngine, thread: ThreadId, name: &str, v: i64) {
        assert_eq!(
            engine.on_shared_write(thread, loc(name), ValueId::int(v), false, cl(2)),
            EngineAction::Ready(())
        );
    }

    #[test]
    fn test_read_without_write_sees_initializer() {
        let mut engine = zero_engine();
        assert_eq!(read(&mut engine, 0, "x"), ValueId::int(0));
    }

    #[test]
    fn test_read_sees_own_write_when_race_free() {
        let mut engine = zero_engine();
        write(&mut engine, 0, "x", 7);
        assert_eq!(read(&mut engine, 0, "x"), ValueId::int(7));
        // Race free: no alternative read was scheduled.
        assert_eq!(engine.unvisited_points(), 0);
    }

    #[test]
    fn test_cross_thread_read_creates_backtracking_point() {
        let mut engine = zero_engine();
        write(&mut engine, 0, "x", 1);
        // Thread 1 reads the same location: both the initial value and the
        // write are readable, so one alternative is deferred.
        let seen = read(&mut engine, 1, "x");
        assert_eq!(seen, ValueId::int(1));
        assert_eq!(engine.unvisited_points(), 1);

        // Exploring the alternative yields the other value.
        assert!(engine.start_next_exploration());
        engine.initialize_exploration();
        let alternative = engine
            .execution()
            .events_in_order()
            .into_iter()
            .find_map(|e| match &engine.arena().get(e).label {
                EventLabel::ReadResponse { value, .. } => Some(*value),
                _ => None,
            })
            .expect("the reset execution contains the alternative response");
        assert_eq!(alternative, ValueId::int(0));
        assert!(!engine.start_next_exploration());
    }

    #[test]
    fn test_backtracking_coverage_on_exhaustion() {
        let mut engine = zero_engine();
        write(&mut engine, 0, "x", 1);
        read(&mut engine, 1, "x");
        while engine.start_next_exploration() {
            engine.initialize_exploration();
        }
        assert_eq!(
            engine.backtracking_points_created(),
            engine.backtracking_points_visited()
        );
        assert_eq!(engine.unvisited_points(), 0);
    }

    #[test]
    fn test_write_after_read_revisits_the_read() {
        let mut engine = zero_engine();
        // Thread 1 reads first (sees the initial value), then thread 0
        // writes: the write must offer the read an alternative.
        assert_eq!(read(&mut engine, 1, "x"), ValueId::int(0));
        write(&mut engine, 0, "x", 5);
        assert_eq!(engine.unvisited_points(), 1);
        assert!(engine.start_next_exploration());
        engine.initialize_exploration();
        let alternative = engine
            .execution()
            .events_in_order()
            .into_iter()
            .find_map(|e| match &engine.arena().get(e).label {
                EventLabel::ReadResponse { value, .. } => Some(*value),
                _ => None,
            })
            .unwrap();
        assert_eq!(alternative, ValueId::int(5));
    }

    #[test]
    fn test_lock_mutual_exclusion_via_conflicts() {
        let mut engine = zero_engine();
        let mutex = engine.register_external_object(Arc::new(()));
        assert_eq!(engine.on_lock_acquire(0, mutex), EngineAction::Ready(()));
        // Thread 1 must block: the only lock source (the root allocation)
        // is already consumed by thread 0's response.
        assert_eq!(engine.on_lock_acquire(1, mutex), EngineAction::Blocked);
        assert!(engine.blocked_awaiting(1));

        // Unlock unblocks the waiter.
        assert_eq!(engine.on_lock_release(0, mutex), EngineAction::Ready(()));
        assert!(engine.is_unblocked(1));
        assert_eq!(engine.on_lock_acquire(1, mutex), EngineAction::Ready(()));
        assert!(!engine.blocked_awaiting(1));
    }

    #[test]
    fn test_reentrant_lock_does_not_block() {
        let mut engine = zero_engine();
        let mutex = engine.register_external_object(Arc::new(()));
        assert_eq!(engine.on_lock_acquire(0, mutex), EngineAction::Ready(()));
        assert_eq!(engine.on_lock_acquire(0, mutex), EngineAction::Ready(()));
        assert_eq!(engine.on_lock_release(0, mutex), EngineAction::Ready(()));
        assert_eq!(engine.on_lock_release(0, mutex), EngineAction::Ready(()));
        // The inner release is reentrant and must not wake other lockers:
        // thread 1 can only take the outer release's token or the root's.
        assert_eq!(engine.on_lock_acquire(1, mutex), EngineAction::Ready(()));
    }

    #[test]
    fn test_park_blocks_until_unpark() {
        let mut engine = zero_engine();
        assert_eq!(engine.on_park(1), EngineAction::Blocked);
        assert!(engine.blocked_awaiting(1));
        assert_eq!(engine.on_unpark(0, 1), EngineAction::Ready(()));
        assert!(engine.is_unblocked(1));
        assert_eq!(engine.on_park(1), EngineAction::Ready(()));
    }

    #[test]
    fn test_park_after_unpark_completes_immediately() {
        let mut engine = zero_engine();
        assert_eq!(engine.on_unpark(0, 1), EngineAction::Ready(()));
        assert_eq!(engine.on_park(1), EngineAction::Ready(()));
    }

    #[test]
    fn test_join_barrier_waits_for_all() {
        let mut engine = zero_engine();
        let threads = BTreeSet::from([1, 2]);
        assert_eq!(engine.on_thread_fork(0, threads.clone()), EngineAction::Ready(()));
        assert_eq!(engine.on_thread_start(1), EngineAction::Ready(()));
        assert_eq!(engine.on_thread_start(2), EngineAction::Ready(()));

        assert_eq!(
            engine.on_thread_join(0, threads.clone()),
            EngineAction::Blocked
        );
        assert_eq!(engine.on_thread_finish(1), EngineAction::Ready(()));
        // One of two finished: the barrier is still blocking.
        assert!(engine.blocked_awaiting(0));
        assert_eq!(engine.on_thread_finish(2), EngineAction::Ready(()));
        assert!(engine.is_unblocked(0));
        assert_eq!(engine.on_thread_join(0, threads), EngineAction::Ready(()));
    }

    #[test]
    fn test_thread_start_requires_fork() {
        let mut engine = zero_engine();
        assert_eq!(engine.on_thread_start(1), EngineAction::Blocked);
        assert_eq!(
            engine.on_thread_fork(0, BTreeSet::from([1])),
            EngineAction::Ready(())
        );
        assert!(engine.is_unblocked(1));
        assert_eq!(engine.on_thread_start(1), EngineAction::Ready(()));
    }

    #[test]
    fn test_wait_notify_round_trip() {
        let mut engine = zero_engine();
        let mutex = engine.register_external_object(Arc::new(()));
        assert_eq!(engine.on_lock_acquire(1, mutex), EngineAction::Ready(()));
        // Wait releases the monitor and blocks on the notify.
        assert_eq!(engine.on_wait(1, mutex), EngineAction::Blocked);
        // Another thread can now take the monitor and notify.
        assert_eq!(engine.on_lock_acquire(0, mutex), EngineAction::Ready(()));
        assert_eq!(engine.on_notify(0, mutex, false), EngineAction::Ready(()));
        assert_eq!(engine.on_lock_release(0, mutex), EngineAction::Ready(()));
        // The waiter resumes and reacquires the monitor.
        assert_eq!(engine.on_wait(1, mutex), EngineAction::Ready(()));
        assert_eq!(engine.on_lock_release(1, mutex), EngineAction::Ready(()));
    }

    #[test]
    fn test_coroutine_suspend_resume() {
        let mut engine = zero_engine();
        assert_eq!(
            engine.on_coroutine_suspend(1, 0, false),
            EngineAction::Blocked
        );
        assert_eq!(engine.on_coroutine_resume(0, 1, 0), EngineAction::Ready(()));
        assert!(engine.is_unblocked(1));
        assert_eq!(
            engine.on_coroutine_suspend(1, 0, false),
            EngineAction::Ready(false)
        );
    }

    #[test]
    fn test_prompt_cancellable_suspend_never_blocks() {
        let mut engine = zero_engine();
        // Cancellation synchronizes with the root, so a response exists
        // immediately.
        assert_eq!(
            engine.on_coroutine_suspend(1, 0, true),
            EngineAction::Ready(true)
        );
    }

    #[test]
    fn test_random_replays_recorded_value() {
        let mut engine = zero_engine();
        write(&mut engine, 0, "x", 1);
        assert_eq!(engine.on_random(0, || 42), EngineAction::Ready(42));
        // Force an alternative so the next exploration replays thread 0.
        read(&mut engine, 1, "x");
        assert!(engine.start_next_exploration());
        engine.initialize_exploration();

        // Replay thread 0's prefix: the write, then the recorded draw.
        loop {
            match engine.on_shared_write(0, loc("x"), ValueId::int(1), false, cl(2)) {
                EngineAction::Ready(()) => break,
                EngineAction::Switch(_) => continue,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(engine.on_random(0, || 7), EngineAction::Ready(42));
    }

    #[test]
    fn test_replay_hands_back_same_events() {
        let mut engine = zero_engine();
        write(&mut engine, 0, "x", 1);
        let seen = read(&mut engine, 1, "x");
        assert_eq!(seen, ValueId::int(1));

        assert!(engine.start_next_exploration());
        engine.initialize_exploration();
        let stored = engine.execution().events_in_order();

        // Drive the replay: thread 0 writes, thread 1 reads. The engine
        // must hand back exactly the stored events; no new ids appear.
        assert_eq!(engine.replay_next_thread(), Some(0));
        assert_eq!(
            engine.on_shared_write(0, loc("x"), ValueId::int(1), false, cl(2)),
            EngineAction::Ready(())
        );
        assert_eq!(read(&mut engine, 1, "x"), ValueId::int(0));
        assert_eq!(engine.execution().events_in_order(), stored);
    }

    #[test]
    fn test_spin_bound_requests_switch() {
        let mut engine = zero_engine();
        engine.set_spin_bound(3);
        write(&mut engine, 0, "flag", 0);
        for _ in 0..3 {
            assert_eq!(read(&mut engine, 1, "flag"), ValueId::int(0));
        }
        let (thread, reason) = engine.take_requested_switch().expect("spin bound hit");
        assert_eq!(thread, 1);
        assert_eq!(reason, SwitchReason::SpinBound);
        assert!(engine.take_requested_switch().is_none());
    }

    #[test]
    fn test_allocation_round_trip_and_retention() {
        let mut engine = zero_engine();
        let obj = match engine.on_allocation(0, Arc::new(5i32), "test.Box") {
            EngineAction::Ready(id) => id,
            other => panic!("allocation did not complete: {other:?}"),
        };
        // The allocated object backs an object-field location.
        let field = MemoryLocation::object_field(obj, "test.Box", "v");
        assert_eq!(
            engine.on_shared_write(0, field.clone(), ValueId::int(3), false, cl(9)),
            EngineAction::Ready(())
        );
        match engine.on_shared_read(0, field, false, cl(10)) {
            EngineAction::Ready(v) => assert_eq!(v, ValueId::int(3)),
            other => panic!("read did not complete: {other:?}"),
        }
    }

    #[test]
    fn test_abort_keeps_replayed_prefix_only() {
        let mut engine = zero_engine();
        write(&mut engine, 0, "x", 1);
        read(&mut engine, 1, "x");
        let before = engine.execution().len();
        engine.abort_exploration();
        // First exploration: nothing was replayed except the root.
        assert!(engine.execution().len() < before);
        assert_eq!(engine.execution().len(), 1);
    }
}
