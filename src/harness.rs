//! High-level model-checking API.
//!
//! A [`Program`] describes each thread as a sequence of ops over shared
//! memory locations, with per-thread registers and branches for the
//! spin-wait patterns concurrency tests need. [`explore`] drives the
//! engine through every execution the event structure admits: it forks the
//! test threads from a main thread, runs them cooperatively (honoring the
//! engine's switch and block decisions), checks consistency and the user
//! invariant after each completed execution, and backtracks until the
//! exploration is exhausted or a failure is found in fail-fast mode.
//!
//! The driver prefers to keep the current thread running (fewer context
//! switches shrink the exploration), follows the replayer's thread during
//! replay, and moves off a thread the engine flagged for spinning.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;

use crate::engine::{EngineAction, EngineContext, EventStructureEngine};
use crate::error::Failure;
use crate::label::CodeLocation;
use crate::location::{MemoryLocation, MemoryStore};
use crate::value::{ObjectId, ValueId};
use crate::vv::ThreadId;

/// A value source for writes, branches, and assertions.
#[derive(Clone, Debug)]
pub enum Operand {
    Const(ValueId),
    /// Current value of a register.
    Reg(usize),
    /// Register widened to i64, plus a constant.
    Plus(usize, i64),
}

/// One step of a thread's program.
#[derive(Clone, Debug)]
pub enum Op {
    /// Read a shared location into a register.
    Read {
        location: MemoryLocation,
        register: usize,
    },
    /// Write a value to a shared location.
    Write {
        location: MemoryLocation,
        value: Operand,
    },
    /// Jump to `target` when the register equals the operand.
    BranchIf {
        register: usize,
        equals: Operand,
        target: usize,
    },
    Goto {
        target: usize,
    },
    /// Fail the execution when the register differs from the operand.
    Assert {
        register: usize,
        equals: Operand,
    },
    /// Acquire the program mutex with this index.
    Lock {
        mutex: usize,
    },
    Unlock {
        mutex: usize,
    },
    /// Park the current thread.
    Park,
    /// Unpark the test thread with this program index.
    Unpark {
        thread: usize,
    },
}

/// A test scenario: per-thread op sequences over shared state.
#[derive(Clone, Debug, Default)]
pub struct Program {
    pub threads: Vec<Vec<Op>>,
    /// Registers per thread.
    pub registers: usize,
    /// Number of mutex objects the ops may reference.
    pub mutexes: usize,
}

/// Exploration bounds and policy.
pub struct CheckConfig {
    /// Stop after this many executions.
    pub max_executions: Option<u64>,
    /// Stop at the first failure instead of exploring on.
    pub fail_fast: bool,
    /// Override the spin bound (mainly for tests).
    pub spin_bound: Option<usize>,
    /// Per-execution step budget; exceeding it aborts the execution.
    pub max_steps: usize,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            max_executions: None,
            fail_fast: false,
            spin_bound: None,
            max_steps: 100_000,
        }
    }
}

/// Result of exploring all executions of a program.
#[derive(Debug)]
pub struct ExplorationResult {
    /// Total executions explored (including aborted ones).
    pub executions_explored: u64,
    /// Whether every completed execution passed.
    pub all_passed: bool,
    /// Failures found, each with the execution number it occurred in.
    pub failures: Vec<(u64, Failure)>,
}

/// Read-only view of an execution's observable final state. Writes are
/// applied to a [`MemoryStore`] in schedule order as the engine admits
/// them, so after a completed execution the store holds the last write of
/// every location.
pub struct FinalState<'a> {
    store: &'a MemoryStore,
}

impl FinalState<'_> {
    pub fn read(&self, location: &MemoryLocation) -> ValueId {
        self.store.read(location).unwrap_or(ValueId::Null)
    }

    pub fn read_int(&self, location: &MemoryLocation) -> i64 {
        self.read(location).as_int().unwrap_or(0)
    }
}

/// A store with every static-field class the program touches registered.
fn build_store(program: &Program) -> MemoryStore {
    let mut fields: Vec<(String, String)> = Vec::new();
    for op in program.threads.iter().flatten() {
        let location = match op {
            Op::Read { location, .. } | Op::Write { location, .. } => location,
            _ => continue,
        };
        if let MemoryLocation::StaticField { class, field } = location {
            let entry = (class.to_string(), field.to_string());
            if !fields.contains(&entry) {
                fields.push(entry);
            }
        }
    }
    let mut store = MemoryStore::new();
    let mut classes: Vec<String> = fields.iter().map(|(c, _)| c.clone()).collect();
    classes.sort();
    classes.dedup();
    for class in classes {
        let declared: Vec<&str> = fields
            .iter()
            .filter(|(c, _)| *c == class)
            .map(|(_, f)| f.as_str())
            .collect();
        store.register_class(&class, None, &declared);
    }
    store
}

const MAIN: ThreadId = 0;

/// Engine thread id of the test thread with program index `i`.
fn tid(index: usize) -> ThreadId {
    index + 1
}

enum Phase {
    Start,
    ActorStart,
    Running,
    ActorEnd,
    Finish,
    Done,
}

struct ThreadState {
    phase: Phase,
    pc: usize,
    registers: Vec<ValueId>,
    blocked: bool,
}

enum MainPhase {
    Fork,
    Join,
    Done,
}

enum StepResult {
    Progress,
    Switch,
    Blocked,
    Finished,
    Failed(Failure),
}

enum RunOutcome {
    Completed,
    Deadlock(Vec<ThreadId>),
    ActorFailure(Failure),
    StepLimit,
}

/// Explore every execution of `program`, checking `invariant` against the
/// final state of each completed one.
pub fn explore(
    program: &Program,
    invariant: impl Fn(&FinalState<'_>) -> bool,
    config: &CheckConfig,
) -> ExplorationResult {
    let ctx = EngineContext::default().with_memory_initializer(|_| ValueId::int(0));
    let mut engine = EventStructureEngine::new(MAIN, ctx);
    if let Some(bound) = config.spin_bound {
        engine.set_spin_bound(bound);
    }
    let mutexes: Vec<ObjectId> = (0..program.mutexes)
        .map(|_| engine.register_external_object(Arc::new(())))
        .collect();

    let mut result = ExplorationResult {
        executions_explored: 0,
        all_passed: true,
        failures: Vec::new(),
    };

    loop {
        engine.initialize_exploration();
        let mut store = build_store(program);
        let outcome = run_one(&mut engine, program, &mutexes, &mut store, config.max_steps);
        result.executions_explored += 1;

        let failure = match outcome {
            RunOutcome::Completed => {
                engine.check_consistency().map(Failure::from).or_else(|| {
                    let state = FinalState { store: &store };
                    (!invariant(&state)).then(|| Failure::IncorrectResult {
                        message: "invariant violated".into(),
                    })
                })
            }
            RunOutcome::Deadlock(blocked_threads) => {
                engine.abort_exploration();
                Some(Failure::Deadlock { blocked_threads })
            }
            RunOutcome::ActorFailure(failure) => {
                engine.abort_exploration();
                Some(failure)
            }
            RunOutcome::StepLimit => {
                engine.abort_exploration();
                None
            }
        };

        if let Some(failure) = failure {
            debug!(%failure, execution = result.executions_explored, "failing schedule");
            result.all_passed = false;
            result.failures.push((result.executions_explored, failure));
            if config.fail_fast {
                break;
            }
        }
        if let Some(max) = config.max_executions {
            if result.executions_explored >= max {
                break;
            }
        }
        if !engine.start_next_exploration() {
            break;
        }
    }
    result
}

fn run_one(
    engine: &mut EventStructureEngine,
    program: &Program,
    mutexes: &[ObjectId],
    store: &mut MemoryStore,
    max_steps: usize,
) -> RunOutcome {
    let n = program.threads.len();
    let mut states: Vec<ThreadState> = (0..n)
        .map(|_| ThreadState {
            phase: Phase::Start,
            pc: 0,
            registers: vec![ValueId::int(0); program.registers],
            blocked: false,
        })
        .collect();
    let mut main_phase = MainPhase::Fork;
    let mut main_blocked = false;
    let mut active: Option<ThreadId> = None;
    let mut avoid: Option<ThreadId> = None;
    let mut steps = 0usize;

    loop {
        steps += 1;
        if steps > max_steps {
            return RunOutcome::StepLimit;
        }

        // A spin-bound signal moves the scheduler off the spinning thread.
        if let Some((thread, _)) = engine.take_requested_switch() {
            if active == Some(thread) {
                active = None;
            }
            avoid = Some(thread);
        }

        let runnable: Vec<ThreadId> = std::iter::once(MAIN)
            .filter(|_| !matches!(main_phase, MainPhase::Done))
            .chain((0..n).filter(|&i| !matches!(states[i].phase, Phase::Done)).map(tid))
            .filter(|&t| {
                let blocked = if t == MAIN {
                    main_blocked
                } else {
                    states[t - 1].blocked
                };
                !blocked || engine.is_unblocked(t)
            })
            .collect();

        if runnable.is_empty() {
            let all_done = matches!(main_phase, MainPhase::Done)
                && states.iter().all(|s| matches!(s.phase, Phase::Done));
            if all_done {
                return RunOutcome::Completed;
            }
            let blocked: Vec<ThreadId> = (0..=n)
                .filter(|&t| engine.blocked_awaiting(t))
                .collect();
            return RunOutcome::Deadlock(blocked);
        }

        // Replay dictates the thread order; otherwise stay on the current
        // thread, avoiding one the engine asked to move off.
        let chosen = engine
            .replay_next_thread()
            .filter(|t| runnable.contains(t))
            .or(active.filter(|t| runnable.contains(t) && Some(*t) != avoid))
            .or_else(|| runnable.iter().copied().find(|&t| Some(t) != avoid))
            .unwrap_or(runnable[0]);
        avoid = None;

        let step = if chosen == MAIN {
            step_main(engine, &mut main_phase, n)
        } else {
            step_thread(engine, program, mutexes, store, &mut states[chosen - 1], chosen)
        };

        match step {
            StepResult::Progress => {
                if chosen == MAIN {
                    main_blocked = false;
                } else {
                    states[chosen - 1].blocked = false;
                }
                active = Some(chosen);
            }
            StepResult::Switch => {
                active = None;
            }
            StepResult::Blocked => {
                if chosen == MAIN {
                    main_blocked = true;
                } else {
                    states[chosen - 1].blocked = true;
                }
                active = None;
            }
            StepResult::Finished => {
                active = None;
            }
            StepResult::Failed(failure) => return RunOutcome::ActorFailure(failure),
        }
    }
}

fn step_main(
    engine: &mut EventStructureEngine,
    phase: &mut MainPhase,
    n: usize,
) -> StepResult {
    let all: BTreeSet<ThreadId> = (0..n).map(tid).collect();
    match phase {
        MainPhase::Fork => match engine.on_thread_fork(MAIN, all) {
            EngineAction::Ready(()) => {
                *phase = MainPhase::Join;
                StepResult::Progress
            }
            EngineAction::Switch(_) => StepResult::Switch,
            EngineAction::Blocked => unreachable!("fork never blocks"),
        },
        MainPhase::Join => match engine.on_thread_join(MAIN, all) {
            EngineAction::Ready(()) => {
                *phase = MainPhase::Done;
                StepResult::Finished
            }
            EngineAction::Switch(_) => StepResult::Switch,
            EngineAction::Blocked => StepResult::Blocked,
        },
        MainPhase::Done => unreachable!("the main thread is never scheduled after joining"),
    }
}

fn step_thread(
    engine: &mut EventStructureEngine,
    program: &Program,
    mutexes: &[ObjectId],
    store: &mut MemoryStore,
    state: &mut ThreadState,
    thread: ThreadId,
) -> StepResult {
    match state.phase {
        Phase::Start => match engine.on_thread_start(thread) {
            EngineAction::Ready(()) => {
                state.phase = Phase::ActorStart;
                StepResult::Progress
            }
            EngineAction::Switch(_) => StepResult::Switch,
            EngineAction::Blocked => StepResult::Blocked,
        },
        Phase::ActorStart => match engine.on_actor_start(thread, 0) {
            EngineAction::Ready(()) => {
                state.phase = Phase::Running;
                StepResult::Progress
            }
            EngineAction::Switch(_) => StepResult::Switch,
            EngineAction::Blocked => unreachable!("actor spans never block"),
        },
        Phase::Running => {
            let ops = &program.threads[thread - 1];
            if state.pc >= ops.len() {
                state.phase = Phase::ActorEnd;
                return StepResult::Progress;
            }
            step_op(engine, mutexes, store, state, thread, &ops[state.pc].clone())
        }
        Phase::ActorEnd => match engine.on_actor_end(thread, 0) {
            EngineAction::Ready(()) => {
                state.phase = Phase::Finish;
                StepResult::Progress
            }
            EngineAction::Switch(_) => StepResult::Switch,
            EngineAction::Blocked => unreachable!("actor spans never block"),
        },
        Phase::Finish => match engine.on_thread_finish(thread) {
            EngineAction::Ready(()) => {
                state.phase = Phase::Done;
                StepResult::Finished
            }
            EngineAction::Switch(_) => StepResult::Switch,
            EngineAction::Blocked => unreachable!("finish never blocks"),
        },
        Phase::Done => unreachable!("finished threads are never scheduled"),
    }
}

fn step_op(
    engine: &mut EventStructureEngine,
    mutexes: &[ObjectId],
    store: &mut MemoryStore,
    state: &mut ThreadState,
    thread: ThreadId,
    op: &Op,
) -> StepResult {
    let code_location = CodeLocation::new(
        "program",
        "Program",
        &format!("thread{}", thread - 1),
        state.pc as u32,
    );
    match op {
        Op::Read { location, register } => {
            match engine.on_shared_read(thread, location.clone(), false, code_location) {
                EngineAction::Ready(value) => {
                    state.registers[*register] = value;
                    state.pc += 1;
                    StepResult::Progress
                }
                EngineAction::Switch(_) => StepResult::Switch,
                EngineAction::Blocked => unreachable!("reads never block"),
            }
        }
        Op::Write { location, value } => {
            let value = resolve(state, value);
            match engine.on_shared_write(thread, location.clone(), value, false, code_location) {
                EngineAction::Ready(()) => {
                    // The engine admitted the write; perform it on live
                    // memory.
                    if let Err(e) = location.write(store, value) {
                        return StepResult::Failed(Failure::UnexpectedException {
                            actor: thread - 1,
                            message: e.to_string(),
                        });
                    }
                    state.pc += 1;
                    StepResult::Progress
                }
                EngineAction::Switch(_) => StepResult::Switch,
                EngineAction::Blocked => unreachable!("writes never block"),
            }
        }
        Op::BranchIf {
            register,
            equals,
            target,
        } => {
            let taken = state.registers[*register] == resolve(state, equals);
            state.pc = if taken { *target } else { state.pc + 1 };
            StepResult::Progress
        }
        Op::Goto { target } => {
            state.pc = *target;
            StepResult::Progress
        }
        Op::Assert { register, equals } => {
            let expected = resolve(state, equals);
            let actual = state.registers[*register];
            if actual != expected {
                return StepResult::Failed(Failure::UnexpectedException {
                    actor: thread - 1,
                    message: format!("assertion failed: {actual:?} != {expected:?}"),
                });
            }
            state.pc += 1;
            StepResult::Progress
        }
        Op::Lock { mutex } => match engine.on_lock_acquire(thread, mutexes[*mutex]) {
            EngineAction::Ready(()) => {
                state.pc += 1;
                StepResult::Progress
            }
            EngineAction::Switch(_) => StepResult::Switch,
            EngineAction::Blocked => StepResult::Blocked,
        },
        Op::Unlock { mutex } => match engine.on_lock_release(thread, mutexes[*mutex]) {
            EngineAction::Ready(()) => {
                state.pc += 1;
                StepResult::Progress
            }
            EngineAction::Switch(_) => StepResult::Switch,
            EngineAction::Blocked => unreachable!("unlock never blocks"),
        },
        Op::Park => match engine.on_park(thread) {
            EngineAction::Ready(()) => {
                state.pc += 1;
                StepResult::Progress
            }
            EngineAction::Switch(_) => StepResult::Switch,
            EngineAction::Blocked => StepResult::Blocked,
        },
        Op::Unpark { thread: target } => match engine.on_unpark(thread, tid(*target)) {
            EngineAction::Ready(()) => {
                state.pc += 1;
                StepResult::Progress
            }
            EngineAction::Switch(_) => StepResult::Switch,
            EngineAction::Blocked => unreachable!("unpark never blocks"),
        },
    }
}

fn resolve(state: &ThreadState, operand: &Operand) -> ValueId {
    match operand {
        Operand::Const(v) => *v,
        Operand::Reg(i) => state.registers[*i],
        Operand::Plus(i, k) => ValueId::int(state.registers[*i].as_int().unwrap_or(0) + k),
    }
}
