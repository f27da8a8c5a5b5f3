//! End-to-end exploration scenarios.
//!
//! Each test builds a small concurrent program, lets the engine explore
//! its executions, and checks that the interesting schedules (lost
//! updates, stale publication reads, broken mutual exclusion, parking
//! handshakes, spin loops) are found, or correctly absent.

use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use weft::{
    explore, CheckConfig, CodeLocation, EngineAction, EngineContext, EventStructureEngine,
    Failure, FixedActiveThreadsExecutor, MemoryLocation, Op, Operand, Program, Task, ValueId,
};

fn loc(field: &str) -> MemoryLocation {
    MemoryLocation::static_field("Scenario", field)
}

fn int(v: i64) -> Operand {
    Operand::Const(ValueId::int(v))
}

/// S1: two unsynchronized `x = x + 1` increments. The engine must find the
/// lost update: an execution ending at 1 where both reads observed 0.
#[test]
fn s1_counter_race_finds_lost_update() {
    let x = loc("x");
    let increment = |obs: MemoryLocation| {
        vec![
            Op::Read {
                location: x.clone(),
                register: 0,
            },
            Op::Write {
                location: obs,
                value: Operand::Reg(0),
            },
            Op::Write {
                location: x.clone(),
                value: Operand::Plus(0, 1),
            },
        ]
    };
    let program = Program {
        threads: vec![increment(loc("obs0")), increment(loc("obs1"))],
        registers: 1,
        mutexes: 0,
    };

    let lost = RefCell::new(Vec::new());
    let result = explore(
        &program,
        |state| {
            let total = state.read_int(&loc("x"));
            if total != 2 {
                lost.borrow_mut().push((
                    state.read_int(&loc("obs0")),
                    state.read_int(&loc("obs1")),
                    total,
                ));
            }
            total == 2
        },
        &CheckConfig::default(),
    );

    assert!(!result.all_passed, "the lost update must be discovered");
    let lost = lost.borrow();
    assert!(
        lost.iter().any(|&(a, b, total)| total == 1 && a == 0 && b == 0),
        "an execution with both reads observing 0 and a final value of 1 \
         must exist, got {lost:?}"
    );
}

/// S2: publication without ordering. Thread A writes data then sets the
/// flag; thread B spins on the flag then reads data. With plain accesses
/// an execution exists where B sees the flag but reads stale data.
#[test]
fn s2_publication_admits_stale_read() {
    let program = Program {
        threads: vec![
            vec![
                Op::Write {
                    location: loc("data"),
                    value: int(42),
                },
                Op::Write {
                    location: loc("flag"),
                    value: int(1),
                },
            ],
            vec![
                Op::Read {
                    location: loc("flag"),
                    register: 0,
                },
                Op::BranchIf {
                    register: 0,
                    equals: int(0),
                    target: 0,
                },
                Op::Read {
                    location: loc("data"),
                    register: 1,
                },
                Op::Write {
                    location: loc("obs"),
                    value: Operand::Reg(1),
                },
            ],
        ],
        registers: 2,
        mutexes: 0,
    };

    let observed = RefCell::new(Vec::new());
    let config = CheckConfig {
        spin_bound: Some(3),
        ..CheckConfig::default()
    };
    let result = explore(
        &program,
        |state| {
            let obs = state.read_int(&loc("obs"));
            observed.borrow_mut().push(obs);
            obs == 42
        },
        &config,
    );

    assert!(!result.all_passed, "the relaxed search must reach a stale read");
    assert!(
        observed.borrow().contains(&0),
        "an execution where the flag is up but data reads 0 must exist, \
         got {:?}",
        observed.borrow()
    );
    assert!(
        observed.borrow().contains(&42),
        "the published value must also be observable"
    );
}

/// S3: Dekker-style mutual exclusion from plain flags. The engine must
/// reach the critical section in both threads and report the asserted
/// violation.
#[test]
fn s3_dekker_flags_are_insufficient() {
    let flag = |i: usize| loc(if i == 0 { "flag0" } else { "flag1" });
    let cs = |i: usize| loc(if i == 0 { "cs0" } else { "cs1" });
    let entry = |i: usize| {
        vec![
            /* 0 */
            Op::Write {
                location: flag(i),
                value: int(1),
            },
            /* 1 */
            Op::Write {
                location: loc("turn"),
                value: int(1 - i as i64),
            },
            /* 2 */
            Op::Read {
                location: flag(1 - i),
                register: 0,
            },
            /* 3 */
            Op::BranchIf {
                register: 0,
                equals: int(0),
                target: 7,
            },
            /* 4 */
            Op::Read {
                location: loc("turn"),
                register: 1,
            },
            /* 5 */
            Op::BranchIf {
                register: 1,
                equals: int(i as i64),
                target: 7,
            },
            /* 6 */
            Op::Goto { target: 2 },
            // Critical section: claim it, check the other side is out.
            /* 7 */
            Op::Write {
                location: cs(i),
                value: int(1),
            },
            /* 8 */
            Op::Read {
                location: cs(1 - i),
                register: 2,
            },
            /* 9 */
            Op::Assert {
                register: 2,
                equals: int(0),
            },
            /* 10 */
            Op::Write {
                location: cs(i),
                value: int(0),
            },
            /* 11 */
            Op::Write {
                location: flag(i),
                value: int(0),
            },
        ]
    };
    let program = Program {
        threads: vec![entry(0), entry(1)],
        registers: 3,
        mutexes: 0,
    };
    let config = CheckConfig {
        spin_bound: Some(2),
        max_executions: Some(5000),
        ..CheckConfig::default()
    };
    let result = explore(&program, |_| true, &config);

    assert!(!result.all_passed, "mutual exclusion must be violated");
    assert!(
        result
            .failures
            .iter()
            .any(|(_, f)| matches!(f, Failure::UnexpectedException { .. })),
        "the claimed-mutex assertion must fire: {:?}",
        result.failures
    );
}

/// S4: park/unpark ping-pong. The park synchronizes with the unpark and
/// the main thread's join completes in every execution.
#[test]
fn s4_park_unpark_ping_pong() {
    let program = Program {
        threads: vec![vec![Op::Park], vec![Op::Unpark { thread: 0 }]],
        registers: 0,
        mutexes: 0,
    };
    let result = explore(&program, |_| true, &CheckConfig::default());
    assert!(result.all_passed, "no execution may deadlock: {:?}", result.failures);
    assert!(result.executions_explored >= 1);
    assert!(
        !result
            .failures
            .iter()
            .any(|(_, f)| matches!(f, Failure::Deadlock { .. })),
        "the join on the parked thread must always complete"
    );
}

/// S5: the worker pool raises a timeout for a runaway task and stays
/// reusable afterwards.
#[test]
fn s5_executor_submit_timeout_then_reuse() {
    let mut pool = FixedActiveThreadsExecutor::new("weft-test", 2);
    let release = Arc::new(AtomicBool::new(false));
    let looper = Arc::clone(&release);
    let tasks: Vec<Task> = vec![
        Box::new(|| {}),
        Box::new(move || {
            while !looper.load(Ordering::Acquire) {
                std::hint::spin_loop();
            }
        }),
    ];

    let outcome = pool.submit_and_await(tasks, Duration::from_millis(200));
    assert!(matches!(outcome, Err(Failure::Timeout { .. })));

    release.store(true, Ordering::Release);
    let counter = Arc::new(AtomicUsize::new(0));
    let tasks: Vec<Task> = (0..2)
        .map(|_| {
            let counter = Arc::clone(&counter);
            Box::new(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            }) as Task
        })
        .collect();
    pool.submit_and_await(tasks, Duration::from_secs(5))
        .expect("the pool must be reusable after a timeout");
    assert_eq!(counter.load(Ordering::Relaxed), 2);
}

/// A panicking task reaches the submitting thread (unexpected-failure
/// surfacing for the pool).
#[test]
fn s5_executor_rethrows_task_panics() {
    let mut pool = FixedActiveThreadsExecutor::new("weft-test", 2);
    let tasks: Vec<Task> = vec![Box::new(|| {}), Box::new(|| panic!("actor failure"))];
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        pool.submit_and_await(tasks, Duration::from_secs(5))
    }));
    assert!(outcome.is_err());
}

/// S6: a spin loop against a single writer. The spin bound forces a
/// switch, the writer runs, and the reader's next read sees the new value.
#[test]
fn s6_spin_loop_terminates_after_switch() {
    let program = Program {
        threads: vec![
            // Reader first, so it actually spins before the writer runs.
            vec![
                Op::Read {
                    location: loc("x"),
                    register: 0,
                },
                Op::BranchIf {
                    register: 0,
                    equals: int(0),
                    target: 0,
                },
                Op::Write {
                    location: loc("obs"),
                    value: Operand::Reg(0),
                },
            ],
            vec![Op::Write {
                location: loc("x"),
                value: int(1),
            }],
        ],
        registers: 1,
        mutexes: 0,
    };
    let config = CheckConfig {
        spin_bound: Some(3),
        ..CheckConfig::default()
    };
    let result = explore(
        &program,
        |state| state.read_int(&loc("obs")) == 1 && state.read_int(&loc("x")) == 1,
        &config,
    );
    assert!(
        result.all_passed,
        "every execution terminates with the written value: {:?}",
        result.failures
    );
    assert!(result.executions_explored >= 1);
}

/// Lock-protected increments never lose updates, and the exploration still
/// covers both acquisition orders.
#[test]
fn lock_protected_counter_has_no_lost_updates() {
    let x = loc("x");
    let guarded = || {
        vec![
            Op::Lock { mutex: 0 },
            Op::Read {
                location: x.clone(),
                register: 0,
            },
            Op::Write {
                location: x.clone(),
                value: Operand::Plus(0, 1),
            },
            Op::Unlock { mutex: 0 },
        ]
    };
    let program = Program {
        threads: vec![guarded(), guarded()],
        registers: 1,
        mutexes: 1,
    };
    let result = explore(
        &program,
        |state| state.read_int(&loc("x")) == 2,
        &CheckConfig::default(),
    );
    assert!(result.all_passed, "{:?}", result.failures);
    assert!(
        result.executions_explored >= 2,
        "both acquisition orders must be explored"
    );
}

/// The full control flow with real OS threads: the engine proposes a
/// schedule, the worker pool runs the threads, interception callbacks
/// enter the engine under the schedule lock (spinning until the replayer
/// admits them), and the loop continues until the backtracking stack is
/// empty. The counter race must surface both final values.
#[test]
fn pool_runs_engine_schedules_to_exhaustion() {
    fn x() -> MemoryLocation {
        MemoryLocation::static_field("Pool", "x")
    }
    fn cl(line: u32) -> CodeLocation {
        CodeLocation::new("pool.rs", "Pool", "increment", line)
    }

    let ctx = EngineContext::default().with_memory_initializer(|_| ValueId::int(0));
    let engine = Arc::new(Mutex::new(EventStructureEngine::new(0, ctx)));
    let mut pool = FixedActiveThreadsExecutor::new("weft-sched", 2);
    let mut finals = Vec::new();

    loop {
        engine.lock().unwrap().initialize_exploration();
        let tasks: Vec<Task> = (1..=2usize)
            .map(|t| {
                let engine = Arc::clone(&engine);
                Box::new(move || {
                    // x = x + 1 with plain accesses; every callback retries
                    // until the engine lets this thread advance.
                    let seen = loop {
                        match engine.lock().unwrap().on_shared_read(t, x(), false, cl(1)) {
                            EngineAction::Ready(v) => break v,
                            _ => thread::yield_now(),
                        }
                    };
                    let next = ValueId::int(seen.as_int().unwrap_or(0) + 1);
                    loop {
                        match engine
                            .lock()
                            .unwrap()
                            .on_shared_write(t, x(), next, false, cl(2))
                        {
                            EngineAction::Ready(()) => break,
                            _ => thread::yield_now(),
                        }
                    }
                    loop {
                        match engine.lock().unwrap().on_thread_finish(t) {
                            EngineAction::Ready(()) => break,
                            _ => thread::yield_now(),
                        }
                    }
                }) as Task
            })
            .collect();

        pool.submit_and_await(tasks, Duration::from_secs(10))
            .expect("schedules complete well within the budget");

        {
            let engine = engine.lock().unwrap();
            let final_x = engine
                .execution()
                .last_write(&x())
                .and_then(|w| engine.arena().get(w).label.value())
                .and_then(ValueId::as_int)
                .expect("both threads wrote x");
            finals.push(final_x);
        }
        if !engine.lock().unwrap().start_next_exploration() {
            break;
        }
    }

    assert!(finals.contains(&2), "the sequential outcome exists: {finals:?}");
    assert!(finals.contains(&1), "the lost update exists: {finals:?}");
    let engine = engine.lock().unwrap();
    assert_eq!(
        engine.backtracking_points_created(),
        engine.backtracking_points_visited(),
        "exhaustion visits every backtracking point"
    );
}

/// A thread parking with nobody to unpark it is a deadlock, and the driver
/// reports it instead of hanging.
#[test]
fn park_without_unpark_reports_deadlock() {
    let program = Program {
        threads: vec![vec![Op::Park]],
        registers: 0,
        mutexes: 0,
    };
    let result = explore(&program, |_| true, &CheckConfig::default());
    assert!(!result.all_passed);
    assert!(result
        .failures
        .iter()
        .any(|(_, f)| matches!(f, Failure::Deadlock { .. })));
}
