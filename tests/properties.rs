//! Property tests for the structural invariants of the event model.

use proptest::prelude::*;
use smallvec::SmallVec;

use weft::{
    synchronize, CodeLocation, EngineAction, EngineContext, EventArena, EventId,
    EventStructureEngine, EventLabel, MemoryLocation, PrimitiveValue, ValueId, VersionVec,
};

fn code_location() -> CodeLocation {
    CodeLocation::new("prop.rs", "Prop", "run", 1)
}

fn location(idx: usize) -> MemoryLocation {
    MemoryLocation::static_field("Prop", ["a", "b", "c"][idx % 3])
}

fn primitive() -> impl Strategy<Value = PrimitiveValue> {
    prop_oneof![
        any::<bool>().prop_map(PrimitiveValue::Bool),
        any::<i8>().prop_map(PrimitiveValue::I8),
        any::<i16>().prop_map(PrimitiveValue::I16),
        any::<i32>().prop_map(PrimitiveValue::I32),
        any::<i64>().prop_map(PrimitiveValue::I64),
        any::<char>().prop_map(PrimitiveValue::Char),
        any::<f32>().prop_map(PrimitiveValue::from_f32),
        any::<f64>().prop_map(PrimitiveValue::from_f64),
    ]
}

proptest! {
    /// Event monotonicity and causality-clock correctness over randomly
    /// shaped event DAGs: `parent.id < id`, every dependency id is
    /// smaller, and the clock is the pointwise maximum of the linked
    /// clocks with the event's own slot set.
    #[test]
    fn event_ids_monotonic_and_clocks_correct(
        steps in prop::collection::vec((0usize..3, any::<bool>()), 1..40)
    ) {
        let mut arena = EventArena::new();
        let mut last: Vec<Option<EventId>> = vec![None; 3];
        let mut all: Vec<EventId> = Vec::new();

        for (thread, with_dep) in steps {
            let dep = if with_dep {
                all.iter().rev().find(|&&e| arena.get(e).thread != thread).copied()
            } else {
                None
            };
            let deps: SmallVec<[EventId; 2]> = dep.into_iter().collect();
            let id = arena.push(
                thread,
                EventLabel::Random { value: 0 },
                last[thread],
                deps.clone(),
                None,
                None,
            );

            let event = arena.get(id);
            if let Some(parent) = event.parent {
                prop_assert!(parent < id);
                prop_assert_eq!(arena.get(parent).thread, thread);
                prop_assert_eq!(arena.get(parent).position + 1, event.position);
            } else {
                prop_assert_eq!(event.position, 0);
            }
            for &d in &event.dependencies {
                prop_assert!(d < id);
            }

            let mut expected = VersionVec::new();
            if let Some(parent) = event.parent {
                expected.join(&arena.get(parent).clock);
            }
            for &d in &event.dependencies {
                expected.join(&arena.get(d).clock);
            }
            expected.observe(thread, event.position);
            prop_assert_eq!(&expected, &event.clock);

            last[thread] = Some(id);
            all.push(id);
        }
    }

    /// Sync-algebra totality on legal pairs: a send and a request of the
    /// same family over the same resource always produce the response with
    /// the expected fields.
    #[test]
    fn sync_algebra_total_on_matching_pairs(
        mutex in 2u64..32,
        value in any::<i64>(),
        thread in 0usize..4,
    ) {
        let loc = location(0);
        let write = EventLabel::Write {
            location: loc.clone(),
            value: ValueId::int(value),
            exclusive: false,
            code_location: code_location(),
        };
        let read = EventLabel::ReadRequest {
            location: loc,
            exclusive: false,
            code_location: code_location(),
        };
        let response = synchronize(&write, &read).expect("write responds to read");
        prop_assert_eq!(response.value(), Some(ValueId::int(value)));
        prop_assert!(read.responds_to(&response));

        let unlock = EventLabel::Unlock {
            mutex,
            reentry: false,
            depth: 1,
            synthetic: false,
        };
        let lock = EventLabel::LockRequest {
            mutex,
            reentry: false,
            depth: 1,
            synthetic: false,
        };
        let response = synchronize(&unlock, &lock).expect("unlock responds to lock");
        prop_assert_eq!(response.mutex(), Some(mutex));
        prop_assert!(lock.responds_to(&response));

        let unpark = EventLabel::Unpark { target: thread };
        let park = EventLabel::ParkRequest { thread };
        let response = synchronize(&unpark, &park).expect("unpark responds to park");
        prop_assert!(park.responds_to(&response));

        let notify = EventLabel::Notify { mutex, broadcast: false };
        let wait = EventLabel::WaitRequest { mutex };
        let response = synchronize(&notify, &wait).expect("notify responds to wait");
        prop_assert!(wait.responds_to(&response));
    }

    /// Round-trip: primitive values embed into `ValueId` by equality.
    #[test]
    fn primitive_values_round_trip(p in primitive()) {
        let id = ValueId::Primitive(p);
        prop_assert_eq!(id, ValueId::Primitive(p));
        if let Some(i) = p.as_int() {
            prop_assert_eq!(id.as_int(), Some(i));
        }
    }

    /// Driving the engine with a random script of reads and writes keeps
    /// the execution invariants: contiguous per-thread positions, at most
    /// one response per request, and the frontier equal to the last event
    /// of each thread.
    #[test]
    fn execution_invariants_hold_under_random_scripts(
        script in prop::collection::vec((0usize..2, any::<bool>(), 0usize..3, any::<i8>()), 1..30)
    ) {
        let ctx = EngineContext::default().with_memory_initializer(|_| ValueId::int(0));
        let mut engine = EventStructureEngine::new(0, ctx);
        engine.initialize_exploration();

        for (thread, is_read, loc_idx, value) in script {
            if is_read {
                match engine.on_shared_read(thread, location(loc_idx), false, code_location()) {
                    EngineAction::Ready(_) => {}
                    other => prop_assert!(false, "read did not complete: {:?}", other),
                }
            } else {
                match engine.on_shared_write(
                    thread,
                    location(loc_idx),
                    ValueId::int(value as i64),
                    false,
                    code_location(),
                ) {
                    EngineAction::Ready(()) => {}
                    other => prop_assert!(false, "write did not complete: {:?}", other),
                }
            }
        }

        let execution = engine.execution();
        let arena = engine.arena();

        for thread in 0..execution.num_threads() {
            for (position, &event) in execution.thread_events(thread).iter().enumerate() {
                let e = arena.get(event);
                prop_assert_eq!(e.thread, thread);
                prop_assert_eq!(e.position, position);
                if let Some(parent) = e.parent {
                    prop_assert!(parent < event);
                }
                for &d in e.dependencies.iter() {
                    prop_assert!(d < event);
                    // Dependency closure: every dependency is in the
                    // execution too.
                    prop_assert!(execution.contains(arena, d));
                }
            }
        }

        // At most one response per request.
        for &event in &execution.events_in_order() {
            let e = arena.get(event);
            if e.label.is_request() {
                let responses = execution
                    .events_in_order()
                    .into_iter()
                    .filter(|&r| {
                        let re = arena.get(r);
                        re.parent == Some(event) && re.label.is_response()
                    })
                    .count();
                prop_assert!(responses <= 1);
            }
        }
    }
}
