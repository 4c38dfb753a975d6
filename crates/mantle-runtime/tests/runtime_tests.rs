//! Runtime integration tests
//!
//! Several mutator threads share one runtime, with collections requested
//! from outside, run by the background collector, or forced by a small
//! heap.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use mantle_gc::{ClassRef, GcConfig, ObjectClass, ObjectKind, Value};
use mantle_runtime::{
    Mutator, NativeLockPolicy, RuntimeConfig, RuntimeError, RuntimePhase, SharedState,
};

fn running(config: RuntimeConfig) -> Arc<SharedState> {
    let shared = Arc::new(SharedState::new(config));
    shared.set_running().unwrap();
    shared
}

struct Point {
    class: ClassRef,
}

impl ObjectClass for Point {
    fn class_ref(&self) -> ClassRef {
        self.class
    }

    fn instance_fields(&self) -> usize {
        2
    }

    fn name(&self) -> &str {
        "Point"
    }
}

#[test]
fn test_user_class_instances() {
    let shared = running(RuntimeConfig::default());
    let mutator = Mutator::new(&shared).unwrap();
    let point = Point {
        class: shared.new_class_ref(),
    };

    let object = mutator.allocate_object(&point).unwrap();
    mutator.push_root(Value::Ref(object));
    mutator.write_field(object, 0, Value::Fixnum(3)).unwrap();
    mutator.write_field(object, 1, Value::Fixnum(4)).unwrap();
    mutator.collect_garbage().unwrap();

    let heap = shared.heap();
    assert_eq!(heap.class_of(object).unwrap(), point.class);
    assert_eq!(heap.kind_of(object).unwrap(), ObjectKind::Instance);
    assert_eq!(mutator.read_field(object, 1).unwrap(), Value::Fixnum(4));
    assert_eq!(mutator.read_field(object, 2).unwrap(), Value::Nil);
}

#[test]
fn test_mutators_with_background_collector() {
    const MUTATORS: usize = 3;
    const ITERATIONS: i64 = 1_500;

    let shared = running(RuntimeConfig {
        gc: GcConfig {
            allocation_count_threshold: 500,
            mark_step_budget: 16,
            ..GcConfig::default()
        },
        background_collector: true,
        background_poll: Duration::from_millis(1),
        ..RuntimeConfig::default()
    });
    assert!(shared.collector().background_running());

    let workers: Vec<_> = (0..MUTATORS)
        .map(|_| {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                let mutator = Mutator::new(&shared).unwrap();
                let list = mutator.allocate_array(0).unwrap();
                mutator.push_root(Value::Ref(list));

                for i in 0..ITERATIONS {
                    let boxed = mutator.allocate_fields(1).unwrap();
                    // every call below is a safe point
                    let slot = mutator.push_root(Value::Ref(boxed));
                    mutator.write_field(boxed, 0, Value::Fixnum(i)).unwrap();
                    mutator.array_unshift(list, Value::Ref(boxed)).unwrap();
                    mutator.truncate_roots(slot);
                    if i % 4 == 0 {
                        mutator.array_pop(list).unwrap();
                    }
                    // garbage
                    mutator.allocate_float(i as f64).unwrap();
                }

                mutator.safe_point().unwrap();
                let values = mutator.array_to_vec(list).unwrap();
                let mut previous = ITERATIONS;
                for value in values {
                    let Value::Ref(boxed) = value else {
                        panic!("lost element {value:?}");
                    };
                    let Value::Fixnum(tag) = mutator.read_field(boxed, 0).unwrap() else {
                        panic!("lost tag");
                    };
                    assert!(tag < previous);
                    previous = tag;
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
    assert!(shared.collector().completed_cycles() > 0);
    shared.shutdown().unwrap();
    assert!(!shared.collector().background_running());
}

#[test]
fn test_gc_soon_from_another_thread() {
    let shared = running(RuntimeConfig::default());
    let done = Arc::new(AtomicBool::new(false));

    let worker = {
        let shared = Arc::clone(&shared);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mutator = Mutator::new(&shared).unwrap();
            let keep = mutator.allocate_fields(1).unwrap();
            mutator.push_root(Value::Ref(keep));
            while !done.load(Ordering::Acquire) {
                mutator.safe_point().unwrap();
            }
            assert!(shared.heap().is_live(keep));
        })
    };

    while shared.threads_count() == 0 {
        thread::yield_now();
    }
    shared.gc_soon();
    while shared.collector().completed_cycles() == 0 {
        thread::yield_now();
    }
    done.store(true, Ordering::Release);
    worker.join().unwrap();
}

#[test]
fn test_collection_proceeds_while_thread_is_native() {
    let shared = running(RuntimeConfig {
        native_lock_policy: NativeLockPolicy::PerLibrary,
        ..RuntimeConfig::default()
    });
    let entered = Arc::new(AtomicBool::new(false));
    let release = Arc::new(AtomicBool::new(false));

    let worker = {
        let shared = Arc::clone(&shared);
        let entered = Arc::clone(&entered);
        let release = Arc::clone(&release);
        thread::spawn(move || {
            let mutator = Mutator::new(&shared).unwrap();
            let index = shared.native_lock_index("sqlite");
            mutator
                .with_native(index, || {
                    entered.store(true, Ordering::Release);
                    while !release.load(Ordering::Acquire) {
                        thread::sleep(Duration::from_millis(1));
                    }
                })
                .unwrap();
            mutator.safe_point().unwrap();
        })
    };

    while !entered.load(Ordering::Acquire) {
        thread::yield_now();
    }
    let main = Mutator::new(&shared).unwrap();
    main.collect_garbage().unwrap();
    release.store(true, Ordering::Release);
    worker.join().unwrap();
    assert_eq!(shared.collector().stats().safe_point_timeouts, 0);
}

#[test]
fn test_native_lock_serializes_library_calls() {
    let shared = running(RuntimeConfig {
        native_lock_policy: NativeLockPolicy::Global,
        ..RuntimeConfig::default()
    });
    let inside = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = ["zlib", "yaml", "zlib", "json"]
        .into_iter()
        .map(|library| {
            let shared = Arc::clone(&shared);
            let inside = Arc::clone(&inside);
            thread::spawn(move || {
                let mutator = Mutator::new(&shared).unwrap();
                let index = shared.native_lock_index(library);
                for _ in 0..100 {
                    mutator
                        .with_native(index, || {
                            assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                            thread::yield_now();
                            inside.fetch_sub(1, Ordering::SeqCst);
                        })
                        .unwrap();
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
}

#[test]
fn test_shutdown_refuses_new_mutators() {
    let shared = running(RuntimeConfig::default());
    let existing = Mutator::new(&shared).unwrap();
    shared.shutdown().unwrap();
    assert_eq!(shared.phase(), RuntimePhase::Halting);
    assert!(matches!(Mutator::new(&shared), Err(RuntimeError::Halting)));
    // a halted collector no longer runs cycles, but safe points still work
    shared.gc_soon();
    existing.safe_point().unwrap();
    assert_eq!(shared.collector().completed_cycles(), 0);
}

#[test]
fn test_small_heap_survives_on_retry() {
    let shared = running(RuntimeConfig {
        gc: GcConfig {
            max_heap_bytes: 4 * 1024,
            ..GcConfig::default()
        },
        ..RuntimeConfig::default()
    });
    let mutator = Mutator::new(&shared).unwrap();
    let list = mutator.allocate_array(0).unwrap();
    mutator.push_root(Value::Ref(list));

    // far more garbage than the heap holds; retries keep it going
    for i in 0..2_000 {
        mutator.allocate_fields(8).unwrap();
        if i % 100 == 0 {
            let kept = mutator.allocate_float(i as f64).unwrap();
            mutator.push_root(Value::Ref(kept));
            mutator.array_append(list, Value::Ref(kept)).unwrap();
            mutator.pop_root();
        }
    }

    assert!(shared.collector().completed_cycles() > 0);
    let values = mutator.array_to_vec(list).unwrap();
    assert_eq!(values.len(), 20);
    for (n, value) in values.into_iter().enumerate() {
        let Value::Ref(kept) = value else {
            panic!("lost float {n}");
        };
        assert_eq!(shared.heap().float_value(kept).unwrap(), (n * 100) as f64);
    }
}
