mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::{Probe, TestGlobal, new_isolate};
use openworkers_jsg::gc::Releasable;
use openworkers_jsg::{DeferredItem, JsValue, Ref};

struct Counted {
    released: Arc<AtomicUsize>,
    dropped: Arc<AtomicUsize>,
}

impl Releasable for Counted {
    fn remove_strong_ref(&self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

impl Drop for Counted {
    fn drop(&mut self) {
        self.dropped.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_items_deferred_from_many_threads_are_finalized_once() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 500;

    let isolate = Arc::new(new_isolate());
    let released = Arc::new(AtomicUsize::new(0));
    let dropped = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..THREADS {
        let isolate = isolate.clone();
        let released = released.clone();
        let dropped = dropped.clone();

        handles.push(tokio::task::spawn_blocking(move || {
            for i in 0..PER_THREAD {
                let item = Arc::new(Counted {
                    released: released.clone(),
                    dropped: dropped.clone(),
                });
                isolate.defer_destruction(DeferredItem::release(i % 2 == 0, item));
            }
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(isolate.pending_destructions(), (THREADS * PER_THREAD) as u64);
    assert_eq!(dropped.load(Ordering::SeqCst), 0);

    let before = isolate.finalized_destructions();
    isolate.run_in_lock_scope(|_lock| {
        assert_eq!(dropped.load(Ordering::SeqCst), THREADS * PER_THREAD);
    });

    assert_eq!(released.load(Ordering::SeqCst), THREADS * PER_THREAD / 2);
    assert_eq!(isolate.pending_destructions(), 0);
    assert_eq!(
        isolate.finalized_destructions() - before,
        (THREADS * PER_THREAD) as u64
    );

    isolate.run_in_lock_scope(|_lock| {});
    assert_eq!(dropped.load(Ordering::SeqCst), THREADS * PER_THREAD);
}

#[test]
fn test_globals_dropped_off_thread_are_deferred() {
    let isolate = new_isolate();

    let (ctx, values) = isolate.run_in_lock_scope(|lock| {
        let ctx = lock.new_context(Ref::new(TestGlobal::default())).unwrap();
        let values: Vec<JsValue> = (0..10)
            .map(|i| lock.wrap(&ctx, format!("value {i}")).unwrap())
            .collect();
        (ctx, values)
    });

    std::thread::spawn(move || drop(values)).join().unwrap();
    assert_eq!(isolate.pending_destructions(), 10);

    isolate.run_in_lock_scope(|lock| {
        assert_eq!(lock.evaluate_as::<i32>(&ctx, "40 + 2").unwrap(), 42);
    });
    assert_eq!(isolate.pending_destructions(), 0);

    drop(ctx);
    assert_eq!(isolate.pending_destructions(), 1);
}

#[test]
fn test_collected_resource_is_finalized_at_next_lock() {
    let isolate = new_isolate();
    let drops = Arc::new(AtomicUsize::new(0));

    let ctx = isolate.run_in_lock_scope(|lock| {
        let ctx = lock.new_context(Ref::new(TestGlobal::default())).unwrap();

        let probe = Ref::new(Probe::new(20, 22, &drops));
        let value = lock.wrap(&ctx, probe.clone()).unwrap();
        let sum = lock
            .evaluate(&ctx, "(p) => p.sum()")
            .and_then(|f| lock.call(&ctx, &f, &[&value]))
            .and_then(|result| lock.unwrap::<i32>(&ctx, &result))
            .unwrap();
        assert_eq!(sum, 42);

        assert_eq!(probe.strong_refs(), 1);
        assert!(probe.is_wrapped());
        ctx
    });

    let before = isolate.finalized_destructions();

    isolate.run_in_lock_scope(|lock| {
        for _ in 0..3 {
            lock.request_gc();
        }
    });

    // The collector only queued the release; nothing was freed yet.
    assert_eq!(drops.load(Ordering::SeqCst), 0);
    assert!(isolate.pending_destructions() >= 1);

    isolate.run_in_lock_scope(|_lock| {});
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert!(isolate.finalized_destructions() > before);

    drop(ctx);
}

#[test]
fn test_native_ref_keeps_proxy_alive() {
    let isolate = new_isolate();
    let drops = Arc::new(AtomicUsize::new(0));
    let probe = Ref::new(Probe::new(1, 1, &drops));

    let ctx = isolate.run_in_lock_scope(|lock| {
        let ctx = lock.new_context(Ref::new(TestGlobal::default())).unwrap();
        lock.wrap(&ctx, probe.clone()).unwrap();
        ctx
    });

    isolate.run_in_lock_scope(|lock| {
        lock.request_gc();
        lock.request_gc();
    });
    isolate.run_in_lock_scope(|_lock| {});

    assert_eq!(drops.load(Ordering::SeqCst), 0);
    assert!(probe.is_wrapped());

    // Dropping the last native reference off the lock defers the handle reset.
    std::thread::spawn(move || drop(probe)).join().unwrap();
    assert_eq!(isolate.pending_destructions(), 1);

    isolate.run_in_lock_scope(|lock| {
        lock.request_gc();
    });
    isolate.run_in_lock_scope(|_lock| {});
    assert_eq!(drops.load(Ordering::SeqCst), 1);

    drop(ctx);
}

#[test]
fn test_isolate_drop_finalizes_everything() {
    let drops = Arc::new(AtomicUsize::new(0));
    let probe = Ref::new(Probe::new(0, 0, &drops));

    {
        let isolate = new_isolate();
        isolate.run_in_lock_scope(|lock| {
            let ctx = lock.new_context(Ref::new(TestGlobal::default())).unwrap();
            lock.wrap(&ctx, probe.clone()).unwrap();
        });
    }

    // The proxy is gone; the native object survives through its own Ref.
    assert_eq!(drops.load(Ordering::SeqCst), 0);
    assert_eq!(probe.a, 0);

    drop(probe);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}
