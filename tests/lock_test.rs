mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use common::{TestGlobal, new_isolate};
use openworkers_jsg::{JsLock, Ref};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lock_scopes_never_interleave() {
    const THREADS: usize = 4;
    const ROUNDS: usize = 25;

    let isolate = Arc::new(new_isolate());
    let inside = Arc::new(AtomicBool::new(false));
    let entered = Arc::new(AtomicUsize::new(0));

    let ctx = isolate.run_in_lock_scope(|lock| {
        let ctx = lock.new_context(Ref::new(TestGlobal::default())).unwrap();
        lock.evaluate(&ctx, "globalThis.counter = 0").unwrap();
        ctx
    });
    let ctx = Arc::new(std::sync::Mutex::new(Some(ctx)));

    let mut handles = Vec::new();
    for _ in 0..THREADS {
        let isolate = isolate.clone();
        let inside = inside.clone();
        let entered = entered.clone();
        let ctx = ctx.clone();

        handles.push(tokio::task::spawn_blocking(move || {
            for _ in 0..ROUNDS {
                isolate.run_in_lock_scope(|lock| {
                    assert!(
                        !inside.swap(true, Ordering::SeqCst),
                        "two threads inside the same isolate"
                    );
                    assert_eq!(JsLock::current(), Some(isolate.id()));

                    let guard = ctx.lock().unwrap();
                    let ctx = guard.as_ref().unwrap();
                    lock.evaluate(ctx, "counter++").unwrap();

                    std::thread::sleep(Duration::from_micros(200));
                    entered.fetch_add(1, Ordering::SeqCst);
                    inside.store(false, Ordering::SeqCst);
                });
            }
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(entered.load(Ordering::SeqCst), THREADS * ROUNDS);

    let ctx = ctx.lock().unwrap().take().unwrap();
    let count = isolate.run_in_lock_scope(|lock| lock.evaluate_as::<u32>(&ctx, "counter").unwrap());
    assert_eq!(count as usize, THREADS * ROUNDS);
    assert_eq!(JsLock::current(), None);
}

#[test]
#[should_panic(expected = "already locked")]
fn test_reentering_the_same_isolate_panics() {
    let isolate = new_isolate();

    isolate.run_in_lock_scope(|_outer| {
        isolate.run_in_lock_scope(|_inner| {});
    });
}

#[test]
fn test_nested_isolates_restore_the_current_lock() {
    let first = new_isolate();
    let second = new_isolate();
    assert_ne!(first.id(), second.id());

    first.run_in_lock_scope(|outer| {
        let ctx = outer.new_context(Ref::new(TestGlobal::default())).unwrap();
        assert_eq!(JsLock::current(), Some(first.id()));

        second.run_in_lock_scope(|inner| {
            assert_eq!(JsLock::current(), Some(second.id()));
            assert!(JsLock::is_held(first.id()));

            let inner_ctx = inner.new_context(Ref::new(TestGlobal::default())).unwrap();
            assert_eq!(inner.evaluate_as::<i32>(&inner_ctx, "6 * 7").unwrap(), 42);
        });

        assert_eq!(JsLock::current(), Some(first.id()));
        assert_eq!(outer.evaluate_as::<String>(&ctx, "'still here'").unwrap(), "still here");
    });

    assert_eq!(JsLock::current(), None);
}

#[test]
#[should_panic(expected = "used under the lock")]
fn test_context_from_another_isolate_is_rejected() {
    let first = new_isolate();
    let second = new_isolate();

    let ctx = first.run_in_lock_scope(|lock| lock.new_context(Ref::new(TestGlobal::default())).unwrap());

    second.run_in_lock_scope(|lock| {
        let _ = lock.evaluate(&ctx, "1");
    });
}

#[test]
fn test_script_errors_are_reported() {
    let isolate = new_isolate();
    let reports = Arc::new(std::sync::Mutex::new(Vec::new()));

    isolate.run_in_lock_scope(|lock| {
        let ctx = lock.new_context(Ref::new(TestGlobal::default())).unwrap();
        assert!(!lock.are_errors_reported());

        let sink = reports.clone();
        lock.set_error_reporter(Some(std::rc::Rc::new(
            move |_scope: &mut openworkers_jsg::v8::PinScope<'_, '_>,
                  description: &str,
                  _error: openworkers_jsg::v8::Local<'_, openworkers_jsg::v8::Value>,
                  formatted: &str| {
                sink.lock()
                    .unwrap()
                    .push(format!("{description}: {formatted}"));
            },
        )));
        assert!(lock.are_errors_reported());

        let err = lock
            .evaluate(&ctx, "throw new RangeError('too far')")
            .unwrap_err();
        let js = err.as_js().unwrap();
        assert_eq!(js.name, "RangeError");
        assert_eq!(js.message, "too far");

        let err = lock.evaluate(&ctx, "throw 'plain string'").unwrap_err();
        assert_eq!(err.as_js().unwrap().message, "plain string");

        let err = lock.evaluate(&ctx, "function (").unwrap_err();
        assert_eq!(err.as_js().unwrap().name, "SyntaxError");
    });

    let reports = reports.lock().unwrap();
    assert_eq!(reports.len(), 3);
    assert_eq!(reports[0], "Uncaught exception: RangeError: too far");
}
