mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::{TestApi, TestConfig, TestGlobal, system};
use openworkers_jsg::{Error, Isolate, IsolateConfig, Ref, V8System};

#[test]
fn test_custom_hooks_are_used() {
    let pumps = Arc::new(AtomicUsize::new(0));
    let shutdowns = Arc::new(AtomicUsize::new(0));

    let hooked = {
        let pumps = pumps.clone();
        let shutdowns = shutdowns.clone();
        system()
            .with_pump_message_loop(move |_isolate| {
                pumps.fetch_add(1, Ordering::SeqCst);
                false
            })
            .with_shutdown_isolate(move |_isolate| {
                shutdowns.fetch_add(1, Ordering::SeqCst);
            })
    };

    {
        let isolate: Isolate<TestApi> =
            Isolate::new(&hooked, IsolateConfig::default(), TestConfig::default()).unwrap();

        isolate.run_in_lock_scope(|lock| {
            assert!(!lock.pump_message_loop());
            assert!(!lock.pump_message_loop());
        });
        assert_eq!(shutdowns.load(Ordering::SeqCst), 0);
    }

    assert_eq!(pumps.load(Ordering::SeqCst), 2);
    assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
}

#[test]
fn test_later_systems_validate_their_flags() {
    let _ = system();

    let err = V8System::with_flags(["--no-such-engine-flag"]).unwrap_err();
    assert!(matches!(err, Error::UnrecognizedFlags(ref flags) if flags == &["--no-such-engine-flag"]));

    let tuned = V8System::with_flags(["--expose-gc"]).unwrap();
    assert_eq!(tuned.flags(), ["--expose-gc".to_string()]);
    assert!(format!("{tuned:?}").contains("V8System"));
}

#[test]
fn test_isolate_from_json_config() {
    let config = IsolateConfig::from_json(
        r#"{ "heapMaxMb": 64, "flags": { "evalAllowed": false, "nodeJsCompat": true } }"#,
    )
    .unwrap();

    let isolate: Isolate<TestApi> = Isolate::new(&system(), config, TestConfig::default()).unwrap();

    isolate.run_in_lock_scope(|lock| {
        assert!(lock.node_js_compat());
        assert!(!lock.eval_allowed());

        let ctx = lock.new_context(Ref::new(TestGlobal::default())).unwrap();
        assert!(lock.evaluate(&ctx, "eval('1')").is_err());
    });
}

#[test]
fn test_invalid_config_is_rejected() {
    let config = IsolateConfig {
        heap_initial_mb: 512,
        heap_max_mb: 16,
        ..Default::default()
    };

    let err = Isolate::<TestApi>::new(&system(), config, TestConfig::default()).unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
}

#[test]
fn test_isolates_get_distinct_ids() {
    let ids: Vec<u64> = (0..4).map(|_| common::new_isolate().id()).collect();

    for (i, a) in ids.iter().enumerate() {
        for b in &ids[i + 1..] {
            assert_ne!(a, b);
        }
    }
}
