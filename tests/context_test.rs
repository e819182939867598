mod common;

use common::{Circle, Point, Shape, TestConfig, TestGlobal, new_isolate, new_isolate_with};
use openworkers_jsg::{Error, Ref};

#[test]
fn test_default_context_uses_wrapper_zero() {
    let isolate = new_isolate();

    isolate.run_in_lock_scope(|lock| {
        let ctx = lock.new_context(Ref::new(TestGlobal::default())).unwrap();

        assert_eq!(lock.wrapper_index(&ctx), 0);
        assert_eq!(lock.wrapper_count(), 1);
        assert_eq!(lock.wrapper_configuration(&ctx).unwrap(), TestConfig::default());
    });
}

#[test]
fn test_extra_wrapper_gates_types_per_context() {
    let isolate = new_isolate();

    isolate.run_in_lock_scope(|lock| {
        let plain = lock.new_context(Ref::new(TestGlobal::default())).unwrap();
        let shapes = lock
            .new_context_with_configuration(
                Ref::new(TestGlobal::default()),
                TestConfig { shapes: true },
            )
            .unwrap();

        assert_eq!(lock.wrapper_index(&shapes), 1);
        assert_eq!(lock.wrapper_count(), 2);
        assert!(lock.wrapper_configuration(&shapes).unwrap().shapes);

        let circle = lock.wrap(&shapes, Ref::new(Circle { radius: 2.0 }));
        assert!(circle.is_ok());

        let err = lock.wrap(&plain, Ref::new(Circle { radius: 2.0 })).unwrap_err();
        assert!(matches!(err, Error::Type(_)));

        // Types shared by both wrappers work in both contexts.
        assert!(lock.wrap(&plain, Ref::new(Point { x: 0.0, y: 0.0 })).is_ok());
        assert!(lock.wrap(&shapes, Ref::new(Point { x: 0.0, y: 0.0 })).is_ok());
    });
}

#[test]
fn test_instance_checks_follow_the_prototype_chain() {
    let isolate = new_isolate_with(TestConfig { shapes: true });

    isolate.run_in_lock_scope(|lock| {
        let ctx = lock.new_context(Ref::new(TestGlobal::default())).unwrap();
        lock.install_constructor::<Circle>(&ctx).unwrap();
        lock.install_constructor::<Shape>(&ctx).unwrap();

        let circle = lock.wrap(&ctx, Ref::new(Circle { radius: 1.0 })).unwrap();
        assert!(lock.is_instance_of::<Circle>(&ctx, &circle).unwrap());
        assert!(lock.is_instance_of::<Shape>(&ctx, &circle).unwrap());
        assert!(!lock.is_instance_of::<Point>(&ctx, &circle).unwrap());

        let subclass = lock
            .evaluate(&ctx, "class Unit extends Circle { constructor() { super(1); } }; new Unit()")
            .unwrap();
        assert!(lock.is_instance_of::<Circle>(&ctx, &subclass).unwrap());
        assert!(lock.is_instance_of::<Shape>(&ctx, &subclass).unwrap());

        let plain = lock.evaluate(&ctx, "({ constructor: 1 })").unwrap();
        assert!(!lock.is_instance_of::<Circle>(&ctx, &plain).unwrap());

        // A copied `constructor` property is not enough.
        let forged = lock.evaluate(&ctx, "Object.create({ constructor: Circle })").unwrap();
        assert!(!lock.is_instance_of::<Circle>(&ctx, &forged).unwrap());
        assert!(lock.unwrap::<Ref<Circle>>(&ctx, &forged).is_err());

        let trapped = lock
            .evaluate(
                &ctx,
                "new Proxy({}, { getPrototypeOf() { throw new TypeError('no prototype'); } })",
            )
            .unwrap();
        let err = lock.is_instance_of::<Circle>(&ctx, &trapped).unwrap_err();
        assert_eq!(err.as_js().unwrap().message, "no prototype");

        let number = lock.wrap(&ctx, 5i32).unwrap();
        assert!(!lock.is_instance_of::<Circle>(&ctx, &number).unwrap());

        let err = lock.evaluate(&ctx, "new Circle(-1)").unwrap_err();
        assert_eq!(err.as_js().unwrap().name, "RangeError");
    });
}

#[test]
fn test_constructor_is_the_installed_class() {
    let isolate = new_isolate();

    isolate.run_in_lock_scope(|lock| {
        let ctx = lock.new_context(Ref::new(TestGlobal::default())).unwrap();
        lock.install_constructor::<Point>(&ctx).unwrap();

        let constructor = lock.get_constructor::<Point>(&ctx).unwrap();
        let same = lock
            .evaluate(&ctx, "(c) => c === Point && c.name === 'Point'")
            .and_then(|f| lock.call(&ctx, &f, &[&constructor]))
            .and_then(|v| lock.unwrap::<bool>(&ctx, &v))
            .unwrap();
        assert!(same);

        let instance = lock.evaluate(&ctx, "new Point(1, 2)").unwrap();
        assert!(lock.is_instance_of::<Point>(&ctx, &instance).unwrap());
    });
}

#[test]
fn test_eval_follows_the_flag() {
    let isolate = new_isolate();

    isolate.run_in_lock_scope(|lock| {
        assert!(lock.eval_allowed());
        let open = lock.new_context(Ref::new(TestGlobal::default())).unwrap();
        assert_eq!(lock.evaluate_as::<i32>(&open, "eval('1 + 1')").unwrap(), 2);

        lock.set_eval_allowed(false);
        let closed = lock.new_context(Ref::new(TestGlobal::default())).unwrap();
        let err = lock.evaluate(&closed, "eval('1 + 1')").unwrap_err();
        assert_eq!(err.as_js().unwrap().name, "EvalError");

        let err = lock.evaluate(&closed, "new Function('return 1')()").unwrap_err();
        assert_eq!(err.as_js().unwrap().name, "EvalError");

        // Existing contexts follow the flag as well.
        assert!(lock.evaluate(&open, "eval('2')").is_err());

        lock.set_eval_allowed(true);
        assert_eq!(lock.evaluate_as::<i32>(&closed, "eval('1')").unwrap(), 1);
        assert_eq!(lock.evaluate_as::<i32>(&open, "eval('2')").unwrap(), 2);
    });
}

const EMPTY_WASM_MODULE: &str = "new WebAssembly.Module(new Uint8Array([0, 97, 115, 109, 1, 0, 0, 0]))";

#[test]
fn test_wasm_compilation_follows_eval_flag() {
    let isolate = new_isolate();

    isolate.run_in_lock_scope(|lock| {
        let ctx = lock.new_context(Ref::new(TestGlobal::default())).unwrap();
        assert!(lock.evaluate(&ctx, EMPTY_WASM_MODULE).is_ok());

        lock.set_eval_allowed(false);
        let err = lock.evaluate(&ctx, EMPTY_WASM_MODULE).unwrap_err();
        assert!(err.as_js().is_some());

        lock.set_eval_allowed(true);
        assert!(lock.evaluate(&ctx, EMPTY_WASM_MODULE).is_ok());
    });
}

#[test]
fn test_jspi_entry_points_hidden_when_disabled() {
    let isolate = new_isolate();

    isolate.run_in_lock_scope(|lock| {
        assert!(!lock.jspi_enabled());
        let ctx = lock.new_context(Ref::new(TestGlobal::default())).unwrap();

        let exposed = lock
            .evaluate_as::<bool>(
                &ctx,
                "typeof WebAssembly.promising !== 'undefined' || typeof WebAssembly.Suspending !== 'undefined'",
            )
            .unwrap();
        assert!(!exposed);
    });
}

#[test]
fn test_to_string_tag_flag() {
    let isolate = new_isolate();

    isolate.run_in_lock_scope(|lock| {
        assert!(!lock.set_to_string_tag());
        let ctx = lock.new_context(Ref::new(TestGlobal::default())).unwrap();
        let value = lock.wrap(&ctx, Ref::new(Point { x: 0.0, y: 0.0 })).unwrap();
        let tag = lock
            .evaluate(&ctx, "(p) => Object.prototype.toString.call(p)")
            .and_then(|f| lock.call(&ctx, &f, &[&value]))
            .and_then(|v| lock.unwrap::<String>(&ctx, &v))
            .unwrap();
        assert_eq!(tag, "[object Object]");
    });

    let tagged = new_isolate();
    tagged.run_in_lock_scope(|lock| {
        lock.set_set_to_string_tag(true);
        let ctx = lock.new_context(Ref::new(TestGlobal::default())).unwrap();
        let value = lock.wrap(&ctx, Ref::new(Point { x: 0.0, y: 0.0 })).unwrap();
        let tag = lock
            .evaluate(&ctx, "(p) => Object.prototype.toString.call(p)")
            .and_then(|f| lock.call(&ctx, &f, &[&value]))
            .and_then(|v| lock.unwrap::<String>(&ctx, &v))
            .unwrap();
        assert_eq!(tag, "[object Point]");
    });
}

#[test]
fn test_flags_are_plain_state() {
    let isolate = new_isolate();

    isolate.run_in_lock_scope(|lock| {
        assert!(lock.allow_top_level_await());
        assert!(!lock.node_js_compat());

        lock.set_node_js_compat(true);
        lock.set_jspi_enabled(true);
        lock.set_allow_top_level_await(false);

        let flags = lock.flags();
        assert!(flags.node_js_compat);
        assert!(flags.jspi_enabled);
        assert!(!flags.allow_top_level_await);
        assert!(!flags.node_js_process_v2);
    });

    // Flags persist across lock scopes.
    isolate.run_in_lock_scope(|lock| assert!(lock.node_js_compat()));
}

#[test]
fn test_global_cannot_back_two_contexts() {
    let isolate = new_isolate();

    isolate.run_in_lock_scope(|lock| {
        let global = Ref::new(TestGlobal::default());
        let _ctx = lock.new_context(global.clone()).unwrap();

        let err = lock.new_context(global).unwrap_err();
        assert!(matches!(err, Error::Type(_)));
    });
}
