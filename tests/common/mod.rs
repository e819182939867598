#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use openworkers_jsg::wrapper::{arg, set_method, this};
use openworkers_jsg::{
    ApiTypes, Deserializer, Error, GcTraceable, Isolate, IsolateConfig, IsolateFlags, Resource,
    ResourceType, Result, Serializable, Serializer, TypeRegistry, V8System, v8,
};

/// One engine per test binary.
pub fn system() -> V8System {
    static SYSTEM: OnceLock<V8System> = OnceLock::new();

    SYSTEM
        .get_or_init(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();

            V8System::new().expect("V8 initialization failed")
        })
        .clone()
}

pub fn new_isolate() -> Isolate<TestApi> {
    new_isolate_with(TestConfig::default())
}

pub fn new_isolate_with(config: TestConfig) -> Isolate<TestApi> {
    let isolate_config = IsolateConfig {
        flags: IsolateFlags {
            eval_allowed: true,
            ..Default::default()
        },
        ..Default::default()
    };

    Isolate::new(&system(), isolate_config, config).expect("isolate creation failed")
}

/// Per-wrapper settings for [`TestApi`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestConfig {
    /// Expose `Shape` and `Circle`.
    pub shapes: bool,
}

pub struct TestApi;

impl ApiTypes for TestApi {
    type Configuration = TestConfig;

    fn register(registry: &mut TypeRegistry, configuration: &TestConfig) {
        registry
            .resource::<TestGlobal>()
            .resource::<Probe>()
            .serializable::<Point>();

        if configuration.shapes {
            registry.resource::<Shape>().resource::<Circle>();
        }
    }
}

/// Global object of test contexts.
#[derive(Debug, Default, GcTraceable)]
pub struct TestGlobal {
    pub name: String,
}

impl Resource for TestGlobal {
    const CLASS_NAME: &'static str = "TestGlobal";

    fn configure<'s>(
        scope: &mut v8::PinScope<'s, '_, ()>,
        template: v8::Local<'s, v8::FunctionTemplate>,
    ) {
        set_method(
            scope,
            template,
            "globalName",
            |scope: &mut v8::PinScope, args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue| {
                match this::<TestGlobal>(scope, &args) {
                    Ok(global) => {
                        if let Some(name) = v8::String::new(scope, &global.name) {
                            rv.set(name.into());
                        }
                    }
                    Err(e) => e.throw(scope),
                }
            },
        );
    }
}

#[derive(Debug, Clone, PartialEq, GcTraceable)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Resource for Point {
    const CLASS_NAME: &'static str = "Point";

    fn configure<'s>(
        scope: &mut v8::PinScope<'s, '_, ()>,
        template: v8::Local<'s, v8::FunctionTemplate>,
    ) {
        set_method(
            scope,
            template,
            "getX",
            |scope: &mut v8::PinScope, args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue| {
                match this::<Point>(scope, &args) {
                    Ok(point) => rv.set_double(point.x),
                    Err(e) => e.throw(scope),
                }
            },
        );

        set_method(
            scope,
            template,
            "getY",
            |scope: &mut v8::PinScope, args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue| {
                match this::<Point>(scope, &args) {
                    Ok(point) => rv.set_double(point.y),
                    Err(e) => e.throw(scope),
                }
            },
        );
    }

    fn construct(
        scope: &mut v8::PinScope<'_, '_>,
        args: &v8::FunctionCallbackArguments<'_>,
    ) -> Result<Self> {
        Ok(Point {
            x: arg(scope, args, 0)?,
            y: arg(scope, args, 1)?,
        })
    }
}

impl Serializable for Point {
    const TAG: u32 = 1;

    fn serialize(&self, serializer: &mut Serializer) -> Result<()> {
        serializer.write_f64(self.x);
        serializer.write_f64(self.y);
        Ok(())
    }

    fn deserialize(deserializer: &mut Deserializer) -> Result<Self> {
        Ok(Point {
            x: deserializer.read_f64()?,
            y: deserializer.read_f64()?,
        })
    }
}

#[derive(Debug, GcTraceable)]
pub struct Shape;

impl Resource for Shape {
    const CLASS_NAME: &'static str = "Shape";
}

#[derive(Debug, GcTraceable)]
pub struct Circle {
    pub radius: f64,
}

impl Resource for Circle {
    const CLASS_NAME: &'static str = "Circle";

    fn parent() -> Option<ResourceType> {
        Some(ResourceType::of::<Shape>())
    }

    fn construct(
        scope: &mut v8::PinScope<'_, '_>,
        args: &v8::FunctionCallbackArguments<'_>,
    ) -> Result<Self> {
        let radius: f64 = arg(scope, args, 0)?;

        if radius < 0.0 {
            return Err(Error::range_error("radius must not be negative"));
        }

        Ok(Circle { radius })
    }
}

/// Counts its own drops; `sum()` reads both fields from JavaScript.
#[derive(Debug, GcTraceable)]
pub struct Probe {
    pub a: i32,
    pub b: i32,
    #[gc(track)]
    pub payload: Vec<u8>,
    pub drops: Arc<AtomicUsize>,
}

impl Probe {
    pub fn new(a: i32, b: i32, drops: &Arc<AtomicUsize>) -> Self {
        Probe {
            a,
            b,
            payload: Vec::new(),
            drops: drops.clone(),
        }
    }
}

impl Drop for Probe {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

impl Resource for Probe {
    const CLASS_NAME: &'static str = "Probe";

    fn configure<'s>(
        scope: &mut v8::PinScope<'s, '_, ()>,
        template: v8::Local<'s, v8::FunctionTemplate>,
    ) {
        set_method(
            scope,
            template,
            "sum",
            |scope: &mut v8::PinScope, args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue| {
                match this::<Probe>(scope, &args) {
                    Ok(probe) => rv.set_int32(probe.a + probe.b),
                    Err(e) => e.throw(scope),
                }
            },
        );
    }
}
