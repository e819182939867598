//! V8 embedding layer.
//!
//! - [`V8System`]: process-wide engine setup
//! - [`Isolate`]: one engine instance, its destruction queue and memory target
//! - [`Lock`]: exclusive access for running code and converting values
//! - [`wrapper`]: native types exposed to JavaScript
//!
//! ```ignore
//! let system = V8System::new()?;
//! let isolate = Isolate::<MyApi>::new(&system, IsolateConfig::default(), ())?;
//!
//! isolate.run_in_lock_scope(|lock| {
//!     let ctx = lock.new_context(Ref::new(Global::default()))?;
//!     let sum: i32 = lock.evaluate_as(&ctx, "1 + 2")?;
//!     Ok(sum)
//! })
//! ```

pub mod code_map;
pub mod config;
mod context;
pub mod error;
pub mod gc;
pub mod isolate;
pub mod lock;
pub mod security;
pub mod system;
pub mod v8_helpers;
pub mod wrappable;
pub mod wrapper;

pub use v8;

pub use code_map::{CodeBlockInfo, CodeKind, CodeMap};
pub use config::{
    CompilationObserver, ErrorReporter, IsolateConfig, IsolateFlags, Logger, ModuleFallback,
    ModuleFallbackResult, NoopObserver, ResolveMethod,
};
pub use error::{Disposition, Error, JsErrorKind, JsException, Result};
pub use gc::{
    DeferredDestructionQueue, DeferredItem, ExternalMemoryAdjustment, ExternalMemoryTarget,
    GcTraceable, HeapSnapshot, JsLock, MemoryRetainer, Tracked,
};
pub use isolate::{Isolate, IsolateBase};
pub use lock::Lock;
pub use security::TimeoutGuard;
pub use system::V8System;
pub use wrappable::{IsolateGlobal, JsContext, JsValue, Ref};
pub use wrapper::{
    ApiTypes, Deserializer, FromJs, Resource, ResourceType, Serializable, Serializer, ToJs,
    TypeRegistry,
};

pub use openworkers_gc_derive::GcTraceable;
