//! GC integration: deferred destruction, external memory and heap tracing.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Lock (RAII, one per critical section)                      │
//! │  ├── v8::Locker (thread safety)                             │
//! │  ├── JsLock: thread-local "isolate held" marker             │
//! │  └── apply_deferred_actions():                              │
//! │      ├── drain DeferredDestructionQueue                     │
//! │      └── report pending external memory to V8               │
//! └─────────────────────────────────────────────────────────────┘
//!                              ▲
//!                              │ drained on lock
//! ┌─────────────────────────────────────────────────────────────┐
//! │  DeferredDestructionQueue (any thread)                      │
//! │  ├── BatchQueue: current + spare buffer, swap on drain      │
//! │  ├── DeferredItem::Global  (v8::Global to reset)            │
//! │  └── DeferredItem::Release (wrapped native object)          │
//! └─────────────────────────────────────────────────────────────┘
//!                              ▲
//!                              │ applied on lock
//! ┌─────────────────────────────────────────────────────────────┐
//! │  ExternalMemoryTarget (Arc, weak link to the isolate)       │
//! │  └── ExternalMemoryAdjustment (RAII, move-only)             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  GcTraceable / MemoryTracker                                │
//! │  └── sizes for adjustments and heap snapshots               │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use openworkers_jsg::gc::{ExternalMemoryAdjustment, GcTraceable};
//!
//! #[derive(GcTraceable)]
//! struct MyBuffer {
//!     #[gc(track)]
//!     data: Vec<u8>,
//!     _memory: ExternalMemoryAdjustment,
//! }
//!
//! let target = isolate.external_memory_target();
//! let data = vec![0u8; 4096];
//! let memory = target.adjustment(data.len());
//! let buffer = MyBuffer { data, _memory: memory };
//! ```

mod batch_queue;
mod deferred_destruction;
mod external_memory;
mod js_lock;
mod traceable;

pub use batch_queue::{
    BatchQueue, DESTRUCTION_QUEUE_INITIAL_SIZE, DESTRUCTION_QUEUE_MAX_CAPACITY,
};
pub use deferred_destruction::{
    DeferredDestructionQueue, DeferredHandle, DeferredItem, RefToRelease, Releasable,
};
pub use external_memory::{ExternalMemoryAdjustment, ExternalMemoryTarget};
pub use js_lock::JsLock;
pub use traceable::{
    GcTraceable, HeapEdge, HeapNode, HeapSnapshot, MemoryRetainer, MemoryTracker, Tracked,
    tracked_adjustment,
};

#[cfg(test)]
mod tests;
