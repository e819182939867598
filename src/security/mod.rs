//! Resource protection for isolates.
//!
//! - [`heap_limit`]: near-heap-limit callback and OOM handler
//! - [`timeout_guard`]: wall-clock watchdog thread
//!
//! Both terminate through the thread-safe isolate handle and never take the
//! isolate lock.

pub(crate) mod heap_limit;
mod timeout_guard;

pub use heap_limit::HeapLimitState;
pub use timeout_guard::TimeoutGuard;
