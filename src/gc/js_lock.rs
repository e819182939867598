//! JsLock - thread-local record of which isolates this thread has locked.
//!
//! Code that may run with or without the isolate lock (dropping a handle,
//! releasing a wrapped object) asks `JsLock::is_held()` to choose between
//! finalizing immediately and going through the deferred destruction queue.

use std::cell::RefCell;

thread_local! {
    /// Ids of the isolates locked by this thread, innermost last.
    static HELD_ISOLATES: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

/// RAII marker registering an isolate as locked by the current thread.
///
/// Created by `Lock` right after the `v8::Locker` is acquired. Locks of
/// different isolates may nest; the same isolate may not.
pub struct JsLock {
    isolate_id: u64,
}

impl JsLock {
    pub(crate) fn new(isolate_id: u64) -> Self {
        let depth = HELD_ISOLATES.with(|held| {
            let mut held = held.borrow_mut();
            held.push(isolate_id);
            held.len()
        });

        log::trace!("Entered isolate {} (lock depth: {})", isolate_id, depth);

        Self { isolate_id }
    }

    /// Id of the innermost isolate locked by this thread, if any.
    pub fn current() -> Option<u64> {
        HELD_ISOLATES.with(|held| held.borrow().last().copied())
    }

    /// Whether this thread currently holds the lock of `isolate_id`.
    pub fn is_held(isolate_id: u64) -> bool {
        HELD_ISOLATES.with(|held| held.borrow().contains(&isolate_id))
    }

    pub fn isolate_id(&self) -> u64 {
        self.isolate_id
    }
}

impl Drop for JsLock {
    fn drop(&mut self) {
        HELD_ISOLATES.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(pos) = held.iter().rposition(|id| *id == self.isolate_id) {
                held.remove(pos);
            }
        });

        log::trace!("Left isolate {}", self.isolate_id);
    }
}

impl std::fmt::Debug for JsLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsLock")
            .field("isolate_id", &self.isolate_id)
            .finish()
    }
}
