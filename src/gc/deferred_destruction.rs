//! Deferred destruction queue for V8 handles and wrapped native objects.
//!
//! ## Problem
//!
//! V8 Global handles must be reset while holding the isolate lock, and a
//! wrapped native object may own such handles. Either can be dropped from a
//! thread that doesn't hold the lock, or from inside a GC weak callback.
//!
//! ## Solution
//!
//! Queue them, then finalize the queue whenever the lock is acquired (in
//! `Lock::new()` via `apply_deferred_actions`). Appends take a short mutex;
//! the drain swaps buffers and finalizes outside of it.
//!
//! ## Usage
//!
//! ```ignore
//! // From any thread
//! isolate.defer_destruction(DeferredItem::global(my_global_handle));
//!
//! // Next lock acquisition finalizes it
//! isolate.run_in_lock_scope(|lock| { /* queue already drained */ });
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::batch_queue::BatchQueue;

/// Type-erased V8 handle wrapper for deferred destruction.
///
/// This wraps any `v8::Global<T>` in a type-erased container that can be
/// stored in a heterogeneous queue and safely destroyed later.
pub struct DeferredHandle {
    /// Raw pointer to the boxed Global handle
    ptr: *mut (),

    /// Function pointer to drop the boxed handle
    drop_fn: fn(*mut ()),
}

// SAFETY: the pointee is a heap-allocated v8::Global<T>, which only stores a
// handle slot pointer and an IsolateHandle. It is dropped exactly once, either
// under the isolate lock or after the isolate is disposed (where resetting a
// Global is a no-op).
unsafe impl Send for DeferredHandle {}

impl DeferredHandle {
    pub fn new<T: 'static>(handle: v8::Global<T>) -> Self {
        let boxed = Box::new(handle);
        let ptr = Box::into_raw(boxed) as *mut ();

        Self {
            ptr,
            drop_fn: |ptr| {
                // SAFETY: ptr was created from Box::into_raw of a v8::Global<T>
                let _ = unsafe { Box::from_raw(ptr as *mut v8::Global<T>) };
            },
        }
    }
}

impl Drop for DeferredHandle {
    fn drop(&mut self) {
        (self.drop_fn)(self.ptr);
    }
}

/// A native owner whose release must happen under the isolate lock.
pub trait Releasable: Send + Sync {
    /// Drop the strong handle to the JS proxy if no native strong reference
    /// remains. Called under the lock.
    fn remove_strong_ref(&self);
}

/// A pending release of one native owner.
///
/// Dropping it performs the release: the strong proxy handle is dropped first
/// when `strong` is set, then the owner reference itself.
pub struct RefToRelease {
    strong: bool,
    target: Arc<dyn Releasable>,
}

impl RefToRelease {
    pub fn new(strong: bool, target: Arc<dyn Releasable>) -> Self {
        Self { strong, target }
    }

    pub fn is_strong(&self) -> bool {
        self.strong
    }
}

impl Drop for RefToRelease {
    fn drop(&mut self) {
        if self.strong {
            self.target.remove_strong_ref();
        }
    }
}

/// One unit of deferred work.
pub enum DeferredItem {
    /// A Global handle to reset.
    Global(DeferredHandle),
    /// A native owner to release.
    Release(RefToRelease),
}

impl DeferredItem {
    pub fn global<T: 'static>(handle: v8::Global<T>) -> Self {
        Self::Global(DeferredHandle::new(handle))
    }

    pub fn release(strong: bool, target: Arc<dyn Releasable>) -> Self {
        Self::Release(RefToRelease::new(strong, target))
    }
}

struct QueueState {
    batches: BatchQueue<DeferredItem>,
    disposed: bool,
}

/// Per-isolate queue of deferred destructions.
///
/// `defer()` can be called from any thread at any time. Pending items are
/// finalized by `drain()`, which the isolate runs on every lock acquisition.
pub struct DeferredDestructionQueue {
    queue: Mutex<QueueState>,

    /// Fast check for pending items (avoids lock acquisition on hot path)
    pending_count: AtomicU64,

    /// Total items finalized by drains
    finalized_count: AtomicU64,
}

impl Default for DeferredDestructionQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DeferredDestructionQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(QueueState {
                batches: BatchQueue::default(),
                disposed: false,
            }),
            pending_count: AtomicU64::new(0),
            finalized_count: AtomicU64::new(0),
        }
    }

    /// Queue an item for finalization under the next lock.
    ///
    /// Once the isolate has been disposed the item is dropped right away,
    /// which is safe since handle resets are no-ops at that point.
    pub fn defer(&self, item: DeferredItem) {
        let rejected = {
            let mut state = self
                .queue
                .lock()
                .expect("deferred destruction queue poisoned");

            if state.disposed {
                Some(item)
            } else {
                state.batches.push(item);
                self.pending_count.fetch_add(1, Ordering::Release);
                None
            }
        };

        match rejected {
            Some(item) => drop(item),
            None => tracing::trace!("Deferred destruction (pending: {})", self.len()),
        }
    }

    /// Queue a Global handle for reset under the next lock.
    pub fn defer_global<T: 'static>(&self, handle: v8::Global<T>) {
        self.defer(DeferredItem::global(handle));
    }

    /// Lock-free check for pending items.
    #[inline]
    pub fn has_pending(&self) -> bool {
        self.pending_count.load(Ordering::Acquire) > 0
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.pending_count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        !self.has_pending()
    }

    /// Total number of items finalized by `drain()` so far.
    pub fn finalized(&self) -> u64 {
        self.finalized_count.load(Ordering::Acquire)
    }

    pub fn is_disposed(&self) -> bool {
        self.queue
            .lock()
            .expect("deferred destruction queue poisoned")
            .disposed
    }

    /// Finalize everything queued so far. Returns the number of items.
    ///
    /// Must be called while holding the isolate lock. The queue mutex is only
    /// held for the buffer swap; items are dropped without it, so finalizers
    /// may defer more work.
    pub(crate) fn drain(&self) -> usize {
        if !self.has_pending() {
            return 0;
        }

        let mut batch = {
            let mut state = self
                .queue
                .lock()
                .expect("deferred destruction queue poisoned");
            let batch = state.batches.take_batch();
            self.pending_count
                .fetch_sub(batch.len() as u64, Ordering::Release);
            batch
        };

        let count = batch.len();

        // Insertion order
        for item in batch.drain(..) {
            drop(item);
        }

        self.queue
            .lock()
            .expect("deferred destruction queue poisoned")
            .batches
            .give_back(batch);

        self.finalized_count
            .fetch_add(count as u64, Ordering::Release);

        tracing::trace!("Processed {} deferred destructions", count);

        count
    }

    /// Mark the queue as disposed and drop whatever is left.
    ///
    /// Called after the isolate itself is gone.
    pub(crate) fn dispose(&self) -> usize {
        let leftovers = {
            let mut state = self
                .queue
                .lock()
                .expect("deferred destruction queue poisoned");
            state.disposed = true;
            let items = state.batches.take_all();
            self.pending_count
                .fetch_sub(items.len() as u64, Ordering::Release);
            items
        };

        let count = leftovers.len();
        drop(leftovers);

        if count > 0 {
            tracing::debug!("Dropped {} deferred destructions at isolate disposal", count);
        }

        count
    }
}

impl std::fmt::Debug for DeferredDestructionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredDestructionQueue")
            .field("pending_count", &self.len())
            .field("finalized_count", &self.finalized())
            .finish()
    }
}
