//! External memory tracking for V8 GC.
//!
//! Native allocations report their size through an `ExternalMemoryTarget`
//! shared with the isolate. Deltas accumulate in the target and are handed to
//! V8 by `apply_deferred_actions` on the next lock. Once the isolate is torn
//! down the target is detached and further deltas are dropped.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

/// Weak accounting link to one isolate.
///
/// Shared (via `Arc`) by every outstanding `ExternalMemoryAdjustment`. It never
/// touches the isolate itself: it only records deltas, and its back-link is
/// nulled under the same mutex when the isolate goes away.
pub struct ExternalMemoryTarget {
    /// Owning isolate id, `None` once the isolate is gone.
    isolate: Mutex<Option<u64>>,
    /// Delta not yet reported to V8.
    pending: AtomicI64,
}

impl ExternalMemoryTarget {
    pub(crate) fn new(isolate_id: u64) -> Arc<Self> {
        Arc::new(Self {
            isolate: Mutex::new(Some(isolate_id)),
            pending: AtomicI64::new(0),
        })
    }

    /// Create an adjustment tracking `amount` bytes.
    pub fn adjustment(self: &Arc<Self>, amount: usize) -> ExternalMemoryAdjustment {
        let mut adjustment = ExternalMemoryAdjustment {
            target: Some(Arc::clone(self)),
            amount: 0,
        };
        adjustment.resize(amount);
        adjustment
    }

    /// Whether the isolate is still alive.
    pub fn is_attached(&self) -> bool {
        self.isolate
            .lock()
            .expect("external memory target poisoned")
            .is_some()
    }

    /// Id of the owning isolate, if still alive.
    pub fn isolate_id(&self) -> Option<u64> {
        *self
            .isolate
            .lock()
            .expect("external memory target poisoned")
    }

    /// Delta waiting for the next lock.
    pub fn pending(&self) -> i64 {
        self.pending.load(Ordering::SeqCst)
    }

    /// Record a delta, or drop it if the isolate is gone.
    pub(crate) fn record(&self, delta: i64) {
        if delta == 0 {
            return;
        }

        let isolate = self
            .isolate
            .lock()
            .expect("external memory target poisoned");

        if isolate.is_some() {
            let _ = self
                .pending
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |pending| {
                    Some(pending.saturating_add(delta))
                });
            log::trace!("Deferred external memory adjustment: {} bytes", delta);
        }
    }

    /// Take the accumulated delta. Called under the isolate lock.
    pub(crate) fn take_pending(&self) -> i64 {
        self.pending.swap(0, Ordering::SeqCst)
    }

    /// Null the back-link. Later deltas become no-ops.
    pub(crate) fn detach(&self) {
        let mut isolate = self
            .isolate
            .lock()
            .expect("external memory target poisoned");
        *isolate = None;
        self.pending.store(0, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for ExternalMemoryTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalMemoryTarget")
            .field("isolate", &self.isolate_id())
            .field("pending", &self.pending())
            .finish()
    }
}

/// RAII record of external memory held by a native object.
///
/// Reports `+amount` when created and `-amount` when dropped. Move-only:
/// moving it moves the outstanding amount with it.
///
/// # Example
///
/// ```ignore
/// struct LargeBuffer {
///     data: Vec<u8>,
///     _memory: ExternalMemoryAdjustment,
/// }
///
/// impl LargeBuffer {
///     fn new(target: &Arc<ExternalMemoryTarget>, size: usize) -> Self {
///         Self {
///             data: vec![0u8; size],
///             _memory: target.adjustment(size),
///         }
///     }
/// }
/// ```
pub struct ExternalMemoryAdjustment {
    target: Option<Arc<ExternalMemoryTarget>>,
    amount: usize,
}

impl ExternalMemoryAdjustment {
    /// An adjustment bound to no isolate. Every operation is a no-op on V8.
    pub fn empty() -> Self {
        Self {
            target: None,
            amount: 0,
        }
    }

    /// Adjust the tracked amount by `delta` bytes.
    ///
    /// The amount saturates at zero.
    pub fn adjust(&mut self, delta: i64) {
        let new_amount = if delta.is_negative() {
            self.amount.saturating_sub(delta.unsigned_abs() as usize)
        } else {
            self.amount.saturating_add(delta as usize)
        };
        self.resize(new_amount);
    }

    /// Set the tracked amount, reporting the difference.
    pub fn resize(&mut self, new_amount: usize) {
        let delta = if new_amount >= self.amount {
            saturating_bytes(new_amount - self.amount)
        } else {
            -saturating_bytes(self.amount - new_amount)
        };
        self.amount = new_amount;

        if let Some(target) = &self.target {
            target.record(delta);
        }
    }

    pub fn amount(&self) -> usize {
        self.amount
    }

    pub fn target(&self) -> Option<&Arc<ExternalMemoryTarget>> {
        self.target.as_ref()
    }
}

fn saturating_bytes(bytes: usize) -> i64 {
    i64::try_from(bytes).unwrap_or(i64::MAX)
}

impl Drop for ExternalMemoryAdjustment {
    fn drop(&mut self) {
        if self.amount == 0 {
            return;
        }

        if let Some(target) = &self.target {
            target.record(-saturating_bytes(self.amount));
        }
    }
}

impl Default for ExternalMemoryAdjustment {
    fn default() -> Self {
        Self::empty()
    }
}

impl std::fmt::Debug for ExternalMemoryAdjustment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalMemoryAdjustment")
            .field("amount", &self.amount)
            .field("attached", &self.target.as_ref().map(|t| t.is_attached()))
            .finish()
    }
}
