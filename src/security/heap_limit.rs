//! Heap limit protection.
//!
//! When the V8 heap approaches its configured limit, the near-heap-limit
//! callback gives the collector one chance with a 10% larger limit (capped at
//! the configured maximum). The second call terminates execution and flags the
//! isolate, so a runaway script cannot take the process down with it.
//!
//! Allocation failures outside the managed heap cannot be recovered from. The
//! OOM handler forwards them to the process fatal-error callback and aborts.

use std::ffi::{CStr, c_char, c_void};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// State handed to V8 as the callback's data pointer.
///
/// Boxed, and must outlive the isolate it is installed on.
pub struct HeapLimitState {
    isolate_id: u64,
    handle: v8::IsolateHandle,
    limit_reached: Arc<AtomicBool>,
    invocations: AtomicU32,
    max_heap_bytes: usize,
}

impl HeapLimitState {
    pub fn new(
        isolate_id: u64,
        handle: v8::IsolateHandle,
        limit_reached: Arc<AtomicBool>,
        max_heap_bytes: usize,
    ) -> Self {
        Self {
            isolate_id,
            handle,
            limit_reached,
            invocations: AtomicU32::new(0),
            max_heap_bytes,
        }
    }

    pub fn invocations(&self) -> u32 {
        self.invocations.load(Ordering::SeqCst)
    }

    pub fn max_heap_bytes(&self) -> usize {
        self.max_heap_bytes
    }

    /// Decide the next heap limit. Terminates execution once the grace
    /// allowance is used up.
    fn next_limit(&self, current_heap_limit: usize) -> usize {
        let count = self.invocations.fetch_add(1, Ordering::SeqCst);

        tracing::warn!(
            "Isolate {} near heap limit (call {}, current: {} MB, max: {} MB)",
            self.isolate_id,
            count + 1,
            current_heap_limit / (1024 * 1024),
            self.max_heap_bytes / (1024 * 1024)
        );

        if count == 0 {
            let grace = (current_heap_limit + current_heap_limit / 10).min(self.max_heap_bytes);

            if grace > current_heap_limit {
                return grace;
            }
        }

        tracing::error!(
            "Isolate {} exhausted its heap, terminating execution",
            self.isolate_id
        );

        self.limit_reached.store(true, Ordering::SeqCst);
        self.handle.terminate_execution();

        current_heap_limit
    }
}

/// # Safety
///
/// `data` must point to a live `HeapLimitState`, as set up by
/// [`install_heap_limit`].
unsafe extern "C" fn near_heap_limit_callback(
    data: *mut c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: data is the boxed HeapLimitState passed in install_heap_limit
    let state = unsafe { &*(data as *const HeapLimitState) };
    state.next_limit(current_heap_limit)
}

fn c_str_or<'a>(ptr: *const c_char, fallback: &'a str) -> std::borrow::Cow<'a, str> {
    if ptr.is_null() {
        return fallback.into();
    }

    // SAFETY: V8 passes NUL-terminated strings
    unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned().into()
}

unsafe extern "C" fn oom_error_handler(location: *const c_char, details: &v8::OomDetails) {
    let location = c_str_or(location, "unknown");
    let detail = c_str_or(details.detail as *const c_char, "");

    let kind = if details.is_heap_oom {
        "JavaScript heap out of memory"
    } else {
        "process out of memory"
    };

    let message = if detail.is_empty() {
        kind.to_string()
    } else {
        format!("{kind}: {detail}")
    };

    crate::system::fatal_error(&location, &message)
}

/// Install the near-heap-limit callback and the OOM handler.
///
/// Call right after isolate creation. The returned box must be kept alive
/// until the isolate is disposed.
pub fn install_heap_limit(
    isolate: &mut v8::Isolate,
    isolate_id: u64,
    limit_reached: Arc<AtomicBool>,
    max_heap_bytes: usize,
) -> Box<HeapLimitState> {
    let state = Box::new(HeapLimitState::new(
        isolate_id,
        isolate.thread_safe_handle(),
        limit_reached,
        max_heap_bytes,
    ));

    let data = &*state as *const HeapLimitState as *mut c_void;
    isolate.add_near_heap_limit_callback(near_heap_limit_callback, data);
    isolate.set_oom_error_handler(oom_error_handler);

    state
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_max(max_heap_bytes: usize) -> (v8::OwnedIsolate, HeapLimitState, Arc<AtomicBool>) {
        crate::V8System::new().unwrap();

        let isolate = v8::Isolate::new(Default::default());
        let reached = Arc::new(AtomicBool::new(false));
        let state = HeapLimitState::new(
            1,
            isolate.thread_safe_handle(),
            reached.clone(),
            max_heap_bytes,
        );

        (isolate, state, reached)
    }

    #[test]
    fn test_first_call_grants_grace() {
        let (_isolate, state, reached) = state_with_max(64 * 1024 * 1024);

        let next = state.next_limit(10 * 1024 * 1024);
        assert_eq!(next, 11 * 1024 * 1024);
        assert!(!reached.load(Ordering::SeqCst));

        assert_eq!(state.next_limit(next), next);
        assert!(reached.load(Ordering::SeqCst));
        assert_eq!(state.invocations(), 2);
    }

    #[test]
    fn test_no_grace_at_max() {
        let (_isolate, state, reached) = state_with_max(8 * 1024 * 1024);

        assert_eq!(state.next_limit(8 * 1024 * 1024), 8 * 1024 * 1024);
        assert!(reached.load(Ordering::SeqCst));
    }

    #[test]
    fn test_c_str_or() {
        assert_eq!(c_str_or(std::ptr::null(), "unknown"), "unknown");

        let raw = c"heap".as_ptr();
        assert_eq!(c_str_or(raw, "unknown"), "heap");
    }
}
