//! Wall-clock watchdog.
//!
//! A `TimeoutGuard` spawns a thread that terminates the isolate once the
//! timeout elapses. Dropping the guard cancels the watchdog and joins it.
//! Termination goes through the thread-safe `v8::IsolateHandle`, so the guard
//! never needs the isolate lock.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

/// RAII watchdog that terminates execution after a timeout.
///
/// ```rust,ignore
/// let guard = isolate.terminate_after(Duration::from_millis(50));
/// let result = isolate.run_in_lock_scope(|lock| lock.evaluate(&ctx, "for(;;){}"));
/// assert!(guard.was_triggered());
/// ```
pub struct TimeoutGuard {
    cancel_tx: Option<mpsc::Sender<()>>,
    watchdog: Option<thread::JoinHandle<()>>,
    triggered: Arc<AtomicBool>,
}

impl TimeoutGuard {
    /// A zero timeout yields a disabled guard with no thread.
    pub fn new(isolate_id: u64, handle: v8::IsolateHandle, timeout: Duration) -> Self {
        let triggered = Arc::new(AtomicBool::new(false));

        if timeout.is_zero() {
            return Self::disabled(triggered);
        }

        let (cancel_tx, cancel_rx) = mpsc::channel::<()>();
        let flag = triggered.clone();

        let spawned = thread::Builder::new()
            .name(format!("jsg-watchdog-{isolate_id}"))
            .spawn(move || {
                if let Err(mpsc::RecvTimeoutError::Timeout) = cancel_rx.recv_timeout(timeout) {
                    tracing::warn!(
                        "Isolate {} exceeded wall-clock timeout of {:?}, terminating",
                        isolate_id,
                        timeout
                    );
                    flag.store(true, Ordering::SeqCst);
                    handle.terminate_execution();
                }
            });

        match spawned {
            Ok(watchdog) => Self {
                cancel_tx: Some(cancel_tx),
                watchdog: Some(watchdog),
                triggered,
            },
            Err(e) => {
                tracing::error!("Failed to spawn watchdog for isolate {}: {}", isolate_id, e);
                Self::disabled(triggered)
            }
        }
    }

    fn disabled(triggered: Arc<AtomicBool>) -> Self {
        Self {
            cancel_tx: None,
            watchdog: None,
            triggered,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.watchdog.is_some()
    }

    pub fn was_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }
}

impl Drop for TimeoutGuard {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }

        if let Some(watchdog) = self.watchdog.take()
            && watchdog.join().is_err()
        {
            tracing::error!("Watchdog thread panicked");
        }
    }
}

impl std::fmt::Debug for TimeoutGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutGuard")
            .field("armed", &self.is_armed())
            .field("triggered", &self.was_triggered())
            .finish()
    }
}
