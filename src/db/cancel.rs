//! Cancellation of in-flight native calls.
//!
//! Dropping a future stops the bridge from waiting, but the statement keeps
//! running on the server (or on the SQLite worker thread) and its connection
//! stays busy. When a call's deadline passes, the executor fires the call's
//! [`CancelSignal`]; the pool then interrupts the statement natively and lets
//! the call wind down so the connection goes back to the pool idle.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// How long a cancelled call may take to wind down before it is dropped.
pub const CANCEL_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct SignalInner {
    cancelled: AtomicBool,
    notify: Notify,
}

/// One-shot cancellation flag shared between a call and its native pool.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal(Arc<SignalInner>);

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal. Firing twice is harmless.
    pub fn cancel(&self) {
        self.0.cancelled.store(true, Ordering::SeqCst);
        self.0.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once the signal has fired.
    pub async fn cancelled(&self) {
        loop {
            let mut notified = std::pin::pin!(self.0.notify.notified());
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}
