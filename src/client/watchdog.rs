//! Hard wall-clock supervision for in-flight exchanges.
//!
//! Byte-gap timers restart whenever data arrives, so they cannot bound total
//! request duration. The watchdog arms an independent timer when the request
//! starts and, if it fires first, trips the connection's [`CancelHandle`],
//! force-closing the transport rather than cancelling politely at the
//! protocol layer.
//!
//! Cancellation is best-effort, closer to a cooperative flag than a
//! preemptive kill: forcing the socket closed reliably frees client-side
//! resources and fails the caller at the deadline, but it cannot un-send an
//! already-sent request or stop server-side work.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::warn;

use crate::transport::CancelHandle;

/// A running watchdog timer. Dropping the guard disarms it, so holding it
/// for the scope of the exchange guarantees disarm on every exit path.
#[derive(Debug)]
pub struct ArmedWatchdog {
    task: JoinHandle<()>,
}

/// Start supervising an exchange. If `hard_timeout` elapses before the guard
/// is dropped, the cancel handle is tripped.
pub fn arm(cancel: CancelHandle, hard_timeout: Duration) -> ArmedWatchdog {
    let task = tokio::spawn(async move {
        tokio::time::sleep(hard_timeout).await;
        warn!(after = ?hard_timeout, "hard timeout reached, force-closing exchange");
        cancel.cancel();
    });
    ArmedWatchdog { task }
}

impl ArmedWatchdog {
    /// Explicit disarm; equivalent to dropping the guard.
    pub fn disarm(self) {}
}

impl Drop for ArmedWatchdog {
    fn drop(&mut self) {
        self.task.abort();
    }
}
