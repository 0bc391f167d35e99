//! Serial bookkeeping and the idle heartbeat.

use crate::error::{SyncError, SyncResult};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::trace;

/// Default quiet period before a `serial-update` heartbeat is sent.
pub const DEFAULT_IDLE_THRESHOLD: Duration = Duration::from_millis(3000);

/// Tracks the two serial counters of one client.
///
/// `our_serial` numbers outgoing transactions. `server_serial` is the last
/// server serial applied locally; the server's serials must arrive with no
/// gaps and no repeats.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SerialReconciler {
    our_serial: u64,
    server_serial: u64,
}

impl SerialReconciler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn our_serial(&self) -> u64 {
        self.our_serial
    }

    #[must_use]
    pub fn server_serial(&self) -> u64 {
        self.server_serial
    }

    /// Increments and returns the serial for the next outgoing transaction.
    pub fn next_our_serial(&mut self) -> u64 {
        self.our_serial += 1;
        self.our_serial
    }

    /// Checks that `serial` directly follows the last applied one.
    pub fn expect_next(&self, serial: u64) -> SyncResult<()> {
        let expected = self.server_serial + 1;
        if serial == expected {
            Ok(())
        } else {
            Err(SyncError::SerialGap {
                expected,
                actual: serial,
            })
        }
    }

    /// Records `serial` as applied.
    pub fn advance(&mut self, serial: u64) {
        self.server_serial = serial;
    }

    /// Validates and records `serial` in one step.
    pub fn accept(&mut self, serial: u64) -> SyncResult<()> {
        self.expect_next(serial)?;
        self.advance(serial);
        Ok(())
    }

    /// Whether `serial` has already been applied.
    #[must_use]
    pub fn covers(&self, serial: u64) -> bool {
        serial <= self.server_serial
    }

    /// Jumps to a checkpoint's serial. Never moves backwards.
    pub fn restore(&mut self, serial: u64) {
        self.server_serial = self.server_serial.max(serial);
    }
}

/// Fires a callback once after a period without activity.
///
/// The timer starts disarmed. Each [`touch`](Self::touch) re-arms it; once
/// it has fired it stays silent until touched again.
pub struct IdleTimer {
    touches: watch::Sender<u64>,
    task: JoinHandle<()>,
}

impl IdleTimer {
    /// Spawns the timer task on the current runtime.
    pub fn spawn<F>(threshold: Duration, on_idle: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let (touches, mut rx) = watch::channel(0u64);
        let task = tokio::spawn(async move {
            loop {
                if rx.changed().await.is_err() {
                    return;
                }
                loop {
                    match tokio::time::timeout(threshold, rx.changed()).await {
                        Ok(Ok(())) => continue,
                        Ok(Err(_)) => return,
                        Err(_) => {
                            trace!(?threshold, "idle threshold reached");
                            on_idle();
                            break;
                        }
                    }
                }
            }
        });
        Self { touches, task }
    }

    /// Records activity, re-arming the timer.
    pub fn touch(&self) {
        self.touches.send_modify(|n| *n = n.wrapping_add(1));
    }

    /// Stops the timer for good.
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for IdleTimer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl std::fmt::Debug for IdleTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdleTimer")
            .field("finished", &self.task.is_finished())
            .finish()
    }
}
