//! Deferred shutdown on termination signals.
//!
//! The first SIGINT/SIGTERM only records a shutdown request; the pending
//! manager notices it between rounds, saves its queue and exits cleanly.
//! Handling the first delivery also resets that signal to its default
//! disposition, so delivering it a second time kills the process at once.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

struct Shared {
    triggered: Mutex<BTreeSet<i32>>,
    requested: watch::Sender<bool>,
}

impl Shared {
    fn record(&self, signum: i32) {
        self.triggered
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(signum);
        self.requested.send_replace(true);
    }
}

/// Process-wide shutdown coordinator.
///
/// Construct once at startup and share it with the main loop.
pub struct ShutdownCoordinator {
    shared: Arc<Shared>,
    listeners: Vec<JoinHandle<()>>,
}

impl ShutdownCoordinator {
    /// A coordinator with no OS signal listeners; shutdown only happens
    /// through [`request_shutdown`](Self::request_shutdown).
    pub fn new() -> Self {
        let (requested, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                triggered: Mutex::new(BTreeSet::new()),
                requested,
            }),
            listeners: Vec::new(),
        }
    }

    /// Intercept SIGINT and SIGTERM.
    pub fn install_default() -> std::io::Result<Self> {
        Self::install(&[SignalKind::interrupt(), SignalKind::terminate()])
    }

    /// Intercept the given signals. Must be called inside a tokio runtime.
    pub fn install(kinds: &[SignalKind]) -> std::io::Result<Self> {
        let mut coordinator = Self::new();
        for kind in kinds {
            let mut stream = signal(*kind)?;
            let signum = kind.as_raw_value();
            let shared = Arc::clone(&coordinator.shared);
            coordinator.listeners.push(tokio::spawn(async move {
                if stream.recv().await.is_some() {
                    restore_default_disposition(signum);
                    shared.record(signum);
                    warn!(
                        event = "shutdown.requested",
                        signal = signum,
                        "Termination requested; exiting after the current round (send again to force)"
                    );
                }
            }));
        }
        info!(signals = ?kinds.iter().map(|k| k.as_raw_value()).collect::<Vec<_>>(), "Signal handlers installed");
        Ok(coordinator)
    }

    /// Snapshot of the signals received so far.
    pub fn triggered_signals(&self) -> BTreeSet<i32> {
        self.shared
            .triggered
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Whether shutdown has been requested, by signal or programmatically.
    pub fn is_triggered(&self) -> bool {
        *self.shared.requested.borrow()
    }

    /// Request shutdown as if `signum` had been delivered.
    pub fn request_shutdown(&self, signum: i32) {
        self.shared.record(signum);
    }

    /// Resolve once shutdown has been requested.
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.shared.requested.subscribe();
        let _ = rx.wait_for(|requested| *requested).await;
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ShutdownCoordinator {
    fn drop(&mut self) {
        for listener in &self.listeners {
            listener.abort();
        }
    }
}

fn restore_default_disposition(signum: i32) {
    // SAFETY: installing SIG_DFL registers no user code as a handler.
    let previous = unsafe { libc::signal(signum, libc::SIG_DFL) };
    if previous == libc::SIG_ERR {
        warn!(signal = signum, "Could not restore default signal disposition");
    }
}
