//! Bounded restart supervision for the auto-destroy monitor

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::AutoDestroyMonitor;

/// Shared view of the monitor for health reporting
#[derive(Debug, Default)]
pub struct MonitorStatus {
    running: AtomicBool,
    restarts: AtomicU32,
}

impl MonitorStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::SeqCst)
    }
}

/// Why the supervisor returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorExit {
    /// Shutdown was requested
    Cancelled,
    /// The monitor panicked more often than the restart budget allows
    RestartBudgetExhausted,
    /// The monitor task was aborted by the runtime
    Aborted,
}

/// Keeps the monitor alive across panics, up to `max_restarts` restarts
pub struct MonitorSupervisor {
    monitor: Arc<AutoDestroyMonitor>,
    max_restarts: u32,
    status: Arc<MonitorStatus>,
}

impl MonitorSupervisor {
    pub fn new(monitor: Arc<AutoDestroyMonitor>, max_restarts: u32) -> Self {
        Self {
            monitor,
            max_restarts,
            status: Arc::new(MonitorStatus::new()),
        }
    }

    pub fn status(&self) -> Arc<MonitorStatus> {
        self.status.clone()
    }

    pub async fn run(self, cancel: CancellationToken) -> SupervisorExit {
        loop {
            self.status.running.store(true, Ordering::SeqCst);

            let handle = tokio::spawn({
                let monitor = self.monitor.clone();
                let cancel = cancel.clone();
                async move { monitor.run(cancel).await }
            });

            let result = handle.await;
            self.status.running.store(false, Ordering::SeqCst);

            let err = match result {
                Ok(()) => return SupervisorExit::Cancelled,
                Err(err) if err.is_panic() => err,
                Err(err) => {
                    warn!(error = %err, "Auto-destroy monitor task aborted");
                    return SupervisorExit::Aborted;
                }
            };

            let message = panic_message(err.into_panic());
            let panics = self.status.restarts.load(Ordering::SeqCst) + 1;

            if panics > self.max_restarts {
                error!(
                    panic = %message,
                    restarts = self.max_restarts,
                    "Auto-destroy monitor exceeded its restart budget; auto-destroy is disabled"
                );
                self.monitor.record_stopped(self.max_restarts);
                return SupervisorExit::RestartBudgetExhausted;
            }

            error!(
                panic = %message,
                restart = panics,
                max_restarts = self.max_restarts,
                "Auto-destroy monitor panicked"
            );

            if cancel.is_cancelled() {
                return SupervisorExit::Cancelled;
            }

            self.status.restarts.store(panics, Ordering::SeqCst);
            info!(restart = panics, "Restarting auto-destroy monitor");
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
