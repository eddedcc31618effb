//! labhubd - The lab server lifecycle service
//!
//! This is the main entry point for the labhubd service.
//! It wires together all the components:
//! - Configuration loading
//! - Store initialization
//! - Container provider
//! - Lifecycle service
//! - Supervised auto-destroy monitor
//! - IPC server

mod handler;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use handler::Handler;
use labhub_config::{AutoDestroyConfig, load_config_or_default};
use labhub_core::{
    AutoDestroyMonitor, LifecycleService, MonitorStatus, MonitorSupervisor, ServerRepository,
    StoreRepository, SupervisorExit,
};
use labhub_ipc::{IpcServer, ServerMessage};
use labhub_provider::{ContainerProvider, SimulatedProvider};
use labhub_store::{AuditEvent, AuditEventType, ServerStore, SqliteStore};
use labhub_util::default_config_path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// How long shutdown waits for an in-flight scan to reach a safe point
const MONITOR_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// labhubd - Lab server lifecycle service
#[derive(Parser, Debug)]
#[command(name = "labhubd")]
#[command(about = "Lab server lifecycle and idle reclamation service", long_about = None)]
struct Args {
    /// Configuration file path (default: ~/.config/labhubd/config.toml)
    #[arg(short, long, default_value_os_t = default_config_path())]
    config: PathBuf,

    /// Socket path override (or set LABHUB_SOCKET env var)
    #[arg(short, long, env = "LABHUB_SOCKET")]
    socket: Option<PathBuf>,

    /// Data directory override (or set LABHUB_DATA_DIR env var)
    #[arg(short, long, env = "LABHUB_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

/// Main service state
struct Service {
    repo: Arc<dyn ServerRepository>,
    lifecycle: Arc<LifecycleService>,
    store: Arc<dyn ServerStore>,
    ipc: Arc<IpcServer>,
    auto_destroy: AutoDestroyConfig,
}

impl Service {
    async fn new(args: &Args) -> Result<Self> {
        let config = load_config_or_default(&args.config)
            .with_context(|| format!("Failed to load config from {:?}", args.config))?;

        info!(
            config_path = %args.config.display(),
            auto_destroy_enabled = config.auto_destroy.enabled,
            polling_interval_secs = config.auto_destroy.polling_interval.as_secs(),
            "Configuration loaded"
        );

        let socket_path = args
            .socket
            .clone()
            .unwrap_or_else(|| config.service.socket_path.clone());

        let data_dir = args
            .data_dir
            .clone()
            .unwrap_or_else(|| config.service.data_dir.clone());

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory {:?}", data_dir))?;

        let db_path = data_dir.join("labhubd.db");
        let store: Arc<dyn ServerStore> = Arc::new(
            SqliteStore::open(&db_path)
                .with_context(|| format!("Failed to open database {:?}", db_path))?,
        );

        info!(db_path = %db_path.display(), "Store initialized");

        store.append_audit(AuditEvent::new(AuditEventType::ServiceStarted))?;

        // No concrete cloud client is wired in; the simulated provider keeps
        // container groups in memory.
        let provider: Arc<dyn ContainerProvider> = Arc::new(SimulatedProvider::new());
        warn!("Using simulated container provider");

        let repo: Arc<dyn ServerRepository> =
            Arc::new(StoreRepository::new(store.clone(), provider));
        let lifecycle = Arc::new(LifecycleService::new(repo.clone(), config.defaults));

        let mut ipc = IpcServer::new(&socket_path);
        ipc.start().await?;

        info!(socket_path = %socket_path.display(), "IPC server started");

        Ok(Self {
            repo,
            lifecycle,
            store,
            ipc: Arc::new(ipc),
            auto_destroy: config.auto_destroy,
        })
    }

    /// Start the supervised monitor, unless auto-destroy is turned off
    fn start_monitor(
        &self,
        cancel: &CancellationToken,
    ) -> Option<(Arc<MonitorStatus>, JoinHandle<SupervisorExit>)> {
        if !self.auto_destroy.enabled {
            info!("Auto-destroy disabled, monitor not started");
            return None;
        }

        let monitor = Arc::new(AutoDestroyMonitor::new(
            self.repo.clone(),
            self.auto_destroy.polling_interval,
        ));
        let supervisor = MonitorSupervisor::new(monitor, self.auto_destroy.max_restarts);
        let status = supervisor.status();
        let handle = tokio::spawn(supervisor.run(cancel.clone()));

        Some((status, handle))
    }

    async fn run(self) -> Result<()> {
        let cancel = CancellationToken::new();

        let (monitor_status, monitor_handle) = match self.start_monitor(&cancel) {
            Some((status, handle)) => (Some(status), Some(handle)),
            None => (None, None),
        };

        let handler = Handler::new(self.lifecycle.clone(), monitor_status);

        let ipc_ref = self.ipc.clone();
        let mut ipc_messages = ipc_ref
            .take_message_receiver()
            .await
            .ok_or_else(|| anyhow!("IPC message receiver already taken"))?;

        let ipc_accept = ipc_ref.clone();
        tokio::spawn(async move {
            if let Err(e) = ipc_accept.run().await {
                error!(error = %e, "IPC server error");
            }
        });

        let mut sigterm = signal(SignalKind::terminate())
            .context("Failed to create SIGTERM handler")?;
        let mut sigint = signal(SignalKind::interrupt())
            .context("Failed to create SIGINT handler")?;
        let mut sighup = signal(SignalKind::hangup())
            .context("Failed to create SIGHUP handler")?;

        info!("Service running");

        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down gracefully");
                    break;
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, shutting down gracefully");
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, shutting down gracefully");
                    break;
                }

                Some(msg) = ipc_messages.recv() => {
                    Self::handle_ipc_message(&handler, &ipc_ref, msg);
                }
            }
        }

        info!("Shutting down labhubd");

        cancel.cancel();
        if let Some(handle) = monitor_handle {
            match tokio::time::timeout(MONITOR_SHUTDOWN_TIMEOUT, handle).await {
                Ok(Ok(exit)) => debug!(exit = ?exit, "Auto-destroy monitor stopped"),
                Ok(Err(e)) => warn!(error = %e, "Auto-destroy monitor task failed"),
                Err(_) => warn!("Auto-destroy monitor did not stop in time"),
            }
        }

        if let Err(e) = self
            .store
            .append_audit(AuditEvent::new(AuditEventType::ServiceStopped))
        {
            warn!(error = %e, "Failed to log service shutdown");
        }

        info!("Shutdown complete");
        Ok(())
    }

    /// Each request runs on its own task so a slow provider call never
    /// blocks other callers.
    fn handle_ipc_message(handler: &Handler, ipc: &Arc<IpcServer>, msg: ServerMessage) {
        match msg {
            ServerMessage::Request { client_id, request } => {
                let handler = handler.clone();
                let ipc = ipc.clone();
                tokio::spawn(async move {
                    let response = handler.handle(request).await;
                    if let Err(e) = ipc.send_response(&client_id, response).await {
                        debug!(client_id = %client_id, error = %e, "Failed to send response");
                    }
                });
            }

            ServerMessage::ClientConnected { client_id } => {
                debug!(client_id = %client_id, "Client session opened");
            }

            ServerMessage::ClientDisconnected { client_id } => {
                debug!(client_id = %client_id, "Client disconnected");
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "labhubd starting");

    let service = Service::new(&args).await?;
    service.run().await
}
