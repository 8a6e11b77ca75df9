use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::archiver::{ArchiverSettings, StreamArchiver};
use crate::commands::CommandListener;
use crate::config::GatewayConfig;
use crate::reaper::IdleReaper;
use crate::registry::ConnectionRegistry;
use crate::store::{ArchiveSink, CommandQueue, ConfigStore, DeliveryStream};
use crate::watcher::ConfigWatcher;

pub const SHUTDOWN_REASON: &str = "Gateway shutdown or task stopped.";

/// Handles of the long-running gateway tasks.
pub struct GatewayTasks {
    token: CancellationToken,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl GatewayTasks {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            handles: Vec::new(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    fn push(&mut self, name: &'static str, handle: JoinHandle<()>) {
        info!("Started task {}.", name);
        self.handles.push((name, handle));
    }

    /// Cancel every task and wait for it to finish.
    pub async fn stop(self) {
        self.token.cancel();
        for (name, handle) in self.handles {
            if let Err(e) = handle.await {
                error!("Task {} ended abnormally: {:?}", name, e);
            }
        }
    }
}

/// Start the config watcher
pub fn start_config_watcher(
    tasks: &mut GatewayTasks,
    config: &GatewayConfig,
    store: Arc<dyn ConfigStore>,
    registry: Arc<ConnectionRegistry>,
) {
    let watcher = ConfigWatcher::new(store, registry, config.config_watch_interval());
    let token = tasks.token();
    tasks.push("config_watcher", tokio::spawn(watcher.run(token)));
}

/// Start the command listener
pub fn start_command_listener(
    tasks: &mut GatewayTasks,
    config: &GatewayConfig,
    queue: Arc<dyn CommandQueue>,
    store: Arc<dyn ConfigStore>,
    registry: Arc<ConnectionRegistry>,
) {
    let listener = CommandListener::new(queue, store, registry, config.command_queue_timeout());
    let token = tasks.token();
    tasks.push("command_listener", tokio::spawn(listener.run(token)));
}

/// Start the idle connection reaper
pub fn start_idle_reaper(
    tasks: &mut GatewayTasks,
    config: &GatewayConfig,
    registry: Arc<ConnectionRegistry>,
) {
    let reaper = IdleReaper::new(registry, config.idle_sweep_interval());
    let token = tasks.token();
    tasks.push("idle_reaper", tokio::spawn(reaper.run(token)));
}

/// Start the stream archiver
pub fn start_stream_archiver(
    tasks: &mut GatewayTasks,
    config: &GatewayConfig,
    streams: Arc<dyn DeliveryStream>,
    sink: Arc<dyn ArchiveSink>,
    store: Arc<dyn ConfigStore>,
    registry: &ConnectionRegistry,
) {
    let settings = ArchiverSettings {
        group: config.archive_group.clone(),
        consumer: config.archive_consumer.clone(),
        batch_size: config.archive_batch_size,
        block: config.archive_block(),
        interval: config.archive_interval(),
    };
    let archiver = StreamArchiver::new(
        streams,
        sink,
        registry.directory().clone(),
        store,
        settings,
    );
    let token = tasks.token();
    tasks.push("stream_archiver", tokio::spawn(archiver.run(token)));
}

/// Wait for Ctrl-C or SIGTERM.
pub async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => {
                        if let Err(e) = result {
                            error!("Failed to handle termination signal: {:?}", e);
                        }
                    }
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(e) => warn!("Failed to install SIGTERM handler: {:?}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to handle termination signal: {:?}", e);
    }
}

/// Stop all tasks, close every broker connection and mark every known config
/// disconnected.
pub async fn handle_shutdown(tasks: GatewayTasks, registry: Arc<ConnectionRegistry>) {
    info!("Gateway is shutting down...");
    tasks.stop().await;
    registry.close_all().await;
    registry.mark_all_disconnected(SHUTDOWN_REASON).await;
    info!("Gateway shut down.");
}
