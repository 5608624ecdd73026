//! Process lifecycle: builds every long-lived component from a resolved
//! [`crate::config::Config`], spawns them as independently-restartable
//! workers, and drives graceful shutdown on signal receipt.
//!
//! Grounded on `original_source/erddaputil/main/manager.py::Application`
//! (`_reap_and_sow`'s restart-on-exit loop, the signal-triple-press
//! escalation): one `tokio::task::JoinSet` entry per worker, each
//! subscribing its own `broadcast::Receiver<()>`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::{Id, JoinSet};

use crate::config::Config;
use crate::core::broker::{BrokerAdapter, NullBrokerAdapter};
use crate::core::dataset::DatasetManager;
use crate::core::errors::CoreError;
use crate::core::handlers;
use crate::core::metrics::{MetricFacade, MetricSample, MetricSender};
use crate::core::receiver::Receiver;
use crate::core::registry::CommandRegistry;
use crate::core::serializer::Serializer;

/// The daemon's assembled components, shared (via `Arc`) by every worker:
/// built once at startup, never swapped out, with each field independently
/// clonable rather than guarded behind one global lock.
pub struct Core {
    pub config: Config,
    pub hostname: String,
    pub serializer: Arc<Serializer>,
    pub registry: Arc<CommandRegistry>,
    pub dataset_manager: Arc<DatasetManager>,
    pub broker: Arc<dyn BrokerAdapter>,
    pub metrics: Option<MetricFacade>,
}

impl Core {
    /// Assembles every shared component. Returns the receiving half of the
    /// metric channel alongside `Self` when metrics are enabled, so the
    /// caller can hand it to a [`MetricSender`] without `Core` itself
    /// owning a `!Clone` receiver.
    pub fn build(config: Config) -> Result<(Self, Option<tokio::sync::mpsc::Receiver<MetricSample>>), CoreError> {
        let hostname = Config::hostname();
        let serializer = Arc::new(Serializer::new(config.secret_key.as_bytes()));
        let registry = Arc::new(CommandRegistry::new());

        let dm_config = config.dataset_manager.clone();
        let dataset_manager = Arc::new(DatasetManager::new(
            dm_config.manager_settings(),
            dm_config.email_block_list_path.clone(),
            dm_config.ip_block_list_path.clone(),
            dm_config.unlimited_allow_list_path.clone(),
        ));
        handlers::register(&registry, dataset_manager.clone());

        // No concrete broker binding ships in this crate (spec.md §1 puts
        // AMQP/Azure Service Bus bindings out of scope); `broker.enabled`
        // only gates whether the router/supervisor attempt to use one.
        let broker: Arc<dyn BrokerAdapter> = Arc::new(NullBrokerAdapter);

        let (metrics, metrics_rx) = match config.metrics.sender_config() {
            Some(sender_config) => {
                let (tx, rx) = tokio::sync::mpsc::channel(sender_config.batch_size.max(1) * 4);
                (Some(MetricFacade::new(tx)), Some(rx))
            }
            None => (None, None),
        };

        Ok((
            Self {
                config,
                hostname,
                serializer,
                registry,
                dataset_manager,
                broker,
                metrics,
            },
            metrics_rx,
        ))
    }
}

/// Identifies a restartable worker so `Supervisor::run`'s reap loop knows
/// which one to respawn after a `JoinSet` entry completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerKind {
    Receiver,
    Ticker,
    Broker,
}

/// Spawns one worker into `workers` and records its task id under `kind`
/// so the reap loop in [`Supervisor::run`] can recognize it again when it
/// exits. Each call subscribes a fresh `halt_rx`, since a `broadcast`
/// receiver created before a prior `send` would otherwise see that old
/// send and halt immediately.
fn spawn_worker(
    workers: &mut JoinSet<Result<(), CoreError>>,
    kinds: &mut HashMap<Id, WorkerKind>,
    kind: WorkerKind,
    core: &Arc<Core>,
    halt_tx: &broadcast::Sender<()>,
) -> Result<(), CoreError> {
    let handle = match kind {
        WorkerKind::Receiver => {
            let addr = core.config.local.socket_addr().map_err(|e| CoreError::config(e.to_string()))?;
            let receiver = Receiver::new(addr, core.config.local.read_timeout, core.serializer.clone(), core.registry.clone());
            let halt_rx = halt_tx.subscribe();
            workers.spawn(async move { receiver.run(halt_rx).await })
        }
        WorkerKind::Ticker => {
            let core = core.clone();
            let mut halt_rx = halt_tx.subscribe();
            workers.spawn(async move { run_ticker(core, &mut halt_rx).await })
        }
        WorkerKind::Broker => {
            let broker = core.broker.clone();
            let serializer = core.serializer.clone();
            let registry = core.registry.clone();
            let hostname = core.hostname.clone();
            let halt_rx = halt_tx.subscribe();
            workers.spawn(async move {
                let handler: crate::core::broker::BrokerMessageHandler = Arc::new(move |envelope: String| {
                    if let Err(e) = crate::core::broker::dispatch_inbound(&envelope, &serializer, &registry, &hostname) {
                        tracing::warn!(error = %e, "failed to dispatch broker message");
                    }
                });
                broker.consume(halt_rx, handler).await
            })
        }
    };
    kinds.insert(handle.id(), kind);
    Ok(())
}

/// Owns every background worker and the two-stage halt broadcast that
/// stops them.
pub struct Supervisor {
    core: Arc<Core>,
    metrics_rx: Option<tokio::sync::mpsc::Receiver<MetricSample>>,
}

impl Supervisor {
    pub fn new(core: Core, metrics_rx: Option<tokio::sync::mpsc::Receiver<MetricSample>>) -> Self {
        Self {
            core: Arc::new(core),
            metrics_rx,
        }
    }

    /// Runs every worker, restarting any that exits or panics, until a
    /// shutdown signal is received; then drains and stops them in
    /// dependency order: the local receiver and broker consumer stop
    /// first (no more work can be produced), the ticker stops next, and
    /// the metric sender is always joined last so metrics emitted by the
    /// other workers' shutdown paths are not lost. Mirrors
    /// `manager.py::Application._reap_and_sow`.
    pub async fn run(mut self) -> Result<(), CoreError> {
        let (worker_halt_tx, _) = broadcast::channel::<()>(1);
        let (metrics_halt_tx, metrics_halt_rx) = broadcast::channel::<()>(1);

        self.core.registry.setup()?;

        let mut workers: JoinSet<Result<(), CoreError>> = JoinSet::new();
        let mut kinds: HashMap<Id, WorkerKind> = HashMap::new();

        spawn_worker(&mut workers, &mut kinds, WorkerKind::Receiver, &self.core, &worker_halt_tx)?;
        spawn_worker(&mut workers, &mut kinds, WorkerKind::Ticker, &self.core, &worker_halt_tx)?;
        if self.core.broker.is_valid() {
            spawn_worker(&mut workers, &mut kinds, WorkerKind::Broker, &self.core, &worker_halt_tx)?;
        }

        let metrics_handle = match (self.core.config.metrics.sender_config(), self.metrics_rx.take()) {
            (Some(sender_config), Some(rx)) => {
                let sender = MetricSender::new(sender_config, rx);
                Some(tokio::spawn(sender.run(metrics_halt_rx)))
            }
            _ => None,
        };

        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            let _ = shutdown_tx.send(());
        });

        let mut halted = false;
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown_rx, if !halted => {
                    tracing::info!("shutdown requested, halting local workers");
                    let _ = worker_halt_tx.send(());
                    halted = true;
                }
                joined = workers.join_next_with_id() => {
                    let Some(joined) = joined else { break };
                    let (id, outcome) = match joined {
                        Ok((id, outcome)) => (id, outcome),
                        Err(join_err) => (join_err.id(), Err(CoreError::transport(format!("worker task panicked: {join_err}")))),
                    };
                    let kind = kinds.remove(&id);
                    match &outcome {
                        Ok(()) => tracing::debug!(?kind, "worker exited"),
                        Err(e) => tracing::warn!(error = %e, ?kind, "worker exited with an error"),
                    }
                    if !halted {
                        match kind {
                            Some(kind) => {
                                tracing::info!(?kind, "restarting worker");
                                if let Err(e) = spawn_worker(&mut workers, &mut kinds, kind, &self.core, &worker_halt_tx) {
                                    tracing::warn!(error = %e, ?kind, "failed to restart worker");
                                }
                            }
                            None => tracing::warn!("exited task had no known worker kind, not restarting"),
                        }
                    }
                }
            }
        }

        tracing::info!("halting metric sender");
        let _ = metrics_halt_tx.send(());
        if let Some(handle) = metrics_handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "metric sender task panicked");
            }
        }

        self.core.registry.shutdown();
        Ok(())
    }
}

async fn run_ticker(core: Arc<Core>, halt: &mut broadcast::Receiver<()>) -> Result<(), CoreError> {
    let mut interval = tokio::time::interval(core.config.local.tick_interval.max(Duration::from_millis(1)));
    loop {
        tokio::select! {
            biased;
            _ = halt.recv() => return Ok(()),
            _ = interval.tick() => {
                if let Err(e) = core.dataset_manager.flush() {
                    tracing::warn!(error = %e, "periodic flush failed");
                }
            }
        }
    }
}

/// Waits for an interrupt or termination signal, escalating on repeated
/// presses: the first begins the graceful shutdown this function returns
/// for; a second logs an escalation warning (shutdown is already underway
/// and cannot go faster); a third forces an immediate process exit rather
/// than waiting on a worker that refuses to stop.
async fn wait_for_shutdown_signal() {
    let mut presses = 0u8;
    loop {
        wait_for_any_signal().await;
        presses += 1;
        match presses {
            1 => return,
            2 => tracing::warn!("second shutdown signal received, already stopping"),
            _ => {
                tracing::warn!("third shutdown signal received, forcing immediate exit");
                std::process::exit(130);
            }
        }
    }
}

#[cfg(unix)]
async fn wait_for_any_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut terminate = signal(SignalKind::terminate()).expect("installing SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_any_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_config(dir: &std::path::Path) -> Config {
        let mut config = Config::load(None).unwrap();
        config.local.port = 0;
        config.dataset_manager.big_parent_directory = dir.to_path_buf();
        config.dataset_manager.datasets_xml = dir.join("datasets.xml");
        config.dataset_manager.backups_dir = dir.join("backups");
        config.dataset_manager.ip_block_list_path = dir.join(".ip_block_list.txt");
        config.dataset_manager.email_block_list_path = dir.join(".email_block_list.txt");
        config.dataset_manager.unlimited_allow_list_path = dir.join(".unlimited_allow_list.txt");
        config
    }

    #[test]
    fn core_build_registers_dataset_commands() {
        let dir = tempfile::tempdir().unwrap();
        let (core, metrics_rx) = Core::build(test_config(dir.path())).unwrap();
        let resp = core.registry.route(&crate::core::command::Command::new("list_datasets"));
        assert!(resp.is_success());
        assert!(metrics_rx.is_none(), "metrics are disabled by default");
        let _: PathBuf = dir.path().to_path_buf();
    }
}
