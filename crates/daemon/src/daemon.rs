//! Daemon startup and main loop for mediaq
//!
//! Wires configuration, hardware detection, engine ranking, the persisted
//! queue, the worker pool and the HTTP API together, and tears them down in
//! order on shutdown.

use crate::concurrency::{derive_plan, ConcurrencyPlan};
use crate::config::{Config, ConfigError};
use crate::engine::{Engine, EngineRegistry};
use crate::engines::builtin_engines;
use crate::hardware::{HardwareInfo, HardwareProbe, SystemDetector};
use crate::job::SpecPolicy;
use crate::orchestrator::Orchestrator;
use crate::queue::{JobQueue, QueueError, QueueSettings};
use crate::server::{run_server, ApiState, ServerError};
use crate::worker::WorkerPool;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How long workers get to reach a stage boundary after shutdown starts.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Queue could not be restored or saved
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// API server error
    #[error("Server error: {0}")]
    Server(#[from] ServerError),

    /// Nothing registered to run jobs with
    #[error("no engines registered")]
    NoEngines,
}

/// Daemon state containing all runtime components
pub struct Daemon {
    /// Configuration loaded from file and environment
    pub config: Config,
    /// Derived concurrency plan
    pub concurrency_plan: ConcurrencyPlan,
    hardware: Arc<HardwareInfo>,
    registry: Arc<EngineRegistry>,
    queue: JobQueue,
    orchestrator: Arc<Orchestrator>,
    recovered: usize,
}

impl Daemon {
    /// Initialize the daemon with configuration from file
    ///
    /// This performs the full startup sequence:
    /// 1. Load config from file and apply environment overrides
    /// 2. Derive concurrency plan
    /// 3. Detect hardware, bounded by `hardware.probe_timeout_ms`
    /// 4. Register and rank the built-in engines
    /// 5. Restore the persisted queue
    pub async fn new<P: AsRef<Path>>(config_path: P) -> Result<Self, DaemonError> {
        let config = Config::load(config_path)?;
        Self::with_config(config).await
    }

    /// Initialize the daemon with an existing configuration
    pub async fn with_config(config: Config) -> Result<Self, DaemonError> {
        let hw_cfg = &config.hardware;
        let probe = HardwareProbe::new(
            SystemDetector::new(config.engines.ffmpeg_path.clone(), hw_cfg.disallow_hardware),
            Duration::from_secs(hw_cfg.cache_ttl_secs),
        );
        let hardware = probe
            .detect(Duration::from_millis(hw_cfg.probe_timeout_ms))
            .await;
        let engines = builtin_engines(&config);
        Self::with_engines(config, hardware, engines)
    }

    /// Initialize the daemon with a fixed hardware snapshot and engine set
    ///
    /// Skips detection; useful for testing when ffmpeg is not available.
    pub fn with_engines(
        config: Config,
        hardware: HardwareInfo,
        engines: Vec<Arc<dyn Engine>>,
    ) -> Result<Self, DaemonError> {
        if engines.is_empty() {
            return Err(DaemonError::NoEngines);
        }
        let concurrency_plan = derive_plan(&config);

        let mut registry = EngineRegistry::new();
        for engine in engines {
            registry.register(engine);
        }
        for entry in registry.refresh(&hardware).iter() {
            if entry.probe.available {
                info!(engine = %entry.name(), priority = entry.priority(), reason = %entry.probe.reason, "Engine available");
            } else {
                warn!(engine = %entry.name(), reason = %entry.probe.reason, "Engine unavailable");
            }
        }

        let policy = SpecPolicy::new(
            config.preset_names(),
            registry.names(),
            config.engines.disallowed.iter().cloned(),
        );
        let (queue, recovered) =
            JobQueue::restore(policy, QueueSettings::from_config(&config.queue))?;

        let hardware = Arc::new(hardware);
        let registry = Arc::new(registry);
        let mut orchestrator = Orchestrator::new(Arc::clone(&registry), Arc::clone(&hardware))
            .with_presets(config.presets.clone());
        if config.engines.default_timeout_secs > 0 {
            orchestrator = orchestrator
                .with_default_timeout(Duration::from_secs(config.engines.default_timeout_secs));
        }

        info!(
            cores = concurrency_plan.total_cores,
            workers = concurrency_plan.workers,
            gpu = ?hardware.gpu_name,
            recovered,
            "Daemon initialized"
        );

        Ok(Self {
            config,
            concurrency_plan,
            hardware,
            registry,
            queue,
            orchestrator: Arc::new(orchestrator),
            recovered,
        })
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn registry(&self) -> &Arc<EngineRegistry> {
        &self.registry
    }

    pub fn hardware(&self) -> &Arc<HardwareInfo> {
        &self.hardware
    }

    /// Jobs that were mid-flight when the previous run stopped.
    pub fn recovered(&self) -> usize {
        self.recovered
    }

    /// Run until Ctrl-C.
    pub async fn run(self) -> Result<(), DaemonError> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
            info!("Shutdown requested");
        })
        .await
    }

    /// Run workers, persistence and the API until `shutdown` resolves.
    ///
    /// Shutdown stops dispatch, lets workers reach a stage boundary (their
    /// jobs go back to the queue), then saves the queue.
    pub async fn run_until(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), DaemonError> {
        let pool = WorkerPool::spawn(
            self.concurrency_plan.workers,
            self.queue.clone(),
            Arc::clone(&self.orchestrator),
        );
        let persister = self
            .queue
            .spawn_persister(Duration::from_secs(self.config.queue.persist_interval_secs.max(1)));

        let stop = CancellationToken::new();
        let server_stop = stop.clone();
        let state = ApiState {
            queue: self.queue.clone(),
            hardware: Arc::clone(&self.hardware),
            workers: pool.len(),
        };
        let bind = self.config.server.bind.clone();
        let mut server = tokio::spawn(async move {
            run_server(state, &bind, async move { server_stop.cancelled().await }).await
        });

        let server_result = tokio::select! {
            _ = shutdown => None,
            result = &mut server => Some(result),
        };

        self.queue.shutdown();
        stop.cancel();
        if !pool.join_with_timeout(SHUTDOWN_GRACE).await {
            warn!("Some workers were aborted mid-stage; their jobs were requeued");
        }
        if let Err(e) = persister.await {
            warn!(error = %e, "Persistence task ended abnormally");
        }
        self.queue.persist().await?;
        info!(stats = ?self.queue.stats(), "Queue saved");

        let server_result = match server_result {
            Some(result) => result,
            None => server.await,
        };
        match server_result {
            Ok(result) => result?,
            Err(e) => error!(error = %e, "API server task failed"),
        }
        Ok(())
    }
}
