//! Engine contract and the ranked engine registry.
//!
//! Every processing backend implements [`Engine`]. The registry ranks the
//! registered engines once against a [`HardwareInfo`] snapshot and hands out
//! that immutable ranking until an explicit [`EngineRegistry::refresh`].

use crate::hardware::HardwareInfo;
use crate::job::{Feature, JobId, JobSpec};
use crate::progress::StagePlan;
use async_trait::async_trait;
use mediaq_config::PresetConfig;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Result of an engine's capability check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub available: bool,
    pub reason: String,
}

impl ProbeOutcome {
    pub fn available(reason: impl Into<String>) -> Self {
        Self {
            available: true,
            reason: reason.into(),
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            available: false,
            reason: reason.into(),
        }
    }
}

/// Why an engine stopped without finishing.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// Missing capability or dependency; try the next engine.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The engine started and failed; recoverable unless it was the last one.
    #[error("execution failed: {0}")]
    Execution(String),

    /// No other engine can do better (e.g. corrupt input).
    #[error("fatal: {0}")]
    Fatal(String),

    /// The engine's own time budget ran out.
    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    /// The job was stopped at a stage boundary.
    #[error("interrupted: {0}")]
    Interrupted(Interrupt),
}

impl EngineError {
    /// Whether the orchestrator should move on to the next candidate.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::Unavailable(_) | EngineError::Execution(_) | EngineError::TimedOut(_)
        )
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::NotFound {
            EngineError::Unavailable(format!("executable not found: {}", e))
        } else {
            EngineError::Execution(e.to_string())
        }
    }
}

/// Signal returned by a [`StageSink`] at a stage boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    /// The job was cancelled by a caller.
    Cancelled,
    /// The daemon is shutting down; the job goes back to the queue.
    Shutdown,
    /// The held job could not be parked or resumed; the lease is given up.
    Lost,
}

impl fmt::Display for Interrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interrupt::Cancelled => f.write_str("cancelled"),
            Interrupt::Shutdown => f.write_str("shutdown"),
            Interrupt::Lost => f.write_str("lost"),
        }
    }
}

impl From<Interrupt> for EngineError {
    fn from(interrupt: Interrupt) -> Self {
        EngineError::Interrupted(interrupt)
    }
}

/// Receiver of stage progress events.
///
/// The first report of a new stage is a stage boundary: the sink may park
/// there while the queue is paused, and returns [`Interrupt::Cancelled`]
/// when the job was cancelled or the daemon is stopping. Engines propagate
/// the interrupt with `?`.
#[async_trait]
pub trait StageSink: Send + Sync {
    async fn report(&self, stage: &str, weight: f32, fraction: f32) -> Result<(), Interrupt>;
}

/// Execution context handed to an engine.
#[derive(Debug, Clone)]
pub struct EngineContext {
    /// Fires when the job is cancelled; engines may watch it but are only
    /// required to honor it at stage boundaries.
    pub cancel: CancellationToken,
    pub hardware: Arc<HardwareInfo>,
}

/// Read-only view of the job an engine executes.
#[derive(Debug, Clone)]
pub struct JobView {
    pub id: JobId,
    pub spec: JobSpec,
    pub preset: PresetConfig,
}

/// A pluggable processing backend.
#[async_trait]
pub trait Engine: Send + Sync {
    fn name(&self) -> &str;

    /// Static rank; higher runs first.
    fn priority(&self) -> i32;

    /// Capability check against a hardware snapshot. Evaluated at ranking
    /// time, not per job.
    fn probe(&self, hw: &HardwareInfo) -> ProbeOutcome;

    /// Whether the engine implements an optional feature.
    fn supports(&self, _feature: Feature) -> bool {
        false
    }

    /// Upper bound for one `run` call. Time parked while the queue is
    /// paused is not counted.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Stages `run` will report, with their weights. Undeclared stages are
    /// still accepted but skew the percentage until they appear.
    fn stage_plan(&self, _job: &JobView) -> Vec<StagePlan> {
        Vec::new()
    }

    async fn run(
        &self,
        ctx: &EngineContext,
        job: &JobView,
        sink: &dyn StageSink,
    ) -> Result<(), EngineError>;
}

/// An engine placed in the ranking, with its probe result frozen.
#[derive(Clone)]
pub struct EngineDescriptor {
    pub engine: Arc<dyn Engine>,
    pub probe: ProbeOutcome,
    pub registration: usize,
}

impl EngineDescriptor {
    pub fn name(&self) -> &str {
        self.engine.name()
    }

    pub fn priority(&self) -> i32 {
        self.engine.priority()
    }
}

impl fmt::Debug for EngineDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineDescriptor")
            .field("name", &self.name())
            .field("priority", &self.priority())
            .field("probe", &self.probe)
            .field("registration", &self.registration)
            .finish()
    }
}

/// Registered engines plus the current ranking.
#[derive(Default)]
pub struct EngineRegistry {
    engines: Vec<Arc<dyn Engine>>,
    ranked: RwLock<Arc<Vec<EngineDescriptor>>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an engine to the candidate pool. Startup only.
    pub fn register(&mut self, engine: Arc<dyn Engine>) {
        self.engines.push(engine);
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    /// Names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.engines.iter().map(|e| e.name().to_string()).collect()
    }

    /// Rank the engines for `hw`: priority descending, ties by registration
    /// order. Does not touch the stored ranking.
    pub fn ranked_list(&self, hw: &HardwareInfo) -> Vec<EngineDescriptor> {
        let mut ranked: Vec<EngineDescriptor> = self
            .engines
            .iter()
            .enumerate()
            .map(|(registration, engine)| EngineDescriptor {
                engine: Arc::clone(engine),
                probe: engine.probe(hw),
                registration,
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.priority()
                .cmp(&a.priority())
                .then(a.registration.cmp(&b.registration))
        });
        ranked
    }

    /// Recompute the ranking and swap it in.
    pub fn refresh(&self, hw: &HardwareInfo) -> Arc<Vec<EngineDescriptor>> {
        let ranked = Arc::new(self.ranked_list(hw));
        *self.ranked.write() = Arc::clone(&ranked);
        ranked
    }

    /// Current ranking; empty until the first refresh.
    pub fn snapshot(&self) -> Arc<Vec<EngineDescriptor>> {
        Arc::clone(&self.ranked.read())
    }
}
