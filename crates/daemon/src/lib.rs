//! mediaq daemon
//!
//! Persistent media-processing job queue: jobs are dispatched to a fixed pool
//! of workers, each job runs through a ranked chain of engines with fallback,
//! and the queue survives restarts.

pub mod concurrency;
pub mod daemon;
pub mod engine;
pub mod engines;
pub mod hardware;
pub mod job;
pub mod orchestrator;
pub mod persist;
pub mod progress;
pub mod queue;
pub mod server;
pub mod worker;

pub use mediaq_config as config;
pub use mediaq_config::Config;
pub use concurrency::{derive_plan, ConcurrencyPlan};
pub use daemon::{Daemon, DaemonError};
pub use engine::{
    Engine, EngineContext, EngineDescriptor, EngineError, EngineRegistry, Interrupt, JobView,
    ProbeOutcome, StageSink,
};
pub use engines::{builtin_engines, ExternalToolEngine, FfmpegEngine, FfmpegProfile};
pub use hardware::{AccelBackend, Detector, GpuVendor, HardwareInfo, HardwareProbe, SystemDetector};
pub use job::{
    EngineAttempt, FailureKind, Feature, Job, JobFailure, JobId, JobOptions, JobSpec, JobStatus,
    Resolution, SpecError, SpecPolicy,
};
pub use orchestrator::{candidate_order, JobOutcome, Orchestrator};
pub use persist::{load_jobs, save_jobs, LoadedJobs, PersistError};
pub use progress::{ProgressAggregator, StagePlan};
pub use queue::{JobEvent, JobLease, JobQueue, QueueError, QueueSettings, QueueStats, SubmitError};
pub use server::{create_router, run_server, ApiState, ServerError};
pub use worker::WorkerPool;
