//! Shared harness for queue integration tests.
//!
//! Provides [`FakeEngine`], a scriptable engine that also checks no job is
//! ever run by two workers at once, and [`Harness`], which wires a queue, an
//! orchestrator and a worker pool the way the daemon does.

#![allow(dead_code)]

use async_trait::async_trait;
use mediaq::{
    Engine, EngineContext, EngineError, EngineRegistry, HardwareInfo, JobId, JobQueue, JobStatus,
    JobView, Orchestrator, ProbeOutcome, QueueSettings, SpecPolicy, StagePlan, StageSink,
    WorkerPool,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum Behavior {
    /// Probe reports the engine as missing.
    Unavailable,
    /// Run every stage, sleeping `delay` inside each.
    Succeed { delay: Duration },
    /// Return this error after the first stage.
    Fail(EngineError),
}

pub struct FakeEngine {
    name: String,
    priority: i32,
    stages: Vec<&'static str>,
    behavior: Behavior,
    timeout: Option<Duration>,
    runs: AtomicUsize,
    active: Mutex<HashSet<JobId>>,
    double_hold: AtomicBool,
}

impl FakeEngine {
    pub fn new(name: &str, priority: i32, behavior: Behavior) -> Arc<Self> {
        Self::build(name, priority, behavior, None)
    }

    /// Same as [`FakeEngine::new`] with an engine timeout.
    pub fn timed(name: &str, priority: i32, behavior: Behavior, timeout: Duration) -> Arc<Self> {
        Self::build(name, priority, behavior, Some(timeout))
    }

    fn build(name: &str, priority: i32, behavior: Behavior, timeout: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            priority,
            stages: vec!["prepare", "encode", "finalize"],
            behavior,
            timeout,
            runs: AtomicUsize::new(0),
            active: Mutex::new(HashSet::new()),
            double_hold: AtomicBool::new(false),
        })
    }

    pub fn quick(name: &str, priority: i32) -> Arc<Self> {
        Self::new(
            name,
            priority,
            Behavior::Succeed {
                delay: Duration::from_millis(1),
            },
        )
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn saw_double_hold(&self) -> bool {
        self.double_hold.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Engine for FakeEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn probe(&self, _hw: &HardwareInfo) -> ProbeOutcome {
        match self.behavior {
            Behavior::Unavailable => ProbeOutcome::unavailable("no device"),
            _ => ProbeOutcome::available("fake"),
        }
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn stage_plan(&self, _job: &JobView) -> Vec<StagePlan> {
        self.stages.iter().map(|s| StagePlan::new(*s, 1.0)).collect()
    }

    async fn run(
        &self,
        _ctx: &EngineContext,
        job: &JobView,
        sink: &dyn StageSink,
    ) -> Result<(), EngineError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if !self.active.lock().insert(job.id.clone()) {
            self.double_hold.store(true, Ordering::SeqCst);
        }
        let result = self.run_stages(sink).await;
        self.active.lock().remove(&job.id);
        result
    }
}

impl FakeEngine {
    async fn run_stages(&self, sink: &dyn StageSink) -> Result<(), EngineError> {
        match &self.behavior {
            Behavior::Unavailable => Err(EngineError::Unavailable("no device".to_string())),
            Behavior::Fail(err) => {
                sink.report(self.stages[0], 1.0, 0.0).await?;
                Err(err.clone())
            }
            Behavior::Succeed { delay } => {
                for stage in &self.stages {
                    sink.report(stage, 1.0, 0.0).await?;
                    tokio::time::sleep(*delay).await;
                    sink.report(stage, 1.0, 1.0).await?;
                }
                Ok(())
            }
        }
    }
}

pub fn policy() -> SpecPolicy {
    SpecPolicy::new(
        vec!["default".to_string()],
        Vec::<String>::new(),
        Vec::<String>::new(),
    )
}

pub fn orchestrator(engines: &[Arc<FakeEngine>]) -> Arc<Orchestrator> {
    let mut registry = EngineRegistry::new();
    for engine in engines {
        registry.register(Arc::clone(engine) as Arc<dyn Engine>);
    }
    let hardware = HardwareInfo::fallback();
    registry.refresh(&hardware);
    Arc::new(Orchestrator::new(Arc::new(registry), Arc::new(hardware)))
}

/// Queue plus running workers.
pub struct Harness {
    pub queue: JobQueue,
    pub pool: WorkerPool,
}

impl Harness {
    pub fn start(engines: &[Arc<FakeEngine>], workers: u32) -> Self {
        Self::start_with(JobQueue::new(policy(), QueueSettings::default()), engines, workers)
    }

    pub fn start_with(queue: JobQueue, engines: &[Arc<FakeEngine>], workers: u32) -> Self {
        let pool = WorkerPool::spawn(workers, queue.clone(), orchestrator(engines));
        Self { queue, pool }
    }

    pub async fn stop(self) {
        self.queue.shutdown();
        assert!(self.pool.join_with_timeout(Duration::from_secs(5)).await);
    }
}

/// Poll until `id` reaches `status` or the deadline passes.
pub async fn wait_for_status(queue: &JobQueue, id: &JobId, status: JobStatus) -> bool {
    for _ in 0..500 {
        if queue.get(id).map(|j| j.status) == Some(status) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Poll until every job is terminal or the deadline passes.
pub async fn wait_all_terminal(queue: &JobQueue) -> bool {
    for _ in 0..1000 {
        if queue.list(None).iter().all(|j| j.is_terminal()) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
