//! Per-job control loop.
//!
//! The orchestrator takes one leased job, walks the fallback chain of engines
//! until one succeeds, and writes the outcome back through the lease.
//! Recoverable engine failures only bump `retry_count`; the job fails when an
//! engine reports a fatal error or every candidate has been tried.

use crate::engine::{
    Engine, EngineContext, EngineDescriptor, EngineError, EngineRegistry, Interrupt, JobView,
    StageSink,
};
use crate::hardware::HardwareInfo;
use crate::job::{EngineAttempt, FailureKind, JobFailure, SpecPolicy};
use crate::progress::ProgressAggregator;
use crate::queue::{JobLease, QueueError};
use async_trait::async_trait;
use mediaq_config::{PresetConfig, DEFAULT_PRESET};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How a job left the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed { engine: String },
    Failed(JobFailure),
    Cancelled,
    /// Handed back to the queue, usually because the daemon is stopping.
    Requeued,
}

/// Order the candidates for one job.
///
/// The preferred engine goes first when its probe succeeded; the rest keep
/// their ranked order. Disallowed engines are left out.
pub fn candidate_order(
    ranked: &[EngineDescriptor],
    preference: Option<&str>,
    policy: &SpecPolicy,
) -> Vec<EngineDescriptor> {
    let mut candidates: Vec<EngineDescriptor> = ranked
        .iter()
        .filter(|d| !policy.is_disallowed(d.name()))
        .cloned()
        .collect();

    if let Some(preferred) = preference {
        if let Some(pos) = candidates
            .iter()
            .position(|d| d.name() == preferred && d.probe.available)
        {
            let first = candidates.remove(pos);
            candidates.insert(0, first);
        }
    }
    candidates
}

/// Time an attempt spent waiting at stage boundaries.
///
/// Parked time does not count against the engine timeout.
#[derive(Default)]
struct ParkClock {
    state: Mutex<ParkState>,
    unparked: Notify,
}

#[derive(Default)]
struct ParkState {
    since: Option<Instant>,
    total: Duration,
}

impl ParkClock {
    fn park(&self) -> Parked<'_> {
        self.state.lock().since = Some(Instant::now());
        Parked(self)
    }

    /// When an attempt started at `started` runs out of time, or `None`
    /// while it is parked.
    fn deadline(&self, started: Instant, limit: Duration) -> Option<Instant> {
        let state = self.state.lock();
        match state.since {
            Some(_) => None,
            None => Some(started + limit + state.total),
        }
    }
}

struct Parked<'a>(&'a ParkClock);

impl Drop for Parked<'_> {
    fn drop(&mut self) {
        {
            let mut state = self.0.state.lock();
            if let Some(since) = state.since.take() {
                state.total += since.elapsed();
            }
        }
        self.0.unparked.notify_one();
    }
}

/// Stage sink bound to one engine attempt.
struct LeaseSink<'a> {
    lease: &'a JobLease,
    aggregator: Mutex<ProgressAggregator>,
    clock: ParkClock,
}

impl<'a> LeaseSink<'a> {
    fn new(lease: &'a JobLease, aggregator: ProgressAggregator) -> Self {
        Self {
            lease,
            aggregator: Mutex::new(aggregator),
            clock: ParkClock::default(),
        }
    }

    fn current_stage(&self) -> Option<String> {
        self.aggregator.lock().current_stage().map(str::to_string)
    }
}

#[async_trait]
impl StageSink for LeaseSink<'_> {
    async fn report(&self, stage: &str, weight: f32, fraction: f32) -> Result<(), Interrupt> {
        let boundary = self.aggregator.lock().is_new_stage(stage);
        if boundary {
            let _parked = self.clock.park();
            self.lease.checkpoint().await?;
            debug!(job_id = %self.lease.id(), stage, "Stage started");
        }

        let percent = self
            .aggregator
            .lock()
            .update_weighted(stage, Some(weight), fraction);
        if let Err(e) = self.lease.record_progress(stage, percent) {
            warn!(job_id = %self.lease.id(), error = %e, "Failed to record progress");
        }
        Ok(())
    }
}

/// Runs leased jobs against the registered engines.
pub struct Orchestrator {
    registry: Arc<EngineRegistry>,
    hardware: Arc<HardwareInfo>,
    presets: HashMap<String, PresetConfig>,
    default_timeout: Option<Duration>,
}

impl Orchestrator {
    pub fn new(registry: Arc<EngineRegistry>, hardware: Arc<HardwareInfo>) -> Self {
        Self {
            registry,
            hardware,
            presets: HashMap::new(),
            default_timeout: None,
        }
    }

    pub fn with_presets(mut self, presets: impl IntoIterator<Item = (String, PresetConfig)>) -> Self {
        self.presets = presets.into_iter().collect();
        self
    }

    /// Timeout applied to engines that do not declare their own.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    fn preset(&self, name: &str) -> Option<PresetConfig> {
        match self.presets.get(name) {
            Some(preset) => Some(preset.clone()),
            None if name == DEFAULT_PRESET => Some(PresetConfig::default()),
            None => None,
        }
    }

    /// Drive one job to a final state (or back to the queue on shutdown).
    pub async fn run(&self, lease: JobLease) -> Result<JobOutcome, QueueError> {
        let Some(job) = lease.job() else {
            return Err(QueueError::NotFound(lease.id().clone()));
        };
        let policy = lease.queue().policy().clone();

        if let Err(e) = job.spec.validate(&policy) {
            return self.finish_failed(lease, invalid_spec(e.to_string()));
        }
        let Some(preset) = self.preset(&job.spec.preset) else {
            let message = format!("unknown preset '{}'", job.spec.preset);
            return self.finish_failed(lease, invalid_spec(message));
        };

        let ranked = self.registry.snapshot();
        let candidates = candidate_order(&ranked, job.spec.engine_preference.as_deref(), &policy);
        let requested = job.spec.options.requested_features();
        let view = JobView {
            id: job.id.clone(),
            spec: job.spec.clone(),
            preset,
        };
        let ctx = EngineContext {
            cancel: lease.cancel_token(),
            hardware: Arc::clone(&self.hardware),
        };

        info!(
            job_id = %view.id,
            candidates = candidates.len(),
            source = %view.spec.source.display(),
            "Starting job"
        );

        let mut attempts: Vec<EngineAttempt> = Vec::new();
        for candidate in &candidates {
            let name = candidate.name().to_string();

            if let Err(interrupt) = lease.checkpoint().await {
                return self.finish_interrupted(lease, interrupt);
            }

            if !candidate.probe.available {
                debug!(job_id = %view.id, engine = %name, reason = %candidate.probe.reason, "Engine unavailable");
                self.record_attempt(&lease, &mut attempts, &name, None, format!("unavailable: {}", candidate.probe.reason));
                continue;
            }
            if let Some(missing) = requested.iter().find(|f| !candidate.engine.supports(**f)) {
                debug!(job_id = %view.id, engine = %name, feature = %missing, "Feature unsupported");
                self.record_attempt(&lease, &mut attempts, &name, None, format!("unavailable: does not support {}", missing));
                continue;
            }

            if let Err(e) = lease.set_engine(&name) {
                warn!(job_id = %view.id, error = %e, "Failed to record engine");
            }
            let sink = LeaseSink::new(
                &lease,
                ProgressAggregator::new(candidate.engine.stage_plan(&view)),
            );

            info!(job_id = %view.id, engine = %name, "Running engine");
            let limit = candidate.engine.timeout().or(self.default_timeout);
            let result = run_attempt(candidate.engine.as_ref(), &ctx, &view, &sink, limit).await;
            let stage = sink.current_stage();
            drop(sink);

            match result {
                Ok(()) if lease.is_cancelled() => {
                    return self.finish_interrupted(lease, Interrupt::Cancelled);
                }
                Ok(()) => {
                    lease.complete()?;
                    info!(job_id = %view.id, engine = %name, retries = attempts.len(), "Job completed");
                    return Ok(JobOutcome::Completed { engine: name });
                }
                Err(EngineError::Interrupted(interrupt)) => {
                    return self.finish_interrupted(lease, interrupt);
                }
                Err(e) if e.is_recoverable() => {
                    warn!(job_id = %view.id, engine = %name, stage = ?stage, error = %e, "Engine failed, trying next");
                    self.record_attempt(&lease, &mut attempts, &name, stage, e.to_string());
                }
                Err(e) => {
                    attempts.push(EngineAttempt {
                        engine: name.clone(),
                        stage: stage.clone(),
                        reason: e.to_string(),
                    });
                    let failure = JobFailure {
                        kind: FailureKind::Fatal,
                        engine: Some(name),
                        stage,
                        message: e.to_string(),
                        attempts,
                    };
                    return self.finish_failed(lease, failure);
                }
            }
        }

        let failure = exhausted(attempts);
        self.finish_failed(lease, failure)
    }

    fn record_attempt(
        &self,
        lease: &JobLease,
        attempts: &mut Vec<EngineAttempt>,
        engine: &str,
        stage: Option<String>,
        reason: String,
    ) {
        attempts.push(EngineAttempt {
            engine: engine.to_string(),
            stage,
            reason,
        });
        if let Err(e) = lease.record_retry() {
            warn!(job_id = %lease.id(), error = %e, "Failed to record retry");
        }
    }

    fn finish_failed(
        &self,
        lease: JobLease,
        failure: JobFailure,
    ) -> Result<JobOutcome, QueueError> {
        warn!(job_id = %lease.id(), kind = ?failure.kind, error = %failure, "Job failed");
        lease.fail(failure.clone())?;
        Ok(JobOutcome::Failed(failure))
    }

    fn finish_interrupted(
        &self,
        lease: JobLease,
        interrupt: Interrupt,
    ) -> Result<JobOutcome, QueueError> {
        match interrupt {
            Interrupt::Cancelled => {
                info!(job_id = %lease.id(), "Job cancelled");
                lease.cancelled()?;
                Ok(JobOutcome::Cancelled)
            }
            Interrupt::Shutdown | Interrupt::Lost => {
                info!(job_id = %lease.id(), reason = %interrupt, "Job returned to queue");
                drop(lease);
                Ok(JobOutcome::Requeued)
            }
        }
    }
}

/// Run one engine, failing with `TimedOut` once it has used `limit` outside
/// of pause waits.
async fn run_attempt(
    engine: &dyn Engine,
    ctx: &EngineContext,
    view: &JobView,
    sink: &LeaseSink<'_>,
    limit: Option<Duration>,
) -> Result<(), EngineError> {
    let run = engine.run(ctx, view, sink);
    let Some(limit) = limit else {
        return run.await;
    };
    tokio::pin!(run);

    let started = Instant::now();
    loop {
        match sink.clock.deadline(started, limit) {
            Some(deadline) if deadline <= Instant::now() => {
                return Err(EngineError::TimedOut(limit));
            }
            Some(deadline) => tokio::select! {
                result = &mut run => return result,
                _ = tokio::time::sleep_until(deadline) => {}
            },
            None => tokio::select! {
                result = &mut run => return result,
                _ = sink.clock.unparked.notified() => {}
            },
        }
    }
}

fn invalid_spec(message: String) -> JobFailure {
    JobFailure {
        kind: FailureKind::InvalidSpec,
        engine: None,
        stage: None,
        message,
        attempts: Vec::new(),
    }
}

fn exhausted(attempts: Vec<EngineAttempt>) -> JobFailure {
    let message = if attempts.is_empty() {
        "no engines available".to_string()
    } else {
        let detail: Vec<String> = attempts
            .iter()
            .map(|a| format!("{}: {}", a.engine, a.reason))
            .collect();
        format!("all {} engines failed: {}", attempts.len(), detail.join("; "))
    };
    let last = attempts.last();
    JobFailure {
        kind: FailureKind::Exhausted,
        engine: last.map(|a| a.engine.clone()),
        stage: last.and_then(|a| a.stage.clone()),
        message,
        attempts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::{Script, ScriptedEngine};
    use crate::engine::Engine;
    use crate::job::{Feature, JobId, JobOptions, JobSpec, JobStatus};
    use crate::queue::{JobQueue, QueueSettings};

    fn policy(engines: &[&str]) -> SpecPolicy {
        SpecPolicy::new(
            vec!["default".to_string()],
            engines.iter().map(|s| s.to_string()),
            Vec::new(),
        )
    }

    fn setup(engines: Vec<Arc<ScriptedEngine>>) -> (JobQueue, Orchestrator) {
        let names: Vec<&str> = engines.iter().map(|e| e.name.as_str()).collect();
        let queue = JobQueue::new(policy(&names), QueueSettings::default());
        let mut registry = EngineRegistry::new();
        for engine in engines {
            registry.register(engine as Arc<dyn Engine>);
        }
        let hw = HardwareInfo::fallback();
        registry.refresh(&hw);
        (queue, Orchestrator::new(Arc::new(registry), Arc::new(hw)))
    }

    async fn run_one(queue: &JobQueue, orchestrator: &Orchestrator, spec: JobSpec) -> (JobId, JobOutcome) {
        let id = queue.submit(spec).unwrap();
        let lease = queue.next_job().await.unwrap();
        let outcome = orchestrator.run(lease).await.unwrap();
        (id, outcome)
    }

    fn spec() -> JobSpec {
        JobSpec::new("a.mp4", "b.mp4", "default")
    }

    async fn wait_for(queue: &JobQueue, id: &JobId, status: JobStatus) -> bool {
        for _ in 0..200 {
            if queue.get(id).map(|j| j.status) == Some(status) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_fallback_past_unavailable_engines() {
        let third = Arc::new(ScriptedEngine::new("third", 10, Script::Succeed(vec!["encode"])));
        let (queue, orch) = setup(vec![
            Arc::new(ScriptedEngine::new("first", 30, Script::Succeed(vec![])).unavailable()),
            Arc::new(ScriptedEngine::new("second", 20, Script::Succeed(vec![])).unavailable()),
            Arc::clone(&third),
        ]);

        let (id, outcome) = run_one(&queue, &orch, spec()).await;
        assert_eq!(outcome, JobOutcome::Completed { engine: "third".to_string() });
        let job = queue.get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.engine_used.as_deref(), Some("third"));
        assert_eq!(job.retry_count, 2);
        assert_eq!(job.progress, 100.0);
        assert!(job.finished_at.is_some());
        assert_eq!(third.run_count(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_preference_falls_back() {
        let (queue, orch) = setup(vec![
            Arc::new(ScriptedEngine::new("accelerated", 100, Script::Succeed(vec![])).unavailable()),
            Arc::new(ScriptedEngine::new("generic", 50, Script::Succeed(vec!["encode"]))),
        ]);

        let (id, _) = run_one(&queue, &orch, spec().with_engine_preference("accelerated")).await;
        let job = queue.get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.engine_used.as_deref(), Some("generic"));
        assert_eq!(job.retry_count, 1);
    }

    #[tokio::test]
    async fn test_available_preference_runs_first() {
        let low = Arc::new(ScriptedEngine::new("low", 1, Script::Succeed(vec!["encode"])));
        let high = Arc::new(ScriptedEngine::new("high", 100, Script::Succeed(vec!["encode"])));
        let (queue, orch) = setup(vec![Arc::clone(&high), Arc::clone(&low)]);

        let (id, _) = run_one(&queue, &orch, spec().with_engine_preference("low")).await;
        let job = queue.get(&id).unwrap();
        assert_eq!(job.engine_used.as_deref(), Some("low"));
        assert_eq!(job.retry_count, 0);
        assert_eq!(high.run_count(), 0);
    }

    #[tokio::test]
    async fn test_execution_failure_is_recoverable() {
        let (queue, orch) = setup(vec![
            Arc::new(ScriptedEngine::new(
                "flaky",
                20,
                Script::Fail(vec!["decode", "encode"], EngineError::Execution("exit code 1".into())),
            )),
            Arc::new(ScriptedEngine::new("steady", 10, Script::Succeed(vec!["encode"]))),
        ]);

        let (id, outcome) = run_one(&queue, &orch, spec()).await;
        assert_eq!(outcome, JobOutcome::Completed { engine: "steady".to_string() });
        let job = queue.get(&id).unwrap();
        assert_eq!(job.retry_count, 1);
        assert!(job.error.is_none());
    }

    #[tokio::test]
    async fn test_fatal_failure_stops_the_chain() {
        let backup = Arc::new(ScriptedEngine::new("backup", 10, Script::Succeed(vec!["encode"])));
        let (queue, orch) = setup(vec![
            Arc::new(ScriptedEngine::new(
                "primary",
                20,
                Script::Fail(vec!["probe"], EngineError::Fatal("corrupt input".into())),
            )),
            Arc::clone(&backup),
        ]);

        let (id, outcome) = run_one(&queue, &orch, spec()).await;
        assert!(matches!(outcome, JobOutcome::Failed(_)));
        let job = queue.get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        let failure = job.error.unwrap();
        assert_eq!(failure.kind, FailureKind::Fatal);
        assert_eq!(failure.engine.as_deref(), Some("primary"));
        assert_eq!(failure.stage.as_deref(), Some("probe"));
        assert_eq!(backup.run_count(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_lists_every_attempt() {
        let (queue, orch) = setup(vec![
            Arc::new(ScriptedEngine::new("a", 20, Script::Succeed(vec![])).unavailable()),
            Arc::new(ScriptedEngine::new(
                "b",
                10,
                Script::Fail(vec!["encode"], EngineError::Execution("boom".into())),
            )),
        ]);

        let (id, _) = run_one(&queue, &orch, spec()).await;
        let job = queue.get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 2);
        let failure = job.error.unwrap();
        assert_eq!(failure.kind, FailureKind::Exhausted);
        assert_eq!(failure.attempts.len(), 2);
        assert_eq!(failure.attempts[0].engine, "a");
        assert_eq!(failure.attempts[1].stage.as_deref(), Some("encode"));
        assert!(failure.message.contains("a: unavailable"));
        assert!(failure.message.contains("b: execution failed: boom"));
    }

    #[tokio::test]
    async fn test_unsupported_feature_counts_as_unavailable() {
        let (queue, orch) = setup(vec![
            Arc::new(ScriptedEngine::new("plain", 50, Script::Succeed(vec!["encode"]))),
            Arc::new(
                ScriptedEngine::new("upscaler", 10, Script::Succeed(vec!["process"]))
                    .with_features(vec![Feature::Upscale]),
            ),
        ]);
        let options = JobOptions {
            upscale: Some(2),
            ..Default::default()
        };

        let (id, _) = run_one(&queue, &orch, spec().with_options(options)).await;
        let job = queue.get(&id).unwrap();
        assert_eq!(job.engine_used.as_deref(), Some("upscaler"));
        assert_eq!(job.retry_count, 1);
    }

    #[tokio::test]
    async fn test_engine_timeout_is_recoverable() {
        let (queue, orch) = setup(vec![
            Arc::new(
                ScriptedEngine::new("stuck", 20, Script::Slow(vec!["encode"], Duration::from_secs(30)))
                    .with_timeout(Duration::from_millis(30)),
            ),
            Arc::new(ScriptedEngine::new("quick", 10, Script::Succeed(vec!["encode"]))),
        ]);

        let (id, outcome) = run_one(&queue, &orch, spec()).await;
        assert_eq!(outcome, JobOutcome::Completed { engine: "quick".to_string() });
        assert_eq!(queue.get(&id).unwrap().retry_count, 1);
    }

    #[tokio::test]
    async fn test_pause_longer_than_timeout_keeps_engine() {
        let primary = Arc::new(
            ScriptedEngine::new("primary", 20, Script::Slow(vec!["prepare", "encode"], Duration::from_millis(40)))
                .with_timeout(Duration::from_millis(150)),
        );
        let backup = Arc::new(ScriptedEngine::new("backup", 10, Script::Succeed(vec!["encode"])));
        let (queue, orch) = setup(vec![Arc::clone(&primary), Arc::clone(&backup)]);
        let id = queue.submit(spec()).unwrap();
        let lease = queue.next_job().await.unwrap();

        let handle = tokio::spawn(async move { orch.run(lease).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.pause();
        tokio::time::sleep(Duration::from_millis(400)).await;

        let job = queue.get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Paused);
        assert_eq!(job.retry_count, 0);
        assert_eq!(backup.run_count(), 0);

        queue.resume();
        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome, JobOutcome::Completed { engine: "primary".to_string() });
        let job = queue.get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.engine_used.as_deref(), Some("primary"));
        assert_eq!(job.retry_count, 0);
        assert_eq!(primary.run_count(), 1);
        assert_eq!(backup.run_count(), 0);
    }

    #[tokio::test]
    async fn test_running_time_around_pause_still_times_out() {
        let stuck = Arc::new(
            ScriptedEngine::new("stuck", 20, Script::Slow(vec!["prepare", "encode", "mux"], Duration::from_millis(80)))
                .with_timeout(Duration::from_millis(120)),
        );
        let backup = Arc::new(ScriptedEngine::new("backup", 10, Script::Succeed(vec!["encode"])));
        let (queue, orch) = setup(vec![Arc::clone(&stuck), Arc::clone(&backup)]);
        let id = queue.submit(spec()).unwrap();
        let lease = queue.next_job().await.unwrap();

        let handle = tokio::spawn(async move { orch.run(lease).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.pause();
        assert!(wait_for(&queue, &id, JobStatus::Paused).await);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(backup.run_count(), 0);

        queue.resume();
        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome, JobOutcome::Completed { engine: "backup".to_string() });
        let job = queue.get(&id).unwrap();
        assert_eq!(job.retry_count, 1);
        assert_eq!(backup.run_count(), 1);
    }

    #[tokio::test]
    async fn test_no_engines_fails_exhausted() {
        let (queue, orch) = setup(Vec::new());
        let (id, _) = run_one(&queue, &orch, spec()).await;
        let failure = queue.get(&id).unwrap().error.unwrap();
        assert_eq!(failure.kind, FailureKind::Exhausted);
        assert_eq!(failure.message, "no engines available");
    }

    #[tokio::test]
    async fn test_cancel_during_run_stops_at_next_stage() {
        let (queue, orch) = setup(vec![Arc::new(ScriptedEngine::new(
            "slow",
            10,
            Script::Slow(vec!["probe", "encode"], Duration::from_millis(50)),
        ))]);
        let id = queue.submit(spec()).unwrap();
        let lease = queue.next_job().await.unwrap();

        let handle = tokio::spawn(async move { orch.run(lease).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.cancel(&id).unwrap(), JobStatus::Processing);

        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome, JobOutcome::Cancelled);
        let job = queue.get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.error.is_none());
    }

    #[tokio::test]
    async fn test_preset_missing_at_run_time_is_invalid_spec() {
        let queue = JobQueue::new(
            SpecPolicy::new(vec!["archive".to_string()], Vec::new(), Vec::new()),
            QueueSettings::default(),
        );
        let orch = Orchestrator::new(Arc::new(EngineRegistry::new()), Arc::new(HardwareInfo::fallback()));
        let (id, _) = run_one(&queue, &orch, JobSpec::new("a.mp4", "b.mp4", "archive")).await;
        let failure = queue.get(&id).unwrap().error.unwrap();
        assert_eq!(failure.kind, FailureKind::InvalidSpec);
    }

    #[test]
    fn test_candidate_order_excludes_disallowed() {
        let mut registry = EngineRegistry::new();
        registry.register(Arc::new(ScriptedEngine::new("a", 3, Script::Succeed(vec![]))));
        registry.register(Arc::new(ScriptedEngine::new("b", 2, Script::Succeed(vec![]))));
        registry.register(Arc::new(ScriptedEngine::new("c", 1, Script::Succeed(vec![]))));
        let ranked = registry.ranked_list(&HardwareInfo::fallback());
        let policy = SpecPolicy::new(Vec::new(), Vec::new(), vec!["b".to_string()]);

        let order: Vec<String> = candidate_order(&ranked, Some("c"), &policy)
            .iter()
            .map(|d| d.name().to_string())
            .collect();
        assert_eq!(order, vec!["c", "a"]);
    }
}
