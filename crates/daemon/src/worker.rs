//! Fixed-size worker pool.
//!
//! Each worker loops: wait for the next job, run it through the orchestrator,
//! repeat. Workers exit when the queue shuts down.

use crate::orchestrator::{JobOutcome, Orchestrator};
use crate::queue::JobQueue;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Handles of the running workers.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `count` workers (at least one).
    pub fn spawn(count: u32, queue: JobQueue, orchestrator: Arc<Orchestrator>) -> Self {
        let count = count.max(1);
        let handles = (0..count)
            .map(|worker| {
                let queue = queue.clone();
                let orchestrator = Arc::clone(&orchestrator);
                tokio::spawn(async move { worker_loop(worker, queue, orchestrator).await })
            })
            .collect();
        info!(workers = count, "Worker pool started");
        Self { handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every worker to exit.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!(error = %e, "Worker task panicked");
                }
            }
        }
    }

    /// Wait up to `grace` for workers to exit, then abort the rest.
    ///
    /// Returns true when every worker exited on its own.
    pub async fn join_with_timeout(self, grace: Duration) -> bool {
        let aborts: Vec<_> = self.handles.iter().map(|h| h.abort_handle()).collect();
        match tokio::time::timeout(grace, self.join()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(grace_secs = grace.as_secs(), "Workers still busy, aborting");
                for abort in aborts {
                    abort.abort();
                }
                false
            }
        }
    }
}

async fn worker_loop(worker: u32, queue: JobQueue, orchestrator: Arc<Orchestrator>) {
    debug!(worker, "Worker started");
    while let Some(lease) = queue.next_job().await {
        let job_id = lease.id().clone();
        match orchestrator.run(lease).await {
            Ok(JobOutcome::Completed { engine }) => {
                debug!(worker, job_id = %job_id, engine = %engine, "Worker finished job");
            }
            Ok(outcome) => {
                debug!(worker, job_id = %job_id, outcome = ?outcome, "Worker finished job");
            }
            Err(e) => {
                warn!(worker, job_id = %job_id, error = %e, "Job could not be written back");
            }
        }
    }
    debug!(worker, "Worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::{Script, ScriptedEngine};
    use crate::engine::{Engine, EngineRegistry};
    use crate::hardware::HardwareInfo;
    use crate::job::{JobSpec, JobStatus, SpecPolicy};
    use crate::queue::QueueSettings;

    #[tokio::test]
    async fn test_pool_drains_queue_and_stops() {
        let queue = JobQueue::new(
            SpecPolicy::new(vec!["default".to_string()], Vec::new(), Vec::new()),
            QueueSettings::default(),
        );
        let engine = Arc::new(ScriptedEngine::new(
            "generic",
            10,
            Script::Slow(vec!["encode"], Duration::from_millis(5)),
        ));
        let mut registry = EngineRegistry::new();
        registry.register(Arc::clone(&engine) as Arc<dyn Engine>);
        let hw = HardwareInfo::fallback();
        registry.refresh(&hw);
        let orchestrator = Arc::new(Orchestrator::new(Arc::new(registry), Arc::new(hw)));

        for n in 0..6 {
            queue
                .submit(JobSpec::new(format!("in{}.mp4", n), format!("out{}.mp4", n), "default"))
                .unwrap();
        }
        let pool = WorkerPool::spawn(2, queue.clone(), orchestrator);
        assert_eq!(pool.len(), 2);

        for _ in 0..200 {
            if queue.stats().completed == 6 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(queue.list(Some(JobStatus::Completed)).len(), 6);
        assert_eq!(engine.run_count(), 6);

        queue.shutdown();
        assert!(pool.join_with_timeout(Duration::from_secs(1)).await);
    }
}
