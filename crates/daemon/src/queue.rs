//! Job queue: owner of every job and the dispatch point for workers.
//!
//! [`JobQueue`] is a cheap cloneable handle. The job table sits behind one
//! read-write lock with short exclusive sections; readers always get whole
//! [`Job`] snapshots. Workers pull jobs with [`JobQueue::next_job`] and receive
//! a [`JobLease`], the only handle allowed to mutate a running job.
//!
//! Every mutation publishes a [`JobEvent`] and schedules a debounced write of
//! the table to disk.

use crate::engine::Interrupt;
use crate::job::{
    current_timestamp_ms, Job, JobFailure, JobId, JobSpec, JobStatus, SpecError, SpecPolicy,
    TransitionError,
};
use crate::persist::{self, PersistError};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Errors returned by [`JobQueue::submit`].
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("invalid job spec: {0}")]
    InvalidSpec(#[from] SpecError),

    #[error("queue is shutting down")]
    ShuttingDown,
}

/// Errors from queue operations other than submission.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("job {id} is already {status}")]
    AlreadyTerminal { id: JobId, status: JobStatus },

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Persist(#[from] PersistError),

    #[error("persistence task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Change notification sent to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobEvent {
    pub id: JobId,
    pub status: JobStatus,
    pub progress: f32,
    pub stage: Option<String>,
}

impl JobEvent {
    fn of(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            status: job.status,
            progress: job.progress,
            stage: job.current_stage.clone(),
        }
    }
}

/// Job counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total: usize,
}

impl QueueStats {
    fn count(&mut self, status: JobStatus) {
        match status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Processing => self.processing += 1,
            JobStatus::Paused => self.paused += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Cancelled => self.cancelled += 1,
        }
        self.total += 1;
    }
}

/// Queue tuning.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Where the job table is persisted; `None` keeps it in memory only.
    pub state_path: Option<PathBuf>,
    pub persist_debounce: Duration,
    pub event_buffer: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            state_path: None,
            persist_debounce: Duration::from_millis(250),
            event_buffer: 256,
        }
    }
}

impl QueueSettings {
    /// Build settings from the `[queue]` config section.
    pub fn from_config(config: &mediaq_config::QueueConfig) -> Self {
        Self {
            state_path: Some(config.state_path.clone()),
            persist_debounce: Duration::from_millis(config.persist_debounce_ms),
            event_buffer: config.event_buffer.max(1),
        }
    }
}

struct Entry {
    job: Job,
    cancel: CancellationToken,
    leased: bool,
}

#[derive(Default)]
struct Table {
    jobs: HashMap<JobId, Entry>,
    /// Pending ids in dispatch order.
    pending: VecDeque<JobId>,
    next_seq: u64,
}

impl Table {
    fn enqueue(&mut self, id: JobId, seq: u64) {
        let pos = self
            .pending
            .iter()
            .position(|other| self.jobs.get(other).map_or(false, |e| e.job.seq > seq))
            .unwrap_or(self.pending.len());
        self.pending.insert(pos, id);
    }
}

struct Inner {
    table: RwLock<Table>,
    policy: SpecPolicy,
    settings: QueueSettings,
    paused: watch::Sender<bool>,
    shutdown: CancellationToken,
    dispatch: Notify,
    dirty: Notify,
    events: broadcast::Sender<JobEvent>,
    persist_lock: tokio::sync::Mutex<()>,
}

/// Handle to the shared job queue.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<Inner>,
}

impl JobQueue {
    /// Create an empty queue that validates submissions against `policy`.
    pub fn new(policy: SpecPolicy, settings: QueueSettings) -> Self {
        let (events, _) = broadcast::channel(settings.event_buffer.max(1));
        let (paused, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                table: RwLock::new(Table {
                    next_seq: 1,
                    ..Table::default()
                }),
                policy,
                settings,
                paused,
                shutdown: CancellationToken::new(),
                dispatch: Notify::new(),
                dirty: Notify::new(),
                events,
                persist_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Create a queue and fill it from the persisted job table.
    ///
    /// Interrupted jobs come back as pending. Returns the number recovered.
    pub fn restore(policy: SpecPolicy, settings: QueueSettings) -> Result<(Self, usize), QueueError> {
        let loaded = match &settings.state_path {
            Some(path) => persist::load_jobs(path)?,
            None => persist::LoadedJobs::default(),
        };
        let queue = Self::new(policy, settings);
        {
            let mut table = queue.inner.table.write();
            for job in loaded.jobs {
                let next_seq = table.next_seq.max(job.seq + 1);
                table.next_seq = next_seq;
                let id = job.id.clone();
                let seq = job.seq;
                let pending = job.status == JobStatus::Pending;
                table.jobs.insert(
                    id.clone(),
                    Entry {
                        job,
                        cancel: CancellationToken::new(),
                        leased: false,
                    },
                );
                if pending {
                    table.enqueue(id, seq);
                }
            }
            info!(
                jobs = table.jobs.len(),
                pending = table.pending.len(),
                recovered = loaded.recovered,
                "Job table restored"
            );
        }
        if loaded.recovered > 0 {
            queue.mark_dirty();
        }
        Ok((queue, loaded.recovered))
    }

    pub fn policy(&self) -> &SpecPolicy {
        &self.inner.policy
    }

    /// Validate and enqueue a job. Never waits on execution.
    pub fn submit(&self, spec: JobSpec) -> Result<JobId, SubmitError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(SubmitError::ShuttingDown);
        }
        spec.validate(&self.inner.policy)?;

        let id = {
            let mut table = self.inner.table.write();
            let seq = table.next_seq;
            table.next_seq += 1;
            let job = Job::new(seq, spec);
            let id = job.id.clone();
            self.publish(&job);
            table.jobs.insert(
                id.clone(),
                Entry {
                    job,
                    cancel: CancellationToken::new(),
                    leased: false,
                },
            );
            table.pending.push_back(id.clone());
            id
        };

        debug!(job_id = %id, "Job submitted");
        self.inner.dispatch.notify_waiters();
        self.mark_dirty();
        Ok(id)
    }

    /// Snapshot of one job.
    pub fn get(&self, id: &JobId) -> Option<Job> {
        self.inner.table.read().jobs.get(id).map(|e| e.job.clone())
    }

    /// Snapshots in submission order, optionally filtered by status.
    pub fn list(&self, filter: Option<JobStatus>) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .inner
            .table
            .read()
            .jobs
            .values()
            .filter(|e| filter.map_or(true, |status| e.job.status == status))
            .map(|e| e.job.clone())
            .collect();
        jobs.sort_by_key(|job| job.seq);
        jobs
    }

    /// Cancel a job.
    ///
    /// A pending job is cancelled on the spot. A running or paused job gets
    /// its cancellation flag raised and stops at its next stage boundary.
    /// Returns the status the job has after the call.
    pub fn cancel(&self, id: &JobId) -> Result<JobStatus, QueueError> {
        let status = {
            let mut table = self.inner.table.write();
            let entry = table
                .jobs
                .get_mut(id)
                .ok_or_else(|| QueueError::NotFound(id.clone()))?;

            match entry.job.status {
                JobStatus::Pending => {
                    entry.job.transition(JobStatus::Cancelled)?;
                    entry.cancel.cancel();
                    let event = JobEvent::of(&entry.job);
                    table.pending.retain(|pending| pending != id);
                    let _ = self.inner.events.send(event);
                    JobStatus::Cancelled
                }
                JobStatus::Processing | JobStatus::Paused => {
                    entry.cancel.cancel();
                    entry.job.updated_at = current_timestamp_ms();
                    self.publish(&entry.job);
                    entry.job.status
                }
                status => {
                    return Err(QueueError::AlreadyTerminal {
                        id: id.clone(),
                        status,
                    })
                }
            }
        };

        info!(job_id = %id, status = %status, "Cancellation requested");
        self.mark_dirty();
        Ok(status)
    }

    /// Close the dispatch gate. Running jobs park at their next stage boundary.
    pub fn pause(&self) {
        if !self.inner.paused.send_replace(true) {
            info!("Queue paused");
        }
    }

    /// Reopen the dispatch gate and wake parked jobs.
    pub fn resume(&self) {
        if self.inner.paused.send_replace(false) {
            info!("Queue resumed");
        }
        self.inner.dispatch.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        *self.inner.paused.borrow()
    }

    pub fn stats(&self) -> QueueStats {
        let mut stats = QueueStats::default();
        for entry in self.inner.table.read().jobs.values() {
            stats.count(entry.job.status);
        }
        stats
    }

    /// Drop every terminal job. Returns how many were removed.
    pub fn clear_completed(&self) -> usize {
        let removed = {
            let mut table = self.inner.table.write();
            let before = table.jobs.len();
            table.jobs.retain(|_, e| !e.job.is_terminal());
            before - table.jobs.len()
        };
        if removed > 0 {
            info!(removed, "Cleared finished jobs");
            self.mark_dirty();
        }
        removed
    }

    /// Receive job change events. Slow receivers lag and lose events.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    /// Wait for the next job to dispatch.
    ///
    /// Blocks while the queue is empty or paused. Returns `None` once the
    /// queue shuts down.
    pub async fn next_job(&self) -> Option<JobLease> {
        loop {
            let notified = self.inner.dispatch.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.inner.shutdown.is_cancelled() {
                return None;
            }
            if !self.is_paused() {
                if let Some(lease) = self.try_claim() {
                    return Some(lease);
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = self.inner.shutdown.cancelled() => return None,
            }
        }
    }

    fn try_claim(&self) -> Option<JobLease> {
        let mut table = self.inner.table.write();
        while let Some(id) = table.pending.pop_front() {
            let Some(entry) = table.jobs.get_mut(&id) else {
                continue;
            };
            if entry.leased || entry.job.status != JobStatus::Pending {
                continue;
            }
            if entry.job.transition(JobStatus::Processing).is_err() {
                continue;
            }
            entry.leased = true;
            self.publish(&entry.job);
            let cancel = entry.cancel.clone();
            drop(table);

            self.mark_dirty();
            return Some(JobLease {
                queue: self.clone(),
                id,
                cancel,
                released: false,
            });
        }
        None
    }

    /// Stop dispatching. Parked jobs are released at their boundary.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.dispatch.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Write the whole table to the state file, if one is configured.
    pub async fn persist(&self) -> Result<(), QueueError> {
        let Some(path) = self.inner.settings.state_path.clone() else {
            return Ok(());
        };
        let _guard = self.inner.persist_lock.lock().await;
        let jobs: Vec<Job> = self
            .inner
            .table
            .read()
            .jobs
            .values()
            .map(|e| e.job.clone())
            .collect();
        tokio::task::spawn_blocking(move || persist::save_jobs(&path, &jobs)).await??;
        Ok(())
    }

    /// Spawn the background writer: debounced after mutations and on every
    /// `interval` tick. Ends when the queue shuts down.
    pub fn spawn_persister(&self, interval: Duration) -> JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            let debounce = queue.inner.settings.persist_debounce;
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = queue.inner.dirty.notified() => {
                        tokio::select! {
                            _ = tokio::time::sleep(debounce) => {}
                            _ = queue.inner.shutdown.cancelled() => break,
                        }
                    }
                    _ = ticker.tick() => {}
                    _ = queue.inner.shutdown.cancelled() => break,
                }
                if let Err(e) = queue.persist().await {
                    warn!(error = %e, "Failed to persist job table");
                }
            }
            debug!("Persister stopped");
        })
    }

    fn mark_dirty(&self) {
        self.inner.dirty.notify_one();
    }

    fn publish(&self, job: &Job) {
        // No receivers is fine.
        let _ = self.inner.events.send(JobEvent::of(job));
    }

    /// Apply `f` to a leased job under the write lock and publish the result.
    fn with_leased<R>(
        &self,
        id: &JobId,
        f: impl FnOnce(&mut Job) -> Result<R, TransitionError>,
    ) -> Result<R, QueueError> {
        let result = {
            let mut table = self.inner.table.write();
            let entry = table
                .jobs
                .get_mut(id)
                .ok_or_else(|| QueueError::NotFound(id.clone()))?;
            let result = f(&mut entry.job)?;
            entry.job.updated_at = current_timestamp_ms();
            self.publish(&entry.job);
            result
        };
        self.mark_dirty();
        Ok(result)
    }

    fn release(&self, id: &JobId) {
        let mut table = self.inner.table.write();
        let Some(entry) = table.jobs.get_mut(id) else {
            return;
        };
        entry.leased = false;
        if entry.job.is_terminal() {
            return;
        }
        if entry.cancel.is_cancelled() {
            // Cancelled while held; finish it rather than requeue.
            if entry.job.transition(JobStatus::Cancelled).is_ok() {
                self.publish(&entry.job);
            }
        } else if entry.job.reset_for_recovery() {
            let seq = entry.job.seq;
            self.publish(&entry.job);
            table.enqueue(id.clone(), seq);
            self.inner.dispatch.notify_waiters();
        }
        drop(table);
        self.mark_dirty();
    }
}

/// Exclusive mutation handle for one running job.
///
/// Dropping a lease without finishing it puts the job back in the queue.
pub struct JobLease {
    queue: JobQueue,
    id: JobId,
    cancel: CancellationToken,
    released: bool,
}

impl JobLease {
    pub fn id(&self) -> &JobId {
        &self.id
    }

    /// Current snapshot of the held job.
    pub fn job(&self) -> Option<Job> {
        self.queue.get(&self.id)
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Token fired when the job is cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Record which engine is running the job.
    pub fn set_engine(&self, engine: &str) -> Result<(), QueueError> {
        self.queue.with_leased(&self.id, |job| {
            job.engine_used = Some(engine.to_string());
            Ok(())
        })
    }

    /// Record stage progress. Overall progress only moves forward.
    pub fn record_progress(&self, stage: &str, percent: f32) -> Result<(), QueueError> {
        self.queue.with_leased(&self.id, |job| {
            if job.current_stage.as_deref() != Some(stage) {
                job.current_stage = Some(stage.to_string());
            }
            job.advance_progress(percent);
            Ok(())
        })
    }

    /// Count one failed engine attempt.
    pub fn record_retry(&self) -> Result<u32, QueueError> {
        self.queue.with_leased(&self.id, |job| {
            job.retry_count += 1;
            Ok(job.retry_count)
        })
    }

    /// Stage boundary: honor cancellation and the pause gate.
    ///
    /// While the queue is paused the job shows as `paused` and this call
    /// waits for resume, cancellation or shutdown.
    pub async fn checkpoint(&self) -> Result<(), Interrupt> {
        if self.cancel.is_cancelled() {
            return Err(Interrupt::Cancelled);
        }
        if self.queue.is_shutting_down() {
            return Err(Interrupt::Shutdown);
        }
        if !self.queue.is_paused() {
            return self.unpark();
        }

        // A job left parked by an abandoned wait is still parked.
        let parked = self.queue.with_leased(&self.id, |job| match job.status {
            JobStatus::Paused => Ok(false),
            _ => job.transition(JobStatus::Paused).map(|()| true),
        });
        match parked {
            Ok(true) => info!(job_id = %self.id, "Job paused at stage boundary"),
            Ok(false) => debug!(job_id = %self.id, "Job already parked"),
            Err(e) => {
                warn!(job_id = %self.id, error = %e, "Could not park job");
                return Err(Interrupt::Lost);
            }
        }

        let mut paused = self.queue.inner.paused.subscribe();
        let interrupt = tokio::select! {
            _ = paused.wait_for(|p| !*p) => None,
            _ = self.cancel.cancelled() => Some(Interrupt::Cancelled),
            _ = self.queue.inner.shutdown.cancelled() => Some(Interrupt::Shutdown),
        };
        if let Some(interrupt) = interrupt {
            return Err(interrupt);
        }
        self.unpark()
    }

    /// Move a parked job back to `processing`. No-op for a running job.
    fn unpark(&self) -> Result<(), Interrupt> {
        let status = self
            .queue
            .inner
            .table
            .read()
            .jobs
            .get(&self.id)
            .map(|e| e.job.status);
        match status {
            Some(JobStatus::Paused) => {}
            Some(_) => return Ok(()),
            None => return Err(Interrupt::Lost),
        }

        if let Err(e) = self
            .queue
            .with_leased(&self.id, |job| job.transition(JobStatus::Processing))
        {
            warn!(job_id = %self.id, error = %e, "Could not resume job");
            return Err(Interrupt::Lost);
        }
        info!(job_id = %self.id, "Job resumed");
        Ok(())
    }

    /// Finish successfully.
    pub fn complete(mut self) -> Result<(), QueueError> {
        self.released = true;
        let result = self.queue.with_leased(&self.id, |job| {
            job.advance_progress(100.0);
            job.transition(JobStatus::Completed)
        });
        self.finish();
        result
    }

    /// Finish with an error.
    pub fn fail(mut self, failure: JobFailure) -> Result<(), QueueError> {
        self.released = true;
        let result = self.queue.with_leased(&self.id, |job| job.fail(failure));
        self.finish();
        result
    }

    /// Finish as cancelled.
    pub fn cancelled(mut self) -> Result<(), QueueError> {
        self.released = true;
        let result = self
            .queue
            .with_leased(&self.id, |job| job.transition(JobStatus::Cancelled));
        self.finish();
        result
    }

    fn finish(&self) {
        self.queue.release(&self.id);
    }
}

impl Drop for JobLease {
    fn drop(&mut self) {
        if !self.released {
            debug!(job_id = %self.id, "Lease dropped unfinished, releasing job");
            self.queue.release(&self.id);
        }
    }
}
