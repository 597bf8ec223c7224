//! Job model: the persisted unit of work and its state machine.
//!
//! A [`Job`] is created from a [`JobSpec`] at submission time and is owned by
//! the queue from then on. Every status change goes through
//! [`Job::transition`], which rejects illegal moves and keeps the audit
//! timestamps consistent with the status.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use uuid::Uuid;

/// Opaque job identifier, a UUID v4 rendered as a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generate a fresh identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a worker.
    Pending,
    /// Held by a worker and executing.
    Processing,
    /// Held by a worker, parked at a stage boundary.
    Paused,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Cancelled by a caller.
    Cancelled,
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "paused" => Ok(JobStatus::Paused),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Paused,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Completed, failed and cancelled jobs never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether moving from `self` to `next` is a legal lifecycle step.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Pending, Processing) | (Pending, Cancelled) => true,
            (Processing, Paused)
            | (Processing, Completed)
            | (Processing, Failed)
            | (Processing, Cancelled) => true,
            (Paused, Processing) | (Paused, Cancelled) => true,
            _ => false,
        }
    }
}

/// Target frame size requested by a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// Optional processing feature that not every engine implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    Upscale,
    FaceRestore,
    AudioUpsample,
}

impl Feature {
    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::Upscale => "upscale",
            Feature::FaceRestore => "face_restore",
            Feature::AudioUpsample => "audio_upsample",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "upscale" => Some(Feature::Upscale),
            "face_restore" => Some(Feature::FaceRestore),
            "audio_upsample" => Some(Feature::AudioUpsample),
            _ => None,
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-feature processing options. Every AI sub-feature toggles independently.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    #[serde(default)]
    pub resolution: Option<Resolution>,
    /// Encoder override (e.g. "libx265"); the preset's encoder otherwise.
    #[serde(default)]
    pub encoder: Option<String>,
    /// AI upscaling factor (2-4).
    #[serde(default)]
    pub upscale: Option<u32>,
    #[serde(default)]
    pub face_restore: bool,
    #[serde(default)]
    pub audio_upsample: bool,
    #[serde(default)]
    pub strip_audio: bool,
}

impl JobOptions {
    /// Optional features this job needs from whichever engine runs it.
    pub fn requested_features(&self) -> Vec<Feature> {
        let mut features = Vec::new();
        if self.upscale.is_some() {
            features.push(Feature::Upscale);
        }
        if self.face_restore {
            features.push(Feature::FaceRestore);
        }
        if self.audio_upsample {
            features.push(Feature::AudioUpsample);
        }
        features
    }
}

/// Immutable description of what a job should do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub preset: String,
    #[serde(default)]
    pub engine_preference: Option<String>,
    #[serde(default)]
    pub options: JobOptions,
}

/// Reasons a spec is rejected. All of them are fatal: retrying cannot help.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpecError {
    #[error("source must not be empty")]
    EmptySource,

    #[error("destination must not be empty")]
    EmptyDestination,

    #[error("source and destination are the same file: {0}")]
    SameSourceAndDestination(String),

    #[error("unknown preset '{0}'")]
    UnknownPreset(String),

    #[error("engine '{0}' is disallowed")]
    DisallowedEngine(String),

    #[error("unknown engine '{0}'")]
    UnknownEngine(String),

    #[error("conflicting options: {0}")]
    ConflictingOptions(String),

    #[error("invalid option: {0}")]
    InvalidOption(String),
}

/// What a spec is validated against: the names the running daemon knows.
#[derive(Debug, Clone, Default)]
pub struct SpecPolicy {
    pub presets: HashSet<String>,
    /// Registered engine names. Empty means the engine set is not known yet
    /// and any non-disallowed preference is accepted.
    pub known_engines: HashSet<String>,
    pub disallowed_engines: HashSet<String>,
}

impl SpecPolicy {
    pub fn new<P, K, D>(presets: P, known_engines: K, disallowed_engines: D) -> Self
    where
        P: IntoIterator<Item = String>,
        K: IntoIterator<Item = String>,
        D: IntoIterator<Item = String>,
    {
        Self {
            presets: presets.into_iter().collect(),
            known_engines: known_engines.into_iter().collect(),
            disallowed_engines: disallowed_engines.into_iter().collect(),
        }
    }

    pub fn is_disallowed(&self, engine: &str) -> bool {
        self.disallowed_engines.contains(engine)
    }
}

impl JobSpec {
    /// Build a spec with default options.
    pub fn new(
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        preset: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            preset: preset.into(),
            engine_preference: None,
            options: JobOptions::default(),
        }
    }

    pub fn with_engine_preference(mut self, engine: impl Into<String>) -> Self {
        self.engine_preference = Some(engine.into());
        self
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }

    /// Statically check the spec against the daemon's known names.
    pub fn validate(&self, policy: &SpecPolicy) -> Result<(), SpecError> {
        if self.source.as_os_str().is_empty() {
            return Err(SpecError::EmptySource);
        }
        if self.destination.as_os_str().is_empty() {
            return Err(SpecError::EmptyDestination);
        }
        if self.source == self.destination {
            return Err(SpecError::SameSourceAndDestination(
                self.source.display().to_string(),
            ));
        }
        if !policy.presets.contains(&self.preset) {
            return Err(SpecError::UnknownPreset(self.preset.clone()));
        }

        if let Some(engine) = &self.engine_preference {
            if policy.is_disallowed(engine) {
                return Err(SpecError::DisallowedEngine(engine.clone()));
            }
            if !policy.known_engines.is_empty() && !policy.known_engines.contains(engine) {
                return Err(SpecError::UnknownEngine(engine.clone()));
            }
        }

        let options = &self.options;
        if let Some(res) = options.resolution {
            if res.width == 0 || res.height == 0 {
                return Err(SpecError::InvalidOption(format!(
                    "resolution {}x{} has a zero dimension",
                    res.width, res.height
                )));
            }
        }
        if let Some(scale) = options.upscale {
            if !(2..=4).contains(&scale) {
                return Err(SpecError::InvalidOption(format!(
                    "upscale factor must be 2-4, got {}",
                    scale
                )));
            }
            if options.resolution.is_some() {
                return Err(SpecError::ConflictingOptions(
                    "upscale and an explicit resolution cannot both be set".to_string(),
                ));
            }
        }
        if options.audio_upsample && options.strip_audio {
            return Err(SpecError::ConflictingOptions(
                "audio_upsample requires audio but strip_audio is set".to_string(),
            ));
        }
        if matches!(&options.encoder, Some(e) if e.trim().is_empty()) {
            return Err(SpecError::InvalidOption("encoder must not be blank".to_string()));
        }

        Ok(())
    }
}

/// Classification of a job's final failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The spec itself is unusable.
    InvalidSpec,
    /// An engine declared the failure fatal (e.g. corrupt input).
    Fatal,
    /// Every candidate engine failed.
    Exhausted,
}

/// One failed engine attempt, kept for diagnosis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineAttempt {
    pub engine: String,
    pub stage: Option<String>,
    pub reason: String,
}

/// Structured error detail of a failed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub engine: Option<String>,
    pub stage: Option<String>,
    pub message: String,
    #[serde(default)]
    pub attempts: Vec<EngineAttempt>,
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.engine, &self.stage) {
            (Some(engine), Some(stage)) => {
                write!(f, "{} (engine {}, stage {})", self.message, engine, stage)
            }
            (Some(engine), None) => write!(f, "{} (engine {})", self.message, engine),
            _ => f.write_str(&self.message),
        }
    }
}

/// Rejected lifecycle step.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal transition {from} -> {to}")]
pub struct TransitionError {
    pub from: JobStatus,
    pub to: JobStatus,
}

/// A transcoding job with its full lifecycle state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: JobId,
    /// Submission order, used for FIFO dispatch across restarts.
    pub seq: u64,
    pub spec: JobSpec,
    pub status: JobStatus,
    /// Overall progress 0-100.
    pub progress: f32,
    pub current_stage: Option<String>,
    pub engine_used: Option<String>,
    pub error: Option<JobFailure>,
    /// Unix timestamps in milliseconds.
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub updated_at: i64,
    pub retry_count: u32,
}

impl Job {
    /// Create a pending job for a validated spec.
    pub fn new(seq: u64, spec: JobSpec) -> Self {
        let now = current_timestamp_ms();
        Self {
            id: JobId::generate(),
            seq,
            spec,
            status: JobStatus::Pending,
            progress: 0.0,
            current_stage: None,
            engine_used: None,
            error: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
            retry_count: 0,
        }
    }

    /// Update the job's updated_at timestamp to now.
    pub fn touch(&mut self) {
        self.updated_at = current_timestamp_ms();
    }

    /// Move to `next`, maintaining the audit timestamps.
    pub fn transition(&mut self, next: JobStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                from: self.status,
                to: next,
            });
        }

        let now = current_timestamp_ms();
        if next == JobStatus::Processing && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Raise progress; lower values are ignored.
    pub fn advance_progress(&mut self, percent: f32) {
        let clamped = percent.clamp(0.0, 100.0);
        if clamped > self.progress {
            self.progress = clamped;
        }
        self.touch();
    }

    /// Mark the job as failed with structured detail.
    pub fn fail(&mut self, failure: JobFailure) -> Result<(), TransitionError> {
        self.transition(JobStatus::Failed)?;
        self.error = Some(failure);
        Ok(())
    }

    /// Return an interrupted job to the queue after a crash or restart.
    ///
    /// Returns true when the job was reset.
    pub fn reset_for_recovery(&mut self) -> bool {
        if !matches!(self.status, JobStatus::Processing | JobStatus::Paused) {
            return false;
        }
        self.status = JobStatus::Pending;
        self.progress = 0.0;
        self.current_stage = None;
        self.engine_used = None;
        self.started_at = None;
        self.touch();
        true
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Get current timestamp in milliseconds since Unix epoch.
pub(crate) fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
