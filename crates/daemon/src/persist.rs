//! Durable job table.
//!
//! The whole table lives in one JSON document keyed by job id. Writes go to a
//! sibling temp file that is synced and then renamed over the target, so a
//! crash mid-write leaves the previous document intact.

use crate::job::{Job, JobId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Format version written into every state document.
pub const STATE_VERSION: u32 = 1;

/// Errors that can occur while saving or loading the job table.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("state file I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("state file {path} is not valid JSON: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode job table: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("unsupported state version {0}")]
    UnsupportedVersion(u32),
}

#[derive(Debug, Serialize, Deserialize)]
struct StateDocument {
    version: u32,
    jobs: BTreeMap<JobId, Job>,
}

/// Jobs read back from disk.
#[derive(Debug, Default)]
pub struct LoadedJobs {
    /// Ordered by submission sequence.
    pub jobs: Vec<Job>,
    /// How many interrupted jobs were reset to pending.
    pub recovered: usize,
}

/// Temp file used for the atomic write of `path`.
pub fn temp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

/// Write the job table to `path` atomically.
///
/// # Arguments
/// * `path` - Target state document, e.g. `mediaq-state/jobs.json`
/// * `jobs` - Every job the queue currently owns
pub fn save_jobs<'a>(
    path: &Path,
    jobs: impl IntoIterator<Item = &'a Job>,
) -> Result<(), PersistError> {
    let io_err = |source: std::io::Error| PersistError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
    }

    let document = StateDocument {
        version: STATE_VERSION,
        jobs: jobs
            .into_iter()
            .map(|job| (job.id.clone(), job.clone()))
            .collect(),
    };
    let json = serde_json::to_vec_pretty(&document)?;

    let tmp = temp_path(path);
    {
        let mut file = fs::File::create(&tmp).map_err(io_err)?;
        file.write_all(&json).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
    }
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(io_err(e));
    }

    debug!(path = %path.display(), jobs = document.jobs.len(), "Job table persisted");
    Ok(())
}

/// Load the job table from `path`, resetting interrupted jobs.
///
/// A missing file is an empty table. Jobs that were `processing` or `paused`
/// when the document was written come back as `pending`.
pub fn load_jobs(path: &Path) -> Result<LoadedJobs, PersistError> {
    let content = match fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LoadedJobs::default()),
        Err(source) => {
            return Err(PersistError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let document: StateDocument =
        serde_json::from_slice(&content).map_err(|source| PersistError::Decode {
            path: path.to_path_buf(),
            source,
        })?;
    if document.version != STATE_VERSION {
        return Err(PersistError::UnsupportedVersion(document.version));
    }

    let mut recovered = 0;
    let mut jobs: Vec<Job> = document
        .jobs
        .into_values()
        .map(|mut job| {
            if job.reset_for_recovery() {
                info!(job_id = %job.id, "Recovered interrupted job");
                recovered += 1;
            }
            job
        })
        .collect();
    jobs.sort_by_key(|job| job.seq);

    Ok(LoadedJobs { jobs, recovered })
}
