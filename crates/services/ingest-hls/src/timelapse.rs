//! Single-flight gate for the accelerated (timelapse) rendition
//!
//! At most one job runs per session key. Concurrent requests observe the
//! running job instead of starting another, and a fresh cached manifest is
//! served without recomputation.
//!
//! # Freshness
//!
//! The cached `timelapse.m3u8` is fresh when it exists and its modification
//! time is not older than the ingest file's. A job that records its result
//! while a request is checking freshness sends that request back to check
//! again, so a just-published manifest is never rebuilt.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::oneshot;

use crate::encoder::{run_to_completion, EncoderError, ProcessSpec};
use crate::key::SessionKey;
use crate::layout::SessionLayout;
use crate::metrics::global_metrics;
use crate::transcoder::Transcoder;

/// Result of a timelapse request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimelapseOutcome {
    /// Manifest is published at the given path
    Ready(PathBuf),
    /// A job for this key is running
    InProgress,
    /// No ingest file to derive from
    SourceMissing,
    /// The job failed; the next request starts a new one
    Failed(String),
}

/// Job state reported by the status API
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus {
    Idle,
    Running,
    Done,
    Failed { reason: String },
}

#[derive(Debug, Clone)]
enum JobRecord {
    Running,
    Done,
    /// Failure nobody has been told about yet
    Failed(String),
}

#[derive(Debug, Default)]
struct JobBook {
    records: HashMap<SessionKey, JobRecord>,
    /// Bumped every time a job records its result
    completed: u64,
}

impl JobBook {
    /// Answer owed to a request without touching the filesystem, if any
    ///
    /// A pending failure is handed out once and cleared.
    fn settled(&mut self, key: &SessionKey) -> Option<TimelapseOutcome> {
        match self.records.get(key) {
            Some(JobRecord::Running) => Some(TimelapseOutcome::InProgress),
            Some(JobRecord::Failed(_)) => match self.records.remove(key) {
                Some(JobRecord::Failed(reason)) => Some(TimelapseOutcome::Failed(reason)),
                _ => None,
            },
            Some(JobRecord::Done) | None => None,
        }
    }
}

type JobTable = Arc<Mutex<JobBook>>;

/// What a request does after checking freshness
enum Claim {
    Answer(TimelapseOutcome),
    /// A job finished since the freshness check; check again
    Stale,
    Start(oneshot::Receiver<TimelapseOutcome>),
}

/// Timelapse job gate
pub struct TimelapseGate {
    jobs: JobTable,
    transcoder: Arc<dyn Transcoder>,
    initiator_wait: Duration,
}

impl TimelapseGate {
    /// `initiator_wait` bounds how long the request that starts a job waits
    /// for it before answering `InProgress`
    pub fn new(transcoder: Arc<dyn Transcoder>, initiator_wait: Duration) -> Self {
        Self {
            jobs: Arc::new(Mutex::new(JobBook::default())),
            transcoder,
            initiator_wait,
        }
    }

    /// Serve, start, or report the timelapse for a session
    pub async fn request(&self, layout: &SessionLayout) -> TimelapseOutcome {
        let key = layout.key().clone();

        let done_rx = loop {
            let seen = match self.observe(&key) {
                Ok(seen) => seen,
                Err(outcome) => return outcome,
            };

            let Some(source_mtime) = modified(&layout.ingest_path()).await else {
                return TimelapseOutcome::SourceMissing;
            };
            let fresh = matches!(
                modified(&layout.timelapse_playlist()).await,
                Some(t) if t >= source_mtime
            );

            match self.claim(layout, fresh, seen) {
                Claim::Answer(outcome) => return outcome,
                Claim::Stale => {
                    tracing::debug!(session_key = %key, "Timelapse finished during freshness check, rechecking");
                }
                Claim::Start(rx) => break rx,
            }
        };

        match tokio::time::timeout(self.initiator_wait, done_rx).await {
            Ok(Ok(TimelapseOutcome::Failed(reason))) => {
                // Reported here, so nobody else needs to see it
                let mut book = self.jobs.lock();
                if matches!(book.records.get(&key), Some(JobRecord::Failed(_))) {
                    book.records.remove(&key);
                }
                TimelapseOutcome::Failed(reason)
            }
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => TimelapseOutcome::Failed("timelapse job aborted".to_string()),
            Err(_) => TimelapseOutcome::InProgress,
        }
    }

    /// Current job state for `key`
    pub fn status(&self, key: &SessionKey) -> JobStatus {
        match self.jobs.lock().records.get(key) {
            None => JobStatus::Idle,
            Some(JobRecord::Running) => JobStatus::Running,
            Some(JobRecord::Done) => JobStatus::Done,
            Some(JobRecord::Failed(reason)) => JobStatus::Failed {
                reason: reason.clone(),
            },
        }
    }

    /// Settled answer for `key`, or the completion count to validate a
    /// freshness check against
    fn observe(&self, key: &SessionKey) -> Result<u64, TimelapseOutcome> {
        let mut book = self.jobs.lock();
        match book.settled(key) {
            Some(outcome) => Err(outcome),
            None => Ok(book.completed),
        }
    }

    /// Decide on a freshness check taken after `observe` returned `seen`
    fn claim(&self, layout: &SessionLayout, fresh: bool, seen: u64) -> Claim {
        let key = layout.key();
        let mut book = self.jobs.lock();

        if let Some(outcome) = book.settled(key) {
            return Claim::Answer(outcome);
        }
        if book.completed != seen {
            return Claim::Stale;
        }

        if fresh {
            global_metrics().timelapse_cache_hit();
            tracing::debug!(session_key = %key, "Serving cached timelapse");
            return Claim::Answer(TimelapseOutcome::Ready(layout.timelapse_playlist()));
        }

        book.records.insert(key.clone(), JobRecord::Running);
        Claim::Start(self.spawn_job(layout.clone()))
    }

    fn spawn_job(&self, layout: SessionLayout) -> oneshot::Receiver<TimelapseOutcome> {
        let (tx, rx) = oneshot::channel();
        let spec = self.transcoder.timelapse(&layout);
        let jobs = self.jobs.clone();

        global_metrics().timelapse_started();
        tracing::info!(session_key = %layout.key(), command = %spec.command_line(), "Starting timelapse job");

        tokio::spawn(async move {
            let mut guard = RunningGuard::new(jobs, layout.key().clone());

            let outcome = match run_job(&layout, &spec).await {
                Ok(path) => {
                    global_metrics().timelapse_completed();
                    tracing::info!(session_key = %layout.key(), "Timelapse ready");
                    TimelapseOutcome::Ready(path)
                }
                Err(e) => {
                    global_metrics().timelapse_failed();
                    tracing::error!(session_key = %layout.key(), error = %e, "Timelapse job failed");
                    TimelapseOutcome::Failed(e.to_string())
                }
            };
            guard.finish(&outcome);

            // Initiator may have stopped waiting; the record then carries the result
            let _ = tx.send(outcome);
        });

        rx
    }
}

/// Clears the `Running` marker if the job ends without recording a result
struct RunningGuard {
    jobs: JobTable,
    key: SessionKey,
    armed: bool,
}

impl RunningGuard {
    fn new(jobs: JobTable, key: SessionKey) -> Self {
        Self {
            jobs,
            key,
            armed: true,
        }
    }

    fn finish(&mut self, outcome: &TimelapseOutcome) {
        let record = match outcome {
            TimelapseOutcome::Failed(reason) => JobRecord::Failed(reason.clone()),
            _ => JobRecord::Done,
        };
        let mut book = self.jobs.lock();
        book.records.insert(self.key.clone(), record);
        book.completed += 1;
        self.armed = false;
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        if self.armed {
            let mut book = self.jobs.lock();
            if matches!(book.records.get(&self.key), Some(JobRecord::Running)) {
                book.records.remove(&self.key);
            }
        }
    }
}

/// Run the encoder into the staging manifest and publish it by rename
async fn run_job(layout: &SessionLayout, spec: &ProcessSpec) -> Result<PathBuf, TimelapseError> {
    let staging = layout.timelapse_staging_playlist();
    remove_if_exists(&staging).await?;

    let result = render_and_publish(layout, spec, &staging).await;
    if result.is_err() {
        let _ = remove_if_exists(&staging).await;
    }
    result
}

async fn render_and_publish(
    layout: &SessionLayout,
    spec: &ProcessSpec,
    staging: &Path,
) -> Result<PathBuf, TimelapseError> {
    run_to_completion(spec, &format!("timelapse:{}", layout.key())).await?;

    if !tokio::fs::try_exists(staging).await? {
        return Err(TimelapseError::MissingOutput(staging.to_path_buf()));
    }

    let output = layout.timelapse_playlist();
    tokio::fs::rename(staging, &output).await?;
    Ok(output)
}

async fn modified(path: &Path) -> Option<SystemTime> {
    let metadata = tokio::fs::metadata(path).await.ok()?;
    if !metadata.is_file() {
        return None;
    }
    metadata.modified().ok()
}

async fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Timelapse job errors
#[derive(Debug, thiserror::Error)]
pub enum TimelapseError {
    #[error("Encoder failed: {0}")]
    Encoder(#[from] EncoderError),

    #[error("Encoder produced no manifest at {0}")]
    MissingOutput(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
