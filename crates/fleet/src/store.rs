//! Job record store.
//!
//! [`JobStore`] is the contract the core consumes from the persistence layer.
//! The only concurrency-control point for dispatch lives here: [`JobStore::claim`]
//! is a compare-and-set from `queued` to `claimed`, so two schedulers racing
//! for the same job cannot both win.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::{Job, JobProgress, JobStatus, ResourceUsage};

/// Errors raised by a job store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Job {0} already exists")]
    Duplicate(Uuid),

    #[error("Illegal transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Persistence error: {0}")]
    Persistence(String),
}

/// Final outcome written by the executor (or the sweeper).
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed { result: Option<String> },
    Failed { error: String },
}

impl JobOutcome {
    fn status(&self) -> JobStatus {
        match self {
            Self::Completed { .. } => JobStatus::Completed,
            Self::Failed { .. } => JobStatus::Failed,
        }
    }
}

/// Persistence contract for job records.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Add a new job.
    async fn insert(&self, job: Job) -> Result<(), StoreError>;

    /// Fetch a job by ID.
    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError>;

    /// All jobs, oldest first.
    async fn list(&self) -> Result<Vec<Job>, StoreError>;

    /// Queued jobs in dispatch order: priority descending, then oldest first.
    async fn queued(&self) -> Result<Vec<Job>, StoreError>;

    /// Atomically move a job from `queued` to `claimed` and bind it to
    /// `instance_id`. Returns `None` when the job is no longer queued.
    async fn claim(&self, id: Uuid, instance_id: &str) -> Result<Option<Job>, StoreError>;

    /// Move a claimed job to `running`.
    async fn mark_running(&self, id: Uuid) -> Result<Job, StoreError>;

    /// Record progress counters of a running job.
    async fn record_progress(&self, id: Uuid, progress: JobProgress) -> Result<(), StoreError>;

    /// Move a job to its terminal state with usage attached.
    async fn finish(
        &self,
        id: Uuid,
        outcome: JobOutcome,
        usage: Option<ResourceUsage>,
    ) -> Result<Job, StoreError>;

    /// Every job (any status) ever bound to `instance_id`.
    async fn jobs_for_instance(&self, instance_id: &str) -> Result<Vec<Job>, StoreError>;
}

/// In-memory job store, optionally mirrored to a JSON file.
///
/// With a file attached, every operation re-reads the file before acting and
/// writes it back after a mutation, so an operator CLI and a daemon on the
/// same host observe each other's jobs. It is not a multi-host database.
#[derive(Debug, Default)]
pub struct LocalJobStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
    path: Option<PathBuf>,
}

impl LocalJobStore {
    /// Purely in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store mirrored to `path`, loading existing records if present.
    ///
    /// # Errors
    /// Returns an error if an existing file cannot be read or parsed.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let jobs = load_file(&path).await?;
        info!(path = %path.display(), jobs = jobs.len(), "Opened job store");
        Ok(Self {
            jobs: RwLock::new(jobs),
            path: Some(path),
        })
    }

    async fn refresh(&self, jobs: &mut HashMap<Uuid, Job>) -> Result<(), StoreError> {
        if let Some(path) = &self.path {
            *jobs = load_file(path).await?;
        }
        Ok(())
    }

    async fn persist(&self, jobs: &HashMap<Uuid, Job>) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let mut records: Vec<&Job> = jobs.values().collect();
        records.sort_by_key(|j| j.created_at);
        let content = serde_json::to_string_pretty(&records)
            .map_err(|e| StoreError::Persistence(e.to_string()))?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Persistence(e.to_string()))?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| StoreError::Persistence(e.to_string()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| StoreError::Persistence(e.to_string()))?;
        Ok(())
    }

    /// Apply `f` under the write lock and persist on success.
    async fn mutate<T>(
        &self,
        f: impl FnOnce(&mut HashMap<Uuid, Job>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut jobs = self.jobs.write().await;
        self.refresh(&mut jobs).await?;
        let value = f(&mut jobs)?;
        self.persist(&jobs).await?;
        Ok(value)
    }

    /// Run `f` against a fresh view of the jobs.
    async fn read<T>(&self, f: impl FnOnce(&HashMap<Uuid, Job>) -> T) -> Result<T, StoreError> {
        if self.path.is_some() {
            let mut jobs = self.jobs.write().await;
            self.refresh(&mut jobs).await?;
            return Ok(f(&jobs));
        }
        let jobs = self.jobs.read().await;
        Ok(f(&jobs))
    }
}

async fn load_file(path: &Path) -> Result<HashMap<Uuid, Job>, StoreError> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => return Err(StoreError::Persistence(e.to_string())),
    };
    if content.trim().is_empty() {
        return Ok(HashMap::new());
    }
    let records: Vec<Job> =
        serde_json::from_str(&content).map_err(|e| StoreError::Persistence(e.to_string()))?;
    Ok(records.into_iter().map(|j| (j.id, j)).collect())
}

fn transition(job: &mut Job, to: JobStatus) -> Result<(), StoreError> {
    if !job.status.can_transition_to(to) {
        return Err(StoreError::InvalidTransition {
            job_id: job.id,
            from: job.status,
            to,
        });
    }
    job.status = to;
    job.updated_at = Utc::now();
    Ok(())
}

#[async_trait]
impl JobStore for LocalJobStore {
    async fn insert(&self, job: Job) -> Result<(), StoreError> {
        self.mutate(|jobs| {
            if jobs.contains_key(&job.id) {
                return Err(StoreError::Duplicate(job.id));
            }
            debug!(job_id = %job.id, request_type = %job.request_type, "Job inserted");
            jobs.insert(job.id, job);
            Ok(())
        })
        .await
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        self.read(|jobs| jobs.get(&id).cloned()).await
    }

    async fn list(&self) -> Result<Vec<Job>, StoreError> {
        self.read(|jobs| {
            let mut all: Vec<Job> = jobs.values().cloned().collect();
            all.sort_by_key(|j| j.created_at);
            all
        })
        .await
    }

    async fn queued(&self) -> Result<Vec<Job>, StoreError> {
        self.read(|jobs| {
            let mut queued: Vec<Job> = jobs
                .values()
                .filter(|j| j.status == JobStatus::Queued)
                .cloned()
                .collect();
            queued.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.created_at.cmp(&b.created_at))
            });
            queued
        })
        .await
    }

    async fn claim(&self, id: Uuid, instance_id: &str) -> Result<Option<Job>, StoreError> {
        self.mutate(|jobs| {
            let job = jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
            if job.status != JobStatus::Queued {
                debug!(job_id = %id, status = %job.status, "Claim lost");
                return Ok(None);
            }
            transition(job, JobStatus::Claimed)?;
            job.assigned_instance_id = Some(instance_id.to_string());
            job.claimed_at = Some(job.updated_at);
            info!(job_id = %id, instance_id, "Job claimed");
            Ok(Some(job.clone()))
        })
        .await
    }

    async fn mark_running(&self, id: Uuid) -> Result<Job, StoreError> {
        self.mutate(|jobs| {
            let job = jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
            transition(job, JobStatus::Running)?;
            job.started_at = Some(job.updated_at);
            Ok(job.clone())
        })
        .await
    }

    async fn record_progress(&self, id: Uuid, progress: JobProgress) -> Result<(), StoreError> {
        self.mutate(|jobs| {
            let job = jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
            if job.status.is_terminal() {
                return Ok(());
            }
            job.progress = Some(progress);
            job.updated_at = Utc::now();
            Ok(())
        })
        .await
    }

    async fn finish(
        &self,
        id: Uuid,
        outcome: JobOutcome,
        usage: Option<ResourceUsage>,
    ) -> Result<Job, StoreError> {
        self.mutate(|jobs| {
            let job = jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
            transition(job, outcome.status())?;
            job.completed_at = Some(job.updated_at);
            if usage.is_some() {
                job.resource_usage = usage;
            }
            match outcome {
                JobOutcome::Completed { result } => job.result = result,
                JobOutcome::Failed { error } => job.error = Some(error),
            }
            info!(job_id = %id, status = %job.status, "Job finished");
            Ok(job.clone())
        })
        .await
    }

    async fn jobs_for_instance(&self, instance_id: &str) -> Result<Vec<Job>, StoreError> {
        self.read(|jobs| {
            jobs.values()
                .filter(|j| j.assigned_instance_id.as_deref() == Some(instance_id))
                .cloned()
                .collect()
        })
        .await
    }
}
