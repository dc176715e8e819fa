//! Job and instance records.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a job. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for an instance.
    Queued,
    /// Bound to an instance, inputs not yet running.
    Claimed,
    /// Workload launched on the instance.
    Running,
    /// Workload reported success.
    Completed,
    /// Any step failed, or the job was reaped.
    Failed,
}

impl JobStatus {
    /// Whether the job has reached a final state.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether the job currently holds an instance.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Claimed | Self::Running)
    }

    /// Whether `next` is a legal forward transition from `self`.
    #[must_use]
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Claimed | Self::Failed)
                | (Self::Claimed, Self::Running | Self::Failed)
                | (Self::Running, Self::Completed | Self::Failed)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Claimed => write!(f, "claimed"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Progress counters reported by a running workload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    /// Units of work done (steps, batches, requests).
    pub current: u64,
    /// Total units, when the workload knows it.
    pub total: Option<u64>,
}

/// Billable resource usage of one job.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Whole seconds the instance was held by the job.
    pub gpu_seconds: u64,
    /// Hourly rate the instance was rented at.
    pub hourly_rate: f64,
    /// `gpu_seconds / 3600 * hourly_rate`, rounded to micro-dollars.
    pub cost_usd: f64,
}

/// A unit of work submitted to the fleet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    /// Selects the workload profile (and therefore the instance type).
    pub request_type: String,
    pub status: JobStatus,
    /// Higher runs first; ties broken by age.
    #[serde(default)]
    pub priority: i32,
    /// Local dataset directory staged for training jobs.
    #[serde(default)]
    pub inputs: Option<PathBuf>,
    /// Opaque arguments forwarded to the workload as `job.json`.
    #[serde(default)]
    pub payload: serde_json::Value,
    pub assigned_instance_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub progress: Option<JobProgress>,
    #[serde(default)]
    pub resource_usage: Option<ResourceUsage>,
    /// Reference to retrieved outputs.
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Job {
    pub fn new(request_type: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            request_type: request_type.into(),
            status: JobStatus::Queued,
            priority: 0,
            inputs: None,
            payload: serde_json::Value::Null,
            assigned_instance_id: None,
            created_at: now,
            updated_at: now,
            claimed_at: None,
            started_at: None,
            completed_at: None,
            progress: None,
            resource_usage: None,
            result: None,
            error: None,
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_inputs(mut self, dir: impl Into<PathBuf>) -> Self {
        self.inputs = Some(dir.into());
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Moment the instance was handed to this job, if it was.
    #[must_use]
    pub fn custody_started_at(&self) -> Option<DateTime<Utc>> {
        self.claimed_at.or(self.started_at)
    }
}

/// Fleet-side status of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Rented, not yet reachable over SSH.
    Provisioning,
    /// Reachable and idle.
    Ready,
    /// Running exactly one job.
    Busy,
    /// Being terminated.
    Draining,
    /// Gone.
    Terminated,
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Provisioning => write!(f, "provisioning"),
            Self::Ready => write!(f, "ready"),
            Self::Busy => write!(f, "busy"),
            Self::Draining => write!(f, "draining"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// Where to reach an instance over SSH.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshEndpoint {
    pub host: String,
    pub port: u16,
    pub user: String,
}

impl SshEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            user: "root".to_string(),
        }
    }
}

impl std::fmt::Display for SshEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

/// A rented instance as tracked by the fleet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    /// Provider-assigned ID.
    pub id: String,
    pub workload_type: String,
    pub status: InstanceStatus,
    pub ssh: Option<SshEndpoint>,
    pub hourly_rate: f64,
    /// Provider-side label used to correlate the instance after a crash.
    pub label: String,
    pub gpu_type: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    /// Warm pool owning this instance, if any.
    pub pool: Option<String>,
    /// Job currently holding the instance.
    pub current_job: Option<Uuid>,
}

impl Instance {
    pub fn provisioning(
        id: impl Into<String>,
        workload_type: impl Into<String>,
        label: impl Into<String>,
        hourly_rate: f64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            workload_type: workload_type.into(),
            status: InstanceStatus::Provisioning,
            ssh: None,
            hourly_rate,
            label: label.into(),
            gpu_type: None,
            created_at: now,
            last_activity_at: now,
            pool: None,
            current_job: None,
        }
    }

    /// Refresh the activity timestamp.
    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }
}
