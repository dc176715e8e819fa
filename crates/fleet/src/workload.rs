//! Workload catalog: what a request type runs and on what hardware.

use std::collections::HashMap;
use std::time::Duration;

use gpu::OfferQuery;
use serde::{Deserialize, Serialize};

use crate::error::FleetError;
use crate::models::JobProgress;

/// Broad class of a workload; decides how inputs are staged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadKind {
    /// Dataset is packed, uploaded and verified before launch.
    Training,
    /// Only the job payload is staged.
    Inference,
}

/// How the executor learns that a detached workload has finished.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CompletionSignal {
    /// The workload writes a status document to this path (relative to its
    /// work directory).
    StatusFile { path: String },
    /// The workload serves a status document at this URL, fetched from the
    /// instance itself.
    HttpEndpoint { url: String },
    /// The workload is done when its process exits; exit code 0 is success.
    #[default]
    ProcessExit,
}

/// Hardware and image for one workload type (one warm pool).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSpec {
    #[serde(default)]
    pub offer: OfferQuery,
    pub image: String,
    #[serde(default = "default_disk_gb")]
    pub disk_gb: u32,
}

fn default_disk_gb() -> u32 {
    40
}

/// What a request type runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadProfile {
    /// Pool key; must name an entry in the instance type table.
    pub workload_type: String,
    pub kind: WorkloadKind,
    /// Shell command launched in the work directory.
    pub command: String,
    #[serde(default)]
    pub completion: CompletionSignal,
    /// Directory (relative to the work directory) downloaded after success.
    #[serde(default)]
    pub output_dir: Option<String>,
    /// File (relative to the work directory) holding progress counters.
    #[serde(default)]
    pub progress_file: Option<String>,
    /// Ceiling on wall-clock runtime before the job is abandoned.
    #[serde(
        default = "default_max_runtime",
        with = "crate::config::duration_secs"
    )]
    pub max_runtime: Duration,
}

fn default_max_runtime() -> Duration {
    Duration::from_secs(6 * 3600)
}

/// Request-type and instance-type tables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkloadCatalog {
    /// Keyed by workload type.
    #[serde(default)]
    pub instance_types: HashMap<String, InstanceSpec>,
    /// Keyed by request type.
    #[serde(default)]
    pub requests: HashMap<String, WorkloadProfile>,
}

impl WorkloadCatalog {
    #[must_use]
    pub fn with_instance_type(mut self, workload_type: impl Into<String>, spec: InstanceSpec) -> Self {
        self.instance_types.insert(workload_type.into(), spec);
        self
    }

    #[must_use]
    pub fn with_request(mut self, request_type: impl Into<String>, profile: WorkloadProfile) -> Self {
        self.requests.insert(request_type.into(), profile);
        self
    }

    /// Profile for a request type.
    ///
    /// # Errors
    /// Returns [`FleetError::UnknownRequestType`] for unmapped request types.
    pub fn profile(&self, request_type: &str) -> Result<&WorkloadProfile, FleetError> {
        self.requests
            .get(request_type)
            .ok_or_else(|| FleetError::UnknownRequestType(request_type.to_string()))
    }

    /// Instance spec for a workload type.
    ///
    /// # Errors
    /// Returns [`FleetError::Config`] when no instance type is defined.
    pub fn instance_spec(&self, workload_type: &str) -> Result<&InstanceSpec, FleetError> {
        self.instance_types.get(workload_type).ok_or_else(|| {
            FleetError::Config(format!("no instance type defined for workload `{workload_type}`"))
        })
    }

    /// Check that every request type points at a defined instance type.
    ///
    /// # Errors
    /// Returns [`FleetError::Config`] naming the first dangling reference.
    pub fn validate(&self) -> Result<(), FleetError> {
        for (request_type, profile) in &self.requests {
            if !self.instance_types.contains_key(&profile.workload_type) {
                return Err(FleetError::Config(format!(
                    "request type `{request_type}` references unknown workload `{}`",
                    profile.workload_type
                )));
            }
            if profile.command.trim().is_empty() {
                return Err(FleetError::Config(format!(
                    "request type `{request_type}` has an empty command"
                )));
            }
        }
        Ok(())
    }
}

/// Workload state as reported through a completion signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportedState {
    Running,
    Completed,
    Failed(String),
}

/// A parsed status document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub state: ReportedState,
    pub progress: Option<JobProgress>,
}

#[derive(Deserialize)]
struct StatusDocument {
    #[serde(alias = "status")]
    state: String,
    #[serde(default, alias = "error")]
    message: Option<String>,
    #[serde(default)]
    progress: Option<JobProgress>,
}

impl StatusReport {
    /// Parse a status document.
    ///
    /// Accepts JSON (`{"state": "completed", "message": ..., "progress": ...}`)
    /// or a bare word on the first line. Empty input means the workload has
    /// not reported yet and is treated as running.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if let Ok(doc) = serde_json::from_str::<StatusDocument>(trimmed) {
            return Self {
                state: parse_state(&doc.state, doc.message),
                progress: doc.progress,
            };
        }

        let first_line = trimmed.lines().next().unwrap_or_default();
        let (word, rest) = first_line
            .split_once(':')
            .map_or((first_line, None), |(w, r)| (w, Some(r.trim().to_string())));
        Self {
            state: parse_state(word, rest.filter(|r| !r.is_empty())),
            progress: None,
        }
    }
}

fn parse_state(word: &str, message: Option<String>) -> ReportedState {
    match word.trim().to_ascii_lowercase().as_str() {
        "completed" | "complete" | "done" | "success" | "succeeded" => ReportedState::Completed,
        "failed" | "error" | "failure" => ReportedState::Failed(
            message.unwrap_or_else(|| "workload reported failure".to_string()),
        ),
        _ => ReportedState::Running,
    }
}
