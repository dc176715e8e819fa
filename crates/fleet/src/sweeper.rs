//! Instance sweeper.
//!
//! Cost-safety backstop that runs on its own timer, independent of the
//! dispatcher. It lists every instance the provider can see, cross-references
//! job records (and the local warm pool, when there is one) and terminates
//! whatever nobody accounts for:
//!
//! - orphan: no job record references the instance and no pool owns it
//! - stuck: a job on the instance has been active past the runtime ceiling
//! - stale: no active job, and no activity for longer than the staleness
//!   threshold
//!
//! Active jobs are audited from the store side as well. A job whose instance
//! the provider no longer lists is failed as lost, so a crashed daemon or a
//! terminated instance never leaves a job `running` forever.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use gpu::{InstanceProvider, ProviderInstance};
use serde::{Deserialize, Serialize};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cost::compute_usage;
use crate::error::{FleetError, Result};
use crate::models::{Instance, InstanceStatus, Job};
use crate::pool::WarmPoolManager;
use crate::store::{JobOutcome, JobStore};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    /// Delay between sweeps.
    #[serde(with = "crate::config::duration_secs")]
    pub interval: Duration,
    /// Active jobs older than this are stuck.
    #[serde(with = "crate::config::duration_secs")]
    pub max_runtime: Duration,
    /// Instances with no active job and no activity for this long are stale.
    #[serde(with = "crate::config::duration_secs")]
    pub staleness_threshold: Duration,
    /// Unreferenced instances younger than this are left alone; they may be
    /// between provisioning and their first claim.
    #[serde(with = "crate::config::duration_secs")]
    pub orphan_grace: Duration,
    /// Only instances whose label starts with this prefix are considered.
    pub label_prefix: Option<String>,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            max_runtime: Duration::from_secs(8 * 3600),
            staleness_threshold: Duration::from_secs(1800),
            orphan_grace: Duration::from_secs(900),
            label_prefix: None,
        }
    }
}

/// Whether a sweep acts on its findings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepMode {
    /// Report only.
    DryRun,
    /// Terminate instances and fail stuck jobs.
    Enforce,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepReason {
    Orphan,
    Stuck,
    Stale,
    /// The job's instance no longer exists.
    Lost,
    /// Operator-requested termination of every instance.
    Forced,
}

impl std::fmt::Display for SweepReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Orphan => write!(f, "orphan"),
            Self::Stuck => write!(f, "stuck"),
            Self::Stale => write!(f, "stale"),
            Self::Lost => write!(f, "lost"),
            Self::Forced => write!(f, "forced"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweptInstance {
    pub instance_id: String,
    pub reason: SweepReason,
    /// Jobs failed because of this finding.
    pub job_ids: Vec<Uuid>,
}

/// An active job failed without an instance of ours to terminate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweptJob {
    pub job_id: Uuid,
    pub instance_id: Option<String>,
    pub reason: SweepReason,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub instances_checked: usize,
    /// Instances terminated (or, on a dry run, that would be).
    pub terminated: Vec<SweptInstance>,
    /// Jobs failed (or that would be) whose instance is gone or out of scope.
    pub failed_jobs: Vec<SweptJob>,
    pub errors: Vec<String>,
    pub dry_run: bool,
}

impl SweepReport {
    #[must_use]
    pub fn count(&self, reason: SweepReason) -> usize {
        self.terminated.iter().filter(|t| t.reason == reason).count()
    }

    #[must_use]
    pub fn failed_job_count(&self, reason: SweepReason) -> usize {
        self.failed_jobs.iter().filter(|j| j.reason == reason).count()
    }
}

struct Finding {
    reason: SweepReason,
    stuck_jobs: Vec<Job>,
}

pub struct InstanceSweeper {
    provider: Arc<dyn InstanceProvider>,
    store: Arc<dyn JobStore>,
    pool: Option<Arc<WarmPoolManager>>,
    config: SweeperConfig,
}

impl InstanceSweeper {
    pub fn new(
        provider: Arc<dyn InstanceProvider>,
        store: Arc<dyn JobStore>,
        config: SweeperConfig,
    ) -> Self {
        Self {
            provider,
            store,
            pool: None,
            config,
        }
    }

    /// Treat members of `pool` as accounted for, and retire through it.
    #[must_use]
    pub fn with_pool(mut self, pool: Arc<WarmPoolManager>) -> Self {
        self.pool = Some(pool);
        self
    }

    fn in_scope(&self, instance: &ProviderInstance) -> bool {
        match &self.config.label_prefix {
            Some(prefix) => instance
                .label
                .as_deref()
                .is_some_and(|label| label.starts_with(prefix.as_str())),
            None => true,
        }
    }

    async fn pool_members(&self) -> HashMap<String, Instance> {
        match &self.pool {
            Some(pool) => pool
                .members()
                .await
                .into_iter()
                .map(|i| (i.id.clone(), i))
                .collect(),
            None => HashMap::new(),
        }
    }

    /// One audit pass over every provider-visible instance, then over every
    /// active job.
    ///
    /// # Errors
    /// Returns an error only if the provider's instance list cannot be read;
    /// per-instance failures are collected in the report.
    pub async fn sweep(&self, mode: SweepMode) -> Result<SweepReport> {
        let listed_at = Utc::now();
        let instances = self.provider.list_instances().await?;
        let members = self.pool_members().await;
        let now = Utc::now();
        let mut report = SweepReport {
            dry_run: mode == SweepMode::DryRun,
            ..SweepReport::default()
        };
        let mut handled_jobs = HashSet::new();

        for instance in instances.iter().filter(|i| self.in_scope(i)) {
            report.instances_checked += 1;
            let jobs = match self.store.jobs_for_instance(&instance.id).await {
                Ok(jobs) => jobs,
                Err(e) => {
                    report
                        .errors
                        .push(format!("{}: failed to read job records: {e}", instance.id));
                    continue;
                }
            };

            let Some(finding) = self.classify(instance, &jobs, members.get(&instance.id), now) else {
                debug!(instance_id = %instance.id, jobs = jobs.len(), "Instance accounted for");
                continue;
            };

            info!(
                instance_id = %instance.id,
                reason = %finding.reason,
                dry_run = report.dry_run,
                "Sweeper finding"
            );
            let hourly_rate = members
                .get(&instance.id)
                .map(|m| m.hourly_rate)
                .or(instance.hourly_rate)
                .unwrap_or(0.0);

            handled_jobs.extend(finding.stuck_jobs.iter().map(|j| j.id));
            let mut job_ids = Vec::new();
            if mode == SweepMode::Enforce {
                if let Err(e) = self.terminate(&instance.id, members.contains_key(&instance.id)).await {
                    report.errors.push(format!("{}: {e}", instance.id));
                    continue;
                }
                for job in &finding.stuck_jobs {
                    let error = FleetError::RuntimeExceeded(self.config.max_runtime.as_secs());
                    match self.fail_job(job, &error, hourly_rate, now).await {
                        Ok(()) => job_ids.push(job.id),
                        Err(e) => report.errors.push(format!("{}: job {}: {e}", instance.id, job.id)),
                    }
                }
            } else {
                job_ids.extend(finding.stuck_jobs.iter().map(|j| j.id));
            }

            report.terminated.push(SweptInstance {
                instance_id: instance.id.clone(),
                reason: finding.reason,
                job_ids,
            });
        }

        self.sweep_jobs(&instances, &members, &handled_jobs, listed_at, now, mode, &mut report)
            .await;

        info!(
            checked = report.instances_checked,
            terminated = report.terminated.len(),
            failed_jobs = report.failed_jobs.len(),
            errors = report.errors.len(),
            dry_run = report.dry_run,
            "Sweep complete"
        );
        Ok(report)
    }

    /// Fail active jobs the instance pass could not reach: those whose
    /// instance is gone, and those past the runtime ceiling on an instance
    /// outside the label scope. Jobs claimed after the provider listing was
    /// taken are skipped, since their instance may postdate it.
    #[allow(clippy::too_many_arguments)]
    async fn sweep_jobs(
        &self,
        instances: &[ProviderInstance],
        members: &HashMap<String, Instance>,
        handled: &HashSet<Uuid>,
        listed_at: DateTime<Utc>,
        now: DateTime<Utc>,
        mode: SweepMode,
        report: &mut SweepReport,
    ) {
        let jobs = match self.store.list().await {
            Ok(jobs) => jobs,
            Err(e) => {
                report.errors.push(format!("failed to read job records: {e}"));
                return;
            }
        };
        let listed: HashMap<&str, &ProviderInstance> =
            instances.iter().map(|i| (i.id.as_str(), i)).collect();
        let max_runtime = to_chrono(self.config.max_runtime);

        for job in jobs
            .iter()
            .filter(|j| j.status.is_active() && !handled.contains(&j.id))
        {
            let custody = job.custody_started_at().unwrap_or(job.created_at);
            let instance = job
                .assigned_instance_id
                .as_deref()
                .and_then(|id| listed.get(id).copied());
            let alive = instance.is_some_and(|i| !i.status.is_terminal());

            let (reason, error) = if !alive && custody < listed_at {
                let id = job.assigned_instance_id.clone().unwrap_or_default();
                (SweepReason::Lost, FleetError::InstanceLost(id))
            } else if alive && now - custody > max_runtime {
                (
                    SweepReason::Stuck,
                    FleetError::RuntimeExceeded(self.config.max_runtime.as_secs()),
                )
            } else {
                continue;
            };

            warn!(
                job_id = %job.id,
                instance_id = job.assigned_instance_id.as_deref().unwrap_or("-"),
                reason = %reason,
                dry_run = report.dry_run,
                "Sweeper job finding"
            );
            if mode == SweepMode::Enforce {
                let hourly_rate = instance
                    .and_then(|i| i.hourly_rate)
                    .or_else(|| {
                        job.assigned_instance_id
                            .as_deref()
                            .and_then(|id| members.get(id))
                            .map(|m| m.hourly_rate)
                    })
                    .unwrap_or(0.0);
                if let Err(e) = self.fail_job(job, &error, hourly_rate, now).await {
                    report.errors.push(format!("job {}: {e}", job.id));
                    continue;
                }
            }
            report.failed_jobs.push(SweptJob {
                job_id: job.id,
                instance_id: job.assigned_instance_id.clone(),
                reason,
            });
        }
    }

    fn classify(
        &self,
        instance: &ProviderInstance,
        jobs: &[Job],
        member: Option<&Instance>,
        now: DateTime<Utc>,
    ) -> Option<Finding> {
        let max_runtime = to_chrono(self.config.max_runtime);
        let stuck_jobs: Vec<Job> = jobs
            .iter()
            .filter(|j| j.status.is_active())
            .filter(|j| now - j.custody_started_at().unwrap_or(j.created_at) > max_runtime)
            .cloned()
            .collect();
        if !stuck_jobs.is_empty() {
            return Some(Finding {
                reason: SweepReason::Stuck,
                stuck_jobs,
            });
        }

        if jobs.iter().any(|j| j.status.is_active()) {
            return None;
        }

        if let Some(member) = member {
            // Idle and warming members are governed by the pool's idle
            // timeout. A busy member without an active job is leaked state.
            if member.status != InstanceStatus::Busy {
                return None;
            }
        } else if jobs.is_empty() {
            let age = instance.created_at.map(|created| now - created);
            let within_grace = age.is_some_and(|age| age < to_chrono(self.config.orphan_grace));
            return (!within_grace).then_some(Finding {
                reason: SweepReason::Orphan,
                stuck_jobs: Vec::new(),
            });
        }

        let last_activity = jobs
            .iter()
            .map(|j| j.updated_at)
            .chain(member.map(|m| m.last_activity_at))
            .chain(instance.created_at)
            .max()?;
        (now - last_activity > to_chrono(self.config.staleness_threshold)).then_some(Finding {
            reason: SweepReason::Stale,
            stuck_jobs: Vec::new(),
        })
    }

    async fn terminate(&self, instance_id: &str, pooled: bool) -> Result<()> {
        match (&self.pool, pooled) {
            (Some(pool), true) => {
                pool.retire(instance_id).await;
                Ok(())
            }
            _ => {
                self.provider.terminate_instance(instance_id).await?;
                info!(instance_id, "Instance terminated by sweeper");
                Ok(())
            }
        }
    }

    async fn fail_job(
        &self,
        job: &Job,
        error: &FleetError,
        hourly_rate: f64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let usage = job
            .custody_started_at()
            .map(|start| compute_usage(start, now, hourly_rate));
        self.store
            .finish(job.id, JobOutcome::Failed { error: error.to_string() }, usage)
            .await?;
        warn!(job_id = %job.id, error = %error, "Job failed by sweeper");
        Ok(())
    }

    /// Terminate every in-scope instance regardless of job state.
    ///
    /// # Errors
    /// Returns an error if the provider's instance list cannot be read.
    pub async fn terminate_all(&self, mode: SweepMode) -> Result<SweepReport> {
        let instances = self.provider.list_instances().await?;
        let members = self.pool_members().await;
        let mut report = SweepReport {
            dry_run: mode == SweepMode::DryRun,
            ..SweepReport::default()
        };

        for instance in instances.iter().filter(|i| self.in_scope(i)) {
            report.instances_checked += 1;
            if mode == SweepMode::Enforce {
                if let Err(e) = self.terminate(&instance.id, members.contains_key(&instance.id)).await {
                    report.errors.push(format!("{}: {e}", instance.id));
                    continue;
                }
            }
            report.terminated.push(SweptInstance {
                instance_id: instance.id.clone(),
                reason: SweepReason::Forced,
                job_ids: Vec::new(),
            });
        }
        warn!(
            terminated = report.terminated.len(),
            dry_run = report.dry_run,
            "Terminate-all complete"
        );
        Ok(report)
    }

    /// Sweep every interval until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = self.config.interval.as_secs(), "Sweeper started");

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep(SweepMode::Enforce).await {
                        error!(error = %e, "Sweep failed");
                    }
                }
            }
        }
        info!("Sweeper stopped");
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(3650))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpu::ProviderStatus;

    fn provider_instance(id: &str, age_secs: i64) -> ProviderInstance {
        ProviderInstance {
            id: id.into(),
            status: ProviderStatus::Running,
            label: Some(format!("fleet-infer-{id}")),
            ssh_host: None,
            ssh_port: None,
            public_ip: None,
            gpu_type: None,
            hourly_rate: Some(0.4),
            created_at: Some(Utc::now() - chrono::Duration::seconds(age_secs)),
        }
    }

    fn sweeper() -> InstanceSweeper {
        struct NoProvider;
        #[async_trait::async_trait]
        impl InstanceProvider for NoProvider {
            async fn search_offers(&self, _: &gpu::OfferQuery) -> std::result::Result<Vec<gpu::Offer>, gpu::GpuProviderError> {
                Ok(Vec::new())
            }
            async fn provision_instance(
                &self,
                _: gpu::ProvisionRequest,
            ) -> std::result::Result<gpu::ProvisionedInstance, gpu::GpuProviderError> {
                Err(gpu::GpuProviderError::NoOffersAvailable(String::new()))
            }
            async fn get_instance_status(&self, id: &str) -> std::result::Result<ProviderInstance, gpu::GpuProviderError> {
                Err(gpu::GpuProviderError::NotFound(id.to_string()))
            }
            async fn attach_access_credentials(&self, _: &str, _: &str) -> std::result::Result<(), gpu::GpuProviderError> {
                Ok(())
            }
            async fn terminate_instance(&self, _: &str) -> std::result::Result<(), gpu::GpuProviderError> {
                Ok(())
            }
            async fn list_instances(&self) -> std::result::Result<Vec<ProviderInstance>, gpu::GpuProviderError> {
                Ok(Vec::new())
            }
        }

        InstanceSweeper::new(
            Arc::new(NoProvider),
            Arc::new(crate::store::LocalJobStore::new()),
            SweeperConfig {
                orphan_grace: Duration::from_secs(60),
                max_runtime: Duration::from_secs(3600),
                staleness_threshold: Duration::from_secs(600),
                ..SweeperConfig::default()
            },
        )
    }

    #[test]
    fn test_orphan_respects_grace() {
        let sweeper = sweeper();
        let now = Utc::now();
        assert!(sweeper
            .classify(&provider_instance("young", 10), &[], None, now)
            .is_none());
        let finding = sweeper
            .classify(&provider_instance("old", 120), &[], None, now)
            .unwrap();
        assert_eq!(finding.reason, SweepReason::Orphan);
    }

    #[test]
    fn test_stuck_beats_everything() {
        let sweeper = sweeper();
        let now = Utc::now();
        let mut job = Job::new("chat");
        job.status = crate::models::JobStatus::Running;
        job.claimed_at = Some(now - chrono::Duration::hours(2));

        let finding = sweeper
            .classify(&provider_instance("a", 9000), &[job.clone()], None, now)
            .unwrap();
        assert_eq!(finding.reason, SweepReason::Stuck);
        assert_eq!(finding.stuck_jobs[0].id, job.id);
    }

    #[test]
    fn test_stale_after_terminal_jobs() {
        let sweeper = sweeper();
        let now = Utc::now();
        let mut done = Job::new("chat");
        done.status = crate::models::JobStatus::Completed;
        done.updated_at = now - chrono::Duration::seconds(1200);

        let finding = sweeper
            .classify(&provider_instance("a", 5000), &[done.clone()], None, now)
            .unwrap();
        assert_eq!(finding.reason, SweepReason::Stale);

        done.updated_at = now - chrono::Duration::seconds(30);
        assert!(sweeper
            .classify(&provider_instance("a", 5000), &[done], None, now)
            .is_none());
    }

    #[test]
    fn test_idle_pool_member_left_to_pool() {
        let sweeper = sweeper();
        let now = Utc::now();
        let mut member = Instance::provisioning("a", "infer", "fleet-infer-a", 0.4);
        member.status = InstanceStatus::Ready;
        member.last_activity_at = now - chrono::Duration::hours(5);
        assert!(sweeper
            .classify(&provider_instance("a", 90_000), &[], Some(&member), now)
            .is_none());

        member.status = InstanceStatus::Busy;
        let finding = sweeper
            .classify(&provider_instance("a", 90_000), &[], Some(&member), now)
            .unwrap();
        assert_eq!(finding.reason, SweepReason::Stale);
    }
}
