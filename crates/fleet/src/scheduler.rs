//! Fleet scheduler: which job runs where, next.
//!
//! A pure matching function over the current queue and pool state. It never
//! provisions or executes anything itself; the dispatcher acts on its
//! decisions.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{Instance, Job};
use crate::pool::WarmPoolManager;
use crate::store::JobStore;
use crate::workload::WorkloadCatalog;

/// Pairing of the head-of-queue job with capacity.
#[derive(Debug, Clone)]
pub struct ScheduleDecision {
    pub job: Job,
    /// Workload type (pool key) the job needs.
    pub workload_type: String,
    /// An idle instance of that type, when one exists.
    pub instance: Option<Instance>,
    /// True when no idle instance exists and one must be requested.
    pub needs_provisioning: bool,
}

pub struct FleetScheduler {
    store: Arc<dyn JobStore>,
    pool: Arc<WarmPoolManager>,
    catalog: Arc<WorkloadCatalog>,
}

impl FleetScheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        pool: Arc<WarmPoolManager>,
        catalog: Arc<WorkloadCatalog>,
    ) -> Self {
        Self {
            store,
            pool,
            catalog,
        }
    }

    /// Pair the head queued job with an idle instance or a provisioning need.
    /// `None` when the queue is empty.
    ///
    /// # Errors
    /// Returns store errors, or [`crate::FleetError::UnknownRequestType`] when
    /// the head job maps to no workload.
    pub async fn schedule_next(&self) -> Result<Option<ScheduleDecision>> {
        self.schedule_next_excluding(&HashSet::new()).await
    }

    /// Like [`Self::schedule_next`], skipping jobs in `exclude` (jobs the
    /// caller is already acting on).
    ///
    /// # Errors
    /// See [`Self::schedule_next`].
    pub async fn schedule_next_excluding(
        &self,
        exclude: &HashSet<Uuid>,
    ) -> Result<Option<ScheduleDecision>> {
        let Some(job) = self
            .store
            .queued()
            .await?
            .into_iter()
            .find(|j| !exclude.contains(&j.id))
        else {
            return Ok(None);
        };

        let workload_type = self.catalog.profile(&job.request_type)?.workload_type.clone();
        let instance = self.pool.idle_instances(&workload_type).await.into_iter().next();
        let needs_provisioning = instance.is_none();

        debug!(
            job_id = %job.id,
            workload = %workload_type,
            instance_id = ?instance.as_ref().map(|i| i.id.as_str()),
            needs_provisioning,
            "Scheduling decision"
        );
        Ok(Some(ScheduleDecision {
            job,
            workload_type,
            instance,
            needs_provisioning,
        }))
    }

    /// Atomically move a queued job to claimed on `instance_id`. `None` when
    /// another caller claimed it first.
    ///
    /// # Errors
    /// Returns store errors (not a lost race).
    pub async fn claim_job(&self, job_id: Uuid, instance_id: &str) -> Result<Option<Job>> {
        let claimed = self.store.claim(job_id, instance_id).await?;
        if claimed.is_some() {
            self.pool.assign_job(instance_id, job_id).await;
        }
        Ok(claimed)
    }
}
