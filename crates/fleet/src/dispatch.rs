//! Dispatcher loop.
//!
//! Polls the scheduler, and for every decision spawns an independent task
//! that obtains an instance, claims the job and hands both to the executor.
//! Nothing long-running happens on the loop itself.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio::time::{sleep, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cost::compute_usage;
use crate::error::{FleetError, Result};
use crate::executor::{InstanceContext, JobExecutor};
use crate::models::{Instance, Job};
use crate::pool::{RequestOptions, WarmPoolManager};
use crate::scheduler::{FleetScheduler, ScheduleDecision};
use crate::store::{JobOutcome, JobStore};
use crate::transport::TransportFactory;
use crate::workload::WorkloadCatalog;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Delay between ticks that scheduled nothing.
    #[serde(with = "crate::config::duration_secs")]
    pub idle_interval: Duration,
    /// Delay after a tick that scheduled work.
    #[serde(with = "crate::config::duration_secs")]
    pub work_cooldown: Duration,
    /// Jobs this process drives (or waits for capacity for) at once.
    pub max_in_flight: usize,
    /// How long a job waits for pool capacity before going back to the queue.
    #[serde(default, with = "crate::config::option_duration_secs")]
    pub capacity_wait: Option<Duration>,
    /// How long shutdown waits for running jobs before failing them.
    #[serde(with = "crate::config::duration_secs")]
    pub shutdown_grace: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            idle_interval: Duration::from_secs(5),
            work_cooldown: Duration::from_millis(500),
            max_in_flight: 16,
            capacity_wait: Some(Duration::from_secs(1800)),
            shutdown_grace: Duration::from_secs(60),
        }
    }
}

pub struct Dispatcher {
    scheduler: Arc<FleetScheduler>,
    pool: Arc<WarmPoolManager>,
    store: Arc<dyn JobStore>,
    executor: Arc<JobExecutor>,
    transports: Arc<dyn TransportFactory>,
    catalog: Arc<WorkloadCatalog>,
    config: DispatchConfig,
    in_flight: Mutex<HashSet<Uuid>>,
    task_done: Notify,
}

impl Dispatcher {
    pub fn new(
        scheduler: Arc<FleetScheduler>,
        pool: Arc<WarmPoolManager>,
        store: Arc<dyn JobStore>,
        executor: Arc<JobExecutor>,
        transports: Arc<dyn TransportFactory>,
        catalog: Arc<WorkloadCatalog>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            scheduler,
            pool,
            store,
            executor,
            transports,
            catalog,
            config,
            in_flight: Mutex::new(HashSet::new()),
            task_done: Notify::new(),
        }
    }

    /// Jobs currently being provisioned for or executed by this process.
    pub async fn in_flight(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    /// Wait up to `grace` for in-flight job tasks to finish. Returns how many
    /// are still running.
    pub async fn drain(&self, grace: Duration) -> usize {
        let deadline = Instant::now() + grace;
        loop {
            let done = self.task_done.notified();
            let remaining = self.in_flight().await;
            if remaining == 0 || timeout_at(deadline, done).await.is_err() {
                return self.in_flight().await;
            }
        }
    }

    /// Fail every in-flight job that already holds an instance, billing it up
    /// to now. Jobs still waiting for an instance stay queued. Call before
    /// shutting the pool down, once [`Self::drain`] has given up.
    pub async fn abandon_in_flight(&self) -> Vec<Uuid> {
        let ids: Vec<Uuid> = self.in_flight.lock().await.iter().copied().collect();
        let now = Utc::now();
        let mut abandoned = Vec::new();

        for id in ids {
            let job = match self.store.get(id).await {
                Ok(Some(job)) if job.status.is_active() => job,
                Ok(_) => continue,
                Err(e) => {
                    error!(job_id = %id, error = %e, "Failed to read in-flight job");
                    continue;
                }
            };
            let hourly_rate = match job.assigned_instance_id.as_deref() {
                Some(instance_id) => self.pool.lookup(instance_id).await.map_or(0.0, |i| i.hourly_rate),
                None => 0.0,
            };
            let usage = job
                .custody_started_at()
                .map(|start| compute_usage(start, now, hourly_rate));
            let error = FleetError::Abandoned("dispatcher shut down before the job finished".to_string());
            match self
                .store
                .finish(id, JobOutcome::Failed { error: error.to_string() }, usage)
                .await
            {
                Ok(_) => {
                    warn!(job_id = %id, "In-flight job abandoned at shutdown");
                    abandoned.push(id);
                }
                // The executor finished it in the meantime.
                Err(e) => debug!(job_id = %id, error = %e, "Job not abandoned"),
            }
        }
        abandoned
    }

    /// Run until `cancel` fires. In-flight job tasks keep running; draining
    /// them and shutting the pool down is left to the caller.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            idle_interval_ms = u64::try_from(self.config.idle_interval.as_millis()).unwrap_or(u64::MAX),
            max_in_flight = self.config.max_in_flight,
            "Dispatcher started"
        );

        loop {
            let worked = match self.tick().await {
                Ok(dispatched) => dispatched > 0,
                Err(e) => {
                    error!(error = %e, "Dispatch tick failed");
                    false
                }
            };
            let delay = if worked {
                self.config.work_cooldown
            } else {
                self.config.idle_interval
            };

            tokio::select! {
                () = cancel.cancelled() => break,
                () = sleep(delay) => {}
            }
        }
        info!("Dispatcher stopped");
    }

    /// One pass: fail unroutable jobs, maintain pools, dispatch what fits.
    /// Returns the number of jobs handed to new tasks.
    ///
    /// # Errors
    /// Returns job store errors.
    pub async fn tick(self: &Arc<Self>) -> Result<usize> {
        let depth = self.prepare_queue().await?;
        self.pool.maintain(&depth).await;

        let mut dispatched = 0;
        loop {
            let exclude = {
                let in_flight = self.in_flight.lock().await;
                if in_flight.len() >= self.config.max_in_flight {
                    debug!(in_flight = in_flight.len(), "In-flight limit reached");
                    break;
                }
                in_flight.clone()
            };

            let decision = match self.scheduler.schedule_next_excluding(&exclude).await {
                Ok(Some(decision)) => decision,
                Ok(None) => break,
                Err(FleetError::UnknownRequestType(request_type)) => {
                    // Submitted after `prepare_queue` ran; failed on the next tick.
                    debug!(request_type, "Skipping unroutable job until next tick");
                    break;
                }
                Err(e) => return Err(e),
            };

            self.in_flight.lock().await.insert(decision.job.id);
            let dispatcher = Arc::clone(self);
            tokio::spawn(async move {
                let job_id = decision.job.id;
                if let Err(e) = dispatcher.dispatch(decision).await {
                    warn!(job_id = %job_id, error = %e, "Dispatch failed, job stays queued");
                }
                dispatcher.in_flight.lock().await.remove(&job_id);
                dispatcher.task_done.notify_waiters();
            });
            dispatched += 1;
        }
        Ok(dispatched)
    }

    /// Fail queued jobs whose request type maps to no workload, and count
    /// the remaining queue per workload type (for pre-warming).
    async fn prepare_queue(&self) -> Result<HashMap<String, usize>> {
        let in_flight = self.in_flight.lock().await.clone();
        let mut depth: HashMap<String, usize> = HashMap::new();

        for job in self.store.queued().await? {
            match self.catalog.profile(&job.request_type) {
                Ok(profile) => {
                    if !in_flight.contains(&job.id) {
                        *depth.entry(profile.workload_type.clone()).or_default() += 1;
                    }
                }
                Err(e) => {
                    warn!(job_id = %job.id, request_type = %job.request_type, "Failing unroutable job");
                    self.store
                        .finish(job.id, JobOutcome::Failed { error: e.to_string() }, None)
                        .await?;
                }
            }
        }
        Ok(depth)
    }

    async fn dispatch(&self, decision: ScheduleDecision) -> Result<()> {
        let ScheduleDecision {
            job,
            workload_type,
            instance,
            ..
        } = decision;

        let instance = match instance {
            Some(idle) => match self.pool.acquire(&idle.id).await {
                Ok(instance) => instance,
                Err(e) => {
                    debug!(instance_id = %idle.id, error = %e, "Idle instance taken, requesting another");
                    self.request(&workload_type).await?
                }
            },
            None => self.request(&workload_type).await?,
        };

        let claimed = match self.scheduler.claim_job(job.id, &instance.id).await {
            Ok(Some(claimed)) => claimed,
            Ok(None) => {
                info!(job_id = %job.id, instance_id = %instance.id, "Claim lost, returning instance");
                self.pool.release(&instance.id).await?;
                return Ok(());
            }
            Err(e) => {
                self.pool.release(&instance.id).await?;
                return Err(e);
            }
        };

        self.execute(claimed, instance).await;
        Ok(())
    }

    async fn request(&self, workload_type: &str) -> Result<Instance> {
        let mut opts = RequestOptions::default();
        if let Some(wait) = self.config.capacity_wait {
            opts = opts.with_wait_timeout(wait);
        }
        self.pool
            .request_instance(workload_type, opts)
            .await?
            .into_instance()
            .await
    }

    async fn execute(&self, job: Job, instance: Instance) {
        match InstanceContext::connect(&instance, self.transports.as_ref()) {
            Ok(ctx) => {
                let report = self.executor.process(&job, ctx).await;
                debug!(job_id = %job.id, success = report.success, "Execution report");
            }
            Err(e) => {
                error!(job_id = %job.id, instance_id = %instance.id, error = %e, "Instance unusable");
                self.pool.retire(&instance.id).await;
                if let Err(e) = self
                    .store
                    .finish(job.id, JobOutcome::Failed { error: e.to_string() }, None)
                    .await
                {
                    error!(job_id = %job.id, error = %e, "Failed to record job outcome");
                }
            }
        }
    }
}
