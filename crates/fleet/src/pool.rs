//! Warm pool manager.
//!
//! One pool per workload type. A pool owns the instances it provisioned and
//! hands idle ones to jobs, so consecutive jobs of the same type skip the cold
//! start. Membership mutations for a pool happen under that pool's lock, which
//! is what keeps concurrent requests from provisioning past `max_size`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex, Notify, RwLock};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{FleetError, Result};
use crate::executor::InstanceRelease;
use crate::models::{Instance, InstanceStatus};
use crate::provision::{instance_label, Provisioner};
use crate::workload::{InstanceSpec, WorkloadCatalog};

/// Sizing and lifetime policy of one pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolPolicy {
    /// Cap on instances owned by the pool, including those still provisioning.
    pub max_size: usize,
    /// Idle instances older than this are terminated.
    #[serde(with = "crate::config::duration_secs")]
    pub idle_timeout: Duration,
    /// Queue depth for this workload type at which an instance is provisioned
    /// ahead of demand. Zero disables pre-warming.
    pub spin_up_threshold: usize,
}

impl Default for PoolPolicy {
    fn default() -> Self {
        Self {
            max_size: 2,
            idle_timeout: Duration::from_secs(600),
            spin_up_threshold: 0,
        }
    }
}

/// Options for [`WarmPoolManager::request_instance`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestOptions {
    /// How long to wait for capacity when the pool is full. `None` waits
    /// until capacity frees up or the pool shuts down.
    pub wait_timeout: Option<Duration>,
}

impl RequestOptions {
    #[must_use]
    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = Some(timeout);
        self
    }
}

/// Result of a capacity request.
#[derive(Debug)]
pub enum PoolGrant {
    /// An idle instance, already marked busy for the caller.
    Ready(Instance),
    /// A new instance is being provisioned for the caller.
    Pending(PendingInstance),
}

impl PoolGrant {
    /// Wait for the instance regardless of which path produced it.
    ///
    /// # Errors
    /// Returns the provisioning or readiness error of a pending instance.
    pub async fn into_instance(self) -> Result<Instance> {
        match self {
            Self::Ready(instance) => Ok(instance),
            Self::Pending(pending) => pending.wait().await,
        }
    }
}

/// Handle to an instance being provisioned for one requester.
///
/// Dropping the handle does not cancel provisioning: the instance joins the
/// pool as idle once ready.
#[derive(Debug)]
pub struct PendingInstance {
    workload_type: String,
    rx: oneshot::Receiver<Result<Instance>>,
}

impl PendingInstance {
    #[must_use]
    pub fn workload_type(&self) -> &str {
        &self.workload_type
    }

    /// Wait until the instance is ready (and busy for the caller).
    ///
    /// # Errors
    /// Returns the provisioning or readiness error, or
    /// [`FleetError::PoolShutdown`] if the pool shut down first.
    pub async fn wait(self) -> Result<Instance> {
        self.rx.await.map_err(|_| FleetError::PoolShutdown)?
    }
}

/// Point-in-time view of a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolSnapshot {
    pub workload_type: String,
    pub ready: usize,
    pub busy: usize,
    pub provisioning: usize,
    pub max_size: usize,
}

#[derive(Debug, Default)]
struct PoolState {
    /// Owned instances in any live status.
    instances: HashMap<String, Instance>,
    /// Launches in flight that have no instance ID yet.
    launching: usize,
}

impl PoolState {
    fn size(&self) -> usize {
        self.instances.len() + self.launching
    }

    fn take_idle(&mut self) -> Option<&mut Instance> {
        self.instances
            .values_mut()
            .filter(|i| i.status == InstanceStatus::Ready)
            .min_by_key(|i| i.last_activity_at)
    }

    fn count(&self, status: InstanceStatus) -> usize {
        self.instances.values().filter(|i| i.status == status).count()
    }
}

#[derive(Debug)]
struct Pool {
    workload_type: String,
    policy: PoolPolicy,
    state: Mutex<PoolState>,
    notify: Notify,
}

impl Pool {
    fn new(workload_type: &str, policy: PoolPolicy) -> Self {
        Self {
            workload_type: workload_type.to_string(),
            policy,
            state: Mutex::new(PoolState::default()),
            notify: Notify::new(),
        }
    }
}

/// Owns every warm pool.
pub struct WarmPoolManager {
    pools: RwLock<HashMap<String, Arc<Pool>>>,
    policies: HashMap<String, PoolPolicy>,
    default_policy: PoolPolicy,
    catalog: Arc<WorkloadCatalog>,
    provisioner: Arc<Provisioner>,
    label_prefix: String,
    cancel: CancellationToken,
}

impl WarmPoolManager {
    pub fn new(
        provisioner: Arc<Provisioner>,
        catalog: Arc<WorkloadCatalog>,
        label_prefix: impl Into<String>,
    ) -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            policies: HashMap::new(),
            default_policy: PoolPolicy::default(),
            catalog,
            provisioner,
            label_prefix: label_prefix.into(),
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_default_policy(mut self, policy: PoolPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    #[must_use]
    pub fn with_policy(mut self, workload_type: impl Into<String>, policy: PoolPolicy) -> Self {
        self.policies.insert(workload_type.into(), policy);
        self
    }

    #[must_use]
    pub fn provisioner(&self) -> &Arc<Provisioner> {
        &self.provisioner
    }

    #[must_use]
    pub fn catalog(&self) -> &Arc<WorkloadCatalog> {
        &self.catalog
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    async fn pool(&self, workload_type: &str) -> Arc<Pool> {
        if let Some(pool) = self.pools.read().await.get(workload_type) {
            return Arc::clone(pool);
        }
        let mut pools = self.pools.write().await;
        let pool = pools.entry(workload_type.to_string()).or_insert_with(|| {
            let policy = self
                .policies
                .get(workload_type)
                .cloned()
                .unwrap_or_else(|| self.default_policy.clone());
            debug!(workload = %workload_type, max_size = policy.max_size, "Created pool");
            Arc::new(Pool::new(workload_type, policy))
        });
        Arc::clone(pool)
    }

    async fn all_pools(&self) -> Vec<Arc<Pool>> {
        self.pools.read().await.values().cloned().collect()
    }

    async fn pool_of(&self, instance_id: &str) -> Option<Arc<Pool>> {
        for pool in self.all_pools().await {
            if pool.state.lock().await.instances.contains_key(instance_id) {
                return Some(pool);
            }
        }
        None
    }

    /// Get an instance for `workload_type`.
    ///
    /// Returns an idle instance (marked busy) when one exists. Otherwise, if
    /// the pool is below its cap, starts provisioning and returns a pending
    /// handle. At the cap, waits for a release, retirement, or failed launch
    /// to free capacity.
    ///
    /// # Errors
    /// Returns [`FleetError::CapacityTimeout`] if capacity did not free up in
    /// time, [`FleetError::PoolShutdown`] after shutdown, or a configuration
    /// error for unknown workload types.
    pub async fn request_instance(
        self: &Arc<Self>,
        workload_type: &str,
        opts: RequestOptions,
    ) -> Result<PoolGrant> {
        if self.cancel.is_cancelled() {
            return Err(FleetError::PoolShutdown);
        }
        let spec = self.catalog.instance_spec(workload_type)?.clone();
        let pool = self.pool(workload_type).await;
        let deadline = opts.wait_timeout.map(|t| Instant::now() + t);

        loop {
            let notified = pool.notify.notified();
            tokio::pin!(notified);
            // Register before inspecting state so a release in between is not missed.
            notified.as_mut().enable();

            {
                let mut state = pool.state.lock().await;
                if let Some(instance) = state.take_idle() {
                    instance.status = InstanceStatus::Busy;
                    instance.touch();
                    info!(
                        instance_id = %instance.id,
                        workload = %workload_type,
                        "Reusing warm instance"
                    );
                    return Ok(PoolGrant::Ready(instance.clone()));
                }
                if state.size() < pool.policy.max_size {
                    state.launching += 1;
                    drop(state);
                    let (tx, rx) = oneshot::channel();
                    self.spawn_provision(Arc::clone(&pool), spec, Some(tx));
                    return Ok(PoolGrant::Pending(PendingInstance {
                        workload_type: workload_type.to_string(),
                        rx,
                    }));
                }
                debug!(
                    workload = %workload_type,
                    size = state.size(),
                    max_size = pool.policy.max_size,
                    "Pool at capacity, waiting"
                );
            }

            let expired = async {
                match deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                () = &mut notified => {}
                () = self.cancel.cancelled() => return Err(FleetError::PoolShutdown),
                () = expired => return Err(FleetError::CapacityTimeout(workload_type.to_string())),
            }
        }
    }

    fn spawn_provision(
        self: &Arc<Self>,
        pool: Arc<Pool>,
        spec: InstanceSpec,
        requester: Option<oneshot::Sender<Result<Instance>>>,
    ) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let result = tokio::select! {
                result = manager.provision_into(&pool, &spec) => result,
                () = manager.cancel.cancelled() => Err(FleetError::Cancelled),
            };

            let result = match result {
                Ok(instance_id) => manager.complete_provisioning(&pool, &instance_id, requester.is_some()).await,
                Err(e) => Err(e),
            };

            match (result, requester) {
                (Ok(instance), Some(tx)) => {
                    let instance_id = instance.id.clone();
                    if tx.send(Ok(instance)).is_err() {
                        debug!(instance_id = %instance_id, "Requester gone, instance joins pool idle");
                        if let Err(e) = manager.release(&instance_id).await {
                            warn!(instance_id = %instance_id, error = %e, "Failed to idle instance");
                        }
                    }
                }
                (Ok(instance), None) => {
                    debug!(instance_id = %instance.id, "Pre-warmed instance ready");
                }
                (Err(e), requester) => {
                    warn!(workload = %pool.workload_type, error = %e, "Provisioning for pool failed");
                    pool.notify.notify_waiters();
                    if let Some(tx) = requester {
                        let _ = tx.send(Err(e));
                    }
                }
            }
        });
    }

    /// Launch and wait for readiness, keeping the pool's accounting exact:
    /// the reserved launch slot becomes a member once the instance has an ID,
    /// and the member is dropped again if readiness fails.
    async fn provision_into(&self, pool: &Pool, spec: &InstanceSpec) -> Result<String> {
        let label = instance_label(&self.label_prefix, &pool.workload_type);
        let launched = self
            .provisioner
            .launch(&pool.workload_type, spec, &label)
            .await;

        let mut instance = {
            let mut state = pool.state.lock().await;
            state.launching = state.launching.saturating_sub(1);
            let mut instance = launched?;
            instance.pool = Some(pool.workload_type.clone());
            state.instances.insert(instance.id.clone(), instance.clone());
            instance
        };

        if let Err(e) = self.provisioner.await_ready(&mut instance).await {
            pool.state.lock().await.instances.remove(&instance.id);
            return Err(e);
        }

        let mut state = pool.state.lock().await;
        let Some(member) = state.instances.get_mut(&instance.id) else {
            // Shut down while waiting; shutdown already terminated it.
            return Err(FleetError::PoolShutdown);
        };
        member.ssh = instance.ssh.clone();
        member.gpu_type.clone_from(&instance.gpu_type);
        Ok(instance.id)
    }

    async fn complete_provisioning(
        &self,
        pool: &Pool,
        instance_id: &str,
        reserve: bool,
    ) -> Result<Instance> {
        if !reserve {
            return self.mark_ready(instance_id).await;
        }
        let mut state = pool.state.lock().await;
        let member = state
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| FleetError::InstanceNotFound(instance_id.to_string()))?;
        member.status = InstanceStatus::Busy;
        member.touch();
        info!(instance_id, workload = %pool.workload_type, "Instance ready for requester");
        Ok(member.clone())
    }

    /// Move a provisioning instance to ready, making it schedulable.
    ///
    /// # Errors
    /// Returns an error if the instance is unknown or not provisioning.
    pub async fn mark_ready(&self, instance_id: &str) -> Result<Instance> {
        let pool = self
            .pool_of(instance_id)
            .await
            .ok_or_else(|| FleetError::InstanceNotFound(instance_id.to_string()))?;
        let mut state = pool.state.lock().await;
        let member = state
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| FleetError::InstanceNotFound(instance_id.to_string()))?;
        if member.status != InstanceStatus::Provisioning {
            return Err(FleetError::InstanceState {
                instance_id: instance_id.to_string(),
                status: member.status.to_string(),
                expected: InstanceStatus::Provisioning.to_string(),
            });
        }
        member.status = InstanceStatus::Ready;
        member.touch();
        let instance = member.clone();
        drop(state);

        info!(instance_id, workload = %pool.workload_type, "Instance marked ready");
        pool.notify.notify_waiters();
        Ok(instance)
    }

    /// Take a specific idle instance for a job.
    ///
    /// # Errors
    /// Returns an error if the instance is unknown or not idle.
    pub async fn acquire(&self, instance_id: &str) -> Result<Instance> {
        let pool = self
            .pool_of(instance_id)
            .await
            .ok_or_else(|| FleetError::InstanceNotFound(instance_id.to_string()))?;
        let mut state = pool.state.lock().await;
        let member = state
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| FleetError::InstanceNotFound(instance_id.to_string()))?;
        if member.status != InstanceStatus::Ready {
            return Err(FleetError::InstanceState {
                instance_id: instance_id.to_string(),
                status: member.status.to_string(),
                expected: InstanceStatus::Ready.to_string(),
            });
        }
        member.status = InstanceStatus::Busy;
        member.touch();
        debug!(instance_id, "Instance acquired");
        Ok(member.clone())
    }

    /// Record which job holds a busy instance.
    pub async fn assign_job(&self, instance_id: &str, job_id: Uuid) {
        if let Some(pool) = self.pool_of(instance_id).await {
            if let Some(member) = pool.state.lock().await.instances.get_mut(instance_id) {
                member.current_job = Some(job_id);
            }
        }
    }

    /// Return a busy instance to idle. Releasing an idle instance is a no-op.
    ///
    /// # Errors
    /// Returns an error if the instance is not a pool member or is still
    /// provisioning.
    pub async fn release(&self, instance_id: &str) -> Result<()> {
        let pool = self
            .pool_of(instance_id)
            .await
            .ok_or_else(|| FleetError::InstanceNotFound(instance_id.to_string()))?;
        let mut state = pool.state.lock().await;
        let member = state
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| FleetError::InstanceNotFound(instance_id.to_string()))?;

        match member.status {
            InstanceStatus::Ready => {
                debug!(instance_id, "Release of idle instance ignored");
                return Ok(());
            }
            InstanceStatus::Busy => {}
            status => {
                return Err(FleetError::InstanceState {
                    instance_id: instance_id.to_string(),
                    status: status.to_string(),
                    expected: InstanceStatus::Busy.to_string(),
                })
            }
        }
        member.status = InstanceStatus::Ready;
        member.current_job = None;
        member.touch();
        drop(state);

        info!(instance_id, workload = %pool.workload_type, "Instance released to pool");
        pool.notify.notify_waiters();
        Ok(())
    }

    /// Remove an instance from its pool and terminate it.
    ///
    /// Instances the pool does not know about are terminated all the same.
    pub async fn retire(&self, instance_id: &str) {
        if let Some(pool) = self.pool_of(instance_id).await {
            if let Some(member) = pool.state.lock().await.instances.get_mut(instance_id) {
                member.status = InstanceStatus::Draining;
            }
            self.provisioner.terminate(instance_id).await;
            pool.state.lock().await.instances.remove(instance_id);
            info!(instance_id, workload = %pool.workload_type, "Instance retired");
            pool.notify.notify_waiters();
        } else {
            self.provisioner.terminate(instance_id).await;
        }
    }

    /// Terminate idle instances older than their pool's idle timeout.
    /// Returns the terminated instance IDs.
    pub async fn reap_idle(&self) -> Vec<String> {
        let now = Utc::now();
        let mut reaped = Vec::new();

        for pool in self.all_pools().await {
            let idle_timeout = chrono::Duration::from_std(pool.policy.idle_timeout)
                .unwrap_or_else(|_| chrono::Duration::days(3650));
            let expired: Vec<String> = {
                let mut state = pool.state.lock().await;
                let ids: Vec<String> = state
                    .instances
                    .values()
                    .filter(|i| i.status == InstanceStatus::Ready)
                    .filter(|i| now - i.last_activity_at >= idle_timeout)
                    .map(|i| i.id.clone())
                    .collect();
                for id in &ids {
                    if let Some(member) = state.instances.get_mut(id) {
                        member.status = InstanceStatus::Draining;
                    }
                }
                ids
            };

            for id in expired {
                info!(instance_id = %id, workload = %pool.workload_type, "Idle timeout reached");
                self.provisioner.terminate(&id).await;
                pool.state.lock().await.instances.remove(&id);
                reaped.push(id);
            }
            pool.notify.notify_waiters();
        }
        reaped
    }

    /// Provision an instance ahead of demand when `queued` jobs of
    /// `workload_type` reach the pool's spin-up threshold and nothing is idle
    /// or already on the way. Returns whether provisioning started.
    pub async fn prewarm(self: &Arc<Self>, workload_type: &str, queued: usize) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        let Ok(spec) = self.catalog.instance_spec(workload_type) else {
            return false;
        };
        let pool = self.pool(workload_type).await;
        let threshold = pool.policy.spin_up_threshold;
        if threshold == 0 || queued < threshold {
            return false;
        }

        {
            let mut state = pool.state.lock().await;
            let warming = state.launching + state.count(InstanceStatus::Provisioning);
            if state.count(InstanceStatus::Ready) > 0
                || warming > 0
                || state.size() >= pool.policy.max_size
            {
                return false;
            }
            state.launching += 1;
        }

        info!(workload = %workload_type, queued, threshold, "Pre-warming instance");
        self.spawn_provision(pool, spec.clone(), None);
        true
    }

    /// Periodic upkeep: reap idle instances, then pre-warm per queue depth.
    pub async fn maintain(self: &Arc<Self>, queued_by_workload: &HashMap<String, usize>) {
        let reaped = self.reap_idle().await;
        if !reaped.is_empty() {
            info!(count = reaped.len(), "Reaped idle instances");
        }
        for (workload_type, queued) in queued_by_workload {
            self.prewarm(workload_type, *queued).await;
        }
    }

    /// Terminate every owned instance and stop provisioning. Returns the
    /// number of instances terminated.
    pub async fn shutdown(&self) -> usize {
        self.cancel.cancel();
        let mut ids = Vec::new();
        for pool in self.all_pools().await {
            let mut state = pool.state.lock().await;
            ids.extend(state.instances.drain().map(|(id, _)| id));
            pool.notify.notify_waiters();
        }

        info!(count = ids.len(), "Shutting down warm pools");
        join_all(ids.iter().map(|id| self.provisioner.terminate(id))).await;
        ids.len()
    }

    /// Every owned instance.
    pub async fn members(&self) -> Vec<Instance> {
        let mut members = Vec::new();
        for pool in self.all_pools().await {
            members.extend(pool.state.lock().await.instances.values().cloned());
        }
        members
    }

    pub async fn lookup(&self, instance_id: &str) -> Option<Instance> {
        let pool = self.pool_of(instance_id).await?;
        let state = pool.state.lock().await;
        state.instances.get(instance_id).cloned()
    }

    /// Idle instances of `workload_type`, least recently used first.
    pub async fn idle_instances(&self, workload_type: &str) -> Vec<Instance> {
        let Some(pool) = self.pools.read().await.get(workload_type).cloned() else {
            return Vec::new();
        };
        let state = pool.state.lock().await;
        let mut idle: Vec<Instance> = state
            .instances
            .values()
            .filter(|i| i.status == InstanceStatus::Ready)
            .cloned()
            .collect();
        idle.sort_by_key(|i| i.last_activity_at);
        idle
    }

    pub async fn snapshot(&self) -> Vec<PoolSnapshot> {
        let mut snapshots = Vec::new();
        for pool in self.all_pools().await {
            let state = pool.state.lock().await;
            snapshots.push(PoolSnapshot {
                workload_type: pool.workload_type.clone(),
                ready: state.count(InstanceStatus::Ready),
                busy: state.count(InstanceStatus::Busy),
                provisioning: state.launching + state.count(InstanceStatus::Provisioning),
                max_size: pool.policy.max_size,
            });
        }
        snapshots.sort_by(|a, b| a.workload_type.cmp(&b.workload_type));
        snapshots
    }
}

#[async_trait]
impl InstanceRelease for WarmPoolManager {
    async fn release_instance(&self, instance: &Instance, healthy: bool) -> Result<()> {
        if !healthy {
            warn!(instance_id = %instance.id, "Retiring unhealthy instance");
            self.retire(&instance.id).await;
            return Ok(());
        }
        match self.release(&instance.id).await {
            Err(FleetError::InstanceNotFound(_)) => {
                // Not pooled (or reaped while busy); never leave it billing.
                self.provisioner.terminate(&instance.id).await;
                Ok(())
            }
            other => other,
        }
    }
}
