//! Instance provisioning and readiness.
//!
//! [`Provisioner::launch`] rents an instance, falling through to the next
//! cheapest offer when one is taken. [`Provisioner::await_ready`] then waits
//! until the instance actually accepts remote commands. Provider "running" is
//! only the first milestone; sshd and key propagation lag behind it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gpu::{GpuProviderError, InstanceProvider, Offer, OfferQuery, ProviderStatus, ProvisionRequest};
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{FleetError, Result};
use crate::models::{Instance, InstanceStatus, SshEndpoint};
use crate::retry::{retry, RetryPolicy};
use crate::transport::{RemoteTransport, TransportError, TransportFactory};
use crate::workload::InstanceSpec;

/// Command used to prove an instance accepts remote commands.
const PROBE_COMMAND: &str = "echo ready";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionConfig {
    /// Offer attempts and the delay between them.
    pub offer_retry: RetryPolicy,
    /// Upper bound from provision to first successful probe.
    #[serde(with = "crate::config::duration_secs")]
    pub readiness_timeout: Duration,
    /// Provider status polling schedule.
    pub status_poll: RetryPolicy,
    /// Readiness probe retries.
    pub probe: RetryPolicy,
    /// Timeout of a single probe command.
    #[serde(with = "crate::config::duration_secs")]
    pub probe_timeout: Duration,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            offer_retry: RetryPolicy::new(3, Duration::from_secs(2))
                .with_max_delay(Duration::from_secs(10)),
            readiness_timeout: Duration::from_secs(600),
            status_poll: RetryPolicy::new(u32::MAX, Duration::from_secs(5))
                .with_max_delay(Duration::from_secs(30))
                .with_multiplier(1.5),
            probe: RetryPolicy::new(60, Duration::from_secs(2))
                .with_max_delay(Duration::from_secs(15)),
            probe_timeout: Duration::from_secs(20),
        }
    }
}

/// Provider-side label for a new instance: `<prefix>-<workload>-<suffix>`.
#[must_use]
pub fn instance_label(prefix: &str, workload_type: &str) -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("{prefix}-{workload_type}-{}", &id[..8])
}

/// Rents instances and waits for them to become reachable.
pub struct Provisioner {
    provider: Arc<dyn InstanceProvider>,
    transports: Arc<dyn TransportFactory>,
    config: ProvisionConfig,
    public_key: Option<String>,
    provisioning_errors: AtomicU64,
}

impl Provisioner {
    pub fn new(
        provider: Arc<dyn InstanceProvider>,
        transports: Arc<dyn TransportFactory>,
        config: ProvisionConfig,
    ) -> Self {
        Self {
            provider,
            transports,
            config,
            public_key: None,
            provisioning_errors: AtomicU64::new(0),
        }
    }

    /// Attach this public key to every instance launched.
    #[must_use]
    pub fn with_public_key(mut self, key: Option<String>) -> Self {
        self.public_key = key;
        self
    }

    #[must_use]
    pub fn provider(&self) -> &Arc<dyn InstanceProvider> {
        &self.provider
    }

    #[must_use]
    pub fn transports(&self) -> &Arc<dyn TransportFactory> {
        &self.transports
    }

    /// Provisioning attempts that failed since this provisioner was created.
    #[must_use]
    pub fn provisioning_errors(&self) -> u64 {
        self.provisioning_errors.load(Ordering::Relaxed)
    }

    /// Offers matching `query`, cheapest first.
    ///
    /// # Errors
    /// Returns an error if the offer search fails.
    pub async fn offers(&self, query: &OfferQuery) -> Result<Vec<Offer>> {
        let mut offers: Vec<Offer> = self
            .provider
            .search_offers(query)
            .await?
            .into_iter()
            .filter(|o| matches_query(o, query))
            .collect();
        offers.sort_by(|a, b| a.hourly_rate.total_cmp(&b.hourly_rate));
        Ok(offers)
    }

    /// Rent an instance for `workload_type`.
    ///
    /// Tries offers cheapest first. An offer that is no longer available (or
    /// any other retryable provider failure) moves on to the next offer after
    /// a backoff delay; the number of attempts is bounded by the offer retry
    /// policy.
    ///
    /// # Errors
    /// Returns [`FleetError::ProvisioningExhausted`] when every attempt failed,
    /// or the provider error for non-retryable failures.
    pub async fn launch(
        &self,
        workload_type: &str,
        spec: &InstanceSpec,
        label: &str,
    ) -> Result<Instance> {
        let offers = self.offers(&spec.offer).await?;
        if offers.is_empty() {
            return Err(GpuProviderError::NoOffersAvailable(describe_query(&spec.offer)).into());
        }

        let policy = &self.config.offer_retry;
        let mut attempts: u32 = 0;
        let mut last_error = None;

        for offer in &offers {
            if !policy.should_retry(attempts) {
                break;
            }
            if attempts > 0 {
                sleep(policy.delay_for_attempt(attempts - 1)).await;
            }
            attempts += 1;

            info!(
                workload = %workload_type,
                offer_id = %offer.id,
                gpu = %offer.gpu_name,
                hourly_rate = offer.hourly_rate,
                attempt = attempts,
                "Provisioning instance"
            );
            let request = ProvisionRequest {
                offer_id: offer.id.clone(),
                image: spec.image.clone(),
                disk_gb: spec.disk_gb,
                label: label.to_string(),
            };

            match self.provider.provision_instance(request).await {
                Ok(provisioned) => {
                    let mut instance = Instance::provisioning(
                        provisioned.instance_id,
                        workload_type,
                        label,
                        offer.hourly_rate,
                    );
                    instance.gpu_type = Some(offer.gpu_name.clone());
                    self.attach_key(&instance).await?;
                    info!(
                        instance_id = %instance.id,
                        workload = %workload_type,
                        label,
                        "Instance provisioned"
                    );
                    return Ok(instance);
                }
                Err(e) => {
                    self.provisioning_errors.fetch_add(1, Ordering::Relaxed);
                    if !e.is_retryable() {
                        warn!(offer_id = %offer.id, error = %e, "Provisioning failed");
                        return Err(e.into());
                    }
                    warn!(
                        offer_id = %offer.id,
                        error = %e,
                        unavailable = e.is_offer_unavailable(),
                        "Provisioning attempt failed, trying next offer"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(FleetError::ProvisioningExhausted {
            attempts,
            last_error: last_error.map_or_else(|| "no offers tried".to_string(), |e| e.to_string()),
        })
    }

    async fn attach_key(&self, instance: &Instance) -> Result<()> {
        let Some(key) = &self.public_key else {
            return Ok(());
        };

        let attached = retry(
            &self.config.offer_retry,
            "attach_access_credentials",
            GpuProviderError::is_retryable,
            |_| self.provider.attach_access_credentials(&instance.id, key),
        )
        .await;

        if let Err(e) = attached {
            warn!(instance_id = %instance.id, error = %e, "Failed to attach access key");
            self.terminate(&instance.id).await;
            return Err(e.into());
        }
        debug!(instance_id = %instance.id, "Access key attached");
        Ok(())
    }

    /// Wait until `instance` accepts remote commands, then mark it ready.
    ///
    /// Polls provider status until the provider reports running with an SSH
    /// address, then probes with a trivial command, retrying transient
    /// transport failures. Both phases share one deadline.
    ///
    /// # Errors
    /// Returns [`FleetError::ReadinessTimeout`] if the instance never became
    /// reachable. The instance has been terminated by then.
    pub async fn await_ready(&self, instance: &mut Instance) -> Result<()> {
        let started = Instant::now();
        let deadline = started + self.config.readiness_timeout;

        let outcome = match timeout_at(deadline, self.wait_reachable(instance)).await {
            Ok(Ok(endpoint)) => Ok(endpoint),
            Ok(Err(reason)) => Err(reason),
            Err(_) => Err("readiness deadline elapsed".to_string()),
        };

        match outcome {
            Ok(endpoint) => {
                info!(
                    instance_id = %instance.id,
                    endpoint = %endpoint,
                    waited_secs = started.elapsed().as_secs(),
                    "Instance ready"
                );
                instance.ssh = Some(endpoint);
                instance.status = InstanceStatus::Ready;
                instance.touch();
                Ok(())
            }
            Err(reason) => {
                warn!(instance_id = %instance.id, reason = %reason, "Instance never became ready");
                self.terminate(&instance.id).await;
                instance.status = InstanceStatus::Terminated;
                Err(FleetError::ReadinessTimeout {
                    instance_id: instance.id.clone(),
                    waited_secs: started.elapsed().as_secs(),
                    reason,
                })
            }
        }
    }

    async fn wait_reachable(&self, instance: &mut Instance) -> std::result::Result<SshEndpoint, String> {
        let mut backoff = self.config.status_poll.backoff();

        let endpoint = loop {
            match self.provider.get_instance_status(&instance.id).await {
                Ok(status) if status.status == ProviderStatus::Running => {
                    if let Some((host, port)) = status.ssh_address() {
                        if status.gpu_type.is_some() {
                            instance.gpu_type.clone_from(&status.gpu_type);
                        }
                        break SshEndpoint::new(host, port);
                    }
                    debug!(instance_id = %instance.id, "Running but no SSH address yet");
                }
                Ok(status) if status.status.is_terminal() => {
                    return Err(format!("provider reports instance {}", status.status));
                }
                Ok(status) => {
                    debug!(instance_id = %instance.id, status = %status.status, "Waiting for instance");
                }
                Err(e) if e.is_retryable() => {
                    warn!(instance_id = %instance.id, error = %e, "Status poll failed");
                }
                Err(e) => return Err(e.to_string()),
            }
            sleep(backoff.next_delay()).await;
        };

        let transport = self.transports.connect(&endpoint);
        self.probe(&transport).await.map_err(|e| e.to_string())?;
        Ok(endpoint)
    }

    /// Run the readiness probe until it succeeds or fails permanently.
    ///
    /// # Errors
    /// Returns the last transport error.
    pub async fn probe(
        &self,
        transport: &Arc<dyn RemoteTransport>,
    ) -> std::result::Result<(), TransportError> {
        let probe_timeout = self.config.probe_timeout;
        retry(
            &self.config.probe,
            "readiness_probe",
            TransportError::is_transient,
            |_| {
                let transport = Arc::clone(transport);
                async move {
                    transport
                        .exec(PROBE_COMMAND, probe_timeout)
                        .await?
                        .into_result()
                        .map(|_| ())
                }
            },
        )
        .await
    }

    /// Terminate an instance, logging (not returning) failures. The sweeper
    /// catches anything this misses.
    pub async fn terminate(&self, instance_id: &str) {
        match self.provider.terminate_instance(instance_id).await {
            Ok(()) => info!(instance_id, "Instance terminated"),
            Err(e) => warn!(instance_id, error = %e, "Failed to terminate instance"),
        }
    }
}

fn describe_query(query: &OfferQuery) -> String {
    let mut parts = Vec::new();
    if let Some(name) = &query.gpu_name {
        parts.push(format!("gpu={name}"));
    }
    if let Some(count) = query.gpu_count {
        parts.push(format!("gpus>={count}"));
    }
    if let Some(rate) = query.max_hourly_rate {
        parts.push(format!("rate<=${rate}/h"));
    }
    if parts.is_empty() {
        "any".to_string()
    } else {
        parts.join(", ")
    }
}

fn matches_query(offer: &Offer, query: &OfferQuery) -> bool {
    if let Some(max) = query.max_hourly_rate {
        if offer.hourly_rate > max {
            return false;
        }
    }
    if let Some(count) = query.gpu_count {
        if offer.gpu_count < count {
            return false;
        }
    }
    if let (Some(min), Some(reliability)) = (query.min_reliability, offer.reliability) {
        if reliability < min {
            return false;
        }
    }
    if let (Some(min), Some(disk)) = (query.min_disk_gb, offer.disk_gb) {
        if disk < f64::from(min) {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer(id: &str, rate: f64) -> Offer {
        Offer {
            id: id.into(),
            gpu_name: "RTX_4090".into(),
            gpu_count: 1,
            gpu_memory_gb: Some(24.0),
            hourly_rate: rate,
            reliability: Some(0.99),
            disk_gb: Some(100.0),
            location: None,
        }
    }

    #[test]
    fn test_matches_query_filters_price_and_reliability() {
        let query = OfferQuery {
            max_hourly_rate: Some(0.5),
            min_reliability: Some(0.95),
            ..OfferQuery::default()
        };
        assert!(matches_query(&offer("a", 0.4), &query));
        assert!(!matches_query(&offer("b", 0.6), &query));

        let mut flaky = offer("c", 0.3);
        flaky.reliability = Some(0.8);
        assert!(!matches_query(&flaky, &query));
    }

    #[test]
    fn test_instance_label_shape() {
        let label = instance_label("fleet", "infer");
        assert!(label.starts_with("fleet-infer-"));
        assert_eq!(label.len(), "fleet-infer-".len() + 8);
    }
}
