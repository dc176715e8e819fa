//! Instance provider trait and common types.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during provider operations.
#[derive(Error, Debug)]
pub enum GpuProviderError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned an error response.
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// The offer was taken by another renter between search and provision.
    #[error("Offer {0} is no longer available")]
    OfferUnavailable(String),

    /// Resource not found.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Operation timed out.
    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No offers matched the search criteria.
    #[error("No offers available matching: {0}")]
    NoOffersAvailable(String),
}

impl GpuProviderError {
    /// Whether the error means the offer itself is gone.
    #[must_use]
    pub fn is_offer_unavailable(&self) -> bool {
        matches!(self, Self::OfferUnavailable(_))
    }

    /// Whether retrying the same call (or the next offer) can succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::OfferUnavailable(_) | Self::Http(_) | Self::Timeout(_) => true,
            Self::Api { status, .. } => *status >= 500 || *status == 429,
            Self::NotFound(_)
            | Self::Config(_)
            | Self::Serialization(_)
            | Self::NoOffersAvailable(_) => false,
        }
    }
}

/// Instance status as reported by the provider.
///
/// `Running` only means the provider has started the container; it says
/// nothing about whether SSH accepts connections yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    /// Image is being pulled or the host is being prepared.
    Loading,
    /// Container has been created and is booting.
    Created,
    /// Provider reports the instance as running.
    Running,
    /// Instance has been stopped but still exists.
    Stopped,
    /// Instance is being destroyed.
    Exited,
    /// Unknown status.
    #[serde(other)]
    Unknown,
}

impl ProviderStatus {
    /// Whether the instance is on its way out or already gone.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Exited)
    }
}

impl std::fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Loading => write!(f, "loading"),
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Exited => write!(f, "exited"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Criteria used to search the marketplace for rentable offers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OfferQuery {
    /// GPU model name (e.g., `RTX_4090`, `H100_SXM`).
    pub gpu_name: Option<String>,
    /// Number of GPUs required.
    pub gpu_count: Option<u32>,
    /// Maximum acceptable hourly price in USD.
    pub max_hourly_rate: Option<f64>,
    /// Minimum host reliability score (0.0 - 1.0).
    pub min_reliability: Option<f64>,
    /// Minimum free disk in GB.
    pub min_disk_gb: Option<u32>,
}

/// A rentable offer returned by search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    /// Offer ID (used to provision).
    pub id: String,
    /// GPU model name.
    pub gpu_name: String,
    /// Number of GPUs.
    pub gpu_count: u32,
    /// GPU memory per card in GB.
    pub gpu_memory_gb: Option<f64>,
    /// Hourly price in USD.
    pub hourly_rate: f64,
    /// Host reliability score.
    pub reliability: Option<f64>,
    /// Available disk in GB.
    pub disk_gb: Option<f64>,
    /// Host location.
    pub location: Option<String>,
}

/// Request to provision a new instance against an offer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionRequest {
    /// Offer to rent.
    pub offer_id: String,
    /// Container image to boot.
    pub image: String,
    /// Disk size in GB.
    pub disk_gb: u32,
    /// Label correlating the instance to a pool or job for recovery.
    pub label: String,
}

/// Result of a successful provision call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionedInstance {
    /// Provider-assigned instance ID.
    pub instance_id: String,
    /// Status right after provisioning.
    pub status: ProviderStatus,
}

/// An instance as seen by the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderInstance {
    /// Provider-assigned instance ID.
    pub id: String,
    /// Current status.
    pub status: ProviderStatus,
    /// Label set at provision time.
    pub label: Option<String>,
    /// SSH host (may be a proxy host).
    pub ssh_host: Option<String>,
    /// SSH port.
    pub ssh_port: Option<u16>,
    /// Public IP address.
    pub public_ip: Option<String>,
    /// GPU model name.
    pub gpu_type: Option<String>,
    /// Hourly price in USD.
    pub hourly_rate: Option<f64>,
    /// When the instance was created.
    pub created_at: Option<DateTime<Utc>>,
}

impl ProviderInstance {
    /// SSH host and port, once the provider has assigned both.
    #[must_use]
    pub fn ssh_address(&self) -> Option<(&str, u16)> {
        match (self.ssh_host.as_deref(), self.ssh_port) {
            (Some(host), Some(port)) if !host.is_empty() => Some((host, port)),
            _ => None,
        }
    }
}

/// Trait for spot GPU marketplace providers.
#[async_trait]
pub trait InstanceProvider: Send + Sync {
    /// Search rentable offers, cheapest first.
    async fn search_offers(&self, query: &OfferQuery) -> Result<Vec<Offer>, GpuProviderError>;

    /// Provision an instance against an offer.
    async fn provision_instance(
        &self,
        req: ProvisionRequest,
    ) -> Result<ProvisionedInstance, GpuProviderError>;

    /// Get the current provider view of an instance.
    async fn get_instance_status(&self, id: &str) -> Result<ProviderInstance, GpuProviderError>;

    /// Attach an SSH public key to an instance.
    async fn attach_access_credentials(
        &self,
        id: &str,
        public_key: &str,
    ) -> Result<(), GpuProviderError>;

    /// Terminate (destroy) an instance. Terminating a missing instance is not an error.
    async fn terminate_instance(&self, id: &str) -> Result<(), GpuProviderError>;

    /// List every instance visible to the account.
    async fn list_instances(&self) -> Result<Vec<ProviderInstance>, GpuProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(GpuProviderError::OfferUnavailable("1".into()).is_retryable());
        assert!(GpuProviderError::Api {
            status: 503,
            message: String::new()
        }
        .is_retryable());
        assert!(!GpuProviderError::Api {
            status: 400,
            message: String::new()
        }
        .is_retryable());
        assert!(!GpuProviderError::NotFound("x".into()).is_retryable());
    }

    #[test]
    fn test_ssh_address_requires_host_and_port() {
        let mut instance = ProviderInstance {
            id: "1".into(),
            status: ProviderStatus::Running,
            label: None,
            ssh_host: Some("ssh4.example.com".into()),
            ssh_port: None,
            public_ip: None,
            gpu_type: None,
            hourly_rate: None,
            created_at: None,
        };
        assert!(instance.ssh_address().is_none());
        instance.ssh_port = Some(22017);
        assert_eq!(instance.ssh_address(), Some(("ssh4.example.com", 22017)));
    }
}
