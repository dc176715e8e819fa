//! Vast.ai marketplace API models.
//!
//! Only the fields the fleet consumes are modelled; everything else in the
//! (large) payloads is ignored.

use serde::{Deserialize, Serialize};

// ============================================================================
// Offers
// ============================================================================

/// Response of the offer search endpoint.
#[derive(Debug, Deserialize)]
pub struct OfferSearchResponse {
    /// Matching offers.
    #[serde(default)]
    pub offers: Vec<OfferResource>,
}

/// A marketplace offer ("bundle").
#[derive(Debug, Deserialize)]
pub struct OfferResource {
    /// Offer (ask) ID.
    pub id: u64,
    /// GPU model name.
    pub gpu_name: Option<String>,
    /// Number of GPUs.
    pub num_gpus: Option<u32>,
    /// GPU RAM per card in MB.
    pub gpu_ram: Option<f64>,
    /// Total hourly price in USD.
    pub dph_total: Option<f64>,
    /// Host reliability score.
    #[serde(alias = "reliability")]
    pub reliability2: Option<f64>,
    /// Free disk space in GB.
    pub disk_space: Option<f64>,
    /// Host location.
    pub geolocation: Option<String>,
}

// ============================================================================
// Instances
// ============================================================================

/// Body for renting an offer.
#[derive(Debug, Serialize)]
pub struct CreateInstanceBody {
    /// Always `me`.
    pub client_id: String,
    /// Docker image.
    pub image: String,
    /// Disk size in GB.
    pub disk: u32,
    /// Free-form label.
    pub label: String,
    /// Launch mode (`ssh` for direct SSH access).
    pub runtype: String,
}

/// Response of the rent endpoint.
#[derive(Debug, Deserialize)]
pub struct CreateInstanceResponse {
    /// Whether the rental succeeded.
    #[serde(default)]
    pub success: bool,
    /// New instance ID.
    pub new_contract: Option<u64>,
    /// Error code on failure.
    pub error: Option<String>,
    /// Error message on failure.
    pub msg: Option<String>,
}

/// Response of the single-instance endpoint.
#[derive(Debug, Deserialize)]
pub struct InstanceResponse {
    /// The instance, absent if it no longer exists.
    pub instances: Option<InstanceResource>,
}

/// Response of the instance listing endpoint.
#[derive(Debug, Deserialize)]
pub struct InstanceListResponse {
    /// All instances on the account.
    #[serde(default)]
    pub instances: Vec<InstanceResource>,
}

/// An instance resource.
#[derive(Debug, Deserialize)]
pub struct InstanceResource {
    /// Instance ID.
    pub id: u64,
    /// Actual container status (`loading`, `running`, `exited`, ...).
    pub actual_status: Option<String>,
    /// Label set at rental time.
    pub label: Option<String>,
    /// SSH proxy host.
    pub ssh_host: Option<String>,
    /// SSH proxy port.
    pub ssh_port: Option<u16>,
    /// Public IP of the host.
    pub public_ipaddr: Option<String>,
    /// GPU model name.
    pub gpu_name: Option<String>,
    /// Total hourly price in USD.
    pub dph_total: Option<f64>,
    /// Start time as a UNIX timestamp (seconds, fractional).
    pub start_date: Option<f64>,
}

/// Body for attaching an SSH key.
#[derive(Debug, Serialize)]
pub struct AttachSshKeyBody {
    /// Public key in OpenSSH format.
    pub ssh_key: String,
}
