use gpu::GpuProviderError;
use thiserror::Error;

use crate::packer::PackError;
use crate::store::StoreError;
use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Provider error: {0}")]
    Provider(#[from] GpuProviderError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Job store error: {0}")]
    Store(#[from] StoreError),

    #[error("Dataset error: {0}")]
    Dataset(#[from] PackError),

    #[error("Provisioning failed after {attempts} attempt(s): {last_error}")]
    ProvisioningExhausted { attempts: u32, last_error: String },

    #[error("Instance {instance_id} not reachable after {waited_secs}s: {reason}")]
    ReadinessTimeout {
        instance_id: String,
        waited_secs: u64,
        reason: String,
    },

    #[error("Unknown request type: {0}")]
    UnknownRequestType(String),

    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Instance {instance_id} is {status}, expected {expected}")]
    InstanceState {
        instance_id: String,
        status: String,
        expected: String,
    },

    #[error("Timed out waiting for capacity in pool `{0}`")]
    CapacityTimeout(String),

    #[error("Warm pool is shut down")]
    PoolShutdown,

    #[error("Provisioning was cancelled")]
    Cancelled,

    #[error("Workload failed: {0}")]
    Workload(String),

    #[error("Job exceeded maximum runtime of {0}s")]
    RuntimeExceeded(u64),

    #[error("Instance {0} is gone while its job was still active")]
    InstanceLost(String),

    #[error("Job abandoned: {0}")]
    Abandoned(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FleetError {
    /// Whether the failure points at the instance rather than the workload,
    /// meaning the instance should not be handed to another job.
    #[must_use]
    pub fn is_instance_fault(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_connectivity(),
            Self::ReadinessTimeout { .. } | Self::RuntimeExceeded(_) | Self::InstanceLost(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, FleetError>;
