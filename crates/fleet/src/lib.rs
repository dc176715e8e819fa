//! Spot GPU fleet orchestration.
//!
//! Runs bursty training and inference jobs on rented, per-second-billed GPU
//! instances while keeping idle spend low and never leaving an instance
//! running unaccounted for.
//!
//! ## Architecture
//!
//! ```text
//!              ┌──────────────┐   decisions   ┌──────────────┐
//!  job queue ─►│  Scheduler   │──────────────►│  Dispatcher  │
//!  (JobStore)  └──────┬───────┘               └──────┬───────┘
//!                     │ idle instances               │ request / claim
//!              ┌──────▼───────┐  launch/ready ┌──────▼───────┐
//!              │  Warm pools  │◄──────────────│ Provisioner  │
//!              └──────┬───────┘               └──────────────┘
//!                     │ release / retire
//!              ┌──────▼───────┐   ssh / scp   ┌──────────────┐
//!              │ Job executor │──────────────►│   Instance   │
//!              └──────────────┘               └──────────────┘
//!
//!              ┌──────────────┐  list / terminate (own timer)
//!              │   Sweeper    │──────────────► provider
//!              └──────────────┘
//! ```
//!
//! The provider contract lives in the `gpu` crate.

pub mod config;
pub mod cost;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod models;
pub mod packer;
pub mod pool;
pub mod provision;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod sweeper;
pub mod transport;
pub mod workload;

pub use config::FleetConfig;
pub use dispatch::{DispatchConfig, Dispatcher};
pub use error::{FleetError, Result};
pub use executor::{
    ExecutionReport, ExecutorConfig, InstanceContext, InstanceRelease, JobExecutor,
    TerminateOnRelease,
};
pub use models::{Instance, InstanceStatus, Job, JobProgress, JobStatus, ResourceUsage, SshEndpoint};
pub use packer::{DatasetPacker, Manifest, PackError, PackedDataset};
pub use pool::{PoolGrant, PoolPolicy, RequestOptions, WarmPoolManager};
pub use provision::{ProvisionConfig, Provisioner};
pub use retry::RetryPolicy;
pub use scheduler::{FleetScheduler, ScheduleDecision};
pub use store::{JobOutcome, JobStore, LocalJobStore, StoreError};
pub use sweeper::{InstanceSweeper, SweepMode, SweepReason, SweepReport, SweeperConfig, SweptJob};
pub use transport::{RemoteTransport, TransportError, TransportFactory};
pub use workload::{WorkloadCatalog, WorkloadKind, WorkloadProfile};
