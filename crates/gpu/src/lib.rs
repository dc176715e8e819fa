//! Spot GPU instance provider contract.
//!
//! This crate defines the narrow contract the fleet orchestrator consumes
//! from a spot GPU marketplace: search offers, provision, poll status,
//! attach access credentials, terminate, and list.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────┐        ┌─────────────────────────┐
//! │        Fleet Orchestrator    │        │   Spot GPU Marketplace  │
//! │  • warm pools                │  HTTP  │   • offers (bundles)    │
//! │  • scheduler / executor      │───────►│   • instances           │
//! │  • sweeper                   │        │   • per-second billing  │
//! └──────────────────────────────┘        └─────────────────────────┘
//! ```
//!
//! Provider status is never trusted as an SSH-readiness signal; callers
//! verify reachability themselves.
//!
//! ## Supported Providers
//!
//! - **Vast.ai** - consumer and datacenter GPUs rented per second
//!
//! ## Example
//!
//! ```ignore
//! use gpu::providers::vast::VastAi;
//! use gpu::{InstanceProvider, ProvisionRequest};
//!
//! let provider = VastAi::new(api_key)?;
//! let offers = provider.search_offers(&Default::default()).await?;
//!
//! let instance = provider.provision_instance(ProvisionRequest {
//!     offer_id: offers[0].id.clone(),
//!     image: "pytorch/pytorch:latest".to_string(),
//!     disk_gb: 40,
//!     label: "fleet-train-1".to_string(),
//! }).await?;
//!
//! // Terminate when done
//! provider.terminate_instance(&instance.instance_id).await?;
//! ```

pub mod providers;

pub use providers::vast;
pub use providers::traits::{
    GpuProviderError, InstanceProvider, Offer, OfferQuery, ProviderInstance, ProviderStatus,
    ProvisionRequest, ProvisionedInstance,
};
