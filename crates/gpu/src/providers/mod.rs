//! Instance provider implementations.
//!
//! This module contains the [`InstanceProvider`] trait and the spot
//! marketplace adapters implementing it.

pub mod traits;
pub mod vast;

pub use traits::{
    GpuProviderError, InstanceProvider, Offer, OfferQuery, ProviderInstance, ProviderStatus,
    ProvisionRequest, ProvisionedInstance,
};
