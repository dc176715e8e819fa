//! Vast.ai spot GPU marketplace provider.
//!
//! Implements the [`InstanceProvider`](crate::providers::traits::InstanceProvider)
//! trait against the Vast.ai REST API.
//!
//! ## Example
//!
//! ```ignore
//! use gpu::providers::vast::VastAi;
//! use gpu::providers::traits::{InstanceProvider, OfferQuery};
//!
//! let provider = VastAi::new(api_key)?;
//!
//! let offers = provider.search_offers(&OfferQuery {
//!     gpu_name: Some("RTX_4090".to_string()),
//!     max_hourly_rate: Some(0.6),
//!     ..Default::default()
//! }).await?;
//! ```

mod client;
mod models;

pub use client::VastAi;
pub use models::*;
