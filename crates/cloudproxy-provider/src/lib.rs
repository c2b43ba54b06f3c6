//! cloudproxy-provider — the boundary to cloud provisioning APIs.
//!
//! The controller never talks to a cloud directly. It calls a
//! [`ProviderAdapter`] looked up by provider name in a
//! [`ProviderRegistry`]. [`SimulatedProvider`] is an in-process adapter
//! used when no real cloud backend is wired in.

pub mod adapter;
pub mod simulated;

pub use adapter::{
    GroupSpec, ProviderAdapter, ProviderError, ProviderRegistry, ProviderResult, ProvisionedProxy,
};
pub use simulated::SimulatedProvider;
