//! cloudproxy-core — configuration shared by every CloudProxy crate.
//!
//! The daemon reads a single `cloudproxy.toml` describing proxy
//! credentials, the rolling recycle policy, controller timings, and the
//! declared instance groups per provider.

pub mod config;

pub use config::{
    AuthConfig, ConfigError, ControllerConfig, FleetConfig, InstanceConfig, ProviderConfig,
    RollingConfig, PROXY_PORT,
};
