//! Provider adapter trait and registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use cloudproxy_state::{GroupKey, InstanceGroup, Placement};

pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider {0} is not configured")]
    NotConfigured(String),

    #[error("{provider} API error: {message}")]
    Api { provider: String, message: String },

    #[error("{provider} quota exhausted for {group}")]
    Quota { provider: String, group: GroupKey },
}

/// What an adapter needs to know to provision into a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSpec {
    pub key: GroupKey,
    pub placement: Placement,
    pub size: Option<String>,
}

impl From<&InstanceGroup> for GroupSpec {
    fn from(group: &InstanceGroup) -> Self {
        Self {
            key: group.key.clone(),
            placement: group.placement.clone(),
            size: group.size.clone(),
        }
    }
}

/// A running instance as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedProxy {
    pub ip: String,
    /// Unix millis.
    pub created_at: u64,
}

/// Capability to list, create, and destroy proxy instances for one provider.
///
/// `create` resolves once the instance is reachable, so the returned proxy
/// can be tracked as `active` straight away. `destroy` of an instance the
/// provider no longer knows about succeeds.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &str;
    async fn list(&self, group: &GroupSpec) -> ProviderResult<Vec<ProvisionedProxy>>;
    async fn create(&self, group: &GroupSpec) -> ProviderResult<ProvisionedProxy>;
    async fn destroy(&self, ip: &str) -> ProviderResult<()>;
}

/// Adapters keyed by provider name.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    pub fn get(&self, provider: &str) -> ProviderResult<Arc<dyn ProviderAdapter>> {
        self.adapters
            .get(provider)
            .cloned()
            .ok_or_else(|| ProviderError::NotConfigured(provider.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.adapters.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
