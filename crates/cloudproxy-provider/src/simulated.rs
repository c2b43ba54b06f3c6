//! In-process provider that hands out private addresses.
//!
//! Keeps its own record of live instances per group so adoption, scaling,
//! and destroy paths can be exercised end to end without a cloud account.
//! Failures can be injected for creates and for destroys of specific IPs.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use cloudproxy_state::{GroupKey, now_millis};

use crate::adapter::{GroupSpec, ProviderAdapter, ProviderError, ProviderResult, ProvisionedProxy};

#[derive(Default)]
struct SimState {
    next_host: u32,
    live: BTreeMap<GroupKey, BTreeSet<String>>,
    fail_creates: u32,
    failing_destroys: HashSet<String>,
    created: Vec<String>,
    destroyed: Vec<String>,
}

pub struct SimulatedProvider {
    name: String,
    network: u8,
    latency: Option<Duration>,
    state: Mutex<SimState>,
}

impl SimulatedProvider {
    /// Addresses are allocated from `10.{network}.0.0/16`.
    pub fn new(name: impl Into<String>, network: u8) -> Self {
        Self {
            name: name.into(),
            network,
            latency: None,
            state: Mutex::new(SimState::default()),
        }
    }

    /// Delay every call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn allocate(&self, state: &mut SimState) -> String {
        state.next_host += 1;
        let host = state.next_host;
        format!("10.{}.{}.{}", self.network, (host >> 8) & 0xff, host & 0xff)
    }

    /// Register an instance that already exists before the controller starts.
    pub fn seed(&self, key: &GroupKey, ip: impl Into<String>) {
        self.state().live.entry(key.clone()).or_default().insert(ip.into());
    }

    /// Fail the next `n` create calls.
    pub fn fail_next_creates(&self, n: u32) {
        self.state().fail_creates = n;
    }

    /// Fail every destroy of `ip` until [`heal_destroy`](Self::heal_destroy).
    pub fn fail_destroy(&self, ip: impl Into<String>) {
        self.state().failing_destroys.insert(ip.into());
    }

    pub fn heal_destroy(&self, ip: &str) {
        self.state().failing_destroys.remove(ip);
    }

    /// Live instances in one group.
    pub fn live(&self, key: &GroupKey) -> Vec<String> {
        self.state()
            .live
            .get(key)
            .map(|ips| ips.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every IP handed out by `create`, in order.
    pub fn created(&self) -> Vec<String> {
        self.state().created.clone()
    }

    /// Every IP successfully destroyed, in order.
    pub fn destroyed(&self) -> Vec<String> {
        self.state().destroyed.clone()
    }
}

#[async_trait]
impl ProviderAdapter for SimulatedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list(&self, group: &GroupSpec) -> ProviderResult<Vec<ProvisionedProxy>> {
        self.simulate_latency().await;
        Ok(self
            .live(&group.key)
            .into_iter()
            .map(|ip| ProvisionedProxy { ip, created_at: 0 })
            .collect())
    }

    async fn create(&self, group: &GroupSpec) -> ProviderResult<ProvisionedProxy> {
        self.simulate_latency().await;
        let mut state = self.state();
        if state.fail_creates > 0 {
            state.fail_creates -= 1;
            return Err(ProviderError::Api {
                provider: self.name.clone(),
                message: format!("injected create failure for {}", group.key),
            });
        }
        let ip = self.allocate(&mut state);
        state.live.entry(group.key.clone()).or_default().insert(ip.clone());
        state.created.push(ip.clone());
        debug!(provider = %self.name, group = %group.key, %ip, "simulated instance created");
        Ok(ProvisionedProxy {
            ip,
            created_at: now_millis(),
        })
    }

    async fn destroy(&self, ip: &str) -> ProviderResult<()> {
        self.simulate_latency().await;
        let mut state = self.state();
        if state.failing_destroys.contains(ip) {
            return Err(ProviderError::Api {
                provider: self.name.clone(),
                message: format!("injected destroy failure for {ip}"),
            });
        }
        for ips in state.live.values_mut() {
            ips.remove(ip);
        }
        state.destroyed.push(ip.to_string());
        debug!(provider = %self.name, %ip, "simulated instance destroyed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudproxy_state::Placement;

    fn spec() -> GroupSpec {
        GroupSpec {
            key: GroupKey::new("sim", "default"),
            placement: Placement::default(),
            size: None,
        }
    }

    #[tokio::test]
    async fn create_allocates_distinct_addresses() {
        let provider = SimulatedProvider::new("sim", 7);
        let a = provider.create(&spec()).await.unwrap();
        let b = provider.create(&spec()).await.unwrap();
        assert_eq!(a.ip, "10.7.0.1");
        assert_eq!(b.ip, "10.7.0.2");
        assert_eq!(provider.live(&spec().key), vec!["10.7.0.1", "10.7.0.2"]);
    }

    #[tokio::test]
    async fn injected_create_failures_are_consumed() {
        let provider = SimulatedProvider::new("sim", 1);
        provider.fail_next_creates(1);
        assert!(provider.create(&spec()).await.is_err());
        assert!(provider.create(&spec()).await.is_ok());
        assert_eq!(provider.created().len(), 1);
    }

    #[tokio::test]
    async fn destroy_failure_until_healed() {
        let provider = SimulatedProvider::new("sim", 1);
        let proxy = provider.create(&spec()).await.unwrap();
        provider.fail_destroy(proxy.ip.clone());
        assert!(provider.destroy(&proxy.ip).await.is_err());
        assert_eq!(provider.live(&spec().key).len(), 1);

        provider.heal_destroy(&proxy.ip);
        provider.destroy(&proxy.ip).await.unwrap();
        assert!(provider.live(&spec().key).is_empty());
        assert_eq!(provider.destroyed(), vec![proxy.ip]);
    }

    #[tokio::test]
    async fn list_reports_seeded_instances() {
        let provider = SimulatedProvider::new("sim", 1);
        provider.seed(&spec().key, "10.1.9.9");
        let listed = provider.list(&spec()).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].ip, "10.1.9.9");
    }

    #[tokio::test(start_paused = true)]
    async fn latency_is_simulated() {
        let provider = SimulatedProvider::new("sim", 1).with_latency(Duration::from_secs(30));
        let start = tokio::time::Instant::now();
        provider.create(&spec()).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(30));
    }
}
