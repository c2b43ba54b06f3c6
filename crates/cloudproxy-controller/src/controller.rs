//! Reconciliation loop — scaling, rolling recycle, and completion folding.
//!
//! One task owns all decisions. Each tick loads the rolling policy once,
//! snapshots the store, reconciles scale, then plans and commits recycle
//! selections. Provider calls run on their own tasks and report back over
//! an mpsc channel; their results are folded into the store one at a time.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, mpsc, watch};
use tracing::{debug, error, info, warn};

use cloudproxy_autoscale::{ScaleAction, reconcile_all};
use cloudproxy_core::ControllerConfig;
use cloudproxy_provider::{
    GroupSpec, ProviderAdapter, ProviderRegistry, ProviderResult, ProvisionedProxy,
};
use cloudproxy_rollout::{
    PolicyHandle, RecycleScheduler, begin_replacement, commit_selections, due_retries,
    release_stalled, replacement_failed, replacement_ready,
};
use cloudproxy_state::{
    FleetStore, GroupKey, InstanceGroup, Proxy, ProxyIp, RetireReason, now_millis,
};

use crate::backoff::Backoff;
use crate::error::ControllerResult;

/// Why an instance is being provisioned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Purpose {
    /// Bring the group up to `scaling.min`.
    Scale,
    /// Replace a retiring proxy. `attempts` counts earlier failures.
    Replace { old_ip: ProxyIp, attempts: u32 },
}

/// Result of one provider `create` call.
#[derive(Debug)]
pub struct ProvisionOutcome {
    pub key: GroupKey,
    pub purpose: Purpose,
    pub result: ProviderResult<ProvisionedProxy>,
}

/// What a tick decided.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub provisions: u32,
    pub excess: u32,
    pub selected: u32,
    pub retried: u32,
    pub released: u32,
}

enum Event {
    Tick,
    Completed(ProvisionOutcome),
    Shutdown,
}

pub struct Controller {
    store: FleetStore,
    policy: PolicyHandle,
    providers: ProviderRegistry,
    scheduler: RecycleScheduler,
    settings: ControllerConfig,
    provision_backoff: Backoff,
    completions_tx: mpsc::UnboundedSender<ProvisionOutcome>,
    completions_rx: mpsc::UnboundedReceiver<ProvisionOutcome>,
    /// Outstanding provider calls whose outcome has not been folded yet.
    outstanding: usize,
    wake: Arc<Notify>,
    destroy_wake: Option<Arc<Notify>>,
}

impl Controller {
    pub fn new(
        store: FleetStore,
        policy: PolicyHandle,
        providers: ProviderRegistry,
        settings: ControllerConfig,
    ) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let provision_backoff = Backoff::new(
            Duration::from_millis(settings.provision_backoff_base_ms),
            Duration::from_millis(settings.provision_backoff_max_ms),
        );
        Self {
            store,
            policy,
            providers,
            scheduler: RecycleScheduler::new(),
            settings,
            provision_backoff,
            completions_tx,
            completions_rx,
            outstanding: 0,
            wake: Arc::new(Notify::new()),
            destroy_wake: None,
        }
    }

    /// Nudge the destroy worker whenever something is queued.
    pub fn with_destroy_wake(mut self, wake: Arc<Notify>) -> Self {
        self.destroy_wake = Some(wake);
        self
    }

    /// Handle for triggering an immediate tick.
    pub fn waker(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    fn notify_destroyer(&self) {
        if let Some(wake) = &self.destroy_wake {
            wake.notify_one();
        }
    }

    /// Track instances the providers already run but the store does not
    /// know about. Returns how many were adopted.
    pub async fn adopt_existing(&self, now: u64) -> ControllerResult<u32> {
        let mut adopted = 0;
        for key in self.store.keys()? {
            let group = self.store.get(&key)?;
            let adapter = match self.providers.get(&key.provider) {
                Ok(adapter) => adapter,
                Err(e) => {
                    warn!(group = %key, error = %e, "skipping adoption");
                    continue;
                }
            };
            let listed = match adapter.list(&GroupSpec::from(&group)).await {
                Ok(listed) => listed,
                Err(e) => {
                    warn!(group = %key, error = %e, "failed to list provider instances");
                    continue;
                }
            };
            for instance in listed {
                if self.store.find_proxy(&instance.ip)?.is_some() {
                    continue;
                }
                let created_at = if instance.created_at == 0 { now } else { instance.created_at };
                self.store
                    .apply(&key, |g| g.add_proxy(Proxy::new(instance.ip.clone(), created_at)))?;
                info!(provider = %key.provider, instance = %key.instance, ip = %instance.ip, "adopted running proxy");
                adopted += 1;
            }
        }
        Ok(adopted)
    }

    /// Run one reconciliation pass at time `now`.
    pub fn tick_at(&mut self, now: u64) -> ControllerResult<TickSummary> {
        let policy = self.policy.load();
        let mut summary = TickSummary::default();
        let snapshot = self.store.snapshot()?;

        for (key, action) in reconcile_all(&snapshot) {
            let group = &snapshot[&key];
            match action {
                ScaleAction::Provision { count } => {
                    summary.provisions += self.scale_up(group, count, now)?;
                }
                ScaleAction::MarkExcessForRemoval { ips } => {
                    for ip in ips {
                        let queued = self
                            .store
                            .apply(&key, |g| g.prepare_removal(&ip, RetireReason::Excess, now))?;
                        if queued {
                            info!(provider = %key.provider, instance = %key.instance, %ip, "excess proxy queued for destruction");
                            summary.excess += 1;
                        }
                    }
                }
                ScaleAction::NoChange => {}
            }
        }

        summary.released = release_stalled(&self.store, &snapshot, now).len() as u32;

        for (key, ip) in due_retries(&snapshot, now) {
            if self.replace_or_reschedule(&key, &ip, now) {
                summary.retried += 1;
            }
        }

        // Plan against post-scaling state so new excess removals and
        // provisions are visible to the scheduler.
        let snapshot = self.store.snapshot()?;
        let plan = self.scheduler.plan(&snapshot, &policy.policy);
        for selection in commit_selections(&self.store, &plan, now) {
            // Committed selections must each end up with a replacement in
            // flight or a scheduled retry, so one error cannot abort the rest.
            self.replace_or_reschedule(&selection.key, &selection.ip, now);
            summary.selected += 1;
        }

        if summary.excess > 0 || summary.released > 0 {
            self.notify_destroyer();
        }
        debug!(
            policy_version = policy.version,
            provisions = summary.provisions,
            excess = summary.excess,
            selected = summary.selected,
            retried = summary.retried,
            released = summary.released,
            outstanding = self.outstanding,
            "reconciliation tick"
        );
        Ok(summary)
    }

    fn scale_up(&mut self, group: &InstanceGroup, count: u32, now: u64) -> ControllerResult<u32> {
        if group.backoff_until > now {
            debug!(group = %group.key, until = group.backoff_until, "provisioning backing off");
            return Ok(0);
        }
        let adapter = match self.providers.get(&group.key.provider) {
            Ok(adapter) => adapter,
            Err(e) => {
                warn!(group = %group.key, error = %e, "cannot provision");
                return Ok(0);
            }
        };
        self.store.apply(&group.key, |g| {
            g.provisioning += count;
            Ok(())
        })?;
        info!(provider = %group.key.provider, instance = %group.key.instance, count, "provisioning proxies");
        let spec = GroupSpec::from(group);
        for _ in 0..count {
            self.spawn_provision(Arc::clone(&adapter), spec.clone(), Purpose::Scale);
        }
        Ok(count)
    }

    /// Request a replacement; on error, record a failure due after backoff
    /// so the retry path picks the proxy up again.
    fn replace_or_reschedule(&mut self, key: &GroupKey, ip: &str, now: u64) -> bool {
        let Err(e) = self.request_replacement(key, ip, now) else {
            return true;
        };
        warn!(group = %key, %ip, error = %e, "could not request replacement");
        let retry_at = self.provision_backoff.retry_at(now, 0);
        if let Err(e) = replacement_failed(
            &self.store,
            key,
            ip,
            &e.to_string(),
            retry_at,
            self.settings.provision_max_failures,
        ) {
            error!(group = %key, %ip, error = %e, "failed to reschedule replacement");
        }
        false
    }

    fn request_replacement(&mut self, key: &GroupKey, ip: &str, now: u64) -> ControllerResult<()> {
        let group = self.store.get(key)?;
        let adapter = match self.providers.get(&key.provider) {
            Ok(adapter) => adapter,
            Err(e) => {
                let retry_at = self.provision_backoff.retry_at(now, 0);
                replacement_failed(
                    &self.store,
                    key,
                    ip,
                    &e.to_string(),
                    retry_at,
                    self.settings.provision_max_failures,
                )?;
                return Ok(());
            }
        };
        let attempts = begin_replacement(&self.store, key, ip)?;
        debug!(group = %key, %ip, attempts, "requesting replacement");
        self.spawn_provision(
            adapter,
            GroupSpec::from(&group),
            Purpose::Replace {
                old_ip: ip.to_string(),
                attempts,
            },
        );
        Ok(())
    }

    fn spawn_provision(&mut self, adapter: Arc<dyn ProviderAdapter>, spec: GroupSpec, purpose: Purpose) {
        let tx = self.completions_tx.clone();
        self.outstanding += 1;
        tokio::spawn(async move {
            let result = adapter.create(&spec).await;
            let _ = tx.send(ProvisionOutcome {
                key: spec.key,
                purpose,
                result,
            });
        });
    }

    /// Apply one provider outcome to the store.
    pub fn fold(&mut self, outcome: ProvisionOutcome, now: u64) -> ControllerResult<()> {
        self.outstanding = self.outstanding.saturating_sub(1);
        let ProvisionOutcome { key, purpose, result } = outcome;
        let max_failures = self.settings.provision_max_failures;

        match (purpose, result) {
            (Purpose::Scale, Ok(instance)) => {
                let created_at = if instance.created_at == 0 { now } else { instance.created_at };
                self.store.apply(&key, |g| {
                    g.provisioning = g.provisioning.saturating_sub(1);
                    g.provision_failures = 0;
                    g.backoff_until = 0;
                    g.degraded = false;
                    g.add_proxy(Proxy::new(instance.ip.clone(), created_at))
                })?;
                info!(provider = %key.provider, instance = %key.instance, ip = %instance.ip, "proxy provisioned");
            }
            (Purpose::Scale, Err(e)) => {
                let backoff = self.provision_backoff;
                let (failures, degraded) = self.store.apply(&key, |g| {
                    g.provisioning = g.provisioning.saturating_sub(1);
                    g.provision_failures += 1;
                    g.backoff_until = backoff.retry_at(now, g.provision_failures - 1);
                    if g.provision_failures >= max_failures {
                        g.degraded = true;
                    }
                    Ok((g.provision_failures, g.degraded))
                })?;
                if degraded {
                    error!(provider = %key.provider, instance = %key.instance, failures, error = %e, "provisioning keeps failing, group degraded");
                } else {
                    warn!(provider = %key.provider, instance = %key.instance, failures, error = %e, "provisioning failed, backing off");
                }
            }
            (Purpose::Replace { old_ip, .. }, Ok(instance)) => {
                let created_at = if instance.created_at == 0 { now } else { instance.created_at };
                replacement_ready(
                    &self.store,
                    &key,
                    &old_ip,
                    Proxy::new(instance.ip, created_at),
                    now,
                )?;
                self.notify_destroyer();
            }
            (Purpose::Replace { old_ip, attempts }, Err(e)) => {
                let retry_at = self.provision_backoff.retry_at(now, attempts);
                replacement_failed(&self.store, &key, &old_ip, &e.to_string(), retry_at, max_failures)?;
            }
        }
        Ok(())
    }

    /// Wait for every outstanding provider call and fold its outcome.
    pub async fn settle(&mut self) {
        while self.outstanding > 0 {
            let Some(outcome) = self.completions_rx.recv().await else {
                break;
            };
            if let Err(e) = self.fold(outcome, now_millis()) {
                warn!(error = %e, "failed to apply provisioning outcome");
            }
        }
    }

    fn tick_logged(&mut self) {
        if let Err(e) = self.tick_at(now_millis()) {
            error!(error = %e, "reconciliation tick failed");
        }
    }

    /// Run until `shutdown` flips. Ticks on the interval, on wake-ups, and
    /// after each folded outcome.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        match self.adopt_existing(now_millis()).await {
            Ok(0) => {}
            Ok(adopted) => info!(adopted, "adopted running proxies"),
            Err(e) => warn!(error = %e, "startup adoption failed"),
        }

        let mut interval = tokio::time::interval(self.settings.tick_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let wake = Arc::clone(&self.wake);
        info!(
            interval_secs = self.settings.tick_interval().as_secs(),
            "reconciliation loop started"
        );

        loop {
            let event = tokio::select! {
                _ = interval.tick() => Event::Tick,
                _ = wake.notified() => Event::Tick,
                Some(outcome) = self.completions_rx.recv() => Event::Completed(outcome),
                _ = shutdown.changed() => Event::Shutdown,
            };
            match event {
                Event::Tick => self.tick_logged(),
                Event::Completed(outcome) => {
                    if let Err(e) = self.fold(outcome, now_millis()) {
                        warn!(error = %e, "failed to apply provisioning outcome");
                    }
                    self.tick_logged();
                }
                Event::Shutdown => break,
            }
        }

        if self.outstanding > 0 {
            info!(outstanding = self.outstanding, "waiting for in-flight provisioning");
            let grace = self.settings.tick_interval();
            if tokio::time::timeout(grace, self.settle()).await.is_err() {
                warn!(outstanding = self.outstanding, "in-flight provisioning abandoned at shutdown");
            }
        }
        info!("reconciliation loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudproxy_provider::SimulatedProvider;
    use cloudproxy_rollout::{PolicyPatch, RollingPolicy};
    use cloudproxy_state::{ProxyState, Scaling};

    use crate::destroy::DestroyWorker;

    fn key() -> GroupKey {
        GroupKey::new("sim", "default")
    }

    fn settings() -> ControllerConfig {
        ControllerConfig {
            provision_backoff_base_ms: 1_000,
            provision_backoff_max_ms: 10_000,
            provision_max_failures: 2,
            ..ControllerConfig::default()
        }
    }

    struct Fixture {
        store: FleetStore,
        policy: PolicyHandle,
        sim: Arc<SimulatedProvider>,
        controller: Controller,
        destroyer: DestroyWorker,
    }

    fn fixture(scaling: Scaling, seeded: u32) -> Fixture {
        let store = FleetStore::open_in_memory().unwrap();
        let mut group = InstanceGroup::new(key(), scaling);
        for i in 0..seeded {
            group
                .add_proxy(Proxy::new(format!("192.168.0.{}", i + 1), 100 + i as u64))
                .unwrap();
        }
        store.declare(group).unwrap();

        let sim = Arc::new(SimulatedProvider::new("sim", 9));
        let mut providers = ProviderRegistry::new();
        providers.register(sim.clone());

        let policy = PolicyHandle::new(RollingPolicy::default()).unwrap();
        let controller = Controller::new(store.clone(), policy.clone(), providers.clone(), settings());
        let destroyer = DestroyWorker::new(store.clone(), providers, &settings(), controller.waker());
        Fixture {
            store,
            policy,
            sim,
            controller,
            destroyer,
        }
    }

    fn enable_rolling(policy: &PolicyHandle, min_available: u32, batch_size: u32) {
        policy
            .update(&PolicyPatch {
                enabled: Some(true),
                min_available: Some(min_available),
                batch_size: Some(batch_size),
            })
            .unwrap();
    }

    #[tokio::test]
    async fn provisions_missing_proxies() {
        let mut f = fixture(Scaling { min: 3, max: 3 }, 1);
        let summary = f.controller.tick_at(now_millis()).unwrap();
        assert_eq!(summary.provisions, 2);
        assert_eq!(f.store.get(&key()).unwrap().provisioning, 2);

        // In-flight provisions count as live: no double provisioning.
        let again = f.controller.tick_at(now_millis()).unwrap();
        assert_eq!(again.provisions, 0);

        f.controller.settle().await;
        let group = f.store.get(&key()).unwrap();
        assert_eq!(group.active_count(), 3);
        assert_eq!(group.provisioning, 0);
        assert_eq!(f.sim.created().len(), 2);
    }

    #[tokio::test]
    async fn provisioning_failure_backs_off_then_degrades() {
        let mut f = fixture(Scaling { min: 1, max: 1 }, 0);
        f.sim.fail_next_creates(2);
        let now = now_millis();

        f.controller.tick_at(now).unwrap();
        f.controller.settle().await;
        let group = f.store.get(&key()).unwrap();
        assert_eq!(group.provision_failures, 1);
        assert!(group.backoff_until > now);
        assert!(!group.degraded);

        // Still backing off.
        assert_eq!(f.controller.tick_at(now).unwrap().provisions, 0);

        let later = group.backoff_until;
        assert_eq!(f.controller.tick_at(later).unwrap().provisions, 1);
        f.controller.settle().await;
        assert!(f.store.get(&key()).unwrap().degraded);

        let group = f.store.get(&key()).unwrap();
        f.controller.tick_at(group.backoff_until).unwrap();
        f.controller.settle().await;
        let group = f.store.get(&key()).unwrap();
        assert_eq!(group.active_count(), 1);
        assert!(!group.degraded);
        assert_eq!(group.provision_failures, 0);
    }

    #[tokio::test]
    async fn disabled_group_is_drained() {
        let mut f = fixture(Scaling { min: 2, max: 2 }, 2);
        f.store
            .apply(&key(), |g| {
                g.enabled = false;
                Ok(())
            })
            .unwrap();

        let summary = f.controller.tick_at(now_millis()).unwrap();
        assert_eq!(summary.excess, 2);
        assert_eq!(summary.provisions, 0);

        let drained = f.destroyer.drain_at(now_millis()).await;
        assert_eq!(drained.destroyed, 2);
        assert!(f.store.get(&key()).unwrap().proxies.is_empty());
    }

    #[tokio::test]
    async fn excess_proxies_removed_newest_first() {
        let mut f = fixture(Scaling { min: 1, max: 2 }, 3);
        f.controller.tick_at(now_millis()).unwrap();

        let queue = f.store.list_destroy_queue().unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].ip, "192.168.0.3");
    }

    #[tokio::test]
    async fn rolling_recycle_keeps_floor_and_ceiling() {
        let mut f = fixture(Scaling { min: 5, max: 5 }, 5);
        enable_rolling(&f.policy, 3, 2);

        let summary = f.controller.tick_at(now_millis()).unwrap();
        assert_eq!(summary.selected, 2);
        let group = f.store.get(&key()).unwrap();
        assert_eq!(group.active_count(), 3);
        assert_eq!(group.in_state(ProxyState::Recycling).len(), 2);
        // Rotating proxies hold their seats: nothing extra provisioned.
        assert_eq!(summary.provisions, 0);

        // A second tick while replacements are in flight does nothing.
        let again = f.controller.tick_at(now_millis()).unwrap();
        assert_eq!(again, TickSummary::default());

        f.controller.settle().await;
        let group = f.store.get(&key()).unwrap();
        assert_eq!(group.active_count(), 5);
        assert_eq!(group.rotating_count(), 2);
        assert_eq!(f.store.list_destroy_queue().unwrap().len(), 2);

        // Ceiling holds until the originals are actually destroyed.
        assert_eq!(f.controller.tick_at(now_millis()).unwrap().selected, 0);

        let drained = f.destroyer.drain_at(now_millis()).await;
        assert_eq!(drained.destroyed, 2);
        let group = f.store.get(&key()).unwrap();
        assert_eq!(group.active_count(), 5);
        assert_eq!(group.rotating_count(), 0);

        assert_eq!(f.controller.tick_at(now_millis()).unwrap().selected, 2);
    }

    #[tokio::test]
    async fn failed_replacement_halts_group_until_retry_succeeds() {
        let mut f = fixture(Scaling { min: 5, max: 5 }, 5);
        enable_rolling(&f.policy, 3, 1);
        f.sim.fail_next_creates(1);

        let now = now_millis();
        f.controller.tick_at(now).unwrap();
        f.controller.settle().await;

        let group = f.store.get(&key()).unwrap();
        assert!(group.recycle_halted());
        assert_eq!(group.in_state(ProxyState::Recycling).len(), 1);
        assert!(f.store.list_destroy_queue().unwrap().is_empty());

        // Before the retry is due nothing happens.
        assert_eq!(f.controller.tick_at(now).unwrap(), TickSummary::default());

        let later = now + 60_000;
        let summary = f.controller.tick_at(later).unwrap();
        assert_eq!(summary.retried, 1);
        f.controller.settle().await;
        let group = f.store.get(&key()).unwrap();
        assert!(!group.recycle_halted());
        assert_eq!(group.active_count(), 5);
        assert_eq!(f.store.list_destroy_queue().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn restart_mid_provision_recovers_fleet() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.redb");
        let registry = |sim: SimulatedProvider| {
            let mut providers = ProviderRegistry::new();
            providers.register(Arc::new(sim));
            providers
        };

        {
            let store = FleetStore::open(&path).unwrap();
            let mut group = InstanceGroup::new(key(), Scaling { min: 5, max: 5 });
            for i in 0..3u64 {
                group
                    .add_proxy(Proxy::new(format!("192.168.0.{}", i + 1), 100 + i))
                    .unwrap();
            }
            store.declare(group).unwrap();

            let policy = PolicyHandle::new(RollingPolicy::default()).unwrap();
            enable_rolling(&policy, 1, 1);
            let slow = SimulatedProvider::new("sim", 9).with_latency(Duration::from_secs(3600));
            let mut controller = Controller::new(store, policy, registry(slow), settings());
            let summary = controller.tick_at(now_millis()).unwrap();
            assert_eq!(summary.provisions, 2);
            assert_eq!(summary.selected, 1);
            // Process goes away with every provider call still in flight.
        }

        let store = FleetStore::open(&path).unwrap();
        let policy = PolicyHandle::new(RollingPolicy::default()).unwrap();
        enable_rolling(&policy, 1, 1);
        let mut controller = Controller::new(
            store.clone(),
            policy,
            registry(SimulatedProvider::new("sim", 9)),
            settings(),
        );

        let summary = controller.tick_at(now_millis()).unwrap();
        assert_eq!(summary.provisions, 2);
        assert_eq!(summary.retried, 1);
        controller.settle().await;

        let group = store.get(&key()).unwrap();
        assert_eq!(group.active_count(), 5);
        assert_eq!(group.provisioning, 0);
        assert!(!group.recycle_halted());
        assert_eq!(store.list_destroy_queue().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn disabling_group_rolling_releases_stalled_proxy() {
        let mut f = fixture(Scaling { min: 3, max: 3 }, 3);
        enable_rolling(&f.policy, 1, 1);
        f.sim.fail_next_creates(1);

        f.controller.tick_at(now_millis()).unwrap();
        f.controller.settle().await;
        f.store
            .apply(&key(), |g| {
                g.rolling_enabled = false;
                Ok(())
            })
            .unwrap();

        let summary = f.controller.tick_at(now_millis()).unwrap();
        assert_eq!(summary.released, 1);
        assert_eq!(f.store.list_destroy_queue().unwrap().len(), 1);

        // The freed seat is refilled by the reconciler.
        let summary = f.controller.tick_at(now_millis()).unwrap();
        assert_eq!(summary.provisions, 1);
        f.controller.settle().await;
        assert_eq!(f.store.get(&key()).unwrap().active_count(), 3);
    }

    #[tokio::test]
    async fn restart_replaces_proxy_with_policy_disabled() {
        let mut f = fixture(Scaling { min: 2, max: 2 }, 2);
        assert!(f.store.request_restart("192.168.0.1").unwrap());

        let summary = f.controller.tick_at(now_millis()).unwrap();
        assert_eq!(summary.selected, 1);
        f.controller.settle().await;
        f.destroyer.drain_at(now_millis()).await;

        let group = f.store.get(&key()).unwrap();
        assert!(!group.proxies.contains_key("192.168.0.1"));
        assert_eq!(group.active_count(), 2);
        assert!(f.store.list_restart_queue().unwrap().is_empty());
    }

    #[tokio::test]
    async fn adopts_instances_already_running() {
        let f = fixture(Scaling { min: 2, max: 2 }, 0);
        f.sim.seed(&key(), "10.9.1.1");
        f.sim.seed(&key(), "10.9.1.2");

        assert_eq!(f.controller.adopt_existing(now_millis()).await.unwrap(), 2);
        assert_eq!(f.controller.adopt_existing(now_millis()).await.unwrap(), 0);
        assert_eq!(f.store.get(&key()).unwrap().active_count(), 2);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let f = fixture(Scaling { min: 1, max: 1 }, 0);
        let store = f.store.clone();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(f.controller.run(rx));

        // First interval tick fires immediately.
        for _ in 0..50 {
            if store.get(&key()).unwrap().active_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.get(&key()).unwrap().active_count(), 1);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
