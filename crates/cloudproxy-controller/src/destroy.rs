//! Destroy queue worker.
//!
//! Claims due entries, calls the provider's destroy for each on its own
//! task, then folds the results back one at a time. Failed removals are
//! retried with exponential backoff. Entries that keep failing are flagged
//! `stuck` and logged, but stay queued and keep being retried at the
//! capped interval.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::task::{self, JoinSet};
use tracing::{debug, error, info, warn};

use cloudproxy_core::ControllerConfig;
use cloudproxy_provider::{ProviderError, ProviderRegistry};
use cloudproxy_state::{DestroyQueueEntry, FleetStore, now_millis};

use crate::backoff::Backoff;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub destroyed: u32,
    pub failed: u32,
    pub stuck: u32,
}

pub struct DestroyWorker {
    store: FleetStore,
    providers: ProviderRegistry,
    backoff: Backoff,
    max_retries: u32,
    interval: Duration,
    wake: Arc<Notify>,
    /// Ticked after every successful destroy so freed seats get refilled.
    controller_wake: Arc<Notify>,
}

impl DestroyWorker {
    pub fn new(
        store: FleetStore,
        providers: ProviderRegistry,
        settings: &ControllerConfig,
        controller_wake: Arc<Notify>,
    ) -> Self {
        Self {
            store,
            providers,
            backoff: Backoff::new(
                Duration::from_millis(settings.destroy_backoff_base_ms),
                Duration::from_millis(settings.destroy_backoff_max_ms),
            ),
            max_retries: settings.destroy_max_retries,
            interval: settings.destroy_interval(),
            wake: Arc::new(Notify::new()),
            controller_wake,
        }
    }

    /// Handle for draining immediately.
    pub fn waker(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    /// Destroy every entry due at `now`.
    pub async fn drain_at(&self, now: u64) -> DrainSummary {
        let mut summary = DrainSummary::default();
        let claimed = match self.store.claim_due_destroys(now) {
            Ok(claimed) => claimed,
            Err(e) => {
                error!(error = %e, "failed to claim destroy queue entries");
                return summary;
            }
        };
        if claimed.is_empty() {
            return summary;
        }
        debug!(count = claimed.len(), "draining destroy queue");

        let mut tasks = JoinSet::new();
        // A panicking task loses its output, so keep each claim outside the
        // task to reschedule it.
        let mut claims: HashMap<task::Id, DestroyQueueEntry> = HashMap::new();
        for entry in claimed {
            let adapter = entry
                .group
                .as_ref()
                .map(|key| key.provider.clone())
                .ok_or_else(|| ProviderError::NotConfigured(format!("<unknown> for {}", entry.ip)))
                .and_then(|provider| self.providers.get(&provider));
            let ip = entry.ip.clone();
            let handle = tasks.spawn(async move {
                match adapter {
                    Ok(adapter) => adapter.destroy(&ip).await,
                    Err(e) => Err(e),
                }
            });
            claims.insert(handle.id(), entry);
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            let (id, result) = match joined {
                Ok((id, result)) => (id, result.map_err(|e| e.to_string())),
                Err(e) => {
                    error!(error = %e, "destroy task panicked");
                    (e.id(), Err(format!("destroy task failed: {e}")))
                }
            };
            let Some(entry) = claims.remove(&id) else {
                continue;
            };
            match result {
                Ok(()) => self.confirm(&entry, &mut summary),
                Err(reason) => self.reschedule(&entry, &reason, now, &mut summary),
            }
        }
        summary
    }

    fn confirm(&self, entry: &DestroyQueueEntry, summary: &mut DrainSummary) {
        match self.store.complete_destroy(&entry.ip) {
            Ok(_) => {
                let (provider, instance) = entry
                    .group
                    .as_ref()
                    .map(|k| (k.provider.as_str(), k.instance.as_str()))
                    .unwrap_or_default();
                info!(provider, instance, ip = %entry.ip, attempts = entry.attempts, "proxy destroyed");
                summary.destroyed += 1;
                self.controller_wake.notify_one();
            }
            Err(e) => error!(ip = %entry.ip, error = %e, "failed to record destroyed proxy"),
        }
    }

    fn reschedule(&self, entry: &DestroyQueueEntry, reason: &str, now: u64, summary: &mut DrainSummary) {
        let retry_at = self.backoff.retry_at(now, entry.attempts);
        match self.store.fail_destroy(&entry.ip, reason, retry_at, self.max_retries) {
            Ok(updated) if updated.stuck => {
                error!(
                    ip = %updated.ip,
                    attempts = updated.attempts,
                    error = reason,
                    retry_at,
                    "proxy removal stuck, instance may still be running"
                );
                summary.failed += 1;
                summary.stuck += 1;
            }
            Ok(updated) => {
                warn!(
                    ip = %updated.ip,
                    attempts = updated.attempts,
                    error = reason,
                    retry_at,
                    "destroy failed, will retry"
                );
                summary.failed += 1;
            }
            Err(e) => error!(ip = %entry.ip, error = %e, "failed to reschedule destroy"),
        }
    }

    /// Drain on the interval and whenever woken, until `shutdown` flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let wake = Arc::clone(&self.wake);
        info!(interval_secs = self.interval.as_secs(), "destroy worker started");

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = wake.notified() => {}
                _ = shutdown.changed() => break,
            }
            let summary = self.drain_at(now_millis()).await;
            if summary != DrainSummary::default() {
                debug!(
                    destroyed = summary.destroyed,
                    failed = summary.failed,
                    stuck = summary.stuck,
                    "destroy queue drained"
                );
            }
        }
        info!("destroy worker stopped");
    }
}
