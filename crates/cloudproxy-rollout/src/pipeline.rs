//! Retirement pipeline — moves selected proxies through
//! `pending_recycle → recycling → terminated` against the store.
//!
//! ```text
//! select            active → pending_recycle        (replacement pending)
//! begin_replacement pending_recycle → recycling     (provision requested)
//! replacement_ready new proxy active, original queued for destroy
//! replacement_failed original stays recycling, group halted, retried later
//! ```

use std::collections::BTreeMap;

use tracing::{debug, error, info, warn};

use cloudproxy_state::{
    FleetSnapshot, FleetStore, GroupKey, Proxy, ProxyIp, ProxyState, Replacement, RetireReason,
    StateError, StateResult,
};

use crate::scheduler::{RecyclePlan, Selection};

/// Commit a plan. Selections are applied per group against the revision
/// they were planned from; a group that moved in the meantime is skipped
/// and picked up again next tick.
pub fn commit_selections(store: &FleetStore, plan: &RecyclePlan, now: u64) -> Vec<Selection> {
    let mut by_group: BTreeMap<&GroupKey, Vec<&Selection>> = BTreeMap::new();
    for sel in &plan.selections {
        by_group.entry(&sel.key).or_default().push(sel);
    }

    let mut committed = Vec::new();
    for (key, selections) in by_group {
        let revision = selections[0].revision;
        let result = store.apply_at(key, revision, |group| {
            for sel in &selections {
                group.begin_retirement(&sel.ip, sel.reason, now)?;
                group.proxy_mut(&sel.ip)?.restart_requested = false;
            }
            Ok(())
        });
        match result {
            Ok(()) => {
                for sel in selections {
                    info!(
                        provider = %key.provider,
                        instance = %key.instance,
                        ip = %sel.ip,
                        reason = ?sel.reason,
                        "proxy selected for recycling"
                    );
                    committed.push(sel.clone());
                }
            }
            Err(StateError::Conflict(msg)) => {
                debug!(group = %key, %msg, "group changed since planning, retrying next tick");
            }
            Err(e) => {
                warn!(group = %key, error = %e, "failed to commit recycle selections");
            }
        }
    }
    committed
}

/// Request (or re-request) the replacement for a retiring proxy.
///
/// Returns the number of earlier failed attempts.
pub fn begin_replacement(store: &FleetStore, key: &GroupKey, ip: &str) -> StateResult<u32> {
    store.apply(key, |group| {
        if group.proxy(ip)?.state == ProxyState::PendingRecycle {
            group.mark_recycling(ip)?;
        }
        let retirement = group
            .proxy_mut(ip)?
            .retirement
            .as_mut()
            .filter(|r| r.reason.needs_replacement())
            .ok_or_else(|| StateError::Validation(format!("proxy {ip} is not awaiting replacement")))?;
        let attempts = match &retirement.replacement {
            Replacement::Pending { attempts } | Replacement::Failed { attempts, .. } => *attempts,
            Replacement::Ready { .. } | Replacement::NotNeeded => {
                return Err(StateError::Validation(format!(
                    "proxy {ip} has no outstanding replacement"
                )));
            }
        };
        retirement.replacement = Replacement::Pending { attempts };
        Ok(attempts)
    })
}

/// The replacement is active: track it, and queue the original for
/// destruction.
pub fn replacement_ready(
    store: &FleetStore,
    key: &GroupKey,
    old_ip: &str,
    replacement: Proxy,
    now: u64,
) -> StateResult<()> {
    let new_ip = replacement.ip.clone();
    store.apply(key, |group| {
        group.add_proxy(replacement)?;
        group.provision_failures = 0;
        group.degraded = false;

        let Some(old) = group.proxies.get_mut(old_ip) else {
            // Original was destroyed by the operator while we provisioned.
            return Ok(());
        };
        let reason = match old.retirement.as_mut() {
            Some(retirement) => {
                retirement.replacement = Replacement::Ready { ip: new_ip.clone() };
                retirement.reason
            }
            None => RetireReason::Rotation,
        };
        group.prepare_removal(old_ip, reason, now)?;
        Ok(())
    })?;
    info!(
        provider = %key.provider,
        instance = %key.instance,
        old_ip,
        new_ip = %new_ip,
        "replacement active, original queued for destruction"
    );
    Ok(())
}

/// Record a failed replacement. The original stays `recycling` and the
/// group stops taking new selections until a retry succeeds.
///
/// Returns whether the group is now degraded.
pub fn replacement_failed(
    store: &FleetStore,
    key: &GroupKey,
    old_ip: &str,
    reason: &str,
    retry_at: u64,
    max_failures: u32,
) -> StateResult<bool> {
    let (attempts, degraded) = store.apply(key, |group| {
        group.provision_failures += 1;
        if group.provision_failures >= max_failures {
            group.degraded = true;
        }
        let failures = group.provision_failures;
        let degraded = group.degraded;
        let Some(retirement) = group
            .proxies
            .get_mut(old_ip)
            .and_then(|p| p.retirement.as_mut())
        else {
            return Ok((failures, degraded));
        };
        let attempts = match &retirement.replacement {
            Replacement::Pending { attempts } | Replacement::Failed { attempts, .. } => attempts + 1,
            _ => 1,
        };
        retirement.replacement = Replacement::Failed {
            attempts,
            retry_at,
            error: reason.to_string(),
        };
        Ok((attempts, degraded))
    })?;

    if degraded {
        error!(
            provider = %key.provider,
            instance = %key.instance,
            ip = old_ip,
            attempts,
            error = reason,
            "replacement provisioning keeps failing, group degraded"
        );
    } else {
        warn!(
            provider = %key.provider,
            instance = %key.instance,
            ip = old_ip,
            attempts,
            error = reason,
            retry_at,
            "replacement provisioning failed, recycling halted for group"
        );
    }
    Ok(degraded)
}

/// Failed replacements whose backoff has elapsed, in groups still
/// enabled and rolling.
pub fn due_retries(snapshot: &FleetSnapshot, now: u64) -> Vec<(GroupKey, ProxyIp)> {
    let mut due = Vec::new();
    for group in snapshot.values().filter(|g| g.enabled && g.rolling_enabled) {
        for proxy in group.proxies.values() {
            if let Some(retirement) = &proxy.retirement
                && let Replacement::Failed { retry_at, .. } = &retirement.replacement
                && *retry_at <= now
            {
                due.push((group.key.clone(), proxy.ip.clone()));
            }
        }
    }
    due
}

/// In groups with rolling (or the group itself) disabled, give up on failed
/// replacements: the stalled original goes to the destroy queue and its
/// seat is freed for the reconciler.
pub fn release_stalled(store: &FleetStore, snapshot: &FleetSnapshot, now: u64) -> Vec<ProxyIp> {
    let mut released = Vec::new();
    for group in snapshot.values().filter(|g| !g.enabled || !g.rolling_enabled) {
        let stalled: Vec<(ProxyIp, RetireReason)> = group
            .proxies
            .values()
            .filter_map(|p| {
                let retirement = p.retirement.as_ref()?;
                matches!(retirement.replacement, Replacement::Failed { .. })
                    .then(|| (p.ip.clone(), retirement.reason))
            })
            .collect();
        if stalled.is_empty() {
            continue;
        }

        let result = store.apply(&group.key, |g| {
            for (ip, reason) in &stalled {
                if let Some(retirement) = g.proxy_mut(ip)?.retirement.as_mut() {
                    retirement.replacement = Replacement::NotNeeded;
                }
                g.prepare_removal(ip, *reason, now)?;
            }
            Ok(())
        });
        match result {
            Ok(()) => {
                for (ip, _) in stalled {
                    info!(group = %group.key, %ip, "replacement abandoned, releasing stalled proxy");
                    released.push(ip);
                }
            }
            Err(e) => warn!(group = %group.key, error = %e, "failed to release stalled proxies"),
        }
    }
    released
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::RollingPolicy;
    use crate::scheduler::RecycleScheduler;
    use cloudproxy_state::{InstanceGroup, Scaling};

    fn key() -> GroupKey {
        GroupKey::new("aws", "default")
    }

    fn store_with(active: u32) -> FleetStore {
        let store = FleetStore::open_in_memory().unwrap();
        let mut group = InstanceGroup::new(key(), Scaling { min: active, max: active });
        for i in 0..active {
            group
                .add_proxy(Proxy::new(format!("10.0.0.{}", i + 1), 100 + i as u64))
                .unwrap();
        }
        store.declare(group).unwrap();
        store
    }

    fn policy() -> RollingPolicy {
        RollingPolicy {
            enabled: true,
            min_available: 3,
            batch_size: 2,
        }
    }

    fn select(store: &FleetStore) -> Vec<Selection> {
        let snapshot = store.snapshot().unwrap();
        let plan = RecycleScheduler::new().plan(&snapshot, &policy());
        commit_selections(store, &plan, 1_000)
    }

    #[test]
    fn full_rotation_lifecycle() {
        let store = store_with(5);
        let selected = select(&store);
        assert_eq!(selected.len(), 2);
        let old = &selected[0].ip;

        assert_eq!(begin_replacement(&store, &key(), old).unwrap(), 0);
        let group = store.get(&key()).unwrap();
        assert_eq!(group.proxy(old).unwrap().state, ProxyState::Recycling);
        assert_eq!(group.live_count(), 5);

        replacement_ready(&store, &key(), old, Proxy::new("10.0.0.50", 2_000), 2_000).unwrap();
        let group = store.get(&key()).unwrap();
        assert!(group.proxy("10.0.0.50").unwrap().is_active());
        assert_eq!(group.live_count(), 5);
        // Original still counts toward the batch ceiling until destroyed.
        assert_eq!(group.rotating_count(), 2);

        let queue = store.list_destroy_queue().unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(&queue[0].ip, old);

        store.claim_due_destroys(u64::MAX).unwrap();
        store.complete_destroy(old).unwrap();
        assert_eq!(store.get(&key()).unwrap().rotating_count(), 1);
    }

    #[test]
    fn stale_plan_is_not_committed() {
        let store = store_with(5);
        let snapshot = store.snapshot().unwrap();
        let plan = RecycleScheduler::new().plan(&snapshot, &policy());

        // Someone else touched the group after the snapshot.
        store.apply(&key(), |_| Ok(())).unwrap();
        assert!(commit_selections(&store, &plan, 1_000).is_empty());
        assert_eq!(store.get(&key()).unwrap().active_count(), 5);
    }

    #[test]
    fn failed_replacement_halts_and_retries() {
        let store = store_with(5);
        let selected = select(&store);
        let old = selected[0].ip.clone();
        begin_replacement(&store, &key(), &old).unwrap();

        let degraded = replacement_failed(&store, &key(), &old, "quota", 5_000, 3).unwrap();
        assert!(!degraded);
        let group = store.get(&key()).unwrap();
        assert!(group.recycle_halted());
        assert_eq!(group.proxy(&old).unwrap().state, ProxyState::Recycling);
        assert!(store.list_destroy_queue().unwrap().is_empty());

        let snapshot = store.snapshot().unwrap();
        assert!(due_retries(&snapshot, 4_999).is_empty());
        assert_eq!(due_retries(&snapshot, 5_000), vec![(key(), old.clone())]);

        assert_eq!(begin_replacement(&store, &key(), &old).unwrap(), 1);
        replacement_ready(&store, &key(), &old, Proxy::new("10.0.0.60", 6_000), 6_000).unwrap();
        let group = store.get(&key()).unwrap();
        assert!(!group.recycle_halted());
        assert_eq!(group.provision_failures, 0);
    }

    #[test]
    fn repeated_failures_degrade_group() {
        let store = store_with(5);
        let old = select(&store)[0].ip.clone();
        begin_replacement(&store, &key(), &old).unwrap();
        assert!(!replacement_failed(&store, &key(), &old, "quota", 0, 2).unwrap());
        begin_replacement(&store, &key(), &old).unwrap();
        assert!(replacement_failed(&store, &key(), &old, "quota", 0, 2).unwrap());
        assert!(store.get(&key()).unwrap().degraded);
    }

    #[test]
    fn release_stalled_when_rolling_disabled_for_group() {
        let store = store_with(5);
        let old = select(&store)[0].ip.clone();
        begin_replacement(&store, &key(), &old).unwrap();
        replacement_failed(&store, &key(), &old, "quota", 0, 5).unwrap();

        let snapshot = store.snapshot().unwrap();
        assert!(release_stalled(&store, &snapshot, 10).is_empty());

        store.apply(&key(), |g| {
            g.rolling_enabled = false;
            Ok(())
        })
        .unwrap();
        let snapshot = store.snapshot().unwrap();
        assert_eq!(release_stalled(&store, &snapshot, 10), vec![old.clone()]);
        assert!(due_retries(&store.snapshot().unwrap(), u64::MAX).is_empty());

        let group = store.get(&key()).unwrap();
        assert!(!group.proxy(&old).unwrap().holds_seat());
        assert_eq!(store.list_destroy_queue().unwrap()[0].ip, old);
    }

    #[test]
    fn replacement_for_destroyed_original_is_still_tracked() {
        let store = store_with(5);
        let old = select(&store)[0].ip.clone();
        begin_replacement(&store, &key(), &old).unwrap();

        store.enqueue_destroy(&old, RetireReason::Operator, 20).unwrap();
        store.claim_due_destroys(u64::MAX).unwrap();
        store.complete_destroy(&old).unwrap();

        replacement_ready(&store, &key(), &old, Proxy::new("10.0.0.70", 30), 30).unwrap();
        assert!(store.get(&key()).unwrap().proxies.contains_key("10.0.0.70"));
    }
}
