//! Scaling reconciler — a pure function from group state to action.

use tracing::debug;

use cloudproxy_state::{FleetSnapshot, GroupKey, InstanceGroup, Proxy, ProxyIp};

/// What the controller should do to bring one group to its target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScaleAction {
    /// Start `count` new instances.
    Provision { count: u32 },
    /// Retire these active proxies without replacement.
    MarkExcessForRemoval { ips: Vec<ProxyIp> },
    NoChange,
}

/// Decide the scaling action for a single group.
pub fn reconcile(group: &InstanceGroup) -> ScaleAction {
    if !group.enabled {
        let ips: Vec<ProxyIp> = newest_first(group).into_iter().map(|p| p.ip.clone()).collect();
        if ips.is_empty() {
            return ScaleAction::NoChange;
        }
        debug!(group = %group.key, count = ips.len(), "group disabled, removing all active proxies");
        return ScaleAction::MarkExcessForRemoval { ips };
    }

    let live = group.live_count();
    let scaling = group.scaling;

    if live < scaling.min {
        let count = scaling.min - live;
        debug!(group = %group.key, live, min = scaling.min, count, "below minimum");
        return ScaleAction::Provision { count };
    }

    if live > scaling.max {
        let excess = (live - scaling.max) as usize;
        let ips: Vec<ProxyIp> = newest_first(group)
            .into_iter()
            .take(excess)
            .map(|p| p.ip.clone())
            .collect();
        if ips.is_empty() {
            return ScaleAction::NoChange;
        }
        debug!(group = %group.key, live, max = scaling.max, count = ips.len(), "above maximum");
        return ScaleAction::MarkExcessForRemoval { ips };
    }

    ScaleAction::NoChange
}

/// Reconcile every group, skipping those with nothing to do.
pub fn reconcile_all(snapshot: &FleetSnapshot) -> Vec<(GroupKey, ScaleAction)> {
    snapshot
        .iter()
        .map(|(key, group)| (key.clone(), reconcile(group)))
        .filter(|(_, action)| *action != ScaleAction::NoChange)
        .collect()
}

/// Active proxies, most recently created first, lowest IP on ties.
fn newest_first(group: &InstanceGroup) -> Vec<&Proxy> {
    let mut active: Vec<&Proxy> = group.proxies.values().filter(|p| p.is_active()).collect();
    active.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.ip.cmp(&b.ip)));
    active
}
