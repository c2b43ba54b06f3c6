//! Recycle scheduler — picks which active proxies to rotate out.
//!
//! Planning is pure: it reads a snapshot and a policy and returns the
//! proxies to move `active → pending_recycle`. Committing the plan is the
//! pipeline's job.

use std::collections::VecDeque;

use tracing::debug;

use cloudproxy_state::{FleetSnapshot, GroupKey, InstanceGroup, Proxy, ProxyIp, RetireReason};

use crate::policy::RollingPolicy;

/// One proxy chosen for retirement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub key: GroupKey,
    pub ip: ProxyIp,
    pub reason: RetireReason,
    /// Group revision the selection was planned against.
    pub revision: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecyclePlan {
    /// Rotations in flight fleet-wide when the plan was made.
    pub in_flight: u32,
    /// Free slots under the batch ceiling.
    pub capacity: u32,
    pub selections: Vec<Selection>,
}

struct Lane<'a> {
    group: &'a InstanceGroup,
    budget: u32,
    restarts: VecDeque<&'a Proxy>,
    rotations: VecDeque<&'a Proxy>,
}

/// Round-robin scheduler. The cursor is the key of the group that
/// received the most recent selection; the next plan starts after it.
#[derive(Debug, Default)]
pub struct RecycleScheduler {
    cursor: Option<GroupKey>,
}

impl RecycleScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cursor(&self) -> Option<&GroupKey> {
        self.cursor.as_ref()
    }

    /// Plan this tick's selections.
    ///
    /// With the policy enabled, every group keeps at least its floor of
    /// active proxies and the fleet never has more than `batch_size`
    /// rotations in flight. With it disabled only operator restarts are
    /// planned, bounded by the batch ceiling alone.
    pub fn plan(&mut self, snapshot: &FleetSnapshot, policy: &RollingPolicy) -> RecyclePlan {
        let in_flight: u32 = snapshot.values().map(InstanceGroup::rotating_count).sum();
        let capacity = policy.batch_size.saturating_sub(in_flight);
        let mut plan = RecyclePlan {
            in_flight,
            capacity,
            selections: Vec::new(),
        };
        if capacity == 0 {
            debug!(in_flight, batch_size = policy.batch_size, "batch ceiling reached");
            return plan;
        }

        let mut lanes = self.lanes(snapshot, policy);
        let mut remaining = capacity;

        for restart_phase in [true, false] {
            loop {
                let mut progressed = false;
                for lane in lanes.iter_mut() {
                    if remaining == 0 {
                        break;
                    }
                    if lane.budget == 0 {
                        continue;
                    }
                    let (queue, reason) = if restart_phase {
                        (&mut lane.restarts, RetireReason::Restart)
                    } else {
                        (&mut lane.rotations, RetireReason::Rotation)
                    };
                    let Some(proxy) = queue.pop_front() else {
                        continue;
                    };
                    plan.selections.push(Selection {
                        key: lane.group.key.clone(),
                        ip: proxy.ip.clone(),
                        reason,
                        revision: lane.group.revision,
                    });
                    lane.budget -= 1;
                    remaining -= 1;
                    self.cursor = Some(lane.group.key.clone());
                    progressed = true;
                }
                if !progressed || remaining == 0 {
                    break;
                }
            }
        }

        debug!(
            in_flight,
            capacity,
            selected = plan.selections.len(),
            "recycle plan"
        );
        plan
    }

    /// Eligible groups, ordered to start right after the cursor.
    fn lanes<'a>(&self, snapshot: &'a FleetSnapshot, policy: &RollingPolicy) -> Vec<Lane<'a>> {
        let mut lanes: Vec<Lane<'a>> = Vec::new();
        for group in snapshot.values() {
            if !group.enabled || group.recycle_halted() {
                continue;
            }
            let by_age = group.active_by_age();
            let restarts: VecDeque<&Proxy> =
                by_age.iter().copied().filter(|p| p.restart_requested).collect();
            let rotations: VecDeque<&Proxy> = if policy.enabled && group.rolling_enabled {
                by_age.iter().copied().filter(|p| !p.restart_requested).collect()
            } else {
                VecDeque::new()
            };
            let budget = if policy.enabled {
                group.active_count().saturating_sub(policy.floor(group.scaling))
            } else {
                u32::MAX
            };
            if budget == 0 || (restarts.is_empty() && rotations.is_empty()) {
                continue;
            }
            lanes.push(Lane {
                group,
                budget,
                restarts,
                rotations,
            });
        }

        if let Some(cursor) = &self.cursor {
            let start = lanes
                .iter()
                .position(|lane| &lane.group.key > cursor)
                .unwrap_or(0);
            lanes.rotate_left(start);
        }
        lanes
    }
}
