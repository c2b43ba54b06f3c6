//! Domain types for the fleet state store.
//!
//! These types represent instance groups, their proxies and lifecycle
//! state, and the destroy queue. All types are serializable to/from JSON
//! for storage in redb tables and for the HTTP surface.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use cloudproxy_core::InstanceConfig;

use crate::error::{StateError, StateResult};

/// A proxy is identified by its public IPv4 address.
pub type ProxyIp = String;

// ── Group key ──────────────────────────────────────────────────────

/// Identifies one instance group: a provider account in one placement.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupKey {
    pub provider: String,
    pub instance: String,
}

impl GroupKey {
    pub fn new(provider: impl Into<String>, instance: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            instance: instance.into(),
        }
    }

    /// Build the composite key for the groups table.
    pub fn table_key(&self) -> String {
        format!("{}/{}", self.provider, self.instance)
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.instance)
    }
}

// ── Scaling ────────────────────────────────────────────────────────

/// Desired proxy count bounds for a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scaling {
    #[serde(rename = "min_scaling")]
    pub min: u32,
    #[serde(rename = "max_scaling")]
    pub max: u32,
}

impl Scaling {
    pub fn new(min: u32, max: u32) -> StateResult<Self> {
        if min > max {
            return Err(StateError::Validation(format!(
                "min_scaling {min} exceeds max_scaling {max}"
            )));
        }
        Ok(Self { min, max })
    }
}

/// Opaque placement hint handed to the provider adapter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

// ── Proxy lifecycle ────────────────────────────────────────────────

/// Lifecycle state of a proxy.
///
/// A proxy only ever moves forward through
/// `active → pending_recycle → recycling → terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyState {
    Active,
    PendingRecycle,
    Recycling,
    Terminated,
}

impl ProxyState {
    /// The single state this one may move to, if any.
    pub fn successor(self) -> Option<ProxyState> {
        match self {
            ProxyState::Active => Some(ProxyState::PendingRecycle),
            ProxyState::PendingRecycle => Some(ProxyState::Recycling),
            ProxyState::Recycling => Some(ProxyState::Terminated),
            ProxyState::Terminated => None,
        }
    }

    /// Validate a transition, returning the new state.
    pub fn transition(self, next: ProxyState, ip: &str) -> StateResult<ProxyState> {
        if self.successor() == Some(next) {
            Ok(next)
        } else {
            Err(StateError::InvalidTransition {
                ip: ip.to_string(),
                from: self,
                to: next,
            })
        }
    }

    pub fn is_retiring(self) -> bool {
        matches!(self, ProxyState::PendingRecycle | ProxyState::Recycling)
    }
}

/// Why a proxy left the active set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetireReason {
    /// Selected by the rolling recycle scheduler.
    Rotation,
    /// Operator asked for this proxy to be replaced.
    Restart,
    /// Scaling reconciler found the group above its target.
    Excess,
    /// Operator asked for this proxy to be destroyed.
    Operator,
}

impl RetireReason {
    /// Rotations and restarts are replaced before the original is destroyed,
    /// and only those count toward the batch ceiling.
    pub fn needs_replacement(self) -> bool {
        matches!(self, RetireReason::Rotation | RetireReason::Restart)
    }
}

/// Progress of the replacement for a retiring proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Replacement {
    NotNeeded,
    /// Provisioning requested; `attempts` counts earlier failures.
    Pending { attempts: u32 },
    Ready { ip: ProxyIp },
    Failed {
        attempts: u32,
        retry_at: u64,
        error: String,
    },
}

impl Replacement {
    pub fn is_ready(&self) -> bool {
        matches!(self, Replacement::Ready { .. })
    }

    /// True once any provisioning attempt for this replacement has failed
    /// and no attempt has succeeded yet.
    pub fn has_failed(&self) -> bool {
        match self {
            Replacement::Failed { .. } => true,
            Replacement::Pending { attempts } => *attempts > 0,
            _ => false,
        }
    }

    /// True while the replacement still has to be provisioned.
    pub fn is_outstanding(&self) -> bool {
        matches!(self, Replacement::Pending { .. } | Replacement::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Retirement {
    pub reason: RetireReason,
    pub replacement: Replacement,
    /// Unix millis when the proxy left the active set.
    pub started_at: u64,
    /// Whether a destroy queue entry exists for this proxy.
    pub queued: bool,
}

/// A single proxy instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proxy {
    pub ip: ProxyIp,
    pub state: ProxyState,
    /// Unix millis when the proxy reached `active`.
    pub created_at: u64,
    #[serde(default)]
    pub restart_requested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retirement: Option<Retirement>,
}

impl Proxy {
    pub fn new(ip: impl Into<ProxyIp>, created_at: u64) -> Self {
        Self {
            ip: ip.into(),
            state: ProxyState::Active,
            created_at,
            restart_requested: false,
            retirement: None,
        }
    }

    /// Move to `next`, rejecting anything but the immediate successor.
    pub fn advance(&mut self, next: ProxyState) -> StateResult<()> {
        self.state = self.state.transition(next, &self.ip)?;
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.state == ProxyState::Active
    }

    /// In `pending_recycle ∪ recycling` for a rotation or restart.
    pub fn is_rotating(&self) -> bool {
        self.state.is_retiring()
            && self
                .retirement
                .as_ref()
                .is_some_and(|r| r.reason.needs_replacement())
    }

    /// Whether this proxy still counts toward the group's live size.
    ///
    /// A rotating proxy keeps its seat until its replacement is active;
    /// proxies retired without replacement give it up immediately.
    pub fn holds_seat(&self) -> bool {
        match self.state {
            ProxyState::Active => true,
            ProxyState::PendingRecycle | ProxyState::Recycling => self
                .retirement
                .as_ref()
                .is_some_and(|r| r.replacement.is_outstanding()),
            ProxyState::Terminated => false,
        }
    }

    /// Sort key: oldest first, lowest IP on ties.
    pub fn age_key(&self) -> (u64, &str) {
        (self.created_at, self.ip.as_str())
    }
}

// ── Instance group ─────────────────────────────────────────────────

/// Partial update accepted by `PATCH /providers/{provider}/{instance}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupPatch {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub min_scaling: Option<u32>,
    #[serde(default)]
    pub max_scaling: Option<u32>,
    #[serde(default)]
    pub rolling_enabled: Option<bool>,
}

/// The proxy set and scaling target for one provider account/placement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceGroup {
    pub key: GroupKey,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub placement: Placement,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    pub scaling: Scaling,
    pub rolling_enabled: bool,
    #[serde(default)]
    pub proxies: BTreeMap<ProxyIp, Proxy>,
    /// Scale provisions currently in flight (replacements are tracked on
    /// the retiring proxy instead).
    #[serde(default)]
    pub provisioning: u32,
    #[serde(default)]
    pub provision_failures: u32,
    /// Unix millis before which scale provisioning is not retried.
    #[serde(default)]
    pub backoff_until: u64,
    #[serde(default)]
    pub degraded: bool,
    /// Bumped by every committed mutation.
    #[serde(default)]
    pub revision: u64,
}

impl InstanceGroup {
    pub fn new(key: GroupKey, scaling: Scaling) -> Self {
        Self {
            key,
            enabled: true,
            display_name: None,
            placement: Placement::default(),
            size: None,
            scaling,
            rolling_enabled: true,
            proxies: BTreeMap::new(),
            provisioning: 0,
            provision_failures: 0,
            backoff_until: 0,
            degraded: false,
            revision: 0,
        }
    }

    pub fn from_config(provider: &str, instance: &str, cfg: &InstanceConfig) -> StateResult<Self> {
        let scaling = Scaling::new(cfg.min_scaling, cfg.max_scaling)?;
        let mut group = Self::new(GroupKey::new(provider, instance), scaling);
        group.enabled = cfg.enabled;
        group.display_name = cfg.display_name.clone();
        group.size = cfg.size.clone();
        group.rolling_enabled = cfg.rolling_enabled;
        group.placement = Placement {
            region: cfg.region.clone(),
            zone: cfg.zone.clone(),
            location: cfg.location.clone(),
        };
        Ok(group)
    }

    pub fn table_key(&self) -> String {
        self.key.table_key()
    }

    pub fn proxy(&self, ip: &str) -> StateResult<&Proxy> {
        self.proxies
            .get(ip)
            .ok_or_else(|| StateError::NotFound(format!("proxy {ip} in {}", self.key)))
    }

    pub fn proxy_mut(&mut self, ip: &str) -> StateResult<&mut Proxy> {
        let key = &self.key;
        self.proxies
            .get_mut(ip)
            .ok_or_else(|| StateError::NotFound(format!("proxy {ip} in {key}")))
    }

    pub fn active_count(&self) -> u32 {
        self.proxies.values().filter(|p| p.is_active()).count() as u32
    }

    /// Seats held by existing proxies plus scale provisions in flight.
    pub fn live_count(&self) -> u32 {
        let seats = self.proxies.values().filter(|p| p.holds_seat()).count() as u32;
        seats + self.provisioning
    }

    pub fn rotating_count(&self) -> u32 {
        self.proxies.values().filter(|p| p.is_rotating()).count() as u32
    }

    pub fn in_state(&self, state: ProxyState) -> Vec<&Proxy> {
        self.proxies.values().filter(|p| p.state == state).collect()
    }

    /// Active proxies, oldest first.
    pub fn active_by_age(&self) -> Vec<&Proxy> {
        let mut active: Vec<&Proxy> = self.proxies.values().filter(|p| p.is_active()).collect();
        active.sort_by(|a, b| a.age_key().cmp(&b.age_key()));
        active
    }

    /// A failed replacement stops new selections in this group until it
    /// succeeds.
    pub fn recycle_halted(&self) -> bool {
        self.proxies.values().any(|p| {
            p.retirement
                .as_ref()
                .is_some_and(|r| r.replacement.has_failed())
        })
    }

    /// Forget provider calls that died with a previous process.
    ///
    /// Scale provisions in flight are dropped so the reconciler asks again,
    /// and pending replacements become failures due immediately so the
    /// controller re-requests them. Returns how many replacements were
    /// rescheduled.
    pub fn recover_interrupted(&mut self) -> u32 {
        self.provisioning = 0;
        let mut rescheduled = 0;
        for retirement in self.proxies.values_mut().filter_map(|p| p.retirement.as_mut()) {
            if let Replacement::Pending { attempts } = retirement.replacement {
                retirement.replacement = Replacement::Failed {
                    attempts,
                    retry_at: 0,
                    error: "interrupted by restart".to_string(),
                };
                rescheduled += 1;
            }
        }
        rescheduled
    }

    pub fn add_proxy(&mut self, proxy: Proxy) -> StateResult<()> {
        if self.proxies.contains_key(&proxy.ip) {
            return Err(StateError::Conflict(format!(
                "proxy {} already tracked in {}",
                proxy.ip, self.key
            )));
        }
        self.proxies.insert(proxy.ip.clone(), proxy);
        Ok(())
    }

    /// `active → pending_recycle`, recording why.
    pub fn begin_retirement(&mut self, ip: &str, reason: RetireReason, now: u64) -> StateResult<()> {
        let proxy = self.proxy_mut(ip)?;
        proxy.advance(ProxyState::PendingRecycle)?;
        proxy.retirement = Some(Retirement {
            reason,
            replacement: if reason.needs_replacement() {
                Replacement::Pending { attempts: 0 }
            } else {
                Replacement::NotNeeded
            },
            started_at: now,
            queued: false,
        });
        Ok(())
    }

    /// `pending_recycle → recycling`.
    pub fn mark_recycling(&mut self, ip: &str) -> StateResult<()> {
        self.proxy_mut(ip)?.advance(ProxyState::Recycling)
    }

    /// Walk a proxy to `recycling` and flag it as queued for destruction.
    ///
    /// Returns `false` if the proxy was already queued.
    pub fn prepare_removal(&mut self, ip: &str, reason: RetireReason, now: u64) -> StateResult<bool> {
        let state = self.proxy(ip)?.state;
        match state {
            ProxyState::Active => {
                self.begin_retirement(ip, reason, now)?;
                self.mark_recycling(ip)?;
            }
            ProxyState::PendingRecycle => self.mark_recycling(ip)?,
            ProxyState::Recycling => {}
            ProxyState::Terminated => {
                return Err(StateError::NotFound(format!("proxy {ip} already terminated")));
            }
        }
        let proxy = self.proxy_mut(ip)?;
        let retirement = proxy.retirement.as_mut().ok_or_else(|| {
            StateError::Validation(format!("proxy {ip} is recycling without a retirement record"))
        })?;
        if retirement.queued {
            return Ok(false);
        }
        retirement.queued = true;
        Ok(true)
    }

    /// `recycling → terminated`; the proxy leaves the live set for good.
    pub fn terminate(&mut self, ip: &str) -> StateResult<Proxy> {
        self.proxy_mut(ip)?.advance(ProxyState::Terminated)?;
        self.proxies
            .remove(ip)
            .ok_or_else(|| StateError::NotFound(format!("proxy {ip} in {}", self.key)))
    }

    /// Apply an operator patch; rejects `min > max` without touching state.
    pub fn apply_patch(&mut self, patch: &GroupPatch) -> StateResult<()> {
        let scaling = Scaling::new(
            patch.min_scaling.unwrap_or(self.scaling.min),
            patch.max_scaling.unwrap_or(self.scaling.max),
        )?;
        self.scaling = scaling;
        if let Some(enabled) = patch.enabled {
            self.enabled = enabled;
        }
        if let Some(rolling) = patch.rolling_enabled {
            self.rolling_enabled = rolling;
        }
        Ok(())
    }
}

// ── Destroy queue ──────────────────────────────────────────────────

/// A request to terminate one proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestroyQueueEntry {
    pub ip: ProxyIp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<GroupKey>,
    /// Unix millis when the removal was requested.
    pub requested_at: u64,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub next_attempt_at: u64,
    #[serde(default)]
    pub in_flight: bool,
    #[serde(default)]
    pub stuck: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl DestroyQueueEntry {
    pub fn new(ip: impl Into<ProxyIp>, group: Option<GroupKey>, now: u64) -> Self {
        Self {
            ip: ip.into(),
            group,
            requested_at: now,
            attempts: 0,
            next_attempt_at: now,
            in_flight: false,
            stuck: false,
            last_error: None,
        }
    }

    pub fn is_due(&self, now: u64) -> bool {
        !self.in_flight && self.next_attempt_at <= now
    }
}

/// Current unix time in milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
