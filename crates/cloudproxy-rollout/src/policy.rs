//! Rolling policy — operator limits on concurrent recycling.
//!
//! The live policy sits behind an [`ArcSwap`]. The scheduler loads it once
//! per tick and keeps that `Arc` for the whole tick, so an update never
//! lands mid-decision. Every accepted update bumps the version.

use std::ops::RangeInclusive;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use cloudproxy_core::RollingConfig;
use cloudproxy_state::Scaling;

pub const MIN_AVAILABLE_RANGE: RangeInclusive<u32> = 1..=100;
pub const BATCH_SIZE_RANGE: RangeInclusive<u32> = 1..=50;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },
}

fn check(field: &'static str, value: u32, range: &RangeInclusive<u32>) -> Result<(), PolicyError> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err(PolicyError::OutOfRange {
            field,
            value,
            min: *range.start(),
            max: *range.end(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollingPolicy {
    pub enabled: bool,
    pub min_available: u32,
    pub batch_size: u32,
}

impl Default for RollingPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            min_available: 3,
            batch_size: 2,
        }
    }
}

impl From<&RollingConfig> for RollingPolicy {
    fn from(cfg: &RollingConfig) -> Self {
        Self {
            enabled: cfg.enabled,
            min_available: cfg.min_available,
            batch_size: cfg.batch_size,
        }
    }
}

impl RollingPolicy {
    pub fn validate(&self) -> Result<(), PolicyError> {
        check("min_available", self.min_available, &MIN_AVAILABLE_RANGE)?;
        check("batch_size", self.batch_size, &BATCH_SIZE_RANGE)?;
        Ok(())
    }

    /// Availability floor for a group, clamped to what the group can hold.
    pub fn floor(&self, scaling: Scaling) -> u32 {
        self.min_available.min(scaling.max)
    }

    /// Produce a validated copy with `patch` applied.
    pub fn patched(&self, patch: &PolicyPatch) -> Result<Self, PolicyError> {
        let next = Self {
            enabled: patch.enabled.unwrap_or(self.enabled),
            min_available: patch.min_available.unwrap_or(self.min_available),
            batch_size: patch.batch_size.unwrap_or(self.batch_size),
        };
        next.validate()?;
        Ok(next)
    }
}

/// Partial update accepted by `PATCH /rolling`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PolicyPatch {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub min_available: Option<u32>,
    #[serde(default)]
    pub batch_size: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionedPolicy {
    pub version: u64,
    pub policy: RollingPolicy,
}

/// Shared, atomically swappable policy.
#[derive(Clone)]
pub struct PolicyHandle {
    current: Arc<ArcSwap<VersionedPolicy>>,
}

impl PolicyHandle {
    pub fn new(policy: RollingPolicy) -> Result<Self, PolicyError> {
        policy.validate()?;
        Ok(Self {
            current: Arc::new(ArcSwap::from_pointee(VersionedPolicy { version: 1, policy })),
        })
    }

    pub fn load(&self) -> Arc<VersionedPolicy> {
        self.current.load_full()
    }

    /// Validate and publish a patched policy. On error nothing changes.
    pub fn update(&self, patch: &PolicyPatch) -> Result<Arc<VersionedPolicy>, PolicyError> {
        loop {
            let current = self.current.load_full();
            let next = Arc::new(VersionedPolicy {
                version: current.version + 1,
                policy: current.policy.patched(patch)?,
            });
            let previous = self.current.compare_and_swap(&current, Arc::clone(&next));
            if Arc::ptr_eq(&*previous, &current) {
                info!(
                    version = next.version,
                    enabled = next.policy.enabled,
                    min_available = next.policy.min_available,
                    batch_size = next.policy.batch_size,
                    "rolling policy updated"
                );
                return Ok(next);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(RollingPolicy::default().validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_values() {
        let policy = RollingPolicy::default();
        for (patch, field) in [
            (PolicyPatch { min_available: Some(0), ..Default::default() }, "min_available"),
            (PolicyPatch { min_available: Some(101), ..Default::default() }, "min_available"),
            (PolicyPatch { batch_size: Some(0), ..Default::default() }, "batch_size"),
            (PolicyPatch { batch_size: Some(51), ..Default::default() }, "batch_size"),
        ] {
            match policy.patched(&patch) {
                Err(PolicyError::OutOfRange { field: f, .. }) => assert_eq!(f, field),
                other => panic!("expected range error for {field}, got {other:?}"),
            }
        }
    }

    #[test]
    fn floor_clamps_to_group_max() {
        let policy = RollingPolicy {
            enabled: true,
            min_available: 5,
            batch_size: 2,
        };
        assert_eq!(policy.floor(Scaling { min: 1, max: 3 }), 3);
        assert_eq!(policy.floor(Scaling { min: 1, max: 8 }), 5);
    }

    #[test]
    fn update_bumps_version_and_keeps_unpatched_fields() {
        let handle = PolicyHandle::new(RollingPolicy::default()).unwrap();
        let held = handle.load();

        let next = handle
            .update(&PolicyPatch {
                enabled: Some(true),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(next.version, 2);
        assert!(next.policy.enabled);
        assert_eq!(next.policy.batch_size, 2);

        // A reader holding the old version is unaffected.
        assert_eq!(held.version, 1);
        assert!(!held.policy.enabled);
    }

    #[test]
    fn rejected_update_leaves_policy_untouched() {
        let handle = PolicyHandle::new(RollingPolicy::default()).unwrap();
        let err = handle.update(&PolicyPatch {
            enabled: Some(true),
            batch_size: Some(99),
            ..Default::default()
        });
        assert!(err.is_err());
        let current = handle.load();
        assert_eq!(current.version, 1);
        assert!(!current.policy.enabled);
    }
}
