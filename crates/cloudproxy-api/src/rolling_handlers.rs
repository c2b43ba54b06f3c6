//! Rolling deployment policy and per-group rotation status.

use std::collections::BTreeMap;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::json;
use tracing::warn;

use cloudproxy_rollout::PolicyPatch;
use cloudproxy_state::{InstanceGroup, ProxyState};

use crate::{ApiState, error_response, state_error};

/// Settings key the live policy is persisted under.
pub const ROLLING_SETTING: &str = "rolling";

/// `pending_recycle` and `recycling` count every retiring proxy. Only
/// `rotating` (rotations and restarts) counts toward the batch ceiling;
/// `draining` is excess and operator removals, which need no replacement.
#[derive(Debug, Serialize)]
struct GroupRollingStatus {
    healthy: u32,
    pending_recycle: usize,
    recycling: usize,
    rotating: u32,
    draining: u32,
    pending_recycle_ips: Vec<String>,
    recycling_ips: Vec<String>,
    degraded: bool,
}

impl From<&InstanceGroup> for GroupRollingStatus {
    fn from(group: &InstanceGroup) -> Self {
        let ips = |state: ProxyState| -> Vec<String> {
            group.in_state(state).into_iter().map(|p| p.ip.clone()).collect()
        };
        let pending_recycle_ips = ips(ProxyState::PendingRecycle);
        let recycling_ips = ips(ProxyState::Recycling);
        let retiring = (pending_recycle_ips.len() + recycling_ips.len()) as u32;
        let rotating = group.rotating_count();
        Self {
            healthy: group.active_count(),
            pending_recycle: pending_recycle_ips.len(),
            recycling: recycling_ips.len(),
            rotating,
            draining: retiring.saturating_sub(rotating),
            pending_recycle_ips,
            recycling_ips,
            degraded: group.degraded,
        }
    }
}

/// GET /rolling
pub async fn get_rolling(State(state): State<ApiState>) -> Response {
    let snapshot = match state.store.snapshot() {
        Ok(s) => s,
        Err(e) => return state_error(&e),
    };
    let current = state.policy.load();
    let status: BTreeMap<String, GroupRollingStatus> = snapshot
        .values()
        .map(|group| (group.key.to_string(), GroupRollingStatus::from(group)))
        .collect();
    let rotating: u32 = status.values().map(|s| s.rotating).sum();
    Json(json!({
        "config": current.policy,
        "version": current.version,
        "batch": {
            "batch_size": current.policy.batch_size,
            "rotating": rotating,
        },
        "status": status,
    }))
    .into_response()
}

/// PATCH /rolling
pub async fn patch_rolling(State(state): State<ApiState>, Json(patch): Json<PolicyPatch>) -> Response {
    let next = match state.policy.update(&patch) {
        Ok(next) => next,
        Err(e) => return error_response(&e.to_string(), StatusCode::UNPROCESSABLE_ENTITY),
    };
    if let Err(e) = state.store.put_setting(ROLLING_SETTING, &next.policy) {
        warn!(error = %e, "failed to persist rolling policy");
    }
    state.controller_wake.notify_one();
    Json(json!({
        "message": "Rolling deployment configuration updated",
        "config": next.policy,
        "version": next.version,
    }))
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use cloudproxy_core::AuthConfig;
    use cloudproxy_rollout::{PolicyHandle, RollingPolicy};
    use cloudproxy_state::{FleetStore, GroupKey, Proxy, RetireReason, Scaling};

    fn test_state() -> ApiState {
        let store = FleetStore::open_in_memory().unwrap();
        let mut group = InstanceGroup::new(GroupKey::new("aws", "eu"), Scaling { min: 2, max: 4 });
        group.add_proxy(Proxy::new("10.0.0.1", 1)).unwrap();
        group.add_proxy(Proxy::new("10.0.0.2", 2)).unwrap();
        group.add_proxy(Proxy::new("10.0.0.3", 3)).unwrap();
        group
            .begin_retirement("10.0.0.1", RetireReason::Rotation, 10)
            .unwrap();
        group
            .prepare_removal("10.0.0.2", RetireReason::Excess, 10)
            .unwrap();
        store.declare(group).unwrap();
        ApiState::new(
            store,
            PolicyHandle::new(RollingPolicy::default()).unwrap(),
            AuthConfig::default(),
        )
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn status_counts_states() {
        let body = body_json(get_rolling(State(test_state())).await).await;
        assert_eq!(body["config"]["enabled"], false);
        assert_eq!(body["config"]["batch_size"], 2);
        let group = &body["status"]["aws/eu"];
        assert_eq!(group["healthy"], 1);
        assert_eq!(group["pending_recycle"], 1);
        assert_eq!(group["pending_recycle_ips"][0], "10.0.0.1");
        assert_eq!(group["recycling"], 1);
        assert_eq!(group["recycling_ips"][0], "10.0.0.2");
        // Only the rotation counts toward the batch ceiling.
        assert_eq!(group["rotating"], 1);
        assert_eq!(group["draining"], 1);
        assert_eq!(body["batch"]["rotating"], 1);
        assert_eq!(body["batch"]["batch_size"], 2);
    }

    #[tokio::test]
    async fn patch_updates_and_persists() {
        let state = test_state();
        let patch = PolicyPatch {
            enabled: Some(true),
            batch_size: Some(5),
            ..Default::default()
        };
        let resp = patch_rolling(State(state.clone()), Json(patch)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["config"]["enabled"], true);
        assert_eq!(body["config"]["batch_size"], 5);
        assert_eq!(body["config"]["min_available"], 3);

        let stored: RollingPolicy = state.store.get_setting(ROLLING_SETTING).unwrap().unwrap();
        assert_eq!(stored, state.policy.load().policy);
    }

    #[tokio::test]
    async fn out_of_range_patch_leaves_policy_untouched() {
        let state = test_state();
        let before = state.policy.load();
        let patch = PolicyPatch {
            batch_size: Some(0),
            ..Default::default()
        };
        let resp = patch_rolling(State(state.clone()), Json(patch)).await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = body_json(resp).await;
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains("batch_size"));
        assert_eq!(state.policy.load(), before);
        assert!(
            state
                .store
                .get_setting::<RollingPolicy>(ROLLING_SETTING)
                .unwrap()
                .is_none()
        );
    }
}
