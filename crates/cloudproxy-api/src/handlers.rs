//! Fleet handlers: providers, instance groups, proxy listing, credentials.

use std::collections::BTreeMap;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use cloudproxy_state::{
    FleetSnapshot, GroupKey, GroupPatch, InstanceGroup, Placement, Scaling, StateError,
};

use crate::{ApiState, error_response, state_error};

const DEFAULT_INSTANCE: &str = "default";
const DEFAULT_PAGE_LIMIT: usize = 100;

/// One instance group as the dashboard sees it.
#[derive(Debug, Serialize)]
pub struct InstanceView {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub ips: Vec<String>,
    pub scaling: Scaling,
    #[serde(flatten)]
    pub placement: Placement,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    pub rolling_enabled: bool,
    pub degraded: bool,
}

impl From<&InstanceGroup> for InstanceView {
    fn from(group: &InstanceGroup) -> Self {
        Self {
            enabled: group.enabled,
            display_name: group.display_name.clone(),
            ips: group.proxies.keys().cloned().collect(),
            scaling: group.scaling,
            placement: group.placement.clone(),
            size: group.size.clone(),
            rolling_enabled: group.rolling_enabled,
            degraded: group.degraded,
        }
    }
}

#[derive(Debug, Default, Serialize)]
pub struct ProviderView {
    pub instances: BTreeMap<String, InstanceView>,
}

fn providers_view(snapshot: &FleetSnapshot) -> BTreeMap<String, ProviderView> {
    let mut providers: BTreeMap<String, ProviderView> = BTreeMap::new();
    for (key, group) in snapshot {
        providers
            .entry(key.provider.clone())
            .or_default()
            .instances
            .insert(key.instance.clone(), InstanceView::from(group));
    }
    providers
}

/// GET /providers
pub async fn list_providers(State(state): State<ApiState>) -> Response {
    match state.store.snapshot() {
        Ok(snapshot) => Json(json!({ "providers": providers_view(&snapshot) })).into_response(),
        Err(e) => state_error(&e),
    }
}

/// GET /providers/{provider}
pub async fn get_provider(State(state): State<ApiState>, Path(provider): Path<String>) -> Response {
    let snapshot = match state.store.snapshot() {
        Ok(snapshot) => snapshot,
        Err(e) => return state_error(&e),
    };
    match providers_view(&snapshot).remove(&provider) {
        Some(view) => Json(json!({
            "message": format!("Provider '{provider}' configuration retrieved successfully"),
            "provider": view,
        }))
        .into_response(),
        None => error_response(&format!("Provider '{provider}' not found"), StatusCode::NOT_FOUND),
    }
}

/// GET /providers/{provider}/{instance}
pub async fn get_instance(
    State(state): State<ApiState>,
    Path((provider, instance)): Path<(String, String)>,
) -> Response {
    match state.store.get(&GroupKey::new(&provider, &instance)) {
        Ok(group) => Json(json!({
            "message": format!("Provider '{provider}' instance '{instance}' configuration retrieved successfully"),
            "provider": provider,
            "instance": instance,
            "config": InstanceView::from(&group),
        }))
        .into_response(),
        Err(StateError::NotFound(_)) => error_response(
            &format!("Provider '{provider}' instance '{instance}' not found"),
            StatusCode::NOT_FOUND,
        ),
        Err(e) => state_error(&e),
    }
}

/// PATCH /providers/{provider}
pub async fn patch_default_instance(
    State(state): State<ApiState>,
    Path(provider): Path<String>,
    Json(patch): Json<GroupPatch>,
) -> Response {
    apply_group_patch(&state, &provider, DEFAULT_INSTANCE, &patch)
}

/// PATCH /providers/{provider}/{instance}
pub async fn patch_instance(
    State(state): State<ApiState>,
    Path((provider, instance)): Path<(String, String)>,
    Json(patch): Json<GroupPatch>,
) -> Response {
    apply_group_patch(&state, &provider, &instance, &patch)
}

fn apply_group_patch(state: &ApiState, provider: &str, instance: &str, patch: &GroupPatch) -> Response {
    let key = GroupKey::new(provider, instance);
    let result = state.store.apply(&key, |group| {
        group.apply_patch(patch)?;
        Ok(InstanceView::from(&*group))
    });
    match result {
        Ok(view) => {
            info!(
                provider,
                instance,
                enabled = view.enabled,
                min_scaling = view.scaling.min,
                max_scaling = view.scaling.max,
                rolling_enabled = view.rolling_enabled,
                "instance group updated"
            );
            state.controller_wake.notify_one();
            Json(json!({
                "message": format!("Provider '{provider}' instance '{instance}' scaling configuration updated successfully"),
                "provider": provider,
                "instance": instance,
                "config": view,
            }))
            .into_response()
        }
        Err(StateError::NotFound(_)) => error_response(
            &format!("Provider '{provider}' instance '{instance}' not found"),
            StatusCode::NOT_FOUND,
        ),
        Err(e) => state_error(&e),
    }
}

// ── Proxies ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ProxyEntry {
    pub ip: String,
    pub provider: String,
    pub instance: String,
    pub url: String,
}

/// Active proxies not waiting on a restart, in group then IP order.
fn serving_proxies(state: &ApiState) -> Result<Vec<ProxyEntry>, StateError> {
    let snapshot = state.store.snapshot()?;
    let mut out = Vec::new();
    for (key, group) in &snapshot {
        for proxy in group.proxies.values() {
            if proxy.is_active() && !proxy.restart_requested {
                out.push(ProxyEntry {
                    ip: proxy.ip.clone(),
                    provider: key.provider.clone(),
                    instance: key.instance.clone(),
                    url: state.auth.proxy_url(&proxy.ip),
                });
            }
        }
    }
    Ok(out)
}

#[derive(Debug, Deserialize)]
pub struct Page {
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

/// GET /
pub async fn list_proxies(State(state): State<ApiState>, Query(page): Query<Page>) -> Response {
    let proxies = match serving_proxies(&state) {
        Ok(proxies) => proxies,
        Err(e) => return state_error(&e),
    };
    let offset = page.offset.unwrap_or(0);
    let limit = page.limit.unwrap_or(DEFAULT_PAGE_LIMIT);
    let total = proxies.len();
    let window: Vec<ProxyEntry> = proxies.into_iter().skip(offset).take(limit).collect();
    Json(json!({
        "total": total,
        "offset": offset,
        "limit": limit,
        "proxies": window,
    }))
    .into_response()
}

/// GET /random
pub async fn random_proxy(State(state): State<ApiState>) -> Response {
    let proxies = match serving_proxies(&state) {
        Ok(proxies) => proxies,
        Err(e) => return state_error(&e),
    };
    match proxies.choose(&mut rand::thread_rng()) {
        Some(proxy) => Json(json!({
            "message": "Random proxy retrieved successfully",
            "proxy": proxy,
        }))
        .into_response(),
        None => error_response("No proxies available", StatusCode::NOT_FOUND),
    }
}

/// GET /auth
pub async fn auth_settings(State(state): State<ApiState>) -> Response {
    Json(json!({
        "username": state.auth.username,
        "password": state.auth.password,
        "auth_enabled": state.auth.auth_enabled(),
    }))
    .into_response()
}
