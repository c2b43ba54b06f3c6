//! Operator queues: explicit destroy and restart requests.
//!
//! `ip_address` may be a bare IPv4 address or anything containing one,
//! such as a full proxy URL.

use std::net::Ipv4Addr;
use std::sync::LazyLock;

use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use cloudproxy_state::{RetireReason, StateError, now_millis};

use crate::{ApiState, error_response, state_error};

/// A dotted quad not glued to further digits or dots on either side.
static IPV4: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[^0-9.])([0-9]{1,3}(?:\.[0-9]{1,3}){3})(?:$|[^0-9.])")
        .expect("IPv4 pattern compiles")
});

#[derive(Debug, Deserialize)]
pub struct IpQuery {
    pub ip_address: String,
}

fn extract_ip(raw: &str) -> Option<&str> {
    IPV4.captures(raw)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
        .filter(|ip| ip.parse::<Ipv4Addr>().is_ok())
}

#[derive(Debug, Serialize)]
struct DestroyEntryView {
    ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    instance: Option<String>,
    requested_at: u64,
    attempts: u32,
    stuck: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,
}

/// GET /destroy
pub async fn list_destroy(State(state): State<ApiState>) -> Response {
    let entries = match state.store.list_destroy_queue() {
        Ok(entries) => entries,
        Err(e) => return state_error(&e),
    };
    let proxies: Vec<DestroyEntryView> = entries
        .into_iter()
        .map(|entry| DestroyEntryView {
            provider: entry.group.as_ref().map(|k| k.provider.clone()),
            instance: entry.group.as_ref().map(|k| k.instance.clone()),
            ip: entry.ip,
            requested_at: entry.requested_at,
            attempts: entry.attempts,
            stuck: entry.stuck,
            last_error: entry.last_error,
        })
        .collect();
    Json(json!({ "total": proxies.len(), "proxies": proxies })).into_response()
}

/// DELETE /destroy?ip_address=
pub async fn request_destroy(State(state): State<ApiState>, Query(query): Query<IpQuery>) -> Response {
    let Some(ip) = extract_ip(&query.ip_address) else {
        return error_response("Invalid IP address", StatusCode::UNPROCESSABLE_ENTITY);
    };
    match state.store.enqueue_destroy(ip, RetireReason::Operator, now_millis()) {
        Ok(queued) => {
            if queued {
                info!(%ip, "operator queued proxy for destruction");
                state.destroy_wake.notify_one();
                state.controller_wake.notify_one();
            }
            Json(json!({
                "message": "Proxy scheduled for deletion",
                "proxy": { "ip": ip },
            }))
            .into_response()
        }
        Err(StateError::NotFound(_)) => error_response("IP not found", StatusCode::NOT_FOUND),
        Err(e) => state_error(&e),
    }
}

/// GET /restart
pub async fn list_restart(State(state): State<ApiState>) -> Response {
    match state.store.list_restart_queue() {
        Ok(entries) => {
            let proxies: Vec<serde_json::Value> = entries
                .into_iter()
                .map(|(key, proxy)| {
                    json!({
                        "ip": proxy.ip,
                        "provider": key.provider,
                        "instance": key.instance,
                        "state": proxy.state,
                    })
                })
                .collect();
            Json(json!({ "total": proxies.len(), "proxies": proxies })).into_response()
        }
        Err(e) => state_error(&e),
    }
}

/// DELETE /restart?ip_address=
pub async fn request_restart(State(state): State<ApiState>, Query(query): Query<IpQuery>) -> Response {
    let Some(ip) = extract_ip(&query.ip_address) else {
        return error_response("Invalid IP address", StatusCode::UNPROCESSABLE_ENTITY);
    };
    match state.store.request_restart(ip) {
        Ok(true) => {
            info!(%ip, "operator requested proxy restart");
            state.controller_wake.notify_one();
            Json(json!({
                "message": "Proxy scheduled for restart",
                "proxy": { "ip": ip },
            }))
            .into_response()
        }
        Ok(false) => Json(json!({
            "message": "Proxy already being replaced",
            "proxy": { "ip": ip },
        }))
        .into_response(),
        Err(StateError::NotFound(_)) => error_response("IP not found", StatusCode::NOT_FOUND),
        Err(e) => state_error(&e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use cloudproxy_core::AuthConfig;
    use cloudproxy_rollout::{PolicyHandle, RollingPolicy};
    use cloudproxy_state::{FleetStore, GroupKey, InstanceGroup, Proxy, ProxyState, Scaling};

    fn test_state() -> ApiState {
        let store = FleetStore::open_in_memory().unwrap();
        let mut group = InstanceGroup::new(GroupKey::new("hetzner", "default"), Scaling { min: 1, max: 3 });
        group.add_proxy(Proxy::new("5.6.7.8", 1)).unwrap();
        group.add_proxy(Proxy::new("5.6.7.9", 2)).unwrap();
        store.declare(group).unwrap();
        ApiState::new(
            store,
            PolicyHandle::new(RollingPolicy::default()).unwrap(),
            AuthConfig::default(),
        )
    }

    fn query(ip: &str) -> Query<IpQuery> {
        Query(IpQuery {
            ip_address: ip.to_string(),
        })
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn extracts_ip_from_proxy_url() {
        assert_eq!(extract_ip("http://u:p@5.6.7.8:8899"), Some("5.6.7.8"));
        assert_eq!(extract_ip("5.6.7.8"), Some("5.6.7.8"));
        assert_eq!(extract_ip("not-an-ip"), None);
        assert_eq!(extract_ip("999.1.1.1"), None);
        assert_eq!(extract_ip("10.0.0.1000"), None);
        assert_eq!(extract_ip("1234.5.6.7"), None);
        assert_eq!(extract_ip("5.6.7.8.9"), None);
    }

    #[tokio::test]
    async fn destroy_known_proxy() {
        let state = test_state();
        let resp = request_destroy(State(state.clone()), query("http://5.6.7.8:8899")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["message"], "Proxy scheduled for deletion");
        assert_eq!(body["proxy"]["ip"], "5.6.7.8");

        let body = body_json(list_destroy(State(state.clone())).await).await;
        assert_eq!(body["total"], 1);
        assert_eq!(body["proxies"][0]["ip"], "5.6.7.8");
        assert_eq!(body["proxies"][0]["provider"], "hetzner");
        assert_eq!(body["proxies"][0]["stuck"], false);
    }

    #[tokio::test]
    async fn destroy_unknown_ip_is_404_and_queue_unchanged() {
        let state = test_state();
        let resp = request_destroy(State(state.clone()), query("1.2.3.4")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body = body_json(resp).await;
        assert_eq!(body["error"], "IP not found");
        assert!(state.store.list_destroy_queue().unwrap().is_empty());
    }

    #[tokio::test]
    async fn overlong_address_does_not_match_a_shorter_proxy() {
        let state = test_state();
        let resp = request_destroy(State(state.clone()), query("5.6.7.89")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let resp = request_destroy(State(state.clone()), query("5.6.7.8000")).await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let resp = request_restart(State(state.clone()), query("5.6.7.8000")).await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(state.store.list_destroy_queue().unwrap().is_empty());
        assert!(state.store.list_restart_queue().unwrap().is_empty());
    }

    #[tokio::test]
    async fn destroy_garbage_is_422() {
        let resp = request_destroy(State(test_state()), query("nope")).await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn restart_queue_lists_requests() {
        let state = test_state();
        let resp = request_restart(State(state.clone()), query("5.6.7.9")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let again = body_json(request_restart(State(state.clone()), query("5.6.7.9")).await).await;
        assert_eq!(again["message"], "Proxy already being replaced");

        let body = body_json(list_restart(State(state.clone())).await).await;
        assert_eq!(body["total"], 1);
        assert_eq!(body["proxies"][0]["ip"], "5.6.7.9");
        assert_eq!(body["proxies"][0]["state"], json!(ProxyState::Active));

        let resp = request_restart(State(state), query("9.9.9.9")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
