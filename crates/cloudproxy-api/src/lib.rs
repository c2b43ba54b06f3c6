//! cloudproxy-api — REST API for the proxy fleet controller.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/` | Active proxies with connection URLs (`?offset&limit`) |
//! | GET | `/random` | One active proxy |
//! | GET | `/providers` | Every provider and instance group |
//! | GET | `/providers/{provider}` | One provider |
//! | PATCH | `/providers/{provider}` | Update the `default` instance group |
//! | GET | `/providers/{provider}/{instance}` | One instance group |
//! | PATCH | `/providers/{provider}/{instance}` | Update scaling/enabled |
//! | GET | `/rolling` | Rolling policy and per-group rotation status |
//! | PATCH | `/rolling` | Update the rolling policy |
//! | GET | `/destroy` | Destroy queue |
//! | DELETE | `/destroy?ip_address=` | Queue a proxy for destruction |
//! | GET | `/restart` | Restart queue |
//! | DELETE | `/restart?ip_address=` | Queue a proxy for restart |
//! | GET | `/auth` | Proxy credentials |

pub mod handlers;
pub mod queue_handlers;
pub mod rolling_handlers;

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio::sync::Notify;

use cloudproxy_core::AuthConfig;
use cloudproxy_rollout::PolicyHandle;
use cloudproxy_state::{FleetStore, StateError};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: FleetStore,
    pub policy: PolicyHandle,
    pub auth: AuthConfig,
    /// Triggers an immediate reconciliation tick.
    pub controller_wake: Arc<Notify>,
    /// Triggers an immediate destroy queue drain.
    pub destroy_wake: Arc<Notify>,
}

impl ApiState {
    pub fn new(store: FleetStore, policy: PolicyHandle, auth: AuthConfig) -> Self {
        Self {
            store,
            policy,
            auth,
            controller_wake: Arc::new(Notify::new()),
            destroy_wake: Arc::new(Notify::new()),
        }
    }
}

#[derive(serde::Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
}

pub(crate) fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ErrorBody {
            success: false,
            error: msg.to_string(),
        }),
    )
        .into_response()
}

pub(crate) fn state_error(e: &StateError) -> Response {
    let status = match e {
        StateError::NotFound(_) => StatusCode::NOT_FOUND,
        StateError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        StateError::Conflict(_) | StateError::InvalidTransition { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(&e.to_string(), status)
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/", get(handlers::list_proxies))
        .route("/random", get(handlers::random_proxy))
        .route("/auth", get(handlers::auth_settings))
        .route("/providers", get(handlers::list_providers))
        .route(
            "/providers/{provider}",
            get(handlers::get_provider).patch(handlers::patch_default_instance),
        )
        .route(
            "/providers/{provider}/{instance}",
            get(handlers::get_instance).patch(handlers::patch_instance),
        )
        .route(
            "/rolling",
            get(rolling_handlers::get_rolling).patch(rolling_handlers::patch_rolling),
        )
        .route(
            "/destroy",
            get(queue_handlers::list_destroy).delete(queue_handlers::request_destroy),
        )
        .route(
            "/restart",
            get(queue_handlers::list_restart).delete(queue_handlers::request_restart),
        )
        .with_state(state)
}
