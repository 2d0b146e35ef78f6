//! HTTP handlers and the application route table.
//!
//! Route tiers:
//! - public: health, status, setup, login, register, OpenAPI document
//! - session: logout, current user (authenticated + CSRF)
//! - policy: policy administration (authenticated + RBAC + CSRF)

use axum::{
    Extension, Json, Router,
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;
use std::sync::Arc;

use super::{record_route, state::AppState};

pub mod health;
pub mod policies;
pub mod system;
pub mod users;

/// Application routes with their gate tiers, before the outer layers.
#[must_use]
pub fn application_routes(state: &AppState) -> Router {
    let gate = state.gate();

    let public = Router::new()
        .route("/health", get(health::health).options(health::health))
        .route("/system/status", get(system::status))
        .route("/system/setup", post(system::setup_installed))
        .route("/users/login", post(users::login))
        .route("/users/register", post(users::register))
        .route("/openapi.json", get(openapi_json));

    let session = gate.require_session(
        Router::new()
            .route("/users/logout", post(users::logout))
            .route("/users/me", get(users::me)),
    );

    let policy = gate.require_policy(Router::new().route(
        "/rbac/policies",
        get(policies::list)
            .post(policies::add)
            .delete(policies::remove),
    ));

    public.merge(session).merge(policy)
}

/// Add optional authentication and the shared state to a route set.
#[must_use]
pub fn with_app_layers(router: Router, state: Arc<AppState>) -> Router {
    state
        .gate()
        .authenticated(router.route_layer(middleware::from_fn(record_route)))
        .layer(Extension(state))
}

#[must_use]
pub fn application_router(state: Arc<AppState>) -> Router {
    with_app_layers(application_routes(&state), state)
}

async fn openapi_json() -> impl IntoResponse {
    Json(super::openapi())
}

pub(crate) fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}
