//! Runtime policy administration.
//!
//! Mutations go through the enforcer, which persists before touching the
//! in-memory set, so a change applies from the next request on.

use axum::{
    Json,
    extract::Extension,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, info, instrument};
use utoipa::ToSchema;

use super::error_response;
use crate::{
    api::state::AppState,
    rbac::{Policy, RbacError},
};

#[derive(ToSchema, Deserialize, Debug)]
pub struct PolicyRequest {
    pub role: String,
    pub resource: String,
    pub action: String,
}

impl TryFrom<PolicyRequest> for Policy {
    type Error = RbacError;

    fn try_from(request: PolicyRequest) -> Result<Self, Self::Error> {
        Self::new(&request.role, &request.resource, &request.action)
    }
}

#[utoipa::path(
    get,
    path= "/rbac/policies",
    responses (
        (status = 200, description = "Active policies", body = [Policy]),
        (status = 401, description = "No session"),
        (status = 403, description = "Permission denied"),
    ),
    tag= "rbac"
)]
pub async fn list(Extension(state): Extension<Arc<AppState>>) -> Response {
    match state.enforcer().policies() {
        Ok(policies) => Json(policies).into_response(),
        Err(err) => {
            error!("Failed to read policies: {err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
        }
    }
}

#[utoipa::path(
    post,
    path= "/rbac/policies",
    request_body = PolicyRequest,
    responses (
        (status = 201, description = "Policy added", body = Policy),
        (status = 200, description = "Policy already present", body = Policy),
        (status = 400, description = "Invalid policy"),
        (status = 403, description = "Permission denied or anti-forgery check failed"),
    ),
    tag= "rbac"
)]
#[instrument(skip_all)]
pub async fn add(
    Extension(state): Extension<Arc<AppState>>,
    payload: Option<Json<PolicyRequest>>,
) -> Response {
    let policy = match parse(payload) {
        Ok(policy) => policy,
        Err(response) => return response,
    };

    match state.enforcer().add_policy(policy.clone()).await {
        Ok(true) => {
            info!(
                role = %policy.role,
                resource = %policy.resource,
                action = %policy.action,
                "Policy added"
            );
            (StatusCode::CREATED, Json(policy)).into_response()
        }
        Ok(false) => (StatusCode::OK, Json(policy)).into_response(),
        Err(err) => {
            error!("Failed to add policy: {err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
        }
    }
}

#[utoipa::path(
    delete,
    path= "/rbac/policies",
    request_body = PolicyRequest,
    responses (
        (status = 204, description = "Policy removed"),
        (status = 400, description = "Invalid policy"),
        (status = 404, description = "Policy not found"),
    ),
    tag= "rbac"
)]
#[instrument(skip_all)]
pub async fn remove(
    Extension(state): Extension<Arc<AppState>>,
    payload: Option<Json<PolicyRequest>>,
) -> Response {
    let policy = match parse(payload) {
        Ok(policy) => policy,
        Err(response) => return response,
    };

    match state.enforcer().remove_policy(&policy).await {
        Ok(true) => {
            info!(
                role = %policy.role,
                resource = %policy.resource,
                action = %policy.action,
                "Policy removed"
            );
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(false) => error_response(StatusCode::NOT_FOUND, "policy not found"),
        Err(err) => {
            error!("Failed to remove policy: {err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
        }
    }
}

fn parse(payload: Option<Json<PolicyRequest>>) -> Result<Policy, Response> {
    let Some(Json(request)) = payload else {
        return Err(error_response(StatusCode::BAD_REQUEST, "invalid request body"));
    };
    Policy::try_from(request).map_err(|err| error_response(StatusCode::BAD_REQUEST, &err.to_string()))
}
