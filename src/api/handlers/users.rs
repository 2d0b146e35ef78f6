//! Login, logout, self-registration and the current user.
//!
//! Flow Overview:
//! 1) Login resolves the user by name and verifies the Argon2id hash off the
//!    async runtime. Unknown users burn the same work as a real check.
//! 2) A session is established: signed token and anti-forgery token cookies.
//! 3) Logout and `/users/me` sit behind the session tier of the gate.

use axum::{
    Json,
    extract::Extension,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};
use time::OffsetDateTime;
use tracing::{error, info, instrument};
use utoipa::ToSchema;

use super::error_response;
use crate::{
    api::state::AppState,
    auth::{
        AuthError,
        password::{hash_password, verify_against_dummy, verify_password},
    },
    gate::RequestContext,
    store::{NewUser, StoreError, UserView},
    system::{USER_ROLE, valid_email},
};

const MIN_PASSWORD_LEN: usize = 8;

#[derive(ToSchema, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginRequest")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

#[derive(ToSchema, Serialize, Debug)]
pub struct LoginResponse {
    pub user: UserView,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

#[derive(ToSchema, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

impl fmt::Debug for RegisterRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisterRequest")
            .field("username", &self.username)
            .field("email", &self.email)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

#[utoipa::path(
    post,
    path= "/users/login",
    request_body = LoginRequest,
    responses (
        (status = 200, description = "Session established, auth and csrf cookies set", body = LoginResponse),
        (status = 401, description = "Invalid credentials"),
    ),
    tag= "users"
)]
#[instrument(skip_all)]
pub async fn login(
    Extension(state): Extension<Arc<AppState>>,
    payload: Option<Json<LoginRequest>>,
) -> Response {
    let Some(Json(request)) = payload else {
        return error_response(StatusCode::BAD_REQUEST, "invalid request body");
    };
    let username = request.username.trim().to_string();

    let user = match state.repositories().users.find_by_username(&username).await {
        Ok(user) => user,
        Err(err) => {
            error!("Failed to look up user: {err}");
            return AuthError::Internal.into_response();
        }
    };

    let password = request.password;
    let verified = match user {
        Some(user) => {
            let stored_hash = user.password_hash.clone();
            match tokio::task::spawn_blocking(move || verify_password(&password, &stored_hash))
                .await
            {
                Ok(true) => Some(user),
                Ok(false) => None,
                Err(err) => {
                    error!("Password verification task failed: {err}");
                    return AuthError::Internal.into_response();
                }
            }
        }
        None => {
            if let Err(err) =
                tokio::task::spawn_blocking(move || verify_against_dummy(&password)).await
            {
                error!("Password verification task failed: {err}");
                return AuthError::Internal.into_response();
            }
            None
        }
    };

    let Some(user) = verified else {
        info!("Login rejected");
        return AuthError::InvalidCredential.into_response();
    };

    match state.sessions().establish_session(user.id) {
        Ok(session) => {
            info!(user_id = %user.id, "Session established");
            let body = LoginResponse {
                user: UserView::from(&user),
                expires_at: session.expires_at,
            };
            (StatusCode::OK, session.cookies, Json(body)).into_response()
        }
        Err(err) => err.into_response(),
    }
}

#[utoipa::path(
    post,
    path= "/users/register",
    request_body = RegisterRequest,
    responses (
        (status = 201, description = "Account created", body = UserView),
        (status = 400, description = "Invalid registration data"),
        (status = 409, description = "Username or email already exists"),
    ),
    tag= "users"
)]
#[instrument(skip_all)]
pub async fn register(
    Extension(state): Extension<Arc<AppState>>,
    payload: Option<Json<RegisterRequest>>,
) -> Response {
    let Some(Json(request)) = payload else {
        return error_response(StatusCode::BAD_REQUEST, "invalid request body");
    };

    let username = request.username.trim().to_string();
    let email = request.email.trim().to_string();
    if username.is_empty() || email.is_empty() || request.password.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "username, email and password are required",
        );
    }
    if !valid_email(&email) {
        return error_response(StatusCode::BAD_REQUEST, "invalid email");
    }
    if request.password.chars().count() < MIN_PASSWORD_LEN {
        return error_response(
            StatusCode::BAD_REQUEST,
            "password must be at least 8 characters",
        );
    }

    let password = request.password;
    let password_hash = match tokio::task::spawn_blocking(move || hash_password(&password)).await
    {
        Ok(Ok(hash)) => hash,
        Ok(Err(err)) => {
            error!("Failed to hash password: {err:#}");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal server error");
        }
        Err(err) => {
            error!("Password hashing task failed: {err}");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal server error");
        }
    };

    let new_user = NewUser {
        username,
        email,
        password_hash,
        role: USER_ROLE.to_string(),
    };
    match state.repositories().users.create(new_user).await {
        Ok(user) => {
            info!(user_id = %user.id, "User registered");
            (StatusCode::CREATED, Json(UserView::from(&user))).into_response()
        }
        Err(StoreError::Duplicate) => {
            error_response(StatusCode::CONFLICT, "username or email already exists")
        }
        Err(err) => {
            error!("Failed to create user: {err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
        }
    }
}

#[utoipa::path(
    post,
    path= "/users/logout",
    responses (
        (status = 200, description = "Session cookies cleared"),
        (status = 401, description = "No session"),
        (status = 403, description = "Anti-forgery check failed"),
    ),
    tag= "users"
)]
pub async fn logout(Extension(state): Extension<Arc<AppState>>) -> Response {
    (
        StatusCode::OK,
        state.sessions().destroy_session(),
        Json(serde_json::json!({ "message": "logged out" })),
    )
        .into_response()
}

#[utoipa::path(
    get,
    path= "/users/me",
    responses (
        (status = 200, description = "The authenticated user", body = UserView),
        (status = 401, description = "No session"),
    ),
    tag= "users"
)]
pub async fn me(Extension(state): Extension<Arc<AppState>>, context: RequestContext) -> Response {
    let Some(subject_id) = context.subject_id else {
        return AuthError::NoCredential.into_response();
    };
    match state.repositories().users.find_by_id(subject_id).await {
        Ok(Some(user)) => Json(UserView::from(&user)).into_response(),
        Ok(None) => (
            state.sessions().destroy_session(),
            AuthError::InvalidCredential,
        )
            .into_response(),
        Err(err) => {
            error!("Failed to load current user: {err}");
            AuthError::Internal.into_response()
        }
    }
}
