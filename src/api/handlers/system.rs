use axum::{
    extract::Extension,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use crate::{
    api::{bootstrap::Bootstrapper, state::AppState},
    system::{SetupError, SetupParams, SystemStatus},
};

#[utoipa::path(
    get,
    path= "/system/status",
    responses (
        (status = 200, description = "Installation status", body = SystemStatus),
        (status = 500, description = "Storage failure"),
    ),
    tag= "system"
)]
pub async fn status(Extension(state): Extension<Arc<AppState>>) -> Response {
    match state.initializer().status().await {
        Ok(status) => Json(status).into_response(),
        Err(err) => {
            error!("Failed to read installation status: {err}");
            SetupError::Internal.into_response()
        }
    }
}

/// The application routes only exist once the system is installed.
pub async fn setup_installed() -> Response {
    SetupError::AlreadyInstalled.into_response()
}

/// Status while serving setup routes; unreachable storage reads as not installed.
pub async fn setup_status(Extension(bootstrapper): Extension<Arc<Bootstrapper>>) -> Response {
    let Some(repositories) = bootstrapper.repositories().await else {
        return Json(SystemStatus::not_installed()).into_response();
    };
    match bootstrapper.initializer(&repositories).status().await {
        Ok(status) => Json(status).into_response(),
        Err(err) => {
            warn!("Failed to read installation status: {err}");
            Json(SystemStatus::not_installed()).into_response()
        }
    }
}

#[utoipa::path(
    post,
    path= "/system/setup",
    request_body = SetupParams,
    responses (
        (status = 201, description = "System installed", body = SystemStatus),
        (status = 400, description = "Invalid setup parameters"),
        (status = 409, description = "System already installed"),
        (status = 500, description = "Storage failure or timeout"),
    ),
    tag= "system"
)]
#[instrument(skip_all)]
pub async fn setup(
    Extension(bootstrapper): Extension<Arc<Bootstrapper>>,
    payload: Option<Json<SetupParams>>,
) -> Response {
    let Some(Json(params)) = payload else {
        return SetupError::InvalidInput("invalid request body".to_string()).into_response();
    };
    let Some(repositories) = bootstrapper.repositories().await else {
        error!("Setup requested but storage is unreachable");
        return SetupError::Internal.into_response();
    };

    match bootstrapper.initializer(&repositories).setup_once(params).await {
        Ok(installation) => {
            if let Err(err) = bootstrapper.rebootstrap().await {
                error!("Re-bootstrap after setup failed, staying in setup mode: {err:#}");
            } else {
                info!("Setup complete, application routes active");
            }
            (StatusCode::CREATED, Json(SystemStatus::from(installation))).into_response()
        }
        Err(SetupError::AlreadyInstalled) => {
            if let Err(err) = bootstrapper.rebootstrap().await {
                error!("Re-bootstrap after concurrent setup failed: {err:#}");
            }
            SetupError::AlreadyInstalled.into_response()
        }
        Err(err) => err.into_response(),
    }
}
