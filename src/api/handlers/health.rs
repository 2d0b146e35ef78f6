use axum::{
    body::Body,
    extract::Extension,
    http::{HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{Instrument, debug, error, info_span};
use utoipa::ToSchema;

use crate::{
    GIT_COMMIT_HASH,
    api::{bootstrap::Bootstrapper, mode::Mode, state::AppState},
    store::SystemRepository,
};

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct Health {
    commit: String,
    name: String,
    version: String,
    mode: String,
    database: String,
}

#[utoipa::path(
    get,
    path= "/health",
    responses (
        (status = 200, description = "Storage is reachable", body = [Health]),
        (status = 503, description = "Storage is unreachable", body = [Health])
    ),
    tag= "health"
)]
// axum handler for health
pub async fn health(method: Method, Extension(state): Extension<Arc<AppState>>) -> Response {
    let database = ping(Some(state.repositories().system.as_ref())).await;
    respond(&method, Mode::Application, database)
}

/// Health while serving setup routes; storage may not be connected yet.
pub async fn setup_health(
    method: Method,
    Extension(bootstrapper): Extension<Arc<Bootstrapper>>,
) -> Response {
    let repositories = bootstrapper.repositories().await;
    let database = ping(repositories.as_ref().map(|repos| repos.system.as_ref())).await;
    respond(&method, Mode::Setup, database)
}

async fn ping(system: Option<&dyn SystemRepository>) -> Result<(), StatusCode> {
    let Some(system) = system else {
        error!("Storage is not connected");
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    };
    let ping_span = info_span!("db.ping", db.system = "postgresql", db.operation = "PING");
    system.ping().instrument(ping_span).await.map_err(|err| {
        error!("Failed to ping database: {err}");
        StatusCode::SERVICE_UNAVAILABLE
    })
}

fn respond(method: &Method, mode: Mode, database: Result<(), StatusCode>) -> Response {
    let health = Health {
        commit: GIT_COMMIT_HASH.to_string(),
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        mode: mode.to_string(),
        database: if database.is_ok() {
            "ok".to_string()
        } else {
            "error".to_string()
        },
    };

    let body = if *method == Method::GET {
        Json(&health).into_response()
    } else {
        Body::empty().into_response()
    };

    let short_hash = health.commit.get(0..7).unwrap_or("");

    let mut headers = HeaderMap::new();
    match format!("{}:{}:{}", health.name, health.version, short_hash).parse::<HeaderValue>() {
        Ok(value) => {
            debug!("X-App header: {:?}", value);
            headers.insert("X-App", value);
        }
        Err(err) => error!("Failed to parse X-App header: {}", err),
    }

    match database {
        Ok(()) => (StatusCode::OK, headers, body).into_response(),
        Err(status) => (status, headers, body).into_response(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[tokio::test]
    async fn healthy_get_reports_mode_and_header() {
        let response = respond(&Method::GET, Mode::Setup, Ok(()));
        assert_eq!(response.status(), StatusCode::OK);
        let x_app = response.headers().get("X-App").unwrap().to_str().unwrap();
        assert!(x_app.starts_with(&format!(
            "{}:{}:",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        )));
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(health["mode"], "setup");
        assert_eq!(health["database"], "ok");
    }

    #[tokio::test]
    async fn unreachable_storage_is_503_and_options_has_no_body() {
        let response = respond(
            &Method::OPTIONS,
            Mode::Application,
            Err(StatusCode::SERVICE_UNAVAILABLE),
        );
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn missing_storage_is_unavailable() {
        assert_eq!(ping(None).await, Err(StatusCode::SERVICE_UNAVAILABLE));
    }
}
