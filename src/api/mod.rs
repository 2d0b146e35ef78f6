use anyhow::{Context, Result, anyhow};
use axum::{
    body::Body,
    extract::MatchedPath,
    http::{
        HeaderName, HeaderValue, Method, Request,
        header::{AUTHORIZATION, CONTENT_TYPE},
    },
    middleware::Next,
    response::Response,
};
use secrecy::SecretString;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    request_id::PropagateRequestIdLayer,
    set_header::SetRequestHeaderLayer,
    trace::TraceLayer,
};
use tracing::{Span, field::Empty, info, info_span};
use ulid::Ulid;
use url::Url;

use crate::{auth::CSRF_HEADER, store::PgConnector};

pub mod bootstrap;
pub mod handlers;
pub mod mode;
pub mod state;

mod openapi;

pub use openapi::openapi;

use self::state::CoreSettings;

/// Everything the server needs, assembled once by the CLI.
#[derive(Debug)]
pub struct ServerConfig {
    port: u16,
    dsn: SecretString,
    core: CoreSettings,
    cors_origin: Option<String>,
}

impl ServerConfig {
    #[must_use]
    pub fn new(port: u16, dsn: SecretString, core: CoreSettings) -> Self {
        Self {
            port,
            dsn,
            core,
            cors_origin: None,
        }
    }

    #[must_use]
    pub fn with_cors_origin(mut self, cors_origin: Option<String>) -> Self {
        self.cors_origin = cors_origin;
        self
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub fn core(&self) -> &CoreSettings {
        &self.core
    }

    #[must_use]
    pub fn cors_origin(&self) -> Option<&str> {
        self.cors_origin.as_deref()
    }
}

/// Start the server
/// # Errors
/// Return error if failed to start the server
pub async fn new(config: ServerConfig) -> Result<()> {
    let ServerConfig {
        port,
        dsn,
        core,
        cors_origin,
    } = config;

    let cors = cors_layer(cors_origin.as_deref())?;

    let connector = Arc::new(PgConnector::new(dsn));
    let (mode_router, bootstrapper) = bootstrap::assemble(core, connector);
    let mode = bootstrapper.start().await;
    info!(%mode, "Bootstrap complete");

    let app = mode_router.service().layer(
        ServiceBuilder::new()
            .layer(SetRequestHeaderLayer::if_not_present(
                HeaderName::from_static("x-request-id"),
                |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
            ))
            .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                "x-request-id",
            )))
            .layer(TraceLayer::new_for_http().make_span_with(make_span))
            .layer(cors),
    );

    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.target = request.uri().path(),
        http.route = Empty,
        request_id
    )
}

/// Record the matched route template on the request span.
///
/// The trace layer wraps the mode router's fallback, where no route has been
/// matched yet, so each inner router fills `http.route` in after routing.
pub(crate) async fn record_route(request: Request<Body>, next: Next) -> Response {
    if let Some(route) = request.extensions().get::<MatchedPath>() {
        Span::current().record("http.route", route.as_str());
    }
    next.run(request).await
}

/// Without a configured origin no CORS headers are emitted.
fn cors_layer(cors_origin: Option<&str>) -> Result<CorsLayer> {
    let Some(origin) = cors_origin else {
        return Ok(CorsLayer::new());
    };
    Ok(CorsLayer::new()
        .allow_headers([
            CONTENT_TYPE,
            AUTHORIZATION,
            HeaderName::from_static(CSRF_HEADER),
        ])
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_origin(AllowOrigin::exact(allowed_origin(origin)?))
        .allow_credentials(true))
}

fn allowed_origin(cors_origin: &str) -> Result<HeaderValue> {
    let parsed =
        Url::parse(cors_origin).with_context(|| format!("Invalid CORS origin: {cors_origin}"))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| anyhow!("CORS origin must include a valid host: {cors_origin}"))?;
    let port = parsed
        .port()
        .map_or_else(String::new, |port| format!(":{port}"));
    let origin = format!("{}://{}{}", parsed.scheme(), host, port);
    HeaderValue::from_str(&origin).context("Failed to build CORS origin header")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!("Failed to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Gracefully shutdown");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use axum::{Router, http::StatusCode, routing::get};
    use tower::ServiceExt;
    use tracing::{
        Subscriber,
        field::{Field, Visit},
        span::{Attributes, Id, Record},
    };
    use tracing_subscriber::{
        Layer,
        layer::{Context as LayerContext, SubscriberExt},
    };

    #[test]
    fn origin_is_reduced_to_scheme_host_port() {
        assert_eq!(
            allowed_origin("https://admin.quire.dev:8443/dashboard").unwrap(),
            "https://admin.quire.dev:8443"
        );
        assert_eq!(
            allowed_origin("https://quire.dev").unwrap(),
            "https://quire.dev"
        );
    }

    #[test]
    fn invalid_origin_is_rejected() {
        assert!(allowed_origin("not a url").is_err());
        assert!(cors_layer(Some("mailto:team@quire.dev")).is_err());
        assert!(cors_layer(None).is_ok());
    }

    #[derive(Clone, Default)]
    struct RouteCapture(Arc<std::sync::Mutex<Vec<String>>>);

    struct RouteVisitor<'a>(&'a mut Vec<String>);

    impl Visit for RouteVisitor<'_> {
        fn record_str(&mut self, field: &Field, value: &str) {
            if field.name() == "http.route" {
                self.0.push(value.to_string());
            }
        }

        fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
            if field.name() == "http.route" {
                self.0.push(format!("{value:?}"));
            }
        }
    }

    impl<S: Subscriber> Layer<S> for RouteCapture {
        fn on_new_span(&self, attrs: &Attributes<'_>, _id: &Id, _ctx: LayerContext<'_, S>) {
            attrs.record(&mut RouteVisitor(&mut self.0.lock().unwrap()));
        }

        fn on_record(&self, _id: &Id, values: &Record<'_>, _ctx: LayerContext<'_, S>) {
            values.record(&mut RouteVisitor(&mut self.0.lock().unwrap()));
        }
    }

    #[tokio::test]
    async fn request_span_records_matched_route() {
        let capture = RouteCapture::default();
        let _guard = tracing::subscriber::set_default(
            tracing_subscriber::registry().with(capture.clone()),
        );

        let inner = Router::new()
            .route("/posts/:id", get(|| async { "post" }))
            .route_layer(axum::middleware::from_fn(record_route));
        let app = Router::new()
            .fallback_service(inner)
            .layer(TraceLayer::new_for_http().make_span_with(make_span));

        let response = app
            .oneshot(Request::builder().uri("/posts/42").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(*capture.0.lock().unwrap(), vec!["/posts/:id".to_string()]);
    }
}
