#![allow(clippy::unwrap_used)]

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{
        HeaderMap, Method, Request, StatusCode,
        header::{CONTENT_TYPE, COOKIE, SET_COOKIE},
    },
    routing::get,
};
use cookie::Cookie;
use quire::{
    api::{
        handlers::{application_routes, with_app_layers},
        state::{AppState, CoreSettings},
    },
    auth::{AuthConfig, CSRF_HEADER, SessionManager},
    rbac::{DEFAULT_POLICY, parse_policies},
    store::{MemoryStore, Repositories},
    system::{SetupParams, SystemInitializer},
};
use secrecy::SecretString;
use serde_json::{Value, json};
use std::{sync::Arc, time::Duration};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tower::ServiceExt;

const ADMIN_PASSWORD: &str = "correct horse battery staple";

struct Session {
    cookie_header: String,
    csrf_token: String,
}

struct Reply {
    status: StatusCode,
    headers: HeaderMap,
    body: Value,
}

async fn app() -> Router {
    let store = MemoryStore::new();
    let repositories = Repositories::memory(store);
    SystemInitializer::new(repositories.system.clone(), Duration::from_secs(30))
        .setup_once(SetupParams {
            site_name: "Quire".to_string(),
            admin_username: "admin".to_string(),
            admin_email: "admin@example.test".to_string(),
            admin_password: ADMIN_PASSWORD.to_string(),
        })
        .await
        .unwrap();

    let settings = CoreSettings::new(
        AuthConfig::new(SecretString::from("integration-signing-secret-0123456789"))
            .with_cookie_secure(false),
    )
    .with_policy_seed(parse_policies(DEFAULT_POLICY).unwrap());
    let sessions = Arc::new(SessionManager::new(settings.auth().clone()));
    let state = AppState::build(repositories, sessions, &settings)
        .await
        .unwrap();

    let posts = state.gate().policy_only(
        Router::new().route("/posts", get(|| async { "[]" }).post(|| async { "created" })),
    );
    with_app_layers(application_routes(&state).merge(posts), state)
}

async fn send(app: &Router, request: Request<Body>) -> Reply {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    Reply {
        status,
        headers,
        body,
    }
}

fn json_request(method: Method, uri: &str, body: &Value, session: Option<&Session>) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(CONTENT_TYPE, "application/json");
    if let Some(session) = session {
        builder = builder
            .header(COOKIE, session.cookie_header.as_str())
            .header(CSRF_HEADER, session.csrf_token.as_str());
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn bare_request(method: Method, uri: &str, cookie_header: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(cookie_header) = cookie_header {
        builder = builder.header(COOKIE, cookie_header);
    }
    builder.body(Body::empty()).unwrap()
}

fn set_cookies(headers: &HeaderMap) -> Vec<Cookie<'static>> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .map(|value| Cookie::parse(value.to_str().unwrap().to_string()).unwrap())
        .collect()
}

async fn login(app: &Router, username: &str, password: &str) -> (Reply, Option<Session>) {
    let reply = send(
        app,
        json_request(
            Method::POST,
            "/users/login",
            &json!({ "username": username, "password": password }),
            None,
        ),
    )
    .await;
    if reply.status != StatusCode::OK {
        return (reply, None);
    }
    let cookies = set_cookies(&reply.headers);
    let csrf_token = cookies
        .iter()
        .find(|cookie| cookie.name() == "csrf")
        .map(|cookie| cookie.value().to_string())
        .unwrap();
    let cookie_header = cookies
        .iter()
        .map(|cookie| format!("{}={}", cookie.name(), cookie.value()))
        .collect::<Vec<_>>()
        .join("; ");
    (
        reply,
        Some(Session {
            cookie_header,
            csrf_token,
        }),
    )
}

#[tokio::test]
async fn login_sets_both_cookies_and_future_expiry() {
    let app = app().await;
    let (reply, session) = login(&app, "admin", ADMIN_PASSWORD).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert!(session.is_some());

    let cookies = set_cookies(&reply.headers);
    let auth = cookies.iter().find(|cookie| cookie.name() == "auth").unwrap();
    let csrf = cookies.iter().find(|cookie| cookie.name() == "csrf").unwrap();
    assert_eq!(auth.http_only(), Some(true));
    assert_ne!(csrf.http_only(), Some(true));

    assert_eq!(reply.body["user"]["username"], "admin");
    assert_eq!(reply.body["user"]["role"], "admin");
    assert!(reply.body["user"].get("password_hash").is_none());
    let expires_at =
        OffsetDateTime::parse(reply.body["expires_at"].as_str().unwrap(), &Rfc3339).unwrap();
    assert!(expires_at > OffsetDateTime::now_utc());
}

#[tokio::test]
async fn wrong_password_and_unknown_user_are_indistinguishable() {
    let app = app().await;
    let (wrong_password, _) = login(&app, "admin", "not the password").await;
    let (unknown_user, _) = login(&app, "nobody", ADMIN_PASSWORD).await;

    assert_eq!(wrong_password.status, StatusCode::UNAUTHORIZED);
    assert_eq!(unknown_user.status, StatusCode::UNAUTHORIZED);
    assert_eq!(wrong_password.body, unknown_user.body);
    assert_eq!(wrong_password.body["error"], "invalid credentials");
    assert!(wrong_password.headers.get(SET_COOKIE).is_none());
}

#[tokio::test]
async fn mutating_request_requires_csrf_header() {
    let app = app().await;
    let (_, session) = login(&app, "admin", ADMIN_PASSWORD).await;
    let session = session.unwrap();

    let without_header = send(
        &app,
        bare_request(Method::POST, "/posts", Some(&session.cookie_header)),
    )
    .await;
    assert_eq!(without_header.status, StatusCode::FORBIDDEN);

    let with_header = send(&app, json_request(Method::POST, "/posts", &json!({}), Some(&session))).await;
    assert_eq!(with_header.status, StatusCode::OK);
}

#[tokio::test]
async fn csrf_token_from_another_session_is_rejected() {
    let app = app().await;
    let (_, first) = login(&app, "admin", ADMIN_PASSWORD).await;
    let (_, second) = login(&app, "admin", ADMIN_PASSWORD).await;
    let first = first.unwrap();
    let second = second.unwrap();

    // Cookie and header agree, but they belong to a different session token.
    let auth_only = first
        .cookie_header
        .split("; ")
        .find(|pair| pair.starts_with("auth="))
        .unwrap();
    let mixed = Session {
        cookie_header: format!("{auth_only}; csrf={}", second.csrf_token),
        csrf_token: second.csrf_token.clone(),
    };
    let reply = send(&app, json_request(Method::POST, "/posts", &json!({}), Some(&mixed))).await;
    assert_eq!(reply.status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn anonymous_reads_are_allowed_by_policy() {
    let app = app().await;
    let reply = send(&app, bare_request(Method::GET, "/posts", None)).await;
    assert_eq!(reply.status, StatusCode::OK);

    let write = send(&app, bare_request(Method::POST, "/posts", None)).await;
    assert_eq!(write.status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn tampered_token_is_anonymous_and_cookies_are_cleared() {
    let app = app().await;
    let reply = send(
        &app,
        bare_request(Method::GET, "/posts", Some("auth=not.a.token; csrf=abc")),
    )
    .await;
    assert_eq!(reply.status, StatusCode::OK);
    let cleared = set_cookies(&reply.headers);
    assert!(
        cleared
            .iter()
            .any(|cookie| cookie.name() == "auth" && cookie.value().is_empty())
    );

    let me = send(
        &app,
        bare_request(Method::GET, "/users/me", Some("auth=not.a.token")),
    )
    .await;
    assert_eq!(me.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn me_returns_the_session_user() {
    let app = app().await;
    let (_, session) = login(&app, "admin", ADMIN_PASSWORD).await;
    let session = session.unwrap();

    let reply = send(
        &app,
        bare_request(Method::GET, "/users/me", Some(&session.cookie_header)),
    )
    .await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body["username"], "admin");
    assert_eq!(reply.body["email"], "admin@example.test");
}

#[tokio::test]
async fn logout_clears_cookies() {
    let app = app().await;
    let (_, session) = login(&app, "admin", ADMIN_PASSWORD).await;
    let session = session.unwrap();

    let without_csrf = send(
        &app,
        bare_request(Method::POST, "/users/logout", Some(&session.cookie_header)),
    )
    .await;
    assert_eq!(without_csrf.status, StatusCode::FORBIDDEN);

    let reply = send(
        &app,
        json_request(Method::POST, "/users/logout", &json!({}), Some(&session)),
    )
    .await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body["message"], "logged out");

    let cleared = set_cookies(&reply.headers);
    for name in ["auth", "csrf"] {
        let cookie = cleared.iter().find(|cookie| cookie.name() == name).unwrap();
        assert!(cookie.value().is_empty());
        assert_eq!(cookie.max_age(), Some(time::Duration::ZERO));
    }
}

#[tokio::test]
async fn registration_and_policy_administration() {
    let app = app().await;

    let created = send(
        &app,
        json_request(
            Method::POST,
            "/users/register",
            &json!({ "username": "writer", "email": "writer@example.test", "password": "long enough" }),
            None,
        ),
    )
    .await;
    assert_eq!(created.status, StatusCode::CREATED);
    assert_eq!(created.body["role"], "user");

    let duplicate = send(
        &app,
        json_request(
            Method::POST,
            "/users/register",
            &json!({ "username": "writer", "email": "other@example.test", "password": "long enough" }),
            None,
        ),
    )
    .await;
    assert_eq!(duplicate.status, StatusCode::CONFLICT);

    let invalid = send(
        &app,
        json_request(
            Method::POST,
            "/users/register",
            &json!({ "username": "x", "email": "not-an-email", "password": "long enough" }),
            None,
        ),
    )
    .await;
    assert_eq!(invalid.status, StatusCode::BAD_REQUEST);

    let (_, writer) = login(&app, "writer", "long enough").await;
    let writer = writer.unwrap();
    let denied = send(&app, json_request(Method::POST, "/posts", &json!({}), Some(&writer))).await;
    assert_eq!(denied.status, StatusCode::FORBIDDEN);
    let list_denied = send(
        &app,
        bare_request(Method::GET, "/rbac/policies", Some(&writer.cookie_header)),
    )
    .await;
    assert_eq!(list_denied.status, StatusCode::FORBIDDEN);

    let (_, admin) = login(&app, "admin", ADMIN_PASSWORD).await;
    let admin = admin.unwrap();
    let grant = json!({ "role": "user", "resource": "/posts", "action": "post" });
    let added = send(
        &app,
        json_request(Method::POST, "/rbac/policies", &grant, Some(&admin)),
    )
    .await;
    assert_eq!(added.status, StatusCode::CREATED);
    assert_eq!(added.body["action"], "POST");

    let again = send(
        &app,
        json_request(Method::POST, "/rbac/policies", &grant, Some(&admin)),
    )
    .await;
    assert_eq!(again.status, StatusCode::OK);

    let allowed = send(&app, json_request(Method::POST, "/posts", &json!({}), Some(&writer))).await;
    assert_eq!(allowed.status, StatusCode::OK);

    let listed = send(
        &app,
        bare_request(Method::GET, "/rbac/policies", Some(&admin.cookie_header)),
    )
    .await;
    assert_eq!(listed.status, StatusCode::OK);
    assert!(
        listed
            .body
            .as_array()
            .unwrap()
            .iter()
            .any(|policy| policy["role"] == "user" && policy["action"] == "POST")
    );

    let removed = send(
        &app,
        json_request(Method::DELETE, "/rbac/policies", &grant, Some(&admin)),
    )
    .await;
    assert_eq!(removed.status, StatusCode::NO_CONTENT);
    let missing = send(
        &app,
        json_request(Method::DELETE, "/rbac/policies", &grant, Some(&admin)),
    )
    .await;
    assert_eq!(missing.status, StatusCode::NOT_FOUND);

    let denied_again = send(&app, json_request(Method::POST, "/posts", &json!({}), Some(&writer))).await;
    assert_eq!(denied_again.status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn setup_route_is_closed_in_application_mode() {
    let app = app().await;
    let reply = send(
        &app,
        json_request(
            Method::POST,
            "/system/setup",
            &json!({
                "site_name": "Again",
                "admin_username": "root",
                "admin_email": "root@example.test",
                "admin_password": "pw"
            }),
            None,
        ),
    )
    .await;
    assert_eq!(reply.status, StatusCode::CONFLICT);

    let status = send(&app, bare_request(Method::GET, "/system/status", None)).await;
    assert_eq!(status.status, StatusCode::OK);
    assert_eq!(status.body, json!({ "installed": true, "site_name": "Quire" }));
}
