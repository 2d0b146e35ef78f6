//! Per-request authorization pipeline.
//!
//! Flow Overview:
//! 1) `authenticate` (outer layer on every route) resolves the session into a
//!    `RequestContext`; failures leave the request anonymous.
//! 2) `require_authenticated` rejects requests without a subject (401).
//! 3) `authorize` resolves the subject role (or `anonymous`), takes the matched
//!    route pattern and verb, and asks the enforcer. Engine errors deny.
//! 4) `csrf_check` validates the double-submit pair on non-safe verbs of
//!    authenticated requests.
//!
//! Route tiers compose these with `route_layer`, so only matched routes are
//! gated and unknown paths still produce 404.

use async_trait::async_trait;
use axum::{
    Router,
    extract::{FromRequestParts, MatchedPath, Request, State},
    http::{header::SET_COOKIE, request::Parts},
    middleware::{Next, from_fn, from_fn_with_state},
    response::{IntoResponse, Response},
};
use std::{convert::Infallible, sync::Arc};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::{
    auth::{AuthError, SessionManager, SetCookies},
    rbac::{ANONYMOUS_ROLE, Enforcer},
    store::UserRepository,
};

/// Typed request-scoped identity, inserted by `authenticate`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub subject_id: Option<Uuid>,
    /// Set once `authorize` has resolved it.
    pub role: Option<String>,
    pub csrf_binding_hash: Option<String>,
}

impl RequestContext {
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.subject_id.is_some()
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts.extensions.get::<Self>().cloned().unwrap_or_default())
    }
}

/// Collaborators shared by the gate middleware.
#[derive(Clone)]
pub struct Gate {
    sessions: Arc<SessionManager>,
    enforcer: Arc<Enforcer>,
    users: Arc<dyn UserRepository>,
}

impl Gate {
    #[must_use]
    pub fn new(
        sessions: Arc<SessionManager>,
        enforcer: Arc<Enforcer>,
        users: Arc<dyn UserRepository>,
    ) -> Self {
        Self {
            sessions,
            enforcer,
            users,
        }
    }

    /// Wrap every route in optional authentication.
    #[must_use]
    pub fn authenticated(&self, router: Router) -> Router {
        router.layer(from_fn_with_state(self.clone(), authenticate))
    }

    /// Authenticated session plus CSRF; no policy lookup.
    #[must_use]
    pub fn require_session(&self, router: Router) -> Router {
        router
            .route_layer(from_fn_with_state(self.clone(), csrf_check))
            .route_layer(from_fn(require_authenticated))
    }

    /// Authenticated session, RBAC decision, then CSRF.
    #[must_use]
    pub fn require_policy(&self, router: Router) -> Router {
        router
            .route_layer(from_fn_with_state(self.clone(), csrf_check))
            .route_layer(from_fn_with_state(self.clone(), authorize))
            .route_layer(from_fn(require_authenticated))
    }

    /// RBAC decision (anonymous allowed when a policy grants it), then CSRF.
    #[must_use]
    pub fn policy_only(&self, router: Router) -> Router {
        router
            .route_layer(from_fn_with_state(self.clone(), csrf_check))
            .route_layer(from_fn_with_state(self.clone(), authorize))
    }
}

/// Optional authentication. Invalid credentials clear the session cookies
/// unless the handler set cookies of its own.
pub async fn authenticate(State(gate): State<Gate>, mut req: Request, next: Next) -> Response {
    let mut clear = SetCookies::new();
    let context = match gate.sessions.authenticate(req.headers(), &mut clear) {
        Ok(claims) => RequestContext {
            subject_id: Some(claims.sub),
            role: None,
            csrf_binding_hash: Some(claims.csrf_h),
        },
        Err(AuthError::NoCredential) => RequestContext::default(),
        Err(err) => {
            debug!("Treating request as anonymous: {err}");
            RequestContext::default()
        }
    };
    req.extensions_mut().insert(context);

    let mut response = next.run(req).await;
    if !clear.is_empty() && !response.headers().contains_key(SET_COOKIE) {
        clear.append_to(response.headers_mut());
    }
    response
}

pub async fn require_authenticated(req: Request, next: Next) -> Response {
    let authenticated = req
        .extensions()
        .get::<RequestContext>()
        .is_some_and(RequestContext::is_authenticated);
    if !authenticated {
        return AuthError::NoCredential.into_response();
    }
    next.run(req).await
}

pub async fn authorize(State(gate): State<Gate>, mut req: Request, next: Next) -> Response {
    let context = req
        .extensions()
        .get::<RequestContext>()
        .cloned()
        .unwrap_or_default();

    let role = match context.subject_id {
        None => ANONYMOUS_ROLE.to_string(),
        Some(subject_id) => match gate.users.find_by_id(subject_id).await {
            Ok(Some(user)) => user.role,
            Ok(None) => {
                warn!(subject_id = %subject_id, "Session subject no longer exists");
                return (gate.sessions.destroy_session(), AuthError::InvalidCredential)
                    .into_response();
            }
            Err(err) => {
                error!("Failed to resolve subject role: {err}");
                return AuthError::Internal.into_response();
            }
        },
    };

    let resource = req.extensions().get::<MatchedPath>().map_or_else(
        || req.uri().path().to_string(),
        |path| path.as_str().to_string(),
    );
    let action = req.method().as_str().to_string();

    match gate.enforcer.enforce(&role, &resource, &action) {
        Ok(true) => {}
        Ok(false) => {
            warn!(role = %role, resource = %resource, action = %action, "Request denied by policy");
            return AuthError::PermissionDenied.into_response();
        }
        Err(err) => {
            error!(role = %role, resource = %resource, action = %action, "Policy engine failed, denying: {err}");
            return AuthError::PermissionDenied.into_response();
        }
    }

    req.extensions_mut().insert(RequestContext {
        role: Some(role),
        ..context
    });
    next.run(req).await
}

pub async fn csrf_check(State(gate): State<Gate>, req: Request, next: Next) -> Response {
    if req.method().is_safe() {
        return next.run(req).await;
    }
    let binding = req
        .extensions()
        .get::<RequestContext>()
        .and_then(|context| context.csrf_binding_hash.clone());
    let Some(binding) = binding else {
        return next.run(req).await;
    };
    if let Err(err) = gate.sessions.validate_csrf(req.headers(), &binding) {
        warn!(method = %req.method(), path = %req.uri().path(), "Anti-forgery check failed");
        return err.into_response();
    }
    next.run(req).await
}
