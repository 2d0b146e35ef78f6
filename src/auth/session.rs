//! Cookie-backed sessions.
//!
//! Flow Overview:
//! 1) `establish_session` mints an anti-forgery token, signs a session token
//!    bound to it and returns both as `Set-Cookie` values.
//! 2) `authenticate` reads the session cookie (falling back to a bearer header)
//!    and verifies it; an invalid credential also queues cookie clears.
//! 3) `validate_csrf` checks the double-submit pair against the binding hash
//!    carried by the verified token.

use axum::{
    http::{
        HeaderMap, HeaderValue,
        header::{AUTHORIZATION, COOKIE, SET_COOKIE},
    },
    response::{IntoResponseParts, ResponseParts},
};
use cookie::Cookie;
use std::convert::Infallible;
use time::{Duration, OffsetDateTime};
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::{
    AuthConfig, AuthError, CSRF_HEADER,
    csrf::{binding_hash, constant_time_eq, generate_token},
    token::{SessionClaims, TokenCodec},
};

/// Pending `Set-Cookie` values for a response.
#[derive(Debug, Clone, Default)]
pub struct SetCookies(Vec<Cookie<'static>>);

impl SetCookies {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, cookie: Cookie<'static>) {
        self.0.push(cookie);
    }

    pub fn extend(&mut self, other: SetCookies) {
        self.0.extend(other.0);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Cookie<'static>> {
        self.0.iter()
    }

    /// Append one `Set-Cookie` header per cookie.
    pub fn append_to(&self, headers: &mut HeaderMap) {
        for cookie in &self.0 {
            match HeaderValue::from_str(&cookie.to_string()) {
                Ok(value) => {
                    headers.append(SET_COOKIE, value);
                }
                Err(err) => warn!(cookie = cookie.name(), "Skipping unencodable cookie: {err}"),
            }
        }
    }
}

impl IntoResponseParts for SetCookies {
    type Error = Infallible;

    fn into_response_parts(self, mut res: ResponseParts) -> Result<ResponseParts, Self::Error> {
        self.append_to(res.headers_mut());
        Ok(res)
    }
}

#[derive(Debug, Clone)]
pub struct EstablishedSession {
    pub cookies: SetCookies,
    pub csrf_token: String,
    pub expires_at: OffsetDateTime,
}

#[derive(Debug)]
pub struct SessionManager {
    config: AuthConfig,
    codec: TokenCodec,
}

impl SessionManager {
    #[must_use]
    pub fn new(config: AuthConfig) -> Self {
        let codec = TokenCodec::new(config.secret(), config.issuer());
        Self { config, codec }
    }

    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Issue a session for `subject`.
    ///
    /// # Errors
    /// Returns `AuthError::Internal` if randomness or signing fails.
    pub fn establish_session(&self, subject: Uuid) -> Result<EstablishedSession, AuthError> {
        let csrf_token = generate_token().map_err(|err| {
            error!("Failed to generate anti-forgery token: {err:#}");
            AuthError::Internal
        })?;
        let ttl = Duration::seconds(self.config.session_ttl_seconds());
        let issued = self.codec.issue(subject, &csrf_token, ttl).map_err(|err| {
            error!("Failed to issue session token: {err}");
            AuthError::Internal
        })?;

        let mut cookies = SetCookies::new();
        cookies.push(self.cookie(
            self.config.auth_cookie(),
            issued.token,
            true,
            ttl,
            issued.expires_at,
        ));
        cookies.push(self.cookie(
            self.config.csrf_cookie(),
            csrf_token.clone(),
            false,
            ttl,
            issued.expires_at,
        ));

        Ok(EstablishedSession {
            cookies,
            csrf_token,
            expires_at: issued.expires_at,
        })
    }

    /// Cookies that clear both the session and anti-forgery cookies.
    #[must_use]
    pub fn destroy_session(&self) -> SetCookies {
        let mut cookies = SetCookies::new();
        for (name, http_only) in [
            (self.config.auth_cookie(), true),
            (self.config.csrf_cookie(), false),
        ] {
            cookies.push(self.cookie(
                name,
                String::new(),
                http_only,
                Duration::ZERO,
                OffsetDateTime::UNIX_EPOCH,
            ));
        }
        cookies
    }

    /// Resolve the session claims for a request.
    ///
    /// The session cookie takes precedence over `Authorization: Bearer`.
    ///
    /// # Errors
    /// `NoCredential` when neither is present, `InvalidCredential` when the
    /// token fails verification (clearing cookies are appended to `out`).
    pub fn authenticate(
        &self,
        headers: &HeaderMap,
        out: &mut SetCookies,
    ) -> Result<SessionClaims, AuthError> {
        let Some(token) =
            cookie_value(headers, self.config.auth_cookie()).or_else(|| bearer_token(headers))
        else {
            return Err(AuthError::NoCredential);
        };

        self.codec.verify(&token).map_err(|err| {
            debug!("Session token rejected: {err}");
            out.extend(self.destroy_session());
            AuthError::InvalidCredential
        })
    }

    /// Double-submit check: cookie and header must match, and their hash must
    /// equal the binding hash from the session token.
    ///
    /// # Errors
    /// Returns `AuthError::CsrfMismatch` on any missing or mismatched value.
    pub fn validate_csrf(
        &self,
        headers: &HeaderMap,
        expected_binding_hash: &str,
    ) -> Result<(), AuthError> {
        let cookie = cookie_value(headers, self.config.csrf_cookie()).ok_or(AuthError::CsrfMismatch)?;
        let header = headers
            .get(CSRF_HEADER)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .ok_or(AuthError::CsrfMismatch)?;

        if !constant_time_eq(&cookie, header) {
            return Err(AuthError::CsrfMismatch);
        }
        if !constant_time_eq(&binding_hash(&cookie), expected_binding_hash) {
            return Err(AuthError::CsrfMismatch);
        }
        Ok(())
    }

    fn cookie(
        &self,
        name: &str,
        value: String,
        http_only: bool,
        max_age: Duration,
        expires: OffsetDateTime,
    ) -> Cookie<'static> {
        let mut builder = Cookie::build((name.to_string(), value))
            .path(self.config.cookie_path().to_string())
            .http_only(http_only)
            .secure(self.config.cookie_secure())
            .same_site(self.config.cookie_same_site())
            .max_age(max_age)
            .expires(expires);
        if let Some(domain) = self.config.cookie_domain() {
            builder = builder.domain(domain.to_string());
        }
        builder.build()
    }
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(Cookie::split_parse)
        .filter_map(Result::ok)
        .find(|cookie| cookie.name() == name && !cookie.value().is_empty())
        .map(|cookie| cookie.value().to_string())
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}
