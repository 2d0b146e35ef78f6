//! Explicit session configuration, built once at startup.

use cookie::SameSite;
use secrecy::{ExposeSecret, SecretString};
use std::fmt;

const DEFAULT_SESSION_TTL_SECONDS: i64 = 24 * 60 * 60;
/// Longest accepted session lifetime (one year).
pub const MAX_SESSION_TTL_SECONDS: i64 = 365 * 24 * 60 * 60;
const DEFAULT_ISSUER: &str = "quire";
const DEFAULT_AUTH_COOKIE: &str = "auth";
const DEFAULT_CSRF_COOKIE: &str = "csrf";
const DEFAULT_COOKIE_PATH: &str = "/";

#[derive(Clone)]
pub struct AuthConfig {
    secret: SecretString,
    session_ttl_seconds: i64,
    issuer: String,
    auth_cookie: String,
    csrf_cookie: String,
    cookie_path: String,
    cookie_domain: Option<String>,
    cookie_secure: bool,
    cookie_same_site: SameSite,
}

impl AuthConfig {
    #[must_use]
    pub fn new(secret: SecretString) -> Self {
        Self {
            secret,
            session_ttl_seconds: DEFAULT_SESSION_TTL_SECONDS,
            issuer: DEFAULT_ISSUER.to_string(),
            auth_cookie: DEFAULT_AUTH_COOKIE.to_string(),
            csrf_cookie: DEFAULT_CSRF_COOKIE.to_string(),
            cookie_path: DEFAULT_COOKIE_PATH.to_string(),
            cookie_domain: None,
            cookie_secure: true,
            cookie_same_site: SameSite::Lax,
        }
    }

    #[must_use]
    pub fn with_session_ttl_seconds(mut self, seconds: i64) -> Self {
        self.session_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_issuer(mut self, issuer: String) -> Self {
        self.issuer = issuer;
        self
    }

    #[must_use]
    pub fn with_auth_cookie(mut self, name: String) -> Self {
        self.auth_cookie = name;
        self
    }

    #[must_use]
    pub fn with_csrf_cookie(mut self, name: String) -> Self {
        self.csrf_cookie = name;
        self
    }

    #[must_use]
    pub fn with_cookie_path(mut self, path: String) -> Self {
        self.cookie_path = path;
        self
    }

    #[must_use]
    pub fn with_cookie_domain(mut self, domain: Option<String>) -> Self {
        self.cookie_domain = domain.filter(|value| !value.trim().is_empty());
        self
    }

    #[must_use]
    pub fn with_cookie_secure(mut self, secure: bool) -> Self {
        self.cookie_secure = secure;
        self
    }

    #[must_use]
    pub fn with_cookie_same_site(mut self, same_site: SameSite) -> Self {
        self.cookie_same_site = same_site;
        self
    }

    pub(crate) fn secret(&self) -> &[u8] {
        self.secret.expose_secret().as_bytes()
    }

    #[must_use]
    pub fn session_ttl_seconds(&self) -> i64 {
        self.session_ttl_seconds
    }

    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    #[must_use]
    pub fn auth_cookie(&self) -> &str {
        &self.auth_cookie
    }

    #[must_use]
    pub fn csrf_cookie(&self) -> &str {
        &self.csrf_cookie
    }

    #[must_use]
    pub fn cookie_path(&self) -> &str {
        &self.cookie_path
    }

    #[must_use]
    pub fn cookie_domain(&self) -> Option<&str> {
        self.cookie_domain.as_deref()
    }

    #[must_use]
    pub fn cookie_secure(&self) -> bool {
        self.cookie_secure
    }

    #[must_use]
    pub fn cookie_same_site(&self) -> SameSite {
        self.cookie_same_site
    }
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("secret", &"***")
            .field("session_ttl_seconds", &self.session_ttl_seconds)
            .field("issuer", &self.issuer)
            .field("auth_cookie", &self.auth_cookie)
            .field("csrf_cookie", &self.csrf_cookie)
            .field("cookie_path", &self.cookie_path)
            .field("cookie_domain", &self.cookie_domain)
            .field("cookie_secure", &self.cookie_secure)
            .field("cookie_same_site", &self.cookie_same_site)
            .finish()
    }
}

/// Parse a `SameSite` attribute name, case-insensitively.
///
/// # Errors
/// Returns an error string for anything other than `lax`, `strict` or `none`.
pub fn parse_same_site(value: &str) -> Result<SameSite, String> {
    match value.trim().to_lowercase().as_str() {
        "lax" => Ok(SameSite::Lax),
        "strict" => Ok(SameSite::Strict),
        "none" => Ok(SameSite::None),
        other => Err(format!("invalid same-site value: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_cookie_names() {
        let config = AuthConfig::new(SecretString::from("s".repeat(32)));
        assert_eq!(config.auth_cookie(), "auth");
        assert_eq!(config.csrf_cookie(), "csrf");
        assert_eq!(config.cookie_path(), "/");
        assert!(config.cookie_secure());
        assert_eq!(config.cookie_same_site(), SameSite::Lax);
        assert_eq!(config.session_ttl_seconds(), 86_400);
    }

    #[test]
    fn blank_domain_is_ignored() {
        let config = AuthConfig::new(SecretString::from("s".repeat(32)))
            .with_cookie_domain(Some("  ".to_string()));
        assert_eq!(config.cookie_domain(), None);
    }

    #[test]
    fn debug_redacts_secret() {
        let config = AuthConfig::new(SecretString::from("super-secret-signing-key-material"));
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("***"));
    }

    #[test]
    fn parse_same_site_accepts_known_values() {
        assert_eq!(parse_same_site("Strict"), Ok(SameSite::Strict));
        assert_eq!(parse_same_site("none"), Ok(SameSite::None));
        assert_eq!(parse_same_site(" LAX "), Ok(SameSite::Lax));
        assert!(parse_same_site("sometimes").is_err());
    }
}
