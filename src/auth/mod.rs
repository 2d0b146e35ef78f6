//! Session establishment and validation.
//!
//! Flow Overview:
//! 1) Login generates an anti-forgery token and hashes it (binding hash).
//! 2) A signed session token carries the user id and the binding hash.
//! 3) Both land in cookies: the session token `HttpOnly`, the anti-forgery
//!    token readable by scripts so the client can echo it in `X-CSRF-Token`.
//! 4) Incoming requests are authenticated from the cookie (or a bearer header)
//!    and mutating requests must present a matching anti-forgery pair whose
//!    hash equals the binding hash inside the verified token.
//!
//! Security boundaries:
//! - Sessions are self-contained; there is no server-side revocation list.
//! - Only HS256 tokens are accepted.
//! - Token and anti-forgery values are never logged.

mod config;
pub mod csrf;
mod error;
pub mod password;
pub mod session;
pub mod token;

pub use config::{AuthConfig, MAX_SESSION_TTL_SECONDS, parse_same_site};
pub use error::AuthError;
pub use session::{EstablishedSession, SessionManager, SetCookies};
pub use token::{SessionClaims, TokenCodec, TokenError};

/// Header carrying the echoed anti-forgery token on mutating requests.
pub const CSRF_HEADER: &str = "x-csrf-token";
