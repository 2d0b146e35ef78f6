//! # Quire (content management backend core)
//!
//! `quire` holds the session, authorization and bootstrap core of the Quire
//! CMS. Content CRUD lives elsewhere; this crate owns the pieces every request
//! passes through.
//!
//! ## Sessions
//!
//! Sessions are stateless. Login issues an HMAC-signed token (HS256 only)
//! carrying the user id and the SHA-256 hash of a freshly generated
//! anti-forgery token. The token goes into an `HttpOnly` cookie; the
//! anti-forgery token goes into a script-readable cookie that the client echoes
//! back in `X-CSRF-Token` on every mutating request.
//!
//! ## Authorization
//!
//! Every request runs through the gate: optional authentication, an
//! authenticated-only barrier where required, an RBAC check on
//! `(role, route pattern, verb)` and the double-submit + binding-hash CSRF
//! check. Unauthenticated callers carry the `anonymous` role so policies can
//! grant public reads explicitly.
//!
//! ## Setup and modes
//!
//! The server starts in setup mode and switches, exactly once, to application
//! mode when storage is reachable and the installation row says installed.
//! `POST /system/setup` provisions the first administrator in a single
//! transaction guarded by a row lock plus a conditional update, then hot-swaps
//! the router without restarting the process.

pub mod api;
pub mod auth;
pub mod cli;
pub mod gate;
pub mod rbac;
pub mod store;
pub mod system;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};
