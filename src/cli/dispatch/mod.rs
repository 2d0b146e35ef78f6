//! Command-line argument dispatch.
//!
//! Maps validated CLI matches to an action carrying explicit configuration
//! values; nothing downstream reads the environment.

use crate::cli::actions::{Action, server::Args};
use crate::cli::commands::{
    ARG_CORS_ORIGIN, ARG_DSN, ARG_POLICY_MODEL, ARG_PORT, ARG_SETUP_TIMEOUT_SECONDS, auth,
};
use anyhow::{Context, Result};
use secrecy::SecretString;

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>(ARG_PORT).copied().unwrap_or(8080);
    let dsn = matches
        .get_one::<String>(ARG_DSN)
        .cloned()
        .context("missing required argument: --dsn")?;

    // Helper to filter empty strings which clap might pass through if env vars are set to ""
    let get_non_empty = |id: &str| {
        matches
            .get_one::<String>(id)
            .cloned()
            .filter(|v| !v.trim().is_empty())
    };

    let auth_opts = auth::Options::parse(matches)?;

    Ok(Action::Server(Args {
        port,
        dsn: SecretString::from(dsn),
        auth: auth_opts.config,
        policy_model: get_non_empty(ARG_POLICY_MODEL),
        setup_timeout_seconds: matches
            .get_one::<u64>(ARG_SETUP_TIMEOUT_SECONDS)
            .copied()
            .unwrap_or(30),
        cors_origin: get_non_empty(ARG_CORS_ORIGIN),
    }))
}
