use crate::{
    api::{self, ServerConfig, state::CoreSettings},
    auth::AuthConfig,
    rbac::{DEFAULT_POLICY, Policy, parse_policies},
};
use anyhow::{Context, Result};
use secrecy::SecretString;
use std::{fs, time::Duration};
use tracing::{debug, info};

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: SecretString,
    pub auth: AuthConfig,
    pub policy_model: Option<String>,
    pub setup_timeout_seconds: u64,
    pub cors_origin: Option<String>,
}

/// Execute the server action.
/// # Errors
/// Returns an error if the policy seed cannot be read or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    let policy_seed = load_policy_seed(args.policy_model.as_deref())?;
    debug!(rules = policy_seed.len(), "Loaded policy seed");

    let core = CoreSettings::new(args.auth)
        .with_policy_seed(policy_seed)
        .with_setup_timeout(Duration::from_secs(args.setup_timeout_seconds));

    info!(port = args.port, "Starting server");

    api::new(ServerConfig::new(args.port, args.dsn, core).with_cors_origin(args.cors_origin)).await
}

/// Read the seed file at `path`, or the built-in policy when none is given.
fn load_policy_seed(path: Option<&str>) -> Result<Vec<Policy>> {
    match path {
        Some(path) => {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read policy model: {path}"))?;
            parse_policies(&contents).with_context(|| format!("Invalid policy model: {path}"))
        }
        None => parse_policies(DEFAULT_POLICY).context("Invalid built-in policy"),
    }
}
