use clap::{Arg, ArgAction, ArgMatches, Command, builder::ValueParser};
use cookie::SameSite;
use secrecy::SecretString;

use crate::auth::{AuthConfig, MAX_SESSION_TTL_SECONDS, parse_same_site};

pub const ARG_SESSION_SECRET: &str = "session-secret";
pub const ARG_SESSION_TTL_SECONDS: &str = "session-ttl-seconds";
pub const ARG_SESSION_ISSUER: &str = "session-issuer";
pub const ARG_AUTH_COOKIE: &str = "auth-cookie";
pub const ARG_CSRF_COOKIE: &str = "csrf-cookie";
pub const ARG_COOKIE_PATH: &str = "cookie-path";
pub const ARG_COOKIE_DOMAIN: &str = "cookie-domain";
pub const ARG_COOKIE_SECURE: &str = "cookie-secure";
pub const ARG_COOKIE_SAME_SITE: &str = "cookie-same-site";

/// Shortest accepted HMAC signing secret, in bytes.
pub const MIN_SECRET_LEN: usize = 32;

#[derive(Debug)]
pub struct Options {
    pub config: AuthConfig,
}

impl Options {
    /// Parse session and cookie arguments into an `AuthConfig`.
    ///
    /// # Errors
    /// Returns an error if required arguments are missing.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let secret = matches
            .get_one::<String>(ARG_SESSION_SECRET)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("missing required argument: --{ARG_SESSION_SECRET}"))?;

        let read_string = |id: &str, default: &str| {
            matches
                .get_one::<String>(id)
                .cloned()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let config = AuthConfig::new(SecretString::from(secret))
            .with_session_ttl_seconds(
                matches
                    .get_one::<i64>(ARG_SESSION_TTL_SECONDS)
                    .copied()
                    .unwrap_or(86_400),
            )
            .with_issuer(read_string(ARG_SESSION_ISSUER, "quire"))
            .with_auth_cookie(read_string(ARG_AUTH_COOKIE, "auth"))
            .with_csrf_cookie(read_string(ARG_CSRF_COOKIE, "csrf"))
            .with_cookie_path(read_string(ARG_COOKIE_PATH, "/"))
            .with_cookie_domain(matches.get_one::<String>(ARG_COOKIE_DOMAIN).cloned())
            .with_cookie_secure(
                matches
                    .get_one::<bool>(ARG_COOKIE_SECURE)
                    .copied()
                    .unwrap_or(true),
            )
            .with_cookie_same_site(
                matches
                    .get_one::<SameSite>(ARG_COOKIE_SAME_SITE)
                    .copied()
                    .unwrap_or(SameSite::Lax),
            );

        Ok(Self { config })
    }
}

#[must_use]
pub fn validator_secret() -> ValueParser {
    ValueParser::from(move |secret: &str| -> std::result::Result<String, String> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(format!(
                "session secret must be at least {MIN_SECRET_LEN} bytes"
            ));
        }
        Ok(secret.to_string())
    })
}

#[must_use]
pub fn validator_same_site() -> ValueParser {
    ValueParser::from(parse_same_site)
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    let command = with_session_args(command);
    with_cookie_args(command)
}

fn with_session_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_SESSION_SECRET)
                .long(ARG_SESSION_SECRET)
                .help("HMAC secret used to sign session tokens (at least 32 bytes)")
                .env("QUIRE_SESSION_SECRET")
                .hide_env_values(true)
                .required(true)
                .value_parser(validator_secret()),
        )
        .arg(
            Arg::new(ARG_SESSION_TTL_SECONDS)
                .long(ARG_SESSION_TTL_SECONDS)
                .help("Session token and cookie lifetime in seconds (at most one year)")
                .env("QUIRE_SESSION_TTL_SECONDS")
                .default_value("86400")
                .value_parser(clap::value_parser!(i64).range(1..=MAX_SESSION_TTL_SECONDS)),
        )
        .arg(
            Arg::new(ARG_SESSION_ISSUER)
                .long(ARG_SESSION_ISSUER)
                .help("Issuer claim written to and required in session tokens")
                .env("QUIRE_SESSION_ISSUER")
                .default_value("quire"),
        )
}

fn with_cookie_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_AUTH_COOKIE)
                .long(ARG_AUTH_COOKIE)
                .help("Name of the session cookie")
                .env("QUIRE_AUTH_COOKIE")
                .default_value("auth"),
        )
        .arg(
            Arg::new(ARG_CSRF_COOKIE)
                .long(ARG_CSRF_COOKIE)
                .help("Name of the anti-forgery cookie")
                .env("QUIRE_CSRF_COOKIE")
                .default_value("csrf"),
        )
        .arg(
            Arg::new(ARG_COOKIE_PATH)
                .long(ARG_COOKIE_PATH)
                .help("Path attribute of both cookies")
                .env("QUIRE_COOKIE_PATH")
                .default_value("/"),
        )
        .arg(
            Arg::new(ARG_COOKIE_DOMAIN)
                .long(ARG_COOKIE_DOMAIN)
                .help("Domain attribute of both cookies")
                .env("QUIRE_COOKIE_DOMAIN"),
        )
        .arg(
            Arg::new(ARG_COOKIE_SECURE)
                .long(ARG_COOKIE_SECURE)
                .help("Mark cookies Secure (disable only for plain-HTTP development)")
                .env("QUIRE_COOKIE_SECURE")
                .default_value("true")
                .action(ArgAction::Set)
                .value_parser(clap::value_parser!(bool)),
        )
        .arg(
            Arg::new(ARG_COOKIE_SAME_SITE)
                .long(ARG_COOKIE_SAME_SITE)
                .help("SameSite attribute of both cookies: lax, strict or none")
                .env("QUIRE_COOKIE_SAME_SITE")
                .default_value("lax")
                .value_parser(validator_same_site()),
        )
}
