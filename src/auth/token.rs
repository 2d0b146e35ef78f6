//! Signed session tokens (JWT, HS256).
//!
//! Flow Overview:
//! 1) Hash the anti-forgery token into the `csrf_h` claim.
//! 2) Sign `{sub, csrf_h, iat, exp, iss}` with the server secret.
//! 3) On verify, accept only HS256, the configured issuer and an unexpired `exp`.
//!
//! Signature comparison is delegated to `jsonwebtoken`, which compares MACs in
//! constant time.

use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode, errors::ErrorKind,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use super::csrf::binding_hash;

const ALGORITHM: Algorithm = Algorithm::HS256;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("token expired")]
    Expired,
    #[error("malformed token")]
    Malformed,
    #[error("invalid token signature")]
    SignatureInvalid,
    #[error("token ttl out of range")]
    InvalidTtl,
    #[error("failed to sign token: {0}")]
    Signing(String),
}

/// Claims carried by a session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Subject (user id).
    pub sub: Uuid,
    /// SHA-256 hex of the paired anti-forgery token.
    pub csrf_h: String,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
}

impl SessionClaims {
    #[must_use]
    pub fn expires_at(&self) -> Option<OffsetDateTime> {
        OffsetDateTime::from_unix_timestamp(self.exp).ok()
    }
}

#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: OffsetDateTime,
}

pub struct TokenCodec {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    issuer: String,
}

impl TokenCodec {
    #[must_use]
    pub fn new(secret: &[u8], issuer: &str) -> Self {
        let mut validation = Validation::new(ALGORITHM);
        validation.leeway = 0;
        validation.validate_aud = false;
        validation.set_issuer(&[issuer]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);

        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
            issuer: issuer.to_string(),
        }
    }

    /// Sign a token for `subject`, binding it to `binding_input` (the anti-forgery token).
    ///
    /// # Errors
    /// Returns `InvalidTtl` for a non-positive ttl or one whose expiry is not
    /// representable, or `Signing` if encoding fails.
    pub fn issue(
        &self,
        subject: Uuid,
        binding_input: &str,
        ttl: Duration,
    ) -> Result<IssuedToken, TokenError> {
        self.issue_at(subject, binding_input, ttl, OffsetDateTime::now_utc())
    }

    pub(crate) fn issue_at(
        &self,
        subject: Uuid,
        binding_input: &str,
        ttl: Duration,
        now: OffsetDateTime,
    ) -> Result<IssuedToken, TokenError> {
        if !ttl.is_positive() {
            return Err(TokenError::InvalidTtl);
        }
        let expires_at = now.checked_add(ttl).ok_or(TokenError::InvalidTtl)?;
        let claims = SessionClaims {
            sub: subject,
            csrf_h: binding_hash(binding_input),
            iat: now.unix_timestamp(),
            exp: expires_at.unix_timestamp(),
            iss: self.issuer.clone(),
        };
        let token = encode(&Header::new(ALGORITHM), &claims, &self.encoding_key)
            .map_err(|err| TokenError::Signing(err.to_string()))?;
        Ok(IssuedToken { token, expires_at })
    }

    /// Verify signature, algorithm, issuer and expiry, returning the claims.
    ///
    /// # Errors
    /// `Expired`, `SignatureInvalid` (including algorithm substitution) or `Malformed`.
    pub fn verify(&self, token: &str) -> Result<SessionClaims, TokenError> {
        decode::<SessionClaims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|err| match err.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                ErrorKind::InvalidSignature
                | ErrorKind::InvalidAlgorithm
                | ErrorKind::InvalidAlgorithmName => TokenError::SignatureInvalid,
                _ => TokenError::Malformed,
            })
    }
}

impl fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCodec")
            .field("algorithm", &ALGORITHM)
            .field("issuer", &self.issuer)
            .finish_non_exhaustive()
    }
}
