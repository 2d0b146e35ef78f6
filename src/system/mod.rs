//! One-time system initialization and installation status.
//!
//! Flow Overview:
//! 1) Normalise and validate the setup request, then hash the admin password
//!    before any transaction is opened.
//! 2) In one transaction: insert the singleton row if absent, lock it, bail out
//!    with `AlreadyInstalled` if it is installed, create the admin account and
//!    flip `installed` with a conditional update.
//! 3) Zero affected rows means another writer won; the transaction is abandoned.
//!
//! The whole transaction is bounded by the setup timeout. A timeout or an
//! aborted request drops the transaction, which rolls it back.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{fmt, sync::Arc, time::Duration};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{error, info, warn};
use utoipa::ToSchema;

use crate::{
    auth::password,
    store::{Installation, NewUser, SetupTransaction, StoreError, SystemRepository},
};

/// Role of the account created during setup.
pub const ADMIN_ROLE: &str = "admin";
/// Role of self-registered accounts.
pub const USER_ROLE: &str = "user";

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("already installed")]
    AlreadyInstalled,
    #[error("{0}")]
    InvalidInput(String),
    #[error("internal server error")]
    Internal,
}

impl IntoResponse for SetupError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::AlreadyInstalled => StatusCode::CONFLICT,
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Clone, Deserialize, ToSchema)]
pub struct SetupParams {
    pub site_name: String,
    pub admin_username: String,
    pub admin_email: String,
    pub admin_password: String,
}

impl fmt::Debug for SetupParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SetupParams")
            .field("site_name", &self.site_name)
            .field("admin_username", &self.admin_username)
            .field("admin_email", &self.admin_email)
            .field("admin_password", &"***")
            .finish()
    }
}

impl SetupParams {
    fn normalise(self) -> Result<Self, SetupError> {
        let normalised = Self {
            site_name: self.site_name.trim().to_string(),
            admin_username: self.admin_username.trim().to_string(),
            admin_email: self.admin_email.trim().to_string(),
            admin_password: self.admin_password,
        };
        for (field, value) in [
            ("site_name", normalised.site_name.as_str()),
            ("admin_username", normalised.admin_username.as_str()),
            ("admin_email", normalised.admin_email.as_str()),
            ("admin_password", normalised.admin_password.as_str()),
        ] {
            if value.is_empty() {
                return Err(SetupError::InvalidInput(format!("{field} is required")));
            }
        }
        if !valid_email(&normalised.admin_email) {
            return Err(SetupError::InvalidInput("admin_email is invalid".to_string()));
        }
        Ok(normalised)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct SystemStatus {
    pub installed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site_name: Option<String>,
}

impl SystemStatus {
    #[must_use]
    pub fn not_installed() -> Self {
        Self {
            installed: false,
            site_name: None,
        }
    }
}

impl From<Installation> for SystemStatus {
    fn from(installation: Installation) -> Self {
        let site_name = Some(installation.site_name.trim().to_string())
            .filter(|name| installation.installed && !name.is_empty());
        Self {
            installed: installation.installed,
            site_name,
        }
    }
}

/// Basic address shape check shared by setup and registration.
#[must_use]
pub fn valid_email(email: &str) -> bool {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").is_ok_and(|re| re.is_match(email))
}

pub struct SystemInitializer {
    system: Arc<dyn SystemRepository>,
    setup_timeout: Duration,
}

impl SystemInitializer {
    #[must_use]
    pub fn new(system: Arc<dyn SystemRepository>, setup_timeout: Duration) -> Self {
        Self {
            system,
            setup_timeout,
        }
    }

    /// Installation status as reported to clients.
    ///
    /// # Errors
    /// Returns the storage error if the installation row cannot be read.
    pub async fn status(&self) -> Result<SystemStatus, StoreError> {
        Ok(self
            .system
            .installation()
            .await?
            .map_or_else(SystemStatus::not_installed, SystemStatus::from))
    }

    /// Provision the first administrator and mark the system installed.
    ///
    /// # Errors
    /// `AlreadyInstalled` if the system is (or concurrently became) installed,
    /// `InvalidInput` for bad parameters or a duplicate admin account, and
    /// `Internal` for storage failures and timeouts.
    pub async fn setup_once(&self, params: SetupParams) -> Result<Installation, SetupError> {
        let params = params.normalise()?;

        let secret = params.admin_password.clone();
        let password_hash = tokio::task::spawn_blocking(move || password::hash_password(&secret))
            .await
            .map_err(|err| {
                error!("Password hashing task failed: {err}");
                SetupError::Internal
            })?
            .map_err(|err| {
                error!("Failed to hash admin password: {err:#}");
                SetupError::Internal
            })?;

        if let Ok(result) =
            tokio::time::timeout(self.setup_timeout, self.run(&params, password_hash)).await
        {
            result
        } else {
            error!(
                timeout_ms = u64::try_from(self.setup_timeout.as_millis()).unwrap_or(u64::MAX),
                "Setup transaction timed out"
            );
            Err(SetupError::Internal)
        }
    }

    async fn run(
        &self,
        params: &SetupParams,
        password_hash: String,
    ) -> Result<Installation, SetupError> {
        let mut tx = self.system.begin().await.map_err(storage_failure)?;

        tx.ensure_singleton_row().await.map_err(storage_failure)?;
        let current = tx.lock_installation().await.map_err(storage_failure)?;
        if current.installed {
            abandon(tx).await;
            return Err(SetupError::AlreadyInstalled);
        }

        let admin = NewUser {
            username: params.admin_username.clone(),
            email: params.admin_email.clone(),
            password_hash,
            role: ADMIN_ROLE.to_string(),
        };
        let admin = match tx.create_admin(admin).await {
            Ok(admin) => admin,
            Err(StoreError::Duplicate) => {
                abandon(tx).await;
                return Err(SetupError::InvalidInput(
                    "admin username or email already exists".to_string(),
                ));
            }
            Err(err) => {
                abandon(tx).await;
                return Err(storage_failure(err));
            }
        };

        let installed_at = OffsetDateTime::now_utc();
        let affected = tx
            .mark_installed(&params.site_name, installed_at)
            .await
            .map_err(storage_failure)?;
        if affected == 0 {
            warn!("Installation flag already flipped by a concurrent setup");
            abandon(tx).await;
            return Err(SetupError::AlreadyInstalled);
        }

        tx.commit().await.map_err(storage_failure)?;
        info!(site_name = %params.site_name, admin_id = %admin.id, "System installed");

        Ok(Installation {
            installed: true,
            site_name: params.site_name.clone(),
            installed_at: Some(installed_at),
        })
    }
}

fn storage_failure(err: StoreError) -> SetupError {
    error!("Setup storage failure: {err}");
    SetupError::Internal
}

async fn abandon(tx: Box<dyn SetupTransaction>) {
    if let Err(err) = tx.rollback().await {
        warn!("Failed to roll back setup transaction: {err}");
    }
}
