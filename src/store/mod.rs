//! Persistence seams.
//!
//! The core talks to storage only through the traits below. `PgStore` backs
//! them with PostgreSQL; `MemoryStore` keeps everything in process and is used
//! by tests and by setup-mode fallbacks.
//!
//! Security boundaries:
//! - Password hashes are stored, never plaintext.
//! - The installation row is only written inside a `SetupTransaction`.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use time::OffsetDateTime;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::rbac::PolicyAdapter;

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::{PgConnector, PgStore};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record already exists")]
    Duplicate,
    #[error("record not found")]
    NotFound,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("storage unavailable")]
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub role: String,
    pub created_at: OffsetDateTime,
}

/// Public projection of a user, safe to return over HTTP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct UserView {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub role: String,
}

impl From<&User> for UserView {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
            email: user.email.clone(),
            role: user.role.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub role: String,
}

/// The singleton installation record.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Installation {
    pub installed: bool,
    pub site_name: String,
    pub installed_at: Option<OffsetDateTime>,
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn find_by_username(&self, username: &str) -> Result<Option<User>, StoreError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError>;

    /// Insert a user. Returns `Duplicate` when the username or email is taken.
    async fn create(&self, user: NewUser) -> Result<User, StoreError>;
}

#[async_trait]
pub trait SystemRepository: Send + Sync {
    /// Current installation record, `None` before the row exists.
    async fn installation(&self) -> Result<Option<Installation>, StoreError>;

    async fn begin(&self) -> Result<Box<dyn SetupTransaction>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

/// One setup attempt. Dropping it without `commit` discards every change and
/// releases the installation row lock.
#[async_trait]
pub trait SetupTransaction: Send {
    /// Insert the singleton row if absent.
    async fn ensure_singleton_row(&mut self) -> Result<(), StoreError>;

    /// Lock the singleton row for the rest of the transaction and read it.
    async fn lock_installation(&mut self) -> Result<Installation, StoreError>;

    async fn create_admin(&mut self, user: NewUser) -> Result<User, StoreError>;

    /// Flip `installed` to true only if it is still false. Returns affected rows.
    async fn mark_installed(
        &mut self,
        site_name: &str,
        installed_at: OffsetDateTime,
    ) -> Result<u64, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// The set of repositories the application is wired with.
#[derive(Clone)]
pub struct Repositories {
    pub users: Arc<dyn UserRepository>,
    pub system: Arc<dyn SystemRepository>,
    pub policies: Arc<dyn PolicyAdapter>,
}

impl Repositories {
    #[must_use]
    pub fn postgres(store: PgStore) -> Self {
        let store = Arc::new(store);
        Self {
            users: store.clone(),
            system: store.clone(),
            policies: store,
        }
    }

    #[must_use]
    pub fn memory(store: MemoryStore) -> Self {
        let store = Arc::new(store);
        Self {
            users: store.clone(),
            system: store.clone(),
            policies: store,
        }
    }
}

/// Opens storage at bootstrap. Called again on every re-bootstrap attempt.
#[async_trait]
pub trait StorageConnector: Send + Sync {
    async fn connect(&self) -> anyhow::Result<Repositories>;
}

#[async_trait]
impl StorageConnector for Repositories {
    async fn connect(&self) -> anyhow::Result<Repositories> {
        Ok(self.clone())
    }
}
