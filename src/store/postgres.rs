//! PostgreSQL storage.
//!
//! Flow Overview:
//! 1) `PgConnector` opens a pool and applies `sql/schema.sql`.
//! 2) Repositories run single statements inside `db.query` spans.
//! 3) Setup runs in one transaction: insert-if-absent, `SELECT ... FOR UPDATE`,
//!    admin insert, then a conditional update whose affected-row count is the
//!    second race check.

use anyhow::Context;
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgPoolOptions, postgres::PgRow};
use std::{fmt, time::Duration};
use time::OffsetDateTime;
use tracing::Instrument;
use uuid::Uuid;

use super::{
    Installation, NewUser, Repositories, SetupTransaction, StorageConnector, StoreError,
    SystemRepository, User, UserRepository,
};
use crate::rbac::{Policy, PolicyAdapter};

pub const SCHEMA_SQL: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/sql/schema.sql"));

const SINGLETON_ID: i16 = 1;
const UNIQUE_VIOLATION: &str = "23505";

macro_rules! db_span {
    ($operation:literal, $query:expr) => {
        tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = $operation,
            db.statement = $query
        )
    };
}

fn map_error(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db_err)
            if db_err.code().is_some_and(|code| code.as_ref() == UNIQUE_VIOLATION) =>
        {
            StoreError::Duplicate
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::Unavailable
        }
        _ => StoreError::Database(err),
    }
}

fn user_from_row(row: &PgRow) -> Result<User, StoreError> {
    Ok(User {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        email: row.try_get("email")?,
        password_hash: row.try_get("password_hash")?,
        role: row.try_get("role")?,
        created_at: row.try_get("created_at")?,
    })
}

fn installation_from_row(row: &PgRow) -> Result<Installation, StoreError> {
    Ok(Installation {
        installed: row.try_get("installed")?,
        site_name: row.try_get("site_name")?,
        installed_at: row.try_get("installed_at")?,
    })
}

const INSERT_USER: &str = r"
    INSERT INTO users (id, username, email, password_hash, role)
    VALUES ($1, $2, $3, $4, $5)
    RETURNING id, username, email, password_hash, role, created_at
";

/// Opens the pool and applies the schema.
pub struct PgConnector {
    dsn: SecretString,
}

impl PgConnector {
    #[must_use]
    pub fn new(dsn: SecretString) -> Self {
        Self { dsn }
    }
}

impl fmt::Debug for PgConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgConnector").field("dsn", &"***").finish()
    }
}

#[async_trait]
impl StorageConnector for PgConnector {
    async fn connect(&self) -> anyhow::Result<Repositories> {
        let pool = PgPoolOptions::new()
            .min_connections(1)
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .max_lifetime(Duration::from_secs(60 * 2))
            .test_before_acquire(true)
            .connect(self.dsn.expose_secret())
            .await
            .context("Failed to connect to database")?;

        sqlx::Executor::execute(&pool, SCHEMA_SQL)
            .await
            .context("Failed to apply database schema")?;

        Ok(Repositories::postgres(PgStore::new(pool)))
    }
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserRepository for PgStore {
    async fn find_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        let query = r"
            SELECT id, username, email, password_hash, role, created_at
            FROM users
            WHERE username = $1
            LIMIT 1
        ";
        let row = sqlx::query(query)
            .bind(username)
            .fetch_optional(&self.pool)
            .instrument(db_span!("SELECT", query))
            .await
            .map_err(map_error)?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let query = r"
            SELECT id, username, email, password_hash, role, created_at
            FROM users
            WHERE id = $1
            LIMIT 1
        ";
        let row = sqlx::query(query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(db_span!("SELECT", query))
            .await
            .map_err(map_error)?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn create(&self, user: NewUser) -> Result<User, StoreError> {
        let row = sqlx::query(INSERT_USER)
            .bind(Uuid::new_v4())
            .bind(&user.username)
            .bind(&user.email)
            .bind(&user.password_hash)
            .bind(&user.role)
            .fetch_one(&self.pool)
            .instrument(db_span!("INSERT", INSERT_USER))
            .await
            .map_err(map_error)?;
        user_from_row(&row)
    }
}

#[async_trait]
impl SystemRepository for PgStore {
    async fn installation(&self) -> Result<Option<Installation>, StoreError> {
        let query = r"
            SELECT installed, site_name, installed_at
            FROM system_settings
            WHERE id = $1
        ";
        let row = sqlx::query(query)
            .bind(SINGLETON_ID)
            .fetch_optional(&self.pool)
            .instrument(db_span!("SELECT", query))
            .await
            .map_err(map_error)?;
        row.as_ref().map(installation_from_row).transpose()
    }

    async fn begin(&self) -> Result<Box<dyn SetupTransaction>, StoreError> {
        let tx = self.pool.begin().await.map_err(map_error)?;
        Ok(Box::new(PgSetupTransaction { tx }))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let query = "SELECT 1";
        sqlx::query(query)
            .execute(&self.pool)
            .instrument(db_span!("SELECT", query))
            .await
            .map_err(map_error)?;
        Ok(())
    }
}

#[async_trait]
impl PolicyAdapter for PgStore {
    async fn load_policies(&self) -> Result<Vec<Policy>, StoreError> {
        let query = "SELECT role, resource, action FROM rbac_policies ORDER BY role, resource, action";
        let rows = sqlx::query(query)
            .fetch_all(&self.pool)
            .instrument(db_span!("SELECT", query))
            .await
            .map_err(map_error)?;
        rows.iter()
            .map(|row| -> Result<Policy, StoreError> {
                Ok(Policy {
                    role: row.try_get("role")?,
                    resource: row.try_get("resource")?,
                    action: row.try_get("action")?,
                })
            })
            .collect()
    }

    async fn save_policy(&self, policy: &Policy) -> Result<bool, StoreError> {
        let query = r"
            INSERT INTO rbac_policies (role, resource, action)
            VALUES ($1, $2, $3)
            ON CONFLICT DO NOTHING
        ";
        let result = sqlx::query(query)
            .bind(&policy.role)
            .bind(&policy.resource)
            .bind(&policy.action)
            .execute(&self.pool)
            .instrument(db_span!("INSERT", query))
            .await
            .map_err(map_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove_policy(&self, policy: &Policy) -> Result<bool, StoreError> {
        let query = r"
            DELETE FROM rbac_policies
            WHERE role = $1 AND resource = $2 AND action = $3
        ";
        let result = sqlx::query(query)
            .bind(&policy.role)
            .bind(&policy.resource)
            .bind(&policy.action)
            .execute(&self.pool)
            .instrument(db_span!("DELETE", query))
            .await
            .map_err(map_error)?;
        Ok(result.rows_affected() > 0)
    }
}

/// Dropping the inner `sqlx` transaction without commit rolls it back.
struct PgSetupTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl SetupTransaction for PgSetupTransaction {
    async fn ensure_singleton_row(&mut self) -> Result<(), StoreError> {
        let query = r"
            INSERT INTO system_settings (id, installed, site_name)
            VALUES ($1, FALSE, '')
            ON CONFLICT (id) DO NOTHING
        ";
        sqlx::query(query)
            .bind(SINGLETON_ID)
            .execute(&mut *self.tx)
            .instrument(db_span!("INSERT", query))
            .await
            .map_err(map_error)?;
        Ok(())
    }

    async fn lock_installation(&mut self) -> Result<Installation, StoreError> {
        let query = r"
            SELECT installed, site_name, installed_at
            FROM system_settings
            WHERE id = $1
            FOR UPDATE
        ";
        let row = sqlx::query(query)
            .bind(SINGLETON_ID)
            .fetch_optional(&mut *self.tx)
            .instrument(db_span!("SELECT", query))
            .await
            .map_err(map_error)?
            .ok_or(StoreError::NotFound)?;
        installation_from_row(&row)
    }

    async fn create_admin(&mut self, user: NewUser) -> Result<User, StoreError> {
        let row = sqlx::query(INSERT_USER)
            .bind(Uuid::new_v4())
            .bind(&user.username)
            .bind(&user.email)
            .bind(&user.password_hash)
            .bind(&user.role)
            .fetch_one(&mut *self.tx)
            .instrument(db_span!("INSERT", INSERT_USER))
            .await
            .map_err(map_error)?;
        user_from_row(&row)
    }

    async fn mark_installed(
        &mut self,
        site_name: &str,
        installed_at: OffsetDateTime,
    ) -> Result<u64, StoreError> {
        let query = r"
            UPDATE system_settings
            SET installed = TRUE, site_name = $2, installed_at = $3, updated_at = NOW()
            WHERE id = $1 AND installed = FALSE
        ";
        let result = sqlx::query(query)
            .bind(SINGLETON_ID)
            .bind(site_name)
            .bind(installed_at)
            .execute(&mut *self.tx)
            .instrument(db_span!("UPDATE", query))
            .await
            .map_err(map_error)?;
        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(map_error)
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await.map_err(map_error)
    }
}
