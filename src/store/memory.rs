//! In-process storage.
//!
//! The installation row lock is a `tokio` mutex held for the lifetime of a
//! `SetupTransaction`; staged writes are applied on commit and discarded on
//! drop, mirroring the PostgreSQL transaction.

use async_trait::async_trait;
use std::{
    collections::BTreeSet,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
};
use time::OffsetDateTime;
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use super::{
    Installation, NewUser, SetupTransaction, StoreError, SystemRepository, User, UserRepository,
};
use crate::rbac::{Policy, PolicyAdapter};

fn materialise(user: NewUser) -> User {
    User {
        id: Uuid::new_v4(),
        username: user.username,
        email: user.email,
        password_hash: user.password_hash,
        role: user.role,
        created_at: OffsetDateTime::now_utc(),
    }
}

#[derive(Debug, Default)]
struct State {
    users: Vec<User>,
    installation: Option<Installation>,
    policies: BTreeSet<Policy>,
}

impl State {
    fn conflicts(&self, user: &User) -> bool {
        self.users
            .iter()
            .any(|existing| existing.username == user.username || existing.email == user.email)
    }
}

#[derive(Debug, Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    row_lock: Arc<tokio::sync::Mutex<()>>,
    available: Arc<AtomicBool>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            row_lock: Arc::new(tokio::sync::Mutex::new(())),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulate an outage; every call fails with `Unavailable` while false.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of stored users.
    ///
    /// # Errors
    /// Returns `Unavailable` when the store is marked unavailable.
    pub fn user_count(&self) -> Result<usize, StoreError> {
        Ok(self.state()?.users.len())
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable);
        }
        self.state.lock().map_err(|_| StoreError::Unavailable)
    }

    fn insert_user(state: &mut State, user: User) -> Result<User, StoreError> {
        if state.conflicts(&user) {
            return Err(StoreError::Duplicate);
        }
        state.users.push(user.clone());
        Ok(user)
    }
}

#[async_trait]
impl UserRepository for MemoryStore {
    async fn find_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        Ok(self
            .state()?
            .users
            .iter()
            .find(|user| user.username == username)
            .cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(self.state()?.users.iter().find(|user| user.id == id).cloned())
    }

    async fn create(&self, user: NewUser) -> Result<User, StoreError> {
        let mut state = self.state()?;
        Self::insert_user(&mut state, materialise(user))
    }
}

#[async_trait]
impl SystemRepository for MemoryStore {
    async fn installation(&self) -> Result<Option<Installation>, StoreError> {
        Ok(self.state()?.installation.clone())
    }

    async fn begin(&self) -> Result<Box<dyn SetupTransaction>, StoreError> {
        drop(self.state()?);
        Ok(Box::new(MemorySetupTransaction {
            store: self.clone(),
            row_guard: None,
            staged_users: Vec::new(),
            staged_installation: None,
        }))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.state().map(drop)
    }
}

#[async_trait]
impl PolicyAdapter for MemoryStore {
    async fn load_policies(&self) -> Result<Vec<Policy>, StoreError> {
        Ok(self.state()?.policies.iter().cloned().collect())
    }

    async fn save_policy(&self, policy: &Policy) -> Result<bool, StoreError> {
        Ok(self.state()?.policies.insert(policy.clone()))
    }

    async fn remove_policy(&self, policy: &Policy) -> Result<bool, StoreError> {
        Ok(self.state()?.policies.remove(policy))
    }
}

struct MemorySetupTransaction {
    store: MemoryStore,
    row_guard: Option<OwnedMutexGuard<()>>,
    staged_users: Vec<User>,
    staged_installation: Option<Installation>,
}

#[async_trait]
impl SetupTransaction for MemorySetupTransaction {
    async fn ensure_singleton_row(&mut self) -> Result<(), StoreError> {
        let mut state = self.store.state()?;
        if state.installation.is_none() {
            state.installation = Some(Installation::default());
        }
        Ok(())
    }

    async fn lock_installation(&mut self) -> Result<Installation, StoreError> {
        if self.row_guard.is_none() {
            self.row_guard = Some(self.store.row_lock.clone().lock_owned().await);
        }
        self.store
            .state()?
            .installation
            .clone()
            .ok_or(StoreError::NotFound)
    }

    async fn create_admin(&mut self, user: NewUser) -> Result<User, StoreError> {
        let user = materialise(user);
        let staged_conflict = self
            .staged_users
            .iter()
            .any(|staged| staged.username == user.username || staged.email == user.email);
        if staged_conflict || self.store.state()?.conflicts(&user) {
            return Err(StoreError::Duplicate);
        }
        self.staged_users.push(user.clone());
        Ok(user)
    }

    async fn mark_installed(
        &mut self,
        site_name: &str,
        installed_at: OffsetDateTime,
    ) -> Result<u64, StoreError> {
        let state = self.store.state()?;
        let still_pending = state
            .installation
            .as_ref()
            .is_some_and(|installation| !installation.installed);
        if !still_pending || self.staged_installation.is_some() {
            return Ok(0);
        }
        drop(state);
        self.staged_installation = Some(Installation {
            installed: true,
            site_name: site_name.to_string(),
            installed_at: Some(installed_at),
        });
        Ok(1)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let Self {
            store,
            row_guard,
            staged_users,
            staged_installation,
        } = *self;
        let mut state = store.state()?;
        if staged_users.iter().any(|user| state.conflicts(user)) {
            return Err(StoreError::Duplicate);
        }
        for user in staged_users {
            MemoryStore::insert_user(&mut state, user)?;
        }
        if let Some(installation) = staged_installation {
            state.installation = Some(installation);
        }
        drop(state);
        drop(row_guard);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}
