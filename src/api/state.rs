use anyhow::{Context, Result};
use std::{sync::Arc, time::Duration};

use crate::{
    auth::{AuthConfig, SessionManager},
    gate::Gate,
    rbac::{Enforcer, Policy},
    store::Repositories,
    system::SystemInitializer,
};

const DEFAULT_SETUP_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_STORAGE_RETRY: Duration = Duration::from_secs(2);

/// Configuration shared by both dispatch modes, built once at startup.
#[derive(Debug, Clone)]
pub struct CoreSettings {
    auth: AuthConfig,
    policy_seed: Vec<Policy>,
    setup_timeout: Duration,
    storage_retry: Duration,
}

impl CoreSettings {
    #[must_use]
    pub fn new(auth: AuthConfig) -> Self {
        Self {
            auth,
            policy_seed: Vec::new(),
            setup_timeout: DEFAULT_SETUP_TIMEOUT,
            storage_retry: DEFAULT_STORAGE_RETRY,
        }
    }

    #[must_use]
    pub fn with_policy_seed(mut self, policy_seed: Vec<Policy>) -> Self {
        self.policy_seed = policy_seed;
        self
    }

    #[must_use]
    pub fn with_setup_timeout(mut self, setup_timeout: Duration) -> Self {
        self.setup_timeout = setup_timeout;
        self
    }

    /// Minimum delay between storage connection attempts after a failure.
    #[must_use]
    pub fn with_storage_retry(mut self, storage_retry: Duration) -> Self {
        self.storage_retry = storage_retry;
        self
    }

    #[must_use]
    pub fn auth(&self) -> &AuthConfig {
        &self.auth
    }

    #[must_use]
    pub fn policy_seed(&self) -> &[Policy] {
        &self.policy_seed
    }

    #[must_use]
    pub fn setup_timeout(&self) -> Duration {
        self.setup_timeout
    }

    #[must_use]
    pub fn storage_retry(&self) -> Duration {
        self.storage_retry
    }
}

/// Everything the application routes need, wired from one set of repositories.
pub struct AppState {
    sessions: Arc<SessionManager>,
    enforcer: Arc<Enforcer>,
    repositories: Repositories,
    initializer: SystemInitializer,
    gate: Gate,
}

impl AppState {
    /// Load and seed policies, then assemble the application collaborators.
    ///
    /// # Errors
    /// Returns an error if policies cannot be loaded or seeded.
    pub async fn build(
        repositories: Repositories,
        sessions: Arc<SessionManager>,
        settings: &CoreSettings,
    ) -> Result<Arc<Self>> {
        let enforcer = Enforcer::new(repositories.policies.clone())
            .await
            .context("Failed to load RBAC policies")?;
        enforcer
            .seed(settings.policy_seed().to_vec())
            .await
            .context("Failed to seed RBAC policies")?;
        let enforcer = Arc::new(enforcer);

        let gate = Gate::new(
            sessions.clone(),
            enforcer.clone(),
            repositories.users.clone(),
        );
        let initializer =
            SystemInitializer::new(repositories.system.clone(), settings.setup_timeout());

        Ok(Arc::new(Self {
            sessions,
            enforcer,
            repositories,
            initializer,
            gate,
        }))
    }

    #[must_use]
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    #[must_use]
    pub fn enforcer(&self) -> &Enforcer {
        &self.enforcer
    }

    #[must_use]
    pub fn repositories(&self) -> &Repositories {
        &self.repositories
    }

    #[must_use]
    pub fn initializer(&self) -> &SystemInitializer {
        &self.initializer
    }

    #[must_use]
    pub fn gate(&self) -> &Gate {
        &self.gate
    }
}
