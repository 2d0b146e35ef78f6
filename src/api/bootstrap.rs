//! Startup wiring and the hot re-bootstrap after setup.
//!
//! Flow Overview:
//! 1) `assemble` creates the mode router in setup mode together with the
//!    bootstrapper that serves the setup routes.
//! 2) `start` connects to storage; if the system is installed the application
//!    routes are built and swapped in, otherwise setup routes keep serving.
//! 3) After a setup attempt (success, or a lost race) the setup handler calls
//!    `rebootstrap`, which builds the application routes and swaps them in
//!    before the response is sent. Failures are logged and the server stays in
//!    setup mode.

use anyhow::{Context, Result};
use axum::{
    Extension, Router, middleware,
    routing::{get, post},
};
use std::{
    sync::{Arc, Mutex as StdMutex, MutexGuard, OnceLock, PoisonError, Weak},
    time::Instant,
};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::{
    handlers::{self, health, system},
    record_route,
    mode::{Mode, ModeRouter},
    state::{AppState, CoreSettings},
};
use crate::{
    auth::SessionManager,
    store::{Repositories, StorageConnector},
    system::SystemInitializer,
};

pub struct Bootstrapper {
    settings: CoreSettings,
    sessions: Arc<SessionManager>,
    connector: Arc<dyn StorageConnector>,
    mode_router: OnceLock<Weak<ModeRouter>>,
    connection: StdMutex<Connection>,
    activation: Mutex<()>,
}

#[derive(Default)]
struct Connection {
    repositories: Option<Repositories>,
    last_failure: Option<Instant>,
}

/// Build the mode router (in setup mode) and its bootstrapper.
#[must_use]
pub fn assemble(
    settings: CoreSettings,
    connector: Arc<dyn StorageConnector>,
) -> (Arc<ModeRouter>, Arc<Bootstrapper>) {
    let sessions = Arc::new(SessionManager::new(settings.auth().clone()));
    let bootstrapper = Arc::new(Bootstrapper {
        settings,
        sessions,
        connector,
        mode_router: OnceLock::new(),
        connection: StdMutex::new(Connection::default()),
        activation: Mutex::new(()),
    });
    let mode_router = Arc::new(ModeRouter::setup(bootstrapper.setup_router()));
    let _ = bootstrapper.mode_router.set(Arc::downgrade(&mode_router));
    (mode_router, bootstrapper)
}

impl Bootstrapper {
    /// Cached repositories, connecting on first use. `None` if storage is unreachable.
    ///
    /// The connect runs without holding the cache lock; the first successful
    /// connection is kept. After a failure, callers get `None` without a new
    /// attempt until the retry delay has passed.
    pub async fn repositories(&self) -> Option<Repositories> {
        {
            let connection = self.connection();
            if let Some(repositories) = connection.repositories.as_ref() {
                return Some(repositories.clone());
            }
            if connection
                .last_failure
                .is_some_and(|failed_at| failed_at.elapsed() < self.settings.storage_retry())
            {
                return None;
            }
        }

        let connected = self.connector.connect().await;

        let mut connection = self.connection();
        if let Some(repositories) = connection.repositories.as_ref() {
            return Some(repositories.clone());
        }
        match connected {
            Ok(repositories) => {
                connection.repositories = Some(repositories.clone());
                connection.last_failure = None;
                Some(repositories)
            }
            Err(err) => {
                warn!("Storage unavailable: {err:#}");
                connection.last_failure = Some(Instant::now());
                None
            }
        }
    }

    fn connection(&self) -> MutexGuard<'_, Connection> {
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn initializer(&self, repositories: &Repositories) -> SystemInitializer {
        SystemInitializer::new(repositories.system.clone(), self.settings.setup_timeout())
    }

    /// Process-start bootstrap. Returns the mode the server ends up in.
    pub async fn start(&self) -> Mode {
        let Some(repositories) = self.repositories().await else {
            warn!("Starting in setup mode: storage unreachable");
            return Mode::Setup;
        };
        match self.initializer(&repositories).status().await {
            Ok(status) if status.installed => match self.activate(repositories).await {
                Ok(()) => Mode::Application,
                Err(err) => {
                    error!("Failed to build application routes: {err:#}");
                    Mode::Setup
                }
            },
            Ok(_) => {
                info!("System not installed, serving setup routes");
                Mode::Setup
            }
            Err(err) => {
                warn!("Failed to read installation state: {err}");
                Mode::Setup
            }
        }
    }

    /// Build the application routes and swap them in. No-op once in application mode.
    ///
    /// # Errors
    /// Returns an error if storage is unreachable or the application cannot be built.
    pub async fn rebootstrap(&self) -> Result<()> {
        let mode_router = self.mode_router()?;
        // Concurrent setup requests all land here; only the first one builds.
        let _activation = self.activation.lock().await;
        if mode_router.mode() == Mode::Application {
            return Ok(());
        }
        let repositories = self
            .repositories()
            .await
            .context("Storage unavailable during re-bootstrap")?;
        self.activate(repositories).await
    }

    async fn activate(&self, repositories: Repositories) -> Result<()> {
        let mode_router = self.mode_router()?;
        let state = AppState::build(repositories, self.sessions.clone(), &self.settings).await?;
        mode_router.swap(handlers::application_router(state));
        Ok(())
    }

    fn mode_router(&self) -> Result<Arc<ModeRouter>> {
        self.mode_router
            .get()
            .and_then(Weak::upgrade)
            .context("Mode router is no longer alive")
    }

    fn setup_router(self: &Arc<Self>) -> Router {
        Router::new()
            .route(
                "/health",
                get(health::setup_health).options(health::setup_health),
            )
            .route("/system/status", get(system::setup_status))
            .route("/system/setup", post(system::setup))
            .route_layer(middleware::from_fn(record_route))
            .layer(Extension(self.clone()))
    }
}
