//! Process-wide dispatch between the setup and application route sets.
//!
//! Flow Overview:
//! 1) The server starts with the setup routes installed.
//! 2) Every request copies the current `Arc<DispatchTarget>` under a brief read
//!    lock and is then served entirely by that target, lock released.
//! 3) `swap` replaces the target under the write lock. There is no way back to
//!    setup mode within a running process.

use axum::{
    Router,
    extract::{Request, State},
    response::Response,
};
use serde::Serialize;
use std::{
    fmt,
    sync::{Arc, PoisonError, RwLock},
};
use tower::ServiceExt;
use tracing::info;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Setup,
    Application,
}

impl Mode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::Application => "application",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A complete, immutable route set and the mode it belongs to.
pub struct DispatchTarget {
    mode: Mode,
    router: Router,
}

impl DispatchTarget {
    #[must_use]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    #[must_use]
    pub fn router(&self) -> Router {
        self.router.clone()
    }
}

pub struct ModeRouter {
    current: RwLock<Arc<DispatchTarget>>,
}

impl ModeRouter {
    /// Start in setup mode serving `router`.
    #[must_use]
    pub fn setup(router: Router) -> Self {
        Self {
            current: RwLock::new(Arc::new(DispatchTarget {
                mode: Mode::Setup,
                router,
            })),
        }
    }

    /// Copy of the current target. The read lock is held only for the clone.
    #[must_use]
    pub fn get(&self) -> Arc<DispatchTarget> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Install the application routes. Returns the mode that was replaced.
    pub fn swap(&self, router: Router) -> Mode {
        let next = Arc::new(DispatchTarget {
            mode: Mode::Application,
            router,
        });
        let previous = {
            let mut current = self
                .current
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *current, next)
        };
        info!(from = %previous.mode, to = %Mode::Application, "Switched dispatch mode");
        previous.mode
    }

    #[must_use]
    pub fn mode(&self) -> Mode {
        self.get().mode
    }

    /// Router that forwards every request to the current target.
    #[must_use]
    pub fn service(self: Arc<Self>) -> Router {
        Router::new().fallback(dispatch).with_state(self)
    }
}

async fn dispatch(State(mode_router): State<Arc<ModeRouter>>, req: Request) -> Response {
    let target = mode_router.get();
    target
        .router()
        .oneshot(req)
        .await
        .unwrap_or_else(|never| match never {})
}
