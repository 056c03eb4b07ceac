//! Registration: which worker controls a scope.

use std::sync::Arc;

use tracing::info;
use url::Url;

use crate::worker::ServiceWorker;
use crate::{ServiceWorkerState, SwError};

/// A service worker registration.
pub struct Registration {
    /// Scope URL.
    pub scope: Url,

    /// Installing worker.
    installing: Option<Arc<ServiceWorker>>,

    /// Waiting worker (installed but not active).
    waiting: Option<Arc<ServiceWorker>>,

    /// Active worker.
    active: Option<Arc<ServiceWorker>>,
}

impl Registration {
    /// Create a new registration.
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
        }
    }

    pub fn installing(&self) -> Option<&Arc<ServiceWorker>> {
        self.installing.as_ref()
    }

    pub fn waiting(&self) -> Option<&Arc<ServiceWorker>> {
        self.waiting.as_ref()
    }

    pub fn active(&self) -> Option<&Arc<ServiceWorker>> {
        self.active.as_ref()
    }

    /// Install `worker`; on success it waits, or takes over right away if it
    /// asked to skip waiting.
    pub async fn install(&mut self, worker: Arc<ServiceWorker>) -> Result<(), SwError> {
        self.installing = Some(Arc::clone(&worker));
        let outcome = worker.install().await;
        self.installing = None;
        let outcome = outcome?;

        if let Some(previous) = self.waiting.replace(worker) {
            previous.make_redundant();
        }

        if outcome.skip_waiting {
            self.activate_waiting().await?;
        }
        Ok(())
    }

    /// Promote the waiting worker to active; the old one becomes redundant.
    pub async fn activate_waiting(&mut self) -> Result<Vec<String>, SwError> {
        let worker = self
            .waiting
            .take()
            .ok_or_else(|| SwError::State("no waiting worker".to_string()))?;

        let deleted = worker.activate().await?;

        if let Some(old) = self.active.replace(worker) {
            old.make_redundant();
        }
        info!(scope = %self.scope, swept = deleted.len(), "Registration activated");
        Ok(deleted)
    }

    /// Adopt a worker that is already active (restored from disk).
    pub fn adopt_active(&mut self, worker: Arc<ServiceWorker>) -> Result<(), SwError> {
        if worker.state() != ServiceWorkerState::Activated {
            return Err(SwError::State(format!(
                "cannot adopt a worker in state {:?}",
                worker.state()
            )));
        }
        if let Some(old) = self.active.replace(worker) {
            old.make_redundant();
        }
        Ok(())
    }

    /// The worker that should answer fetches; `None` means uncontrolled.
    pub fn controller(&self) -> Option<Arc<ServiceWorker>> {
        self.active.clone()
    }
}
