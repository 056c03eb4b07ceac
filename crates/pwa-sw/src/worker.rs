//! The worker instance: lifecycle, fetch and message handling.

use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use futures::future::{join_all, try_join_all};
use pwa_net::{Fetcher, Request, Response};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::WorkerConfig;
use crate::events::{FetchOutcome, Served, WaitUntil, WorkerEvent};
use crate::generation::{matches_any_prefix, CacheGeneration, GenerationSource};
use crate::storage::CacheStorage;
use crate::strategy::FetchPolicy;
use crate::{ServiceWorkerId, ServiceWorkerState, SwError};

/// Result of a successful install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOutcome {
    pub generation: CacheGeneration,
    /// Take over from the previous worker without waiting for pages to close.
    pub skip_waiting: bool,
}

/// A running worker for one scope.
pub struct ServiceWorker {
    id: ServiceWorkerId,
    scope: Url,
    config: WorkerConfig,
    storage: Arc<CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
    policy: FetchPolicy,
    generation_source: GenerationSource,
    generation: OnceLock<CacheGeneration>,
    state: RwLock<ServiceWorkerState>,
    event_tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl ServiceWorker {
    /// Create a worker. Returns the worker and its event stream.
    pub fn new(
        scope: Url,
        config: WorkerConfig,
        storage: Arc<CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<WorkerEvent>), SwError> {
        config.validate()?;
        let policy = FetchPolicy::new(&scope, &config, Arc::clone(&fetcher))?;
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Ok((
            Self {
                id: ServiceWorkerId::new(),
                scope,
                config,
                storage,
                fetcher,
                policy,
                generation_source: GenerationSource::Timestamped,
                generation: OnceLock::new(),
                state: RwLock::new(ServiceWorkerState::Parsed),
                event_tx,
            },
            event_rx,
        ))
    }

    /// Choose how the generation name is picked at install.
    pub fn with_generation(mut self, source: GenerationSource) -> Self {
        self.generation_source = source;
        self
    }

    pub fn id(&self) -> ServiceWorkerId {
        self.id
    }

    pub fn scope(&self) -> &Url {
        &self.scope
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<CacheStorage> {
        &self.storage
    }

    pub fn state(&self) -> ServiceWorkerState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_active(&self) -> bool {
        self.state() == ServiceWorkerState::Activated
    }

    /// The generation fixed at install, if any.
    pub fn generation(&self) -> Option<&CacheGeneration> {
        self.generation.get()
    }

    fn set_state(&self, new_state: ServiceWorkerState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = new_state;
        debug!(worker = ?self.id, state = ?new_state, "Worker state changed");
        let _ = self.event_tx.send(WorkerEvent::StateChange {
            worker_id: self.id,
            new_state,
        });
    }

    fn active_generation(&self) -> Result<&CacheGeneration, SwError> {
        self.generation
            .get()
            .ok_or_else(|| SwError::State("worker has not been installed".to_string()))
    }

    /// Resume a worker that was installed and activated by an earlier process.
    pub fn restore(&self, generation: CacheGeneration) -> Result<(), SwError> {
        if self.state() != ServiceWorkerState::Parsed {
            return Err(SwError::State(format!(
                "cannot restore a worker in state {:?}",
                self.state()
            )));
        }
        self.generation
            .set(generation)
            .map_err(|_| SwError::State("generation already set".to_string()))?;
        self.set_state(ServiceWorkerState::Activated);
        Ok(())
    }

    /// Mark the worker as replaced; it stops handling events.
    pub fn make_redundant(&self) {
        self.set_state(ServiceWorkerState::Redundant);
    }

    // ==================== Install ====================

    /// Pick a generation and cache the manifest, all or nothing.
    pub async fn install(&self) -> Result<InstallOutcome, SwError> {
        if self.state() != ServiceWorkerState::Parsed {
            return Err(SwError::State(format!(
                "cannot install a worker in state {:?}",
                self.state()
            )));
        }
        self.set_state(ServiceWorkerState::Installing);

        match self.populate().await {
            Ok(generation) => {
                info!(
                    generation = %generation,
                    entries = self.config.manifest.len(),
                    "Worker installed"
                );
                self.set_state(ServiceWorkerState::Installed);
                let _ = self.event_tx.send(WorkerEvent::Installed {
                    worker_id: self.id,
                    generation: generation.name().to_string(),
                });
                Ok(InstallOutcome {
                    generation,
                    skip_waiting: true,
                })
            }
            Err(e) => {
                error!(error = %e, "Install failed");
                self.set_state(ServiceWorkerState::Redundant);
                Err(e)
            }
        }
    }

    async fn populate(&self) -> Result<CacheGeneration, SwError> {
        let generation = self.generation_source.resolve(&self.config.cache_prefix);

        let requests = self
            .config
            .manifest
            .iter()
            .map(|path| -> Result<Request, SwError> { Ok(Request::get(self.scope.join(path)?)) })
            .collect::<Result<Vec<_>, _>>()?;

        let responses = try_join_all(requests.iter().map(|r| self.fetch_manifest_entry(r))).await?;
        let pairs: Vec<(Request, Response)> = requests.into_iter().zip(responses).collect();

        // a fixed generation may already hold a previous install's entries
        let existed = self.storage.has(generation.name()).await;
        let cache = self.storage.open(generation.name()).await?;
        if let Err(e) = cache.put_all(&pairs).await {
            if existed {
                return Err(e);
            }
            if let Err(cleanup) = self.storage.delete(generation.name()).await {
                warn!(
                    generation = %generation,
                    error = %cleanup,
                    "Failed to remove partial generation"
                );
            }
            return Err(e);
        }

        self.generation
            .set(generation.clone())
            .map_err(|_| SwError::State("generation already set".to_string()))?;
        Ok(generation)
    }

    async fn fetch_manifest_entry(&self, request: &Request) -> Result<Response, SwError> {
        let response = self
            .fetcher
            .fetch(request)
            .await
            .map_err(|e| SwError::InstallFailed(format!("{}: {e}", request.url)))?;

        if response.is_error() || !response.ok() {
            return Err(SwError::InstallFailed(format!(
                "{} returned status {}",
                request.url, response.status
            )));
        }
        Ok(response)
    }

    // ==================== Activate ====================

    /// Delete every generation in this worker's namespace except the active one.
    ///
    /// Deletion failures are logged and skipped. Returns the deleted names.
    pub async fn activate(&self) -> Result<Vec<String>, SwError> {
        let active = self.active_generation()?.clone();
        if self.state() == ServiceWorkerState::Redundant {
            return Err(SwError::State("cannot activate a redundant worker".to_string()));
        }
        self.set_state(ServiceWorkerState::Activating);

        let prefixes = self.config.generation_prefixes();
        let stale: Vec<String> = self
            .storage
            .keys()
            .await
            .into_iter()
            .filter(|name| name != active.name() && matches_any_prefix(name, &prefixes))
            .collect();

        let results = join_all(stale.iter().map(|name| self.storage.delete(name))).await;

        let mut deleted = Vec::new();
        for (name, result) in stale.into_iter().zip(results) {
            match result {
                Ok(true) => deleted.push(name),
                Ok(false) => {}
                Err(e) => {
                    warn!(generation = %name, error = %e, "Failed to delete stale generation")
                }
            }
        }

        info!(active = %active, deleted = deleted.len(), "Worker activated");
        self.set_state(ServiceWorkerState::Activated);
        let _ = self.event_tx.send(WorkerEvent::GenerationsSwept {
            deleted: deleted.clone(),
        });
        Ok(deleted)
    }

    // ==================== Invalidation ====================

    /// Delete every cache in storage. Idempotent.
    ///
    /// All deletions are attempted; the first failure is returned afterwards.
    pub async fn invalidate_all(&self) -> Result<Vec<String>, SwError> {
        let names = self.storage.keys().await;
        let results = join_all(names.iter().map(|name| self.storage.delete(name))).await;

        let mut deleted = Vec::new();
        let mut first_error = None;
        for (name, result) in names.into_iter().zip(results) {
            match result {
                Ok(true) => deleted.push(name),
                Ok(false) => {}
                Err(e) => {
                    warn!(cache = %name, error = %e, "Failed to delete cache");
                    first_error.get_or_insert(e);
                }
            }
        }

        info!(deleted = deleted.len(), "Cleared caches");
        let _ = self.event_tx.send(WorkerEvent::CachesInvalidated {
            deleted: deleted.clone(),
        });

        match first_error {
            Some(e) => Err(e),
            None => Ok(deleted),
        }
    }

    // ==================== Events ====================

    /// Handle an intercepted request.
    pub async fn handle_fetch(&self, request: Request) -> FetchOutcome {
        let mut wait_until = WaitUntil::new();
        let result = self.respond(&request, &mut wait_until).await;
        if let Err(ref e) = result {
            debug!(url = %request.url, error = %e, "Fetch not served");
        }
        FetchOutcome { result, wait_until }
    }

    async fn respond(
        &self,
        request: &Request,
        wait_until: &mut WaitUntil,
    ) -> Result<Served, SwError> {
        if !self.is_active() {
            return Err(SwError::State(format!(
                "worker is {:?}, not handling fetches",
                self.state()
            )));
        }
        let generation = self.active_generation()?;
        let cache = self.storage.open(generation.name()).await?;
        self.policy.respond(cache, request, wait_until).await
    }

    /// Handle a control message without blocking the sender.
    pub fn handle_message(self: &Arc<Self>, message: &str) -> WaitUntil {
        let mut wait_until = WaitUntil::new();
        if message == self.config.logout_message {
            info!("Clearing cache after logout");
            let worker = Arc::clone(self);
            wait_until.spawn(async move {
                if let Err(e) = worker.invalidate_all().await {
                    error!(error = %e, "Cache invalidation incomplete");
                }
            });
        } else {
            debug!(message, "Ignoring unknown control message");
        }
        wait_until
    }
}
