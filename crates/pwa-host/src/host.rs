//! Drives a registration against one origin with persistent storage.

use std::path::PathBuf;
use std::sync::Arc;

use http::Method;
use pwa_common::{load_json, retry_with_backoff, save_json};
use pwa_net::{Fetcher, HttpFetcher, LoaderConfig, NetError, Request};
use pwa_sw::{
    CacheGeneration, CacheStorage, ControlChannel, Registration, ResponseSource, ServiceWorker,
    SwError,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::HostConfig;

const REGISTRATION_FILE: &str = "registration.json";
const CACHES_DIR: &str = "caches";

/// Host errors.
#[derive(Error, Debug)]
pub enum HostError {
    #[error(transparent)]
    Worker(#[from] SwError),

    #[error(transparent)]
    Network(#[from] NetError),

    #[error(transparent)]
    Config(#[from] pwa_common::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Invalid method: {0}")]
    InvalidMethod(String),
}

/// Registration state kept between runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SavedRegistration {
    scope: Url,
    generation: CacheGeneration,
}

/// What a dispatched fetch produced.
#[derive(Debug, Clone)]
pub struct FetchReport {
    pub url: Url,
    pub status: u16,
    /// `None` when no worker controlled the request.
    pub source: Option<ResponseSource>,
    pub body_len: usize,
}

/// One stored generation and the URLs it holds.
#[derive(Debug, Clone)]
pub struct GenerationListing {
    pub name: String,
    pub active: bool,
    pub keys: Vec<String>,
}

pub struct Host {
    config: HostConfig,
    scope: Url,
    storage: Arc<CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
    registration: Mutex<Registration>,
    state_path: PathBuf,
}

impl Host {
    /// Open the host with an HTTP fetcher.
    pub async fn open(config: HostConfig) -> Result<Self, HostError> {
        let fetcher = HttpFetcher::new(LoaderConfig {
            timeout: config.request_timeout(),
            ..Default::default()
        })?;
        Self::with_fetcher(config, Arc::new(fetcher)).await
    }

    pub async fn with_fetcher(
        config: HostConfig,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self, HostError> {
        config.validate()?;
        let scope = config.scope()?;
        let dir = config.storage_dir();
        let storage = Arc::new(CacheStorage::persistent(dir.join(CACHES_DIR)).await?);
        info!(scope = %scope, dir = %dir.display(), "Host opened");

        let host = Self {
            registration: Mutex::new(Registration::new(scope.clone())),
            state_path: dir.join(REGISTRATION_FILE),
            config,
            scope,
            storage,
            fetcher,
        };
        host.restore().await?;
        Ok(host)
    }

    pub fn storage(&self) -> &Arc<CacheStorage> {
        &self.storage
    }

    fn new_worker(&self) -> Result<Arc<ServiceWorker>, HostError> {
        let (worker, mut events) = ServiceWorker::new(
            self.scope.clone(),
            self.config.worker.clone(),
            Arc::clone(&self.storage),
            Arc::clone(&self.fetcher),
        )?;

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                debug!(?event, "Worker event");
            }
        });

        Ok(Arc::new(
            worker.with_generation(self.config.generation_source()),
        ))
    }

    async fn restore(&self) -> Result<(), HostError> {
        if !self.state_path.exists() {
            return Ok(());
        }
        let saved: SavedRegistration = load_json(&self.state_path)?;
        if saved.scope != self.scope {
            warn!(
                saved = %saved.scope,
                scope = %self.scope,
                "Ignoring registration for another scope"
            );
            return Ok(());
        }

        let worker = self.new_worker()?;
        worker.restore(saved.generation.clone())?;
        self.registration.lock().await.adopt_active(worker)?;
        info!(generation = %saved.generation, "Restored active worker");
        Ok(())
    }

    /// The generation of the active worker, if one controls the scope.
    pub async fn active_generation(&self) -> Option<CacheGeneration> {
        let registration = self.registration.lock().await;
        registration
            .active()
            .and_then(|worker| worker.generation().cloned())
    }

    // ==================== Commands ====================

    /// Install and activate a new worker, retrying failed installs.
    pub async fn install(&self) -> Result<CacheGeneration, HostError> {
        let generation = retry_with_backoff(&self.config.install_retry, || async {
            let worker = self.new_worker()?;
            self.registration
                .lock()
                .await
                .install(Arc::clone(&worker))
                .await?;
            let generation = worker
                .generation()
                .cloned()
                .ok_or_else(|| SwError::State("installed without a generation".into()))?;
            Ok::<_, HostError>(generation)
        })
        .await?;

        save_json(
            &self.state_path,
            &SavedRegistration {
                scope: self.scope.clone(),
                generation: generation.clone(),
            },
        )?;
        Ok(generation)
    }

    /// Dispatch a fetch event for `path` and wait for its background work.
    pub async fn fetch(
        &self,
        path: &str,
        navigate: bool,
        method: &str,
    ) -> Result<FetchReport, HostError> {
        let url = self.scope.join(path)?;
        let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .map_err(|_| HostError::InvalidMethod(method.to_string()))?;

        let request = if navigate {
            Request::navigate(url.clone())
        } else {
            Request::get(url.clone())
        }
        .method(method);

        let controller = self.registration.lock().await.controller();
        let (response, source) = match controller {
            Some(worker) => {
                let outcome = worker.handle_fetch(request.clone()).await;
                outcome.wait_until.settled().await;
                match outcome.result {
                    Ok(served) => (served.response, Some(served.source)),
                    Err(SwError::State(reason)) => {
                        debug!(url = %url, reason = %reason, "Worker not ready, fetching directly");
                        (self.fetcher.fetch(&request).await?, None)
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            None => (self.fetcher.fetch(&request).await?, None),
        };

        Ok(FetchReport {
            url,
            status: response.status,
            source,
            body_len: response.body.len(),
        })
    }

    /// Post the logout message and wait until every cache is gone.
    pub async fn logout(&self) -> Result<(), HostError> {
        let worker = {
            let registration = self.registration.lock().await;
            registration.active().cloned()
        };
        let worker = match worker {
            Some(worker) => worker,
            None => self.new_worker()?,
        };

        let (channel, task) = ControlChannel::spawn(worker);
        channel.post_message(self.config.worker.logout_message.as_str())?;
        drop(channel);
        if let Err(e) = task.await {
            warn!(error = %e, "Control task ended abnormally");
        }

        let remaining = self.storage.keys().await;
        if !remaining.is_empty() {
            warn!(remaining = ?remaining, "Some caches survived logout");
        }
        Ok(())
    }

    /// Every stored cache with its keys.
    pub async fn list(&self) -> Result<Vec<GenerationListing>, HostError> {
        let active = self.active_generation().await;
        let mut listings = Vec::new();
        for name in self.storage.keys().await {
            let handle = self.storage.open(&name).await?;
            listings.push(GenerationListing {
                active: active.as_ref().is_some_and(|g| g.name() == name),
                keys: handle.keys().await,
                name,
            });
        }
        Ok(listings)
    }
}
