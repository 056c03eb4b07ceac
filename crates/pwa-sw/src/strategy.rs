//! Fetch strategies.
//!
//! Static assets are served cache-first: a hit never touches the network, a
//! miss is fetched and written back in the background, and a network failure
//! is returned to the page as is.
//!
//! Everything else is network-first. A thrown error and an error-type
//! response are the same failure. Successful GET responses are stored before
//! they are returned. On failure the cached copy is served (navigations get
//! the offline marker), and when there is no copy the offline page is.

use std::sync::Arc;
use std::time::Duration;

use pwa_net::{Fetcher, NetError, Request, Response};
use tracing::{debug, warn};
use url::Url;

use crate::cache::MatchOptions;
use crate::classify::{RequestClassifier, RequestKind};
use crate::config::{CachePolicy, WorkerConfig};
use crate::events::{ResponseSource, Served, WaitUntil};
use crate::storage::CacheHandle;
use crate::transform::OfflineMarker;
use crate::SwError;

/// Serving strategy for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    CacheFirst,
    NetworkFirst,
}

/// Picks and runs a strategy per request.
pub struct FetchPolicy {
    classifier: RequestClassifier,
    marker: OfflineMarker,
    offline_url: Url,
    cache_policy: CachePolicy,
    static_cache_enabled: bool,
    timeout: Option<Duration>,
    fetcher: Arc<dyn Fetcher>,
}

impl FetchPolicy {
    /// Build from config; relative URLs resolve against `scope`.
    pub fn new(
        scope: &Url,
        config: &WorkerConfig,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self, SwError> {
        Ok(Self {
            classifier: RequestClassifier::new(config.static_prefix.clone()),
            marker: OfflineMarker::from_config(&config.marker),
            offline_url: scope.join(&config.offline_url)?,
            cache_policy: config.cache_policy,
            static_cache_enabled: config.static_cache_enabled,
            timeout: config.fetch_timeout(),
            fetcher,
        })
    }

    pub fn strategy_for(&self, request: &Request) -> Strategy {
        match self.classifier.classify(request) {
            RequestKind::StaticAsset if self.static_cache_enabled => Strategy::CacheFirst,
            _ => Strategy::NetworkFirst,
        }
    }

    /// Answer `request` using `cache` for storage.
    pub async fn respond(
        &self,
        cache: Arc<CacheHandle>,
        request: &Request,
        wait_until: &mut WaitUntil,
    ) -> Result<Served, SwError> {
        let strategy = self.strategy_for(request);
        debug!(url = %request.url, ?strategy, cache = %cache.name(), "Handling fetch");

        match strategy {
            Strategy::CacheFirst => self.cache_first(cache, request, wait_until).await,
            Strategy::NetworkFirst => self.network_first(&cache, request).await,
        }
    }

    async fn cache_first(
        &self,
        cache: Arc<CacheHandle>,
        request: &Request,
        wait_until: &mut WaitUntil,
    ) -> Result<Served, SwError> {
        if let Some(response) = cache.match_request(request, MatchOptions::default()).await {
            return Ok(Served {
                response,
                source: ResponseSource::Cache,
            });
        }

        let response = self.network(request).await?;

        if request.is_get() && self.cache_policy.should_store(&response) {
            let request = request.clone();
            let copy = response.clone();
            wait_until.spawn(async move {
                if let Err(e) = cache.put(&request, &copy).await {
                    warn!(url = %request.url, error = %e, "Failed to cache static asset");
                }
            });
        }

        Ok(Served {
            response,
            source: ResponseSource::Network,
        })
    }

    async fn network_first(
        &self,
        cache: &CacheHandle,
        request: &Request,
    ) -> Result<Served, SwError> {
        let error = match self.network(request).await {
            Ok(response) => {
                if request.is_get() && self.cache_policy.should_store(&response) {
                    if let Err(e) = cache.put(request, &response).await {
                        warn!(url = %request.url, error = %e, "Failed to cache response");
                    }
                }
                return Ok(Served {
                    response,
                    source: ResponseSource::Network,
                });
            }
            Err(e) => e,
        };

        debug!(url = %request.url, error = %error, "Network failed, trying cache");

        if let Some(cached) = cache.match_request(request, MatchOptions::default()).await {
            if !request.is_navigation() {
                return Ok(Served {
                    response: cached,
                    source: ResponseSource::Cache,
                });
            }
            match self.marker.mark_offline(cached) {
                Ok(response) => {
                    return Ok(Served {
                        response,
                        source: ResponseSource::CacheMarkedOffline,
                    })
                }
                Err(e) => {
                    warn!(url = %request.url, error = %e, "Cannot mark cached page offline");
                }
            }
        }

        let ignore_vary = MatchOptions {
            ignore_vary: true,
            ..Default::default()
        };
        match cache.match_url(&self.offline_url, ignore_vary).await {
            Some(response) => Ok(Served {
                response,
                source: ResponseSource::OfflineFallback,
            }),
            None => {
                warn!(url = %request.url, "No offline page cached");
                Err(error)
            }
        }
    }

    /// Network fetch where an error-type response or a timeout is a failure.
    async fn network(&self, request: &Request) -> Result<Response, SwError> {
        let response = match self.timeout {
            Some(limit) => pwa_common::with_timeout(limit, self.fetcher.fetch(request))
                .await
                .map_err(|_| NetError::Timeout(limit))??,
            None => self.fetcher.fetch(request).await?,
        };

        if response.is_error() {
            return Err(SwError::Network(NetError::RequestFailed(format!(
                "error response for {}",
                request.url
            ))));
        }
        Ok(response)
    }
}
