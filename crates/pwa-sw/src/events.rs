//! Event outcomes handed back to the host.

use std::fmt;
use std::future::Future;
use tokio::task::JoinHandle;
use tracing::warn;

use pwa_net::Response;

use crate::{ServiceWorkerId, ServiceWorkerState, SwError};

/// Background work an event handler started; the host must not consider the
/// event finished until [`WaitUntil::settled`] returns.
#[derive(Debug, Default)]
pub struct WaitUntil {
    tasks: Vec<JoinHandle<()>>,
}

impl WaitUntil {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` in the background as part of this event.
    pub fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.push(tokio::spawn(task));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for every background task.
    pub async fn settled(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task did not complete");
            }
        }
    }
}

/// Where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Network,
    Cache,
    /// Cached navigation rewritten with the offline marker.
    CacheMarkedOffline,
    /// The configured offline page.
    OfflineFallback,
}

impl fmt::Display for ResponseSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResponseSource::Network => "network",
            ResponseSource::Cache => "cache",
            ResponseSource::CacheMarkedOffline => "cache (offline)",
            ResponseSource::OfflineFallback => "offline fallback",
        })
    }
}

/// A response chosen by a fetch strategy.
#[derive(Debug, Clone)]
pub struct Served {
    pub response: Response,
    pub source: ResponseSource,
}

/// Result of dispatching a fetch event.
#[derive(Debug)]
pub struct FetchOutcome {
    pub result: Result<Served, SwError>,
    pub wait_until: WaitUntil,
}

/// Notifications emitted by a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// State changed.
    StateChange {
        worker_id: ServiceWorkerId,
        new_state: ServiceWorkerState,
    },
    /// Install finished and the manifest is cached.
    Installed {
        worker_id: ServiceWorkerId,
        generation: String,
    },
    /// Activation swept stale generations.
    GenerationsSwept { deleted: Vec<String> },
    /// A control message wiped the caches.
    CachesInvalidated { deleted: Vec<String> },
}
