//! # PWA Service Worker
//!
//! Offline cache controller for a server-rendered web application.
//!
//! ## Features
//!
//! - **Generations**: one disposable cache namespace per deploy and login
//! - **Lifecycle**: install (manifest pre-caching), activate (stale sweep)
//! - **Fetch strategies**: cache-first for static assets, network-first with
//!   offline fallback for everything else
//! - **Offline marker**: cached pages served during an outage are flagged
//! - **Control messages**: `logout` wipes every cache
//!
//! ## Architecture
//!
//! ```text
//! Registration
//!     ├── installing / waiting / active (ServiceWorker)
//!     │       ├── FetchPolicy
//!     │       │       ├── RequestClassifier
//!     │       │       └── OfflineMarker
//!     │       └── ControlChannel
//!     └── CacheStorage (caches)
//!             └── CacheHandle (one generation)
//!                     └── Request → Response
//! ```

use pwa_net::NetError;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

pub mod cache;
pub mod classify;
pub mod config;
pub mod control;
pub mod events;
pub mod generation;
pub mod registration;
pub mod storage;
pub mod strategy;
pub mod transform;
pub mod worker;

pub use cache::{Cache, CacheEntry, MatchOptions};
pub use classify::{RequestClassifier, RequestKind};
pub use config::{CachePolicy, MarkerConfig, WorkerConfig};
pub use control::ControlChannel;
pub use events::{FetchOutcome, ResponseSource, Served, WaitUntil, WorkerEvent};
pub use generation::{CacheGeneration, GenerationSource, Identity};
pub use registration::Registration;
pub use storage::{CacheHandle, CacheStorage};
pub use strategy::{FetchPolicy, Strategy};
pub use transform::{OfflineMarker, TransformError};
pub use worker::{InstallOutcome, ServiceWorker};

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum SwError {
    #[error("Install failed: {0}")]
    InstallFailed(String),

    #[error("State error: {0}")]
    State(String),

    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Storage IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage format error: {0}")]
    Format(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error(transparent)]
    Config(#[from] pwa_common::Error),
}

// ==================== Types ====================

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceWorkerState {
    /// Created, not yet installed.
    #[default]
    Parsed,
    /// Installing (install event).
    Installing,
    /// Installed but waiting for activation.
    Installed,
    /// Activating (activate event).
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Redundant (replaced or install failed).
    Redundant,
}
