//! Worker configuration.

use pwa_common::Error;
use pwa_net::Response;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which network responses may be written to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePolicy {
    /// Only 2xx responses.
    #[default]
    SuccessOnly,
    /// Every response the network produced, including 4xx/5xx pages.
    AnyResponse,
}

impl CachePolicy {
    /// Whether `response` may be stored.
    pub fn should_store(&self, response: &Response) -> bool {
        if response.is_error() {
            return false;
        }
        match self {
            CachePolicy::SuccessOnly => response.ok(),
            CachePolicy::AnyResponse => true,
        }
    }
}

/// The HTML attribute toggled to tell the page it was served offline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerConfig {
    pub attribute: String,
    pub online: String,
    pub offline: String,
}

impl Default for MarkerConfig {
    fn default() -> Self {
        Self {
            attribute: "data-pwa-network".to_string(),
            online: "online".to_string(),
            offline: "offline".to_string(),
        }
    }
}

/// Configuration for one worker script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Prefix of generation names created by this worker.
    pub cache_prefix: String,

    /// Prefixes used by predecessor versions, swept on activation.
    pub legacy_prefixes: Vec<String>,

    /// Paths fetched and cached at install, all or nothing.
    pub manifest: Vec<String>,

    /// Page served when neither network nor cache can answer.
    pub offline_url: String,

    /// Path prefix of immutable static assets.
    pub static_prefix: String,

    /// Serve static assets cache-first. When off, everything is network-first.
    pub static_cache_enabled: bool,

    pub marker: MarkerConfig,

    /// Control message that wipes every cache.
    pub logout_message: String,

    pub cache_policy: CachePolicy,

    /// Optional upper bound on a single network fetch.
    pub fetch_timeout_ms: Option<u64>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            cache_prefix: "pwa-cache-".to_string(),
            legacy_prefixes: vec!["legacy-pwa-".to_string()],
            manifest: vec!["/offline/".to_string()],
            offline_url: "/offline/".to_string(),
            static_prefix: "/static/".to_string(),
            static_cache_enabled: true,
            marker: MarkerConfig::default(),
            logout_message: "logout".to_string(),
            cache_policy: CachePolicy::default(),
            fetch_timeout_ms: None,
        }
    }
}

impl WorkerConfig {
    /// Check internal consistency.
    pub fn validate(&self) -> pwa_common::Result<()> {
        if self.cache_prefix.is_empty() {
            return Err(Error::config("cache_prefix must not be empty"));
        }
        if self.static_prefix.is_empty() {
            return Err(Error::config("static_prefix must not be empty"));
        }
        if self.offline_url.is_empty() {
            return Err(Error::config("offline_url must not be empty"));
        }
        if !self.manifest.iter().any(|u| u == &self.offline_url) {
            return Err(Error::config(format!(
                "offline_url {} must be listed in the manifest",
                self.offline_url
            )));
        }
        if self.marker.attribute.is_empty() || self.marker.online == self.marker.offline {
            return Err(Error::config(
                "marker needs an attribute and distinct online/offline values",
            ));
        }
        if self.logout_message.is_empty() {
            return Err(Error::config("logout_message must not be empty"));
        }
        Ok(())
    }

    /// Current prefix first, then legacy ones.
    pub fn generation_prefixes(&self) -> Vec<&str> {
        std::iter::once(self.cache_prefix.as_str())
            .chain(self.legacy_prefixes.iter().map(String::as_str))
            .collect()
    }

    pub fn fetch_timeout(&self) -> Option<Duration> {
        self.fetch_timeout_ms.map(Duration::from_millis)
    }
}
