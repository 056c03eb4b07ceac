//! Host configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use pwa_common::{load_json, Error, LogFormat, RetryConfig};
use pwa_sw::{CacheGeneration, GenerationSource, Identity, WorkerConfig};
use serde::{Deserialize, Serialize};
use tracing::info;
use url::Url;

/// Everything the host needs to drive one origin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Origin the worker is registered for.
    pub origin: String,
    /// Where generations and registration state live. Defaults to the
    /// platform data directory.
    pub storage_dir: Option<PathBuf>,
    /// Build version. When set, generations are scoped to version and identity
    /// instead of install time.
    pub app_version: Option<String>,
    pub identity: Identity,
    pub worker: WorkerConfig,
    pub install_retry: RetryConfig,
    pub log_format: LogFormat,
    pub request_timeout_ms: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            origin: "http://localhost:8000/".to_string(),
            storage_dir: None,
            app_version: None,
            identity: Identity::anonymous(),
            worker: WorkerConfig::default(),
            install_retry: RetryConfig::default(),
            log_format: LogFormat::Compact,
            request_timeout_ms: 30_000,
        }
    }
}

impl HostConfig {
    /// Load from `path`, falling back to defaults when the file is missing.
    pub fn load(path: &Path) -> pwa_common::Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "No host config found, using defaults");
            return Ok(Self::default());
        }
        load_json(path)
    }

    pub fn validate(&self) -> pwa_common::Result<()> {
        self.scope()?;
        if self.request_timeout_ms == 0 {
            return Err(Error::config("request_timeout_ms must be positive"));
        }
        if matches!(self.app_version.as_deref(), Some("")) {
            return Err(Error::config("app_version must not be empty when set"));
        }
        self.worker.validate()
    }

    /// The origin as a scope URL.
    pub fn scope(&self) -> pwa_common::Result<Url> {
        Url::parse(&self.origin)
            .map_err(|e| Error::config_with_source(format!("invalid origin {}", self.origin), e))
    }

    pub fn storage_dir(&self) -> PathBuf {
        match self.storage_dir {
            Some(ref dir) => dir.clone(),
            None => dirs::data_local_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("pwa-host"),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn generation_source(&self) -> GenerationSource {
        match self.app_version {
            Some(ref version) => GenerationSource::Fixed(CacheGeneration::for_identity(
                &self.worker.cache_prefix,
                version,
                &self.identity,
            )),
            None => GenerationSource::Timestamped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = HostConfig::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config.origin, "http://localhost:8000/");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host.json");
        std::fs::write(
            &path,
            r#"{"origin": "https://app.example.org/", "worker": {"cache_prefix": "app-"}}"#,
        )
        .unwrap();

        let config = HostConfig::load(&path).unwrap();
        assert_eq!(config.origin, "https://app.example.org/");
        assert_eq!(config.worker.cache_prefix, "app-");
        assert_eq!(config.worker.offline_url, "/offline/");
        assert_eq!(config.request_timeout_ms, 30_000);
    }

    #[test]
    fn test_invalid_origin_is_rejected() {
        let config = HostConfig {
            origin: "not a url".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_versioned_generation_is_identity_scoped() {
        let config = HostConfig {
            app_version: Some("42".into()),
            identity: Identity::user("7").with_permission("events.view"),
            ..Default::default()
        };
        match config.generation_source() {
            GenerationSource::Fixed(generation) => {
                assert!(generation.name().starts_with("pwa-cache-v42/7-"));
            }
            GenerationSource::Timestamped => panic!("expected a fixed generation"),
        }
        assert!(matches!(
            HostConfig::default().generation_source(),
            GenerationSource::Timestamped
        ));
    }
}
