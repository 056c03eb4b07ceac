//! Cache generation names.
//!
//! A generation is a disposable cache namespace. Its name is the configured
//! prefix followed by a suffix that is unique per deploy (and, for
//! identity-scoped names, per user and permission set), so a new worker never
//! reads data written under an older build or another login.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Name of one cache generation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheGeneration(String);

impl CacheGeneration {
    /// Wrap an existing name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// `<prefix>v<millis>`; strictly increasing within a process.
    pub fn timestamped(prefix: &str) -> Self {
        static LAST: AtomicU64 = AtomicU64::new(0);

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let mut prev = LAST.load(Ordering::Relaxed);
        let stamp = loop {
            let next = now.max(prev + 1);
            match LAST.compare_exchange_weak(prev, next, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => break next,
                Err(actual) => prev = actual,
            }
        };

        Self(format!("{prefix}v{stamp}"))
    }

    /// `<prefix>v<version>/<identity>-<permission hash>`.
    pub fn for_identity(prefix: &str, version: &str, identity: &Identity) -> Self {
        Self(format!(
            "{prefix}v{version}/{}-{}",
            identity.label(),
            identity.permission_hash()
        ))
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn matches_any_prefix(name: &str, prefixes: &[&str]) -> bool {
    prefixes.iter().any(|p| name.starts_with(p))
}

/// How a worker picks its generation at install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationSource {
    /// A fresh timestamped name per install.
    Timestamped,
    /// A name decided by the host (e.g. build version plus identity).
    Fixed(CacheGeneration),
}

impl GenerationSource {
    pub fn resolve(&self, prefix: &str) -> CacheGeneration {
        match self {
            GenerationSource::Timestamped => CacheGeneration::timestamped(prefix),
            GenerationSource::Fixed(generation) => generation.clone(),
        }
    }
}

/// The logged-in user a generation is scoped to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Identity {
    /// `None` for anonymous sessions.
    pub user_id: Option<String>,
    pub permissions: BTreeSet<String>,
    pub is_superuser: bool,
    pub is_staff: bool,
}

impl Identity {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self {
            user_id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.permissions.insert(permission.into());
        self
    }

    fn label(&self) -> &str {
        self.user_id.as_deref().unwrap_or("anonymous")
    }

    /// Stable digest of the effective permission set (16 hex chars).
    pub fn permission_hash(&self) -> String {
        let mut effective = self.permissions.clone();
        if self.is_superuser {
            effective.insert("_pwa:superuser".to_string());
        }
        if self.is_staff {
            effective.insert("_pwa:staff".to_string());
        }

        let mut hasher = Sha256::new();
        for permission in &effective {
            hasher.update(permission.as_bytes());
            hasher.update(b"\n");
        }
        let digest = hasher.finalize();
        hex::encode(&digest[..8])
    }
}
