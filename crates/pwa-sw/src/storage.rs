//! Cache storage: the set of named caches.
//!
//! Caches live in memory and, for persistent storage, are mirrored to one
//! directory per cache holding one JSON file per key. A write touches only the
//! file of the key it changes, through a temp file and a rename, so a crash
//! never leaves a half-written entry. A write that fails on disk is rolled back
//! in memory.
//!
//! [`CacheStorage::open`] hands out shared handles. Deleting a cache detaches
//! its handle: later writes through a detached handle stay in that handle and
//! are never visible through the storage again.

use hashbrown::HashMap;
use pwa_net::{Request, Response};
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{cache_key, Cache, CacheEntry, MatchOptions};
use crate::SwError;

/// Shared handle to one named cache.
#[derive(Debug)]
pub struct CacheHandle {
    name: String,
    cache: RwLock<Cache>,
    dir: Option<PathBuf>,
    detached: AtomicBool,
}

impl CacheHandle {
    fn new(cache: Cache, dir: Option<PathBuf>) -> Self {
        Self {
            name: cache.name.clone(),
            cache: RwLock::new(cache),
            dir,
            detached: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the cache was deleted from storage after this handle was opened.
    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    pub async fn match_request(
        &self,
        request: &Request,
        options: MatchOptions,
    ) -> Option<Response> {
        self.cache
            .read()
            .await
            .match_request(request, options)
            .map(|entry| entry.to_response())
    }

    pub async fn match_url(&self, url: &Url, options: MatchOptions) -> Option<Response> {
        self.cache
            .read()
            .await
            .match_url(url, options)
            .map(|entry| entry.to_response())
    }

    /// Store one response.
    pub async fn put(&self, request: &Request, response: &Response) -> Result<(), SwError> {
        let key = cache_key(&request.url);
        let mut cache = self.cache.write().await;
        let previous = cache.entries_for(&key).to_vec();

        cache.put(request, response)?;
        if let Err(e) = self.persist_key(&cache, &key).await {
            cache.replace_key(&key, previous);
            return Err(e);
        }
        debug!(cache = %self.name, url = %request.url, "Stored response");
        Ok(())
    }

    /// Store several responses; either all of them land or none do.
    pub async fn put_all(&self, pairs: &[(Request, Response)]) -> Result<(), SwError> {
        let mut cache = self.cache.write().await;

        let mut previous: Vec<(String, Vec<CacheEntry>)> = Vec::new();
        for (request, _) in pairs {
            let key = cache_key(&request.url);
            if !previous.iter().any(|(k, _)| *k == key) {
                let entries = cache.entries_for(&key).to_vec();
                previous.push((key, entries));
            }
        }

        if let Err(e) = pairs
            .iter()
            .try_for_each(|(request, response)| cache.put(request, response))
        {
            for (key, entries) in previous {
                cache.replace_key(&key, entries);
            }
            return Err(e);
        }

        let mut written = 0;
        let mut failure = None;
        for (key, _) in &previous {
            if let Err(e) = self.persist_key(&cache, key).await {
                failure = Some(e);
                break;
            }
            written += 1;
        }

        if let Some(e) = failure {
            for (i, (key, entries)) in previous.into_iter().enumerate() {
                cache.replace_key(&key, entries);
                if i < written {
                    if let Err(undo) = self.persist_key(&cache, &key).await {
                        warn!(
                            cache = %self.name,
                            key = %key,
                            error = %undo,
                            "Failed to restore entry"
                        );
                    }
                }
            }
            return Err(e);
        }

        debug!(cache = %self.name, count = pairs.len(), "Stored responses");
        Ok(())
    }

    pub async fn delete(&self, request: &Request, options: MatchOptions) -> Result<bool, SwError> {
        let key = cache_key(&request.url);
        let mut cache = self.cache.write().await;
        let previous = cache.entries_for(&key).to_vec();

        if !cache.delete(request, options) {
            return Ok(false);
        }
        if let Err(e) = self.persist_key(&cache, &key).await {
            cache.replace_key(&key, previous);
            return Err(e);
        }
        Ok(true)
    }

    pub async fn keys(&self) -> Vec<String> {
        self.cache
            .read()
            .await
            .keys()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.cache.read().await.len()
    }

    /// Write the entries under `key` to disk. Callers hold the write lock.
    async fn persist_key(&self, cache: &Cache, key: &str) -> Result<(), SwError> {
        let Some(ref dir) = self.dir else {
            return Ok(());
        };
        if self.is_detached() {
            return Ok(());
        }

        let path = entry_file(dir, key);
        let entries = cache.entries_for(key);
        if entries.is_empty() {
            return remove_if_present(tokio::fs::remove_file(&path).await);
        }

        let bytes = serde_json::to_vec(entries)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Detach from storage and remove the backing directory.
    async fn detach(&self) -> Result<(), SwError> {
        let _guard = self.cache.write().await;
        self.detached.store(true, Ordering::Release);
        match self.dir {
            Some(ref dir) => remove_if_present(tokio::fs::remove_dir_all(dir).await),
            None => Ok(()),
        }
    }
}

/// The set of named caches (the `caches` global).
#[derive(Debug)]
pub struct CacheStorage {
    caches: RwLock<HashMap<String, Arc<CacheHandle>>>,
    dir: Option<PathBuf>,
}

impl CacheStorage {
    /// Storage that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            caches: RwLock::new(HashMap::new()),
            dir: None,
        }
    }

    /// Storage mirrored to `dir`, restoring any caches already there.
    pub async fn persistent(dir: impl Into<PathBuf>) -> Result<Self, SwError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let mut caches = HashMap::new();
        let mut children = tokio::fs::read_dir(&dir).await?;
        while let Some(child) = children.next_entry().await? {
            if !child.file_type().await?.is_dir() {
                continue;
            }
            let path = child.path();
            let file_name = child.file_name();
            let name = match file_name.to_str().map(urlencoding::decode) {
                Some(Ok(name)) => name.into_owned(),
                _ => {
                    warn!(path = %path.display(), "Skipping cache directory with a bad name");
                    continue;
                }
            };

            match load_cache(&name, &path).await {
                Ok(cache) => {
                    debug!(cache = %name, entries = cache.len(), "Restored cache");
                    caches.insert(name, Arc::new(CacheHandle::new(cache, Some(path))));
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable cache");
                }
            }
        }

        info!(dir = %dir.display(), caches = caches.len(), "Cache storage opened");

        Ok(Self {
            caches: RwLock::new(caches),
            dir: Some(dir),
        })
    }

    /// Open a cache, creating it if it doesn't exist.
    pub async fn open(&self, name: &str) -> Result<Arc<CacheHandle>, SwError> {
        if let Some(handle) = self.caches.read().await.get(name) {
            return Ok(Arc::clone(handle));
        }

        let mut caches = self.caches.write().await;
        if let Some(handle) = caches.get(name) {
            return Ok(Arc::clone(handle));
        }

        let path = self.dir.as_ref().map(|dir| cache_dir(dir, name));
        if let Some(ref path) = path {
            tokio::fs::create_dir_all(path).await?;
        }
        let handle = Arc::new(CacheHandle::new(Cache::new(name), path));
        caches.insert(name.to_string(), Arc::clone(&handle));
        debug!(cache = %name, "Created cache");
        Ok(handle)
    }

    /// Check if cache exists.
    pub async fn has(&self, name: &str) -> bool {
        self.caches.read().await.contains_key(name)
    }

    /// Delete a cache. Returns `false` if it did not exist.
    pub async fn delete(&self, name: &str) -> Result<bool, SwError> {
        let removed = self.caches.write().await.remove(name);
        match removed {
            Some(handle) => {
                handle.detach().await?;
                debug!(cache = %name, "Deleted cache");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// All cache names, sorted.
    pub async fn keys(&self) -> Vec<String> {
        let mut names: Vec<String> = self.caches.read().await.keys().cloned().collect();
        names.sort_unstable();
        names
    }
}

async fn load_cache(name: &str, dir: &Path) -> Result<Cache, SwError> {
    let mut cache = Cache::new(name);
    let mut files = tokio::fs::read_dir(dir).await?;
    while let Some(file) = files.next_entry().await? {
        let path = file.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }

        let entries = match tokio::fs::read(&path).await {
            Ok(raw) => serde_json::from_slice::<Vec<CacheEntry>>(&raw).map_err(SwError::from),
            Err(e) => Err(e.into()),
        };
        match entries {
            Ok(entries) => {
                if let Some(key) = entries.first().map(|entry| entry.url.clone()) {
                    cache.replace_key(&key, entries);
                }
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping corrupt cache entry");
            }
        }
    }
    Ok(cache)
}

fn remove_if_present(result: std::io::Result<()>) -> Result<(), SwError> {
    match result {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

fn cache_dir(dir: &Path, name: &str) -> PathBuf {
    dir.join(&*urlencoding::encode(name))
}

fn entry_file(dir: &Path, key: &str) -> PathBuf {
    let digest = Sha256::digest(key.as_bytes());
    dir.join(format!("{}.json", hex::encode(&digest[..16])))
}
