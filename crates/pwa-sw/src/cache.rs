//! A single cache: request -> response snapshots.

use bytes::Bytes;
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use pwa_net::{Request, Response, ResponseType};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use url::Url;

use crate::SwError;

/// Options for matching a request against stored entries.
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchOptions {
    /// Ignore the `Vary` header of stored responses.
    pub ignore_vary: bool,
    /// Match entries regardless of the request method.
    pub ignore_method: bool,
}

/// A cached request/response pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Normalized request URL (no fragment).
    pub url: String,

    /// Request method.
    pub method: String,

    /// Request header values for each name listed in the response's `Vary`.
    pub vary: Vec<(String, Option<String>)>,

    /// Response status.
    pub status: u16,

    pub status_text: String,

    /// Response headers in original order.
    pub headers: Vec<(String, String)>,

    /// Response body.
    #[serde(with = "body_base64")]
    pub body: Bytes,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Snapshot `response` as the answer to `request`.
    pub fn new(request: &Request, response: &Response) -> Self {
        let vary = vary_names(&response.headers)
            .into_iter()
            .map(|name| {
                let value = request
                    .headers
                    .get(name.as_str())
                    .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned());
                (name, value)
            })
            .collect();

        let headers = response
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        Self {
            url: cache_key(&request.url),
            method: request.method.as_str().to_string(),
            vary,
            status: response.status,
            status_text: response.status_text.clone(),
            headers,
            body: response.body.clone(),
            cached_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        }
    }

    /// Rebuild the stored response.
    pub fn to_response(&self) -> Response {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) {
                headers.append(name, value);
            }
        }

        Response {
            url: Url::parse(&self.url).ok(),
            status: self.status,
            status_text: self.status_text.clone(),
            headers,
            body: self.body.clone(),
            response_type: ResponseType::Basic,
        }
    }

    /// Whether this entry answers `request`.
    pub fn matches(&self, request: &Request, options: MatchOptions) -> bool {
        if !options.ignore_method && request.method.as_str() != self.method {
            return false;
        }
        if self.url != cache_key(&request.url) {
            return false;
        }
        if options.ignore_vary {
            return true;
        }
        self.vary.iter().all(|(name, stored)| {
            if name == "*" {
                return false;
            }
            let current = request
                .headers
                .get(name.as_str())
                .map(|v| String::from_utf8_lossy(v.as_bytes()));
            current.as_deref() == stored.as_deref()
        })
    }
}

/// URL used as the storage key: the request URL without its fragment.
pub fn cache_key(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    url.into()
}

/// Lower-cased header names listed in `Vary`.
fn vary_names(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(http::header::VARY)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect()
}

/// Entries of one generation.
#[derive(Debug, Default, Clone)]
pub struct Cache {
    /// Cache name.
    pub name: String,

    /// Entries keyed by normalized URL.
    entries: HashMap<String, Vec<CacheEntry>>,
}

impl Cache {
    /// Create a new cache.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// First entry answering `request`.
    pub fn match_request(&self, request: &Request, options: MatchOptions) -> Option<&CacheEntry> {
        if !options.ignore_method && request.method != Method::GET {
            return None;
        }
        self.entries
            .get(&cache_key(&request.url))?
            .iter()
            .find(|entry| entry.matches(request, options))
    }

    /// Match a plain GET for `url`.
    pub fn match_url(&self, url: &Url, options: MatchOptions) -> Option<&CacheEntry> {
        self.match_request(&Request::get(url.clone()), options)
    }

    /// Store `response` for `request`, replacing entries it supersedes.
    pub fn put(&mut self, request: &Request, response: &Response) -> Result<(), SwError> {
        if request.method != Method::GET {
            return Err(SwError::Cache(format!(
                "refusing to cache {} {}",
                request.method, request.url
            )));
        }
        if response.is_error() {
            return Err(SwError::Cache(format!(
                "refusing to cache an error response for {}",
                request.url
            )));
        }
        if response.status == 206 {
            return Err(SwError::Cache(format!(
                "refusing to cache a partial response for {}",
                request.url
            )));
        }

        let entry = CacheEntry::new(request, response);
        let list = self.entries.entry(entry.url.clone()).or_default();
        list.retain(|existing| !existing.matches(request, MatchOptions::default()));
        list.push(entry);
        Ok(())
    }

    /// Delete entries answering `request`.
    pub fn delete(&mut self, request: &Request, options: MatchOptions) -> bool {
        let key = cache_key(&request.url);
        let Some(list) = self.entries.get_mut(&key) else {
            return false;
        };
        let before = list.len();
        list.retain(|entry| !entry.matches(request, options));
        let removed = list.len() != before;
        if list.is_empty() {
            self.entries.remove(&key);
        }
        removed
    }

    /// Get all keys (URLs), sorted.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.entries.keys().map(|s| s.as_str()).collect();
        keys.sort_unstable();
        keys
    }

    /// Entries stored under `key`.
    pub fn entries_for(&self, key: &str) -> &[CacheEntry] {
        self.entries.get(key).map(Vec::as_slice).unwrap_or_default()
    }

    /// Replace everything stored under `key`; an empty list removes the key.
    pub(crate) fn replace_key(&mut self, key: &str, entries: Vec<CacheEntry>) {
        if entries.is_empty() {
            self.entries.remove(key);
        } else {
            self.entries.insert(key.to_string(), entries);
        }
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

mod body_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
