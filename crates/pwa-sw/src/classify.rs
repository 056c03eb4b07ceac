//! Request classification.

use pwa_net::Request;
use std::fmt;

/// What an intercepted request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Immutable, path-prefixed resource.
    StaticAsset,
    /// Anything else.
    Dynamic,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RequestKind::StaticAsset => "static",
            RequestKind::Dynamic => "dynamic",
        })
    }
}

/// Labels requests by URL path prefix. Never looks at responses.
#[derive(Debug, Clone)]
pub struct RequestClassifier {
    static_prefix: String,
}

impl RequestClassifier {
    pub fn new(static_prefix: impl Into<String>) -> Self {
        Self {
            static_prefix: static_prefix.into(),
        }
    }

    pub fn classify(&self, request: &Request) -> RequestKind {
        if request.url.path().starts_with(&self.static_prefix) {
            RequestKind::StaticAsset
        } else {
            RequestKind::Dynamic
        }
    }
}
