//! Offline marking of cached HTML.
//!
//! Pages render `data-pwa-network="online"` (configurable) on a root element.
//! When a navigation is answered from the cache because the network failed,
//! the attribute is flipped to the offline value so the page can show a
//! staleness banner. The body is buffered and decoded as UTF-8; anything that
//! is not valid text is reported as [`TransformError::NotText`].

use bytes::Bytes;
use http::header::CONTENT_LENGTH;
use http::HeaderValue;
use pwa_net::Response;
use thiserror::Error;

use crate::config::MarkerConfig;

/// Errors from rewriting a response body.
#[derive(Error, Debug)]
pub enum TransformError {
    #[error("response body is not valid UTF-8: {0}")]
    NotText(#[from] std::string::FromUtf8Error),
}

/// Rewrites the online marker attribute into its offline form.
#[derive(Debug, Clone)]
pub struct OfflineMarker {
    online: String,
    offline: String,
}

impl OfflineMarker {
    pub fn new(attribute: &str, online: &str, offline: &str) -> Self {
        Self {
            online: format!("{attribute}=\"{online}\""),
            offline: format!("{attribute}=\"{offline}\""),
        }
    }

    pub fn from_config(config: &MarkerConfig) -> Self {
        Self::new(&config.attribute, &config.online, &config.offline)
    }

    /// Replace every online marker with the offline one.
    ///
    /// Status, status text and headers are preserved; `Content-Length` is
    /// recomputed when present.
    pub fn mark_offline(&self, response: Response) -> Result<Response, TransformError> {
        let text = String::from_utf8(response.body.to_vec())?;
        let body = Bytes::from(text.replace(&self.online, &self.offline));

        let mut headers = response.headers;
        if headers.contains_key(CONTENT_LENGTH) {
            headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
        }

        Ok(Response {
            headers,
            body,
            ..response
        })
    }
}

impl Default for OfflineMarker {
    fn default() -> Self {
        Self::from_config(&MarkerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderName, StatusCode};

    #[test]
    fn test_marks_offline_and_keeps_metadata() {
        let page = r#"<html data-pwa-network="online"><body>events</body></html>"#;
        let response = Response::new(StatusCode::OK, page)
            .header(
                HeaderName::from_static("x-frame-options"),
                HeaderValue::from_static("DENY"),
            )
            .header(CONTENT_LENGTH, HeaderValue::from(page.len()));

        let marked = OfflineMarker::default().mark_offline(response).unwrap();

        let body = marked.text().unwrap();
        assert!(body.contains(r#"data-pwa-network="offline""#));
        assert!(!body.contains(r#"data-pwa-network="online""#));
        assert_eq!(marked.status, 200);
        assert_eq!(marked.status_text, "OK");
        assert_eq!(marked.header_str("x-frame-options"), Some("DENY"));
        assert_eq!(
            marked.header_str("content-length"),
            Some(body.len().to_string().as_str())
        );
    }

    #[test]
    fn test_every_occurrence_is_replaced() {
        let page =
            r#"<html data-pwa-network="online"><div data-pwa-network="online"></div></html>"#;
        let marked = OfflineMarker::default()
            .mark_offline(Response::new(StatusCode::OK, page))
            .unwrap();
        assert_eq!(marked.text().unwrap().matches("\"offline\"").count(), 2);
    }

    #[test]
    fn test_page_without_marker_is_unchanged() {
        let marked = OfflineMarker::default()
            .mark_offline(Response::new(StatusCode::OK, "<p>plain</p>"))
            .unwrap();
        assert_eq!(marked.text().unwrap(), "<p>plain</p>");
    }

    #[test]
    fn test_custom_marker() {
        let marker = OfflineMarker::new("data-net", "up", "down");
        let marked = marker
            .mark_offline(Response::new(StatusCode::OK, r#"<html data-net="up">"#))
            .unwrap();
        assert_eq!(marked.text().unwrap(), r#"<html data-net="down">"#);
    }

    #[test]
    fn test_binary_body_fails() {
        let response = Response::new(StatusCode::OK, vec![0xff, 0xfe, 0x00]);
        assert!(matches!(
            OfflineMarker::default().mark_offline(response),
            Err(TransformError::NotText(_))
        ));
    }
}
