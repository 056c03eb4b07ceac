//! End-to-end behaviour of the worker against a scripted network.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderName};
use http::{HeaderValue, StatusCode};
use pwa_net::{Fetcher, NetError, Request, Response};
use pwa_sw::{
    CacheGeneration, CachePolicy, CacheStorage, GenerationSource, MatchOptions, ResponseSource,
    ServiceWorker, ServiceWorkerState, SwError, WorkerConfig,
};
use tokio::sync::Notify;
use url::Url;

const ORIGIN: &str = "https://app.example.org/";

const OFFLINE_PAGE: &str = r#"<html data-pwa-network="online"><body>You are offline</body></html>"#;

// ==================== Scripted network ====================

#[derive(Clone)]
enum Route {
    Respond(Response),
    Fail,
    /// An error-type response instead of a thrown error.
    Degraded,
}

#[derive(Default)]
struct ScriptedNetwork {
    routes: Mutex<Vec<(String, Route)>>,
    calls: Mutex<Vec<String>>,
    offline: AtomicBool,
    gate: Option<Gate>,
}

struct Gate {
    path: String,
    started: Notify,
    release: Notify,
}

impl ScriptedNetwork {
    fn new() -> Self {
        Self::default()
    }

    fn gated(path: &str) -> Self {
        Self {
            gate: Some(Gate {
                path: path.to_string(),
                started: Notify::new(),
                release: Notify::new(),
            }),
            ..Self::default()
        }
    }

    fn route(&self, path: &str, route: Route) {
        self.routes.lock().unwrap().push((path.to_string(), route));
    }

    fn html(&self, path: &str, body: &str) {
        self.route(
            path,
            Route::Respond(
                Response::new(StatusCode::OK, body.to_string())
                    .header(CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8")),
            ),
        );
    }

    fn go_offline(&self) {
        self.offline.store(true, Ordering::SeqCst);
    }

    fn calls_to(&self, path: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|p| *p == path).count()
    }
}

#[async_trait]
impl Fetcher for ScriptedNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        let path = request.url.path().to_string();
        self.calls.lock().unwrap().push(path.clone());

        if let Some(ref gate) = self.gate {
            if gate.path == path {
                gate.started.notify_one();
                gate.release.notified().await;
            }
        }

        if self.offline.load(Ordering::SeqCst) {
            return Err(NetError::RequestFailed("network unreachable".into()));
        }

        let route = self
            .routes
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(p, _)| *p == path)
            .map(|(_, r)| r.clone());

        match route {
            Some(Route::Respond(response)) => Ok(response),
            Some(Route::Fail) => Err(NetError::RequestFailed(format!("{path} failed"))),
            Some(Route::Degraded) => Ok(Response::error()),
            None => Ok(Response::new(StatusCode::NOT_FOUND, "not found")),
        }
    }
}

// ==================== Helpers ====================

fn url(path: &str) -> Url {
    Url::parse(ORIGIN).unwrap().join(path).unwrap()
}

fn config() -> WorkerConfig {
    WorkerConfig {
        cache_prefix: "app-cache-".into(),
        legacy_prefixes: vec!["legacy-cache-".into()],
        manifest: vec!["/offline/".into()],
        offline_url: "/offline/".into(),
        static_prefix: "/static/".into(),
        ..Default::default()
    }
}

fn build(
    config: WorkerConfig,
    network: &Arc<ScriptedNetwork>,
    storage: &Arc<CacheStorage>,
) -> Arc<ServiceWorker> {
    build_with(config, network, storage, GenerationSource::Timestamped)
}

fn build_with(
    config: WorkerConfig,
    network: &Arc<ScriptedNetwork>,
    storage: &Arc<CacheStorage>,
    source: GenerationSource,
) -> Arc<ServiceWorker> {
    let (worker, _events) = ServiceWorker::new(
        Url::parse(ORIGIN).unwrap(),
        config,
        Arc::clone(storage),
        Arc::clone(network) as Arc<dyn Fetcher>,
    )
    .unwrap();
    Arc::new(worker.with_generation(source))
}

/// Installed and activated worker with the offline page cached.
async fn active_worker(
    config: WorkerConfig,
) -> (Arc<ServiceWorker>, Arc<ScriptedNetwork>, Arc<CacheStorage>) {
    let network = Arc::new(ScriptedNetwork::new());
    network.html("/offline/", OFFLINE_PAGE);
    let storage = Arc::new(CacheStorage::in_memory());
    let worker = build(config, &network, &storage);
    worker.install().await.unwrap();
    worker.activate().await.unwrap();
    (worker, network, storage)
}

async fn cached(worker: &ServiceWorker, request: &Request) -> Option<Response> {
    let generation = worker.generation().unwrap();
    worker
        .storage()
        .open(generation.name())
        .await
        .unwrap()
        .match_request(request, MatchOptions::default())
        .await
}

// ==================== Cache-first ====================

#[tokio::test]
async fn static_cache_hit_skips_network() {
    let (worker, network, _storage) = active_worker(config()).await;
    network.route(
        "/static/app.css",
        Route::Respond(Response::new(StatusCode::OK, "body { color: red }")),
    );

    let first = worker.handle_fetch(Request::get(url("/static/app.css"))).await;
    first.wait_until.settled().await;
    assert_eq!(network.calls_to("/static/app.css"), 1);

    let second = worker.handle_fetch(Request::get(url("/static/app.css"))).await;
    let served = second.result.unwrap();
    assert_eq!(served.source, ResponseSource::Cache);
    assert_eq!(served.response.body, Bytes::from_static(b"body { color: red }"));
    assert_eq!(network.calls_to("/static/app.css"), 1);
}

#[tokio::test]
async fn static_cache_miss_returns_and_persists_identical_copy() {
    let (worker, network, _storage) = active_worker(config()).await;
    let original = Response::new(StatusCode::OK, vec![0x89, b'P', b'N', b'G', 0, 1, 2])
        .header(CONTENT_TYPE, HeaderValue::from_static("image/png"));
    network.route("/static/logo.png", Route::Respond(original.clone()));

    let request = Request::get(url("/static/logo.png"));
    let outcome = worker.handle_fetch(request.clone()).await;
    assert_eq!(outcome.wait_until.len(), 1);
    outcome.wait_until.settled().await;

    let served = outcome.result.unwrap();
    assert_eq!(served.source, ResponseSource::Network);
    assert_eq!(served.response.body, original.body);

    let stored = cached(&worker, &request).await.unwrap();
    assert_eq!(stored.status, original.status);
    assert_eq!(stored.headers, original.headers);
    assert_eq!(stored.body, original.body);
}

#[tokio::test]
async fn static_network_failure_is_surfaced() {
    let (worker, network, _storage) = active_worker(config()).await;
    network.route("/static/app.js", Route::Fail);

    let outcome = worker.handle_fetch(Request::get(url("/static/app.js"))).await;
    assert!(matches!(outcome.result, Err(SwError::Network(_))));
    assert!(outcome.wait_until.is_empty());
}

#[tokio::test]
async fn static_degraded_response_is_surfaced() {
    let (worker, network, _storage) = active_worker(config()).await;
    network.route("/static/app.js", Route::Degraded);

    let outcome = worker.handle_fetch(Request::get(url("/static/app.js"))).await;
    assert!(matches!(outcome.result, Err(SwError::Network(_))));
}

#[tokio::test]
async fn static_post_offline_surfaces_network_error() {
    let (worker, network, _storage) = active_worker(config()).await;
    network.go_offline();

    let upload = Request::post(url("/static/upload"), Bytes::from_static(b"file"));
    let outcome = worker.handle_fetch(upload).await;
    assert!(matches!(outcome.result, Err(SwError::Network(_))));
    assert!(outcome.wait_until.is_empty());
    assert!(cached(&worker, &Request::get(url("/static/upload"))).await.is_none());
}

#[tokio::test]
async fn static_assets_go_network_first_when_caching_disabled() {
    let config = WorkerConfig {
        static_cache_enabled: false,
        ..config()
    };
    let (worker, network, _storage) = active_worker(config).await;
    network.route(
        "/static/app.css",
        Route::Respond(Response::new(StatusCode::OK, "v1")),
    );

    for _ in 0..2 {
        let outcome = worker.handle_fetch(Request::get(url("/static/app.css"))).await;
        assert_eq!(outcome.result.unwrap().source, ResponseSource::Network);
    }
    assert_eq!(network.calls_to("/static/app.css"), 2);
}

// ==================== Network-first ====================

#[tokio::test]
async fn dynamic_get_is_cached_before_return() {
    let (worker, network, _storage) = active_worker(config()).await;
    network.html("/events/", r#"<html data-pwa-network="online">events</html>"#);

    let request = Request::navigate(url("/events/"));
    let outcome = worker.handle_fetch(request.clone()).await;
    assert!(outcome.wait_until.is_empty());
    assert_eq!(outcome.result.unwrap().source, ResponseSource::Network);

    let stored = cached(&worker, &request).await.unwrap();
    assert!(stored.text().unwrap().contains("events"));
}

#[tokio::test]
async fn caller_sees_unmodified_body_when_stored() {
    let (worker, network, _storage) = active_worker(config()).await;
    let page = r#"<html data-pwa-network="online">home</html>"#;
    network.html("/", page);

    let outcome = worker.handle_fetch(Request::navigate(url("/"))).await;
    assert_eq!(outcome.result.unwrap().response.text().unwrap(), page);
}

#[tokio::test]
async fn offline_navigation_serves_marked_cached_page() {
    let (worker, network, _storage) = active_worker(config()).await;
    network.route(
        "/events/",
        Route::Respond(
            Response::new(
                StatusCode::OK,
                r#"<html data-pwa-network="online"><body>events</body></html>"#,
            )
            .header(CONTENT_TYPE, HeaderValue::from_static("text/html"))
            .header(
                HeaderName::from_static("x-request-id"),
                HeaderValue::from_static("abc"),
            ),
        ),
    );
    worker.handle_fetch(Request::navigate(url("/events/"))).await.result.unwrap();

    network.go_offline();
    let served = worker
        .handle_fetch(Request::navigate(url("/events/")))
        .await
        .result
        .unwrap();

    assert_eq!(served.source, ResponseSource::CacheMarkedOffline);
    let body = served.response.text().unwrap();
    assert!(body.contains(r#"data-pwa-network="offline""#));
    assert!(body.contains("events"));
    assert_eq!(served.response.status, 200);
    assert_eq!(served.response.status_text, "OK");
    assert_eq!(served.response.header_str("content-type"), Some("text/html"));
    assert_eq!(served.response.header_str("x-request-id"), Some("abc"));
}

#[tokio::test]
async fn stored_copy_is_never_marked() {
    let (worker, network, _storage) = active_worker(config()).await;
    network.html("/events/", r#"<html data-pwa-network="online"></html>"#);
    worker.handle_fetch(Request::navigate(url("/events/"))).await.result.unwrap();

    network.go_offline();
    worker.handle_fetch(Request::navigate(url("/events/"))).await.result.unwrap();

    let stored = cached(&worker, &Request::get(url("/events/"))).await.unwrap();
    assert!(stored.text().unwrap().contains(r#"data-pwa-network="online""#));
}

#[tokio::test]
async fn offline_subresource_served_unmodified() {
    let (worker, network, _storage) = active_worker(config()).await;
    let json = r#"{"state": "data-pwa-network=\"online\""}"#;
    network.route("/api/events.json", Route::Respond(Response::new(StatusCode::OK, json)));
    worker.handle_fetch(Request::get(url("/api/events.json"))).await.result.unwrap();

    network.go_offline();
    let served = worker
        .handle_fetch(Request::get(url("/api/events.json")))
        .await
        .result
        .unwrap();
    assert_eq!(served.source, ResponseSource::Cache);
    assert_eq!(served.response.text().unwrap(), json);
}

#[tokio::test]
async fn offline_without_cache_serves_fallback_page() {
    let (worker, network, _storage) = active_worker(config()).await;
    network.go_offline();

    let fallback = cached(&worker, &Request::get(url("/offline/"))).await.unwrap();

    for request in [
        Request::navigate(url("/never-visited/")),
        Request::get(url("/api/unknown.json")),
    ] {
        let served = worker.handle_fetch(request).await.result.unwrap();
        assert_eq!(served.source, ResponseSource::OfflineFallback);
        assert_eq!(served.response, fallback);
    }
}

#[tokio::test]
async fn degraded_response_is_treated_as_offline() {
    let (worker, network, _storage) = active_worker(config()).await;
    network.route("/events/", Route::Degraded);

    let served = worker
        .handle_fetch(Request::navigate(url("/events/")))
        .await
        .result
        .unwrap();
    assert_eq!(served.source, ResponseSource::OfflineFallback);
}

#[tokio::test]
async fn post_is_never_cached_and_falls_back_offline() {
    let (worker, network, _storage) = active_worker(config()).await;
    network.html("/events/1/signup/", "<p>thanks</p>");

    let post = Request::post(url("/events/1/signup/"), Bytes::from_static(b"a=1"));
    let served = worker.handle_fetch(post.clone()).await.result.unwrap();
    assert_eq!(served.source, ResponseSource::Network);
    assert!(cached(&worker, &Request::get(url("/events/1/signup/"))).await.is_none());

    network.go_offline();
    let served = worker.handle_fetch(post).await.result.unwrap();
    assert_eq!(served.source, ResponseSource::OfflineFallback);
}

#[tokio::test]
async fn error_pages_are_returned_but_not_cached_by_default() {
    let (worker, network, _storage) = active_worker(config()).await;
    network.route(
        "/missing/",
        Route::Respond(Response::new(StatusCode::NOT_FOUND, "nope")),
    );

    let served = worker
        .handle_fetch(Request::navigate(url("/missing/")))
        .await
        .result
        .unwrap();
    assert_eq!(served.response.status, 404);
    assert!(cached(&worker, &Request::get(url("/missing/"))).await.is_none());
}

#[tokio::test]
async fn any_response_policy_caches_error_pages() {
    let config = WorkerConfig {
        cache_policy: CachePolicy::AnyResponse,
        ..config()
    };
    let (worker, network, _storage) = active_worker(config).await;
    network.route(
        "/missing/",
        Route::Respond(Response::new(StatusCode::NOT_FOUND, "nope")),
    );

    worker.handle_fetch(Request::get(url("/missing/"))).await.result.unwrap();
    let stored = cached(&worker, &Request::get(url("/missing/"))).await.unwrap();
    assert_eq!(stored.status, 404);
}

#[tokio::test]
async fn undecodable_cached_navigation_falls_back_to_offline_page() {
    let (worker, network, _storage) = active_worker(config()).await;
    network.route(
        "/report.pdf",
        Route::Respond(Response::new(StatusCode::OK, vec![0x25, 0x50, 0xff, 0xfe])),
    );
    worker.handle_fetch(Request::navigate(url("/report.pdf"))).await.result.unwrap();

    network.go_offline();
    let served = worker
        .handle_fetch(Request::navigate(url("/report.pdf")))
        .await
        .result
        .unwrap();
    assert_eq!(served.source, ResponseSource::OfflineFallback);
}

#[tokio::test]
async fn missing_fallback_returns_network_error() {
    let (worker, network, storage) = active_worker(config()).await;
    let generation = worker.generation().unwrap().name().to_string();
    storage
        .open(&generation)
        .await
        .unwrap()
        .delete(&Request::get(url("/offline/")), MatchOptions::default())
        .await
        .unwrap();

    network.go_offline();
    let outcome = worker.handle_fetch(Request::navigate(url("/events/"))).await;
    assert!(matches!(outcome.result, Err(SwError::Network(_))));

    // the worker keeps serving after the failure
    let outcome = worker.handle_fetch(Request::navigate(url("/events/"))).await;
    assert!(outcome.result.is_err());
    assert!(worker.is_active());
}

// ==================== Install / activate ====================

#[tokio::test]
async fn install_fails_when_any_manifest_entry_fails() {
    let network = Arc::new(ScriptedNetwork::new());
    network.html("/offline/", OFFLINE_PAGE);
    network.route("/app.css", Route::Fail);
    let storage = Arc::new(CacheStorage::in_memory());

    let config = WorkerConfig {
        manifest: vec!["/offline/".into(), "/app.css".into()],
        ..config()
    };
    let worker = build(config, &network, &storage);

    let result = worker.install().await;
    assert!(matches!(result, Err(SwError::InstallFailed(_))));
    assert_eq!(worker.state(), ServiceWorkerState::Redundant);
    assert!(worker.generation().is_none());
    assert!(storage.keys().await.is_empty());
    assert!(worker.activate().await.is_err());
}

#[tokio::test]
async fn install_fails_on_non_success_manifest_status() {
    let network = Arc::new(ScriptedNetwork::new());
    network.route(
        "/offline/",
        Route::Respond(Response::new(StatusCode::INTERNAL_SERVER_ERROR, "")),
    );
    let storage = Arc::new(CacheStorage::in_memory());
    let worker = build(config(), &network, &storage);

    assert!(matches!(worker.install().await, Err(SwError::InstallFailed(_))));
    assert!(storage.keys().await.is_empty());
}

#[tokio::test]
async fn activate_sweeps_current_and_legacy_prefixes_only() {
    let network = Arc::new(ScriptedNetwork::new());
    network.html("/offline/", OFFLINE_PAGE);
    let storage = Arc::new(CacheStorage::in_memory());
    for name in ["app-cache-v0", "legacy-cache-x", "someone-elses-cache"] {
        storage.open(name).await.unwrap();
    }

    let worker = build_with(
        config(),
        &network,
        &storage,
        GenerationSource::Fixed(CacheGeneration::new("app-cache-v1")),
    );
    worker.install().await.unwrap();

    let mut deleted = worker.activate().await.unwrap();
    deleted.sort();
    assert_eq!(deleted, vec!["app-cache-v0", "legacy-cache-x"]);
    assert_eq!(
        storage.keys().await,
        vec!["app-cache-v1", "someone-elses-cache"]
    );

    // nothing left to sweep
    assert!(worker.activate().await.unwrap().is_empty());
    assert_eq!(worker.state(), ServiceWorkerState::Activated);
}

#[tokio::test]
async fn sweep_continues_past_a_failed_deletion() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(CacheStorage::persistent(dir.path()).await.unwrap());
    storage.open("app-cache-v0").await.unwrap();
    storage.open("legacy-cache-x").await.unwrap();

    // a plain file where the cache directory should be makes removal fail
    let blocked = dir.path().join("app-cache-v0");
    std::fs::remove_dir(&blocked).unwrap();
    std::fs::write(&blocked, b"x").unwrap();

    let network = Arc::new(ScriptedNetwork::new());
    network.html("/offline/", OFFLINE_PAGE);
    let worker = build(config(), &network, &storage);
    worker.install().await.unwrap();

    let deleted = worker.activate().await.unwrap();
    assert_eq!(deleted, vec!["legacy-cache-x"]);
    assert!(worker.is_active());
    assert!(!dir.path().join("legacy-cache-x").exists());
}

// ==================== Invalidation ====================

#[tokio::test]
async fn invalidate_all_is_idempotent() {
    let (worker, _network, storage) = active_worker(config()).await;
    storage.open("legacy-cache-x").await.unwrap();

    let deleted = worker.invalidate_all().await.unwrap();
    assert_eq!(deleted.len(), 2);
    assert!(storage.keys().await.is_empty());

    assert!(worker.invalidate_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn logout_during_inflight_fetch_leaves_nothing_behind() {
    let network = Arc::new(ScriptedNetwork::gated("/dashboard/"));
    network.html("/offline/", OFFLINE_PAGE);
    network.html("/dashboard/", "<p>private</p>");
    let storage = Arc::new(CacheStorage::in_memory());
    let worker = build(config(), &network, &storage);
    worker.install().await.unwrap();
    worker.activate().await.unwrap();

    let in_flight = {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move {
            worker
                .handle_fetch(Request::navigate(url("/dashboard/")))
                .await
        })
    };

    let gate = network.gate.as_ref().unwrap();
    gate.started.notified().await;
    worker.handle_message("logout").settled().await;
    assert!(storage.keys().await.is_empty());

    gate.release.notify_one();
    let outcome = in_flight.await.unwrap();
    outcome.wait_until.settled().await;
    assert_eq!(outcome.result.unwrap().source, ResponseSource::Network);

    assert!(cached(&worker, &Request::get(url("/dashboard/"))).await.is_none());
}

#[tokio::test]
async fn unknown_control_message_keeps_caches() {
    let (worker, _network, storage) = active_worker(config()).await;
    worker.handle_message("refresh").settled().await;
    assert_eq!(storage.keys().await.len(), 1);
}

#[tokio::test]
async fn requests_after_logout_repopulate_a_fresh_store() {
    let (worker, network, storage) = active_worker(config()).await;
    network.html("/events/", "<p>events</p>");

    worker.invalidate_all().await.unwrap();
    let served = worker
        .handle_fetch(Request::navigate(url("/events/")))
        .await
        .result
        .unwrap();
    assert_eq!(served.source, ResponseSource::Network);
    assert_eq!(storage.keys().await.len(), 1);
    assert!(cached(&worker, &Request::get(url("/events/"))).await.is_some());
    assert!(cached(&worker, &Request::get(url("/offline/"))).await.is_none());
}
