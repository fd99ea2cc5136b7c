//! Server-to-client transfer cache round trips.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::{stream, StreamExt};
use http_pipeline::cache::CacheKey;
use http_pipeline::types::{Headers, ResponseHead, TransferCacheMode};
use http_pipeline::{
    EventStream, HttpClient, HttpEvent, HttpHandler, Params, Platform, Request, Response,
    ResponseBody, TransferCacheOptions, TransferState,
};
use reqwest::Method;
use serde_json::json;

/// Backend answering `{"path": <url>}` and counting its calls.
fn counting_backend(calls: Arc<AtomicUsize>) -> Arc<dyn HttpHandler> {
    Arc::new(move |req: Request| -> EventStream {
        calls.fetch_add(1, Ordering::SeqCst);
        let head = ResponseHead {
            headers: Headers::from_pairs([("ETag", "\"v1\""), ("Cache-Control", "no-store")]),
            status: 200,
            status_text: "OK".to_string(),
            url: Some(req.url_with_params().to_string()),
        };
        let body = match req.response_type() {
            http_pipeline::ResponseType::Text => ResponseBody::Text("plain".into()),
            _ => ResponseBody::Json(json!({ "path": req.url() })),
        };
        Box::pin(stream::iter([
            Ok(HttpEvent::Sent),
            Ok(HttpEvent::Response(Response::new(head, body))),
        ]))
    })
}

fn client(platform: Platform, state: TransferState, calls: Arc<AtomicUsize>) -> HttpClient {
    HttpClient::builder()
        .backend(counting_backend(calls))
        .platform(platform)
        .transfer_cache(TransferCacheOptions::new().with_include_headers(["ETag"]))
        .transfer_state(state)
        .build()
        .unwrap()
}

/// The last response of an event stream.
async fn settle(events: EventStream) -> Response {
    let events: Vec<HttpEvent> = events.map(|e| e.unwrap()).collect().await;
    events.into_iter().last().unwrap().into_response().unwrap()
}

#[tokio::test]
async fn server_render_is_replayed_on_the_client() {
    let server_calls = Arc::new(AtomicUsize::new(0));
    let server_state = TransferState::new();
    let server = client(Platform::Server, server_state.clone(), server_calls.clone());

    let render = server.pending_tasks().add();
    let rendered = server.get("/api/items").param("id", 1).response().await.unwrap();
    assert_eq!(rendered.body.as_json(), Some(&json!({"path": "/api/items"})));
    assert_eq!(server_state.len(), 1);
    drop(render);
    let page_payload = server_state.to_json().unwrap();

    let client_calls = Arc::new(AtomicUsize::new(0));
    let browser = client(
        Platform::Browser,
        TransferState::from_json(&page_payload).unwrap(),
        client_calls.clone(),
    );

    // Both requests are issued during boot, before the app first settles.
    let first = browser.get("/api/items").params(Params::from_query("id=1")).events().unwrap();
    let second = browser.get("/api/items").param("id", 1).events().unwrap();
    let replay = settle(first).await;
    assert!(replay.ok);
    assert_eq!(replay.body.as_json(), Some(&json!({"path": "/api/items"})));
    assert_eq!(replay.headers.get("etag"), Some("\"v1\""));
    assert!(replay.headers.get("cache-control").is_none());
    assert_eq!(settle(second).await.status, 200);
    assert_eq!(client_calls.load(Ordering::SeqCst), 0);
    assert_eq!(server_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cache_retires_after_the_client_first_settles() {
    let state = TransferState::new();
    let server = client(Platform::Server, state.clone(), Arc::new(AtomicUsize::new(0)));
    let render = server.pending_tasks().add();
    server.get("/api/items").response().await.unwrap();
    server.get("/api/other").response().await.unwrap();
    drop(render);
    assert_eq!(state.len(), 2);

    let calls = Arc::new(AtomicUsize::new(0));
    let browser = client(Platform::Browser, state, calls.clone());
    let cache = browser.transfer_cache().unwrap().clone();

    browser.get("/api/items").response().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(browser.pending_tasks().is_stable());
    assert!(!cache.is_active());

    browser.get("/api/other").response().await.unwrap();
    browser.get("/api/items").response().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(cache.stats().hits, 1);
}

#[tokio::test]
async fn stable_client_stops_replaying() {
    let state = TransferState::new();
    let server = client(Platform::Server, state.clone(), Arc::new(AtomicUsize::new(0)));
    server.get("/api/items").response().await.unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let browser = client(Platform::Browser, state, calls.clone());
    browser.when_stable().await;
    assert!(!browser.transfer_cache().unwrap().is_active());

    browser.get("/api/items").response().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn opted_out_and_post_requests() {
    let calls = Arc::new(AtomicUsize::new(0));
    let state = TransferState::new();
    let server = client(Platform::Server, state.clone(), calls.clone());
    let _render = server.pending_tasks().add();

    server
        .get("/api/private")
        .transfer_cache(TransferCacheMode::Disabled)
        .response()
        .await
        .unwrap();
    server.post("/api/search", json!({"q": "x"})).response().await.unwrap();
    assert!(state.is_empty());

    server
        .post("/api/search", json!({"q": "x"}))
        .transfer_cache(TransferCacheMode::Enabled { include_headers: None })
        .response()
        .await
        .unwrap();
    assert_eq!(state.len(), 1);
    let entry = state.get(&state.keys()[0]).unwrap();
    assert!(entry.headers.is_empty());
    assert_eq!(entry.url, "/api/search");
}

#[tokio::test]
async fn text_responses_replay_as_text() {
    let state = TransferState::new();
    let server = client(Platform::Server, state.clone(), Arc::new(AtomicUsize::new(0)));
    assert_eq!(server.get("/motd").text().await.unwrap(), "plain");

    let calls = Arc::new(AtomicUsize::new(0));
    let browser = client(Platform::Browser, state, calls.clone());
    assert_eq!(browser.get("/motd").text().await.unwrap(), "plain");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn keys_are_stable_across_construction_paths() {
    let built = Request::builder(Method::GET, "/api/items")
        .param("b", "2")
        .param("a", "1")
        .build()
        .unwrap();
    let parsed = Request::builder(Method::GET, "/api/items")
        .params(Params::from_query("a=1&b=2"))
        .build()
        .unwrap();
    let key = |r: &Request| CacheKey::for_request(r, r.url()).hash;
    assert_eq!(key(&built), key(&parsed));

    let changed = [
        Request::builder(Method::HEAD, "/api/items").params(Params::from_query("a=1&b=2")).build().unwrap(),
        Request::builder(Method::GET, "/api/item").params(Params::from_query("a=1&b=2")).build().unwrap(),
        Request::builder(Method::GET, "/api/items").params(Params::from_query("a=1&b=3")).build().unwrap(),
        Request::builder(Method::GET, "/api/items")
            .params(Params::from_query("a=1&b=2"))
            .body("payload")
            .build()
            .unwrap(),
    ];
    for request in &changed {
        assert_ne!(key(&built), key(request));
    }
}
