//! Transfer-cache interceptor: record on the server, replay on the client.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::{stream, TryStreamExt};
use serde::Deserialize;
use tracing::debug;
use url::Url;

use super::key::CacheKey;
use super::state::{TransferEntry, TransferState};
use crate::interceptors::{Interceptor, NextFn, PendingTasks, Platform};
use crate::transport::EventStream;
use crate::types::{HttpEvent, Request, TransferCacheMode};
use crate::{Error, ErrorContext, Result};

const AUTH_HEADERS: [&str; 2] = ["authorization", "proxy-authorization"];

/// Predicate deciding whether a request may use the transfer cache.
#[derive(Clone)]
pub struct RequestFilter(Arc<dyn Fn(&Request) -> bool + Send + Sync>);

impl RequestFilter {
    pub fn new(f: impl Fn(&Request) -> bool + Send + Sync + 'static) -> Self { Self(Arc::new(f)) }
    pub fn matches(&self, req: &Request) -> bool { (self.0)(req) }
}

impl fmt::Debug for RequestFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str("RequestFilter") }
}

/// Global transfer cache options.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TransferCacheOptions {
    /// Response headers kept in recorded entries. `None` keeps none.
    pub include_headers: Option<Vec<String>>,
    pub include_post_requests: bool,
    pub include_requests_with_auth_headers: bool,
    #[serde(skip)]
    pub filter: Option<RequestFilter>,
    /// Server-side origin rewrites applied before keying, e.g. `http://internal:8080` -> `https://example.com`.
    pub origin_map: Option<HashMap<String, String>>,
}

impl TransferCacheOptions {
    pub fn new() -> Self { Self::default() }
    pub fn with_include_headers<I, S>(mut self, headers: I) -> Self where I: IntoIterator<Item = S>, S: Into<String> { self.include_headers = Some(headers.into_iter().map(Into::into).collect()); self }
    pub fn with_post_requests(mut self, enabled: bool) -> Self { self.include_post_requests = enabled; self }
    pub fn with_auth_requests(mut self, enabled: bool) -> Self { self.include_requests_with_auth_headers = enabled; self }
    pub fn with_filter(mut self, f: impl Fn(&Request) -> bool + Send + Sync + 'static) -> Self { self.filter = Some(RequestFilter::new(f)); self }
    pub fn with_origin(mut self, from: impl Into<String>, to: impl Into<String>) -> Self { self.origin_map.get_or_insert_with(HashMap::new).insert(from.into(), to.into()); self }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferCacheStats { pub hits: u64, pub misses: u64, pub writes: u64 }

impl TransferCacheStats {
    pub fn hit_ratio(&self) -> f64 { let total = self.hits + self.misses; if total == 0 { 0.0 } else { self.hits as f64 / total as f64 } }
}

#[derive(Default)]
struct AtomicStats { hits: AtomicU64, misses: AtomicU64, writes: AtomicU64 }
impl AtomicStats {
    fn to_stats(&self) -> TransferCacheStats { TransferCacheStats { hits: self.hits.load(Ordering::Relaxed), misses: self.misses.load(Ordering::Relaxed), writes: self.writes.load(Ordering::Relaxed) } }
}

/// The transfer cache, shared by every request of one application instance.
pub struct TransferCache {
    state: TransferState,
    options: TransferCacheOptions,
    origin_map: HashMap<String, String>,
    platform: Platform,
    active: AtomicBool,
    stats: AtomicStats,
}

impl TransferCache {
    pub fn new(state: TransferState, options: TransferCacheOptions, platform: Platform) -> Result<Self> {
        let origin_map = match &options.origin_map {
            Some(map) if !map.is_empty() => {
                if platform != Platform::Server {
                    return Err(Error::configuration("transfer cache origin map is only supported on the server"));
                }
                map.iter().map(|(from, to)| Ok((normalize_origin_key(from), validate_origin(to)?))).collect::<Result<_>>()?
            }
            _ => HashMap::new(),
        };
        Ok(Self { state, options, origin_map, platform, active: AtomicBool::new(true), stats: AtomicStats::default() })
    }

    pub fn state(&self) -> &TransferState { &self.state }
    pub fn options(&self) -> &TransferCacheOptions { &self.options }
    pub fn platform(&self) -> Platform { self.platform }
    pub fn stats(&self) -> TransferCacheStats { self.stats.to_stats() }
    pub fn is_active(&self) -> bool { self.active.load(Ordering::Acquire) }

    /// Stop reading and writing entries for good.
    pub fn retire(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            debug!(entries = self.state.len(), "transfer cache retired");
        }
    }

    /// Retire the first time the last pending request in `tasks` completes.
    pub fn retire_on_idle(self: &Arc<Self>, tasks: &PendingTasks) {
        let cache = Arc::downgrade(self);
        tasks.on_idle(move || {
            if let Some(cache) = cache.upgrade() {
                cache.retire();
            }
        });
    }

    /// Retire once `tasks` first reports no pending work.
    pub async fn retire_when_stable(&self, tasks: &PendingTasks) {
        tasks.when_stable().await;
        self.retire();
    }

    pub fn is_eligible(&self, req: &Request) -> bool {
        if !self.is_active() {
            return false;
        }
        let mode = req.transfer_cache();
        let method_allowed = match req.method().as_str() {
            "GET" | "HEAD" => true,
            "POST" => self.options.include_post_requests || matches!(mode, TransferCacheMode::Enabled { .. }),
            _ => false,
        };
        if matches!(mode, TransferCacheMode::Disabled) || !method_allowed {
            return false;
        }
        if !self.options.include_requests_with_auth_headers && AUTH_HEADERS.iter().any(|h| req.headers().has(h)) {
            return false;
        }
        self.options.filter.as_ref().map_or(true, |f| f.matches(req))
    }

    /// `url` with its origin replaced when the origin map names it. Relative URLs pass through.
    pub fn map_url(&self, url: &str) -> String {
        if self.origin_map.is_empty() {
            return url.to_string();
        }
        let Ok(parsed) = Url::parse(url) else {
            return url.to_string();
        };
        match self.origin_map.get(&parsed.origin().ascii_serialization()) {
            Some(mapped) => format!("{}{}", mapped, &parsed[url::Position::BeforePath..]),
            None => url.to_string(),
        }
    }

    pub fn key_for(&self, req: &Request) -> CacheKey {
        CacheKey::for_request(req, &self.map_url(req.url()))
    }

    fn include_headers_for<'a>(&'a self, req: &'a Request) -> Option<&'a [String]> {
        match req.transfer_cache() {
            TransferCacheMode::Enabled { include_headers: Some(headers) } => Some(headers),
            _ => self.options.include_headers.as_deref(),
        }
    }

    pub fn intercept(self: &Arc<Self>, req: Request, next: NextFn) -> EventStream {
        if !self.is_eligible(&req) {
            return next(req);
        }
        let url = self.map_url(req.url());
        let key = CacheKey::for_request(&req, &url);

        if let Some(entry) = self.state.get(key.as_str()) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, url = %req.url(), "transfer cache hit");
            let include = self.include_headers_for(&req).unwrap_or_default();
            let mut response = entry.to_response();
            response.headers = response.headers.with_access_probe(req.url(), include);
            return Box::pin(stream::once(async move { Ok(HttpEvent::Response(response)) }));
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        if self.platform != Platform::Server {
            return next(req);
        }

        let cache = Arc::clone(self);
        let response_type = req.response_type();
        let include = self.include_headers_for(&req).map(<[String]>::to_vec);
        Box::pin(next(req).inspect_ok(move |event| {
            let HttpEvent::Response(response) = event else { return };
            if !cache.is_active() {
                return;
            }
            let entry = TransferEntry::from_response(response, url.clone(), response_type, include.as_deref());
            debug!(key = %key, url = %url, "transfer cache write");
            cache.state.set(key.hash.clone(), entry);
            cache.stats.writes.fetch_add(1, Ordering::Relaxed);
        }))
    }

    pub fn into_interceptor(self: Arc<Self>) -> Interceptor {
        Interceptor::from_fn(move |req, next| self.intercept(req, next))
    }
}

impl fmt::Debug for TransferCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferCache")
            .field("platform", &self.platform)
            .field("active", &self.is_active())
            .field("entries", &self.state.len())
            .finish()
    }
}

fn normalize_origin_key(origin: &str) -> String {
    match Url::parse(origin) {
        Ok(parsed) if parsed.origin().is_tuple() => parsed.origin().ascii_serialization(),
        _ => origin.trim_end_matches('/').to_string(),
    }
}

fn validate_origin(origin: &str) -> Result<String> {
    let invalid = || {
        Error::configuration_with_context(
            format!("mapped origin '{}' must be an origin without a path", origin),
            ErrorContext::new().with_field_path("transfer_cache.origin_map"),
        )
    };
    let parsed = Url::parse(origin).map_err(|_| invalid())?;
    if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() || !parsed.origin().is_tuple() {
        return Err(invalid());
    }
    Ok(parsed.origin().ascii_serialization())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Headers, Response, ResponseBody, ResponseHead};
    use futures::StreamExt;
    use reqwest::Method;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn counting_backend(calls: Arc<AtomicUsize>) -> NextFn {
        Arc::new(move |req: Request| -> EventStream {
            calls.fetch_add(1, Ordering::SeqCst);
            let head = ResponseHead {
                headers: Headers::from_pairs([("ETag", "v1"), ("X-Other", "o")]),
                status: 200,
                status_text: "OK".to_string(),
                url: Some(req.url().to_string()),
            };
            let response = Response::new(head, ResponseBody::Json(json!({"id": 1})));
            Box::pin(stream::iter([Ok(HttpEvent::Sent), Ok(HttpEvent::Response(response))]))
        })
    }

    fn cache(platform: Platform, options: TransferCacheOptions) -> Arc<TransferCache> {
        Arc::new(TransferCache::new(TransferState::new(), options, platform).unwrap())
    }

    async fn last_response(events: EventStream) -> Response {
        let events: Vec<_> = events.collect().await;
        events.into_iter().last().unwrap().unwrap().into_response().unwrap()
    }

    #[test]
    fn eligibility_rules() {
        let cache = cache(Platform::Server, TransferCacheOptions::new());
        assert!(cache.is_eligible(&Request::new(Method::GET, "/a")));
        assert!(cache.is_eligible(&Request::new(Method::HEAD, "/a")));
        assert!(!cache.is_eligible(&Request::new(Method::POST, "/a")));
        assert!(!cache.is_eligible(&Request::new(Method::PUT, "/a")));

        let opted_in = Request::builder(Method::POST, "/a")
            .transfer_cache(TransferCacheMode::Enabled { include_headers: None })
            .build()
            .unwrap();
        assert!(cache.is_eligible(&opted_in));
        let opted_out = Request::builder(Method::GET, "/a").transfer_cache(TransferCacheMode::Disabled).build().unwrap();
        assert!(!cache.is_eligible(&opted_out));

        let auth = Request::builder(Method::GET, "/a").header("Authorization", "Bearer x").build().unwrap();
        assert!(!cache.is_eligible(&auth));
        let allowed = self::cache(Platform::Server, TransferCacheOptions::new().with_auth_requests(true));
        assert!(allowed.is_eligible(&auth));

        let filtered = self::cache(Platform::Server, TransferCacheOptions::new().with_filter(|r| !r.url().contains("skip")));
        assert!(!filtered.is_eligible(&Request::new(Method::GET, "/skip")));

        cache.retire();
        assert!(!cache.is_eligible(&Request::new(Method::GET, "/a")));
    }

    #[tokio::test]
    async fn server_records_and_replays_without_backend() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = cache(Platform::Server, TransferCacheOptions::new().with_include_headers(["etag"]));
        let req = Request::new(Method::GET, "/api/items");

        let first = last_response(cache.intercept(req.clone(), counting_backend(calls.clone()))).await;
        assert_eq!(first.body.as_json(), Some(&json!({"id": 1})));
        assert_eq!(cache.state().len(), 1);

        let replay = last_response(cache.intercept(req, counting_backend(calls.clone()))).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(replay.ok);
        assert_eq!(replay.headers.get("etag"), Some("v1"));
        assert!(replay.headers.get("x-other").is_none());
        assert_eq!(replay.headers.probe_warnings(), 1);
        assert_eq!(cache.stats(), TransferCacheStats { hits: 1, misses: 1, writes: 1 });
    }

    #[tokio::test]
    async fn browser_never_writes() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = cache(Platform::Browser, TransferCacheOptions::new());
        let _ = last_response(cache.intercept(Request::new(Method::GET, "/a"), counting_backend(calls.clone()))).await;
        assert!(cache.state().is_empty());
    }

    #[tokio::test]
    async fn retired_cache_is_bypassed() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = cache(Platform::Server, TransferCacheOptions::new());
        let tasks = PendingTasks::new();
        cache.retire_when_stable(&tasks).await;
        assert!(!cache.is_active());
        let _ = last_response(cache.intercept(Request::new(Method::GET, "/a"), counting_backend(calls.clone()))).await;
        assert!(cache.state().is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn retires_when_the_first_request_settles() {
        let cache = cache(Platform::Browser, TransferCacheOptions::new());
        let tasks = PendingTasks::new();
        cache.retire_on_idle(&tasks);
        assert!(cache.is_active());

        let first = tasks.add();
        let second = tasks.add();
        drop(first);
        assert!(cache.is_active());
        drop(second);
        assert!(!cache.is_active());
    }

    #[test]
    fn origin_map_rewrites_keys() {
        let options = TransferCacheOptions::new().with_origin("http://internal:8080", "https://example.com/");
        let cache = cache(Platform::Server, options);
        assert_eq!(cache.map_url("http://internal:8080/api?x=1"), "https://example.com/api?x=1");
        assert_eq!(cache.map_url("http://other/api"), "http://other/api");
        assert_eq!(cache.map_url("/api"), "/api");

        let internal = Request::new(Method::GET, "http://internal:8080/api");
        let public = Request::new(Method::GET, "https://example.com/api");
        let browser = self::cache(Platform::Browser, TransferCacheOptions::new());
        assert_eq!(cache.key_for(&internal), browser.key_for(&public));
    }

    #[test]
    fn origin_map_is_validated() {
        let with_path = TransferCacheOptions::new().with_origin("http://a", "https://b/api");
        assert!(matches!(
            TransferCache::new(TransferState::new(), with_path, Platform::Server),
            Err(Error::Configuration { .. })
        ));
        let on_browser = TransferCacheOptions::new().with_origin("http://a", "https://b");
        assert!(TransferCache::new(TransferState::new(), on_browser, Platform::Browser).is_err());
    }

    #[test]
    fn options_deserialize() {
        let options: TransferCacheOptions =
            serde_json::from_str(r#"{"include_headers": ["etag"], "include_post_requests": true}"#).unwrap();
        assert_eq!(options.include_headers, Some(vec!["etag".to_string()]));
        assert!(options.include_post_requests);
        assert!(options.filter.is_none());
    }
}
