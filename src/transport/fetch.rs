//! Streaming transport over a fetch-style call.
//!
//! The call is dispatched with an abort signal. The body is read as a byte stream, which
//! allows download progress with partial text and a cooperative stop when the backend is
//! destroyed mid-read.

use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use reqwest::Method;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::body::{parse_body, Utf8StreamDecoder};
use super::{
    outgoing_headers, response_url, EventSender, EventStream, ExchangeStream, HttpHandler,
    TransportError, WarnOnce, CONTENT_TYPE_HEADER,
};
use crate::types::{
    CacheMode, CredentialsMode, ErrorPayload, ErrorResponse, Headers, HttpEvent, Priority,
    RedirectPolicy, Request, RequestMode, Response, ResponseHead, ResponseType, SerializedBody,
    HTTP_STATUS_OK,
};
use crate::Result;

/// Response body as a stream of chunks.
pub type BodyStream = Pin<Box<dyn Stream<Item = std::result::Result<Bytes, TransportError>> + Send>>;

/// Options bag handed to [`Fetch::fetch`].
#[derive(Debug, Clone, Default)]
pub struct FetchInit {
    pub method: Method,
    pub headers: Vec<(String, String)>,
    pub body: Option<SerializedBody>,
    pub credentials: Option<CredentialsMode>,
    pub cache: Option<CacheMode>,
    pub mode: Option<RequestMode>,
    pub redirect: Option<RedirectPolicy>,
    pub referrer: Option<String>,
    pub referrer_policy: Option<String>,
    pub integrity: Option<String>,
    pub keepalive: bool,
    pub priority: Option<Priority>,
}

/// What a fetch call resolves to once the status line and headers are in.
pub struct FetchResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: Headers,
    pub url: Option<String>,
    pub redirected: bool,
    pub response_type: Option<String>,
    pub body: Option<BodyStream>,
}

impl FetchResponse {
    pub fn new(status: u16, headers: Headers) -> Self {
        Self {
            status,
            status_text: String::new(),
            headers,
            url: None,
            redirected: false,
            response_type: None,
            body: None,
        }
    }

    pub fn with_status_text(mut self, status_text: impl Into<String>) -> Self {
        self.status_text = status_text.into();
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_body(mut self, body: BodyStream) -> Self {
        self.body = Some(body);
        self
    }

    /// Body delivered as a single chunk.
    pub fn with_bytes(self, bytes: impl Into<Bytes>) -> Self {
        let chunk: std::result::Result<Bytes, TransportError> = Ok(bytes.into());
        self.with_body(Box::pin(futures::stream::iter(vec![chunk])))
    }
}

impl fmt::Debug for FetchResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchResponse")
            .field("status", &self.status)
            .field("status_text", &self.status_text)
            .field("headers", &self.headers)
            .field("url", &self.url)
            .field("redirected", &self.redirected)
            .field("has_body", &self.body.is_some())
            .finish()
    }
}

/// A fetch-style call: resolves once headers are available, fails on network errors.
/// Cancelling `signal` must abort the call.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(
        &self,
        url: &str,
        init: FetchInit,
        signal: CancellationToken,
    ) -> std::result::Result<FetchResponse, TransportError>;
}

/// Backend that drives a [`Fetch`] implementation.
pub struct FetchBackend {
    fetch: Arc<dyn Fetch>,
    destroyed: Arc<AtomicBool>,
    warned: WarnOnce,
}

impl FetchBackend {
    pub fn new(fetch: Arc<dyn Fetch>) -> Self {
        Self {
            fetch,
            destroyed: Arc::new(AtomicBool::new(false)),
            warned: WarnOnce::default(),
        }
    }

    /// Stop all in-progress body reads at the next chunk boundary. Affected requests
    /// complete without a response.
    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::Release);
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    fn build_init(&self, req: &Request) -> FetchInit {
        let credentials = if req.with_credentials() {
            if req.credentials().is_some() && self.warned.first("credentials") {
                warn!(
                    url = %req.url_with_params(),
                    "both with_credentials and credentials are set; with_credentials wins and credentials mode is include"
                );
            }
            Some(CredentialsMode::Include)
        } else {
            req.credentials()
        };

        FetchInit {
            method: req.method().clone(),
            headers: outgoing_headers(req),
            body: req.serialize_body(),
            credentials,
            cache: req.cache(),
            mode: req.mode(),
            redirect: req.redirect(),
            referrer: req.referrer().map(str::to_string),
            referrer_policy: req.referrer_policy().map(str::to_string),
            integrity: req.integrity().map(str::to_string),
            keepalive: req.keepalive(),
            priority: req.priority(),
        }
    }
}

impl fmt::Debug for FetchBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchBackend")
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl HttpHandler for FetchBackend {
    fn handle(&self, req: Request) -> EventStream {
        let (events, rx) = mpsc::unbounded_channel();
        let signal = CancellationToken::new();
        let init = self.build_init(&req);
        let driver = drive(
            self.fetch.clone(),
            req,
            init,
            events,
            signal.clone(),
            self.destroyed.clone(),
        );
        Box::pin(ExchangeStream::new(Box::pin(driver), rx).with_abort(signal))
    }
}

async fn drive(
    fetch: Arc<dyn Fetch>,
    req: Request,
    init: FetchInit,
    events: EventSender,
    signal: CancellationToken,
    destroyed: Arc<AtomicBool>,
) {
    debug!(method = %req.method(), url = %req.url_with_params(), "dispatching fetch");
    let exchange = exchange(fetch.as_ref(), &req, init, &events, signal.clone(), &destroyed);
    let outcome = match req.timeout() {
        Some(limit) => tokio::select! {
            outcome = exchange => outcome,
            _ = tokio::time::sleep(limit) => {
                debug!(url = %req.url_with_params(), timeout_ms = limit.as_millis() as u64, "request timed out");
                signal.cancel();
                Err(TransportError::Timeout)
            }
        },
        None => exchange.await,
    };

    match outcome {
        Ok(Some(terminal)) => {
            let _ = events.send(terminal);
        }
        Ok(None) => debug!(url = %req.url_with_params(), "backend destroyed during body read"),
        Err(error) => {
            let response =
                ErrorResponse::transport(error, None, Some(req.url_with_params().to_string()));
            let _ = events.send(Err(response.into()));
        }
    }
}

/// Runs one exchange. `Ok(None)` means the backend was destroyed mid-read.
async fn exchange(
    fetch: &dyn Fetch,
    req: &Request,
    init: FetchInit,
    events: &EventSender,
    signal: CancellationToken,
    destroyed: &AtomicBool,
) -> std::result::Result<Option<Result<HttpEvent>>, TransportError> {
    let request_url = req.url_with_params().to_string();
    let pending = fetch.fetch(&request_url, init, signal);
    let _ = events.send(Ok(HttpEvent::Sent));
    let response = pending.await?;

    let FetchResponse {
        status,
        status_text,
        headers,
        url,
        redirected,
        response_type,
        body,
    } = response;
    let url = response_url(url.as_deref(), &headers).unwrap_or(request_url);
    let content_type = headers.get(CONTENT_TYPE_HEADER).map(str::to_string);
    let total = headers
        .get("content-length")
        .and_then(|v| v.trim().parse::<u64>().ok());

    if req.report_progress() {
        let _ = events.send(Ok(HttpEvent::ResponseHeader(ResponseHead {
            headers: headers.clone(),
            status,
            status_text: status_text.clone(),
            url: Some(url.clone()),
        })));
    }

    let mut content = BytesMut::new();
    if let Some(mut body) = body {
        let mut decoder = (req.report_progress() && req.response_type() == ResponseType::Text)
            .then(Utf8StreamDecoder::default);
        let mut partial_text = String::new();
        loop {
            if destroyed.load(Ordering::Acquire) {
                return Ok(None);
            }
            let Some(chunk) = body.next().await else {
                break;
            };
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(error) => {
                    debug!(url = %url, status, error = %error, "body read failed");
                    let failure = ErrorResponse::new(
                        ErrorPayload::Transport(error),
                        headers,
                        status,
                        Some(status_text),
                        Some(url),
                    );
                    return Ok(Some(Err(failure.into())));
                }
            };
            if destroyed.load(Ordering::Acquire) {
                return Ok(None);
            }
            content.extend_from_slice(&chunk);
            if req.report_progress() {
                let partial = decoder.as_mut().map(|decoder| {
                    partial_text.push_str(&decoder.decode(&chunk));
                    partial_text.clone()
                });
                let _ = events.send(Ok(HttpEvent::DownloadProgress {
                    loaded: content.len() as u64,
                    total,
                    partial_text: partial,
                }));
            }
        }
    }

    let content = content.freeze();
    let status = if status == 0 && !content.is_empty() {
        HTTP_STATUS_OK
    } else {
        status
    };
    let head = ResponseHead {
        headers,
        status,
        status_text,
        url: Some(url),
    };

    let body = match parse_body(req.response_type(), content.clone(), content_type.as_deref(), status) {
        Ok(body) => body,
        Err(error) => {
            let text = String::from_utf8_lossy(&content).into_owned();
            let failure = ErrorResponse::new(
                ErrorPayload::Parse { error, text },
                head.headers,
                head.status,
                Some(head.status_text),
                head.url,
            );
            return Ok(Some(Err(failure.into())));
        }
    };

    if head.ok() {
        let mut response = Response::new(head, body);
        response.redirected = Some(redirected);
        response.response_type = response_type;
        Ok(Some(Ok(HttpEvent::Response(response))))
    } else {
        let failure = ErrorResponse::new(
            ErrorPayload::Body(body),
            head.headers,
            head.status,
            Some(head.status_text),
            head.url,
        );
        Ok(Some(Err(failure.into())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Params, ResponseBody};
    use crate::Error;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;

    struct ScriptedFetch {
        status: u16,
        status_text: &'static str,
        headers: Headers,
        chunks: Vec<&'static [u8]>,
        calls: Mutex<Vec<(String, FetchInit)>>,
    }

    impl ScriptedFetch {
        fn new(status: u16, status_text: &'static str, chunks: Vec<&'static [u8]>) -> Arc<Self> {
            Arc::new(Self {
                status,
                status_text,
                headers: Headers::new(),
                chunks,
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Fetch for ScriptedFetch {
        async fn fetch(
            &self,
            url: &str,
            init: FetchInit,
            _signal: CancellationToken,
        ) -> std::result::Result<FetchResponse, TransportError> {
            self.calls.lock().unwrap().push((url.to_string(), init));
            let chunks: Vec<std::result::Result<Bytes, TransportError>> =
                self.chunks.iter().map(|c| Ok(Bytes::from_static(c))).collect();
            Ok(FetchResponse::new(self.status, self.headers.clone())
                .with_status_text(self.status_text)
                .with_body(Box::pin(futures::stream::iter(chunks))))
        }
    }

    /// Never resolves; counts how often its abort signal fires.
    struct HangingFetch {
        aborts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Fetch for HangingFetch {
        async fn fetch(
            &self,
            _url: &str,
            _init: FetchInit,
            signal: CancellationToken,
        ) -> std::result::Result<FetchResponse, TransportError> {
            let aborts = self.aborts.clone();
            tokio::spawn(async move {
                signal.cancelled().await;
                aborts.fetch_add(1, Ordering::SeqCst);
            });
            futures::future::pending().await
        }
    }

    fn items_request() -> Request {
        Request::builder(Method::GET, "/api/items")
            .params(Params::new().set("id", 1))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn get_json_success() {
        let fetch = ScriptedFetch::new(200, "OK", vec![b"{\"id\":1}"]);
        let backend = FetchBackend::new(fetch.clone());

        let events: Vec<_> = backend.handle(items_request()).collect().await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], Ok(HttpEvent::Sent)));
        let response = match &events[1] {
            Ok(HttpEvent::Response(r)) => r,
            other => panic!("unexpected event {:?}", other),
        };
        assert!(response.ok);
        assert_eq!(response.status, 200);
        assert_eq!(response.body, ResponseBody::Json(json!({"id": 1})));
        assert_eq!(response.url.as_deref(), Some("/api/items?id=1"));

        let calls = fetch.calls.lock().unwrap();
        assert_eq!(calls[0].0, "/api/items?id=1");
        assert_eq!(calls[0].1.method, Method::GET);
        assert!(calls[0].1.body.is_none());
    }

    #[tokio::test]
    async fn not_found_is_terminal_error_with_text_body() {
        let fetch = ScriptedFetch::new(404, "Not Found", vec![b"not found"]);
        let backend = FetchBackend::new(fetch);

        let mut stream = backend.handle(items_request());
        assert!(matches!(stream.next().await, Some(Ok(HttpEvent::Sent))));
        let err = match stream.next().await {
            Some(Err(Error::Http(err))) => err,
            other => panic!("unexpected event {:?}", other),
        };
        assert_eq!(err.status, 404);
        assert_eq!(err.error, ErrorPayload::Body(ResponseBody::Text("not found".into())));
        assert_eq!(err.message, "Http failure response for /api/items?id=1: 404 Not Found");
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn parse_failure_on_success_status() {
        let fetch = ScriptedFetch::new(200, "OK", vec![b"{broken"]);
        let backend = FetchBackend::new(fetch);

        let events: Vec<_> = backend.handle(items_request()).collect().await;
        let err = match &events[1] {
            Err(Error::Http(err)) => err,
            other => panic!("unexpected event {:?}", other),
        };
        assert_eq!(err.status, 200);
        assert!(matches!(&err.error, ErrorPayload::Parse { text, .. } if text == "{broken"));
        assert_eq!(err.message, "Http failure during parsing for /api/items?id=1");
    }

    #[tokio::test]
    async fn progress_events_carry_partial_text() {
        let fetch = Arc::new(ScriptedFetch {
            status: 200,
            status_text: "OK",
            headers: Headers::from_raw("Content-Length: 5\nContent-Type: text/plain"),
            chunks: vec![b"hel", b"lo"],
            calls: Mutex::new(Vec::new()),
        });
        let backend = FetchBackend::new(fetch);
        let req = Request::builder(Method::GET, "/greeting")
            .report_progress(true)
            .response_type(ResponseType::Text)
            .build()
            .unwrap();

        let events: Vec<HttpEvent> = backend
            .handle(req)
            .map(|e| e.unwrap())
            .collect()
            .await;
        assert_eq!(events.len(), 5);
        assert!(matches!(events[0], HttpEvent::Sent));
        assert!(matches!(&events[1], HttpEvent::ResponseHeader(head) if head.status == 200));
        assert!(matches!(
            &events[2],
            HttpEvent::DownloadProgress { loaded: 3, total: Some(5), partial_text: Some(t) } if t == "hel"
        ));
        assert!(matches!(
            &events[3],
            HttpEvent::DownloadProgress { loaded: 5, partial_text: Some(t), .. } if t == "hello"
        ));
        assert!(matches!(&events[4], HttpEvent::Response(r) if r.body == ResponseBody::Text("hello".into())));
    }

    /// Sends the head and one chunk, then fails the body.
    struct BrokenBodyFetch;

    #[async_trait]
    impl Fetch for BrokenBodyFetch {
        async fn fetch(
            &self,
            _url: &str,
            _init: FetchInit,
            _signal: CancellationToken,
        ) -> std::result::Result<FetchResponse, TransportError> {
            let chunks = vec![
                Ok(Bytes::from_static(b"[1,")),
                Err(TransportError::Network("connection reset".into())),
            ];
            Ok(FetchResponse::new(200, Headers::from_raw("ETag: v2"))
                .with_status_text("OK")
                .with_body(Box::pin(futures::stream::iter(chunks))))
        }
    }

    #[tokio::test]
    async fn body_read_failure_keeps_the_received_head() {
        let backend = FetchBackend::new(Arc::new(BrokenBodyFetch));

        let events: Vec<_> = backend.handle(items_request()).collect().await;
        assert_eq!(events.len(), 2);
        let err = match &events[1] {
            Err(Error::Http(err)) => err,
            other => panic!("unexpected event {:?}", other),
        };
        assert_eq!(err.status, 200);
        assert_eq!(err.status_text, "OK");
        assert_eq!(err.headers.get("etag"), Some("v2"));
        assert_eq!(err.url.as_deref(), Some("/api/items?id=1"));
        assert_eq!(
            err.error,
            ErrorPayload::Transport(TransportError::Network("connection reset".into()))
        );
    }

    #[tokio::test]
    async fn status_zero_with_body_is_ok() {
        let fetch = ScriptedFetch::new(0, "", vec![b"[1,2]"]);
        let backend = FetchBackend::new(fetch);

        let events: Vec<_> = backend.handle(Request::new(Method::GET, "file:///data.json")).collect().await;
        assert!(matches!(&events[1], Ok(HttpEvent::Response(r)) if r.status == 200 && r.ok));
    }

    #[tokio::test]
    async fn init_fills_accept_content_type_and_credentials() {
        let fetch = ScriptedFetch::new(200, "OK", vec![]);
        let backend = FetchBackend::new(fetch.clone());
        let req = Request::builder(Method::POST, "/api/items")
            .body(json!({"name": "x"}))
            .with_credentials(true)
            .build()
            .unwrap();

        let events: Vec<_> = backend.handle(req).collect().await;
        assert!(matches!(&events[1], Ok(HttpEvent::Response(r)) if r.body.is_empty()));

        let calls = fetch.calls.lock().unwrap();
        let init = &calls[0].1;
        assert_eq!(init.credentials, Some(CredentialsMode::Include));
        assert!(init
            .headers
            .contains(&("Accept".to_string(), "application/json, text/plain, */*".to_string())));
        assert!(init
            .headers
            .contains(&("Content-Type".to_string(), "application/json".to_string())));
        assert_eq!(init.body, Some(SerializedBody::Text("{\"name\":\"x\"}".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_aborts_exactly_once() {
        let aborts = Arc::new(AtomicUsize::new(0));
        let backend = FetchBackend::new(Arc::new(HangingFetch { aborts: aborts.clone() }));
        let req = Request::builder(Method::GET, "/slow")
            .timeout(Duration::from_millis(50))
            .build()
            .unwrap();

        let started = tokio::time::Instant::now();
        let mut stream = backend.handle(req);
        assert!(matches!(stream.next().await, Some(Ok(HttpEvent::Sent))));
        let err = match stream.next().await {
            Some(Err(Error::Http(err))) => err,
            other => panic!("unexpected event {:?}", other),
        };
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(err.is_timeout());
        assert_eq!(err.status, 0);
        assert!(stream.next().await.is_none());

        drop(stream);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(aborts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_stream_aborts_the_call() {
        let aborts = Arc::new(AtomicUsize::new(0));
        let backend = FetchBackend::new(Arc::new(HangingFetch { aborts: aborts.clone() }));

        let mut stream = backend.handle(Request::new(Method::GET, "/slow"));
        assert!(matches!(stream.next().await, Some(Ok(HttpEvent::Sent))));
        drop(stream);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(aborts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unpolled_stream_never_dispatches() {
        let fetch = ScriptedFetch::new(200, "OK", vec![]);
        let backend = FetchBackend::new(fetch.clone());
        drop(backend.handle(items_request()));
        assert!(fetch.calls.lock().unwrap().is_empty());
    }

    struct ChannelFetch {
        body: Mutex<Option<futures::channel::mpsc::UnboundedReceiver<std::result::Result<Bytes, TransportError>>>>,
    }

    #[async_trait]
    impl Fetch for ChannelFetch {
        async fn fetch(
            &self,
            _url: &str,
            _init: FetchInit,
            _signal: CancellationToken,
        ) -> std::result::Result<FetchResponse, TransportError> {
            let body = self.body.lock().unwrap().take().unwrap();
            Ok(FetchResponse::new(200, Headers::new()).with_body(Box::pin(body)))
        }
    }

    #[tokio::test]
    async fn destroy_stops_body_read_without_response() {
        let (chunks, body) = futures::channel::mpsc::unbounded();
        let backend = FetchBackend::new(Arc::new(ChannelFetch {
            body: Mutex::new(Some(body)),
        }));
        let req = Request::builder(Method::GET, "/stream")
            .report_progress(true)
            .response_type(ResponseType::Text)
            .build()
            .unwrap();

        chunks.unbounded_send(Ok(Bytes::from_static(b"abc"))).unwrap();
        let mut stream = backend.handle(req);
        assert!(matches!(stream.next().await, Some(Ok(HttpEvent::Sent))));
        assert!(matches!(stream.next().await, Some(Ok(HttpEvent::ResponseHeader(_)))));
        assert!(matches!(
            stream.next().await,
            Some(Ok(HttpEvent::DownloadProgress { loaded: 3, .. }))
        ));

        backend.destroy();
        chunks.unbounded_send(Ok(Bytes::from_static(b"def"))).unwrap();
        assert!(stream.next().await.is_none());
    }
}
