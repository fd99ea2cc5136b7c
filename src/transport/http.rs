//! reqwest-backed transports.

use std::env;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, TryStreamExt};
use reqwest::{Method, Proxy};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use super::fetch::{Fetch, FetchInit, FetchResponse};
use super::xhr::{ReadyState, Xhr, XhrBody, XhrEvent, XhrEventSink, XhrFactory, XhrListener};
use super::{TransportError, WarnOnce};
use crate::types::{FormValue, Headers, ResponseType, SerializedBody};
use crate::Result;

const REFERRER_CLIENT: &str = "about:client";

/// Production transport: one pooled `reqwest::Client` used both as a [`Fetch`]
/// implementation and as the [`XhrFactory`] of the legacy backend.
///
/// Relative request URLs are resolved against the base URL.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: Option<Url>,
    warned: WarnOnce,
}

impl HttpTransport {
    /// Client tuned from `HTTP_PIPELINE_*` environment variables.
    pub fn new(base_url: Option<&str>) -> Result<Self> {
        let timeout_secs = env_u64("HTTP_PIPELINE_TIMEOUT_SECS").unwrap_or(30);

        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .pool_max_idle_per_host(
                env::var("HTTP_PIPELINE_POOL_MAX_IDLE_PER_HOST")
                    .ok()
                    .and_then(|s| s.parse::<usize>().ok())
                    .unwrap_or(32),
            )
            .pool_idle_timeout(Some(Duration::from_secs(
                env_u64("HTTP_PIPELINE_POOL_IDLE_TIMEOUT_SECS").unwrap_or(90),
            )))
            .http2_adaptive_window(true)
            .http2_keep_alive_interval(Some(Duration::from_secs(30)))
            .http2_keep_alive_timeout(Duration::from_secs(10));

        if let Ok(proxy_url) = env::var("HTTP_PIPELINE_PROXY_URL") {
            match Proxy::all(&proxy_url) {
                Ok(proxy) => builder = builder.proxy(proxy),
                Err(e) => warn!(proxy_url = %proxy_url, error = %e, "ignoring invalid proxy url"),
            }
        }

        let client = builder
            .build()
            .map_err(|e| crate::Error::Transport(TransportError::Other(e.to_string())))?;
        let base_url = base_url.map(parse_base_url).transpose()?;
        Ok(Self::from_client(client, base_url))
    }

    pub fn from_client(client: reqwest::Client, base_url: Option<Url>) -> Self {
        Self {
            client,
            base_url,
            warned: WarnOnce::default(),
        }
    }

    pub fn base_url(&self) -> Option<&Url> {
        self.base_url.as_ref()
    }

    /// The legacy-transport face of this client.
    pub fn xhr_factory(self: &Arc<Self>) -> Arc<dyn XhrFactory> {
        self.clone()
    }

    fn resolve(&self, url: &str) -> std::result::Result<Url, TransportError> {
        let resolved = match &self.base_url {
            Some(base) => base.join(url),
            None => Url::parse(url),
        };
        resolved.map_err(|e| TransportError::Network(format!("invalid url {}: {}", url, e)))
    }

    fn warn_dropped_hints(&self, init: &FetchInit) {
        let dropped = [
            ("cache", init.cache.is_some()),
            ("mode", init.mode.is_some()),
            ("priority", init.priority.is_some()),
            ("integrity", init.integrity.is_some()),
            ("keepalive", init.keepalive),
            ("redirect", init.redirect.is_some()),
            ("credentials", init.credentials.is_some()),
            ("referrer_policy", init.referrer_policy.is_some()),
        ];
        for (hint, set) in dropped {
            if set && self.warned.first(hint) {
                warn!(hint, "request hint has no per-request equivalent in the reqwest transport and is ignored");
            }
        }
    }
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("base_url", &self.base_url.as_ref().map(Url::as_str))
            .finish()
    }
}

fn env_u64(name: &str) -> Option<u64> {
    env::var(name).ok().and_then(|s| s.parse::<u64>().ok())
}

fn parse_base_url(raw: &str) -> Result<Url> {
    Url::parse(raw).map_err(|e| {
        crate::Error::configuration_with_context(
            format!("invalid base url {}: {}", raw, e),
            crate::ErrorContext::new()
                .with_field_path("base_url")
                .with_source("http_transport"),
        )
    })
}

fn network_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Network(e.to_string())
    }
}

fn attach_body(
    request: reqwest::RequestBuilder,
    body: SerializedBody,
) -> std::result::Result<reqwest::RequestBuilder, TransportError> {
    Ok(match body {
        SerializedBody::Text(text) => request.body(text),
        SerializedBody::Bytes(bytes) => request.body(bytes),
        SerializedBody::Form(form) => {
            let mut multipart = reqwest::multipart::Form::new();
            for (name, value) in form.fields() {
                multipart = match value {
                    FormValue::Text(text) => multipart.text(name.clone(), text.clone()),
                    FormValue::File {
                        data,
                        filename,
                        content_type,
                    } => {
                        let mut part = reqwest::multipart::Part::bytes(data.to_vec());
                        if let Some(filename) = filename {
                            part = part.file_name(filename.clone());
                        }
                        if let Some(content_type) = content_type {
                            part = part
                                .mime_str(content_type)
                                .map_err(|e| TransportError::Other(e.to_string()))?;
                        }
                        multipart.part(name.clone(), part)
                    }
                };
            }
            request.multipart(multipart)
        }
    })
}

fn raw_headers(headers: &reqwest::header::HeaderMap) -> String {
    headers
        .iter()
        .map(|(name, value)| format!("{}: {}\r\n", name, String::from_utf8_lossy(value.as_bytes())))
        .collect()
}

#[async_trait]
impl Fetch for HttpTransport {
    async fn fetch(
        &self,
        url: &str,
        init: FetchInit,
        signal: CancellationToken,
    ) -> std::result::Result<FetchResponse, TransportError> {
        let target = self.resolve(url)?;
        self.warn_dropped_hints(&init);

        let mut request = self.client.request(init.method.clone(), target.clone());
        for (name, value) in &init.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(referrer) = init.referrer.as_deref().filter(|r| !r.is_empty() && *r != REFERRER_CLIENT) {
            request = request.header(reqwest::header::REFERER, referrer);
        }
        if let Some(body) = init.body {
            request = attach_body(request, body)?;
        }

        let response = tokio::select! {
            response = request.send() => response.map_err(network_error)?,
            _ = signal.cancelled() => return Err(TransportError::Aborted),
        };

        let status = response.status();
        let final_url = response.url().clone();
        let headers = Headers::from(response.headers());
        debug!(url = %final_url, status = status.as_u16(), "fetch response headers received");
        let body = response.bytes_stream().map_err(network_error);
        Ok(FetchResponse {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            redirected: final_url != target,
            url: Some(final_url.to_string()),
            response_type: None,
            body: Some(Box::pin(body)),
        })
    }
}

impl XhrFactory for HttpTransport {
    fn build(&self) -> Arc<dyn Xhr> {
        Arc::new(ReqwestXhr::new(self.client.clone(), self.base_url.clone()))
    }
}

/// Event-emitting request object over reqwest. `send` spawns the exchange on the
/// current tokio runtime.
pub struct ReqwestXhr {
    client: reqwest::Client,
    base_url: Option<Url>,
    shared: Arc<XhrShared>,
}

struct XhrShared {
    state: Mutex<XhrState>,
}

struct XhrState {
    method: Method,
    url: String,
    headers: Vec<(String, String)>,
    timeout: Option<Duration>,
    response_type: ResponseType,
    listeners: Vec<(XhrListener, XhrEventSink)>,
    ready: ReadyState,
    status: u16,
    status_text: String,
    response_headers: String,
    response_url: Option<String>,
    response_text: Option<String>,
    response: XhrBody,
    abort: CancellationToken,
}

impl XhrShared {
    fn state(&self) -> Option<MutexGuard<'_, XhrState>> {
        self.state.lock().ok()
    }

    fn emit(&self, event: XhrEvent) {
        let Some(state) = self.state() else {
            return;
        };
        let listener = event.listener();
        for (registered, sink) in &state.listeners {
            if *registered == listener {
                let _ = sink.send(event.clone());
            }
        }
    }

    fn finish(&self, event: XhrEvent) {
        if let Some(mut state) = self.state() {
            state.ready = ReadyState::Done;
        }
        self.emit(event);
    }
}

enum XhrFailure {
    Timeout,
    Network(String),
}

impl ReqwestXhr {
    pub fn new(client: reqwest::Client, base_url: Option<Url>) -> Self {
        Self {
            client,
            base_url,
            shared: Arc::new(XhrShared {
                state: Mutex::new(XhrState {
                    method: Method::GET,
                    url: String::new(),
                    headers: Vec::new(),
                    timeout: None,
                    response_type: ResponseType::Text,
                    listeners: Vec::new(),
                    ready: ReadyState::Unsent,
                    status: 0,
                    status_text: String::new(),
                    response_headers: String::new(),
                    response_url: None,
                    response_text: None,
                    response: XhrBody::None,
                    abort: CancellationToken::new(),
                }),
            }),
        }
    }

    fn with_state<R: Default>(&self, f: impl FnOnce(&mut XhrState) -> R) -> R {
        match self.shared.state() {
            Some(mut state) => f(&mut state),
            None => R::default(),
        }
    }
}

impl fmt::Debug for ReqwestXhr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReqwestXhr")
            .field("ready_state", &self.ready_state())
            .finish()
    }
}

impl Xhr for ReqwestXhr {
    fn open(&self, method: &Method, url: &str) {
        self.with_state(|s| {
            s.method = method.clone();
            s.url = url.to_string();
            s.ready = ReadyState::Opened;
        })
    }

    fn set_request_header(&self, name: &str, value: &str) {
        self.with_state(|s| s.headers.push((name.to_string(), value.to_string())))
    }

    fn set_timeout(&self, timeout: Duration) {
        self.with_state(|s| s.timeout = Some(timeout))
    }

    fn set_response_type(&self, response_type: ResponseType) {
        self.with_state(|s| s.response_type = response_type)
    }

    fn set_with_credentials(&self, _enable: bool) {
        // Cookie handling belongs to the shared client.
    }

    fn add_event_listener(&self, listener: XhrListener, sink: XhrEventSink) {
        self.with_state(|s| s.listeners.push((listener, sink)))
    }

    fn remove_event_listeners(&self) {
        self.with_state(|s| s.listeners.clear())
    }

    fn send(&self, body: Option<SerializedBody>) {
        let Some((method, url, headers, timeout, response_type, abort)) = self.shared.state().map(|s| {
            (
                s.method.clone(),
                s.url.clone(),
                s.headers.clone(),
                s.timeout,
                s.response_type,
                s.abort.clone(),
            )
        }) else {
            return;
        };
        let upload_total = body.as_ref().and_then(SerializedBody::len);

        let target = match &self.base_url {
            Some(base) => base.join(&url),
            None => Url::parse(&url),
        };
        let shared = self.shared.clone();
        let mut request = match target {
            Ok(target) => self.client.request(method, target),
            Err(e) => {
                let message = format!("invalid url {}: {}", url, e);
                tokio::spawn(async move { shared.finish(XhrEvent::Error(message)) });
                return;
            }
        };
        for (name, value) in &headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = body {
            request = match attach_body(request, body) {
                Ok(request) => request,
                Err(e) => {
                    let message = e.to_string();
                    tokio::spawn(async move { shared.finish(XhrEvent::Error(message)) });
                    return;
                }
            };
        }

        tokio::spawn(async move {
            let work = perform(&shared, request, response_type, upload_total);
            let deadline = async {
                match timeout {
                    Some(limit) => tokio::time::sleep(limit).await,
                    None => futures::future::pending::<()>().await,
                }
            };
            let outcome = tokio::select! {
                outcome = work => outcome,
                _ = deadline => Err(XhrFailure::Timeout),
                _ = abort.cancelled() => return,
            };
            match outcome {
                Ok(()) => shared.finish(XhrEvent::Load),
                Err(XhrFailure::Timeout) => shared.finish(XhrEvent::Timeout),
                Err(XhrFailure::Network(message)) => shared.finish(XhrEvent::Error(message)),
            }
        });
    }

    fn abort(&self) {
        let token = self.with_state(|s| {
            s.ready = ReadyState::Done;
            Some(s.abort.clone())
        });
        if let Some(token) = token {
            token.cancel();
        }
        self.shared.emit(XhrEvent::Abort);
    }

    fn ready_state(&self) -> ReadyState {
        self.shared
            .state()
            .map(|s| s.ready)
            .unwrap_or(ReadyState::Done)
    }

    fn status(&self) -> u16 {
        self.with_state(|s| s.status)
    }

    fn status_text(&self) -> String {
        self.with_state(|s| s.status_text.clone())
    }

    fn response(&self) -> XhrBody {
        self.with_state(|s| s.response.clone())
    }

    fn response_text(&self) -> Option<String> {
        self.with_state(|s| s.response_text.clone())
    }

    fn all_response_headers(&self) -> String {
        self.with_state(|s| s.response_headers.clone())
    }

    fn response_url(&self) -> Option<String> {
        self.with_state(|s| s.response_url.clone())
    }
}

async fn perform(
    shared: &XhrShared,
    request: reqwest::RequestBuilder,
    response_type: ResponseType,
    upload_total: Option<u64>,
) -> std::result::Result<(), XhrFailure> {
    let failure = |e: reqwest::Error| {
        if e.is_timeout() {
            XhrFailure::Timeout
        } else {
            XhrFailure::Network(e.to_string())
        }
    };

    let response = request.send().await.map_err(failure)?;
    if let Some(total) = upload_total {
        shared.emit(XhrEvent::UploadProgress {
            loaded: total,
            total: Some(total),
        });
    }

    let total = response.content_length();
    if let Some(mut state) = shared.state() {
        let status = response.status();
        state.status = status.as_u16();
        state.status_text = status.canonical_reason().unwrap_or_default().to_string();
        state.response_headers = raw_headers(response.headers());
        state.response_url = Some(response.url().to_string());
        state.ready = ReadyState::HeadersReceived;
    }

    let mut content = BytesMut::new();
    let mut chunks = response.bytes_stream();
    while let Some(chunk) = chunks.next().await {
        let chunk: Bytes = chunk.map_err(failure)?;
        content.extend_from_slice(&chunk);
        if let Some(mut state) = shared.state() {
            state.ready = ReadyState::Loading;
            if response_type == ResponseType::Text {
                state.response_text = Some(String::from_utf8_lossy(&content).into_owned());
            }
        }
        shared.emit(XhrEvent::DownloadProgress {
            loaded: content.len() as u64,
            total,
        });
    }

    let content = content.freeze();
    if let Some(mut state) = shared.state() {
        state.response = match response_type {
            ResponseType::Text | ResponseType::Json => {
                let text = String::from_utf8_lossy(&content).into_owned();
                state.response_text = Some(text.clone());
                XhrBody::Text(text)
            }
            ResponseType::Blob | ResponseType::ArrayBuffer => XhrBody::Bytes(content),
        };
    }
    Ok(())
}
