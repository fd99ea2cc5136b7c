//! Legacy event-based transport.
//!
//! An [`Xhr`] object is opened, configured and sent, then reports back through
//! listener signals. The backend translates those signals into [`HttpEvent`]s.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::Method;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::body::strip_xssi_prefix;
use super::{
    outgoing_headers, response_url, EventSender, EventStream, ExchangeStream, HttpHandler,
    TransportError, WarnOnce, CONTENT_TYPE_HEADER,
};
use crate::types::{
    is_ok_status, ErrorPayload, ErrorResponse, Headers, HttpEvent, Request, Response,
    ResponseBody, ResponseHead, ResponseType, SerializedBody, HTTP_STATUS_NO_CONTENT,
    HTTP_STATUS_OK,
};
use crate::{Error, ErrorContext, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Unsent,
    Opened,
    HeadersReceived,
    Loading,
    Done,
}

/// Signals a backend can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XhrListener {
    Load,
    Error,
    Timeout,
    Abort,
    DownloadProgress,
    UploadProgress,
}

/// A raw signal from an [`Xhr`] object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XhrEvent {
    Load,
    Error(String),
    Timeout,
    Abort,
    DownloadProgress { loaded: u64, total: Option<u64> },
    UploadProgress { loaded: u64, total: Option<u64> },
}

impl XhrEvent {
    pub fn listener(&self) -> XhrListener {
        match self {
            XhrEvent::Load => XhrListener::Load,
            XhrEvent::Error(_) => XhrListener::Error,
            XhrEvent::Timeout => XhrListener::Timeout,
            XhrEvent::Abort => XhrListener::Abort,
            XhrEvent::DownloadProgress { .. } => XhrListener::DownloadProgress,
            XhrEvent::UploadProgress { .. } => XhrListener::UploadProgress,
        }
    }
}

pub type XhrEventSink = mpsc::UnboundedSender<XhrEvent>;

/// The `response` property of a finished exchange.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum XhrBody {
    #[default]
    None,
    Text(String),
    Bytes(Bytes),
}

/// A legacy request object. Methods take `&self`; implementations keep their own state.
pub trait Xhr: Send + Sync {
    fn open(&self, method: &Method, url: &str);
    fn set_request_header(&self, name: &str, value: &str);
    fn set_timeout(&self, timeout: Duration);
    fn set_response_type(&self, response_type: ResponseType);
    fn set_with_credentials(&self, enable: bool);
    fn add_event_listener(&self, listener: XhrListener, sink: XhrEventSink);
    fn remove_event_listeners(&self);
    fn send(&self, body: Option<SerializedBody>);
    fn abort(&self);

    fn ready_state(&self) -> ReadyState;
    fn status(&self) -> u16;
    fn status_text(&self) -> String;
    fn response(&self) -> XhrBody;
    /// Text buffered so far, if the response is being read as text.
    fn response_text(&self) -> Option<String>;
    fn all_response_headers(&self) -> String;
    fn response_url(&self) -> Option<String>;

    /// Whether upload progress can be observed.
    fn has_upload(&self) -> bool {
        true
    }
}

/// Creates a fresh [`Xhr`] per request.
pub trait XhrFactory: Send + Sync {
    fn build(&self) -> Arc<dyn Xhr>;
}

const JSONP_METHOD: &str = "JSONP";

/// Backend over [`Xhr`] objects.
pub struct XhrBackend {
    factory: Arc<dyn XhrFactory>,
    warned: WarnOnce,
}

impl XhrBackend {
    pub fn new(factory: Arc<dyn XhrFactory>) -> Self {
        Self {
            factory,
            warned: WarnOnce::default(),
        }
    }

    fn warn_unsupported(&self, req: &Request) {
        let requested = [
            ("keepalive", req.keepalive()),
            ("cache", req.cache().is_some()),
            ("priority", req.priority().is_some()),
            ("mode", req.mode().is_some()),
            ("redirect", req.redirect().is_some()),
            ("credentials", req.credentials().is_some()),
            ("integrity", req.integrity().is_some()),
            ("referrer", req.referrer().is_some()),
            ("referrer_policy", req.referrer_policy().is_some()),
        ];
        for (option, set) in requested {
            if set && self.warned.first(option) {
                warn!(
                    option,
                    url = %req.url_with_params(),
                    "option is not supported by the legacy transport and is ignored; use the fetch backend"
                );
            }
        }
    }
}

impl fmt::Debug for XhrBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XhrBackend").finish_non_exhaustive()
    }
}

impl HttpHandler for XhrBackend {
    fn handle(&self, req: Request) -> EventStream {
        if req.method().as_str() == JSONP_METHOD {
            let error = Error::configuration_with_context(
                "JSONP requests cannot be sent by the legacy transport",
                ErrorContext::new()
                    .with_field_path("request.method")
                    .with_source("xhr_backend"),
            );
            return Box::pin(futures::stream::once(async move { Err(error) }));
        }
        self.warn_unsupported(&req);

        let (events, rx) = mpsc::unbounded_channel();
        let driver = drive(self.factory.clone(), req, events);
        Box::pin(ExchangeStream::new(Box::pin(driver), rx))
    }
}

/// Removes listeners and aborts an unfinished exchange when the driver goes away.
struct Teardown(Arc<dyn Xhr>);

impl Drop for Teardown {
    fn drop(&mut self) {
        self.0.remove_event_listeners();
        if self.0.ready_state() != ReadyState::Done {
            self.0.abort();
        }
    }
}

async fn drive(factory: Arc<dyn XhrFactory>, req: Request, events: EventSender) {
    let xhr = factory.build();
    let url = req.url_with_params().to_string();
    debug!(method = %req.method(), url = %url, "dispatching xhr");

    xhr.open(req.method(), &url);
    if req.with_credentials() {
        xhr.set_with_credentials(true);
    }
    for (name, value) in outgoing_headers(&req) {
        xhr.set_request_header(&name, &value);
    }
    if let Some(timeout) = req.timeout() {
        xhr.set_timeout(timeout);
    }
    // JSON is read as text so the XSSI prefix can be stripped before parsing.
    xhr.set_response_type(match req.response_type() {
        ResponseType::Json => ResponseType::Text,
        other => other,
    });

    let body = req.serialize_body();
    let (sink, mut signals) = mpsc::unbounded_channel();
    for listener in [
        XhrListener::Load,
        XhrListener::Error,
        XhrListener::Timeout,
        XhrListener::Abort,
    ] {
        xhr.add_event_listener(listener, sink.clone());
    }
    if req.report_progress() {
        xhr.add_event_listener(XhrListener::DownloadProgress, sink.clone());
        if body.is_some() && xhr.has_upload() {
            xhr.add_event_listener(XhrListener::UploadProgress, sink.clone());
        }
    }
    drop(sink);

    let _teardown = Teardown(xhr.clone());
    xhr.send(body);
    let _ = events.send(Ok(HttpEvent::Sent));

    let mut sent_headers = false;
    while let Some(signal) = signals.recv().await {
        let terminal = match signal {
            XhrEvent::DownloadProgress { loaded, total } => {
                if !sent_headers {
                    let _ = events.send(Ok(HttpEvent::ResponseHeader(head_from(xhr.as_ref(), &url))));
                    sent_headers = true;
                }
                let partial_text = if req.response_type() == ResponseType::Text {
                    xhr.response_text().filter(|t| !t.is_empty())
                } else {
                    None
                };
                let _ = events.send(Ok(HttpEvent::DownloadProgress {
                    loaded,
                    total,
                    partial_text,
                }));
                continue;
            }
            XhrEvent::UploadProgress { loaded, total } => {
                let _ = events.send(Ok(HttpEvent::UploadProgress { loaded, total }));
                continue;
            }
            XhrEvent::Load => on_load(xhr.as_ref(), &req, &url),
            XhrEvent::Error(message) => Err(ErrorResponse::new(
                ErrorPayload::Transport(TransportError::Network(message)),
                Headers::new(),
                xhr.status(),
                Some(xhr.status_text()),
                Some(url.clone()),
            )
            .into()),
            XhrEvent::Timeout => Err(ErrorResponse::transport(
                TransportError::Timeout,
                Some("Request timeout".to_string()),
                Some(url.clone()),
            )
            .into()),
            XhrEvent::Abort => Err(ErrorResponse::transport(
                TransportError::Aborted,
                None,
                Some(url.clone()),
            )
            .into()),
        };
        let _ = events.send(terminal);
        return;
    }
}

fn head_from(xhr: &dyn Xhr, request_url: &str) -> ResponseHead {
    let headers = Headers::from_raw(xhr.all_response_headers());
    let status_text = Some(xhr.status_text())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "OK".to_string());
    let url = response_url(xhr.response_url().as_deref(), &headers)
        .unwrap_or_else(|| request_url.to_string());
    ResponseHead {
        headers,
        status: xhr.status(),
        status_text,
        url: Some(url),
    }
}

fn on_load(xhr: &dyn Xhr, req: &Request, request_url: &str) -> Result<HttpEvent> {
    let mut head = head_from(xhr, request_url);
    let raw = if head.status == HTTP_STATUS_NO_CONTENT {
        XhrBody::None
    } else {
        match xhr.response() {
            XhrBody::None => xhr.response_text().map(XhrBody::Text).unwrap_or_default(),
            body => body,
        }
    };
    if head.status == 0 && raw != XhrBody::None {
        head.status = HTTP_STATUS_OK;
    }
    let ok = is_ok_status(head.status);

    let content_type = head.headers.get(CONTENT_TYPE_HEADER).map(str::to_string);
    let body = match (req.response_type(), raw) {
        (_, XhrBody::None) => ResponseBody::Empty,
        (ResponseType::Json, raw) => {
            let original = xhr_text(raw);
            let stripped = strip_xssi_prefix(&original);
            if stripped.is_empty() {
                ResponseBody::Empty
            } else {
                match serde_json::from_str(stripped) {
                    Ok(value) => ResponseBody::Json(value),
                    Err(error) if ok => {
                        let failure = ErrorResponse::new(
                            ErrorPayload::Parse {
                                error: error.to_string(),
                                text: original,
                            },
                            head.headers,
                            head.status,
                            Some(head.status_text),
                            head.url,
                        );
                        return Err(failure.into());
                    }
                    Err(_) => ResponseBody::Text(original),
                }
            }
        }
        (ResponseType::Text, raw) => ResponseBody::Text(xhr_text(raw)),
        (ResponseType::Blob, raw) => ResponseBody::Blob {
            data: xhr_bytes(raw),
            content_type,
        },
        (ResponseType::ArrayBuffer, raw) => ResponseBody::ArrayBuffer(xhr_bytes(raw)),
    };

    if ok {
        Ok(HttpEvent::Response(Response::new(head, body)))
    } else {
        Err(ErrorResponse::new(
            ErrorPayload::Body(body),
            head.headers,
            head.status,
            Some(head.status_text),
            head.url,
        )
        .into())
    }
}

fn xhr_text(body: XhrBody) -> String {
    match body {
        XhrBody::None => String::new(),
        XhrBody::Text(text) => text,
        XhrBody::Bytes(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
    }
}

fn xhr_bytes(body: XhrBody) -> Bytes {
    match body {
        XhrBody::None => Bytes::new(),
        XhrBody::Text(text) => Bytes::from(text),
        XhrBody::Bytes(bytes) => bytes,
    }
}
