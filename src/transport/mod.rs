//! 传输层模块：执行实际网络交换的后端实现。
//!
//! # Transport Layer
//!
//! Backends consume a [`Request`] and produce the event stream of the exchange. They know
//! nothing about interceptors.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`HttpHandler`] | `handle(request) -> EventStream`, the contract shared by backends and chains |
//! | [`FetchBackend`] | Streaming transport over a [`Fetch`] implementation |
//! | [`XhrBackend`] | Legacy event-based transport over [`Xhr`] objects |
//! | [`HttpTransport`] | reqwest-backed [`Fetch`] and [`XhrFactory`] |
//!
//! The stream does nothing until first polled. Dropping it before the terminal event
//! aborts the in-flight exchange and no further events are produced.

pub(crate) mod body;
pub mod fetch;
pub mod http;
pub mod xhr;

pub use fetch::{Fetch, FetchBackend, FetchInit, FetchResponse};
pub use http::{HttpTransport, ReqwestXhr};
pub use xhr::{ReadyState, Xhr, XhrBackend, XhrBody, XhrEvent, XhrEventSink, XhrFactory, XhrListener};

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::{Future, Stream};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::types::{Headers, HttpEvent, Request};
use crate::{BoxStream, Result};

/// Event stream of one request. The terminal error is an `Err` item.
pub type EventStream = BoxStream<'static, HttpEvent>;

/// Anything that turns a request into its event stream: a backend, or a whole
/// interceptor chain in front of one.
pub trait HttpHandler: Send + Sync {
    fn handle(&self, req: Request) -> EventStream;
}

impl<F> HttpHandler for F
where
    F: Fn(Request) -> EventStream + Send + Sync,
{
    fn handle(&self, req: Request) -> EventStream {
        self(req)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("request aborted")]
    Aborted,

    #[error("transport error: {0}")]
    Other(String),
}

pub(crate) type EventSender = mpsc::UnboundedSender<Result<HttpEvent>>;

/// Event stream backed by a lazily started driver future.
///
/// The driver runs only while the stream is polled and pushes events into a channel.
/// Dropping the stream cancels the abort signal, then drops the driver.
pub(crate) struct ExchangeStream {
    abort: Option<DropGuard>,
    driver: Option<BoxFuture<'static, ()>>,
    events: mpsc::UnboundedReceiver<Result<HttpEvent>>,
}

impl ExchangeStream {
    pub(crate) fn new(
        driver: BoxFuture<'static, ()>,
        events: mpsc::UnboundedReceiver<Result<HttpEvent>>,
    ) -> Self {
        Self {
            abort: None,
            driver: Some(driver),
            events,
        }
    }

    pub(crate) fn with_abort(mut self, signal: CancellationToken) -> Self {
        self.abort = Some(signal.drop_guard());
        self
    }
}

impl Stream for ExchangeStream {
    type Item = Result<HttpEvent>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if let Some(driver) = this.driver.as_mut() {
            if driver.as_mut().poll(cx).is_ready() {
                this.driver = None;
                if let Some(guard) = this.abort.take() {
                    let _ = guard.disarm();
                }
            }
        }
        this.events.poll_recv(cx)
    }
}

pub(crate) const ACCEPT_HEADER: &str = "Accept";
pub(crate) const ACCEPT_HEADER_VALUE: &str = "application/json, text/plain, */*";
pub(crate) const CONTENT_TYPE_HEADER: &str = "Content-Type";
const X_REQUEST_URL_HEADER: &str = "X-Request-URL";

/// Headers as sent on the wire: multi-values joined with `,`, plus `Accept` and a sniffed
/// `Content-Type` when the caller did not set them.
pub(crate) fn outgoing_headers(req: &Request) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = req
        .headers()
        .iter()
        .map(|(name, values)| (name.to_string(), values.join(",")))
        .collect();
    if !req.headers().has(ACCEPT_HEADER) {
        out.push((ACCEPT_HEADER.to_string(), ACCEPT_HEADER_VALUE.to_string()));
    }
    if !req.headers().has(CONTENT_TYPE_HEADER) {
        if let Some(detected) = req.detect_content_type() {
            out.push((CONTENT_TYPE_HEADER.to_string(), detected));
        }
    }
    out
}

/// URL the response came from: what the transport reports, else `X-Request-URL`.
pub(crate) fn response_url(reported: Option<&str>, headers: &Headers) -> Option<String> {
    reported
        .filter(|u| !u.is_empty())
        .map(str::to_string)
        .or_else(|| headers.get(X_REQUEST_URL_HEADER).map(str::to_string))
}

/// Diagnostic causes already reported by one owner.
#[derive(Debug, Default)]
pub(crate) struct WarnOnce {
    seen: Mutex<HashSet<String>>,
}

impl WarnOnce {
    /// `true` the first time `cause` is seen.
    pub(crate) fn first(&self, cause: &str) -> bool {
        match self.seen.lock() {
            Ok(mut seen) => seen.insert(cause.to_string()),
            Err(_) => false,
        }
    }
}
