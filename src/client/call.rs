//! Per-call request builder and its terminal operations.

use std::time::Duration;

use bytes::Bytes;
use futures::{future, TryStreamExt};
use reqwest::Method;
use serde::de::DeserializeOwned;

use super::core::HttpClient;
use crate::transport::{EventStream, TransportError};
use crate::types::{
    Body, CacheMode, CredentialsMode, Headers, HttpContext, HttpEvent, Params, Priority,
    RedirectPolicy, Request, RequestBuilder, RequestMode, Response, ResponseBody, ResponseType,
    TransferCacheMode,
};
use crate::{Error, Result};

/// Builder for one call made through an [`HttpClient`].
pub struct CallBuilder<'a> {
    client: &'a HttpClient,
    request: RequestBuilder,
}

impl<'a> CallBuilder<'a> {
    pub(crate) fn new(client: &'a HttpClient, method: Method, url: impl Into<String>) -> Self {
        Self {
            client,
            request: Request::builder(method, url),
        }
    }

    fn map(mut self, f: impl FnOnce(RequestBuilder) -> RequestBuilder) -> Self {
        self.request = f(self.request);
        self
    }

    pub fn body(self, body: impl Into<Body>) -> Self {
        self.map(|r| r.body(body))
    }

    /// Serialize `value` as a JSON body.
    pub fn json_body<T: serde::Serialize + ?Sized>(self, value: &T) -> Result<Self> {
        let body = Body::json(value)?;
        Ok(self.body(body))
    }

    pub fn header(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.map(|r| r.header(name, value))
    }

    pub fn headers(self, headers: Headers) -> Self {
        self.map(|r| r.headers(headers))
    }

    pub fn param(self, name: impl Into<String>, value: impl ToString) -> Self {
        self.map(|r| r.param(name, value))
    }

    pub fn params(self, params: Params) -> Self {
        self.map(|r| r.params(params))
    }

    pub fn context(self, context: HttpContext) -> Self {
        self.map(|r| r.context(context))
    }

    pub fn report_progress(self, enable: bool) -> Self {
        self.map(|r| r.report_progress(enable))
    }

    pub fn with_credentials(self, enable: bool) -> Self {
        self.map(|r| r.with_credentials(enable))
    }

    pub fn credentials(self, mode: CredentialsMode) -> Self {
        self.map(|r| r.credentials(mode))
    }

    pub fn keepalive(self, enable: bool) -> Self {
        self.map(|r| r.keepalive(enable))
    }

    pub fn cache(self, mode: CacheMode) -> Self {
        self.map(|r| r.cache(mode))
    }

    pub fn priority(self, priority: Priority) -> Self {
        self.map(|r| r.priority(priority))
    }

    pub fn mode(self, mode: RequestMode) -> Self {
        self.map(|r| r.mode(mode))
    }

    pub fn redirect(self, policy: RedirectPolicy) -> Self {
        self.map(|r| r.redirect(policy))
    }

    pub fn referrer(self, referrer: impl Into<String>) -> Self {
        self.map(|r| r.referrer(referrer))
    }

    pub fn referrer_policy(self, policy: impl Into<String>) -> Self {
        self.map(|r| r.referrer_policy(policy))
    }

    pub fn integrity(self, integrity: impl Into<String>) -> Self {
        self.map(|r| r.integrity(integrity))
    }

    pub fn response_type(self, response_type: ResponseType) -> Self {
        self.map(|r| r.response_type(response_type))
    }

    pub fn timeout(self, timeout: Duration) -> Self {
        self.map(|r| r.timeout(timeout))
    }

    pub fn transfer_cache(self, mode: TransferCacheMode) -> Self {
        self.map(|r| r.transfer_cache(mode))
    }

    pub fn build(self) -> Result<Request> {
        self.request.build()
    }

    /// Every lifecycle event of the exchange.
    pub fn events(self) -> Result<EventStream> {
        let client = self.client;
        let req = self.build()?;
        Ok(client.request(req))
    }

    /// The final response; progress events are skipped.
    pub async fn response(self) -> Result<Response> {
        let mut events = self
            .events()?
            .try_filter_map(|event: HttpEvent| future::ready(Ok::<_, Error>(event.into_response())));
        match events.try_next().await? {
            Some(response) => Ok(response),
            None => Err(TransportError::Other("stream ended without a response".to_string()).into()),
        }
    }

    pub async fn body_value(self) -> Result<ResponseBody> {
        Ok(self.response().await?.body)
    }

    /// Body as text. The response type is forced to `text`.
    pub async fn text(self) -> Result<String> {
        let body = self.response_type(ResponseType::Text).body_value().await?;
        Ok(body.to_text().unwrap_or_default())
    }

    /// Body decoded into `T`. An empty body decodes from `null`.
    pub async fn json<T: DeserializeOwned>(self) -> Result<T> {
        let body = self.response_type(ResponseType::Json).body_value().await?;
        let value = match body {
            ResponseBody::Json(value) => value,
            ResponseBody::Empty => serde_json::Value::Null,
            other => {
                let text = other.to_text().unwrap_or_default();
                return serde_json::from_str(&text).map_err(Error::from);
            }
        };
        Ok(serde_json::from_value(value)?)
    }

    /// Body as raw bytes. The response type is forced to `arraybuffer`.
    pub async fn bytes(self) -> Result<Bytes> {
        let body = self.response_type(ResponseType::ArrayBuffer).body_value().await?;
        Ok(match body {
            ResponseBody::Blob { data, .. } | ResponseBody::ArrayBuffer(data) => data,
            ResponseBody::Empty => Bytes::new(),
            other => Bytes::from(other.to_text().unwrap_or_default()),
        })
    }
}
