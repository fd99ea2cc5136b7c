//! The immutable request value.

use bytes::Bytes;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::context::HttpContext;
use super::headers::Headers;
use super::params::Params;
use crate::{Error, ErrorContext, Result};

/// How the response body should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    #[default]
    Json,
    Text,
    Blob,
    #[serde(rename = "arraybuffer")]
    ArrayBuffer,
}

impl ResponseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseType::Json => "json",
            ResponseType::Text => "text",
            ResponseType::Blob => "blob",
            ResponseType::ArrayBuffer => "arraybuffer",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialsMode {
    Omit,
    SameOrigin,
    Include,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    Default,
    NoStore,
    Reload,
    NoCache,
    ForceCache,
    OnlyIfCached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
    SameOrigin,
    NoCors,
    Cors,
    Navigate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectPolicy {
    Follow,
    Error,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    High,
    Low,
    Auto,
}

/// Per-request participation in the transfer cache.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TransferCacheMode {
    /// Follow the global transfer cache options.
    #[default]
    Inherit,
    /// Never cache or replay this request.
    Disabled,
    /// Opt in (this also admits POST requests), optionally overriding the header allow-list.
    Enabled { include_headers: Option<Vec<String>> },
}

/// A value of a multipart form.
#[derive(Debug, Clone, PartialEq)]
pub enum FormValue {
    Text(String),
    File {
        data: Bytes,
        filename: Option<String>,
        content_type: Option<String>,
    },
}

/// Multipart form fields in insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FormData {
    fields: Vec<(String, FormValue)>,
}

impl FormData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields
            .push((name.into(), FormValue::Text(value.into())));
        self
    }

    pub fn file(
        mut self,
        name: impl Into<String>,
        data: impl Into<Bytes>,
        filename: Option<String>,
        content_type: Option<String>,
    ) -> Self {
        self.fields.push((
            name.into(),
            FormValue::File {
                data: data.into(),
                filename,
                content_type,
            },
        ));
        self
    }

    pub fn fields(&self) -> &[(String, FormValue)] {
        &self.fields
    }
}

/// Outgoing request body.
#[derive(Debug, Clone)]
pub enum Body {
    Text(String),
    Binary(Bytes),
    Blob {
        data: Bytes,
        content_type: Option<String>,
    },
    Form(FormData),
    Params(Params),
    Json(serde_json::Value),
}

impl Body {
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(Body::Json(serde_json::to_value(value)?))
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Body::Text(s)
    }
}

impl From<&str> for Body {
    fn from(s: &str) -> Self {
        Body::Text(s.to_string())
    }
}

impl From<Bytes> for Body {
    fn from(b: Bytes) -> Self {
        Body::Binary(b)
    }
}

impl From<Vec<u8>> for Body {
    fn from(b: Vec<u8>) -> Self {
        Body::Binary(Bytes::from(b))
    }
}

impl From<Params> for Body {
    fn from(p: Params) -> Self {
        Body::Params(p)
    }
}

impl From<FormData> for Body {
    fn from(f: FormData) -> Self {
        Body::Form(f)
    }
}

impl From<serde_json::Value> for Body {
    fn from(v: serde_json::Value) -> Self {
        Body::Json(v)
    }
}

/// Body in the shape a transport sends it.
#[derive(Debug, Clone, PartialEq)]
pub enum SerializedBody {
    Text(String),
    Bytes(Bytes),
    Form(FormData),
}

impl SerializedBody {
    /// Byte length, when known up front.
    pub fn len(&self) -> Option<u64> {
        match self {
            SerializedBody::Text(s) => Some(s.len() as u64),
            SerializedBody::Bytes(b) => Some(b.len() as u64),
            SerializedBody::Form(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            SerializedBody::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// Immutable description of one HTTP exchange.
///
/// Every transformation goes through [`Request::clone_with`], which re-derives
/// [`Request::url_with_params`].
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    url: String,
    body: Option<Body>,
    headers: Headers,
    params: Params,
    context: HttpContext,
    report_progress: bool,
    with_credentials: bool,
    credentials: Option<CredentialsMode>,
    keepalive: bool,
    cache: Option<CacheMode>,
    priority: Option<Priority>,
    mode: Option<RequestMode>,
    redirect: Option<RedirectPolicy>,
    referrer: Option<String>,
    referrer_policy: Option<String>,
    integrity: Option<String>,
    response_type: ResponseType,
    timeout: Option<Duration>,
    transfer_cache: TransferCacheMode,
    url_with_params: String,
}

fn join_url_and_params(url: &str, params: &Params) -> String {
    let query = params.to_string();
    if query.is_empty() {
        return url.to_string();
    }
    let sep = match url.find('?') {
        None => "?",
        Some(idx) if idx < url.len() - 1 => "&",
        Some(_) => "",
    };
    format!("{}{}{}", url, sep, query)
}

impl Request {
    /// Request with default options; use [`Request::builder`] for anything else.
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        RequestBuilder::new(method, url).assemble()
    }

    pub fn builder(method: Method, url: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(method, url)
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn url_with_params(&self) -> &str {
        &self.url_with_params
    }

    pub fn body(&self) -> Option<&Body> {
        self.body.as_ref()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn context(&self) -> &HttpContext {
        &self.context
    }

    pub fn report_progress(&self) -> bool {
        self.report_progress
    }

    pub fn with_credentials(&self) -> bool {
        self.with_credentials
    }

    pub fn credentials(&self) -> Option<CredentialsMode> {
        self.credentials
    }

    pub fn keepalive(&self) -> bool {
        self.keepalive
    }

    pub fn cache(&self) -> Option<CacheMode> {
        self.cache
    }

    pub fn priority(&self) -> Option<Priority> {
        self.priority
    }

    pub fn mode(&self) -> Option<RequestMode> {
        self.mode
    }

    pub fn redirect(&self) -> Option<RedirectPolicy> {
        self.redirect
    }

    pub fn referrer(&self) -> Option<&str> {
        self.referrer.as_deref()
    }

    pub fn referrer_policy(&self) -> Option<&str> {
        self.referrer_policy.as_deref()
    }

    pub fn integrity(&self) -> Option<&str> {
        self.integrity.as_deref()
    }

    pub fn response_type(&self) -> ResponseType {
        self.response_type
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn transfer_cache(&self) -> &TransferCacheMode {
        &self.transfer_cache
    }

    /// Body in transport form; `None` when there is no body.
    pub fn serialize_body(&self) -> Option<SerializedBody> {
        Some(match self.body.as_ref()? {
            Body::Text(s) => SerializedBody::Text(s.clone()),
            Body::Binary(b) => SerializedBody::Bytes(b.clone()),
            Body::Blob { data, .. } => SerializedBody::Bytes(data.clone()),
            Body::Form(form) => SerializedBody::Form(form.clone()),
            Body::Params(params) => SerializedBody::Text(params.to_string()),
            Body::Json(value) => SerializedBody::Text(serde_json::to_string(value).unwrap_or_default()),
        })
    }

    /// Content type implied by the body, used when the caller did not set one.
    /// Form data is left to the transport, which has to add the multipart boundary.
    pub fn detect_content_type(&self) -> Option<String> {
        match self.body.as_ref()? {
            Body::Text(_) => Some("text/plain".to_string()),
            Body::Binary(_) | Body::Form(_) => None,
            Body::Blob { content_type, .. } => content_type.clone().filter(|t| !t.is_empty()),
            Body::Params(_) => Some("application/x-www-form-urlencoded;charset=UTF-8".to_string()),
            Body::Json(_) => Some("application/json".to_string()),
        }
    }

    /// New request with `update` merged over this one.
    pub fn clone_with(&self, update: RequestUpdate) -> Request {
        let mut headers = update.headers.unwrap_or_else(|| self.headers.clone());
        for (name, value) in update.set_headers {
            headers = headers.set(name, value);
        }
        let mut params = update.params.unwrap_or_else(|| self.params.clone());
        for (name, value) in update.set_params {
            params = params.set(name, value);
        }

        RequestBuilder {
            method: update.method.unwrap_or_else(|| self.method.clone()),
            url: update.url.unwrap_or_else(|| self.url.clone()),
            body: update.body.unwrap_or_else(|| self.body.clone()),
            headers,
            params,
            context: update.context.unwrap_or_else(|| self.context.clone()),
            report_progress: update.report_progress.unwrap_or(self.report_progress),
            with_credentials: update.with_credentials.unwrap_or(self.with_credentials),
            credentials: update.credentials.unwrap_or(self.credentials),
            keepalive: update.keepalive.unwrap_or(self.keepalive),
            cache: update.cache.unwrap_or(self.cache),
            priority: update.priority.unwrap_or(self.priority),
            mode: update.mode.unwrap_or(self.mode),
            redirect: update.redirect.unwrap_or(self.redirect),
            referrer: update.referrer.unwrap_or_else(|| self.referrer.clone()),
            referrer_policy: update
                .referrer_policy
                .unwrap_or_else(|| self.referrer_policy.clone()),
            integrity: update.integrity.unwrap_or_else(|| self.integrity.clone()),
            response_type: update.response_type.unwrap_or(self.response_type),
            timeout: update.timeout.unwrap_or(self.timeout),
            transfer_cache: update
                .transfer_cache
                .unwrap_or_else(|| self.transfer_cache.clone()),
        }
        .assemble()
    }
}

/// Builder for [`Request`].
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    method: Method,
    url: String,
    body: Option<Body>,
    headers: Headers,
    params: Params,
    context: HttpContext,
    report_progress: bool,
    with_credentials: bool,
    credentials: Option<CredentialsMode>,
    keepalive: bool,
    cache: Option<CacheMode>,
    priority: Option<Priority>,
    mode: Option<RequestMode>,
    redirect: Option<RedirectPolicy>,
    referrer: Option<String>,
    referrer_policy: Option<String>,
    integrity: Option<String>,
    response_type: ResponseType,
    timeout: Option<Duration>,
    transfer_cache: TransferCacheMode,
}

impl RequestBuilder {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            body: None,
            headers: Headers::new(),
            params: Params::new(),
            context: HttpContext::new(),
            report_progress: false,
            with_credentials: false,
            credentials: None,
            keepalive: false,
            cache: None,
            priority: None,
            mode: None,
            redirect: None,
            referrer: None,
            referrer_policy: None,
            integrity: None,
            response_type: ResponseType::Json,
            timeout: None,
            transfer_cache: TransferCacheMode::Inherit,
        }
    }

    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers = self.headers.set(name.into(), value.into());
        self
    }

    pub fn params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    pub fn param(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.params = self.params.append(name, value);
        self
    }

    pub fn context(mut self, context: HttpContext) -> Self {
        self.context = context;
        self
    }

    pub fn report_progress(mut self, enable: bool) -> Self {
        self.report_progress = enable;
        self
    }

    pub fn with_credentials(mut self, enable: bool) -> Self {
        self.with_credentials = enable;
        self
    }

    pub fn credentials(mut self, mode: CredentialsMode) -> Self {
        self.credentials = Some(mode);
        self
    }

    pub fn keepalive(mut self, enable: bool) -> Self {
        self.keepalive = enable;
        self
    }

    pub fn cache(mut self, mode: CacheMode) -> Self {
        self.cache = Some(mode);
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn mode(mut self, mode: RequestMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn redirect(mut self, policy: RedirectPolicy) -> Self {
        self.redirect = Some(policy);
        self
    }

    pub fn referrer(mut self, referrer: impl Into<String>) -> Self {
        self.referrer = Some(referrer.into());
        self
    }

    pub fn referrer_policy(mut self, policy: impl Into<String>) -> Self {
        self.referrer_policy = Some(policy.into());
        self
    }

    pub fn integrity(mut self, integrity: impl Into<String>) -> Self {
        self.integrity = Some(integrity.into());
        self
    }

    pub fn response_type(mut self, response_type: ResponseType) -> Self {
        self.response_type = response_type;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn transfer_cache(mut self, mode: TransferCacheMode) -> Self {
        self.transfer_cache = mode;
        self
    }

    pub fn build(self) -> Result<Request> {
        if let Some(timeout) = self.timeout {
            check_timeout(timeout, "request_builder")?;
        }
        Ok(self.assemble())
    }

    fn assemble(self) -> Request {
        let url_with_params = join_url_and_params(&self.url, &self.params);
        Request {
            method: self.method,
            url: self.url,
            body: self.body,
            headers: self.headers,
            params: self.params,
            context: self.context,
            report_progress: self.report_progress,
            with_credentials: self.with_credentials,
            credentials: self.credentials,
            keepalive: self.keepalive,
            cache: self.cache,
            priority: self.priority,
            mode: self.mode,
            redirect: self.redirect,
            referrer: self.referrer,
            referrer_policy: self.referrer_policy,
            integrity: self.integrity,
            response_type: self.response_type,
            timeout: self.timeout,
            transfer_cache: self.transfer_cache,
            url_with_params,
        }
    }
}

fn check_timeout(timeout: Duration, source: &str) -> Result<()> {
    if timeout.is_zero() {
        return Err(Error::configuration_with_context(
            "timeout must be a positive duration",
            ErrorContext::new()
                .with_field_path("request.timeout")
                .with_source(source),
        ));
    }
    Ok(())
}

/// Partial request merged by [`Request::clone_with`]. Unset fields keep the original value.
#[derive(Debug, Clone, Default)]
pub struct RequestUpdate {
    pub method: Option<Method>,
    pub url: Option<String>,
    pub body: Option<Option<Body>>,
    pub headers: Option<Headers>,
    pub params: Option<Params>,
    pub context: Option<HttpContext>,
    pub report_progress: Option<bool>,
    pub with_credentials: Option<bool>,
    pub credentials: Option<Option<CredentialsMode>>,
    pub keepalive: Option<bool>,
    pub cache: Option<Option<CacheMode>>,
    pub priority: Option<Option<Priority>>,
    pub mode: Option<Option<RequestMode>>,
    pub redirect: Option<Option<RedirectPolicy>>,
    pub referrer: Option<Option<String>>,
    pub referrer_policy: Option<Option<String>>,
    pub integrity: Option<Option<String>>,
    pub response_type: Option<ResponseType>,
    pub timeout: Option<Option<Duration>>,
    pub transfer_cache: Option<TransferCacheMode>,
    /// Applied with `Headers::set` after `headers`.
    pub set_headers: Vec<(String, String)>,
    /// Applied with `Params::set` after `params`.
    pub set_params: Vec<(String, String)>,
}

impl RequestUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn body(mut self, body: Option<Body>) -> Self {
        self.body = Some(body);
        self
    }

    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers = Some(headers);
        self
    }

    pub fn set_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_headers.push((name.into(), value.into()));
        self
    }

    pub fn params(mut self, params: Params) -> Self {
        self.params = Some(params);
        self
    }

    pub fn set_param(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.set_params.push((name.into(), value.to_string()));
        self
    }

    pub fn context(mut self, context: HttpContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn report_progress(mut self, enable: bool) -> Self {
        self.report_progress = Some(enable);
        self
    }

    pub fn response_type(mut self, response_type: ResponseType) -> Self {
        self.response_type = Some(response_type);
        self
    }

    /// Replace the timeout. A zero duration is a configuration error.
    pub fn timeout(mut self, timeout: Duration) -> Result<Self> {
        check_timeout(timeout, "request_update")?;
        self.timeout = Some(Some(timeout));
        Ok(self)
    }

    pub fn clear_timeout(mut self) -> Self {
        self.timeout = Some(None);
        self
    }

    pub fn transfer_cache(mut self, mode: TransferCacheMode) -> Self {
        self.transfer_cache = Some(mode);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn url_with_params_picks_separator() {
        let params = Params::new().set("id", 1);
        let plain = Request::builder(Method::GET, "/api/items").params(params.clone()).build().unwrap();
        assert_eq!(plain.url_with_params(), "/api/items?id=1");

        let with_query = Request::builder(Method::GET, "/api/items?x=2").params(params.clone()).build().unwrap();
        assert_eq!(with_query.url_with_params(), "/api/items?x=2&id=1");

        let trailing = Request::builder(Method::GET, "/api/items?").params(params).build().unwrap();
        assert_eq!(trailing.url_with_params(), "/api/items?id=1");

        let none = Request::new(Method::GET, "/api/items");
        assert_eq!(none.url_with_params(), "/api/items");
    }

    #[test]
    fn empty_clone_preserves_everything() {
        let req = Request::builder(Method::GET, "/api/items")
            .param("page", 2)
            .header("X-Trace", "abc")
            .timeout(Duration::from_millis(50))
            .build()
            .unwrap();
        let copy = req.clone_with(RequestUpdate::new());
        assert_eq!(copy.url_with_params(), req.url_with_params());
        assert_eq!(copy.timeout(), req.timeout());
        assert_eq!(copy.headers().get("x-trace"), Some("abc"));
    }

    #[test]
    fn clone_with_method_changes_only_method() {
        let req = Request::builder(Method::GET, "/api/items")
            .param("id", 1)
            .header("Accept", "application/json")
            .build()
            .unwrap();
        let post = req.clone_with(RequestUpdate::new().method(Method::POST));
        assert_eq!(post.method(), &Method::POST);
        assert_eq!(post.url(), req.url());
        assert_eq!(post.url_with_params(), req.url_with_params());

        // headers/params of the clone evolve independently
        let tagged = post.clone_with(RequestUpdate::new().set_header("X-Extra", "1").set_param("id", 2));
        assert!(!req.headers().has("X-Extra"));
        assert!(!post.headers().has("X-Extra"));
        assert_eq!(req.params().get("id"), Some("1"));
        assert_eq!(tagged.url_with_params(), "/api/items?id=2");
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let err = Request::builder(Method::GET, "/x")
            .timeout(Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));

        let err = RequestUpdate::new().timeout(Duration::ZERO).unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[test]
    fn update_replaces_or_clears_timeout() {
        let req = Request::builder(Method::GET, "/x")
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        let longer = req.clone_with(RequestUpdate::new().timeout(Duration::from_secs(9)).unwrap());
        assert_eq!(longer.timeout(), Some(Duration::from_secs(9)));
        let cleared = req.clone_with(RequestUpdate::new().clear_timeout());
        assert_eq!(cleared.timeout(), None);
    }

    #[test]
    fn body_serialisation_and_content_type() {
        let json_req = Request::builder(Method::POST, "/x").body(json!({"a": 1})).build().unwrap();
        assert_eq!(json_req.serialize_body(), Some(SerializedBody::Text("{\"a\":1}".into())));
        assert_eq!(json_req.detect_content_type().as_deref(), Some("application/json"));

        let form = Request::builder(Method::POST, "/x")
            .body(Params::new().set("q", "a b"))
            .build()
            .unwrap();
        assert_eq!(form.serialize_body(), Some(SerializedBody::Text("q=a%20b".into())));
        assert_eq!(
            form.detect_content_type().as_deref(),
            Some("application/x-www-form-urlencoded;charset=UTF-8")
        );

        let blob = Request::builder(Method::PUT, "/x")
            .body(Body::Blob {
                data: Bytes::from_static(b"png"),
                content_type: Some("image/png".into()),
            })
            .build()
            .unwrap();
        assert_eq!(blob.detect_content_type().as_deref(), Some("image/png"));

        let multipart = Request::builder(Method::POST, "/x")
            .body(FormData::new().text("name", "v"))
            .build()
            .unwrap();
        assert!(multipart.detect_content_type().is_none());
        assert!(Request::new(Method::GET, "/x").serialize_body().is_none());
    }
}
