//! Client construction: backend selection, interceptor order and env overrides.

use std::str::FromStr;
use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use crate::cache::{TransferCache, TransferCacheOptions, TransferState};
use crate::client::core::HttpClient;
use crate::interceptors::{
    CookieJar, CookieSource, HttpInterceptor, Interceptor, InterceptorChain, PendingTasks,
    Platform, XsrfConfig, XsrfInterceptor,
};
use crate::transport::{
    EventStream, Fetch, FetchBackend, HttpHandler, HttpTransport, XhrBackend, XhrFactory,
};
use crate::types::Request;
use crate::{Error, ErrorContext, Result};

/// Which transport a client uses when no custom backend is given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Streaming fetch-style transport.
    #[default]
    Fetch,
    /// Event-based transport.
    Legacy,
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fetch" => Ok(BackendKind::Fetch),
            "legacy" | "xhr" => Ok(BackendKind::Legacy),
            other => Err(Error::configuration_with_context(
                format!("unknown backend '{}'", other),
                ErrorContext::new().with_field_path("HTTP_PIPELINE_BACKEND"),
            )),
        }
    }
}

/// Builder for [`HttpClient`].
///
/// Defaults can also be set via env:
/// - `HTTP_PIPELINE_BACKEND` (`fetch` or `legacy`)
/// - `HTTP_PIPELINE_BASE_URL`
pub struct HttpClientBuilder {
    backend_kind: Option<BackendKind>,
    backend: Option<Arc<dyn HttpHandler>>,
    fetch: Option<Arc<dyn Fetch>>,
    xhr_factory: Option<Arc<dyn XhrFactory>>,
    interceptors: Vec<Interceptor>,
    root_interceptors: Vec<Interceptor>,
    xsrf: Option<XsrfConfig>,
    xsrf_disabled: bool,
    cookies: Option<Arc<dyn CookieSource>>,
    transfer_cache: Option<TransferCacheOptions>,
    transfer_state: Option<TransferState>,
    platform: Platform,
    base_url: Option<String>,
    pending: Option<PendingTasks>,
}

impl HttpClientBuilder {
    pub fn new() -> Self {
        Self {
            backend_kind: None,
            backend: None,
            fetch: None,
            xhr_factory: None,
            interceptors: Vec::new(),
            root_interceptors: Vec::new(),
            xsrf: None,
            xsrf_disabled: false,
            cookies: None,
            transfer_cache: None,
            transfer_state: None,
            platform: Platform::Browser,
            base_url: None,
            pending: None,
        }
    }

    pub fn backend_kind(mut self, kind: BackendKind) -> Self {
        self.backend_kind = Some(kind);
        self
    }

    /// Use `backend` as-is instead of building a transport.
    pub fn backend(mut self, backend: Arc<dyn HttpHandler>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Drive the streaming transport with a custom [`Fetch`].
    pub fn fetch(mut self, fetch: Arc<dyn Fetch>) -> Self {
        self.fetch = Some(fetch);
        self.backend_kind.get_or_insert(BackendKind::Fetch);
        self
    }

    /// Drive the event-based transport with a custom [`XhrFactory`].
    pub fn xhr_factory(mut self, factory: Arc<dyn XhrFactory>) -> Self {
        self.xhr_factory = Some(factory);
        self.backend_kind.get_or_insert(BackendKind::Legacy);
        self
    }

    pub fn interceptor(mut self, interceptor: impl Into<Interceptor>) -> Self {
        self.interceptors.push(interceptor.into());
        self
    }

    pub fn interceptor_fn<F>(self, f: F) -> Self
    where
        F: Fn(Request, crate::interceptors::NextFn) -> EventStream + Send + Sync + 'static,
    {
        self.interceptor(Interceptor::from_fn(f))
    }

    pub fn legacy_interceptor(self, interceptor: impl HttpInterceptor + 'static) -> Self {
        self.interceptor(Interceptor::legacy(interceptor))
    }

    /// Interceptor registered at the application root. Runs after the XSRF interceptor;
    /// an instance also passed to [`interceptor`](Self::interceptor) runs only once.
    pub fn root_interceptor(mut self, interceptor: impl Into<Interceptor>) -> Self {
        self.root_interceptors.push(interceptor.into());
        self
    }

    pub fn xsrf(mut self, config: XsrfConfig) -> Self {
        self.xsrf = Some(config);
        self
    }

    pub fn disable_xsrf(mut self) -> Self {
        self.xsrf_disabled = true;
        self
    }

    pub fn cookies(mut self, source: Arc<dyn CookieSource>) -> Self {
        self.cookies = Some(source);
        self
    }

    pub fn transfer_cache(mut self, options: TransferCacheOptions) -> Self {
        self.transfer_cache = Some(options);
        self
    }

    /// Store shared with the transfer cache, e.g. one parsed from the rendered page.
    pub fn transfer_state(mut self, state: TransferState) -> Self {
        self.transfer_state = Some(state);
        self
    }

    pub fn platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    /// Base URL relative request URLs are resolved against by the built-in transport.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn pending_tasks(mut self, pending: PendingTasks) -> Self {
        self.pending = Some(pending);
        self
    }

    pub fn build(self) -> Result<HttpClient> {
        if self.xsrf_disabled && self.xsrf.is_some() {
            return Err(Error::configuration(
                "XSRF protection cannot be both configured and disabled",
            ));
        }

        let backend_kind = match self.backend_kind {
            Some(kind) => kind,
            None => match std::env::var("HTTP_PIPELINE_BACKEND") {
                Ok(value) => value.parse()?,
                Err(_) => BackendKind::default(),
            },
        };
        let base_url = self
            .base_url
            .or_else(|| std::env::var("HTTP_PIPELINE_BASE_URL").ok())
            .filter(|s| !s.trim().is_empty());

        let backend: Arc<dyn HttpHandler> = match (self.backend, backend_kind) {
            (Some(backend), _) => backend,
            (None, BackendKind::Fetch) => {
                let fetch = match self.fetch {
                    Some(fetch) => fetch,
                    None => Arc::new(HttpTransport::new(base_url.as_deref())?),
                };
                Arc::new(FetchBackend::new(fetch))
            }
            (None, BackendKind::Legacy) => {
                let factory = match self.xhr_factory {
                    Some(factory) => factory,
                    None => Arc::new(HttpTransport::new(base_url.as_deref())?).xhr_factory(),
                };
                Arc::new(XhrBackend::new(factory))
            }
        };

        let mut interceptors = self.interceptors;
        if !self.xsrf_disabled {
            let cookies = self
                .cookies
                .unwrap_or_else(|| Arc::new(CookieJar::default()));
            let xsrf = XsrfInterceptor::new(cookies, self.xsrf.unwrap_or_default(), self.platform);
            interceptors.push(Arc::new(xsrf).into_interceptor());
        }
        interceptors.extend(self.root_interceptors);

        let pending = self.pending.unwrap_or_default();
        let transfer_cache = match self.transfer_cache {
            Some(options) => {
                let state = self.transfer_state.unwrap_or_default();
                let cache = Arc::new(TransferCache::new(state, options, self.platform)?);
                cache.retire_on_idle(&pending);
                interceptors.push(cache.clone().into_interceptor());
                Some(cache)
            }
            None => None,
        };

        let chain = InterceptorChain::new(backend, interceptors, pending.clone());
        debug!(
            backend = ?backend_kind,
            interceptors = chain.len(),
            platform = ?self.platform,
            transfer_cache = transfer_cache.is_some(),
            "http client built"
        );

        Ok(HttpClient {
            chain: Arc::new(chain),
            pending,
            transfer_cache,
            platform: self.platform,
        })
    }
}

impl Default for HttpClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
