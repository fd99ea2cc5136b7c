//! The client facade: method shortcuts feeding requests through the interceptor chain.

use std::fmt;
use std::sync::Arc;

use reqwest::Method;
use tracing::debug;

use crate::cache::TransferCache;
use crate::client::builder::HttpClientBuilder;
use crate::client::call::CallBuilder;
use crate::interceptors::{InterceptorChain, PendingTasks, Platform};
use crate::transport::{EventStream, HttpHandler};
use crate::types::{Body, Request};
use crate::Result;

/// Entry point of the pipeline: builds requests and runs them through the interceptor chain.
///
/// Cloning is cheap; clones share the chain, the pending-task tracker and the transfer cache.
#[derive(Clone)]
pub struct HttpClient {
    pub(crate) chain: Arc<InterceptorChain>,
    pub(crate) pending: PendingTasks,
    pub(crate) transfer_cache: Option<Arc<TransferCache>>,
    pub(crate) platform: Platform,
}

impl HttpClient {
    /// Client with the default configuration (env overrides apply).
    pub fn new() -> Result<Self> {
        HttpClientBuilder::new().build()
    }

    pub fn builder() -> HttpClientBuilder {
        HttpClientBuilder::new()
    }

    /// Run `req` through the chain and observe every lifecycle event.
    pub fn request(&self, req: Request) -> EventStream {
        debug!(method = %req.method(), url = %req.url_with_params(), "dispatching request");
        self.chain.handle(req)
    }

    pub fn call(&self, method: Method, url: impl Into<String>) -> CallBuilder<'_> {
        CallBuilder::new(self, method, url)
    }

    pub fn get(&self, url: impl Into<String>) -> CallBuilder<'_> {
        self.call(Method::GET, url)
    }

    pub fn head(&self, url: impl Into<String>) -> CallBuilder<'_> {
        self.call(Method::HEAD, url)
    }

    pub fn delete(&self, url: impl Into<String>) -> CallBuilder<'_> {
        self.call(Method::DELETE, url)
    }

    pub fn options(&self, url: impl Into<String>) -> CallBuilder<'_> {
        self.call(Method::OPTIONS, url)
    }

    pub fn post(&self, url: impl Into<String>, body: impl Into<Body>) -> CallBuilder<'_> {
        self.call(Method::POST, url).body(body)
    }

    pub fn put(&self, url: impl Into<String>, body: impl Into<Body>) -> CallBuilder<'_> {
        self.call(Method::PUT, url).body(body)
    }

    pub fn patch(&self, url: impl Into<String>, body: impl Into<Body>) -> CallBuilder<'_> {
        self.call(Method::PATCH, url).body(body)
    }

    pub fn pending_tasks(&self) -> &PendingTasks {
        &self.pending
    }

    pub fn transfer_cache(&self) -> Option<&Arc<TransferCache>> {
        self.transfer_cache.as_ref()
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Wait until no request is in flight, then retire the transfer cache.
    pub async fn when_stable(&self) {
        self.pending.when_stable().await;
        if let Some(cache) = &self.transfer_cache {
            cache.retire();
        }
    }
}

impl fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpClient")
            .field("chain", &self.chain)
            .field("transfer_cache", &self.transfer_cache)
            .field("platform", &self.platform)
            .finish()
    }
}
