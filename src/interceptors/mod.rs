//! 拦截器模块：把拦截器函数与后端组合成一条请求管线。
//!
//! # Interceptors
//!
//! Interceptors wrap the next stage of request handling. They can rewrite the request on
//! the way in and transform or replace the events on the way out.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`Interceptor`] | A functional `(request, next)` interceptor or a legacy [`HttpInterceptor`] object |
//! | [`InterceptorChain`] | The composed pipeline in front of a backend, itself an [`HttpHandler`] |
//! | [`PendingTasks`] | In-flight request counter used to detect an idle application |
//! | [`XsrfInterceptor`] | Copies the XSRF cookie into a request header for same-origin mutations |
//!
//! The first interceptor in the list is the outermost: it sees the request first and the
//! response last.
//!
//! ```rust
//! use std::sync::Arc;
//! use http_pipeline::interceptors::{Interceptor, InterceptorChain, PendingTasks};
//! use http_pipeline::transport::{EventStream, HttpHandler};
//! use http_pipeline::types::{Request, RequestUpdate};
//!
//! let tag = Interceptor::from_fn(|req: Request, next| {
//!     next(req.clone_with(RequestUpdate::new().set_header("X-Trace", "1")))
//! });
//! let backend: Arc<dyn HttpHandler> =
//!     Arc::new(|_req: Request| -> EventStream { Box::pin(futures::stream::empty()) });
//! let chain = InterceptorChain::new(backend, vec![tag], PendingTasks::new());
//! assert_eq!(chain.len(), 1);
//! ```

pub mod pending;
pub mod xsrf;

pub use pending::{PendingTask, PendingTasks};
pub use xsrf::{
    parse_cookie_value, CookieJar, CookieSource, XsrfConfig, XsrfInterceptor, XsrfTokenExtractor,
    DEFAULT_XSRF_COOKIE_NAME, DEFAULT_XSRF_HEADER_NAME,
};

use std::collections::HashSet;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use serde::Deserialize;

use crate::transport::{EventStream, HttpHandler};
use crate::types::{HttpEvent, Request};
use crate::Result;

/// Where the pipeline runs. Server-side rendering records transfer-cache entries and
/// never reads browser cookies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    #[default]
    Browser,
    Server,
}

/// Continuation handed to an interceptor: runs the rest of the chain.
pub type NextFn = Arc<dyn Fn(Request) -> EventStream + Send + Sync>;

/// Functional interceptor shape.
pub type InterceptorFn = Arc<dyn Fn(Request, NextFn) -> EventStream + Send + Sync>;

/// Legacy object-shaped interceptor. `next` is the rest of the chain as a handler.
pub trait HttpInterceptor: Send + Sync {
    fn intercept(&self, req: Request, next: Arc<dyn HttpHandler>) -> EventStream;
}

/// One entry of an interceptor list.
#[derive(Clone)]
pub enum Interceptor {
    Fn(InterceptorFn),
    Legacy(Arc<dyn HttpInterceptor>),
}

impl Interceptor {
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(Request, NextFn) -> EventStream + Send + Sync + 'static,
    {
        Interceptor::Fn(Arc::new(f))
    }

    pub fn legacy(interceptor: impl HttpInterceptor + 'static) -> Self {
        Interceptor::Legacy(Arc::new(interceptor))
    }

    /// Identity of the shared instance, used for de-duplication.
    fn identity(&self) -> *const () {
        match self {
            Interceptor::Fn(f) => Arc::as_ptr(f) as *const (),
            Interceptor::Legacy(i) => Arc::as_ptr(i) as *const (),
        }
    }

    pub fn intercept(&self, req: Request, next: NextFn) -> EventStream {
        match self {
            Interceptor::Fn(f) => f(req, next),
            Interceptor::Legacy(interceptor) => {
                interceptor.intercept(req, Arc::new(NextHandler(next)))
            }
        }
    }
}

impl From<InterceptorFn> for Interceptor {
    fn from(f: InterceptorFn) -> Self {
        Interceptor::Fn(f)
    }
}

impl From<Arc<dyn HttpInterceptor>> for Interceptor {
    fn from(i: Arc<dyn HttpInterceptor>) -> Self {
        Interceptor::Legacy(i)
    }
}

impl fmt::Debug for Interceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interceptor::Fn(_) => write!(f, "Interceptor::Fn({:p})", self.identity()),
            Interceptor::Legacy(_) => write!(f, "Interceptor::Legacy({:p})", self.identity()),
        }
    }
}

/// Presents a [`NextFn`] as the handler object legacy interceptors expect.
struct NextHandler(NextFn);

impl HttpHandler for NextHandler {
    fn handle(&self, req: Request) -> EventStream {
        (self.0)(req)
    }
}

/// Composed interceptors: `(request, final_handler) -> EventStream`.
type ChainFn = Arc<dyn Fn(Request, NextFn) -> EventStream + Send + Sync>;

/// Fold right-to-left so that the first interceptor ends up outermost.
fn compose(interceptors: &[Interceptor]) -> ChainFn {
    let end: ChainFn = Arc::new(|req: Request, final_handler: NextFn| final_handler(req));
    interceptors.iter().rev().fold(end, |tail, interceptor| {
        let interceptor = interceptor.clone();
        let chained: ChainFn = Arc::new(move |req: Request, final_handler: NextFn| {
            let tail = tail.clone();
            let next: NextFn =
                Arc::new(move |downstream: Request| tail(downstream, final_handler.clone()));
            interceptor.intercept(req, next)
        });
        chained
    })
}

/// Keep the first occurrence of every interceptor instance.
fn dedupe(interceptors: impl IntoIterator<Item = Interceptor>) -> Vec<Interceptor> {
    let mut seen = HashSet::new();
    interceptors
        .into_iter()
        .filter(|i| seen.insert(i.identity() as usize))
        .collect()
}

/// Interceptors composed once in front of a backend.
pub struct InterceptorChain {
    interceptors: Vec<Interceptor>,
    chain: ChainFn,
    backend: NextFn,
    pending: PendingTasks,
}

impl InterceptorChain {
    pub fn new(
        backend: Arc<dyn HttpHandler>,
        interceptors: impl IntoIterator<Item = Interceptor>,
        pending: PendingTasks,
    ) -> Self {
        let interceptors = dedupe(interceptors);
        let chain = compose(&interceptors);
        let backend: NextFn = Arc::new(move |req: Request| backend.handle(req));
        Self {
            interceptors,
            chain,
            backend,
            pending,
        }
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub fn pending_tasks(&self) -> &PendingTasks {
        &self.pending
    }
}

impl fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptorChain")
            .field("interceptors", &self.interceptors)
            .field("pending", &self.pending)
            .finish()
    }
}

impl HttpHandler for InterceptorChain {
    fn handle(&self, req: Request) -> EventStream {
        let task = self.pending.add();
        let events = (self.chain)(req, self.backend.clone());
        Box::pin(Tracked {
            events,
            task: Some(task),
        })
    }
}

/// Holds a pending task until the stream completes, errors or is dropped.
struct Tracked {
    events: EventStream,
    task: Option<PendingTask>,
}

impl Stream for Tracked {
    type Item = Result<HttpEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let polled = self.events.as_mut().poll_next(cx);
        if matches!(polled, Poll::Ready(None) | Poll::Ready(Some(Err(_)))) {
            self.task.take();
        }
        polled
    }
}
