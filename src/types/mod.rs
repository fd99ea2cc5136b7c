//! 值模型模块：描述一次 HTTP 交换的不可变数据类型。
//!
//! # Types Module
//!
//! Immutable, copy-on-write descriptions of an HTTP exchange. Nothing in here performs
//! I/O; transports consume [`Request`]s and produce [`HttpEvent`]s.
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Headers`] | Case-insensitive multi-value headers with lazily applied updates |
//! | [`Params`] | Ordered multi-value query parameters with a pluggable [`ParameterCodec`] |
//! | [`HttpContext`] | Typed per-request metadata for interceptors |
//! | [`Request`] | Immutable request; derive new ones with [`Request::clone_with`] |
//! | [`HttpEvent`] | Lifecycle event of an exchange |
//! | [`Response`] / [`ErrorResponse`] | Terminal success / failure values |
//!
//! ## Example
//!
//! ```rust
//! use http_pipeline::types::{Params, Request, RequestUpdate};
//! use reqwest::Method;
//!
//! let req = Request::builder(Method::GET, "/api/items")
//!     .params(Params::new().set("id", 1))
//!     .build()?;
//! assert_eq!(req.url_with_params(), "/api/items?id=1");
//!
//! let post = req.clone_with(RequestUpdate::new().method(Method::POST));
//! assert_eq!(post.method(), &Method::POST);
//! assert_eq!(req.method(), &Method::GET);
//! # Ok::<(), http_pipeline::Error>(())
//! ```

pub mod context;
pub mod headers;
pub mod params;
pub mod request;
pub mod response;

pub use context::{ContextToken, HttpContext};
pub use headers::{Headers, IntoHeaderValues};
pub use params::{IntoParamValues, ParameterCodec, Params, ParamsOptions, UrlEncodingCodec};
pub use request::{
    Body, CacheMode, CredentialsMode, FormData, FormValue, Priority, RedirectPolicy, Request,
    RequestBuilder, RequestMode, RequestUpdate, ResponseType, SerializedBody, TransferCacheMode,
};
pub use response::{
    is_ok_status, ErrorPayload, ErrorResponse, HttpEvent, Response, ResponseBody, ResponseHead,
    HTTP_STATUS_NO_CONTENT, HTTP_STATUS_OK,
};
