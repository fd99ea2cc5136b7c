//! # http-pipeline
//!
//! 可拦截、可取消的异步 HTTP 客户端管线，支持服务端渲染响应的传输缓存回放。
//!
//! An interceptable, cancellable HTTP client pipeline. A declarative [`Request`] runs
//! through a chain of interceptors into a transport backend and comes back as a stream
//! of lifecycle events.
//!
//! ## Overview
//!
//! ```text
//! HttpClient -> Request -> interceptors -> XSRF -> transfer cache -> backend
//!                                   <- HttpEvent stream <-
//! ```
//!
//! - **Immutable values**: [`Headers`], [`Params`] and [`Request`] are copy-on-write;
//!   updates are queued and applied lazily on first read.
//! - **Lazy streams**: nothing is sent until the event stream is first polled, and dropping
//!   it aborts the exchange.
//! - **Two transports**: a streaming fetch-style backend and an event-based legacy backend,
//!   both backed by `reqwest` in production.
//! - **Transfer cache**: responses recorded during server rendering are replayed by the
//!   client instead of being fetched again.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use http_pipeline::HttpClient;
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct Item {
//!     id: u32,
//! }
//!
//! #[tokio::main]
//! async fn main() -> http_pipeline::Result<()> {
//!     let client = HttpClient::builder()
//!         .base_url("https://api.example.com")
//!         .build()?;
//!
//!     let item: Item = client.get("/api/items").param("id", 1).json().await?;
//!     println!("item {}", item.id);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`types`] | Value model: headers, params, context, request, events, responses |
//! | [`transport`] | Backends and the reqwest-backed transport |
//! | [`interceptors`] | Interceptor chain, pending-task tracking, XSRF protection |
//! | [`cache`] | Transfer cache interceptor and its serializable store |
//! | [`client`] | `HttpClient` facade and builders |
//! | [`utils`] | Percent-encoding helpers |

pub mod cache;
pub mod client;
pub mod interceptors;
pub mod transport;
pub mod types;
pub mod utils;

// Re-export main types for convenience
pub use cache::{TransferCache, TransferCacheOptions, TransferState};
pub use client::{BackendKind, CallBuilder, HttpClient, HttpClientBuilder};
pub use interceptors::{Interceptor, InterceptorChain, PendingTasks, Platform};
pub use transport::{EventStream, HttpHandler, TransportError};
pub use types::{
    Body, ErrorResponse, Headers, HttpContext, HttpEvent, Params, Request, RequestUpdate,
    Response, ResponseBody, ResponseType,
};

use futures::Stream;
use std::pin::Pin;

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// A unified pinned, boxed stream that emits `Result<T>`
pub type BoxStream<'a, T> = Pin<Box<dyn Stream<Item = Result<T>> + Send + 'a>>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext};
