//! 客户端门面：构建请求并通过拦截器链执行。
//!
//! # Client
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`HttpClient`] | Runs requests through the interceptor chain; method shortcuts |
//! | [`HttpClientBuilder`] | Backend choice, interceptors, XSRF, transfer cache, platform |
//! | [`CallBuilder`] | Per-call request options and terminal operations |
//!
//! Implementation details are split into submodules under `src/client/`.

pub mod builder;
pub mod call;
pub mod core;

pub use builder::{BackendKind, HttpClientBuilder};
pub use call::CallBuilder;
pub use core::HttpClient;
