//! 传输缓存模块：在服务端记录响应，在客户端回放以避免重复请求。
//!
//! # Transfer Cache
//!
//! During server-side rendering every eligible response is recorded into a
//! [`TransferState`] that is serialized into the rendered page. The client builds its
//! pipeline over the same state and replays matching requests without touching the
//! network until the application first becomes idle.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`TransferCache`] | The interceptor: eligibility, lookup, recording and retirement |
//! | [`TransferCacheOptions`] | Header allow-list, POST/auth opt-ins, filter and origin map |
//! | [`TransferState`] | Shared key/value store with JSON import and export |
//! | [`TransferEntry`] | One recorded response (`b`, `h`, `s`, `st`, `u`, `rt`, `ct`) |
//! | [`CacheKey`] | Request fingerprint and its 32-bit hash |
//!
//! ## Example
//!
//! ```rust
//! use http_pipeline::cache::{TransferCache, TransferCacheOptions, TransferState};
//! use http_pipeline::interceptors::Platform;
//! use http_pipeline::types::Request;
//! use reqwest::Method;
//!
//! let cache = TransferCache::new(
//!     TransferState::new(),
//!     TransferCacheOptions::new().with_include_headers(["etag"]),
//!     Platform::Server,
//! )?;
//! assert!(cache.is_eligible(&Request::new(Method::GET, "/api/items")));
//! assert!(!cache.is_eligible(&Request::new(Method::DELETE, "/api/items")));
//! # Ok::<(), http_pipeline::Error>(())
//! ```
//!
//! ## Cache Key Generation
//!
//! Keys are derived from the method, response type, URL (after origin remapping),
//! textual body and sorted query parameters, so requests built along different code
//! paths share an entry.
//!
//! ## Retirement
//!
//! A cache installed through `HttpClientBuilder` retires the first time the client has no
//! request in flight. After that it neither replays nor records.

mod interceptor;
mod key;
mod state;

pub use interceptor::{RequestFilter, TransferCache, TransferCacheOptions, TransferCacheStats};
pub use key::{fingerprint, hash_fingerprint, sort_and_concat_params, CacheKey};
pub use state::{TransferEntry, TransferState};
