//! XSRF protection: mirror the token cookie into a request header.
//!
//! The header is added only to mutating requests aimed at the application's own origin,
//! so the token never leaks to third parties.

use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use serde::Deserialize;
use tracing::debug;

use super::{Interceptor, NextFn, Platform};
use crate::transport::EventStream;
use crate::types::{Request, RequestUpdate};
use crate::utils::percent::{decode_component, encode_component};

pub const DEFAULT_XSRF_COOKIE_NAME: &str = "XSRF-TOKEN";
pub const DEFAULT_XSRF_HEADER_NAME: &str = "X-XSRF-TOKEN";

/// Source of the raw `name=value; name2=value2` cookie string.
pub trait CookieSource: Send + Sync {
    fn cookie_string(&self) -> String;
}

/// In-memory cookie string that can be replaced at any time.
#[derive(Debug, Clone, Default)]
pub struct CookieJar {
    cookies: Arc<RwLock<String>>,
}

impl CookieJar {
    pub fn new(cookies: impl Into<String>) -> Self {
        Self {
            cookies: Arc::new(RwLock::new(cookies.into())),
        }
    }

    pub fn set(&self, cookies: impl Into<String>) {
        if let Ok(mut current) = self.cookies.write() {
            *current = cookies.into();
        }
    }
}

impl CookieSource for CookieJar {
    fn cookie_string(&self) -> String {
        self.cookies
            .read()
            .map(|c| c.clone())
            .unwrap_or_default()
    }
}

/// Cookie and header names used for XSRF protection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct XsrfConfig {
    pub cookie_name: String,
    pub header_name: String,
}

impl Default for XsrfConfig {
    fn default() -> Self {
        Self {
            cookie_name: DEFAULT_XSRF_COOKIE_NAME.to_string(),
            header_name: DEFAULT_XSRF_HEADER_NAME.to_string(),
        }
    }
}

/// Value of cookie `name` in `cookies`, percent-decoded. `+` stays a literal plus.
pub fn parse_cookie_value(cookies: &str, name: &str) -> Option<String> {
    let name = encode_component(name);
    cookies.split(';').find_map(|cookie| {
        let (cookie_name, value) = cookie.split_once('=').unwrap_or((cookie, ""));
        (cookie_name.trim() == name).then(|| decode_component(value))
    })
}

#[derive(Debug, Default)]
struct ExtractorCache {
    last_cookies: Option<String>,
    last_token: Option<String>,
    parse_count: usize,
}

/// Reads the XSRF token, re-parsing only when the cookie string changed.
pub struct XsrfTokenExtractor {
    source: Arc<dyn CookieSource>,
    cookie_name: String,
    platform: Platform,
    cache: Mutex<ExtractorCache>,
}

impl XsrfTokenExtractor {
    pub fn new(source: Arc<dyn CookieSource>, cookie_name: impl Into<String>, platform: Platform) -> Self {
        Self {
            source,
            cookie_name: cookie_name.into(),
            platform,
            cache: Mutex::new(ExtractorCache::default()),
        }
    }

    pub fn token(&self) -> Option<String> {
        if self.platform == Platform::Server {
            return None;
        }
        let cookies = self.source.cookie_string();
        let Ok(mut cache) = self.cache.lock() else {
            return parse_cookie_value(&cookies, &self.cookie_name);
        };
        if cache.last_cookies.as_deref() != Some(cookies.as_str()) {
            cache.parse_count += 1;
            cache.last_token = parse_cookie_value(&cookies, &self.cookie_name);
            cache.last_cookies = Some(cookies);
        }
        cache.last_token.clone()
    }

    /// How often the cookie string has been parsed.
    pub fn parse_count(&self) -> usize {
        self.cache.lock().map(|c| c.parse_count).unwrap_or(0)
    }
}

impl fmt::Debug for XsrfTokenExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XsrfTokenExtractor")
            .field("cookie_name", &self.cookie_name)
            .field("platform", &self.platform)
            .finish()
    }
}

#[derive(Debug)]
pub struct XsrfInterceptor {
    extractor: XsrfTokenExtractor,
    header_name: String,
    enabled: bool,
}

impl XsrfInterceptor {
    pub fn new(source: Arc<dyn CookieSource>, config: XsrfConfig, platform: Platform) -> Self {
        Self {
            extractor: XsrfTokenExtractor::new(source, config.cookie_name, platform),
            header_name: config.header_name,
            enabled: true,
        }
    }

    /// An interceptor that forwards every request untouched.
    pub fn disabled(source: Arc<dyn CookieSource>) -> Self {
        Self {
            enabled: false,
            ..Self::new(source, XsrfConfig::default(), Platform::Browser)
        }
    }

    pub fn extractor(&self) -> &XsrfTokenExtractor {
        &self.extractor
    }

    /// Request as it should be forwarded.
    pub fn prepare(&self, req: Request) -> Request {
        let url = req.url().to_ascii_lowercase();
        if !self.enabled
            || matches!(req.method().as_str(), "GET" | "HEAD")
            || url.starts_with("http://")
            || url.starts_with("https://")
        {
            return req;
        }
        match self.extractor.token() {
            Some(token) if !req.headers().has(&self.header_name) => {
                debug!(url = %req.url(), header = %self.header_name, "attaching xsrf token");
                req.clone_with(RequestUpdate::new().set_header(self.header_name.clone(), token))
            }
            _ => req,
        }
    }

    pub fn intercept(&self, req: Request, next: NextFn) -> EventStream {
        next(self.prepare(req))
    }

    pub fn into_interceptor(self: Arc<Self>) -> Interceptor {
        Interceptor::from_fn(move |req, next| self.intercept(req, next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Method;

    fn interceptor(cookies: &str) -> (CookieJar, XsrfInterceptor) {
        let jar = CookieJar::new(cookies);
        let xsrf = XsrfInterceptor::new(Arc::new(jar.clone()), XsrfConfig::default(), Platform::Browser);
        (jar, xsrf)
    }

    #[test]
    fn cookie_values_are_decoded() {
        assert_eq!(
            parse_cookie_value("a=1; XSRF-TOKEN=abc%3D%3D; b=2", "XSRF-TOKEN").as_deref(),
            Some("abc==")
        );
        assert_eq!(parse_cookie_value("t=a+b", "t").as_deref(), Some("a+b"));
        assert_eq!(parse_cookie_value("flag", "flag").as_deref(), Some(""));
        assert_eq!(parse_cookie_value("xsrf-token=1", "XSRF-TOKEN"), None);
        assert_eq!(parse_cookie_value("my%20name=v", "my name").as_deref(), Some("v"));
    }

    #[test]
    fn header_only_on_same_origin_mutations() {
        let (_jar, xsrf) = interceptor("XSRF-TOKEN=secret");

        let get = xsrf.prepare(Request::new(Method::GET, "/api/items"));
        assert!(!get.headers().has("X-XSRF-TOKEN"));
        let head = xsrf.prepare(Request::new(Method::HEAD, "/api/items"));
        assert!(!head.headers().has("X-XSRF-TOKEN"));

        let post = xsrf.prepare(Request::new(Method::POST, "/api/items"));
        assert_eq!(post.headers().get("X-XSRF-TOKEN"), Some("secret"));

        let absolute = xsrf.prepare(Request::new(Method::POST, "HTTPS://other.example/api"));
        assert!(!absolute.headers().has("X-XSRF-TOKEN"));
    }

    #[test]
    fn existing_header_is_kept() {
        let (_jar, xsrf) = interceptor("XSRF-TOKEN=secret");
        let req = Request::builder(Method::PUT, "/api/items/1")
            .header("x-xsrf-token", "mine")
            .build()
            .unwrap();
        assert_eq!(xsrf.prepare(req).headers().get("X-XSRF-TOKEN"), Some("mine"));
    }

    #[test]
    fn no_cookie_no_header() {
        let (_jar, xsrf) = interceptor("other=1");
        let post = xsrf.prepare(Request::new(Method::POST, "/api/items"));
        assert!(!post.headers().has("X-XSRF-TOKEN"));
    }

    #[test]
    fn extractor_reparses_only_on_change() {
        let (jar, xsrf) = interceptor("XSRF-TOKEN=one");
        let extractor = xsrf.extractor();
        assert_eq!(extractor.token().as_deref(), Some("one"));
        assert_eq!(extractor.token().as_deref(), Some("one"));
        assert_eq!(extractor.parse_count(), 1);

        jar.set("XSRF-TOKEN=two");
        assert_eq!(extractor.token().as_deref(), Some("two"));
        assert_eq!(extractor.parse_count(), 2);
    }

    #[test]
    fn disabled_or_server_never_attaches() {
        let jar = CookieJar::new("XSRF-TOKEN=secret");
        let disabled = XsrfInterceptor::disabled(Arc::new(jar.clone()));
        assert!(!disabled
            .prepare(Request::new(Method::POST, "/x"))
            .headers()
            .has("X-XSRF-TOKEN"));

        let server = XsrfInterceptor::new(Arc::new(jar), XsrfConfig::default(), Platform::Server);
        assert!(server.extractor().token().is_none());
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: XsrfConfig = serde_json::from_str(r#"{"header_name": "X-CSRF"}"#).unwrap();
        assert_eq!(config.cookie_name, DEFAULT_XSRF_COOKIE_NAME);
        assert_eq!(config.header_name, "X-CSRF");
    }
}
