//! Transfer-cache key generation.

use serde::{Deserialize, Serialize};

use crate::types::{Body, Params, Request};

/// Store key of a request: a decimal 32-bit hash plus the fingerprint it was derived from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub hash: String,
    pub fingerprint: String,
}

impl CacheKey {
    /// Key of `req` as addressed by `url` (the request URL after origin remapping).
    pub fn for_request(req: &Request, url: &str) -> Self {
        let fingerprint = fingerprint(req, url);
        Self { hash: hash_fingerprint(&fingerprint), fingerprint }
    }

    pub fn as_str(&self) -> &str { &self.hash }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "{}", self.hash) }
}

/// `key=v1,v2` pairs with keys sorted, joined by `&`. Values are not encoded.
pub fn sort_and_concat_params(params: &Params) -> String {
    let mut keys = params.keys();
    keys.sort_unstable();
    keys.dedup();
    keys.iter()
        .map(|k| format!("{}={}", k, params.get_all(k).map(|v| v.join(",")).unwrap_or_default()))
        .collect::<Vec<_>>()
        .join("&")
}

/// `method|responseType|url|body|params`. Only textual bodies take part.
pub fn fingerprint(req: &Request, url: &str) -> String {
    let body = match req.body() {
        Some(Body::Params(params)) => sort_and_concat_params(params),
        Some(Body::Text(_)) | Some(Body::Json(_)) => req
            .serialize_body()
            .and_then(|b| b.as_text().map(str::to_string))
            .unwrap_or_default(),
        _ => String::new(),
    };
    [
        req.method().as_str(),
        req.response_type().as_str(),
        url,
        &body,
        &sort_and_concat_params(req.params()),
    ]
    .join("|")
}

/// 31-multiplier string hash over the first UTF-16 unit of every character, wrapped to
/// 32 bits and shifted into the unsigned range.
pub fn hash_fingerprint(value: &str) -> String {
    let mut hash: i32 = 0;
    let mut units = [0u16; 2];
    for c in value.chars() {
        let unit = c.encode_utf16(&mut units)[0];
        hash = hash.wrapping_mul(31).wrapping_add(i32::from(unit));
    }
    (i64::from(hash) + (1i64 << 31)).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Method;
    use serde_json::json;

    fn key(req: &Request) -> String { CacheKey::for_request(req, req.url()).hash }

    #[test]
    fn hash_is_stable_and_unsigned() {
        assert_eq!(hash_fingerprint(""), "2147483648");
        assert_eq!(hash_fingerprint("a"), (97i64 + (1i64 << 31)).to_string());
        let long = "GET|json|/api/items|||".repeat(40);
        let parsed: i64 = hash_fingerprint(&long).parse().unwrap();
        assert!((0..=u32::MAX as i64).contains(&parsed));
        assert_eq!(hash_fingerprint(&long), hash_fingerprint(&long.clone()));
    }

    #[test]
    fn param_order_does_not_matter() {
        let a = Request::builder(Method::GET, "/api/items")
            .params(Params::new().set("b", 2).set("a", 1))
            .build()
            .unwrap();
        let b = Request::builder(Method::GET, "/api/items")
            .params(Params::from_query("a=1&b=2"))
            .build()
            .unwrap();
        assert_eq!(key(&a), key(&b));
        assert_eq!(fingerprint(&a, a.url()), "GET|json|/api/items||a=1&b=2");
    }

    #[test]
    fn every_input_changes_the_key() {
        let base = Request::builder(Method::POST, "/api/items")
            .param("id", 1)
            .body(json!({"q": 1}))
            .build()
            .unwrap();
        let variants = [
            Request::builder(Method::PUT, "/api/items").param("id", 1).body(json!({"q": 1})).build().unwrap(),
            Request::builder(Method::POST, "/api/other").param("id", 1).body(json!({"q": 1})).build().unwrap(),
            Request::builder(Method::POST, "/api/items").param("id", 2).body(json!({"q": 1})).build().unwrap(),
            Request::builder(Method::POST, "/api/items").param("id", 1).body(json!({"q": 2})).build().unwrap(),
        ];
        for variant in &variants {
            assert_ne!(key(&base), key(variant));
        }
    }

    #[test]
    fn params_bodies_are_sorted() {
        let a = Request::builder(Method::POST, "/f").body(Params::new().set("z", 1).set("a", 2)).build().unwrap();
        let b = Request::builder(Method::POST, "/f").body(Params::new().set("a", 2).set("z", 1)).build().unwrap();
        assert_eq!(key(&a), key(&b));
    }
}
