//! Per-request typed metadata that travels with a [`Request`](super::Request) through
//! the interceptor chain without ever reaching the wire.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Typed key into an [`HttpContext`]. Token names must be unique within a process.
///
/// ```rust
/// use http_pipeline::types::{ContextToken, HttpContext};
///
/// static RETRIES: ContextToken<u32> = ContextToken::new("retries", || 0);
///
/// let ctx = HttpContext::new().set(&RETRIES, 3);
/// assert_eq!(ctx.get(&RETRIES), 3);
/// assert_eq!(HttpContext::new().get(&RETRIES), 0);
/// ```
pub struct ContextToken<T> {
    name: &'static str,
    default: fn() -> T,
}

impl<T> ContextToken<T> {
    pub const fn new(name: &'static str, default: fn() -> T) -> Self {
        Self { name, default }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Copy-on-write map of context tokens to values.
#[derive(Clone, Default)]
pub struct HttpContext {
    values: Arc<HashMap<&'static str, Arc<dyn Any + Send + Sync>>>,
}

impl HttpContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// The stored value, or the token's default.
    pub fn get<T: Clone + Send + Sync + 'static>(&self, token: &ContextToken<T>) -> T {
        self.values
            .get(token.name)
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
            .unwrap_or_else(token.default)
    }

    pub fn set<T: Send + Sync + 'static>(&self, token: &ContextToken<T>, value: T) -> Self {
        let mut values = (*self.values).clone();
        values.insert(token.name, Arc::new(value));
        Self {
            values: Arc::new(values),
        }
    }

    pub fn delete<T>(&self, token: &ContextToken<T>) -> Self {
        if !self.values.contains_key(token.name) {
            return self.clone();
        }
        let mut values = (*self.values).clone();
        values.remove(token.name);
        Self {
            values: Arc::new(values),
        }
    }

    pub fn has<T>(&self, token: &ContextToken<T>) -> bool {
        self.values.contains_key(token.name)
    }

    pub fn keys(&self) -> Vec<&'static str> {
        let mut keys: Vec<_> = self.values.keys().copied().collect();
        keys.sort_unstable();
        keys
    }
}

impl fmt::Debug for HttpContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.keys()).finish()
    }
}
