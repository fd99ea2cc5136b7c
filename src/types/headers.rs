//! Immutable, case-insensitive HTTP headers.
//!
//! `append`/`set`/`delete` never touch the receiver: they return a new [`Headers`] that
//! shares the same unparsed base and carries one more queued update. The base is parsed
//! and the update queue replayed the first time an accessor is called, and the result is
//! cached for the lifetime of that value.

use once_cell::sync::OnceCell;
use reqwest::header::HeaderMap;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Conversion into the ordered value list of a header.
pub trait IntoHeaderValues {
    fn into_header_values(self) -> Vec<String>;
}

impl IntoHeaderValues for &str {
    fn into_header_values(self) -> Vec<String> {
        vec![self.to_string()]
    }
}

impl IntoHeaderValues for String {
    fn into_header_values(self) -> Vec<String> {
        vec![self]
    }
}

impl IntoHeaderValues for &String {
    fn into_header_values(self) -> Vec<String> {
        vec![self.clone()]
    }
}

impl IntoHeaderValues for Vec<String> {
    fn into_header_values(self) -> Vec<String> {
        self
    }
}

impl IntoHeaderValues for Vec<&str> {
    fn into_header_values(self) -> Vec<String> {
        self.into_iter().map(str::to_string).collect()
    }
}

impl IntoHeaderValues for &[&str] {
    fn into_header_values(self) -> Vec<String> {
        self.iter().map(|s| s.to_string()).collect()
    }
}

impl IntoHeaderValues for &[String] {
    fn into_header_values(self) -> Vec<String> {
        self.to_vec()
    }
}

impl<const N: usize> IntoHeaderValues for [&str; N] {
    fn into_header_values(self) -> Vec<String> {
        self.iter().map(|s| s.to_string()).collect()
    }
}

macro_rules! numeric_header_values {
    ($($t:ty),*) => {
        $(impl IntoHeaderValues for $t {
            fn into_header_values(self) -> Vec<String> {
                vec![self.to_string()]
            }
        })*
    };
}

numeric_header_values!(u16, u32, u64, usize, i32, i64);

#[derive(Debug, Clone)]
enum HeaderSource {
    Empty,
    Raw(String),
    Pairs(Vec<(String, Vec<String>)>),
    Native(HeaderMap),
}

#[derive(Debug, Clone)]
enum HeaderUpdate {
    Append { name: String, values: Vec<String> },
    Set { name: String, values: Vec<String> },
    Delete { name: String, values: Option<Vec<String>> },
}

#[derive(Debug, Clone)]
struct HeaderEntry {
    /// Lowercase lookup key.
    key: String,
    /// Name as first seen.
    name: String,
    values: Vec<String>,
}

#[derive(Debug, Clone, Default)]
struct HeaderTable {
    entries: Vec<HeaderEntry>,
}

impl HeaderTable {
    fn from_source(source: &HeaderSource) -> Self {
        let mut table = HeaderTable::default();
        match source {
            HeaderSource::Empty => {}
            HeaderSource::Raw(raw) => {
                for line in raw.split('\n') {
                    if let Some(idx) = line.find(':') {
                        if idx > 0 {
                            let value = line[idx + 1..].trim();
                            table.append(&line[..idx], vec![value.to_string()]);
                        }
                    }
                }
            }
            HeaderSource::Pairs(pairs) => {
                for (name, values) in pairs {
                    if !values.is_empty() {
                        table.set(name, values.clone());
                    }
                }
            }
            HeaderSource::Native(map) => {
                for (name, value) in map.iter() {
                    let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
                    table.append(name.as_str(), vec![value]);
                }
            }
        }
        table
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.key == key)
    }

    fn find(&self, name: &str) -> Option<&HeaderEntry> {
        let key = name.to_ascii_lowercase();
        self.entries.iter().find(|e| e.key == key)
    }

    fn append(&mut self, name: &str, values: Vec<String>) {
        let key = name.to_ascii_lowercase();
        match self.position(&key) {
            Some(idx) => self.entries[idx].values.extend(values),
            None => self.entries.push(HeaderEntry {
                key,
                name: name.to_string(),
                values,
            }),
        }
    }

    fn set(&mut self, name: &str, values: Vec<String>) {
        let key = name.to_ascii_lowercase();
        match self.position(&key) {
            Some(idx) => self.entries[idx].values = values,
            None => self.entries.push(HeaderEntry {
                key,
                name: name.to_string(),
                values,
            }),
        }
    }

    fn apply(&mut self, update: &HeaderUpdate) {
        match update {
            HeaderUpdate::Append { name, values } => {
                if !values.is_empty() {
                    self.append(name, values.clone());
                }
            }
            HeaderUpdate::Set { name, values } => {
                if !values.is_empty() {
                    self.set(name, values.clone());
                }
            }
            HeaderUpdate::Delete { name, values } => {
                let key = name.to_ascii_lowercase();
                let Some(idx) = self.position(&key) else {
                    return;
                };
                match values {
                    None => {
                        self.entries.remove(idx);
                    }
                    Some(to_delete) => {
                        let entry = &mut self.entries[idx];
                        entry.values.retain(|v| !to_delete.contains(v));
                        if entry.values.is_empty() {
                            self.entries.remove(idx);
                        }
                    }
                }
            }
        }
    }
}

struct HeaderBase {
    source: HeaderSource,
    table: OnceCell<HeaderTable>,
}

impl HeaderBase {
    fn table(&self) -> &HeaderTable {
        self.table.get_or_init(|| HeaderTable::from_source(&self.source))
    }
}

/// Warns once per header name when a header outside an allow-list is read.
struct AccessProbe {
    url: String,
    include: Vec<String>,
    warned: Mutex<HashSet<String>>,
}

impl AccessProbe {
    fn check(&self, name: &str) {
        let key = name.to_ascii_lowercase();
        if self.include.iter().any(|h| *h == key) {
            return;
        }
        let Ok(mut warned) = self.warned.lock() else {
            return;
        };
        if warned.insert(key) {
            warn!(
                header = name,
                url = %self.url,
                "header `{}` was read from a replayed response but was not transferred; add it to `include_headers` to keep its value",
                name
            );
        }
    }
}

/// Immutable multi-value HTTP headers with case-insensitive lookup.
#[derive(Clone)]
pub struct Headers {
    base: Arc<HeaderBase>,
    updates: Arc<Vec<HeaderUpdate>>,
    table: Arc<OnceCell<HeaderTable>>,
    probe: Option<Arc<AccessProbe>>,
}

impl Headers {
    pub fn new() -> Self {
        Self::from_source(HeaderSource::Empty)
    }

    /// Headers from a raw `name: value` blob, one header per line
    /// (the format of `getAllResponseHeaders()`).
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self::from_source(HeaderSource::Raw(raw.into()))
    }

    /// Headers from a plain mapping. Later duplicates of a name replace earlier ones;
    /// names with an empty value list are skipped.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: IntoHeaderValues,
    {
        let pairs = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into_header_values()))
            .collect();
        Self::from_source(HeaderSource::Pairs(pairs))
    }

    fn from_source(source: HeaderSource) -> Self {
        Self {
            base: Arc::new(HeaderBase {
                source,
                table: OnceCell::new(),
            }),
            updates: Arc::new(Vec::new()),
            table: Arc::new(OnceCell::new()),
            probe: None,
        }
    }

    fn table(&self) -> &HeaderTable {
        if self.updates.is_empty() {
            return self.base.table();
        }
        self.table.get_or_init(|| {
            let mut table = self.base.table().clone();
            for update in self.updates.iter() {
                table.apply(update);
            }
            table
        })
    }

    fn with_update(&self, update: HeaderUpdate) -> Self {
        let mut updates = Vec::with_capacity(self.updates.len() + 1);
        updates.extend(self.updates.iter().cloned());
        updates.push(update);
        Self {
            base: self.base.clone(),
            updates: Arc::new(updates),
            table: Arc::new(OnceCell::new()),
            probe: None,
        }
    }

    fn probe(&self, name: &str) {
        if let Some(probe) = &self.probe {
            probe.check(name);
        }
    }

    pub fn has(&self, name: &str) -> bool {
        self.probe(name);
        self.table().find(name).is_some()
    }

    /// First value of the header.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.probe(name);
        self.table()
            .find(name)
            .and_then(|e| e.values.first())
            .map(String::as_str)
    }

    pub fn get_all(&self, name: &str) -> Option<&[String]> {
        self.probe(name);
        self.table().find(name).map(|e| e.values.as_slice())
    }

    /// Header names in their original case, in insertion order.
    pub fn keys(&self) -> Vec<&str> {
        self.table()
            .entries
            .iter()
            .map(|e| e.name.as_str())
            .collect()
    }

    /// `(original name, values)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.table()
            .entries
            .iter()
            .map(|e| (e.name.as_str(), e.values.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.table().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn append(&self, name: impl Into<String>, values: impl IntoHeaderValues) -> Self {
        self.with_update(HeaderUpdate::Append {
            name: name.into(),
            values: values.into_header_values(),
        })
    }

    pub fn set(&self, name: impl Into<String>, values: impl IntoHeaderValues) -> Self {
        self.with_update(HeaderUpdate::Set {
            name: name.into(),
            values: values.into_header_values(),
        })
    }

    /// Remove the header entirely.
    pub fn delete(&self, name: impl Into<String>) -> Self {
        self.with_update(HeaderUpdate::Delete {
            name: name.into(),
            values: None,
        })
    }

    /// Remove only the given values; the header survives if any value remains.
    pub fn delete_values(&self, name: impl Into<String>, values: impl IntoHeaderValues) -> Self {
        self.with_update(HeaderUpdate::Delete {
            name: name.into(),
            values: Some(values.into_header_values()),
        })
    }

    /// Native header map; multi-value headers are joined with `,` the way transports send them.
    /// Names or values that are not valid on the wire are skipped.
    pub fn to_header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, values) in self.iter() {
            let Ok(name) = reqwest::header::HeaderName::from_bytes(name.as_bytes()) else {
                continue;
            };
            if let Ok(value) = reqwest::header::HeaderValue::from_str(&values.join(",")) {
                map.insert(name, value);
            }
        }
        map
    }

    pub(crate) fn with_access_probe(mut self, url: impl Into<String>, include: &[String]) -> Self {
        self.probe = Some(Arc::new(AccessProbe {
            url: url.into(),
            include: include.iter().map(|h| h.to_ascii_lowercase()).collect(),
            warned: Mutex::new(HashSet::new()),
        }));
        self
    }

    /// Number of distinct headers the access probe has warned about.
    pub(crate) fn probe_warnings(&self) -> usize {
        self.probe
            .as_ref()
            .and_then(|p| p.warned.lock().ok().map(|w| w.len()))
            .unwrap_or(0)
    }
}

impl Default for Headers {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl From<HeaderMap> for Headers {
    fn from(map: HeaderMap) -> Self {
        Self::from_source(HeaderSource::Native(map))
    }
}

impl From<&HeaderMap> for Headers {
    fn from(map: &HeaderMap) -> Self {
        Self::from_source(HeaderSource::Native(map.clone()))
    }
}

impl From<&str> for Headers {
    fn from(raw: &str) -> Self {
        Self::from_raw(raw)
    }
}

impl<K: Into<String>, V: IntoHeaderValues> FromIterator<(K, V)> for Headers {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self::from_pairs(iter)
    }
}
