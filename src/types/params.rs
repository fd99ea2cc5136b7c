//! Ordered, multi-value query parameters.
//!
//! Same copy-on-write scheme as [`Headers`](super::Headers): updates are queued and
//! replayed over a shared base on first read.

use once_cell::sync::OnceCell;
use std::fmt;
use std::sync::Arc;

use crate::utils::percent;
use crate::{Error, ErrorContext, Result};

/// Encodes and decodes keys and values of query parameters.
pub trait ParameterCodec: Send + Sync {
    fn encode_key(&self, key: &str) -> String;
    fn encode_value(&self, value: &str) -> String;
    fn decode_key(&self, key: &str) -> String;
    fn decode_value(&self, value: &str) -> String;
}

/// Default codec: component encoding that leaves `@ : $ , ; = ? /` unescaped.
#[derive(Debug, Clone, Copy, Default)]
pub struct UrlEncodingCodec;

impl ParameterCodec for UrlEncodingCodec {
    fn encode_key(&self, key: &str) -> String {
        percent::encode_query_component(key)
    }

    fn encode_value(&self, value: &str) -> String {
        percent::encode_query_component(value)
    }

    fn decode_key(&self, key: &str) -> String {
        percent::decode_component(key)
    }

    fn decode_value(&self, value: &str) -> String {
        percent::decode_component(value)
    }
}

/// Conversion into the value list of a parameter.
pub trait IntoParamValues {
    fn into_param_values(self) -> Vec<String>;
}

impl IntoParamValues for &str {
    fn into_param_values(self) -> Vec<String> {
        vec![self.to_string()]
    }
}

impl IntoParamValues for String {
    fn into_param_values(self) -> Vec<String> {
        vec![self]
    }
}

impl IntoParamValues for Vec<String> {
    fn into_param_values(self) -> Vec<String> {
        self
    }
}

impl IntoParamValues for Vec<&str> {
    fn into_param_values(self) -> Vec<String> {
        self.into_iter().map(str::to_string).collect()
    }
}

impl<const N: usize> IntoParamValues for [&str; N] {
    fn into_param_values(self) -> Vec<String> {
        self.iter().map(|s| s.to_string()).collect()
    }
}

macro_rules! scalar_param_values {
    ($($t:ty),*) => {
        $(impl IntoParamValues for $t {
            fn into_param_values(self) -> Vec<String> {
                vec![self.to_string()]
            }
        })*
    };
}

scalar_param_values!(bool, u16, u32, u64, usize, i32, i64, f64);

#[derive(Debug, Clone)]
enum ParamSource {
    Empty,
    Query(String),
    Pairs(Vec<(String, Vec<String>)>),
}

#[derive(Debug, Clone)]
enum ParamUpdate {
    Append { param: String, value: String },
    Set { param: String, value: String },
    Delete { param: String, value: Option<String> },
}

type ParamTable = Vec<(String, Vec<String>)>;

fn position(table: &ParamTable, param: &str) -> Option<usize> {
    table.iter().position(|(k, _)| k == param)
}

fn put(table: &mut ParamTable, param: &str, values: Vec<String>) {
    match position(table, param) {
        Some(idx) => table[idx].1 = values,
        None => table.push((param.to_string(), values)),
    }
}

fn parse_query(raw: &str, codec: &dyn ParameterCodec) -> ParamTable {
    let mut table: ParamTable = Vec::new();
    let raw = raw.strip_prefix('?').unwrap_or(raw);
    for segment in raw.split('&').filter(|s| !s.is_empty()) {
        let (key, value) = match segment.find('=') {
            Some(idx) => (
                codec.decode_key(&segment[..idx]),
                codec.decode_value(&segment[idx + 1..]),
            ),
            None => (codec.decode_key(segment), String::new()),
        };
        match position(&table, &key) {
            Some(idx) => table[idx].1.push(value),
            None => table.push((key, vec![value])),
        }
    }
    table
}

fn apply(table: &mut ParamTable, update: &ParamUpdate) {
    match update {
        ParamUpdate::Append { param, value } => match position(table, param) {
            Some(idx) => table[idx].1.push(value.clone()),
            None => table.push((param.clone(), vec![value.clone()])),
        },
        ParamUpdate::Set { param, value } => put(table, param, vec![value.clone()]),
        ParamUpdate::Delete { param, value } => {
            let Some(idx) = position(table, param) else {
                return;
            };
            match value {
                None => {
                    table.remove(idx);
                }
                Some(value) => {
                    let values = &mut table[idx].1;
                    if let Some(found) = values.iter().position(|v| v == value) {
                        values.remove(found);
                    }
                    if values.is_empty() {
                        table.remove(idx);
                    }
                }
            }
        }
    }
}

struct ParamBase {
    source: ParamSource,
    table: OnceCell<ParamTable>,
}

/// Immutable query parameters.
#[derive(Clone)]
pub struct Params {
    base: Arc<ParamBase>,
    updates: Arc<Vec<ParamUpdate>>,
    table: Arc<OnceCell<ParamTable>>,
    codec: Arc<dyn ParameterCodec>,
}

/// Raw sources for [`Params`]; at most one of `from_query` / `from_pairs` may be given.
#[derive(Default)]
pub struct ParamsOptions {
    pub from_query: Option<String>,
    pub from_pairs: Option<Vec<(String, Vec<String>)>>,
    pub codec: Option<Arc<dyn ParameterCodec>>,
}

impl ParamsOptions {
    pub fn build(self) -> Result<Params> {
        let codec = self
            .codec
            .unwrap_or_else(|| Arc::new(UrlEncodingCodec) as Arc<dyn ParameterCodec>);
        let source = match (self.from_query, self.from_pairs) {
            (Some(_), Some(_)) => {
                return Err(Error::configuration_with_context(
                    "cannot specify both from_query and from_pairs",
                    ErrorContext::new().with_source("params"),
                ))
            }
            (Some(query), None) => ParamSource::Query(query),
            (None, Some(pairs)) => ParamSource::Pairs(pairs),
            (None, None) => ParamSource::Empty,
        };
        Ok(Params::from_source(source, codec))
    }
}

impl Params {
    pub fn new() -> Self {
        Self::from_source(ParamSource::Empty, Arc::new(UrlEncodingCodec))
    }

    /// Parse a query string (a leading `?` is ignored). Parsing happens on first read.
    pub fn from_query(query: impl Into<String>) -> Self {
        Self::from_source(ParamSource::Query(query.into()), Arc::new(UrlEncodingCodec))
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: IntoParamValues,
    {
        let pairs = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into_param_values()))
            .collect();
        Self::from_source(ParamSource::Pairs(pairs), Arc::new(UrlEncodingCodec))
    }

    fn from_source(source: ParamSource, codec: Arc<dyn ParameterCodec>) -> Self {
        Self {
            base: Arc::new(ParamBase {
                source,
                table: OnceCell::new(),
            }),
            updates: Arc::new(Vec::new()),
            table: Arc::new(OnceCell::new()),
            codec,
        }
    }

    /// Same parameters, serialised and parsed with another codec.
    pub fn with_codec(mut self, codec: Arc<dyn ParameterCodec>) -> Self {
        self.codec = codec;
        if matches!(self.base.source, ParamSource::Query(_)) {
            // the base has to be re-parsed with the new codec
            self.base = Arc::new(ParamBase {
                source: self.base.source.clone(),
                table: OnceCell::new(),
            });
            self.table = Arc::new(OnceCell::new());
        }
        self
    }

    fn base_table(&self) -> &ParamTable {
        self.base.table.get_or_init(|| match &self.base.source {
            ParamSource::Empty => Vec::new(),
            ParamSource::Query(raw) => parse_query(raw, self.codec.as_ref()),
            ParamSource::Pairs(pairs) => {
                let mut table = Vec::new();
                for (k, v) in pairs {
                    put(&mut table, k, v.clone());
                }
                table
            }
        })
    }

    fn table(&self) -> &ParamTable {
        if self.updates.is_empty() {
            return self.base_table();
        }
        self.table.get_or_init(|| {
            let mut table = self.base_table().clone();
            for update in self.updates.iter() {
                apply(&mut table, update);
            }
            table
        })
    }

    fn with_updates(&self, extra: impl IntoIterator<Item = ParamUpdate>) -> Self {
        let mut updates: Vec<ParamUpdate> = self.updates.iter().cloned().collect();
        updates.extend(extra);
        Self {
            base: self.base.clone(),
            updates: Arc::new(updates),
            table: Arc::new(OnceCell::new()),
            codec: self.codec.clone(),
        }
    }

    pub fn has(&self, param: &str) -> bool {
        position(self.table(), param).is_some()
    }

    pub fn get(&self, param: &str) -> Option<&str> {
        self.get_all(param)
            .and_then(|v| v.first())
            .map(String::as_str)
    }

    pub fn get_all(&self, param: &str) -> Option<&[String]> {
        let table = self.table();
        position(table, param).map(|idx| table[idx].1.as_slice())
    }

    pub fn keys(&self) -> Vec<&str> {
        self.table().iter().map(|(k, _)| k.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.table().iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }

    pub fn append(&self, param: impl Into<String>, value: impl ToString) -> Self {
        self.with_updates([ParamUpdate::Append {
            param: param.into(),
            value: value.to_string(),
        }])
    }

    /// Append every value of every pair.
    pub fn append_all<I, K, V>(&self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: IntoParamValues,
    {
        let mut updates = Vec::new();
        for (k, v) in pairs {
            let param: String = k.into();
            for value in v.into_param_values() {
                updates.push(ParamUpdate::Append {
                    param: param.clone(),
                    value,
                });
            }
        }
        self.with_updates(updates)
    }

    pub fn set(&self, param: impl Into<String>, value: impl ToString) -> Self {
        self.with_updates([ParamUpdate::Set {
            param: param.into(),
            value: value.to_string(),
        }])
    }

    pub fn delete(&self, param: impl Into<String>) -> Self {
        self.with_updates([ParamUpdate::Delete {
            param: param.into(),
            value: None,
        }])
    }

    /// Remove the first occurrence of `value`; the parameter survives if values remain.
    pub fn delete_value(&self, param: impl Into<String>, value: impl ToString) -> Self {
        self.with_updates([ParamUpdate::Delete {
            param: param.into(),
            value: Some(value.to_string()),
        }])
    }
}

impl Default for Params {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let serialized: Vec<String> = self
            .iter()
            .filter(|(_, values)| !values.is_empty())
            .map(|(key, values)| {
                let key = self.codec.encode_key(key);
                values
                    .iter()
                    .map(|v| format!("{}={}", key, self.codec.encode_value(v)))
                    .collect::<Vec<_>>()
                    .join("&")
            })
            .collect();
        f.write_str(&serialized.join("&"))
    }
}

impl fmt::Debug for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_parsing_keeps_order_and_multi_values() {
        let params = Params::from_query("?a=1&b=x%20y&a=2&flag");
        assert_eq!(params.keys(), vec!["a", "b", "flag"]);
        assert_eq!(params.get_all("a").unwrap(), &["1".to_string(), "2".to_string()]);
        assert_eq!(params.get("b"), Some("x y"));
        assert_eq!(params.get("flag"), Some(""));
    }

    #[test]
    fn to_string_is_stable_across_construction_paths() {
        let appended = Params::new().append("id", 1).append("tag", "a").append("tag", "b");
        let from_pairs = Params::from_pairs([("id", vec!["1"]), ("tag", vec!["a", "b"])]);
        let from_query = Params::from_query("id=1&tag=a&tag=b");
        assert_eq!(appended.to_string(), "id=1&tag=a&tag=b");
        assert_eq!(from_pairs.to_string(), appended.to_string());
        assert_eq!(from_query.to_string(), appended.to_string());
    }

    #[test]
    fn encoding_keeps_query_safe_characters() {
        let params = Params::new()
            .set("q", "a b+c")
            .set("redirect", "/x?y=z")
            .set("at", "me@host:80");
        assert_eq!(
            params.to_string(),
            "q=a%20b%2Bc&redirect=/x?y=z&at=me@host:80"
        );
    }

    #[test]
    fn delete_value_removes_first_match_only() {
        let params = Params::new().append_all([("k", vec!["a", "b", "a"])]);
        let next = params.delete_value("k", "a");
        assert_eq!(next.get_all("k").unwrap(), &["b".to_string(), "a".to_string()]);
        assert!(!next.delete("k").has("k"));
        assert_eq!(params.get_all("k").unwrap().len(), 3);
    }

    #[test]
    fn both_raw_sources_is_a_configuration_error() {
        let err = ParamsOptions {
            from_query: Some("a=1".into()),
            from_pairs: Some(vec![("b".into(), vec!["2".into()])]),
            codec: None,
        }
        .build()
        .unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    struct UpperCodec;

    impl ParameterCodec for UpperCodec {
        fn encode_key(&self, key: &str) -> String {
            key.to_uppercase()
        }
        fn encode_value(&self, value: &str) -> String {
            value.to_uppercase()
        }
        fn decode_key(&self, key: &str) -> String {
            key.to_lowercase()
        }
        fn decode_value(&self, value: &str) -> String {
            value.to_string()
        }
    }

    #[test]
    fn custom_codec_is_used_for_parse_and_serialise() {
        let params = ParamsOptions {
            from_query: Some("KEY=value".into()),
            codec: Some(Arc::new(UpperCodec)),
            ..Default::default()
        }
        .build()
        .unwrap();
        assert_eq!(params.get("key"), Some("value"));
        assert_eq!(params.to_string(), "KEY=VALUE");
    }
}
