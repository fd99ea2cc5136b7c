//! Shared transfer-cache store and its serialized entries.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{Headers, Response, ResponseBody, ResponseHead, ResponseType};
use crate::{Error, Result};

/// One recorded response, with short field names for embedding in a rendered page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferEntry {
    #[serde(rename = "b")]
    pub body: Value,
    #[serde(rename = "h", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, Vec<String>>,
    #[serde(rename = "s")]
    pub status: u16,
    #[serde(rename = "st")]
    pub status_text: String,
    #[serde(rename = "u")]
    pub url: String,
    #[serde(rename = "rt")]
    pub response_type: ResponseType,
    /// Media type of a blob body.
    #[serde(rename = "ct", default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

impl TransferEntry {
    /// Snapshot of `response`, keeping only the headers named in `include_headers`.
    pub fn from_response(
        response: &Response,
        url: impl Into<String>,
        response_type: ResponseType,
        include_headers: Option<&[String]>,
    ) -> Self {
        let mut headers = BTreeMap::new();
        for name in include_headers.unwrap_or_default() {
            if let Some(values) = response.headers.get_all(name) {
                headers.insert(name.clone(), values.to_vec());
            }
        }
        let content_type = match &response.body {
            ResponseBody::Blob { content_type, .. } => content_type.clone(),
            _ => None,
        };
        let body = match &response.body {
            ResponseBody::Empty => Value::Null,
            ResponseBody::Json(v) => v.clone(),
            ResponseBody::Text(s) => Value::String(s.clone()),
            ResponseBody::Blob { data, .. } | ResponseBody::ArrayBuffer(data) => {
                Value::String(BASE64.encode(data))
            }
        };
        Self {
            body,
            headers,
            status: response.status,
            status_text: response.status_text.clone(),
            url: url.into(),
            response_type,
            content_type,
        }
    }

    /// Rebuild the response. Binary bodies are re-inflated from their stored base64 text.
    pub fn to_response(&self) -> Response {
        let body = match (self.response_type, &self.body) {
            (_, Value::Null) => ResponseBody::Empty,
            (ResponseType::Blob, Value::String(encoded)) => ResponseBody::Blob {
                data: decode_binary(encoded),
                content_type: self.content_type.clone(),
            },
            (ResponseType::ArrayBuffer, Value::String(encoded)) => {
                ResponseBody::ArrayBuffer(decode_binary(encoded))
            }
            (ResponseType::Text, Value::String(s)) => ResponseBody::Text(s.clone()),
            (ResponseType::Text, other) => ResponseBody::Text(other.to_string()),
            (_, other) => ResponseBody::Json(other.clone()),
        };
        let headers = Headers::from_pairs(self.headers.iter().map(|(k, v)| (k.clone(), v.clone())));
        let head = ResponseHead {
            headers,
            status: self.status,
            status_text: self.status_text.clone(),
            url: Some(self.url.clone()),
        };
        Response::new(head, body)
    }
}

fn decode_binary(encoded: &str) -> Bytes {
    BASE64
        .decode(encoded)
        .map(Bytes::from)
        .unwrap_or_else(|_| Bytes::copy_from_slice(encoded.as_bytes()))
}

/// Key/value store shared between the server render and the client that hydrates it.
#[derive(Debug, Clone, Default)]
pub struct TransferState {
    entries: Arc<RwLock<HashMap<String, TransferEntry>>>,
}

impl TransferState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<TransferEntry> {
        self.entries.read().ok()?.get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, entry: TransferEntry) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(key.into(), entry);
        }
    }

    pub fn has(&self, key: &str) -> bool {
        self.entries.read().map(|e| e.contains_key(key)).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .read()
            .map(|e| e.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Serialized store, keys in sorted order.
    pub fn to_json(&self) -> Result<String> {
        let entries = self
            .entries
            .read()
            .map_err(|_| Error::configuration("transfer state lock poisoned"))?;
        let sorted: BTreeMap<&String, &TransferEntry> = entries.iter().collect();
        Ok(serde_json::to_string(&sorted)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let entries: HashMap<String, TransferEntry> = serde_json::from_str(json)?;
        Ok(Self {
            entries: Arc::new(RwLock::new(entries)),
        })
    }
}
