//! Lifecycle events of an exchange and the response values they carry.

use bytes::Bytes;
use serde_json::Value;

use super::headers::Headers;
use crate::transport::TransportError;

pub const HTTP_STATUS_OK: u16 = 200;
pub const HTTP_STATUS_NO_CONTENT: u16 = 204;

/// `200 <= status < 300`.
pub fn is_ok_status(status: u16) -> bool {
    (200..300).contains(&status)
}

/// Parsed response body.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ResponseBody {
    #[default]
    Empty,
    Json(Value),
    Text(String),
    Blob {
        data: Bytes,
        content_type: Option<String>,
    },
    ArrayBuffer(Bytes),
}

impl ResponseBody {
    pub fn is_empty(&self) -> bool {
        matches!(self, ResponseBody::Empty)
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            ResponseBody::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ResponseBody::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            ResponseBody::Blob { data, .. } | ResponseBody::ArrayBuffer(data) => Some(data),
            _ => None,
        }
    }

    /// Text form of the body: JSON is re-serialised, binary bodies are decoded lossily.
    pub fn to_text(&self) -> Option<String> {
        match self {
            ResponseBody::Empty => None,
            ResponseBody::Json(v) => Some(v.to_string()),
            ResponseBody::Text(s) => Some(s.clone()),
            ResponseBody::Blob { data, .. } | ResponseBody::ArrayBuffer(data) => {
                Some(String::from_utf8_lossy(data).into_owned())
            }
        }
    }
}

/// Status line and headers, emitted as [`HttpEvent::ResponseHeader`] before the body arrives.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub headers: Headers,
    pub status: u16,
    pub status_text: String,
    pub url: Option<String>,
}

impl ResponseHead {
    pub fn ok(&self) -> bool {
        is_ok_status(self.status)
    }
}

/// A complete successful response.
#[derive(Debug, Clone)]
pub struct Response {
    pub body: ResponseBody,
    pub headers: Headers,
    pub status: u16,
    pub status_text: String,
    pub url: Option<String>,
    pub ok: bool,
    pub redirected: Option<bool>,
    pub response_type: Option<String>,
}

impl Response {
    pub fn new(head: ResponseHead, body: ResponseBody) -> Self {
        Self {
            ok: head.ok(),
            body,
            headers: head.headers,
            status: head.status,
            status_text: head.status_text,
            url: head.url,
            redirected: None,
            response_type: None,
        }
    }
}

/// One signal in the lifecycle of a request.
///
/// A successful exchange emits `Sent`, any number of `UploadProgress`, an optional
/// `ResponseHeader`, any number of `DownloadProgress` and finally `Response`.
#[derive(Debug, Clone)]
pub enum HttpEvent {
    Sent,
    UploadProgress {
        loaded: u64,
        total: Option<u64>,
    },
    ResponseHeader(ResponseHead),
    DownloadProgress {
        loaded: u64,
        total: Option<u64>,
        partial_text: Option<String>,
    },
    Response(Response),
}

impl HttpEvent {
    pub fn is_response(&self) -> bool {
        matches!(self, HttpEvent::Response(_))
    }

    pub fn into_response(self) -> Option<Response> {
        match self {
            HttpEvent::Response(r) => Some(r),
            _ => None,
        }
    }
}

/// What went wrong in a failed exchange.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorPayload {
    /// The server answered with a non-2xx status; this is its (parsed) body.
    Body(ResponseBody),
    /// The body could not be decoded as the requested response type.
    Parse { error: String, text: String },
    /// No usable response: network failure, abort or timeout.
    Transport(TransportError),
}

/// Terminal error of an exchange.
#[derive(Debug, Clone)]
pub struct ErrorResponse {
    pub error: ErrorPayload,
    pub headers: Headers,
    pub status: u16,
    pub status_text: String,
    pub url: Option<String>,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(
        error: ErrorPayload,
        headers: Headers,
        status: u16,
        status_text: Option<String>,
        url: Option<String>,
    ) -> Self {
        let status_text = status_text
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "Unknown Error".to_string());
        let shown_url = url.as_deref().unwrap_or("(unknown url)");
        let message = if is_ok_status(status) {
            format!("Http failure during parsing for {}", shown_url)
        } else {
            format!(
                "Http failure response for {}: {} {}",
                shown_url, status, status_text
            )
        };
        Self {
            error,
            headers,
            status,
            status_text,
            url,
            message,
        }
    }

    /// Failure without any response from the server.
    pub fn transport(error: TransportError, status_text: Option<String>, url: Option<String>) -> Self {
        Self::new(ErrorPayload::Transport(error), Headers::new(), 0, status_text, url)
    }

    pub fn ok(&self) -> bool {
        false
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.error, ErrorPayload::Transport(TransportError::Timeout))
    }
}
