//! Response body decoding shared by both transports.

use bytes::Bytes;

use crate::types::{is_ok_status, ResponseBody, ResponseType};

/// Strip the `)]}'` anti-XSSI prefix (optionally followed by `,`) and its newline.
pub(crate) fn strip_xssi_prefix(text: &str) -> &str {
    let Some(rest) = text.strip_prefix(")]}'") else {
        return text;
    };
    let rest = rest.strip_prefix(',').unwrap_or(rest);
    match rest.strip_prefix('\n') {
        Some(body) => body,
        None => text,
    }
}

/// Incremental UTF-8 decoder that carries incomplete sequences across chunks.
#[derive(Debug, Default)]
pub(crate) struct Utf8StreamDecoder {
    pending: Vec<u8>,
}

impl Utf8StreamDecoder {
    pub(crate) fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(s) => {
                    out.push_str(s);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    // valid_up_to bytes are known to be valid UTF-8
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                    }
                }
            }
        }
    }
}

/// Body parsed from fully buffered bytes.
///
/// JSON that fails to parse is returned as the original text, XSSI prefix included, for
/// non-2xx statuses (error bodies are often not JSON); for 2xx statuses the parse error is
/// returned.
pub(crate) fn parse_body(
    response_type: ResponseType,
    content: Bytes,
    content_type: Option<&str>,
    status: u16,
) -> Result<ResponseBody, String> {
    match response_type {
        ResponseType::Json => {
            let decoded = String::from_utf8_lossy(&content);
            let text = strip_xssi_prefix(&decoded);
            if text.is_empty() {
                return Ok(ResponseBody::Empty);
            }
            match serde_json::from_str(text) {
                Ok(value) => Ok(ResponseBody::Json(value)),
                Err(_) if !is_ok_status(status) => Ok(ResponseBody::Text(decoded.to_string())),
                Err(e) => Err(e.to_string()),
            }
        }
        ResponseType::Text => Ok(ResponseBody::Text(String::from_utf8_lossy(&content).into_owned())),
        ResponseType::Blob => Ok(ResponseBody::Blob {
            data: content,
            content_type: content_type.filter(|t| !t.is_empty()).map(str::to_string),
        }),
        ResponseType::ArrayBuffer => Ok(ResponseBody::ArrayBuffer(content)),
    }
}
