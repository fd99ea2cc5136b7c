//! Percent-encoding in the shape of `encodeURIComponent` / `decodeURIComponent`.

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

/// Everything `encodeURIComponent` escapes: all but ASCII alphanumerics and `-_.!~*'()`.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Query strings may also carry `@ : $ , ; = ? /` unescaped without changing their meaning.
const QUERY_COMPONENT: &AsciiSet = &COMPONENT
    .remove(b'@')
    .remove(b':')
    .remove(b'$')
    .remove(b',')
    .remove(b';')
    .remove(b'=')
    .remove(b'?')
    .remove(b'/');

/// Strict component encoding: everything outside the unreserved set is escaped.
pub fn encode_component(input: &str) -> String {
    utf8_percent_encode(input, COMPONENT).to_string()
}

/// Component encoding that keeps `@ : $ , ; = ? /` readable. `+` is still escaped.
pub fn encode_query_component(input: &str) -> String {
    utf8_percent_encode(input, QUERY_COMPONENT).to_string()
}

/// Decode `%XX` escapes. Malformed escapes are kept verbatim and `+` stays a plus sign.
pub fn decode_component(input: &str) -> String {
    percent_decode_str(input).decode_utf8_lossy().into_owned()
}
