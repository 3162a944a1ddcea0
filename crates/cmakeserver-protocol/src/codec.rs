//! Marker-delimited frame encoding.
//!
//! A frame is the JSON document surrounded by fixed marker lines:
//!
//! ```text
//! +-------------+------------------+-------------+
//! | HEAD_MARKER |  UTF-8 JSON body | TAIL_MARKER |
//! +-------------+------------------+-------------+
//! ```

use serde::Serialize;
use serde_json::Value;

use crate::error::{ProtocolError, ProtocolResult};

/// Bytes that open every frame.
pub const HEAD_MARKER: &[u8] = b"\n[== \"CMake Server\" ==[\n";

/// Bytes that close every frame.
pub const TAIL_MARKER: &[u8] = b"\n]== \"CMake Server\" ==]\n";

/// Encodes a message into a complete frame ready for transmission.
///
/// # Example
///
/// ```rust
/// use cmakeserver_protocol::{encode_frame, HEAD_MARKER, TAIL_MARKER};
/// use serde_json::json;
///
/// let bytes = encode_frame(&json!({"type": "cache", "cookie": "3"})).unwrap();
/// assert!(bytes.starts_with(HEAD_MARKER));
/// assert!(bytes.ends_with(TAIL_MARKER));
/// ```
pub fn encode_frame<T: Serialize + ?Sized>(message: &T) -> ProtocolResult<Vec<u8>> {
    let json = serde_json::to_vec(message)?;

    let mut buffer = Vec::with_capacity(HEAD_MARKER.len() + json.len() + TAIL_MARKER.len());
    buffer.extend_from_slice(HEAD_MARKER);
    buffer.extend_from_slice(&json);
    buffer.extend_from_slice(TAIL_MARKER);
    Ok(buffer)
}

/// Decodes the body found between the markers of one frame.
///
/// The body must be valid UTF-8 and parse to a JSON object.
pub fn decode_body(body: &[u8]) -> ProtocolResult<Value> {
    let text = std::str::from_utf8(body)?;
    let value: Value = serde_json::from_str(text)?;
    if !value.is_object() {
        return Err(ProtocolError::NotAnObject);
    }
    Ok(value)
}

/// Decodes exactly one complete frame (markers included).
///
/// # Example
///
/// ```rust
/// use cmakeserver_protocol::{decode_frame, encode_frame};
/// use serde_json::json;
///
/// let message = json!({"type": "signal", "name": "dirty"});
/// let bytes = encode_frame(&message).unwrap();
/// assert_eq!(decode_frame(&bytes).unwrap(), message);
/// ```
pub fn decode_frame(frame: &[u8]) -> ProtocolResult<Value> {
    if !frame.starts_with(HEAD_MARKER) {
        return Err(ProtocolError::framing("frame does not start with the head marker"));
    }
    let rest = &frame[HEAD_MARKER.len()..];
    if !rest.ends_with(TAIL_MARKER) {
        return Err(ProtocolError::framing("frame does not end with the tail marker"));
    }
    decode_body(&rest[..rest.len() - TAIL_MARKER.len()])
}

/// Finds the first occurrence of `needle` in `haystack`.
pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encode_wraps_compact_json() {
        let bytes = encode_frame(&json!({"type": "codemodel"})).unwrap();
        let expected = [HEAD_MARKER, br#"{"type":"codemodel"}"#.as_slice(), TAIL_MARKER].concat();
        assert_eq!(bytes, expected);
    }

    #[test]
    fn decode_body_preserves_unicode() {
        let body = r#"{"type":"message","cookie":"0","message":"Übersetze ✓ 日本語"}"#;
        let value = decode_body(body.as_bytes()).unwrap();
        assert_eq!(value["message"], "Übersetze ✓ 日本語");
    }

    #[test]
    fn decode_body_rejects_invalid_utf8() {
        let result = decode_body(&[b'{', 0xff, 0xfe, b'}']);
        assert!(matches!(result, Err(ProtocolError::Utf8(_))));
    }

    #[test]
    fn decode_body_rejects_invalid_json() {
        let result = decode_body(b"{ not json");
        assert!(matches!(result, Err(ProtocolError::Json(_))));
    }

    #[test]
    fn decode_body_rejects_non_object() {
        let result = decode_body(b"[1, 2, 3]");
        assert!(matches!(result, Err(ProtocolError::NotAnObject)));
    }

    #[test]
    fn decode_body_tolerates_surrounding_whitespace() {
        let value = decode_body(b"\n    { \"type\": \"hello\" }\n    ").unwrap();
        assert_eq!(value, json!({"type": "hello"}));
    }

    #[test]
    fn decode_frame_checks_markers() {
        let missing_head = [br#"{"type":"hello"}"#.as_slice(), TAIL_MARKER].concat();
        assert!(decode_frame(&missing_head).unwrap_err().is_framing());

        let missing_tail = [HEAD_MARKER, br#"{"type":"hello"}"#.as_slice()].concat();
        assert!(decode_frame(&missing_tail).unwrap_err().is_framing());
    }

    #[test]
    fn find_locates_needle() {
        assert_eq!(find(b"abcdef", b"cd"), Some(2));
        assert_eq!(find(b"abc", b"abcd"), None);
        assert_eq!(find(b"abc", b""), None);
        assert_eq!(find(b"xxTAIL", b"TAIL"), Some(2));
    }
}
