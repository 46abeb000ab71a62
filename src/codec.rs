//! Datagram decoding.
//!
//! The sender is a Python numeric pipeline that writes IEEE-754 NaN as the bare
//! token `NaN`, which strict JSON rejects. Every occurrence is rewritten to the
//! string `"Null"` before parsing. The rewrite is textual: a string value that
//! contains `NaN` is rewritten too.

use crate::event::IngestEvent;
use serde_json::Value;

/// Token emitted by the sender for not-a-number.
pub const NAN_TOKEN: &str = "NaN";
/// Replacement for [`NAN_TOKEN`].
pub const NAN_SENTINEL: &str = "\"Null\"";

/// Rewrite bare `NaN` tokens so the text parses as JSON.
pub fn sanitize(text: &str) -> String {
    text.replace(NAN_TOKEN, NAN_SENTINEL)
}

/// Decode one datagram payload.
///
/// Returns `Ok(None)` for an empty payload (nothing to deliver). Trailing NUL
/// bytes are ignored and invalid UTF-8 is replaced rather than rejected.
pub fn decode(payload: &[u8]) -> Result<Option<Value>, IngestEvent> {
    let end = payload
        .iter()
        .rposition(|b| *b != 0)
        .map_or(0, |last| last + 1);
    if end == 0 {
        return Ok(None);
    }

    let text = sanitize(&String::from_utf8_lossy(&payload[..end]));
    serde_json::from_str(&text)
        .map(Some)
        .map_err(|e| IngestEvent::Parse {
            raw: text,
            diagnostic: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nan_becomes_string_sentinel() {
        let value = decode(br#"{"seq": 3, "speed": NaN}"#).unwrap().unwrap();
        assert_eq!(value["speed"], json!("Null"));
        assert_eq!(value["seq"], json!(3));
    }

    #[test]
    fn nan_inside_array() {
        let value = decode(b"{\"v\": [1.0, NaN, 2.0]}").unwrap().unwrap();
        assert_eq!(value["v"], json!([1.0, "Null", 2.0]));
    }

    #[test]
    fn empty_and_zeroed_payloads_are_skipped() {
        assert_eq!(decode(b"").unwrap(), None);
        assert_eq!(decode(&[0u8; 16]).unwrap(), None);
    }

    #[test]
    fn trailing_nul_bytes_ignored() {
        let mut buf = br#"{"seq": 1}"#.to_vec();
        buf.extend_from_slice(&[0u8; 32]);
        assert_eq!(decode(&buf).unwrap(), Some(json!({"seq": 1})));
    }

    #[test]
    fn malformed_json_reports_raw_text() {
        let err = decode(b"{\"seq\": 1,").unwrap_err();
        match err {
            IngestEvent::Parse { raw, diagnostic } => {
                assert_eq!(raw, "{\"seq\": 1,");
                assert!(!diagnostic.is_empty());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn textual_rewrite_touches_string_values() {
        let value = decode(br#"{"name": "NaNa"}"#);
        // "NaNa" -> ""Null"a" is no longer valid JSON
        assert!(value.is_err());
    }
}
