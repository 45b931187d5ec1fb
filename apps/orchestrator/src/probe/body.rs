//! Response body capture.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use probe_agent::BodyEncoding;

/// Decode an agent body into text
///
/// Base64 bodies that fail to decode are kept as received. Binary content is
/// converted lossily so the result is always valid text.
pub fn decode_body(raw: &str, encoding: BodyEncoding) -> String {
    match encoding {
        BodyEncoding::Plain => raw.to_string(),
        BodyEncoding::Base64 => match STANDARD.decode(raw.trim()) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                tracing::debug!("Body marked as base64 but failed to decode: {e}");
                raw.to_string()
            }
        },
    }
}

/// Longest prefix of `text` that fits in `budget` bytes without splitting a character
pub fn truncate_to_budget(text: &str, budget: usize) -> &str {
    if text.len() <= budget {
        return text;
    }
    let mut end = budget;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Decode and cap a body in one go
pub fn capture_body(raw: &str, encoding: BodyEncoding, budget: usize) -> String {
    let decoded = decode_body(raw, encoding);
    truncate_to_budget(&decoded, budget).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_never_splits_multibyte_characters() {
        let text = "añ€😀z";
        for budget in 0..=text.len() + 2 {
            let cut = truncate_to_budget(text, budget);
            assert!(cut.len() <= budget);
            assert!(text.starts_with(cut));
            assert!(std::str::from_utf8(cut.as_bytes()).is_ok());
        }
    }

    #[test]
    fn test_trims_back_to_previous_boundary() {
        // "€" is three bytes starting at offset 1
        assert_eq!(truncate_to_budget("a€b", 2), "a");
        assert_eq!(truncate_to_budget("a€b", 3), "a");
        assert_eq!(truncate_to_budget("a€b", 4), "a€");
        assert_eq!(truncate_to_budget("a€b", 0), "");
    }

    #[test]
    fn test_decodes_base64_bodies() {
        let encoded = STANDARD.encode(r#"{"x":"42"}"#);
        assert_eq!(decode_body(&encoded, BodyEncoding::Base64), r#"{"x":"42"}"#);
        assert_eq!(decode_body("not base64!", BodyEncoding::Base64), "not base64!");
        assert_eq!(decode_body("e30=", BodyEncoding::Plain), "e30=");
    }

    #[test]
    fn test_binary_base64_becomes_valid_text_before_capping() {
        let encoded = STANDARD.encode([0xff, 0xfe, b'o', b'k']);
        let captured = capture_body(&encoded, BodyEncoding::Base64, 4);
        assert!(captured.len() <= 4);
        assert!(std::str::from_utf8(captured.as_bytes()).is_ok());
    }
}
