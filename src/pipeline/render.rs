//! Emoji code decoding and top-N rendering.
//!
//! Codes are upper- or lower-case hexadecimal code points. Two code points
//! joined by a hyphen (`1F1FA-1F1F8`) form a composed glyph such as a flag
//! or a skin-tone pair; anything longer is rejected rather than guessed at.

use thiserror::Error;

use super::top::TopView;

/// Separator between the code points of a composed glyph.
const PART_SEPARATOR: char = '-';

/// Errors that can occur while decoding an emoji code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("empty code")]
    Empty,

    #[error("code {code:?}: {part:?} is not a hexadecimal number")]
    InvalidHex { code: String, part: String },

    #[error("code {code:?}: {parts} hyphen-separated parts, at most 2 supported")]
    TooManyParts { code: String, parts: usize },

    #[error("code {code:?}: {value:#X} is not a valid code point")]
    InvalidCodePoint { code: String, value: u32 },
}

/// Decode one emoji code into its glyph sequence.
pub fn decode(code: &str) -> Result<String, DecodeError> {
    if code.is_empty() {
        return Err(DecodeError::Empty);
    }

    let parts: Vec<&str> = code.split(PART_SEPARATOR).collect();
    match parts.as_slice() {
        [single] => decode_code_point(code, single).map(String::from),
        [first, second] => {
            let mut glyphs = String::with_capacity(8);
            glyphs.push(decode_code_point(code, first)?);
            glyphs.push(decode_code_point(code, second)?);
            Ok(glyphs)
        }
        _ => Err(DecodeError::TooManyParts {
            code: code.to_string(),
            parts: parts.len(),
        }),
    }
}

/// Concatenate the glyphs of every key in `view`, in view order.
///
/// The first malformed key fails the whole render.
pub fn render(view: &TopView) -> Result<String, DecodeError> {
    let mut out = String::with_capacity(view.len() * 4);
    for code in view.keys() {
        out.push_str(&decode(code)?);
    }
    Ok(out)
}

fn decode_code_point(code: &str, part: &str) -> Result<char, DecodeError> {
    // `from_str_radix` tolerates a leading sign, so check the digits first.
    if part.is_empty() || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(invalid_hex(code, part));
    }

    let value = u32::from_str_radix(part, 16).map_err(|_| invalid_hex(code, part))?;

    // Control characters are not glyphs, and CR/LF cannot travel in an SSE field.
    char::from_u32(value)
        .filter(|c| !c.is_control())
        .ok_or_else(|| DecodeError::InvalidCodePoint {
            code: code.to_string(),
            value,
        })
}

fn invalid_hex(code: &str, part: &str) -> DecodeError {
    DecodeError::InvalidHex {
        code: code.to_string(),
        part: part.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_single_code_point() {
        assert_eq!(decode("1F600").expect("valid code"), "\u{1F600}");
        assert_eq!(decode("2764").expect("valid code"), "\u{2764}");
    }

    #[test]
    fn test_decode_lowercase_hex() {
        assert_eq!(decode("1f602").expect("valid code"), "\u{1F602}");
    }

    #[test]
    fn test_decode_flag_pair() {
        let flag = decode("1F1FA-1F1F8").expect("valid pair");
        assert_eq!(flag, "\u{1F1FA}\u{1F1F8}");
        assert_eq!(flag.chars().count(), 2);
    }

    #[test]
    fn test_decode_rejects_control_characters() {
        for code in ["D", "a", "0", "7F", "85", "1F600-D"] {
            assert!(
                matches!(decode(code), Err(DecodeError::InvalidCodePoint { .. })),
                "{code} should be rejected"
            );
        }
    }

    #[test]
    fn test_decode_empty() {
        assert_eq!(decode(""), Err(DecodeError::Empty));
    }

    #[test]
    fn test_decode_not_hex() {
        let err = decode("zz").expect_err("should fail");
        assert!(matches!(err, DecodeError::InvalidHex { ref part, .. } if part == "zz"));
    }

    #[test]
    fn test_decode_rejects_sign_prefix() {
        assert!(matches!(
            decode("+1F600"),
            Err(DecodeError::InvalidHex { .. })
        ));
    }

    #[test]
    fn test_decode_pair_with_empty_half() {
        assert!(matches!(
            decode("1F1FA-"),
            Err(DecodeError::InvalidHex { .. })
        ));
    }

    #[test]
    fn test_decode_three_parts_rejected() {
        let err = decode("1F468-200D-1F469").expect_err("should fail");
        assert_eq!(
            err,
            DecodeError::TooManyParts {
                code: "1F468-200D-1F469".to_string(),
                parts: 3,
            }
        );
    }

    #[test]
    fn test_decode_surrogate_rejected() {
        assert!(matches!(
            decode("D800"),
            Err(DecodeError::InvalidCodePoint { value: 0xD800, .. })
        ));
    }

    #[test]
    fn test_decode_out_of_range_rejected() {
        assert!(matches!(
            decode("110000"),
            Err(DecodeError::InvalidCodePoint { .. })
        ));
        assert!(matches!(
            decode("FFFFFFFFFF"),
            Err(DecodeError::InvalidHex { .. })
        ));
    }

    #[test]
    fn test_render_keeps_view_order() {
        let mut view = TopView::new();
        view.insert("1F602".to_string(), 9);
        view.insert("1F1FA-1F1F8".to_string(), 4);
        view.insert("2764".to_string(), 1);

        assert_eq!(
            render(&view).expect("valid view"),
            "\u{1F602}\u{1F1FA}\u{1F1F8}\u{2764}"
        );
    }

    #[test]
    fn test_render_empty_view() {
        assert_eq!(render(&TopView::new()).expect("empty view"), "");
    }

    #[test]
    fn test_render_fails_on_malformed_key() {
        let mut view = TopView::new();
        view.insert("1F600".to_string(), 2);
        view.insert("nope".to_string(), 1);

        assert!(render(&view).is_err());
    }
}
