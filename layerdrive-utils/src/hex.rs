//! Text encoding for `f32` tensors.
//!
//! Every value is written as the marker `h` followed by the eight hex digits of its big-endian
//! IEEE-754 bit pattern, e.g. `h3f800000` for `1.0`. Tokens are separated by arbitrary
//! whitespace. Encoding works on raw bits, so NaN payloads, signed zeros and infinities survive
//! a decode/encode cycle unchanged.

use std::fmt::Write as _;

use thiserror::Error;

/// Leading character of every encoded value.
pub const HEX_MARKER: char = 'h';

const HEX_DIGITS: usize = 8;
const VALUES_PER_LINE: usize = 8;

/// Errors raised while decoding hex tensor text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HexError {
    #[error("token {index} ('{token}') does not start with the 'h' marker")]
    MissingMarker { index: usize, token: String },
    #[error("token {index} ('{token}') has {digits} hex digits, expected 8")]
    DigitCount {
        index: usize,
        token: String,
        digits: usize,
    },
    #[error("token {index} ('{token}') contains a non-hex digit")]
    InvalidDigit { index: usize, token: String },
}

/// Encode one value as `h` + 8 lowercase hex digits.
pub fn encode_value(value: f32) -> String {
    format!("{HEX_MARKER}{:08x}", value.to_bits())
}

/// Decode a single token into its exact `f32` bit pattern.
pub fn decode_token(token: &str) -> Result<f32, HexError> {
    decode_indexed(0, token)
}

/// Decode whitespace separated tokens into a flat tensor.
///
/// Empty (or whitespace only) text yields an empty tensor; callers check lengths against the
/// shape they expect.
pub fn decode_tensor(text: &str) -> Result<Vec<f32>, HexError> {
    text.split_whitespace()
        .enumerate()
        .map(|(index, token)| decode_indexed(index, token))
        .collect()
}

/// Encode a tensor with eight values per line and a trailing newline.
pub fn encode_tensor(values: &[f32]) -> String {
    // "h" + 8 digits + separator
    let mut out = String::with_capacity(values.len() * (HEX_DIGITS + 2));
    for (index, value) in values.iter().enumerate() {
        if index > 0 {
            out.push(if index % VALUES_PER_LINE == 0 { '\n' } else { ' ' });
        }
        let _ = write!(out, "{HEX_MARKER}{:08x}", value.to_bits());
    }
    if !values.is_empty() {
        out.push('\n');
    }
    out
}

fn decode_indexed(index: usize, token: &str) -> Result<f32, HexError> {
    let Some(digits) = token.strip_prefix(HEX_MARKER) else {
        return Err(HexError::MissingMarker {
            index,
            token: token.to_string(),
        });
    };
    // from_str_radix tolerates a leading '+', which is not a digit here. Checked before the
    // count so byte length equals digit count below.
    if !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(HexError::InvalidDigit {
            index,
            token: token.to_string(),
        });
    }
    if digits.len() != HEX_DIGITS {
        return Err(HexError::DigitCount {
            index,
            token: token.to_string(),
            digits: digits.len(),
        });
    }
    u32::from_str_radix(digits, 16)
        .map(f32::from_bits)
        .map_err(|_| HexError::InvalidDigit {
            index,
            token: token.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_decodes_exactly() {
        assert_eq!(decode_token("h3f800000").unwrap(), 1.0);
        assert_eq!(encode_value(1.0), "h3f800000");
        assert_eq!(decode_token("h3F800000").unwrap(), 1.0);
    }

    #[test]
    fn special_values_keep_their_bits() {
        let patterns = [
            0x0000_0000u32, // +0
            0x8000_0000,    // -0
            0x7f80_0000,    // +inf
            0xff80_0000,    // -inf
            0x7fc0_0000,    // quiet NaN
            0x7f80_0001,    // signalling NaN payload
            0xffff_ffff,    // negative NaN, full payload
            0x0000_0001,    // smallest subnormal
            0x7f7f_ffff,    // f32::MAX
        ];
        for bits in patterns {
            let token = encode_value(f32::from_bits(bits));
            let decoded = decode_token(&token).unwrap();
            assert_eq!(decoded.to_bits(), bits, "token {token}");
        }
    }

    #[test]
    fn strided_sweep_preserves_every_pattern() {
        // A prime stride walks every exponent and a wide spread of mantissas.
        let mut bits = 0u32;
        loop {
            let token = format!("h{bits:08x}");
            assert_eq!(decode_token(&token).unwrap().to_bits(), bits);
            assert_eq!(encode_value(f32::from_bits(bits)), token);
            match bits.checked_add(65_521) {
                Some(next) => bits = next,
                None => break,
            }
        }
    }

    #[test]
    fn tensor_text_accepts_mixed_whitespace() {
        let text = "h3f800000 h40000000\nh40400000\t\th40800000\r\n";
        assert_eq!(decode_tensor(text).unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
        assert!(decode_tensor("  \n").unwrap().is_empty());
    }

    #[test]
    fn tensor_encoding_wraps_lines() {
        let values: Vec<f32> = (0..10).map(|i| i as f32).collect();
        let text = encode_tensor(&values);
        assert_eq!(text.lines().count(), 2);
        assert!(text.ends_with('\n'));
        assert_eq!(decode_tensor(&text).unwrap(), values);
        assert_eq!(encode_tensor(&[]), "");
    }

    #[test]
    fn malformed_tokens_report_position() {
        let err = decode_tensor("h3f800000 3f800000").unwrap_err();
        assert_eq!(
            err,
            HexError::MissingMarker {
                index: 1,
                token: "3f800000".into()
            }
        );

        let err = decode_token("h3f80").unwrap_err();
        assert!(matches!(err, HexError::DigitCount { digits: 4, .. }));

        let err = decode_token("h3f80000g").unwrap_err();
        assert!(matches!(err, HexError::InvalidDigit { .. }));

        let err = decode_token("h+3f80000").unwrap_err();
        assert!(matches!(err, HexError::InvalidDigit { .. }));
    }

    #[test]
    fn non_ascii_digits_are_invalid_not_miscounted() {
        // 'é' is two bytes, so the token is nine bytes but eight chars after the marker.
        let err = decode_token("h\u{e9}3f80000").unwrap_err();
        assert!(matches!(err, HexError::InvalidDigit { index: 0, .. }));

        let err = decode_token("h\u{e9}3f8000").unwrap_err();
        assert!(matches!(err, HexError::InvalidDigit { .. }));

        let err = decode_token("h3f8000000").unwrap_err();
        assert!(matches!(err, HexError::DigitCount { digits: 9, .. }));
    }
}
