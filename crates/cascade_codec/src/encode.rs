//! Order-preserving key encoding.

use crate::error::{CodecError, CodecResult};
use crate::key::{Key, MAX_EXACT_INT};
use crate::COMPOSITE_SEPARATOR;

/// Type tag for numbers. Numbers sort before strings.
pub(crate) const TAG_NUMBER: u8 = 0x10;

/// Type tag for strings.
pub(crate) const TAG_TEXT: u8 = 0x12;

/// Escape lead for string bytes below `0x20`.
///
/// The lead sorts below every literal byte, and escaped bytes are exactly
/// those below every literal byte, so escaping preserves order.
pub(crate) const ESCAPE: u8 = 0x01;

/// Offset added to an escaped byte to lift it out of the control range.
pub(crate) const ESCAPE_OFFSET: u8 = 0x20;

/// Encodes one key to its order-preserving byte form.
///
/// # Errors
///
/// Returns an error for integers beyond the exact range or non-finite
/// floats.
pub fn encode_key(key: &Key) -> CodecResult<Vec<u8>> {
    let mut out = Vec::with_capacity(9);
    encode_into(key, &mut out)?;
    Ok(out)
}

/// Encodes a composite key: parts joined with the `0x1E` separator.
///
/// # Errors
///
/// Returns an error if any part fails to encode.
pub fn encode_composite(parts: &[Key]) -> CodecResult<Vec<u8>> {
    let mut out = Vec::with_capacity(parts.len() * 10);
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            out.push(COMPOSITE_SEPARATOR);
        }
        encode_into(part, &mut out)?;
    }
    Ok(out)
}

/// Returns the exclusive upper bound for scanning every composite key
/// that starts with `encoded_prefix`.
#[must_use]
pub fn prefix_upper_bound(encoded_prefix: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(encoded_prefix.len() + 1);
    out.extend_from_slice(encoded_prefix);
    out.push(crate::RANGE_END);
    out
}

fn encode_into(key: &Key, out: &mut Vec<u8>) -> CodecResult<()> {
    match key {
        Key::Int(i) => {
            if i.unsigned_abs() > MAX_EXACT_INT as u64 {
                return Err(CodecError::IntOutOfRange { value: *i });
            }
            #[allow(clippy::cast_precision_loss)]
            encode_number(*i as f64, out);
            Ok(())
        }
        Key::Float(f) => {
            if !f.is_finite() {
                return Err(CodecError::NonFiniteNumber);
            }
            encode_number(*f, out);
            Ok(())
        }
        Key::Text(s) => {
            out.push(TAG_TEXT);
            for &b in s.as_bytes() {
                if b < ESCAPE_OFFSET {
                    out.push(ESCAPE);
                    out.push(b + ESCAPE_OFFSET);
                } else {
                    out.push(b);
                }
            }
            Ok(())
        }
    }
}

/// Writes the 9-byte number encoding: tag, then the big-endian
/// order-preserving transform of the IEEE-754 bits (sign bit flipped for
/// non-negative values, all bits flipped for negative ones).
fn encode_number(value: f64, out: &mut Vec<u8>) {
    // Canonical keys collapse -0.0 to Int(0); guard anyway so the two
    // zeros share one encoding.
    let value = if value == 0.0 { 0.0 } else { value };
    let bits = value.to_bits();
    let ordered = if value >= 0.0 {
        bits ^ (1 << 63)
    } else {
        !bits
    };
    out.push(TAG_NUMBER);
    out.extend_from_slice(&ordered.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enc(key: Key) -> Vec<u8> {
        encode_key(&key).unwrap()
    }

    #[test]
    fn number_order() {
        let values = [-1e9, -2.5, -1.0, 0.0, 0.5, 1.0, 42.0, 1e9];
        let mut encoded: Vec<Vec<u8>> =
            values.iter().map(|v| enc(Key::from_f64(*v))).collect();
        let sorted = encoded.clone();
        encoded.sort();
        assert_eq!(encoded, sorted);
    }

    #[test]
    fn text_order_with_control_bytes() {
        let a = enc(Key::Text("a\u{5}".into()));
        let b = enc(Key::Text("ab".into()));
        let c = enc(Key::Text("a".into()));
        assert!(c < a, "prefix sorts first");
        assert!(a < b, "escaped control byte sorts below 'b'");
    }

    #[test]
    fn encodings_start_above_reserved_range() {
        for key in [Key::Int(1), Key::Float(0.5), Key::Text("x".into())] {
            assert!(enc(key)[0] >= 0x02);
        }
    }

    #[test]
    fn no_separator_bytes_leak_into_strings() {
        let bytes = enc(Key::Text("\u{1e}\u{1f}".into()));
        assert!(!bytes[1..].contains(&crate::COMPOSITE_SEPARATOR));
        assert!(!bytes[1..].contains(&crate::RANGE_END));
    }

    #[test]
    fn int_out_of_range_rejected() {
        let err = encode_key(&Key::Int(MAX_EXACT_INT + 1)).unwrap_err();
        assert_eq!(
            err,
            CodecError::IntOutOfRange {
                value: MAX_EXACT_INT + 1
            }
        );
    }
}
