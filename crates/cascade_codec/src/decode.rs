//! Key decoding.

use crate::encode::{ESCAPE, ESCAPE_OFFSET, TAG_NUMBER, TAG_TEXT};
use crate::error::{CodecError, CodecResult};
use crate::key::Key;
use crate::COMPOSITE_SEPARATOR;

/// Decodes a single key, rejecting trailing bytes.
///
/// # Errors
///
/// Returns an error on empty, truncated, or malformed input.
pub fn decode_key(bytes: &[u8]) -> CodecResult<Key> {
    let (key, consumed) = decode_one(bytes)?;
    if consumed != bytes.len() {
        return Err(CodecError::TrailingBytes);
    }
    Ok(key)
}

/// Decodes a composite key into its parts.
///
/// This is the flagged decode the indexer uses to recover
/// `(index_key, source_id)` from an index row key.
///
/// # Errors
///
/// Returns an error if any part is malformed or parts are not joined by
/// the composite separator.
pub fn decode_composite(bytes: &[u8]) -> CodecResult<Vec<Key>> {
    if bytes.is_empty() {
        return Err(CodecError::Empty);
    }
    let mut parts = Vec::with_capacity(2);
    let mut offset = 0;
    loop {
        let (key, consumed) = decode_one(&bytes[offset..])?;
        parts.push(key);
        offset += consumed;
        if offset == bytes.len() {
            return Ok(parts);
        }
        if bytes[offset] != COMPOSITE_SEPARATOR {
            return Err(CodecError::MissingSeparator { offset });
        }
        offset += 1;
    }
}

/// Decodes one key from the front of `bytes`, returning it with the
/// number of bytes consumed.
fn decode_one(bytes: &[u8]) -> CodecResult<(Key, usize)> {
    let Some(&tag) = bytes.first() else {
        return Err(CodecError::Empty);
    };
    match tag {
        TAG_NUMBER => {
            if bytes.len() < 9 {
                return Err(CodecError::Truncated);
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[1..9]);
            let ordered = u64::from_be_bytes(raw);
            let bits = if ordered & (1 << 63) != 0 {
                ordered ^ (1 << 63)
            } else {
                !ordered
            };
            Ok((Key::from_f64(f64::from_bits(bits)), 9))
        }
        TAG_TEXT => {
            let mut raw = Vec::new();
            let mut i = 1;
            while i < bytes.len() {
                let b = bytes[i];
                if b == COMPOSITE_SEPARATOR {
                    break;
                }
                if b == ESCAPE {
                    let Some(&escaped) = bytes.get(i + 1) else {
                        return Err(CodecError::Truncated);
                    };
                    if !(ESCAPE_OFFSET..ESCAPE_OFFSET * 2).contains(&escaped) {
                        return Err(CodecError::InvalidEscape(escaped));
                    }
                    raw.push(escaped - ESCAPE_OFFSET);
                    i += 2;
                } else {
                    raw.push(b);
                    i += 1;
                }
            }
            let text = String::from_utf8(raw).map_err(|_| CodecError::InvalidUtf8)?;
            Ok((Key::Text(text), i))
        }
        other => Err(CodecError::InvalidTag(other)),
    }
}
