//! Order-preserving key codec for Cascade.
//!
//! Keys encode to byte strings whose lexicographic order equals the
//! semantic order of the values: numbers sort before strings, numbers
//! compare numerically, strings compare by Unicode scalar order.
//! Decoding is an exact round-trip for every canonical [`Key`].
//!
//! Composite keys join the encodings of their parts with the `0x1E`
//! separator byte. A range scan over everything under one leading part
//! uses the encoded part as its lower bound and the encoded part followed
//! by `0x1F` as its upper bound; the encoding guarantees no other key
//! ever lands inside that window.
//!
//! # Invariants
//!
//! - `decode(encode(k)) == k` for every canonical key
//! - `encode(a) < encode(b)` iff `a < b`
//! - Every encoding starts with a tag byte `>= 0x10`
//! - No encoding contains `0x1E` or `0x1F` after a full-key prefix

mod decode;
mod encode;
mod error;
mod key;

pub use decode::{decode_composite, decode_key};
pub use encode::{encode_composite, encode_key, prefix_upper_bound};
pub use error::{CodecError, CodecResult};
pub use key::Key;

/// Separator byte between the parts of a composite key.
pub const COMPOSITE_SEPARATOR: u8 = 0x1E;

/// Exclusive upper-bound byte for prefix range scans.
///
/// `encoded_part ++ [RANGE_END]` sorts after every composite key that
/// starts with `encoded_part ++ [COMPOSITE_SEPARATOR]`.
pub const RANGE_END: u8 = 0x1F;
