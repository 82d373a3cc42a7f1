//! Wire format for values stored in queue items.
//!
//! Each queue item holds one encoded value in a single allocation:
//!
//! ```text
//! ┌─────┬──────────────────────────────────┐
//! │ tag │ payload                          │
//! ├─────┼──────────────────────────────────┤
//! │ 0   │ (none)            TRUE           │
//! │ 1   │ (none)            FALSE          │
//! │ 2   │ usize LE          LIGHT_POINTER  │
//! │ 3   │ f64 bits LE       NUMBER         │
//! │ 4   │ i64 LE            INTEGER        │
//! │ 5   │ u64 LE length, then raw bytes    │
//! └─────┴──────────────────────────────────┘
//! ```
//!
//! Integers and floats are fixed width; strings carry a length prefix
//! with the bytes immediately following in the same buffer. Decoding is
//! strict: unknown tags, short buffers, and trailing bytes are errors.
//! Round-trips are bit-exact for every tag, including NaN floats and the
//! empty string.

use crate::value::Value;

/// Wire tag for boolean true.
pub const TAG_TRUE: u8 = 0;
/// Wire tag for boolean false.
pub const TAG_FALSE: u8 = 1;
/// Wire tag for a transparent opaque pointer.
pub const TAG_LIGHT_POINTER: u8 = 2;
/// Wire tag for a 64-bit float.
pub const TAG_NUMBER: u8 = 3;
/// Wire tag for a 64-bit signed integer.
pub const TAG_INTEGER: u8 = 4;
/// Wire tag for a length-prefixed byte string.
pub const TAG_STRING: u8 = 5;

const PTR_WIDTH: usize = std::mem::size_of::<usize>();

/// Decoding failure.
///
/// A decode failure on a buffer that came out of a queue is an internal
/// invariant violation: only [`encode`] produces queue payloads.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// The buffer ended before the payload the tag promised.
    #[error("value truncated: need {need} bytes, have {have}")]
    Truncated {
        /// Bytes the tag's payload requires.
        need: usize,
        /// Bytes actually present.
        have: usize,
    },
    /// The first byte is not a known tag.
    #[error("unknown value tag: {0}")]
    UnknownTag(u8),
    /// Extra bytes follow a complete value.
    #[error("trailing bytes after value: {0}")]
    TrailingBytes(usize),
    /// The buffer is empty.
    #[error("empty value buffer")]
    Empty,
}

/// Encodes a value into its single-allocation wire form.
#[must_use]
pub fn encode(value: &Value) -> Box<[u8]> {
    match value {
        Value::Bool(true) => Box::new([TAG_TRUE]),
        Value::Bool(false) => Box::new([TAG_FALSE]),
        Value::LightPtr(bits) => {
            let mut buf = Vec::with_capacity(1 + PTR_WIDTH);
            buf.push(TAG_LIGHT_POINTER);
            buf.extend_from_slice(&bits.to_le_bytes());
            buf.into_boxed_slice()
        }
        Value::Number(n) => {
            let mut buf = Vec::with_capacity(1 + 8);
            buf.push(TAG_NUMBER);
            buf.extend_from_slice(&n.to_bits().to_le_bytes());
            buf.into_boxed_slice()
        }
        Value::Integer(i) => {
            let mut buf = Vec::with_capacity(1 + 8);
            buf.push(TAG_INTEGER);
            buf.extend_from_slice(&i.to_le_bytes());
            buf.into_boxed_slice()
        }
        Value::Str(bytes) => {
            let mut buf = Vec::with_capacity(1 + 8 + bytes.len());
            buf.push(TAG_STRING);
            buf.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
            buf.extend_from_slice(bytes);
            buf.into_boxed_slice()
        }
    }
}

fn fixed<const N: usize>(payload: &[u8]) -> Result<[u8; N], CodecError> {
    payload
        .get(..N)
        .and_then(|s| <[u8; N]>::try_from(s).ok())
        .ok_or(CodecError::Truncated {
            need: N,
            have: payload.len(),
        })
}

fn exact_len(tag_payload: usize, have: usize) -> Result<(), CodecError> {
    match have.cmp(&tag_payload) {
        std::cmp::Ordering::Less => Err(CodecError::Truncated {
            need: tag_payload,
            have,
        }),
        std::cmp::Ordering::Greater => Err(CodecError::TrailingBytes(have - tag_payload)),
        std::cmp::Ordering::Equal => Ok(()),
    }
}

/// Decodes a value from its wire form.
///
/// # Errors
///
/// Returns [`CodecError`] on an empty buffer, unknown tag, truncated
/// payload, or trailing bytes.
pub fn decode(buf: &[u8]) -> Result<Value, CodecError> {
    let (&tag, payload) = buf.split_first().ok_or(CodecError::Empty)?;
    match tag {
        TAG_TRUE => {
            exact_len(0, payload.len())?;
            Ok(Value::Bool(true))
        }
        TAG_FALSE => {
            exact_len(0, payload.len())?;
            Ok(Value::Bool(false))
        }
        TAG_LIGHT_POINTER => {
            exact_len(PTR_WIDTH, payload.len())?;
            let bits = usize::from_le_bytes(fixed::<PTR_WIDTH>(payload)?);
            Ok(Value::LightPtr(bits))
        }
        TAG_NUMBER => {
            exact_len(8, payload.len())?;
            let bits = u64::from_le_bytes(fixed::<8>(payload)?);
            Ok(Value::Number(f64::from_bits(bits)))
        }
        TAG_INTEGER => {
            exact_len(8, payload.len())?;
            Ok(Value::Integer(i64::from_le_bytes(fixed::<8>(payload)?)))
        }
        TAG_STRING => {
            let len = u64::from_le_bytes(fixed::<8>(payload)?);
            let len = usize::try_from(len).map_err(|_| CodecError::Truncated {
                need: usize::MAX,
                have: payload.len(),
            })?;
            exact_len(8usize.saturating_add(len), payload.len())?;
            Ok(Value::Str(payload[8..].into()))
        }
        other => Err(CodecError::UnknownTag(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(value: Value) {
        let encoded = encode(&value);
        let decoded = decode(&encoded).expect("decode failed");
        match (&value, &decoded) {
            // NaN != NaN under PartialEq; compare bit patterns instead.
            (Value::Number(a), Value::Number(b)) => assert_eq!(a.to_bits(), b.to_bits()),
            _ => assert_eq!(value, decoded),
        }
    }

    #[test]
    fn round_trips_every_tag() {
        round_trip(Value::Bool(true));
        round_trip(Value::Bool(false));
        round_trip(Value::Integer(0));
        round_trip(Value::Integer(i64::MIN));
        round_trip(Value::Integer(i64::MAX));
        round_trip(Value::Number(0.0));
        round_trip(Value::Number(-0.0));
        round_trip(Value::Number(f64::INFINITY));
        round_trip(Value::Number(f64::NAN));
        round_trip(Value::from(""));
        round_trip(Value::from("hello"));
        round_trip(Value::from(vec![0u8, 255, 128, 7]));
        round_trip(Value::from("x".repeat(1 << 16)));
        round_trip(Value::LightPtr(0));
        round_trip(Value::LightPtr(usize::MAX));
    }

    #[test]
    fn booleans_are_one_byte() {
        assert_eq!(&*encode(&Value::Bool(true)), &[TAG_TRUE]);
        assert_eq!(&*encode(&Value::Bool(false)), &[TAG_FALSE]);
    }

    #[test]
    fn string_layout_is_tag_length_bytes() {
        let encoded = encode(&Value::from("ab"));
        assert_eq!(encoded[0], TAG_STRING);
        assert_eq!(u64::from_le_bytes(encoded[1..9].try_into().unwrap()), 2);
        assert_eq!(&encoded[9..], b"ab");
    }

    #[test]
    fn rejects_empty_buffer() {
        assert_eq!(decode(&[]), Err(CodecError::Empty));
    }

    #[test]
    fn rejects_unknown_tag() {
        assert_eq!(decode(&[42]), Err(CodecError::UnknownTag(42)));
    }

    #[test]
    fn rejects_truncated_integer() {
        let err = decode(&[TAG_INTEGER, 1, 2, 3]).expect_err("should fail");
        assert_eq!(err, CodecError::Truncated { need: 8, have: 3 });
    }

    #[test]
    fn rejects_trailing_bytes() {
        let mut encoded = encode(&Value::Bool(true)).into_vec();
        encoded.push(0);
        assert_eq!(decode(&encoded), Err(CodecError::TrailingBytes(1)));
    }

    #[test]
    fn rejects_short_string_body() {
        let mut buf = vec![TAG_STRING];
        buf.extend_from_slice(&5u64.to_le_bytes());
        buf.extend_from_slice(b"abc");
        let err = decode(&buf).expect_err("should fail");
        assert_eq!(err, CodecError::Truncated { need: 13, have: 11 });
    }
}
