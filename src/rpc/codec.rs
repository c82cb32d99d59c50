//! Argument codec: MessagePack values with per-field framing.
//!
//! Every argument and return value travels as one *field*:
//!
//! ```text
//! ┌─────────────┬────────────┬──────────────────┐
//! │ field_index │ u32 LE len │ MessagePack body │
//! │ 1 byte      │ 4 bytes    │ len bytes        │
//! └─────────────┴────────────┴──────────────────┘
//! ```
//!
//! The field index of an argument equals its positional index; return
//! values use index 0. Uses `to_vec_named` so maps stay self-describing
//! across heterogeneous peers.
//!
//! # Example
//!
//! ```
//! use postwire::rpc::FieldCodec;
//!
//! let field = FieldCodec::encode(&42i64, 1).unwrap();
//! let value: i64 = FieldCodec::decode(&field, 1).unwrap();
//! assert_eq!(value, 42);
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, WireError};

/// Bytes of framing in front of each field body.
pub const FIELD_HEADER_LEN: usize = 5;

/// MessagePack codec with per-field length-prefix framing.
pub struct FieldCodec;

impl FieldCodec {
    /// Encode a value as the field at `field_index`.
    pub fn encode<T: Serialize>(value: &T, field_index: u8) -> Result<Bytes> {
        let body = rmp_serde::to_vec_named(value)?;
        let mut buf = BytesMut::with_capacity(FIELD_HEADER_LEN + body.len());
        buf.put_u8(field_index);
        buf.put_u32_le(body.len() as u32);
        buf.extend_from_slice(&body);
        Ok(buf.freeze())
    }

    /// Decode the field, checking it carries the expected index.
    pub fn decode<T: DeserializeOwned>(field: &[u8], field_index: u8) -> Result<T> {
        let body = Self::body(field, field_index)?;
        Ok(rmp_serde::from_slice(body)?)
    }

    /// Split a field into its validated body.
    pub fn body(field: &[u8], field_index: u8) -> Result<&[u8]> {
        if field.len() < FIELD_HEADER_LEN {
            return Err(WireError::Protocol("truncated codec field".to_string()));
        }
        if field[0] != field_index {
            return Err(WireError::Protocol(format!(
                "field index {} where {} was expected",
                field[0], field_index
            )));
        }
        let declared =
            u32::from_le_bytes([field[1], field[2], field[3], field[4]]) as usize;
        let body = &field[FIELD_HEADER_LEN..];
        if body.len() != declared {
            return Err(WireError::Protocol(format!(
                "field declares {declared} bytes, carries {}",
                body.len()
            )));
        }
        Ok(body)
    }

    /// Total length of the field starting at `bytes`, if its header is
    /// complete.
    pub fn field_len(bytes: &[u8]) -> Option<usize> {
        if bytes.len() < FIELD_HEADER_LEN {
            return None;
        }
        let declared = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize;
        Some(FIELD_HEADER_LEN + declared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Point {
        x: i32,
        y: i32,
    }

    #[test]
    fn test_roundtrip_scalar() {
        let field = FieldCodec::encode(&"hello", 0).unwrap();
        let value: String = FieldCodec::decode(&field, 0).unwrap();
        assert_eq!(value, "hello");
    }

    #[test]
    fn test_roundtrip_struct() {
        let point = Point { x: -3, y: 7 };
        let field = FieldCodec::encode(&point, 4).unwrap();
        let decoded: Point = FieldCodec::decode(&field, 4).unwrap();
        assert_eq!(decoded, point);
    }

    #[test]
    fn test_header_layout() {
        let field = FieldCodec::encode(&0u8, 9).unwrap();
        assert_eq!(field[0], 9);
        let declared =
            u32::from_le_bytes([field[1], field[2], field[3], field[4]]) as usize;
        assert_eq!(declared, field.len() - FIELD_HEADER_LEN);
    }

    #[test]
    fn test_index_mismatch_rejected() {
        let field = FieldCodec::encode(&1i32, 2).unwrap();
        let err = FieldCodec::decode::<i32>(&field, 3).unwrap_err();
        assert!(matches!(err, WireError::Protocol(_)));
    }

    #[test]
    fn test_truncated_field_rejected() {
        let field = FieldCodec::encode(&1i32, 0).unwrap();
        let err = FieldCodec::decode::<i32>(&field[..field.len() - 1], 0).unwrap_err();
        assert!(matches!(err, WireError::Protocol(_)));
    }

    #[test]
    fn test_short_header_rejected() {
        let err = FieldCodec::decode::<i32>(&[0, 1], 0).unwrap_err();
        assert!(matches!(err, WireError::Protocol(_)));
    }

    #[test]
    fn test_field_len_reads_header() {
        let field = FieldCodec::encode(&[1u8, 2, 3], 0).unwrap();
        assert_eq!(FieldCodec::field_len(&field), Some(field.len()));
        assert_eq!(FieldCodec::field_len(&field[..3]), None);
    }
}
