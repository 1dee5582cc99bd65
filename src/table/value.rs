//! # Typed Values and the Row Codec
//!
//! A cell value is a tagged union over bytes and 64-bit integers. Rows
//! are encoded as sequences of length-framed values:
//!
//! ```text
//! | len (4B big-endian) | tag (1B) | payload | len | tag | payload | ...
//! ```
//!
//! The payload is the raw bytes for `Bytes` and an 8-byte big-endian
//! two's-complement integer for `Int64`. A row's B+tree key is the 4-byte
//! big-endian table prefix followed by the framed primary-key values;
//! big-endian ordering on the prefix keeps each table's rows contiguous
//! in the tree's lexicographic key space.

use eyre::{bail, ensure, Result};
use serde::{Deserialize, Serialize};

/// Prefix of the internal metadata table (`@meta`).
pub const TABLE_PREFIX_META: u32 = 1;
/// Prefix of the internal table-definitions table (`@table`).
pub const TABLE_PREFIX_TABLE: u32 = 2;
/// First prefix handed out to user tables.
pub const TABLE_PREFIX_MIN: u32 = 3;

const TAG_BYTES: u8 = 1;
const TAG_INT64: u8 = 2;

/// Declared type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueType {
    Bytes,
    Int64,
}

/// A single cell value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    Bytes(Vec<u8>),
    Int64(i64),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Bytes(_) => ValueType::Bytes,
            Value::Int64(_) => ValueType::Int64,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            Value::Int64(_) => None,
        }
    }

    pub fn as_int64(&self) -> Option<i64> {
        match self {
            Value::Int64(i) => Some(*i),
            Value::Bytes(_) => None,
        }
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Value::Bytes(b) => {
                out.push(TAG_BYTES);
                out.extend_from_slice(b);
            }
            Value::Int64(i) => {
                out.push(TAG_INT64);
                out.extend_from_slice(&i.to_be_bytes());
            }
        }
    }

    fn decode(data: &[u8]) -> Result<Value> {
        ensure!(!data.is_empty(), "empty value encoding");
        match data[0] {
            TAG_BYTES => Ok(Value::Bytes(data[1..].to_vec())),
            TAG_INT64 => {
                ensure!(
                    data.len() == 9,
                    "int64 value encoding has {} bytes, expected 9",
                    data.len()
                );
                Ok(Value::Int64(i64::from_be_bytes(data[1..9].try_into().unwrap())))
            }
            tag => bail!("unknown value tag {}", tag),
        }
    }
}

/// Appends values to `out`, each framed by a 4-byte big-endian length.
pub fn encode_values(out: &mut Vec<u8>, vals: &[Value]) {
    for val in vals {
        let mut encoded = Vec::new();
        val.encode_into(&mut encoded);
        out.extend_from_slice(&(encoded.len() as u32).to_be_bytes());
        out.extend_from_slice(&encoded);
    }
}

/// Decodes exactly `n` framed values.
pub fn decode_values(mut data: &[u8], n: usize) -> Result<Vec<Value>> {
    let mut vals = Vec::with_capacity(n);
    for _ in 0..n {
        ensure!(data.len() >= 4, "truncated value frame");
        let len = u32::from_be_bytes(data[..4].try_into().unwrap()) as usize;
        ensure!(data.len() >= 4 + len, "value frame of {} bytes truncated", len);
        vals.push(Value::decode(&data[4..4 + len])?);
        data = &data[4 + len..];
    }
    ensure!(data.is_empty(), "{} trailing bytes after values", data.len());
    Ok(vals)
}

/// Builds a row's B+tree key: the big-endian table prefix followed by the
/// framed primary-key values.
pub fn encode_key(prefix: u32, vals: &[Value]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&prefix.to_be_bytes());
    encode_values(&mut out, vals);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_round_trip() {
        let vals = vec![
            Value::Bytes(b"Alice".to_vec()),
            Value::Int64(333),
            Value::Int64(-1),
            Value::Int64(i64::MIN),
            Value::Bytes(Vec::new()),
            Value::Bytes(b"Bob".to_vec()),
        ];

        let mut encoded = Vec::new();
        encode_values(&mut encoded, &vals);
        let decoded = decode_values(&encoded, vals.len()).unwrap();

        assert_eq!(decoded, vals);
    }

    #[test]
    fn decode_rejects_truncated_input() {
        let mut encoded = Vec::new();
        encode_values(&mut encoded, &[Value::Int64(7)]);

        assert!(decode_values(&encoded[..encoded.len() - 1], 1).is_err());
        assert!(decode_values(&encoded[..2], 1).is_err());
    }

    #[test]
    fn decode_rejects_trailing_garbage() {
        let mut encoded = Vec::new();
        encode_values(&mut encoded, &[Value::Int64(7), Value::Int64(8)]);

        assert!(decode_values(&encoded, 1).is_err());
    }

    #[test]
    fn decode_rejects_unknown_tag() {
        let encoded = [0, 0, 0, 1, 99];

        assert!(decode_values(&encoded, 1).is_err());
    }

    #[test]
    fn key_starts_with_big_endian_prefix() {
        let key = encode_key(2, &[Value::Bytes(b"Alice".to_vec())]);

        assert_eq!(&key[..4], &2u32.to_be_bytes());
    }

    #[test]
    fn keys_of_different_tables_group_contiguously() {
        let a1 = encode_key(3, &[Value::Bytes(b"zzz".to_vec())]);
        let b1 = encode_key(4, &[Value::Bytes(b"aaa".to_vec())]);

        // Every key of table 3 sorts before every key of table 4.
        assert!(a1 < b1);
    }
}
