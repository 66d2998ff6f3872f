/*
 * Copyright (c) 2020 - 2021.  Shoyo Inokuchi.
 * Please refer to github.com/shoyo/jin for more information about this project and its license.
 */

//! Typed field values and the byte-level codec used to move them in and out
//! of a page's fixed field area and variable-length chunk.

use crate::types::ColumnType;
use std::convert::TryInto;

/// A single typed field value, or SQL NULL.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    SmallInt(i16),
    Int(i32),
    BigInt(i64),
    Float(f32),
    Double(f64),
    Char(String),
    Varchar(String),
    Date(u32),
    Time(u32),
    Timestamp(u64),
}

impl Value {
    pub fn column_type(&self, declared: ColumnType) -> ColumnType {
        // A NULL value carries no type of its own; the declared column type
        // is authoritative for it.
        match self {
            Value::Null => declared,
            Value::SmallInt(_) => ColumnType::SmallInt,
            Value::Int(_) => ColumnType::Int,
            Value::BigInt(_) => ColumnType::BigInt,
            Value::Float(_) => ColumnType::Float,
            Value::Double(_) => ColumnType::Double,
            Value::Char(_) => declared,
            Value::Varchar(_) => declared,
            Value::Date(_) => ColumnType::Date,
            Value::Time(_) => ColumnType::Time,
            Value::Timestamp(_) => ColumnType::Timestamp,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Checks that `self` is a legal value for `declared`, ignoring length
    /// limits (those are enforced by the caller, which knows the available
    /// chunk space).
    pub fn matches_type(&self, declared: ColumnType) -> bool {
        match (self, declared) {
            (Value::Null, _) => true,
            (Value::SmallInt(_), ColumnType::SmallInt) => true,
            (Value::Int(_), ColumnType::Int) => true,
            (Value::BigInt(_), ColumnType::BigInt) => true,
            (Value::Float(_), ColumnType::Float) => true,
            (Value::Double(_), ColumnType::Double) => true,
            (Value::Char(_), ColumnType::Char(_)) => true,
            (Value::Varchar(_), ColumnType::Varchar(_)) => true,
            (Value::Date(_), ColumnType::Date) => true,
            (Value::Time(_), ColumnType::Time) => true,
            (Value::Timestamp(_), ColumnType::Timestamp) => true,
            _ => false,
        }
    }

    /// Encode a fixed-length value into exactly `ty.bytes_fixed()` bytes.
    /// `Char` values shorter than the declared length are blank-padded.
    /// Must not be called with `Value::Varchar` or `Value::Null`.
    pub fn encode_fixed(&self, ty: ColumnType) -> Vec<u8> {
        match (self, ty) {
            (Value::SmallInt(v), ColumnType::SmallInt) => v.to_le_bytes().to_vec(),
            (Value::Int(v), ColumnType::Int) => v.to_le_bytes().to_vec(),
            (Value::BigInt(v), ColumnType::BigInt) => v.to_le_bytes().to_vec(),
            (Value::Float(v), ColumnType::Float) => v.to_le_bytes().to_vec(),
            (Value::Double(v), ColumnType::Double) => v.to_le_bytes().to_vec(),
            (Value::Char(s), ColumnType::Char(n)) => {
                let mut bytes = s.as_bytes().to_vec();
                bytes.resize(n as usize, b' ');
                bytes
            }
            (Value::Date(v), ColumnType::Date) => v.to_le_bytes().to_vec(),
            (Value::Time(v), ColumnType::Time) => v.to_le_bytes().to_vec(),
            (Value::Timestamp(v), ColumnType::Timestamp) => v.to_le_bytes().to_vec(),
            _ => panic!("encode_fixed called with mismatched value/type: {:?}/{}", self, ty),
        }
    }

    /// Decode a fixed-length field. Returns `Value::Null` if `bytes` is the
    /// type's NULL sentinel.
    pub fn decode_fixed(ty: ColumnType, bytes: &[u8]) -> Value {
        if ty.is_null_sentinel(bytes) {
            return Value::Null;
        }
        match ty {
            ColumnType::SmallInt => Value::SmallInt(i16::from_le_bytes(bytes.try_into().unwrap())),
            ColumnType::Int => Value::Int(i32::from_le_bytes(bytes.try_into().unwrap())),
            ColumnType::BigInt => Value::BigInt(i64::from_le_bytes(bytes.try_into().unwrap())),
            ColumnType::Float => Value::Float(f32::from_le_bytes(bytes.try_into().unwrap())),
            ColumnType::Double => Value::Double(f64::from_le_bytes(bytes.try_into().unwrap())),
            ColumnType::Char(_) => {
                let trimmed = trim_trailing_blanks(bytes);
                Value::Char(String::from_utf8_lossy(trimmed).into_owned())
            }
            ColumnType::Date => Value::Date(u32::from_le_bytes(bytes.try_into().unwrap())),
            ColumnType::Time => Value::Time(u32::from_le_bytes(bytes.try_into().unwrap())),
            ColumnType::Timestamp => Value::Timestamp(u64::from_le_bytes(bytes.try_into().unwrap())),
            ColumnType::Varchar(_) => panic!("decode_fixed called on a variable-length type"),
        }
    }

    /// Returns the raw bytes of a `Varchar` value, for writing into the
    /// page's variable-length chunk. Must not be called on `Value::Null`.
    pub fn varchar_bytes(&self) -> &[u8] {
        match self {
            Value::Varchar(s) => s.as_bytes(),
            _ => panic!("varchar_bytes called on a non-Varchar value"),
        }
    }
}

fn trim_trailing_blanks(bytes: &[u8]) -> &[u8] {
    let mut end = bytes.len();
    while end > 0 && bytes[end - 1] == b' ' {
        end -= 1;
    }
    &bytes[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn char_roundtrip_pads_and_trims() {
        let ty = ColumnType::Char(8);
        let encoded = Value::Char("hi".to_string()).encode_fixed(ty);
        assert_eq!(encoded.len(), 8);
        assert_eq!(&encoded, b"hi      ");
        let decoded = Value::decode_fixed(ty, &encoded);
        assert_eq!(decoded, Value::Char("hi".to_string()));
    }

    #[test]
    fn fixed_width_roundtrip() {
        for (value, ty) in [
            (Value::SmallInt(-7), ColumnType::SmallInt),
            (Value::Int(123456), ColumnType::Int),
            (Value::BigInt(-99999999999), ColumnType::BigInt),
            (Value::Float(1.5), ColumnType::Float),
            (Value::Double(-2.25), ColumnType::Double),
            (Value::Date(19800), ColumnType::Date),
            (Value::Time(3600), ColumnType::Time),
            (Value::Timestamp(1_700_000_000), ColumnType::Timestamp),
        ] {
            let bytes = value.encode_fixed(ty);
            assert_eq!(bytes.len() as u32, ty.bytes_fixed());
            assert_eq!(Value::decode_fixed(ty, &bytes), value);
        }
    }

    #[test]
    fn null_sentinel_decodes_as_null() {
        let ty = ColumnType::Int;
        let sentinel = ty.null_sentinel();
        assert_eq!(Value::decode_fixed(ty, &sentinel), Value::Null);
    }
}
