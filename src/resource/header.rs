/*
 * Copyright (c) 2020 - 2021.  Shoyo Inokuchi.
 * Please refer to github.com/shoyo/jin for more information about this project and its license.
 */

//! (De)serialization of a table file's leading schema header.
//!
//! Layout, little-endian: `u32 magic, u32 version, u32 page_size, u32
//! num_columns`, then per column `u32 type_ordinal, u32 array_length, u32
//! attribute_bits, u32 name_length, u16[name_length] name_utf16`. The whole
//! header is zero-padded up to the next page-size boundary.

use crate::resource::ResourceError;
use crate::schema::{ColumnSchema, TableSchema};
use crate::types::ColumnType;

pub const HEADER_MAGIC: u32 = 0xDEAFD00D;
pub const HEADER_VERSION: u32 = 0;

const NULLABLE_BIT: u32 = 1;
const UNIQUE_BIT: u32 = 2;

/// Encode `schema`'s header, zero-padded to the next multiple of
/// `schema.page_size()`.
pub fn encode(schema: &TableSchema) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&HEADER_MAGIC.to_le_bytes());
    body.extend_from_slice(&HEADER_VERSION.to_le_bytes());
    body.extend_from_slice(&schema.page_size().to_le_bytes());
    body.extend_from_slice(&(schema.num_columns() as u32).to_le_bytes());

    for col in schema.columns() {
        let array_len = col.data_type().max_len().unwrap_or(0);
        let mut attrs = 0u32;
        if col.nullable() {
            attrs |= NULLABLE_BIT;
        }
        if col.unique() {
            attrs |= UNIQUE_BIT;
        }
        let name_utf16: Vec<u16> = col.name().encode_utf16().collect();

        body.extend_from_slice(&col.data_type().ordinal().to_le_bytes());
        body.extend_from_slice(&array_len.to_le_bytes());
        body.extend_from_slice(&attrs.to_le_bytes());
        body.extend_from_slice(&(name_utf16.len() as u32).to_le_bytes());
        for unit in name_utf16 {
            body.extend_from_slice(&unit.to_le_bytes());
        }
    }

    let page_size = schema.page_size() as usize;
    let padded = padded_len(body.len(), page_size);
    body.resize(padded, 0);
    body
}

/// Byte length of `encode`'s output, without reading it back: `raw_len`
/// rounded up to the next multiple of `page_size`.
fn padded_len(raw_len: usize, page_size: usize) -> usize {
    ((raw_len + page_size - 1) / page_size) * page_size
}

/// Decode a schema header from the start of `bytes`. `bytes` need only be at
/// least as long as the unpadded header; trailing padding is ignored.
pub fn decode(bytes: &[u8]) -> Result<TableSchema, ResourceError> {
    let mut cursor = 0usize;
    let magic = read_u32(bytes, &mut cursor)?;
    if magic != HEADER_MAGIC {
        return Err(ResourceError::BadHeaderMagic(magic));
    }
    let _version = read_u32(bytes, &mut cursor)?;
    let page_size = read_u32(bytes, &mut cursor)?;
    let num_columns = read_u32(bytes, &mut cursor)?;

    let mut columns = Vec::with_capacity(num_columns as usize);
    for _ in 0..num_columns {
        let ordinal = read_u32(bytes, &mut cursor)?;
        let array_len = read_u32(bytes, &mut cursor)?;
        let attrs = read_u32(bytes, &mut cursor)?;
        let name_len = read_u32(bytes, &mut cursor)?;

        let name_bytes_len = name_len as usize * 2;
        if cursor + name_bytes_len > bytes.len() {
            return Err(ResourceError::TruncatedHeader);
        }
        let mut units = Vec::with_capacity(name_len as usize);
        for i in 0..name_len as usize {
            let off = cursor + i * 2;
            units.push(u16::from_le_bytes([bytes[off], bytes[off + 1]]));
        }
        cursor += name_bytes_len;
        let name = String::from_utf16_lossy(&units);

        let data_type = ColumnType::from_ordinal(ordinal, array_len)
            .ok_or(ResourceError::UnknownColumnType(ordinal))?;
        let nullable = attrs & NULLABLE_BIT != 0;
        let unique = attrs & UNIQUE_BIT != 0;
        columns.push(ColumnSchema::new(&name, data_type, nullable, unique));
    }

    TableSchema::new(columns, page_size).map_err(ResourceError::InvalidSchema)
}

/// Byte offset of the first data page, i.e. the padded header length divided
/// by the page size.
pub fn first_data_page(schema: &TableSchema) -> u32 {
    let page_size = schema.page_size() as usize;
    let raw = raw_len(schema);
    (padded_len(raw, page_size) / page_size) as u32
}

fn raw_len(schema: &TableSchema) -> usize {
    let mut len = 16;
    for col in schema.columns() {
        len += 16;
        len += col.name().encode_utf16().count() * 2;
    }
    len
}

fn read_u32(bytes: &[u8], cursor: &mut usize) -> Result<u32, ResourceError> {
    if *cursor + 4 > bytes.len() {
        return Err(ResourceError::TruncatedHeader);
    }
    let value = u32::from_le_bytes(bytes[*cursor..*cursor + 4].try_into().unwrap());
    *cursor += 4;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnSchema;

    fn schema() -> TableSchema {
        TableSchema::new(
            vec![
                ColumnSchema::new("id", ColumnType::Int, false, true),
                ColumnSchema::new("name", ColumnType::Varchar(32), true, false),
            ],
            4096,
        )
        .unwrap()
    }

    #[test]
    fn header_roundtrips() {
        let schema = schema();
        let encoded = encode(&schema);
        assert_eq!(encoded.len() % 4096, 0);
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, schema);
    }

    #[test]
    fn header_is_padded_to_page_size() {
        let schema = schema();
        let encoded = encode(&schema);
        assert_eq!(encoded.len(), 4096);
        assert_eq!(first_data_page(&schema), 1);
    }

    #[test]
    fn rejects_bad_magic() {
        let bytes = vec![0u8; 32];
        assert!(matches!(decode(&bytes), Err(ResourceError::BadHeaderMagic(0))));
    }
}
