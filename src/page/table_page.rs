/*
 * Copyright (c) 2020 - 2021.  Shoyo Inokuchi.
 * Please refer to github.com/shoyo/jin for more information about this project and its license.
 */

use crate::page::{
    bit_is_set, header, popcount_within, PageError, Predicate, RidIterator, Tuple, TupleIterator,
};
use crate::schema::TableSchema;
use crate::value::Value;

const TOMBSTONE_BIT: u32 = 1;

/// A single page-sized buffer managed as a slotted record store over
/// `schema`. See the module documentation for the on-page layout.
#[derive(Debug)]
pub struct TablePage<'buf, 'schema> {
    buf: &'buf mut [u8],
    schema: &'schema TableSchema,
}

impl<'buf, 'schema> TablePage<'buf, 'schema> {
    /// Initialize a fresh page: writes the header with zero records and a
    /// chunk offset at the end of the buffer.
    pub fn init(
        schema: &'schema TableSchema,
        buf: &'buf mut [u8],
        page_number: u32,
    ) -> Result<Self, PageError> {
        if buf.len() as u32 != schema.page_size() {
            return Err(PageError::WrongBufferLength {
                expected: schema.page_size(),
                actual: buf.len() as u32,
            });
        }
        header::init(buf, page_number, schema.record_width());
        Ok(Self { buf, schema })
    }

    /// Rebind a buffer that already contains a page written by `init`.
    pub fn open(schema: &'schema TableSchema, buf: &'buf mut [u8]) -> Result<Self, PageError> {
        if buf.len() as u32 != schema.page_size() {
            return Err(PageError::WrongBufferLength {
                expected: schema.page_size(),
                actual: buf.len() as u32,
            });
        }
        header::validate_magic(buf)?;
        Ok(Self { buf, schema })
    }

    pub fn page_number(&self) -> u32 {
        header::page_number(self.buf)
    }

    pub fn record_count(&self) -> u32 {
        header::record_count(self.buf)
    }

    fn record_width(&self) -> u32 {
        header::record_width(self.buf)
    }

    /// Append a new record at slot `record_count`. Returns `false` (buffer
    /// left unchanged) if the record plus its variable-length payload does
    /// not fit before the chunk offset.
    pub fn insert_tuple(&mut self, values: &[Value]) -> Result<bool, PageError> {
        if values.len() != self.schema.num_columns() {
            return Err(PageError::WrongArity {
                expected: self.schema.num_columns(),
                given: values.len(),
            });
        }

        let mut var_bytes_needed: u32 = 0;
        for (i, (value, col)) in values.iter().zip(self.schema.columns()).enumerate() {
            if !value.is_null() && !value.matches_type(col.data_type()) {
                return Err(PageError::TypeMismatch { column: i });
            }
            if value.is_null() && !col.nullable() {
                return Err(PageError::TypeMismatch { column: i });
            }
            if !col.data_type().is_fixed_length() && !value.is_null() {
                var_bytes_needed += value.varchar_bytes().len() as u32;
            }
        }

        let record_width = self.record_width();
        let records_end = header::records_end(self.buf);
        let chunk_offset = header::chunk_offset(self.buf);
        let new_records_end = records_end + record_width;
        if new_records_end > chunk_offset || chunk_offset - new_records_end < var_bytes_needed {
            return Ok(false);
        }

        let slot = records_end;
        self.buf[slot as usize..slot as usize + 4].copy_from_slice(&0u32.to_le_bytes());

        let mut field_cursor = slot + 4;
        let mut chunk_cursor = chunk_offset;
        for (value, col) in values.iter().zip(self.schema.columns()) {
            let width = col.data_type().field_area_width();
            if col.data_type().is_fixed_length() {
                let bytes = if value.is_null() {
                    col.data_type().null_sentinel()
                } else {
                    value.encode_fixed(col.data_type())
                };
                let start = field_cursor as usize;
                self.buf[start..start + bytes.len()].copy_from_slice(&bytes);
            } else if value.is_null() {
                let start = field_cursor as usize;
                self.buf[start..start + 4].copy_from_slice(&0u32.to_le_bytes());
                self.buf[start + 4..start + 8].copy_from_slice(&0u32.to_le_bytes());
            } else {
                let bytes = value.varchar_bytes();
                chunk_cursor -= bytes.len() as u32;
                let chunk_start = chunk_cursor as usize;
                self.buf[chunk_start..chunk_start + bytes.len()].copy_from_slice(bytes);

                let start = field_cursor as usize;
                self.buf[start..start + 4].copy_from_slice(&chunk_cursor.to_le_bytes());
                self.buf[start + 4..start + 8].copy_from_slice(&(bytes.len() as u32).to_le_bytes());
            }
            field_cursor += width;
        }
        debug_assert_eq!(chunk_cursor, chunk_offset - var_bytes_needed);

        header::set_record_count(self.buf, self.record_count() + 1);
        header::set_chunk_offset(self.buf, chunk_cursor);
        Ok(true)
    }

    /// Set the tombstone bit of slot `position`. A no-op if already set.
    pub fn delete_tuple(&mut self, position: u32) -> Result<(), PageError> {
        let record_count = self.record_count();
        if position >= record_count {
            return Err(PageError::SlotOutOfRange(position, record_count));
        }
        let slot = header::slot_offset(self.record_width(), position) as usize;
        let flags = u32::from_le_bytes(self.buf[slot..slot + 4].try_into().unwrap());
        self.buf[slot..slot + 4].copy_from_slice(&(flags | TOMBSTONE_BIT).to_le_bytes());
        Ok(())
    }

    fn is_tombstoned(&self, position: u32) -> bool {
        let slot = header::slot_offset(self.record_width(), position) as usize;
        let flags = u32::from_le_bytes(self.buf[slot..slot + 4].try_into().unwrap());
        flags & TOMBSTONE_BIT != 0
    }

    /// Returns the tuple's columns selected by `column_bitmap`, in schema
    /// order, or `None` if the slot is tombstoned.
    pub fn get_tuple(
        &self,
        position: u32,
        column_bitmap: u64,
        num_cols: u32,
    ) -> Result<Option<Tuple>, PageError> {
        self.get_tuple_filtered(&[], position, column_bitmap, num_cols)
    }

    /// As `get_tuple`, but additionally consults `predicates` for every
    /// column scanned; returns `None` if any predicate fails or the slot is
    /// tombstoned.
    pub fn get_tuple_filtered(
        &self,
        predicates: &[Predicate],
        position: u32,
        column_bitmap: u64,
        num_cols: u32,
    ) -> Result<Option<Tuple>, PageError> {
        let record_count = self.record_count();
        if position >= record_count {
            return Err(PageError::SlotOutOfRange(position, record_count));
        }
        let selected = popcount_within(column_bitmap, self.schema.num_columns());
        if selected != num_cols {
            return Err(PageError::BitmapMismatch {
                selected,
                num_cols,
            });
        }
        for p in predicates {
            if p.column >= self.schema.num_columns() {
                return Err(PageError::PredicateColumnOutOfRange(p.column));
            }
        }

        if self.is_tombstoned(position) {
            return Ok(None);
        }

        let slot = header::slot_offset(self.record_width(), position);
        let mut field_cursor = slot + 4;
        let mut output = Vec::with_capacity(num_cols as usize);

        for (i, col) in self.schema.columns().iter().enumerate() {
            let width = col.data_type().field_area_width();
            let wants_output = bit_is_set(column_bitmap, i);
            let targeted = predicates.iter().any(|p| p.column == i);

            if wants_output || targeted {
                let value = self.decode_field_at(field_cursor, col.data_type())?;
                for p in predicates.iter().filter(|p| p.column == i) {
                    if !p.evaluate_with_null(&value) {
                        return Ok(None);
                    }
                }
                if wants_output {
                    output.push(value);
                }
            }
            field_cursor += width;
        }

        Ok(Some(output))
    }

    fn decode_field_at(
        &self,
        field_offset: u32,
        data_type: crate::types::ColumnType,
    ) -> Result<Value, PageError> {
        if data_type.is_fixed_length() {
            let width = data_type.bytes_fixed() as usize;
            let start = field_offset as usize;
            Ok(Value::decode_fixed(data_type, &self.buf[start..start + width]))
        } else {
            let start = field_offset as usize;
            let offset = u32::from_le_bytes(self.buf[start..start + 4].try_into().unwrap());
            let length = u32::from_le_bytes(self.buf[start + 4..start + 8].try_into().unwrap());
            if offset == 0 && length == 0 {
                return Ok(Value::Null);
            }
            let chunk_offset = header::chunk_offset(self.buf);
            if offset < chunk_offset || offset + length > self.buf.len() as u32 {
                return Err(PageError::MalformedVarPointer { offset, length });
            }
            let bytes = &self.buf[offset as usize..(offset + length) as usize];
            Ok(Value::Varchar(String::from_utf8_lossy(bytes).into_owned()))
        }
    }

    /// A lazy, single-pass sequence over non-tombstoned, predicate-passing
    /// records, in ascending slot order.
    pub fn iterator<'p>(
        &self,
        column_bitmap: u64,
        num_cols: u32,
        predicates: &'p [Predicate],
    ) -> TupleIterator<'_, 'buf, 'schema, 'p> {
        TupleIterator::new(self, column_bitmap, num_cols, predicates)
    }

    /// As `iterator`, but over all columns and yielding each record's `Rid`
    /// alongside its tuple.
    pub fn rid_iterator(&self) -> RidIterator<'_, 'buf, 'schema> {
        RidIterator::new(self)
    }

    pub fn schema(&self) -> &'schema TableSchema {
        self.schema
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::Comparator;
    use crate::schema::ColumnSchema;
    use crate::types::ColumnType;

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
    fn insert_and_roundtrip() {
        let schema = schema();
        let mut buf = vec![0u8; 4096];
        let mut page = TablePage::init(&schema, &mut buf, 0).unwrap();

        let ok = page
            .insert_tuple(&[Value::Int(42), Value::Varchar("hello".to_string())])
            .unwrap();
        assert!(ok);
        assert_eq!(page.record_count(), 1);

        let all_bits = 0b11;
        let tuple = page.get_tuple(0, all_bits, 2).unwrap().unwrap();
        assert_eq!(tuple, vec![Value::Int(42), Value::Varchar("hello".to_string())]);
    }

    #[test]
    fn insert_rejects_byte_identical_on_overflow() {
        let schema = schema();
        let mut buf = vec![0u8; 4096];
        let mut page = TablePage::init(&schema, &mut buf, 0).unwrap();
        let mut n = 0;
        loop {
            let ok = page
                .insert_tuple(&[Value::Int(n), Value::Varchar(format!("row_{}", n))])
                .unwrap();
            if !ok {
                break;
            }
            n += 1;
        }
        assert!(n > 0);
        let before = buf.clone();
        let mut page = TablePage::open(&schema, &mut buf).unwrap();
        let ok = page
            .insert_tuple(&[Value::Int(999), Value::Varchar("x".repeat(4000))])
            .unwrap();
        assert!(!ok);
        assert_eq!(buf, before);
    }

    #[test]
    fn projection_returns_only_selected_columns_in_schema_order() {
        let schema = schema();
        let mut buf = vec![0u8; 4096];
        let mut page = TablePage::init(&schema, &mut buf, 0).unwrap();
        page.insert_tuple(&[Value::Int(1), Value::Varchar("a".to_string())])
            .unwrap();

        // Select only column 1 (name).
        let tuple = page.get_tuple(0, 0b10, 1).unwrap().unwrap();
        assert_eq!(tuple, vec![Value::Varchar("a".to_string())]);
    }

    #[test]
    fn delete_then_get_is_not_present_and_idempotent() {
        let schema = schema();
        let mut buf = vec![0u8; 4096];
        let mut page = TablePage::init(&schema, &mut buf, 0).unwrap();
        page.insert_tuple(&[Value::Int(1), Value::Null]).unwrap();

        page.delete_tuple(0).unwrap();
        assert!(page.get_tuple(0, 0b11, 2).unwrap().is_none());

        // Deleting again is a no-op, not an error.
        page.delete_tuple(0).unwrap();
        assert!(page.get_tuple(0, 0b11, 2).unwrap().is_none());
    }

    #[test]
    fn null_varchar_round_trips() {
        let schema = schema();
        let mut buf = vec![0u8; 4096];
        let mut page = TablePage::init(&schema, &mut buf, 0).unwrap();
        page.insert_tuple(&[Value::Int(5), Value::Null]).unwrap();
        let tuple = page.get_tuple(0, 0b11, 2).unwrap().unwrap();
        assert_eq!(tuple[1], Value::Null);
    }

    #[test]
    fn filtered_get_excludes_non_matching_rows() {
        let schema = schema();
        let mut buf = vec![0u8; 4096];
        let mut page = TablePage::init(&schema, &mut buf, 0).unwrap();
        page.insert_tuple(&[Value::Int(5), Value::Varchar("a".to_string())])
            .unwrap();

        let preds = vec![Predicate::new(0, Comparator::Gt, Value::Int(10))];
        let result = page.get_tuple_filtered(&preds, 0, 0b11, 2).unwrap();
        assert!(result.is_none());

        let preds = vec![Predicate::new(0, Comparator::Gt, Value::Int(1))];
        let result = page.get_tuple_filtered(&preds, 0, 0b11, 2).unwrap();
        assert!(result.is_some());
    }

    #[test]
    fn open_rejects_bad_magic() {
        let schema = schema();
        let mut buf = vec![0u8; 4096];
        let err = TablePage::open(&schema, &mut buf).unwrap_err();
        assert_eq!(err, PageError::BadMagic(0));
    }
}
