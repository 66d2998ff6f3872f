/*
 * Copyright (c) 2020 - 2021.  Shoyo Inokuchi.
 * Please refer to github.com/shoyo/jin for more information about this project and its license.
 */

use crate::page::{PageError, Predicate, Rid, TablePage, Tuple};

/// Lazy, single-pass sequence over a page's non-tombstoned,
/// predicate-passing records, visited in ascending slot order.
pub struct TupleIterator<'page, 'buf, 'schema, 'p> {
    page: &'page TablePage<'buf, 'schema>,
    column_bitmap: u64,
    num_cols: u32,
    predicates: &'p [Predicate],
    next_slot: u32,
}

impl<'page, 'buf, 'schema, 'p> TupleIterator<'page, 'buf, 'schema, 'p> {
    pub(super) fn new(
        page: &'page TablePage<'buf, 'schema>,
        column_bitmap: u64,
        num_cols: u32,
        predicates: &'p [Predicate],
    ) -> Self {
        Self {
            page,
            column_bitmap,
            num_cols,
            predicates,
            next_slot: 0,
        }
    }
}

impl<'page, 'buf, 'schema, 'p> Iterator for TupleIterator<'page, 'buf, 'schema, 'p> {
    type Item = Result<Tuple, PageError>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.next_slot < self.page.record_count() {
            let slot = self.next_slot;
            self.next_slot += 1;
            match self.page.get_tuple_filtered(
                self.predicates,
                slot,
                self.column_bitmap,
                self.num_cols,
            ) {
                Ok(Some(tuple)) => return Some(Ok(tuple)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
        None
    }
}

/// Lazy, single-pass sequence over a page's non-tombstoned records,
/// yielding every column alongside each record's `Rid`.
pub struct RidIterator<'page, 'buf, 'schema> {
    page: &'page TablePage<'buf, 'schema>,
    all_columns_bitmap: u64,
    num_cols: u32,
    next_slot: u32,
}

impl<'page, 'buf, 'schema> RidIterator<'page, 'buf, 'schema> {
    pub(super) fn new(page: &'page TablePage<'buf, 'schema>) -> Self {
        let num_cols = page.schema().num_columns() as u32;
        let all_columns_bitmap = if num_cols >= 64 {
            u64::MAX
        } else {
            (1u64 << num_cols) - 1
        };
        Self {
            page,
            all_columns_bitmap,
            num_cols,
            next_slot: 0,
        }
    }
}

impl<'page, 'buf, 'schema> Iterator for RidIterator<'page, 'buf, 'schema> {
    type Item = Result<(Rid, Tuple), PageError>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.next_slot < self.page.record_count() {
            let slot = self.next_slot;
            self.next_slot += 1;
            match self.page.get_tuple(slot, self.all_columns_bitmap, self.num_cols) {
                Ok(Some(tuple)) => {
                    return Some(Ok((Rid::new(self.page.page_number(), slot), tuple)))
                }
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
        None
    }
}
