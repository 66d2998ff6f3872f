/*
 * Copyright (c) 2020 - 2021.  Shoyo Inokuchi.
 * Please refer to github.com/shoyo/jin for more information about this project and its license.
 */

//! Persistence for a single query heap's spill runs: one table file per
//! heap id, written and read through the same `TableResourceManager`/
//! `TablePage` machinery tables use.

use crate::cache::PageWrapper;
use crate::heap::HeapError;
use crate::page::{TablePage, Tuple};
use crate::resource::TableResourceManager;
use crate::schema::{ColumnSchema, TableSchema};
use crate::types::ColumnType;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// A contiguous range of pages holding one sorted run.
#[derive(Debug, Clone, Copy)]
pub struct RunDescriptor {
    pub first_block: u32,
    pub num_blocks: u32,
}

/// A single heap's temp file. Column types are reconstructed into an
/// unnamed schema (`c0`, `c1`, ...) since spill tuples carry no column
/// names of their own.
pub struct SpillFile {
    manager: Arc<Mutex<TableResourceManager>>,
    schema: Arc<TableSchema>,
    path: PathBuf,
}

impl SpillFile {
    pub fn create(path: &Path, column_types: &[ColumnType], page_size: u32) -> Result<Self, HeapError> {
        let columns = column_types
            .iter()
            .enumerate()
            .map(|(i, ty)| ColumnSchema::new(&format!("c{}", i), *ty, true, false))
            .collect();
        let schema = TableSchema::new(columns, page_size)?;
        let manager = TableResourceManager::create(path, schema.clone())?;
        Ok(Self {
            manager: Arc::new(Mutex::new(manager)),
            schema: Arc::new(schema),
            path: path.to_path_buf(),
        })
    }

    /// Append `tuples` across as many fresh pages as needed, flushing each
    /// page as it fills. Returns the contiguous block range written.
    pub fn append_run(&self, tuples: &[Tuple]) -> Result<RunDescriptor, HeapError> {
        let page_size = self.schema.page_size() as usize;
        let mut manager = self.manager.lock().unwrap();

        let mut buf = vec![0u8; page_size];
        let mut page_number = manager.reserve_new_page(&mut buf)?;
        let first_block = page_number;
        let mut num_blocks = 1u32;
        let mut page = TablePage::init(&self.schema, &mut buf, page_number)?;

        for tuple in tuples {
            while !page.insert_tuple(tuple)? {
                manager.write_page(&buf, &PageWrapper::new(page_number, true))?;
                page_number = manager.reserve_new_page(&mut buf)?;
                num_blocks += 1;
                page = TablePage::init(&self.schema, &mut buf, page_number)?;
            }
        }
        manager.write_page(&buf, &PageWrapper::new(page_number, true))?;

        Ok(RunDescriptor {
            first_block,
            num_blocks,
        })
    }

    pub fn read_run(&self, descriptor: RunDescriptor) -> RunIterator {
        RunIterator {
            manager: self.manager.clone(),
            schema: self.schema.clone(),
            first_block: descriptor.first_block,
            num_blocks: descriptor.num_blocks,
            current_block: 0,
            current_slot: 0,
            page_buf: None,
        }
    }

    pub fn close_and_delete(self) -> Result<(), HeapError> {
        let manager = Arc::try_unwrap(self.manager)
            .map_err(|_| HeapError::SpillFileStillShared)?
            .into_inner()
            .unwrap();
        manager.close()?;
        std::fs::remove_file(&self.path)?;
        Ok(())
    }
}

/// A lazy, forward-only sequence over one run's tuples, in the order they
/// were written.
pub struct RunIterator {
    manager: Arc<Mutex<TableResourceManager>>,
    schema: Arc<TableSchema>,
    first_block: u32,
    num_blocks: u32,
    current_block: u32,
    current_slot: u32,
    page_buf: Option<Vec<u8>>,
}

impl Iterator for RunIterator {
    type Item = Result<Tuple, HeapError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.current_block >= self.num_blocks {
                return None;
            }
            if self.page_buf.is_none() {
                let mut buf = vec![0u8; self.schema.page_size() as usize];
                let page_number = self.first_block + self.current_block;
                if let Err(e) = self.manager.lock().unwrap().read_page(&mut buf, page_number) {
                    return Some(Err(e.into()));
                }
                self.page_buf = Some(buf);
                self.current_slot = 0;
            }

            let buf = self.page_buf.as_mut().unwrap();
            let page = match TablePage::open(&self.schema, buf) {
                Ok(p) => p,
                Err(e) => return Some(Err(e.into())),
            };

            if self.current_slot >= page.record_count() {
                self.page_buf = None;
                self.current_block += 1;
                continue;
            }

            let num_cols = self.schema.num_columns() as u32;
            let all_columns = if num_cols >= 64 {
                u64::MAX
            } else {
                (1u64 << num_cols) - 1
            };
            let slot = self.current_slot;
            self.current_slot += 1;

            match page.get_tuple(slot, all_columns, num_cols) {
                Ok(Some(tuple)) => return Some(Ok(tuple)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}
