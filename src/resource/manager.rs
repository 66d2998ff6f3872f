/*
 * Copyright (c) 2020 - 2021.  Shoyo Inokuchi.
 * Please refer to github.com/shoyo/jin for more information about this project and its license.
 */

use crate::page::TablePage;
use crate::resource::{header, lock, HasPageNumber, ResourceError};
use crate::schema::TableSchema;
use log::{debug, info};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Owns a single table file: the schema header, an exclusive advisory lock
/// held for the manager's lifetime, and page-granular I/O.
pub struct TableResourceManager {
    path: PathBuf,
    file: Mutex<File>,
    schema: TableSchema,
    first_data_page: u32,
    last_data_page: Option<u32>,
}

impl TableResourceManager {
    /// Create a new table file: writes the schema header and locks it.
    /// The file is created empty of data pages.
    pub fn create(path: &Path, schema: TableSchema) -> Result<Self, ResourceError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        lock::acquire_exclusive(&file, path)?;

        let header_bytes = header::encode(&schema);
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header_bytes)?;
        file.flush()?;

        let first_data_page = header::first_data_page(&schema);
        info!("created table resource {} ({} columns)", path.display(), schema.num_columns());

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            schema,
            first_data_page,
            last_data_page: None,
        })
    }

    /// Open an existing table file: reads and validates the schema header,
    /// derives `first_data_page`/`last_data_page` and locks the file.
    pub fn open(path: &Path) -> Result<Self, ResourceError> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        lock::acquire_exclusive(&file, path)?;

        let file_len = file.metadata()?.len();
        let mut prefix = vec![0u8; file_len.min(1 << 20) as usize];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut prefix)?;

        let schema = header::decode(&prefix)?;
        let first_data_page = header::first_data_page(&schema);
        let page_size = schema.page_size() as u64;
        let data_page_count = file_len / page_size - first_data_page as u64;
        let last_data_page = if data_page_count == 0 {
            None
        } else {
            Some(first_data_page + data_page_count as u32 - 1)
        };

        debug!(
            "opened table resource {} (first_data_page={}, last_data_page={:?})",
            path.display(),
            first_data_page,
            last_data_page
        );

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            schema,
            first_data_page,
            last_data_page,
        })
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn first_data_page(&self) -> u32 {
        self.first_data_page
    }

    pub fn last_data_page(&self) -> Option<u32> {
        self.last_data_page
    }

    /// Release the lock and the file handle.
    pub fn close(self) -> Result<(), ResourceError> {
        let file = self.file.into_inner().unwrap_or_else(|e| e.into_inner());
        lock::release(&file)
    }

    /// Drop all data pages; `last_data_page := first_data_page - 1`.
    pub fn truncate(&mut self) -> Result<(), ResourceError> {
        let file = self.file.lock().unwrap();
        file.set_len(self.first_data_page as u64 * self.schema.page_size() as u64)?;
        drop(file);
        self.last_data_page = None;
        Ok(())
    }

    /// Initialize `buf` as a fresh page (does not write to disk) and return
    /// its page number.
    pub fn reserve_new_page(&mut self, buf: &mut [u8]) -> Result<u32, ResourceError> {
        self.validate_buffer_len(buf.len())?;
        let new_page_number = match self.last_data_page {
            Some(n) => n + 1,
            None => self.first_data_page,
        };
        TablePage::init(&self.schema, buf, new_page_number).map_err(ResourceError::PageFormat)?;
        self.last_data_page = Some(new_page_number);
        Ok(new_page_number)
    }

    /// Read exactly one page at `page_number`.
    pub fn read_page(&self, buf: &mut [u8], page_number: u32) -> Result<(), ResourceError> {
        self.validate_buffer_len(buf.len())?;
        self.validate_page_number(page_number)?;
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(self.byte_offset(page_number)))?;
        file.read_exact(buf)?;
        Ok(())
    }

    /// Read `bufs.len()` contiguous pages starting at `first_page_number` in
    /// a single positioned read.
    pub fn read_pages(&self, bufs: &mut [&mut [u8]], first_page_number: u32) -> Result<(), ResourceError> {
        self.validate_page_number(first_page_number)?;
        for buf in bufs.iter() {
            self.validate_buffer_len(buf.len())?;
        }
        let page_size = self.schema.page_size() as usize;
        let mut combined = vec![0u8; page_size * bufs.len()];

        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(self.byte_offset(first_page_number)))?;
        file.read_exact(&mut combined)?;
        drop(file);

        for (i, buf) in bufs.iter_mut().enumerate() {
            buf.copy_from_slice(&combined[i * page_size..(i + 1) * page_size]);
        }
        Ok(())
    }

    /// Write a single page at the offset implied by `wrapper`'s page number.
    pub fn write_page<W: HasPageNumber>(&self, buf: &[u8], wrapper: &W) -> Result<(), ResourceError> {
        self.validate_buffer_len(buf.len())?;
        let page_number = wrapper.page_number();
        self.validate_page_number(page_number)?;
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(self.byte_offset(page_number)))?;
        file.write_all(buf)?;
        file.flush()?;
        Ok(())
    }

    /// Write `bufs` in a single positioned write. `wrappers` must describe
    /// contiguous, ascending page numbers matching `bufs`' order.
    pub fn write_pages<W: HasPageNumber>(&self, bufs: &[&[u8]], wrappers: &[W]) -> Result<(), ResourceError> {
        if bufs.len() != wrappers.len() {
            return Err(ResourceError::BufferWrapperCountMismatch {
                buffers: bufs.len(),
                wrappers: wrappers.len(),
            });
        }
        if wrappers.is_empty() {
            return Ok(());
        }
        for buf in bufs {
            self.validate_buffer_len(buf.len())?;
        }
        let first_page_number = wrappers[0].page_number();
        self.validate_page_number(first_page_number)?;
        for (i, w) in wrappers.iter().enumerate() {
            if w.page_number() != first_page_number + i as u32 {
                return Err(ResourceError::NonContiguousPages);
            }
        }

        let page_size = self.schema.page_size() as usize;
        let mut combined = Vec::with_capacity(page_size * bufs.len());
        for buf in bufs {
            combined.extend_from_slice(buf);
        }

        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(self.byte_offset(first_page_number)))?;
        file.write_all(&combined)?;
        file.flush()?;
        Ok(())
    }

    fn byte_offset(&self, page_number: u32) -> u64 {
        page_number as u64 * self.schema.page_size() as u64
    }

    fn validate_buffer_len(&self, len: usize) -> Result<(), ResourceError> {
        if len as u32 != self.schema.page_size() {
            return Err(ResourceError::WrongBufferLength {
                expected: self.schema.page_size(),
                actual: len as u32,
            });
        }
        Ok(())
    }

    fn validate_page_number(&self, page_number: u32) -> Result<(), ResourceError> {
        if page_number < self.first_data_page {
            return Err(ResourceError::PageNumberBelowFirstData {
                requested: page_number,
                first_data_page: self.first_data_page,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnSchema;
    use crate::types::ColumnType;

    struct FakeWrapper(u32);
    impl HasPageNumber for FakeWrapper {
        fn page_number(&self) -> u32 {
            self.0
        }
    }

    fn schema() -> TableSchema {
        TableSchema::new(
            vec![ColumnSchema::new("id", ColumnType::Int, false, false)],
            4096,
        )
        .unwrap()
    }

    #[test]
    fn create_then_open_recovers_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t1.tbl");
        let manager = TableResourceManager::create(&path, schema()).unwrap();
        assert_eq!(manager.last_data_page(), None);
        manager.close().unwrap();

        let manager = TableResourceManager::open(&path).unwrap();
        assert_eq!(manager.schema(), &schema());
        assert_eq!(manager.last_data_page(), None);
    }

    #[test]
    fn reserve_write_and_read_page_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t2.tbl");
        let mut manager = TableResourceManager::create(&path, schema()).unwrap();

        let mut buf = vec![0u8; 4096];
        let page_number = manager.reserve_new_page(&mut buf).unwrap();
        assert_eq!(page_number, manager.first_data_page());
        buf[100] = 42;

        manager.write_page(&buf, &FakeWrapper(page_number)).unwrap();

        let mut read_buf = vec![0u8; 4096];
        manager.read_page(&mut read_buf, page_number).unwrap();
        assert_eq!(read_buf, buf);
    }

    #[test]
    fn read_below_first_data_page_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t3.tbl");
        let manager = TableResourceManager::create(&path, schema()).unwrap();
        let mut buf = vec![0u8; 4096];
        let err = manager.read_page(&mut buf, 0).unwrap_err();
        assert!(matches!(err, ResourceError::PageNumberBelowFirstData { .. }));
    }

    #[test]
    fn truncate_drops_data_pages() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t4.tbl");
        let mut manager = TableResourceManager::create(&path, schema()).unwrap();
        let mut buf = vec![0u8; 4096];
        manager.reserve_new_page(&mut buf).unwrap();
        manager.write_page(&buf, &FakeWrapper(manager.first_data_page())).unwrap();
        assert!(manager.last_data_page().is_some());

        manager.truncate().unwrap();
        assert_eq!(manager.last_data_page(), None);
    }

    #[test]
    fn write_pages_requires_contiguous_ascending_wrappers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t5.tbl");
        let manager = TableResourceManager::create(&path, schema()).unwrap();
        let buf = vec![0u8; 4096];
        let bufs: Vec<&[u8]> = vec![&buf, &buf];
        let wrappers = vec![FakeWrapper(manager.first_data_page()), FakeWrapper(manager.first_data_page())];
        let err = manager.write_pages(&bufs, &wrappers).unwrap_err();
        assert!(matches!(err, ResourceError::NonContiguousPages));
    }
}
