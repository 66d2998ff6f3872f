/*
 * Copyright (c) 2020 - 2021.  Shoyo Inokuchi.
 * Please refer to github.com/shoyo/jin for more information about this project and its license.
 */

//! A single table file: schema header, exclusive file lock, and
//! page-granular I/O (C3 in the design).

pub mod header;
mod lock;
mod manager;

pub use manager::TableResourceManager;

use crate::page::PageError;
use crate::schema::SchemaError;
use thiserror::Error;

/// Anything the resource manager needs to know about a page wrapper when
/// writing it back: just its page number. Defined here (rather than taking a
/// dependency on the cache module) so the cache's wrapper type can implement
/// it without a circular module dependency.
pub trait HasPageNumber {
    fn page_number(&self) -> u32;
}

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("schema header magic mismatch: found {0:#x}")]
    BadHeaderMagic(u32),
    #[error("schema header is truncated")]
    TruncatedHeader,
    #[error("schema header references unknown column type ordinal {0}")]
    UnknownColumnType(u32),
    #[error("schema header failed validation: {0}")]
    InvalidSchema(#[from] SchemaError),
    #[error("failed to acquire exclusive lock on {0}")]
    LockFailed(String),
    #[error("page {requested} is below the first data page {first_data_page}")]
    PageNumberBelowFirstData { requested: u32, first_data_page: u32 },
    #[error("{buffers} buffers but {wrappers} wrappers were given to a bulk page operation")]
    BufferWrapperCountMismatch { buffers: usize, wrappers: usize },
    #[error("buffer length {actual} does not match the resource's page size {expected}")]
    WrongBufferLength { expected: u32, actual: u32 },
    #[error("bulk page operation requires contiguous, ascending page numbers")]
    NonContiguousPages,
    #[error("underlying page format error: {0}")]
    PageFormat(#[source] PageError),
}
