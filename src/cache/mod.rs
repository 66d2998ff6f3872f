/*
 * Copyright (c) 2020 - 2021.  Shoyo Inokuchi.
 * Please refer to github.com/shoyo/jin for more information about this project and its license.
 */

//! A bounded in-memory map of `(resource_id, page_number) -> wrapped page`
//! with ARC-style replacement, pinning, and resource expulsion (C4 in the
//! design).

mod arc;
mod wrapper;

pub use arc::ArcCache;
pub use wrapper::{EvictedEntry, PageHandle, PageWrapper};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("an entry for this (resource, page) key is already present")]
    Duplicate,
    #[error("no unpinned victim is available to evict")]
    NoUnpinnedVictim,
}
