/*
 * Copyright (c) 2020 - 2021.  Shoyo Inokuchi.
 * Please refer to github.com/shoyo/jin for more information about this project and its license.
 */

use crate::resource::HasPageNumber;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A cheap, clonable handle to a cached page's metadata: its page number,
/// whether it has been written to since being read, and whether it has been
/// expired out from under its resource.
///
/// Expiry is one-way: once `mark_expired` has been called, `is_expired`
/// never again returns `false` for this handle or any of its clones.
#[derive(Clone, Debug)]
pub struct PageWrapper(Arc<Inner>);

#[derive(Debug)]
struct Inner {
    page_number: u32,
    modified: AtomicBool,
    expired: AtomicBool,
}

impl PageWrapper {
    pub fn new(page_number: u32, modified: bool) -> Self {
        Self(Arc::new(Inner {
            page_number,
            modified: AtomicBool::new(modified),
            expired: AtomicBool::new(false),
        }))
    }

    pub fn page_number(&self) -> u32 {
        self.0.page_number
    }

    pub fn is_modified(&self) -> bool {
        self.0.modified.load(Ordering::SeqCst)
    }

    pub fn set_modified(&self, modified: bool) {
        self.0.modified.store(modified, Ordering::SeqCst);
    }

    pub fn is_expired(&self) -> bool {
        self.0.expired.load(Ordering::SeqCst)
    }

    pub fn mark_expired(&self) {
        self.0.expired.store(true, Ordering::SeqCst);
    }
}

impl HasPageNumber for PageWrapper {
    fn page_number(&self) -> u32 {
        self.page_number()
    }
}

/// A page's bytes plus its wrapper, as handed out by the cache on a hit.
#[derive(Clone, Debug)]
pub struct PageHandle {
    pub buffer: Arc<std::sync::Mutex<Vec<u8>>>,
    pub wrapper: PageWrapper,
}

/// Result of `ArcCache::add_page`. For the first `capacity` admissions this
/// is a blank slot (`resource_id = -1`, `wrapper = None`) carrying a fresh
/// buffer; thereafter it carries the buffer and, unless the victim was
/// already expired, the wrapper of the page evicted to make room.
#[derive(Debug)]
pub struct EvictedEntry {
    pub buffer: Arc<std::sync::Mutex<Vec<u8>>>,
    pub wrapper: Option<PageWrapper>,
    pub resource_id: crate::catalog::ResourceId,
    pub page_number: u32,
}
