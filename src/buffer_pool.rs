/*
 * Copyright (c) 2020 - 2021.  Shoyo Inokuchi.
 * Please refer to github.com/shoyo/jin for more information about this project and its license.
 */

//! Composes per-page-size page caches with a small fixed pool of background
//! I/O threads (C5 in the design). Callers make synchronous requests; a
//! cache miss is served by a read worker while the caller waits on a
//! per-request condition, and concurrent misses on the same key are
//! coalesced onto a single read. Evicted dirty pages are hand off to a
//! write worker that persists them via the owning resource manager.

use crate::cache::{ArcCache, CacheError, PageHandle, PageWrapper};
use crate::catalog::ResourceId;
use crate::config::Config;
use crate::page::PageError;
use crate::resource::{ResourceError, TableResourceManager};
use log::{trace, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use thiserror::Error;

const READ_WORKER_THREADS: usize = 2;
const WRITE_WORKER_THREADS: usize = 1;
const DEFAULT_CACHE_CAPACITY_PAGES: usize = 1000;

#[derive(Debug, Error)]
pub enum BufferPoolError {
    #[error("the buffer pool is closed")]
    Closed,
    #[error("no resource is registered under id {0}")]
    UnknownResource(ResourceId),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error(transparent)]
    Page(#[from] PageError),
    #[error("background I/O worker failed: {0}")]
    Io(String),
}

struct ResourceEntry {
    manager: Arc<Mutex<TableResourceManager>>,
    page_size: u32,
    cache: Arc<ArcCache>,
    last_error: Arc<Mutex<Option<String>>>,
}

#[derive(Default)]
struct Waiter {
    state: Mutex<Option<Result<PageHandle, String>>>,
    condvar: Condvar,
}

impl Waiter {
    fn wait(&self) -> Result<PageHandle, String> {
        let mut guard = self.state.lock().unwrap();
        while guard.is_none() {
            guard = self.condvar.wait(guard).unwrap();
        }
        guard.clone().unwrap()
    }

    fn fulfill(&self, result: Result<PageHandle, String>) {
        *self.state.lock().unwrap() = Some(result);
        self.condvar.notify_all();
    }
}

enum ReadJob {
    Fetch {
        resource_id: ResourceId,
        page_number: u32,
        page_size: u32,
        pin: bool,
        manager: Arc<Mutex<TableResourceManager>>,
        cache: Arc<ArcCache>,
        write_tx: mpsc::Sender<WriteJob>,
        last_error: Arc<Mutex<Option<String>>>,
        responder: Option<Arc<Waiter>>,
    },
    Shutdown,
}

enum WriteJob {
    Flush {
        manager: Arc<Mutex<TableResourceManager>>,
        buffer: Arc<Mutex<Vec<u8>>>,
        wrapper: PageWrapper,
        last_error: Arc<Mutex<Option<String>>>,
    },
    Shutdown,
}

/// Binds table resource managers to per-page-size ARC caches and a small
/// pool of background I/O threads.
pub struct BufferPool {
    config: Config,
    resources: RwLock<HashMap<ResourceId, Arc<ResourceEntry>>>,
    caches: RwLock<HashMap<u32, Arc<ArcCache>>>,
    in_flight: Mutex<HashMap<(ResourceId, u32), Arc<Waiter>>>,
    read_tx: mpsc::Sender<ReadJob>,
    write_tx: mpsc::Sender<WriteJob>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl BufferPool {
    pub fn new(config: Config) -> Self {
        let (read_tx, read_rx) = mpsc::channel::<ReadJob>();
        let (write_tx, write_rx) = mpsc::channel::<WriteJob>();
        let read_rx = Arc::new(Mutex::new(read_rx));
        let write_rx = Arc::new(Mutex::new(write_rx));

        let mut workers = Vec::with_capacity(READ_WORKER_THREADS + WRITE_WORKER_THREADS);
        for _ in 0..READ_WORKER_THREADS {
            let rx = read_rx.clone();
            workers.push(thread::spawn(move || run_read_worker(rx)));
        }
        for _ in 0..WRITE_WORKER_THREADS {
            let rx = write_rx.clone();
            workers.push(thread::spawn(move || run_write_worker(rx)));
        }

        Self {
            config,
            resources: RwLock::new(HashMap::new()),
            caches: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            read_tx,
            write_tx,
            workers: Mutex::new(workers),
            closed: AtomicBool::new(false),
        }
    }

    pub fn register_resource(
        &self,
        resource_id: ResourceId,
        manager: TableResourceManager,
    ) -> Result<(), BufferPoolError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BufferPoolError::Closed);
        }
        let page_size = manager.schema().page_size();
        let cache = self.cache_for_page_size(page_size);
        let entry = Arc::new(ResourceEntry {
            manager: Arc::new(Mutex::new(manager)),
            page_size,
            cache,
            last_error: Arc::new(Mutex::new(None)),
        });
        self.resources.write().unwrap().insert(resource_id, entry);
        Ok(())
    }

    pub fn get_page(
        &self,
        resource_id: ResourceId,
        page_number: u32,
    ) -> Result<PageHandle, BufferPoolError> {
        self.fetch(resource_id, page_number, false)
    }

    pub fn get_page_and_pin(
        &self,
        resource_id: ResourceId,
        page_number: u32,
    ) -> Result<PageHandle, BufferPoolError> {
        self.fetch(resource_id, page_number, true)
    }

    pub fn unpin_page(&self, resource_id: ResourceId, page_number: u32) {
        if let Ok(entry) = self.resource_entry(resource_id) {
            entry.cache.unpin_page(resource_id, page_number);
        }
    }

    /// Enqueue reads for `count` contiguous pages starting at `first` without
    /// blocking the caller. Pages already resident are skipped.
    pub fn prefetch_pages(
        &self,
        resource_id: ResourceId,
        first: u32,
        count: u32,
    ) -> Result<(), BufferPoolError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BufferPoolError::Closed);
        }
        let entry = self.resource_entry(resource_id)?;
        for page_number in first..first.saturating_add(count) {
            if entry.cache.get_page(resource_id, page_number).is_some() {
                continue;
            }
            trace!("prefetching resource {} page {}", resource_id, page_number);
            let _ = self.read_tx.send(ReadJob::Fetch {
                resource_id,
                page_number,
                page_size: entry.page_size,
                pin: false,
                manager: entry.manager.clone(),
                cache: entry.cache.clone(),
                write_tx: self.write_tx.clone(),
                last_error: entry.last_error.clone(),
                responder: None,
            });
        }
        Ok(())
    }

    pub fn reserve_new_page(
        &self,
        resource_id: ResourceId,
    ) -> Result<PageHandle, BufferPoolError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BufferPoolError::Closed);
        }
        let entry = self.resource_entry(resource_id)?;
        self.check_last_error(&entry)?;

        let mut buffer = vec![0u8; entry.page_size as usize];
        let page_number = entry
            .manager
            .lock()
            .unwrap()
            .reserve_new_page(&mut buffer)?;
        let wrapper = PageWrapper::new(page_number, true);
        let evicted = entry.cache.add_page(resource_id, buffer, wrapper)?;
        self.enqueue_flush_if_dirty(&entry, evicted);

        let handle = entry
            .cache
            .get_page(resource_id, page_number)
            .ok_or(BufferPoolError::Closed)?;
        reject_if_expired(handle)
    }

    /// Flush dirty pages, drain background workers, and close every
    /// registered resource manager. Idempotent.
    pub fn close(&self) -> Result<(), BufferPoolError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let resources: Vec<(ResourceId, Arc<ResourceEntry>)> =
            self.resources.write().unwrap().drain().collect();

        for (resource_id, entry) in &resources {
            for handle in entry.cache.get_all_for_resource(*resource_id) {
                if handle.wrapper.is_modified() {
                    let bytes = handle.buffer.lock().unwrap().clone();
                    entry.manager.lock().unwrap().write_page(&bytes, &handle.wrapper)?;
                    handle.wrapper.set_modified(false);
                }
            }
        }

        for _ in 0..READ_WORKER_THREADS {
            let _ = self.read_tx.send(ReadJob::Shutdown);
        }
        for _ in 0..WRITE_WORKER_THREADS {
            let _ = self.write_tx.send(WriteJob::Shutdown);
        }
        for handle in self.workers.lock().unwrap().drain(..) {
            let _ = handle.join();
        }

        for (resource_id, entry) in resources {
            match Arc::try_unwrap(entry) {
                Ok(entry) => match Arc::try_unwrap(entry.manager) {
                    Ok(manager) => {
                        manager.into_inner().unwrap().close()?;
                    }
                    Err(_) => warn!(
                        "resource {} still has outstanding references at close",
                        resource_id
                    ),
                },
                Err(_) => warn!(
                    "resource {} still has outstanding references at close",
                    resource_id
                ),
            }
        }
        Ok(())
    }

    fn fetch(
        &self,
        resource_id: ResourceId,
        page_number: u32,
        pin: bool,
    ) -> Result<PageHandle, BufferPoolError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BufferPoolError::Closed);
        }
        let entry = self.resource_entry(resource_id)?;

        let hit = if pin {
            entry.cache.get_and_pin(resource_id, page_number)
        } else {
            entry.cache.get_page(resource_id, page_number)
        };
        if let Some(handle) = hit {
            return reject_if_expired(handle);
        }
        self.check_last_error(&entry)?;

        let key = (resource_id, page_number);
        let (waiter, is_owner) = {
            let mut in_flight = self.in_flight.lock().unwrap();
            if let Some(waiter) = in_flight.get(&key) {
                (waiter.clone(), false)
            } else {
                let waiter = Arc::new(Waiter::default());
                in_flight.insert(key, waiter.clone());
                (waiter, true)
            }
        };

        if is_owner {
            self.read_tx
                .send(ReadJob::Fetch {
                    resource_id,
                    page_number,
                    page_size: entry.page_size,
                    pin,
                    manager: entry.manager.clone(),
                    cache: entry.cache.clone(),
                    write_tx: self.write_tx.clone(),
                    last_error: entry.last_error.clone(),
                    responder: Some(waiter.clone()),
                })
                .map_err(|_| BufferPoolError::Closed)?;
        }

        let result = waiter.wait();
        if is_owner {
            self.in_flight.lock().unwrap().remove(&key);
        }
        match result {
            Ok(handle) => reject_if_expired(handle),
            Err(message) => Err(BufferPoolError::Io(message)),
        }
    }

    fn resource_entry(&self, resource_id: ResourceId) -> Result<Arc<ResourceEntry>, BufferPoolError> {
        self.resources
            .read()
            .unwrap()
            .get(&resource_id)
            .cloned()
            .ok_or(BufferPoolError::UnknownResource(resource_id))
    }

    fn check_last_error(&self, entry: &ResourceEntry) -> Result<(), BufferPoolError> {
        if let Some(message) = entry.last_error.lock().unwrap().take() {
            return Err(BufferPoolError::Io(message));
        }
        Ok(())
    }

    fn enqueue_flush_if_dirty(&self, entry: &ResourceEntry, evicted: crate::cache::EvictedEntry) {
        if let Some(wrapper) = evicted.wrapper {
            if wrapper.is_modified() {
                let _ = self.write_tx.send(WriteJob::Flush {
                    manager: entry.manager.clone(),
                    buffer: evicted.buffer,
                    wrapper,
                    last_error: entry.last_error.clone(),
                });
            }
        }
    }

    fn cache_for_page_size(&self, page_size: u32) -> Arc<ArcCache> {
        let mut caches = self.caches.write().unwrap();
        caches
            .entry(page_size)
            .or_insert_with(|| {
                let capacity = self
                    .config
                    .cache_size_for_page
                    .get(&page_size)
                    .copied()
                    .unwrap_or(DEFAULT_CACHE_CAPACITY_PAGES);
                Arc::new(ArcCache::new(capacity, page_size))
            })
            .clone()
    }
}

/// Expiry is a one-way flag set by `ArcCache::expel_all_for_resource`: a
/// page can go stale while a handle to it is in flight to a waiting caller.
/// Every `PageHandle` handed out across the public API passes through here
/// so a caller never silently reads bytes behind an expelled resource.
fn reject_if_expired(handle: PageHandle) -> Result<PageHandle, BufferPoolError> {
    if handle.wrapper.is_expired() {
        return Err(PageError::Expired.into());
    }
    Ok(handle)
}

fn run_read_worker(rx: Arc<Mutex<mpsc::Receiver<ReadJob>>>) {
    loop {
        let job = {
            let rx = rx.lock().unwrap();
            rx.recv()
        };
        let job = match job {
            Ok(job) => job,
            Err(_) => break,
        };
        match job {
            ReadJob::Shutdown => break,
            ReadJob::Fetch {
                resource_id,
                page_number,
                page_size,
                pin,
                manager,
                cache,
                write_tx,
                last_error,
                responder,
            } => {
                let result = fetch_and_admit(
                    resource_id,
                    page_number,
                    page_size,
                    pin,
                    &manager,
                    &cache,
                    &write_tx,
                );
                if let Err(message) = &result {
                    *last_error.lock().unwrap() = Some(message.clone());
                }
                if let Some(responder) = responder {
                    responder.fulfill(result);
                }
            }
        }
    }
}

fn fetch_and_admit(
    resource_id: ResourceId,
    page_number: u32,
    page_size: u32,
    pin: bool,
    manager: &Arc<Mutex<TableResourceManager>>,
    cache: &Arc<ArcCache>,
    write_tx: &mpsc::Sender<WriteJob>,
) -> Result<PageHandle, String> {
    let mut buffer = vec![0u8; page_size as usize];
    manager
        .lock()
        .unwrap()
        .read_page(&mut buffer, page_number)
        .map_err(|e| e.to_string())?;

    let wrapper = PageWrapper::new(page_number, false);
    match cache.add_page(resource_id, buffer, wrapper) {
        Ok(evicted) => {
            if let Some(victim_wrapper) = evicted.wrapper {
                if victim_wrapper.is_modified() {
                    let _ = write_tx.send(WriteJob::Flush {
                        manager: manager.clone(),
                        buffer: evicted.buffer,
                        wrapper: victim_wrapper,
                        last_error: Arc::new(Mutex::new(None)),
                    });
                }
            }
            let handle = if pin {
                cache.get_and_pin(resource_id, page_number)
            } else {
                cache.get_page(resource_id, page_number)
            };
            handle.ok_or_else(|| "page vanished immediately after admission".to_string())
        }
        // Another caller raced us to admit the same key (e.g. a prefetch
        // overlapping a real fetch); the resident entry already satisfies us.
        Err(CacheError::Duplicate) => {
            let handle = if pin {
                cache.get_and_pin(resource_id, page_number)
            } else {
                cache.get_page(resource_id, page_number)
            };
            handle.ok_or_else(|| "duplicate admission raced out the entry".to_string())
        }
        Err(e) => Err(e.to_string()),
    }
}

fn run_write_worker(rx: Arc<Mutex<mpsc::Receiver<WriteJob>>>) {
    loop {
        let job = {
            let rx = rx.lock().unwrap();
            rx.recv()
        };
        let job = match job {
            Ok(job) => job,
            Err(_) => break,
        };
        match job {
            WriteJob::Shutdown => break,
            WriteJob::Flush {
                manager,
                buffer,
                wrapper,
                last_error,
            } => {
                let bytes = buffer.lock().unwrap().clone();
                match manager.lock().unwrap().write_page(&bytes, &wrapper) {
                    Ok(()) => wrapper.set_modified(false),
                    Err(e) => {
                        warn!("write worker failed to flush page: {}", e);
                        *last_error.lock().unwrap() = Some(e.to_string());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnSchema, TableSchema};
    use crate::types::ColumnType;
    use std::thread;
    use std::time::{Duration, Instant};

    fn schema() -> TableSchema {
        TableSchema::new(
            vec![ColumnSchema::new("id", ColumnType::Int, false, false)],
            4096,
        )
        .unwrap()
    }

    fn config_with_capacity(page_size: u32, capacity: usize) -> Config {
        let mut config = Config::default();
        config.cache_size_for_page.clear();
        config.cache_size_for_page.insert(page_size, capacity);
        config
    }

    #[test]
    fn unknown_resource_is_rejected() {
        let pool = BufferPool::new(Config::default());
        let err = pool.get_page(42, 0).unwrap_err();
        assert!(matches!(err, BufferPoolError::UnknownResource(42)));
        pool.close().unwrap();
    }

    #[test]
    fn reserve_then_close_flushes_dirty_pages_and_releases_the_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.tbl");
        let manager = TableResourceManager::create(&path, schema()).unwrap();

        let pool = BufferPool::new(config_with_capacity(4096, 10));
        pool.register_resource(0, manager).unwrap();

        let handle = pool.reserve_new_page(0).unwrap();
        let page_number = handle.wrapper.page_number();
        handle.buffer.lock().unwrap()[40] = 7;
        handle.wrapper.set_modified(true);

        pool.close().unwrap();

        let reopened = TableResourceManager::open(&path).unwrap();
        let mut buf = vec![0u8; 4096];
        reopened.read_page(&mut buf, page_number).unwrap();
        assert_eq!(buf[40], 7);
    }

    #[test]
    fn cache_miss_is_served_and_repeat_fetch_hits_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.tbl");
        let manager = TableResourceManager::create(&path, schema()).unwrap();
        let pool = BufferPool::new(config_with_capacity(4096, 10));
        pool.register_resource(0, manager).unwrap();

        let reserved = pool.reserve_new_page(0).unwrap();
        let page_number = reserved.wrapper.page_number();
        pool.unpin_page(0, page_number);

        let first = pool.get_page(0, page_number).unwrap();
        let second = pool.get_page(0, page_number).unwrap();
        assert_eq!(first.wrapper.page_number(), second.wrapper.page_number());
        pool.close().unwrap();
    }

    #[test]
    fn pinned_page_survives_many_distinct_admissions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.tbl");
        let manager = TableResourceManager::create(&path, schema()).unwrap();
        let pool = BufferPool::new(config_with_capacity(4096, 2));
        pool.register_resource(0, manager).unwrap();

        let reserved = pool.reserve_new_page(0).unwrap();
        let pinned_page_number = reserved.wrapper.page_number();
        pool.get_page_and_pin(0, pinned_page_number).unwrap();

        for _ in 0..5 {
            pool.reserve_new_page(0).unwrap();
        }
        assert!(pool.get_page(0, pinned_page_number).is_ok());
        pool.close().unwrap();
    }

    #[test]
    fn expired_page_is_rejected_instead_of_handed_back_stale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.tbl");
        let manager = TableResourceManager::create(&path, schema()).unwrap();
        let pool = BufferPool::new(config_with_capacity(4096, 10));
        pool.register_resource(0, manager).unwrap();

        let reserved = pool.reserve_new_page(0).unwrap();
        let page_number = reserved.wrapper.page_number();
        pool.unpin_page(0, page_number);

        let entry = pool.resource_entry(0).unwrap();
        entry.cache.expel_all_for_resource(0);

        let err = pool.get_page(0, page_number).unwrap_err();
        assert!(matches!(err, BufferPoolError::Page(PageError::Expired)));
        pool.close().unwrap();
    }

    #[test]
    fn prefetch_makes_an_evicted_page_resident_again_without_blocking_the_caller() {
        let _ = env_logger::try_init();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.tbl");
        let manager = TableResourceManager::create(&path, schema()).unwrap();
        let pool = BufferPool::new(config_with_capacity(4096, 1));
        pool.register_resource(0, manager).unwrap();

        let first = pool.reserve_new_page(0).unwrap();
        let first_page_number = first.wrapper.page_number();
        drop(first);
        // Capacity 1: reserving a second page evicts (and, being dirty,
        // flushes) the first.
        pool.reserve_new_page(0).unwrap();
        assert!(pool.get_page(0, first_page_number).is_err());

        pool.prefetch_pages(0, first_page_number, 1).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if pool.get_page(0, first_page_number).is_ok() {
                break;
            }
            assert!(Instant::now() < deadline, "prefetch did not complete in time");
            thread::sleep(Duration::from_millis(10));
        }
        pool.close().unwrap();
    }
}
