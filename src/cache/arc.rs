/*
 * Copyright (c) 2020 - 2021.  Shoyo Inokuchi.
 * Please refer to github.com/shoyo/jin for more information about this project and its license.
 */

//! Four-list ARC (Adaptive Replacement Cache) admission and eviction.
//!
//! `T1`/`T2` hold resident pages (referenced once vs. referenced multiple
//! times); `B1`/`B2` are ghost lists of recently evicted keys used to adapt
//! the target size `p` of `T1`. See Megiddo & Modha, "ARC: A Self-Tuning,
//! Low Overhead Replacement Cache".

use crate::cache::{CacheError, EvictedEntry, PageHandle, PageWrapper};
use crate::catalog::ResourceId;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

type Key = (ResourceId, u32);

struct Entry {
    buffer: Arc<Mutex<Vec<u8>>>,
    wrapper: PageWrapper,
    pin_count: u32,
    /// One-shot anti-prefetch credit: the first access after admission does
    /// not promote the page out of T1.
    fresh: bool,
}

struct Inner {
    p: usize,
    t1: VecDeque<Key>,
    t2: VecDeque<Key>,
    b1: VecDeque<Key>,
    b2: VecDeque<Key>,
    entries: HashMap<Key, Entry>,
}

/// A bounded cache of pages keyed by `(resource_id, page_number)`, with ARC
/// replacement. All replacement decisions are made under a single exclusive
/// lock.
pub struct ArcCache {
    capacity: usize,
    page_size: u32,
    inner: Mutex<Inner>,
}

impl ArcCache {
    pub fn new(capacity: usize, page_size: u32) -> Self {
        Self {
            capacity,
            page_size,
            inner: Mutex::new(Inner {
                p: 0,
                t1: VecDeque::new(),
                t2: VecDeque::new(),
                b1: VecDeque::new(),
                b2: VecDeque::new(),
                entries: HashMap::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of resident (non-ghost) entries.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.t1.len() + inner.t2.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Admit a page. Fails if an entry already exists for this key.
    pub fn add_page(
        &self,
        resource_id: ResourceId,
        buffer: Vec<u8>,
        wrapper: PageWrapper,
    ) -> Result<EvictedEntry, CacheError> {
        let capacity = self.capacity;
        let mut inner = self.inner.lock().unwrap();
        let key = (resource_id, wrapper.page_number());
        if inner.entries.contains_key(&key) {
            return Err(CacheError::Duplicate);
        }

        let b1_hit = inner.b1.iter().any(|k| *k == key);
        let b2_hit = !b1_hit && inner.b2.iter().any(|k| *k == key);

        let victim = if b1_hit {
            let b1_len = inner.b1.len().max(1);
            let b2_len = inner.b2.len();
            inner.p = (inner.p + (b2_len / b1_len).max(1)).min(capacity);
            remove_key(&mut inner.b1, &key);
            Some(inner.replace(capacity, false)?)
        } else if b2_hit {
            let b2_len = inner.b2.len().max(1);
            let b1_len = inner.b1.len();
            inner.p = inner.p.saturating_sub((b1_len / b2_len).max(1));
            remove_key(&mut inner.b2, &key);
            Some(inner.replace(capacity, true)?)
        } else if inner.t1.len() + inner.b1.len() == capacity {
            if inner.t1.len() < capacity {
                inner.b1.pop_front();
                Some(inner.replace(capacity, false)?)
            } else {
                Some(inner.evict_direct_from_t1()?)
            }
        } else {
            let total = inner.t1.len() + inner.t2.len() + inner.b1.len() + inner.b2.len();
            if total >= capacity {
                if total >= 2 * capacity {
                    inner.b2.pop_front();
                }
                Some(inner.replace(capacity, false)?)
            } else {
                None
            }
        };

        let promoted = b1_hit || b2_hit;
        inner.entries.insert(
            key,
            Entry {
                buffer: Arc::new(Mutex::new(buffer)),
                wrapper: wrapper.clone(),
                pin_count: 0,
                fresh: !promoted,
            },
        );
        if promoted {
            inner.t2.push_back(key);
        } else {
            inner.t1.push_back(key);
        }

        Ok(match victim {
            None => EvictedEntry {
                buffer: Arc::new(Mutex::new(vec![0u8; self.page_size as usize])),
                wrapper: None,
                resource_id: -1,
                page_number: 0,
            },
            Some((vkey, ventry)) => EvictedEntry {
                buffer: ventry.buffer,
                wrapper: if ventry.wrapper.is_expired() {
                    None
                } else {
                    Some(ventry.wrapper)
                },
                resource_id: vkey.0,
                page_number: vkey.1,
            },
        })
    }

    pub fn get_page(&self, resource_id: ResourceId, page_number: u32) -> Option<PageHandle> {
        self.get_internal(resource_id, page_number, false)
    }

    pub fn get_and_pin(&self, resource_id: ResourceId, page_number: u32) -> Option<PageHandle> {
        self.get_internal(resource_id, page_number, true)
    }

    fn get_internal(&self, resource_id: ResourceId, page_number: u32, pin: bool) -> Option<PageHandle> {
        let mut inner = self.inner.lock().unwrap();
        let key = (resource_id, page_number);
        if !inner.entries.contains_key(&key) {
            return None;
        }

        let was_fresh = inner.entries.get(&key).unwrap().fresh;
        if was_fresh {
            inner.entries.get_mut(&key).unwrap().fresh = false;
        } else if let Some(pos) = inner.t1.iter().position(|k| *k == key) {
            inner.t1.remove(pos);
            inner.t2.push_back(key);
        } else if let Some(pos) = inner.t2.iter().position(|k| *k == key) {
            inner.t2.remove(pos);
            inner.t2.push_back(key);
        }

        let entry = inner.entries.get_mut(&key).unwrap();
        if pin {
            entry.pin_count += 1;
        }
        Some(PageHandle {
            buffer: entry.buffer.clone(),
            wrapper: entry.wrapper.clone(),
        })
    }

    pub fn unpin_page(&self, resource_id: ResourceId, page_number: u32) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.entries.get_mut(&(resource_id, page_number)) {
            if entry.pin_count > 0 {
                entry.pin_count -= 1;
            }
        }
    }

    /// Mark every entry for `resource_id` expired. They remain resident
    /// until the next eviction, but are preferred as victims over
    /// non-expired entries.
    pub fn expel_all_for_resource(&self, resource_id: ResourceId) {
        let inner = self.inner.lock().unwrap();
        for (key, entry) in inner.entries.iter() {
            if key.0 == resource_id {
                entry.wrapper.mark_expired();
            }
        }
    }

    /// Every currently-cached, non-expired entry for `resource_id`, in no
    /// particular order.
    pub fn get_all_for_resource(&self, resource_id: ResourceId) -> Vec<PageHandle> {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .iter()
            .filter(|(key, entry)| key.0 == resource_id && !entry.wrapper.is_expired())
            .map(|(_, entry)| PageHandle {
                buffer: entry.buffer.clone(),
                wrapper: entry.wrapper.clone(),
            })
            .collect()
    }
}

impl Inner {
    fn replace(&mut self, capacity: usize, x_in_b2: bool) -> Result<(Key, Entry), CacheError> {
        if let Some((from_t2, idx)) = self.first_expired_unpinned() {
            return Ok(self.evict_at(capacity, from_t2, idx));
        }

        let prefer_t1 =
            !self.t1.is_empty() && ((x_in_b2 && self.t1.len() == self.p) || self.t1.len() > self.p);

        if prefer_t1 {
            if let Some(idx) = first_unpinned(&self.t1, &self.entries) {
                return Ok(self.evict_at(capacity, false, idx));
            }
            if let Some(idx) = first_unpinned(&self.t2, &self.entries) {
                return Ok(self.evict_at(capacity, true, idx));
            }
        } else {
            if let Some(idx) = first_unpinned(&self.t2, &self.entries) {
                return Ok(self.evict_at(capacity, true, idx));
            }
            if let Some(idx) = first_unpinned(&self.t1, &self.entries) {
                return Ok(self.evict_at(capacity, false, idx));
            }
        }
        Err(CacheError::NoUnpinnedVictim)
    }

    fn evict_direct_from_t1(&mut self) -> Result<(Key, Entry), CacheError> {
        let idx = self
            .t1
            .iter()
            .position(|k| {
                let e = &self.entries[k];
                e.pin_count == 0 && e.wrapper.is_expired()
            })
            .or_else(|| first_unpinned(&self.t1, &self.entries));
        match idx {
            Some(i) => {
                let key = self.t1.remove(i).unwrap();
                let entry = self.entries.remove(&key).unwrap();
                Ok((key, entry))
            }
            None => Err(CacheError::NoUnpinnedVictim),
        }
    }

    fn first_expired_unpinned(&self) -> Option<(bool, usize)> {
        if let Some(idx) = self.t1.iter().position(|k| {
            let e = &self.entries[k];
            e.pin_count == 0 && e.wrapper.is_expired()
        }) {
            return Some((false, idx));
        }
        if let Some(idx) = self.t2.iter().position(|k| {
            let e = &self.entries[k];
            e.pin_count == 0 && e.wrapper.is_expired()
        }) {
            return Some((true, idx));
        }
        None
    }

    fn evict_at(&mut self, capacity: usize, from_t2: bool, idx: usize) -> (Key, Entry) {
        let key = if from_t2 {
            self.t2.remove(idx).unwrap()
        } else {
            self.t1.remove(idx).unwrap()
        };
        let entry = self.entries.remove(&key).unwrap();
        if !entry.wrapper.is_expired() {
            if from_t2 {
                self.b2.push_back(key);
                while self.t2.len() + self.b2.len() > 2 * capacity {
                    self.b2.pop_front();
                }
            } else {
                self.b1.push_back(key);
                while self.t1.len() + self.b1.len() > capacity {
                    self.b1.pop_front();
                }
            }
        }
        (key, entry)
    }
}

fn first_unpinned(deque: &VecDeque<Key>, entries: &HashMap<Key, Entry>) -> Option<usize> {
    deque.iter().position(|k| entries[k].pin_count == 0)
}

fn remove_key(deque: &mut VecDeque<Key>, key: &Key) {
    if let Some(pos) = deque.iter().position(|k| k == key) {
        deque.remove(pos);
    }
}
