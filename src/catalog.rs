/*
 * Copyright (c) 2020 - 2021.  Shoyo Inokuchi.
 * Please refer to github.com/shoyo/jin for more information about this project and its license.
 */

//! A persisted list of table and index descriptors. IDs are assigned once
//! at startup and are stable for the lifetime of the instance, but are
//! never themselves persisted.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::RwLock;
use thiserror::Error;

/// A process-unique, startup-assigned resource identifier. Used as part of
/// page cache keys. `-1` is reserved by the cache as the "no resource" blank
/// slot sentinel and is never assigned to a real resource.
pub type ResourceId = i64;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("a table named {0:?} is already registered")]
    DuplicateTableName(String),
    #[error("an index named {0:?} is already registered")]
    DuplicateIndexName(String),
    #[error("no table named {0:?} is registered")]
    UnknownTable(String),
    #[error("no index named {0:?} is registered")]
    UnknownIndex(String),
}

#[derive(Debug, Clone)]
pub struct TableDescriptor {
    pub name: String,
    pub file: PathBuf,
    pub row_count_estimate: u64,
}

#[derive(Debug, Clone)]
pub struct IndexDescriptor {
    pub name: String,
    pub table: String,
    pub file: PathBuf,
    pub entry_count_estimate: u64,
}

#[derive(Default)]
pub struct Catalog {
    tables: RwLock<HashMap<ResourceId, TableDescriptor>>,
    table_ids: RwLock<HashMap<String, ResourceId>>,
    indexes: RwLock<HashMap<ResourceId, IndexDescriptor>>,
    index_ids: RwLock<HashMap<String, ResourceId>>,
    next_resource_id: AtomicI64,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> ResourceId {
        self.next_resource_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn register_table(&self, name: &str, file: PathBuf) -> Result<ResourceId, CatalogError> {
        let mut table_ids = self.table_ids.write().unwrap();
        if table_ids.contains_key(name) {
            return Err(CatalogError::DuplicateTableName(name.to_string()));
        }
        let id = self.next_id();
        table_ids.insert(name.to_string(), id);
        self.tables.write().unwrap().insert(
            id,
            TableDescriptor {
                name: name.to_string(),
                file,
                row_count_estimate: 0,
            },
        );
        Ok(id)
    }

    pub fn register_index(
        &self,
        name: &str,
        table: &str,
        file: PathBuf,
    ) -> Result<ResourceId, CatalogError> {
        let mut index_ids = self.index_ids.write().unwrap();
        if index_ids.contains_key(name) {
            return Err(CatalogError::DuplicateIndexName(name.to_string()));
        }
        let id = self.next_id();
        index_ids.insert(name.to_string(), id);
        self.indexes.write().unwrap().insert(
            id,
            IndexDescriptor {
                name: name.to_string(),
                table: table.to_string(),
                file,
                entry_count_estimate: 0,
            },
        );
        Ok(id)
    }

    pub fn table_id(&self, name: &str) -> Result<ResourceId, CatalogError> {
        self.table_ids
            .read()
            .unwrap()
            .get(name)
            .copied()
            .ok_or_else(|| CatalogError::UnknownTable(name.to_string()))
    }

    pub fn table(&self, id: ResourceId) -> Option<TableDescriptor> {
        self.tables.read().unwrap().get(&id).cloned()
    }

    pub fn index_id(&self, name: &str) -> Result<ResourceId, CatalogError> {
        self.index_ids
            .read()
            .unwrap()
            .get(name)
            .copied()
            .ok_or_else(|| CatalogError::UnknownIndex(name.to_string()))
    }

    pub fn index(&self, id: ResourceId) -> Option<IndexDescriptor> {
        self.indexes.read().unwrap().get(&id).cloned()
    }

    pub fn set_table_row_count_estimate(&self, id: ResourceId, estimate: u64) {
        if let Some(descriptor) = self.tables.write().unwrap().get_mut(&id) {
            descriptor.row_count_estimate = estimate;
        }
    }

    pub fn set_index_entry_count_estimate(&self, id: ResourceId, estimate: u64) {
        if let Some(descriptor) = self.indexes.write().unwrap().get_mut(&id) {
            descriptor.entry_count_estimate = estimate;
        }
    }
}
