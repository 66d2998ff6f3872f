/*
 * Copyright (c) 2020 - 2021.  Shoyo Inokuchi.
 * Please refer to github.com/shoyo/jin for more information about this project and its license.
 */

//! Instance configuration: data/tempspace directories, query heap size,
//! per-page-size cache capacities, I/O worker counts, and the optimizer's
//! sequential/random I/O cost constants. Persisted as XML in the legacy
//! format; paths are resolved relative to the current working directory.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

const DEFAULT_QUERY_HEAP_SIZE: u64 = 20 * 1024 * 1024;
const DEFAULT_CACHE_PAGE_SIZE: u32 = 4096;
const DEFAULT_CACHE_CAPACITY_PAGES: usize = 1000;
const DEFAULT_NUM_IO_BUFFERS: usize = 128;
const DEFAULT_NUM_CONCURRENT_QUERIES: usize = 8;
const DEFAULT_BLOCK_READ_TRANSFER_NSECS: u64 = 40_000;
const DEFAULT_BLOCK_WRITE_TRANSFER_NSECS: u64 = 40_000;
const DEFAULT_BLOCK_RANDOM_READ_OVERHEAD_NSECS: u64 = 100_000;
const DEFAULT_BLOCK_RANDOM_WRITE_OVERHEAD_NSECS: u64 = 100_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration XML: {0}")]
    Deserialize(String),
    #[error("failed to serialize configuration to XML: {0}")]
    Serialize(String),
    #[error("configuration key {0:?} has a non-integer value {1:?}")]
    NotAnInteger(String, String),
    #[error("configuration key {0:?} does not name a page size")]
    BadCacheSizeKey(String),
}

/// Instance-wide configuration, matching the legacy key/value document.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub data_directory: PathBuf,
    pub tempspace_directory: PathBuf,
    pub query_heap_size: u64,
    pub cache_size_for_page: BTreeMap<u32, usize>,
    pub num_io_buffers: usize,
    pub num_concurrent_queries: usize,
    pub block_read_transfer_nsecs: u64,
    pub block_write_transfer_nsecs: u64,
    pub block_random_read_overhead_nsecs: u64,
    pub block_random_write_overhead_nsecs: u64,
}

impl Default for Config {
    fn default() -> Self {
        let mut cache_size_for_page = BTreeMap::new();
        cache_size_for_page.insert(DEFAULT_CACHE_PAGE_SIZE, DEFAULT_CACHE_CAPACITY_PAGES);
        Self {
            data_directory: PathBuf::from("."),
            tempspace_directory: PathBuf::from("./tmp"),
            query_heap_size: DEFAULT_QUERY_HEAP_SIZE,
            cache_size_for_page,
            num_io_buffers: DEFAULT_NUM_IO_BUFFERS,
            num_concurrent_queries: DEFAULT_NUM_CONCURRENT_QUERIES,
            block_read_transfer_nsecs: DEFAULT_BLOCK_READ_TRANSFER_NSECS,
            block_write_transfer_nsecs: DEFAULT_BLOCK_WRITE_TRANSFER_NSECS,
            block_random_read_overhead_nsecs: DEFAULT_BLOCK_RANDOM_READ_OVERHEAD_NSECS,
            block_random_write_overhead_nsecs: DEFAULT_BLOCK_RANDOM_WRITE_OVERHEAD_NSECS,
        }
    }
}

impl Config {
    /// Load a configuration document from `path`, resolved relative to the
    /// current working directory.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let xml = fs::read_to_string(path)?;
        let document: Document =
            quick_xml::de::from_str(&xml).map_err(|e| ConfigError::Deserialize(e.to_string()))?;
        Config::from_document(document)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let document = self.to_document();
        let xml =
            quick_xml::se::to_string(&document).map_err(|e| ConfigError::Serialize(e.to_string()))?;
        fs::write(path, xml)?;
        Ok(())
    }

    fn from_document(document: Document) -> Result<Self, ConfigError> {
        let mut config = Config::default();
        config.cache_size_for_page.clear();

        for entry in document.entries {
            match entry.key.as_str() {
                "DATA_DIRECTORY" => config.data_directory = PathBuf::from(entry.value),
                "TEMPSPACE_DIRECTORY" => config.tempspace_directory = PathBuf::from(entry.value),
                "QUERY_HEAP_SIZE" => config.query_heap_size = parse_u64(&entry)?,
                "NUM_IO_BUFFERS" => config.num_io_buffers = parse_u64(&entry)? as usize,
                "NUM_CONCURRENT_QUERIES" => {
                    config.num_concurrent_queries = parse_u64(&entry)? as usize
                }
                "BLOCK_READ_TRANSFER_NSECS" => config.block_read_transfer_nsecs = parse_u64(&entry)?,
                "BLOCK_WRITE_TRANSFER_NSECS" => {
                    config.block_write_transfer_nsecs = parse_u64(&entry)?
                }
                "BLOCK_RANDOM_READ_OVERHEAD_NSECS" => {
                    config.block_random_read_overhead_nsecs = parse_u64(&entry)?
                }
                "BLOCK_RANDOM_WRITE_OVERHEAD_NSECS" => {
                    config.block_random_write_overhead_nsecs = parse_u64(&entry)?
                }
                key if key.starts_with("CACHE_SIZE_FOR_PAGE_") => {
                    let page_size: u32 = key["CACHE_SIZE_FOR_PAGE_".len()..]
                        .parse()
                        .map_err(|_| ConfigError::BadCacheSizeKey(key.to_string()))?;
                    let capacity = parse_u64(&entry)? as usize;
                    config.cache_size_for_page.insert(page_size, capacity);
                }
                _ => {}
            }
        }

        if config.cache_size_for_page.is_empty() {
            config
                .cache_size_for_page
                .insert(DEFAULT_CACHE_PAGE_SIZE, DEFAULT_CACHE_CAPACITY_PAGES);
        }
        Ok(config)
    }

    fn to_document(&self) -> Document {
        let mut entries = vec![
            entry("DATA_DIRECTORY", self.data_directory.display().to_string()),
            entry(
                "TEMPSPACE_DIRECTORY",
                self.tempspace_directory.display().to_string(),
            ),
            entry("QUERY_HEAP_SIZE", self.query_heap_size.to_string()),
            entry("NUM_IO_BUFFERS", self.num_io_buffers.to_string()),
            entry(
                "NUM_CONCURRENT_QUERIES",
                self.num_concurrent_queries.to_string(),
            ),
            entry(
                "BLOCK_READ_TRANSFER_NSECS",
                self.block_read_transfer_nsecs.to_string(),
            ),
            entry(
                "BLOCK_WRITE_TRANSFER_NSECS",
                self.block_write_transfer_nsecs.to_string(),
            ),
            entry(
                "BLOCK_RANDOM_READ_OVERHEAD_NSECS",
                self.block_random_read_overhead_nsecs.to_string(),
            ),
            entry(
                "BLOCK_RANDOM_WRITE_OVERHEAD_NSECS",
                self.block_random_write_overhead_nsecs.to_string(),
            ),
        ];
        for (page_size, capacity) in &self.cache_size_for_page {
            entries.push(entry(
                &format!("CACHE_SIZE_FOR_PAGE_{}", page_size),
                capacity.to_string(),
            ));
        }
        Document { entries }
    }
}

fn entry(key: &str, value: String) -> ConfigEntry {
    ConfigEntry {
        key: key.to_string(),
        value,
    }
}

fn parse_u64(entry: &ConfigEntry) -> Result<u64, ConfigError> {
    entry
        .value
        .parse()
        .map_err(|_| ConfigError::NotAnInteger(entry.key.clone(), entry.value.clone()))
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename = "configuration")]
struct Document {
    #[serde(rename = "entry", default)]
    entries: Vec<ConfigEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ConfigEntry {
    #[serde(rename = "@key")]
    key: String,
    #[serde(rename = "@value")]
    value: String,
}
