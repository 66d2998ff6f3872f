/*
 * Copyright (c) 2020 - 2021.  Shoyo Inokuchi.
 * Please refer to github.com/shoyo/jin for more information about this project and its license.
 */

//! The storage and execution core of a small teaching relational database
//! engine: binary table pages, an ARC-style page cache, per-table resource
//! managers, and a bounded query heap for external merge-sort.

pub mod buffer_pool;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod heap;
pub mod page;
pub mod resource;
pub mod schema;
pub mod types;
pub mod value;

pub use catalog::ResourceId;
pub use config::Config;
pub use schema::TableSchema;
