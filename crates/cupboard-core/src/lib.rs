//! Core types for the cupboard entity store.
//!
//! This crate holds the entity records (crumbs, trails, links, properties,
//! categories, stashes, metadata), their lifecycle rules, the table-level
//! vocabulary shared with the storage layer, and the error taxonomy. It does
//! no I/O beyond reading `config.toml`.

pub mod config;
pub mod error;
pub mod schema;
pub mod stash;
pub mod types;

pub use config::{Backend, CupboardConfig, SyncStrategy, CACHE_FILE, CONFIG_FILE};
pub use error::{Error, Result};
pub use schema::{resolve_filter, Condition, Entity, Filter, TableName};
pub use stash::{Stash, StashType};

// Re-export main types for convenience
pub use types::{
    format_timestamp, new_id, parse_timestamp, Category, Crumb, CrumbState, Link, LinkType,
    Metadata, MetadataTable, Property, Trail, TrailState, ValueType,
};
