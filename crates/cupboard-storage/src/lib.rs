//! Cupboard Storage - JSONL files with a rebuildable Turso cache
//!
//! This crate persists the cupboard entities. The JSONL files are the
//! durable, git-friendly source of truth; the database is a relational
//! mirror used for filtering and lookups that can be deleted at any time.
//!
//! # Overview
//!
//! - WAL mode for the cache database
//! - One transaction per logical operation, cascades included
//! - JSONL rewrites governed by the configured sync strategy
//! - Automatic rebuild when the cache is missing, unreadable or stale
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │         Application Layer (CLI)             │
//! └─────────────────┬───────────────────────────┘
//!                   │ get_table(name)
//! ┌─────────────────▼───────────────────────────┐
//! │         Cupboard / Table                    │
//! │  • Get / Set / Fetch / Delete               │
//! │  • validation, backfill, cascades           │
//! └─────────────────┬───────────────────────────┘
//!                   │ Vec<Mutation>
//! ┌─────────────────▼───────────────────────────┐
//! │         SyncManager                         │
//! │  • cache transaction                        │
//! │  • JSONL rewrite per strategy               │
//! └────────┬───────────────────────┬────────────┘
//!          │                       │
//! ┌────────▼─────────┐   ┌─────────▼───────────┐
//! │  cupboard.db     │   │  {table}.jsonl      │
//! └──────────────────┘   └─────────────────────┘
//! ```
//!
//! # Example Usage
//!
//! ```no_run
//! use cupboard_core::{CupboardConfig, Filter};
//! use cupboard_storage::Cupboard;
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let cupboard = Cupboard::attach(CupboardConfig::new(".cupboard")).await?;
//!
//! let crumbs = cupboard.get_table("crumbs")?;
//! let id = crumbs.set_json("", json!({"name": "Write docs", "state": "draft"})).await?;
//!
//! let mut filter = Filter::new();
//! filter.insert("states".to_string(), json!(["draft"]));
//! let drafts = crumbs.fetch(&filter).await?;
//! println!("{} drafts, newest {}", drafts.len(), id);
//!
//! cupboard.detach().await?;
//! # Ok(())
//! # }
//! ```

pub mod cupboard;
pub mod db;
pub mod jsonl;
pub mod sync;
pub mod table;

pub use cupboard::Cupboard;
pub use cupboard_core::{Error, Result};
pub use db::{Database, Mutation};
pub use jsonl::{file_signature, read_table_file, table_path, write_table_file, FileSignature};
pub use sync::{FlushStats, RebuildReason, RebuildStats, SyncManager};
pub use table::Table;
