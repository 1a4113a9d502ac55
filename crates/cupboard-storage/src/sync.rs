//! Sync module for coordinating the JSONL files with the cache database.
//!
//! `SyncManager` owns the cache and decides when committed mutations are
//! mirrored into the JSONL files:
//!
//! - Immediate: affected files are rewritten before `commit` returns
//! - Batch: files are rewritten once `batch_size` operations are pending
//! - OnClose: files are rewritten only by an explicit flush (detach)
//!
//! It also rebuilds the cache from JSONL when the database is missing,
//! unreadable, or was left behind by out-of-band edits to the files.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────┐
//! │              File System                          │
//! │  crumbs.jsonl  trails.jsonl  links.jsonl  ...     │
//! └───────────────┬───────────────────▲───────────────┘
//!        rebuild() │                   │ flush()
//!                 ▼                   │
//! ┌───────────────────────────────────────────────────┐
//! │           SyncManager                             │
//! │  • attach() - open or rebuild the cache           │
//! │  • commit() - apply one operation, maybe flush    │
//! │  • flush()  - rewrite dirty tables                │
//! └───────────────┬───────────────────────────────────┘
//!                 │
//!                 ▼
//! ┌───────────────────────────────────────────────────┐
//! │         Database (Turso)                          │
//! │  seven entity tables + sync_state                 │
//! └───────────────────────────────────────────────────┘
//! ```

use crate::db::{Database, Mutation};
use crate::jsonl::{file_signature, read_table_file, table_path, write_table_file};
use cupboard_core::{CupboardConfig, Entity, Result, SyncStrategy, TableName};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

/// Statistics for a cache rebuild
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebuildStats {
    /// Rows loaded per table
    pub rows: BTreeMap<TableName, usize>,
    /// Crumbs that were missing entries for defined properties
    pub crumbs_backfilled: usize,
}

impl RebuildStats {
    /// Returns total number of rows loaded
    pub fn total_rows(&self) -> usize {
        self.rows.values().sum()
    }

    pub fn rows_for(&self, table: TableName) -> usize {
        self.rows.get(&table).copied().unwrap_or(0)
    }
}

/// Statistics for a flush to JSONL
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushStats {
    /// Files rewritten, by table
    pub tables: Vec<TableName>,
    /// Rows written across all rewritten files
    pub rows_written: usize,
}

impl FlushStats {
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// Why attach decided to rebuild the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildReason {
    Missing,
    Unreadable,
    Stale,
    Requested,
}

pub struct SyncManager {
    db: Database,
    data_dir: PathBuf,
    strategy: SyncStrategy,
    batch_size: usize,
    pending: usize,
    dirty: BTreeSet<TableName>,
}

impl SyncManager {
    /// Open the cache for `config.data_dir`, rebuilding it from JSONL when it
    /// is missing, cannot be opened, or no longer matches the files.
    ///
    /// Returns the rebuild statistics when a rebuild happened.
    pub async fn attach(config: &CupboardConfig) -> Result<(Self, Option<RebuildStats>)> {
        config.validate()?;
        fs::create_dir_all(&config.data_dir).await?;
        let cache_path = config.cache_path();

        let mut reason = None;
        if !fs::try_exists(&cache_path).await? {
            // WAL files without their database are leftovers
            remove_cache_files(&cache_path).await?;
            reason = Some(RebuildReason::Missing);
        }

        let db = match open_cache(&cache_path).await {
            Ok(db) => db,
            Err(e) => {
                warn!("Cache at {} is unreadable ({}), recreating", cache_path.display(), e);
                remove_cache_files(&cache_path).await?;
                reason = Some(RebuildReason::Unreadable);
                open_cache(&cache_path).await?
            }
        };

        let mut manager = SyncManager {
            db,
            data_dir: config.data_dir.clone(),
            strategy: config.sync_strategy,
            batch_size: config.batch_size,
            pending: 0,
            dirty: BTreeSet::new(),
        };

        if reason.is_none() && manager.is_stale().await? {
            reason = Some(RebuildReason::Stale);
        }

        let stats = match reason {
            Some(reason) => Some(manager.rebuild(reason).await?),
            None => None,
        };

        debug!(
            "Attached cache {} (strategy {}, batch size {})",
            cache_path.display(),
            manager.strategy,
            manager.batch_size
        );
        Ok((manager, stats))
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn strategy(&self) -> SyncStrategy {
        self.strategy
    }

    /// Operations committed to the cache but not yet written to JSONL.
    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn dirty_tables(&self) -> impl Iterator<Item = TableName> + '_ {
        self.dirty.iter().copied()
    }

    /// True when any table file differs from the signature recorded at the
    /// last rewrite or rebuild.
    pub async fn is_stale(&self) -> Result<bool> {
        for table in TableName::ALL {
            let on_disk = file_signature(&table_path(&self.data_dir, *table)).await?;
            let recorded = self.db.signature(*table).await?;
            if on_disk != recorded {
                match recorded {
                    Some(sig) if sig.is_unflushed() => warn!(
                        "Cache holds changes to {} that never reached the file",
                        table.filename()
                    ),
                    _ => info!("Table file {} changed outside the cache", table.filename()),
                }
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Apply one logical operation to the cache, then mirror it to JSONL as
    /// the sync strategy dictates.
    ///
    /// The cache commit happens first; a failed commit leaves the files
    /// untouched. If the rewrite fails instead, the touched tables stay
    /// marked unflushed and the next attach rebuilds the cache from JSONL.
    pub async fn commit(&mut self, mutations: Vec<Mutation>) -> Result<()> {
        if mutations.is_empty() {
            return Ok(());
        }

        self.db.apply(&mutations).await?;
        for mutation in &mutations {
            self.dirty.insert(mutation.table());
        }
        self.pending += 1;

        let should_flush = match self.strategy {
            SyncStrategy::Immediate => true,
            SyncStrategy::Batch => self.pending >= self.batch_size,
            SyncStrategy::OnClose => false,
        };
        if should_flush {
            self.flush().await?;
        }
        Ok(())
    }

    /// Rewrite every dirty table file from the cache.
    pub async fn flush(&mut self) -> Result<FlushStats> {
        let mut stats = FlushStats::default();

        // Tables leave the dirty set only once their file is written, so a
        // failed flush is retried by the next one.
        while let Some(table) = self.dirty.first().copied() {
            let rows = self.db.fetch_all(table).await?;
            let path = table_path(&self.data_dir, table);
            let signature = write_table_file(&path, &rows).await?;
            self.db.record_signature(table, Some(&signature)).await?;

            debug!("Flushed {} rows to {}", rows.len(), path.display());
            stats.rows_written += rows.len();
            stats.tables.push(table);
            self.dirty.remove(&table);
        }
        self.pending = 0;

        if !stats.is_empty() {
            info!(
                "Flushed {} tables ({} rows) to JSONL",
                stats.tables.len(),
                stats.rows_written
            );
        }
        Ok(stats)
    }

    /// Replace the cache contents with what the JSONL files hold.
    ///
    /// Every file is parsed before the cache is touched, so a corrupt line
    /// fails the rebuild and leaves the cache as it was.
    pub async fn rebuild(&mut self, reason: RebuildReason) -> Result<RebuildStats> {
        info!("Rebuilding cache from {} ({:?})", self.data_dir.display(), reason);

        let mut loaded: BTreeMap<TableName, Vec<Entity>> = BTreeMap::new();
        for table in TableName::ALL {
            let rows = read_table_file(&table_path(&self.data_dir, *table), *table).await?;
            loaded.insert(*table, rows);
        }

        let crumbs_backfilled = backfill_loaded(&mut loaded)?;

        let mut stats = RebuildStats {
            crumbs_backfilled,
            ..Default::default()
        };
        let mut mutations: Vec<Mutation> = TableName::ALL.iter().copied().map(Mutation::Clear).collect();
        for (table, rows) in loaded {
            stats.rows.insert(table, rows.len());
            mutations.extend(rows.into_iter().map(Mutation::Upsert));
        }
        self.db.apply(&mutations).await?;

        for table in TableName::ALL {
            let signature = file_signature(&table_path(&self.data_dir, *table)).await?;
            self.db.record_signature(*table, signature.as_ref()).await?;
        }

        self.pending = 0;
        self.dirty.clear();
        if crumbs_backfilled > 0 {
            warn!(
                "Backfilled missing properties on {} crumbs during rebuild",
                crumbs_backfilled
            );
            self.dirty.insert(TableName::Crumbs);
            self.pending = 1;
        }

        info!("Rebuilt cache with {} rows", stats.total_rows());
        Ok(stats)
    }
}

async fn open_cache(path: &Path) -> Result<Database> {
    let db = Database::open(path).await?;
    db.init_schema().await?;
    Ok(db)
}

/// Remove the cache database and its WAL side files.
pub(crate) async fn remove_cache_files(path: &Path) -> Result<()> {
    let base = path.to_string_lossy().to_string();
    for candidate in [base.clone(), format!("{base}-wal"), format!("{base}-shm")] {
        match fs::remove_file(&candidate).await {
            Ok(()) => debug!("Removed {}", candidate),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Give every loaded crumb an entry for every loaded property. Returns the
/// number of crumbs that changed.
fn backfill_loaded(loaded: &mut BTreeMap<TableName, Vec<Entity>>) -> Result<usize> {
    let properties = loaded
        .get(&TableName::Properties)
        .map(|rows| {
            rows.iter()
                .cloned()
                .map(Entity::into_property)
                .collect::<Result<Vec<_>>>()
        })
        .transpose()?
        .unwrap_or_default();
    if properties.is_empty() {
        return Ok(0);
    }

    let mut changed = 0;
    if let Some(crumbs) = loaded.get_mut(&TableName::Crumbs) {
        for entity in crumbs.iter_mut() {
            if let Entity::Crumb(crumb) = entity {
                if crumb.ensure_properties(&properties) > 0 {
                    changed += 1;
                }
            }
        }
    }
    Ok(changed)
}
