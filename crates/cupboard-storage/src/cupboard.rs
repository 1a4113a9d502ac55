//! The attached cupboard: one session over a data directory.
//!
//! [`Cupboard::attach`] opens (or rebuilds) the cache, hands out [`Table`]
//! handles, and [`Cupboard::detach`] flushes everything still pending to
//! JSONL. Operations are serialized by a mutex around the sync manager, so
//! each one runs to completion before the next starts.

use chrono::Utc;
use cupboard_core::{CupboardConfig, Error, Result, Stash, TableName, Trail};
use serde_json::Value;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::sync::{FlushStats, RebuildReason, RebuildStats, SyncManager};
use crate::table::{get_existing, plan_trail_cascade, Plan, Table};

pub struct Cupboard {
    config: CupboardConfig,
    session: Mutex<SyncManager>,
    attach_rebuild: Option<RebuildStats>,
    detached: bool,
}

impl Cupboard {
    /// Attach to `config.data_dir`, rebuilding the cache from JSONL when it
    /// is missing or out of date.
    pub async fn attach(config: CupboardConfig) -> Result<Self> {
        let (manager, rebuilt) = SyncManager::attach(&config).await?;
        info!(
            "Attached cupboard at {} ({})",
            config.data_dir.display(),
            config.sync_strategy
        );

        Ok(Self {
            config,
            session: Mutex::new(manager),
            attach_rebuild: rebuilt,
            detached: false,
        })
    }

    pub fn config(&self) -> &CupboardConfig {
        &self.config
    }

    /// Statistics of the rebuild attach performed, if it had to.
    pub fn attach_rebuild(&self) -> Option<&RebuildStats> {
        self.attach_rebuild.as_ref()
    }

    pub(crate) async fn session(&self) -> MutexGuard<'_, SyncManager> {
        self.session.lock().await
    }

    /// Look a table up by name.
    pub fn get_table(&self, name: &str) -> Result<Table<'_>> {
        Ok(Table::new(self, TableName::parse(name)?))
    }

    pub fn table(&self, name: TableName) -> Table<'_> {
        Table::new(self, name)
    }

    /// Operations not yet mirrored to JSONL.
    pub async fn pending(&self) -> usize {
        self.session().await.pending()
    }

    /// Write pending mutations to JSONL now, whatever the strategy.
    pub async fn flush(&self) -> Result<FlushStats> {
        self.session().await.flush().await
    }

    /// Flush, then reload the cache from the JSONL files.
    pub async fn rebuild(&self) -> Result<RebuildStats> {
        let mut session = self.session().await;
        session.flush().await?;
        session.rebuild(RebuildReason::Requested).await
    }

    /// Close the session. JSONL reflects every committed mutation afterwards.
    pub async fn detach(mut self) -> Result<FlushStats> {
        let stats = self.session.get_mut().flush().await?;
        self.detached = true;
        info!("Detached cupboard at {}", self.config.data_dir.display());
        Ok(stats)
    }

    // ===== Trail lifecycle =====

    /// Complete an active trail. Its crumbs stay and lose their membership.
    pub async fn complete_trail(&self, id: &str) -> Result<Trail> {
        self.finish_trail(id, Trail::complete).await
    }

    /// Abandon an active trail, discarding the crumbs that belong to it.
    pub async fn abandon_trail(&self, id: &str) -> Result<Trail> {
        self.finish_trail(id, Trail::abandon).await
    }

    async fn finish_trail(&self, id: &str, finish: fn(&mut Trail) -> Result<()>) -> Result<Trail> {
        let mut session = self.session().await;
        let mut trail = get_existing(session.db(), TableName::Trails, id)
            .await?
            .into_trail()?;
        finish(&mut trail)?;

        let mut plan = Plan::default();
        plan.upsert(trail.clone());
        plan_trail_cascade(session.db(), &trail, &mut plan).await?;
        session.commit(plan.into_mutations()).await?;
        Ok(trail)
    }

    // ===== Stash operations =====

    pub async fn stash_value(&self, id: &str) -> Result<Value> {
        let session = self.session().await;
        let stash = get_existing(session.db(), TableName::Stashes, id)
            .await?
            .into_stash()?;
        Ok(stash.get_value().clone())
    }

    pub async fn stash_set_value(&self, id: &str, value: Value) -> Result<Stash> {
        self.update_stash(id, |stash| stash.set_value(value)).await
    }

    /// Returns the counter value after adding `delta`.
    pub async fn stash_increment(&self, id: &str, delta: i64) -> Result<i64> {
        let stash = self
            .update_stash(id, |stash| stash.increment(delta).map(|_| ()))
            .await?;
        stash
            .get_value()
            .get("value")
            .and_then(Value::as_i64)
            .ok_or_else(|| Error::Validation(format!("counter {} lost its value", stash.name)))
    }

    pub async fn stash_acquire(&self, id: &str, holder: &str) -> Result<Stash> {
        self.update_stash(id, |stash| stash.acquire(holder)).await
    }

    pub async fn stash_release(&self, id: &str, holder: &str) -> Result<Stash> {
        self.update_stash(id, |stash| stash.release(holder)).await
    }

    /// Get, mutate, set. Nothing is written when `op` fails, so the stored
    /// version only moves on success.
    async fn update_stash<F>(&self, id: &str, op: F) -> Result<Stash>
    where
        F: FnOnce(&mut Stash) -> Result<()>,
    {
        let mut session = self.session().await;
        let mut stash = get_existing(session.db(), TableName::Stashes, id)
            .await?
            .into_stash()?;
        op(&mut stash)?;
        stash.updated_at = Utc::now();
        debug!("Stash {} now at version {}", stash.name, stash.version);

        let mut plan = Plan::default();
        plan.upsert(stash.clone());
        session.commit(plan.into_mutations()).await?;
        Ok(stash)
    }
}

impl Drop for Cupboard {
    fn drop(&mut self) {
        if self.detached {
            return;
        }
        let pending = self.session.get_mut().pending();
        if pending > 0 {
            warn!(
                "Cupboard at {} dropped without detach; {} operations were not written to JSONL and will be discarded on the next attach",
                self.config.data_dir.display(),
                pending
            );
        }
    }
}
