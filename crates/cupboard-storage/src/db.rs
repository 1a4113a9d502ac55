//! Cache layer for the cupboard using Turso.
//!
//! The cache is a relational mirror of the JSONL tables used for filtering
//! and lookups. It can be deleted at any time and rebuilt from JSONL.
//!
//! Architecture:
//!   - Database file: {data_dir}/cupboard.db
//!   - WAL mode: Write-Ahead Logging for concurrent reads during writes
//!   - Schema: one table per entity kind plus sync_state
//!   - Writes: every logical operation is a list of [`Mutation`]s applied in
//!     a single transaction

use chrono::{DateTime, Utc};
use cupboard_core::{
    format_timestamp, parse_timestamp, Category, Condition, Crumb, Entity, Error, Link, Metadata,
    Property, Result, Stash, TableName, Trail,
};
use std::collections::BTreeSet;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, warn};
use turso::{params, Builder, Connection};

use crate::jsonl::FileSignature;

/// Database connection wrapper for Turso
pub struct Database {
    conn: Connection,
}

/// One row-level change. A logical operation is a list of these.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Insert or replace the row with the entity's id.
    Upsert(Entity),
    /// Remove one row, if present.
    Delete { table: TableName, id: String },
    /// Remove every row of a table.
    Clear(TableName),
}

impl Mutation {
    pub fn delete(table: TableName, id: impl Into<String>) -> Self {
        Mutation::Delete {
            table,
            id: id.into(),
        }
    }

    pub fn table(&self) -> TableName {
        match self {
            Mutation::Upsert(entity) => entity.table(),
            Mutation::Delete { table, .. } | Mutation::Clear(table) => *table,
        }
    }
}

pub(crate) fn db_err(e: turso::Error) -> Error {
    Error::Database(e.to_string())
}

/// Column list per table, in the order the row parsers expect.
fn columns(table: TableName) -> &'static str {
    match table {
        TableName::Crumbs => "id, name, state, created_at, updated_at, properties",
        TableName::Trails => "id, state, created_at, completed_at",
        TableName::Links => "id, link_type, from_id, to_id, created_at",
        TableName::Properties => "id, name, value_type, description, created_at",
        TableName::Categories => "id, property_id, name, ordinal, created_at",
        TableName::Stashes => "id, name, stash_type, value, version, created_at, updated_at",
        TableName::Metadata => "id, crumb_id, table_name, content, created_at",
    }
}

fn order_by(table: TableName) -> &'static str {
    match table {
        TableName::Categories => "ordinal ASC, name ASC, id ASC",
        _ => "id ASC",
    }
}

impl Database {
    /// Open creates a new database connection at the specified path using Turso.
    ///
    /// The database is opened in embedded mode with WAL. If the file doesn't
    /// exist it is created empty; call [`Database::init_schema`] next.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        // Ensure parent directory exists
        if let Some(parent) = path.as_ref().parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let db = Builder::new_local(&path_str).build().await.map_err(db_err)?;
        let conn = db.connect().map_err(db_err)?;

        // Use query() for PRAGMA statements as they may return results
        let _ = conn
            .query("PRAGMA journal_mode=WAL", params![])
            .await
            .map_err(db_err)?;
        let _ = conn
            .query("PRAGMA busy_timeout=5000", params![])
            .await
            .map_err(db_err)?;

        Ok(Database { conn })
    }

    /// InitSchema creates the cache tables and indexes if they don't exist.
    /// Idempotent.
    pub async fn init_schema(&self) -> Result<()> {
        let statements = vec![
            r#"CREATE TABLE IF NOT EXISTS crumbs (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                state TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                properties TEXT NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS trails (
                id TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                created_at TEXT NOT NULL,
                completed_at TEXT
            )"#,
            r#"CREATE TABLE IF NOT EXISTS links (
                id TEXT PRIMARY KEY,
                link_type TEXT NOT NULL,
                from_id TEXT NOT NULL,
                to_id TEXT NOT NULL,
                created_at TEXT NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS properties (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                value_type TEXT NOT NULL,
                description TEXT NOT NULL,
                created_at TEXT NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS categories (
                id TEXT PRIMARY KEY,
                property_id TEXT NOT NULL,
                name TEXT NOT NULL,
                ordinal INTEGER NOT NULL,
                created_at TEXT NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS stashes (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                stash_type TEXT NOT NULL,
                value TEXT NOT NULL,
                version INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS metadata (
                id TEXT PRIMARY KEY,
                crumb_id TEXT NOT NULL,
                table_name TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL
            )"#,
            // Signature of each JSONL file as of the last rewrite or rebuild
            r#"CREATE TABLE IF NOT EXISTS sync_state (
                table_name TEXT PRIMARY KEY,
                file_len INTEGER NOT NULL,
                file_modified TEXT NOT NULL
            )"#,
            "CREATE INDEX IF NOT EXISTS idx_crumbs_state ON crumbs(state)",
            "CREATE INDEX IF NOT EXISTS idx_trails_state ON trails(state)",
            "CREATE INDEX IF NOT EXISTS idx_links_from ON links(from_id)",
            "CREATE INDEX IF NOT EXISTS idx_links_to ON links(to_id)",
            "CREATE INDEX IF NOT EXISTS idx_links_type ON links(link_type)",
            "CREATE INDEX IF NOT EXISTS idx_properties_name ON properties(name)",
            "CREATE INDEX IF NOT EXISTS idx_categories_property ON categories(property_id)",
            "CREATE INDEX IF NOT EXISTS idx_metadata_crumb ON metadata(crumb_id)",
        ];

        for stmt in statements {
            self.conn.execute(stmt, params![]).await.map_err(db_err)?;
        }

        Ok(())
    }

    /// Fetch one row by id.
    pub async fn get(&self, table: TableName, id: &str) -> Result<Option<Entity>> {
        let query = format!("SELECT {} FROM {} WHERE id = ?", columns(table), table);

        let mut rows = self.conn.query(&query, params![id]).await.map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(parse_row(table, &row)?)),
            None => Ok(None),
        }
    }

    /// Fetch rows matching every condition (AND), each condition matching
    /// any of its values (IN). No conditions returns the whole table.
    pub async fn fetch(&self, table: TableName, conditions: &[Condition]) -> Result<Vec<Entity>> {
        let mut clauses = Vec::new();
        let mut params_vec: Vec<turso::Value> = Vec::new();

        for condition in conditions {
            if condition.values.is_empty() {
                // IN () matches nothing
                return Ok(Vec::new());
            }
            let placeholders: Vec<&str> = condition.values.iter().map(|_| "?").collect();
            clauses.push(format!("{} IN ({})", condition.column, placeholders.join(",")));
            for value in &condition.values {
                params_vec.push(value.clone().into());
            }
        }

        let mut query = format!("SELECT {} FROM {}", columns(table), table);
        if !clauses.is_empty() {
            query.push_str(" WHERE ");
            query.push_str(&clauses.join(" AND "));
        }
        query.push_str(" ORDER BY ");
        query.push_str(order_by(table));

        let mut rows = self.conn.query(&query, params_vec).await.map_err(db_err)?;
        let mut entities = Vec::new();

        while let Some(row) = rows.next().await.map_err(db_err)? {
            entities.push(parse_row(table, &row)?);
        }

        Ok(entities)
    }

    /// Every row of a table in canonical order.
    pub async fn fetch_all(&self, table: TableName) -> Result<Vec<Entity>> {
        self.fetch(table, &[]).await
    }

    pub async fn exists(&self, table: TableName, id: &str) -> Result<bool> {
        Ok(self.get(table, id).await?.is_some())
    }

    /// Count returns the number of rows in a table.
    pub async fn count(&self, table: TableName) -> Result<i64> {
        let query = format!("SELECT COUNT(*) FROM {}", table);
        let mut rows = self.conn.query(&query, params![]).await.map_err(db_err)?;

        if let Some(row) = rows.next().await.map_err(db_err)? {
            row.get(0).map_err(db_err)
        } else {
            Ok(0)
        }
    }

    /// Apply a list of mutations atomically.
    ///
    /// Statements are built before the transaction opens, so the only
    /// failures inside it are engine failures; those roll everything back.
    ///
    /// Every touched table is marked unflushed in the same transaction. Only
    /// a successful rewrite of its file records a real signature again, so a
    /// cache that got ahead of JSONL is always seen as stale.
    pub async fn apply(&mut self, mutations: &[Mutation]) -> Result<()> {
        if mutations.is_empty() {
            return Ok(());
        }

        let mut statements = mutations
            .iter()
            .map(statement)
            .collect::<Result<Vec<_>>>()?;
        let touched: BTreeSet<TableName> = mutations.iter().map(Mutation::table).collect();
        let unflushed = FileSignature::unflushed();
        for table in touched {
            statements.push(signature_statement(table, &unflushed));
        }

        let tx = self.conn.transaction().await.map_err(db_err)?;
        let mut failure = None;

        for (sql, params_vec) in statements {
            if let Err(e) = tx.execute(&sql, params_vec).await {
                failure = Some(db_err(e));
                break;
            }
        }

        match failure {
            None => {
                tx.commit().await.map_err(db_err)?;
                debug!("Applied {} mutations", mutations.len());
                Ok(())
            }
            Some(err) => {
                if let Err(e) = tx.rollback().await {
                    warn!("Rollback after failed apply also failed: {}", e);
                }
                Err(err)
            }
        }
    }

    /// Signature of a table's JSONL file as last recorded.
    pub async fn signature(&self, table: TableName) -> Result<Option<FileSignature>> {
        let mut rows = self
            .conn
            .query(
                "SELECT file_len, file_modified FROM sync_state WHERE table_name = ?",
                params![table.as_str()],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => {
                let len: i64 = row.get(0).map_err(db_err)?;
                Ok(Some(FileSignature {
                    len: len as u64,
                    modified: row.get(1).map_err(db_err)?,
                }))
            }
            None => Ok(None),
        }
    }

    /// Record (or, with `None`, forget) a table file's signature.
    pub async fn record_signature(
        &self,
        table: TableName,
        signature: Option<&FileSignature>,
    ) -> Result<()> {
        match signature {
            Some(sig) => {
                let (sql, params_vec) = signature_statement(table, sig);
                self.conn.execute(&sql, params_vec).await.map_err(db_err)?;
            }
            None => {
                self.conn
                    .execute(
                        "DELETE FROM sync_state WHERE table_name = ?",
                        params![table.as_str()],
                    )
                    .await
                    .map_err(db_err)?;
            }
        }
        Ok(())
    }
}

fn signature_statement(table: TableName, sig: &FileSignature) -> (String, Vec<turso::Value>) {
    let sql = r#"
        INSERT INTO sync_state (table_name, file_len, file_modified)
        VALUES (?, ?, ?)
        ON CONFLICT(table_name) DO UPDATE SET
            file_len = excluded.file_len,
            file_modified = excluded.file_modified
    "#;
    (
        sql.to_string(),
        vec![
            table.as_str().to_string().into(),
            (sig.len as i64).into(),
            sig.modified.clone().into(),
        ],
    )
}

/// SQL and parameters for one mutation.
fn statement(mutation: &Mutation) -> Result<(String, Vec<turso::Value>)> {
    match mutation {
        Mutation::Upsert(entity) => upsert_statement(entity),
        Mutation::Delete { table, id } => Ok((
            format!("DELETE FROM {} WHERE id = ?", table),
            vec![id.clone().into()],
        )),
        Mutation::Clear(table) => Ok((format!("DELETE FROM {}", table), Vec::new())),
    }
}

fn ts(value: &DateTime<Utc>) -> turso::Value {
    format_timestamp(value).into()
}

fn opt_ts(value: &Option<DateTime<Utc>>) -> turso::Value {
    match value {
        Some(v) => ts(v),
        None => turso::Value::Null,
    }
}

fn upsert_statement(entity: &Entity) -> Result<(String, Vec<turso::Value>)> {
    let table = entity.table();
    let params_vec: Vec<turso::Value> = match entity {
        Entity::Crumb(c) => vec![
            c.id.clone().into(),
            c.name.clone().into(),
            c.state.as_str().to_string().into(),
            ts(&c.created_at),
            ts(&c.updated_at),
            serde_json::to_string(&c.properties)?.into(),
        ],
        Entity::Trail(t) => vec![
            t.id.clone().into(),
            t.state.as_str().to_string().into(),
            ts(&t.created_at),
            opt_ts(&t.completed_at),
        ],
        Entity::Link(l) => vec![
            l.id.clone().into(),
            l.link_type.as_str().to_string().into(),
            l.from_id.clone().into(),
            l.to_id.clone().into(),
            ts(&l.created_at),
        ],
        Entity::Property(p) => vec![
            p.id.clone().into(),
            p.name.clone().into(),
            p.value_type.as_str().to_string().into(),
            p.description.clone().into(),
            ts(&p.created_at),
        ],
        Entity::Category(c) => vec![
            c.id.clone().into(),
            c.property_id.clone().into(),
            c.name.clone().into(),
            c.ordinal.into(),
            ts(&c.created_at),
        ],
        Entity::Stash(s) => vec![
            s.id.clone().into(),
            s.name.clone().into(),
            s.stash_type.as_str().to_string().into(),
            serde_json::to_string(&s.value)?.into(),
            s.version.into(),
            ts(&s.created_at),
            ts(&s.updated_at),
        ],
        Entity::Metadata(m) => vec![
            m.id.clone().into(),
            m.crumb_id.clone().into(),
            m.table_name.as_str().to_string().into(),
            m.content.clone().into(),
            ts(&m.created_at),
        ],
    };

    let cols = columns(table);
    let placeholders: Vec<&str> = params_vec.iter().map(|_| "?").collect();
    let updates: Vec<String> = cols
        .split(", ")
        .filter(|c| *c != "id")
        .map(|c| format!("{c} = excluded.{c}"))
        .collect();

    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT(id) DO UPDATE SET {}",
        table,
        cols,
        placeholders.join(", "),
        updates.join(", ")
    );
    Ok((sql, params_vec))
}

// ===== Row parsing =====

fn text(row: &turso::Row, idx: usize) -> Result<String> {
    row.get(idx).map_err(db_err)
}

fn timestamp(row: &turso::Row, idx: usize) -> Result<DateTime<Utc>> {
    let raw = text(row, idx)?;
    parse_timestamp(&raw).map_err(|e| Error::Database(format!("column {idx}: {e}")))
}

fn opt_timestamp(row: &turso::Row, idx: usize) -> Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx).map_err(db_err)?;
    raw.map(|s| parse_timestamp(&s).map_err(|e| Error::Database(format!("column {idx}: {e}"))))
        .transpose()
}

fn parsed<T: FromStr<Err = Error>>(row: &turso::Row, idx: usize) -> Result<T> {
    text(row, idx)?
        .parse()
        .map_err(|e: Error| Error::Database(format!("column {idx}: {e}")))
}

fn json_column<T: serde::de::DeserializeOwned>(row: &turso::Row, idx: usize) -> Result<T> {
    let raw = text(row, idx)?;
    serde_json::from_str(&raw).map_err(|e| Error::Database(format!("column {idx}: {e}")))
}

/// Helper function to parse a row of `table` from query results
fn parse_row(table: TableName, row: &turso::Row) -> Result<Entity> {
    let entity = match table {
        TableName::Crumbs => Entity::Crumb(Crumb {
            id: text(row, 0)?,
            name: text(row, 1)?,
            state: parsed(row, 2)?,
            created_at: timestamp(row, 3)?,
            updated_at: timestamp(row, 4)?,
            properties: json_column(row, 5)?,
        }),
        TableName::Trails => Entity::Trail(Trail {
            id: text(row, 0)?,
            state: parsed(row, 1)?,
            created_at: timestamp(row, 2)?,
            completed_at: opt_timestamp(row, 3)?,
        }),
        TableName::Links => Entity::Link(Link {
            id: text(row, 0)?,
            link_type: parsed(row, 1)?,
            from_id: text(row, 2)?,
            to_id: text(row, 3)?,
            created_at: timestamp(row, 4)?,
        }),
        TableName::Properties => Entity::Property(Property {
            id: text(row, 0)?,
            name: text(row, 1)?,
            value_type: parsed(row, 2)?,
            description: text(row, 3)?,
            created_at: timestamp(row, 4)?,
        }),
        TableName::Categories => Entity::Category(Category {
            id: text(row, 0)?,
            property_id: text(row, 1)?,
            name: text(row, 2)?,
            ordinal: row.get(3).map_err(db_err)?,
            created_at: timestamp(row, 4)?,
        }),
        TableName::Stashes => Entity::Stash(Stash {
            id: text(row, 0)?,
            name: text(row, 1)?,
            stash_type: parsed(row, 2)?,
            value: json_column(row, 3)?,
            version: row.get(4).map_err(db_err)?,
            created_at: timestamp(row, 5)?,
            updated_at: timestamp(row, 6)?,
        }),
        TableName::Metadata => Entity::Metadata(Metadata {
            id: text(row, 0)?,
            crumb_id: text(row, 1)?,
            table_name: parsed(row, 2)?,
            content: text(row, 3)?,
            created_at: timestamp(row, 4)?,
        }),
    };
    Ok(entity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cupboard_core::{CrumbState, LinkType};
    use serde_json::json;
    use tempfile::TempDir;

    async fn open_test_db() -> (TempDir, Database) {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::open(temp_dir.path().join("test.db")).await.unwrap();
        db.init_schema().await.unwrap();
        (temp_dir, db)
    }

    fn crumb(id: &str, state: CrumbState) -> Crumb {
        Crumb {
            id: id.to_string(),
            name: format!("crumb {id}"),
            state,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            properties: [("p1".to_string(), json!(3))].into_iter().collect(),
        }
    }

    #[tokio::test]
    async fn test_database_open_and_init() {
        let (_temp, db) = open_test_db().await;
        db.init_schema().await.unwrap();

        for table in TableName::ALL {
            assert_eq!(db.count(*table).await.unwrap(), 0, "{table}");
        }
    }

    #[tokio::test]
    async fn test_upsert_get_delete() {
        let (_temp, mut db) = open_test_db().await;

        let original = crumb("c1", CrumbState::Draft);
        db.apply(&[Mutation::Upsert(original.clone().into())]).await.unwrap();
        let fetched = db.get(TableName::Crumbs, "c1").await.unwrap().unwrap();
        assert_eq!(fetched, Entity::Crumb(original.clone()));

        let mut updated = original;
        updated.state = CrumbState::Taken;
        db.apply(&[Mutation::Upsert(updated.clone().into())]).await.unwrap();
        assert_eq!(db.count(TableName::Crumbs).await.unwrap(), 1);
        let fetched = db.get(TableName::Crumbs, "c1").await.unwrap().unwrap();
        assert_eq!(fetched.into_crumb().unwrap().state, CrumbState::Taken);

        db.apply(&[Mutation::delete(TableName::Crumbs, "c1")]).await.unwrap();
        assert!(db.get(TableName::Crumbs, "c1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fetch_conditions() {
        let (_temp, mut db) = open_test_db().await;

        db.apply(&[
            Mutation::Upsert(crumb("c1", CrumbState::Draft).into()),
            Mutation::Upsert(crumb("c2", CrumbState::Ready).into()),
            Mutation::Upsert(crumb("c3", CrumbState::Pebble).into()),
        ])
        .await
        .unwrap();

        let all = db.fetch_all(TableName::Crumbs).await.unwrap();
        let ids: Vec<&str> = all.iter().map(|e| e.id()).collect();
        assert_eq!(ids, vec!["c1", "c2", "c3"]);

        let open = db
            .fetch(
                TableName::Crumbs,
                &[Condition {
                    column: "state",
                    values: vec!["draft".to_string(), "ready".to_string()],
                }],
            )
            .await
            .unwrap();
        assert_eq!(open.len(), 2);

        let none = db
            .fetch(
                TableName::Crumbs,
                &[Condition {
                    column: "state",
                    values: vec!["dust".to_string()],
                }],
            )
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_categories_order_by_ordinal_then_name() {
        let (_temp, mut db) = open_test_db().await;
        let category = |id: &str, name: &str, ordinal: i64| Category {
            id: id.to_string(),
            property_id: "p".to_string(),
            name: name.to_string(),
            ordinal,
            created_at: Utc::now(),
        };

        db.apply(&[
            Mutation::Upsert(category("a", "high", 2).into()),
            Mutation::Upsert(category("b", "medium", 1).into()),
            Mutation::Upsert(category("c", "low", 1).into()),
        ])
        .await
        .unwrap();

        let names: Vec<String> = db
            .fetch_all(TableName::Categories)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.into_category().unwrap().name)
            .collect();
        assert_eq!(names, vec!["low", "medium", "high"]);
    }

    #[tokio::test]
    async fn test_nullable_and_json_columns() {
        let (_temp, mut db) = open_test_db().await;

        let trail = Trail {
            id: "t1".to_string(),
            created_at: Utc::now(),
            ..Default::default()
        };
        let mut lock = Stash::new("l", cupboard_core::StashType::Lock);
        lock.id = "s1".to_string();
        lock.acquire("w1").unwrap();
        let link = Link {
            id: "l1".to_string(),
            ..Link::new(LinkType::BelongsTo, "c1", "t1")
        };

        db.apply(&[
            Mutation::Upsert(trail.clone().into()),
            Mutation::Upsert(lock.clone().into()),
            Mutation::Upsert(link.clone().into()),
        ])
        .await
        .unwrap();

        assert_eq!(db.get(TableName::Trails, "t1").await.unwrap(), Some(trail.into()));
        assert_eq!(db.get(TableName::Stashes, "s1").await.unwrap(), Some(lock.into()));
        assert_eq!(db.get(TableName::Links, "l1").await.unwrap(), Some(link.into()));
    }

    #[tokio::test]
    async fn test_clear_and_signature() {
        let (_temp, mut db) = open_test_db().await;
        db.apply(&[Mutation::Upsert(crumb("c1", CrumbState::Draft).into())])
            .await
            .unwrap();
        db.apply(&[Mutation::Clear(TableName::Crumbs)]).await.unwrap();
        assert_eq!(db.count(TableName::Crumbs).await.unwrap(), 0);

        // Writes leave the touched table marked unflushed, others alone
        let marker = db.signature(TableName::Crumbs).await.unwrap().unwrap();
        assert!(marker.is_unflushed());
        assert!(db.signature(TableName::Trails).await.unwrap().is_none());

        let sig = FileSignature {
            len: 42,
            modified: format_timestamp(&Utc::now()),
        };
        db.record_signature(TableName::Crumbs, Some(&sig)).await.unwrap();
        assert_eq!(db.signature(TableName::Crumbs).await.unwrap(), Some(sig));
        db.record_signature(TableName::Crumbs, None).await.unwrap();
        assert!(db.signature(TableName::Crumbs).await.unwrap().is_none());
    }
}
