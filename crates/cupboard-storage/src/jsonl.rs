//! JSONL table files: one file per table, one JSON record per line.
//!
//! These files are the durable source of truth. A rewrite replaces the
//! whole file through a temporary sibling and a rename, so readers never see
//! a half-written table.

use chrono::{DateTime, Utc};
use cupboard_core::{format_timestamp, Entity, Error, Result, TableName};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Size and modification time of a table file, recorded in the cache after
/// every rewrite or rebuild so that out-of-band edits can be detected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSignature {
    pub len: u64,
    pub modified: String,
}

impl FileSignature {
    /// Recorded for a table whose cache rows have not reached the file yet.
    /// Never equal to the signature of a file on disk, nor to a missing file.
    pub fn unflushed() -> Self {
        Self {
            len: 0,
            modified: String::new(),
        }
    }

    pub fn is_unflushed(&self) -> bool {
        self.modified.is_empty()
    }
}

/// Path of a table's JSONL file inside `data_dir`.
pub fn table_path(data_dir: &Path, table: TableName) -> PathBuf {
    data_dir.join(table.filename())
}

/// Read every record of a table file.
///
/// A missing file is an empty table. Blank lines are skipped. Any line that
/// does not parse aborts the read with [`Error::Corrupt`] naming the line.
pub async fn read_table_file(path: &Path, table: TableName) -> Result<Vec<Entity>> {
    debug!("Reading table file: {}", path.display());

    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("Table file does not exist, treating {} as empty", table);
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };

    let mut entities = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let entity = Entity::from_line(table, line).map_err(|source| Error::Corrupt {
            path: path.to_path_buf(),
            line: idx + 1,
            source,
        })?;
        if entity.id().is_empty() {
            return Err(Error::Validation(format!(
                "{}:{}: record has no id",
                path.display(),
                idx + 1
            )));
        }
        entities.push(entity);
    }

    debug!("Read {} records from {}", entities.len(), path.display());
    Ok(entities)
}

/// Replace a table file with `entities`, one line each, in the given order.
///
/// Returns the signature of the file as written.
pub async fn write_table_file(path: &Path, entities: &[Entity]) -> Result<FileSignature> {
    let mut data = String::new();
    for entity in entities {
        data.push_str(&entity.to_line()?);
        data.push('\n');
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    // Write to temp file, then rename
    let tmp_path = path.with_extension("jsonl.tmp");
    debug!("Writing {} records to {}", entities.len(), tmp_path.display());
    let mut file = fs::File::create(&tmp_path).await?;
    file.write_all(data.as_bytes()).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&tmp_path, path).await?;

    file_signature(path)
        .await?
        .ok_or_else(|| Error::Database(format!("{} vanished after rewrite", path.display())))
}

/// Current signature of a table file, or `None` if it does not exist.
pub async fn file_signature(path: &Path) -> Result<Option<FileSignature>> {
    let meta = match fs::metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let modified: DateTime<Utc> = meta.modified()?.into();
    Ok(Some(FileSignature {
        len: meta.len(),
        modified: format_timestamp(&modified),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cupboard_core::{Crumb, CrumbState, Link, LinkType};
    use tempfile::TempDir;

    fn crumb(id: &str, name: &str) -> Entity {
        let mut crumb = Crumb::new(name);
        crumb.id = id.to_string();
        crumb.state = CrumbState::Ready;
        crumb.created_at = Utc::now();
        crumb.updated_at = crumb.created_at;
        Entity::Crumb(crumb)
    }

    #[tokio::test]
    async fn test_write_and_read_table_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = table_path(temp_dir.path(), TableName::Crumbs);

        let rows = vec![crumb("a", "first"), crumb("b", "second")];
        let sig = write_table_file(&path, &rows).await.unwrap();
        assert!(sig.len > 0);
        assert!(!path.with_extension("jsonl.tmp").exists());

        let read = read_table_file(&path, TableName::Crumbs).await.unwrap();
        assert_eq!(read, rows);

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.lines().next().unwrap().contains("\"state\":\"ready\""));
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let path = table_path(temp_dir.path(), TableName::Links);

        let read = read_table_file(&path, TableName::Links).await.unwrap();
        assert!(read.is_empty());
        assert!(file_signature(&path).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_line_names_line_number() {
        let temp_dir = TempDir::new().unwrap();
        let path = table_path(temp_dir.path(), TableName::Links);

        let mut link = Link::new(LinkType::ChildOf, "c1", "c2");
        link.id = "l1".to_string();
        let good = Entity::Link(link).to_line().unwrap();
        std::fs::write(&path, format!("{good}\n\n{{\"id\": \"l2\", \"link_type\": 7}}\n")).unwrap();

        let err = read_table_file(&path, TableName::Links).await.unwrap_err();
        assert!(err.is_storage());
        match err {
            Error::Corrupt { line, .. } => assert_eq!(line, 3),
            other => panic!("expected corrupt error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_record_without_id_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = table_path(temp_dir.path(), TableName::Crumbs);
        std::fs::write(&path, "{\"name\":\"anonymous\"}\n").unwrap();

        let err = read_table_file(&path, TableName::Crumbs).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
