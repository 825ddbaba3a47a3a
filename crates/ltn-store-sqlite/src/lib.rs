//! SQLite key-value medium for the project store.

use std::path::Path;

use anyhow::{Context, Result};
use ltn_project_store::{BackendError, KeyValueBackend};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};

const CREATE_KV_ENTRIES_SQL: &str = "
CREATE TABLE IF NOT EXISTS kv_entries (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);
";

/// One table of string pairs. Every operation is a single statement, so each
/// key is updated atomically and nothing spans keys.
#[derive(Debug)]
pub struct SqliteBackend {
    conn: Connection,
}

impl SqliteBackend {
    /// Open (creating if needed) a key-value database file.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened, pragmas cannot be
    /// applied or the table cannot be created.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Self::from_connection(conn)
    }

    /// # Errors
    /// Returns an error when the table cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory sqlite database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(CREATE_KV_ENTRIES_SQL).context("failed to create kv_entries table")?;
        Ok(Self { conn })
    }
}

fn backend_error(key: &str, err: &rusqlite::Error) -> BackendError {
    match err {
        rusqlite::Error::SqliteFailure(failure, _) if failure.code == ErrorCode::DiskFull => {
            BackendError::QuotaExceeded { key: key.to_string() }
        }
        other => BackendError::Io(format!("sqlite failure on {key}: {other}")),
    }
}

impl KeyValueBackend for SqliteBackend {
    fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        self.conn
            .query_row("SELECT value FROM kv_entries WHERE key = ?1", params![key], |row| row.get(0))
            .optional()
            .map_err(|err| backend_error(key, &err))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), BackendError> {
        self.conn
            .execute(
                "INSERT INTO kv_entries(key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
            .map_err(|err| backend_error(key, &err))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), BackendError> {
        self.conn
            .execute("DELETE FROM kv_entries WHERE key = ?1", params![key])
            .map_err(|err| backend_error(key, &err))?;
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, BackendError> {
        let mut stmt = self
            .conn
            .prepare("SELECT key FROM kv_entries ORDER BY key")
            .map_err(|err| backend_error("*", &err))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|err| backend_error("*", &err))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(|err| backend_error("*", &err))
    }

    fn is_empty(&self) -> Result<bool, BackendError> {
        let present: bool = self
            .conn
            .query_row("SELECT EXISTS(SELECT 1 FROM kv_entries)", [], |row| row.get(0))
            .map_err(|err| backend_error("*", &err))?;
        Ok(!present)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;
    use ltn_project_store::{AppFocus, Database};
    use serde_json::json;

    use super::*;

    #[test]
    fn sqlite_backend_round_trips_and_orders_keys() -> Result<()> {
        let backend = SqliteBackend::open_in_memory()?;
        assert!(backend.is_empty()?);

        backend.set("ltn/projects/b", "2")?;
        backend.set("ltn/projects/a", "1")?;
        backend.set("ltn/projects/a", "1b")?;
        backend.set("ltn_Legacy", "{}")?;

        assert_eq!(backend.get("ltn/projects/a")?.as_deref(), Some("1b"));
        assert_eq!(backend.get("missing")?, None);
        assert_eq!(backend.keys()?, vec!["ltn/projects/a", "ltn/projects/b", "ltn_Legacy"]);
        assert_eq!(backend.keys_with_prefix("ltn/projects/")?.len(), 2);

        backend.remove("ltn_Legacy")?;
        backend.remove("ltn_Legacy")?;
        assert!(!backend.is_empty()?);
        Ok(())
    }

    #[test]
    fn projects_persist_across_reopen() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("projects.sqlite3");

        let id = {
            let database = Database::new(SqliteBackend::open(&path)?);
            let storage = database.project_storage(AppFocus::Cnt)?;
            storage.create_empty_project("Leith Walk", Some("Edinburgh"))?
        };

        let database = Database::new(SqliteBackend::open(&path)?);
        assert!(!database.ensure_migrated()?.migration_performed());
        let storage = database.project_storage(AppFocus::Cnt)?;
        let document = storage.project(&id)?;
        assert_eq!(document.project_name, "Leith Walk");
        assert_eq!(document.study_area(), Some("Edinburgh"));
        Ok(())
    }

    #[test]
    fn legacy_rows_migrate_in_place() -> Result<()> {
        let backend = SqliteBackend::open_in_memory()?;
        backend.set(
            "ltn_cnt/LAD_Glasgow/MyPlan",
            &json!({ "type": "FeatureCollection", "features": [] }).to_string(),
        )?;

        let database = Database::new(backend);
        let report = database.ensure_migrated()?;
        assert_eq!(report.applied_versions, vec![1, 2]);
        assert_eq!(database.backend().get("ltn_cnt/LAD_Glasgow/MyPlan")?, None);
        assert_eq!(database.backend().get("ltn/_meta/schema-version")?.as_deref(), Some("2"));

        let storage = database.project_storage(AppFocus::Cnt)?;
        let projects = storage.projects()?;
        let Some(project) = projects.first() else {
            return Err(anyhow!("migrated project not found"));
        };
        assert_eq!(projects.len(), 1);
        assert_eq!(project.document.project_name, "MyPlan");
        assert_eq!(project.document.study_area(), Some("Glasgow"));
        Ok(())
    }
}
