//! SQLite model store
//!
//! Wraps a single rusqlite connection behind a mutex. Every operation runs
//! on tokio's blocking pool; saving a collection replaces it inside one
//! transaction.

use super::schema::{
    SCHEMA_CREATE_ENTITIES, SCHEMA_CREATE_INDEXES, SCHEMA_CREATE_METADATA, STORE_SCHEMA_VERSION,
};
use super::{ModelStore, SourceLocation, StoreError};
use crate::entity::{Entity, EntityKind, StoredProcedure, Table, View};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Result as SqliteResult};
use schemaprysm_config::SchemaPrysmConfig;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Model store backed by a SQLite database
pub struct SqliteModelStore {
    conn: Arc<Mutex<Connection>>,
    /// Database path (`None` for in-memory)
    path: Option<PathBuf>,
}

impl SqliteModelStore {
    /// Open a database, creating it and its schema if needed
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        Self::configure_connection(&conn)?;
        Self::initialize(&conn)?;
        info!(path = %path.display(), "opened model store");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    /// Open the database configured for a workspace
    pub fn from_config(
        config: &SchemaPrysmConfig,
        workspace_root: &Path,
    ) -> Result<Self, StoreError> {
        Self::open(&config.database_path(workspace_root))
    }

    /// Create an in-memory database (for testing)
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::configure_connection(&conn)?;
        Self::initialize(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    /// Database path, if file-backed
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn configure_connection(conn: &Connection) -> SqliteResult<()> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;
        conn.pragma_update(None, "cache_size", -16000)?; // 16MB cache
        Ok(())
    }

    /// Create the schema on a fresh database, or verify its version
    fn initialize(conn: &Connection) -> Result<(), StoreError> {
        conn.execute(SCHEMA_CREATE_METADATA, [])?;

        let version: Option<String> = conn
            .query_row(
                "SELECT value FROM store_metadata WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()?;

        match version {
            Some(v) if v == STORE_SCHEMA_VERSION => {}
            Some(found) => {
                return Err(StoreError::SchemaVersionMismatch {
                    expected: STORE_SCHEMA_VERSION.to_string(),
                    found,
                });
            }
            None => {
                conn.execute(SCHEMA_CREATE_ENTITIES, [])?;
                conn.execute_batch(SCHEMA_CREATE_INDEXES)?;
                conn.execute(
                    "INSERT OR REPLACE INTO store_metadata (key, value) VALUES ('schema_version', ?1)",
                    params![STORE_SCHEMA_VERSION],
                )?;
            }
        }
        Ok(())
    }

    /// Run a closure against the connection on the blocking pool
    async fn with_conn<R, F>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Connection) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }

    // =========================================================================
    // Collection Operations
    // =========================================================================

    async fn load<T: Entity>(&self, source: &SourceLocation) -> Result<Vec<T>, StoreError> {
        let source = source.clone();
        let started = Instant::now();
        let items = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT body_json FROM entities WHERE source = ?1 AND kind = ?2 ORDER BY position",
                )?;
                let bodies = stmt
                    .query_map(params![source.as_str(), T::KIND.as_str()], |row| {
                        row.get::<_, String>(0)
                    })?
                    .collect::<SqliteResult<Vec<String>>>()?;

                bodies
                    .iter()
                    .map(|body| serde_json::from_str::<T>(body).map_err(StoreError::from))
                    .collect::<Result<Vec<T>, StoreError>>()
            })
            .await?;

        debug!(
            kind = %T::KIND,
            count = items.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "loaded collection from SQLite"
        );
        Ok(items)
    }

    async fn save<T: Entity>(
        &self,
        source: &SourceLocation,
        items: &[T],
    ) -> Result<(), StoreError> {
        // Encode up front so a bad entity never reaches the transaction
        let rows = items
            .iter()
            .map(|item| -> Result<(String, String), StoreError> {
                Ok((item.qualified_name(), serde_json::to_string(item)?))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let source = source.clone();
        let kind = T::KIND;
        let count = rows.len();

        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "DELETE FROM entities WHERE source = ?1 AND kind = ?2",
                params![source.as_str(), kind.as_str()],
            )?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO entities (source, kind, position, name, body_json) VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                for (position, (name, body)) in rows.iter().enumerate() {
                    stmt.execute(params![
                        source.as_str(),
                        kind.as_str(),
                        position as i64,
                        name,
                        body
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await?;

        debug!(kind = %kind, count, "saved collection to SQLite");
        Ok(())
    }

    /// Number of stored entities of a kind for `source`
    pub async fn count(
        &self,
        source: &SourceLocation,
        kind: EntityKind,
    ) -> Result<usize, StoreError> {
        let source = source.clone();
        self.with_conn(move |conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM entities WHERE source = ?1 AND kind = ?2",
                params![source.as_str(), kind.as_str()],
                |row| row.get(0),
            )?;
            Ok(n as usize)
        })
        .await
    }

    /// Distinct source locations with stored data
    pub async fn sources(&self) -> Result<Vec<SourceLocation>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT DISTINCT source FROM entities ORDER BY source")?;
            let sources = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .map(|r| r.map(SourceLocation::from))
                .collect::<SqliteResult<Vec<_>>>()?;
            Ok(sources)
        })
        .await
    }
}

#[async_trait]
impl ModelStore for SqliteModelStore {
    async fn load_tables(&self, source: &SourceLocation) -> Result<Vec<Table>, StoreError> {
        self.load(source).await
    }

    async fn load_views(&self, source: &SourceLocation) -> Result<Vec<View>, StoreError> {
        self.load(source).await
    }

    async fn load_procedures(
        &self,
        source: &SourceLocation,
    ) -> Result<Vec<StoredProcedure>, StoreError> {
        self.load(source).await
    }

    async fn save_tables(
        &self,
        source: &SourceLocation,
        tables: &[Table],
    ) -> Result<(), StoreError> {
        self.save(source, tables).await
    }

    async fn save_views(&self, source: &SourceLocation, views: &[View]) -> Result<(), StoreError> {
        self.save(source, views).await
    }

    async fn save_procedures(
        &self,
        source: &SourceLocation,
        procedures: &[StoredProcedure],
    ) -> Result<(), StoreError> {
        self.save(source, procedures).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Column;

    #[tokio::test]
    async fn test_in_memory_roundtrip_keeps_order() {
        let store = SqliteModelStore::in_memory().unwrap();
        let source = SourceLocation::new("warehouse/main");
        let tables = vec![
            Table::new("dbo", "zeta"),
            Table::new("dbo", "alpha").with_column(Column::new("id", "bigint")),
        ];
        store.save_tables(&source, &tables).await.unwrap();

        let loaded = store.load_tables(&source).await.unwrap();
        let names: Vec<String> = loaded.iter().map(|t| t.qualified_name()).collect();
        assert_eq!(names, vec!["dbo.zeta", "dbo.alpha"]);
        assert_eq!(loaded[1].columns[0].data_type, "bigint");
        assert_eq!(store.count(&source, EntityKind::Table).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_save_replaces_collection() {
        let store = SqliteModelStore::in_memory().unwrap();
        let source = SourceLocation::new("s");
        store
            .save_views(&source, &[View::new("a", "v1"), View::new("a", "v2")])
            .await
            .unwrap();
        store.save_views(&source, &[View::new("a", "v3")]).await.unwrap();

        let loaded = store.load_views(&source).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "v3");
    }

    #[tokio::test]
    async fn test_reopen_from_config() {
        let workspace = tempfile::tempdir().unwrap();
        let config = SchemaPrysmConfig::default();
        let source = SourceLocation::new("s");
        {
            let store = SqliteModelStore::from_config(&config, workspace.path()).unwrap();
            store.save_tables(&source, &[Table::new("dbo", "t")]).await.unwrap();
        }

        let store = SqliteModelStore::from_config(&config, workspace.path()).unwrap();
        assert_eq!(store.path(), Some(config.database_path(workspace.path()).as_path()));
        assert_eq!(store.load_tables(&source).await.unwrap().len(), 1);
    }

    #[test]
    fn test_schema_version_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models.db");
        drop(SqliteModelStore::open(&path).unwrap());
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute(
                "UPDATE store_metadata SET value = '99' WHERE key = 'schema_version'",
                [],
            )
            .unwrap();
        }

        match SqliteModelStore::open(&path) {
            Err(StoreError::SchemaVersionMismatch { expected, found }) => {
                assert_eq!(expected, STORE_SCHEMA_VERSION);
                assert_eq!(found, "99");
            }
            other => panic!("expected version mismatch, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn test_kinds_are_separate() {
        let store = SqliteModelStore::in_memory().unwrap();
        let source = SourceLocation::new("s");
        store
            .save_procedures(&source, &[StoredProcedure::new("dbo", "sp_a")])
            .await
            .unwrap();

        assert!(store.load_tables(&source).await.unwrap().is_empty());
        assert_eq!(store.load_procedures(&source).await.unwrap().len(), 1);
        assert_eq!(store.sources().await.unwrap(), vec![source]);
    }
}
