//! Database layer with connection pooling
//!
//! SQLite-backed `LocalStore`:
//! - Connection pooling via r2d2 for concurrent access
//! - Schema version stamped in `PRAGMA user_version`
//! - WAL mode for optimal read/write performance

use std::path::Path;
use std::sync::Arc;

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;

use super::LocalStore;
use crate::types::{PilotError, Result, ResultExt, log_filter_error};

/// Shared database handle for async contexts.
pub type SharedDatabase = Arc<Database>;

const SCHEMA: &str = include_str!("schema.sql");

/// Schema version stamped into `PRAGMA user_version`
const SCHEMA_VERSION: u32 = 1;

/// Connection pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of connections in the pool
    pub max_size: u32,
    /// Minimum idle connections to keep ready
    pub min_idle: u32,
    /// Timeout for acquiring a connection (seconds)
    pub connection_timeout_secs: u64,
}

impl PoolConfig {
    const MIN_POOL_SIZE: u32 = 2;
    const MAX_POOL_SIZE: u32 = 8;

    /// Pool size from available cores: clamp(cores, MIN, MAX).
    /// The workload is a handful of concurrent tick and flush writers.
    pub fn optimal_pool_size() -> u32 {
        let cores = std::thread::available_parallelism()
            .map(|p| p.get() as u32)
            .unwrap_or(4);
        cores.clamp(Self::MIN_POOL_SIZE, Self::MAX_POOL_SIZE)
    }

    pub fn auto() -> Self {
        let max_size = Self::optimal_pool_size();
        Self {
            max_size,
            min_idle: (max_size / 4).max(1),
            connection_timeout_secs: 30,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::auto()
    }
}

/// Thread-safe document database with connection pooling.
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
}

impl Database {
    /// Open and initialize the database at the specified path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_config(path, PoolConfig::default())
    }

    pub fn open_with_config<P: AsRef<Path>>(path: P, config: PoolConfig) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let manager =
            SqliteConnectionManager::file(path.as_ref()).with_init(Self::configure_connection);

        let pool = Pool::builder()
            .max_size(config.max_size)
            .min_idle(Some(config.min_idle))
            .connection_timeout(std::time::Duration::from_secs(
                config.connection_timeout_secs,
            ))
            .build(manager)
            .map_err(|e| PilotError::Storage(format!("Failed to create connection pool: {}", e)))?;

        let db = Self { pool };
        db.initialize()?;
        Ok(db)
    }

    /// Open an in-memory database for testing or ephemeral runs.
    pub fn open_in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory();

        // A single connection: every in-memory connection is its own database
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| PilotError::Storage(format!("Failed to create in-memory pool: {}", e)))?;

        let db = Self { pool };
        db.initialize()?;
        Ok(db)
    }

    fn configure_connection(conn: &mut Connection) -> std::result::Result<(), rusqlite::Error> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -16000;
            PRAGMA busy_timeout = 5000;
            PRAGMA wal_autocheckpoint = 1000;
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(|e| {
            PilotError::Storage(format!("Failed to acquire database connection: {}", e))
        })
    }

    /// Create tables and stamp the schema version. A database written by a
    /// newer build is refused rather than silently misread.
    fn initialize(&self) -> Result<()> {
        let conn = self.conn()?;
        let current_version: u32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap_or(0);

        if current_version > SCHEMA_VERSION {
            return Err(PilotError::Storage(format!(
                "Database schema version {} is newer than supported version {}",
                current_version, SCHEMA_VERSION
            )));
        }

        conn.execute_batch(SCHEMA)
            .with_context("Failed to initialize database schema")?;

        if current_version < SCHEMA_VERSION {
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)
                .with_context("Failed to set schema version")?;
        }
        Ok(())
    }

    pub fn schema_version(&self) -> Result<u32> {
        let conn = self.conn()?;
        conn.pragma_query_value(None, "user_version", |row| row.get(0))
            .with_context("Failed to read schema version")
    }
}

impl LocalStore for Database {
    fn get(&self, collection: &str, key: &str) -> Result<Option<Value>> {
        let conn = self.conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM documents WHERE collection = ?1 AND key = ?2",
                params![collection, key],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|s| serde_json::from_str(&s).map_err(PilotError::from))
            .transpose()
    }

    fn put(&self, collection: &str, key: &str, value: &Value) -> Result<()> {
        let conn = self.conn()?;
        let encoded = serde_json::to_string(value)?;
        conn.execute(
            "INSERT INTO documents (collection, key, value, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(collection, key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![collection, key, encoded, chrono::Utc::now().to_rfc3339()],
        )
        .with_context_fn(|| format!("Failed to write {}/{}", collection, key))?;
        Ok(())
    }

    fn get_all(&self, collection: &str) -> Result<Vec<(String, Value)>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT key, value FROM documents WHERE collection = ?1 ORDER BY key")?;
        let docs: Vec<(String, Value)> = stmt
            .query_map(params![collection], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .filter_map(|r| log_filter_error(r, "Failed to read document row"))
            .filter_map(|(key, raw)| {
                log_filter_error(serde_json::from_str(&raw), "Skipping corrupt document")
                    .map(|value| (key, value))
            })
            .collect();
        Ok(docs)
    }

    fn get_all_keys(&self, collection: &str) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT key FROM documents WHERE collection = ?1 ORDER BY key")?;
        let keys: Vec<String> = stmt
            .query_map(params![collection], |row| row.get(0))?
            .filter_map(|r| log_filter_error(r, "Failed to read document key"))
            .collect();
        Ok(keys)
    }

    fn delete(&self, collection: &str, key: &str) -> Result<bool> {
        let conn = self.conn()?;
        let affected = conn.execute(
            "DELETE FROM documents WHERE collection = ?1 AND key = ?2",
            params![collection, key],
        )?;
        Ok(affected > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_open_in_memory() {
        let db = Database::open_in_memory().expect("Failed to open in-memory database");
        assert_eq!(db.schema_version().unwrap(), SCHEMA_VERSION);

        let conn = db.conn().expect("Failed to get connection");
        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        assert!(tables.contains(&"documents".to_string()));
    }

    #[test]
    fn test_document_roundtrip() {
        let db = Database::open_in_memory().unwrap();
        db.put("threads", "t1", &json!({"id": "t1", "n": 1})).unwrap();
        db.put("threads", "t1", &json!({"id": "t1", "n": 2})).unwrap();
        db.put("threads", "t0", &json!({"id": "t0"})).unwrap();

        assert_eq!(db.get("threads", "t1").unwrap(), Some(json!({"id": "t1", "n": 2})));
        assert_eq!(db.get("threads", "missing").unwrap(), None);
        assert_eq!(db.get("other", "t1").unwrap(), None);
        assert_eq!(db.get_all_keys("threads").unwrap(), vec!["t0", "t1"]);
        assert_eq!(db.get_all("threads").unwrap().len(), 2);

        assert!(db.delete("threads", "t0").unwrap());
        assert!(!db.delete("threads", "t0").unwrap());
    }

    #[test]
    fn test_file_database_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("pilot.db");
        {
            let db = Database::open(&path).unwrap();
            db.put("ai_state", "quota_state", &json!([])).unwrap();
        }
        let db = Database::open(&path).unwrap();
        assert_eq!(db.get("ai_state", "quota_state").unwrap(), Some(json!([])));
        assert_eq!(db.schema_version().unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_newer_schema_refused() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pilot.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.pragma_update(None, "user_version", SCHEMA_VERSION + 1)
                .unwrap();
        }

        assert!(matches!(Database::open(&path), Err(PilotError::Storage(_))));
    }

    #[test]
    fn test_pool_config_sizing() {
        let size = PoolConfig::optimal_pool_size();
        assert!(size >= PoolConfig::MIN_POOL_SIZE);
        assert!(size <= PoolConfig::MAX_POOL_SIZE);

        let auto = PoolConfig::auto();
        assert_eq!(auto.max_size, size);
        assert!(auto.min_idle >= 1);
        assert!(auto.min_idle <= auto.max_size);
    }
}
