use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Result, SignalError};
use crate::keystore::KeyStore;

/// Bump when `SCHEMA` changes. The file is never wiped on mismatch: it holds
/// the device identity.
const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS key_material (
    namespace TEXT NOT NULL,
    key TEXT NOT NULL,
    value BLOB NOT NULL,
    PRIMARY KEY (namespace, key)
);
";

/// Durable `SQLite`-backed key store, one file per device.
pub struct SqliteKeyStore {
    conn: Mutex<Connection>,
}

impl SqliteKeyStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let current: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

        if current > SCHEMA_VERSION {
            return Err(SignalError::Storage(format!(
                "key store schema {current} is newer than supported {SCHEMA_VERSION}"
            )));
        }
        if current < SCHEMA_VERSION {
            conn.execute_batch(SCHEMA)?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
            tracing::debug!(old = current, new = SCHEMA_VERSION, "key store schema applied");
        }

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl KeyStore for SqliteKeyStore {
    fn put(&self, namespace: &str, key: &str, value: &[u8]) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO key_material (namespace, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(namespace, key) DO UPDATE SET value = excluded.value",
            params![namespace, key, value],
        )?;
        Ok(())
    }

    fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let value = self
            .conn
            .lock()
            .query_row(
                "SELECT value FROM key_material WHERE namespace = ?1 AND key = ?2",
                params![namespace, key],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn remove(&self, namespace: &str, key: &str) -> Result<()> {
        self.conn.lock().execute(
            "DELETE FROM key_material WHERE namespace = ?1 AND key = ?2",
            params![namespace, key],
        )?;
        Ok(())
    }

    fn keys(&self, namespace: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT key FROM key_material WHERE namespace = ?1 ORDER BY key")?;
        let keys = stmt
            .query_map(params![namespace], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(keys)
    }
}
