//! SQLite implementation of the trust and order stores.

use super::{OrderStore, StoreError, StoreResult, TrustStore};
use crate::db::{open_db, open_db_in_memory};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

/// Trust and order store over one SQLite connection.
pub struct SqliteExtensionStore {
    conn: Mutex<Connection>,
}

impl SqliteExtensionStore {
    /// Opens (and migrates) a file database.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        Ok(Self::from_connection(open_db(path)?))
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Ok(Self::from_connection(open_db_in_memory()?))
    }

    /// Wraps a connection that already has migrations applied.
    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TrustStore for SqliteExtensionStore {
    fn is_trusted(&self, package_name: &str) -> StoreResult<bool> {
        let trusted = self
            .conn()
            .query_row(
                "SELECT trusted FROM extension_trust WHERE package_name = ?1;",
                [package_name],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        match trusted {
            None | Some(0) => Ok(false),
            Some(1) => Ok(true),
            Some(other) => Err(StoreError::InvalidData(format!(
                "trusted flag {other} for package {package_name}"
            ))),
        }
    }

    fn set_trusted(&self, package_name: &str) -> StoreResult<()> {
        self.conn().execute(
            "INSERT INTO extension_trust (package_name, trusted, updated_at_ms)
             VALUES (?1, 1, ?2)
             ON CONFLICT(package_name) DO UPDATE SET
                trusted = excluded.trusted,
                updated_at_ms = excluded.updated_at_ms;",
            params![package_name, now_ms()],
        )?;
        Ok(())
    }
}

impl OrderStore for SqliteExtensionStore {
    fn chan_order(&self) -> StoreResult<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT chan_name FROM chan_order ORDER BY position ASC;")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    fn set_chan_order(&self, names: &[String]) -> StoreResult<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM chan_order;", [])?;
        {
            let mut insert =
                tx.prepare("INSERT OR IGNORE INTO chan_order (position, chan_name) VALUES (?1, ?2);")?;
            for (position, name) in names.iter().enumerate() {
                insert.execute(params![position as i64, name])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as i64)
}
