//! Durable trust and order persistence.
//!
//! # Responsibility
//! - Persist per-package trust decisions across process restarts.
//! - Persist the user-defined chan order.
//!
//! # Invariants
//! - Only `Trusted` decisions are persisted; `Discarded` stays in memory.
//! - Order writes replace the whole list atomically.

use crate::db::DbError;
use std::error::Error;
use std::fmt::{Display, Formatter};

mod sqlite;

pub use sqlite::SqliteExtensionStore;

pub type StoreResult<T> = Result<T, StoreError>;

/// Trust/order persistence error.
#[derive(Debug)]
pub enum StoreError {
    Db(DbError),
    InvalidData(String),
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::InvalidData(message) => write!(f, "invalid persisted extension data: {message}"),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::InvalidData(_) => None,
        }
    }
}

impl From<DbError> for StoreError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

/// Per-package trust persistence keyed by package name.
pub trait TrustStore: Send + Sync {
    fn is_trusted(&self, package_name: &str) -> StoreResult<bool>;
    fn set_trusted(&self, package_name: &str) -> StoreResult<()>;
}

/// Persisted chan order.
pub trait OrderStore: Send + Sync {
    fn chan_order(&self) -> StoreResult<Vec<String>>;
    fn set_chan_order(&self, names: &[String]) -> StoreResult<()>;
}
