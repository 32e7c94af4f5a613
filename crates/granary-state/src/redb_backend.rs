//! RedbBackend — redb-backed versioned key-value namespaces.
//!
//! Each namespace is its own redb table inside one database file. Every
//! conditional mutation runs in a single write transaction: the version
//! check, the version allocation and the write commit together or not at
//! all. redb serializes write transactions, which makes per-key writes
//! linearizable.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, TableError, WriteTransaction};
use tracing::{debug, info};

use crate::backend::{Entry, StorageBackend, Version};
use crate::error::{StateError, StateResult};
use crate::tables::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Open the namespace table for reading, mapping a missing table to
/// [`StateError::NamespaceMissing`].
macro_rules! open_read_table {
    ($self:ident, $txn:ident) => {
        match $txn.open_table($self.table()) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => {
                return Err(StateError::NamespaceMissing($self.namespace.clone()));
            }
            Err(e) => return Err(StateError::Unavailable(e.to_string())),
        }
    };
}

/// Thread-safe versioned store over one redb namespace.
#[derive(Clone)]
pub struct RedbBackend {
    db: Arc<Database>,
    namespace: String,
}

impl RedbBackend {
    /// Open (or create) a database file and bind to `namespace`.
    pub fn open(path: &Path, namespace: &str) -> StateResult<Self> {
        validate_namespace(namespace)?;
        let db = Database::create(path).map_err(map_err!(Open))?;
        debug!(?path, %namespace, "redb backend opened");
        Ok(Self {
            db: Arc::new(db),
            namespace: namespace.to_string(),
        })
    }

    /// Create an ephemeral in-memory database bound to `namespace`.
    pub fn open_in_memory(namespace: &str) -> StateResult<Self> {
        validate_namespace(namespace)?;
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        debug!(%namespace, "in-memory redb backend opened");
        Ok(Self {
            db: Arc::new(db),
            namespace: namespace.to_string(),
        })
    }

    /// Another namespace in the same database.
    pub fn with_namespace(&self, namespace: &str) -> StateResult<Self> {
        validate_namespace(namespace)?;
        Ok(Self {
            db: Arc::clone(&self.db),
            namespace: namespace.to_string(),
        })
    }

    fn table(&self) -> TableDefinition<'_, &'static str, &'static [u8]> {
        TableDefinition::new(&self.namespace)
    }

    /// Commit `txn` when `outcome` is Ok, abort it otherwise.
    fn finish<T>(&self, txn: WriteTransaction, outcome: StateResult<T>) -> StateResult<T> {
        match outcome {
            Ok(value) => {
                txn.commit().map_err(map_err!(Unavailable))?;
                Ok(value)
            }
            Err(e) => {
                txn.abort().map_err(map_err!(Unavailable))?;
                Err(e)
            }
        }
    }
}

impl StorageBackend for RedbBackend {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn ensure_namespace_exists(&self, allow_create: bool) -> StateResult<()> {
        let exists = {
            let txn = self.db.begin_read().map_err(map_err!(Unavailable))?;
            match txn.open_table(self.table()) {
                Ok(_) => true,
                Err(TableError::TableDoesNotExist(_)) => false,
                Err(e) => return Err(StateError::Unavailable(e.to_string())),
            }
        };
        if exists {
            return Ok(());
        }
        if !allow_create {
            return Err(StateError::NamespaceMissing(self.namespace.clone()));
        }

        let txn = self.db.begin_write().map_err(map_err!(Unavailable))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(self.table()).map_err(map_err!(Unavailable))?;
        txn.open_table(META).map_err(map_err!(Unavailable))?;
        txn.commit().map_err(map_err!(Unavailable))?;
        info!(namespace = %self.namespace, "namespace created");
        Ok(())
    }

    fn get(&self, key: &str) -> StateResult<Option<Entry>> {
        let txn = self.db.begin_read().map_err(map_err!(Unavailable))?;
        let table = open_read_table!(self, txn);
        match table.get(key).map_err(map_err!(Unavailable))? {
            Some(guard) => Ok(Some(decode(key, guard.value())?)),
            None => Ok(None),
        }
    }

    fn put(&self, key: &str, value: &[u8], expected: Option<Version>) -> StateResult<Version> {
        let txn = self.db.begin_write().map_err(map_err!(Unavailable))?;
        let outcome = (|| -> StateResult<Version> {
            let mut table = txn.open_table(self.table()).map_err(map_err!(Unavailable))?;
            let actual = current_version(&table, key)?;
            if actual != expected {
                return Err(StateError::Conflict {
                    key: key.to_string(),
                    expected,
                    actual,
                });
            }
            let version = next_version(&txn)?;
            let encoded = encode(version, value);
            table
                .insert(key, encoded.as_slice())
                .map_err(map_err!(Unavailable))?;
            Ok(version)
        })();
        let version = self.finish(txn, outcome)?;
        debug!(namespace = %self.namespace, %key, %version, "entry written");
        Ok(version)
    }

    fn delete(&self, key: &str, expected: Version) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Unavailable))?;
        let outcome = (|| -> StateResult<()> {
            let mut table = txn.open_table(self.table()).map_err(map_err!(Unavailable))?;
            let actual = current_version(&table, key)?;
            if actual != Some(expected) {
                return Err(StateError::Conflict {
                    key: key.to_string(),
                    expected: Some(expected),
                    actual,
                });
            }
            table.remove(key).map_err(map_err!(Unavailable))?;
            Ok(())
        })();
        self.finish(txn, outcome)?;
        debug!(namespace = %self.namespace, %key, "entry deleted");
        Ok(())
    }

    fn list(&self, prefix: &str) -> StateResult<Vec<Entry>> {
        let txn = self.db.begin_read().map_err(map_err!(Unavailable))?;
        let table = open_read_table!(self, txn);
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Unavailable))? {
            let (key, value) = entry.map_err(map_err!(Unavailable))?;
            let key = key.value();
            if key.starts_with(prefix) {
                results.push(decode(key, value.value())?);
            } else if key > prefix {
                // Keys are sorted; nothing further can match.
                break;
            }
        }
        Ok(results)
    }
}

fn validate_namespace(namespace: &str) -> StateResult<()> {
    if namespace.trim().is_empty() || namespace == META_TABLE_NAME {
        return Err(StateError::Open(format!("invalid namespace name {namespace:?}")));
    }
    Ok(())
}

fn current_version<T>(table: &T, key: &str) -> StateResult<Option<Version>>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key).map_err(map_err!(Unavailable))? {
        Some(guard) => Ok(Some(decode(key, guard.value())?.version)),
        None => Ok(None),
    }
}

fn next_version(txn: &WriteTransaction) -> StateResult<Version> {
    let mut meta = txn.open_table(META).map_err(map_err!(Unavailable))?;
    let last = meta
        .get(VERSION_SEQ)
        .map_err(map_err!(Unavailable))?
        .map(|guard| guard.value())
        .unwrap_or(0);
    let next = last + 1;
    meta.insert(VERSION_SEQ, next).map_err(map_err!(Unavailable))?;
    Ok(Version::new(next))
}

fn encode(version: Version, value: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(VERSION_HEADER + value.len());
    buf.extend_from_slice(&version.get().to_be_bytes());
    buf.extend_from_slice(value);
    buf
}

fn decode(key: &str, raw: &[u8]) -> StateResult<Entry> {
    let Some((header, value)) = raw.split_first_chunk::<VERSION_HEADER>() else {
        return Err(StateError::Corrupt {
            key: key.to_string(),
            reason: format!("value is {} bytes, shorter than version header", raw.len()),
        });
    };
    Ok(Entry {
        key: key.to_string(),
        value: value.to_vec(),
        version: Version::new(u64::from_be_bytes(*header)),
    })
}
