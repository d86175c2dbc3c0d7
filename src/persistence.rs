//! Key-value persistence layer for powchain
//!
//! Storage is organised in named buckets. Every mutation goes through
//! [`KvStore::transact`], which either applies all writes made by the closure
//! or none of them.

use crate::error::ChainError;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Blocks keyed by hash, plus the tail pointer under [`TAIL_KEY`].
pub const BLOCKS_BUCKET: &str = "blocks";
/// Incremental unspent-output index keyed by `txid || index`.
pub const UTXO_BUCKET: &str = "utxo";
/// Distinguished key holding the hash of the most recent block.
pub const TAIL_KEY: &[u8] = b"l";

/// Writable view handed to a [`KvStore::transact`] closure.
pub trait KvTransaction {
    fn bucket_exists(&self, bucket: &str) -> Result<bool, ChainError>;
    fn create_bucket(&mut self, bucket: &str) -> Result<(), ChainError>;
    fn get(&self, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>, ChainError>;
    fn put(&mut self, bucket: &str, key: &[u8], value: &[u8]) -> Result<(), ChainError>;
    fn delete(&mut self, bucket: &str, key: &[u8]) -> Result<(), ChainError>;
    fn clear_bucket(&mut self, bucket: &str) -> Result<(), ChainError>;
}

/// Abstraction for persistence backends.
pub trait KvStore: Send + Sync {
    fn bucket_exists(&self, bucket: &str) -> Result<bool, ChainError>;
    fn get(&self, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>, ChainError>;
    /// All entries of a bucket in key order.
    fn iterate(&self, bucket: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>, ChainError>;
    /// Runs `f` atomically: an `Err` from `f` discards every write it made.
    fn transact(
        &self,
        f: &mut dyn FnMut(&mut dyn KvTransaction) -> Result<(), ChainError>,
    ) -> Result<(), ChainError>;

    fn put(&self, bucket: &str, key: &[u8], value: &[u8]) -> Result<(), ChainError> {
        self.transact(&mut |tx| tx.put(bucket, key, value))
    }
}

fn missing_bucket(bucket: &str) -> ChainError {
    ChainError::NotFound(format!("bucket '{}' does not exist", bucket))
}

// ---------------------------------------------------------------------------
// SQLite backend
// ---------------------------------------------------------------------------

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, ChainError> {
        let conn = Connection::open(path)
            .map_err(|e| ChainError::DatabaseError(format!("Failed to open database: {}", e)))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, ChainError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| ChainError::DatabaseError(format!("Failed to open database: {}", e)))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, ChainError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS buckets (
                name TEXT PRIMARY KEY
            )",
            [],
        )
        .map_err(|e| ChainError::DatabaseError(format!("Failed to create buckets table: {}", e)))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (
                bucket TEXT NOT NULL,
                key BLOB NOT NULL,
                value BLOB NOT NULL,
                PRIMARY KEY (bucket, key)
            )",
            [],
        )
        .map_err(|e| ChainError::DatabaseError(format!("Failed to create kv table: {}", e)))?;

        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, ChainError> {
        self.conn
            .lock()
            .map_err(|_| ChainError::DatabaseError("Mutex poisoned".to_string()))
    }
}

fn sql_bucket_exists(conn: &Connection, bucket: &str) -> Result<bool, ChainError> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM buckets WHERE name = ?1",
            params![bucket],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn sql_get(conn: &Connection, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>, ChainError> {
    if !sql_bucket_exists(conn, bucket)? {
        return Err(missing_bucket(bucket));
    }
    let value = conn
        .query_row(
            "SELECT value FROM kv WHERE bucket = ?1 AND key = ?2",
            params![bucket, key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

struct SqliteTransaction<'a> {
    conn: &'a Connection,
}

impl KvTransaction for SqliteTransaction<'_> {
    fn bucket_exists(&self, bucket: &str) -> Result<bool, ChainError> {
        sql_bucket_exists(self.conn, bucket)
    }

    fn create_bucket(&mut self, bucket: &str) -> Result<(), ChainError> {
        self.conn
            .execute("INSERT OR IGNORE INTO buckets (name) VALUES (?1)", params![bucket])?;
        Ok(())
    }

    fn get(&self, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>, ChainError> {
        sql_get(self.conn, bucket, key)
    }

    fn put(&mut self, bucket: &str, key: &[u8], value: &[u8]) -> Result<(), ChainError> {
        if !sql_bucket_exists(self.conn, bucket)? {
            return Err(missing_bucket(bucket));
        }
        self.conn.execute(
            "INSERT OR REPLACE INTO kv (bucket, key, value) VALUES (?1, ?2, ?3)",
            params![bucket, key, value],
        )?;
        Ok(())
    }

    fn delete(&mut self, bucket: &str, key: &[u8]) -> Result<(), ChainError> {
        self.conn.execute(
            "DELETE FROM kv WHERE bucket = ?1 AND key = ?2",
            params![bucket, key],
        )?;
        Ok(())
    }

    fn clear_bucket(&mut self, bucket: &str) -> Result<(), ChainError> {
        self.conn
            .execute("DELETE FROM kv WHERE bucket = ?1", params![bucket])?;
        Ok(())
    }
}

impl KvStore for SqliteStore {
    fn bucket_exists(&self, bucket: &str) -> Result<bool, ChainError> {
        let conn = self.lock()?;
        sql_bucket_exists(&conn, bucket)
    }

    fn get(&self, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>, ChainError> {
        let conn = self.lock()?;
        sql_get(&conn, bucket, key)
    }

    fn iterate(&self, bucket: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>, ChainError> {
        let conn = self.lock()?;
        if !sql_bucket_exists(&conn, bucket)? {
            return Err(missing_bucket(bucket));
        }
        let mut stmt = conn
            .prepare("SELECT key, value FROM kv WHERE bucket = ?1 ORDER BY key ASC")
            .map_err(|e| ChainError::DatabaseError(format!("Failed to prepare query: {}", e)))?;
        let rows = stmt
            .query_map(params![bucket], |row| {
                Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
            })
            .map_err(|e| ChainError::DatabaseError(format!("Failed to query bucket: {}", e)))?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(
                row.map_err(|e| ChainError::DatabaseError(format!("Failed to read row: {}", e)))?,
            );
        }
        Ok(entries)
    }

    fn transact(
        &self,
        f: &mut dyn FnMut(&mut dyn KvTransaction) -> Result<(), ChainError>,
    ) -> Result<(), ChainError> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| ChainError::DatabaseError(format!("Failed to start transaction: {}", e)))?;

        // Dropping `tx` without commit rolls back.
        f(&mut SqliteTransaction { conn: &*tx })?;

        tx.commit()
            .map_err(|e| ChainError::DatabaseError(format!("Failed to commit transaction: {}", e)))
    }
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

type Buckets = BTreeMap<String, BTreeMap<Vec<u8>, Vec<u8>>>;

/// Simple in-memory store useful for tests and ephemeral runs.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    buckets: Arc<Mutex<Buckets>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Buckets>, ChainError> {
        self.buckets
            .lock()
            .map_err(|_| ChainError::DatabaseError("Mutex poisoned".to_string()))
    }
}

struct MemoryTransaction {
    buckets: Buckets,
}

impl KvTransaction for MemoryTransaction {
    fn bucket_exists(&self, bucket: &str) -> Result<bool, ChainError> {
        Ok(self.buckets.contains_key(bucket))
    }

    fn create_bucket(&mut self, bucket: &str) -> Result<(), ChainError> {
        self.buckets.entry(bucket.to_string()).or_default();
        Ok(())
    }

    fn get(&self, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>, ChainError> {
        let b = self.buckets.get(bucket).ok_or_else(|| missing_bucket(bucket))?;
        Ok(b.get(key).cloned())
    }

    fn put(&mut self, bucket: &str, key: &[u8], value: &[u8]) -> Result<(), ChainError> {
        let b = self
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| missing_bucket(bucket))?;
        b.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&mut self, bucket: &str, key: &[u8]) -> Result<(), ChainError> {
        if let Some(b) = self.buckets.get_mut(bucket) {
            b.remove(key);
        }
        Ok(())
    }

    fn clear_bucket(&mut self, bucket: &str) -> Result<(), ChainError> {
        if let Some(b) = self.buckets.get_mut(bucket) {
            b.clear();
        }
        Ok(())
    }
}

impl KvStore for InMemoryStore {
    fn bucket_exists(&self, bucket: &str) -> Result<bool, ChainError> {
        Ok(self.lock()?.contains_key(bucket))
    }

    fn get(&self, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>, ChainError> {
        let buckets = self.lock()?;
        let b = buckets.get(bucket).ok_or_else(|| missing_bucket(bucket))?;
        Ok(b.get(key).cloned())
    }

    fn iterate(&self, bucket: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>, ChainError> {
        let buckets = self.lock()?;
        let b = buckets.get(bucket).ok_or_else(|| missing_bucket(bucket))?;
        Ok(b.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    fn transact(
        &self,
        f: &mut dyn FnMut(&mut dyn KvTransaction) -> Result<(), ChainError>,
    ) -> Result<(), ChainError> {
        let mut buckets = self.lock()?;
        let mut tx = MemoryTransaction {
            buckets: buckets.clone(),
        };
        f(&mut tx)?;
        *buckets = tx.buckets;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backends() -> Vec<Box<dyn KvStore>> {
        vec![
            Box::new(InMemoryStore::new()),
            Box::new(SqliteStore::open_in_memory().unwrap()),
        ]
    }

    #[test]
    fn test_put_get_roundtrip() {
        for store in backends() {
            store
                .transact(&mut |tx| tx.create_bucket(BLOCKS_BUCKET))
                .unwrap();
            store.put(BLOCKS_BUCKET, b"k", b"v").unwrap();
            assert_eq!(store.get(BLOCKS_BUCKET, b"k").unwrap(), Some(b"v".to_vec()));
            assert_eq!(store.get(BLOCKS_BUCKET, b"missing").unwrap(), None);
        }
    }

    #[test]
    fn test_missing_bucket_is_not_found() {
        for store in backends() {
            assert!(!store.bucket_exists(BLOCKS_BUCKET).unwrap());
            assert!(matches!(
                store.get(BLOCKS_BUCKET, b"k"),
                Err(ChainError::NotFound(_))
            ));
            assert!(matches!(
                store.put(BLOCKS_BUCKET, b"k", b"v"),
                Err(ChainError::NotFound(_))
            ));
        }
    }

    #[test]
    fn test_failed_transaction_rolls_back() {
        for store in backends() {
            store
                .transact(&mut |tx| tx.create_bucket(BLOCKS_BUCKET))
                .unwrap();

            let result = store.transact(&mut |tx| {
                tx.put(BLOCKS_BUCKET, b"a", b"1")?;
                tx.put(BLOCKS_BUCKET, TAIL_KEY, b"a")?;
                Err(ChainError::DatabaseError("boom".to_string()))
            });
            assert!(result.is_err());
            assert_eq!(store.get(BLOCKS_BUCKET, b"a").unwrap(), None);
            assert_eq!(store.get(BLOCKS_BUCKET, TAIL_KEY).unwrap(), None);
        }
    }

    #[test]
    fn test_iterate_delete_and_clear() {
        for store in backends() {
            store
                .transact(&mut |tx| {
                    tx.create_bucket(UTXO_BUCKET)?;
                    tx.put(UTXO_BUCKET, b"b", b"2")?;
                    tx.put(UTXO_BUCKET, b"a", b"1")?;
                    tx.put(UTXO_BUCKET, b"c", b"3")?;
                    tx.delete(UTXO_BUCKET, b"c")
                })
                .unwrap();

            let entries = store.iterate(UTXO_BUCKET).unwrap();
            assert_eq!(
                entries,
                vec![
                    (b"a".to_vec(), b"1".to_vec()),
                    (b"b".to_vec(), b"2".to_vec())
                ]
            );

            store
                .transact(&mut |tx| tx.clear_bucket(UTXO_BUCKET))
                .unwrap();
            assert!(store.iterate(UTXO_BUCKET).unwrap().is_empty());
            assert!(store.bucket_exists(UTXO_BUCKET).unwrap());
        }
    }

    #[test]
    fn test_sqlite_file_survives_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("chain.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .transact(&mut |tx| {
                    tx.create_bucket(BLOCKS_BUCKET)?;
                    tx.put(BLOCKS_BUCKET, TAIL_KEY, b"tail")
                })
                .unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(
            store.get(BLOCKS_BUCKET, TAIL_KEY).unwrap(),
            Some(b"tail".to_vec())
        );
    }
}
