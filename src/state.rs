//! Persisted state documents
//!
//! Every concern (fix dictionary, remote cache, ban ledger, rate windows,
//! issuer pool, daemon stats) is one schema-versioned JSON document stored
//! as a row of a SQLite database. Read-modify-write cycles run inside a
//! `BEGIN IMMEDIATE` transaction so the foreground process and the daemon
//! serialize on the database instead of racing on whole-file rewrites.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{FixbaseError, Result};

/// How long a writer waits on a locked database before giving up
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// A persisted document with a stable name and schema version.
pub trait Document: Serialize + DeserializeOwned + Default {
    /// Row key in the documents table
    const NAME: &'static str;

    /// Bumped whenever the body layout changes incompatibly
    const SCHEMA_VERSION: u32 = 1;
}

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    schema_version: u32,
    body: T,
}

/// SQLite-backed document store shared by every service.
pub struct StateStore {
    db: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl StateStore {
    /// Open or create `state.db` under the data directory.
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join("state.db");
        let db = Connection::open(&db_path)?;

        // WAL lets the status command read while the daemon writes
        db.execute_batch("PRAGMA journal_mode=WAL;")?;
        let store = Self::init(db, Some(db_path))?;

        info!(path = ?store.path, "State store opened");
        Ok(store)
    }

    /// Volatile store, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(db: Connection, path: Option<PathBuf>) -> Result<Self> {
        db.busy_timeout(BUSY_TIMEOUT)?;
        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS documents (
                name TEXT PRIMARY KEY,
                data TEXT NOT NULL,
                updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
            );",
        )?;
        Ok(Self {
            db: Mutex::new(db),
            path,
        })
    }

    /// Database file location, if on disk
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Load a document, falling back to its default when missing or corrupt.
    pub fn load<D: Document>(&self) -> Result<D> {
        let db = self.lock()?;
        read_document(&db)
    }

    /// Replace a document wholesale.
    pub fn save<D: Document>(&self, doc: &D) -> Result<()> {
        let db = self.lock()?;
        write_document(&db, doc)
    }

    /// Atomically load, mutate and store a document.
    ///
    /// The closure runs inside an IMMEDIATE transaction; if it returns an
    /// error nothing is written.
    pub fn update<D, R, F>(&self, f: F) -> Result<R>
    where
        D: Document,
        F: FnOnce(&mut D) -> Result<R>,
    {
        let mut db = self.lock()?;
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut doc: D = read_document(&tx)?;
        let out = f(&mut doc)?;
        write_document(&tx, &doc)?;
        tx.commit()?;
        Ok(out)
    }

    /// Reclaim free pages after large cleanups.
    pub fn vacuum(&self) -> Result<()> {
        let db = self.lock()?;
        db.execute_batch("VACUUM;")?;
        debug!("State store vacuumed");
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db.lock().map_err(|_| FixbaseError::LockPoisoned)
    }
}

fn read_document<D: Document>(db: &Connection) -> Result<D> {
    let raw: Option<String> = db
        .query_row(
            "SELECT data FROM documents WHERE name = ?1",
            [D::NAME],
            |row| row.get(0),
        )
        .optional()?;

    let Some(raw) = raw else {
        return Ok(D::default());
    };

    match decode::<D>(&raw) {
        Ok(doc) => Ok(doc),
        Err(e) => {
            // Degrade to empty state; the next write rebuilds the row
            warn!(document = D::NAME, error = %e, "Discarding unreadable state document");
            Ok(D::default())
        }
    }
}

fn decode<D: Document>(raw: &str) -> Result<D> {
    let envelope: Envelope<serde_json::Value> = serde_json::from_str(raw)?;
    if envelope.schema_version != D::SCHEMA_VERSION {
        return Err(FixbaseError::CorruptState {
            document: D::NAME.to_string(),
            reason: format!(
                "schema version {} (expected {})",
                envelope.schema_version,
                D::SCHEMA_VERSION
            ),
        });
    }
    Ok(serde_json::from_value(envelope.body)?)
}

fn write_document<D: Document>(db: &Connection, doc: &D) -> Result<()> {
    let data = serde_json::to_string(&Envelope {
        schema_version: D::SCHEMA_VERSION,
        body: doc,
    })?;
    db.execute(
        "INSERT INTO documents (name, data, updated_at)
         VALUES (?1, ?2, strftime('%s', 'now'))
         ON CONFLICT(name) DO UPDATE SET data = ?2, updated_at = strftime('%s', 'now')",
        rusqlite::params![D::NAME, data],
    )?;
    debug!(document = D::NAME, bytes = data.len(), "Saved document");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    #[serde(deny_unknown_fields)]
    struct Counter {
        value: u32,
    }

    impl Document for Counter {
        const NAME: &'static str = "counter";
    }

    #[test]
    fn test_missing_document_is_default() {
        let store = StateStore::open_in_memory().unwrap();
        assert_eq!(store.load::<Counter>().unwrap(), Counter::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        store.save(&Counter { value: 7 }).unwrap();
        drop(store);

        let reopened = StateStore::open(dir.path()).unwrap();
        assert_eq!(reopened.load::<Counter>().unwrap().value, 7);
    }

    #[test]
    fn test_update_is_atomic_on_error() {
        let store = StateStore::open_in_memory().unwrap();
        store.save(&Counter { value: 1 }).unwrap();

        let result: Result<()> = store.update(|c: &mut Counter| {
            c.value = 99;
            Err(FixbaseError::NotFound("nope".into()))
        });
        assert!(result.is_err());
        assert_eq!(store.load::<Counter>().unwrap().value, 1);

        let doubled = store
            .update(|c: &mut Counter| {
                c.value *= 2;
                Ok(c.value)
            })
            .unwrap();
        assert_eq!(doubled, 2);
    }

    #[test]
    fn test_corrupt_document_treated_as_empty() {
        let store = StateStore::open_in_memory().unwrap();
        {
            let db = store.lock().unwrap();
            db.execute(
                "INSERT INTO documents (name, data) VALUES ('counter', '{not json')",
                [],
            )
            .unwrap();
        }
        assert_eq!(store.load::<Counter>().unwrap(), Counter::default());

        // Next write rebuilds the row
        store.save(&Counter { value: 3 }).unwrap();
        assert_eq!(store.load::<Counter>().unwrap().value, 3);
    }

    #[test]
    fn test_schema_mismatch_treated_as_empty() {
        let store = StateStore::open_in_memory().unwrap();
        {
            let db = store.lock().unwrap();
            db.execute(
                "INSERT INTO documents (name, data) VALUES ('counter', '{\"schema_version\":9,\"body\":{\"value\":5}}')",
                [],
            )
            .unwrap();
        }
        assert_eq!(store.load::<Counter>().unwrap().value, 0);
    }
}
