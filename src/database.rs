//! Database facade — named collections under one directory.
//!
//! A database is a directory `<base>/<name>/` holding one slot file per
//! collection.  Collections are created lazily on first access; creation
//! is guarded by a per-name mutex so concurrent `collection` calls for
//! the same name race-freely share one instance while unrelated names
//! proceed in parallel.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::collection::Collection;
use crate::error::{Result, StoreError};
use crate::options::{is_valid_database_name, StoreOptions};
use crate::{Key, Value};

/// Type-erased handle so one map can hold collections of any (K, V).
trait AnyCollection: Send + Sync {
    fn close_any(&self) -> Result<()>;
    fn delete_any(&self) -> Result<()>;
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<K: Key, V: Value> AnyCollection for Collection<K, V> {
    fn close_any(&self) -> Result<()> {
        self.close()
    }

    fn delete_any(&self) -> Result<()> {
        self.delete()
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

pub struct Database {
    options: StoreOptions,
    collections: DashMap<String, Arc<dyn AnyCollection>>,
    creation_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    closed: AtomicBool,
}

impl Database {
    /// Validate the database name and create its directory.
    pub fn open(options: StoreOptions) -> Result<Self> {
        if !is_valid_database_name(&options.database_name) {
            return Err(StoreError::InvalidDatabaseName(options.database_name.clone()));
        }
        if !options.memory_only && !options.read_only {
            std::fs::create_dir_all(options.database_dir())?;
        }
        log::info!("database {:?} opened", options.database_name);
        Ok(Self {
            options,
            collections: DashMap::new(),
            creation_locks: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.options.database_name
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::DatabaseClosed);
        }
        Ok(())
    }

    /// Get or create the collection `name`, loading it on first access.
    ///
    /// Accessing an existing name with different key/value types fails
    /// with `CollectionTypeMismatch`.
    pub fn collection<K: Key, V: Value>(&self, name: &str) -> Result<Arc<Collection<K, V>>> {
        self.ensure_open()?;
        if let Some(existing) = self.collections.get(name) {
            return downcast::<K, V>(Arc::clone(existing.value()), name);
        }

        // Per-name guard: losers of the race find the winner's instance.
        let name_lock = {
            let mut locks = self.creation_locks.lock();
            Arc::clone(locks.entry(name.to_owned()).or_default())
        };
        let _guard = name_lock.lock();
        if let Some(existing) = self.collections.get(name) {
            return downcast::<K, V>(Arc::clone(existing.value()), name);
        }

        let collection = Arc::new(Collection::<K, V>::create(name, self.options.clone()));
        collection.load()?;
        self.collections
            .insert(name.to_owned(), Arc::clone(&collection) as Arc<dyn AnyCollection>);
        Ok(collection)
    }

    /// Get or create the collection named after the value type, mapped
    /// through `file_name_fn`.
    pub fn collection_of<K: Key, V: Value>(&self) -> Result<Arc<Collection<K, V>>> {
        let stem = (self.options.file_name_fn)(std::any::type_name::<V>());
        self.collection::<K, V>(&stem)
    }

    /// Names of the collections opened through this database.
    pub fn collection_names(&self) -> Vec<String> {
        self.collections.iter().map(|e| e.key().clone()).collect()
    }

    /// Dispose a collection and remove its file.  Returns false when
    /// neither an open instance nor a file exists.
    pub fn delete_collection(&self, name: &str) -> Result<bool> {
        self.ensure_open()?;
        if self.options.read_only {
            return Err(StoreError::DatabaseReadOnly);
        }
        if let Some((_, collection)) = self.collections.remove(name) {
            collection.delete_any()?;
            return Ok(true);
        }
        let path = self.options.collection_path(name);
        if path.exists() {
            std::fs::remove_file(&path)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Close every collection (draining their pipelines) and mark the
    /// database closed.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(StoreError::DatabaseClosed);
        }
        let mut first_err = None;
        for entry in self.collections.iter() {
            if let Err(e) = entry.value().close_any() {
                log::error!("closing collection {:?} failed: {e}", entry.key());
                first_err.get_or_insert(e);
            }
        }
        self.collections.clear();
        log::info!("database {:?} closed", self.options.database_name);
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            let _ = self.close();
        }
    }
}

fn downcast<K: Key, V: Value>(
    collection: Arc<dyn AnyCollection>,
    name: &str,
) -> Result<Arc<Collection<K, V>>> {
    collection
        .as_any_arc()
        .downcast::<Collection<K, V>>()
        .map_err(|_| StoreError::CollectionTypeMismatch(name.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Player {
        name: String,
    }

    fn options(dir: &std::path::Path) -> StoreOptions {
        StoreOptions {
            base_directory: dir.to_string_lossy().into_owned(),
            database_name: "game".into(),
            ..StoreOptions::default()
        }
    }

    #[test]
    fn rejects_invalid_names() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = options(dir.path());
        opts.database_name = "no/slashes".into();
        assert!(matches!(
            Database::open(opts),
            Err(StoreError::InvalidDatabaseName(_))
        ));
    }

    #[test]
    fn get_or_create_returns_same_instance() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(options(dir.path())).unwrap();
        let a = db.collection::<u64, Player>("players").unwrap();
        let b = db.collection::<u64, Player>("players").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(db.collection_names(), vec!["players".to_owned()]);
    }

    #[test]
    fn type_mismatch_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(options(dir.path())).unwrap();
        db.collection::<u64, Player>("players").unwrap();
        assert!(matches!(
            db.collection::<u64, String>("players"),
            Err(StoreError::CollectionTypeMismatch(_))
        ));
    }

    #[test]
    fn collection_of_uses_type_name() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(options(dir.path())).unwrap();
        let c = db.collection_of::<u64, Player>().unwrap();
        assert_eq!(c.name(), "Player");
        assert!(dir.path().join("game").join("Player.sdb").exists());
    }

    #[test]
    fn closed_database_rejects_access() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(options(dir.path())).unwrap();
        let players = db.collection::<u64, Player>("players").unwrap();
        players.add(1, Player { name: "a".into() }).unwrap();
        db.close().unwrap();
        assert!(matches!(
            db.collection::<u64, Player>("players"),
            Err(StoreError::DatabaseClosed)
        ));
        // The collection handle was closed along with the database.
        assert!(matches!(players.get(&1), Err(StoreError::CollectionClosed)));
    }

    #[test]
    fn delete_collection_removes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(options(dir.path())).unwrap();
        let c = db.collection::<u64, Player>("players").unwrap();
        c.add(1, Player { name: "a".into() }).unwrap();
        let path = dir.path().join("game").join("players.sdb");
        assert!(path.exists());
        assert!(db.delete_collection("players").unwrap());
        assert!(!path.exists());
        assert!(!db.delete_collection("players").unwrap());
    }

    #[test]
    fn data_survives_database_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = Database::open(options(dir.path())).unwrap();
            let c = db.collection::<u64, Player>("players").unwrap();
            c.add(7, Player { name: "kept".into() }).unwrap();
            db.close().unwrap();
        }
        let db = Database::open(options(dir.path())).unwrap();
        let c = db.collection::<u64, Player>("players").unwrap();
        assert_eq!(c.get(&7).unwrap(), Some(Player { name: "kept".into() }));
    }
}
