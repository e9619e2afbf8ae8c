//! Collection facade — the per-collection embedding surface.
//!
//! A collection is a named persistent map K → V backed by one slot file.
//! The authoritative source for reads is an in-memory concurrent map;
//! `get`/`contains`/iteration never take the engine's stream lock.  While
//! the collection is open with persistence enabled, the keys of that map
//! match the `Allocated` slots of the file exactly.
//!
//! # Lifecycle
//! `create` → (`load`) → operations → `close`/`delete`.  Operations before
//! `load` fail with `CollectionNotLoaded`; a second `load` fails with
//! `CollectionAlreadyOpen`; every operation after `close` fails with
//! `CollectionClosed`.
//!
//! # Write visibility
//! In `Disabled` buffer mode an operation returns after the engine
//! returns.  In the buffered modes the value map is updated synchronously
//! and the file catches up in submission order; `flush` waits for the
//! pipeline to drain.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::codec::PairCodec;
use crate::crypto::{generate_salt, CryptoContext};
use crate::engine::StorageEngine;
use crate::error::{Result, StoreError};
use crate::header::{Header, HeaderError};
use crate::options::{
    is_valid_database_name, BufferMode, DuplicateKeyBehavior, FailureBehavior,
    KeyNotFoundBehavior, StoreOptions,
};
use crate::pipeline::{WriteOp, WritePipeline};
use crate::{Key, Value};

struct Persistent<K: Key, V: Value> {
    codec: Arc<PairCodec<K, V>>,
    engine: Arc<StorageEngine<K>>,
    pipeline: Option<WritePipeline<K, V>>,
}

struct Backend<K: Key, V: Value> {
    /// `None` when the collection is memory-only.
    store: Option<Persistent<K, V>>,
}

enum Phase<K: Key, V: Value> {
    New,
    Open(Backend<K, V>),
    Closed,
}

pub struct Collection<K: Key, V: Value> {
    name: String,
    path: PathBuf,
    options: StoreOptions,
    map: DashMap<K, V>,
    phase: RwLock<Phase<K, V>>,
}

fn backend<'a, K: Key, V: Value>(phase: &'a Phase<K, V>) -> Result<&'a Backend<K, V>> {
    match phase {
        Phase::Open(b) => Ok(b),
        Phase::New => Err(StoreError::CollectionNotLoaded),
        Phase::Closed => Err(StoreError::CollectionClosed),
    }
}

impl<K: Key, V: Value> Collection<K, V> {
    /// Create an unloaded handle.  `load` opens (or creates) the file.
    pub fn create(name: &str, options: StoreOptions) -> Self {
        let path = options.collection_path(name);
        Self {
            name: name.to_owned(),
            path,
            options,
            map: DashMap::new(),
            phase: RwLock::new(Phase::New),
        }
    }

    /// Create and load in one step.
    pub fn open(name: &str, options: StoreOptions) -> Result<Self> {
        let collection = Self::create(name, options);
        collection.load()?;
        Ok(collection)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Open the slot file, reconcile the header, scan every record into
    /// the value map, and start the write pipeline for the configured
    /// buffer mode.
    pub fn load(&self) -> Result<()> {
        let mut phase = self.phase.write();
        match &*phase {
            Phase::New => {}
            Phase::Open(_) => return Err(StoreError::CollectionAlreadyOpen),
            Phase::Closed => return Err(StoreError::CollectionClosed),
        }

        let o = &self.options;
        if !is_valid_database_name(&o.database_name) {
            return Err(StoreError::InvalidDatabaseName(o.database_name.clone()));
        }
        if o.memory_only {
            *phase = Phase::Open(Backend { store: None });
            return Ok(());
        }
        if o.encryption_enabled && o.encryption_password.is_empty() {
            return Err(StoreError::EncryptionConfigMissing);
        }

        if !o.read_only {
            if let Some(dir) = self.path.parent() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(!o.read_only)
            .create(!o.read_only)
            .open(&self.path)?;

        let (header, crypto) = if file.metadata()?.len() == 0 {
            // First open: synthesize the header.
            let (header, crypto) = if o.encryption_enabled {
                let salt = generate_salt();
                let ctx =
                    CryptoContext::derive(&o.encryption_password, &salt, o.encryption_algorithm);
                (
                    Header::new_encrypted(o.serializer, o.compression_enabled, salt, &ctx),
                    Some(ctx),
                )
            } else {
                (Header::new(o.serializer, o.compression_enabled), None)
            };
            if !o.read_only {
                header.write(&file)?;
                file.sync_data()?;
            }
            (header, crypto)
        } else {
            // Re-open: the header is authoritative for format settings.
            let header = Header::read(&file).map_err(|e| match e {
                HeaderError::UnsupportedVersion(v) => StoreError::UnsupportedVersion(v),
                HeaderError::UnknownSerializer(t) => StoreError::UnknownSerializer(t),
                HeaderError::Io(e) => StoreError::Storage(e),
            })?;
            if header.serializer != o.serializer {
                log::warn!(
                    "collection {:?}: configured serializer {} overridden by header {}",
                    self.name,
                    o.serializer.name(),
                    header.serializer.name()
                );
            }
            let crypto = if header.is_encrypted() {
                if o.encryption_password.is_empty() {
                    return Err(StoreError::EncryptionConfigMissing);
                }
                let ctx = CryptoContext::derive(
                    &o.encryption_password,
                    &header.salt,
                    o.encryption_algorithm,
                );
                ctx.verify(&header.salt, &header.checksum)?;
                Some(ctx)
            } else {
                None
            };
            (header, crypto)
        };

        let codec = Arc::new(PairCodec::new(
            header.serializer,
            header.is_compressed(),
            crypto,
        ));
        let engine = Arc::new(StorageEngine::new(
            file,
            header.to_bytes(),
            !o.buffered_writes,
            o.read_only,
        )?);

        let soft = o.deserialization_failure_behavior == FailureBehavior::ReturnFalse;
        let stats = engine.load(
            |bytes| codec.decode(bytes),
            |k, v| {
                self.map.insert(k, v);
            },
            soft,
        )?;

        let pipeline = match o.buffer_mode {
            BufferMode::Disabled => None,
            mode if o.read_only => {
                log::warn!("collection {:?}: {mode:?} ignored on read-only open", self.name);
                None
            }
            mode => Some(WritePipeline::start(
                mode,
                o.max_degree_of_parallelism,
                Arc::clone(&codec),
                Arc::clone(&engine),
            )),
        };

        log::info!(
            "collection {:?} loaded: {} live records, {} free slots",
            self.name,
            stats.live,
            stats.free
        );
        *phase = Phase::Open(Backend {
            store: Some(Persistent { codec, engine, pipeline }),
        });
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.options.read_only {
            return Err(StoreError::CollectionReadOnly);
        }
        Ok(())
    }

    // ── Writes ───────────────────────────────────────────────────────────

    /// Add a new key.  Duplicate handling follows
    /// `add_duplicate_key_behavior`.
    pub fn add(&self, key: K, value: V) -> Result<bool> {
        let phase = self.phase.read();
        let b = backend(&phase)?;
        self.ensure_writable()?;
        let op_key = key.clone();
        match self.map.entry(key) {
            Entry::Occupied(mut occupied) => match self.options.add_duplicate_key_behavior {
                DuplicateKeyBehavior::FailWithError => Err(StoreError::DuplicateKey),
                DuplicateKeyBehavior::ReturnFalse => Ok(false),
                DuplicateKeyBehavior::Upsert => {
                    match self.persist_update(b, &op_key, &value)? {
                        Persisted::Done => {
                            occupied.insert(value);
                            Ok(true)
                        }
                        Persisted::Swallowed => Ok(false),
                        Persisted::Broken => {
                            occupied.remove();
                            Ok(false)
                        }
                    }
                }
            },
            Entry::Vacant(vacant) => match self.persist_insert(b, &op_key, &value)? {
                Persisted::Done => {
                    vacant.insert(value);
                    Ok(true)
                }
                Persisted::Swallowed | Persisted::Broken => Ok(false),
            },
        }
    }

    /// Replace the value of an existing key.  Missing-key handling follows
    /// `update_key_not_found_behavior`.
    pub fn update(&self, key: K, value: V) -> Result<bool> {
        let phase = self.phase.read();
        let b = backend(&phase)?;
        self.ensure_writable()?;
        let op_key = key.clone();
        match self.map.entry(key) {
            Entry::Occupied(mut occupied) => match self.persist_update(b, &op_key, &value)? {
                Persisted::Done => {
                    occupied.insert(value);
                    Ok(true)
                }
                Persisted::Swallowed => Ok(false),
                Persisted::Broken => {
                    occupied.remove();
                    Ok(false)
                }
            },
            Entry::Vacant(_) => match self.options.update_key_not_found_behavior {
                KeyNotFoundBehavior::FailWithError => Err(StoreError::KeyNotFound),
                KeyNotFoundBehavior::ReturnFalse => Ok(false),
            },
        }
    }

    /// Insert or replace; always succeeds on a writable open collection.
    pub fn add_or_update(&self, key: K, value: V) -> Result<bool> {
        let phase = self.phase.read();
        let b = backend(&phase)?;
        self.ensure_writable()?;
        self.add_or_update_inner(b, key, value)
    }

    fn add_or_update_inner(&self, b: &Backend<K, V>, key: K, value: V) -> Result<bool> {
        let op_key = key.clone();
        match self.map.entry(key) {
            Entry::Occupied(mut occupied) => match self.persist_update(b, &op_key, &value)? {
                Persisted::Done => {
                    occupied.insert(value);
                    Ok(true)
                }
                Persisted::Swallowed => Ok(false),
                Persisted::Broken => {
                    occupied.remove();
                    Ok(false)
                }
            },
            Entry::Vacant(vacant) => match self.persist_insert(b, &op_key, &value)? {
                Persisted::Done => {
                    vacant.insert(value);
                    Ok(true)
                }
                Persisted::Swallowed | Persisted::Broken => Ok(false),
            },
        }
    }

    /// Remove a key, returning its value.  Missing-key handling follows
    /// `remove_key_not_found_behavior`.
    pub fn remove(&self, key: &K) -> Result<Option<V>> {
        let phase = self.phase.read();
        let b = backend(&phase)?;
        self.ensure_writable()?;
        match self.map.entry(key.clone()) {
            Entry::Occupied(occupied) => match &b.store {
                None => Ok(Some(occupied.remove())),
                Some(p) => match &p.pipeline {
                    Some(pipeline) => {
                        let value = occupied.remove();
                        pipeline.submit(WriteOp::Remove { key: key.clone() });
                        Ok(Some(value))
                    }
                    None => match p.engine.remove(key) {
                        Ok(_) => Ok(Some(occupied.remove())),
                        Err(e) => {
                            // The slot may be half-tombstoned; drop the key
                            // from the map to keep index and map aligned.
                            occupied.remove();
                            self.storage_policy(e)?;
                            Ok(None)
                        }
                    },
                },
            },
            Entry::Vacant(_) => match self.options.remove_key_not_found_behavior {
                KeyNotFoundBehavior::FailWithError => Err(StoreError::KeyNotFound),
                KeyNotFoundBehavior::ReturnFalse => Ok(None),
            },
        }
    }

    /// Add many pairs at once.  Duplicate handling follows
    /// `bulk_add_duplicate_key_behavior` and applies to the whole input:
    /// `FailWithError` and `ReturnFalse` abort before any state change;
    /// `Upsert` updates the duplicates one by one (best-effort, not a
    /// transaction) and bulk-appends the new keys.
    pub fn bulk_add<I>(&self, entries: I) -> Result<bool>
    where
        I: IntoIterator<Item = (K, V)>,
    {
        let phase = self.phase.read();
        let b = backend(&phase)?;
        self.ensure_writable()?;

        let mut fresh: Vec<(K, V)> = Vec::new();
        let mut dups: Vec<(K, V)> = Vec::new();
        let mut batch_keys: std::collections::HashSet<K> = std::collections::HashSet::new();
        for (key, value) in entries {
            if self.map.contains_key(&key) || !batch_keys.insert(key.clone()) {
                dups.push((key, value));
            } else {
                fresh.push((key, value));
            }
        }

        if !dups.is_empty() {
            match self.options.bulk_add_duplicate_key_behavior {
                DuplicateKeyBehavior::FailWithError => return Err(StoreError::DuplicateKey),
                DuplicateKeyBehavior::ReturnFalse => return Ok(false),
                DuplicateKeyBehavior::Upsert => {
                    for (key, value) in dups {
                        self.add_or_update_inner(b, key, value)?;
                    }
                }
            }
        }
        if fresh.is_empty() {
            return Ok(true);
        }

        match &b.store {
            None => {
                for (key, value) in fresh {
                    self.map.insert(key, value);
                }
            }
            Some(p) => match &p.pipeline {
                Some(pipeline) => {
                    for (key, value) in &fresh {
                        self.map.insert(key.clone(), value.clone());
                    }
                    pipeline.submit(WriteOp::Bulk { entries: fresh });
                }
                None => {
                    // Encode everything before touching any state so a
                    // serialization failure aborts with nothing written.
                    let mut encoded = Vec::with_capacity(fresh.len());
                    for (key, value) in &fresh {
                        match p.codec.encode(key, value) {
                            Ok(payload) => encoded.push((key.clone(), payload)),
                            Err(e) => {
                                return match self.options.serialization_failure_behavior {
                                    FailureBehavior::Raise => Err(e.into()),
                                    FailureBehavior::ReturnFalse => {
                                        log::warn!("bulk add aborted: {e}");
                                        Ok(false)
                                    }
                                }
                            }
                        }
                    }
                    match p.engine.bulk_append(encoded) {
                        Ok(()) => {}
                        Err(e) => {
                            self.storage_policy(e)?;
                            return Ok(false);
                        }
                    }
                    for (key, value) in fresh {
                        self.map.insert(key, value);
                    }
                }
            },
        }
        Ok(true)
    }

    /// Remove many keys; missing keys are skipped.  Returns the number
    /// actually removed.
    pub fn bulk_remove<I>(&self, keys: I) -> Result<usize>
    where
        I: IntoIterator<Item = K>,
    {
        let phase = self.phase.read();
        let b = backend(&phase)?;
        self.ensure_writable()?;
        let mut removed = 0;
        for key in keys {
            if let Entry::Occupied(occupied) = self.map.entry(key.clone()) {
                match &b.store {
                    None => {
                        occupied.remove();
                        removed += 1;
                    }
                    Some(p) => match &p.pipeline {
                        Some(pipeline) => {
                            occupied.remove();
                            pipeline.submit(WriteOp::Remove { key });
                            removed += 1;
                        }
                        None => {
                            occupied.remove();
                            if let Err(e) = p.engine.remove(&key) {
                                log::warn!("bulk remove: key dropped from map, slot not reclaimed: {e}");
                            }
                            removed += 1;
                        }
                    },
                }
            }
        }
        Ok(removed)
    }

    // ── Reads ────────────────────────────────────────────────────────────

    pub fn get(&self, key: &K) -> Result<Option<V>> {
        let phase = self.phase.read();
        backend(&phase)?;
        Ok(self.map.get(key).map(|r| r.value().clone()))
    }

    pub fn contains(&self, key: &K) -> Result<bool> {
        let phase = self.phase.read();
        backend(&phase)?;
        Ok(self.map.contains_key(key))
    }

    /// Snapshot of every (key, value) pair.
    pub fn entries(&self) -> Result<Vec<(K, V)>> {
        let phase = self.phase.read();
        backend(&phase)?;
        Ok(self
            .map
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect())
    }

    /// Snapshot of every value.
    pub fn values(&self) -> Result<Vec<V>> {
        let phase = self.phase.read();
        backend(&phase)?;
        Ok(self.map.iter().map(|r| r.value().clone()).collect())
    }

    pub fn len(&self) -> Result<usize> {
        let phase = self.phase.read();
        backend(&phase)?;
        Ok(self.map.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Current file size in bytes (header plus slot stream); zero for
    /// memory-only collections.
    pub fn size_bytes(&self) -> Result<u64> {
        let phase = self.phase.read();
        let b = backend(&phase)?;
        Ok(b.store.as_ref().map(|p| p.engine.size_bytes()).unwrap_or(0))
    }

    // ── Maintenance ──────────────────────────────────────────────────────

    /// Wait until every buffered operation has reached the file, then
    /// sync the file to the OS.
    pub fn flush(&self) -> Result<()> {
        let phase = self.phase.read();
        let b = backend(&phase)?;
        if let Some(p) = &b.store {
            match &p.pipeline {
                Some(pipeline) => pipeline.flush()?,
                None => p.engine.sync()?,
            }
        }
        Ok(())
    }

    /// Discard all records: cancel in-flight pipeline work, truncate the
    /// file to its header, clear the value map.
    pub fn clear(&self) -> Result<()> {
        let phase = self.phase.read();
        let b = backend(&phase)?;
        self.ensure_writable()?;
        if let Some(p) = &b.store {
            if let Some(pipeline) = &p.pipeline {
                pipeline.cancel_and_drain();
            }
            p.engine.clear()?;
        }
        self.map.clear();
        log::info!("collection {:?} cleared", self.name);
        Ok(())
    }

    /// Drain the pipeline, release the file handle, clear the map.  Every
    /// later operation fails with `CollectionClosed`.
    pub fn close(&self) -> Result<()> {
        let mut phase = self.phase.write();
        match std::mem::replace(&mut *phase, Phase::Closed) {
            Phase::New => Ok(()),
            Phase::Closed => Err(StoreError::CollectionClosed),
            Phase::Open(backend) => {
                let mut result = Ok(());
                if let Some(mut p) = backend.store {
                    if let Some(pipeline) = &mut p.pipeline {
                        result = pipeline.shutdown();
                    }
                    if result.is_ok() {
                        result = p.engine.sync();
                    }
                }
                self.map.clear();
                log::info!("collection {:?} closed", self.name);
                result
            }
        }
    }

    /// Close, then remove the collection file from disk.
    pub fn delete(&self) -> Result<()> {
        self.ensure_writable()?;
        self.close()?;
        if !self.options.memory_only && self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        log::info!("collection {:?} deleted", self.name);
        Ok(())
    }

    /// Explicit no-op: live records keep their slots.  Reclaimed space is
    /// reused by the free-slot allocator instead.
    pub fn defragment(&self) -> Result<()> {
        let phase = self.phase.read();
        backend(&phase)?;
        Ok(())
    }

    // ── Persistence helpers ──────────────────────────────────────────────

    fn persist_insert(&self, b: &Backend<K, V>, key: &K, value: &V) -> Result<Persisted> {
        let Some(p) = &b.store else {
            return Ok(Persisted::Done);
        };
        if let Some(pipeline) = &p.pipeline {
            pipeline.submit(WriteOp::Insert { key: key.clone(), value: value.clone() });
            return Ok(Persisted::Done);
        }
        let Some(payload) = self.encode_policy(p, key, value)? else {
            return Ok(Persisted::Swallowed);
        };
        match p.engine.insert(key.clone(), &payload) {
            Ok(()) => Ok(Persisted::Done),
            Err(e) => {
                self.storage_policy(e)?;
                Ok(Persisted::Swallowed)
            }
        }
    }

    fn persist_update(&self, b: &Backend<K, V>, key: &K, value: &V) -> Result<Persisted> {
        let Some(p) = &b.store else {
            return Ok(Persisted::Done);
        };
        if let Some(pipeline) = &p.pipeline {
            pipeline.submit(WriteOp::Update { key: key.clone(), value: value.clone() });
            return Ok(Persisted::Done);
        }
        let Some(payload) = self.encode_policy(p, key, value)? else {
            return Ok(Persisted::Swallowed);
        };
        match p.engine.update(key.clone(), &payload) {
            Ok(()) => Ok(Persisted::Done),
            Err(e) => {
                // The old slot may already be tombstoned; the key must
                // leave the value map so map and index stay aligned.
                self.storage_policy(e)?;
                Ok(Persisted::Broken)
            }
        }
    }

    /// Encode via the collection codec, routing failures per
    /// `serialization_failure_behavior`.  `None` means swallowed.
    fn encode_policy(
        &self,
        p: &Persistent<K, V>,
        key: &K,
        value: &V,
    ) -> Result<Option<Vec<u8>>> {
        match p.codec.encode(key, value) {
            Ok(payload) => Ok(Some(payload)),
            Err(e) => match self.options.serialization_failure_behavior {
                FailureBehavior::Raise => Err(e.into()),
                FailureBehavior::ReturnFalse => {
                    log::warn!("serialization failure swallowed: {e}");
                    Ok(None)
                }
            },
        }
    }

    /// Route an engine error per `storage_failure_behavior`.  Returns
    /// `Ok(())` when swallowed.
    fn storage_policy(&self, e: StoreError) -> Result<()> {
        match e {
            StoreError::Storage(_) => match self.options.storage_failure_behavior {
                FailureBehavior::Raise => Err(e),
                FailureBehavior::ReturnFalse => {
                    log::warn!("storage failure swallowed: {e}");
                    Ok(())
                }
            },
            other => Err(other),
        }
    }
}

enum Persisted {
    /// The write reached the engine or the pipeline.
    Done,
    /// A governed failure was swallowed; the map must stay unchanged.
    Swallowed,
    /// The on-disk record is gone; the key must leave the map too.
    Broken,
}

impl<K: Key, V: Value> Drop for Collection<K, V> {
    fn drop(&mut self) {
        // Best-effort close so buffered work reaches the file.
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Serializer;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Item {
        name: String,
    }

    fn item(name: &str) -> Item {
        Item { name: name.into() }
    }

    fn options(dir: &std::path::Path) -> StoreOptions {
        StoreOptions {
            base_directory: dir.to_string_lossy().into_owned(),
            database_name: "test db".into(),
            ..StoreOptions::default()
        }
    }

    #[test]
    fn not_loaded_then_already_open() {
        let dir = tempfile::tempdir().unwrap();
        let c: Collection<u32, Item> = Collection::create("items", options(dir.path()));
        assert!(matches!(c.get(&1), Err(StoreError::CollectionNotLoaded)));
        c.load().unwrap();
        assert!(matches!(c.load(), Err(StoreError::CollectionAlreadyOpen)));
    }

    #[test]
    fn closed_rejects_everything() {
        let dir = tempfile::tempdir().unwrap();
        let c: Collection<u32, Item> = Collection::open("items", options(dir.path())).unwrap();
        c.add(1, item("a")).unwrap();
        c.close().unwrap();
        assert!(matches!(c.get(&1), Err(StoreError::CollectionClosed)));
        assert!(matches!(c.add(2, item("b")), Err(StoreError::CollectionClosed)));
        assert!(matches!(c.len(), Err(StoreError::CollectionClosed)));
        assert!(matches!(c.close(), Err(StoreError::CollectionClosed)));
    }

    #[test]
    fn duplicate_key_policies() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = options(dir.path());
        opts.add_duplicate_key_behavior = DuplicateKeyBehavior::ReturnFalse;
        let c: Collection<u32, Item> = Collection::open("items", opts).unwrap();
        assert!(c.add(5, item("v1")).unwrap());
        assert!(!c.add(5, item("v2")).unwrap());
        assert_eq!(c.get(&5).unwrap(), Some(item("v1")));
        c.delete().unwrap();

        let mut opts = options(dir.path());
        opts.add_duplicate_key_behavior = DuplicateKeyBehavior::Upsert;
        let c: Collection<u32, Item> = Collection::open("items", opts).unwrap();
        assert!(c.add(5, item("v1")).unwrap());
        assert!(c.add(5, item("v3")).unwrap());
        assert_eq!(c.get(&5).unwrap(), Some(item("v3")));
    }

    #[test]
    fn update_and_remove_missing_key_policies() {
        let dir = tempfile::tempdir().unwrap();
        let c: Collection<u32, Item> = Collection::open("items", options(dir.path())).unwrap();
        assert!(matches!(c.update(9, item("x")), Err(StoreError::KeyNotFound)));
        assert!(matches!(c.remove(&9), Err(StoreError::KeyNotFound)));

        let mut opts = options(dir.path());
        opts.update_key_not_found_behavior = KeyNotFoundBehavior::ReturnFalse;
        opts.remove_key_not_found_behavior = KeyNotFoundBehavior::ReturnFalse;
        let c: Collection<u32, Item> = Collection::open("items2", opts).unwrap();
        assert!(!c.update(9, item("x")).unwrap());
        assert_eq!(c.remove(&9).unwrap(), None);
    }

    #[test]
    fn values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let c: Collection<u32, Item> =
                Collection::open("items", options(dir.path())).unwrap();
            c.add(1, item("A")).unwrap();
            c.add(2, item("B")).unwrap();
            c.close().unwrap();
        }
        let c: Collection<u32, Item> = Collection::open("items", options(dir.path())).unwrap();
        assert_eq!(c.len().unwrap(), 2);
        let mut entries = c.entries().unwrap();
        entries.sort_by_key(|(k, _)| *k);
        assert_eq!(entries, vec![(1, item("A")), (2, item("B"))]);
    }

    #[test]
    fn remove_returns_value_and_tombstones() {
        let dir = tempfile::tempdir().unwrap();
        {
            let c: Collection<u32, Item> =
                Collection::open("items", options(dir.path())).unwrap();
            c.add(1, item("gone")).unwrap();
            assert_eq!(c.remove(&1).unwrap(), Some(item("gone")));
            assert_eq!(c.len().unwrap(), 0);
            c.close().unwrap();
        }
        let c: Collection<u32, Item> = Collection::open("items", options(dir.path())).unwrap();
        assert_eq!(c.len().unwrap(), 0);
    }

    #[test]
    fn memory_only_never_touches_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = options(dir.path());
        opts.memory_only = true;
        let c: Collection<u32, Item> = Collection::open("items", opts).unwrap();
        c.add(1, item("ram")).unwrap();
        assert_eq!(c.size_bytes().unwrap(), 0);
        assert!(!dir.path().join("test db").exists());
    }

    #[test]
    fn read_only_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        {
            let c: Collection<u32, Item> =
                Collection::open("items", options(dir.path())).unwrap();
            c.add(1, item("a")).unwrap();
            c.close().unwrap();
        }
        let mut opts = options(dir.path());
        opts.read_only = true;
        let c: Collection<u32, Item> = Collection::open("items", opts).unwrap();
        assert_eq!(c.get(&1).unwrap(), Some(item("a")));
        assert!(matches!(c.add(2, item("b")), Err(StoreError::CollectionReadOnly)));
        assert!(matches!(c.clear(), Err(StoreError::CollectionReadOnly)));
        assert!(matches!(c.delete(), Err(StoreError::CollectionReadOnly)));
    }

    #[test]
    fn bulk_add_policies() {
        let dir = tempfile::tempdir().unwrap();
        let c: Collection<u32, Item> = Collection::open("items", options(dir.path())).unwrap();
        c.add(1, item("old")).unwrap();
        // Default FailWithError aborts before any state change.
        let err = c.bulk_add(vec![(1, item("dup")), (2, item("new"))]);
        assert!(matches!(err, Err(StoreError::DuplicateKey)));
        assert_eq!(c.len().unwrap(), 1);
        assert!(!c.contains(&2).unwrap());
        c.delete().unwrap();

        let mut opts = options(dir.path());
        opts.bulk_add_duplicate_key_behavior = DuplicateKeyBehavior::Upsert;
        let c: Collection<u32, Item> = Collection::open("items", opts).unwrap();
        c.add(1, item("old")).unwrap();
        assert!(c.bulk_add(vec![(1, item("merged")), (2, item("new"))]).unwrap());
        assert_eq!(c.get(&1).unwrap(), Some(item("merged")));
        assert_eq!(c.get(&2).unwrap(), Some(item("new")));
    }

    #[test]
    fn bulk_remove_skips_missing() {
        let dir = tempfile::tempdir().unwrap();
        let c: Collection<u32, Item> = Collection::open("items", options(dir.path())).unwrap();
        c.add(1, item("a")).unwrap();
        c.add(2, item("b")).unwrap();
        assert_eq!(c.bulk_remove(vec![1, 2, 3, 4]).unwrap(), 2);
        assert_eq!(c.len().unwrap(), 0);
    }

    #[test]
    fn clear_resets_file_and_map() {
        let dir = tempfile::tempdir().unwrap();
        let c: Collection<u32, Item> = Collection::open("items", options(dir.path())).unwrap();
        for i in 0..10 {
            c.add(i, item("x")).unwrap();
        }
        c.clear().unwrap();
        assert_eq!(c.len().unwrap(), 0);
        assert_eq!(c.size_bytes().unwrap(), crate::header::HEADER_SIZE as u64);
        // Usable after clear.
        c.add(1, item("again")).unwrap();
        assert_eq!(c.len().unwrap(), 1);
    }

    #[test]
    fn header_pins_serializer_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = options(dir.path());
        opts.serializer = Serializer::JsonUtf8;
        {
            let c: Collection<u32, Item> = Collection::open("items", opts).unwrap();
            c.add(1, item("json")).unwrap();
            c.close().unwrap();
        }
        // Re-open configured with a different serializer: header wins.
        let mut opts = options(dir.path());
        opts.serializer = Serializer::BinaryContractless;
        let c: Collection<u32, Item> = Collection::open("items", opts).unwrap();
        assert_eq!(c.get(&1).unwrap(), Some(item("json")));
    }

    #[test]
    fn defragment_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let c: Collection<u32, Item> = Collection::open("items", options(dir.path())).unwrap();
        c.add(1, item("a")).unwrap();
        let size = c.size_bytes().unwrap();
        c.defragment().unwrap();
        assert_eq!(c.size_bytes().unwrap(), size);
    }
}
