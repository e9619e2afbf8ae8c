//! Record engine — synchronous slot-file mutations under one stream lock.
//!
//! A single mutex serializes every file write and every index mutation.
//! Value reads never come here; the facade's concurrent map answers them.
//!
//! # Two-phase commit
//! Each record is written as `Pending | length | payload`, then the state
//! byte alone is patched to `Allocated`.  A failure (or process crash)
//! between the two writes leaves a `Pending` slot that the next load scan
//! reclaims as free — no partially-visible record is ever indexed.
//!
//! # Slot reuse
//! New records take the smallest free slot that fits, falling back to the
//! tail.  Removal patches the state to `Deleted` and zeroes the slot's
//! payload extent, which keeps the byte-stepping scanner sound across
//! in-place shrinks: reclaimed space reads as a run of `Unallocated`
//! zeros between frames.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};

use byteorder::{LittleEndian, ReadBytesExt};
use parking_lot::Mutex;

use crate::codec::CodecError;
use crate::error::{Result, StoreError};
use crate::header::HEADER_SIZE;
use crate::index::{AllocatedIndex, FreeIndex};
use crate::slot::{frame, SlotRef, SlotState, SLOT_OVERHEAD};

/// Load-scan summary, logged by the facade on open.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoadStats {
    /// Allocated records decoded and indexed.
    pub live: usize,
    /// Free slots registered (tombstones plus reclaimed pending slots).
    pub free: usize,
    /// Pending slots reclaimed to `Deleted` during this scan.
    pub reclaimed: usize,
    /// Allocated records skipped by a soft deserialization failure.
    pub skipped: usize,
}

struct EngineInner<K> {
    file: File,
    alloc: AllocatedIndex<K>,
    free: FreeIndex,
    /// End of the slot stream; the file never holds frames past this.
    tail: u64,
}

pub(crate) struct StorageEngine<K> {
    inner: Mutex<EngineInner<K>>,
    header_bytes: [u8; HEADER_SIZE],
    /// Data-sync between the payload write and the state patch.  Elided
    /// when buffered writes are configured; the state-byte protocol keeps
    /// process-crash safety either way.
    sync_writes: bool,
    read_only: bool,
}

impl<K: Ord + Clone + Send + 'static> StorageEngine<K> {
    pub fn new(
        file: File,
        header_bytes: [u8; HEADER_SIZE],
        sync_writes: bool,
        read_only: bool,
    ) -> Result<Self> {
        let tail = file.metadata()?.len().max(HEADER_SIZE as u64);
        Ok(Self {
            inner: Mutex::new(EngineInner {
                file,
                alloc: AllocatedIndex::new(),
                free: FreeIndex::new(),
                tail,
            }),
            header_bytes,
            sync_writes,
            read_only,
        })
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(StoreError::CollectionReadOnly);
        }
        Ok(())
    }

    /// Two-phase add of a new key.  The caller guarantees the key is not
    /// currently allocated.
    pub fn insert(&self, key: K, payload: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        let mut guard = self.inner.lock();
        self.insert_locked(&mut guard, key, payload)
    }

    /// Remove + add under a single lock acquisition.  Falls through to a
    /// plain insert when the key has no current slot.
    pub fn update(&self, key: K, payload: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        let mut guard = self.inner.lock();
        self.remove_locked(&mut guard, &key)?;
        self.insert_locked(&mut guard, key, payload)
    }

    /// Tombstone a record.  Returns false when the key has no slot.
    pub fn remove(&self, key: &K) -> Result<bool> {
        self.ensure_writable()?;
        let mut guard = self.inner.lock();
        Ok(self.remove_locked(&mut guard, key)?.is_some())
    }

    /// Ordered tail append of pre-encoded pairs; no free-slot reuse.
    /// The caller guarantees the keys are distinct and not allocated.
    pub fn bulk_append(&self, entries: Vec<(K, Vec<u8>)>) -> Result<()> {
        self.ensure_writable()?;
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        for (key, payload) in entries {
            let slot = SlotRef {
                offset: inner.tail,
                total_len: SLOT_OVERHEAD + payload.len() as u32,
            };
            if let Err(e) = write_record(&inner.file, slot, &payload) {
                let _ = inner.file.set_len(inner.tail);
                return Err(e.into());
            }
            inner.tail = slot.end();
            inner.alloc.insert(key, slot);
        }
        if self.sync_writes {
            inner.file.sync_data()?;
        }
        Ok(())
    }

    fn insert_locked(&self, guard: &mut EngineInner<K>, key: K, payload: &[u8]) -> Result<()> {
        let needed = SLOT_OVERHEAD + payload.len() as u32;
        let (slot, appended) = match guard.free.take(needed) {
            Some(slot) => (slot, false),
            None => (SlotRef { offset: guard.tail, total_len: needed }, true),
        };

        let committed = self.commit_record(&guard.file, slot, payload);
        if let Err(e) = committed {
            // A failed tail append may have grown the file with a partial
            // frame; cut it back so the stream stays scannable.  A failed
            // reuse leaves a Pending slot for the next load to reclaim.
            if appended {
                let _ = guard.file.set_len(guard.tail);
            }
            return Err(e.into());
        }

        if appended {
            guard.tail = slot.end();
        }
        guard.alloc.insert(key, slot);
        Ok(())
    }

    /// Phase 1 (`Pending` frame + payload), optional data sync, phase 2
    /// (state patch to `Allocated`), optional data sync.
    fn commit_record(&self, file: &File, slot: SlotRef, payload: &[u8]) -> io::Result<()> {
        write_record_pending(file, slot, payload)?;
        if self.sync_writes {
            file.sync_data()?;
        }
        write_at(file, slot.offset, &[SlotState::Allocated as u8])?;
        if self.sync_writes {
            file.sync_data()?;
        }
        Ok(())
    }

    fn remove_locked(
        &self,
        guard: &mut EngineInner<K>,
        key: &K,
    ) -> io::Result<Option<SlotRef>> {
        let Some(slot) = guard.alloc.remove(key) else {
            return Ok(None);
        };
        write_at(&guard.file, slot.offset, &[SlotState::Deleted as u8])?;
        if self.sync_writes {
            guard.file.sync_data()?;
        }
        // Zero the whole payload extent (record bytes plus any shrink
        // remainder) in one write so the scanner can walk it byte-wise.
        let zeros = vec![0u8; slot.payload_capacity() as usize];
        write_at(&guard.file, slot.payload_offset(), &zeros)?;
        if self.sync_writes {
            guard.file.sync_data()?;
        }
        guard.free.insert(slot);
        Ok(Some(slot))
    }

    /// Forward scan from the header to end-of-file, per the reader
    /// invariant: a zero byte is filler (advance one), anything else is a
    /// frame.  Allocated payloads are decoded into `sink`; Deleted and
    /// Pending slots become free entries, and Pending payloads are zeroed
    /// on writable opens so every free slot stays zero-filled on disk.
    pub fn load<V>(
        &self,
        decode: impl Fn(&[u8]) -> std::result::Result<(K, V), CodecError>,
        mut sink: impl FnMut(K, V),
        soft_deserialization: bool,
    ) -> Result<LoadStats> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let end = inner.file.metadata()?.len();
        inner.tail = end.max(HEADER_SIZE as u64);

        let mut stats = LoadStats::default();
        let mut pending_reclaim: Vec<SlotRef> = Vec::new();
        let mut truncated_at: Option<u64> = None;

        {
            let mut rdr = BufReader::new(&inner.file);
            rdr.seek(SeekFrom::Start(HEADER_SIZE as u64))?;
            let mut pos = HEADER_SIZE as u64;

            while pos < end {
                let state = rdr.read_u8()?;
                pos += 1;
                match SlotState::from_u8(state) {
                    Some(SlotState::Unallocated) => continue,
                    None => {
                        log::warn!("unknown state byte {state:#04x} at offset {}", pos - 1);
                        continue;
                    }
                    Some(state) => {
                        let slot_offset = pos - 1;
                        if pos + 4 > end {
                            truncated_at = Some(slot_offset);
                            break;
                        }
                        let payload_len = rdr.read_u32::<LittleEndian>()?;
                        pos += 4;
                        if pos + payload_len as u64 > end {
                            truncated_at = Some(slot_offset);
                            break;
                        }
                        let slot = SlotRef {
                            offset: slot_offset,
                            total_len: SLOT_OVERHEAD + payload_len,
                        };

                        match state {
                            SlotState::Allocated => {
                                let mut payload = vec![0u8; payload_len as usize];
                                rdr.read_exact(&mut payload)?;
                                pos += payload_len as u64;
                                match decode(&payload) {
                                    Ok((key, value)) => {
                                        inner.alloc.insert(key.clone(), slot);
                                        sink(key, value);
                                        stats.live += 1;
                                    }
                                    Err(e) if soft_deserialization => {
                                        log::warn!(
                                            "skipping undecodable record at offset {}: {e}",
                                            slot.offset
                                        );
                                        stats.skipped += 1;
                                    }
                                    Err(e) => return Err(e.into()),
                                }
                            }
                            SlotState::Deleted | SlotState::Pending => {
                                rdr.seek_relative(payload_len as i64)?;
                                pos += payload_len as u64;
                                inner.free.insert(slot);
                                stats.free += 1;
                                if state == SlotState::Pending {
                                    pending_reclaim.push(slot);
                                }
                            }
                            SlotState::Unallocated => unreachable!(),
                        }
                    }
                }
            }
        }

        // An interrupted tail append leaves a frame with no (or partial)
        // payload; cut the stream back to the last sound frame.
        if let Some(at) = truncated_at {
            log::warn!("truncated slot at offset {at}; trimming stream tail");
            if !self.read_only {
                inner.file.set_len(at)?;
            }
            inner.tail = at;
        }

        if !self.read_only && !pending_reclaim.is_empty() {
            for slot in &pending_reclaim {
                write_at(&inner.file, slot.offset, &[SlotState::Deleted as u8])?;
                let zeros = vec![0u8; slot.payload_capacity() as usize];
                write_at(&inner.file, slot.payload_offset(), &zeros)?;
            }
            stats.reclaimed = pending_reclaim.len();
        }

        log::info!(
            "load scan: {} live, {} free, {} reclaimed, {} skipped",
            stats.live,
            stats.free,
            stats.reclaimed,
            stats.skipped
        );
        Ok(stats)
    }

    /// Truncate to an empty collection: header only, empty indices.
    pub fn clear(&self) -> Result<()> {
        self.ensure_writable()?;
        let mut guard = self.inner.lock();
        guard.file.set_len(0)?;
        write_at(&guard.file, 0, &self.header_bytes)?;
        guard.file.sync_data()?;
        guard.alloc.clear();
        guard.free.clear();
        guard.tail = HEADER_SIZE as u64;
        Ok(())
    }

    /// Push written data to the OS.  No-op on read-only opens.
    pub fn sync(&self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        let guard = self.inner.lock();
        guard.file.sync_data()?;
        Ok(())
    }

    /// Current end of the slot stream (header included).
    pub fn size_bytes(&self) -> u64 {
        self.inner.lock().tail
    }

    /// Reclaimable bytes currently tracked by the free index.
    pub fn reclaimable_bytes(&self) -> u64 {
        self.inner.lock().free.reclaimable_bytes()
    }
}

fn write_at(file: &File, pos: u64, bytes: &[u8]) -> io::Result<()> {
    let mut f = file;
    f.seek(SeekFrom::Start(pos))?;
    f.write_all(bytes)
}

/// One contiguous write of `Pending | length | payload`.
fn write_record_pending(file: &File, slot: SlotRef, payload: &[u8]) -> io::Result<()> {
    let mut buf = Vec::with_capacity(SLOT_OVERHEAD as usize + payload.len());
    buf.extend_from_slice(&frame(SlotState::Pending, payload.len() as u32));
    buf.extend_from_slice(payload);
    write_at(file, slot.offset, &buf)
}

/// Pending frame + payload followed by the state patch, no syncs — the
/// bulk path batches its single optional sync at the end.
fn write_record(file: &File, slot: SlotRef, payload: &[u8]) -> io::Result<()> {
    write_record_pending(file, slot, payload)?;
    write_at(file, slot.offset, &[SlotState::Allocated as u8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PairCodec;
    use crate::header::Header;
    use crate::options::Serializer;
    use std::fs::OpenOptions;
    use std::path::Path;

    fn codec() -> PairCodec<u32, String> {
        PairCodec::new(Serializer::BinaryContractless, false, None)
    }

    fn open_engine(path: &Path) -> StorageEngine<u32> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .unwrap();
        let header = Header::new(Serializer::BinaryContractless, false);
        if file.metadata().unwrap().len() == 0 {
            header.write(&file).unwrap();
        }
        StorageEngine::new(file, header.to_bytes(), false, false).unwrap()
    }

    fn reload(path: &Path) -> (StorageEngine<u32>, Vec<(u32, String)>) {
        let engine = open_engine(path);
        let codec = codec();
        let mut seen = Vec::new();
        engine
            .load(|b| codec.decode(b), |k, v| seen.push((k, v)), false)
            .unwrap();
        seen.sort();
        (engine, seen)
    }

    #[test]
    fn insert_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.sdb");
        let engine = open_engine(&path);
        let codec = codec();
        engine.insert(1, &codec.encode(&1, &"one".to_string()).unwrap()).unwrap();
        engine.insert(2, &codec.encode(&2, &"two".to_string()).unwrap()).unwrap();
        drop(engine);

        let (_, seen) = reload(&path);
        assert_eq!(seen, vec![(1, "one".into()), (2, "two".into())]);
    }

    #[test]
    fn remove_zeroes_and_frees() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.sdb");
        let engine = open_engine(&path);
        let codec = codec();
        engine.insert(1, &codec.encode(&1, &"x".to_string()).unwrap()).unwrap();
        let peak = engine.size_bytes();
        assert!(engine.remove(&1).unwrap());
        assert!(!engine.remove(&1).unwrap());
        assert_eq!(engine.size_bytes(), peak); // removal never grows the file
        drop(engine);

        let (engine, seen) = reload(&path);
        assert!(seen.is_empty());
        assert!(engine.reclaimable_bytes() > 0);
    }

    #[test]
    fn freed_slot_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.sdb");
        let engine = open_engine(&path);
        let codec = codec();
        engine.insert(1, &codec.encode(&1, &"aaaa".to_string()).unwrap()).unwrap();
        let peak = engine.size_bytes();
        engine.remove(&1).unwrap();
        engine.insert(2, &codec.encode(&2, &"bbbb".to_string()).unwrap()).unwrap();
        assert_eq!(engine.size_bytes(), peak);
    }

    #[test]
    fn update_relocates_or_reuses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.sdb");
        let engine = open_engine(&path);
        let codec = codec();
        engine.insert(1, &codec.encode(&1, &"short".to_string()).unwrap()).unwrap();
        engine.update(1, &codec.encode(&1, &"tiny".to_string()).unwrap()).unwrap();
        drop(engine);

        let (_, seen) = reload(&path);
        assert_eq!(seen, vec![(1, "tiny".into())]);
    }

    #[test]
    fn pending_slot_is_reclaimed_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.sdb");
        let engine = open_engine(&path);
        let codec = codec();
        engine.insert(42, &codec.encode(&42, &"ghost".to_string()).unwrap()).unwrap();
        drop(engine);

        // Flip the committed state byte back to Pending, simulating a
        // crash between the payload write and the state patch.
        let file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        write_at(&file, HEADER_SIZE as u64, &[SlotState::Pending as u8]).unwrap();
        drop(file);

        let (engine, seen) = reload(&path);
        assert!(seen.is_empty());
        assert!(engine.reclaimable_bytes() > 0);

        // The reclaimed extent is reused by the next insert of equal size.
        let peak = engine.size_bytes();
        engine.insert(42, &codec.encode(&42, &"ghost".to_string()).unwrap()).unwrap();
        assert_eq!(engine.size_bytes(), peak);
    }

    #[test]
    fn bulk_append_is_ordered_and_indexed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.sdb");
        let engine = open_engine(&path);
        let codec = codec();
        let entries: Vec<(u32, Vec<u8>)> = (0..50u32)
            .map(|i| (i, codec.encode(&i, &format!("v{i}")).unwrap()))
            .collect();
        engine.bulk_append(entries).unwrap();
        drop(engine);

        let (_, seen) = reload(&path);
        assert_eq!(seen.len(), 50);
        assert_eq!(seen[7], (7, "v7".into()));
    }

    #[test]
    fn clear_truncates_to_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.sdb");
        let engine = open_engine(&path);
        let codec = codec();
        engine.insert(1, &codec.encode(&1, &"x".to_string()).unwrap()).unwrap();
        engine.clear().unwrap();
        assert_eq!(engine.size_bytes(), HEADER_SIZE as u64);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), HEADER_SIZE as u64);
        drop(engine);

        let (_, seen) = reload(&path);
        assert!(seen.is_empty());
    }

    #[test]
    fn read_only_engine_rejects_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.sdb");
        open_engine(&path); // creates header
        let file = OpenOptions::new().read(true).open(&path).unwrap();
        let header = Header::new(Serializer::BinaryContractless, false);
        let engine: StorageEngine<u32> =
            StorageEngine::new(file, header.to_bytes(), false, true).unwrap();
        assert!(matches!(
            engine.insert(1, b"x"),
            Err(StoreError::CollectionReadOnly)
        ));
    }
}
