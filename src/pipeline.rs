//! Buffered write path — FIFO hand-off from callers to the slot file.
//!
//! # Stages (`ParallelBuffered`)
//!
//! ```text
//! submit ──► serialization queue ──► dispatcher (assigns seq ids 1..)
//!                                        │
//!                             worker pool (MaxDegreeOfParallelism)
//!                             encode / compress / encrypt per entry
//!                                        │
//!                             reorder buffer (sparse, keyed by seq)
//!                                        │
//!                             sequencer (releases strictly in order)
//!                                        │
//!                             file-system queue ──► fs worker ──► engine
//! ```
//!
//! The file sees operations in exactly the order they entered the
//! serialization queue, however many workers transformed them in
//! parallel.  `Buffered` mode is the degenerate form: one fs worker
//! encodes and applies straight off the queue.
//!
//! # Drain gates
//! Each stage carries an in-flight counter; an operation increments the
//! next stage's gate before releasing its own, so a flush that waits on
//! the gates in stage order observes a fully drained pipeline.
//!
//! # Cancellation
//! One collection-wide flag.  When set, workers deposit no-ops (so the
//! sequence stays gapless), the fs worker discards instead of applying,
//! and a drain wait then returns the pipeline to idle before the flag is
//! reset.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use crate::codec::PairCodec;
use crate::engine::StorageEngine;
use crate::error::Result;
use crate::options::BufferMode;
use crate::{Key, Value};

// ── Operations ───────────────────────────────────────────────────────────────

/// An operation as submitted by the facade, value still unencoded.
pub(crate) enum WriteOp<K, V> {
    Insert { key: K, value: V },
    Update { key: K, value: V },
    Remove { key: K },
    Bulk { entries: Vec<(K, V)> },
}

/// A transformed operation carrying encode-pipeline output bytes.
pub(crate) enum Apply<K> {
    Insert { key: K, payload: Vec<u8> },
    Update { key: K, payload: Vec<u8> },
    Remove { key: K },
    Bulk { entries: Vec<(K, Vec<u8>)> },
    /// Placeholder for a cancelled or failed entry; keeps seq ids gapless.
    Nop,
}

enum FsTask<K, V> {
    /// Buffered mode: the fs worker encodes and applies.
    Raw(WriteOp<K, V>),
    /// Parallel mode: bytes were produced upstream.
    Ready(Apply<K>),
}

// ── Drain gate ───────────────────────────────────────────────────────────────

/// In-flight counter with a drain wait, one per stage.
#[derive(Default)]
struct Gate {
    count: Mutex<usize>,
    drained: Condvar,
}

impl Gate {
    fn enter(&self) {
        *self.count.lock() += 1;
    }

    fn leave(&self) {
        let mut count = self.count.lock();
        *count -= 1;
        if *count == 0 {
            self.drained.notify_all();
        }
    }

    fn wait_drained(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.drained.wait(&mut count);
        }
    }
}

#[derive(Default)]
struct StageGates {
    serialize: Gate,
    sequence: Gate,
    fs: Gate,
}

// ── Reorder buffer ───────────────────────────────────────────────────────────

/// Sparse buffer between the worker pool and the sequencer.
struct ReorderBuffer<K> {
    inner: Mutex<ReorderState<K>>,
    arrived: Condvar,
}

struct ReorderState<K> {
    slots: std::collections::BTreeMap<u64, Apply<K>>,
    closed: bool,
}

impl<K> ReorderBuffer<K> {
    fn new() -> Self {
        Self {
            inner: Mutex::new(ReorderState {
                slots: std::collections::BTreeMap::new(),
                closed: false,
            }),
            arrived: Condvar::new(),
        }
    }

    fn deposit(&self, seq: u64, entry: Apply<K>) {
        let mut state = self.inner.lock();
        state.slots.insert(seq, entry);
        self.arrived.notify_all();
    }

    /// Block until entry `seq` arrives; `None` once the pool has shut
    /// down and the entry can no longer appear.
    fn take(&self, seq: u64) -> Option<Apply<K>> {
        let mut state = self.inner.lock();
        loop {
            if let Some(entry) = state.slots.remove(&seq) {
                return Some(entry);
            }
            if state.closed {
                return None;
            }
            self.arrived.wait(&mut state);
        }
    }

    fn close(&self) {
        self.inner.lock().closed = true;
        self.arrived.notify_all();
    }
}

// ── Pipeline ─────────────────────────────────────────────────────────────────

pub(crate) struct WritePipeline<K: Key, V: Value> {
    mode: BufferMode,
    submit_tx: Option<Sender<WriteOp<K, V>>>,
    fs_tx: Option<Sender<FsTask<K, V>>>,
    gates: Arc<StageGates>,
    cancel: Arc<AtomicBool>,
    engine: Arc<StorageEngine<K>>,
    handles: Vec<JoinHandle<()>>,
}

impl<K: Key, V: Value> WritePipeline<K, V> {
    /// Spawn the stage threads for `mode` (`Disabled` is rejected by the
    /// facade before it gets here).
    pub fn start(
        mode: BufferMode,
        workers: usize,
        codec: Arc<PairCodec<K, V>>,
        engine: Arc<StorageEngine<K>>,
    ) -> Self {
        let gates = Arc::new(StageGates::default());
        let cancel = Arc::new(AtomicBool::new(false));
        let (fs_tx, fs_rx) = unbounded::<FsTask<K, V>>();
        let mut handles = Vec::new();

        // File-system worker — the only thread that touches the engine.
        {
            let engine = Arc::clone(&engine);
            let codec = Arc::clone(&codec);
            let gates = Arc::clone(&gates);
            let cancel = Arc::clone(&cancel);
            handles.push(std::thread::spawn(move || {
                fs_worker(fs_rx, engine, codec, gates, cancel)
            }));
        }

        let submit_tx = match mode {
            BufferMode::ParallelBuffered => {
                let (submit_tx, submit_rx) = unbounded::<WriteOp<K, V>>();
                let (transform_tx, transform_rx) = unbounded::<(u64, WriteOp<K, V>)>();
                let reorder = Arc::new(ReorderBuffer::new());
                let live_workers = Arc::new(AtomicUsize::new(workers.max(1)));

                // Dispatcher: one reader of the serialization queue,
                // stamping each operation with its sequence id.
                handles.push(std::thread::spawn(move || {
                    let mut seq = 0u64;
                    for op in submit_rx.iter() {
                        seq += 1;
                        if transform_tx.send((seq, op)).is_err() {
                            break;
                        }
                    }
                }));

                // Bounded transformation pool.
                for _ in 0..workers.max(1) {
                    let rx = transform_rx.clone();
                    let codec = Arc::clone(&codec);
                    let reorder = Arc::clone(&reorder);
                    let gates = Arc::clone(&gates);
                    let cancel = Arc::clone(&cancel);
                    let live = Arc::clone(&live_workers);
                    handles.push(std::thread::spawn(move || {
                        transform_worker(rx, codec, &reorder, &gates, &cancel);
                        if live.fetch_sub(1, Ordering::AcqRel) == 1 {
                            reorder.close();
                        }
                    }));
                }
                drop(transform_rx);

                // Sequencer: restores submission order.
                {
                    let fs_tx = fs_tx.clone();
                    let gates = Arc::clone(&gates);
                    handles.push(std::thread::spawn(move || {
                        sequencer(reorder, fs_tx, gates)
                    }));
                }

                Some(submit_tx)
            }
            _ => None,
        };

        Self {
            mode,
            submit_tx,
            fs_tx: Some(fs_tx),
            gates,
            cancel,
            engine,
            handles,
        }
    }

    /// Enqueue one operation.  Never blocks on I/O; the queues are
    /// unbounded.
    pub fn submit(&self, op: WriteOp<K, V>) {
        match self.mode {
            BufferMode::ParallelBuffered => {
                self.gates.serialize.enter();
                if let Some(tx) = &self.submit_tx {
                    if tx.send(op).is_err() {
                        self.gates.serialize.leave();
                    }
                }
            }
            _ => {
                self.gates.fs.enter();
                if let Some(tx) = &self.fs_tx {
                    if tx.send(FsTask::Raw(op)).is_err() {
                        self.gates.fs.leave();
                    }
                }
            }
        }
    }

    /// Wait for every stage to drain, in stage order, then sync the file.
    pub fn flush(&self) -> Result<()> {
        self.gates.serialize.wait_drained();
        self.gates.sequence.wait_drained();
        self.gates.fs.wait_drained();
        self.engine.sync()
    }

    /// Discard everything in flight: assert the cancel flag, wait for the
    /// stages to observe it and drain, then reset.  The stage threads
    /// stay up.
    pub fn cancel_and_drain(&self) {
        self.cancel.store(true, Ordering::SeqCst);
        self.gates.serialize.wait_drained();
        self.gates.sequence.wait_drained();
        self.gates.fs.wait_drained();
        self.cancel.store(false, Ordering::SeqCst);
    }

    /// Drain pending work, then stop and join every stage thread.
    pub fn shutdown(&mut self) -> Result<()> {
        let flushed = self.flush();
        self.submit_tx.take();
        self.fs_tx.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        flushed
    }
}

impl<K: Key, V: Value> Drop for WritePipeline<K, V> {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            let _ = self.shutdown();
        }
    }
}

// ── Stage bodies ─────────────────────────────────────────────────────────────

fn transform_worker<K: Key, V: Value>(
    rx: Receiver<(u64, WriteOp<K, V>)>,
    codec: Arc<PairCodec<K, V>>,
    reorder: &ReorderBuffer<K>,
    gates: &StageGates,
    cancel: &AtomicBool,
) {
    for (seq, op) in rx.iter() {
        let entry = if cancel.load(Ordering::SeqCst) {
            Apply::Nop
        } else {
            encode_op(&codec, op)
        };
        // Enter the sequencer stage before leaving this one so a flush
        // walking the gates in order never slips between stages.
        gates.sequence.enter();
        reorder.deposit(seq, entry);
        gates.serialize.leave();
    }
}

/// Run the codec for one operation.  Removals carry no value and pass
/// through untransformed; a failed encode is logged and degraded to a
/// no-op (the submitting call returned long ago).
fn encode_op<K: Key, V: Value>(codec: &PairCodec<K, V>, op: WriteOp<K, V>) -> Apply<K> {
    match op {
        WriteOp::Insert { key, value } => match codec.encode(&key, &value) {
            Ok(payload) => Apply::Insert { key, payload },
            Err(e) => {
                log::error!("dropping buffered insert: {e}");
                Apply::Nop
            }
        },
        WriteOp::Update { key, value } => match codec.encode(&key, &value) {
            Ok(payload) => Apply::Update { key, payload },
            Err(e) => {
                log::error!("dropping buffered update: {e}");
                Apply::Nop
            }
        },
        WriteOp::Remove { key } => Apply::Remove { key },
        WriteOp::Bulk { entries } => {
            let mut encoded = Vec::with_capacity(entries.len());
            for (key, value) in entries {
                match codec.encode(&key, &value) {
                    Ok(payload) => encoded.push((key, payload)),
                    Err(e) => log::error!("dropping entry of buffered bulk add: {e}"),
                }
            }
            Apply::Bulk { entries: encoded }
        }
    }
}

fn sequencer<K: Key, V: Value>(
    reorder: Arc<ReorderBuffer<K>>,
    fs_tx: Sender<FsTask<K, V>>,
    gates: Arc<StageGates>,
) {
    let mut next = 1u64;
    while let Some(entry) = reorder.take(next) {
        next += 1;
        match entry {
            Apply::Nop => gates.sequence.leave(),
            entry => {
                gates.fs.enter();
                gates.sequence.leave();
                if fs_tx.send(FsTask::Ready(entry)).is_err() {
                    gates.fs.leave();
                    break;
                }
            }
        }
    }
}

fn fs_worker<K: Key, V: Value>(
    rx: Receiver<FsTask<K, V>>,
    engine: Arc<StorageEngine<K>>,
    codec: Arc<PairCodec<K, V>>,
    gates: Arc<StageGates>,
    cancel: Arc<AtomicBool>,
) {
    for task in rx.iter() {
        if !cancel.load(Ordering::SeqCst) {
            let apply = match task {
                FsTask::Raw(op) => encode_op(&codec, op),
                FsTask::Ready(apply) => apply,
            };
            if let Err(e) = apply_to_engine(&engine, apply) {
                log::error!("buffered write failed: {e}");
            }
        }
        gates.fs.leave();
    }
}

fn apply_to_engine<K: Key>(
    engine: &StorageEngine<K>,
    apply: Apply<K>,
) -> Result<()> {
    match apply {
        Apply::Insert { key, payload } => engine.insert(key, &payload),
        Apply::Update { key, payload } => engine.update(key, &payload),
        Apply::Remove { key } => engine.remove(&key).map(|_| ()),
        Apply::Bulk { entries } => engine.bulk_append(entries),
        Apply::Nop => Ok(()),
    }
}
