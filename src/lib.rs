//! # slotdb — embedded slot-file key-value document store
//!
//! One collection = one file = a fixed 36-byte header plus a stream of
//! framed slots (`state | length | payload`).  Guarantees (frozen in
//! format version 1):
//! - All numeric fields are little-endian; never negotiated
//! - Every record commits in two phases: `Pending` payload write, then a
//!   one-byte state patch to `Allocated` — a crash in between leaves a
//!   reclaimable `Pending` slot and never a half-visible record
//! - Removed slots are tombstoned and zero-filled, so the load scan can
//!   walk reclaimed space byte-wise without a side table
//! - The serializer tag and format flags in the header are authoritative
//!   on re-open; an encrypted file proves the password against a
//!   16-byte checksum before any payload is touched
//! - Reads are answered by an in-memory concurrent map with lock-free
//!   readers; file and index mutations serialize on one stream lock
//! - In the buffered write modes, the file applies operations in exact
//!   submission order, however many workers transformed them in parallel
//!
//! ```no_run
//! use slotdb::{Database, StoreOptions};
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Clone, Serialize, Deserialize)]
//! struct Player { name: String, level: u32 }
//!
//! let db = Database::open(StoreOptions {
//!     database_name: "game".into(),
//!     ..StoreOptions::default()
//! })?;
//! let players = db.collection::<u64, Player>("players")?;
//! players.add(1, Player { name: "Ada".into(), level: 3 })?;
//! assert!(players.contains(&1)?);
//! db.close()?;
//! # Ok::<(), slotdb::StoreError>(())
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::hash::Hash;

pub mod codec;
pub mod collection;
pub mod crypto;
pub mod database;
mod engine;
pub mod error;
pub mod header;
pub mod index;
pub mod options;
mod pipeline;
pub mod slot;

// Flat re-exports for the most common types.
pub use collection::Collection;
pub use database::Database;
pub use error::{Result, StoreError};
pub use header::{Header, FORMAT_VERSION, HEADER_SIZE};
pub use options::{
    BufferMode, DuplicateKeyBehavior, EncryptionAlgorithm, FailureBehavior,
    KeyNotFoundBehavior, Serializer, StoreOptions,
};
pub use slot::{SlotState, SLOT_OVERHEAD};

/// Bounds a collection key must satisfy: value semantics (equality,
/// ordering, hashing), serde, and thread mobility.
pub trait Key:
    Clone + Eq + Ord + Hash + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

impl<T> Key for T where
    T: Clone + Eq + Ord + Hash + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

/// Bounds a stored value must satisfy.
pub trait Value: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> Value for T where T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}
