//! Store-level error taxonomy.
//!
//! Module-level sources ([`CodecError`](crate::codec::CodecError),
//! [`CryptoError`](crate::crypto::CryptoError)) are folded into
//! [`StoreError`] at the facade boundary.  Whether a given class surfaces
//! or is swallowed into a `false`/`None` return is governed by the
//! behavior enums in [`options`](crate::options); classes without a
//! governing option always surface.

use std::io;
use thiserror::Error;

use crate::codec::CodecError;
use crate::crypto::CryptoError;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    // ── Data-level ───────────────────────────────────────────────────────
    #[error("Duplicate key")]
    DuplicateKey,
    #[error("Key not found")]
    KeyNotFound,

    // ── Lifecycle ────────────────────────────────────────────────────────
    #[error("Collection is closed")]
    CollectionClosed,
    #[error("Collection is read-only")]
    CollectionReadOnly,
    #[error("Collection is already open")]
    CollectionAlreadyOpen,
    #[error("Collection has not been loaded")]
    CollectionNotLoaded,
    #[error("Collection {0:?} is already open with different key/value types")]
    CollectionTypeMismatch(String),
    #[error("Database is closed")]
    DatabaseClosed,
    #[error("Database is read-only")]
    DatabaseReadOnly,
    /// Database names are restricted to `[A-Za-z0-9_ ]` and must be
    /// non-empty; they become directory names on disk.
    #[error("Invalid database name {0:?}")]
    InvalidDatabaseName(String),

    // ── Format ───────────────────────────────────────────────────────────
    #[error("Unsupported collection file version {0}")]
    UnsupportedVersion(u16),
    #[error("Unknown serializer tag {0}")]
    UnknownSerializer(u8),

    // ── Codec / crypto ───────────────────────────────────────────────────
    #[error("Serialization failed: {0}")]
    Serialization(String),
    #[error("Deserialization failed: {0}")]
    Deserialization(String),
    #[error("Decryption failed — wrong password or corrupted data")]
    Decryption,
    #[error("Encryption is enabled but no password was supplied")]
    EncryptionConfigMissing,

    // ── Storage ──────────────────────────────────────────────────────────
    #[error("Storage error: {0}")]
    Storage(#[from] io::Error),
}

impl From<CodecError> for StoreError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Serialization(msg) => StoreError::Serialization(msg),
            CodecError::Deserialization(msg) => StoreError::Deserialization(msg),
            CodecError::Crypto(_) => StoreError::Decryption,
        }
    }
}

impl From<CryptoError> for StoreError {
    fn from(_: CryptoError) -> Self {
        StoreError::Decryption
    }
}

impl StoreError {
    /// True for the classes a `ReturnFalse` behavior may swallow.
    /// Everything else always surfaces.
    pub fn is_governed(&self) -> bool {
        matches!(
            self,
            StoreError::DuplicateKey
                | StoreError::KeyNotFound
                | StoreError::Serialization(_)
                | StoreError::Deserialization(_)
                | StoreError::Storage(_)
        )
    }
}
