//! Store configuration — file placement, format, write path, and the
//! behavior enums that govern boundary error classes.
//!
//! One [`StoreOptions`] value configures both the database facade and every
//! collection opened through it.  Format-affecting fields (serializer,
//! encryption, compression) are pinned into the collection file header on
//! first open; on re-open the header is authoritative and mismatched
//! options are reconciled from it.

use std::sync::Arc;

/// How a (key,value) pair is framed into payload bytes.
///
/// The tag is written into byte 2 of the file header and must match on
/// re-open (the header wins).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Serializer {
    /// Binary pair, varint-packed integers.  Default.
    BinaryContractless,
    /// Binary pair, fixed-width integers — stable layout across versions
    /// of the stored types at the cost of larger payloads.
    BinaryContract,
    /// UTF-8 JSON object `{k, v}`.  Never compressed.
    JsonUtf8,
}

impl Serializer {
    pub fn tag(self) -> u8 {
        match self {
            Serializer::BinaryContractless => 0,
            Serializer::BinaryContract => 1,
            Serializer::JsonUtf8 => 2,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Serializer::BinaryContractless),
            1 => Some(Serializer::BinaryContract),
            2 => Some(Serializer::JsonUtf8),
            _ => None,
        }
    }

    /// Compression is applied inside the binary framings only.
    pub fn is_binary(self) -> bool {
        !matches!(self, Serializer::JsonUtf8)
    }

    pub fn name(self) -> &'static str {
        match self {
            Serializer::BinaryContractless => "binary-contractless",
            Serializer::BinaryContract => "binary-contract",
            Serializer::JsonUtf8 => "json-utf8",
        }
    }
}

/// Which write path feeds the collection file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferMode {
    /// Every operation calls the record engine synchronously.
    Disabled,
    /// Operations are queued; a single worker drains them in FIFO order.
    Buffered,
    /// Serialization/compression/encryption run on a bounded worker pool;
    /// a sequencer restores submission order before the file worker.
    ParallelBuffered,
}

/// PBKDF2 hash used for key/IV derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionAlgorithm {
    Sha1,
    Sha256,
    Sha512,
}

/// Policy when `add` (or `bulk_add`) meets a key that already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateKeyBehavior {
    FailWithError,
    /// Treat the add as an update.  For `bulk_add` this is a documented
    /// best-effort merge, not a transaction.
    Upsert,
    ReturnFalse,
}

/// Policy when `update` or `remove` meets a missing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyNotFoundBehavior {
    FailWithError,
    ReturnFalse,
}

/// Policy for storage / serialization / deserialization failures on the
/// synchronous path.  `ReturnFalse` swallows the error into a boolean
/// return; load-time deserialization soft-failures skip the record and
/// continue the scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureBehavior {
    Raise,
    ReturnFalse,
}

/// Maps a value-type name to a default collection file-name stem.
pub type FileNameFn = Arc<dyn Fn(&str) -> String + Send + Sync>;

#[derive(Clone)]
pub struct StoreOptions {
    /// Directory that holds one subdirectory per database.
    pub base_directory: String,
    /// Database name — becomes the subdirectory name.  `[A-Za-z0-9_ ]+`.
    pub database_name: String,
    /// Extension of collection files (no leading dot).
    pub file_extension: String,

    pub serializer: Serializer,
    pub buffer_mode: BufferMode,
    /// Transformation worker count in `ParallelBuffered` mode.
    pub max_degree_of_parallelism: usize,

    /// Never open a file; the collection is a pure concurrent map.
    pub memory_only: bool,
    /// Open the file read-only; every mutating operation is rejected.
    pub read_only: bool,

    pub encryption_enabled: bool,
    pub encryption_password: String,
    pub encryption_algorithm: EncryptionAlgorithm,
    pub compression_enabled: bool,

    /// When set, the data sync between the payload write and the state
    /// patch of the two-phase commit is elided.  The state-byte protocol
    /// keeps process-crash safety either way.
    pub buffered_writes: bool,

    pub add_duplicate_key_behavior: DuplicateKeyBehavior,
    pub bulk_add_duplicate_key_behavior: DuplicateKeyBehavior,
    pub update_key_not_found_behavior: KeyNotFoundBehavior,
    pub remove_key_not_found_behavior: KeyNotFoundBehavior,
    pub storage_failure_behavior: FailureBehavior,
    pub serialization_failure_behavior: FailureBehavior,
    pub deserialization_failure_behavior: FailureBehavior,

    /// Maps a default collection name (the value type's name) to a
    /// file-name stem.  The default strips module paths and generics.
    pub file_name_fn: FileNameFn,
}

impl StoreOptions {
    /// Directory holding this database's collection files.
    pub fn database_dir(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.base_directory).join(&self.database_name)
    }

    /// Full path of one collection's slot file.
    pub fn collection_path(&self, collection: &str) -> std::path::PathBuf {
        self.database_dir()
            .join(format!("{collection}.{}", self.file_extension))
    }
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            base_directory: ".".into(),
            database_name: "slotdb".into(),
            file_extension: "sdb".into(),
            serializer: Serializer::BinaryContractless,
            buffer_mode: BufferMode::Disabled,
            max_degree_of_parallelism: 8,
            memory_only: false,
            read_only: false,
            encryption_enabled: false,
            encryption_password: String::new(),
            encryption_algorithm: EncryptionAlgorithm::Sha256,
            compression_enabled: false,
            buffered_writes: true,
            add_duplicate_key_behavior: DuplicateKeyBehavior::FailWithError,
            bulk_add_duplicate_key_behavior: DuplicateKeyBehavior::FailWithError,
            update_key_not_found_behavior: KeyNotFoundBehavior::FailWithError,
            remove_key_not_found_behavior: KeyNotFoundBehavior::FailWithError,
            storage_failure_behavior: FailureBehavior::Raise,
            serialization_failure_behavior: FailureBehavior::Raise,
            deserialization_failure_behavior: FailureBehavior::Raise,
            file_name_fn: Arc::new(default_file_name),
        }
    }
}

impl std::fmt::Debug for StoreOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreOptions")
            .field("base_directory", &self.base_directory)
            .field("database_name", &self.database_name)
            .field("file_extension", &self.file_extension)
            .field("serializer", &self.serializer)
            .field("buffer_mode", &self.buffer_mode)
            .field("max_degree_of_parallelism", &self.max_degree_of_parallelism)
            .field("memory_only", &self.memory_only)
            .field("read_only", &self.read_only)
            .field("encryption_enabled", &self.encryption_enabled)
            .field("compression_enabled", &self.compression_enabled)
            .field("buffered_writes", &self.buffered_writes)
            .finish_non_exhaustive()
    }
}

/// Default stem mapping: last path segment of the type name, generics
/// stripped.  `my_game::model::Player` → `Player`,
/// `Vec<player::Stats>` → `Vec`.
pub(crate) fn default_file_name(type_name: &str) -> String {
    let base = type_name.split('<').next().unwrap_or(type_name);
    base.rsplit("::").next().unwrap_or(base).to_owned()
}

/// Database names become directory names; restrict to a safe alphabet.
pub(crate) fn is_valid_database_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ' ')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializer_tags_round_trip() {
        for s in [
            Serializer::BinaryContractless,
            Serializer::BinaryContract,
            Serializer::JsonUtf8,
        ] {
            assert_eq!(Serializer::from_tag(s.tag()), Some(s));
        }
        assert_eq!(Serializer::from_tag(9), None);
    }

    #[test]
    fn database_name_validation() {
        assert!(is_valid_database_name("game_saves 01"));
        assert!(!is_valid_database_name(""));
        assert!(!is_valid_database_name("../escape"));
        assert!(!is_valid_database_name("nul\0"));
    }

    #[test]
    fn default_file_name_strips_paths_and_generics() {
        assert_eq!(default_file_name("my_game::model::Player"), "Player");
        assert_eq!(default_file_name("Player"), "Player");
        assert_eq!(default_file_name("map::Tile<u32>"), "Tile");
    }
}
