//! Error type shared by every component in this crate.

/// Errors surfaced by `gletscher-core`.
///
/// Variants map directly onto the error kinds described by the command
/// orchestration layer: `ConfigError` and `IOFailure` are not represented
/// here (they belong to the binary crate's config/scanning code), but
/// `TransportError`, `RemoteRejection`, `TreeHashMismatch`, `IntegrityFailure`
/// and `DataMissing` each have a dedicated variant.
pub enum Error {
    Io(std::io::Error),
    Storage(sled::Error),
    Http(reqwest::Error),
    JoinError(tokio::task::JoinError),
    Json(serde_json::Error),
    /// A chunk, MAC or tree-hash failed to verify locally.
    IntegrityFailure(String),
    /// The cold store rejected a request outright (4xx).
    RemoteRejection { status: u16, body: String },
    /// The cold store accepted a request but its tree hash disagreed.
    TreeHashMismatch,
    /// A digest was added to the index twice.
    DuplicateDigest,
    /// `merge_temporary` saw the same digest with two different
    /// `original_length` values.
    IndexConflict,
    /// The reconciler found a digest or archive the remote store no longer
    /// has a record of. Carries the paths/tree-hashes affected.
    DataMissing(String),
    /// Storage version recorded in an `IndexEntry` is not 1 or 2.
    UnknownStorageVersion(u8),
    /// kv-pack stream is malformed (bad magic, interleaved records, missing
    /// signature, ...).
    CorruptKvPack(&'static str),
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<sled::Error> for Error {
    fn from(e: sled::Error) -> Self {
        Self::Storage(e)
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e)
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::JoinError(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "Io({:?})", e),
            Self::Storage(e) => write!(f, "Storage({:?})", e),
            Self::Http(e) => write!(f, "Http({:?})", e),
            Self::JoinError(e) => write!(f, "JoinError({:?})", e),
            Self::Json(e) => write!(f, "Json({:?})", e),
            Self::IntegrityFailure(msg) => write!(f, "IntegrityFailure({})", msg),
            Self::RemoteRejection { status, body } => {
                write!(f, "RemoteRejection({}, {:?})", status, body)
            }
            Self::TreeHashMismatch => write!(f, "TreeHashMismatch"),
            Self::DuplicateDigest => write!(f, "DuplicateDigest"),
            Self::IndexConflict => write!(f, "IndexConflict"),
            Self::DataMissing(msg) => write!(f, "DataMissing({})", msg),
            Self::UnknownStorageVersion(v) => write!(f, "UnknownStorageVersion({})", v),
            Self::CorruptKvPack(msg) => write!(f, "CorruptKvPack({})", msg),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "i/o error: {}", e),
            Self::Storage(e) => write!(f, "storage error: {}", e),
            Self::Http(e) => write!(f, "http error: {}", e),
            Self::JoinError(e) => write!(f, "error joining task: {}", e),
            Self::Json(e) => write!(f, "json error: {}", e),
            Self::IntegrityFailure(msg) => write!(f, "integrity failure: {}", msg),
            Self::RemoteRejection { status, body } => {
                write!(f, "remote rejected request ({}): {}", status, body)
            }
            Self::TreeHashMismatch => write!(f, "tree hash mismatch reported by cold store"),
            Self::DuplicateDigest => write!(f, "digest already present in index"),
            Self::IndexConflict => {
                write!(f, "conflicting original_length for existing index entry")
            }
            Self::DataMissing(msg) => write!(f, "data missing: {}", msg),
            Self::UnknownStorageVersion(v) => write!(f, "unknown storage version: {}", v),
            Self::CorruptKvPack(msg) => write!(f, "corrupt kv-pack stream: {}", msg),
        }
    }
}
