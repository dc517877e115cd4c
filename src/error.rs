//! Error types for the node daemon core.

use crate::types::{Epoch, OsdId, PgId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for daemon operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Storage engine errors.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Transport errors.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// Cluster map errors.
    #[error("map error: {0}")]
    Map(#[from] MapError),

    /// Superblock errors.
    #[error("superblock error: {0}")]
    Superblock(#[from] SuperblockError),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// Placement group not found.
    #[error("pg not found: {0}")]
    PgNotFound(PgId),

    /// Placement group already exists.
    #[error("pg already exists: {0}")]
    PgAlreadyExists(PgId),

    /// The node is shutting down.
    #[error("osd is stopping")]
    Stopping,

    /// Too many queued operations (backpressure).
    #[error("server busy: too many pending ops ({pending})")]
    ServerBusy { pending: usize },

    /// Encoding/decoding failure.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Failures reported by the object storage engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The transaction could not be committed.
    #[error("commit failed: {0}")]
    CommitFailed(String),

    /// A transaction referenced a missing collection.
    #[error("collection not found: {0}")]
    CollectionNotFound(String),

    /// A transaction tried to create an existing collection.
    #[error("collection already exists: {0}")]
    CollectionExists(String),

    /// Stored metadata could not be decoded.
    #[error("corrupt object {cid}/{oid}: {reason}")]
    Corrupt {
        cid: String,
        oid: String,
        reason: String,
    },
}

/// Transport errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Destination is not reachable.
    #[error("destination unreachable: {0}")]
    Unreachable(String),

    /// Failed to send message.
    #[error("send failed: {0}")]
    SendFailed(String),
}

/// Epoch cache / map errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MapError {
    /// The epoch is older than the trim horizon.
    #[error("epoch {epoch} trimmed (oldest available {oldest})")]
    Trimmed { epoch: Epoch, oldest: Epoch },

    /// The epoch is newer than anything this node has seen.
    #[error("epoch {epoch} not yet available (newest {newest})")]
    NotYetAvailable { epoch: Epoch, newest: Epoch },

    /// The epoch is inside the retained range but its data is missing.
    #[error("epoch {0} missing from cache")]
    Missing(Epoch),

    /// An incremental did not follow its base map.
    #[error("incremental for epoch {got} does not follow epoch {base}")]
    Discontiguous { base: Epoch, got: Epoch },
}

/// Superblock decode/compat errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SuperblockError {
    #[error("bad superblock magic")]
    BadMagic,

    #[error("unsupported superblock version {0}")]
    UnsupportedVersion(u32),

    #[error("superblock checksum mismatch: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("superblock decode failed: {0}")]
    Decode(String),

    #[error("superblock requires unsupported features: {0:?}")]
    IncompatibleFeatures(Vec<String>),

    #[error("superblock belongs to osd.{found}, expected osd.{expected}")]
    WrongOsd { expected: OsdId, found: OsdId },
}

/// Error codes returned to clients and peers in replies.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpError {
    /// The op was tagged with an epoch the PG has moved past; resend with a newer map.
    #[error("stale epoch, current is {current}")]
    StaleEpoch { current: Epoch },

    /// This node is not the primary for the PG.
    #[error("misdirected op, primary is {primary:?}")]
    Misdirected { primary: Option<OsdId> },

    /// The node is overloaded; retry later.
    #[error("try again")]
    Again,

    /// Object does not exist.
    #[error("object not found")]
    NotFound,

    /// Session capabilities do not allow the op.
    #[error("permission denied")]
    PermissionDenied,

    /// The pool does not exist in the current map.
    #[error("no such pool {0}")]
    NoSuchPool(u32),

    /// The PG does not exist on this node.
    #[error("no such pg {0}")]
    NoSuchPg(PgId),

    /// A sub-op was sent by a node that is not the PG's primary.
    #[error("wrong peer, primary is {primary:?}")]
    WrongPeer { primary: Option<OsdId> },

    /// The backing transaction failed to commit.
    #[error("storage failure: {0}")]
    Storage(String),

    /// Malformed request.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl From<StorageError> for OpError {
    fn from(e: StorageError) -> Self {
        OpError::Storage(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Encoding(e.to_string())
    }
}
