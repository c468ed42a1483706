//! Error types for HelioDB
//!
//! A single `Error` enum spans every layer so that errors can cross the
//! transaction boundary, the wire, and the admin surface without losing
//! their kind. `thiserror` derives `Display` and `std::error::Error`.
//!
//! Categories:
//! - **Conflict**: OCC validation failures, retriable by the caller
//! - **Constraint**: reference-integrity violations, caller bugs
//! - **NotFound** / **InvalidArgument**: lookup and input failures
//! - **Configuration**: persistence/cluster descriptor rejections
//! - **Cluster**: role and election failures
//! - **Communication**: transport failures
//! - **Persistence**: log/snapshot failures
//! - **Assembly**: user-code bundle failures
//! - **Critical**: fatal engine invariant breaks; the process terminates

use crate::types::{ClassId, IndexId, ObjectId};
use std::io;
use thiserror::Error;

/// Result type alias used across all HelioDB crates.
pub type Result<T> = std::result::Result<T, Error>;

/// Transaction validation conflicts. All of these are retriable: the caller
/// may rerun the operation against a fresh snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
pub enum ConflictKind {
    /// An object read by this transaction was overwritten by a transaction
    /// that committed after this transaction's read version.
    #[error("object was modified after it was read")]
    WriteAfterRead,
    /// An object written by this transaction already has a newer committed
    /// head than this transaction's read version.
    #[error("object was modified after this transaction started")]
    WriteAfterWrite,
    /// A committed transaction inserted an entry into an index range this
    /// transaction scanned.
    #[error("concurrent insert into a scanned index range")]
    PhantomWrite,
    /// A write would introduce a duplicate key into a UNIQUE index.
    #[error("unique index violation")]
    UniqueIndexViolation,
}

/// Reference-integrity violations. Not retriable; the operation is wrong.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
pub enum ConstraintKind {
    /// A non-nullable reference property was written as null.
    #[error("non-nullable reference set to null")]
    ReferenceNotNullable,
    /// A reference points at an object id with no live version.
    #[error("reference to missing object {0:?}")]
    DanglingReference(ObjectId),
    /// The inverse-reference index disagrees with the stored reference.
    #[error("inverse reference mismatch for {0:?}")]
    InverseReferenceMismatch(ObjectId),
}

/// Missing-entity failures.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
pub enum NotFoundKind {
    /// No class with the given id in the current model.
    #[error("class {0} not found")]
    Class(ClassId),
    /// No visible version of the object at the read version.
    #[error("object {0:?} not found")]
    Object(ObjectId),
    /// No index with the given id in the current model.
    #[error("index {0} not found")]
    Index(IndexId),
    /// No log stream with the given name.
    #[error("log stream '{0}' not found")]
    LogStream(String),
}

/// Persistence/cluster configuration rejections.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
pub enum ConfigKind {
    /// Log stream name violates the allowed character set or length.
    #[error("invalid name '{0}'")]
    InvalidName(String),
    /// Directory path violates the allowed character set or length.
    #[error("invalid path '{0}'")]
    InvalidPath(String),
    /// Two log streams share a name.
    #[error("duplicate name '{0}'")]
    DuplicateName(String),
    /// The persistence descriptor exceeds the log stream limit.
    #[error("too many log streams (limit {0})")]
    TooManyLogs(usize),
    /// A numeric configuration field is out of its permitted range.
    #[error("{field} out of range")]
    OutOfRange {
        /// Name of the offending field.
        field: String,
    },
}

/// Cluster-role and election failures.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
pub enum ClusterKind {
    /// The node is not a member of a local-write cluster.
    #[error("node is not in a local-write cluster")]
    NotInLocalWriteCluster,
    /// The node is not a member of a global-write cluster.
    #[error("node is not in a global-write cluster")]
    NotInGlobalWriteCluster,
    /// The requested role operation does not apply to this element.
    #[error("operation not applicable")]
    NotApplicable,
    /// An election is already in progress.
    #[error("election in progress")]
    Busy,
    /// The peer site appears primary; promotion requires explicit operator
    /// confirmation.
    #[error("peer site appears primary; confirmation required")]
    SplitBrainRisk,
}

/// Transport failures.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
pub enum CommunicationKind {
    /// A configured communication bound elapsed.
    #[error("communication timeout")]
    Timeout,
    /// The connection was closed.
    #[error("connection closed")]
    Closed,
    /// A frame failed structural validation.
    #[error("corrupt message")]
    CorruptMessage,
    /// The peer sent a header version this build does not speak.
    #[error("unsupported header version {0}")]
    UnsupportedHeader(u32),
    /// The listen address is already bound.
    #[error("address in use")]
    AddressInUse,
}

/// Log and snapshot failures.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
pub enum PersistenceKind {
    /// An underlying file operation failed.
    #[error("i/o error: {0}")]
    IoError(String),
    /// The log or snapshot file is locked by another process.
    #[error("sharing violation: {0}")]
    SharingViolation(String),
    /// A log record failed its CRC or structural checks.
    #[error("corrupt log: {0}")]
    CorruptLog(String),
    /// Snapshot writing failed; the previous snapshot remains authoritative.
    #[error("snapshot failed: {0}")]
    SnapshotFailed(String),
}

/// User-assembly bundle failures.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
pub enum AssemblyKind {
    /// The bundle payload is not a valid assembly archive.
    #[error("invalid assembly: {0}")]
    InvalidAssembly(String),
    /// An assembly references a module absent from the bundle.
    #[error("missing reference '{0}'")]
    MissingReference(String),
    /// The bundle targets a newer framework than this engine supports.
    #[error("framework version too new: {0}")]
    FrameworkTooNew(String),
    /// The caller's model-version GUID does not match the installed bundle.
    #[error("model version guid mismatch")]
    VersionGuidMismatch,
    /// Two modules in the bundle share a name.
    #[error("duplicate assembly name '{0}'")]
    DuplicateName(String),
}

/// Fatal failures. The engine logs, flushes, and terminates.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
pub enum CriticalKind {
    /// An allocator could not satisfy a request and cannot recover.
    #[error("allocator exhausted")]
    AllocatorExhausted,
    /// An internal invariant was observed broken.
    #[error("invariant broken: {0}")]
    InvariantBroken(String),
}

/// The unified HelioDB error.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
pub enum Error {
    /// OCC validation failure; retriable.
    #[error("transaction conflict: {0}")]
    Conflict(ConflictKind),

    /// Reference-integrity violation; caller bug.
    #[error("constraint violation: {0}")]
    Constraint(ConstraintKind),

    /// Entity lookup failure.
    #[error("not found: {0}")]
    NotFound(NotFoundKind),

    /// A request argument failed validation.
    #[error("invalid argument '{field}': {reason}")]
    InvalidArgument {
        /// The offending field.
        field: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Configuration descriptor rejection.
    #[error("configuration error: {0}")]
    Configuration(ConfigKind),

    /// Cluster-role or election failure.
    #[error("cluster error: {0}")]
    Cluster(ClusterKind),

    /// Transport failure.
    #[error("communication error: {0}")]
    Communication(CommunicationKind),

    /// Log or snapshot failure.
    #[error("persistence error: {0}")]
    Persistence(PersistenceKind),

    /// User-assembly bundle failure.
    #[error("assembly error: {0}")]
    Assembly(AssemblyKind),

    /// Fatal engine failure.
    #[error("critical error: {0}")]
    Critical(CriticalKind),

    /// Transaction used outside its legal lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Serialization failure at a boundary.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Whether the caller may retry the failed operation on a fresh
    /// transaction. Only OCC conflicts qualify.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    /// Whether this error must terminate the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Critical(_))
    }

    /// Stable numeric code for the wire protocol. Status 0 is success and
    /// never produced here.
    pub fn wire_code(&self) -> u16 {
        match self {
            Error::Conflict(ConflictKind::WriteAfterRead) => 10,
            Error::Conflict(ConflictKind::WriteAfterWrite) => 11,
            Error::Conflict(ConflictKind::PhantomWrite) => 12,
            Error::Conflict(ConflictKind::UniqueIndexViolation) => 13,
            Error::Constraint(_) => 20,
            Error::NotFound(_) => 30,
            Error::InvalidArgument { .. } => 40,
            Error::Configuration(_) => 50,
            Error::Cluster(ClusterKind::Busy) => 61,
            Error::Cluster(ClusterKind::NotApplicable) => 62,
            Error::Cluster(ClusterKind::SplitBrainRisk) => 63,
            Error::Cluster(_) => 60,
            Error::Communication(CommunicationKind::Timeout) => 71,
            Error::Communication(_) => 70,
            Error::Persistence(_) => 80,
            Error::Assembly(_) => 90,
            Error::Critical(_) => 100,
            Error::InvalidState(_) => 41,
            Error::Serialization(_) => 42,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::AddrInUse => Error::Communication(CommunicationKind::AddressInUse),
            io::ErrorKind::TimedOut => Error::Communication(CommunicationKind::Timeout),
            _ => Error::Persistence(PersistenceKind::IoError(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflicts_are_retryable() {
        assert!(Error::Conflict(ConflictKind::WriteAfterRead).is_retryable());
        assert!(Error::Conflict(ConflictKind::PhantomWrite).is_retryable());
        assert!(!Error::Constraint(ConstraintKind::ReferenceNotNullable).is_retryable());
        assert!(!Error::Communication(CommunicationKind::Timeout).is_retryable());
    }

    #[test]
    fn critical_is_fatal() {
        assert!(Error::Critical(CriticalKind::AllocatorExhausted).is_fatal());
        assert!(!Error::Conflict(ConflictKind::WriteAfterWrite).is_fatal());
    }

    #[test]
    fn wire_codes_distinguish_conflicts() {
        let codes: Vec<u16> = [
            ConflictKind::WriteAfterRead,
            ConflictKind::WriteAfterWrite,
            ConflictKind::PhantomWrite,
            ConflictKind::UniqueIndexViolation,
        ]
        .iter()
        .map(|k| Error::Conflict(*k).wire_code())
        .collect();
        let mut dedup = codes.clone();
        dedup.sort_unstable();
        dedup.dedup();
        assert_eq!(codes.len(), dedup.len());
    }

    #[test]
    fn io_error_maps_to_taxonomy() {
        let e: Error = io::Error::from(io::ErrorKind::AddrInUse).into();
        assert_eq!(e, Error::Communication(CommunicationKind::AddressInUse));
        let e: Error = io::Error::from(io::ErrorKind::NotFound).into();
        assert!(matches!(e, Error::Persistence(PersistenceKind::IoError(_))));
    }
}
