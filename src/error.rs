//! Crate-wide error type and the domain/code mapping reported at API and
//! protocol boundaries.

/// Alias for a `Result` with the error type defaulting to [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error domains surfaced at the outer boundary.
///
/// Every [`Error`] maps to one domain plus an integer code. The wire names
/// are protocol constants and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    /// Storage-level errors (and engine errors surfaced through storage).
    Storage,
    /// Operating system I/O errors.
    Posix,
    /// Errors raised by the underlying key-value engine.
    Engine,
    /// Document body decoding errors.
    Codec,
    /// Peer protocol errors.
    Protocol,
}

impl Domain {
    /// The domain name used in peer-visible error replies.
    pub fn wire_name(&self) -> &'static str {
        match self {
            // Engine errors are reported under the storage domain so peers
            // never have to know which engine backs a database file.
            Domain::Storage | Domain::Engine => "LiteCore",
            Domain::Posix => "POSIX",
            Domain::Codec => "Fleece",
            Domain::Protocol => "BLIP",
        }
    }
}

/// The error type for all fallible operations in this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A packed revision tree (or other stored structure) failed validation.
    #[error("corrupt revision data")]
    CorruptRevisionData,
    /// The requested record, document or revision does not exist.
    #[error("not found")]
    NotFound,
    /// The write conflicts with the current state of the record.
    #[error("conflict")]
    Conflict,
    /// The database was opened read-only.
    #[error("database is not writeable")]
    NotWriteable,
    /// The resource is exclusively held elsewhere.
    #[error("database is busy")]
    Busy,
    /// Unsupported or invalid encryption parameters.
    #[error("encryption error: {0}")]
    Crypto(String),
    /// A caller-supplied argument is invalid.
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
    /// A transaction is still open where none may be.
    #[error("a transaction is still active")]
    TransactionNotClosed,
    /// The database has been closed.
    #[error("database is not open")]
    NotOpen,
    /// The operation was canceled before it ran.
    #[error("operation canceled")]
    Canceled,
    /// The storage engine reported an error.
    #[error("storage engine error: {message}")]
    Engine {
        /// Engine-specific error code.
        code: i32,
        /// Human-readable engine message, for logs.
        message: String,
    },
    /// A peer violated the replication protocol.
    #[error("protocol error {code}: {message}")]
    Protocol {
        /// HTTP-style status code sent in the error reply.
        code: i32,
        /// Human-readable description, for logs.
        message: String,
    },
    /// An operating system I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn engine(err: impl std::fmt::Display) -> Self {
        Error::Engine {
            code: 1,
            message: err.to_string(),
        }
    }

    pub(crate) fn protocol(code: i32, message: impl Into<String>) -> Self {
        Error::Protocol {
            code,
            message: message.into(),
        }
    }

    /// The `(domain, code)` pair reported for this error at the boundary.
    pub fn domain_code(&self) -> (Domain, i32) {
        match self {
            Error::CorruptRevisionData => (Domain::Storage, 1),
            Error::NotFound => (Domain::Storage, 2),
            Error::Conflict => (Domain::Storage, 3),
            Error::NotWriteable => (Domain::Storage, 4),
            Error::Busy => (Domain::Storage, 5),
            Error::Crypto(_) => (Domain::Storage, 6),
            Error::InvalidParameter(_) => (Domain::Storage, 7),
            Error::TransactionNotClosed => (Domain::Storage, 8),
            Error::NotOpen => (Domain::Storage, 9),
            Error::Canceled => (Domain::Storage, 10),
            Error::Engine { code, .. } => (Domain::Engine, *code),
            Error::Protocol { code, .. } => (Domain::Protocol, *code),
            Error::Io(err) => (Domain::Posix, err.raw_os_error().unwrap_or(5)),
        }
    }
}

impl From<redb::DatabaseError> for Error {
    fn from(err: redb::DatabaseError) -> Self {
        match err {
            redb::DatabaseError::DatabaseAlreadyOpen => Error::Busy,
            redb::DatabaseError::Storage(err) => err.into(),
            other => Error::engine(other),
        }
    }
}

impl From<redb::StorageError> for Error {
    fn from(err: redb::StorageError) -> Self {
        match err {
            redb::StorageError::Io(io) => Error::Io(io),
            redb::StorageError::Corrupted(msg) => Error::Engine { code: 2, message: msg },
            other => Error::engine(other),
        }
    }
}

impl From<redb::TransactionError> for Error {
    fn from(err: redb::TransactionError) -> Self {
        match err {
            redb::TransactionError::Storage(err) => err.into(),
            other => Error::engine(other),
        }
    }
}

impl From<redb::TableError> for Error {
    fn from(err: redb::TableError) -> Self {
        match err {
            redb::TableError::Storage(err) => err.into(),
            other => Error::engine(other),
        }
    }
}

impl From<redb::CommitError> for Error {
    fn from(err: redb::CommitError) -> Self {
        match err {
            redb::CommitError::Storage(err) => err.into(),
            other => Error::engine(other),
        }
    }
}
