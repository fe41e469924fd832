//! The uniform error taxonomy.
//!
//! Every backend translates its native driver errors into these variants so
//! that callers never match on dialect-specific messages. The variants mirror
//! the failure classes a data pipeline actually distinguishes: connectivity,
//! privileges, key collisions, referential integrity, bad SQL, and missing
//! objects.

/// Errors raised anywhere in the quarry stack.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The server closed the connection or the connection timed out.
    #[error("lost connection: {0}")]
    LostConnection(String),

    /// Insufficient privilege for a query or DDL statement.
    #[error("access denied: {0}")]
    Access(String),

    /// A unique or primary key violation.
    #[error("duplicate entry: {0}")]
    Duplicate(String),

    /// A foreign key or other referential constraint violation.
    #[error("integrity violation: {0}")]
    Integrity(String),

    /// Malformed SQL, reported with the offending query attached.
    #[error("query syntax error: {message}\nquery: {query}")]
    QuerySyntax {
        /// The backend's description of the syntax problem.
        message: String,
        /// The SQL statement that failed.
        query: String,
    },

    /// A referenced table does not exist.
    #[error("missing table: {0}")]
    MissingTable(String),

    /// An INSERT omitted a non-null column without a default.
    #[error("missing attribute: {0}")]
    MissingAttribute(String),

    /// An INSERT or WHERE referenced a nonexistent column.
    #[error("unknown attribute: {0}")]
    UnknownAttribute(String),

    /// A hash- or schema-addressed object was not found in its store.
    #[error("missing external file: {0}")]
    MissingExternalFile(String),

    /// An object store is unreachable or misconfigured.
    #[error("store inaccessible: {0}")]
    BucketInaccessible(String),

    /// A table definition failed to parse or violated a declaration rule.
    #[error("declaration error: {0}")]
    Declaration(String),

    /// A value failed codec or format validation before insert.
    #[error("validation error: {0}")]
    Validation(String),

    /// A blob or metadata payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Filesystem failure in a local store or staged insert.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A framework invariant was violated (cyclic dependencies, exhausted
    /// cascade attempts, drifted tripartite fetch, and similar).
    #[error("{0}")]
    Invalid(String),
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    // -- Constructors --------------------------------------------------------

    /// Creates an [`Error::Invalid`] with the given message.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }

    /// Creates an [`Error::Declaration`] with the given message.
    pub fn declaration(message: impl Into<String>) -> Self {
        Self::Declaration(message.into())
    }

    /// Creates an [`Error::Validation`] with the given message.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    // -- Predicates ----------------------------------------------------------

    /// Returns `true` if this is a [`Error::Duplicate`].
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }

    /// Returns `true` if this is an [`Error::Integrity`] violation.
    pub fn is_integrity(&self) -> bool {
        matches!(self, Self::Integrity(_))
    }

    /// Returns `true` if the connection was lost and, outside a transaction,
    /// the operation may succeed after a reconnect.
    pub fn is_lost_connection(&self) -> bool {
        matches!(self, Self::LostConnection(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
