//! Error types for the coordination core.
//!
//! Errors are classified where they are detected:
//!
//! - **Transient**: storage contention, timeouts from external checks. Callers retry.
//! - **System**: the coordination store is unreachable or corrupt. The affected
//!   component halts and escalates.
//! - **Human**: ambiguity that policy cannot resolve. Routed to a `Decision`.
//!
//! Expected outcomes such as a denied lock or an empty poll are return values, not errors.

use thiserror::Error;

/// Classification of an error for retry and escalation decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorClass {
    /// Retry with backoff; the core never retries on the caller's behalf.
    Transient,
    /// Halt the affected component and escalate.
    System,
    /// Route to the decision mechanism.
    Human,
}

/// Core error type for coordination operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Query or statement failure inside the store.
    #[error("database error: {0}")]
    Database(String),

    /// The store could not be reached or is corrupt.
    #[error("coordination store unavailable: {0}")]
    StoreUnavailable(String),

    /// Storage contention (`SQLITE_BUSY`, locked database).
    #[error("coordination store busy: {0}")]
    Busy(String),

    /// Requested entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A release was attempted by someone other than the holder.
    #[error("lock on '{resource}' is not held by '{holder}'")]
    NotLockHolder { resource: String, holder: String },

    /// Caller supplied an invalid argument.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Configuration failed validation.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Stored or supplied data could not be parsed.
    #[error("parse error: {0}")]
    Parse(String),

    /// A version-control primitive failed.
    #[error("vcs {operation} failed: {message}")]
    Vcs { operation: String, message: String },

    /// The external verification pipeline failed to produce a verdict.
    #[error("verification failed: {0}")]
    Verification(String),

    /// A decision was already resolved or timed out.
    #[error("decision '{id}' is already {status}")]
    DecisionClosed { id: String, status: String },

    /// A conflict that policy could not settle deterministically.
    #[error("ambiguous conflict: {0}")]
    Ambiguous(String),

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(String),
}

impl Error {
    /// Classify the error.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Busy(_) | Self::Verification(_) => ErrorClass::Transient,
            Self::Ambiguous(_) => ErrorClass::Human,
            Self::Database(_)
            | Self::StoreUnavailable(_)
            | Self::NotFound(_)
            | Self::NotLockHolder { .. }
            | Self::InvalidInput(_)
            | Self::InvalidConfig(_)
            | Self::Parse(_)
            | Self::Vcs { .. }
            | Self::DecisionClosed { .. }
            | Self::Io(_) => ErrorClass::System,
        }
    }

    /// Returns true if the caller may retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self.class(), ErrorClass::Transient)
    }

    /// Returns true if the coordination store itself failed.
    #[must_use]
    pub const fn is_store_failure(&self) -> bool {
        matches!(self, Self::Database(_) | Self::StoreUnavailable(_))
    }

    /// Stable machine-readable code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Database(_) => "DATABASE_ERROR",
            Self::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            Self::Busy(_) => "STORE_BUSY",
            Self::NotFound(_) => "NOT_FOUND",
            Self::NotLockHolder { .. } => "NOT_LOCK_HOLDER",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::InvalidConfig(_) => "INVALID_CONFIG",
            Self::Parse(_) => "PARSE_ERROR",
            Self::Vcs { .. } => "VCS_ERROR",
            Self::Verification(_) => "VERIFICATION_ERROR",
            Self::DecisionClosed { .. } => "DECISION_CLOSED",
            Self::Ambiguous(_) => "AMBIGUOUS",
            Self::Io(_) => "IO_ERROR",
        }
    }

    /// Exit code for the operator CLI.
    ///
    /// - 1: invalid input or configuration
    /// - 2: system failure
    /// - 3: not found
    /// - 4: conflicting state (not holder, decision closed)
    /// - 5: transient, retry later
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidInput(_) | Self::InvalidConfig(_) | Self::Parse(_) => 1,
            Self::NotFound(_) => 3,
            Self::NotLockHolder { .. } | Self::DecisionClosed { .. } | Self::Ambiguous(_) => 4,
            Self::Busy(_) | Self::Verification(_) => 5,
            Self::Database(_) | Self::StoreUnavailable(_) | Self::Vcs { .. } | Self::Io(_) => 2,
        }
    }

    /// Build a VCS error.
    pub fn vcs(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Vcs {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

/// Classify a storage error message the way `SQLite` reports it.
fn is_contention(message: &str) -> bool {
    let lower = message.to_lowercase();
    ["database is locked", "database table is locked", "sqlite_busy", "busy"]
        .iter()
        .any(|pattern| lower.contains(pattern))
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => {
                let busy_code = db.code().is_some_and(|code| code == "5" || code == "6");
                if busy_code || is_contention(db.message()) {
                    Self::Busy(db.message().to_string())
                } else if db.message().contains("malformed") || db.message().contains("not a database")
                {
                    Self::StoreUnavailable(db.message().to_string())
                } else {
                    Self::Database(db.message().to_string())
                }
            }
            sqlx::Error::PoolTimedOut => Self::Busy(err.to_string()),
            sqlx::Error::Io(_)
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Configuration(_)
            | sqlx::Error::Tls(_) => Self::StoreUnavailable(err.to_string()),
            _ => Self::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::InvalidConfig(format!("failed to parse config: {err}"))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Result type alias for coordination operations.
pub type Result<T> = std::result::Result<T, Error>;
