//! Error types for mainline
//!
//! Exit codes:
//! - 0: Success
//! - 2: User error (bad args, missing entity, invalid options)
//! - 3: Blocked by repository state (wrong branch, rebase, conflict, stale selection)
//! - 4: Operation failed (git error, I/O, lock timeout)

use std::path::PathBuf;
use thiserror::Error;

/// Exit codes for the mainline CLI
pub mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const USER_ERROR: i32 = 2;
    pub const STATE_BLOCKED: i32 = 3;
    pub const OPERATION_FAILED: i32 = 4;
}

/// Coarse error category, used by callers to decide whether to import, retry or report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Validation,
    RepositoryState,
    Conflict,
    Transient,
}

/// Main error type for mainline operations
#[derive(Error, Debug)]
pub enum Error {
    // Not found (exit code 2)
    #[error("Codebase not found: {0}")]
    CodebaseNotFound(String),

    #[error("Workspace not found: {0}")]
    WorkspaceNotFound(String),

    #[error("View not found: {0}")]
    ViewNotFound(String),

    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("Change not found: {0}")]
    ChangeNotFound(String),

    #[error("Git object not found: {0}")]
    ObjectNotFound(String),

    // Validation (exit code 2)
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid options: {0}")]
    Validation(String),

    // Repository state (exit code 3)
    #[error("Unexpected branch: expected {expected}, found {actual}")]
    UnexpectedBranch { expected: String, actual: String },

    #[error("Repository is in the middle of a rebase")]
    Rebasing,

    #[error("Can't snapshot while rebasing")]
    CantSnapshotRebasing,

    #[error("Can't snapshot, view is on an unexpected branch: {0}")]
    CantSnapshotWrongBranch(String),

    // Conflicts (exit code 3)
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Selection is stale, unknown hunks: {}", .0.join(", "))]
    StaleSelection(Vec<String>),

    #[error("Mainline moved during operation: {0}")]
    MainlineMoved(String),

    // Operation failures (exit code 4)
    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Lock acquisition failed: {0}")]
    LockFailed(PathBuf),

    #[error("Operation failed: {0}")]
    OperationFailed(String),
}

impl Error {
    /// Category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::CodebaseNotFound(_)
            | Error::WorkspaceNotFound(_)
            | Error::ViewNotFound(_)
            | Error::SnapshotNotFound(_)
            | Error::ChangeNotFound(_)
            | Error::ObjectNotFound(_) => ErrorKind::NotFound,

            Error::Git(err) if err.code() == git2::ErrorCode::NotFound => ErrorKind::NotFound,

            Error::InvalidConfig(_) | Error::InvalidArgument(_) | Error::Validation(_) => {
                ErrorKind::Validation
            }

            Error::UnexpectedBranch { .. }
            | Error::Rebasing
            | Error::CantSnapshotRebasing
            | Error::CantSnapshotWrongBranch(_) => ErrorKind::RepositoryState,

            Error::Conflict(_) | Error::StaleSelection(_) | Error::MainlineMoved(_) => {
                ErrorKind::Conflict
            }

            Error::Git(_)
            | Error::Io(_)
            | Error::Json(_)
            | Error::TomlParse(_)
            | Error::TomlSerialize(_)
            | Error::LockFailed(_)
            | Error::OperationFailed(_) => ErrorKind::Transient,
        }
    }

    /// Missing entity or git object; callers may import or create instead of failing.
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::NotFound | ErrorKind::Validation => exit_codes::USER_ERROR,
            ErrorKind::RepositoryState | ErrorKind::Conflict => exit_codes::STATE_BLOCKED,
            ErrorKind::Transient => exit_codes::OPERATION_FAILED,
        }
    }

    /// Structured details for JSON error output
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Error::UnexpectedBranch { expected, actual } => Some(serde_json::json!({
                "expected": expected,
                "actual": actual,
            })),
            Error::StaleSelection(ids) => Some(serde_json::json!({ "unknown_hunks": ids })),
            Error::LockFailed(path) => Some(serde_json::json!({ "lock": path })),
            _ => None,
        }
    }
}

/// Map a git2 error whose code is NotFound to a typed not-found error.
pub(crate) fn not_found_as(err: git2::Error, what: impl FnOnce() -> Error) -> Error {
    if err.code() == git2::ErrorCode::NotFound {
        what()
    } else {
        Error::Git(err)
    }
}

/// Result type alias for mainline operations
pub type Result<T> = std::result::Result<T, Error>;
