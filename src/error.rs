// src/error.rs

use std::path::PathBuf;
use thiserror::Error;

/// Core error types for hostpkg
#[derive(Error, Debug)]
pub enum Error {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// I/O errors with context
    #[error("I/O error: {0}")]
    IoError(String),

    /// Metadata (de)serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Database initialization error
    #[error("Failed to initialize database: {0}")]
    InitError(String),

    /// Database not found
    #[error("Database not found at path: {0}")]
    DatabaseNotFound(String),

    /// Malformed request, metadata or native tool output
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Download failures
    #[error("Download error: {0}")]
    DownloadError(String),

    /// Archive or download checksum did not match
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// Named entity (package, repository) does not exist
    #[error("Not found: {0}")]
    NotFoundError(String),

    /// Entity already exists
    #[error("Conflict: {0}")]
    ConflictError(String),

    /// A request or dependency has no matching candidate at all
    #[error("Unsatisfiable requirement: {0}")]
    UnsatisfiableRequirement(String),

    /// The solver exhausted its search space without a complete solution
    #[error("Unable to resolve dependencies: {0}")]
    UnresolvableDependencies(String),

    /// The solver checked more combinations than it is allowed to
    #[error("Dependency resolution gave up after checking {0} possible solutions")]
    SolverBudgetExceeded(usize),

    /// Two solution members conflict, or a removal would break a dependent
    #[error("Conflict detected: {0}")]
    ConflictDetected(String),

    /// Another live process holds the repository lock
    #[error("Repository {} is locked by {}", .path.display(), lock_owner(.pid))]
    LockContention { pid: Option<i32>, path: PathBuf },

    /// A hook, native package manager or shell command failed
    #[error("Command '{command}' failed: {status}")]
    ExternalFailure { command: String, status: String },

    /// Ownership/permission change refused while running privileged
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Apply queue made no progress across a full pass
    #[error("Dependency cycle among packages: {}", .0.join(", "))]
    DependencyCycle(Vec<String>),

    /// Failure after some packages were already applied
    #[error("Operation failed after applying [{}]: {source}", .applied.join(", "))]
    PartialApply {
        applied: Vec<String>,
        #[source]
        source: Box<Error>,
    },
}

/// Result type alias using hostpkg's Error type
pub type Result<T> = std::result::Result<T, Error>;

fn lock_owner(pid: &Option<i32>) -> String {
    match pid {
        Some(pid) => format!("pid {}", pid),
        None => "an unknown process".to_string(),
    }
}
