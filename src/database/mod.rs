//! Database backup lifecycle: dump, compression, replication, retention,
//! verification and restore drills against PostgreSQL

// Re-export storage module for public use
pub mod storage;

// Database modules
pub mod backup;
pub mod backup_naming;
pub mod compression;
pub mod engine;
pub mod process;
pub mod restore;
pub mod retention;
pub mod stats;
pub mod verify;

use std::time::Duration;

use serde::Serializer;

/// File name prefix shared by every artifact this crate produces
pub const BACKUP_PREFIX: &str = "backup_";

/// File name prefix of full backups
pub const FULL_BACKUP_PREFIX: &str = "backup_full_";

/// Extension of raw, uncompressed dumps
pub const DUMP_EXTENSION: &str = "sql";

/// Database error type for backup/restore operations
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{program} exited with code {code:?}: {stderr}")]
    Command {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("{program} timed out after {seconds}s")]
    Timeout { program: String, seconds: u64 },

    #[error("Required tool is not available: {0}")]
    ToolUnavailable(String),

    #[error("Unsupported on this platform: {0}")]
    UnsupportedPlatform(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Backup not found: {0}")]
    BackupNotFound(String),

    #[error("Invalid SQL identifier: {0}")]
    InvalidIdentifier(String),
}

/// Result type for database operations
pub type Result<T> = std::result::Result<T, DatabaseError>;

/// Serialize a `Duration` as whole milliseconds
pub(crate) fn serialize_millis<S: Serializer>(
    duration: &Duration,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}
