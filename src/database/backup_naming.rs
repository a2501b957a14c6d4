//! Naming of backup artifacts and ephemeral restore-drill databases
//!
//! Full backups are named `backup_full_<timestamp>.sql[.ext]`, where the
//! timestamp is an RFC 3339 instant with `:` and `.` replaced so the name is
//! safe on every filesystem. Names sort lexicographically in creation order.

use chrono::{DateTime, NaiveDateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::{Rng, thread_rng};
use std::path::Path;

use crate::database::{DUMP_EXTENSION, FULL_BACKUP_PREFIX};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%S-%3fZ";

/// Filesystem-safe rendering of a timestamp
pub fn sanitized_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.format(TIMESTAMP_FORMAT).to_string()
}

/// File name of a raw full dump taken at `timestamp`
pub fn full_backup_file_name(timestamp: DateTime<Utc>) -> String {
    format!(
        "{}{}.{}",
        FULL_BACKUP_PREFIX,
        sanitized_timestamp(timestamp),
        DUMP_EXTENSION
    )
}

/// Whether a file name follows the full-backup naming convention
pub fn is_full_backup_name(file_name: &str) -> bool {
    file_name.starts_with(FULL_BACKUP_PREFIX)
}

/// Recover the creation timestamp embedded in a full-backup file name
pub fn parse_backup_timestamp(file_name: &str) -> Option<DateTime<Utc>> {
    let rest = file_name.strip_prefix(FULL_BACKUP_PREFIX)?;
    let stamp = rest.split('.').next()?;
    NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Unique name for a throwaway restore-drill database
///
/// Format: `{prefix}_{unix millis}_{4 lowercase alphanumerics}`. PostgreSQL
/// folds unquoted identifiers to lower case, so the suffix is lowered too.
pub fn ephemeral_database_name(prefix: &str) -> String {
    ephemeral_database_name_with_time(prefix, Utc::now())
}

/// Generate an ephemeral database name for the given instant (primarily for testing)
pub fn ephemeral_database_name_with_time(prefix: &str, timestamp: DateTime<Utc>) -> String {
    format!(
        "{}_{}_{}",
        prefix,
        timestamp.timestamp_millis(),
        random_suffix(4)
    )
}

fn random_suffix(len: usize) -> String {
    let mut rng = thread_rng();
    (0..len)
        .map(|_| rng.sample(Alphanumeric) as char)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// File name component of a path, if it is valid UTF-8
pub fn file_name_of(path: &Path) -> Option<&str> {
    path.file_name().and_then(|name| name.to_str())
}
