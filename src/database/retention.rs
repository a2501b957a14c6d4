//! Age-based retention for backup artifacts
//!
//! Every file whose name starts with [`BACKUP_PREFIX`] and whose modification
//! time is strictly older than `now - retention_days` is deleted. There is no
//! minimum number of artifacts kept: a zero-day policy removes everything.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio::fs as tokio_fs;
use tracing::{debug, error, info, warn};

use crate::database::{BACKUP_PREFIX, Result};

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// Number of artifacts removed per location
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupSummary {
    pub primary: usize,
    pub secondary: usize,
}

/// Deletes artifacts that fall outside the retention window
#[derive(Debug, Clone)]
pub struct RetentionManager {
    backup_dir: PathBuf,
    secondary_dir: Option<PathBuf>,
    retention_days: u32,
}

impl RetentionManager {
    pub fn new(backup_dir: PathBuf, secondary_dir: Option<PathBuf>, retention_days: u32) -> Self {
        Self {
            backup_dir,
            secondary_dir,
            retention_days,
        }
    }

    /// Apply the policy relative to the current time
    pub async fn cleanup(&self) -> Result<CleanupSummary> {
        self.cleanup_at(SystemTime::now()).await
    }

    /// Apply the policy relative to `now`
    ///
    /// A directory that cannot be read is an error for the primary location
    /// and a logged zero for the secondary one. Entries that cannot be
    /// inspected or deleted are logged and skipped.
    pub async fn cleanup_at(&self, now: SystemTime) -> Result<CleanupSummary> {
        let cutoff = now
            .checked_sub(Duration::from_secs(u64::from(self.retention_days) * SECONDS_PER_DAY))
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let mut summary = CleanupSummary {
            primary: remove_expired(&self.backup_dir, cutoff).await?,
            secondary: 0,
        };

        if let Some(secondary_dir) = &self.secondary_dir {
            match remove_expired(secondary_dir, cutoff).await {
                Ok(count) => summary.secondary = count,
                Err(e) => error!(
                    "Failed to clean up secondary backup directory {}: {}",
                    secondary_dir.display(),
                    e
                ),
            }
        }

        info!(
            "Retention cleanup ({} days) removed {} primary and {} secondary backups",
            self.retention_days, summary.primary, summary.secondary
        );
        Ok(summary)
    }
}

async fn remove_expired(dir: &Path, cutoff: SystemTime) -> Result<usize> {
    let mut entries = tokio_fs::read_dir(dir).await?;
    let mut removed = 0;

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with(BACKUP_PREFIX) {
            continue;
        }

        let path = entry.path();
        let modified = match tokio_fs::metadata(&path).await {
            Ok(metadata) if !metadata.is_file() => continue,
            Ok(metadata) => metadata.modified(),
            Err(e) => Err(e),
        };
        match modified {
            Ok(modified) if modified >= cutoff => continue,
            Ok(_) => {}
            Err(e) => {
                warn!("Skipping {}: {}", path.display(), e);
                continue;
            }
        }

        debug!("Deleting expired backup {}", path.display());
        match tokio_fs::remove_file(&path).await {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to delete {}: {}", path.display(), e),
        }
    }

    Ok(removed)
}
