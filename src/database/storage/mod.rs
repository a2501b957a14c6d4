//! Storage module for replicating backup artifacts
//!
//! The primary artifact always lives in the configured backup directory.
//! A [`ReplicaStore`] receives a copy of every finished artifact, so that a
//! second location can be swapped in without touching the orchestrator.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::BackupConfig;
use crate::database::Result;

// Re-export storage implementations
pub mod local_storage;

/// Destination that finished backup artifacts are copied to
#[async_trait]
pub trait ReplicaStore: Send + Sync {
    /// Copy a finished artifact into the replica
    ///
    /// # Arguments
    /// * `artifact` - Path of the final (possibly compressed) artifact
    ///
    /// Returns the location of the copy
    async fn store_backup(&self, artifact: &Path) -> Result<PathBuf>;

    /// List artifact file names in the replica, newest first
    async fn list_backups(&self) -> Result<Vec<String>>;

    /// Human-readable description of the replica location
    fn location(&self) -> String;
}

/// Create the replica store configured for this host, if any
pub fn create_replica_store(config: &BackupConfig) -> Option<Arc<dyn ReplicaStore>> {
    config.secondary_dir.as_ref().map(|dir| {
        Arc::new(local_storage::LocalDirectoryReplica::new(dir.clone())) as Arc<dyn ReplicaStore>
    })
}
