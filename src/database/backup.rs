//! Full database backup orchestration
//!
//! A backup run dumps the source database into a timestamp-named file,
//! optionally compresses it (removing the raw dump afterwards), replicates the
//! final artifact to the secondary location and optionally verifies it.
//! Only directory creation, the dump and compression can fail a run;
//! replication and verification problems are reported as warnings.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs as tokio_fs;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::BackupConfig;
use crate::database::backup_naming::full_backup_file_name;
use crate::database::compression::{CompressionAlgorithm, CompressionBackend};
use crate::database::engine::DatabaseEngine;
use crate::database::retention::{CleanupSummary, RetentionManager};
use crate::database::storage::ReplicaStore;
use crate::database::storage::local_storage::list_backup_files;
use crate::database::verify::{ArtifactVerifier, VerificationReport};
use crate::database::{DatabaseError, Result, serialize_millis};

/// Result of a backup operation
#[derive(Debug, Clone, Serialize)]
pub struct BackupResult {
    pub success: bool,
    /// Final artifact: the compressed file when compression ran, else the raw dump
    pub file_path: PathBuf,
    pub compressed_path: Option<PathBuf>,
    /// Size of the raw dump in bytes
    pub size: u64,
    pub compressed_size: Option<u64>,
    /// Wall-clock time of the whole run
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
    pub created_at: DateTime<Utc>,
    /// Algorithm actually applied, after any fallback
    pub algorithm: CompressionAlgorithm,
    /// Outcome of post-backup verification, when enabled
    pub verified: Option<bool>,
    pub warnings: Vec<String>,
    pub error: Option<String>,
}

impl BackupResult {
    fn pending(file_path: PathBuf, created_at: DateTime<Utc>) -> Self {
        Self {
            success: false,
            file_path,
            compressed_path: None,
            size: 0,
            compressed_size: None,
            duration: Duration::ZERO,
            created_at,
            algorithm: CompressionAlgorithm::None,
            verified: None,
            warnings: Vec::new(),
            error: None,
        }
    }
}

/// Drives dump, compression, replication and verification of full backups
pub struct BackupManager {
    config: BackupConfig,
    engine: Arc<dyn DatabaseEngine>,
    compression: Arc<CompressionBackend>,
    verifier: ArtifactVerifier,
    retention: RetentionManager,
    /// Optional replica receiving a copy of every artifact
    replica: Option<Arc<dyn ReplicaStore>>,
    /// Serializes backups and cleanups started through this manager
    backup_mutex: Mutex<()>,
}

impl BackupManager {
    /// Create a new backup manager
    pub fn new(
        config: BackupConfig,
        engine: Arc<dyn DatabaseEngine>,
        compression: Arc<CompressionBackend>,
        replica: Option<Arc<dyn ReplicaStore>>,
    ) -> Self {
        let verifier = ArtifactVerifier::new(
            compression.runner().clone(),
            *compression.tools(),
            config.command_timeout,
        );
        let retention = RetentionManager::new(
            config.backup_dir.clone(),
            config.secondary_dir.clone(),
            config.retention_days,
        );
        Self {
            config,
            engine,
            compression,
            verifier,
            retention,
            replica,
            backup_mutex: Mutex::new(()),
        }
    }

    /// Create a full backup of the database
    ///
    /// Never fails: every error ends up in the returned [`BackupResult`].
    pub async fn create_full_backup(&self) -> BackupResult {
        // Acquire mutex to ensure only one backup runs at a time
        let _lock = self.backup_mutex.lock().await;

        let start_time = Instant::now();
        let created_at = Utc::now();
        let raw_path = self.config.backup_dir.join(full_backup_file_name(created_at));
        let mut result = BackupResult::pending(raw_path.clone(), created_at);

        let outcome = self.run_full_backup(&raw_path, &mut result).await;
        result.duration = start_time.elapsed();

        match outcome {
            Ok(()) => {
                result.success = true;
                info!(
                    "Backup completed in {:?}: {} ({} bytes raw, {:?} bytes compressed)",
                    result.duration,
                    result.file_path.display(),
                    result.size,
                    result.compressed_size
                );
            }
            Err(e) => {
                error!("Backup failed after {:?}: {}", result.duration, e);
                result.error = Some(e.to_string());
            }
        }
        result
    }

    async fn run_full_backup(&self, raw_path: &Path, result: &mut BackupResult) -> Result<()> {
        self.config.ensure_backup_dir().await.map_err(|e| {
            DatabaseError::Config(format!(
                "Failed to create backup directory {}: {}",
                self.config.backup_dir.display(),
                e
            ))
        })?;

        info!("Dumping database to {}", raw_path.display());
        if let Err(e) = self.engine.dump_database(raw_path).await {
            remove_quietly(raw_path).await;
            return Err(e);
        }
        result.size = tokio_fs::metadata(raw_path).await?.len();

        let mut final_path = raw_path.to_path_buf();
        let settings = &self.config.compression;
        if settings.enabled && settings.algorithm != CompressionAlgorithm::None {
            let compressed = self
                .compression
                .compress(raw_path, settings.algorithm, settings.level)
                .await?;
            result.compressed_size = Some(tokio_fs::metadata(&compressed).await?.len());

            // Only one representation of the artifact is kept
            tokio_fs::remove_file(raw_path).await?;

            result.algorithm = CompressionAlgorithm::from_path(&compressed).unwrap_or(settings.algorithm);
            result.compressed_path = Some(compressed.clone());
            final_path = compressed;
        }
        result.file_path = final_path.clone();

        if let Some(replica) = &self.replica {
            match replica.store_backup(&final_path).await {
                Ok(copy) => info!("Replicated backup to {}", copy.display()),
                Err(e) => {
                    error!("Failed to replicate backup to {}: {}", replica.location(), e);
                    result
                        .warnings
                        .push(format!("Secondary replication to {} failed: {}", replica.location(), e));
                }
            }
        }

        if self.config.verify_after_backup {
            let report = self.verifier.inspect(&final_path).await;
            if !report.passed {
                warn!("Verification of {} failed", final_path.display());
                result.warnings.push(format!("Verification of {} failed", final_path.display()));
            }
            result.verified = Some(report.passed);
            result.warnings.extend(report.warnings);
        }

        Ok(())
    }

    /// Whether an existing artifact passes verification
    pub async fn verify_backup(&self, path: &Path) -> bool {
        self.verifier.verify(path).await
    }

    /// Verify an existing artifact and keep the warnings
    pub async fn inspect_backup(&self, path: &Path) -> VerificationReport {
        self.verifier.inspect(path).await
    }

    /// Delete artifacts outside the retention window
    pub async fn cleanup(&self) -> Result<CleanupSummary> {
        let _lock = self.backup_mutex.lock().await;
        self.retention.cleanup().await
    }

    /// List all available backups, newest first
    pub async fn list_backups(&self) -> Result<Vec<PathBuf>> {
        list_backup_files(&self.config.backup_dir).await
    }

    /// Location and contents of the replica, when one is configured
    pub async fn list_replica_backups(&self) -> Option<(String, Result<Vec<String>>)> {
        let replica = self.replica.as_ref()?;
        Some((replica.location(), replica.list_backups().await))
    }
}

async fn remove_quietly(path: &Path) {
    match tokio_fs::remove_file(path).await {
        Ok(()) => warn!("Removed incomplete dump {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove incomplete dump {}: {}", path.display(), e),
    }
}
