//! Automated restore drills
//!
//! A drill restores a backup artifact into a freshly created, uniquely named
//! database, inspects the result and then destroys that database again. The
//! ephemeral database and any decompressed temp file are owned by a
//! [`DrillScope`], which is released on every exit path.
//!
//! Only a failed restore (or a schema that cannot even be listed) fails the
//! drill. Missing tables, missing foreign keys, orphaned rows and row count
//! errors are advisory and show up as warnings and flags on the result.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::fs as tokio_fs;
use tracing::{debug, error, info, warn};

use crate::config::{BackupConfig, OrphanCheck, RestoreDrillConfig};
use crate::database::backup_naming::ephemeral_database_name;
use crate::database::compression::CompressionBackend;
use crate::database::engine::{DatabaseEngine, query_count, quote_ident};
use crate::database::storage::local_storage::latest_backup_file;
use crate::database::{DatabaseError, Result, serialize_millis};

const LIST_TABLES_SQL: &str = "SELECT table_name FROM information_schema.tables \
     WHERE table_schema = 'public' AND table_type = 'BASE TABLE' ORDER BY table_name";

const COUNT_FOREIGN_KEYS_SQL: &str = "SELECT COUNT(*) FROM information_schema.table_constraints \
     WHERE constraint_type = 'FOREIGN KEY' AND table_schema = 'public'";

/// Row count recorded when a table could not be counted
pub const ROW_COUNT_UNAVAILABLE: i64 = -1;

/// Outcome of one restore drill
#[derive(Debug, Clone, Serialize)]
pub struct RestoreTestResult {
    pub success: bool,
    pub test_db_name: String,
    /// Number of tables found after the restore
    pub tables_created: usize,
    /// Expected tables that were present
    pub tables_verified: Vec<String>,
    pub foreign_keys_verified: bool,
    pub data_integrity_passed: bool,
    pub row_counts: BTreeMap<String, i64>,
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
    pub warnings: Vec<String>,
    pub error: Option<String>,
}

impl RestoreTestResult {
    fn new(test_db_name: String) -> Self {
        Self {
            success: false,
            test_db_name,
            tables_created: 0,
            tables_verified: Vec::new(),
            foreign_keys_verified: false,
            data_integrity_passed: false,
            row_counts: BTreeMap::new(),
            duration: Duration::ZERO,
            warnings: Vec::new(),
            error: None,
        }
    }

    fn warn(&mut self, message: String) {
        warn!("{}", message);
        self.warnings.push(message);
    }
}

/// Resources acquired by a drill: the ephemeral database and the
/// decompressed temp file
///
/// `release` must be awaited on the normal path. If the scope is dropped
/// without it (panic, cancelled future), the temp file is removed
/// synchronously and the database drop is spawned onto the runtime.
struct DrillScope {
    engine: Arc<dyn DatabaseEngine>,
    database: String,
    database_requested: bool,
    temp_file: Option<PathBuf>,
    released: bool,
}

impl DrillScope {
    fn new(engine: Arc<dyn DatabaseEngine>, database: String) -> Self {
        Self {
            engine,
            database,
            database_requested: false,
            temp_file: None,
            released: false,
        }
    }

    /// Remove the temp file and drop the database, returning any failures as warnings
    async fn release(mut self) -> Vec<String> {
        self.released = true;
        let mut warnings = Vec::new();

        if let Some(file) = self.temp_file.take() {
            match tokio_fs::remove_file(&file).await {
                Ok(()) => debug!("Removed temporary file {}", file.display()),
                Err(e) => {
                    let message = format!("Failed to remove temporary file {}: {}", file.display(), e);
                    warn!("{}", message);
                    warnings.push(message);
                }
            }
        }

        if self.database_requested {
            match self.engine.drop_database(&self.database).await {
                Ok(()) => info!("Dropped test database {}", self.database),
                Err(e) => {
                    let message = format!("Failed to drop test database {}: {}", self.database, e);
                    warn!("{}", message);
                    warnings.push(message);
                }
            }
        }

        warnings
    }
}

impl Drop for DrillScope {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        if let Some(file) = self.temp_file.take() {
            if let Err(e) = std::fs::remove_file(&file) {
                error!("Failed to remove temporary file {}: {}", file.display(), e);
            }
        }

        if self.database_requested {
            let engine = self.engine.clone();
            let database = self.database.clone();
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Err(e) = engine.drop_database(&database).await {
                            error!("Failed to drop abandoned test database {}: {}", database, e);
                        }
                    });
                }
                Err(_) => error!("Test database {} was abandoned and must be dropped manually", database),
            }
        }
    }
}

/// Restores backups into throwaway databases and checks what comes back
pub struct RestoreDrill {
    engine: Arc<dyn DatabaseEngine>,
    compression: Arc<CompressionBackend>,
    settings: RestoreDrillConfig,
    backup_dir: PathBuf,
}

impl RestoreDrill {
    pub fn new(
        config: &BackupConfig,
        engine: Arc<dyn DatabaseEngine>,
        compression: Arc<CompressionBackend>,
    ) -> Self {
        Self {
            engine,
            compression,
            settings: config.restore_drill.clone(),
            backup_dir: config.backup_dir.clone(),
        }
    }

    /// Run a drill against the most recent backup in the backup directory
    pub async fn test_latest_backup(&self) -> RestoreTestResult {
        match latest_backup_file(&self.backup_dir).await {
            Ok(Some(latest)) => self.test_restore(&latest).await,
            Ok(None) => self.failed_before_start(DatabaseError::BackupNotFound(format!(
                "no backups in {}",
                self.backup_dir.display()
            ))),
            Err(e) => self.failed_before_start(e),
        }
    }

    fn failed_before_start(&self, e: DatabaseError) -> RestoreTestResult {
        error!("Restore drill could not start: {}", e);
        let mut result = RestoreTestResult::new(String::new());
        result.error = Some(e.to_string());
        result
    }

    /// Restore `artifact` into an ephemeral database and verify it
    ///
    /// Never fails: every error ends up in the returned result.
    pub async fn test_restore(&self, artifact: &Path) -> RestoreTestResult {
        let start_time = Instant::now();
        let test_db = ephemeral_database_name(&self.settings.database_prefix);
        info!("Starting restore drill of {} into {}", artifact.display(), test_db);

        let mut result = RestoreTestResult::new(test_db.clone());
        let mut database_requested = false;
        if let Err(e) = self.run_drill(artifact, &mut result, &mut database_requested).await {
            error!("Restore drill of {} failed: {}", artifact.display(), e);

            // Independent second attempt, only once creation was attempted
            if database_requested {
                if let Err(drop_err) = self.engine.drop_database(&test_db).await {
                    result.warn(format!("Failed to drop test database {}: {}", test_db, drop_err));
                }
            }
            result.success = false;
            result.error = Some(e.to_string());
        }

        result.duration = start_time.elapsed();
        info!(
            "Restore drill finished in {:?}: success={}, {} warnings",
            result.duration,
            result.success,
            result.warnings.len()
        );
        result
    }

    async fn run_drill(
        &self,
        artifact: &Path,
        result: &mut RestoreTestResult,
        database_requested: &mut bool,
    ) -> Result<()> {
        if !tokio_fs::try_exists(artifact).await? {
            return Err(DatabaseError::BackupNotFound(artifact.display().to_string()));
        }

        let mut scope = DrillScope::new(self.engine.clone(), result.test_db_name.clone());

        let restore_source = match CompressionBackend::decompressed_path(artifact) {
            Some(_) => {
                let decompressed = self.compression.decompress(artifact).await?;
                scope.temp_file = Some(decompressed.clone());
                decompressed
            }
            None => artifact.to_path_buf(),
        };

        let outcome = self.restore_and_check(&mut scope, &restore_source, result).await;
        *database_requested = scope.database_requested;
        let teardown_warnings = scope.release().await;
        result.warnings.extend(teardown_warnings);
        outcome
    }

    async fn restore_and_check(
        &self,
        scope: &mut DrillScope,
        source: &Path,
        result: &mut RestoreTestResult,
    ) -> Result<()> {
        let database = scope.database.clone();

        scope.database_requested = true;
        self.engine.create_database(&database).await?;
        debug!("Created test database {}", database);

        self.engine.execute_sql_file(&database, source).await?;
        info!("Restored {} into {}", source.display(), database);

        self.check_tables(&database, result).await?;
        result.success = true;

        self.check_foreign_keys(&database, result).await;
        self.check_orphans(&database, result).await;
        self.count_rows(&database, result).await;
        Ok(())
    }

    async fn check_tables(&self, database: &str, result: &mut RestoreTestResult) -> Result<()> {
        let tables = self.engine.query(database, LIST_TABLES_SQL).await?;
        result.tables_created = tables.len();

        for expected in &self.settings.expected_tables {
            if tables.iter().any(|t| t == expected) {
                result.tables_verified.push(expected.clone());
            } else {
                result.warn(format!("Expected table {} is missing from the restored schema", expected));
            }
        }
        Ok(())
    }

    async fn check_foreign_keys(&self, database: &str, result: &mut RestoreTestResult) {
        match query_count(self.engine.as_ref(), database, COUNT_FOREIGN_KEYS_SQL).await {
            Ok(0) => result.warn(String::from("No foreign key constraints found in the restored schema")),
            Ok(count) => {
                debug!("{} foreign key constraints restored", count);
                result.foreign_keys_verified = true;
            }
            Err(e) => result.warn(format!("Could not count foreign keys: {}", e)),
        }
    }

    async fn check_orphans(&self, database: &str, result: &mut RestoreTestResult) {
        result.data_integrity_passed = true;

        for check in &self.settings.orphan_checks {
            let counted = match orphan_query(check) {
                Ok(sql) => query_count(self.engine.as_ref(), database, &sql).await,
                Err(e) => Err(e),
            };
            match counted {
                Ok(0) => {}
                Ok(orphans) => {
                    result.data_integrity_passed = false;
                    result.warn(format!(
                        "{} rows in {}.{} reference missing {}.{}",
                        orphans, check.child_table, check.child_column, check.parent_table, check.parent_column
                    ));
                }
                Err(e) => {
                    result.data_integrity_passed = false;
                    result.warn(format!(
                        "Could not check {} for orphaned rows: {}",
                        check.child_table, e
                    ));
                }
            }
        }
    }

    async fn count_rows(&self, database: &str, result: &mut RestoreTestResult) {
        for table in &self.settings.row_count_tables {
            let counted = match quote_ident(table) {
                Ok(quoted) => {
                    let sql = format!("SELECT COUNT(*) FROM {}", quoted);
                    query_count(self.engine.as_ref(), database, &sql).await
                }
                Err(e) => Err(e),
            };
            let count = match counted {
                Ok(count) => count,
                Err(e) => {
                    result.warn(format!("Could not count rows of {}: {}", table, e));
                    ROW_COUNT_UNAVAILABLE
                }
            };
            result.row_counts.insert(table.clone(), count);
        }
    }
}

/// Anti-join counting child rows whose parent does not exist
fn orphan_query(check: &OrphanCheck) -> Result<String> {
    let child = quote_ident(&check.child_table)?;
    let child_column = quote_ident(&check.child_column)?;
    let parent = quote_ident(&check.parent_table)?;
    let parent_column = quote_ident(&check.parent_column)?;
    Ok(format!(
        "SELECT COUNT(*) FROM {child} c LEFT JOIN {parent} p ON c.{child_column} = p.{parent_column} \
         WHERE c.{child_column} IS NOT NULL AND p.{parent_column} IS NULL"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::compression::{Platform, ToolSupport};
    use crate::database::engine::fake::FakeEngine;
    use crate::database::process::MockCommandRunner;
    use tempfile::{TempDir, tempdir};

    const ALL_TABLES: &[&str] = &[
        "users",
        "profile_types",
        "cutting_lists",
        "cutting_list_items",
        "production_plans",
        "production_plan_items",
        "optimization_results",
    ];

    fn script(tables: &[&str], with_foreign_keys: bool) -> String {
        let mut sql = String::from("--\n-- PostgreSQL database dump\n--\n");
        for table in tables {
            sql.push_str(&format!("CREATE TABLE public.{} (\n    id integer NOT NULL\n);\n", table));
        }
        if with_foreign_keys {
            sql.push_str(
                "ALTER TABLE ONLY public.cutting_list_items ADD CONSTRAINT fk_list \
                 FOREIGN KEY (cutting_list_id) REFERENCES public.cutting_lists(id);\n",
            );
        }
        sql
    }

    fn engine_with(configure: impl FnOnce(&mut FakeEngine)) -> Arc<FakeEngine> {
        let mut engine = FakeEngine::default();
        engine.row_counts = [("users", 3), ("cutting_lists", 2), ("cutting_list_items", 7), ("production_plans", 1)]
            .into_iter()
            .map(|(t, n)| (t.to_string(), n))
            .collect();
        configure(&mut engine);
        Arc::new(engine)
    }

    fn drill(temp_dir: &TempDir, engine: Arc<FakeEngine>, platform: Platform) -> RestoreDrill {
        let config = BackupConfig {
            backup_dir: temp_dir.path().to_path_buf(),
            ..BackupConfig::default()
        };
        let mut runner = MockCommandRunner::new();
        runner.expect_run().never();
        let compression = Arc::new(CompressionBackend::new(
            Arc::new(runner),
            ToolSupport::none(platform),
            Duration::from_secs(30),
        ));
        RestoreDrill::new(&config, engine, compression)
    }

    fn write_artifact(temp_dir: &TempDir, name: &str, contents: &str) -> PathBuf {
        let path = temp_dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn gzip_artifact(temp_dir: &TempDir, name: &str, contents: &str) -> PathBuf {
        let raw = write_artifact(temp_dir, name, contents);
        let packed = PathBuf::from(format!("{}.gz", raw.display()));
        crate::database::compression::gzip_file(&raw, &packed, 6).unwrap();
        std::fs::remove_file(&raw).unwrap();
        packed
    }

    #[tokio::test]
    async fn test_successful_drill_tears_down() {
        let temp_dir = tempdir().unwrap();
        let artifact = write_artifact(&temp_dir, "backup_full_a.sql", &script(ALL_TABLES, true));
        let engine = engine_with(|_| {});

        let result = drill(&temp_dir, engine.clone(), Platform::Posix).test_restore(&artifact).await;

        assert!(result.success, "{:?}", result.error);
        assert!(result.warnings.is_empty(), "{:?}", result.warnings);
        assert_eq!(result.tables_created, ALL_TABLES.len());
        assert_eq!(result.tables_verified.len(), ALL_TABLES.len());
        assert!(result.foreign_keys_verified);
        assert!(result.data_integrity_passed);
        assert_eq!(result.row_counts["cutting_list_items"], 7);
        assert!(result.test_db_name.starts_with("restore_test_"));
        assert_eq!(engine.created(), vec![result.test_db_name.clone()]);
        assert!(!engine.exists(&result.test_db_name));
        assert_eq!(engine.drop_attempts(&result.test_db_name), 1);
        assert!(artifact.exists());
    }

    #[tokio::test]
    async fn test_compressed_artifact_leaves_no_temp_file() {
        let temp_dir = tempdir().unwrap();
        let artifact = gzip_artifact(&temp_dir, "backup_full_a.sql", &script(ALL_TABLES, true));
        let engine = engine_with(|_| {});

        let result = drill(&temp_dir, engine.clone(), Platform::Windows).test_restore(&artifact).await;

        assert!(result.success, "{:?}", result.error);
        assert!(artifact.exists());
        assert!(!temp_dir.path().join("backup_full_a.sql").exists());
        assert!(!engine.exists(&result.test_db_name));
    }

    #[tokio::test]
    async fn test_missing_expected_table_is_a_warning() {
        let temp_dir = tempdir().unwrap();
        let tables: Vec<&str> = ALL_TABLES.iter().copied().filter(|t| *t != "profile_types").collect();
        let artifact = write_artifact(&temp_dir, "backup_full_a.sql", &script(&tables, true));

        let result = drill(&temp_dir, engine_with(|_| {}), Platform::Posix)
            .test_restore(&artifact)
            .await;

        assert!(result.success);
        assert!(!result.tables_verified.contains(&"profile_types".to_string()));
        assert!(result.warnings.iter().any(|w| w.contains("profile_types")));
    }

    #[tokio::test]
    async fn test_orphaned_rows_fail_integrity_but_not_drill() {
        let temp_dir = tempdir().unwrap();
        let artifact = write_artifact(&temp_dir, "backup_full_a.sql", &script(ALL_TABLES, true));
        let engine = engine_with(|e| e.orphan_rows = 4);

        let result = drill(&temp_dir, engine, Platform::Posix).test_restore(&artifact).await;

        assert!(result.success);
        assert!(!result.data_integrity_passed);
        assert!(result.warnings.iter().any(|w| w.contains("cutting_list_items.cutting_list_id")));
    }

    #[tokio::test]
    async fn test_missing_foreign_keys_is_a_warning() {
        let temp_dir = tempdir().unwrap();
        let artifact = write_artifact(&temp_dir, "backup_full_a.sql", &script(ALL_TABLES, false));

        let result = drill(&temp_dir, engine_with(|_| {}), Platform::Posix)
            .test_restore(&artifact)
            .await;

        assert!(result.success);
        assert!(!result.foreign_keys_verified);
        assert!(result.warnings.iter().any(|w| w.contains("foreign key")));
    }

    #[tokio::test]
    async fn test_uncountable_table_gets_sentinel() {
        let temp_dir = tempdir().unwrap();
        let artifact = write_artifact(&temp_dir, "backup_full_a.sql", &script(ALL_TABLES, true));
        let engine = engine_with(|e| {
            e.row_counts.remove("production_plans");
        });

        let result = drill(&temp_dir, engine, Platform::Posix).test_restore(&artifact).await;

        assert!(result.success);
        assert_eq!(result.row_counts["production_plans"], ROW_COUNT_UNAVAILABLE);
        assert_eq!(result.row_counts["users"], 3);
    }

    #[tokio::test]
    async fn test_restore_failure_still_tears_down() {
        let temp_dir = tempdir().unwrap();
        let artifact = gzip_artifact(&temp_dir, "backup_full_a.sql", &script(ALL_TABLES, true));
        let engine = engine_with(|e| e.fail_restore = true);

        let result = drill(&temp_dir, engine.clone(), Platform::Windows).test_restore(&artifact).await;

        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("psql"));
        assert!(result.duration > Duration::ZERO);
        assert!(!engine.exists(&result.test_db_name));
        assert_eq!(engine.drop_attempts(&result.test_db_name), 2);
        assert!(!temp_dir.path().join("backup_full_a.sql").exists());
    }

    #[tokio::test]
    async fn test_unlistable_schema_fails_drill() {
        let temp_dir = tempdir().unwrap();
        let artifact = write_artifact(&temp_dir, "backup_full_a.sql", &script(ALL_TABLES, true));
        let engine = engine_with(|e| e.fail_table_listing = true);

        let result = drill(&temp_dir, engine.clone(), Platform::Posix).test_restore(&artifact).await;

        assert!(!result.success);
        assert!(!engine.exists(&result.test_db_name));
    }

    #[tokio::test]
    async fn test_teardown_failure_becomes_warning() {
        let temp_dir = tempdir().unwrap();
        let artifact = write_artifact(&temp_dir, "backup_full_a.sql", &script(ALL_TABLES, true));
        let engine = engine_with(|e| e.fail_drop = true);

        let result = drill(&temp_dir, engine, Platform::Posix).test_restore(&artifact).await;

        assert!(result.success);
        assert!(result.warnings.iter().any(|w| w.contains("Failed to drop test database")));
    }

    #[tokio::test]
    async fn test_missing_artifact_fails_fast() {
        let temp_dir = tempdir().unwrap();
        let engine = engine_with(|_| {});

        let result = drill(&temp_dir, engine.clone(), Platform::Posix)
            .test_restore(&temp_dir.path().join("backup_full_missing.sql.gz"))
            .await;

        assert!(!result.success);
        assert!(result.error.unwrap().contains("not found"));
        assert!(engine.created().is_empty());
    }

    #[tokio::test]
    async fn test_missing_artifact_never_touches_server() {
        let temp_dir = tempdir().unwrap();
        let engine = engine_with(|e| e.fail_drop = true);

        let result = drill(&temp_dir, engine.clone(), Platform::Posix)
            .test_restore(&temp_dir.path().join("backup_full_missing.sql"))
            .await;

        assert!(!result.success);
        assert!(result.warnings.is_empty(), "{:?}", result.warnings);
        assert!(engine.created().is_empty());
        assert_eq!(engine.drop_attempts(&result.test_db_name), 0);
    }

    #[tokio::test]
    async fn test_bzip2_artifact_on_windows_is_rejected() {
        let temp_dir = tempdir().unwrap();
        let artifact = write_artifact(&temp_dir, "backup_full_a.sql.bz2", "BZh9");
        let engine = engine_with(|_| {});

        let result = drill(&temp_dir, engine.clone(), Platform::Windows).test_restore(&artifact).await;

        assert!(!result.success);
        assert!(result.error.unwrap().contains("use gzip instead"));
        assert!(engine.created().is_empty());
        assert_eq!(engine.drop_attempts(&result.test_db_name), 0);
    }

    #[tokio::test]
    async fn test_existing_sibling_is_not_overwritten() {
        let temp_dir = tempdir().unwrap();
        let artifact = gzip_artifact(&temp_dir, "backup_full_a.sql", &script(ALL_TABLES, true));
        let sibling = write_artifact(&temp_dir, "backup_full_a.sql", "precious");

        let result = drill(&temp_dir, engine_with(|_| {}), Platform::Windows)
            .test_restore(&artifact)
            .await;

        assert!(!result.success);
        assert_eq!(std::fs::read_to_string(sibling).unwrap(), "precious");
    }

    #[tokio::test]
    async fn test_latest_backup_is_selected() {
        let temp_dir = tempdir().unwrap();
        write_artifact(&temp_dir, "backup_full_2025-01-01T00-00-00-000Z.sql", "not sql at all");
        gzip_artifact(&temp_dir, "backup_full_2025-02-01T00-00-00-000Z.sql", &script(ALL_TABLES, true));

        let result = drill(&temp_dir, engine_with(|_| {}), Platform::Windows)
            .test_latest_backup()
            .await;

        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.tables_created, ALL_TABLES.len());
    }

    #[tokio::test]
    async fn test_latest_backup_without_backups() {
        let temp_dir = tempdir().unwrap();
        let engine = engine_with(|_| {});

        let result = drill(&temp_dir, engine.clone(), Platform::Posix).test_latest_backup().await;

        assert!(!result.success);
        assert!(result.error.is_some());
        assert!(engine.created().is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_scope_drops_database() {
        let temp_dir = tempdir().unwrap();
        let temp_file = write_artifact(&temp_dir, "backup_full_a.sql", "x");
        let engine = engine_with(|_| {});
        engine.create_database("restore_test_abandoned").await.unwrap();

        {
            let mut scope = DrillScope::new(engine.clone(), "restore_test_abandoned".to_string());
            scope.database_requested = true;
            scope.temp_file = Some(temp_file.clone());
        }
        // Let the spawned drop run
        tokio::task::yield_now().await;

        assert!(!temp_file.exists());
        assert!(!engine.exists("restore_test_abandoned"));
    }

    #[test]
    fn test_orphan_query_rejects_bad_identifiers() {
        let check = OrphanCheck {
            child_table: "items; DROP TABLE users".to_string(),
            child_column: "list_id".to_string(),
            parent_table: "lists".to_string(),
            parent_column: "id".to_string(),
        };

        assert!(orphan_query(&check).is_err());
    }
}
