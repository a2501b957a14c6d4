use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::database::compression::CompressionAlgorithm;

/// Connection parameters handed to the PostgreSQL command-line tools
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    /// Passed to child processes through `PGPASSWORD`, never on the command line
    pub password: Option<String>,
    /// Database that full backups are taken from
    pub name: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: String::from("localhost"),
            port: 5432,
            user: String::from("postgres"),
            password: None,
            name: String::from("postgres"),
        }
    }
}

/// Compression settings applied to fresh dumps
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    pub enabled: bool,
    pub algorithm: CompressionAlgorithm,
    /// Compression level, 1 (fastest) to 9 (smallest)
    pub level: u32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            algorithm: CompressionAlgorithm::Gzip,
            level: 6,
        }
    }
}

/// A parent/child pair checked for orphaned child rows after a restore
#[derive(Debug, Clone, PartialEq)]
pub struct OrphanCheck {
    pub child_table: String,
    pub child_column: String,
    pub parent_table: String,
    pub parent_column: String,
}

/// What a restore drill checks inside the ephemeral database
#[derive(Debug, Clone)]
pub struct RestoreDrillConfig {
    /// Prefix of the throwaway database name
    pub database_prefix: String,
    /// Tables every restored backup is expected to contain
    pub expected_tables: Vec<String>,
    /// Tables whose row counts are reported for diagnostics
    pub row_count_tables: Vec<String>,
    /// Relationships checked for orphaned rows
    pub orphan_checks: Vec<OrphanCheck>,
}

impl Default for RestoreDrillConfig {
    fn default() -> Self {
        Self {
            database_prefix: String::from("restore_test"),
            expected_tables: to_strings(&[
                "users",
                "profile_types",
                "cutting_lists",
                "cutting_list_items",
                "production_plans",
                "production_plan_items",
                "optimization_results",
            ]),
            row_count_tables: to_strings(&[
                "users",
                "cutting_lists",
                "cutting_list_items",
                "production_plans",
            ]),
            orphan_checks: vec![OrphanCheck {
                child_table: String::from("cutting_list_items"),
                child_column: String::from("cutting_list_id"),
                parent_table: String::from("cutting_lists"),
                parent_column: String::from("id"),
            }],
        }
    }
}

impl OrphanCheck {
    /// Parse `child_table.child_column=parent_table.parent_column`
    pub fn parse(raw: &str) -> Option<Self> {
        let (child, parent) = raw.split_once('=')?;
        let (child_table, child_column) = child.trim().split_once('.')?;
        let (parent_table, parent_column) = parent.trim().split_once('.')?;
        let parts = [child_table, child_column, parent_table, parent_column];
        if parts.iter().any(|p| p.trim().is_empty()) {
            return None;
        }
        Some(Self {
            child_table: child_table.trim().to_string(),
            child_column: child_column.trim().to_string(),
            parent_table: parent_table.trim().to_string(),
            parent_column: parent_column.trim().to_string(),
        })
    }
}

/// Configuration for database backup and restore functionality
#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// Primary directory holding backup artifacts
    pub backup_dir: PathBuf,
    /// Optional directory every finished artifact is replicated to
    pub secondary_dir: Option<PathBuf>,
    /// Artifacts older than this many days are removed by cleanup
    pub retention_days: u32,
    pub compression: CompressionConfig,
    /// Verify the artifact right after a backup completes
    pub verify_after_backup: bool,
    /// Upper bound for every external command
    pub command_timeout: Duration,
    pub database: DatabaseConfig,
    pub restore_drill: RestoreDrillConfig,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            backup_dir: PathBuf::from("./backups"),
            secondary_dir: None,
            retention_days: 30,
            compression: CompressionConfig::default(),
            verify_after_backup: false,
            command_timeout: Duration::from_secs(3600),
            database: DatabaseConfig::default(),
            restore_drill: RestoreDrillConfig::default(),
        }
    }
}

impl BackupConfig {
    /// Load backup configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let backup_dir = env::var("BACKUP_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.backup_dir);

        let secondary_dir = env::var("BACKUP_SECONDARY_DIR")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        let retention_days = parse_var("BACKUP_RETENTION_DAYS").unwrap_or(defaults.retention_days);

        let compression = CompressionConfig {
            enabled: bool_var("BACKUP_COMPRESSION_ENABLED").unwrap_or(defaults.compression.enabled),
            algorithm: parse_var("BACKUP_COMPRESSION_ALGORITHM")
                .unwrap_or(defaults.compression.algorithm),
            level: parse_var::<u32>("BACKUP_COMPRESSION_LEVEL")
                .unwrap_or(defaults.compression.level)
                .clamp(1, 9),
        };

        let verify_after_backup = bool_var("BACKUP_VERIFY").unwrap_or(false);

        let command_timeout = parse_var("BACKUP_COMMAND_TIMEOUT_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.command_timeout);

        let database = DatabaseConfig {
            host: env::var("DB_HOST").unwrap_or(defaults.database.host),
            port: parse_var("DB_PORT").unwrap_or(defaults.database.port),
            user: env::var("DB_USER").unwrap_or(defaults.database.user),
            password: env::var("DB_PASSWORD").ok(),
            name: env::var("DB_NAME").unwrap_or(defaults.database.name),
        };

        let mut restore_drill = defaults.restore_drill;
        if let Ok(prefix) = env::var("RESTORE_TEST_DB_PREFIX") {
            restore_drill.database_prefix = prefix;
        }
        if let Some(tables) = list_var("RESTORE_EXPECTED_TABLES") {
            restore_drill.expected_tables = tables;
        }
        if let Some(tables) = list_var("RESTORE_ROW_COUNT_TABLES") {
            restore_drill.row_count_tables = tables;
        }
        if let Some(checks) = list_var("RESTORE_ORPHAN_CHECKS") {
            restore_drill.orphan_checks = checks.iter().filter_map(|c| OrphanCheck::parse(c)).collect();
        }

        Self {
            backup_dir,
            secondary_dir,
            retention_days,
            compression,
            verify_after_backup,
            command_timeout,
            database,
            restore_drill,
        }
    }

    /// Ensure the primary backup directory exists
    pub async fn ensure_backup_dir(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.backup_dir).await
    }
}

fn to_strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn bool_var(name: &str) -> Option<bool> {
    env::var(name)
        .ok()
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "yes"))
}

fn list_var(name: &str) -> Option<Vec<String>> {
    let raw = env::var(name).ok()?;
    let items: Vec<String> = raw
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if items.is_empty() { None } else { Some(items) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BackupConfig::default();

        assert_eq!(config.retention_days, 30);
        assert!(config.compression.enabled);
        assert_eq!(config.compression.algorithm, CompressionAlgorithm::Gzip);
        assert!(config.secondary_dir.is_none());
        assert!(
            config
                .restore_drill
                .expected_tables
                .contains(&"profile_types".to_string())
        );
        assert_eq!(config.restore_drill.orphan_checks[0].child_table, "cutting_list_items");
    }

    #[test]
    fn test_parse_orphan_check() {
        let check = OrphanCheck::parse("orders.customer_id = customers.id").unwrap();

        assert_eq!(check.child_table, "orders");
        assert_eq!(check.child_column, "customer_id");
        assert_eq!(check.parent_table, "customers");
        assert_eq!(check.parent_column, "id");

        assert!(OrphanCheck::parse("orders.customer_id").is_none());
        assert!(OrphanCheck::parse("orders=customers.id").is_none());
        assert!(OrphanCheck::parse(".customer_id=customers.id").is_none());
    }

    #[tokio::test]
    async fn test_ensure_backup_dir_creates_nested_dirs() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = BackupConfig {
            backup_dir: temp_dir.path().join("a").join("b"),
            ..BackupConfig::default()
        };

        config.ensure_backup_dir().await.unwrap();
        assert!(config.backup_dir.is_dir());
    }
}
