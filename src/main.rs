use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use dotenv::dotenv;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

mod config;
mod database;

use config::BackupConfig;
use database::backup::{BackupManager, BackupResult};
use database::backup_naming::{file_name_of, parse_backup_timestamp};
use database::compression::{CompressionBackend, ToolSupport};
use database::engine::{DatabaseEngine, PostgresCli};
use database::process::{CommandRunner, TokioCommandRunner};
use database::restore::{RestoreDrill, RestoreTestResult};
use database::stats::get_stats;
use database::storage::create_replica_store;

#[derive(Parser)]
#[command(name = "pg-backup-drill", version, about = "PostgreSQL backups with verification and restore drills")]
struct Cli {
    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Log filter, overrides RUST_LOG (e.g. "debug")
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Take a full backup
    Backup,
    /// Delete backups outside the retention window
    Cleanup,
    /// Verify a backup artifact
    Verify { path: PathBuf },
    /// Restore an artifact into a throwaway database and check it
    TestRestore { path: PathBuf },
    /// Run a restore drill against the newest backup
    TestLatest,
    /// Show backup statistics
    Stats,
    /// List backups, newest first
    List,
}

// Wiring shared by the subcommands
struct App {
    config: BackupConfig,
    engine: Arc<dyn DatabaseEngine>,
    compression: Arc<CompressionBackend>,
}

impl App {
    fn new(config: BackupConfig) -> Self {
        let runner: Arc<dyn CommandRunner> = Arc::new(TokioCommandRunner::new());
        let tools = ToolSupport::detect(runner.as_ref());
        let engine = Arc::new(PostgresCli::new(
            config.database.clone(),
            runner.clone(),
            config.command_timeout,
        ));
        let compression = Arc::new(CompressionBackend::new(runner, tools, config.command_timeout));
        Self {
            config,
            engine,
            compression,
        }
    }

    fn backup_manager(&self) -> BackupManager {
        BackupManager::new(
            self.config.clone(),
            self.engine.clone(),
            self.compression.clone(),
            create_replica_store(&self.config),
        )
    }

    fn restore_drill(&self) -> RestoreDrill {
        RestoreDrill::new(&self.config, self.engine.clone(), self.compression.clone())
    }
}

fn init_tracing(log_level: Option<&str>) {
    let filter = match log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Failed to serialize result: {}", e),
    }
}

fn exit_code(success: bool) -> ExitCode {
    if success { ExitCode::SUCCESS } else { ExitCode::FAILURE }
}

fn print_warnings(warnings: &[String]) {
    for warning in warnings {
        println!("  warning: {}", warning);
    }
}

fn report_backup(result: &BackupResult, json: bool) -> ExitCode {
    if json {
        print_json(result);
    } else if result.success {
        println!("Backup created: {}", result.file_path.display());
        println!("  size: {} bytes", result.size);
        if let Some(compressed) = result.compressed_size {
            println!("  compressed ({}): {} bytes", result.algorithm, compressed);
        }
        println!("  duration: {:.1?}", result.duration);
        print_warnings(&result.warnings);
    } else {
        println!("Backup failed: {}", result.error.as_deref().unwrap_or("unknown error"));
        print_warnings(&result.warnings);
    }
    exit_code(result.success)
}

fn report_restore(result: &RestoreTestResult, json: bool) -> ExitCode {
    if json {
        print_json(result);
    } else {
        let status = if result.success { "passed" } else { "failed" };
        println!("Restore drill {} ({})", status, result.test_db_name);
        if let Some(error) = &result.error {
            println!("  error: {}", error);
        }
        println!("  tables created: {}", result.tables_created);
        println!("  tables verified: {}", result.tables_verified.join(", "));
        println!("  foreign keys verified: {}", result.foreign_keys_verified);
        println!("  data integrity passed: {}", result.data_integrity_passed);
        for (table, count) in &result.row_counts {
            println!("  rows in {}: {}", table, count);
        }
        println!("  duration: {:.1?}", result.duration);
        print_warnings(&result.warnings);
    }
    exit_code(result.success)
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file
    dotenv().ok();

    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    let app = App::new(BackupConfig::from_env());

    match cli.command {
        Commands::Backup => {
            let result = app.backup_manager().create_full_backup().await;
            report_backup(&result, cli.json)
        }
        Commands::Cleanup => match app.backup_manager().cleanup().await {
            Ok(summary) => {
                if cli.json {
                    print_json(&summary);
                } else {
                    println!(
                        "Removed {} primary and {} secondary backups",
                        summary.primary, summary.secondary
                    );
                }
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Cleanup failed: {}", e);
                ExitCode::FAILURE
            }
        },
        Commands::Verify { path } => {
            let manager = app.backup_manager();
            if cli.json {
                let report = manager.inspect_backup(&path).await;
                print_json(&report);
                exit_code(report.passed)
            } else {
                // Warnings are already logged to stderr
                let passed = manager.verify_backup(&path).await;
                println!("{}: {}", path.display(), if passed { "OK" } else { "FAILED" });
                exit_code(passed)
            }
        }
        Commands::TestRestore { path } => {
            let result = app.restore_drill().test_restore(&path).await;
            report_restore(&result, cli.json)
        }
        Commands::TestLatest => {
            let result = app.restore_drill().test_latest_backup().await;
            report_restore(&result, cli.json)
        }
        Commands::Stats => {
            let stats = get_stats(&app.config.backup_dir).await;
            if cli.json {
                print_json(&stats);
            } else {
                println!("Backups: {}", stats.total_backups);
                println!("Total size: {} bytes", stats.total_size);
                if let (Some(oldest), Some(newest)) = (stats.oldest_backup, stats.newest_backup) {
                    println!("Oldest: {}", oldest.to_rfc3339());
                    println!("Newest: {}", newest.to_rfc3339());
                }
            }
            ExitCode::SUCCESS
        }
        Commands::List => {
            let manager = app.backup_manager();
            let backups = match manager.list_backups().await {
                Ok(backups) => backups,
                Err(e) => {
                    eprintln!("Failed to list backups: {}", e);
                    return ExitCode::FAILURE;
                }
            };
            for path in backups {
                let name = file_name_of(&path).unwrap_or_default();
                match parse_backup_timestamp(name) {
                    Some(taken) => println!("{}  {}", taken.to_rfc3339(), path.display()),
                    None => println!("{}", path.display()),
                }
            }

            match manager.list_replica_backups().await {
                Some((location, Ok(names))) => {
                    println!("Replica {}: {} backups", location, names.len());
                    for name in names {
                        println!("  {}", name);
                    }
                }
                Some((location, Err(e))) => eprintln!("Failed to list replica {}: {}", location, e),
                None => {}
            }
            ExitCode::SUCCESS
        }
    }
}
