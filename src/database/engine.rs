//! Administrative command surface of the database server
//!
//! Dumps, database creation/removal, SQL file execution and ad-hoc queries
//! all go through the PostgreSQL client tools. [`PostgresCli`] builds the
//! argument vectors and hands them to a [`CommandRunner`].

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::DatabaseConfig;
use crate::database::process::{CommandRunner, CommandSpec};
use crate::database::{DatabaseError, Result};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DatabaseEngine: Send + Sync {
    /// Dump the configured source database as plain SQL into `output`
    async fn dump_database(&self, output: &Path) -> Result<()>;

    /// Create an empty database
    async fn create_database(&self, name: &str) -> Result<()>;

    /// Drop a database; succeeds if it does not exist
    async fn drop_database(&self, name: &str) -> Result<()>;

    /// Execute a SQL script against `database`, stopping at the first error
    async fn execute_sql_file(&self, database: &str, file: &Path) -> Result<()>;

    /// Run a query and return one string per result row
    async fn query(&self, database: &str, sql: &str) -> Result<Vec<String>>;
}

/// Run a `SELECT COUNT(*) ...` style query and parse the single value
pub async fn query_count(engine: &dyn DatabaseEngine, database: &str, sql: &str) -> Result<i64> {
    let rows = engine.query(database, sql).await?;
    let first = rows.first().ok_or_else(|| unexpected_output(sql, ""))?;
    first
        .trim()
        .parse()
        .map_err(|_| unexpected_output(sql, first))
}

fn unexpected_output(sql: &str, output: &str) -> DatabaseError {
    DatabaseError::Command {
        program: String::from("psql"),
        code: Some(0),
        stderr: format!("unexpected output {:?} for query {}", output, sql),
    }
}

/// Quote a SQL identifier after checking it is a plain name
pub fn quote_ident(name: &str) -> Result<String> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(DatabaseError::InvalidIdentifier(name.to_string()));
    }
    Ok(format!("\"{}\"", name))
}

/// [`DatabaseEngine`] implemented with `pg_dump`, `createdb`, `dropdb` and `psql`
pub struct PostgresCli {
    connection: DatabaseConfig,
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl PostgresCli {
    pub fn new(connection: DatabaseConfig, runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self {
            connection,
            runner,
            timeout,
        }
    }

    /// Base command carrying connection parameters and credentials
    fn command(&self, program: &str) -> CommandSpec {
        let port = self.connection.port.to_string();
        let mut spec = CommandSpec::new(program)
            .args([
                "-h",
                self.connection.host.as_str(),
                "-p",
                port.as_str(),
                "-U",
                self.connection.user.as_str(),
            ])
            .arg("--no-password")
            .timeout(self.timeout);
        if let Some(password) = &self.connection.password {
            spec = spec.env("PGPASSWORD", password.as_str());
        }
        spec
    }
}

#[async_trait]
impl DatabaseEngine for PostgresCli {
    async fn dump_database(&self, output: &Path) -> Result<()> {
        let spec = self
            .command("pg_dump")
            .args(["-d", self.connection.name.as_str()])
            .args(["--format=plain", "--no-owner", "--no-privileges"])
            .arg("-f")
            .arg(output.to_string_lossy());
        self.runner.run(&spec).await?;
        Ok(())
    }

    async fn create_database(&self, name: &str) -> Result<()> {
        let spec = self.command("createdb").arg(name);
        self.runner.run(&spec).await?;
        Ok(())
    }

    async fn drop_database(&self, name: &str) -> Result<()> {
        let spec = self.command("dropdb").arg("--if-exists").arg(name);
        self.runner.run(&spec).await?;
        Ok(())
    }

    async fn execute_sql_file(&self, database: &str, file: &Path) -> Result<()> {
        let spec = self
            .command("psql")
            .args(["-d", database])
            .args(["-v", "ON_ERROR_STOP=1", "-q", "-f"])
            .arg(file.to_string_lossy());
        self.runner.run(&spec).await?;
        Ok(())
    }

    async fn query(&self, database: &str, sql: &str) -> Result<Vec<String>> {
        let spec = self
            .command("psql")
            .args(["-d", database])
            .args(["-A", "-t", "-c", sql]);
        let output = self.runner.run(&spec).await?;
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::process::{CommandOutput, MockCommandRunner};
    use std::path::PathBuf;

    fn connection() -> DatabaseConfig {
        DatabaseConfig {
            host: "db.internal".to_string(),
            port: 5433,
            user: "backup".to_string(),
            password: Some("s3cret".to_string()),
            name: "production".to_string(),
        }
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("cutting_lists").unwrap(), "\"cutting_lists\"");
        assert_eq!(quote_ident("_t1").unwrap(), "\"_t1\"");
        assert!(quote_ident("").is_err());
        assert!(quote_ident("1table").is_err());
        assert!(quote_ident("users; DROP TABLE users").is_err());
        assert!(quote_ident("a\"b").is_err());
    }

    #[tokio::test]
    async fn test_dump_uses_argument_vector_and_env_password() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|spec: &CommandSpec| {
                spec.program == "pg_dump"
                    && spec.args.windows(2).any(|w| w == ["-h", "db.internal"])
                    && spec.args.windows(2).any(|w| w == ["-p", "5433"])
                    && spec.args.windows(2).any(|w| w == ["-d", "production"])
                    && spec.args.ends_with(&["-f".to_string(), "/backups/out.sql".to_string()])
                    && spec.env == vec![("PGPASSWORD".to_string(), "s3cret".to_string())]
                    && !spec.args.iter().any(|a| a.contains("s3cret"))
                    && spec.timeout == Some(Duration::from_secs(60))
            })
            .times(1)
            .returning(|_| Ok(CommandOutput::default()));

        let engine = PostgresCli::new(connection(), Arc::new(runner), Duration::from_secs(60));
        engine
            .dump_database(&PathBuf::from("/backups/out.sql"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_drop_is_idempotent() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|spec: &CommandSpec| {
                spec.program == "dropdb"
                    && spec.args.ends_with(&["--if-exists".to_string(), "restore_test_1".to_string()])
            })
            .times(1)
            .returning(|_| Ok(CommandOutput::default()));

        let engine = PostgresCli::new(connection(), Arc::new(runner), Duration::from_secs(60));
        engine.drop_database("restore_test_1").await.unwrap();
    }

    #[tokio::test]
    async fn test_query_splits_rows() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|spec: &CommandSpec| {
                spec.program == "psql"
                    && spec.args.iter().any(|a| a == "-A")
                    && spec.args.last().map(String::as_str) == Some("SELECT 1")
            })
            .returning(|_| {
                Ok(CommandOutput {
                    stdout: "users\n cutting_lists \n\n".to_string(),
                    stderr: String::new(),
                })
            });

        let engine = PostgresCli::new(connection(), Arc::new(runner), Duration::from_secs(60));
        let rows = engine.query("scratch", "SELECT 1").await.unwrap();

        assert_eq!(rows, vec!["users", "cutting_lists"]);
    }

    #[tokio::test]
    async fn test_query_count_rejects_garbage() {
        let mut engine = MockDatabaseEngine::new();
        engine
            .expect_query()
            .returning(|_, _| Ok(vec!["not a number".to_string()]));

        assert!(query_count(&engine, "db", "SELECT COUNT(*) FROM x").await.is_err());
    }

    #[tokio::test]
    async fn test_query_count_parses_first_row() {
        let mut engine = MockDatabaseEngine::new();
        engine.expect_query().returning(|_, _| Ok(vec!["42".to_string()]));

        assert_eq!(query_count(&engine, "db", "SELECT COUNT(*) FROM x").await.unwrap(), 42);
    }
}
