//! External process invocation
//!
//! Every external tool (pg_dump, psql, bzip2, ...) is started through the
//! [`CommandRunner`] trait with an explicit argument vector. No shell is ever
//! involved, so values such as database names and paths cannot inject
//! commands, and tests can substitute a mock runner.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::database::{DatabaseError, Result};

/// A fully parameterized external command
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandSpec {
    /// Program name, resolved through `PATH`
    pub program: String,
    pub args: Vec<String>,
    /// Extra environment for the child only
    pub env: Vec<(String, String)>,
    /// Redirect stdout into this file instead of capturing it
    pub stdout_to: Option<PathBuf>,
    /// Kill the child if it runs longer than this
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stdout_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout_to = Some(path.into());
        self
    }

    pub fn timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }
}

/// Captured output of a command that exited successfully
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs external commands on behalf of the backup pipeline
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion
    ///
    /// A non-zero exit status is reported as [`DatabaseError::Command`] and an
    /// elapsed timeout as [`DatabaseError::Timeout`].
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;

    /// Whether `program` can be found on this host
    fn is_available(&self, program: &str) -> bool;
}

/// [`CommandRunner`] backed by `tokio::process`
#[derive(Debug, Clone, Default)]
pub struct TokioCommandRunner;

impl TokioCommandRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        debug!("Running {} {:?}", spec.program, spec.args);

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match &spec.stdout_to {
            Some(path) => {
                let file = std::fs::File::create(path)?;
                cmd.stdout(Stdio::from(file));
            }
            None => {
                cmd.stdout(Stdio::piped());
            }
        }

        let child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => DatabaseError::ToolUnavailable(spec.program.clone()),
            _ => DatabaseError::Io(e),
        })?;

        let output = match spec.timeout {
            Some(limit) => match timeout(limit, child.wait_with_output()).await {
                Ok(result) => result?,
                // Dropping the future drops the child, which kills it
                Err(_) => {
                    return Err(DatabaseError::Timeout {
                        program: spec.program.clone(),
                        seconds: limit.as_secs(),
                    });
                }
            },
            None => child.wait_with_output().await?,
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if !output.status.success() {
            return Err(DatabaseError::Command {
                program: spec.program.clone(),
                code: output.status.code(),
                stderr,
            });
        }

        Ok(CommandOutput { stdout, stderr })
    }

    fn is_available(&self, program: &str) -> bool {
        which::which(program).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_collects_arguments() {
        let spec = CommandSpec::new("pg_dump")
            .arg("-h")
            .args(["localhost", "-p"])
            .env("PGPASSWORD", "secret")
            .timeout(Duration::from_secs(5));

        assert_eq!(spec.program, "pg_dump");
        assert_eq!(spec.args, vec!["-h", "localhost", "-p"]);
        assert_eq!(spec.env, vec![("PGPASSWORD".to_string(), "secret".to_string())]);
        assert_eq!(spec.timeout, Some(Duration::from_secs(5)));
        assert!(spec.stdout_to.is_none());
    }

    #[tokio::test]
    async fn test_missing_program_is_tool_unavailable() {
        let runner = TokioCommandRunner::new();
        let spec = CommandSpec::new("definitely-not-a-real-program-7f3a");

        assert!(!runner.is_available(&spec.program));
        assert!(matches!(
            runner.run(&spec).await,
            Err(DatabaseError::ToolUnavailable(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_zero_exit_is_command_error() {
        let runner = TokioCommandRunner::new();
        let spec = CommandSpec::new("sh").args(["-c", "echo boom >&2; exit 3"]);

        match runner.run(&spec).await {
            Err(DatabaseError::Command { code, stderr, .. }) => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_slow_command() {
        let runner = TokioCommandRunner::new();
        let spec = CommandSpec::new("sleep")
            .arg("5")
            .timeout(Duration::from_millis(100));

        assert!(matches!(
            runner.run(&spec).await,
            Err(DatabaseError::Timeout { .. })
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdout_redirect_writes_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let out = temp_dir.path().join("out.txt");
        let runner = TokioCommandRunner::new();
        let spec = CommandSpec::new("echo").arg("hello").stdout_to(&out);

        let output = runner.run(&spec).await.unwrap();

        assert!(output.stdout.is_empty());
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "hello\n");
    }
}
