//! Integrity checks for backup artifacts
//!
//! Verification only fails on definitive evidence: an empty file, a gzip file
//! without the gzip magic header, or an integrity tool that rejects a bzip2/xz
//! file. Anything merely uncertain passes with a warning.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::database::compression::{CompressionAlgorithm, ToolSupport};
use crate::database::process::{CommandRunner, CommandSpec};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// How much of a plain dump is scanned for SQL markers
const SQL_SNIFF_BYTES: usize = 64 * 1024;

const SQL_MARKERS: &[&str] = &[
    "PostgreSQL database dump",
    "CREATE TABLE",
    "INSERT INTO",
    "COPY ",
];

/// Outcome of verifying one artifact
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VerificationReport {
    pub passed: bool,
    pub warnings: Vec<String>,
}

impl VerificationReport {
    fn fail(reason: String) -> Self {
        warn!("{}", reason);
        Self {
            passed: false,
            warnings: vec![reason],
        }
    }

    fn warn(&mut self, message: String) {
        warn!("{}", message);
        self.warnings.push(message);
    }
}

/// Inspects backup files and reports whether they look restorable
pub struct ArtifactVerifier {
    runner: Arc<dyn CommandRunner>,
    tools: ToolSupport,
    timeout: Duration,
}

impl ArtifactVerifier {
    pub fn new(runner: Arc<dyn CommandRunner>, tools: ToolSupport, timeout: Duration) -> Self {
        Self {
            runner,
            tools,
            timeout,
        }
    }

    /// Whether `path` passes verification
    pub async fn verify(&self, path: &Path) -> bool {
        self.inspect(path).await.passed
    }

    /// Verify `path`, collecting soft warnings along the way
    pub async fn inspect(&self, path: &Path) -> VerificationReport {
        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) => return VerificationReport::fail(format!("Cannot access {}: {}", path.display(), e)),
        };
        if metadata.len() == 0 {
            return VerificationReport::fail(format!("{} is empty", path.display()));
        }

        let mut report = VerificationReport {
            passed: true,
            warnings: Vec::new(),
        };

        match CompressionAlgorithm::from_path(path) {
            Some(CompressionAlgorithm::Gzip) => self.check_gzip(path, &mut report).await,
            Some(algorithm) => self.check_with_tool(path, algorithm, &mut report).await,
            None if path.extension().is_some_and(|ext| ext == "sql") => {
                check_sql_markers(path, &mut report).await
            }
            None => report.warn(format!(
                "{} has an unrecognized extension; only its size was checked",
                path.display()
            )),
        }

        debug!("Verified {}: passed={}", path.display(), report.passed);
        report
    }

    async fn check_gzip(&self, path: &Path, report: &mut VerificationReport) {
        let header = match read_header(path).await {
            Ok(header) => header,
            Err(e) => {
                *report = VerificationReport::fail(format!("Cannot read gzip header of {}: {}", path.display(), e));
                return;
            }
        };
        if header != GZIP_MAGIC {
            *report = VerificationReport::fail(format!("{} does not start with the gzip magic bytes", path.display()));
            return;
        }

        // The header is authoritative; the tool only adds confidence
        if self.tools.has_tool(CompressionAlgorithm::Gzip) {
            let spec = self.test_command("gzip", path);
            if let Err(e) = self.runner.run(&spec).await {
                report.warn(format!("gzip -t reported a problem with {}: {}", path.display(), e));
            }
        }
    }

    async fn check_with_tool(
        &self,
        path: &Path,
        algorithm: CompressionAlgorithm,
        report: &mut VerificationReport,
    ) {
        let program = match algorithm.program() {
            Some(program) if self.tools.has_tool(algorithm) => program,
            _ => {
                report.warn(format!(
                    "No {} tool on this host; {} was not integrity-checked",
                    algorithm,
                    path.display()
                ));
                return;
            }
        };

        let spec = self.test_command(program, path);
        if let Err(e) = self.runner.run(&spec).await {
            *report = VerificationReport::fail(format!("{} integrity test failed for {}: {}", program, path.display(), e));
        }
    }

    fn test_command(&self, program: &str, path: &Path) -> CommandSpec {
        CommandSpec::new(program)
            .arg("-t")
            .arg(path.to_string_lossy())
            .timeout(self.timeout)
    }
}

async fn read_header(path: &Path) -> std::io::Result<[u8; 2]> {
    let mut header = [0u8; 2];
    let mut file = tokio::fs::File::open(path).await?;
    file.read_exact(&mut header).await?;
    Ok(header)
}

async fn read_head(path: &Path) -> std::io::Result<Vec<u8>> {
    let mut head = Vec::with_capacity(SQL_SNIFF_BYTES);
    let file = tokio::fs::File::open(path).await?;
    file.take(SQL_SNIFF_BYTES as u64).read_to_end(&mut head).await?;
    Ok(head)
}

async fn check_sql_markers(path: &Path, report: &mut VerificationReport) {
    match read_head(path).await {
        Ok(head) => {
            let text = String::from_utf8_lossy(&head);
            if !SQL_MARKERS.iter().any(|marker| text.contains(marker)) {
                report.warn(format!("{} does not look like a SQL dump", path.display()));
            }
        }
        Err(e) => report.warn(format!("Could not read {} for content checks: {}", path.display(), e)),
    }
}
