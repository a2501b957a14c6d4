//! Compression backend for backup artifacts
//!
//! gzip is always handled in-process with a streaming encoder, so it works on
//! every platform without external tooling. bzip2 and xz need their command
//! line tools; which tools exist is resolved once into a [`ToolSupport`] and
//! every later decision reads from it.
//!
//! Compression never fails for lack of a bzip2/xz tool: the request falls back
//! to gzip and the artifact gets a `.gz` extension instead.

use std::ffi::OsString;
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::database::process::{CommandRunner, CommandSpec};
use crate::database::{DatabaseError, Result};

/// Supported compression algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    Gzip,
    Bzip2,
    Xz,
    None,
}

impl CompressionAlgorithm {
    /// File extension appended to compressed artifacts ("" for `None`)
    pub fn extension(self) -> &'static str {
        match self {
            CompressionAlgorithm::Gzip => "gz",
            CompressionAlgorithm::Bzip2 => "bz2",
            CompressionAlgorithm::Xz => "xz",
            CompressionAlgorithm::None => "",
        }
    }

    /// Command line tool implementing the algorithm
    pub fn program(self) -> Option<&'static str> {
        match self {
            CompressionAlgorithm::Gzip => Some("gzip"),
            CompressionAlgorithm::Bzip2 => Some("bzip2"),
            CompressionAlgorithm::Xz => Some("xz"),
            CompressionAlgorithm::None => None,
        }
    }

    /// Algorithm implied by a path's final extension, if it is a compressed one
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "gz" => Some(CompressionAlgorithm::Gzip),
            "bz2" => Some(CompressionAlgorithm::Bzip2),
            "xz" => Some(CompressionAlgorithm::Xz),
            _ => None,
        }
    }

    /// Whether the algorithm can be used at all on `platform`
    pub fn available_on(self, platform: Platform) -> bool {
        match self {
            CompressionAlgorithm::Bzip2 | CompressionAlgorithm::Xz => platform != Platform::Windows,
            CompressionAlgorithm::Gzip | CompressionAlgorithm::None => true,
        }
    }
}

impl fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CompressionAlgorithm::Gzip => "gzip",
            CompressionAlgorithm::Bzip2 => "bzip2",
            CompressionAlgorithm::Xz => "xz",
            CompressionAlgorithm::None => "none",
        };
        f.write_str(name)
    }
}

impl FromStr for CompressionAlgorithm {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "gzip" | "gz" => Ok(CompressionAlgorithm::Gzip),
            "bzip2" | "bz2" => Ok(CompressionAlgorithm::Bzip2),
            "xz" => Ok(CompressionAlgorithm::Xz),
            "none" | "" => Ok(CompressionAlgorithm::None),
            other => Err(DatabaseError::Config(format!(
                "unknown compression algorithm: {}",
                other
            ))),
        }
    }
}

/// Host platform class, as far as compression tooling is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    Posix,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Posix
        }
    }
}

/// External compression tools present on this host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolSupport {
    pub platform: Platform,
    pub gzip: bool,
    pub bzip2: bool,
    pub xz: bool,
}

impl ToolSupport {
    /// Probe the current host. On Windows external tools are never used.
    pub fn detect(runner: &dyn CommandRunner) -> Self {
        let platform = Platform::current();
        let support = match platform {
            Platform::Windows => Self::none(platform),
            Platform::Posix => Self {
                platform,
                gzip: runner.is_available("gzip"),
                bzip2: runner.is_available("bzip2"),
                xz: runner.is_available("xz"),
            },
        };
        info!("Compression tools: {:?}", support);
        support
    }

    /// No external tools at all
    pub fn none(platform: Platform) -> Self {
        Self {
            platform,
            gzip: false,
            bzip2: false,
            xz: false,
        }
    }

    /// Whether the external tool for `algorithm` may be invoked
    pub fn has_tool(&self, algorithm: CompressionAlgorithm) -> bool {
        if !algorithm.available_on(self.platform) {
            return false;
        }
        match algorithm {
            CompressionAlgorithm::Gzip => self.gzip,
            CompressionAlgorithm::Bzip2 => self.bzip2,
            CompressionAlgorithm::Xz => self.xz,
            CompressionAlgorithm::None => false,
        }
    }
}

/// How a (de)compression request is carried out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Leave the file as it is
    Identity,
    /// In-process streaming gzip
    NativeStream,
    /// Pipe through an external program
    ExternalTool(&'static str),
}

/// Converts artifacts between raw and compressed form
pub struct CompressionBackend {
    runner: Arc<dyn CommandRunner>,
    tools: ToolSupport,
    timeout: Duration,
}

impl CompressionBackend {
    pub fn new(runner: Arc<dyn CommandRunner>, tools: ToolSupport, timeout: Duration) -> Self {
        Self {
            runner,
            tools,
            timeout,
        }
    }

    pub fn tools(&self) -> &ToolSupport {
        &self.tools
    }

    pub fn runner(&self) -> &Arc<dyn CommandRunner> {
        &self.runner
    }

    /// Algorithm and strategy actually used when `requested` is asked for
    pub fn resolve(&self, requested: CompressionAlgorithm) -> (CompressionAlgorithm, Strategy) {
        match requested {
            CompressionAlgorithm::None => (requested, Strategy::Identity),
            CompressionAlgorithm::Gzip => (requested, Strategy::NativeStream),
            CompressionAlgorithm::Bzip2 | CompressionAlgorithm::Xz => {
                match (self.tools.has_tool(requested), requested.program()) {
                    (true, Some(program)) => (requested, Strategy::ExternalTool(program)),
                    _ => (CompressionAlgorithm::Gzip, Strategy::NativeStream),
                }
            }
        }
    }

    /// Compress `path` into `<path>.<ext>` and return the output path
    ///
    /// The input is left in place. `None` returns `path` unchanged.
    pub async fn compress(
        &self,
        path: &Path,
        algorithm: CompressionAlgorithm,
        level: u32,
    ) -> Result<PathBuf> {
        let (effective, strategy) = self.resolve(algorithm);
        if effective != algorithm {
            warn!(
                "{} is not available on this host, falling back to gzip for {}",
                algorithm,
                path.display()
            );
        }

        let level = level.clamp(1, 9);
        let output = append_extension(path, effective.extension());

        let outcome = match strategy {
            Strategy::Identity => return Ok(path.to_path_buf()),
            Strategy::NativeStream => {
                let (src, dst) = (path.to_path_buf(), output.clone());
                run_blocking(move || gzip_file(&src, &dst, level)).await
            }
            Strategy::ExternalTool(program) => {
                let spec = CommandSpec::new(program)
                    .args(["-c".to_string(), format!("-{}", level)])
                    .arg(path.to_string_lossy())
                    .stdout_to(&output)
                    .timeout(self.timeout);
                self.runner.run(&spec).await.map(|_| ())
            }
        };
        outcome.inspect_err(|_| remove_partial(&output))?;

        debug!("Compressed {} -> {}", path.display(), output.display());
        Ok(output)
    }

    /// Path a compressed artifact decompresses to: the same path without the
    /// compression extension. `None` when the path is not compressed.
    pub fn decompressed_path(path: &Path) -> Option<PathBuf> {
        CompressionAlgorithm::from_path(path).map(|_| path.with_extension(""))
    }

    /// Decompress `path` into its sibling path and return that path
    ///
    /// Never overwrites an existing file. A partially written output is
    /// removed before the error is returned.
    pub async fn decompress(&self, path: &Path) -> Result<PathBuf> {
        let (algorithm, output) = CompressionAlgorithm::from_path(path)
            .zip(Self::decompressed_path(path))
            .ok_or_else(|| {
                DatabaseError::Compression(format!("{} is not a compressed artifact", path.display()))
            })?;

        let strategy = match algorithm {
            CompressionAlgorithm::Gzip if self.tools.has_tool(algorithm) => {
                Strategy::ExternalTool("gzip")
            }
            CompressionAlgorithm::Gzip => Strategy::NativeStream,
            _ if !algorithm.available_on(self.tools.platform) => {
                return Err(DatabaseError::UnsupportedPlatform(format!(
                    "{} artifacts cannot be decompressed on Windows; use gzip instead",
                    algorithm
                )));
            }
            _ => match algorithm.program() {
                Some(program) if self.tools.has_tool(algorithm) => Strategy::ExternalTool(program),
                Some(program) => return Err(DatabaseError::ToolUnavailable(program.to_string())),
                None => Strategy::Identity,
            },
        };

        if output.exists() {
            return Err(DatabaseError::Compression(format!(
                "refusing to overwrite existing file {}",
                output.display()
            )));
        }

        let outcome = match strategy {
            Strategy::Identity => return Ok(path.to_path_buf()),
            Strategy::NativeStream => {
                let (src, dst) = (path.to_path_buf(), output.clone());
                run_blocking(move || gunzip_file(&src, &dst)).await
            }
            Strategy::ExternalTool(program) => {
                let spec = CommandSpec::new(program)
                    .args(["-d", "-c"])
                    .arg(path.to_string_lossy())
                    .stdout_to(&output)
                    .timeout(self.timeout);
                self.runner.run(&spec).await.map(|_| ())
            }
        };
        outcome.inspect_err(|_| remove_partial(&output))?;

        debug!("Decompressed {} -> {}", path.display(), output.display());
        Ok(output)
    }
}

/// Stream-compress `src` into `dst` with gzip
pub fn gzip_file(src: &Path, dst: &Path, level: u32) -> io::Result<()> {
    let mut reader = BufReader::new(File::open(src)?);
    let writer = BufWriter::new(File::create(dst)?);
    let mut encoder = GzEncoder::new(writer, Compression::new(level));
    io::copy(&mut reader, &mut encoder)?;
    encoder.finish()?.flush()
}

/// Stream-decompress gzip `src` into `dst`
pub fn gunzip_file(src: &Path, dst: &Path) -> io::Result<()> {
    let mut decoder = GzDecoder::new(BufReader::new(File::open(src)?));
    let mut writer = BufWriter::new(File::create(dst)?);
    io::copy(&mut decoder, &mut writer)?;
    writer.flush()
}

async fn run_blocking<F>(job: F) -> Result<()>
where
    F: FnOnce() -> io::Result<()> + Send + 'static,
{
    tokio::task::spawn_blocking(job)
        .await
        .map_err(|e| DatabaseError::Compression(format!("compression task failed: {}", e)))?
        .map_err(DatabaseError::from)
}

fn append_extension(path: &Path, extension: &str) -> PathBuf {
    if extension.is_empty() {
        return path.to_path_buf();
    }
    let mut name = OsString::from(path.as_os_str());
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}

fn remove_partial(path: &Path) {
    if path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            warn!("Failed to remove partial output {}: {}", path.display(), e);
        }
    }
}
