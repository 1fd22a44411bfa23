//! Tracing setup for execport binaries.
//!
//! Every process writes to a size-capped rolling file under the execport home
//! directory and mirrors events to stderr.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "execport=info,execport_store=info";
const HOME_ENV: &str = "EXECPORT_HOME";
const MAX_LOG_FILES: usize = 5;
const MAX_LOG_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Logging configuration for one process.
#[derive(Debug, Clone)]
pub struct LogConfig<'a> {
    /// Base name of the log file (`<app_name>.log`).
    pub app_name: &'a str,
    /// Worker node id, appended to the file name so co-located nodes don't share a file.
    pub node_id: Option<&'a str>,
    /// Mirror debug-level events to stderr regardless of `RUST_LOG`.
    pub verbose: bool,
    /// Override for the log directory (defaults to `logs_dir()`).
    pub log_dir: Option<PathBuf>,
}

impl<'a> LogConfig<'a> {
    pub fn new(app_name: &'a str) -> Self {
        Self {
            app_name,
            node_id: None,
            verbose: false,
            log_dir: None,
        }
    }
}

/// Install the global subscriber: rolling file layer plus stderr layer.
pub fn init_logging(config: LogConfig<'_>) -> Result<PathBuf> {
    let dir = match config.log_dir {
        Some(dir) => dir,
        None => logs_dir()?,
    };
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;

    let base_name = match config.node_id {
        Some(node) => format!("{}-{}", config.app_name, node),
        None => config.app_name.to_string(),
    };
    let writer = SharedRollingWriter::open(&dir, &base_name)?;
    let file_path = writer.current_path()?;

    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let console_filter = if config.verbose {
        EnvFilter::new("execport=debug,execport_store=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(file_path)
}

/// Home directory for local state: `$EXECPORT_HOME` or `~/.execport`.
pub fn execport_home() -> Result<PathBuf> {
    if let Ok(path) = std::env::var(HOME_ENV) {
        return Ok(PathBuf::from(path));
    }
    dirs::home_dir()
        .map(|home| home.join(".execport"))
        .context("Could not determine home directory; set EXECPORT_HOME")
}

/// Default log directory: `<home>/logs`.
pub fn logs_dir() -> Result<PathBuf> {
    Ok(execport_home()?.join("logs"))
}

/// Size-capped log file. On overflow `<name>.log` shifts to `<name>.log.1`,
/// older generations shift up and the last one is dropped.
struct RollingFile {
    dir: PathBuf,
    stem: String,
    keep: usize,
    limit: u64,
    file: Option<File>,
    written: u64,
}

impl RollingFile {
    fn open(dir: &Path, stem: &str, keep: usize, limit: u64) -> io::Result<Self> {
        let mut rolling = Self {
            dir: dir.to_path_buf(),
            stem: sanitize_name(stem),
            keep: keep.max(1),
            limit,
            file: None,
            written: 0,
        };
        rolling.reopen()?;
        if rolling.written >= rolling.limit {
            rolling.roll()?;
        }
        Ok(rolling)
    }

    fn path(&self, generation: usize) -> PathBuf {
        if generation == 0 {
            self.dir.join(format!("{}.log", self.stem))
        } else {
            self.dir.join(format!("{}.log.{}", self.stem, generation))
        }
    }

    fn reopen(&mut self) -> io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(0))?;
        self.written = file.metadata()?.len();
        self.file = Some(file);
        Ok(())
    }

    fn roll(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            let _ = file.flush();
        }

        let oldest = self.keep - 1;
        if oldest > 0 {
            let dropped = self.path(oldest);
            if dropped.exists() {
                fs::remove_file(dropped)?;
            }
            for generation in (0..oldest).rev() {
                let from = self.path(generation);
                if from.exists() {
                    fs::rename(&from, self.path(generation + 1))?;
                }
            }
        } else {
            // Single generation: start over in place.
            fs::remove_file(self.path(0)).or_else(|e| match e.kind() {
                io::ErrorKind::NotFound => Ok(()),
                _ => Err(e),
            })?;
        }

        self.reopen()
    }
}

impl Write for RollingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.limit {
            self.roll()?;
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "log file unavailable"))?;
        let n = file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

#[derive(Clone)]
struct SharedRollingWriter {
    inner: Arc<Mutex<RollingFile>>,
}

impl SharedRollingWriter {
    fn open(dir: &Path, stem: &str) -> Result<Self> {
        let file = RollingFile::open(dir, stem, MAX_LOG_FILES, MAX_LOG_FILE_SIZE)
            .with_context(|| format!("Failed to open log file for {}", stem))?;
        Ok(Self {
            inner: Arc::new(Mutex::new(file)),
        })
    }

    fn current_path(&self) -> Result<PathBuf> {
        let guard = self
            .inner
            .lock()
            .map_err(|_| anyhow::anyhow!("log writer lock poisoned"))?;
        Ok(guard.path(0))
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SharedRollingWriter {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

impl Write for SharedRollingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?
            .flush()
    }
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_rolling_file_rotates_and_caps_generations() {
        let tmp = TempDir::new().unwrap();
        let mut file = RollingFile::open(tmp.path(), "worker", 3, 16).unwrap();

        for _ in 0..6 {
            file.write_all(b"0123456789abcdef").unwrap();
        }
        file.flush().unwrap();

        assert!(tmp.path().join("worker.log").exists());
        assert!(tmp.path().join("worker.log.1").exists());
        assert!(tmp.path().join("worker.log.2").exists());
        assert!(!tmp.path().join("worker.log.3").exists());
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("execport node/1"), "execport_node_1");
    }
}
