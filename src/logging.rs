//! Tracing subscriber setup.
//!
//! The library itself only emits `tracing` events; binaries (and embedders that
//! want our defaults) call [`init_tracing`] once at startup.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

/// Filter used when neither `RUST_LOG` nor [`LogConfig::filter`] is set.
pub const DEFAULT_FILTER: &str = "toolwire=info,warn";

/// Rotated log files kept next to the current one.
const KEEP_ROTATED: u32 = 3;

#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// `EnvFilter` directives; `RUST_LOG` wins when set.
    pub filter: Option<String>,
    /// Emit JSON lines instead of human-readable text.
    pub json: bool,
    /// Log to this file (rotated on startup) instead of stderr.
    pub file: Option<PathBuf>,
}

/// Platform data directory for toolwire logs.
///
/// Falls back to `~/.toolwire/` and finally the current directory.
pub fn default_log_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("toolwire");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".toolwire")
}

/// Install the global subscriber.
///
/// With a log file:
/// 1. Rotates existing logs (probe.log → probe.log.1 → .2 → .3).
/// 2. Opens a fresh file with a line-flushing writer.
/// 3. Logs a startup banner naming the file.
pub fn init_tracing(config: &LogConfig) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(config.filter.as_deref().unwrap_or(DEFAULT_FILTER))
            .context("invalid log filter")?,
    };

    let (writer, ansi) = match &config.file {
        Some(path) => {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("failed to create log directory {}", dir.display()))?;
            }
            rotate_log_file(path, KEEP_ROTATED);
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            (BoxMakeWriter::new(FlushingWriter::new(file)), false)
        }
        None => (BoxMakeWriter::new(std::io::stderr), true),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_target(true)
        .with_thread_ids(false);

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.with_ansi(ansi).try_init()
    };
    installed.map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

    if let Some(path) = &config.file {
        tracing::info!(
            version = env!("CARGO_PKG_VERSION"),
            log_file = %path.display(),
            pid = std::process::id(),
            "=== toolwire starting ==="
        );
    }
    Ok(())
}

/// Rotate log files: `x.log` → `x.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
pub fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A file writer that flushes after every write, so each log line survives a crash.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<Mutex<File>>,
}

impl FlushingWriter {
    fn new(file: File) -> Self {
        Self {
            file: Arc::new(Mutex::new(file)),
        }
    }
}

impl Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = f.write(buf)?;
        f.flush()?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        f.flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(path: &Path) -> String {
        std::fs::read_to_string(path).unwrap()
    }

    #[test]
    fn test_rotate_shifts_and_drops_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("probe.log");
        std::fs::write(&base, "current").unwrap();
        std::fs::write(dir.path().join("probe.log.1"), "one").unwrap();
        std::fs::write(dir.path().join("probe.log.3"), "three").unwrap();

        rotate_log_file(&base, 3);

        assert!(!base.exists());
        assert_eq!(read(&dir.path().join("probe.log.1")), "current");
        assert_eq!(read(&dir.path().join("probe.log.2")), "one");
        // .3 was the oldest and got deleted; nothing shifted into it.
        assert!(!dir.path().join("probe.log.3").exists());
    }

    #[test]
    fn test_rotate_without_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        rotate_log_file(&dir.path().join("missing.log"), 3);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_flushing_writer_writes_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        let file = File::create(&path).unwrap();

        let mut writer = FlushingWriter::new(file);
        let mut clone = writer.clone();
        writer.write_all(b"first\n").unwrap();
        clone.write_all(b"second\n").unwrap();

        assert_eq!(read(&path), "first\nsecond\n");
    }

    #[test]
    fn test_default_log_dir_is_named() {
        assert!(default_log_dir().ends_with("toolwire") || default_log_dir().ends_with(".toolwire"));
    }
}
