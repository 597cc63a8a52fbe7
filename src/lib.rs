pub mod agent_core;
pub mod config;
pub mod inference;
pub mod mcp_client;
pub mod sse;

#[cfg(test)]
pub(crate) mod testing;

use std::path::{Path, PathBuf};

/// Return the platform-standard data directory for the switchboard.
///
/// - macOS: `~/Library/Application Support/mcp-switchboard/`
/// - Windows: `{FOLDERID_RoamingAppData}\mcp-switchboard\`
/// - Linux: `$XDG_DATA_HOME/mcp-switchboard/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.mcp-switchboard/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("mcp-switchboard");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mcp-switchboard")
}

/// Initialize the tracing subscriber: writes structured logs to the data directory.
///
/// On each startup:
/// 1. Rotates existing logs (switchboard.log → .1 → .2 → .3, keeps last 3).
/// 2. Opens a fresh switchboard.log with a line-flushing writer.
/// 3. Logs a startup banner with the log path.
///
/// If the log file cannot be opened, logs go to stderr instead. Returns the
/// log file path when one is in use. Calling this twice is harmless.
pub fn init_tracing() -> Option<PathBuf> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let log_dir = data_dir();
    let _ = std::fs::create_dir_all(&log_dir);
    let log_path = log_dir.join("switchboard.log");

    rotate_log_file(&log_path, 3);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("mcp_switchboard=info,warn"));

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path);

    let log_path = match log_file {
        Ok(file) => {
            let _ = fmt::fmt()
                .with_env_filter(filter)
                .with_writer(FlushingWriter::new(file))
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(false)
                .try_init();
            Some(log_path)
        }
        Err(e) => {
            let _ = fmt::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(true)
                .try_init();
            tracing::warn!(path = %log_path.display(), error = %e, "cannot open log file, logging to stderr");
            None
        }
    };

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %log_dir.display(),
        log_file = ?log_path,
        pid = std::process::id(),
        "=== mcp-switchboard starting ==="
    );
    log_path
}

/// Rotate log files: `switchboard.log` → `.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
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

/// A writer that wraps `std::fs::File` and flushes after every write, so
/// each log line is on disk even if the process is killed.
#[derive(Clone)]
struct FlushingWriter {
    file: std::sync::Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: std::sync::Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
