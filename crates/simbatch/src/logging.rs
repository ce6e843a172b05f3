use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn env_filter(level: &str) -> EnvFilter {
    // RUST_LOG takes precedence over the requested level
    let default_filter = format!("simbatch={level}");
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&default_filter))
}

/// Initialize logging to stderr.
///
/// Fails if a global subscriber is already installed.
pub fn init_logging(level: &str) -> Result<(), TryInitError> {
    tracing_subscriber::registry()
        .with(env_filter(level))
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_names(true),
        )
        .try_init()
}

/// Initialize logging appended to `log_path`, creating its directory.
pub fn init_file_logging(log_path: &Path, level: &str) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(dir) = log_path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;

    tracing_subscriber::registry()
        .with(env_filter(level))
        .with(
            fmt::layer()
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .with_target(true)
                .with_thread_names(true),
        )
        .try_init()?;

    tracing::info!("simbatch logging initialized (log_path={})", log_path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_logging_installs_once() {
        let dir = TempDir::new().unwrap();
        let log_path = dir.path().join("logs").join("simbatch.log");
        init_file_logging(&log_path, "info").unwrap();
        assert!(log_path.is_file());

        // A global subscriber is already installed
        assert!(init_logging("debug").is_err());
    }
}
