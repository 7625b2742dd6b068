//! Tracing initialisation.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

/// Verify the log file can be created or appended to before logging starts.
pub fn check_log_file(path: &Path) -> std::io::Result<()> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map(drop)
}

/// Install the global subscriber. `level` is a tracing filter directive
/// (typically just `error`..`trace`); `RUST_LOG` overrides it when set.
pub fn init(
    level: &str,
    log_file: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            let file = Arc::new(file);
            builder
                .with_ansi(false)
                .with_writer(BoxMakeWriter::new(file))
                .try_init()?;
        }
        None => builder.try_init()?,
    }
    Ok(())
}
