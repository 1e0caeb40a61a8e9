//! Tracing subscriber setup for the transport core.

use std::fs::{create_dir_all, OpenOptions};
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::FmtSubscriber;

/// Initializes a JSON subscriber writing to `logs/transport-<pid>.log`
/// under the given directory. Only call this once per process; library
/// users that already install a subscriber should skip it.
pub fn init_file_logging(dir: impl AsRef<Path>) -> std::io::Result<()> {
    let dir = dir.as_ref().join("logs");
    create_dir_all(&dir)?;
    let path = dir.join(format!("transport-{}.log", std::process::id()));
    let file = OpenOptions::new().append(true).create(true).open(path)?;
    let subscriber = FmtSubscriber::builder()
        .with_writer(Arc::new(file))
        .json()
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::warn!("a global subscriber was already installed");
    }
    Ok(())
}
