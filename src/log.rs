//! Logging helpers shared by every node.
//!
//! Call sites format their own message (usually with `cformat!`) and hand it
//! to one of the level functions below. The messages end up in `tracing`, so
//! `RUST_LOG` controls what is shown.

use tracing_subscriber::{fmt, EnvFilter};

/// Installs the global subscriber for a node process.
///
/// Calling it more than once is harmless; only the first call wins.
pub fn init(node: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let installed = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .try_init()
        .is_ok();

    if installed {
        tracing::info!(node, "logging initialised");
    }
}

pub fn debug(message: &str) {
    tracing::debug!("{message}");
}

pub fn info(message: &str) {
    tracing::info!("{message}");
}

pub fn warn(message: &str) {
    tracing::warn!("{message}");
}

pub fn error(message: &str) {
    tracing::error!("{message}");
}
