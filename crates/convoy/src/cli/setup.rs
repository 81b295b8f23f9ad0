//! Global setup utilities for CLI initialization

use anyhow::Result;

/// Initialize tracing subscriber for logging
///
/// Filter comes from `RUST_LOG` and defaults to INFO. Output goes to stderr so
/// it never mixes with command output on stdout.
pub fn init_tracing() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {e}"))
}
