//! Process-wide logging initialization.
//!
//! The SDK logs through `tracing`; applications that already install their
//! own subscriber can skip this entirely.

use tracing_subscriber::EnvFilter;

/// Install a console `tracing` subscriber honoring `RUST_LOG`.
///
/// Defaults to `info` when `RUST_LOG` is unset. Idempotent: calling it after
/// a subscriber is already installed (including from tests running in
/// parallel) is a no-op.
pub fn init() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init();
        init();
    }
}
