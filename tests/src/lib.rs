//! Morf Testing
//!
//! Scripted agents and helpers for exercising the orchestration core
//! end to end without live collaborators.

pub mod agents;

pub use agents::{AskingAgent, EchoAgent, FlakyAgent, SlowAgent};

use std::sync::Once;

static INIT: Once = Once::new();

/// Install a tracing subscriber once per test binary. Honors `RUST_LOG`;
/// silent by default.
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("off")),
            )
            .with_test_writer()
            .try_init();
    });
}
