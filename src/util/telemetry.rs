//! Tracing setup for applications embedding the scheduler.
//!
//! The dispatch loop logs lifecycle events at `info`, per-trigger flow at
//! `debug` (acquisition, veto, submission, completion) and listener, job or
//! store failures at `error`. Thread names are included because the loop and
//! the workers each run on their own named threads.

use tracing_subscriber::EnvFilter;

/// Directive used when `RUST_LOG` is not set.
pub const DEFAULT_DIRECTIVE: &str = "trigger_dispatch=info";

/// Install a fmt subscriber filtered by `RUST_LOG`, falling back to
/// [`DEFAULT_DIRECTIVE`]. Does nothing if a subscriber is already set.
pub fn init_tracing() {
    init_tracing_with(DEFAULT_DIRECTIVE);
}

/// Like [`init_tracing`] with a caller-chosen fallback directive, e.g.
/// `"trigger_dispatch::core::dispatch=debug"` to follow every batch.
pub fn init_tracing_with(fallback: &str) {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init();
}
