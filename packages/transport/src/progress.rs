//! Progress reporting for a transport run.
//!
//! The pipeline reports one unit per completed fetch through
//! [`ProgressCallback`]; the CLI renders it with `indicatif`, tests and
//! library callers pass [`NullProgress`].

use std::sync::Arc;

/// Receives progress updates from a running transport.
///
/// Must be `Send + Sync` so it can be shared with the fetch stream.
pub trait ProgressCallback: Send + Sync {
    /// Sets the number of fetches the run will perform.
    fn set_total(&self, total: u64);

    /// Advances by `delta` completed fetches.
    fn inc(&self, delta: u64);

    /// Replaces the status message.
    fn set_message(&self, msg: String);

    /// Marks the run as finished with a final message.
    fn finish(&self, msg: String);
}

/// Ignores every update.
pub struct NullProgress;

impl ProgressCallback for NullProgress {
    fn set_total(&self, _total: u64) {}
    fn inc(&self, _delta: u64) {}
    fn set_message(&self, _msg: String) {}
    fn finish(&self, _msg: String) {}
}

/// Returns a shared [`NullProgress`].
#[must_use]
pub fn null_progress() -> Arc<dyn ProgressCallback> {
    Arc::new(NullProgress)
}
