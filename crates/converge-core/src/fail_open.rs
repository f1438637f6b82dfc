//! Fail-open utilities for ancillary work
//!
//! Debug snapshots, run summaries and progress notifications are diagnostic.
//! A failure in any of them is logged and swallowed so the refinement loop
//! keeps going.
//!
//! DO NOT use fail-open for:
//! - Model calls (backend errors decide how the run ends)
//! - Input aggregation
//! - Final output writes

use std::future::Future;
use tracing::warn;

use crate::Result;

/// Execute an operation that should fail open
///
/// Logs the error via `tracing::warn!` on failure and returns `None`.
///
/// ```no_run
/// use converge_core::fail_open::fail_open;
/// use converge_core::Result;
///
/// async fn write_snapshot() -> Result<()> {
///     Ok(())
/// }
///
/// async fn example() {
///     let written = fail_open("debug_recorder", || write_snapshot()).await;
///     assert!(written.is_some());
/// }
/// ```
pub async fn fail_open<F, Fut, T>(operation_name: &str, f: F) -> Option<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match f().await {
        Ok(val) => Some(val),
        Err(e) => {
            warn!("{} failed (fail-open): {}", operation_name, e);
            None
        }
    }
}
