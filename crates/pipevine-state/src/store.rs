//! State store trait definition.
//!
//! [`StateStore`] defines the storage contract for the run ledger and the
//! generic key/value surface. Model types live in `pipevine-types`.

use pipevine_types::PipelineRun;
use serde_json::Value;

use crate::error;

/// Default bound applied by callers of [`StateStore::get_pipeline_runs`].
pub const DEFAULT_RUN_LIMIT: usize = 100;

/// Storage contract for run records and scheduler state.
///
/// Implementations must be `Send + Sync` for use behind
/// `Arc<dyn StateStore>`. Methods are synchronous; async callers hop
/// through `tokio::task::spawn_blocking`.
pub trait StateStore: Send + Sync {
    /// Read a generic key/value entry.
    ///
    /// Returns `Ok(None)` when the key is absent.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn get(&self, key: &str) -> error::Result<Option<Value>>;

    /// Upsert a generic key/value entry.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn set(&self, key: &str, value: &Value) -> error::Result<()>;

    /// Remove a key; absent keys are not an error.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn delete(&self, key: &str) -> error::Result<()>;

    /// All keys with the given prefix.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn list(&self, prefix: &str) -> error::Result<Vec<String>>;

    /// Upsert a run and every one of its task records.
    ///
    /// Atomic at the run level: a reader that observes the run's new status
    /// never observes stale task rows.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn save_pipeline_run(&self, run: &PipelineRun) -> error::Result<()>;

    /// Reconstruct a run with all of its task records.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn get_pipeline_run(&self, id: &str) -> error::Result<Option<PipelineRun>>;

    /// Runs for `pipeline_name`, newest first by `started_at`, bounded by
    /// `limit`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn get_pipeline_runs(
        &self,
        pipeline_name: &str,
        limit: usize,
    ) -> error::Result<Vec<PipelineRun>>;

    /// Delete runs started more than `retention_days` ago, cascading to
    /// their task records. Returns the number of runs deleted.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn cleanup_old_runs(&self, retention_days: u32) -> error::Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Verify the trait is object-safe (can be used as `dyn StateStore`).
    #[test]
    fn trait_is_object_safe() {
        fn _assert_object_safe(_: &dyn StateStore) {}
    }
}
