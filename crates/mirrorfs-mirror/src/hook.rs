//! Seam between the engine and a running resync pass

use mirrorfs_common::TargetId;

/// Receives the changes a primary would have forwarded while its secondary
/// is being resynced.
pub trait ResyncHook: Send + Sync {
    /// Record `paths` changed on `primary` into its running pass.
    ///
    /// Returns false if no pass is running for `primary`, in which case the
    /// caller falls back to the regular forward decision.
    fn record_change(&self, primary: TargetId, paths: &[String]) -> bool;
}
