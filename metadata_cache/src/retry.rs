//! Bounded retry for routing map lookups.

use crate::Error;

/// Outcome of [`IncompleteRoutingMapRetryPolicy::should_retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry immediately, without a base map.
    RetryNow,

    /// Give up and surface the error.
    NoRetry,
}

/// Retries a lookup exactly once if it failed with [`Error::IncompleteTopology`].
///
/// A partition split that races with the read of the ranges leaves a gap in the fetched topology.
/// A second full read usually sees the finished split. Use one instance per logical operation.
#[derive(Debug, Default, Clone, Copy)]
pub struct IncompleteRoutingMapRetryPolicy {
    retried: bool,
}

impl IncompleteRoutingMapRetryPolicy {
    /// Decide whether to retry after `e`.
    pub fn should_retry(&mut self, e: &Error) -> RetryDecision {
        if self.retried || !e.is_incomplete_topology() {
            return RetryDecision::NoRetry;
        }

        self.retried = true;
        RetryDecision::RetryNow
    }
}
