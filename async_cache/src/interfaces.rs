//! A few helper types.

use std::sync::Arc;

/// Dynamic error type.
pub type DynError = Arc<dyn std::error::Error + Send + Sync>;

/// Result type with value wrapped into [`Arc`]s.
pub type ArcResult<T> = Result<Arc<T>, DynError>;

/// Decides if a failed computation evicts the cache entry.
pub type EvictionPredicate = Arc<dyn Fn(&DynError) -> bool + Send + Sync>;
