//! Async caches that deduplicate concurrent computations per key.
//!
//! Two flavours share the same building blocks:
//!
//! - [`SingleFlightCache`]: at most one computation in flight per key, callers wait for it. A
//!   caller that knows a value is obsolete can ask for it to be replaced.
//! - [`StaleServingCache`]: callers are served the current value while a refresh runs in the
//!   background.
//!
//! Computations run on detached tokio tasks and finish even if every caller went away.
#![warn(missing_docs)]

mod interfaces;
pub mod single_flight;
pub mod stale_serving;
pub mod utils;

pub use interfaces::{ArcResult, DynError, EvictionPredicate};
pub use single_flight::{CacheState, SingleFlightCache};
pub use stale_serving::StaleServingCache;
