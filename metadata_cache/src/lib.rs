//! Caches for collection metadata and partition routing maps.
//!
//! [`RoutingResolver`] is the entry point. It resolves a collection by name or resource id through
//! the [`CollectionMetadataCache`] and its partition key ranges through the
//! [`PartitionRoutingCache`]. Both only talk to the remote metadata service through the traits in
//! [`fetch`]. [`mem::MemMetadataStore`] implements them in memory.
#![warn(missing_docs)]

mod collection;
mod error;
pub mod fetch;
pub mod mem;
mod resolver;
mod retry;
mod routing;

pub use collection::CollectionMetadataCache;
pub use error::Error;
pub use resolver::{RoutingResolver, RoutingResolverParams};
pub use retry::{IncompleteRoutingMapRetryPolicy, RetryDecision};
pub use routing::PartitionRoutingCache;

/// Result type of this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
