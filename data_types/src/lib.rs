//! Shared data types for the collection metadata and partition routing caches.
//!
//! Everything in here is plain data plus pure functions. Caching, fetching and concurrency live in
//! other crates so the topology algorithms can be tested in isolation.
#![warn(missing_docs)]

pub mod collection;
pub mod partition;
pub mod routing_map;

pub use collection::{CollectionMetadata, CollectionRef, ResourceId};
pub use partition::{
    KeyRange, PartitionKeyRange, MAXIMUM_EXCLUSIVE_EFFECTIVE_PARTITION_KEY,
    MINIMUM_INCLUSIVE_EFFECTIVE_PARTITION_KEY,
};
pub use routing_map::{RoutingMap, RoutingMapError};
