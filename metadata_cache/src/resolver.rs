//! Entry point used by request dispatch.

use std::{sync::Arc, time::Duration};

use clap_blocks::metadata_cache::{MetadataCacheConfig, RoutingMapCacheMode};
use data_types::{
    CollectionMetadata, CollectionRef, KeyRange, PartitionKeyRange, ResourceId, RoutingMap,
};
use observability_deps::tracing::info;

use crate::{
    collection::CollectionMetadataCache,
    fetch::{CollectionFetcher, PartitionKeyRangeFetcher},
    routing::PartitionRoutingCache,
    Error, Result,
};

/// Parameters of a [`RoutingResolver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingResolverParams {
    /// Caching strategy for routing maps.
    pub routing_map_cache_mode: RoutingMapCacheMode,

    /// Upper bound for a single metadata fetch.
    pub fetch_timeout: Duration,
}

impl Default for RoutingResolverParams {
    fn default() -> Self {
        Self::from(&MetadataCacheConfig::default())
    }
}

impl From<&MetadataCacheConfig> for RoutingResolverParams {
    fn from(config: &MetadataCacheConfig) -> Self {
        Self {
            routing_map_cache_mode: config.routing_map_cache_mode,
            fetch_timeout: config.fetch_timeout,
        }
    }
}

/// Resolves collections and their partition key ranges.
///
/// Combines the [`CollectionMetadataCache`] with the [`PartitionRoutingCache`]. If the topology of
/// a collection that was addressed by name is gone, the collection was most likely recreated: the
/// name is resolved again and the lookup is retried once with the new resource id. A collection
/// addressed by resource id cannot be recovered that way and fails with
/// [`Error::CollectionRidGone`].
#[derive(Debug)]
pub struct RoutingResolver {
    collections: CollectionMetadataCache,
    routing: PartitionRoutingCache,
}

impl RoutingResolver {
    /// Create resolver with empty caches.
    pub fn new(
        collection_fetcher: Arc<dyn CollectionFetcher>,
        range_fetcher: Arc<dyn PartitionKeyRangeFetcher>,
        params: RoutingResolverParams,
    ) -> Self {
        let RoutingResolverParams {
            routing_map_cache_mode,
            fetch_timeout,
        } = params;

        Self {
            collections: CollectionMetadataCache::new(collection_fetcher, fetch_timeout),
            routing: PartitionRoutingCache::new(
                range_fetcher,
                fetch_timeout,
                routing_map_cache_mode,
            ),
        }
    }

    /// The collection cache.
    pub fn collections(&self) -> &CollectionMetadataCache {
        &self.collections
    }

    /// The routing map cache.
    pub fn routing(&self) -> &PartitionRoutingCache {
        &self.routing
    }

    /// Resolve a collection by name or resource id.
    pub async fn resolve_collection(&self, name_or_id: &str) -> Result<Arc<CollectionMetadata>> {
        let collection = CollectionRef::parse(name_or_id);
        self.resolve(&collection).await
    }

    /// Get the routing map of a collection.
    pub async fn get_routing_map(
        &self,
        name_or_id: &str,
        force_refresh: bool,
    ) -> Result<Arc<RoutingMap>> {
        let collection = CollectionRef::parse(name_or_id);
        let rid = resource_id(&*self.resolve(&collection).await?)?;

        if let Some(map) = self
            .routing
            .try_get_routing_map(&rid, force_refresh)
            .await?
        {
            return Ok(map);
        }
        self.routing.remove(&rid);

        match &collection {
            CollectionRef::Name(name) => {
                info!(
                    collection = %name,
                    stale_rid = %rid,
                    "topology gone, resolving collection again"
                );
                let md = self.collections.refresh_on_stale_name(name, Some(&rid)).await?;
                let new_rid = resource_id(&md)?;

                self.routing
                    .try_get_routing_map(&new_rid, force_refresh)
                    .await?
                    .ok_or_else(|| Error::NotFound {
                        descr: format!("partition key ranges of collection {name}"),
                    })
            }
            CollectionRef::ResourceId(_) => {
                self.collections.remove_by_rid(&rid);
                Err(Error::CollectionRidGone { rid })
            }
        }
    }

    /// Ranges of the collection that intersect `range`, ordered by their minimum.
    pub async fn overlapping_ranges(
        &self,
        name_or_id: &str,
        range: &KeyRange,
    ) -> Result<Vec<PartitionKeyRange>> {
        let map = self.get_routing_map(name_or_id, false).await?;
        Ok(map.overlapping_ranges(range).into_iter().cloned().collect())
    }

    /// Range of the collection that contains the effective partition key `key`.
    pub async fn range_by_effective_partition_key(
        &self,
        name_or_id: &str,
        key: &str,
    ) -> Result<Option<PartitionKeyRange>> {
        let map = self.get_routing_map(name_or_id, false).await?;
        Ok(map.range_by_effective_partition_key(key).cloned())
    }

    /// Range of the collection with the given id.
    ///
    /// An id that the cached map has never seen may belong to a split that happened after the map
    /// was read. In that case the map is refreshed once.
    pub async fn range_by_id(
        &self,
        name_or_id: &str,
        range_id: &str,
    ) -> Result<Option<PartitionKeyRange>> {
        let map = self.get_routing_map(name_or_id, false).await?;
        if let Some(range) = map.range_by_id(range_id) {
            return Ok(Some(range.clone()));
        }
        if map.is_gone(range_id) {
            return Ok(None);
        }

        let map = self.get_routing_map(name_or_id, true).await?;
        Ok(map.range_by_id(range_id).cloned())
    }

    async fn resolve(&self, collection: &CollectionRef) -> Result<Arc<CollectionMetadata>> {
        match (collection, self.collections.resolve(collection).await) {
            (CollectionRef::ResourceId(rid), Err(e)) if e.is_not_found() => {
                self.collections.remove_by_rid(rid);
                Err(Error::CollectionRidGone { rid: rid.clone() })
            }
            (_, res) => res,
        }
    }
}

fn resource_id(md: &CollectionMetadata) -> Result<ResourceId> {
    md.resource_id.clone().ok_or_else(|| Error::NotFound {
        descr: format!("resource id of collection {}", md.name),
    })
}
