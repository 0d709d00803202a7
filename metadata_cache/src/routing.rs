//! Cache of partition routing maps.

use std::{future::Future, sync::Arc, time::Duration};

use async_cache::{DynError, SingleFlightCache, StaleServingCache};
use clap_blocks::metadata_cache::RoutingMapCacheMode;
use data_types::{KeyRange, PartitionKeyRange, ResourceId, RoutingMap};
use observability_deps::tracing::{debug, info, warn};
use snafu::ResultExt;

use crate::{
    error::{is_unrecoverable, IncompleteTopologySnafu},
    fetch::{bounded, PartitionKeyRangeFetcher},
    retry::{IncompleteRoutingMapRetryPolicy, RetryDecision},
    Error, Result,
};

/// Returns true if both maps describe the same version of the topology of a collection.
fn same_version(a: &RoutingMap, b: &RoutingMap) -> bool {
    a.collection_rid() == b.collection_rid()
        && a.change_feed_next_if_none_match() == b.change_feed_next_if_none_match()
}

#[derive(Debug)]
enum Backend {
    StaleServing(StaleServingCache<ResourceId, RoutingMap>),
    SingleFlight(SingleFlightCache<ResourceId, RoutingMap>),
}

impl Backend {
    fn new(mode: RoutingMapCacheMode) -> Self {
        match mode {
            RoutingMapCacheMode::StaleServing => {
                Self::StaleServing(StaleServingCache::new(Arc::new(is_unrecoverable)))
            }
            RoutingMapCacheMode::SingleFlight => {
                Self::SingleFlight(
                    SingleFlightCache::new(Arc::new(same_version))
                        .with_eviction(Arc::new(is_unrecoverable)),
                )
            }
        }
    }
}

/// Caches the [`RoutingMap`] of every collection, keyed by resource id.
///
/// A map is only rebuilt when a caller reports the version it holds as outdated. Rebuilds are
/// incremental: only the ranges created since the outdated map was read are fetched and spliced
/// into it. If that yields an incomplete topology, the lookup is retried once with a full read.
#[derive(Debug)]
pub struct PartitionRoutingCache {
    fetcher: Arc<dyn PartitionKeyRangeFetcher>,
    fetch_timeout: Duration,
    backend: Backend,
}

impl PartitionRoutingCache {
    /// Create empty cache.
    pub fn new(
        fetcher: Arc<dyn PartitionKeyRangeFetcher>,
        fetch_timeout: Duration,
        mode: RoutingMapCacheMode,
    ) -> Self {
        Self {
            fetcher,
            fetch_timeout,
            backend: Backend::new(mode),
        }
    }

    /// Get the routing map of a collection.
    ///
    /// If the cached map is the same version as `previous`, it is rebuilt on top of it. Returns
    /// `None` if the collection does not exist (anymore).
    pub async fn try_lookup(
        &self,
        collection_rid: &ResourceId,
        previous: Option<&Arc<RoutingMap>>,
    ) -> Result<Option<Arc<RoutingMap>>> {
        let mut policy = IncompleteRoutingMapRetryPolicy::default();
        let mut previous = previous.map(Arc::clone);

        loop {
            match self.lookup_once(collection_rid, previous.as_ref()).await {
                Ok(map) => return Ok(Some(map)),
                Err(e) if e.is_not_found() => {
                    debug!(%collection_rid, error = %e, "no routing map");
                    return Ok(None);
                }
                Err(e) => match policy.should_retry(&e) {
                    RetryDecision::RetryNow => {
                        warn!(
                            %collection_rid,
                            error = %e,
                            "incomplete routing map, retrying with a full read"
                        );
                        previous = None;
                    }
                    RetryDecision::NoRetry => return Err(e),
                },
            }
        }
    }

    /// Get the routing map, rebuilding it once if `force_refresh` is set and a map exists.
    pub async fn try_get_routing_map(
        &self,
        collection_rid: &ResourceId,
        force_refresh: bool,
    ) -> Result<Option<Arc<RoutingMap>>> {
        let map = self.try_lookup(collection_rid, None).await?;
        match map {
            Some(map) if force_refresh => self.try_lookup(collection_rid, Some(&map)).await,
            map => Ok(map),
        }
    }

    /// Ranges that intersect `range`, ordered by their minimum.
    ///
    /// `None` if there is no routing map for the collection.
    pub async fn try_get_overlapping_ranges(
        &self,
        collection_rid: &ResourceId,
        range: &KeyRange,
        force_refresh: bool,
    ) -> Result<Option<Vec<PartitionKeyRange>>> {
        let map = self
            .try_get_routing_map(collection_rid, force_refresh)
            .await?;
        Ok(map.map(|map| map.overlapping_ranges(range).into_iter().cloned().collect()))
    }

    /// Ranges that intersect any of `ranges`, without duplicates and ordered by their minimum.
    pub async fn try_get_overlapping_ranges_multi(
        &self,
        collection_rid: &ResourceId,
        ranges: &[KeyRange],
        force_refresh: bool,
    ) -> Result<Option<Vec<PartitionKeyRange>>> {
        let map = self
            .try_get_routing_map(collection_rid, force_refresh)
            .await?;
        Ok(map.map(|map| {
            map.overlapping_ranges_multi(ranges)
                .into_iter()
                .cloned()
                .collect()
        }))
    }

    /// Range with the given id.
    ///
    /// `None` if there is no routing map or the map has no such range.
    pub async fn try_get_range_by_id(
        &self,
        collection_rid: &ResourceId,
        range_id: &str,
        force_refresh: bool,
    ) -> Result<Option<PartitionKeyRange>> {
        let map = self
            .try_get_routing_map(collection_rid, force_refresh)
            .await?;
        Ok(map.and_then(|map| map.range_by_id(range_id).cloned()))
    }

    /// Range that contains the effective partition key `key`.
    pub async fn try_get_range_by_effective_partition_key(
        &self,
        collection_rid: &ResourceId,
        key: &str,
    ) -> Result<Option<PartitionKeyRange>> {
        let map = self.try_get_routing_map(collection_rid, false).await?;
        Ok(map.and_then(|map| map.range_by_effective_partition_key(key).cloned()))
    }

    /// Number of cached maps, including maps that are being built.
    pub fn len(&self) -> usize {
        match &self.backend {
            Backend::StaleServing(cache) => cache.len(),
            Backend::SingleFlight(cache) => cache.len(),
        }
    }

    /// Returns true if no map is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop the cached map. Returns true if there was one.
    pub fn remove(&self, collection_rid: &ResourceId) -> bool {
        match &self.backend {
            Backend::StaleServing(cache) => cache.remove(collection_rid),
            Backend::SingleFlight(cache) => cache.remove(collection_rid),
        }
    }

    async fn lookup_once(
        &self,
        collection_rid: &ResourceId,
        previous: Option<&Arc<RoutingMap>>,
    ) -> Result<Arc<RoutingMap>> {
        let res = match &self.backend {
            Backend::StaleServing(cache) => {
                cache
                    .get_if(
                        collection_rid,
                        |cached| self.build(collection_rid, cached),
                        |cached| previous.is_some_and(|previous| same_version(cached, previous)),
                    )
                    .await
            }
            Backend::SingleFlight(cache) => {
                let (res, state) = cache
                    .get(
                        collection_rid,
                        previous.map(|previous| previous.as_ref()),
                        |_| self.build(collection_rid, previous.map(Arc::clone)),
                    )
                    .await;
                debug!(%collection_rid, ?state, "routing map lookup");
                res
            }
        };

        res.map_err(|e| Error::from_dyn(&e))
    }

    fn build(
        &self,
        collection_rid: &ResourceId,
        previous: Option<Arc<RoutingMap>>,
    ) -> impl Future<Output = Result<RoutingMap, DynError>> + Send + 'static {
        let fetcher = Arc::clone(&self.fetcher);
        let fetch_timeout = self.fetch_timeout;
        let collection_rid = collection_rid.clone();

        async move {
            build_routing_map(fetcher.as_ref(), fetch_timeout, collection_rid, previous)
                .await
                .map_err(Error::into_dyn)
        }
    }
}

/// Build the routing map of a collection, on top of `previous` if given.
///
/// With a base map only the change feed since that map is read and combined with it. Without one
/// all ranges are read and ranges that were split during the read are dropped.
pub(crate) async fn build_routing_map(
    fetcher: &dyn PartitionKeyRangeFetcher,
    fetch_timeout: Duration,
    collection_rid: ResourceId,
    previous: Option<Arc<RoutingMap>>,
) -> Result<RoutingMap> {
    let if_none_match = previous
        .as_ref()
        .and_then(|previous| previous.change_feed_next_if_none_match());
    let what = format!("fetch partition key ranges of collection {collection_rid}");
    let feed = bounded(
        fetch_timeout,
        &what,
        fetcher.fetch_partition_key_ranges(&collection_rid, if_none_match),
    )
    .await?;
    let fetched = feed.ranges.len();

    let map = match &previous {
        None => RoutingMap::try_create_complete(
            collection_rid.clone(),
            feed.ranges,
            feed.continuation,
        ),
        Some(previous) => previous.try_combine(feed.ranges, feed.continuation),
    }
    .context(IncompleteTopologySnafu {
        collection_rid: collection_rid.clone(),
    })?;

    match previous {
        Some(previous) if previous.ordered_ranges() != map.ordered_ranges() => {
            info!(
                %collection_rid,
                fetched,
                before = previous.range_count(),
                after = map.range_count(),
                "partition topology changed"
            );
        }
        _ => {
            debug!(
                %collection_rid,
                fetched,
                ranges = map.range_count(),
                "routing map built"
            );
        }
    }

    Ok(map)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use data_types::RoutingMapError;
    use futures_test_utils::AssertFutureExt;
    use test_helpers::tracing::TracingCapture;

    use crate::{fetch::FetchError, mem::MemMetadataStore};

    use super::*;

    const MODES: [RoutingMapCacheMode; 2] = [
        RoutingMapCacheMode::StaleServing,
        RoutingMapCacheMode::SingleFlight,
    ];

    fn setup(
        mode: RoutingMapCacheMode,
    ) -> (Arc<MemMetadataStore>, PartitionRoutingCache, ResourceId) {
        test_helpers::maybe_start_logging();
        let store = Arc::new(MemMetadataStore::new());
        let rid = store
            .create_collection("dbs/db/colls/c1")
            .resource_id
            .unwrap();
        let cache = PartitionRoutingCache::new(
            Arc::clone(&store) as _,
            Duration::from_secs(10),
            mode,
        );
        (store, cache, rid)
    }

    fn ids(ranges: &[PartitionKeyRange]) -> Vec<&str> {
        ranges.iter().map(|range| range.id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_lookup_is_cached() {
        for mode in MODES {
            let (store, cache, rid) = setup(mode);

            let map = cache.try_lookup(&rid, None).await.unwrap().unwrap();
            assert_eq!(ids(map.ordered_ranges()), vec!["0"]);
            assert_eq!(map.collection_rid(), &rid);

            let map2 = cache.try_lookup(&rid, None).await.unwrap().unwrap();
            assert!(Arc::ptr_eq(&map, &map2));
            assert_eq!(store.range_fetch_count(), 1, "{mode:?}");
        }
    }

    #[tokio::test]
    async fn test_split_is_combined_incrementally() {
        for mode in MODES {
            let (store, cache, rid) = setup(mode);
            let map = cache.try_lookup(&rid, None).await.unwrap().unwrap();

            store.split_range(&rid, "0", "80").unwrap();

            // not refreshed without a hint
            let same = cache.try_lookup(&rid, None).await.unwrap().unwrap();
            assert!(Arc::ptr_eq(&map, &same));

            let new = cache.try_lookup(&rid, Some(&map)).await.unwrap().unwrap();
            assert_eq!(ids(new.ordered_ranges()), vec!["0.0", "0.1"]);
            assert!(new.is_gone("0"));

            // differential read from the continuation of the first map
            assert_eq!(
                store.range_fetch_tokens(),
                vec![None, Some("1".to_owned())],
                "{mode:?}"
            );

            // an outdated hint does not trigger another rebuild
            let same = cache.try_lookup(&rid, Some(&map)).await.unwrap().unwrap();
            assert!(Arc::ptr_eq(&new, &same));
            assert_eq!(store.range_fetch_count(), 2, "{mode:?}");
        }
    }

    #[tokio::test]
    async fn test_not_found() {
        for mode in MODES {
            let (store, cache, _rid) = setup(mode);
            let unknown = ResourceId::new("unknown");
            assert_eq!(cache.try_lookup(&unknown, None).await.unwrap(), None);
            assert_eq!(cache.try_lookup(&unknown, None).await.unwrap(), None);
            assert_eq!(store.range_fetch_count(), 2, "{mode:?}");
        }
    }

    #[tokio::test]
    async fn test_unknown_collections_leave_no_entries() {
        for mode in MODES {
            let (store, cache, _rid) = setup(mode);
            for i in 0..50 {
                let unknown = ResourceId::new(format!("unknown{i}"));
                assert_eq!(cache.try_lookup(&unknown, None).await.unwrap(), None);
            }
            assert_eq!(cache.len(), 0, "{mode:?}");
            assert!(cache.is_empty());
            assert_eq!(store.range_fetch_count(), 50, "{mode:?}");
        }
    }

    #[tokio::test]
    async fn test_deleted_collection() {
        for mode in MODES {
            let (store, cache, rid) = setup(mode);
            let map = cache.try_lookup(&rid, None).await.unwrap().unwrap();

            assert!(store.delete_collection("dbs/db/colls/c1"));
            assert_eq!(cache.try_lookup(&rid, Some(&map)).await.unwrap(), None);
            assert!(cache.is_empty(), "{mode:?}");
        }
    }

    #[tokio::test]
    async fn test_incomplete_read_is_retried_once() {
        for mode in MODES {
            let (store, cache, rid) = setup(mode);
            let map = cache.try_lookup(&rid, None).await.unwrap().unwrap();
            store.split_range(&rid, "0", "80").unwrap();

            // differential read misses the right child, full read is fine
            store.return_incomplete_range_reads(1);
            let capture = TracingCapture::new();
            let new = cache.try_lookup(&rid, Some(&map)).await.unwrap().unwrap();
            assert_eq!(ids(new.ordered_ranges()), vec!["0.0", "0.1"]);
            assert_eq!(
                store.range_fetch_tokens(),
                vec![None, Some("1".to_owned()), None],
                "{mode:?}"
            );
            assert!(capture.contains(&[
                ("level", "WARN"),
                ("message", "incomplete routing map, retrying with a full read"),
                ("collection_rid", rid.as_str()),
            ]));
        }
    }

    #[tokio::test]
    async fn test_incomplete_read_gives_up_after_retry() {
        for mode in MODES {
            let (store, cache, rid) = setup(mode);
            let map = cache.try_lookup(&rid, None).await.unwrap().unwrap();
            store.split_range(&rid, "0", "80").unwrap();

            store.return_incomplete_range_reads(2);
            let err = cache.try_lookup(&rid, Some(&map)).await.unwrap_err();
            assert_matches!(
                err,
                Error::IncompleteTopology {
                    source: RoutingMapError::DoesNotEndAtMaximum { .. },
                    ..
                }
            );
            assert_eq!(store.range_fetch_count(), 3, "{mode:?}");
            assert_eq!(cache.len(), 0, "{mode:?}");

            // next lookup starts over
            let new = cache.try_lookup(&rid, None).await.unwrap().unwrap();
            assert_eq!(ids(new.ordered_ranges()), vec!["0.0", "0.1"]);
            assert_eq!(store.range_fetch_count(), 4, "{mode:?}");
        }
    }

    #[tokio::test]
    async fn test_transient_refresh_error() {
        let (store, cache, rid) = setup(RoutingMapCacheMode::StaleServing);
        let map = cache.try_lookup(&rid, None).await.unwrap().unwrap();
        store.split_range(&rid, "0", "80").unwrap();
        store.inject_range_error(FetchError::Transient {
            descr: "connection reset".to_owned(),
        });

        let err = cache.try_lookup(&rid, Some(&map)).await.unwrap_err();
        assert_matches!(err, Error::Transient { .. });

        // stale map is still served
        let same = cache.try_lookup(&rid, None).await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&map, &same));

        let new = cache.try_lookup(&rid, Some(&map)).await.unwrap().unwrap();
        assert_eq!(new.range_count(), 2);
    }

    #[tokio::test]
    async fn test_stale_map_is_served_during_refresh() {
        let (store, cache, rid) = setup(RoutingMapCacheMode::StaleServing);
        let cache = Arc::new(cache);
        let map = cache.try_lookup(&rid, None).await.unwrap().unwrap();
        store.split_range(&rid, "0", "80").unwrap();
        store.set_delay(Some(Duration::from_millis(100)));

        let cache_captured = Arc::clone(&cache);
        let map_captured = Arc::clone(&map);
        let rid_captured = rid.clone();
        let mut refresh = tokio::spawn(async move {
            cache_captured
                .try_lookup(&rid_captured, Some(&map_captured))
                .await
        });
        refresh.assert_pending().await;

        // does not block
        let stale = cache
            .try_lookup(&rid, None)
            .with_timeout()
            .await
            .unwrap()
            .unwrap();
        assert!(Arc::ptr_eq(&map, &stale));

        let new = refresh.with_timeout().await.unwrap().unwrap().unwrap();
        assert_eq!(new.range_count(), 2);
    }

    #[tokio::test]
    async fn test_single_flight_refresh_blocks() {
        let (store, cache, rid) = setup(RoutingMapCacheMode::SingleFlight);
        let cache = Arc::new(cache);
        let map = cache.try_lookup(&rid, None).await.unwrap().unwrap();
        store.split_range(&rid, "0", "80").unwrap();
        store.set_delay(Some(Duration::from_millis(100)));

        let cache_captured = Arc::clone(&cache);
        let map_captured = Arc::clone(&map);
        let rid_captured = rid.clone();
        let refresh = tokio::spawn(async move {
            cache_captured
                .try_lookup(&rid_captured, Some(&map_captured))
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        // joins the refresh
        let new = cache
            .try_lookup(&rid, None)
            .with_timeout()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(new.range_count(), 2);

        let new2 = refresh.with_timeout().await.unwrap().unwrap().unwrap();
        assert!(Arc::ptr_eq(&new, &new2));
        assert_eq!(store.range_fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_queries() {
        for mode in MODES {
            let (store, cache, rid) = setup(mode);
            cache.try_lookup(&rid, None).await.unwrap().unwrap();
            store.split_range(&rid, "0", "40").unwrap();
            store.split_range(&rid, "0.1", "80").unwrap();

            // cached map does not know about the splits yet
            let ranges = cache
                .try_get_overlapping_ranges(&rid, &KeyRange::new("30", "50"), false)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(ids(&ranges), vec!["0"]);

            let ranges = cache
                .try_get_overlapping_ranges(&rid, &KeyRange::new("30", "50"), true)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(ids(&ranges), vec!["0.0", "0.1.0"]);

            let ranges = cache
                .try_get_overlapping_ranges_multi(
                    &rid,
                    &[KeyRange::new("90", "A0"), KeyRange::new("10", "50")],
                    false,
                )
                .await
                .unwrap()
                .unwrap();
            assert_eq!(ids(&ranges), vec!["0.0", "0.1.0", "0.1.1"]);

            let range = cache
                .try_get_range_by_id(&rid, "0.1.1", false)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(range.min_inclusive, "80");
            assert_eq!(cache.try_get_range_by_id(&rid, "0", false).await.unwrap(), None);

            let range = cache
                .try_get_range_by_effective_partition_key(&rid, "7F")
                .await
                .unwrap()
                .unwrap();
            assert_eq!(range.id, "0.1.0");

            let unknown = ResourceId::new("unknown");
            assert_eq!(
                cache
                    .try_get_overlapping_ranges(&unknown, &KeyRange::full(), false)
                    .await
                    .unwrap(),
                None
            );
        }
    }

    #[tokio::test]
    async fn test_topology_change_is_logged() {
        let (store, cache, rid) = setup(RoutingMapCacheMode::StaleServing);
        let capture = TracingCapture::new();

        cache.try_get_routing_map(&rid, false).await.unwrap().unwrap();
        store.split_range(&rid, "0", "80").unwrap();
        cache.try_get_routing_map(&rid, true).await.unwrap().unwrap();

        assert!(capture.contains(&[
            ("level", "INFO"),
            ("message", "partition topology changed"),
            ("collection_rid", rid.as_str()),
            ("before", "1"),
            ("after", "2"),
        ]));
    }

    #[tokio::test]
    async fn test_remove() {
        for mode in MODES {
            let (store, cache, rid) = setup(mode);
            assert!(!cache.remove(&rid));

            cache.try_lookup(&rid, None).await.unwrap().unwrap();
            assert!(cache.remove(&rid));

            cache.try_lookup(&rid, None).await.unwrap().unwrap();
            assert_eq!(store.range_fetch_tokens(), vec![None, None], "{mode:?}");
        }
    }

    #[tokio::test]
    async fn test_build_routing_map() {
        let store = MemMetadataStore::new();
        let rid = ResourceId::new("R1");
        store.create_collection_with_ranges(
            "dbs/db/colls/c1",
            rid.clone(),
            vec![
                PartitionKeyRange::new("r0", "", "05"),
                PartitionKeyRange::new("r2", "10", "FF"),
            ],
        );

        let err = build_routing_map(&store, Duration::from_secs(1), rid.clone(), None)
            .await
            .unwrap_err();
        assert_matches!(
            &err,
            Error::IncompleteTopology {
                collection_rid,
                source: RoutingMapError::Gap { .. },
            } if collection_rid == &rid
        );

        store.inject_range_error(FetchError::NotFound {
            descr: "gone".to_owned(),
        });
        let err = build_routing_map(&store, Duration::from_secs(1), rid, None)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
