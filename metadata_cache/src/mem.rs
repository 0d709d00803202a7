//! In-memory metadata service.
//!
//! Keeps collections and the change feed of their partition key ranges in memory. Supports
//! splits, merges, collection recreation and fault injection, which makes it useful for tests and
//! for embedding the caches without a remote service.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    time::Duration,
};

use async_trait::async_trait;
use data_types::{
    CollectionMetadata, PartitionKeyRange, ResourceId, MAXIMUM_EXCLUSIVE_EFFECTIVE_PARTITION_KEY,
    MINIMUM_INCLUSIVE_EFFECTIVE_PARTITION_KEY,
};
use parking_lot::Mutex;

use crate::fetch::{CollectionFetcher, FetchError, PartitionKeyRangeFeed, PartitionKeyRangeFetcher};

/// In-memory implementation of [`CollectionFetcher`] and [`PartitionKeyRangeFetcher`].
#[derive(Debug, Default)]
pub struct MemMetadataStore {
    state: Mutex<MemState>,
}

#[derive(Debug, Default)]
struct MemState {
    /// By normalized name.
    collections: HashMap<String, CollectionMetadata>,
    topologies: HashMap<ResourceId, Topology>,
    next_rid: u64,

    collection_errors: VecDeque<FetchError>,
    range_errors: VecDeque<FetchError>,
    incomplete_range_reads: usize,
    delay: Option<Duration>,

    collection_fetches: usize,
    range_fetch_tokens: Vec<Option<String>>,
}

impl MemState {
    fn new_rid(&mut self) -> ResourceId {
        self.next_rid += 1;
        ResourceId::new(format!("rid-{}", self.next_rid))
    }
}

/// Change feed of one collection. Ranges are only ever appended.
#[derive(Debug)]
struct Topology {
    feed: Vec<PartitionKeyRange>,
}

impl Topology {
    fn live(&self) -> impl Iterator<Item = &PartitionKeyRange> {
        let gone = self
            .feed
            .iter()
            .flat_map(|range| range.parents.iter())
            .collect::<HashSet<_>>();
        self.feed
            .iter()
            .filter(move |range| !gone.contains(&range.id))
    }

    fn find_live(&self, id: &str) -> Option<PartitionKeyRange> {
        self.live().find(|range| range.id == id).cloned()
    }

    fn continuation(&self) -> String {
        self.feed.len().to_string()
    }
}

impl MemMetadataStore {
    /// Create empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a collection with a single range covering the whole key space.
    pub fn create_collection(&self, name: &str) -> CollectionMetadata {
        let mut state = self.state.lock();
        let rid = state.new_rid();
        insert_collection(
            &mut *state,
            name,
            rid,
            vec![PartitionKeyRange::new(
                "0",
                MINIMUM_INCLUSIVE_EFFECTIVE_PARTITION_KEY,
                MAXIMUM_EXCLUSIVE_EFFECTIVE_PARTITION_KEY,
            )],
        )
    }

    /// Create a collection with the given resource id and ranges.
    ///
    /// The ranges are not validated, so an incomplete topology can be set up on purpose.
    pub fn create_collection_with_ranges(
        &self,
        name: &str,
        rid: impl Into<ResourceId>,
        ranges: Vec<PartitionKeyRange>,
    ) -> CollectionMetadata {
        let mut state = self.state.lock();
        insert_collection(&mut *state, name, rid.into(), ranges)
    }

    /// Drop and create the collection `name` again. The new incarnation gets a new resource id.
    ///
    /// Returns `None` if the collection does not exist.
    pub fn recreate_collection(&self, name: &str) -> Option<CollectionMetadata> {
        let mut state = self.state.lock();
        let old = state.collections.remove(name.trim_matches('/'))?;
        if let Some(rid) = &old.resource_id {
            state.topologies.remove(rid);
        }

        let rid = state.new_rid();
        Some(insert_collection(
            &mut *state,
            name,
            rid,
            vec![PartitionKeyRange::new(
                "0",
                MINIMUM_INCLUSIVE_EFFECTIVE_PARTITION_KEY,
                MAXIMUM_EXCLUSIVE_EFFECTIVE_PARTITION_KEY,
            )],
        ))
    }

    /// Drop a collection. Returns true if it existed.
    pub fn delete_collection(&self, name: &str) -> bool {
        let mut state = self.state.lock();
        let Some(old) = state.collections.remove(name.trim_matches('/')) else {
            return false;
        };
        if let Some(rid) = &old.resource_id {
            state.topologies.remove(rid);
        }
        true
    }

    /// Split the live range `range_id` at key `at`.
    ///
    /// Returns the ids of the two children, or `None` if the range is unknown or `at` is not
    /// strictly inside of it.
    pub fn split_range(
        &self,
        rid: &ResourceId,
        range_id: &str,
        at: &str,
    ) -> Option<(String, String)> {
        let mut state = self.state.lock();
        let topology = state.topologies.get_mut(rid)?;
        let parent = topology.find_live(range_id)?;
        if at <= parent.min_inclusive.as_str() || at >= parent.max_exclusive.as_str() {
            return None;
        }

        let left = PartitionKeyRange::new(
            format!("{range_id}.0"),
            parent.min_inclusive.clone(),
            at,
        )
        .with_parents([range_id]);
        let right = PartitionKeyRange::new(
            format!("{range_id}.1"),
            at,
            parent.max_exclusive.clone(),
        )
        .with_parents([range_id]);
        let ids = (left.id.clone(), right.id.clone());
        topology.feed.extend([left, right]);

        Some(ids)
    }

    /// Merge the adjacent live ranges `left_id` and `right_id`.
    ///
    /// Returns the id of the merged range, or `None` if the ranges are unknown or not adjacent.
    pub fn merge_ranges(&self, rid: &ResourceId, left_id: &str, right_id: &str) -> Option<String> {
        let mut state = self.state.lock();
        let topology = state.topologies.get_mut(rid)?;
        let left = topology.find_live(left_id)?;
        let right = topology.find_live(right_id)?;
        if left.max_exclusive != right.min_inclusive {
            return None;
        }

        let merged = PartitionKeyRange::new(
            format!("{left_id}+{right_id}"),
            left.min_inclusive,
            right.max_exclusive,
        )
        .with_parents([left_id, right_id]);
        let id = merged.id.clone();
        topology.feed.push(merged);

        Some(id)
    }

    /// Fail the next collection fetch with `e`. Errors queue up.
    pub fn inject_collection_error(&self, e: FetchError) {
        self.state.lock().collection_errors.push_back(e);
    }

    /// Fail the next range fetch with `e`. Errors queue up.
    pub fn inject_range_error(&self, e: FetchError) {
        self.state.lock().range_errors.push_back(e);
    }

    /// Make the next `n` range fetches drop the last range of their response, as if a split
    /// raced with the read.
    pub fn return_incomplete_range_reads(&self, n: usize) {
        self.state.lock().incomplete_range_reads = n;
    }

    /// Delay every fetch by the given duration.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.state.lock().delay = delay;
    }

    /// Number of collection fetches, by name or by id.
    pub fn collection_fetch_count(&self) -> usize {
        self.state.lock().collection_fetches
    }

    /// Number of range fetches.
    pub fn range_fetch_count(&self) -> usize {
        self.state.lock().range_fetch_tokens.len()
    }

    /// The `if-none-match` token of every range fetch, in order.
    pub fn range_fetch_tokens(&self) -> Vec<Option<String>> {
        self.state.lock().range_fetch_tokens.clone()
    }

    async fn respond<T: Send>(
        &self,
        f: impl FnOnce(&mut MemState) -> Result<T, FetchError> + Send,
    ) -> Result<T, FetchError> {
        let (res, delay) = {
            let mut state = self.state.lock();
            let res = f(&mut *state);
            (res, state.delay)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        res
    }
}

fn insert_collection(
    state: &mut MemState,
    name: &str,
    rid: ResourceId,
    ranges: Vec<PartitionKeyRange>,
) -> CollectionMetadata {
    let md = CollectionMetadata::new(name, rid.clone())
        .with_partition_key_paths(["/pk"])
        .with_etag(format!("etag-{rid}"));
    state.collections.insert(md.name.clone(), md.clone());
    state.topologies.insert(rid, Topology { feed: ranges });
    md
}

#[async_trait]
impl CollectionFetcher for MemMetadataStore {
    async fn fetch_by_name(&self, name: &str) -> Result<CollectionMetadata, FetchError> {
        self.respond(|state| {
            state.collection_fetches += 1;
            if let Some(e) = state.collection_errors.pop_front() {
                return Err(e);
            }

            state
                .collections
                .get(name.trim_matches('/'))
                .cloned()
                .ok_or_else(|| FetchError::NotFound {
                    descr: format!("collection {name}"),
                })
        })
        .await
    }

    async fn fetch_by_rid(&self, rid: &ResourceId) -> Result<CollectionMetadata, FetchError> {
        self.respond(|state| {
            state.collection_fetches += 1;
            if let Some(e) = state.collection_errors.pop_front() {
                return Err(e);
            }

            state
                .collections
                .values()
                .find(|md| md.resource_id.as_ref() == Some(rid))
                .cloned()
                .ok_or_else(|| FetchError::NotFound {
                    descr: format!("collection with resource id {rid}"),
                })
        })
        .await
    }
}

#[async_trait]
impl PartitionKeyRangeFetcher for MemMetadataStore {
    async fn fetch_partition_key_ranges(
        &self,
        collection_rid: &ResourceId,
        if_none_match: Option<&str>,
    ) -> Result<PartitionKeyRangeFeed, FetchError> {
        self.respond(|state| {
            state
                .range_fetch_tokens
                .push(if_none_match.map(ToOwned::to_owned));
            if let Some(e) = state.range_errors.pop_front() {
                return Err(e);
            }

            let incomplete = state.incomplete_range_reads > 0;
            state.incomplete_range_reads = state.incomplete_range_reads.saturating_sub(1);

            let topology =
                state
                    .topologies
                    .get(collection_rid)
                    .ok_or_else(|| FetchError::NotFound {
                        descr: format!("partition key ranges of collection {collection_rid}"),
                    })?;

            // unknown tokens fall back to a full read
            let mut ranges = match if_none_match.and_then(|token| token.parse::<usize>().ok()) {
                Some(pos) if pos <= topology.feed.len() => topology.feed[pos..].to_vec(),
                _ => topology.live().cloned().collect(),
            };
            if incomplete {
                ranges.pop();
            }

            Ok(PartitionKeyRangeFeed {
                ranges,
                continuation: Some(topology.continuation()),
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use data_types::RoutingMap;

    use super::*;

    #[tokio::test]
    async fn test_collections() {
        let store = MemMetadataStore::new();
        let c1 = store.create_collection("/dbs/db/colls/c1/");
        assert_eq!(c1.name, "dbs/db/colls/c1");
        let rid = c1.resource_id.clone().unwrap();

        assert_eq!(store.fetch_by_name("dbs/db/colls/c1").await.unwrap(), c1);
        assert_eq!(store.fetch_by_rid(&rid).await.unwrap(), c1);
        assert_eq!(store.collection_fetch_count(), 2);

        let c1_new = store.recreate_collection("dbs/db/colls/c1").unwrap();
        assert_ne!(c1_new.resource_id, c1.resource_id);
        assert!(matches!(
            store.fetch_by_rid(&rid).await,
            Err(FetchError::NotFound { .. })
        ));
        assert!(matches!(
            store.fetch_partition_key_ranges(&rid, None).await,
            Err(FetchError::NotFound { .. })
        ));

        assert!(store.delete_collection("dbs/db/colls/c1"));
        assert!(!store.delete_collection("dbs/db/colls/c1"));
        assert!(store.recreate_collection("dbs/db/colls/c1").is_none());
        assert_eq!(
            store.fetch_by_name("dbs/db/colls/c1").await.unwrap_err(),
            FetchError::NotFound {
                descr: "collection dbs/db/colls/c1".to_owned()
            }
        );
    }

    #[tokio::test]
    async fn test_change_feed() {
        let store = MemMetadataStore::new();
        let rid = store
            .create_collection("dbs/db/colls/c1")
            .resource_id
            .unwrap();

        let feed = store.fetch_partition_key_ranges(&rid, None).await.unwrap();
        assert_eq!(feed.ranges.len(), 1);
        assert_eq!(feed.continuation.as_deref(), Some("1"));

        // nothing changed
        let feed = store
            .fetch_partition_key_ranges(&rid, Some("1"))
            .await
            .unwrap();
        assert!(feed.ranges.is_empty());

        let (left, right) = store.split_range(&rid, "0", "80").unwrap();
        assert!(store.split_range(&rid, "0", "90").is_none());
        assert!(store.split_range(&rid, &left, "90").is_none());

        let feed = store
            .fetch_partition_key_ranges(&rid, Some("1"))
            .await
            .unwrap();
        let ids = feed.ranges.iter().map(|r| r.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, [left.as_str(), right.as_str()]);
        assert_eq!(feed.continuation.as_deref(), Some("3"));

        // a full read only returns live ranges
        let feed = store.fetch_partition_key_ranges(&rid, None).await.unwrap();
        assert_eq!(feed.ranges.len(), 2);

        let merged = store.merge_ranges(&rid, &left, &right).unwrap();
        assert!(store.merge_ranges(&rid, &left, &right).is_none());
        let feed = store.fetch_partition_key_ranges(&rid, None).await.unwrap();
        let map = RoutingMap::try_create_complete(rid.clone(), feed.ranges, feed.continuation)
            .unwrap();
        assert_eq!(map.range_count(), 1);
        assert_eq!(map.ordered_ranges()[0].id, merged);

        assert_eq!(
            store.range_fetch_tokens(),
            vec![
                None,
                Some("1".to_owned()),
                Some("1".to_owned()),
                None,
                None
            ]
        );
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let store = MemMetadataStore::new();
        let rid = store
            .create_collection("dbs/db/colls/c1")
            .resource_id
            .unwrap();

        let e = FetchError::Transient {
            descr: "throttled".to_owned(),
        };
        store.inject_collection_error(e.clone());
        store.inject_range_error(e.clone());
        assert_eq!(store.fetch_by_rid(&rid).await.unwrap_err(), e);
        assert!(store.fetch_by_rid(&rid).await.is_ok());
        assert_eq!(
            store
                .fetch_partition_key_ranges(&rid, None)
                .await
                .unwrap_err(),
            e
        );

        store.return_incomplete_range_reads(1);
        let feed = store.fetch_partition_key_ranges(&rid, None).await.unwrap();
        assert!(feed.ranges.is_empty());
        let feed = store.fetch_partition_key_ranges(&rid, None).await.unwrap();
        assert_eq!(feed.ranges.len(), 1);
        assert_eq!(store.range_fetch_count(), 3);
    }
}
