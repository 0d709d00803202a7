//! Routing maps: the partition topology of a single collection.

use std::collections::{BTreeSet, HashMap, HashSet};

use thiserror::Error;

use crate::{
    collection::ResourceId,
    partition::{
        KeyRange, PartitionKeyRange, MAXIMUM_EXCLUSIVE_EFFECTIVE_PARTITION_KEY,
        MINIMUM_INCLUSIVE_EFFECTIVE_PARTITION_KEY,
    },
};

/// Reasons why a set of ranges does not form a complete [`RoutingMap`].
///
/// Every variant means the same thing to a caller: the topology read is incomplete, most likely
/// because a split or merge happened while the ranges were fetched.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[expect(missing_docs)]
pub enum RoutingMapError {
    #[error("no partition key ranges left after removing superseded ones")]
    Empty,

    #[error("range {id} is empty: [{min:?},{max:?})")]
    InvalidRange { id: String, min: String, max: String },

    #[error("first range {id} starts at {min:?} instead of the minimum key")]
    DoesNotStartAtMinimum { id: String, min: String },

    #[error("last range {id} ends at {max:?} instead of the maximum key")]
    DoesNotEndAtMaximum { id: String, max: String },

    #[error("gap between range {before} (ends at {max:?}) and range {after} (starts at {min:?})")]
    Gap {
        before: String,
        max: String,
        after: String,
        min: String,
    },

    #[error("range {before} (ends at {max:?}) overlaps range {after} (starts at {min:?})")]
    Overlap {
        before: String,
        max: String,
        after: String,
        min: String,
    },
}

/// Ordered, non-overlapping set of [`PartitionKeyRange`]s covering the full key space of one
/// collection.
///
/// # Invariants
/// - **sorted:** ranges are ordered by `min_inclusive`.
/// - **contiguous:** `ranges[i].max_exclusive == ranges[i + 1].min_inclusive`.
/// - **exhaustive:** the first range starts at [`MINIMUM_INCLUSIVE_EFFECTIVE_PARTITION_KEY`], the
///   last one ends at [`MAXIMUM_EXCLUSIVE_EFFECTIVE_PARTITION_KEY`].
/// - **no gone ranges:** a range that was ever named as a parent is never part of the map again.
///
/// A map is immutable. [`try_combine`](Self::try_combine) produces a new one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingMap {
    collection_rid: ResourceId,
    ranges: Vec<PartitionKeyRange>,
    index_by_id: HashMap<String, usize>,
    gone: HashSet<String>,
    change_feed_next_if_none_match: Option<String>,
}

impl RoutingMap {
    /// Build a map from a full listing of the ranges of a collection.
    ///
    /// Ranges that are named as a parent by any other range in the listing are dropped first: they
    /// were split while the listing was read.
    pub fn try_create_complete(
        collection_rid: ResourceId,
        ranges: impl IntoIterator<Item = PartitionKeyRange>,
        change_feed_next_if_none_match: Option<String>,
    ) -> Result<Self, RoutingMapError> {
        let ranges = ranges.into_iter().collect::<Vec<_>>();
        let gone = parent_ids(&ranges);
        Self::build(
            collection_rid,
            ranges,
            gone,
            change_feed_next_if_none_match,
        )
    }

    /// Splice newly fetched ranges into this map.
    ///
    /// Every range of this map whose id is a parent of a fetched range is replaced, the children
    /// take over the key space of their parents. A fetched range with an id that is already known
    /// replaces the known one.
    ///
    /// Fails if the result is not contiguous and exhaustive. The caller should then rebuild from a
    /// full listing.
    pub fn try_combine(
        &self,
        ranges: impl IntoIterator<Item = PartitionKeyRange>,
        change_feed_next_if_none_match: Option<String>,
    ) -> Result<Self, RoutingMapError> {
        let fetched = ranges.into_iter().collect::<Vec<_>>();

        let mut gone = self.gone.clone();
        gone.extend(parent_ids(&fetched));

        Self::build(
            self.collection_rid.clone(),
            self.ranges.iter().cloned().chain(fetched),
            gone,
            change_feed_next_if_none_match.or_else(|| self.change_feed_next_if_none_match.clone()),
        )
    }

    fn build(
        collection_rid: ResourceId,
        candidates: impl IntoIterator<Item = PartitionKeyRange>,
        gone: HashSet<String>,
        change_feed_next_if_none_match: Option<String>,
    ) -> Result<Self, RoutingMapError> {
        // later candidates win, so fetched ranges replace known ranges with the same id
        let mut by_id = HashMap::new();
        for range in candidates {
            if !gone.contains(&range.id) {
                by_id.insert(range.id.clone(), range);
            }
        }

        let mut ranges = by_id.into_values().collect::<Vec<_>>();
        ranges.sort_unstable_by(|a, b| {
            a.min_inclusive
                .cmp(&b.min_inclusive)
                .then_with(|| a.id.cmp(&b.id))
        });
        check_complete(&ranges)?;

        let index_by_id = ranges
            .iter()
            .enumerate()
            .map(|(idx, range)| (range.id.clone(), idx))
            .collect();

        Ok(Self {
            collection_rid,
            ranges,
            index_by_id,
            gone,
            change_feed_next_if_none_match,
        })
    }

    /// Resource id of the collection this map belongs to.
    pub fn collection_rid(&self) -> &ResourceId {
        &self.collection_rid
    }

    /// All ranges, ordered by `min_inclusive`.
    pub fn ordered_ranges(&self) -> &[PartitionKeyRange] {
        &self.ranges
    }

    /// Number of ranges. A complete map always has at least one.
    pub fn range_count(&self) -> usize {
        self.ranges.len()
    }

    /// Continuation token to pass as `if-none-match` for the next differential fetch.
    pub fn change_feed_next_if_none_match(&self) -> Option<&str> {
        self.change_feed_next_if_none_match.as_deref()
    }

    /// Look up a range by id.
    pub fn range_by_id(&self, id: &str) -> Option<&PartitionKeyRange> {
        self.index_by_id.get(id).map(|idx| &self.ranges[*idx])
    }

    /// Returns true if the range was superseded by a split or merge.
    pub fn is_gone(&self, id: &str) -> bool {
        self.gone.contains(id)
    }

    /// The range that contains the given effective partition key.
    ///
    /// Returns `None` only for keys outside of the key space, i.e. `>= "FF"`.
    pub fn range_by_effective_partition_key(&self, key: &str) -> Option<&PartitionKeyRange> {
        let idx = self
            .ranges
            .partition_point(|range| range.max_exclusive.as_str() <= key);
        self.ranges.get(idx).filter(|range| range.contains(key))
    }

    /// All ranges that intersect `range`, ordered by `min_inclusive`.
    pub fn overlapping_ranges(&self, range: &KeyRange) -> Vec<&PartitionKeyRange> {
        self.overlapping_indices(range)
            .map(|idx| &self.ranges[idx])
            .collect()
    }

    /// All ranges that intersect any of `ranges`, deduplicated and ordered by `min_inclusive`.
    pub fn overlapping_ranges_multi(&self, ranges: &[KeyRange]) -> Vec<&PartitionKeyRange> {
        ranges
            .iter()
            .flat_map(|range| self.overlapping_indices(range))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(|idx| &self.ranges[idx])
            .collect()
    }

    fn overlapping_indices<'a>(&'a self, range: &'a KeyRange) -> impl Iterator<Item = usize> + 'a {
        let start = self
            .ranges
            .partition_point(|r| r.max_exclusive.as_str() <= range.min());

        self.ranges[start..]
            .iter()
            .enumerate()
            .take_while(move |(_, r)| r.min_inclusive.as_str() <= range.max())
            .filter(move |(_, r)| r.key_range().overlaps(range))
            .map(move |(offset, _)| start + offset)
    }
}

fn parent_ids(ranges: &[PartitionKeyRange]) -> HashSet<String> {
    ranges
        .iter()
        .flat_map(|range| range.parents.iter().cloned())
        .collect()
}

fn check_complete(ranges: &[PartitionKeyRange]) -> Result<(), RoutingMapError> {
    let (Some(first), Some(last)) = (ranges.first(), ranges.last()) else {
        return Err(RoutingMapError::Empty);
    };

    if let Some(range) = ranges
        .iter()
        .find(|range| range.min_inclusive >= range.max_exclusive)
    {
        return Err(RoutingMapError::InvalidRange {
            id: range.id.clone(),
            min: range.min_inclusive.clone(),
            max: range.max_exclusive.clone(),
        });
    }

    if first.min_inclusive != MINIMUM_INCLUSIVE_EFFECTIVE_PARTITION_KEY {
        return Err(RoutingMapError::DoesNotStartAtMinimum {
            id: first.id.clone(),
            min: first.min_inclusive.clone(),
        });
    }

    for pair in ranges.windows(2) {
        let (before, after) = (&pair[0], &pair[1]);
        let make = |overlap: bool| {
            let before = before.id.clone();
            let max = pair[0].max_exclusive.clone();
            let after = after.id.clone();
            let min = pair[1].min_inclusive.clone();
            if overlap {
                RoutingMapError::Overlap {
                    before,
                    max,
                    after,
                    min,
                }
            } else {
                RoutingMapError::Gap {
                    before,
                    max,
                    after,
                    min,
                }
            }
        };

        match before.max_exclusive.cmp(&after.min_inclusive) {
            std::cmp::Ordering::Equal => {}
            std::cmp::Ordering::Less => return Err(make(false)),
            std::cmp::Ordering::Greater => return Err(make(true)),
        }
    }

    if last.max_exclusive != MAXIMUM_EXCLUSIVE_EFFECTIVE_PARTITION_KEY {
        return Err(RoutingMapError::DoesNotEndAtMaximum {
            id: last.id.clone(),
            max: last.max_exclusive.clone(),
        });
    }

    Ok(())
}
