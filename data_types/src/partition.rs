//! Types having to do with partition key ranges.

use std::{collections::BTreeSet, fmt::Display};

/// Smallest effective partition key, inclusive lower bound of the key space.
pub const MINIMUM_INCLUSIVE_EFFECTIVE_PARTITION_KEY: &str = "";

/// Upper bound of the key space, exclusive.
pub const MAXIMUM_EXCLUSIVE_EFFECTIVE_PARTITION_KEY: &str = "FF";

/// Half-open range `[min, max)` of effective partition keys.
///
/// Keys are hex-encoded strings and compare lexicographically.
///
/// A range with `min == max` is a *point*: it addresses the single key `min`. Ranges with
/// `min > max` are empty and overlap nothing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyRange {
    min: String,
    max: String,
}

impl KeyRange {
    /// Create new range.
    pub fn new(min: impl Into<String>, max: impl Into<String>) -> Self {
        Self {
            min: min.into(),
            max: max.into(),
        }
    }

    /// Range covering the entire key space.
    pub fn full() -> Self {
        Self::new(
            MINIMUM_INCLUSIVE_EFFECTIVE_PARTITION_KEY,
            MAXIMUM_EXCLUSIVE_EFFECTIVE_PARTITION_KEY,
        )
    }

    /// Range that addresses exactly one key.
    pub fn point(key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            min: key.clone(),
            max: key,
        }
    }

    /// Inclusive lower bound.
    pub fn min(&self) -> &str {
        &self.min
    }

    /// Exclusive upper bound.
    pub fn max(&self) -> &str {
        &self.max
    }

    /// Returns true if this range addresses exactly one key.
    pub fn is_point(&self) -> bool {
        self.min == self.max
    }

    /// Returns true if `key` falls into this range.
    pub fn contains(&self, key: &str) -> bool {
        if self.is_point() {
            self.min == key
        } else {
            self.min.as_str() <= key && key < self.max.as_str()
        }
    }

    /// Returns true if both ranges share at least one key.
    pub fn overlaps(&self, other: &Self) -> bool {
        match (self.is_point(), other.is_point()) {
            (true, true) => self.min == other.min,
            (true, false) => other.contains(&self.min),
            (false, true) => self.contains(&other.min),
            (false, false) => {
                self.min < self.max
                    && other.min < other.max
                    && self.min < other.max
                    && other.min < self.max
            }
        }
    }
}

impl Display for KeyRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:?},{:?})", self.min, self.max)
    }
}

/// One contiguous slice of the partition key space of a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionKeyRange {
    /// Range id, unique within the collection.
    pub id: String,

    /// Inclusive lower bound.
    pub min_inclusive: String,

    /// Exclusive upper bound.
    pub max_exclusive: String,

    /// Ids of the ranges this range superseded by a split or merge. Empty for an original range.
    pub parents: BTreeSet<String>,
}

impl PartitionKeyRange {
    /// Create a range without parents.
    pub fn new(
        id: impl Into<String>,
        min_inclusive: impl Into<String>,
        max_exclusive: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            min_inclusive: min_inclusive.into(),
            max_exclusive: max_exclusive.into(),
            parents: BTreeSet::new(),
        }
    }

    /// Set parents.
    pub fn with_parents<I, S>(self, parents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            parents: parents.into_iter().map(Into::into).collect(),
            ..self
        }
    }

    /// The covered keys as [`KeyRange`].
    pub fn key_range(&self) -> KeyRange {
        KeyRange::new(self.min_inclusive.clone(), self.max_exclusive.clone())
    }

    /// Returns true if `key` falls into this range.
    pub fn contains(&self, key: &str) -> bool {
        self.min_inclusive.as_str() <= key && key < self.max_exclusive.as_str()
    }
}

impl Display for PartitionKeyRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}[{:?},{:?})",
            self.id, self.min_inclusive, self.max_exclusive
        )
    }
}
