//! Types having to do with collections.

use std::{fmt::Display, sync::Arc};

/// Server-assigned internal identifier of a collection.
///
/// Unlike the name, a resource id is never reused: dropping and recreating a collection under the
/// same name yields a new [`ResourceId`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId(Arc<str>);

impl ResourceId {
    /// Create new id.
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    /// The id as string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ResourceId {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}

/// Immutable snapshot of the metadata of a logical collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionMetadata {
    /// User-facing id, i.e. the last segment of [`name`](Self::name).
    pub id: String,

    /// Normalized full name, e.g. `dbs/db1/colls/c1`.
    pub name: String,

    /// Internal id.
    ///
    /// Only `None` for [obsolete hints](Self::obsolete_hint) that do not know the stale id.
    pub resource_id: Option<ResourceId>,

    /// Paths that make up the partition key.
    pub partition_key_paths: Vec<String>,

    /// Entity tag of the collection resource.
    pub etag: Option<String>,
}

impl CollectionMetadata {
    /// Create metadata for the collection `name` with the given resource id.
    pub fn new(name: &str, resource_id: impl Into<ResourceId>) -> Self {
        let name = normalize_name(name);
        Self {
            id: name.rsplit('/').next().unwrap_or_default().to_owned(),
            name,
            resource_id: Some(resource_id.into()),
            partition_key_paths: vec![],
            etag: None,
        }
    }

    /// Set the partition key paths.
    pub fn with_partition_key_paths<I, S>(self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            partition_key_paths: paths.into_iter().map(Into::into).collect(),
            ..self
        }
    }

    /// Set the etag.
    pub fn with_etag(self, etag: impl Into<String>) -> Self {
        Self {
            etag: Some(etag.into()),
            ..self
        }
    }

    /// Build a value that only carries a (possibly unknown) stale resource id.
    ///
    /// Used as "the value I believe is obsolete" when asking a cache to refresh.
    pub fn obsolete_hint(stale_resource_id: Option<ResourceId>) -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            resource_id: stale_resource_id,
            partition_key_paths: vec![],
            etag: None,
        }
    }

    /// Null-safe resource id comparison: two `None`s are equal, `None` and `Some` are not.
    pub fn same_resource_id(a: &Self, b: &Self) -> bool {
        a.resource_id == b.resource_id
    }
}

/// A reference to a collection, either by name or by internal id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CollectionRef {
    /// Name-based link, e.g. `dbs/db1/colls/c1`.
    Name(String),

    /// Internal id.
    ResourceId(ResourceId),
}

impl CollectionRef {
    /// Parse "name or id".
    ///
    /// Anything containing a `/` is a name-based link, everything else is taken as a resource id.
    pub fn parse(name_or_id: &str) -> Self {
        let trimmed = name_or_id.trim_matches('/');
        if trimmed.contains('/') {
            Self::Name(normalize_name(trimmed))
        } else {
            Self::ResourceId(ResourceId::new(trimmed))
        }
    }

    /// Returns true if this reference is name-based.
    pub fn is_name_based(&self) -> bool {
        matches!(self, Self::Name(_))
    }
}

impl From<&str> for CollectionRef {
    fn from(name_or_id: &str) -> Self {
        Self::parse(name_or_id)
    }
}

impl Display for CollectionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Name(name) => write!(f, "{name}"),
            Self::ResourceId(rid) => write!(f, "{rid}"),
        }
    }
}

fn normalize_name(name: &str) -> String {
    name.trim_matches('/').to_owned()
}
