//! Two-level cache of collection metadata, by name and by resource id.

use std::{future::Future, sync::Arc, time::Duration};

use async_cache::{DynError, SingleFlightCache};
use data_types::{CollectionMetadata, CollectionRef, ResourceId};
use observability_deps::tracing::debug;

use crate::{
    error::is_not_found,
    fetch::{bounded, CollectionFetcher},
    Error, Result,
};

/// Caches [`CollectionMetadata`] by name and by resource id.
///
/// Every successful fetch by name is also published under its resource id, so resolving the id
/// of a collection that was just resolved by name does not hit the remote service.
///
/// Entries are only ever refreshed when a caller reports an obsolete resource id, see
/// [`refresh_on_stale_name`](Self::refresh_on_stale_name). Lookups of collections that do not
/// exist leave no entry behind.
#[derive(Debug)]
pub struct CollectionMetadataCache {
    fetcher: Arc<dyn CollectionFetcher>,
    fetch_timeout: Duration,
    by_name: SingleFlightCache<String, CollectionMetadata>,
    by_id: Arc<SingleFlightCache<ResourceId, CollectionMetadata>>,
}

impl CollectionMetadataCache {
    /// Create empty cache.
    pub fn new(fetcher: Arc<dyn CollectionFetcher>, fetch_timeout: Duration) -> Self {
        Self {
            fetcher,
            fetch_timeout,
            by_name: SingleFlightCache::new(Arc::new(CollectionMetadata::same_resource_id))
                .with_eviction(Arc::new(is_not_found)),
            by_id: Arc::new(
                SingleFlightCache::new(Arc::new(CollectionMetadata::same_resource_id))
                    .with_eviction(Arc::new(is_not_found)),
            ),
        }
    }

    /// Resolve a collection by its name-based link.
    pub async fn resolve_by_name(&self, name: &str) -> Result<Arc<CollectionMetadata>> {
        let name = normalize(name);
        let (res, state) = self
            .by_name
            .get(&name, None, |name| self.fetch_by_name(name))
            .await;
        debug!(collection = %name, ?state, "resolved collection by name");
        res.map_err(|e| Error::from_dyn(&e))
    }

    /// Resolve a collection by its resource id.
    pub async fn resolve_by_rid(&self, rid: &ResourceId) -> Result<Arc<CollectionMetadata>> {
        let (res, state) = self
            .by_id
            .get(rid, None, |rid| self.fetch_by_rid(rid))
            .await;
        debug!(collection_rid = %rid, ?state, "resolved collection by resource id");
        res.map_err(|e| Error::from_dyn(&e))
    }

    /// Resolve either way.
    pub async fn resolve(&self, collection: &CollectionRef) -> Result<Arc<CollectionMetadata>> {
        match collection {
            CollectionRef::Name(name) => self.resolve_by_name(name).await,
            CollectionRef::ResourceId(rid) => self.resolve_by_rid(rid).await,
        }
    }

    /// Refetch `name` if the cached entry still carries `stale_rid`.
    ///
    /// If some other caller already replaced the entry, that one is returned without a fetch.
    /// When the resource id changed, the by-id entry of the stale id is dropped.
    pub async fn refresh_on_stale_name(
        &self,
        name: &str,
        stale_rid: Option<&ResourceId>,
    ) -> Result<Arc<CollectionMetadata>> {
        let name = normalize(name);
        let hint = CollectionMetadata::obsolete_hint(stale_rid.cloned());
        let (res, state) = self
            .by_name
            .get(&name, Some(&hint), |name| self.fetch_by_name(name))
            .await;
        let md = res.map_err(|e| Error::from_dyn(&e))?;

        if let Some(stale_rid) = stale_rid {
            if md.resource_id.as_ref() != Some(stale_rid) && self.by_id.remove(stale_rid) {
                debug!(collection = %name, %stale_rid, "dropped stale resource id");
            }
        }
        debug!(collection = %name, ?state, "refreshed collection by name");

        Ok(md)
    }

    /// Refetch `name` in the background.
    ///
    /// Returns false if the name is not cached or a fetch is already running.
    pub fn refresh(&self, name: &str) -> bool {
        let name = normalize(name);
        self.by_name.refresh(&name, |name| self.fetch_by_name(name))
    }

    /// Forget the by-name entry. Returns true if there was one.
    pub fn remove_by_name(&self, name: &str) -> bool {
        self.by_name.remove(&normalize(name))
    }

    /// Forget the by-id entry. Returns true if there was one.
    pub fn remove_by_rid(&self, rid: &ResourceId) -> bool {
        self.by_id.remove(rid)
    }

    fn fetch_by_name(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<CollectionMetadata, DynError>> + Send + 'static {
        let fetcher = Arc::clone(&self.fetcher);
        let by_id = Arc::clone(&self.by_id);
        let fetch_timeout = self.fetch_timeout;
        let name = name.to_owned();

        async move {
            let what = format!("fetch collection {name}");
            let md = bounded(fetch_timeout, &what, fetcher.fetch_by_name(&name))
                .await
                .map_err(|e| Error::from(e).into_dyn())?;

            if let Some(rid) = &md.resource_id {
                by_id.set(rid.clone(), Arc::new(md.clone()));
            }
            Ok(md)
        }
    }

    fn fetch_by_rid(
        &self,
        rid: &ResourceId,
    ) -> impl Future<Output = Result<CollectionMetadata, DynError>> + Send + 'static {
        let fetcher = Arc::clone(&self.fetcher);
        let fetch_timeout = self.fetch_timeout;
        let rid = rid.clone();

        async move {
            let what = format!("fetch collection with resource id {rid}");
            bounded(fetch_timeout, &what, fetcher.fetch_by_rid(&rid))
                .await
                .map_err(|e| Error::from(e).into_dyn())
        }
    }
}

fn normalize(name: &str) -> String {
    name.trim_matches('/').to_owned()
}
