//! Interfaces to the remote metadata service.

use std::{fmt::Debug, future::Future, time::Duration};

use async_trait::async_trait;
use data_types::{CollectionMetadata, PartitionKeyRange, ResourceId};
use snafu::Snafu;

/// Errors returned by a fetcher.
#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
#[expect(missing_docs)]
pub enum FetchError {
    #[snafu(display("not found: {descr}"))]
    NotFound { descr: String },

    #[snafu(display("transient: {descr}"))]
    Transient { descr: String },
}

/// One read of the partition key range change feed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionKeyRangeFeed {
    /// Ranges created since the given continuation, or all ranges for a full read.
    pub ranges: Vec<PartitionKeyRange>,

    /// Token to pass as `if-none-match` on the next read.
    pub continuation: Option<String>,
}

/// Fetches collection metadata.
#[async_trait]
pub trait CollectionFetcher: Debug + Send + Sync {
    /// Fetch a collection by its name-based link, e.g. `dbs/db1/colls/c1`.
    async fn fetch_by_name(&self, name: &str) -> Result<CollectionMetadata, FetchError>;

    /// Fetch a collection by its resource id.
    async fn fetch_by_rid(&self, rid: &ResourceId) -> Result<CollectionMetadata, FetchError>;
}

/// Fetches partition key ranges of a collection.
#[async_trait]
pub trait PartitionKeyRangeFetcher: Debug + Send + Sync {
    /// Read the change feed of partition key ranges.
    ///
    /// Without `if_none_match` all current ranges are returned. With it, only ranges created
    /// after that continuation, which may be none.
    async fn fetch_partition_key_ranges(
        &self,
        collection_rid: &ResourceId,
        if_none_match: Option<&str>,
    ) -> Result<PartitionKeyRangeFeed, FetchError>;
}

/// Await a fetch, turning an elapsed `timeout` into [`FetchError::Transient`].
pub(crate) async fn bounded<T, F>(timeout: Duration, what: &str, fut: F) -> Result<T, FetchError>
where
    F: Future<Output = Result<T, FetchError>> + Send,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(res) => res,
        Err(_) => Err(FetchError::Transient {
            descr: format!("{what} timed out after {timeout:?}"),
        }),
    }
}
