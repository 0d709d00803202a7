//! Errors of the metadata caches.

use std::sync::Arc;

use async_cache::DynError;
use data_types::{ResourceId, RoutingMapError};
use snafu::Snafu;

use crate::fetch::FetchError;

/// Errors returned by the metadata caches.
///
/// Errors travel through the generic caches as [`DynError`] and are recovered with
/// [`from_dyn`](Self::from_dyn).
#[derive(Debug, Snafu, Clone)]
#[expect(missing_docs)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("not found: {descr}"))]
    NotFound { descr: String },

    #[snafu(display("incomplete topology for collection {collection_rid}: {source}"))]
    IncompleteTopology {
        collection_rid: ResourceId,
        source: RoutingMapError,
    },

    #[snafu(display("transient: {descr}"))]
    Transient { descr: String },

    #[snafu(display("computation failed: {source}"))]
    ComputationFailure { source: DynError },

    #[snafu(display("collection with resource id {rid} is gone"))]
    CollectionRidGone { rid: ResourceId },
}

impl Error {
    /// Returns true for [`Error::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true for [`Error::IncompleteTopology`].
    pub fn is_incomplete_topology(&self) -> bool {
        matches!(self, Self::IncompleteTopology { .. })
    }

    /// Wrap into a [`DynError`] so it can pass through the generic caches.
    pub(crate) fn into_dyn(self) -> DynError {
        Arc::new(self)
    }

    /// Recover an error that went through the generic caches.
    ///
    /// Anything that is not an [`Error`], e.g. a panic, becomes [`Error::ComputationFailure`].
    pub(crate) fn from_dyn(e: &DynError) -> Self {
        match e.downcast_ref::<Self>() {
            Some(e) => e.clone(),
            None => Self::ComputationFailure {
                source: Arc::clone(e),
            },
        }
    }
}

impl From<FetchError> for Error {
    fn from(e: FetchError) -> Self {
        match e {
            FetchError::NotFound { descr } => Self::NotFound { descr },
            FetchError::Transient { descr } => Self::Transient { descr },
        }
    }
}

/// Returns true if the failed computation confirmed that the requested resource does not exist.
pub(crate) fn is_not_found(e: &DynError) -> bool {
    e.downcast_ref::<Error>().is_some_and(Error::is_not_found)
}

/// Returns true if a failed routing map build makes the cached map unusable.
pub(crate) fn is_unrecoverable(e: &DynError) -> bool {
    e.downcast_ref::<Error>()
        .is_some_and(|e| e.is_not_found() || e.is_incomplete_topology())
}
