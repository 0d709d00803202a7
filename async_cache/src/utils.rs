//! A few helpers to build cache-related code.
use std::{
    future::Future,
    panic::{resume_unwind, AssertUnwindSafe},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use tokio::task::JoinHandle;

use crate::interfaces::{ArcResult, DynError};

/// Shared, failable value future as it is stored in the caches.
pub(crate) type CacheFut<V> = Shared<BoxFuture<'static, ArcResult<V>>>;

/// Spawn `fut` as [`BackgroundTask`] and make the result shareable.
pub(crate) fn spawn_shared<V, Fut>(fut: Fut) -> CacheFut<V>
where
    V: Send + Sync + 'static,
    Fut: Future<Output = ArcResult<V>> + Send + 'static,
{
    BackgroundTask::spawn(fut).boxed().shared()
}

/// A [`CacheFut`] that is already resolved.
pub(crate) fn resolved<V>(res: ArcResult<V>) -> CacheFut<V>
where
    V: Send + Sync + 'static,
{
    let fut = futures::future::ready(res).boxed().shared();

    // drive once so that `peek` sees the result
    let _ = fut.clone().now_or_never();

    fut
}

/// Result of the future if it already finished.
///
/// Unlike [`Shared::peek`] this also notices results that nobody awaited yet.
pub(crate) fn try_resolved<V>(fut: &CacheFut<V>) -> Option<ArcResult<V>> {
    match fut.peek() {
        Some(res) => Some(res.clone()),
        None => fut.clone().now_or_never(),
    }
}

/// Holds a tokio task that keeps running when the handle is dropped.
///
/// [`JoinError`]s are handled like:
/// - **panic:** wrapped via [`CatchUnwindDynErrorExt`]
/// - **runtime lost:** converted into [`DynError`]
///
///
/// [`JoinError`]: tokio::task::JoinError
pub struct BackgroundTask<T>(JoinHandle<Result<T, DynError>>)
where
    T: Send + 'static;

impl<T> BackgroundTask<T>
where
    T: Send + 'static,
{
    /// Spawn new task on current runtime.
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = Result<T, DynError>> + Send + 'static,
    {
        Self(tokio::spawn(future.catch_unwind_dyn_error()))
    }

    /// Returns true if the task finished.
    pub fn is_finished(&self) -> bool {
        self.0.is_finished()
    }
}

impl<T> std::fmt::Debug for BackgroundTask<T>
where
    T: Send + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundTask")
            .field("finished", &self.0.is_finished())
            .finish()
    }
}

impl<T> Future for BackgroundTask<T>
where
    T: Send + 'static,
{
    type Output = Result<T, DynError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Poll::Ready(match std::task::ready!(self.0.poll_unpin(cx)) {
            Ok(v) => v,
            Err(e) if e.is_cancelled() => Err(str_err("Runtime was shut down")),
            Err(e) => resume_unwind(e.into_panic()),
        })
    }
}

/// Extension trait to [catch unwind] -- during a panic -- and convert the message into a [`DynError`].
///
/// This automatically [assumes unwind safety](AssertUnwindSafe).
///
/// The [`DynError`] can be [cast down] to [`PanicError`].
///
///
// Note: Linking to `dyn Error` doesn't really work via intradoc links, see
// https://github.com/rust-lang/rust/issues/74563
/// [cast down]: https://doc.rust-lang.org/std/error/trait.Error.html#method.downcast_ref-2
/// [catch unwind]: std::panic::catch_unwind
pub trait CatchUnwindDynErrorExt {
    /// Success type.
    type Output;

    /// Catch unwind and convert panic message into a [`DynError`].
    fn catch_unwind_dyn_error(self) -> impl Future<Output = Result<Self::Output, DynError>> + Send;
}

impl<F, T> CatchUnwindDynErrorExt for F
where
    F: Future<Output = Result<T, DynError>> + Send,
{
    type Output = T;

    async fn catch_unwind_dyn_error(self) -> Result<Self::Output, DynError> {
        match AssertUnwindSafe(self).catch_unwind().await {
            Ok(res) => res,
            Err(e) => {
                let msg = if let Some(s) = e.downcast_ref::<String>() {
                    s.clone()
                } else if let Some(s) = e.downcast_ref::<&str>() {
                    (*s).to_owned()
                } else {
                    "<unknown>".to_owned()
                };

                Err(Arc::new(PanicError {
                    message: StringError(msg),
                }))
            }
        }
    }
}

/// Error produced by [`CatchUnwindDynErrorExt`].
#[derive(Debug)]
pub struct PanicError {
    message: StringError,
}

impl PanicError {
    /// Panic message.
    pub fn message(&self) -> &str {
        self.message.inner()
    }
}

impl std::fmt::Display for PanicError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "panic: {}", self.message)
    }
}

impl std::error::Error for PanicError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.message)
    }
}

/// Create a [`DynError`] from a string.
///
/// The contained error can be [cast down] to [`StringError`].
///
///
// Note: Linking to `dyn Error` doesn't really work via intradoc links, see
// https://github.com/rust-lang/rust/issues/74563
/// [cast down]: https://doc.rust-lang.org/std/error/trait.Error.html#method.downcast_ref-2
pub fn str_err(s: &str) -> DynError {
    Arc::new(StringError(s.to_owned()))
}

/// Error produced by [`str_err`].
#[derive(Debug)]
pub struct StringError(String);

impl StringError {
    /// Get string.
    pub fn inner(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StringError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for StringError {}
