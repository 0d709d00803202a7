//! Helpers for testing async code.
#![warn(missing_docs)]

use std::{
    future::Future,
    time::{Duration, Instant},
};

/// Helper trait for asserting state of a future.
pub trait AssertFutureExt {
    /// The output type.
    type Output;

    /// Panics if the future does not stay pending for a short while.
    fn assert_pending(&mut self) -> impl Future<Output = ()>
    where
        Self: Unpin;

    /// Await future with timeout, panics on timeout.
    fn with_timeout(self) -> impl Future<Output = Self::Output>;
}

impl<F> AssertFutureExt for F
where
    F: Future + Send,
{
    type Output = F::Output;

    async fn assert_pending(&mut self)
    where
        Self: Unpin,
    {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(10)) => {}
            _ = self => {
                panic!("not pending");
            }
        }
    }

    async fn with_timeout(self) -> Self::Output {
        tokio::time::timeout(Duration::from_secs(1), self)
            .await
            .expect("timeout")
    }
}

/// Assert that the result of `f` converges against the given value.
pub async fn assert_converge_eq<F, T>(f: F, expected: T)
where
    F: Fn() -> T + Send,
    T: Eq + std::fmt::Debug + Send,
{
    let start = Instant::now();

    loop {
        let actual = f();
        if actual == expected {
            return;
        }
        if start.elapsed() > Duration::from_secs(1) {
            assert_eq!(actual, expected);
        }

        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}
