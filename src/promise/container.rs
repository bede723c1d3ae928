//! Replaceable promise slot.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::broadcast::{Broadcast, WaitToken};
use crate::error::Error;

use super::{Promise, PromiseLike};

/// # Slot holding a replaceable [`Promise`].
///
/// Replacing the inner promise and completing it are two distinct events:
/// observers can tell "the publisher moved to a new attempt" apart from "the
/// current attempt produced a result". The await family transparently
/// follows replacements.
///
/// Cheap to clone; clones share the same slot.
pub struct PromiseContainer<T> {
    slot: Arc<Broadcast<Option<Promise<T>>>>,
}

impl<T> Clone for PromiseContainer<T> {
    fn clone(&self) -> Self {
        PromiseContainer {
            slot: self.slot.clone(),
        }
    }
}

impl<T> Default for PromiseContainer<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        PromiseContainer::new()
    }
}

impl<T> PromiseContainer<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Builds an empty container.
    pub fn new() -> Self {
        PromiseContainer {
            slot: Arc::new(Broadcast::new(None)),
        }
    }

    /// Replaces the inner promise and broadcasts the replacement.
    ///
    /// The previous promise is merely forgotten, not canceled.
    pub fn set_promise(&self, promise: Option<Promise<T>>) {
        self.slot.hold_lock(|g| {
            **g = promise;
            g.broadcast();
        });
    }

    /// Replaces the inner promise with a pre-completed one. Always
    /// overwrites.
    pub fn set_result(&self, res: Result<T, Error>) {
        self.set_promise(Some(Promise::with_result(res)));
    }

    /// Returns the inner promise (if any) and a token signaled when the
    /// inner promise is next replaced.
    pub fn get_promise(&self) -> (Option<Promise<T>>, WaitToken) {
        self.slot.hold_lock(|g| ((**g).clone(), g.get_wait()))
    }

    /// Waits for the current (or a future) inner promise to complete.
    pub async fn await_result(&self, ctx: &CancellationToken) -> Result<T, Error> {
        loop {
            let (promise, replaced) = self.get_promise();
            let Some(promise) = promise else {
                tokio::select! {
                    _ = ctx.cancelled() => return Err(Error::Canceled),
                    _ = replaced.wait() => continue,
                }
            };

            match promise.await_with_cancel(ctx, &replaced).await {
                Err(Error::Canceled) if !ctx.is_cancelled() && replaced.is_signaled() => {
                    // The publisher replaced the attempt; follow it.
                    continue;
                }
                res => return res,
            }
        }
    }

    /// As [`await_result`](Self::await_result), also reading the auxiliary
    /// error channel. A closed channel reads as cancellation.
    pub async fn await_with_err_ch(
        &self,
        ctx: &CancellationToken,
        err_rx: &mut mpsc::Receiver<Error>,
    ) -> Result<T, Error> {
        loop {
            let (promise, replaced) = self.get_promise();

            tokio::select! {
                _ = ctx.cancelled() => return Err(Error::Canceled),
                err = err_rx.recv() => {
                    return Err(err.unwrap_or(Error::Canceled));
                }
                _ = replaced.wait() => continue,
                res = async {
                    match &promise {
                        Some(promise) => promise.await_result(ctx).await,
                        None => std::future::pending().await,
                    }
                } => return res,
            }
        }
    }
}

#[async_trait]
impl<T> PromiseLike<T> for PromiseContainer<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn set_result(&self, res: Result<T, Error>) -> bool {
        PromiseContainer::set_result(self, res);
        true
    }

    async fn await_result(&self, ctx: &CancellationToken) -> Result<T, Error> {
        PromiseContainer::await_result(self, ctx).await
    }

    async fn await_with_err_ch(
        &self,
        ctx: &CancellationToken,
        err_rx: &mut mpsc::Receiver<Error>,
    ) -> Result<T, Error> {
        PromiseContainer::await_with_err_ch(self, ctx, err_rx).await
    }
}
