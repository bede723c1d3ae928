//! Memoizing single-flight caller.

use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::broadcast::lock_recover;
use crate::error::Error;
use crate::BoxFuture;

use super::Promise;

type OnceFn<T> = Arc<dyn Fn(CancellationToken) -> BoxFuture<Result<T, Error>> + Send + Sync>;

/// # Calls a fallible function at most once concurrently, memoizing success.
///
/// Concurrent callers during an in-flight attempt all await the same
/// promise. On failure the slot is cleared so the next caller retries; on
/// success the result is memoized for all future callers. Cancellation of
/// one caller does not cancel the shared attempt.
pub struct Once<T> {
    cb: OnceFn<T>,
    slot: Arc<Mutex<Option<Promise<T>>>>,
}

impl<T> Clone for Once<T> {
    fn clone(&self) -> Self {
        Once {
            cb: self.cb.clone(),
            slot: self.slot.clone(),
        }
    }
}

impl<T> Once<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Builds a new single-flight caller around `cb`.
    pub fn new<F, Fut>(cb: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, Error>> + Send + 'static,
    {
        Once {
            cb: Arc::new(move |ctx| Box::pin(cb(ctx))),
            slot: Arc::new(Mutex::new(None)),
        }
    }

    /// Resolves the value, starting an attempt if none is in flight.
    ///
    /// The attempt runs with the starting caller's `ctx`; if that caller is
    /// canceled mid-flight the attempt resolves canceled and the remaining
    /// callers loop and re-attempt with their own contexts.
    pub async fn resolve(&self, ctx: &CancellationToken) -> Result<T, Error> {
        loop {
            if ctx.is_cancelled() {
                return Err(Error::Canceled);
            }

            let promise = {
                let mut slot = lock_recover(&self.slot);
                match &*slot {
                    Some(promise) => promise.clone(),
                    None => {
                        let promise = Promise::new();
                        *slot = Some(promise.clone());
                        self.spawn_attempt(ctx.clone(), promise.clone());
                        promise
                    }
                }
            };

            match promise.await_result(ctx).await {
                Err(Error::Canceled) => continue,
                res => return res,
            }
        }
    }

    fn spawn_attempt(&self, ctx: CancellationToken, promise: Promise<T>) {
        let cb = self.cb.clone();
        let slot = self.slot.clone();
        tokio::spawn(async move {
            match (cb)(ctx.clone()).await {
                Ok(val) => {
                    promise.set_result(Ok(val));
                }
                Err(err) => {
                    {
                        let mut slot = lock_recover(&slot);
                        if slot.as_ref().is_some_and(|cur| cur.ptr_eq(&promise)) {
                            *slot = None;
                        }
                    }
                    if ctx.is_cancelled() {
                        promise.set_result(Err(Error::Canceled));
                    } else {
                        promise.set_result(Err(err));
                    }
                }
            }
        });
    }
}
