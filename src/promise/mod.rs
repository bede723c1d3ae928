//! # Write-once results and replaceable result slots.
//!
//! - [`Promise`] — an asynchronous result that can be completed exactly once
//!   and awaited by any number of consumers.
//! - [`PromiseContainer`] — a slot holding a replaceable promise, letting a
//!   publisher swap the in-flight attempt without observers re-subscribing.
//! - [`Once`] — a memoizing single-flight caller: one in-flight attempt at a
//!   time, failures clear the slot so the next caller retries.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::broadcast::WaitToken;
use crate::error::{recv_aux_err, Error};

mod container;
mod once;

pub use container::PromiseContainer;
pub use once::Once;

struct Shared<T> {
    /// Claim flag: the first `set_result` wins.
    claimed: AtomicBool,
    /// Signaled once the result is readable.
    done: CancellationToken,
    result: OnceLock<Result<T, Error>>,
}

/// # Asynchronous result of an operation, completed at most once.
///
/// Cheap to clone; clones share the same result.
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Promise {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Default for Promise<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Promise::new()
    }
}

impl<T> Promise<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Builds an empty, incomplete promise.
    pub fn new() -> Self {
        Promise {
            shared: Arc::new(Shared {
                claimed: AtomicBool::new(false),
                done: CancellationToken::new(),
                result: OnceLock::new(),
            }),
        }
    }

    /// Builds a promise pre-completed with a result.
    pub fn with_result(res: Result<T, Error>) -> Self {
        let p = Promise::new();
        p.set_result(res);
        p
    }

    /// Builds a promise pre-completed with an error.
    pub fn with_err(err: Error) -> Self {
        Promise::with_result(Err(err))
    }

    /// Completes the promise. Returns false if the result was already set.
    pub fn set_result(&self, res: Result<T, Error>) -> bool {
        if self.shared.claimed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let _ = self.shared.result.set(res);
        self.shared.done.cancel();
        true
    }

    /// Returns whether the result is readable.
    pub fn is_done(&self) -> bool {
        self.shared.done.is_cancelled()
    }

    /// Returns the result if completed, without waiting.
    pub fn try_result(&self) -> Option<Result<T, Error>> {
        if !self.is_done() {
            return None;
        }
        Some(self.read_result())
    }

    /// Waits for the result to be set or for `ctx` to be canceled.
    pub async fn await_result(&self, ctx: &CancellationToken) -> Result<T, Error> {
        tokio::select! {
            _ = ctx.cancelled() => Err(Error::Canceled),
            _ = self.shared.done.cancelled() => self.read_result(),
        }
    }

    /// Waits for the result, for `ctx`, or for the auxiliary error channel.
    ///
    /// A closed channel reads as cancellation.
    pub async fn await_with_err_ch(
        &self,
        ctx: &CancellationToken,
        err_rx: &mut mpsc::Receiver<Error>,
    ) -> Result<T, Error> {
        let mut err_rx = Some(err_rx);
        tokio::select! {
            _ = ctx.cancelled() => Err(Error::Canceled),
            err = recv_aux_err(&mut err_rx) => Err(err),
            _ = self.shared.done.cancelled() => self.read_result(),
        }
    }

    /// Waits for the result, treating `cancel` as a second cancellation
    /// signal.
    pub async fn await_with_cancel(
        &self,
        ctx: &CancellationToken,
        cancel: &WaitToken,
    ) -> Result<T, Error> {
        tokio::select! {
            _ = ctx.cancelled() => Err(Error::Canceled),
            _ = cancel.wait() => Err(Error::Canceled),
            _ = self.shared.done.cancelled() => self.read_result(),
        }
    }

    /// Returns whether two handles point at the same promise.
    pub fn ptr_eq(&self, other: &Promise<T>) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    fn read_result(&self) -> Result<T, Error> {
        match self.shared.result.get() {
            Some(res) => res.clone(),
            // done fired without a stored result: only reachable if the
            // process observed the claim flag mid-flight; report as canceled.
            None => Err(Error::Canceled),
        }
    }
}

/// # Anything that behaves like a promise.
///
/// Implemented by [`Promise`] and [`PromiseContainer`].
#[async_trait]
pub trait PromiseLike<T>: Send + Sync
where
    T: Clone + Send + Sync + 'static,
{
    /// Completes the promise. Returns false if the result could not be set.
    fn set_result(&self, res: Result<T, Error>) -> bool;

    /// Waits for the result to be set or for `ctx` to be canceled.
    async fn await_result(&self, ctx: &CancellationToken) -> Result<T, Error>;

    /// Waits for the result, for `ctx`, or for the auxiliary error channel.
    async fn await_with_err_ch(
        &self,
        ctx: &CancellationToken,
        err_rx: &mut mpsc::Receiver<Error>,
    ) -> Result<T, Error>;
}

#[async_trait]
impl<T> PromiseLike<T> for Promise<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn set_result(&self, res: Result<T, Error>) -> bool {
        Promise::set_result(self, res)
    }

    async fn await_result(&self, ctx: &CancellationToken) -> Result<T, Error> {
        Promise::await_result(self, ctx).await
    }

    async fn await_with_err_ch(
        &self,
        ctx: &CancellationToken,
        err_rx: &mut mpsc::Receiver<Error>,
    ) -> Result<T, Error> {
        Promise::await_with_err_ch(self, ctx, err_rx).await
    }
}
