//! # Concurrent container: a watchable cell.
//!
//! [`CContainer`] stores a value of an equality-comparable type and lets
//! waiters block until the value satisfies a predicate. The *empty* value is
//! `T::default()`, so `Option`-typed containers treat `None` as empty.
//!
//! A change broadcast fires iff the stored value actually changes under the
//! configured equality, and a waiter is guaranteed to eventually observe
//! *some* value satisfying its predicate if one is set and persists; there
//! is no guarantee of observing every intermediate value.
//!
//! # Example
//! ```
//! use coopsync::CContainer;
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let c: CContainer<Option<u32>> = CContainer::new(None);
//! let ctx = CancellationToken::new();
//!
//! let watcher = c.clone();
//! let watcher_ctx = ctx.clone();
//! let task = tokio::spawn(async move { watcher.wait_value(&watcher_ctx, None).await });
//!
//! c.set_value(Some(5));
//! assert_eq!(task.await.unwrap().unwrap(), Some(5));
//! # }
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::broadcast::Broadcast;
use crate::error::{recv_aux_err, Error};

/// Extra equality predicate for container values.
///
/// Two values are considered equal iff natural equality (`==`) *or* the
/// predicate reports them equal. Useful for types whose semantic equality is
/// richer than their `PartialEq`.
pub type EqualFn<T> = Arc<dyn Fn(&T, &T) -> bool + Send + Sync>;

struct Cell<T> {
    val: T,
    equal: Option<EqualFn<T>>,
}

impl<T: PartialEq> Cell<T> {
    fn same(&self, a: &T, b: &T) -> bool {
        if a == b {
            return true;
        }
        match &self.equal {
            Some(eq) => eq(a, b),
            None => false,
        }
    }
}

/// # Concurrent container holding a value of type `T`.
///
/// Cheap to clone; clones share the same cell.
pub struct CContainer<T> {
    bcast: Arc<Broadcast<Cell<T>>>,
}

impl<T> Clone for CContainer<T> {
    fn clone(&self) -> Self {
        CContainer {
            bcast: self.bcast.clone(),
        }
    }
}

impl<T> CContainer<T>
where
    T: Clone + PartialEq + Default + Send + Sync + 'static,
{
    /// Builds a container with an initial value.
    pub fn new(val: T) -> Self {
        CContainer {
            bcast: Arc::new(Broadcast::new(Cell { val, equal: None })),
        }
    }

    /// Builds a container with an initial value and an extra equality
    /// predicate.
    pub fn new_with_equal(val: T, equal: EqualFn<T>) -> Self {
        CContainer {
            bcast: Arc::new(Broadcast::new(Cell {
                val,
                equal: Some(equal),
            })),
        }
    }

    /// Returns a snapshot of the current value.
    pub fn get_value(&self) -> T {
        self.bcast.hold_lock(|g| g.val.clone())
    }

    /// Stores `val`, broadcasting iff it differs from the old value.
    pub fn set_value(&self, val: T) {
        self.bcast.hold_lock(|g| {
            if !g.same(&g.val, &val) {
                g.val = val;
                g.broadcast();
            }
        });
    }

    /// Locks the container, calls `cb` with the current value, and stores
    /// the returned value if it changed. Returns the final value.
    pub fn swap_value(&self, cb: impl FnOnce(T) -> T) -> T {
        self.bcast.hold_lock(|g| {
            let next = cb(g.val.clone());
            if !g.same(&g.val, &next) {
                g.val = next.clone();
                g.broadcast();
            }
            next
        })
    }

    /// Waits for any value accepted by `valid`.
    ///
    /// `valid` is called at most once per broadcast; returning `Ok(true)`
    /// completes the wait with that value, and an error completes the wait
    /// with that error. `err_rx` is an optional auxiliary error channel; a
    /// closed channel reads as cancellation.
    pub async fn wait_value_with_validator<F>(
        &self,
        ctx: &CancellationToken,
        valid: F,
        mut err_rx: Option<&mut mpsc::Receiver<Error>>,
    ) -> Result<T, Error>
    where
        F: Fn(&T) -> Result<bool, Error>,
    {
        loop {
            let (val, wake) = self.bcast.hold_lock(|g| (g.val.clone(), g.get_wait()));
            if valid(&val)? {
                return Ok(val);
            }

            tokio::select! {
                _ = ctx.cancelled() => return Err(Error::Canceled),
                err = recv_aux_err(&mut err_rx) => return Err(err),
                _ = wake.wait() => {}
            }
        }
    }

    /// Waits for any non-empty value.
    pub async fn wait_value(
        &self,
        ctx: &CancellationToken,
        err_rx: Option<&mut mpsc::Receiver<Error>>,
    ) -> Result<T, Error> {
        let empty = T::default();
        self.wait_value_with_validator(ctx, |v| Ok(!self.values_equal(v, &empty)), err_rx)
            .await
    }

    /// Waits for a value different from `old`.
    pub async fn wait_value_change(
        &self,
        ctx: &CancellationToken,
        old: &T,
        err_rx: Option<&mut mpsc::Receiver<Error>>,
    ) -> Result<T, Error> {
        self.wait_value_with_validator(ctx, |v| Ok(!self.values_equal(v, old)), err_rx)
            .await
    }

    /// Waits for the container to become empty.
    pub async fn wait_value_empty(
        &self,
        ctx: &CancellationToken,
        err_rx: Option<&mut mpsc::Receiver<Error>>,
    ) -> Result<(), Error> {
        let empty = T::default();
        self.wait_value_with_validator(ctx, |v| Ok(self.values_equal(v, &empty)), err_rx)
            .await?;
        Ok(())
    }

    /// Returns a read-only watchable view of this container.
    pub fn as_watchable(&self) -> Arc<dyn Watchable<T>> {
        Arc::new(self.clone())
    }

    fn values_equal(&self, a: &T, b: &T) -> bool {
        self.bcast.hold_lock(|g| g.same(a, b))
    }
}

/// # Read-only view over a value that can be watched for changes.
///
/// Implemented by [`CContainer`]; other value sources can implement it to be
/// observed the same way.
#[async_trait]
pub trait Watchable<T>: Send + Sync
where
    T: Clone + PartialEq + Default + Send + Sync + 'static,
{
    /// Returns a snapshot of the current value.
    fn get_value(&self) -> T;

    /// Waits for any value accepted by `valid`.
    async fn wait_value_with_validator(
        &self,
        ctx: &CancellationToken,
        valid: &(dyn for<'a> Fn(&'a T) -> Result<bool, Error> + Send + Sync),
        err_rx: Option<&mut mpsc::Receiver<Error>>,
    ) -> Result<T, Error>;

    /// Waits for any non-empty value.
    async fn wait_value(
        &self,
        ctx: &CancellationToken,
        err_rx: Option<&mut mpsc::Receiver<Error>>,
    ) -> Result<T, Error>;

    /// Waits for a value different from `old`.
    async fn wait_value_change(
        &self,
        ctx: &CancellationToken,
        old: &T,
        err_rx: Option<&mut mpsc::Receiver<Error>>,
    ) -> Result<T, Error>;

    /// Waits for the value to become empty.
    async fn wait_value_empty(
        &self,
        ctx: &CancellationToken,
        err_rx: Option<&mut mpsc::Receiver<Error>>,
    ) -> Result<(), Error>;
}

#[async_trait]
impl<T> Watchable<T> for CContainer<T>
where
    T: Clone + PartialEq + Default + Send + Sync + 'static,
{
    fn get_value(&self) -> T {
        CContainer::get_value(self)
    }

    async fn wait_value_with_validator(
        &self,
        ctx: &CancellationToken,
        valid: &(dyn for<'a> Fn(&'a T) -> Result<bool, Error> + Send + Sync),
        err_rx: Option<&mut mpsc::Receiver<Error>>,
    ) -> Result<T, Error> {
        CContainer::wait_value_with_validator(self, ctx, valid, err_rx).await
    }

    async fn wait_value(
        &self,
        ctx: &CancellationToken,
        err_rx: Option<&mut mpsc::Receiver<Error>>,
    ) -> Result<T, Error> {
        CContainer::wait_value(self, ctx, err_rx).await
    }

    async fn wait_value_change(
        &self,
        ctx: &CancellationToken,
        old: &T,
        err_rx: Option<&mut mpsc::Receiver<Error>>,
    ) -> Result<T, Error> {
        CContainer::wait_value_change(self, ctx, old, err_rx).await
    }

    async fn wait_value_empty(
        &self,
        ctx: &CancellationToken,
        err_rx: Option<&mut mpsc::Receiver<Error>>,
    ) -> Result<(), Error> {
        CContainer::wait_value_empty(self, ctx, err_rx).await
    }
}
