//! # Re-armable broadcast wakeup guarding a critical section.
//!
//! [`Broadcast`] pairs a piece of state `S` with a single wakeup token under
//! one lock. Waiters obtain the current [`WaitToken`] while reading the
//! state; [`broadcast`](BroadcastGuard::broadcast) signals every outstanding
//! token exactly once and disarms, and the next
//! [`get_wait`](BroadcastGuard::get_wait) re-arms lazily.
//!
//! This is deliberately *not* a condition variable: there is no waiter queue
//! and no per-waiter predicate. Exactly one wakeup generation is in flight at
//! a time, and waiters must re-check their predicate under the lock after
//! every wakeup.
//!
//! # Example
//! ```
//! use coopsync::Broadcast;
//!
//! let b: Broadcast<u32> = Broadcast::new(0);
//! let w = b.get_wait();
//! assert!(!w.is_signaled());
//!
//! b.hold_lock(|g| {
//!     **g += 1;
//!     g.broadcast();
//! });
//! assert!(w.is_signaled());
//!
//! // The next token belongs to a fresh generation.
//! assert!(!b.get_wait().is_signaled());
//! ```

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

use tokio_util::sync::CancellationToken;

use crate::error::Error;

/// Handle to one wakeup generation of a [`Broadcast`].
///
/// Becomes signaled when the broadcast next fires; tokens handed out after
/// that belong to the following generation. Clones observe the same
/// generation.
#[derive(Clone, Debug)]
pub struct WaitToken(CancellationToken);

impl WaitToken {
    /// Waits until the token is signaled. Returns immediately if it already
    /// was.
    pub async fn wait(&self) {
        self.0.cancelled().await;
    }

    /// Returns whether the broadcast fired for this generation.
    pub fn is_signaled(&self) -> bool {
        self.0.is_cancelled()
    }

    pub(crate) fn from_token(token: CancellationToken) -> Self {
        WaitToken(token)
    }
}

struct Inner<S> {
    state: S,
    wake: Option<CancellationToken>,
}

/// # Single-shot, re-armable wakeup channel guarding state `S`.
///
/// All mutation of `S` happens inside [`hold_lock`](Broadcast::hold_lock),
/// which lets a caller combine a state change and a broadcast atomically.
pub struct Broadcast<S = ()> {
    inner: Mutex<Inner<S>>,
}

impl<S: Default> Default for Broadcast<S> {
    fn default() -> Self {
        Broadcast::new(S::default())
    }
}

impl<S> Broadcast<S> {
    /// Builds a broadcast guarding the given state.
    pub fn new(state: S) -> Self {
        Broadcast {
            inner: Mutex::new(Inner { state, wake: None }),
        }
    }

    /// Returns the wait token for the current generation, arming it if
    /// needed.
    pub fn get_wait(&self) -> WaitToken {
        self.hold_lock(|g| g.get_wait())
    }

    /// Signals every outstanding wait token and disarms.
    pub fn broadcast(&self) {
        self.hold_lock(|g| g.broadcast());
    }

    /// Runs `cb` while holding the lock.
    ///
    /// The guard dereferences to `S` and exposes
    /// [`broadcast`](BroadcastGuard::broadcast) /
    /// [`get_wait`](BroadcastGuard::get_wait). The lock is released on every
    /// exit path.
    pub fn hold_lock<R>(&self, cb: impl FnOnce(&mut BroadcastGuard<'_, S>) -> R) -> R {
        let mut guard = BroadcastGuard {
            inner: lock_recover(&self.inner),
        };
        cb(&mut guard)
    }

    /// Waits until `cb` reports completion.
    ///
    /// Loops: runs `cb` under the lock; `Ok(Some(v))` returns `v`, `Err`
    /// returns the error, and `Ok(None)` sleeps until the next broadcast or
    /// until `ctx` is canceled.
    pub async fn wait<R>(
        &self,
        ctx: &CancellationToken,
        mut cb: impl FnMut(&mut BroadcastGuard<'_, S>) -> Result<Option<R>, Error>,
    ) -> Result<R, Error> {
        loop {
            let (res, wake) = self.hold_lock(|g| {
                let res = cb(g);
                let wake = match &res {
                    Ok(None) => Some(g.get_wait()),
                    _ => None,
                };
                (res, wake)
            });
            match res {
                Ok(Some(v)) => return Ok(v),
                Err(err) => return Err(err),
                Ok(None) => {
                    if let Some(wake) = wake {
                        tokio::select! {
                            _ = ctx.cancelled() => return Err(Error::Canceled),
                            _ = wake.wait() => {}
                        }
                    }
                }
            }
        }
    }
}

impl<S: Send + 'static> Broadcast<S> {
    /// Runs `cb` under the lock, inline if the lock is free.
    ///
    /// If the lock is currently held, `cb` is scheduled on a fresh task that
    /// acquires the lock instead. Re-entrant callers (callbacks invoked while
    /// the lock is held) use this to avoid deadlocking on their own lock.
    pub fn hold_lock_maybe_async(
        self: Arc<Self>,
        cb: impl FnOnce(&mut BroadcastGuard<'_, S>) + Send + 'static,
    ) {
        let deferred = {
            match self.inner.try_lock() {
                Ok(guard) => {
                    let mut guard = BroadcastGuard { inner: guard };
                    cb(&mut guard);
                    None
                }
                Err(TryLockError::Poisoned(poisoned)) => {
                    let mut guard = BroadcastGuard {
                        inner: poisoned.into_inner(),
                    };
                    cb(&mut guard);
                    None
                }
                Err(TryLockError::WouldBlock) => Some(cb),
            }
        };
        if let Some(cb) = deferred {
            tokio::spawn(async move {
                self.hold_lock(cb);
            });
        }
    }
}

/// Critical-section view of a [`Broadcast`].
pub struct BroadcastGuard<'a, S> {
    inner: MutexGuard<'a, Inner<S>>,
}

impl<S> BroadcastGuard<'_, S> {
    /// Signals every outstanding wait token and disarms.
    pub fn broadcast(&mut self) {
        if let Some(wake) = self.inner.wake.take() {
            wake.cancel();
        }
    }

    /// Returns the wait token for the current generation, arming it if
    /// needed.
    pub fn get_wait(&mut self) -> WaitToken {
        WaitToken(
            self.inner
                .wake
                .get_or_insert_with(CancellationToken::new)
                .clone(),
        )
    }
}

impl<S> Deref for BroadcastGuard<'_, S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.inner.state
    }
}

impl<S> DerefMut for BroadcastGuard<'_, S> {
    fn deref_mut(&mut self) -> &mut S {
        &mut self.inner.state
    }
}

/// Locks a mutex, recovering the guard if a panicking holder poisoned it.
pub(crate) fn lock_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
