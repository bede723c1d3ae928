//! Cancellation-aware exclusive lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::broadcast::Broadcast;
use crate::error::Error;

struct MutexState {
    locked: bool,
}

/// # Exclusive lock whose `lock` accepts a cancellation token.
///
/// Cheap to clone; clones share the same lock.
///
/// # Example
/// ```
/// use coopsync::csync::Mutex;
/// use tokio_util::sync::CancellationToken;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let m = Mutex::new();
/// let ctx = CancellationToken::new();
///
/// let permit = m.lock(&ctx).await.unwrap();
/// assert!(m.try_lock().is_none());
/// permit.release();
/// assert!(m.try_lock().is_some());
/// # }
/// ```
#[derive(Clone)]
pub struct Mutex {
    bcast: Arc<Broadcast<MutexState>>,
}

impl Default for Mutex {
    fn default() -> Self {
        Mutex::new()
    }
}

impl Mutex {
    /// Builds an unlocked mutex.
    pub fn new() -> Self {
        Mutex {
            bcast: Arc::new(Broadcast::new(MutexState { locked: false })),
        }
    }

    /// Acquires the lock, parking until it is free or `ctx` is canceled.
    pub async fn lock(&self, ctx: &CancellationToken) -> Result<MutexPermit, Error> {
        loop {
            let (acquired, wake) = self.bcast.hold_lock(|g| {
                if g.locked {
                    (false, Some(g.get_wait()))
                } else {
                    g.locked = true;
                    (true, None)
                }
            });
            if acquired {
                return Ok(self.permit());
            }
            if let Some(wake) = wake {
                tokio::select! {
                    _ = ctx.cancelled() => return Err(Error::Canceled),
                    _ = wake.wait() => {}
                }
            }
        }
    }

    /// Non-blocking acquisition attempt.
    pub fn try_lock(&self) -> Option<MutexPermit> {
        let acquired = self.bcast.hold_lock(|g| {
            if g.locked {
                false
            } else {
                g.locked = true;
                true
            }
        });
        acquired.then(|| self.permit())
    }

    /// Acquires the lock without a cancellation point.
    ///
    /// The adapter for code paths that cannot be canceled.
    pub async fn lock_uncanceled(&self) -> MutexPermit {
        loop {
            let (acquired, wake) = self.bcast.hold_lock(|g| {
                if g.locked {
                    (false, Some(g.get_wait()))
                } else {
                    g.locked = true;
                    (true, None)
                }
            });
            if acquired {
                return self.permit();
            }
            if let Some(wake) = wake {
                wake.wait().await;
            }
        }
    }

    fn permit(&self) -> MutexPermit {
        MutexPermit {
            bcast: self.bcast.clone(),
            released: AtomicBool::new(false),
        }
    }
}

/// Held [`Mutex`] lock. Released explicitly via
/// [`release`](MutexPermit::release) (idempotent, callable from any task)
/// or implicitly on drop.
pub struct MutexPermit {
    bcast: Arc<Broadcast<MutexState>>,
    released: AtomicBool,
}

impl MutexPermit {
    /// Unlocks the mutex. Safe to call any number of times.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.bcast.hold_lock(|g| {
            g.locked = false;
            g.broadcast();
        });
    }
}

impl Drop for MutexPermit {
    fn drop(&mut self) {
        self.release();
    }
}
