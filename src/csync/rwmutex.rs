//! Cancellation-aware reader/writer lock with writer priority.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::broadcast::Broadcast;
use crate::error::Error;

struct RwState {
    n_readers: usize,
    writing: bool,
    /// Writers parked waiting for the lock. While nonzero, new readers wait.
    write_waiting: usize,
}

/// # Reader/writer lock whose acquisition accepts a cancellation token.
///
/// A single writer or many readers hold the lock at a time. A queued writer
/// blocks new readers, preventing writer starvation.
///
/// Cheap to clone; clones share the same lock.
#[derive(Clone)]
pub struct RwMutex {
    bcast: Arc<Broadcast<RwState>>,
}

impl Default for RwMutex {
    fn default() -> Self {
        RwMutex::new()
    }
}

impl RwMutex {
    /// Builds an unlocked lock.
    pub fn new() -> Self {
        RwMutex {
            bcast: Arc::new(Broadcast::new(RwState {
                n_readers: 0,
                writing: false,
                write_waiting: 0,
            })),
        }
    }

    /// Acquires the write lock.
    ///
    /// While parked the writer is counted in the queue, holding off new
    /// readers; abandoning the wait (cancellation or drop) leaves the queue.
    pub async fn write(&self, ctx: &CancellationToken) -> Result<RwMutexPermit, Error> {
        let mut queued: Option<QueuedWriter> = None;
        loop {
            let (acquired, wake) = self.bcast.hold_lock(|g| {
                if g.n_readers == 0 && !g.writing {
                    if queued.is_some() {
                        g.write_waiting -= 1;
                    }
                    g.writing = true;
                    (true, None)
                } else {
                    if queued.is_none() {
                        g.write_waiting += 1;
                    }
                    (false, Some(g.get_wait()))
                }
            });
            if acquired {
                if let Some(mut queued) = queued.take() {
                    queued.disarm();
                }
                return Ok(self.permit(true));
            }
            if queued.is_none() {
                queued = Some(QueuedWriter {
                    bcast: self.bcast.clone(),
                    armed: true,
                });
            }
            if let Some(wake) = wake {
                tokio::select! {
                    _ = ctx.cancelled() => return Err(Error::Canceled),
                    _ = wake.wait() => {}
                }
            }
        }
    }

    /// Acquires a read lock. Waits while a writer holds or awaits the lock.
    pub async fn read(&self, ctx: &CancellationToken) -> Result<RwMutexPermit, Error> {
        loop {
            let (acquired, wake) = self.bcast.hold_lock(|g| {
                if !g.writing && g.write_waiting == 0 {
                    g.n_readers += 1;
                    (true, None)
                } else {
                    (false, Some(g.get_wait()))
                }
            });
            if acquired {
                return Ok(self.permit(false));
            }
            if let Some(wake) = wake {
                tokio::select! {
                    _ = ctx.cancelled() => return Err(Error::Canceled),
                    _ = wake.wait() => {}
                }
            }
        }
    }

    /// Non-blocking write-lock attempt.
    pub fn try_write(&self) -> Option<RwMutexPermit> {
        let acquired = self.bcast.hold_lock(|g| {
            if g.n_readers == 0 && !g.writing {
                g.writing = true;
                true
            } else {
                false
            }
        });
        acquired.then(|| self.permit(true))
    }

    /// Non-blocking read-lock attempt.
    pub fn try_read(&self) -> Option<RwMutexPermit> {
        let acquired = self.bcast.hold_lock(|g| {
            if !g.writing && g.write_waiting == 0 {
                g.n_readers += 1;
                true
            } else {
                false
            }
        });
        acquired.then(|| self.permit(false))
    }

    /// Acquires the write lock without a cancellation point.
    pub async fn write_uncanceled(&self) -> RwMutexPermit {
        let never = CancellationToken::new();
        match self.write(&never).await {
            Ok(permit) => permit,
            Err(_) => unreachable!("write with a never-canceled token cannot fail"),
        }
    }

    /// Acquires a read lock without a cancellation point.
    pub async fn read_uncanceled(&self) -> RwMutexPermit {
        let never = CancellationToken::new();
        match self.read(&never).await {
            Ok(permit) => permit,
            Err(_) => unreachable!("read with a never-canceled token cannot fail"),
        }
    }

    fn permit(&self, write: bool) -> RwMutexPermit {
        RwMutexPermit {
            bcast: self.bcast.clone(),
            write,
            released: AtomicBool::new(false),
        }
    }
}

/// Undoes the `write_waiting` count if a parked writer abandons the wait.
struct QueuedWriter {
    bcast: Arc<Broadcast<RwState>>,
    armed: bool,
}

impl QueuedWriter {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for QueuedWriter {
    fn drop(&mut self) {
        if self.armed {
            self.bcast.hold_lock(|g| {
                g.write_waiting -= 1;
                g.broadcast();
            });
        }
    }
}

/// Held [`RwMutex`] lock (read or write). Released explicitly via
/// [`release`](RwMutexPermit::release) (idempotent) or implicitly on drop.
pub struct RwMutexPermit {
    bcast: Arc<Broadcast<RwState>>,
    write: bool,
    released: AtomicBool,
}

impl RwMutexPermit {
    /// Unlocks. Safe to call any number of times.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.bcast.hold_lock(|g| {
            if self.write {
                g.writing = false;
            } else {
                g.n_readers -= 1;
            }
            g.broadcast();
        });
    }
}

impl Drop for RwMutexPermit {
    fn drop(&mut self) {
        self.release();
    }
}
