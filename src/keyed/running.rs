//! Per-key running-routine bookkeeping: starts, exits, retries, removal.

use std::hash::Hash;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::backoff::BackOff;
use crate::error::Error;
use crate::routine::RoutineRef;

use super::{KeyedInner, KeyedShared};

/// One key's routine and the bookkeeping of its current run.
pub(super) struct Entry<V> {
    /// Identity of the current start; bumped to invalidate stale exits.
    pub(super) start_gen: u64,
    pub(super) routine: RoutineRef,
    pub(super) data: V,
    /// Child token of the current run; `None` until started.
    pub(super) cancel: Option<CancellationToken>,
    /// Signaled when the current run exits; `None` once recorded.
    pub(super) exited_tok: Option<CancellationToken>,
    pub(super) err: Option<Error>,
    pub(super) success: bool,
    pub(super) exited: bool,
    pub(super) defer_remove: Option<CancellationToken>,
    pub(super) defer_retry: Option<CancellationToken>,
    pub(super) retry_bo: Option<Box<dyn BackOff + Send>>,
}

impl<V> Entry<V> {
    pub(super) fn new(
        routine: RoutineRef,
        data: V,
        retry_bo: Option<Box<dyn BackOff + Send>>,
    ) -> Self {
        Entry {
            start_gen: 0,
            routine,
            data,
            cancel: None,
            exited_tok: None,
            err: None,
            success: false,
            exited: false,
            defer_remove: None,
            defer_retry: None,
            retry_bo,
        }
    }

    fn still_running(&self) -> bool {
        self.cancel.as_ref().is_some_and(|c| !c.is_cancelled()) && !self.exited
    }
}

/// A run whose entry left the map while still executing; carried so its
/// exit can still fire the exit callbacks.
pub(super) struct DetachedRun<K, V> {
    pub(super) key: K,
    pub(super) routine: RoutineRef,
    pub(super) data: V,
}

pub(super) fn next_gen<K, V>(shared: &KeyedShared<K, V>) -> u64 {
    shared.gen.fetch_add(1, Ordering::Relaxed) + 1
}

/// Starts or restarts the routine for `key` (if not running). Caller holds
/// the lock.
///
/// If `wait` is set, the run waits for that signal (the previous run's
/// exit) before invoking the routine. `force_restart` cancels a live run.
pub(super) fn start_locked<K, V>(
    shared: &Arc<KeyedShared<K, V>>,
    inner: &mut KeyedInner<K, V>,
    key: &K,
    root: &CancellationToken,
    wait: Option<CancellationToken>,
    force_restart: bool,
) where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    let gen = next_gen(shared);
    let Some(entry) = inner.routines.get_mut(key) else {
        return;
    };
    if !force_restart && entry.success {
        return;
    }
    if !force_restart && entry.still_running() {
        return;
    }
    if let Some(timer) = entry.defer_retry.take() {
        timer.cancel();
    }
    if let Some(cancel) = entry.cancel.take() {
        cancel.cancel();
    }

    entry.start_gen = gen;
    entry.err = None;
    entry.success = false;
    entry.exited = false;
    let exited = CancellationToken::new();
    entry.exited_tok = Some(exited.clone());
    let child = root.child_token();
    entry.cancel = Some(child.clone());
    spawn_execute(
        shared.clone(),
        key.clone(),
        entry.routine.clone(),
        child,
        exited,
        wait,
        gen,
    );
}

/// Runs one attempt of a keyed routine on a dedicated task and records the
/// result.
#[allow(clippy::too_many_arguments)]
fn spawn_execute<K, V>(
    shared: Arc<KeyedShared<K, V>>,
    key: K,
    routine: RoutineRef,
    child: CancellationToken,
    exited: CancellationToken,
    wait: Option<CancellationToken>,
    gen: u64,
) where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut result: Result<(), Error> = Ok(());
        if let Some(wait) = wait {
            tokio::select! {
                _ = child.cancelled() => result = Err(Error::Canceled),
                _ = wait.cancelled() => {}
            }
        } else if child.is_cancelled() {
            result = Err(Error::Canceled);
        }
        if result.is_ok() {
            result = routine.run(child.clone()).await;
        }
        child.cancel();
        exited.cancel();

        let err = result.err();
        let cb_args = {
            let mut inner = shared.lock_inner();
            let attached = inner
                .routines
                .get(&key)
                .is_some_and(|entry| entry.start_gen == gen);
            if attached {
                match inner.routines.get_mut(&key) {
                    Some(entry) => {
                        entry.err = err.clone();
                        entry.success = err.is_none();
                        entry.exited = true;
                        entry.exited_tok = None;
                        if entry.retry_bo.is_some() {
                            if let Some(timer) = entry.defer_retry.take() {
                                timer.cancel();
                            }
                            if entry.success {
                                if let Some(bo) = entry.retry_bo.as_mut() {
                                    bo.reset();
                                }
                            } else {
                                let dur =
                                    entry.retry_bo.as_mut().and_then(|bo| bo.next_backoff());
                                if let Some(dur) = dur {
                                    let timer = CancellationToken::new();
                                    entry.defer_retry = Some(timer.clone());
                                    spawn_retry(shared.clone(), key.clone(), timer, dur, gen);
                                }
                            }
                        }
                        Some((key.clone(), entry.routine.clone(), entry.data.clone()))
                    }
                    None => None,
                }
            } else if let Some(run) = inner.detached.remove(&gen) {
                Some((run.key, run.routine, run.data))
            } else {
                None
            }
        };
        if let Some((key, routine, data)) = cb_args {
            for cb in shared.exit_cbs.iter().rev() {
                cb(&key, &routine, &data, err.as_ref());
            }
        }
    });
}

/// Arms the deferred-retry timer for a failed run.
fn spawn_retry<K, V>(
    shared: Arc<KeyedShared<K, V>>,
    key: K,
    timer: CancellationToken,
    dur: Duration,
    gen: u64,
) where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        tokio::select! {
            _ = timer.cancelled() => return,
            _ = tokio::time::sleep(dur) => {}
        }
        let mut inner = shared.lock_inner();
        // The timer may have been stopped while we waited for the lock.
        if timer.is_cancelled() {
            return;
        }
        let Some(root) = inner.ctx.clone() else {
            return;
        };
        let current = inner
            .routines
            .get(&key)
            .is_some_and(|entry| entry.start_gen == gen && entry.exited);
        if current {
            start_locked(&shared, &mut inner, &key, &root, None, true);
        }
    });
}

/// Removes `key` now or after the release delay. Caller holds the lock.
///
/// Returns whether the key existed. A routine that already exited with an
/// error is removed immediately regardless of the delay.
pub(super) fn remove_entry_locked<K, V>(
    shared: &Arc<KeyedShared<K, V>>,
    inner: &mut KeyedInner<K, V>,
    key: &K,
) -> bool
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    let remove_now = {
        let Some(entry) = inner.routines.get(key) else {
            return false;
        };
        if entry.defer_remove.is_some() {
            // Removal already scheduled.
            return true;
        }
        shared.release_delay.is_zero() || (entry.exited && !entry.success)
    };

    if remove_now {
        remove_now_locked(inner, key);
        return true;
    }

    let timer = CancellationToken::new();
    if let Some(entry) = inner.routines.get_mut(key) {
        entry.defer_remove = Some(timer.clone());
    }
    spawn_defer_remove(shared.clone(), key.clone(), timer);
    true
}

fn remove_now_locked<K, V>(inner: &mut KeyedInner<K, V>, key: &K)
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    let Some(mut entry) = inner.routines.remove(key) else {
        return;
    };
    if let Some(cancel) = entry.cancel.take() {
        cancel.cancel();
        if !entry.exited {
            inner.detached.insert(
                entry.start_gen,
                DetachedRun {
                    key: key.clone(),
                    routine: entry.routine.clone(),
                    data: entry.data.clone(),
                },
            );
        }
    }
    if let Some(timer) = entry.defer_retry.take() {
        timer.cancel();
    }
    if let Some(timer) = entry.defer_remove.take() {
        timer.cancel();
    }
}

/// Finalizes a delayed removal unless it was canceled meanwhile.
fn spawn_defer_remove<K, V>(shared: Arc<KeyedShared<K, V>>, key: K, timer: CancellationToken)
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    let delay = shared.release_delay;
    tokio::spawn(async move {
        tokio::select! {
            _ = timer.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        let mut inner = shared.lock_inner();
        // Re-adding the key cancels the timer; re-check under the lock.
        if timer.is_cancelled() {
            return;
        }
        let scheduled = inner
            .routines
            .get(&key)
            .is_some_and(|entry| entry.defer_remove.is_some());
        if scheduled {
            if let Some(entry) = inner.routines.get_mut(&key) {
                entry.defer_remove = None;
            }
            remove_now_locked(&mut inner, &key);
        }
    });
}
