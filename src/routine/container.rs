//! Container managing the lifecycle of a single routine.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::backoff::BackOff;
use crate::broadcast::{Broadcast, BroadcastGuard, WaitToken};
use crate::error::{recv_aux_err, Error};

use super::RoutineRef;

/// Callback invoked after a routine exits; receives the exit error, if any.
pub type RoutineExitCb = Arc<dyn Fn(Option<&Error>) + Send + Sync>;

/// One installed routine and the bookkeeping of its current run.
struct RunningRoutine {
    /// Identity of the current start; bumped to invalidate stale exits.
    start_gen: u64,
    routine: RoutineRef,
    /// Child token of the current run; `None` until started.
    cancel: Option<CancellationToken>,
    /// Signaled when the current run exits; `None` once recorded.
    exited_tok: Option<CancellationToken>,
    err: Option<Error>,
    success: bool,
    exited: bool,
    defer_retry: Option<CancellationToken>,
}

impl RunningRoutine {
    fn new(routine: RoutineRef) -> Self {
        RunningRoutine {
            start_gen: 0,
            routine,
            cancel: None,
            exited_tok: None,
            err: None,
            success: false,
            exited: false,
            defer_retry: None,
        }
    }
}

struct Inner {
    ctx: Option<Arc<CancellationToken>>,
    routine: Option<RunningRoutine>,
    retry_bo: Option<Box<dyn BackOff + Send>>,
    /// Start generations whose routine was replaced while running; their
    /// exits still fire the exit callbacks.
    detached: HashSet<u64>,
}

struct Shared {
    bcast: Broadcast<Inner>,
    exit_cbs: Vec<RoutineExitCb>,
    gen: AtomicU64,
}

/// # Builder for [`RoutineContainer`].
#[derive(Default)]
pub struct RoutineContainerBuilder {
    exit_cbs: Vec<RoutineExitCb>,
    retry_bo: Option<Box<dyn BackOff + Send>>,
}

impl RoutineContainerBuilder {
    /// Adds a callback invoked after the routine exits.
    ///
    /// Callbacks run with the lock released, in reverse registration order.
    pub fn exit_cb(mut self, cb: RoutineExitCb) -> Self {
        self.exit_cbs.push(cb);
        self
    }

    /// Retries a failed routine, delaying each attempt by the backoff.
    ///
    /// The backoff resets when the routine exits cleanly.
    pub fn backoff(mut self, cfg: crate::backoff::BackoffConfig) -> Self {
        self.retry_bo = Some(cfg.construct());
        self
    }

    /// Adds an exit callback that logs the exit via `tracing`.
    #[cfg(feature = "logging")]
    pub fn exit_log(self) -> Self {
        self.exit_cb(Arc::new(|err: Option<&Error>| match err {
            Some(err) if !err.is_canceled() => tracing::warn!(%err, "routine exited"),
            _ => tracing::debug!("routine exited"),
        }))
    }

    /// Finishes the builder.
    ///
    /// Note: routines won't start until
    /// [`set_context`](RoutineContainer::set_context) is called.
    pub fn build(self) -> RoutineContainer {
        RoutineContainer {
            shared: Arc::new(Shared {
                bcast: Broadcast::new(Inner {
                    ctx: None,
                    routine: None,
                    retry_bo: self.retry_bo,
                    detached: HashSet::new(),
                }),
                exit_cbs: self.exit_cbs,
                gen: AtomicU64::new(0),
            }),
        }
    }
}

/// # Holds at most one long-running routine.
///
/// The routine runs on a dedicated task once both a routine and a root
/// context are installed. Cheap to clone; clones share the same container.
///
/// # Example
/// ```
/// use std::sync::Arc;
/// use coopsync::routine::{RoutineContainer, RoutineFn};
/// use tokio_util::sync::CancellationToken;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let rc = RoutineContainer::new();
/// rc.set_routine(Some(RoutineFn::arc(|_ctx: CancellationToken| async {
///     Ok(())
/// })));
///
/// let root = Arc::new(CancellationToken::new());
/// rc.set_context(Some(root.clone()), false);
/// rc.wait_exited(&root, false, None).await.unwrap();
/// # }
/// ```
#[derive(Clone)]
pub struct RoutineContainer {
    shared: Arc<Shared>,
}

impl Default for RoutineContainer {
    fn default() -> Self {
        RoutineContainer::new()
    }
}

impl RoutineContainer {
    /// Builds a container with no options.
    ///
    /// Note: routines won't start until
    /// [`set_context`](RoutineContainer::set_context) is called.
    pub fn new() -> Self {
        RoutineContainer::builder().build()
    }

    /// Returns a builder for configuring exit callbacks and retry backoff.
    pub fn builder() -> RoutineContainerBuilder {
        RoutineContainerBuilder::default()
    }

    /// Replaces the routine, canceling the current one if running.
    ///
    /// Returns the exit signal of the previous run (so callers can await
    /// shutdown) and whether a previous routine was replaced or cleared.
    /// Passing `None` clears the routine.
    pub fn set_routine(&self, routine: Option<RoutineRef>) -> (Option<WaitToken>, bool) {
        self.shared.bcast.hold_lock(|g| {
            prune_ctx(g);

            let prev = g.routine.take();
            let was_reset = prev.is_some();
            let mut prev_exited: Option<CancellationToken> = None;
            if let Some(mut prev) = prev {
                prev_exited = prev.exited_tok.clone();
                if let Some(cancel) = prev.cancel.take() {
                    cancel.cancel();
                    if !prev.exited {
                        g.detached.insert(prev.start_gen);
                    }
                }
                if let Some(timer) = prev.defer_retry.take() {
                    timer.cancel();
                }
            }
            g.broadcast();

            if let Some(routine) = routine {
                g.routine = Some(RunningRoutine::new(routine));
                if let Some(root) = g.ctx.clone() {
                    start_locked(&self.shared, g, &root, prev_exited.clone(), false);
                }
            }
            (prev_exited.map(WaitToken::from_token), was_reset)
        })
    }

    /// Establishes, updates, or clears the root context.
    ///
    /// Passing the same context again with `restart == false` is a no-op.
    /// A `None` context cancels the running routine. With `restart == true`
    /// an errored routine is started again.
    ///
    /// Returns whether the routine was stopped or restarted.
    pub fn set_context(&self, ctx: Option<Arc<CancellationToken>>, restart: bool) -> bool {
        self.shared.bcast.hold_lock(|g| {
            let same = same_ctx(&g.ctx, &ctx);
            if same && !restart {
                return false;
            }
            g.ctx = ctx;

            let proceed = match g.routine.as_ref() {
                Some(rr) => !(same && rr.err.is_none()),
                None => false,
            };
            if !proceed {
                return false;
            }

            let (wait, should_start) = {
                let Some(rr) = g.routine.as_mut() else {
                    return false;
                };
                if let Some(cancel) = rr.cancel.take() {
                    cancel.cancel();
                }
                // Invalidate in place: the canceled run exits silently.
                rr.start_gen = next_gen(&self.shared);
                (rr.exited_tok.clone(), rr.err.is_none() || restart)
            };
            if should_start {
                if let Some(root) = g.ctx.clone() {
                    start_locked(&self.shared, g, &root, wait, false);
                }
            }
            g.broadcast();
            true
        })
    }

    /// Clears the root context, canceling the running routine.
    pub fn clear_context(&self) -> bool {
        self.set_context(None, false)
    }

    /// Cancels and restarts the current routine with the same root context.
    ///
    /// Returns false if no routine is installed or no context is set.
    pub fn restart_routine(&self) -> bool {
        self.shared.bcast.hold_lock(|g| {
            prune_ctx(g);
            if g.routine.is_none() {
                return false;
            }
            {
                let Some(rr) = g.routine.as_mut() else {
                    return false;
                };
                if let Some(cancel) = rr.cancel.take() {
                    cancel.cancel();
                }
                rr.start_gen = next_gen(&self.shared);
            }
            g.broadcast();

            let Some(root) = g.ctx.clone() else {
                return false;
            };
            let wait = match g.routine.as_mut() {
                Some(rr) => rr.exited_tok.take(),
                None => None,
            };
            start_locked(&self.shared, g, &root, wait, true);
            true
        })
    }

    /// Waits until the routine has exited once, returning its error if any.
    ///
    /// Does not return when the routine is merely restarted. If
    /// `return_if_not_running` is set, returns immediately when no routine
    /// is installed. `err_rx` is an optional auxiliary error channel.
    pub async fn wait_exited(
        &self,
        ctx: &CancellationToken,
        return_if_not_running: bool,
        mut err_rx: Option<&mut mpsc::Receiver<Error>>,
    ) -> Result<(), Error> {
        loop {
            let (done, err, wake) = self.shared.bcast.hold_lock(|g| {
                let (done, err) = match g.routine.as_ref() {
                    Some(rr) => {
                        let exited = rr.exited || rr.success;
                        (exited, if exited { rr.err.clone() } else { None })
                    }
                    None => (return_if_not_running, None),
                };
                (done, err, g.get_wait())
            });
            if done {
                return match err {
                    Some(err) => Err(err),
                    None => Ok(()),
                };
            }
            tokio::select! {
                _ = ctx.cancelled() => return Err(Error::Canceled),
                err = recv_aux_err(&mut err_rx) => return Err(err),
                _ = wake.wait() => {}
            }
        }
    }

    /// Returns whether a routine is currently started and has not exited.
    pub fn is_running(&self) -> bool {
        self.shared
            .bcast
            .hold_lock(|g| g.routine.as_ref().is_some_and(|rr| rr.cancel.is_some() && !rr.exited))
    }
}

fn same_ctx(a: &Option<Arc<CancellationToken>>, b: &Option<Arc<CancellationToken>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        _ => false,
    }
}

fn prune_ctx(g: &mut BroadcastGuard<'_, Inner>) {
    if g.ctx.as_ref().is_some_and(|c| c.is_cancelled()) {
        g.ctx = None;
    }
}

fn next_gen(shared: &Shared) -> u64 {
    shared.gen.fetch_add(1, Ordering::Relaxed) + 1
}

/// Starts or restarts the installed routine. Caller holds the lock.
///
/// If `wait` is set, the run waits for that signal (the previous run's
/// exit) before invoking the routine. `force_restart` cancels a live run.
fn start_locked(
    shared: &Arc<Shared>,
    g: &mut BroadcastGuard<'_, Inner>,
    root: &CancellationToken,
    wait: Option<CancellationToken>,
    force_restart: bool,
) {
    let gen = next_gen(shared);
    let Some(rr) = g.routine.as_mut() else {
        return;
    };
    if !force_restart && rr.success {
        return;
    }
    let still_running =
        rr.cancel.as_ref().is_some_and(|c| !c.is_cancelled()) && !rr.exited;
    if !force_restart && still_running {
        return;
    }
    if let Some(timer) = rr.defer_retry.take() {
        timer.cancel();
    }
    if let Some(cancel) = rr.cancel.take() {
        cancel.cancel();
    }

    rr.start_gen = gen;
    rr.err = None;
    rr.success = false;
    rr.exited = false;
    let exited = CancellationToken::new();
    rr.exited_tok = Some(exited.clone());
    let child = root.child_token();
    rr.cancel = Some(child.clone());
    spawn_execute(shared.clone(), rr.routine.clone(), child, exited, wait, gen);
}

/// Runs one attempt of the routine on a dedicated task and records the
/// result.
fn spawn_execute(
    shared: Arc<Shared>,
    routine: RoutineRef,
    child: CancellationToken,
    exited: CancellationToken,
    wait: Option<CancellationToken>,
    gen: u64,
) {
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
        let run_cbs = shared.bcast.hold_lock(|g| {
            let attached = g.routine.as_ref().is_some_and(|rr| rr.start_gen == gen);
            if attached {
                {
                    let Inner {
                        routine, retry_bo, ..
                    } = &mut **g;
                    let Some(rr) = routine.as_mut() else {
                        return false;
                    };
                    rr.err = err.clone();
                    rr.success = err.is_none();
                    rr.exited = true;
                    rr.exited_tok = None;
                    if let Some(bo) = retry_bo.as_mut() {
                        if let Some(timer) = rr.defer_retry.take() {
                            timer.cancel();
                        }
                        if rr.success {
                            bo.reset();
                        } else if let Some(dur) = bo.next_backoff() {
                            let timer = CancellationToken::new();
                            rr.defer_retry = Some(timer.clone());
                            spawn_retry(shared.clone(), timer, dur, gen);
                        }
                    }
                }
                g.broadcast();
                true
            } else if g.detached.remove(&gen) {
                g.broadcast();
                true
            } else {
                false
            }
        });
        if run_cbs {
            for cb in shared.exit_cbs.iter().rev() {
                cb(err.as_ref());
            }
        }
    });
}

/// Arms the deferred-retry timer for a failed run.
fn spawn_retry(shared: Arc<Shared>, timer: CancellationToken, dur: Duration, gen: u64) {
    tokio::spawn(async move {
        tokio::select! {
            _ = timer.cancelled() => return,
            _ = tokio::time::sleep(dur) => {}
        }
        shared.bcast.hold_lock(|g| {
            // The timer may have been stopped while we waited for the lock.
            if timer.is_cancelled() {
                return;
            }
            let Some(root) = g.ctx.clone() else {
                return;
            };
            let current = g
                .routine
                .as_ref()
                .is_some_and(|rr| rr.start_gen == gen && rr.exited);
            if current {
                start_locked(&shared, g, &root, None, true);
            }
        });
    });
}
