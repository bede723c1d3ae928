//! Routine container keyed on an input state.

use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::broadcast::{lock_recover, WaitToken};
use crate::ccontainer::EqualFn;
use crate::error::Error;
use crate::promise::{Promise, PromiseContainer};

use super::{RoutineContainer, RoutineFn, StateRoutineFn, StateRoutineRef};

struct StateInner<T> {
    state: T,
    routine: Option<StateRoutineRef<T>>,
}

/// # Container for a routine whose input is a state value.
///
/// Whenever the state changes (under the configured equality), the wrapped
/// routine is canceled and restarted with the new state. A state equal to
/// `T::default()` clears the routine instead; state without a natural empty
/// value is typically wrapped in `Option`.
///
/// Cheap to clone; clones share the same container.
pub struct StateRoutineContainer<T> {
    rc: RoutineContainer,
    inner: Arc<Mutex<StateInner<T>>>,
    equal: Option<EqualFn<T>>,
}

impl<T> Clone for StateRoutineContainer<T> {
    fn clone(&self) -> Self {
        StateRoutineContainer {
            rc: self.rc.clone(),
            inner: self.inner.clone(),
            equal: self.equal.clone(),
        }
    }
}

impl<T> StateRoutineContainer<T>
where
    T: Clone + PartialEq + Default + Send + Sync + 'static,
{
    /// Builds a state container over the given routine container.
    ///
    /// Note: the routine won't start until
    /// [`set_context`](Self::set_context) is called and a non-empty state is
    /// set.
    pub fn new(rc: RoutineContainer) -> Self {
        StateRoutineContainer {
            rc,
            inner: Arc::new(Mutex::new(StateInner {
                state: T::default(),
                routine: None,
            })),
            equal: None,
        }
    }

    /// Overrides state equality. Two states are equivalent iff `==` *or*
    /// the predicate reports them equal; equivalent states do not restart
    /// the routine.
    pub fn with_equal(mut self, equal: EqualFn<T>) -> Self {
        self.equal = Some(equal);
        self
    }

    /// Returns a snapshot of the current state.
    pub fn get_state(&self) -> T {
        lock_recover(&self.inner).state.clone()
    }

    /// Stores a new state, restarting the routine if the state changed.
    ///
    /// Returns the previous run's exit signal (if a run was replaced),
    /// whether the state changed, whether the routine was reset, and
    /// whether a routine is now running.
    pub fn set_state(&self, state: T) -> (Option<WaitToken>, bool, bool, bool) {
        let mut inner = lock_recover(&self.inner);
        self.set_state_locked(&mut inner, state)
    }

    /// Locks the container, calls `cb` on the state, and stores the result.
    ///
    /// Returns the final state along with the
    /// [`set_state`](Self::set_state) results.
    pub fn swap_state(
        &self,
        cb: impl FnOnce(T) -> T,
    ) -> (T, Option<WaitToken>, bool, bool, bool) {
        let mut inner = lock_recover(&self.inner);
        let before = inner.state.clone();
        let next = cb(before.clone());
        if next == before {
            let running = self.rc.is_running();
            return (next, None, false, false, running);
        }
        let (wait, changed, reset, running) = self.set_state_locked(&mut inner, next);
        let state = inner.state.clone();
        (state, wait, changed, reset, running)
    }

    /// Replaces the state routine, resetting any existing run.
    ///
    /// Passing `None` shuts the current routine down. Returns the previous
    /// run's exit signal, whether a run was replaced, and whether a routine
    /// is now running.
    pub fn set_state_routine(
        &self,
        routine: Option<StateRoutineRef<T>>,
    ) -> (Option<WaitToken>, bool, bool) {
        let mut inner = lock_recover(&self.inner);
        inner.routine = routine;
        self.update_routine_locked(&inner)
    }

    /// Establishes, updates, or clears the root context.
    pub fn set_context(&self, ctx: Option<Arc<CancellationToken>>, restart: bool) -> bool {
        self.rc.set_context(ctx, restart)
    }

    /// Clears the root context, canceling the running routine.
    pub fn clear_context(&self) -> bool {
        self.rc.clear_context()
    }

    /// Cancels and restarts the current routine with the same state.
    pub fn restart_routine(&self) -> bool {
        self.rc.restart_routine()
    }

    /// Waits until the routine has exited once. See
    /// [`RoutineContainer::wait_exited`].
    pub async fn wait_exited(
        &self,
        ctx: &CancellationToken,
        return_if_not_running: bool,
        err_rx: Option<&mut mpsc::Receiver<Error>>,
    ) -> Result<(), Error> {
        self.rc.wait_exited(ctx, return_if_not_running, err_rx).await
    }

    fn states_equal(&self, a: &T, b: &T) -> bool {
        if a == b {
            return true;
        }
        match &self.equal {
            Some(eq) => eq(a, b),
            None => false,
        }
    }

    fn set_state_locked(
        &self,
        inner: &mut StateInner<T>,
        state: T,
    ) -> (Option<WaitToken>, bool, bool, bool) {
        if self.states_equal(&inner.state, &state) {
            return (None, false, false, self.rc.is_running());
        }
        inner.state = state;
        let (wait, reset, running) = self.update_routine_locked(inner);
        (wait, true, reset, running)
    }

    /// Re-wraps the state routine around the current state and installs it.
    fn update_routine_locked(&self, inner: &StateInner<T>) -> (Option<WaitToken>, bool, bool) {
        let wrapped = match (&inner.routine, inner.state != T::default()) {
            (Some(routine), true) => {
                let routine = routine.clone();
                let state = inner.state.clone();
                Some(RoutineFn::arc(move |ctx: CancellationToken| {
                    let routine = routine.clone();
                    let state = state.clone();
                    async move { routine.run(ctx, state).await }
                }))
            }
            _ => None,
        };
        let (wait, reset) = self.rc.set_routine(wrapped);
        let running = self.rc.is_running();
        (wait, reset, running)
    }
}

/// Adapts a state routine producing a value into a [`StateRoutineRef`] that
/// publishes each attempt's result into a fresh [`PromiseContainer`].
///
/// Returns the routine and the container observers await on.
pub fn new_state_result_routine<T, R, F, Fut>(
    routine: F,
) -> (StateRoutineRef<T>, PromiseContainer<R>)
where
    T: Clone + PartialEq + Default + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
    F: Fn(CancellationToken, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, Error>> + Send + 'static,
{
    let results = PromiseContainer::new();
    let wrapped = state_result_routine_with_container(routine, results.clone());
    (wrapped, results)
}

/// As [`new_state_result_routine`], publishing into the given container.
///
/// Each run replaces the container's promise before starting, so observers
/// can tell a new attempt from the previous attempt's result.
pub fn state_result_routine_with_container<T, R, F, Fut>(
    routine: F,
    results: PromiseContainer<R>,
) -> StateRoutineRef<T>
where
    T: Clone + PartialEq + Default + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
    F: Fn(CancellationToken, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, Error>> + Send + 'static,
{
    StateRoutineFn::arc(move |ctx: CancellationToken, state: T| {
        let promise = Promise::new();
        results.set_promise(Some(promise.clone()));
        let fut = routine(ctx.clone(), state);
        async move {
            let res = fut.await;
            if ctx.is_cancelled() {
                return Err(Error::Canceled);
            }
            match res {
                Ok(val) => {
                    promise.set_result(Ok(val));
                    Ok(())
                }
                Err(err) => {
                    promise.set_result(Err(err.clone()));
                    Err(err)
                }
            }
        }
    })
}
