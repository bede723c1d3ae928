//! # Long-running cancelable routines and their containers.
//!
//! A [`Routine`] is an async, cancelable unit of work: it receives a
//! [`CancellationToken`] and should return promptly once the token is
//! canceled. [`RoutineContainer`] holds at most one routine and manages its
//! lifecycle (start, stop, restart, retry with backoff, exit callbacks);
//! [`StateRoutineContainer`] additionally restarts the routine whenever its
//! input state changes.

use std::future::Future;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::broadcast::lock_recover;
use crate::error::Error;

mod container;
mod state;

pub use container::{RoutineContainer, RoutineContainerBuilder, RoutineExitCb};
pub use state::{
    new_state_result_routine, state_result_routine_with_container, StateRoutineContainer,
};

/// # Shared handle to a routine object.
pub type RoutineRef = std::sync::Arc<dyn Routine>;

/// # Asynchronous, cancelable unit of work.
///
/// If `run` returns `Ok`, the routine exited cleanly and will not be
/// restarted automatically. If it returns an error, it can be restarted
/// later (or retried by a configured backoff). Implementations should check
/// the token regularly and exit promptly during shutdown.
#[async_trait]
pub trait Routine: Send + Sync + 'static {
    /// Executes the routine until completion or cancellation.
    async fn run(&self, ctx: CancellationToken) -> Result<(), Error>;
}

/// # Function-backed routine.
///
/// Wraps a closure `F: FnMut(CancellationToken) -> Fut`. The closure is
/// guarded by a mutex so `run(&self, ..)` can be called repeatedly; the
/// mutex is held only while creating the future, not while running it.
///
/// # Example
/// ```
/// use coopsync::routine::{RoutineFn, RoutineRef};
/// use tokio_util::sync::CancellationToken;
///
/// let r: RoutineRef = RoutineFn::arc(|ctx: CancellationToken| async move {
///     ctx.cancelled().await;
///     Ok(())
/// });
/// # let _ = r;
/// ```
pub struct RoutineFn<F, Fut>
where
    F: FnMut(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
{
    func: Mutex<F>,
}

impl<F, Fut> RoutineFn<F, Fut>
where
    F: FnMut(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
{
    /// Creates a new function-backed routine.
    pub fn new(func: F) -> Self {
        RoutineFn {
            func: Mutex::new(func),
        }
    }

    /// Creates the routine and returns it as a shared handle.
    pub fn arc(func: F) -> RoutineRef {
        std::sync::Arc::new(RoutineFn::new(func))
    }
}

#[async_trait]
impl<F, Fut> Routine for RoutineFn<F, Fut>
where
    F: FnMut(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
{
    async fn run(&self, ctx: CancellationToken) -> Result<(), Error> {
        let fut = {
            let mut func = lock_recover(&self.func);
            (func)(ctx)
        };
        fut.await
    }
}

/// # Shared handle to a state routine object.
pub type StateRoutineRef<T> = std::sync::Arc<dyn StateRoutine<T>>;

/// # Routine whose work depends on an input state.
///
/// When the state changes, the token is canceled and the routine restarted
/// with the new state.
#[async_trait]
pub trait StateRoutine<T>: Send + Sync + 'static
where
    T: Send + 'static,
{
    /// Executes the routine with the given state until completion,
    /// cancellation, or a state change.
    async fn run(&self, ctx: CancellationToken, state: T) -> Result<(), Error>;
}

/// # Function-backed state routine.
pub struct StateRoutineFn<F, Fut, T>
where
    F: FnMut(CancellationToken, T) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
    T: Send + 'static,
{
    func: Mutex<F>,
    _state: std::marker::PhantomData<fn(T)>,
}

impl<F, Fut, T> StateRoutineFn<F, Fut, T>
where
    F: FnMut(CancellationToken, T) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
    T: Send + 'static,
{
    /// Creates a new function-backed state routine.
    pub fn new(func: F) -> Self {
        StateRoutineFn {
            func: Mutex::new(func),
            _state: std::marker::PhantomData,
        }
    }

    /// Creates the state routine and returns it as a shared handle.
    pub fn arc(func: F) -> StateRoutineRef<T> {
        std::sync::Arc::new(StateRoutineFn::new(func))
    }
}

#[async_trait]
impl<F, Fut, T> StateRoutine<T> for StateRoutineFn<F, Fut, T>
where
    F: FnMut(CancellationToken, T) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
    T: Send + 'static,
{
    async fn run(&self, ctx: CancellationToken, state: T) -> Result<(), Error> {
        let fut = {
            let mut func = lock_recover(&self.func);
            (func)(ctx, state)
        };
        fut.await
    }
}
