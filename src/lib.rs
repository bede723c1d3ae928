//! # coopsync
//!
//! **Coopsync** is a toolbox of cooperative concurrency primitives built
//! around a single notification mechanism, the [`Broadcast`]: a re-armable,
//! multi-consumer wakeup channel guarding a critical section.
//!
//! The crate manages the lifecycle of long-running asynchronous tasks whose
//! existence, identity, and inputs all change dynamically while other tasks
//! observe them.
//!
//! ## Features
//!
//! | Area            | Description                                                      | Key types / traits                        |
//! |-----------------|------------------------------------------------------------------|-------------------------------------------|
//! | **Wakeups**     | Single-shot re-armable broadcast guarding state.                 | [`Broadcast`], [`WaitToken`]              |
//! | **Watching**    | Mutable cell whose changes waiters can observe.                  | [`CContainer`], [`Watchable`]             |
//! | **Promises**    | Write-once results and replaceable result slots.                 | [`Promise`], [`PromiseContainer`], [`Once`] |
//! | **Locks**       | Mutexes whose acquisition accepts a cancellation token.          | [`csync::Mutex`], [`csync::RwMutex`]      |
//! | **Routines**    | Start/stop/restart/retry one long-running task.                  | [`routine::RoutineContainer`]             |
//! | **Supervision** | Manage a keyed set of routines, with refcounted handles.         | [`Keyed`], [`KeyedRefCount`]              |
//! | **Resolution**  | On-demand value whose lifetime follows its reference count.      | [`refcount::RefCount`]                    |
//! | **Pools**       | Bounded-parallelism FIFO job execution.                          | [`ConcurrentQueue`], [`call_concurrently`] |
//! | **Retry**       | Pluggable backoff policies driving automatic restarts.           | [`backoff::BackOff`], [`backoff::BackoffConfig`] |
//!
//! ## Optional features
//! - `logging`: exposes `tracing`-based exit-log callbacks on the routine
//!   containers and supervisors _(demo/reference only)_.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use coopsync::{Keyed, routine::RoutineFn};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     // One routine per key; the constructor builds the routine and its
//!     // side-data when a key is first inserted.
//!     let keyed: Keyed<String, ()> = Keyed::new(|key: &String| {
//!         let key = key.clone();
//!         (
//!             RoutineFn::arc(move |ctx: CancellationToken| {
//!                 let key = key.clone();
//!                 async move {
//!                     println!("worker {key} running");
//!                     ctx.cancelled().await;
//!                     Ok(())
//!                 }
//!             }),
//!             (),
//!         )
//!     });
//!
//!     // Routines start once a root context is set.
//!     let root = Arc::new(CancellationToken::new());
//!     keyed.set_context(Some(root.clone()), false);
//!     keyed.sync_keys(["a".to_string(), "b".to_string()], false);
//!     root.cancel();
//! }
//! ```
//!
//! ---

use std::future::Future;
use std::pin::Pin;

pub mod backoff;
mod broadcast;
mod ccall;
mod ccontainer;
pub mod csync;
mod error;
mod keyed;
mod lifo;
mod promise;
mod queue;
pub mod refcount;
pub mod routine;

// ---- Public re-exports ----

pub use broadcast::{Broadcast, BroadcastGuard, WaitToken};
pub use ccall::{call_concurrently, concurrent_call, ConcurrentCall};
pub use ccontainer::{CContainer, EqualFn, Watchable};
pub use error::{ConfigError, Error};
pub use keyed::{
    BackoffFactory, KeyWithData, Keyed, KeyedBuilder, KeyedCond, KeyedCtor, KeyedExitCb, KeyedRef,
    KeyedRefCount, KeyedRefCountBuilder,
};
pub use lifo::AtomicLifo;
pub use promise::{Once, Promise, PromiseContainer, PromiseLike};
pub use queue::{ConcurrentQueue, Job};

/// Boxed future used by the crate's callback-shaped APIs.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;
