//! # Cooperative locks whose acquisition accepts a cancellation token.
//!
//! Ordinary async mutexes cannot abandon an acquisition cleanly. These
//! variants park on a [`Broadcast`](crate::Broadcast) wakeup and honor a
//! [`CancellationToken`](tokio_util::sync::CancellationToken), and every
//! release handle is idempotent.

mod mutex;
mod rwmutex;

pub use mutex::{Mutex, MutexPermit};
pub use rwmutex::{RwMutex, RwMutexPermit};
