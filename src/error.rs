//! # Error types shared by every primitive in the crate.
//!
//! Two kinds of failure surface at runtime:
//!
//! - [`Error::Canceled`] — the unified cancellation signal. Raised whenever a
//!   waiting operation's token is canceled, an auxiliary error channel closes
//!   without delivering a value, or a dependent resolution is torn down.
//! - [`Error::Other`] — anything returned by user routines, resolvers, or
//!   callbacks. Propagated verbatim to exit callbacks and awaiting callers.
//!
//! Configuration problems (an unset backoff, an out-of-range randomization
//! factor) are reported at construction time as [`ConfigError`] and never
//! enter the runtime error flow.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

/// # Runtime error reported by waiting operations and routines.
///
/// Cheap to clone: results are stored on running routines, mirrored into
/// containers, and fanned out to every observer, so the same error value may
/// be seen many times.
///
/// Equality: `Canceled` values are all equal; `Other` values compare by
/// identity (two clones of the same error are equal, two separately
/// constructed errors are not).
#[non_exhaustive]
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The operation was canceled.
    ///
    /// This is **not an error** in the traditional sense: it signals that a
    /// cancellation token fired or an error channel closed. Awaiting callers
    /// can safely retry once a new context is available.
    #[error("operation canceled")]
    Canceled,

    /// Failure produced by user code (a routine, resolver, or callback).
    #[error("{0}")]
    Other(Arc<anyhow::Error>),
}

impl Error {
    /// Wraps an arbitrary error value.
    pub fn other<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Other(Arc::new(anyhow::Error::new(err)))
    }

    /// Builds an error from a display-able message.
    pub fn msg<M>(msg: M) -> Self
    where
        M: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
    {
        Error::Other(Arc::new(anyhow::Error::msg(msg)))
    }

    /// Returns true if this is the unified cancellation signal.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Error::Canceled)
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Error::Canceled, Error::Canceled) => true,
            (Error::Other(a), Error::Other(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Eq for Error {}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Other(Arc::new(err))
    }
}

/// # Errors produced when validating configuration.
///
/// These are fatal to the caller and are reported at construction time.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A backoff configuration was required but left unset.
    #[error("backoff must be set")]
    BackoffRequired,

    /// The randomization factor must lie within `[0, 1]`.
    #[error("randomization factor {factor} out of range [0, 1]")]
    RandomizationFactor {
        /// The offending factor.
        factor: f64,
    },
}

/// Reads from an optional auxiliary error channel.
///
/// Pends forever when no channel was supplied. A channel closed without a
/// value reads as [`Error::Canceled`].
pub(crate) async fn recv_aux_err(rx: &mut Option<&mut mpsc::Receiver<Error>>) -> Error {
    match rx.as_deref_mut() {
        Some(rx) => match rx.recv().await {
            Some(err) => err,
            None => Error::Canceled,
        },
        None => std::future::pending().await,
    }
}
