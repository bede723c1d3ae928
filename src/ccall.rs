//! # Running a set of operations concurrently, canceling siblings on error.

use std::future::Future;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::BoxFuture;

/// One operation passed to [`call_concurrently`]. Receives the shared child
/// token.
pub type ConcurrentCall = Box<dyn FnOnce(CancellationToken) -> BoxFuture<Result<(), Error>> + Send>;

/// Wraps an async closure as a [`ConcurrentCall`].
pub fn concurrent_call<F, Fut>(f: F) -> ConcurrentCall
where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
{
    Box::new(move |ctx| Box::pin(f(ctx)))
}

/// Runs the calls on background tasks sharing one child token.
///
/// The first non-canceled error wins: it cancels the child token (and so
/// every sibling), all calls are drained, and the winning error is
/// returned. Cancellation of `ctx` cancels all calls and returns
/// [`Error::Canceled`].
pub async fn call_concurrently(
    ctx: &CancellationToken,
    calls: Vec<ConcurrentCall>,
) -> Result<(), Error> {
    if calls.is_empty() {
        return Ok(());
    }

    let child = ctx.child_token();
    if calls.len() == 1 {
        let mut calls = calls;
        let call = calls.remove(0);
        let res = call(child.clone()).await;
        child.cancel();
        return res;
    }

    let mut set = JoinSet::new();
    for call in calls {
        set.spawn(call(child.clone()));
    }

    let mut exit_err: Option<Error> = None;
    loop {
        tokio::select! {
            _ = ctx.cancelled() => {
                child.cancel();
                while set.join_next().await.is_some() {}
                return Err(Error::Canceled);
            }
            joined = set.join_next() => {
                let Some(joined) = joined else { break };
                let err = match joined {
                    Ok(Ok(())) => continue,
                    Ok(Err(err)) => err,
                    Err(join_err) => Error::msg(format!("concurrent call panicked: {join_err}")),
                };
                let overwrite = match &exit_err {
                    None => true,
                    Some(prev) => prev.is_canceled(),
                };
                if overwrite {
                    if !err.is_canceled() {
                        child.cancel();
                    }
                    exit_err = Some(err);
                }
            }
        }
    }
    child.cancel();

    match exit_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
