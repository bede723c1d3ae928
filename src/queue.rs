//! # Bounded-parallelism FIFO job queue.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::broadcast::Broadcast;
use crate::error::{recv_aux_err, Error};
use crate::BoxFuture;

/// A queued unit of work.
pub type Job = BoxFuture<()>;

struct QueueState {
    /// Concurrency limit; 0 means unbounded.
    max_concurrency: usize,
    running: usize,
    jobs: VecDeque<Job>,
}

impl QueueState {
    fn has_capacity(&self) -> bool {
        self.max_concurrency == 0 || self.running < self.max_concurrency
    }
}

/// # Pool of worker tasks processing a FIFO stream of jobs.
///
/// Jobs are *started* in enqueue order; completion order is unconstrained.
/// At most `max_concurrency` jobs execute at once (0 = unbounded).
///
/// Cheap to clone; clones share the same queue.
///
/// # Example
/// ```
/// use coopsync::ConcurrentQueue;
/// use tokio_util::sync::CancellationToken;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let q = ConcurrentQueue::new(2, Vec::new());
/// q.enqueue([
///     ConcurrentQueue::job(async { println!("one") }),
///     ConcurrentQueue::job(async { println!("two") }),
/// ]);
/// q.wait_idle(&CancellationToken::new(), None).await.unwrap();
/// # }
/// ```
#[derive(Clone)]
pub struct ConcurrentQueue {
    shared: Arc<Broadcast<QueueState>>,
}

impl ConcurrentQueue {
    /// Builds a queue with the given concurrency limit and initial jobs.
    pub fn new(max_concurrency: usize, initial: Vec<Job>) -> Self {
        let q = ConcurrentQueue {
            shared: Arc::new(Broadcast::new(QueueState {
                max_concurrency,
                running: 0,
                jobs: VecDeque::new(),
            })),
        };
        if !initial.is_empty() {
            q.enqueue(initial);
        }
        q
    }

    /// Adds a future to the queue as a job.
    pub fn job<F>(fut: F) -> Job
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Box::pin(fut)
    }

    /// Enqueues jobs, starting each immediately if a worker slot is free.
    ///
    /// Returns the number of queued and running jobs afterwards.
    pub fn enqueue(&self, jobs: impl IntoIterator<Item = Job>) -> (usize, usize) {
        self.shared.hold_lock(|g| {
            let mut any = false;
            for job in jobs {
                any = true;
                if g.has_capacity() {
                    g.running += 1;
                    spawn_worker(self.shared.clone(), job);
                } else {
                    g.jobs.push_back(job);
                }
            }
            if any {
                g.broadcast();
            }
            (g.jobs.len(), g.running)
        })
    }

    /// Waits until no jobs are queued or running.
    ///
    /// `err_rx` is an optional auxiliary error channel; a closed channel
    /// reads as cancellation.
    pub async fn wait_idle(
        &self,
        ctx: &CancellationToken,
        mut err_rx: Option<&mut mpsc::Receiver<Error>>,
    ) -> Result<(), Error> {
        loop {
            let (idle, wake) = self
                .shared
                .hold_lock(|g| (g.running == 0 && g.jobs.is_empty(), g.get_wait()));
            if idle {
                return Ok(());
            }
            tokio::select! {
                _ = ctx.cancelled() => return Err(Error::Canceled),
                err = recv_aux_err(&mut err_rx) => return Err(err),
                _ = wake.wait() => {}
            }
        }
    }

    /// Observes the queue state, calling `cb(queued, running)` after every
    /// change.
    ///
    /// Returns when `cb` reports `Ok(false)` or an error.
    pub async fn watch_state(
        &self,
        ctx: &CancellationToken,
        mut err_rx: Option<&mut mpsc::Receiver<Error>>,
        mut cb: impl FnMut(usize, usize) -> Result<bool, Error>,
    ) -> Result<(), Error> {
        loop {
            let (queued, running, wake) = self
                .shared
                .hold_lock(|g| (g.jobs.len(), g.running, g.get_wait()));
            if !cb(queued, running)? {
                return Ok(());
            }
            tokio::select! {
                _ = ctx.cancelled() => return Err(Error::Canceled),
                err = recv_aux_err(&mut err_rx) => return Err(err),
                _ = wake.wait() => {}
            }
        }
    }
}

/// Worker task: runs its job, then keeps draining the queue until empty.
fn spawn_worker(shared: Arc<Broadcast<QueueState>>, job: Job) {
    tokio::spawn(async move {
        let mut job = Some(job);
        while let Some(current) = job.take() {
            current.await;
            job = shared.hold_lock(|g| match g.jobs.pop_front() {
                Some(next) => Some(next),
                None => {
                    g.running -= 1;
                    g.broadcast();
                    None
                }
            });
        }
    });
}
