//! # Reference-count-driven on-demand value resolution.
//!
//! A [`RefCount`] owns a single value of type `T`, produced by a
//! user-supplied resolver while at least one [`Ref`] exists and torn down
//! when the last reference is released (unless `keep_unreferenced` retains
//! a successful value). Every resolution cycle is tagged with a monotonic
//! nonce so late callbacks cannot tear down a newer cycle.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::broadcast::{lock_recover, Broadcast};
use crate::ccontainer::CContainer;
use crate::error::Error;
use crate::promise::{Promise, PromiseContainer};
use crate::BoxFuture;

/// Releases a resolved value. Returned by resolvers alongside the value.
pub type ReleaseFn = Box<dyn FnOnce() + Send>;

/// Callback handed to a resolver; invoking it signals that the resolved
/// value is no longer valid, prompting a fresh resolution.
pub type ReleasedCb = Arc<dyn Fn() + Send + Sync>;

/// Resolver signature: produces the value and an optional release function.
pub type Resolver<T> = Arc<
    dyn Fn(CancellationToken, ReleasedCb) -> BoxFuture<Result<(T, Option<ReleaseFn>), Error>>
        + Send
        + Sync,
>;

/// Internal observer: receives the resolution nonce and the new state
/// (`None` on teardown). Runs with the lock held.
type RefCb<T> = Arc<dyn Fn(u64, Option<&Result<T, Error>>) + Send + Sync>;

struct State<T> {
    ctx: Option<Arc<CancellationToken>>,
    refs: HashMapRefs<T>,
    /// Cancels the in-flight resolution, if any.
    resolve_cancel: Option<CancellationToken>,
    /// Incremented whenever resolution starts or stops.
    nonce: u64,
    /// Signaled when the previous resolve task has fully returned.
    prev_done: Option<CancellationToken>,
    resolved: Option<Result<T, Error>>,
    value_rel: Option<ReleaseFn>,
}

type HashMapRefs<T> = std::collections::HashMap<u64, Option<RefCb<T>>>;

struct Shared<T> {
    keep_unref: bool,
    target: Option<CContainer<Option<T>>>,
    target_err: Option<CContainer<Option<Error>>>,
    resolver: Resolver<T>,
    state: Mutex<State<T>>,
    next_ref: AtomicU64,
}

/// # Refcount-driven container for one on-demand value.
///
/// Cheap to clone; clones share the same container.
///
/// # Example
/// ```
/// use std::sync::Arc;
/// use coopsync::refcount::RefCount;
/// use tokio_util::sync::CancellationToken;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let rc: RefCount<String> = RefCount::new(None, false, None, None, |_ctx, _released| async {
///     Ok(("hello".to_string(), None))
/// });
///
/// let root = Arc::new(CancellationToken::new());
/// rc.set_context(Some(root.clone()));
///
/// let (val, r) = rc.wait(&root).await.unwrap();
/// assert_eq!(val, "hello");
/// r.release();
/// # }
/// ```
pub struct RefCount<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for RefCount<T> {
    fn clone(&self) -> Self {
        RefCount {
            shared: self.shared.clone(),
        }
    }
}

/// # Reference to a [`RefCount`] value.
///
/// Released explicitly via [`release`](Ref::release) (idempotent) or
/// implicitly on drop.
pub struct Ref<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    shared: Arc<Shared<T>>,
    id: u64,
    released: AtomicBool,
}

impl<T> Ref<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Releases the reference. Safe to call any number of times.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let shared = self.shared.clone();
        let mut st = lock_recover(&shared.state);
        let before = st.refs.len();
        st.refs.remove(&self.id);
        if before > 0 && st.refs.is_empty() {
            let keep = shared.keep_unref && matches!(st.resolved, Some(Ok(_)));
            if !keep {
                shutdown_locked(&shared, &mut st);
            }
        }
    }
}

impl<T> Drop for Ref<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.release();
    }
}

impl<T> RefCount<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Builds a new refcount container.
    ///
    /// `ctx`, `target`, and `target_err` may all be empty. With
    /// `keep_unref` set, a successfully resolved value survives the
    /// reference count dropping to zero. The resolver produces the value
    /// and an optional release function, and may invoke its released
    /// callback at any time after returning to signal that the value is no
    /// longer valid.
    pub fn new<F, Fut>(
        ctx: Option<Arc<CancellationToken>>,
        keep_unref: bool,
        target: Option<CContainer<Option<T>>>,
        target_err: Option<CContainer<Option<Error>>>,
        resolver: F,
    ) -> Self
    where
        F: Fn(CancellationToken, ReleasedCb) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(T, Option<ReleaseFn>), Error>> + Send + 'static,
    {
        RefCount {
            shared: Arc::new(Shared {
                keep_unref,
                target,
                target_err,
                resolver: Arc::new(move |ctx, released| Box::pin(resolver(ctx, released))),
                state: Mutex::new(State {
                    ctx,
                    refs: HashMapRefs::new(),
                    resolve_cancel: None,
                    nonce: 0,
                    prev_done: None,
                    resolved: None,
                    value_rel: None,
                }),
                next_ref: AtomicU64::new(0),
            }),
        }
    }

    /// Updates the root context, restarting resolution if refs exist.
    ///
    /// A `None` context stops resolution until one is set. Returns whether
    /// the context changed.
    pub fn set_context(&self, ctx: Option<Arc<CancellationToken>>) -> bool {
        let mut st = lock_recover(&self.shared.state);
        let same = match (&st.ctx, &ctx) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        };
        if same {
            return false;
        }
        st.ctx = ctx;
        start_resolve_locked(&self.shared, &mut st);
        true
    }

    /// Adopts `ctx` only when the current context is absent or canceled
    /// (and `ctx` itself is live). Returns whether the context was updated.
    pub fn set_context_if_canceled(&self, ctx: Arc<CancellationToken>) -> bool {
        let mut st = lock_recover(&self.shared.state);
        let current_dead = match &st.ctx {
            None => true,
            Some(cur) => cur.is_cancelled(),
        };
        if current_dead && !ctx.is_cancelled() {
            st.ctx = Some(ctx);
            start_resolve_locked(&self.shared, &mut st);
            return true;
        }
        false
    }

    /// Clears the context and tears down resolution.
    pub fn clear_context(&self) {
        self.set_context(None);
    }

    /// Adds a reference, starting resolution if this is the first.
    ///
    /// `cb` observes every resolution and teardown; if a value is already
    /// resolved it is observed immediately. The callback runs with the
    /// container lock held.
    pub fn add_ref(&self, cb: Option<Arc<dyn Fn(Option<&Result<T, Error>>) + Send + Sync>>) -> Ref<T> {
        self.add_ref_internal(cb.map(|cb| {
            let cb: RefCb<T> = Arc::new(move |_nonce, res| cb(res));
            cb
        }))
    }

    /// Adds a reference and returns a promise container observing the
    /// value.
    ///
    /// The container's promise is replaced on teardown and completed on
    /// every resolution.
    pub fn add_ref_promise(&self) -> (PromiseContainer<T>, Ref<T>) {
        let results = PromiseContainer::new();
        let observer = results.clone();
        let r = self.add_ref_internal(Some(Arc::new(move |_nonce, res| match res {
            Some(res) => observer.set_result(res.clone()),
            None => observer.set_promise(None),
        })));
        (results, r)
    }

    /// Adds a reference and waits for a value.
    ///
    /// On success returns the value and the reference (which the caller
    /// must release); on error the reference has already been released.
    pub async fn wait(&self, ctx: &CancellationToken) -> Result<(T, Ref<T>), Error> {
        let (results, r) = self.add_ref_promise();
        match results.await_result(ctx).await {
            Ok(val) => Ok((val, r)),
            Err(err) => {
                r.release();
                Err(err)
            }
        }
    }

    /// Adds a reference and returns a promise for the first resolution,
    /// arranging for `released` to be called once when that specific
    /// resolution cycle ends.
    ///
    /// The released callback always runs on a fresh task and releases the
    /// returned reference first. This matches the resolver signature, which
    /// is how one `RefCount` composes with another (see
    /// [`resolve_with_released`](RefCount::resolve_with_released)).
    pub fn wait_with_released(
        &self,
        released: impl FnOnce() + Send + 'static,
    ) -> (Promise<T>, Arc<Ref<T>>) {
        let promise = Promise::new();
        let observed: Arc<Mutex<Option<u64>>> = Arc::new(Mutex::new(None));
        let released_once = Arc::new(AtomicBool::new(false));
        let released: Arc<Mutex<Option<Box<dyn FnOnce() + Send>>>> =
            Arc::new(Mutex::new(Some(Box::new(released))));
        let ref_slot: Arc<Mutex<Option<Arc<Ref<T>>>>> = Arc::new(Mutex::new(None));

        let cb_promise = promise.clone();
        let cb_observed = observed.clone();
        let cb_released_once = released_once.clone();
        let cb_released = released.clone();
        let cb_ref_slot = ref_slot.clone();
        let r = self.add_ref_internal(Some(Arc::new(move |nonce, res| {
            let mut observed = lock_recover(&cb_observed);
            match *observed {
                Some(seen_nonce) => {
                    // Already returned a value; a teardown or a different
                    // cycle means that value is gone.
                    if res.is_none() || nonce != seen_nonce {
                        if !cb_released_once.swap(true, Ordering::AcqRel) {
                            let ref_slot = cb_ref_slot.clone();
                            let released = cb_released.clone();
                            tokio::spawn(async move {
                                if let Some(r) = lock_recover(&ref_slot).take() {
                                    r.release();
                                }
                                if let Some(released) = lock_recover(&released).take() {
                                    released();
                                }
                            });
                        }
                    }
                }
                None => {
                    if let Some(res) = res {
                        *observed = Some(nonce);
                        cb_promise.set_result(res.clone());
                    }
                }
            }
        })));

        let r = Arc::new(r);
        *lock_recover(&ref_slot) = Some(r.clone());
        (promise, r)
    }

    /// Resolver-shaped accessor: adds a reference, awaits the value, and
    /// returns it with a release function, wiring `released` to this
    /// resolution cycle.
    ///
    /// Lets one `RefCount` serve as the resolver of another, composing
    /// lifetimes.
    pub async fn resolve_with_released(
        &self,
        ctx: &CancellationToken,
        released: ReleasedCb,
    ) -> Result<(T, Option<ReleaseFn>), Error> {
        let (promise, r) = self.wait_with_released(move || released());
        match promise.await_result(ctx).await {
            Ok(val) => {
                let rel: ReleaseFn = Box::new(move || r.release());
                Ok((val, Some(rel)))
            }
            Err(err) => {
                r.release();
                Err(err)
            }
        }
    }

    /// Returns a [`Resolver`] backed by this container, for use as another
    /// [`RefCount`]'s resolver.
    pub fn as_resolver(&self) -> Resolver<T> {
        let this = self.clone();
        Arc::new(move |ctx, released| {
            let this = this.clone();
            Box::pin(async move { this.resolve_with_released(&ctx, released).await })
        })
    }

    /// Reference-scoped access to the value.
    ///
    /// Adds a reference and invokes `cb(child_ctx, value)` for every
    /// resolved value; the child context is canceled and `cb` re-invoked
    /// whenever the value changes. Returns when `cb` completes without the
    /// value having changed, or with its error. With `use_ctx` set, a
    /// canceled container context is replaced by `ctx`.
    pub async fn access<F, Fut>(
        &self,
        ctx: &CancellationToken,
        use_ctx: bool,
        cb: F,
    ) -> Result<(), Error>
    where
        F: Fn(CancellationToken, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        struct AccessState<T> {
            val: Option<Result<T, Error>>,
            nonce: u64,
            complete: bool,
        }

        let cb = Arc::new(cb);
        let access: Arc<Broadcast<AccessState<T>>> = Arc::new(Broadcast::new(AccessState {
            val: None,
            nonce: 0,
            complete: false,
        }));

        let observer = access.clone();
        let r = self.add_ref_internal(Some(Arc::new(move |_nonce, res| {
            observer.hold_lock(|g| {
                if g.val.as_ref() != res {
                    g.val = res.cloned();
                    g.broadcast();
                }
            });
        })));

        let mut prev_cancel: Option<CancellationToken> = None;
        let mut prev_done: Option<CancellationToken> = None;
        let result = loop {
            if use_ctx {
                self.set_context_if_canceled(Arc::new(ctx.clone()));
            }

            access.hold_lock(|g| g.nonce += 1);
            if let Some(cancel) = prev_cancel.take() {
                cancel.cancel();
            }
            if let Some(done) = prev_done.take() {
                tokio::select! {
                    _ = ctx.cancelled() => break Err(Error::Canceled),
                    _ = done.cancelled() => {}
                }
            }

            let (snapshot, nonce, complete, wake) = access.hold_lock(|g| {
                (g.val.clone(), g.nonce, g.complete, g.get_wait())
            });
            if let Some(Err(err)) = &snapshot {
                break Err(err.clone());
            }
            if complete {
                break Ok(());
            }

            if let Some(Ok(val)) = snapshot {
                let cb_ctx = ctx.child_token();
                prev_cancel = Some(cb_ctx.clone());
                let done = CancellationToken::new();
                prev_done = Some(done.clone());
                let access2 = access.clone();
                let cb2 = cb.clone();
                tokio::spawn(async move {
                    let _done = done.drop_guard();
                    let cb_res = cb2(cb_ctx, val).await;
                    access2.hold_lock(|g| {
                        if g.nonce != nonce {
                            return;
                        }
                        match cb_res {
                            Ok(()) => {
                                g.complete = true;
                                g.val = None;
                            }
                            Err(err) => {
                                if !matches!(g.val, Some(Err(_))) {
                                    g.val = Some(Err(err));
                                }
                            }
                        }
                        g.broadcast();
                    });
                });
            }

            tokio::select! {
                _ = ctx.cancelled() => break Err(Error::Canceled),
                _ = wake.wait() => {}
            }
        };
        if let Some(cancel) = prev_cancel.take() {
            cancel.cancel();
        }
        r.release();
        result
    }

    fn add_ref_internal(&self, cb: Option<RefCb<T>>) -> Ref<T> {
        let shared = &self.shared;
        let id = shared.next_ref.fetch_add(1, Ordering::Relaxed);
        let mut st = lock_recover(&shared.state);
        st.refs.insert(id, cb.clone());
        if st.refs.len() == 1 && st.resolved.is_none() {
            start_resolve_locked(shared, &mut st);
        } else if let Some(res) = &st.resolved {
            if let Some(cb) = &cb {
                cb(st.nonce, Some(res));
            }
        }
        drop(st);
        Ref {
            shared: shared.clone(),
            id,
            released: AtomicBool::new(false),
        }
    }
}

/// Waits for a refcount mirror-container pair, surfacing mirrored errors.
///
/// Spawns a watcher that forwards errors from `target_err` into the wait on
/// `target`, so callers observe resolution failures instead of blocking.
pub async fn wait_refcount_container<T>(
    ctx: &CancellationToken,
    target: &CContainer<Option<T>>,
    target_err: Option<&CContainer<Option<Error>>>,
) -> Result<T, Error>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    let mut err_rx_storage;
    let mut err_rx = None;
    let mut watcher = None;
    if let Some(target_err) = target_err {
        let (tx, rx) = mpsc::channel::<Error>(1);
        err_rx_storage = rx;
        err_rx = Some(&mut err_rx_storage);
        let target_err = target_err.clone();
        let watch_ctx = ctx.clone();
        watcher = Some(tokio::spawn(async move {
            if let Ok(Some(err)) = target_err.wait_value(&watch_ctx, None).await {
                let _ = tx.try_send(err);
            }
        }));
    }

    let res = target.wait_value(ctx, err_rx).await;
    if let Some(watcher) = watcher {
        watcher.abort();
    }
    match res? {
        Some(val) => Ok(val),
        None => Err(Error::Canceled),
    }
}

/// Tears down the current resolution and bumps the nonce. Caller holds the
/// lock.
fn shutdown_locked<T>(shared: &Arc<Shared<T>>, st: &mut State<T>)
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    st.nonce += 1;
    clear_resolved_locked(shared, st);
}

/// Clears the resolved state, mirrors the teardown, and releases the value.
/// Caller holds the lock.
fn clear_resolved_locked<T>(shared: &Arc<Shared<T>>, st: &mut State<T>)
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    if let Some(res) = st.resolved.take() {
        match res {
            Ok(_) => {
                if let Some(target) = &shared.target {
                    target.set_value(None);
                }
                if let Some(target_err) = &shared.target_err {
                    target_err.set_value(None);
                }
            }
            Err(_) => {
                if let Some(target_err) = &shared.target_err {
                    target_err.set_value(None);
                }
            }
        }
        call_ref_cbs_locked(st, None);
    }
    if let Some(cancel) = st.resolve_cancel.take() {
        cancel.cancel();
    }
    if let Some(rel) = st.value_rel.take() {
        rel();
    }
}

/// Starts the resolve task if a context and at least one ref exist. Caller
/// holds the lock.
fn start_resolve_locked<T>(shared: &Arc<Shared<T>>, st: &mut State<T>)
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    shutdown_locked(shared, st);
    let Some(root) = st.ctx.clone() else {
        return;
    };
    if st.refs.is_empty() {
        return;
    }

    let done = CancellationToken::new();
    let prev_done = st.prev_done.replace(done.clone());
    let resolve_ctx = root.child_token();
    st.resolve_cancel = Some(resolve_ctx.clone());
    let nonce = st.nonce;
    let shared = shared.clone();
    tokio::spawn(async move {
        let _done = done.drop_guard();

        // Serialize against the previous resolve task.
        if let Some(prev) = prev_done {
            tokio::select! {
                _ = resolve_ctx.cancelled() => return,
                _ = prev.cancelled() => {}
            }
        }

        let released = make_released_cb(shared.clone(), nonce);
        let res = (shared.resolver)(resolve_ctx.clone(), released).await;

        let mut st = lock_recover(&shared.state);
        if st.nonce != nonce {
            // A newer cycle owns the container; discard our value.
            if let Ok((_, Some(rel))) = res {
                rel();
            }
            return;
        }

        match res {
            Ok((val, rel)) => {
                let res = Ok(val.clone());
                st.resolved = Some(res.clone());
                st.value_rel = rel;
                if let Some(target_err) = &shared.target_err {
                    target_err.set_value(None);
                }
                if let Some(target) = &shared.target {
                    target.set_value(Some(val));
                }
                call_ref_cbs_locked(&st, Some(&res));
            }
            Err(err) => {
                let res = Err(err.clone());
                st.resolved = Some(res.clone());
                st.value_rel = None;
                if let Some(target_err) = &shared.target_err {
                    target_err.set_value(Some(err));
                }
                call_ref_cbs_locked(&st, Some(&res));
            }
        }
    });
}

/// Builds the released callback for one resolution cycle.
///
/// The callback may run while the container lock is held elsewhere, so a
/// contended teardown moves to a fresh task instead of blocking.
fn make_released_cb<T>(shared: Arc<Shared<T>>, nonce: u64) -> ReleasedCb
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    Arc::new(move || {
        let restart = |mut st: MutexGuard<'_, State<T>>, shared: &Arc<Shared<T>>| {
            if st.nonce == nonce {
                start_resolve_locked(shared, &mut st);
            }
        };
        match shared.state.try_lock() {
            Ok(st) => restart(st, &shared),
            Err(TryLockError::Poisoned(poisoned)) => restart(poisoned.into_inner(), &shared),
            Err(TryLockError::WouldBlock) => {
                let shared = shared.clone();
                tokio::spawn(async move {
                    let st = lock_recover(&shared.state);
                    if st.nonce == nonce {
                        let mut st = st;
                        start_resolve_locked(&shared, &mut st);
                    }
                });
            }
        }
    })
}

/// Invokes every reference callback with the new state. Caller holds the
/// lock.
fn call_ref_cbs_locked<T>(st: &State<T>, res: Option<&Result<T, Error>>) {
    for cb in st.refs.values().flatten() {
        cb(st.nonce, res);
    }
}
