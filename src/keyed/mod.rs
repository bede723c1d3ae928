//! # Supervisor for a set of routines keyed by an identifier.
//!
//! [`Keyed`] maps each key `K` to exactly one running routine plus opaque
//! side-data `V`, both built by a user-supplied constructor when a key is
//! inserted. The supervisor starts, stops, restarts, retries (with per-key
//! backoff), and reconciles routines against a desired key set;
//! [`KeyedRefCount`] adds reference counting so a routine lives while at
//! least one handle to its key exists.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::backoff::{BackOff, BackoffConfig};
use crate::broadcast::lock_recover;
use crate::error::Error;
use crate::routine::RoutineRef;

mod refcount;
mod running;

pub use refcount::{KeyedRef, KeyedRefCount, KeyedRefCountBuilder};

use running::{remove_entry_locked, start_locked, DetachedRun, Entry};

/// Constructor invoked for newly inserted keys: builds the routine and its
/// side-data.
pub type KeyedCtor<K, V> = Arc<dyn Fn(&K) -> (RoutineRef, V) + Send + Sync>;

/// Callback invoked after a keyed routine exits; receives the key, the
/// routine, its data, and the exit error (if any).
pub type KeyedExitCb<K, V> = Arc<dyn Fn(&K, &RoutineRef, &V, Option<&Error>) + Send + Sync>;

/// Per-key backoff factory; returning `None` disables retry for that key.
pub type BackoffFactory<K> = Arc<dyn Fn(&K) -> Option<Box<dyn BackOff + Send>> + Send + Sync>;

/// Condition predicate on `(key, data)` used by the reset/restart family.
pub type KeyedCond<K, V> = dyn Fn(&K, &V) -> bool;

/// A key together with its side-data, as returned by snapshot queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyWithData<K, V> {
    /// The key.
    pub key: K,
    /// The side-data built by the constructor.
    pub data: V,
}

pub(crate) struct KeyedInner<K, V> {
    ctx: Option<Arc<CancellationToken>>,
    routines: HashMap<K, Entry<V>>,
    /// Runs whose entry was removed or replaced while still executing;
    /// their exits still fire the exit callbacks.
    detached: HashMap<u64, DetachedRun<K, V>>,
}

pub(crate) struct KeyedShared<K, V> {
    ctor: KeyedCtor<K, V>,
    exit_cbs: Vec<KeyedExitCb<K, V>>,
    release_delay: Duration,
    backoff_factory: Option<BackoffFactory<K>>,
    inner: Mutex<KeyedInner<K, V>>,
    gen: AtomicU64,
}

impl<K, V> KeyedShared<K, V> {
    fn lock_inner(&self) -> std::sync::MutexGuard<'_, KeyedInner<K, V>> {
        lock_recover(&self.inner)
    }
}

/// # Builder for [`Keyed`].
pub struct KeyedBuilder<K, V> {
    ctor: KeyedCtor<K, V>,
    exit_cbs: Vec<KeyedExitCb<K, V>>,
    release_delay: Duration,
    backoff_factory: Option<BackoffFactory<K>>,
}

impl<K, V> KeyedBuilder<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Delays canceling a routine after its key is removed.
    ///
    /// Re-adding the key within the delay keeps the existing routine
    /// running unchanged, suppressing flapping.
    pub fn release_delay(mut self, delay: Duration) -> Self {
        self.release_delay = delay;
        self
    }

    /// Retries failed routines, each key driving an independent backoff
    /// built from the config.
    pub fn retry(mut self, cfg: BackoffConfig) -> Self {
        self.backoff_factory = Some(Arc::new(move |_key: &K| Some(cfg.construct())));
        self
    }

    /// Supplies a per-key backoff; returning `None` disables retry for that
    /// key.
    pub fn backoff_factory(
        mut self,
        factory: impl Fn(&K) -> Option<Box<dyn BackOff + Send>> + Send + Sync + 'static,
    ) -> Self {
        self.backoff_factory = Some(Arc::new(factory));
        self
    }

    /// Adds a callback invoked after any keyed routine exits.
    ///
    /// Callbacks run with the lock released, in reverse registration order.
    pub fn exit_cb(mut self, cb: KeyedExitCb<K, V>) -> Self {
        self.exit_cbs.push(cb);
        self
    }

    /// Adds an exit callback that logs exits via `tracing`.
    #[cfg(feature = "logging")]
    pub fn exit_log(self) -> Self
    where
        K: std::fmt::Debug,
    {
        self.exit_cb(Arc::new(
            |key: &K, _routine: &RoutineRef, _data: &V, err: Option<&Error>| match err {
                Some(err) if !err.is_canceled() => {
                    tracing::warn!(key = ?key, %err, "keyed routine exited")
                }
                _ => tracing::debug!(key = ?key, "keyed routine exited"),
            },
        ))
    }

    /// As [`exit_log`](Self::exit_log), tagging each record with a name.
    #[cfg(feature = "logging")]
    pub fn exit_log_named(self, name: impl Into<String>) -> Self
    where
        K: std::fmt::Debug,
    {
        let name = name.into();
        self.exit_cb(Arc::new(
            move |key: &K, _routine: &RoutineRef, _data: &V, err: Option<&Error>| match err {
                Some(err) if !err.is_canceled() => {
                    tracing::warn!(%name, key = ?key, %err, "keyed routine exited")
                }
                _ => tracing::debug!(%name, key = ?key, "keyed routine exited"),
            },
        ))
    }

    /// Finishes the builder.
    ///
    /// Note: routines won't start until [`set_context`](Keyed::set_context)
    /// is called.
    pub fn build(self) -> Keyed<K, V> {
        Keyed {
            shared: Arc::new(KeyedShared {
                ctor: self.ctor,
                exit_cbs: self.exit_cbs,
                release_delay: self.release_delay,
                backoff_factory: self.backoff_factory,
                inner: Mutex::new(KeyedInner {
                    ctx: None,
                    routines: HashMap::new(),
                    detached: HashMap::new(),
                }),
                gen: AtomicU64::new(0),
            }),
        }
    }
}

/// # Supervisor managing one routine per key.
///
/// Per-key operations are linearizable under the supervisor's lock; there
/// is no ordering between keys. Cheap to clone; clones share the same
/// supervisor.
pub struct Keyed<K, V> {
    shared: Arc<KeyedShared<K, V>>,
}

impl<K, V> Clone for Keyed<K, V> {
    fn clone(&self) -> Self {
        Keyed {
            shared: self.shared.clone(),
        }
    }
}

impl<K, V> Keyed<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Builds a supervisor with no options.
    ///
    /// Note: routines won't start until [`set_context`](Keyed::set_context)
    /// is called.
    pub fn new(ctor: impl Fn(&K) -> (RoutineRef, V) + Send + Sync + 'static) -> Self {
        Keyed::builder(ctor).build()
    }

    /// Returns a builder for configuring delays, retry, and exit callbacks.
    pub fn builder(
        ctor: impl Fn(&K) -> (RoutineRef, V) + Send + Sync + 'static,
    ) -> KeyedBuilder<K, V> {
        KeyedBuilder {
            ctor: Arc::new(ctor),
            exit_cbs: Vec::new(),
            release_delay: Duration::ZERO,
            backoff_factory: None,
        }
    }

    /// Establishes, updates, or clears the root context for every key.
    ///
    /// Passing the same context again with `restart == false` is a no-op.
    /// A `None` context stops all routines. With `restart == true` errored
    /// routines are started again.
    pub fn set_context(&self, ctx: Option<Arc<CancellationToken>>, restart: bool) {
        let shared = &self.shared;
        let mut inner = shared.lock_inner();
        let same = match (&inner.ctx, &ctx) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        };
        if same && !restart {
            return;
        }
        inner.ctx = ctx;

        let keys: Vec<K> = inner.routines.keys().cloned().collect();
        for key in keys {
            let (wait, should_start) = {
                let Some(entry) = inner.routines.get_mut(&key) else {
                    continue;
                };
                if same && entry.err.is_none() {
                    continue;
                }
                if let Some(cancel) = entry.cancel.take() {
                    cancel.cancel();
                }
                // Invalidate in place: the canceled run exits silently.
                entry.start_gen = running::next_gen(shared);
                (entry.exited_tok.clone(), entry.err.is_none() || restart)
            };
            if should_start {
                if let Some(root) = inner.ctx.clone() {
                    start_locked(shared, &mut inner, &key, &root, wait, false);
                }
            }
        }
    }

    /// Clears the root context, stopping all routines.
    pub fn clear_context(&self) {
        self.set_context(None, false);
    }

    /// Inserts `key` if absent, canceling any pending deferred-remove or
    /// deferred-retry timer if present.
    ///
    /// If newly inserted or `start` is set, starts the routine from any
    /// stopped or failed state (requires a root context). Returns the
    /// side-data and whether the key already existed.
    pub fn set_key(&self, key: K, start: bool) -> (V, bool) {
        let shared = &self.shared;
        let mut inner = shared.lock_inner();

        let (data, existed) = match inner.routines.get_mut(&key) {
            Some(entry) => {
                if let Some(timer) = entry.defer_remove.take() {
                    timer.cancel();
                }
                if let Some(timer) = entry.defer_retry.take() {
                    timer.cancel();
                }
                (entry.data.clone(), true)
            }
            None => {
                let (routine, data) = (shared.ctor)(&key);
                let retry_bo = shared.backoff_factory.as_ref().and_then(|f| f(&key));
                inner
                    .routines
                    .insert(key.clone(), Entry::new(routine, data.clone(), retry_bo));
                (data, false)
            }
        };

        if !existed || start {
            if let Some(root) = inner.ctx.clone() {
                let wait = inner
                    .routines
                    .get(&key)
                    .and_then(|entry| entry.exited_tok.clone());
                start_locked(shared, &mut inner, &key, &root, wait, false);
            }
        }
        (data, existed)
    }

    /// Removes `key`, returning whether it existed.
    ///
    /// With a configured release delay, a running routine keeps running
    /// until the delay elapses; re-adding the key within the delay cancels
    /// the removal.
    pub fn remove_key(&self, key: &K) -> bool {
        let shared = &self.shared;
        let mut inner = shared.lock_inner();
        remove_entry_locked(shared, &mut inner, key)
    }

    /// Reconciles the live key set to exactly `keys`.
    ///
    /// Missing keys are inserted (and started if a context is set), extra
    /// keys are removed. With `restart` set, failed routines of surviving
    /// keys are restarted. Returns the keys added and removed.
    pub fn sync_keys(&self, keys: impl IntoIterator<Item = K>, restart: bool) -> (Vec<K>, Vec<K>) {
        let shared = &self.shared;
        let mut inner = shared.lock_inner();
        prune_ctx(&mut inner);

        let mut desired: HashSet<K> = HashSet::new();
        let mut added = Vec::new();
        for key in keys {
            if !desired.insert(key.clone()) {
                continue;
            }
            let existed = inner.routines.contains_key(&key);
            if !existed {
                let (routine, data) = (shared.ctor)(&key);
                let retry_bo = shared.backoff_factory.as_ref().and_then(|f| f(&key));
                inner
                    .routines
                    .insert(key.clone(), Entry::new(routine, data, retry_bo));
                added.push(key.clone());
            } else if let Some(entry) = inner.routines.get_mut(&key) {
                if let Some(timer) = entry.defer_remove.take() {
                    timer.cancel();
                }
            }
            if !existed || restart {
                if let Some(root) = inner.ctx.clone() {
                    let wait = inner
                        .routines
                        .get(&key)
                        .and_then(|entry| entry.exited_tok.clone());
                    start_locked(shared, &mut inner, &key, &root, wait, false);
                }
            }
        }

        let removed: Vec<K> = inner
            .routines
            .keys()
            .filter(|key| !desired.contains(*key))
            .cloned()
            .collect();
        for key in &removed {
            remove_entry_locked(shared, &mut inner, key);
        }
        (added, removed)
    }

    /// Returns the side-data for `key`, if registered.
    pub fn get_key(&self, key: &K) -> Option<V> {
        let inner = self.shared.lock_inner();
        inner.routines.get(key).map(|entry| entry.data.clone())
    }

    /// Returns the registered keys.
    pub fn get_keys(&self) -> Vec<K> {
        let inner = self.shared.lock_inner();
        inner.routines.keys().cloned().collect()
    }

    /// Returns the registered keys together with their side-data.
    pub fn get_keys_with_data(&self) -> Vec<KeyWithData<K, V>> {
        let inner = self.shared.lock_inner();
        inner
            .routines
            .iter()
            .map(|(key, entry)| KeyWithData {
                key: key.clone(),
                data: entry.data.clone(),
            })
            .collect()
    }

    /// Reconstructs the routine for `key` via the constructor (new
    /// side-data) and restarts it, if any condition matches `(key, data)`.
    ///
    /// Empty `conds` always matches. Overwrites the existing data; in most
    /// cases [`restart_routine`](Keyed::restart_routine) is what you want.
    /// Returns whether the key existed and whether it was reset.
    pub fn reset_routine(&self, key: &K, conds: &[&KeyedCond<K, V>]) -> (bool, bool) {
        let shared = &self.shared;
        let mut inner = shared.lock_inner();
        prune_ctx(&mut inner);
        if !inner.routines.contains_key(key) {
            return (false, false);
        }
        (true, reset_key_locked(shared, &mut inner, key, conds))
    }

    /// Cancels and restarts the routine for `key` (keeping its side-data),
    /// if any condition matches `(key, data)`.
    ///
    /// Empty `conds` always matches. Returns whether the key existed and
    /// whether it was restarted; requires a root context.
    pub fn restart_routine(&self, key: &K, conds: &[&KeyedCond<K, V>]) -> (bool, bool) {
        let shared = &self.shared;
        let mut inner = shared.lock_inner();
        prune_ctx(&mut inner);
        if !inner.routines.contains_key(key) {
            return (false, false);
        }
        if inner.ctx.is_none() {
            return (true, false);
        }
        (true, restart_key_locked(shared, &mut inner, key, conds))
    }

    /// Applies [`reset_routine`](Keyed::reset_routine) to every key.
    ///
    /// Returns how many keys were reset and the total key count.
    pub fn reset_all_routines(&self, conds: &[&KeyedCond<K, V>]) -> (usize, usize) {
        let shared = &self.shared;
        let mut inner = shared.lock_inner();
        prune_ctx(&mut inner);
        let keys: Vec<K> = inner.routines.keys().cloned().collect();
        let total = keys.len();
        let mut reset = 0;
        for key in &keys {
            if reset_key_locked(shared, &mut inner, key, conds) {
                reset += 1;
            }
        }
        (reset, total)
    }

    /// Applies [`restart_routine`](Keyed::restart_routine) to every key.
    ///
    /// Returns how many routines were restarted and the total key count.
    pub fn restart_all_routines(&self, conds: &[&KeyedCond<K, V>]) -> (usize, usize) {
        let shared = &self.shared;
        let mut inner = shared.lock_inner();
        prune_ctx(&mut inner);
        let keys: Vec<K> = inner.routines.keys().cloned().collect();
        let total = keys.len();
        if inner.ctx.is_none() {
            return (0, total);
        }
        let mut restarted = 0;
        for key in &keys {
            if restart_key_locked(shared, &mut inner, key, conds) {
                restarted += 1;
            }
        }
        (restarted, total)
    }
}

fn prune_ctx<K, V>(inner: &mut KeyedInner<K, V>) {
    if inner.ctx.as_ref().is_some_and(|c| c.is_cancelled()) {
        inner.ctx = None;
    }
}

fn conds_match<K, V>(conds: &[&KeyedCond<K, V>], key: &K, data: &V) -> bool {
    conds.is_empty() || conds.iter().any(|cond| cond(key, data))
}

/// Reconstructs and restarts one key. Caller holds the lock and has checked
/// existence.
fn reset_key_locked<K, V>(
    shared: &Arc<KeyedShared<K, V>>,
    inner: &mut KeyedInner<K, V>,
    key: &K,
    conds: &[&KeyedCond<K, V>],
) -> bool
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    let matched = match inner.routines.get(key) {
        Some(entry) => conds_match(conds, key, &entry.data),
        None => return false,
    };
    if !matched {
        return false;
    }

    let Some(mut old) = inner.routines.remove(key) else {
        return false;
    };
    let prev_exited = old.exited_tok.clone();
    if let Some(cancel) = old.cancel.take() {
        cancel.cancel();
        if !old.exited {
            inner.detached.insert(
                old.start_gen,
                DetachedRun {
                    key: key.clone(),
                    routine: old.routine.clone(),
                    data: old.data.clone(),
                },
            );
        }
    }
    if let Some(timer) = old.defer_retry.take() {
        timer.cancel();
    }
    if let Some(timer) = old.defer_remove.take() {
        timer.cancel();
    }

    let (routine, data) = (shared.ctor)(key);
    let retry_bo = shared.backoff_factory.as_ref().and_then(|f| f(key));
    inner
        .routines
        .insert(key.clone(), Entry::new(routine, data, retry_bo));
    if let Some(root) = inner.ctx.clone() {
        start_locked(shared, inner, key, &root, prev_exited, false);
    }
    true
}

/// Cancels and restarts one key in place. Caller holds the lock and has
/// checked existence and context.
fn restart_key_locked<K, V>(
    shared: &Arc<KeyedShared<K, V>>,
    inner: &mut KeyedInner<K, V>,
    key: &K,
    conds: &[&KeyedCond<K, V>],
) -> bool
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    let wait = {
        let Some(entry) = inner.routines.get_mut(key) else {
            return false;
        };
        if !conds_match(conds, key, &entry.data) {
            return false;
        }
        if let Some(cancel) = entry.cancel.take() {
            cancel.cancel();
        }
        entry.start_gen = running::next_gen(shared);
        entry.exited_tok.clone()
    };
    let Some(root) = inner.ctx.clone() else {
        return false;
    };
    start_locked(shared, inner, key, &root, wait, true);
    true
}
