//! Reference-counted wrapper over the keyed supervisor.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::backoff::{BackOff, BackoffConfig};
use crate::broadcast::lock_recover;
use crate::routine::RoutineRef;

use super::{Keyed, KeyedBuilder, KeyedCond, KeyedExitCb, KeyWithData};

struct KrcShared<K, V> {
    keyed: Keyed<K, V>,
    /// Live reference ids per key; a key is removed when its set empties.
    refs: Mutex<HashMap<K, HashSet<u64>>>,
    next_ref: AtomicU64,
}

/// # Builder for [`KeyedRefCount`].
///
/// Accepts the same options as [`Keyed`].
pub struct KeyedRefCountBuilder<K, V> {
    keyed: KeyedBuilder<K, V>,
}

impl<K, V> KeyedRefCountBuilder<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// See [`KeyedBuilder::release_delay`].
    pub fn release_delay(mut self, delay: Duration) -> Self {
        self.keyed = self.keyed.release_delay(delay);
        self
    }

    /// See [`KeyedBuilder::retry`].
    pub fn retry(mut self, cfg: BackoffConfig) -> Self {
        self.keyed = self.keyed.retry(cfg);
        self
    }

    /// See [`KeyedBuilder::backoff_factory`].
    pub fn backoff_factory(
        mut self,
        factory: impl Fn(&K) -> Option<Box<dyn BackOff + Send>> + Send + Sync + 'static,
    ) -> Self {
        self.keyed = self.keyed.backoff_factory(factory);
        self
    }

    /// See [`KeyedBuilder::exit_cb`].
    pub fn exit_cb(mut self, cb: KeyedExitCb<K, V>) -> Self {
        self.keyed = self.keyed.exit_cb(cb);
        self
    }

    /// See [`KeyedBuilder::exit_log`].
    #[cfg(feature = "logging")]
    pub fn exit_log(mut self) -> Self
    where
        K: std::fmt::Debug,
    {
        self.keyed = self.keyed.exit_log();
        self
    }

    /// Finishes the builder.
    ///
    /// Note: routines won't start until
    /// [`set_context`](KeyedRefCount::set_context) is called.
    pub fn build(self) -> KeyedRefCount<K, V> {
        KeyedRefCount {
            shared: Arc::new(KrcShared {
                keyed: self.keyed.build(),
                refs: Mutex::new(HashMap::new()),
                next_ref: AtomicU64::new(0),
            }),
        }
    }
}

/// # Keyed supervisor whose routines are kept alive by references.
///
/// [`add_key_ref`](KeyedRefCount::add_key_ref) inserts (and starts) the
/// key's routine and hands out a [`KeyedRef`]; when the last reference for
/// a key is released, the key is removed (subject to the configured release
/// delay).
///
/// Cheap to clone; clones share the same supervisor.
pub struct KeyedRefCount<K, V> {
    shared: Arc<KrcShared<K, V>>,
}

impl<K, V> Clone for KeyedRefCount<K, V> {
    fn clone(&self) -> Self {
        KeyedRefCount {
            shared: self.shared.clone(),
        }
    }
}

impl<K, V> KeyedRefCount<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Builds a reference-counted supervisor with no options.
    ///
    /// Note: routines won't start until
    /// [`set_context`](KeyedRefCount::set_context) is called.
    pub fn new(ctor: impl Fn(&K) -> (RoutineRef, V) + Send + Sync + 'static) -> Self {
        KeyedRefCount::builder(ctor).build()
    }

    /// Returns a builder accepting the same options as [`Keyed`].
    pub fn builder(
        ctor: impl Fn(&K) -> (RoutineRef, V) + Send + Sync + 'static,
    ) -> KeyedRefCountBuilder<K, V> {
        KeyedRefCountBuilder {
            keyed: Keyed::builder(ctor),
        }
    }

    /// Adds a reference to `key`, inserting and starting its routine if
    /// new.
    ///
    /// Returns the reference, the key's side-data, and whether the key
    /// already existed.
    pub fn add_key_ref(&self, key: K) -> (KeyedRef<K, V>, V, bool) {
        let mut refs = lock_recover(&self.shared.refs);
        let id = self.shared.next_ref.fetch_add(1, Ordering::Relaxed);
        let (data, existed) = self.shared.keyed.set_key(key.clone(), true);
        refs.entry(key.clone()).or_default().insert(id);
        drop(refs);
        (
            KeyedRef {
                shared: self.shared.clone(),
                key,
                id,
                released: AtomicBool::new(false),
            },
            data,
            existed,
        )
    }

    /// Drops every reference to `key` and removes it from the supervisor.
    ///
    /// Outstanding [`KeyedRef`]s become inert. Returns whether the key
    /// existed.
    pub fn remove_key(&self, key: &K) -> bool {
        let mut refs = lock_recover(&self.shared.refs);
        refs.remove(key);
        self.shared.keyed.remove_key(key)
    }

    /// See [`Keyed::set_context`].
    pub fn set_context(&self, ctx: Option<Arc<CancellationToken>>, restart: bool) {
        self.shared.keyed.set_context(ctx, restart);
    }

    /// See [`Keyed::clear_context`].
    pub fn clear_context(&self) {
        self.shared.keyed.clear_context();
    }

    /// See [`Keyed::get_key`].
    pub fn get_key(&self, key: &K) -> Option<V> {
        self.shared.keyed.get_key(key)
    }

    /// See [`Keyed::get_keys`].
    pub fn get_keys(&self) -> Vec<K> {
        self.shared.keyed.get_keys()
    }

    /// See [`Keyed::get_keys_with_data`].
    pub fn get_keys_with_data(&self) -> Vec<KeyWithData<K, V>> {
        self.shared.keyed.get_keys_with_data()
    }

    /// See [`Keyed::reset_routine`].
    pub fn reset_routine(&self, key: &K, conds: &[&KeyedCond<K, V>]) -> (bool, bool) {
        self.shared.keyed.reset_routine(key, conds)
    }

    /// See [`Keyed::restart_routine`].
    pub fn restart_routine(&self, key: &K, conds: &[&KeyedCond<K, V>]) -> (bool, bool) {
        self.shared.keyed.restart_routine(key, conds)
    }

    /// See [`Keyed::reset_all_routines`].
    pub fn reset_all_routines(&self, conds: &[&KeyedCond<K, V>]) -> (usize, usize) {
        self.shared.keyed.reset_all_routines(conds)
    }

    /// See [`Keyed::restart_all_routines`].
    pub fn restart_all_routines(&self, conds: &[&KeyedCond<K, V>]) -> (usize, usize) {
        self.shared.keyed.restart_all_routines(conds)
    }
}

/// # Reference keeping one key of a [`KeyedRefCount`] alive.
///
/// Released explicitly via [`release`](KeyedRef::release) (idempotent) or
/// implicitly on drop. When the last reference for the key goes away, the
/// key is removed from the supervisor.
pub struct KeyedRef<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    shared: Arc<KrcShared<K, V>>,
    key: K,
    id: u64,
    released: AtomicBool,
}

impl<K, V> KeyedRef<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Returns the key this reference retains.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Releases the reference. Safe to call any number of times.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut refs = lock_recover(&self.shared.refs);
        if let Some(ids) = refs.get_mut(&self.key) {
            if ids.remove(&self.id) && ids.is_empty() {
                refs.remove(&self.key);
                self.shared.keyed.remove_key(&self.key);
            }
        }
    }
}

impl<K, V> Drop for KeyedRef<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.release();
    }
}
