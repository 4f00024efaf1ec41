//! Keyed record store used by the services.
//!
//! Persistence is an external collaborator: services only see this trait. The
//! in-memory implementation backs the worker binaries and the tests.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, RwLock};

pub trait Repository<K, V>: Send + Sync {
    fn get(&self, key: &K) -> Option<V>;

    fn upsert(&self, key: K, value: V);

    fn list(&self) -> Vec<V>;

    /// Apply `f` to the stored value under one lock and return the new value.
    /// `None` when the key is absent.
    fn update(&self, key: &K, f: &mut dyn FnMut(&mut V)) -> Option<V>;

    /// Insert `value` unless the key is taken or a stored value `conflicts`
    /// with it, checked and written under one lock. Returns the value that
    /// blocked the insert.
    fn insert_unique(&self, key: K, value: V, conflicts: &dyn Fn(&V, &V) -> bool) -> Result<(), V>;

    /// Like [`Repository::update`], but the updated value must not
    /// `conflict` with any other stored value. `None` when the key is absent;
    /// `Some(Err(other))` leaves the stored value untouched.
    fn update_unique(
        &self,
        key: &K,
        f: &mut dyn FnMut(&mut V),
        conflicts: &dyn Fn(&V, &V) -> bool,
    ) -> Option<Result<V, V>>;

    /// Remove and return the value under `key`.
    fn remove(&self, key: &K) -> Option<V>;
}

impl<K, V, S> Repository<K, V> for Arc<S>
where
    S: Repository<K, V> + ?Sized,
{
    fn get(&self, key: &K) -> Option<V> {
        (**self).get(key)
    }

    fn upsert(&self, key: K, value: V) {
        (**self).upsert(key, value)
    }

    fn list(&self) -> Vec<V> {
        (**self).list()
    }

    fn update(&self, key: &K, f: &mut dyn FnMut(&mut V)) -> Option<V> {
        (**self).update(key, f)
    }

    fn insert_unique(&self, key: K, value: V, conflicts: &dyn Fn(&V, &V) -> bool) -> Result<(), V> {
        (**self).insert_unique(key, value, conflicts)
    }

    fn update_unique(
        &self,
        key: &K,
        f: &mut dyn FnMut(&mut V),
        conflicts: &dyn Fn(&V, &V) -> bool,
    ) -> Option<Result<V, V>> {
        (**self).update_unique(key, f, conflicts)
    }

    fn remove(&self, key: &K) -> Option<V> {
        (**self).remove(key)
    }
}

#[derive(Debug)]
pub struct InMemoryRepository<K, V> {
    inner: RwLock<HashMap<K, V>>,
}

impl<K, V> InMemoryRepository<K, V> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }
}

impl<K, V> Default for InMemoryRepository<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Repository<K, V> for InMemoryRepository<K, V>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn get(&self, key: &K) -> Option<V> {
        let map = self.inner.read().ok()?;
        map.get(key).cloned()
    }

    fn upsert(&self, key: K, value: V) {
        if let Ok(mut map) = self.inner.write() {
            map.insert(key, value);
        }
    }

    fn list(&self) -> Vec<V> {
        match self.inner.read() {
            Ok(map) => map.values().cloned().collect(),
            Err(_) => vec![],
        }
    }

    fn update(&self, key: &K, f: &mut dyn FnMut(&mut V)) -> Option<V> {
        let mut map = self.inner.write().ok()?;
        let value = map.get_mut(key)?;
        f(value);
        Some(value.clone())
    }

    fn insert_unique(&self, key: K, value: V, conflicts: &dyn Fn(&V, &V) -> bool) -> Result<(), V> {
        // A poisoned lock refuses the insert rather than skipping the check.
        let mut map = self.inner.write().map_err(|_| value.clone())?;
        if let Some(existing) = map.get(&key) {
            return Err(existing.clone());
        }
        if let Some(existing) = map.values().find(|existing| conflicts(*existing, &value)) {
            return Err(existing.clone());
        }
        map.insert(key, value);
        Ok(())
    }

    fn update_unique(
        &self,
        key: &K,
        f: &mut dyn FnMut(&mut V),
        conflicts: &dyn Fn(&V, &V) -> bool,
    ) -> Option<Result<V, V>> {
        let mut map = self.inner.write().ok()?;
        let mut updated = map.get(key)?.clone();
        f(&mut updated);

        let clash = map
            .iter()
            .find(|(other_key, other)| other_key != &key && conflicts(*other, &updated))
            .map(|(_, other)| other.clone());
        if let Some(other) = clash {
            return Some(Err(other));
        }

        let slot = map.get_mut(key)?;
        *slot = updated.clone();
        Some(Ok(updated))
    }

    fn remove(&self, key: &K) -> Option<V> {
        self.inner.write().ok()?.remove(key)
    }
}
