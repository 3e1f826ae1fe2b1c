// MIT License
//
// Copyright (c) 2020 Gregory Meyer
//
// Permission is hereby granted, free of charge, to any person
// obtaining a copy of this software and associated documentation files
// (the "Software"), to deal in the Software without restriction,
// including without limitation the rights to use, copy, modify, merge,
// publish, distribute, sublicense, and/or sell copies of the Software,
// and to permit persons to whom the Software is furnished to do so,
// subject to the following conditions:
//
// The above copyright notice and this permission notice shall be
// included in all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND,
// EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF
// MERCHANTABILITY, FITNESS FOR A PARTICULAR PURPOSE AND
// NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR COPYRIGHT HOLDERS
// BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER IN AN
// ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN
// CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

//! Straightforward maps with the same operations as [`SyncMap`].
//!
//! [`RwLockMap`] guards a single table with a reader-writer lock.
//! [`DeepCopyMap`] reads a published table without locking and copies the
//! whole table on every write. Neither is meant for production use; they are
//! the yardsticks [`SyncMap`] is tested and benchmarked against.
//!
//! [`SyncMap`]: crate::SyncMap

use crate::{map::DefaultHashBuilder, ConcurrentMap};

use std::{
    hash::{BuildHasher, Hash},
    mem,
    sync::atomic::{self, Ordering},
};

use crossbeam_epoch::{Atomic, Guard, Owned, Shared};
use hashbrown::{hash_map::Entry, HashMap};
use parking_lot::{Mutex, RwLock};

/// A hash map behind a [`RwLock`].
///
/// [`RwLock`]: https://docs.rs/parking_lot/latest/parking_lot/type.RwLock.html
pub struct RwLockMap<K, V, S = DefaultHashBuilder> {
    map: RwLock<HashMap<K, V, S>>,
}

impl<K, V> RwLockMap<K, V, DefaultHashBuilder> {
    /// Creates an empty `RwLockMap` with the default hasher.
    pub fn new() -> RwLockMap<K, V, DefaultHashBuilder> {
        RwLockMap::with_hasher(DefaultHashBuilder::default())
    }
}

impl<K, V, S> RwLockMap<K, V, S> {
    /// Creates an empty `RwLockMap` that will use `build_hasher` to hash
    /// keys.
    pub fn with_hasher(build_hasher: S) -> RwLockMap<K, V, S> {
        RwLockMap {
            map: RwLock::new(HashMap::with_hasher(build_hasher)),
        }
    }
}

impl<K, V, S: Default> Default for RwLockMap<K, V, S> {
    fn default() -> RwLockMap<K, V, S> {
        RwLockMap::with_hasher(S::default())
    }
}

impl<K, V, S> ConcurrentMap<K, V> for RwLockMap<K, V, S>
where
    K: Hash + Eq + Clone,
    V: Clone + PartialEq,
    S: BuildHasher,
{
    fn load(&self, key: &K) -> Option<V> {
        self.map.read().get(key).cloned()
    }

    fn store(&self, key: K, value: V) {
        self.map.write().insert(key, value);
    }

    fn load_or_store(&self, key: K, value: V) -> (V, bool) {
        match self.map.write().entry(key) {
            Entry::Occupied(e) => (e.get().clone(), true),
            Entry::Vacant(e) => (e.insert(value).clone(), false),
        }
    }

    fn load_and_delete(&self, key: &K) -> Option<V> {
        self.map.write().remove(key)
    }

    fn delete(&self, key: &K) {
        self.map.write().remove(key);
    }

    fn swap(&self, key: K, value: V) -> Option<V> {
        self.map.write().insert(key, value)
    }

    fn compare_and_swap(&self, key: &K, old: &V, new: V) -> bool {
        match self.map.write().get_mut(key) {
            Some(value) if *value == *old => {
                *value = new;

                true
            }
            _ => false,
        }
    }

    fn compare_and_delete(&self, key: &K, old: &V) -> bool {
        let mut map = self.map.write();

        if map.get(key) != Some(old) {
            return false;
        }

        map.remove(key);

        true
    }

    // visits a copy of the key set so `func` may write to the map
    fn range<F: FnMut(&K, &V) -> bool>(&self, mut func: F) {
        let keys: Vec<K> = self.map.read().keys().cloned().collect();

        for key in keys {
            if let Some(value) = self.load(&key) {
                if !func(&key, &value) {
                    break;
                }
            }
        }
    }
}

/// A hash map that is copied on every write and read without locking.
///
/// Writers are serialized by a mutex. Each write clones the published table,
/// modifies the clone and publishes it in place of the old one, which is
/// reclaimed once no reader can still see it.
pub struct DeepCopyMap<K, V, S = DefaultHashBuilder> {
    clean: Atomic<HashMap<K, V, S>>,
    lock: Mutex<()>,
    build_hasher: S,
}

impl<K, V> DeepCopyMap<K, V, DefaultHashBuilder> {
    /// Creates an empty `DeepCopyMap` with the default hasher.
    ///
    /// No table is allocated until the first write.
    pub fn new() -> DeepCopyMap<K, V, DefaultHashBuilder> {
        DeepCopyMap::with_hasher(DefaultHashBuilder::default())
    }
}

impl<K, V, S> DeepCopyMap<K, V, S> {
    /// Creates an empty `DeepCopyMap` that will use `build_hasher` to hash
    /// keys.
    pub fn with_hasher(build_hasher: S) -> DeepCopyMap<K, V, S> {
        DeepCopyMap {
            clean: Atomic::null(),
            lock: Mutex::new(()),
            build_hasher,
        }
    }
}

impl<K, V, S: Default> Default for DeepCopyMap<K, V, S> {
    fn default() -> DeepCopyMap<K, V, S> {
        DeepCopyMap::with_hasher(S::default())
    }
}

impl<'g, K: 'g + Hash + Eq + Clone, V: 'g + Clone, S: 'g + BuildHasher + Clone>
    DeepCopyMap<K, V, S>
{
    fn clean(&self, guard: &'g Guard) -> Option<&'g HashMap<K, V, S>> {
        unsafe { self.clean.load(Ordering::Acquire, guard).as_ref() }
    }

    // the caller holds `lock`
    fn update_locked<F: FnOnce(&mut HashMap<K, V, S>) -> T, T>(
        &self,
        guard: &'g Guard,
        func: F,
    ) -> T {
        let mut dirty = match self.clean(guard) {
            Some(clean) => clean.clone(),
            None => HashMap::with_hasher(self.build_hasher.clone()),
        };

        let result = func(&mut dirty);

        let previous = self.clean.swap(Owned::new(dirty), Ordering::AcqRel, guard);

        if !previous.is_null() {
            unsafe { guard.defer_destroy(previous) };
        }

        result
    }
}

impl<K, V, S> ConcurrentMap<K, V> for DeepCopyMap<K, V, S>
where
    K: Hash + Eq + Clone,
    V: Clone + PartialEq,
    S: BuildHasher + Clone,
{
    fn load(&self, key: &K) -> Option<V> {
        let guard = &crossbeam_epoch::pin();

        self.clean(guard).and_then(|clean| clean.get(key)).cloned()
    }

    fn store(&self, key: K, value: V) {
        let _lock = self.lock.lock();
        let guard = &crossbeam_epoch::pin();

        self.update_locked(guard, |dirty| dirty.insert(key, value));
    }

    fn load_or_store(&self, key: K, value: V) -> (V, bool) {
        if let Some(actual) = self.load(&key) {
            return (actual, true);
        }

        let _lock = self.lock.lock();
        let guard = &crossbeam_epoch::pin();

        if let Some(actual) = self.clean(guard).and_then(|clean| clean.get(&key)) {
            return (actual.clone(), true);
        }

        self.update_locked(guard, |dirty| {
            dirty.insert(key, value.clone());
        });

        (value, false)
    }

    fn load_and_delete(&self, key: &K) -> Option<V> {
        let _lock = self.lock.lock();
        let guard = &crossbeam_epoch::pin();

        self.update_locked(guard, |dirty| dirty.remove(key))
    }

    fn delete(&self, key: &K) {
        self.load_and_delete(key);
    }

    fn swap(&self, key: K, value: V) -> Option<V> {
        let _lock = self.lock.lock();
        let guard = &crossbeam_epoch::pin();

        self.update_locked(guard, |dirty| dirty.insert(key, value))
    }

    fn compare_and_swap(&self, key: &K, old: &V, new: V) -> bool {
        if self.load(key).as_ref() != Some(old) {
            return false;
        }

        let _lock = self.lock.lock();
        let guard = &crossbeam_epoch::pin();

        if self.clean(guard).and_then(|clean| clean.get(key)) != Some(old) {
            return false;
        }

        self.update_locked(guard, |dirty| dirty.insert(key.clone(), new));

        true
    }

    fn compare_and_delete(&self, key: &K, old: &V) -> bool {
        if self.load(key).as_ref() != Some(old) {
            return false;
        }

        let _lock = self.lock.lock();
        let guard = &crossbeam_epoch::pin();

        if self.clean(guard).and_then(|clean| clean.get(key)) != Some(old) {
            return false;
        }

        self.update_locked(guard, |dirty| dirty.remove(key));

        true
    }

    fn range<F: FnMut(&K, &V) -> bool>(&self, mut func: F) {
        let guard = &crossbeam_epoch::pin();

        if let Some(clean) = self.clean(guard) {
            for (key, value) in clean.iter() {
                if !func(key, value) {
                    break;
                }
            }
        }
    }
}

impl<K, V, S> Drop for DeepCopyMap<K, V, S> {
    fn drop(&mut self) {
        atomic::fence(Ordering::Acquire);

        let guard = unsafe { crossbeam_epoch::unprotected() };
        let clean = self.clean.swap(Shared::null(), Ordering::Relaxed, guard);

        if !clean.is_null() {
            mem::drop(unsafe { clean.into_owned() });
        }
    }
}
