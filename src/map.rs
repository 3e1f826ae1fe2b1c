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

//! A concurrent hash map for read-mostly workloads.
//!
//! Loads of keys that have been stable for a while never take a lock; writes
//! and loads of recently added keys go through a mutex-protected dirty map
//! that is periodically promoted to be the lock-free read path.

mod entry;
mod read_only;


use entry::{defer_acquire_destroy, Entry, EntryRef, LoadOrStore, Value};
use read_only::{DirtyMap, EntryMap, ReadOnly, Snapshot};

use std::{
    borrow::Borrow,
    fmt,
    hash::{BuildHasher, Hash},
    mem,
    sync::{
        atomic::{self, Ordering},
        Arc,
    },
};

use crossbeam_epoch::{Atomic, Guard, Owned, Pointer, Shared};
use log::trace;
use parking_lot::Mutex;

/// Default hasher for `SyncMap`.
///
/// This is currently [aHash], a fast hashing algorithm with some resistance to
/// DoS attacks, but it is not cryptographically secure and is subject to
/// change.
///
/// [aHash]: https://docs.rs/ahash
pub type DefaultHashBuilder = ahash::RandomState;

/// A concurrent hash map optimized for keys that are written once and read
/// many times, or for threads that work on disjoint sets of keys.
///
/// `SyncMap` keeps two maps. The read-only snapshot is swapped atomically and
/// is read without locking. The dirty map is protected by a mutex and holds
/// every key added since the snapshot was last replaced. Both maps share one
/// atomic value slot per key, so updating the value of a key that is already
/// in the snapshot is also lock-free.
///
/// A load that misses the snapshot while the dirty map holds extra keys takes
/// the lock and counts a miss. Once the number of misses reaches the size of
/// the dirty map, the dirty map becomes the new snapshot, so the cost of
/// copying it is amortized over the loads that had to take the lock.
///
/// An empty `SyncMap` does not allocate; `SyncMap::default()` is ready to use.
///
/// Key types must implement [`Hash`], [`Eq`] and [`Clone`]; keys are cloned
/// when the dirty map is rebuilt from the snapshot. Operations that return a
/// value require the value type to implement [`Clone`], as the value may be
/// replaced by another thread at any moment. [`load_and`] gives access to a
/// value without cloning it.
///
/// [`Hash`]: https://doc.rust-lang.org/std/hash/trait.Hash.html
/// [`Eq`]: https://doc.rust-lang.org/std/cmp/trait.Eq.html
/// [`Clone`]: https://doc.rust-lang.org/std/clone/trait.Clone.html
/// [`load_and`]: #method.load_and
pub struct SyncMap<K, V, S = DefaultHashBuilder> {
    read: Atomic<ReadOnly<K, V, S>>,
    dirty: Mutex<DirtyMap<K, V, S>>,
    build_hasher: S,
}

impl<K, V> SyncMap<K, V, DefaultHashBuilder> {
    /// Creates an empty `SyncMap`.
    ///
    /// Neither the snapshot nor the dirty map is allocated until the first
    /// write.
    pub fn new() -> SyncMap<K, V, DefaultHashBuilder> {
        SyncMap::with_hasher(DefaultHashBuilder::default())
    }
}

impl<K, V, S> SyncMap<K, V, S> {
    /// Creates an empty `SyncMap` that will use `build_hasher` to hash keys.
    pub fn with_hasher(build_hasher: S) -> SyncMap<K, V, S> {
        SyncMap {
            read: Atomic::null(),
            dirty: Mutex::new(DirtyMap::new()),
            build_hasher,
        }
    }

    /// Returns a reference to the map's [`BuildHasher`].
    ///
    /// [`BuildHasher`]: https://doc.rust-lang.org/std/hash/trait.BuildHasher.html
    pub fn hasher(&self) -> &S {
        &self.build_hasher
    }
}

impl<K: Hash + Eq + Clone, V, S: BuildHasher + Clone> SyncMap<K, V, S> {
    /// Returns a copy of the value associated with `key`.
    ///
    /// `Q` can be any borrowed form of `K`, but [`Hash`] and [`Eq`] on `Q`
    /// *must* match that of `K`.
    ///
    /// [`Hash`]: https://doc.rust-lang.org/std/hash/trait.Hash.html
    /// [`Eq`]: https://doc.rust-lang.org/std/cmp/trait.Eq.html
    pub fn load<Q: ?Sized + Hash + Eq>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        V: Clone,
    {
        self.load_and(key, V::clone)
    }

    /// Invokes `func` with a reference to the value associated with `key`.
    ///
    /// `func` is only invoked if `key` is present. The map's lock is never
    /// held while `func` runs.
    pub fn load_and<Q: ?Sized + Hash + Eq, F: FnOnce(&V) -> T, T>(
        &self,
        key: &Q,
        func: F,
    ) -> Option<T>
    where
        K: Borrow<Q>,
    {
        let guard = &crossbeam_epoch::pin();
        let entry = self.find_entry(key, guard)?;

        entry.load(guard).map(func)
    }

    /// Associates `value` with `key`.
    pub fn store(&self, key: K, value: V) {
        self.swap_and(key, value, |_| ());
    }

    /// Associates `value` with `key` and returns a copy of the value previously
    /// associated with `key`, if there was one.
    pub fn swap(&self, key: K, value: V) -> Option<V>
    where
        V: Clone,
    {
        self.swap_and(key, value, V::clone)
    }

    /// Returns a copy of the value associated with `key` if there is one.
    /// Otherwise associates `value` with `key` and returns a copy of it.
    ///
    /// The flag is `true` if the value was loaded and `false` if it was
    /// stored. Among threads racing to fill the same absent key, exactly one
    /// stores and every thread returns that thread's value.
    pub fn load_or_store(&self, key: K, value: V) -> (V, bool)
    where
        V: Clone,
    {
        let guard = &crossbeam_epoch::pin();
        let mut value = value;

        if let Some(entry) = self.snapshot(guard).get(&key) {
            match entry.try_load_or_store(value, guard) {
                LoadOrStore::Loaded(actual) => return (actual.clone(), true),
                LoadOrStore::Stored(actual) => return (actual.clone(), false),
                LoadOrStore::Expunged(returned) => value = returned,
            }
        }

        let mut dirty = self.dirty.lock();
        let read = self.snapshot(guard);

        if let Some(entry) = read.get(&key) {
            if entry.unexpunge_locked(guard) {
                dirty.insert(key, Arc::clone(entry), &self.build_hasher);
            }

            loaded_or_stored(entry.try_load_or_store(value, guard))
        } else if let Some(entry) = dirty.get(&key) {
            let result = loaded_or_stored(entry.try_load_or_store(value, guard));
            self.record_miss(&mut dirty, guard);

            result
        } else {
            let entry = Arc::new(Entry::new(value.clone()));
            self.insert_locked(&mut dirty, read, key, entry, guard);

            (value, false)
        }
    }

    /// Removes the value associated with `key`, returning a copy of it.
    pub fn load_and_delete<Q: ?Sized + Hash + Eq>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        V: Clone,
    {
        self.load_and_delete_and(key, V::clone)
    }

    /// Removes the value associated with `key`.
    pub fn delete<Q: ?Sized + Hash + Eq>(&self, key: &Q)
    where
        K: Borrow<Q>,
    {
        self.load_and_delete_and(key, |_| ());
    }

    /// Replaces the value associated with `key` with `new` if it is equal to
    /// `old`. Returns `true` if the value was replaced.
    pub fn compare_and_swap<Q: ?Sized + Hash + Eq>(&self, key: &Q, old: &V, new: V) -> bool
    where
        K: Borrow<Q>,
        V: PartialEq,
    {
        let guard = &crossbeam_epoch::pin();
        let read = self.snapshot(guard);

        if let Some(entry) = read.get(key) {
            return entry.try_compare_and_swap(old, new, guard);
        } else if !read.is_amended() {
            return false;
        }

        let mut dirty = self.dirty.lock();
        let read = self.snapshot(guard);

        if let Some(entry) = read.get(key) {
            entry.try_compare_and_swap(old, new, guard)
        } else if let Some(entry) = dirty.get(key) {
            let swapped = entry.try_compare_and_swap(old, new, guard);
            self.record_miss(&mut dirty, guard);

            swapped
        } else {
            false
        }
    }

    /// Removes the value associated with `key` if it is equal to `old`.
    /// Returns `true` if the value was removed.
    pub fn compare_and_delete<Q: ?Sized + Hash + Eq>(&self, key: &Q, old: &V) -> bool
    where
        K: Borrow<Q>,
        V: PartialEq,
    {
        let guard = &crossbeam_epoch::pin();

        match self.find_entry(key, guard) {
            Some(entry) => entry.compare_and_delete(old, guard),
            None => false,
        }
    }

    /// Invokes `func` for each key and value in the map, stopping early if
    /// `func` returns `false`.
    ///
    /// If the dirty map holds keys missing from the snapshot, it is promoted
    /// first, then the snapshot is iterated without holding the lock. `func`
    /// may call any method of this map. Each key is visited at most once; keys
    /// stored or deleted by other threads during the iteration may or may not
    /// be visited.
    pub fn range<F: FnMut(&K, &V) -> bool>(&self, mut func: F) {
        let entries = {
            let guard = &crossbeam_epoch::pin();
            let read = self.snapshot(guard);

            if read.is_amended() {
                let mut dirty = self.dirty.lock();
                let read = self.snapshot(guard);

                if read.is_amended() {
                    trace!("promoting dirty map of {} entries for range", dirty.len());

                    Some(self.promote(&mut dirty, guard))
                } else {
                    read.entries().cloned()
                }
            } else {
                read.entries().cloned()
            }
        };

        let entries = match entries {
            Some(entries) => entries,
            None => return,
        };

        for (key, entry) in entries.iter() {
            let guard = &crossbeam_epoch::pin();

            if let Some(value) = entry.load(guard) {
                if !func(key, value) {
                    break;
                }
            }
        }
    }

    /// Removes every key from the map.
    pub fn clear(&self) {
        let guard = &crossbeam_epoch::pin();
        let read = self.snapshot(guard);

        if read.is_empty() && !read.is_amended() {
            return;
        }

        let mut dirty = self.dirty.lock();
        let read = self.snapshot(guard);

        if !read.is_empty() || read.is_amended() {
            self.install(Shared::null(), guard);
        }

        trace!("cleared dirty map of {} entries", dirty.len());
        dirty.entries = None;
        dirty.misses = 0;
    }
}

impl<'g, K: 'g + Hash + Eq + Clone, V: 'g, S: 'g + BuildHasher + Clone> SyncMap<K, V, S> {
    fn snapshot(&self, guard: &'g Guard) -> Snapshot<'g, K, V, S> {
        let read = self.read.load(Ordering::Acquire, guard);

        Snapshot::new(unsafe { read.as_ref() })
    }

    // looks up `key` in the snapshot, then in the dirty map, counting a miss
    // for the latter
    fn find_entry<Q: ?Sized + Hash + Eq>(
        &self,
        key: &Q,
        guard: &'g Guard,
    ) -> Option<EntryRef<'g, V>>
    where
        K: Borrow<Q>,
    {
        let read = self.snapshot(guard);

        if let Some(entry) = read.get(key) {
            return Some(EntryRef::Snapshot(entry));
        } else if !read.is_amended() {
            return None;
        }

        let mut dirty = self.dirty.lock();
        let read = self.snapshot(guard);

        if let Some(entry) = read.get(key) {
            return Some(EntryRef::Snapshot(entry));
        } else if !read.is_amended() {
            return None;
        }

        let entry = dirty.get(key).cloned();
        self.record_miss(&mut dirty, guard);

        entry.map(EntryRef::Dirty)
    }

    fn swap_and<F: FnOnce(&V) -> T, T>(&self, key: K, value: V, func: F) -> Option<T> {
        let guard = &crossbeam_epoch::pin();
        let mut value = Value::owned(value);

        if let Some(entry) = self.snapshot(guard).get(&key) {
            match entry.try_swap(value, guard) {
                Ok(previous) => return previous.map(func),
                Err(returned) => value = returned,
            }
        }

        let mut dirty = self.dirty.lock();
        let read = self.snapshot(guard);

        if let Some(entry) = read.get(&key) {
            if entry.unexpunge_locked(guard) {
                dirty.insert(key, Arc::clone(entry), &self.build_hasher);
            }

            entry.swap_locked(value, guard).map(func)
        } else if let Some(entry) = dirty.get(&key) {
            entry.swap_locked(value, guard).map(func)
        } else {
            let entry = Arc::new(Entry::from_owned(value));
            self.insert_locked(&mut dirty, read, key, entry, guard);

            None
        }
    }

    fn load_and_delete_and<Q: ?Sized + Hash + Eq, F: FnOnce(&V) -> T, T>(
        &self,
        key: &Q,
        func: F,
    ) -> Option<T>
    where
        K: Borrow<Q>,
    {
        let guard = &crossbeam_epoch::pin();
        let read = self.snapshot(guard);

        let entry = match read.get(key) {
            Some(entry) => EntryRef::Snapshot(entry),
            None if !read.is_amended() => return None,
            None => {
                let mut dirty = self.dirty.lock();
                let read = self.snapshot(guard);

                match read.get(key) {
                    Some(entry) => EntryRef::Snapshot(entry),
                    None if !read.is_amended() => return None,
                    None => {
                        let removed = dirty.remove(key);
                        self.record_miss(&mut dirty, guard);

                        EntryRef::Dirty(removed?)
                    }
                }
            }
        };

        entry.delete(guard).map(func)
    }

    // adds a key missing from both maps; the caller holds the lock
    fn insert_locked(
        &self,
        dirty: &mut DirtyMap<K, V, S>,
        read: Snapshot<'g, K, V, S>,
        key: K,
        entry: Arc<Entry<V>>,
        guard: &'g Guard,
    ) {
        if !read.is_amended() {
            self.build_dirty_locked(dirty, read, guard);

            let entries = match read.entries() {
                Some(entries) => Arc::clone(entries),
                None => Arc::new(EntryMap::with_hasher(self.build_hasher.clone())),
            };

            self.install(Owned::new(ReadOnly::new(entries, true)), guard);
        }

        dirty.insert(key, entry, &self.build_hasher);
    }

    fn build_dirty_locked(
        &self,
        dirty: &mut DirtyMap<K, V, S>,
        read: Snapshot<'g, K, V, S>,
        guard: &'g Guard,
    ) {
        if dirty.entries.is_some() {
            return;
        }

        let mut entries = EntryMap::with_capacity_and_hasher(read.len(), self.build_hasher.clone());
        let mut num_expunged = 0;

        if let Some(read_entries) = read.entries() {
            for (key, entry) in read_entries.iter() {
                if entry.try_expunge_locked(guard) {
                    num_expunged += 1;
                } else {
                    entries.insert(key.clone(), Arc::clone(entry));
                }
            }
        }

        trace!(
            "built dirty map of {} entries, expunged {}",
            entries.len(),
            num_expunged
        );

        dirty.entries = Some(entries);
    }

    fn record_miss(&self, dirty: &mut DirtyMap<K, V, S>, guard: &'g Guard) {
        dirty.misses += 1;

        if dirty.misses < dirty.len() {
            return;
        }

        trace!(
            "promoting dirty map of {} entries after {} misses",
            dirty.len(),
            dirty.misses
        );

        self.promote(dirty, guard);
    }

    fn promote(&self, dirty: &mut DirtyMap<K, V, S>, guard: &'g Guard) -> Arc<EntryMap<K, V, S>> {
        let entries = Arc::new(
            dirty
                .entries
                .take()
                .unwrap_or_else(|| EntryMap::with_hasher(self.build_hasher.clone())),
        );
        dirty.misses = 0;

        self.install(Owned::new(ReadOnly::new(Arc::clone(&entries), false)), guard);

        entries
    }

    fn install<P: Pointer<ReadOnly<K, V, S>>>(&self, read_only: P, guard: &'g Guard) {
        let previous = self.read.swap(read_only, Ordering::AcqRel, guard);

        if !previous.is_null() {
            unsafe { defer_acquire_destroy(guard, previous) };
        }
    }
}

fn loaded_or_stored<V: Clone>(outcome: LoadOrStore<'_, V>) -> (V, bool) {
    match outcome {
        LoadOrStore::Loaded(actual) => (actual.clone(), true),
        LoadOrStore::Stored(actual) => (actual.clone(), false),
        LoadOrStore::Expunged(_) => unreachable!("entry expunged with the dirty map locked"),
    }
}

impl<K, V, S: Default> Default for SyncMap<K, V, S> {
    fn default() -> SyncMap<K, V, S> {
        SyncMap::with_hasher(S::default())
    }
}

impl<K: Hash + Eq + Clone, V, S: BuildHasher + Clone + Default> FromIterator<(K, V)>
    for SyncMap<K, V, S>
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> SyncMap<K, V, S> {
        let mut map = SyncMap::default();
        map.extend(iter);

        map
    }
}

impl<K: Hash + Eq + Clone, V, S: BuildHasher + Clone> Extend<(K, V)> for SyncMap<K, V, S> {
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (key, value) in iter {
            self.store(key, value);
        }
    }
}

impl<K, V, S> fmt::Debug for SyncMap<K, V, S>
where
    K: Hash + Eq + Clone + fmt::Debug,
    V: fmt::Debug,
    S: BuildHasher + Clone,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        self.range(|key, value| {
            map.entry(key, value);

            true
        });

        map.finish()
    }
}

impl<K, V, S> Drop for SyncMap<K, V, S> {
    fn drop(&mut self) {
        atomic::fence(Ordering::Acquire);

        // drop is called with a mutable reference, so no other thread can be
        // reading the snapshot
        let guard = unsafe { crossbeam_epoch::unprotected() };
        let read = self.read.swap(Shared::null(), Ordering::Relaxed, guard);

        if !read.is_null() {
            mem::drop(unsafe { read.into_owned() });
        }
    }
}
