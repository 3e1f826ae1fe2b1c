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

//! Concurrent hash maps for read-mostly workloads.
//!
//! [`SyncMap`] serves loads of stable keys without taking a lock and pays for
//! new keys with an amortized copy of its write-side map. The maps in
//! [`reference`] implement the same [`ConcurrentMap`] operations with simpler
//! designs and exist to check and benchmark [`SyncMap`] against.

pub mod map;
pub mod reference;

pub use map::SyncMap;

use std::hash::{BuildHasher, Hash};

/// The operations supported by every map in this crate.
///
/// Absence is never an error: lookups return [`None`] and conditional
/// updates return `false`.
///
/// [`None`]: https://doc.rust-lang.org/std/option/enum.Option.html#variant.None
pub trait ConcurrentMap<K, V> {
    /// Returns a copy of the value associated with `key`.
    fn load(&self, key: &K) -> Option<V>;

    /// Associates `value` with `key`.
    fn store(&self, key: K, value: V);

    /// Returns the value associated with `key` and `true`, or stores `value`
    /// and returns it with `false`.
    fn load_or_store(&self, key: K, value: V) -> (V, bool);

    /// Removes the value associated with `key`, returning it.
    fn load_and_delete(&self, key: &K) -> Option<V>;

    /// Removes the value associated with `key`.
    fn delete(&self, key: &K);

    /// Associates `value` with `key`, returning the previous value.
    fn swap(&self, key: K, value: V) -> Option<V>;

    /// Replaces the value associated with `key` with `new` if it equals `old`.
    fn compare_and_swap(&self, key: &K, old: &V, new: V) -> bool;

    /// Removes the value associated with `key` if it equals `old`.
    fn compare_and_delete(&self, key: &K, old: &V) -> bool;

    /// Invokes `func` on each entry until it returns `false`.
    fn range<F: FnMut(&K, &V) -> bool>(&self, func: F);
}

impl<K, V, S> ConcurrentMap<K, V> for SyncMap<K, V, S>
where
    K: Hash + Eq + Clone,
    V: Clone + PartialEq,
    S: BuildHasher + Clone,
{
    fn load(&self, key: &K) -> Option<V> {
        SyncMap::load(self, key)
    }

    fn store(&self, key: K, value: V) {
        SyncMap::store(self, key, value)
    }

    fn load_or_store(&self, key: K, value: V) -> (V, bool) {
        SyncMap::load_or_store(self, key, value)
    }

    fn load_and_delete(&self, key: &K) -> Option<V> {
        SyncMap::load_and_delete(self, key)
    }

    fn delete(&self, key: &K) {
        SyncMap::delete(self, key)
    }

    fn swap(&self, key: K, value: V) -> Option<V> {
        SyncMap::swap(self, key, value)
    }

    fn compare_and_swap(&self, key: &K, old: &V, new: V) -> bool {
        SyncMap::compare_and_swap(self, key, old, new)
    }

    fn compare_and_delete(&self, key: &K, old: &V) -> bool {
        SyncMap::compare_and_delete(self, key, old)
    }

    fn range<F: FnMut(&K, &V) -> bool>(&self, func: F) {
        SyncMap::range(self, func)
    }
}
