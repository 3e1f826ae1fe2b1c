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

//! The two representations behind a [`SyncMap`]: an immutable snapshot that
//! is read without locking, and a lock-protected dirty map that absorbs new
//! keys until it is promoted to be the next snapshot.
//!
//! [`SyncMap`]: crate::SyncMap

use super::entry::Entry;

use std::{
    borrow::Borrow,
    hash::{BuildHasher, Hash},
    sync::Arc,
};

use hashbrown::HashMap;

pub(crate) type EntryMap<K, V, S> = HashMap<K, Arc<Entry<V>>, S>;

pub(crate) struct ReadOnly<K, V, S> {
    pub(crate) entries: Arc<EntryMap<K, V, S>>,
    // true if the dirty map holds keys missing from `entries`
    pub(crate) amended: bool,
}

impl<K, V, S> ReadOnly<K, V, S> {
    pub(crate) fn new(entries: Arc<EntryMap<K, V, S>>, amended: bool) -> ReadOnly<K, V, S> {
        ReadOnly { entries, amended }
    }
}

/// The snapshot as seen by one operation. A map that has never been written
/// to has no snapshot at all, which reads as empty and not amended.
pub(crate) struct Snapshot<'g, K, V, S> {
    read_only: Option<&'g ReadOnly<K, V, S>>,
}

impl<'g, K, V, S> Clone for Snapshot<'g, K, V, S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'g, K, V, S> Copy for Snapshot<'g, K, V, S> {}

impl<'g, K, V, S> Snapshot<'g, K, V, S> {
    pub(crate) fn new(read_only: Option<&'g ReadOnly<K, V, S>>) -> Snapshot<'g, K, V, S> {
        Snapshot { read_only }
    }

    pub(crate) fn is_amended(self) -> bool {
        self.read_only.map_or(false, |r| r.amended)
    }

    pub(crate) fn is_empty(self) -> bool {
        self.len() == 0
    }

    pub(crate) fn len(self) -> usize {
        self.read_only.map_or(0, |r| r.entries.len())
    }

    pub(crate) fn entries(self) -> Option<&'g Arc<EntryMap<K, V, S>>> {
        self.read_only.map(|r| &r.entries)
    }
}

impl<'g, K: Hash + Eq, V, S: BuildHasher> Snapshot<'g, K, V, S> {
    pub(crate) fn get<Q: ?Sized + Hash + Eq>(self, key: &Q) -> Option<&'g Arc<Entry<V>>>
    where
        K: Borrow<Q>,
    {
        self.read_only.and_then(|r| r.entries.get(key))
    }
}

/// Keys written since the last promotion, plus every live entry of the
/// snapshot it was built from. `entries` is `None` right after a promotion.
pub(crate) struct DirtyMap<K, V, S> {
    pub(crate) entries: Option<EntryMap<K, V, S>>,
    pub(crate) misses: usize,
}

impl<K, V, S> DirtyMap<K, V, S> {
    pub(crate) const fn new() -> DirtyMap<K, V, S> {
        DirtyMap {
            entries: None,
            misses: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.as_ref().map_or(0, HashMap::len)
    }
}

impl<K: Hash + Eq, V, S: BuildHasher + Clone> DirtyMap<K, V, S> {
    pub(crate) fn get<Q: ?Sized + Hash + Eq>(&self, key: &Q) -> Option<&Arc<Entry<V>>>
    where
        K: Borrow<Q>,
    {
        self.entries.as_ref().and_then(|e| e.get(key))
    }

    pub(crate) fn remove<Q: ?Sized + Hash + Eq>(&mut self, key: &Q) -> Option<Arc<Entry<V>>>
    where
        K: Borrow<Q>,
    {
        self.entries.as_mut().and_then(|e| e.remove(key))
    }

    pub(crate) fn insert(&mut self, key: K, entry: Arc<Entry<V>>, build_hasher: &S) {
        self.entries
            .get_or_insert_with(|| EntryMap::with_hasher(build_hasher.clone()))
            .insert(key, entry);
    }
}
