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

use std::{
    mem,
    ops::Deref,
    sync::{
        atomic::{self, Ordering},
        Arc,
    },
};

use crossbeam_epoch::{Atomic, Guard, Owned, Shared};

// set on a null value pointer once the entry has been left out of a dirty map
pub(crate) const EXPUNGED_TAG: usize = 0b1;

#[repr(align(2))]
#[derive(Debug)]
pub(crate) struct Value<V>(pub(crate) V);

impl<V> Value<V> {
    pub(crate) fn owned(value: V) -> Owned<Value<V>> {
        Owned::new(Value(value))
    }
}

/// A value slot shared between the read-only snapshot and the dirty map.
///
/// The slot is in one of three states:
///
/// * valid: the pointer is non-null and points to the current value.
/// * deleted: the pointer is null and untagged. Storing into the entry
///   revives it without touching either map.
/// * expunged: the pointer is null and tagged with [`EXPUNGED_TAG`]. The
///   entry was deleted when the dirty map was last rebuilt and is missing
///   from it, so it may only be revived with the dirty map lock held.
pub(crate) struct Entry<V> {
    value: Atomic<Value<V>>,
}

pub(crate) enum LoadOrStore<'a, V> {
    Loaded(&'a V),
    Stored(&'a V),
    Expunged(V),
}

impl<V> Entry<V> {
    pub(crate) fn new(value: V) -> Entry<V> {
        Entry::from_owned(Value::owned(value))
    }

    pub(crate) fn from_owned(value: Owned<Value<V>>) -> Entry<V> {
        Entry {
            value: Atomic::from(value),
        }
    }

    pub(crate) fn load<'a>(&'a self, guard: &'a Guard) -> Option<&'a V> {
        let current = self.value.load(Ordering::Acquire, guard);

        unsafe { current.as_ref() }.map(|v| &v.0)
    }

    /// Replaces the value unless the entry is expunged, in which case the new
    /// value is handed back so the caller can retry with the lock held.
    pub(crate) fn try_swap<'a>(
        &'a self,
        mut new_value: Owned<Value<V>>,
        guard: &'a Guard,
    ) -> Result<Option<&'a V>, Owned<Value<V>>> {
        let mut current = self.value.load(Ordering::Acquire, guard);

        loop {
            if is_expunged(current) {
                return Err(new_value);
            }

            match self.value.compare_exchange_weak(
                current,
                new_value,
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(_) => return Ok(unsafe { retire(guard, current) }),
                Err(e) => {
                    current = e.current;
                    new_value = e.new;
                }
            }
        }
    }

    /// Unconditionally replaces the value. The entry must not be expunged.
    pub(crate) fn swap_locked<'a>(
        &'a self,
        new_value: Owned<Value<V>>,
        guard: &'a Guard,
    ) -> Option<&'a V> {
        let previous = self.value.swap(new_value, Ordering::AcqRel, guard);
        assert!(!is_expunged(previous));

        unsafe { retire(guard, previous) }
    }

    /// Moves an expunged entry back to the deleted state. Returns `true` if the
    /// entry was expunged, meaning the caller must put it back into the dirty
    /// map before releasing the lock.
    pub(crate) fn unexpunge_locked(&self, guard: &Guard) -> bool {
        self.value
            .compare_exchange(
                Shared::null().with_tag(EXPUNGED_TAG),
                Shared::null(),
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            )
            .is_ok()
    }

    /// Moves a deleted entry to the expunged state. Returns `true` if the
    /// entry is expunged afterwards.
    pub(crate) fn try_expunge_locked(&self, guard: &Guard) -> bool {
        let mut current = self.value.load(Ordering::Acquire, guard);

        while current.is_null() && !is_expunged(current) {
            match self.value.compare_exchange_weak(
                current,
                Shared::null().with_tag(EXPUNGED_TAG),
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(_) => return true,
                Err(e) => current = e.current,
            }
        }

        is_expunged(current)
    }

    /// Returns the current value if there is one, otherwise stores `value`.
    ///
    /// Expunged entries are left alone and `value` is returned to the caller.
    pub(crate) fn try_load_or_store<'a>(
        &'a self,
        value: V,
        guard: &'a Guard,
    ) -> LoadOrStore<'a, V> {
        let mut current = self.value.load(Ordering::Acquire, guard);

        if is_expunged(current) {
            return LoadOrStore::Expunged(value);
        }

        if let Some(existing) = unsafe { current.as_ref() } {
            return LoadOrStore::Loaded(&existing.0);
        }

        let mut new_value = Value::owned(value);

        loop {
            match self.value.compare_exchange_weak(
                current,
                new_value,
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(stored) => return LoadOrStore::Stored(unsafe { &stored.deref().0 }),
                Err(e) => {
                    current = e.current;
                    new_value = e.new;

                    if is_expunged(current) {
                        return LoadOrStore::Expunged(new_value.into_box().0);
                    }

                    if let Some(existing) = unsafe { current.as_ref() } {
                        return LoadOrStore::Loaded(&existing.0);
                    }
                }
            }
        }
    }

    /// Marks the entry deleted, returning the value it held.
    pub(crate) fn delete<'a>(&'a self, guard: &'a Guard) -> Option<&'a V> {
        let mut current = self.value.load(Ordering::Acquire, guard);

        loop {
            if current.is_null() {
                return None;
            }

            match self.value.compare_exchange_weak(
                current,
                Shared::null(),
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(_) => return unsafe { retire(guard, current) },
                Err(e) => current = e.current,
            }
        }
    }

    pub(crate) fn try_compare_and_swap(&self, old: &V, new: V, guard: &Guard) -> bool
    where
        V: PartialEq,
    {
        let mut current = self.value.load(Ordering::Acquire, guard);

        if !holds(current, old) {
            return false;
        }

        let mut new_value = Value::owned(new);

        loop {
            match self.value.compare_exchange_weak(
                current,
                new_value,
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(_) => {
                    unsafe { retire(guard, current) };

                    return true;
                }
                Err(e) => {
                    current = e.current;
                    new_value = e.new;

                    if !holds(current, old) {
                        return false;
                    }
                }
            }
        }
    }

    pub(crate) fn compare_and_delete(&self, old: &V, guard: &Guard) -> bool
    where
        V: PartialEq,
    {
        let mut current = self.value.load(Ordering::Acquire, guard);

        while holds(current, old) {
            match self.value.compare_exchange_weak(
                current,
                Shared::null(),
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(_) => {
                    unsafe { retire(guard, current) };

                    return true;
                }
                Err(e) => current = e.current,
            }
        }

        false
    }

    #[cfg(test)]
    pub(crate) fn is_expunged(&self, guard: &Guard) -> bool {
        is_expunged(self.value.load(Ordering::Acquire, guard))
    }
}

impl<V> Drop for Entry<V> {
    fn drop(&mut self) {
        atomic::fence(Ordering::Acquire);

        // no reader can still be inside this entry: they either hold an Arc
        // to it or are pinned on a snapshot whose destruction is deferred
        let guard = unsafe { crossbeam_epoch::unprotected() };
        let current = self.value.swap(Shared::null(), Ordering::Relaxed, guard);

        if !current.is_null() {
            mem::drop(unsafe { current.into_owned() });
        }
    }
}

/// An entry found either in the snapshot, borrowed for the lifetime of the
/// guard, or in the dirty map, kept alive past the release of the lock.
pub(crate) enum EntryRef<'g, V> {
    Snapshot(&'g Entry<V>),
    Dirty(Arc<Entry<V>>),
}

impl<'g, V> Deref for EntryRef<'g, V> {
    type Target = Entry<V>;

    fn deref(&self) -> &Entry<V> {
        match self {
            EntryRef::Snapshot(entry) => entry,
            EntryRef::Dirty(entry) => entry,
        }
    }
}

fn is_expunged<V>(ptr: Shared<'_, Value<V>>) -> bool {
    ptr.tag() & EXPUNGED_TAG != 0
}

fn holds<V: PartialEq>(ptr: Shared<'_, Value<V>>, expected: &V) -> bool {
    match unsafe { ptr.as_ref() } {
        Some(value) => value.0 == *expected,
        None => false,
    }
}

// the returned reference stays valid until `guard` is unpinned
unsafe fn retire<'g, V>(guard: &'g Guard, ptr: Shared<'g, Value<V>>) -> Option<&'g V> {
    let value = ptr.as_ref()?;
    defer_acquire_destroy(guard, ptr);

    Some(&value.0)
}

pub(crate) unsafe fn defer_acquire_destroy<'g, T>(guard: &'g Guard, ptr: Shared<'g, T>) {
    assert!(!ptr.is_null());

    guard.defer_unchecked(move || {
        atomic::fence(Ordering::Acquire);
        mem::drop(ptr.into_owned());
    });
}
