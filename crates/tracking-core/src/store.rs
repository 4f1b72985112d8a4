//! [`Store`] is the keyed reference-counted container backing both the
//! process table and the file tracking table.
//!
//! - entries are handed out as [`Ref`] guards; cloning a `Ref` is a "get",
//!   dropping it is a "put"
//! - the table itself owns one reference to every entry it contains
//! - when the last reference goes away the entry's `Drop` implementation
//!   runs. This never happens while the table lock is held
//! - iteration is two-phase: references are collected under the read lock
//!   and the visitor runs after the lock is released
//!
//! ```
//! use tracking_core::store::{Keyed, Store};
//!
//! struct Entry(u32);
//!
//! impl Keyed for Entry {
//!     type Key = u32;
//!     fn key(&self) -> u32 {
//!         self.0
//!     }
//! }
//!
//! let store = Store::new("example", 16);
//! let entry = store.insert(Entry(7)).into_ref();
//! assert_eq!(tracking_core::store::Ref::ref_count(&entry), 2);
//! drop(store.remove(&7));
//! assert_eq!(tracking_core::store::Ref::ref_count(&entry), 1);
//! ```

use std::{
    collections::{HashMap, hash_map::Entry},
    fmt::{self, Debug},
    hash::Hash,
    ops::{ControlFlow, Deref},
    sync::{Arc, RwLock},
};

use crate::sync::{read, write};

/// Types which can be stored in a [`Store`].
pub trait Keyed {
    type Key: Eq + Hash + Clone + Debug;

    fn key(&self) -> Self::Key;
}

/// A counted reference to a store entry.
pub struct Ref<V>(Arc<V>);

impl<V> Ref<V> {
    /// Number of live references, including the one owned by the table
    /// if the entry is still inserted.
    pub fn ref_count(this: &Self) -> usize {
        Arc::strong_count(&this.0)
    }

    /// True if both references point to the same entry instance.
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        Arc::ptr_eq(&this.0, &other.0)
    }

    /// Release this reference.
    pub fn put(self) {}
}

impl<V> Clone for Ref<V> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<V> Deref for Ref<V> {
    type Target = V;

    fn deref(&self) -> &V {
        &self.0
    }
}

impl<V: Debug> Debug for Ref<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Outcome of [`Store::insert`].
pub enum Insert<V> {
    /// The new value is now in the table
    Inserted(Ref<V>),
    /// Another caller inserted the same key first; this is its entry
    Raced(Ref<V>),
}

impl<V> Insert<V> {
    pub fn into_ref(self) -> Ref<V> {
        match self {
            Insert::Inserted(entry) | Insert::Raced(entry) => entry,
        }
    }

    pub fn is_inserted(&self) -> bool {
        matches!(self, Insert::Inserted(_))
    }
}

pub struct Store<V: Keyed> {
    name: &'static str,
    table: RwLock<HashMap<V::Key, Arc<V>>>,
}

impl<V: Keyed> Store<V> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            table: RwLock::new(HashMap::with_capacity(capacity)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Insert `value` unless its key is already present.
    ///
    /// A caller losing the race gets the existing entry back and its own
    /// value is dropped once the lock has been released.
    pub fn insert(&self, value: V) -> Insert<V> {
        let value = Arc::new(value);
        let key = value.key();
        let winner = {
            let mut table = write(&self.table);
            match table.entry(key.clone()) {
                Entry::Occupied(existing) => Some(Arc::clone(existing.get())),
                Entry::Vacant(slot) => {
                    slot.insert(Arc::clone(&value));
                    None
                }
            }
        };
        match winner {
            Some(winner) => {
                log::info!("{}: entry already exists {:?}", self.name, key);
                drop(value);
                Insert::Raced(Ref(winner))
            }
            None => Insert::Inserted(Ref(value)),
        }
    }

    pub fn get(&self, key: &V::Key) -> Option<Ref<V>> {
        read(&self.table).get(key).cloned().map(Ref)
    }

    /// Remove the entry with the given key. The table's reference is
    /// handed over to the caller.
    pub fn remove(&self, key: &V::Key) -> Option<Ref<V>> {
        let removed = write(&self.table).remove(key);
        removed.map(Ref)
    }

    /// Remove `entry` only if the table still holds this very instance.
    pub fn remove_entry(&self, entry: &Ref<V>) -> bool {
        let removed = {
            let mut table = write(&self.table);
            match table.entry(entry.key()) {
                Entry::Occupied(slot) if Arc::ptr_eq(slot.get(), &entry.0) => Some(slot.remove()),
                _ => None,
            }
        };
        removed.is_some()
    }

    pub fn len(&self) -> usize {
        read(&self.table).len()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.table).is_empty()
    }

    /// References to every entry, taken under the read lock.
    pub fn snapshot(&self) -> Vec<Ref<V>> {
        read(&self.table).values().cloned().map(Ref).collect()
    }

    /// Visit every entry. The visitor runs without the table lock held, so
    /// it may use the store, but entries inserted meanwhile are not seen.
    pub fn for_each<F>(&self, mut visitor: F) -> ControlFlow<()>
    where
        F: FnMut(&Ref<V>) -> ControlFlow<()>,
    {
        for entry in self.snapshot() {
            if visitor(&entry).is_break() {
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    /// Empty the table. `report` is called for every entry together with
    /// the number of references still held outside the table.
    pub fn shutdown<F>(&self, mut report: F)
    where
        F: FnMut(&V, usize),
    {
        let drained: Vec<Arc<V>> = write(&self.table).drain().map(|(_, v)| v).collect();
        for entry in drained {
            let outstanding = Arc::strong_count(&entry) - 1;
            if outstanding > 0 {
                log::warn!(
                    "{}: entry {:?} still has {} references on shutdown",
                    self.name,
                    entry.key(),
                    outstanding
                );
            }
            report(&entry, outstanding);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Barrier,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    struct Counted<'a> {
        key: u32,
        tag: &'static str,
        dropped: &'a AtomicUsize,
    }

    impl Keyed for Counted<'_> {
        type Key = u32;
        fn key(&self) -> u32 {
            self.key
        }
    }

    impl Drop for Counted<'_> {
        fn drop(&mut self) {
            self.dropped.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counted<'a>(key: u32, tag: &'static str, dropped: &'a AtomicUsize) -> Counted<'a> {
        Counted { key, tag, dropped }
    }

    #[test]
    fn refcount_tracks_gets_and_puts() {
        let dropped = AtomicUsize::new(0);
        let store = Store::new("test", 4);
        let first = store.insert(counted(1, "a", &dropped)).into_ref();
        assert_eq!(Ref::ref_count(&first), 2);
        let second = store.get(&1).unwrap();
        assert_eq!(Ref::ref_count(&first), 3);
        second.put();
        assert_eq!(Ref::ref_count(&first), 2);
        drop(store.remove(&1));
        assert_eq!(Ref::ref_count(&first), 1);
        assert_eq!(dropped.load(Ordering::SeqCst), 0);
        drop(first);
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
        assert!(store.get(&1).is_none());
    }

    #[test]
    fn race_loser_gets_winner() {
        let dropped = AtomicUsize::new(0);
        let store = Store::new("test", 4);
        let winner = store.insert(counted(1, "winner", &dropped));
        assert!(winner.is_inserted());
        let loser = store.insert(counted(1, "loser", &dropped));
        assert!(!loser.is_inserted());
        let loser = loser.into_ref();
        assert_eq!(loser.tag, "winner");
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn concurrent_inserts_keep_one_entry() {
        let dropped = AtomicUsize::new(0);
        let store = Store::new("test", 4);
        let barrier = Barrier::new(8);
        let refs: Vec<Ref<Counted<'_>>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        store.insert(counted(9, "racer", &dropped)).into_ref()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(store.len(), 1);
        assert!(refs.iter().all(|r| Ref::ptr_eq(r, &refs[0])));
        assert_eq!(dropped.load(Ordering::SeqCst), 7);
        assert_eq!(Ref::ref_count(&refs[0]), 9);
    }

    #[test]
    fn remove_entry_ignores_other_instance() {
        let dropped = AtomicUsize::new(0);
        let store = Store::new("test", 4);
        let old = store.insert(counted(5, "old", &dropped)).into_ref();
        assert!(store.remove_entry(&old));
        let new = store.insert(counted(5, "new", &dropped)).into_ref();
        assert!(!store.remove_entry(&old));
        assert!(Ref::ptr_eq(&store.get(&5).unwrap(), &new));
    }

    #[test]
    fn for_each_stops_early_and_holds_references() {
        let dropped = AtomicUsize::new(0);
        let store = Store::new("test", 4);
        for key in 0..5 {
            store.insert(counted(key, "x", &dropped));
        }
        let mut visited = 0;
        let flow = store.for_each(|entry| {
            // The lock is not held: mutating the table is allowed
            drop(store.remove(&entry.key));
            visited += 1;
            if visited == 3 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });
        assert_eq!(flow, ControlFlow::Break(()));
        assert_eq!(visited, 3);
        assert_eq!(store.len(), 2);
        assert_eq!(dropped.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn shutdown_reports_outstanding() {
        let dropped = AtomicUsize::new(0);
        let store = Store::new("test", 4);
        let held = store.insert(counted(1, "held", &dropped)).into_ref();
        store.insert(counted(2, "free", &dropped));
        let mut reports = Vec::new();
        store.shutdown(|entry, outstanding| reports.push((entry.key, outstanding)));
        reports.sort();
        assert_eq!(reports, vec![(1, 1), (2, 0)]);
        assert!(store.is_empty());
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
        drop(held);
        assert_eq!(dropped.load(Ordering::SeqCst), 2);
    }
}
