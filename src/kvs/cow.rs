//! Read-mostly concurrent map with a copy-on-write clean snapshot.
//!
//! ```text
//!   read  (ArcSwap) ──► ReadOnly { m: Arc<HashMap<K, Arc<Entry>>>, amended }
//!   dirty (Mutex)   ──► Option<HashMap<K, Arc<Entry>>>  + misses
//! ```
//!
//! Keys present in the clean snapshot are loaded, updated and deleted
//! without taking the mutex: each `Entry` holds its value in an atomically
//! swapped slot. New keys go to the dirty map, which holds every live key
//! once it exists. When misses against the clean snapshot reach the size of
//! the dirty map, the dirty map is promoted to be the new snapshot.
//!
//! A slot is `Value`, `Deleted` (tombstone, key may still be in dirty) or
//! `Expunged` (tombstone the dirty map was rebuilt without). An expunged
//! entry must be put back into dirty before it can be written again, or the
//! write would vanish at the next promotion.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;

enum Slot<V> {
    Value(V),
    Deleted,
    Expunged,
}

struct Entry<V> {
    slot: ArcSwap<Slot<V>>,
}

impl<V: Clone> Entry<V> {
    fn with_slot(slot: Arc<Slot<V>>) -> Self {
        Self {
            slot: ArcSwap::new(slot),
        }
    }

    fn load(&self) -> Option<V> {
        match &**self.slot.load() {
            Slot::Value(v) => Some(v.clone()),
            _ => None,
        }
    }

    /// Swap in `new` unless the entry is expunged.
    ///
    /// `None` means expunged; `Some(prev)` carries the replaced value.
    fn try_store(&self, new: &Arc<Slot<V>>) -> Option<Option<V>> {
        loop {
            let current = self.slot.load_full();
            if matches!(*current, Slot::Expunged) {
                return None;
            }
            let prev = self.slot.compare_and_swap(&current, Arc::clone(new));
            if Arc::ptr_eq(&*prev, &current) {
                return Some(value_of(&current));
            }
        }
    }

    /// Expunged -> Deleted. Caller holds the dirty lock.
    fn unexpunge_locked(&self) -> bool {
        let current = self.slot.load_full();
        if !matches!(*current, Slot::Expunged) {
            return false;
        }
        let prev = self.slot.compare_and_swap(&current, Arc::new(Slot::Deleted));
        Arc::ptr_eq(&*prev, &current)
    }

    /// Unconditional swap. Caller holds the dirty lock and the entry is not expunged.
    fn swap_locked(&self, new: Arc<Slot<V>>) -> Option<V> {
        value_of(&self.slot.swap(new))
    }

    /// Tombstone the entry if its value satisfies `pred`, returning that value.
    fn delete_if<F: Fn(&V) -> bool>(&self, pred: F) -> Option<V> {
        loop {
            let current = self.slot.load_full();
            match &*current {
                Slot::Value(v) if pred(v) => {
                    let prev = self.slot.compare_and_swap(&current, Arc::new(Slot::Deleted));
                    if Arc::ptr_eq(&*prev, &current) {
                        return Some(v.clone());
                    }
                }
                _ => return None,
            }
        }
    }

    /// Deleted -> Expunged. Returns true if the entry ends up expunged.
    fn try_expunge_locked(&self) -> bool {
        loop {
            let current = self.slot.load_full();
            match &*current {
                Slot::Expunged => return true,
                Slot::Value(_) => return false,
                Slot::Deleted => {
                    let prev = self.slot.compare_and_swap(&current, Arc::new(Slot::Expunged));
                    if Arc::ptr_eq(&*prev, &current) {
                        return true;
                    }
                }
            }
        }
    }
}

fn value_of<V: Clone>(slot: &Slot<V>) -> Option<V> {
    match slot {
        Slot::Value(v) => Some(v.clone()),
        _ => None,
    }
}

struct ReadOnly<K, V> {
    m: Arc<HashMap<K, Arc<Entry<V>>>>,
    /// True when dirty holds keys that `m` lacks
    amended: bool,
}

struct Dirty<K, V> {
    map: Option<HashMap<K, Arc<Entry<V>>>>,
    misses: usize,
}

/// Concurrent map tuned for stable key sets with frequent reads.
pub struct CowMap<K, V> {
    read: ArcSwap<ReadOnly<K, V>>,
    dirty: Mutex<Dirty<K, V>>,
}

impl<K, V> Default for CowMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> CowMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            read: ArcSwap::from_pointee(ReadOnly {
                m: Arc::new(HashMap::new()),
                amended: false,
            }),
            dirty: Mutex::new(Dirty {
                map: None,
                misses: 0,
            }),
        }
    }

    /// Find the entry for `key`, falling back to dirty under the lock.
    /// `take` removes the key from dirty when it is found there.
    fn entry<Q>(&self, key: &Q, take: bool) -> Option<Arc<Entry<V>>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let read = self.read.load();
        if let Some(e) = read.m.get(key) {
            return Some(Arc::clone(e));
        }
        if !read.amended {
            return None;
        }

        let mut dirty = self.dirty.lock();
        let read = self.read.load_full();
        if let Some(e) = read.m.get(key) {
            return Some(Arc::clone(e));
        }
        if !read.amended {
            return None;
        }
        let found = match dirty.map.as_mut() {
            Some(m) if take => m.remove(key),
            Some(m) => m.get(key).cloned(),
            None => None,
        };
        self.miss_locked(&mut dirty);
        found
    }

    fn miss_locked(&self, dirty: &mut Dirty<K, V>) {
        dirty.misses += 1;
        let dirty_len = dirty.map.as_ref().map_or(0, HashMap::len);
        if dirty.misses < dirty_len {
            return;
        }
        let m = dirty.map.take().unwrap_or_default();
        self.read.store(Arc::new(ReadOnly {
            m: Arc::new(m),
            amended: false,
        }));
        dirty.misses = 0;
    }

    /// Rebuild dirty from the clean snapshot, expunging tombstones.
    fn dirty_locked(dirty: &mut Dirty<K, V>, read: &ReadOnly<K, V>) {
        if dirty.map.is_some() {
            return;
        }
        let mut m = HashMap::with_capacity(read.m.len());
        for (k, e) in read.m.iter() {
            if !e.try_expunge_locked() {
                m.insert(k.clone(), Arc::clone(e));
            }
        }
        dirty.map = Some(m);
    }

    pub fn load<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entry(key, false).and_then(|e| e.load())
    }

    /// Insert or replace. Returns the previous value.
    pub fn store(&self, key: K, value: V) -> Option<V> {
        let slot = Arc::new(Slot::Value(value));

        {
            let read = self.read.load();
            if let Some(e) = read.m.get(&key) {
                if let Some(prev) = e.try_store(&slot) {
                    return prev;
                }
            }
        }

        let mut dirty = self.dirty.lock();
        let read = self.read.load_full();
        if let Some(e) = read.m.get(&key) {
            if e.unexpunge_locked() {
                dirty
                    .map
                    .get_or_insert_with(HashMap::new)
                    .insert(key, Arc::clone(e));
            }
            return e.swap_locked(slot);
        }
        if let Some(e) = dirty.map.as_ref().and_then(|m| m.get(&key)) {
            return e.swap_locked(slot);
        }
        if !read.amended {
            Self::dirty_locked(&mut dirty, &read);
            self.read.store(Arc::new(ReadOnly {
                m: Arc::clone(&read.m),
                amended: true,
            }));
        }
        dirty
            .map
            .get_or_insert_with(HashMap::new)
            .insert(key, Arc::new(Entry::with_slot(slot)));
        None
    }

    /// Remove `key`, returning its value if it was present.
    pub fn delete<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entry(key, true).and_then(|e| e.delete_if(|_| true))
    }

    /// Remove `key` only if its current value satisfies `pred`.
    pub fn delete_if<Q, F>(&self, key: &Q, pred: F) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        F: Fn(&V) -> bool,
    {
        self.entry(key, false).and_then(|e| e.delete_if(pred))
    }

    /// Visit every live entry until `f` returns false.
    ///
    /// Promotes a pending dirty map first, so the walk itself is lock-free.
    /// Entries stored or deleted during the walk may or may not be seen.
    pub fn range<F>(&self, mut f: F)
    where
        F: FnMut(&K, V) -> bool,
    {
        let mut read = self.read.load_full();
        if read.amended {
            let mut dirty = self.dirty.lock();
            read = self.read.load_full();
            if read.amended {
                let promoted = Arc::new(ReadOnly {
                    m: Arc::new(dirty.map.take().unwrap_or_default()),
                    amended: false,
                });
                self.read.store(Arc::clone(&promoted));
                dirty.misses = 0;
                read = promoted;
            }
        }

        for (k, e) in read.m.iter() {
            if let Some(v) = e.load() {
                if !f(k, v) {
                    break;
                }
            }
        }
    }
}
