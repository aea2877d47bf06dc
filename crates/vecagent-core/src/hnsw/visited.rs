//! Thread-local visited sets for graph traversal.
//!
//! Each set is an epoch array indexed by ObjectId: marking is one store,
//! checking is one compare, and clearing bumps the epoch instead of zeroing.

use std::cell::RefCell;

/// Sets kept per thread; extra sets returned to the pool are dropped.
const POOL_LIMIT: usize = 4;

thread_local! {
    static POOL: RefCell<Vec<EpochSet>> = const { RefCell::new(Vec::new()) };
}

struct EpochSet {
    marks: Vec<u32>,
    epoch: u32,
}

impl EpochSet {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            marks: vec![0; capacity.max(1024)],
            epoch: 1,
        }
    }

    fn reset(&mut self) {
        self.epoch = self.epoch.wrapping_add(1);
        if self.epoch == 0 {
            self.marks.fill(0);
            self.epoch = 1;
        }
    }
}

/// A visited set borrowed from the thread-local pool; returned on drop.
pub struct VisitedGuard {
    set: Option<EpochSet>,
}

impl VisitedGuard {
    pub fn new(capacity: usize) -> Self {
        let set = POOL.with(|pool| {
            let mut pool = pool.borrow_mut();
            match pool.iter().position(|s| s.marks.len() >= capacity) {
                Some(idx) => {
                    let mut set = pool.swap_remove(idx);
                    set.reset();
                    set
                }
                None => EpochSet::with_capacity(capacity),
            }
        });
        Self { set: Some(set) }
    }

    #[inline(always)]
    pub fn is_visited(&self, id: u32) -> bool {
        match &self.set {
            Some(set) => set
                .marks
                .get(id as usize)
                .is_some_and(|&mark| mark == set.epoch),
            None => false,
        }
    }

    /// Mark `id`; returns false if it was already marked.
    #[inline(always)]
    pub fn visit(&mut self, id: u32) -> bool {
        let Some(set) = self.set.as_mut() else {
            return false;
        };
        let idx = id as usize;
        if idx >= set.marks.len() {
            let grown = (idx + 1).next_power_of_two().max(1024);
            set.marks.resize(grown, 0);
        }
        if set.marks[idx] == set.epoch {
            return false;
        }
        set.marks[idx] = set.epoch;
        true
    }
}

impl Drop for VisitedGuard {
    fn drop(&mut self) {
        if let Some(set) = self.set.take() {
            POOL.with(|pool| {
                let mut pool = pool.borrow_mut();
                if pool.len() < POOL_LIMIT {
                    pool.push(set);
                }
            });
        }
    }
}
