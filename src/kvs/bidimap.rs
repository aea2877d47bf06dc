//! Sharded uuid <-> ObjectId bijection.
//!
//! Each direction is split over 512 [`CowMap`] shards: uuids are placed by
//! the low bits of their xxh3 hash, ObjectIds by their own low bits.
//! Both directions are written on every change, but not as one transaction:
//! a reader can briefly see one direction without the other.

use std::sync::atomic::{AtomicU64, Ordering};

use vecagent_core::ObjectId;
use xxhash_rust::xxh3::xxh3_64;

use super::cow::CowMap;

const SHARDS: usize = 512;
const MASK: u64 = SHARDS as u64 - 1;

pub struct BidiMap {
    uo: Box<[CowMap<String, ObjectId>]>,
    ou: Box<[CowMap<ObjectId, String>]>,
    len: AtomicU64,
}

impl Default for BidiMap {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn uuid_shard(uuid: &str) -> usize {
    (xxh3_64(uuid.as_bytes()) & MASK) as usize
}

#[inline]
fn oid_shard(oid: ObjectId) -> usize {
    (oid as u64 & MASK) as usize
}

impl BidiMap {
    pub fn new() -> Self {
        Self {
            uo: (0..SHARDS).map(|_| CowMap::new()).collect(),
            ou: (0..SHARDS).map(|_| CowMap::new()).collect(),
            len: AtomicU64::new(0),
        }
    }

    pub fn get(&self, uuid: &str) -> Option<ObjectId> {
        self.uo[uuid_shard(uuid)].load(uuid)
    }

    pub fn get_inverse(&self, oid: ObjectId) -> Option<String> {
        self.ou[oid_shard(oid)].load(&oid)
    }

    /// Bind `uuid` and `oid` in both directions.
    ///
    /// The caller must unbind a uuid before binding it again; rebinding
    /// leaves the old ObjectId pointing at the uuid.
    pub fn set(&self, uuid: String, oid: ObjectId) {
        self.ou[oid_shard(oid)].store(oid, uuid.clone());
        if self.uo[uuid_shard(&uuid)].store(uuid, oid).is_none() {
            self.len.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Unbind by uuid, returning the ObjectId it was bound to.
    pub fn delete(&self, uuid: &str) -> Option<ObjectId> {
        let oid = self.uo[uuid_shard(uuid)].delete(uuid)?;
        self.ou[oid_shard(oid)].delete(&oid);
        self.decrement();
        Some(oid)
    }

    /// Unbind by ObjectId, returning the uuid it was bound to.
    pub fn delete_inverse(&self, oid: ObjectId) -> Option<String> {
        let uuid = self.ou[oid_shard(oid)].delete(&oid)?;
        if self.uo[uuid_shard(&uuid)].delete(uuid.as_str()).is_some() {
            self.decrement();
        }
        Some(uuid)
    }

    fn decrement(&self) {
        let _ = self
            .len
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)));
    }

    /// Visit every uuid -> ObjectId pair until `f` returns false.
    pub fn range<F>(&self, mut f: F)
    where
        F: FnMut(&str, ObjectId) -> bool,
    {
        let mut more = true;
        for shard in self.uo.iter() {
            shard.range(|uuid, oid| {
                more = f(uuid.as_str(), oid);
                more
            });
            if !more {
                break;
            }
        }
    }

    /// Approximate number of bound pairs.
    pub fn len(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
