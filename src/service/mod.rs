//! Index service: buffers writes, commits them into the ANN index and
//! translates between caller uuids and index ObjectIds.
//!
//! # Write path
//!
//! ```text
//! insert/update/delete ──► insert cache / delete cache (uuid → vector, ts)
//!                                   │
//!                          create_index(pool_size)
//!                                   │
//!        deletes ≤ T ──► BidiMap.delete ──► index.bulk_remove
//!        inserts ≤ T ──► index.bulk_insert ──► BidiMap.set
//!                                   │
//!                         index.create_index(pool_size)
//! ```
//!
//! At most one commit runs at a time; a second caller sees the commit gate
//! and returns at once. Searches issued while a commit runs return nothing.

mod daemon;
pub mod metadata;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use vecagent_core::{AnnIndex, GraphIndex, ObjectId};

use crate::clock::{Clock, MAX_TIMESTAMP};
use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::kvs::BidiMap;
use crate::model::{AgentMetadata, Distance, SearchResponse};
use crate::vcache::{CacheEntry, VectorCache};

pub use daemon::AutoCommit;

/// Holds an atomic flag set for its lifetime.
struct FlagGuard<'a>(&'a AtomicBool);

impl<'a> FlagGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }

    /// Set the flag unconditionally.
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct IndexService {
    config: AgentConfig,
    path: Option<PathBuf>,
    dimension: usize,

    index: Box<dyn AnnIndex>,
    kvs: BidiMap,
    ivc: VectorCache,
    dvc: VectorCache,
    clock: Clock,

    /// Held by the one caller allowed to commit
    commit_gate: AtomicBool,
    /// Raised only while a commit mutates the index; searches return nothing then
    indexing: AtomicBool,
    saving: AtomicBool,
    /// Inserts accepted since the last commit started
    pending_inserts: AtomicU64,
    commit_count: AtomicU64,
    /// `commit_count` at the last successful save
    saved_count: AtomicU64,
    /// Serializes commits with saves
    persist: Mutex<()>,
}

impl IndexService {
    /// Open (or create) the graph index described by `config`.
    pub fn new(config: AgentConfig) -> Result<Self> {
        config.validate()?;
        let index = GraphIndex::open(config.persistent_path(), config.index_properties())?;
        Self::with_index(config, Box::new(index))
    }

    /// Build a service around an already opened index.
    ///
    /// Reloads the saved uuid mapping when the config names a directory and
    /// marks the saved state invalid until the next successful save.
    pub fn with_index(config: AgentConfig, index: Box<dyn AnnIndex>) -> Result<Self> {
        config.validate()?;
        if index.dimension() != config.dimension {
            return Err(AgentError::Config(format!(
                "index dimension {} does not match configured dimension {}",
                index.dimension(),
                config.dimension
            )));
        }

        let path = config.persistent_path().map(Path::to_path_buf);
        let kvs = BidiMap::new();
        if let Some(dir) = path.as_deref() {
            std::fs::create_dir_all(dir)?;
            for (uuid, oid) in metadata::load_kvs(dir)? {
                kvs.set(uuid, oid);
            }
            if let Some(prev) = metadata::load_metadata(dir)? {
                if prev.is_invalid {
                    tracing::warn!("previous agent run did not save cleanly: {}", dir.display());
                }
            }
            metadata::save_metadata(
                dir,
                &AgentMetadata {
                    is_invalid: true,
                    index_count: kvs.len(),
                },
            )?;
        }

        tracing::info!(
            objects = kvs.len(),
            dimension = config.dimension,
            in_memory = path.is_none(),
            "index service ready"
        );

        Ok(Self {
            dimension: config.dimension,
            path,
            config,
            index,
            kvs,
            ivc: VectorCache::new(),
            dvc: VectorCache::new(),
            clock: Clock::new(),
            commit_gate: AtomicBool::new(false),
            indexing: AtomicBool::new(false),
            saving: AtomicBool::new(false),
            pending_inserts: AtomicU64::new(0),
            commit_count: AtomicU64::new(0),
            saved_count: AtomicU64::new(0),
            persist: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// `t <= 0` means now. Timestamps past [`MAX_TIMESTAMP`] are rejected.
    fn resolve_time(&self, t: i64) -> Result<i64> {
        match t {
            t if t <= 0 => Ok(self.clock.now()),
            t if t > MAX_TIMESTAMP => Err(AgentError::InvalidTimestamp(t)),
            t => Ok(t),
        }
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(AgentError::InvalidDimensionSize {
                got: vector.len(),
                want: self.dimension,
            });
        }
        Ok(())
    }

    /// Bound and not pending deletion, or pending insertion.
    fn is_live(&self, uuid: &str) -> bool {
        self.ivc.load(uuid).is_some() || (self.kvs.get(uuid).is_some() && self.dvc.load(uuid).is_none())
    }

    // ---- insert ---------------------------------------------------------

    pub fn insert(&self, uuid: &str, vector: Vec<f32>) -> Result<()> {
        self.insert_with_time(uuid, vector, 0)
    }

    /// Buffer an insert stamped `t` (`t <= 0` means now).
    pub fn insert_with_time(&self, uuid: &str, vector: Vec<f32>, t: i64) -> Result<()> {
        if uuid.is_empty() {
            return Err(AgentError::InvalidUuid);
        }
        self.check_dimension(&vector)?;
        if self.is_live(uuid) {
            return Err(AgentError::UuidAlreadyExists(uuid.to_string()));
        }
        self.insert_at(uuid, vector, self.resolve_time(t)?)
    }

    /// Buffer without the duplicate check.
    fn insert_at(&self, uuid: &str, vector: Vec<f32>, t: i64) -> Result<()> {
        if uuid.is_empty() {
            return Err(AgentError::InvalidUuid);
        }
        self.check_dimension(&vector)?;
        self.clock.observe(t);
        self.ivc.store(uuid.to_string(), CacheEntry::new(vector, t));
        self.pending_inserts.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub fn insert_multiple(&self, vectors: HashMap<String, Vec<f32>>) -> Result<()> {
        self.insert_multiple_with_time(vectors, 0)
    }

    /// Insert every entry; failures are combined and never stop the batch.
    pub fn insert_multiple_with_time(&self, vectors: HashMap<String, Vec<f32>>, t: i64) -> Result<()> {
        let t = self.resolve_time(t)?;
        let errors = vectors
            .into_iter()
            .filter_map(|(uuid, vector)| self.insert_with_time(&uuid, vector, t).err());
        AgentError::into_result(errors)
    }

    // ---- update ---------------------------------------------------------

    pub fn update(&self, uuid: &str, vector: Vec<f32>) -> Result<()> {
        self.update_with_time(uuid, vector, 0)
    }

    /// Delete at `t`, then insert at `t + 1`.
    pub fn update_with_time(&self, uuid: &str, vector: Vec<f32>, t: i64) -> Result<()> {
        self.ready_for_update(uuid, &vector)?;
        let t = self.resolve_time(t)?;
        self.delete_at(uuid, t)?;
        self.insert_at(uuid, vector, t + 1)
    }

    /// Fails when the uuid is unknown or already holds exactly `vector`.
    fn ready_for_update(&self, uuid: &str, vector: &[f32]) -> Result<()> {
        if uuid.is_empty() {
            return Err(AgentError::InvalidUuid);
        }
        self.check_dimension(vector)?;

        let current = match self.ivc.load(uuid) {
            Some(pending) => pending.vector.clone(),
            None if self.dvc.load(uuid).is_some() => {
                return Err(AgentError::UuidNotFound(uuid.to_string()));
            }
            None => self.get_object(uuid).map_err(|err| match err {
                AgentError::ObjectIdNotFound(uuid) => AgentError::UuidNotFound(uuid),
                other => other,
            })?,
        };
        if current.as_slice() == vector {
            return Err(AgentError::UuidAlreadyExists(uuid.to_string()));
        }
        Ok(())
    }

    pub fn update_multiple(&self, vectors: HashMap<String, Vec<f32>>) -> Result<()> {
        self.update_multiple_with_time(vectors, 0)
    }

    /// Delete every ready uuid first, then insert them all.
    ///
    /// If an insert fails after its delete went through, that delete is
    /// withdrawn so the uuid is not left deleted-only.
    pub fn update_multiple_with_time(&self, vectors: HashMap<String, Vec<f32>>, t: i64) -> Result<()> {
        let t = self.resolve_time(t)?;
        let mut errors = Vec::new();

        let mut ready = Vec::with_capacity(vectors.len());
        for (uuid, vector) in vectors {
            match self.ready_for_update(&uuid, &vector) {
                Ok(()) => ready.push((uuid, vector)),
                Err(err) => errors.push(err),
            }
        }

        let mut deleted = Vec::with_capacity(ready.len());
        for (uuid, vector) in ready {
            match self.delete_at(&uuid, t) {
                Ok(()) => deleted.push((uuid, vector)),
                Err(err) => errors.push(err),
            }
        }

        for (uuid, vector) in deleted {
            // Unreachable while ready_for_update covers every insert_at check
            if let Err(err) = self.insert_at(&uuid, vector, t + 1) {
                self.dvc.delete_if(&uuid, |e| e.timestamp == t);
                errors.push(err);
            }
        }

        AgentError::into_result(errors)
    }

    // ---- delete ---------------------------------------------------------

    pub fn delete(&self, uuid: &str) -> Result<()> {
        self.delete_with_time(uuid, 0)
    }

    pub fn delete_with_time(&self, uuid: &str, t: i64) -> Result<()> {
        self.delete_at(uuid, self.resolve_time(t)?)
    }

    fn delete_at(&self, uuid: &str, t: i64) -> Result<()> {
        if uuid.is_empty() {
            return Err(AgentError::InvalidUuid);
        }
        self.clock.observe(t);

        loop {
            if self.kvs.get(uuid).is_some() {
                // Tombstone first: a commit binding this uuid checks for it
                self.dvc.store(uuid.to_string(), CacheEntry::tombstone(t));
                self.ivc.delete_if(uuid, |e| e.timestamp < t);
                return Ok(());
            }

            // Only pending: cancel the buffered insert, nothing to remove later
            match self.ivc.load(uuid) {
                None if self.kvs.get(uuid).is_some() => continue,
                None => return Err(AgentError::UuidNotFound(uuid.to_string())),
                Some(pending) if pending.timestamp >= t => {
                    tracing::debug!(uuid, "delete older than pending insert ignored");
                    return Ok(());
                }
                Some(_) => {
                    if self.ivc.delete_if(uuid, |e| e.timestamp < t).is_some() {
                        return Ok(());
                    }
                    // A commit bound it meanwhile
                }
            }
        }
    }

    pub fn delete_multiple(&self, uuids: &[String]) -> Result<()> {
        self.delete_multiple_with_time(uuids, 0)
    }

    pub fn delete_multiple_with_time(&self, uuids: &[String], t: i64) -> Result<()> {
        let t = self.resolve_time(t)?;
        let errors = uuids.iter().filter_map(|uuid| self.delete_at(uuid, t).err());
        AgentError::into_result(errors)
    }

    // ---- read -----------------------------------------------------------

    /// Approximate k-NN. Returns an empty response while a commit runs.
    pub fn search(&self, vector: &[f32], k: usize, epsilon: f32, radius: f32) -> Result<SearchResponse> {
        if self.is_indexing() {
            return Ok(SearchResponse::default());
        }
        self.check_dimension(vector)?;

        let hits = self.index.search(vector, k, epsilon, radius)?;
        if self.is_indexing() {
            return Ok(SearchResponse::default());
        }

        let mut results = Vec::with_capacity(hits.len());
        let mut errors = Vec::new();
        for hit in hits {
            match self.kvs.get_inverse(hit.id) {
                Some(id) => results.push(Distance {
                    id,
                    distance: hit.distance,
                }),
                None => {
                    tracing::warn!(oid = hit.id, "search hit has no uuid");
                    errors.push(AgentError::UuidNotFoundForObject(hit.id));
                }
            }
        }

        Ok(SearchResponse {
            results,
            error: AgentError::combine(errors),
        })
    }

    /// Search with the committed vector of `uuid` as the query.
    pub fn search_by_id(&self, uuid: &str, k: usize, epsilon: f32, radius: f32) -> Result<SearchResponse> {
        let vector = self.get_object(uuid)?;
        self.search(&vector, k, epsilon, radius)
    }

    /// Committed vector of `uuid` as stored by the index.
    pub fn get_object(&self, uuid: &str) -> Result<Vec<f32>> {
        let oid = self
            .kvs
            .get(uuid)
            .ok_or_else(|| AgentError::ObjectIdNotFound(uuid.to_string()))?;
        self.index
            .get_vector(oid)
            .map_err(|source| AgentError::ObjectNotFound {
                uuid: uuid.to_string(),
                source,
            })
    }

    /// ObjectId bound to `uuid`, if committed.
    pub fn exists(&self, uuid: &str) -> Option<ObjectId> {
        self.kvs.get(uuid)
    }

    /// uuid bound to `oid`, if any.
    pub fn uuid_of(&self, oid: ObjectId) -> Option<String> {
        self.kvs.get_inverse(oid)
    }

    // ---- commit ---------------------------------------------------------

    /// Apply buffered deletes and inserts to the index, then rebuild it.
    ///
    /// Returns `UncommittedIndexNotFound` when nothing is buffered. Returns
    /// `Ok` immediately when another commit is already running. Per-item
    /// failures do not stop the commit and are returned combined.
    pub fn create_index(&self, pool_size: usize) -> Result<()> {
        if self.ivc.is_empty() && self.dvc.is_empty() {
            return Err(AgentError::UncommittedIndexNotFound);
        }
        let Some(_gate) = FlagGuard::acquire(&self.commit_gate) else {
            tracing::debug!("create index skipped: commit already running");
            return Ok(());
        };
        // A running save finishes first; searches keep working meanwhile
        let _persist = self.persist.lock();
        // A commit that finished in between may have drained everything
        if self.ivc.is_empty() && self.dvc.is_empty() {
            return Err(AgentError::UncommittedIndexNotFound);
        }
        let _indexing = FlagGuard::raise(&self.indexing);

        let started = Instant::now();
        // Reset before taking T so no insert stamped after T is forgotten
        self.pending_inserts.store(0, Ordering::Release);
        let t = self.clock.now();
        tracing::info!("create index operation started");

        let mut errors = Vec::new();
        let removed = self.apply_deletes(t, &mut errors);
        let (inserted, dropped) = self.apply_inserts(t, &mut errors);

        tracing::debug!(pool_size, "building index");
        if let Err(err) = self.index.create_index(pool_size) {
            errors.push(err.into());
        }
        self.commit_count.fetch_add(1, Ordering::AcqRel);

        tracing::info!(
            removed,
            inserted,
            dropped,
            errors = errors.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "create index operation finished"
        );
        AgentError::into_result(errors)
    }

    /// Unbind and remove every uuid deleted at or before `t`.
    fn apply_deletes(&self, t: i64, errors: &mut Vec<AgentError>) -> usize {
        let mut batch = Vec::with_capacity(self.dvc.len() as usize);
        self.dvc.range(|uuid, entry| {
            if entry.timestamp <= t {
                self.ivc
                    .delete_if(uuid, |ins| ins.timestamp < t && ins.timestamp < entry.timestamp);
                batch.push((uuid.to_string(), entry.timestamp));
            }
            true
        });

        let mut oids = Vec::with_capacity(batch.len());
        for (uuid, ts) in &batch {
            match self.kvs.delete(uuid) {
                Some(oid) => oids.push(oid),
                None => errors.push(AgentError::ObjectIdNotFound(uuid.clone())),
            }
            self.dvc.delete_if(uuid, |e| e.timestamp == *ts);
        }
        tracing::debug!(uuids = batch.len(), oids = oids.len(), "delete phase");

        if !oids.is_empty() {
            errors.extend(self.index.bulk_remove(&oids).into_iter().map(AgentError::from));
        }
        oids.len()
    }

    /// Insert every vector buffered at or before `t` and bind the new ids.
    /// Returns `(bound, dropped)`.
    fn apply_inserts(&self, t: i64, errors: &mut Vec<AgentError>) -> (usize, usize) {
        let mut batch: Vec<(String, Arc<CacheEntry>)> = Vec::with_capacity(self.ivc.len() as usize);
        self.ivc.range(|uuid, entry| {
            if entry.timestamp <= t {
                batch.push((uuid.to_string(), entry));
            }
            true
        });
        if batch.is_empty() {
            return (0, 0);
        }
        batch.sort_by(|a, b| a.1.timestamp.cmp(&b.1.timestamp).then_with(|| a.0.cmp(&b.0)));

        // A uuid still bound here would break the bijection once rebound
        let stale: Vec<ObjectId> = batch.iter().filter_map(|(uuid, _)| self.kvs.delete(uuid)).collect();
        if !stale.is_empty() {
            tracing::warn!(count = stale.len(), "replacing bindings of re-inserted uuids");
            errors.extend(self.index.bulk_remove(&stale).into_iter().map(AgentError::from));
        }

        let vectors: Vec<Vec<f32>> = batch.iter().map(|(_, e)| e.vector.clone()).collect();
        let (oids, insert_errors) = self.index.bulk_insert(&vectors);
        errors.extend(insert_errors.into_iter().map(AgentError::from));

        let mut bound = 0;
        let mut dropped = 0;
        let mut cancelled = Vec::new();
        for ((uuid, entry), oid) in batch.iter().zip(oids) {
            let ts = entry.timestamp;
            if oid == 0 {
                self.ivc.delete_if(uuid, |e| e.timestamp == ts);
                tracing::warn!(uuid = uuid.as_str(), "index rejected insert, dropping it");
                dropped += 1;
                continue;
            }

            // Bind before leaving the cache so the uuid is always visible to delete
            self.kvs.set(uuid.clone(), oid);
            if self.ivc.delete_if(uuid, |e| e.timestamp == ts).is_some() {
                bound += 1;
                continue;
            }
            let tombstoned = self.dvc.load(uuid).is_some_and(|d| d.timestamp > ts);
            if tombstoned {
                bound += 1;
            } else if let Some(oid) = self.kvs.delete(uuid) {
                // Cancelled as a pending insert while the commit was running
                cancelled.push(oid);
            }
        }
        if !cancelled.is_empty() {
            errors.extend(self.index.bulk_remove(&cancelled).into_iter().map(AgentError::from));
        }
        tracing::debug!(bound, dropped, cancelled = cancelled.len(), "insert phase");
        (bound, dropped)
    }

    // ---- persistence ----------------------------------------------------

    /// Persist the index, the uuid mapping and the agent metadata.
    ///
    /// No-op without a persistent path or when nothing was committed since
    /// the last save. Never overlaps a commit.
    pub fn save_index(&self) -> Result<()> {
        let Some(dir) = self.path.as_deref() else {
            return Ok(());
        };
        if self.commit_count.load(Ordering::Acquire) == self.saved_count.load(Ordering::Acquire) {
            tracing::debug!("save skipped: no commit since last save");
            return Ok(());
        }

        let _persist = self.persist.lock();
        let Some(_saving) = FlagGuard::acquire(&self.saving) else {
            return Ok(());
        };
        let count = self.commit_count.load(Ordering::Acquire);
        let started = Instant::now();

        let pairs = self.pairs();
        let (kvs, index) = rayon::join(
            || metadata::save_kvs(dir, &pairs),
            || self.index.save_index().map_err(AgentError::from),
        );
        kvs?;
        index?;
        metadata::save_metadata(
            dir,
            &AgentMetadata {
                is_invalid: false,
                index_count: pairs.len() as u64,
            },
        )?;
        self.saved_count.store(count, Ordering::Release);

        tracing::info!(
            objects = pairs.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "index saved to {}",
            dir.display()
        );
        Ok(())
    }

    /// Commit then save. Having nothing to commit still saves.
    pub fn create_and_save_index(&self, pool_size: usize) -> Result<()> {
        match self.create_index(pool_size) {
            Err(err) if !err.is_uncommitted_index_not_found() => return Err(err),
            _ => {}
        }
        self.save_index()
    }

    /// Release the index. Buffered mutations are discarded.
    pub fn close(&self) {
        let pending = self.ivc.len() + self.dvc.len();
        if pending > 0 {
            tracing::warn!(pending, "closing with uncommitted mutations");
        }
        self.index.close();
    }

    fn pairs(&self) -> Vec<(String, ObjectId)> {
        let mut pairs = Vec::with_capacity(self.kvs.len() as usize);
        self.kvs.range(|uuid, oid| {
            pairs.push((uuid.to_string(), oid));
            true
        });
        pairs
    }

    // ---- introspection --------------------------------------------------

    /// Number of bound uuids.
    pub fn object_count(&self) -> u64 {
        self.kvs.len()
    }

    pub fn uuids(&self) -> Vec<String> {
        let mut uuids = Vec::with_capacity(self.kvs.len() as usize);
        self.kvs.range(|uuid, _| {
            uuids.push(uuid.to_string());
            true
        });
        uuids
    }

    pub fn pending_insert_count(&self) -> u64 {
        self.pending_inserts.load(Ordering::Acquire)
    }

    pub fn insert_vcache_len(&self) -> u64 {
        self.ivc.len()
    }

    pub fn delete_vcache_len(&self) -> u64 {
        self.dvc.len()
    }

    pub fn commit_count(&self) -> u64 {
        self.commit_count.load(Ordering::Acquire)
    }

    pub fn is_indexing(&self) -> bool {
        self.indexing.load(Ordering::Acquire)
    }

    pub fn is_saving(&self) -> bool {
        self.saving.load(Ordering::Acquire)
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn service(dimension: usize) -> IndexService {
        IndexService::new(AgentConfig {
            dimension,
            ..AgentConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_insert_validation() {
        let svc = service(2);
        assert!(matches!(svc.insert("", vec![1.0, 2.0]), Err(AgentError::InvalidUuid)));
        assert!(matches!(
            svc.insert("a", vec![1.0]),
            Err(AgentError::InvalidDimensionSize { got: 1, want: 2 })
        ));
        svc.insert("a", vec![1.0, 2.0]).unwrap();
        assert!(matches!(svc.insert("a", vec![3.0, 4.0]), Err(AgentError::UuidAlreadyExists(_))));
        assert_eq!(svc.pending_insert_count(), 1);
        assert_eq!(svc.insert_vcache_len(), 1);
    }

    #[test]
    fn test_delete_pending_insert_writes_no_tombstone() {
        let svc = service(2);
        svc.insert("a", vec![1.0, 2.0]).unwrap();
        svc.delete("a").unwrap();
        assert_eq!(svc.insert_vcache_len(), 0);
        assert_eq!(svc.delete_vcache_len(), 0);
        assert!(matches!(svc.delete("a"), Err(AgentError::UuidNotFound(_))));
    }

    #[test]
    fn test_update_pending_insert_replaces_vector() {
        let svc = service(2);
        svc.insert("a", vec![1.0, 2.0]).unwrap();
        svc.update("a", vec![5.0, 6.0]).unwrap();
        assert_eq!(svc.insert_vcache_len(), 1);

        svc.create_index(1).unwrap();
        assert_eq!(svc.get_object("a").unwrap(), vec![5.0, 6.0]);
    }

    #[test]
    fn test_update_identical_vector_is_skipped() {
        let svc = service(2);
        svc.insert("a", vec![1.0, 2.0]).unwrap();
        svc.create_index(1).unwrap();

        assert!(matches!(svc.update("a", vec![1.0, 2.0]), Err(AgentError::UuidAlreadyExists(_))));
        assert!(matches!(svc.update("missing", vec![1.0, 2.0]), Err(AgentError::UuidNotFound(_))));
        assert_eq!(svc.delete_vcache_len(), 0);
    }

    #[test]
    fn test_with_time_orders_delete_before_insert() {
        let svc = service(1);
        svc.insert_with_time("a", vec![1.0], 100).unwrap();
        svc.create_index(1).unwrap();

        svc.update_with_time("a", vec![2.0], 200).unwrap();
        svc.create_index(1).unwrap();
        assert_eq!(svc.get_object("a").unwrap(), vec![2.0]);
        assert_eq!(svc.object_count(), 1);
        assert_eq!(svc.commit_count(), 2);
    }

    #[test]
    fn test_reinsert_after_pending_delete() {
        let svc = service(1);
        svc.insert("a", vec![1.0]).unwrap();
        svc.create_index(1).unwrap();

        svc.delete("a").unwrap();
        svc.insert("a", vec![9.0]).unwrap();
        svc.create_index(1).unwrap();

        assert_eq!(svc.get_object("a").unwrap(), vec![9.0]);
        assert_eq!(svc.object_count(), 1);
        let oid = svc.exists("a").unwrap();
        assert_eq!(svc.uuid_of(oid).as_deref(), Some("a"));
    }

    #[test]
    fn test_update_multiple_collects_failures() {
        let svc = service(1);
        svc.insert("a", vec![1.0]).unwrap();
        svc.insert("b", vec![2.0]).unwrap();
        svc.create_index(1).unwrap();

        let batch: HashMap<String, Vec<f32>> = [
            ("a".to_string(), vec![10.0]),
            ("b".to_string(), vec![2.0]),
            ("c".to_string(), vec![3.0]),
        ]
        .into_iter()
        .collect();
        let err = svc.update_multiple(batch).unwrap_err();
        assert_eq!(err.count(), 2);

        svc.create_index(1).unwrap();
        assert_eq!(svc.get_object("a").unwrap(), vec![10.0]);
        assert_eq!(svc.get_object("b").unwrap(), vec![2.0]);
        assert!(svc.exists("c").is_none());
    }

    #[test]
    fn test_search_is_empty_while_indexing() {
        let svc = service(1);
        svc.insert("a", vec![1.0]).unwrap();
        svc.create_index(1).unwrap();

        let indexing = FlagGuard::raise(&svc.indexing);
        assert!(svc.search(&[1.0], 1, 0.0, 0.0).unwrap().is_empty());
        drop(indexing);
        assert_eq!(svc.search(&[1.0], 1, 0.0, 0.0).unwrap().results[0].id, "a");

        let gate = FlagGuard::acquire(&svc.commit_gate).unwrap();
        svc.insert("b", vec![2.0]).unwrap();
        svc.create_index(1).unwrap();
        assert!(svc.exists("b").is_none(), "commit must not run while another holds the gate");
        drop(gate);
        svc.create_index(1).unwrap();
        assert!(svc.exists("b").is_some());
    }

    #[test]
    fn test_commit_waiting_on_save_keeps_search_working() {
        let svc = Arc::new(service(1));
        svc.insert("a", vec![1.0]).unwrap();
        svc.create_index(1).unwrap();
        svc.insert("b", vec![2.0]).unwrap();

        let saving = svc.persist.lock();
        let committer = {
            let svc = Arc::clone(&svc);
            std::thread::spawn(move || svc.create_index(1))
        };
        while !svc.commit_gate.load(Ordering::Acquire) {
            std::thread::yield_now();
        }
        std::thread::sleep(Duration::from_millis(20));

        assert!(!svc.is_indexing());
        assert_eq!(svc.search(&[1.0], 1, 0.0, 0.0).unwrap().results[0].id, "a");
        assert!(svc.create_index(1).is_ok(), "a second caller returns at once");

        drop(saving);
        committer.join().unwrap().unwrap();
        assert!(svc.exists("b").is_some());
        assert_eq!(svc.commit_count(), 2);
    }

    #[test]
    fn test_timestamps_past_limit_are_rejected() {
        let svc = service(1);
        assert!(matches!(
            svc.insert_with_time("a", vec![1.0], i64::MAX),
            Err(AgentError::InvalidTimestamp(i64::MAX))
        ));
        svc.insert_with_time("a", vec![1.0], MAX_TIMESTAMP).unwrap();
        svc.insert("b", vec![2.0]).unwrap();
        svc.create_index(1).unwrap();

        assert!(matches!(
            svc.update_with_time("a", vec![3.0], i64::MAX),
            Err(AgentError::InvalidTimestamp(_))
        ));
        svc.update_with_time("a", vec![3.0], MAX_TIMESTAMP).unwrap();
        assert!(matches!(
            svc.delete_multiple_with_time(&["b".to_string()], i64::MAX - 1),
            Err(AgentError::InvalidTimestamp(_))
        ));
        assert_eq!(svc.delete_vcache_len(), 1);
        svc.create_index(1).unwrap();
        assert_eq!(svc.get_object("a").unwrap(), vec![3.0]);
        assert!(svc.exists("b").is_some());
    }

    #[test]
    fn test_update_multiple_rejects_before_deleting() {
        let svc = service(2);
        svc.insert("a", vec![1.0, 2.0]).unwrap();
        svc.create_index(1).unwrap();

        let batch: HashMap<String, Vec<f32>> = [("a".to_string(), vec![1.0])].into_iter().collect();
        assert!(matches!(
            svc.update_multiple(batch),
            Err(AgentError::InvalidDimensionSize { got: 1, want: 2 })
        ));
        assert_eq!(svc.delete_vcache_len(), 0);
        assert_eq!(svc.insert_vcache_len(), 0);
        assert_eq!(svc.get_object("a").unwrap(), vec![1.0, 2.0]);
    }

    #[test]
    fn test_in_memory_save_is_noop() {
        let svc = service(1);
        svc.insert("a", vec![1.0]).unwrap();
        svc.create_and_save_index(1).unwrap();
        assert!(!svc.is_saving());
        assert_eq!(svc.object_count(), 1);
    }
}
