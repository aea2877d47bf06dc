//! ANN index facade used by the agent engine.
//!
//! [`AnnIndex`] is the narrow batch interface the commit engine drives.
//! [`GraphIndex`] implements it with an in-memory object space plus an HNSW
//! graph, persisted as three files in the index directory:
//!
//! ```text
//! <dir>/objects.vdb      object records (see format.rs)
//! <dir>/graph.hnsw       graph topology (bincode)
//! <dir>/properties.json  IndexProperties
//! ```

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::distance::{DistanceType, ObjectType};
use crate::format::{read_objects, FormatError, ObjectWriter};
use crate::hnsw::{GraphFileError, HNSW};

/// Identifier assigned by the index. `0` is never assigned.
pub type ObjectId = u32;

pub const OBJECTS_FILE: &str = "objects.vdb";
pub const GRAPH_FILE: &str = "graph.hnsw";
pub const PROPERTIES_FILE: &str = "properties.json";

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("index is closed")]
    Closed,

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("object {0} not found")]
    ObjectNotFound(ObjectId),

    #[error("object id space exhausted")]
    IdSpaceExhausted,

    #[error("incompatible index properties: {0}")]
    IncompatibleProperties(String),

    #[error("object file error: {0}")]
    Format(#[from] FormatError),

    #[error("graph file error: {0}")]
    Graph(#[from] GraphFileError),

    #[error("properties file error: {0}")]
    Properties(#[from] serde_json::Error),

    #[error("thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// One search result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchHit {
    pub id: ObjectId,
    pub distance: f32,
}

/// Batch-oriented ANN index driven by the commit engine.
pub trait AnnIndex: Send + Sync {
    /// Approximate k-NN. `epsilon == 0` / `radius == 0` select the index defaults.
    fn search(&self, query: &[f32], k: usize, epsilon: f32, radius: f32) -> Result<Vec<SearchHit>, IndexError>;

    fn get_vector(&self, id: ObjectId) -> Result<Vec<f32>, IndexError>;

    /// Store vectors. Returns one id per input in input order; `0` marks a
    /// failed entry whose error is in the second vector.
    fn bulk_insert(&self, vectors: &[Vec<f32>]) -> (Vec<ObjectId>, Vec<IndexError>);

    /// Remove objects, best effort. Returns one error per failed id.
    fn bulk_remove(&self, ids: &[ObjectId]) -> Vec<IndexError>;

    /// Make stored objects searchable and repair the graph after removals.
    fn create_index(&self, pool_size: usize) -> Result<(), IndexError>;

    fn save_index(&self) -> Result<(), IndexError>;

    fn close(&self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn dimension(&self) -> usize;
}

/// Build and search parameters, persisted as `properties.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexProperties {
    pub dimension: usize,
    pub distance_type: DistanceType,
    pub object_type: ObjectType,
    pub creation_edge_size: usize,
    pub search_edge_size: usize,
    pub default_epsilon: f32,
    pub default_radius: f32,
}

impl Default for IndexProperties {
    fn default() -> Self {
        Self {
            dimension: 128,
            distance_type: DistanceType::L2,
            object_type: ObjectType::Float,
            creation_edge_size: 20,
            search_edge_size: 10,
            default_epsilon: 0.1,
            default_radius: -1.0,
        }
    }
}

impl IndexProperties {
    fn check_compatible(&self, stored: &IndexProperties) -> Result<(), IndexError> {
        if self.dimension != stored.dimension {
            return Err(IndexError::IncompatibleProperties(format!(
                "dimension {} on disk, {} requested",
                stored.dimension, self.dimension
            )));
        }
        if self.distance_type != stored.distance_type || self.object_type != stored.object_type {
            return Err(IndexError::IncompatibleProperties(format!(
                "{:?}/{:?} on disk, {:?}/{:?} requested",
                stored.distance_type, stored.object_type, self.distance_type, self.object_type
            )));
        }
        Ok(())
    }
}

/// Stored vectors plus id allocation.
#[derive(Default)]
struct ObjectSpace {
    objects: HashMap<ObjectId, Vec<f32>>,
    free: BTreeSet<ObjectId>,
    next_id: ObjectId,
}

impl ObjectSpace {
    fn from_records(records: Vec<(ObjectId, Vec<f32>)>) -> Self {
        let objects: HashMap<_, _> = records.into_iter().collect();
        let max = objects.keys().copied().max().unwrap_or(0);
        let free = (1..max).filter(|id| !objects.contains_key(id)).collect();
        Self {
            objects,
            free,
            next_id: max + 1,
        }
    }

    fn allocate(&mut self) -> Option<ObjectId> {
        if let Some(id) = self.free.pop_first() {
            return Some(id);
        }
        if self.next_id == ObjectId::MAX {
            return None;
        }
        let id = self.next_id.max(1);
        self.next_id = id + 1;
        Some(id)
    }

    fn release(&mut self, id: ObjectId) -> Option<Vec<f32>> {
        let vector = self.objects.remove(&id)?;
        self.free.insert(id);
        Some(vector)
    }
}

struct GraphState {
    graph: HNSW,
    /// Stored but not yet linked
    pending: Vec<ObjectId>,
    /// Linked nodes that lost edges to removals
    damaged: HashSet<ObjectId>,
}

/// HNSW-backed [`AnnIndex`].
pub struct GraphIndex {
    props: IndexProperties,
    path: Option<PathBuf>,
    objects: Arc<RwLock<ObjectSpace>>,
    state: RwLock<GraphState>,
    closed: AtomicBool,
}

fn accessor_for(objects: &Arc<RwLock<ObjectSpace>>) -> impl Fn(u32, &mut dyn FnMut(&[f32])) + Send + Sync + 'static {
    let objects = Arc::clone(objects);
    move |id, sink| {
        if let Some(v) = objects.read().objects.get(&id) {
            sink(v);
        }
    }
}

impl GraphIndex {
    /// Open the index stored in `path`, or create an empty one.
    ///
    /// Without a path the index lives in memory and `save_index` is a no-op.
    pub fn open(path: Option<&Path>, props: IndexProperties) -> Result<Self, IndexError> {
        if props.dimension == 0 {
            return Err(IndexError::IncompatibleProperties("dimension must be > 0".into()));
        }

        let Some(dir) = path else {
            return Ok(Self::empty(None, props));
        };

        let props_path = dir.join(PROPERTIES_FILE);
        if !props_path.exists() {
            fs::create_dir_all(dir)?;
            info!(path = %dir.display(), "creating new index");
            return Ok(Self::empty(Some(dir.to_path_buf()), props));
        }

        let stored: IndexProperties = serde_json::from_slice(&fs::read(&props_path)?)?;
        props.check_compatible(&stored)?;

        let objects_path = dir.join(OBJECTS_FILE);
        let space = if objects_path.exists() {
            let (header, records) = read_objects(&objects_path)?;
            if header.dimensions as usize != props.dimension {
                return Err(FormatError::DimensionMismatch {
                    expected: props.dimension,
                    actual: header.dimensions as usize,
                }
                .into());
            }
            ObjectSpace::from_records(records)
        } else {
            ObjectSpace::default()
        };
        let objects = Arc::new(RwLock::new(space));

        let graph_path = dir.join(GRAPH_FILE);
        let graph = if graph_path.exists() {
            HNSW::load(&graph_path, Box::new(accessor_for(&objects)))?
        } else {
            HNSW::new(
                props.creation_edge_size,
                props.creation_edge_size * 4,
                props.distance_type,
                accessor_for(&objects),
            )
        };

        let mut pending: Vec<ObjectId> = objects
            .read()
            .objects
            .keys()
            .copied()
            .filter(|id| !graph.contains(*id))
            .collect();
        pending.sort_unstable();

        info!(
            path = %dir.display(),
            objects = objects.read().objects.len(),
            linked = graph.len(),
            pending = pending.len(),
            "opened index"
        );

        Ok(Self {
            props,
            path: Some(dir.to_path_buf()),
            objects,
            state: RwLock::new(GraphState {
                graph,
                pending,
                damaged: HashSet::new(),
            }),
            closed: AtomicBool::new(false),
        })
    }

    fn empty(path: Option<PathBuf>, props: IndexProperties) -> Self {
        let objects = Arc::new(RwLock::new(ObjectSpace::default()));
        let graph = HNSW::new(
            props.creation_edge_size,
            props.creation_edge_size * 4,
            props.distance_type,
            accessor_for(&objects),
        );
        Self {
            props,
            path,
            objects,
            state: RwLock::new(GraphState {
                graph,
                pending: Vec::new(),
                damaged: HashSet::new(),
            }),
            closed: AtomicBool::new(false),
        }
    }

    pub fn properties(&self) -> &IndexProperties {
        &self.props
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Number of stored objects waiting for `create_index`.
    pub fn pending_len(&self) -> usize {
        self.state.read().pending.len()
    }

    #[inline]
    fn ensure_open(&self) -> Result<(), IndexError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(IndexError::Closed);
        }
        Ok(())
    }

    fn check_dimension(&self, v: &[f32]) -> Result<(), IndexError> {
        if v.len() != self.props.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.props.dimension,
                actual: v.len(),
            });
        }
        Ok(())
    }

    fn prepare(&self, v: &[f32]) -> Vec<f32> {
        let mut out = v.to_vec();
        self.props.object_type.encode(&mut out);
        self.props.distance_type.prepare(&mut out);
        out
    }
}

/// Write through a temporary sibling of `path`, then rename it into place.
fn replace_file(path: &Path, write: impl FnOnce(&Path) -> Result<(), IndexError>) -> Result<(), IndexError> {
    let tmp = path.with_extension("tmp");
    write(&tmp)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

impl AnnIndex for GraphIndex {
    fn search(&self, query: &[f32], k: usize, epsilon: f32, radius: f32) -> Result<Vec<SearchHit>, IndexError> {
        self.ensure_open()?;
        self.check_dimension(query)?;

        let epsilon = if epsilon == 0.0 { self.props.default_epsilon } else { epsilon };
        let radius = if radius == 0.0 { self.props.default_radius } else { radius };
        let query = self.prepare(query);
        // Never wait behind a rebuild holding the write lock
        let Some(state) = self.state.try_read() else {
            debug!("search skipped: index is being rebuilt");
            return Ok(Vec::new());
        };
        let linked = state.graph.len();
        if linked == 0 {
            return Ok(Vec::new());
        }

        let k = k.min(linked);
        let width = (k.max(self.props.search_edge_size) as f64 * (1.0 + f64::from(epsilon.max(0.0))))
            .ceil()
            .min(linked as f64) as usize;
        Ok(state
            .graph
            .search(&query, k, width)
            .into_iter()
            .filter(|(_, d)| radius < 0.0 || *d <= radius)
            .map(|(id, distance)| SearchHit { id, distance })
            .collect())
    }

    fn get_vector(&self, id: ObjectId) -> Result<Vec<f32>, IndexError> {
        self.ensure_open()?;
        self.objects
            .read()
            .objects
            .get(&id)
            .cloned()
            .ok_or(IndexError::ObjectNotFound(id))
    }

    fn bulk_insert(&self, vectors: &[Vec<f32>]) -> (Vec<ObjectId>, Vec<IndexError>) {
        if let Err(err) = self.ensure_open() {
            return (vec![0; vectors.len()], vec![err]);
        }

        let mut ids = Vec::with_capacity(vectors.len());
        let mut errors = Vec::new();

        let mut state = self.state.write();
        let mut space = self.objects.write();
        for v in vectors {
            if let Err(err) = self.check_dimension(v) {
                ids.push(0);
                errors.push(err);
                continue;
            }
            let Some(id) = space.allocate() else {
                ids.push(0);
                errors.push(IndexError::IdSpaceExhausted);
                continue;
            };
            space.objects.insert(id, self.prepare(v));
            state.pending.push(id);
            ids.push(id);
        }

        debug!(inserted = ids.len() - errors.len(), failed = errors.len(), "bulk insert");
        (ids, errors)
    }

    fn bulk_remove(&self, ids: &[ObjectId]) -> Vec<IndexError> {
        if let Err(err) = self.ensure_open() {
            return vec![err];
        }

        let mut errors = Vec::new();
        let mut state = self.state.write();
        let mut removed = Vec::with_capacity(ids.len());
        {
            let mut space = self.objects.write();
            for &id in ids {
                match space.release(id) {
                    Some(_) => removed.push(id),
                    None => errors.push(IndexError::ObjectNotFound(id)),
                }
            }
        }

        let gone: HashSet<ObjectId> = removed.iter().copied().collect();
        let damaged = state.graph.remove(&removed);
        state.damaged.extend(damaged);
        state.damaged.retain(|id| !gone.contains(id));
        state.pending.retain(|id| !gone.contains(id));

        debug!(removed = removed.len(), failed = errors.len(), "bulk remove");
        errors
    }

    fn create_index(&self, pool_size: usize) -> Result<(), IndexError> {
        self.ensure_open()?;

        let pool = rayon::ThreadPoolBuilder::new().num_threads(pool_size).build()?;
        let mut state = self.state.write();
        let GraphState { graph, pending, damaged } = &mut *state;

        let repair: Vec<ObjectId> = damaged.drain().collect();
        let plans: Vec<(ObjectId, Vec<Vec<u32>>)> = {
            let graph = &*graph;
            pool.install(|| {
                repair
                    .par_iter()
                    .filter_map(|&id| graph.repair_plan(id).map(|plan| (id, plan)))
                    .collect()
            })
        };
        let repaired = plans.len();
        for (id, plan) in plans {
            graph.apply_repair(id, plan);
        }

        let mut linked = 0usize;
        for id in pending.drain(..) {
            if graph.insert(id) {
                linked += 1;
            }
        }

        debug!(repaired, linked, nodes = graph.len(), "index built");
        Ok(())
    }

    fn save_index(&self) -> Result<(), IndexError> {
        self.ensure_open()?;
        let Some(dir) = self.path.as_deref() else {
            return Ok(());
        };
        fs::create_dir_all(dir)?;

        let state = self.state.read();
        {
            let space = self.objects.read();
            let mut ids: Vec<ObjectId> = space.objects.keys().copied().collect();
            ids.sort_unstable();
            replace_file(&dir.join(OBJECTS_FILE), |tmp| {
                let mut writer = ObjectWriter::new(tmp, self.props.dimension)?;
                for id in &ids {
                    if let Some(v) = space.objects.get(id) {
                        writer.write_object(*id, v)?;
                    }
                }
                writer.finish()?;
                Ok(())
            })?;
        }
        replace_file(&dir.join(GRAPH_FILE), |tmp| Ok(state.graph.save(tmp)?))?;
        replace_file(&dir.join(PROPERTIES_FILE), |tmp| {
            fs::write(tmp, serde_json::to_vec_pretty(&self.props)?)?;
            Ok(())
        })?;

        info!(path = %dir.display(), nodes = state.graph.len(), "index saved");
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut state = self.state.write();
        state.pending.clear();
        state.damaged.clear();
        *self.objects.write() = ObjectSpace::default();
        debug!("index closed");
    }

    fn len(&self) -> usize {
        self.objects.read().objects.len()
    }

    fn dimension(&self) -> usize {
        self.props.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tempfile::tempdir;

    fn props(dimension: usize) -> IndexProperties {
        IndexProperties {
            dimension,
            ..IndexProperties::default()
        }
    }

    fn random_vectors(n: usize, dim: usize, seed: u64) -> Vec<Vec<f32>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n).map(|_| (0..dim).map(|_| rng.gen::<f32>()).collect()).collect()
    }

    #[test]
    fn test_ids_start_at_one_and_are_reused() {
        let index = GraphIndex::open(None, props(2)).unwrap();
        let (ids, errors) = index.bulk_insert(&[vec![0.0, 0.0], vec![1.0, 1.0], vec![2.0, 2.0]]);
        assert!(errors.is_empty());
        assert_eq!(ids, vec![1, 2, 3]);

        assert!(index.bulk_remove(&[2, 1]).is_empty());
        let (ids, _) = index.bulk_insert(&[vec![3.0, 3.0], vec![4.0, 4.0], vec![5.0, 5.0]]);
        assert_eq!(ids, vec![1, 2, 4]);
    }

    #[test]
    fn test_bulk_insert_reports_failures_in_place() {
        let index = GraphIndex::open(None, props(3)).unwrap();
        let (ids, errors) = index.bulk_insert(&[vec![1.0, 2.0, 3.0], vec![1.0], vec![4.0, 5.0, 6.0]]);
        assert_eq!(ids, vec![1, 0, 2]);
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], IndexError::DimensionMismatch { expected: 3, actual: 1 }));
    }

    #[test]
    fn test_objects_searchable_after_create_index() {
        let index = GraphIndex::open(None, props(8)).unwrap();
        let vectors = random_vectors(100, 8, 1);
        let (ids, _) = index.bulk_insert(&vectors);

        assert!(index.search(&vectors[5], 1, 0.0, 0.0).unwrap().is_empty());
        assert_eq!(index.pending_len(), 100);

        index.create_index(2).unwrap();
        assert_eq!(index.pending_len(), 0);
        let hits = index.search(&vectors[5], 3, 0.0, 0.0).unwrap();
        assert_eq!(hits[0].id, ids[5]);
        assert!(hits[0].distance < 1e-5);
    }

    #[test]
    fn test_radius_filters_hits() {
        let index = GraphIndex::open(None, props(1)).unwrap();
        index.bulk_insert(&[vec![0.0], vec![1.0], vec![5.0]]);
        index.create_index(1).unwrap();

        let near = index.search(&[0.0], 3, 0.0, 1.5).unwrap();
        assert_eq!(near.iter().map(|h| h.id).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(index.search(&[0.0], 3, 0.0, -1.0).unwrap().len(), 3);
    }

    #[test]
    fn test_remove_then_rebuild() {
        let index = GraphIndex::open(None, props(8)).unwrap();
        let vectors = random_vectors(200, 8, 2);
        index.bulk_insert(&vectors);
        index.create_index(4).unwrap();

        let gone: Vec<ObjectId> = (1..=100).collect();
        assert!(index.bulk_remove(&gone).is_empty());
        index.create_index(4).unwrap();

        assert_eq!(index.len(), 100);
        let hits = index.search(&vectors[150], 5, 0.0, 0.0).unwrap();
        assert_eq!(hits[0].id, 151);
        assert!(hits.iter().all(|h| h.id > 100));
        assert!(matches!(index.get_vector(3), Err(IndexError::ObjectNotFound(3))));
    }

    #[test]
    fn test_search_bounds_k_and_epsilon() {
        let index = GraphIndex::open(None, props(2)).unwrap();
        index.bulk_insert(&[vec![0.0, 0.0]]);
        index.create_index(1).unwrap();

        let hits = index.search(&[0.0, 0.0], 1, 1e30, 0.0).unwrap();
        assert_eq!(hits.len(), 1);
        let hits = index.search(&[0.0, 0.0], usize::MAX, 0.0, 0.0).unwrap();
        assert_eq!(hits, vec![SearchHit { id: 1, distance: 0.0 }]);
        let hits = index.search(&[0.0, 0.0], usize::MAX, f32::MAX, 0.0).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn test_search_does_not_wait_for_rebuild() {
        let index = GraphIndex::open(None, props(2)).unwrap();
        index.bulk_insert(&[vec![1.0, 1.0]]);
        index.create_index(1).unwrap();

        let rebuilding = index.state.write();
        assert!(index.search(&[1.0, 1.0], 1, 0.0, 0.0).unwrap().is_empty());
        drop(rebuilding);
        assert_eq!(index.search(&[1.0, 1.0], 1, 0.0, 0.0).unwrap().len(), 1);
    }

    #[test]
    fn test_bulk_remove_unknown_id() {
        let index = GraphIndex::open(None, props(2)).unwrap();
        index.bulk_insert(&[vec![1.0, 1.0]]);
        let errors = index.bulk_remove(&[1, 9]);
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], IndexError::ObjectNotFound(9)));
        assert!(index.is_empty());
    }

    #[test]
    fn test_uint8_objects_are_quantized() {
        let index = GraphIndex::open(
            None,
            IndexProperties {
                dimension: 3,
                object_type: ObjectType::Uint8,
                ..IndexProperties::default()
            },
        )
        .unwrap();
        let (ids, _) = index.bulk_insert(&[vec![1.4, 300.0, -2.0]]);
        assert_eq!(index.get_vector(ids[0]).unwrap(), vec![1.0, 255.0, 0.0]);
    }

    #[test]
    fn test_save_and_reopen() {
        let dir = tempdir().unwrap();
        let vectors = random_vectors(50, 4, 3);

        let expected = {
            let index = GraphIndex::open(Some(dir.path()), props(4)).unwrap();
            index.bulk_insert(&vectors);
            index.create_index(2).unwrap();
            index.bulk_insert(&random_vectors(2, 4, 4));
            index.save_index().unwrap();
            index.search(&vectors[10], 5, 0.0, 0.0).unwrap()
        };

        let reopened = GraphIndex::open(Some(dir.path()), props(4)).unwrap();
        assert_eq!(reopened.len(), 52);
        assert_eq!(reopened.pending_len(), 2);
        assert_eq!(reopened.search(&vectors[10], 5, 0.0, 0.0).unwrap(), expected);
        assert_eq!(reopened.get_vector(11).unwrap(), vectors[10]);
    }

    #[test]
    fn test_reopen_with_other_dimension_fails() {
        let dir = tempdir().unwrap();
        let index = GraphIndex::open(Some(dir.path()), props(4)).unwrap();
        index.save_index().unwrap();

        let err = GraphIndex::open(Some(dir.path()), props(8));
        assert!(matches!(err, Err(IndexError::IncompatibleProperties(_))));
    }

    #[test]
    fn test_closed_index_rejects_everything() {
        let index = GraphIndex::open(None, props(2)).unwrap();
        index.bulk_insert(&[vec![1.0, 1.0]]);
        index.close();

        assert!(matches!(index.search(&[1.0, 1.0], 1, 0.0, 0.0), Err(IndexError::Closed)));
        assert!(matches!(index.get_vector(1), Err(IndexError::Closed)));
        assert!(matches!(index.create_index(1), Err(IndexError::Closed)));
        let (ids, errors) = index.bulk_insert(&[vec![0.0, 0.0]]);
        assert_eq!(ids, vec![0]);
        assert!(matches!(errors[0], IndexError::Closed));
    }
}
