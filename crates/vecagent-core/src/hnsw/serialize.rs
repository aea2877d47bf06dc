//! Graph persistence (`graph.hnsw`)
//!
//! The file is an 8 byte magic ("VAGRAPH1") followed by a bincode
//! [`GraphSnapshot`]. Vectors are not part of the graph file; they live in
//! the object file and are reattached through the accessor on load.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::index::VectorAccessor;
use super::node::Node;
use super::HNSW;
use crate::distance::DistanceType;

const GRAPH_MAGIC: [u8; 8] = *b"VAGRAPH1";

#[derive(Error, Debug)]
pub enum GraphFileError {
    #[error("Invalid graph magic: expected VAGRAPH1")]
    InvalidMagic,

    #[error("graph encoding failed: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// On-disk shape of the graph topology.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub nodes: Vec<Node>,
    pub entry_point: Option<u32>,
    pub max_layer: usize,
    pub m: usize,
    pub m0: usize,
    pub ef_construction: usize,
    pub metric: DistanceType,
}

impl HNSW {
    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            nodes: self.nodes.clone(),
            entry_point: self.entry_point,
            max_layer: self.max_layer,
            m: self.m,
            m0: self.m0,
            ef_construction: self.ef_construction,
            metric: self.metric(),
        }
    }

    pub fn from_snapshot(snapshot: GraphSnapshot, accessor: VectorAccessor) -> Self {
        HNSW::from_parts(
            snapshot.nodes,
            snapshot.entry_point,
            snapshot.max_layer,
            snapshot.m,
            snapshot.m0,
            snapshot.ef_construction,
            snapshot.metric,
            accessor,
        )
    }

    /// Save the graph topology to a file and fsync it.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), GraphFileError> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&GRAPH_MAGIC)?;
        bincode::serialize_into(&mut writer, &self.snapshot())?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Load the graph topology, resolving vectors through `accessor`.
    pub fn load<P: AsRef<Path>>(path: P, accessor: VectorAccessor) -> Result<Self, GraphFileError> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if magic != GRAPH_MAGIC {
            return Err(GraphFileError::InvalidMagic);
        }
        let snapshot: GraphSnapshot = bincode::deserialize_from(&mut reader)?;
        Ok(Self::from_snapshot(snapshot, accessor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn grid() -> Arc<Vec<Vec<f32>>> {
        Arc::new((0..64).map(|i| vec![(i % 8) as f32, (i / 8) as f32]).collect())
    }

    fn accessor(vectors: Arc<Vec<Vec<f32>>>) -> VectorAccessor {
        Box::new(move |id, sink| {
            if let Some(v) = (id as usize).checked_sub(1).and_then(|i| vectors.get(i)) {
                sink(v);
            }
        })
    }

    #[test]
    fn test_save_and_load_preserves_topology() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("graph.hnsw");
        let vectors = grid();

        let mut hnsw = HNSW::new_with_seed(8, 40, DistanceType::L1, accessor(vectors.clone()), 3);
        for id in 1..=64 {
            hnsw.insert(id);
        }
        hnsw.save(&path).unwrap();

        let loaded = HNSW::load(&path, accessor(vectors.clone())).unwrap();
        assert_eq!(loaded.len(), 64);
        assert_eq!(loaded.entry_point, hnsw.entry_point);
        assert_eq!(loaded.metric(), DistanceType::L1);
        assert_eq!(
            loaded.search(&vectors[20], 3, 32),
            hnsw.search(&vectors[20], 3, 32)
        );
    }

    #[test]
    fn test_load_rejects_foreign_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("graph.hnsw");
        std::fs::write(&path, b"NOTAGRAPH-------").unwrap();

        let err = HNSW::load(&path, accessor(grid()));
        assert!(matches!(err, Err(GraphFileError::InvalidMagic)));
    }
}
