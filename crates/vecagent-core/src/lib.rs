//! vecagent-core – the ANN graph index behind an agent
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │            AnnIndex (batch insert / remove / build)         │
//! ├─────────────────────────────────────────────────────────────┤
//! │     GraphIndex: object space  ·  HNSW graph  ·  repair     │
//! ├─────────────────────────────────────────────────────────────┤
//! │   objects.vdb  ·  graph.hnsw  ·  properties.json           │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod distance;
pub mod format;
pub mod hnsw;
pub mod index;
pub mod simd;

pub use distance::{DistanceType, ObjectType};
pub use hnsw::HNSW;
pub use index::{AnnIndex, GraphIndex, IndexError, IndexProperties, ObjectId, SearchHit};
