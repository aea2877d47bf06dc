//! HNSW (Hierarchical Navigable Small World) graph
//!
//! A multi-layer proximity graph over ObjectIds. Vectors are owned by the
//! caller and resolved through an accessor, so the graph stores topology only.
//!
//! ```text
//! Layer 2: ●─────────────────○   (few nodes, long-range)
//!          │                 │
//! Layer 1: ●───○───●───○─────●
//!          │   │   │   │     │
//! Layer 0: ●─●─●─●─●─●─●─●─●─● (every linked object)
//! ```

mod index;
mod node;
mod serialize;
mod visited;

pub use index::{VectorAccessor, HNSW};
pub use node::Node;
pub use serialize::{GraphFileError, GraphSnapshot};
