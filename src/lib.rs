//! vecagent: the write-buffering and commit engine of an ANN search agent
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │        IndexService (insert · update · delete · search)     │
//! │          commit protocol  ·  auto-commit scheduler          │
//! └─────────────────────────────────────────────────────────────┘
//!          │                    │                     │
//!          ▼                    ▼                     ▼
//! ┌────────────────┐  ┌──────────────────┐  ┌───────────────────┐
//! │ VectorCache ×2 │  │ BidiMap (512 ×2) │  │ AnnIndex          │
//! │ insert/delete  │  │ uuid ↔ ObjectId  │  │ (vecagent-core)   │
//! └────────────────┘  └──────────────────┘  └───────────────────┘
//!          └──────── CowMap ────────┘
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod kvs;
pub mod model;
pub mod service;
pub mod vcache;

pub use config::AgentConfig;
pub use error::{AgentError, Result};
pub use model::{AgentMetadata, Distance, SearchResponse};
pub use service::{AutoCommit, IndexService};
pub use vecagent_core::{AnnIndex, GraphIndex, ObjectId};
