use serde::{Deserialize, Serialize};

use crate::error::AgentError;

/// A search hit translated back to the caller's uuid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Distance {
    pub id: String,
    pub distance: f32,
}

/// Search results plus the non-fatal inconsistencies met while translating them.
#[derive(Debug, Default)]
pub struct SearchResponse {
    pub results: Vec<Distance>,
    /// ObjectIds the index returned that no uuid is bound to
    pub error: Option<AgentError>,
}

impl SearchResponse {
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }
}

/// Persisted next to the index; `is_invalid` stays set while unsaved changes may exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AgentMetadata {
    pub is_invalid: bool,
    pub index_count: u64,
}
