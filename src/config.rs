//! Agent configuration, loaded from a JSON file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use vecagent_core::{DistanceType, IndexProperties, ObjectType};

use crate::error::{AgentError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Directory holding the index files. `None` keeps everything in memory.
    pub index_path: Option<PathBuf>,
    pub enable_in_memory_mode: bool,

    pub dimension: usize,
    pub distance_type: DistanceType,
    pub object_type: ObjectType,
    pub creation_edge_size: usize,
    pub search_edge_size: usize,

    /// Check timer period. 0 disables auto-commit.
    pub auto_index_check_duration_ms: u64,
    /// Forced create-and-save period. 0 means never.
    pub auto_index_duration_limit_ms: u64,
    /// Periodic save period. 0 means never.
    pub auto_save_index_duration_ms: u64,
    /// Pending inserts that trigger a commit on the check timer. 0 disables auto-commit.
    pub auto_index_length: u64,
    pub initial_delay_ms: u64,
    pub default_pool_size: usize,

    pub default_radius: f32,
    pub default_epsilon: f32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            index_path: None,
            enable_in_memory_mode: false,
            dimension: 128,
            distance_type: DistanceType::L2,
            object_type: ObjectType::Float,
            creation_edge_size: 20,
            search_edge_size: 10,
            auto_index_check_duration_ms: 30_000,
            auto_index_duration_limit_ms: 24 * 60 * 60 * 1000,
            auto_save_index_duration_ms: 30 * 60 * 1000,
            auto_index_length: 100,
            initial_delay_ms: 0,
            default_pool_size: 10,
            default_radius: -1.0,
            default_epsilon: 0.1,
        }
    }
}

impl AgentConfig {
    /// Read and validate a JSON config file. Missing fields take their defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .map_err(|err| AgentError::Config(format!("cannot read {}: {err}", path.display())))?;
        let config: AgentConfig = serde_json::from_slice(&bytes)
            .map_err(|err| AgentError::Config(format!("invalid config {}: {err}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.dimension == 0 {
            return Err(AgentError::Config("dimension must be > 0".into()));
        }
        if self.creation_edge_size == 0 || self.search_edge_size == 0 {
            return Err(AgentError::Config("edge sizes must be > 0".into()));
        }
        if !self.default_epsilon.is_finite() || !self.default_radius.is_finite() {
            return Err(AgentError::Config("default epsilon and radius must be finite".into()));
        }
        Ok(())
    }

    /// Directory that saves go to, if any.
    pub fn persistent_path(&self) -> Option<&Path> {
        if self.enable_in_memory_mode {
            return None;
        }
        self.index_path.as_deref()
    }

    pub fn index_properties(&self) -> IndexProperties {
        IndexProperties {
            dimension: self.dimension,
            distance_type: self.distance_type,
            object_type: self.object_type,
            creation_edge_size: self.creation_edge_size,
            search_edge_size: self.search_edge_size,
            default_epsilon: self.default_epsilon,
            default_radius: self.default_radius,
        }
    }

    pub fn auto_commit_enabled(&self) -> bool {
        self.auto_index_check_duration_ms > 0 && self.auto_index_length > 0
    }

    pub fn auto_index_check_duration(&self) -> Duration {
        Duration::from_millis(self.auto_index_check_duration_ms)
    }

    pub fn auto_index_duration_limit(&self) -> Duration {
        Duration::from_millis(self.auto_index_duration_limit_ms)
    }

    pub fn auto_save_index_duration(&self) -> Duration {
        Duration::from_millis(self.auto_save_index_duration_ms)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config: AgentConfig = serde_json::from_str(r#"{"dimension": 4, "distance_type": "cosine"}"#).unwrap();
        assert_eq!(config.dimension, 4);
        assert_eq!(config.distance_type, DistanceType::Cosine);
        assert_eq!(config.auto_index_length, 100);
        assert_eq!(config.auto_index_check_duration(), Duration::from_secs(30));
        assert!(config.auto_commit_enabled());
    }

    #[test]
    fn test_from_file_validates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("agent.json");
        std::fs::write(&path, r#"{"dimension": 0}"#).unwrap();
        assert!(matches!(AgentConfig::from_file(&path), Err(AgentError::Config(_))));

        std::fs::write(&path, r#"{"dimension": 3, "index_path": "/tmp/idx"}"#).unwrap();
        let config = AgentConfig::from_file(&path).unwrap();
        assert_eq!(config.persistent_path(), Some(Path::new("/tmp/idx")));
    }

    #[test]
    fn test_in_memory_mode_hides_path() {
        let config = AgentConfig {
            index_path: Some(PathBuf::from("/tmp/idx")),
            enable_in_memory_mode: true,
            ..AgentConfig::default()
        };
        assert_eq!(config.persistent_path(), None);
    }

    #[test]
    fn test_auto_commit_disabled_by_zero() {
        let no_check = AgentConfig {
            auto_index_check_duration_ms: 0,
            ..AgentConfig::default()
        };
        let no_length = AgentConfig {
            auto_index_length: 0,
            ..AgentConfig::default()
        };
        assert!(!no_check.auto_commit_enabled());
        assert!(!no_length.auto_commit_enabled());
    }
}
