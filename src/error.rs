//! Errors returned by the agent engine.

use thiserror::Error;
use vecagent_core::{IndexError, ObjectId};

pub type Result<T, E = AgentError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("invalid uuid: uuid must not be empty")]
    InvalidUuid,

    #[error("uuid {0} already exists")]
    UuidAlreadyExists(String),

    #[error("uuid {0} not found")]
    UuidNotFound(String),

    #[error("object id for uuid {0} not found")]
    ObjectIdNotFound(String),

    #[error("no uuid bound to object id {0}")]
    UuidNotFoundForObject(ObjectId),

    #[error("object for uuid {uuid} not found: {source}")]
    ObjectNotFound { uuid: String, source: IndexError },

    #[error("invalid dimension size {got}, want {want}")]
    InvalidDimensionSize { got: usize, want: usize },

    #[error("invalid timestamp {0}")]
    InvalidTimestamp(i64),

    #[error("uncommitted index not found")]
    UncommittedIndexNotFound,

    #[error("config error: {0}")]
    Config(String),

    #[error("index error: {0}")]
    Index(#[from] IndexError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("{}", join_messages(.0))]
    Aggregate(Vec<AgentError>),
}

fn join_messages(errors: &[AgentError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<bincode::Error> for AgentError {
    fn from(err: bincode::Error) -> Self {
        AgentError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(err: serde_json::Error) -> Self {
        AgentError::Serialization(err.to_string())
    }
}

impl AgentError {
    /// Fold best-effort batch failures into one error.
    ///
    /// No errors gives `None`, a single error is returned unchanged and
    /// nested aggregates are flattened.
    pub fn combine<I>(errors: I) -> Option<AgentError>
    where
        I: IntoIterator<Item = AgentError>,
    {
        let mut flat = Vec::new();
        for err in errors {
            match err {
                AgentError::Aggregate(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => None,
            1 => flat.pop(),
            _ => Some(AgentError::Aggregate(flat)),
        }
    }

    /// `Ok(())` when `errors` is empty, otherwise the combined error.
    pub fn into_result<I>(errors: I) -> Result<()>
    where
        I: IntoIterator<Item = AgentError>,
    {
        match Self::combine(errors) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// True for the "nothing to commit" signal, also inside an aggregate.
    pub fn is_uncommitted_index_not_found(&self) -> bool {
        match self {
            AgentError::UncommittedIndexNotFound => true,
            AgentError::Aggregate(inner) => inner.iter().any(Self::is_uncommitted_index_not_found),
            _ => false,
        }
    }

    /// Number of leaf errors carried.
    pub fn count(&self) -> usize {
        match self {
            AgentError::Aggregate(inner) => inner.len(),
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combine_empty_and_single() {
        assert!(AgentError::combine(Vec::new()).is_none());

        let single = AgentError::combine(vec![AgentError::InvalidUuid]).unwrap();
        assert!(matches!(single, AgentError::InvalidUuid));
    }

    #[test]
    fn test_combine_flattens() {
        let nested = AgentError::Aggregate(vec![
            AgentError::UuidNotFound("a".into()),
            AgentError::UuidNotFound("b".into()),
        ]);
        let combined = AgentError::combine(vec![nested, AgentError::InvalidUuid]).unwrap();
        assert_eq!(combined.count(), 3);
        assert_eq!(
            combined.to_string(),
            "uuid a not found; uuid b not found; invalid uuid: uuid must not be empty"
        );
    }

    #[test]
    fn test_uncommitted_signal_detection() {
        assert!(AgentError::UncommittedIndexNotFound.is_uncommitted_index_not_found());
        let agg = AgentError::Aggregate(vec![
            AgentError::InvalidUuid,
            AgentError::UncommittedIndexNotFound,
        ]);
        assert!(agg.is_uncommitted_index_not_found());
        assert!(!AgentError::InvalidUuid.is_uncommitted_index_not_found());
    }

    #[test]
    fn test_into_result() {
        assert!(AgentError::into_result(Vec::new()).is_ok());
        assert!(AgentError::into_result(vec![AgentError::InvalidUuid]).is_err());
    }
}
