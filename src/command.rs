//! The replicated command vocabulary.
//!
//! A [`Command`] is the unit of replicated mutation: it is what the
//! coordination service serializes into the Raft log and what the state
//! machine applies to the local backend on every node. Read operations
//! (search, existence checks) never become commands — they are served from
//! the local replica without consensus.
//!
//! Commands must be idempotent under repeated application: an `apply`
//! timeout leaves the commit status ambiguous to the caller, so retrying the
//! same command (same collection, same id) must never produce a second
//! effect.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Distance function of a collection, fixed at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistanceFunction {
    Cosine,
    Euclidean,
    InnerProduct,
}

impl DistanceFunction {
    /// Parse the wire-level distance name. Case-insensitive.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "cosine" => Some(DistanceFunction::Cosine),
            "euclidean" | "l2" => Some(DistanceFunction::Euclidean),
            "innerproduct" | "inner_product" | "dot" => Some(DistanceFunction::InnerProduct),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DistanceFunction::Cosine => "Cosine",
            DistanceFunction::Euclidean => "Euclidean",
            DistanceFunction::InnerProduct => "InnerProduct",
        }
    }
}

impl fmt::Display for DistanceFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A replicated mutation, applied in log order on every node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    CreateCollection {
        collection_name: String,
        vector_dimension: u32,
        distance_function: DistanceFunction,
        payload_table_schema: String,
    },
    Insert {
        collection_name: String,
        id: i64,
        vector: Vec<f32>,
        payload_insert_query: String,
    },
    Delete {
        collection_name: String,
        id: i64,
    },
    DropCollection {
        collection_name: String,
    },
}

impl Command {
    /// Stable label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Command::CreateCollection { .. } => "create_collection",
            Command::Insert { .. } => "insert",
            Command::Delete { .. } => "delete",
            Command::DropCollection { .. } => "drop_collection",
        }
    }

    pub fn collection_name(&self) -> &str {
        match self {
            Command::CreateCollection {
                collection_name, ..
            }
            | Command::Insert {
                collection_name, ..
            }
            | Command::Delete {
                collection_name, ..
            }
            | Command::DropCollection { collection_name } => collection_name,
        }
    }
}

/// State machine response after applying a command.
///
/// A `success = false` response is a report to the originating caller, not a
/// control input: the log entry stays applied either way.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    pub success: bool,
    pub message: String,
}

impl CommandResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Request validation, run by the coordination handlers before any command is
/// proposed. A validation failure never reaches consensus.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("collection name must not be empty")]
    EmptyCollectionName,
    #[error("vector dimension must be positive, got {0}")]
    NonPositiveDimension(i32),
    #[error("unknown distance function {0:?}")]
    UnknownDistance(String),
    #[error("vector must not be empty")]
    EmptyVector,
    #[error("vector has {actual} dimensions but collection {collection:?} expects {expected}")]
    DimensionMismatch {
        collection: String,
        expected: u32,
        actual: usize,
    },
    #[error("top_k must be positive, got {0}")]
    NonPositiveTopK(i32),
}

pub fn validate_collection_name(name: &str) -> Result<(), ValidationError> {
    if name.trim().is_empty() {
        return Err(ValidationError::EmptyCollectionName);
    }
    Ok(())
}

pub fn validate_create_collection(
    name: &str,
    distance: &str,
    dimension: i32,
) -> Result<(DistanceFunction, u32), ValidationError> {
    validate_collection_name(name)?;
    if dimension <= 0 {
        return Err(ValidationError::NonPositiveDimension(dimension));
    }
    let distance = DistanceFunction::parse(distance)
        .ok_or_else(|| ValidationError::UnknownDistance(distance.to_string()))?;
    Ok((distance, dimension as u32))
}

/// `expected_dimension` is the declared dimension of the target collection
/// when this node knows it; when the collection is unknown locally (e.g.
/// right after a snapshot restore) the dimension check is deferred to the
/// backend, which rejects mismatches deterministically at apply time.
pub fn validate_insert(
    name: &str,
    vector: &[f32],
    expected_dimension: Option<u32>,
) -> Result<(), ValidationError> {
    validate_collection_name(name)?;
    if vector.is_empty() {
        return Err(ValidationError::EmptyVector);
    }
    if let Some(expected) = expected_dimension {
        if vector.len() != expected as usize {
            return Err(ValidationError::DimensionMismatch {
                collection: name.to_string(),
                expected,
                actual: vector.len(),
            });
        }
    }
    Ok(())
}

pub fn validate_search(name: &str, vector: &[f32], top_k: i32) -> Result<(), ValidationError> {
    validate_collection_name(name)?;
    if vector.is_empty() {
        return Err(ValidationError::EmptyVector);
    }
    if top_k <= 0 {
        return Err(ValidationError::NonPositiveTopK(top_k));
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_names_parse_case_insensitively() {
        assert_eq!(
            DistanceFunction::parse("cosine"),
            Some(DistanceFunction::Cosine)
        );
        assert_eq!(
            DistanceFunction::parse("Euclidean"),
            Some(DistanceFunction::Euclidean)
        );
        assert_eq!(
            DistanceFunction::parse("InnerProduct"),
            Some(DistanceFunction::InnerProduct)
        );
        assert_eq!(DistanceFunction::parse("manhattan"), None);
    }

    #[test]
    fn command_serializes_roundtrip() {
        let cmd = Command::Insert {
            collection_name: "users".into(),
            id: 7,
            vector: vec![1.0, 2.0, 3.0, 4.0],
            payload_insert_query: "insert into users(name) values ('Alice')".into(),
        };
        let j = serde_json::to_string(&cmd).unwrap();
        let back: Command = serde_json::from_str(&j).unwrap();
        assert!(matches!(back, Command::Insert { id: 7, .. }));
        assert_eq!(back.kind(), "insert");
        assert_eq!(back.collection_name(), "users");
    }

    #[test]
    fn empty_collection_name_rejected() {
        assert_eq!(
            validate_collection_name("  "),
            Err(ValidationError::EmptyCollectionName)
        );
        assert!(validate_collection_name("users").is_ok());
    }

    #[test]
    fn create_collection_validation() {
        assert!(validate_create_collection("users", "cosine", 4).is_ok());
        assert_eq!(
            validate_create_collection("users", "cosine", 0),
            Err(ValidationError::NonPositiveDimension(0))
        );
        assert_eq!(
            validate_create_collection("users", "chebyshev", 4),
            Err(ValidationError::UnknownDistance("chebyshev".into()))
        );
    }

    #[test]
    fn insert_dimension_mismatch_detected_locally() {
        let err = validate_insert("c", &[1.0, 2.0, 3.0], Some(4)).unwrap_err();
        assert_eq!(
            err,
            ValidationError::DimensionMismatch {
                collection: "c".into(),
                expected: 4,
                actual: 3,
            }
        );
        // Unknown collection defers the check to the backend.
        assert!(validate_insert("c", &[1.0, 2.0, 3.0], None).is_ok());
    }

    #[test]
    fn search_validation() {
        assert!(validate_search("c", &[1.0], 3).is_ok());
        assert_eq!(
            validate_search("c", &[1.0], 0),
            Err(ValidationError::NonPositiveTopK(0))
        );
        assert_eq!(
            validate_search("c", &[], 3),
            Err(ValidationError::EmptyVector)
        );
    }
}
