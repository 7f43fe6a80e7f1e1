//! Allocation error taxonomy.

use metalloc_id::IdError;
use thiserror::Error;
use uuid::Uuid;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum AllocationError {
    /// A lookup identity is malformed or numeric.
    #[error("invalid identity '{identity}': {source}")]
    InvalidIdentity {
        identity: String,
        #[source]
        source: IdError,
    },

    #[error("{kind} {identity} could not be found")]
    NotFound { kind: &'static str, identity: String },

    /// Request validation failed.
    #[error("{0}")]
    BadRequest(String),

    /// A unique uuid or name is already taken.
    #[error("{0}")]
    Duplicate(String),

    /// An in-progress operation holds the node; the caller may retry.
    #[error("node {node} is locked by {lock}, please retry after the current operation is completed")]
    NodeLocked { node: Uuid, lock: String },

    #[error("no valid node found after considering {considered} candidate(s)")]
    NoValidNode { considered: usize },

    #[error("no valid node found: the inventory has no nodes with resource class {0}")]
    ResourceClassNotFound(String),

    #[error("{0}")]
    MethodNotAllowed(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AllocationError {
    pub fn not_found(kind: &'static str, identity: impl ToString) -> Self {
        AllocationError::NotFound {
            kind,
            identity: identity.to_string(),
        }
    }

    /// True for errors a client can resolve by retrying the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AllocationError::NodeLocked { .. })
    }
}

impl From<StoreError> for AllocationError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Duplicate {
                entity,
                field,
                value,
            } => AllocationError::Duplicate(format!(
                "{entity} with {field} {value} already exists"
            )),
            StoreError::NotFound { entity, identity } => {
                AllocationError::NotFound { kind: entity, identity }
            }
            StoreError::NodeLocked { node, lock } => AllocationError::NodeLocked { node, lock },
            other => AllocationError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_valid_node_message() {
        let err = AllocationError::NoValidNode { considered: 3 };
        assert!(err.to_string().contains("no valid node"));
        assert!(AllocationError::ResourceClassNotFound("gpu".into())
            .to_string()
            .contains("no valid node"));
    }

    #[test]
    fn test_store_errors_convert() {
        let dup: AllocationError = StoreError::Duplicate {
            entity: "allocation",
            field: "name",
            value: "a1".into(),
        }
        .into();
        assert!(matches!(dup, AllocationError::Duplicate(msg) if msg.contains("a1")));

        let locked: AllocationError = StoreError::NodeLocked {
            node: Uuid::nil(),
            lock: "deploy".into(),
        }
        .into();
        assert!(locked.is_retryable());

        let corrupt: AllocationError = StoreError::Corrupt {
            entity: "node",
            message: "bad".into(),
        }
        .into();
        assert!(matches!(corrupt, AllocationError::Internal(_)));
    }
}
