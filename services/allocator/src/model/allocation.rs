use std::str::FromStr;

use chrono::{DateTime, Utc};
use metalloc_events::{AllocationPayload, AllocationState};
use metalloc_id::{AllocationId, NodeId};
use serde::Deserialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::allocation::AllocationError;

/// An allocation record.
///
/// `node_id` is set if and only if `state` is `Active`.
#[derive(Debug, Clone, PartialEq)]
pub struct Allocation {
    pub id: AllocationId,
    pub uuid: Uuid,
    pub name: Option<String>,
    pub state: AllocationState,
    pub node_id: Option<NodeId>,
    pub resource_class: String,

    /// Required traits, in the order the client gave them.
    pub traits: Vec<String>,

    /// Resolved candidate node UUIDs, in the order the client gave them.
    pub candidate_nodes: Vec<Uuid>,

    pub extra: Map<String, Value>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Allocation {
    /// Builds the notification payload for this record.
    pub fn payload(&self, node_uuid: Option<Uuid>) -> AllocationPayload {
        AllocationPayload {
            uuid: self.uuid,
            name: self.name.clone(),
            state: self.state,
            resource_class: self.resource_class.clone(),
            traits: self.traits.clone(),
            candidate_nodes: self.candidate_nodes.clone(),
            node_uuid,
            last_error: self.last_error.clone(),
            extra: self.extra.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// An allocation together with the UUID of the node it holds.
#[derive(Debug, Clone, PartialEq)]
pub struct AllocationView {
    pub allocation: Allocation,
    pub node_uuid: Option<Uuid>,
}

/// A create request as submitted by a client, before validation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AllocationRequest {
    #[serde(default)]
    pub resource_class: Option<String>,

    #[serde(default)]
    pub traits: Vec<String>,

    /// Node names or UUIDs.
    #[serde(default)]
    pub candidate_nodes: Vec<String>,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub uuid: Option<String>,

    #[serde(default)]
    pub extra: Map<String, Value>,
}

impl AllocationRequest {
    pub fn new(resource_class: impl Into<String>) -> Self {
        Self {
            resource_class: Some(resource_class.into()),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_trait(mut self, name: impl Into<String>) -> Self {
        self.traits.push(name.into());
        self
    }

    pub fn with_candidate(mut self, node: impl Into<String>) -> Self {
        self.candidate_nodes.push(node.into());
        self
    }
}

/// A validated allocation ready to be persisted in `allocating`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAllocation {
    pub uuid: Uuid,
    pub name: Option<String>,
    pub resource_class: String,
    pub traits: Vec<String>,
    pub candidate_nodes: Vec<Uuid>,
    pub extra: Map<String, Value>,
}

impl NewAllocation {
    /// Payload describing the allocation before it has been persisted.
    pub fn payload(&self, created_at: DateTime<Utc>) -> AllocationPayload {
        AllocationPayload {
            uuid: self.uuid,
            name: self.name.clone(),
            state: AllocationState::Allocating,
            resource_class: self.resource_class.clone(),
            traits: self.traits.clone(),
            candidate_nodes: self.candidate_nodes.clone(),
            node_uuid: None,
            last_error: None,
            extra: self.extra.clone(),
            created_at,
            updated_at: None,
        }
    }
}

/// How matching ended for an allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    Reserved(NodeId),
    Failed(String),
}

/// Result of a conditional transition out of `allocating`.
#[derive(Debug, Clone, PartialEq)]
pub enum FinishMatch {
    /// The transition was applied; carries the updated record.
    Applied(Allocation),
    /// The record had already left `allocating`; carries it unchanged.
    Stale(Allocation),
    /// The record no longer exists.
    Missing,
}

// =============================================================================
// Listing
// =============================================================================

/// Sort keys a list request may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortKey {
    /// Creation order. Used when the client does not ask for a key.
    #[default]
    Id,
    Uuid,
    Name,
}

impl FromStr for SortKey {
    type Err = AllocationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uuid" => Ok(SortKey::Uuid),
            "name" => Ok(SortKey::Name),
            other => Err(AllocationError::BadRequest(format!(
                "The sort_key value \"{other}\" is an invalid field for sorting"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDir {
    #[default]
    Asc,
    Desc,
}

impl FromStr for SortDir {
    type Err = AllocationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "asc" => Ok(SortDir::Asc),
            "desc" => Ok(SortDir::Desc),
            other => Err(AllocationError::BadRequest(format!(
                "Invalid sort direction: {other}. Acceptable values are 'asc' or 'desc'"
            ))),
        }
    }
}

/// Resolved list filter handed to the store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AllocationFilter {
    pub state: Option<AllocationState>,
    pub node_id: Option<NodeId>,
    pub resource_class: Option<String>,
    pub sort_key: SortKey,
    pub sort_dir: SortDir,
}

impl AllocationFilter {
    pub fn with_state(state: AllocationState) -> Self {
        Self {
            state: Some(state),
            ..Default::default()
        }
    }

    /// Returns true if `allocation` passes every filter criterion.
    pub fn matches(&self, allocation: &Allocation) -> bool {
        self.state.is_none_or(|s| allocation.state == s)
            && self.node_id.is_none_or(|n| allocation.node_id == Some(n))
            && self
                .resource_class
                .as_deref()
                .is_none_or(|rc| allocation.resource_class == rc)
    }
}

/// Raw list query, as received from a client.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListQuery {
    pub state: Option<String>,
    /// Node name or UUID.
    pub node: Option<String>,
    pub resource_class: Option<String>,
    pub sort_key: Option<String>,
    pub sort_dir: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sort_key_allow_list() {
        assert_eq!("uuid".parse::<SortKey>().unwrap(), SortKey::Uuid);
        assert_eq!("name".parse::<SortKey>().unwrap(), SortKey::Name);
        for key in ["extra", "foo", "internal_info", "properties"] {
            let err = key.parse::<SortKey>().unwrap_err();
            assert!(err.to_string().contains(key), "{err}");
        }
    }

    #[test]
    fn test_sort_dir() {
        assert_eq!("desc".parse::<SortDir>().unwrap(), SortDir::Desc);
        assert!("sideways".parse::<SortDir>().is_err());
    }

    #[test]
    fn test_request_rejects_server_fields() {
        let parsed = serde_json::from_str::<AllocationRequest>(
            r#"{"resource_class": "baremetal", "node_id": 1}"#,
        );
        assert!(parsed.is_err());
    }

    #[test]
    fn test_filter_matches() {
        let allocation = Allocation {
            id: AllocationId::new(1),
            uuid: Uuid::new_v4(),
            name: None,
            state: AllocationState::Active,
            node_id: Some(NodeId::new(3)),
            resource_class: "baremetal".into(),
            traits: vec![],
            candidate_nodes: vec![],
            extra: Map::new(),
            last_error: None,
            created_at: Utc::now(),
            updated_at: None,
        };

        assert!(AllocationFilter::default().matches(&allocation));
        assert!(AllocationFilter::with_state(AllocationState::Active).matches(&allocation));
        assert!(!AllocationFilter::with_state(AllocationState::Error).matches(&allocation));

        let by_node = AllocationFilter {
            node_id: Some(NodeId::new(4)),
            ..Default::default()
        };
        assert!(!by_node.matches(&allocation));
    }
}
