//! Event type names, states, and notification payloads.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::EventError;

// =============================================================================
// Event Type Constants
// =============================================================================

/// All event type names as constants.
pub mod event_types {
    pub const ALLOCATION_CREATE: &str = "allocation.create";
    pub const ALLOCATION_DELETE: &str = "allocation.delete";
    pub const ALLOCATION_MATCH: &str = "allocation.match";
    pub const ALLOCATION_RELEASE: &str = "allocation.release";

    /// Every known event type, for validation of inbound names.
    pub const ALL: &[&str] = &[
        ALLOCATION_CREATE,
        ALLOCATION_DELETE,
        ALLOCATION_MATCH,
        ALLOCATION_RELEASE,
    ];
}

// =============================================================================
// States
// =============================================================================

/// Allocation lifecycle state.
///
/// `Allocating` is the only non-terminal state; an allocation leaves it
/// exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationState {
    Allocating,
    Active,
    Error,
}

impl AllocationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationState::Allocating => "allocating",
            AllocationState::Active => "active",
            AllocationState::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, AllocationState::Allocating)
    }
}

impl fmt::Display for AllocationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AllocationState {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allocating" => Ok(AllocationState::Allocating),
            "active" => Ok(AllocationState::Active),
            "error" => Ok(AllocationState::Error),
            other => Err(EventError::UnknownState {
                kind: "allocation",
                value: other.to_string(),
            }),
        }
    }
}

/// Node provision state, as far as allocation cares about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionState {
    Enroll,
    Manageable,
    #[default]
    Available,
    Deploying,
    Active,
    Cleaning,
    Error,
}

impl ProvisionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisionState::Enroll => "enroll",
            ProvisionState::Manageable => "manageable",
            ProvisionState::Available => "available",
            ProvisionState::Deploying => "deploying",
            ProvisionState::Active => "active",
            ProvisionState::Cleaning => "cleaning",
            ProvisionState::Error => "error",
        }
    }

    /// Only nodes that finished cleaning and wait for a workload can be
    /// allocated.
    pub fn permits_allocation(&self) -> bool {
        matches!(self, ProvisionState::Available)
    }
}

impl fmt::Display for ProvisionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProvisionState {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enroll" => Ok(ProvisionState::Enroll),
            "manageable" => Ok(ProvisionState::Manageable),
            "available" => Ok(ProvisionState::Available),
            "deploying" => Ok(ProvisionState::Deploying),
            "active" => Ok(ProvisionState::Active),
            "cleaning" => Ok(ProvisionState::Cleaning),
            "error" => Ok(ProvisionState::Error),
            other => Err(EventError::UnknownState {
                kind: "provision",
                value: other.to_string(),
            }),
        }
    }
}

// =============================================================================
// Notification level and status
// =============================================================================

/// Severity of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for NotificationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NotificationLevel::Debug => "debug",
            NotificationLevel::Info => "info",
            NotificationLevel::Warning => "warning",
            NotificationLevel::Error => "error",
            NotificationLevel::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Where in a flow a notification was emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Start,
    End,
    Error,
    Success,
}

impl NotificationStatus {
    /// Terminal statuses close a flow opened by `Start`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, NotificationStatus::End | NotificationStatus::Error)
    }
}

impl fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NotificationStatus::Start => "start",
            NotificationStatus::End => "end",
            NotificationStatus::Error => "error",
            NotificationStatus::Success => "success",
        };
        f.write_str(s)
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// Allocation snapshot carried by every `allocation.*` notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationPayload {
    pub uuid: Uuid,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    pub state: AllocationState,

    pub resource_class: String,

    #[serde(default)]
    pub traits: Vec<String>,

    #[serde(default)]
    pub candidate_nodes: Vec<Uuid>,

    /// UUID of the reserved node, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_uuid: Option<Uuid>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,

    pub created_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}
