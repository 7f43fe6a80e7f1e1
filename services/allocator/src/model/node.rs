use std::collections::BTreeSet;

use metalloc_events::ProvisionState;
use metalloc_id::NodeId;
use serde::Deserialize;
use uuid::Uuid;

/// A physical node, limited to the attributes allocation reads and writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: NodeId,
    pub uuid: Uuid,
    pub name: Option<String>,
    pub resource_class: String,
    pub traits: BTreeSet<String>,
    pub maintenance: bool,
    pub provision_state: ProvisionState,

    /// UUID of the allocation currently holding the node.
    pub reservation_holder: Option<Uuid>,

    /// Name of an in-progress operation holding the node lock.
    pub task_lock: Option<String>,
}

impl Node {
    /// A node is available when nothing holds it, no operation has it
    /// locked, it is out of maintenance and its provision state permits
    /// allocation.
    pub fn is_available(&self) -> bool {
        self.reservation_holder.is_none()
            && self.task_lock.is_none()
            && !self.maintenance
            && self.provision_state.permits_allocation()
    }

    /// Returns true if the node advertises every trait in `required`.
    pub fn has_traits<'a>(&self, required: impl IntoIterator<Item = &'a String>) -> bool {
        required.into_iter().all(|t| self.traits.contains(t))
    }
}

/// Node enrollment input.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewNode {
    #[serde(default)]
    pub uuid: Option<Uuid>,

    #[serde(default)]
    pub name: Option<String>,

    pub resource_class: String,

    #[serde(default)]
    pub traits: BTreeSet<String>,

    #[serde(default)]
    pub maintenance: bool,

    #[serde(default)]
    pub provision_state: ProvisionState,

    #[serde(default)]
    pub task_lock: Option<String>,
}

impl NewNode {
    pub fn new(resource_class: impl Into<String>) -> Self {
        Self {
            uuid: None,
            name: None,
            resource_class: resource_class.into(),
            traits: BTreeSet::new(),
            maintenance: false,
            provision_state: ProvisionState::Available,
            task_lock: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_uuid(mut self, uuid: Uuid) -> Self {
        self.uuid = Some(uuid);
        self
    }

    pub fn with_trait(mut self, name: impl Into<String>) -> Self {
        self.traits.insert(name.into());
        self
    }

    pub fn with_provision_state(mut self, state: ProvisionState) -> Self {
        self.provision_state = state;
        self
    }

    pub fn in_maintenance(mut self) -> Self {
        self.maintenance = true;
        self
    }
}
