//! Process-local storage backend.
//!
//! Each table sits behind one `RwLock`. Every operation takes the lock once
//! and never awaits while holding it, so check-then-set sequences such as the
//! reservation compare-and-swap are indivisible.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::Utc;
use metalloc_events::AllocationState;
use metalloc_id::{AllocationId, Identity, NodeId};
use uuid::Uuid;

use super::{AllocationStore, NodeInventory, ReleaseOutcome, StoreError};
use crate::model::{
    Allocation, AllocationFilter, FinishMatch, MatchOutcome, NewAllocation, NewNode, Node,
    SortDir, SortKey,
};

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Allocations
// =============================================================================

#[derive(Default)]
struct AllocationTable {
    last_id: i64,
    rows: BTreeMap<AllocationId, Allocation>,
    by_uuid: HashMap<Uuid, AllocationId>,
    by_name: HashMap<String, AllocationId>,
}

impl AllocationTable {
    fn remove(&mut self, id: AllocationId) -> Option<Allocation> {
        let removed = self.rows.remove(&id)?;
        self.by_uuid.remove(&removed.uuid);
        if let Some(name) = &removed.name {
            self.by_name.remove(name);
        }
        Some(removed)
    }
}

/// In-memory allocation records.
#[derive(Default)]
pub struct MemoryAllocationStore {
    table: RwLock<AllocationTable>,
}

impl MemoryAllocationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AllocationStore for MemoryAllocationStore {
    async fn create(&self, new: NewAllocation) -> Result<Allocation, StoreError> {
        let mut table = write(&self.table);

        if table.by_uuid.contains_key(&new.uuid) {
            return Err(StoreError::Duplicate {
                entity: "allocation",
                field: "uuid",
                value: new.uuid.to_string(),
            });
        }
        if let Some(name) = &new.name {
            if table.by_name.contains_key(name) {
                return Err(StoreError::Duplicate {
                    entity: "allocation",
                    field: "name",
                    value: name.clone(),
                });
            }
        }

        table.last_id += 1;
        let id = AllocationId::new(table.last_id);
        let allocation = Allocation {
            id,
            uuid: new.uuid,
            name: new.name,
            state: AllocationState::Allocating,
            node_id: None,
            resource_class: new.resource_class,
            traits: new.traits,
            candidate_nodes: new.candidate_nodes,
            extra: new.extra,
            last_error: None,
            created_at: Utc::now(),
            updated_at: None,
        };

        table.by_uuid.insert(allocation.uuid, id);
        if let Some(name) = &allocation.name {
            table.by_name.insert(name.clone(), id);
        }
        table.rows.insert(id, allocation.clone());
        Ok(allocation)
    }

    async fn get_by_id(&self, id: AllocationId) -> Result<Option<Allocation>, StoreError> {
        Ok(read(&self.table).rows.get(&id).cloned())
    }

    async fn get_by_uuid(&self, uuid: Uuid) -> Result<Option<Allocation>, StoreError> {
        let table = read(&self.table);
        Ok(table
            .by_uuid
            .get(&uuid)
            .and_then(|id| table.rows.get(id))
            .cloned())
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<Allocation>, StoreError> {
        let table = read(&self.table);
        Ok(table
            .by_name
            .get(name)
            .and_then(|id| table.rows.get(id))
            .cloned())
    }

    async fn get_by_node(&self, node_id: NodeId) -> Result<Option<Allocation>, StoreError> {
        Ok(read(&self.table)
            .rows
            .values()
            .find(|a| a.node_id == Some(node_id))
            .cloned())
    }

    async fn list(&self, filter: &AllocationFilter) -> Result<Vec<Allocation>, StoreError> {
        let mut rows: Vec<Allocation> = read(&self.table)
            .rows
            .values()
            .filter(|a| filter.matches(a))
            .cloned()
            .collect();

        // Rows come out in id order; the sort is stable so id breaks ties.
        match filter.sort_key {
            SortKey::Id => {}
            SortKey::Uuid => rows.sort_by_key(|a| a.uuid),
            SortKey::Name => rows.sort_by(|a, b| a.name.cmp(&b.name)),
        }
        if filter.sort_dir == SortDir::Desc {
            rows.reverse();
        }
        Ok(rows)
    }

    async fn finish_match(
        &self,
        id: AllocationId,
        outcome: &MatchOutcome,
    ) -> Result<FinishMatch, StoreError> {
        let mut table = write(&self.table);

        match table.rows.get(&id) {
            None => return Ok(FinishMatch::Missing),
            Some(current) if current.state != AllocationState::Allocating => {
                return Ok(FinishMatch::Stale(current.clone()));
            }
            Some(_) => {}
        }

        if let MatchOutcome::Reserved(node_id) = outcome {
            if let Some(holder) = table.rows.values().find(|a| a.node_id == Some(*node_id)) {
                return Err(StoreError::Duplicate {
                    entity: "allocation",
                    field: "node_id",
                    value: format!("{node_id} (held by {})", holder.uuid),
                });
            }
        }

        let Some(allocation) = table.rows.get_mut(&id) else {
            return Ok(FinishMatch::Missing);
        };

        match outcome {
            MatchOutcome::Reserved(node_id) => {
                allocation.state = AllocationState::Active;
                allocation.node_id = Some(*node_id);
                allocation.last_error = None;
            }
            MatchOutcome::Failed(reason) => {
                allocation.state = AllocationState::Error;
                allocation.node_id = None;
                allocation.last_error = Some(reason.clone());
            }
        }
        allocation.updated_at = Some(Utc::now());
        Ok(FinishMatch::Applied(allocation.clone()))
    }

    async fn destroy(&self, id: AllocationId) -> Result<Option<Allocation>, StoreError> {
        Ok(write(&self.table).remove(id))
    }
}

// =============================================================================
// Nodes
// =============================================================================

#[derive(Default)]
struct NodeTable {
    last_id: i64,
    rows: BTreeMap<NodeId, Node>,
}

/// In-memory node inventory.
#[derive(Default)]
pub struct MemoryInventory {
    table: RwLock<NodeTable>,
}

impl MemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NodeInventory for MemoryInventory {
    async fn enroll_node(&self, node: NewNode) -> Result<Node, StoreError> {
        let mut table = write(&self.table);
        let uuid = node.uuid.unwrap_or_else(Uuid::new_v4);

        if table.rows.values().any(|n| n.uuid == uuid) {
            return Err(StoreError::Duplicate {
                entity: "node",
                field: "uuid",
                value: uuid.to_string(),
            });
        }
        if let Some(name) = &node.name {
            if table.rows.values().any(|n| n.name.as_ref() == Some(name)) {
                return Err(StoreError::Duplicate {
                    entity: "node",
                    field: "name",
                    value: name.clone(),
                });
            }
        }

        table.last_id += 1;
        let enrolled = Node {
            id: NodeId::new(table.last_id),
            uuid,
            name: node.name,
            resource_class: node.resource_class,
            traits: node.traits,
            maintenance: node.maintenance,
            provision_state: node.provision_state,
            reservation_holder: None,
            task_lock: node.task_lock,
        };
        table.rows.insert(enrolled.id, enrolled.clone());
        Ok(enrolled)
    }

    async fn lookup_node(&self, identity: &Identity) -> Result<Option<Node>, StoreError> {
        let table = read(&self.table);
        let found = match identity {
            Identity::Uuid(uuid) => table.rows.values().find(|n| n.uuid == *uuid),
            Identity::Name(name) => table
                .rows
                .values()
                .find(|n| n.name.as_deref() == Some(name.as_str())),
        };
        Ok(found.cloned())
    }

    async fn get_node(&self, id: NodeId) -> Result<Option<Node>, StoreError> {
        Ok(read(&self.table).rows.get(&id).cloned())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, StoreError> {
        Ok(read(&self.table).rows.values().cloned().collect())
    }

    async fn list_nodes_by_class(&self, resource_class: &str) -> Result<Vec<Node>, StoreError> {
        Ok(read(&self.table)
            .rows
            .values()
            .filter(|n| n.resource_class == resource_class)
            .cloned()
            .collect())
    }

    async fn try_reserve(&self, id: NodeId, holder: Uuid) -> Result<bool, StoreError> {
        let mut table = write(&self.table);
        match table.rows.get_mut(&id) {
            Some(node) if node.is_available() => {
                node.reservation_holder = Some(holder);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, id: NodeId, holder: Uuid) -> Result<ReleaseOutcome, StoreError> {
        let mut table = write(&self.table);
        let Some(node) = table.rows.get_mut(&id) else {
            return Ok(ReleaseOutcome::NodeMissing);
        };
        match node.reservation_holder {
            None => Ok(ReleaseOutcome::NotReserved),
            Some(current) if current != holder => Ok(ReleaseOutcome::HeldByOther(current)),
            Some(_) => {
                if let Some(lock) = &node.task_lock {
                    return Err(StoreError::NodeLocked {
                        node: node.uuid,
                        lock: lock.clone(),
                    });
                }
                node.reservation_holder = None;
                Ok(ReleaseOutcome::Released)
            }
        }
    }

    async fn release_held_by(&self, holder: Uuid) -> Result<Vec<NodeId>, StoreError> {
        let mut table = write(&self.table);
        let mut freed = Vec::new();
        for node in table.rows.values_mut() {
            if node.reservation_holder == Some(holder) {
                node.reservation_holder = None;
                freed.push(node.id);
            }
        }
        Ok(freed)
    }

    async fn set_task_lock(&self, id: NodeId, lock: Option<String>) -> Result<(), StoreError> {
        let mut table = write(&self.table);
        let node = table.rows.get_mut(&id).ok_or_else(|| StoreError::NotFound {
            entity: "node",
            identity: id.to_string(),
        })?;
        node.task_lock = lock;
        Ok(())
    }
}
