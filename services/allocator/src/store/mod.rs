//! Storage for allocations and the node inventory.
//!
//! Components receive their storage handles at construction; nothing in the
//! crate reaches for a process-wide database handle. Two backends exist:
//! - `memory`: process-local tables behind locks
//! - `postgres`: SQLx against Postgres

mod db;
mod error;
mod memory;
mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use metalloc_id::{AllocationId, Identity, NodeId};
use uuid::Uuid;

use crate::model::{
    Allocation, AllocationFilter, FinishMatch, MatchOutcome, NewAllocation, NewNode, Node,
};

pub use db::{Database, DbConfig};
pub use error::StoreError;
pub use memory::{MemoryAllocationStore, MemoryInventory};
pub use postgres::{PgAllocationStore, PgInventory};

/// Persisted allocation records.
#[async_trait]
pub trait AllocationStore: Send + Sync + 'static {
    /// Persists a new record in `allocating`, assigning its numeric id.
    ///
    /// Fails with `Duplicate` when the uuid or name is taken.
    async fn create(&self, new: NewAllocation) -> Result<Allocation, StoreError>;

    async fn get_by_id(&self, id: AllocationId) -> Result<Option<Allocation>, StoreError>;

    async fn get_by_uuid(&self, uuid: Uuid) -> Result<Option<Allocation>, StoreError>;

    async fn get_by_name(&self, name: &str) -> Result<Option<Allocation>, StoreError>;

    /// Returns the allocation holding `node_id`, if any.
    async fn get_by_node(&self, node_id: NodeId) -> Result<Option<Allocation>, StoreError>;

    async fn list(&self, filter: &AllocationFilter) -> Result<Vec<Allocation>, StoreError>;

    /// Moves a record out of `allocating`.
    ///
    /// The transition only applies while the record is still `allocating`;
    /// the check and the write are one atomic step.
    async fn finish_match(
        &self,
        id: AllocationId,
        outcome: &MatchOutcome,
    ) -> Result<FinishMatch, StoreError>;

    /// Removes a record, returning it as it was at removal.
    async fn destroy(&self, id: AllocationId) -> Result<Option<Allocation>, StoreError>;
}

/// Outcome of releasing a node reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    NotReserved,
    HeldByOther(Uuid),
    NodeMissing,
}

/// Node inventory accessor.
#[async_trait]
pub trait NodeInventory: Send + Sync + 'static {
    async fn enroll_node(&self, node: NewNode) -> Result<Node, StoreError>;

    async fn lookup_node(&self, identity: &Identity) -> Result<Option<Node>, StoreError>;

    async fn get_node(&self, id: NodeId) -> Result<Option<Node>, StoreError>;

    /// All nodes in id order.
    async fn list_nodes(&self) -> Result<Vec<Node>, StoreError>;

    /// Nodes of `resource_class` in id order, available or not.
    async fn list_nodes_by_class(&self, resource_class: &str) -> Result<Vec<Node>, StoreError>;

    /// Atomically claims an available node for `holder`.
    ///
    /// Returns false when the node is missing or no longer available.
    async fn try_reserve(&self, id: NodeId, holder: Uuid) -> Result<bool, StoreError>;

    /// Drops `holder`'s reservation on a node.
    ///
    /// Fails with `NodeLocked` only when `holder` has the reservation but an
    /// operation lock prevents releasing it.
    async fn release(&self, id: NodeId, holder: Uuid) -> Result<ReleaseOutcome, StoreError>;

    /// Drops every reservation `holder` has, returning the nodes freed.
    ///
    /// Operation locks are not consulted; the holder no longer needs any of
    /// these nodes.
    async fn release_held_by(&self, holder: Uuid) -> Result<Vec<NodeId>, StoreError>;

    /// Sets or clears the operation lock on a node.
    async fn set_task_lock(&self, id: NodeId, lock: Option<String>) -> Result<(), StoreError>;
}

/// The storage handles a service is built from.
#[derive(Clone)]
pub struct Storage {
    pub allocations: Arc<dyn AllocationStore>,
    pub inventory: Arc<dyn NodeInventory>,
    database: Option<Database>,
}

impl Storage {
    /// Process-local storage.
    pub fn memory() -> Self {
        Self {
            allocations: Arc::new(MemoryAllocationStore::new()),
            inventory: Arc::new(MemoryInventory::new()),
            database: None,
        }
    }

    /// Postgres-backed storage sharing one pool.
    pub fn postgres(db: Database) -> Self {
        Self {
            allocations: Arc::new(PgAllocationStore::new(db.pool().clone())),
            inventory: Arc::new(PgInventory::new(db.pool().clone())),
            database: Some(db),
        }
    }

    /// Storage from explicit handles.
    pub fn from_parts(
        allocations: Arc<dyn AllocationStore>,
        inventory: Arc<dyn NodeInventory>,
    ) -> Self {
        Self {
            allocations,
            inventory,
            database: None,
        }
    }

    pub fn backend(&self) -> &'static str {
        if self.database.is_some() {
            "postgres"
        } else {
            "memory"
        }
    }

    /// Check that the backing database is reachable.
    pub async fn health_check(&self) -> Result<(), StoreError> {
        match &self.database {
            Some(db) => db.health_check().await,
            None => Ok(()),
        }
    }
}
