//! Allocation state machine.
//!
//! `allocating` is the initial state. It moves exactly once, to `active`
//! (node reserved) or `error` (matching failed), and nothing leaves a
//! terminal state except destruction of the record.

use std::sync::Arc;

use metalloc_events::{event_types, AllocationState, NotificationLevel, NotificationStatus};
use metalloc_id::NodeId;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::{AllocationError, ReservationCoordinator};
use crate::model::{Allocation, FinishMatch, MatchOutcome, NewAllocation, Node};
use crate::notify::Emitter;
use crate::store::{AllocationStore, NodeInventory};

/// Owns allocation records and their legal transitions.
pub struct AllocationMachine {
    store: Arc<dyn AllocationStore>,
    inventory: Arc<dyn NodeInventory>,
    coordinator: ReservationCoordinator,
    emitter: Emitter,
}

impl AllocationMachine {
    pub fn new(
        store: Arc<dyn AllocationStore>,
        inventory: Arc<dyn NodeInventory>,
        emitter: Emitter,
    ) -> Self {
        Self {
            coordinator: ReservationCoordinator::new(inventory.clone()),
            store,
            inventory,
            emitter,
        }
    }

    /// Persists a validated allocation in `allocating`.
    pub async fn create(&self, new: NewAllocation) -> Result<Allocation, AllocationError> {
        let allocation = self.store.create(new).await?;
        info!(
            allocation = %allocation.uuid,
            resource_class = %allocation.resource_class,
            "Allocation created"
        );
        Ok(allocation)
    }

    /// Records a successful match.
    ///
    /// Returns false when the allocation had already left `allocating` or
    /// was deleted; the reservation is then released so the node cannot
    /// leak.
    #[instrument(skip_all, fields(allocation = %allocation.uuid, node = %node.uuid))]
    pub async fn on_match_success(
        &self,
        allocation: &Allocation,
        node: &Node,
    ) -> Result<bool, AllocationError> {
        let finished = match self
            .store
            .finish_match(allocation.id, &MatchOutcome::Reserved(node.id))
            .await
        {
            Ok(finished) => finished,
            Err(e) => {
                self.release_orphan(allocation, node).await;
                return Err(e.into());
            }
        };

        match finished {
            FinishMatch::Applied(active) => {
                info!("Allocation is active");
                self.emitter.emit(
                    event_types::ALLOCATION_MATCH,
                    NotificationLevel::Info,
                    NotificationStatus::Success,
                    active.payload(Some(node.uuid)),
                    None,
                );
                Ok(true)
            }
            FinishMatch::Stale(current) if current.node_id == Some(node.id) => {
                debug!("Allocation already holds this node");
                Ok(false)
            }
            FinishMatch::Stale(current) => {
                warn!(
                    state = %current.state,
                    "Allocation finished before its match completed, releasing node"
                );
                self.release_orphan(allocation, node).await;
                Ok(false)
            }
            FinishMatch::Missing => {
                info!("Allocation was deleted while matching, releasing node");
                self.release_orphan(allocation, node).await;
                Ok(false)
            }
        }
    }

    /// Records a failed match. Returns false if there was nothing to fail.
    ///
    /// Whatever the record's fate, a failed or deleted allocation holds no
    /// node afterwards; reservations left by an interrupted match are freed.
    #[instrument(skip_all, fields(allocation = %allocation.uuid))]
    pub async fn on_match_failure(
        &self,
        allocation: &Allocation,
        reason: &str,
    ) -> Result<bool, AllocationError> {
        let outcome = MatchOutcome::Failed(reason.to_string());
        let applied = match self.store.finish_match(allocation.id, &outcome).await? {
            FinishMatch::Applied(failed) => {
                warn!(reason, "Allocation failed");
                self.emitter.emit(
                    event_types::ALLOCATION_MATCH,
                    NotificationLevel::Error,
                    NotificationStatus::Error,
                    failed.payload(None),
                    None,
                );
                true
            }
            FinishMatch::Stale(current) if current.state == AllocationState::Active => {
                debug!("Allocation already active, ignoring failure");
                return Ok(false);
            }
            FinishMatch::Stale(current) => {
                debug!(state = %current.state, "Allocation already finished, ignoring failure");
                false
            }
            FinishMatch::Missing => {
                debug!("Allocation was deleted before its failure was recorded");
                false
            }
        };

        self.release_held(allocation).await;
        Ok(applied)
    }

    /// Frees nodes still reserved for a failed allocation.
    pub async fn release_stranded(&self, allocation: &Allocation) {
        if allocation.state == AllocationState::Error {
            self.release_held(allocation).await;
        }
    }

    /// Removes the record, then frees its node.
    ///
    /// An operation lock on the held node fails with `NodeLocked` and
    /// leaves the record intact. The node stays reserved until the record
    /// is gone, so no other match can claim it while the record still
    /// names it. Release failures after removal are reported through an
    /// `allocation.release` notification.
    #[instrument(skip_all, fields(allocation = %allocation.uuid))]
    pub async fn destroy(&self, allocation: &Allocation) -> Result<Allocation, AllocationError> {
        if let Some(node_id) = allocation.node_id {
            self.ensure_unlocked(node_id, allocation.uuid).await?;
        }

        let removed = self
            .store
            .destroy(allocation.id)
            .await?
            .ok_or_else(|| AllocationError::not_found("allocation", allocation.uuid))?;

        self.release_held(&removed).await;

        info!("Allocation destroyed");
        Ok(removed)
    }

    /// Allocations cannot be modified in place.
    pub fn update(&self) -> Result<Allocation, AllocationError> {
        Err(AllocationError::MethodNotAllowed(
            "allocations cannot be updated; delete and recreate instead".to_string(),
        ))
    }

    async fn ensure_unlocked(&self, node_id: NodeId, holder: Uuid) -> Result<(), AllocationError> {
        let Some(node) = self.inventory.get_node(node_id).await? else {
            return Ok(());
        };
        match (node.reservation_holder, node.task_lock) {
            (Some(current), Some(lock)) if current == holder => Err(AllocationError::NodeLocked {
                node: node.uuid,
                lock,
            }),
            _ => Ok(()),
        }
    }

    async fn release_held(&self, allocation: &Allocation) {
        if let Err(e) = self.coordinator.release_held_by(allocation.uuid).await {
            self.report_release_failure(allocation, allocation.node_id, &e)
                .await;
        }
    }

    async fn release_orphan(&self, allocation: &Allocation, node: &Node) {
        if let Err(e) = self.coordinator.release(node.id, allocation.uuid).await {
            error!(error = %e, node = %node.uuid, "Failed to release orphaned reservation");
            self.report_release_failure(allocation, Some(node.id), &e)
                .await;
        }
    }

    async fn report_release_failure(
        &self,
        allocation: &Allocation,
        node_id: Option<NodeId>,
        err: &AllocationError,
    ) {
        warn!(error = %err, node_id = ?node_id, "Failed to release node, continuing");
        let node_uuid = match node_id {
            Some(node_id) => match self.inventory.get_node(node_id).await {
                Ok(node) => node.map(|n| n.uuid),
                Err(_) => None,
            },
            None => None,
        };
        self.emitter.emit(
            event_types::ALLOCATION_RELEASE,
            NotificationLevel::Warning,
            NotificationStatus::Error,
            allocation.payload(node_uuid),
            None,
        );
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use metalloc_id::AllocationId;

    use super::*;
    use crate::model::{AllocationFilter, NewNode};
    use crate::notify::RecordingNotifier;
    use crate::store::{MemoryAllocationStore, MemoryInventory, StoreError};

    struct Fixture {
        store: Arc<MemoryAllocationStore>,
        inventory: Arc<MemoryInventory>,
        notifier: Arc<RecordingNotifier>,
        machine: AllocationMachine,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryAllocationStore::new());
        let inventory = Arc::new(MemoryInventory::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let machine = AllocationMachine::new(
            store.clone(),
            inventory.clone(),
            Emitter::new(notifier.clone()),
        );
        Fixture {
            store,
            inventory,
            notifier,
            machine,
        }
    }

    fn new_allocation() -> NewAllocation {
        NewAllocation {
            uuid: Uuid::new_v4(),
            name: None,
            resource_class: "baremetal".into(),
            traits: vec![],
            candidate_nodes: vec![],
            extra: Default::default(),
        }
    }

    async fn reserved_node(f: &Fixture, holder: Uuid) -> Node {
        let node = f
            .inventory
            .enroll_node(NewNode::new("baremetal"))
            .await
            .unwrap();
        assert!(f.inventory.try_reserve(node.id, holder).await.unwrap());
        node
    }

    #[tokio::test]
    async fn test_success_transition() {
        let f = fixture();
        let allocation = f.machine.create(new_allocation()).await.unwrap();
        let node = reserved_node(&f, allocation.uuid).await;

        assert!(f.machine.on_match_success(&allocation, &node).await.unwrap());

        let stored = f.store.get_by_id(allocation.id).await.unwrap().unwrap();
        assert_eq!(stored.state, AllocationState::Active);
        assert_eq!(stored.node_id, Some(node.id));
        assert_eq!(
            f.notifier.flow(event_types::ALLOCATION_MATCH, allocation.uuid),
            vec![(NotificationStatus::Success, NotificationLevel::Info)]
        );
    }

    #[tokio::test]
    async fn test_failure_transition_is_terminal() {
        let f = fixture();
        let allocation = f.machine.create(new_allocation()).await.unwrap();

        assert!(f
            .machine
            .on_match_failure(&allocation, "no valid node found")
            .await
            .unwrap());
        assert!(!f
            .machine
            .on_match_failure(&allocation, "second failure")
            .await
            .unwrap());

        let stored = f.store.get_by_id(allocation.id).await.unwrap().unwrap();
        assert_eq!(stored.state, AllocationState::Error);
        assert_eq!(stored.last_error.as_deref(), Some("no valid node found"));
        assert!(stored.node_id.is_none());
        assert_eq!(
            f.notifier.flow(event_types::ALLOCATION_MATCH, allocation.uuid),
            vec![(NotificationStatus::Error, NotificationLevel::Error)]
        );
    }

    #[tokio::test]
    async fn test_late_success_releases_node() {
        let f = fixture();
        let allocation = f.machine.create(new_allocation()).await.unwrap();
        let node = reserved_node(&f, allocation.uuid).await;

        f.machine
            .on_match_failure(&allocation, "timed out")
            .await
            .unwrap();
        assert!(!f.machine.on_match_success(&allocation, &node).await.unwrap());

        let node = f.inventory.get_node(node.id).await.unwrap().unwrap();
        assert!(node.reservation_holder.is_none());
    }

    #[tokio::test]
    async fn test_success_after_delete_releases_node() {
        let f = fixture();
        let allocation = f.machine.create(new_allocation()).await.unwrap();
        let node = reserved_node(&f, allocation.uuid).await;

        f.machine.destroy(&allocation).await.unwrap();
        assert!(!f.machine.on_match_success(&allocation, &node).await.unwrap());

        let node = f.inventory.get_node(node.id).await.unwrap().unwrap();
        assert!(node.is_available());
    }

    #[tokio::test]
    async fn test_destroy_releases_node() {
        let f = fixture();
        let allocation = f.machine.create(new_allocation()).await.unwrap();
        let node = reserved_node(&f, allocation.uuid).await;
        f.machine.on_match_success(&allocation, &node).await.unwrap();
        let active = f.store.get_by_id(allocation.id).await.unwrap().unwrap();

        let removed = f.machine.destroy(&active).await.unwrap();
        assert_eq!(removed.uuid, allocation.uuid);
        assert!(f.store.get_by_id(allocation.id).await.unwrap().is_none());
        let node = f.inventory.get_node(node.id).await.unwrap().unwrap();
        assert!(node.is_available());
    }

    #[tokio::test]
    async fn test_destroy_with_stale_read_releases_node() {
        let f = fixture();
        let allocation = f.machine.create(new_allocation()).await.unwrap();
        let node = reserved_node(&f, allocation.uuid).await;
        f.machine.on_match_success(&allocation, &node).await.unwrap();

        // `allocation` is the pre-match snapshot without a node.
        let removed = f.machine.destroy(&allocation).await.unwrap();
        assert_eq!(removed.node_id, Some(node.id));
        let node = f.inventory.get_node(node.id).await.unwrap().unwrap();
        assert!(node.reservation_holder.is_none());
    }

    #[tokio::test]
    async fn test_destroy_locked_node_keeps_record() {
        let f = fixture();
        let allocation = f.machine.create(new_allocation()).await.unwrap();
        let node = reserved_node(&f, allocation.uuid).await;
        f.machine.on_match_success(&allocation, &node).await.unwrap();
        let active = f.store.get_by_id(allocation.id).await.unwrap().unwrap();
        f.inventory
            .set_task_lock(node.id, Some("deploying".into()))
            .await
            .unwrap();

        let err = f.machine.destroy(&active).await.unwrap_err();
        assert!(matches!(err, AllocationError::NodeLocked { .. }));
        assert!(f.store.get_by_id(allocation.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_destroy_missing() {
        let f = fixture();
        let allocation = f.machine.create(new_allocation()).await.unwrap();
        f.machine.destroy(&allocation).await.unwrap();

        let err = f.machine.destroy(&allocation).await.unwrap_err();
        assert!(matches!(err, AllocationError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_release_inconsistency_does_not_block_destroy() {
        let f = fixture();
        let allocation = f.machine.create(new_allocation()).await.unwrap();
        let node = reserved_node(&f, allocation.uuid).await;
        f.machine.on_match_success(&allocation, &node).await.unwrap();
        let active = f.store.get_by_id(allocation.id).await.unwrap().unwrap();

        // Someone else cleared and re-took the node behind our back.
        f.inventory.release(node.id, allocation.uuid).await.unwrap();
        f.inventory.try_reserve(node.id, Uuid::new_v4()).await.unwrap();

        f.machine.destroy(&active).await.unwrap();
        let node = f.inventory.get_node(node.id).await.unwrap().unwrap();
        assert!(node.reservation_holder.is_some());
    }

    #[tokio::test]
    async fn test_locked_orphan_release_is_reported() {
        let f = fixture();
        let allocation = f.machine.create(new_allocation()).await.unwrap();
        f.machine
            .on_match_failure(&allocation, "timed out")
            .await
            .unwrap();

        // The abandoned match reserves after the failure and the node is
        // locked before its late success arrives.
        let node = reserved_node(&f, allocation.uuid).await;
        f.inventory
            .set_task_lock(node.id, Some("deploying".into()))
            .await
            .unwrap();

        assert!(!f.machine.on_match_success(&allocation, &node).await.unwrap());
        assert_eq!(
            f.notifier.flow(event_types::ALLOCATION_RELEASE, allocation.uuid),
            vec![(NotificationStatus::Error, NotificationLevel::Warning)]
        );
    }

    /// Memory store whose `destroy` always fails.
    struct BrokenDestroy(MemoryAllocationStore);

    #[async_trait]
    impl AllocationStore for BrokenDestroy {
        async fn create(&self, new: NewAllocation) -> Result<Allocation, StoreError> {
            self.0.create(new).await
        }

        async fn get_by_id(&self, id: AllocationId) -> Result<Option<Allocation>, StoreError> {
            self.0.get_by_id(id).await
        }

        async fn get_by_uuid(&self, uuid: Uuid) -> Result<Option<Allocation>, StoreError> {
            self.0.get_by_uuid(uuid).await
        }

        async fn get_by_name(&self, name: &str) -> Result<Option<Allocation>, StoreError> {
            self.0.get_by_name(name).await
        }

        async fn get_by_node(&self, node_id: NodeId) -> Result<Option<Allocation>, StoreError> {
            self.0.get_by_node(node_id).await
        }

        async fn list(&self, filter: &AllocationFilter) -> Result<Vec<Allocation>, StoreError> {
            self.0.list(filter).await
        }

        async fn finish_match(
            &self,
            id: AllocationId,
            outcome: &MatchOutcome,
        ) -> Result<FinishMatch, StoreError> {
            self.0.finish_match(id, outcome).await
        }

        async fn destroy(&self, _id: AllocationId) -> Result<Option<Allocation>, StoreError> {
            Err(StoreError::Query(sqlx::Error::PoolTimedOut))
        }
    }

    #[tokio::test]
    async fn test_failed_destroy_keeps_node_reserved() {
        let store = Arc::new(BrokenDestroy(MemoryAllocationStore::new()));
        let inventory = Arc::new(MemoryInventory::new());
        let machine = AllocationMachine::new(
            store.clone(),
            inventory.clone(),
            Emitter::new(Arc::new(RecordingNotifier::new())),
        );

        let allocation = machine.create(new_allocation()).await.unwrap();
        let node = inventory
            .enroll_node(NewNode::new("baremetal"))
            .await
            .unwrap();
        assert!(inventory.try_reserve(node.id, allocation.uuid).await.unwrap());
        machine.on_match_success(&allocation, &node).await.unwrap();
        let active = store.get_by_id(allocation.id).await.unwrap().unwrap();

        let err = machine.destroy(&active).await.unwrap_err();
        assert!(matches!(err, AllocationError::Internal(_)));

        let stored = store.get_by_id(allocation.id).await.unwrap().unwrap();
        assert_eq!(stored.state, AllocationState::Active);
        assert_eq!(stored.node_id, Some(node.id));
        let node = inventory.get_node(node.id).await.unwrap().unwrap();
        assert_eq!(node.reservation_holder, Some(allocation.uuid));
    }

    #[test]
    fn test_update_not_allowed() {
        let f = fixture();
        assert!(matches!(
            f.machine.update().unwrap_err(),
            AllocationError::MethodNotAllowed(_)
        ));
    }
}
