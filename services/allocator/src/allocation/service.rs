//! The allocation boundary: create, get, list, delete and update.
//!
//! Validation and identity resolution happen before any notification.
//! Once a create or delete flow has emitted START it emits exactly one
//! terminal notification.

use std::sync::Arc;

use chrono::Utc;
use metalloc_events::{event_types, AllocationState, NotificationLevel, NotificationStatus};
use metalloc_id::{Identity, NodeId, RequestId};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::{
    AllocationError, AllocationMachine, CandidateFilter, Dispatcher, DispatcherConfig, HashRoute,
    Matcher, ReservationCoordinator, Route,
};
use crate::model::validation::{validate_new_node, validate_request};
use crate::model::{
    Allocation, AllocationFilter, AllocationRequest, AllocationView, ListQuery, NewAllocation,
    NewNode, Node, SortDir, SortKey,
};
use crate::notify::{Emitter, Notifier};
use crate::store::{AllocationStore, NodeInventory, Storage};

/// `last_error` of allocations a previous process left in `allocating`.
pub const INTERRUPTED_REASON: &str = "matching interrupted by service restart";

pub struct AllocationService {
    store: Arc<dyn AllocationStore>,
    inventory: Arc<dyn NodeInventory>,
    machine: Arc<AllocationMachine>,
    dispatcher: Dispatcher,
    emitter: Emitter,
}

impl AllocationService {
    /// Builds the service and starts its dispatcher with hash routing.
    pub fn new(storage: &Storage, notifier: Arc<dyn Notifier>, config: DispatcherConfig) -> Self {
        Self::with_route(storage, notifier, config, Arc::new(HashRoute))
    }

    pub fn with_route(
        storage: &Storage,
        notifier: Arc<dyn Notifier>,
        config: DispatcherConfig,
        route: Arc<dyn Route>,
    ) -> Self {
        let emitter = Emitter::new(notifier);
        let machine = Arc::new(AllocationMachine::new(
            storage.allocations.clone(),
            storage.inventory.clone(),
            emitter.clone(),
        ));
        let matcher = Arc::new(Matcher::new(
            CandidateFilter::new(storage.inventory.clone()),
            ReservationCoordinator::new(storage.inventory.clone()),
            machine.clone(),
        ));

        Self {
            store: storage.allocations.clone(),
            inventory: storage.inventory.clone(),
            machine,
            dispatcher: Dispatcher::start(config, matcher, route),
            emitter,
        }
    }

    // =========================================================================
    // Allocations
    // =========================================================================

    /// Creates an allocation and schedules matching.
    ///
    /// Returns as soon as the record exists in `allocating`.
    #[instrument(skip_all)]
    pub async fn create(
        &self,
        request: AllocationRequest,
        request_id: Option<RequestId>,
    ) -> Result<AllocationView, AllocationError> {
        let validated = validate_request(request)?;
        let candidate_nodes = self.resolve_candidates(&validated.candidates).await?;
        self.ensure_unused(validated.uuid, validated.name.as_deref())
            .await?;

        let new = NewAllocation {
            uuid: validated.uuid,
            name: validated.name,
            resource_class: validated.resource_class,
            traits: validated.traits,
            candidate_nodes,
            extra: validated.extra,
        };

        self.emitter.emit(
            event_types::ALLOCATION_CREATE,
            NotificationLevel::Info,
            NotificationStatus::Start,
            new.payload(Utc::now()),
            request_id,
        );

        let allocation = match self.machine.create(new.clone()).await {
            Ok(allocation) => allocation,
            Err(e) => {
                self.emitter.emit(
                    event_types::ALLOCATION_CREATE,
                    NotificationLevel::Error,
                    NotificationStatus::Error,
                    new.payload(Utc::now()),
                    request_id,
                );
                return Err(e);
            }
        };

        if let Err(e) = self.dispatcher.schedule(allocation.clone()) {
            warn!(allocation = %allocation.uuid, error = %e, "Could not schedule matching");
            let reason = format!("failed to schedule matching: {e}");
            if let Err(e) = self.machine.on_match_failure(&allocation, &reason).await {
                error!(
                    allocation = %allocation.uuid,
                    error = %e,
                    "Failed to record scheduling failure"
                );
            }
        }

        self.emitter.emit(
            event_types::ALLOCATION_CREATE,
            NotificationLevel::Info,
            NotificationStatus::End,
            allocation.payload(None),
            request_id,
        );

        Ok(AllocationView {
            allocation,
            node_uuid: None,
        })
    }

    /// Looks up an allocation by UUID or name.
    pub async fn get(&self, ident: &str) -> Result<AllocationView, AllocationError> {
        let allocation = self.find(ident).await?;
        self.view(allocation).await
    }

    /// Looks up the allocation holding a node.
    pub async fn get_by_node(&self, node_ident: &str) -> Result<AllocationView, AllocationError> {
        let allocation = self.find_by_node(node_ident).await?;
        self.view(allocation).await
    }

    pub async fn list(&self, query: ListQuery) -> Result<Vec<AllocationView>, AllocationError> {
        let filter = self.resolve_filter(query).await?;
        let mut views = Vec::new();
        for allocation in self.store.list(&filter).await? {
            views.push(self.view(allocation).await?);
        }
        Ok(views)
    }

    /// Releases the allocation's node and removes it.
    pub async fn delete(
        &self,
        ident: &str,
        request_id: Option<RequestId>,
    ) -> Result<(), AllocationError> {
        let allocation = self.find(ident).await?;
        self.delete_allocation(allocation, request_id).await
    }

    /// Deletes the allocation holding a node.
    pub async fn delete_by_node(
        &self,
        node_ident: &str,
        request_id: Option<RequestId>,
    ) -> Result<(), AllocationError> {
        let allocation = self.find_by_node(node_ident).await?;
        self.delete_allocation(allocation, request_id).await
    }

    /// Always fails: allocations are immutable apart from their state.
    pub fn update(&self, _ident: &str) -> Result<AllocationView, AllocationError> {
        let allocation = self.machine.update()?;
        Ok(AllocationView {
            allocation,
            node_uuid: None,
        })
    }

    /// Fails allocations left in `allocating` by a previous process and
    /// frees nodes still reserved for failed ones.
    ///
    /// Call before serving requests; anything `allocating` at that point
    /// has no worker behind it.
    pub async fn recover_interrupted(&self) -> Result<usize, AllocationError> {
        let stranded = self
            .store
            .list(&AllocationFilter::with_state(AllocationState::Allocating))
            .await?;

        let mut failed = 0;
        for allocation in &stranded {
            if self
                .machine
                .on_match_failure(allocation, INTERRUPTED_REASON)
                .await?
            {
                failed += 1;
            }
        }
        if failed > 0 {
            warn!(count = failed, "Failed allocations interrupted by restart");
        }

        let errored = self
            .store
            .list(&AllocationFilter::with_state(AllocationState::Error))
            .await?;
        for allocation in &errored {
            self.machine.release_stranded(allocation).await;
        }
        Ok(failed)
    }

    // =========================================================================
    // Nodes
    // =========================================================================

    pub async fn enroll_node(&self, node: NewNode) -> Result<Node, AllocationError> {
        validate_new_node(&node)?;
        let node = self.inventory.enroll_node(node).await?;
        info!(node = %node.uuid, resource_class = %node.resource_class, "Node enrolled");
        Ok(node)
    }

    pub async fn get_node(&self, node_ident: &str) -> Result<Node, AllocationError> {
        self.find_node(node_ident)
            .await?
            .ok_or_else(|| AllocationError::not_found("node", node_ident))
    }

    pub async fn list_nodes(&self) -> Result<Vec<Node>, AllocationError> {
        Ok(self.inventory.list_nodes().await?)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Allocations queued or being matched.
    pub fn in_flight(&self) -> usize {
        self.dispatcher.in_flight()
    }

    pub async fn shutdown(&self) {
        self.dispatcher.shutdown().await;
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn delete_allocation(
        &self,
        allocation: Allocation,
        request_id: Option<RequestId>,
    ) -> Result<(), AllocationError> {
        let node_uuid = self.node_uuid(allocation.node_id).await?;
        self.emitter.emit(
            event_types::ALLOCATION_DELETE,
            NotificationLevel::Info,
            NotificationStatus::Start,
            allocation.payload(node_uuid),
            request_id,
        );

        match self.machine.destroy(&allocation).await {
            Ok(removed) => {
                let node_uuid = if removed.node_id == allocation.node_id {
                    node_uuid
                } else {
                    self.node_uuid(removed.node_id).await.unwrap_or(None)
                };
                self.emitter.emit(
                    event_types::ALLOCATION_DELETE,
                    NotificationLevel::Info,
                    NotificationStatus::End,
                    removed.payload(node_uuid),
                    request_id,
                );
                Ok(())
            }
            Err(e) => {
                self.emitter.emit(
                    event_types::ALLOCATION_DELETE,
                    NotificationLevel::Error,
                    NotificationStatus::Error,
                    allocation.payload(node_uuid),
                    request_id,
                );
                Err(e)
            }
        }
    }

    async fn find(&self, ident: &str) -> Result<Allocation, AllocationError> {
        let found = match parse_identity(ident)? {
            Identity::Uuid(uuid) => self.store.get_by_uuid(uuid).await?,
            Identity::Name(name) => self.store.get_by_name(&name).await?,
        };
        found.ok_or_else(|| AllocationError::not_found("allocation", ident))
    }

    async fn find_node(&self, node_ident: &str) -> Result<Option<Node>, AllocationError> {
        let identity = parse_identity(node_ident)?;
        Ok(self.inventory.lookup_node(&identity).await?)
    }

    async fn find_by_node(&self, node_ident: &str) -> Result<Allocation, AllocationError> {
        let node = self
            .find_node(node_ident)
            .await?
            .ok_or_else(|| AllocationError::not_found("node", node_ident))?;
        self.store
            .get_by_node(node.id)
            .await?
            .ok_or_else(|| AllocationError::not_found("allocation for node", node_ident))
    }

    async fn view(&self, allocation: Allocation) -> Result<AllocationView, AllocationError> {
        let node_uuid = self.node_uuid(allocation.node_id).await?;
        Ok(AllocationView {
            allocation,
            node_uuid,
        })
    }

    async fn node_uuid(&self, node_id: Option<NodeId>) -> Result<Option<Uuid>, AllocationError> {
        match node_id {
            Some(id) => Ok(self.inventory.get_node(id).await?.map(|n| n.uuid)),
            None => Ok(None),
        }
    }

    /// Resolves candidate identities to node UUIDs, keeping the first
    /// occurrence of each node.
    async fn resolve_candidates(
        &self,
        candidates: &[Identity],
    ) -> Result<Vec<Uuid>, AllocationError> {
        let mut resolved: Vec<Uuid> = Vec::with_capacity(candidates.len());
        for identity in candidates {
            let node = self.inventory.lookup_node(identity).await?.ok_or_else(|| {
                AllocationError::BadRequest(format!(
                    "Cannot use node {identity} as a candidate: it could not be found"
                ))
            })?;
            if !resolved.contains(&node.uuid) {
                resolved.push(node.uuid);
            }
        }
        Ok(resolved)
    }

    async fn ensure_unused(&self, uuid: Uuid, name: Option<&str>) -> Result<(), AllocationError> {
        if self.store.get_by_uuid(uuid).await?.is_some() {
            return Err(AllocationError::Duplicate(format!(
                "An allocation with UUID {uuid} already exists"
            )));
        }
        if let Some(name) = name {
            if self.store.get_by_name(name).await?.is_some() {
                return Err(AllocationError::Duplicate(format!(
                    "An allocation with name {name} already exists"
                )));
            }
        }
        Ok(())
    }

    async fn resolve_filter(&self, query: ListQuery) -> Result<AllocationFilter, AllocationError> {
        let state = query
            .state
            .map(|s| {
                s.parse::<AllocationState>()
                    .map_err(|e| AllocationError::BadRequest(e.to_string()))
            })
            .transpose()?;

        let node_id = match &query.node {
            Some(raw) => {
                let node = self.find_node(raw).await.map_err(|e| match e {
                    AllocationError::InvalidIdentity { .. } => {
                        AllocationError::BadRequest(format!("Invalid node identity {raw}"))
                    }
                    other => other,
                })?;
                let node = node.ok_or_else(|| {
                    AllocationError::BadRequest(format!("Node {raw} could not be found"))
                })?;
                Some(node.id)
            }
            None => None,
        };

        let sort_key = match query.sort_key.as_deref() {
            Some(raw) => raw.parse::<SortKey>()?,
            None => SortKey::default(),
        };
        let sort_dir = match query.sort_dir.as_deref() {
            Some(raw) => raw.parse::<SortDir>()?,
            None => SortDir::default(),
        };

        Ok(AllocationFilter {
            state,
            node_id,
            resource_class: query.resource_class,
            sort_key,
            sort_dir,
        })
    }
}

fn parse_identity(raw: &str) -> Result<Identity, AllocationError> {
    Identity::parse(raw).map_err(|source| AllocationError::InvalidIdentity {
        identity: raw.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::notify::RecordingNotifier;

    struct Fixture {
        storage: Storage,
        notifier: Arc<RecordingNotifier>,
        service: AllocationService,
    }

    fn fixture() -> Fixture {
        let storage = Storage::memory();
        let notifier = Arc::new(RecordingNotifier::new());
        let service = AllocationService::new(
            &storage,
            notifier.clone(),
            DispatcherConfig {
                workers: 2,
                mailbox: 16,
                match_timeout: Duration::from_secs(5),
            },
        );
        Fixture {
            storage,
            notifier,
            service,
        }
    }

    async fn settle(service: &AllocationService, ident: &str) -> AllocationView {
        for _ in 0..200 {
            let view = service.get(ident).await.unwrap();
            if view.allocation.state != AllocationState::Allocating {
                return view;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("allocation {ident} never left allocating");
    }

    #[tokio::test]
    async fn test_create_emits_start_then_end() {
        let f = fixture();
        f.service
            .enroll_node(NewNode::new("baremetal"))
            .await
            .unwrap();

        let created = f
            .service
            .create(AllocationRequest::new("baremetal"), Some(RequestId::new()))
            .await
            .unwrap();
        assert_eq!(created.allocation.state, AllocationState::Allocating);
        assert!(created.allocation.updated_at.is_none());

        let uuid = created.allocation.uuid;
        assert_eq!(
            f.notifier.flow(event_types::ALLOCATION_CREATE, uuid),
            vec![
                (NotificationStatus::Start, NotificationLevel::Info),
                (NotificationStatus::End, NotificationLevel::Info),
            ]
        );

        let settled = settle(&f.service, &uuid.to_string()).await;
        assert_eq!(settled.allocation.state, AllocationState::Active);
        assert!(settled.node_uuid.is_some());
    }

    #[tokio::test]
    async fn test_validation_failure_emits_nothing() {
        let f = fixture();
        let err = f
            .service
            .create(
                AllocationRequest::new("baremetal").with_candidate("invalid/name"),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AllocationError::BadRequest(_)));
        assert!(f.notifier.snapshot().is_empty());
        assert!(f
            .storage
            .allocations
            .list(&AllocationFilter::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_unknown_candidate_is_bad_request() {
        let f = fixture();
        let err = f
            .service
            .create(
                AllocationRequest::new("baremetal").with_candidate("absent-node"),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AllocationError::BadRequest(msg) if msg.contains("absent-node")));
    }

    #[tokio::test]
    async fn test_candidates_stored_as_uuids() {
        let f = fixture();
        let first = f
            .service
            .enroll_node(NewNode::new("baremetal").with_name("node-a"))
            .await
            .unwrap();
        let second = f
            .service
            .enroll_node(NewNode::new("baremetal").with_name("node-b"))
            .await
            .unwrap();

        let created = f
            .service
            .create(
                AllocationRequest::new("baremetal")
                    .with_candidate("node-b")
                    .with_candidate(first.uuid.to_string()),
                None,
            )
            .await
            .unwrap();
        assert_eq!(
            created.allocation.candidate_nodes,
            vec![second.uuid, first.uuid]
        );

        let settled = settle(&f.service, &created.allocation.uuid.to_string()).await;
        assert_eq!(settled.node_uuid, Some(second.uuid));
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let f = fixture();
        f.service
            .create(AllocationRequest::new("baremetal").with_name("alloc-1"), None)
            .await
            .unwrap();
        let before = f.notifier.snapshot().len();

        let err = f
            .service
            .create(AllocationRequest::new("baremetal").with_name("alloc-1"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AllocationError::Duplicate(_)));
        let after: Vec<_> = f.notifier.snapshot()[before..]
            .iter()
            .filter(|n| n.event_type == event_types::ALLOCATION_CREATE)
            .cloned()
            .collect();
        assert!(after.is_empty());
    }

    #[tokio::test]
    async fn test_missing_class_fails_allocation() {
        let f = fixture();
        let created = f
            .service
            .create(AllocationRequest::new("gpu"), None)
            .await
            .unwrap();

        let settled = settle(&f.service, &created.allocation.uuid.to_string()).await;
        assert_eq!(settled.allocation.state, AllocationState::Error);
        assert!(settled
            .allocation
            .last_error
            .unwrap()
            .contains("no valid node"));
    }

    #[tokio::test]
    async fn test_numeric_identity_rejected() {
        let f = fixture();
        let err = f.service.get("42").await.unwrap_err();
        assert!(matches!(err, AllocationError::InvalidIdentity { .. }));
    }

    #[tokio::test]
    async fn test_delete_emits_node_uuid() {
        let f = fixture();
        let node = f
            .service
            .enroll_node(NewNode::new("baremetal"))
            .await
            .unwrap();
        let created = f
            .service
            .create(AllocationRequest::new("baremetal").with_name("to-delete"), None)
            .await
            .unwrap();
        settle(&f.service, "to-delete").await;

        f.service.delete("to-delete", None).await.unwrap();

        let deletes: Vec<_> = f
            .notifier
            .snapshot()
            .into_iter()
            .filter(|n| n.event_type == event_types::ALLOCATION_DELETE)
            .collect();
        assert_eq!(deletes.len(), 2);
        assert_eq!(deletes[0].status, NotificationStatus::Start);
        assert_eq!(deletes[1].status, NotificationStatus::End);
        assert!(deletes.iter().all(|n| n.payload.node_uuid == Some(node.uuid)));
        assert_eq!(deletes[0].payload.uuid, created.allocation.uuid);

        let node = f.storage.inventory.get_node(node.id).await.unwrap().unwrap();
        assert!(node.is_available());
        assert!(matches!(
            f.service.get("to-delete").await.unwrap_err(),
            AllocationError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_delete_locked_node_conflicts() {
        let f = fixture();
        let node = f
            .service
            .enroll_node(NewNode::new("baremetal").with_name("node-1"))
            .await
            .unwrap();
        let created = f
            .service
            .create(AllocationRequest::new("baremetal"), None)
            .await
            .unwrap();
        let uuid = created.allocation.uuid;
        settle(&f.service, &uuid.to_string()).await;
        f.storage
            .inventory
            .set_task_lock(node.id, Some("deploying".into()))
            .await
            .unwrap();

        let err = f.service.delete_by_node("node-1", None).await.unwrap_err();
        assert!(matches!(err, AllocationError::NodeLocked { .. }));
        assert_eq!(
            f.notifier.flow(event_types::ALLOCATION_DELETE, uuid),
            vec![
                (NotificationStatus::Start, NotificationLevel::Info),
                (NotificationStatus::Error, NotificationLevel::Error),
            ]
        );
        assert!(f.service.get(&uuid.to_string()).await.is_ok());
    }

    #[tokio::test]
    async fn test_list_rejects_unknown_node_and_sort_key() {
        let f = fixture();
        let err = f
            .service
            .list(ListQuery {
                node: Some("absent".into()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AllocationError::BadRequest(_)));

        let err = f
            .service
            .list(ListQuery {
                sort_key: Some("extra".into()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AllocationError::BadRequest(msg) if msg.contains("extra")));
    }

    #[tokio::test]
    async fn test_recover_interrupted() {
        let f = fixture();
        let stranded = f
            .storage
            .allocations
            .create(NewAllocation {
                uuid: Uuid::new_v4(),
                name: None,
                resource_class: "baremetal".into(),
                traits: vec![],
                candidate_nodes: vec![],
                extra: Default::default(),
            })
            .await
            .unwrap();

        assert_eq!(f.service.recover_interrupted().await.unwrap(), 1);
        let view = f.service.get(&stranded.uuid.to_string()).await.unwrap();
        assert_eq!(view.allocation.state, AllocationState::Error);
        assert_eq!(view.allocation.last_error.as_deref(), Some(INTERRUPTED_REASON));
    }

    fn stranded_allocation() -> NewAllocation {
        NewAllocation {
            uuid: Uuid::new_v4(),
            name: None,
            resource_class: "baremetal".into(),
            traits: vec![],
            candidate_nodes: vec![],
            extra: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_recover_frees_nodes_reserved_before_restart() {
        let f = fixture();
        let node = f
            .service
            .enroll_node(NewNode::new("baremetal").with_name("node-1"))
            .await
            .unwrap();

        // The process stopped between reserving and recording the match.
        let stranded = f
            .storage
            .allocations
            .create(stranded_allocation())
            .await
            .unwrap();
        assert!(f
            .storage
            .inventory
            .try_reserve(node.id, stranded.uuid)
            .await
            .unwrap());

        assert_eq!(f.service.recover_interrupted().await.unwrap(), 1);
        let node = f.service.get_node("node-1").await.unwrap();
        assert!(node.reservation_holder.is_none());

        let created = f
            .service
            .create(AllocationRequest::new("baremetal"), None)
            .await
            .unwrap();
        let view = settle(&f.service, &created.allocation.uuid.to_string()).await;
        assert_eq!(view.allocation.state, AllocationState::Active);
        assert_eq!(view.node_uuid, Some(node.uuid));
    }

    #[tokio::test]
    async fn test_recover_frees_nodes_of_failed_allocations() {
        let f = fixture();
        let node = f
            .service
            .enroll_node(NewNode::new("baremetal"))
            .await
            .unwrap();

        // Failed by a timeout; its abandoned match reserved afterwards.
        let failed = f
            .storage
            .allocations
            .create(stranded_allocation())
            .await
            .unwrap();
        f.service
            .machine
            .on_match_failure(&failed, "matching timed out after 60.0s")
            .await
            .unwrap();
        f.storage
            .inventory
            .try_reserve(node.id, failed.uuid)
            .await
            .unwrap();

        assert_eq!(f.service.recover_interrupted().await.unwrap(), 0);
        let node = f.storage.inventory.get_node(node.id).await.unwrap().unwrap();
        assert!(node.reservation_holder.is_none());
    }

    #[tokio::test]
    async fn test_delete_frees_nodes_reserved_for_failed_allocation() {
        let f = fixture();
        let node = f
            .service
            .enroll_node(NewNode::new("baremetal"))
            .await
            .unwrap();
        let failed = f
            .storage
            .allocations
            .create(stranded_allocation())
            .await
            .unwrap();
        f.service
            .machine
            .on_match_failure(&failed, "no valid node found")
            .await
            .unwrap();
        f.storage
            .inventory
            .try_reserve(node.id, failed.uuid)
            .await
            .unwrap();

        f.service
            .delete(&failed.uuid.to_string(), None)
            .await
            .unwrap();
        let node = f.storage.inventory.get_node(node.id).await.unwrap().unwrap();
        assert!(node.reservation_holder.is_none());
    }

    #[tokio::test]
    async fn test_update_not_allowed() {
        let f = fixture();
        assert!(matches!(
            f.service.update("anything").unwrap_err(),
            AllocationError::MethodNotAllowed(_)
        ));
    }
}
