//! Exclusive node reservation.

use std::sync::Arc;

use metalloc_id::NodeId;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::AllocationError;
use crate::model::Node;
use crate::store::{NodeInventory, ReleaseOutcome};

/// Claims one node out of a candidate list.
#[derive(Clone)]
pub struct ReservationCoordinator {
    inventory: Arc<dyn NodeInventory>,
}

impl ReservationCoordinator {
    pub fn new(inventory: Arc<dyn NodeInventory>) -> Self {
        Self { inventory }
    }

    /// Reserves the first candidate that can still be claimed.
    ///
    /// A candidate taken by someone else since filtering is skipped, and so
    /// is one whose reservation attempt fails in storage. Fails with the
    /// last storage error if any attempt failed and nothing was reserved,
    /// otherwise with `NoValidNode` once every candidate has been tried.
    pub async fn reserve(&self, candidates: &[Node], holder: Uuid) -> Result<Node, AllocationError> {
        let mut failed: Vec<NodeId> = Vec::new();
        let mut last_error = None;

        for node in candidates {
            match self.inventory.try_reserve(node.id, holder).await {
                Ok(true) => {
                    debug!(allocation = %holder, node = %node.uuid, "Reserved node");
                    self.forget_attempts(&failed, holder).await;
                    let mut reserved = node.clone();
                    reserved.reservation_holder = Some(holder);
                    return Ok(reserved);
                }
                Ok(false) => debug!(
                    allocation = %holder,
                    node = %node.uuid,
                    "Node was claimed concurrently, trying next candidate"
                ),
                Err(e) => {
                    warn!(
                        allocation = %holder,
                        node = %node.uuid,
                        error = %e,
                        "Reservation attempt failed, trying next candidate"
                    );
                    failed.push(node.id);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) => Err(e.into()),
            None => Err(AllocationError::NoValidNode {
                considered: candidates.len(),
            }),
        }
    }

    /// Drops every reservation `holder` still has.
    pub async fn release_held_by(&self, holder: Uuid) -> Result<Vec<NodeId>, AllocationError> {
        let freed = self.inventory.release_held_by(holder).await?;
        if !freed.is_empty() {
            info!(allocation = %holder, count = freed.len(), "Released nodes held by allocation");
        }
        Ok(freed)
    }

    /// A failed attempt may still have landed; undo it once another node
    /// is ours.
    async fn forget_attempts(&self, nodes: &[NodeId], holder: Uuid) {
        for node_id in nodes {
            match self.inventory.release(*node_id, holder).await {
                Ok(ReleaseOutcome::Released) => {
                    debug!(allocation = %holder, node_id = %node_id, "Undid failed reservation attempt")
                }
                Ok(_) => {}
                Err(e) => warn!(
                    allocation = %holder,
                    node_id = %node_id,
                    error = %e,
                    "Could not undo failed reservation attempt"
                ),
            }
        }
    }

    /// Releases `holder`'s reservation on a node.
    ///
    /// Releasing a node that is not reserved, or reserved by someone else,
    /// changes nothing and is only logged. `NodeLocked` is the one failure
    /// passed back.
    pub async fn release(
        &self,
        node_id: NodeId,
        holder: Uuid,
    ) -> Result<ReleaseOutcome, AllocationError> {
        let outcome = self.inventory.release(node_id, holder).await?;
        match outcome {
            ReleaseOutcome::Released => {
                debug!(allocation = %holder, node_id = %node_id, "Released node")
            }
            ReleaseOutcome::NotReserved => warn!(
                allocation = %holder,
                node_id = %node_id,
                "Release requested for a node that is not reserved"
            ),
            ReleaseOutcome::HeldByOther(current) => warn!(
                allocation = %holder,
                node_id = %node_id,
                holder = %current,
                "Release requested for a node reserved by another allocation"
            ),
            ReleaseOutcome::NodeMissing => warn!(
                allocation = %holder,
                node_id = %node_id,
                "Release requested for a node that no longer exists"
            ),
        }
        Ok(outcome)
    }
}
