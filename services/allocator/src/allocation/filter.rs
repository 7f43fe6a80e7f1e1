//! Candidate filtering.

use std::sync::Arc;

use tracing::debug;

use super::AllocationError;
use crate::model::{Allocation, Node};
use crate::store::NodeInventory;

/// Produces the ordered set of nodes eligible for an allocation.
#[derive(Clone)]
pub struct CandidateFilter {
    inventory: Arc<dyn NodeInventory>,
}

impl CandidateFilter {
    pub fn new(inventory: Arc<dyn NodeInventory>) -> Self {
        Self { inventory }
    }

    /// Eligible nodes, first choice first.
    ///
    /// With explicit candidates the result keeps the candidate order;
    /// otherwise it follows the inventory's id order. Fails with
    /// `ResourceClassNotFound` only when no node of the class exists at all.
    pub async fn filter(&self, allocation: &Allocation) -> Result<Vec<Node>, AllocationError> {
        let class_nodes = self
            .inventory
            .list_nodes_by_class(&allocation.resource_class)
            .await?;
        if class_nodes.is_empty() {
            return Err(AllocationError::ResourceClassNotFound(
                allocation.resource_class.clone(),
            ));
        }

        let search_space: Vec<Node> = if allocation.candidate_nodes.is_empty() {
            class_nodes
        } else {
            allocation
                .candidate_nodes
                .iter()
                .filter_map(|uuid| class_nodes.iter().find(|n| n.uuid == *uuid).cloned())
                .collect()
        };

        let eligible: Vec<Node> = search_space
            .into_iter()
            .filter(|node| is_eligible(node, allocation))
            .collect();

        debug!(
            allocation = %allocation.uuid,
            resource_class = %allocation.resource_class,
            eligible = eligible.len(),
            "Filtered candidate nodes"
        );
        Ok(eligible)
    }
}

/// Class, traits and availability all have to line up.
pub fn is_eligible(node: &Node, allocation: &Allocation) -> bool {
    node.resource_class == allocation.resource_class
        && node.has_traits(&allocation.traits)
        && node.is_available()
}
