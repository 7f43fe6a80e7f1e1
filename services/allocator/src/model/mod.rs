//! Records the allocator owns (allocations) and reads (nodes).

mod allocation;
mod node;
pub mod validation;

pub use allocation::{
    Allocation, AllocationFilter, AllocationRequest, AllocationView, FinishMatch, ListQuery,
    MatchOutcome, NewAllocation, SortDir, SortKey,
};
pub use node::{NewNode, Node};
