//! The allocation core.
//!
//! A create request is validated and persisted in `allocating`, then handed
//! to the [`Dispatcher`]. A worker asks the [`CandidateFilter`] for eligible
//! nodes, the [`ReservationCoordinator`] claims one, and the
//! [`AllocationMachine`] records the outcome.

mod dispatcher;
mod error;
mod filter;
mod machine;
mod reservation;
mod service;

pub use dispatcher::{
    DispatchError, Dispatcher, DispatcherConfig, HashRoute, Matcher, Route, RoundRobinRoute,
    SHUTDOWN_REASON,
};
pub use error::AllocationError;
pub use filter::{is_eligible, CandidateFilter};
pub use machine::AllocationMachine;
pub use reservation::ReservationCoordinator;
pub use service::{AllocationService, INTERRUPTED_REASON};
