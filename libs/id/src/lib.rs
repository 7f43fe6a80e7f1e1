//! # metalloc-id
//!
//! Identity types, parsing, and naming rules for metalloc.
//!
//! ## Kinds of identity
//!
//! - **Record ids** (`AllocationId`, `NodeId`) are process-local integers
//!   assigned by storage. They are never accepted from clients.
//! - **UUIDs** are the stable, globally unique identity of allocations and
//!   nodes. Clients may supply one on create.
//! - **Logical names** are optional, unique, user-controlled labels drawn
//!   from the RFC 3986 unreserved character set.
//! - **Prefixed ids** (`RequestId`, `NotificationId`) are ULID-based and
//!   used for correlation only: `{prefix}_{ulid}`.
//!
//! Client-facing lookups go through [`Identity::parse`], which accepts a
//! UUID or a logical name and rejects anything numeric.

mod error;
mod identity;
mod macros;
mod types;

pub use error::IdError;
pub use identity::{is_int_like, is_uuid_like, is_valid_logical_name, Identity, MAX_NAME_LENGTH};
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
/// Re-export uuid so consumers agree on one version.
pub use uuid::Uuid;
