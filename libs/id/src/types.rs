//! Typed ID definitions.

use crate::{define_id, define_record_id};

// =============================================================================
// Record ids
// =============================================================================

define_record_id!(AllocationId);
define_record_id!(NodeId);

// =============================================================================
// Correlation ids
// =============================================================================

define_id!(RequestId, "req");
define_id!(NotificationId, "ntf");

// =============================================================================
// Tests
// =============================================================================
