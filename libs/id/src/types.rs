//! Typed ID definitions for all convoy resources.

use crate::{define_id, define_name};

// =============================================================================
// Operator-chosen names
// =============================================================================

define_name!(HostId);
define_name!(ServiceId);
define_name!(PoolId);

// =============================================================================
// Generated IDs
// =============================================================================

define_id!(InstanceId, "inst");
define_id!(SnapshotRequestId, "snapreq");

// =============================================================================
// Tests
// =============================================================================
