//! Typed ID definitions.

use crate::define_id;

// =============================================================================
// Fleet
// =============================================================================

// A node's own instance identifier; doubles as the lease holder id.
define_id!(NodeId, "node");

// =============================================================================
// Zonal resources
// =============================================================================

define_id!(ResourceId, "resource");
define_id!(AttachmentId, "attachment");

// =============================================================================
// Tests
// =============================================================================
