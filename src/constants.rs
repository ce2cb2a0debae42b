//! AVCTP Constants
//!
//! This module contains the constants used throughout the crate: pool sizes,
//! buffer capacities, protocol identifiers and result codes. Pool sizes are
//! compile-time limits; the control blocks live in fixed arrays.

use crate::l2cap::ProtocolServiceMultiplexer;

/// L2CAP PSM assigned to the AVCTP control channel
pub const AVCT_PSM: ProtocolServiceMultiplexer = 0x0017;

/// Maximum number of simultaneous AVCTP links (one per peer device)
pub const MAX_LINKS: usize = 2;

/// Maximum number of simultaneous profile connections across all links
pub const MAX_CONNECTIONS: usize = 3;

/// Smallest local MTU accepted by `register`
pub const AVCT_MIN_CONTROL_MTU: u16 = 48;

/// L2CAP default MTU, used when the peer does not signal one
pub const L2CAP_DEFAULT_MTU: u16 = 672;

/// Capacity of the reassembly buffer and of a single outbound message
pub const REASSEMBLY_BUFFER_SIZE: usize = 1024;

/// Largest AVCTP packet (header included) handed to L2CAP
pub const MAX_PACKET_SIZE: usize = 1024;

/// Number of outbound messages a link may hold while L2CAP is congested
pub const TX_QUEUE_DEPTH: usize = 4;

/// Result code reported in control events for locally detected failures
pub const RESULT_FAIL: u16 = 5;

/// Result code reported in control events on success
pub const RESULT_OK: u16 = 0;

/// Depth of the processor's request and event channels
pub const PROCESSOR_CHANNEL_DEPTH: usize = 4;

/// `BD_ADDR` length in bytes
pub const BD_ADDR_LENGTH: usize = 6;
