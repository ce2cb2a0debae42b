//! L2CAP (Logical Link Control and Adaptation Protocol) Contract
//!
//! AVCTP runs on top of an L2CAP connection-oriented channel but does not
//! implement L2CAP itself. This module defines the identifiers, result codes,
//! configuration parameters and the [`L2capTransport`] trait through which the
//! AVCTP layer drives the L2CAP implementation of the host stack.

pub mod transport;

pub use transport::{DataWriteStatus, L2capTransport, SecurityRequirements, TxPriority};

use crate::BluetoothAddress;
use crate::avct::Packet;

/// L2CAP Channel Identifier (CID)
///
/// Dynamically allocated channels start at 0x0040. The value 0x0000 is never a
/// valid channel and is used by [`L2capTransport::connect_request`] to signal
/// failure.
pub type ChannelId = u16;

/// L2CAP Protocol Service Multiplexer (PSM)
pub type ProtocolServiceMultiplexer = u16;

/// L2CAP reserved channel identifiers
pub mod cid {
    use super::ChannelId;

    /// Reserved - shall not be used
    pub const NULL: ChannelId = 0x0000;
    /// First dynamically allocated CID
    pub const DYNAMIC_START: ChannelId = 0x0040;
}

/// Connection Response Result Codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u16)]
pub enum ConnectionResult {
    /// Connection successful
    Success = 0x0000,
    /// Connection pending
    Pending = 0x0001,
    /// Connection refused - PSM not supported
    PsmNotSupported = 0x0002,
    /// Connection refused - security block
    SecurityBlock = 0x0003,
    /// Connection refused - no resources available
    NoResources = 0x0004,
}

impl ConnectionResult {
    /// Convert from raw u16 value
    #[must_use]
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0000 => Some(Self::Success),
            0x0001 => Some(Self::Pending),
            0x0002 => Some(Self::PsmNotSupported),
            0x0003 => Some(Self::SecurityBlock),
            0x0004 => Some(Self::NoResources),
            _ => None,
        }
    }
}

/// Configuration Result Codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u16)]
pub enum ConfigurationResult {
    /// Success
    #[default]
    Success = 0x0000,
    /// Failure - unacceptable parameters
    UnacceptableParameters = 0x0001,
    /// Failure - rejected (no reason provided)
    Rejected = 0x0002,
    /// Failure - unknown options
    UnknownOptions = 0x0003,
}

/// L2CAP Configuration Parameters
///
/// Carried by configuration requests, responses, indications and
/// confirmations. Options that are `None` are not present on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConfigurationOptions {
    /// Result of the configuration exchange (responses and confirmations only)
    pub result: ConfigurationResult,
    /// Maximum Transmission Unit the sender is able to receive
    pub mtu: Option<u16>,
    /// Flush timeout in milliseconds
    pub flush_timeout: Option<u16>,
}

impl ConfigurationOptions {
    /// Configuration request advertising only an MTU
    #[must_use]
    pub const fn with_mtu(mtu: u16) -> Self {
        Self {
            result: ConfigurationResult::Success,
            mtu: Some(mtu),
            flush_timeout: None,
        }
    }

    /// Positive configuration response without options
    #[must_use]
    pub const fn accepted() -> Self {
        Self {
            result: ConfigurationResult::Success,
            mtu: None,
            flush_timeout: None,
        }
    }

    /// Whether the exchange this carries succeeded
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.result == ConfigurationResult::Success
    }
}

/// L2CAP events delivered to the AVCTP layer
///
/// Transport glue that runs on another task posts these to the processor; see
/// [`crate::processor::post_l2cap_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum L2capEvent {
    /// The peer requests a channel on a registered PSM
    ConnectIndication {
        /// Requesting device
        peer: BluetoothAddress,
        /// Channel allocated for the request
        channel_id: ChannelId,
        /// Requested PSM
        psm: ProtocolServiceMultiplexer,
        /// Signalling identifier to echo in the response
        identifier: u8,
    },
    /// Outcome of a connect request
    ConnectConfirm {
        /// Channel returned by the connect request
        channel_id: ChannelId,
        /// 0 on success, otherwise an L2CAP result code
        result: u16,
    },
    /// The peer's configuration request
    ConfigIndication {
        /// Channel being configured
        channel_id: ChannelId,
        /// Options requested by the peer
        options: ConfigurationOptions,
    },
    /// Outcome of our configuration request
    ConfigConfirm {
        /// Channel being configured
        channel_id: ChannelId,
        /// Options and result of the exchange
        options: ConfigurationOptions,
    },
    /// The channel was disconnected by the peer or the link layer
    DisconnectIndication {
        /// Disconnected channel
        channel_id: ChannelId,
        /// Whether a disconnect response must be sent
        ack_needed: bool,
    },
    /// Outcome of a disconnect request
    DisconnectConfirm {
        /// Disconnected channel
        channel_id: ChannelId,
        /// L2CAP result code
        result: u16,
    },
    /// Transmit congestion changed
    Congestion {
        /// Affected channel
        channel_id: ChannelId,
        /// Whether the channel is now congested
        congested: bool,
    },
    /// One inbound packet
    Data {
        /// Receiving channel
        channel_id: ChannelId,
        /// Packet payload as received from L2CAP
        packet: Packet,
    },
}
