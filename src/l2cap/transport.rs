//! L2CAP transport trait
//!
//! Every primitive is asynchronous in the request/callback sense: a request
//! returns immediately and its outcome arrives later through one of the
//! callbacks on [`crate::avct::Avct`]. Implementations must never call back
//! into the AVCTP layer from inside one of these methods.

use super::{ChannelId, ConfigurationOptions, ConnectionResult, ProtocolServiceMultiplexer};
use crate::BluetoothAddress;

/// Outcome of [`L2capTransport::data_write`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DataWriteStatus {
    /// Packet accepted
    Success,
    /// Packet accepted, but the channel is now congested
    Congested,
    /// Packet rejected (unknown channel or no buffers)
    Failed,
}

/// Transmit priority of an L2CAP channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum TxPriority {
    /// Serviced before medium and low priority channels
    High = 0x00,
    /// Default priority
    Medium = 0x01,
    /// Serviced last
    Low = 0x02,
}

/// Security requirements registered for the AVCTP PSM
///
/// The value is opaque to AVCTP and forwarded unchanged to the security
/// manager of the host stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SecurityRequirements(pub u8);

impl SecurityRequirements {
    /// No security required
    pub const NONE: Self = Self(0x00);
    /// Authentication required
    pub const AUTHENTICATE: Self = Self(0x12);
    /// Authentication and encryption required
    pub const ENCRYPT: Self = Self(0x36);
}

/// Requests the AVCTP layer issues to L2CAP
pub trait L2capTransport {
    /// Register a PSM so that inbound connections are routed to AVCTP
    ///
    /// Returns `false` if the PSM could not be registered.
    fn register_psm(
        &mut self,
        psm: ProtocolServiceMultiplexer,
        security: SecurityRequirements,
    ) -> bool;

    /// Remove a PSM registration
    fn deregister_psm(&mut self, psm: ProtocolServiceMultiplexer);

    /// Start an outgoing channel; returns the local CID, or 0 on failure
    fn connect_request(
        &mut self,
        psm: ProtocolServiceMultiplexer,
        peer: BluetoothAddress,
    ) -> ChannelId;

    /// Answer an inbound connection request
    fn connect_response(
        &mut self,
        peer: BluetoothAddress,
        identifier: u8,
        channel_id: ChannelId,
        result: ConnectionResult,
    );

    /// Send the local configuration request
    fn config_request(&mut self, channel_id: ChannelId, options: &ConfigurationOptions);

    /// Answer the peer's configuration request
    fn config_response(&mut self, channel_id: ChannelId, options: &ConfigurationOptions);

    /// Request channel disconnection
    fn disconnect_request(&mut self, channel_id: ChannelId);

    /// Acknowledge a peer-initiated disconnection
    fn disconnect_response(&mut self, channel_id: ChannelId);

    /// Write one packet to an open channel
    fn data_write(&mut self, channel_id: ChannelId, packet: &[u8]) -> DataWriteStatus;

    /// Change the transmit priority of a channel
    fn set_tx_priority(&mut self, channel_id: ChannelId, priority: TxPriority);
}
