//! AVCTP (Audio/Video Control Transport Protocol) connection layer
//!
//! [`Avct`] multiplexes profile connections (CCBs) over one L2CAP channel per
//! peer (LCBs). Upper-layer calls and L2CAP callbacks are both turned into link
//! events and run through the link state machine of the addressed LCB.
//!
//! All methods take `&mut self`; an event and the actions it triggers always
//! run to completion before the next one is processed.

mod actions;
mod ccb;
mod l2cap;
mod lcb;
pub mod packet;
pub mod reassembly;
mod state_machine;

#[cfg(test)]
pub(crate) mod test_support;

pub use lcb::{ChannelState, LinkInfo, LinkState};
pub use packet::{Fragmenter, PacketHeader, PacketType};
pub use reassembly::{AssembledMessage, Reassembler};

use crate::BluetoothAddress;
use crate::constants::{
    AVCT_MIN_CONTROL_MTU, AVCT_PSM, L2CAP_DEFAULT_MTU, MAX_PACKET_SIZE, REASSEMBLY_BUFFER_SIZE,
};
use crate::l2cap::{L2capTransport, SecurityRequirements};
use bitflags::bitflags;
use ccb::CcbStore;
use lcb::LcbStore;
use state_machine::LinkEvent;

/// A complete AVCTP message payload
pub type Message = heapless::Vec<u8, REASSEMBLY_BUFFER_SIZE>;

/// One AVCTP packet, header included
pub type Packet = heapless::Vec<u8, MAX_PACKET_SIZE>;

/// Largest transaction label
pub const MAX_LABEL: u8 = 0x0F;

/// Index of an LCB in the link store
pub(crate) type LinkIndex = usize;

/// Role of a connection when it is created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Role {
    /// Opens the L2CAP channel to the peer
    Initiator,
    /// Waits for the peer to open the channel
    Acceptor,
}

bitflags! {
    /// Control role of a connection
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ControlFlags: u8 {
        /// The connection is an AVRCP target
        const TARGET = 0x01;
        /// The connection is an AVRCP controller
        const CONTROLLER = 0x02;
        /// Yield to the peer's channel when both sides connect at once
        const PASSIVE = 0x04;
    }
}

/// Control events delivered to [`ConnectionCallbacks::on_control_event`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ControlEvent {
    /// Outcome of a locally requested connection
    ConnectConfirm,
    /// An acceptor connection was bound to a peer-opened channel
    ConnectIndication,
    /// A locally requested disconnection completed
    DisconnectConfirm,
    /// The peer or the transport tore the connection down
    DisconnectIndication,
    /// L2CAP is congested; outbound packets are being queued
    CongestionIndication,
    /// L2CAP is no longer congested
    UncongestionIndication,
}

/// Command/response marker of an AVCTP message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum CommandResponse {
    /// Command
    Command = 0x00,
    /// Response
    Response = 0x02,
    /// Reject sent for a command with an unknown PID
    Reject = 0x03,
}

impl TryFrom<u8> for CommandResponse {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::Command),
            0x02 => Ok(Self::Response),
            0x03 => Ok(Self::Reject),
            other => Err(other),
        }
    }
}

/// Handle of a profile connection
///
/// A handle stops resolving once its connection is released, even if the
/// underlying slot is reused by a later connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnectionHandle {
    index: u8,
    generation: u8,
}

impl ConnectionHandle {
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) const fn new(index: usize, generation: u8) -> Self {
        Self {
            index: index as u8,
            generation,
        }
    }

    /// Slot index of the connection
    #[must_use]
    pub const fn index(self) -> usize {
        self.index as usize
    }

    /// Generation of the slot when the handle was issued
    #[must_use]
    pub const fn generation(self) -> u8 {
        self.generation
    }
}

/// Callbacks a profile registers for one connection
///
/// Callbacks run on the task that drives [`Avct`] and must not block.
pub trait ConnectionCallbacks: Sync {
    /// Connection, disconnection and congestion notifications
    ///
    /// `result` is 0 on success or a transport result code.
    fn on_control_event(
        &self,
        handle: ConnectionHandle,
        event: ControlEvent,
        result: u16,
        peer: BluetoothAddress,
    );

    /// A complete inbound message for this connection's PID
    fn on_message(&self, handle: ConnectionHandle, label: u8, cr: CommandResponse, payload: &[u8]);
}

/// Parameters of a new connection
#[derive(Clone, Copy)]
pub struct ConnectionConfig<'a> {
    /// Profile identifier (e.g. `0x110E` for AVRCP)
    pub pid: u16,
    /// Whether this side opens the channel
    pub role: Role,
    /// Control role flags
    pub control: ControlFlags,
    /// Event and message sink
    pub callbacks: &'a dyn ConnectionCallbacks,
}

impl core::fmt::Debug for ConnectionConfig<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("pid", &self.pid)
            .field("role", &self.role)
            .field("control", &self.control)
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for ConnectionConfig<'_> {
    fn format(&self, f: defmt::Formatter<'_>) {
        defmt::write!(
            f,
            "ConnectionConfig {{ pid: {=u16:#x}, role: {}, control: {=u8:#x} }}",
            self.pid,
            self.role,
            self.control.bits()
        );
    }
}

/// Message handed to the link state machine by [`Avct::send_message`]
#[derive(Debug)]
pub(crate) struct OutboundMessage {
    pub handle: ConnectionHandle,
    pub label: u8,
    pub cr: CommandResponse,
    pub message: Message,
}

/// AVCTP errors returned synchronously by the API
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AvctError {
    /// No free connection or link control block
    NoResources,
    /// Unknown, released or out of range handle
    BadHandle,
    /// Another connection already uses this PID on the link
    PidInUse,
    /// The connection is not bound to a link
    NotOpen,
    /// [`Avct::register`] has not been called
    NotRegistered,
    /// [`Avct::register`] was called twice
    AlreadyRegistered,
    /// The transport refused the PSM registration
    RegistrationFailed,
    /// Connections must be removed before deregistering
    ConnectionsActive,
    /// The processor answered with an unexpected response
    UnexpectedResponse,
}

impl core::fmt::Display for AvctError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NoResources => write!(f, "No resources"),
            Self::BadHandle => write!(f, "Bad connection handle"),
            Self::PidInUse => write!(f, "PID already in use on this link"),
            Self::NotOpen => write!(f, "Connection not open"),
            Self::NotRegistered => write!(f, "AVCTP not registered"),
            Self::AlreadyRegistered => write!(f, "AVCTP already registered"),
            Self::RegistrationFailed => write!(f, "PSM registration failed"),
            Self::ConnectionsActive => write!(f, "Connections still active"),
            Self::UnexpectedResponse => write!(f, "Unexpected response"),
        }
    }
}

/// The AVCTP connection layer
pub struct Avct<'a, T: L2capTransport> {
    transport: T,
    registered: bool,
    local_mtu: u16,
    ccbs: CcbStore<'a>,
    lcbs: LcbStore,
}

impl<'a, T: L2capTransport> Avct<'a, T> {
    /// Create an unregistered instance driving `transport`
    #[must_use]
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            registered: false,
            local_mtu: AVCT_MIN_CONTROL_MTU,
            ccbs: CcbStore::new(),
            lcbs: LcbStore::new(),
        }
    }

    /// Register the AVCTP PSM with the transport
    ///
    /// `local_mtu` is raised to [`AVCT_MIN_CONTROL_MTU`] if smaller.
    ///
    /// # Errors
    ///
    /// Returns [`AvctError::AlreadyRegistered`] if called twice without a
    /// [`deregister`](Self::deregister), or [`AvctError::RegistrationFailed`]
    /// if the transport refuses the PSM.
    pub fn register(
        &mut self,
        local_mtu: u16,
        security: SecurityRequirements,
    ) -> Result<(), AvctError> {
        if self.registered {
            return Err(AvctError::AlreadyRegistered);
        }
        if !self.transport.register_psm(AVCT_PSM, security) {
            error!("[AVCT] PSM {:#x} registration refused", AVCT_PSM);
            return Err(AvctError::RegistrationFailed);
        }

        self.ccbs.clear();
        self.lcbs.clear();
        let max_mtu = u16::try_from(MAX_PACKET_SIZE).unwrap_or(u16::MAX);
        self.local_mtu = local_mtu.clamp(AVCT_MIN_CONTROL_MTU, max_mtu);
        self.registered = true;
        info!("[AVCT] Registered, local mtu {}", self.local_mtu);
        Ok(())
    }

    /// Remove the PSM registration
    ///
    /// # Errors
    ///
    /// Returns [`AvctError::NotRegistered`] if not registered and
    /// [`AvctError::ConnectionsActive`] while any connection exists.
    pub fn deregister(&mut self) -> Result<(), AvctError> {
        self.ensure_registered()?;
        if self.ccbs.any_allocated() {
            warn!("[AVCT] Deregister with connections still allocated");
            return Err(AvctError::ConnectionsActive);
        }

        // Channels still being set up have no connection to tear them down
        for channel_id in self.lcbs.channel_ids() {
            debug!("[AVCT] Disconnecting unowned cid {:#x}", channel_id);
            self.transport.disconnect_request(channel_id);
        }
        self.transport.deregister_psm(AVCT_PSM);
        self.lcbs.clear();
        self.registered = false;
        info!("[AVCT] Deregistered");
        Ok(())
    }

    /// Create a profile connection to `peer`
    ///
    /// An initiator starts opening the channel right away; an acceptor waits
    /// for the peer. The outcome is reported through the connection's
    /// callbacks.
    ///
    /// # Errors
    ///
    /// Returns [`AvctError::NoResources`] if no CCB or LCB is free and
    /// [`AvctError::PidInUse`] if the peer's link already carries `config.pid`.
    pub fn create_connection(
        &mut self,
        config: ConnectionConfig<'a>,
        peer: BluetoothAddress,
    ) -> Result<ConnectionHandle, AvctError> {
        self.ensure_registered()?;
        let handle = self.ccbs.allocate(config)?;
        debug!(
            "[AVCT] Create connection {:?} pid {:#x} role {:?}",
            handle, config.pid, config.role
        );

        if config.role == Role::Initiator {
            let link = match self.lcbs.find_by_peer_address(&peer) {
                Some(link) => {
                    if self.ccbs.find_by_pid_on_link(link, config.pid).is_some() {
                        self.ccbs.deallocate(handle);
                        return Err(AvctError::PidInUse);
                    }
                    link
                }
                None => match self.lcbs.allocate(peer) {
                    Ok(link) => link,
                    Err(e) => {
                        self.ccbs.deallocate(handle);
                        return Err(e);
                    }
                },
            };

            self.ccbs.get_mut(handle)?.link = Some(link);
            self.link_event(link, LinkEvent::BindRequest(handle));
        }

        Ok(handle)
    }

    /// Remove a profile connection
    ///
    /// An unbound connection is released immediately without a callback. A
    /// bound one is unbound from its link, and the link is closed if it was
    /// the last connection on it; the callback reports completion.
    ///
    /// # Errors
    ///
    /// Returns [`AvctError::BadHandle`] for an unknown handle.
    pub fn remove_connection(&mut self, handle: ConnectionHandle) -> Result<(), AvctError> {
        self.ensure_registered()?;
        match self.ccbs.get(handle)?.link {
            None => {
                self.ccbs.deallocate(handle);
            }
            Some(link) => self.link_event(link, LinkEvent::UnbindRequest(handle)),
        }
        Ok(())
    }

    /// Send a message on a connection
    ///
    /// The message is dropped on error.
    ///
    /// # Errors
    ///
    /// Returns [`AvctError::BadHandle`] for an unknown handle and
    /// [`AvctError::NotOpen`] if the connection is not bound to a link.
    pub fn send_message(
        &mut self,
        handle: ConnectionHandle,
        label: u8,
        cr: CommandResponse,
        message: Message,
    ) -> Result<(), AvctError> {
        self.ensure_registered()?;
        let Some(link) = self.ccbs.get(handle)?.link else {
            return Err(AvctError::NotOpen);
        };

        self.link_event(
            link,
            LinkEvent::SendMessage(OutboundMessage {
                handle,
                label,
                cr,
                message,
            }),
        );
        Ok(())
    }

    /// MTU of the peer a connection is bound to
    ///
    /// Unbound connections report [`L2CAP_DEFAULT_MTU`].
    ///
    /// # Errors
    ///
    /// Returns [`AvctError::BadHandle`] for an unknown handle.
    pub fn get_peer_mtu(&self, handle: ConnectionHandle) -> Result<u16, AvctError> {
        self.ensure_registered()?;
        let mtu = self
            .ccbs
            .get(handle)?
            .link
            .and_then(|link| self.lcbs.get(link))
            .map_or(L2CAP_DEFAULT_MTU, |lcb| lcb.peer_mtu);
        Ok(mtu)
    }

    /// Local MTU advertised in configuration requests
    #[must_use]
    pub fn local_mtu(&self) -> u16 {
        self.local_mtu
    }

    /// Whether [`register`](Self::register) succeeded
    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.registered
    }

    /// Snapshot of the link to `peer`, if one exists
    #[must_use]
    pub fn link_info(&self, peer: &BluetoothAddress) -> Option<LinkInfo> {
        self.lcbs
            .find_by_peer_address(peer)
            .and_then(|link| self.lcbs.get(link))
            .map(lcb::Lcb::info)
    }

    /// The transport driven by this instance
    #[must_use]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Mutable access to the transport
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    fn ensure_registered(&self) -> Result<(), AvctError> {
        if self.registered {
            Ok(())
        } else {
            Err(AvctError::NotRegistered)
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use crate::avct::test_support::{
        MockTransport, PEER, PEER_B, Recorded, Recorder, acceptor, configure, initiator,
        open_link, registered,
    };
    use crate::constants::{MAX_CONNECTIONS, MAX_LINKS, RESULT_OK};
    use crate::l2cap::ConfigurationOptions;
    use std::vec;
    use std::vec::Vec;

    #[test]
    fn test_command_response_try_from() {
        assert_eq!(CommandResponse::try_from(0), Ok(CommandResponse::Command));
        assert_eq!(CommandResponse::try_from(2), Ok(CommandResponse::Response));
        assert_eq!(CommandResponse::try_from(3), Ok(CommandResponse::Reject));
        assert_eq!(CommandResponse::try_from(1), Err(1));
    }

    #[test]
    fn test_register_raises_mtu_floor() {
        let mut avct = Avct::new(MockTransport::default());
        avct.register(20, SecurityRequirements::AUTHENTICATE).unwrap();
        assert_eq!(avct.local_mtu(), AVCT_MIN_CONTROL_MTU);
        assert!(avct.is_registered());
        assert_eq!(
            avct.transport().registered_psm,
            Some((AVCT_PSM, SecurityRequirements::AUTHENTICATE))
        );
    }

    #[test]
    fn test_register_caps_mtu_at_packet_size() {
        let recorder = Recorder::default();
        let mut avct = registered(2000);
        assert_eq!(avct.local_mtu(), 1024);

        let handle = avct
            .create_connection(acceptor(&recorder, 0x110E), PEER)
            .unwrap();
        avct.connect_indication(PEER, 0x41, AVCT_PSM, 1);
        assert_eq!(
            avct.transport().config_requests,
            vec![(0x41, ConfigurationOptions::with_mtu(1024))]
        );
        configure(&mut avct, 0x41, 48);

        // A single packet filling the advertised MTU arrives whole
        let mut packet = vec![0x00, 0x11, 0x0E];
        let payload: Vec<u8> = (0..MAX_PACKET_SIZE - 3).map(|i| i as u8).collect();
        packet.extend_from_slice(&payload);
        avct.data_indication(0x41, &packet);
        assert_eq!(
            recorder.take().last(),
            Some(&Recorded::Message(handle, 0, CommandResponse::Command, payload))
        );
    }

    #[test]
    fn test_register_twice_fails() {
        let mut avct = Avct::new(MockTransport::default());
        avct.register(672, SecurityRequirements::NONE).unwrap();
        assert_eq!(
            avct.register(672, SecurityRequirements::NONE),
            Err(AvctError::AlreadyRegistered)
        );
        assert_eq!(avct.local_mtu(), 672);
    }

    #[test]
    fn test_register_refused_by_transport() {
        let transport = MockTransport {
            refuse_psm: true,
            ..MockTransport::default()
        };
        let mut avct = Avct::new(transport);
        assert_eq!(
            avct.register(672, SecurityRequirements::NONE),
            Err(AvctError::RegistrationFailed)
        );
        assert!(!avct.is_registered());
    }

    #[test]
    fn test_calls_before_register_fail() {
        let recorder = Recorder::default();
        let mut avct = Avct::new(MockTransport::default());
        assert_eq!(avct.deregister(), Err(AvctError::NotRegistered));
        assert_eq!(
            avct.create_connection(initiator(&recorder, 0x110E), PEER),
            Err(AvctError::NotRegistered)
        );
        let handle = ConnectionHandle::new(0, 0);
        assert_eq!(avct.remove_connection(handle), Err(AvctError::NotRegistered));
        assert_eq!(avct.get_peer_mtu(handle), Err(AvctError::NotRegistered));
        assert_eq!(
            avct.send_message(handle, 0, CommandResponse::Command, Message::new()),
            Err(AvctError::NotRegistered)
        );
    }

    #[test]
    fn test_deregister_with_live_connections() {
        let recorder = Recorder::default();
        let mut avct = registered(48);
        let handle = avct
            .create_connection(acceptor(&recorder, 0x110E), PEER)
            .unwrap();

        assert_eq!(avct.deregister(), Err(AvctError::ConnectionsActive));
        assert!(avct.is_registered());

        avct.remove_connection(handle).unwrap();
        assert_eq!(avct.deregister(), Ok(()));
        assert!(!avct.is_registered());
        assert_eq!(avct.transport().registered_psm, None);
    }

    #[test]
    fn test_deregister_disconnects_channel_without_connections() {
        let mut avct = registered(48);
        avct.connect_indication(PEER, 0x41, AVCT_PSM, 1);
        assert_eq!(
            avct.link_info(&PEER).unwrap().channel_state,
            ChannelState::Configuring
        );

        assert_eq!(avct.deregister(), Ok(()));
        assert_eq!(avct.transport().disconnect_requests, vec![0x41]);
        assert!(avct.link_info(&PEER).is_none());
    }

    #[test]
    fn test_acceptor_does_not_open_channel() {
        let recorder = Recorder::default();
        let mut avct = registered(48);
        let handle = avct
            .create_connection(acceptor(&recorder, 0x110E), PEER)
            .unwrap();

        assert!(avct.transport().connect_requests.is_empty());
        assert!(avct.link_info(&PEER).is_none());
        assert_eq!(avct.get_peer_mtu(handle), Ok(L2CAP_DEFAULT_MTU));
        assert_eq!(
            avct.send_message(handle, 0, CommandResponse::Command, Message::new()),
            Err(AvctError::NotOpen)
        );

        // Unbound removal is silent
        avct.remove_connection(handle).unwrap();
        assert!(recorder.take().is_empty());
        assert_eq!(avct.get_peer_mtu(handle), Err(AvctError::BadHandle));
    }

    #[test]
    fn test_initiator_opens_channel() {
        let recorder = Recorder::default();
        let mut avct = registered(48);
        avct.create_connection(initiator(&recorder, 0x110E), PEER)
            .unwrap();

        assert_eq!(avct.transport().connect_requests.as_slice(), &[(AVCT_PSM, PEER)]);
        let info = avct.link_info(&PEER).unwrap();
        assert_eq!(info.state, LinkState::Opening);
        assert_eq!(info.channel_state, ChannelState::Connecting);
        assert_eq!(info.channel_id, 0x40);
    }

    #[test]
    fn test_pid_in_use_on_same_link() {
        let recorder = Recorder::default();
        let mut avct = registered(48);
        let first = avct
            .create_connection(initiator(&recorder, 0x110E), PEER)
            .unwrap();

        assert_eq!(
            avct.create_connection(initiator(&recorder, 0x110E), PEER),
            Err(AvctError::PidInUse)
        );
        // Same PID towards another peer is fine
        avct.create_connection(initiator(&recorder, 0x110E), PEER_B)
            .unwrap();
        assert_eq!(avct.get_peer_mtu(first), Ok(L2CAP_DEFAULT_MTU));
    }

    #[test]
    fn test_connection_pool_exhaustion() {
        let recorder = Recorder::default();
        let mut avct = registered(48);
        let handles: std::vec::Vec<_> = (0..MAX_CONNECTIONS)
            .map(|i| {
                avct.create_connection(acceptor(&recorder, 0x1000 + i as u16), PEER)
                    .unwrap()
            })
            .collect();

        assert_eq!(
            avct.create_connection(acceptor(&recorder, 0x2000), PEER),
            Err(AvctError::NoResources)
        );
        for handle in handles {
            assert_eq!(avct.get_peer_mtu(handle), Ok(L2CAP_DEFAULT_MTU));
        }
    }

    #[test]
    fn test_link_pool_exhaustion_releases_ccb() {
        let recorder = Recorder::default();
        let mut avct = registered(48);
        for i in 0..MAX_LINKS {
            let peer = BluetoothAddress::new([0x10, 0, 0, 0, 0, i as u8]);
            avct.create_connection(initiator(&recorder, 0x110E), peer)
                .unwrap();
        }

        let extra = BluetoothAddress::new([0x20, 0, 0, 0, 0, 0]);
        assert_eq!(
            avct.create_connection(initiator(&recorder, 0x110E), extra),
            Err(AvctError::NoResources)
        );
        // The CCB taken for the failed attempt was released again
        avct.create_connection(acceptor(&recorder, 0x110F), extra)
            .unwrap();
    }

    #[test]
    fn test_handle_valid_until_removal_completes() {
        let recorder = Recorder::default();
        let mut avct = registered(48);
        let (handle, cid) = open_link(&mut avct, &recorder, 0x110E);

        let message = Message::from_slice(&[1, 2, 3]).unwrap();
        avct.send_message(handle, 1, CommandResponse::Command, message)
            .unwrap();
        assert_eq!(avct.get_peer_mtu(handle), Ok(48));

        avct.remove_connection(handle).unwrap();
        // Last connection on the link: the channel is closed first
        assert_eq!(avct.transport().disconnect_requests.as_slice(), &[cid]);
        assert_eq!(avct.get_peer_mtu(handle), Ok(48));

        avct.disconnect_confirm(cid, 0);
        assert_eq!(
            recorder.take().as_slice(),
            &[Recorded::Control(handle, ControlEvent::DisconnectConfirm, RESULT_OK, PEER)]
        );
        assert_eq!(avct.get_peer_mtu(handle), Err(AvctError::BadHandle));
        assert_eq!(avct.remove_connection(handle), Err(AvctError::BadHandle));
        assert_eq!(
            avct.send_message(handle, 1, CommandResponse::Command, Message::new()),
            Err(AvctError::BadHandle)
        );
        assert!(avct.link_info(&PEER).is_none());
    }
}
