//! L2CAP adaptation
//!
//! The L2CAP layer reports channel progress through the methods below. They
//! run the channel setup (connection, configuration in both directions,
//! connection races) and feed the resulting link events to the state machine.

use super::lcb::{ChannelState, ConfigFlags};
use super::state_machine::LinkEvent;
use super::{Avct, LinkIndex};
use crate::BluetoothAddress;
use crate::constants::{AVCT_PSM, L2CAP_DEFAULT_MTU, RESULT_FAIL};
use crate::l2cap::{
    ChannelId, ConfigurationOptions, ConnectionResult, L2capEvent, L2capTransport,
    ProtocolServiceMultiplexer, cid,
};

impl<T: L2capTransport> Avct<'_, T> {
    /// Dispatch one event reported by the L2CAP layer
    pub fn handle_l2cap_event(&mut self, event: &L2capEvent) {
        match *event {
            L2capEvent::ConnectIndication {
                peer,
                channel_id,
                psm,
                identifier,
            } => self.connect_indication(peer, channel_id, psm, identifier),
            L2capEvent::ConnectConfirm { channel_id, result } => {
                self.connect_confirm(channel_id, result);
            }
            L2capEvent::ConfigIndication {
                channel_id,
                ref options,
            } => self.config_indication(channel_id, options),
            L2capEvent::ConfigConfirm {
                channel_id,
                ref options,
            } => self.config_confirm(channel_id, options),
            L2capEvent::DisconnectIndication {
                channel_id,
                ack_needed,
            } => self.disconnect_indication(channel_id, ack_needed),
            L2capEvent::DisconnectConfirm { channel_id, result } => {
                self.disconnect_confirm(channel_id, result);
            }
            L2capEvent::Congestion {
                channel_id,
                congested,
            } => self.congestion_status(channel_id, congested),
            L2capEvent::Data {
                channel_id,
                ref packet,
            } => self.data_indication(channel_id, packet),
        }
    }

    /// The peer requests a channel
    ///
    /// A second channel to a peer that already has one is only accepted while
    /// the existing channel is not open and the link is passive; the existing
    /// channel is then parked as the conflict channel.
    pub fn connect_indication(
        &mut self,
        peer: BluetoothAddress,
        channel_id: ChannelId,
        psm: ProtocolServiceMultiplexer,
        identifier: u8,
    ) {
        if !self.registered || psm != AVCT_PSM {
            warn!("[L2CAP] Connect indication for unregistered psm {:#x}", psm);
            self.transport.connect_response(
                peer,
                identifier,
                channel_id,
                ConnectionResult::PsmNotSupported,
            );
            return;
        }

        let link = match self.lcbs.find_by_peer_address(&peer) {
            None => self.lcbs.allocate(peer).ok(),
            Some(link) => self.accept_conflicting(link).then_some(link),
        };
        let Some(link) = link else {
            debug!("[L2CAP] Rejecting cid {:#x} from {:?}", channel_id, peer);
            self.transport.connect_response(
                peer,
                identifier,
                channel_id,
                ConnectionResult::NoResources,
            );
            return;
        };

        self.transport
            .connect_response(peer, identifier, channel_id, ConnectionResult::Success);

        let local_mtu = self.local_mtu;
        if let Some(lcb) = self.lcbs.get_mut(link) {
            lcb.channel_id = channel_id;
            lcb.channel_state = ChannelState::Configuring;
            debug!("[L2CAP] Accepted cid {:#x} from {:?}", channel_id, peer);
        }
        self.transport
            .config_request(channel_id, &ConfigurationOptions::with_mtu(local_mtu));
    }

    /// Decide a connection race on an existing link, parking its channel if
    /// the peer's channel wins
    fn accept_conflicting(&mut self, link: LinkIndex) -> bool {
        let passive = self.ccbs.is_link_passive(link);
        let Some(lcb) = self.lcbs.get_mut(link) else {
            return false;
        };
        if !passive || lcb.channel_state == ChannelState::Open {
            return false;
        }

        if lcb.channel_id != cid::NULL {
            debug!("[L2CAP] Parking conflicting cid {:#x}", lcb.channel_id);
            lcb.conflict_channel_id = lcb.channel_id;
        }
        lcb.config_flags = ConfigFlags::empty();
        true
    }

    /// Outcome of our connect request
    pub fn connect_confirm(&mut self, channel_id: ChannelId, result: u16) {
        let Some(link) = self.lcbs.find_by_channel_id(channel_id) else {
            warn!("[L2CAP] Connect confirm for unknown cid {:#x}", channel_id);
            return;
        };
        let Some(lcb) = self.lcbs.get_mut(link) else {
            return;
        };
        let success = result == ConnectionResult::Success as u16;

        if lcb.channel_state == ChannelState::Connecting && lcb.channel_id == channel_id {
            if success {
                lcb.channel_state = ChannelState::Configuring;
                self.transport.config_request(
                    channel_id,
                    &ConfigurationOptions::with_mtu(self.local_mtu),
                );
            } else {
                debug!("[L2CAP] Connect on cid {:#x} failed: {}", channel_id, result);
                self.link_event(link, LinkEvent::ChannelClosed(result));
            }
        } else if lcb.conflict_channel_id == channel_id {
            lcb.conflict_channel_id = cid::NULL;
            if success {
                debug!("[L2CAP] Disconnecting redundant cid {:#x}", channel_id);
                self.transport.disconnect_request(channel_id);
            }
        } else {
            warn!(
                "[L2CAP] Connect confirm on cid {:#x} in state {:?}",
                channel_id, lcb.channel_state
            );
        }
    }

    /// Outcome of our configuration request
    pub fn config_confirm(&mut self, channel_id: ChannelId, options: &ConfigurationOptions) {
        let Some(link) = self.configuring_link(channel_id) else {
            return;
        };
        let Some(lcb) = self.lcbs.get_mut(link) else {
            return;
        };

        if !options.is_success() {
            warn!(
                "[L2CAP] Configuration of cid {:#x} failed: {:?}",
                channel_id, options.result
            );
            lcb.pending_disconnect_result = options.result as u16;
            self.transport.disconnect_request(channel_id);
            return;
        }

        lcb.config_flags.insert(ConfigFlags::LOCAL_DONE);
        if lcb.config_flags.contains(ConfigFlags::PEER_DONE) {
            self.channel_configured(link);
        }
    }

    /// The peer's configuration request
    pub fn config_indication(&mut self, channel_id: ChannelId, options: &ConfigurationOptions) {
        let Some(link) = self.lcbs.find_by_channel_id(channel_id) else {
            warn!("[L2CAP] Config indication for unknown cid {:#x}", channel_id);
            return;
        };
        let Some(lcb) = self.lcbs.get_mut(link) else {
            return;
        };

        lcb.peer_mtu = options.mtu.unwrap_or(L2CAP_DEFAULT_MTU);
        debug!("[L2CAP] cid {:#x} peer mtu {}", channel_id, lcb.peer_mtu);
        self.transport
            .config_response(channel_id, &ConfigurationOptions::accepted());

        if lcb.channel_state != ChannelState::Configuring
            || lcb.config_flags.contains(ConfigFlags::PEER_DONE)
        {
            return;
        }
        lcb.config_flags.insert(ConfigFlags::PEER_DONE);
        if lcb.config_flags.contains(ConfigFlags::LOCAL_DONE) {
            self.channel_configured(link);
        }
    }

    /// The peer or the link layer tore the channel down
    pub fn disconnect_indication(&mut self, channel_id: ChannelId, ack_needed: bool) {
        let Some(link) = self.lcbs.find_by_channel_id(channel_id) else {
            warn!("[L2CAP] Disconnect indication for unknown cid {:#x}", channel_id);
            return;
        };
        if ack_needed {
            self.transport.disconnect_response(channel_id);
        }

        if let Some(lcb) = self.lcbs.get_mut(link) {
            if lcb.conflict_channel_id == channel_id {
                debug!("[L2CAP] Parked cid {:#x} went away", channel_id);
                lcb.conflict_channel_id = cid::NULL;
                return;
            }
        }
        self.link_event(link, LinkEvent::ChannelClosed(RESULT_FAIL));
    }

    /// Our disconnect request completed
    pub fn disconnect_confirm(&mut self, channel_id: ChannelId, result: u16) {
        let Some(link) = self.lcbs.find_by_channel_id(channel_id) else {
            debug!("[L2CAP] Disconnect confirm for unknown cid {:#x}", channel_id);
            return;
        };
        let Some(lcb) = self.lcbs.get_mut(link) else {
            return;
        };

        let result = match core::mem::take(&mut lcb.pending_disconnect_result) {
            0 => result,
            pending => pending,
        };
        self.link_event(link, LinkEvent::ChannelClosed(result));
    }

    /// L2CAP congestion changed on a channel
    pub fn congestion_status(&mut self, channel_id: ChannelId, congested: bool) {
        let Some(link) = self.lcbs.find_by_channel_id(channel_id) else {
            warn!("[L2CAP] Congestion for unknown cid {:#x}", channel_id);
            return;
        };
        self.link_event(link, LinkEvent::CongestionChanged(congested));
    }

    /// One inbound AVCTP packet
    pub fn data_indication(&mut self, channel_id: ChannelId, packet: &[u8]) {
        let Some(link) = self.lcbs.find_by_channel_id(channel_id) else {
            warn!(
                "[L2CAP] Dropping {} bytes for unknown cid {:#x}",
                packet.len(),
                channel_id
            );
            return;
        };
        self.link_event(link, LinkEvent::InboundMessage(packet));
    }

    fn configuring_link(&self, channel_id: ChannelId) -> Option<LinkIndex> {
        let link = self.lcbs.find_by_channel_id(channel_id)?;
        let lcb = self.lcbs.get(link)?;
        if lcb.channel_state == ChannelState::Configuring && lcb.channel_id == channel_id {
            Some(link)
        } else {
            warn!(
                "[L2CAP] Config confirm on cid {:#x} in state {:?}",
                channel_id, lcb.channel_state
            );
            None
        }
    }

    fn channel_configured(&mut self, link: LinkIndex) {
        if let Some(lcb) = self.lcbs.get_mut(link) {
            lcb.channel_state = ChannelState::Open;
            info!(
                "[L2CAP] cid {:#x} open to {:?}, peer mtu {}",
                lcb.channel_id, lcb.peer_addr, lcb.peer_mtu
            );
        }
        self.link_event(link, LinkEvent::ChannelOpened);
    }
}
