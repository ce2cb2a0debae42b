//! Link Control Blocks
//!
//! One LCB exists per peer device. It owns the L2CAP channel to that peer,
//! the partial inbound message and the messages held back while L2CAP is
//! congested.

use super::packet::FragmentCursor;
use super::reassembly::Reassembler;
use super::{AvctError, CommandResponse, LinkIndex, Message};
use crate::BluetoothAddress;
use crate::constants::{L2CAP_DEFAULT_MTU, MAX_LINKS, TX_QUEUE_DEPTH};
use crate::l2cap::{ChannelId, DataWriteStatus, L2capTransport, cid};
use bitflags::bitflags;
use heapless::Deque;

/// State of the link state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkState {
    /// No channel
    #[default]
    Idle,
    /// Channel being connected and configured
    Opening,
    /// Channel open
    Open,
    /// Channel being disconnected
    Closing,
}

/// State of the underlying L2CAP channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChannelState {
    /// No channel
    #[default]
    Idle,
    /// Connect request sent, waiting for the confirm
    Connecting,
    /// Connected, configuration in progress
    Configuring,
    /// Configuration done in both directions
    Open,
}

bitflags! {
    /// Progress of the L2CAP configuration exchange
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct ConfigFlags: u8 {
        /// Our configuration request was confirmed
        const LOCAL_DONE = 0x01;
        /// The peer's configuration request was answered
        const PEER_DONE = 0x02;
    }
}

/// Read-only snapshot of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LinkInfo {
    /// Peer device
    pub peer: BluetoothAddress,
    /// Link state machine state
    pub state: LinkState,
    /// L2CAP channel state
    pub channel_state: ChannelState,
    /// Current channel, 0 if none
    pub channel_id: ChannelId,
    /// Channel parked during a connection race, 0 if none
    pub conflict_channel_id: ChannelId,
    /// MTU signalled by the peer
    pub peer_mtu: u16,
    /// Whether L2CAP reported congestion
    pub congested: bool,
    /// Messages waiting for congestion to clear, including a partly written one
    pub queued_messages: usize,
}

/// An outbound message and how much of it L2CAP has taken
#[derive(Debug)]
pub(crate) struct PendingMessage {
    message: Message,
    cursor: FragmentCursor,
}

impl PendingMessage {
    pub fn new(message: Message, label: u8, cr: CommandResponse, pid: u16, mtu: u16) -> Self {
        let cursor = FragmentCursor::new(message.len(), label, cr, pid, mtu);
        Self { message, cursor }
    }

    pub fn segments(&self) -> u8 {
        self.cursor.segments()
    }

    fn is_sent(&self) -> bool {
        self.cursor.is_done()
    }

    /// Write packets until the message is done or L2CAP congests
    ///
    /// Returns whether L2CAP reported congestion.
    fn write<T: L2capTransport>(&mut self, transport: &mut T, channel_id: ChannelId) -> bool {
        while let Some(packet) = self.cursor.next_packet(&self.message) {
            match transport.data_write(channel_id, &packet) {
                DataWriteStatus::Success => {}
                DataWriteStatus::Congested => {
                    debug!("[AVCT] cid {:#x} congested", channel_id);
                    return true;
                }
                DataWriteStatus::Failed => {
                    warn!(
                        "[AVCT] Write of {} bytes on cid {:#x} failed",
                        packet.len(),
                        channel_id
                    );
                }
            }
        }
        false
    }
}

/// Link Control Block
#[derive(Debug)]
pub(crate) struct Lcb {
    pub peer_addr: BluetoothAddress,
    pub state: LinkState,
    pub channel_state: ChannelState,
    pub channel_id: ChannelId,
    pub conflict_channel_id: ChannelId,
    pub config_flags: ConfigFlags,
    pub peer_mtu: u16,
    /// Result of a failed configuration, reported instead of the disconnect
    /// confirm's own result
    pub pending_disconnect_result: u16,
    pub reassembler: Reassembler,
    pub congested: bool,
    pub tx_queue: Deque<PendingMessage, TX_QUEUE_DEPTH>,
}

impl Lcb {
    fn new(peer_addr: BluetoothAddress) -> Self {
        Self {
            peer_addr,
            state: LinkState::Idle,
            channel_state: ChannelState::Idle,
            channel_id: cid::NULL,
            conflict_channel_id: cid::NULL,
            config_flags: ConfigFlags::empty(),
            peer_mtu: L2CAP_DEFAULT_MTU,
            pending_disconnect_result: 0,
            reassembler: Reassembler::new(),
            congested: false,
            tx_queue: Deque::new(),
        }
    }

    /// Forget the channel while connections still reference the link
    pub fn reset_channel(&mut self) {
        *self = Self::new(self.peer_addr);
    }

    /// Write a message, or queue what is left of it while L2CAP is congested
    ///
    /// Messages are queued whole. When the queue is full a message is dropped
    /// before any of its packets reach L2CAP, so the peer never sees a Start
    /// packet without its End.
    pub fn transmit<T: L2capTransport>(&mut self, transport: &mut T, mut pending: PendingMessage) {
        self.flush(transport);
        if !self.congested {
            self.congested = pending.write(transport, self.channel_id);
            if pending.is_sent() {
                return;
            }
        }
        if let Err(dropped) = self.tx_queue.push_back(pending) {
            warn!(
                "[AVCT] TX queue full on cid {:#x}, {} byte message dropped",
                self.channel_id,
                dropped.message.len()
            );
        }
    }

    /// Write queued messages in order until the queue drains or L2CAP congests
    pub fn flush<T: L2capTransport>(&mut self, transport: &mut T) {
        while !self.congested {
            let Some(pending) = self.tx_queue.front_mut() else {
                break;
            };
            self.congested = pending.write(transport, self.channel_id);
            if pending.is_sent() {
                self.tx_queue.pop_front();
            }
        }
    }

    pub fn info(&self) -> LinkInfo {
        LinkInfo {
            peer: self.peer_addr,
            state: self.state,
            channel_state: self.channel_state,
            channel_id: self.channel_id,
            conflict_channel_id: self.conflict_channel_id,
            peer_mtu: self.peer_mtu,
            congested: self.congested,
            queued_messages: self.tx_queue.len(),
        }
    }
}

/// Fixed-capacity LCB pool
#[derive(Debug)]
pub(crate) struct LcbStore {
    links: [Option<Lcb>; MAX_LINKS],
}

impl LcbStore {
    pub fn new() -> Self {
        Self {
            links: core::array::from_fn(|_| None),
        }
    }

    pub fn allocate(&mut self, peer: BluetoothAddress) -> Result<LinkIndex, AvctError> {
        let Some((index, slot)) = self
            .links
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| slot.is_none())
        else {
            warn!("[AVCT] Out of lcbs");
            return Err(AvctError::NoResources);
        };

        *slot = Some(Lcb::new(peer));
        debug!("[AVCT] lcb {} allocated for {:?}", index, peer);
        Ok(index)
    }

    /// Release a link; releasing a free slot is a no-op
    pub fn deallocate(&mut self, link: LinkIndex) {
        if let Some(slot) = self.links.get_mut(link) {
            if slot.take().is_some() {
                debug!("[AVCT] lcb {} released", link);
            }
        }
    }

    pub fn get(&self, link: LinkIndex) -> Option<&Lcb> {
        self.links.get(link)?.as_ref()
    }

    pub fn get_mut(&mut self, link: LinkIndex) -> Option<&mut Lcb> {
        self.links.get_mut(link)?.as_mut()
    }

    pub fn find_by_peer_address(&self, peer: &BluetoothAddress) -> Option<LinkIndex> {
        self.links
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|lcb| lcb.peer_addr == *peer))
    }

    /// The link owning `channel_id`, either as its channel or as the channel
    /// parked during a connection race
    pub fn find_by_channel_id(&self, channel_id: ChannelId) -> Option<LinkIndex> {
        if channel_id == cid::NULL {
            return None;
        }
        self.links.iter().position(|slot| {
            slot.as_ref().is_some_and(|lcb| {
                lcb.channel_id == channel_id || lcb.conflict_channel_id == channel_id
            })
        })
    }

    /// Every live channel of every link, parked conflict channels included
    pub fn channel_ids(&self) -> impl Iterator<Item = ChannelId> + '_ {
        self.links
            .iter()
            .flatten()
            .flat_map(|lcb| [lcb.channel_id, lcb.conflict_channel_id])
            .filter(|&channel_id| channel_id != cid::NULL)
    }

    pub fn clear(&mut self) {
        self.links = core::array::from_fn(|_| None);
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use crate::avct::packet::{PacketHeader, PacketType};
    use crate::avct::test_support::{MockTransport, PEER, PEER_B};
    use std::vec;
    use std::vec::Vec;

    fn pending(payload: &[u8]) -> PendingMessage {
        PendingMessage::new(
            Message::from_slice(payload).unwrap(),
            0,
            CommandResponse::Command,
            0x110E,
            48,
        )
    }

    fn open_lcb(store: &mut LcbStore) -> &mut Lcb {
        let link = store.allocate(PEER).unwrap();
        let lcb = store.get_mut(link).unwrap();
        lcb.channel_id = 0x40;
        lcb
    }

    #[test]
    fn test_allocate_and_lookup() {
        let mut store = LcbStore::new();
        let a = store.allocate(PEER).unwrap();
        let b = store.allocate(PEER_B).unwrap();
        assert_eq!(store.allocate(PEER).unwrap_err(), AvctError::NoResources);

        assert_eq!(store.find_by_peer_address(&PEER), Some(a));
        assert_eq!(store.find_by_peer_address(&PEER_B), Some(b));

        let lcb = store.get(a).unwrap();
        assert_eq!(lcb.state, LinkState::Idle);
        assert_eq!(lcb.peer_mtu, L2CAP_DEFAULT_MTU);

        store.deallocate(a);
        store.deallocate(a);
        assert!(store.get(a).is_none());
        assert_eq!(store.find_by_peer_address(&PEER), None);
        assert_eq!(store.allocate(PEER).unwrap(), a);
    }

    #[test]
    fn test_find_by_channel_id_matches_conflict_channel() {
        let mut store = LcbStore::new();
        let link = store.allocate(PEER).unwrap();
        {
            let lcb = store.get_mut(link).unwrap();
            lcb.channel_id = 0x41;
            lcb.conflict_channel_id = 0x40;
        }

        assert_eq!(store.find_by_channel_id(0x41), Some(link));
        assert_eq!(store.find_by_channel_id(0x40), Some(link));
        assert_eq!(store.find_by_channel_id(0x42), None);
        // An unused conflict slot never matches the null channel
        store.get_mut(link).unwrap().conflict_channel_id = cid::NULL;
        assert_eq!(store.find_by_channel_id(cid::NULL), None);
    }

    #[test]
    fn test_channel_ids_skip_unused_slots() {
        let mut store = LcbStore::new();
        assert_eq!(store.channel_ids().count(), 0);

        let a = store.allocate(PEER).unwrap();
        store.allocate(PEER_B).unwrap();
        let lcb = store.get_mut(a).unwrap();
        lcb.channel_id = 0x41;
        lcb.conflict_channel_id = 0x40;

        let ids: Vec<ChannelId> = store.channel_ids().collect();
        assert_eq!(ids, vec![0x41, 0x40]);
    }

    #[test]
    fn test_transmit_queues_while_congested() {
        let mut transport = MockTransport::default();
        let mut store = LcbStore::new();
        let lcb = open_lcb(&mut store);

        transport.write_results.push_back(DataWriteStatus::Congested);
        lcb.transmit(&mut transport, pending(&[1]));
        assert!(lcb.congested);

        lcb.transmit(&mut transport, pending(&[2]));
        lcb.transmit(&mut transport, pending(&[3]));
        assert_eq!(transport.written_bytes(), vec![vec![0x00, 0x11, 0x0E, 1]]);
        assert_eq!(lcb.info().queued_messages, 2);

        lcb.congested = false;
        lcb.flush(&mut transport);
        let last_bytes: Vec<u8> = transport.written_bytes().iter().map(|p| p[3]).collect();
        assert_eq!(last_bytes, vec![1, 2, 3]);
        assert!(lcb.tx_queue.is_empty());
    }

    #[test]
    fn test_congestion_mid_message_keeps_the_rest() {
        let mut transport = MockTransport::default();
        let mut store = LcbStore::new();
        let lcb = open_lcb(&mut store);
        let payload: Vec<u8> = (0..200u8).collect();

        transport.write_results.push_back(DataWriteStatus::Success);
        transport.write_results.push_back(DataWriteStatus::Congested);
        lcb.transmit(&mut transport, pending(&payload));
        assert_eq!(transport.written.len(), 2);
        assert_eq!(lcb.info().queued_messages, 1);

        // A later message waits behind the unfinished one
        lcb.transmit(&mut transport, pending(&[7]));
        assert_eq!(transport.written.len(), 2);

        lcb.congested = false;
        lcb.flush(&mut transport);
        let packets = transport.written_bytes();
        assert_eq!(packets.len(), 6);
        assert_eq!(packets[4][0], 0x0C);
        assert_eq!(packets[5], vec![0x00, 0x11, 0x0E, 7]);

        let mut reassembled = packets[0][4..].to_vec();
        for packet in &packets[1..5] {
            reassembled.extend_from_slice(&packet[1..]);
        }
        assert_eq!(reassembled, payload);
    }

    #[test]
    fn test_full_queue_drops_whole_messages() {
        let mut transport = MockTransport::default();
        let mut store = LcbStore::new();
        let lcb = open_lcb(&mut store);
        lcb.congested = true;
        let payload: Vec<u8> = (0..200u8).collect();

        for _ in 0..TX_QUEUE_DEPTH + 2 {
            lcb.transmit(&mut transport, pending(&payload));
        }
        assert_eq!(lcb.tx_queue.len(), TX_QUEUE_DEPTH);
        assert!(transport.written.is_empty());

        lcb.congested = false;
        lcb.flush(&mut transport);
        let types: Vec<PacketType> = transport
            .written_bytes()
            .iter()
            .map(|p| PacketHeader::from_byte(p[0]).packet_type)
            .collect();
        assert_eq!(types.len(), TX_QUEUE_DEPTH * 5);
        for message in types.chunks(5) {
            assert_eq!(
                message,
                [
                    PacketType::Start,
                    PacketType::Continue,
                    PacketType::Continue,
                    PacketType::Continue,
                    PacketType::End
                ]
            );
        }
    }

    #[test]
    fn test_reset_channel_keeps_peer() {
        let mut store = LcbStore::new();
        let link = store.allocate(PEER).unwrap();
        let lcb = store.get_mut(link).unwrap();
        lcb.channel_id = 0x44;
        lcb.channel_state = ChannelState::Open;
        lcb.config_flags = ConfigFlags::LOCAL_DONE | ConfigFlags::PEER_DONE;
        lcb.peer_mtu = 48;
        lcb.congested = true;
        lcb.tx_queue.push_back(pending(&[9])).unwrap();

        lcb.reset_channel();
        let info = lcb.info();
        assert_eq!(info.peer, PEER);
        assert_eq!(info.channel_id, cid::NULL);
        assert_eq!(info.channel_state, ChannelState::Idle);
        assert_eq!(info.peer_mtu, L2CAP_DEFAULT_MTU);
        assert!(!info.congested);
        assert_eq!(info.queued_messages, 0);
        assert!(lcb.config_flags.is_empty());
    }
}
