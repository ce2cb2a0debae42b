//! Mock transport and recording callbacks shared by the unit tests

extern crate std;

use super::{
    Avct, CommandResponse, ConnectionCallbacks, ConnectionConfig, ConnectionHandle, ControlEvent,
    ControlFlags, Role,
};
use crate::BluetoothAddress;
use crate::l2cap::{
    ChannelId, ConfigurationOptions, ConnectionResult, DataWriteStatus, L2capTransport,
    ProtocolServiceMultiplexer, SecurityRequirements, TxPriority, cid,
};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::vec::Vec;

pub const PEER: BluetoothAddress = BluetoothAddress::new([0x00, 0x1A, 0x7D, 0xDA, 0x71, 0x13]);
pub const PEER_B: BluetoothAddress = BluetoothAddress::new([0x48, 0x74, 0x12, 0x9C, 0x05, 0xE1]);

/// L2CAP transport that records every request
#[derive(Debug, Default)]
pub struct MockTransport {
    pub refuse_psm: bool,
    pub fail_connect: bool,
    pub registered_psm: Option<(ProtocolServiceMultiplexer, SecurityRequirements)>,
    pub next_cid: ChannelId,
    pub connect_requests: Vec<(ProtocolServiceMultiplexer, BluetoothAddress)>,
    pub connect_responses: Vec<(BluetoothAddress, u8, ChannelId, ConnectionResult)>,
    pub config_requests: Vec<(ChannelId, ConfigurationOptions)>,
    pub config_responses: Vec<(ChannelId, ConfigurationOptions)>,
    pub disconnect_requests: Vec<ChannelId>,
    pub disconnect_responses: Vec<ChannelId>,
    pub priorities: Vec<(ChannelId, TxPriority)>,
    pub written: Vec<(ChannelId, Vec<u8>)>,
    /// Results returned by successive writes; `Success` once exhausted
    pub write_results: VecDeque<DataWriteStatus>,
}

impl MockTransport {
    /// Payloads of all written packets, in order
    pub fn written_bytes(&self) -> Vec<Vec<u8>> {
        self.written.iter().map(|(_, bytes)| bytes.clone()).collect()
    }
}

impl L2capTransport for MockTransport {
    fn register_psm(
        &mut self,
        psm: ProtocolServiceMultiplexer,
        security: SecurityRequirements,
    ) -> bool {
        if self.refuse_psm {
            return false;
        }
        self.registered_psm = Some((psm, security));
        true
    }

    fn deregister_psm(&mut self, _psm: ProtocolServiceMultiplexer) {
        self.registered_psm = None;
    }

    fn connect_request(
        &mut self,
        psm: ProtocolServiceMultiplexer,
        peer: BluetoothAddress,
    ) -> ChannelId {
        self.connect_requests.push((psm, peer));
        if self.fail_connect {
            return cid::NULL;
        }
        if self.next_cid == cid::NULL {
            self.next_cid = cid::DYNAMIC_START;
        }
        let channel_id = self.next_cid;
        self.next_cid += 1;
        channel_id
    }

    fn connect_response(
        &mut self,
        peer: BluetoothAddress,
        identifier: u8,
        channel_id: ChannelId,
        result: ConnectionResult,
    ) {
        self.connect_responses
            .push((peer, identifier, channel_id, result));
    }

    fn config_request(&mut self, channel_id: ChannelId, options: &ConfigurationOptions) {
        self.config_requests.push((channel_id, *options));
    }

    fn config_response(&mut self, channel_id: ChannelId, options: &ConfigurationOptions) {
        self.config_responses.push((channel_id, *options));
    }

    fn disconnect_request(&mut self, channel_id: ChannelId) {
        self.disconnect_requests.push(channel_id);
    }

    fn disconnect_response(&mut self, channel_id: ChannelId) {
        self.disconnect_responses.push(channel_id);
    }

    fn data_write(&mut self, channel_id: ChannelId, packet: &[u8]) -> DataWriteStatus {
        let status = self
            .write_results
            .pop_front()
            .unwrap_or(DataWriteStatus::Success);
        if status != DataWriteStatus::Failed {
            self.written.push((channel_id, packet.to_vec()));
        }
        status
    }

    fn set_tx_priority(&mut self, channel_id: ChannelId, priority: TxPriority) {
        self.priorities.push((channel_id, priority));
    }
}

/// One callback invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    Control(ConnectionHandle, ControlEvent, u16, BluetoothAddress),
    Message(ConnectionHandle, u8, CommandResponse, Vec<u8>),
}

/// Connection callbacks that record every invocation
#[derive(Debug, Default)]
pub struct Recorder {
    events: Mutex<Vec<Recorded>>,
}

impl Recorder {
    /// Drain the recorded invocations
    pub fn take(&self) -> Vec<Recorded> {
        core::mem::take(&mut *self.events.lock().unwrap())
    }
}

impl ConnectionCallbacks for Recorder {
    fn on_control_event(
        &self,
        handle: ConnectionHandle,
        event: ControlEvent,
        result: u16,
        peer: BluetoothAddress,
    ) {
        self.events
            .lock()
            .unwrap()
            .push(Recorded::Control(handle, event, result, peer));
    }

    fn on_message(&self, handle: ConnectionHandle, label: u8, cr: CommandResponse, payload: &[u8]) {
        self.events
            .lock()
            .unwrap()
            .push(Recorded::Message(handle, label, cr, payload.to_vec()));
    }
}

pub fn initiator(recorder: &Recorder, pid: u16) -> ConnectionConfig<'_> {
    ConnectionConfig {
        pid,
        role: Role::Initiator,
        control: ControlFlags::CONTROLLER,
        callbacks: recorder,
    }
}

pub fn acceptor(recorder: &Recorder, pid: u16) -> ConnectionConfig<'_> {
    ConnectionConfig {
        pid,
        role: Role::Acceptor,
        control: ControlFlags::TARGET,
        callbacks: recorder,
    }
}

/// A registered instance on a fresh mock transport
pub fn registered<'a>(local_mtu: u16) -> Avct<'a, MockTransport> {
    let mut avct = Avct::new(MockTransport::default());
    avct.register(local_mtu, SecurityRequirements::NONE)
        .unwrap();
    avct
}

/// Complete both configuration directions of `channel_id`
pub fn configure(avct: &mut Avct<'_, MockTransport>, channel_id: ChannelId, peer_mtu: u16) {
    avct.config_confirm(channel_id, &ConfigurationOptions::accepted());
    avct.config_indication(channel_id, &ConfigurationOptions::with_mtu(peer_mtu));
}

/// Open a link to [`PEER`] through an initiator connection for `pid`
///
/// The peer signals an MTU of 48. The connect confirm is consumed from the
/// recorder.
pub fn open_link<'a>(
    avct: &mut Avct<'a, MockTransport>,
    recorder: &'a Recorder,
    pid: u16,
) -> (ConnectionHandle, ChannelId) {
    let handle = avct.create_connection(initiator(recorder, pid), PEER).unwrap();
    let channel_id = avct.link_info(&PEER).unwrap().channel_id;
    avct.connect_confirm(channel_id, ConnectionResult::Success as u16);
    configure(avct, channel_id, 48);

    assert_eq!(
        recorder.take(),
        std::vec![Recorded::Control(handle, ControlEvent::ConnectConfirm, 0, PEER)]
    );
    (handle, channel_id)
}
