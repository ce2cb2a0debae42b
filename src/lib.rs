#![no_std]
#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

mod fmt;

mod address;
pub mod api;
pub mod avct;
pub mod constants;
pub mod l2cap;
pub mod processor;

use crate::avct::{AvctError, CommandResponse, ConnectionConfig, ConnectionHandle, Message};
use crate::constants::PROCESSOR_CHANNEL_DEPTH;
use crate::l2cap::{L2capEvent, SecurityRequirements};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;

pub use address::BluetoothAddress;

pub(crate) static REQUEST_CHANNEL: Channel<
    CriticalSectionRawMutex,
    Request,
    PROCESSOR_CHANNEL_DEPTH,
> = Channel::new();

pub(crate) static RESPONSE_CHANNEL: Channel<
    CriticalSectionRawMutex,
    Response,
    PROCESSOR_CHANNEL_DEPTH,
> = Channel::new();

pub(crate) static L2CAP_EVENT_CHANNEL: Channel<
    CriticalSectionRawMutex,
    L2capEvent,
    PROCESSOR_CHANNEL_DEPTH,
> = Channel::new();

/// API requests sent to the processor task
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum Request {
    /// Register the AVCTP PSM
    Register {
        local_mtu: u16,
        security: SecurityRequirements,
    },
    /// Remove the PSM registration
    Deregister,
    /// Create a profile connection
    CreateConnection {
        config: ConnectionConfig<'static>,
        peer: BluetoothAddress,
    },
    /// Remove a profile connection
    RemoveConnection(ConnectionHandle),
    /// Send a message on a connection
    SendMessage {
        handle: ConnectionHandle,
        label: u8,
        cr: CommandResponse,
        message: Message,
    },
    /// Query the peer MTU of a connection
    GetPeerMtu(ConnectionHandle),
}

/// API responses sent back by the processor task
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum Response {
    /// PSM registered
    Registered,
    /// PSM deregistered
    Deregistered,
    /// Connection created; the outcome follows through its callbacks
    ConnectionCreated(ConnectionHandle),
    /// Removal started or completed
    ConnectionRemoved,
    /// Message handed to the link
    MessageSent,
    /// Peer MTU of the queried connection
    PeerMtu(u16),
    /// The request failed
    Error(AvctError),
}
