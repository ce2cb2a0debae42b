//! Link state machine
//!
//! Every event addressed to an LCB is looked up in the transition table with
//! the link's current state. The next state is stored first, then the actions
//! of the cell run in order. Actions may feed further events to the same
//! link; those nested transitions take effect and are not overwritten when
//! control returns to the outer event.

use super::lcb::LinkState;
use super::{Avct, ConnectionHandle, LinkIndex, OutboundMessage};
use crate::l2cap::L2capTransport;

/// Input of the link state machine
#[derive(Debug)]
pub(crate) enum LinkEvent<'p> {
    /// Attach a connection to the link
    BindRequest(ConnectionHandle),
    /// Detach a connection from the link
    UnbindRequest(ConnectionHandle),
    /// Send a message on the link
    SendMessage(OutboundMessage),
    /// Close the channel once nothing is bound to the link anymore
    CloseIfLast,
    /// L2CAP channel is configured in both directions
    ChannelOpened,
    /// L2CAP channel went away with the given result
    ChannelClosed(u16),
    /// One inbound AVCTP packet
    InboundMessage(&'p [u8]),
    /// L2CAP congestion changed
    CongestionChanged(bool),
}

/// Payload-free discriminant of [`LinkEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum LinkEventKind {
    BindRequest,
    UnbindRequest,
    SendMessage,
    CloseIfLast,
    ChannelOpened,
    ChannelClosed,
    InboundMessage,
    CongestionChanged,
}

impl LinkEvent<'_> {
    pub fn kind(&self) -> LinkEventKind {
        match self {
            Self::BindRequest(_) => LinkEventKind::BindRequest,
            Self::UnbindRequest(_) => LinkEventKind::UnbindRequest,
            Self::SendMessage(_) => LinkEventKind::SendMessage,
            Self::CloseIfLast => LinkEventKind::CloseIfLast,
            Self::ChannelOpened => LinkEventKind::ChannelOpened,
            Self::ChannelClosed(_) => LinkEventKind::ChannelClosed,
            Self::InboundMessage(_) => LinkEventKind::InboundMessage,
            Self::CongestionChanged(_) => LinkEventKind::CongestionChanged,
        }
    }
}

/// Actions run by the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum Action {
    /// Request the L2CAP channel
    OpenChannel,
    /// Release the connection and confirm its disconnection
    UnbindDisconnect,
    /// Drop an outbound message
    Discard,
    /// Confirm bound connections and attach waiting acceptors
    OpenIndication,
    /// Report the closed channel to every bound connection
    CloseNotify,
    /// Release the LCB if nothing references it
    Deallocate,
    /// Request channel disconnection
    CloseChannel,
    /// Fail every bound connection
    OpenFailed,
    /// Record congestion and flush queued packets
    Congestion,
    /// Bind and confirm a connection on an open link
    BindConnection,
    /// Unbind a connection, closing the channel if it was the last one
    CheckDisconnect,
    /// Fragment and transmit a message
    Send,
    /// Reassemble and route an inbound packet
    Receive,
    /// Fail a bind attempt on a closing link
    BindFailed,
    /// Drop an inbound packet
    DropInbound,
}

/// Look up the next state and the actions for `event` in `state`
pub(crate) const fn transition(
    state: LinkState,
    event: LinkEventKind,
) -> (LinkState, &'static [Action]) {
    use Action::{
        BindConnection, BindFailed, CheckDisconnect, CloseChannel, CloseNotify, Congestion,
        Deallocate, Discard, DropInbound, OpenChannel, OpenFailed, OpenIndication, Receive, Send,
        UnbindDisconnect,
    };
    use LinkEventKind as E;
    use LinkState::{Closing, Idle, Open, Opening};

    match (state, event) {
        (Idle, E::BindRequest) => (Opening, &[OpenChannel]),
        (Idle, E::UnbindRequest) => (Idle, &[UnbindDisconnect]),
        (Idle, E::SendMessage) => (Idle, &[Discard]),
        (Idle, E::CloseIfLast) => (Idle, &[]),
        (Idle, E::ChannelOpened) => (Open, &[OpenIndication]),
        (Idle, E::ChannelClosed) => (Idle, &[CloseNotify, Deallocate]),
        (Idle, E::InboundMessage) => (Idle, &[DropInbound]),
        (Idle, E::CongestionChanged) => (Idle, &[]),

        (Opening, E::BindRequest) => (Opening, &[]),
        (Opening, E::UnbindRequest) => (Opening, &[UnbindDisconnect]),
        (Opening, E::SendMessage) => (Opening, &[Discard]),
        (Opening, E::CloseIfLast) => (Closing, &[CloseChannel]),
        (Opening, E::ChannelOpened) => (Open, &[OpenIndication]),
        (Opening, E::ChannelClosed) => (Idle, &[OpenFailed, Deallocate]),
        (Opening, E::InboundMessage) => (Opening, &[DropInbound]),
        (Opening, E::CongestionChanged) => (Opening, &[Congestion]),

        (Open, E::BindRequest) => (Open, &[BindConnection]),
        (Open, E::UnbindRequest) => (Open, &[CheckDisconnect]),
        (Open, E::SendMessage) => (Open, &[Send]),
        (Open, E::CloseIfLast) => (Closing, &[CloseChannel]),
        (Open, E::ChannelOpened) => (Open, &[]),
        (Open, E::ChannelClosed) => (Idle, &[CloseNotify, Deallocate]),
        (Open, E::InboundMessage) => (Open, &[Receive]),
        (Open, E::CongestionChanged) => (Open, &[Congestion]),

        (Closing, E::BindRequest) => (Closing, &[BindFailed]),
        (Closing, E::UnbindRequest) => (Closing, &[]),
        (Closing, E::SendMessage) => (Closing, &[Discard]),
        (Closing, E::CloseIfLast) => (Closing, &[]),
        (Closing, E::ChannelOpened) => (Closing, &[]),
        (Closing, E::ChannelClosed) => (Idle, &[CloseNotify, Deallocate]),
        (Closing, E::InboundMessage) => (Closing, &[DropInbound]),
        (Closing, E::CongestionChanged) => (Closing, &[]),
    }
}

impl<T: L2capTransport> Avct<'_, T> {
    /// Feed one event to the state machine of `link`
    pub(crate) fn link_event(&mut self, link: LinkIndex, event: LinkEvent<'_>) {
        let Some(lcb) = self.lcbs.get_mut(link) else {
            warn!("[AVCT] Event {:?} for released lcb {}", event.kind(), link);
            return;
        };

        let kind = event.kind();
        let (next, actions) = transition(lcb.state, kind);
        trace!(
            "[AVCT] lcb {} {:?}: {:?} -> {:?}",
            link, kind, lcb.state, next
        );
        lcb.state = next;

        for &action in actions {
            self.execute(link, action, &event);
        }
    }
}
