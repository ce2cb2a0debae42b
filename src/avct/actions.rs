//! Link state machine actions

use super::lcb::{ChannelState, ConfigFlags, PendingMessage};
use super::state_machine::{Action, LinkEvent};
use super::{Avct, CommandResponse, ConnectionHandle, ControlEvent, LinkIndex, Message, Role};
use crate::constants::{AVCT_PSM, RESULT_FAIL, RESULT_OK};
use crate::l2cap::{L2capTransport, TxPriority, cid};

impl<T: L2capTransport> Avct<'_, T> {
    pub(super) fn execute(&mut self, link: LinkIndex, action: Action, event: &LinkEvent<'_>) {
        match (action, event) {
            (Action::OpenChannel, _) => self.open_channel(link),
            (Action::UnbindDisconnect, LinkEvent::UnbindRequest(handle)) => {
                self.unbind_disconnect(link, *handle);
            }
            (Action::Discard, LinkEvent::SendMessage(msg)) => {
                warn!(
                    "[AVCT] Dropping {} byte message from {:?}, link not open",
                    msg.message.len(),
                    msg.handle
                );
            }
            (Action::OpenIndication, _) => self.open_indication(link),
            (Action::CloseNotify, LinkEvent::ChannelClosed(result)) => {
                self.close_notify(link, *result);
            }
            (Action::Deallocate, _) => self.deallocate_link(link),
            (Action::CloseChannel, _) => self.close_channel(link),
            (Action::OpenFailed, LinkEvent::ChannelClosed(result)) => {
                self.open_failed(link, *result);
            }
            (Action::Congestion, LinkEvent::CongestionChanged(congested)) => {
                self.congestion(link, *congested);
            }
            (Action::BindConnection, LinkEvent::BindRequest(handle)) => {
                self.bind_connection(link, *handle);
            }
            (Action::CheckDisconnect, LinkEvent::UnbindRequest(handle)) => {
                self.check_disconnect(link, *handle);
            }
            (Action::Send, LinkEvent::SendMessage(msg)) => {
                self.send(link, msg.label, msg.cr, msg.handle, &msg.message);
            }
            (Action::Receive, LinkEvent::InboundMessage(packet)) => self.receive(link, packet),
            (Action::BindFailed, LinkEvent::BindRequest(handle)) => self.bind_failed(link, *handle),
            (Action::DropInbound, LinkEvent::InboundMessage(packet)) => {
                warn!(
                    "[AVCT] Dropping {} byte packet, link {} not open",
                    packet.len(),
                    link
                );
            }
            (action, event) => {
                error!(
                    "[AVCT] Action {:?} does not apply to {:?}",
                    action,
                    event.kind()
                );
            }
        }
    }

    /// Notify the connection behind `handle`, if it is still allocated
    fn notify(&self, handle: ConnectionHandle, event: ControlEvent, result: u16, link: LinkIndex) {
        let Ok(ccb) = self.ccbs.get(handle) else {
            return;
        };
        let Some(lcb) = self.lcbs.get(link) else {
            return;
        };
        ccb.config
            .callbacks
            .on_control_event(handle, event, result, lcb.peer_addr);
    }

    /// Release a connection and then report `event` to it
    fn release_and_notify(
        &mut self,
        handle: ConnectionHandle,
        event: ControlEvent,
        result: u16,
        link: LinkIndex,
    ) {
        let Some(peer) = self.lcbs.get(link).map(|lcb| lcb.peer_addr) else {
            return;
        };
        if let Some(ccb) = self.ccbs.deallocate(handle) {
            ccb.config
                .callbacks
                .on_control_event(handle, event, result, peer);
        }
    }

    fn open_channel(&mut self, link: LinkIndex) {
        let Some(lcb) = self.lcbs.get_mut(link) else {
            return;
        };
        lcb.config_flags = ConfigFlags::empty();
        lcb.conflict_channel_id = cid::NULL;

        let channel_id = self.transport.connect_request(AVCT_PSM, lcb.peer_addr);
        if channel_id == cid::NULL {
            warn!("[AVCT] Connect request to {:?} failed", lcb.peer_addr);
            self.link_event(link, LinkEvent::ChannelClosed(RESULT_FAIL));
            return;
        }

        debug!("[AVCT] Connecting cid {:#x}", channel_id);
        lcb.channel_id = channel_id;
        lcb.channel_state = ChannelState::Connecting;
    }

    fn unbind_disconnect(&mut self, link: LinkIndex, handle: ConnectionHandle) {
        self.release_and_notify(handle, ControlEvent::DisconnectConfirm, RESULT_OK, link);
    }

    fn open_indication(&mut self, link: LinkIndex) {
        let Some(lcb) = self.lcbs.get(link) else {
            return;
        };
        let channel_id = lcb.channel_id;
        let mut bound_any = false;

        for handle in self.ccbs.handles() {
            let Ok(ccb) = self.ccbs.get(handle).copied() else {
                continue;
            };

            let event = if ccb.link == Some(link) {
                ControlEvent::ConnectConfirm
            } else if ccb.link.is_none()
                && ccb.config.role == Role::Acceptor
                && self.ccbs.find_by_pid_on_link(link, ccb.config.pid).is_none()
            {
                if let Ok(ccb) = self.ccbs.get_mut(handle) {
                    ccb.link = Some(link);
                }
                ControlEvent::ConnectIndication
            } else {
                continue;
            };

            bound_any = true;
            self.transport.set_tx_priority(channel_id, TxPriority::High);
            self.notify(handle, event, RESULT_OK, link);
        }

        if !bound_any {
            debug!("[AVCT] Nothing bound to lcb {}, closing", link);
            self.link_event(link, LinkEvent::CloseIfLast);
        }
    }

    fn open_failed(&mut self, link: LinkIndex, result: u16) {
        for handle in self.ccbs.bound_to(link) {
            self.release_and_notify(handle, ControlEvent::ConnectConfirm, result, link);
        }
    }

    fn close_notify(&mut self, link: LinkIndex, result: u16) {
        for handle in self.ccbs.bound_to(link) {
            let Ok(ccb) = self.ccbs.get_mut(handle) else {
                continue;
            };

            let initiated_locally = core::mem::take(&mut ccb.closing_initiated_locally);
            let event = if initiated_locally {
                ControlEvent::DisconnectConfirm
            } else {
                ControlEvent::DisconnectIndication
            };

            // Acceptors keep listening unless their own removal closed the link
            if ccb.config.role == Role::Initiator || initiated_locally {
                self.release_and_notify(handle, event, result, link);
            } else {
                ccb.link = None;
                self.notify(handle, event, result, link);
            }
        }
    }

    fn deallocate_link(&mut self, link: LinkIndex) {
        if self.ccbs.is_link_referenced(link) {
            if let Some(lcb) = self.lcbs.get_mut(link) {
                lcb.reset_channel();
            }
        } else {
            self.lcbs.deallocate(link);
        }
    }

    fn close_channel(&mut self, link: LinkIndex) {
        let Some(lcb) = self.lcbs.get(link) else {
            return;
        };
        debug!("[AVCT] Disconnecting cid {:#x}", lcb.channel_id);
        self.transport.disconnect_request(lcb.channel_id);
    }

    fn congestion(&mut self, link: LinkIndex, congested: bool) {
        let Some(lcb) = self.lcbs.get_mut(link) else {
            return;
        };
        lcb.congested = congested;
        if !congested {
            lcb.flush(&mut self.transport);
        }

        let event = if congested {
            ControlEvent::CongestionIndication
        } else {
            ControlEvent::UncongestionIndication
        };
        for handle in self.ccbs.bound_to(link) {
            self.notify(handle, event, RESULT_OK, link);
        }
    }

    fn bind_connection(&mut self, link: LinkIndex, handle: ConnectionHandle) {
        if let Ok(ccb) = self.ccbs.get_mut(handle) {
            ccb.link = Some(link);
            self.notify(handle, ControlEvent::ConnectConfirm, RESULT_OK, link);
        }
    }

    fn bind_failed(&mut self, link: LinkIndex, handle: ConnectionHandle) {
        self.release_and_notify(handle, ControlEvent::ConnectConfirm, RESULT_FAIL, link);
    }

    fn check_disconnect(&mut self, link: LinkIndex, handle: ConnectionHandle) {
        if !self.ccbs.is_last_on_link(link, handle) {
            self.unbind_disconnect(link, handle);
            return;
        }

        if let Ok(ccb) = self.ccbs.get_mut(handle) {
            ccb.closing_initiated_locally = true;
        }
        self.link_event(link, LinkEvent::CloseIfLast);
    }

    fn send(
        &mut self,
        link: LinkIndex,
        label: u8,
        cr: CommandResponse,
        handle: ConnectionHandle,
        message: &Message,
    ) {
        let Ok(pid) = self.ccbs.get(handle).map(|ccb| ccb.config.pid) else {
            warn!("[AVCT] Send on released connection {:?}", handle);
            return;
        };
        let Some(lcb) = self.lcbs.get_mut(link) else {
            return;
        };

        let pending = PendingMessage::new(message.clone(), label, cr, pid, lcb.peer_mtu);
        trace!(
            "[AVCT] Sending {} bytes as {} packets on cid {:#x}",
            message.len(),
            pending.segments(),
            lcb.channel_id
        );
        lcb.transmit(&mut self.transport, pending);
    }

    fn receive(&mut self, link: LinkIndex, packet: &[u8]) {
        let Some(lcb) = self.lcbs.get_mut(link) else {
            return;
        };
        let Some(message) = lcb.reassembler.assemble(packet) else {
            return;
        };

        let Ok(cr) = CommandResponse::try_from(message.cr_ipid) else {
            warn!(
                "[AVCT] Bad cr/ipid {} in message for pid {:#x}",
                message.cr_ipid, message.pid
            );
            return;
        };

        if let Some(handle) = self.ccbs.find_by_pid_on_link(link, message.pid) {
            if let Ok(ccb) = self.ccbs.get(handle) {
                ccb.config
                    .callbacks
                    .on_message(handle, message.label, cr, &message.payload);
            }
            return;
        }

        warn!("[AVCT] No connection for pid {:#x}", message.pid);
        if cr == CommandResponse::Command {
            let reject = PendingMessage::new(
                Message::new(),
                message.label,
                CommandResponse::Reject,
                message.pid,
                lcb.peer_mtu,
            );
            lcb.transmit(&mut self.transport, reject);
        }
    }
}
