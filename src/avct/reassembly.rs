//! Inbound message reassembly
//!
//! A link keeps at most one message under reassembly. Malformed or out of
//! order packets are dropped with a warning; nothing here is fatal.

use super::Message;
use super::packet::{HDR_LEN_CONTINUE, HDR_LEN_SINGLE, HDR_LEN_START, PacketHeader, PacketType};
use crate::constants::REASSEMBLY_BUFFER_SIZE;

/// A complete inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledMessage {
    /// Transaction label
    pub label: u8,
    /// Raw command/response/invalid-PID bits of the first packet
    pub cr_ipid: u8,
    /// Profile identifier
    pub pid: u16,
    /// Message payload without any AVCTP header
    pub payload: Message,
}

/// Reassembly state of one link
#[derive(Debug, Default)]
pub struct Reassembler {
    partial: Option<AssembledMessage>,
}

impl Reassembler {
    /// Create an idle reassembler
    #[must_use]
    pub const fn new() -> Self {
        Self { partial: None }
    }

    /// Whether a fragmented message is currently being collected
    #[must_use]
    pub fn is_in_progress(&self) -> bool {
        self.partial.is_some()
    }

    /// Number of payload bytes collected so far
    #[must_use]
    pub fn partial_len(&self) -> usize {
        self.partial.as_ref().map_or(0, |p| p.payload.len())
    }

    /// Drop any partial message
    pub fn reset(&mut self) {
        self.partial = None;
    }

    /// Feed one packet; returns the message once it is complete
    pub fn assemble(&mut self, packet: &[u8]) -> Option<AssembledMessage> {
        let first = *packet.first()?;
        let header = PacketHeader::from_byte(first);

        if packet.len() < header.packet_type.header_len() {
            warn!(
                "[AVCT] Bad length during reassembly: {:?} packet of {} bytes",
                header.packet_type,
                packet.len()
            );
            return None;
        }

        match header.packet_type {
            PacketType::Single => {
                if self.partial.take().is_some() {
                    warn!("[AVCT] Got single during reassembly");
                }
                let payload = Self::payload_from(&packet[HDR_LEN_SINGLE..])?;
                Some(AssembledMessage {
                    label: header.label,
                    cr_ipid: header.cr_ipid,
                    pid: u16::from_be_bytes([packet[1], packet[2]]),
                    payload,
                })
            }
            PacketType::Start => {
                if self.partial.take().is_some() {
                    warn!("[AVCT] Got start during reassembly");
                }
                let payload = Self::payload_from(&packet[HDR_LEN_START..])?;
                self.partial = Some(AssembledMessage {
                    label: header.label,
                    cr_ipid: header.cr_ipid,
                    pid: u16::from_be_bytes([packet[2], packet[3]]),
                    payload,
                });
                None
            }
            PacketType::Continue | PacketType::End => {
                let Some(partial) = self.partial.as_mut() else {
                    warn!(
                        "[AVCT] Packet type {:?} out of order",
                        header.packet_type
                    );
                    return None;
                };

                let fragment = &packet[HDR_LEN_CONTINUE..];
                if partial.payload.extend_from_slice(fragment).is_err() {
                    warn!(
                        "[AVCT] Fragmented message too big: {} + {} bytes",
                        partial.payload.len(),
                        fragment.len()
                    );
                    self.partial = None;
                    return None;
                }

                if header.packet_type == PacketType::End {
                    self.partial.take()
                } else {
                    None
                }
            }
        }
    }

    fn payload_from(bytes: &[u8]) -> Option<Message> {
        let mut payload = Message::new();
        if payload.extend_from_slice(bytes).is_err() {
            warn!(
                "[AVCT] Message of {} bytes exceeds {} byte buffer",
                bytes.len(),
                REASSEMBLY_BUFFER_SIZE
            );
            return None;
        }
        Some(payload)
    }
}
