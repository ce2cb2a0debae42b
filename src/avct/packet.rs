//! AVCTP Packet Format
//!
//! Every AVCTP packet starts with a one-byte header:
//!
//! ```text
//!  7   6   5   4   3   2   1   0
//! +---------------+-------+-------+
//! |     label     | type  |cr/ipid|
//! +---------------+-------+-------+
//! ```
//!
//! Start packets carry the total number of packets in byte 1. Single and Start
//! packets then carry the big-endian profile identifier; Continue and End
//! packets carry payload directly after the header byte.

use super::{CommandResponse, MAX_LABEL, Packet};
use crate::constants::MAX_PACKET_SIZE;

/// Header length of a Single packet (header byte + PID)
pub const HDR_LEN_SINGLE: usize = 3;
/// Header length of a Start packet (header byte + segment count + PID)
pub const HDR_LEN_START: usize = 4;
/// Header length of a Continue packet
pub const HDR_LEN_CONTINUE: usize = 1;
/// Header length of an End packet
pub const HDR_LEN_END: usize = 1;

/// AVCTP packet types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum PacketType {
    /// Complete message in one packet
    Single = 0x00,
    /// First packet of a fragmented message
    Start = 0x01,
    /// Middle packet of a fragmented message
    Continue = 0x02,
    /// Last packet of a fragmented message
    End = 0x03,
}

impl PacketType {
    /// Decode the two type bits
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0x00 => Self::Single,
            0x01 => Self::Start,
            0x02 => Self::Continue,
            _ => Self::End,
        }
    }

    /// Minimum packet length, which is also the header length, for this type
    #[must_use]
    pub const fn header_len(self) -> usize {
        match self {
            Self::Single => HDR_LEN_SINGLE,
            Self::Start => HDR_LEN_START,
            Self::Continue => HDR_LEN_CONTINUE,
            Self::End => HDR_LEN_END,
        }
    }

    /// Whether packets of this type carry the profile identifier
    #[must_use]
    pub const fn carries_pid(self) -> bool {
        matches!(self, Self::Single | Self::Start)
    }
}

/// Decoded first byte of an AVCTP packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PacketHeader {
    /// Transaction label (4 bits)
    pub label: u8,
    /// Packet type
    pub packet_type: PacketType,
    /// Raw command/response/invalid-PID bits
    pub cr_ipid: u8,
}

impl PacketHeader {
    /// Create a header; the label is truncated to 4 bits
    #[must_use]
    pub const fn new(label: u8, packet_type: PacketType, cr_ipid: u8) -> Self {
        Self {
            label: label & MAX_LABEL,
            packet_type,
            cr_ipid: cr_ipid & 0x03,
        }
    }

    /// Decode a header byte
    #[must_use]
    pub const fn from_byte(byte: u8) -> Self {
        Self {
            label: byte >> 4,
            packet_type: PacketType::from_bits(byte >> 2),
            cr_ipid: byte & 0x03,
        }
    }

    /// Encode the header byte
    #[must_use]
    pub const fn to_byte(self) -> u8 {
        (self.label << 4) | ((self.packet_type as u8) << 2) | self.cr_ipid
    }
}

/// Number of packets a message of `message_len` bytes is split into when the
/// first packet is a Start packet
///
/// The wire field is one byte; counts beyond 255 saturate.
#[must_use]
pub fn segment_count(message_len: usize, mtu: usize) -> u8 {
    let remaining = (message_len + HDR_LEN_START).saturating_sub(mtu);
    let per_packet = mtu - HDR_LEN_CONTINUE;
    let mut count = remaining / per_packet + 1;
    if remaining % per_packet != 0 {
        count += 1;
    }
    u8::try_from(count).unwrap_or(u8::MAX)
}

/// Position within one outbound message being split into packets
///
/// The cursor does not borrow the message, so a half-written message can be
/// parked in a queue and resumed later. Feed it the same message every time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentCursor {
    message_len: usize,
    offset: usize,
    mtu: usize,
    label: u8,
    cr: CommandResponse,
    pid: u16,
    segments: u8,
    next_type: Option<PacketType>,
}

impl FragmentCursor {
    /// Create a cursor at the start of a message of `message_len` bytes
    ///
    /// The MTU is clamped to the range `[HDR_LEN_START, MAX_PACKET_SIZE]`.
    #[must_use]
    pub fn new(message_len: usize, label: u8, cr: CommandResponse, pid: u16, mtu: u16) -> Self {
        let mtu = usize::from(mtu).clamp(HDR_LEN_START, MAX_PACKET_SIZE);
        let (first, segments) = if message_len <= mtu - HDR_LEN_SINGLE {
            (PacketType::Single, 1)
        } else {
            (PacketType::Start, segment_count(message_len, mtu))
        };

        Self {
            message_len,
            offset: 0,
            mtu,
            label,
            cr,
            pid,
            segments,
            next_type: Some(first),
        }
    }

    /// Total number of packets of the message (saturating at 255)
    #[must_use]
    pub fn segments(&self) -> u8 {
        self.segments
    }

    /// Whether every packet has been produced
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.next_type.is_none()
    }

    /// Build the next packet of `message`
    pub fn next_packet(&mut self, message: &[u8]) -> Option<Packet> {
        let packet_type = self.next_type?;
        let Some(remaining) = message.get(self.offset..self.message_len) else {
            self.next_type = None;
            return None;
        };
        let chunk_len = remaining.len().min(self.mtu - packet_type.header_len());

        let mut packet = Packet::new();
        let header = PacketHeader::new(self.label, packet_type, self.cr as u8);
        packet.push(header.to_byte()).ok();
        if packet_type == PacketType::Start {
            packet.push(self.segments).ok();
        }
        if packet_type.carries_pid() {
            packet.extend_from_slice(&self.pid.to_be_bytes()).ok();
        }
        packet.extend_from_slice(&remaining[..chunk_len]).ok();

        self.offset += chunk_len;
        let left = self.message_len - self.offset;
        self.next_type = if left == 0 {
            None
        } else if left > self.mtu - HDR_LEN_END {
            Some(PacketType::Continue)
        } else {
            Some(PacketType::End)
        };

        Some(packet)
    }
}

/// Splits one outbound message into AVCTP packets sized to the peer MTU
///
/// Messages that fit into `mtu - 3` bytes go out as a single packet; longer
/// messages become a Start packet, zero or more Continue packets and an End
/// packet. An empty message produces one header-only Single packet.
#[derive(Debug)]
pub struct Fragmenter<'m> {
    message: &'m [u8],
    cursor: FragmentCursor,
}

impl<'m> Fragmenter<'m> {
    /// Create a fragmenter for `message`
    #[must_use]
    pub fn new(message: &'m [u8], label: u8, cr: CommandResponse, pid: u16, mtu: u16) -> Self {
        Self {
            message,
            cursor: FragmentCursor::new(message.len(), label, cr, pid, mtu),
        }
    }

    /// Total number of packets this fragmenter produces (saturating at 255)
    #[must_use]
    pub fn segments(&self) -> u8 {
        self.cursor.segments()
    }
}

impl Iterator for Fragmenter<'_> {
    type Item = Packet;

    fn next(&mut self) -> Option<Packet> {
        self.cursor.next_packet(self.message)
    }
}
