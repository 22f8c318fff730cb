//! HCI packet structures and command building
//!
//! This module contains the packet types seen on an H4 byte stream and the
//! handful of commands the transport layer issues on its own.

use crate::error::{HciError, Result};
use crate::hci::constants::*;
use byteorder::{ByteOrder, LittleEndian};
use bytes::Bytes;
use std::convert::TryFrom;

/// H4 packet indicator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Command = HCI_COMMAND_PKT,
    AclData = HCI_ACL_PKT,
    Event = HCI_EVENT_PKT,
}

impl PacketType {
    /// Number of header bytes, indicator included
    pub fn header_len(self) -> usize {
        match self {
            Self::Command => HCI_COMMAND_HDR_SIZE,
            Self::Event => HCI_EVENT_HDR_SIZE,
            Self::AclData => HCI_ACL_HDR_SIZE,
        }
    }

    /// Reads the body length out of a complete header.
    ///
    /// `header` must hold at least `header_len()` bytes.
    pub fn body_len(self, header: &[u8]) -> usize {
        match self {
            Self::Command | Self::Event => header[2] as usize,
            Self::AclData => LittleEndian::read_u16(&header[3..5]) as usize,
        }
    }
}

impl TryFrom<u8> for PacketType {
    type Error = HciError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            HCI_COMMAND_PKT => Ok(Self::Command),
            HCI_ACL_PKT => Ok(Self::AclData),
            HCI_EVENT_PKT => Ok(Self::Event),
            other => Err(HciError::UnknownPacketType(other)),
        }
    }
}

/// One complete packet cut out of the byte stream
///
/// The packet keeps the exact bytes it was framed from, so forwarding it
/// to a consumer never re-encodes anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    packet_type: PacketType,
    header_len: usize,
    data: Bytes,
}

impl Packet {
    pub(crate) fn new(packet_type: PacketType, data: Bytes) -> Self {
        Self {
            packet_type,
            header_len: packet_type.header_len(),
            data,
        }
    }

    pub fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    /// Header bytes, indicator included
    pub fn header(&self) -> &[u8] {
        &self.data[..self.header_len]
    }

    pub fn body(&self) -> &[u8] {
        &self.data[self.header_len..]
    }

    /// The packet exactly as it appeared on the wire
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Bytes {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Combine an OGF and OCF into a 16-bit opcode
pub fn opcode(ogf: u8, ocf: u16) -> u16 {
    ((ogf as u16) << 10) | (ocf & 0x3ff)
}

/// Commands the transport layer builds itself
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum HciCommand {
    // Host Controller Commands (OGF: 0x03)
    Reset,
    SetEventFilter { filter: Vec<u8> },
    SetEventMask { event_mask: u64 },

    // LE Commands (OGF: 0x08)
    LeSetEventMask { event_mask: u64 },
    LeSetScanParameters {
        scan_type: u8,
        scan_interval: u16,
        scan_window: u16,
        own_address_type: u8,
        filter_policy: u8,
    },
    LeSetScanEnable { enable: bool, filter_duplicates: bool },
}

impl HciCommand {
    /// Get the OGF and OCF for this command
    pub fn opcode_parts(&self) -> (u8, u16) {
        match self {
            Self::Reset => (OGF_HOST_CTL, OCF_RESET),
            Self::SetEventFilter { .. } => (OGF_HOST_CTL, OCF_SET_EVENT_FILTER),
            Self::SetEventMask { .. } => (OGF_HOST_CTL, OCF_SET_EVENT_MASK),
            Self::LeSetEventMask { .. } => (OGF_LE, OCF_LE_SET_EVENT_MASK),
            Self::LeSetScanParameters { .. } => (OGF_LE, OCF_LE_SET_SCAN_PARAMETERS),
            Self::LeSetScanEnable { .. } => (OGF_LE, OCF_LE_SET_SCAN_ENABLE),
        }
    }

    pub fn opcode(&self) -> u16 {
        let (ogf, ocf) = self.opcode_parts();
        opcode(ogf, ocf)
    }

    fn parameters(&self) -> Vec<u8> {
        match self {
            Self::Reset => vec![],

            Self::SetEventFilter { filter } => filter.clone(),

            Self::SetEventMask { event_mask } | Self::LeSetEventMask { event_mask } => {
                event_mask.to_le_bytes().to_vec()
            }

            Self::LeSetScanParameters {
                scan_type,
                scan_interval,
                scan_window,
                own_address_type,
                filter_policy,
            } => {
                let mut params = vec![0u8; 7];
                params[0] = *scan_type;
                LittleEndian::write_u16(&mut params[1..3], *scan_interval);
                LittleEndian::write_u16(&mut params[3..5], *scan_window);
                params[5] = *own_address_type;
                params[6] = *filter_policy;
                params
            }

            Self::LeSetScanEnable {
                enable,
                filter_duplicates,
            } => vec![*enable as u8, *filter_duplicates as u8],
        }
    }

    /// Convert the command to a raw H4 command packet
    pub fn to_packet(&self) -> Result<Vec<u8>> {
        let params = self.parameters();
        if params.len() > HCI_MAX_PARAM_LEN {
            return Err(HciError::InvalidParamLength(params.len()));
        }

        let mut packet = vec![0u8; 4 + params.len()];
        packet[0] = HCI_COMMAND_PKT;
        LittleEndian::write_u16(&mut packet[1..3], self.opcode());
        packet[3] = params.len() as u8;
        packet[4..].copy_from_slice(&params);
        Ok(packet)
    }
}

/// Whether `data` contains any of the accepted Reset completion events
pub fn contains_reset_complete(data: &[u8]) -> bool {
    RESET_COMPLETE_PATTERNS
        .iter()
        .any(|pattern| data.windows(pattern.len()).any(|window| window == pattern))
}
