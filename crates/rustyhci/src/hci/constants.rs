//! HCI protocol constants
//!
//! This module contains the constants the transport layer needs from the
//! Bluetooth HCI protocol.

// HCI packet types (H4 indicator byte)
pub const HCI_COMMAND_PKT: u8 = 0x01;
pub const HCI_ACL_PKT: u8 = 0x02;
pub const HCI_EVENT_PKT: u8 = 0x04;

// Header sizes including the indicator byte
pub const HCI_COMMAND_HDR_SIZE: usize = 3;
pub const HCI_EVENT_HDR_SIZE: usize = 3;
pub const HCI_ACL_HDR_SIZE: usize = 5;

// Maximum size of HCI command parameters
pub const HCI_MAX_PARAM_LEN: usize = 255;

// Common OGF (Opcode Group Field) values
pub const OGF_HOST_CTL: u8 = 0x03;
pub const OGF_LE: u8 = 0x08;

// Host Controller Commands (OGF: 0x03)
pub const OCF_SET_EVENT_MASK: u16 = 0x0001;
pub const OCF_RESET: u16 = 0x0003;
pub const OCF_SET_EVENT_FILTER: u16 = 0x0005;

// LE Command OCF values (OGF: 0x08)
pub const OCF_LE_SET_EVENT_MASK: u16 = 0x0001;
pub const OCF_LE_SET_SCAN_PARAMETERS: u16 = 0x000B;
pub const OCF_LE_SET_SCAN_ENABLE: u16 = 0x000C;

// HCI Events
pub const EVT_CMD_COMPLETE: u8 = 0x0E;

/// Command Complete events for HCI_Reset that mark a controller as ready.
///
/// Controller firmware reports the event with differing values in the
/// Num_HCI_Command_Packets field, so all of these are accepted.
pub const RESET_COMPLETE_PATTERNS: [[u8; 7]; 3] = [
    [HCI_EVENT_PKT, EVT_CMD_COMPLETE, 0x04, 0x01, 0x03, 0x0C, 0x00],
    [HCI_EVENT_PKT, EVT_CMD_COMPLETE, 0x04, 0x02, 0x03, 0x0C, 0x00],
    [HCI_EVENT_PKT, EVT_CMD_COMPLETE, 0x04, 0x05, 0x03, 0x0C, 0x00],
];

/// Serial line speed used when neither the caller nor the environment set one
pub const DEFAULT_UART_BAUD_RATE: u32 = 1_000_000;
