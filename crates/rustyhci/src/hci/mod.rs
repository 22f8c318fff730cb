//! Bluetooth HCI (Host Controller Interface) packet layer
//!
//! This module provides the wire constants, packet types and the H4 stream
//! framer shared by every transport.

pub mod constants;
pub mod framer;
pub mod packet;

#[cfg(test)]
mod tests;

pub use framer::PacketFramer;
pub use packet::{contains_reset_complete, opcode, HciCommand, Packet, PacketType};
