//! RustyHCI - Bluetooth HCI transports
//!
//! This library moves raw HCI command, event and ACL data packets between a
//! host process and a Bluetooth controller over one of three links: the
//! Linux kernel HCI socket, a USB Bluetooth interface, or a UART speaking
//! H4. Every link is driven through the same [`TransportDriver`] contract,
//! which handles packet reassembly, the reset handshake, write ordering and
//! serial reconnection.

pub mod config;
pub mod error;
pub mod hci;
pub mod transport;

// Re-export common types for convenience
pub use config::{BindParams, TransportConfig, UartParams, UsbParams};
pub use error::{HciError, Result};
pub use hci::{HciCommand, Packet, PacketFramer, PacketType};
pub use transport::{
    load_driver, load_driver_with, DeviceId, DeviceInfo, DriverEvent, DriverType, Mode, Session,
    TransportDriver,
};
