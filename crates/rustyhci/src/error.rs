//! Error types for the rustyhci library
//!
//! This module defines the error types used throughout the library.

use thiserror::Error;

/// Errors that can occur while binding or driving an HCI transport
#[derive(Error, Debug)]
pub enum HciError {
    #[error("Invalid bind parameters: {0}")]
    InvalidParameters(String),

    #[error("No usable transport found: {0}")]
    TransportUnavailable(String),

    #[error("Unknown packet type: {0:#04x}")]
    UnknownPacketType(u8),

    #[error("Transport I/O failed: {0}")]
    Transport(#[from] std::io::Error),

    #[error("USB transfer failed: {0}")]
    Usb(String),

    #[error("Invalid parameter length: {0}")]
    InvalidParamLength(usize),

    #[error("Reconnect gave up after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("Session is not bound to a transport")]
    NotBound,

    #[error("Unsupported operation")]
    Unsupported,
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, HciError>;
