//! Transport configuration
//!
//! Environment overrides and the parameters accepted by the bind calls.

use crate::error::{HciError, Result};
use crate::hci::constants::DEFAULT_UART_BAUD_RATE;
use crate::transport::DeviceId;
use log::warn;
use serde::{Deserialize, Serialize};

pub const UART_PORT_VAR: &str = "BLUETOOTH_HCI_SOCKET_UART_PORT";
pub const UART_BAUD_RATE_VAR: &str = "BLUETOOTH_HCI_SOCKET_UART_BAUDRATE";
pub const FORCE_UART_VAR: &str = "BLUETOOTH_HCI_SOCKET_FORCE_UART";
pub const FORCE_USB_VAR: &str = "BLUETOOTH_HCI_SOCKET_FORCE_USB";

/// Rebind attempts made after a serial link drops, unless overridden
pub const DEFAULT_RETRY_CONNECTION: u32 = 10;

/// Settings read from the process environment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportConfig {
    pub uart_port: Option<String>,
    pub uart_baud_rate: Option<u32>,
    pub force_uart: bool,
    pub force_usb: bool,
}

impl TransportConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let uart_port = lookup(UART_PORT_VAR).filter(|port| !port.is_empty());

        let uart_baud_rate = lookup(UART_BAUD_RATE_VAR).and_then(|raw| {
            match raw.trim().parse::<u32>() {
                Ok(baud) if baud > 0 => Some(baud),
                _ => {
                    warn!("ignoring {}={:?}: not a positive integer", UART_BAUD_RATE_VAR, raw);
                    None
                }
            }
        });

        Self {
            uart_port,
            uart_baud_rate,
            force_uart: lookup(FORCE_UART_VAR).map_or(false, |v| !v.is_empty()),
            force_usb: lookup(FORCE_USB_VAR).map_or(false, |v| !v.is_empty()),
        }
    }

    /// Whether the default driver should be the serial one
    pub fn prefers_uart(&self) -> bool {
        self.uart_port.is_some() || self.force_uart
    }
}

/// Parameters for the bind calls
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindParams {
    #[serde(default)]
    pub usb: Option<UsbParams>,
    #[serde(default)]
    pub uart: Option<UartParams>,
}

/// USB device selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbParams {
    pub vid: u16,
    pub pid: u16,
    #[serde(default)]
    pub bus: Option<u8>,
    #[serde(default)]
    pub address: Option<u8>,
}

/// Serial line selection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UartParams {
    #[serde(default)]
    pub port: Option<String>,
    #[serde(default)]
    pub baud_rate: Option<u32>,
    #[serde(default)]
    pub retry_connection: Option<u32>,
}

/// Fully resolved serial line settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UartTarget {
    pub port: String,
    pub baud_rate: u32,
    pub retry_connection: u32,
}

impl UartTarget {
    /// Resolve port and baud rate.
    ///
    /// Explicit parameters win over the environment, which wins over the
    /// defaults. When no port is configured anywhere, a path `dev_id` is
    /// used as the port.
    pub fn resolve(
        dev_id: Option<&DeviceId>,
        params: &BindParams,
        config: &TransportConfig,
    ) -> Result<Self> {
        let uart = params.uart.clone().unwrap_or_default();

        let port = uart
            .port
            .filter(|port| !port.is_empty())
            .or_else(|| config.uart_port.clone())
            .or_else(|| match dev_id {
                Some(DeviceId::Path(path)) => Some(path.clone()),
                _ => None,
            })
            .filter(|port| !port.is_empty())
            .ok_or_else(|| HciError::InvalidParameters("no UART port given".into()))?;

        let baud_rate = match uart.baud_rate {
            Some(0) => {
                return Err(HciError::InvalidParameters(
                    "UART baud rate must be positive".into(),
                ))
            }
            Some(baud) => baud,
            None => config.uart_baud_rate.unwrap_or(DEFAULT_UART_BAUD_RATE),
        };

        Ok(Self {
            port,
            baud_rate,
            retry_connection: uart.retry_connection.unwrap_or(DEFAULT_RETRY_CONNECTION),
        })
    }
}
