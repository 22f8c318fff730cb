//! HCI transports
//!
//! A [`Session`] drives one of three link variants (kernel socket, USB or
//! serial) behind the uniform [`TransportDriver`] contract. The variants
//! only provide a [`Connector`] that can list devices and open a [`Link`];
//! framing, flow control, the reset handshake and reconnection live in the
//! session.

#[cfg(any(target_os = "linux", target_os = "android"))]
pub mod native;
pub mod queue;
pub mod reconnect;
pub mod session;
pub mod uart;
pub mod usb;

use crate::config::{BindParams, TransportConfig};
use crate::error::{HciError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use queue::{PacketSink, WriteQueue};
pub use reconnect::{CancelFlag, ReconnectOutcome, ReconnectPolicy, ReconnectSupervisor};
pub use session::Session;

/// Binding mode of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Unbound,
    Raw,
    User,
    Control,
    Closed,
}

impl Mode {
    /// Raw and User own a link; the other modes never touch I/O
    pub fn has_link(self) -> bool {
        matches!(self, Mode::Raw | Mode::User)
    }
}

/// Device identity: numeric for kernel and USB devices, a path for serial ports
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeviceId {
    Index(u16),
    Path(String),
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceId::Index(index) => write!(f, "{}", index),
            DeviceId::Path(path) => f.write_str(path),
        }
    }
}

/// Device listing record shared by all variants.
///
/// Fields that do not apply to a variant are `None` and serialize as
/// `null`, never omitted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub dev_id: Option<DeviceId>,
    pub dev_up: Option<bool>,
    pub id_vendor: Option<u16>,
    pub id_product: Option<u16>,
    pub bus_number: Option<u8>,
    pub device_address: Option<u8>,
    pub path: Option<String>,
}

impl DeviceInfo {
    pub fn native(dev_id: u16, dev_up: bool) -> Self {
        Self {
            dev_id: Some(DeviceId::Index(dev_id)),
            dev_up: Some(dev_up),
            ..Self::default()
        }
    }

    pub fn usb(index: u16, vid: u16, pid: u16, bus: Option<u8>, address: u8) -> Self {
        Self {
            dev_id: Some(DeviceId::Index(index)),
            id_vendor: Some(vid),
            id_product: Some(pid),
            bus_number: bus,
            device_address: Some(address),
            ..Self::default()
        }
    }

    pub fn serial(path: &str, vid: Option<u16>, pid: Option<u16>) -> Self {
        Self {
            dev_id: Some(DeviceId::Path(path.to_string())),
            dev_up: Some(true),
            id_vendor: vid,
            id_product: pid,
            path: Some(path.to_string()),
            ..Self::default()
        }
    }
}

/// Notification delivered to the consumer, in production order
#[derive(Debug)]
pub enum DriverEvent {
    /// One complete HCI packet, indicator byte included
    Data(Bytes),
    Error(HciError),
    /// The link went up (`true`) or down (`false`)
    State(bool),
}

/// How a variant supports `set_filter`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterSupport {
    None,
    /// Socket option applied by the kernel
    Kernel,
    /// HCI Set Event Filter command written to the controller
    Command,
}

/// Variant-specific session behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Raw binding issues HCI Reset and waits for its completion before
    /// the link is up
    pub reset_handshake: bool,
    pub filter: FilterSupport,
}

/// Source of the device listing
#[async_trait]
pub trait DeviceLister: Send + Sync {
    async fn list_devices(&self) -> Result<Vec<DeviceInfo>>;
}

/// An open link to a controller
#[async_trait]
pub trait Link: PacketSink {
    /// Next chunk of inbound bytes; `None` once the link has closed
    async fn read(&mut self) -> Result<Option<Bytes>>;

    async fn close(&mut self) -> Result<()>;

    /// Apply a kernel-level packet filter
    fn set_filter(&mut self, _filter: &[u8]) -> Result<()> {
        Err(HciError::Unsupported)
    }

    /// Up state as reported by the operating system, when it knows
    fn device_up(&self) -> Option<bool> {
        None
    }
}

/// Opens links for one transport variant
#[async_trait]
pub trait Connector: DeviceLister {
    type Target: Clone + fmt::Debug + Send + Sync;
    type Link: Link;

    fn capabilities(&self) -> Capabilities;

    /// Turn bind arguments into a concrete target
    async fn resolve(
        &self,
        dev_id: Option<&DeviceId>,
        params: &BindParams,
        mode: Mode,
        config: &TransportConfig,
    ) -> Result<Self::Target>;

    async fn open(&self, target: &Self::Target, mode: Mode) -> Result<Self::Link>;

    /// Reconnect settings for a target; `None` disables reconnection
    fn reconnect_policy(&self, _target: &Self::Target) -> Option<ReconnectPolicy> {
        None
    }

    /// Whether `target` shows up in a device listing
    fn is_present(&self, target: &Self::Target, devices: &[DeviceInfo]) -> bool;
}

/// Uniform driver contract over all transport variants
#[async_trait]
pub trait TransportDriver: Send {
    /// Controllers this variant can see
    async fn get_device_list(&mut self) -> Result<Vec<DeviceInfo>>;
    fn is_dev_up(&self) -> bool;
    async fn start(&mut self) -> Result<()>;
    async fn stop(&mut self) -> Result<()>;
    async fn reset(&mut self) -> Result<()>;
    async fn bind_raw(&mut self, dev_id: Option<DeviceId>, params: BindParams) -> Result<()>;
    async fn bind_user(&mut self, dev_id: Option<DeviceId>, params: BindParams) -> Result<()>;
    /// Drop any link and switch to Control; no I/O is done in that mode
    async fn bind_control(&mut self);
    async fn set_filter(&mut self, filter: &[u8]) -> Result<()>;
    async fn write(&mut self, data: &[u8]) -> Result<()>;
    /// Next notification; `None` when nothing more can arrive
    async fn next_event(&mut self) -> Option<DriverEvent>;
    /// Explicit teardown: resets the controller if still armed, then stops
    async fn shutdown(&mut self) -> Result<()>;
}

/// Driver variant selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverType {
    Uart,
    Usb,
    Native,
    Default,
}

impl DriverType {
    /// Pick a concrete variant for `Default` from the environment and platform
    pub fn select(self, config: &TransportConfig) -> Option<DriverType> {
        match self {
            DriverType::Default => {
                if config.prefers_uart() {
                    Some(DriverType::Uart)
                } else if config.force_usb || cfg!(any(target_os = "windows", target_os = "freebsd")) {
                    Some(DriverType::Usb)
                } else if cfg!(any(target_os = "linux", target_os = "android")) {
                    Some(DriverType::Native)
                } else {
                    None
                }
            }
            concrete => Some(concrete),
        }
    }
}

/// Create a driver of the requested type, configured from the environment
pub fn load_driver(kind: DriverType) -> Result<Box<dyn TransportDriver>> {
    load_driver_with(kind, TransportConfig::from_env())
}

pub fn load_driver_with(kind: DriverType, config: TransportConfig) -> Result<Box<dyn TransportDriver>> {
    match kind.select(&config) {
        Some(DriverType::Uart) => Ok(Box::new(Session::new(uart::UartConnector::new(), config))),
        Some(DriverType::Usb) => Ok(Box::new(Session::new(usb::UsbConnector::new(), config))),
        #[cfg(any(target_os = "linux", target_os = "android"))]
        Some(DriverType::Native) => Ok(Box::new(Session::new(native::NativeConnector::new(), config))),
        _ => Err(HciError::Unsupported),
    }
}
