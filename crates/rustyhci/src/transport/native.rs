//! Kernel HCI socket transport (Linux)
//!
//! Binds an `AF_BLUETOOTH`/`BTPROTO_HCI` socket to one controller on the raw
//! or user channel. The kernel already delivers whole H4 packets, so the
//! link hands reads straight to the session.

use crate::config::{BindParams, TransportConfig};
use crate::error::{HciError, Result};
use crate::transport::{
    Capabilities, Connector, DeviceId, DeviceInfo, DeviceLister, FilterSupport, Link, Mode,
    PacketSink,
};
use async_trait::async_trait;
use bitflags::bitflags;
use bytes::Bytes;
use log::debug;
use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};
use tokio::io::unix::AsyncFd;

// Bluetooth socket constants
const AF_BLUETOOTH: i32 = 31;
const BTPROTO_HCI: i32 = 1;
const HCI_CHANNEL_RAW: u16 = 0;
const HCI_CHANNEL_USER: u16 = 1;

const SOL_HCI: i32 = 0;
const HCI_FILTER: i32 = 2;

const HCI_MAX_DEV: usize = 16;

// _IOR('H', 210, int) and _IOR('H', 211, int)
const HCIGETDEVLIST: u32 = 0x8004_48D2;
const HCIGETDEVINFO: u32 = 0x8004_48D3;

const READ_BUFFER_SIZE: usize = 1024;

bitflags! {
    /// Device flags reported by `HCIGETDEVLIST` and `HCIGETDEVINFO`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DevFlags: u32 {
        const UP = 1 << 0;
        const INIT = 1 << 1;
        const RUNNING = 1 << 2;
        const PSCAN = 1 << 3;
        const ISCAN = 1 << 4;
        const AUTH = 1 << 5;
        const ENCRYPT = 1 << 6;
        const INQUIRY = 1 << 7;
        const RAW = 1 << 8;
    }
}

#[repr(C)]
struct SockaddrHci {
    hci_family: libc::sa_family_t,
    hci_dev: u16,
    hci_channel: u16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct HciDevReq {
    dev_id: u16,
    dev_opt: u32,
}

#[repr(C)]
struct HciDevListReq {
    dev_num: u16,
    dev_req: [HciDevReq; HCI_MAX_DEV],
}

#[repr(C)]
#[derive(Default)]
#[allow(dead_code)]
struct HciDevStats {
    counters: [u32; 10],
}

#[repr(C)]
#[derive(Default)]
#[allow(dead_code)]
struct HciDevInfo {
    dev_id: u16,
    name: [u8; 8],
    bdaddr: [u8; 6],
    flags: u32,
    dev_type: u8,
    features: [u8; 8],
    pkt_type: u32,
    link_policy: u32,
    link_mode: u32,
    acl_mtu: u16,
    acl_pkts: u16,
    sco_mtu: u16,
    sco_pkts: u16,
    stat: HciDevStats,
}

/// Kernel `struct hci_filter`
#[repr(C)]
#[derive(Debug, Default, PartialEq, Eq)]
struct HciFilter {
    type_mask: u32,
    event_mask: [u32; 2],
    opcode: u16,
}

/// Bytes of `hci_filter` a caller may supply
const HCI_FILTER_LEN: usize = 14;

impl HciFilter {
    /// Lay caller bytes over a zeroed filter, the way the kernel struct is
    /// filled from a buffer.
    fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() > HCI_FILTER_LEN {
            return Err(HciError::InvalidParameters(format!(
                "filter is {} bytes, at most {} allowed",
                data.len(),
                HCI_FILTER_LEN
            )));
        }
        let mut raw = [0u8; HCI_FILTER_LEN];
        raw[..data.len()].copy_from_slice(data);

        let word = |at: usize| u32::from_ne_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);
        Ok(Self {
            type_mask: word(0),
            event_mask: [word(4), word(8)],
            opcode: u16::from_ne_bytes([raw[12], raw[13]]),
        })
    }
}

/// Owned HCI socket file descriptor
#[derive(Debug)]
struct HciSocket {
    fd: RawFd,
}

impl HciSocket {
    /// Open an unbound, non-blocking HCI socket
    fn open() -> io::Result<Self> {
        let fd = unsafe {
            libc::socket(
                AF_BLUETOOTH,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
                BTPROTO_HCI,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd })
    }

    fn bind(&self, dev_id: u16, channel: u16) -> io::Result<()> {
        let addr = SockaddrHci {
            hci_family: AF_BLUETOOTH as libc::sa_family_t,
            hci_dev: dev_id,
            hci_channel: channel,
        };
        let result = unsafe {
            libc::bind(
                self.fd,
                &addr as *const _ as *const libc::sockaddr,
                mem::size_of::<SockaddrHci>() as libc::socklen_t,
            )
        };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn dev_list(&self) -> io::Result<Vec<HciDevReq>> {
        let mut request = HciDevListReq {
            dev_num: HCI_MAX_DEV as u16,
            dev_req: [HciDevReq::default(); HCI_MAX_DEV],
        };
        let result = unsafe { libc::ioctl(self.fd, HCIGETDEVLIST as _, &mut request as *mut HciDevListReq) };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }
        let count = usize::from(request.dev_num).min(HCI_MAX_DEV);
        Ok(request.dev_req[..count].to_vec())
    }

    fn dev_info(&self, dev_id: u16) -> io::Result<HciDevInfo> {
        let mut info = HciDevInfo {
            dev_id,
            ..HciDevInfo::default()
        };
        let result = unsafe { libc::ioctl(self.fd, HCIGETDEVINFO as _, &mut info as *mut HciDevInfo) };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(info)
    }

    fn set_filter(&self, filter: &HciFilter) -> io::Result<()> {
        let result = unsafe {
            libc::setsockopt(
                self.fd,
                SOL_HCI,
                HCI_FILTER,
                filter as *const HciFilter as *const libc::c_void,
                mem::size_of::<HciFilter>() as libc::socklen_t,
            )
        };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn recv(&self, buffer: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::read(self.fd, buffer.as_mut_ptr() as *mut libc::c_void, buffer.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn send(&self, data: &[u8]) -> io::Result<usize> {
        let n = unsafe { libc::write(self.fd, data.as_ptr() as *const libc::c_void, data.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

impl AsRawFd for HciSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for HciSocket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

fn flags_of(dev_opt: u32) -> DevFlags {
    DevFlags::from_bits_truncate(dev_opt)
}

/// First device whose up flag matches `want_up`, else device 0
fn pick_device(devices: &[HciDevReq], want_up: bool) -> u16 {
    devices
        .iter()
        .find(|dev| flags_of(dev.dev_opt).contains(DevFlags::UP) == want_up)
        .map_or(0, |dev| dev.dev_id)
}

/// Kernel controller selected by a bind call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeTarget {
    pub dev_id: u16,
}

/// Opens kernel HCI sockets
#[derive(Debug, Default)]
pub struct NativeConnector;

impl NativeConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DeviceLister for NativeConnector {
    async fn list_devices(&self) -> Result<Vec<DeviceInfo>> {
        let socket = HciSocket::open()?;
        let devices = socket.dev_list()?;
        Ok(devices
            .iter()
            .map(|dev| DeviceInfo::native(dev.dev_id, flags_of(dev.dev_opt).contains(DevFlags::UP)))
            .collect())
    }
}

#[async_trait]
impl Connector for NativeConnector {
    type Target = NativeTarget;
    type Link = NativeLink;

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            reset_handshake: false,
            filter: FilterSupport::Kernel,
        }
    }

    async fn resolve(
        &self,
        dev_id: Option<&DeviceId>,
        _params: &BindParams,
        mode: Mode,
        _config: &TransportConfig,
    ) -> Result<NativeTarget> {
        let dev_id = match dev_id {
            Some(DeviceId::Index(index)) => *index,
            Some(DeviceId::Path(path)) => {
                return Err(HciError::InvalidParameters(format!(
                    "kernel devices are numbered, got {:?}",
                    path
                )))
            }
            None => {
                let socket = HciSocket::open()?;
                // Raw binds to a running controller, user takes one the kernel left down
                pick_device(&socket.dev_list()?, mode == Mode::Raw)
            }
        };
        Ok(NativeTarget { dev_id })
    }

    async fn open(&self, target: &NativeTarget, mode: Mode) -> Result<NativeLink> {
        let channel = match mode {
            Mode::Raw => HCI_CHANNEL_RAW,
            Mode::User => HCI_CHANNEL_USER,
            _ => return Err(HciError::Unsupported),
        };

        let socket = HciSocket::open()?;
        socket.bind(target.dev_id, channel).map_err(|e| {
            HciError::TransportUnavailable(format!("hci{}: {}", target.dev_id, e))
        })?;
        debug!("bound hci{} on channel {}", target.dev_id, channel);

        Ok(NativeLink {
            socket: AsyncFd::new(socket)?,
            dev_id: target.dev_id,
            mode,
        })
    }

    fn is_present(&self, target: &NativeTarget, devices: &[DeviceInfo]) -> bool {
        devices
            .iter()
            .any(|device| device.dev_id == Some(DeviceId::Index(target.dev_id)))
    }
}

/// A bound kernel HCI socket
pub struct NativeLink {
    socket: AsyncFd<HciSocket>,
    dev_id: u16,
    mode: Mode,
}

#[async_trait]
impl PacketSink for NativeLink {
    async fn send(&mut self, packet: &[u8]) -> Result<()> {
        loop {
            let mut guard = self.socket.writable().await?;
            match guard.try_io(|inner| inner.get_ref().send(packet)) {
                Ok(result) => {
                    result?;
                    return Ok(());
                }
                Err(_would_block) => continue,
            }
        }
    }
}

#[async_trait]
impl Link for NativeLink {
    async fn read(&mut self) -> Result<Option<Bytes>> {
        let mut buffer = [0u8; READ_BUFFER_SIZE];
        loop {
            let mut guard = self.socket.readable().await?;
            match guard.try_io(|inner| inner.get_ref().recv(&mut buffer)) {
                Ok(Ok(0)) => return Ok(None),
                Ok(Ok(n)) => return Ok(Some(Bytes::copy_from_slice(&buffer[..n]))),
                Ok(Err(e)) => return Err(e.into()),
                Err(_would_block) => continue,
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        // The descriptor is released when the link is dropped
        debug!("closing hci{}", self.dev_id);
        Ok(())
    }

    fn set_filter(&mut self, filter: &[u8]) -> Result<()> {
        let filter = HciFilter::from_bytes(filter)?;
        self.socket.get_ref().set_filter(&filter)?;
        Ok(())
    }

    fn device_up(&self) -> Option<bool> {
        if self.mode != Mode::Raw {
            return None;
        }
        let up = self
            .socket
            .get_ref()
            .dev_info(self.dev_id)
            .map(|info| flags_of(info.flags).contains(DevFlags::UP))
            .unwrap_or(false);
        Some(up)
    }
}
