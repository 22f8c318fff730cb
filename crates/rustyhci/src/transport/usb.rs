//! USB transport
//!
//! Talks to a Bluetooth-class USB controller directly. HCI traffic is split
//! over endpoints by packet type and the H4 indicator never crosses the
//! wire:
//!
//! - commands: class control transfer to the device
//! - events: interrupt IN `0x81`
//! - ACL data: bulk IN `0x82`, bulk OUT `0x02`
//!
//! Inbound transfers are reassembled per endpoint and re-prefixed with
//! their indicator, so the session sees an ordinary H4 stream.

use crate::config::{BindParams, TransportConfig, UsbParams};
use crate::error::{HciError, Result};
use crate::hci::PacketType;
use crate::transport::{
    Capabilities, Connector, DeviceId, DeviceInfo, DeviceLister, FilterSupport, Link, Mode,
    PacketSink,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use log::{debug, trace};
use nusb::transfer::{Bulk, ControlOut, ControlType, In, Interrupt, Out, Recipient, TransferError};
use nusb::{Endpoint, Interface};
use std::collections::VecDeque;
use std::convert::TryFrom;
use std::time::Duration;

const BLUETOOTH_CLASS: u8 = 0xE0;
const BLUETOOTH_SUBCLASS: u8 = 0x01;
const BLUETOOTH_PROTOCOL: u8 = 0x01;

const EVENT_IN_EP: u8 = 0x81;
const ACL_IN_EP: u8 = 0x82;
const ACL_OUT_EP: u8 = 0x02;

const CONTROL_TIMEOUT: Duration = Duration::from_millis(1000);
const READ_TRANSFER_SIZE: usize = 1024;
const READS_IN_FLIGHT: usize = 4;

/// Whether a class triple identifies a Bluetooth primary controller
fn is_bluetooth(class: u8, subclass: u8, protocol: u8) -> bool {
    (class, subclass, protocol) == (BLUETOOTH_CLASS, BLUETOOTH_SUBCLASS, BLUETOOTH_PROTOCOL)
}

fn is_bluetooth_device(dev: &nusb::DeviceInfo) -> bool {
    is_bluetooth(dev.class(), dev.subclass(), dev.protocol())
        || dev
            .interfaces()
            .any(|intf| is_bluetooth(intf.class(), intf.subclass(), intf.protocol()))
}

fn bus_number(dev: &nusb::DeviceInfo) -> Option<u8> {
    dev.bus_id().parse::<u8>().ok()
}

/// Bluetooth controllers currently attached, in enumeration order
async fn bluetooth_devices() -> Result<Vec<nusb::DeviceInfo>> {
    let devices = nusb::list_devices()
        .await
        .map_err(|e| HciError::Usb(format!("Failed to list USB devices: {}", e)))?;
    Ok(devices.filter(is_bluetooth_device).collect())
}

/// USB controller selected by a bind call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbTarget {
    pub vid: u16,
    pub pid: u16,
    pub bus: Option<u8>,
    pub address: u8,
}

impl UsbTarget {
    fn of(dev: &nusb::DeviceInfo) -> Self {
        Self {
            vid: dev.vendor_id(),
            pid: dev.product_id(),
            bus: bus_number(dev),
            address: dev.device_address(),
        }
    }

    fn matches(&self, dev: &nusb::DeviceInfo) -> bool {
        Self::of(dev) == *self
    }
}

/// Whether a listed device satisfies the caller's selection
fn params_match(params: &UsbParams, target: &UsbTarget) -> bool {
    params.vid == target.vid
        && params.pid == target.pid
        && params.bus.map_or(true, |bus| target.bus == Some(bus))
        && params.address.map_or(true, |address| target.address == address)
}

/// Pick a controller: explicit vid/pid first, then the device index, then
/// the first one found.
fn select_target(
    candidates: &[UsbTarget],
    dev_id: Option<&DeviceId>,
    params: Option<&UsbParams>,
) -> Result<UsbTarget> {
    let found = match (params, dev_id) {
        (Some(params), _) => candidates.iter().find(|target| params_match(params, target)),
        (None, Some(DeviceId::Index(index))) => candidates.get(usize::from(*index)),
        (None, Some(DeviceId::Path(path))) => {
            return Err(HciError::InvalidParameters(format!(
                "USB devices are numbered, got {:?}",
                path
            )))
        }
        (None, None) => candidates.first(),
    };
    found
        .cloned()
        .ok_or_else(|| HciError::TransportUnavailable("No compatible USB Bluetooth device found".into()))
}

/// Opens USB Bluetooth controllers
#[derive(Debug, Default)]
pub struct UsbConnector;

impl UsbConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DeviceLister for UsbConnector {
    async fn list_devices(&self) -> Result<Vec<DeviceInfo>> {
        let devices = bluetooth_devices().await?;
        Ok(devices
            .iter()
            .enumerate()
            .map(|(index, dev)| {
                DeviceInfo::usb(
                    index as u16,
                    dev.vendor_id(),
                    dev.product_id(),
                    bus_number(dev),
                    dev.device_address(),
                )
            })
            .collect())
    }
}

#[async_trait]
impl Connector for UsbConnector {
    type Target = UsbTarget;
    type Link = UsbLink;

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            reset_handshake: true,
            filter: FilterSupport::None,
        }
    }

    async fn resolve(
        &self,
        dev_id: Option<&DeviceId>,
        params: &BindParams,
        _mode: Mode,
        _config: &TransportConfig,
    ) -> Result<UsbTarget> {
        let candidates: Vec<UsbTarget> = bluetooth_devices()
            .await?
            .iter()
            .map(UsbTarget::of)
            .collect();
        select_target(&candidates, dev_id, params.usb.as_ref())
    }

    async fn open(&self, target: &UsbTarget, _mode: Mode) -> Result<UsbLink> {
        let device_info = bluetooth_devices()
            .await?
            .into_iter()
            .find(|dev| target.matches(dev))
            .ok_or_else(|| HciError::TransportUnavailable(format!("{:04x}:{:04x} is gone", target.vid, target.pid)))?;

        let device = device_info
            .open()
            .await
            .map_err(|e| HciError::Usb(format!("Failed to open device: {}", e)))?;
        let interface = device
            .claim_interface(0)
            .await
            .map_err(|e| HciError::Usb(format!("Failed to claim interface: {}", e)))?;
        debug!(
            "opened {:04x}:{:04x} at {:?}:{}",
            target.vid, target.pid, target.bus, target.address
        );

        UsbLink::new(interface)
    }

    fn is_present(&self, target: &UsbTarget, devices: &[DeviceInfo]) -> bool {
        devices.iter().any(|device| {
            device.id_vendor == Some(target.vid)
                && device.id_product == Some(target.pid)
                && device.device_address == Some(target.address)
        })
    }
}

/// Rebuilds whole H4 packets from the transfers of one IN endpoint
#[derive(Debug)]
struct EndpointAssembler {
    packet_type: PacketType,
    buffer: BytesMut,
}

impl EndpointAssembler {
    fn new(packet_type: PacketType) -> Self {
        Self {
            packet_type,
            buffer: BytesMut::new(),
        }
    }

    /// Add one transfer, returning the packets it completes with their
    /// indicator byte restored
    fn push(&mut self, transfer: &[u8]) -> Vec<Bytes> {
        let mut packets = Vec::new();
        let mut rest = transfer;

        while !rest.is_empty() {
            if self.buffer.is_empty() {
                self.buffer.extend_from_slice(&[self.packet_type as u8]);
            }
            let header_len = self.packet_type.header_len();
            let wanted = if self.buffer.len() < header_len {
                header_len - self.buffer.len()
            } else {
                header_len + self.packet_type.body_len(&self.buffer[..header_len]) - self.buffer.len()
            };

            let take = wanted.min(rest.len());
            self.buffer.extend_from_slice(&rest[..take]);
            rest = &rest[take..];

            if self.buffer.len() >= header_len {
                let total = header_len + self.packet_type.body_len(&self.buffer[..header_len]);
                if self.buffer.len() == total {
                    packets.push(self.buffer.split().freeze());
                }
            }
        }
        packets
    }
}

/// A claimed USB Bluetooth interface
pub struct UsbLink {
    interface: Interface,
    events: Endpoint<Interrupt, In>,
    acl_in: Endpoint<Bulk, In>,
    acl_out: Endpoint<Bulk, Out>,
    event_assembler: EndpointAssembler,
    acl_assembler: EndpointAssembler,
    ready: VecDeque<Bytes>,
}

impl UsbLink {
    fn new(interface: Interface) -> Result<Self> {
        let mut events = interface
            .endpoint::<Interrupt, In>(EVENT_IN_EP)
            .map_err(|e| HciError::Usb(format!("Failed to open event endpoint: {}", e)))?;
        let mut acl_in = interface
            .endpoint::<Bulk, In>(ACL_IN_EP)
            .map_err(|e| HciError::Usb(format!("Failed to open ACL IN endpoint: {}", e)))?;
        let acl_out = interface
            .endpoint::<Bulk, Out>(ACL_OUT_EP)
            .map_err(|e| HciError::Usb(format!("Failed to open ACL OUT endpoint: {}", e)))?;

        for _ in 0..READS_IN_FLIGHT {
            events.submit(events.allocate(READ_TRANSFER_SIZE));
            acl_in.submit(acl_in.allocate(READ_TRANSFER_SIZE));
        }

        Ok(Self {
            interface,
            events,
            acl_in,
            acl_out,
            event_assembler: EndpointAssembler::new(PacketType::Event),
            acl_assembler: EndpointAssembler::new(PacketType::AclData),
            ready: VecDeque::new(),
        })
    }

    async fn send_command(&mut self, payload: &[u8]) -> Result<()> {
        self.interface
            .control_out(
                ControlOut {
                    control_type: ControlType::Class,
                    recipient: Recipient::Device,
                    request: 0,
                    value: 0,
                    index: 0,
                    data: payload,
                },
                CONTROL_TIMEOUT,
            )
            .await
            .map_err(|e| HciError::Usb(format!("Command transfer failed: {:?}", e)))
    }

    async fn send_acl(&mut self, payload: &[u8]) -> Result<()> {
        let mut buffer = self.acl_out.allocate(payload.len());
        buffer.extend_from_slice(payload);
        self.acl_out.submit(buffer);
        let completion = self.acl_out.next_complete().await;
        completion
            .status
            .map_err(|e| HciError::Usb(format!("ACL transfer failed: {:?}", e)))
    }
}

#[async_trait]
impl PacketSink for UsbLink {
    async fn send(&mut self, packet: &[u8]) -> Result<()> {
        let (&indicator, payload) = packet
            .split_first()
            .ok_or_else(|| HciError::InvalidParameters("empty packet".into()))?;

        match PacketType::try_from(indicator)? {
            PacketType::Command => self.send_command(payload).await,
            PacketType::AclData => self.send_acl(payload).await,
            PacketType::Event => Err(HciError::InvalidParameters(
                "events cannot be sent to a controller".into(),
            )),
        }
    }
}

#[async_trait]
impl Link for UsbLink {
    async fn read(&mut self) -> Result<Option<Bytes>> {
        loop {
            if let Some(packet) = self.ready.pop_front() {
                return Ok(Some(packet));
            }

            tokio::select! {
                completion = self.events.next_complete() => {
                    match completion.status {
                        Ok(()) => {
                            let data = &completion.buffer[..completion.actual_len];
                            trace!("event transfer: {}", hex::encode(data));
                            self.ready.extend(self.event_assembler.push(data));
                            self.events.submit(self.events.allocate(READ_TRANSFER_SIZE));
                        }
                        Err(TransferError::Disconnected) => return Ok(None),
                        Err(e) => return Err(HciError::Usb(format!("Event transfer failed: {:?}", e))),
                    }
                }
                completion = self.acl_in.next_complete() => {
                    match completion.status {
                        Ok(()) => {
                            let data = &completion.buffer[..completion.actual_len];
                            trace!("ACL transfer: {} bytes", data.len());
                            self.ready.extend(self.acl_assembler.push(data));
                            self.acl_in.submit(self.acl_in.allocate(READ_TRANSFER_SIZE));
                        }
                        Err(TransferError::Disconnected) => return Ok(None),
                        Err(e) => return Err(HciError::Usb(format!("ACL transfer failed: {:?}", e))),
                    }
                }
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.events.cancel_all();
        self.acl_in.cancel_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(vid: u16, pid: u16, bus: Option<u8>, address: u8) -> UsbTarget {
        UsbTarget {
            vid,
            pid,
            bus,
            address,
        }
    }

    #[test]
    fn test_bluetooth_class_triple() {
        assert!(is_bluetooth(0xE0, 0x01, 0x01));
        assert!(!is_bluetooth(0xE0, 0x01, 0x02));
        assert!(!is_bluetooth(0xFF, 0x01, 0x01));
    }

    #[test]
    fn test_select_target() {
        let candidates = vec![
            target(0x0A12, 0x0001, Some(1), 4),
            target(0x8087, 0x0A2B, Some(1), 5),
            target(0x0A12, 0x0001, Some(2), 9),
        ];

        let by_ids = UsbParams {
            vid: 0x0A12,
            pid: 0x0001,
            bus: None,
            address: None,
        };
        assert_eq!(select_target(&candidates, None, Some(&by_ids)).unwrap(), candidates[0]);

        let by_location = UsbParams {
            bus: Some(2),
            address: Some(9),
            ..by_ids.clone()
        };
        assert_eq!(
            select_target(&candidates, Some(&DeviceId::Index(0)), Some(&by_location)).unwrap(),
            candidates[2]
        );

        assert_eq!(
            select_target(&candidates, Some(&DeviceId::Index(1)), None).unwrap(),
            candidates[1]
        );
        assert_eq!(select_target(&candidates, None, None).unwrap(), candidates[0]);

        assert!(matches!(
            select_target(&candidates, Some(&DeviceId::Index(3)), None),
            Err(HciError::TransportUnavailable(_))
        ));
        assert!(matches!(
            select_target(&[], None, None),
            Err(HciError::TransportUnavailable(_))
        ));
        assert!(matches!(
            select_target(&candidates, Some(&DeviceId::Path("/dev/ttyACM0".into())), None),
            Err(HciError::InvalidParameters(_))
        ));
    }

    #[test]
    fn test_event_transfers_are_reprefixed() {
        let mut assembler = EndpointAssembler::new(PacketType::Event);

        let packets = assembler.push(&[0x0E, 0x04, 0x01, 0x03, 0x0C, 0x00]);
        assert_eq!(packets, vec![Bytes::from_static(&[0x04, 0x0E, 0x04, 0x01, 0x03, 0x0C, 0x00])]);

        // An event split over two transfers comes out once, whole
        assert!(assembler.push(&[0x3E, 0x03, 0x01]).is_empty());
        let packets = assembler.push(&[0x02, 0x03]);
        assert_eq!(packets, vec![Bytes::from_static(&[0x04, 0x3E, 0x03, 0x01, 0x02, 0x03])]);
    }

    #[test]
    fn test_acl_transfers_are_reprefixed() {
        let mut assembler = EndpointAssembler::new(PacketType::AclData);

        // Two packets in one transfer, then a header split from its body
        let packets = assembler.push(&[0x40, 0x20, 0x01, 0x00, 0xAA, 0x40, 0x20, 0x00, 0x00]);
        assert_eq!(
            packets,
            vec![
                Bytes::from_static(&[0x02, 0x40, 0x20, 0x01, 0x00, 0xAA]),
                Bytes::from_static(&[0x02, 0x40, 0x20, 0x00, 0x00]),
            ]
        );

        assert!(assembler.push(&[0x40, 0x20]).is_empty());
        assert!(assembler.push(&[0x02, 0x00, 0x01]).is_empty());
        let packets = assembler.push(&[0x02]);
        assert_eq!(packets, vec![Bytes::from_static(&[0x02, 0x40, 0x20, 0x02, 0x00, 0x01, 0x02])]);
    }

    #[test]
    fn test_presence_uses_ids_and_address() {
        let connector = UsbConnector::new();
        let wanted = target(0x0A12, 0x0001, Some(1), 4);
        let listed = vec![DeviceInfo::usb(0, 0x0A12, 0x0001, Some(1), 4)];
        assert!(connector.is_present(&wanted, &listed));

        let moved = vec![DeviceInfo::usb(0, 0x0A12, 0x0001, Some(1), 6)];
        assert!(!connector.is_present(&wanted, &moved));
        assert!(connector.capabilities().reset_handshake);
    }
}
