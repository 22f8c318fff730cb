//! Serial (H4 over UART) transport
//!
//! The port is opened with hardware flow control. A blocking reader task
//! polls it with a short timeout and forwards chunks over a channel; writes
//! run on the blocking pool with the port handle moved in and back out.

use crate::config::{BindParams, TransportConfig, UartTarget};
use crate::error::{HciError, Result};
use crate::transport::{
    Capabilities, Connector, DeviceId, DeviceInfo, DeviceLister, FilterSupport, Link, Mode,
    PacketSink, ReconnectPolicy,
};
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, trace};
use serialport::{FlowControl, SerialPort, SerialPortInfo, SerialPortType};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const READ_TIMEOUT: Duration = Duration::from_millis(50);
const READ_BUFFER_SIZE: usize = 256;
const CHANNEL_DEPTH: usize = 64;

/// Map a port listing entry to the shared device record
fn device_info(port: &SerialPortInfo) -> DeviceInfo {
    let (vid, pid) = match &port.port_type {
        SerialPortType::UsbPort(info) => (Some(info.vid), Some(info.pid)),
        _ => (None, None),
    };
    DeviceInfo::serial(&port.port_name, vid, pid)
}

/// Opens serial ports
#[derive(Debug, Default)]
pub struct UartConnector {
    use_filter: bool,
}

impl UartConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send HCI Set Event Filter commands for `set_filter` calls
    pub fn with_filter(use_filter: bool) -> Self {
        Self { use_filter }
    }
}

#[async_trait]
impl DeviceLister for UartConnector {
    async fn list_devices(&self) -> Result<Vec<DeviceInfo>> {
        let ports = serialport::available_ports()
            .map_err(|e| HciError::TransportUnavailable(format!("Failed to enumerate ports: {}", e)))?;
        Ok(ports.iter().map(device_info).collect())
    }
}

#[async_trait]
impl Connector for UartConnector {
    type Target = UartTarget;
    type Link = UartLink;

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            reset_handshake: true,
            filter: if self.use_filter {
                FilterSupport::Command
            } else {
                FilterSupport::None
            },
        }
    }

    async fn resolve(
        &self,
        dev_id: Option<&DeviceId>,
        params: &BindParams,
        _mode: Mode,
        config: &TransportConfig,
    ) -> Result<UartTarget> {
        UartTarget::resolve(dev_id, params, config)
    }

    async fn open(&self, target: &UartTarget, _mode: Mode) -> Result<UartLink> {
        debug!("Using UART PORT = {}, BAUD RATE = {}", target.port, target.baud_rate);

        let port = serialport::new(&target.port, target.baud_rate)
            .flow_control(FlowControl::Hardware)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|e| HciError::TransportUnavailable(format!("Failed to open {}: {}", target.port, e)))?;
        let reader = port
            .try_clone()
            .map_err(|e| HciError::TransportUnavailable(format!("Failed to clone {}: {}", target.port, e)))?;

        Ok(UartLink::spawn(target.port.clone(), port, reader))
    }

    fn reconnect_policy(&self, target: &UartTarget) -> Option<ReconnectPolicy> {
        Some(ReconnectPolicy::new(target.retry_connection))
    }

    fn is_present(&self, target: &UartTarget, devices: &[DeviceInfo]) -> bool {
        devices
            .iter()
            .any(|device| device.path.as_deref() == Some(target.port.as_str()))
    }
}

/// An open serial port
pub struct UartLink {
    path: String,
    writer: Option<Box<dyn SerialPort>>,
    rx: mpsc::Receiver<io::Result<Bytes>>,
    stop_flag: Arc<AtomicBool>,
}

impl UartLink {
    fn spawn(path: String, writer: Box<dyn SerialPort>, mut reader: Box<dyn SerialPort>) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        let stop_flag = Arc::new(AtomicBool::new(false));
        let stop_flag_clone = stop_flag.clone();
        let name = path.clone();

        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; READ_BUFFER_SIZE];
            while !stop_flag_clone.load(Ordering::SeqCst) {
                match reader.read(&mut buf) {
                    Ok(0) => {
                        debug!("{}: end of stream", name);
                        return;
                    }
                    Ok(n) => {
                        trace!("{}: read {} bytes", name, n);
                        if tx.blocking_send(Ok(Bytes::copy_from_slice(&buf[..n]))).is_err() {
                            return;
                        }
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::TimedOut => {}
                    Err(e) => {
                        let _ = tx.blocking_send(Err(e));
                        return;
                    }
                }
            }
        });

        Self {
            path,
            writer: Some(writer),
            rx,
            stop_flag,
        }
    }
}

#[async_trait]
impl PacketSink for UartLink {
    async fn send(&mut self, packet: &[u8]) -> Result<()> {
        let mut port = self
            .writer
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "serial port closed"))?;
        let data = packet.to_vec();

        let (port, result) = tokio::task::spawn_blocking(move || {
            let result = port.write_all(&data).and_then(|_| port.flush());
            (port, result)
        })
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        self.writer = Some(port);
        result?;
        Ok(())
    }
}

#[async_trait]
impl Link for UartLink {
    async fn read(&mut self) -> Result<Option<Bytes>> {
        match self.rx.recv().await {
            Some(Ok(chunk)) => Ok(Some(chunk)),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    async fn close(&mut self) -> Result<()> {
        debug!("closing {}", self.path);
        self.stop_flag.store(true, Ordering::SeqCst);
        self.writer = None;
        Ok(())
    }
}

impl Drop for UartLink {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UartParams;
    use serialport::UsbPortInfo;

    #[test]
    fn test_port_listing_maps_usb_ids() {
        let usb = SerialPortInfo {
            port_name: "/dev/ttyACM0".into(),
            port_type: SerialPortType::UsbPort(UsbPortInfo {
                vid: 0x2FE3,
                pid: 0x0100,
                serial_number: None,
                manufacturer: None,
                product: None,
            }),
        };
        let info = device_info(&usb);
        assert_eq!(info.dev_id, Some(DeviceId::Path("/dev/ttyACM0".into())));
        assert_eq!(info.dev_up, Some(true));
        assert_eq!(info.id_vendor, Some(0x2FE3));
        assert_eq!(info.id_product, Some(0x0100));
        assert_eq!(info.bus_number, None);

        let pci = SerialPortInfo {
            port_name: "/dev/ttyS0".into(),
            port_type: SerialPortType::PciPort,
        };
        let info = device_info(&pci);
        assert_eq!(info.path.as_deref(), Some("/dev/ttyS0"));
        assert_eq!(info.id_vendor, None);
        assert_eq!(info.id_product, None);
    }

    #[test]
    fn test_filter_support_follows_switch() {
        assert_eq!(UartConnector::new().capabilities().filter, FilterSupport::None);
        assert_eq!(
            UartConnector::with_filter(true).capabilities().filter,
            FilterSupport::Command
        );
        assert!(UartConnector::new().capabilities().reset_handshake);
    }

    #[tokio::test]
    async fn test_reconnect_policy_and_presence() {
        let connector = UartConnector::new();
        let params = BindParams {
            usb: None,
            uart: Some(UartParams {
                port: Some("/dev/ttyACM0".into()),
                baud_rate: Some(115200),
                retry_connection: Some(3),
            }),
        };
        let target = connector
            .resolve(None, &params, Mode::Raw, &TransportConfig::default())
            .await
            .unwrap();

        assert_eq!(connector.reconnect_policy(&target), Some(ReconnectPolicy::new(3)));
        assert!(connector.is_present(&target, &[DeviceInfo::serial("/dev/ttyACM0", None, None)]));
        assert!(!connector.is_present(&target, &[DeviceInfo::serial("/dev/ttyACM1", None, None)]));
        assert!(!connector.is_present(&target, &[DeviceInfo::native(0, true)]));
    }
}
