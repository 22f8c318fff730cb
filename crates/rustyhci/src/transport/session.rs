//! Transport-independent session state machine
//!
//! A session moves `Unbound -> {Raw, User, Control} -> Closed`. Raw binding
//! acquires the link exactly like User binding, then issues HCI Reset and
//! keeps the link down (and the write queue paused) until the controller
//! answers with a Reset Command Complete.

use crate::config::{BindParams, TransportConfig};
use crate::error::{HciError, Result};
use crate::hci::{contains_reset_complete, HciCommand, PacketFramer};
use crate::transport::{
    CancelFlag, Connector, DeviceId, DeviceInfo, DriverEvent, FilterSupport, Link, Mode,
    PacketSink, ReconnectOutcome, ReconnectSupervisor, TransportDriver, WriteQueue,
};
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, trace, warn};
use std::collections::VecDeque;

/// Arguments of the last successful bind, kept for rebinding
#[derive(Debug, Clone)]
struct Binding<T> {
    dev_id: Option<DeviceId>,
    params: BindParams,
    target: T,
    mode: Mode,
}

/// One consumer's view of one controller
pub struct Session<C: Connector> {
    connector: C,
    config: TransportConfig,
    mode: Mode,
    is_up: bool,
    link: Option<C::Link>,
    binding: Option<Binding<C::Target>>,
    framer: PacketFramer,
    queue: WriteQueue,
    forwarding: bool,
    events: VecDeque<DriverEvent>,
    reconnect_pending: bool,
    cancel: CancelFlag,
    teardown_armed: bool,
}

impl<C: Connector> Session<C> {
    pub fn new(connector: C, config: TransportConfig) -> Self {
        Self {
            connector,
            config,
            mode: Mode::Unbound,
            is_up: false,
            link: None,
            binding: None,
            framer: PacketFramer::new(),
            queue: WriteQueue::new(),
            forwarding: false,
            events: VecDeque::new(),
            reconnect_pending: false,
            cancel: CancelFlag::new(),
            teardown_armed: true,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Handle that stops an in-flight reconnect cycle from another task
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Writes waiting for the link to come up
    pub fn pending_writes(&self) -> usize {
        self.queue.len()
    }

    async fn bind(&mut self, dev_id: Option<DeviceId>, params: BindParams, mode: Mode) -> Result<()> {
        let target = self
            .connector
            .resolve(dev_id.as_ref(), &params, mode, &self.config)
            .await?;
        debug!("binding {:?} in {:?} mode", target, mode);

        self.release_link().await;
        let link = self.connector.open(&target, mode).await?;
        self.attach(link, mode).await;
        self.binding = Some(Binding {
            dev_id,
            params,
            target,
            mode,
        });
        self.teardown_armed = true;
        Ok(())
    }

    async fn attach(&mut self, link: C::Link, mode: Mode) {
        self.link = Some(link);
        self.mode = mode;
        self.is_up = false;
        self.forwarding = false;
        self.framer.reset();
        self.framer.set_raw_tap(true);

        if self.handshake_required() {
            self.queue.pause();
        } else if self.queue.is_paused() {
            self.resume_queue().await;
        }
    }

    async fn release_link(&mut self) {
        if let Some(mut link) = self.link.take() {
            if let Err(e) = link.close().await {
                warn!("closing previous link failed: {}", e);
            }
        }
    }

    fn handshake_required(&self) -> bool {
        self.mode == Mode::Raw && self.connector.capabilities().reset_handshake
    }

    fn awaiting_reset(&self) -> bool {
        !self.is_up && self.handshake_required()
    }

    fn set_up(&mut self, up: bool) {
        if self.is_up != up {
            self.is_up = up;
            self.events.push_back(DriverEvent::State(up));
        }
    }

    async fn resume_queue(&mut self) {
        let result = match self.link.as_mut() {
            Some(link) => self.queue.resume(link).await,
            None => Ok(()),
        };
        if let Err(e) = result {
            self.events.push_back(DriverEvent::Error(e));
        }
    }

    async fn ingest(&mut self, chunk: &[u8]) {
        if self.framer.is_halted() && !self.awaiting_reset() {
            trace!("framing halted, dropping {} byte chunk", chunk.len());
            return;
        }
        self.framer.push(chunk);

        if self.awaiting_reset() && self.framer.raw_tap().map_or(false, contains_reset_complete) {
            self.reset_complete().await;
        }

        while let Some(result) = self.framer.next_packet() {
            match result {
                Ok(packet) if self.is_up => {
                    self.events.push_back(DriverEvent::Data(packet.into_bytes()));
                }
                Ok(packet) => trace!("dropping {} byte packet, link not up", packet.len()),
                Err(e) => self.events.push_back(DriverEvent::Error(e)),
            }
        }
    }

    async fn reset_complete(&mut self) {
        debug!("Reset complete");
        self.framer.set_raw_tap(false);
        self.framer.reset();
        self.resume_queue().await;
        self.set_up(true);
    }

    fn link_closed(&mut self) {
        self.link = None;
        if let Some(residual) = self.framer.finish() {
            debug!("link closed with unframed bytes: {}", hex::encode(&residual));
        }

        self.is_up = false;
        self.events.push_back(DriverEvent::State(false));

        let reconnects = self
            .binding
            .as_ref()
            .and_then(|binding| self.connector.reconnect_policy(&binding.target))
            .is_some();
        if reconnects && self.mode.has_link() {
            self.cancel.clear();
            self.reconnect_pending = true;
        } else {
            self.forwarding = false;
        }
    }

    async fn reconnect(&mut self) {
        let Some(binding) = self.binding.clone() else {
            return;
        };
        let Some(policy) = self.connector.reconnect_policy(&binding.target) else {
            return;
        };
        let mut supervisor = ReconnectSupervisor::new(policy, self.cancel.clone());

        loop {
            let connector = &self.connector;
            let target = &binding.target;
            let outcome = supervisor
                .run(connector, |devices| connector.is_present(target, devices))
                .await;
            match outcome {
                ReconnectOutcome::Reappeared => {}
                ReconnectOutcome::Exhausted { attempts } => {
                    debug!("{}", HciError::ReconnectExhausted { attempts });
                    return;
                }
                ReconnectOutcome::Cancelled => return,
            }

            debug!("Reconnecting to {:?}", binding.target);
            match self.rebind(&binding).await {
                Ok(()) => return,
                Err(e) => {
                    debug!("Rebind failed: {}", e);
                    if !supervisor.failed_attempt().await {
                        supervisor.outcome();
                        return;
                    }
                }
            }
        }
    }

    async fn rebind(&mut self, binding: &Binding<C::Target>) -> Result<()> {
        self.bind(binding.dev_id.clone(), binding.params.clone(), binding.mode)
            .await?;
        self.start().await?;
        self.reset().await
    }
}

#[async_trait]
impl<C: Connector> TransportDriver for Session<C> {
    async fn get_device_list(&mut self) -> Result<Vec<DeviceInfo>> {
        self.connector.list_devices().await
    }

    fn is_dev_up(&self) -> bool {
        self.link
            .as_ref()
            .and_then(|link| link.device_up())
            .unwrap_or(self.is_up)
    }

    async fn start(&mut self) -> Result<()> {
        if !self.mode.has_link() {
            return Ok(());
        }

        if self.link.is_none() {
            let binding = self.binding.clone().ok_or(HciError::NotBound)?;
            let link = self.connector.open(&binding.target, binding.mode).await?;
            self.attach(link, binding.mode).await;
        }

        self.forwarding = true;
        if !self.handshake_required() {
            self.set_up(true);
        }
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if !self.mode.has_link() {
            return Ok(());
        }

        self.cancel.cancel();
        self.teardown_armed = false;
        self.reconnect_pending = false;
        self.forwarding = false;
        self.framer.set_raw_tap(false);
        self.framer.reset();
        self.queue.clear();
        self.is_up = false;
        self.mode = Mode::Closed;

        if let Some(mut link) = self.link.take() {
            link.close().await?;
        }
        Ok(())
    }

    async fn reset(&mut self) -> Result<()> {
        if self.framer.is_halted() {
            debug!("resuming halted framer");
            self.framer.reset();
        }

        let Some(link) = self.link.as_mut() else {
            return Ok(());
        };

        let command = HciCommand::Reset.to_packet()?;
        debug!("Reset: {}", hex::encode(&command));
        link.send(&command).await
    }

    async fn bind_raw(&mut self, dev_id: Option<DeviceId>, params: BindParams) -> Result<()> {
        self.bind(dev_id, params, Mode::Raw).await?;
        if self.connector.capabilities().reset_handshake {
            self.reset().await?;
        }
        Ok(())
    }

    async fn bind_user(&mut self, dev_id: Option<DeviceId>, params: BindParams) -> Result<()> {
        self.bind(dev_id, params, Mode::User).await
    }

    async fn bind_control(&mut self) {
        self.cancel.cancel();
        self.reconnect_pending = false;
        self.forwarding = false;
        self.teardown_armed = false;
        self.release_link().await;
        self.framer.reset();
        self.queue.clear();
        self.is_up = false;
        self.mode = Mode::Control;
    }

    async fn set_filter(&mut self, filter: &[u8]) -> Result<()> {
        match self.connector.capabilities().filter {
            FilterSupport::None => Ok(()),
            FilterSupport::Kernel => match self.link.as_mut() {
                Some(link) => link.set_filter(filter),
                None => Ok(()),
            },
            FilterSupport::Command => {
                let command = HciCommand::SetEventFilter {
                    filter: filter.to_vec(),
                }
                .to_packet()?;
                self.write(&command).await
            }
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        if !self.mode.has_link() {
            return Ok(());
        }

        debug!("Write: {}", hex::encode(data));
        self.queue.push(Bytes::copy_from_slice(data));
        match self.link.as_mut() {
            Some(link) => self.queue.flush(link).await,
            None => Ok(()),
        }
    }

    async fn next_event(&mut self) -> Option<DriverEvent> {
        loop {
            if let Some(event) = self.events.pop_front() {
                return Some(event);
            }

            if self.reconnect_pending {
                self.reconnect_pending = false;
                self.reconnect().await;
                continue;
            }

            if !self.forwarding {
                return None;
            }

            let read = self.link.as_mut()?.read().await;
            match read {
                Ok(Some(chunk)) => self.ingest(&chunk).await,
                Ok(None) => self.link_closed(),
                Err(e) => {
                    warn!("link read failed: {}", e);
                    self.events.push_back(DriverEvent::Error(e));
                    self.link_closed();
                }
            }
        }
    }

    async fn shutdown(&mut self) -> Result<()> {
        if self.teardown_armed {
            self.teardown_armed = false;
            if let Err(e) = self.reset().await {
                warn!("reset during shutdown failed: {}", e);
            }
        }
        self.stop().await
    }
}
