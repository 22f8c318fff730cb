//! H4 byte stream reassembly
//!
//! Serial and USB links deliver HCI traffic as arbitrary chunks. The framer
//! accumulates them and cuts out one packet at a time, using the leading
//! indicator byte to pick the header layout:
//!
//! - `WaitingForType`: need the indicator byte
//! - `WaitingForHeader`: indicator known, need the full header
//! - `WaitingForBody`: total length known, need the rest of the packet
//! - `Halted`: an unknown indicator was seen, nothing more is framed until
//!   [`PacketFramer::reset`]
//!
//! The accumulator only ever holds the prefix of the packet in progress, so
//! the packets produced never depend on how the stream was chunked.

use crate::error::Result;
use crate::hci::packet::{Packet, PacketType};
use bytes::{Bytes, BytesMut};
use log::{debug, trace};
use std::convert::TryFrom;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    WaitingForType,
    WaitingForHeader(PacketType),
    WaitingForBody { packet_type: PacketType, total: usize },
    Halted(u8),
}

/// Byte stream to packet reassembly state machine
#[derive(Debug)]
pub struct PacketFramer {
    buffer: BytesMut,
    state: State,
    raw_tap: bool,
}

impl Default for PacketFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketFramer {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(1024),
            state: State::WaitingForType,
            raw_tap: false,
        }
    }

    /// Expose the unparsed accumulator through [`raw_tap`](Self::raw_tap)
    pub fn set_raw_tap(&mut self, enabled: bool) {
        self.raw_tap = enabled;
    }

    pub fn has_raw_tap(&self) -> bool {
        self.raw_tap
    }

    /// The whole accumulator, verbatim, while the tap is attached
    pub fn raw_tap(&self) -> Option<&[u8]> {
        if self.raw_tap {
            Some(&self.buffer)
        } else {
            None
        }
    }

    /// Append a chunk without framing anything yet.
    ///
    /// While halted, chunks are only kept if the raw tap is attached.
    pub fn push(&mut self, chunk: &[u8]) {
        if self.is_halted() && !self.raw_tap {
            trace!("framing halted, dropping {} bytes", chunk.len());
            return;
        }
        self.buffer.extend_from_slice(chunk);
        trace!("framer accumulator: {}", hex::encode(&self.buffer));
    }

    /// Append a chunk and iterate over every packet it completes
    pub fn feed(&mut self, chunk: &[u8]) -> Packets<'_> {
        self.push(chunk);
        Packets { framer: self }
    }

    /// Cut the next complete packet off the accumulator.
    ///
    /// Returns `None` when more bytes are needed or framing is halted. An
    /// unknown indicator is reported once, then framing stays halted.
    pub fn next_packet(&mut self) -> Option<Result<Packet>> {
        loop {
            match self.state {
                State::Halted(_) => return None,
                State::WaitingForType => {
                    let indicator = *self.buffer.first()?;
                    match PacketType::try_from(indicator) {
                        Ok(packet_type) => self.state = State::WaitingForHeader(packet_type),
                        Err(e) => {
                            debug!("framing halted on indicator {:#04x}", indicator);
                            self.state = State::Halted(indicator);
                            return Some(Err(e));
                        }
                    }
                }
                State::WaitingForHeader(packet_type) => {
                    let header_len = packet_type.header_len();
                    if self.buffer.len() < header_len {
                        return None;
                    }
                    let total = header_len + packet_type.body_len(&self.buffer[..header_len]);
                    self.state = State::WaitingForBody { packet_type, total };
                }
                State::WaitingForBody { packet_type, total } => {
                    if self.buffer.len() < total {
                        return None;
                    }
                    let data = self.buffer.split_to(total).freeze();
                    self.state = State::WaitingForType;
                    return Some(Ok(Packet::new(packet_type, data)));
                }
            }
        }
    }

    /// End of stream: hand back any residual bytes if the tap is attached,
    /// then start over.
    pub fn finish(&mut self) -> Option<Bytes> {
        let residual = if self.raw_tap && !self.buffer.is_empty() {
            Some(self.buffer.split().freeze())
        } else {
            None
        };
        self.reset();
        residual
    }

    /// Drop everything buffered and forget the packet in progress
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForType;
    }

    /// Number of bytes waiting to be framed
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_halted(&self) -> bool {
        matches!(self.state, State::Halted(_))
    }
}

/// Iterator over the packets completed by one [`PacketFramer::feed`] call
pub struct Packets<'a> {
    framer: &'a mut PacketFramer,
}

impl Iterator for Packets<'_> {
    type Item = Result<Packet>;

    fn next(&mut self) -> Option<Self::Item> {
        self.framer.next_packet()
    }
}
