//! Ordered outbound write path
//!
//! Every write a consumer makes goes through a [`WriteQueue`]. While the
//! queue is paused (during the reset handshake) buffers pile up; once it is
//! resumed they are handed to the link in exactly the order they arrived.
//!
//! The queue has no depth limit. A controller that never completes its
//! reset handshake will let a writing consumer grow it without bound.

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use log::trace;
use std::collections::VecDeque;

/// Anything that can take an outbound packet
#[async_trait]
pub trait PacketSink: Send {
    async fn send(&mut self, packet: &[u8]) -> Result<()>;
}

/// FIFO of outbound buffers with pause/resume gating
#[derive(Debug, Default)]
pub struct WriteQueue {
    pending: VecDeque<Bytes>,
    paused: bool,
}

impl WriteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a buffer; nothing is sent until the next flush
    pub fn push(&mut self, buffer: Bytes) {
        self.pending.push_back(buffer);
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// Un-pause and drain everything queued so far, in order
    pub async fn resume<S>(&mut self, sink: &mut S) -> Result<()>
    where
        S: PacketSink + ?Sized,
    {
        self.paused = false;
        self.flush(sink).await
    }

    /// Send queued buffers in order unless paused.
    ///
    /// A buffer the sink rejects is dropped and its error returned; the
    /// buffers behind it stay queued for the next flush.
    pub async fn flush<S>(&mut self, sink: &mut S) -> Result<()>
    where
        S: PacketSink + ?Sized,
    {
        while !self.paused {
            let Some(buffer) = self.pending.pop_front() else {
                break;
            };
            trace!("flushing {} byte write, {} behind it", buffer.len(), self.pending.len());
            sink.send(&buffer).await?;
        }
        Ok(())
    }

    /// Drop everything queued and un-pause
    pub fn clear(&mut self) {
        if !self.pending.is_empty() {
            trace!("discarding {} queued writes", self.pending.len());
        }
        self.pending.clear();
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
