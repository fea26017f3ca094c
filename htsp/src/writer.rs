//! ## WRITER
//!
//! Serializes queued messages and drains them to the socket under write
//! readiness. A message is never partially interleaved with another: the
//! writer only pulls the next message off the queue once the previous one's
//! bytes have been fully written.

use std::io::{self, ErrorKind, Write};
use std::sync::Arc;

use crate::codec;
use crate::dispatcher::SendQueue;
use crate::error::HtspError;

pub struct Writer {
    queue: Arc<SendQueue>,
    pending: Vec<u8>,
    pending_offset: usize,
}

impl Writer {
    pub fn new(queue: Arc<SendQueue>) -> Self {
        Self { queue, pending: Vec::new(), pending_offset: 0 }
    }

    /// True iff there is anything left to write: bytes from a partially
    /// written message, or another message still sitting in the queue.
    pub fn has_pending_data(&self) -> bool {
        self.pending_offset < self.pending.len() || !self.queue.is_empty()
    }

    /// Writes as many bytes as the socket will accept, FIFO, never skipping
    /// ahead into the next message on a short write.
    pub fn drain_to<W: Write>(&mut self, stream: &mut W) -> Result<(), HtspError> {
        loop {
            if self.pending_offset >= self.pending.len() {
                match self.queue.pop() {
                    Some(msg) => {
                        self.pending = codec::encode_message(&msg);
                        self.pending_offset = 0;
                    }
                    None => return Ok(()),
                }
            }

            match stream.write(&self.pending[self.pending_offset..]) {
                Ok(0) => return Err(HtspError::Io(io::Error::new(ErrorKind::WriteZero, "write returned 0 bytes"))),
                Ok(n) => self.pending_offset += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(HtspError::Io(e)),
            }

            if self.pending_offset >= self.pending.len() {
                self.pending.clear();
                self.pending_offset = 0;
            }
        }
    }
}
