//! ## READER
//!
//! Drains bytes from the socket into a growable buffer and emits complete
//! messages as soon as a full frame is available. EOF before a frame
//! completes is a framing failure (the peer cannot legally close mid-frame).

use std::io::{self, ErrorKind, Read};

use crate::codec;
use crate::error::HtspError;
use crate::message::Message;

pub struct Reader {
    buffer: Vec<u8>,
}

impl Default for Reader {
    fn default() -> Self {
        Self::new()
    }
}

impl Reader {
    pub fn new() -> Self {
        Self { buffer: Vec::with_capacity(4096) }
    }

    /// Reads from `stream` until it would block or reports EOF, then frames
    /// as many complete messages out of the accumulated buffer as possible.
    ///
    /// Returns the messages decoded this call. `Ok(messages)` with `messages`
    /// possibly empty means "keep going"; `Err` means the connection is
    /// dead and the engine must move to FAILED.
    pub fn fill_from<R: Read>(&mut self, stream: &mut R) -> Result<Vec<Message>, HtspError> {
        let mut chunk = [0u8; 8192];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => {
                    if self.buffer.is_empty() {
                        return Err(HtspError::Io(io::Error::new(ErrorKind::UnexpectedEof, "peer closed connection")));
                    }
                    return Err(HtspError::Malformed("peer closed mid-frame".into()));
                }
                Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(HtspError::Io(e)),
            }
        }
        self.frame_available()
    }

    fn frame_available(&mut self) -> Result<Vec<Message>, HtspError> {
        let mut messages = Vec::new();
        loop {
            if self.buffer.len() < 4 {
                break;
            }
            let length = u32::from_be_bytes(self.buffer[0..4].try_into().unwrap()) as usize;
            if self.buffer.len() < 4 + length {
                break;
            }
            let body = &self.buffer[4..4 + length];
            let message = codec::decode_message(body)?;
            messages.push(message);
            self.buffer.drain(0..4 + length);
        }
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    struct ChunkedStream {
        chunks: std::collections::VecDeque<Vec<u8>>,
    }

    impl Read for ChunkedStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.chunks.pop_front() {
                Some(chunk) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                None => Err(io::Error::new(ErrorKind::WouldBlock, "no more data")),
            }
        }
    }

    #[test]
    fn frames_a_complete_message_delivered_in_one_read() {
        let frame = codec::encode_message(&Message::request("hello"));
        let mut stream = ChunkedStream { chunks: vec![frame].into() };
        let mut reader = Reader::new();
        let messages = reader.fill_from(&mut stream).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].method().as_deref(), Some("hello"));
    }

    #[test]
    fn frames_a_message_split_across_many_short_reads() {
        let frame = codec::encode_message(&Message::request("authenticate"));
        let mut chunks = std::collections::VecDeque::new();
        for byte in frame {
            chunks.push_back(vec![byte]);
        }
        let mut stream = ChunkedStream { chunks };
        let mut reader = Reader::new();

        let mut messages = Vec::new();
        loop {
            match reader.fill_from(&mut stream) {
                Ok(mut m) => {
                    let done = m.is_empty();
                    messages.append(&mut m);
                    if done {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].method().as_deref(), Some("authenticate"));
    }

    #[test]
    fn eof_before_any_bytes_is_io_error() {
        let mut stream = ChunkedStream { chunks: std::collections::VecDeque::new() };
        // Simulate EOF rather than WouldBlock for this case.
        struct Eof;
        impl Read for Eof {
            fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                Ok(0)
            }
        }
        let mut eof = Eof;
        let mut reader = Reader::new();
        let err = reader.fill_from(&mut eof).unwrap_err();
        assert!(matches!(err, HtspError::Io(_)));
        // silence unused warning for the WouldBlock-only stream built above
        let _ = stream.chunks.pop_front();
    }

    #[test]
    fn eof_mid_frame_is_malformed() {
        let frame = codec::encode_message(&Message::request("x"));
        struct PartialThenEof(Option<Vec<u8>>);
        impl Read for PartialThenEof {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                match self.0.take() {
                    Some(chunk) => {
                        buf[..chunk.len()].copy_from_slice(&chunk);
                        Ok(chunk.len())
                    }
                    None => Ok(0),
                }
            }
        }
        let mut stream = PartialThenEof(Some(frame[..frame.len() - 1].to_vec()));
        let mut reader = Reader::new();
        let err = reader.fill_from(&mut stream).unwrap_err();
        assert!(matches!(err, HtspError::Malformed(_)));
    }
}
