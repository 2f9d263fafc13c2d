//! Stream transport over an open socket channel
//!
//! Shared by the host and connection engines once a socket channel exists. Writes
//! loop over partial writes while the channel reports space and keep whatever did
//! not fit for the next `SpaceAvailable`. Reads drain the channel through a fixed
//! buffer on every `BytesAvailable` and reassemble length-prefixed messages.

use bytes::{Buf, BytesMut};
use nearchat_core::{encode_frame, ChatConfig, FrameDecoder, StreamError};
use tracing::{debug, trace, warn};

use crate::radio::{ByteChannel, ChannelId};

// ----------------------------------------------------------------------------
// Stream Transport
// ----------------------------------------------------------------------------

/// Read/write discipline for the one socket channel an engine owns
#[derive(Debug)]
pub struct StreamTransport {
    channel: Box<dyn ByteChannel>,
    /// Bytes accepted by `write` but not yet taken by the channel
    pending: BytesMut,
    decoder: FrameDecoder,
    read_buf: Vec<u8>,
    max_frame_size: usize,
}

impl StreamTransport {
    pub fn new(channel: Box<dyn ByteChannel>, config: &ChatConfig) -> Self {
        Self {
            channel,
            pending: BytesMut::new(),
            decoder: FrameDecoder::new(config.max_frame_size),
            read_buf: vec![0u8; config.read_buffer_size.max(1)],
            max_frame_size: config.max_frame_size,
        }
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel.id()
    }

    /// Bytes waiting for the channel to report space
    pub fn pending_bytes(&self) -> usize {
        self.pending.len()
    }

    /// Frame a message and write it
    pub fn send_message(&mut self, text: &str) -> Result<usize, StreamError> {
        let frame = encode_frame(text.as_bytes(), self.max_frame_size)?;
        self.write(&frame)
    }

    /// Write raw bytes, returning how many the channel accepted during this call
    ///
    /// Bytes queued behind earlier backpressure go out first, so the count can
    /// include them.
    pub fn write(&mut self, payload: &[u8]) -> Result<usize, StreamError> {
        self.pending.extend_from_slice(payload);
        self.flush()
    }

    /// Push pending bytes while the channel reports space
    pub fn flush(&mut self) -> Result<usize, StreamError> {
        let mut written = 0;
        while !self.pending.is_empty() && self.channel.has_space_available() {
            match self.channel.write(&self.pending)? {
                0 => {
                    return Err(StreamError::Stalled {
                        written,
                        remaining: self.pending.len(),
                    })
                }
                n => {
                    self.pending.advance(n);
                    written += n;
                }
            }
        }

        if !self.pending.is_empty() {
            debug!(
                "Channel {} is full, holding {} bytes until it has space",
                self.channel.id(),
                self.pending.len()
            );
        }
        Ok(written)
    }

    /// Drain every buffered byte and return the messages that completed
    pub fn read_available(&mut self) -> Result<Vec<String>, StreamError> {
        let mut total = 0;
        while self.channel.has_bytes_available() {
            let n = self.channel.read(&mut self.read_buf)?;
            if n == 0 {
                break;
            }
            self.decoder.extend(&self.read_buf[..n]);
            total += n;
        }
        trace!("Read {} bytes from channel {}", total, self.channel.id());

        let mut messages = Vec::new();
        for frame in self.decoder.drain_frames()? {
            match String::from_utf8(frame.to_vec()) {
                Ok(text) => messages.push(text),
                Err(e) => warn!(
                    "Dropping {} byte message on channel {}: {}",
                    frame.len(),
                    self.channel.id(),
                    e
                ),
            }
        }
        Ok(messages)
    }

    /// Close both halves of the channel
    pub fn close(&mut self) {
        self.pending.clear();
        self.channel.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::Arc;

    #[derive(Debug, Default)]
    struct Script {
        /// Largest chunk a single write accepts
        chunk_limit: usize,
        /// Bytes the channel will accept before reporting no space
        space: usize,
        /// Report space but accept nothing
        stall: bool,
        written: Vec<u8>,
        inbound: VecDeque<u8>,
        read_error: bool,
        closed: bool,
    }

    struct ScriptedChannel {
        id: ChannelId,
        script: Arc<Mutex<Script>>,
    }

    impl ByteChannel for ScriptedChannel {
        fn id(&self) -> ChannelId {
            self.id
        }

        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let mut s = self.script.lock();
            if s.stall {
                return Ok(0);
            }
            let n = buf.len().min(s.chunk_limit).min(s.space);
            s.written.extend_from_slice(&buf[..n]);
            s.space -= n;
            Ok(n)
        }

        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut s = self.script.lock();
            if s.read_error {
                return Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
            }
            let n = buf.len().min(s.inbound.len());
            for (slot, byte) in buf.iter_mut().zip(s.inbound.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        }

        fn has_space_available(&self) -> bool {
            let s = self.script.lock();
            s.stall || s.space > 0
        }

        fn has_bytes_available(&self) -> bool {
            let s = self.script.lock();
            s.read_error || !s.inbound.is_empty()
        }

        fn close(&mut self) {
            self.script.lock().closed = true;
        }
    }

    fn transport(script: Script, read_buffer_size: usize) -> (StreamTransport, Arc<Mutex<Script>>) {
        let script = Arc::new(Mutex::new(script));
        let channel = ScriptedChannel {
            id: ChannelId::next(),
            script: script.clone(),
        };
        let config = ChatConfig::new()
            .with_read_buffer_size(read_buffer_size)
            .with_max_frame_size(1024);
        (StreamTransport::new(Box::new(channel), &config), script)
    }

    fn framed(messages: &[&str]) -> Vec<u8> {
        messages
            .iter()
            .flat_map(|m| encode_frame(m.as_bytes(), 1024).unwrap().to_vec())
            .collect()
    }

    #[test]
    fn test_large_payload_drains_across_partial_writes() {
        let (mut transport, script) = transport(
            Script {
                chunk_limit: 7,
                space: usize::MAX,
                ..Default::default()
            },
            16,
        );

        let payload: Vec<u8> = (0..100u8).collect();
        assert_eq!(transport.write(&payload).unwrap(), payload.len());
        assert_eq!(transport.pending_bytes(), 0);
        assert_eq!(script.lock().written, payload);
    }

    #[test]
    fn test_backpressure_holds_remainder_until_space() {
        let (mut transport, script) = transport(
            Script {
                chunk_limit: 4,
                space: 10,
                ..Default::default()
            },
            16,
        );

        assert_eq!(transport.write(&[1u8; 25]).unwrap(), 10);
        assert_eq!(transport.pending_bytes(), 15);

        script.lock().space = 100;
        assert_eq!(transport.flush().unwrap(), 15);
        assert_eq!(transport.pending_bytes(), 0);
        assert_eq!(script.lock().written.len(), 25);
    }

    #[test]
    fn test_zero_progress_write_aborts() {
        let (mut transport, _script) = transport(
            Script {
                stall: true,
                ..Default::default()
            },
            16,
        );

        match transport.write(b"hello") {
            Err(StreamError::Stalled { written, remaining }) => {
                assert_eq!(written, 0);
                assert_eq!(remaining, 5);
            }
            other => panic!("expected stall, got {:?}", other),
        }
    }

    #[test]
    fn test_reads_reassemble_merged_and_split_messages() {
        let wire = framed(&["first", "second", "third"]);
        let split_at = wire.len() - 3;
        let (mut transport, script) = transport(
            Script {
                inbound: wire[..split_at].iter().copied().collect(),
                ..Default::default()
            },
            4,
        );

        assert_eq!(transport.read_available().unwrap(), vec!["first", "second"]);

        script.lock().inbound.extend(&wire[split_at..]);
        assert_eq!(transport.read_available().unwrap(), vec!["third"]);
    }

    #[test]
    fn test_invalid_utf8_message_is_skipped() {
        let mut wire = encode_frame(&[0xff, 0xfe], 1024).unwrap().to_vec();
        wire.extend(framed(&["ok"]));
        let (mut transport, _script) = transport(
            Script {
                inbound: wire.into_iter().collect(),
                ..Default::default()
            },
            64,
        );

        assert_eq!(transport.read_available().unwrap(), vec!["ok"]);
    }

    #[test]
    fn test_read_error_and_oversized_frame_are_stream_errors() {
        let (mut transport, script) = transport(
            Script {
                read_error: true,
                ..Default::default()
            },
            64,
        );
        assert!(matches!(transport.read_available(), Err(StreamError::Io(_))));

        {
            let mut s = script.lock();
            s.read_error = false;
            s.inbound.extend(4096u32.to_be_bytes());
        }
        assert!(matches!(
            transport.read_available(),
            Err(StreamError::Framing(_))
        ));

        transport.close();
        assert!(script.lock().closed);
    }
}
