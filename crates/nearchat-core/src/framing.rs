//! Length-prefixed framing for the socket channel
//!
//! The socket channel is a raw byte stream: one readiness cycle may carry part of
//! a message or several messages at once. Every message is therefore sent as a
//! 4-byte big-endian length followed by its UTF-8 bytes, and the receiver
//! reassembles frames across reads.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::errors::FramingError;

/// Size of the length prefix
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Frame a message for the socket channel
pub fn encode_frame(payload: &[u8], max_frame_size: usize) -> Result<Bytes, FramingError> {
    if payload.len() > max_frame_size {
        return Err(FramingError::FrameTooLarge {
            size: payload.len(),
            max: max_frame_size,
        });
    }

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_LEN + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(payload);
    Ok(buf.freeze())
}

// ----------------------------------------------------------------------------
// Frame Decoder
// ----------------------------------------------------------------------------

/// Incremental decoder reassembling frames from arbitrary byte chunks
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    max_frame_size: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_frame_size,
        }
    }

    /// Append bytes received from the stream
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes held back waiting for the rest of a frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Take the next complete frame, if one has fully arrived
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, FramingError> {
        if self.buffer.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }

        let mut prefix = [0u8; LENGTH_PREFIX_LEN];
        prefix.copy_from_slice(&self.buffer[..LENGTH_PREFIX_LEN]);
        let len = u32::from_be_bytes(prefix) as usize;
        if len > self.max_frame_size {
            return Err(FramingError::FrameTooLarge {
                size: len,
                max: self.max_frame_size,
            });
        }

        if self.buffer.len() < LENGTH_PREFIX_LEN + len {
            return Ok(None);
        }

        self.buffer.advance(LENGTH_PREFIX_LEN);
        Ok(Some(self.buffer.split_to(len).freeze()))
    }

    /// Drain every complete frame currently buffered
    pub fn drain_frames(&mut self) -> Result<Vec<Bytes>, FramingError> {
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }
}
