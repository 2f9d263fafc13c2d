//! Byte channel pump
//!
//! Adapts an async byte stream (an L2CAP socket, an in-memory duplex pipe) to the
//! non-blocking [`ByteChannel`] surface the engines drive. A reader task keeps a
//! bounded inbound buffer topped up and a writer task drains a bounded outbound
//! buffer; both report readiness changes as [`StreamEvent`]s on the owning
//! engine's event channel.

use std::io;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::radio::{ByteChannel, ChannelId, StreamEvent, StreamEventKind};

// ----------------------------------------------------------------------------
// Shared Buffers
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Buffers {
    inbound: BytesMut,
    outbound: BytesMut,
    closed: bool,
    failed: bool,
    /// The engine saw a full outbound buffer and waits for `SpaceAvailable`
    write_blocked: bool,
}

#[derive(Debug)]
struct Shared {
    buffers: Mutex<Buffers>,
    /// Signalled when the engine consumed inbound bytes
    drained: Notify,
    /// Signalled when the engine queued outbound bytes
    queued: Notify,
    capacity: usize,
}

// ----------------------------------------------------------------------------
// Pumped Channel
// ----------------------------------------------------------------------------

/// [`ByteChannel`] backed by two pump tasks over an async stream
pub struct PumpedChannel {
    id: ChannelId,
    shared: Arc<Shared>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl PumpedChannel {
    /// Start pumping `io`, reporting readiness on `events`
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<S, E>(io: S, events: mpsc::UnboundedSender<E>, capacity: usize) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
        E: From<StreamEvent> + Send + 'static,
    {
        let id = ChannelId::next();
        let shared = Arc::new(Shared {
            buffers: Mutex::new(Buffers::default()),
            drained: Notify::new(),
            queued: Notify::new(),
            capacity: capacity.max(1),
        });

        let (read_half, write_half) = tokio::io::split(io);
        let reader = tokio::spawn(read_loop(id, read_half, shared.clone(), events.clone()));
        let writer = tokio::spawn(write_loop(id, write_half, shared.clone(), events));

        debug!("Pumping byte channel {} with {} byte buffers", id, capacity);
        Self {
            id,
            shared,
            reader,
            writer,
        }
    }
}

fn emit<E: From<StreamEvent>>(
    events: &mpsc::UnboundedSender<E>,
    channel: ChannelId,
    kind: StreamEventKind,
) -> bool {
    events.send(StreamEvent { channel, kind }.into()).is_ok()
}

async fn read_loop<S, E>(
    id: ChannelId,
    mut reader: ReadHalf<S>,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<E>,
) where
    S: AsyncRead,
    E: From<StreamEvent>,
{
    let mut chunk = vec![0u8; shared.capacity];
    emit(&events, id, StreamEventKind::OpenCompleted);

    loop {
        let room = {
            let buffers = shared.buffers.lock();
            shared.capacity.saturating_sub(buffers.inbound.len())
        };
        if room == 0 {
            shared.drained.notified().await;
            continue;
        }

        match reader.read(&mut chunk[..room]).await {
            Ok(0) => {
                debug!("Byte channel {} reached end of stream", id);
                emit(&events, id, StreamEventKind::EndEncountered);
                break;
            }
            Ok(n) => {
                shared.buffers.lock().inbound.extend_from_slice(&chunk[..n]);
                trace!("Byte channel {} buffered {} inbound bytes", id, n);
                if !emit(&events, id, StreamEventKind::BytesAvailable) {
                    break;
                }
            }
            Err(e) => {
                shared.buffers.lock().failed = true;
                emit(&events, id, StreamEventKind::ErrorOccurred(e.to_string()));
                break;
            }
        }
    }
}

async fn write_loop<S, E>(
    id: ChannelId,
    mut writer: WriteHalf<S>,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<E>,
) where
    S: AsyncWrite,
    E: From<StreamEvent>,
{
    loop {
        let chunk = {
            let mut buffers = shared.buffers.lock();
            if buffers.outbound.is_empty() {
                None
            } else {
                Some(buffers.outbound.split().freeze())
            }
        };

        let Some(chunk) = chunk else {
            shared.queued.notified().await;
            continue;
        };

        let result = match writer.write_all(&chunk).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            shared.buffers.lock().failed = true;
            emit(&events, id, StreamEventKind::ErrorOccurred(e.to_string()));
            break;
        }
        trace!("Byte channel {} sent {} outbound bytes", id, chunk.len());

        let unblocked = {
            let mut buffers = shared.buffers.lock();
            let unblocked = buffers.write_blocked && buffers.outbound.len() < shared.capacity;
            if unblocked {
                buffers.write_blocked = false;
            }
            unblocked
        };
        if unblocked && !emit(&events, id, StreamEventKind::SpaceAvailable) {
            break;
        }
    }
}

impl ByteChannel for PumpedChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut buffers = self.shared.buffers.lock();
        if buffers.closed || buffers.failed {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("byte channel {} is closed", self.id),
            ));
        }

        let room = self.shared.capacity.saturating_sub(buffers.outbound.len());
        let n = room.min(buf.len());
        buffers.outbound.extend_from_slice(&buf[..n]);
        if n < buf.len() {
            buffers.write_blocked = true;
        }
        drop(buffers);

        if n > 0 {
            self.shared.queued.notify_one();
        }
        Ok(n)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut buffers = self.shared.buffers.lock();
        let n = buf.len().min(buffers.inbound.len());
        buf[..n].copy_from_slice(&buffers.inbound[..n]);
        buffers.inbound.advance(n);
        drop(buffers);

        if n > 0 {
            self.shared.drained.notify_one();
        }
        Ok(n)
    }

    fn has_space_available(&self) -> bool {
        let mut buffers = self.shared.buffers.lock();
        let space = !buffers.closed && buffers.outbound.len() < self.shared.capacity;
        if !space {
            buffers.write_blocked = true;
        }
        space
    }

    fn has_bytes_available(&self) -> bool {
        !self.shared.buffers.lock().inbound.is_empty()
    }

    fn close(&mut self) {
        let mut buffers = self.shared.buffers.lock();
        if buffers.closed {
            return;
        }
        buffers.closed = true;
        buffers.inbound.clear();
        buffers.outbound.clear();
        drop(buffers);

        self.reader.abort();
        self.writer.abort();
        debug!("Closed byte channel {}", self.id);
    }
}

impl Drop for PumpedChannel {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}
