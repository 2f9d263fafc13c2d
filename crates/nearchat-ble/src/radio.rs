//! Radio capability surface consumed by the engines
//!
//! The radio stack is split into small command traits, one handle per engine, and
//! a closed set of event enums it delivers back on the engine's mailbox. Commands
//! never block: every result arrives later as an event, which keeps protocol logic
//! independent of any platform's callback API and lets tests drive the engines
//! with scripted fakes.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use nearchat_core::{
    Advertisement, AttStatus, PeerIdentity, Psm, RadioError, RadioPower, ServiceDefinition,
};
use tokio::sync::mpsc;
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Identifiers
// ----------------------------------------------------------------------------

/// Identifies one socket channel so stale readiness events can be told apart
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(u64);

impl ChannelId {
    /// Allocate a process-unique channel id
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch{}", self.0)
    }
}

/// Identifies one inbound attribute request awaiting a response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

// ----------------------------------------------------------------------------
// Byte Channels
// ----------------------------------------------------------------------------

/// Non-blocking, half-duplex pair of byte streams opened as a socket channel
///
/// `write` and `read` never wait: they move as many bytes as currently fit or are
/// buffered. Readiness changes are reported separately as [`StreamEvent`]s.
pub trait ByteChannel: Send {
    fn id(&self) -> ChannelId;

    /// Write up to `buf.len()` bytes, returning how many were accepted
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Read up to `buf.len()` buffered bytes; `Ok(0)` means nothing to read
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn has_space_available(&self) -> bool;

    fn has_bytes_available(&self) -> bool;

    /// Close both streams and stop delivering events
    fn close(&mut self);
}

impl fmt::Debug for dyn ByteChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteChannel").field("id", &self.id()).finish()
    }
}

/// Readiness change on a socket channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEventKind {
    OpenCompleted,
    BytesAvailable,
    SpaceAvailable,
    EndEncountered,
    ErrorOccurred(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    pub channel: ChannelId,
    pub kind: StreamEventKind,
}

// ----------------------------------------------------------------------------
// Peripheral Role
// ----------------------------------------------------------------------------

/// Inbound read of a dynamically served attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRequest {
    pub id: RequestId,
    pub central: PeerIdentity,
    pub characteristic: Uuid,
    pub offset: usize,
}

/// One item of an inbound write batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttWrite {
    pub central: PeerIdentity,
    pub characteristic: Uuid,
    pub offset: usize,
    pub value: Vec<u8>,
}

/// Response to an inbound attribute request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttResponse {
    pub status: AttStatus,
    pub value: Option<Vec<u8>>,
}

impl AttResponse {
    pub fn value(value: Vec<u8>) -> Self {
        Self {
            status: AttStatus::Success,
            value: Some(value),
        }
    }

    pub fn success() -> Self {
        Self {
            status: AttStatus::Success,
            value: None,
        }
    }

    pub fn error(status: AttStatus) -> Self {
        Self {
            status,
            value: None,
        }
    }
}

/// Result of pushing a notification to subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    Sent,
    /// Transmit queue is full; retry after `ReadyToUpdateSubscribers`
    QueueFull,
}

/// Events the radio delivers to a host engine
#[derive(Debug)]
pub enum PeripheralEvent {
    PowerChanged(RadioPower),
    SocketListenerOpened(Result<Psm, RadioError>),
    ServicePublished(Result<(), RadioError>),
    AdvertisingStarted(Result<(), RadioError>),
    ReadRequest(ReadRequest),
    /// A batch of writes answered by a single response
    WriteRequests {
        request: RequestId,
        writes: Vec<AttWrite>,
    },
    /// The notification transmit queue has room again
    ReadyToUpdateSubscribers,
    SubscriptionChanged {
        central: PeerIdentity,
        characteristic: Uuid,
        subscribed: bool,
    },
    SocketChannelOpened(Result<Box<dyn ByteChannel>, RadioError>),
    Stream(StreamEvent),
}

impl From<StreamEvent> for PeripheralEvent {
    fn from(event: StreamEvent) -> Self {
        PeripheralEvent::Stream(event)
    }
}

/// Radio handle for the peripheral (host) role
pub trait PeripheralRadio: Send + 'static {
    /// Current power state, used to derive the initial host state
    fn power(&self) -> RadioPower;

    /// Ask the platform to open a socket listener and assign it a port
    fn open_socket_listener(&mut self, encrypted: bool);

    fn close_socket_listener(&mut self, port: Psm);

    fn publish(&mut self, service: ServiceDefinition);

    fn unpublish_all(&mut self);

    fn start_advertising(&mut self, advertisement: Advertisement);

    fn stop_advertising(&mut self);

    /// Answer a pending read or write request
    fn respond(&mut self, request: RequestId, response: AttResponse);

    /// Push a value to every subscriber of `characteristic`
    fn notify(&mut self, characteristic: Uuid, value: &[u8]) -> NotifyOutcome;
}

// ----------------------------------------------------------------------------
// Central Role
// ----------------------------------------------------------------------------

/// One received advertisement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisementObservation {
    pub peer: PeerIdentity,
    pub local_name: Option<String>,
    pub service_uuids: Vec<Uuid>,
    pub rssi: Option<i16>,
}

/// Dedicated radio handle for one connected peer, plus its event stream
pub struct PeerLink {
    pub peer: PeerIdentity,
    pub client: Box<dyn GattClient>,
    pub events: mpsc::UnboundedReceiver<PeerEvent>,
}

impl fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerLink").field("peer", &self.peer).finish()
    }
}

/// Events the radio delivers to a scanner engine
#[derive(Debug)]
pub enum CentralEvent {
    PowerChanged(RadioPower),
    Advertisement(AdvertisementObservation),
    Connected(PeerLink),
    ConnectFailed {
        peer: PeerIdentity,
        error: RadioError,
    },
}

/// Radio handle for the central (scanner) role
pub trait CentralRadio: Send + 'static {
    fn power(&self) -> RadioPower;

    /// Report advertisements carrying any of `services`
    fn start_scan(&mut self, services: &[Uuid]);

    fn stop_scan(&mut self);

    /// Connect to a peer; answered by `Connected` or `ConnectFailed`
    fn connect(&mut self, peer: PeerIdentity);

    /// Abandon a pending connect
    fn cancel_connect(&mut self, peer: PeerIdentity);
}

// ----------------------------------------------------------------------------
// Per-peer GATT Client
// ----------------------------------------------------------------------------

/// How a guest write is delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    WithResponse,
    WithoutResponse,
}

/// Events delivered for one connected peer
#[derive(Debug)]
pub enum PeerEvent {
    ServicesDiscovered(Result<Vec<Uuid>, RadioError>),
    CharacteristicsDiscovered {
        service: Uuid,
        result: Result<Vec<Uuid>, RadioError>,
    },
    DescriptorsDiscovered {
        characteristic: Uuid,
        result: Result<Vec<Uuid>, RadioError>,
    },
    NotificationStateChanged {
        characteristic: Uuid,
        result: Result<bool, RadioError>,
    },
    ValueRead {
        characteristic: Uuid,
        result: Result<Vec<u8>, RadioError>,
    },
    Notification {
        characteristic: Uuid,
        value: Vec<u8>,
    },
    WriteCompleted {
        characteristic: Uuid,
        result: Result<(), RadioError>,
    },
    SocketChannelOpened(Result<Box<dyn ByteChannel>, RadioError>),
    Stream(StreamEvent),
    /// The remote service definition changed under us
    ServicesInvalidated,
    Disconnected(Option<RadioError>),
}

impl From<StreamEvent> for PeerEvent {
    fn from(event: StreamEvent) -> Self {
        PeerEvent::Stream(event)
    }
}

/// GATT client bound to one connected peer
pub trait GattClient: Send + 'static {
    fn discover_services(&mut self, services: &[Uuid]);

    fn discover_characteristics(&mut self, service: Uuid, characteristics: &[Uuid]);

    fn discover_descriptors(&mut self, characteristic: Uuid);

    fn set_notify(&mut self, characteristic: Uuid, enabled: bool);

    fn read(&mut self, characteristic: Uuid);

    fn write(&mut self, characteristic: Uuid, value: &[u8], kind: WriteKind);

    fn open_socket_channel(&mut self, port: Psm);

    /// Drop the link; answered by `PeerEvent::Disconnected`
    fn cancel_connection(&mut self);
}
