//! nearchat Core Protocol
//!
//! Shared building blocks for the nearchat peer-to-peer chat, which runs over a
//! short-range radio link with no server in between:
//!
//! - [`protocol`] - the chat service descriptor: attribute UUIDs, access flags and
//!   the socket port encoding both roles agree on
//! - [`types`] - identities, discovered hosts and the role state machines
//! - [`errors`] - error taxonomy shared by the engines and the CLI
//! - [`config`] - engine configuration
//! - [`framing`] - length-prefixed message framing for the socket channel

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod config;
pub mod errors;
pub mod framing;
pub mod protocol;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use config::ChatConfig;
pub use errors::{
    AttStatus, ChatError, ConnectError, FramingError, RadioError, Result, StreamError,
};
pub use framing::{encode_frame, FrameDecoder};
pub use protocol::{
    Advertisement, CharacteristicSpec, Psm, ServiceDefinition, ServiceDescriptor, CHAT_SERVICE,
    CHAT_SERVICE_UUID, REACTIONS_INBOX_UUID, REACTIONS_OUTBOX_UUID, SOCKET_PORT_UUID,
};
pub use types::{
    ConnectionState, DiscoveredHost, Discovery, HostState, PeerIdentity, RadioPower, ScannerState,
    Timestamp,
};
