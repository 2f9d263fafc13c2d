//! Bluetooth Low Energy engines for nearchat
//!
//! One device hosts a chat by publishing the chat service and advertising it;
//! another scans, connects and runs a two-phase handshake before messages flow
//! over an L2CAP socket channel. Reactions travel over GATT attributes.
//!
//! ## Architecture
//!
//! - [`radio`] - capability traits the engines drive, and the events radios report
//! - [`host`] - peripheral role: publish, advertise, accept one socket channel
//! - [`scanner`] - central role: discovery table and connect requests
//! - [`connection`] - per-peer handshake and the connected session
//! - [`handshake`] - barrier tracking outstanding handshake operations
//! - [`stream`] - framed message transport over a socket channel
//! - [`pump`] - adapts async byte streams to the engines' channel surface
//! - [`sim`] - in-process radio for tests and demos
//! - `bluez` - Linux radio backend (feature `bluez`)
//!
//! Every engine is a single tokio task that owns its state and handles one
//! command or radio event at a time. Handles are cheap to clone and publish
//! state through `watch` channels and messages through `broadcast` channels.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use nearchat_ble::sim::SimAir;
//! use nearchat_ble::{HostEngine, ScannerEngine};
//! use nearchat_core::{ChatConfig, HostState, ScannerState};
//!
//! # async fn example() -> nearchat_core::Result<()> {
//! let air = SimAir::new();
//! let (peripheral, peripheral_events) = air.peripheral();
//! let (central, central_events) = air.central();
//!
//! let config = ChatConfig::default().with_chat_name("Lunch");
//! let host = HostEngine::spawn(peripheral, peripheral_events, config.clone());
//! host.start_broadcast()?;
//! host.wait_for_state(|s| *s == HostState::Broadcasting).await?;
//!
//! let scanner = ScannerEngine::spawn(central, central_events, config);
//! scanner.wait_for_state(|s| *s == ScannerState::Ready).await?;
//! scanner.start_scan()?;
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod handshake;
pub mod host;
pub mod pump;
pub mod radio;
pub mod scanner;
pub mod sim;
pub mod stream;

#[cfg(all(target_os = "linux", feature = "bluez"))]
pub mod bluez;

// Public API exports
pub use connection::{ConnectionEngine, ConnectionHandle};
pub use host::{HostEngine, HostHandle};
pub use pump::PumpedChannel;
pub use radio::{
    ByteChannel, CentralEvent, CentralRadio, GattClient, PeerEvent, PeerLink, PeripheralEvent,
    PeripheralRadio,
};
pub use scanner::{ScannerEngine, ScannerHandle};
pub use stream::StreamTransport;
