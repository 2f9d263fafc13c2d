//! Core types for the nearchat protocol
//!
//! Identities, discovery records and the state machines of the three radio roles.

use core::fmt;
use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::ChatError;

// ----------------------------------------------------------------------------
// Peer Identity
// ----------------------------------------------------------------------------

/// Opaque, stable identifier the radio stack assigns to a remote device
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerIdentity(Uuid);

impl PeerIdentity {
    /// Wrap a platform identifier
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    /// Fresh random identity
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Identity derived from a 48-bit device address
    pub fn from_address(address: [u8; 6]) -> Self {
        let mut bytes = [0u8; 16];
        bytes[10..].copy_from_slice(&address);
        Self(Uuid::from_bytes(bytes))
    }

    /// Device address this identity was derived from, if any
    pub fn to_address(&self) -> Option<[u8; 6]> {
        let bytes = self.0.as_bytes();
        if bytes[..10].iter().any(|b| *b != 0) {
            return None;
        }
        let mut address = [0u8; 6];
        address.copy_from_slice(&bytes[10..]);
        Some(address)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_address() {
            Some(address) => write!(f, "{}", hex::encode_upper(address)),
            None => write!(f, "{}", self.0),
        }
    }
}

impl FromStr for PeerIdentity {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(uuid) = Uuid::parse_str(s) {
            return Ok(Self(uuid));
        }

        let clean = s.replace(':', "");
        let bytes = hex::decode(&clean)
            .map_err(|_| ChatError::config_error(format!("invalid peer identity: {}", s)))?;
        let address: [u8; 6] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| ChatError::config_error(format!("invalid peer identity: {}", s)))?;
        Ok(Self::from_address(address))
    }
}

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// Milliseconds since the Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    pub fn new(millis: u64) -> Self {
        Self(millis)
    }

    /// Current wall-clock time
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_millis() as u64)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }
}

// ----------------------------------------------------------------------------
// Discovery
// ----------------------------------------------------------------------------

/// A host seen advertising the chat service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredHost {
    /// Advertised chat name, if the advertisement carried one
    pub name: Option<String>,
    pub identity: PeerIdentity,
    pub last_seen: Timestamp,
    /// Signal strength of the latest observation
    pub rssi: Option<i16>,
}

impl DiscoveredHost {
    /// Name to show for this host
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.identity.to_string())
    }
}

/// Outcome of one advertisement observation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discovery {
    /// First observation of this identity since the scan started
    Discovered(DiscoveredHost),
    /// Known identity observed again, with refreshed name and timestamp
    Rediscovered(DiscoveredHost),
}

impl Discovery {
    pub fn host(&self) -> &DiscoveredHost {
        match self {
            Discovery::Discovered(host) | Discovery::Rediscovered(host) => host,
        }
    }
}

// ----------------------------------------------------------------------------
// Radio Power
// ----------------------------------------------------------------------------

/// Power and permission state reported by the radio stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RadioPower {
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

// ----------------------------------------------------------------------------
// Role State Machines
// ----------------------------------------------------------------------------

/// Host (peripheral role) state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostState {
    Off,
    Ready,
    Unauthorised,
    /// Advertising the chat; the only state in which a socket may be open
    Broadcasting,
}

impl From<RadioPower> for HostState {
    fn from(power: RadioPower) -> Self {
        match power {
            RadioPower::PoweredOn => HostState::Ready,
            RadioPower::Unauthorized => HostState::Unauthorised,
            _ => HostState::Off,
        }
    }
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HostState::Off => "off",
            HostState::Ready => "ready",
            HostState::Unauthorised => "unauthorised",
            HostState::Broadcasting => "broadcasting",
        };
        f.write_str(name)
    }
}

/// Scanner (central role) state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScannerState {
    Off,
    Ready,
    Unauthorised,
    Scanning,
}

impl ScannerState {
    /// Whether a connection attempt may be started from this state
    pub fn can_connect(&self) -> bool {
        matches!(self, ScannerState::Ready | ScannerState::Scanning)
    }
}

impl From<RadioPower> for ScannerState {
    fn from(power: RadioPower) -> Self {
        match power {
            RadioPower::PoweredOn => ScannerState::Ready,
            RadioPower::Unauthorized => ScannerState::Unauthorised,
            _ => ScannerState::Off,
        }
    }
}

impl fmt::Display for ScannerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScannerState::Off => "off",
            ScannerState::Ready => "ready",
            ScannerState::Unauthorised => "unauthorised",
            ScannerState::Scanning => "scanning",
        };
        f.write_str(name)
    }
}

/// State of one connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl ConnectionState {
    /// No transition leaves a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Error)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Error => "error",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_identity_round_trips_through_display() {
        let identity = PeerIdentity::from_address([0xAA, 0xBB, 0xCC, 0x01, 0x02, 0x03]);
        assert_eq!(identity.to_string(), "AABBCC010203");
        assert_eq!("AA:BB:CC:01:02:03".parse::<PeerIdentity>().unwrap(), identity);
    }

    #[test]
    fn test_random_identity_has_no_address() {
        let identity = PeerIdentity::random();
        assert!(identity.to_address().is_none());
        assert_eq!(identity.to_string().parse::<PeerIdentity>().unwrap(), identity);
        assert!("not-an-id".parse::<PeerIdentity>().is_err());
    }

    #[test]
    fn test_power_maps_to_role_states() {
        assert_eq!(HostState::from(RadioPower::PoweredOn), HostState::Ready);
        assert_eq!(HostState::from(RadioPower::Unauthorized), HostState::Unauthorised);
        assert_eq!(HostState::from(RadioPower::Resetting), HostState::Off);
        assert_eq!(ScannerState::from(RadioPower::PoweredOff), ScannerState::Off);
        assert!(ScannerState::Scanning.can_connect());
        assert!(!ScannerState::Unauthorised.can_connect());
    }

    #[test]
    fn test_terminal_connection_states() {
        assert!(ConnectionState::Disconnected.is_terminal());
        assert!(ConnectionState::Error.is_terminal());
        assert!(!ConnectionState::Connecting.is_terminal());
        assert!(!ConnectionState::Connected.is_terminal());
    }
}
