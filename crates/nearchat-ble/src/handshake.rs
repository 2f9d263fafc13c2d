//! Handshake barrier
//!
//! Tracks the named sub-operations a connection attempt still waits for. A phase
//! ends when the pending set empties; a failure recorded along the way is sticky,
//! so the phase then ends failed no matter how many later steps succeed.

use std::collections::HashSet;
use std::fmt;

use tracing::warn;
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Pending Operations
// ----------------------------------------------------------------------------

/// One outstanding handshake sub-operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PendingOp {
    ServiceDiscovery,
    CharacteristicDiscovery(Uuid),
    DescriptorDiscovery(Uuid),
    NotifySubscribe,
    SocketPortRead,
    SocketOpen,
}

impl fmt::Display for PendingOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PendingOp::ServiceDiscovery => write!(f, "service discovery"),
            PendingOp::CharacteristicDiscovery(service) => {
                write!(f, "characteristic discovery for {}", service)
            }
            PendingOp::DescriptorDiscovery(characteristic) => {
                write!(f, "descriptor discovery for {}", characteristic)
            }
            PendingOp::NotifySubscribe => write!(f, "notification subscribe"),
            PendingOp::SocketPortRead => write!(f, "socket port read"),
            PendingOp::SocketOpen => write!(f, "socket open"),
        }
    }
}

/// Why a sub-operation failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeFailure {
    pub op: PendingOp,
    pub reason: String,
}

impl fmt::Display for HandshakeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.op, self.reason)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Attribute discovery
    Discovery,
    /// Notification subscribe and socket open
    Connection,
}

/// Outcome of completing a sub-operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Barrier {
    Pending,
    Cleared,
    Failed(Vec<HandshakeFailure>),
}

// ----------------------------------------------------------------------------
// Handshake
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct Handshake {
    phase: Phase,
    pending: HashSet<PendingOp>,
    failures: Vec<HandshakeFailure>,
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}

impl Handshake {
    pub fn new() -> Self {
        Self {
            phase: Phase::Discovery,
            pending: HashSet::new(),
            failures: Vec::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Move on to the connection phase once discovery cleared
    pub fn enter_connection_phase(&mut self) {
        self.phase = Phase::Connection;
    }

    /// Register an issued sub-operation
    pub fn begin(&mut self, op: PendingOp) {
        if !self.pending.insert(op) {
            warn!("Handshake step {} was already pending", op);
        }
    }

    /// Mark a sub-operation finished
    ///
    /// Completions for operations that are not pending are ignored, so a
    /// cleared barrier never fires twice.
    pub fn complete(&mut self, op: PendingOp, result: Result<(), String>) -> Barrier {
        if !self.pending.remove(&op) {
            warn!("Ignoring completion of {}, which is not pending", op);
            return Barrier::Pending;
        }

        if let Err(reason) = result {
            self.failures.push(HandshakeFailure { op, reason });
        }

        if !self.pending.is_empty() {
            Barrier::Pending
        } else if self.failures.is_empty() {
            Barrier::Cleared
        } else {
            Barrier::Failed(self.failures.clone())
        }
    }

    pub fn is_pending(&self, op: PendingOp) -> bool {
        self.pending.contains(&op)
    }

    pub fn has_failed(&self) -> bool {
        !self.failures.is_empty()
    }

    /// Outstanding operations in a stable order
    pub fn pending_ops(&self) -> Vec<PendingOp> {
        let mut ops: Vec<_> = self.pending.iter().copied().collect();
        ops.sort();
        ops
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHAR_A: Uuid = Uuid::from_u128(0xA);
    const CHAR_B: Uuid = Uuid::from_u128(0xB);
    const SERVICE: Uuid = Uuid::from_u128(0x1);

    #[test]
    fn test_discovery_tree_clears_once_every_leaf_completes() {
        let mut handshake = Handshake::new();
        handshake.begin(PendingOp::ServiceDiscovery);

        handshake.begin(PendingOp::CharacteristicDiscovery(SERVICE));
        assert_eq!(
            handshake.complete(PendingOp::ServiceDiscovery, Ok(())),
            Barrier::Pending
        );

        handshake.begin(PendingOp::DescriptorDiscovery(CHAR_A));
        handshake.begin(PendingOp::DescriptorDiscovery(CHAR_B));
        assert_eq!(
            handshake.complete(PendingOp::CharacteristicDiscovery(SERVICE), Ok(())),
            Barrier::Pending
        );

        assert_eq!(
            handshake.complete(PendingOp::DescriptorDiscovery(CHAR_B), Ok(())),
            Barrier::Pending
        );
        assert_eq!(
            handshake.complete(PendingOp::DescriptorDiscovery(CHAR_A), Ok(())),
            Barrier::Cleared
        );
    }

    #[test]
    fn test_failure_is_sticky_across_later_successes() {
        let mut handshake = Handshake::new();
        handshake.begin(PendingOp::DescriptorDiscovery(CHAR_A));
        handshake.begin(PendingOp::DescriptorDiscovery(CHAR_B));

        assert_eq!(
            handshake.complete(
                PendingOp::DescriptorDiscovery(CHAR_A),
                Err("gatt error".to_string())
            ),
            Barrier::Pending
        );
        assert!(handshake.has_failed());

        match handshake.complete(PendingOp::DescriptorDiscovery(CHAR_B), Ok(())) {
            Barrier::Failed(failures) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].op, PendingOp::DescriptorDiscovery(CHAR_A));
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_stray_completion_never_refires_barrier() {
        let mut handshake = Handshake::new();
        handshake.enter_connection_phase();
        handshake.begin(PendingOp::NotifySubscribe);
        assert_eq!(
            handshake.complete(PendingOp::NotifySubscribe, Ok(())),
            Barrier::Cleared
        );
        assert_eq!(
            handshake.complete(PendingOp::NotifySubscribe, Ok(())),
            Barrier::Pending
        );
        assert_eq!(
            handshake.complete(PendingOp::SocketOpen, Ok(())),
            Barrier::Pending
        );
        assert_eq!(handshake.phase(), Phase::Connection);
    }

    #[test]
    fn test_pending_ops_listed_in_stable_order() {
        let mut handshake = Handshake::new();
        handshake.begin(PendingOp::SocketOpen);
        handshake.begin(PendingOp::NotifySubscribe);
        handshake.begin(PendingOp::SocketPortRead);
        assert_eq!(
            handshake.pending_ops(),
            vec![
                PendingOp::NotifySubscribe,
                PendingOp::SocketPortRead,
                PendingOp::SocketOpen
            ]
        );
        assert!(handshake.is_pending(PendingOp::SocketOpen));
    }
}
