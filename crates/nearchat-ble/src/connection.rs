//! Connection engine (guest side of a chat)
//!
//! One engine per connection attempt. It drives the two-phase handshake against
//! the host (attribute discovery, then notification subscribe plus socket open)
//! and afterwards mirrors the host's data plane: framed messages over the socket
//! channel, reactions written to the inbox and notified from the outbox.

use std::collections::HashSet;
use std::future::pending;
use std::pin::Pin;

use nearchat_core::{
    ChatConfig, ChatError, ConnectionState, PeerIdentity, Psm, RadioError, Result, CHAT_SERVICE,
    CHAT_SERVICE_UUID, REACTIONS_INBOX_UUID, REACTIONS_OUTBOX_UUID, SOCKET_PORT_UUID,
};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::handshake::{Barrier, Handshake, HandshakeFailure, PendingOp, Phase};
use crate::radio::{
    ByteChannel, GattClient, PeerEvent, PeerLink, StreamEvent, StreamEventKind, WriteKind,
};
use crate::stream::StreamTransport;

// ----------------------------------------------------------------------------
// Commands and Handle
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionCommand {
    SubmitMessage(String),
    SubmitReaction(String),
    Disconnect,
    Shutdown,
}

/// Cloneable front end of a running connection engine
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    peer: PeerIdentity,
    commands: mpsc::UnboundedSender<ConnectionCommand>,
    state: watch::Receiver<ConnectionState>,
    messages: broadcast::Sender<String>,
    reactions: broadcast::Sender<String>,
}

impl ConnectionHandle {
    fn send(&self, command: ConnectionCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| ChatError::channel_error("connection engine has stopped"))
    }

    /// Host this connection is bound to
    pub fn peer(&self) -> PeerIdentity {
        self.peer
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn subscribe_messages(&self) -> broadcast::Receiver<String> {
        self.messages.subscribe()
    }

    pub fn subscribe_reactions(&self) -> broadcast::Receiver<String> {
        self.reactions.subscribe()
    }

    /// Wait for the handshake to settle, returning `Connected` or a terminal state
    pub async fn established(&self) -> Result<ConnectionState> {
        let mut state = self.state.clone();
        let settled = state
            .wait_for(|s| *s != ConnectionState::Connecting)
            .await
            .map_err(|_| ChatError::channel_error("connection engine has stopped"))?;
        Ok(*settled)
    }

    /// Wait until the connection reaches a terminal state
    pub async fn closed(&self) -> Result<ConnectionState> {
        let mut state = self.state.clone();
        let terminal = state
            .wait_for(|s| s.is_terminal())
            .await
            .map_err(|_| ChatError::channel_error("connection engine has stopped"))?;
        Ok(*terminal)
    }

    pub fn submit_message(&self, text: impl Into<String>) -> Result<()> {
        self.send(ConnectionCommand::SubmitMessage(text.into()))
    }

    pub fn submit_reaction(&self, text: impl Into<String>) -> Result<()> {
        self.send(ConnectionCommand::SubmitReaction(text.into()))
    }

    pub fn disconnect(&self) -> Result<()> {
        self.send(ConnectionCommand::Disconnect)
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send(ConnectionCommand::Shutdown)
    }
}

// ----------------------------------------------------------------------------
// Connection Engine
// ----------------------------------------------------------------------------

pub struct ConnectionEngine {
    peer: PeerIdentity,
    config: ChatConfig,
    client: Box<dyn GattClient>,
    events: mpsc::UnboundedReceiver<PeerEvent>,
    commands: mpsc::UnboundedReceiver<ConnectionCommand>,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    messages: broadcast::Sender<String>,
    reactions: broadcast::Sender<String>,
    handshake: Handshake,
    /// Chat characteristics the peer exposes
    discovered: HashSet<Uuid>,
    stream: Option<StreamTransport>,
    events_closed: bool,
    running: bool,
}

impl ConnectionEngine {
    /// Bind a new engine to a connected peer
    pub fn new(link: PeerLink, config: ChatConfig) -> (Self, ConnectionHandle) {
        let PeerLink {
            peer,
            client,
            events,
        } = link;
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (messages, _) = broadcast::channel(config.event_capacity.max(1));
        let (reactions, _) = broadcast::channel(config.event_capacity.max(1));

        let handle = ConnectionHandle {
            peer,
            commands: command_tx,
            state: state_rx,
            messages: messages.clone(),
            reactions: reactions.clone(),
        };

        let engine = Self {
            peer,
            config,
            client,
            events,
            commands,
            state: ConnectionState::Connecting,
            state_tx,
            messages,
            reactions,
            handshake: Handshake::new(),
            discovered: HashSet::new(),
            stream: None,
            events_closed: false,
            running: true,
        };
        (engine, handle)
    }

    /// Spawn the engine and start its handshake
    pub fn spawn(link: PeerLink, config: ChatConfig) -> ConnectionHandle {
        let (engine, handle) = Self::new(link, config);
        tokio::spawn(engine.run());
        handle
    }

    pub async fn run(mut self) {
        self.begin_handshake();

        let mut timeout: Option<Pin<Box<Sleep>>> = self
            .config
            .handshake_timeout()
            .map(|t| Box::pin(tokio::time::sleep(t)));

        while self.running {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("All handles for connection to {} dropped", self.peer);
                        break;
                    }
                },
                event = self.events.recv(), if !self.events_closed => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        self.events_closed = true;
                        self.on_disconnected(Some(RadioError::NotConnected));
                    }
                },
                _ = expire(&mut timeout), if self.state == ConnectionState::Connecting => {
                    self.on_handshake_timeout();
                }
            }
        }

        self.abandon();
        debug!("Connection engine for {} stopped", self.peer);
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state.is_terminal() || self.state == state {
            return;
        }
        info!("Connection to {} {} -> {}", self.peer, self.state, state);
        self.state = state;
        self.state_tx.send_replace(state);
    }

    // ------------------------------------------------------------------------
    // Handshake
    // ------------------------------------------------------------------------

    fn begin_handshake(&mut self) {
        info!("Discovering chat service on {}", self.peer);
        self.handshake.begin(PendingOp::ServiceDiscovery);
        self.client.discover_services(&[CHAT_SERVICE_UUID]);
    }

    fn on_services(&mut self, result: std::result::Result<Vec<Uuid>, RadioError>) {
        if let Ok(services) = &result {
            if services.contains(&CHAT_SERVICE_UUID) {
                self.handshake
                    .begin(PendingOp::CharacteristicDiscovery(CHAT_SERVICE_UUID));
                self.client.discover_characteristics(
                    CHAT_SERVICE_UUID,
                    &CHAT_SERVICE.characteristic_uuids(),
                );
            }
        }
        let barrier = self
            .handshake
            .complete(PendingOp::ServiceDiscovery, result.map(|_| ()).map_err(|e| e.to_string()));
        self.on_barrier(barrier);
    }

    fn on_characteristics(
        &mut self,
        service: Uuid,
        result: std::result::Result<Vec<Uuid>, RadioError>,
    ) {
        if let Ok(characteristics) = &result {
            for uuid in characteristics {
                if CHAT_SERVICE.characteristic(*uuid).is_none() {
                    continue;
                }
                self.discovered.insert(*uuid);
                self.handshake.begin(PendingOp::DescriptorDiscovery(*uuid));
                self.client.discover_descriptors(*uuid);
            }
        }
        let barrier = self.handshake.complete(
            PendingOp::CharacteristicDiscovery(service),
            result.map(|_| ()).map_err(|e| e.to_string()),
        );
        self.on_barrier(barrier);
    }

    fn begin_connection_phase(&mut self) {
        info!("Chat service discovered on {}, subscribing and opening socket", self.peer);
        self.handshake.enter_connection_phase();
        self.handshake.begin(PendingOp::NotifySubscribe);
        self.handshake.begin(PendingOp::SocketPortRead);
        self.client.set_notify(REACTIONS_OUTBOX_UUID, true);
        self.client.read(SOCKET_PORT_UUID);
    }

    fn on_socket_port(&mut self, result: std::result::Result<Vec<u8>, RadioError>) {
        let port = result.and_then(|value| Psm::decode(&value));
        if let Ok(port) = &port {
            debug!("Host {} serves its socket on port {}", self.peer, port);
            self.handshake.begin(PendingOp::SocketOpen);
            self.client.open_socket_channel(*port);
        }
        let barrier = self.handshake.complete(
            PendingOp::SocketPortRead,
            port.map(|_| ()).map_err(|e| e.to_string()),
        );
        self.on_barrier(barrier);
    }

    fn on_barrier(&mut self, barrier: Barrier) {
        match barrier {
            Barrier::Pending => {}
            Barrier::Failed(failures) => self.fail_handshake(failures),
            Barrier::Cleared => match self.handshake.phase() {
                Phase::Discovery => {
                    let missing: Vec<_> = [REACTIONS_OUTBOX_UUID, SOCKET_PORT_UUID]
                        .into_iter()
                        .filter(|uuid| !self.discovered.contains(uuid))
                        .map(|uuid| HandshakeFailure {
                            op: PendingOp::CharacteristicDiscovery(CHAT_SERVICE_UUID),
                            reason: format!("characteristic {} not found", uuid),
                        })
                        .collect();
                    if missing.is_empty() {
                        self.begin_connection_phase();
                    } else {
                        self.fail_handshake(missing);
                    }
                }
                Phase::Connection => {
                    if self.stream.is_none() {
                        self.fail_handshake(vec![HandshakeFailure {
                            op: PendingOp::SocketOpen,
                            reason: "no socket channel".to_string(),
                        }]);
                        return;
                    }
                    self.set_state(ConnectionState::Connected);
                    self.read_stream();
                }
            },
        }
    }

    fn fail_handshake(&mut self, failures: Vec<HandshakeFailure>) {
        for failure in &failures {
            warn!("Handshake with {}: {}", self.peer, failure);
        }
        self.close_channel();
        self.client.cancel_connection();
        self.set_state(ConnectionState::Error);
    }

    /// Drop a live or handshaking link and settle in a terminal state
    fn abandon(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        info!("Abandoning connection to {} while {}", self.peer, self.state);
        self.close_channel();
        self.client.cancel_connection();
        let end = match self.state {
            ConnectionState::Connected => ConnectionState::Disconnected,
            _ => ConnectionState::Error,
        };
        self.set_state(end);
    }

    fn on_handshake_timeout(&mut self) {
        let outstanding: Vec<String> = self
            .handshake
            .pending_ops()
            .iter()
            .map(|op| op.to_string())
            .collect();
        warn!(
            "Handshake with {} timed out waiting for: {}",
            self.peer,
            outstanding.join(", ")
        );
        self.close_channel();
        self.client.cancel_connection();
        self.set_state(ConnectionState::Error);
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    fn handle_command(&mut self, command: ConnectionCommand) {
        match command {
            ConnectionCommand::SubmitMessage(text) => {
                let Some(stream) = self.stream.as_mut() else {
                    debug!("No socket channel open, dropping message");
                    return;
                };
                if let Err(e) = stream.send_message(&text) {
                    error!("Failed to write message to {}: {}", self.peer, e);
                    self.close_channel();
                }
            }
            ConnectionCommand::SubmitReaction(text) => {
                if self.state != ConnectionState::Connected
                    || !self.discovered.contains(&REACTIONS_INBOX_UUID)
                {
                    debug!("Ignoring reaction while {}", self.state);
                    return;
                }
                self.client
                    .write(REACTIONS_INBOX_UUID, text.as_bytes(), WriteKind::WithResponse);
            }
            ConnectionCommand::Disconnect => {
                if self.state != ConnectionState::Connected {
                    debug!("Ignoring disconnect while {}", self.state);
                    return;
                }
                info!("Disconnecting from {}", self.peer);
                self.client.cancel_connection();
            }
            ConnectionCommand::Shutdown => self.running = false,
        }
    }

    // ------------------------------------------------------------------------
    // Radio Events
    // ------------------------------------------------------------------------

    fn handle_event(&mut self, event: PeerEvent) {
        if self.state.is_terminal() {
            debug!("Ignoring {:?} after connection ended", event);
            return;
        }

        match event {
            PeerEvent::ServicesDiscovered(result) => self.on_services(result),
            PeerEvent::CharacteristicsDiscovered { service, result } => {
                self.on_characteristics(service, result)
            }
            PeerEvent::DescriptorsDiscovered {
                characteristic,
                result,
            } => {
                let barrier = self.handshake.complete(
                    PendingOp::DescriptorDiscovery(characteristic),
                    result.map(|_| ()).map_err(|e| e.to_string()),
                );
                self.on_barrier(barrier);
            }
            PeerEvent::NotificationStateChanged {
                characteristic,
                result,
            } => {
                if characteristic != REACTIONS_OUTBOX_UUID {
                    debug!("Notification state changed on {}", characteristic);
                    return;
                }
                let result = match result {
                    Ok(true) => Ok(()),
                    Ok(false) => Err("outbox is not notifying".to_string()),
                    Err(e) => Err(e.to_string()),
                };
                let barrier = self.handshake.complete(PendingOp::NotifySubscribe, result);
                self.on_barrier(barrier);
            }
            PeerEvent::ValueRead {
                characteristic,
                result,
            } => {
                if characteristic == SOCKET_PORT_UUID {
                    self.on_socket_port(result);
                } else {
                    debug!("Unexpected read of {}", characteristic);
                }
            }
            PeerEvent::Notification {
                characteristic,
                value,
            } => {
                if characteristic != REACTIONS_OUTBOX_UUID {
                    debug!("Ignoring notification on {}", characteristic);
                    return;
                }
                match String::from_utf8(value) {
                    Ok(reaction) => {
                        debug!("Received reaction {:?}", reaction);
                        let _ = self.reactions.send(reaction);
                    }
                    Err(e) => warn!("Dropping reaction from {}: {}", self.peer, e),
                }
            }
            PeerEvent::WriteCompleted {
                characteristic,
                result,
            } => match result {
                Ok(()) => debug!("Write to {} acknowledged", characteristic),
                Err(e) => warn!("Write to {} failed: {}", characteristic, e),
            },
            PeerEvent::SocketChannelOpened(result) => self.on_channel_opened(result),
            PeerEvent::Stream(event) => self.on_stream_event(event),
            PeerEvent::ServicesInvalidated => match self.state {
                ConnectionState::Connected => {
                    info!("Host {} withdrew its service, disconnecting", self.peer);
                    self.client.cancel_connection();
                }
                _ => self.fail_handshake(vec![HandshakeFailure {
                    op: PendingOp::ServiceDiscovery,
                    reason: "services invalidated".to_string(),
                }]),
            },
            PeerEvent::Disconnected(reason) => self.on_disconnected(reason),
        }
    }

    fn on_channel_opened(&mut self, result: std::result::Result<Box<dyn ByteChannel>, RadioError>) {
        let handshaking = self.handshake.is_pending(PendingOp::SocketOpen);
        match result {
            Ok(mut channel) if !handshaking && self.state != ConnectionState::Connected => {
                debug!("Closing unexpected socket channel {}", channel.id());
                channel.close();
            }
            Ok(channel) => {
                self.close_channel();
                info!("Socket channel {} open to {}", channel.id(), self.peer);
                self.stream = Some(StreamTransport::new(channel, &self.config));
                if handshaking {
                    let barrier = self.handshake.complete(PendingOp::SocketOpen, Ok(()));
                    self.on_barrier(barrier);
                }
            }
            Err(e) if handshaking => {
                let barrier = self
                    .handshake
                    .complete(PendingOp::SocketOpen, Err(e.to_string()));
                self.on_barrier(barrier);
            }
            Err(e) => warn!("Socket channel to {} failed to open: {}", self.peer, e),
        }
    }

    fn on_stream_event(&mut self, event: StreamEvent) {
        let tracked = self.stream.as_ref().map(|s| s.channel_id());
        if tracked != Some(event.channel) {
            debug!("Ignoring {:?} for stale channel {}", event.kind, event.channel);
            return;
        }

        match event.kind {
            StreamEventKind::OpenCompleted => debug!("Channel {} open", event.channel),
            StreamEventKind::BytesAvailable => self.read_stream(),
            StreamEventKind::SpaceAvailable => {
                if let Some(Err(e)) = self.stream.as_mut().map(|s| s.flush()) {
                    error!("Failed to flush channel {}: {}", event.channel, e);
                    self.close_channel();
                }
            }
            StreamEventKind::EndEncountered => {
                info!("Host closed channel {}", event.channel);
                self.close_channel();
            }
            StreamEventKind::ErrorOccurred(reason) => {
                error!("Channel {} failed: {}", event.channel, reason);
                self.close_channel();
            }
        }
    }

    fn read_stream(&mut self) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        match stream.read_available() {
            Ok(messages) => {
                for message in messages {
                    let _ = self.messages.send(message);
                }
            }
            Err(e) => {
                error!("Failed to read channel {}: {}", stream.channel_id(), e);
                self.close_channel();
            }
        }
    }

    fn on_disconnected(&mut self, reason: Option<RadioError>) {
        self.close_channel();
        match (self.state, reason) {
            (ConnectionState::Connecting, reason) => {
                warn!(
                    "Lost {} during handshake: {}",
                    self.peer,
                    reason.map(|e| e.to_string()).unwrap_or_default()
                );
                self.set_state(ConnectionState::Error);
            }
            (_, Some(e)) => {
                info!("Disconnected from {}: {}", self.peer, e);
                self.set_state(ConnectionState::Disconnected);
            }
            (_, None) => self.set_state(ConnectionState::Disconnected),
        }
    }

    fn close_channel(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            debug!("Tearing down channel {}", stream.channel_id());
            stream.close();
        }
    }
}

/// Resolves when the handshake deadline passes; never without one
async fn expire(timeout: &mut Option<Pin<Box<Sleep>>>) {
    match timeout {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}
