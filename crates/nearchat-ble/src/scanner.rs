//! Scanner engine (central role)
//!
//! Scans for the chat service, keeps the table of discovered hosts and turns a
//! `connect` request into a [`ConnectionEngine`] bound to the chosen host. At
//! most one connection attempt is tracked; a newer request supersedes it.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use nearchat_core::{
    ChatConfig, ChatError, ConnectError, DiscoveredHost, Discovery, PeerIdentity, RadioError,
    RadioPower, Result, ScannerState, Timestamp, CHAT_SERVICE_UUID,
};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::connection::{ConnectionEngine, ConnectionHandle};
use crate::radio::{AdvertisementObservation, CentralEvent, CentralRadio, PeerLink};

type ConnectReply = oneshot::Sender<std::result::Result<ConnectionHandle, ConnectError>>;

// ----------------------------------------------------------------------------
// Discovery Table
// ----------------------------------------------------------------------------

/// Record one advertisement in the host table, keyed by identity
///
/// A name carried by the advertisement replaces any earlier one; an
/// advertisement without a name keeps the known name.
pub fn record_observation(
    hosts: &mut HashMap<PeerIdentity, DiscoveredHost>,
    observation: AdvertisementObservation,
    now: Timestamp,
) -> Discovery {
    match hosts.entry(observation.peer) {
        Entry::Occupied(entry) => {
            let host = entry.into_mut();
            if observation.local_name.is_some() {
                host.name = observation.local_name;
            }
            host.last_seen = now;
            host.rssi = observation.rssi.or(host.rssi);
            Discovery::Rediscovered(host.clone())
        }
        Entry::Vacant(entry) => {
            let host = entry.insert(DiscoveredHost {
                name: observation.local_name,
                identity: observation.peer,
                last_seen: now,
                rssi: observation.rssi,
            });
            Discovery::Discovered(host.clone())
        }
    }
}

// ----------------------------------------------------------------------------
// Commands and Handle
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub enum ScannerCommand {
    StartScan,
    StopScan,
    Connect {
        identity: PeerIdentity,
        reply: ConnectReply,
    },
    DiscoveredHosts(oneshot::Sender<Vec<DiscoveredHost>>),
    Shutdown,
}

/// Cloneable front end of a running scanner engine
#[derive(Debug, Clone)]
pub struct ScannerHandle {
    commands: mpsc::UnboundedSender<ScannerCommand>,
    state: watch::Receiver<ScannerState>,
    discoveries: broadcast::Sender<Discovery>,
}

impl ScannerHandle {
    fn send(&self, command: ScannerCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| ChatError::channel_error("scanner engine has stopped"))
    }

    pub fn state(&self) -> ScannerState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ScannerState> {
        self.state.clone()
    }

    pub fn subscribe_discoveries(&self) -> broadcast::Receiver<Discovery> {
        self.discoveries.subscribe()
    }

    /// Wait until the scanner reaches a state matching `predicate`
    pub async fn wait_for_state(
        &self,
        predicate: impl FnMut(&ScannerState) -> bool,
    ) -> Result<ScannerState> {
        let mut state = self.state.clone();
        let reached = state
            .wait_for(predicate)
            .await
            .map_err(|_| ChatError::channel_error("scanner engine has stopped"))?;
        Ok(*reached)
    }

    pub fn start_scan(&self) -> Result<()> {
        self.send(ScannerCommand::StartScan)
    }

    pub fn stop_scan(&self) -> Result<()> {
        self.send(ScannerCommand::StopScan)
    }

    /// Connect to a discovered host
    ///
    /// Resolves exactly once: with a handle to the new connection engine once
    /// the link is up, or with the reason the attempt failed.
    pub async fn connect(
        &self,
        identity: PeerIdentity,
    ) -> std::result::Result<ConnectionHandle, ConnectError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(ScannerCommand::Connect { identity, reply })
            .map_err(|_| ConnectError::connection_failure("scanner engine has stopped"))?;
        response
            .await
            .map_err(|_| ConnectError::connection_failure("scanner engine has stopped"))?
    }

    /// Snapshot of the discovered-host table
    pub async fn discovered_hosts(&self) -> Result<Vec<DiscoveredHost>> {
        let (reply, response) = oneshot::channel();
        self.send(ScannerCommand::DiscoveredHosts(reply))?;
        response
            .await
            .map_err(|_| ChatError::channel_error("scanner engine has stopped"))
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send(ScannerCommand::Shutdown)
    }
}

// ----------------------------------------------------------------------------
// Scanner Engine
// ----------------------------------------------------------------------------

struct ConnectAttempt {
    peer: PeerIdentity,
    reply: ConnectReply,
}

pub struct ScannerEngine<R: CentralRadio> {
    radio: R,
    config: ChatConfig,
    events: mpsc::UnboundedReceiver<CentralEvent>,
    commands: mpsc::UnboundedReceiver<ScannerCommand>,
    state: ScannerState,
    state_tx: watch::Sender<ScannerState>,
    discoveries: broadcast::Sender<Discovery>,
    hosts: HashMap<PeerIdentity, DiscoveredHost>,
    attempt: Option<ConnectAttempt>,
    active: Option<ConnectionHandle>,
    events_closed: bool,
    running: bool,
}

impl<R: CentralRadio> ScannerEngine<R> {
    pub fn new(
        radio: R,
        events: mpsc::UnboundedReceiver<CentralEvent>,
        config: ChatConfig,
    ) -> (Self, ScannerHandle) {
        let state = ScannerState::from(radio.power());
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(state);
        let (discoveries, _) = broadcast::channel(config.event_capacity.max(1));

        let handle = ScannerHandle {
            commands: command_tx,
            state: state_rx,
            discoveries: discoveries.clone(),
        };

        let engine = Self {
            radio,
            config,
            events,
            commands,
            state,
            state_tx,
            discoveries,
            hosts: HashMap::new(),
            attempt: None,
            active: None,
            events_closed: false,
            running: true,
        };
        (engine, handle)
    }

    /// Spawn the engine on the current tokio runtime
    pub fn spawn(
        radio: R,
        events: mpsc::UnboundedReceiver<CentralEvent>,
        config: ChatConfig,
    ) -> ScannerHandle {
        let (engine, handle) = Self::new(radio, events, config);
        tokio::spawn(engine.run());
        handle
    }

    pub async fn run(mut self) {
        info!("Scanner engine starting in state {}", self.state);

        while self.running {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("All scanner handles dropped");
                        break;
                    }
                },
                event = self.events.recv(), if !self.events_closed => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        warn!("Central radio event stream closed");
                        self.events_closed = true;
                    }
                },
            }
        }

        if let Some(attempt) = self.attempt.take() {
            self.radio.cancel_connect(attempt.peer);
            let _ = attempt
                .reply
                .send(Err(ConnectError::connection_failure("scanner stopped")));
        }
        self.release_active();
        if self.state == ScannerState::Scanning {
            self.radio.stop_scan();
        }
        info!("Scanner engine stopped");
    }

    fn set_state(&mut self, state: ScannerState) {
        if self.state != state {
            info!("Scanner state {} -> {}", self.state, state);
            self.state = state;
            self.state_tx.send_replace(state);
        }
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    fn handle_command(&mut self, command: ScannerCommand) {
        match command {
            ScannerCommand::StartScan => {
                if self.state != ScannerState::Ready {
                    debug!("Ignoring start scan while {}", self.state);
                    return;
                }
                self.hosts.clear();
                self.set_state(ScannerState::Scanning);
                self.radio.start_scan(&[CHAT_SERVICE_UUID]);
            }
            ScannerCommand::StopScan => {
                if self.state != ScannerState::Scanning {
                    debug!("Ignoring stop scan while {}", self.state);
                    return;
                }
                self.radio.stop_scan();
                self.set_state(ScannerState::Ready);
            }
            ScannerCommand::Connect { identity, reply } => self.connect(identity, reply),
            ScannerCommand::DiscoveredHosts(reply) => {
                let mut hosts: Vec<_> = self.hosts.values().cloned().collect();
                hosts.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
                let _ = reply.send(hosts);
            }
            ScannerCommand::Shutdown => self.running = false,
        }
    }

    fn connect(&mut self, identity: PeerIdentity, reply: ConnectReply) {
        if !self.state.can_connect() {
            let _ = reply.send(Err(ConnectError::InvalidState { state: self.state }));
            return;
        }

        self.supersede();

        if !self.hosts.contains_key(&identity) {
            debug!("Refusing connect to undiscovered peer {}", identity);
            let _ = reply.send(Err(ConnectError::UnknownPeripheral { identity }));
            return;
        }

        info!("Connecting to {}", identity);
        self.attempt = Some(ConnectAttempt {
            peer: identity,
            reply,
        });
        self.radio.connect(identity);
    }

    /// Tear down the tracked connection attempt or connection
    fn supersede(&mut self) {
        if let Some(attempt) = self.attempt.take() {
            info!("Abandoning pending connect to {}", attempt.peer);
            self.radio.cancel_connect(attempt.peer);
            let _ = attempt.reply.send(Err(ConnectError::connection_failure(
                "superseded by a newer connect request",
            )));
        }
        self.release_active();
    }

    /// Shut down the tracked connection engine, handshaking or connected
    fn release_active(&mut self) {
        if let Some(active) = self.active.take() {
            if !active.state().is_terminal() {
                info!("Dropping connection to {}", active.peer());
                let _ = active.shutdown();
            }
        }
    }

    // ------------------------------------------------------------------------
    // Radio Events
    // ------------------------------------------------------------------------

    fn handle_event(&mut self, event: CentralEvent) {
        match event {
            CentralEvent::PowerChanged(power) => self.on_power(power),
            CentralEvent::Advertisement(observation) => {
                if self.state != ScannerState::Scanning {
                    debug!("Ignoring advertisement from {} while {}", observation.peer, self.state);
                    return;
                }
                if !observation.service_uuids.contains(&CHAT_SERVICE_UUID) {
                    return;
                }
                let discovery = record_observation(&mut self.hosts, observation, Timestamp::now());
                if let Discovery::Discovered(host) = &discovery {
                    info!("Discovered chat '{}' ({})", host.display_name(), host.identity);
                }
                let _ = self.discoveries.send(discovery);
            }
            CentralEvent::Connected(link) => self.on_connected(link),
            CentralEvent::ConnectFailed { peer, error } => {
                match self.attempt.take() {
                    Some(attempt) if attempt.peer == peer => {
                        warn!("Connect to {} failed: {}", peer, error);
                        let _ = attempt.reply.send(Err(ConnectError::Radio(error)));
                    }
                    other => {
                        debug!("Ignoring connect failure for stale peer {}", peer);
                        self.attempt = other;
                    }
                }
            }
        }
    }

    fn on_power(&mut self, power: RadioPower) {
        let next = ScannerState::from(power);
        debug!("Radio power {:?}", power);
        if next == ScannerState::Ready {
            if self.state != ScannerState::Scanning {
                self.set_state(next);
            }
            return;
        }

        if let Some(attempt) = self.attempt.take() {
            let error = match next {
                ScannerState::Unauthorised => RadioError::Unauthorized,
                _ => RadioError::PoweredOff,
            };
            let _ = attempt.reply.send(Err(ConnectError::Radio(error)));
        }
        self.set_state(next);
    }

    fn on_connected(&mut self, link: PeerLink) {
        let peer = link.peer;
        let attempt = match self.attempt.take() {
            Some(attempt) if attempt.peer == peer => attempt,
            other => {
                warn!("Dropping link to {}, no connect is pending for it", peer);
                self.attempt = other;
                let mut client = link.client;
                client.cancel_connection();
                return;
            }
        };

        info!("Link to {} up, starting handshake", peer);
        let handle = ConnectionEngine::spawn(link, self.config.clone());
        match attempt.reply.send(Ok(handle.clone())) {
            Ok(()) => self.active = Some(handle),
            Err(_) => {
                debug!("Connect caller for {} went away", peer);
                let _ = handle.shutdown();
            }
        }
    }
}
