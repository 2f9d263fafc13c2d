//! Host engine (peripheral role)
//!
//! Advertises the chat service, answers attribute reads and writes, pushes the
//! host's reactions to subscribers and owns the single socket channel a guest
//! opens. The engine runs as one tokio task; [`HostHandle`] enqueues commands
//! and exposes the state, message and reaction observables.

use nearchat_core::{
    Advertisement, AttStatus, ChatConfig, ChatError, HostState, Psm, RadioPower, Result,
    ServiceDefinition, REACTIONS_INBOX_UUID, REACTIONS_OUTBOX_UUID,
};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::radio::{
    AttResponse, AttWrite, ByteChannel, NotifyOutcome, PeripheralEvent, PeripheralRadio,
    ReadRequest, StreamEvent, StreamEventKind,
};
use crate::stream::StreamTransport;

// ----------------------------------------------------------------------------
// Reaction Outbox
// ----------------------------------------------------------------------------

/// Current outbox value plus the single slot awaiting transmit-queue room
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReactionOutbox {
    current: Vec<u8>,
    pending: Option<Vec<u8>>,
}

impl ReactionOutbox {
    pub fn current(&self) -> &[u8] {
        &self.current
    }

    /// Store a new value as the one served to reads
    pub fn set(&mut self, value: &str) -> Vec<u8> {
        self.current = value.as_bytes().to_vec();
        self.current.clone()
    }

    /// Whether a value is waiting for the transmit queue
    pub fn is_deferred(&self) -> bool {
        self.pending.is_some()
    }

    /// Park a value until the transmit queue has room, replacing any older one
    pub fn defer(&mut self, value: Vec<u8>) {
        if self.pending.replace(value).is_some() {
            debug!("Coalesced a deferred reaction with a newer one");
        }
    }

    pub fn take_pending(&mut self) -> Option<Vec<u8>> {
        self.pending.take()
    }

    /// Serve a read of the outbox at `offset`
    pub fn read_at(&self, offset: usize) -> std::result::Result<Vec<u8>, AttStatus> {
        if offset >= self.current.len() {
            return Err(AttStatus::InvalidOffset);
        }
        Ok(self.current[offset..].to_vec())
    }
}

/// Answer an inbound attribute read
pub fn answer_read(outbox: &ReactionOutbox, characteristic: Uuid, offset: usize) -> AttResponse {
    if characteristic != REACTIONS_OUTBOX_UUID {
        return AttResponse::error(AttStatus::ReadNotPermitted);
    }
    match outbox.read_at(offset) {
        Ok(value) => AttResponse::value(value),
        Err(status) => AttResponse::error(status),
    }
}

/// Validate a write batch as a unit and decode its reactions in order
///
/// The whole batch is rejected if any item targets another attribute or is not
/// valid UTF-8.
pub fn decode_reaction_batch(writes: &[AttWrite]) -> std::result::Result<Vec<String>, AttStatus> {
    let mut reactions = Vec::with_capacity(writes.len());
    for write in writes {
        if write.characteristic != REACTIONS_INBOX_UUID {
            return Err(AttStatus::WriteNotPermitted);
        }
        let text = std::str::from_utf8(&write.value).map_err(|_| AttStatus::UnlikelyError)?;
        reactions.push(text.to_string());
    }
    Ok(reactions)
}

// ----------------------------------------------------------------------------
// Commands and Handle
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCommand {
    StartBroadcast,
    StopBroadcast,
    SubmitMessage(String),
    SubmitReaction(String),
    Shutdown,
}

/// Cloneable front end of a running host engine
#[derive(Debug, Clone)]
pub struct HostHandle {
    commands: mpsc::UnboundedSender<HostCommand>,
    state: watch::Receiver<HostState>,
    messages: broadcast::Sender<String>,
    reactions: broadcast::Sender<String>,
}

impl HostHandle {
    fn send(&self, command: HostCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| ChatError::channel_error("host engine has stopped"))
    }

    pub fn state(&self) -> HostState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<HostState> {
        self.state.clone()
    }

    pub fn subscribe_messages(&self) -> broadcast::Receiver<String> {
        self.messages.subscribe()
    }

    pub fn subscribe_reactions(&self) -> broadcast::Receiver<String> {
        self.reactions.subscribe()
    }

    /// Wait until the host reaches a state matching `predicate`
    pub async fn wait_for_state(
        &self,
        predicate: impl FnMut(&HostState) -> bool,
    ) -> Result<HostState> {
        let mut state = self.state.clone();
        let reached = state
            .wait_for(predicate)
            .await
            .map_err(|_| ChatError::channel_error("host engine has stopped"))?;
        Ok(*reached)
    }

    pub fn start_broadcast(&self) -> Result<()> {
        self.send(HostCommand::StartBroadcast)
    }

    pub fn stop_broadcast(&self) -> Result<()> {
        self.send(HostCommand::StopBroadcast)
    }

    pub fn submit_message(&self, text: impl Into<String>) -> Result<()> {
        self.send(HostCommand::SubmitMessage(text.into()))
    }

    pub fn submit_reaction(&self, text: impl Into<String>) -> Result<()> {
        self.send(HostCommand::SubmitReaction(text.into()))
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send(HostCommand::Shutdown)
    }
}

// ----------------------------------------------------------------------------
// Host Engine
// ----------------------------------------------------------------------------

pub struct HostEngine<R: PeripheralRadio> {
    radio: R,
    config: ChatConfig,
    events: mpsc::UnboundedReceiver<PeripheralEvent>,
    commands: mpsc::UnboundedReceiver<HostCommand>,
    state: HostState,
    state_tx: watch::Sender<HostState>,
    messages: broadcast::Sender<String>,
    reactions: broadcast::Sender<String>,
    listener: Option<Psm>,
    /// Publish requested in the current broadcast cycle
    published: bool,
    /// Advertising requested in the current broadcast cycle
    advertising: bool,
    outbox: ReactionOutbox,
    stream: Option<StreamTransport>,
    events_closed: bool,
    running: bool,
}

impl<R: PeripheralRadio> HostEngine<R> {
    /// Build an engine around an injected radio and its event stream
    pub fn new(
        radio: R,
        events: mpsc::UnboundedReceiver<PeripheralEvent>,
        config: ChatConfig,
    ) -> (Self, HostHandle) {
        let state = HostState::from(radio.power());
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(state);
        let (messages, _) = broadcast::channel(config.event_capacity.max(1));
        let (reactions, _) = broadcast::channel(config.event_capacity.max(1));

        let handle = HostHandle {
            commands: command_tx,
            state: state_rx,
            messages: messages.clone(),
            reactions: reactions.clone(),
        };

        let engine = Self {
            radio,
            config,
            events,
            commands,
            state,
            state_tx,
            messages,
            reactions,
            listener: None,
            published: false,
            advertising: false,
            outbox: ReactionOutbox::default(),
            stream: None,
            events_closed: false,
            running: true,
        };
        (engine, handle)
    }

    /// Spawn the engine on the current tokio runtime
    pub fn spawn(
        radio: R,
        events: mpsc::UnboundedReceiver<PeripheralEvent>,
        config: ChatConfig,
    ) -> HostHandle {
        let (engine, handle) = Self::new(radio, events, config);
        tokio::spawn(engine.run());
        handle
    }

    /// Main loop: one command or radio event at a time
    pub async fn run(mut self) {
        info!("Host engine starting in state {}", self.state);

        while self.running {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("All host handles dropped");
                        break;
                    }
                },
                event = self.events.recv(), if !self.events_closed => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        warn!("Peripheral radio event stream closed");
                        self.events_closed = true;
                    }
                },
            }
        }

        if self.state == HostState::Broadcasting {
            self.teardown_broadcast();
            self.set_state(HostState::Ready);
        }
        info!("Host engine stopped");
    }

    fn set_state(&mut self, state: HostState) {
        if self.state != state {
            info!("Host state {} -> {}", self.state, state);
            self.state = state;
            self.state_tx.send_replace(state);
        }
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    fn handle_command(&mut self, command: HostCommand) {
        match command {
            HostCommand::StartBroadcast => self.start_broadcast(),
            HostCommand::StopBroadcast => self.stop_broadcast(),
            HostCommand::SubmitMessage(text) => self.submit_message(&text),
            HostCommand::SubmitReaction(text) => self.submit_reaction(&text),
            HostCommand::Shutdown => self.running = false,
        }
    }

    fn start_broadcast(&mut self) {
        if self.state != HostState::Ready {
            debug!("Ignoring start broadcast while {}", self.state);
            return;
        }
        self.set_state(HostState::Broadcasting);
        self.radio.open_socket_listener(self.config.encrypted_socket);
    }

    fn stop_broadcast(&mut self) {
        if self.state != HostState::Broadcasting {
            debug!("Ignoring stop broadcast while {}", self.state);
            return;
        }
        self.teardown_broadcast();
        self.set_state(HostState::Ready);
    }

    fn submit_message(&mut self, text: &str) {
        let Some(stream) = self.stream.as_mut() else {
            debug!("No socket channel open, dropping message");
            return;
        };
        if let Err(e) = stream.send_message(text) {
            error!("Failed to write message: {}", e);
            self.close_channel();
        }
    }

    fn submit_reaction(&mut self, text: &str) {
        if self.state != HostState::Broadcasting {
            debug!("Ignoring reaction while {}", self.state);
            return;
        }

        let value = self.outbox.set(text);
        if self.outbox.is_deferred() {
            self.outbox.defer(value);
            return;
        }
        self.push_reaction(value);
    }

    fn push_reaction(&mut self, value: Vec<u8>) {
        match self.radio.notify(REACTIONS_OUTBOX_UUID, &value) {
            NotifyOutcome::Sent => debug!("Notified subscribers of {} byte reaction", value.len()),
            NotifyOutcome::QueueFull => {
                debug!("Transmit queue full, deferring reaction");
                self.outbox.defer(value);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Radio Events
    // ------------------------------------------------------------------------

    fn handle_event(&mut self, event: PeripheralEvent) {
        match event {
            PeripheralEvent::PowerChanged(power) => self.on_power(power),
            PeripheralEvent::SocketListenerOpened(result) => match result {
                Ok(port) => self.on_listener_opened(port),
                Err(e) => {
                    error!("Failed to open socket listener: {}", e);
                    self.abort_broadcast();
                }
            },
            PeripheralEvent::ServicePublished(result) => match result {
                Ok(()) => self.on_published(),
                Err(e) => {
                    error!("Failed to publish chat service: {}", e);
                    self.abort_broadcast();
                }
            },
            PeripheralEvent::AdvertisingStarted(result) => match result {
                Ok(()) if self.state == HostState::Broadcasting => {
                    info!("Advertising chat '{}'", self.config.chat_name);
                }
                Ok(()) => debug!("Advertising started after broadcast ended"),
                Err(e) => {
                    error!("Failed to start advertising: {}", e);
                    self.abort_broadcast();
                }
            },
            PeripheralEvent::ReadRequest(request) => self.on_read(request),
            PeripheralEvent::WriteRequests { request, writes } => {
                match decode_reaction_batch(&writes) {
                    Ok(reactions) => {
                        self.radio.respond(request, AttResponse::success());
                        for reaction in reactions {
                            debug!("Received reaction {:?}", reaction);
                            let _ = self.reactions.send(reaction);
                        }
                    }
                    Err(status) => {
                        warn!("Rejecting batch of {} writes: {:?}", writes.len(), status);
                        self.radio.respond(request, AttResponse::error(status));
                    }
                }
            }
            PeripheralEvent::ReadyToUpdateSubscribers => {
                if let Some(value) = self.outbox.take_pending() {
                    self.push_reaction(value);
                }
            }
            PeripheralEvent::SubscriptionChanged {
                central,
                characteristic,
                subscribed,
            } => {
                info!(
                    "Central {} {} {}",
                    central,
                    if subscribed { "subscribed to" } else { "unsubscribed from" },
                    characteristic
                );
            }
            PeripheralEvent::SocketChannelOpened(result) => match result {
                Ok(channel) => self.on_channel_opened(channel),
                Err(e) => warn!("Inbound socket channel failed to open: {}", e),
            },
            PeripheralEvent::Stream(event) => self.on_stream_event(event),
        }
    }

    fn on_power(&mut self, power: RadioPower) {
        let next = HostState::from(power);
        debug!("Radio power {:?}", power);
        match next {
            HostState::Ready if self.state == HostState::Broadcasting => {}
            HostState::Ready => self.set_state(HostState::Ready),
            _ => {
                if self.state == HostState::Broadcasting {
                    self.teardown_broadcast();
                }
                self.set_state(next);
            }
        }
    }

    fn on_listener_opened(&mut self, port: Psm) {
        if self.state != HostState::Broadcasting {
            debug!("Closing listener {} opened after broadcast ended", port);
            self.radio.close_socket_listener(port);
            return;
        }
        if let Some(current) = self.listener {
            debug!("Closing extra listener {}, already serving {}", port, current);
            self.radio.close_socket_listener(port);
            return;
        }
        info!("Socket listener open on port {}", port);
        self.listener = Some(port);
        self.published = true;
        self.radio.publish(ServiceDefinition::with_socket_port(port));
    }

    fn on_published(&mut self) {
        if self.state != HostState::Broadcasting || !self.published || self.advertising {
            debug!("Ignoring service publish outside of this broadcast cycle");
            return;
        }
        self.advertising = true;
        self.radio
            .start_advertising(Advertisement::for_chat(self.config.chat_name.clone()));
    }

    fn on_read(&mut self, request: ReadRequest) {
        let response = answer_read(&self.outbox, request.characteristic, request.offset);
        if !response.status.is_success() {
            debug!(
                "Refusing read of {} at offset {}: {:?}",
                request.characteristic, request.offset, response.status
            );
        }
        self.radio.respond(request.id, response);
    }

    fn on_channel_opened(&mut self, mut channel: Box<dyn ByteChannel>) {
        if self.state != HostState::Broadcasting {
            warn!("Closing socket channel opened while {}", self.state);
            channel.close();
            return;
        }

        self.close_channel();
        info!("Guest opened socket channel {}", channel.id());
        self.stream = Some(StreamTransport::new(channel, &self.config));
        self.read_stream();
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
                info!("Guest closed channel {}", event.channel);
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

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    fn close_channel(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            info!("Tearing down channel {}", stream.channel_id());
            stream.close();
        }
    }

    fn teardown_broadcast(&mut self) {
        if self.advertising {
            self.radio.stop_advertising();
            self.advertising = false;
        }
        if self.published {
            self.radio.unpublish_all();
            self.published = false;
        }
        if let Some(port) = self.listener.take() {
            self.radio.close_socket_listener(port);
        }
        self.close_channel();
        self.outbox = ReactionOutbox::default();
    }

    fn abort_broadcast(&mut self) {
        if self.state == HostState::Broadcasting {
            self.teardown_broadcast();
            self.set_state(HostState::Ready);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::{ChannelId, RequestId};
    use nearchat_core::{PeerIdentity, RadioError, SOCKET_PORT_UUID};
    use parking_lot::Mutex;
    use std::io;
    use std::sync::Arc;
    use tokio::sync::broadcast::error::TryRecvError;

    #[derive(Debug, Clone, PartialEq)]
    enum Op {
        OpenListener(bool),
        CloseListener(Psm),
        Publish(Option<Psm>),
        Unpublish,
        Advertise(String),
        StopAdvertising,
        Respond(RequestId, AttResponse),
        Notify(Vec<u8>),
    }

    #[derive(Default)]
    struct Recorder {
        ops: Vec<Op>,
        queue_full: bool,
    }

    struct RecordingRadio {
        power: RadioPower,
        log: Arc<Mutex<Recorder>>,
    }

    impl PeripheralRadio for RecordingRadio {
        fn power(&self) -> RadioPower {
            self.power
        }
        fn open_socket_listener(&mut self, encrypted: bool) {
            self.log.lock().ops.push(Op::OpenListener(encrypted));
        }
        fn close_socket_listener(&mut self, port: Psm) {
            self.log.lock().ops.push(Op::CloseListener(port));
        }
        fn publish(&mut self, service: ServiceDefinition) {
            self.log.lock().ops.push(Op::Publish(service.socket_port()));
        }
        fn unpublish_all(&mut self) {
            self.log.lock().ops.push(Op::Unpublish);
        }
        fn start_advertising(&mut self, advertisement: Advertisement) {
            self.log.lock().ops.push(Op::Advertise(advertisement.local_name));
        }
        fn stop_advertising(&mut self) {
            self.log.lock().ops.push(Op::StopAdvertising);
        }
        fn respond(&mut self, request: RequestId, response: AttResponse) {
            self.log.lock().ops.push(Op::Respond(request, response));
        }
        fn notify(&mut self, _characteristic: Uuid, value: &[u8]) -> NotifyOutcome {
            let mut log = self.log.lock();
            if log.queue_full {
                return NotifyOutcome::QueueFull;
            }
            log.ops.push(Op::Notify(value.to_vec()));
            NotifyOutcome::Sent
        }
    }

    struct NullChannel {
        id: ChannelId,
        closed: Arc<Mutex<bool>>,
    }

    impl ByteChannel for NullChannel {
        fn id(&self) -> ChannelId {
            self.id
        }
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }
        fn has_space_available(&self) -> bool {
            true
        }
        fn has_bytes_available(&self) -> bool {
            false
        }
        fn close(&mut self) {
            *self.closed.lock() = true;
        }
    }

    struct Fixture {
        engine: HostEngine<RecordingRadio>,
        handle: HostHandle,
        log: Arc<Mutex<Recorder>>,
        _events: mpsc::UnboundedSender<PeripheralEvent>,
    }

    fn fixture(power: RadioPower) -> Fixture {
        let log = Arc::new(Mutex::new(Recorder::default()));
        let (events_tx, events) = mpsc::unbounded_channel();
        let radio = RecordingRadio {
            power,
            log: log.clone(),
        };
        let (engine, handle) =
            HostEngine::new(radio, events, ChatConfig::new().with_chat_name("Lunch"));
        Fixture {
            engine,
            handle,
            log,
            _events: events_tx,
        }
    }

    fn broadcasting() -> Fixture {
        let mut f = fixture(RadioPower::PoweredOn);
        f.engine.handle_command(HostCommand::StartBroadcast);
        f.engine
            .handle_event(PeripheralEvent::SocketListenerOpened(Ok(Psm(0x0081))));
        f.engine.handle_event(PeripheralEvent::ServicePublished(Ok(())));
        f.engine.handle_event(PeripheralEvent::AdvertisingStarted(Ok(())));
        f.log.lock().ops.clear();
        f
    }

    fn inbox_write(value: &[u8]) -> AttWrite {
        AttWrite {
            central: PeerIdentity::random(),
            characteristic: REACTIONS_INBOX_UUID,
            offset: 0,
            value: value.to_vec(),
        }
    }

    fn last_response(log: &Arc<Mutex<Recorder>>) -> AttResponse {
        match log.lock().ops.last() {
            Some(Op::Respond(_, response)) => response.clone(),
            other => panic!("expected a response, got {:?}", other),
        }
    }

    #[test]
    fn test_initial_state_follows_radio_power() {
        assert_eq!(fixture(RadioPower::PoweredOn).handle.state(), HostState::Ready);
        assert_eq!(fixture(RadioPower::PoweredOff).handle.state(), HostState::Off);
        assert_eq!(
            fixture(RadioPower::Unauthorized).handle.state(),
            HostState::Unauthorised
        );
    }

    #[test]
    fn test_start_broadcast_opens_listener_then_publishes_then_advertises() {
        let mut f = fixture(RadioPower::PoweredOn);
        f.engine.handle_command(HostCommand::StartBroadcast);
        assert_eq!(f.handle.state(), HostState::Broadcasting);

        f.engine
            .handle_event(PeripheralEvent::SocketListenerOpened(Ok(Psm(0x0081))));
        f.engine.handle_event(PeripheralEvent::ServicePublished(Ok(())));

        assert_eq!(
            f.log.lock().ops,
            vec![
                Op::OpenListener(true),
                Op::Publish(Some(Psm(0x0081))),
                Op::Advertise("Lunch".to_string()),
            ]
        );
    }

    #[test]
    fn test_start_broadcast_while_broadcasting_is_noop() {
        let mut f = broadcasting();
        f.engine.handle_command(HostCommand::StartBroadcast);
        assert_eq!(f.handle.state(), HostState::Broadcasting);
        assert!(f.log.lock().ops.is_empty());
    }

    #[test]
    fn test_start_broadcast_requires_ready() {
        let mut f = fixture(RadioPower::PoweredOff);
        f.engine.handle_command(HostCommand::StartBroadcast);
        assert_eq!(f.handle.state(), HostState::Off);
        assert!(f.log.lock().ops.is_empty());
    }

    #[test]
    fn test_stop_broadcast_tears_everything_down() {
        let mut f = broadcasting();
        f.engine.handle_command(HostCommand::StopBroadcast);
        assert_eq!(f.handle.state(), HostState::Ready);
        assert_eq!(
            f.log.lock().ops,
            vec![Op::StopAdvertising, Op::Unpublish, Op::CloseListener(Psm(0x0081))]
        );

        f.engine.handle_command(HostCommand::StopBroadcast);
        assert_eq!(f.log.lock().ops.len(), 3);
    }

    #[test]
    fn test_failed_listener_reverts_to_ready() {
        let mut f = fixture(RadioPower::PoweredOn);
        f.engine.handle_command(HostCommand::StartBroadcast);
        f.engine.handle_event(PeripheralEvent::SocketListenerOpened(Err(
            RadioError::Platform("no psm".to_string()),
        )));
        assert_eq!(f.handle.state(), HostState::Ready);
    }

    #[test]
    fn test_write_batch_with_foreign_attribute_rejected_whole() {
        let mut f = broadcasting();
        let mut reactions = f.handle.subscribe_reactions();

        let mut stray = inbox_write(b"nope");
        stray.characteristic = SOCKET_PORT_UUID;
        f.engine.handle_event(PeripheralEvent::WriteRequests {
            request: RequestId::next(),
            writes: vec![inbox_write(b"hi"), stray, inbox_write(b"there")],
        });

        assert_eq!(
            last_response(&f.log),
            AttResponse::error(AttStatus::WriteNotPermitted)
        );
        assert!(matches!(reactions.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn test_write_batch_with_bad_utf8_rejected_whole() {
        let writes = vec![inbox_write(b"ok"), inbox_write(&[0xc3, 0x28])];
        assert_eq!(decode_reaction_batch(&writes), Err(AttStatus::UnlikelyError));
    }

    #[test]
    fn test_valid_write_batch_emits_reactions_in_order() {
        let mut f = broadcasting();
        let mut reactions = f.handle.subscribe_reactions();
        f.engine.handle_event(PeripheralEvent::WriteRequests {
            request: RequestId::next(),
            writes: vec![inbox_write("👍".as_bytes()), inbox_write(b"wave")],
        });

        assert_eq!(last_response(&f.log), AttResponse::success());
        assert_eq!(reactions.try_recv().unwrap(), "👍");
        assert_eq!(reactions.try_recv().unwrap(), "wave");
    }

    #[test]
    fn test_outbox_read_offsets() {
        let mut outbox = ReactionOutbox::default();
        outbox.set("hello");

        assert_eq!(
            answer_read(&outbox, REACTIONS_OUTBOX_UUID, 0),
            AttResponse::value(b"hello".to_vec())
        );
        assert_eq!(
            answer_read(&outbox, REACTIONS_OUTBOX_UUID, 4),
            AttResponse::value(b"o".to_vec())
        );
        assert_eq!(
            answer_read(&outbox, REACTIONS_OUTBOX_UUID, 5),
            AttResponse::error(AttStatus::InvalidOffset)
        );
        assert_eq!(
            answer_read(&outbox, REACTIONS_INBOX_UUID, 0),
            AttResponse::error(AttStatus::ReadNotPermitted)
        );
    }

    #[test]
    fn test_empty_outbox_rejects_every_offset() {
        let outbox = ReactionOutbox::default();
        assert_eq!(
            answer_read(&outbox, REACTIONS_OUTBOX_UUID, 0),
            AttResponse::error(AttStatus::InvalidOffset)
        );
    }

    #[test]
    fn test_restart_keeps_one_listener_and_publishes_once() {
        let mut f = fixture(RadioPower::PoweredOn);
        f.engine.handle_command(HostCommand::StartBroadcast);
        f.engine.handle_command(HostCommand::StopBroadcast);
        f.engine.handle_command(HostCommand::StartBroadcast);

        f.engine
            .handle_event(PeripheralEvent::SocketListenerOpened(Ok(Psm(0x0081))));
        f.engine
            .handle_event(PeripheralEvent::SocketListenerOpened(Ok(Psm(0x0083))));
        f.engine.handle_event(PeripheralEvent::ServicePublished(Ok(())));
        f.engine.handle_event(PeripheralEvent::ServicePublished(Ok(())));
        f.engine.handle_command(HostCommand::StopBroadcast);

        assert_eq!(
            f.log.lock().ops,
            vec![
                Op::OpenListener(true),
                Op::OpenListener(true),
                Op::Publish(Some(Psm(0x0081))),
                Op::CloseListener(Psm(0x0083)),
                Op::Advertise("Lunch".to_string()),
                Op::StopAdvertising,
                Op::Unpublish,
                Op::CloseListener(Psm(0x0081)),
            ]
        );
    }

    #[test]
    fn test_queue_full_coalesces_until_ready() {
        let mut f = broadcasting();
        f.log.lock().queue_full = true;

        f.engine.handle_command(HostCommand::SubmitReaction("one".into()));
        f.engine.handle_command(HostCommand::SubmitReaction("two".into()));
        f.engine.handle_command(HostCommand::SubmitReaction("three".into()));
        assert!(f.log.lock().ops.is_empty());
        assert_eq!(f.engine.outbox.current(), b"three");

        f.log.lock().queue_full = false;
        f.engine.handle_event(PeripheralEvent::ReadyToUpdateSubscribers);
        assert_eq!(f.log.lock().ops, vec![Op::Notify(b"three".to_vec())]);

        f.engine.handle_event(PeripheralEvent::ReadyToUpdateSubscribers);
        assert_eq!(f.log.lock().ops.len(), 1);
    }

    #[test]
    fn test_reaction_ignored_unless_broadcasting() {
        let mut f = fixture(RadioPower::PoweredOn);
        f.engine.handle_command(HostCommand::SubmitReaction("hi".into()));
        assert!(f.log.lock().ops.is_empty());
        assert!(f.engine.outbox.current().is_empty());
    }

    #[test]
    fn test_second_channel_replaces_first() {
        let mut f = broadcasting();
        let first_closed = Arc::new(Mutex::new(false));
        let second_closed = Arc::new(Mutex::new(false));
        let second_id = ChannelId::next();

        f.engine.handle_event(PeripheralEvent::SocketChannelOpened(Ok(Box::new(
            NullChannel {
                id: ChannelId::next(),
                closed: first_closed.clone(),
            },
        ))));
        f.engine.handle_event(PeripheralEvent::SocketChannelOpened(Ok(Box::new(
            NullChannel {
                id: second_id,
                closed: second_closed.clone(),
            },
        ))));

        assert!(*first_closed.lock());
        assert!(!*second_closed.lock());
        assert_eq!(
            f.engine.stream.as_ref().map(|s| s.channel_id()),
            Some(second_id)
        );
    }

    #[test]
    fn test_power_loss_while_broadcasting_tears_down() {
        let mut f = broadcasting();
        let closed = Arc::new(Mutex::new(false));
        f.engine.handle_event(PeripheralEvent::SocketChannelOpened(Ok(Box::new(
            NullChannel {
                id: ChannelId::next(),
                closed: closed.clone(),
            },
        ))));

        f.engine
            .handle_event(PeripheralEvent::PowerChanged(RadioPower::PoweredOff));
        assert_eq!(f.handle.state(), HostState::Off);
        assert!(*closed.lock());
        assert!(f.log.lock().ops.contains(&Op::Unpublish));

        f.engine
            .handle_event(PeripheralEvent::PowerChanged(RadioPower::PoweredOn));
        assert_eq!(f.handle.state(), HostState::Ready);
    }
}
