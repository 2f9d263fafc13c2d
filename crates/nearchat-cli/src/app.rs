//! Command execution
//!
//! `host` and `join` drive a real radio and share one terminal loop: incoming
//! messages and reactions are printed, stdin lines are sent, and a line starting
//! with `+` is sent as a reaction. `demo` runs both roles on the simulated radio.

use std::future::Future;
use std::time::Duration;

use nearchat_ble::sim::SimAir;
use nearchat_ble::{ConnectionHandle, HostEngine, HostHandle, ScannerEngine, ScannerHandle};
use nearchat_core::{
    ChatConfig, ChatError, ConnectError, ConnectionState, DiscoveredHost, Discovery, HostState,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::timeout;
use tracing::{info, warn};

use crate::cli::Commands;
use crate::config::{Backend, CliConfig};
use crate::error::{CliError, Result};

/// How long each demo step may take
const DEMO_STEP: Duration = Duration::from_secs(5);

// ----------------------------------------------------------------------------
// Input
// ----------------------------------------------------------------------------

/// One line typed by the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Message(String),
    Reaction(String),
}

/// Blank lines are skipped and `+text` is a reaction
pub fn parse_input(line: &str) -> Option<Input> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match line.strip_prefix('+') {
        Some(reaction) if !reaction.trim().is_empty() => {
            Some(Input::Reaction(reaction.trim().to_string()))
        }
        Some(_) => None,
        None => Some(Input::Message(line.to_string())),
    }
}

/// Whether a discovered host's advertised name contains `wanted`, ignoring case
pub fn matches_name(host: &DiscoveredHost, wanted: Option<&str>) -> bool {
    let Some(wanted) = wanted else {
        return true;
    };
    host.name
        .as_deref()
        .is_some_and(|name| name.to_lowercase().contains(&wanted.to_lowercase()))
}

// ----------------------------------------------------------------------------
// Chat Sessions
// ----------------------------------------------------------------------------

/// Either end of a chat, as seen by the terminal loop
trait ChatSession {
    fn send(&self, input: Input) -> nearchat_core::Result<()>;
    fn messages(&self) -> broadcast::Receiver<String>;
    fn reactions(&self) -> broadcast::Receiver<String>;
}

impl ChatSession for HostHandle {
    fn send(&self, input: Input) -> nearchat_core::Result<()> {
        match input {
            Input::Message(text) => self.submit_message(text),
            Input::Reaction(text) => self.submit_reaction(text),
        }
    }

    fn messages(&self) -> broadcast::Receiver<String> {
        self.subscribe_messages()
    }

    fn reactions(&self) -> broadcast::Receiver<String> {
        self.subscribe_reactions()
    }
}

impl ChatSession for ConnectionHandle {
    fn send(&self, input: Input) -> nearchat_core::Result<()> {
        match input {
            Input::Message(text) => self.submit_message(text),
            Input::Reaction(text) => self.submit_reaction(text),
        }
    }

    fn messages(&self) -> broadcast::Receiver<String> {
        self.subscribe_messages()
    }

    fn reactions(&self) -> broadcast::Receiver<String> {
        self.subscribe_reactions()
    }
}

/// Relay stdin and incoming traffic until stdin closes, Ctrl-C, or `ended` resolves
async fn chat_loop<S, F>(session: &S, ended: F) -> Result<()>
where
    S: ChatSession,
    F: Future,
{
    let mut messages = session.messages();
    let mut reactions = session.reactions();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    tokio::pin!(ended);

    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => {
                    if let Some(input) = parse_input(&line) {
                        session.send(input)?;
                    }
                }
                None => break,
            },
            message = messages.recv() => match message {
                Ok(text) => println!("< {}", text),
                Err(RecvError::Lagged(missed)) => warn!("Missed {} messages", missed),
                Err(RecvError::Closed) => break,
            },
            reaction = reactions.recv() => match reaction {
                Ok(text) => println!("< +{}", text),
                Err(RecvError::Lagged(missed)) => warn!("Missed {} reactions", missed),
                Err(RecvError::Closed) => break,
            },
            _ = &mut ended => {
                println!("Chat ended");
                break;
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

async fn find_host(
    discoveries: &mut broadcast::Receiver<Discovery>,
    wanted: Option<&str>,
) -> Result<DiscoveredHost> {
    loop {
        match discoveries.recv().await {
            Ok(Discovery::Discovered(host) | Discovery::Rediscovered(host)) => {
                if matches_name(&host, wanted) {
                    return Ok(host);
                }
            }
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => {
                return Err(ChatError::channel_error("scanner engine has stopped").into())
            }
        }
    }
}

async fn establish(scanner: &ScannerHandle, host: &DiscoveredHost) -> Result<ConnectionHandle> {
    let connection = scanner.connect(host.identity).await?;
    match connection.established().await? {
        ConnectionState::Connected => Ok(connection),
        state => {
            Err(ConnectError::connection_failure(format!("handshake ended {}", state)).into())
        }
    }
}

// ----------------------------------------------------------------------------
// Application
// ----------------------------------------------------------------------------

pub struct ChatApp {
    config: CliConfig,
}

impl ChatApp {
    pub fn new(config: CliConfig) -> Self {
        Self { config }
    }

    pub async fn run(&self, command: Commands) -> Result<()> {
        match command {
            Commands::Host { name } => self.host(name).await,
            Commands::Join { name, timeout_secs } => {
                self.join(name, Duration::from_secs(timeout_secs)).await
            }
            Commands::Demo => self.demo().await,
        }
    }

    async fn host(&self, name: Option<String>) -> Result<()> {
        let mut config = self.config.chat.clone();
        if let Some(name) = name {
            config.chat_name = name;
        }
        config.validate()?;

        let chat_name = config.chat_name.clone();
        let host = self.spawn_host(config).await?;
        host.start_broadcast()?;
        let state = host.wait_for_state(|s| *s != HostState::Ready).await?;
        if state != HostState::Broadcasting {
            return Err(CliError::BackendUnavailable(format!("radio is {}", state)));
        }
        println!("Hosting '{}'. Type to chat, +text to react.", chat_name);

        chat_loop(
            &host,
            host.wait_for_state(|s| matches!(s, HostState::Off | HostState::Unauthorised)),
        )
        .await?;

        host.stop_broadcast()?;
        host.shutdown()?;
        Ok(())
    }

    async fn join(&self, name: Option<String>, wait: Duration) -> Result<()> {
        let scanner = self.spawn_scanner(self.config.chat.clone()).await?;
        let mut discoveries = scanner.subscribe_discoveries();

        let found = timeout(wait, async {
            scanner.wait_for_state(|s| s.can_connect()).await?;
            scanner.start_scan()?;
            println!("Looking for a chat...");
            find_host(&mut discoveries, name.as_deref()).await
        })
        .await
        .map_err(|_| CliError::NoHostFound(wait.as_secs()))??;
        scanner.stop_scan()?;

        let connection = establish(&scanner, &found).await?;
        println!(
            "Joined '{}'. Type to chat, +text to react.",
            found.display_name()
        );

        chat_loop(&connection, connection.closed()).await?;

        connection.disconnect()?;
        scanner.shutdown()?;
        Ok(())
    }

    async fn demo(&self) -> Result<()> {
        let config = self.config.chat.clone();
        let air = SimAir::new().with_channel_capacity(config.write_buffer_size);

        let (peripheral, peripheral_events) = air.peripheral();
        let host = HostEngine::spawn(peripheral, peripheral_events, config.clone());
        host.start_broadcast()?;
        step("waiting for the host to broadcast", async {
            host.wait_for_state(|s| *s == HostState::Broadcasting)
                .await
                .map_err(CliError::from)
        })
        .await?;
        println!("host: broadcasting '{}'", config.chat_name);

        let (central, central_events) = air.central();
        let scanner = ScannerEngine::spawn(central, central_events, config.clone());
        let mut discoveries = scanner.subscribe_discoveries();
        scanner.start_scan()?;
        let found = step(
            "discovering the host",
            find_host(&mut discoveries, Some(&config.chat_name)),
        )
        .await?;
        println!("guest: discovered '{}'", found.display_name());

        let connection = step("connecting", establish(&scanner, &found)).await?;
        println!("guest: connected to {}", connection.peer());

        let mut host_messages = host.subscribe_messages();
        let mut host_reactions = host.subscribe_reactions();
        let mut guest_messages = connection.subscribe_messages();
        let mut guest_reactions = connection.subscribe_reactions();

        connection.submit_message("hello from the guest")?;
        println!("host: < {}", receive(&mut host_messages).await?);
        host.submit_message("hello from the host")?;
        println!("guest: < {}", receive(&mut guest_messages).await?);
        connection.submit_reaction("👋")?;
        println!("host: < +{}", receive(&mut host_reactions).await?);
        host.submit_reaction("🎉")?;
        println!("guest: < +{}", receive(&mut guest_reactions).await?);

        connection.disconnect()?;
        let state = step("disconnecting", async {
            connection.closed().await.map_err(CliError::from)
        })
        .await?;
        println!("guest: {}", state);

        host.stop_broadcast()?;
        scanner.shutdown()?;
        host.shutdown()?;
        info!("Demo finished");
        Ok(())
    }

    fn require_radio(&self) -> Result<()> {
        match self.config.backend {
            Backend::Bluez => Ok(()),
            Backend::Sim => Err(CliError::BackendUnavailable(
                "the simulated radio only runs inside `nearchat demo`".to_string(),
            )),
        }
    }

    #[cfg(all(target_os = "linux", feature = "bluez"))]
    async fn spawn_host(&self, config: ChatConfig) -> Result<HostHandle> {
        self.require_radio()?;
        let adapter = nearchat_ble::bluez::BluezAdapter::open(&config).await?;
        let (radio, events) = adapter.peripheral();
        Ok(HostEngine::spawn(radio, events, config))
    }

    #[cfg(not(all(target_os = "linux", feature = "bluez")))]
    async fn spawn_host(&self, _config: ChatConfig) -> Result<HostHandle> {
        self.require_radio()?;
        Err(bluez_missing())
    }

    #[cfg(all(target_os = "linux", feature = "bluez"))]
    async fn spawn_scanner(&self, config: ChatConfig) -> Result<ScannerHandle> {
        self.require_radio()?;
        let adapter = nearchat_ble::bluez::BluezAdapter::open(&config).await?;
        let (radio, events) = adapter.central();
        Ok(ScannerEngine::spawn(radio, events, config))
    }

    #[cfg(not(all(target_os = "linux", feature = "bluez")))]
    async fn spawn_scanner(&self, _config: ChatConfig) -> Result<ScannerHandle> {
        self.require_radio()?;
        Err(bluez_missing())
    }
}

#[cfg(not(all(target_os = "linux", feature = "bluez")))]
fn bluez_missing() -> CliError {
    CliError::BackendUnavailable("built without the `bluez` feature".to_string())
}

async fn step<T>(what: &str, future: impl Future<Output = Result<T>>) -> Result<T> {
    timeout(DEMO_STEP, future)
        .await
        .map_err(|_| CliError::Timeout(what.to_string()))?
}

async fn receive(rx: &mut broadcast::Receiver<String>) -> Result<String> {
    step("waiting for the other side", async {
        rx.recv()
            .await
            .map_err(|e| CliError::from(ChatError::channel_error(e.to_string())))
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use nearchat_core::{PeerIdentity, Timestamp};

    fn host_named(name: Option<&str>) -> DiscoveredHost {
        DiscoveredHost {
            name: name.map(str::to_string),
            identity: PeerIdentity::random(),
            last_seen: Timestamp::now(),
            rssi: None,
        }
    }

    #[test]
    fn test_plus_prefix_is_reaction() {
        assert_eq!(
            parse_input("+ 👍 "),
            Some(Input::Reaction("👍".to_string()))
        );
        assert_eq!(
            parse_input("  see you at noon "),
            Some(Input::Message("see you at noon".to_string()))
        );
    }

    #[test]
    fn test_blank_lines_are_skipped() {
        assert_eq!(parse_input(""), None);
        assert_eq!(parse_input("   "), None);
        assert_eq!(parse_input("+"), None);
    }

    #[test]
    fn test_name_filter_is_case_insensitive_substring() {
        let host = host_named(Some("Friday Lunch"));
        assert!(matches_name(&host, None));
        assert!(matches_name(&host, Some("lunch")));
        assert!(!matches_name(&host, Some("dinner")));
        assert!(!matches_name(&host_named(None), Some("lunch")));
        assert!(matches_name(&host_named(None), None));
    }

    #[tokio::test]
    async fn test_demo_runs_on_simulated_radio() {
        let config = CliConfig {
            backend: Backend::Sim,
            ..CliConfig::default()
        };
        ChatApp::new(config).run(Commands::Demo).await.unwrap();
    }

    #[tokio::test]
    async fn test_host_refuses_simulated_radio() {
        let config = CliConfig {
            backend: Backend::Sim,
            ..CliConfig::default()
        };
        let result = ChatApp::new(config)
            .run(Commands::Host { name: None })
            .await;
        assert!(matches!(result, Err(CliError::BackendUnavailable(_))));
    }
}
