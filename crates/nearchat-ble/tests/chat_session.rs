//! End-to-end chat sessions over the simulated radio
//!
//! A host and one or more guests share a `SimAir`, so discovery, the two-phase
//! handshake, the socket channel and the reaction attributes all run through
//! the real engines.

use std::future::Future;

use nearchat_ble::sim::SimAir;
use nearchat_ble::{ConnectionHandle, HostEngine, HostHandle, ScannerEngine, ScannerHandle};
use nearchat_core::{
    ChatConfig, ConnectError, ConnectionState, Discovery, HostState, PeerIdentity, RadioPower,
    ScannerState,
};
use tokio::sync::broadcast;
use tokio::time::{timeout, Duration};

const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn within<F: Future>(future: F) -> F::Output {
    timeout(WAIT, future).await.expect("timed out")
}

async fn broadcasting_host(air: &SimAir, name: &str) -> (HostHandle, PeerIdentity) {
    let (peripheral, events) = air.peripheral();
    let identity = peripheral.id();
    let host = HostEngine::spawn(peripheral, events, ChatConfig::new().with_chat_name(name));
    host.start_broadcast().unwrap();
    within(host.wait_for_state(|s| *s == HostState::Broadcasting))
        .await
        .unwrap();
    (host, identity)
}

async fn scanning_guest(air: &SimAir) -> (ScannerHandle, broadcast::Receiver<Discovery>) {
    let (central, events) = air.central();
    let scanner = ScannerEngine::spawn(central, events, ChatConfig::new());
    let discoveries = scanner.subscribe_discoveries();
    scanner.start_scan().unwrap();
    within(scanner.wait_for_state(|s| *s == ScannerState::Scanning))
        .await
        .unwrap();
    (scanner, discoveries)
}

async fn joined_guest(scanner: &ScannerHandle, host: PeerIdentity) -> ConnectionHandle {
    let connection = within(scanner.connect(host)).await.unwrap();
    let state = within(connection.established()).await.unwrap();
    assert_eq!(state, ConnectionState::Connected);
    connection
}

async fn next<T: Clone>(rx: &mut broadcast::Receiver<T>) -> T {
    within(rx.recv()).await.unwrap()
}

#[tokio::test]
async fn test_guest_discovers_and_joins_host() {
    init_tracing();
    let air = SimAir::new();
    let (host, host_id) = broadcasting_host(&air, "Lunch").await;
    let (scanner, mut discoveries) = scanning_guest(&air).await;

    match next(&mut discoveries).await {
        Discovery::Discovered(found) => {
            assert_eq!(found.identity, host_id);
            assert_eq!(found.display_name(), "Lunch");
        }
        other => panic!("expected first discovery, got {:?}", other),
    }

    let connection = joined_guest(&scanner, host_id).await;
    assert_eq!(connection.peer(), host_id);
    assert_eq!(host.state(), HostState::Broadcasting);
    assert_eq!(air.link_count(), 1);
}

#[tokio::test]
async fn test_messages_and_reactions_flow_both_ways() {
    init_tracing();
    let air = SimAir::new();
    let (host, host_id) = broadcasting_host(&air, "Lunch").await;
    let (scanner, _discoveries) = scanning_guest(&air).await;
    let connection = joined_guest(&scanner, host_id).await;

    let mut host_messages = host.subscribe_messages();
    let mut host_reactions = host.subscribe_reactions();
    let mut guest_messages = connection.subscribe_messages();
    let mut guest_reactions = connection.subscribe_reactions();

    connection.submit_message("anyone for noodles?").unwrap();
    connection.submit_message("12:30 at the usual").unwrap();
    assert_eq!(next(&mut host_messages).await, "anyone for noodles?");
    assert_eq!(next(&mut host_messages).await, "12:30 at the usual");

    host.submit_message("count me in").unwrap();
    assert_eq!(next(&mut guest_messages).await, "count me in");

    connection.submit_reaction("👍").unwrap();
    assert_eq!(next(&mut host_reactions).await, "👍");

    host.submit_reaction("🍜").unwrap();
    assert_eq!(next(&mut guest_reactions).await, "🍜");
}

#[tokio::test]
async fn test_large_message_survives_channel_buffering() {
    init_tracing();
    let air = SimAir::new();
    let (host, host_id) = broadcasting_host(&air, "Lunch").await;
    let (scanner, _discoveries) = scanning_guest(&air).await;
    let connection = joined_guest(&scanner, host_id).await;
    let mut host_messages = host.subscribe_messages();

    let long = "menu ".repeat(4000);
    connection.submit_message(long.clone()).unwrap();
    connection.submit_message("done").unwrap();
    assert_eq!(next(&mut host_messages).await, long);
    assert_eq!(next(&mut host_messages).await, "done");
}

#[tokio::test]
async fn test_reactions_coalesce_while_notify_queue_is_full() {
    init_tracing();
    let air = SimAir::new();
    let (host, host_id) = broadcasting_host(&air, "Lunch").await;
    let (scanner, _discoveries) = scanning_guest(&air).await;
    let connection = joined_guest(&scanner, host_id).await;
    let mut guest_messages = connection.subscribe_messages();
    let mut guest_reactions = connection.subscribe_reactions();

    air.set_notify_queue_full(true);
    host.submit_reaction("a").unwrap();
    host.submit_reaction("b").unwrap();
    host.submit_reaction("c").unwrap();

    // The host handles commands in order, so this arriving means all three were applied
    host.submit_message("sync").unwrap();
    assert_eq!(next(&mut guest_messages).await, "sync");
    assert!(guest_reactions.try_recv().is_err());

    air.set_notify_queue_full(false);
    assert_eq!(next(&mut guest_reactions).await, "c");

    host.submit_message("sync").unwrap();
    assert_eq!(next(&mut guest_messages).await, "sync");
    assert!(guest_reactions.try_recv().is_err());
}

#[tokio::test]
async fn test_repeated_advertisements_are_deduplicated() {
    init_tracing();
    let air = SimAir::new();
    let (_host, host_id) = broadcasting_host(&air, "Lunch").await;
    let (scanner, mut discoveries) = scanning_guest(&air).await;

    assert!(matches!(
        next(&mut discoveries).await,
        Discovery::Discovered(_)
    ));
    air.rebroadcast();
    air.rebroadcast();
    assert!(matches!(
        next(&mut discoveries).await,
        Discovery::Rediscovered(_)
    ));
    assert!(matches!(
        next(&mut discoveries).await,
        Discovery::Rediscovered(_)
    ));

    let hosts = within(scanner.discovered_hosts()).await.unwrap();
    assert_eq!(hosts.len(), 1);
    assert_eq!(hosts[0].identity, host_id);
}

#[tokio::test]
async fn test_connect_to_unknown_host_fails() {
    init_tracing();
    let air = SimAir::new();
    let (scanner, _discoveries) = scanning_guest(&air).await;
    let stranger = PeerIdentity::random();

    match within(scanner.connect(stranger)).await {
        Err(ConnectError::UnknownPeripheral { identity }) => assert_eq!(identity, stranger),
        other => panic!("expected unknown peripheral, got {:?}", other),
    }
    assert_eq!(air.link_count(), 0);
}

#[tokio::test]
async fn test_connect_while_radio_off_is_rejected() {
    init_tracing();
    let air = SimAir::with_power(RadioPower::PoweredOff);
    let (central, events) = air.central();
    let scanner = ScannerEngine::spawn(central, events, ChatConfig::new());
    assert_eq!(scanner.state(), ScannerState::Off);

    match within(scanner.connect(PeerIdentity::random())).await {
        Err(ConnectError::InvalidState { state }) => assert_eq!(state, ScannerState::Off),
        other => panic!("expected invalid state, got {:?}", other),
    }
}

#[tokio::test]
async fn test_guest_disconnect_leaves_host_open_for_next_guest() {
    init_tracing();
    let air = SimAir::new();
    let (host, host_id) = broadcasting_host(&air, "Lunch").await;
    let (scanner, _discoveries) = scanning_guest(&air).await;

    let first = joined_guest(&scanner, host_id).await;
    first.disconnect().unwrap();
    assert_eq!(
        within(first.closed()).await.unwrap(),
        ConnectionState::Disconnected
    );
    assert_eq!(air.link_count(), 0);
    assert_eq!(host.state(), HostState::Broadcasting);

    let (other_scanner, _other_discoveries) = scanning_guest(&air).await;
    let second = joined_guest(&other_scanner, host_id).await;
    let mut host_messages = host.subscribe_messages();
    second.submit_message("back again").unwrap();
    assert_eq!(next(&mut host_messages).await, "back again");
}

#[tokio::test]
async fn test_host_stopping_ends_guest_connection() {
    init_tracing();
    let air = SimAir::new();
    let (host, host_id) = broadcasting_host(&air, "Lunch").await;
    let (scanner, _discoveries) = scanning_guest(&air).await;
    let connection = joined_guest(&scanner, host_id).await;

    host.stop_broadcast().unwrap();
    within(host.wait_for_state(|s| *s == HostState::Ready))
        .await
        .unwrap();
    assert_eq!(
        within(connection.closed()).await.unwrap(),
        ConnectionState::Disconnected
    );
}

#[tokio::test]
async fn test_radio_power_loss_stops_both_roles() {
    init_tracing();
    let air = SimAir::new();
    let (host, host_id) = broadcasting_host(&air, "Lunch").await;
    let (scanner, _discoveries) = scanning_guest(&air).await;
    let connection = joined_guest(&scanner, host_id).await;

    air.set_power(RadioPower::PoweredOff);
    within(host.wait_for_state(|s| *s == HostState::Off))
        .await
        .unwrap();
    within(scanner.wait_for_state(|s| *s == ScannerState::Off))
        .await
        .unwrap();
    assert!(within(connection.closed()).await.unwrap().is_terminal());
}

#[tokio::test]
async fn test_new_guest_channel_replaces_previous_one() {
    init_tracing();
    let air = SimAir::new();
    let (host, host_id) = broadcasting_host(&air, "Lunch").await;
    let (first_scanner, _first_discoveries) = scanning_guest(&air).await;
    let (second_scanner, _second_discoveries) = scanning_guest(&air).await;

    let _first = joined_guest(&first_scanner, host_id).await;
    let second = joined_guest(&second_scanner, host_id).await;
    let mut host_messages = host.subscribe_messages();
    let mut second_messages = second.subscribe_messages();

    second.submit_message("taking over").unwrap();
    assert_eq!(next(&mut host_messages).await, "taking over");

    host.submit_message("hello again").unwrap();
    assert_eq!(next(&mut second_messages).await, "hello again");
    assert_eq!(host.state(), HostState::Broadcasting);
}

#[tokio::test]
async fn test_connecting_elsewhere_disconnects_current_host() {
    init_tracing();
    let air = SimAir::new();
    let (_lunch, lunch_id) = broadcasting_host(&air, "Lunch").await;
    let (dinner, dinner_id) = broadcasting_host(&air, "Dinner").await;
    let (scanner, mut discoveries) = scanning_guest(&air).await;
    next(&mut discoveries).await;
    next(&mut discoveries).await;

    let first = joined_guest(&scanner, lunch_id).await;
    let second = joined_guest(&scanner, dinner_id).await;
    assert_eq!(
        within(first.closed()).await.unwrap(),
        ConnectionState::Disconnected
    );
    assert_eq!(air.link_count(), 1);

    let mut dinner_messages = dinner.subscribe_messages();
    second.submit_message("changed plans").unwrap();
    assert_eq!(next(&mut dinner_messages).await, "changed plans");
}
