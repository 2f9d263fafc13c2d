//! Simulated radio
//!
//! An in-process "air" that implements every radio capability, so host and
//! guest engines can run end to end without hardware. Advertisements reach
//! scanning centrals whose filter matches, GATT discovery runs against the
//! published service definition, reads and writes of dynamic attributes are
//! routed to the host as requests, and socket channels are in-memory duplex
//! pipes behind [`PumpedChannel`].

use std::collections::{HashMap, HashSet};
use std::ops::RangeInclusive;
use std::sync::Arc;

use nearchat_core::{
    Advertisement, ChatConfig, PeerIdentity, Psm, RadioError, RadioPower, ServiceDefinition,
};
use nearchat_core::protocol::CharacteristicDefinition;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::pump::PumpedChannel;
use crate::radio::{
    AdvertisementObservation, AttResponse, AttWrite, CentralEvent, CentralRadio, GattClient,
    NotifyOutcome, PeerEvent, PeerLink, PeripheralEvent, PeripheralRadio, ReadRequest, RequestId,
    WriteKind,
};

/// Dynamic LE socket ports handed out to listeners
pub const SIM_PSM_RANGE: RangeInclusive<u16> = 0x0080..=0x00FF;

/// Client characteristic configuration descriptor
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805F9B34FB);

/// Characteristic presentation format descriptor
pub const PRESENTATION_FORMAT_UUID: Uuid = Uuid::from_u128(0x00002904_0000_1000_8000_00805F9B34FB);

const SIM_RSSI: i16 = -48;

// ----------------------------------------------------------------------------
// Air State
// ----------------------------------------------------------------------------

struct PeripheralNode {
    events: mpsc::UnboundedSender<PeripheralEvent>,
    service: Option<ServiceDefinition>,
    advertisement: Option<Advertisement>,
    listener: Option<Psm>,
}

struct CentralNode {
    events: mpsc::UnboundedSender<CentralEvent>,
    scan_filter: Option<Vec<Uuid>>,
}

struct Link {
    central: PeerIdentity,
    peripheral: PeerIdentity,
    events: mpsc::UnboundedSender<PeerEvent>,
    subscriptions: HashSet<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Read,
    Write,
}

struct PendingRequest {
    link: u64,
    characteristic: Uuid,
    kind: RequestKind,
}

struct Air {
    power: RadioPower,
    peripherals: HashMap<PeerIdentity, PeripheralNode>,
    centrals: HashMap<PeerIdentity, CentralNode>,
    links: HashMap<u64, Link>,
    next_link: u64,
    requests: HashMap<RequestId, PendingRequest>,
    notify_queue_full: bool,
    /// Bytes buffered per direction of a socket channel
    channel_capacity: usize,
}

fn scan_matches(filter: &[Uuid], advertisement: &Advertisement) -> bool {
    filter.is_empty()
        || advertisement
            .service_uuids
            .iter()
            .any(|uuid| filter.contains(uuid))
}

fn observation(peer: PeerIdentity, advertisement: &Advertisement) -> AdvertisementObservation {
    AdvertisementObservation {
        peer,
        local_name: Some(advertisement.local_name.clone()),
        service_uuids: advertisement.service_uuids.clone(),
        rssi: Some(SIM_RSSI),
    }
}

impl Air {
    fn powered(&self) -> Result<(), RadioError> {
        match self.power {
            RadioPower::PoweredOn => Ok(()),
            RadioPower::Unauthorized => Err(RadioError::Unauthorized),
            _ => Err(RadioError::PoweredOff),
        }
    }

    fn send_peripheral(&self, peer: PeerIdentity, event: PeripheralEvent) {
        if let Some(node) = self.peripherals.get(&peer) {
            let _ = node.events.send(event);
        }
    }

    fn send_central(&self, peer: PeerIdentity, event: CentralEvent) {
        if let Some(node) = self.centrals.get(&peer) {
            let _ = node.events.send(event);
        }
    }

    /// Deliver one peripheral's advertisement to every matching scanner
    fn broadcast_advertisement(&self, peer: PeerIdentity) {
        let Some(advertisement) = self
            .peripherals
            .get(&peer)
            .and_then(|node| node.advertisement.as_ref())
        else {
            return;
        };

        for central in self.centrals.values() {
            if let Some(filter) = &central.scan_filter {
                if scan_matches(filter, advertisement) {
                    let _ = central
                        .events
                        .send(CentralEvent::Advertisement(observation(peer, advertisement)));
                }
            }
        }
    }

    /// Show a newly scanning central every advertisement already on air
    fn show_advertisements(&self, central: PeerIdentity) {
        let Some(filter) = self
            .centrals
            .get(&central)
            .and_then(|node| node.scan_filter.as_ref())
        else {
            return;
        };

        for (peer, node) in &self.peripherals {
            if let Some(advertisement) = &node.advertisement {
                if scan_matches(filter, advertisement) {
                    self.send_central(
                        central,
                        CentralEvent::Advertisement(observation(*peer, advertisement)),
                    );
                }
            }
        }
    }

    fn allocate_psm(&self) -> Option<Psm> {
        let in_use: HashSet<Psm> = self
            .peripherals
            .values()
            .filter_map(|node| node.listener)
            .collect();
        SIM_PSM_RANGE.map(Psm).find(|psm| !in_use.contains(psm))
    }

    fn linked_peripheral(&self, link: u64) -> Result<&PeripheralNode, RadioError> {
        self.links
            .get(&link)
            .and_then(|link| self.peripherals.get(&link.peripheral))
            .ok_or(RadioError::NotConnected)
    }

    fn linked_characteristic(
        &self,
        link: u64,
        characteristic: Uuid,
    ) -> Result<&CharacteristicDefinition, RadioError> {
        self.linked_peripheral(link)?
            .service
            .as_ref()
            .and_then(|service| service.characteristic(characteristic))
            .ok_or(RadioError::AttributeNotFound {
                uuid: characteristic,
            })
    }

    fn drop_link(&mut self, id: u64, reason: Option<RadioError>) {
        let Some(link) = self.links.remove(&id) else {
            return;
        };
        self.requests.retain(|_, request| request.link != id);
        for characteristic in &link.subscriptions {
            self.send_peripheral(
                link.peripheral,
                PeripheralEvent::SubscriptionChanged {
                    central: link.central,
                    characteristic: *characteristic,
                    subscribed: false,
                },
            );
        }
        let _ = link.events.send(PeerEvent::Disconnected(reason));
    }
}

// ----------------------------------------------------------------------------
// Sim Air
// ----------------------------------------------------------------------------

/// Shared medium connecting simulated peripherals and centrals
#[derive(Clone)]
pub struct SimAir {
    inner: Arc<Mutex<Air>>,
}

impl Default for SimAir {
    fn default() -> Self {
        Self::new()
    }
}

impl SimAir {
    /// Powered-on air with no devices
    pub fn new() -> Self {
        Self::with_power(RadioPower::PoweredOn)
    }

    pub fn with_power(power: RadioPower) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Air {
                power,
                peripherals: HashMap::new(),
                centrals: HashMap::new(),
                links: HashMap::new(),
                next_link: 1,
                requests: HashMap::new(),
                notify_queue_full: false,
                channel_capacity: ChatConfig::default().write_buffer_size,
            })),
        }
    }

    /// Socket channel buffering, normally `ChatConfig::write_buffer_size`
    pub fn with_channel_capacity(self, capacity: usize) -> Self {
        self.inner.lock().channel_capacity = capacity.max(1);
        self
    }

    /// Add a device in the peripheral role
    pub fn peripheral(&self) -> (SimPeripheral, mpsc::UnboundedReceiver<PeripheralEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let id = PeerIdentity::random();
        self.inner.lock().peripherals.insert(
            id,
            PeripheralNode {
                events,
                service: None,
                advertisement: None,
                listener: None,
            },
        );
        debug!("Sim peripheral {} joined the air", id);
        (
            SimPeripheral {
                air: self.clone(),
                id,
            },
            rx,
        )
    }

    /// Add a device in the central role
    pub fn central(&self) -> (SimCentral, mpsc::UnboundedReceiver<CentralEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let id = PeerIdentity::random();
        self.inner.lock().centrals.insert(
            id,
            CentralNode {
                events,
                scan_filter: None,
            },
        );
        debug!("Sim central {} joined the air", id);
        (
            SimCentral {
                air: self.clone(),
                id,
            },
            rx,
        )
    }

    /// Change radio power for every device on the air
    pub fn set_power(&self, power: RadioPower) {
        let mut air = self.inner.lock();
        air.power = power;
        info!("Sim radio power {:?}", power);

        if let Err(reason) = air.powered() {
            let links: Vec<u64> = air.links.keys().copied().collect();
            for link in links {
                air.drop_link(link, Some(reason.clone()));
            }
            for node in air.peripherals.values_mut() {
                node.advertisement = None;
                node.listener = None;
                node.service = None;
            }
            for node in air.centrals.values_mut() {
                node.scan_filter = None;
            }
        }

        for node in air.peripherals.values() {
            let _ = node.events.send(PeripheralEvent::PowerChanged(power));
        }
        for node in air.centrals.values() {
            let _ = node.events.send(CentralEvent::PowerChanged(power));
        }
    }

    /// Make notify report a full transmit queue; clearing it signals readiness
    pub fn set_notify_queue_full(&self, full: bool) {
        let mut air = self.inner.lock();
        let was_full = air.notify_queue_full;
        air.notify_queue_full = full;
        if was_full && !full {
            for node in air.peripherals.values() {
                let _ = node.events.send(PeripheralEvent::ReadyToUpdateSubscribers);
            }
        }
    }

    /// Repeat every current advertisement, as the next advertising interval would
    pub fn rebroadcast(&self) {
        let air = self.inner.lock();
        let peers: Vec<PeerIdentity> = air.peripherals.keys().copied().collect();
        for peer in peers {
            air.broadcast_advertisement(peer);
        }
    }

    /// Number of live central-to-peripheral links
    pub fn link_count(&self) -> usize {
        self.inner.lock().links.len()
    }
}

// ----------------------------------------------------------------------------
// Peripheral Role
// ----------------------------------------------------------------------------

/// Peripheral radio handle on a [`SimAir`]
pub struct SimPeripheral {
    air: SimAir,
    id: PeerIdentity,
}

impl SimPeripheral {
    /// Identity scanners see for this device
    pub fn id(&self) -> PeerIdentity {
        self.id
    }
}

impl PeripheralRadio for SimPeripheral {
    fn power(&self) -> RadioPower {
        self.air.inner.lock().power
    }

    fn open_socket_listener(&mut self, encrypted: bool) {
        let mut air = self.air.inner.lock();
        let result = air.powered().and_then(|()| {
            air.allocate_psm()
                .ok_or_else(|| RadioError::Platform("no free socket port".to_string()))
        });
        if let Ok(psm) = result {
            if let Some(node) = air.peripherals.get_mut(&self.id) {
                node.listener = Some(psm);
            }
            debug!("Sim listener {} (encrypted: {})", psm, encrypted);
        }
        air.send_peripheral(self.id, PeripheralEvent::SocketListenerOpened(result));
    }

    fn close_socket_listener(&mut self, port: Psm) {
        let mut air = self.air.inner.lock();
        if let Some(node) = air.peripherals.get_mut(&self.id) {
            if node.listener == Some(port) {
                node.listener = None;
            }
        }
    }

    fn publish(&mut self, service: ServiceDefinition) {
        let mut air = self.air.inner.lock();
        let result = air.powered();
        if result.is_ok() {
            if let Some(node) = air.peripherals.get_mut(&self.id) {
                node.service = Some(service);
            }
        }
        air.send_peripheral(self.id, PeripheralEvent::ServicePublished(result));
    }

    fn unpublish_all(&mut self) {
        let mut air = self.air.inner.lock();
        if let Some(node) = air.peripherals.get_mut(&self.id) {
            node.service = None;
        }
        for link in air.links.values_mut() {
            if link.peripheral == self.id {
                link.subscriptions.clear();
                let _ = link.events.send(PeerEvent::ServicesInvalidated);
            }
        }
    }

    fn start_advertising(&mut self, advertisement: Advertisement) {
        let mut air = self.air.inner.lock();
        let result = air.powered();
        if result.is_ok() {
            if let Some(node) = air.peripherals.get_mut(&self.id) {
                node.advertisement = Some(advertisement);
            }
            air.broadcast_advertisement(self.id);
        }
        air.send_peripheral(self.id, PeripheralEvent::AdvertisingStarted(result));
    }

    fn stop_advertising(&mut self) {
        if let Some(node) = self.air.inner.lock().peripherals.get_mut(&self.id) {
            node.advertisement = None;
        }
    }

    fn respond(&mut self, request: RequestId, response: AttResponse) {
        let mut air = self.air.inner.lock();
        let Some(pending) = air.requests.remove(&request) else {
            return;
        };
        let Some(link) = air.links.get(&pending.link) else {
            return;
        };

        let error = || RadioError::Platform(format!("attribute error {:?}", response.status));
        let event = match pending.kind {
            RequestKind::Read => PeerEvent::ValueRead {
                characteristic: pending.characteristic,
                result: if response.status.is_success() {
                    Ok(response.value.clone().unwrap_or_default())
                } else {
                    Err(error())
                },
            },
            RequestKind::Write => PeerEvent::WriteCompleted {
                characteristic: pending.characteristic,
                result: if response.status.is_success() {
                    Ok(())
                } else {
                    Err(error())
                },
            },
        };
        let _ = link.events.send(event);
    }

    fn notify(&mut self, characteristic: Uuid, value: &[u8]) -> NotifyOutcome {
        let air = self.air.inner.lock();
        if air.notify_queue_full {
            return NotifyOutcome::QueueFull;
        }
        for link in air.links.values() {
            if link.peripheral == self.id && link.subscriptions.contains(&characteristic) {
                let _ = link.events.send(PeerEvent::Notification {
                    characteristic,
                    value: value.to_vec(),
                });
            }
        }
        NotifyOutcome::Sent
    }
}

// ----------------------------------------------------------------------------
// Central Role
// ----------------------------------------------------------------------------

/// Central radio handle on a [`SimAir`]
pub struct SimCentral {
    air: SimAir,
    id: PeerIdentity,
}

impl SimCentral {
    pub fn id(&self) -> PeerIdentity {
        self.id
    }
}

impl CentralRadio for SimCentral {
    fn power(&self) -> RadioPower {
        self.air.inner.lock().power
    }

    fn start_scan(&mut self, services: &[Uuid]) {
        let mut air = self.air.inner.lock();
        if air.powered().is_err() {
            return;
        }
        if let Some(node) = air.centrals.get_mut(&self.id) {
            node.scan_filter = Some(services.to_vec());
        }
        air.show_advertisements(self.id);
    }

    fn stop_scan(&mut self) {
        if let Some(node) = self.air.inner.lock().centrals.get_mut(&self.id) {
            node.scan_filter = None;
        }
    }

    fn connect(&mut self, peer: PeerIdentity) {
        let mut air = self.air.inner.lock();
        let reachable = air.powered().and_then(|()| {
            match air.peripherals.get(&peer) {
                Some(node) if node.advertisement.is_some() => Ok(()),
                _ => Err(RadioError::Platform(format!("{} is out of range", peer))),
            }
        });
        if let Err(error) = reachable {
            air.send_central(self.id, CentralEvent::ConnectFailed { peer, error });
            return;
        }

        let id = air.next_link;
        air.next_link += 1;
        let (events, rx) = mpsc::unbounded_channel();
        air.links.insert(
            id,
            Link {
                central: self.id,
                peripheral: peer,
                events: events.clone(),
                subscriptions: HashSet::new(),
            },
        );

        let client = SimGattClient {
            air: self.air.clone(),
            link: id,
            central: self.id,
            peripheral: peer,
            events,
        };
        debug!("Sim link {} from {} to {}", id, self.id, peer);
        air.send_central(
            self.id,
            CentralEvent::Connected(PeerLink {
                peer,
                client: Box::new(client),
                events: rx,
            }),
        );
    }

    fn cancel_connect(&mut self, peer: PeerIdentity) {
        debug!("Sim connects complete at once, nothing to cancel for {}", peer);
    }
}

// ----------------------------------------------------------------------------
// GATT Client
// ----------------------------------------------------------------------------

/// Per-link GATT client handed out in [`PeerLink`]
pub struct SimGattClient {
    air: SimAir,
    link: u64,
    central: PeerIdentity,
    peripheral: PeerIdentity,
    events: mpsc::UnboundedSender<PeerEvent>,
}

impl SimGattClient {
    fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }
}

impl GattClient for SimGattClient {
    fn discover_services(&mut self, services: &[Uuid]) {
        let result = self.air.inner.lock().linked_peripheral(self.link).map(|node| {
            node.service
                .iter()
                .map(|service| service.uuid)
                .filter(|uuid| services.is_empty() || services.contains(uuid))
                .collect()
        });
        self.emit(PeerEvent::ServicesDiscovered(result));
    }

    fn discover_characteristics(&mut self, service: Uuid, characteristics: &[Uuid]) {
        let result = self
            .air
            .inner
            .lock()
            .linked_peripheral(self.link)
            .and_then(|node| {
                node.service
                    .as_ref()
                    .filter(|published| published.uuid == service)
                    .map(|published| {
                        published
                            .characteristics
                            .iter()
                            .map(|c| c.spec.uuid)
                            .filter(|uuid| {
                                characteristics.is_empty() || characteristics.contains(uuid)
                            })
                            .collect()
                    })
                    .ok_or(RadioError::AttributeNotFound { uuid: service })
            });
        self.emit(PeerEvent::CharacteristicsDiscovered { service, result });
    }

    fn discover_descriptors(&mut self, characteristic: Uuid) {
        let result = self
            .air
            .inner
            .lock()
            .linked_characteristic(self.link, characteristic)
            .map(|definition| {
                let mut descriptors = Vec::new();
                if definition.spec.properties.notify {
                    descriptors.push(CCCD_UUID);
                }
                if definition.spec.format.is_some() {
                    descriptors.push(PRESENTATION_FORMAT_UUID);
                }
                descriptors
            });
        self.emit(PeerEvent::DescriptorsDiscovered {
            characteristic,
            result,
        });
    }

    fn set_notify(&mut self, characteristic: Uuid, enabled: bool) {
        let mut air = self.air.inner.lock();
        let supported = air
            .linked_characteristic(self.link, characteristic)
            .map(|definition| definition.spec.properties.notify);

        let result = match supported {
            Err(e) => Err(e),
            Ok(false) => Err(RadioError::Platform(format!(
                "{} does not notify",
                characteristic
            ))),
            Ok(true) => {
                if let Some(link) = air.links.get_mut(&self.link) {
                    if enabled {
                        link.subscriptions.insert(characteristic);
                    } else {
                        link.subscriptions.remove(&characteristic);
                    }
                }
                air.send_peripheral(
                    self.peripheral,
                    PeripheralEvent::SubscriptionChanged {
                        central: self.central,
                        characteristic,
                        subscribed: enabled,
                    },
                );
                Ok(enabled)
            }
        };
        drop(air);

        self.emit(PeerEvent::NotificationStateChanged {
            characteristic,
            result,
        });
    }

    fn read(&mut self, characteristic: Uuid) {
        let mut air = self.air.inner.lock();
        let target = air
            .linked_characteristic(self.link, characteristic)
            .map(|definition| (definition.value.clone(), definition.spec.properties.read));

        let result = match target {
            Err(e) => Err(e),
            Ok((_, false)) => Err(RadioError::Platform(format!(
                "{} is not readable",
                characteristic
            ))),
            Ok((Some(value), true)) => Ok(value),
            Ok((None, true)) => {
                let id = RequestId::next();
                air.requests.insert(
                    id,
                    PendingRequest {
                        link: self.link,
                        characteristic,
                        kind: RequestKind::Read,
                    },
                );
                air.send_peripheral(
                    self.peripheral,
                    PeripheralEvent::ReadRequest(ReadRequest {
                        id,
                        central: self.central,
                        characteristic,
                        offset: 0,
                    }),
                );
                return;
            }
        };
        drop(air);

        self.emit(PeerEvent::ValueRead {
            characteristic,
            result,
        });
    }

    fn write(&mut self, characteristic: Uuid, value: &[u8], kind: WriteKind) {
        let mut air = self.air.inner.lock();
        let allowed = air
            .linked_characteristic(self.link, characteristic)
            .map(|definition| match kind {
                WriteKind::WithResponse => definition.spec.properties.write,
                WriteKind::WithoutResponse => definition.spec.properties.write_without_response,
            })
            .and_then(|allowed| {
                if allowed {
                    Ok(())
                } else {
                    Err(RadioError::Platform(format!(
                        "{} is not writable",
                        characteristic
                    )))
                }
            });

        if let Err(e) = allowed {
            drop(air);
            if kind == WriteKind::WithResponse {
                self.emit(PeerEvent::WriteCompleted {
                    characteristic,
                    result: Err(e),
                });
            }
            return;
        }

        let id = RequestId::next();
        if kind == WriteKind::WithResponse {
            air.requests.insert(
                id,
                PendingRequest {
                    link: self.link,
                    characteristic,
                    kind: RequestKind::Write,
                },
            );
        }
        air.send_peripheral(
            self.peripheral,
            PeripheralEvent::WriteRequests {
                request: id,
                writes: vec![AttWrite {
                    central: self.central,
                    characteristic,
                    offset: 0,
                    value: value.to_vec(),
                }],
            },
        );
    }

    fn open_socket_channel(&mut self, port: Psm) {
        let air = self.air.inner.lock();
        let capacity = air.channel_capacity;
        let host_events = air
            .linked_peripheral(self.link)
            .and_then(|node| {
                if node.listener == Some(port) {
                    Ok(node.events.clone())
                } else {
                    Err(RadioError::Platform(format!("no listener on port {}", port)))
                }
            });
        drop(air);

        let host_events = match host_events {
            Ok(events) => events,
            Err(e) => {
                self.emit(PeerEvent::SocketChannelOpened(Err(e)));
                return;
            }
        };

        let (near, far) = tokio::io::duplex(capacity);
        let guest_end = PumpedChannel::spawn(near, self.events.clone(), capacity);
        let host_end = PumpedChannel::spawn(far, host_events.clone(), capacity);
        debug!("Sim socket channel on port {} for link {}", port, self.link);

        self.emit(PeerEvent::SocketChannelOpened(Ok(Box::new(guest_end))));
        let _ = host_events.send(PeripheralEvent::SocketChannelOpened(Ok(Box::new(host_end))));
    }

    fn cancel_connection(&mut self) {
        self.air.inner.lock().drop_link(self.link, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nearchat_core::{CHAT_SERVICE_UUID, SOCKET_PORT_UUID};

    #[tokio::test]
    async fn test_scanner_only_sees_matching_services() {
        let air = SimAir::new();
        let (mut chat, mut chat_events) = air.peripheral();
        let (mut other, _other_events) = air.peripheral();
        let (mut central, mut central_events) = air.central();

        central.start_scan(&[CHAT_SERVICE_UUID]);
        chat.start_advertising(Advertisement::for_chat("Lunch"));
        other.start_advertising(Advertisement {
            local_name: "Speaker".to_string(),
            service_uuids: vec![Uuid::from_u128(0x180D)],
        });

        match central_events.recv().await {
            Some(CentralEvent::Advertisement(seen)) => {
                assert_eq!(seen.peer, chat.id());
                assert_eq!(seen.local_name.as_deref(), Some("Lunch"));
            }
            other => panic!("expected advertisement, got {:?}", other),
        }
        assert!(central_events.try_recv().is_err());
        assert!(matches!(
            chat_events.recv().await,
            Some(PeripheralEvent::AdvertisingStarted(Ok(())))
        ));
    }

    #[tokio::test]
    async fn test_listeners_get_distinct_ports_in_dynamic_range() {
        let air = SimAir::new();
        let (mut first, mut first_events) = air.peripheral();
        let (mut second, mut second_events) = air.peripheral();
        first.open_socket_listener(true);
        second.open_socket_listener(true);

        let port = |event: Option<PeripheralEvent>| match event {
            Some(PeripheralEvent::SocketListenerOpened(Ok(psm))) => psm,
            other => panic!("expected listener, got {:?}", other),
        };
        let a = port(first_events.recv().await);
        let b = port(second_events.recv().await);
        assert_ne!(a, b);
        assert!(SIM_PSM_RANGE.contains(&a.0));
        assert!(SIM_PSM_RANGE.contains(&b.0));
    }

    #[tokio::test]
    async fn test_static_port_read_served_without_host() {
        let air = SimAir::new();
        let (mut host, mut host_events) = air.peripheral();
        let (mut central, mut central_events) = air.central();
        host.publish(ServiceDefinition::with_socket_port(Psm(0x0099)));
        host.start_advertising(Advertisement::for_chat("Lunch"));
        central.connect(host.id());

        let Some(CentralEvent::Connected(mut link)) = central_events.recv().await else {
            panic!("expected a link");
        };
        link.client.read(SOCKET_PORT_UUID);
        match link.events.recv().await {
            Some(PeerEvent::ValueRead { result, .. }) => {
                assert_eq!(result.unwrap(), Psm(0x0099).encode());
            }
            other => panic!("expected value, got {:?}", other),
        }

        assert!(matches!(
            host_events.recv().await,
            Some(PeripheralEvent::ServicePublished(Ok(())))
        ));
        assert!(matches!(
            host_events.recv().await,
            Some(PeripheralEvent::AdvertisingStarted(Ok(())))
        ));
        assert!(host_events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_power_off_drops_links() {
        let air = SimAir::new();
        let (mut host, _host_events) = air.peripheral();
        let (mut central, mut central_events) = air.central();
        host.start_advertising(Advertisement::for_chat("Lunch"));
        central.connect(host.id());
        let Some(CentralEvent::Connected(mut link)) = central_events.recv().await else {
            panic!("expected a link");
        };

        air.set_power(RadioPower::PoweredOff);
        assert_eq!(air.link_count(), 0);
        assert!(matches!(
            link.events.recv().await,
            Some(PeerEvent::Disconnected(Some(RadioError::PoweredOff)))
        ));
        assert!(matches!(
            central_events.recv().await,
            Some(CentralEvent::PowerChanged(RadioPower::PoweredOff))
        ));
    }
}
