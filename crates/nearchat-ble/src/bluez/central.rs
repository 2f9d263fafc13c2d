//! BlueZ central role

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bluer::gatt::remote::{Characteristic, CharacteristicWriteRequest, Service, WriteOp};
use bluer::l2cap::{SocketAddr, Stream};
use bluer::{
    AdapterEvent, Address, DeviceEvent, DeviceProperty, DiscoveryFilter, DiscoveryTransport,
};
use futures::{pin_mut, StreamExt};
use nearchat_core::{PeerIdentity, Psm, RadioError, RadioPower};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{io_error, radio_error};
use crate::pump::PumpedChannel;
use crate::radio::{
    AdvertisementObservation, ByteChannel, CentralEvent, CentralRadio, GattClient, PeerEvent,
    PeerLink, WriteKind,
};

/// Poll interval while BlueZ resolves a new link's services
const RESOLVE_POLL: Duration = Duration::from_millis(100);
const RESOLVE_ATTEMPTS: usize = 100;

// ----------------------------------------------------------------------------
// Central Radio
// ----------------------------------------------------------------------------

/// Central radio on a BlueZ adapter
pub struct BluezCentral {
    adapter: bluer::Adapter,
    power: Arc<Mutex<RadioPower>>,
    events: mpsc::UnboundedSender<CentralEvent>,
    channel_capacity: usize,
    scan: Option<JoinHandle<()>>,
    connects: HashMap<PeerIdentity, JoinHandle<()>>,
}

impl BluezCentral {
    pub(crate) fn new(
        adapter: bluer::Adapter,
        power: Arc<Mutex<RadioPower>>,
        events: mpsc::UnboundedSender<CentralEvent>,
        channel_capacity: usize,
    ) -> Self {
        Self {
            adapter,
            power,
            events,
            channel_capacity,
            scan: None,
            connects: HashMap::new(),
        }
    }
}

impl CentralRadio for BluezCentral {
    fn power(&self) -> RadioPower {
        *self.power.lock()
    }

    fn start_scan(&mut self, services: &[Uuid]) {
        self.stop_scan();
        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let services: HashSet<Uuid> = services.iter().copied().collect();
        self.scan = Some(tokio::spawn(async move {
            if let Err(e) = scan(adapter, services, events).await {
                warn!("Scan ended: {}", e);
            }
        }));
    }

    fn stop_scan(&mut self) {
        if let Some(scan) = self.scan.take() {
            scan.abort();
            debug!("Stopped scanning");
        }
    }

    fn connect(&mut self, peer: PeerIdentity) {
        let Some(address) = peer.to_address() else {
            let _ = self.events.send(CentralEvent::ConnectFailed {
                peer,
                error: RadioError::Platform(format!("{} has no device address", peer)),
            });
            return;
        };

        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let capacity = self.channel_capacity;
        let attempt = tokio::spawn(async move {
            let event = match connect(&adapter, Address(address)).await {
                Ok(device) => {
                    CentralEvent::Connected(BluezGattClient::link(peer, device, capacity))
                }
                Err(error) => CentralEvent::ConnectFailed { peer, error },
            };
            let _ = events.send(event);
        });

        if let Some(previous) = self.connects.insert(peer, attempt) {
            previous.abort();
        }
        self.connects.retain(|_, attempt| !attempt.is_finished());
    }

    fn cancel_connect(&mut self, peer: PeerIdentity) {
        if let Some(attempt) = self.connects.remove(&peer) {
            attempt.abort();
            debug!("Cancelled connect to {}", peer);
        }
    }
}

impl Drop for BluezCentral {
    fn drop(&mut self) {
        self.stop_scan();
        for (_, attempt) in self.connects.drain() {
            attempt.abort();
        }
    }
}

async fn scan(
    adapter: bluer::Adapter,
    services: HashSet<Uuid>,
    events: mpsc::UnboundedSender<CentralEvent>,
) -> bluer::Result<()> {
    adapter
        .set_discovery_filter(DiscoveryFilter {
            uuids: services.clone(),
            transport: DiscoveryTransport::Le,
            ..Default::default()
        })
        .await?;

    let discovered = adapter.discover_devices().await?;
    pin_mut!(discovered);
    info!("Scanning for {} service(s)", services.len());

    while let Some(event) = discovered.next().await {
        let AdapterEvent::DeviceAdded(address) = event else {
            continue;
        };
        let device = adapter.device(address)?;
        let service_uuids: Vec<Uuid> = device
            .uuids()
            .await?
            .unwrap_or_default()
            .into_iter()
            .collect();
        if !services.is_empty() && !service_uuids.iter().any(|uuid| services.contains(uuid)) {
            continue;
        }

        let observation = AdvertisementObservation {
            peer: PeerIdentity::from_address(address.0),
            local_name: device.name().await.ok().flatten(),
            service_uuids,
            rssi: device.rssi().await.ok().flatten(),
        };
        if events.send(CentralEvent::Advertisement(observation)).is_err() {
            break;
        }
    }
    Ok(())
}

async fn connect(adapter: &bluer::Adapter, address: Address) -> Result<bluer::Device, RadioError> {
    let device = adapter.device(address).map_err(radio_error)?;
    if !device.is_connected().await.unwrap_or(false) {
        device.connect().await.map_err(radio_error)?;
    }
    info!("Connected to {}", address);
    Ok(device)
}

// ----------------------------------------------------------------------------
// GATT Client
// ----------------------------------------------------------------------------

enum Op {
    DiscoverServices(Vec<Uuid>),
    DiscoverCharacteristics(Uuid, Vec<Uuid>),
    DiscoverDescriptors(Uuid),
    SetNotify(Uuid, bool),
    Read(Uuid),
    Write(Uuid, Vec<u8>, WriteKind),
    OpenSocket(Psm),
    Cancel,
}

/// GATT client for one connected BlueZ device
pub struct BluezGattClient {
    ops: mpsc::UnboundedSender<Op>,
}

impl BluezGattClient {
    fn link(peer: PeerIdentity, device: bluer::Device, channel_capacity: usize) -> PeerLink {
        let (events, rx) = mpsc::unbounded_channel();
        let (ops, ops_rx) = mpsc::unbounded_channel();

        tokio::spawn(watch_device(device.clone(), events.clone()));
        let driver = ClientDriver {
            device,
            events,
            channel_capacity,
            services: HashMap::new(),
            characteristics: HashMap::new(),
            notifications: HashMap::new(),
        };
        tokio::spawn(driver.run(ops_rx));

        PeerLink {
            peer,
            client: Box::new(Self { ops }),
            events: rx,
        }
    }

    fn queue(&self, op: Op) {
        if self.ops.send(op).is_err() {
            warn!("BlueZ client driver has stopped");
        }
    }
}

impl GattClient for BluezGattClient {
    fn discover_services(&mut self, services: &[Uuid]) {
        self.queue(Op::DiscoverServices(services.to_vec()));
    }

    fn discover_characteristics(&mut self, service: Uuid, characteristics: &[Uuid]) {
        self.queue(Op::DiscoverCharacteristics(service, characteristics.to_vec()));
    }

    fn discover_descriptors(&mut self, characteristic: Uuid) {
        self.queue(Op::DiscoverDescriptors(characteristic));
    }

    fn set_notify(&mut self, characteristic: Uuid, enabled: bool) {
        self.queue(Op::SetNotify(characteristic, enabled));
    }

    fn read(&mut self, characteristic: Uuid) {
        self.queue(Op::Read(characteristic));
    }

    fn write(&mut self, characteristic: Uuid, value: &[u8], kind: WriteKind) {
        self.queue(Op::Write(characteristic, value.to_vec(), kind));
    }

    fn open_socket_channel(&mut self, port: Psm) {
        self.queue(Op::OpenSocket(port));
    }

    fn cancel_connection(&mut self) {
        self.queue(Op::Cancel);
    }
}

struct ClientDriver {
    device: bluer::Device,
    events: mpsc::UnboundedSender<PeerEvent>,
    channel_capacity: usize,
    services: HashMap<Uuid, Service>,
    characteristics: HashMap<Uuid, Characteristic>,
    notifications: HashMap<Uuid, JoinHandle<()>>,
}

impl ClientDriver {
    async fn run(mut self, mut ops: mpsc::UnboundedReceiver<Op>) {
        while let Some(op) = ops.recv().await {
            match op {
                Op::DiscoverServices(filter) => {
                    let result = self.discover_services(&filter).await;
                    self.emit(PeerEvent::ServicesDiscovered(result));
                }
                Op::DiscoverCharacteristics(service, filter) => {
                    let result = self.discover_characteristics(service, &filter).await;
                    self.emit(PeerEvent::CharacteristicsDiscovered { service, result });
                }
                Op::DiscoverDescriptors(characteristic) => {
                    let result = self.discover_descriptors(characteristic).await;
                    self.emit(PeerEvent::DescriptorsDiscovered {
                        characteristic,
                        result,
                    });
                }
                Op::SetNotify(characteristic, enabled) => {
                    let result = self.set_notify(characteristic, enabled).await;
                    self.emit(PeerEvent::NotificationStateChanged {
                        characteristic,
                        result,
                    });
                }
                Op::Read(characteristic) => {
                    let result = match self.characteristic(characteristic) {
                        Ok(remote) => remote.read().await.map_err(radio_error),
                        Err(e) => Err(e),
                    };
                    self.emit(PeerEvent::ValueRead {
                        characteristic,
                        result,
                    });
                }
                Op::Write(characteristic, value, kind) => {
                    let op_type = match kind {
                        WriteKind::WithResponse => WriteOp::Request,
                        WriteKind::WithoutResponse => WriteOp::Command,
                    };
                    let result = match self.characteristic(characteristic) {
                        Ok(remote) => remote
                            .write_ext(
                                &value,
                                &CharacteristicWriteRequest {
                                    op_type,
                                    ..Default::default()
                                },
                            )
                            .await
                            .map_err(radio_error),
                        Err(e) => Err(e),
                    };
                    match kind {
                        WriteKind::WithResponse => self.emit(PeerEvent::WriteCompleted {
                            characteristic,
                            result,
                        }),
                        WriteKind::WithoutResponse => {
                            if let Err(e) = result {
                                debug!(
                                    "Write without response to {} failed: {}",
                                    characteristic, e
                                );
                            }
                        }
                    }
                }
                Op::OpenSocket(port) => {
                    let result = self.open_socket(port).await;
                    self.emit(PeerEvent::SocketChannelOpened(result));
                }
                Op::Cancel => {
                    if let Err(e) = self.device.disconnect().await {
                        debug!("Disconnect failed: {}", e);
                    }
                    self.emit(PeerEvent::Disconnected(None));
                    break;
                }
            }
        }

        for (_, forward) in self.notifications.drain() {
            forward.abort();
        }
    }

    fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic, RadioError> {
        self.characteristics
            .get(&uuid)
            .cloned()
            .ok_or(RadioError::AttributeNotFound { uuid })
    }

    async fn discover_services(&mut self, filter: &[Uuid]) -> Result<Vec<Uuid>, RadioError> {
        for _ in 0..RESOLVE_ATTEMPTS {
            if self.device.is_services_resolved().await.map_err(radio_error)? {
                break;
            }
            tokio::time::sleep(RESOLVE_POLL).await;
        }

        let mut found = Vec::new();
        for service in self.device.services().await.map_err(radio_error)? {
            let uuid = service.uuid().await.map_err(radio_error)?;
            if filter.is_empty() || filter.contains(&uuid) {
                found.push(uuid);
                self.services.insert(uuid, service);
            }
        }
        Ok(found)
    }

    async fn discover_characteristics(
        &mut self,
        service: Uuid,
        filter: &[Uuid],
    ) -> Result<Vec<Uuid>, RadioError> {
        let remote = self
            .services
            .get(&service)
            .ok_or(RadioError::AttributeNotFound { uuid: service })?;

        let mut found = Vec::new();
        for characteristic in remote.characteristics().await.map_err(radio_error)? {
            let uuid = characteristic.uuid().await.map_err(radio_error)?;
            if filter.is_empty() || filter.contains(&uuid) {
                found.push(uuid);
                self.characteristics.insert(uuid, characteristic);
            }
        }
        Ok(found)
    }

    async fn discover_descriptors(&self, characteristic: Uuid) -> Result<Vec<Uuid>, RadioError> {
        let remote = self.characteristic(characteristic)?;
        let mut found = Vec::new();
        for descriptor in remote.descriptors().await.map_err(radio_error)? {
            found.push(descriptor.uuid().await.map_err(radio_error)?);
        }
        Ok(found)
    }

    async fn set_notify(
        &mut self,
        characteristic: Uuid,
        enabled: bool,
    ) -> Result<bool, RadioError> {
        if let Some(forward) = self.notifications.remove(&characteristic) {
            forward.abort();
        }
        if !enabled {
            return Ok(false);
        }

        let remote = self.characteristic(characteristic)?;
        let values = remote.notify().await.map_err(radio_error)?;
        let events = self.events.clone();
        let forward = tokio::spawn(async move {
            pin_mut!(values);
            while let Some(value) = values.next().await {
                if events
                    .send(PeerEvent::Notification {
                        characteristic,
                        value,
                    })
                    .is_err()
                {
                    break;
                }
            }
        });
        self.notifications.insert(characteristic, forward);
        Ok(true)
    }

    async fn open_socket(&self, port: Psm) -> Result<Box<dyn ByteChannel>, RadioError> {
        let address_type = self.device.address_type().await.map_err(radio_error)?;
        let target = SocketAddr::new(self.device.address(), address_type, port.0);
        let stream = Stream::connect(target).await.map_err(io_error)?;
        info!("L2CAP channel open to {} on {}", self.device.address(), port);
        Ok(Box::new(PumpedChannel::spawn(
            stream,
            self.events.clone(),
            self.channel_capacity,
        )))
    }
}

/// Report link loss and service changes the driver did not ask for
async fn watch_device(device: bluer::Device, events: mpsc::UnboundedSender<PeerEvent>) {
    let changes = match device.events().await {
        Ok(changes) => changes,
        Err(e) => {
            warn!("Cannot watch {}: {}", device.address(), e);
            return;
        }
    };
    pin_mut!(changes);

    while let Some(DeviceEvent::PropertyChanged(property)) = changes.next().await {
        let event = match property {
            DeviceProperty::Connected(false) => {
                PeerEvent::Disconnected(Some(RadioError::Platform("link lost".to_string())))
            }
            DeviceProperty::ServicesResolved(false) => PeerEvent::ServicesInvalidated,
            _ => continue,
        };
        let done = matches!(event, PeerEvent::Disconnected(_));
        if events.send(event).is_err() || done {
            break;
        }
    }
}
