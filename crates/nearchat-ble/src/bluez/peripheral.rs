//! BlueZ peripheral role

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bluer::adv::AdvertisementHandle;
use bluer::gatt::local::{
    Application, ApplicationHandle, Characteristic, CharacteristicNotify,
    CharacteristicNotifyMethod, CharacteristicRead, CharacteristicReadRequest, CharacteristicWrite,
    CharacteristicWriteMethod, CharacteristicWriteRequest, ReqError, Service,
};
use bluer::l2cap::{Security, SecurityLevel, Socket, SocketAddr, Stream, StreamListener};
use nearchat_core::protocol::CharacteristicDefinition;
use nearchat_core::{
    Advertisement, AttStatus, PeerIdentity, Psm, RadioError, RadioPower, ServiceDefinition,
};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{io_error, radio_error};
use crate::pump::PumpedChannel;
use crate::radio::{
    AttResponse, AttWrite, ByteChannel, NotifyOutcome, PeripheralEvent, PeripheralRadio,
    ReadRequest, RequestId,
};

/// Notifications queued ahead of the subscriber before `notify` reports a full queue
const NOTIFY_QUEUE: usize = 16;

type PendingResponses = Arc<Mutex<HashMap<RequestId, oneshot::Sender<AttResponse>>>>;

fn req_error(status: AttStatus) -> ReqError {
    match status {
        AttStatus::InvalidOffset => ReqError::InvalidOffset,
        AttStatus::ReadNotPermitted | AttStatus::WriteNotPermitted => ReqError::NotPermitted,
        AttStatus::RequestNotSupported => ReqError::NotSupported,
        AttStatus::Success | AttStatus::UnlikelyError => ReqError::Failed,
    }
}

// ----------------------------------------------------------------------------
// Radio Handle
// ----------------------------------------------------------------------------

enum Op {
    OpenListener { encrypted: bool },
    CloseListener(Psm),
    Publish(ServiceDefinition),
    Unpublish,
    Advertise(Advertisement),
    StopAdvertising,
}

/// Peripheral radio on a BlueZ adapter
pub struct BluezPeripheral {
    power: Arc<Mutex<RadioPower>>,
    ops: mpsc::UnboundedSender<Op>,
    pending: PendingResponses,
    notifications: mpsc::Sender<Vec<u8>>,
    notify_blocked: Arc<AtomicBool>,
    subscribed: Arc<AtomicBool>,
}

impl BluezPeripheral {
    pub(crate) fn new(
        adapter: bluer::Adapter,
        power: Arc<Mutex<RadioPower>>,
        events: mpsc::UnboundedSender<PeripheralEvent>,
        channel_capacity: usize,
    ) -> Self {
        let (ops, ops_rx) = mpsc::unbounded_channel();
        let (notifications, notifications_rx) = mpsc::channel(NOTIFY_QUEUE);
        let pending = PendingResponses::default();
        let notify_blocked = Arc::new(AtomicBool::new(false));
        let subscribed = Arc::new(AtomicBool::new(false));

        let driver = Driver {
            adapter,
            events,
            pending: pending.clone(),
            notifications: Arc::new(tokio::sync::Mutex::new(notifications_rx)),
            notify_blocked: notify_blocked.clone(),
            subscribed: subscribed.clone(),
            channel_capacity,
            listener: None,
            application: None,
            advertisement: None,
        };
        tokio::spawn(driver.run(ops_rx));

        Self {
            power,
            ops,
            pending,
            notifications,
            notify_blocked,
            subscribed,
        }
    }

    fn queue(&self, op: Op) {
        if self.ops.send(op).is_err() {
            warn!("BlueZ peripheral driver has stopped");
        }
    }
}

impl PeripheralRadio for BluezPeripheral {
    fn power(&self) -> RadioPower {
        *self.power.lock()
    }

    fn open_socket_listener(&mut self, encrypted: bool) {
        self.queue(Op::OpenListener { encrypted });
    }

    fn close_socket_listener(&mut self, port: Psm) {
        self.queue(Op::CloseListener(port));
    }

    fn publish(&mut self, service: ServiceDefinition) {
        self.queue(Op::Publish(service));
    }

    fn unpublish_all(&mut self) {
        self.queue(Op::Unpublish);
    }

    fn start_advertising(&mut self, advertisement: Advertisement) {
        self.queue(Op::Advertise(advertisement));
    }

    fn stop_advertising(&mut self) {
        self.queue(Op::StopAdvertising);
    }

    fn respond(&mut self, request: RequestId, response: AttResponse) {
        match self.pending.lock().remove(&request) {
            Some(reply) => {
                let _ = reply.send(response);
            }
            None => debug!("No pending attribute request {:?}", request),
        }
    }

    fn notify(&mut self, _characteristic: Uuid, value: &[u8]) -> NotifyOutcome {
        if !self.subscribed.load(Ordering::Acquire) {
            return NotifyOutcome::Sent;
        }
        match self.notifications.try_send(value.to_vec()) {
            Ok(()) => NotifyOutcome::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.notify_blocked.store(true, Ordering::Release);
                NotifyOutcome::QueueFull
            }
            Err(mpsc::error::TrySendError::Closed(_)) => NotifyOutcome::Sent,
        }
    }
}

// ----------------------------------------------------------------------------
// Driver
// ----------------------------------------------------------------------------

struct Driver {
    adapter: bluer::Adapter,
    events: mpsc::UnboundedSender<PeripheralEvent>,
    pending: PendingResponses,
    notifications: Arc<tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>>,
    notify_blocked: Arc<AtomicBool>,
    subscribed: Arc<AtomicBool>,
    channel_capacity: usize,
    listener: Option<(Psm, JoinHandle<()>)>,
    application: Option<ApplicationHandle>,
    advertisement: Option<AdvertisementHandle>,
}

impl Driver {
    async fn run(mut self, mut ops: mpsc::UnboundedReceiver<Op>) {
        while let Some(op) = ops.recv().await {
            match op {
                Op::OpenListener { encrypted } => {
                    let result = self.open_listener(encrypted).await;
                    self.emit(PeripheralEvent::SocketListenerOpened(result));
                }
                Op::CloseListener(port) => {
                    if let Some((open, accept)) = self.listener.take() {
                        if open == port {
                            accept.abort();
                            debug!("Closed L2CAP listener {}", port);
                        } else {
                            self.listener = Some((open, accept));
                        }
                    }
                }
                Op::Publish(service) => {
                    let application = self.application(&service);
                    let result = self
                        .adapter
                        .serve_gatt_application(application)
                        .await
                        .map(|handle| {
                            self.application = Some(handle);
                            info!("Published GATT service {}", service.uuid);
                        })
                        .map_err(radio_error);
                    self.emit(PeripheralEvent::ServicePublished(result));
                }
                Op::Unpublish => {
                    self.application = None;
                }
                Op::Advertise(advertisement) => {
                    let advertisement = bluer::adv::Advertisement {
                        advertisement_type: bluer::adv::Type::Peripheral,
                        local_name: Some(advertisement.local_name),
                        services: advertisement.service_uuids.into_iter().collect(),
                        discoverable: Some(true),
                        connectable: Some(true),
                        ..Default::default()
                    };
                    let result = self
                        .adapter
                        .advertise(advertisement)
                        .await
                        .map(|handle| {
                            self.advertisement = Some(handle);
                        })
                        .map_err(radio_error);
                    self.emit(PeripheralEvent::AdvertisingStarted(result));
                }
                Op::StopAdvertising => {
                    self.advertisement = None;
                }
            }
        }

        if let Some((_, accept)) = self.listener.take() {
            accept.abort();
        }
        debug!("BlueZ peripheral driver stopped");
    }

    fn emit(&self, event: PeripheralEvent) {
        let _ = self.events.send(event);
    }

    async fn open_listener(&mut self, encrypted: bool) -> Result<Psm, RadioError> {
        let socket = Socket::<Stream>::new_stream().map_err(io_error)?;
        if encrypted {
            socket
                .set_security(Security {
                    level: SecurityLevel::Medium,
                    key_size: 0,
                })
                .map_err(io_error)?;
        }

        let address = self.adapter.address().await.map_err(radio_error)?;
        socket
            .bind(SocketAddr::new(address, bluer::AddressType::LePublic, 0))
            .map_err(io_error)?;
        let listener = socket.listen(1).map_err(io_error)?;
        let port = Psm(listener.as_ref().local_addr().map_err(io_error)?.psm);

        if let Some((_, previous)) = self.listener.take() {
            previous.abort();
        }
        let accept = tokio::spawn(accept_loop(
            listener,
            self.events.clone(),
            self.channel_capacity,
        ));
        self.listener = Some((port, accept));
        info!("L2CAP listener on {} (encrypted: {})", port, encrypted);
        Ok(port)
    }

    fn application(&self, service: &ServiceDefinition) -> Application {
        let characteristics = service
            .characteristics
            .iter()
            .map(|definition| self.characteristic(definition))
            .collect();

        Application {
            services: vec![Service {
                uuid: service.uuid,
                primary: true,
                characteristics,
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn characteristic(&self, definition: &CharacteristicDefinition) -> Characteristic {
        let uuid = definition.spec.uuid;
        let properties = definition.spec.properties;

        let read = properties.read.then(|| match definition.value.clone() {
            Some(value) => CharacteristicRead {
                read: true,
                fun: Box::new(move |_req: CharacteristicReadRequest| {
                    let value = value.clone();
                    Box::pin(async move { Ok(value) })
                }),
                ..Default::default()
            },
            None => {
                let pending = self.pending.clone();
                let events = self.events.clone();
                CharacteristicRead {
                    read: true,
                    fun: Box::new(move |req: CharacteristicReadRequest| {
                        let pending = pending.clone();
                        let events = events.clone();
                        Box::pin(async move { forward_read(uuid, req, pending, events).await })
                    }),
                    ..Default::default()
                }
            }
        });

        let write = (properties.write || properties.write_without_response).then(|| {
            let pending = self.pending.clone();
            let events = self.events.clone();
            CharacteristicWrite {
                write: properties.write,
                write_without_response: properties.write_without_response,
                method: CharacteristicWriteMethod::Fun(Box::new(
                    move |value: Vec<u8>, req: CharacteristicWriteRequest| {
                        let pending = pending.clone();
                        let events = events.clone();
                        Box::pin(async move {
                            forward_write(uuid, value, req, pending, events).await
                        })
                    },
                )),
                ..Default::default()
            }
        });

        let notify = properties.notify.then(|| {
            let events = self.events.clone();
            let notifications = self.notifications.clone();
            let notify_blocked = self.notify_blocked.clone();
            let subscribed = self.subscribed.clone();
            CharacteristicNotify {
                notify: true,
                method: CharacteristicNotifyMethod::Fun(Box::new(move |mut notifier| {
                    let events = events.clone();
                    let notifications = notifications.clone();
                    let notify_blocked = notify_blocked.clone();
                    let subscribed = subscribed.clone();
                    Box::pin(async move {
                        // BlueZ does not name the subscribing central
                        let central = PeerIdentity::from_address([0; 6]);
                        subscribed.store(true, Ordering::Release);
                        let _ = events.send(PeripheralEvent::SubscriptionChanged {
                            central,
                            characteristic: uuid,
                            subscribed: true,
                        });

                        loop {
                            let value = {
                                let mut rx = notifications.lock().await;
                                tokio::select! {
                                    value = rx.recv() => value,
                                    _ = notifier.stopped() => None,
                                }
                            };
                            let Some(value) = value else { break };
                            if let Err(e) = notifier.notify(value).await {
                                debug!("Notification on {} failed: {}", uuid, e);
                                break;
                            }
                            if notify_blocked.swap(false, Ordering::AcqRel) {
                                let _ = events.send(PeripheralEvent::ReadyToUpdateSubscribers);
                            }
                        }

                        subscribed.store(false, Ordering::Release);
                        let _ = events.send(PeripheralEvent::SubscriptionChanged {
                            central,
                            characteristic: uuid,
                            subscribed: false,
                        });
                    })
                })),
                ..Default::default()
            }
        });

        Characteristic {
            uuid,
            read,
            write,
            notify,
            ..Default::default()
        }
    }
}

// ----------------------------------------------------------------------------
// Request Forwarding
// ----------------------------------------------------------------------------

async fn await_response(
    request: RequestId,
    reply: oneshot::Receiver<AttResponse>,
    pending: &PendingResponses,
) -> Result<AttResponse, ReqError> {
    match reply.await {
        Ok(response) if response.status.is_success() => Ok(response),
        Ok(response) => Err(req_error(response.status)),
        Err(_) => {
            pending.lock().remove(&request);
            Err(ReqError::Failed)
        }
    }
}

async fn forward_read(
    characteristic: Uuid,
    req: CharacteristicReadRequest,
    pending: PendingResponses,
    events: mpsc::UnboundedSender<PeripheralEvent>,
) -> Result<Vec<u8>, ReqError> {
    let id = RequestId::next();
    let (reply, response) = oneshot::channel();
    pending.lock().insert(id, reply);

    let request = ReadRequest {
        id,
        central: PeerIdentity::from_address(req.device_address.0),
        characteristic,
        offset: usize::from(req.offset),
    };
    if events.send(PeripheralEvent::ReadRequest(request)).is_err() {
        pending.lock().remove(&id);
        return Err(ReqError::Failed);
    }

    let response = await_response(id, response, &pending).await?;
    Ok(response.value.unwrap_or_default())
}

async fn forward_write(
    characteristic: Uuid,
    value: Vec<u8>,
    req: CharacteristicWriteRequest,
    pending: PendingResponses,
    events: mpsc::UnboundedSender<PeripheralEvent>,
) -> Result<(), ReqError> {
    let id = RequestId::next();
    let (reply, response) = oneshot::channel();
    pending.lock().insert(id, reply);

    let writes = vec![AttWrite {
        central: PeerIdentity::from_address(req.device_address.0),
        characteristic,
        offset: usize::from(req.offset),
        value,
    }];
    if events
        .send(PeripheralEvent::WriteRequests {
            request: id,
            writes,
        })
        .is_err()
    {
        pending.lock().remove(&id);
        return Err(ReqError::Failed);
    }

    await_response(id, response, &pending).await.map(|_| ())
}

async fn accept_loop(
    listener: StreamListener,
    events: mpsc::UnboundedSender<PeripheralEvent>,
    capacity: usize,
) {
    loop {
        let result = match listener.accept().await {
            Ok((stream, peer)) => {
                info!("Accepted L2CAP channel from {}", peer.addr);
                let channel = PumpedChannel::spawn(stream, events.clone(), capacity);
                Ok(Box::new(channel) as Box<dyn ByteChannel>)
            }
            Err(e) => Err(io_error(e)),
        };

        let failed = result.is_err();
        if events.send(PeripheralEvent::SocketChannelOpened(result)).is_err() || failed {
            break;
        }
    }
}
