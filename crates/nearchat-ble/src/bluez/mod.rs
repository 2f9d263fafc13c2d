//! BlueZ radio backend
//!
//! Drives the Linux Bluetooth stack through `bluer`. The radio traits are
//! synchronous and report completion as events, so each role keeps a driver
//! task that runs queued operations against the adapter in order and pushes
//! the results onto the owning engine's event channel.

mod central;
mod peripheral;

pub use central::BluezCentral;
pub use peripheral::BluezPeripheral;

use std::sync::Arc;

use futures::StreamExt;
use nearchat_core::{ChatConfig, RadioError, RadioPower};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::radio::{CentralEvent, PeripheralEvent};

pub(crate) fn radio_error(error: bluer::Error) -> RadioError {
    match error.kind {
        bluer::ErrorKind::NotReady => RadioError::PoweredOff,
        bluer::ErrorKind::NotAuthorized => RadioError::Unauthorized,
        _ => RadioError::Platform(error.to_string()),
    }
}

pub(crate) fn io_error(error: std::io::Error) -> RadioError {
    RadioError::Platform(error.to_string())
}

// ----------------------------------------------------------------------------
// Adapter
// ----------------------------------------------------------------------------

/// Session on the default BlueZ adapter
#[derive(Clone)]
pub struct BluezAdapter {
    _session: bluer::Session,
    adapter: bluer::Adapter,
    power: Arc<Mutex<RadioPower>>,
    /// Bytes buffered in each direction of an L2CAP channel
    channel_capacity: usize,
}

impl BluezAdapter {
    /// Connect to bluetoothd and power on the default adapter
    pub async fn open(config: &ChatConfig) -> Result<Self, RadioError> {
        let session = bluer::Session::new().await.map_err(radio_error)?;
        let adapter = session.default_adapter().await.map_err(radio_error)?;

        if !adapter.is_powered().await.unwrap_or(false) {
            adapter.set_powered(true).await.map_err(radio_error)?;
        }

        info!("Using Bluetooth adapter {}", adapter.name());
        Ok(Self {
            _session: session,
            adapter,
            power: Arc::new(Mutex::new(RadioPower::PoweredOn)),
            channel_capacity: config.write_buffer_size.max(1),
        })
    }

    /// Peripheral role radio and its event stream
    pub fn peripheral(&self) -> (BluezPeripheral, mpsc::UnboundedReceiver<PeripheralEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        self.watch_power({
            let events = events.clone();
            move |power| events.send(PeripheralEvent::PowerChanged(power)).is_ok()
        });
        (
            BluezPeripheral::new(
                self.adapter.clone(),
                self.power.clone(),
                events,
                self.channel_capacity,
            ),
            rx,
        )
    }

    /// Central role radio and its event stream
    pub fn central(&self) -> (BluezCentral, mpsc::UnboundedReceiver<CentralEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        self.watch_power({
            let events = events.clone();
            move |power| events.send(CentralEvent::PowerChanged(power)).is_ok()
        });
        (
            BluezCentral::new(
                self.adapter.clone(),
                self.power.clone(),
                events,
                self.channel_capacity,
            ),
            rx,
        )
    }

    /// Track the adapter's powered property until `report` says nobody listens
    fn watch_power<F>(&self, mut report: F)
    where
        F: FnMut(RadioPower) -> bool + Send + 'static,
    {
        let adapter = self.adapter.clone();
        let power = self.power.clone();
        tokio::spawn(async move {
            let mut events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    warn!("Cannot watch adapter power: {}", e);
                    return;
                }
            };

            while let Some(event) = events.next().await {
                if let bluer::AdapterEvent::PropertyChanged(bluer::AdapterProperty::Powered(on)) =
                    event
                {
                    let state = if on {
                        RadioPower::PoweredOn
                    } else {
                        RadioPower::PoweredOff
                    };
                    *power.lock() = state;
                    debug!("Adapter power changed: {:?}", state);
                    if !report(state) {
                        break;
                    }
                }
            }
        });
    }
}
