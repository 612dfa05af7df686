pub mod fms;

use std::collections::HashSet;
use std::time::Duration;

use anyhow::{anyhow, Result as AnyhowResult};
use btleplug::api::{Central, Characteristic as BtCharacteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures_util::stream::StreamExt;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::{BridgeError, Result};
use crate::model::{DeviceDescriptor, Kind, Origin};

pub use fms::{Characteristic, FmsCodec};

#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Scanning,
    Connecting { address: String },
    Connected { address: String },
    Disconnected { address: String },
    Error(String),
}

/// Thin wrapper over a `btleplug` central adapter. Owns scanning, connecting,
/// and subscribing to one of the two FTMS data characteristics; knows
/// nothing about workouts or samples.
pub struct BleTransport {
    adapter: Adapter,
    events_tx: broadcast::Sender<ConnectionEvent>,
}

impl BleTransport {
    pub async fn new() -> AnyhowResult<(Self, broadcast::Receiver<ConnectionEvent>)> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        let adapter = adapters
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("no BLE adapter found"))?;
        let (events_tx, events_rx) = broadcast::channel(16);
        Ok((Self { adapter, events_tx }, events_rx))
    }

    /// Scan for up to `scan_secs` seconds, returning every peripheral seen
    /// that advertises a local name. `name_filter`, if set, keeps only
    /// devices whose advertised name contains it.
    pub async fn discover(&self, scan_secs: u64, name_filter: Option<&str>) -> Result<Vec<DeviceDescriptor>> {
        let _ = self.events_tx.send(ConnectionEvent::Scanning);
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| BridgeError::Transport(e.to_string()))?;

        let mut seen: HashSet<String> = HashSet::new();
        let mut found = Vec::new();

        for _ in 0..scan_secs.max(1) {
            sleep(Duration::from_secs(1)).await;
            let peripherals = self.adapter.peripherals().await.map_err(|e| BridgeError::Transport(e.to_string()))?;
            for peripheral in peripherals {
                let Ok(Some(props)) = peripheral.properties().await else {
                    continue;
                };
                let Some(name) = props.local_name else { continue };
                if !seen.insert(name.clone()) {
                    continue;
                }
                if let Some(filter) = name_filter {
                    if !name.contains(filter) {
                        continue;
                    }
                }
                debug!("discovered BLE device: '{}' ({})", name, props.address);
                found.push(DeviceDescriptor {
                    address: props.address.to_string(),
                    name: name.clone(),
                    kind: Kind::infer_from_name(&name),
                    rssi: props.rssi,
                    origin: Origin::Live,
                });
            }
        }

        self.adapter.stop_scan().await.map_err(|e| BridgeError::Transport(e.to_string()))?;
        if found.is_empty() {
            warn!("no FMS devices discovered in {}s scan window", scan_secs);
        }
        Ok(found)
    }

    /// Connect to `address`, discover services, and subscribe to whichever
    /// of the Indoor Bike Data / Rower Data characteristics it exposes.
    /// Returns the connected peripheral and which characteristic matched.
    pub async fn connect(&self, address: &str) -> Result<(Peripheral, Characteristic)> {
        let _ = self.events_tx.send(ConnectionEvent::Connecting { address: address.to_string() });

        let peripherals = self.adapter.peripherals().await.map_err(|e| BridgeError::Transport(e.to_string()))?;
        let peripheral = peripherals
            .into_iter()
            .find(|p| p.address().to_string() == address)
            .ok_or(BridgeError::NotFound)?;

        peripheral.connect().await.map_err(|e| BridgeError::Transport(e.to_string()))?;
        peripheral.discover_services().await.map_err(|e| BridgeError::Transport(e.to_string()))?;
        let chars = peripheral.characteristics();

        info!("discovered {} characteristics on {}", chars.len(), address);
        for c in &chars {
            debug!("  service={} characteristic={}", c.service_uuid, c.uuid);
        }

        let (bt_char, kind) = chars
            .iter()
            .find_map(|c| Characteristic::from_uuid(c.uuid).map(|k| (c.clone(), k)))
            .ok_or(BridgeError::Unsupported)?;

        peripheral.subscribe(&bt_char).await.map_err(|e| BridgeError::Transport(e.to_string()))?;
        let _ = self.events_tx.send(ConnectionEvent::Connected { address: address.to_string() });
        Ok((peripheral, kind))
    }

    /// Re-establish a dropped connection on the same peripheral handle:
    /// reconnect, rediscover services, and resubscribe to `characteristic`.
    /// Used by the device source façade's reconnect-with-backoff policy.
    pub async fn resubscribe(&self, peripheral: &Peripheral, characteristic: Characteristic) -> AnyhowResult<()> {
        peripheral.connect().await?;
        peripheral.discover_services().await?;
        let uuid = match characteristic {
            Characteristic::IndoorBikeData => fms::INDOOR_BIKE_DATA_UUID,
            Characteristic::RowerData => fms::ROWER_DATA_UUID,
        };
        let bt_char = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| anyhow!("characteristic disappeared across reconnect"))?;
        peripheral.subscribe(&bt_char).await?;
        Ok(())
    }

    pub async fn disconnect(&self, peripheral: &Peripheral) -> AnyhowResult<()> {
        let address = peripheral.address().to_string();
        peripheral.disconnect().await?;
        let _ = self.events_tx.send(ConnectionEvent::Disconnected { address });
        Ok(())
    }

    /// Stream raw notification payloads for `characteristic` until the
    /// connection drops. The caller feeds each payload into an [`FmsCodec`].
    pub async fn notifications(
        &self,
        peripheral: &Peripheral,
        characteristic: Characteristic,
        mut on_payload: impl FnMut(&[u8]),
    ) -> AnyhowResult<()> {
        let uuid = match characteristic {
            Characteristic::IndoorBikeData => fms::INDOOR_BIKE_DATA_UUID,
            Characteristic::RowerData => fms::ROWER_DATA_UUID,
        };
        let mut stream = peripheral.notifications().await?;
        while let Some(notification) = stream.next().await {
            if notification.uuid != uuid {
                continue;
            }
            on_payload(&notification.value);
        }
        Ok(())
    }

    #[allow(dead_code)]
    async fn write(&self, peripheral: &Peripheral, characteristic: &BtCharacteristic, data: &[u8]) -> AnyhowResult<()> {
        peripheral.write(characteristic, data, WriteType::WithResponse).await?;
        Ok(())
    }
}
