//! Unifies a live BLE device and the deterministic simulator behind one
//! capability set, per the `Source = Live | Simulated` sum-type design.
//! The façade is selected once at construction, not per call.

pub mod simulator;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result as AnyhowResult;
use btleplug::api::Peripheral as _;
use btleplug::platform::Peripheral;
use tokio::sync::{broadcast, Mutex};
use tokio::time::sleep;
use tracing::warn;

use crate::ble::{BleTransport, Characteristic, FmsCodec};
use crate::error::{BridgeError, Result};
use crate::model::{DeviceDescriptor, Kind, Origin, Sample};
use simulator::Simulator;

/// 1s, 2s, 4s, 8s, cap 30s.
fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(2u64.saturating_pow(attempt).min(30))
}

const RECONNECT_BUDGET: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceEvent {
    Scanning,
    Connecting { address: String },
    Connected { address: String },
    Reconnecting { address: String, attempt: u32 },
    /// Transport dropped and the reconnect budget was exhausted while a
    /// workout was active; the manager must transition it to `aborted`.
    Aborted { address: String },
    Disconnected,
}

struct Connected {
    peripheral: Peripheral,
    notify_task: tokio::task::JoinHandle<()>,
}

enum Backend {
    Live {
        transport: Arc<BleTransport>,
        name_filter: String,
        scan_secs: u64,
        connected: Mutex<Option<Connected>>,
    },
    Simulated {
        simulator: Arc<Mutex<Simulator>>,
        tick_task: tokio::task::JoinHandle<()>,
    },
}

/// Device source façade consumed by the workout manager.
pub struct Source {
    backend: Backend,
    sample_tx: broadcast::Sender<Sample>,
    event_tx: broadcast::Sender<SourceEvent>,
    workout_active: Arc<AtomicBool>,
    current_device: Mutex<Option<DeviceDescriptor>>,
}

impl Source {
    pub async fn new_live(
        name_filter: String,
        scan_secs: u64,
    ) -> AnyhowResult<(Self, broadcast::Receiver<Sample>, broadcast::Receiver<SourceEvent>)> {
        let (transport, _conn_rx) = BleTransport::new().await?;
        let (sample_tx, sample_rx) = broadcast::channel(128);
        let (event_tx, event_rx) = broadcast::channel(32);
        let source = Self {
            backend: Backend::Live {
                transport: Arc::new(transport),
                name_filter,
                scan_secs,
                connected: Mutex::new(None),
            },
            sample_tx,
            event_tx,
            workout_active: Arc::new(AtomicBool::new(false)),
            current_device: Mutex::new(None),
        };
        Ok((source, sample_rx, event_rx))
    }

    pub fn new_simulated(kind: Kind) -> (Self, broadcast::Receiver<Sample>, broadcast::Receiver<SourceEvent>) {
        let (sample_tx, sample_rx) = broadcast::channel(128);
        let (event_tx, event_rx) = broadcast::channel(32);
        let workout_active = Arc::new(AtomicBool::new(false));
        let simulator = Arc::new(Mutex::new(Simulator::new(kind)));

        let tick_task = {
            let simulator = simulator.clone();
            let sample_tx = sample_tx.clone();
            let workout_active = workout_active.clone();
            tokio::spawn(async move {
                loop {
                    sleep(Duration::from_secs(1)).await;
                    if !workout_active.load(Ordering::SeqCst) {
                        continue;
                    }
                    let sample = simulator.lock().await.tick();
                    if let Some(sample) = sample {
                        let _ = sample_tx.send(sample);
                    }
                }
            })
        };

        let device = DeviceDescriptor {
            address: "simulator".to_string(),
            name: match kind {
                Kind::Rower => "Simulated Rower".to_string(),
                _ => "Simulated Bike".to_string(),
            },
            kind,
            rssi: None,
            origin: crate::model::Origin::Simulated,
        };

        let source = Self {
            backend: Backend::Simulated { simulator, tick_task },
            sample_tx,
            event_tx,
            workout_active,
            current_device: Mutex::new(Some(device)),
        };
        (source, sample_rx, event_rx)
    }

    pub fn subscribe_samples(&self) -> broadcast::Receiver<Sample> {
        self.sample_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SourceEvent> {
        self.event_tx.subscribe()
    }

    /// Unions a live scan and simulated entries, per the façade's discover
    /// contract. The simulator contributes no entries of its own; selecting
    /// it is an explicit construction-time choice, not a discovery result.
    pub async fn discover(&self, scan_secs: Option<u64>) -> Result<Vec<DeviceDescriptor>> {
        match &self.backend {
            Backend::Live { transport, name_filter, scan_secs: default_secs, .. } => {
                let _ = self.event_tx.send(SourceEvent::Scanning);
                let secs = scan_secs.unwrap_or(*default_secs);
                let filter = (!name_filter.is_empty()).then(|| name_filter.as_str());
                transport.discover(secs, filter).await
            }
            Backend::Simulated { .. } => Ok(Vec::new()),
        }
    }

    /// A second `connect` call while already connected — to the same or a
    /// different address — is rejected with `AlreadyConnected` rather than
    /// silently succeeding; callers must `disconnect` first.
    pub async fn connect(&self, address: &str) -> Result<()> {
        match &self.backend {
            Backend::Live { transport, connected, .. } => {
                let mut guard = connected.lock().await;
                if guard.is_some() {
                    return Err(BridgeError::AlreadyConnected);
                }
                let _ = self.event_tx.send(SourceEvent::Connecting { address: address.to_string() });
                let (peripheral, characteristic) = transport.connect(address).await?;
                let name = peripheral
                    .properties()
                    .await
                    .ok()
                    .flatten()
                    .and_then(|p| p.local_name)
                    .unwrap_or_else(|| address.to_string());
                let kind = match characteristic {
                    Characteristic::IndoorBikeData => Kind::Bike,
                    Characteristic::RowerData => Kind::Rower,
                };
                *self.current_device.lock().await = Some(DeviceDescriptor {
                    address: address.to_string(),
                    name,
                    kind,
                    rssi: None,
                    origin: Origin::Live,
                });
                let notify_task = spawn_notify_task(
                    transport.clone(),
                    peripheral.clone(),
                    characteristic,
                    address.to_string(),
                    self.sample_tx.clone(),
                    self.event_tx.clone(),
                    self.workout_active.clone(),
                );
                *guard = Some(Connected { peripheral, notify_task });
                let _ = self.event_tx.send(SourceEvent::Connected { address: address.to_string() });
                Ok(())
            }
            Backend::Simulated { .. } => Ok(()),
        }
    }

    /// The currently connected or selected device, if any. For the
    /// simulated backend this is always the fixed simulated descriptor.
    pub async fn connected_device(&self) -> Option<DeviceDescriptor> {
        match &self.backend {
            Backend::Live { connected, .. } => {
                let guard = connected.lock().await;
                if guard.is_some() {
                    self.current_device.lock().await.clone()
                } else {
                    None
                }
            }
            Backend::Simulated { .. } => self.current_device.lock().await.clone(),
        }
    }

    pub async fn disconnect(&self) -> Result<()> {
        match &self.backend {
            Backend::Live { transport, connected, .. } => {
                let mut guard = connected.lock().await;
                if let Some(conn) = guard.take() {
                    conn.notify_task.abort();
                    *self.current_device.lock().await = None;
                    transport.disconnect(&conn.peripheral).await?;
                }
                Ok(())
            }
            Backend::Simulated { .. } => Ok(()),
        }
    }

    /// Forwards to the backend; for live BLE this is a no-op at the
    /// protocol level (FMS broadcasts continuously) but gates whether a
    /// dropped connection triggers the reconnect policy. For the simulated
    /// backend this also arms the simulator itself, since `Simulator::tick`
    /// stays dormant until its own `running` flag is set.
    pub async fn begin_workout(&self) {
        self.workout_active.store(true, Ordering::SeqCst);
        if let Backend::Simulated { simulator, .. } = &self.backend {
            simulator.lock().await.begin_workout();
        }
    }

    pub async fn end_workout(&self) {
        self.workout_active.store(false, Ordering::SeqCst);
        if let Backend::Simulated { simulator, .. } = &self.backend {
            if let Some(sample) = simulator.lock().await.end_workout() {
                let _ = self.sample_tx.send(sample);
            }
        }
    }
}

impl Drop for Source {
    fn drop(&mut self) {
        if let Backend::Simulated { tick_task, .. } = &self.backend {
            tick_task.abort();
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_notify_task(
    transport: Arc<BleTransport>,
    peripheral: Peripheral,
    characteristic: Characteristic,
    address: String,
    sample_tx: broadcast::Sender<Sample>,
    event_tx: broadcast::Sender<SourceEvent>,
    workout_active: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let mut codec = FmsCodec::new();
            let result = transport
                .notifications(&peripheral, characteristic, |bytes| {
                    if let Some(sample) = codec.on_notification(characteristic, bytes) {
                        let _ = sample_tx.send(sample);
                    }
                })
                .await;
            if let Err(e) = result {
                warn!("notification stream for {} ended: {}", address, e);
            }
            let _ = event_tx.send(SourceEvent::Disconnected);

            if !workout_active.load(Ordering::SeqCst) {
                return;
            }

            if reconnect_with_backoff(&transport, &peripheral, characteristic, &address, &event_tx).await {
                continue;
            }
            let _ = event_tx.send(SourceEvent::Aborted { address: address.clone() });
            return;
        }
    })
}

/// Exponential backoff reconnect: 1s, 2s, 4s, 8s, cap 30s, give up after
/// a 120s total budget.
async fn reconnect_with_backoff(
    transport: &Arc<BleTransport>,
    peripheral: &Peripheral,
    characteristic: Characteristic,
    address: &str,
    event_tx: &broadcast::Sender<SourceEvent>,
) -> bool {
    let deadline = tokio::time::Instant::now() + RECONNECT_BUDGET;
    let mut attempt = 0;
    while tokio::time::Instant::now() < deadline {
        let _ = event_tx.send(SourceEvent::Reconnecting { address: address.to_string(), attempt });
        sleep(backoff_delay(attempt)).await;
        if transport.resubscribe(peripheral, characteristic).await.is_ok() {
            return true;
        }
        attempt += 1;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps_at_thirty() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(4));
        assert_eq!(backoff_delay(3), Duration::from_secs(8));
        assert_eq!(backoff_delay(10), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn simulated_source_emits_no_samples_until_begin_workout() {
        let (source, mut sample_rx, _events) = Source::new_simulated(Kind::Bike);
        source.begin_workout().await;
        let sample = tokio::time::timeout(Duration::from_secs(3), sample_rx.recv())
            .await
            .expect("sample within 3s")
            .expect("channel open");
        assert_eq!(sample.kind, Kind::Bike);
    }
}
