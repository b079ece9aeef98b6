//! Bluetooth scanner
//! Runs one discovery at a time, collects discovered devices into the shared
//! registry and raises a single "discovery finished" signal per scan.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::device::{DeviceRecord, DeviceRegistry};
use crate::core::bluetooth::error::BleError;
use crate::core::bluetooth::events::{deliver, EventHub, Subscription};
use crate::core::bluetooth::identity::{parse_mac, PeripheralIdentity};
use crate::core::bluetooth::transport::{GattTransport, ScanReport, ScanResult};
use crate::core::bluetooth::types::{ScanEvent, ScanFilter};
use crate::utils::lock;

/// Invoked once when a scan ends, however it ends
pub type FinishedCallback = Box<dyn FnOnce() + Send>;

struct ScanState {
    scanning: bool,
    generation: u64,
    cancel_token: Option<CancellationToken>,
    on_finished: Option<FinishedCallback>,
}

struct ScannerShared {
    state: Mutex<ScanState>,
    events: EventHub<ScanEvent>,
}

/// Bluetooth scanner
pub struct ScanSession<T: GattTransport> {
    transport: Arc<T>,
    registry: DeviceRegistry<T::Peripheral>,
    shared: Arc<ScannerShared>,
}

impl<T: GattTransport> Clone for ScanSession<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            registry: self.registry.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl<T: GattTransport> ScanSession<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self {
            transport,
            registry: DeviceRegistry::new(),
            shared: Arc::new(ScannerShared {
                state: Mutex::new(ScanState {
                    scanning: false,
                    generation: 0,
                    cancel_token: None,
                    on_finished: None,
                }),
                events: EventHub::new(),
            }),
        }
    }

    /// Registry shared with the GATT session for connection lookups
    pub fn registry(&self) -> DeviceRegistry<T::Peripheral> {
        self.registry.clone()
    }

    pub fn subscribe(&self) -> (Subscription, UnboundedReceiver<ScanEvent>) {
        self.shared.events.subscribe()
    }

    pub fn is_scanning(&self) -> bool {
        lock(&self.shared.state).scanning
    }

    /// Starts a scan. Fails with `AlreadyScanning` if one is running.
    ///
    /// The discovered set is cleared first. With a duration the scan stops
    /// itself once it elapses; without one it runs until [`stop`](Self::stop).
    pub fn start(
        &self,
        filter: ScanFilter,
        duration: Option<Duration>,
        on_finished: Option<FinishedCallback>,
    ) -> Result<(), BleError> {
        let (generation, cancel_token) = {
            let mut state = lock(&self.shared.state);
            if state.scanning {
                return Err(BleError::AlreadyScanning);
            }
            self.registry.clear();
            state.generation += 1;
            let token = CancellationToken::new();
            state.scanning = true;
            state.cancel_token = Some(token.clone());
            state.on_finished = on_finished;
            (state.generation, token)
        };

        info!("Starting bluetooth scan (filter: {:?}, duration: {:?})", filter, duration);
        let session = self.clone();
        tokio::spawn(async move {
            session.run(generation, cancel_token, filter, duration).await;
        });
        Ok(())
    }

    /// Stops any running scan, then starts a new one
    pub fn restart(
        &self,
        filter: ScanFilter,
        duration: Option<Duration>,
        on_finished: Option<FinishedCallback>,
    ) -> Result<(), BleError> {
        self.stop();
        self.start(filter, duration, on_finished)
    }

    /// Scans for exactly one address
    pub fn scan_single_device(
        &self,
        address: &str,
        duration: Option<Duration>,
        on_finished: Option<FinishedCallback>,
    ) -> Result<(), BleError> {
        let mac = parse_mac(address).ok_or_else(|| BleError::InvalidIdentifier(address.to_string()))?;
        self.restart(ScanFilter::Address(mac), duration, on_finished)
    }

    /// Stops the running scan. A no-op when idle.
    pub fn stop(&self) {
        let generation = lock(&self.shared.state).generation;
        if self.finish(generation) {
            info!("Bluetooth scan stopped");
        }
    }

    pub fn devices(&self) -> Vec<DeviceRecord> {
        self.registry.records()
    }

    pub fn device(&self, identity: &PeripheralIdentity) -> Option<DeviceRecord> {
        self.registry.record(identity)
    }

    pub fn set_hardware_identity(
        &self,
        identity: &PeripheralIdentity,
        hardware: PeripheralIdentity,
    ) -> Result<(), BleError> {
        self.registry.set_hardware_identity(identity, hardware)
    }

    /// Forgets every discovered device
    pub fn clear(&self) {
        self.registry.clear();
    }

    async fn run(
        &self,
        generation: u64,
        cancel_token: CancellationToken,
        filter: ScanFilter,
        duration: Option<Duration>,
    ) {
        let mut scan_stream = tokio::select! {
            biased;
            _ = cancel_token.cancelled() => return,
            result = self.transport.scan(filter) => match result {
                Ok(stream) => stream,
                Err(e) => {
                    error!("Failed to start bluetooth scan: {}", e);
                    self.fail(generation, e.status.0);
                    return;
                }
            },
        };

        let timer = async {
            match duration {
                Some(duration) => tokio::time::sleep(duration).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(timer);

        loop {
            tokio::select! {
                biased;
                _ = cancel_token.cancelled() => break,
                _ = &mut timer => {
                    info!("Scan duration elapsed");
                    self.finish(generation);
                    break;
                }
                report = scan_stream.next() => match report {
                    Some(ScanReport::Result(result)) => self.handle_result(generation, filter, result),
                    Some(ScanReport::Failed(code)) => {
                        self.fail(generation, code);
                        break;
                    }
                    None => {
                        info!("Bluetooth scan stream has ended.");
                        self.finish(generation);
                        break;
                    }
                },
            }
        }
    }

    fn handle_result(&self, generation: u64, filter: ScanFilter, result: ScanResult<T::Peripheral>) {
        let record = DeviceRecord::new(result.identity, result.rssi, result.advertisement.decode());
        if !filter.matches(&record) {
            return;
        }

        // Holding the state lock keeps a concurrent stop from interleaving
        let state = lock(&self.shared.state);
        if !state.scanning || state.generation != generation {
            return;
        }
        debug!("Found device - {} {:?}, RSSI: {}", record.identity, record.name, record.rssi);
        if self.registry.insert(record.clone(), result.peripheral) {
            info!("Discovered new device {} ({})", record.identity, record.name);
        }
        self.shared.events.publish(ScanEvent::DeviceDiscovered(record));
    }

    fn fail(&self, generation: u64, code: i32) {
        {
            let state = lock(&self.shared.state);
            if !state.scanning || state.generation != generation {
                return;
            }
        }
        warn!("Bluetooth scan failed with code {}", code);
        self.shared.events.publish(ScanEvent::ScanFailed(code));
        self.finish(generation);
    }

    /// Moves a scan of this generation to idle; returns false if it had already ended
    fn finish(&self, generation: u64) -> bool {
        let on_finished = {
            let mut state = lock(&self.shared.state);
            if !state.scanning || state.generation != generation {
                return false;
            }
            state.scanning = false;
            if let Some(token) = state.cancel_token.take() {
                token.cancel();
            }
            state.on_finished.take()
        };

        self.shared.events.publish(ScanEvent::DiscoveryFinished);
        if let Some(callback) = on_finished {
            deliver("discovery finished callback", |cb: FinishedCallback| cb(), callback);
        }
        true
    }
}
