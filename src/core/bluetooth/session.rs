//! GATT session
//! Owns the single active peripheral connection. Callers only admit requests;
//! one worker task issues every transport request in submission order and is
//! the only writer of the connection state, apart from admission bookkeeping.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::mpsc::{self, error::SendError, UnboundedReceiver, UnboundedSender};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::bluetooth::capability::CapabilityCatalog;
use crate::core::bluetooth::commands::{
    resolve_mtu, resolve_read, resolve_write, BondCallback, CommandExecutor, ConnectCallback, DataSink,
    DisconnectCallback, GattCommand, MtuCallback, ReadCallback, WriteCallback,
};
use crate::core::bluetooth::connection::{ConnectOptions, ConnectionManager};
use crate::core::bluetooth::device::DeviceRegistry;
use crate::core::bluetooth::error::BleError;
use crate::core::bluetooth::events::{deliver, EventHub, Subscription};
use crate::core::bluetooth::identity::PeripheralIdentity;
use crate::core::bluetooth::notification::NotificationHandler;
use crate::core::bluetooth::transport::{GattTransport, LinkEvent};
use crate::core::bluetooth::types::{ConnectionStatus, GattStatus, SessionEvent, SessionState, WriteCompletion};
use crate::utils::{read_lock, write_lock};

enum SessionMessage<P> {
    Connect {
        generation: u64,
        identity: PeripheralIdentity,
        peripheral: P,
        catalog: CapabilityCatalog,
        options: ConnectOptions,
        on_result: ConnectCallback,
    },
    Command {
        generation: u64,
        command: GattCommand,
    },
    Disconnect {
        identity: PeripheralIdentity,
        on_result: Option<DisconnectCallback>,
    },
    LinkLost {
        generation: u64,
    },
}

/// The one connection record of a session
struct ConnectionState<C> {
    state: SessionState,
    /// Bumped on every admitted connect
    generation: u64,
    peripheral: Option<PeripheralIdentity>,
    name: Option<String>,
    mtu: u16,
    services: Vec<Uuid>,
    handles: HashMap<Uuid, C>,
    services_validated: bool,
    cancel_token: Option<CancellationToken>,
}

impl<C> ConnectionState<C> {
    fn reset(&mut self, default_mtu: u16) {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }
        self.state = SessionState::Disconnected;
        self.peripheral = None;
        self.name = None;
        self.mtu = default_mtu;
        self.services.clear();
        self.handles.clear();
        self.services_validated = false;
    }

    fn is_connected(&self) -> bool {
        matches!(self.state, SessionState::ValidatingServices | SessionState::Ready)
    }
}

struct SessionShared<C> {
    state: RwLock<ConnectionState<C>>,
    events: EventHub<SessionEvent>,
    default_mtu: u16,
}

/// GATT client session for one peripheral at a time
pub struct GattSession<T: GattTransport> {
    shared: Arc<SessionShared<T::Characteristic>>,
    registry: DeviceRegistry<T::Peripheral>,
    tx: UnboundedSender<SessionMessage<T::Peripheral>>,
    shutdown: CancellationToken,
}

impl<T: GattTransport> GattSession<T> {
    /// Creates the session and starts its worker. Must be called inside a tokio runtime.
    pub fn new(transport: Arc<T>, registry: DeviceRegistry<T::Peripheral>, default_mtu: u16) -> Self {
        let shared = Arc::new(SessionShared {
            state: RwLock::new(ConnectionState {
                state: SessionState::Disconnected,
                generation: 0,
                peripheral: None,
                name: None,
                mtu: default_mtu,
                services: Vec::new(),
                handles: HashMap::new(),
                services_validated: false,
                cancel_token: None,
            }),
            events: EventHub::new(),
            default_mtu,
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let worker = SessionWorker {
            transport,
            shared: shared.clone(),
            tx: tx.clone(),
            peripheral: None,
            link_watcher: None,
            forwarders: HashMap::new(),
            pending_disconnects: Vec::new(),
        };
        tokio::spawn(worker.run(rx, shutdown.clone()));

        Self {
            shared,
            registry,
            tx,
            shutdown,
        }
    }

    pub fn subscribe(&self) -> (Subscription, UnboundedReceiver<SessionEvent>) {
        self.shared.events.subscribe()
    }

    pub fn state(&self) -> SessionState {
        read_lock(&self.shared.state).state
    }

    pub fn is_connected(&self) -> bool {
        read_lock(&self.shared.state).is_connected()
    }

    pub fn services_available(&self) -> bool {
        read_lock(&self.shared.state).services_validated
    }

    pub fn mtu(&self) -> u16 {
        read_lock(&self.shared.state).mtu
    }

    pub fn connected_device(&self) -> Option<PeripheralIdentity> {
        let state = read_lock(&self.shared.state);
        state.peripheral.filter(|_| state.is_connected())
    }

    pub fn connected_device_name(&self) -> Option<String> {
        let state = read_lock(&self.shared.state);
        state.name.clone().filter(|_| state.is_connected())
    }

    /// Service ids reported by the connected peripheral
    pub fn device_services(&self) -> Vec<Uuid> {
        read_lock(&self.shared.state).services.clone()
    }

    /// Connects to a peripheral from the current scan and validates it against `catalog`.
    ///
    /// `on_result` fires once the session is Ready, or with the error that ended the attempt.
    pub fn connect(
        &self,
        identity: PeripheralIdentity,
        catalog: CapabilityCatalog,
        options: ConnectOptions,
        on_result: ConnectCallback,
    ) -> Result<(), BleError> {
        let peripheral = self
            .registry
            .peripheral(&identity)
            .ok_or(BleError::NoSuchPeripheral(identity))?;
        let name = self.registry.record(&identity).map(|r| r.name).filter(|n| !n.is_empty());

        let generation = {
            let mut state = write_lock(&self.shared.state);
            if state.state != SessionState::Disconnected {
                return Err(BleError::AlreadyConnected);
            }
            state.reset(self.shared.default_mtu);
            state.generation += 1;
            state.state = SessionState::Connecting;
            state.peripheral = Some(identity);
            state.name = name;
            state.cancel_token = Some(CancellationToken::new());
            state.generation
        };

        info!("Connecting to device {} (retries: {})", identity, options.retries);
        let message = SessionMessage::Connect {
            generation,
            identity,
            peripheral,
            catalog,
            options,
            on_result,
        };
        if let Err(SendError(SessionMessage::Connect { on_result, .. })) = self.tx.send(message) {
            write_lock(&self.shared.state).reset(self.shared.default_mtu);
            deliver("connect callback", on_result, Err(BleError::Cancelled));
            return Err(BleError::Cancelled);
        }
        Ok(())
    }

    pub fn set_mtu(&self, mtu: u16, on_result: Option<MtuCallback>) -> Result<(), BleError> {
        self.submit_link_command(GattCommand::RequestMtu { mtu, on_result })
    }

    pub fn bond(&self, on_result: Option<BondCallback>) -> Result<(), BleError> {
        self.submit_link_command(GattCommand::Bond { on_result })
    }

    pub fn enable_notifications(
        &self,
        characteristic: Uuid,
        on_data: Option<DataSink>,
        on_ack: Option<WriteCallback>,
    ) -> Result<(), BleError> {
        self.submit_characteristic_command(GattCommand::EnableNotifications {
            characteristic,
            on_data,
            on_ack,
        })
    }

    pub fn disable_notifications(&self, characteristic: Uuid, on_ack: Option<WriteCallback>) -> Result<(), BleError> {
        self.submit_characteristic_command(GattCommand::DisableNotifications { characteristic, on_ack })
    }

    pub fn read(&self, characteristic: Uuid, on_result: Option<ReadCallback>) -> Result<(), BleError> {
        self.submit_characteristic_command(GattCommand::Read {
            characteristic,
            on_result,
        })
    }

    pub fn write(&self, characteristic: Uuid, payload: Vec<u8>, on_result: Option<WriteCallback>) -> Result<(), BleError> {
        self.submit_characteristic_command(GattCommand::Write {
            characteristic,
            payload,
            on_result,
        })
    }

    /// Tears the link down. While connecting this stops the retry loop instead.
    pub fn disconnect(&self, on_result: Option<DisconnectCallback>) -> Result<(), BleError> {
        let (identity, cancel_token) = {
            let mut state = write_lock(&self.shared.state);
            let identity = match (state.state, state.peripheral) {
                (SessionState::Disconnected, _) | (_, None) => return Err(BleError::NotConnected),
                (_, Some(identity)) => identity,
            };
            if state.is_connected() {
                state.state = SessionState::Disconnecting;
            }
            (identity, state.cancel_token.clone())
        };

        info!("Disconnect requested for {}", identity);
        if let Some(token) = cancel_token {
            token.cancel();
        }
        if let Err(SendError(SessionMessage::Disconnect { identity, on_result })) =
            self.tx.send(SessionMessage::Disconnect { identity, on_result })
        {
            if let Some(callback) = on_result {
                deliver(
                    "disconnect callback",
                    callback,
                    ConnectionStatus {
                        peripheral: identity,
                        status: GattStatus::SUCCESS,
                    },
                );
            }
        }
        Ok(())
    }

    /// Stops the worker. Queued requests fail, an active link is closed.
    pub fn shutdown(&self) {
        if let Some(token) = read_lock(&self.shared.state).cancel_token.clone() {
            token.cancel();
        }
        self.shutdown.cancel();
    }

    fn submit_link_command(&self, command: GattCommand) -> Result<(), BleError> {
        let generation = {
            let state = read_lock(&self.shared.state);
            if !state.is_connected() {
                return Err(BleError::NotConnected);
            }
            state.generation
        };
        self.enqueue(generation, command)
    }

    fn submit_characteristic_command(&self, command: GattCommand) -> Result<(), BleError> {
        let Some(characteristic) = command.characteristic() else {
            return self.submit_link_command(command);
        };
        let (generation, peripheral, mtu, loaded) = {
            let state = read_lock(&self.shared.state);
            (
                state.generation,
                state.peripheral,
                state.mtu,
                state.handles.contains_key(&characteristic),
            )
        };

        if !loaded {
            let error = BleError::CharacteristicNotLoaded(characteristic);
            warn!("Rejecting {:?}: {}", command, error);
            command.fail(peripheral, mtu, error.clone());
            return Err(error);
        }
        self.enqueue(generation, command)
    }

    fn enqueue(&self, generation: u64, command: GattCommand) -> Result<(), BleError> {
        debug!("Queueing {:?}", command);
        if let Err(SendError(SessionMessage::Command { command, .. })) =
            self.tx.send(SessionMessage::Command { generation, command })
        {
            let (peripheral, mtu) = {
                let state = read_lock(&self.shared.state);
                (state.peripheral, state.mtu)
            };
            command.fail(peripheral, mtu, BleError::Cancelled);
            return Err(BleError::Cancelled);
        }
        Ok(())
    }
}

impl<T: GattTransport> Drop for GattSession<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct SessionWorker<T: GattTransport> {
    transport: Arc<T>,
    shared: Arc<SessionShared<T::Characteristic>>,
    tx: UnboundedSender<SessionMessage<T::Peripheral>>,
    /// Platform handle of the linked peripheral
    peripheral: Option<T::Peripheral>,
    link_watcher: Option<AbortHandle>,
    forwarders: HashMap<Uuid, AbortHandle>,
    pending_disconnects: Vec<DisconnectCallback>,
}

impl<T: GattTransport> SessionWorker<T> {
    async fn run(mut self, mut rx: UnboundedReceiver<SessionMessage<T::Peripheral>>, shutdown: CancellationToken) {
        loop {
            let message = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                message = rx.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            self.handle(message).await;
        }
        self.teardown(rx).await;
    }

    async fn handle(&mut self, message: SessionMessage<T::Peripheral>) {
        match message {
            SessionMessage::Connect {
                generation,
                identity,
                peripheral,
                catalog,
                options,
                on_result,
            } => {
                self.handle_connect(generation, identity, peripheral, catalog, options, on_result)
                    .await
            }
            SessionMessage::Command { generation, command } => self.handle_command(generation, command).await,
            SessionMessage::Disconnect { identity, on_result } => self.handle_disconnect(identity, on_result).await,
            SessionMessage::LinkLost { generation } => {
                warn!("Link to peripheral lost");
                self.handle_link_lost(generation, GattStatus::FAILURE);
            }
        }
    }

    fn publish(&self, event: Option<SessionEvent>) {
        if let Some(event) = event {
            self.shared.events.publish(event);
        }
    }

    fn reset_state(&self) {
        write_lock(&self.shared.state).reset(self.shared.default_mtu);
    }

    async fn handle_connect(
        &mut self,
        generation: u64,
        identity: PeripheralIdentity,
        peripheral: T::Peripheral,
        catalog: CapabilityCatalog,
        options: ConnectOptions,
        on_result: ConnectCallback,
    ) {
        let cancel_token = {
            let state = read_lock(&self.shared.state);
            if state.generation == generation && state.state == SessionState::Connecting {
                state.cancel_token.clone()
            } else {
                None
            }
        };
        let Some(cancel_token) = cancel_token else {
            debug!("Connect to {} was withdrawn before it started", identity);
            deliver("connect callback", on_result, Err(BleError::Cancelled));
            return;
        };

        let manager = ConnectionManager::new(self.transport.clone(), &options);
        if let Err(e) = manager.connect_with_retry(&peripheral, &cancel_token).await {
            error!("Failed to connect to {}: {}", identity, e);
            self.reset_state();
            self.shared.events.publish(SessionEvent::ConnectionFailed(ConnectionStatus {
                peripheral: identity,
                status: e.status(),
            }));
            deliver("connect callback", on_result, Err(e));
            return;
        }

        self.peripheral = Some(peripheral.clone());
        self.watch_link(generation, &peripheral, &cancel_token).await;
        {
            let mut state = write_lock(&self.shared.state);
            if state.state == SessionState::Connecting {
                state.state = SessionState::ValidatingServices;
            }
        }
        self.shared.events.publish(SessionEvent::Connected(ConnectionStatus {
            peripheral: identity,
            status: GattStatus::SUCCESS,
        }));

        let validated = manager
            .discover_and_validate(&peripheral, &catalog, &cancel_token)
            .await
            .and_then(|validated| {
                let mut state = write_lock(&self.shared.state);
                if state.generation != generation || state.state != SessionState::ValidatingServices {
                    return Err(BleError::Cancelled);
                }
                state.services = validated.services;
                state.handles = validated.handles;
                state.services_validated = true;
                state.state = SessionState::Ready;
                Ok(())
            });

        if let Err(e) = validated {
            warn!("Service validation for {} failed: {}", identity, e);
            self.close_link(generation, &peripheral, GattStatus::FAILURE).await;
            self.shared.events.publish(SessionEvent::ConnectionFailed(ConnectionStatus {
                peripheral: identity,
                status: e.status(),
            }));
            deliver("connect callback", on_result, Err(e));
            return;
        }

        info!("Device {} ready", identity);
        self.shared.events.publish(SessionEvent::Ready(ConnectionStatus {
            peripheral: identity,
            status: GattStatus::SUCCESS,
        }));

        if options.bond {
            self.enqueue_followup(generation, GattCommand::Bond { on_result: None });
        }
        if options.mtu > 0 {
            self.enqueue_followup(
                generation,
                GattCommand::RequestMtu {
                    mtu: options.mtu,
                    on_result: None,
                },
            );
        }
        deliver("connect callback", on_result, Ok(()));
    }

    fn enqueue_followup(&self, generation: u64, command: GattCommand) {
        if self.tx.send(SessionMessage::Command { generation, command }).is_err() {
            warn!("Session queue closed; follow-up request dropped");
        }
    }

    async fn watch_link(&mut self, generation: u64, peripheral: &T::Peripheral, cancel_token: &CancellationToken) {
        let mut events = match self.transport.link_events(peripheral).await {
            Ok(events) => events,
            Err(e) => {
                warn!("Link state changes unavailable: {}", e);
                return;
            }
        };
        let tx = self.tx.clone();
        let cancel_token = cancel_token.clone();
        let watcher = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if event == LinkEvent::Disconnected {
                    cancel_token.cancel();
                    let _ = tx.send(SessionMessage::LinkLost { generation });
                    break;
                }
            }
        });
        if let Some(old) = self.link_watcher.replace(watcher.abort_handle()) {
            old.abort();
        }
    }

    async fn handle_command(&mut self, generation: u64, command: GattCommand) {
        let (current, identity, mtu, ready, cancel_token, handle) = {
            let state = read_lock(&self.shared.state);
            (
                state.generation,
                state.peripheral,
                state.mtu,
                state.state == SessionState::Ready,
                state.cancel_token.clone(),
                command.characteristic().and_then(|c| state.handles.get(&c).cloned()),
            )
        };

        let (Some(identity), Some(peripheral), Some(cancel_token), true) =
            (identity, self.peripheral.clone(), cancel_token, ready && current == generation)
        else {
            self.publish(command.fail(identity, mtu, BleError::NotConnected));
            return;
        };
        debug!("Processing {:?}", command);
        let executor = CommandExecutor::new(self.transport.as_ref(), identity, &cancel_token);
        let event = match (command, handle) {
            (GattCommand::Read { characteristic, on_result }, Some(handle)) => {
                let completion = executor.read(characteristic, &handle).await;
                Some(resolve_read(on_result, completion))
            }
            (
                GattCommand::Write {
                    characteristic,
                    payload,
                    on_result,
                },
                Some(handle),
            ) => {
                let completion = executor.write(characteristic, &handle, &payload).await;
                Some(resolve_write(on_result, completion))
            }
            (
                GattCommand::EnableNotifications {
                    characteristic,
                    on_data,
                    on_ack,
                },
                Some(handle),
            ) => {
                let status = match executor.cancellable(self.transport.subscribe(&handle)).await {
                    Ok(stream) => {
                        let forwarder =
                            NotificationHandler::new(identity, characteristic, on_data, self.shared.events.clone())
                                .spawn(stream);
                        if let Some(old) = self.forwarders.insert(characteristic, forwarder) {
                            old.abort();
                        }
                        GattStatus::SUCCESS
                    }
                    Err(e) => {
                        warn!("Failed to subscribe to notifications on {}: {}", characteristic, e);
                        e.status
                    }
                };
                Some(resolve_write(on_ack, ack(identity, characteristic, status)))
            }
            (GattCommand::DisableNotifications { characteristic, on_ack }, Some(handle)) => {
                let status = match self.forwarders.remove(&characteristic) {
                    Some(forwarder) => {
                        forwarder.abort();
                        match executor.cancellable(self.transport.unsubscribe(&handle)).await {
                            Ok(()) => GattStatus::SUCCESS,
                            Err(e) => {
                                warn!("Failed to unsubscribe from {}: {}", characteristic, e);
                                e.status
                            }
                        }
                    }
                    None => {
                        debug!("Notifications on {} were not enabled", characteristic);
                        GattStatus::SUCCESS
                    }
                };
                Some(resolve_write(on_ack, ack(identity, characteristic, status)))
            }
            (GattCommand::RequestMtu { mtu: requested, on_result }, _) => {
                let result = executor.request_mtu(&peripheral, requested, mtu).await;
                if result.success {
                    let mut state = write_lock(&self.shared.state);
                    if state.generation == generation {
                        state.mtu = result.mtu;
                    }
                    info!("MTU set to {}", result.mtu);
                }
                Some(resolve_mtu(on_result, result))
            }
            (GattCommand::Bond { on_result }, _) => {
                let result = executor.bond(&peripheral).await;
                let status = match &result {
                    Ok(()) => {
                        info!("Bonded with {}", identity);
                        GattStatus::SUCCESS
                    }
                    Err(e) => {
                        warn!("Bonding with {} failed: {}", identity, e);
                        e.status()
                    }
                };
                if let Some(callback) = on_result {
                    deliver("bond callback", callback, result);
                }
                Some(SessionEvent::Bonded(ConnectionStatus {
                    peripheral: identity,
                    status,
                }))
            }
            (command, None) => {
                // Handle vanished between admission and processing
                let error = match command.characteristic() {
                    Some(characteristic) => BleError::CharacteristicNotLoaded(characteristic),
                    None => BleError::NotConnected,
                };
                command.fail(Some(identity), mtu, error)
            }
        };
        self.publish(event);
    }

    async fn handle_disconnect(&mut self, identity: PeripheralIdentity, on_result: Option<DisconnectCallback>) {
        let Some(peripheral) = self.peripheral.clone() else {
            debug!("Disconnect of {} found no active link", identity);
            if let Some(callback) = on_result {
                deliver(
                    "disconnect callback",
                    callback,
                    ConnectionStatus {
                        peripheral: identity,
                        status: GattStatus::SUCCESS,
                    },
                );
            }
            return;
        };
        if let Some(callback) = on_result {
            self.pending_disconnects.push(callback);
        }
        let generation = read_lock(&self.shared.state).generation;
        self.close_link(generation, &peripheral, GattStatus::SUCCESS).await;
    }

    async fn close_link(&mut self, generation: u64, peripheral: &T::Peripheral, status: GattStatus) {
        info!("Disconnecting from device");
        let status = match self.transport.disconnect(peripheral).await {
            Ok(()) => status,
            Err(e) => {
                warn!("Disconnect request failed: {}", e);
                e.status
            }
        };
        self.handle_link_lost(generation, status);
    }

    /// Single exit path of a link; clears the connection and resolves waiting disconnects
    fn handle_link_lost(&mut self, generation: u64, status: GattStatus) {
        let identity = {
            let mut state = write_lock(&self.shared.state);
            if state.generation != generation || self.peripheral.is_none() {
                debug!("Ignoring link loss of an earlier connection");
                return;
            }
            let identity = state.peripheral;
            state.reset(self.shared.default_mtu);
            identity
        };

        self.peripheral = None;
        if let Some(watcher) = self.link_watcher.take() {
            watcher.abort();
        }
        for (_, forwarder) in self.forwarders.drain() {
            forwarder.abort();
        }

        let Some(peripheral) = identity else {
            return;
        };
        info!("Device {} disconnected (status {})", peripheral, status);
        let report = ConnectionStatus { peripheral, status };
        self.shared.events.publish(SessionEvent::Disconnected(report));
        for callback in self.pending_disconnects.drain(..) {
            deliver("disconnect callback", callback, report);
        }
    }

    async fn teardown(&mut self, mut rx: UnboundedReceiver<SessionMessage<T::Peripheral>>) {
        info!("GATT session shutting down");
        rx.close();
        while let Ok(message) = rx.try_recv() {
            match message {
                SessionMessage::Connect { on_result, .. } => {
                    deliver("connect callback", on_result, Err(BleError::Cancelled));
                }
                SessionMessage::Command { command, .. } => {
                    let (peripheral, mtu) = {
                        let state = read_lock(&self.shared.state);
                        (state.peripheral, state.mtu)
                    };
                    self.publish(command.fail(peripheral, mtu, BleError::Cancelled));
                }
                SessionMessage::Disconnect { identity, on_result } => {
                    if let Some(callback) = on_result {
                        if self.peripheral.is_some() {
                            self.pending_disconnects.push(callback);
                        } else {
                            deliver(
                                "disconnect callback",
                                callback,
                                ConnectionStatus {
                                    peripheral: identity,
                                    status: GattStatus::SUCCESS,
                                },
                            );
                        }
                    }
                }
                SessionMessage::LinkLost { .. } => {}
            }
        }

        if let Some(peripheral) = self.peripheral.clone() {
            let generation = read_lock(&self.shared.state).generation;
            self.close_link(generation, &peripheral, GattStatus::SUCCESS).await;
        }
        self.reset_state();
    }
}

fn ack(peripheral: PeripheralIdentity, characteristic: Uuid, status: GattStatus) -> WriteCompletion {
    WriteCompletion {
        peripheral: Some(peripheral),
        characteristic,
        success: status.is_success(),
        bytes_written: 0,
        status,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::advertisement::AdvertisementData;
    use crate::core::bluetooth::capability::{CharacteristicProperties, ServiceRequirements};
    use crate::core::bluetooth::device::DeviceRecord;
    use crate::core::bluetooth::fake::{Call, FakeTransport, WriteEcho};
    use crate::core::bluetooth::types::{MtuResult, Notification, ReadCompletion};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::oneshot;

    const SERVICE: Uuid = Uuid::from_u128(0xFFF0);
    const RX: Uuid = Uuid::from_u128(0xFFF1);
    const TX: Uuid = Uuid::from_u128(0xFFF2);
    const UNKNOWN: Uuid = Uuid::from_u128(0xBEEF);

    struct Fixture {
        fake: Arc<FakeTransport>,
        session: GattSession<FakeTransport>,
        identity: PeripheralIdentity,
    }

    fn fixture() -> Fixture {
        fixture_with(FakeTransport::new()
            .with_characteristic(SERVICE, RX, CharacteristicProperties::READ | CharacteristicProperties::NOTIFY)
            .with_characteristic(SERVICE, TX, CharacteristicProperties::WRITE))
    }

    fn fixture_with(fake: FakeTransport) -> Fixture {
        let fake = Arc::new(fake);
        let registry = DeviceRegistry::new();
        let identity = PeripheralIdentity::from_mac([0xC0, 0xFF, 0xEE, 0, 0, 1]);
        let adv = AdvertisementData {
            local_name: Some("Sensor".into()),
            ..AdvertisementData::default()
        };
        registry.insert(DeviceRecord::new(identity, -55, adv), identity);
        let session = GattSession::new(fake.clone(), registry, 20);
        Fixture { fake, session, identity }
    }

    fn catalog() -> CapabilityCatalog {
        CapabilityCatalog::new().with_service(
            ServiceRequirements::new(SERVICE)
                .with_characteristic(RX, CharacteristicProperties::READ | CharacteristicProperties::NOTIFY)
                .with_characteristic(TX, CharacteristicProperties::WRITE),
        )
    }

    fn quick(retries: u32) -> ConnectOptions {
        ConnectOptions {
            retries,
            retry_delay: Duration::from_millis(1000),
            ..ConnectOptions::default()
        }
    }

    async fn connect_with(f: &Fixture, catalog: CapabilityCatalog, options: ConnectOptions) -> Result<(), BleError> {
        let (tx, rx) = oneshot::channel();
        f.session.connect(
            f.identity,
            catalog,
            options,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        )?;
        rx.await.unwrap()
    }

    async fn read(f: &Fixture, characteristic: Uuid) -> ReadCompletion {
        let (tx, rx) = oneshot::channel();
        f.session
            .read(characteristic, Some(Box::new(move |c| {
                let _ = tx.send(c);
            })))
            .unwrap();
        rx.await.unwrap()
    }

    async fn write(f: &Fixture, payload: Vec<u8>) -> WriteCompletion {
        let (tx, rx) = oneshot::channel();
        f.session
            .write(TX, payload, Some(Box::new(move |c| {
                let _ = tx.send(c);
            })))
            .unwrap();
        rx.await.unwrap()
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn connect_validates_and_becomes_ready() {
        let f = fixture();
        let (_sub, mut events) = f.session.subscribe();

        connect_with(&f, catalog(), quick(3)).await.unwrap();

        assert_eq!(f.session.state(), SessionState::Ready);
        assert!(f.session.is_connected());
        assert!(f.session.services_available());
        assert_eq!(f.session.mtu(), 20);
        assert_eq!(f.session.connected_device(), Some(f.identity));
        assert_eq!(f.session.connected_device_name().as_deref(), Some("Sensor"));
        assert_eq!(f.session.device_services(), vec![SERVICE]);

        assert!(matches!(events.recv().await, Some(SessionEvent::Connected(_))));
        assert!(matches!(events.recv().await, Some(SessionEvent::Ready(_))));
    }

    #[tokio::test]
    async fn unknown_peripheral_fails_fast() {
        let f = fixture();
        let stranger = PeripheralIdentity::from_mac([1, 2, 3, 4, 5, 6]);
        let result = f.session.connect(stranger, catalog(), quick(1), Box::new(|_| panic!("must not resolve")));
        assert_eq!(result, Err(BleError::NoSuchPeripheral(stranger)));
        assert!(f.fake.calls().is_empty());
    }

    #[tokio::test]
    async fn second_connect_is_rejected() {
        let f = fixture();
        connect_with(&f, catalog(), quick(1)).await.unwrap();
        let again = f.session.connect(f.identity, catalog(), quick(1), Box::new(|_| {}));
        assert_eq!(again, Err(BleError::AlreadyConnected));
    }

    #[tokio::test]
    async fn missing_notify_capability_fails_validation_and_disconnects() {
        let f = fixture_with(FakeTransport::new()
            .with_characteristic(SERVICE, RX, CharacteristicProperties::READ)
            .with_characteristic(SERVICE, TX, CharacteristicProperties::WRITE));

        let result = connect_with(&f, catalog(), quick(1)).await;
        match result {
            Err(BleError::CharacteristicCapabilityMismatch { characteristic, .. }) => assert_eq!(characteristic, RX),
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(f.session.state(), SessionState::Disconnected);
        assert!(!f.session.services_available());
        assert!(f.fake.calls().contains(&Call::Disconnect(f.identity)));
    }

    #[tokio::test]
    async fn missing_service_fails_validation() {
        let f = fixture();
        let catalog = CapabilityCatalog::new()
            .with_service(ServiceRequirements::new(UNKNOWN).with_characteristic(RX, CharacteristicProperties::READ));
        let result = connect_with(&f, catalog, quick(1)).await;
        assert_eq!(
            result,
            Err(BleError::RequiredServiceMissing {
                service: UNKNOWN,
                characteristic: None
            })
        );
        assert_eq!(f.session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn read_of_unloaded_characteristic_never_reaches_transport() {
        let f = fixture();
        connect_with(&f, catalog(), quick(1)).await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let result = f.session.read(UNKNOWN, Some(Box::new(move |c| sink.lock().unwrap().push(c))));

        assert_eq!(result, Err(BleError::CharacteristicNotLoaded(UNKNOWN)));
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(!seen[0].success());
        settle().await;
        assert!(!f.fake.calls().iter().any(|c| matches!(c, Call::Read(_))));
    }

    #[tokio::test]
    async fn read_before_connect_is_not_loaded() {
        let f = fixture();
        assert_eq!(f.session.read(RX, None), Err(BleError::CharacteristicNotLoaded(RX)));
    }

    #[tokio::test]
    async fn read_returns_payload_and_status() {
        let f = fixture();
        f.fake.set_read_value(RX, vec![0x2A]);
        connect_with(&f, catalog(), quick(1)).await.unwrap();

        let completion = read(&f, RX).await;
        assert_eq!(completion.peripheral, Some(f.identity));
        assert_eq!(completion.data, vec![0x2A]);
        assert_eq!(completion.status, GattStatus::SUCCESS);
    }

    #[tokio::test]
    async fn failed_read_carries_platform_status() {
        let f = fixture();
        connect_with(&f, catalog(), quick(1)).await.unwrap();
        let completion = read(&f, RX).await;
        assert_eq!(completion.status, GattStatus(2));
        assert!(completion.data.is_empty());
        assert_eq!(f.session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn write_success_depends_on_echo() {
        let f = fixture();
        connect_with(&f, catalog(), quick(1)).await.unwrap();

        let ok = write(&f, vec![0x01, 0x02, 0x03]).await;
        assert!(ok.success);
        assert_eq!(ok.bytes_written, 3);

        f.fake.set_write_echo(WriteEcho::Fixed(vec![0x01, 0x02, 0xFF]));
        let mismatch = write(&f, vec![0x01, 0x02, 0x03]).await;
        assert!(!mismatch.success);

        f.fake.set_write_echo(WriteEcho::Absent);
        assert!(write(&f, vec![9]).await.success);

        f.fake.set_write_echo(WriteEcho::Fail(GattStatus(3)));
        let failed = write(&f, vec![9]).await;
        assert!(!failed.success);
        assert_eq!(failed.status, GattStatus(3));
    }

    #[tokio::test]
    async fn same_kind_requests_complete_in_submission_order() {
        let f = fixture();
        f.fake.set_read_value(RX, vec![1]);
        connect_with(&f, catalog(), quick(1)).await.unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = oneshot::channel();
        for i in 0..3 {
            let order = order.clone();
            f.session
                .read(RX, Some(Box::new(move |_| order.lock().unwrap().push(i))))
                .unwrap();
        }
        f.session
            .read(RX, Some(Box::new(move |_| {
                let _ = done_tx.send(());
            })))
            .unwrap();
        done_rx.await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn notifications_flow_until_disabled() {
        let f = fixture();
        connect_with(&f, catalog(), quick(1)).await.unwrap();

        let (data_tx, mut data_rx) = mpsc::unbounded_channel();
        let sink: DataSink = Arc::new(move |n: Notification| {
            let _ = data_tx.send(n.data);
        });
        let (ack_tx, ack_rx) = oneshot::channel();
        f.session
            .enable_notifications(RX, Some(sink), Some(Box::new(move |c| {
                let _ = ack_tx.send(c);
            })))
            .unwrap();
        assert!(ack_rx.await.unwrap().success);

        f.fake.notify(RX, vec![7, 7]);
        assert_eq!(data_rx.recv().await, Some(vec![7, 7]));

        let (ack_tx, ack_rx) = oneshot::channel();
        f.session
            .disable_notifications(RX, Some(Box::new(move |c| {
                let _ = ack_tx.send(c);
            })))
            .unwrap();
        assert!(ack_rx.await.unwrap().success);
        assert!(f.fake.calls().contains(&Call::Unsubscribe(RX)));
    }

    #[tokio::test]
    async fn disabling_never_enabled_notifications_still_resolves() {
        let f = fixture();
        connect_with(&f, catalog(), quick(1)).await.unwrap();
        let (ack_tx, ack_rx) = oneshot::channel();
        f.session
            .disable_notifications(RX, Some(Box::new(move |c| {
                let _ = ack_tx.send(c);
            })))
            .unwrap();
        assert!(ack_rx.await.unwrap().success);
    }

    #[tokio::test]
    async fn mtu_is_stored_only_on_success() {
        let f = fixture();
        connect_with(&f, catalog(), quick(1)).await.unwrap();

        f.fake.set_negotiated_mtu(185);
        let (tx, rx) = oneshot::channel::<MtuResult>();
        f.session
            .set_mtu(247, Some(Box::new(move |r| {
                let _ = tx.send(r);
            })))
            .unwrap();
        let result = rx.await.unwrap();
        assert!(result.success);
        assert_eq!(result.mtu, 185);
        assert_eq!(f.session.mtu(), 185);

        f.fake.set_negotiated_mtu(0);
        let (tx, rx) = oneshot::channel::<MtuResult>();
        f.session
            .set_mtu(512, Some(Box::new(move |r| {
                let _ = tx.send(r);
            })))
            .unwrap();
        let result = rx.await.unwrap();
        assert!(!result.success);
        assert_eq!(result.mtu, 185);
        assert_eq!(f.session.mtu(), 185);
    }

    #[tokio::test]
    async fn mtu_and_bond_need_a_connection() {
        let f = fixture();
        assert_eq!(f.session.set_mtu(247, None), Err(BleError::NotConnected));
        assert_eq!(f.session.bond(None), Err(BleError::NotConnected));
        assert_eq!(f.session.disconnect(None), Err(BleError::NotConnected));
    }

    #[tokio::test]
    async fn bond_then_mtu_follow_ready() {
        let f = fixture();
        f.fake.set_negotiated_mtu(100);
        let (_sub, mut events) = f.session.subscribe();
        let options = ConnectOptions {
            mtu: 247,
            bond: true,
            ..quick(1)
        };
        connect_with(&f, catalog(), options).await.unwrap();

        let mut kinds = Vec::new();
        while kinds.len() < 4 {
            match events.recv().await {
                Some(SessionEvent::Connected(_)) => kinds.push("connected"),
                Some(SessionEvent::Ready(_)) => kinds.push("ready"),
                Some(SessionEvent::Bonded(status)) => {
                    assert!(status.status.is_success());
                    kinds.push("bonded")
                }
                Some(SessionEvent::MtuChanged(result)) => {
                    assert_eq!(result.mtu, 100);
                    kinds.push("mtu")
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(kinds, vec!["connected", "ready", "bonded", "mtu"]);
        assert_eq!(f.session.mtu(), 100);
    }

    #[tokio::test]
    async fn failed_bond_is_reported_to_callback() {
        let f = fixture();
        f.fake.fail_bond(GattStatus(5));
        connect_with(&f, catalog(), quick(1)).await.unwrap();
        let (tx, rx) = oneshot::channel();
        f.session
            .bond(Some(Box::new(move |r| {
                let _ = tx.send(r);
            })))
            .unwrap();
        match rx.await.unwrap() {
            Err(e) => assert_eq!(e, BleError::GattStatusError(GattStatus(5))),
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(f.session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn disconnect_resolves_once_and_clears_state() {
        let f = fixture();
        connect_with(&f, catalog(), quick(1)).await.unwrap();
        let (_sub, mut events) = f.session.subscribe();

        let count = Arc::new(Mutex::new(0));
        let counter = count.clone();
        let (tx, rx) = oneshot::channel();
        f.session
            .disconnect(Some(Box::new(move |status| {
                *counter.lock().unwrap() += 1;
                let _ = tx.send(status);
            })))
            .unwrap();
        let status = rx.await.unwrap();
        assert_eq!(status.peripheral, f.identity);
        assert!(status.status.is_success());

        assert!(matches!(events.recv().await, Some(SessionEvent::Disconnected(_))));
        settle().await;
        assert_eq!(*count.lock().unwrap(), 1);
        assert_eq!(f.session.state(), SessionState::Disconnected);
        assert!(!f.session.services_available());
        assert_eq!(f.session.read(RX, None), Err(BleError::CharacteristicNotLoaded(RX)));
        assert!(!matches!(events.try_recv(), Ok(SessionEvent::Disconnected(_))));
    }

    #[tokio::test]
    async fn link_loss_returns_to_disconnected() {
        let f = fixture();
        connect_with(&f, catalog(), quick(1)).await.unwrap();
        let (_sub, mut events) = f.session.subscribe();

        f.fake.drop_link();
        match events.recv().await {
            Some(SessionEvent::Disconnected(status)) => {
                assert_eq!(status.peripheral, f.identity);
                assert_eq!(status.status, GattStatus::FAILURE);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(f.session.state(), SessionState::Disconnected);
        assert_eq!(f.session.mtu(), 20);

        connect_with(&f, catalog(), quick(1)).await.unwrap();
        assert_eq!(f.session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn link_loss_fails_an_in_flight_read_once() {
        let f = fixture();
        f.fake.set_read_value(RX, vec![1]);
        connect_with(&f, catalog(), quick(1)).await.unwrap();
        let (_sub, mut events) = f.session.subscribe();

        f.fake.hold_requests();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        f.session
            .read(RX, Some(Box::new(move |c| sink.lock().unwrap().push(c))))
            .unwrap();
        settle().await;
        assert!(f.fake.calls().contains(&Call::Read(RX)));
        assert!(seen.lock().unwrap().is_empty());

        f.fake.drop_link();
        match events.recv().await {
            Some(SessionEvent::ReadCompleted(completion)) => assert_eq!(completion.status, GattStatus::FAILURE),
            other => panic!("unexpected event {:?}", other),
        }
        match events.recv().await {
            Some(SessionEvent::Disconnected(status)) => assert_eq!(status.status, GattStatus::FAILURE),
            other => panic!("unexpected event {:?}", other),
        }
        settle().await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(!seen[0].success());
        assert!(seen[0].data.is_empty());
        assert_eq!(f.session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn disconnect_fails_a_pending_subscribe_once() {
        let f = fixture();
        connect_with(&f, catalog(), quick(1)).await.unwrap();

        f.fake.hold_requests();
        let acks = Arc::new(Mutex::new(Vec::new()));
        let sink = acks.clone();
        f.session
            .enable_notifications(RX, None, Some(Box::new(move |ack| sink.lock().unwrap().push(ack))))
            .unwrap();
        settle().await;
        assert!(f.fake.calls().contains(&Call::Subscribe(RX)));

        let (tx, rx) = oneshot::channel();
        f.session
            .disconnect(Some(Box::new(move |status| {
                let _ = tx.send(status);
            })))
            .unwrap();
        assert_eq!(rx.await.unwrap().status, GattStatus::SUCCESS);
        settle().await;

        let acks = acks.lock().unwrap();
        assert_eq!(acks.len(), 1);
        assert!(!acks[0].success);
        assert_eq!(acks[0].status, GattStatus::FAILURE);
        assert_eq!(f.session.state(), SessionState::Disconnected);
        assert!(f.fake.calls().contains(&Call::Disconnect(f.identity)));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_report_connect_failed() {
        let f = fixture();
        f.fake.fail_connects(u32::MAX);
        let started = tokio::time::Instant::now();

        let result = connect_with(&f, catalog(), quick(4)).await;
        assert!(matches!(result, Err(BleError::ConnectFailed(_))));
        assert_eq!(f.fake.connect_attempts().len(), 4);
        assert!(started.elapsed() >= Duration::from_millis(3000));
        assert_eq!(f.session.state(), SessionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_while_connecting_stops_retries() {
        let f = fixture();
        f.fake.fail_connects(u32::MAX);
        let (tx, rx) = oneshot::channel();
        f.session
            .connect(f.identity, catalog(), quick(10), Box::new(move |r| {
                let _ = tx.send(r);
            }))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        let (dtx, drx) = oneshot::channel();
        f.session
            .disconnect(Some(Box::new(move |s| {
                let _ = dtx.send(s);
            })))
            .unwrap();

        assert_eq!(rx.await.unwrap(), Err(BleError::Cancelled));
        drx.await.unwrap();
        assert_eq!(f.fake.connect_attempts().len(), 2);
        assert_eq!(f.session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn panicking_callback_leaves_session_usable() {
        let f = fixture();
        f.fake.set_read_value(RX, vec![1]);
        connect_with(&f, catalog(), quick(1)).await.unwrap();

        f.session.read(RX, Some(Box::new(|_| panic!("caller bug")))).unwrap();
        let completion = read(&f, RX).await;
        assert!(completion.success());
        assert_eq!(f.session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn shutdown_fails_queued_requests_and_closes_link() {
        let f = fixture();
        f.fake.set_read_value(RX, vec![1]);
        connect_with(&f, catalog(), quick(1)).await.unwrap();

        f.session.shutdown();
        let (tx, rx) = oneshot::channel();
        let _ = f.session.read(RX, Some(Box::new(move |c| {
            let _ = tx.send(c);
        })));
        let completion = rx.await.unwrap();
        assert!(!completion.success());
        settle().await;
        assert!(f.fake.calls().contains(&Call::Disconnect(f.identity)));
        assert_eq!(f.session.state(), SessionState::Disconnected);
    }
}
