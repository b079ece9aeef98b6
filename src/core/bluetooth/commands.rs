//! Queued GATT operations
//! Each command carries the caller's completion callback and resolves it
//! exactly once, either from a transport result or through [`GattCommand::fail`].

use std::sync::Arc;

use log::{debug, warn};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::bluetooth::error::{BleError, TransportError};
use crate::core::bluetooth::events::deliver;
use crate::core::bluetooth::identity::PeripheralIdentity;
use crate::core::bluetooth::transport::GattTransport;
use crate::core::bluetooth::types::{
    ConnectionStatus, GattStatus, MtuResult, Notification, ReadCompletion, SessionEvent, WriteCompletion,
};

pub type ConnectCallback = Box<dyn FnOnce(Result<(), BleError>) + Send>;
pub type MtuCallback = Box<dyn FnOnce(MtuResult) + Send>;
pub type ReadCallback = Box<dyn FnOnce(ReadCompletion) + Send>;
/// Also used to acknowledge notification enable/disable
pub type WriteCallback = Box<dyn FnOnce(WriteCompletion) + Send>;
pub type BondCallback = Box<dyn FnOnce(Result<(), BleError>) + Send>;
pub type DisconnectCallback = Box<dyn FnOnce(ConnectionStatus) + Send>;
/// Continuous notification sink, invoked once per push
pub type DataSink = Arc<dyn Fn(Notification) + Send + Sync>;

/// A GATT request waiting in the session queue
pub enum GattCommand {
    Read {
        characteristic: Uuid,
        on_result: Option<ReadCallback>,
    },
    Write {
        characteristic: Uuid,
        payload: Vec<u8>,
        on_result: Option<WriteCallback>,
    },
    EnableNotifications {
        characteristic: Uuid,
        on_data: Option<DataSink>,
        on_ack: Option<WriteCallback>,
    },
    DisableNotifications {
        characteristic: Uuid,
        on_ack: Option<WriteCallback>,
    },
    RequestMtu {
        mtu: u16,
        on_result: Option<MtuCallback>,
    },
    Bond {
        on_result: Option<BondCallback>,
    },
}

impl std::fmt::Debug for GattCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.characteristic() {
            Some(uuid) => write!(f, "{}({})", self.kind(), uuid),
            None => f.write_str(self.kind()),
        }
    }
}

impl GattCommand {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Read { .. } => "read",
            Self::Write { .. } => "write",
            Self::EnableNotifications { .. } => "enable-notifications",
            Self::DisableNotifications { .. } => "disable-notifications",
            Self::RequestMtu { .. } => "request-mtu",
            Self::Bond { .. } => "bond",
        }
    }

    /// Target characteristic, for the per-characteristic operations
    pub fn characteristic(&self) -> Option<Uuid> {
        match self {
            Self::Read { characteristic, .. }
            | Self::Write { characteristic, .. }
            | Self::EnableNotifications { characteristic, .. }
            | Self::DisableNotifications { characteristic, .. } => Some(*characteristic),
            Self::RequestMtu { .. } | Self::Bond { .. } => None,
        }
    }

    /// Resolves the command's callback with a failure carrying `error`'s status.
    ///
    /// Returns the completion event to publish, when the command has one.
    pub fn fail(self, peripheral: Option<PeripheralIdentity>, mtu: u16, error: BleError) -> Option<SessionEvent> {
        debug!("Failing queued {:?}: {}", self, error);
        let status = error.status();
        match self {
            Self::Read {
                characteristic,
                on_result,
            } => Some(resolve_read(
                on_result,
                ReadCompletion {
                    peripheral,
                    characteristic,
                    data: Vec::new(),
                    status,
                },
            )),
            Self::Write {
                characteristic,
                on_result,
                ..
            }
            | Self::EnableNotifications {
                characteristic,
                on_ack: on_result,
                ..
            }
            | Self::DisableNotifications {
                characteristic,
                on_ack: on_result,
            } => Some(resolve_write(
                on_result,
                WriteCompletion {
                    peripheral,
                    characteristic,
                    success: false,
                    bytes_written: 0,
                    status,
                },
            )),
            Self::RequestMtu { on_result, .. } => Some(resolve_mtu(
                on_result,
                MtuResult {
                    mtu,
                    success: false,
                    status,
                },
            )),
            Self::Bond { on_result } => {
                if let Some(callback) = on_result {
                    deliver("bond callback", callback, Err(error));
                }
                peripheral.map(|peripheral| SessionEvent::Bonded(ConnectionStatus { peripheral, status }))
            }
        }
    }
}

pub(crate) fn resolve_read(on_result: Option<ReadCallback>, completion: ReadCompletion) -> SessionEvent {
    if let Some(callback) = on_result {
        deliver("read callback", callback, completion.clone());
    }
    SessionEvent::ReadCompleted(completion)
}

pub(crate) fn resolve_write(on_result: Option<WriteCallback>, completion: WriteCompletion) -> SessionEvent {
    if let Some(callback) = on_result {
        deliver("write callback", callback, completion.clone());
    }
    SessionEvent::WriteCompleted(completion)
}

pub(crate) fn resolve_mtu(on_result: Option<MtuCallback>, result: MtuResult) -> SessionEvent {
    if let Some(callback) = on_result {
        deliver("mtu callback", callback, result);
    }
    SessionEvent::MtuChanged(result)
}

/// Whether a write went through, judged from what the stack reports as sent.
///
/// An absent echo counts as success because some stacks never report one.
pub fn write_succeeded(payload: &[u8], echo: Option<&[u8]>) -> bool {
    match echo {
        Some(sent) => sent.len() == payload.len() && sent.iter().zip(payload).all(|(a, b)| a == b),
        None => true,
    }
}

/// Runs single requests against the transport and shapes their completions
pub struct CommandExecutor<'a, T: GattTransport> {
    transport: &'a T,
    peripheral: PeripheralIdentity,
    cancel_token: &'a CancellationToken,
}

impl<'a, T: GattTransport> CommandExecutor<'a, T> {
    pub fn new(transport: &'a T, peripheral: PeripheralIdentity, cancel_token: &'a CancellationToken) -> Self {
        Self {
            transport,
            peripheral,
            cancel_token,
        }
    }

    /// Awaits a transport request, giving up if the connection is being torn down
    pub async fn cancellable<R>(
        &self,
        request: impl std::future::Future<Output = Result<R, TransportError>>,
    ) -> Result<R, TransportError> {
        tokio::select! {
            biased;
            _ = self.cancel_token.cancelled() => Err(TransportError::failure("operation cancelled by disconnect")),
            result = request => result,
        }
    }

    pub async fn read(&self, characteristic: Uuid, handle: &T::Characteristic) -> ReadCompletion {
        let (data, status) = match self.cancellable(self.transport.read(handle)).await {
            Ok(data) => {
                debug!("Read {} bytes from {}", data.len(), characteristic);
                (data, GattStatus::SUCCESS)
            }
            Err(e) => {
                warn!("Read of {} failed: {}", characteristic, e);
                (Vec::new(), e.status)
            }
        };
        ReadCompletion {
            peripheral: Some(self.peripheral),
            characteristic,
            data,
            status,
        }
    }

    pub async fn write(&self, characteristic: Uuid, handle: &T::Characteristic, payload: &[u8]) -> WriteCompletion {
        let (success, bytes_written, status) = match self.cancellable(self.transport.write(handle, payload)).await {
            Ok(echo) => {
                let success = write_succeeded(payload, echo.as_deref());
                if !success {
                    warn!("Write to {} echoed different bytes than were sent", characteristic);
                }
                let written = echo.map_or(payload.len(), |e| e.len());
                debug!("Wrote {} bytes to {}", written, characteristic);
                (success, written, GattStatus::SUCCESS)
            }
            Err(e) => {
                warn!("Write to {} failed: {}", characteristic, e);
                (false, 0, e.status)
            }
        };
        WriteCompletion {
            peripheral: Some(self.peripheral),
            characteristic,
            success,
            bytes_written,
            status,
        }
    }

    pub async fn request_mtu(&self, peripheral: &T::Peripheral, mtu: u16, current: u16) -> MtuResult {
        match self.cancellable(self.transport.request_mtu(peripheral, mtu)).await {
            Ok(negotiated) => MtuResult {
                mtu: negotiated,
                success: true,
                status: GattStatus::SUCCESS,
            },
            Err(e) => {
                warn!("MTU request of {} failed: {}", mtu, e);
                MtuResult {
                    mtu: current,
                    success: false,
                    status: e.status,
                }
            }
        }
    }

    /// Bonds with the peripheral; a rejection carries the platform status
    pub async fn bond(&self, peripheral: &T::Peripheral) -> Result<(), BleError> {
        self.cancellable(self.transport.bond(peripheral)).await.map_err(|e| {
            debug!("Bond request rejected: {}", e.message);
            BleError::GattStatusError(e.status)
        })
    }
}
