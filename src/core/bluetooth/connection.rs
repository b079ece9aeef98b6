//! Bluetooth connection handling
//! Connects with a bounded retry loop, then discovers services and checks
//! them against the caller's capability catalog.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::AdaptorConfig;
use crate::core::bluetooth::capability::CapabilityCatalog;
use crate::core::bluetooth::constants::{CONNECT_RETRIES, CONNECT_RETRY_DELAY_MS};
use crate::core::bluetooth::error::{BleError, TransportError};
use crate::core::bluetooth::transport::GattTransport;

/// Options for one connect request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    /// MTU to request once ready, 0 for none
    pub mtu: u16,
    /// Request bonding once ready
    pub bond: bool,
    /// Connection attempts before giving up
    pub retries: u32,
    pub retry_delay: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            mtu: 0,
            bond: false,
            retries: CONNECT_RETRIES,
            retry_delay: Duration::from_millis(CONNECT_RETRY_DELAY_MS),
        }
    }
}

impl From<&AdaptorConfig> for ConnectOptions {
    fn from(config: &AdaptorConfig) -> Self {
        Self {
            mtu: config.requested_mtu,
            bond: config.bond,
            retries: config.connect_retries,
            retry_delay: Duration::from_millis(config.connect_retry_delay_ms),
        }
    }
}

/// Services of a connected peripheral after validation
#[derive(Debug, Clone)]
pub struct ValidatedServices<C> {
    /// Every service id the peripheral reported
    pub services: Vec<Uuid>,
    /// Catalog characteristic id -> platform handle
    pub handles: HashMap<Uuid, C>,
}

/// Connection manager for one connect request
pub struct ConnectionManager<T: GattTransport> {
    transport: Arc<T>,
    max_retries: u32,
    retry_delay: Duration,
}

impl<T: GattTransport> ConnectionManager<T> {
    pub fn new(transport: Arc<T>, options: &ConnectOptions) -> Self {
        Self {
            transport,
            max_retries: options.retries.max(1),
            retry_delay: options.retry_delay,
        }
    }

    /// Connects with retries. Stops early with `Cancelled` once the token fires.
    pub async fn connect_with_retry(
        &self,
        peripheral: &T::Peripheral,
        cancel_token: &CancellationToken,
    ) -> Result<(), BleError> {
        let mut last_error = None;

        for attempt in 1..=self.max_retries {
            let result = tokio::select! {
                biased;
                _ = cancel_token.cancelled() => return Err(BleError::Cancelled),
                result = self.transport.connect(peripheral) => result,
            };

            match result {
                Ok(()) => {
                    info!("Successfully connected to device (attempt {})", attempt);
                    return Ok(());
                }
                Err(e) => {
                    warn!("Connection attempt {} failed: {}", attempt, e);
                    last_error = Some(e);

                    if attempt < self.max_retries {
                        info!("Retrying connection in {} ms...", self.retry_delay.as_millis());
                        tokio::select! {
                            biased;
                            _ = cancel_token.cancelled() => return Err(BleError::Cancelled),
                            _ = tokio::time::sleep(self.retry_delay) => {}
                        }
                    }
                }
            }
        }

        let error = last_error.unwrap_or_else(|| {
            TransportError::failure(format!("Failed to connect after {} attempts", self.max_retries))
        });
        Err(BleError::ConnectFailed(error))
    }

    /// Discovers services and resolves every catalog characteristic to a handle
    pub async fn discover_and_validate(
        &self,
        peripheral: &T::Peripheral,
        catalog: &CapabilityCatalog,
        cancel_token: &CancellationToken,
    ) -> Result<ValidatedServices<T::Characteristic>, BleError> {
        info!("Connection successful, discovering services...");
        let remote = tokio::select! {
            biased;
            _ = cancel_token.cancelled() => return Err(BleError::Cancelled),
            result = self.transport.discover_services(peripheral) => result?,
        };

        for service in &remote {
            debug!(
                "Available service: {} ({} characteristics)",
                service.uuid,
                service.characteristics.len()
            );
        }

        let handles = catalog.validate(&remote)?;
        info!("Validated {} catalog characteristics", handles.len());
        Ok(ValidatedServices {
            services: remote.iter().map(|s| s.uuid).collect(),
            handles,
        })
    }
}
