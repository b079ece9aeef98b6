//! Application state management
//! This module owns the adaptor for the lifetime of the application.

use std::sync::Arc;

use crate::config::AdaptorConfig;
use crate::core::bluetooth::{BleAdaptor, GattTransport};

/// Application state
pub struct AppState<T: GattTransport> {
    /// The adaptor instance
    pub adaptor: Arc<BleAdaptor<T>>,
}

impl<T: GattTransport> AppState<T> {
    /// Creates the state around `transport`. Must be called inside a tokio runtime.
    pub fn new(transport: Arc<T>, config: AdaptorConfig) -> Self {
        let adaptor = BleAdaptor::new(transport, config);
        adaptor.create_adaptor();
        Self {
            adaptor: Arc::new(adaptor),
        }
    }

    pub fn config(&self) -> &AdaptorConfig {
        self.adaptor.config()
    }
}

#[cfg(feature = "bluest")]
impl AppState<crate::core::bluetooth::BluestTransport> {
    /// Opens the system adapter and builds the state on it
    pub async fn with_system_adapter(config: AdaptorConfig) -> anyhow::Result<Self> {
        use crate::core::bluetooth::BluestTransport;
        use log::info;

        info!("Initializing bluetooth adaptor...");
        let transport = BluestTransport::new().await?;
        Ok(Self::new(Arc::new(transport), config))
    }
}
