//! Notification handling
//! Forwards pushes from a subscribed characteristic to the caller's data sink
//! and to session subscribers, until the forwarder is aborted or the stream ends.

use futures_util::StreamExt;
use log::{debug, info};
use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::core::bluetooth::commands::DataSink;
use crate::core::bluetooth::events::{deliver, EventHub};
use crate::core::bluetooth::identity::PeripheralIdentity;
use crate::core::bluetooth::transport::NotificationStream;
use crate::core::bluetooth::types::{Notification, SessionEvent};

/// Notification handler for one characteristic
pub struct NotificationHandler {
    peripheral: PeripheralIdentity,
    characteristic: Uuid,
    on_data: Option<DataSink>,
    events: EventHub<SessionEvent>,
}

impl NotificationHandler {
    pub fn new(
        peripheral: PeripheralIdentity,
        characteristic: Uuid,
        on_data: Option<DataSink>,
        events: EventHub<SessionEvent>,
    ) -> Self {
        Self {
            peripheral,
            characteristic,
            on_data,
            events,
        }
    }

    /// Starts forwarding on a background task
    pub fn spawn(self, stream: NotificationStream) -> AbortHandle {
        info!("Listening for notifications on {}", self.characteristic);
        tokio::spawn(self.process_notifications(stream)).abort_handle()
    }

    async fn process_notifications(self, mut stream: NotificationStream) {
        while let Some(data) = stream.next().await {
            debug!("Received {} bytes from {}", data.len(), self.characteristic);
            let notification = Notification {
                peripheral: self.peripheral,
                characteristic: self.characteristic,
                data,
            };

            if let Some(on_data) = &self.on_data {
                deliver("notification sink", |n| on_data(n), notification.clone());
            }
            self.events.publish(SessionEvent::Notification(notification));
        }
        info!("Notification stream for {} ended", self.characteristic);
    }
}
