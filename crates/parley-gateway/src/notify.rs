use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, trace};

use parley_types::events::GatewayEvent;
use parley_types::models::{Notification, UserId, excerpt};

use crate::registry::ConnectionRegistry;

/// Out-of-band "new activity" delivery, independent of room subscription.
///
/// Best effort: an offline recipient simply misses it. Nothing is queued or retried.
pub struct Notifier {
    registry: Arc<ConnectionRegistry>,
}

impl Notifier {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Returns the number of connections the notification reached.
    pub async fn notify(&self, recipient_id: &UserId, sender_id: &UserId, text: &str) -> usize {
        if recipient_id == sender_id {
            debug!("Dropping self-notification for {}", sender_id);
            return 0;
        }

        let event = GatewayEvent::NotificationDelivered(Notification {
            recipient_id: recipient_id.clone(),
            sender_id: sender_id.clone(),
            excerpt: excerpt(text),
            sent_at: Utc::now(),
        });

        let delivered = self.registry.send_to_user(recipient_id, &event).await;
        trace!(
            "Notification {} -> {} reached {} connections",
            sender_id, recipient_id, delivered
        );
        delivered
    }
}
