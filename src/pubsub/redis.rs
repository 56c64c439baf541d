use futures::StreamExt;
use redis::{AsyncCommands, Client};
use tracing::{debug, info};

use crate::notification::model::{ChangeEvent, NotificationError};
use crate::notification::remote::ChangeStream;

// Per-subject change channel, e.g. notifications:user:<uuid>
pub const NOTIFICATION_CHANNEL_PREFIX: &str = "notifications:user";

/// Redis pub/sub transport for notification change events
#[derive(Debug, Clone)]
pub struct RedisPubSub {
    client: Client,
}

impl RedisPubSub {
    pub fn new(client: Client) -> Self {
        // Connections are opened lazily on first publish/subscribe
        Self { client }
    }

    pub fn channel_for(subject_id: &str) -> String {
        format!("{}:{}", NOTIFICATION_CHANNEL_PREFIX, subject_id)
    }

    /// Publish one change event on the subject's channel
    pub async fn publish_change(
        &self,
        subject_id: &str,
        event: &ChangeEvent,
    ) -> Result<(), NotificationError> {
        let json = serde_json::to_string(event)?;
        let channel_name = Self::channel_for(subject_id);

        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let receivers: i64 = conn.publish(&channel_name, json).await?;

        debug!(
            "Published {} event for {} to {} ({} receivers)",
            event.kind(),
            event.record_id(),
            channel_name,
            receivers
        );
        Ok(())
    }

    /// Publish a batch of `(subject, event)` changes over one connection in a
    /// single pipeline
    pub async fn publish_changes(
        &self,
        changes: &[(String, ChangeEvent)],
    ) -> Result<(), NotificationError> {
        if changes.is_empty() {
            return Ok(());
        }
        let messages = encode_changes(changes)?;

        let mut pipe = redis::pipe();
        for (channel_name, json) in &messages {
            pipe.publish(channel_name, json).ignore();
        }

        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: () = pipe.query_async(&mut conn).await?;

        debug!("Published {} change events in one pipeline", messages.len());
        Ok(())
    }

    /// Subscribe to the subject's channel and decode each message into a
    /// change event. Undecodable messages surface as stream errors.
    pub async fn subscribe_changes(&self, subject_id: &str) -> Result<ChangeStream, NotificationError> {
        let channel_name = Self::channel_for(subject_id);
        info!("Subscribing to Redis channel: {}", channel_name);

        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&channel_name).await?;

        info!("Successfully subscribed to Redis channel: {}", channel_name);

        let stream = pubsub
            .into_on_message()
            .map(|msg| -> Result<ChangeEvent, NotificationError> {
                let payload: String = msg.get_payload()?;
                ChangeEvent::from_payload(&payload)
            });

        Ok(stream.boxed())
    }
}

/// Channel name and JSON payload for each change, in order
fn encode_changes(
    changes: &[(String, ChangeEvent)],
) -> Result<Vec<(String, String)>, NotificationError> {
    changes
        .iter()
        .map(|(subject_id, event)| {
            Ok((
                RedisPubSub::channel_for(subject_id),
                serde_json::to_string(event)?,
            ))
        })
        .collect()
}
