use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::notification::model::{
    ChangeEvent, CreateNotificationRequest, Notification, NotificationError, NotificationPatch,
};
use crate::notification::remote::{ChangeStream, RemoteCollection};
use crate::pubsub::redis::RedisPubSub;

const NOTIFICATION_COLUMNS: &str =
    "id, user_id, type, title, message, is_read, created_at, listing_id, related_user_id";

#[derive(Debug, Clone, FromRow)]
struct NotificationRow {
    id: Uuid,
    user_id: Uuid,
    #[sqlx(rename = "type")]
    notification_type: String,
    title: String,
    message: String,
    is_read: bool,
    created_at: DateTime<Utc>,
    listing_id: Option<String>,
    related_user_id: Option<String>,
}

impl From<NotificationRow> for Notification {
    fn from(row: NotificationRow) -> Self {
        Notification {
            id: row.id.to_string(),
            title: row.title,
            message: row.message,
            notification_type: row.notification_type,
            is_read: row.is_read,
            created_at: row.created_at,
            listing_id: row.listing_id,
            related_user_id: row.related_user_id,
        }
    }
}

fn parse_id(value: &str, what: &str) -> Result<Uuid, NotificationError> {
    Uuid::parse_str(value.trim())
        .map_err(|e| NotificationError::InvalidPayload(format!("invalid {} '{}': {}", what, value, e)))
}

/// Notification collection stored in Postgres, with row changes fanned out
/// over Redis pub/sub
#[derive(Debug, Clone)]
pub struct PgNotificationCollection {
    pool: PgPool,
    pubsub: RedisPubSub,
}

impl PgNotificationCollection {
    pub fn new(pool: PgPool, pubsub: RedisPubSub) -> Self {
        Self { pool, pubsub }
    }

    /// Insert a notification into the recipient's feed and announce it
    pub async fn create_notification(
        &self,
        request: CreateNotificationRequest,
    ) -> Result<Notification, NotificationError> {
        let recipient_id = parse_id(&request.recipient_id, "recipient id")?;
        info!(
            "Creating notification for recipient {} of type {}",
            recipient_id, request.notification_type
        );

        let row = sqlx::query_as::<_, NotificationRow>(&format!(
            "INSERT INTO global.notifications
                (id, user_id, type, title, message, is_read, created_at, listing_id, related_user_id)
             VALUES ($1, $2, $3, $4, $5, false, $6, $7, $8)
             RETURNING {}",
            NOTIFICATION_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(recipient_id)
        .bind(&request.notification_type)
        .bind(&request.title)
        .bind(&request.message)
        .bind(Utc::now())
        .bind(&request.listing_id)
        .bind(&request.related_user_id)
        .fetch_one(&self.pool)
        .await?;

        let notification = Notification::from(row);
        self.announce(
            &recipient_id.to_string(),
            ChangeEvent::Insert(notification.clone()),
        )
        .await;

        Ok(notification)
    }

    // The row change is already committed; a failed publish only delays
    // listeners until their next initial fetch.
    async fn announce(&self, subject_id: &str, event: ChangeEvent) {
        if let Err(e) = self.pubsub.publish_change(subject_id, &event).await {
            error!(
                "Failed to publish {} event for notification {}: {}",
                event.kind(),
                event.record_id(),
                e
            );
        }
    }

    async fn announce_rows(&self, rows: Vec<NotificationRow>, to_event: fn(Notification) -> ChangeEvent) {
        let changes = row_changes(rows, to_event);
        if let Err(e) = self.pubsub.publish_changes(&changes).await {
            error!(
                "Failed to publish {} change events: {}",
                changes.len(),
                e
            );
        }
    }
}

fn row_changes(
    rows: Vec<NotificationRow>,
    to_event: fn(Notification) -> ChangeEvent,
) -> Vec<(String, ChangeEvent)> {
    rows.into_iter()
        .map(|row| (row.user_id.to_string(), to_event(Notification::from(row))))
        .collect()
}

#[async_trait]
impl RemoteCollection for PgNotificationCollection {
    async fn fetch_page(
        &self,
        subject_id: &str,
        limit: i64,
    ) -> Result<Vec<Notification>, NotificationError> {
        let user_id = parse_id(subject_id, "subject id")?;

        let rows = sqlx::query_as::<_, NotificationRow>(&format!(
            "SELECT {} FROM global.notifications
             WHERE user_id = $1
             ORDER BY created_at DESC
             LIMIT $2",
            NOTIFICATION_COLUMNS
        ))
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        debug!("Fetched {} notifications for user {}", rows.len(), user_id);
        Ok(rows.into_iter().map(Notification::from).collect())
    }

    async fn subscribe(&self, subject_id: &str) -> Result<ChangeStream, NotificationError> {
        let user_id = parse_id(subject_id, "subject id")?;
        self.pubsub.subscribe_changes(&user_id.to_string()).await
    }

    async fn update_by_id(
        &self,
        id: &str,
        patch: NotificationPatch,
    ) -> Result<(), NotificationError> {
        let notification_id = parse_id(id, "notification id")?;

        let rows = sqlx::query_as::<_, NotificationRow>(&format!(
            "UPDATE global.notifications
             SET is_read = COALESCE($2, is_read)
             WHERE id = $1
             RETURNING {}",
            NOTIFICATION_COLUMNS
        ))
        .bind(notification_id)
        .bind(patch.is_read)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            debug!("Update matched no notification with id {}", notification_id);
        }
        self.announce_rows(rows, ChangeEvent::Update).await;
        Ok(())
    }

    async fn update_unread_for_subject(
        &self,
        subject_id: &str,
        patch: NotificationPatch,
    ) -> Result<(), NotificationError> {
        let user_id = parse_id(subject_id, "subject id")?;

        let rows = sqlx::query_as::<_, NotificationRow>(&format!(
            "UPDATE global.notifications
             SET is_read = COALESCE($2, is_read)
             WHERE user_id = $1 AND is_read = false
             RETURNING {}",
            NOTIFICATION_COLUMNS
        ))
        .bind(user_id)
        .bind(patch.is_read)
        .fetch_all(&self.pool)
        .await?;

        info!("Updated {} unread notifications for user {}", rows.len(), user_id);
        self.announce_rows(rows, ChangeEvent::Update).await;
        Ok(())
    }

    async fn delete_by_id(&self, id: &str) -> Result<(), NotificationError> {
        let notification_id = parse_id(id, "notification id")?;

        let rows = sqlx::query_as::<_, NotificationRow>(&format!(
            "DELETE FROM global.notifications WHERE id = $1 RETURNING {}",
            NOTIFICATION_COLUMNS
        ))
        .bind(notification_id)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            debug!("Delete matched no notification with id {}", notification_id);
        }
        self.announce_rows(rows, |record| ChangeEvent::Delete { id: record.id })
            .await;
        Ok(())
    }

    async fn delete_for_subject(&self, subject_id: &str) -> Result<(), NotificationError> {
        let user_id = parse_id(subject_id, "subject id")?;

        let rows = sqlx::query_as::<_, NotificationRow>(&format!(
            "DELETE FROM global.notifications WHERE user_id = $1 RETURNING {}",
            NOTIFICATION_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        info!("Deleted {} notifications for user {}", rows.len(), user_id);
        self.announce_rows(rows, |record| ChangeEvent::Delete { id: record.id })
            .await;
        Ok(())
    }
}
