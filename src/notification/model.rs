use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// A single entry of a user's notification feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Notification {
    pub id: String,
    pub title: String,
    pub message: String,
    #[serde(rename = "type")]
    pub notification_type: String,
    pub is_read: bool,
    #[schema(value_type = DateTimeWrapper)]
    pub created_at: DateTime<Utc>,
    pub listing_id: Option<String>,
    pub related_user_id: Option<String>,
}

impl Notification {
    /// Reject records that cannot be tracked by id
    pub fn validate(&self) -> Result<(), NotificationError> {
        if self.id.trim().is_empty() {
            return Err(NotificationError::InvalidPayload(
                "notification id must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// A row change pushed by the remote collection.
///
/// Wire form: `{"event_type": "INSERT", "record": {...}}`. Delete records only
/// need to carry the id; any other fields are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "record", rename_all = "UPPERCASE")]
pub enum ChangeEvent {
    Insert(Notification),
    Update(Notification),
    Delete { id: String },
}

impl ChangeEvent {
    /// Parse and validate a raw change payload
    pub fn from_payload(payload: &str) -> Result<Self, NotificationError> {
        let event: ChangeEvent = serde_json::from_str(payload)
            .map_err(|e| NotificationError::InvalidPayload(e.to_string()))?;

        match &event {
            ChangeEvent::Insert(record) | ChangeEvent::Update(record) => record.validate()?,
            ChangeEvent::Delete { id } if id.trim().is_empty() => {
                return Err(NotificationError::InvalidPayload(
                    "delete event without id".to_string(),
                ))
            }
            ChangeEvent::Delete { .. } => {}
        }

        Ok(event)
    }

    pub fn record_id(&self) -> &str {
        match self {
            ChangeEvent::Insert(record) | ChangeEvent::Update(record) => &record.id,
            ChangeEvent::Delete { id } => id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ChangeEvent::Insert(_) => "insert",
            ChangeEvent::Update(_) => "update",
            ChangeEvent::Delete { .. } => "delete",
        }
    }
}

/// Partial record sent with update operations
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_read: Option<bool>,
}

impl NotificationPatch {
    pub fn mark_read() -> Self {
        Self {
            is_read: Some(true),
        }
    }
}

/// Request body for publishing a notification to a user's feed
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreateNotificationRequest {
    pub recipient_id: String,
    #[serde(rename = "type")]
    pub notification_type: String,
    pub title: String,
    pub message: String,
    pub listing_id: Option<String>,
    pub related_user_id: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Pub/sub error: {0}")]
    PubSubError(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Notification not found")]
    NotFound,

    #[error("Internal error: {0}")]
    InternalError(String),
}
