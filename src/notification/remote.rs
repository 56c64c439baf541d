use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::notification::model::{ChangeEvent, Notification, NotificationError, NotificationPatch};

/// Change events for one subject, in commit order
pub type ChangeStream = BoxStream<'static, Result<ChangeEvent, NotificationError>>;

/// The remote source of truth for a per-subject notification collection.
///
/// Every mutation is expected to be echoed on the subject's change stream,
/// one event per affected record.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteCollection: Send + Sync {
    /// Newest `limit` records of the subject, ordered by `created_at` descending
    async fn fetch_page(
        &self,
        subject_id: &str,
        limit: i64,
    ) -> Result<Vec<Notification>, NotificationError>;

    /// Open the subject's change stream
    async fn subscribe(&self, subject_id: &str) -> Result<ChangeStream, NotificationError>;

    async fn update_by_id(&self, id: &str, patch: NotificationPatch)
        -> Result<(), NotificationError>;

    /// Apply `patch` to every unread record of the subject
    async fn update_unread_for_subject(
        &self,
        subject_id: &str,
        patch: NotificationPatch,
    ) -> Result<(), NotificationError>;

    async fn delete_by_id(&self, id: &str) -> Result<(), NotificationError>;

    async fn delete_for_subject(&self, subject_id: &str) -> Result<(), NotificationError>;
}
