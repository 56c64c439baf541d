use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::notification::model::Notification;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToastLevel {
    Success,
    Error,
    Info,
}

/// Optional navigation attached to a toast
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToastAction {
    ViewListing { listing_id: String },
}

/// Ephemeral user-facing message
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Toast {
    pub level: ToastLevel,
    pub title: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<ToastAction>,
}

impl Toast {
    pub fn success(title: &str, message: &str) -> Self {
        Self::new(ToastLevel::Success, title, message)
    }

    pub fn error(title: &str, message: &str) -> Self {
        Self::new(ToastLevel::Error, title, message)
    }

    fn new(level: ToastLevel, title: &str, message: &str) -> Self {
        Self {
            level,
            title: title.to_string(),
            message: message.to_string(),
            action: None,
        }
    }

    /// Toast announcing a freshly inserted notification
    pub fn for_new_notification(notification: &Notification) -> Self {
        Self {
            level: ToastLevel::Info,
            title: notification.title.clone(),
            message: notification.message.clone(),
            action: notification
                .listing_id
                .as_ref()
                .map(|listing_id| ToastAction::ViewListing {
                    listing_id: listing_id.clone(),
                }),
        }
    }
}

/// Where toasts go; the presentation layer decides how to render them
pub trait ToastSink: Send + Sync {
    fn show(&self, toast: Toast);
}

/// Forwards toasts over a tokio channel
#[derive(Debug, Clone)]
pub struct ChannelToastSink {
    tx: mpsc::UnboundedSender<Toast>,
}

impl ChannelToastSink {
    pub fn new(tx: mpsc::UnboundedSender<Toast>) -> Self {
        Self { tx }
    }
}

impl ToastSink for ChannelToastSink {
    fn show(&self, toast: Toast) {
        if self.tx.send(toast).is_err() {
            debug!("Toast receiver dropped, discarding toast");
        }
    }
}
