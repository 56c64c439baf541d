use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tokio::{sync::mpsc, time};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth::jwt::subject_from_token;
use crate::config::FeedConfig;
use crate::notification::feed::{FeedCache, FeedSnapshot};
use crate::notification::remote::RemoteCollection;
use crate::notification::service::PgNotificationCollection;
use crate::notification::toast::{ChannelToastSink, Toast};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Query parameters for WebSocket connections
#[derive(Debug, Deserialize)]
pub struct WebSocketParams {
    token: Option<String>,
}

/// Shared state of the notification routes
pub struct NotificationState {
    pub collection: Arc<PgNotificationCollection>,
    pub feed_config: FeedConfig,
}

/// Frames pushed to the client
#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServerFrame {
    Snapshot(FeedSnapshot),
    Toast(Toast),
    Error { message: String },
}

impl ServerFrame {
    fn into_message(self) -> Option<Message> {
        match serde_json::to_string(&self) {
            Ok(json) => Some(Message::Text(json)),
            Err(e) => {
                error!("Failed to serialize WebSocket frame: {}", e);
                None
            }
        }
    }
}

/// Commands accepted from the client, mapped onto the feed mutations
#[derive(Debug, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientCommand {
    MarkRead { id: String },
    MarkAllRead,
    Delete { id: String },
    DeleteAll,
}

/// Run one client command against the feed. Failures are already logged and
/// toasted by the feed, so only the outcome is traced here.
async fn execute_command(cache: &FeedCache, subject_id: &str, command: ClientCommand) {
    let result = match &command {
        ClientCommand::MarkRead { id } => cache.mark_read(id).await,
        ClientCommand::MarkAllRead => cache.mark_all_read(subject_id).await,
        ClientCommand::Delete { id } => cache.delete_one(id).await,
        ClientCommand::DeleteAll => cache.delete_all(subject_id).await,
    };

    if let Err(e) = result {
        debug!("Command {:?} for {} failed: {}", command, subject_id, e);
    }
}

/// Handle an invalid socket connection (authentication failure)
async fn handle_invalid_socket(mut socket: WebSocket, error_message: String) {
    if let Some(frame) = (ServerFrame::Error {
        message: error_message,
    })
    .into_message()
    {
        if let Err(e) = socket.send(frame).await {
            error!("Error sending error message on WS: {}", e);
        }
    }

    let _ = socket.close().await;
}

/// Serve a live feed over an authenticated socket
async fn handle_valid_connection(
    socket: WebSocket,
    user_id: Uuid,
    remote: Arc<dyn RemoteCollection>,
    feed_config: FeedConfig,
) {
    let subject_id = user_id.to_string();
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(100);
    let (toast_tx, mut toast_rx) = mpsc::unbounded_channel::<Toast>();

    let cache = FeedCache::new(
        remote,
        Arc::new(ChannelToastSink::new(toast_tx)),
        feed_config,
    );

    // Forward messages from channel to WebSocket
    let forward_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Err(e) = ws_sender.send(message).await {
                error!("Error forwarding message to WebSocket: {}", e);
                break;
            }
        }
    });

    // Push every state change as a snapshot frame, starting with the current one
    let tx_snapshots = tx.clone();
    let mut snapshots = cache.watch();
    let snapshot_task = tokio::spawn(async move {
        loop {
            let snapshot = snapshots.borrow_and_update().clone();
            if let Some(frame) = ServerFrame::Snapshot(snapshot).into_message() {
                if tx_snapshots.send(frame).await.is_err() {
                    break;
                }
            }
            if snapshots.changed().await.is_err() {
                break;
            }
        }
    });

    let tx_toasts = tx.clone();
    let toast_task = tokio::spawn(async move {
        while let Some(toast) = toast_rx.recv().await {
            if let Some(frame) = ServerFrame::Toast(toast).into_message() {
                if tx_toasts.send(frame).await.is_err() {
                    break;
                }
            }
        }
    });

    let tx_heartbeat = tx.clone();
    let heartbeat_task = tokio::spawn(async move {
        let mut interval = time::interval(HEARTBEAT_INTERVAL);
        loop {
            interval.tick().await;
            if let Err(e) = tx_heartbeat.send(Message::Ping(vec![])).await {
                error!("Error sending heartbeat: {}", e);
                break;
            }
        }
    });

    cache.start(Some(&subject_id)).await;

    // Process incoming WebSocket messages
    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientCommand>(&text) {
                Ok(command) => execute_command(&cache, &subject_id, command).await,
                Err(e) => {
                    warn!("Ignoring malformed command from user {}: {}", user_id, e);
                    let frame = ServerFrame::Error {
                        message: format!("Invalid command: {}", e),
                    };
                    if let Some(frame) = frame.into_message() {
                        let _ = tx.send(frame).await;
                    }
                }
            },
            Ok(Message::Close(_)) => {
                info!("WebSocket closed by client");
                break;
            }
            Ok(Message::Pong(_)) => {
                debug!("Received pong from client");
            }
            Err(e) => {
                error!("WebSocket error: {}", e);
                break;
            }
            _ => {}
        }
    }

    // Clean up
    cache.stop().await;
    snapshot_task.abort();
    toast_task.abort();
    forward_task.abort();
    heartbeat_task.abort();

    info!("WebSocket connection closed for user: {}", user_id);
}

/// Handle incoming WebSocket connection
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WebSocketParams>,
    State(state): State<Arc<NotificationState>>,
) -> impl IntoResponse {
    let token = params.token.unwrap_or_default();

    let user_id = match subject_from_token(&token) {
        Ok(user_id) => user_id,
        Err(e) => {
            let error_message = format!("Invalid token: {}", e);
            return ws.on_upgrade(move |socket| async move {
                handle_invalid_socket(socket, error_message).await;
            });
        }
    };

    info!("User {} connected to notifications WebSocket", user_id);
    let remote: Arc<dyn RemoteCollection> = state.collection.clone();
    let feed_config = state.feed_config.clone();
    ws.on_upgrade(move |socket| async move {
        handle_valid_connection(socket, user_id, remote, feed_config).await;
    })
}
