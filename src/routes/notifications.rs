use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::auth::middleware::auth_middleware;
use crate::notification::controller;
use crate::websocket::notifications::{ws_handler, NotificationState};

/// Live feed socket plus the authenticated publish endpoint
pub fn routes(notification_state: Arc<NotificationState>) -> Router {
    // The socket authenticates through its `token` query parameter
    let socket_routes = Router::new()
        .route("/api/notifications/ws", get(ws_handler))
        .with_state(notification_state.clone());

    let private_routes = Router::new()
        .route("/api/notifications", post(controller::create_notification))
        .route_layer(middleware::from_fn(auth_middleware))
        .with_state(notification_state);

    socket_routes.merge(private_routes)
}
