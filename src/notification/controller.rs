use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};
use utoipa::ToSchema;

use crate::auth::middleware::AuthUser;
use crate::notification::model::{CreateNotificationRequest, NotificationError};
use crate::websocket::notifications::NotificationState;

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Publish a notification
///
/// Stores the notification in the recipient's feed and pushes it to every
/// connected feed of that recipient.
#[utoipa::path(
    post,
    path = "/api/notifications",
    request_body = CreateNotificationRequest,
    responses(
        (status = 201, description = "Notification created", body = crate::notification::model::Notification),
        (status = 400, description = "Invalid request data", body = ErrorResponse),
        (status = 401, description = "Unauthorized", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    security(
        ("bearer_auth" = [])
    ),
    tag = "notifications"
)]
pub async fn create_notification(
    user: AuthUser,
    State(state): State<Arc<NotificationState>>,
    Json(mut request): Json<CreateNotificationRequest>,
) -> Response {
    if request.related_user_id.is_none() {
        request.related_user_id = Some(user.user_id.to_string());
    }

    match state.collection.create_notification(request).await {
        Ok(notification) => {
            info!(
                "User {} published notification {}",
                user.user_id, notification.id
            );
            (StatusCode::CREATED, Json(notification)).into_response()
        }
        Err(e) => {
            error!("Error creating notification: {}", e);
            let (status, error_response) = match e {
                NotificationError::InvalidPayload(msg) => (
                    StatusCode::BAD_REQUEST,
                    ErrorResponse {
                        error: msg,
                        code: "INVALID_INPUT".to_string(),
                    },
                ),
                _ => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse {
                        error: "Failed to create notification".to_string(),
                        code: "INTERNAL_ERROR".to_string(),
                    },
                ),
            };

            (status, Json(error_response)).into_response()
        }
    }
}
