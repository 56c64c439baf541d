use utoipa::openapi::security::{Http, HttpAuthScheme, SecurityScheme};
use utoipa::{Modify, OpenApi};

/// Registers the bearer token scheme
pub struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            SecurityScheme::Http(Http::new(HttpAuthScheme::Bearer)),
        );
    }
}

/// API documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Live Feed Notifications API",
        version = "0.1.0",
        description = "Real-time notification feeds. Connect to `/api/notifications/ws?token=<JWT>` for a live feed."
    ),
    paths(
        crate::routes::health::health_check,
        crate::routes::health::protected_health_check,
        crate::notification::controller::create_notification
    ),
    components(
        schemas(
            crate::routes::health::HealthResponse,
            crate::notification::model::Notification,
            crate::notification::model::CreateNotificationRequest,
            crate::notification::controller::ErrorResponse,
            crate::schema_ext::DateTimeWrapper
        )
    ),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "notifications", description = "Notification feed endpoints")
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDoc;
