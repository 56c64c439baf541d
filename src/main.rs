mod api_doc;
mod auth;
mod config;
mod db;
mod notification;
mod pubsub;
mod routes;
mod schema_ext;
mod websocket;

use axum::{routing::get, Router};
use dotenv::dotenv;
use redis::Client;
use sqlx::postgres::PgPoolOptions;
use std::{net::SocketAddr, sync::Arc};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::api_doc::ApiDoc;
use crate::config::AppConfig;
use crate::notification::service::PgNotificationCollection;
use crate::pubsub::redis::RedisPubSub;
use crate::websocket::notifications::NotificationState;

const MAX_PORT_ATTEMPTS: u16 = 5;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    // Load .env file if it exists
    dotenv().ok();

    let config = AppConfig::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await?;

    if !db::check_db_initialized(&pool).await {
        db::init_db(&pool).await?;
    }

    info!("Initializing Redis pub/sub with URL: {}", config.redis_url);
    let pubsub = RedisPubSub::new(Client::open(config.redis_url.as_str())?);

    let notification_state = Arc::new(NotificationState {
        collection: Arc::new(PgNotificationCollection::new(pool.clone(), pubsub)),
        feed_config: config.feed.clone(),
    });

    let app = Router::new()
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(routes::health::routes(pool.clone()))
        .merge(routes::notifications::routes(notification_state))
        .route("/", get(|| async { "Live Feed Notifications API" }))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    // Try consecutive ports starting from the configured one
    let mut port = config.port;
    for attempt in 1..=MAX_PORT_ATTEMPTS {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        match axum::Server::try_bind(&addr) {
            Ok(server) => {
                info!("Server started at http://localhost:{}", port);
                info!("API Documentation: http://localhost:{}/docs", port);
                info!(
                    "Live feed: ws://localhost:{}/api/notifications/ws?token=<JWT>",
                    port
                );
                return server
                    .serve(app.into_make_service())
                    .await
                    .map_err(|e| e.into());
            }
            Err(e) => {
                info!("Port {} unavailable (attempt {}): {}", port, attempt, e);
                port = port.saturating_add(1);
            }
        }
    }

    Err("Failed to bind to any port".into())
}
