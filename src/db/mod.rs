use sqlx::{PgPool, Row};
use tracing::{error, info};

// Postgres rejects multi-statement prepared queries, so each statement runs on its own
const SCHEMA_STATEMENTS: &[&str] = &[
    "CREATE SCHEMA IF NOT EXISTS global",
    "CREATE TABLE IF NOT EXISTS global.notifications (
        id UUID PRIMARY KEY,
        user_id UUID NOT NULL,
        type VARCHAR(50) NOT NULL,
        title TEXT NOT NULL,
        message TEXT NOT NULL,
        is_read BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        listing_id TEXT,
        related_user_id TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_notifications_user_created
        ON global.notifications (user_id, created_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_notifications_user_unread
        ON global.notifications (user_id) WHERE is_read = FALSE",
];

/// Initialize the database schema
pub async fn init_db(pool: &PgPool) -> Result<(), sqlx::Error> {
    info!("Initializing database schema...");

    for statement in SCHEMA_STATEMENTS {
        if let Err(e) = sqlx::query(statement).execute(pool).await {
            error!("Failed to initialize database schema: {}", e);
            return Err(e);
        }
    }

    info!("Database schema initialized successfully");
    Ok(())
}

/// Check if the notifications table exists
pub async fn check_db_initialized(pool: &PgPool) -> bool {
    let result = sqlx::query(
        "SELECT EXISTS (SELECT FROM information_schema.tables WHERE table_schema = 'global' AND table_name = 'notifications')",
    )
    .fetch_one(pool)
    .await;

    match result {
        Ok(row) => row.try_get::<bool, _>(0).unwrap_or(false),
        Err(_) => false,
    }
}
