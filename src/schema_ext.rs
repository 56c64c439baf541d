use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Schema stand-in for `DateTime<Utc>` fields
#[derive(Serialize, Deserialize, ToSchema)]
#[schema(value_type = String, format = "date-time", example = "2024-05-01T10:00:00Z")]
pub struct DateTimeWrapper(pub DateTime<Utc>);
