use axum::http::StatusCode;
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// JWT claims; `sub` is the feed subject (user id)
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
    pub iat: usize,
}

/// Validate a JWT token and extract claims
pub fn validate_token(token: &str) -> Result<Claims, JwtError> {
    let jwt_secret = std::env::var("JWT_SECRET").map_err(|_| JwtError::MissingSecret)?;

    let mut validation = Validation::default();
    validation.validate_exp = true;
    validation.leeway = 0;

    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(jwt_secret.as_bytes()),
        &validation,
    )
    .map_err(|_| JwtError::InvalidToken)?;

    Ok(token_data.claims)
}

/// Validate a token and return its subject as a user id
pub fn subject_from_token(token: &str) -> Result<Uuid, JwtError> {
    let claims = validate_token(token)?;
    Uuid::parse_str(&claims.sub).map_err(|_| JwtError::InvalidSubject)
}

#[derive(Debug, PartialEq)]
pub enum JwtError {
    MissingSecret,
    InvalidToken,
    InvalidSubject,
}

impl fmt::Display for JwtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JwtError::MissingSecret => write!(f, "JWT secret is missing or not set"),
            JwtError::InvalidToken => write!(f, "Invalid or expired JWT token"),
            JwtError::InvalidSubject => write!(f, "Invalid user identifier in token"),
        }
    }
}

impl From<JwtError> for StatusCode {
    fn from(err: JwtError) -> Self {
        match err {
            JwtError::MissingSecret => StatusCode::INTERNAL_SERVER_ERROR,
            JwtError::InvalidToken | JwtError::InvalidSubject => StatusCode::UNAUTHORIZED,
        }
    }
}

/// Sessions are minted by the identity service; tests issue their own
#[cfg(test)]
pub fn generate_token(subject_id: &Uuid) -> String {
    use chrono::{Duration, Utc};
    use jsonwebtoken::{encode, EncodingKey, Header};

    let jwt_secret = std::env::var("JWT_SECRET").expect("JWT_SECRET must be set in tests");
    let now = Utc::now();
    let claims = Claims {
        sub: subject_id.to_string(),
        exp: (now + Duration::hours(24)).timestamp() as usize,
        iat: now.timestamp() as usize,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(jwt_secret.as_bytes()),
    )
    .expect("token encoding failed")
}
