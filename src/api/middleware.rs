use axum::{async_trait, extract::FromRequestParts, http::request::Parts};

use crate::error::{AppError, Result};

/// Callers are upstream trusted services; they identify the end user via a
/// `user_id` header. Blank or missing rejects with 401. Health is the one
/// route that doesn't extract this.
pub struct RequireUser(pub String);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for RequireUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self> {
        let user_id = parts
            .headers
            .get("user_id")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .ok_or(AppError::Unauthorized)?;

        Ok(RequireUser(user_id.to_string()))
    }
}
