pub mod admin;
pub mod generate;
pub mod health;
pub mod paypal;
pub mod public;
pub mod routes;
pub mod users;

pub use routes::{create_router, AppState};

use crate::errors::{AppError, Result};
use serde::de::DeserializeOwned;

/// Decode a JSON body already buffered by the gate
pub(crate) fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    if body.is_empty() {
        return Err(AppError::InvalidInput("Request body is required".to_string()));
    }
    serde_json::from_slice(body)
        .map_err(|e| AppError::InvalidInput(format!("Malformed request body: {}", e)))
}
