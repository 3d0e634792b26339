use crate::api::{parse_body, routes::AppState};
use crate::errors::{AppError, Result};
use crate::external::DescriptionRequest;
use crate::failsafe::Principal;
use axum::{body::Bytes, extract::State, Extension, Json};
use serde_json::{json, Value};

/// POST /generate
///
/// Usage is only counted once a description was produced.
pub async fn generate(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    body: Bytes,
) -> Result<Json<Value>> {
    let user_id = principal.require_user()?;
    let request: DescriptionRequest = parse_body(&body)?;
    if request.user_id != user_id {
        return Err(AppError::UserIdMismatch);
    }
    request.validate().map_err(AppError::InvalidInput)?;

    let description = state.generator.generate(&request).await?;
    let usage = state.lifecycle.increment_usage(user_id).await?;

    tracing::info!(
        user_id = %user_id,
        current_usage = usage.current_usage,
        max_usage = usage.max_usage,
        "Description generated"
    );
    Ok(Json(json!({
        "description": description,
        "success": true,
        "usage": usage,
    })))
}
