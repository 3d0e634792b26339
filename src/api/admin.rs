use crate::api::{parse_body, routes::AppState};
use crate::errors::Result;
use crate::failsafe::Principal;
use crate::users::AdminRequest;
use axum::{body::Bytes, extract::State, Extension, Json};
use serde_json::Value;

/// POST /admin
pub async fn admin(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    body: Bytes,
) -> Result<Json<Value>> {
    let request: AdminRequest = parse_body(&body)?;
    let actor = principal.email.as_deref().unwrap_or("unknown");
    Ok(Json(state.admin.execute(request, actor).await?))
}
