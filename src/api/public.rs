use crate::api::routes::AppState;
use crate::failsafe::Principal;
use axum::{
    extract::State,
    http::header,
    response::IntoResponse,
    Extension, Json,
};
use serde_json::json;

/// GET /firebase-public-config
pub async fn firebase_public_config(State(state): State<AppState>) -> impl IntoResponse {
    let public = &state.config.firebase_public;
    (
        [(header::CACHE_CONTROL, "public, max-age=300")],
        Json(json!({
            "apiKey": public.api_key,
            "authDomain": public.auth_domain,
            "projectId": public.project_id,
            "storageBucket": public.storage_bucket,
            "messagingSenderId": public.messaging_sender_id,
            "appId": public.app_id,
        })),
    )
}

/// GET /get-client-ip
pub async fn client_ip(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> impl IntoResponse {
    Json(json!({
        "ip": principal.client_ip,
        "timestamp": state.clock.now().to_rfc3339(),
    }))
}
