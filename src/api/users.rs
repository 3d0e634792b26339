// Trial, status and subscription endpoints

use crate::api::{parse_body, routes::AppState};
use crate::authz::headers::cookie_value;
use crate::domain::UserStatus;
use crate::errors::{AppError, Result};
use crate::failsafe::Principal;
use crate::users::UpgradeRequest;
use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::Deserialize;
use serde_json::json;
use std::net::IpAddr;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateTrialRequest {
    ip_address: Option<String>,
}

/// GET /check-user-status
pub async fn check_user_status(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<UserStatus>> {
    let user_id = principal.require_user()?;
    Ok(Json(state.lifecycle.status(user_id).await?))
}

/// POST /create-trial-user
///
/// Answers with a long-lived device cookie so a second trial from the same
/// browser is refused even under a new account.
pub async fn create_trial_user(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let user_id = principal.require_user()?;
    let email = principal
        .email
        .as_deref()
        .ok_or_else(|| AppError::InvalidInput("Account has no email address".to_string()))?;
    let request: CreateTrialRequest = if body.is_empty() {
        CreateTrialRequest::default()
    } else {
        parse_body(&body)?
    };

    // Only a well-formed address is stored; otherwise the observed one
    let ip_address = request
        .ip_address
        .filter(|ip| ip.parse::<IpAddr>().is_ok())
        .unwrap_or_else(|| principal.client_ip.clone());

    let security = &state.config.security;
    let device_registered = cookie_value(&headers, &security.device_signup_cookie).is_some();
    let trial = state
        .lifecycle
        .create_trial(user_id, email, &ip_address, device_registered)
        .await?;

    let mut response = (
        StatusCode::OK,
        Json(json!({ "success": true, "status": UserStatus::for_trial(&trial) })),
    )
        .into_response();
    let cookie = format!(
        "{}=1; Max-Age={}; Path=/; Secure; HttpOnly; SameSite=Strict",
        security.device_signup_cookie,
        security.device_signup_max_age_days * 24 * 60 * 60
    );
    if let Ok(value) = HeaderValue::from_str(&cookie) {
        response.headers_mut().append(header::SET_COOKIE, value);
    }
    Ok(response)
}

/// POST /upgrade-to-subscription (payment webhook)
pub async fn upgrade_to_subscription(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<serde_json::Value>> {
    let request: UpgradeRequest = parse_body(&body)?;
    let user = state.lifecycle.upgrade(&request).await?;
    Ok(Json(json!({
        "success": true,
        "status": UserStatus::for_subscriber(&user),
    })))
}
