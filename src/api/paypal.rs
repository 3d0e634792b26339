use crate::api::{parse_body, routes::AppState};
use crate::errors::{AppError, Result};
use crate::failsafe::Principal;
use axum::{body::Bytes, extract::State, Extension, Json};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
enum PaymentAction {
    CreateSubscription,
    CaptureOrder,
    GetSubscriptionStatus,
    GetPlanIds,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaymentRequest {
    action: PaymentAction,
    plan_name: Option<String>,
    email: Option<String>,
    #[serde(rename = "orderID")]
    order_id: Option<String>,
    subscription_id: Option<String>,
}

fn required<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::InvalidInput(format!("{} is required", name)))
}

/// POST /paypal
pub async fn paypal(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    body: Bytes,
) -> Result<Json<Value>> {
    let user_id = principal.require_user()?;
    let request: PaymentRequest = parse_body(&body)?;
    let payments = &state.payments;

    let response = match request.action {
        PaymentAction::CreateSubscription => {
            let plan_name = required(&request.plan_name, "planName")?;
            let email = request
                .email
                .as_deref()
                .or(principal.email.as_deref())
                .ok_or_else(|| AppError::InvalidInput("email is required".to_string()))?;
            let created = payments.create_subscription(plan_name, email, user_id).await?;
            tracing::info!(user_id = %user_id, plan = %plan_name, "Subscription checkout created");
            json!({ "success": true, "subscription": created })
        }
        PaymentAction::CaptureOrder => {
            let order_id = required(&request.order_id, "orderID")?;
            let captured = payments.capture_order(order_id).await?;
            json!({ "success": true, "order": captured })
        }
        PaymentAction::GetSubscriptionStatus => {
            let subscription_id = required(&request.subscription_id, "subscriptionId")?;
            let status = payments.get_subscription_status(subscription_id).await?;
            json!({ "success": true, "subscription": status })
        }
        PaymentAction::GetPlanIds => json!({ "success": true, "plans": payments.plan_ids() }),
    };
    Ok(Json(response))
}
