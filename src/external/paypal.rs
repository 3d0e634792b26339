//! PayPal REST client for subscriptions and order capture.

use crate::config::{PaymentConfig, PlanIds};
use crate::external::ExternalError;
use crate::observability::MetricsRecorder;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, error, instrument};

const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);
const DEFAULT_TOKEN_LIFETIME_SECS: u64 = 3_600;
const BRAND_NAME: &str = "Scribe";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedSubscription {
    pub subscription_id: String,
    pub status: String,
    pub approval_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureResult {
    pub order_id: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionStatus {
    pub subscription_id: String,
    pub status: String,
    pub plan_id: Option<String>,
}

/// Payment processor operations used by the payment endpoint
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_subscription(
        &self,
        plan_name: &str,
        email: &str,
        user_id: &str,
    ) -> Result<CreatedSubscription, ExternalError>;

    async fn capture_order(&self, order_id: &str) -> Result<CaptureResult, ExternalError>;

    async fn get_subscription_status(
        &self,
        subscription_id: &str,
    ) -> Result<SubscriptionStatus, ExternalError>;

    fn plan_ids(&self) -> &PlanIds;
}

struct CachedAccessToken {
    token: String,
    refresh_at: Instant,
}

#[derive(Deserialize)]
struct AccessTokenResponse {
    access_token: String,
    expires_in: Option<u64>,
}

#[derive(Deserialize)]
struct Link {
    href: String,
    rel: String,
}

#[derive(Deserialize)]
struct SubscriptionResponse {
    id: String,
    status: String,
    plan_id: Option<String>,
    #[serde(default)]
    links: Vec<Link>,
}

#[derive(Deserialize)]
struct OrderResponse {
    id: String,
    status: String,
}

pub struct PayPalGateway {
    config: PaymentConfig,
    site_url: String,
    http: reqwest::Client,
    access_token: RwLock<Option<CachedAccessToken>>,
}

impl PayPalGateway {
    pub fn new(config: PaymentConfig, site_url: String) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .timeout(Duration::from_millis(config.timeout_ms))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            config,
            site_url: site_url.trim_end_matches('/').to_string(),
            http,
            access_token: RwLock::new(None),
        }
    }

    /// Client-credentials token, cached until shortly before it expires
    async fn access_token(&self) -> Result<String, ExternalError> {
        {
            let cached = self.access_token.read().await;
            if let Some(cached) = cached.as_ref().filter(|c| Instant::now() < c.refresh_at) {
                return Ok(cached.token.clone());
            }
        }

        if self.config.client_id.is_empty() || self.config.client_secret.is_empty() {
            return Err(ExternalError::NotConfigured("PayPal credentials".to_string()));
        }

        let response = self
            .http
            .post(format!("{}/v1/oauth2/token", self.config.api_base))
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| {
                MetricsRecorder::record_external_call("paypal_oauth", "error");
                ExternalError::Payment(format!("token request failed: {}", e))
            })?;
        let body = response
            .json::<AccessTokenResponse>()
            .await
            .map_err(|e| ExternalError::Payment(format!("token response unreadable: {}", e)))?;
        MetricsRecorder::record_external_call("paypal_oauth", "ok");

        let lifetime = Duration::from_secs(body.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS));
        *self.access_token.write().await = Some(CachedAccessToken {
            token: body.access_token.clone(),
            refresh_at: Instant::now() + lifetime.saturating_sub(TOKEN_REFRESH_MARGIN),
        });
        Ok(body.access_token)
    }

    async fn api_request<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<T, ExternalError> {
        let token = self.access_token().await?;
        let mut request = self
            .http
            .request(method, format!("{}{}", self.config.api_base, path))
            .bearer_auth(token);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(|e| {
            MetricsRecorder::record_external_call("paypal", "error");
            error!(error = %e, "PayPal request failed");
            ExternalError::Payment(e.to_string())
        })?;

        if !response.status().is_success() {
            let status = response.status();
            MetricsRecorder::record_external_call("paypal", "error");
            error!(status = %status, path = %path, "PayPal API error");
            return Err(ExternalError::Payment(format!("PayPal API returned {}", status)));
        }

        let parsed = response
            .json::<T>()
            .await
            .map_err(|e| ExternalError::Payment(format!("unreadable PayPal response: {}", e)))?;
        MetricsRecorder::record_external_call("paypal", "ok");
        Ok(parsed)
    }
}

#[async_trait]
impl PaymentGateway for PayPalGateway {
    #[instrument(skip(self, email))]
    async fn create_subscription(
        &self,
        plan_name: &str,
        email: &str,
        user_id: &str,
    ) -> Result<CreatedSubscription, ExternalError> {
        let plan_id = self
            .config
            .plans
            .lookup(plan_name)
            .ok_or_else(|| ExternalError::NotConfigured(format!("plan {}", plan_name)))?;

        let body = json!({
            "plan_id": plan_id,
            "custom_id": user_id,
            "subscriber": { "email_address": email },
            "application_context": {
                "brand_name": BRAND_NAME,
                "user_action": "SUBSCRIBE_NOW",
                "return_url": format!("{}/payment/success", self.site_url),
                "cancel_url": format!("{}/payment/cancel", self.site_url),
            }
        });
        let created: SubscriptionResponse = self
            .api_request(reqwest::Method::POST, "/v1/billing/subscriptions", Some(body))
            .await?;

        debug!(subscription_id = %created.id, "PayPal subscription created");
        let approval_url = created
            .links
            .into_iter()
            .find(|link| link.rel == "approve")
            .map(|link| link.href);
        Ok(CreatedSubscription {
            subscription_id: created.id,
            status: created.status,
            approval_url,
        })
    }

    #[instrument(skip(self))]
    async fn capture_order(&self, order_id: &str) -> Result<CaptureResult, ExternalError> {
        let order: OrderResponse = self
            .api_request(
                reqwest::Method::POST,
                &format!("/v2/checkout/orders/{}/capture", order_id),
                Some(json!({})),
            )
            .await?;
        Ok(CaptureResult {
            order_id: order.id,
            status: order.status,
        })
    }

    #[instrument(skip(self))]
    async fn get_subscription_status(
        &self,
        subscription_id: &str,
    ) -> Result<SubscriptionStatus, ExternalError> {
        let subscription: SubscriptionResponse = self
            .api_request(
                reqwest::Method::GET,
                &format!("/v1/billing/subscriptions/{}", subscription_id),
                None,
            )
            .await?;
        Ok(SubscriptionStatus {
            subscription_id: subscription.id,
            status: subscription.status,
            plan_id: subscription.plan_id,
        })
    }

    fn plan_ids(&self) -> &PlanIds {
        &self.config.plans
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_response_parsing() {
        let parsed: SubscriptionResponse = serde_json::from_value(json!({
            "id": "I-123",
            "status": "APPROVAL_PENDING",
            "links": [
                { "href": "https://www.paypal.com/webapps/billing/subscriptions?ba_token=x", "rel": "approve", "method": "GET" },
                { "href": "https://api.paypal.com/v1/billing/subscriptions/I-123", "rel": "self", "method": "GET" }
            ]
        }))
        .unwrap();
        assert_eq!(parsed.id, "I-123");
        assert!(parsed.plan_id.is_none());
        assert_eq!(parsed.links.iter().filter(|l| l.rel == "approve").count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_plan_is_not_configured() {
        let gateway = PayPalGateway::new(PaymentConfig::default(), "https://app.example.com/".to_string());
        assert_eq!(gateway.site_url, "https://app.example.com");
        let result = gateway.create_subscription("gold_monthly", "u@ex.com", "u1").await;
        assert!(matches!(result, Err(ExternalError::NotConfigured(_))));
    }

    #[tokio::test]
    async fn test_missing_credentials() {
        let gateway = PayPalGateway::new(PaymentConfig::default(), "https://app.example.com".to_string());
        let result = gateway.capture_order("ORDER-1").await;
        assert!(matches!(result, Err(ExternalError::NotConfigured(_))));
    }
}
