// End-to-end request flows through the full router over the in-memory store

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, HeaderMap, Method, Request, StatusCode},
    Router,
};
use scribe_gate::{
    api::create_router,
    auth::StaticIdentityProvider,
    clock::{Clock, ManualClock},
    config::{Config, PlanIds},
    domain::{PlanType, SecurityEvent, SecurityEventType, Severity, SubscribedUser, TrialUser},
    external::{
        CaptureResult, CreatedSubscription, DescriptionGenerator, DescriptionRequest,
        ExternalError, PaymentGateway, SubscriptionStatus,
    },
    store::{collections, get_doc, list_docs, put_doc, MemoryStore},
    Collaborators, Components,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

const ORIGIN: &str = "https://app.example.com";
const EMAIL: &str = "u@ex.com";

struct CannedGenerator;

#[async_trait]
impl DescriptionGenerator for CannedGenerator {
    async fn generate(&self, request: &DescriptionRequest) -> Result<String, ExternalError> {
        Ok(format!(
            "A description of {}",
            request.product_info.as_deref().unwrap_or("the product")
        ))
    }
}

struct CannedPayments {
    plans: PlanIds,
}

#[async_trait]
impl PaymentGateway for CannedPayments {
    async fn create_subscription(
        &self,
        _plan_name: &str,
        _email: &str,
        _user_id: &str,
    ) -> Result<CreatedSubscription, ExternalError> {
        Ok(CreatedSubscription {
            subscription_id: "I-CHECKOUT".to_string(),
            status: "APPROVAL_PENDING".to_string(),
            approval_url: Some("https://paypal.example/approve".to_string()),
        })
    }

    async fn capture_order(&self, order_id: &str) -> Result<CaptureResult, ExternalError> {
        Ok(CaptureResult {
            order_id: order_id.to_string(),
            status: "COMPLETED".to_string(),
        })
    }

    async fn get_subscription_status(
        &self,
        subscription_id: &str,
    ) -> Result<SubscriptionStatus, ExternalError> {
        Ok(SubscriptionStatus {
            subscription_id: subscription_id.to_string(),
            status: "ACTIVE".to_string(),
            plan_id: None,
        })
    }

    fn plan_ids(&self) -> &PlanIds {
        &self.plans
    }
}

struct Harness {
    clock: Arc<ManualClock>,
    store: Arc<MemoryStore>,
    provider: Arc<StaticIdentityProvider>,
    components: Components,
    router: Router,
}

fn harness() -> Harness {
    let config = Config::development();
    let clock = Arc::new(ManualClock::starting_now());
    let store = Arc::new(MemoryStore::new(clock.clone()));
    let provider = Arc::new(StaticIdentityProvider::new(clock.clone()));
    let collaborators = Collaborators {
        identity: provider.clone(),
        generator: Arc::new(CannedGenerator),
        payments: Arc::new(CannedPayments {
            plans: config.payment.plans.clone(),
        }),
        mx_resolver: None,
    };
    let (components, _event_task) =
        Components::build(config, clock.clone(), store.clone(), collaborators);
    let router = create_router(&components);
    Harness {
        clock,
        store,
        provider,
        components,
        router,
    }
}

/// One request as the browser client sends it
struct Call<'a> {
    method: Method,
    uri: &'a str,
    ip: &'a str,
    origin: Option<&'a str>,
    token: Option<String>,
    extra: Vec<(&'a str, String)>,
    body: Option<Value>,
}

impl<'a> Call<'a> {
    fn new(method: Method, uri: &'a str, ip: &'a str) -> Self {
        Self {
            method,
            uri,
            ip,
            origin: Some(ORIGIN),
            token: None,
            extra: Vec::new(),
            body: None,
        }
    }

    fn token(mut self, token: String) -> Self {
        self.token = Some(token);
        self
    }

    fn origin(mut self, origin: Option<&'a str>) -> Self {
        self.origin = origin;
        self
    }

    fn header(mut self, name: &'a str, value: impl Into<String>) -> Self {
        self.extra.push((name, value.into()));
        self
    }

    fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

impl Harness {
    async fn token_for(&self, uid: &str) -> String {
        let claims = self.provider.claims_for(uid, EMAIL);
        self.provider.issue(claims).await
    }

    async fn send(&self, call: Call<'_>) -> (StatusCode, HeaderMap, Value) {
        let mut builder = Request::builder()
            .method(call.method)
            .uri(call.uri)
            .header("x-forwarded-for", call.ip);
        if let Some(origin) = call.origin {
            builder = builder.header(header::ORIGIN, origin);
        }
        if let Some(token) = call.token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        for (name, value) in call.extra {
            builder = builder.header(name, value);
        }
        let body = match call.body {
            Some(body) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(serde_json::to_vec(&body).unwrap())
            }
            None => Body::empty(),
        };

        let response = self
            .router
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, headers, value)
    }

    async fn subscriber(&self, uid: &str, plan: PlanType, monthly_usage: u32) {
        let mut user = SubscribedUser::new(uid, EMAIL, plan, self.clock_now());
        user.monthly_usage = monthly_usage;
        put_doc(self.store.as_ref(), collections::SUBSCRIBED_USERS, uid, &user)
            .await
            .unwrap();
    }

    fn clock_now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    async fn logged_events(&self) -> Vec<SecurityEvent> {
        self.components.monitor.event_log().flush().await.unwrap();
        list_docs::<SecurityEvent>(self.store.as_ref(), collections::SECURITY_EVENTS)
            .await
            .unwrap()
            .into_iter()
            .map(|(_, event)| event)
            .collect()
    }
}

fn generate_body(uid: &str) -> Value {
    json!({ "userId": uid, "productInfo": "Insulated steel bottle" })
}

#[tokio::test]
async fn test_trial_signup_then_webhook_upgrade() {
    let h = harness();
    let token = h.token_for("u1").await;

    let (status, headers, body) = h
        .send(
            Call::new(Method::POST, "/create-trial-user", "1.2.3.4")
                .token(token)
                .json(json!({ "ipAddress": "1.2.3.4" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"]["descriptionsRemaining"], 3);
    let cookie = headers.get(header::SET_COOKIE).unwrap().to_str().unwrap();
    assert!(cookie.starts_with("device_signup=1"));

    let trial: TrialUser = get_doc(h.store.as_ref(), collections::TRIAL_USERS, "u1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(trial.descriptions_remaining, 3);
    assert_eq!(trial.ip_address, "1.2.3.4");
    assert_eq!(trial.email, EMAIL);
    let trial_created_at = trial.created_at;

    let upgrade = json!({
        "userId": "u1",
        "email": EMAIL,
        "subscriptionId": "sub_A",
        "planType": "starter",
        "billingCycle": "monthly",
    });
    let (status, _, body) = h
        .send(
            Call::new(Method::POST, "/upgrade-to-subscription", "8.8.4.4")
                .origin(None)
                .header("x-webhook-secret", "development-webhook-secret")
                .json(upgrade.clone()),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["success"], true);

    let trial: Option<TrialUser> = get_doc(h.store.as_ref(), collections::TRIAL_USERS, "u1")
        .await
        .unwrap();
    assert!(trial.is_none());
    let user: SubscribedUser = get_doc(h.store.as_ref(), collections::SUBSCRIBED_USERS, "u1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(user.plan_type, PlanType::Starter);
    assert_eq!(user.max_usage, 50);
    assert_eq!(user.monthly_usage, 0);
    assert_eq!(user.subscription_id.as_deref(), Some("sub_A"));
    assert_eq!(user.previous_status.as_deref(), Some("trial"));
    assert_eq!(user.trial_started_at, Some(trial_created_at));

    // Redelivered webhook leaves the record untouched
    let (status, _, _) = h
        .send(
            Call::new(Method::POST, "/upgrade-to-subscription", "8.8.4.4")
                .origin(None)
                .header("x-webhook-secret", "development-webhook-secret")
                .json(upgrade),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let again: SubscribedUser = get_doc(h.store.as_ref(), collections::SUBSCRIBED_USERS, "u1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(again, user);
}

#[tokio::test]
async fn test_second_trial_from_same_device_is_refused() {
    let h = harness();
    let token = h.token_for("bob").await;
    let (status, _, body) = h
        .send(
            Call::new(Method::POST, "/create-trial-user", "1.2.3.5")
                .token(token)
                .header("cookie", "device_signup=1")
                .json(json!({})),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "DEVICE_ALREADY_REGISTERED");
}

#[tokio::test]
async fn test_webhook_without_secret_is_rejected() {
    let h = harness();
    let (status, _, body) = h
        .send(
            Call::new(Method::POST, "/upgrade-to-subscription", "8.8.4.4")
                .origin(None)
                .json(json!({ "userId": "mallory", "subscriptionId": "I-X", "planType": "enterprise" })),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "WEBHOOK_UNAUTHORIZED");
    let stored: Option<SubscribedUser> =
        get_doc(h.store.as_ref(), collections::SUBSCRIBED_USERS, "mallory")
            .await
            .unwrap();
    assert!(stored.is_none());
}

#[tokio::test]
async fn test_usage_stops_at_plan_limit() {
    let h = harness();
    h.subscriber("u1", PlanType::Starter, 0).await;
    let mut user: SubscribedUser = get_doc(h.store.as_ref(), collections::SUBSCRIBED_USERS, "u1")
        .await
        .unwrap()
        .unwrap();
    user.max_usage = 3;
    put_doc(h.store.as_ref(), collections::SUBSCRIBED_USERS, "u1", &user)
        .await
        .unwrap();

    for expected in 1..=3u32 {
        let token = h.token_for("u1").await;
        let (status, _, body) = h
            .send(
                Call::new(Method::POST, "/generate", "2.2.2.2")
                    .token(token)
                    .json(generate_body("u1")),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        assert_eq!(body["usage"]["currentUsage"], expected);
        assert_eq!(body["usage"]["maxUsage"], 3);
    }

    let token = h.token_for("u1").await;
    let (status, _, body) = h
        .send(
            Call::new(Method::POST, "/generate", "2.2.2.2")
                .token(token)
                .json(generate_body("u1")),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "USAGE_LIMIT_EXCEEDED");

    let user: SubscribedUser = get_doc(h.store.as_ref(), collections::SUBSCRIBED_USERS, "u1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(user.monthly_usage, 3);
}

#[tokio::test]
async fn test_generate_window_limits_per_address() {
    let h = harness();
    h.subscriber("u1", PlanType::Enterprise, 0).await;
    let first_ms = h.clock.now_ms();

    for _ in 0..30 {
        let token = h.token_for("u1").await;
        let (status, _, body) = h
            .send(
                Call::new(Method::POST, "/generate", "9.9.9.9")
                    .token(token)
                    .json(generate_body("u1")),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        h.clock.advance(chrono::Duration::milliseconds(100));
    }

    let token = h.token_for("u1").await;
    let (status, headers, body) = h
        .send(
            Call::new(Method::POST, "/generate", "9.9.9.9")
                .token(token)
                .json(generate_body("u1")),
        )
        .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["code"], "RATE_LIMITED");
    // Thirty requests 100 ms apart: the first leaves the window 57 s from now
    let now_ms = h.clock.now_ms();
    let expected = ((first_ms + 60_000 - now_ms) as u64 + 999) / 1_000;
    assert_eq!(expected, 57);
    assert_eq!(body["retryAfter"].as_u64(), Some(expected));
    assert_eq!(
        headers.get(header::RETRY_AFTER).map(|v| v.to_str().unwrap().to_string()),
        Some(expected.to_string())
    );

    h.clock.advance(chrono::Duration::seconds(60));
    let token = h.token_for("u1").await;
    let (status, _, body) = h
        .send(
            Call::new(Method::POST, "/generate", "9.9.9.9")
                .token(token)
                .json(generate_body("u1")),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
}

#[tokio::test]
async fn test_replayed_token_is_rejected_and_logged() {
    let h = harness();
    h.subscriber("u1", PlanType::Starter, 0).await;
    let token = h.token_for("u1").await;

    let (status, _, body) = h
        .send(Call::new(Method::GET, "/check-user-status", "3.3.3.3").token(token.clone()))
        .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["collection"], "users");

    let (status, _, body) = h
        .send(Call::new(Method::GET, "/check-user-status", "3.3.3.3").token(token))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "TOKEN_REPLAY_DETECTED");

    let events = h.logged_events().await;
    assert!(events.iter().any(|e| {
        e.event_type == SecurityEventType::TokenReplayDetected && e.severity == Severity::Critical
    }));
}

#[tokio::test]
async fn test_foreign_origin_is_denied_without_cors_grant() {
    let h = harness();
    h.subscriber("u1", PlanType::Starter, 0).await;
    let token = h.token_for("u1").await;

    let (status, headers, body) = h
        .send(
            Call::new(Method::GET, "/check-user-status", "4.4.4.4")
                .origin(Some("https://evil.example"))
                .token(token),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "ORIGIN_DENIED");
    assert!(!headers.contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
    assert_eq!(
        headers.get("x-content-type-options").map(|v| v.to_str().unwrap()),
        Some("nosniff")
    );
}

#[tokio::test]
async fn test_payment_attempts_are_throttled() {
    let h = harness();
    h.subscriber("u1", PlanType::Free, 0).await;

    for _ in 0..3 {
        let token = h.token_for("u1").await;
        let (status, _, body) = h
            .send(
                Call::new(Method::POST, "/paypal", "5.5.5.5")
                    .token(token)
                    .json(json!({ "action": "create_subscription", "planName": "starter_monthly" })),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        assert_eq!(body["subscription"]["status"], "APPROVAL_PENDING");
    }

    let token = h.token_for("u1").await;
    let (status, _, body) = h
        .send(
            Call::new(Method::POST, "/paypal", "5.5.5.5")
                .token(token)
                .json(json!({ "action": "create_subscription", "planName": "starter_monthly" })),
        )
        .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert!(body["retryAfter"].as_u64().is_some());

    // The window is shared by every payment action
    let token = h.token_for("u1").await;
    let (status, _, _) = h
        .send(
            Call::new(Method::POST, "/paypal", "5.5.5.5")
                .token(token)
                .json(json!({ "action": "capture_order", "orderID": "O-1" })),
        )
        .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_liveness_and_readiness() {
    let h = harness();
    let (status, _, _) = h
        .send(Call::new(Method::GET, "/health/live", "6.6.6.6").origin(None))
        .await;
    assert_eq!(status, StatusCode::OK);

    h.store.set_unavailable(true);
    let (status, _, body) = h
        .send(Call::new(Method::GET, "/health/ready", "6.6.6.6").origin(None))
        .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_ne!(body["status"], "ok");
}
