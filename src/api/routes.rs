use crate::{
    api::{admin, generate, health, paypal, public, users},
    authz::{gate, security_headers, EndpointPolicy, GateState},
    clock::Clock,
    components::Components,
    config::Config,
    external::{DescriptionGenerator, PaymentGateway},
    observability::{track_http, HealthChecker},
    users::{AdminService, UserLifecycle},
};
use axum::{
    middleware,
    routing::{any, get},
    Router,
};
use std::sync::Arc;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub clock: Arc<dyn Clock>,
    pub lifecycle: Arc<UserLifecycle>,
    pub admin: Arc<AdminService>,
    pub generator: Arc<dyn DescriptionGenerator>,
    pub payments: Arc<dyn PaymentGateway>,
    pub health_checker: Arc<HealthChecker>,
}

impl AppState {
    pub fn from_components(components: &Components) -> Self {
        Self {
            config: components.config.clone(),
            clock: components.clock.clone(),
            lifecycle: components.lifecycle.clone(),
            admin: components.admin.clone(),
            generator: components.generator.clone(),
            payments: components.payments.clone(),
            health_checker: components.health.clone(),
        }
    }
}

pub fn create_router(components: &Components) -> Router {
    let state = AppState::from_components(components);
    let rules = &components.config.rate_limit.rules;
    let body_limit = components.config.server.request_body_limit_bytes;

    // Business routes accept any method so that the gate, not the router,
    // answers disallowed ones
    let gated = |policy: EndpointPolicy| {
        let gate_state = GateState::new(policy, components.authenticator.clone(), body_limit);
        middleware::from_fn_with_state(gate_state, gate)
    };

    Router::new()
        // Health endpoints
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .route("/metrics", get(health::metrics))
        // Public endpoints
        .route(
            "/firebase-public-config",
            any(public::firebase_public_config)
                .layer(gated(EndpointPolicy::public("firebase_public_config", rules))),
        )
        .route(
            "/get-client-ip",
            any(public::client_ip).layer(gated(EndpointPolicy::public("get_client_ip", rules))),
        )
        // User lifecycle
        .route(
            "/check-user-status",
            any(users::check_user_status).layer(gated(EndpointPolicy::check_user_status(rules))),
        )
        .route(
            "/create-trial-user",
            any(users::create_trial_user).layer(gated(EndpointPolicy::create_trial_user(rules))),
        )
        .route(
            "/upgrade-to-subscription",
            any(users::upgrade_to_subscription)
                .layer(gated(EndpointPolicy::upgrade_to_subscription(rules))),
        )
        .route(
            "/generate",
            any(generate::generate).layer(gated(EndpointPolicy::generate(rules))),
        )
        .route("/admin", any(admin::admin).layer(gated(EndpointPolicy::admin(rules))))
        .route("/paypal", any(paypal::paypal).layer(gated(EndpointPolicy::paypal(rules))))
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(middleware::from_fn(security_headers))
        .layer(middleware::from_fn(track_http))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
