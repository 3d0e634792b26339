use crate::authz::headers::{apply_cors_headers, validate_origin, OriginCheck};
use crate::authz::policy::EndpointPolicy;
use crate::errors::AppError;
use crate::failsafe::{RequestAuthenticator, RequestContext};
use crate::rate_limit::{add_rate_limit_headers, client_ip};
use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use std::sync::Arc;

/// Per-route state of the [`gate`] middleware
#[derive(Clone)]
pub struct GateState {
    pub policy: Arc<EndpointPolicy>,
    pub authenticator: Arc<RequestAuthenticator>,
    pub body_limit: usize,
}

impl GateState {
    pub fn new(policy: EndpointPolicy, authenticator: Arc<RequestAuthenticator>, body_limit: usize) -> Self {
        Self {
            policy: Arc::new(policy),
            authenticator,
            body_limit,
        }
    }
}

/// Authenticate the request against the route's policy.
///
/// The body is buffered so the user-id check can read it, then handed to
/// the handler unchanged. On success the handler finds a
/// [`Principal`](crate::failsafe::Principal) in the request extensions.
pub async fn gate(State(gate): State<GateState>, request: Request, next: Next) -> Response {
    let security = gate.authenticator.security();
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let ip = client_ip(request.headers(), peer);

    // Preflight from an allowed origin
    if request.method() == Method::OPTIONS {
        if let OriginCheck::Allowed(origin) = validate_origin(request.headers(), &security.allowed_origins) {
            let mut response = StatusCode::NO_CONTENT.into_response();
            apply_cors_headers(response.headers_mut(), &origin, &security.csrf_header_name);
            return response;
        }
    }

    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, gate.body_limit).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::debug!(error = %e, "Request body rejected");
            return AppError::InvalidInput("Request body too large or unreadable".to_string())
                .into_response();
        }
    };

    let ctx = RequestContext {
        method: parts.method.clone(),
        uri: parts.uri.clone(),
        headers: parts.headers.clone(),
        client_ip: ip,
        body: body.clone(),
    };
    let outcome = gate.authenticator.authenticate(&gate.policy, &ctx).await;
    let origin = outcome.origin.allowed_origin().map(str::to_string);
    let rate_limit = outcome.rate_limit.clone();

    let mut response = match outcome.into_result() {
        Ok(principal) => {
            let mut request = Request::from_parts(parts, Body::from(body));
            request.extensions_mut().insert(principal);
            next.run(request).await
        }
        Err(e) => e.into_response(),
    };

    // CORS only ever names the validated origin
    if let Some(origin) = origin {
        apply_cors_headers(response.headers_mut(), &origin, &security.csrf_header_name);
    }
    if let Some(decision) = rate_limit {
        add_rate_limit_headers(response.headers_mut(), &decision);
    }
    response
}
