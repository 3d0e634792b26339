//! Verification of identity-provider ID tokens.
//!
//! Signatures are checked locally against the provider's published JWKS;
//! revocation is checked remotely through the admin account-lookup API,
//! authenticated with a service-account OAuth token.

use crate::auth::provider::{IdTokenClaims, IdentityError, IdentityProvider};
use crate::config::IdentityConfig;
use crate::observability::MetricsRecorder;
use async_trait::async_trait;
use jsonwebtoken::{decode, decode_header, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

const DEFAULT_JWKS_TTL: Duration = Duration::from_secs(3_600);
const ACCESS_TOKEN_LIFETIME_SECS: i64 = 3_600;
const ACCESS_TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);
const ADMIN_SCOPES: &str =
    "https://www.googleapis.com/auth/identitytoolkit https://www.googleapis.com/auth/cloud-platform";

/// JWKS (JSON Web Key Set) structure
#[derive(Debug, Clone, Deserialize)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Jwk {
    pub kid: String,
    pub n: String,
    pub e: String,
}

/// Claims as minted by the provider
#[derive(Debug, Deserialize)]
struct ProviderClaims {
    sub: String,
    iat: i64,
    exp: i64,
    auth_time: Option<i64>,
    email: Option<String>,
    email_verified: Option<bool>,
    jti: Option<String>,
}

struct CachedKeys {
    keys: HashMap<String, Arc<DecodingKey>>,
    fetched_at: Instant,
    ttl: Duration,
}

impl CachedKeys {
    fn is_fresh(&self) -> bool {
        self.fetched_at.elapsed() < self.ttl
    }
}

struct CachedAccessToken {
    token: String,
    refresh_at: Instant,
}

#[derive(Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct AccessTokenResponse {
    access_token: String,
    expires_in: Option<u64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LookupResponse {
    #[serde(default)]
    users: Vec<LookupUser>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LookupUser {
    #[serde(default)]
    disabled: bool,
    /// Unix seconds, as a decimal string
    valid_since: Option<String>,
}

pub struct FirebaseIdentityProvider {
    config: IdentityConfig,
    http: reqwest::Client,
    keys: RwLock<Option<CachedKeys>>,
    access_token: RwLock<Option<CachedAccessToken>>,
}

impl FirebaseIdentityProvider {
    pub fn new(config: IdentityConfig) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .timeout(config.verification_timeout())
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            config,
            http,
            keys: RwLock::new(None),
            access_token: RwLock::new(None),
        }
    }

    /// Decoding key for `kid`.
    ///
    /// While the cached key set is fresh an unknown `kid` is rejected
    /// without refetching, so forged headers cannot flood the JWKS endpoint.
    async fn key_for(&self, kid: &str) -> Result<Arc<DecodingKey>, IdentityError> {
        {
            let cached = self.keys.read().await;
            if let Some(cached) = cached.as_ref().filter(|c| c.is_fresh()) {
                return cached
                    .keys
                    .get(kid)
                    .cloned()
                    .ok_or_else(|| IdentityError::Invalid(format!("unknown key id {}", kid)));
            }
        }

        let (jwks, ttl) = self.fetch_jwks().await?;
        let cached = Self::build_cache(jwks, ttl);
        let key = cached.keys.get(kid).cloned();
        *self.keys.write().await = Some(cached);
        key.ok_or_else(|| IdentityError::Invalid(format!("unknown key id {}", kid)))
    }

    fn build_cache(jwks: Jwks, ttl: Duration) -> CachedKeys {
        let mut keys = HashMap::with_capacity(jwks.keys.len());
        for jwk in jwks.keys {
            match DecodingKey::from_rsa_components(&jwk.n, &jwk.e) {
                Ok(key) => {
                    keys.insert(jwk.kid, Arc::new(key));
                }
                Err(e) => tracing::warn!(kid = %jwk.kid, error = %e, "Skipping unusable JWK"),
            }
        }
        CachedKeys {
            keys,
            fetched_at: Instant::now(),
            ttl,
        }
    }

    async fn fetch_jwks(&self) -> Result<(Jwks, Duration), IdentityError> {
        let response = self
            .http
            .get(&self.config.jwks_url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| {
                MetricsRecorder::record_external_call("identity_jwks", "error");
                IdentityError::Unavailable(format!("JWKS fetch failed: {}", e))
            })?;

        let ttl = response
            .headers()
            .get(reqwest::header::CACHE_CONTROL)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_max_age)
            .unwrap_or(DEFAULT_JWKS_TTL);

        let jwks = response
            .json::<Jwks>()
            .await
            .map_err(|e| IdentityError::Unavailable(format!("JWKS response unreadable: {}", e)))?;

        MetricsRecorder::record_external_call("identity_jwks", "ok");
        tracing::debug!(keys = jwks.keys.len(), ttl_secs = ttl.as_secs(), "Fetched identity JWKS");
        Ok((jwks, ttl))
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[self.config.project_id.as_str()]);
        validation.set_issuer(&[self.config.issuer()]);
        validation.set_required_spec_claims(&["exp", "iat", "aud", "iss", "sub"]);
        validation
    }

    fn verify_signature(
        &self,
        token: &str,
        key: &DecodingKey,
    ) -> Result<IdTokenClaims, IdentityError> {
        use jsonwebtoken::errors::ErrorKind;

        let data = decode::<ProviderClaims>(token, key, &self.validation()).map_err(|e| match e.kind() {
            ErrorKind::ExpiredSignature => IdentityError::Expired,
            ErrorKind::InvalidAudience | ErrorKind::InvalidIssuer => IdentityError::InvalidAudience,
            ErrorKind::InvalidToken | ErrorKind::Base64(_) | ErrorKind::Json(_) | ErrorKind::Utf8(_) => {
                IdentityError::Malformed(e.to_string())
            }
            _ => IdentityError::Invalid(e.to_string()),
        })?;

        let claims = data.claims;
        if claims.sub.is_empty() || claims.sub.len() > 128 {
            return Err(IdentityError::Invalid("subject must be 1-128 characters".to_string()));
        }

        Ok(IdTokenClaims {
            auth_time: claims.auth_time.unwrap_or(claims.iat),
            uid: claims.sub,
            email: claims.email,
            email_verified: claims.email_verified.unwrap_or(false),
            issued_at: claims.iat,
            expires_at: claims.exp,
            jti: claims.jti,
            revocation_checked: false,
        })
    }

    async fn admin_access_token(&self) -> Result<String, IdentityError> {
        {
            let cached = self.access_token.read().await;
            if let Some(cached) = cached.as_ref().filter(|c| Instant::now() < c.refresh_at) {
                return Ok(cached.token.clone());
            }
        }

        let now = chrono::Utc::now().timestamp();
        let assertion_claims = AssertionClaims {
            iss: &self.config.client_email,
            scope: ADMIN_SCOPES,
            aud: &self.config.token_uri,
            iat: now,
            exp: now + ACCESS_TOKEN_LIFETIME_SECS,
        };
        // Keys pasted into env files usually carry literal "\n"
        let pem = self.config.private_key.replace("\\n", "\n");
        let signing_key = EncodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|e| IdentityError::Unavailable(format!("service account key unusable: {}", e)))?;
        let assertion = encode(&Header::new(Algorithm::RS256), &assertion_claims, &signing_key)
            .map_err(|e| IdentityError::Unavailable(format!("assertion signing failed: {}", e)))?;

        let response = self
            .http
            .post(&self.config.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| {
                MetricsRecorder::record_external_call("identity_oauth", "error");
                IdentityError::Unavailable(format!("access token exchange failed: {}", e))
            })?
            .json::<AccessTokenResponse>()
            .await
            .map_err(|e| IdentityError::Unavailable(format!("access token response unreadable: {}", e)))?;

        MetricsRecorder::record_external_call("identity_oauth", "ok");
        let lifetime = Duration::from_secs(response.expires_in.unwrap_or(ACCESS_TOKEN_LIFETIME_SECS as u64));
        let refresh_at = Instant::now() + lifetime.saturating_sub(ACCESS_TOKEN_REFRESH_MARGIN);
        *self.access_token.write().await = Some(CachedAccessToken {
            token: response.access_token.clone(),
            refresh_at,
        });
        Ok(response.access_token)
    }

    async fn check_revocation(&self, token: &str, claims: &IdTokenClaims) -> Result<(), IdentityError> {
        let access_token = self.admin_access_token().await?;
        let url = self
            .config
            .account_lookup_url
            .replace("{project_id}", &self.config.project_id);

        let lookup = self
            .http
            .post(url)
            .bearer_auth(access_token)
            .json(&serde_json::json!({ "idToken": token }))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| {
                MetricsRecorder::record_external_call("identity_lookup", "error");
                IdentityError::Unavailable(format!("account lookup failed: {}", e))
            })?
            .json::<LookupResponse>()
            .await
            .map_err(|e| IdentityError::Unavailable(format!("account lookup unreadable: {}", e)))?;
        MetricsRecorder::record_external_call("identity_lookup", "ok");

        let user = lookup.users.into_iter().next().ok_or(IdentityError::Revoked)?;
        if user.disabled {
            return Err(IdentityError::Revoked);
        }
        let valid_since = user
            .valid_since
            .as_deref()
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(0);
        if claims.auth_time < valid_since {
            return Err(IdentityError::Revoked);
        }
        Ok(())
    }
}

#[async_trait]
impl IdentityProvider for FirebaseIdentityProvider {
    async fn verify_id_token(
        &self,
        token: &str,
        check_revoked: bool,
    ) -> Result<IdTokenClaims, IdentityError> {
        let header = decode_header(token).map_err(|e| IdentityError::Malformed(e.to_string()))?;
        if header.alg != Algorithm::RS256 {
            return Err(IdentityError::Invalid(format!("unexpected algorithm {:?}", header.alg)));
        }
        let kid = header
            .kid
            .ok_or_else(|| IdentityError::Malformed("missing key id".to_string()))?;

        let key = self.key_for(&kid).await?;
        let mut claims = self.verify_signature(token, &key)?;

        if check_revoked {
            self.check_revocation(token, &claims).await?;
            claims.revocation_checked = true;
        }
        Ok(claims)
    }
}

/// `max-age` from a Cache-Control header value
fn parse_max_age(value: &str) -> Option<Duration> {
    value
        .split(',')
        .map(str::trim)
        .find_map(|directive| directive.strip_prefix("max-age="))
        .and_then(|secs| secs.parse::<u64>().ok())
        .map(Duration::from_secs)
}
