use crate::auth::provider::{IdTokenClaims, IdentityError, IdentityProvider};
use crate::clock::Clock;
use crate::crypto::{new_id, random_token, sha256_hex};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

// base64url of {"alg":"RS256","kid":"static"}
const STATIC_HEADER: &str = "eyJhbGciOiJSUzI1NiIsImtpZCI6InN0YXRpYyJ9";

#[derive(Debug, Clone)]
enum Registered {
    Active(IdTokenClaims),
    Revoked(IdTokenClaims),
}

/// In-process identity provider holding a fixed token table.
///
/// Used by the test suites and by `store.backend = "memory"` development
/// runs where no real identity project exists.
pub struct StaticIdentityProvider {
    clock: Arc<dyn Clock>,
    tokens: RwLock<HashMap<String, Registered>>,
    delay: RwLock<Option<Duration>>,
}

impl StaticIdentityProvider {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            tokens: RwLock::new(HashMap::new()),
            delay: RwLock::new(None),
        }
    }

    /// Fresh, verified claims for `uid` minted now
    pub fn claims_for(&self, uid: &str, email: &str) -> IdTokenClaims {
        let now = self.clock.now().timestamp();
        IdTokenClaims {
            uid: uid.to_string(),
            email: Some(email.to_string()),
            email_verified: true,
            auth_time: now,
            issued_at: now,
            expires_at: now + 3_600,
            jti: Some(new_id()),
            revocation_checked: false,
        }
    }

    /// Mint a well-formed opaque token for `claims` and register it
    pub async fn issue(&self, claims: IdTokenClaims) -> String {
        let payload = sha256_hex(format!("{}:{}", claims.uid, new_id()).as_bytes());
        let token = format!("{}.{}.{}", STATIC_HEADER, payload, random_token(43));
        self.register(&token, claims).await;
        token
    }

    pub async fn register(&self, token: &str, claims: IdTokenClaims) {
        self.tokens
            .write()
            .await
            .insert(token.to_string(), Registered::Active(claims));
    }

    pub async fn revoke(&self, token: &str) {
        let mut tokens = self.tokens.write().await;
        if let Some(Registered::Active(claims)) = tokens.remove(token) {
            tokens.insert(token.to_string(), Registered::Revoked(claims));
        }
    }

    /// Delay every verification, to exercise timeouts
    pub async fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.write().await = delay;
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    async fn verify_id_token(
        &self,
        token: &str,
        check_revoked: bool,
    ) -> Result<IdTokenClaims, IdentityError> {
        let delay = *self.delay.read().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let registered = self.tokens.read().await.get(token).cloned();
        let mut claims = match registered {
            None => return Err(IdentityError::Invalid("unknown token".to_string())),
            Some(Registered::Revoked(_)) if check_revoked => return Err(IdentityError::Revoked),
            Some(Registered::Revoked(claims)) | Some(Registered::Active(claims)) => claims,
        };

        if claims.expires_at <= self.clock.now().timestamp() {
            return Err(IdentityError::Expired);
        }
        claims.revocation_checked = check_revoked;
        Ok(claims)
    }
}
