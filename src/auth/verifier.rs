use crate::auth::provider::{IdTokenClaims, IdentityError, IdentityProvider};
use crate::clock::Clock;
use crate::config::IdentityConfig;
use crate::errors::{AppError, IdentityFailure};
use crate::rate_limit::TokenReplayGuard;
use std::sync::Arc;

/// Extract the bearer token from an `Authorization` header value
pub fn bearer_token(authorization: Option<&str>) -> Result<&str, IdentityFailure> {
    let value = authorization.map(str::trim).filter(|v| !v.is_empty());
    let Some(value) = value else {
        return Err(IdentityFailure::Missing);
    };
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .ok_or(IdentityFailure::Malformed)?
        .trim();
    if token.is_empty() {
        return Err(IdentityFailure::Missing);
    }
    Ok(token)
}

/// Cheap structural check before any network call
pub fn check_token_shape(token: &str, min_length: usize) -> Result<(), IdentityFailure> {
    let segments: Vec<&str> = token.split('.').collect();
    if token.len() < min_length || segments.len() != 3 || segments.iter().any(|s| s.is_empty()) {
        return Err(IdentityFailure::Malformed);
    }
    Ok(())
}

/// Id the replay guard tracks for a token. Falls back to `uid:iat` so two
/// users' tokens minted in the same second never collide.
pub fn replay_token_id(claims: &IdTokenClaims) -> String {
    match claims.jti.as_deref().filter(|jti| !jti.is_empty()) {
        Some(jti) => jti.to_string(),
        None => format!("{}:{}", claims.uid, claims.issued_at),
    }
}

/// Token hygiene around an [`IdentityProvider`]: shape, revocation-aware
/// verification under a timeout, token and session age, then replay.
pub struct IdentityVerifier {
    provider: Arc<dyn IdentityProvider>,
    replay: Arc<TokenReplayGuard>,
    clock: Arc<dyn Clock>,
    config: IdentityConfig,
}

impl IdentityVerifier {
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        replay: Arc<TokenReplayGuard>,
        clock: Arc<dyn Clock>,
        config: IdentityConfig,
    ) -> Self {
        Self {
            provider,
            replay,
            clock,
            config,
        }
    }

    pub async fn verify(&self, token: &str) -> Result<IdTokenClaims, AppError> {
        check_token_shape(token, self.config.min_token_length).map_err(AppError::Identity)?;

        let verified = tokio::time::timeout(
            self.config.verification_timeout(),
            self.provider.verify_id_token(token, true),
        )
        .await;

        let claims = match verified {
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.config.verification_timeout_ms,
                    "Identity verification timed out"
                );
                return Err(AppError::Identity(IdentityFailure::VerificationTimeout));
            }
            Ok(Err(IdentityError::Unavailable(reason))) => {
                return Err(AppError::SystemDenial(reason));
            }
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "Identity verification failed");
                return Err(AppError::Identity(e.failure()));
            }
            Ok(Ok(claims)) => claims,
        };

        if !claims.revocation_checked {
            return Err(AppError::SystemDenial(
                "identity provider skipped revocation check".to_string(),
            ));
        }

        let now = self.clock.now().timestamp();
        if now - claims.issued_at > self.config.max_token_age_seconds {
            return Err(AppError::Identity(IdentityFailure::TooOld));
        }
        if now - claims.auth_time > self.config.max_session_age_seconds {
            return Err(AppError::Identity(IdentityFailure::SessionExpired));
        }

        let token_id = replay_token_id(&claims);
        match self.replay.check_and_record(&token_id).await {
            Ok(verdict) if verdict.is_replay() => {
                Err(AppError::Identity(IdentityFailure::ReplayDetected))
            }
            Ok(_) => Ok(claims),
            Err(e) => Err(AppError::SystemDenial(format!("replay check failed: {}", e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticIdentityProvider;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn setup() -> (Arc<ManualClock>, Arc<MemoryStore>, Arc<StaticIdentityProvider>, IdentityVerifier) {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let provider = Arc::new(StaticIdentityProvider::new(clock.clone()));
        let replay = Arc::new(TokenReplayGuard::new(
            store.clone(),
            clock.clone(),
            "secret".to_string(),
            300,
            1,
            3,
        ));
        let verifier = IdentityVerifier::new(provider.clone(), replay, clock.clone(), IdentityConfig::default());
        (clock, store, provider, verifier)
    }

    fn failure(result: Result<IdTokenClaims, AppError>) -> IdentityFailure {
        match result {
            Err(AppError::Identity(failure)) => failure,
            other => panic!("expected identity failure, got {:?}", other),
        }
    }

    #[test]
    fn test_bearer_token_parsing() {
        assert_eq!(bearer_token(None), Err(IdentityFailure::Missing));
        assert_eq!(bearer_token(Some("  ")), Err(IdentityFailure::Missing));
        assert_eq!(bearer_token(Some("Basic abc")), Err(IdentityFailure::Malformed));
        assert_eq!(bearer_token(Some("Bearer ")), Err(IdentityFailure::Missing));
        assert_eq!(bearer_token(Some("Bearer a.b.c")), Ok("a.b.c"));
    }

    #[test]
    fn test_token_shape() {
        let long = format!("{}.{}.{}", "a".repeat(40), "b".repeat(40), "c".repeat(40));
        assert!(check_token_shape(&long, 100).is_ok());
        assert_eq!(check_token_shape("a.b.c", 100), Err(IdentityFailure::Malformed));
        let two = format!("{}.{}", "a".repeat(60), "b".repeat(60));
        assert_eq!(check_token_shape(&two, 100), Err(IdentityFailure::Malformed));
        let empty_segment = format!("{}..{}", "a".repeat(60), "b".repeat(60));
        assert_eq!(check_token_shape(&empty_segment, 100), Err(IdentityFailure::Malformed));
    }

    #[test]
    fn test_replay_id_falls_back_to_uid_and_iat() {
        let mut claims = IdTokenClaims {
            uid: "u1".to_string(),
            email: None,
            email_verified: true,
            auth_time: 1_700_000_000,
            issued_at: 1_700_000_000,
            expires_at: 1_700_003_600,
            jti: None,
            revocation_checked: true,
        };
        assert_eq!(replay_token_id(&claims), "u1:1700000000");
        claims.jti = Some("abc".to_string());
        assert_eq!(replay_token_id(&claims), "abc");
    }

    #[tokio::test]
    async fn test_verify_then_replay() {
        let (_clock, _store, provider, verifier) = setup();
        let token = provider.issue(provider.claims_for("u1", "u@ex.com")).await;

        let claims = verifier.verify(&token).await.unwrap();
        assert_eq!(claims.uid, "u1");
        assert_eq!(failure(verifier.verify(&token).await), IdentityFailure::ReplayDetected);
    }

    #[tokio::test]
    async fn test_token_and_session_age() {
        let (clock, _store, provider, verifier) = setup();

        let mut old = provider.claims_for("u1", "u@ex.com");
        old.issued_at -= 3_601;
        old.expires_at += 7_200;
        let token = provider.issue(old).await;
        assert_eq!(failure(verifier.verify(&token).await), IdentityFailure::TooOld);

        let mut stale_session = provider.claims_for("u1", "u@ex.com");
        stale_session.auth_time = clock.now().timestamp() - 86_401;
        let token = provider.issue(stale_session).await;
        assert_eq!(failure(verifier.verify(&token).await), IdentityFailure::SessionExpired);
    }

    #[tokio::test]
    async fn test_revoked_token() {
        let (_clock, _store, provider, verifier) = setup();
        let token = provider.issue(provider.claims_for("u1", "u@ex.com")).await;
        provider.revoke(&token).await;
        assert_eq!(failure(verifier.verify(&token).await), IdentityFailure::Revoked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_provider_times_out() {
        let (_clock, _store, provider, verifier) = setup();
        let token = provider.issue(provider.claims_for("u1", "u@ex.com")).await;
        provider.set_delay(Some(Duration::from_secs(5))).await;

        assert_eq!(
            failure(verifier.verify(&token).await),
            IdentityFailure::VerificationTimeout
        );
    }

    #[tokio::test]
    async fn test_store_failure_denies() {
        let (_clock, store, provider, verifier) = setup();
        let token = provider.issue(provider.claims_for("u1", "u@ex.com")).await;
        store.set_unavailable(true);

        assert!(matches!(verifier.verify(&token).await, Err(AppError::SystemDenial(_))));
    }
}
