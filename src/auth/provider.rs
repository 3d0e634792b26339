use crate::errors::IdentityFailure;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Verified claim set for a bearer token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdTokenClaims {
    pub uid: String,
    pub email: Option<String>,
    pub email_verified: bool,
    /// When the user last signed in (Unix seconds)
    pub auth_time: i64,
    /// When this token was minted (Unix seconds)
    pub issued_at: i64,
    pub expires_at: i64,
    pub jti: Option<String>,
    /// Set only when the provider consulted its revocation state
    pub revocation_checked: bool,
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("token expired")]
    Expired,

    #[error("token revoked")]
    Revoked,

    #[error("token audience or issuer mismatch")]
    InvalidAudience,

    #[error("invalid token: {0}")]
    Invalid(String),

    #[error("identity provider unavailable: {0}")]
    Unavailable(String),
}

impl IdentityError {
    pub fn failure(&self) -> IdentityFailure {
        match self {
            IdentityError::Malformed(_) => IdentityFailure::Malformed,
            IdentityError::Expired => IdentityFailure::Expired,
            IdentityError::Revoked => IdentityFailure::Revoked,
            IdentityError::InvalidAudience => IdentityFailure::InvalidAudience,
            IdentityError::Invalid(_) => IdentityFailure::Invalid,
            IdentityError::Unavailable(_) => IdentityFailure::VerificationTimeout,
        }
    }
}

/// External identity provider able to verify its own tokens
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Verify signature, audience, issuer and expiry. With `check_revoked`
    /// the provider must also consult the account's revocation state.
    async fn verify_id_token(
        &self,
        token: &str,
        check_revoked: bool,
    ) -> Result<IdTokenClaims, IdentityError>;
}
