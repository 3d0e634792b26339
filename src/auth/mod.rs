pub mod firebase;
pub mod provider;
pub mod static_provider;
pub mod verifier;

pub use firebase::FirebaseIdentityProvider;
pub use provider::{IdTokenClaims, IdentityError, IdentityProvider};
pub use static_provider::StaticIdentityProvider;
pub use verifier::{bearer_token, check_token_shape, replay_token_id, IdentityVerifier};
