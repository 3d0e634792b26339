pub mod authenticator;
pub mod circuit_breaker;
pub mod sanitize;
pub mod state;

pub use authenticator::{AuthOutcome, Principal, RequestAuthenticator, RequestContext};
pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use sanitize::sanitize_error_message;
pub use state::{AuthState, AuthStateMachine};
