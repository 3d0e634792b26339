pub mod fallback;
pub mod fraud;
pub mod limiter;
pub mod middleware;
pub mod replay;
pub mod sliding_window;

pub use fraud::{ActivityKind, FraudAssessment, FraudDetector, FraudEntry};
pub use limiter::{
    DenyReason, DistributedRateLimiter, RateLimitDecision, RateLimitRequest, RateLimitRule,
};
pub use middleware::{add_rate_limit_headers, client_ip};
pub use replay::{ReplayVerdict, TokenReplayEntry, TokenReplayGuard};
pub use sliding_window::{RateLimitEntry, RequestMetadata};
