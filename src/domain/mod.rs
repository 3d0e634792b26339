pub mod security;
pub mod user;

pub use security::{
    AlertLevel, EventFamily, SecurityEvent, SecurityEventType, Severity, ThreatCategory,
};
pub use user::{
    BillingCycle, DeletedUser, PlanType, SubscribedUser, TrialUser, UserCollection, UserStatus,
};
