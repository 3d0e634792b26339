// User lifecycle: trials, subscriptions, usage and admin management

pub mod admin;
pub mod email;
pub mod lifecycle;

pub use admin::{AdminAction, AdminRequest, AdminService, UserData};
pub use email::{DohMxResolver, EmailValidator, MxResolver};
pub use lifecycle::{UpgradeRequest, UsageSnapshot, UserLifecycle};
