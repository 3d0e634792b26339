pub mod headers;
pub mod middleware;
pub mod policy;
pub mod profile;

pub use headers::{apply_security_headers, csrf_matches, security_headers, validate_origin, OriginCheck};
pub use middleware::{gate, GateState};
pub use policy::{AuthMode, EndpointPolicy, KeyScope};
pub use profile::{check_admin, check_subscription, load_profile, QuotaGrant, UserProfile};
