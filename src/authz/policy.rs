use crate::config::RateLimitRules;
use crate::rate_limit::RateLimitRule;
use axum::http::Method;

/// How a caller proves who it is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// No credential; rate limited by address only
    Public,
    /// Identity-provider bearer token
    Bearer,
    /// Shared secret in `X-Webhook-Secret`, for server-to-server callbacks
    WebhookSecret,
}

/// What the endpoint's rate-limit window is keyed by
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyScope {
    /// Client address and path, checked before identity
    IpEndpoint,
    /// Client address and verified user, checked after identity
    IpUser,
}

/// Requirements one endpoint places on a request. Checks run in a fixed
/// order and the first failure wins.
#[derive(Debug, Clone)]
pub struct EndpointPolicy {
    pub name: &'static str,
    pub methods: Vec<Method>,
    pub auth: AuthMode,
    pub rule: RateLimitRule,
    pub scope: KeyScope,
    /// Requests without an `Origin` header are server-to-server
    pub allow_missing_origin: bool,
    pub require_admin: bool,
    pub require_subscription: bool,
    pub require_csrf: bool,
    /// Compare a `userId` in the body or query with the token's user
    pub check_user_id: bool,
}

impl EndpointPolicy {
    fn base(name: &'static str, method: Method, auth: AuthMode, rule: RateLimitRule) -> Self {
        Self {
            name,
            methods: vec![method],
            auth,
            rule,
            scope: KeyScope::IpEndpoint,
            allow_missing_origin: false,
            require_admin: false,
            require_subscription: false,
            require_csrf: false,
            check_user_id: false,
        }
    }

    pub fn public(name: &'static str, rules: &RateLimitRules) -> Self {
        Self {
            allow_missing_origin: true,
            ..Self::base(name, Method::GET, AuthMode::Public, RateLimitRule::new("public", &rules.public))
        }
    }

    pub fn check_user_status(rules: &RateLimitRules) -> Self {
        Self {
            check_user_id: true,
            ..Self::base(
                "check-user-status",
                Method::GET,
                AuthMode::Bearer,
                RateLimitRule::new("auth_status", &rules.auth),
            )
        }
    }

    pub fn create_trial_user(rules: &RateLimitRules) -> Self {
        Self {
            check_user_id: true,
            ..Self::base(
                "create-trial-user",
                Method::POST,
                AuthMode::Bearer,
                RateLimitRule::new("auth_trial", &rules.auth),
            )
        }
    }

    pub fn upgrade_to_subscription(rules: &RateLimitRules) -> Self {
        Self {
            allow_missing_origin: true,
            ..Self::base(
                "upgrade-to-subscription",
                Method::POST,
                AuthMode::WebhookSecret,
                RateLimitRule::new("webhook", &rules.webhook),
            )
        }
    }

    pub fn generate(rules: &RateLimitRules) -> Self {
        Self {
            require_subscription: true,
            check_user_id: true,
            ..Self::base(
                "generate",
                Method::POST,
                AuthMode::Bearer,
                RateLimitRule::new("generate", &rules.generate),
            )
        }
    }

    pub fn admin(rules: &RateLimitRules) -> Self {
        Self {
            require_admin: true,
            require_csrf: true,
            ..Self::base("admin", Method::POST, AuthMode::Bearer, RateLimitRule::new("admin", &rules.admin))
        }
    }

    pub fn paypal(rules: &RateLimitRules) -> Self {
        Self {
            scope: KeyScope::IpUser,
            ..Self::base(
                "paypal",
                Method::POST,
                AuthMode::Bearer,
                RateLimitRule::new("payment", &rules.payment),
            )
        }
    }

    pub fn allows_method(&self, method: &Method) -> bool {
        self.methods.contains(method)
    }

    /// Methods that change state need the CSRF pair when the policy asks for it
    pub fn needs_csrf(&self, method: &Method) -> bool {
        self.require_csrf && !matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payment_policy_is_privileged_and_user_scoped() {
        let policy = EndpointPolicy::paypal(&RateLimitRules::default());
        assert_eq!(policy.scope, KeyScope::IpUser);
        assert!(policy.rule.is_privileged());
        assert_eq!(policy.rule.max_requests, 3);
        assert_eq!(policy.rule.window_ms, 300_000);
    }

    #[test]
    fn test_generate_policy() {
        let policy = EndpointPolicy::generate(&RateLimitRules::default());
        assert!(policy.require_subscription);
        assert!(policy.check_user_id);
        assert!(!policy.rule.is_privileged());
        assert!(policy.allows_method(&Method::POST));
        assert!(!policy.allows_method(&Method::GET));
    }

    #[test]
    fn test_auth_limits_fail_closed() {
        let rules = RateLimitRules::default();
        assert!(EndpointPolicy::check_user_status(&rules).rule.is_privileged());
        assert!(EndpointPolicy::create_trial_user(&rules).rule.is_privileged());
        assert!(EndpointPolicy::admin(&rules).rule.is_privileged());
    }

    #[test]
    fn test_csrf_only_for_mutations() {
        let policy = EndpointPolicy::admin(&RateLimitRules::default());
        assert!(policy.needs_csrf(&Method::POST));
        assert!(!policy.needs_csrf(&Method::GET));
        assert!(!EndpointPolicy::generate(&RateLimitRules::default()).needs_csrf(&Method::POST));
    }
}
