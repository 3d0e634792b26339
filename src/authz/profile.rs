use crate::domain::user::ADMIN_ROLE;
use crate::domain::{SubscribedUser, TrialUser, UserStatus};
use crate::errors::AppError;
use crate::store::{collections, get_doc, DocumentStore, StoreResult};

/// A user as found in one of the two user collections
#[derive(Debug, Clone, PartialEq)]
pub enum UserProfile {
    Trial(TrialUser),
    Subscribed(SubscribedUser),
}

impl UserProfile {
    pub fn email(&self) -> &str {
        match self {
            UserProfile::Trial(trial) => &trial.email,
            UserProfile::Subscribed(user) => &user.email,
        }
    }

    pub fn role(&self) -> Option<&str> {
        match self {
            UserProfile::Trial(trial) => trial.role.as_deref(),
            UserProfile::Subscribed(user) => user.role.as_deref(),
        }
    }

    pub fn status(&self) -> UserStatus {
        match self {
            UserProfile::Trial(trial) => UserStatus::for_trial(trial),
            UserProfile::Subscribed(user) => UserStatus::for_subscriber(user),
        }
    }
}

/// Subscribers win when a stale trial document still exists
pub async fn load_profile(store: &dyn DocumentStore, user_id: &str) -> StoreResult<Option<UserProfile>> {
    if let Some(user) = get_doc::<SubscribedUser>(store, collections::SUBSCRIBED_USERS, user_id).await? {
        return Ok(Some(UserProfile::Subscribed(user)));
    }
    Ok(get_doc::<TrialUser>(store, collections::TRIAL_USERS, user_id)
        .await?
        .map(UserProfile::Trial))
}

/// Admin needs both the stored role and the configured admin address
pub fn check_admin(
    profile: Option<&UserProfile>,
    token_email: Option<&str>,
    admin_email: &str,
) -> Result<(), AppError> {
    let role_ok = profile.and_then(UserProfile::role) == Some(ADMIN_ROLE);
    let email_ok = !admin_email.is_empty()
        && token_email.map_or(false, |email| email.eq_ignore_ascii_case(admin_email))
        && profile.map_or(false, |p| p.email().eq_ignore_ascii_case(admin_email));

    if role_ok && email_ok {
        Ok(())
    } else {
        Err(AppError::AdminRequired)
    }
}

/// What the caller may spend on a generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaGrant {
    Subscription { monthly_usage: u32, max_usage: u32 },
    Trial { descriptions_remaining: u32 },
}

pub fn check_subscription(profile: Option<&UserProfile>) -> Result<QuotaGrant, AppError> {
    match profile {
        Some(UserProfile::Subscribed(user)) if user.has_quota() => Ok(QuotaGrant::Subscription {
            monthly_usage: user.monthly_usage,
            max_usage: user.max_usage,
        }),
        Some(UserProfile::Subscribed(user)) if user.is_subscribed => {
            Err(AppError::UsageLimitExceeded)
        }
        Some(UserProfile::Trial(trial)) if trial.descriptions_remaining > 0 => {
            Ok(QuotaGrant::Trial {
                descriptions_remaining: trial.descriptions_remaining,
            })
        }
        Some(UserProfile::Trial(_)) => Err(AppError::UsageLimitExceeded),
        _ => Err(AppError::SubscriptionRequired),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PlanType;
    use chrono::Utc;

    fn subscriber(monthly_usage: u32) -> UserProfile {
        let mut user = SubscribedUser::new("u1", "u@ex.com", PlanType::Starter, Utc::now());
        user.max_usage = 3;
        user.monthly_usage = monthly_usage;
        UserProfile::Subscribed(user)
    }

    #[test]
    fn test_subscription_quota() {
        assert!(matches!(
            check_subscription(Some(&subscriber(2))),
            Ok(QuotaGrant::Subscription { monthly_usage: 2, max_usage: 3 })
        ));
        assert!(matches!(
            check_subscription(Some(&subscriber(3))),
            Err(AppError::UsageLimitExceeded)
        ));
        assert!(matches!(check_subscription(None), Err(AppError::SubscriptionRequired)));
    }

    #[test]
    fn test_trial_quota() {
        let mut trial = TrialUser::new("u1", "u@ex.com", "1.2.3.4", Utc::now());
        assert!(matches!(
            check_subscription(Some(&UserProfile::Trial(trial.clone()))),
            Ok(QuotaGrant::Trial { descriptions_remaining: 3 })
        ));
        trial.descriptions_remaining = 0;
        assert!(matches!(
            check_subscription(Some(&UserProfile::Trial(trial))),
            Err(AppError::UsageLimitExceeded)
        ));
    }

    #[test]
    fn test_free_plan_needs_subscription() {
        let user = SubscribedUser::new("u1", "u@ex.com", PlanType::Free, Utc::now());
        assert!(matches!(
            check_subscription(Some(&UserProfile::Subscribed(user))),
            Err(AppError::SubscriptionRequired)
        ));
    }

    #[test]
    fn test_admin_needs_role_and_email() {
        let mut user = SubscribedUser::new("a1", "admin@example.com", PlanType::Unlocked, Utc::now());
        let profile = UserProfile::Subscribed(user.clone());
        assert!(check_admin(Some(&profile), Some("admin@example.com"), "admin@example.com").is_err());

        user.role = Some(ADMIN_ROLE.to_string());
        let profile = UserProfile::Subscribed(user);
        assert!(check_admin(Some(&profile), Some("admin@example.com"), "admin@example.com").is_ok());
        assert!(check_admin(Some(&profile), Some("other@example.com"), "admin@example.com").is_err());
        assert!(check_admin(None, Some("admin@example.com"), "admin@example.com").is_err());
    }
}
