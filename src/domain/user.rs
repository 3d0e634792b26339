use crate::store::Document;
use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};

/// Descriptions granted to a fresh trial
pub const TRIAL_DESCRIPTIONS: u32 = 3;

/// Trial length in months
pub const TRIAL_MONTHS: u32 = 6;

pub const TRIAL_STATUS: &str = "trial";
pub const ADMIN_ROLE: &str = "admin";

/// Subscription tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanType {
    Free,
    Starter,
    Professional,
    Enterprise,
    Unlocked,
}

impl PlanType {
    /// Monthly description allowance for the tier
    pub fn max_usage(&self) -> u32 {
        match self {
            PlanType::Free => 0,
            PlanType::Starter => 50,
            PlanType::Professional => 250,
            PlanType::Enterprise => 1_000,
            PlanType::Unlocked => 999_999,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlanType::Free => "free",
            PlanType::Starter => "starter",
            PlanType::Professional => "professional",
            PlanType::Enterprise => "enterprise",
            PlanType::Unlocked => "unlocked",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "free" => Some(PlanType::Free),
            "starter" => Some(PlanType::Starter),
            "professional" | "pro" => Some(PlanType::Professional),
            "enterprise" => Some(PlanType::Enterprise),
            "unlocked" => Some(PlanType::Unlocked),
            _ => None,
        }
    }

    /// Tiers that can be bought through the payment processor
    pub fn is_purchasable(&self) -> bool {
        matches!(
            self,
            PlanType::Starter | PlanType::Professional | PlanType::Enterprise
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingCycle {
    Monthly,
    Yearly,
}

/// Trial user, stored in the `Users` collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialUser {
    pub user_id: String,
    pub email: String,
    pub ip_address: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub descriptions_remaining: u32,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

impl TrialUser {
    pub fn new(user_id: &str, email: &str, ip_address: &str, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            email: email.to_string(),
            ip_address: ip_address.to_string(),
            created_at: now,
            expires_at: trial_expiry(now),
            descriptions_remaining: TRIAL_DESCRIPTIONS,
            status: TRIAL_STATUS.to_string(),
            role: None,
        }
    }
}

impl Document for TrialUser {
    fn expires_at(&self) -> Option<DateTime<Utc>> {
        Some(self.expires_at)
    }
}

/// `createdAt + 6 months`, clamped to the end of shorter months
pub fn trial_expiry(created_at: DateTime<Utc>) -> DateTime<Utc> {
    created_at
        .checked_add_months(Months::new(TRIAL_MONTHS))
        .unwrap_or(created_at)
}

/// Paying (or manually unlocked) user, stored in the `users` collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "StoredSubscribedUser")]
pub struct SubscribedUser {
    pub user_id: String,
    pub email: String,
    pub plan_type: PlanType,
    pub max_usage: u32,
    pub monthly_usage: u32,
    pub subscription_id: Option<String>,
    pub is_subscribed: bool,
    pub billing_cycle: Option<BillingCycle>,
    pub next_billing_date: Option<DateTime<Utc>>,
    pub previous_status: Option<String>,
    pub trial_started_at: Option<DateTime<Utc>>,
    pub trial_ended_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_reset: Option<DateTime<Utc>>,
    pub role: Option<String>,
    pub is_test_user: bool,
}

impl SubscribedUser {
    pub fn new(user_id: &str, email: &str, plan_type: PlanType, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            email: email.to_string(),
            plan_type,
            max_usage: plan_type.max_usage(),
            monthly_usage: 0,
            subscription_id: None,
            is_subscribed: plan_type != PlanType::Free,
            billing_cycle: None,
            next_billing_date: None,
            previous_status: None,
            trial_started_at: None,
            trial_ended_at: None,
            created_at: now,
            updated_at: now,
            last_reset: None,
            role: None,
            is_test_user: false,
        }
    }

    pub fn remaining(&self) -> u32 {
        self.max_usage.saturating_sub(self.monthly_usage)
    }

    pub fn has_quota(&self) -> bool {
        self.monthly_usage < self.max_usage
    }

    /// Switch tier, keeping usage within the new allowance
    pub fn set_plan(&mut self, plan_type: PlanType, now: DateTime<Utc>) {
        self.plan_type = plan_type;
        self.max_usage = plan_type.max_usage();
        self.monthly_usage = self.monthly_usage.min(self.max_usage);
        self.is_subscribed = plan_type != PlanType::Free;
        self.updated_at = now;
    }
}

impl Document for SubscribedUser {
    fn expires_at(&self) -> Option<DateTime<Utc>> {
        None
    }
}

/// On-disk shape of a subscriber, including fields written by older
/// releases (`subscriptionType`, `currentUsage`).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredSubscribedUser {
    user_id: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    plan_type: Option<PlanType>,
    #[serde(default)]
    subscription_type: Option<String>,
    #[serde(default)]
    max_usage: Option<u32>,
    #[serde(default)]
    monthly_usage: Option<u32>,
    #[serde(default)]
    current_usage: Option<u32>,
    #[serde(default)]
    subscription_id: Option<String>,
    #[serde(default)]
    is_subscribed: Option<bool>,
    #[serde(default)]
    billing_cycle: Option<BillingCycle>,
    #[serde(default)]
    next_billing_date: Option<DateTime<Utc>>,
    #[serde(default)]
    previous_status: Option<String>,
    #[serde(default)]
    trial_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    trial_ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    last_reset: Option<DateTime<Utc>>,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    is_test_user: bool,
}

impl From<StoredSubscribedUser> for SubscribedUser {
    fn from(stored: StoredSubscribedUser) -> Self {
        let plan_type = stored
            .plan_type
            .or_else(|| stored.subscription_type.as_deref().and_then(PlanType::parse))
            .unwrap_or(PlanType::Free);
        let max_usage = stored.max_usage.unwrap_or_else(|| plan_type.max_usage());
        let monthly_usage = stored
            .monthly_usage
            .or(stored.current_usage)
            .unwrap_or(0)
            .min(max_usage);
        let created_at = stored.created_at.unwrap_or_default();

        Self {
            user_id: stored.user_id,
            email: stored.email,
            plan_type,
            max_usage,
            monthly_usage,
            subscription_id: stored.subscription_id,
            is_subscribed: stored
                .is_subscribed
                .unwrap_or(plan_type != PlanType::Free),
            billing_cycle: stored.billing_cycle,
            next_billing_date: stored.next_billing_date,
            previous_status: stored.previous_status,
            trial_started_at: stored.trial_started_at,
            trial_ended_at: stored.trial_ended_at,
            created_at,
            updated_at: stored.updated_at.unwrap_or(created_at),
            last_reset: stored.last_reset,
            role: stored.role,
            is_test_user: stored.is_test_user,
        }
    }
}

/// Soft-deleted user archived by an admin
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletedUser {
    pub user_id: String,
    pub source_collection: String,
    pub data: serde_json::Value,
    pub deleted_at: DateTime<Utc>,
    pub deleted_by: String,
}

impl Document for DeletedUser {
    fn expires_at(&self) -> Option<DateTime<Utc>> {
        None
    }
}

/// Which collection a user currently lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UserCollection {
    #[serde(rename = "Users")]
    Trial,
    #[serde(rename = "users")]
    Subscribed,
}

/// Response body of the user status lookup
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStatus {
    pub exists: bool,
    pub collection: UserCollection,
    pub status: String,
    pub descriptions_remaining: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_type: Option<PlanType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monthly_usage: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_usage: Option<u32>,
}

impl UserStatus {
    pub fn for_trial(trial: &TrialUser) -> Self {
        Self {
            exists: true,
            collection: UserCollection::Trial,
            status: trial.status.clone(),
            descriptions_remaining: trial.descriptions_remaining,
            plan_type: None,
            monthly_usage: None,
            max_usage: None,
        }
    }

    pub fn for_subscriber(user: &SubscribedUser) -> Self {
        let status = if user.is_subscribed { "active" } else { "inactive" };
        Self {
            exists: true,
            collection: UserCollection::Subscribed,
            status: status.to_string(),
            descriptions_remaining: user.remaining(),
            plan_type: Some(user.plan_type),
            monthly_usage: Some(user.monthly_usage),
            max_usage: Some(user.max_usage),
        }
    }
}
