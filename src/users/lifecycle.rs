use crate::authz::profile::{load_profile, UserProfile};
use crate::clock::Clock;
use crate::domain::user::TRIAL_DESCRIPTIONS;
use crate::domain::{BillingCycle, PlanType, SubscribedUser, TrialUser, UserStatus};
use crate::errors::{AppError, Result};
use crate::observability::MetricsRecorder;
use crate::store::{
    collections, delete_doc, get_doc, list_docs, update_doc, Change, DocumentStore,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Body of the payment webhook that activates a subscription
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeRequest {
    pub user_id: String,
    pub email: String,
    pub subscription_id: String,
    pub plan_type: String,
    pub billing_cycle: Option<BillingCycle>,
    pub next_billing_date: Option<DateTime<Utc>>,
}

/// Usage figures returned after a generation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSnapshot {
    pub current_usage: u32,
    pub max_usage: u32,
    pub subscription_type: String,
}

/// Trial creation, subscription upgrade and usage accounting over the two
/// user collections.
pub struct UserLifecycle {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    max_retries: u32,
}

impl UserLifecycle {
    pub fn new(store: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>, max_retries: u32) -> Self {
        Self {
            store,
            clock,
            max_retries,
        }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub async fn profile(&self, user_id: &str) -> Result<Option<UserProfile>> {
        Ok(load_profile(self.store.as_ref(), user_id).await?)
    }

    pub async fn status(&self, user_id: &str) -> Result<UserStatus> {
        self.profile(user_id)
            .await?
            .map(|profile| profile.status())
            .ok_or_else(|| AppError::NotFound("User".to_string()))
    }

    /// Create a trial for a first-time user. A device that already created
    /// a trial, or a user found in either collection, is refused.
    pub async fn create_trial(
        &self,
        user_id: &str,
        email: &str,
        ip_address: &str,
        device_already_registered: bool,
    ) -> Result<TrialUser> {
        if device_already_registered {
            return Err(AppError::DeviceAlreadyRegistered);
        }
        if get_doc::<SubscribedUser>(self.store.as_ref(), collections::SUBSCRIBED_USERS, user_id)
            .await?
            .is_some()
        {
            return Err(AppError::UserExists);
        }

        let now = self.clock.now();
        let created = update_doc(
            self.store.as_ref(),
            collections::TRIAL_USERS,
            user_id,
            self.max_retries,
            |current: Option<TrialUser>| match current {
                Some(_) => Ok((Change::Keep, None)),
                None => {
                    let trial = TrialUser::new(user_id, email, ip_address, now);
                    Ok((Change::Put(trial.clone()), Some(trial)))
                }
            },
        )
        .await?;

        let trial = created.ok_or(AppError::UserExists)?;
        tracing::info!(user_id = %user_id, "Trial user created");
        Ok(trial)
    }

    /// Activate or change a subscription. Replaying the same
    /// `subscriptionId` leaves the stored subscriber untouched.
    pub async fn upgrade(&self, request: &UpgradeRequest) -> Result<SubscribedUser> {
        let plan_type = PlanType::parse(&request.plan_type)
            .filter(PlanType::is_purchasable)
            .ok_or_else(|| AppError::InvalidInput(format!("Unknown plan type: {}", request.plan_type)))?;
        if request.user_id.trim().is_empty() || request.subscription_id.trim().is_empty() {
            return Err(AppError::InvalidInput(
                "userId and subscriptionId are required".to_string(),
            ));
        }

        let trial: Option<TrialUser> =
            get_doc(self.store.as_ref(), collections::TRIAL_USERS, &request.user_id).await?;
        let now = self.clock.now();

        let user = update_doc(
            self.store.as_ref(),
            collections::SUBSCRIBED_USERS,
            &request.user_id,
            self.max_retries,
            |current: Option<SubscribedUser>| {
                let mut user = match current {
                    Some(existing)
                        if existing.subscription_id.as_deref()
                            == Some(request.subscription_id.as_str()) =>
                    {
                        return Ok((Change::Keep, existing));
                    }
                    Some(mut existing) => {
                        existing.set_plan(plan_type, now);
                        existing
                    }
                    None => {
                        let mut user = SubscribedUser::new(&request.user_id, &request.email, plan_type, now);
                        if let Some(trial) = &trial {
                            user.previous_status = Some(trial.status.clone());
                            user.trial_started_at = Some(trial.created_at);
                            user.trial_ended_at = Some(now);
                            user.role = trial.role.clone();
                        }
                        user
                    }
                };
                user.email = request.email.clone();
                user.subscription_id = Some(request.subscription_id.clone());
                user.is_subscribed = true;
                user.billing_cycle = request.billing_cycle;
                user.next_billing_date = request.next_billing_date;
                user.updated_at = now;
                Ok((Change::Put(user.clone()), user))
            },
        )
        .await?;

        if trial.is_some() {
            delete_doc(self.store.as_ref(), collections::TRIAL_USERS, &request.user_id).await?;
        }

        tracing::info!(
            user_id = %request.user_id,
            plan = plan_type.as_str(),
            converted_trial = trial.is_some(),
            "Subscription upgraded"
        );
        Ok(user)
    }

    /// Spend one description: `monthlyUsage += 1` for subscribers while
    /// under the allowance, or one trial description.
    pub async fn increment_usage(&self, user_id: &str) -> Result<UsageSnapshot> {
        let now = self.clock.now();
        let spent = update_doc(
            self.store.as_ref(),
            collections::SUBSCRIBED_USERS,
            user_id,
            self.max_retries,
            |current: Option<SubscribedUser>| match current {
                None => Ok((Change::Keep, None)),
                Some(user) if !user.has_quota() => Ok((Change::Keep, Some(Err(AppError::UsageLimitExceeded)))),
                Some(mut user) => {
                    user.monthly_usage += 1;
                    user.updated_at = now;
                    let snapshot = UsageSnapshot {
                        current_usage: user.monthly_usage,
                        max_usage: user.max_usage,
                        subscription_type: user.plan_type.as_str().to_string(),
                    };
                    Ok((Change::Put(user), Some(Ok(snapshot))))
                }
            },
        )
        .await?;

        let snapshot = match spent {
            Some(result) => result?,
            None => self.spend_trial_description(user_id).await?,
        };
        MetricsRecorder::record_usage(&snapshot.subscription_type);
        Ok(snapshot)
    }

    async fn spend_trial_description(&self, user_id: &str) -> Result<UsageSnapshot> {
        update_doc(
            self.store.as_ref(),
            collections::TRIAL_USERS,
            user_id,
            self.max_retries,
            |current: Option<TrialUser>| match current {
                None => Ok((Change::Keep, Err(AppError::SubscriptionRequired))),
                Some(trial) if trial.descriptions_remaining == 0 => {
                    Ok((Change::Keep, Err(AppError::UsageLimitExceeded)))
                }
                Some(mut trial) => {
                    trial.descriptions_remaining -= 1;
                    let snapshot = UsageSnapshot {
                        current_usage: TRIAL_DESCRIPTIONS.saturating_sub(trial.descriptions_remaining),
                        max_usage: TRIAL_DESCRIPTIONS,
                        subscription_type: trial.status.clone(),
                    };
                    Ok((Change::Put(trial), Ok(snapshot)))
                }
            },
        )
        .await?
    }

    /// Zero `monthlyUsage` for every subscriber
    pub async fn reset_monthly_usage(&self) -> Result<usize> {
        let ids: Vec<String> =
            list_docs::<SubscribedUser>(self.store.as_ref(), collections::SUBSCRIBED_USERS)
                .await?
                .into_iter()
                .map(|(id, _)| id)
                .collect();
        let reset = self.reset_subscribers(&ids).await?;

        tracing::info!(listed = ids.len(), users = reset, "Monthly usage reset");
        Ok(reset)
    }

    /// Each reset is its own versioned update: a plan change or deletion
    /// landing after the listing is kept, never overwritten.
    async fn reset_subscribers(&self, ids: &[String]) -> Result<usize> {
        let now = self.clock.now();
        let mut reset = 0;
        for id in ids {
            let changed = update_doc(
                self.store.as_ref(),
                collections::SUBSCRIBED_USERS,
                id,
                self.max_retries,
                |current: Option<SubscribedUser>| match current {
                    None => Ok((Change::Keep, false)),
                    Some(mut user) => {
                        user.monthly_usage = 0;
                        user.last_reset = Some(now);
                        user.updated_at = now;
                        Ok((Change::Put(user), true))
                    }
                },
            )
            .await?;
            if changed {
                reset += 1;
            }
        }
        Ok(reset)
    }

    /// Reset one user's allowance: subscribers to zero usage, trials back
    /// to the full trial grant
    pub async fn reset_usage(&self, user_id: &str) -> Result<UserStatus> {
        let now = self.clock.now();
        let reset = update_doc(
            self.store.as_ref(),
            collections::SUBSCRIBED_USERS,
            user_id,
            self.max_retries,
            |current: Option<SubscribedUser>| match current {
                None => Ok((Change::Keep, None)),
                Some(mut user) => {
                    user.monthly_usage = 0;
                    user.last_reset = Some(now);
                    user.updated_at = now;
                    let status = UserStatus::for_subscriber(&user);
                    Ok((Change::Put(user), Some(status)))
                }
            },
        )
        .await?;
        if let Some(status) = reset {
            return Ok(status);
        }

        let reset = update_doc(
            self.store.as_ref(),
            collections::TRIAL_USERS,
            user_id,
            self.max_retries,
            |current: Option<TrialUser>| match current {
                None => Ok((Change::Keep, None)),
                Some(mut trial) => {
                    trial.descriptions_remaining = TRIAL_DESCRIPTIONS;
                    let status = UserStatus::for_trial(&trial);
                    Ok((Change::Put(trial), Some(status)))
                }
            },
        )
        .await?;
        reset.ok_or_else(|| AppError::NotFound("User".to_string()))
    }
}
