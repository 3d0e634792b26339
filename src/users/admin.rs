use crate::authz::profile::{load_profile, UserProfile};
use crate::clock::Clock;
use crate::domain::user::TRIAL_DESCRIPTIONS;
use crate::domain::{DeletedUser, PlanType, SubscribedUser, TrialUser, UserStatus};
use crate::errors::{AppError, Result};
use crate::store::{
    collections, delete_doc, get_doc, list_docs, put_doc, update_doc, Change, DocumentStore,
};
use crate::users::email::EmailValidator;
use crate::users::lifecycle::UserLifecycle;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminAction {
    GetAllUsers,
    GetUser,
    ResetUsage,
    ResetSubscription,
    UpdateUser,
    DeleteUser,
    CreateTestUser,
    ResetAllUsage,
    SyncUser,
    ManualAddUser,
    ManualUnlock,
}

impl AdminAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdminAction::GetAllUsers => "get_all_users",
            AdminAction::GetUser => "get_user",
            AdminAction::ResetUsage => "reset_usage",
            AdminAction::ResetSubscription => "reset_subscription",
            AdminAction::UpdateUser => "update_user",
            AdminAction::DeleteUser => "delete_user",
            AdminAction::CreateTestUser => "create_test_user",
            AdminAction::ResetAllUsage => "reset_all_usage",
            AdminAction::SyncUser => "sync_user",
            AdminAction::ManualAddUser => "manual_add_user",
            AdminAction::ManualUnlock => "manual_unlock",
        }
    }

    /// Actions that only read
    pub fn is_read_only(&self) -> bool {
        matches!(self, AdminAction::GetAllUsers | AdminAction::GetUser)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminRequest {
    pub action: AdminAction,
    pub user_id: Option<String>,
    #[serde(default)]
    pub user_data: UserData,
}

/// Fields an admin may set on a user
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserData {
    pub email: Option<String>,
    pub plan_type: Option<String>,
    pub monthly_usage: Option<u32>,
    pub descriptions_remaining: Option<u32>,
    pub role: Option<String>,
}

impl UserData {
    fn plan(&self) -> Result<Option<PlanType>> {
        self.plan_type
            .as_deref()
            .map(|name| {
                PlanType::parse(name)
                    .ok_or_else(|| AppError::InvalidInput(format!("Unknown plan type: {}", name)))
            })
            .transpose()
    }
}

/// Manual user management behind the admin endpoint
pub struct AdminService {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    lifecycle: Arc<UserLifecycle>,
    emails: Arc<EmailValidator>,
    max_retries: u32,
}

impl AdminService {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
        lifecycle: Arc<UserLifecycle>,
        emails: Arc<EmailValidator>,
        max_retries: u32,
    ) -> Self {
        Self {
            store,
            clock,
            lifecycle,
            emails,
            max_retries,
        }
    }

    pub async fn execute(&self, request: AdminRequest, actor: &str) -> Result<Value> {
        let action = request.action;
        let result = self.dispatch(request, actor).await;
        match &result {
            Ok(_) if !action.is_read_only() => {
                tracing::info!(action = action.as_str(), actor = %actor, "Admin action applied")
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(action = action.as_str(), actor = %actor, error = %e, "Admin action failed")
            }
        }
        result
    }

    async fn dispatch(&self, request: AdminRequest, actor: &str) -> Result<Value> {
        let user_id = request.user_id.as_deref().map(str::trim).filter(|id| !id.is_empty());
        let data = &request.user_data;
        match request.action {
            AdminAction::GetAllUsers => self.get_all_users().await,
            AdminAction::GetUser => self.get_user(required(user_id)?).await,
            AdminAction::ResetUsage => {
                let status = self.lifecycle.reset_usage(required(user_id)?).await?;
                Ok(json!({ "success": true, "status": status }))
            }
            AdminAction::ResetSubscription => self.reset_subscription(required(user_id)?).await,
            AdminAction::UpdateUser => self.update_user(required(user_id)?, data).await,
            AdminAction::DeleteUser => self.delete_user(required(user_id)?, actor).await,
            AdminAction::CreateTestUser => self.create_test_user(user_id, data).await,
            AdminAction::ResetAllUsage => {
                let reset = self.lifecycle.reset_monthly_usage().await?;
                Ok(json!({ "success": true, "usersReset": reset }))
            }
            AdminAction::SyncUser => self.sync_user(required(user_id)?).await,
            AdminAction::ManualAddUser => self.manual_add_user(required(user_id)?, data).await,
            AdminAction::ManualUnlock => self.manual_unlock(required(user_id)?, data).await,
        }
    }

    async fn get_all_users(&self) -> Result<Value> {
        let trials: Vec<(String, TrialUser)> =
            list_docs(self.store.as_ref(), collections::TRIAL_USERS).await?;
        let subscribers: Vec<(String, SubscribedUser)> =
            list_docs(self.store.as_ref(), collections::SUBSCRIBED_USERS).await?;
        let trials: Vec<TrialUser> = trials.into_iter().map(|(_, user)| user).collect();
        let subscribers: Vec<SubscribedUser> = subscribers.into_iter().map(|(_, user)| user).collect();

        Ok(json!({
            "success": true,
            "total": trials.len() + subscribers.len(),
            "trialUsers": trials,
            "subscribedUsers": subscribers,
        }))
    }

    async fn get_user(&self, user_id: &str) -> Result<Value> {
        match load_profile(self.store.as_ref(), user_id).await? {
            Some(UserProfile::Subscribed(user)) => Ok(json!({
                "success": true,
                "collection": collections::SUBSCRIBED_USERS,
                "user": user,
            })),
            Some(UserProfile::Trial(trial)) => Ok(json!({
                "success": true,
                "collection": collections::TRIAL_USERS,
                "user": trial,
            })),
            None => Err(AppError::NotFound("User".to_string())),
        }
    }

    async fn reset_subscription(&self, user_id: &str) -> Result<Value> {
        let now = self.clock.now();
        let user = update_doc(
            self.store.as_ref(),
            collections::SUBSCRIBED_USERS,
            user_id,
            self.max_retries,
            |current: Option<SubscribedUser>| match current {
                None => Ok((Change::Keep, None)),
                Some(mut user) => {
                    user.set_plan(PlanType::Free, now);
                    user.monthly_usage = 0;
                    user.subscription_id = None;
                    user.billing_cycle = None;
                    user.next_billing_date = None;
                    Ok((Change::Put(user.clone()), Some(user)))
                }
            },
        )
        .await?
        .ok_or_else(|| AppError::NotFound("Subscribed user".to_string()))?;

        Ok(json!({ "success": true, "status": UserStatus::for_subscriber(&user) }))
    }

    async fn update_user(&self, user_id: &str, data: &UserData) -> Result<Value> {
        let current = load_profile(self.store.as_ref(), user_id)
            .await?
            .ok_or_else(|| AppError::NotFound("User".to_string()))?;

        let email = match &data.email {
            Some(email) if !email.trim().eq_ignore_ascii_case(current.email()) => {
                Some(self.emails.validate(email).await?)
            }
            _ => None,
        };
        let plan = data.plan()?;
        let now = self.clock.now();

        let status = match current {
            UserProfile::Subscribed(_) => update_doc(
                self.store.as_ref(),
                collections::SUBSCRIBED_USERS,
                user_id,
                self.max_retries,
                |current: Option<SubscribedUser>| {
                    let Some(mut user) = current else {
                        return Ok((Change::Keep, None));
                    };
                    if let Some(email) = &email {
                        user.email = email.clone();
                    }
                    if let Some(plan) = plan {
                        user.set_plan(plan, now);
                    }
                    if let Some(usage) = data.monthly_usage {
                        user.monthly_usage = usage.min(user.max_usage);
                    }
                    if let Some(role) = &data.role {
                        user.role = Some(role.clone());
                    }
                    user.updated_at = now;
                    let status = UserStatus::for_subscriber(&user);
                    Ok((Change::Put(user), Some(status)))
                },
            )
            .await?,
            UserProfile::Trial(_) => update_doc(
                self.store.as_ref(),
                collections::TRIAL_USERS,
                user_id,
                self.max_retries,
                |current: Option<TrialUser>| {
                    let Some(mut trial) = current else {
                        return Ok((Change::Keep, None));
                    };
                    if let Some(email) = &email {
                        trial.email = email.clone();
                    }
                    if let Some(remaining) = data.descriptions_remaining {
                        trial.descriptions_remaining = remaining.min(TRIAL_DESCRIPTIONS);
                    }
                    if let Some(role) = &data.role {
                        trial.role = Some(role.clone());
                    }
                    let status = UserStatus::for_trial(&trial);
                    Ok((Change::Put(trial), Some(status)))
                },
            )
            .await?,
        };

        let status = status.ok_or_else(|| AppError::NotFound("User".to_string()))?;
        Ok(json!({ "success": true, "status": status }))
    }

    /// Archive the user to `deleted_users`, then remove it from every
    /// user collection
    async fn delete_user(&self, user_id: &str, actor: &str) -> Result<Value> {
        let now = self.clock.now();
        let mut archived = 0;
        for collection in [collections::SUBSCRIBED_USERS, collections::TRIAL_USERS] {
            let Some(doc) = self.store.get(collection, user_id).await? else {
                continue;
            };
            let deleted = DeletedUser {
                user_id: user_id.to_string(),
                source_collection: collection.to_string(),
                data: doc.data,
                deleted_at: now,
                deleted_by: actor.to_string(),
            };
            let archive_id = format!("{}:{}", collection, user_id);
            put_doc(self.store.as_ref(), collections::DELETED_USERS, &archive_id, &deleted).await?;
            delete_doc(self.store.as_ref(), collection, user_id).await?;
            archived += 1;
        }

        if archived == 0 {
            return Err(AppError::NotFound("User".to_string()));
        }
        Ok(json!({ "success": true, "deleted": archived }))
    }

    async fn create_test_user(&self, user_id: Option<&str>, data: &UserData) -> Result<Value> {
        let email = data
            .email
            .as_deref()
            .ok_or_else(|| AppError::InvalidInput("userData.email is required".to_string()))?;
        let email = self.emails.validate(email).await?;
        let plan = data.plan()?.unwrap_or(PlanType::Starter);
        let user_id = match user_id {
            Some(id) => id.to_string(),
            None => format!("test_{}", uuid::Uuid::new_v4().simple()),
        };

        // A pending trial must be converted, not shadowed
        let trial: Option<TrialUser> =
            get_doc(self.store.as_ref(), collections::TRIAL_USERS, &user_id).await?;
        if trial.is_some() {
            return Err(AppError::UserExists);
        }

        let mut user = SubscribedUser::new(&user_id, &email, plan, self.clock.now());
        user.is_test_user = true;
        user.role = data.role.clone();
        self.insert_subscriber(user.clone()).await?;

        Ok(json!({ "success": true, "user": user }))
    }

    async fn manual_add_user(&self, user_id: &str, data: &UserData) -> Result<Value> {
        let email = data
            .email
            .as_deref()
            .ok_or_else(|| AppError::InvalidInput("userData.email is required".to_string()))?;
        let email = self.emails.validate(email).await?;
        let plan = data.plan()?.unwrap_or(PlanType::Starter);
        let now = self.clock.now();

        let trial: Option<TrialUser> =
            get_doc(self.store.as_ref(), collections::TRIAL_USERS, user_id).await?;
        let mut user = SubscribedUser::new(user_id, &email, plan, now);
        user.role = data.role.clone();
        if let Some(trial) = &trial {
            user.previous_status = Some(trial.status.clone());
            user.trial_started_at = Some(trial.created_at);
            user.trial_ended_at = Some(now);
        }
        self.insert_subscriber(user.clone()).await?;
        if trial.is_some() {
            delete_doc(self.store.as_ref(), collections::TRIAL_USERS, user_id).await?;
        }

        Ok(json!({ "success": true, "user": user }))
    }

    /// Grant the unlimited tier, converting a trial if needed
    async fn manual_unlock(&self, user_id: &str, data: &UserData) -> Result<Value> {
        let now = self.clock.now();
        let trial: Option<TrialUser> =
            get_doc(self.store.as_ref(), collections::TRIAL_USERS, user_id).await?;

        let user = update_doc(
            self.store.as_ref(),
            collections::SUBSCRIBED_USERS,
            user_id,
            self.max_retries,
            |current: Option<SubscribedUser>| {
                let mut user = match (current, &trial) {
                    (Some(user), _) => user,
                    (None, Some(trial)) => {
                        let mut user = SubscribedUser::new(user_id, &trial.email, PlanType::Unlocked, now);
                        user.previous_status = Some(trial.status.clone());
                        user.trial_started_at = Some(trial.created_at);
                        user.trial_ended_at = Some(now);
                        user.role = trial.role.clone();
                        user
                    }
                    (None, None) => return Ok((Change::Keep, None)),
                };
                user.set_plan(PlanType::Unlocked, now);
                if let Some(email) = &data.email {
                    if user.email.is_empty() {
                        user.email = email.trim().to_ascii_lowercase();
                    }
                }
                Ok((Change::Put(user.clone()), Some(user)))
            },
        )
        .await?
        .ok_or_else(|| AppError::NotFound("User".to_string()))?;

        if trial.is_some() {
            delete_doc(self.store.as_ref(), collections::TRIAL_USERS, user_id).await?;
        }
        Ok(json!({ "success": true, "status": UserStatus::for_subscriber(&user) }))
    }

    /// A user present in both collections keeps only the subscriber record
    async fn sync_user(&self, user_id: &str) -> Result<Value> {
        let subscriber: Option<SubscribedUser> =
            get_doc(self.store.as_ref(), collections::SUBSCRIBED_USERS, user_id).await?;
        let trial: Option<TrialUser> =
            get_doc(self.store.as_ref(), collections::TRIAL_USERS, user_id).await?;

        let (removed_trial, status) = match (subscriber, trial) {
            (Some(user), Some(_)) => {
                delete_doc(self.store.as_ref(), collections::TRIAL_USERS, user_id).await?;
                (true, UserStatus::for_subscriber(&user))
            }
            (Some(user), None) => (false, UserStatus::for_subscriber(&user)),
            (None, Some(trial)) => (false, UserStatus::for_trial(&trial)),
            (None, None) => return Err(AppError::NotFound("User".to_string())),
        };

        Ok(json!({ "success": true, "removedTrial": removed_trial, "status": status }))
    }

    async fn insert_subscriber(&self, user: SubscribedUser) -> Result<()> {
        let user_id = user.user_id.clone();
        let inserted = update_doc(
            self.store.as_ref(),
            collections::SUBSCRIBED_USERS,
            &user_id,
            self.max_retries,
            |current: Option<SubscribedUser>| match current {
                Some(_) => Ok((Change::Keep, false)),
                None => Ok((Change::Put(user.clone()), true)),
            },
        )
        .await?;
        if inserted {
            Ok(())
        } else {
            Err(AppError::UserExists)
        }
    }
}

fn required(user_id: Option<&str>) -> Result<&str> {
    user_id.ok_or_else(|| AppError::InvalidInput("userId is required".to_string()))
}
