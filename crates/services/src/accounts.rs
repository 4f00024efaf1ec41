//! Accounts: user registration and profile lifecycle.
//!
//! Credentials are out of scope here; registering, updating or deleting a
//! user changes the profile store and announces `user.registered`,
//! `user.updated` or `user.deleted` on the user exchange.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, instrument};

use marketflow_core::{DomainError, DomainResult, UserId};
use marketflow_events::{MessageBroker, Publisher, UserDeleted, UserRegistered, UserUpdated};

use crate::publish_or_warn;
use crate::store::{InMemoryRepository, Repository};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

pub struct AccountService<B> {
    users: Arc<dyn Repository<UserId, User>>,
    publisher: Publisher<B>,
}

impl<B> AccountService<B>
where
    B: MessageBroker,
{
    pub fn new(publisher: Publisher<B>) -> Self {
        Self::with_store(publisher, Arc::new(InMemoryRepository::new()))
    }

    pub fn with_store(publisher: Publisher<B>, users: Arc<dyn Repository<UserId, User>>) -> Self {
        Self { users, publisher }
    }

    /// Create a user and publish `user.registered`.
    ///
    /// Usernames and emails are unique (case-insensitive for email).
    #[instrument(skip(self, email), err)]
    pub fn register(&self, username: &str, email: &str) -> DomainResult<User> {
        let username = validate_username(username)?;
        let email = validate_email(email)?;

        let user = User {
            id: UserId::generate(),
            username: username.to_string(),
            email: email.to_string(),
            created_at: Utc::now(),
        };
        self.users
            .insert_unique(user.id.clone(), user.clone(), &same_identity)
            .map_err(|existing| identity_conflict(&existing, &user))?;
        info!(user_id = %user.id, "user registered");

        publish_or_warn(
            &self.publisher,
            &UserRegistered {
                user_id: user.id.clone(),
                username: user.username.clone(),
                email: user.email.clone(),
            },
        );

        Ok(user)
    }

    pub fn get(&self, id: &UserId) -> DomainResult<User> {
        self.users
            .get(id)
            .ok_or_else(|| DomainError::not_found(format!("user {id}")))
    }

    /// Change username and/or email and publish `user.updated` with the full
    /// profile. `None` keeps the current value; uniqueness as for `register`.
    #[instrument(skip(self, changes), fields(user_id = %id), err)]
    pub fn update_profile(&self, id: &UserId, changes: ProfileChanges) -> DomainResult<User> {
        let username = non_blank(&changes.username).map(validate_username).transpose()?;
        let email = non_blank(&changes.email).map(validate_email).transpose()?;

        let user = self
            .users
            .update_unique(
                id,
                &mut |user| {
                    if let Some(username) = username {
                        user.username = username.to_string();
                    }
                    if let Some(email) = email {
                        user.email = email.to_string();
                    }
                },
                &same_identity,
            )
            .ok_or_else(|| DomainError::not_found(format!("user {id}")))?
            .map_err(|existing| {
                let wanted = User {
                    username: username.unwrap_or_default().to_string(),
                    email: email.unwrap_or_default().to_string(),
                    ..existing.clone()
                };
                identity_conflict(&existing, &wanted)
            })?;
        info!("profile updated");

        publish_or_warn(
            &self.publisher,
            &UserUpdated {
                user_id: user.id.clone(),
                username: user.username.clone(),
                email: user.email.clone(),
            },
        );

        Ok(user)
    }

    /// Remove a user and publish `user.deleted`.
    #[instrument(skip(self), fields(user_id = %id), err)]
    pub fn delete_user(&self, id: &UserId) -> DomainResult<()> {
        self.users
            .remove(id)
            .ok_or_else(|| DomainError::not_found(format!("user {id}")))?;
        info!("user deleted");

        publish_or_warn(&self.publisher, &UserDeleted { user_id: id.clone() });
        Ok(())
    }
}

/// Partial profile update. Absent or blank fields keep their current value.
#[derive(Debug, Clone, Default)]
pub struct ProfileChanges {
    pub username: Option<String>,
    pub email: Option<String>,
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}

fn same_identity(existing: &User, candidate: &User) -> bool {
    existing.username == candidate.username || existing.email.eq_ignore_ascii_case(&candidate.email)
}

fn identity_conflict(existing: &User, candidate: &User) -> DomainError {
    if existing.username == candidate.username {
        DomainError::conflict(format!("username {} is taken", candidate.username))
    } else {
        DomainError::conflict("email is already registered")
    }
}

fn validate_username(username: &str) -> DomainResult<&str> {
    let username = username.trim();
    if username.is_empty() {
        return Err(DomainError::validation("username is required"));
    }
    Ok(username)
}

fn validate_email(email: &str) -> DomainResult<&str> {
    let email = email.trim();
    if !is_plausible_email(email) {
        return Err(DomainError::validation(format!("invalid email {email:?}")));
    }
    Ok(email)
}

fn is_plausible_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => !local.is_empty() && !domain.is_empty() && !domain.contains('@'),
        None => false,
    }
}
