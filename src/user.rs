//! User identity: the account entity and its value objects.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::AuthError;

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}$").unwrap()
});

/// Opaque user identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for UserId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl FromStr for UserId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Validated, lowercased email address. Lowercasing at the boundary makes
/// uniqueness case-insensitive everywhere downstream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Email(String);

impl Email {
    pub fn parse(raw: &str) -> Result<Self, AuthError> {
        let normalized = raw.trim().to_lowercase();
        if normalized.is_empty() || normalized.len() > 320 {
            return Err(AuthError::InvalidEmail);
        }
        if !EMAIL_RE.is_match(&normalized) {
            return Err(AuthError::InvalidEmail);
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Email {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Email {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// The account record owned by the credential store.
///
/// The password hash is a PHC string; the per-user salt is embedded in it.
/// Role membership lives in the store's assignment table, not on the entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub email: Email,
    pub password_hash: String,
    pub is_active: bool,
    pub email_verified: bool,
    pub failed_attempts: u32,
    pub locked_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
}

impl User {
    pub fn new(email: Email, password_hash: String) -> Self {
        Self {
            id: UserId::new(),
            email,
            password_hash,
            is_active: true,
            email_verified: false,
            failed_attempts: 0,
            locked_until: None,
            created_at: Utc::now(),
            last_login: None,
        }
    }

    /// Applies a failed login attempt, returning the updated count.
    pub fn record_failure(&mut self) -> u32 {
        self.failed_attempts = self.failed_attempts.saturating_add(1);
        self.failed_attempts
    }

    /// Applies a successful login: counter reset, lock cleared, login stamped.
    pub fn record_success(&mut self, at: DateTime<Utc>) {
        self.failed_attempts = 0;
        self.locked_until = None;
        self.last_login = Some(at);
    }

    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.map_or(false, |until| until > now)
    }

    pub fn deactivate(&mut self) {
        self.is_active = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn email_is_normalized_to_lowercase() {
        let email = Email::parse("  User@Example.COM ").unwrap();
        assert_eq!(email.as_str(), "user@example.com");
    }

    #[test]
    fn invalid_emails_are_rejected() {
        for raw in ["", "plainaddress", "a@b", "user@", "@example.com", "a b@x.com"] {
            assert!(Email::parse(raw).is_err(), "accepted {raw:?}");
        }
    }

    #[test]
    fn user_id_round_trips_through_display() {
        let id = UserId::new();
        let parsed: UserId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn new_user_starts_unlocked_and_active() {
        let user = User::new(Email::parse("a@x.com").unwrap(), "hash".into());
        assert!(user.is_active);
        assert!(!user.email_verified);
        assert_eq!(user.failed_attempts, 0);
        assert!(!user.is_locked(Utc::now()));
        assert!(user.last_login.is_none());
    }

    #[test]
    fn failure_and_success_mutate_counters() {
        let mut user = User::new(Email::parse("a@x.com").unwrap(), "hash".into());
        assert_eq!(user.record_failure(), 1);
        assert_eq!(user.record_failure(), 2);
        user.locked_until = Some(Utc::now() + Duration::minutes(5));
        assert!(user.is_locked(Utc::now()));

        user.record_success(Utc::now());
        assert_eq!(user.failed_attempts, 0);
        assert!(!user.is_locked(Utc::now()));
        assert!(user.last_login.is_some());
    }

    #[test]
    fn lock_in_the_past_does_not_lock() {
        let mut user = User::new(Email::parse("a@x.com").unwrap(), "hash".into());
        user.locked_until = Some(Utc::now() - Duration::seconds(1));
        assert!(!user.is_locked(Utc::now()));
    }
}
