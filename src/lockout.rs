//! Failed-login counting and temporary account lockout.
//!
//! The counter lives in the credential store and is incremented atomically,
//! so concurrent failures against one account never under-count. Reaching the
//! threshold sets a lock timestamp; the lock expires on its own and a later
//! successful login clears both counter and lock.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::json;
use tracing::warn;

use crate::audit::{AuditLogger, SecurityEvent, SecurityEventType, SecuritySeverity};
use crate::config::LockoutConfig;
use crate::credential_store::CredentialStore;
use crate::errors::AuthResult;
use crate::user::User;

#[derive(Debug, Clone)]
pub struct LockoutPolicy {
    max_failed_attempts: u32,
    lockout_duration: Duration,
    store: Arc<dyn CredentialStore>,
    audit: AuditLogger,
}

impl LockoutPolicy {
    pub fn new(config: &LockoutConfig, store: Arc<dyn CredentialStore>, audit: AuditLogger) -> Self {
        Self {
            max_failed_attempts: config.max_failed_attempts,
            lockout_duration: config.lockout_duration(),
            store,
            audit,
        }
    }

    /// Whether the account is currently locked. Callers check this before
    /// verifying the password, so locked accounts cost no hashing work.
    pub fn is_locked(&self, user: &User) -> bool {
        user.is_locked(Utc::now())
    }

    /// Counts a failed attempt and locks the account when the threshold is
    /// reached. Returns the post-increment count.
    pub async fn on_failed_attempt(&self, user: &User) -> AuthResult<u32> {
        let count = self.store.record_login_failure(&user.id).await?;
        if count >= self.max_failed_attempts {
            let until = Utc::now() + self.lockout_duration;
            self.store.set_lock(&user.id, until).await?;
            warn!(
                user_id = %user.id,
                failed_attempts = count,
                "Account locked after repeated failed logins"
            );
            self.audit.record(
                SecurityEvent::new(
                    SecurityEventType::AccountLockout,
                    SecuritySeverity::Warning,
                    "account locked after repeated failed logins",
                )
                .with_user(&user.id)
                .with_email(user.email.as_str())
                .with_detail(json!({
                    "failed_attempts": count,
                    "locked_until": until,
                })),
            );
        }
        Ok(count)
    }

    /// Resets the counter, clears any lock and stamps the login time.
    pub async fn on_successful_attempt(&self, user: &User) -> AuthResult<()> {
        self.store.record_login_success(&user.id, Utc::now()).await
    }
}
