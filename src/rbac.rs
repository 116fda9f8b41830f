//! Role-based access control: role and permission types plus the resolution
//! engine.
//!
//! The model is additive only. A user's effective permissions are the union
//! of the permission sets of every currently-valid role assignment; there are
//! no deny rules. Two resolution modes exist: a fast path over the snapshot
//! embedded in an access token (no I/O), and a slow path that re-reads the
//! store so changes are visible immediately.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::credential_store::CredentialStore;
use crate::errors::AuthResult;
use crate::token_service::AccessTokenClaims;
use crate::user::UserId;

pub const ROLE_ADMIN: &str = "admin";
pub const ROLE_USER: &str = "user";

pub const PERM_ROLES_READ: &str = "roles:read";
pub const PERM_ROLES_ASSIGN: &str = "roles:assign";
pub const PERM_USERS_READ: &str = "users:read";
pub const PERM_USERS_WRITE: &str = "users:write";
pub const PERM_DATA_READ: &str = "data:read";
pub const PERM_DATA_WRITE: &str = "data:write";
pub const PERM_AUDIT_READ: &str = "audit:read";

/// String permission identifier such as `"data:write"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permission(String);

impl Permission {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Permission {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A named bundle of permissions. System roles cannot be deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub is_system: bool,
    pub permissions: BTreeSet<Permission>,
}

impl Role {
    pub fn new(name: &str, display_name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            display_name: display_name.to_string(),
            description: description.to_string(),
            is_system: false,
            permissions: BTreeSet::new(),
        }
    }

    pub fn system(name: &str, display_name: &str, description: &str) -> Self {
        Self {
            is_system: true,
            ..Self::new(name, display_name, description)
        }
    }

    pub fn with_permissions(mut self, permissions: &[&str]) -> Self {
        self.permissions = permissions.iter().map(|p| Permission::from(*p)).collect();
        self
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.contains(&Permission::from(permission))
    }
}

/// A user-to-role grant, optionally expiring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleAssignment {
    pub user_id: UserId,
    pub role_name: String,
    pub assigned_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl RoleAssignment {
    pub fn new(user_id: UserId, role_name: &str, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            user_id,
            role_name: role_name.to_string(),
            assigned_at: Utc::now(),
            expires_at,
        }
    }

    /// Expired assignments drop out of resolution; `expires_at` strictly in
    /// the past counts as expired.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |at| at < now)
    }
}

/// Permission resolution over the credential store, with a per-role cache.
#[derive(Debug)]
pub struct RbacEngine {
    store: Arc<dyn CredentialStore>,
    role_cache: DashMap<String, BTreeSet<Permission>>,
}

impl RbacEngine {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self {
            store,
            role_cache: DashMap::new(),
        }
    }

    /// Installs the built-in system roles when the role table is empty.
    pub async fn ensure_default_roles(&self) -> AuthResult<()> {
        if !self.store.list_roles().await?.is_empty() {
            return Ok(());
        }
        for role in Self::default_roles() {
            self.store.upsert_role(&role).await?;
        }
        info!("Seeded default system roles");
        Ok(())
    }

    fn default_roles() -> Vec<Role> {
        vec![
            Role::system(ROLE_ADMIN, "Administrator", "Full administrative access")
                .with_permissions(&[
                    PERM_ROLES_READ,
                    PERM_ROLES_ASSIGN,
                    PERM_USERS_READ,
                    PERM_USERS_WRITE,
                    PERM_DATA_READ,
                    PERM_DATA_WRITE,
                    PERM_AUDIT_READ,
                ]),
            Role::system(ROLE_USER, "User", "Standard account")
                .with_permissions(&[PERM_DATA_READ, PERM_DATA_WRITE]),
        ]
    }

    /// Fast path: checks the permission snapshot embedded in verified claims.
    /// Reflects the state at token issuance, not later role changes.
    pub fn check_snapshot(claims: &AccessTokenClaims, permission: &str) -> bool {
        claims.perms.iter().any(|p| p == permission)
    }

    /// Slow path: re-resolves through the store so role and assignment
    /// changes are visible immediately.
    pub async fn check_permission(&self, user_id: &UserId, permission: &str) -> AuthResult<bool> {
        Ok(self
            .effective_permissions(user_id)
            .await?
            .contains(&Permission::from(permission)))
    }

    /// Union of permission sets over all currently-valid role assignments.
    pub async fn effective_permissions(
        &self,
        user_id: &UserId,
    ) -> AuthResult<BTreeSet<Permission>> {
        let now = Utc::now();
        let assignments = self.store.assignments_for_user(user_id).await?;
        let mut effective = BTreeSet::new();
        for assignment in assignments {
            if assignment.is_expired(now) {
                continue;
            }
            effective.extend(self.permissions_for_role(&assignment.role_name).await?);
        }
        Ok(effective)
    }

    /// Currently-valid roles for a user, ordered by name.
    pub async fn roles_for_user(&self, user_id: &UserId) -> AuthResult<Vec<Role>> {
        self.store.roles_for_user(user_id, Utc::now()).await
    }

    /// Permission set of one role, cached until invalidated. An unknown role
    /// resolves to the empty set so dangling assignments grant nothing.
    pub async fn permissions_for_role(&self, role_name: &str) -> AuthResult<BTreeSet<Permission>> {
        if let Some(cached) = self.role_cache.get(role_name) {
            return Ok(cached.clone());
        }
        let permissions = self
            .store
            .permissions_for_role(role_name)
            .await?
            .unwrap_or_default();
        self.role_cache
            .insert(role_name.to_string(), permissions.clone());
        Ok(permissions)
    }

    /// Drops the cached permission set after a role mutation.
    pub fn invalidate_role(&self, role_name: &str) {
        self.role_cache.remove(role_name);
    }

    pub fn invalidate_all(&self) {
        self.role_cache.clear();
    }
}
