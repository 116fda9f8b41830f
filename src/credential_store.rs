//! Credential storage: users, roles and role assignments.
//!
//! The trait is the seam between the authentication flow and persistence.
//! Two implementations ship: an in-memory store for tests and single-process
//! deployments, and a Postgres store where the failed-attempt counter is a
//! single `UPDATE ... RETURNING` so concurrent failures never under-count.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::RwLock;
use tracing::instrument;

use crate::errors::{AuthError, AuthResult};
use crate::rbac::{Permission, Role, RoleAssignment};
use crate::user::{Email, User, UserId};

#[async_trait]
pub trait CredentialStore: Send + Sync + fmt::Debug {
    async fn find_by_email(&self, email: &Email) -> AuthResult<Option<User>>;
    async fn find_by_id(&self, id: &UserId) -> AuthResult<Option<User>>;
    /// Fails with [`AuthError::EmailExists`] when the address is taken.
    async fn insert_user(&self, user: &User) -> AuthResult<()>;
    async fn set_active(&self, id: &UserId, active: bool) -> AuthResult<()>;
    async fn update_password(&self, id: &UserId, password_hash: &str) -> AuthResult<()>;

    /// Resets the failed-attempt counter, clears any lock and stamps the
    /// login time.
    async fn record_login_success(&self, id: &UserId, at: DateTime<Utc>) -> AuthResult<()>;
    /// Atomically increments the failed-attempt counter and returns the new
    /// count. Must be a single storage-level update, not read-modify-write.
    async fn record_login_failure(&self, id: &UserId) -> AuthResult<u32>;
    async fn set_lock(&self, id: &UserId, until: DateTime<Utc>) -> AuthResult<()>;
    async fn clear_lock(&self, id: &UserId) -> AuthResult<()>;

    /// Roles whose assignment is currently valid at `now`, ordered by name.
    async fn roles_for_user(&self, id: &UserId, now: DateTime<Utc>) -> AuthResult<Vec<Role>>;
    /// All assignments including expired ones; expiry filtering is the
    /// caller's concern.
    async fn assignments_for_user(&self, id: &UserId) -> AuthResult<Vec<RoleAssignment>>;
    async fn permissions_for_role(&self, role_name: &str)
        -> AuthResult<Option<BTreeSet<Permission>>>;
    async fn assign_role(
        &self,
        id: &UserId,
        role_name: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> AuthResult<()>;
    async fn remove_role(&self, id: &UserId, role_name: &str) -> AuthResult<()>;
    async fn find_role(&self, name: &str) -> AuthResult<Option<Role>>;
    async fn list_roles(&self) -> AuthResult<Vec<Role>>;
    async fn upsert_role(&self, role: &Role) -> AuthResult<()>;
    /// Refuses to delete system roles.
    async fn delete_role(&self, name: &str) -> AuthResult<()>;

    async fn health_check(&self) -> AuthResult<()>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Tables {
    users: HashMap<UserId, User>,
    email_index: HashMap<String, UserId>,
    roles: HashMap<String, Role>,
    assignments: HashMap<UserId, Vec<RoleAssignment>>,
}

/// Process-local credential store. All tables live behind one lock so every
/// operation observes a consistent snapshot.
#[derive(Debug, Default)]
pub struct InMemoryCredentialStore {
    inner: RwLock<Tables>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn user_count(&self) -> usize {
        self.inner.read().await.users.len()
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn find_by_email(&self, email: &Email) -> AuthResult<Option<User>> {
        let tables = self.inner.read().await;
        Ok(tables
            .email_index
            .get(email.as_str())
            .and_then(|id| tables.users.get(id))
            .cloned())
    }

    async fn find_by_id(&self, id: &UserId) -> AuthResult<Option<User>> {
        Ok(self.inner.read().await.users.get(id).cloned())
    }

    async fn insert_user(&self, user: &User) -> AuthResult<()> {
        let mut tables = self.inner.write().await;
        if tables.email_index.contains_key(user.email.as_str()) {
            return Err(AuthError::EmailExists);
        }
        tables
            .email_index
            .insert(user.email.as_str().to_string(), user.id);
        tables.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn set_active(&self, id: &UserId, active: bool) -> AuthResult<()> {
        let mut tables = self.inner.write().await;
        let user = tables.users.get_mut(id).ok_or(AuthError::UnknownUser)?;
        user.is_active = active;
        Ok(())
    }

    async fn update_password(&self, id: &UserId, password_hash: &str) -> AuthResult<()> {
        let mut tables = self.inner.write().await;
        let user = tables.users.get_mut(id).ok_or(AuthError::UnknownUser)?;
        user.password_hash = password_hash.to_string();
        Ok(())
    }

    async fn record_login_success(&self, id: &UserId, at: DateTime<Utc>) -> AuthResult<()> {
        let mut tables = self.inner.write().await;
        let user = tables.users.get_mut(id).ok_or(AuthError::UnknownUser)?;
        user.record_success(at);
        Ok(())
    }

    async fn record_login_failure(&self, id: &UserId) -> AuthResult<u32> {
        // Increment happens inside one write-lock section, so concurrent
        // failures serialize and no count is lost.
        let mut tables = self.inner.write().await;
        let user = tables.users.get_mut(id).ok_or(AuthError::UnknownUser)?;
        Ok(user.record_failure())
    }

    async fn set_lock(&self, id: &UserId, until: DateTime<Utc>) -> AuthResult<()> {
        let mut tables = self.inner.write().await;
        let user = tables.users.get_mut(id).ok_or(AuthError::UnknownUser)?;
        user.locked_until = Some(until);
        Ok(())
    }

    async fn clear_lock(&self, id: &UserId) -> AuthResult<()> {
        let mut tables = self.inner.write().await;
        let user = tables.users.get_mut(id).ok_or(AuthError::UnknownUser)?;
        user.locked_until = None;
        Ok(())
    }

    async fn roles_for_user(&self, id: &UserId, now: DateTime<Utc>) -> AuthResult<Vec<Role>> {
        let tables = self.inner.read().await;
        let mut roles: Vec<Role> = tables
            .assignments
            .get(id)
            .map(|list| {
                list.iter()
                    .filter(|a| !a.is_expired(now))
                    .filter_map(|a| tables.roles.get(&a.role_name))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        roles.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(roles)
    }

    async fn assignments_for_user(&self, id: &UserId) -> AuthResult<Vec<RoleAssignment>> {
        Ok(self
            .inner
            .read()
            .await
            .assignments
            .get(id)
            .cloned()
            .unwrap_or_default())
    }

    async fn permissions_for_role(
        &self,
        role_name: &str,
    ) -> AuthResult<Option<BTreeSet<Permission>>> {
        Ok(self
            .inner
            .read()
            .await
            .roles
            .get(role_name)
            .map(|r| r.permissions.clone()))
    }

    async fn assign_role(
        &self,
        id: &UserId,
        role_name: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> AuthResult<()> {
        let mut tables = self.inner.write().await;
        if !tables.users.contains_key(id) {
            return Err(AuthError::UnknownUser);
        }
        if !tables.roles.contains_key(role_name) {
            return Err(AuthError::UnknownRole {
                role: role_name.to_string(),
            });
        }
        let list = tables.assignments.entry(*id).or_default();
        // Re-assigning a held role replaces its expiry.
        list.retain(|a| a.role_name != role_name);
        list.push(RoleAssignment::new(*id, role_name, expires_at));
        Ok(())
    }

    async fn remove_role(&self, id: &UserId, role_name: &str) -> AuthResult<()> {
        let mut tables = self.inner.write().await;
        if let Some(list) = tables.assignments.get_mut(id) {
            list.retain(|a| a.role_name != role_name);
        }
        Ok(())
    }

    async fn find_role(&self, name: &str) -> AuthResult<Option<Role>> {
        Ok(self.inner.read().await.roles.get(name).cloned())
    }

    async fn list_roles(&self) -> AuthResult<Vec<Role>> {
        let tables = self.inner.read().await;
        let mut roles: Vec<Role> = tables.roles.values().cloned().collect();
        roles.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(roles)
    }

    async fn upsert_role(&self, role: &Role) -> AuthResult<()> {
        self.inner
            .write()
            .await
            .roles
            .insert(role.name.clone(), role.clone());
        Ok(())
    }

    async fn delete_role(&self, name: &str) -> AuthResult<()> {
        let mut tables = self.inner.write().await;
        if let Some(role) = tables.roles.get(name) {
            if role.is_system {
                return Err(AuthError::ProtectedRole {
                    role: name.to_string(),
                });
            }
        }
        tables.roles.remove(name);
        for list in tables.assignments.values_mut() {
            list.retain(|a| a.role_name != name);
        }
        Ok(())
    }

    async fn health_check(&self) -> AuthResult<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Postgres implementation
// ---------------------------------------------------------------------------

#[derive(sqlx::FromRow)]
struct UserRow {
    id: uuid::Uuid,
    email: String,
    password_hash: String,
    is_active: bool,
    email_verified: bool,
    failed_attempts: i32,
    locked_until: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    last_login: Option<DateTime<Utc>>,
}

impl UserRow {
    fn into_user(self) -> AuthResult<User> {
        let email = Email::parse(&self.email)
            .map_err(|_| AuthError::internal("stored email fails validation"))?;
        Ok(User {
            id: UserId::from(self.id),
            email,
            password_hash: self.password_hash,
            is_active: self.is_active,
            email_verified: self.email_verified,
            failed_attempts: self.failed_attempts.max(0) as u32,
            locked_until: self.locked_until,
            created_at: self.created_at,
            last_login: self.last_login,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RoleRow {
    name: String,
    display_name: String,
    description: String,
    is_system: bool,
    permissions: String,
}

impl RoleRow {
    fn into_role(self) -> AuthResult<Role> {
        let permissions: BTreeSet<Permission> = serde_json::from_str(&self.permissions)?;
        Ok(Role {
            name: self.name,
            display_name: self.display_name,
            description: self.description,
            is_system: self.is_system,
            permissions,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AssignmentRow {
    user_id: uuid::Uuid,
    role_name: String,
    assigned_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
}

impl From<AssignmentRow> for RoleAssignment {
    fn from(row: AssignmentRow) -> Self {
        RoleAssignment {
            user_id: UserId::from(row.user_id),
            role_name: row.role_name,
            assigned_at: row.assigned_at,
            expires_at: row.expires_at,
        }
    }
}

/// Postgres-backed credential store. Counter updates are single statements
/// so they stay atomic under concurrent failed logins.
#[derive(Debug, Clone)]
pub struct PostgresCredentialStore {
    pool: PgPool,
}

impl PostgresCredentialStore {
    #[instrument(skip_all, fields(url_present = !database_url.is_empty()))]
    pub async fn connect(database_url: &str, max_connections: u32) -> AuthResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| AuthError::StoreUnavailable {
                reason: format!("migrations: {e}"),
            })?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl CredentialStore for PostgresCredentialStore {
    async fn find_by_email(&self, email: &Email) -> AuthResult<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, email, password_hash, is_active, email_verified, failed_attempts, \
             locked_until, created_at, last_login FROM auth_users WHERE email = $1",
        )
        .bind(email.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(UserRow::into_user).transpose()
    }

    async fn find_by_id(&self, id: &UserId) -> AuthResult<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, email, password_hash, is_active, email_verified, failed_attempts, \
             locked_until, created_at, last_login FROM auth_users WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.map(UserRow::into_user).transpose()
    }

    async fn insert_user(&self, user: &User) -> AuthResult<()> {
        let result = sqlx::query(
            "INSERT INTO auth_users \
             (id, email, password_hash, is_active, email_verified, failed_attempts, \
              locked_until, created_at, last_login) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (email) DO NOTHING",
        )
        .bind(user.id.as_uuid())
        .bind(user.email.as_str())
        .bind(&user.password_hash)
        .bind(user.is_active)
        .bind(user.email_verified)
        .bind(user.failed_attempts as i32)
        .bind(user.locked_until)
        .bind(user.created_at)
        .bind(user.last_login)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AuthError::EmailExists);
        }
        Ok(())
    }

    async fn set_active(&self, id: &UserId, active: bool) -> AuthResult<()> {
        let result = sqlx::query("UPDATE auth_users SET is_active = $2 WHERE id = $1")
            .bind(id.as_uuid())
            .bind(active)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AuthError::UnknownUser);
        }
        Ok(())
    }

    async fn update_password(&self, id: &UserId, password_hash: &str) -> AuthResult<()> {
        let result = sqlx::query("UPDATE auth_users SET password_hash = $2 WHERE id = $1")
            .bind(id.as_uuid())
            .bind(password_hash)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AuthError::UnknownUser);
        }
        Ok(())
    }

    async fn record_login_success(&self, id: &UserId, at: DateTime<Utc>) -> AuthResult<()> {
        let result = sqlx::query(
            "UPDATE auth_users SET failed_attempts = 0, locked_until = NULL, last_login = $2 \
             WHERE id = $1",
        )
        .bind(id.as_uuid())
        .bind(at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AuthError::UnknownUser);
        }
        Ok(())
    }

    async fn record_login_failure(&self, id: &UserId) -> AuthResult<u32> {
        // Single statement: the database serializes concurrent increments.
        let count: Option<i32> = sqlx::query_scalar(
            "UPDATE auth_users SET failed_attempts = failed_attempts + 1 \
             WHERE id = $1 RETURNING failed_attempts",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        match count {
            Some(n) => Ok(n.max(0) as u32),
            None => Err(AuthError::UnknownUser),
        }
    }

    async fn set_lock(&self, id: &UserId, until: DateTime<Utc>) -> AuthResult<()> {
        let result = sqlx::query("UPDATE auth_users SET locked_until = $2 WHERE id = $1")
            .bind(id.as_uuid())
            .bind(until)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AuthError::UnknownUser);
        }
        Ok(())
    }

    async fn clear_lock(&self, id: &UserId) -> AuthResult<()> {
        let result = sqlx::query("UPDATE auth_users SET locked_until = NULL WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AuthError::UnknownUser);
        }
        Ok(())
    }

    async fn roles_for_user(&self, id: &UserId, now: DateTime<Utc>) -> AuthResult<Vec<Role>> {
        let rows = sqlx::query_as::<_, RoleRow>(
            "SELECT r.name, r.display_name, r.description, r.is_system, r.permissions \
             FROM auth_roles r \
             JOIN auth_role_assignments a ON a.role_name = r.name \
             WHERE a.user_id = $1 AND (a.expires_at IS NULL OR a.expires_at >= $2) \
             ORDER BY r.name",
        )
        .bind(id.as_uuid())
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(RoleRow::into_role).collect()
    }

    async fn assignments_for_user(&self, id: &UserId) -> AuthResult<Vec<RoleAssignment>> {
        let rows = sqlx::query_as::<_, AssignmentRow>(
            "SELECT user_id, role_name, assigned_at, expires_at \
             FROM auth_role_assignments WHERE user_id = $1 ORDER BY role_name",
        )
        .bind(id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(RoleAssignment::from).collect())
    }

    async fn permissions_for_role(
        &self,
        role_name: &str,
    ) -> AuthResult<Option<BTreeSet<Permission>>> {
        let raw: Option<String> =
            sqlx::query_scalar("SELECT permissions FROM auth_roles WHERE name = $1")
                .bind(role_name)
                .fetch_optional(&self.pool)
                .await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn assign_role(
        &self,
        id: &UserId,
        role_name: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> AuthResult<()> {
        let user_exists: Option<i32> = sqlx::query_scalar("SELECT 1 FROM auth_users WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        if user_exists.is_none() {
            return Err(AuthError::UnknownUser);
        }
        let role_exists: Option<i32> =
            sqlx::query_scalar("SELECT 1 FROM auth_roles WHERE name = $1")
                .bind(role_name)
                .fetch_optional(&self.pool)
                .await?;
        if role_exists.is_none() {
            return Err(AuthError::UnknownRole {
                role: role_name.to_string(),
            });
        }
        sqlx::query(
            "INSERT INTO auth_role_assignments (user_id, role_name, assigned_at, expires_at) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (user_id, role_name) \
             DO UPDATE SET assigned_at = EXCLUDED.assigned_at, expires_at = EXCLUDED.expires_at",
        )
        .bind(id.as_uuid())
        .bind(role_name)
        .bind(Utc::now())
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_role(&self, id: &UserId, role_name: &str) -> AuthResult<()> {
        sqlx::query(
            "DELETE FROM auth_role_assignments WHERE user_id = $1 AND role_name = $2",
        )
        .bind(id.as_uuid())
        .bind(role_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_role(&self, name: &str) -> AuthResult<Option<Role>> {
        let row = sqlx::query_as::<_, RoleRow>(
            "SELECT name, display_name, description, is_system, permissions \
             FROM auth_roles WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(RoleRow::into_role).transpose()
    }

    async fn list_roles(&self) -> AuthResult<Vec<Role>> {
        let rows = sqlx::query_as::<_, RoleRow>(
            "SELECT name, display_name, description, is_system, permissions \
             FROM auth_roles ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(RoleRow::into_role).collect()
    }

    async fn upsert_role(&self, role: &Role) -> AuthResult<()> {
        let permissions = serde_json::to_string(&role.permissions)?;
        sqlx::query(
            "INSERT INTO auth_roles (name, display_name, description, is_system, permissions) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (name) DO UPDATE SET display_name = EXCLUDED.display_name, \
             description = EXCLUDED.description, is_system = EXCLUDED.is_system, \
             permissions = EXCLUDED.permissions",
        )
        .bind(&role.name)
        .bind(&role.display_name)
        .bind(&role.description)
        .bind(role.is_system)
        .bind(permissions)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_role(&self, name: &str) -> AuthResult<()> {
        let is_system: Option<bool> =
            sqlx::query_scalar("SELECT is_system FROM auth_roles WHERE name = $1")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        if is_system == Some(true) {
            return Err(AuthError::ProtectedRole {
                role: name.to_string(),
            });
        }
        sqlx::query("DELETE FROM auth_roles WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn health_check(&self) -> AuthResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rbac::PERM_DATA_READ;
    use std::sync::Arc;

    fn sample_user(email: &str) -> User {
        User::new(Email::parse(email).unwrap(), "phc-hash".into())
    }

    #[tokio::test]
    async fn insert_and_find_by_email() {
        let store = InMemoryCredentialStore::new();
        let user = sample_user("Find.Me@Example.com");
        store.insert_user(&user).await.unwrap();

        let found = store
            .find_by_email(&Email::parse("find.me@example.COM").unwrap())
            .await
            .unwrap()
            .expect("user present");
        assert_eq!(found.id, user.id);
    }

    #[tokio::test]
    async fn duplicate_email_is_rejected() {
        let store = InMemoryCredentialStore::new();
        store.insert_user(&sample_user("dup@x.com")).await.unwrap();
        let err = store
            .insert_user(&sample_user("dup@x.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::EmailExists));
        assert_eq!(store.user_count().await, 1);
    }

    #[tokio::test]
    async fn update_password_replaces_the_stored_hash() {
        let store = InMemoryCredentialStore::new();
        let user = sample_user("rehash@x.com");
        let id = user.id;
        store.insert_user(&user).await.unwrap();

        store.update_password(&id, "new-phc-hash").await.unwrap();
        let user = store.find_by_id(&id).await.unwrap().unwrap();
        assert_eq!(user.password_hash, "new-phc-hash");

        assert!(matches!(
            store.update_password(&UserId::new(), "x").await,
            Err(AuthError::UnknownUser)
        ));
    }

    #[tokio::test]
    async fn concurrent_failures_never_under_count() {
        let store = Arc::new(InMemoryCredentialStore::new());
        let user = sample_user("count@x.com");
        let id = user.id;
        store.insert_user(&user).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(
                async move { store.record_login_failure(&id).await },
            ));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        let user = store.find_by_id(&id).await.unwrap().unwrap();
        assert_eq!(user.failed_attempts, 20);
    }

    #[tokio::test]
    async fn success_resets_counter_and_lock() {
        let store = InMemoryCredentialStore::new();
        let user = sample_user("reset@x.com");
        let id = user.id;
        store.insert_user(&user).await.unwrap();

        store.record_login_failure(&id).await.unwrap();
        store
            .set_lock(&id, Utc::now() + chrono::Duration::minutes(30))
            .await
            .unwrap();
        store.record_login_success(&id, Utc::now()).await.unwrap();

        let user = store.find_by_id(&id).await.unwrap().unwrap();
        assert_eq!(user.failed_attempts, 0);
        assert!(user.locked_until.is_none());
        assert!(user.last_login.is_some());
    }

    #[tokio::test]
    async fn counter_ops_on_unknown_user_fail() {
        let store = InMemoryCredentialStore::new();
        let ghost = UserId::new();
        assert!(matches!(
            store.record_login_failure(&ghost).await,
            Err(AuthError::UnknownUser)
        ));
        assert!(matches!(
            store.record_login_success(&ghost, Utc::now()).await,
            Err(AuthError::UnknownUser)
        ));
    }

    #[tokio::test]
    async fn role_assignment_round_trip() {
        let store = InMemoryCredentialStore::new();
        let user = sample_user("roles@x.com");
        let id = user.id;
        store.insert_user(&user).await.unwrap();
        let role = Role::new("reader", "Reader", "").with_permissions(&[PERM_DATA_READ]);
        store.upsert_role(&role).await.unwrap();

        store.assign_role(&id, "reader", None).await.unwrap();
        let roles = store.roles_for_user(&id, Utc::now()).await.unwrap();
        assert_eq!(roles.len(), 1);
        assert!(roles[0].has_permission(PERM_DATA_READ));

        store.remove_role(&id, "reader").await.unwrap();
        assert!(store.roles_for_user(&id, Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn assigning_unknown_role_or_user_fails() {
        let store = InMemoryCredentialStore::new();
        let user = sample_user("assign@x.com");
        let id = user.id;
        store.insert_user(&user).await.unwrap();

        assert!(matches!(
            store.assign_role(&id, "ghost-role", None).await,
            Err(AuthError::UnknownRole { .. })
        ));
        assert!(matches!(
            store.assign_role(&UserId::new(), "ghost-role", None).await,
            Err(AuthError::UnknownUser)
        ));
    }

    #[tokio::test]
    async fn reassignment_replaces_expiry() {
        let store = InMemoryCredentialStore::new();
        let user = sample_user("expiry@x.com");
        let id = user.id;
        store.insert_user(&user).await.unwrap();
        store
            .upsert_role(&Role::new("temp", "Temp", ""))
            .await
            .unwrap();

        let soon = Utc::now() + chrono::Duration::minutes(5);
        store.assign_role(&id, "temp", Some(soon)).await.unwrap();
        store.assign_role(&id, "temp", None).await.unwrap();

        let assignments = store.assignments_for_user(&id).await.unwrap();
        assert_eq!(assignments.len(), 1);
        assert!(assignments[0].expires_at.is_none());
    }

    #[tokio::test]
    async fn system_roles_cannot_be_deleted() {
        let store = InMemoryCredentialStore::new();
        let role = Role::system("root", "Root", "");
        store.upsert_role(&role).await.unwrap();
        assert!(matches!(
            store.delete_role("root").await,
            Err(AuthError::ProtectedRole { .. })
        ));

        store
            .upsert_role(&Role::new("scratch", "Scratch", ""))
            .await
            .unwrap();
        store.delete_role("scratch").await.unwrap();
        assert!(store.find_role("scratch").await.unwrap().is_none());
    }
}
