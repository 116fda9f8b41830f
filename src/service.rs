//! The authentication service: login, token refresh, logout, identity and
//! role administration, composed from the injected stores and policies.
//!
//! Outward error discipline: handlers should send
//! [`AuthError::client_message`] to clients, never the `Display` form. The
//! precise reason for a credential failure is recorded in the audit trail
//! only, so responses cannot be used to probe which accounts exist.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::audit::{AuditLogger, SecurityEvent, SecurityEventType, SecuritySeverity};
use crate::config::AuthConfig;
use crate::credential_store::CredentialStore;
use crate::crypto::CryptoService;
use crate::errors::{AuthError, AuthResult};
use crate::key_manager::KeyManager;
use crate::lockout::LockoutPolicy;
use crate::rbac::{
    RbacEngine, Role, PERM_ROLES_ASSIGN, PERM_ROLES_READ, PERM_USERS_WRITE, ROLE_USER,
};
use crate::refresh_store::RefreshTokenStore;
use crate::token_service::{AccessTokenClaims, TokenService};
use crate::user::{Email, User, UserId};

#[derive(Clone, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
}

impl fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginRequest")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .field("client_ip", &self.client_ip)
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

#[derive(Clone, Deserialize)]
pub struct CreateUserRequest {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl fmt::Debug for CreateUserRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CreateUserRequest")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .field("roles", &self.roles)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssignRoleRequest {
    pub user_id: UserId,
    pub role_name: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Access and refresh token pair returned by login and refresh.
#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: &'static str,
    pub expires_in: u64,
}

/// Identity view assembled from a verified access token.
#[derive(Debug, Clone, Serialize)]
pub struct MeResponse {
    pub user_id: UserId,
    pub email: String,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
}

/// Client metadata accompanying a request, attached to audit events.
#[derive(Clone, Copy)]
struct ClientMeta<'a> {
    ip: Option<&'a str>,
    user_agent: Option<&'a str>,
}

impl ClientMeta<'_> {
    fn apply(&self, mut event: SecurityEvent) -> SecurityEvent {
        if let Some(ip) = self.ip {
            event = event.with_client_ip(ip);
        }
        if let Some(ua) = self.user_agent {
            event = event.with_user_agent(ua);
        }
        event
    }
}

/// Facade over the authentication core. Construct once, share via `Arc`.
#[derive(Debug)]
pub struct AuthService {
    config: AuthConfig,
    credentials: Arc<dyn CredentialStore>,
    crypto: Arc<CryptoService>,
    keys: Arc<KeyManager>,
    tokens: Arc<TokenService>,
    refresh: Arc<RefreshTokenStore>,
    rbac: Arc<RbacEngine>,
    lockout: LockoutPolicy,
    audit: AuditLogger,
}

impl AuthService {
    /// Builds the service from validated configuration and a credential
    /// store. Configuration or key-generation failure is fatal; an
    /// unreachable refresh-token primary is not, the store starts degraded
    /// instead.
    pub async fn new(
        config: AuthConfig,
        credentials: Arc<dyn CredentialStore>,
    ) -> AuthResult<Self> {
        config.validate_all()?;
        credentials.health_check().await?;

        let audit = AuditLogger::new();
        let crypto = Arc::new(CryptoService::new(&config.argon2, config.password.clone())?);
        let keys = Arc::new(KeyManager::new(&config.keys)?);
        let tokens = Arc::new(TokenService::new(keys.clone(), &config.tokens));
        let refresh = Arc::new(
            RefreshTokenStore::connect(&config.store, config.tokens.refresh_ttl(), audit.clone())
                .await,
        );
        let rbac = Arc::new(RbacEngine::new(credentials.clone()));
        rbac.ensure_default_roles().await?;
        let lockout = LockoutPolicy::new(&config.lockout, credentials.clone(), audit.clone());

        info!(
            issuer = %config.tokens.issuer,
            degraded = refresh.is_degraded(),
            "Authentication service initialized"
        );
        Ok(Self {
            config,
            credentials,
            crypto,
            keys,
            tokens,
            refresh,
            rbac,
            lockout,
            audit,
        })
    }

    // -- Authentication -----------------------------------------------------

    /// Verifies credentials and issues a token pair.
    ///
    /// Malformed email, unknown account, deactivated account and wrong
    /// password all surface as [`AuthError::InvalidCredentials`]; a locked
    /// account as [`AuthError::AccountLocked`]. Both collapse to the same
    /// client message.
    #[instrument(skip_all)]
    pub async fn login(&self, request: &LoginRequest) -> AuthResult<TokenPair> {
        let client = ClientMeta {
            ip: request.client_ip.as_deref(),
            user_agent: request.user_agent.as_deref(),
        };

        let email = match Email::parse(&request.email) {
            Ok(email) => email,
            Err(_) => {
                self.audit_auth_failure(None, &request.email, client, "malformed email");
                return Err(AuthError::InvalidCredentials);
            }
        };

        let Some(user) = self.credentials.find_by_email(&email).await? else {
            self.audit_auth_failure(None, email.as_str(), client, "unknown account");
            return Err(AuthError::InvalidCredentials);
        };

        // Lock check precedes verification: a locked account costs no
        // hashing work and its counter stops moving.
        if self.lockout.is_locked(&user) {
            self.audit_auth_failure(Some(&user.id), email.as_str(), client, "account locked");
            return Err(AuthError::AccountLocked {
                until: user.locked_until.unwrap_or_else(Utc::now),
            });
        }

        if !user.is_active {
            self.audit_auth_failure(
                Some(&user.id),
                email.as_str(),
                client,
                "account deactivated",
            );
            return Err(AuthError::InvalidCredentials);
        }

        if !self
            .crypto
            .verify_password(&request.password, &user.password_hash)?
        {
            let failed_attempts = self.lockout.on_failed_attempt(&user).await?;
            let event = client.apply(
                SecurityEvent::new(
                    SecurityEventType::AuthFailure,
                    SecuritySeverity::Warning,
                    "invalid password",
                )
                .with_user(&user.id)
                .with_email(email.as_str())
                .with_detail(json!({ "failed_attempts": failed_attempts })),
            );
            self.audit.record(event);
            return Err(AuthError::InvalidCredentials);
        }

        self.lockout.on_successful_attempt(&user).await?;
        let pair = self.issue_pair(&user).await?;

        let success = client.apply(
            SecurityEvent::new(
                SecurityEventType::AuthSuccess,
                SecuritySeverity::Info,
                "login succeeded",
            )
            .with_user(&user.id)
            .with_email(email.as_str()),
        );
        self.audit.record(success);

        Ok(pair)
    }

    /// Rotates the presented refresh token and issues a fresh access token
    /// with a current role snapshot. Replay of an already-rotated token
    /// surfaces as [`AuthError::ReuseDetected`] and revokes the whole chain.
    #[instrument(skip_all)]
    pub async fn refresh(&self, refresh_token: &str) -> AuthResult<TokenPair> {
        let (new_refresh, record) = self.refresh.rotate(refresh_token).await?;

        let Some(user) = self.credentials.find_by_id(&record.user_id).await? else {
            self.refresh.revoke_chain_of(&new_refresh).await?;
            return Err(AuthError::InvalidToken {
                reason: "subject no longer exists".to_string(),
            });
        };
        if !user.is_active {
            self.refresh.revoke_chain_of(&new_refresh).await?;
            return Err(AuthError::InvalidToken {
                reason: "subject deactivated".to_string(),
            });
        }

        // A login lockout does not cut short sessions that already hold a
        // valid refresh token; it only guards password guessing.
        let (roles, perms) = self.snapshot_for(&user).await?;
        let access_token = self.tokens.issue_access_token(&user, roles, perms).await?;

        self.audit.record(
            SecurityEvent::new(
                SecurityEventType::TokenRefreshed,
                SecuritySeverity::Info,
                "refresh token rotated",
            )
            .with_user(&user.id),
        );

        Ok(TokenPair {
            access_token,
            refresh_token: new_refresh,
            token_type: "Bearer",
            expires_in: self.tokens.expires_in(),
        })
    }

    /// Revokes the presented refresh token. Idempotent: unknown or
    /// already-revoked tokens succeed silently, so a stale client can always
    /// log out.
    pub async fn logout(&self, refresh_token: &str) -> AuthResult<()> {
        let record = self.refresh.lookup(refresh_token).await?;
        let transitioned = self.refresh.revoke(refresh_token).await?;
        if transitioned {
            if let Some(record) = record {
                self.audit.record(
                    SecurityEvent::new(
                        SecurityEventType::TokenRevoked,
                        SecuritySeverity::Info,
                        "refresh token revoked on logout",
                    )
                    .with_user(&record.user_id),
                );
            }
        }
        Ok(())
    }

    /// Revokes every refresh chain the user owns. Returns how many records
    /// were revoked.
    pub async fn logout_all(&self, user_id: &UserId) -> AuthResult<u64> {
        let revoked = self.refresh.revoke_all_for_user(user_id).await?;
        self.audit.record(
            SecurityEvent::new(
                SecurityEventType::TokenRevoked,
                SecuritySeverity::Info,
                "all sessions revoked",
            )
            .with_user(user_id)
            .with_detail(json!({ "revoked_tokens": revoked })),
        );
        Ok(revoked)
    }

    // -- Identity and authorization -----------------------------------------

    /// Verifies a bearer token and returns its claims.
    pub async fn verify_bearer(&self, token: &str) -> AuthResult<AccessTokenClaims> {
        self.tokens.verify_access_token(token).await
    }

    /// Identity view from a verified access token. Pure snapshot; no store
    /// reads.
    pub async fn me(&self, token: &str) -> AuthResult<MeResponse> {
        let claims = self.tokens.verify_access_token(token).await?;
        let user_id = claims.user_id()?;
        Ok(MeResponse {
            user_id,
            email: claims.email,
            roles: claims.roles,
            permissions: claims.perms,
        })
    }

    /// Verifies the token and requires a permission from its embedded
    /// snapshot (fast path).
    pub async fn require_permission(
        &self,
        token: &str,
        permission: &str,
    ) -> AuthResult<AccessTokenClaims> {
        let claims = self.tokens.verify_access_token(token).await?;
        if !RbacEngine::check_snapshot(&claims, permission) {
            self.audit_permission_denied(&claims, permission);
            return Err(AuthError::InsufficientPermission {
                permission: permission.to_string(),
            });
        }
        Ok(claims)
    }

    // -- Role administration ------------------------------------------------

    /// Grants a role to a user. The actor needs `roles:assign`, checked on
    /// the slow path so a revoked grant takes effect before the actor's
    /// access token expires.
    #[instrument(skip_all, fields(role = %request.role_name))]
    pub async fn assign_role(
        &self,
        actor_token: &str,
        request: &AssignRoleRequest,
    ) -> AuthResult<()> {
        let actor = self.authorize_slow(actor_token, PERM_ROLES_ASSIGN).await?;
        self.credentials
            .assign_role(&request.user_id, &request.role_name, request.expires_at)
            .await?;
        self.audit.record(
            SecurityEvent::new(
                SecurityEventType::RoleAssigned,
                SecuritySeverity::Info,
                "role assigned",
            )
            .with_user(&request.user_id)
            .with_detail(json!({
                "role": request.role_name,
                "actor": actor.sub,
                "expires_at": request.expires_at,
            })),
        );
        Ok(())
    }

    /// Removes a role from a user. Same authorization as assignment.
    #[instrument(skip_all, fields(role = %role_name))]
    pub async fn remove_role(
        &self,
        actor_token: &str,
        user_id: &UserId,
        role_name: &str,
    ) -> AuthResult<()> {
        let actor = self.authorize_slow(actor_token, PERM_ROLES_ASSIGN).await?;
        self.credentials.remove_role(user_id, role_name).await?;
        self.audit.record(
            SecurityEvent::new(
                SecurityEventType::RoleRemoved,
                SecuritySeverity::Info,
                "role removed",
            )
            .with_user(user_id)
            .with_detail(json!({ "role": role_name, "actor": actor.sub })),
        );
        Ok(())
    }

    /// All defined roles. Requires `roles:read` from the token snapshot.
    pub async fn list_roles(&self, actor_token: &str) -> AuthResult<Vec<Role>> {
        self.require_permission(actor_token, PERM_ROLES_READ)
            .await?;
        self.credentials.list_roles().await
    }

    /// One role by name. Requires `roles:read` from the token snapshot.
    pub async fn role_details(&self, actor_token: &str, name: &str) -> AuthResult<Role> {
        self.require_permission(actor_token, PERM_ROLES_READ)
            .await?;
        self.credentials
            .find_role(name)
            .await?
            .ok_or_else(|| AuthError::UnknownRole {
                role: name.to_string(),
            })
    }

    // -- Account management -------------------------------------------------

    /// Registers a user: policy-checks the password, hashes it and assigns
    /// the requested roles (the standard role when none are named). Unknown
    /// requested roles are rejected before the account row exists. The
    /// embedding application decides who may call this.
    #[instrument(skip_all)]
    pub async fn create_user(&self, request: &CreateUserRequest) -> AuthResult<User> {
        let email = Email::parse(&request.email)?;
        self.crypto.validate_password_strength(&request.password)?;
        let password_hash = self.crypto.hash_password(&request.password)?;

        let roles: Vec<String> = if request.roles.is_empty() {
            vec![ROLE_USER.to_string()]
        } else {
            request.roles.clone()
        };
        for role in &roles {
            if self.credentials.find_role(role).await?.is_none() {
                return Err(AuthError::UnknownRole { role: role.clone() });
            }
        }

        let user = User::new(email, password_hash);
        self.credentials.insert_user(&user).await?;
        for role in &roles {
            self.credentials.assign_role(&user.id, role, None).await?;
        }

        self.audit.record(
            SecurityEvent::new(
                SecurityEventType::UserCreated,
                SecuritySeverity::Info,
                "user created",
            )
            .with_user(&user.id)
            .with_email(user.email.as_str())
            .with_detail(json!({ "roles": roles })),
        );
        Ok(user)
    }

    /// Deactivates an account and revokes all of its refresh chains.
    /// Outstanding access tokens ride out their short expiry.
    pub async fn deactivate_user(&self, actor_token: &str, user_id: &UserId) -> AuthResult<()> {
        self.authorize_slow(actor_token, PERM_USERS_WRITE).await?;
        self.credentials.set_active(user_id, false).await?;
        let revoked = self.refresh.revoke_all_for_user(user_id).await?;
        self.audit.record(
            SecurityEvent::new(
                SecurityEventType::UserDeactivated,
                SecuritySeverity::Warning,
                "account deactivated; sessions revoked",
            )
            .with_user(user_id)
            .with_detail(json!({ "revoked_tokens": revoked })),
        );
        Ok(())
    }

    // -- Operations ---------------------------------------------------------

    /// Rotates the signing key immediately. Exposed for operational use; the
    /// maintenance task calls it on the configured interval.
    pub async fn rotate_signing_key(&self) -> AuthResult<String> {
        let new_kid = self.keys.rotate().await?;
        self.audit.record(
            SecurityEvent::new(
                SecurityEventType::KeyRotation,
                SecuritySeverity::Info,
                "signing key rotated",
            )
            .with_detail(json!({ "new_kid": new_kid })),
        );
        Ok(new_kid)
    }

    /// Background maintenance: expiry sweeps, retired-key purges and
    /// interval-based key rotation. Runs until the handle is aborted.
    pub fn spawn_maintenance(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let service = Arc::clone(self);
        let period =
            std::time::Duration::from_secs(service.config.keys.maintenance_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                service.run_maintenance().await;
            }
        })
    }

    async fn run_maintenance(&self) {
        let swept = self.refresh.sweep_expired().await;
        if swept > 0 {
            debug!(swept, "Swept expired refresh-token records");
        }

        if let Err(err) = self.keys.purge_expired().await {
            warn!(error = %err, "Retired-key purge failed");
        }

        if let Some(interval_secs) = self.config.keys.rotation_interval_secs {
            let due = match self.keys.active_key().await {
                Ok(active) => {
                    Utc::now() - active.created_at
                        >= chrono::Duration::seconds(interval_secs as i64)
                }
                Err(err) => {
                    warn!(error = %err, "Active key lookup failed during maintenance");
                    false
                }
            };
            if due {
                if let Err(err) = self.rotate_signing_key().await {
                    warn!(error = %err, "Scheduled key rotation failed");
                }
            }
        }
    }

    /// Readiness probe over the credential backend and whichever
    /// refresh-token store is currently active.
    pub async fn health_check(&self) -> AuthResult<()> {
        self.credentials.health_check().await?;
        self.refresh.health_check().await
    }

    /// Audit trail handle, for operators and tests.
    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    /// Whether the refresh-token store has degraded to its in-process
    /// fallback.
    pub fn is_degraded(&self) -> bool {
        self.refresh.is_degraded()
    }

    // -- Internals ----------------------------------------------------------

    async fn issue_pair(&self, user: &User) -> AuthResult<TokenPair> {
        let (roles, perms) = self.snapshot_for(user).await?;
        let access_token = self.tokens.issue_access_token(user, roles, perms).await?;
        let (refresh_token, _record) = self.refresh.issue(&user.id).await?;
        self.audit.record(
            SecurityEvent::new(
                SecurityEventType::TokenIssued,
                SecuritySeverity::Info,
                "token pair issued",
            )
            .with_user(&user.id),
        );
        Ok(TokenPair {
            access_token,
            refresh_token,
            token_type: "Bearer",
            expires_in: self.tokens.expires_in(),
        })
    }

    /// Role and permission snapshot for embedding into an access token.
    async fn snapshot_for(&self, user: &User) -> AuthResult<(Vec<String>, Vec<String>)> {
        let roles = self.credentials.roles_for_user(&user.id, Utc::now()).await?;
        let role_names = roles.iter().map(|r| r.name.clone()).collect();
        let perms: BTreeSet<String> = roles
            .iter()
            .flat_map(|r| r.permissions.iter().map(|p| p.as_str().to_string()))
            .collect();
        Ok((role_names, perms.into_iter().collect()))
    }

    /// Verifies the actor token and checks the permission on the slow path,
    /// so role revocations bind immediately.
    async fn authorize_slow(
        &self,
        actor_token: &str,
        permission: &str,
    ) -> AuthResult<AccessTokenClaims> {
        let claims = self.tokens.verify_access_token(actor_token).await?;
        let actor_id = claims.user_id()?;
        if !self.rbac.check_permission(&actor_id, permission).await? {
            self.audit_permission_denied(&claims, permission);
            return Err(AuthError::InsufficientPermission {
                permission: permission.to_string(),
            });
        }
        Ok(claims)
    }

    fn audit_auth_failure(
        &self,
        user_id: Option<&UserId>,
        email: &str,
        client: ClientMeta<'_>,
        reason: &str,
    ) {
        let mut event = SecurityEvent::new(
            SecurityEventType::AuthFailure,
            SecuritySeverity::Warning,
            reason,
        )
        .with_email(email);
        if let Some(id) = user_id {
            event = event.with_user(id);
        }
        self.audit.record(client.apply(event));
    }

    fn audit_permission_denied(&self, claims: &AccessTokenClaims, permission: &str) {
        let mut event = SecurityEvent::new(
            SecurityEventType::PermissionDenied,
            SecuritySeverity::Warning,
            "permission denied",
        )
        .with_detail(json!({ "permission": permission }));
        if let Ok(id) = claims.user_id() {
            event = event.with_user(&id);
        }
        self.audit.record(event);
    }
}
