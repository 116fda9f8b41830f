//! Authentication core: credential verification, token lifecycle and
//! role-based authorization.
//!
//! The crate is a library, not a server. It owns password hashing with
//! Argon2id, EdDSA-signed access tokens under rotating keys, single-use
//! rotating refresh tokens with replay detection, additive role-based
//! permissions and failed-login lockout. Transport belongs to the embedding
//! application: construct an [`AuthService`] from a credential store and an
//! [`AuthConfig`], share it via `Arc`, and call its operations from your
//! handlers, sending clients [`AuthError::client_message`] rather than the
//! internal error.

pub mod audit;
pub mod config;
pub mod credential_store;
pub mod crypto;
pub mod errors;
pub mod key_manager;
pub mod lockout;
pub mod rbac;
pub mod refresh_store;
pub mod service;
pub mod token_service;
pub mod user;

pub use audit::{AuditLogger, SecurityEvent, SecurityEventType, SecuritySeverity};
pub use config::{AuthConfig, ConfigError};
pub use credential_store::{CredentialStore, InMemoryCredentialStore, PostgresCredentialStore};
pub use crypto::CryptoService;
pub use errors::{AuthError, AuthResult};
pub use key_manager::{KeyManager, KeyState};
pub use lockout::LockoutPolicy;
pub use rbac::{Permission, RbacEngine, Role, RoleAssignment};
pub use refresh_store::{
    InMemoryTokenStore, RedisTokenStore, RefreshTokenRecord, RefreshTokenStore, RotateOutcome,
    TokenRecordStore,
};
pub use service::{
    AssignRoleRequest, AuthService, CreateUserRequest, LoginRequest, MeResponse, TokenPair,
};
pub use token_service::{AccessTokenClaims, TokenService};
pub use user::{Email, User, UserId};
