//! Configuration for the authentication core.
//!
//! Every value has a safe default and can be overridden independently through
//! `AUTH_*` environment variables. Validation runs once at startup and is
//! fatal; a service with an unsound security configuration must not come up.

use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration as StdDuration;

use chrono::Duration;
use serde::Deserialize;
use thiserror::Error;
use validator::Validate;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {reason}")]
    InvalidValue { name: String, reason: String },
    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

/// Top-level configuration, assembled from defaults and environment overrides.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct AuthConfig {
    #[validate(nested)]
    pub password: PasswordPolicy,
    #[validate(nested)]
    pub argon2: Argon2Config,
    #[validate(nested)]
    pub tokens: TokenConfig,
    #[validate(nested)]
    pub lockout: LockoutConfig,
    #[validate(nested)]
    pub keys: KeyRotationConfig,
    #[validate(nested)]
    pub store: StoreConfig,
}

/// Minimum requirements for user passwords.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct PasswordPolicy {
    #[validate(range(min = 8, max = 128))]
    pub min_length: usize,
    pub require_uppercase: bool,
    pub require_lowercase: bool,
    pub require_digit: bool,
    pub require_special: bool,
}

/// Argon2id cost parameters.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct Argon2Config {
    /// Memory cost in KiB. 19 MiB is the floor recommended for Argon2id.
    #[validate(range(min = 19_456, max = 1_048_576))]
    pub memory_kib: u32,
    #[validate(range(min = 1, max = 10))]
    pub iterations: u32,
    #[validate(range(min = 1, max = 8))]
    pub parallelism: u32,
}

/// Access and refresh token lifetimes and JWT claim values.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct TokenConfig {
    /// Access tokens are short-lived; 15 minutes by default.
    #[validate(range(min = 60, max = 3600))]
    pub access_ttl_secs: u64,
    /// Refresh tokens live long enough to span sessions; 30 days by default.
    #[validate(range(min = 3600, max = 7_776_000))]
    pub refresh_ttl_secs: u64,
    #[validate(length(min = 1))]
    pub issuer: String,
    #[validate(length(min = 1))]
    pub audience: String,
    /// Leeway applied to expiry checks to absorb clock drift between hosts.
    #[validate(range(min = 0, max = 30))]
    pub leeway_secs: u64,
}

/// Failed-login lockout thresholds.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct LockoutConfig {
    #[validate(range(min = 1, max = 100))]
    pub max_failed_attempts: u32,
    #[validate(range(min = 60, max = 86_400))]
    pub lockout_duration_secs: u64,
}

/// Signing-key rotation windows.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct KeyRotationConfig {
    /// How long a retired key remains valid for verification. Must cover the
    /// access-token lifetime so no token outlives its verifying key.
    #[validate(range(min = 300, max = 86_400))]
    pub grace_period_secs: u64,
    /// When set, the maintenance task rotates the active key this often.
    #[validate(range(min = 3600))]
    pub rotation_interval_secs: Option<u64>,
    #[validate(range(min = 10, max = 3600))]
    pub maintenance_interval_secs: u64,
}

/// Backing-store endpoints and I/O bounds.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct StoreConfig {
    /// Redis connection string for refresh-token records. When unset the
    /// in-process store is the primary and nothing is treated as degraded.
    pub redis_url: Option<String>,
    /// Postgres connection string for the credential store. Consumed by the
    /// embedder, which passes it to `PostgresCredentialStore::connect` and
    /// injects the resulting store; when unset the in-memory store is
    /// injected instead.
    pub database_url: Option<String>,
    /// Upper bound on any single external store operation.
    #[validate(range(min = 100, max = 30_000))]
    pub operation_timeout_ms: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            password: PasswordPolicy {
                min_length: 12,
                require_uppercase: true,
                require_lowercase: true,
                require_digit: true,
                require_special: true,
            },
            argon2: Argon2Config {
                memory_kib: 65_536,
                iterations: 3,
                parallelism: 4,
            },
            tokens: TokenConfig {
                access_ttl_secs: 900,
                refresh_ttl_secs: 2_592_000,
                issuer: "auth-core".to_string(),
                audience: "api".to_string(),
                leeway_secs: 5,
            },
            lockout: LockoutConfig {
                max_failed_attempts: 5,
                lockout_duration_secs: 1800,
            },
            keys: KeyRotationConfig {
                grace_period_secs: 3600,
                rotation_interval_secs: None,
                maintenance_interval_secs: 300,
            },
            store: StoreConfig {
                redis_url: None,
                database_url: None,
                operation_timeout_ms: 2000,
            },
        }
    }
}

impl AuthConfig {
    /// Loads configuration from the environment on top of defaults, then
    /// validates it.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            password: PasswordPolicy {
                min_length: env_parse("AUTH_PASSWORD_MIN_LENGTH", defaults.password.min_length)?,
                require_uppercase: env_parse(
                    "AUTH_PASSWORD_REQUIRE_UPPERCASE",
                    defaults.password.require_uppercase,
                )?,
                require_lowercase: env_parse(
                    "AUTH_PASSWORD_REQUIRE_LOWERCASE",
                    defaults.password.require_lowercase,
                )?,
                require_digit: env_parse(
                    "AUTH_PASSWORD_REQUIRE_DIGIT",
                    defaults.password.require_digit,
                )?,
                require_special: env_parse(
                    "AUTH_PASSWORD_REQUIRE_SPECIAL",
                    defaults.password.require_special,
                )?,
            },
            argon2: Argon2Config {
                memory_kib: env_parse("AUTH_ARGON2_MEMORY_KIB", defaults.argon2.memory_kib)?,
                iterations: env_parse("AUTH_ARGON2_ITERATIONS", defaults.argon2.iterations)?,
                parallelism: env_parse("AUTH_ARGON2_PARALLELISM", defaults.argon2.parallelism)?,
            },
            tokens: TokenConfig {
                access_ttl_secs: env_parse(
                    "AUTH_ACCESS_TOKEN_TTL_SECS",
                    defaults.tokens.access_ttl_secs,
                )?,
                refresh_ttl_secs: env_parse(
                    "AUTH_REFRESH_TOKEN_TTL_SECS",
                    defaults.tokens.refresh_ttl_secs,
                )?,
                issuer: env_string("AUTH_JWT_ISSUER", &defaults.tokens.issuer),
                audience: env_string("AUTH_JWT_AUDIENCE", &defaults.tokens.audience),
                leeway_secs: env_parse("AUTH_TOKEN_LEEWAY_SECS", defaults.tokens.leeway_secs)?,
            },
            lockout: LockoutConfig {
                max_failed_attempts: env_parse(
                    "AUTH_MAX_FAILED_ATTEMPTS",
                    defaults.lockout.max_failed_attempts,
                )?,
                lockout_duration_secs: env_parse(
                    "AUTH_LOCKOUT_DURATION_SECS",
                    defaults.lockout.lockout_duration_secs,
                )?,
            },
            keys: KeyRotationConfig {
                grace_period_secs: env_parse(
                    "AUTH_KEY_GRACE_PERIOD_SECS",
                    defaults.keys.grace_period_secs,
                )?,
                rotation_interval_secs: env_parse_opt("AUTH_KEY_ROTATION_INTERVAL_SECS")?,
                maintenance_interval_secs: env_parse(
                    "AUTH_MAINTENANCE_INTERVAL_SECS",
                    defaults.keys.maintenance_interval_secs,
                )?,
            },
            store: StoreConfig {
                redis_url: env::var("AUTH_REDIS_URL").ok().filter(|v| !v.is_empty()),
                database_url: env::var("AUTH_DATABASE_URL").ok().filter(|v| !v.is_empty()),
                operation_timeout_ms: env_parse(
                    "AUTH_STORE_TIMEOUT_MS",
                    defaults.store.operation_timeout_ms,
                )?,
            },
        };
        config.validate_all()?;
        Ok(config)
    }

    /// Field validation plus cross-field rules that a single annotation
    /// cannot express.
    pub fn validate_all(&self) -> Result<(), ConfigError> {
        Validate::validate(self)?;
        if self.keys.grace_period_secs < self.tokens.access_ttl_secs {
            return Err(ConfigError::InvalidValue {
                name: "AUTH_KEY_GRACE_PERIOD_SECS".to_string(),
                reason: format!(
                    "grace period ({}s) must cover the access-token lifetime ({}s)",
                    self.keys.grace_period_secs, self.tokens.access_ttl_secs
                ),
            });
        }
        if self.tokens.refresh_ttl_secs <= self.tokens.access_ttl_secs {
            return Err(ConfigError::InvalidValue {
                name: "AUTH_REFRESH_TOKEN_TTL_SECS".to_string(),
                reason: "refresh lifetime must exceed the access-token lifetime".to_string(),
            });
        }
        Ok(())
    }
}

impl TokenConfig {
    pub fn access_ttl(&self) -> Duration {
        Duration::seconds(self.access_ttl_secs as i64)
    }

    pub fn refresh_ttl(&self) -> Duration {
        Duration::seconds(self.refresh_ttl_secs as i64)
    }
}

impl LockoutConfig {
    pub fn lockout_duration(&self) -> Duration {
        Duration::seconds(self.lockout_duration_secs as i64)
    }
}

impl KeyRotationConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::seconds(self.grace_period_secs as i64)
    }
}

impl StoreConfig {
    pub fn operation_timeout(&self) -> StdDuration {
        StdDuration::from_millis(self.operation_timeout_ms)
    }
}

fn env_string(name: &str, default: &str) -> String {
    env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_parse<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(name) {
        Ok(raw) if !raw.is_empty() => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            name: name.to_string(),
            reason: e.to_string(),
        }),
        _ => Ok(default),
    }
}

fn env_parse_opt<T>(name: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(name) {
        Ok(raw) if !raw.is_empty() => raw
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                name: name.to_string(),
                reason: e.to_string(),
            }),
        _ => Ok(None),
    }
}
