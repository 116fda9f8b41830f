//! Access-token issuance and verification.
//!
//! Tokens are EdDSA-signed JWTs carrying a role and permission snapshot taken
//! at issuance. The signing key is addressed by the `kid` header, which lets
//! verification keep working across key rotation for as long as the retired
//! key's grace window lasts.

use std::sync::Arc;

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, decode_header, encode, Algorithm, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::instrument;
use uuid::Uuid;

use crate::config::TokenConfig;
use crate::errors::{AuthError, AuthResult};
use crate::key_manager::KeyManager;
use crate::user::{User, UserId};

/// Claims embedded in every access token. Roles and permissions are the
/// snapshot at issuance; authorization decisions that must see later changes
/// go through the slow path instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    pub sub: String,
    pub email: String,
    pub roles: Vec<String>,
    pub perms: Vec<String>,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
    pub aud: String,
    pub jti: String,
}

impl AccessTokenClaims {
    pub fn user_id(&self) -> AuthResult<UserId> {
        self.sub.parse().map_err(|_| AuthError::InvalidToken {
            reason: "malformed subject".to_string(),
        })
    }
}

#[cfg(test)]
impl AccessTokenClaims {
    pub(crate) fn sample(perms: &[&str]) -> Self {
        let now = Utc::now();
        Self {
            sub: Uuid::new_v4().to_string(),
            email: "user@example.com".to_string(),
            roles: vec!["user".to_string()],
            perms: perms.iter().map(|p| p.to_string()).collect(),
            iat: now.timestamp(),
            exp: (now + Duration::seconds(900)).timestamp(),
            iss: "auth-core".to_string(),
            aud: "api".to_string(),
            jti: Uuid::new_v4().to_string(),
        }
    }
}

/// Stateless issue/verify layer over the injected [`KeyManager`].
#[derive(Debug)]
pub struct TokenService {
    keys: Arc<KeyManager>,
    issuer: String,
    audience: String,
    access_ttl: Duration,
    leeway_secs: u64,
}

impl TokenService {
    pub fn new(keys: Arc<KeyManager>, config: &TokenConfig) -> Self {
        Self {
            keys,
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
            access_ttl: config.access_ttl(),
            leeway_secs: config.leeway_secs,
        }
    }

    /// Signs an access token for the user with the currently active key.
    #[instrument(skip_all, fields(user_id = %user.id))]
    pub async fn issue_access_token(
        &self,
        user: &User,
        roles: Vec<String>,
        perms: Vec<String>,
    ) -> AuthResult<String> {
        let now = Utc::now();
        let claims = AccessTokenClaims {
            sub: user.id.to_string(),
            email: user.email.to_string(),
            roles,
            perms,
            iat: now.timestamp(),
            exp: (now + self.access_ttl).timestamp(),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            jti: Uuid::new_v4().to_string(),
        };
        let (kid, encoder) = self.keys.current_signer().await?;
        let mut header = Header::new(Algorithm::EdDSA);
        header.kid = Some(kid);
        Ok(encode(&header, &claims, &encoder)?)
    }

    /// Verifies signature, issuer, audience and expiry, resolving the signing
    /// key from the token's `kid` header.
    #[instrument(skip_all)]
    pub async fn verify_access_token(&self, token: &str) -> AuthResult<AccessTokenClaims> {
        let header = decode_header(token)?;
        let kid = header.kid.ok_or_else(|| AuthError::InvalidToken {
            reason: "missing key id".to_string(),
        })?;
        let decoder = self.keys.decoder_for(&kid).await?;

        let mut validation = Validation::new(Algorithm::EdDSA);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);
        validation.leeway = self.leeway_secs;

        let data = decode::<AccessTokenClaims>(token, &decoder, &validation)?;
        Ok(data.claims)
    }

    /// Seconds until a freshly issued access token expires.
    pub fn expires_in(&self) -> u64 {
        self.access_ttl.num_seconds().max(0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KeyRotationConfig;
    use crate::user::Email;

    fn token_config() -> TokenConfig {
        TokenConfig {
            access_ttl_secs: 900,
            refresh_ttl_secs: 86_400,
            issuer: "auth-core".to_string(),
            audience: "api".to_string(),
            leeway_secs: 0,
        }
    }

    fn key_manager() -> Arc<KeyManager> {
        let config = KeyRotationConfig {
            grace_period_secs: 3600,
            rotation_interval_secs: None,
            maintenance_interval_secs: 300,
        };
        Arc::new(KeyManager::new(&config).unwrap())
    }

    fn test_user() -> User {
        User::new(
            Email::parse("claims@example.com").unwrap(),
            "$argon2id$stub".to_string(),
        )
    }

    #[tokio::test]
    async fn issued_token_verifies_and_carries_snapshot() {
        let service = TokenService::new(key_manager(), &token_config());
        let user = test_user();

        let token = service
            .issue_access_token(
                &user,
                vec!["user".to_string()],
                vec!["data:read".to_string()],
            )
            .await
            .unwrap();
        let claims = service.verify_access_token(&token).await.unwrap();

        assert_eq!(claims.user_id().unwrap(), user.id);
        assert_eq!(claims.email, "claims@example.com");
        assert_eq!(claims.roles, vec!["user"]);
        assert_eq!(claims.perms, vec!["data:read"]);
        assert_eq!(claims.iss, "auth-core");
        assert_eq!(claims.aud, "api");
        assert!(claims.exp > claims.iat);
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let keys = key_manager();
        let service = TokenService::new(keys.clone(), &token_config());

        let now = Utc::now();
        let claims = AccessTokenClaims {
            sub: Uuid::new_v4().to_string(),
            email: "old@example.com".to_string(),
            roles: vec![],
            perms: vec![],
            iat: (now - Duration::seconds(120)).timestamp(),
            exp: (now - Duration::seconds(60)).timestamp(),
            iss: "auth-core".to_string(),
            aud: "api".to_string(),
            jti: Uuid::new_v4().to_string(),
        };
        let (kid, encoder) = keys.current_signer().await.unwrap();
        let mut header = Header::new(Algorithm::EdDSA);
        header.kid = Some(kid);
        let token = encode(&header, &claims, &encoder).unwrap();

        assert!(matches!(
            service.verify_access_token(&token).await,
            Err(AuthError::TokenExpired)
        ));
    }

    #[tokio::test]
    async fn audience_mismatch_is_rejected() {
        let keys = key_manager();
        let issuing = TokenService::new(keys.clone(), &token_config());
        let mut other_config = token_config();
        other_config.audience = "other-api".to_string();
        let verifying = TokenService::new(keys, &other_config);

        let token = issuing
            .issue_access_token(&test_user(), vec![], vec![])
            .await
            .unwrap();

        assert!(matches!(
            verifying.verify_access_token(&token).await,
            Err(AuthError::InvalidToken { .. })
        ));
    }

    #[tokio::test]
    async fn tampered_signature_is_rejected() {
        let service = TokenService::new(key_manager(), &token_config());
        let token = service
            .issue_access_token(&test_user(), vec![], vec![])
            .await
            .unwrap();

        let mut parts: Vec<String> = token.split('.').map(str::to_string).collect();
        let mut signature = parts[2].clone();
        let flipped = if signature.starts_with('A') { "B" } else { "A" };
        signature.replace_range(0..1, flipped);
        parts[2] = signature;
        let tampered = parts.join(".");

        assert!(matches!(
            service.verify_access_token(&tampered).await,
            Err(AuthError::InvalidToken { .. })
        ));
    }

    #[tokio::test]
    async fn token_from_unknown_key_is_rejected() {
        let service = TokenService::new(key_manager(), &token_config());
        let foreign = TokenService::new(key_manager(), &token_config());

        let token = foreign
            .issue_access_token(&test_user(), vec![], vec![])
            .await
            .unwrap();

        let err = service.verify_access_token(&token).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken { .. }));
    }

    #[tokio::test]
    async fn token_without_kid_is_rejected() {
        let keys = key_manager();
        let service = TokenService::new(keys.clone(), &token_config());

        let (_, encoder) = keys.current_signer().await.unwrap();
        let claims = AccessTokenClaims::sample(&[]);
        let token = encode(&Header::new(Algorithm::EdDSA), &claims, &encoder).unwrap();

        let err = service.verify_access_token(&token).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken { .. }));
    }

    #[tokio::test]
    async fn verification_survives_key_rotation_within_grace() {
        let keys = key_manager();
        let service = TokenService::new(keys.clone(), &token_config());

        let token = service
            .issue_access_token(&test_user(), vec![], vec![])
            .await
            .unwrap();
        keys.rotate().await.unwrap();

        assert!(service.verify_access_token(&token).await.is_ok());
    }
}
