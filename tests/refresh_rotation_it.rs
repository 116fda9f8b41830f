use std::collections::HashSet;
use std::sync::{Arc, Once};

use auth_core::{
    AuthConfig, AuthError, AuthService, CreateUserRequest, InMemoryCredentialStore, LoginRequest,
    SecurityEventType, SecuritySeverity,
};

const PASSWORD: &str = "Str0ng!Passw0rd";

static TRACING: Once = Once::new();

fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

async fn test_service() -> Arc<AuthService> {
    init_tracing();
    let mut config = AuthConfig::default();
    config.argon2.memory_kib = 19_456;
    config.argon2.iterations = 1;
    config.argon2.parallelism = 1;
    let store = Arc::new(InMemoryCredentialStore::new());
    Arc::new(AuthService::new(config, store).await.unwrap())
}

async fn login(service: &AuthService, email: &str) -> auth_core::TokenPair {
    service
        .create_user(&CreateUserRequest {
            email: email.to_string(),
            password: PASSWORD.to_string(),
            roles: vec![],
        })
        .await
        .unwrap();
    service
        .login(&LoginRequest {
            email: email.to_string(),
            password: PASSWORD.to_string(),
            client_ip: None,
            user_agent: None,
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn refresh_rotates_to_a_new_single_use_token() {
    let service = test_service().await;
    let pair = login(&service, "rot@example.com").await;

    let refreshed = service.refresh(&pair.refresh_token).await.unwrap();
    assert_ne!(refreshed.refresh_token, pair.refresh_token);
    assert_ne!(refreshed.access_token, pair.access_token);

    // The new access token works; identity is unchanged.
    let me = service.me(&refreshed.access_token).await.unwrap();
    assert_eq!(me.email, "rot@example.com");
}

#[tokio::test]
async fn replayed_token_revokes_the_whole_chain() {
    let service = test_service().await;
    let pair = login(&service, "replay@example.com").await;

    // Step 1: legitimate rotation consumes the original token.
    let refreshed = service.refresh(&pair.refresh_token).await.unwrap();

    // Step 2: replaying the consumed token is reuse.
    let reuse = service.refresh(&pair.refresh_token).await.unwrap_err();
    assert!(matches!(reuse, AuthError::ReuseDetected));

    // Step 3: the chain is poisoned; even the legitimate successor is dead.
    let poisoned = service.refresh(&refreshed.refresh_token).await.unwrap_err();
    assert!(matches!(poisoned, AuthError::InvalidToken { .. }));

    // Reuse left a critical audit record.
    let events = service.audit().recent_of(SecurityEventType::TokenReuse);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].severity, SecuritySeverity::Critical);

    // A fresh login starts an untainted chain.
    let fresh = service
        .login(&LoginRequest {
            email: "replay@example.com".to_string(),
            password: PASSWORD.to_string(),
            client_ip: None,
            user_agent: None,
        })
        .await
        .unwrap();
    assert!(service.refresh(&fresh.refresh_token).await.is_ok());
}

#[tokio::test]
async fn long_rotation_chains_stay_single_use() {
    let service = test_service().await;
    let mut pair = login(&service, "chain@example.com").await;

    let mut seen = HashSet::new();
    seen.insert(pair.refresh_token.clone());
    let mut spent = Vec::new();

    for _ in 0..5 {
        spent.push(pair.refresh_token.clone());
        pair = service.refresh(&pair.refresh_token).await.unwrap();
        assert!(
            seen.insert(pair.refresh_token.clone()),
            "rotation produced a repeated token"
        );
    }

    // Only the head of the chain is alive; every spent token is essentially
    // a tripwire now. Present the oldest one.
    let err = service.refresh(&spent[0]).await.unwrap_err();
    assert!(matches!(err, AuthError::ReuseDetected));

    // Which kills the head too.
    assert!(service.refresh(&pair.refresh_token).await.is_err());
}

#[tokio::test]
async fn concurrent_refresh_of_one_token_has_a_single_winner() {
    let service = test_service().await;
    let pair = login(&service, "race@example.com").await;

    let mut handles = Vec::new();
    for _ in 0..2 {
        let service = service.clone();
        let token = pair.refresh_token.clone();
        handles.push(tokio::spawn(async move { service.refresh(&token).await }));
    }

    let mut winners = 0;
    let mut reuse_losers = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => winners += 1,
            Err(AuthError::ReuseDetected) => reuse_losers += 1,
            Err(other) => panic!("unexpected refresh error: {other:?}"),
        }
    }
    assert_eq!(winners, 1, "exactly one concurrent refresh may win");
    assert_eq!(reuse_losers, 1, "the loser must surface as reuse");
}

#[tokio::test]
async fn unknown_and_malformed_tokens_are_rejected() {
    let service = test_service().await;
    login(&service, "nobody@example.com").await;

    for bogus in ["", "garbage", "AAAA.BBBB.CCCC"] {
        let err = service.refresh(bogus).await.unwrap_err();
        assert!(
            matches!(err, AuthError::InvalidToken { .. }),
            "expected invalid token for {bogus:?}, got {err:?}"
        );
    }
}
