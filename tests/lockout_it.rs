use std::sync::{Arc, Once};

use chrono::{Duration, Utc};

use auth_core::{
    AuthConfig, AuthError, AuthService, CreateUserRequest, CredentialStore, Email,
    InMemoryCredentialStore, LoginRequest, SecurityEventType,
};

// Short password policy so the canonical credentials below are accepted.
const EMAIL: &str = "a@x.com";
const PASSWORD: &str = "Secret1!";

static TRACING: Once = Once::new();

fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

async fn test_service() -> (Arc<AuthService>, Arc<InMemoryCredentialStore>) {
    init_tracing();
    let mut config = AuthConfig::default();
    config.argon2.memory_kib = 19_456;
    config.argon2.iterations = 1;
    config.argon2.parallelism = 1;
    config.password.min_length = 8;
    let store = Arc::new(InMemoryCredentialStore::new());
    let service = AuthService::new(config, store.clone()).await.unwrap();

    service
        .create_user(&CreateUserRequest {
            email: EMAIL.to_string(),
            password: PASSWORD.to_string(),
            roles: vec![],
        })
        .await
        .unwrap();
    (Arc::new(service), store)
}

fn attempt(password: &str) -> LoginRequest {
    LoginRequest {
        email: EMAIL.to_string(),
        password: password.to_string(),
        client_ip: None,
        user_agent: None,
    }
}

#[tokio::test]
async fn five_failures_lock_out_even_the_correct_password() {
    let (service, _store) = test_service().await;

    for i in 1..=5 {
        let err = service.login(&attempt("Wrong0!!")).await.unwrap_err();
        assert!(
            matches!(err, AuthError::InvalidCredentials),
            "attempt {i} should fail as invalid credentials"
        );
    }

    // Locked now: the correct password no longer helps, and the client
    // cannot tell a lock from a bad password.
    let locked = service.login(&attempt(PASSWORD)).await.unwrap_err();
    assert!(matches!(locked, AuthError::AccountLocked { .. }));
    assert_eq!(locked.client_message(), "authentication failed");
    assert_eq!(
        locked.client_message(),
        AuthError::InvalidCredentials.client_message()
    );

    let lockouts = service.audit().recent_of(SecurityEventType::AccountLockout);
    assert_eq!(lockouts.len(), 1);
}

#[tokio::test]
async fn four_failures_then_success_resets_the_counter() {
    let (service, store) = test_service().await;

    for _ in 0..4 {
        service.login(&attempt("Wrong0!!")).await.unwrap_err();
    }
    service.login(&attempt(PASSWORD)).await.unwrap();

    let user = store
        .find_by_email(&Email::parse(EMAIL).unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(user.failed_attempts, 0);

    // The reset counter means four more failures still do not lock.
    for _ in 0..4 {
        service.login(&attempt("Wrong0!!")).await.unwrap_err();
    }
    service.login(&attempt(PASSWORD)).await.unwrap();
}

#[tokio::test]
async fn lock_expires_on_its_own() {
    let (service, store) = test_service().await;

    for _ in 0..5 {
        service.login(&attempt("Wrong0!!")).await.unwrap_err();
    }
    assert!(matches!(
        service.login(&attempt(PASSWORD)).await,
        Err(AuthError::AccountLocked { .. })
    ));

    // Rewind the lock to the past instead of waiting out the window.
    let user = store
        .find_by_email(&Email::parse(EMAIL).unwrap())
        .await
        .unwrap()
        .unwrap();
    store
        .set_lock(&user.id, Utc::now() - Duration::seconds(1))
        .await
        .unwrap();

    let pair = service.login(&attempt(PASSWORD)).await.unwrap();
    assert!(!pair.access_token.is_empty());

    let user = store
        .find_by_email(&Email::parse(EMAIL).unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(user.failed_attempts, 0);
    assert!(user.locked_until.is_none());
}

#[tokio::test]
async fn lockout_does_not_cut_short_existing_sessions() {
    let (service, _store) = test_service().await;

    let pair = service.login(&attempt(PASSWORD)).await.unwrap();

    for _ in 0..5 {
        service.login(&attempt("Wrong0!!")).await.unwrap_err();
    }
    assert!(matches!(
        service.login(&attempt(PASSWORD)).await,
        Err(AuthError::AccountLocked { .. })
    ));

    // The login lock guards password guessing; a session that already holds
    // a refresh token keeps working.
    assert!(service.refresh(&pair.refresh_token).await.is_ok());
    assert!(service.me(&pair.access_token).await.is_ok());
}
