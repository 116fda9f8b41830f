use std::sync::{Arc, Once};

use auth_core::{
    AuthConfig, AuthError, AuthService, CreateUserRequest, InMemoryCredentialStore, LoginRequest,
    SecurityEventType,
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

async fn test_service() -> (Arc<AuthService>, Arc<InMemoryCredentialStore>) {
    init_tracing();
    let mut config = AuthConfig::default();
    config.argon2.memory_kib = 19_456;
    config.argon2.iterations = 1;
    config.argon2.parallelism = 1;
    let store = Arc::new(InMemoryCredentialStore::new());
    let service = AuthService::new(config, store.clone()).await.unwrap();
    (Arc::new(service), store)
}

async fn register(service: &AuthService, email: &str) {
    service
        .create_user(&CreateUserRequest {
            email: email.to_string(),
            password: PASSWORD.to_string(),
            roles: vec![],
        })
        .await
        .unwrap();
}

fn login_request(email: &str, password: &str) -> LoginRequest {
    LoginRequest {
        email: email.to_string(),
        password: password.to_string(),
        client_ip: Some("203.0.113.9".to_string()),
        user_agent: Some("integration-suite/1.0".to_string()),
    }
}

#[tokio::test]
async fn service_reports_healthy_with_in_process_stores() {
    let (service, _store) = test_service().await;
    service.health_check().await.unwrap();
    assert!(!service.is_degraded());
}

#[tokio::test]
async fn login_returns_a_working_token_pair() {
    let (service, _store) = test_service().await;
    register(&service, "carol@example.com").await;

    let pair = service
        .login(&login_request("carol@example.com", PASSWORD))
        .await
        .unwrap();

    assert_eq!(pair.token_type, "Bearer");
    assert_eq!(pair.expires_in, 900);
    assert!(!pair.access_token.is_empty());
    assert!(!pair.refresh_token.is_empty());

    // The access token authenticates against the service itself.
    let me = service.me(&pair.access_token).await.unwrap();
    assert_eq!(me.email, "carol@example.com");
    assert_eq!(me.roles, vec!["user".to_string()]);

    let success = service.audit().recent_of(SecurityEventType::AuthSuccess);
    assert_eq!(success.len(), 1);
    // PII leaves the audit trail redacted.
    assert_eq!(success[0].email.as_deref(), Some("c***@example.com"));
    assert_eq!(success[0].client_ip.as_deref(), Some("203.0.113.x"));
    assert_eq!(success[0].user_agent.as_deref(), Some("integration-suite/1.0"));
}

#[tokio::test]
async fn email_case_and_whitespace_do_not_matter() {
    let (service, _store) = test_service().await;
    register(&service, "dave@example.com").await;

    let pair = service
        .login(&login_request("  Dave@Example.COM ", PASSWORD))
        .await
        .unwrap();
    let me = service.me(&pair.access_token).await.unwrap();
    assert_eq!(me.email, "dave@example.com");
}

#[tokio::test]
async fn failure_reasons_are_not_distinguishable_by_clients() {
    let (service, _store) = test_service().await;
    register(&service, "erin@example.com").await;

    // Unknown account, wrong password and malformed email: one client story.
    let unknown = service
        .login(&login_request("nobody@example.com", PASSWORD))
        .await
        .unwrap_err();
    let wrong = service
        .login(&login_request("erin@example.com", "Wr0ng!Password!"))
        .await
        .unwrap_err();
    let malformed = service
        .login(&login_request("not-an-email", PASSWORD))
        .await
        .unwrap_err();

    assert_eq!(unknown.client_message(), "authentication failed");
    assert_eq!(wrong.client_message(), "authentication failed");
    assert_eq!(malformed.client_message(), "authentication failed");

    // The audit trail keeps the distinction instead.
    let failures = service.audit().recent_of(SecurityEventType::AuthFailure);
    assert_eq!(failures.len(), 3);
}

#[tokio::test]
async fn deactivated_account_cannot_login_or_refresh() {
    use auth_core::{CredentialStore, Email};

    let (service, store) = test_service().await;
    register(&service, "frank@example.com").await;
    register(&service, "admin@example.com").await;

    // Promote the admin through the store, then act with their token.
    let admin = store
        .find_by_email(&Email::parse("admin@example.com").unwrap())
        .await
        .unwrap()
        .unwrap();
    store.assign_role(&admin.id, "admin", None).await.unwrap();
    let admin_pair = service
        .login(&login_request("admin@example.com", PASSWORD))
        .await
        .unwrap();

    let victim_pair = service
        .login(&login_request("frank@example.com", PASSWORD))
        .await
        .unwrap();
    let victim_id = service.me(&victim_pair.access_token).await.unwrap().user_id;

    service
        .deactivate_user(&admin_pair.access_token, &victim_id)
        .await
        .unwrap();

    let login_err = service
        .login(&login_request("frank@example.com", PASSWORD))
        .await
        .unwrap_err();
    assert!(matches!(login_err, AuthError::InvalidCredentials));

    let refresh_err = service.refresh(&victim_pair.refresh_token).await.unwrap_err();
    assert!(matches!(refresh_err, AuthError::InvalidToken { .. }));
}

#[tokio::test]
async fn logout_all_ends_every_session() {
    let (service, _store) = test_service().await;
    register(&service, "grace@example.com").await;

    let first = service
        .login(&login_request("grace@example.com", PASSWORD))
        .await
        .unwrap();
    let second = service
        .login(&login_request("grace@example.com", PASSWORD))
        .await
        .unwrap();
    let user_id = service.me(&first.access_token).await.unwrap().user_id;

    let revoked = service.logout_all(&user_id).await.unwrap();
    assert_eq!(revoked, 2);

    assert!(service.refresh(&first.refresh_token).await.is_err());
    assert!(service.refresh(&second.refresh_token).await.is_err());

    // A fresh login starts a new, working session.
    let third = service
        .login(&login_request("grace@example.com", PASSWORD))
        .await
        .unwrap();
    assert!(service.refresh(&third.refresh_token).await.is_ok());
}
