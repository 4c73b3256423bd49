//! End-to-end tests for login, bootstrap, logout, and route-guard flows.

use std::sync::Arc;

use serde_json::json;
use wiremock::matchers::{body_json, body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use civicdesk_client::api::{ApiClient, AuthBackend, HttpAuthBackend, TokenGrant};
use civicdesk_client::auth::{RefreshCoordinator, SessionManager, SessionStore};
use civicdesk_client::routes::{self, Destination, RouteDecision, CHANGE_PASSWORD_PATH};
use civicdesk_client::{Config, Portal, Role};

struct Stack {
    session: Arc<SessionStore>,
    client: ApiClient,
    manager: SessionManager,
}

fn stack(server_uri: &str, dir: &tempfile::TempDir) -> Stack {
    let session = Arc::new(SessionStore::new(dir.path().to_path_buf()));
    let backend: Arc<dyn AuthBackend> = Arc::new(HttpAuthBackend::new(server_uri).unwrap());
    let refresher = Arc::new(RefreshCoordinator::new(session.clone(), backend.clone()));
    let client = ApiClient::new(server_uri, session.clone(), refresher.clone()).unwrap();
    let manager = SessionManager::new(session.clone(), backend, refresher);
    Stack {
        session,
        client,
        manager,
    }
}

fn profile_response(must_reset: bool) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "id": 9,
        "displayName": "Kim Park",
        "role": "staff",
        "mustResetPassword": must_reset,
    }))
}

#[tokio::test]
async fn login_with_forced_reset_gates_navigation_until_password_changes() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .and(header(
            "content-type",
            "application/x-www-form-urlencoded",
        ))
        .and(body_string_contains("username=kim"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "a1",
            "refresh_token": "r1",
            "expires_in": 3600,
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/auth/me"))
        .and(header("authorization", "Bearer a1"))
        .respond_with(profile_response(true))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/change-password"))
        .and(body_json(json!({
            "current_password": "temp-pw",
            "new_password": "better-pw",
        })))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let stack = stack(&server.uri(), &dir);

    let profile = stack.manager.login("kim", "temp-pw", false).await.unwrap();
    assert!(profile.must_reset_password);

    // Every destination except the change-password screen is redirected
    let staff_page = Destination::with_role("/staff", Role::Staff);
    assert_eq!(
        routes::evaluate(&stack.session.snapshot(), &staff_page),
        RouteDecision::RedirectToChangePassword
    );
    assert_eq!(
        routes::evaluate(
            &stack.session.snapshot(),
            &Destination::new(CHANGE_PASSWORD_PATH)
        ),
        RouteDecision::Allow
    );

    stack
        .client
        .change_password("temp-pw", "better-pw")
        .await
        .unwrap();

    assert!(!stack.session.user().unwrap().must_reset_password);
    assert_eq!(
        routes::evaluate(&stack.session.snapshot(), &staff_page),
        RouteDecision::Allow
    );
}

#[tokio::test]
async fn bootstrap_restores_a_persisted_session() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/auth/me"))
        .and(header("authorization", "Bearer a1"))
        .respond_with(profile_response(false))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    {
        let seed = SessionStore::new(dir.path().to_path_buf());
        seed.set_tokens(TokenGrant {
            access_token: "a1".to_string(),
            refresh_token: "r1".to_string(),
            expires_in: 3600,
        })
        .unwrap();
    }

    let stack = stack(&server.uri(), &dir);
    stack.manager.bootstrap().await.unwrap();

    assert!(stack.session.is_authenticated());
    assert_eq!(stack.session.user().unwrap().display_name, "Kim Park");
}

#[tokio::test]
async fn bootstrap_clears_a_session_whose_profile_cannot_be_resolved() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/auth/me"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    {
        let seed = SessionStore::new(dir.path().to_path_buf());
        seed.set_tokens(TokenGrant {
            access_token: "a1".to_string(),
            refresh_token: "r1".to_string(),
            expires_in: 3600,
        })
        .unwrap();
    }

    let stack = stack(&server.uri(), &dir);
    stack.manager.bootstrap().await.unwrap();

    assert!(stack.session.tokens().is_none());
    assert_eq!(
        routes::evaluate(&stack.session.snapshot(), &Destination::new("/staff")),
        RouteDecision::RedirectToLogin {
            resume: "/staff".to_string()
        }
    );
}

#[tokio::test]
async fn bootstrap_refreshes_credentials_already_at_expiry() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .and(body_json(json!({ "refresh_token": "r1" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "a2",
            "refresh_token": "r2",
            "expires_in": 3600,
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/auth/me"))
        .and(header("authorization", "Bearer a2"))
        .respond_with(profile_response(false))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    {
        let seed = SessionStore::new(dir.path().to_path_buf());
        // Already inside the refresh window when hydrated
        seed.set_tokens(TokenGrant {
            access_token: "a1".to_string(),
            refresh_token: "r1".to_string(),
            expires_in: 5,
        })
        .unwrap();
    }

    let stack = stack(&server.uri(), &dir);
    stack.manager.bootstrap().await.unwrap();

    assert_eq!(stack.session.access_token().as_deref(), Some("a2"));
    assert!(stack.session.is_authenticated());
}

#[tokio::test]
async fn logout_revokes_and_clears_even_when_revocation_fails() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/auth/logout"))
        .and(body_json(json!({ "refresh_token": "r1" })))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let stack = stack(&server.uri(), &dir);
    stack
        .session
        .set_tokens(TokenGrant {
            access_token: "a1".to_string(),
            refresh_token: "r1".to_string(),
            expires_in: 3600,
        })
        .unwrap();

    stack.manager.logout().await.unwrap();

    assert!(stack.session.tokens().is_none());
    assert!(!dir.path().join("session.json").exists());
}

#[tokio::test]
async fn remembered_username_is_recorded_on_login_and_dropped_on_forget() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .and(body_string_contains("username=kim"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "a1",
            "refresh_token": "r1",
            "expires_in": 3600,
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/auth/me"))
        .respond_with(profile_response(false))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        api_base_url: Some(server.uri()),
        data_dir: Some(dir.path().to_path_buf()),
        ..Config::default()
    };
    let mut portal = Portal::new(config).unwrap();

    portal.login("kim", "temp-pw", true).await.unwrap();
    assert_eq!(portal.config().last_username.as_deref(), Some("kim"));
    assert!(portal.session().is_authenticated());

    portal.forget_remembered();
    assert!(portal.config().last_username.is_none());
    // Idempotent once nothing is remembered
    portal.forget_remembered();
    assert!(portal.config().last_username.is_none());
}
