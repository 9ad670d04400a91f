//! Router-level tests of the enrolment surface, against an in-process mock
//! registry and a mock signer socket.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Path as AxumPath, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{Request, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tower::ServiceExt;

use certm3_app::middleware::RateLimiter;
use certm3_app::registry::RegistryClient;
use certm3_app::{router, AppState};
use certm3_kernel::config::{AppServerConfig, Config, SignerConfig};
use certm3_kernel::{token, TokenManager};

const TEST_SECRET: &str = "gateway-test-secret";
const REQUEST_ID: &str = "8f14e45f-ceea-467f-abcd-0123456789ab";
const USER_ID: &str = "u-1";

/// Knobs and call log for the registry double.
#[derive(Clone)]
struct MockRegistry {
    calls: Arc<Mutex<Vec<String>>>,
    group_status: u16,
    member_status: u16,
}

impl MockRegistry {
    fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            group_status: 201,
            member_status: 204,
        }
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

fn registry_router(mock: MockRegistry) -> Router {
    Router::new()
        .route(
            "/requests",
            post(|State(m): State<MockRegistry>, _body: Bytes| async move {
                m.record("POST /requests");
                Json(serde_json::json!({
                    "id": REQUEST_ID,
                    "challenge": "challenge-abcd1234",
                }))
            }),
        )
        .route(
            "/requests/{id}/validate",
            post(|State(m): State<MockRegistry>, AxumPath(id): AxumPath<String>| async move {
                m.record(format!("POST /requests/{id}/validate"));
                Json(serde_json::json!({ "userId": USER_ID }))
            }),
        )
        .route(
            "/requests/{id}",
            get(|State(m): State<MockRegistry>, AxumPath(id): AxumPath<String>| async move {
                m.record(format!("GET /requests/{id}"));
                Json(serde_json::json!({ "username": "alice" }))
            }),
        )
        .route(
            "/groups",
            post(|State(m): State<MockRegistry>| async move {
                m.record("POST /groups");
                StatusCode::from_u16(m.group_status).unwrap()
            }),
        )
        .route(
            "/groups/{name}/members",
            post(
                |State(m): State<MockRegistry>, AxumPath(name): AxumPath<String>| async move {
                    m.record(format!("POST /groups/{name}/members"));
                    StatusCode::from_u16(m.member_status).unwrap()
                },
            ),
        )
        .route(
            "/request/check-username/{name}",
            get(
                |State(m): State<MockRegistry>, AxumPath(name): AxumPath<String>| async move {
                    m.record(format!("GET /request/check-username/{name}"));
                    if name == "free" {
                        StatusCode::NOT_FOUND.into_response()
                    } else {
                        Json(serde_json::json!({ "id": USER_ID })).into_response()
                    }
                },
            ),
        )
        .route(
            "/users/username/{name}",
            get(|State(m): State<MockRegistry>| async move {
                m.record("GET /users/username");
                Json(serde_json::json!({ "id": USER_ID }))
            }),
        )
        .route(
            "/users/{id}/groups",
            get(|State(m): State<MockRegistry>| async move {
                m.record("GET /users/groups");
                Json(serde_json::json!(["dev", "qa"]))
            }),
        )
        .with_state(mock)
}

async fn spawn_registry(mock: MockRegistry) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = registry_router(mock);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

/// Signer double: answers every connection with a canned certificate and
/// records what it was asked to sign.
fn spawn_signer(dir: &Path, seen: Arc<Mutex<Vec<serde_json::Value>>>) -> String {
    let path = dir.join("signer.sock");
    let listener = UnixListener::bind(&path).unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let seen = Arc::clone(&seen);
            tokio::spawn(async move {
                let (reader, mut writer) = stream.into_split();
                let mut lines = BufReader::new(reader).lines();
                if let Ok(Some(line)) = lines.next_line().await {
                    if let Ok(value) = serde_json::from_str::<serde_json::Value>(&line) {
                        seen.lock().unwrap().push(value);
                    }
                    let response = serde_json::json!({
                        "success": true,
                        "data": {
                            "certificate": "-----BEGIN CERTIFICATE-----\nMIIBfake\n-----END CERTIFICATE-----\n",
                            "caCertificate": "-----BEGIN CERTIFICATE-----\nMIICfake\n-----END CERTIFICATE-----\n",
                        },
                    });
                    let mut payload = response.to_string();
                    payload.push('\n');
                    let _ = writer.write_all(payload.as_bytes()).await;
                }
            });
        }
    });
    path.to_string_lossy().to_string()
}

fn test_state(backend_url: &str, socket_path: &str, rate_limit: u32) -> Arc<AppState> {
    let config = Config {
        log_level: "info".into(),
        log_file: "/tmp/certm3-gateway-test.log".into(),
        verbose: false,
        app_server: AppServerConfig {
            listen_addr: ":0".into(),
            backend_api_url: backend_url.into(),
            rate_limit_per_ip: rate_limit,
        },
        signer: SignerConfig {
            socket_path: socket_path.into(),
            ..SignerConfig::default()
        },
    };
    Arc::new(AppState {
        tokens: TokenManager::new(TEST_SECRET, token::ISSUER, token::AUDIENCE),
        registry: RegistryClient::new(backend_url).unwrap(),
        rate_limiter: RateLimiter::new(rate_limit as usize, Duration::from_secs(1)),
        prometheus: None,
        config,
    })
}

async fn request(
    app: &Router,
    method: &str,
    path: &str,
    authorization: Option<&str>,
    body: Option<serde_json::Value>,
) -> (StatusCode, String) {
    let mut builder = Request::builder().method(method).uri(path);
    if let Some(value) = authorization {
        builder = builder.header(AUTHORIZATION, value);
    }
    let body = match body {
        Some(value) => {
            builder = builder.header(CONTENT_TYPE, "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    let response = app
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, String::from_utf8_lossy(&bytes).to_string())
}

#[tokio::test]
async fn happy_path_enrolment() {
    let mock = MockRegistry::new();
    let backend = spawn_registry(mock.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let signed_requests = Arc::new(Mutex::new(Vec::new()));
    let socket = spawn_signer(dir.path(), Arc::clone(&signed_requests));
    let app = router(test_state(&backend, &socket, 1000));

    // Initiate: the registry's {id, challenge} streams back.
    let (status, body) = request(
        &app,
        "POST",
        "/app/initiate-request",
        None,
        Some(serde_json::json!({
            "email": "alice@example.com",
            "username": "alice",
            "displayName": "Alice",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let initiated: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(initiated["id"], REQUEST_ID);
    assert!(initiated["challenge"]
        .as_str()
        .unwrap()
        .starts_with("challenge-"));

    // Validate: side effects fire, token comes back.
    let (status, body) = request(
        &app,
        "POST",
        "/app/validate-email",
        None,
        Some(serde_json::json!({
            "requestId": REQUEST_ID,
            "challengeToken": "challenge-abcd1234",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "validate failed: {body}");
    let validated: serde_json::Value = serde_json::from_str(&body).unwrap();
    let bearer = validated["token"].as_str().unwrap().to_string();
    assert!(bearer.starts_with("eyJ"));

    // The side effects ran in protocol order: validate, request re-read,
    // personal group, personal membership, users membership.
    let calls = mock.calls();
    assert_eq!(
        calls,
        vec![
            "POST /requests".to_string(),
            format!("POST /requests/{REQUEST_ID}/validate"),
            format!("GET /requests/{REQUEST_ID}"),
            "POST /groups".to_string(),
            "POST /groups/alice/members".to_string(),
            "POST /groups/users/members".to_string(),
        ]
    );

    // Submit: CSR plus claimed groups reach the signer with the token.
    let (status, body) = request(
        &app,
        "POST",
        "/app/submit-csr",
        Some(&format!("Bearer {bearer}")),
        Some(serde_json::json!({
            "csr": "-----BEGIN CERTIFICATE REQUEST-----\nMIIBfake\n-----END CERTIFICATE REQUEST-----",
            "groups": ["dev", "admin"],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "submit failed: {body}");
    let issued: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert!(issued["certificate"]
        .as_str()
        .unwrap()
        .contains("BEGIN CERTIFICATE"));
    assert!(issued["caCertificate"]
        .as_str()
        .unwrap()
        .contains("BEGIN CERTIFICATE"));

    let seen = signed_requests.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0]["requestId"], REQUEST_ID);
    assert_eq!(seen[0]["groups"], serde_json::json!(["dev", "admin"]));
    assert_eq!(
        seen[0]["token"].as_str().unwrap(),
        format!("Bearer {bearer}")
    );
}

#[tokio::test]
async fn bad_challenge_format_never_reaches_the_registry() {
    let mock = MockRegistry::new();
    let backend = spawn_registry(mock.clone()).await;
    let app = router(test_state(&backend, "/tmp/unused.sock", 1000));

    let (status, body) = request(
        &app,
        "POST",
        "/app/validate-email",
        None,
        Some(serde_json::json!({
            "requestId": REQUEST_ID,
            "challengeToken": "nope",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("Invalid validation code format"));
    assert!(mock.calls().is_empty());
}

#[tokio::test]
async fn invalid_username_is_rejected_before_any_call() {
    let mock = MockRegistry::new();
    let backend = spawn_registry(mock.clone()).await;
    let app = router(test_state(&backend, "/tmp/unused.sock", 1000));

    let (status, body) = request(
        &app,
        "POST",
        "/app/initiate-request",
        None,
        Some(serde_json::json!({
            "email": "a@b.co",
            "username": "alice-bob",
            "displayName": "Alice",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("Invalid username format"));
    assert!(mock.calls().is_empty());
}

#[tokio::test]
async fn invalid_email_is_rejected() {
    let mock = MockRegistry::new();
    let backend = spawn_registry(mock.clone()).await;
    let app = router(test_state(&backend, "/tmp/unused.sock", 1000));

    let (status, body) = request(
        &app,
        "POST",
        "/app/initiate-request",
        None,
        Some(serde_json::json!({
            "email": "not-an-email",
            "username": "alice",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("Invalid email format"));
}

#[tokio::test]
async fn submit_csr_requires_a_token() {
    let mock = MockRegistry::new();
    let backend = spawn_registry(mock.clone()).await;
    let app = router(test_state(&backend, "/tmp/unused.sock", 1000));

    let (status, body) = request(
        &app,
        "POST",
        "/app/submit-csr",
        None,
        Some(serde_json::json!({ "csr": "x" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body.contains("Authorization header required"));

    let (status, _) = request(
        &app,
        "POST",
        "/app/submit-csr",
        Some("Token abc"),
        Some(serde_json::json!({ "csr": "x" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = request(
        &app,
        "POST",
        "/app/submit-csr",
        Some("Bearer not-a-jwt"),
        Some(serde_json::json!({ "csr": "x" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn expired_token_is_rejected() {
    let mock = MockRegistry::new();
    let backend = spawn_registry(mock.clone()).await;
    let app = router(test_state(&backend, "/tmp/unused.sock", 1000));

    #[derive(serde::Serialize)]
    struct StaleClaims {
        user_id: &'static str,
        request_id: &'static str,
        iss: &'static str,
        aud: &'static str,
        iat: i64,
        exp: i64,
    }
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64;
    let stale = jsonwebtoken::encode(
        &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
        &StaleClaims {
            user_id: USER_ID,
            request_id: REQUEST_ID,
            iss: token::ISSUER,
            aud: token::AUDIENCE,
            iat: now - 7200,
            exp: now - 3600,
        },
        &jsonwebtoken::EncodingKey::from_secret(TEST_SECRET.as_bytes()),
    )
    .unwrap();

    let (status, body) = request(
        &app,
        "POST",
        "/app/submit-csr",
        Some(&format!("Bearer {stale}")),
        Some(serde_json::json!({ "csr": "x" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body.contains("Invalid token"));
}

#[tokio::test]
async fn check_username_maps_registry_404_to_available() {
    let mock = MockRegistry::new();
    let backend = spawn_registry(mock.clone()).await;
    let app = router(test_state(&backend, "/tmp/unused.sock", 1000));

    let (status, body) = request(&app, "GET", "/app/check-username/free", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        serde_json::from_str::<serde_json::Value>(&body).unwrap(),
        serde_json::json!({ "available": true })
    );

    let (status, body) = request(&app, "GET", "/app/check-username/taken", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        serde_json::from_str::<serde_json::Value>(&body).unwrap(),
        serde_json::json!({ "available": false })
    );
}

#[tokio::test]
async fn groups_proxy_returns_registry_groups() {
    let mock = MockRegistry::new();
    let backend = spawn_registry(mock.clone()).await;
    let app = router(test_state(&backend, "/tmp/unused.sock", 1000));

    let (status, body) = request(&app, "GET", "/app/groups/alice", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        serde_json::from_str::<serde_json::Value>(&body).unwrap(),
        serde_json::json!(["dev", "qa"])
    );
}

#[tokio::test]
async fn membership_failure_aborts_validation() {
    let mut mock = MockRegistry::new();
    mock.member_status = 500;
    let backend = spawn_registry(mock.clone()).await;
    let app = router(test_state(&backend, "/tmp/unused.sock", 1000));

    let (status, body) = request(
        &app,
        "POST",
        "/app/validate-email",
        None,
        Some(serde_json::json!({
            "requestId": REQUEST_ID,
            "challengeToken": "challenge-abcd1234",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body.contains("Failed to add user to self group"));
    // The users-group insert never fired; the first hard failure aborts.
    assert!(!mock
        .calls()
        .iter()
        .any(|call| call == "POST /groups/users/members"));
}

#[tokio::test]
async fn group_creation_failure_aborts_validation() {
    let mut mock = MockRegistry::new();
    mock.group_status = 500;
    let backend = spawn_registry(mock.clone()).await;
    let app = router(test_state(&backend, "/tmp/unused.sock", 1000));

    let (status, body) = request(
        &app,
        "POST",
        "/app/validate-email",
        None,
        Some(serde_json::json!({
            "requestId": REQUEST_ID,
            "challengeToken": "challenge-abcd1234",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body.contains("Failed to create self group"));
}

#[tokio::test]
async fn rate_limit_rejects_over_limit_bursts() {
    let mock = MockRegistry::new();
    let backend = spawn_registry(mock.clone()).await;
    let app = router(test_state(&backend, "/tmp/unused.sock", 3));

    let mut refused = 0;
    for _ in 0..5 {
        let (status, _) = request(&app, "GET", "/health", None, None).await;
        if status == StatusCode::TOO_MANY_REQUESTS {
            refused += 1;
        }
    }
    assert!(refused >= 2, "expected at least 2 refusals, got {refused}");
}

#[tokio::test]
async fn health_reports_liveness() {
    let mock = MockRegistry::new();
    let backend = spawn_registry(mock.clone()).await;
    let app = router(test_state(&backend, "/tmp/unused.sock", 1000));

    let (status, body) = request(&app, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    let health: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert!(health["ts"].as_u64().unwrap() > 0);
}
