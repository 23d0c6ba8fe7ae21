use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use http_body_util::BodyExt;
use presence_store::MemoryBackend;
use presence_sync::config::Config;
use presence_sync::directory::{LocalPlayers, LogDispatch};
use presence_sync::{Collaborators, Instance, create_app};
use serde_json::{Value, json};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt; // for `oneshot` method
use uuid::Uuid;

struct TestApp {
    app: axum::Router,
    instance: Arc<Instance>,
    players: Arc<LocalPlayers>,
    backend: MemoryBackend,
    _dir: TempDir,
}

/// Helper to start an instance on an in-memory store and build its router
async fn setup_test_app() -> TestApp {
    let backend = MemoryBackend::new();
    let dir = TempDir::new().expect("Failed to create temp dir");
    let config = Config {
        retry_delay: Duration::from_millis(1),
        heartbeat_interval: Duration::from_secs(3600),
        reconcile_interval: Duration::from_secs(3600),
        shutdown_grace: Duration::from_secs(1),
        crash_marker: dir.path().join("crash"),
        ..Config::for_proxy("p1")
    };
    let players = Arc::new(LocalPlayers::new());
    let instance = Instance::start(
        config.clone(),
        Arc::new(backend.clone()),
        Collaborators {
            directory: players.clone(),
            dispatcher: Arc::new(LogDispatch),
            lookup: None,
        },
    )
    .await
    .expect("Failed to start instance");
    let instance = Arc::new(instance);
    let app = create_app(
        instance.clone(),
        config.request_body_limit,
        config.request_timeout,
    );
    TestApp {
        app,
        instance,
        players,
        backend,
        _dir: dir,
    }
}

/// Helper to connect a player on the test instance and wait for the write
async fn connect_player(test: &TestApp, name: &str, server: &str) -> Uuid {
    let id = Uuid::new_v4();
    let ip: IpAddr = "10.1.2.3".parse().unwrap();
    test.players.connect(id, name, ip);
    test.players.set_server(&id, server);
    test.instance
        .player_connected(id, name, ip)
        .await
        .expect("connect task panicked");
    id
}

/// Helper to send a request and get response
async fn send_request(app: axum::Router, method: &str, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder()
        .uri(uri)
        .method(method)
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let body_bytes = response.into_body().collect().await.unwrap().to_bytes();

    let json = if body_bytes.is_empty() {
        json!({})
    } else {
        serde_json::from_slice(&body_bytes).unwrap_or(json!({}))
    };

    (status, json)
}

// =============================================================================
// HEALTH ENDPOINT TESTS
// =============================================================================

#[tokio::test]
async fn test_health_reports_active_instance() {
    // GIVEN: A running instance
    let test = setup_test_app().await;

    // WHEN: Making a GET request to /health
    let (status, body) = send_request(test.app.clone(), "GET", "/health").await;

    // THEN: Should return 200 with the proxy id
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "proxy_id": "p1", "active": true }));

    test.instance.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_health_after_shutdown_is_unavailable() {
    // GIVEN: An instance that has been shut down
    let test = setup_test_app().await;
    test.instance.shutdown().await.unwrap();

    // WHEN: Making a GET request to /health
    let (status, body) = send_request(test.app.clone(), "GET", "/health").await;

    // THEN: Should return 503
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["active"], false);
}

#[tokio::test]
async fn test_health_with_post_method() {
    let test = setup_test_app().await;

    let (status, _body) = send_request(test.app.clone(), "POST", "/health").await;

    // THEN: Should return 405 Method Not Allowed
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    test.instance.shutdown().await.unwrap();
}

// =============================================================================
// PLAYER ENDPOINT TESTS
// =============================================================================

#[tokio::test]
async fn test_players_and_count() {
    // GIVEN: Two connected players
    let test = setup_test_app().await;
    let steve = connect_player(&test, "Steve", "lobby").await;
    let alex = connect_player(&test, "Alex", "survival").await;

    // WHEN: Listing and counting players
    let (status, body) = send_request(test.app.clone(), "GET", "/players").await;
    let (count_status, count) = send_request(test.app.clone(), "GET", "/players/count").await;

    // THEN: Both are listed and counted
    assert_eq!(status, StatusCode::OK);
    let mut expected = vec![steve.to_string(), alex.to_string()];
    expected.sort();
    assert_eq!(body, json!({ "players": expected }));
    assert_eq!(count_status, StatusCode::OK);
    assert_eq!(count, json!({ "count": 2 }));

    test.instance.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_player_lookup() {
    // GIVEN: A connected player
    let test = setup_test_app().await;
    let steve = connect_player(&test, "Steve", "lobby").await;

    // WHEN: Looking the player up by uuid
    let (status, body) = send_request(test.app.clone(), "GET", &format!("/players/{steve}")).await;

    // THEN: Live attributes are returned
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({
            "uuid": steve.to_string(),
            "name": "Steve",
            "server": "lobby",
            "proxy": "p1",
            "last_seen": 0,
        })
    );

    test.instance.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unknown_player_was_never_seen() {
    let test = setup_test_app().await;
    let ghost = Uuid::new_v4();

    let (status, body) = send_request(test.app.clone(), "GET", &format!("/players/{ghost}")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["last_seen"], -1);
    assert_eq!(body["proxy"], Value::Null);
    test.instance.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_player_lookup_with_invalid_uuid() {
    // GIVEN: A running instance
    let test = setup_test_app().await;

    // WHEN: Looking up something that is not a uuid
    let (status, body) = send_request(test.app.clone(), "GET", "/players/steve").await;

    // THEN: Should return 400 with an error message
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("not a valid uuid"));

    test.instance.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_servers_groups_players() {
    let test = setup_test_app().await;
    let steve = connect_player(&test, "Steve", "lobby").await;
    let alex = connect_player(&test, "Alex", "lobby").await;
    let notch = connect_player(&test, "Notch", "survival").await;

    let (status, body) = send_request(test.app.clone(), "GET", "/servers").await;

    assert_eq!(status, StatusCode::OK);
    let mut lobby = vec![steve.to_string(), alex.to_string()];
    lobby.sort();
    assert_eq!(
        body,
        json!({ "servers": { "lobby": lobby, "survival": [notch.to_string()] } })
    );

    test.instance.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_proxies_lists_roster() {
    let test = setup_test_app().await;

    let (status, body) = send_request(test.app.clone(), "GET", "/proxies").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "proxies": ["p1"] }));
    test.instance.shutdown().await.unwrap();
}

// =============================================================================
// ERROR RESPONSE TESTS
// =============================================================================

#[tokio::test]
async fn test_store_outage_returns_503() {
    // GIVEN: A store that drops the next two commands
    let test = setup_test_app().await;
    test.backend.fail_next(2);

    // WHEN: Counting players
    let (status, body) = send_request(test.app.clone(), "GET", "/players/count").await;

    // THEN: Should return 503 without leaking store details
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(
        body,
        json!({ "error": "The presence store is currently unavailable." })
    );

    test.instance.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unknown_route_returns_404() {
    let test = setup_test_app().await;

    let (status, _body) = send_request(test.app.clone(), "GET", "/nonexistent").await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    test.instance.shutdown().await.unwrap();
}
