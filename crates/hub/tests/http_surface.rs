//! HTTP surface integration tests: bearer auth on session open, session id
//! minting on the streamable endpoint, and scope resolution errors.

use mcphub::dispatch::RequestDispatcher;
use mcphub::http::{HttpState, router};
use mcphub::oauth::OAuthCoordinator;
use mcphub::registry::UpstreamRegistry;
use mcphub::sessions::SessionManager;
use mcphub::settings::SettingsStore;
use mcphub::vector::{InMemoryVectorStore, ToolIndex};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

struct Harness {
    base_url: String,
    client: reqwest::Client,
    shutdown: CancellationToken,
    _dir: tempfile::TempDir,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn start_hub(settings_json: serde_json::Value) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("mcp_settings.json");
    std::fs::write(
        &path,
        serde_json::to_string_pretty(&settings_json).expect("settings json"),
    )
    .expect("write settings");

    let store = Arc::new(SettingsStore::open(Some(&path)).await.expect("open store"));
    let http = reqwest::Client::new();
    let ct = CancellationToken::new();
    let (events, _keep) = tokio::sync::broadcast::channel(64);

    let oauth = Arc::new(OAuthCoordinator::new(
        store.clone(),
        http.clone(),
        "http://localhost/oauth/callback".to_string(),
    ));
    let index = Arc::new(ToolIndex::new(Arc::new(InMemoryVectorStore::default())));
    index.configure(&store.current().system_config.smart_routing, &http);
    let registry = UpstreamRegistry::new(
        store.clone(),
        oauth.clone(),
        index.clone(),
        events.clone(),
        http.clone(),
        ct.clone(),
    );
    let sessions = Arc::new(SessionManager::new(ct.clone()));
    let dispatcher = Arc::new(RequestDispatcher::new(
        store.clone(),
        registry.clone(),
        index,
    ));

    let state = Arc::new(HttpState {
        store,
        sessions,
        dispatcher,
        registry,
        oauth,
        events,
        base_path: String::new(),
        start_time: Instant::now(),
        shutdown: ct.clone(),
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let app = router(state);
    let serve_ct = ct.clone();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async move { serve_ct.cancelled().await })
            .await;
    });

    Harness {
        base_url: format!("http://{addr}"),
        client: reqwest::Client::new(),
        shutdown: ct,
        _dir: dir,
    }
}

fn bearer_settings() -> serde_json::Value {
    serde_json::json!({
        "mcpServers": {},
        "groups": {
            "test-group": { "id": "test-group", "name": "Test Group", "members": [] }
        },
        "systemConfig": {
            "routing": {
                "enableGlobalRoute": true,
                "enableGroupNameRoute": true,
                "enableBearerAuth": true,
                "bearerAuthKey": "k",
                "skipAuth": false
            }
        }
    })
}

fn open_settings() -> serde_json::Value {
    serde_json::json!({
        "mcpServers": {},
        "systemConfig": {
            "routing": { "skipAuth": true },
            "smartRouting": { "enabled": true, "openaiApiKey": "sk-test" }
        }
    })
}

fn initialize_body() -> serde_json::Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "initialize",
        "params": {
            "protocolVersion": "2024-11-05",
            "capabilities": {},
            "clientInfo": { "name": "it", "version": "0.0.0" },
        },
    })
}

#[tokio::test]
async fn sse_open_requires_bearer_token() {
    let hub = start_hub(bearer_settings()).await;

    let response = hub
        .client
        .get(format!("{}/sse", hub.base_url))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);

    let mut response = hub
        .client
        .get(format!("{}/sse", hub.base_url))
        .header("Authorization", "Bearer k")
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    // The stream opens with an `endpoint` event carrying the messages URL.
    let first = tokio::time::timeout(Duration::from_secs(5), response.chunk())
        .await
        .expect("first frame in time")
        .expect("chunk")
        .expect("non-empty stream");
    let text = String::from_utf8_lossy(&first);
    assert!(text.contains("event: endpoint"), "got: {text}");
    assert!(text.contains("/messages?sessionId="), "got: {text}");
}

#[tokio::test]
async fn wrong_bearer_key_is_rejected() {
    let hub = start_hub(bearer_settings()).await;
    let response = hub
        .client
        .get(format!("{}/sse", hub.base_url))
        .header("Authorization", "Bearer wrong")
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn concurrent_initializes_mint_distinct_session_ids() {
    let hub = start_hub(open_settings()).await;

    let post = |client: reqwest::Client, url: String| async move {
        client
            .post(url)
            .header("content-type", "application/json")
            .json(&initialize_body())
            .send()
            .await
            .expect("request")
    };

    let url = format!("{}/mcp", hub.base_url);
    let (first, second) = tokio::join!(
        post(hub.client.clone(), url.clone()),
        post(hub.client.clone(), url.clone()),
    );

    assert_eq!(first.status(), reqwest::StatusCode::OK);
    assert_eq!(second.status(), reqwest::StatusCode::OK);

    let first_id = first
        .headers()
        .get("mcp-session-id")
        .and_then(|v| v.to_str().ok())
        .expect("first session id")
        .to_string();
    let second_id = second
        .headers()
        .get("mcp-session-id")
        .and_then(|v| v.to_str().ok())
        .expect("second session id")
        .to_string();
    assert_ne!(first_id, second_id);

    // The response body is a one-message SSE stream with the hub's info.
    let body = first.text().await.expect("body");
    assert!(body.contains("event: message"), "got: {body}");
    assert!(body.contains("mcphub"), "got: {body}");
}

#[tokio::test]
async fn unknown_scope_is_not_found_and_smart_scope_lists_meta_tools() {
    let hub = start_hub(open_settings()).await;

    let response = hub
        .client
        .post(format!("{}/mcp/missing", hub.base_url))
        .json(&initialize_body())
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

    // $smart works without any configured group.
    let init = hub
        .client
        .post(format!("{}/mcp/$smart", hub.base_url))
        .json(&initialize_body())
        .send()
        .await
        .expect("request");
    assert_eq!(init.status(), reqwest::StatusCode::OK);
    let session_id = init
        .headers()
        .get("mcp-session-id")
        .and_then(|v| v.to_str().ok())
        .expect("session id")
        .to_string();

    let list = hub
        .client
        .post(format!("{}/mcp/$smart", hub.base_url))
        .header("mcp-session-id", &session_id)
        .json(&serde_json::json!({ "jsonrpc": "2.0", "id": 2, "method": "tools/list" }))
        .send()
        .await
        .expect("request");
    assert_eq!(list.status(), reqwest::StatusCode::OK);
    let body = list.text().await.expect("body");
    assert!(body.contains("search_tools"), "got: {body}");
    assert!(body.contains("call_tool"), "got: {body}");
    assert!(body.contains("all available servers"), "got: {body}");
}

#[tokio::test]
async fn delete_closes_the_session() {
    let hub = start_hub(open_settings()).await;

    let init = hub
        .client
        .post(format!("{}/mcp", hub.base_url))
        .json(&initialize_body())
        .send()
        .await
        .expect("request");
    let session_id = init
        .headers()
        .get("mcp-session-id")
        .and_then(|v| v.to_str().ok())
        .expect("session id")
        .to_string();

    let delete = hub
        .client
        .delete(format!("{}/mcp", hub.base_url))
        .header("mcp-session-id", &session_id)
        .send()
        .await
        .expect("request");
    assert_eq!(delete.status(), reqwest::StatusCode::NO_CONTENT);

    // Requests on the closed session now fail.
    let after = hub
        .client
        .post(format!("{}/mcp", hub.base_url))
        .header("mcp-session-id", &session_id)
        .json(&serde_json::json!({ "jsonrpc": "2.0", "id": 3, "method": "tools/list" }))
        .send()
        .await
        .expect("request");
    assert_eq!(after.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn health_and_status_respond() {
    let hub = start_hub(open_settings()).await;

    let health = hub
        .client
        .get(format!("{}/health", hub.base_url))
        .send()
        .await
        .expect("request");
    assert_eq!(health.status(), reqwest::StatusCode::OK);
    assert_eq!(health.text().await.expect("body"), "ok");

    let status = hub
        .client
        .get(format!("{}/status", hub.base_url))
        .send()
        .await
        .expect("request");
    assert_eq!(status.status(), reqwest::StatusCode::OK);
    let body: serde_json::Value = status.json().await.expect("json");
    assert!(body.get("version").is_some());
    assert_eq!(body["servers"], serde_json::json!([]));
}
