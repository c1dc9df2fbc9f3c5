//! The HTTP surface: SSE and streamable-HTTP session endpoints (global,
//! scoped, and user-scoped mounts), the OAuth callback and proxy routes,
//! and health/status.

use crate::dispatch::{RequestDispatcher, list_changed_message, notification_message};
use crate::error::HubError;
use crate::oauth::OAuthCoordinator;
use crate::registry::{ServerStatus, UpstreamRegistry};
use crate::sessions::{
    AuthError, DownstreamSession, KEEPALIVE_INTERVAL, RoutingScope, ScopeError, SessionKind,
    SessionManager, authorize, header_snapshot, resolve_scope,
};
use crate::settings::SettingsStore;
use crate::upstream::{EventSender, UpstreamEvent};
use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{Html, IntoResponse, Redirect, Response, Sse, sse::Event, sse::KeepAlive},
    routing::{get, post},
};
use futures::Stream;
use futures::StreamExt;
use rmcp::model::{
    ClientJsonRpcMessage, ClientRequest, JsonRpcRequest, ServerJsonRpcMessage,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const SESSION_ID_HEADER: &str = "mcp-session-id";

pub struct HttpState {
    pub store: Arc<SettingsStore>,
    pub sessions: Arc<SessionManager>,
    pub dispatcher: Arc<RequestDispatcher>,
    pub registry: Arc<UpstreamRegistry>,
    pub oauth: Arc<OAuthCoordinator>,
    pub events: EventSender,
    pub base_path: String,
    pub start_time: Instant,
    pub shutdown: CancellationToken,
}

/// Build the full router. Session endpoints live under the configured base
/// path; health and status sit at the root like the other operational
/// routes.
pub fn router(state: Arc<HttpState>) -> Router {
    let scoped = Router::new()
        .route("/sse", get(sse_open))
        .route("/sse/{scope}", get(sse_open_scoped))
        .route("/sse/{scope}/{sub}", get(sse_open_sub))
        .route("/messages", post(messages_post))
        .route("/mcp", post(mcp_post).get(mcp_get).delete(mcp_delete))
        .route(
            "/mcp/{scope}",
            post(mcp_post_scoped).get(mcp_get).delete(mcp_delete),
        )
        .route(
            "/mcp/{scope}/{sub}",
            post(mcp_post_sub).get(mcp_get).delete(mcp_delete),
        )
        .route("/oauth/callback", get(oauth_callback))
        .route(
            "/.well-known/oauth-authorization-server",
            get(oauth_metadata),
        )
        .route("/authorize", get(oauth_authorize))
        .route("/token", post(oauth_token))
        // User-scoped mounts: the captured segment becomes the session user.
        .route("/{user}/sse", get(user_sse_open))
        .route("/{user}/sse/{scope}", get(user_sse_open_scoped))
        .route("/{user}/sse/{scope}/{sub}", get(user_sse_open_sub))
        .route("/{user}/messages", post(user_messages_post))
        .route(
            "/{user}/mcp",
            post(user_mcp_post).get(mcp_get).delete(mcp_delete),
        )
        .route(
            "/{user}/mcp/{scope}",
            post(user_mcp_post_scoped).get(mcp_get).delete(mcp_delete),
        );

    let root = Router::new()
        .route("/health", get(health))
        .route("/status", get(status));

    let base = state.base_path.trim_end_matches('/');
    let app = if base.is_empty() {
        root.merge(scoped)
    } else {
        root.nest(base, scoped)
    };
    app.with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    version: &'static str,
    uptime_seconds: u64,
    session_count: usize,
    servers: Vec<ServerStatus>,
}

async fn status(State(state): State<Arc<HttpState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        session_count: state.sessions.len(),
        servers: state.registry.status_overview(),
    })
}

fn scope_error_response(error: &ScopeError) -> Response {
    let status = match error {
        ScopeError::GlobalRouteDisabled => StatusCode::FORBIDDEN,
        ScopeError::UnknownScope(_) | ScopeError::UnknownGroup(_) => StatusCode::NOT_FOUND,
    };
    (status, error.message()).into_response()
}

/// Authenticate and resolve the scope for a session-opening request.
fn admit(
    state: &HttpState,
    headers: &HeaderMap,
    user: Option<&str>,
    segment: Option<&str>,
    sub: Option<&str>,
) -> Result<RoutingScope, Response> {
    let settings = state.store.current();
    let routing = &settings.system_config_for(user).routing;

    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if let Err(AuthError::Unauthorized) = authorize(&settings, routing, authorization, user) {
        return Err((StatusCode::UNAUTHORIZED, "Unauthorized").into_response());
    }

    resolve_scope(&settings, routing, segment, sub).map_err(|e| scope_error_response(&e))
}

// ---------------------------------------------------------------------------
// SSE transport
// ---------------------------------------------------------------------------

async fn sse_open(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
) -> Response {
    serve_sse(&state, &headers, None, None, None).await
}

async fn sse_open_scoped(
    State(state): State<Arc<HttpState>>,
    Path(scope): Path<String>,
    headers: HeaderMap,
) -> Response {
    serve_sse(&state, &headers, None, Some(scope), None).await
}

async fn sse_open_sub(
    State(state): State<Arc<HttpState>>,
    Path((scope, sub)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    serve_sse(&state, &headers, None, Some(scope), Some(sub)).await
}

async fn user_sse_open(
    State(state): State<Arc<HttpState>>,
    Path(user): Path<String>,
    headers: HeaderMap,
) -> Response {
    serve_sse(&state, &headers, Some(user), None, None).await
}

async fn user_sse_open_scoped(
    State(state): State<Arc<HttpState>>,
    Path((user, scope)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    serve_sse(&state, &headers, Some(user), Some(scope), None).await
}

async fn user_sse_open_sub(
    State(state): State<Arc<HttpState>>,
    Path((user, scope, sub)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Response {
    serve_sse(&state, &headers, Some(user), Some(scope), Some(sub)).await
}

/// Removes the session when the response stream is dropped.
struct SessionGuard {
    sessions: Arc<SessionManager>,
    id: Uuid,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.sessions.remove(&self.id);
    }
}

async fn serve_sse(
    state: &Arc<HttpState>,
    headers: &HeaderMap,
    user: Option<String>,
    segment: Option<String>,
    sub: Option<String>,
) -> Response {
    let scope = match admit(state, headers, user.as_deref(), segment.as_deref(), sub.as_deref()) {
        Ok(scope) => scope,
        Err(response) => return response,
    };

    let session = match state.sessions.create(SessionKind::Sse, scope, user.clone()) {
        Ok(session) => session,
        Err(e) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    };
    let Some(rx) = session.take_stream() else {
        return (StatusCode::INTERNAL_SERVER_ERROR, "session stream unavailable").into_response();
    };
    spawn_notification_forwarder(state, session.clone());
    spawn_dispatch_worker(state, session.clone());

    let prefix = match &user {
        Some(user) => format!("{}/{user}", state.base_path.trim_end_matches('/')),
        None => state.base_path.trim_end_matches('/').to_string(),
    };
    let messages_url = format!("{prefix}/messages?sessionId={}", session.id);

    let endpoint = Event::default().event("endpoint").data(messages_url);
    let stream = futures::stream::iter([Ok::<Event, Infallible>(endpoint)])
        .chain(message_event_stream(rx, SessionGuard {
            sessions: state.sessions.clone(),
            id: session.id,
        }));

    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(KEEPALIVE_INTERVAL))
        .into_response()
}

fn message_event_stream<G: Send + 'static>(
    mut rx: tokio::sync::mpsc::Receiver<ServerJsonRpcMessage>,
    guard: G,
) -> impl Stream<Item = Result<Event, Infallible>> {
    futures::stream::poll_fn(move |cx| {
        // The guard lives as long as the stream; dropping the response body
        // tears the session down.
        let _ = &guard;
        rx.poll_recv(cx).map(|next| {
            next.map(|message| {
                let payload = serde_json::to_string(&message).unwrap_or_default();
                Ok(Event::default().event("message").data(payload))
            })
        })
    })
}

#[derive(Deserialize)]
struct MessagesQuery {
    #[serde(rename = "sessionId")]
    session_id: Uuid,
}

async fn messages_post(
    State(state): State<Arc<HttpState>>,
    Query(query): Query<MessagesQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_messages_post(&state, query, &headers, &body).await
}

async fn user_messages_post(
    State(state): State<Arc<HttpState>>,
    Path(_user): Path<String>,
    Query(query): Query<MessagesQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_messages_post(&state, query, &headers, &body).await
}

async fn handle_messages_post(
    state: &Arc<HttpState>,
    query: MessagesQuery,
    headers: &HeaderMap,
    body: &Bytes,
) -> Response {
    let Some(session) = state.sessions.get(&query.session_id) else {
        return (StatusCode::NOT_FOUND, "session not found").into_response();
    };

    let settings = state.store.current();
    let routing = &settings.system_config_for(session.user.as_deref()).routing;
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if authorize(&settings, routing, authorization, session.user.as_deref()).is_err() {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }

    let message = match parse_client_message(body) {
        Ok(message) => message,
        Err(response) => return response,
    };

    // The reply travels over the session's event stream, not this response.
    // The worker preserves per-session arrival order toward upstreams.
    if !session.enqueue(header_snapshot(headers), message) {
        return (StatusCode::GONE, "session is closing").into_response();
    }

    StatusCode::ACCEPTED.into_response()
}

// ---------------------------------------------------------------------------
// Streamable HTTP transport
// ---------------------------------------------------------------------------

async fn mcp_post(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    serve_mcp_post(&state, &headers, None, None, None, &body).await
}

async fn mcp_post_scoped(
    State(state): State<Arc<HttpState>>,
    Path(scope): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    serve_mcp_post(&state, &headers, None, Some(scope), None, &body).await
}

async fn mcp_post_sub(
    State(state): State<Arc<HttpState>>,
    Path((scope, sub)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    serve_mcp_post(&state, &headers, None, Some(scope), Some(sub), &body).await
}

async fn user_mcp_post(
    State(state): State<Arc<HttpState>>,
    Path(user): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    serve_mcp_post(&state, &headers, Some(user), None, None, &body).await
}

async fn user_mcp_post_scoped(
    State(state): State<Arc<HttpState>>,
    Path((user, scope)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    serve_mcp_post(&state, &headers, Some(user), Some(scope), None, &body).await
}

async fn serve_mcp_post(
    state: &Arc<HttpState>,
    headers: &HeaderMap,
    user: Option<String>,
    segment: Option<String>,
    sub: Option<String>,
    body: &Bytes,
) -> Response {
    let message = match parse_client_message(body) {
        Ok(message) => message,
        Err(response) => return response,
    };

    let session_header = headers
        .get(SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    match session_header {
        None => {
            // The first POST without a session id must be `initialize`.
            if !is_initialize(&message) {
                return (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "Unexpected message, expect initialize request",
                )
                    .into_response();
            }
            let scope = match admit(
                state,
                headers,
                user.as_deref(),
                segment.as_deref(),
                sub.as_deref(),
            ) {
                Ok(scope) => scope,
                Err(response) => return response,
            };
            let session = match state
                .sessions
                .create(SessionKind::StreamableHttp, scope, user)
            {
                Ok(session) => session,
                Err(e) => {
                    return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
                }
            };
            let snapshot = header_snapshot(headers);
            let reply = state
                .dispatcher
                .handle_message(&session, snapshot, message)
                .await;
            match reply {
                Some(reply) => sse_single_message(&reply, Some(&session.id.to_string())),
                None => StatusCode::ACCEPTED.into_response(),
            }
        }
        Some(raw_id) => {
            let Some(session) = raw_id
                .parse::<Uuid>()
                .ok()
                .and_then(|id| state.sessions.get(&id))
            else {
                return (StatusCode::NOT_FOUND, "session not found").into_response();
            };

            let settings = state.store.current();
            let routing = &settings.system_config_for(session.user.as_deref()).routing;
            let authorization = headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok());
            if authorize(&settings, routing, authorization, session.user.as_deref()).is_err() {
                return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
            }

            let snapshot = header_snapshot(headers);
            match state
                .dispatcher
                .handle_message(&session, snapshot, message)
                .await
            {
                Some(reply) => sse_single_message(&reply, None),
                None => StatusCode::ACCEPTED.into_response(),
            }
        }
    }
}

/// Open the server-push stream for an existing streamable-HTTP session.
async fn mcp_get(State(state): State<Arc<HttpState>>, headers: HeaderMap) -> Response {
    let Some(session) = headers
        .get(SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| raw.parse::<Uuid>().ok())
        .and_then(|id| state.sessions.get(&id))
    else {
        return (
            StatusCode::UNAUTHORIZED,
            "Unauthorized: Session ID is required",
        )
            .into_response();
    };
    session.touch();

    // Server push only; responses to POSTed requests travel on their own
    // response bodies. The stream can be attached once per session.
    let Some(rx) = session.take_stream() else {
        return (StatusCode::CONFLICT, "stream already open").into_response();
    };
    spawn_notification_forwarder(&state, session.clone());

    // Dropping this stream ends the push channel but keeps the session
    // alive; it is closed by DELETE or the idle reaper.
    let stream = message_event_stream(rx, ());
    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(KEEPALIVE_INTERVAL))
        .into_response()
}

async fn mcp_delete(State(state): State<Arc<HttpState>>, headers: HeaderMap) -> Response {
    let Some(id) = headers
        .get(SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| raw.parse::<Uuid>().ok())
    else {
        return (
            StatusCode::UNAUTHORIZED,
            "Unauthorized: Session ID is required",
        )
            .into_response();
    };
    state.sessions.remove(&id);
    StatusCode::NO_CONTENT.into_response()
}

// ---------------------------------------------------------------------------
// OAuth callback and proxy endpoints
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct CallbackQuery {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

async fn oauth_callback(
    State(state): State<Arc<HttpState>>,
    Query(query): Query<CallbackQuery>,
) -> Response {
    if let Some(error) = query.error {
        let detail = query.error_description.unwrap_or_default();
        return (
            StatusCode::BAD_REQUEST,
            Html(callback_page(
                "Authorization failed",
                &format!("The identity provider rejected the request: {error} {detail}"),
                false,
            )),
        )
            .into_response();
    }

    let (Some(code), Some(oauth_state)) = (query.code, query.state) else {
        return (
            StatusCode::BAD_REQUEST,
            Html(callback_page(
                "Authorization failed",
                "The callback is missing its code or state parameter.",
                false,
            )),
        )
            .into_response();
    };

    match state.oauth.handle_callback(&oauth_state, &code).await {
        Ok(server) => Html(callback_page(
            "Authorization complete",
            &format!("Server '{server}' is now authorized. This window closes automatically."),
            true,
        ))
        .into_response(),
        Err(HubError::NotFound(message) | HubError::InvalidParams(message)) => (
            StatusCode::BAD_REQUEST,
            Html(callback_page("Authorization failed", &message, false)),
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "oauth callback failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Html(callback_page(
                    "Authorization failed",
                    "Token exchange failed; check the hub logs.",
                    false,
                )),
            )
                .into_response()
        }
    }
}

fn callback_page(heading: &str, detail: &str, success: bool) -> String {
    let script = if success {
        "<script>setTimeout(function () { window.close(); }, 3000);</script>"
    } else {
        ""
    };
    format!(
        "<!DOCTYPE html><html><head><title>MCPHub OAuth</title></head>\
         <body style=\"font-family: sans-serif; margin: 4em auto; max-width: 32em;\">\
         <h1>{heading}</h1><p>{detail}</p>{script}</body></html>"
    )
}

fn provider_config(state: &HttpState) -> Option<crate::settings::OAuthProviderConfig> {
    let settings = state.store.current();
    settings
        .system_config
        .oauth
        .clone()
        .filter(|cfg| cfg.enabled && !cfg.issuer.is_empty())
}

async fn oauth_metadata(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
) -> Response {
    let Some(config) = provider_config(&state) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    let base = state.base_path.trim_end_matches('/');
    Json(serde_json::json!({
        "issuer": config.issuer,
        "authorization_endpoint": format!("http://{host}{base}/authorize"),
        "token_endpoint": format!("http://{host}{base}/token"),
        "response_types_supported": ["code"],
        "grant_types_supported": ["authorization_code", "refresh_token"],
        "code_challenge_methods_supported": ["S256"],
    }))
    .into_response()
}

async fn oauth_authorize(
    State(state): State<Arc<HttpState>>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let Some(config) = provider_config(&state) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let endpoint = config
        .authorization_endpoint
        .unwrap_or_else(|| format!("{}/authorize", config.issuer.trim_end_matches('/')));
    let Ok(mut url) = reqwest::Url::parse(&endpoint) else {
        return (StatusCode::BAD_GATEWAY, "invalid issuer authorization endpoint")
            .into_response();
    };
    url.query_pairs_mut().extend_pairs(query.iter());
    Redirect::temporary(url.as_str()).into_response()
}

async fn oauth_token(
    State(state): State<Arc<HttpState>>,
    body: Bytes,
) -> Response {
    let Some(config) = provider_config(&state) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let endpoint = config
        .token_endpoint
        .unwrap_or_else(|| format!("{}/token", config.issuer.trim_end_matches('/')));

    let client = reqwest::Client::new();
    let result = client
        .post(&endpoint)
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(body.to_vec())
        .send()
        .await;
    match result {
        Ok(upstream) => {
            let status =
                StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
            let payload = upstream.bytes().await.unwrap_or_default();
            (
                status,
                [(header::CONTENT_TYPE, "application/json")],
                payload.to_vec(),
            )
                .into_response()
        }
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            format!("token endpoint unreachable: {e}"),
        )
            .into_response(),
    }
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

fn parse_client_message(body: &Bytes) -> Result<ClientJsonRpcMessage, Response> {
    let value: serde_json::Value = serde_json::from_slice(body).map_err(|e| {
        (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            format!("invalid json: {e}"),
        )
            .into_response()
    })?;
    serde_json::from_value(value).map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            format!("invalid MCP JSON-RPC message shape: {e}"),
        )
            .into_response()
    })
}

fn is_initialize(message: &ClientJsonRpcMessage) -> bool {
    matches!(
        message,
        ClientJsonRpcMessage::Request(JsonRpcRequest {
            request: ClientRequest::InitializeRequest(_),
            ..
        })
    )
}

/// One-message SSE response body, used by the streamable-HTTP endpoint.
fn sse_single_message(message: &ServerJsonRpcMessage, session_id: Option<&str>) -> Response {
    let payload = serde_json::to_string(message).unwrap_or_default();
    let body = format!("event: message\ndata: {payload}\n\n");
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream");
    if let Some(id) = session_id {
        builder = builder.header(SESSION_ID_HEADER, id);
    }
    builder
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Drain the session's ingress queue in arrival order. Notifications
/// (including `notifications/cancelled`, which must never queue behind the
/// request it targets) are handled inline; requests run concurrently and
/// push their replies onto the event stream.
fn spawn_dispatch_worker(state: &Arc<HttpState>, session: Arc<DownstreamSession>) {
    let Some(mut work) = session.attach_worker() else {
        return;
    };
    let dispatcher = state.dispatcher.clone();
    tokio::spawn(async move {
        loop {
            let (headers, message) = tokio::select! {
                () = session.cancellation.cancelled() => break,
                received = work.recv() => match received {
                    Some(item) => item,
                    None => break,
                },
            };
            if matches!(message, ClientJsonRpcMessage::Notification(_)) {
                let _ = dispatcher.handle_message(&session, headers, message).await;
                continue;
            }
            let dispatcher = dispatcher.clone();
            let session = session.clone();
            tokio::spawn(async move {
                if let Some(reply) = dispatcher.handle_message(&session, headers, message).await {
                    let _ = session.push(reply).await;
                }
            });
        }
    });
}

/// Fan upstream notifications into a session's push channel, honouring
/// scope membership and progress ownership.
fn spawn_notification_forwarder(state: &Arc<HttpState>, session: Arc<DownstreamSession>) {
    let store = state.store.clone();
    let dispatcher = state.dispatcher.clone();
    let mut events = state.events.subscribe();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                () = session.cancellation.cancelled() => break,
                received = events.recv() => match received {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(session_id = %session.id, skipped, "notification stream lagged");
                        continue;
                    }
                },
            };
            match event {
                UpstreamEvent::Notification(envelope) => {
                    let settings = store.current();
                    if dispatcher.should_forward(&settings, &session, &envelope)
                        && let Some(message) = notification_message(&envelope)
                    {
                        let _ = session.push(message).await;
                    }
                }
                UpstreamEvent::CatalogChanged { server } => {
                    let settings = store.current();
                    if session.scope.includes_server(&settings, &server) {
                        for kind in ["tools", "prompts", "resources"] {
                            if let Some(message) = list_changed_message(kind) {
                                let _ = session.push(message).await;
                            }
                        }
                    }
                }
                UpstreamEvent::CatalogDirty { .. } | UpstreamEvent::StatusChanged { .. } => {}
            }
        }
    });
}
