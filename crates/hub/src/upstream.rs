//! One upstream client: transport construction, lifecycle state, and
//! request execution.
//!
//! A client is a stable handle: the registry replaces it atomically on
//! reconnect, and holders must tolerate a `Disconnected` status at any time.
//! Calls to distinct upstreams run fully parallel; requests to the same
//! upstream are multiplexed by JSON-RPC id by the underlying service.

use crate::error::{HubError, Result};
use crate::sessions::RequestContext;
use crate::settings::{ServerConfig, TransportConfig};
use chrono::{DateTime, Utc};
use mcphub_openapi_tools::OpenApiBackend;
use parking_lot::RwLock;
use rmcp::{
    ClientHandler, RoleClient,
    model::{
        CallToolRequestParam, CallToolResult, ClientInfo, Content, GetPromptRequestParam,
        GetPromptResult, Implementation, LoggingMessageNotificationParam,
        ProgressNotificationParam, Prompt, ReadResourceRequestParam, ReadResourceResult,
        Resource, ResourceUpdatedNotificationParam, ServerResult, Tool,
    },
    service::{PeerRequestOptions, RunningService, ServiceError, ServiceExt as _},
    transport::TokioChildProcess,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast};

pub type JsonObject = serde_json::Map<String, serde_json::Value>;

/// Lifecycle state of an upstream client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientStatus {
    Connecting,
    Connected,
    Disconnected { last_error: String },
    OauthRequired { authorization_url: Option<String> },
}

impl ClientStatus {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected { .. } => "disconnected",
            Self::OauthRequired { .. } => "oauth_required",
        }
    }
}

/// An upstream-originated notification, re-encoded for downstream fan-out.
#[derive(Debug, Clone)]
pub struct NotificationEnvelope {
    pub server: String,
    pub method: String,
    pub params: serde_json::Value,
}

impl NotificationEnvelope {
    /// The `_meta.progressToken` equivalent carried by progress
    /// notifications; used to route progress to the owning session.
    #[must_use]
    pub fn progress_token(&self) -> Option<String> {
        match self.params.get("progressToken") {
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(serde_json::Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Events published by upstream clients onto the hub-wide bus.
#[derive(Debug, Clone)]
pub enum UpstreamEvent {
    /// The upstream signalled `list_changed`; its cached catalog is stale
    /// and must be re-fetched.
    CatalogDirty { server: String },
    /// The cached catalog was refreshed; listings and the vector index can
    /// be rebuilt from it.
    CatalogChanged { server: String },
    /// The client's lifecycle status changed.
    StatusChanged { server: String },
    /// A notification to fan out to downstream sessions.
    Notification(NotificationEnvelope),
}

pub type EventSender = broadcast::Sender<UpstreamEvent>;

type McpClient = RunningService<RoleClient, HubClientHandler>;

enum Connection {
    Mcp(McpClient),
    OpenApi(Arc<OpenApiBackend>),
}

/// The rmcp client handler: forwards upstream notifications onto the hub
/// event bus and triggers catalog refreshes on `list_changed`.
#[derive(Clone)]
pub struct HubClientHandler {
    server: String,
    events: EventSender,
}

impl HubClientHandler {
    fn notify(&self, method: &'static str, params: serde_json::Value) {
        let _ = self.events.send(UpstreamEvent::Notification(NotificationEnvelope {
            server: self.server.clone(),
            method: method.to_string(),
            params,
        }));
    }

    fn catalog_dirty(&self) {
        let _ = self.events.send(UpstreamEvent::CatalogDirty {
            server: self.server.clone(),
        });
    }
}

impl ClientHandler for HubClientHandler {
    fn get_info(&self) -> ClientInfo {
        ClientInfo {
            client_info: Implementation {
                name: "mcphub".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn on_progress(
        &self,
        params: ProgressNotificationParam,
        _context: rmcp::service::NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        self.notify(
            "notifications/progress",
            serde_json::to_value(params).unwrap_or_default(),
        );
        std::future::ready(())
    }

    fn on_logging_message(
        &self,
        params: LoggingMessageNotificationParam,
        _context: rmcp::service::NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        self.notify(
            "notifications/message",
            serde_json::to_value(params).unwrap_or_default(),
        );
        std::future::ready(())
    }

    fn on_resource_updated(
        &self,
        params: ResourceUpdatedNotificationParam,
        _context: rmcp::service::NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        self.notify(
            "notifications/resources/updated",
            serde_json::to_value(params).unwrap_or_default(),
        );
        std::future::ready(())
    }

    fn on_tool_list_changed(
        &self,
        _context: rmcp::service::NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        self.catalog_dirty();
        std::future::ready(())
    }

    fn on_prompt_list_changed(
        &self,
        _context: rmcp::service::NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        self.catalog_dirty();
        std::future::ready(())
    }

    fn on_resource_list_changed(
        &self,
        _context: rmcp::service::NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        self.catalog_dirty();
        std::future::ready(())
    }
}

/// A single upstream server connection plus its cached catalog.
pub struct UpstreamClient {
    name: String,
    config: ServerConfig,
    status: RwLock<ClientStatus>,
    tools: RwLock<Vec<Tool>>,
    prompts: RwLock<Vec<Prompt>>,
    resources: RwLock<Vec<Resource>>,
    connection: Mutex<Option<Connection>>,
    connected_at: RwLock<Option<DateTime<Utc>>>,
    events: EventSender,
    http: reqwest::Client,
}

impl UpstreamClient {
    #[must_use]
    pub fn new(
        name: String,
        config: ServerConfig,
        events: EventSender,
        http: reqwest::Client,
    ) -> Self {
        Self {
            name,
            config,
            status: RwLock::new(ClientStatus::Connecting),
            tools: RwLock::new(Vec::new()),
            prompts: RwLock::new(Vec::new()),
            resources: RwLock::new(Vec::new()),
            connection: Mutex::new(None),
            connected_at: RwLock::new(None),
            events,
            http,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    #[must_use]
    pub fn status(&self) -> ClientStatus {
        self.status.read().clone()
    }

    #[must_use]
    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        *self.connected_at.read()
    }

    #[must_use]
    pub fn tools(&self) -> Vec<Tool> {
        self.tools.read().clone()
    }

    #[must_use]
    pub fn prompts(&self) -> Vec<Prompt> {
        self.prompts.read().clone()
    }

    #[must_use]
    pub fn resources(&self) -> Vec<Resource> {
        self.resources.read().clone()
    }

    #[cfg(test)]
    pub(crate) fn set_catalog_for_tests(&self, tools: Vec<Tool>, prompts: Vec<Prompt>) {
        *self.tools.write() = tools;
        *self.prompts.write() = prompts;
        *self.status.write() = ClientStatus::Connected;
    }

    pub fn set_status(&self, status: ClientStatus) {
        let changed = {
            let mut slot = self.status.write();
            let changed = *slot != status;
            *slot = status;
            changed
        };
        if changed {
            let _ = self.events.send(UpstreamEvent::StatusChanged {
                server: self.name.clone(),
            });
        }
    }

    /// Establish the transport, run the MCP handshake, and populate the
    /// catalog. `bearer` is the OAuth access token when the server uses one.
    ///
    /// # Errors
    ///
    /// Transport and handshake failures; the status is left `Disconnected`
    /// (or `OauthRequired` upstream of this call).
    pub async fn connect(&self, bearer: Option<&str>) -> Result<()> {
        self.set_status(ClientStatus::Connecting);

        let result = match &self.config.transport {
            TransportConfig::Stdio { command, args, env } => {
                self.connect_stdio(command, args, env).await
            }
            TransportConfig::Sse { url, headers } => {
                self.connect_sse(url, headers, bearer).await
            }
            TransportConfig::StreamableHttp { url, headers } => {
                self.connect_streamable_http(url, headers, bearer).await
            }
            TransportConfig::Openapi { openapi } => self.connect_openapi(openapi.clone()).await,
        };

        match result {
            Ok(()) => {
                *self.connected_at.write() = Some(Utc::now());
                self.set_status(ClientStatus::Connected);
                let _ = self.events.send(UpstreamEvent::CatalogChanged {
                    server: self.name.clone(),
                });
                tracing::info!(
                    server = %self.name,
                    transport = self.config.transport.kind(),
                    tools = self.tools.read().len(),
                    "upstream connected"
                );
                Ok(())
            }
            Err(e) => {
                self.mark_disconnected(&e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn connect_stdio(
        &self,
        command: &str,
        args: &[String],
        env: &std::collections::HashMap<String, String>,
    ) -> Result<()> {
        let mut cmd = tokio::process::Command::new(command);
        cmd.args(args);
        for (key, value) in env {
            cmd.env(key, value);
        }

        let transport = TokioChildProcess::new(cmd).map_err(|e| {
            HubError::upstream_unavailable(&self.name, format!("failed to spawn '{command}': {e}"))
        })?;

        let handler = self.handler();
        let client = handler.serve(transport).await.map_err(|e| {
            HubError::upstream_unavailable(&self.name, format!("stdio handshake failed: {e}"))
        })?;
        self.install_mcp_client(client).await
    }

    async fn connect_sse(
        &self,
        url: &str,
        headers: &std::collections::HashMap<String, String>,
        bearer: Option<&str>,
    ) -> Result<()> {
        use rmcp::transport::SseClientTransport;
        use rmcp::transport::sse_client::SseClientConfig;

        let client = self.build_http_client(headers, bearer)?;
        let sse_config = SseClientConfig {
            sse_endpoint: Arc::from(url),
            ..Default::default()
        };
        let transport = SseClientTransport::start_with_client(client, sse_config)
            .await
            .map_err(|e| self.classify_transport_error(format!("SSE connection failed: {e}")))?;

        let handler = self.handler();
        let client = handler.serve(transport).await.map_err(|e| {
            self.classify_transport_error(format!("SSE handshake failed: {e}"))
        })?;
        self.install_mcp_client(client).await
    }

    async fn connect_streamable_http(
        &self,
        url: &str,
        headers: &std::collections::HashMap<String, String>,
        bearer: Option<&str>,
    ) -> Result<()> {
        use rmcp::transport::StreamableHttpClientTransport;
        use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;

        let client = self.build_http_client(headers, bearer)?;
        let transport_config = StreamableHttpClientTransportConfig::with_uri(url.to_string());
        let transport = StreamableHttpClientTransport::with_client(client, transport_config);

        let handler = self.handler();
        let client = handler.serve(transport).await.map_err(|e| {
            self.classify_transport_error(format!("streamable HTTP handshake failed: {e}"))
        })?;
        self.install_mcp_client(client).await
    }

    async fn connect_openapi(&self, config: mcphub_openapi_tools::OpenApiConfig) -> Result<()> {
        let backend = OpenApiBackend::load(config, self.http.clone())
            .await
            .map_err(|e| HubError::upstream_unavailable(&self.name, e.to_string()))?;

        let tools: Vec<Tool> = backend
            .tools()
            .iter()
            .map(|t| {
                let schema = t
                    .input_schema
                    .as_object()
                    .cloned()
                    .unwrap_or_default();
                Tool::new(
                    t.name.clone(),
                    t.description.clone().unwrap_or_default(),
                    Arc::new(schema),
                )
            })
            .collect();

        *self.tools.write() = tools;
        *self.prompts.write() = Vec::new();
        *self.resources.write() = Vec::new();
        *self.connection.lock().await = Some(Connection::OpenApi(Arc::new(backend)));
        Ok(())
    }

    fn handler(&self) -> HubClientHandler {
        HubClientHandler {
            server: self.name.clone(),
            events: self.events.clone(),
        }
    }

    fn build_http_client(
        &self,
        headers: &std::collections::HashMap<String, String>,
        bearer: Option<&str>,
    ) -> Result<reqwest::Client> {
        let mut map = reqwest::header::HeaderMap::new();
        for (key, value) in headers {
            if let (Ok(name), Ok(val)) = (
                reqwest::header::HeaderName::from_bytes(key.as_bytes()),
                reqwest::header::HeaderValue::from_str(value),
            ) {
                map.insert(name, val);
            } else {
                tracing::warn!(server = %self.name, header = %key, "skipping invalid header");
            }
        }
        if let Some(token) = bearer
            && let Ok(val) = reqwest::header::HeaderValue::from_str(&format!("Bearer {token}"))
        {
            map.insert(reqwest::header::AUTHORIZATION, val);
        }
        reqwest::Client::builder()
            .default_headers(map)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| HubError::Internal(format!("failed to build HTTP client: {e}")))
    }

    async fn install_mcp_client(&self, client: McpClient) -> Result<()> {
        // Discover the catalog before exposing the connection. Servers
        // without prompt/resource support answer with METHOD_NOT_FOUND;
        // those surfaces stay empty.
        let tools = client.list_all_tools().await.map_err(|e| {
            HubError::upstream_unavailable(&self.name, format!("tools/list failed: {e}"))
        })?;
        let prompts = client.list_all_prompts().await.unwrap_or_default();
        let resources = client.list_all_resources().await.unwrap_or_default();

        *self.tools.write() = tools;
        *self.prompts.write() = prompts;
        *self.resources.write() = resources;
        *self.connection.lock().await = Some(Connection::Mcp(client));
        Ok(())
    }

    /// Re-fetch the catalog after an upstream `list_changed` notification.
    ///
    /// # Errors
    ///
    /// Fails when the client is not connected.
    pub async fn refresh_catalog(&self) -> Result<()> {
        let peer = self.peer().await?;
        let tools = peer.list_all_tools().await.map_err(|e| {
            HubError::upstream_unavailable(&self.name, format!("tools/list failed: {e}"))
        })?;
        let prompts = peer.list_all_prompts().await.unwrap_or_default();
        let resources = peer.list_all_resources().await.unwrap_or_default();
        *self.tools.write() = tools;
        *self.prompts.write() = prompts;
        *self.resources.write() = resources;
        let _ = self.events.send(UpstreamEvent::CatalogChanged {
            server: self.name.clone(),
        });
        Ok(())
    }

    /// Close the transport and discard the connection. The child process of
    /// a stdio upstream is reaped by the transport on drop.
    pub async fn disconnect(&self) {
        let connection = self.connection.lock().await.take();
        if let Some(Connection::Mcp(client)) = connection
            && let Err(e) = client.cancel().await
        {
            tracing::debug!(server = %self.name, error = %e, "error while closing upstream");
        }
    }

    async fn mark_disconnected(&self, reason: &str) {
        tracing::warn!(server = %self.name, error = %reason, "upstream disconnected");
        self.disconnect().await;
        *self.tools.write() = Vec::new();
        *self.prompts.write() = Vec::new();
        *self.resources.write() = Vec::new();
        self.set_status(ClientStatus::Disconnected {
            last_error: reason.to_string(),
        });
    }

    fn classify_transport_error(&self, message: String) -> HubError {
        if error_indicates_unauthorized(&message) {
            HubError::AuthRequired {
                server: self.name.clone(),
                authorization_url: None,
            }
        } else {
            HubError::upstream_unavailable(&self.name, message)
        }
    }

    async fn peer(&self) -> Result<rmcp::service::Peer<RoleClient>> {
        let connection = self.connection.lock().await;
        match connection.as_ref() {
            Some(Connection::Mcp(client)) => Ok(client.peer().clone()),
            Some(Connection::OpenApi(_)) => Err(HubError::Internal(format!(
                "'{}' is an openapi upstream with no MCP peer",
                self.name
            ))),
            None => Err(self.unavailable_error()),
        }
    }

    fn unavailable_error(&self) -> HubError {
        match self.status() {
            ClientStatus::OauthRequired { authorization_url } => HubError::AuthRequired {
                server: self.name.clone(),
                authorization_url,
            },
            ClientStatus::Disconnected { last_error } => {
                HubError::upstream_unavailable(&self.name, last_error)
            }
            _ => HubError::upstream_unavailable(&self.name, "not connected"),
        }
    }

    /// Forward a `tools/call` to this upstream.
    ///
    /// # Errors
    ///
    /// `UpstreamUnavailable`/`AuthRequired` when not connected, `Timeout`
    /// when the deadline lapses, `Upstream` for forwarded JSON-RPC errors.
    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: Option<JsonObject>,
        ctx: &RequestContext,
    ) -> Result<CallToolResult> {
        let openapi = {
            let connection = self.connection.lock().await;
            match connection.as_ref() {
                Some(Connection::OpenApi(backend)) => Some(backend.clone()),
                Some(Connection::Mcp(_)) => None,
                None => return Err(self.unavailable_error()),
            }
        };

        if let Some(backend) = openapi {
            return self.call_openapi_tool(&backend, tool, arguments, ctx).await;
        }

        let request = rmcp::model::ClientRequest::CallToolRequest(rmcp::model::CallToolRequest {
            method: rmcp::model::CallToolRequestMethod,
            params: CallToolRequestParam {
                name: tool.to_string().into(),
                arguments,
            },
            extensions: rmcp::model::Extensions::default(),
        });

        match self.send_request(request, ctx).await? {
            ServerResult::CallToolResult(result) => Ok(result),
            other => Err(HubError::Internal(format!(
                "unexpected response type for tools/call: {other:?}"
            ))),
        }
    }

    async fn call_openapi_tool(
        &self,
        backend: &OpenApiBackend,
        tool: &str,
        arguments: Option<JsonObject>,
        ctx: &RequestContext,
    ) -> Result<CallToolResult> {
        let args = arguments.unwrap_or_default();
        let outcome = backend
            .call(tool, &args, &ctx.headers)
            .await
            .map_err(|e| match e {
                mcphub_openapi_tools::OpenApiError::UnknownOperation(op) => {
                    HubError::NotFound(format!("Tool not found: {op}"))
                }
                other => HubError::upstream_unavailable(&self.name, other.to_string()),
            })?;

        let text = match &outcome.body {
            serde_json::Value::String(s) => s.clone(),
            other => serde_json::to_string_pretty(other).unwrap_or_default(),
        };
        if outcome.is_error {
            Ok(CallToolResult::error(vec![Content::text(format!(
                "HTTP {}: {text}",
                outcome.status
            ))]))
        } else {
            Ok(CallToolResult::success(vec![Content::text(text)]))
        }
    }

    /// Forward a `prompts/get` to this upstream.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Self::call_tool`].
    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
        ctx: &RequestContext,
    ) -> Result<GetPromptResult> {
        let request = rmcp::model::ClientRequest::GetPromptRequest(rmcp::model::GetPromptRequest {
            method: rmcp::model::GetPromptRequestMethod,
            params: GetPromptRequestParam {
                name: name.to_string(),
                arguments,
            },
            extensions: rmcp::model::Extensions::default(),
        });

        match self.send_request(request, ctx).await? {
            ServerResult::GetPromptResult(result) => Ok(result),
            other => Err(HubError::Internal(format!(
                "unexpected response type for prompts/get: {other:?}"
            ))),
        }
    }

    /// Forward a `resources/read` to this upstream.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Self::call_tool`].
    pub async fn read_resource(&self, uri: &str, ctx: &RequestContext) -> Result<ReadResourceResult> {
        let request =
            rmcp::model::ClientRequest::ReadResourceRequest(rmcp::model::ReadResourceRequest {
                method: rmcp::model::ReadResourceRequestMethod,
                params: ReadResourceRequestParam {
                    uri: uri.to_string(),
                },
                extensions: rmcp::model::Extensions::default(),
            });

        match self.send_request(request, ctx).await? {
            ServerResult::ReadResourceResult(result) => Ok(result),
            other => Err(HubError::Internal(format!(
                "unexpected response type for resources/read: {other:?}"
            ))),
        }
    }

    /// Send one request with the configured timeout policy.
    ///
    /// The base deadline is `options.timeoutMs`; with
    /// `resetTimeoutOnProgress` the deadline slides forward on every
    /// progress notification carrying our token, bounded by
    /// `maxTotalTimeoutMs`. Cancellation (session close or explicit
    /// `$/cancelRequest`) abandons the in-flight correlation.
    async fn send_request(
        &self,
        request: rmcp::model::ClientRequest,
        ctx: &RequestContext,
    ) -> Result<ServerResult> {
        let peer = self.peer().await?;

        let options = &self.config.options;
        let base = Duration::from_millis(options.timeout_ms.max(1));
        let hard = options.max_total_timeout_ms.map(Duration::from_millis);
        let reset_on_progress = options.reset_timeout_on_progress;

        let meta = ctx.progress_token.as_ref().map(|token| {
            let mut meta = rmcp::model::Meta::default();
            meta.insert(
                "progressToken".to_string(),
                serde_json::Value::String(token.clone()),
            );
            meta
        });

        // Without progress-based extension the service enforces the deadline
        // itself; otherwise it only enforces the hard ceiling and the idle
        // timer below does the rest.
        let service_timeout = if reset_on_progress {
            hard
        } else {
            Some(match hard {
                Some(h) => base.min(h),
                None => base,
            })
        };

        let started = std::time::Instant::now();
        let handle = peer
            .send_cancellable_request(
                request,
                PeerRequestOptions {
                    timeout: service_timeout,
                    meta,
                },
            )
            .await
            .map_err(|e| self.map_service_error(e, started))?;

        let mut events = self.events.subscribe();
        let token = ctx.progress_token.clone();
        let response = handle.await_response();
        tokio::pin!(response);

        let mut idle_deadline = tokio::time::Instant::now() + base;
        loop {
            tokio::select! {
                result = &mut response => {
                    return match result {
                        Ok(value) => Ok(value),
                        Err(e) => {
                            let mapped = self.map_service_error(e, started);
                            match &mapped {
                                HubError::UpstreamUnavailable { .. } => {
                                    self.mark_disconnected(&mapped.to_string()).await;
                                }
                                // A 401 mid-session: park the client in
                                // oauth_required so the maintenance loop can
                                // drive a token refresh; this call fails
                                // with a retriable error.
                                HubError::AuthRequired { .. } => {
                                    self.disconnect().await;
                                    self.set_status(ClientStatus::OauthRequired {
                                        authorization_url: None,
                                    });
                                }
                                _ => {}
                            }
                            Err(mapped)
                        }
                    };
                }
                () = ctx.cancellation.cancelled() => {
                    return Err(HubError::Cancelled);
                }
                () = tokio::time::sleep_until(idle_deadline), if reset_on_progress => {
                    return Err(HubError::Timeout {
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    });
                }
                event = events.recv(), if reset_on_progress => {
                    if let Ok(UpstreamEvent::Notification(envelope)) = event
                        && envelope.server == self.name
                        && envelope.method == "notifications/progress"
                        && token.is_some()
                        && envelope.progress_token() == token
                    {
                        idle_deadline = tokio::time::Instant::now() + base;
                    }
                }
            }
        }
    }

    fn map_service_error(&self, error: ServiceError, started: std::time::Instant) -> HubError {
        match error {
            ServiceError::McpError(data) => {
                if error_indicates_unauthorized(&data.message) {
                    HubError::AuthRequired {
                        server: self.name.clone(),
                        authorization_url: None,
                    }
                } else {
                    HubError::Upstream(data)
                }
            }
            ServiceError::Timeout { .. } => HubError::Timeout {
                elapsed_ms: started.elapsed().as_millis() as u64,
            },
            ServiceError::TransportSend(_) | ServiceError::TransportClosed => {
                HubError::upstream_unavailable(&self.name, "transport closed")
            }
            other => HubError::Internal(format!("upstream request failed: {other}")),
        }
    }
}

/// Best-effort classification of authorization challenges surfaced as
/// transport errors (HTTP 401 with a `WWW-Authenticate` OAuth hint).
#[must_use]
pub fn error_indicates_unauthorized(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("401") || lower.contains("unauthorized") || lower.contains("invalid_token")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_labels_match_wire_values() {
        assert_eq!(ClientStatus::Connecting.label(), "connecting");
        assert_eq!(ClientStatus::Connected.label(), "connected");
        assert_eq!(
            ClientStatus::Disconnected {
                last_error: "x".to_string()
            }
            .label(),
            "disconnected"
        );
        assert_eq!(
            ClientStatus::OauthRequired {
                authorization_url: None
            }
            .label(),
            "oauth_required"
        );
    }

    #[test]
    fn unauthorized_classification() {
        assert!(error_indicates_unauthorized("server returned 401 Unauthorized"));
        assert!(error_indicates_unauthorized(
            "WWW-Authenticate: Bearer error=\"invalid_token\""
        ));
        assert!(!error_indicates_unauthorized("connection refused"));
    }

    #[test]
    fn progress_token_reads_string_and_number_forms() {
        let envelope = NotificationEnvelope {
            server: "s".to_string(),
            method: "notifications/progress".to_string(),
            params: serde_json::json!({ "progressToken": "req-1", "progress": 1 }),
        };
        assert_eq!(envelope.progress_token().as_deref(), Some("req-1"));

        let envelope = NotificationEnvelope {
            params: serde_json::json!({ "progressToken": 7 }),
            ..envelope
        };
        assert_eq!(envelope.progress_token().as_deref(), Some("7"));

        let envelope = NotificationEnvelope {
            params: serde_json::json!({ "progress": 1 }),
            ..envelope
        };
        assert_eq!(envelope.progress_token(), None);
    }
}
