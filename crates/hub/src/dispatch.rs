//! JSON-RPC request dispatch.
//!
//! Translates downstream methods into fan-out/fan-in upstream calls:
//! qualified-name resolution, group tool filters, smart-routing meta-tools,
//! per-request header context, and in-flight bookkeeping for cancellation
//! and progress routing.

use crate::error::{HubError, Result};
use crate::registry::UpstreamRegistry;
use crate::sessions::{DownstreamSession, RequestContext, RoutingScope};
use crate::settings::{Settings, SettingsStore};
use crate::upstream::{JsonObject, NotificationEnvelope};
use crate::vector::ToolIndex;
use parking_lot::Mutex;
use rmcp::model::{
    CallToolResult, ClientJsonRpcMessage, ClientNotification, ClientRequest, Content, ErrorData,
    GetMeta, Implementation, InitializeResult, JsonRpcError, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, JsonRpcVersion2_0, ListPromptsResult, ListResourcesResult, ListToolsResult,
    Prompt, RequestId, Resource, ServerCapabilities, ServerJsonRpcMessage, ServerResult, Tool,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const SEARCH_TOOLS: &str = "search_tools";
pub const CALL_TOOL: &str = "call_tool";

const SEARCH_LIMIT_DEFAULT: usize = 10;
const SEARCH_LIMIT_MAX: usize = 50;

/// Tracks in-flight requests: cancellation handles keyed by
/// `(session, request id)` and progress tokens mapped to the owning session.
#[derive(Default)]
pub struct InflightTable {
    by_request: Mutex<HashMap<(Uuid, String), CancellationToken>>,
    by_progress_token: Mutex<HashMap<String, Uuid>>,
}

impl InflightTable {
    fn register(
        &self,
        session: Uuid,
        request_id: &RequestId,
        token: CancellationToken,
        progress_token: Option<&str>,
    ) {
        self.by_request
            .lock()
            .insert((session, request_id.to_string()), token);
        if let Some(progress) = progress_token {
            self.by_progress_token
                .lock()
                .insert(progress.to_string(), session);
        }
    }

    fn clear(&self, session: Uuid, request_id: &RequestId, progress_token: Option<&str>) {
        self.by_request
            .lock()
            .remove(&(session, request_id.to_string()));
        if let Some(progress) = progress_token {
            self.by_progress_token.lock().remove(progress);
        }
    }

    /// Cancel one request by id (downstream `notifications/cancelled`).
    pub fn cancel(&self, session: Uuid, request_id: &RequestId) {
        if let Some(token) = self
            .by_request
            .lock()
            .remove(&(session, request_id.to_string()))
        {
            token.cancel();
        }
    }

    /// The session that owns an in-flight progress token, if any.
    #[must_use]
    pub fn session_for_progress(&self, progress_token: &str) -> Option<Uuid> {
        self.by_progress_token.lock().get(progress_token).copied()
    }
}

pub struct RequestDispatcher {
    store: Arc<SettingsStore>,
    registry: Arc<UpstreamRegistry>,
    index: Arc<ToolIndex>,
    inflight: Arc<InflightTable>,
}

impl RequestDispatcher {
    #[must_use]
    pub fn new(
        store: Arc<SettingsStore>,
        registry: Arc<UpstreamRegistry>,
        index: Arc<ToolIndex>,
    ) -> Self {
        Self {
            store,
            registry,
            index,
            inflight: Arc::new(InflightTable::default()),
        }
    }

    #[must_use]
    pub fn inflight(&self) -> Arc<InflightTable> {
        self.inflight.clone()
    }

    /// Handle one downstream JSON-RPC message. Requests yield a response;
    /// notifications and client responses yield `None`.
    pub async fn handle_message(
        &self,
        session: &Arc<DownstreamSession>,
        headers: HashMap<String, String>,
        message: ClientJsonRpcMessage,
    ) -> Option<ServerJsonRpcMessage> {
        session.touch();
        match message {
            ClientJsonRpcMessage::Request(JsonRpcRequest { id, request, .. }) => {
                Some(self.handle_request(session, headers, id, request).await)
            }
            ClientJsonRpcMessage::Notification(JsonRpcNotification { notification, .. }) => {
                if let ClientNotification::CancelledNotification(cancelled) = notification {
                    self.inflight.cancel(session.id, &cancelled.params.request_id);
                }
                None
            }
            // Client-originated responses (sampling/elicitation replies) are
            // outside the hub's surface.
            _ => None,
        }
    }

    async fn handle_request(
        &self,
        session: &Arc<DownstreamSession>,
        headers: HashMap<String, String>,
        request_id: RequestId,
        request: ClientRequest,
    ) -> ServerJsonRpcMessage {
        let settings = self.store.current();
        let mut ctx = RequestContext::for_session(session, headers);
        ctx.progress_token = extract_progress_token(&request)
            .or_else(|| Some(format!("mcphub-{}-{}", session.id, request_id)));

        self.inflight.register(
            session.id,
            &request_id,
            ctx.cancellation.clone(),
            ctx.progress_token.as_deref(),
        );

        let result = self
            .dispatch_request(&settings, &ctx, request)
            .await;

        self.inflight
            .clear(session.id, &request_id, ctx.progress_token.as_deref());

        match result {
            Ok(value) => response(request_id, value),
            Err(HubError::Cancelled) => {
                // The transport is gone or the client asked us to stop; a
                // response would be dropped anyway, but id correlation must
                // hold for the explicit-cancel case.
                error_response(request_id, HubError::Cancelled.to_error_data())
            }
            Err(e) => error_response(request_id, e.to_error_data()),
        }
    }

    async fn dispatch_request(
        &self,
        settings: &Settings,
        ctx: &RequestContext,
        request: ClientRequest,
    ) -> Result<ServerResult> {
        match request {
            ClientRequest::InitializeRequest(init) => Ok(ServerResult::InitializeResult(
                initialize_result(init.params.protocol_version.clone()),
            )),
            ClientRequest::PingRequest(_) => {
                Ok(ServerResult::EmptyResult(rmcp::model::EmptyResult {}))
            }
            ClientRequest::ListToolsRequest(_) => {
                let tools = self.tools_list(settings, &ctx.scope);
                Ok(ServerResult::ListToolsResult(ListToolsResult {
                    tools,
                    next_cursor: None,
                    ..Default::default()
                }))
            }
            ClientRequest::CallToolRequest(call) => {
                let name = call.params.name.to_string();
                let arguments = call.params.arguments;
                let result = self.tools_call(settings, ctx, &name, arguments).await?;
                Ok(ServerResult::CallToolResult(result))
            }
            ClientRequest::ListPromptsRequest(_) => {
                let prompts = self.prompts_list(settings, &ctx.scope);
                Ok(ServerResult::ListPromptsResult(ListPromptsResult {
                    prompts,
                    next_cursor: None,
                    ..Default::default()
                }))
            }
            ClientRequest::GetPromptRequest(get) => {
                let result = self
                    .prompts_get(settings, ctx, &get.params.name, get.params.arguments)
                    .await?;
                Ok(ServerResult::GetPromptResult(result))
            }
            ClientRequest::ListResourcesRequest(_) => {
                let resources = self.resources_list(settings, &ctx.scope);
                Ok(ServerResult::ListResourcesResult(ListResourcesResult {
                    resources,
                    next_cursor: None,
                    ..Default::default()
                }))
            }
            ClientRequest::ReadResourceRequest(read) => {
                let result = self.resources_read(settings, ctx, &read.params.uri).await?;
                Ok(ServerResult::ReadResourceResult(result))
            }
            other => Err(HubError::NotFound(format!(
                "Unsupported method: {}",
                other.method()
            ))),
        }
    }

    /// Servers visible to a scope, in stable order, with the group member
    /// entry when the scope is a group.
    fn scope_members<'a>(
        &self,
        settings: &'a Settings,
        scope: &RoutingScope,
    ) -> Vec<(String, Option<&'a crate::settings::GroupMember>)> {
        match scope {
            RoutingScope::Global | RoutingScope::SmartGlobal => self
                .registry
                .list()
                .into_iter()
                .map(|c| (c.name().to_string(), None))
                .collect(),
            RoutingScope::Server { name } => vec![(name.clone(), None)],
            RoutingScope::Group { id } | RoutingScope::SmartGroup { id } => settings
                .groups
                .get(id)
                .map(|group| {
                    group
                        .members
                        .iter()
                        .map(|m| (m.server_name().to_string(), Some(m)))
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    fn tools_list(&self, settings: &Settings, scope: &RoutingScope) -> Vec<Tool> {
        // Smart scopes expose the two meta-tools; when the vector backend is
        // unavailable the scope degrades to a full listing.
        if scope.is_smart() {
            if self.index.enabled() {
                return smart_tools(scope);
            }
            tracing::debug!("smart routing unavailable; falling back to full listing");
        }

        let separator = settings.name_separator();
        let mut seen: HashSet<String> = HashSet::new();
        let mut entries: Vec<(String, Tool)> = Vec::new();

        for (server, member) in self.scope_members(settings, scope) {
            for mut tool in self.registry.effective_tools(settings, &server) {
                if member.is_some_and(|m| !m.allows_tool(tool.name.as_ref())) {
                    continue;
                }
                let qualified = format!("{server}{separator}{}", tool.name);
                if !seen.insert(qualified.clone()) {
                    continue;
                }
                tool.name = qualified.into();
                entries.push((server.clone(), tool));
            }
        }

        entries.sort_by(|a, b| (&a.0, a.1.name.as_ref()).cmp(&(&b.0, b.1.name.as_ref())));
        entries.into_iter().map(|(_, tool)| tool).collect()
    }

    async fn tools_call(
        &self,
        settings: &Settings,
        ctx: &RequestContext,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> Result<CallToolResult> {
        if ctx.scope.is_smart() && self.index.enabled() {
            return match name {
                SEARCH_TOOLS => self.smart_search(settings, ctx, arguments).await,
                CALL_TOOL => {
                    let args = arguments.unwrap_or_default();
                    let tool_name = args
                        .get("toolName")
                        .and_then(serde_json::Value::as_str)
                        .ok_or_else(|| {
                            HubError::InvalidParams(
                                "call_tool requires a 'toolName' argument".to_string(),
                            )
                        })?
                        .to_string();
                    let inner = args
                        .get("arguments")
                        .and_then(serde_json::Value::as_object)
                        .cloned();
                    self.forward_tool_call(settings, ctx, &tool_name, inner).await
                }
                other => Err(HubError::NotFound(format!("Tool not found: {other}"))),
            };
        }

        self.forward_tool_call(settings, ctx, name, arguments).await
    }

    async fn forward_tool_call(
        &self,
        settings: &Settings,
        ctx: &RequestContext,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> Result<CallToolResult> {
        let (server, tool) = self.resolve_tool(settings, &ctx.scope, name)?;
        self.registry.call_tool(&server, &tool, arguments, ctx).await
    }

    /// Resolve a tool name to `(server, original tool)` within the scope.
    ///
    /// Qualified names split at the first separator occurrence; unqualified
    /// names must match exactly one scope member.
    fn resolve_tool(
        &self,
        settings: &Settings,
        scope: &RoutingScope,
        name: &str,
    ) -> Result<(String, String)> {
        let members = self.scope_members(settings, scope);
        let separator = settings.name_separator();

        if let Some((server, tool)) = name.split_once(separator) {
            let member = members
                .iter()
                .find(|(s, _)| s.as_str() == server)
                .ok_or_else(|| HubError::NotFound(format!("Tool not found: {name}")))?;
            if member.1.is_some_and(|m| !m.allows_tool(tool)) {
                return Err(HubError::NotFound(format!("Tool not found: {name}")));
            }
            let enabled = settings
                .mcp_servers
                .get(server)
                .is_some_and(|config| config.enabled);
            if !enabled || !self.registry.has_tool(settings, server, tool) {
                return Err(HubError::NotFound(format!("Tool not found: {name}")));
            }
            return Ok((server.to_string(), tool.to_string()));
        }

        // Unqualified: accept a unique match across the scope.
        let mut candidates: Vec<String> = Vec::new();
        for (server, member) in &members {
            if member.is_some_and(|m| !m.allows_tool(name)) {
                continue;
            }
            if self.registry.has_tool(settings, server, name) {
                candidates.push(server.clone());
            }
        }
        match candidates.as_slice() {
            [] => Err(HubError::NotFound(format!("Tool not found: {name}"))),
            [server] => Ok((server.clone(), name.to_string())),
            _ => {
                let qualified: Vec<String> = candidates
                    .iter()
                    .map(|server| format!("{server}{separator}{name}"))
                    .collect();
                Err(HubError::InvalidParams(format!(
                    "ambiguous tool name '{name}'; candidates: {}",
                    qualified.join(", ")
                )))
            }
        }
    }

    async fn smart_search(
        &self,
        settings: &Settings,
        ctx: &RequestContext,
        arguments: Option<JsonObject>,
    ) -> Result<CallToolResult> {
        let args = arguments.unwrap_or_default();
        let Some(query) = args
            .get("query")
            .and_then(serde_json::Value::as_str)
            .filter(|q| !q.trim().is_empty())
        else {
            return Ok(CallToolResult::error(vec![Content::text(
                "Query parameter is required",
            )]));
        };
        let limit = args
            .get("limit")
            .and_then(serde_json::Value::as_u64)
            .map_or(SEARCH_LIMIT_DEFAULT, |l| {
                (l as usize).clamp(1, SEARCH_LIMIT_MAX)
            });

        let filter = ctx.scope.allowed_servers(settings);
        let hits = self.index.search(query, limit, filter).await;

        let listing: Vec<serde_json::Value> = hits
            .iter()
            .map(|hit| {
                serde_json::json!({
                    "serverName": hit.server,
                    "toolName": hit.tool,
                    "description": hit.description,
                    "inputSchema": hit.input_schema,
                })
            })
            .collect();
        let structured = serde_json::json!({ "tools": listing });
        let text = serde_json::to_string_pretty(&structured)
            .map_err(|e| HubError::Internal(e.to_string()))?;

        let mut result = CallToolResult::success(vec![Content::text(text)]);
        result.structured_content = Some(structured);
        Ok(result)
    }

    fn prompts_list(&self, settings: &Settings, scope: &RoutingScope) -> Vec<Prompt> {
        if scope.is_smart() {
            return Vec::new();
        }
        let separator = settings.name_separator();
        let mut seen: HashSet<String> = HashSet::new();
        let mut entries: Vec<(String, Prompt)> = Vec::new();
        for (server, _member) in self.scope_members(settings, scope) {
            for mut prompt in self.registry.effective_prompts(settings, &server) {
                let qualified = format!("{server}{separator}{}", prompt.name);
                if !seen.insert(qualified.clone()) {
                    continue;
                }
                prompt.name = qualified;
                entries.push((server.clone(), prompt));
            }
        }
        entries.sort_by(|a, b| (&a.0, &a.1.name).cmp(&(&b.0, &b.1.name)));
        entries.into_iter().map(|(_, prompt)| prompt).collect()
    }

    async fn prompts_get(
        &self,
        settings: &Settings,
        ctx: &RequestContext,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> Result<rmcp::model::GetPromptResult> {
        let members = self.scope_members(settings, &ctx.scope);
        let separator = settings.name_separator();

        let (server, prompt) = if let Some((server, prompt)) = name.split_once(separator) {
            if !members.iter().any(|(s, _)| s.as_str() == server) {
                return Err(HubError::NotFound(format!("Prompt not found: {name}")));
            }
            (server.to_string(), prompt.to_string())
        } else {
            let candidates: Vec<String> = members
                .iter()
                .filter(|(server, _)| {
                    self.registry
                        .effective_prompts(settings, server)
                        .iter()
                        .any(|p| p.name == name)
                })
                .map(|(server, _)| server.clone())
                .collect();
            match candidates.as_slice() {
                [] => return Err(HubError::NotFound(format!("Prompt not found: {name}"))),
                [server] => (server.clone(), name.to_string()),
                _ => {
                    return Err(HubError::InvalidParams(format!(
                        "ambiguous prompt name '{name}'"
                    )));
                }
            }
        };

        let known = self
            .registry
            .effective_prompts(settings, &server)
            .iter()
            .any(|p| p.name == prompt);
        if !known {
            return Err(HubError::NotFound(format!("Prompt not found: {name}")));
        }
        self.registry.get_prompt(&server, &prompt, arguments, ctx).await
    }

    fn resources_list(&self, settings: &Settings, scope: &RoutingScope) -> Vec<Resource> {
        if scope.is_smart() {
            return Vec::new();
        }
        let mut seen: HashSet<String> = HashSet::new();
        let mut entries: Vec<(String, Resource)> = Vec::new();
        for (server, _member) in self.scope_members(settings, scope) {
            for resource in self.registry.server_resources(&server) {
                if !seen.insert(resource.uri.clone()) {
                    continue;
                }
                entries.push((server.clone(), resource));
            }
        }
        entries.sort_by(|a, b| (&a.0, &a.1.uri).cmp(&(&b.0, &b.1.uri)));
        entries.into_iter().map(|(_, resource)| resource).collect()
    }

    async fn resources_read(
        &self,
        settings: &Settings,
        ctx: &RequestContext,
        uri: &str,
    ) -> Result<rmcp::model::ReadResourceResult> {
        let owner = self
            .scope_members(settings, &ctx.scope)
            .into_iter()
            .map(|(server, _)| server)
            .find(|server| {
                self.registry
                    .server_resources(server)
                    .iter()
                    .any(|r| r.uri == uri)
            })
            .ok_or_else(|| HubError::NotFound(format!("Resource not found: {uri}")))?;
        self.registry.read_resource(&owner, uri, ctx).await
    }

    /// Whether a notification from `server` should reach `session`.
    /// Progress is delivered only to the session whose request is in
    /// flight; everything else fans out to every session whose scope
    /// includes the originating server.
    #[must_use]
    pub fn should_forward(
        &self,
        settings: &Settings,
        session: &DownstreamSession,
        envelope: &NotificationEnvelope,
    ) -> bool {
        if !session.scope.includes_server(settings, &envelope.server) {
            return false;
        }
        if envelope.method == "notifications/progress" {
            return envelope
                .progress_token()
                .and_then(|token| self.inflight.session_for_progress(&token))
                .is_some_and(|owner| owner == session.id);
        }
        true
    }
}

/// Hub `initialize` result: the hub's own server info, no fan-out.
#[must_use]
pub fn initialize_result(protocol_version: rmcp::model::ProtocolVersion) -> InitializeResult {
    InitializeResult {
        protocol_version,
        capabilities: ServerCapabilities::builder()
            .enable_logging()
            .enable_tools()
            .enable_tool_list_changed()
            .enable_prompts()
            .enable_prompts_list_changed()
            .enable_resources()
            .enable_resources_list_changed()
            .build(),
        server_info: Implementation {
            name: "mcphub".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            ..Default::default()
        },
        instructions: None,
    }
}

/// The two meta-tools exposed in smart scopes.
fn smart_tools(scope: &RoutingScope) -> Vec<Tool> {
    let scope_phrase = match scope {
        RoutingScope::SmartGroup { id } => format!("servers in the \"{id}\" group"),
        _ => "all available servers".to_string(),
    };

    let search_schema = serde_json::json!({
        "type": "object",
        "properties": {
            "query": {
                "type": "string",
                "description": "Natural-language description of the task",
            },
            "limit": {
                "type": "number",
                "description": "Maximum number of results",
                "default": SEARCH_LIMIT_DEFAULT,
                "maximum": SEARCH_LIMIT_MAX,
            },
        },
        "required": ["query"],
    });
    let call_schema = serde_json::json!({
        "type": "object",
        "properties": {
            "toolName": {
                "type": "string",
                "description": "Qualified tool name returned by search_tools",
            },
            "arguments": {
                "type": "object",
                "description": "Arguments for the target tool",
            },
        },
        "required": ["toolName"],
    });

    vec![
        Tool::new(
            SEARCH_TOOLS,
            format!("Find tools relevant to a task across {scope_phrase}. Returns matching tools with their schemas, ranked by similarity."),
            Arc::new(as_object(search_schema)),
        ),
        Tool::new(
            CALL_TOOL,
            format!("Invoke a tool discovered via search_tools on {scope_phrase}."),
            Arc::new(as_object(call_schema)),
        ),
    ]
}

fn as_object(value: serde_json::Value) -> JsonObject {
    value.as_object().cloned().unwrap_or_default()
}

fn extract_progress_token(request: &ClientRequest) -> Option<String> {
    match request {
        ClientRequest::CallToolRequest(_) => {
            request.get_meta().get_progress_token().map(|t| t.0.to_string())
        }
        _ => None,
    }
}

fn response(id: RequestId, result: ServerResult) -> ServerJsonRpcMessage {
    ServerJsonRpcMessage::Response(JsonRpcResponse {
        jsonrpc: JsonRpcVersion2_0,
        id,
        result,
    })
}

fn error_response(id: RequestId, error: ErrorData) -> ServerJsonRpcMessage {
    ServerJsonRpcMessage::Error(JsonRpcError {
        jsonrpc: JsonRpcVersion2_0,
        id,
        error,
    })
}

/// Re-encode an upstream notification for a downstream stream.
#[must_use]
pub fn notification_message(envelope: &NotificationEnvelope) -> Option<ServerJsonRpcMessage> {
    serde_json::from_value(serde_json::json!({
        "jsonrpc": "2.0",
        "method": envelope.method,
        "params": envelope.params,
    }))
    .ok()
}

/// Catalog-change notification for downstream sessions.
#[must_use]
pub fn list_changed_message(kind: &str) -> Option<ServerJsonRpcMessage> {
    serde_json::from_value(serde_json::json!({
        "jsonrpc": "2.0",
        "method": format!("notifications/{kind}/list_changed"),
    }))
    .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oauth::OAuthCoordinator;
    use crate::sessions::{SessionKind, SessionManager};
    use crate::settings::{
        Group, GroupMember, ServerConfig, ServerOptions, ToolFilter, TransportConfig,
    };
    use crate::upstream::UpstreamClient;
    use crate::vector::InMemoryVectorStore;

    struct Fixture {
        dispatcher: RequestDispatcher,
        sessions: Arc<SessionManager>,
        settings: Arc<Settings>,
        _dir: tempfile::TempDir,
    }

    fn tool(name: &str, description: &str) -> Tool {
        Tool::new(
            name.to_string(),
            description.to_string(),
            Arc::new(serde_json::Map::new()),
        )
    }

    fn stdio_config() -> ServerConfig {
        ServerConfig {
            transport: TransportConfig::Stdio {
                command: "server".to_string(),
                args: vec![],
                env: HashMap::new(),
            },
            enabled: true,
            options: ServerOptions::default(),
            tools: HashMap::new(),
            prompts: HashMap::new(),
            oauth: None,
        }
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("mcp_settings.json");

        let mut document = Settings::default();
        document
            .mcp_servers
            .insert("server1".to_string(), stdio_config());
        document
            .mcp_servers
            .insert("server2".to_string(), stdio_config());
        document.groups.insert(
            "test-group".to_string(),
            Group {
                id: "test-group".to_string(),
                name: "Test Group".to_string(),
                description: None,
                members: vec![
                    GroupMember::Name("server1".to_string()),
                    GroupMember::Filtered {
                        name: "server2".to_string(),
                        tools: ToolFilter::Names(vec!["fetch".to_string()]),
                    },
                ],
            },
        );
        std::fs::write(
            &path,
            serde_json::to_string_pretty(&document).expect("serialize"),
        )
        .expect("write settings");

        let store = Arc::new(
            SettingsStore::open(Some(&path)).await.expect("open store"),
        );
        let http = reqwest::Client::new();
        let (events, _keep) = tokio::sync::broadcast::channel(64);
        let oauth = Arc::new(OAuthCoordinator::new(
            store.clone(),
            http.clone(),
            "http://localhost/oauth/callback".to_string(),
        ));
        let index = Arc::new(ToolIndex::new(Arc::new(InMemoryVectorStore::default())));
        index.configure(
            &crate::settings::SmartRoutingConfig {
                enabled: true,
                openai_api_key: "sk-test".to_string(),
                ..crate::settings::SmartRoutingConfig::default()
            },
            &http,
        );
        let registry = crate::registry::UpstreamRegistry::new(
            store.clone(),
            oauth,
            index.clone(),
            events.clone(),
            http.clone(),
            CancellationToken::new(),
        );

        for (server, tools) in [
            ("server1", vec![tool("read_file", "Read a file"), tool("fetch", "Fetch a URL")]),
            ("server2", vec![tool("fetch", "Fetch a URL"), tool("secret_tool", "Hidden")]),
        ] {
            let client = Arc::new(UpstreamClient::new(
                server.to_string(),
                stdio_config(),
                events.clone(),
                http.clone(),
            ));
            client.set_catalog_for_tests(tools, vec![]);
            registry.insert_test_client(client);
        }

        let settings = store.current();
        Fixture {
            dispatcher: RequestDispatcher::new(store, registry, index),
            sessions: Arc::new(SessionManager::new(CancellationToken::new())),
            settings,
            _dir: dir,
        }
    }

    fn request(method_body: serde_json::Value) -> ClientJsonRpcMessage {
        serde_json::from_value(method_body).expect("client message")
    }

    async fn roundtrip(
        fixture: &Fixture,
        scope: RoutingScope,
        body: serde_json::Value,
    ) -> serde_json::Value {
        let session = fixture
            .sessions
            .create(SessionKind::StreamableHttp, scope, None)
            .expect("session");
        let reply = fixture
            .dispatcher
            .handle_message(&session, HashMap::new(), request(body))
            .await
            .expect("response");
        serde_json::to_value(reply).expect("serialize reply")
    }

    #[tokio::test]
    async fn global_tools_list_is_qualified_and_sorted() {
        let fixture = fixture().await;
        let reply = roundtrip(
            &fixture,
            RoutingScope::Global,
            serde_json::json!({ "jsonrpc": "2.0", "id": 1, "method": "tools/list" }),
        )
        .await;

        let names: Vec<&str> = reply["result"]["tools"]
            .as_array()
            .expect("tools")
            .iter()
            .map(|t| t["name"].as_str().expect("name"))
            .collect();
        assert_eq!(
            names,
            vec![
                "server1::fetch",
                "server1::read_file",
                "server2::fetch",
                "server2::secret_tool",
            ]
        );

        // Property: every name splits back into a scope member and a tool in
        // that member's catalog.
        for name in names {
            let (server, tool) = name.split_once("::").expect("qualified");
            assert!(fixture.settings.mcp_servers.contains_key(server));
            assert!(
                fixture
                    .dispatcher
                    .registry
                    .has_tool(&fixture.settings, server, tool)
            );
        }
    }

    #[tokio::test]
    async fn group_list_honours_member_tool_filters() {
        let fixture = fixture().await;
        let reply = roundtrip(
            &fixture,
            RoutingScope::Group {
                id: "test-group".to_string(),
            },
            serde_json::json!({ "jsonrpc": "2.0", "id": 2, "method": "tools/list" }),
        )
        .await;

        let names: Vec<&str> = reply["result"]["tools"]
            .as_array()
            .expect("tools")
            .iter()
            .map(|t| t["name"].as_str().expect("name"))
            .collect();
        assert_eq!(
            names,
            vec!["server1::fetch", "server1::read_file", "server2::fetch"]
        );
    }

    #[tokio::test]
    async fn smart_scope_lists_exactly_two_meta_tools() {
        let fixture = fixture().await;
        let reply = roundtrip(
            &fixture,
            RoutingScope::SmartGroup {
                id: "test-group".to_string(),
            },
            serde_json::json!({ "jsonrpc": "2.0", "id": 3, "method": "tools/list" }),
        )
        .await;

        let tools = reply["result"]["tools"].as_array().expect("tools");
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0]["name"], "search_tools");
        assert_eq!(tools[1]["name"], "call_tool");
        assert!(
            tools[0]["description"]
                .as_str()
                .expect("description")
                .contains("servers in the \"test-group\" group")
        );
    }

    #[tokio::test]
    async fn search_tools_without_query_is_a_tool_error() {
        let fixture = fixture().await;
        let reply = roundtrip(
            &fixture,
            RoutingScope::SmartGlobal,
            serde_json::json!({
                "jsonrpc": "2.0", "id": 4, "method": "tools/call",
                "params": { "name": "search_tools", "arguments": { "limit": 10 } },
            }),
        )
        .await;

        assert_eq!(reply["result"]["isError"], true);
        let text = reply["result"]["content"][0]["text"]
            .as_str()
            .expect("text");
        assert!(text.contains("Query parameter is required"));
    }

    #[tokio::test]
    async fn unknown_smart_tool_is_method_not_found() {
        let fixture = fixture().await;
        let reply = roundtrip(
            &fixture,
            RoutingScope::SmartGlobal,
            serde_json::json!({
                "jsonrpc": "2.0", "id": 5, "method": "tools/call",
                "params": { "name": "read_file", "arguments": {} },
            }),
        )
        .await;
        assert_eq!(reply["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn ambiguous_unqualified_call_lists_candidates() {
        let fixture = fixture().await;
        let reply = roundtrip(
            &fixture,
            RoutingScope::Global,
            serde_json::json!({
                "jsonrpc": "2.0", "id": 6, "method": "tools/call",
                "params": { "name": "fetch", "arguments": {} },
            }),
        )
        .await;
        assert_eq!(reply["error"]["code"], -32602);
        let message = reply["error"]["message"].as_str().expect("message");
        assert!(message.contains("server1::fetch"));
        assert!(message.contains("server2::fetch"));
    }

    #[tokio::test]
    async fn unknown_server_in_qualified_name_is_method_not_found() {
        let fixture = fixture().await;
        let reply = roundtrip(
            &fixture,
            RoutingScope::Global,
            serde_json::json!({
                "jsonrpc": "2.0", "id": 7, "method": "tools/call",
                "params": { "name": "missing::fetch", "arguments": {} },
            }),
        )
        .await;
        assert_eq!(reply["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn initialize_echoes_hub_info_without_fanout() {
        let fixture = fixture().await;
        let reply = roundtrip(
            &fixture,
            RoutingScope::Global,
            serde_json::json!({
                "jsonrpc": "2.0", "id": 8, "method": "initialize",
                "params": {
                    "protocolVersion": "2024-11-05",
                    "capabilities": {},
                    "clientInfo": { "name": "test-client", "version": "0.0.1" },
                },
            }),
        )
        .await;
        assert_eq!(reply["result"]["serverInfo"]["name"], "mcphub");
        assert_eq!(reply["result"]["protocolVersion"], "2024-11-05");
    }

    #[tokio::test]
    async fn unsupported_method_maps_to_method_not_found() {
        let fixture = fixture().await;
        let reply = roundtrip(
            &fixture,
            RoutingScope::Global,
            serde_json::json!({
                "jsonrpc": "2.0", "id": 9, "method": "resources/subscribe",
                "params": { "uri": "file:///tmp" },
            }),
        )
        .await;
        assert_eq!(reply["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn progress_notifications_route_to_owning_session_only() {
        let fixture = fixture().await;
        let owner = fixture
            .sessions
            .create(SessionKind::Sse, RoutingScope::Global, None)
            .expect("session");
        let other = fixture
            .sessions
            .create(SessionKind::Sse, RoutingScope::Global, None)
            .expect("session");

        let inflight = fixture.dispatcher.inflight();
        inflight.register(
            owner.id,
            &RequestId::Number(1),
            CancellationToken::new(),
            Some("token-1"),
        );

        let progress = NotificationEnvelope {
            server: "server1".to_string(),
            method: "notifications/progress".to_string(),
            params: serde_json::json!({ "progressToken": "token-1", "progress": 5 }),
        };
        assert!(fixture.dispatcher.should_forward(&fixture.settings, &owner, &progress));
        assert!(!fixture.dispatcher.should_forward(&fixture.settings, &other, &progress));

        let list_changed = NotificationEnvelope {
            server: "server1".to_string(),
            method: "notifications/tools/list_changed".to_string(),
            params: serde_json::Value::Null,
        };
        assert!(fixture.dispatcher.should_forward(&fixture.settings, &owner, &list_changed));
        assert!(fixture.dispatcher.should_forward(&fixture.settings, &other, &list_changed));
    }

    #[tokio::test]
    async fn cancelled_notification_cancels_inflight_request() {
        let fixture = fixture().await;
        let session = fixture
            .sessions
            .create(SessionKind::Sse, RoutingScope::Global, None)
            .expect("session");

        let token = CancellationToken::new();
        let inflight = fixture.dispatcher.inflight();
        inflight.register(session.id, &RequestId::Number(42), token.clone(), None);

        let reply = fixture
            .dispatcher
            .handle_message(
                &session,
                HashMap::new(),
                request(serde_json::json!({
                    "jsonrpc": "2.0", "method": "notifications/cancelled",
                    "params": { "requestId": 42 },
                })),
            )
            .await;
        assert!(reply.is_none());
        assert!(token.is_cancelled());
    }
}
