//! The pool of upstream clients.
//!
//! One `UpstreamClient` per enabled server; reconciliation on settings
//! reload diffs the old and new documents and only rebuilds clients whose
//! material configuration (transport, options, oauth) changed. Per-tool
//! toggles and description overrides are applied at read time from the
//! current settings snapshot, so flipping them never reconnects anything.

use crate::error::{HubError, Result};
use crate::oauth::{OAuthCoordinator, TokenOutcome};
use crate::sessions::RequestContext;
use crate::settings::{ServerConfig, Settings, SettingsStore, ToolOverride};
use crate::upstream::{
    ClientStatus, EventSender, JsonObject, UpstreamClient, UpstreamEvent,
};
use crate::vector::{ToolDocument, ToolIndex};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rmcp::model::{CallToolResult, GetPromptResult, Prompt, ReadResourceResult, Resource, Tool};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Reconnect backoff: base 1s, factor 2, cap 60s.
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(BACKOFF_CAP)
}

struct Entry {
    client: Arc<UpstreamClient>,
    /// Cancels the maintenance loop; cancelled on removal or explicit
    /// disconnect.
    maintenance: CancellationToken,
}

/// Point-in-time view of one upstream for status surfaces.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub status: &'static str,
    pub tool_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
}

pub struct UpstreamRegistry {
    store: Arc<SettingsStore>,
    oauth: Arc<OAuthCoordinator>,
    index: Arc<ToolIndex>,
    events: EventSender,
    http: reqwest::Client,
    entries: RwLock<HashMap<String, Entry>>,
    reconcile_lock: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
}

impl UpstreamRegistry {
    #[must_use]
    pub fn new(
        store: Arc<SettingsStore>,
        oauth: Arc<OAuthCoordinator>,
        index: Arc<ToolIndex>,
        events: EventSender,
        http: reqwest::Client,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            oauth,
            index,
            events,
            http,
            entries: RwLock::new(HashMap::new()),
            reconcile_lock: tokio::sync::Mutex::new(()),
            shutdown,
        })
    }

    /// Start the pool: connect every enabled server and subscribe to
    /// settings reloads and catalog events.
    pub async fn start(self: &Arc<Self>) {
        self.apply_settings(self.store.current()).await;
        self.spawn_settings_listener();
        self.spawn_event_listener();
    }

    fn spawn_settings_listener(self: &Arc<Self>) {
        let registry = self.clone();
        let mut rx = self.store.subscribe();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(snapshot) => registry.apply_settings(snapshot).await,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                            // Catch up with whatever is current.
                            let snapshot = registry.store.current();
                            registry.apply_settings(snapshot).await;
                        }
                    },
                }
            }
        });
    }

    /// Refresh stale catalogs on `list_changed` and keep the vector index
    /// in sync with the catalog.
    fn spawn_event_listener(self: &Arc<Self>) {
        let registry = self.clone();
        let mut rx = self.events.subscribe();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = shutdown.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(event) => event,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    },
                };
                match event {
                    UpstreamEvent::CatalogDirty { server } => {
                        if let Some(client) = registry.get(&server)
                            && client.status() == ClientStatus::Connected
                            && let Err(e) = client.refresh_catalog().await
                        {
                            tracing::warn!(server = %server, error = %e, "catalog refresh failed");
                        }
                    }
                    UpstreamEvent::CatalogChanged { .. } => {
                        registry.rebuild_index().await;
                    }
                    UpstreamEvent::StatusChanged { .. } | UpstreamEvent::Notification(_) => {}
                }
            }
        });
    }

    /// Reconcile the pool against a new settings snapshot: build the diff
    /// (added / removed / mutated) and apply it serially. Material changes
    /// tear the old client down first; toggle-only changes touch nothing.
    pub async fn apply_settings(self: &Arc<Self>, snapshot: Arc<Settings>) {
        let _guard = self.reconcile_lock.lock().await;

        let mut removed: Vec<Entry> = Vec::new();
        let mut added: Vec<String> = Vec::new();
        {
            let mut entries = self.entries.write();

            let stale: Vec<String> = entries
                .keys()
                .filter(|name| {
                    !snapshot
                        .mcp_servers
                        .get(*name)
                        .is_some_and(|config| config.enabled)
                })
                .cloned()
                .collect();
            for name in stale {
                if let Some(entry) = entries.remove(&name) {
                    removed.push(entry);
                }
            }

            for (name, config) in &snapshot.mcp_servers {
                if !config.enabled {
                    continue;
                }
                match entries.get(name) {
                    None => added.push(name.clone()),
                    Some(entry) => {
                        if material_change(entry.client.config(), config) {
                            if let Some(entry) = entries.remove(name) {
                                removed.push(entry);
                            }
                            added.push(name.clone());
                        }
                    }
                }
            }
        }

        for entry in removed {
            entry.maintenance.cancel();
            entry.client.disconnect().await;
            tracing::info!(server = %entry.client.name(), "upstream removed");
        }

        for name in added {
            if let Some(config) = snapshot.mcp_servers.get(&name) {
                self.insert_entry(&name, config.clone());
            }
        }

        self.index
            .configure(&snapshot.system_config.smart_routing, &self.http);
        self.rebuild_index().await;
    }

    fn insert_entry(self: &Arc<Self>, name: &str, config: ServerConfig) {
        let client = Arc::new(UpstreamClient::new(
            name.to_string(),
            config,
            self.events.clone(),
            self.http.clone(),
        ));
        let maintenance = self.shutdown.child_token();
        self.entries.write().insert(
            name.to_string(),
            Entry {
                client: client.clone(),
                maintenance: maintenance.clone(),
            },
        );
        self.spawn_maintenance(client, maintenance);
    }

    /// Connect-and-retry loop for one upstream: exponential backoff on
    /// failure, oauth_required parking until the coordinator resumes us,
    /// reconnect on transport loss.
    fn spawn_maintenance(self: &Arc<Self>, client: Arc<UpstreamClient>, token: CancellationToken) {
        let registry = self.clone();
        tokio::spawn(async move {
            let name = client.name().to_string();
            let mut backoff = BACKOFF_BASE;
            loop {
                if token.is_cancelled() {
                    break;
                }

                let bearer = match registry.acquire_token(&client, &token).await {
                    TokenAcquisition::Token(token) => Some(token),
                    TokenAcquisition::None => None,
                    TokenAcquisition::Cancelled => break,
                };

                match client.connect(bearer.as_deref()).await {
                    Ok(()) => {
                        backoff = BACKOFF_BASE;
                        if !registry.wait_while_connected(&client, &token).await {
                            break;
                        }
                        // A mid-session 401 parks the client in
                        // oauth_required; refresh before reconnecting so we
                        // do not loop on a stale token.
                        if matches!(client.status(), ClientStatus::OauthRequired { .. }) {
                            match registry.oauth.handle_unauthorized(&name).await {
                                Ok(TokenOutcome::Pending { authorization_url }) => {
                                    client.set_status(ClientStatus::OauthRequired {
                                        authorization_url: Some(authorization_url),
                                    });
                                    if !registry.wait_for_resume(&name, &token).await {
                                        break;
                                    }
                                }
                                Ok(_) => {}
                                Err(e) => {
                                    tracing::warn!(server = %name, error = %e, "re-authorization failed");
                                }
                            }
                        }
                    }
                    Err(HubError::AuthRequired { .. }) => {
                        client.set_status(ClientStatus::OauthRequired {
                            authorization_url: None,
                        });
                        match registry.oauth.handle_unauthorized(&name).await {
                            Ok(TokenOutcome::Pending { authorization_url }) => {
                                client.set_status(ClientStatus::OauthRequired {
                                    authorization_url: Some(authorization_url),
                                });
                            }
                            Ok(_) => {}
                            Err(e) => {
                                tracing::warn!(server = %name, error = %e, "authorization flow failed");
                            }
                        }
                        if !registry.wait_for_resume(&name, &token).await {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(
                            server = %name,
                            error = %e,
                            retry_in_ms = backoff.as_millis() as u64,
                            "upstream connect failed"
                        );
                        tokio::select! {
                            () = token.cancelled() => break,
                            () = tokio::time::sleep(backoff) => {}
                        }
                        backoff = next_backoff(backoff);
                    }
                }
            }
            client.disconnect().await;
        });
    }

    async fn acquire_token(
        &self,
        client: &Arc<UpstreamClient>,
        token: &CancellationToken,
    ) -> TokenAcquisition {
        if client.config().oauth.is_none() {
            return TokenAcquisition::None;
        }
        let name = client.name().to_string();
        loop {
            match self.oauth.access_token(&name).await {
                Ok(TokenOutcome::Token(value)) => return TokenAcquisition::Token(value),
                Ok(TokenOutcome::Unconfigured) => return TokenAcquisition::None,
                Ok(TokenOutcome::Pending { authorization_url }) => {
                    client.set_status(ClientStatus::OauthRequired {
                        authorization_url: Some(authorization_url),
                    });
                    if !self.wait_for_resume(&name, token).await {
                        return TokenAcquisition::Cancelled;
                    }
                }
                Err(e) => {
                    tracing::warn!(server = %name, error = %e, "token acquisition failed");
                    return TokenAcquisition::None;
                }
            }
        }
    }

    /// Park until the OAuth coordinator reports fresh credentials for
    /// `name`. Returns false when the maintenance token was cancelled.
    async fn wait_for_resume(&self, name: &str, token: &CancellationToken) -> bool {
        let mut resumed = self.oauth.subscribe_resumed();
        loop {
            tokio::select! {
                () = token.cancelled() => return false,
                received = resumed.recv() => match received {
                    Ok(server) if server == name => return true,
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return false,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => return true,
                },
            }
        }
    }

    /// Block until the client leaves `Connected`. Returns false when the
    /// maintenance token was cancelled instead.
    async fn wait_while_connected(
        &self,
        client: &Arc<UpstreamClient>,
        token: &CancellationToken,
    ) -> bool {
        let mut events = self.events.subscribe();
        loop {
            if client.status() != ClientStatus::Connected {
                return true;
            }
            tokio::select! {
                () = token.cancelled() => return false,
                received = events.recv() => match received {
                    Ok(UpstreamEvent::StatusChanged { server })
                        if server == client.name() => {}
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return false,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                },
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn insert_test_client(&self, client: Arc<UpstreamClient>) {
        self.entries.write().insert(
            client.name().to_string(),
            Entry {
                client,
                maintenance: CancellationToken::new(),
            },
        );
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<UpstreamClient>> {
        self.entries.read().get(name).map(|e| e.client.clone())
    }

    #[must_use]
    pub fn list(&self) -> Vec<Arc<UpstreamClient>> {
        let mut clients: Vec<Arc<UpstreamClient>> = self
            .entries
            .read()
            .values()
            .map(|e| e.client.clone())
            .collect();
        clients.sort_by(|a, b| a.name().cmp(b.name()));
        clients
    }

    /// Resume a disconnected or removed-by-disconnect server.
    ///
    /// # Errors
    ///
    /// Unknown or disabled servers.
    pub async fn connect(self: &Arc<Self>, name: &str) -> Result<()> {
        let snapshot = self.store.current();
        let config = snapshot
            .mcp_servers
            .get(name)
            .ok_or_else(|| HubError::NotFound(format!("Server '{name}' not found")))?;
        if !config.enabled {
            return Err(HubError::InvalidParams(format!(
                "Server '{name}' is disabled"
            )));
        }
        let existing = self.entries.write().remove(name);
        if let Some(entry) = existing {
            entry.maintenance.cancel();
            entry.client.disconnect().await;
        }
        self.insert_entry(name, config.clone());
        Ok(())
    }

    /// Stop a server's maintenance loop and close its transport; the entry
    /// stays visible with a `disconnected` status.
    ///
    /// # Errors
    ///
    /// Unknown server names.
    pub async fn disconnect(&self, name: &str) -> Result<()> {
        let entry = {
            let entries = self.entries.read();
            let entry = entries
                .get(name)
                .ok_or_else(|| HubError::NotFound(format!("Server '{name}' not found")))?;
            (entry.client.clone(), entry.maintenance.clone())
        };
        entry.1.cancel();
        entry.0.disconnect().await;
        entry.0.set_status(ClientStatus::Disconnected {
            last_error: "disconnected by operator".to_string(),
        });
        Ok(())
    }

    /// Tear down and rebuild every client.
    pub async fn reconnect_all(self: &Arc<Self>) {
        let names: Vec<String> = self.entries.read().keys().cloned().collect();
        for name in names {
            if let Err(e) = self.connect(&name).await {
                tracing::warn!(server = %name, error = %e, "reconnect failed");
            }
        }
    }

    /// Tools for one server with per-tool enable flags and description
    /// overrides applied (unqualified names).
    #[must_use]
    pub fn effective_tools(&self, settings: &Settings, server: &str) -> Vec<Tool> {
        let Some(client) = self.get(server) else {
            return Vec::new();
        };
        let overrides = settings
            .mcp_servers
            .get(server)
            .map(|c| &c.tools);
        let mut tools: Vec<Tool> = client
            .tools()
            .into_iter()
            .filter_map(|mut tool| {
                match overrides.and_then(|o| o.get(tool.name.as_ref())) {
                    Some(ToolOverride { enabled: false, .. }) => None,
                    Some(ToolOverride {
                        description: Some(description),
                        ..
                    }) => {
                        tool.description = Some(description.clone().into());
                        Some(tool)
                    }
                    _ => Some(tool),
                }
            })
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Prompts for one server with enable flags and description overrides
    /// applied.
    #[must_use]
    pub fn effective_prompts(&self, settings: &Settings, server: &str) -> Vec<Prompt> {
        let Some(client) = self.get(server) else {
            return Vec::new();
        };
        let overrides = settings
            .mcp_servers
            .get(server)
            .map(|c| &c.prompts);
        let mut prompts: Vec<Prompt> = client
            .prompts()
            .into_iter()
            .filter_map(|mut prompt| {
                match overrides.and_then(|o| o.get(prompt.name.as_str())) {
                    Some(ToolOverride { enabled: false, .. }) => None,
                    Some(ToolOverride {
                        description: Some(description),
                        ..
                    }) => {
                        prompt.description = Some(description.clone());
                        Some(prompt)
                    }
                    _ => Some(prompt),
                }
            })
            .collect();
        prompts.sort_by(|a, b| a.name.cmp(&b.name));
        prompts
    }

    #[must_use]
    pub fn server_resources(&self, server: &str) -> Vec<Resource> {
        self.get(server).map(|c| c.resources()).unwrap_or_default()
    }

    /// Whether the (enabled) tool exists in the server's catalog.
    #[must_use]
    pub fn has_tool(&self, settings: &Settings, server: &str, tool: &str) -> bool {
        self.effective_tools(settings, server)
            .iter()
            .any(|t| t.name.as_ref() == tool)
    }

    /// Forward a tool call to one named upstream.
    ///
    /// # Errors
    ///
    /// Unknown server, unavailable upstream, timeout, forwarded errors.
    pub async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: Option<JsonObject>,
        ctx: &RequestContext,
    ) -> Result<CallToolResult> {
        let client = self
            .get(server)
            .ok_or_else(|| HubError::NotFound(format!("Server '{server}' not found")))?;
        client.call_tool(tool, arguments, ctx).await
    }

    /// Forward a prompt fetch to one named upstream.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Self::call_tool`].
    pub async fn get_prompt(
        &self,
        server: &str,
        prompt: &str,
        arguments: Option<JsonObject>,
        ctx: &RequestContext,
    ) -> Result<GetPromptResult> {
        let client = self
            .get(server)
            .ok_or_else(|| HubError::NotFound(format!("Server '{server}' not found")))?;
        client.get_prompt(prompt, arguments, ctx).await
    }

    /// Forward a resource read to one named upstream.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Self::call_tool`].
    pub async fn read_resource(
        &self,
        server: &str,
        uri: &str,
        ctx: &RequestContext,
    ) -> Result<ReadResourceResult> {
        let client = self
            .get(server)
            .ok_or_else(|| HubError::NotFound(format!("Server '{server}' not found")))?;
        client.read_resource(uri, ctx).await
    }

    /// Persist a per-tool enable flag. Applied at read time; no reconnect.
    ///
    /// # Errors
    ///
    /// Unknown server, or persistence failure.
    pub async fn toggle_tool(&self, server: &str, tool: &str, enabled: bool) -> Result<()> {
        self.toggle_override(server, tool, enabled, false).await
    }

    /// Persist a per-prompt enable flag.
    ///
    /// # Errors
    ///
    /// Unknown server, or persistence failure.
    pub async fn toggle_prompt(&self, server: &str, prompt: &str, enabled: bool) -> Result<()> {
        self.toggle_override(server, prompt, enabled, true).await
    }

    async fn toggle_override(
        &self,
        server: &str,
        name: &str,
        enabled: bool,
        prompt: bool,
    ) -> Result<()> {
        let mut document = self.store.load_original().await?;
        let entry = document
            .mcp_servers
            .get_mut(server)
            .ok_or_else(|| HubError::NotFound(format!("Server '{server}' not found")))?;
        let overrides = if prompt { &mut entry.prompts } else { &mut entry.tools };
        overrides.entry(name.to_string()).or_default().enabled = enabled;
        self.store.save(&document).await?;
        self.rebuild_index().await;
        Ok(())
    }

    /// Re-embed every enabled tool across every connected server.
    pub async fn rebuild_index(&self) {
        if !self.index.enabled() {
            return;
        }
        let settings = self.store.current();
        let separator = settings.name_separator().to_string();
        let mut documents = Vec::new();
        for client in self.list() {
            if client.status() != ClientStatus::Connected {
                continue;
            }
            for tool in self.effective_tools(&settings, client.name()) {
                documents.push(ToolDocument {
                    qualified_name: format!("{}{}{}", client.name(), separator, tool.name),
                    server: client.name().to_string(),
                    tool: tool.name.to_string(),
                    description: tool
                        .description
                        .as_deref()
                        .unwrap_or_default()
                        .to_string(),
                    input_schema: serde_json::Value::Object((*tool.input_schema).clone()),
                });
            }
        }
        self.index.rebuild(documents).await;
    }

    /// Status view for the `/status` surface.
    #[must_use]
    pub fn status_overview(&self) -> Vec<ServerStatus> {
        self.list()
            .into_iter()
            .map(|client| {
                let status = client.status();
                let last_error = match &status {
                    ClientStatus::Disconnected { last_error } => Some(last_error.clone()),
                    _ => None,
                };
                ServerStatus {
                    name: client.name().to_string(),
                    kind: client.config().transport.kind(),
                    status: status.label(),
                    tool_count: client.tools().len(),
                    last_error,
                    connected_at: client.connected_at(),
                }
            })
            .collect()
    }
}

enum TokenAcquisition {
    Token(String),
    None,
    Cancelled,
}

/// Whether a config change requires a transport rebuild. Tool/prompt
/// toggles and description overrides are read-time concerns.
fn material_change(old: &ServerConfig, new: &ServerConfig) -> bool {
    let mut old = old.clone();
    let mut new = new.clone();
    old.tools.clear();
    old.prompts.clear();
    new.tools.clear();
    new.prompts.clear();
    old != new
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{ServerOptions, TransportConfig};
    use std::collections::HashMap as StdHashMap;

    fn stdio_config(command: &str) -> ServerConfig {
        ServerConfig {
            transport: TransportConfig::Stdio {
                command: command.to_string(),
                args: vec![],
                env: StdHashMap::new(),
            },
            enabled: true,
            options: ServerOptions::default(),
            tools: StdHashMap::new(),
            prompts: StdHashMap::new(),
            oauth: None,
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = BACKOFF_BASE;
        let mut observed = Vec::new();
        for _ in 0..8 {
            observed.push(backoff.as_secs());
            backoff = next_backoff(backoff);
        }
        assert_eq!(observed, vec![1, 2, 4, 8, 16, 32, 60, 60]);
    }

    #[test]
    fn tool_toggles_are_not_material() {
        let old = stdio_config("server-a");
        let mut new = old.clone();
        new.tools.insert(
            "read_file".to_string(),
            ToolOverride {
                enabled: false,
                description: None,
            },
        );
        assert!(!material_change(&old, &new));

        let mut command_changed = old.clone();
        command_changed.transport = TransportConfig::Stdio {
            command: "server-b".to_string(),
            args: vec![],
            env: StdHashMap::new(),
        };
        assert!(material_change(&old, &command_changed));

        let mut options_changed = old.clone();
        options_changed.options.timeout_ms = 5_000;
        assert!(material_change(&old, &options_changed));
    }

    #[tokio::test]
    async fn effective_tools_apply_overrides() {
        use rmcp::model::Tool;

        let (events, _rx) = tokio::sync::broadcast::channel(16);
        let client = Arc::new(UpstreamClient::new(
            "fs".to_string(),
            stdio_config("fs-server"),
            events,
            reqwest::Client::new(),
        ));
        client.set_catalog_for_tests(
            vec![
                Tool::new("read_file", "Read a file", Arc::new(serde_json::Map::new())),
                Tool::new("write_file", "Write a file", Arc::new(serde_json::Map::new())),
            ],
            vec![],
        );

        let mut settings = Settings::default();
        let mut config = stdio_config("fs-server");
        config.tools.insert(
            "write_file".to_string(),
            ToolOverride {
                enabled: false,
                description: None,
            },
        );
        config.tools.insert(
            "read_file".to_string(),
            ToolOverride {
                enabled: true,
                description: Some("Careful reader".to_string()),
            },
        );
        settings.mcp_servers.insert("fs".to_string(), config);

        // Assemble a registry around the prepared client.
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("mcp_settings.json");
        let store = Arc::new(
            crate::settings::SettingsStore::open(Some(&path))
                .await
                .expect("store"),
        );
        let (events, _keep) = tokio::sync::broadcast::channel(16);
        let http = reqwest::Client::new();
        let oauth = Arc::new(OAuthCoordinator::new(
            store.clone(),
            http.clone(),
            "http://localhost/oauth/callback".to_string(),
        ));
        let index = Arc::new(ToolIndex::new(Arc::new(
            crate::vector::InMemoryVectorStore::default(),
        )));
        let registry = UpstreamRegistry::new(
            store,
            oauth,
            index,
            events,
            http,
            CancellationToken::new(),
        );
        registry.entries.write().insert(
            "fs".to_string(),
            Entry {
                client,
                maintenance: CancellationToken::new(),
            },
        );

        let tools = registry.effective_tools(&settings, "fs");
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name.as_ref(), "read_file");
        assert_eq!(tools[0].description.as_deref(), Some("Careful reader"));
        assert!(registry.has_tool(&settings, "fs", "read_file"));
        assert!(!registry.has_tool(&settings, "fs", "write_file"));
    }
}
