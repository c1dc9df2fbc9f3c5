//! Configuration document model and the settings store.
//!
//! The settings file (`mcp_settings.json`) is the single source of truth for
//! upstream servers, groups, users, and system configuration. The store
//! loads it with `${VAR}`/`$VAR` expansion applied to every string leaf,
//! persists mutations atomically (temp file + rename), and broadcasts a new
//! copy-on-write snapshot to subscribers after every successful save.

use crate::error::{HubError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;

pub const SETTINGS_FILE_NAME: &str = "mcp_settings.json";
pub const SETTINGS_PATH_ENV: &str = "MCPHUB_SETTING_PATH";

/// Default qualified-name separator between server name and tool name.
pub const DEFAULT_NAME_SEPARATOR: &str = "::";

/// Placeholder credential seeded when the document carries no users at all.
/// The hash is opaque to the hub; password verification happens in the
/// (out-of-scope) admin surface.
const SEED_ADMIN_USERNAME: &str = "admin";
const SEED_ADMIN_PASSWORD_HASH: &str =
    "$2b$10$mW5CnJsWpTzCMOgiehMsNO9PP3nrEmSb4ZTBOOCYSq3YJF4SCqK9G";

fn default_true() -> bool {
    true
}

fn default_name_separator() -> String {
    DEFAULT_NAME_SEPARATOR.to_string()
}

/// The whole configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub mcp_servers: HashMap<String, ServerConfig>,
    pub users: Vec<UserAccount>,
    pub groups: HashMap<String, Group>,
    pub system_config: SystemConfig,
    pub user_configs: HashMap<String, SystemConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserAccount {
    pub username: String,
    pub password_hash: String,
    #[serde(default)]
    pub is_admin: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub members: Vec<GroupMember>,
}

/// A group member: either a plain server name or a server with a tool
/// filter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum GroupMember {
    Name(String),
    Filtered {
        name: String,
        tools: ToolFilter,
    },
}

impl GroupMember {
    #[must_use]
    pub fn server_name(&self) -> &str {
        match self {
            Self::Name(name) | Self::Filtered { name, .. } => name,
        }
    }

    /// Whether `tool` passes this member's filter.
    #[must_use]
    pub fn allows_tool(&self, tool: &str) -> bool {
        match self {
            Self::Name(_)
            | Self::Filtered {
                tools: ToolFilter::All(_),
                ..
            } => true,
            Self::Filtered {
                tools: ToolFilter::Names(names),
                ..
            } => names.iter().any(|n| n == tool),
        }
    }
}

/// `"all"` or an explicit allowlist.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ToolFilter {
    All(AllMarker),
    Names(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum AllMarker {
    All,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SystemConfig {
    pub routing: RoutingConfig,
    pub smart_routing: SmartRoutingConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oauth: Option<OAuthProviderConfig>,
    #[serde(default = "default_name_separator")]
    pub name_separator: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RoutingConfig {
    pub enable_global_route: bool,
    pub enable_group_name_route: bool,
    pub enable_bearer_auth: bool,
    pub bearer_auth_key: String,
    pub skip_auth: bool,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            enable_global_route: true,
            enable_group_name_route: true,
            enable_bearer_auth: false,
            bearer_auth_key: String::new(),
            skip_auth: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SmartRoutingConfig {
    pub enabled: bool,
    pub openai_api_key: String,
    pub openai_api_base_url: String,
    pub openai_api_embedding_model: String,
}

impl Default for SmartRoutingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            openai_api_key: String::new(),
            openai_api_base_url: "https://api.openai.com/v1".to_string(),
            openai_api_embedding_model: "text-embedding-3-small".to_string(),
        }
    }
}

/// Hub-level OAuth authorization-proxy configuration (RFC 8414 metadata plus
/// `/authorize` and `/token` delegating to the configured issuer).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct OAuthProviderConfig {
    pub enabled: bool,
    pub issuer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization_endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_endpoint: Option<String>,
}

impl Default for OAuthProviderConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            issuer: String::new(),
            authorization_endpoint: None,
            token_endpoint: None,
        }
    }
}

/// One upstream server entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(flatten)]
    pub transport: TransportConfig,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub options: ServerOptions,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tools: HashMap<String, ToolOverride>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub prompts: HashMap<String, ToolOverride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth: Option<OAuthConfig>,
}

/// Transport-specific configuration, tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TransportConfig {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    Sse {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    StreamableHttp {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    Openapi {
        openapi: mcphub_openapi_tools::OpenApiConfig,
    },
}

impl TransportConfig {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Stdio { .. } => "stdio",
            Self::Sse { .. } => "sse",
            Self::StreamableHttp { .. } => "streamable-http",
            Self::Openapi { .. } => "openapi",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerOptions {
    pub timeout_ms: u64,
    pub reset_timeout_on_progress: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_total_timeout_ms: Option<u64>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        // REQUEST_TIMEOUT (milliseconds) overrides the stock 60s default.
        Self {
            timeout_ms: mcphub_env::positive_u64("REQUEST_TIMEOUT").unwrap_or(60_000),
            reset_timeout_on_progress: false,
            max_total_timeout_ms: None,
        }
    }
}

/// Per-tool / per-prompt enable flag and optional description override.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolOverride {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Default for ToolOverride {
    fn default() -> Self {
        Self {
            enabled: true,
            description: None,
        }
    }
}

/// Per-server OAuth state. Access tokens are never logged.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct OAuthConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization_endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dynamic_registration: Option<DynamicRegistrationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_authorization: Option<PendingAuthorization>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct DynamicRegistrationConfig {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registration_endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_access_token: Option<String>,
}

/// Persisted intermediate state of an in-progress authorization-code flow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PendingAuthorization {
    pub authorization_url: String,
    pub state: String,
    pub code_verifier: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Settings {
    /// The effective system configuration for a user: admins (and anonymous
    /// sessions) see the global view, non-admins see their override.
    #[must_use]
    pub fn system_config_for(&self, user: Option<&str>) -> &SystemConfig {
        let Some(user) = user else {
            return &self.system_config;
        };
        let is_admin = self
            .users
            .iter()
            .any(|u| u.username == user && u.is_admin);
        if is_admin {
            return &self.system_config;
        }
        self.user_configs.get(user).unwrap_or(&self.system_config)
    }

    #[must_use]
    pub fn name_separator(&self) -> &str {
        if self.system_config.name_separator.is_empty() {
            DEFAULT_NAME_SEPARATOR
        } else {
            &self.system_config.name_separator
        }
    }

    fn ensure_seed_admin(&mut self) {
        if self.users.is_empty() {
            self.users.push(UserAccount {
                username: SEED_ADMIN_USERNAME.to_string(),
                password_hash: SEED_ADMIN_PASSWORD_HASH.to_string(),
                is_admin: true,
            });
        }
    }
}

/// Validate a document before accepting it.
///
/// # Errors
///
/// Returns `HubError::Config` naming the offending entry.
pub fn validate(settings: &Settings) -> Result<()> {
    for (name, server) in &settings.mcp_servers {
        if name.trim().is_empty() {
            return Err(HubError::Config(
                "mcpServers keys must be non-empty".to_string(),
            ));
        }
        if let TransportConfig::Openapi { openapi } = &server.transport {
            openapi
                .validate()
                .map_err(|e| HubError::Config(format!("mcpServers.{name}: {e}")))?;
        }
        if let TransportConfig::Stdio { command, .. } = &server.transport
            && command.trim().is_empty()
        {
            return Err(HubError::Config(format!(
                "mcpServers.{name}: stdio servers require a non-empty 'command'"
            )));
        }
    }

    for (id, group) in &settings.groups {
        if group.id != *id {
            return Err(HubError::Config(format!(
                "groups.{id}: 'id' field does not match its key"
            )));
        }
    }

    let admin_count = settings.users.iter().filter(|u| u.is_admin).count();
    if !settings.users.is_empty() && admin_count == 0 {
        return Err(HubError::Config(
            "users must include at least one admin account".to_string(),
        ));
    }

    Ok(())
}

/// Resolve the settings file path: explicit path, `MCPHUB_SETTING_PATH`
/// (file or directory), current working directory, then the package root.
#[must_use]
pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return normalize_candidate(path);
    }
    if let Ok(env_path) = std::env::var(SETTINGS_PATH_ENV)
        && !env_path.trim().is_empty()
    {
        return normalize_candidate(Path::new(env_path.trim()));
    }

    let cwd_candidate = PathBuf::from(SETTINGS_FILE_NAME);
    if cwd_candidate.exists() {
        return cwd_candidate;
    }

    let package_candidate = Path::new(env!("CARGO_MANIFEST_DIR")).join(SETTINGS_FILE_NAME);
    if package_candidate.exists() {
        return package_candidate;
    }

    cwd_candidate
}

fn normalize_candidate(path: &Path) -> PathBuf {
    if path.is_dir() {
        path.join(SETTINGS_FILE_NAME)
    } else {
        path.to_path_buf()
    }
}

/// Owns the on-disk document, the current expanded snapshot, and the reload
/// broadcast channel.
pub struct SettingsStore {
    path: PathBuf,
    current: parking_lot::RwLock<Arc<Settings>>,
    write_lock: tokio::sync::Mutex<()>,
    tx: broadcast::Sender<Arc<Settings>>,
}

impl SettingsStore {
    /// Open the store: resolve the path and perform the initial load.
    ///
    /// A missing file is not fatal (an empty default document is
    /// synthesised); a parse failure is.
    ///
    /// # Errors
    ///
    /// Returns `HubError::Config` when the file exists but cannot be parsed
    /// or fails validation.
    pub async fn open(explicit: Option<&Path>) -> Result<Self> {
        let path = resolve_path(explicit);
        let settings = Self::read_document(&path, true).await?;
        tracing::info!(
            path = %path.display(),
            servers = settings.mcp_servers.len(),
            groups = settings.groups.len(),
            "loaded settings"
        );
        let (tx, _) = broadcast::channel(16);
        Ok(Self {
            path,
            current: parking_lot::RwLock::new(Arc::new(settings)),
            write_lock: tokio::sync::Mutex::new(()),
            tx,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The current expanded snapshot. Cheap to call; holders keep the
    /// snapshot they started with until they ask again.
    #[must_use]
    pub fn current(&self) -> Arc<Settings> {
        self.current.read().clone()
    }

    /// Re-read the document without env expansion (export / round-trip).
    ///
    /// # Errors
    ///
    /// Same failure modes as the initial load.
    pub async fn load_original(&self) -> Result<Settings> {
        Self::read_document(&self.path, false).await
    }

    /// Validate and atomically persist `document`, then publish the
    /// re-expanded snapshot to subscribers.
    ///
    /// # Errors
    ///
    /// Validation and I/O failures leave the on-disk file unchanged.
    pub async fn save(&self, document: &Settings) -> Result<()> {
        validate(document)?;
        let _guard = self.write_lock.lock().await;

        let serialized = serde_json::to_string_pretty(document)
            .map_err(|e| HubError::Config(format!("failed to serialize settings: {e}")))?;

        let tmp_path = self
            .path
            .with_extension(format!("tmp.{}", std::process::id()));
        tokio::fs::write(&tmp_path, serialized.as_bytes())
            .await
            .map_err(|e| HubError::Config(format!("failed to write settings: {e}")))?;
        if let Err(e) = tokio::fs::rename(&tmp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(HubError::Config(format!("failed to persist settings: {e}")));
        }

        // Publish the expanded view; raw text on disk keeps the references.
        let expanded = Self::expand_document(document.clone())?;
        let snapshot = Arc::new(expanded);
        *self.current.write() = snapshot.clone();
        let _ = self.tx.send(snapshot);
        Ok(())
    }

    /// Subscribe to reload events. Each event carries the new expanded
    /// snapshot.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Settings>> {
        self.tx.subscribe()
    }

    async fn read_document(path: &Path, expand: bool) -> Result<Settings> {
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let mut settings = Settings::default();
                settings.ensure_seed_admin();
                return Ok(settings);
            }
            Err(e) => {
                return Err(HubError::Config(format!(
                    "failed to read {}: {e}",
                    path.display()
                )));
            }
        };

        let value: serde_json::Value = serde_json::from_str(&raw).map_err(|e| {
            HubError::Config(format!("failed to parse {}: {e}", path.display()))
        })?;
        let value = if expand {
            mcphub_env::expand_json(value)
        } else {
            value
        };
        let mut settings: Settings = serde_json::from_value(value).map_err(|e| {
            HubError::Config(format!("invalid settings in {}: {e}", path.display()))
        })?;
        validate(&settings)?;
        settings.ensure_seed_admin();
        Ok(settings)
    }

    fn expand_document(document: Settings) -> Result<Settings> {
        let value = serde_json::to_value(document)
            .map_err(|e| HubError::Config(format!("failed to expand settings: {e}")))?;
        serde_json::from_value(mcphub_env::expand_json(value))
            .map_err(|e| HubError::Config(format!("failed to expand settings: {e}")))
    }
}
