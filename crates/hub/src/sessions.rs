//! Downstream sessions: routing scopes, bearer auth, and the session table.

use crate::error::{HubError, Result};
use crate::settings::{RoutingConfig, Settings};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rmcp::model::{ClientJsonRpcMessage, ServerJsonRpcMessage};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq as _;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Idle sessions are reaped after this long without traffic.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(600);

/// Keepalive cadence on streaming responses; each frame resets the idle
/// clock on the client side.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Scope segment that selects smart routing.
pub const SMART_SEGMENT: &str = "$smart";

/// One inbound message queued for a session's dispatch worker: the header
/// snapshot taken at ingress plus the parsed message.
pub type IncomingWork = (HashMap<String, String>, ClientJsonRpcMessage);

/// The routing intent carried by a downstream session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingScope {
    Global,
    Group { id: String },
    Server { name: String },
    SmartGlobal,
    SmartGroup { id: String },
}

impl RoutingScope {
    #[must_use]
    pub fn is_smart(&self) -> bool {
        matches!(self, Self::SmartGlobal | Self::SmartGroup { .. })
    }

    /// The servers this scope may reach. `None` means every server.
    #[must_use]
    pub fn allowed_servers(&self, settings: &Settings) -> Option<HashSet<String>> {
        match self {
            Self::Global | Self::SmartGlobal => None,
            Self::Server { name } => Some([name.clone()].into_iter().collect()),
            Self::Group { id } | Self::SmartGroup { id } => {
                let members = settings
                    .groups
                    .get(id)
                    .map(|g| {
                        g.members
                            .iter()
                            .map(|m| m.server_name().to_string())
                            .collect()
                    })
                    .unwrap_or_default();
                Some(members)
            }
        }
    }

    /// Whether notifications originating from `server` reach this scope.
    #[must_use]
    pub fn includes_server(&self, settings: &Settings, server: &str) -> bool {
        match self.allowed_servers(settings) {
            None => true,
            Some(allowed) => allowed.contains(server),
        }
    }
}

/// Why a scope could not be resolved; maps onto the HTTP status of the
/// session-open request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeError {
    /// Global route is disabled and no scope segment was given.
    GlobalRouteDisabled,
    /// The segment names neither a group nor a server.
    UnknownScope(String),
    /// `$smart/<group>` names an unknown group.
    UnknownGroup(String),
}

impl ScopeError {
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::GlobalRouteDisabled => "global route is disabled".to_string(),
            Self::UnknownScope(id) => format!("unknown group or server '{id}'"),
            Self::UnknownGroup(id) => format!("unknown group '{id}'"),
        }
    }
}

/// Resolve URL path segments into a routing scope.
///
/// `segment` is the first component after `/sse` or `/mcp`; `sub` the
/// second (only meaningful under `$smart`). When an identifier names both a
/// group and a server, the group wins.
pub fn resolve_scope(
    settings: &Settings,
    routing: &RoutingConfig,
    segment: Option<&str>,
    sub: Option<&str>,
) -> std::result::Result<RoutingScope, ScopeError> {
    let Some(segment) = segment.filter(|s| !s.is_empty()) else {
        if routing.enable_global_route {
            return Ok(RoutingScope::Global);
        }
        return Err(ScopeError::GlobalRouteDisabled);
    };

    if segment == SMART_SEGMENT {
        return match sub.filter(|s| !s.is_empty()) {
            None => Ok(RoutingScope::SmartGlobal),
            Some(id) => {
                if settings.groups.contains_key(id) {
                    Ok(RoutingScope::SmartGroup { id: id.to_string() })
                } else {
                    Err(ScopeError::UnknownGroup(id.to_string()))
                }
            }
        };
    }

    if settings.groups.contains_key(segment) {
        return Ok(RoutingScope::Group {
            id: segment.to_string(),
        });
    }
    if routing.enable_group_name_route
        && let Some(group) = settings.groups.values().find(|g| g.name == segment)
    {
        return Ok(RoutingScope::Group {
            id: group.id.clone(),
        });
    }
    if settings.mcp_servers.contains_key(segment) {
        return Ok(RoutingScope::Server {
            name: segment.to_string(),
        });
    }
    Err(ScopeError::UnknownScope(segment.to_string()))
}

/// Bearer-token comparison, constant-time over the token bytes.
#[must_use]
pub fn check_bearer(expected: &str, authorization: Option<&str>) -> bool {
    let Some(got) = authorization.and_then(|h| h.strip_prefix("Bearer ")) else {
        return false;
    };
    let got = got.trim();
    got.len() == expected.len() && bool::from(got.as_bytes().ct_eq(expected.as_bytes()))
}

/// Downstream auth outcome for a session-open or message request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    Unauthorized,
}

/// Enforce the routing auth model: `skipAuth` short-circuits, bearer auth
/// compares against the configured key, and user-scoped mounts require a
/// recognised user. Without bearer auth the outer (out-of-scope) JWT layer
/// is trusted to have gated the request.
pub fn authorize(
    settings: &Settings,
    routing: &RoutingConfig,
    authorization: Option<&str>,
    user: Option<&str>,
) -> std::result::Result<(), AuthError> {
    if routing.skip_auth {
        return Ok(());
    }
    if routing.enable_bearer_auth {
        if check_bearer(&routing.bearer_auth_key, authorization) {
            return Ok(());
        }
        return Err(AuthError::Unauthorized);
    }
    if let Some(user) = user {
        if settings.users.iter().any(|u| u.username == user) {
            return Ok(());
        }
        return Err(AuthError::Unauthorized);
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Sse,
    StreamableHttp,
}

/// Per in-flight JSON-RPC call context, threaded through the dispatch path.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub session_id: Uuid,
    /// Downstream request headers: lowercased names, multi-value headers
    /// comma-joined.
    pub headers: HashMap<String, String>,
    pub user: Option<String>,
    pub scope: RoutingScope,
    pub cancellation: CancellationToken,
    /// Token attached to upstream requests so progress notifications can be
    /// routed back to the owning session.
    pub progress_token: Option<String>,
}

impl RequestContext {
    #[must_use]
    pub fn for_session(session: &DownstreamSession, headers: HashMap<String, String>) -> Self {
        Self {
            session_id: session.id,
            headers,
            user: session.user.clone(),
            scope: session.scope.clone(),
            cancellation: session.cancellation.child_token(),
            progress_token: None,
        }
    }
}

/// One downstream transport session.
pub struct DownstreamSession {
    pub id: Uuid,
    pub kind: SessionKind,
    pub scope: RoutingScope,
    pub user: Option<String>,
    pub created_at: DateTime<Utc>,
    pub cancellation: CancellationToken,
    outbound: mpsc::Sender<ServerJsonRpcMessage>,
    /// Receiver side of the push stream; taken exactly once by the
    /// transport that serves it (SSE open, or the streamable-HTTP GET).
    inbox: parking_lot::Mutex<Option<mpsc::Receiver<ServerJsonRpcMessage>>>,
    /// Ingress queue feeding the per-session dispatch worker; requests from
    /// one session reach upstreams in arrival order.
    work_tx: parking_lot::Mutex<Option<mpsc::UnboundedSender<IncomingWork>>>,
    last_activity: RwLock<Instant>,
}

impl DownstreamSession {
    pub fn touch(&self) {
        *self.last_activity.write() = Instant::now();
    }

    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_activity.read().elapsed()
    }

    /// Queue a message for the session's server-push stream. Errors mean
    /// the stream is gone; the reaper will collect the session.
    pub async fn push(&self, message: ServerJsonRpcMessage) -> bool {
        self.outbound.send(message).await.is_ok()
    }

    #[must_use]
    pub fn try_push(&self, message: ServerJsonRpcMessage) -> bool {
        self.outbound.try_send(message).is_ok()
    }

    /// Take the push-stream receiver. Returns `None` when a stream is
    /// already (or was previously) attached.
    #[must_use]
    pub fn take_stream(&self) -> Option<mpsc::Receiver<ServerJsonRpcMessage>> {
        self.inbox.lock().take()
    }

    /// Attach the dispatch worker queue; at most one worker per session.
    #[must_use]
    pub fn attach_worker(&self) -> Option<mpsc::UnboundedReceiver<IncomingWork>> {
        let mut slot = self.work_tx.lock();
        if slot.is_some() {
            return None;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *slot = Some(tx);
        Some(rx)
    }

    /// Queue an inbound message for the session worker. Returns false when
    /// no worker is attached (streamable sessions dispatch inline).
    #[must_use]
    pub fn enqueue(&self, headers: HashMap<String, String>, message: ClientJsonRpcMessage) -> bool {
        match self.work_tx.lock().as_ref() {
            Some(tx) => tx.send((headers, message)).is_ok(),
            None => false,
        }
    }
}

/// Owns every downstream session. Transports are never closed while the
/// table lock is held.
pub struct SessionManager {
    sessions: RwLock<HashMap<Uuid, Arc<DownstreamSession>>>,
    shutdown: CancellationToken,
}

impl SessionManager {
    #[must_use]
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            shutdown,
        }
    }

    /// Mint a session. Ids are unique across the process lifetime; a
    /// collision would be a fatal internal error.
    ///
    /// # Errors
    ///
    /// `HubError::Internal` on id collision.
    pub fn create(
        &self,
        kind: SessionKind,
        scope: RoutingScope,
        user: Option<String>,
    ) -> Result<Arc<DownstreamSession>> {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(64);
        let session = Arc::new(DownstreamSession {
            id,
            kind,
            scope,
            user,
            created_at: Utc::now(),
            cancellation: self.shutdown.child_token(),
            outbound: tx,
            inbox: parking_lot::Mutex::new(Some(rx)),
            work_tx: parking_lot::Mutex::new(None),
            last_activity: RwLock::new(Instant::now()),
        });

        let mut sessions = self.sessions.write();
        if sessions.contains_key(&id) {
            return Err(HubError::Internal(format!("session id collision: {id}")));
        }
        sessions.insert(id, session.clone());
        drop(sessions);

        tracing::debug!(session_id = %id, kind = ?kind, "session opened");
        Ok(session)
    }

    #[must_use]
    pub fn get(&self, id: &Uuid) -> Option<Arc<DownstreamSession>> {
        self.sessions.read().get(id).cloned()
    }

    /// Remove a session and cancel everything scoped to it.
    pub fn remove(&self, id: &Uuid) {
        let session = self.sessions.write().remove(id);
        if let Some(session) = session {
            session.cancellation.cancel();
            tracing::debug!(session_id = %id, "session closed");
        }
    }

    #[must_use]
    pub fn list(&self) -> Vec<Arc<DownstreamSession>> {
        self.sessions.read().values().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Periodically drop sessions idle past [`IDLE_TIMEOUT`].
    pub fn spawn_idle_reaper(self: &Arc<Self>) {
        let manager = self.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let expired: Vec<Uuid> = manager
                    .sessions
                    .read()
                    .values()
                    .filter(|s| s.idle_for() >= IDLE_TIMEOUT)
                    .map(|s| s.id)
                    .collect();
                for id in expired {
                    tracing::info!(session_id = %id, "session idle timeout");
                    manager.remove(&id);
                }
            }
        });
    }
}

/// Flatten an axum header map into the per-request snapshot: lowercased
/// names, array-valued headers comma-joined.
#[must_use]
pub fn header_snapshot(headers: &axum::http::HeaderMap) -> HashMap<String, String> {
    let mut out: HashMap<String, String> = HashMap::new();
    for (name, value) in headers {
        let Ok(value) = value.to_str() else { continue };
        let key = name.as_str().to_ascii_lowercase();
        match out.get_mut(&key) {
            Some(existing) => {
                existing.push_str(", ");
                existing.push_str(value);
            }
            None => {
                out.insert(key, value.to_string());
            }
        }
    }
    out
}
