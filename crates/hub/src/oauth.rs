//! OAuth coordination for upstream servers.
//!
//! Covers static tokens, dynamic client registration (RFC 7591), the
//! authorization-code flow with PKCE (RFC 7636), and refresh-token grants.
//! All mutations are persisted through the settings store so that a pending
//! authorization survives a process restart; the callback recovers the
//! target server either from the stored state or from the state parameter
//! itself (stored state wins).

use crate::error::{HubError, Result};
use crate::settings::{
    OAuthConfig, PendingAuthorization, Settings, SettingsStore, TransportConfig,
};
use base64::Engine as _;
use rand::RngCore as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Pending authorizations older than this are expired and garbage-collected
/// on the next OAuth operation.
pub const PENDING_AUTHORIZATION_TTL_SECS: i64 = 30 * 60;

/// Clock skew tolerance when comparing a token `exp` claim.
const TOKEN_EXP_SKEW_SECS: i64 = 60;

#[derive(Debug, Clone, Deserialize)]
pub struct OAuthMetadata {
    pub authorization_endpoint: Option<String>,
    pub token_endpoint: Option<String>,
    #[serde(default)]
    pub registration_endpoint: Option<String>,
    #[serde(default)]
    pub issuer: Option<String>,
    #[serde(default)]
    pub scopes_supported: Option<Vec<String>>,
    #[serde(default)]
    pub authorization_servers: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorBody {
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RegistrationResponse {
    client_id: String,
    #[serde(default)]
    client_secret: Option<String>,
}

/// The state parameter carried through the authorization redirect:
/// URL-safe base64 of `{"server":<name>,"nonce":<random>}` so callbacks can
/// recover the target server even across process restarts.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct CallbackState {
    pub server: String,
    pub nonce: String,
}

#[must_use]
pub fn encode_state(server: &str) -> String {
    let state = CallbackState {
        server: server.to_string(),
        nonce: random_urlsafe(12),
    };
    let json = serde_json::to_vec(&state).unwrap_or_default();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(json)
}

#[must_use]
pub fn decode_state(state: &str) -> Option<CallbackState> {
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(state.as_bytes())
        .ok()?;
    serde_json::from_slice(&bytes).ok()
}

#[must_use]
pub fn random_urlsafe(bytes_len: usize) -> String {
    let mut bytes = vec![0_u8; bytes_len];
    rand::rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

#[must_use]
pub fn pkce_s256_challenge(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest)
}

/// Whether a token should be treated as expired. Only JWT-shaped tokens get
/// a proactive check (payload `exp` claim, no signature verification);
/// opaque tokens are assumed valid until an upstream rejects them.
#[must_use]
pub fn token_expired(token: &str, now_epoch_s: i64) -> bool {
    let mut parts = token.split('.');
    let (Some(_header), Some(payload), Some(_sig), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    let Ok(bytes) = base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(payload.as_bytes())
    else {
        return false;
    };
    let Ok(claims) = serde_json::from_slice::<serde_json::Value>(&bytes) else {
        return false;
    };
    match claims.get("exp").and_then(serde_json::Value::as_i64) {
        Some(exp) => exp <= now_epoch_s.saturating_add(TOKEN_EXP_SKEW_SECS),
        None => false,
    }
}

/// Outcome of a token request for an upstream.
#[derive(Debug, Clone)]
pub enum TokenOutcome {
    /// A usable access token.
    Token(String),
    /// The server stays in `oauth_required` until the callback arrives; the
    /// URL is what a human must visit.
    Pending { authorization_url: String },
    /// The server has no OAuth configuration at all.
    Unconfigured,
}

pub struct OAuthCoordinator {
    store: Arc<SettingsStore>,
    http: reqwest::Client,
    redirect_uri: String,
    /// Serialises OAuth mutations per server name.
    locks: parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    resumed_tx: broadcast::Sender<String>,
}

impl OAuthCoordinator {
    #[must_use]
    pub fn new(store: Arc<SettingsStore>, http: reqwest::Client, redirect_uri: String) -> Self {
        let (resumed_tx, _) = broadcast::channel(16);
        Self {
            store,
            http,
            redirect_uri,
            locks: parking_lot::Mutex::new(HashMap::new()),
            resumed_tx,
        }
    }

    /// Server names whose tokens were refreshed or exchanged; the registry
    /// resumes `oauth_required` clients on this signal.
    #[must_use]
    pub fn subscribe_resumed(&self) -> broadcast::Receiver<String> {
        self.resumed_tx.subscribe()
    }

    fn lock_for(&self, server: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(server.to_string())
            .or_default()
            .clone()
    }

    /// Produce an access token for `server`, driving whichever flow its
    /// configuration allows. Returns `Pending` when a human authorization
    /// step is required.
    ///
    /// # Errors
    ///
    /// Fails when the server is unknown or a network step fails without a
    /// fallback flow.
    pub async fn access_token(&self, server: &str) -> Result<TokenOutcome> {
        let lock = self.lock_for(server);
        let _guard = lock.lock().await;

        let settings = self.store.current();
        let Some(config) = settings.mcp_servers.get(server) else {
            return Err(HubError::NotFound(format!("Server '{server}' not found")));
        };
        let Some(oauth) = config.oauth.clone() else {
            return Ok(TokenOutcome::Unconfigured);
        };

        self.gc_expired_pending(server, &oauth).await?;

        let now = chrono::Utc::now().timestamp();
        if let Some(token) = &oauth.access_token
            && !token.is_empty()
            && !token_expired(token, now)
        {
            return Ok(TokenOutcome::Token(token.clone()));
        }

        if let Some(refresh) = oauth.refresh_token.clone()
            && !refresh.is_empty()
        {
            match self.refresh_grant(server, &oauth, &refresh).await {
                Ok(token) => return Ok(TokenOutcome::Token(token)),
                Err(e) => {
                    tracing::warn!(server = %server, error = %e, "token refresh failed");
                }
            }
        }

        self.prepare_authorization(server).await
    }

    /// Invoked when an upstream answered 401 mid-session: drop the cached
    /// access token and retry the acquisition flow.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Self::access_token`].
    pub async fn handle_unauthorized(&self, server: &str) -> Result<TokenOutcome> {
        {
            let lock = self.lock_for(server);
            let _guard = lock.lock().await;
            self.mutate_oauth(server, |oauth| {
                oauth.access_token = None;
            })
            .await?;
        }
        self.access_token(server).await
    }

    /// Handle the authorization redirect: locate the pending flow whose
    /// state matches, exchange the code, persist tokens, and resume the
    /// upstream. Returns the server name.
    ///
    /// # Errors
    ///
    /// Fails on unknown/expired state or a rejected token grant.
    pub async fn handle_callback(&self, state: &str, code: &str) -> Result<String> {
        let settings = self.store.current();
        let server = find_server_for_state(&settings, state).ok_or_else(|| {
            HubError::NotFound("no pending authorization matches this state".to_string())
        })?;

        let lock = self.lock_for(&server);
        let _guard = lock.lock().await;

        // Re-read under the lock; the pending record may have been replaced.
        let settings = self.store.current();
        let oauth = settings
            .mcp_servers
            .get(&server)
            .and_then(|s| s.oauth.clone())
            .ok_or_else(|| HubError::NotFound(format!("Server '{server}' not found")))?;
        let pending = oauth
            .pending_authorization
            .clone()
            .filter(|p| p.state == state)
            .ok_or_else(|| {
                HubError::InvalidParams("authorization state does not match".to_string())
            })?;
        if pending_expired(&pending, chrono::Utc::now()) {
            self.mutate_oauth(&server, |o| o.pending_authorization = None)
                .await?;
            return Err(HubError::InvalidParams(
                "pending authorization has expired".to_string(),
            ));
        }

        let token_endpoint = oauth.token_endpoint.clone().ok_or_else(|| {
            HubError::Config(format!("server '{server}' has no token endpoint"))
        })?;

        let mut form: Vec<(&str, &str)> = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.redirect_uri.as_str()),
            ("code_verifier", pending.code_verifier.as_str()),
        ];
        if let Some(client_id) = oauth.client_id.as_deref().filter(|v| !v.is_empty()) {
            form.push(("client_id", client_id));
        }
        if let Some(secret) = oauth.client_secret.as_deref().filter(|v| !v.is_empty()) {
            form.push(("client_secret", secret));
        }

        let response = self
            .http
            .post(&token_endpoint)
            .form(&form)
            .send()
            .await
            .map_err(|e| HubError::Internal(format!("token exchange failed: {e}")))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(HubError::Internal(format!(
                "token exchange failed ({status}): {body}"
            )));
        }
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| HubError::Internal(format!("invalid token response: {e}")))?;

        self.mutate_oauth(&server, |o| {
            o.access_token = Some(token.access_token.clone());
            if token.refresh_token.is_some() {
                o.refresh_token = token.refresh_token.clone();
            }
            o.pending_authorization = None;
        })
        .await?;

        tracing::info!(server = %server, "authorization completed");
        let _ = self.resumed_tx.send(server.clone());
        Ok(server)
    }

    async fn refresh_grant(
        &self,
        server: &str,
        oauth: &OAuthConfig,
        refresh_token: &str,
    ) -> Result<String> {
        let token_endpoint = oauth.token_endpoint.clone().ok_or_else(|| {
            HubError::Config(format!("server '{server}' has no token endpoint"))
        })?;

        let mut form: Vec<(&str, &str)> = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];
        if let Some(client_id) = oauth.client_id.as_deref().filter(|v| !v.is_empty()) {
            form.push(("client_id", client_id));
        }
        if let Some(secret) = oauth.client_secret.as_deref().filter(|v| !v.is_empty()) {
            form.push(("client_secret", secret));
        }

        let response = self
            .http
            .post(&token_endpoint)
            .form(&form)
            .send()
            .await
            .map_err(|e| HubError::Internal(format!("refresh request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            // Refresh failure: clear the access token so the client lands in
            // oauth_required. The refresh token is only dropped when the
            // server said it is gone for good.
            let invalid_grant = serde_json::from_str::<TokenErrorBody>(&body)
                .ok()
                .and_then(|b| b.error)
                .is_some_and(|e| e == "invalid_grant");
            self.mutate_oauth(server, |o| {
                o.access_token = None;
                if invalid_grant {
                    o.refresh_token = None;
                }
            })
            .await?;
            return Err(HubError::Internal(format!(
                "refresh grant rejected ({status})"
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| HubError::Internal(format!("invalid refresh response: {e}")))?;
        self.mutate_oauth(server, |o| {
            o.access_token = Some(token.access_token.clone());
            if token.refresh_token.is_some() {
                o.refresh_token = token.refresh_token.clone();
            }
        })
        .await?;
        let _ = self.resumed_tx.send(server.to_string());
        Ok(token.access_token)
    }

    async fn prepare_authorization(&self, server: &str) -> Result<TokenOutcome> {
        let mut oauth = self
            .store
            .current()
            .mcp_servers
            .get(server)
            .and_then(|s| s.oauth.clone())
            .unwrap_or_default();

        // Discover endpoints when the config does not pin them.
        if oauth.authorization_endpoint.is_none() || oauth.token_endpoint.is_none() {
            if let Some(metadata) = self.discover_metadata(server, &oauth).await {
                if oauth.authorization_endpoint.is_none() {
                    oauth.authorization_endpoint = metadata.authorization_endpoint.clone();
                }
                if oauth.token_endpoint.is_none() {
                    oauth.token_endpoint = metadata.token_endpoint.clone();
                }
                if let Some(reg) = &mut oauth.dynamic_registration
                    && reg.registration_endpoint.is_none()
                {
                    reg.registration_endpoint = metadata.registration_endpoint.clone();
                }
            }
        }

        // Dynamic client registration (RFC 7591) when enabled and unregistered.
        if oauth.client_id.is_none()
            && let Some(reg) = oauth.dynamic_registration.clone()
            && reg.enabled
        {
            let endpoint = reg.registration_endpoint.clone().ok_or_else(|| {
                HubError::Config(format!(
                    "server '{server}' has dynamic registration enabled but no registration endpoint"
                ))
            })?;
            let registered = self
                .register_client(&endpoint, reg.metadata.as_ref(), reg.initial_access_token.as_deref())
                .await?;
            oauth.client_id = Some(registered.client_id);
            if registered.client_secret.is_some() {
                oauth.client_secret = registered.client_secret;
            }
        }

        let authorization_endpoint = oauth.authorization_endpoint.clone().ok_or_else(|| {
            HubError::Config(format!(
                "server '{server}' requires authorization but no authorization endpoint is known"
            ))
        })?;

        // A new request supersedes and discards any previous pending flow.
        let state = encode_state(server);
        let code_verifier = random_urlsafe(32);
        let challenge = pkce_s256_challenge(&code_verifier);
        let authorization_url = build_authorization_url(AuthorizationUrlParams {
            authorization_endpoint: &authorization_endpoint,
            client_id: oauth.client_id.as_deref(),
            redirect_uri: &self.redirect_uri,
            state: &state,
            code_challenge: &challenge,
            scopes: oauth.scopes.as_deref(),
            resource: oauth.resource.as_deref(),
        })?;

        let pending = PendingAuthorization {
            authorization_url: authorization_url.clone(),
            state,
            code_verifier,
            created_at: chrono::Utc::now(),
        };
        let endpoint_updates = (
            oauth.authorization_endpoint.clone(),
            oauth.token_endpoint.clone(),
            oauth.client_id.clone(),
            oauth.client_secret.clone(),
        );
        self.mutate_oauth(server, move |o| {
            o.authorization_endpoint = endpoint_updates.0;
            o.token_endpoint = endpoint_updates.1;
            o.client_id = endpoint_updates.2;
            o.client_secret = endpoint_updates.3;
            o.pending_authorization = Some(pending);
        })
        .await?;

        tracing::info!(server = %server, "authorization pending; visit the authorization URL");
        Ok(TokenOutcome::Pending { authorization_url })
    }

    async fn register_client(
        &self,
        endpoint: &str,
        metadata: Option<&serde_json::Value>,
        initial_access_token: Option<&str>,
    ) -> Result<RegistrationResponse> {
        let payload = metadata.cloned().unwrap_or_else(|| {
            serde_json::json!({
                "client_name": "mcphub",
                "redirect_uris": [self.redirect_uri],
                "grant_types": ["authorization_code", "refresh_token"],
                "response_types": ["code"],
                "token_endpoint_auth_method": "none",
            })
        });

        let mut request = self.http.post(endpoint).json(&payload);
        if let Some(token) = initial_access_token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }
        let response = request
            .send()
            .await
            .map_err(|e| HubError::Internal(format!("client registration failed: {e}")))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(HubError::Internal(format!(
                "client registration failed ({status}): {body}"
            )));
        }
        response
            .json()
            .await
            .map_err(|e| HubError::Internal(format!("invalid registration response: {e}")))
    }

    /// Probe well-known metadata locations, following protected-resource
    /// indirection to the named authorization servers.
    async fn discover_metadata(&self, server: &str, oauth: &OAuthConfig) -> Option<OAuthMetadata> {
        let issuer = oauth
            .dynamic_registration
            .as_ref()
            .and_then(|r| r.issuer.clone())
            .or_else(|| oauth.resource.clone())
            .or_else(|| self.server_base_url(server));
        let origin = origin_of(issuer.as_deref()?)?;

        let candidates = [
            format!("{origin}/.well-known/oauth-authorization-server"),
            format!("{origin}/.well-known/openid-configuration"),
            format!("{origin}/.well-known/oauth-protected-resource"),
        ];

        for candidate in candidates {
            let Some(metadata) = self.fetch_metadata(&candidate).await else {
                continue;
            };
            if metadata.authorization_endpoint.is_some() || metadata.token_endpoint.is_some() {
                return Some(metadata);
            }
            if let Some(servers) = metadata.authorization_servers.as_ref() {
                for issuer in servers {
                    let issuer = issuer.trim_end_matches('/');
                    let well_known = format!("{issuer}/.well-known/oauth-authorization-server");
                    if let Some(mut delegated) = self.fetch_metadata(&well_known).await {
                        if delegated.issuer.is_none() {
                            delegated.issuer = Some(issuer.to_string());
                        }
                        if delegated.authorization_endpoint.is_some()
                            || delegated.token_endpoint.is_some()
                        {
                            return Some(delegated);
                        }
                    }
                }
            }
        }
        None
    }

    async fn fetch_metadata(&self, url: &str) -> Option<OAuthMetadata> {
        let response = self.http.get(url).send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }
        response.json::<OAuthMetadata>().await.ok()
    }

    fn server_base_url(&self, server: &str) -> Option<String> {
        let settings = self.store.current();
        match &settings.mcp_servers.get(server)?.transport {
            TransportConfig::Sse { url, .. } | TransportConfig::StreamableHttp { url, .. } => {
                Some(url.clone())
            }
            TransportConfig::Stdio { .. } | TransportConfig::Openapi { .. } => None,
        }
    }

    async fn gc_expired_pending(&self, server: &str, oauth: &OAuthConfig) -> Result<()> {
        if let Some(pending) = &oauth.pending_authorization
            && pending_expired(pending, chrono::Utc::now())
        {
            tracing::debug!(server = %server, "discarding expired pending authorization");
            self.mutate_oauth(server, |o| o.pending_authorization = None)
                .await?;
        }
        Ok(())
    }

    /// Apply `mutate` to the server's OAuth block in the on-disk (original)
    /// document and persist. Persistence is authoritative for OAuth state.
    async fn mutate_oauth(
        &self,
        server: &str,
        mutate: impl FnOnce(&mut OAuthConfig),
    ) -> Result<()> {
        let mut document = self.store.load_original().await?;
        let entry = document
            .mcp_servers
            .get_mut(server)
            .ok_or_else(|| HubError::NotFound(format!("Server '{server}' not found")))?;
        mutate(entry.oauth.get_or_insert_with(OAuthConfig::default));
        self.store.save(&document).await
    }
}

fn pending_expired(pending: &PendingAuthorization, now: chrono::DateTime<chrono::Utc>) -> bool {
    now.signed_duration_since(pending.created_at).num_seconds() > PENDING_AUTHORIZATION_TTL_SECS
}

/// Stored state wins over the decoded state parameter.
fn find_server_for_state(settings: &Settings, state: &str) -> Option<String> {
    for (name, server) in &settings.mcp_servers {
        if server
            .oauth
            .as_ref()
            .and_then(|o| o.pending_authorization.as_ref())
            .is_some_and(|p| p.state == state)
        {
            return Some(name.clone());
        }
    }
    decode_state(state)
        .filter(|decoded| settings.mcp_servers.contains_key(&decoded.server))
        .map(|decoded| decoded.server)
}

struct AuthorizationUrlParams<'a> {
    authorization_endpoint: &'a str,
    client_id: Option<&'a str>,
    redirect_uri: &'a str,
    state: &'a str,
    code_challenge: &'a str,
    scopes: Option<&'a [String]>,
    resource: Option<&'a str>,
}

fn build_authorization_url(params: AuthorizationUrlParams<'_>) -> Result<String> {
    let mut url = reqwest::Url::parse(params.authorization_endpoint).map_err(|e| {
        HubError::Config(format!(
            "invalid authorization endpoint '{}': {e}",
            params.authorization_endpoint
        ))
    })?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("response_type", "code");
        if let Some(client_id) = params.client_id.filter(|v| !v.trim().is_empty()) {
            query.append_pair("client_id", client_id);
        }
        query.append_pair("redirect_uri", params.redirect_uri);
        query.append_pair("state", params.state);
        query.append_pair("code_challenge", params.code_challenge);
        query.append_pair("code_challenge_method", "S256");
        if let Some(scopes) = params.scopes.filter(|s| !s.is_empty()) {
            query.append_pair("scope", &scopes.join(" "));
        }
        if let Some(resource) = params.resource.filter(|v| !v.trim().is_empty()) {
            query.append_pair("resource", resource);
        }
    }
    Ok(url.to_string())
}

fn origin_of(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return None;
    }
    Some(parsed.origin().ascii_serialization())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pkce_s256_matches_rfc_example() {
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        assert_eq!(
            pkce_s256_challenge(verifier),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn random_urlsafe_is_urlsafe() {
        let token = random_urlsafe(32);
        assert!(
            token
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
        );
        assert!(!token.contains('='));
    }

    #[test]
    fn state_round_trips_through_base64_json() {
        let state = encode_state("vercel");
        let decoded = decode_state(&state).expect("decode");
        assert_eq!(decoded.server, "vercel");
        assert!(!decoded.nonce.is_empty());
    }

    #[test]
    fn decode_state_rejects_garbage() {
        assert!(decode_state("not-base64-json!!!").is_none());
        let not_json = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode("plain");
        assert!(decode_state(&not_json).is_none());
    }

    #[test]
    fn jwt_exp_is_checked_with_skew() {
        fn jwt_with_exp(exp: i64) -> String {
            let header = base64::engine::general_purpose::URL_SAFE_NO_PAD
                .encode(br#"{"alg":"none"}"#);
            let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD
                .encode(serde_json::json!({ "exp": exp }).to_string());
            format!("{header}.{payload}.sig")
        }

        let now = 1_000_000;
        assert!(token_expired(&jwt_with_exp(now - 10), now));
        // Within the 60s skew window counts as expired.
        assert!(token_expired(&jwt_with_exp(now + 30), now));
        assert!(!token_expired(&jwt_with_exp(now + 3600), now));
    }

    #[test]
    fn opaque_tokens_are_assumed_valid() {
        assert!(!token_expired("opaque-token-value", 1_000_000));
        assert!(!token_expired("two.parts", 1_000_000));
    }

    #[test]
    fn authorization_url_includes_pkce_and_state() {
        let url = build_authorization_url(AuthorizationUrlParams {
            authorization_endpoint: "https://auth.example.com/authorize",
            client_id: Some("hub-client"),
            redirect_uri: "http://localhost:3000/oauth/callback",
            state: "state123",
            code_challenge: "challenge123",
            scopes: Some(&["mcp.read".to_string(), "mcp.write".to_string()]),
            resource: None,
        })
        .expect("authorization url");

        let parsed = reqwest::Url::parse(&url).expect("parse");
        let params: HashMap<String, String> = parsed.query_pairs().into_owned().collect();
        assert_eq!(params.get("response_type").map(String::as_str), Some("code"));
        assert_eq!(params.get("client_id").map(String::as_str), Some("hub-client"));
        assert_eq!(params.get("state").map(String::as_str), Some("state123"));
        assert_eq!(
            params.get("code_challenge").map(String::as_str),
            Some("challenge123")
        );
        assert_eq!(
            params.get("code_challenge_method").map(String::as_str),
            Some("S256")
        );
        assert_eq!(
            params.get("scope").map(String::as_str),
            Some("mcp.read mcp.write")
        );
    }

    #[test]
    fn pending_expiry_uses_thirty_minute_ttl() {
        let now = chrono::Utc::now();
        let fresh = PendingAuthorization {
            authorization_url: "https://auth.example.com".to_string(),
            state: "s".to_string(),
            code_verifier: "v".to_string(),
            created_at: now - chrono::Duration::minutes(29),
        };
        let stale = PendingAuthorization {
            created_at: now - chrono::Duration::minutes(31),
            ..fresh.clone()
        };
        assert!(!pending_expired(&fresh, now));
        assert!(pending_expired(&stale, now));
    }

    #[test]
    fn stored_state_wins_over_decoded_state() {
        use crate::settings::{ServerConfig, ServerOptions};

        let mut settings = Settings::default();
        let pending_state = encode_state("stored");
        for name in ["stored", "decoded"] {
            settings.mcp_servers.insert(
                name.to_string(),
                ServerConfig {
                    transport: TransportConfig::Sse {
                        url: "https://mcp.example.com/sse".to_string(),
                        headers: HashMap::new(),
                    },
                    enabled: true,
                    options: ServerOptions::default(),
                    tools: HashMap::new(),
                    prompts: HashMap::new(),
                    oauth: None,
                },
            );
        }
        let entry = settings.mcp_servers.get_mut("stored").expect("stored");
        entry.oauth = Some(OAuthConfig {
            pending_authorization: Some(PendingAuthorization {
                authorization_url: "u".to_string(),
                state: pending_state.clone(),
                code_verifier: "v".to_string(),
                created_at: chrono::Utc::now(),
            }),
            ..OAuthConfig::default()
        });

        assert_eq!(
            find_server_for_state(&settings, &pending_state).as_deref(),
            Some("stored")
        );

        // No stored match: fall back to decoding the parameter.
        let decoded_state = encode_state("decoded");
        assert_eq!(
            find_server_for_state(&settings, &decoded_state).as_deref(),
            Some("decoded")
        );
    }
}
