use serde::{Deserialize, Serialize};

/// Authentication configuration for outbound HTTP calls.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthConfig {
    /// No authentication.
    None,
    /// Bearer token authentication.
    Bearer { token: String },
    /// Custom header authentication.
    Header { name: String, value: String },
    /// Basic authentication.
    Basic { username: String, password: String },
    /// Query parameter authentication.
    Query { name: String, value: String },
}

/// `OpenAPI` tool source configuration.
///
/// Exactly one of `url` / `schema` must be present: a document is either
/// fetched from the network or embedded inline in the settings file.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OpenApiConfig {
    /// URL of the OpenAPI document (JSON).
    #[serde(default)]
    pub url: Option<String>,
    /// Inline OpenAPI document.
    #[serde(default)]
    pub schema: Option<serde_json::Value>,
    /// Declared OpenAPI version; informational only.
    #[serde(default)]
    pub version: Option<String>,
    /// Security applied to every synthesised call.
    #[serde(default)]
    pub security: Option<AuthConfig>,
    /// Downstream request headers forwarded to the API, matched
    /// case-insensitively by name.
    #[serde(default)]
    pub passthrough_headers: Vec<String>,
    /// Request timeout in seconds (supports `${ENV}` references).
    #[serde(
        default,
        deserialize_with = "mcphub_env::serde_helpers::deserialize_option_u64_env"
    )]
    pub timeout: Option<u64>,
}

impl OpenApiConfig {
    /// Validate that the config names a document source.
    ///
    /// # Errors
    ///
    /// Returns a message when both `url` and `schema` are absent.
    pub fn validate(&self) -> Result<(), String> {
        if self.url.is_none() && self.schema.is_none() {
            return Err("openapi config requires either 'url' or 'schema'".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn auth_config_is_type_tagged() {
        let auth: AuthConfig =
            serde_json::from_value(json!({ "type": "bearer", "token": "t1" })).expect("bearer");
        assert!(matches!(auth, AuthConfig::Bearer { token } if token == "t1"));

        let auth: AuthConfig =
            serde_json::from_value(json!({ "type": "query", "name": "api_key", "value": "v" }))
                .expect("query");
        assert!(matches!(auth, AuthConfig::Query { .. }));
    }

    #[test]
    fn config_requires_url_or_schema() {
        let cfg = OpenApiConfig::default();
        assert!(cfg.validate().is_err());

        let cfg: OpenApiConfig =
            serde_json::from_value(json!({ "url": "https://api.example.com/openapi.json" }))
                .expect("config");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn timeout_supports_env_expansion() {
        const VAR: &str = "MCPHUB_OPENAPI_TEST_TIMEOUT";
        // SAFETY: unique env var name, removed before the test returns.
        unsafe {
            std::env::set_var(VAR, "42");
        }
        let cfg: OpenApiConfig = serde_json::from_value(json!({
            "url": "https://api.example.com/openapi.json",
            "timeout": format!("${{{VAR}}}"),
        }))
        .expect("config with env timeout");
        assert_eq!(cfg.timeout, Some(42));
        // SAFETY: clean up the process environment.
        unsafe {
            std::env::remove_var(VAR);
        }
    }
}
