//! OpenAPI document to MCP tool synthesis.
//!
//! A configured OpenAPI document (fetched from a URL or embedded in the
//! settings file) is dereferenced and flattened into one tool per operation.
//! Tool names are the operation ids; input schemas are derived from the
//! operation's parameters and request body.

use serde_json::{Map, Value, json};
use std::collections::HashMap;
use thiserror::Error;

pub mod config;

pub use config::{AuthConfig, OpenApiConfig};

const MAX_REF_DEPTH: usize = 16;

#[derive(Debug, Error)]
pub enum OpenApiError {
    #[error("failed to fetch OpenAPI document: {0}")]
    Fetch(String),
    #[error("invalid OpenAPI document: {0}")]
    Document(String),
    #[error("unknown operation: {0}")]
    UnknownOperation(String),
    #[error("request failed: {0}")]
    Request(String),
}

pub type Result<T> = std::result::Result<T, OpenApiError>;

/// A tool synthesised from one OpenAPI operation.
#[derive(Debug, Clone)]
pub struct SynthesizedTool {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Value,
}

/// Result of executing a synthesised tool call.
#[derive(Debug, Clone)]
pub struct CallOutcome {
    pub status: u16,
    pub body: Value,
    pub is_error: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParamLocation {
    Path,
    Query,
    Header,
}

#[derive(Debug, Clone)]
struct ParamSpec {
    name: String,
    location: ParamLocation,
}

#[derive(Debug, Clone)]
struct OperationRoute {
    method: reqwest::Method,
    path: String,
    params: Vec<ParamSpec>,
    /// Argument names that belong to the JSON request body. Empty when the
    /// operation has no body.
    body_keys: Vec<String>,
    /// When true the whole body arrives under a single `body` argument
    /// (non-object request body schema).
    opaque_body: bool,
}

/// An OpenAPI backend: a dereferenced document plus the HTTP client used to
/// execute calls against it.
pub struct OpenApiBackend {
    config: OpenApiConfig,
    http: reqwest::Client,
    base_url: String,
    tools: Vec<SynthesizedTool>,
    routes: HashMap<String, OperationRoute>,
}

impl OpenApiBackend {
    /// Load the document named by `config` and synthesise its tool surface.
    ///
    /// # Errors
    ///
    /// Fails when the document cannot be fetched or does not contain a
    /// usable `paths` object.
    pub async fn load(config: OpenApiConfig, http: reqwest::Client) -> Result<Self> {
        config.validate().map_err(OpenApiError::Document)?;

        let (document, document_url) = match (&config.schema, &config.url) {
            (Some(inline), _) => (inline.clone(), None),
            (None, Some(url)) => {
                let resp = http
                    .get(url)
                    .send()
                    .await
                    .map_err(|e| OpenApiError::Fetch(e.to_string()))?;
                if !resp.status().is_success() {
                    return Err(OpenApiError::Fetch(format!(
                        "{url} returned {}",
                        resp.status()
                    )));
                }
                let doc = resp
                    .json::<Value>()
                    .await
                    .map_err(|e| OpenApiError::Fetch(e.to_string()))?;
                (doc, Some(url.clone()))
            }
            (None, None) => unreachable!("validated above"),
        };

        let base_url = resolve_base_url(&document, document_url.as_deref())?;
        let (tools, routes) = synthesize(&document)?;

        tracing::debug!(
            base_url = %base_url,
            tool_count = tools.len(),
            "loaded OpenAPI tool surface"
        );

        Ok(Self {
            config,
            http,
            base_url,
            tools,
            routes,
        })
    }

    #[must_use]
    pub fn tools(&self) -> &[SynthesizedTool] {
        &self.tools
    }

    /// Execute a synthesised tool call.
    ///
    /// `passthrough` holds the downstream request headers (lowercased names,
    /// multi-value headers already comma-joined); only those named in the
    /// config's `passthroughHeaders` are forwarded.
    ///
    /// # Errors
    ///
    /// Fails on unknown operations or transport-level request failures.
    /// HTTP error statuses are reported inside the `CallOutcome`.
    pub async fn call(
        &self,
        operation: &str,
        arguments: &Map<String, Value>,
        passthrough: &HashMap<String, String>,
    ) -> Result<CallOutcome> {
        let route = self
            .routes
            .get(operation)
            .ok_or_else(|| OpenApiError::UnknownOperation(operation.to_string()))?;

        let mut path = route.path.clone();
        let mut query: Vec<(String, String)> = Vec::new();
        let mut headers = reqwest::header::HeaderMap::new();

        for param in &route.params {
            let Some(value) = arguments.get(&param.name) else {
                continue;
            };
            let rendered = render_param(value);
            match param.location {
                ParamLocation::Path => {
                    path = path.replace(&format!("{{{}}}", param.name), &rendered);
                }
                ParamLocation::Query => query.push((param.name.clone(), rendered)),
                ParamLocation::Header => {
                    if let (Ok(name), Ok(val)) = (
                        reqwest::header::HeaderName::from_bytes(param.name.as_bytes()),
                        reqwest::header::HeaderValue::from_str(&rendered),
                    ) {
                        headers.insert(name, val);
                    }
                }
            }
        }

        let body = self.build_body(route, arguments);

        let mut url = format!("{}{}", self.base_url.trim_end_matches('/'), path);
        apply_query_security(&mut query, self.config.security.as_ref());
        if !query.is_empty() {
            let mut parsed = reqwest::Url::parse(&url)
                .map_err(|e| OpenApiError::Request(format!("invalid url '{url}': {e}")))?;
            parsed.query_pairs_mut().extend_pairs(query.iter());
            url = parsed.to_string();
        }

        apply_header_security(&mut headers, self.config.security.as_ref());
        self.apply_passthrough(&mut headers, passthrough);

        let mut request = self.http.request(route.method.clone(), &url).headers(headers);
        if let Some(timeout) = self.config.timeout {
            request = request.timeout(std::time::Duration::from_secs(timeout));
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| OpenApiError::Request(e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| OpenApiError::Request(e.to_string()))?;
        let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

        Ok(CallOutcome {
            status: status.as_u16(),
            body,
            is_error: !status.is_success(),
        })
    }

    fn build_body(&self, route: &OperationRoute, arguments: &Map<String, Value>) -> Option<Value> {
        if route.opaque_body {
            return arguments.get("body").cloned();
        }
        if route.body_keys.is_empty() {
            return None;
        }
        let mut body = Map::new();
        for key in &route.body_keys {
            if let Some(v) = arguments.get(key) {
                body.insert(key.clone(), v.clone());
            }
        }
        (!body.is_empty()).then_some(Value::Object(body))
    }

    fn apply_passthrough(
        &self,
        headers: &mut reqwest::header::HeaderMap,
        downstream: &HashMap<String, String>,
    ) {
        for allowed in &self.config.passthrough_headers {
            let key = allowed.to_ascii_lowercase();
            let Some(value) = downstream.get(&key) else {
                continue;
            };
            if let (Ok(name), Ok(val)) = (
                reqwest::header::HeaderName::from_bytes(key.as_bytes()),
                reqwest::header::HeaderValue::from_str(value),
            ) {
                headers.insert(name, val);
            }
        }
    }
}

fn apply_header_security(headers: &mut reqwest::header::HeaderMap, auth: Option<&AuthConfig>) {
    use base64::Engine as _;
    use reqwest::header::{AUTHORIZATION, HeaderName, HeaderValue};

    let Some(auth) = auth else { return };
    match auth {
        AuthConfig::None | AuthConfig::Query { .. } => {}
        AuthConfig::Bearer { token } => {
            if let Ok(v) = HeaderValue::from_str(&format!("Bearer {token}")) {
                headers.insert(AUTHORIZATION, v);
            }
        }
        AuthConfig::Header { name, value } => {
            if let (Ok(n), Ok(v)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.insert(n, v);
            }
        }
        AuthConfig::Basic { username, password } => {
            let b64 =
                base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"));
            if let Ok(v) = HeaderValue::from_str(&format!("Basic {b64}")) {
                headers.insert(AUTHORIZATION, v);
            }
        }
    }
}

fn apply_query_security(query: &mut Vec<(String, String)>, auth: Option<&AuthConfig>) {
    if let Some(AuthConfig::Query { name, value }) = auth {
        query.push((name.clone(), value.clone()));
    }
}

/// Render an argument value for use in a path/query/header position.
///
/// Arrays serialise comma-separated (form style); objects fall back to JSON.
fn render_param(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(render_param)
            .collect::<Vec<_>>()
            .join(","),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn resolve_base_url(document: &Value, document_url: Option<&str>) -> Result<String> {
    if let Some(server) = document
        .pointer("/servers/0/url")
        .and_then(Value::as_str)
    {
        if server.starts_with("http://") || server.starts_with("https://") {
            return Ok(server.trim_end_matches('/').to_string());
        }
        // Relative server URL: resolve against the document origin.
        if let Some(doc_url) = document_url
            && let Ok(base) = reqwest::Url::parse(doc_url)
            && let Ok(joined) = base.join(server)
        {
            return Ok(joined.to_string().trim_end_matches('/').to_string());
        }
    }

    if let Some(doc_url) = document_url
        && let Ok(parsed) = reqwest::Url::parse(doc_url)
    {
        let origin = parsed.origin().ascii_serialization();
        return Ok(origin);
    }

    Err(OpenApiError::Document(
        "no usable server URL (document has no absolute 'servers[0].url' and no source URL)"
            .to_string(),
    ))
}

/// Resolve a local `$ref` pointer (`#/components/...`) within the document.
fn deref<'a>(document: &'a Value, mut node: &'a Value) -> &'a Value {
    for _ in 0..MAX_REF_DEPTH {
        let Some(reference) = node.get("$ref").and_then(Value::as_str) else {
            return node;
        };
        let Some(pointer) = reference.strip_prefix('#') else {
            return node;
        };
        match document.pointer(pointer) {
            Some(resolved) => node = resolved,
            None => return node,
        }
    }
    node
}

/// Inline every local `$ref` in a schema fragment.
fn inline_schema(document: &Value, schema: &Value, depth: usize) -> Value {
    if depth > MAX_REF_DEPTH {
        return json!({});
    }
    let resolved = deref(document, schema);
    match resolved {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), inline_schema(document, v, depth + 1)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| inline_schema(document, v, depth + 1))
                .collect(),
        ),
        other => other.clone(),
    }
}

const METHODS: [(&str, reqwest::Method); 5] = [
    ("get", reqwest::Method::GET),
    ("post", reqwest::Method::POST),
    ("put", reqwest::Method::PUT),
    ("patch", reqwest::Method::PATCH),
    ("delete", reqwest::Method::DELETE),
];

fn synthesize(document: &Value) -> Result<(Vec<SynthesizedTool>, HashMap<String, OperationRoute>)> {
    let paths = document
        .get("paths")
        .and_then(Value::as_object)
        .ok_or_else(|| OpenApiError::Document("document has no 'paths' object".to_string()))?;

    let mut tools = Vec::new();
    let mut routes = HashMap::new();

    for (path, item) in paths {
        let item = deref(document, item);
        for (method_name, method) in METHODS {
            let Some(operation) = item.get(method_name) else {
                continue;
            };
            let (tool, route) = synthesize_operation(document, path, method, operation)?;
            routes.insert(tool.name.clone(), route);
            tools.push(tool);
        }
    }

    tools.sort_by(|a, b| a.name.cmp(&b.name));
    Ok((tools, routes))
}

fn synthesize_operation(
    document: &Value,
    path: &str,
    method: reqwest::Method,
    operation: &Value,
) -> Result<(SynthesizedTool, OperationRoute)> {
    let name = operation
        .get("operationId")
        .and_then(Value::as_str)
        .map_or_else(
            || fallback_operation_id(method.as_str(), path),
            str::to_string,
        );

    let description = operation
        .get("summary")
        .or_else(|| operation.get("description"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let mut properties = Map::new();
    let mut required: Vec<Value> = Vec::new();
    let mut params = Vec::new();

    for param in operation
        .get("parameters")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let param = deref(document, param);
        let Some(param_name) = param.get("name").and_then(Value::as_str) else {
            continue;
        };
        let location = match param.get("in").and_then(Value::as_str) {
            Some("path") => ParamLocation::Path,
            Some("query") => ParamLocation::Query,
            Some("header") => ParamLocation::Header,
            _ => continue,
        };

        let mut schema = param
            .get("schema")
            .map_or_else(|| json!({ "type": "string" }), |s| inline_schema(document, s, 0));
        if let (Some(obj), Some(desc)) = (
            schema.as_object_mut(),
            param.get("description").and_then(Value::as_str),
        ) {
            obj.insert("description".to_string(), Value::String(desc.to_string()));
        }

        if param.get("required").and_then(Value::as_bool).unwrap_or(false)
            || location == ParamLocation::Path
        {
            required.push(Value::String(param_name.to_string()));
        }
        properties.insert(param_name.to_string(), schema);
        params.push(ParamSpec {
            name: param_name.to_string(),
            location,
        });
    }

    let mut body_keys = Vec::new();
    let mut opaque_body = false;
    if let Some(body_schema) = operation.pointer("/requestBody/content/application~1json/schema") {
        let body_schema = inline_schema(document, body_schema, 0);
        match body_schema.get("properties").and_then(Value::as_object) {
            Some(props) => {
                for (key, schema) in props {
                    // Operation parameters shadow body properties of the same name.
                    if !properties.contains_key(key) {
                        properties.insert(key.clone(), schema.clone());
                        body_keys.push(key.clone());
                    }
                }
                for req in body_schema
                    .get("required")
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                {
                    if req.as_str().is_some_and(|r| body_keys.iter().any(|k| k == r)) {
                        required.push(req.clone());
                    }
                }
            }
            None => {
                properties.insert("body".to_string(), body_schema);
                body_keys.push("body".to_string());
                opaque_body = true;
            }
        }
    }

    let input_schema = json!({
        "type": "object",
        "properties": properties,
        "required": required,
    });

    Ok((
        SynthesizedTool {
            name: name.clone(),
            description,
            input_schema,
        },
        OperationRoute {
            method,
            path: path.to_string(),
            params,
            body_keys,
            opaque_body,
        },
    ))
}

fn fallback_operation_id(method: &str, path: &str) -> String {
    let sanitized: String = path
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("{}_{}", method.to_ascii_lowercase(), sanitized.trim_matches('_'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn petstore() -> Value {
        json!({
            "openapi": "3.0.0",
            "servers": [{ "url": "https://petstore.example.com/v1" }],
            "paths": {
                "/pets": {
                    "get": {
                        "operationId": "listPets",
                        "summary": "List all pets",
                        "parameters": [
                            { "name": "limit", "in": "query",
                              "schema": { "type": "integer" } }
                        ]
                    },
                    "post": {
                        "operationId": "createPet",
                        "requestBody": {
                            "content": {
                                "application/json": {
                                    "schema": { "$ref": "#/components/schemas/Pet" }
                                }
                            }
                        }
                    }
                },
                "/pets/{petId}": {
                    "get": {
                        "operationId": "getPet",
                        "parameters": [
                            { "name": "petId", "in": "path", "required": true,
                              "schema": { "type": "string" } }
                        ]
                    }
                }
            },
            "components": {
                "schemas": {
                    "Pet": {
                        "type": "object",
                        "required": ["name"],
                        "properties": {
                            "name": { "type": "string" },
                            "tag": { "type": "string" }
                        }
                    }
                }
            }
        })
    }

    #[test]
    fn synthesizes_one_tool_per_operation() {
        let (tools, routes) = synthesize(&petstore()).expect("synthesize");
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["createPet", "getPet", "listPets"]);
        assert_eq!(routes.len(), 3);
    }

    #[test]
    fn path_parameters_are_required() {
        let (tools, _) = synthesize(&petstore()).expect("synthesize");
        let get_pet = tools.iter().find(|t| t.name == "getPet").expect("getPet");
        assert_eq!(
            get_pet.input_schema.pointer("/required/0"),
            Some(&json!("petId"))
        );
        assert_eq!(
            get_pet.input_schema.pointer("/properties/petId/type"),
            Some(&json!("string"))
        );
    }

    #[test]
    fn request_body_refs_are_inlined_into_properties() {
        let (tools, routes) = synthesize(&petstore()).expect("synthesize");
        let create = tools.iter().find(|t| t.name == "createPet").expect("createPet");
        assert_eq!(
            create.input_schema.pointer("/properties/name/type"),
            Some(&json!("string"))
        );
        assert_eq!(
            create.input_schema.pointer("/required/0"),
            Some(&json!("name"))
        );
        let route = routes.get("createPet").expect("route");
        assert!(route.body_keys.contains(&"name".to_string()));
        assert!(!route.opaque_body);
    }

    #[test]
    fn fallback_operation_id_uses_method_and_path() {
        assert_eq!(fallback_operation_id("GET", "/pets/{petId}"), "get_pets__petId");
    }

    #[test]
    fn render_param_serializes_arrays_form_style() {
        assert_eq!(render_param(&json!(["a", "b", "c"])), "a,b,c");
        assert_eq!(render_param(&json!(42)), "42");
        assert_eq!(render_param(&json!("x")), "x");
    }

    #[test]
    fn base_url_prefers_absolute_server_entry() {
        let url = resolve_base_url(&petstore(), None).expect("base url");
        assert_eq!(url, "https://petstore.example.com/v1");
    }
}
