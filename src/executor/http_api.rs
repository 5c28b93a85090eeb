use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use reqwest::{Client, Method};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use url::Url;

use crate::template;

use super::{ErrorType, ExecRequest, ExecutionResult, Executor, ExecutorError, ServerInfo};

const USER_AGENT_VALUE: &str = "remediation-core/0.1";
const RETRYABLE_STATUSES: &[u16] = &[408, 429, 500, 502, 503, 504];

/// Request configuration carried in the step "command" for API steps.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiCommand {
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub query_params: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default = "default_body_type")]
    pub body_type: String,
    #[serde(default = "default_expected_status_codes")]
    pub expected_status_codes: Vec<u16>,
    #[serde(default)]
    pub extract: HashMap<String, String>,
    #[serde(default = "default_follow_redirects")]
    pub follow_redirects: bool,
}

fn default_method() -> String {
    "GET".into()
}

fn default_endpoint() -> String {
    "/".into()
}

fn default_body_type() -> String {
    "json".into()
}

fn default_expected_status_codes() -> Vec<u16> {
    vec![200, 201, 202, 204]
}

fn default_follow_redirects() -> bool {
    true
}

/// HTTP/REST executor: the "command" is a JSON request configuration, the
/// HTTP status stands in for the exit code and the response body for stdout.
pub struct ApiExecutor {
    hostname: String,
    username: String,
    base_url: String,
    auth_type: String,
    auth_header: Option<String>,
    auth_token: Option<String>,
    verify_ssl: bool,
    timeout_seconds: u64,
    default_headers: HashMap<String, String>,
    client: Mutex<Option<Client>>,
}

impl ApiExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        hostname: String,
        port: u16,
        username: String,
        base_url: Option<String>,
        auth_type: String,
        auth_header: Option<String>,
        auth_token: Option<String>,
        verify_ssl: bool,
        timeout_seconds: u64,
        default_headers: HashMap<String, String>,
    ) -> Self {
        let base_url = base_url.unwrap_or_else(|| format!("https://{hostname}:{port}"));
        Self {
            hostname,
            username,
            base_url,
            auth_type,
            auth_header,
            auth_token,
            verify_ssl,
            timeout_seconds,
            default_headers,
            client: Mutex::new(None),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn auth_type(&self) -> &str {
        &self.auth_type
    }

    fn build_client(&self, follow_redirects: bool) -> Result<Client, ExecutorError> {
        let redirect = if follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        };
        Client::builder()
            .timeout(Duration::from_secs(self.timeout_seconds))
            .danger_accept_invalid_certs(!self.verify_ssl)
            .redirect(redirect)
            .build()
            .map_err(|err| ExecutorError::Connection(err.to_string()))
    }

    /// Default headers including the configured authentication scheme.
    fn auth_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));
        for (name, value) in &self.default_headers {
            insert_header(&mut headers, name, value);
        }

        match self.auth_type.as_str() {
            "api_key" | "custom" => {
                if let (Some(name), Some(token)) = (&self.auth_header, &self.auth_token) {
                    insert_header(&mut headers, name, token);
                }
            }
            "bearer" => {
                if let Some(token) = &self.auth_token {
                    insert_header(&mut headers, "Authorization", &format!("Bearer {token}"));
                }
            }
            "basic" => {
                if let Some(token) = &self.auth_token {
                    let credentials = BASE64.encode(format!("{}:{}", self.username, token));
                    insert_header(&mut headers, "Authorization", &format!("Basic {credentials}"));
                }
            }
            _ => {}
        }
        headers
    }

    async fn run_request(
        &self,
        raw_command: &str,
        request: &ExecRequest,
    ) -> Result<ExecutionResult, ExecutionResult> {
        let started = Instant::now();
        let executed_at = Utc::now();

        let mut command: ApiCommand = serde_json::from_str(raw_command).map_err(|err| {
            ExecutionResult::failure(
                raw_command,
                &self.hostname,
                ErrorType::Command,
                format!("Invalid API command JSON: {err}"),
                false,
                0,
            )
        })?;

        // Best-effort templating against the caller-provided variables;
        // failures leave the original string in place.
        if !request.env.is_empty() {
            let context = env_context(&request.env);
            command.endpoint = render_lenient(&command.endpoint, &context);
            if let Some(body) = command.body.take() {
                command.body = Some(render_lenient(&body, &context));
            }
            command.query_params = command
                .query_params
                .into_iter()
                .map(|(key, value)| (key, render_lenient(&value, &context)))
                .collect();
            command.headers = command
                .headers
                .into_iter()
                .map(|(key, value)| (key, render_lenient(&value, &context)))
                .collect();
        }

        let url = build_url(&self.base_url, &command.endpoint, &command.query_params).map_err(
            |err| {
                ExecutionResult::failure(
                    raw_command,
                    &self.hostname,
                    ErrorType::Command,
                    format!("Invalid request URL: {err}"),
                    false,
                    elapsed_ms(started),
                )
            },
        )?;

        let method = Method::from_bytes(command.method.to_uppercase().as_bytes()).map_err(|_| {
            ExecutionResult::failure(
                raw_command,
                &self.hostname,
                ErrorType::Command,
                format!("Unsupported HTTP method: {}", command.method),
                false,
                elapsed_ms(started),
            )
        })?;

        let client = {
            let mut guard = self.client.lock().await;
            if guard.is_none() {
                *guard = Some(self.build_client(command.follow_redirects).map_err(|err| {
                    ExecutionResult::failure(
                        raw_command,
                        &self.hostname,
                        ErrorType::Connection,
                        err.to_string(),
                        true,
                        elapsed_ms(started),
                    )
                })?);
            }
            guard.clone().unwrap_or_else(Client::new)
        };

        let mut headers = self.auth_headers();
        for (name, value) in &command.headers {
            insert_header(&mut headers, name, value);
        }

        let effective_timeout = request.timeout_seconds.unwrap_or(self.timeout_seconds);
        let mut builder = client
            .request(method, url)
            .headers(headers)
            .timeout(Duration::from_secs(effective_timeout));
        builder = apply_body(builder, command.body.as_deref(), &command.body_type);

        let response = builder.send().await.map_err(|err| {
            let (error_type, retryable) = classify_transport_error(&err);
            ExecutionResult::failure(
                raw_command,
                &self.hostname,
                error_type,
                err.to_string(),
                retryable,
                elapsed_ms(started),
            )
        })?;

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let duration_ms = elapsed_ms(started);

        let success = command.expected_status_codes.contains(&status);
        let mut extracted = HashMap::new();
        if !command.extract.is_empty() && !body.is_empty() {
            extracted = extract_values(&body, &command.extract);
        }

        let error_type = if success {
            None
        } else if status == 401 || status == 403 {
            Some(ErrorType::Auth)
        } else {
            Some(ErrorType::Command)
        };

        Ok(ExecutionResult {
            success,
            exit_code: i32::from(status),
            stdout: body,
            stderr: if success {
                String::new()
            } else {
                format!("HTTP {status}")
            },
            duration_ms,
            command: raw_command.to_string(),
            server_hostname: self.hostname.clone(),
            executed_at,
            error_type,
            error_message: if success {
                None
            } else {
                Some(format!("Unexpected status code: {status}"))
            },
            retryable: !success && RETRYABLE_STATUSES.contains(&status),
            extracted,
        })
    }
}

#[async_trait]
impl Executor for ApiExecutor {
    fn protocol(&self) -> &'static str {
        "api"
    }

    fn hostname(&self) -> &str {
        &self.hostname
    }

    fn supports_elevation(&self) -> bool {
        false
    }

    async fn connect(&self) -> Result<(), ExecutorError> {
        let mut guard = self.client.lock().await;
        if guard.is_none() {
            *guard = Some(self.build_client(true)?);
        }
        Ok(())
    }

    async fn disconnect(&self) {
        self.client.lock().await.take();
    }

    async fn is_connected(&self) -> bool {
        self.client.lock().await.is_some()
    }

    async fn execute(&self, command: &str, request: &ExecRequest) -> ExecutionResult {
        match self.run_request(command, request).await {
            Ok(result) => result,
            Err(failure) => failure,
        }
    }

    /// Probe a handful of conventional health paths; any non-5xx answer
    /// counts as reachable.
    async fn test_connection(&self) -> bool {
        if self.connect().await.is_err() {
            return false;
        }
        let client = match self.client.lock().await.clone() {
            Some(client) => client,
            None => return false,
        };
        for path in ["/health", "/status", "/ping", "/api/health", "/"] {
            let url = match build_url(&self.base_url, path, &HashMap::new()) {
                Ok(url) => url,
                Err(_) => continue,
            };
            match client
                .get(url)
                .headers(self.auth_headers())
                .timeout(Duration::from_secs(5))
                .send()
                .await
            {
                Ok(response) if response.status().as_u16() < 500 => return true,
                Ok(_) => continue,
                Err(err) => {
                    debug!(?err, path, "api probe failed");
                    continue;
                }
            }
        }
        false
    }

    async fn server_info(&self) -> ServerInfo {
        ServerInfo::bare(&self.hostname, "api")
    }
}

fn env_context(env: &HashMap<String, String>) -> Value {
    Value::Object(
        env.iter()
            .map(|(key, value)| (key.clone(), Value::String(value.clone())))
            .collect(),
    )
}

fn render_lenient(input: &str, context: &Value) -> String {
    match template::render(input, context) {
        Ok(rendered) => rendered,
        Err(err) => {
            warn!(?err, "api template rendering failed; using raw value");
            input.to_string()
        }
    }
}

fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) {
    match (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
    ) {
        (Ok(name), Ok(value)) => {
            headers.insert(name, value);
        }
        _ => warn!(%name, "skipping invalid header"),
    }
}

fn apply_body(
    builder: reqwest::RequestBuilder,
    body: Option<&str>,
    body_type: &str,
) -> reqwest::RequestBuilder {
    let Some(body) = body else {
        return builder;
    };
    match body_type {
        "json" => match serde_json::from_str::<Value>(body) {
            Ok(json) => builder.json(&json),
            Err(_) => builder.body(body.to_string()),
        },
        "form" => {
            let pairs: Vec<(String, String)> = body
                .split('&')
                .filter_map(|item| {
                    item.split_once('=')
                        .map(|(key, value)| (key.to_string(), value.to_string()))
                })
                .collect();
            if pairs.is_empty() {
                builder.body(body.to_string())
            } else {
                builder.form(&pairs)
            }
        }
        _ => builder.body(body.to_string()),
    }
}

pub fn build_url(
    base_url: &str,
    endpoint: &str,
    query_params: &HashMap<String, String>,
) -> Result<Url, url::ParseError> {
    let mut url = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        Url::parse(endpoint)?
    } else {
        let base = Url::parse(base_url)?;
        base.join(endpoint)?
    };
    if !query_params.is_empty() {
        let mut pairs: Vec<(&String, &String)> = query_params.iter().collect();
        pairs.sort();
        for (key, value) in pairs {
            url.query_pairs_mut().append_pair(key, value);
        }
    }
    Ok(url)
}

fn classify_transport_error(err: &reqwest::Error) -> (ErrorType, bool) {
    if err.is_timeout() {
        (ErrorType::Timeout, true)
    } else if err.is_connect() {
        (ErrorType::Connection, true)
    } else {
        (ErrorType::Unknown, false)
    }
}

fn elapsed_ms(started: Instant) -> i64 {
    started.elapsed().as_millis() as i64
}

/// Extract values from a response body. Patterns starting with `$.` walk a
/// simplified JSONPath (dot-separated keys and numeric list indices);
/// anything else is a regex whose first capture group (or whole match) wins.
pub fn extract_values(body: &str, patterns: &HashMap<String, String>) -> HashMap<String, String> {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let mut extracted = HashMap::new();

    for (key, pattern) in patterns {
        if let Some(path) = pattern.strip_prefix("$.") {
            if let Some(json) = parsed.as_ref() {
                if let Some(value) = walk_jsonpath(json, path) {
                    extracted.insert(key.clone(), json_scalar_to_string(value));
                }
            }
            continue;
        }
        match Regex::new(pattern) {
            Ok(regex) => {
                if let Some(captures) = regex.captures(body) {
                    let value = captures
                        .get(1)
                        .or_else(|| captures.get(0))
                        .map(|capture| capture.as_str().to_string());
                    if let Some(value) = value {
                        extracted.insert(key.clone(), value);
                    }
                }
            }
            Err(err) => warn!(?err, %pattern, "invalid extract pattern"),
        }
    }
    extracted
}

fn walk_jsonpath<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
        if current.is_null() {
            return None;
        }
    }
    Some(current)
}

fn json_scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn jsonpath_walks_keys_and_indices() {
        let body = json!({"job": {"id": 42, "hosts": ["a", "b"]}}).to_string();
        let mut patterns = HashMap::new();
        patterns.insert("job_id".to_string(), "$.job.id".to_string());
        patterns.insert("second".to_string(), "$.job.hosts.1".to_string());
        patterns.insert("missing".to_string(), "$.job.nope".to_string());

        let extracted = extract_values(&body, &patterns);
        assert_eq!(extracted.get("job_id").map(String::as_str), Some("42"));
        assert_eq!(extracted.get("second").map(String::as_str), Some("b"));
        assert!(!extracted.contains_key("missing"));
    }

    #[test]
    fn regex_extraction_prefers_first_group() {
        let mut patterns = HashMap::new();
        patterns.insert("version".to_string(), r"version=(\d+\.\d+)".to_string());
        patterns.insert("whole".to_string(), r"build-\d+".to_string());

        let extracted = extract_values("version=2.4 build-17", &patterns);
        assert_eq!(extracted.get("version").map(String::as_str), Some("2.4"));
        assert_eq!(extracted.get("whole").map(String::as_str), Some("build-17"));
    }

    #[test]
    fn url_building_joins_and_appends_queries() {
        let mut params = HashMap::new();
        params.insert("verbose".to_string(), "true".to_string());

        let url = build_url("https://awx.local/api/", "v2/jobs/", &params).unwrap();
        assert_eq!(url.as_str(), "https://awx.local/api/v2/jobs/?verbose=true");

        let absolute = build_url("https://awx.local", "https://other.local/x", &HashMap::new())
            .unwrap();
        assert_eq!(absolute.as_str(), "https://other.local/x");
    }

    #[test]
    fn command_defaults_are_applied() {
        let command: ApiCommand = serde_json::from_str(r#"{"endpoint": "/api/restart"}"#).unwrap();
        assert_eq!(command.method, "GET");
        assert_eq!(command.expected_status_codes, vec![200, 201, 202, 204]);
        assert!(command.follow_redirects);
        assert_eq!(command.body_type, "json");
    }
}
