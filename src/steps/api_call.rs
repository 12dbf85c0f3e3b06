//! API call step - make HTTP requests with auth, retries and extraction.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine as _;
use reqwest::{Client, Method, RequestBuilder};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use super::template::{resolve_template, resolve_value};
use super::types::{ConfigValidation, Step, StepBase, StepExecutionContext, StepResult};
use crate::error::{Error, Result};
use crate::substitution::{resolve_path, stringify};

const CONNECT_TIMEOUT_SECS: u64 = 10;
const KNOWN_METHODS: [&str; 7] = ["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

/// HTTP request step.
pub struct ApiCallStep {
    base: StepBase,
    client: Client,
}

impl ApiCallStep {
    pub fn new(base: StepBase) -> Self {
        let client = Client::builder()
            .user_agent(base.settings.http.user_agent.clone())
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|e| {
                warn!("Failed to build HTTP client with defaults: {}", e);
                Client::new()
            });
        Self { base, client }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiCallConfig {
    url: String,

    #[serde(default = "default_method")]
    method: String,

    #[serde(default)]
    headers: Map<String, Value>,

    /// Query string parameters
    #[serde(default)]
    params: Map<String, Value>,

    /// JSON-encoded unless already a string
    #[serde(default)]
    body: Option<Value>,

    #[serde(default)]
    auth: Option<Auth>,

    /// Request timeout in milliseconds
    #[serde(default)]
    timeout: Option<u64>,

    #[serde(default)]
    expected_status: Option<StatusList>,

    #[serde(default)]
    response_type: ResponseType,

    /// Output name -> dotted path into the JSON body
    #[serde(default)]
    extract: BTreeMap<String, String>,

    #[serde(default)]
    retry: RetrySettings,
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum Auth {
    Bearer {
        token: String,
    },
    Basic {
        username: String,
        #[serde(default)]
        password: Option<String>,
    },
    ApiKey {
        key: String,
        #[serde(default = "default_api_key_header")]
        header: String,
    },
}

fn default_api_key_header() -> String {
    "X-API-Key".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum StatusList {
    One(u16),
    Many(Vec<u16>),
}

impl StatusList {
    fn contains(&self, status: u16) -> bool {
        match self {
            StatusList::One(code) => *code == status,
            StatusList::Many(codes) => codes.contains(&status),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum ResponseType {
    #[default]
    Json,
    Text,
    /// Raw bytes, base64-encoded in the output
    Buffer,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RetrySettings {
    #[serde(default)]
    max_retries: u32,

    /// Fixed delay between attempts in milliseconds
    #[serde(default = "default_retry_delay")]
    delay: u64,

    /// Statuses that trigger another attempt
    #[serde(default)]
    retry_on_status: Vec<u16>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 0,
            delay: default_retry_delay(),
            retry_on_status: Vec::new(),
        }
    }
}

fn default_retry_delay() -> u64 {
    1000
}

/// A request with every template resolved.
struct PreparedRequest {
    method: Method,
    url: String,
    headers: Vec<(String, String)>,
    params: Vec<(String, String)>,
    body: Option<Value>,
    auth: Option<Auth>,
    timeout: Duration,
}

/// Reject anything that is not an absolute http(s) URL.
fn validate_url(url: &str) -> Result<()> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| Error::StepConfig(format!("Invalid URL '{}': {}", url, e)))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        scheme => Err(Error::StepConfig(format!(
            "Unsupported URL scheme '{}'. Only http and https are allowed.",
            scheme
        ))),
    }
}

fn apply_auth(request: RequestBuilder, auth: &Auth) -> RequestBuilder {
    match auth {
        Auth::Bearer { token } => request.bearer_auth(token),
        Auth::Basic { username, password } => request.basic_auth(username, password.as_ref()),
        Auth::ApiKey { key, header } => request.header(header.as_str(), key.as_str()),
    }
}

fn resolve_auth(auth: &Auth, ctx: &StepExecutionContext) -> Auth {
    match auth {
        Auth::Bearer { token } => Auth::Bearer {
            token: resolve_template(token, ctx),
        },
        Auth::Basic { username, password } => Auth::Basic {
            username: resolve_template(username, ctx),
            password: password.as_ref().map(|p| resolve_template(p, ctx)),
        },
        Auth::ApiKey { key, header } => Auth::ApiKey {
            key: resolve_template(key, ctx),
            header: resolve_template(header, ctx),
        },
    }
}

fn is_expected(expected: Option<&StatusList>, status: u16) -> bool {
    match expected {
        Some(list) => list.contains(status),
        None => (200..300).contains(&status),
    }
}

/// Parsed response body plus a flag for a failed JSON parse.
fn parse_body(bytes: &[u8], response_type: ResponseType) -> (Value, bool) {
    match response_type {
        ResponseType::Buffer => (
            Value::String(base64::engine::general_purpose::STANDARD.encode(bytes)),
            false,
        ),
        ResponseType::Text => (
            Value::String(String::from_utf8_lossy(bytes).into_owned()),
            false,
        ),
        ResponseType::Json if bytes.is_empty() => (Value::Null, false),
        ResponseType::Json => match serde_json::from_slice(bytes) {
            Ok(body) => (body, false),
            Err(_) => (
                Value::String(String::from_utf8_lossy(bytes).into_owned()),
                true,
            ),
        },
    }
}

enum Attempt {
    Done {
        status: u16,
        status_text: String,
        headers: Map<String, Value>,
        bytes: Vec<u8>,
    },
    Unexpected {
        status: u16,
        body: String,
    },
    Failed(Error),
}

impl ApiCallStep {
    fn prepare(
        &self,
        config: &ApiCallConfig,
        ctx: &StepExecutionContext,
    ) -> Result<PreparedRequest> {
        let url = resolve_template(&config.url, ctx);
        validate_url(&url)?;

        let method = Method::from_bytes(config.method.to_uppercase().as_bytes())
            .map_err(|_| Error::StepConfig(format!("Unknown HTTP method: {}", config.method)))?;

        let headers = config
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), stringify(&resolve_value(v, ctx))))
            .collect();
        let params = config
            .params
            .iter()
            .map(|(k, v)| (k.clone(), stringify(&resolve_value(v, ctx))))
            .collect();

        let timeout_ms = config
            .timeout
            .unwrap_or(self.base.settings.http.timeout_ms);

        Ok(PreparedRequest {
            method,
            url,
            headers,
            params,
            body: config.body.as_ref().map(|b| resolve_value(b, ctx)),
            auth: config.auth.as_ref().map(|a| resolve_auth(a, ctx)),
            timeout: Duration::from_millis(timeout_ms),
        })
    }

    fn build(&self, prepared: &PreparedRequest) -> RequestBuilder {
        let mut request = self
            .client
            .request(prepared.method.clone(), &prepared.url)
            .timeout(prepared.timeout);

        if !prepared.params.is_empty() {
            request = request.query(&prepared.params);
        }
        for (name, value) in &prepared.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(auth) = &prepared.auth {
            request = apply_auth(request, auth);
        }
        match &prepared.body {
            Some(Value::String(text)) => request = request.body(text.clone()),
            Some(body) => request = request.json(body),
            None => {}
        }
        request
    }

    async fn attempt(&self, prepared: &PreparedRequest, expected: Option<&StatusList>) -> Attempt {
        let response = match self.build(prepared).send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                return Attempt::Failed(Error::Timeout(format!(
                    "Request to {} timed out after {}ms",
                    prepared.url,
                    prepared.timeout.as_millis()
                )))
            }
            Err(e) => return Attempt::Failed(Error::Http(e)),
        };

        let status = response.status();
        let mut headers = Map::new();
        for (name, value) in response.headers() {
            headers.insert(
                name.to_string(),
                Value::String(value.to_str().unwrap_or("").to_string()),
            );
        }

        let bytes = match response.bytes().await {
            Ok(bytes) => bytes.to_vec(),
            Err(e) if e.is_timeout() => {
                return Attempt::Failed(Error::Timeout(format!(
                    "Reading response from {} timed out",
                    prepared.url
                )))
            }
            Err(e) => return Attempt::Failed(Error::Http(e)),
        };

        if !is_expected(expected, status.as_u16()) {
            let body: String = String::from_utf8_lossy(&bytes).chars().take(500).collect();
            return Attempt::Unexpected {
                status: status.as_u16(),
                body,
            };
        }

        Attempt::Done {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or("").to_string(),
            headers,
            bytes,
        }
    }
}

#[async_trait]
impl Step for ApiCallStep {
    fn base(&self) -> &StepBase {
        &self.base
    }

    fn step_type(&self) -> &str {
        "apiCall"
    }

    fn description(&self) -> &str {
        "Make an HTTP request"
    }

    fn validate_config(&self) -> ConfigValidation {
        let mut result = ConfigValidation::ok();

        match self.base.get("url") {
            None => result.error("url is required"),
            Some(Value::String(url)) if !url.contains("${") => {
                if let Err(e) = validate_url(url) {
                    result.error(e.to_string());
                }
            }
            Some(Value::String(_)) => {}
            Some(_) => result.error("url must be a string"),
        }

        if let Some(method) = self.base.get("method") {
            let known = method
                .as_str()
                .is_some_and(|m| KNOWN_METHODS.contains(&m.to_uppercase().as_str()));
            if !known {
                result.error(format!("method must be one of: {}", KNOWN_METHODS.join(", ")));
            }
        }

        if let Some(auth) = self.base.get("auth") {
            if let Err(e) = serde_json::from_value::<Auth>(auth.clone()) {
                result.error(format!("auth is invalid (bearer, basic or apiKey): {}", e));
            }
        }

        if let Some(expected) = self.base.get("expectedStatus") {
            match serde_json::from_value::<StatusList>(expected.clone()) {
                Ok(StatusList::One(code)) if !(100..=599).contains(&code) => {
                    result.error(format!("expectedStatus {} is not an HTTP status", code));
                }
                Ok(StatusList::Many(codes)) if codes.iter().any(|c| !(100..=599).contains(c)) => {
                    result.error("expectedStatus contains a value that is not an HTTP status");
                }
                Ok(_) => {}
                Err(_) => result.error("expectedStatus must be a status code or a list of codes"),
            }
        }

        if let Some(response_type) = self.base.get("responseType") {
            if serde_json::from_value::<ResponseType>(response_type.clone()).is_err() {
                result.error("responseType must be one of: json, text, buffer");
            }
        }

        if let Some(timeout) = self.base.get("timeout") {
            if !timeout.as_u64().is_some_and(|t| t > 0) {
                result.error("timeout must be a positive number of milliseconds");
            }
        }

        if let Some(retry) = self.base.get("retry") {
            match serde_json::from_value::<RetrySettings>(retry.clone()) {
                Ok(retry) if retry.max_retries > 10 => {
                    result.warn(format!(
                        "retry.maxRetries of {} is unusually high",
                        retry.max_retries
                    ));
                }
                Ok(_) => {}
                Err(e) => result.error(format!("retry is invalid: {}", e)),
            }
        }

        result
    }

    async fn execute_step(&self, ctx: &mut StepExecutionContext) -> Result<StepResult> {
        let config: ApiCallConfig = self.base.parse_config("apiCall")?;
        let prepared = self.prepare(&config, ctx)?;
        let max_attempts = config.retry.max_retries.saturating_add(1);

        debug!(
            step_id = %self.base.id,
            method = %prepared.method,
            url = %prepared.url,
            "HTTP request"
        );

        let start = Instant::now();
        let mut attempts = 0;
        let mut last_error = String::new();
        let mut last_status: Option<u16> = None;

        while attempts < max_attempts {
            attempts += 1;

            let retryable = match self.attempt(&prepared, config.expected_status.as_ref()).await {
                Attempt::Done {
                    status,
                    status_text,
                    headers,
                    bytes,
                } => {
                    let (body, parse_failed) = parse_body(&bytes, config.response_type);
                    if parse_failed {
                        warn!(step_id = %self.base.id, "Response body is not JSON; returning text");
                    }

                    let mut extracted = Map::new();
                    for (name, path) in &config.extract {
                        let path = path.strip_prefix("body.").unwrap_or(path);
                        let segments: Vec<&str> = path.split('.').collect();
                        let value = resolve_path(&body, &segments).cloned().unwrap_or(Value::Null);
                        extracted.insert(name.clone(), value);
                    }

                    info!(
                        "HTTP {} {} -> {} ({}ms, attempt {})",
                        prepared.method,
                        prepared.url,
                        status,
                        start.elapsed().as_millis(),
                        attempts
                    );

                    let mut outputs = Map::new();
                    for (name, value) in &extracted {
                        outputs.insert(name.clone(), value.clone());
                    }
                    outputs.insert("status".into(), json!(status));
                    outputs.insert("statusText".into(), json!(status_text));
                    outputs.insert("headers".into(), Value::Object(headers));
                    outputs.insert("body".into(), body);
                    outputs.insert("extracted".into(), Value::Object(extracted));
                    outputs.insert("parseError".into(), json!(parse_failed));

                    return Ok(StepResult::success(outputs).with_metadata_map(json!({
                        "attempts": attempts,
                        "responseSize": bytes.len(),
                        "elapsed": start.elapsed().as_millis() as u64,
                        "method": prepared.method.as_str(),
                        "url": prepared.url,
                    })));
                }
                Attempt::Unexpected { status, body } => {
                    last_status = Some(status);
                    last_error = format!("Unexpected HTTP status {}: {}", status, body);
                    config.retry.retry_on_status.contains(&status)
                }
                Attempt::Failed(e) => {
                    let transient = e.is_transient();
                    last_error = e.to_string();
                    transient
                }
            };

            if !retryable || attempts >= max_attempts {
                break;
            }
            warn!(
                step_id = %self.base.id,
                attempt = attempts,
                max_attempts,
                "HTTP attempt failed, retrying in {}ms: {}",
                config.retry.delay,
                last_error
            );
            tokio::time::sleep(Duration::from_millis(config.retry.delay)).await;
        }

        let mut result = StepResult::failure(last_error).with_metadata_map(json!({
            "attempts": attempts,
            "elapsed": start.elapsed().as_millis() as u64,
            "method": prepared.method.as_str(),
            "url": prepared.url,
        }));
        if let Some(status) = last_status {
            result = result.with_metadata("status", status);
        }
        Ok(result)
    }
}
