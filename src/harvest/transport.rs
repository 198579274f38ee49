//! Remote fetch transport
//!
//! This module handles the request side of a harvest, including:
//! - The `Transport` trait the scheduler fetches through
//! - Building the HTTP client from the transport configuration
//! - Expanding the URL template from a seed row
//! - Classifying failures into `FetchError`

use crate::config::TransportConfig;
use crate::seed::SeedRow;
use crate::{ConfigError, HarvestError};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// A failed fetch for a single record
///
/// Always recoverable from the scheduler's point of view: it counts against the
/// record's and the run's failure budgets, nothing more.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("HTTP status {status}")]
    Status { status: u16 },

    #[error("Request timeout")]
    Timeout,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("{0}")]
    Other(String),
}

/// Fetches the remote payload for one seed row
///
/// Implemented for plain synchronous closures
/// `Fn(&SeedRow) -> Result<Value, FetchError>` as well.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch(&self, seed: &SeedRow) -> Result<Value, FetchError>;
}

#[async_trait]
impl<F> Transport for F
where
    F: Fn(&SeedRow) -> Result<Value, FetchError> + Send + Sync,
{
    async fn fetch(&self, seed: &SeedRow) -> Result<Value, FetchError> {
        self(seed)
    }
}

/// HTTP transport driven by a URL template
///
/// The payload handed to the scheduler is
/// `{"status": <code>, "body": <JSON body, or the raw text if it is not JSON>}`.
pub struct HttpTransport {
    client: Client,
    url_template: String,
    method: Method,
    back_off_statuses: Vec<u16>,
}

impl HttpTransport {
    /// Builds a transport from the configuration
    pub fn new(config: &TransportConfig) -> Result<Self, HarvestError> {
        let method = match config.method.to_ascii_uppercase().as_str() {
            "GET" => Method::GET,
            "POST" => Method::POST,
            other => {
                return Err(ConfigError::Validation(format!(
                    "method must be GET or POST, got '{}'",
                    other
                ))
                .into())
            }
        };

        Ok(Self {
            client: build_http_client(config)?,
            url_template: config.url_template.clone(),
            method,
            back_off_statuses: config.back_off_statuses.clone(),
        })
    }

    /// Expands the URL template with the row's percent-encoded field values
    pub fn request_url(&self, seed: &SeedRow) -> Result<Url, FetchError> {
        let mut expanded = self.url_template.clone();
        for (name, value) in &seed.fields {
            let placeholder = format!("{{{}}}", name);
            if expanded.contains(&placeholder) {
                expanded = expanded.replace(&placeholder, &encode_component(value));
            }
        }

        if expanded.contains('{') {
            return Err(FetchError::InvalidRequest(format!(
                "unresolved placeholder in '{}'",
                expanded
            )));
        }

        Url::parse(&expanded).map_err(|e| FetchError::InvalidRequest(e.to_string()))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, seed: &SeedRow) -> Result<Value, FetchError> {
        let url = self.request_url(seed)?;
        tracing::debug!("{} {}", self.method, url);

        let request = if self.method == Method::POST {
            self.client.post(url).json(&request_body(seed))
        } else {
            self.client.get(url)
        };

        let response = request.send().await.map_err(classify_error)?;
        let status = response.status();

        if !status.is_success() && !self.back_off_statuses.contains(&status.as_u16()) {
            return Err(FetchError::Status {
                status: status.as_u16(),
            });
        }

        let text = response.text().await.map_err(classify_error)?;
        let body = match serde_json::from_str::<Value>(&text) {
            Ok(body) => body,
            Err(_) => Value::String(text),
        };

        Ok(json!({ "status": status.as_u16(), "body": body }))
    }
}

/// Builds an HTTP client with the configured user agent, timeout and headers
pub fn build_http_client(config: &TransportConfig) -> Result<Client, HarvestError> {
    let mut headers = HeaderMap::new();
    for (name, value) in &config.headers {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
            ConfigError::Validation(format!("Invalid header name '{}': {}", name, e))
        })?;
        let value = HeaderValue::from_str(value).map_err(|e| {
            ConfigError::Validation(format!(
                "Invalid header value for '{}': {}",
                name.as_str(),
                e
            ))
        })?;
        headers.insert(name, value);
    }

    let client = Client::builder()
        .user_agent(config.user_agent.clone())
        .default_headers(headers)
        .timeout(Duration::from_secs(config.timeout_secs))
        .connect_timeout(Duration::from_secs(10))
        .gzip(true)
        .brotli(true)
        .build()?;

    Ok(client)
}

/// JSON body sent with POST requests
fn request_body(seed: &SeedRow) -> Value {
    json!({
        "id": seed.id,
        "fields": seed.fields,
        "extra": seed.extra,
    })
}

/// Percent-encodes a value so it is safe in both path and query positions
fn encode_component(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

fn classify_error(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout
    } else if e.is_connect() {
        FetchError::Network(format!("Connection failed: {}", e))
    } else if let Some(status) = e.status() {
        FetchError::Status {
            status: status.as_u16(),
        }
    } else {
        FetchError::Other(e.to_string())
    }
}
