//! HTTP request capability.

use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::context::StepContext;
use crate::error::StepError;
use crate::registry::Capability;

/// HTTP method.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
#[allow(clippy::upper_case_acronyms)] // HTTP methods are conventionally uppercase
pub enum HttpMethod {
    #[default]
    GET,
    POST,
    PUT,
    PATCH,
    DELETE,
    HEAD,
}

impl From<HttpMethod> for Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::GET => Method::GET,
            HttpMethod::POST => Method::POST,
            HttpMethod::PUT => Method::PUT,
            HttpMethod::PATCH => Method::PATCH,
            HttpMethod::DELETE => Method::DELETE,
            HttpMethod::HEAD => Method::HEAD,
        }
    }
}

/// Parameters accepted by the `http` capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpParams {
    /// URL to request.
    pub url: String,

    /// HTTP method (default: GET).
    #[serde(default)]
    pub method: HttpMethod,

    /// Request headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Query parameters.
    #[serde(default)]
    pub params: HashMap<String, String>,

    /// JSON body.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json: Option<serde_json::Value>,
}

/// Calls a third-party HTTP API from a workflow step.
///
/// Non-2xx responses become [`StepError::Http`] so the retry layer can tell
/// a 503 (retry) from a 404 (give up).
pub struct HttpCapability {
    client: reqwest::Client,
}

impl HttpCapability {
    /// Create a new HTTP capability.
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        Self { client }
    }

    /// Create an HTTP capability with a custom client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn request(&self, params: HttpParams, ctx: &StepContext) -> Result<serde_json::Value, StepError> {
        let start = std::time::Instant::now();
        let method: Method = params.method.into();
        let mut request = self.client.request(method, &params.url);

        if !params.params.is_empty() {
            request = request.query(&params.params);
        }
        for (key, value) in &params.headers {
            request = request.header(key.as_str(), value.as_str());
        }
        if let Some(ref json) = params.json {
            request = request.json(json);
        }
        if let Some(ms) = ctx.timeout_ms {
            request = request.timeout(Duration::from_millis(ms));
        }

        let response = request.send().await?;
        let status_code = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();

        if !(200..300).contains(&status_code) {
            return Err(StepError::Http {
                status: Some(status_code),
                message: text.chars().take(512).collect(),
            });
        }

        let body: serde_json::Value =
            serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text));

        Ok(serde_json::json!({
            "statusCode": status_code,
            "body": body,
            "durationMs": start.elapsed().as_millis() as u64,
        }))
    }
}

impl Default for HttpCapability {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Capability for HttpCapability {
    fn name(&self) -> &str {
        "http"
    }

    async fn execute(
        &self,
        params: &serde_json::Value,
        ctx: &StepContext,
    ) -> Result<serde_json::Value, StepError> {
        let http_params: HttpParams = serde_json::from_value(params.clone())
            .map_err(|e| StepError::InvalidParameters(format!("Invalid http parameters: {}", e)))?;

        tracing::debug!(
            execution_id = %ctx.execution_id,
            url = %http_params.url,
            method = ?http_params.method,
            "Executing HTTP request"
        );

        self.request(http_params, ctx).await
    }
}
